pub mod gateway;
pub mod policies;
pub mod routes;
pub mod service_import;

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
pub const FLOMESH_MCS_API_GROUP: &str = "flomesh.io";
pub const FLOMESH_GATEWAY_API_GROUP: &str = "gateway.flomesh.io";
pub const CORE_API_GROUP: &str = "";

pub const GATEWAY_KIND: &str = "Gateway";
pub const HTTP_ROUTE_KIND: &str = "HTTPRoute";
pub const GRPC_ROUTE_KIND: &str = "GRPCRoute";
pub const TLS_ROUTE_KIND: &str = "TLSRoute";
pub const TCP_ROUTE_KIND: &str = "TCPRoute";
pub const UDP_ROUTE_KIND: &str = "UDPRoute";
pub const SERVICE_KIND: &str = "Service";
pub const SERVICE_IMPORT_KIND: &str = "ServiceImport";
pub const SECRET_KIND: &str = "Secret";
pub const CONFIG_MAP_KIND: &str = "ConfigMap";
