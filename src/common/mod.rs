mod gateway;
pub mod hostname;
pub mod label_selector;
mod references;
mod resource_key;

pub use gateway::{active_gateways, default_route_kinds, effective_gateway_class, is_active_gateway, tls_mode, valid_listeners};
use k8s_openapi::{
    api::core::v1::Service,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    chrono::Utc,
};
pub use references::{
    is_ref_to_gateway, is_target_ref_to_known_kind, is_valid_backend_ref_to_service, is_valid_ref_to_ca, is_valid_ref_to_secret,
    valid_cross_namespace_ref, ReferenceFrom, ReferenceTo,
};
pub use resource_key::{create_id, object_key, ResourceKey, RouteRefKey, ServicePortName, DEFAULT_ROUTE_HOSTNAME};

pub const ACCEPTED: &str = "Accepted";
pub const ACTIVE: &str = "Active";
pub const PROGRAMMED: &str = "Programmed";
pub const RESOLVED_REFS: &str = "ResolvedRefs";
pub const CONFLICTED: &str = "Conflicted";
pub const PARTIALLY_INVALID: &str = "PartiallyInvalid";

pub fn condition_status<'a>(conditions: Option<&'a [Condition]>, condition_type: &str) -> Option<&'a str> {
    conditions?.iter().find(|condition| condition.type_ == condition_type).map(|condition| condition.status.as_str())
}

pub fn is_condition_true(conditions: Option<&[Condition]>, condition_type: &str) -> bool {
    condition_status(conditions, condition_type) == Some("True")
}

pub fn new_condition(condition_type: &str, status: bool, reason: &str, message: &str, observed_generation: Option<i64>) -> Condition {
    Condition {
        type_: condition_type.to_owned(),
        status: if status { "True" } else { "False" }.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Headless Services without a selector have their endpoints managed by hand through `Endpoints`.
pub fn is_headless_without_selector(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .is_some_and(|spec| spec.cluster_ip.as_deref() == Some("None") && spec.selector.as_ref().is_none_or(std::collections::BTreeMap::is_empty))
}

/// Conditions compared on type, status, reason and message. Timestamps and generations are ignored.
pub fn same_conditions(left: &[Condition], right: &[Condition]) -> bool {
    let key = |c: &Condition| (c.type_.clone(), c.status.clone(), c.reason.clone(), c.message.clone());
    let mut left: Vec<_> = left.iter().map(key).collect();
    let mut right: Vec<_> = right.iter().map(key).collect();
    left.sort();
    right.sort();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_conditions_ignores_time_and_order() {
        let a = vec![new_condition(ACCEPTED, true, "Accepted", "", Some(1)), new_condition(RESOLVED_REFS, true, "ResolvedRefs", "", Some(1))];
        let mut b = vec![new_condition(RESOLVED_REFS, true, "ResolvedRefs", "", Some(2)), new_condition(ACCEPTED, true, "Accepted", "", Some(2))];
        b[0].last_transition_time = Time(Utc::now() + k8s_openapi::chrono::Duration::seconds(60));
        assert!(same_conditions(&a, &b));
        b[1].status = "False".to_owned();
        assert!(!same_conditions(&a, &b));
    }
}
