pub mod publisher;
pub mod repo;
pub mod scheduler;
pub mod status;

pub use publisher::Publisher;
pub use repo::{PipyRepoClient, Repo};
pub use scheduler::{RebuildContext, Scheduler};
pub use status::{GatewayPatcherService, Patcher, RoutePatcherService, StatusChannels, StatusShaper};
