pub mod acquire;
pub mod events;
pub mod genconfig;
pub mod logs;
pub mod registry;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod validate;

pub use acquire::BinaryAcquirer;
pub use events::{EventBus, ManagerEvent};
pub use genconfig::InboundProfile;
pub use logs::LogAggregator;
pub use registry::ProxyRegistry;
pub use settings::ManagerSettings;
pub use supervisor::{EngineSupervisor, SupervisorTimings};
pub use types::{ProxyDescriptor, ProxyStatus};
