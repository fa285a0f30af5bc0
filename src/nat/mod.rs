//! Lease-based port forwarding on a local gateway

pub mod error;
pub mod gateway;
pub mod mapping;
pub mod memory;
pub mod reconciler;
pub mod scheduler;
pub mod upnp;

pub use self::error::{ForwardError, ForwardResult, GatewayError, GatewayResult};
pub use self::gateway::{select_gateway, GatewayClient};
pub use self::mapping::{GatewayMapping, MappingDescriptor, MappingKey, OwnedMapping, Protocol};
pub use self::memory::MemoryGateway;
pub use self::reconciler::{ForwardOptions, Reconciler};
pub use self::scheduler::{LeaseScheduler, ScheduleConfig, SchedulerState};
pub use self::upnp::UpnpGateway;
