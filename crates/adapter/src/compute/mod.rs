//! Compute: the driver contract, the manager that binds pods to instances,
//! and the warm pool that hides launch latency.

pub mod driver;
pub mod fake;
pub mod manager;
pub mod userdata;
pub mod warmpool;

pub use driver::{
    ComputeDriver, ComputeError, Filter, InstanceDescription, InstancePage, InstanceSpec,
    InstanceState, Tag,
};
pub use fake::FakeCompute;
pub use manager::{ComputeBinding, ComputeManager, ComputeSource};
pub use warmpool::WarmPoolManager;
