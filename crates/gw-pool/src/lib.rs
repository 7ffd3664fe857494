pub mod escalation;
pub mod pool;

pub use escalation::kill_with_escalation;
pub use pool::{PoolPermit, ProcessPool, Terminable};
