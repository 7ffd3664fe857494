pub mod registry;
pub mod sweeper;

pub use registry::{ResolveAction, ResolveOutcome, Session, SessionRegistry};
pub use sweeper::spawn_sweeper;
