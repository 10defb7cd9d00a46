pub mod audit_event;
pub mod balance_snapshot;
pub mod credential;
pub mod execution_attempt;
pub mod position;
pub mod signal;
pub mod subscriber;
pub mod symbol;

pub use audit_event::*;
pub use balance_snapshot::*;
pub use credential::*;
pub use execution_attempt::*;
pub use position::*;
pub use signal::*;
pub use subscriber::*;
pub use symbol::*;
