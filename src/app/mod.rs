mod manager;
mod routing;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;


pub use manager::ServiceManager;
pub use types::{ComponentState, ShutdownReason, COMPONENTS};
