//! JSON-RPC 2.0 control plane served over WebSocket

mod handlers;
mod params;
mod protocol;
mod server;
mod subscriptions;

#[cfg(test)]
mod tests;

pub use handlers::{handle_request, MetricsSnapshot, RpcContext, RpcMetrics};
pub use protocol::*;
pub use server::RpcServer;
pub use subscriptions::{SubscriptionRegistry, SubscriptionStats};
