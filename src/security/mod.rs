//! Token authentication, role checks and connection admission

mod jwt;
mod limits;
mod middleware;
mod ratelimit;
mod rbac;


pub use jwt::{AuthResult, Claims, JwtHandler};
pub use limits::{ConnectionGuard, ConnectionTracker};
pub use middleware::{AuthSession, SecurityMiddleware};
pub use ratelimit::RateLimiter;
pub use rbac::{known_methods, method_access, MethodAccess, Role};
