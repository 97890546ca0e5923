use super::jwt::{AuthResult, JwtHandler};
use super::limits::{ConnectionGuard, ConnectionTracker};
use super::ratelimit::RateLimiter;
use super::rbac::{method_access, MethodAccess, Role};
use crate::config::SecurityConfig;
use crate::error::SecurityError;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Authentication state of one connection
#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub client_id: String,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    /// Seconds since the epoch
    pub token_expiry: Option<i64>,
    pub session_id: Option<String>,
    /// Set when the session was reverted because its token expired
    pub token_expired: bool,
}

impl AuthSession {
    fn unauthenticated(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            authenticated: false,
            user_id: None,
            role: None,
            token_expiry: None,
            session_id: None,
            token_expired: false,
        }
    }

    fn expired(client_id: &str) -> Self {
        Self {
            token_expired: true,
            ..Self::unauthenticated(client_id)
        }
    }
}

/// Per-connection authentication, authorization, rate limiting and admission
pub struct SecurityMiddleware {
    jwt: JwtHandler,
    sessions: RwLock<HashMap<String, AuthSession>>,
    rate_limiter: RateLimiter,
    connections: ConnectionTracker,
}

impl SecurityMiddleware {
    pub fn new(config: &SecurityConfig, max_connections: usize) -> Result<Self, SecurityError> {
        let jwt = JwtHandler::new(
            &config.jwt_secret,
            Duration::from_secs(config.token_expiry_hours * 3600),
        )?;

        Ok(Self {
            jwt,
            sessions: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::new(
                config.rate_limit_requests,
                Duration::from_secs(config.rate_limit_window_seconds),
            ),
            connections: ConnectionTracker::new(max_connections),
        })
    }

    pub fn jwt(&self) -> &JwtHandler {
        &self.jwt
    }

    /// Fail-fast admission check
    pub fn can_accept_connection(&self, client_id: &str) -> bool {
        let accept = self.connections.has_capacity();
        if !accept {
            debug!("Connection {} would exceed the cap", client_id);
        }
        accept
    }

    /// Admit a connection and start tracking it as unauthenticated
    pub fn admit(&self, client_id: &str) -> Result<ConnectionGuard, SecurityError> {
        let guard = self.connections.try_acquire(client_id)?;
        self.sessions
            .write()
            .insert(client_id.to_string(), AuthSession::unauthenticated(client_id));
        debug!(
            "Admitted {} ({} active)",
            client_id,
            self.connections.active()
        );
        Ok(guard)
    }

    /// Drop all state held for a closed connection
    pub fn release(&self, client_id: &str) {
        self.sessions.write().remove(client_id);
        self.rate_limiter.remove(client_id);
    }

    /// Verify a token and bind its identity to the connection
    pub fn authenticate(&self, client_id: &str, token: &str) -> AuthResult {
        let result = self.jwt.authenticate(token);

        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(client_id.to_string())
            .or_insert_with(|| AuthSession::unauthenticated(client_id));

        if result.authenticated {
            session.authenticated = true;
            session.user_id = result.user_id.clone();
            session.role = result.role;
            session.token_expiry = result.expires_at;
            session.session_id = Some(Uuid::new_v4().to_string());
            session.token_expired = false;
            info!(
                "Client {} authenticated as {} ({})",
                client_id,
                result.user_id.as_deref().unwrap_or_default(),
                result.role.map(|r| r.as_str()).unwrap_or_default()
            );
        } else {
            // A failed attempt never downgrades an existing session
            warn!(
                "Authentication failed for {}: {}",
                client_id,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        result
    }

    /// `user_level >= required_level`; never for an unauthenticated session
    pub fn has_permission(session: &AuthSession, required: Role) -> bool {
        session.authenticated && session.role.is_some_and(|role| role.satisfies(required))
    }

    /// Check that `client_id` may call `method` right now.
    ///
    /// An expired token reverts the connection to unauthenticated; protected
    /// calls then keep failing with `TokenExpired` until it authenticates again.
    pub fn authorize(&self, client_id: &str, method: &str) -> Result<(), SecurityError> {
        let required = match method_access(method) {
            Some(MethodAccess::Requires(role)) => role,
            // Public, or unknown and left for dispatch to reject
            _ => return Ok(()),
        };

        let now = Utc::now().timestamp();
        let mut sessions = self.sessions.write();
        let session = match sessions.get_mut(client_id) {
            Some(session) if session.authenticated => session,
            Some(session) if session.token_expired => return Err(SecurityError::TokenExpired),
            _ => return Err(SecurityError::AuthenticationRequired),
        };

        if session.token_expiry.map_or(true, |exp| exp <= now) {
            info!("Token of {} expired, session reverted", client_id);
            *session = AuthSession::expired(client_id);
            return Err(SecurityError::TokenExpired);
        }

        if !Self::has_permission(session, required) {
            return Err(SecurityError::InsufficientPermissions {
                method: method.to_string(),
                required: required.as_str().to_string(),
            });
        }

        Ok(())
    }

    pub fn check_rate_limit(&self, client_id: &str) -> Result<(), SecurityError> {
        self.rate_limiter.check(client_id).inspect_err(|_| {
            warn!("Rate limit exceeded by {}", client_id);
        })
    }

    pub fn session(&self, client_id: &str) -> Option<AuthSession> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    pub fn authenticated_clients(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|session| session.authenticated)
            .count()
    }

    pub fn rejected_connections(&self) -> usize {
        self.connections.rejected()
    }
}
