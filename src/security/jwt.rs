use super::rbac::Role;
use crate::config::MIN_JWT_SECRET_LEN;
use crate::error::SecurityError;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Token payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub role: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Outcome of a token check. Failures are values, never panics or errors.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    pub expires_at: Option<i64>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub error: Option<SecurityError>,
}

impl AuthResult {
    fn failed(error: SecurityError) -> Self {
        Self {
            authenticated: false,
            user_id: None,
            role: None,
            expires_at: None,
            error_message: Some(error.to_string()),
            error: Some(error),
        }
    }
}

pub const NO_TOKEN_MESSAGE: &str = "No authentication token provided";

/// HS256 token issuer and verifier
pub struct JwtHandler {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    default_expiry: Duration,
}

impl JwtHandler {
    pub fn new(secret: &str, default_expiry: Duration) -> Result<Self, SecurityError> {
        if secret.len() < MIN_JWT_SECRET_LEN {
            return Err(SecurityError::TokenGeneration {
                details: format!("secret must be at least {} bytes", MIN_JWT_SECRET_LEN),
            });
        }

        // Expiry is checked by hand against a single clock read, without leeway
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            default_expiry,
        })
    }

    /// Mint a token valid for `expiry` (or the configured default)
    pub fn generate_token(
        &self,
        user_id: &str,
        role: Role,
        expiry: Option<Duration>,
    ) -> Result<String, SecurityError> {
        let now = Utc::now().timestamp();
        let lifetime = expiry.unwrap_or(self.default_expiry).as_secs() as i64;
        self.generate_token_with_exp(user_id, role, now + lifetime)
    }

    pub fn generate_token_with_exp(
        &self,
        user_id: &str,
        role: Role,
        exp: i64,
    ) -> Result<String, SecurityError> {
        if user_id.trim().is_empty() {
            return Err(SecurityError::TokenGeneration {
                details: "user_id must not be empty".to_string(),
            });
        }

        let claims = Claims {
            user_id: user_id.to_string(),
            role: role.as_str().to_string(),
            exp,
            iat: Utc::now().timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            SecurityError::TokenGeneration {
                details: e.to_string(),
            }
        })
    }

    pub fn authenticate(&self, token: &str) -> AuthResult {
        self.authenticate_at(token, Utc::now().timestamp())
    }

    /// Verify `token` as of `now` (seconds since the epoch)
    pub fn authenticate_at(&self, token: &str, now: i64) -> AuthResult {
        if token.trim().is_empty() {
            return AuthResult {
                error_message: Some(NO_TOKEN_MESSAGE.to_string()),
                ..AuthResult::failed(SecurityError::AuthenticationRequired)
            };
        }

        let claims = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!("Token rejected: {}", e);
                return AuthResult::failed(SecurityError::AuthenticationFailed {
                    reason: e.to_string(),
                });
            }
        };

        // A token is valid strictly before its expiry second
        if claims.exp <= now {
            return AuthResult::failed(SecurityError::TokenExpired);
        }

        let Some(role) = Role::parse(&claims.role) else {
            return AuthResult::failed(SecurityError::AuthenticationFailed {
                reason: format!("unknown role '{}'", claims.role),
            });
        };

        if claims.user_id.trim().is_empty() {
            return AuthResult::failed(SecurityError::AuthenticationFailed {
                reason: "token has no user_id".to_string(),
            });
        }

        AuthResult {
            authenticated: true,
            user_id: Some(claims.user_id),
            role: Some(role),
            expires_at: Some(claims.exp),
            error_message: None,
            error: None,
        }
    }
}
