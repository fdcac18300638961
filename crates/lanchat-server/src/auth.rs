//! Auth Gate: decides which credential scheme a deployment runs and checks
//! `AUTH` / `AUTH_JWT` attempts against it.

use chrono::Utc;
use lanchat_shared::auth::{verify_hmac, verify_shared_secret, verify_token};
use lanchat_shared::protocol::AuthAttempt;
use lanchat_shared::AuthError;
use tracing::warn;

use crate::config::ServerConfig;

/// The scheme a deployment accepts. Only one is active at a time.
#[derive(Clone)]
pub enum AuthMode {
    /// No secret configured: every session starts authenticated.
    Open,
    Hmac { secret: String },
    Token { key: String },
}

#[derive(Clone)]
pub struct AuthGate {
    mode: AuthMode,
}

impl AuthGate {
    pub fn new(mode: AuthMode) -> Self {
        Self { mode }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let mode = match (&config.jwt_secret, &config.auth_secret) {
            (Some(key), Some(_)) => {
                warn!("both JWT_SECRET and AUTH_SECRET set, using signed tokens only");
                AuthMode::Token { key: key.clone() }
            }
            (Some(key), None) => AuthMode::Token { key: key.clone() },
            (None, Some(secret)) => AuthMode::Hmac {
                secret: secret.clone(),
            },
            (None, None) => AuthMode::Open,
        };
        Self::new(mode)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.mode, AuthMode::Open)
    }

    pub fn scheme(&self) -> &'static str {
        match self.mode {
            AuthMode::Open => "open",
            AuthMode::Hmac { .. } => "hmac",
            AuthMode::Token { .. } => "token",
        }
    }

    /// Check a credential. On success returns the authenticated username;
    /// `hello_user` is kept for the legacy bare-secret form, which names
    /// nobody.
    pub fn verify(&self, attempt: &AuthAttempt, hello_user: &str) -> Result<String, AuthError> {
        match (&self.mode, attempt) {
            (
                AuthMode::Hmac { secret },
                AuthAttempt::Hmac {
                    user,
                    timestamp,
                    mac,
                },
            ) => {
                verify_hmac(secret, user, timestamp, mac)?;
                Ok(user.clone())
            }
            (AuthMode::Hmac { secret }, AuthAttempt::Legacy { secret: presented }) => {
                verify_shared_secret(secret, presented)?;
                Ok(hello_user.to_string())
            }
            (AuthMode::Token { key }, AuthAttempt::Token(token)) => {
                let claims = verify_token(key, token, Utc::now().timestamp())?;
                Ok(claims.sub)
            }
            _ => Err(AuthError::SchemeDisabled),
        }
    }
}
