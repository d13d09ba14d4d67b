//! Authentication - principals, token vault, and the reserved actions.
//!
//! The listener side tracks a [`Principal`] per connection, initially
//! anonymous. Two reserved actions with an empty controller segment
//! (`"/SignIn"`, `"/SignOut"`) mutate it; nothing else does. The token
//! itself is an opaque envelope: the core only calls the [`TokenVault`]
//! issue/verify hooks, and the default vault implements them with JWT.
//!
//! Permission policy for an inbound request on the listener side:
//!
//! 1. Authenticated principals are allowed.
//! 2. A controller-level allow-anonymous marker allows.
//! 3. An action-level allow-anonymous marker allows.
//! 4. Otherwise denied with `Unauthorized`.
//!
//! The dialer side performs no check; the server is trusted to call
//! back any client action.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::connection::Shared;
use crate::controller::Reply;
use crate::error::Result;
use crate::protocol::Status;

/// Claims carried inside the token envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Granted roles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Identity bound to a listener-side connection.
///
/// Anonymous until a successful `SignIn`; replaced atomically so every
/// request observes either the pre- or post-sign-in identity, never a
/// mixture.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    claims: Option<Claims>,
}

impl Principal {
    /// The unauthenticated principal.
    pub fn anonymous() -> Self {
        Self { claims: None }
    }

    /// Principal backed by verified claims.
    pub fn authenticated(claims: Claims) -> Self {
        Self {
            claims: Some(claims),
        }
    }

    /// Check if this principal is authenticated.
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.claims.is_some()
    }

    /// Subject name, if authenticated.
    pub fn name(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.sub.as_str())
    }

    /// Verified claims, if authenticated.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }
}

/// Token verification failure.
///
/// The display strings are the human-readable reasons sent back in
/// `BadRequest` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Signature, structure, or claims were unacceptable.
    #[error("Token is invalid.")]
    Invalid,
    /// The token's validity window is in the past.
    #[error("Token has expired.")]
    Expired,
}

/// Opaque token envelope: issue claims into bytes, verify bytes back
/// into claims. The core never looks inside the envelope.
pub trait TokenVault: Send + Sync {
    /// Seal claims into a token.
    fn issue(&self, claims: &Claims) -> Result<Vec<u8>>;

    /// Open a token and check its validity window.
    fn verify(&self, token: &[u8]) -> std::result::Result<Claims, TokenError>;
}

/// Default vault: HS256 JWT over a shared secret.
#[derive(Clone)]
pub struct JwtVault {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVault").finish_non_exhaustive()
    }
}

impl JwtVault {
    /// Create a vault from a shared secret.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::default();
        // Expiry boundaries are exact; a token is expired the second
        // its window ends.
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Issue a token for a subject valid for the given duration.
    ///
    /// A non-positive validity produces an already-expired token;
    /// useful for exercising the expiry path.
    pub fn issue_for(&self, sub: &str, validity: Duration) -> Result<Vec<u8>> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + validity.num_seconds(),
            iat: now,
            roles: Vec::new(),
        };
        self.issue(&claims)
    }
}

impl TokenVault for JwtVault {
    fn issue(&self, claims: &Claims) -> Result<Vec<u8>> {
        let token = encode(&jsonwebtoken::Header::default(), claims, &self.encoding_key)
            .map_err(|e| crate::error::SockwireError::Protocol(format!("token issue: {}", e)))?;
        Ok(token.into_bytes())
    }

    fn verify(&self, token: &[u8]) -> std::result::Result<Claims, TokenError> {
        let token = std::str::from_utf8(token).map_err(|_| TokenError::Invalid)?;
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                _ => Err(TokenError::Invalid),
            },
        }
    }
}

/// Reserved action names (empty controller segment on the wire).
pub(crate) const SIGN_IN: &str = "signin";
pub(crate) const SIGN_OUT: &str = "signout";

/// Handle the reserved auth actions.
///
/// `SignIn(token)` verifies the envelope and atomically replaces the
/// connection's principal; every failure path replies `BadRequest`
/// with a human-readable reason and leaves the principal untouched.
/// `SignOut()` atomically resets to anonymous.
pub(crate) async fn handle_reserved(shared: &Arc<Shared>, action: &str, payload: &Bytes) -> Reply {
    match action.to_lowercase().as_str() {
        SIGN_IN => sign_in(shared, payload),
        SIGN_OUT => {
            *shared.principal.write() = Principal::anonymous();
            debug!("principal reset to anonymous");
            ok_reply()
        }
        other => Reply::error(Status::NotFound, &format!("Action /{} not found.", other)),
    }
}

fn sign_in(shared: &Arc<Shared>, payload: &Bytes) -> Reply {
    let Some(vault) = &shared.vault else {
        return Reply::error(
            Status::BadRequest,
            "Authentication is not configured on this peer.",
        );
    };

    let token = match JsonCodec::decode_args(payload)
        .ok()
        .filter(|args| args.len() == 1)
        .and_then(|mut args| match args.remove(0) {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        }) {
        Some(token) => token,
        None => return Reply::error(Status::BadRequest, "SignIn expects a single token string."),
    };

    match vault.verify(token.as_bytes()) {
        Ok(claims) => {
            let principal = Principal::authenticated(claims);
            *shared.principal.write() = principal.clone();
            debug!(subject = principal.name(), "principal authenticated");

            let hooks = shared.on_authenticated.lock().clone();
            for hook in hooks.iter() {
                hook(&principal);
            }
            ok_reply()
        }
        Err(e) => {
            warn!(error = %e, "sign-in rejected");
            Reply::error(Status::BadRequest, &e.to_string())
        }
    }
}

fn ok_reply() -> Reply {
    match Reply::ok(&(), crate::codec::PayloadEncoding::Json) {
        Ok(reply) => reply,
        Err(_) => Reply::error(Status::InternalError, "Internal Server Error"),
    }
}

/// Listener-side permission check for a resolved action.
///
/// Returns the denial reply, or `None` when the call may proceed.
pub(crate) fn check_permission(
    principal: &Principal,
    controller_anonymous: bool,
    action_anonymous: bool,
    full_name: &str,
) -> Option<Reply> {
    if principal.is_authenticated() || controller_anonymous || action_anonymous {
        return None;
    }
    Some(Reply::error(
        Status::Unauthorized,
        &format!("Action {} requires user authentication.", full_name),
    ))
}

/// Dialer-side observable flag update after a completed auth call.
pub(crate) fn record_auth_state(shared: &Shared, authenticated: bool) {
    shared.authenticated.store(authenticated, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_states() {
        let anon = Principal::anonymous();
        assert!(!anon.is_authenticated());
        assert!(anon.name().is_none());

        let principal = Principal::authenticated(Claims {
            sub: "alice".to_string(),
            exp: Utc::now().timestamp() + 60,
            iat: Utc::now().timestamp(),
            roles: vec!["admin".to_string()],
        });
        assert!(principal.is_authenticated());
        assert_eq!(principal.name(), Some("alice"));
        assert_eq!(principal.claims().unwrap().roles, vec!["admin"]);
    }

    #[test]
    fn test_jwt_vault_roundtrip() {
        let vault = JwtVault::new(b"test-secret");
        let token = vault.issue_for("alice", Duration::minutes(5)).unwrap();

        let claims = vault.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_expired_token() {
        let vault = JwtVault::new(b"test-secret");
        let token = vault.issue_for("alice", Duration::minutes(-5)).unwrap();

        let err = vault.verify(&token).unwrap_err();
        assert_eq!(err, TokenError::Expired);
        assert_eq!(err.to_string(), "Token has expired.");
    }

    #[test]
    fn test_tampered_token() {
        let vault = JwtVault::new(b"test-secret");
        let other = JwtVault::new(b"other-secret");
        let token = other.issue_for("mallory", Duration::minutes(5)).unwrap();

        let err = vault.verify(&token).unwrap_err();
        assert_eq!(err, TokenError::Invalid);
        assert_eq!(err.to_string(), "Token is invalid.");
    }

    #[test]
    fn test_garbage_token() {
        let vault = JwtVault::new(b"test-secret");
        assert_eq!(vault.verify(b"not a token").unwrap_err(), TokenError::Invalid);
        assert_eq!(vault.verify(&[0xFF, 0xFE]).unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn test_permission_policy_order() {
        let anon = Principal::anonymous();
        let authed = Principal::authenticated(Claims {
            sub: "alice".to_string(),
            exp: 0,
            iat: 0,
            roles: Vec::new(),
        });

        // Authenticated principals pass regardless of markers.
        assert!(check_permission(&authed, false, false, "Secret/Ping").is_none());
        // Controller marker admits anonymous callers.
        assert!(check_permission(&anon, true, false, "Open/Ping").is_none());
        // Action marker admits anonymous callers.
        assert!(check_permission(&anon, false, true, "Mixed/Ping").is_none());

        // Otherwise denied with the action's full name in the reason.
        let reply = check_permission(&anon, false, false, "Secret/Ping").unwrap();
        assert_eq!(reply.status, Status::Unauthorized);
        let message: String = serde_json::from_slice(&reply.body).unwrap();
        assert!(message.contains("Secret/Ping"));
        assert!(message.contains("requires user authentication"));
    }
}
