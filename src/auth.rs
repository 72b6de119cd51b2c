// =============================================================================
// Bearer Token Verification
// =============================================================================
//
// Tokens are issued elsewhere (out of scope here); this module only verifies
// them. A token is `<hex(payload json)>.<hex(hmac-sha256(secret, payload
// json))>` — the same HMAC-SHA256 primitive the quote side of this service
// would use for any provider-signed request, applied to a payload instead of
// a query string. Comparison of the computed and presented MAC is constant
// time.
// =============================================================================

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;

use crate::app_state::AppState;
use crate::types::{Role, UserId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    user_id: UserId,
    role: Role,
    /// Unix timestamp the token expires at.
    exp: i64,
}

/// Verified identity extracted from a request's bearer token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let State(state) = State::<Arc<AppState>>::from_request_parts(parts, state)
            .await
            .expect("AppState is always extractable");

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "missing or invalid authorization token",
                });
            }
        };

        let secret = state.config.read().auth.token_secret.clone();
        verify_token(token, secret.as_bytes())
            .map(|(user_id, role)| Identity { user_id, role })
            .map_err(|_| AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "invalid or expired authorization token",
            })
    }
}

/// Require that the caller is an admin. Built on top of `Identity`, so any
/// route that extracts `AdminIdentity` first runs the ordinary bearer-token
/// check.
pub struct AdminIdentity(pub Identity);

impl FromRequestParts<Arc<AppState>> for AdminIdentity {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_request_parts(parts, state).await?;
        if !identity.is_admin() {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "admin role required",
            });
        }
        Ok(AdminIdentity(identity))
    }
}

/// Verify `<hex(payload)>.<hex(mac)>` against `secret`, checking both the
/// MAC and the `exp` claim. Returns the decoded `(userId, role)` on success.
fn verify_token(token: &str, secret: &[u8]) -> Result<(UserId, Role), ()> {
    let (payload_hex, mac_hex) = token.split_once('.').ok_or(())?;

    let payload_bytes = hex::decode(payload_hex).map_err(|_| ())?;
    let presented_mac = hex::decode(mac_hex).map_err(|_| ())?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| ())?;
    mac.update(&payload_bytes);
    mac.verify_slice(&presented_mac).map_err(|_| ())?;

    let payload: TokenPayload = serde_json::from_slice(&payload_bytes).map_err(|_| ())?;
    if payload.exp < Utc::now().timestamp() {
        return Err(());
    }

    Ok((payload.user_id, payload.role))
}

/// Construct a verifiable token for the given claims. Exposed for tests and
/// for any future issuance path; not reachable from a route handler.
#[cfg(test)]
fn issue_token(user_id: &str, role: Role, ttl_secs: i64, secret: &[u8]) -> String {
    let payload = TokenPayload {
        user_id: user_id.to_string(),
        role,
        exp: Utc::now().timestamp() + ttl_secs,
    };
    let payload_bytes = serde_json::to_vec(&payload).unwrap();
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(&payload_bytes);
    let tag = mac.finalize().into_bytes();
    format!("{}.{}", hex::encode(&payload_bytes), hex::encode(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn verifies_freshly_issued_token() {
        let token = issue_token("U1", Role::User, 3600, SECRET);
        let (user_id, role) = verify_token(&token, SECRET).unwrap();
        assert_eq!(user_id, "U1");
        assert_eq!(role, Role::User);
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let token = issue_token("U1", Role::User, 3600, SECRET);
        assert!(verify_token(&token, b"wrong-secret").is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let token = issue_token("U1", Role::Admin, -1, SECRET);
        assert!(verify_token(&token, SECRET).is_err());
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(verify_token("not-a-token", SECRET).is_err());
        assert!(verify_token("abc.def", SECRET).is_err());
    }

    #[test]
    fn admin_role_round_trips() {
        let token = issue_token("A1", Role::Admin, 60, SECRET);
        let (user_id, role) = verify_token(&token, SECRET).unwrap();
        assert_eq!(user_id, "A1");
        assert_eq!(role, Role::Admin);
    }
}
