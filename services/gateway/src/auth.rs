use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use protocol::{Identity, Role};
use serde::Deserialize;
use sqlx::PgPool;

/// Claims carried by every gateway bearer token. `role` and `sid` let the
/// connection converge on an [`Identity`] with no database round trip --
/// the only query this module issues is the revocation check.
#[derive(Debug, Clone, Deserialize)]
struct GatewayClaims {
    sub: String,
    role: Role,
    sid: String,
    exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Invalid,
    Expired,
}

/// Verifies bearer tokens against a process-configured HS256 secret and
/// converges every verification path (cookie, query, in-message) onto a
/// single [`Identity`] value, per the "permissive auth" redesign note --
/// downstream code never again inspects the raw token.
#[derive(Clone)]
pub struct AuthVerifier {
    secret: Vec<u8>,
}

impl AuthVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    fn decode(&self, token: &str) -> Result<GatewayClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<GatewayClaims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }

    /// Checks, in order, the `session` cookie then the `token` query
    /// parameter. Missing or invalid yields an anonymous identity -- the
    /// connection is still accepted; restricted topics are refused at
    /// subscribe time.
    pub async fn verify_at_connect(
        &self,
        pool: &PgPool,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Identity {
        if let Some(token) = extract_session_cookie(headers) {
            if let Ok(identity) = self.resolve(pool, &token).await {
                return identity;
            }
        }
        if let Some(token) = query_token {
            if let Ok(identity) = self.resolve(pool, token).await {
                return identity;
            }
        }
        Identity::anonymous()
    }

    /// Verifies an `authToken` supplied in-message (a SUBSCRIBE upgrading
    /// an anonymous session). Distinguishes [`TokenError::Expired`] from
    /// [`TokenError::Invalid`] -- the caller maps those to 4401/4011
    /// respectively, per §4.B's "same checks" rule for this path.
    pub async fn verify_in_message(
        &self,
        pool: &PgPool,
        auth_token: &str,
    ) -> Result<Identity, TokenError> {
        self.resolve(pool, auth_token).await
    }

    async fn resolve(&self, pool: &PgPool, token: &str) -> Result<Identity, TokenError> {
        let claims = self.decode(token)?;
        if is_session_revoked(pool, &claims.sid).await {
            return Err(TokenError::Invalid);
        }
        Ok(Identity {
            principal_id: Some(claims.sub),
            role: claims.role,
            session_id: Some(claims.sid),
            expires_at: Some(claims.exp),
        })
    }
}

async fn is_session_revoked(pool: &PgPool, session_id: &str) -> bool {
    crate::repo::sessions::is_revoked(pool, session_id)
        .await
        .unwrap_or(false)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "session").then(|| value.to_owned())
    })
}

pub fn extract_device_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
    }

    #[test]
    fn extract_session_cookie_finds_named_pair() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            axum::http::HeaderValue::from_static("other=1; session=tok-abc; foo=bar"),
        );
        assert_eq!(extract_session_cookie(&headers), Some("tok-abc".to_owned()));
    }

    #[test]
    fn extract_session_cookie_absent_returns_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_session_cookie(&headers), None);
    }

    #[test]
    fn extract_device_id_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-device-id", axum::http::HeaderValue::from_static("dev-1"));
        assert_eq!(extract_device_id(&headers), Some("dev-1".to_owned()));
    }

    #[test]
    fn decode_rejects_wrong_secret() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            role: Role,
            sid: String,
            exp: i64,
        }

        let claims = Claims {
            sub: "user-1".to_owned(),
            role: Role::User,
            sid: "sess-1".to_owned(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"right-secret"),
        )
        .unwrap();

        let verifier = AuthVerifier::new(b"wrong-secret".to_vec());
        assert_eq!(verifier.decode(&token).unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn decode_rejects_expired_token() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            role: Role,
            sid: String,
            exp: i64,
        }

        let claims = Claims {
            sub: "user-1".to_owned(),
            role: Role::User,
            sid: "sess-1".to_owned(),
            exp: chrono::Utc::now().timestamp() - 10,
        };
        let secret = b"test-secret-test-secret".to_vec();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();

        let verifier = AuthVerifier::new(secret);
        assert_eq!(verifier.decode(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn decode_accepts_valid_token_and_fills_identity_fields() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            role: Role,
            sid: String,
            exp: i64,
        }

        let exp = chrono::Utc::now().timestamp() + 3600;
        let claims = Claims {
            sub: "user-1".to_owned(),
            role: Role::Admin,
            sid: "sess-9".to_owned(),
            exp,
        };
        let secret = b"test-secret-test-secret".to_vec();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();

        let verifier = AuthVerifier::new(secret);
        let decoded = verifier.decode(&token).unwrap();
        assert_eq!(decoded.sub, "user-1");
        assert_eq!(decoded.role, Role::Admin);
        assert_eq!(decoded.sid, "sess-9");
        assert_eq!(decoded.exp, exp);
    }

    /// `verify_in_message` must distinguish an expired token from every
    /// other invalid one -- the caller maps these to different wire error
    /// codes (4401 vs 4011). Both cases fail inside `decode` before
    /// `resolve` ever issues a query, so a lazily-connected pool (one that
    /// never dials out) is enough to exercise this.
    #[tokio::test]
    async fn verify_in_message_distinguishes_expired_from_invalid() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            role: Role,
            sid: String,
            exp: i64,
        }

        let secret = b"test-secret-test-secret".to_vec();
        let pool = PgPool::connect_lazy("postgres://unused/unused").unwrap();

        let expired_claims = Claims {
            sub: "user-1".to_owned(),
            role: Role::User,
            sid: "sess-1".to_owned(),
            exp: chrono::Utc::now().timestamp() - 10,
        };
        let expired_token = encode(
            &Header::new(Algorithm::HS256),
            &expired_claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();

        let verifier = AuthVerifier::new(secret.clone());
        assert_eq!(
            verifier.verify_in_message(&pool, &expired_token).await.unwrap_err(),
            TokenError::Expired
        );

        let wrong_secret_verifier = AuthVerifier::new(b"different-secret".to_vec());
        let valid_claims = Claims {
            sub: "user-1".to_owned(),
            role: Role::User,
            sid: "sess-1".to_owned(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        let token_for_wrong_secret = encode(
            &Header::new(Algorithm::HS256),
            &valid_claims,
            &EncodingKey::from_secret(&secret),
        )
        .unwrap();
        assert_eq!(
            wrong_secret_verifier
                .verify_in_message(&pool, &token_for_wrong_secret)
                .await
                .unwrap_err(),
            TokenError::Invalid
        );
    }
}
