use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a scoped token is allowed to touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenScope {
    /// Poll or stream the status of a single run.
    RunStatus,
    /// Upload bytes to a single storage path.
    Upload,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    scope: TokenScope,
    iat: i64,
    exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,
    #[error("Token scope does not cover this resource")]
    WrongScope,
    #[error("Invalid token: {0}")]
    Invalid(jsonwebtoken::errors::Error),
}

/// Issues and verifies the short-lived credentials handed out with runs and
/// upload slots. HS256 with a per-install secret; the subject names the one
/// resource the token covers.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    /// Token letting the holder read status for exactly one run.
    pub fn issue_run_status(&self, run_id: Uuid) -> Result<String, TokenError> {
        self.issue(run_id.to_string(), TokenScope::RunStatus)
    }

    /// Token letting the holder upload bytes to exactly one storage path.
    pub fn issue_upload(&self, path: &str) -> Result<String, TokenError> {
        self.issue(path.to_string(), TokenScope::Upload)
    }

    fn issue(&self, sub: String, scope: TokenScope) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub,
            scope,
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Invalid)
    }

    /// Checks signature, expiry and scope, returning the subject the token
    /// was issued for. Callers compare the subject against the resource
    /// actually requested.
    pub fn verify(&self, token: &str, scope: TokenScope) -> Result<String, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e),
            }
        })?;

        if data.claims.scope != scope {
            return Err(TokenError::WrongScope);
        }
        Ok(data.claims.sub)
    }
}
