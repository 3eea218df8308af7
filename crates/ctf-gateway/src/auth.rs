//! User token verification for browser-facing routes.

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use ctf_common::{CtfError, Identity, Result, TokenVerifier};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 verifier for tokens issued by the account service.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let claims = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(decoded) => decoded.claims,
            Err(error) => match error.kind() {
                ErrorKind::ExpiredSignature => {
                    return Err(CtfError::Unauthorized("token expired".to_string()))
                }
                _ => return Err(CtfError::Unauthorized("invalid token".to_string())),
            },
        };
        if claims.sub.trim().is_empty() {
            return Err(CtfError::Unauthorized("token has no subject".to_string()));
        }
        Ok(Identity {
            subject: claims.sub,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CtfError::Unauthorized("missing authorization".to_string()))?;
    let Some(token) = raw.trim().strip_prefix("Bearer ") else {
        return Err(CtfError::Unauthorized("expected bearer token".to_string()));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(CtfError::Unauthorized("expected bearer token".to_string()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(sub: &str, exp_offset_secs: i64, key: &str) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_yields_subject() {
        let verifier = JwtVerifier::new("k");
        let identity = verifier.verify(&make_token("alice", 600, "k")).await.unwrap();
        assert_eq!(identity.subject, "alice");
    }

    #[tokio::test]
    async fn test_rejections() {
        let verifier = JwtVerifier::new("k");
        for token in [
            make_token("alice", 600, "other-key"),
            make_token("alice", -600, "k"),
            make_token("", 600, "k"),
            "not.a.jwt".to_string(),
        ] {
            assert!(matches!(
                verifier.verify(&token).await,
                Err(CtfError::Unauthorized(_))
            ));
        }
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");
    }
}
