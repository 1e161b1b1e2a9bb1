//! Bearer credential checks performed before a socket upgrade.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Who a verified credential belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Single shared secret.
pub struct StaticTokenVerifier {
    token: SecretString,
}

impl StaticTokenVerifier {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if bool::from(self.token.expose_secret().as_bytes().ct_eq(token.as_bytes())) {
            Ok(Principal {
                subject: "static".into(),
            })
        } else {
            Err(AuthError::Invalid("token mismatch".into()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// HS256 JSON web tokens.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        Ok(Principal {
            subject: data.claims.sub,
        })
    }
}

/// Query parameters accepted on the socket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    pub session_id: Option<String>,
}

/// `Authorization: Bearer <token>` first, then the `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    from_header
        .filter(|t| !t.is_empty())
        .or_else(|| query_token.filter(|t| !t.is_empty()))
        .map(str::to_string)
}

pub fn authenticate(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Principal, AuthError> {
    let token = extract_token(headers, query_token).ok_or(AuthError::Missing)?;
    verifier.verify(&token)
}
