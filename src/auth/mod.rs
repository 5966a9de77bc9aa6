use crate::event::Identity;
use axum::http::HeaderMap;

#[cfg(test)]
mod tests;

/// Maps an inbound request to the caller's identity.
///
/// Token issuance and verification live outside this service; resolvers
/// only turn an already-trusted credential into an [`Identity`].
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, TokenError>;
}

/// Treats the opaque bearer token as the identity key.
#[derive(Clone, Copy, Debug, Default)]
pub struct BearerIdentityResolver;

impl IdentityResolver for BearerIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, TokenError> {
        extract_bearer_token(headers).map(Identity::new)
    }
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Returns true if the bearer token matches the expected admin token.
/// Returns true (no restriction) when `expected` is None.
pub fn validate_admin_token(headers: &HeaderMap, expected: &Option<String>) -> bool {
    let Some(expected_token) = expected else {
        // No admin token configured → admin API is unrestricted (dev mode)
        return true;
    };

    match extract_bearer_token(headers) {
        Ok(token) => &token == expected_token,
        Err(_) => false,
    }
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    // Expect "Bearer <token>"
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>" or not valid header text
    InvalidFormat,
    /// Token is empty string
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
        }
    }
}

impl std::error::Error for TokenError {}
