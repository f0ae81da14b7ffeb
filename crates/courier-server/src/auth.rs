use std::collections::HashMap;

use axum::http::{header, HeaderMap};

use courier_core::identity::{AuthError, Identity, TokenVerifier};

use crate::error::ChannelError;

/// Pull the token out of the `Authorization: Bearer` header or the `token`
/// query parameter. Both transports accept both locations.
pub fn extract_token<'a>(
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> Option<&'a str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    query.get("token").map(String::as_str)
}

/// Resolve the caller's identity or fail the connection attempt with
/// `Unauthenticated` — no stream is established either way.
pub fn authenticate(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Identity, ChannelError> {
    let token = extract_token(headers, query).ok_or(ChannelError::Unauthenticated)?;
    verifier.verify(token).map_err(|err| {
        tracing::debug!(error = %err, "token rejected");
        ChannelError::Unauthenticated
    })
}

/// Fixed-map verifier. Real deployments plug the host system's JWT
/// verification in behind `TokenVerifier`; this one backs tests and
/// single-tenant setups where tokens are provisioned out of band.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::identity::Role;
    use courier_core::ids::UserId;

    fn manager() -> Identity {
        Identity {
            user_id: UserId::new(1),
            role: Role::Manager,
            email: None,
        }
    }

    #[test]
    fn extracts_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        let query = HashMap::new();
        assert_eq!(extract_token(&headers, &query), Some("abc123"));
    }

    #[test]
    fn falls_back_to_query_param() {
        let headers = HeaderMap::new();
        let query = HashMap::from([("token".to_string(), "qtoken".to_string())]);
        assert_eq!(extract_token(&headers, &query), Some("qtoken"));
    }

    #[test]
    fn header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer fromheader".parse().unwrap());
        let query = HashMap::from([("token".to_string(), "fromquery".to_string())]);
        assert_eq!(extract_token(&headers, &query), Some("fromheader"));
    }

    #[test]
    fn missing_token_is_unauthenticated() {
        let verifier = StaticTokenVerifier::new();
        let result = authenticate(&verifier, &HeaderMap::new(), &HashMap::new());
        assert!(matches!(result, Err(ChannelError::Unauthenticated)));
    }

    #[test]
    fn unknown_token_is_unauthenticated() {
        let verifier = StaticTokenVerifier::new().with("good", manager());
        let query = HashMap::from([("token".to_string(), "bad".to_string())]);
        let result = authenticate(&verifier, &HeaderMap::new(), &query);
        assert!(matches!(result, Err(ChannelError::Unauthenticated)));
    }

    #[test]
    fn known_token_resolves_identity() {
        let verifier = StaticTokenVerifier::new().with("good", manager());
        let query = HashMap::from([("token".to_string(), "good".to_string())]);
        let identity = authenticate(&verifier, &HeaderMap::new(), &query).unwrap();
        assert_eq!(identity.user_id, UserId::new(1));
    }
}
