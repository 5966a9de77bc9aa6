use super::*;
use axum::http::HeaderMap;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

#[cfg(test)]
mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let headers = headers_with("Bearer player-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "player-7f3a");
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let headers = headers_with("Bearer   player-7f3a  ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "player-7f3a");
    }

    #[test]
    fn case_insensitive_bearer() {
        let headers = headers_with("bearer player-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "player-7f3a");
    }

    #[test]
    fn missing_authorization_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
    }

    #[test]
    fn empty_authorization_header() {
        let headers = headers_with("");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn missing_bearer_prefix() {
        let headers = headers_with("player-7f3a");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_scheme() {
        let headers = headers_with("Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn empty_token() {
        let headers = headers_with("Bearer   ");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
    }
}

#[cfg(test)]
mod identity_resolver_tests {
    use super::*;

    #[test]
    fn bearer_token_becomes_identity() {
        let resolver = BearerIdentityResolver;
        let identity = resolver.resolve(&headers_with("Bearer alice")).unwrap();
        assert_eq!(identity, Identity::from("alice"));
    }

    #[test]
    fn missing_token_is_rejected() {
        let resolver = BearerIdentityResolver;
        assert_eq!(resolver.resolve(&HeaderMap::new()), Err(TokenError::Missing));
    }
}

#[cfg(test)]
mod admin_token_tests {
    use super::*;

    #[test]
    fn no_configured_token_allows_everything() {
        assert!(validate_admin_token(&HeaderMap::new(), &None));
    }

    #[test]
    fn matching_token_is_accepted() {
        let expected = Some("s3cret".to_string());
        assert!(validate_admin_token(&headers_with("Bearer s3cret"), &expected));
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let expected = Some("s3cret".to_string());
        assert!(!validate_admin_token(&headers_with("Bearer nope"), &expected));
        assert!(!validate_admin_token(&HeaderMap::new(), &expected));
    }
}
