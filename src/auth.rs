use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::api::ApiError;

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(ApiError::Unauthorized("Invalid API key"));
    }

    Ok(())
}

pub fn verify_query_token(token: Option<&str>, expected_key: &str) -> Result<(), ApiError> {
    match token.map(str::trim) {
        None | Some("") => Err(ApiError::Unauthorized("Missing token query parameter")),
        Some(token) if token != expected_key => Err(ApiError::Unauthorized("Invalid API key")),
        Some(_) => Ok(()),
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(ApiError::Unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(ApiError::Unauthorized("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::Unauthorized("Authorization must use Bearer token"));
    };

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_key_must_match() {
        assert!(verify_bearer(&headers("Bearer secret"), "secret").is_ok());
        assert!(verify_bearer(&headers("Bearer secret "), "secret").is_ok());
        assert_eq!(
            verify_bearer(&headers("Bearer other"), "secret"),
            Err(ApiError::Unauthorized("Invalid API key"))
        );
        assert_eq!(
            verify_bearer(&headers("Basic c2VjcmV0"), "secret"),
            Err(ApiError::Unauthorized("Authorization must use Bearer token"))
        );
        assert_eq!(
            verify_bearer(&HeaderMap::new(), "secret"),
            Err(ApiError::Unauthorized("Missing Authorization header"))
        );
    }

    #[test]
    fn query_token_must_match() {
        assert!(verify_query_token(Some("secret"), "secret").is_ok());
        assert!(verify_query_token(Some("nope"), "secret").is_err());
        assert!(verify_query_token(Some(" "), "secret").is_err());
        assert!(verify_query_token(None, "secret").is_err());
    }
}
