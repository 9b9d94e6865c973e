use std::collections::HashSet;

use http::header;
use http::{HeaderMap, StatusCode};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::{Map, Value};

/// Decoded token claims, in the order they were encoded in the token.
pub type Claims = Map<String, Value>;

/// Audience required of every token when neither `audiences` nor
/// `verify_options.audience` is configured.
pub const DEFAULT_AUDIENCE: &str = "postgraphile";

const DEFAULT_ROLE_CLAIM: &str = "role";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    pub audience: Option<Vec<String>>,
    pub issuer: Option<Vec<String>>,
    pub subject: Option<String>,
    pub algorithms: Option<Vec<Algorithm>>,
    pub leeway_secs: u64,
    pub ignore_expiration: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtOptions {
    pub secret: Option<Vec<u8>>,
    pub audiences: Option<Vec<String>>,
    pub verify_options: VerifyOptions,
    /// Path of claim keys leading to the role claim. Defaults to `["role"]`.
    pub role: Option<Vec<String>>,
}

/// Outcome of a successful (or skipped) token check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authenticated {
    pub claims: Claims,
    pub role: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub status: StatusCode,
    pub message: String,
}

impl AuthError {
    fn config(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_JWT_CONFIG",
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_JWT_INVALID",
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn header(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_AUTH_HEADER",
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuthError {}

/// Rejection reported by a [`TokenVerifier`]. The message reaches the caller unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl VerifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for VerifyError {}

pub trait TokenVerifier: Send + Sync {
    fn verify(
        &self,
        token: &str,
        secret: &[u8],
        options: &VerifyOptions,
    ) -> Result<Claims, VerifyError>;
}

/// HMAC verifier backed by the `jsonwebtoken` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWebTokenVerifier;

impl TokenVerifier for JsonWebTokenVerifier {
    fn verify(
        &self,
        token: &str,
        secret: &[u8],
        options: &VerifyOptions,
    ) -> Result<Claims, VerifyError> {
        let algorithms = options
            .algorithms
            .clone()
            .unwrap_or_else(|| vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]);
        let Some(first) = algorithms.first().copied() else {
            return Err(VerifyError::new("no JWT algorithms are allowed"));
        };

        let mut validation = Validation::new(first);
        validation.algorithms = algorithms;
        validation.leeway = options.leeway_secs;
        validation.validate_exp = !options.ignore_expiration;
        validation.validate_nbf = true;

        // `exp` and `nbf` are checked when present but never required.
        let mut required = HashSet::new();
        match options.audience.as_ref() {
            Some(audience) => {
                validation.set_audience(audience.as_slice());
                required.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = options.issuer.as_ref() {
            validation.set_issuer(issuer.as_slice());
            required.insert("iss".to_string());
        }
        if let Some(subject) = options.subject.as_ref() {
            validation.sub = Some(subject.clone());
            required.insert("sub".to_string());
        }
        validation.required_spec_claims = required;

        let decoded = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
            .map_err(|err| VerifyError::new(err.to_string()))?;

        Ok(decoded.claims)
    }
}

/// Verifies `token` (if any) against `options` and picks out the role claim.
///
/// No token means no claims and no role. Configuration problems are checked
/// before the verifier is consulted.
pub fn authenticate(
    verifier: &dyn TokenVerifier,
    token: Option<&str>,
    options: Option<&JwtOptions>,
) -> Result<Authenticated, AuthError> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(Authenticated::default());
    };

    let Some(options) = options else {
        return Err(AuthError::config(
            "Must provide jwtOptions when using jwt authentication",
        ));
    };

    let Some(secret) = options.secret.as_deref() else {
        return Err(AuthError::config("Not allowed to provide a JWT token."));
    };

    if options.audiences.is_some() && options.verify_options.audience.is_some() {
        return Err(AuthError::config(
            "Provide either 'jwtOptions.audiences' or 'jwtOptions.verifyOptions.audience' but not both",
        ));
    }

    let verify_options = effective_verify_options(options);
    let claims = verifier
        .verify(token, secret, &verify_options)
        .map_err(|err| {
            tracing::warn!(code = "ERR_JWT_INVALID", "bearer token rejected");
            AuthError::invalid(err.message)
        })?;

    let role = match options.role.as_deref() {
        Some(path) => claim_at_path(&claims, path),
        None => claims.get(DEFAULT_ROLE_CLAIM),
    }
    .filter(|v| !v.is_null())
    .cloned();

    Ok(Authenticated { claims, role })
}

/// The options actually handed to the verifier: `verify_options.audience`
/// wins, then `audiences`, then [`DEFAULT_AUDIENCE`].
pub fn effective_verify_options(options: &JwtOptions) -> VerifyOptions {
    let mut merged = options.verify_options.clone();
    if merged.audience.is_none() {
        merged.audience = options.audiences.clone();
    }
    if merged.audience.is_none() {
        merged.audience = Some(vec![DEFAULT_AUDIENCE.to_string()]);
    }
    merged
}

/// Walks `path` through nested claim objects.
pub fn claim_at_path<'a>(claims: &'a Claims, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = claims.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Extracts a bearer token from the `Authorization` header, if one is sent.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, AuthError> {
    let mut values = headers.get_all(header::AUTHORIZATION).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(AuthError::header(
            "There can only be one Authorization header.",
        ));
    }

    let format_error =
        || AuthError::header("Authorization header is not of the correct bearer scheme format.");

    let value = value.to_str().map_err(|_| format_error())?.trim();
    let (scheme, token) = value
        .split_once(|c: char| c.is_ascii_whitespace())
        .ok_or_else(format_error)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(format_error());
    }

    let token = token.trim();
    if !is_token68(token) {
        return Err(format_error());
    }

    Ok(Some(token.to_string()))
}

fn is_token68(s: &str) -> bool {
    let body = s.trim_end_matches('=');
    !body.is_empty()
        && body.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'+' | b'/')
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::HeaderValue;

    use super::*;

    struct CountingVerifier {
        calls: AtomicUsize,
        result: Result<Claims, VerifyError>,
    }

    impl CountingVerifier {
        fn returning(result: Result<Claims, VerifyError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result,
            }
        }
    }

    impl TokenVerifier for CountingVerifier {
        fn verify(
            &self,
            _token: &str,
            _secret: &[u8],
            _options: &VerifyOptions,
        ) -> Result<Claims, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn claims(value: Value) -> Claims {
        value.as_object().cloned().unwrap()
    }

    fn with_secret() -> JwtOptions {
        JwtOptions {
            secret: Some(b"secret".to_vec()),
            ..JwtOptions::default()
        }
    }

    #[test]
    fn missing_token_yields_empty_claims() {
        let verifier = CountingVerifier::returning(Ok(Claims::new()));
        let out = authenticate(&verifier, None, None).unwrap();
        assert!(out.claims.is_empty());
        assert_eq!(out.role, None);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn token_without_options_is_forbidden() {
        let verifier = CountingVerifier::returning(Ok(Claims::new()));
        let err = authenticate(&verifier, Some("abc.def.ghi"), None).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(
            err.message,
            "Must provide jwtOptions when using jwt authentication"
        );
    }

    #[test]
    fn token_without_secret_is_forbidden() {
        let verifier = CountingVerifier::returning(Ok(Claims::new()));
        let err =
            authenticate(&verifier, Some("abc.def.ghi"), Some(&JwtOptions::default())).unwrap_err();
        assert_eq!(err.code, "ERR_JWT_CONFIG");
        assert_eq!(err.to_string(), "Not allowed to provide a JWT token.");
    }

    #[test]
    fn conflicting_audiences_fail_before_verification() {
        let verifier = CountingVerifier::returning(Ok(Claims::new()));
        let mut options = with_secret();
        options.audiences = Some(vec!["a".to_string()]);
        options.verify_options.audience = Some(vec!["b".to_string()]);

        let err = authenticate(&verifier, Some("abc.def.ghi"), Some(&options)).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(
            err.message,
            "Provide either 'jwtOptions.audiences' or 'jwtOptions.verifyOptions.audience' but not both"
        );
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn verifier_message_passes_through_verbatim() {
        let verifier = CountingVerifier::returning(Err(VerifyError::new("jwt malformed")));
        let err = authenticate(&verifier, Some("nope"), Some(&with_secret())).unwrap_err();
        assert_eq!(err.code, "ERR_JWT_INVALID");
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.message, "jwt malformed");
    }

    #[test]
    fn role_defaults_to_top_level_role_claim() {
        let verifier = CountingVerifier::returning(Ok(claims(
            serde_json::json!({"aud": "postgraphile", "role": "editor"}),
        )));
        let out = authenticate(&verifier, Some("t"), Some(&with_secret())).unwrap();
        assert_eq!(out.role, Some(Value::String("editor".to_string())));
        assert!(out.claims.contains_key("role"));
    }

    #[test]
    fn role_follows_configured_path() {
        let verifier = CountingVerifier::returning(Ok(claims(serde_json::json!({
            "role": "ignored",
            "some": {"other": {"path": "R"}}
        }))));
        let mut options = with_secret();
        options.role = Some(vec![
            "some".to_string(),
            "other".to_string(),
            "path".to_string(),
        ]);

        let out = authenticate(&verifier, Some("t"), Some(&options)).unwrap();
        assert_eq!(out.role, Some(Value::String("R".to_string())));
    }

    #[test]
    fn missing_role_is_not_an_error() {
        let verifier = CountingVerifier::returning(Ok(claims(serde_json::json!({"a": 1}))));
        let mut options = with_secret();
        options.role = Some(vec!["x".to_string(), "y".to_string()]);
        let out = authenticate(&verifier, Some("t"), Some(&options)).unwrap();
        assert_eq!(out.role, None);
    }

    #[test]
    fn audience_defaults_in_order() {
        let mut options = with_secret();
        assert_eq!(
            effective_verify_options(&options).audience,
            Some(vec![DEFAULT_AUDIENCE.to_string()])
        );

        options.audiences = Some(vec!["api".to_string()]);
        assert_eq!(
            effective_verify_options(&options).audience,
            Some(vec!["api".to_string()])
        );

        options.audiences = None;
        options.verify_options.audience = Some(vec!["other".to_string()]);
        assert_eq!(
            effective_verify_options(&options).audience,
            Some(vec!["other".to_string()])
        );
    }

    #[test]
    fn claim_at_path_stops_at_non_objects() {
        let claims = claims(serde_json::json!({"a": {"b": "leaf"}, "c": [1, 2]}));
        let path = |p: &[&str]| p.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(
            claim_at_path(&claims, &path(&["a", "b"])),
            Some(&Value::String("leaf".to_string()))
        );
        assert_eq!(claim_at_path(&claims, &path(&["a", "b", "c"])), None);
        assert_eq!(claim_at_path(&claims, &path(&["c", "0"])), None);
        assert_eq!(claim_at_path(&claims, &[]), None);
    }

    #[test]
    fn bearer_token_is_optional() {
        assert_eq!(bearer_token(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn bearer_token_accepts_any_scheme_case() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("  BeArEr abc.DEF-_~+/ghi==  "),
        );
        assert_eq!(
            bearer_token(&headers).unwrap(),
            Some("abc.DEF-_~+/ghi==".to_string())
        );
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            err.message,
            "Authorization header is not of the correct bearer scheme format."
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer a=b"));
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn bearer_token_rejects_duplicate_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::AUTHORIZATION, HeaderValue::from_static("Bearer a"));
        headers.append(header::AUTHORIZATION, HeaderValue::from_static("Bearer b"));
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.message, "There can only be one Authorization header.");
    }
}
