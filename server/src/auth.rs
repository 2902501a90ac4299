//! Pluggable connect-time authentication.
//!
//! The transport hands the upgrade request's query parameters and headers to
//! an [`Authenticator`] picked from configuration. Authentication only
//! answers "may this session connect"; user identity comes from the `id`
//! query parameter afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::Config;

/// The parts of the upgrade request an authenticator may inspect. Header
/// names are stored lowercase.
#[derive(Debug, Default, Clone)]
pub struct ConnectRequest {
    params: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new(params: HashMap<String, String>, headers: HashMap<String, String>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self { params, headers }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }
}

pub trait Authenticator: Send + Sync {
    fn validate(&self, request: &ConnectRequest) -> bool;
}

/// Accepts every connection.
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn validate(&self, _request: &ConnectRequest) -> bool {
        true
    }
}

/// `Authorization: Basic base64(username:password)`.
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for BasicAuth {
    fn validate(&self, request: &ConnectRequest) -> bool {
        let Some(encoded) = request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        credentials == format!("{}:{}", self.username, self.password)
    }
}

/// `Authorization: Bearer <token>`, with a `?token=` query fallback for
/// clients that cannot set headers on the upgrade request.
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for BearerAuth {
    fn validate(&self, request: &ConnectRequest) -> bool {
        if let Some(token) = request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
        {
            return token.trim() == self.token;
        }
        request.param("token") == Some(self.token.as_str())
    }
}

/// Build the configured authenticator. Unknown types fall back to `noauth`
/// with a warning rather than locking everyone out with a typo.
pub fn create_from_config(config: &Config) -> Arc<dyn Authenticator> {
    match config.auth_type.as_str() {
        "noauth" => Arc::new(NoAuth),
        "basic" => Arc::new(BasicAuth::new(
            config.auth_basic_username.clone().unwrap_or_default(),
            config.auth_basic_password.clone().unwrap_or_default(),
        )),
        "bearer" => Arc::new(BearerAuth::new(
            config.auth_bearer_token.clone().unwrap_or_default(),
        )),
        other => {
            tracing::warn!(auth_type = other, "unknown auth type, using noauth");
            Arc::new(NoAuth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(params: &[(&str, &str)], headers: &[(&str, &str)]) -> ConnectRequest {
        ConnectRequest::new(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn noauth_accepts_everything() {
        assert!(NoAuth.validate(&request(&[], &[])));
    }

    #[test]
    fn basic_auth_checks_credentials() {
        let auth = BasicAuth::new("user", "secret");
        let encoded = STANDARD.encode("user:secret");

        assert!(auth.validate(&request(
            &[],
            &[("Authorization", &format!("Basic {encoded}"))]
        )));

        let wrong = STANDARD.encode("user:nope");
        assert!(!auth.validate(&request(
            &[],
            &[("Authorization", &format!("Basic {wrong}"))]
        )));
        assert!(!auth.validate(&request(&[], &[])));
        assert!(!auth.validate(&request(&[], &[("Authorization", "Basic not-base64!")])));
    }

    #[test]
    fn bearer_auth_accepts_header_or_param() {
        let auth = BearerAuth::new("tok123");
        assert!(auth.validate(&request(&[], &[("authorization", "Bearer tok123")])));
        assert!(auth.validate(&request(&[("token", "tok123")], &[])));
        assert!(!auth.validate(&request(&[("token", "bad")], &[])));
        assert!(!auth.validate(&request(&[], &[])));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let auth = BearerAuth::new("tok");
        assert!(auth.validate(&request(&[], &[("AUTHORIZATION", "Bearer tok")])));
    }
}
