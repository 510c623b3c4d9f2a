const CSRF_COOKIE: &str = "cirrus_csrf";

/// How requests authenticate against the drive API. Session cookies are the
/// preferred mode; a bearer token is accepted as a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Session { cookie: String, csrf_token: String },
    Bearer(String),
}

impl AuthMode {
    /// Builds session auth from a raw `Cookie` header value, extracting the
    /// CSRF token from the `cirrus_csrf` cookie it must contain.
    pub fn session_from_cookies(cookie: impl Into<String>) -> Option<Self> {
        let cookie = cookie.into();
        let csrf_token = cookie.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == CSRF_COOKIE).then(|| value.to_string())
        })?;
        Some(Self::Session { cookie, csrf_token })
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthMode::Session { cookie, csrf_token } => request
                .header("Cookie", cookie)
                .header("X-Csrf-Token", csrf_token),
            AuthMode::Bearer(token) => request.header("Authorization", format!("Bearer {token}")),
        }
    }
}
