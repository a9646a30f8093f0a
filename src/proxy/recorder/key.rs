use http::Method;

/// Sessions derived from an Authorization credential are capped at this many
/// characters; longer values keep only their leading characters.
pub const MAX_SESSION_CHARS: usize = 100;

/// Session used when the request carries no usable Authorization header.
pub const ANONYMOUS_SESSION: &str = "anonymous";

const JSON_MEDIA_TYPE: &str = "application/json";
pub(super) const JSON_EXTENSION: &str = "json";
pub(super) const FALLBACK_EXTENSION: &str = "bin";

/// Snapshot of the request facts the recorder keys on, taken once at the
/// transport boundary.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: Method,
    /// Full request path including the query string, verbatim.
    pub target: String,
    pub authorization: Option<String>,
    pub accept: Option<String>,
}

/// Identity of one recordable request/response pair.
///
/// Two requests with the same session, method, and url always resolve to the
/// same key; nothing else about the request participates. The url is an
/// opaque string: trailing slashes, query parameter order, and case all
/// produce distinct keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    session: String,
    method: String,
    url: String,
    extension: &'static str,
}

impl CacheKey {
    /// Derive a key from a request snapshot. Total: absent headers fall back
    /// to the anonymous session and the default extension.
    pub fn derive(facts: &RequestFacts) -> Self {
        // An empty Authorization value counts as absent so the session
        // component is never empty.
        let session = match facts
            .authorization
            .as_deref()
            .filter(|value| !value.is_empty())
        {
            Some(value) => truncate_chars(value, MAX_SESSION_CHARS),
            None => ANONYMOUS_SESSION.to_string(),
        };

        let extension = match facts.accept.as_deref() {
            Some(accept) if accept.contains(JSON_MEDIA_TYPE) => JSON_EXTENSION,
            _ => FALLBACK_EXTENSION,
        };

        Self {
            session,
            method: facts.method.as_str().to_ascii_uppercase(),
            url: facts.target.clone(),
            extension,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn extension(&self) -> &'static str {
        self.extension
    }

    pub fn is_json(&self) -> bool {
        self.extension == JSON_EXTENSION
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
