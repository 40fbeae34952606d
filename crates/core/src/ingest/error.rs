use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    Connection,
    /// HTTP 429 or a vendor "too many requests" message code.
    RateLimited,
    Server(u16),
    Client(u16),
    /// Body could not be decoded into the expected shape.
    Decode,
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub symbol: String,
    pub detail: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, symbol: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, symbol: &str, body: &str) -> Self {
        let code = status.as_u16();
        let kind = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderErrorKind::RateLimited
        } else if status.is_server_error() {
            ProviderErrorKind::Server(code)
        } else {
            ProviderErrorKind::Client(code)
        };
        Self::new(kind, symbol, truncate(body, 300))
    }

    pub fn from_reqwest(err: &reqwest::Error, symbol: &str) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ProviderErrorKind::Connection
        } else if err.is_decode() || err.is_body() {
            ProviderErrorKind::Decode
        } else {
            match err.status() {
                Some(status) if status.is_server_error() => {
                    ProviderErrorKind::Server(status.as_u16())
                }
                Some(status) => ProviderErrorKind::Client(status.as_u16()),
                None => ProviderErrorKind::Connection,
            }
        };
        Self::new(kind, symbol, err.to_string())
    }

    /// Timeouts, dropped connections, throttling and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::Connection
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::Server(_)
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "provider error (symbol={}, kind={:?}): {}",
            self.symbol, self.kind, self.detail
        )
    }
}

impl std::error::Error for ProviderError {}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn classifies_http_statuses() {
        let e = ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "005930", "slow down");
        assert_eq!(e.kind, ProviderErrorKind::RateLimited);
        assert!(e.is_transient());

        let e = ProviderError::from_status(StatusCode::BAD_GATEWAY, "005930", "");
        assert_eq!(e.kind, ProviderErrorKind::Server(502));
        assert!(e.is_transient());

        let e = ProviderError::from_status(StatusCode::NOT_FOUND, "005930", "");
        assert_eq!(e.kind, ProviderErrorKind::Client(404));
        assert!(!e.is_transient());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let e = ProviderError::from_status(StatusCode::BAD_REQUEST, "1", &body);
        assert!(e.detail.chars().count() <= 301);
    }
}
