//! Parsed request state shared by the parser and the response builder.

/// Main state of the request parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    /// Waiting for `METHOD SP target SP version`.
    #[default]
    RequestLine,
    /// Reading `Name: value` lines until the blank line.
    Header,
    /// Waiting for `Content-Length` body bytes.
    Body,
}

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

/// Fields extracted from one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Target path, always starting with `/`.
    pub url: String,
    pub version: String,
    /// `Host` header, stored verbatim.
    pub host: Option<String>,
    pub content_length: usize,
    /// Set by `Connection: keep-alive`.
    pub linger: bool,
}

impl Request {
    /// Clear all fields for the next request on the same connection.
    pub fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host = None;
        self.content_length = 0;
        self.linger = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_fields() {
        let mut request = Request {
            method: Method::Get,
            url: "/index.html".to_string(),
            version: "HTTP/1.1".to_string(),
            host: Some("localhost".to_string()),
            content_length: 12,
            linger: true,
        };

        request.reset();
        assert_eq!(request, Request::default());
        assert_eq!(CheckState::default(), CheckState::RequestLine);
    }
}
