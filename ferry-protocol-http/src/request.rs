use std::fmt::Write;

use ferry_core::aio::ReaderFactory;
use http::header::{CONNECTION, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use url::Url;

/// Where a request goes: the connection it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub fn from_url(url: &Url) -> Option<Self> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => return None,
        };
        Some(Self {
            host: url
                .host_str()?
                .trim_matches(|c| c == '[' || c == ']')
                .to_owned(),
            port: url.port_or_known_default()?,
            tls,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    /// Sent in addition to `Host`, `User-Agent`, `Connection` and the body
    /// length
    pub headers: HeaderMap,
    pub body: Option<ReaderFactory>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|v| !v.eq_ignore_ascii_case("close"))
    }

    /// `path?query` as it goes into the request line.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_owned(),
        }
    }

    fn host_header(&self) -> String {
        let host = match self.url.host() {
            Some(url::Host::Ipv6(addr)) => format!("[{addr}]"),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }

    /// Request line and headers, terminated by the empty line.
    pub fn head(&self, body_length: Option<u64>) -> String {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.request_target());
        let mut line = |name: &str, value: &str| {
            let _ = write!(head, "{name}: {value}\r\n");
        };
        if !self.headers.contains_key(HOST) {
            line("Host", &self.host_header());
        }
        if !self.headers.contains_key(USER_AGENT) {
            line("User-Agent", concat!("ferry/", env!("CARGO_PKG_VERSION")));
        }
        if !self.headers.contains_key(CONNECTION) {
            line("Connection", "keep-alive");
        }
        for (name, value) in &self.headers {
            line(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }
        if let Some(length) = body_length {
            line("Content-Length", &length.to_string());
        }
        head.push_str("\r\n");
        head
    }

    /// Asks for the body from `offset` on.
    pub fn set_range(&mut self, offset: u64) {
        if offset == 0 {
            self.headers.remove(http::header::RANGE);
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&format!("bytes={offset}-")) {
            self.headers.insert(http::header::RANGE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn head_layout() {
        let mut request = HttpRequest::new(Method::GET, url("http://example.com:8080/a%20b?x=1"));
        request.set_range(10);
        let head = request.head(None);
        let lines: Vec<_> = head.split("\r\n").collect();
        assert_eq!(lines[0], "GET /a%20b?x=1 HTTP/1.1");
        assert!(lines.contains(&"Host: example.com:8080"));
        assert!(lines.contains(&"Connection: keep-alive"));
        assert!(lines.contains(&"range: bytes=10-"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn default_ports_are_left_out_of_host() {
        let request = HttpRequest::new(Method::PUT, url("https://[::1]/f"));
        let head = request.head(Some(3));
        assert!(head.contains("Host: [::1]\r\n"));
        assert!(head.contains("Content-Length: 3\r\n"));
    }

    #[test]
    fn targets() {
        assert_eq!(
            Target::from_url(&url("https://Example.com/x")),
            Some(Target {
                host: "example.com".into(),
                port: 443,
                tls: true
            })
        );
        assert_eq!(Target::from_url(&url("ftp://example.com/x")), None);
    }

    #[test]
    fn close_disables_keep_alive() {
        let mut request = HttpRequest::new(Method::GET, url("http://example.com/"));
        assert!(request.keep_alive());
        request
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!request.keep_alive());
        assert!(request.head(None).contains("connection: close\r\n"));
    }
}
