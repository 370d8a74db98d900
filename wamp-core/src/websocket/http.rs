use std::fmt::Display;

use crate::core::types::HashMap;

/// Finds the end of an HTTP head, returning the index just past the blank line.
pub fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|i| i + 4)
}

/// The parsed head of an HTTP request or response.
///
/// Header names are normalized to lowercase. A header that appears more than once has its values
/// joined with `", "`, and the number of appearances is tracked so that handshakes can reject
/// duplicates.
#[derive(Debug, Default, Clone)]
pub struct HttpHead {
    pub status_line: String,
    headers: HashMap<String, String>,
    counts: HashMap<String, usize>,
}

impl HttpHead {
    /// Parses an HTTP head.
    ///
    /// Header values are decoded as ISO-8859-1, so parsing never fails. Lines without a colon are
    /// skipped.
    pub fn parse(data: &[u8]) -> Self {
        let raw = data.iter().map(|byte| *byte as char).collect::<String>();
        let mut lines = raw.lines();
        let status_line = lines.next().unwrap_or_default().trim().to_owned();
        let mut head = Self {
            status_line,
            ..Default::default()
        };
        for line in lines {
            let i = match line.find(':') {
                Some(i) if i > 0 => i,
                _ => continue,
            };
            let key = line[..i].trim().to_lowercase();
            let value = line[i + 1..].trim();
            match head.headers.get_mut(&key) {
                Some(existing) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                    *head.counts.entry(key).or_default() += 1;
                }
                None => {
                    head.headers.insert(key.clone(), value.to_owned());
                    head.counts.insert(key, 1);
                }
            }
        }
        head
    }

    /// Looks up a header by its lowercase name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|value| value.as_str())
    }

    /// The number of times the header appeared.
    pub fn count(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or_default()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Checks if a comma-separated header contains the token, ignoring case.
    pub fn has_token(&self, key: &str, token: &str) -> bool {
        self.header(key).is_some_and(|value| {
            value
                .split(',')
                .any(|value| value.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// The value of a WebSocket extension parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionParam {
    /// The parameter appeared without a value.
    Flag,
    Value(String),
}

impl Display for ExtensionParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag => write!(f, "true"),
            Self::Value(value) => value.fmt(f),
        }
    }
}

/// A WebSocket extension in a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    /// Parameters, keyed by lowercase name. A parameter may repeat.
    pub params: HashMap<String, Vec<ExtensionParam>>,
}

impl Extension {
    pub fn new<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            params: HashMap::default(),
        }
    }
}

/// Parses a `Sec-WebSocket-Extensions` header.
///
/// Extension names and parameter keys are lowercased. Quotes around parameter values are removed.
pub fn parse_extensions(header: &str) -> Vec<Extension> {
    let mut extensions = Vec::new();
    for extension in header.split(',').map(|s| s.trim()) {
        if extension.is_empty() {
            continue;
        }
        let mut parts = extension.split(';').map(|s| s.trim());
        let mut parsed = Extension::new(parts.next().unwrap_or_default().to_lowercase());
        for param in parts {
            let mut pieces = param.split('=').map(|s| s.trim());
            let key = pieces.next().unwrap_or_default().to_lowercase();
            let rest = pieces.collect::<Vec<_>>();
            let value = if rest.is_empty() {
                ExtensionParam::Flag
            } else {
                let value = rest.join("=");
                let value = value.strip_prefix('"').unwrap_or(&value);
                let value = value.strip_suffix('"').unwrap_or(value);
                ExtensionParam::Value(value.to_owned())
            };
            parsed.params.entry(key).or_default().push(value);
        }
        extensions.push(parsed);
    }
    extensions
}

/// Writes an HTTP error response with the given status and extra headers.
pub fn error_response(status: u16, reason: &str, headers: &[(String, String)]) -> String {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (key, value) in headers {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response
}

#[cfg(test)]
mod http_test {
    use crate::websocket::http::{
        ExtensionParam,
        HttpHead,
        find_head_end,
        parse_extensions,
    };

    #[test]
    fn finds_end_of_head() {
        pretty_assertions::assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nabc"), Some(18));
        pretty_assertions::assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn parses_headers_case_insensitively() {
        let head = HttpHead::parse(
            b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUPGRADE: WebSocket\r\nX-Thing: a\r\nx-thing: b\r\nbad line\r\n\r\n",
        );
        pretty_assertions::assert_eq!(head.status_line, "GET /ws HTTP/1.1");
        pretty_assertions::assert_eq!(head.header("host"), Some("localhost"));
        pretty_assertions::assert_eq!(head.header("x-thing"), Some("a, b"));
        pretty_assertions::assert_eq!(head.count("x-thing"), 2);
        pretty_assertions::assert_eq!(head.count("missing"), 0);
        assert!(head.has_token("upgrade", "websocket"));
    }

    #[test]
    fn parses_extension_offers() {
        let extensions = parse_extensions(
            "permessage-deflate; client_max_window_bits; server_max_window_bits=\"10\", x-webkit-deflate-frame",
        );
        pretty_assertions::assert_eq!(extensions.len(), 2);
        pretty_assertions::assert_eq!(extensions[0].name, "permessage-deflate");
        pretty_assertions::assert_eq!(
            extensions[0].params.get("client_max_window_bits"),
            Some(&vec![ExtensionParam::Flag])
        );
        pretty_assertions::assert_eq!(
            extensions[0].params.get("server_max_window_bits"),
            Some(&vec![ExtensionParam::Value("10".to_owned())])
        );
        pretty_assertions::assert_eq!(extensions[1].name, "x-webkit-deflate-frame");
        assert!(extensions[1].params.is_empty());
    }
}
