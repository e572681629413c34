use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty request line")]
    Empty,

    #[error("missing request target in {0:?}")]
    MissingTarget(String),

    #[error("missing HTTP version in {0:?}")]
    MissingVersion(String),
}

/// First line of a client request: `<method> <target> <version>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// Splits a request line into its three tokens. Never panics; any input that
/// does not carry a method, a target and an `HTTP...` version is a `ParseError`.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let mut parts = line.split_whitespace();

    let method = parts.next().ok_or(ParseError::Empty)?;

    let target = match parts.next() {
        Some(t) if !t.starts_with("HTTP") => t,
        _ => return Err(ParseError::MissingTarget(line.to_string())),
    };

    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP"))
        .ok_or_else(|| ParseError::MissingVersion(line.to_string()))?;

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}
