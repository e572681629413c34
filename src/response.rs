/// Classified result of processing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    MethodNotAllowed,
    NotFound,
    NoResponse,
    Forbidden,
}

const METHOD_NOT_ALLOWED_STATUS: &str = "405 Method Not Allowed";

impl Outcome {
    /// Status text for the synthesized page. `MethodNotAllowed` has none unless
    /// the caller opts in to 405 replies.
    pub fn status(self, reject_non_get: bool) -> Option<&'static str> {
        match self {
            Outcome::Ok => None,
            Outcome::MethodNotAllowed if reject_non_get => Some(METHOD_NOT_ALLOWED_STATUS),
            Outcome::MethodNotAllowed => None,
            Outcome::NotFound => Some("404 Not Found"),
            Outcome::NoResponse => Some("444 No Response"),
            Outcome::Forbidden => Some("403 Forbidden"),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Outcome::Ok
    }
}

/// Builds the minimal HTTP/1.0 error page for `outcome`, or `None` when no
/// response is written for it.
pub fn error_page(outcome: Outcome, reject_non_get: bool) -> Option<Vec<u8>> {
    let status = outcome.status(reject_non_get)?;
    Some(
        format!(
            "HTTP/1.0 {status}\r\n\r\n<!DOCTYPE html><html><body><h1>{status}</h1></body></html>"
        )
        .into_bytes(),
    )
}
