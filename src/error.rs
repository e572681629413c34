use crate::request::ParseError;
use crate::response::Outcome;
use thiserror::Error;

/// Failures a relay session can run into.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("blocked by filter {token:?}: {target}")]
    Filtered { target: String, token: String },

    #[error("host unreachable: {0}")]
    UnresolvedHost(String),

    #[error("connection refused by {0}")]
    UpstreamRefused(String),

    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),
}

impl ProxyError {
    /// Response class the client sees for this failure. Transport failures are
    /// never reported to the client.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ProxyError::Parse(_) => Some(Outcome::NotFound),
            ProxyError::Filtered { .. } => Some(Outcome::Forbidden),
            ProxyError::UnresolvedHost(_) => Some(Outcome::NotFound),
            ProxyError::UpstreamRefused(_) => Some(Outcome::NoResponse),
            ProxyError::Transport(_) => None,
        }
    }
}
