//! Per-connection relay: parse, filter, connect, forward, stream back.

use crate::error::ProxyError;
use crate::request::parse_request_line;
use crate::response::{error_page, Outcome};
use crate::target;
use crate::ProxyConfig;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

const RELAY_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Parsed,
    FilterChecked,
    Connected,
    Streaming,
    Error(Outcome),
    Done,
}

/// State owned by one client connection for its whole lifetime.
pub struct Session<S> {
    id: u64,
    client: BufReader<S>,
    upstream: Option<TcpStream>,
    headers: Vec<u8>,
    outcome: Outcome,
    phase: Phase,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, client: S) -> Self {
        Self {
            id,
            client: BufReader::new(client),
            upstream: None,
            headers: Vec::new(),
            outcome: Outcome::Ok,
            phase: Phase::Start,
        }
    }

    /// Runs the session to completion. Both sockets are closed on every path,
    /// the client last.
    pub async fn run(mut self, config: &ProxyConfig) -> Result<Outcome, ProxyError> {
        let result = self.drive(config).await;

        if let Some(mut upstream) = self.upstream.take() {
            let _ = upstream.shutdown().await;
        }
        let _ = self.client.shutdown().await;
        self.advance(Phase::Done);

        result.map(|()| self.outcome)
    }

    async fn drive(&mut self, config: &ProxyConfig) -> Result<(), ProxyError> {
        let line = match self.read_line().await? {
            Some(raw) => String::from_utf8_lossy(&raw).into_owned(),
            None => String::new(),
        };
        if line.trim().is_empty() {
            debug!("[{}] Client sent no request", self.id);
            return Ok(());
        }

        let request = match parse_request_line(&line) {
            Ok(request) => request,
            Err(e) => {
                // A non-GET method is reported as such even when the rest of
                // the line is unusable.
                match line.split_whitespace().next() {
                    Some(method) if method != "GET" => {
                        debug!("[{}] Method not allowed: {} ({})", self.id, method, e);
                        self.outcome = Outcome::MethodNotAllowed;
                    }
                    _ => self.record(config, ProxyError::from(e)),
                }
                return self.write_error_page(config).await;
            }
        };
        self.advance(Phase::Parsed);
        debug!(
            "[{}] {} {} {}",
            self.id, request.method, request.target, request.version
        );

        if !request.is_get() {
            debug!("[{}] Method not allowed: {}", self.id, request.method);
            self.outcome = Outcome::MethodNotAllowed;
        }

        if let Some(token) = config.filter.matching_token(&request.target) {
            self.record(
                config,
                ProxyError::Filtered {
                    target: request.target.clone(),
                    token: token.to_string(),
                },
            );
        }
        self.advance(Phase::FilterChecked);

        if !self.outcome.is_ok() {
            return self.write_error_page(config).await;
        }

        let address = match target::resolve(&request.target, config.connect_timeout).await {
            Ok((address, upstream)) => {
                self.upstream = Some(upstream);
                address
            }
            Err(e) if e.outcome().is_some() => {
                self.record(config, e);
                return self.write_error_page(config).await;
            }
            Err(e) => return Err(e),
        };
        self.advance(Phase::Connected);

        while let Some(line) = self.read_line().await? {
            if line.is_empty() {
                break;
            }
            self.headers.extend_from_slice(&line);
            self.headers.extend_from_slice(b"\r\n");
        }

        let Some(upstream) = self.upstream.as_mut() else {
            return Ok(());
        };

        debug!("[{}] GET {} via {}", self.id, address.path, address);
        upstream
            .write_all(&address.upstream_request(&self.headers))
            .await?;
        upstream.flush().await?;
        self.phase = Phase::Streaming;
        debug!("[{}] Connected -> Streaming", self.id);

        let mut buf = [0u8; RELAY_CHUNK_SIZE];
        loop {
            let n = upstream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.client.write_all(&buf[..n]).await?;
            config
                .stats
                .bytes_relayed
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        self.client.flush().await?;

        Ok(())
    }

    fn advance(&mut self, phase: Phase) {
        debug!("[{}] {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    /// Overwrites the outcome with the one `err` maps to. Later checks win.
    fn record(&mut self, config: &ProxyConfig, err: ProxyError) {
        let Some(outcome) = err.outcome() else {
            return;
        };

        match outcome {
            Outcome::Forbidden => {
                config.stats.blocked.fetch_add(1, Ordering::Relaxed);
                info!("🚫 [{}] {}", self.id, err);
            }
            Outcome::NotFound => {
                config.stats.not_found.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] {}", self.id, err);
            }
            Outcome::NoResponse => {
                config.stats.refused.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] {}", self.id, err);
            }
            Outcome::Ok | Outcome::MethodNotAllowed => {}
        }

        self.outcome = outcome;
    }

    async fn write_error_page(&mut self, config: &ProxyConfig) -> Result<(), ProxyError> {
        self.advance(Phase::Error(self.outcome));

        if let Some(page) = error_page(self.outcome, config.reject_non_get) {
            self.client.write_all(&page).await?;
            self.client.flush().await?;
        }

        Ok(())
    }

    /// Reads one raw line without its terminator. `None` at end of stream.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, ProxyError> {
        let mut raw = Vec::new();
        if self.client.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }

        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }

        Ok(Some(raw))
    }
}

/// Serves one accepted connection and closes it.
pub async fn handle_connection<S>(
    client: S,
    id: u64,
    config: &ProxyConfig,
) -> Result<Outcome, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Session::new(id, client).run(config).await
}
