//! Health check protocols and the probe driver.
//!
//! A protocol only knows what to send and how to judge the answer. The
//! connection handling, timeouts and cleanup live in [`probe`], which is the
//! same for every protocol.

use crate::config::{HealthCheckConfig, HealthCheckType};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Largest response we read while probing.
const MAX_RESPONSE_BYTES: u64 = 4096;

/// Why a probe failed. Never fatal; it only moves the peer's state machine.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed before a response was received")]
    EmptyResponse,

    #[error("unexpected response: {0}")]
    Mismatch(String),
}

/// A health check protocol.
pub trait CheckProtocol: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Bytes written right after connecting, if any.
    fn request(&self) -> Option<&[u8]> {
        None
    }

    /// Whether a response line must be read and validated.
    fn expects_response(&self) -> bool {
        true
    }

    /// Judge the first response line (terminator included, if one was read).
    fn validate(&self, response: &[u8]) -> Result<(), ProbeError>;
}

/// Success means the TCP handshake completed.
#[derive(Debug, Clone, Default)]
pub struct TcpConnect;

impl CheckProtocol for TcpConnect {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn expects_response(&self) -> bool {
        false
    }

    fn validate(&self, _response: &[u8]) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Line-oriented text protocol check.
///
/// Optionally sends a line, then requires the first line the server answers
/// with to start with `expect`. Greeting-based protocols (SMTP, POP3, IMAP)
/// are this check with nothing to send.
#[derive(Debug, Clone)]
pub struct LineMatch {
    name: &'static str,
    request: Option<Vec<u8>>,
    expect: String,
}

impl LineMatch {
    /// Build a check; `send` gets a CRLF appended when it has no terminator.
    pub fn new(send: Option<&str>, expect: impl Into<String>) -> Self {
        let request = send.map(|line| {
            let mut bytes = line.as_bytes().to_vec();
            if !line.ends_with('\n') {
                bytes.extend_from_slice(b"\r\n");
            }
            bytes
        });

        Self {
            name: "line",
            request,
            expect: expect.into(),
        }
    }

    pub fn smtp() -> Self {
        Self::greeting("smtp", "220")
    }

    pub fn pop3() -> Self {
        Self::greeting("pop3", "+OK")
    }

    pub fn imap() -> Self {
        Self::greeting("imap", "* OK")
    }

    fn greeting(name: &'static str, expect: &str) -> Self {
        Self {
            name,
            request: None,
            expect: expect.to_string(),
        }
    }
}

impl CheckProtocol for LineMatch {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request(&self) -> Option<&[u8]> {
        self.request.as_deref()
    }

    fn validate(&self, response: &[u8]) -> Result<(), ProbeError> {
        if response.starts_with(self.expect.as_bytes()) {
            Ok(())
        } else {
            Err(ProbeError::Mismatch(format!(
                "expected prefix {:?}, got {:?}",
                self.expect,
                String::from_utf8_lossy(response).trim_end()
            )))
        }
    }
}

/// Sends a `GET` and checks the status code of the response.
#[derive(Debug, Clone)]
pub struct HttpStatus {
    request: Vec<u8>,
    expected_status: u16,
}

impl HttpStatus {
    pub fn new(path: &str, expected_status: u16) -> Self {
        let request =
            format!("GET {path} HTTP/1.0\r\nUser-Agent: tcplb-health-check\r\nConnection: close\r\n\r\n");
        Self {
            request: request.into_bytes(),
            expected_status,
        }
    }
}

impl CheckProtocol for HttpStatus {
    fn name(&self) -> &'static str {
        "http"
    }

    fn request(&self) -> Option<&[u8]> {
        Some(&self.request)
    }

    fn validate(&self, response: &[u8]) -> Result<(), ProbeError> {
        let status = parse_http_status(&String::from_utf8_lossy(response))?;
        if status == self.expected_status {
            Ok(())
        } else {
            Err(ProbeError::Mismatch(format!(
                "status {} (expected {})",
                status, self.expected_status
            )))
        }
    }
}

/// Parse HTTP status code from a status line.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    // Format: "HTTP/1.1 200 OK\r\n"
    let mut parts = response.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProbeError::Mismatch(format!("invalid status code '{code}'"))),
        _ => Err(ProbeError::Mismatch("invalid HTTP status line".to_string())),
    }
}

/// Build the protocol configured for an upstream.
pub fn from_config(config: &HealthCheckConfig) -> Result<Arc<dyn CheckProtocol>, String> {
    let protocol: Arc<dyn CheckProtocol> = match config.check_type {
        HealthCheckType::Tcp => Arc::new(TcpConnect),
        HealthCheckType::Line => {
            let expect = config
                .expect
                .as_deref()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| "line check requires a non-empty 'expect'".to_string())?;
            Arc::new(LineMatch::new(config.send.as_deref(), expect))
        }
        HealthCheckType::Http => {
            let path = config.path.as_deref().unwrap_or("/");
            if !path.starts_with('/') {
                return Err(format!("http check path '{path}' must start with '/'"));
            }
            Arc::new(HttpStatus::new(path, config.expected_status))
        }
        HealthCheckType::Smtp => Arc::new(LineMatch::smtp()),
        HealthCheckType::Pop3 => Arc::new(LineMatch::pop3()),
        HealthCheckType::Imap => Arc::new(LineMatch::imap()),
    };
    Ok(protocol)
}

/// Run one probe against `addr`.
///
/// Connects, sends the protocol's request, reads one line if the protocol
/// wants a response and validates it. Everything runs under `check_timeout`;
/// the connection is closed when this returns, whatever the outcome.
pub async fn probe(
    addr: SocketAddr,
    protocol: &dyn CheckProtocol,
    check_timeout: Duration,
) -> Result<(), ProbeError> {
    match timeout(check_timeout, run_probe(addr, protocol)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(check_timeout)),
    }
}

async fn run_probe(addr: SocketAddr, protocol: &dyn CheckProtocol) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(ProbeError::Connect)?;

    if let Some(request) = protocol.request() {
        stream.write_all(request).await?;
    }

    if !protocol.expects_response() {
        return Ok(());
    }

    let mut reader = BufReader::new(stream.take(MAX_RESPONSE_BYTES));
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(ProbeError::EmptyResponse);
    }

    protocol.validate(&line)
}
