//! Blocking HTTP access to printer status pages.
//!
//! - Blocking client using `ureq` (no async).
//! - One `HttpSession` per device: a fresh agent, never shared between
//!   devices, released when the session is dropped.
//! - Transport failures are mapped to `PageError` so the collector can
//!   classify them without knowing about `ureq`.

use http::StatusCode;
use log::debug;
use std::io::ErrorKind;
use std::time::Duration;

const USER_AGENT: &str = concat!("toner-watch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum PageError {
    /// Name resolution or connection establishment failed.
    Offline(String),
    Timeout(String),
    Http { status: u16, url: String },
    Transport(String),
}

impl core::fmt::Display for PageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageError::Offline(s) => write!(f, "unreachable: {}", s),
            PageError::Timeout(s) => write!(f, "timed out: {}", s),
            PageError::Http { status, url } => {
                let reason = StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown status");
                write!(f, "http {} {} for {}", status, reason, url)
            }
            PageError::Transport(s) => write!(f, "transport error: {}", s),
        }
    }
}

impl std::error::Error for PageError {}

/// A browsing session bound to one device.
pub trait Session {
    fn fetch(&mut self, url: &str) -> Result<String, PageError>;
}

/// Opens sessions; shared by all collector workers.
pub trait Connector: Sync {
    type Session: Session;

    fn open(&self, address: &str) -> Self::Session;
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    page_timeout: Duration,
}

impl HttpConnector {
    pub fn new(page_timeout: Duration) -> Self {
        HttpConnector { page_timeout }
    }
}

impl Connector for HttpConnector {
    type Session = HttpSession;

    fn open(&self, address: &str) -> HttpSession {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(self.page_timeout))
            .build();
        HttpSession {
            agent: ureq::Agent::new_with_config(config),
            address: address.to_string(),
            requests: 0,
        }
    }
}

pub struct HttpSession {
    agent: ureq::Agent,
    address: String,
    requests: u32,
}

impl Session for HttpSession {
    fn fetch(&mut self, url: &str) -> Result<String, PageError> {
        self.requests += 1;
        let mut resp = self
            .agent
            .get(url)
            .header("Accept", "text/html")
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| classify(e, url))?;
        resp.body_mut().read_to_string().map_err(|e| classify(e, url))
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        debug!(
            "Session for {} released after {} request(s)",
            self.address, self.requests
        );
    }
}

fn classify(err: ureq::Error, url: &str) -> PageError {
    let message = format!("{}: {}", url, err);
    match &err {
        ureq::Error::StatusCode(status) => PageError::Http {
            status: *status,
            url: url.to_string(),
        },
        ureq::Error::Timeout(_) => PageError::Timeout(message),
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => PageError::Offline(message),
        ureq::Error::Io(io) => match io.kind() {
            ErrorKind::TimedOut => PageError::Timeout(message),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable => PageError::Offline(message),
            _ => PageError::Transport(message),
        },
        _ => PageError::Transport(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_transport_failures() {
        assert!(matches!(
            classify(ureq::Error::HostNotFound, "http://10.0.0.9/"),
            PageError::Offline(_)
        ));
        assert!(matches!(
            classify(ureq::Error::ConnectionFailed, "http://10.0.0.9/"),
            PageError::Offline(_)
        ));
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify(ureq::Error::Io(refused), "http://10.0.0.9/"),
            PageError::Offline(_)
        ));
        let slow = std::io::Error::new(ErrorKind::TimedOut, "slow");
        assert!(matches!(
            classify(ureq::Error::Io(slow), "http://10.0.0.9/"),
            PageError::Timeout(_)
        ));
    }

    #[test]
    fn keeps_http_status() {
        match classify(ureq::Error::StatusCode(404), "http://10.0.0.9/x") {
            PageError::Http { status, url } => {
                assert_eq!(status, 404);
                assert_eq!(url, "http://10.0.0.9/x");
            }
            other => panic!("unexpected: {other}"),
        }
        let shown = PageError::Http {
            status: 503,
            url: "http://10.0.0.9/".into(),
        }
        .to_string();
        assert!(shown.contains("Service Unavailable"), "{shown}");
    }
}
