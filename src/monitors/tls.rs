//! TLS certificate inspection for https checks
//!
//! Completes a verified handshake with the target and reads the leaf
//! certificate's `notAfter`. A handshake the server or the verifier rejects
//! marks the endpoint invalid; an unreachable host yields no verdict.

use anyhow::{Context, Result};
use chrono::Utc;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SECONDS_PER_DAY: i64 = 86_400;

/// Certificate verdict for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsInfo {
    pub valid: bool,
    pub expiry_days: Option<i64>,
}

pub struct TlsInspector {
    config: Arc<ClientConfig>,
}

impl TlsInspector {
    /// Trust the platform's root certificates
    pub fn native() -> Result<Self> {
        let loaded = rustls_native_certs::load_native_certs();
        for error in &loaded.errors {
            debug!("Skipping native root certificates: {}", error);
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        debug!(added, ignored, "Loaded native root certificates");
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("Failed to configure TLS protocol versions")?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Inspect the certificate served at `host:port`
    pub fn inspect(&self, host: &str, port: u16) -> Option<TlsInfo> {
        match self.handshake(host, port) {
            Ok(not_after) => Some(TlsInfo {
                valid: true,
                expiry_days: not_after.map(|at| expiry_days(at, Utc::now().timestamp())),
            }),
            // rustls reports protocol and certificate failures as InvalidData
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                debug!(host, port, "TLS handshake rejected: {}", e);
                Some(TlsInfo {
                    valid: false,
                    expiry_days: None,
                })
            }
            Err(e) => {
                debug!(host, port, "TLS inspection failed: {}", e);
                None
            }
        }
    }

    /// Handshake and return the leaf certificate's `notAfter` as a unix timestamp
    fn handshake(&self, host: &str, port: u16) -> io::Result<Option<i64>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        let mut connection = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}", host)))?;
        let mut socket = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        socket.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        while connection.is_handshaking() {
            connection.complete_io(&mut socket)?;
        }

        Ok(connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| not_after(leaf.as_ref())))
    }
}

fn not_after(der: &[u8]) -> Option<i64> {
    x509_parser::parse_x509_certificate(der)
        .ok()
        .map(|(_, certificate)| certificate.validity().not_after.timestamp())
}

/// Whole days until `not_after`, negative once expired
pub fn expiry_days(not_after: i64, now: i64) -> i64 {
    (not_after - now).div_euclid(SECONDS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_expiry_days() {
        let now = 1_700_000_000;
        assert_eq!(expiry_days(now + 10 * SECONDS_PER_DAY + 3600, now), 10);
        assert_eq!(expiry_days(now + SECONDS_PER_DAY - 1, now), 0);
        assert_eq!(expiry_days(now, now), 0);
        assert_eq!(expiry_days(now - 3600, now), -1);
        assert_eq!(expiry_days(now - 3 * SECONDS_PER_DAY, now), -3);
    }

    #[test]
    fn test_garbage_certificate_has_no_expiry() {
        assert_eq!(not_after(b"not a certificate"), None);
    }

    #[test]
    fn test_plaintext_server_is_invalid() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hello = [0u8; 4096];
            let _ = stream.read(&mut hello);
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
            thread::sleep(Duration::from_millis(200));
        });

        let inspector = TlsInspector::with_roots(RootCertStore::empty()).unwrap();
        let info = inspector.inspect("127.0.0.1", port);
        server.join().unwrap();

        assert_eq!(
            info,
            Some(TlsInfo {
                valid: false,
                expiry_days: None
            })
        );
    }

    #[test]
    fn test_unreachable_host_has_no_verdict() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let inspector = TlsInspector::with_roots(RootCertStore::empty()).unwrap();
        assert_eq!(inspector.inspect("127.0.0.1", port), None);
    }
}
