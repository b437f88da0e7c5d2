//! Mutual TLS over the negotiated ICE flow.
//!
//! Component 1 of a running [`IceTransport`](crate::ice::IceTransport)
//! carries the handshake: the initiator connects with the expected peer
//! fingerprint pinned in the SNI, the responder accepts with a mandatory
//! client certificate. Both directions honor the account's certificate
//! store trust policy (wired into the rustls verifiers in
//! [`crate::crypto`]). The authenticated peer certificate is surfaced so
//! the connection manager can match it against the negotiating device.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::crypto::device_id_to_sni;
use crate::ice::IceStream;
use crate::identity::{DeviceCertificate, DeviceId};

/// Failure modes of the session handshake, kept distinguishable so the
/// negotiation layer can map them onto its public error taxonomy.
#[derive(Debug)]
pub enum TlsError {
    /// Certificate verification or protocol failure.
    HandshakeFailed(String),
    /// The authenticated peer is not the device we negotiated with.
    PeerMismatch {
        expected: DeviceId,
        actual: DeviceId,
    },
    /// The handshake did not complete within its deadline.
    Timeout,
    /// The underlying flow closed mid-handshake.
    TransportClosed,
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::HandshakeFailed(reason) => write!(f, "TLS handshake failed: {reason}"),
            TlsError::PeerMismatch { expected, actual } => write!(
                f,
                "TLS peer mismatch: expected {expected:?}, authenticated {actual:?}"
            ),
            TlsError::Timeout => write!(f, "TLS handshake timed out"),
            TlsError::TransportClosed => write!(f, "transport closed during TLS handshake"),
        }
    }
}

impl std::error::Error for TlsError {}

fn classify_io(err: std::io::Error) -> TlsError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => TlsError::TransportClosed,
        _ => TlsError::HandshakeFailed(err.to_string()),
    }
}

/// An established mutual-TLS session and its authenticated peer.
pub struct TlsSession {
    stream: TlsStream<Box<dyn IceStream>>,
    peer: DeviceCertificate,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl TlsSession {
    /// Initiator side. `expected` pins the fingerprint the server
    /// certificate must carry.
    pub async fn connect(
        config: Arc<rustls::ClientConfig>,
        expected: DeviceId,
        flow: Box<dyn IceStream>,
        timeout: Duration,
    ) -> Result<Self, TlsError> {
        let sni = ServerName::try_from(device_id_to_sni(&expected))
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
        let connector = TlsConnector::from(config);

        let stream = tokio::time::timeout(timeout, connector.connect(sni, flow))
            .await
            .map_err(|_| TlsError::Timeout)?
            .map_err(classify_io)?;

        let peer = peer_certificate(stream.get_ref().1)?;
        let session = Self {
            stream: TlsStream::Client(stream),
            peer,
        };
        session.expect_peer(expected)?;
        Ok(session)
    }

    /// Responder side. The peer must present a valid client certificate;
    /// its fingerprint is checked by the caller against the offering
    /// device.
    pub async fn accept(
        config: Arc<rustls::ServerConfig>,
        flow: Box<dyn IceStream>,
        timeout: Duration,
    ) -> Result<Self, TlsError> {
        let acceptor = TlsAcceptor::from(config);

        let stream = tokio::time::timeout(timeout, acceptor.accept(flow))
            .await
            .map_err(|_| TlsError::Timeout)?
            .map_err(classify_io)?;

        let peer = peer_certificate(stream.get_ref().1)?;
        Ok(Self {
            stream: TlsStream::Server(stream),
            peer,
        })
    }

    /// The authenticated peer certificate.
    pub fn peer(&self) -> &DeviceCertificate {
        &self.peer
    }

    /// Check the authenticated peer against the device we negotiated with.
    pub fn expect_peer(&self, expected: DeviceId) -> Result<(), TlsError> {
        let actual = self.peer.device_id();
        if actual != expected {
            return Err(TlsError::PeerMismatch { expected, actual });
        }
        Ok(())
    }

    /// Surrender the encrypted stream and the authenticated peer.
    pub fn into_parts(self) -> (TlsStream<Box<dyn IceStream>>, DeviceCertificate) {
        (self.stream, self.peer)
    }
}

fn peer_certificate(conn: &rustls::CommonState) -> Result<DeviceCertificate, TlsError> {
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| TlsError::HandshakeFailed("peer presented no certificate".into()))?;
    let end_entity = certs
        .first()
        .ok_or_else(|| TlsError::HandshakeFailed("peer certificate chain empty".into()))?;
    DeviceCertificate::from_der(end_entity.as_ref().to_vec())
        .map_err(|e| TlsError::HandshakeFailed(e.to_string()))
}
