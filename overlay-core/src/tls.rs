//! `rustls` wiring for direct links (§4.3).
//!
//! Every link is mutually authenticated at the TLS layer in the sense
//! that both sides present a certificate, but `rustls` itself performs
//! no chain validation on either end — both verifiers below accept
//! whatever is presented. Trust is decided once, after the handshake,
//! by handing the peer's leaf certificate to a
//! [`Verifier`](crate::verifier::Verifier) (see [`crate::link::verify_peer`]).

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::connector::{ConnectorError, Dialer};
use crate::controller::ControllerCommand;
use crate::friend::Friend;
use crate::identity::Identity;
use crate::link::{self, LinkError, LinkHandle, LinkOutbound};
use crate::verifier::Verifier;

/// Errors building a TLS configuration from an [`Identity`].
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// `rustls` rejected the certificate/key pair.
    #[error("invalid TLS certificate or key: {0}")]
    Config(#[from] rustls::Error),
}

/// A [`ServerCertVerifier`] that accepts any certificate the remote
/// end presents. Equivalent to the teacher's QUIC transport, which
/// skips chain validation for the same reason: certificate trust is
/// not how this protocol decides who a peer is.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// A [`ClientCertVerifier`] that requires a client certificate but
/// accepts whichever one is presented. The leaf is handed to
/// application-level [`Verifier`] once the handshake completes.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Build this node's server-side TLS config: presents `identity`'s
/// certificate and requires (but does not validate) a client cert.
///
/// # Errors
///
/// Returns [`TlsError`] if `identity`'s certificate or key is malformed.
pub fn server_config(identity: &Identity) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let cert = CertificateDer::from(identity.cert_der.clone());
    let key = PrivatePkcs8KeyDer::from(identity.key_der.clone());
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(vec![cert], key.into())?;
    Ok(Arc::new(config))
}

/// Build this node's client-side TLS config: presents `identity`'s
/// certificate and performs no server-name or chain validation.
///
/// # Errors
///
/// Returns [`TlsError`] if `identity`'s certificate or key is malformed.
pub fn client_config(identity: &Identity) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let cert = CertificateDer::from(identity.cert_der.clone());
    let key = PrivatePkcs8KeyDer::from(identity.key_der.clone());
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(vec![cert], key.into())?;
    Ok(Arc::new(config))
}

/// Dials friends over TCP, then mutually authenticates via TLS.
pub struct TcpTlsDialer {
    connector: TlsConnector,
    verifier: Arc<dyn Verifier>,
    dial_timeout: Duration,
    events: tokio::sync::mpsc::UnboundedSender<crate::link::LinkEvent>,
    controller_commands: tokio::sync::mpsc::UnboundedSender<ControllerCommand>,
}

impl TcpTlsDialer {
    /// Build a dialer presenting `client_config`, verifying the peer's
    /// certificate through `verifier`, forwarding decoded frames to
    /// `events`, and announcing every new link to the controller via
    /// `controller_commands`.
    #[must_use]
    pub fn new(
        client_config: Arc<rustls::ClientConfig>,
        verifier: Arc<dyn Verifier>,
        dial_timeout: Duration,
        events: tokio::sync::mpsc::UnboundedSender<crate::link::LinkEvent>,
        controller_commands: tokio::sync::mpsc::UnboundedSender<ControllerCommand>,
    ) -> Self {
        Self { connector: TlsConnector::from(client_config), verifier, dial_timeout, events, controller_commands }
    }
}

impl Dialer for TcpTlsDialer {
    fn dial(
        &self,
        friend: Friend,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<LinkHandle, ConnectorError>> + Send>> {
        let connector = self.connector.clone();
        let verifier = self.verifier.clone();
        let dial_timeout = self.dial_timeout;
        let events = self.events.clone();
        let controller_commands = self.controller_commands.clone();
        Box::pin(async move {
            let address = friend.address.ok_or_else(|| ConnectorError::Dial("no known address".into()))?;
            let socket = tokio::time::timeout(dial_timeout, TcpStream::connect(address))
                .await
                .map_err(|_| ConnectorError::Dial("dial timed out".into()))?
                .map_err(|e| ConnectorError::Dial(e.to_string()))?;
            let server_name = ServerName::IpAddress(address.ip().into());
            let stream = connector
                .connect(server_name, socket)
                .await
                .map_err(|e| ConnectorError::Dial(e.to_string()))?;

            let (_, session) = stream.get_ref();
            let peer_certs: Vec<&[u8]> =
                session.peer_certificates().map(|certs| certs.iter().map(AsRef::as_ref).collect()).unwrap_or_default();
            let resolved =
                link::verify_peer(Some(&peer_certs), verifier.as_ref(), Some(address)).map_err(link_error_to_dial)?;

            let handle = spawn_link(resolved, stream, events);
            let _ = controller_commands.send(ControllerCommand::ConnectionEstablished(handle.clone()));
            Ok(handle)
        })
    }
}

fn link_error_to_dial(e: LinkError) -> ConnectorError {
    ConnectorError::Dial(e.to_string())
}

/// Accept TLS connections on `listener` forever, verifying each peer
/// through `verifier` and reporting the resulting link through both
/// `connector_commands` (so the connector tracks it as live) and
/// `controller_commands` (so the controller starts routing its frames).
pub async fn run_acceptor(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    verifier: Arc<dyn Verifier>,
    events: tokio::sync::mpsc::UnboundedSender<crate::link::LinkEvent>,
    connector_commands: tokio::sync::mpsc::UnboundedSender<crate::connector::ConnectorCommand>,
    controller_commands: tokio::sync::mpsc::UnboundedSender<ControllerCommand>,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let verifier = verifier.clone();
        let events = events.clone();
        let connector_commands = connector_commands.clone();
        let controller_commands = controller_commands.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let (_, session) = stream.get_ref();
            let peer_certs: Vec<&[u8]> =
                session.peer_certificates().map(|certs| certs.iter().map(AsRef::as_ref).collect()).unwrap_or_default();
            let friend = match link::verify_peer(Some(&peer_certs), verifier.as_ref(), Some(peer_addr)) {
                Ok(friend) => friend,
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "peer rejected by verifier");
                    return;
                }
            };
            let handle = spawn_link(friend, stream, events);
            let _ = connector_commands.send(crate::connector::ConnectorCommand::ConnectionMade(handle.clone()));
            let _ = controller_commands.send(ControllerCommand::ConnectionEstablished(handle));
        });
    }
}

fn spawn_link<S>(
    friend: Friend,
    stream: S,
    events: tokio::sync::mpsc::UnboundedSender<crate::link::LinkEvent>,
) -> LinkHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel::<LinkOutbound>();
    let handle = LinkHandle::new(friend, overlay_proto::ids::ConnectionId::random(), outbound_tx);
    let (read_half, write_half) = tokio::io::split(stream);

    let reader_link = handle.clone();
    let reader_events = events;
    tokio::spawn(async move {
        link::run_reader(read_half, reader_link, reader_events).await;
    });
    tokio::spawn(async move {
        if let Err(e) = link::run_writer(write_half, outbound_rx).await {
            tracing::debug!(error = %e, "link writer task ended with an error");
        }
    });

    handle
}
