//! TLS on top of a [Connection], for peers that need confidentiality and integrity of the
//!  byte stream.
//!
//! The server presents a self-signed certificate generated at startup, and the client accepts
//!  any certificate. This protects against passive eavesdropping and tampering, but it does *not*
//!  authenticate the server.

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{client, server, TlsConnector};
use tracing::debug;
use crate::config::Profile;
use crate::connection::Connection;
use crate::end_point::{dial, Listener};
use crate::stream::ConnectionStream;

pub use tokio_rustls::TlsAcceptor;

pub const ALPN_PROTOCOL: &[u8] = b"udp-transport";

pub type ServerTlsStream = server::TlsStream<ConnectionStream>;
pub type ClientTlsStream = client::TlsStream<ConnectionStream>;

/// A certificate chain and its private key
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Generates a fresh self-signed certificate for the given host names and / or IP addresses
pub fn self_signed_identity(subject_alt_names: Vec<String>) -> anyhow::Result<Identity> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(subject_alt_names)
        .context("generating self-signed certificate")?;
    Ok(Identity {
        cert_chain: vec![cert.der().clone()],
        key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
    })
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub fn server_config(identity: Identity) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .context("invalid server certificate")?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(Arc::new(config))
}

pub fn client_config() -> anyhow::Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(Arc::new(config))
}

/// Accepts every server certificate, but still checks that the server holds the certificate's
///  private key
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Runs the server side of the TLS handshake on an accepted connection
pub async fn accept_tls(acceptor: &TlsAcceptor, connection: Arc<Connection>) -> anyhow::Result<ServerTlsStream> {
    let peer = connection.peer_addr();
    let tls = acceptor.accept(ConnectionStream::new(connection)).await
        .with_context(|| format!("TLS handshake with {:?}", peer))?;
    debug!("TLS session with {:?} established", peer);
    Ok(tls)
}

/// Runs the client side of the TLS handshake on a dialed connection
pub async fn connect_tls(connection: Arc<Connection>) -> anyhow::Result<ClientTlsStream> {
    let peer = connection.peer_addr();
    let connector = TlsConnector::from(client_config()?);
    let tls = connector.connect(ServerName::from(peer.ip()), ConnectionStream::new(connection)).await
        .with_context(|| format!("TLS handshake with {:?}", peer))?;
    debug!("TLS session with {:?} established", peer);
    Ok(tls)
}

pub async fn dial_tls(addr: SocketAddr, profile: Profile) -> anyhow::Result<ClientTlsStream> {
    let connection = dial(addr, profile).await?;
    connect_tls(connection).await
}

/// A [Listener] that completes a TLS handshake for every connection before handing it out.
///
/// Handshakes run one at a time inside `accept()`. Servers with many concurrent clients should
///  use a plain [Listener] and run [accept_tls] in a task per connection.
pub struct SecureListener {
    listener: Listener,
    acceptor: TlsAcceptor,
}

impl SecureListener {
    pub async fn bind(addr: SocketAddr, profile: Profile, identity: Identity) -> anyhow::Result<SecureListener> {
        let acceptor = TlsAcceptor::from(server_config(identity)?);
        let listener = Listener::bind(addr, profile).await?;
        Ok(SecureListener { listener, acceptor })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> anyhow::Result<ServerTlsStream> {
        let connection = self.listener.accept().await?;
        accept_tls(&self.acceptor, connection).await
    }
}
