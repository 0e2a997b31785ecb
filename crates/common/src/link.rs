//! TCP/TLS link abstraction
//!
//! A [`Link`] is one established, bidirectional byte-stream connection.
//! It is a tagged variant over plain TCP and TLS; callers never branch on
//! the tag, they read and write through the `AsyncRead`/`AsyncWrite` impls
//! or the `send_all`/`recv_all` helpers.
//!
//! Handshake-phase operations (connect, accept, the OP header exchange) are
//! expected to be wrapped in [`HANDSHAKE_TIMEOUT`]; forwarding-phase I/O
//! runs without a deadline.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsConnector, TlsStream};
use tracing::{debug, trace};

pub use tokio_rustls::TlsAcceptor;

/// Socket deadline applied around connection setup and OP header exchanges.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// One established connection, encrypted or not.
#[derive(Debug)]
pub enum Link {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Link {
    /// Connect to a server, optionally upgrading to TLS.
    ///
    /// Applies [`HANDSHAKE_TIMEOUT`] to both the TCP connect and the TLS
    /// handshake and enables `TCP_NODELAY`.
    pub async fn connect(addr: SocketAddr, tls: Option<&TlsClientSetup>) -> io::Result<Link> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        trace!("Client connect - {}", addr);

        match tls {
            None => Ok(Link::Tcp(stream)),
            Some(setup) => {
                let name = ServerName::from(addr.ip());
                let tls_stream = timeout(HANDSHAKE_TIMEOUT, setup.connector.connect(name, stream))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
                    })??;
                Ok(Link::Tls(Box::new(TlsStream::Client(tls_stream))))
            }
        }
    }

    /// Wrap an accepted TCP stream, optionally running the server-side TLS
    /// handshake.
    pub async fn accept(stream: TcpStream, acceptor: Option<&TlsAcceptor>) -> io::Result<Link> {
        stream.set_nodelay(true)?;
        match acceptor {
            None => Ok(Link::Tcp(stream)),
            Some(acceptor) => {
                let tls_stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
                    })??;
                Ok(Link::Tls(Box::new(TlsStream::Server(tls_stream))))
            }
        }
    }

    /// Write the whole buffer or fail.
    pub async fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    /// Fill the whole buffer or fail.
    pub async fn recv_all(&mut self, data: &mut [u8]) -> io::Result<()> {
        self.read_exact(data).await.map(|_| ())
    }

    /// Half-close the sending side (FIN, or TLS close_notify).
    pub async fn shut(&mut self) {
        if let Err(e) = AsyncWriteExt::shutdown(self).await {
            debug!("Link shutdown: {}", e);
        }
    }
}

impl AsyncRead for Link {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Link::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Link::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_flush(cx),
            Link::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Link::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A link travelling through the (Clone) event bus to its one consumer.
pub type SharedLink = Arc<Mutex<Option<Link>>>;

pub fn share_link(link: Link) -> SharedLink {
    Arc::new(Mutex::new(Some(link)))
}

/// Take the link out of its shared slot; `None` if already consumed.
pub fn take_link(shared: &SharedLink) -> Option<Link> {
    shared.lock().ok()?.take()
}

/// Client-side TLS material, built once from the configuration.
#[derive(Clone)]
pub struct TlsClientSetup {
    connector: TlsConnector,
}

impl TlsClientSetup {
    /// Build from a CA bundle path. An empty path disables server
    /// certificate verification.
    pub fn new(ca_path: &str) -> anyhow::Result<Self> {
        let config = if ca_path.is_empty() {
            debug!("Server verification disabled");
            let provider = default_provider();
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(Path::new(ca_path))? {
                roots
                    .add(cert)
                    .context("Failed to add CA certificate to root store")?;
            }
            if roots.is_empty() {
                return Err(anyhow!("No CA certificates found in {}", ca_path));
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

/// Build the server-side TLS acceptor from certificate and key paths.
///
/// The key must be an unencrypted PEM (PKCS#8, PKCS#1 or SEC1).
pub fn build_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(Path::new(cert_path))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", cert_path));
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("Keyfile parsing [{}] failed", key_path))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
        .with_context(|| format!("Keyfile parsing [{}] failed", key_path))?
        .ok_or_else(|| anyhow!("No private key found in {}", key_path))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to set certificates")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Certificate parsing [{}] failed", path.display()))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut io::BufReader::new(file)).collect();
    certs.with_context(|| format!("Certificate parsing [{}] failed", path.display()))
}

fn default_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider()))
}

/// Accept-anything certificate verifier for the empty-`ca_path` mode.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
