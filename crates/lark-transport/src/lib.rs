// TCP transport with optional TLS upgrade. The transport is a byte conduit:
// it never interprets protocol traffic.
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 4222;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint address: {0}")]
    BadAddress(String),
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("connection closed by peer")]
    Eof,
    #[error("tls failure: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a connection to an endpoint is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext TCP; a TLS upgrade request is a no-op.
    Plain,
    /// TLS with certificate verification against the caller's roots.
    Tls,
    /// TLS without certificate verification (self-signed/dev servers).
    OpenTls,
}

/// A resolved server address.
///
/// ```
/// use lark_transport::{Endpoint, Scheme};
///
/// let endpoint: Endpoint = "tls://broker.example:4443".parse().expect("endpoint");
/// assert_eq!(endpoint.scheme, Scheme::Tls);
/// assert_eq!(endpoint.port, 4443);
/// assert_eq!(endpoint.to_string(), "tls://broker.example:4443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    // Accepts `scheme://host:port`, `host:port`, or a bare host. Discovered
    // addresses arrive without a scheme and default to plaintext.
    fn from_str(input: &str) -> Result<Self> {
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "plain" | "nats" => Scheme::Plain,
                    "tls" => Scheme::Tls,
                    "opentls" => Scheme::OpenTls,
                    other => {
                        return Err(TransportError::BadAddress(format!(
                            "unknown scheme {other:?} in {input:?}"
                        )));
                    }
                };
                (scheme, rest)
            }
            None => (Scheme::Plain, input),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    TransportError::BadAddress(format!("bad port in {input:?}"))
                })?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(TransportError::BadAddress(input.to_string()));
        }
        Ok(Self::new(scheme, host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Plain => "plain",
            Scheme::Tls => "tls",
            Scheme::OpenTls => "opentls",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

// Plaintext or TLS-wrapped stream behind one poll surface.
#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub type TransportReader = ReadHalf<Transport>;
pub type TransportWriter = WriteHalf<Transport>;

/// An established byte stream to one endpoint.
///
/// The TLS upgrade is performed before the stream is split, so exactly one
/// reader half and one writer half exist per open transport.
#[derive(Debug)]
pub struct Transport {
    stream: Stream,
    endpoint: Endpoint,
}

impl Transport {
    /// Open a TCP connection, bounded by `timeout`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let addr = endpoint.addr();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.clone()))??;
        stream.set_nodelay(true)?;
        debug!(endpoint = %endpoint, "transport connected");
        Ok(Self {
            stream: Stream::Tcp(stream),
            endpoint: endpoint.clone(),
        })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Upgrade the stream to TLS.
    ///
    /// No-op for plaintext endpoints and for streams that are already
    /// secure. `OpenTls` endpoints skip certificate verification.
    pub async fn upgrade_to_secure(self, roots: Arc<rustls::RootCertStore>) -> Result<Self> {
        let tcp = match self.stream {
            Stream::Tls(_) => return Ok(self),
            Stream::Tcp(_) if self.endpoint.scheme == Scheme::Plain => return Ok(self),
            Stream::Tcp(tcp) => tcp,
        };
        let config = match self.endpoint.scheme {
            Scheme::Tls => rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
            Scheme::OpenTls => rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                .with_no_client_auth(),
            Scheme::Plain => unreachable!("handled above"),
        };
        let server_name = ServerName::try_from(self.endpoint.host.clone())
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        let connector = TlsConnector::from(Arc::new(config));
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        debug!(endpoint = %self.endpoint, "transport upgraded to tls");
        Ok(Self {
            stream: Stream::Tls(Box::new(stream)),
            endpoint: self.endpoint,
        })
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        tokio::io::split(self)
    }

    /// Shut the stream down cleanly. Dropping the transport closes it too;
    /// this variant flushes and sends the TLS close-notify first.
    pub async fn close(mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.shutdown().await?;
        Ok(())
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

// Dangerous: certificate verifier that accepts any certificate. Used only
// for `opentls` endpoints.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context as _, Result};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_parses_schemes_and_defaults() {
        let plain: Endpoint = "localhost".parse().expect("bare host");
        assert_eq!(plain.scheme, Scheme::Plain);
        assert_eq!(plain.port, DEFAULT_PORT);

        let with_port: Endpoint = "10.1.2.3:4444".parse().expect("host:port");
        assert_eq!(with_port.scheme, Scheme::Plain);
        assert_eq!(with_port.port, 4444);

        let open: Endpoint = "opentls://dev:4443".parse().expect("opentls");
        assert_eq!(open.scheme, Scheme::OpenTls);

        let aliased: Endpoint = "nats://legacy:4222".parse().expect("alias");
        assert_eq!(aliased.scheme, Scheme::Plain);
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!("http://x:1".parse::<Endpoint>().is_err());
        assert!("tls://host:notaport".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_display_round_trips() {
        for input in ["plain://a:1", "tls://b:2", "opentls://c:3"] {
            let endpoint: Endpoint = input.parse().expect("parse");
            assert_eq!(endpoint.to_string(), input);
            assert_eq!(endpoint.to_string().parse::<Endpoint>().expect("re"), endpoint);
        }
    }

    #[tokio::test]
    async fn connect_and_echo_over_tcp() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            Result::<()>::Ok(())
        });

        let endpoint = Endpoint::new(Scheme::Plain, addr.ip().to_string(), addr.port());
        let transport = Transport::connect(&endpoint, Duration::from_secs(1)).await?;
        assert!(!transport.is_secure());
        let (mut reader, mut writer) = transport.split();
        writer.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");
        server.await.context("server join")??;
        Ok(())
    }

    #[tokio::test]
    async fn connect_times_out_on_black_hole() {
        // Reserved TEST-NET-1 address: connect attempts hang.
        let endpoint = Endpoint::new(Scheme::Plain, "192.0.2.1", 4222);
        let err = Transport::connect(&endpoint, Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn plain_endpoint_upgrade_is_a_no_op() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let endpoint = Endpoint::new(Scheme::Plain, "127.0.0.1", addr.port());
        let transport = Transport::connect(&endpoint, Duration::from_secs(1)).await?;
        let roots = Arc::new(rustls::RootCertStore::empty());
        let transport = transport.upgrade_to_secure(roots).await?;
        assert!(!transport.is_secure());
        Ok(())
    }

    #[tokio::test]
    async fn opentls_upgrade_accepts_self_signed_cert() -> Result<()> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .context("generate cert")?;
        let cert_der = cert.cert.der().clone();
        let key_der =
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let server_config =
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der.into())
                .context("server config")?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut tls = acceptor.accept(stream).await?;
            let mut buf = [0u8; 2];
            tls.read_exact(&mut buf).await?;
            tls.write_all(&buf).await?;
            tls.shutdown().await?;
            Result::<()>::Ok(())
        });

        let endpoint = Endpoint::new(Scheme::OpenTls, "localhost", addr.port());
        let transport = Transport::connect(&endpoint, Duration::from_secs(1)).await?;
        let roots = Arc::new(rustls::RootCertStore::empty());
        let transport = transport.upgrade_to_secure(roots).await?;
        assert!(transport.is_secure());

        let (mut reader, mut writer) = transport.split();
        writer.write_all(b"ok").await?;
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ok");
        server.await.context("server join")??;
        Ok(())
    }
}
