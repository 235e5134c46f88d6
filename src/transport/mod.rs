//! TCP + TLS transport with line framing.
//!
//! [`Transport`] owns the socket (and TLS session, when negotiated) for one
//! connection. Inbound bytes are framed on CR LF with a growable buffer;
//! each framed line is decoded leniently as UTF-8 and parsed in server
//! mode. Outbound lines are written verbatim plus CR LF.
//!
//! All async operations accept a cooperative cancellation token; a cancel
//! mid-handshake drops the partially established session.

pub mod trust;

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{
    client::WebPkiServerVerifier,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    ClientConfig, RootCertStore,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind};
use crate::error::{Error, Result};
use crate::options::{ClientOptions, ServerEntry};

use self::trust::{sha256, FingerprintVerifier, TrustPolicy};

/// Initial receive buffer capacity (a multiple of the page size).
pub const INITIAL_BUFFER: usize = 12 * 1024;
/// Minimum read chunk size.
pub const MIN_READ: usize = 512;
/// Hard cap on receive buffer growth.
pub const MAX_BUFFER: usize = 2 * 1024 * 1024;
/// Maximum buffered unparsed bytes without a CR LF before the line is
/// declared over-long.
pub const MAX_LINE: usize = 8704;

/// TLS channel binding types (RFC 5929).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelBindingKind {
    /// `tls-unique`: the handshake finished message.
    Unique,
    /// `tls-server-end-point`: a hash of the server certificate.
    Endpoint,
}

enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One connection's socket, TLS session, and framing buffer.
pub struct Transport {
    stream: TransportStream,
    buf: BytesMut,
    peer_cert: Option<Vec<u8>>,
}

impl Transport {
    /// Open a TCP connection to `server`, optionally binding
    /// `options.bind_host` locally, and perform the TLS handshake when the
    /// server entry requests it.
    ///
    /// Cancellation mid-connect or mid-handshake fails with
    /// [`Error::Cancelled`]; a timeout is the caller's concern, expressed
    /// as a cancel signal.
    pub async fn connect(
        server: &ServerEntry,
        options: &ClientOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let stream = Self::connect_tcp(server, options, cancel).await?;
        if let Err(e) = enable_keepalive(&stream) {
            warn!(server = %server, "failed to enable TCP keepalive: {}", e);
        }

        if !server.secure {
            return Ok(Self {
                stream: TransportStream::Tcp(stream),
                buf: BytesMut::with_capacity(INITIAL_BUFFER),
                peer_cert: None,
            });
        }

        let config = build_tls_config(options)?;
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(server.host.clone())
            .map_err(|_| Error::InvalidArgument(format!("invalid server name {:?}", server.host)))?;

        let tls = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = connector.connect(name, stream) => r?,
        };

        let peer_cert = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        Ok(Self {
            stream: TransportStream::Tls(Box::new(tls)),
            buf: BytesMut::with_capacity(INITIAL_BUFFER),
            peer_cert,
        })
    }

    async fn connect_tcp(
        server: &ServerEntry,
        options: &ClientOptions,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = lookup_host((server.host.as_str(), server.port)) => r?.collect(),
        };
        if addrs.is_empty() {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not resolve {}", server.host),
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }?;
            if let Some(bind_host) = &options.bind_host {
                let ip = resolve_bind_addr(bind_host, addr.is_ipv4(), cancel).await?;
                socket.bind(SocketAddr::new(ip, 0))?;
            }
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = socket.connect(addr) => r,
            };
            match connected {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, "connect failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Transport(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no usable address")
        })))
    }

    /// Whether this connection negotiated TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    /// Write `line` plus CR LF. No validation is applied.
    pub async fn send_raw(&mut self, line: &str, cancel: &CancellationToken) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.stream.write_all(&bytes) => r?,
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.stream.flush() => Ok(r?),
        }
    }

    /// Serialize and write a command.
    pub async fn send(&mut self, command: &Command, cancel: &CancellationToken) -> Result<()> {
        self.send_raw(&command.to_wire(), cancel).await
    }

    /// Read the next CR LF-terminated line and parse it in server mode.
    ///
    /// Empty lines are skipped. More than [`MAX_LINE`] buffered bytes
    /// without a CR LF fail with
    /// `ProtocolViolation("line too long")`.
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<Command> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let mut line = self.buf.split_to(pos + 2);
                line.truncate(pos);
                if line.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(&line);
                return Command::parse(CommandKind::Server, &text);
            }

            if self.buf.len() >= MAX_LINE {
                return Err(Error::ProtocolViolation("line too long".to_string()));
            }
            if self.buf.len() + MIN_READ > MAX_BUFFER {
                return Err(Error::ProtocolViolation("receive buffer overflow".to_string()));
            }

            self.buf.reserve(MIN_READ);
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.stream.read_buf(&mut self.buf) => r?,
            };
            if read == 0 {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    /// Gracefully close the connection, dropping the TLS session.
    pub async fn disconnect(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// TLS channel binding data of the given kind, or `None` when
    /// unavailable.
    ///
    /// `Unique` is always absent: it is undefined for TLS 1.3+ and rustls
    /// does not export the finished message for earlier versions.
    /// `Endpoint` is the SHA-256 of the server's end-entity certificate.
    pub fn channel_binding(&self, kind: ChannelBindingKind) -> Option<Vec<u8>> {
        match kind {
            ChannelBindingKind::Unique => None,
            ChannelBindingKind::Endpoint => self.peer_cert.as_deref().map(sha256),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};
    use std::time::Duration;

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)
}

async fn resolve_bind_addr(
    bind_host: &str,
    want_v4: bool,
    cancel: &CancellationToken,
) -> Result<IpAddr> {
    if let Ok(ip) = IpAddr::from_str(bind_host) {
        return Ok(ip);
    }
    let addrs: Vec<SocketAddr> = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = lookup_host((bind_host, 0u16)) => r?.collect(),
    };
    addrs
        .into_iter()
        .map(|a| a.ip())
        .find(|ip| ip.is_ipv4() == want_v4)
        .ok_or_else(|| Error::InvalidArgument(format!("cannot bind to {:?}", bind_host)))
}

fn build_tls_config(options: &ClientOptions) -> Result<ClientConfig> {
    let policy = TrustPolicy::from_options(options);

    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());
    let pinned = policy.accept_all
        || !policy.certificate_fingerprints.is_empty()
        || !policy.public_key_fingerprints.is_empty();
    let webpki = match WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
    {
        Ok(webpki) => Some(webpki),
        // Without platform roots a pinned policy can still verify.
        Err(e) if pinned => {
            warn!("no usable trust anchors ({}), relying on pinned fingerprints", e);
            None
        }
        Err(e) => {
            return Err(Error::InvalidArgument(format!(
                "cannot build trust verifier: {}",
                e
            )))
        }
    };
    let verifier = Arc::new(FingerprintVerifier::new(policy, webpki, provider));

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let mut config = match load_client_auth(options)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::InvalidArgument(format!("invalid client certificate: {}", e)))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"irc".to_vec()];
    Ok(config)
}

type ClientAuth = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_client_auth(options: &ClientOptions) -> Result<Option<ClientAuth>> {
    let Some(path) = options.account_certificate_file.as_deref() else {
        return Ok(None);
    };
    let data = std::fs::read(path)?;

    let certs = rustls_pemfile::certs(&mut &data[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::InvalidArgument(format!("bad certificate file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no certificate found in {:?}",
            path
        )));
    }
    let key = rustls_pemfile::private_key(&mut &data[..])
        .map_err(|e| Error::InvalidArgument(format!("bad certificate file {:?}: {}", path, e)))?
        .ok_or_else(|| {
            Error::InvalidArgument(format!("no private key found in {:?}", path))
        })?;
    Ok(Some((certs, key)))
}
