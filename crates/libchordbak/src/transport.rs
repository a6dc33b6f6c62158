// Transport of the backup network: mutually authenticated TLS streams
// carrying framed messages and raw file bytes. One logical request per
// connection, no multiplexing; the connection is owned by exactly one task
// and dropped (hence closed) on every exit path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use libchordbak_core::constants::{CONNECT_TIMEOUT, TLS_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::trace;
use wire_protocol::{Frame, MessageDeserializeError};

use crate::error::{Error, Result};

pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin + 'static>;
pub type BoxAsyncWrite = Box<dyn AsyncWrite + Send + Unpin + 'static>;

/// Paths to the peer's TLS credentials. Provisioning them is outside the
/// peer; every ring member trusts the same CA and presents a certificate
/// signed by it, which is what makes the streams mutually authenticated.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

fn load_certs(path: &PathBuf) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("error reading {path:?}"))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("error parsing certificates from {path:?}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {path:?}");
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("error reading {path:?}"))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .with_context(|| format!("error parsing key from {path:?}"))?
        .with_context(|| format!("no private key in {path:?}"))
}

/// Builds the client and server ends of the mutual-TLS transport from one
/// set of credentials.
pub struct Tls {
    pub connector: TlsConnector,
    pub acceptor: TlsAcceptor,
}

impl Tls {
    pub fn load(config: &TlsConfig) -> anyhow::Result<Tls> {
        let certs = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;
        let mut roots = RootCertStore::empty();
        for ca in load_certs(&config.ca)? {
            roots.add(ca).context("error adding CA certificate")?;
        }
        let roots = Arc::new(roots);

        let client = rustls::ClientConfig::builder()
            .with_root_certificates(roots.as_ref().clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .context("error building TLS client config")?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(roots)
            .build()
            .context("error building client certificate verifier")?;
        let server = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("error building TLS server config")?;

        Ok(Tls {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }
}

/// Dials remote peers. The TLS implementation is the production one; tests
/// substitute in-memory duplex streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection>;
}

pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(connector: TlsConnector) -> Self {
        TlsDialer { connector }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
            .map_err(Error::Unreachable)?;
        let server_name = ServerName::from(addr.ip());
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
            .map_err(Error::HandshakeFailed)?;
        trace!(peer = %addr, "connected");
        let (read, write) = tokio::io::split(stream);
        Ok(Connection::new(addr, read, write))
    }
}

/// One framed, bidirectional stream to a remote peer.
///
/// Bytes read past the last parsed frame stay in the buffer and are handed
/// to the next `recv` or `recv_file`, which is what lets a sender pipeline
/// a frame and the file body behind it.
pub struct Connection {
    addr: SocketAddr,
    read: BoxAsyncRead,
    write: BoxAsyncWrite,
    buf: BytesMut,
}

impl Connection {
    pub fn new(
        addr: SocketAddr,
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Connection {
            addr,
            read: Box::new(read),
            write: Box::new(write),
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut out = Vec::new();
        frame.serialize(&mut out);
        self.write.write_all(&out).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Reads one full frame, failing with `Timeout` when it does not arrive
    /// within the deadline.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Frame::deserialize(&self.buf) {
                Ok((frame, consumed)) => {
                    self.buf.advance(consumed);
                    return Ok(frame);
                }
                Err(MessageDeserializeError::NotEnoughData(_)) => {}
                Err(e) => return Err(Error::violation(format!("{e:#}"))),
            }
            let n = tokio::time::timeout_at(deadline, self.read.read_buf(&mut self.buf))
                .await
                .map_err(|_| Error::Timeout(timeout))??;
            if n == 0 {
                return Err(Error::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
        }
    }

    /// Streams exactly `size` bytes from `src` to the peer in
    /// `TLS_CHUNK_SIZE` chunks.
    pub async fn send_file(
        &mut self,
        src: &mut (impl AsyncRead + Unpin),
        size: u64,
    ) -> Result<()> {
        let mut chunk = vec![0u8; TLS_CHUNK_SIZE];
        let mut left = size;
        while left > 0 {
            let want = TLS_CHUNK_SIZE.min(left as usize);
            let n = src.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            self.write.write_all(&chunk[..n]).await?;
            left -= n as u64;
        }
        self.write.flush().await?;
        Ok(())
    }

    /// Consumes exactly `size` bytes from the stream into `sink`, draining
    /// anything already buffered behind the last frame first.
    pub async fn recv_file(
        &mut self,
        sink: &mut (impl AsyncWrite + Unpin),
        size: u64,
    ) -> Result<()> {
        let mut left = size;
        while left > 0 && !self.buf.is_empty() {
            let take = self.buf.len().min(left as usize);
            sink.write_all(&self.buf[..take]).await?;
            self.buf.advance(take);
            left -= take as u64;
        }
        let mut chunk = vec![0u8; TLS_CHUNK_SIZE];
        while left > 0 {
            let want = TLS_CHUNK_SIZE.min(left as usize);
            let n = self.read.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            sink.write_all(&chunk[..n]).await?;
            left -= n as u64;
        }
        sink.flush().await?;
        Ok(())
    }

    /// Explicit close; dropping the connection closes it as well.
    pub async fn close(mut self) {
        let _ = self.write.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libchordbak_core::PeerRef;
    use wire_protocol::Message;

    fn pair() -> (Connection, Connection) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Connection::new(addr, ar, aw), Connection::new(addr, br, bw))
    }

    fn me() -> PeerRef {
        PeerRef::new("127.0.0.1:7000".parse().unwrap())
    }

    #[tokio::test]
    async fn frame_roundtrip_over_stream() {
        let (mut a, mut b) = pair();
        a.send(&Frame::new(me(), Message::Ping)).await.unwrap();
        let got = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.message, Message::Ping);
        assert_eq!(got.sender, me());
    }

    #[tokio::test]
    async fn recv_times_out_without_data() {
        let (mut a, _b) = pair();
        let err = a.recv(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn recv_fails_on_eof() {
        let (mut a, b) = pair();
        drop(b);
        let err = a.recv(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn file_bytes_pipelined_behind_frame_are_not_lost() {
        let (mut a, mut b) = pair();
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        let sender = async {
            a.send(&Frame::new(me(), Message::Ping)).await.unwrap();
            let mut src = &payload[..];
            a.send_file(&mut src, payload.len() as u64).await.unwrap();
            a
        };
        let receiver = async {
            let frame = b.recv(Duration::from_secs(1)).await.unwrap();
            assert_eq!(frame.message, Message::Ping);
            let mut out = Vec::new();
            b.recv_file(&mut out, payload.len() as u64).await.unwrap();
            out
        };
        let (_, received) = tokio::join!(sender, receiver);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn recv_file_reads_exactly_size() {
        let (mut a, mut b) = pair();
        let payload = vec![7u8; 1000];
        let sender = async {
            let mut src = &payload[..];
            a.send_file(&mut src, 1000).await.unwrap();
            // trailing frame after the file body
            a.send(&Frame::new(me(), Message::GetPred)).await.unwrap();
        };
        let receiver = async {
            let mut out = Vec::new();
            b.recv_file(&mut out, 1000).await.unwrap();
            assert_eq!(out.len(), 1000);
            let frame = b.recv(Duration::from_secs(1)).await.unwrap();
            assert_eq!(frame.message, Message::GetPred);
        };
        tokio::join!(sender, receiver);
    }
}
