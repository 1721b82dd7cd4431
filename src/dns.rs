pub mod cache;
pub mod proxy;
pub mod upstream;

use std::{collections::HashSet, fs, io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::sleep,
};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorizer::Authorizer;
use crate::config::Config;
use cache::AnswerCache;
use upstream::Upstream;

/// The answer cache is swept on its own fixed cadence, independent of the
/// authorization sweeper.
const ANSWER_SWEEP_PERIOD: Duration = Duration::from_secs(30);

const MAX_UDP_QUERY: usize = 4096;

/// The proxy: one UDP and one TCP listener on the same bind address, an
/// answer cache consulted before the upstream, and the analyzer invoked on
/// every response before it is written back.
pub struct Server {
    listen_addr: SocketAddr,
    cache: Arc<AnswerCache>,
    authorizer: Arc<Authorizer>,
    upstream: Upstream,
    domain_blacklist: HashSet<String>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: &Config, authorizer: Arc<Authorizer>) -> Result<Arc<Self>> {
        let upstream = Upstream::new(
            config.fwd_addr,
            config.fwd_proto,
            config.fwd_tls,
            config.fwd_ca_cert.as_deref(),
        )?;

        let tls = if config.listen_tls {
            let cert = config
                .listen_cert
                .as_ref()
                .context("listen-tls is enabled but no certificate was provided")?;
            let key = config
                .listen_cert_key
                .as_ref()
                .context("listen-tls is enabled but no private key was provided")?;
            Some(load_listen_tls(cert, key)?)
        } else {
            None
        };

        let domain_blacklist = config
            .blacklist_domains
            .iter()
            .map(|d| d.trim_end_matches('.').to_string())
            .collect();

        Ok(Arc::new(Self {
            listen_addr: SocketAddr::V4(config.listen_addr),
            cache: Arc::new(AnswerCache::new(config.dns_ttl_cache)),
            authorizer,
            upstream,
            domain_blacklist,
            tls,
        }))
    }

    pub fn answer_cache(&self) -> Arc<AnswerCache> {
        Arc::clone(&self.cache)
    }

    /// Serve UDP until cancelled. A bind failure is fatal for the whole
    /// process; per-datagram failures are not.
    pub async fn run_udp(self: Arc<Self>, cancel: CancellationToken, fatal: CancellationToken) {
        let socket = match UdpSocket::bind(self.listen_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                error!(listener = %self.listen_addr, error = %err, "Failed to bind UDP listener");
                fatal.cancel();
                return;
            }
        };
        info!(listener = %self.listen_addr, "Starting UDP DNS server");

        let mut buf = vec![0u8; MAX_UDP_QUERY];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("UDP DNS server stopped");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "UDP receive failed");
                            continue;
                        }
                    };
                    let payload = buf[..len].to_vec();
                    let server = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        if let Some(response) = server.handle_payload(&payload).await {
                            if let Err(err) = socket.send_to(&response, peer).await {
                                warn!(peer = %peer, error = %err, "Failed to write response");
                            }
                        }
                    });
                }
            }
        }
    }

    /// Serve TCP (optionally TLS-wrapped) until cancelled. Queries are
    /// two-byte length-prefixed frames; a connection carries any number of
    /// them.
    pub async fn run_tcp(self: Arc<Self>, cancel: CancellationToken, fatal: CancellationToken) {
        let listener = match TcpListener::bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(listener = %self.listen_addr, error = %err, "Failed to bind TCP listener");
                fatal.cancel();
                return;
            }
        };
        match &self.tls {
            Some(_) => info!(listener = %self.listen_addr, "Starting TLS DNS server"),
            None => info!(listener = %self.listen_addr, "Starting TCP DNS server"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TCP DNS server stopped");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "Failed to accept TCP connection");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            debug!(peer = %peer, error = %err, "Connection terminated with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        match self.tls.clone() {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake with client failed")?;
                self.serve_stream(stream).await
            }
            None => self.serve_stream(stream).await,
        }
    }

    async fn serve_stream<S>(self: Arc<Self>, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err).context("Failed to read frame length"),
            };
            if len == 0 {
                continue;
            }
            let mut payload = vec![0u8; len];
            stream
                .read_exact(&mut payload)
                .await
                .context("Failed to read frame payload")?;

            if let Some(response) = self.handle_payload(&payload).await {
                if response.len() >= u16::MAX as usize {
                    return Err(anyhow!("response exceeds the DNS frame size limit"));
                }
                stream
                    .write_u16(response.len() as u16)
                    .await
                    .context("Failed to write frame length")?;
                stream
                    .write_all(&response)
                    .await
                    .context("Failed to write frame payload")?;
                stream.flush().await.context("Failed to flush frame")?;
            }
        }
    }

    /// Drop expired entries from both sides of the answer cache.
    pub async fn run_answer_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            period = ANSWER_SWEEP_PERIOD.as_secs(),
            "Starting DNS TTL cache manager"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("DNS TTL cache manager stopped");
                    return;
                }
                _ = sleep(ANSWER_SWEEP_PERIOD) => {
                    if self.cache.ttl() < 0 {
                        continue;
                    }
                    debug!("Checking DNS cache");
                    for question in self.cache.expired_queries() {
                        debug!(question, "Deleting expired query from cache");
                        self.cache.delete(&question);
                    }
                    for question in self.cache.expired_nx() {
                        debug!(question, "Deleting expired query from NX cache");
                        self.cache.delete_nx(&question);
                    }
                }
            }
        }
    }
}

/// Assemble the DoT serving identity. The certificate file may carry a full
/// chain; the key may be PKCS#8 or RSA, both are tried against the same PEM
/// bytes.
fn load_listen_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("Unable to read listener certificate {}", cert_path.display()))?;
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .with_context(|| format!("{} is not parseable PEM", cert_path.display()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        bail!("{} holds no certificates", cert_path.display());
    }

    let key_pem = fs::read(key_path)
        .with_context(|| format!("Unable to read listener key {}", key_path.display()))?;
    let key = first_private_key(&key_pem)
        .with_context(|| format!("no usable private key in {}", key_path.display()))?;

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("Listener certificate and key do not form a usable identity")?;
    config.alpn_protocols = vec![b"dot".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn first_private_key(pem: &[u8]) -> Option<PrivateKey> {
    let parsers = [
        rustls_pemfile::pkcs8_private_keys,
        rustls_pemfile::rsa_private_keys,
    ];
    parsers
        .iter()
        .filter_map(|parse| parse(&mut &pem[..]).ok())
        .flatten()
        .map(PrivateKey)
        .next()
}
