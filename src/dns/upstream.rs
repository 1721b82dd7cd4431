use std::{
    fs::File,
    io::BufReader,
    net::{SocketAddr, SocketAddrV4},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use hickory_proto::op::Message;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tokio_rustls::rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

use crate::config::FwdProtocol;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_UDP_RESPONSE: usize = 4096;

/// Client side of the proxy: exchanges a query with the configured upstream
/// resolver over UDP, TCP, or TCP-TLS.
pub struct Upstream {
    addr: SocketAddr,
    transport: Transport,
    timeout: Duration,
}

enum Transport {
    Udp,
    Tcp,
    Tls {
        connector: TlsConnector,
        server_name: ServerName,
    },
}

impl Upstream {
    pub fn new(
        addr: SocketAddrV4,
        proto: FwdProtocol,
        tls: bool,
        ca_cert: Option<&Path>,
    ) -> Result<Self> {
        let transport = if tls {
            let roots = match ca_cert {
                Some(path) => pinned_roots(path)?,
                None => system_roots()?,
            };
            let config = ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let server_name = ServerName::try_from(addr.ip().to_string().as_str())
                .context("Upstream address is not a valid TLS server name")?;
            Transport::Tls {
                connector: TlsConnector::from(Arc::new(config)),
                server_name,
            }
        } else {
            match proto {
                FwdProtocol::Udp => Transport::Udp,
                FwdProtocol::Tcp => Transport::Tcp,
            }
        };

        Ok(Self {
            addr: SocketAddr::V4(addr),
            transport,
            timeout: EXCHANGE_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the query and wait for the matching response.
    pub async fn exchange(&self, query: &Message) -> Result<Message> {
        let payload = query
            .to_vec()
            .context("Failed to serialise query for the upstream")?;
        let exchange = async {
            match &self.transport {
                Transport::Udp => self.exchange_udp(&payload).await,
                Transport::Tcp => {
                    let stream = TcpStream::connect(self.addr)
                        .await
                        .with_context(|| format!("Failed to connect to upstream {}", self.addr))?;
                    exchange_framed(stream, &payload).await
                }
                Transport::Tls {
                    connector,
                    server_name,
                } => {
                    let stream = TcpStream::connect(self.addr)
                        .await
                        .with_context(|| format!("Failed to connect to upstream {}", self.addr))?;
                    let stream = connector
                        .connect(server_name.clone(), stream)
                        .await
                        .context("TLS handshake with the upstream failed")?;
                    exchange_framed(stream, &payload).await
                }
            }
        };
        let raw = timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("upstream exchange timed out after {:?}", self.timeout))??;
        Message::from_vec(&raw).context("Failed to parse upstream response")
    }

    async fn exchange_udp(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind upstream query socket")?;
        socket
            .connect(self.addr)
            .await
            .with_context(|| format!("Failed to connect to upstream {}", self.addr))?;
        socket
            .send(payload)
            .await
            .context("Failed to send query to the upstream")?;
        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let len = socket
            .recv(&mut buf)
            .await
            .context("Failed to read response from the upstream")?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// DNS over a stream transport is length-prefixed with a two-byte big-endian
/// frame size.
async fn exchange_framed<S>(mut stream: S, payload: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if payload.len() >= u16::MAX as usize {
        bail!("query exceeds the DNS frame size limit");
    }
    stream
        .write_u16(payload.len() as u16)
        .await
        .context("Failed to write frame length to the upstream")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write query to the upstream")?;
    stream
        .flush()
        .await
        .context("Failed to flush query to the upstream")?;

    let len = stream
        .read_u16()
        .await
        .context("Failed to read frame length from the upstream")? as usize;
    let mut response = vec![0u8; len];
    stream
        .read_exact(&mut response)
        .await
        .context("Failed to read response from the upstream")?;
    Ok(response)
}

fn pinned_roots(path: &Path) -> Result<RootCertStore> {
    let mut reader = BufReader::new(
        File::open(path)
            .with_context(|| format!("Unable to open CA certificate {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .with_context(|| format!("Failed to parse CA certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("no CA certificates found in {}", path.display());
    }
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(&Certificate(cert))
            .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
    }
    Ok(roots)
}

fn system_roots() -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in
        rustls_native_certs::load_native_certs().context("Failed to load system root store")?
    {
        // Individual stale roots in the system store are not fatal.
        let _ = roots.add(&Certificate(cert.0));
    }
    if roots.is_empty() {
        bail!("system root store is empty");
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{rdata::A, Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn sample_query() -> Message {
        let mut query = Query::new();
        query
            .set_name(Name::from_str("example.com.").unwrap())
            .set_query_type(RecordType::A);
        let mut msg = Message::new();
        msg.set_id(0x2b2b).add_query(query);
        msg
    }

    fn answer_for(req: &Message) -> Message {
        let mut resp = Message::new();
        resp.set_id(req.id());
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NoError);
        resp.add_queries(req.queries().to_vec());
        if let Some(question) = req.queries().first() {
            let mut record = Record::with(question.name().clone(), RecordType::A, 60);
            record.set_data(Some(RData::A(A::from(Ipv4Addr::new(93, 184, 216, 34)))));
            resp.add_answer(record);
        }
        resp
    }

    async fn udp_upstream() -> SocketAddrV4 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = match socket.local_addr().expect("addr") {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound v4"),
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let req = Message::from_vec(&buf[..len]).expect("parse query");
                let resp = answer_for(&req).to_vec().expect("serialise");
                let _ = socket.send_to(&resp, peer).await;
            }
        });
        addr
    }

    async fn tcp_upstream() -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = match listener.local_addr().expect("addr") {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound v4"),
        };
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let len = stream.read_u16().await.expect("frame length") as usize;
                    let mut payload = vec![0u8; len];
                    stream.read_exact(&mut payload).await.expect("frame");
                    let req = Message::from_vec(&payload).expect("parse query");
                    let resp = answer_for(&req).to_vec().expect("serialise");
                    stream.write_u16(resp.len() as u16).await.expect("length");
                    stream.write_all(&resp).await.expect("payload");
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn udp_exchange_round_trips() {
        let addr = udp_upstream().await;
        let upstream = Upstream::new(addr, FwdProtocol::Udp, false, None).expect("builds");
        let resp = upstream.exchange(&sample_query()).await.expect("exchange");
        assert_eq!(resp.id(), 0x2b2b);
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn tcp_exchange_round_trips() {
        let addr = tcp_upstream().await;
        let upstream = Upstream::new(addr, FwdProtocol::Tcp, false, None).expect("builds");
        let resp = upstream.exchange(&sample_query()).await.expect("exchange");
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_error() {
        // Nothing listens here; the reply never arrives.
        let addr = "127.0.0.1:1".parse().unwrap();
        let upstream = Upstream::new(addr, FwdProtocol::Udp, false, None)
            .expect("builds")
            .with_timeout(Duration::from_millis(200));
        assert!(upstream.exchange(&sample_query()).await.is_err());
    }
}
