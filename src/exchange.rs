//! One request against one server: UDP/TCP framing, EDNS sizing,
//! truncation fallback, RTT accounting

use crate::cache::server::{AuthServer, IpFamily};
use crate::dns::edns::MIN_UDP_SIZE;
use crate::dns::message::{Message, Rcode};
use crate::dns::pool::BufferPool;
use crate::error::ResolveError;
use crate::tcp_pool::{is_root_server, is_tld_query, TcpPool};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// UDP responses above this size are refetched over TCP.
pub const DEFAULT_UDP_SIZE: u16 = 1400;

/// Retries allowed within a single exchange call.
const MAX_RETRIES: u8 = 2;

/// Transport for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Performs single exchanges and owns the transport-side plumbing.
pub struct Exchanger {
    net_timeout: Duration,
    udp_max_size: u16,
    outbound_v4: Vec<IpAddr>,
    outbound_v6: Vec<IpAddr>,
    pooling: bool,
    pool: Arc<TcpPool>,
    buffers: BufferPool,
}

impl Exchanger {
    pub fn new(
        net_timeout: Duration,
        outbound_v4: Vec<IpAddr>,
        outbound_v6: Vec<IpAddr>,
        pooling: bool,
        pool: Arc<TcpPool>,
    ) -> Self {
        Exchanger {
            net_timeout,
            udp_max_size: DEFAULT_UDP_SIZE,
            outbound_v4,
            outbound_v6,
            pooling,
            pool,
            buffers: BufferPool::default(),
        }
    }

    fn attempt_timeout(&self, deadline: Instant) -> Result<Duration, ResolveError> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ResolveError::Network("deadline exceeded".into()));
        }
        Ok(self.net_timeout.min(left))
    }

    fn bind_addr(&self, family: IpFamily) -> SocketAddr {
        let pool = match family {
            IpFamily::V4 => &self.outbound_v4,
            IpFamily::V6 => &self.outbound_v6,
        };
        let ip = if pool.is_empty() {
            match family {
                IpFamily::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                IpFamily::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            }
        } else {
            pool[rand::thread_rng().gen_range(0..pool.len())]
        };
        SocketAddr::new(ip, 0)
    }

    /// Exchange `req` with `server`, measuring the elapsed time into the
    /// server's RTT statistics whether or not the attempt succeeds.
    pub async fn exchange(
        &self,
        deadline: Instant,
        transport: Transport,
        req: &mut Message,
        server: &AuthServer,
        retried: u8,
    ) -> Result<Message, ResolveError> {
        // Adopt the request's advertised size as the receive minimum.
        let recv_size = if req.is_edns() {
            req.udp_size().max(MIN_UDP_SIZE)
        } else {
            MIN_UDP_SIZE
        };

        let caller_id = req.id;
        req.id = rand::thread_rng().gen();

        let started = Instant::now();
        let outcome = match transport {
            Transport::Udp => self.attempt_udp(deadline, req, server, recv_size).await,
            Transport::Tcp => self.attempt_tcp(deadline, req, server).await,
        };
        server.record_rtt(started.elapsed());

        let attempt_id = req.id;
        req.id = caller_id;

        match outcome {
            Err(err) => {
                if transport == Transport::Udp && retried < MAX_RETRIES {
                    debug!("udp exchange with {} failed ({}), retrying over tcp", server.addr, err);
                    return Box::pin(self.exchange(deadline, Transport::Tcp, req, server, retried + 1))
                        .await;
                }
                Err(err)
            }
            Ok((mut resp, wire_len)) => {
                if resp.id != attempt_id {
                    return Err(ResolveError::Network("response id mismatch".into()));
                }
                if transport == Transport::Udp && resp.truncated {
                    // Truncation does not consume the retry budget.
                    return Box::pin(self.exchange(deadline, Transport::Tcp, req, server, retried))
                        .await;
                }
                if transport == Transport::Udp
                    && wire_len > self.udp_max_size as usize
                    && retried < MAX_RETRIES
                {
                    return Box::pin(self.exchange(deadline, Transport::Tcp, req, server, retried + 1))
                        .await;
                }
                if resp.rcode == Rcode::FormErr && req.is_edns() && retried < MAX_RETRIES {
                    debug!("{} answered FORMERR to edns, retrying without opt", server.addr);
                    req.strip_opt();
                    return Box::pin(self.exchange(deadline, transport, req, server, retried + 1))
                        .await;
                }
                resp.id = caller_id;
                Ok(resp)
            }
        }
    }

    async fn attempt_udp(
        &self,
        deadline: Instant,
        req: &Message,
        server: &AuthServer,
        recv_size: u16,
    ) -> Result<(Message, usize), ResolveError> {
        let limit = self.attempt_timeout(deadline)?;
        let attempt = async {
            let socket = UdpSocket::bind(self.bind_addr(server.family)).await?;
            socket.connect(&server.addr).await?;
            socket.send(&req.pack()).await?;

            let mut buf = self.buffers.acquire(recv_size as usize);
            loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(err) => {
                        self.buffers.release(buf);
                        return Err(err.into());
                    }
                };
                match Message::unpack(&buf[..n]) {
                    Ok(resp) if resp.id == req.id => {
                        self.buffers.release(buf);
                        return Ok((resp, n));
                    }
                    // Mismatched or mangled datagram: keep listening
                    // until the timer runs out.
                    _ => continue,
                }
            }
        };
        timeout(limit, attempt)
            .await
            .map_err(|_| ResolveError::Network(format!("udp exchange with {} timed out", server.addr)))?
    }

    async fn attempt_tcp(
        &self,
        deadline: Instant,
        req: &mut Message,
        server: &AuthServer,
    ) -> Result<(Message, usize), ResolveError> {
        let limit = self.attempt_timeout(deadline)?;

        let is_root = is_root_server(&server.addr);
        let is_tld = req.q().map(|q| is_tld_query(&q.name)).unwrap_or(false);
        let poolable = self.pooling && (is_root || is_tld);

        let pooled = if poolable {
            self.pool.get(&server.addr, is_root, is_tld)
        } else {
            None
        };
        let from_pool = pooled.is_some();

        if poolable && req.is_edns() {
            req.request_keepalive();
        }

        let attempt = async {
            let mut stream = match pooled {
                Some(stream) => stream,
                None => self.dial_tcp(server).await?,
            };

            let payload = req.pack();
            let mut framed = Vec::with_capacity(payload.len() + 2);
            framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            framed.extend_from_slice(&payload);
            stream.write_all(&framed).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = self.buffers.acquire(len);
            if let Err(err) = stream.read_exact(&mut buf[..len]).await {
                self.buffers.release(buf);
                return Err(err.into());
            }
            let resp = match Message::unpack(&buf[..len]) {
                Ok(resp) => resp,
                Err(err) => {
                    self.buffers.release(buf);
                    return Err(err.into());
                }
            };
            self.buffers.release(buf);
            Ok::<_, ResolveError>((resp, len, stream))
        };

        match timeout(limit, attempt).await {
            Ok(Ok((resp, len, stream))) => {
                if poolable {
                    self.pool
                        .put(stream, &server.addr, is_root, is_tld, Some(&resp));
                }
                Ok((resp, len))
            }
            Ok(Err(err)) => {
                if from_pool {
                    debug!("pooled connection to {} failed: {}", server.addr, err);
                }
                Err(err)
            }
            Err(_) => Err(ResolveError::Network(format!(
                "tcp exchange with {} timed out",
                server.addr
            ))),
        }
    }

    async fn dial_tcp(&self, server: &AuthServer) -> Result<TcpStream, ResolveError> {
        let addr: SocketAddr = server
            .addr
            .parse()
            .map_err(|_| ResolveError::Network(format!("bad server address {}", server.addr)))?;
        let socket = match server.family {
            IpFamily::V4 => TcpSocket::new_v4()?,
            IpFamily::V6 => TcpSocket::new_v6()?,
        };
        let bind = self.bind_addr(server.family);
        if !bind.ip().is_unspecified() {
            socket.bind(bind)?;
        }
        Ok(socket.connect(addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::name::Name;
    use crate::dns::rdata::{RData, RrType};
    use crate::dns::message::Record;

    fn exchanger() -> Exchanger {
        Exchanger::new(
            Duration::from_millis(500),
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(TcpPool::default()),
        )
    }

    async fn udp_responder(truncate: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let req = Message::unpack(&buf[..n]).unwrap();
            let mut resp = Message::new();
            resp.set_reply(&req);
            resp.truncated = truncate;
            if !truncate {
                if let Some(q) = req.q() {
                    resp.answer.push(Record::new(
                        q.name.clone(),
                        RrType::A,
                        60,
                        RData::A("192.0.2.99".parse().unwrap()),
                    ));
                }
            }
            socket.send_to(&resp.pack(), peer).await.unwrap();
        });
        addr
    }

    async fn tcp_responder() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            let req = Message::unpack(&buf).unwrap();
            let mut resp = Message::new();
            resp.set_reply(&req);
            if let Some(q) = req.q() {
                resp.answer.push(Record::new(
                    q.name.clone(),
                    RrType::A,
                    60,
                    RData::A("192.0.2.123".parse().unwrap()),
                ));
            }
            let payload = resp.pack();
            let mut framed = (payload.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&payload);
            stream.write_all(&framed).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_exchange_restores_caller_id() {
        let addr = udp_responder(false).await;
        let server = AuthServer::new(addr.to_string(), IpFamily::V4);
        let ex = exchanger();

        let mut req = Message::query(Name::parse("example.com.").unwrap(), RrType::A);
        req.id = 0x4242;
        let deadline = Instant::now() + Duration::from_secs(2);
        let resp = ex
            .exchange(deadline, Transport::Udp, &mut req, &server, 0)
            .await
            .unwrap();
        assert_eq!(req.id, 0x4242);
        assert_eq!(resp.id, 0x4242);
        assert_eq!(resp.answer.len(), 1);
        assert_eq!(server.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_truncated_udp_falls_back_to_tcp() {
        let udp_addr = udp_responder(true).await;
        let server = AuthServer::new(udp_addr.to_string(), IpFamily::V4);
        let ex = exchanger();

        let mut req = Message::query(Name::parse("example.com.").unwrap(), RrType::A);
        let deadline = Instant::now() + Duration::from_millis(700);
        let result = ex
            .exchange(deadline, Transport::Udp, &mut req, &server, 0)
            .await;
        // nothing listens on the tcp side of that port, so the fallback
        // dial fails; what matters is that it was attempted
        assert!(result.is_err());
        assert_eq!(server.sample_count(), 2);
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let addr = tcp_responder().await;
        let server = AuthServer::new(addr.to_string(), IpFamily::V4);
        let ex = exchanger();

        let mut req = Message::query(Name::parse("example.org.").unwrap(), RrType::A);
        req.id = 7;
        let deadline = Instant::now() + Duration::from_secs(2);
        let resp = ex
            .exchange(deadline, Transport::Tcp, &mut req, &server, 0)
            .await
            .unwrap();
        assert_eq!(resp.id, 7);
        assert_eq!(resp.answer.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_already_passed() {
        let server = AuthServer::new("192.0.2.1:53", IpFamily::V4);
        let ex = exchanger();
        let mut req = Message::query(Name::root(), RrType::Ns);
        let result = ex
            .exchange(Instant::now(), Transport::Udp, &mut req, &server, 0)
            .await;
        assert!(result.is_err());
    }
}
