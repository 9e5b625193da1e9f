//! ironroot — recursive, DNSSEC-validating DNS resolver

use clap::Parser;
use ironroot::dns::pool::{BufferPool, MessagePool};
use ironroot::dns::{Message, Rcode};
use ironroot::{Chain, Config, Resolver, ResolverHandler, TrustAnchors};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ironroot", version, about = "Recursive DNSSEC-validating DNS resolver")]
struct Args {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    bind: Option<String>,

    /// Data directory, overriding the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

struct FrontEnd {
    chain: Chain,
    messages: MessagePool,
    buffers: BufferPool,
}

impl FrontEnd {
    fn new(chain: Chain) -> Self {
        FrontEnd {
            chain,
            messages: MessagePool::default(),
            buffers: BufferPool::default(),
        }
    }

    /// Serve one wire-format request, falling back to FORMERR/SERVFAIL
    /// replies assembled from the message pool.
    async fn handle(&self, wire: &[u8], remote: SocketAddr) -> Option<Vec<u8>> {
        let req = match Message::unpack(wire) {
            Ok(req) => req,
            Err(err) => {
                debug!("malformed query from {}: {}", remote, err);
                let mut reply = self.messages.acquire();
                reply.id = wire
                    .get(..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .unwrap_or(0);
                reply.response = true;
                reply.rcode = Rcode::FormErr;
                let out = reply.pack();
                self.messages.release(reply);
                return Some(out);
            }
        };

        match self.chain.serve(req.clone(), remote).await {
            Some(resp) => Some(resp.pack()),
            None => {
                let mut reply = self.messages.acquire();
                reply.set_reply(&req);
                reply.rcode = Rcode::ServFail;
                reply.recursion_available = true;
                let out = reply.pack();
                self.messages.release(reply);
                Some(out)
            }
        }
    }

    async fn run_udp(self: Arc<Self>, socket: Arc<UdpSocket>) {
        loop {
            let mut buf = self.buffers.acquire(65535);
            let (n, remote) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    warn!("udp receive failed: {}", err);
                    continue;
                }
            };
            let fe = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(mut out) = fe.handle(&buf[..n], remote).await {
                    // trim oversized replies to the client's receive size
                    let limit = Message::unpack(&buf[..n])
                        .map(|m| m.udp_size() as usize)
                        .unwrap_or(512);
                    if out.len() > limit {
                        if let Ok(mut m) = Message::unpack(&out) {
                            m.truncated = true;
                            m.answer.clear();
                            m.ns.clear();
                            m.extra.retain(|rr| rr.rrtype == ironroot::RrType::Opt);
                            out = m.pack();
                        }
                    }
                    if let Err(err) = socket.send_to(&out, remote).await {
                        debug!("udp send to {} failed: {}", remote, err);
                    }
                }
                fe.buffers.release(buf);
            });
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (mut stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("tcp accept failed: {}", err);
                    continue;
                }
            };
            let fe = self.clone();
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let Some(out) = fe.handle(&buf, remote).await else {
                        return;
                    };
                    let mut framed = (out.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&out);
                    if stream.write_all(&framed).await.is_err() {
                        return;
                    }
                }
            });
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ironroot=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!("failed to load {}: {}", path.display(), err);
                return;
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(dir) = args.data_dir {
        cfg.directory = dir;
    }

    if let Err(err) = std::fs::create_dir_all(&cfg.directory) {
        error!("cannot create data directory {}: {}", cfg.directory.display(), err);
        return;
    }

    info!("ironroot v{} starting", VERSION);
    info!(
        "bind {} | dnssec {} | qname-min level {} | max depth {}",
        cfg.bind, cfg.dnssec, cfg.qname_min_level, cfg.maxdepth
    );

    let anchors = Arc::new(TrustAnchors::load_or_seed(
        &cfg.directory,
        &cfg.root_key_records(),
        chrono::Utc::now().timestamp(),
    ));
    if cfg.dnssec && anchors.is_empty() {
        error!("dnssec enabled but no usable trust anchors");
        return;
    }

    let resolver = Resolver::new(&cfg, anchors);
    let chain = Chain::new(vec![Arc::new(ResolverHandler::new(resolver.clone()))]);
    resolver.attach_chain(chain.clone());
    resolver.start_background();

    let udp = match UdpSocket::bind(&cfg.bind).await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            error!("cannot bind udp {}: {}", cfg.bind, err);
            return;
        }
    };
    let tcp = match TcpListener::bind(&cfg.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind tcp {}: {}", cfg.bind, err);
            return;
        }
    };

    let front = Arc::new(FrontEnd::new(chain));
    tokio::spawn(front.clone().run_udp(udp));
    tokio::spawn(front.clone().run_tcp(tcp));

    // periodic status line
    let status_resolver = resolver.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!(
                "status: {} cached delegations | {} root servers",
                status_resolver.ncache_len(),
                status_resolver.root_server_addrs().len()
            );
        }
    });

    info!("ironroot running on {}", cfg.bind);
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}
