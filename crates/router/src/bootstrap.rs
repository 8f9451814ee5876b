//! Peer bootstrapping.
//!
//! A bootstrapper produces the initial set of peer addresses the router
//! joins the DHT through: a static list, DNS SRV discovery, or a small
//! HTTP rendezvous where each node serves its own address.

use clyde_api::*;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::net::IpAddr;
use std::sync::Arc;

/// A peer address produced by a bootstrapper. The identity is optional;
/// the router discovers missing identities by dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    /// The peer identity, when the bootstrap source knows it.
    pub id: Option<PeerId>,
    /// The peer's router transport address.
    pub addr: Multiaddr,
}

impl PeerAddr {
    /// Parse a multiaddr string, splitting off a trailing `/p2p/<id>`
    /// component into the identity.
    pub fn parse(s: &str) -> ClydeResult<Self> {
        let mut addr: Multiaddr = s.parse().map_err(|e| {
            ClydeError::other_src(format!("invalid peer address {s}"), e)
        })?;
        let id = match addr.iter().last() {
            Some(Protocol::P2p(id)) => {
                addr.pop();
                Some(id)
            }
            _ => None,
        };
        Ok(Self { id, addr })
    }

    /// The IP address component, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        self.addr.iter().find_map(|p| match p {
            Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        })
    }

    /// True when the address already carries a TCP port.
    pub fn has_port(&self) -> bool {
        self.addr.iter().any(|p| matches!(p, Protocol::Tcp(_)))
    }

    /// Return a copy with the TCP port appended when it was missing.
    pub fn with_default_port(&self, port: u16) -> Self {
        if self.has_port() {
            return self.clone();
        }
        let mut addr = self.addr.clone();
        addr.push(Protocol::Tcp(port));
        Self {
            id: self.id,
            addr,
        }
    }
}

/// Produces initial peer addresses for DHT bootstrap.
pub trait Bootstrapper: 'static + Send + Sync + std::fmt::Debug {
    /// Run any long-lived side of the bootstrapper, such as the HTTP
    /// rendezvous listener. `self_addr` is this node's full multiaddr
    /// including the `/p2p/<id>` suffix. Runs for the lifetime of the
    /// node; bootstrappers with nothing to serve simply park here.
    fn run(&self, self_addr: String) -> BoxFut<'_, ClydeResult<()>>;

    /// Fetch the current set of bootstrap peer addresses.
    fn get(&self) -> BoxFut<'_, ClydeResult<Vec<PeerAddr>>>;
}

/// Trait-object [Bootstrapper].
pub type DynBootstrapper = Arc<dyn Bootstrapper>;

/// Bootstrapper backed by a fixed list of peer addresses.
#[derive(Debug)]
pub struct StaticBootstrapper {
    peers: Vec<PeerAddr>,
}

impl StaticBootstrapper {
    /// Construct from already parsed peer addresses.
    pub fn new(peers: Vec<PeerAddr>) -> Self {
        Self { peers }
    }

    /// Construct from multiaddr strings.
    pub fn from_strings<S: AsRef<str>>(peers: &[S]) -> ClydeResult<Self> {
        let peers = peers
            .iter()
            .map(|s| PeerAddr::parse(s.as_ref()))
            .collect::<ClydeResult<Vec<_>>>()?;
        Ok(Self { peers })
    }
}

impl Bootstrapper for StaticBootstrapper {
    fn run(&self, _self_addr: String) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(std::future::pending())
    }

    fn get(&self) -> BoxFut<'_, ClydeResult<Vec<PeerAddr>>> {
        Box::pin(async { Ok(self.peers.clone()) })
    }
}

/// Bootstrapper that discovers peers through DNS SRV records.
#[derive(Debug)]
pub struct DnsBootstrapper {
    domain: String,
    limit: usize,
}

impl DnsBootstrapper {
    /// Construct a bootstrapper resolving SRV records under `domain`,
    /// returning at most `limit` peers.
    pub fn new(domain: impl Into<String>, limit: usize) -> Self {
        Self {
            domain: domain.into(),
            limit,
        }
    }
}

impl Bootstrapper for DnsBootstrapper {
    fn run(&self, _self_addr: String) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(std::future::pending())
    }

    fn get(&self) -> BoxFut<'_, ClydeResult<Vec<PeerAddr>>> {
        Box::pin(async {
            let resolver = hickory_resolver::TokioResolver::builder_tokio()
                .map_err(|e| {
                    ClydeError::other_src("could not construct resolver", e)
                })?
                .build();
            let srv = resolver.srv_lookup(&self.domain).await.map_err(|e| {
                ClydeError::other_src(
                    format!("srv lookup failed for {}", self.domain),
                    e,
                )
            })?;

            let mut peers = Vec::new();
            'outer: for record in srv.iter() {
                let target = record.target().to_utf8();
                let port = record.port();
                let ips = resolver.lookup_ip(target.as_str()).await.map_err(
                    |e| {
                        ClydeError::other_src(
                            format!("ip lookup failed for {target}"),
                            e,
                        )
                    },
                )?;
                for ip in ips.iter() {
                    let mut addr = Multiaddr::empty();
                    match ip {
                        IpAddr::V4(ip) => addr.push(Protocol::Ip4(ip)),
                        IpAddr::V6(ip) => addr.push(Protocol::Ip6(ip)),
                    }
                    addr.push(Protocol::Tcp(port));
                    peers.push(PeerAddr { id: None, addr });
                    if peers.len() >= self.limit {
                        break 'outer;
                    }
                }
            }
            Ok(peers)
        })
    }
}

/// Bootstrapper using an HTTP rendezvous: every node serves its own full
/// multiaddr on `listen_addr` and reads one peer's from `peer_url`.
#[derive(Debug)]
pub struct HttpBootstrapper {
    listen_addr: std::net::SocketAddr,
    peer_url: String,
}

impl HttpBootstrapper {
    /// Construct with the local rendezvous listen address and the peer
    /// rendezvous URL.
    pub fn new(
        listen_addr: std::net::SocketAddr,
        peer_url: impl Into<String>,
    ) -> Self {
        Self {
            listen_addr,
            peer_url: peer_url.into(),
        }
    }
}

impl Bootstrapper for HttpBootstrapper {
    fn run(&self, self_addr: String) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async move {
            let app = axum::Router::new().route(
                "/id",
                axum::routing::get(move || {
                    let self_addr = self_addr.clone();
                    async move { self_addr }
                }),
            );
            let listener = tokio::net::TcpListener::bind(self.listen_addr)
                .await
                .map_err(|e| {
                    ClydeError::init_src(
                        format!(
                            "could not bind bootstrap listener {}",
                            self.listen_addr
                        ),
                        e,
                    )
                })?;
            axum::serve(listener, app)
                .await
                .map_err(|e| ClydeError::other_src("bootstrap listener", e))
        })
    }

    fn get(&self) -> BoxFut<'_, ClydeResult<Vec<PeerAddr>>> {
        Box::pin(async {
            let body = reqwest::Client::new()
                .get(&self.peer_url)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| {
                    ClydeError::transport_src(
                        format!("could not reach rendezvous {}", self.peer_url),
                        e,
                    )
                })?
                .text()
                .await
                .map_err(|e| {
                    ClydeError::transport_src("rendezvous response", e)
                })?;
            let peer = PeerAddr::parse(body.trim())?;
            Ok(vec![peer])
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_splits_peer_id() {
        let peer = PeerAddr::parse(
            "/ip4/10.0.0.7/tcp/5001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN",
        )
        .unwrap();
        assert!(peer.id.is_some());
        assert_eq!("/ip4/10.0.0.7/tcp/5001", peer.addr.to_string());
        assert_eq!(Some("10.0.0.7".parse().unwrap()), peer.ip());
        assert!(peer.has_port());
    }

    #[test]
    fn parse_without_identity() {
        let peer = PeerAddr::parse("/ip4/10.0.0.7/tcp/5001").unwrap();
        assert_eq!(None, peer.id);
    }

    #[test]
    fn default_port_fills_missing_tcp() {
        let peer = PeerAddr::parse("/ip4/10.0.0.7").unwrap();
        assert!(!peer.has_port());
        let filled = peer.with_default_port(5001);
        assert_eq!("/ip4/10.0.0.7/tcp/5001", filled.addr.to_string());
        // Already present ports are left alone.
        let same = filled.with_default_port(9999);
        assert_eq!(filled.addr, same.addr);
    }

    #[tokio::test]
    async fn static_bootstrapper_round_trip() {
        let bs = StaticBootstrapper::from_strings(&[
            "/ip4/10.0.0.7/tcp/5001",
            "/ip4/10.0.0.8/tcp/5001",
        ])
        .unwrap();
        let peers = bs.get().await.unwrap();
        assert_eq!(2, peers.len());

        // The long-lived side has nothing to serve and parks.
        let parked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            bs.run("unused".into()),
        )
        .await;
        assert!(parked.is_err());
    }

    #[test]
    fn static_bootstrapper_rejects_garbage() {
        assert!(StaticBootstrapper::from_strings(&["not-a-multiaddr"])
            .is_err());
    }
}
