//! The libp2p-backed content router.
//!
//! One task owns the swarm: Kademlia for provider records, identify for
//! address discovery, and a request-response protocol for the inventory
//! key exchange. Everything else talks to it over a command channel.

use crate::bootstrap::{DynBootstrapper, PeerAddr};
use crate::{provider_key, KEY_EXCHANGE_PROTOCOL};
use bytes::Bytes;
use clyde_api::*;
use futures::prelude::*;
use libp2p::kad::{
    self, store::MemoryStore, QueryId, RecordKey,
};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{
    self, OutboundRequestId, ProtocolSupport,
};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, identity, Multiaddr, PeerId, StreamProtocol, Swarm};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Upper bound on the inventory blob read from a peer. Inventories are
/// kilobytes of JSON; anything near this size is hostile or broken.
const MAX_INVENTORY_BYTES: u64 = 8 * 1024 * 1024;

/// Buffer size used for resolve channels when the caller asks for
/// unlimited candidates.
const UNLIMITED_RESOLVE_BUFFER: usize = 20;

/// Configuration for [P2pRouter].
#[derive(Debug, Clone)]
pub struct P2pRouterConfig {
    /// Address the DHT transport listens on.
    pub router_addr: SocketAddr,
    /// Port peers serve their front listener on; substituted into every
    /// resolved peer address in place of the DHT transport port.
    pub registry_port: u16,
    /// Directory holding the persistent host identity. A fresh
    /// throwaway identity is generated when unset.
    pub data_dir: Option<std::path::PathBuf>,
}

impl Default for P2pRouterConfig {
    fn default() -> Self {
        Self {
            router_addr: ([0, 0, 0, 0], 5001).into(),
            registry_port: 5000,
            data_dir: None,
        }
    }
}

/// Codec for the key-exchange protocol: the request is empty, the
/// response is the raw inventory blob read to end-of-stream.
#[derive(Debug, Clone, Default)]
pub struct KeyExchangeCodec;

#[async_trait::async_trait]
impl request_response::Codec for KeyExchangeCodec {
    type Protocol = StreamProtocol;
    type Request = ();
    type Response = Bytes;

    async fn read_request<T>(
        &mut self,
        _: &StreamProtocol,
        _io: &mut T,
    ) -> std::io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> std::io::Result<Bytes>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_INVENTORY_BYTES).read_to_end(&mut buf).await?;
        Ok(buf.into())
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        _io: &mut T,
        _req: (),
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        res: Bytes,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&res).await
    }
}

#[derive(NetworkBehaviour)]
struct RouterBehaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    key_exchange: request_response::Behaviour<KeyExchangeCodec>,
}

enum Command {
    StartProviding {
        key: String,
        reply: oneshot::Sender<ClydeResult<()>>,
    },
    Resolve {
        key: String,
        count: usize,
        tx: mpsc::Sender<SocketAddr>,
    },
    ServeKeys {
        data: Bytes,
    },
    FetchKeys {
        peer: PeerId,
        reply: oneshot::Sender<ClydeResult<Bytes>>,
    },
    RoutingTableSize {
        reply: oneshot::Sender<usize>,
    },
    AddPeers {
        peers: Vec<PeerAddr>,
    },
}

/// The Kademlia-backed [Router] implementation.
pub struct P2pRouter {
    cmd_tx: mpsc::Sender<Command>,
    bootstrapper: DynBootstrapper,
    local_peer_id: PeerId,
    external_addr: Multiaddr,
    external_ip: IpAddr,
    router_port: u16,
    peer_id_by_addr: Arc<RwLock<HashMap<SocketAddr, PeerId>>>,
    task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for P2pRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pRouter")
            .field("peer_id", &self.local_peer_id)
            .field("external_addr", &self.external_addr)
            .finish()
    }
}

impl Drop for P2pRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl P2pRouter {
    /// Construct the router: load or create the host identity, bind the
    /// DHT transport, choose the single published external address, and
    /// start the swarm task. Fails when no usable non-loopback address
    /// is available.
    pub async fn new(
        config: P2pRouterConfig,
        bootstrapper: DynBootstrapper,
    ) -> ClydeResult<Self> {
        let keypair = match &config.data_dir {
            Some(dir) => crate::load_or_create_keypair(dir)?,
            None => identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());

        let mut swarm = build_swarm(keypair)?;
        swarm
            .listen_on(socket_addr_to_multiaddr(config.router_addr))
            .map_err(|e| {
                ClydeError::init_src(
                    format!("could not listen on {}", config.router_addr),
                    e,
                )
            })?;

        let external_addr = wait_external_addr(&mut swarm).await?;
        let external_ip = multiaddr_ip(&external_addr).ok_or_else(|| {
            ClydeError::init("published address carries no ip")
        })?;
        swarm.add_external_address(external_addr.clone());
        tracing::info!(
            peer_id = %local_peer_id,
            address = %external_addr,
            "starting p2p router"
        );

        let peer_id_by_addr: Arc<RwLock<HashMap<SocketAddr, PeerId>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let task = tokio::task::spawn(
            Task {
                swarm,
                cmd_rx,
                local_peer_id,
                external_addr: external_addr.clone(),
                registry_port: config.registry_port,
                local_keys: Bytes::new(),
                peer_addrs: HashMap::new(),
                pending_advertise: HashMap::new(),
                resolves: HashMap::new(),
                pending_fetch: HashMap::new(),
                peer_id_by_addr: peer_id_by_addr.clone(),
            }
            .run(),
        );

        Ok(Self {
            cmd_tx,
            bootstrapper,
            local_peer_id,
            external_addr,
            external_ip,
            router_port: config.router_addr.port(),
            peer_id_by_addr,
            task,
        })
    }

    /// The full multiaddr this node publishes, `/p2p/<id>` included.
    pub fn self_addr(&self) -> String {
        format!("{}/p2p/{}", self.external_addr, self.local_peer_id)
    }

    /// The host peer identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Join the DHT and run the bootstrapper's long-lived side. Returns
    /// when the bootstrapper shuts down.
    pub async fn run(&self) -> ClydeResult<()> {
        self.bootstrap().await?;
        self.bootstrapper.run(self.self_addr()).await
    }

    async fn bootstrap(&self) -> ClydeResult<()> {
        let peers = self.bootstrap_peers().await?;
        if peers.is_empty() {
            tracing::info!("no bootstrap nodes found");
            return Ok(());
        }
        self.send(Command::AddPeers { peers }).await
    }

    /// Bootstrap addresses with self filtered out and missing ports
    /// filled in from the local router port.
    async fn bootstrap_peers(&self) -> ClydeResult<Vec<PeerAddr>> {
        let peers = self.bootstrapper.get().await?;
        Ok(peers
            .into_iter()
            .map(|p| p.with_default_port(self.router_port))
            .filter(|p| {
                if self.matches_self(p) {
                    tracing::debug!(addr = %p.addr, "skipping bootstrap peer that is same as host");
                    return false;
                }
                true
            })
            .collect())
    }

    fn matches_self(&self, peer: &PeerAddr) -> bool {
        if let Some(id) = peer.id {
            return id == self.local_peer_id;
        }
        peer.ip() == Some(self.external_ip)
    }

    async fn send(&self, cmd: Command) -> ClydeResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ClydeError::other("router task stopped"))
    }
}

impl Router for P2pRouter {
    fn ready(&self) -> BoxFut<'_, ClydeResult<bool>> {
        Box::pin(async {
            let peers = self.bootstrapper.get().await?;
            if peers.is_empty() {
                return Ok(false);
            }
            if peers.len() == 1 && self.matches_self(&peers[0]) {
                return Ok(true);
            }
            let (reply, rx) = oneshot::channel();
            self.send(Command::RoutingTableSize { reply }).await?;
            let size = rx
                .await
                .map_err(|_| ClydeError::other("router task stopped"))?;
            if size > 0 {
                return Ok(true);
            }
            // Not joined yet; kick another bootstrap attempt and report
            // unready so the caller probes again.
            self.bootstrap().await?;
            Ok(false)
        })
    }

    fn resolve(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFut<'_, ClydeResult<mpsc::Receiver<SocketAddr>>> {
        let key = key.to_string();
        Box::pin(async move {
            let buffer = if count == 0 {
                UNLIMITED_RESOLVE_BUFFER
            } else {
                count
            };
            let (tx, rx) = mpsc::channel(buffer);
            self.send(Command::Resolve { key, count, tx }).await?;
            Ok(rx)
        })
    }

    fn advertise(&self, keys: Vec<String>) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async move {
            for key in keys {
                let (reply, rx) = oneshot::channel();
                self.send(Command::StartProviding { key, reply }).await?;
                rx.await
                    .map_err(|_| ClydeError::other("router task stopped"))??;
            }
            Ok(())
        })
    }

    fn serve_keys(&self, data: Bytes) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async move {
            tracing::debug!(length = data.len(), "installing local key inventory");
            self.send(Command::ServeKeys { data }).await
        })
    }

    fn fetch_peer_keys(
        &self,
        peer: SocketAddr,
    ) -> BoxFut<'_, ClydeResult<Bytes>> {
        Box::pin(async move {
            let peer_id = self
                .peer_id_by_addr
                .read()
                .expect("peer id table poisoned")
                .get(&peer)
                .copied()
                .ok_or_else(|| {
                    ClydeError::other(format!(
                        "unknown peer id for {peer}; ensure resolve of the peer index ran first"
                    ))
                })?;
            let (reply, rx) = oneshot::channel();
            self.send(Command::FetchKeys {
                peer: peer_id,
                reply,
            })
            .await?;
            rx.await
                .map_err(|_| ClydeError::other("router task stopped"))?
        })
    }
}

struct ResolveState {
    key: String,
    tx: mpsc::Sender<SocketAddr>,
    remaining: usize,
    peer_index: bool,
    seen: HashSet<PeerId>,
    started: Instant,
}

struct Task {
    swarm: Swarm<RouterBehaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    local_peer_id: PeerId,
    external_addr: Multiaddr,
    registry_port: u16,
    local_keys: Bytes,
    peer_addrs: HashMap<PeerId, HashSet<Multiaddr>>,
    pending_advertise: HashMap<QueryId, oneshot::Sender<ClydeResult<()>>>,
    resolves: HashMap<QueryId, ResolveState>,
    pending_fetch:
        HashMap<OutboundRequestId, oneshot::Sender<ClydeResult<Bytes>>>,
    peer_id_by_addr: Arc<RwLock<HashMap<SocketAddr, PeerId>>>,
}

impl Task {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartProviding { key, reply } => {
                let record_key = RecordKey::new(&provider_key(&key));
                match self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(record_key)
                {
                    Ok(query_id) => {
                        self.pending_advertise.insert(query_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(ClydeError::other_src(
                            format!("could not provide key {key}"),
                            err,
                        )));
                    }
                }
            }
            Command::Resolve { key, count, tx } => {
                let record_key = RecordKey::new(&provider_key(&key));
                let query_id =
                    self.swarm.behaviour_mut().kad.get_providers(record_key);
                self.resolves.insert(
                    query_id,
                    ResolveState {
                        peer_index: key == PEER_INDEX_KEY,
                        key,
                        tx,
                        remaining: if count == 0 { usize::MAX } else { count },
                        seen: HashSet::new(),
                        started: Instant::now(),
                    },
                );
            }
            Command::ServeKeys { data } => {
                self.local_keys = data;
            }
            Command::FetchKeys { peer, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .key_exchange
                    .send_request(&peer, ());
                self.pending_fetch.insert(request_id, reply);
            }
            Command::RoutingTableSize { reply } => {
                let size: usize = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .kbuckets()
                    .map(|bucket| bucket.num_entries())
                    .sum();
                let _ = reply.send(size);
            }
            Command::AddPeers { peers } => {
                for peer in peers {
                    match peer.id {
                        Some(id) => {
                            self.swarm
                                .behaviour_mut()
                                .kad
                                .add_address(&id, peer.addr.clone());
                        }
                        // The identity is unknown; dialing discovers it
                        // and identify feeds it into the routing table.
                        None => {
                            if let Err(err) =
                                self.swarm.dial(peer.addr.clone())
                            {
                                tracing::warn!(
                                    addr = %peer.addr,
                                    "could not dial bootstrap peer: {err}"
                                );
                            }
                        }
                    }
                }
                if let Err(err) = self.swarm.behaviour_mut().kad.bootstrap() {
                    tracing::debug!("dht bootstrap not started: {err}");
                }
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<RouterBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(RouterBehaviourEvent::Kad(event)) => {
                self.handle_kad_event(event)
            }
            SwarmEvent::Behaviour(RouterBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    self.peer_addrs.entry(peer_id).or_default().insert(addr);
                }
            }
            SwarmEvent::Behaviour(RouterBehaviourEvent::KeyExchange(
                event,
            )) => self.handle_key_exchange_event(event),
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                self.peer_addrs
                    .entry(peer_id)
                    .or_default()
                    .insert(endpoint.get_remote_address().clone());
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::StartProviding(result),
                ..
            } => {
                if let Some(reply) = self.pending_advertise.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|err| {
                        ClydeError::other_src("could not advertise key", err)
                    }));
                }
            }
            kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetProviders(result),
                step,
                ..
            } => {
                self.handle_providers(id, result);
                if step.last {
                    self.finish_resolve(id);
                }
            }
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                self.peer_addrs
                    .entry(peer)
                    .or_default()
                    .extend(addresses.iter().cloned());
            }
            _ => {}
        }
    }

    fn handle_providers(
        &mut self,
        id: QueryId,
        result: Result<kad::GetProvidersOk, kad::GetProvidersError>,
    ) {
        let Some(state) = self.resolves.get_mut(&id) else {
            return;
        };
        let providers = match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                providers
            }
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            }) => return,
            Err(err) => {
                tracing::debug!(key = %state.key, "provider lookup failed: {err}");
                return;
            }
        };

        for provider in providers {
            if !state.seen.insert(provider) || state.remaining == 0 {
                continue;
            }

            let addrs: Vec<Multiaddr> = if provider == self.local_peer_id {
                vec![self.external_addr.clone()]
            } else {
                self.peer_addrs
                    .get(&provider)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default()
            };
            let ips: Vec<IpAddr> =
                addrs.iter().filter_map(multiaddr_ip).collect();
            let candidates = provider_candidates(
                state.peer_index,
                ips,
                self.registry_port,
            );
            if candidates.is_empty() {
                tracing::debug!(
                    key = %state.key,
                    peer = %provider,
                    "unexpected number of provider addresses"
                );
                continue;
            }

            for addr in candidates {
                if state.remaining == 0 {
                    break;
                }
                if state.peer_index {
                    // Remember the identity behind each address; the
                    // later key-exchange dial needs it.
                    self.peer_id_by_addr
                        .write()
                        .expect("peer id table poisoned")
                        .insert(addr, provider);
                }
                match state.tx.try_send(addr) {
                    Ok(()) => state.remaining -= 1,
                    Err(_) => {
                        tracing::debug!(key = %state.key, %addr, "peer dropped, channel full");
                    }
                }
            }
        }

        if state.remaining == 0 {
            if let Some(mut query) =
                self.swarm.behaviour_mut().kad.query_mut(&id)
            {
                query.finish();
            }
        }
    }

    fn finish_resolve(&mut self, id: QueryId) {
        // Dropping the state closes the channel, which tells the caller
        // the lookup is over.
        if let Some(state) = self.resolves.remove(&id) {
            clyde_metrics::metrics()
                .resolve_duration_seconds
                .with_label_values(&["libp2p"])
                .observe(state.started.elapsed().as_secs_f64());
        }
    }

    fn handle_key_exchange_event(
        &mut self,
        event: request_response::Event<(), Bytes>,
    ) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Request { channel, .. } => {
                    let data = if self.local_keys.is_empty() {
                        Bytes::from_static(b"[]")
                    } else {
                        self.local_keys.clone()
                    };
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .key_exchange
                        .send_response(channel, data);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_fetch.remove(&request_id)
                    {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_fetch.remove(&request_id) {
                    let _ = reply.send(Err(ClydeError::transport(format!(
                        "key exchange request failed: {error}"
                    ))));
                }
            }
            request_response::Event::InboundFailure { .. }
            | request_response::Event::ResponseSent { .. } => {}
        }
    }
}

fn build_swarm(
    keypair: identity::Keypair,
) -> ClydeResult<Swarm<RouterBehaviour>> {
    let local_peer_id = PeerId::from(keypair.public());
    libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default().nodelay(true),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| ClydeError::init_src("could not build transport", e))?
        .with_behaviour(|key| {
            let mut kad_config =
                kad::Config::new(StreamProtocol::new(crate::DHT_PROTOCOL));
            // Provider-only usage; record TTLs bound how long a key
            // outlives its last republish.
            kad_config.set_provider_record_ttl(Some(crate::KEY_TTL));
            kad_config.set_record_ttl(Some(crate::KEY_TTL));
            let mut kad = kad::Behaviour::with_config(
                local_peer_id,
                MemoryStore::new(local_peer_id),
                kad_config,
            );
            kad.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(identify::Config::new(
                "/clyde/id/1.0.0".into(),
                key.public(),
            ));

            let key_exchange = request_response::Behaviour::with_codec(
                KeyExchangeCodec,
                [(
                    StreamProtocol::new(KEY_EXCHANGE_PROTOCOL),
                    ProtocolSupport::Full,
                )],
                request_response::Config::default(),
            );

            RouterBehaviour {
                kad,
                identify,
                key_exchange,
            }
        })
        .map_err(|e| ClydeError::init_src("could not build behaviour", e))
        .map(|builder| {
            builder
                .with_swarm_config(|config| {
                    config
                        .with_idle_connection_timeout(Duration::from_secs(120))
                })
                .build()
        })
}

/// Turn one provider's distinct IPs into registry addresses. The
/// general case insists on exactly one address per provider; the peer
/// index emits every address so a multi-homed peer stays reachable for
/// inventory exchange.
fn provider_candidates(
    peer_index: bool,
    mut ips: Vec<IpAddr>,
    registry_port: u16,
) -> Vec<SocketAddr> {
    ips.sort();
    ips.dedup();
    if !peer_index && ips.len() != 1 {
        return Vec::new();
    }
    ips.into_iter()
        .map(|ip| SocketAddr::new(ip, registry_port))
        .collect()
}

fn socket_addr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}

pub(crate) fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Pick the one address this host publishes: loopback and unspecified
/// addresses are dropped, and IPv6 wins over IPv4.
pub(crate) fn select_external_addr(
    addrs: &[Multiaddr],
) -> Option<Multiaddr> {
    let mut ip4 = None;
    let mut ip6 = None;
    for addr in addrs {
        match multiaddr_ip(addr) {
            Some(ip) if ip.is_loopback() || ip.is_unspecified() => continue,
            Some(IpAddr::V6(_)) => ip6 = Some(addr.clone()),
            Some(IpAddr::V4(_)) => ip4 = Some(addr.clone()),
            None => continue,
        }
    }
    ip6.or(ip4)
}

/// Wait for the transport listeners to come up and select the external
/// address from them.
async fn wait_external_addr(
    swarm: &mut Swarm<RouterBehaviour>,
) -> ClydeResult<Multiaddr> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut listen_addrs = Vec::new();
    loop {
        // After the first listener appears, give if-watch a short grace
        // period to report the remaining interfaces.
        let wait = if listen_addrs.is_empty() {
            deadline.saturating_duration_since(Instant::now())
        } else {
            Duration::from_millis(300)
        };
        match tokio::time::timeout(wait, swarm.select_next_some()).await {
            Ok(SwarmEvent::NewListenAddr { address, .. }) => {
                listen_addrs.push(address);
            }
            Ok(_) => {}
            Err(_) => break,
        }
        if Instant::now() >= deadline {
            break;
        }
    }
    select_external_addr(&listen_addrs).ok_or_else(|| {
        ClydeError::init(format!(
            "expected a usable host address but got {}",
            listen_addrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn external_addr_drops_loopback() {
        assert_eq!(
            None,
            select_external_addr(&[ma("/ip4/127.0.0.1/tcp/5001")])
        );
        assert_eq!(None, select_external_addr(&[ma("/ip6/::1/tcp/5001")]));
    }

    #[test]
    fn external_addr_prefers_ip6() {
        let picked = select_external_addr(&[
            ma("/ip4/10.0.0.7/tcp/5001"),
            ma("/ip6/fd00::7/tcp/5001"),
            ma("/ip4/127.0.0.1/tcp/5001"),
        ])
        .unwrap();
        assert_eq!(ma("/ip6/fd00::7/tcp/5001"), picked);
    }

    #[test]
    fn external_addr_falls_back_to_ip4() {
        let picked = select_external_addr(&[
            ma("/ip4/127.0.0.1/tcp/5001"),
            ma("/ip4/10.0.0.7/tcp/5001"),
        ])
        .unwrap();
        assert_eq!(ma("/ip4/10.0.0.7/tcp/5001"), picked);
    }

    #[test]
    fn external_addr_skips_unspecified() {
        assert_eq!(
            None,
            select_external_addr(&[ma("/ip4/0.0.0.0/tcp/5001")])
        );
    }

    #[test]
    fn provider_policy_requires_single_address() {
        let one: Vec<IpAddr> = vec!["10.0.0.7".parse().unwrap()];
        assert_eq!(
            vec!["10.0.0.7:5000".parse::<SocketAddr>().unwrap()],
            provider_candidates(false, one, 5000)
        );

        let none: Vec<IpAddr> = vec![];
        assert!(provider_candidates(false, none, 5000).is_empty());

        let two: Vec<IpAddr> = vec![
            "10.0.0.7".parse().unwrap(),
            "10.0.0.8".parse().unwrap(),
        ];
        assert!(provider_candidates(false, two, 5000).is_empty());
    }

    #[test]
    fn provider_policy_duplicates_collapse_to_one() {
        let dup: Vec<IpAddr> = vec![
            "10.0.0.7".parse().unwrap(),
            "10.0.0.7".parse().unwrap(),
        ];
        assert_eq!(1, provider_candidates(false, dup, 5000).len());
    }

    #[test]
    fn peer_index_emits_every_address() {
        let two: Vec<IpAddr> = vec![
            "10.0.0.7".parse().unwrap(),
            "10.0.0.8".parse().unwrap(),
        ];
        let out = provider_candidates(true, two, 5000);
        assert_eq!(
            vec![
                "10.0.0.7:5000".parse::<SocketAddr>().unwrap(),
                "10.0.0.8:5000".parse::<SocketAddr>().unwrap(),
            ],
            out
        );
    }

    #[test]
    fn socket_addr_conversion() {
        let addr: SocketAddr = "10.0.0.7:5001".parse().unwrap();
        assert_eq!(
            ma("/ip4/10.0.0.7/tcp/5001"),
            socket_addr_to_multiaddr(addr)
        );
        assert_eq!(
            Some(addr.ip()),
            multiaddr_ip(&socket_addr_to_multiaddr(addr))
        );
    }
}
