//! The peer runtime: every node, whatever its role, is a router that
//! owns a set of listening sockets and outbound connections and
//! speaks `Content-Length`-framed JSON-RPC over all of them.
//!
//! Per connection one cooperative loop demultiplexes inbound frames
//! into requests, responses and notifications, runs handlers as
//! tracked tasks, and serializes outbound frames through the
//! connection's send queue. Connections run concurrently; the router
//! owns every piece of per-connection state.

mod connection;
mod context;
mod error;
mod registry;

pub use {
  context::Context,
  error::RpcError,
  registry::{ConnectionSide, Registry, RegistryBuilder},
};

use {
  crate::{config::PeerInfo, wire::Message},
  connection::{ConnectionHandle, Origin},
  dashmap::DashMap,
  rand::{distributions::Alphanumeric, Rng},
  serde_json::Value,
  std::{
    net::SocketAddr,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
  },
  tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
  },
  tokio_util::task::TaskTracker,
  tracing::{debug, info, warn},
};

fn random_id(len: usize) -> String {
  rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(len)
    .map(char::from)
    .collect()
}

pub(crate) fn notification(method: &str, params: Value) -> Message {
  Message::Notification {
    method: method.to_owned(),
    params,
  }
}

struct ServerHandle {
  exit: watch::Sender<bool>,
  addr: SocketAddr,
}

/// One node's runtime. Owns connections, listening sockets, the
/// pending-request map and the background task set.
pub struct Router {
  node_id: String,
  registry: Registry,
  connections: DashMap<String, Arc<ConnectionHandle>>,
  servers: DashMap<u64, ServerHandle>,
  pending: DashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
  next_request_id: AtomicU64,
  next_server_id: AtomicU64,
  shutdown: watch::Sender<bool>,
  tracker: TaskTracker,
}

impl Router {
  pub fn new(node_id: impl Into<String>, registry: Registry) -> Arc<Self> {
    let (shutdown, _) = watch::channel(false);
    Arc::new(Self {
      node_id: node_id.into(),
      registry,
      connections: DashMap::new(),
      servers: DashMap::new(),
      pending: DashMap::new(),
      next_request_id: AtomicU64::new(0),
      next_server_id: AtomicU64::new(0),
      shutdown,
      tracker: TaskTracker::new(),
    })
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  pub(crate) fn registry(&self) -> &Registry {
    &self.registry
  }

  /// Binds a listening socket and starts accepting connections on a
  /// background task. Returns the server id and the bound address
  /// (useful when the configured port was 0).
  pub async fn start_server(
    self: &Arc<Self>,
    addr: SocketAddr,
  ) -> std::io::Result<(u64, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let server_id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
    let (exit, mut exit_rx) = watch::channel(false);
    self.servers.insert(server_id, ServerHandle { exit, addr: local });

    let router = self.clone();
    self.tracker.spawn(async move {
      info!("{}: server listening on {local}", router.node_id);
      loop {
        tokio::select! {
          _ = exit_rx.changed() => break,
          accepted = listener.accept() => match accepted {
            Ok((stream, remote)) => {
              debug!("{}: accepted {remote}", router.node_id);
              router.register(
                format!("unknown:{}", random_id(8)),
                None,
                Origin::Inbound(server_id),
                stream,
              );
            }
            Err(err) => warn!("{}: accept failed: {err}", router.node_id),
          },
        }
      }
      info!("{}: server on {local} shut down", router.node_id);
    });

    Ok((server_id, local))
  }

  /// Dials a peer and registers the connection under its id (or an
  /// `unknown:` placeholder when no config is given).
  pub async fn start_connection(
    self: &Arc<Self>,
    addr: SocketAddr,
    peer: Option<PeerInfo>,
  ) -> std::io::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let id = peer
      .as_ref()
      .map(|peer| peer.id.clone())
      .unwrap_or_else(|| format!("unknown:{}", random_id(8)));
    Ok(self.register(id, peer, Origin::Outbound, stream))
  }

  fn register(
    self: &Arc<Self>,
    id: String,
    peer: Option<PeerInfo>,
    origin: Origin,
    stream: TcpStream,
  ) -> String {
    let mut id = id;
    while self.connections.contains_key(&id) {
      id = format!("{id}:{}", random_id(4));
    }
    let (handle, outbox_rx) = ConnectionHandle::new(id.clone(), peer, origin);
    self.connections.insert(id.clone(), handle.clone());
    let router = self.clone();
    self
      .tracker
      .spawn(connection::run(router, handle, outbox_rx, stream));
    id
  }

  /// Sends `method` to the peer behind `conn_id` and waits for the
  /// matching response. There is no built-in timeout; wrap the call
  /// if the caller needs one.
  pub async fn request(
    &self,
    method: &str,
    params: Value,
    conn_id: &str,
  ) -> Result<Value, RpcError> {
    let handle = self
      .connections
      .get(conn_id)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| RpcError::new(format!("no connection to {conn_id}")))?;
    self.request_on(&handle, method, params).await
  }

  pub(crate) async fn request_on(
    &self,
    handle: &Arc<ConnectionHandle>,
    method: &str,
    params: Value,
  ) -> Result<Value, RpcError> {
    if handle.is_closed() {
      return Err(RpcError::new("connection closed"));
    }
    let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    self.pending.insert(id, tx);
    handle.track_request(id);
    let queued = handle.enqueue(Message::Request {
      id,
      method: method.to_owned(),
      params,
    });
    if !queued || handle.is_closed() {
      // lost the race against the connection winding down
      if handle.untrack_request(id) {
        self.resolve_local(id, Err(RpcError::new("connection closed")));
      }
    }
    match rx.await {
      Ok(result) => result,
      Err(_) => Err(RpcError::new("connection closed")),
    }
  }

  /// Enqueues a notification; returns once it sits in the send queue.
  pub fn notify(
    &self,
    method: &str,
    params: Value,
    conn_id: &str,
  ) -> Result<(), RpcError> {
    let handle = self
      .connections
      .get(conn_id)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| RpcError::new(format!("no connection to {conn_id}")))?;
    if handle.enqueue(notification(method, params)) {
      Ok(())
    } else {
      Err(RpcError::new("connection closed"))
    }
  }

  /// Fans a notification out to every connection whose peer config is
  /// known. Returns how many connections it reached.
  pub fn broadcast(&self, method: &str, params: Value) -> usize {
    let mut reached = 0;
    for entry in self.connections.iter() {
      if entry.value().peer().is_some()
        && entry.value().enqueue(notification(method, params.clone()))
      {
        reached += 1;
      }
    }
    reached
  }

  /// Resolution of a response frame received over `handle`.
  pub(crate) fn resolve(
    &self,
    handle: &Arc<ConnectionHandle>,
    id: u64,
    result: Result<Value, RpcError>,
  ) {
    handle.untrack_request(id);
    self.resolve_local(id, result);
  }

  pub(crate) fn resolve_local(
    &self,
    id: u64,
    result: Result<Value, RpcError>,
  ) {
    if let Some((_, tx)) = self.pending.remove(&id) {
      let _ = tx.send(result);
    }
    // unmatched responses are dropped
  }

  /// Moves a connection to the peer's real identity after a
  /// successful `who-are-you` exchange. Fails when another live
  /// connection already carries that id.
  pub(crate) fn rebind(
    &self,
    handle: &Arc<ConnectionHandle>,
    peer: PeerInfo,
  ) -> bool {
    let old_id = handle.id();
    let new_id = peer.id.clone();
    if old_id == new_id {
      let mut state = handle.state.write().expect("connection state lock");
      state.peer = Some(peer);
      return true;
    }
    match self.connections.entry(new_id.clone()) {
      dashmap::mapref::entry::Entry::Occupied(_) => {
        warn!(
          "{}: connection {new_id} already exists, keeping {old_id}",
          self.node_id
        );
        false
      }
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        vacant.insert(handle.clone());
        {
          let mut state = handle.state.write().expect("connection state lock");
          state.id = new_id.clone();
          state.peer = Some(peer);
        }
        self
          .connections
          .remove_if(&old_id, |_, value| Arc::ptr_eq(value, handle));
        info!("{}: connection {old_id} is now {new_id}", self.node_id);
        true
      }
    }
  }

  pub(crate) fn forget(&self, handle: &Arc<ConnectionHandle>) {
    let id = handle.id();
    self
      .connections
      .remove_if(&id, |_, value| Arc::ptr_eq(value, handle));
  }

  /// The connection id leading to the given configured peer, if any.
  pub fn peer_connection(&self, peer_id: &str) -> Option<String> {
    if let Some(entry) = self.connections.get(peer_id) {
      return Some(entry.key().clone());
    }
    self.connections.iter().find_map(|entry| {
      entry
        .value()
        .peer()
        .filter(|peer| peer.id == peer_id)
        .map(|_| entry.key().clone())
    })
  }

  /// Ids of the peers behind currently accepted inbound connections
  /// whose config is known.
  pub fn accepted_peers(&self) -> Vec<String> {
    let mut ids: Vec<String> = self
      .connections
      .iter()
      .filter(|entry| matches!(entry.value().origin, Origin::Inbound(_)))
      .filter_map(|entry| entry.value().peer().map(|peer| peer.id))
      .collect();
    ids.sort();
    ids
  }

  /// Snapshot of every live connection: registered id and peer.
  pub fn connections(&self) -> Vec<(String, Option<PeerInfo>)> {
    self
      .connections
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().peer()))
      .collect()
  }

  pub fn close_connection(&self, conn_id: &str) {
    if let Some(entry) = self.connections.get(conn_id) {
      entry.value().signal_exit();
    }
  }

  /// Stops accepting on the given server and winds down every
  /// connection it accepted; queued frames drain first.
  pub fn close_server(&self, server_id: u64) {
    if let Some(server) = self.servers.get(&server_id) {
      info!(
        "{}: closing server on {}",
        self.node_id,
        server.value().addr
      );
      let _ = server.value().exit.send(true);
    }
    for entry in self.connections.iter() {
      if entry.value().origin == Origin::Inbound(server_id) {
        entry.value().signal_exit();
      }
    }
  }

  /// Asks every server, connection and role task to wind down.
  pub fn shutdown(&self) {
    let _ = self.shutdown.send(true);
    let server_ids: Vec<u64> =
      self.servers.iter().map(|entry| *entry.key()).collect();
    for server_id in server_ids {
      self.close_server(server_id);
    }
    for entry in self.connections.iter() {
      entry.value().signal_exit();
    }
  }

  /// A watch that flips to `true` when [`Router::shutdown`] runs;
  /// long-running role tasks subscribe to it.
  pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
    self.shutdown.subscribe()
  }

  /// Tracks a role-level background task (block builder, HTTP
  /// server) in the router's task set.
  pub fn spawn<F>(&self, future: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    self.tracker.spawn(future);
  }

  /// Suspends until every tracked task (connections, servers, role
  /// tasks) has finished.
  pub async fn wait(&self) {
    self.tracker.close();
    self.tracker.wait().await;
  }
}
