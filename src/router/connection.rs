use {
  super::{Context, Router},
  crate::{
    config::PeerInfo,
    wire::{ErrorBody, FrameCodec, Message, ProtocolError},
  },
  futures::{
    future::BoxFuture,
    stream::FuturesUnordered,
    FutureExt,
    SinkExt,
    StreamExt,
  },
  std::{
    collections::HashSet,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
      Mutex,
      RwLock,
    },
  },
  tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
  },
  tokio_util::codec::Framed,
  tracing::{debug, info, warn},
};

pub(crate) use super::registry::ConnectionSide;

/// Where a connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
  /// Accepted by the listening socket with this server id.
  Inbound(u64),
  /// Dialed by this node.
  Outbound,
}

impl Origin {
  pub(crate) fn side(self) -> ConnectionSide {
    match self {
      Origin::Inbound(_) => ConnectionSide::Accepted,
      Origin::Outbound => ConnectionSide::Established,
    }
  }
}

pub(crate) struct ConnectionState {
  pub id: String,
  pub peer: Option<PeerInfo>,
}

/// The router's handle to one live connection: its identity, send
/// queue, exit signal and the ids of requests awaiting a response
/// from this peer.
pub(crate) struct ConnectionHandle {
  pub(crate) state: RwLock<ConnectionState>,
  pub(crate) origin: Origin,
  outbox: mpsc::UnboundedSender<Message>,
  exit: watch::Sender<bool>,
  closed: AtomicBool,
  issued: Mutex<HashSet<u64>>,
}

impl ConnectionHandle {
  pub(crate) fn new(
    id: String,
    peer: Option<PeerInfo>,
    origin: Origin,
  ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let (exit, _) = watch::channel(false);
    let handle = Arc::new(Self {
      state: RwLock::new(ConnectionState { id, peer }),
      origin,
      outbox,
      exit,
      closed: AtomicBool::new(false),
      issued: Mutex::new(HashSet::new()),
    });
    (handle, outbox_rx)
  }

  pub(crate) fn id(&self) -> String {
    self.state.read().expect("connection state lock").id.clone()
  }

  pub(crate) fn peer(&self) -> Option<PeerInfo> {
    self
      .state
      .read()
      .expect("connection state lock")
      .peer
      .clone()
  }

  /// Appends a frame to the send queue. Frames leave the socket in
  /// enqueue order. Returns false once the connection is gone.
  ///
  /// Responses from handlers that finish while the connection is
  /// winding down still get through: the loop drains the queue
  /// before closing the socket.
  pub(crate) fn enqueue(&self, message: Message) -> bool {
    self.outbox.send(message).is_ok()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Flips the exit signal; the connection drains its send queue and
  /// waits for in-flight handlers before the socket closes.
  pub(crate) fn signal_exit(&self) {
    let _ = self.exit.send(true);
  }

  pub(crate) fn track_request(&self, id: u64) {
    self.issued.lock().expect("issued lock").insert(id);
  }

  pub(crate) fn untrack_request(&self, id: u64) -> bool {
    self.issued.lock().expect("issued lock").remove(&id)
  }

  fn drain_issued(&self) -> Vec<u64> {
    self.issued.lock().expect("issued lock").drain().collect()
  }
}

/// Runs the I/O loop of one connection until it is quiescent: the
/// exit signal fired or the inbound half closed, the send queue is
/// empty and no handler task is in flight.
pub(crate) async fn run<S>(
  router: Arc<Router>,
  handle: Arc<ConnectionHandle>,
  mut outbox_rx: mpsc::UnboundedReceiver<Message>,
  stream: S,
) where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let node = router.node_id().to_owned();
  info!("{node}: connection {} started", handle.id());

  let (mut sink, mut inbound) =
    Framed::new(stream, FrameCodec::new()).split();
  let mut exit = handle.exit.subscribe();
  let mut exit_signalled = *exit.borrow();
  let mut inbound_open = true;
  let mut tasks: FuturesUnordered<BoxFuture<'static, ()>> =
    FuturesUnordered::new();

  // exactly one lifecycle listener fires per connection: the entry
  // matching the peer's role, or the default one
  let role = handle.peer().map(|peer| peer.role);
  if let Some(listener) = router.registry().listener(handle.origin.side(), role)
  {
    let ctx = Context::new(router.clone(), handle.clone());
    tasks.push(listener(ctx));
  }

  loop {
    if (exit_signalled || !inbound_open) && tasks.is_empty() {
      break;
    }

    tokio::select! {
      changed = exit.changed(), if !exit_signalled => {
        exit_signalled = changed.is_err() || *exit.borrow();
        if exit_signalled {
          handle.closed.store(true, Ordering::Release);
          fail_pending(&router, &handle);
        }
      }

      Some(message) = outbox_rx.recv() => {
        if let Err(err) = sink.send(message).await {
          warn!("{node}: send to {} failed: {err}", handle.id());
          exit_signalled = true;
          handle.closed.store(true, Ordering::Release);
          fail_pending(&router, &handle);
        }
      }

      frame = inbound.next(), if inbound_open => {
        match frame {
          Some(Ok(message)) => {
            debug!("{node}: {} sent {message:?}", handle.id());
            dispatch(&router, &handle, message, &mut tasks);
          }
          Some(Err(ProtocolError::Io(err)))
            if err.kind() == std::io::ErrorKind::UnexpectedEof =>
          {
            debug!("{node}: {} closed mid-frame", handle.id());
            inbound_open = false;
          }
          Some(Err(err)) => {
            warn!("{node}: protocol error from {}: {err}", handle.id());
            inbound_open = false;
          }
          None => {
            debug!("{node}: {} closed the connection", handle.id());
            inbound_open = false;
          }
        }
        if !inbound_open {
          handle.closed.store(true, Ordering::Release);
          fail_pending(&router, &handle);
        }
      }

      Some(()) = tasks.next(), if !tasks.is_empty() => {}
    }
  }

  // flush whatever handlers enqueued last
  while let Ok(message) = outbox_rx.try_recv() {
    if sink.send(message).await.is_err() {
      break;
    }
  }
  let _ = sink.close().await;

  handle.closed.store(true, Ordering::Release);
  fail_pending(&router, &handle);
  router.forget(&handle);
  info!("{node}: connection {} stopped", handle.id());
}

/// Resolves every request issued over this connection with an error;
/// their callers would otherwise wait forever.
fn fail_pending(router: &Router, handle: &ConnectionHandle) {
  for id in handle.drain_issued() {
    router.resolve_local(id, Err(super::RpcError::new("connection closed")));
  }
}

fn dispatch(
  router: &Arc<Router>,
  handle: &Arc<ConnectionHandle>,
  message: Message,
  tasks: &mut FuturesUnordered<BoxFuture<'static, ()>>,
) {
  let role = handle.peer().map(|peer| peer.role);
  match message {
    Message::Request { id, method, params } => {
      let handler = router.registry().request_handler(&method, role);
      let ctx = Context::new(router.clone(), handle.clone());
      let reply_to = handle.clone();
      tasks.push(
        async move {
          let response = match handler {
            None => Message::Error {
              id,
              error: ErrorBody {
                message: format!("{method} not supported"),
                data: None,
              },
            },
            Some(handler) => match handler(params, ctx).await {
              Ok(result) => Message::Response { id, result },
              Err(err) => Message::Error {
                id,
                error: err.into(),
              },
            },
          };
          reply_to.enqueue(response);
        }
        .boxed(),
      );
    }
    Message::Response { id, result } => {
      router.resolve(handle, id, Ok(result));
    }
    Message::Error { id, error } => {
      router.resolve(handle, id, Err(error.into()));
    }
    Message::Notification { method, params } => {
      match router.registry().notification_handler(&method, role) {
        Some(handler) => {
          let ctx = Context::new(router.clone(), handle.clone());
          tasks.push(handler(params, ctx));
        }
        None => debug!("unhandled notification {method}"),
      }
    }
  }
}
