use {
  super::{connection::ConnectionHandle, Router, RpcError},
  crate::config::PeerInfo,
  serde_json::Value,
  std::sync::Arc,
};

/// What a handler knows about the connection it was invoked on.
///
/// All mutation of the connection registry goes through the router;
/// the context only requests it.
#[derive(Clone)]
pub struct Context {
  router: Arc<Router>,
  connection: Arc<ConnectionHandle>,
}

impl Context {
  pub(crate) fn new(
    router: Arc<Router>,
    connection: Arc<ConnectionHandle>,
  ) -> Self {
    Self { router, connection }
  }

  pub fn router(&self) -> &Arc<Router> {
    &self.router
  }

  /// The id this connection is currently registered under. Starts as
  /// `unknown:<nonce>` for inbound connections and changes when
  /// [`Context::rebind`] attaches the peer's identity.
  pub fn connection_id(&self) -> String {
    self.connection.id()
  }

  /// The static config of the peer behind this connection, if known.
  pub fn peer(&self) -> Option<PeerInfo> {
    self.connection.peer()
  }

  /// Sends a request over this connection and suspends until the
  /// matching response arrives.
  pub async fn request(
    &self,
    method: &str,
    params: Value,
  ) -> Result<Value, RpcError> {
    self.router.request_on(&self.connection, method, params).await
  }

  /// Enqueues a notification on this connection; returns once queued.
  pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
    if self.connection.enqueue(super::notification(method, params)) {
      Ok(())
    } else {
      Err(RpcError::new("connection closed"))
    }
  }

  /// Re-registers this connection under the peer's real identity.
  pub fn rebind(&self, peer: PeerInfo) -> bool {
    self.router.rebind(&self.connection, peer)
  }

  /// Asks the connection to wind down and close.
  pub fn close_connection(&self) {
    self.connection.signal_exit();
  }
}
