use {
  super::{Context, RpcError},
  crate::config::Role,
  futures::future::{BoxFuture, FutureExt},
  serde_json::Value,
  std::{collections::HashMap, future::Future, sync::Arc},
};

pub(crate) type RequestHandler = Arc<
  dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, RpcError>>
    + Send
    + Sync,
>;

pub(crate) type NotificationHandler =
  Arc<dyn Fn(Value, Context) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) type LifecycleListener =
  Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// Which end of the connection this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
  /// The connection arrived on one of our listening sockets.
  Accepted,
  /// We dialed out to a configured peer.
  Established,
}

/// Static dispatch tables of one role: request and notification
/// handlers keyed by `(method, peer role)`, plus one lifecycle
/// listener per peer role and connection side.
///
/// Dispatch prefers the handler registered for the peer's exact role
/// and falls back to the default (`None`) entry. Registering the same
/// key twice is a configuration bug and panics at startup.
pub struct Registry {
  requests: HashMap<(String, Option<Role>), RequestHandler>,
  notifications: HashMap<(String, Option<Role>), NotificationHandler>,
  accepted: HashMap<Option<Role>, LifecycleListener>,
  established: HashMap<Option<Role>, LifecycleListener>,
}

impl Registry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder {
      registry: Registry {
        requests: HashMap::new(),
        notifications: HashMap::new(),
        accepted: HashMap::new(),
        established: HashMap::new(),
      },
    }
  }

  pub(crate) fn request_handler(
    &self,
    method: &str,
    role: Option<Role>,
  ) -> Option<RequestHandler> {
    role
      .and_then(|role| self.requests.get(&(method.to_owned(), Some(role))))
      .or_else(|| self.requests.get(&(method.to_owned(), None)))
      .cloned()
  }

  pub(crate) fn notification_handler(
    &self,
    method: &str,
    role: Option<Role>,
  ) -> Option<NotificationHandler> {
    role
      .and_then(|role| self.notifications.get(&(method.to_owned(), Some(role))))
      .or_else(|| self.notifications.get(&(method.to_owned(), None)))
      .cloned()
  }

  pub(crate) fn listener(
    &self,
    side: ConnectionSide,
    role: Option<Role>,
  ) -> Option<LifecycleListener> {
    let table = match side {
      ConnectionSide::Accepted => &self.accepted,
      ConnectionSide::Established => &self.established,
    };
    role
      .and_then(|role| table.get(&Some(role)))
      .or_else(|| table.get(&None))
      .cloned()
  }
}

pub struct RegistryBuilder {
  registry: Registry,
}

impl RegistryBuilder {
  /// Registers a request handler for `method`, optionally filtered to
  /// connections whose peer has the given role.
  pub fn on_request<F, Fut>(
    mut self,
    method: &str,
    role: Option<Role>,
    handler: F,
  ) -> Self
  where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
  {
    let previous = self.registry.requests.insert(
      (method.to_owned(), role),
      Arc::new(move |params, ctx| handler(params, ctx).boxed()),
    );
    assert!(
      previous.is_none(),
      "duplicate request handler for {method:?} ({role:?})"
    );
    self
  }

  pub fn on_notification<F, Fut>(
    mut self,
    method: &str,
    role: Option<Role>,
    handler: F,
  ) -> Self
  where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let previous = self.registry.notifications.insert(
      (method.to_owned(), role),
      Arc::new(move |params, ctx| handler(params, ctx).boxed()),
    );
    assert!(
      previous.is_none(),
      "duplicate notification handler for {method:?} ({role:?})"
    );
    self
  }

  /// Listener fired when this node accepts a connection.
  pub fn on_accepted<F, Fut>(mut self, role: Option<Role>, listener: F) -> Self
  where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let previous = self
      .registry
      .accepted
      .insert(role, Arc::new(move |ctx| listener(ctx).boxed()));
    assert!(previous.is_none(), "duplicate accepted listener ({role:?})");
    self
  }

  /// Listener fired when a connection this node dialed is up.
  pub fn on_established<F, Fut>(
    mut self,
    role: Option<Role>,
    listener: F,
  ) -> Self
  where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let previous = self
      .registry
      .established
      .insert(role, Arc::new(move |ctx| listener(ctx).boxed()));
    assert!(
      previous.is_none(),
      "duplicate established listener ({role:?})"
    );
    self
  }

  pub fn build(self) -> Registry {
    self.registry
  }
}
