use {
  super::cluster::wait_for,
  crate::{
    config::{PeerInfo, Role},
    router::{Registry, Router, RpcError},
  },
  serde_json::{json, Value},
  std::sync::Arc,
  tokio::sync::mpsc,
};

async fn serve(registry: Registry) -> (Arc<Router>, std::net::SocketAddr) {
  let router = Router::new("server", registry);
  let (_, addr) = router.start_server("127.0.0.1:0".parse().unwrap()).await.unwrap();
  (router, addr)
}

fn echo_registry() -> Registry {
  Registry::builder()
    .on_request("ping", None, |params, _ctx| async move { Ok(params) })
    .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_round_trip() {
  let (server, addr) = serve(echo_registry()).await;
  let client = Router::new("client", Registry::builder().build());
  let conn = client.start_connection(addr, None).await.unwrap();

  let reply = client.request("ping", json!("hello"), &conn).await.unwrap();
  assert_eq!(reply, json!("hello"));

  // responses are matched by id, not by order
  let first = client.request("ping", json!(1), &conn);
  let second = client.request("ping", json!(2), &conn);
  let (first, second) = tokio::join!(first, second);
  assert_eq!(first.unwrap(), json!(1));
  assert_eq!(second.unwrap(), json!(2));

  client.shutdown();
  server.shutdown();
  client.wait().await;
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_method_is_an_rpc_error() {
  let (server, addr) = serve(echo_registry()).await;
  let client = Router::new("client", Registry::builder().build());
  let conn = client.start_connection(addr, None).await.unwrap();

  let err = client
    .request("no-such-method", Value::Null, &conn)
    .await
    .unwrap_err();
  assert_eq!(err.message, "no-such-method not supported");

  client.shutdown();
  server.shutdown();
  client.wait().await;
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_errors_carry_data() {
  let registry = Registry::builder()
    .on_request("fail", None, |_params, _ctx| async move {
      Err::<Value, _>(RpcError::with_data("bad request", json!({"why": 42})))
    })
    .build();
  let (server, addr) = serve(registry).await;
  let client = Router::new("client", Registry::builder().build());
  let conn = client.start_connection(addr, None).await.unwrap();

  let err = client.request("fail", Value::Null, &conn).await.unwrap_err();
  assert_eq!(err.message, "bad request");
  assert_eq!(err.data, Some(json!({"why": 42})));

  client.shutdown();
  server.shutdown();
  client.wait().await;
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_reach_their_handler() {
  let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
  let registry = Registry::builder()
    .on_notification("event", None, move |params, _ctx| {
      let tx = tx.clone();
      async move {
        let _ = tx.send(params);
      }
    })
    .build();
  let (server, addr) = serve(registry).await;
  let client = Router::new("client", Registry::builder().build());
  let conn = client.start_connection(addr, None).await.unwrap();

  client.notify("event", json!({"n": 1}), &conn).unwrap();
  // a notification nobody handles is silently dropped
  client.notify("ignored", Value::Null, &conn).unwrap();
  client.notify("event", json!({"n": 2}), &conn).unwrap();

  assert_eq!(rx.recv().await.unwrap(), json!({"n": 1}));
  assert_eq!(rx.recv().await.unwrap(), json!({"n": 2}));

  client.shutdown();
  server.shutdown();
  client.wait().await;
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unidentified_connections_fall_back_to_the_default_handler() {
  let registry = Registry::builder()
    .on_request("whoami", None, |_params, _ctx| async move {
      Ok(json!("default"))
    })
    .on_request("whoami", Some(Role::Admin), |_params, _ctx| async move {
      Ok(json!("admin"))
    })
    .build();
  let (server, addr) = serve(registry).await;

  let anonymous = Router::new("anon", Registry::builder().build());
  let conn = anonymous.start_connection(addr, None).await.unwrap();
  let reply = anonymous.request("whoami", Value::Null, &conn).await.unwrap();
  assert_eq!(reply, json!("default"));

  anonymous.shutdown();
  anonymous.wait().await;
  server.shutdown();
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn who_are_you_rebinds_the_connection() {
  let registry = Registry::builder()
    .on_accepted(None, |ctx| async move {
      if let Ok(Value::String(id)) = ctx.request("who-are-you", Value::Null).await
      {
        ctx.rebind(PeerInfo {
          id,
          role: Role::Admin,
        });
      }
    })
    .on_request("whoami", Some(Role::Admin), |_params, ctx| async move {
      Ok(json!(ctx.peer().map(|peer| peer.id)))
    })
    .build();
  let (server, addr) = serve(registry).await;

  let client = Router::new("alice", Registry::builder()
    .on_request("who-are-you", None, |_params, _ctx| async move {
      Ok(json!("alice"))
    })
    .build());
  let conn = client.start_connection(addr, None).await.unwrap();

  wait_for("server to identify the client", || async {
    server.peer_connection("alice").is_some()
  })
  .await;

  // the admin-only handler is now reachable because the connection
  // carries the admin role
  let reply = client.request("whoami", Value::Null, &conn).await.unwrap();
  assert_eq!(reply, json!("alice"));

  client.shutdown();
  server.shutdown();
  client.wait().await;
  server.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_a_connection_fails_pending_requests() {
  let registry = Registry::builder()
    .on_request("hang", None, |_params, _ctx| async move {
      futures::future::pending::<()>().await;
      Ok(Value::Null)
    })
    .build();
  let (server, addr) = serve(registry).await;
  let client = Router::new("client", Registry::builder().build());
  let conn = client.start_connection(addr, None).await.unwrap();

  let request = client.request("hang", Value::Null, &conn);
  client.close_connection(&conn);
  let err = request.await.unwrap_err();
  assert_eq!(err.message, "connection closed");

  // the hung handler would keep the server connection alive; tear
  // the whole server down instead of waiting for it
  server.shutdown();
  client.shutdown();
  client.wait().await;
}
