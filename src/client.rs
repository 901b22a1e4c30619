//! The client/admin role: outbound connections to every peer, an
//! HTTP facade that forwards REST calls to a named peer over the
//! router, and a websocket stream that pushes chain notifications to
//! UI subscribers.

use {
  crate::{
    config::{ClientEntry, NetworkConfig, Role, WebConfig},
    peer::{NEW_BLOCKCHAIN, NEW_BLOCKCHAIN_VERIFIED},
    router::{Registry, Router, RpcError},
    wire::ErrorBody,
  },
  axum::{
    extract::{
      ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
      Extension,
      Path,
      Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json,
  },
  serde::{Deserialize, Serialize},
  serde_json::{json, Value},
  std::sync::Arc,
  tokio::sync::broadcast,
  tracing::{debug, info, warn},
};

/// A chain notification relayed to websocket subscribers verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct UiEvent {
  pub method: String,
  pub params: Value,
}

/// A running client or admin node.
pub struct Client {
  pub router: Arc<Router>,
  pub events: broadcast::Sender<UiEvent>,
}

fn forward_event(
  events: &broadcast::Sender<UiEvent>,
  method: &str,
  params: Value,
) {
  // no subscribers is fine, events are best-effort
  let _ = events.send(UiEvent {
    method: method.to_owned(),
    params,
  });
}

fn build_registry(
  entry: &ClientEntry,
  events: broadcast::Sender<UiEvent>,
) -> Registry {
  let mut builder = Registry::builder()
    .on_request("who-are-you", None, {
      let id = entry.id.clone();
      move |_params, _ctx| {
        let id = id.clone();
        async move { Ok(json!(id)) }
      }
    })
    .on_request("ping", None, |params, _ctx| async move { Ok(params) })
    .on_notification(NEW_BLOCKCHAIN, Some(Role::Orderer), {
      let events = events.clone();
      move |params, _ctx| {
        let events = events.clone();
        async move { forward_event(&events, NEW_BLOCKCHAIN, params) }
      }
    });
  for role in [Role::Orderer, Role::Endorser] {
    builder = builder.on_notification(NEW_BLOCKCHAIN_VERIFIED, Some(role), {
      let events = events.clone();
      move |params, _ctx| {
        let events = events.clone();
        async move { forward_event(&events, NEW_BLOCKCHAIN_VERIFIED, params) }
      }
    });
  }
  builder.build()
}

/// Boots a client/admin node: dials every peer and, when a web
/// config is present, serves the HTTP API.
pub async fn run(
  network: NetworkConfig,
  entry: ClientEntry,
) -> anyhow::Result<Client> {
  let (events, _) = broadcast::channel(256);
  let registry = build_registry(&entry, events.clone());
  let router = Router::new(entry.id.clone(), registry);

  for peer in &network.peers {
    if let Err(err) = router
      .start_connection(peer.public_addr, Some(peer.info()))
      .await
    {
      warn!(
        "{}: peer {} at {} unreachable: {err}",
        entry.id, peer.id, peer.public_addr
      );
    }
  }

  if let Some(web) = network.web.clone() {
    serve_http(&router, &entry, web, events.clone());
  }

  Ok(Client { router, events })
}

#[derive(Clone)]
struct ApiState {
  router: Arc<Router>,
  events: broadcast::Sender<UiEvent>,
}

fn serve_http(
  router: &Arc<Router>,
  entry: &ClientEntry,
  web: WebConfig,
  events: broadcast::Sender<UiEvent>,
) {
  let state = ApiState {
    router: router.clone(),
    events,
  };

  let mut app = axum::Router::new()
    .route("/api/transaction/transfer-money", post(transfer_money_api))
    .route("/api/transaction/submit", post(submit_api))
    .route("/api/connections", get(connections_api))
    .route("/api/ws", get(ws_api))
    .route("/api/:peer/connections", get(topology_api))
    .route("/api/:peer/accounts", get(accounts_api))
    .route("/api/:peer/blockchains", get(list_blockchains_api))
    .route("/api/:peer/blockchains/:number", get(blockchain_api));
  if entry.role == Role::Admin {
    app = app.route("/api/transaction/make-money", post(make_money_api));
  }
  let app = app.layer(Extension(state));

  let node_id = entry.id.clone();
  let mut shutdown = router.shutdown_signal();
  router.spawn(async move {
    let server = axum::Server::bind(&web.bind_addr)
      .serve(app.into_make_service());
    info!("{node_id}: web API on {}", server.local_addr());
    let graceful = server.with_graceful_shutdown(async move {
      let _ = shutdown.changed().await;
    });
    if let Err(err) = graceful.await {
      warn!("{node_id}: web server failed: {err}");
    }
  });
}

type ApiResponse = (StatusCode, Json<Value>);

fn ok_response(result: Value) -> ApiResponse {
  (StatusCode::OK, Json(json!({ "result": result })))
}

fn error_response(err: RpcError) -> ApiResponse {
  (
    StatusCode::BAD_REQUEST,
    Json(json!({ "error": ErrorBody::from(err) })),
  )
}

fn into_response(result: Result<Value, RpcError>) -> ApiResponse {
  match result {
    Ok(result) => ok_response(result),
    Err(err) => error_response(err),
  }
}

/// Resolves a configured peer id to the live connection leading to
/// it.
fn find_peer(state: &ApiState, peer: &str) -> Result<String, RpcError> {
  state
    .router
    .peer_connection(peer)
    .ok_or_else(|| RpcError::new("peer offline"))
}

#[derive(Deserialize)]
struct MakeMoneyBody {
  endorser: String,
  amount: f64,
}

async fn make_money_api(
  Extension(state): Extension<ApiState>,
  Json(body): Json<MakeMoneyBody>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &body.endorser)?;
    state
      .router
      .request("make-money", json!({ "amount": body.amount }), &conn)
      .await
  }
  .await;
  into_response(result)
}

#[derive(Deserialize)]
struct TransferBody {
  endorser: String,
  transfers: Value,
}

async fn transfer_money_api(
  Extension(state): Extension<ApiState>,
  Json(body): Json<TransferBody>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &body.endorser)?;
    state
      .router
      .request("transfer-money", body.transfers, &conn)
      .await
  }
  .await;
  into_response(result)
}

#[derive(Deserialize)]
struct SubmitBody {
  orderer: String,
  transactions: Value,
}

async fn submit_api(
  Extension(state): Extension<ApiState>,
  Json(body): Json<SubmitBody>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &body.orderer)?;
    state
      .router
      .request("submit-transactions", body.transactions, &conn)
      .await
  }
  .await;
  into_response(result)
}

async fn connections_api(
  Extension(state): Extension<ApiState>,
) -> ApiResponse {
  let connections: Vec<Value> = state
    .router
    .connections()
    .into_iter()
    .map(|(id, peer)| json!({ "connection": id, "peer": peer }))
    .collect();
  ok_response(Value::Array(connections))
}

async fn topology_api(
  Extension(state): Extension<ApiState>,
  Path(peer): Path<String>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &peer)?;
    state.router.request("query-topology", Value::Null, &conn).await
  }
  .await;
  into_response(result)
}

#[derive(Deserialize)]
struct AccountsQuery {
  account: Option<String>,
  version: Option<u64>,
  latest_version: Option<bool>,
  limit: Option<i64>,
  offset: Option<i64>,
}

async fn accounts_api(
  Extension(state): Extension<ApiState>,
  Path(peer): Path<String>,
  Query(query): Query<AccountsQuery>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &peer)?;
    state
      .router
      .request(
        "query-accounts",
        json!({
          "account": query.account,
          "version": query.version,
          "latest_version": query.latest_version,
          "limit": query.limit,
          "offset": query.offset,
        }),
        &conn,
      )
      .await
  }
  .await;
  into_response(result)
}

#[derive(Deserialize)]
struct ListQuery {
  asc: Option<bool>,
  limit: Option<i64>,
  offset: Option<i64>,
}

async fn list_blockchains_api(
  Extension(state): Extension<ApiState>,
  Path(peer): Path<String>,
  Query(query): Query<ListQuery>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &peer)?;
    state
      .router
      .request(
        "list-blockchains",
        json!({
          "asc": query.asc,
          "limit": query.limit,
          "offset": query.offset,
        }),
        &conn,
      )
      .await
  }
  .await;
  into_response(result)
}

async fn blockchain_api(
  Extension(state): Extension<ApiState>,
  Path((peer, number)): Path<(String, u64)>,
) -> ApiResponse {
  let result = async {
    let conn = find_peer(&state, &peer)?;
    state
      .router
      .request(
        "query-blockchain",
        json!({ "blockchain_number": number }),
        &conn,
      )
      .await
  }
  .await;
  into_response(result)
}

async fn ws_api(
  Extension(state): Extension<ApiState>,
  ws: WebSocketUpgrade,
) -> impl IntoResponse {
  let receiver = state.events.subscribe();
  ws.on_upgrade(move |socket| stream_events(socket, receiver))
}

/// Pushes every chain notification to one websocket subscriber until
/// either side goes away.
async fn stream_events(
  mut socket: WebSocket,
  mut receiver: broadcast::Receiver<UiEvent>,
) {
  loop {
    match receiver.recv().await {
      Ok(event) => {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(WsMessage::Text(text)).await.is_err() {
          break;
        }
      }
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        debug!("websocket subscriber lagged by {missed} events");
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}
