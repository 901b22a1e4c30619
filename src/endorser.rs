//! The endorser role: builds and signs transaction envelopes on
//! behalf of admins and clients. Nothing here persists; envelopes
//! become durable only when the orderer's block commits.

use {
  crate::{
    config::{NetworkConfig, PeerEntry, Role},
    model::{Mutation, Transaction, COINBASE},
    node::Keystore,
    peer::{self, PeerCore},
    primitives::{time, Amount},
    router::{Context, Registry, RegistryBuilder, Router, RpcError},
    store::{Store, CHAIN_DB},
  },
  serde::Deserialize,
  serde_json::{json, Value},
  std::sync::Arc,
  tracing::{debug, info},
};

#[derive(Debug, Deserialize)]
struct MakeMoneyParams {
  amount: f64,
}

#[derive(Debug, Deserialize)]
struct TransferItem {
  amount: f64,
  target: String,
}

fn positive_amount(raw: f64) -> Result<Amount, RpcError> {
  let amount = Amount::try_from_f64(raw)
    .map_err(|err| RpcError::with_data("bad request", json!(err.to_string())))?;
  if !amount.is_positive() {
    return Err(RpcError::with_data(
      "bad request",
      json!("amount must be positive"),
    ));
  }
  Ok(amount)
}

fn caller_account(ctx: &Context) -> Result<String, RpcError> {
  ctx
    .peer()
    .map(|peer| peer.id)
    .ok_or_else(|| RpcError::new("bad request"))
}

async fn latest_state(
  core: &PeerCore,
  account: &str,
) -> Result<crate::model::AccountState, RpcError> {
  core
    .store()
    .latest_account(account)
    .await
    .map_err(RpcError::internal)?
    .map(|record| record.state)
    .ok_or_else(|| {
      RpcError::with_data("bad request", json!(format!("unknown account {account:?}")))
    })
}

fn apply_or_overflow(
  account: &str,
  state: crate::model::AccountState,
  delta: Amount,
) -> Result<Mutation, RpcError> {
  Mutation::apply(account, state, delta).ok_or_else(|| {
    RpcError::with_data("bad request", json!("account value overflow"))
  })
}

/// `make-money {amount}` (admin only): credits both the caller and
/// the coinbase by the same amount and returns the signed envelope.
async fn make_money(
  core: &Arc<PeerCore>,
  params: Value,
  ctx: Context,
) -> Result<Value, RpcError> {
  let params: MakeMoneyParams = serde_json::from_value(params)
    .map_err(|err| RpcError::with_data("bad request", json!(err.to_string())))?;
  let amount = positive_amount(params.amount)?;
  let caller = caller_account(&ctx)?;

  let caller_state = latest_state(core, &caller).await?;
  let coinbase_state = latest_state(core, COINBASE).await?;
  let mutations = vec![
    apply_or_overflow(&caller, caller_state, amount)?,
    apply_or_overflow(COINBASE, coinbase_state, amount)?,
  ];

  let envelope =
    Transaction::endorse(core.keystore().keypair(), core.id(), time::now(), mutations);
  info!(
    "{}: endorsed mint of {amount} for {caller}",
    core.id()
  );
  serde_json::to_value(envelope).map_err(RpcError::internal)
}

/// `transfer-money [{amount, target}…]` (admin, client): one debit
/// on the caller for the total, one credit per target.
async fn transfer_money(
  core: &Arc<PeerCore>,
  params: Value,
  ctx: Context,
) -> Result<Value, RpcError> {
  let transfers: Vec<TransferItem> = serde_json::from_value(params)
    .map_err(|err| RpcError::with_data("bad request", json!(err.to_string())))?;
  if transfers.is_empty() {
    return Err(RpcError::with_data("bad request", json!("no transfers")));
  }
  let caller = caller_account(&ctx)?;

  let mut total = Amount::ZERO;
  let mut seen = std::collections::HashSet::new();
  for transfer in &transfers {
    if transfer.target == COINBASE || transfer.target == caller {
      return Err(RpcError::with_data(
        "bad request",
        json!(format!("invalid target {:?}", transfer.target)),
      ));
    }
    if !seen.insert(transfer.target.clone()) {
      return Err(RpcError::with_data(
        "bad request",
        json!(format!("duplicate target {:?}", transfer.target)),
      ));
    }
    let amount = positive_amount(transfer.amount)?;
    total = total
      .checked_add(amount)
      .ok_or_else(|| RpcError::with_data("bad request", json!("total overflow")))?;
  }

  let caller_state = latest_state(core, &caller).await?;
  if caller_state.value < total {
    return Err(RpcError::new("insufficient balance"));
  }

  let debit = total
    .checked_neg()
    .ok_or_else(|| RpcError::with_data("bad request", json!("total overflow")))?;
  let mut mutations = vec![apply_or_overflow(&caller, caller_state, debit)?];
  for transfer in &transfers {
    let amount = positive_amount(transfer.amount)?;
    let target_state = latest_state(core, &transfer.target).await?;
    mutations.push(apply_or_overflow(&transfer.target, target_state, amount)?);
  }

  let envelope =
    Transaction::endorse(core.keystore().keypair(), core.id(), time::now(), mutations);
  info!(
    "{}: endorsed transfer of {total} from {caller} to {} target(s)",
    core.id(),
    transfers.len()
  );
  serde_json::to_value(envelope).map_err(RpcError::internal)
}

fn register_endorser_handlers(
  builder: RegistryBuilder,
  core: &Arc<PeerCore>,
) -> RegistryBuilder {
  let mut builder = builder.on_request("make-money", Some(Role::Admin), {
    let core = core.clone();
    move |params, ctx| {
      let core = core.clone();
      async move { make_money(&core, params, ctx).await }
    }
  });
  for role in [Role::Admin, Role::Client] {
    builder = builder.on_request("transfer-money", Some(role), {
      let core = core.clone();
      move |params, ctx| {
        let core = core.clone();
        async move { transfer_money(&core, params, ctx).await }
      }
    });
  }
  // diagnostic ping once the upstream orderer link is up
  builder.on_established(Some(Role::Orderer), |ctx| async move {
    match ctx.request("ping", json!("hello")).await {
      Ok(reply) => debug!("orderer link up, ping replied {reply}"),
      Err(err) => debug!("orderer link ping failed: {err}"),
    }
  })
}

/// Boots an endorser node: store, keystore, handlers, listening
/// socket and the outbound half of the peer mesh.
pub async fn run(
  network: NetworkConfig,
  entry: PeerEntry,
) -> anyhow::Result<Arc<Router>> {
  let store = Store::open(&entry.root.join(CHAIN_DB)).await?;
  let keystore = Keystore::open(&entry.id, &entry.root, &network.public_root)?;
  let core = PeerCore::new(entry.clone(), network, store, keystore);

  let registry = register_endorser_handlers(
    peer::register_peer_handlers(Registry::builder(), &core),
    &core,
  )
  .build();
  let router = Router::new(entry.id.clone(), registry);
  router.start_server(entry.bind_addr).await?;
  peer::join_mesh(&core, &router).await;
  Ok(router)
}
