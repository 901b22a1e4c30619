//! The orderer role: admits endorsed transactions into a mempool
//! with per-account single-flight, cuts blocks on a timer or when
//! the pool fills up, and fans the proposal out for verification.

use {
  crate::{
    config::{NetworkConfig, PeerEntry, Role},
    model::{Block, Transaction},
    node::{self, Keystore},
    peer::{self, PeerCore},
    primitives::time,
    router::{Registry, RegistryBuilder, Router, RpcError},
    store::{Store, CHAIN_DB},
  },
  serde_json::{json, Value},
  std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
  },
  tokio::sync::Notify,
  tracing::{info, warn},
};

#[derive(Default)]
struct Mempool {
  transactions: Vec<Transaction>,
  mutated_accounts: HashSet<String>,
}

/// Orderer state: the mempool, its single-flight account set and the
/// signal that wakes the block builder.
pub struct OrdererCore {
  peer: Arc<PeerCore>,
  mempool: Mutex<Mempool>,
  new_block_signal: Notify,
  max_transaction_pool: usize,
  creation_timeout: Duration,
}

impl OrdererCore {
  pub fn new(peer: Arc<PeerCore>) -> Arc<Self> {
    let orderer = &peer.network().orderer;
    let max_transaction_pool = orderer.max_transaction_pool;
    let creation_timeout = orderer.blockchain_creation_timeout;
    Arc::new(Self {
      peer,
      mempool: Mutex::new(Mempool::default()),
      new_block_signal: Notify::new(),
      max_transaction_pool,
      creation_timeout,
    })
  }

  /// `submit-transactions` (admin, client): validates each envelope
  /// and admits the batch atomically; any conflict on a mutated
  /// account rejects the whole batch and leaves the mempool as it
  /// was.
  fn submit_transactions(&self, params: Value) -> Result<Value, RpcError> {
    let transactions: Vec<Transaction> = serde_json::from_value(params)
      .map_err(|err| {
        RpcError::with_data("bad request", json!(err.to_string()))
      })?;
    if transactions.is_empty() {
      return Err(RpcError::with_data("bad request", json!("no transactions")));
    }
    for transaction in &transactions {
      node::validate_transaction(self.peer.keystore(), transaction)?;
    }

    let mut mempool = self.mempool.lock().expect("mempool lock");
    let mut batch_accounts = HashSet::new();
    for transaction in &transactions {
      for mutation in &transaction.mutations {
        if !batch_accounts.insert(mutation.account.clone())
          || mempool.mutated_accounts.contains(&mutation.account)
        {
          return Err(RpcError::new("conflict transaction"));
        }
      }
    }
    mempool.mutated_accounts.extend(batch_accounts);
    let admitted = transactions.len();
    mempool.transactions.extend(transactions);
    let pooled = mempool.transactions.len();
    drop(mempool);

    info!(
      "{}: admitted {admitted} transaction(s), pool at {pooled}",
      self.peer.id()
    );
    self.new_block_signal.notify_one();
    Ok(Value::Null)
  }

  /// Swaps the mempool out if a block is due: the timer expired with
  /// work pending, or the pool reached its limit.
  fn take_batch(&self, timer_expired: bool) -> Option<Vec<Transaction>> {
    let mut mempool = self.mempool.lock().expect("mempool lock");
    if mempool.transactions.is_empty() {
      return None;
    }
    if !timer_expired
      && mempool.transactions.len() < self.max_transaction_pool
    {
      return None;
    }
    mempool.mutated_accounts.clear();
    Some(std::mem::take(&mut mempool.transactions))
  }

}

/// The long-running block builder: waits on the submission signal
/// with a bounded timeout, assembles the next block from the swapped
/// mempool and broadcasts it to every connected peer. Verification
/// votes arrive asynchronously through the peer layer.
pub async fn run_builder(core: Arc<OrdererCore>, router: Arc<Router>) {
  let mut shutdown = router.shutdown_signal();
  info!("{}: block builder started", core.peer.id());
  loop {
    let timer_expired = tokio::select! {
      _ = shutdown.changed() => {
        if *shutdown.borrow() {
          break;
        }
        continue;
      }
      waited = tokio::time::timeout(
        core.creation_timeout,
        core.new_block_signal.notified(),
      ) => waited.is_err(),
    };

    let Some(transactions) = core.take_batch(timer_expired) else {
      continue;
    };

    let latest = match core.peer.store().latest_block().await {
      Ok(block) => block,
      Err(err) => {
        warn!("{}: cannot load chain tip: {err}", core.peer.id());
        continue;
      }
    };
    let block = Block::assemble(
      latest.hash,
      latest.number,
      time::now(),
      transactions,
    );
    info!(
      "{}: assembled block #{} with {} transaction(s)",
      core.peer.id(),
      block.number,
      block.transactions.len()
    );

    // the orderer is a peer too: the proposal is recorded and
    // locally verified before it goes out, and its own vote follows
    // the block on every connection
    core.peer.propose_local(&router, block).await;
  }
  info!("{}: block builder stopped", core.peer.id());
}

fn register_orderer_handlers(
  builder: RegistryBuilder,
  core: &Arc<OrdererCore>,
) -> RegistryBuilder {
  let mut builder = builder;
  for role in [Role::Admin, Role::Client] {
    builder = builder.on_request("submit-transactions", Some(role), {
      let core = core.clone();
      move |params, _ctx| {
        let core = core.clone();
        async move { core.submit_transactions(params) }
      }
    });
  }
  builder
}


/// Boots the orderer node: store, keystore, handlers, listening
/// socket, the peer mesh and the block-builder task.
pub async fn run(
  network: NetworkConfig,
  entry: PeerEntry,
) -> anyhow::Result<Arc<Router>> {
  let store = Store::open(&entry.root.join(CHAIN_DB)).await?;
  let keystore = Keystore::open(&entry.id, &entry.root, &network.public_root)?;
  let peer_core = PeerCore::new(entry.clone(), network, store, keystore);
  let core = OrdererCore::new(peer_core.clone());

  let registry = register_orderer_handlers(
    peer::register_peer_handlers(Registry::builder(), &peer_core),
    &core,
  )
  .build();
  let router = Router::new(entry.id.clone(), registry);
  router.start_server(entry.bind_addr).await?;
  peer::join_mesh(&peer_core, &router).await;
  router.spawn(run_builder(core, router.clone()));
  Ok(router)
}
