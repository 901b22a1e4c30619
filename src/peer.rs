//! State and handlers shared by the peer roles (orderer, endorser):
//! chain queries, block verification votes and the quorum commit.

use {
  crate::{
    config::{NetworkConfig, PeerEntry, Role},
    model::Block,
    node::{self, Keystore},
    primitives::Digest,
    router::{Context, RegistryBuilder, Router, RpcError},
    store::{AccountQuery, Store},
  },
  serde::{de::DeserializeOwned, Deserialize},
  serde_json::{json, Value},
  std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
  },
  tracing::{debug, info, warn},
};

pub(crate) const NEW_BLOCKCHAIN: &str = "new-blockchain";
pub(crate) const NEW_BLOCKCHAIN_VERIFIED: &str = "new-blockchain-verified";

const DEFAULT_PAGE: i64 = 15;
const MAX_PAGE: i64 = 100;

/// A proposed block awaiting its verification quorum.
struct Proposal {
  block: Block,
  votes: usize,
}

/// Shared peer state: the chain database, the keystore and the vote
/// ledger of in-flight proposals.
pub struct PeerCore {
  entry: PeerEntry,
  network: NetworkConfig,
  store: Store,
  keystore: Keystore,
  proposals: Mutex<HashMap<Digest, Proposal>>,
  /// Votes that arrived before their proposal did. Connections are
  /// independent, so a fast peer's vote can overtake the orderer's
  /// block broadcast; these counts are merged once the block shows
  /// up.
  early_votes: Mutex<HashMap<Digest, usize>>,
  verify_num: usize,
}

/// Upper bound on buffered early votes; beyond this the buffer is
/// assumed to be garbage and dropped.
const MAX_EARLY_VOTES: usize = 64;

/// Parses request params, treating `null` as "all defaults".
pub(crate) fn parse_params<T>(params: Value) -> Result<T, RpcError>
where
  T: DeserializeOwned + Default,
{
  if params.is_null() {
    return Ok(T::default());
  }
  serde_json::from_value(params)
    .map_err(|err| RpcError::with_data("bad request", json!(err.to_string())))
}

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
  let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
  let offset = offset.unwrap_or(0).max(0);
  (limit, offset)
}

#[derive(Debug, Default, Deserialize)]
struct QueryBlockchainParams {
  blockchain_number: u64,
}

#[derive(Debug, Default, Deserialize)]
struct QueryAccountsParams {
  account: Option<String>,
  version: Option<u64>,
  latest_version: Option<bool>,
  limit: Option<i64>,
  offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ListBlockchainsParams {
  asc: Option<bool>,
  limit: Option<i64>,
  offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VerifiedParams {
  hash: Digest,
  verified: bool,
}

impl PeerCore {
  pub fn new(
    entry: PeerEntry,
    network: NetworkConfig,
    store: Store,
    keystore: Keystore,
  ) -> Arc<Self> {
    let verify_num = network.verify_num();
    Arc::new(Self {
      entry,
      network,
      store,
      keystore,
      proposals: Mutex::new(HashMap::new()),
      early_votes: Mutex::new(HashMap::new()),
      verify_num,
    })
  }

  pub fn id(&self) -> &str {
    &self.entry.id
  }

  pub fn network(&self) -> &NetworkConfig {
    &self.network
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn keystore(&self) -> &Keystore {
    &self.keystore
  }

  pub fn verify_num(&self) -> usize {
    self.verify_num
  }

  #[cfg(test)]
  fn proposal_votes(&self, hash: &Digest) -> Option<usize> {
    self
      .proposals
      .lock()
      .expect("proposals lock")
      .get(hash)
      .map(|proposal| proposal.votes)
  }

  /// Verifies and records a proposed block. Returns the local vote
  /// and, when the quorum is already satisfied (a single-peer
  /// network, or enough buffered early votes), the block to commit.
  /// `None` means the proposal was already known.
  async fn admit_proposal(&self, block: Block) -> Option<(bool, Option<Block>)> {
    let hash = block.hash;
    let verified = match self.verify_proposal(&block).await {
      Ok(()) => true,
      Err(reason) => {
        warn!("{}: proposal {hash} rejected: {reason}", self.id());
        false
      }
    };

    let early = self
      .early_votes
      .lock()
      .expect("early votes lock")
      .remove(&hash)
      .unwrap_or(0);
    let mut proposals = self.proposals.lock().expect("proposals lock");
    if proposals.contains_key(&hash) {
      debug!("{}: proposal {hash} already known", self.id());
      return None;
    }
    let votes = usize::from(verified) + early;
    let commit = if votes >= self.verify_num {
      Some(block)
    } else {
      proposals.insert(hash, Proposal { block, votes });
      None
    };
    Some((verified, commit))
  }

  /// Runs the verification protocol for a block received from the
  /// orderer: record, verify locally, broadcast the vote, commit if
  /// the quorum is already there.
  pub async fn process_proposal(&self, router: &Arc<Router>, block: Block) {
    let hash = block.hash;
    let Some((verified, commit)) = self.admit_proposal(block).await else {
      return;
    };
    router.broadcast(
      NEW_BLOCKCHAIN_VERIFIED,
      json!({ "hash": hash, "verified": verified }),
    );
    if let Some(block) = commit {
      self.commit(&block).await;
    }
  }

  /// The orderer's side of proposing its own block: the proposal is
  /// recorded and locally verified first, then the block goes out,
  /// then this peer's vote. Frames on one connection keep their
  /// enqueue order, so every peer sees the block before the vote.
  pub async fn propose_local(&self, router: &Arc<Router>, block: Block) {
    let hash = block.hash;
    let params = match serde_json::to_value(&block) {
      Ok(params) => params,
      Err(err) => {
        warn!("{}: cannot encode block: {err}", self.id());
        return;
      }
    };
    let Some((verified, commit)) = self.admit_proposal(block).await else {
      return;
    };
    let reached = router.broadcast(NEW_BLOCKCHAIN, params);
    debug!("{}: proposed {hash} to {reached} connection(s)", self.id());
    router.broadcast(
      NEW_BLOCKCHAIN_VERIFIED,
      json!({ "hash": hash, "verified": verified }),
    );
    if let Some(block) = commit {
      self.commit(&block).await;
    }
  }

  /// One incoming `new-blockchain-verified` vote. The vote that
  /// completes the quorum pops the proposal and persists the block;
  /// later votes for the same hash are ignored.
  pub async fn record_vote(&self, hash: Digest, verified: bool) {
    if !verified {
      debug!("{}: peer voted against {hash}", self.id());
      return;
    }
    let commit = {
      let mut proposals = self.proposals.lock().expect("proposals lock");
      match proposals.get_mut(&hash) {
        None => {
          drop(proposals);
          self.buffer_early_vote(hash);
          None
        }
        Some(proposal) if proposal.votes + 1 >= self.verify_num => {
          let proposal = proposals.remove(&hash).expect("entry exists");
          Some(proposal.block)
        }
        Some(proposal) => {
          proposal.votes += 1;
          debug!(
            "{}: proposal {hash} at {}/{} votes",
            self.id(),
            proposal.votes,
            self.verify_num
          );
          None
        }
      }
    };
    if let Some(block) = commit {
      self.commit(&block).await;
    }
  }

  /// A vote for a block this peer has not seen yet; hold on to it
  /// until the proposal arrives. Commit removes proposals from the
  /// ledger, so votes trailing a commit also land here and age out.
  fn buffer_early_vote(&self, hash: Digest) {
    let mut early = self.early_votes.lock().expect("early votes lock");
    if early.len() >= MAX_EARLY_VOTES && !early.contains_key(&hash) {
      early.clear();
    }
    *early.entry(hash).or_insert(0) += 1;
    debug!("{}: buffered early vote for {hash}", self.id());
  }

  /// Local verification of a proposal against the committed chain.
  async fn verify_proposal(&self, block: &Block) -> Result<(), String> {
    node::validate_block(&self.keystore, block)
      .map_err(|err| err.to_string())?;

    let latest = self
      .store
      .latest_block()
      .await
      .map_err(|err| format!("cannot load chain tip: {err}"))?;
    if block.number != latest.number + 1 {
      return Err(format!(
        "number {} does not follow {}",
        block.number, latest.number
      ));
    }
    if block.prev_hash != latest.hash {
      return Err("previous hash does not match the chain tip".into());
    }

    let mut mutated = HashSet::new();
    for transaction in &block.transactions {
      for mutation in &transaction.mutations {
        if !mutated.insert(mutation.account.clone()) {
          return Err(format!(
            "account {:?} mutated twice in one block",
            mutation.account
          ));
        }
        let current = self
          .store
          .latest_account(&mutation.account)
          .await
          .map_err(|err| format!("cannot load account: {err}"))?
          .ok_or_else(|| {
            format!("unknown account {:?}", mutation.account)
          })?;
        if current.state != mutation.prev_account_state {
          return Err(format!(
            "stale previous state for account {:?}",
            mutation.account
          ));
        }
      }
    }
    Ok(())
  }

  async fn commit(&self, block: &Block) {
    match self.store.commit_block(block).await {
      Ok(()) => info!(
        "{}: committed block #{} ({} transactions)",
        self.id(),
        block.number,
        block.transactions.len()
      ),
      Err(err) => warn!(
        "{}: failed to commit block #{}: {err}",
        self.id(),
        block.number
      ),
    }
  }

  async fn query_blockchain(&self, params: Value) -> Result<Value, RpcError> {
    let params: QueryBlockchainParams = parse_params(params)?;
    let block = self
      .store
      .block_by_number(params.blockchain_number)
      .await
      .map_err(RpcError::internal)?
      .ok_or_else(|| RpcError::new("blockchain not found"))?;
    serde_json::to_value(block).map_err(RpcError::internal)
  }

  async fn query_accounts(&self, params: Value) -> Result<Value, RpcError> {
    let params: QueryAccountsParams = parse_params(params)?;
    let (limit, offset) = page(params.limit, params.offset);
    let records = self
      .store
      .account_states(&AccountQuery {
        account: params.account,
        version: params.version,
        latest_only: params.latest_version.unwrap_or(false),
        limit,
        offset,
      })
      .await
      .map_err(RpcError::internal)?;
    let rows: Vec<Value> = records
      .iter()
      .map(|record| {
        json!({
          "account": record.account,
          "hash": record.state.hash,
          "version": record.state.version,
          "value": record.state.value,
        })
      })
      .collect();
    Ok(Value::Array(rows))
  }

  async fn list_blockchains(&self, params: Value) -> Result<Value, RpcError> {
    let params: ListBlockchainsParams = parse_params(params)?;
    let (limit, offset) = page(params.limit, params.offset);
    let blocks = self
      .store
      .list_blocks(params.asc.unwrap_or(false), limit, offset)
      .await
      .map_err(RpcError::internal)?;
    serde_json::to_value(blocks).map_err(RpcError::internal)
  }
}

/// Registers everything common to the peer roles on a registry
/// builder: identification, chain queries, the verification
/// notifications and the `who-are-you` exchange for inbound
/// connections.
pub fn register_peer_handlers(
  builder: RegistryBuilder,
  core: &Arc<PeerCore>,
) -> RegistryBuilder {
  let mut builder = builder
    .on_request("who-are-you", None, {
      let core = core.clone();
      move |_params, _ctx| {
        let core = core.clone();
        async move { Ok(json!(core.id())) }
      }
    })
    .on_request("ping", None, |params, _ctx| async move { Ok(params) })
    .on_accepted(None, {
      let core = core.clone();
      move |ctx| {
        let core = core.clone();
        async move { identify_peer(&core, ctx).await }
      }
    })
    .on_notification(NEW_BLOCKCHAIN, Some(Role::Orderer), {
      let core = core.clone();
      move |params, ctx| {
        let core = core.clone();
        async move {
          let block: Block = match serde_json::from_value(params) {
            Ok(block) => block,
            Err(err) => {
              warn!("{}: undecodable block proposal: {err}", core.id());
              return;
            }
          };
          core.process_proposal(ctx.router(), block).await;
        }
      }
    })
    .on_notification("shutdown", Some(Role::Admin), {
      let core = core.clone();
      move |_params, ctx| {
        let core = core.clone();
        async move {
          info!("{}: shutdown requested", core.id());
          ctx.router().shutdown();
        }
      }
    });

  for role in [Role::Orderer, Role::Endorser] {
    builder = builder.on_notification(NEW_BLOCKCHAIN_VERIFIED, Some(role), {
      let core = core.clone();
      move |params, _ctx| {
        let core = core.clone();
        async move {
          let params: VerifiedParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
              warn!("{}: undecodable vote: {err}", core.id());
              return;
            }
          };
          core.record_vote(params.hash, params.verified).await;
        }
      }
    });
  }

  for role in [Role::Admin, Role::Client] {
    builder = builder
      .on_request("query-blockchain", Some(role), {
        let core = core.clone();
        move |params, _ctx| {
          let core = core.clone();
          async move { core.query_blockchain(params).await }
        }
      })
      .on_request("query-accounts", Some(role), {
        let core = core.clone();
        move |params, _ctx| {
          let core = core.clone();
          async move { core.query_accounts(params).await }
        }
      })
      .on_request("list-blockchains", Some(role), {
        let core = core.clone();
        move |params, _ctx| {
          let core = core.clone();
          async move { core.list_blockchains(params).await }
        }
      })
      .on_request("query-topology", Some(role), |_params, ctx| async move {
        Ok(json!(ctx.router().accepted_peers()))
      });
  }

  builder
}

/// Asks an unidentified inbound connection who it is and, when the
/// answer matches a configured node, rebinds the connection to that
/// identity.
async fn identify_peer(core: &Arc<PeerCore>, ctx: Context) {
  match ctx.request("who-are-you", Value::Null).await {
    Ok(Value::String(id)) => match core.network.info(&id) {
      Some(info) => {
        let role = info.role;
        if ctx.rebind(info) {
          debug!("{}: {id} connected as {role}", core.id());
        }
      }
      None => warn!("{}: unknown node {id:?} connected", core.id()),
    },
    Ok(other) => {
      warn!("{}: malformed who-are-you reply: {other:?}", core.id())
    }
    Err(err) => debug!("{}: who-are-you failed: {err}", core.id()),
  }
}

/// Opens the outbound half of the peer mesh: every peer listed
/// before this one in the configuration.
pub async fn join_mesh(core: &Arc<PeerCore>, router: &Arc<Router>) {
  for peer in core.network.peers_before(core.id()) {
    match router
      .start_connection(peer.public_addr, Some(peer.info()))
      .await
    {
      Ok(conn) => debug!("{}: dialed peer {conn}", core.id()),
      Err(err) => {
        warn!("{}: cannot reach {} at {}: {err}", core.id(), peer.id,
              peer.public_addr)
      }
    }
  }
}
