//! Role-independent node plumbing: the on-disk keystore and the
//! validation entry points every inbound envelope goes through.

use {
  crate::{
    config::NetworkConfig,
    model::{Block, Transaction, ValidationError},
    primitives::{time, Keypair},
    store::{Store, CHAIN_DB},
  },
  ed25519_dalek::PublicKey,
  std::{
    collections::HashMap,
    fs,
    io,
    path::Path,
  },
  thiserror::Error,
  tracing::{debug, info},
};

const PUB_KEY_EXT: &str = ".pub.key";
const PRIVATE_KEY_FILE: &str = "private.key";

#[derive(Debug, Error)]
pub enum KeystoreError {
  #[error("cannot access key material: {0}")]
  Io(#[from] io::Error),

  #[error("bad key material: {0}")]
  BadKey(String),

  #[error("no public key for {0:?}")]
  UnknownNode(String),
}

/// A node's private key plus the public keys of every node in the
/// network, loaded from disk at startup.
///
/// Layout: `<root>/private.key` holds this node's 32 secret bytes;
/// `<public_root>/<id>.pub.key` holds each node's 32 public bytes.
pub struct Keystore {
  node_id: String,
  keypair: Keypair,
  public_keys: HashMap<String, PublicKey>,
}

impl Keystore {
  pub fn open(
    node_id: &str,
    root: &Path,
    public_root: &Path,
  ) -> Result<Self, KeystoreError> {
    let secret = fs::read(root.join(PRIVATE_KEY_FILE))?;
    let keypair = Keypair::try_from(secret.as_slice())
      .map_err(|err| KeystoreError::BadKey(err.to_string()))?;

    let mut public_keys = HashMap::new();
    for entry in fs::read_dir(public_root)? {
      let entry = entry?;
      let name = entry.file_name().to_string_lossy().into_owned();
      let Some(id) = name.strip_suffix(PUB_KEY_EXT) else { continue };
      let bytes = fs::read(entry.path())?;
      let key = PublicKey::from_bytes(&bytes)
        .map_err(|err| KeystoreError::BadKey(format!("{name}: {err}")))?;
      public_keys.insert(id.to_owned(), key);
    }

    if public_keys.get(node_id) != Some(&keypair.public()) {
      return Err(KeystoreError::BadKey(format!(
        "published public key of {node_id:?} does not match private.key"
      )));
    }
    debug!("loaded {} public keys for {node_id}", public_keys.len());
    Ok(Self {
      node_id: node_id.to_owned(),
      keypair,
      public_keys,
    })
  }

  /// Creates and writes a fresh keypair for `node_id`: the secret
  /// under the node root, the public half in the shared directory.
  pub fn generate(
    node_id: &str,
    root: &Path,
    public_root: &Path,
  ) -> Result<(), KeystoreError> {
    fs::create_dir_all(root)?;
    fs::create_dir_all(public_root)?;
    let keypair = Keypair::generate();
    fs::write(root.join(PRIVATE_KEY_FILE), keypair.secret_bytes())?;
    fs::write(
      public_root.join(format!("{node_id}{PUB_KEY_EXT}")),
      keypair.public().as_bytes(),
    )?;
    Ok(())
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  pub fn keypair(&self) -> &Keypair {
    &self.keypair
  }

  pub fn public_key(&self, node_id: &str) -> Option<PublicKey> {
    self.public_keys.get(node_id).copied()
  }
}

/// One-time network initialization: a keypair for every node and a
/// seeded chain database for every peer. All peers share the same
/// genesis block, so their chains agree from block #1.
pub async fn init_network(config: &NetworkConfig) -> anyhow::Result<()> {
  let genesis = Block::genesis(time::now());
  let accounts = config.genesis_accounts();

  for peer in &config.peers {
    Keystore::generate(&peer.id, &peer.root, &config.public_root)?;
  }
  for client in &config.clients {
    Keystore::generate(&client.id, &client.root, &config.public_root)?;
  }
  for peer in &config.peers {
    let store = Store::open(&peer.root.join(CHAIN_DB)).await?;
    store.init(&accounts, &genesis).await?;
  }

  info!(
    "initialized {} peer(s) and {} client(s), genesis {}",
    config.peers.len(),
    config.clients.len(),
    genesis.hash
  );
  Ok(())
}

/// Re-validates an inbound transaction envelope: every hash is
/// recomputed and the endorser's signature checked against the
/// published key.
pub fn validate_transaction(
  keystore: &Keystore,
  transaction: &Transaction,
) -> Result<(), ValidationError> {
  let key = keystore
    .public_key(&transaction.endorser)
    .ok_or(ValidationError::UnknownEndorser)?;
  transaction.validate(&key)
}

/// Re-validates an inbound block proposal and everything inside it.
pub fn validate_block(
  keystore: &Keystore,
  block: &Block,
) -> Result<(), ValidationError> {
  block.validate(|endorser| keystore.public_key(endorser))
}
