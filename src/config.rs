use {
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Display, Formatter},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
  },
  thiserror::Error,
};

/// The role a node plays in the network.
///
/// Orderers and endorsers are peers: they listen, persist the chain
/// and take part in verification. Clients and admins are outbound
/// only.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Orderer,
  Endorser,
  Client,
  Admin,
}

impl Role {
  pub fn is_peer(self) -> bool {
    matches!(self, Role::Orderer | Role::Endorser)
  }
}

impl Display for Role {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Role::Orderer => "orderer",
      Role::Endorser => "endorser",
      Role::Client => "client",
      Role::Admin => "admin",
    };
    write!(f, "{name}")
  }
}

/// The identity attached to a live connection once the peer behind
/// it is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
  pub id: String,
  pub role: Role,
}

/// A peer node: listens on `bind_addr`, reachable at `public_addr`,
/// keeps its database and private key under `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
  pub id: String,
  pub role: Role,
  pub bind_addr: SocketAddr,
  pub public_addr: SocketAddr,
  pub root: PathBuf,
}

impl PeerEntry {
  pub fn info(&self) -> PeerInfo {
    PeerInfo {
      id: self.id.clone(),
      role: self.role,
    }
  }
}

/// A client or admin node; outbound only, no listening socket and no
/// chain database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
  pub id: String,
  pub role: Role,
  pub root: PathBuf,
}

impl ClientEntry {
  pub fn info(&self) -> PeerInfo {
    PeerInfo {
      id: self.id.clone(),
      role: self.role,
    }
  }
}

/// HTTP surface of a client/admin node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
  pub bind_addr: SocketAddr,
}

fn default_max_transaction_pool() -> usize {
  10
}

fn default_blockchain_creation_timeout() -> Duration {
  Duration::from_secs(1)
}

/// Orderer tunables: how many transactions trigger a block early and
/// how long the builder waits before cutting one anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdererConfig {
  #[serde(default = "default_max_transaction_pool")]
  pub max_transaction_pool: usize,

  #[serde(
    default = "default_blockchain_creation_timeout",
    with = "humantime_serde"
  )]
  pub blockchain_creation_timeout: Duration,
}

impl Default for OrdererConfig {
  fn default() -> Self {
    Self {
      max_transaction_pool: default_max_transaction_pool(),
      blockchain_creation_timeout: default_blockchain_creation_timeout(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read config: {0}")]
  Io(#[from] std::io::Error),

  #[error("cannot parse config: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("invalid config: {0}")]
  Invalid(String),
}

/// The whole network as every node sees it: the static set of peers
/// and clients, the shared public-key directory, the optional web
/// surface and the orderer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
  pub peers: Vec<PeerEntry>,

  #[serde(default)]
  pub clients: Vec<ClientEntry>,

  pub public_root: PathBuf,

  #[serde(default)]
  pub web: Option<WebConfig>,

  #[serde(default)]
  pub orderer: OrdererConfig,
}

fn expand(path: &Path) -> PathBuf {
  PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl NetworkConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let mut config: NetworkConfig = serde_yaml::from_str(&raw)?;
    config.public_root = expand(&config.public_root);
    for peer in &mut config.peers {
      peer.root = expand(&peer.root);
    }
    for client in &mut config.clients {
      client.root = expand(&client.root);
    }
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for (id, role) in self
      .peers
      .iter()
      .map(|peer| (&peer.id, peer.role))
      .chain(self.clients.iter().map(|client| (&client.id, client.role)))
    {
      if id == crate::model::COINBASE {
        return Err(ConfigError::Invalid(format!(
          "node id cannot be {:?}",
          crate::model::COINBASE
        )));
      }
      if !seen.insert(id.clone()) {
        return Err(ConfigError::Invalid(format!("duplicate node id {id:?}")));
      }
      match role {
        Role::Orderer | Role::Endorser if self.peer(id).is_none() => {
          return Err(ConfigError::Invalid(format!(
            "{id:?} has peer role {role} but is listed under clients"
          )));
        }
        Role::Client | Role::Admin if self.peer(id).is_some() => {
          return Err(ConfigError::Invalid(format!(
            "{id:?} has client role {role} but is listed under peers"
          )));
        }
        _ => {}
      }
    }
    let orderers = self
      .peers
      .iter()
      .filter(|peer| peer.role == Role::Orderer)
      .count();
    if orderers != 1 {
      return Err(ConfigError::Invalid(format!(
        "expected exactly one orderer, found {orderers}"
      )));
    }
    Ok(())
  }

  pub fn peer(&self, id: &str) -> Option<&PeerEntry> {
    self.peers.iter().find(|peer| peer.id == id)
  }

  pub fn client(&self, id: &str) -> Option<&ClientEntry> {
    self.clients.iter().find(|client| client.id == id)
  }

  /// Connection identity for any configured node id.
  pub fn info(&self, id: &str) -> Option<PeerInfo> {
    self
      .peer(id)
      .map(PeerEntry::info)
      .or_else(|| self.client(id).map(ClientEntry::info))
  }

  /// Every account that exists at genesis: the coinbase plus one per
  /// configured node.
  pub fn genesis_accounts(&self) -> Vec<String> {
    std::iter::once(crate::model::COINBASE.to_owned())
      .chain(self.peers.iter().map(|peer| peer.id.clone()))
      .chain(self.clients.iter().map(|client| client.id.clone()))
      .collect()
  }

  /// The peers a given peer dials at startup: everyone listed before
  /// it. Together with everyone after it dialing in, this forms a
  /// full mesh.
  pub fn peers_before(&self, id: &str) -> Vec<&PeerEntry> {
    self
      .peers
      .iter()
      .take_while(|peer| peer.id != id)
      .collect()
  }

  /// Number of distinct peer verifications (counting the verifier
  /// itself) required to commit a block: tolerates ⌊(n−1)/3⌋ faults
  /// for n > 3, and requires all n for n ≤ 3.
  pub fn verify_num(&self) -> usize {
    let peers = self.peers.len();
    let fault_quorum = 2 * ((peers.saturating_sub(1) + 2) / 3) + 1;
    peers.min(fault_quorum.max(3))
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::time::Duration};

  fn sample_yaml() -> &'static str {
    r#"
public_root: /tmp/palisade/public
peers:
  - id: o
    role: orderer
    bind_addr: 127.0.0.1:7100
    public_addr: 127.0.0.1:7100
    root: /tmp/palisade/o
  - id: e1
    role: endorser
    bind_addr: 127.0.0.1:7101
    public_addr: 127.0.0.1:7101
    root: /tmp/palisade/e1
  - id: e2
    role: endorser
    bind_addr: 127.0.0.1:7102
    public_addr: 127.0.0.1:7102
    root: /tmp/palisade/e2
clients:
  - id: c
    role: client
    root: /tmp/palisade/c
  - id: admin
    role: admin
    root: /tmp/palisade/admin
web:
  bind_addr: 127.0.0.1:8080
orderer:
  max_transaction_pool: 5
  blockchain_creation_timeout: 250ms
"#
  }

  #[test]
  fn parses_the_sample() {
    let config: NetworkConfig = serde_yaml::from_str(sample_yaml()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.peers.len(), 3);
    assert_eq!(config.clients.len(), 2);
    assert_eq!(config.orderer.max_transaction_pool, 5);
    assert_eq!(
      config.orderer.blockchain_creation_timeout,
      Duration::from_millis(250)
    );
    assert_eq!(config.info("e1").unwrap().role, Role::Endorser);
    assert_eq!(config.info("admin").unwrap().role, Role::Admin);
    assert!(config.info("nobody").is_none());
  }

  #[test]
  fn orderer_defaults() {
    let trimmed = sample_yaml().replace(
      "orderer:
  max_transaction_pool: 5
  blockchain_creation_timeout: 250ms",
      "",
    );
    let config: NetworkConfig = serde_yaml::from_str(&trimmed).unwrap();
    assert_eq!(config.orderer.max_transaction_pool, 10);
    assert_eq!(
      config.orderer.blockchain_creation_timeout,
      Duration::from_secs(1)
    );
  }

  #[test]
  fn genesis_accounts_cover_every_node() {
    let config: NetworkConfig = serde_yaml::from_str(sample_yaml()).unwrap();
    assert_eq!(
      config.genesis_accounts(),
      vec!["coinbase", "o", "e1", "e2", "c", "admin"]
    );
  }

  #[test]
  fn mesh_dials_the_peers_listed_before() {
    let config: NetworkConfig = serde_yaml::from_str(sample_yaml()).unwrap();
    let before: Vec<&str> = config
      .peers_before("e2")
      .iter()
      .map(|peer| peer.id.as_str())
      .collect();
    assert_eq!(before, vec!["o", "e1"]);
    assert!(config.peers_before("o").is_empty());
  }

  #[test]
  fn verify_num_formula() {
    let mut config: NetworkConfig =
      serde_yaml::from_str(sample_yaml()).unwrap();
    assert_eq!(config.verify_num(), 3); // n = 3 ⇒ everyone
    config.peers.truncate(1);
    assert_eq!(config.verify_num(), 1);
    config.peers = (0..7)
      .map(|i| PeerEntry {
        id: format!("p{i}"),
        role: if i == 0 { Role::Orderer } else { Role::Endorser },
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        public_addr: "127.0.0.1:0".parse().unwrap(),
        root: "/tmp/x".into(),
      })
      .collect();
    assert_eq!(config.verify_num(), 5);
  }

  #[test]
  fn rejects_coinbase_and_duplicates() {
    let mut config: NetworkConfig =
      serde_yaml::from_str(sample_yaml()).unwrap();
    config.clients[0].id = "coinbase".into();
    assert!(config.validate().is_err());

    let mut config: NetworkConfig =
      serde_yaml::from_str(sample_yaml()).unwrap();
    config.clients[0].id = "e1".into();
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_networks_without_exactly_one_orderer() {
    let mut config: NetworkConfig =
      serde_yaml::from_str(sample_yaml()).unwrap();
    config.peers[1].role = Role::Orderer;
    assert!(config.validate().is_err());
  }
}
