//! The relational store behind every peer: four tables holding the
//! committed chain. `(account, version)` and `blockchains.number`
//! are unique; a block commits in one transaction or not at all.

use {
  crate::{
    model::{AccountState, Block, Mutation, Transaction},
    primitives::{time, Amount, Digest, SignatureBytes},
  },
  sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row,
    SqlitePool,
  },
  std::path::Path,
  thiserror::Error,
  tracing::info,
};

/// File name of a peer's chain database under its root directory.
pub const CHAIN_DB: &str = "chain.db";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("corrupt row: {0}")]
  Corrupt(String),

  #[error("chain is not initialized")]
  EmptyChain,
}

/// One persisted account version together with its owning account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
  pub account: String,
  pub state: AccountState,
}

/// Filters of the `query-accounts` operation.
#[derive(Debug, Clone, Default)]
pub struct AccountQuery {
  pub account: Option<String>,
  pub version: Option<u64>,
  pub latest_only: bool,
  pub limit: i64,
  pub offset: i64,
}

const SCHEMA: &[&str] = &[
  "CREATE TABLE account_states (
     account TEXT NOT NULL,
     version INTEGER NOT NULL,
     value INTEGER NOT NULL,
     hash BLOB NOT NULL,
     PRIMARY KEY (account, version)
   )",
  "CREATE TABLE transactions (
     hash BLOB NOT NULL PRIMARY KEY,
     endorser TEXT NOT NULL,
     signature BLOB NOT NULL,
     timestamp TEXT NOT NULL,
     blockchain_hash BLOB NOT NULL,
     seq INTEGER NOT NULL
   )",
  "CREATE TABLE transaction_mutations (
     hash BLOB NOT NULL PRIMARY KEY,
     account TEXT NOT NULL,
     prev_version INTEGER NOT NULL,
     next_version INTEGER NOT NULL,
     transaction_hash BLOB NOT NULL,
     seq INTEGER NOT NULL
   )",
  "CREATE TABLE blockchains (
     hash BLOB NOT NULL PRIMARY KEY,
     prev_hash BLOB NOT NULL,
     timestamp TEXT NOT NULL,
     number INTEGER NOT NULL
   )",
  "CREATE UNIQUE INDEX blockchains_number ON blockchains (number)",
];

const DROP: &[&str] = &[
  "DROP TABLE IF EXISTS account_states",
  "DROP TABLE IF EXISTS transactions",
  "DROP TABLE IF EXISTS transaction_mutations",
  "DROP TABLE IF EXISTS blockchains",
];

fn digest_column(row: &SqliteRow, column: &str) -> Result<Digest, StoreError> {
  let blob: Vec<u8> = row.try_get(column)?;
  let bytes: [u8; 32] = blob
    .try_into()
    .map_err(|_| StoreError::Corrupt(format!("{column} is not 32 bytes")))?;
  Ok(Digest::from_bytes(bytes))
}

fn signature_column(
  row: &SqliteRow,
  column: &str,
) -> Result<SignatureBytes, StoreError> {
  let blob: Vec<u8> = row.try_get(column)?;
  let bytes: [u8; 64] = blob
    .try_into()
    .map_err(|_| StoreError::Corrupt(format!("{column} is not 64 bytes")))?;
  Ok(SignatureBytes::from_bytes(bytes))
}

fn timestamp_column(
  row: &SqliteRow,
  column: &str,
) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
  let text: String = row.try_get(column)?;
  let parsed = chrono::DateTime::parse_from_rfc3339(&text)
    .map_err(|err| StoreError::Corrupt(format!("{column}: {err}")))?;
  Ok(time::truncate(parsed.with_timezone(&chrono::Utc)))
}

fn account_record(row: &SqliteRow) -> Result<AccountRecord, StoreError> {
  Ok(AccountRecord {
    account: row.try_get("account")?,
    state: AccountState {
      hash: digest_column(row, "hash")?,
      version: row.try_get::<i64, _>("version")? as u64,
      value: Amount::from_millis(row.try_get("value")?),
    },
  })
}

/// Handle to one peer's chain database.
#[derive(Clone)]
pub struct Store {
  pool: SqlitePool,
}

impl Store {
  /// Opens (creating if missing) the database file of a peer.
  pub async fn open(path: &Path) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;
    Ok(Self { pool })
  }

  pub async fn open_in_memory() -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new().filename(":memory:");
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;
    Ok(Self { pool })
  }

  /// Wipes the database and seeds it with the genesis block and one
  /// version-0 account state per given account.
  pub async fn init(
    &self,
    accounts: &[String],
    genesis: &Block,
  ) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;
    for statement in DROP.iter().chain(SCHEMA) {
      sqlx::query(statement).execute(&mut tx).await?;
    }
    for account in accounts {
      let state = AccountState::genesis(account);
      sqlx::query(
        "INSERT INTO account_states (account, version, value, hash)
         VALUES (?, ?, ?, ?)",
      )
      .bind(account)
      .bind(state.version as i64)
      .bind(state.value.millis())
      .bind(state.hash.as_bytes())
      .execute(&mut tx)
      .await?;
    }
    sqlx::query(
      "INSERT INTO blockchains (hash, prev_hash, timestamp, number)
       VALUES (?, ?, ?, ?)",
    )
    .bind(genesis.hash.as_bytes())
    .bind(genesis.prev_hash.as_bytes())
    .bind(time::iso(&genesis.timestamp))
    .bind(genesis.number as i64)
    .execute(&mut tx)
    .await?;
    tx.commit().await?;
    info!("store initialized with {} genesis accounts", accounts.len());
    Ok(())
  }

  /// The most recent committed version of one account.
  pub async fn latest_account(
    &self,
    account: &str,
  ) -> Result<Option<AccountRecord>, StoreError> {
    let row = sqlx::query(
      "SELECT account, version, value, hash FROM account_states
       WHERE account = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(account)
    .fetch_optional(&self.pool)
    .await?;
    row.as_ref().map(account_record).transpose()
  }

  /// Paginated account-state listing with the optional filters of
  /// `query-accounts`.
  pub async fn account_states(
    &self,
    query: &AccountQuery,
  ) -> Result<Vec<AccountRecord>, StoreError> {
    let mut sql = String::from(
      "SELECT a.account, a.version, a.value, a.hash FROM account_states a",
    );
    if query.latest_only {
      sql.push_str(
        " JOIN (SELECT account, MAX(version) AS latest
                FROM account_states GROUP BY account) m
          ON m.account = a.account AND m.latest = a.version",
      );
    }
    let mut clauses = Vec::new();
    if query.account.is_some() {
      clauses.push("a.account = ?");
    }
    if query.version.is_some() {
      clauses.push("a.version = ?");
    }
    if !clauses.is_empty() {
      sql.push_str(" WHERE ");
      sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.account, a.version LIMIT ? OFFSET ?");

    let mut prepared = sqlx::query(&sql);
    if let Some(account) = &query.account {
      prepared = prepared.bind(account);
    }
    if let Some(version) = query.version {
      prepared = prepared.bind(version as i64);
    }
    prepared = prepared.bind(query.limit).bind(query.offset);

    let rows = prepared.fetch_all(&self.pool).await?;
    rows.iter().map(account_record).collect()
  }

  /// The tip of the committed chain, transactions included.
  pub async fn latest_block(&self) -> Result<Block, StoreError> {
    let row = sqlx::query(
      "SELECT hash, prev_hash, timestamp, number FROM blockchains
       ORDER BY number DESC LIMIT 1",
    )
    .fetch_optional(&self.pool)
    .await?
    .ok_or(StoreError::EmptyChain)?;
    self.load_block(&row).await
  }

  pub async fn block_by_number(
    &self,
    number: u64,
  ) -> Result<Option<Block>, StoreError> {
    let row = sqlx::query(
      "SELECT hash, prev_hash, timestamp, number FROM blockchains
       WHERE number = ?",
    )
    .bind(number as i64)
    .fetch_optional(&self.pool)
    .await?;
    match row {
      Some(row) => Ok(Some(self.load_block(&row).await?)),
      None => Ok(None),
    }
  }

  /// Blocks ordered by number, paginated.
  pub async fn list_blocks(
    &self,
    ascending: bool,
    limit: i64,
    offset: i64,
  ) -> Result<Vec<Block>, StoreError> {
    let sql = if ascending {
      "SELECT hash, prev_hash, timestamp, number FROM blockchains
       ORDER BY number ASC LIMIT ? OFFSET ?"
    } else {
      "SELECT hash, prev_hash, timestamp, number FROM blockchains
       ORDER BY number DESC LIMIT ? OFFSET ?"
    };
    let rows = sqlx::query(sql)
      .bind(limit)
      .bind(offset)
      .fetch_all(&self.pool)
      .await?;
    let mut blocks = Vec::with_capacity(rows.len());
    for row in &rows {
      blocks.push(self.load_block(row).await?);
    }
    Ok(blocks)
  }

  async fn load_block(&self, row: &SqliteRow) -> Result<Block, StoreError> {
    let hash = digest_column(row, "hash")?;
    let tx_rows = sqlx::query(
      "SELECT hash, endorser, signature, timestamp FROM transactions
       WHERE blockchain_hash = ? ORDER BY seq",
    )
    .bind(hash.as_bytes())
    .fetch_all(&self.pool)
    .await?;
    let mut transactions = Vec::with_capacity(tx_rows.len());
    for tx_row in &tx_rows {
      transactions.push(self.load_transaction(tx_row).await?);
    }
    Ok(Block {
      hash,
      prev_hash: digest_column(row, "prev_hash")?,
      timestamp: timestamp_column(row, "timestamp")?,
      number: row.try_get::<i64, _>("number")? as u64,
      transactions,
    })
  }

  async fn load_transaction(
    &self,
    row: &SqliteRow,
  ) -> Result<Transaction, StoreError> {
    let hash = digest_column(row, "hash")?;
    let mutation_rows = sqlx::query(
      "SELECT m.hash, m.account, m.prev_version, m.next_version,
              p.value AS prev_value, p.hash AS prev_hash,
              n.value AS next_value, n.hash AS next_hash
       FROM transaction_mutations m
       JOIN account_states p
         ON p.account = m.account AND p.version = m.prev_version
       JOIN account_states n
         ON n.account = m.account AND n.version = m.next_version
       WHERE m.transaction_hash = ? ORDER BY m.seq",
    )
    .bind(hash.as_bytes())
    .fetch_all(&self.pool)
    .await?;
    let mut mutations = Vec::with_capacity(mutation_rows.len());
    for m in &mutation_rows {
      mutations.push(Mutation {
        hash: digest_column(m, "hash")?,
        account: m.try_get("account")?,
        prev_account_state: AccountState {
          hash: digest_column(m, "prev_hash")?,
          version: m.try_get::<i64, _>("prev_version")? as u64,
          value: Amount::from_millis(m.try_get("prev_value")?),
        },
        next_account_state: AccountState {
          hash: digest_column(m, "next_hash")?,
          version: m.try_get::<i64, _>("next_version")? as u64,
          value: Amount::from_millis(m.try_get("next_value")?),
        },
      });
    }
    Ok(Transaction {
      hash,
      endorser: row.try_get("endorser")?,
      signature: signature_column(row, "signature")?,
      timestamp: timestamp_column(row, "timestamp")?,
      mutations,
    })
  }

  /// Persists a verified block atomically: the block row, its
  /// transactions and mutations, and one new account state per
  /// mutated account.
  pub async fn commit_block(&self, block: &Block) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;
    sqlx::query(
      "INSERT INTO blockchains (hash, prev_hash, timestamp, number)
       VALUES (?, ?, ?, ?)",
    )
    .bind(block.hash.as_bytes())
    .bind(block.prev_hash.as_bytes())
    .bind(time::iso(&block.timestamp))
    .bind(block.number as i64)
    .execute(&mut tx)
    .await?;
    for (seq, transaction) in block.transactions.iter().enumerate() {
      sqlx::query(
        "INSERT INTO transactions
           (hash, endorser, signature, timestamp, blockchain_hash, seq)
         VALUES (?, ?, ?, ?, ?, ?)",
      )
      .bind(transaction.hash.as_bytes())
      .bind(&transaction.endorser)
      .bind(transaction.signature.as_bytes())
      .bind(time::iso(&transaction.timestamp))
      .bind(block.hash.as_bytes())
      .bind(seq as i64)
      .execute(&mut tx)
      .await?;
      for (mutation_seq, mutation) in transaction.mutations.iter().enumerate()
      {
        sqlx::query(
          "INSERT INTO transaction_mutations
             (hash, account, prev_version, next_version,
              transaction_hash, seq)
           VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(mutation.hash.as_bytes())
        .bind(&mutation.account)
        .bind(mutation.prev_account_state.version as i64)
        .bind(mutation.next_account_state.version as i64)
        .bind(transaction.hash.as_bytes())
        .bind(mutation_seq as i64)
        .execute(&mut tx)
        .await?;
        let next = &mutation.next_account_state;
        sqlx::query(
          "INSERT INTO account_states (account, version, value, hash)
           VALUES (?, ?, ?, ?)",
        )
        .bind(&mutation.account)
        .bind(next.version as i64)
        .bind(next.value.millis())
        .bind(next.hash.as_bytes())
        .execute(&mut tx)
        .await?;
      }
    }
    tx.commit().await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{AccountQuery, Store, StoreError},
    crate::{
      model::{AccountState, Block, Mutation, Transaction},
      primitives::{time, Amount, Keypair},
    },
  };

  async fn seeded(accounts: &[&str]) -> (Store, Block) {
    let store = Store::open_in_memory().await.unwrap();
    let genesis = Block::genesis(time::now());
    let accounts: Vec<String> =
      accounts.iter().map(|a| a.to_string()).collect();
    store.init(&accounts, &genesis).await.unwrap();
    (store, genesis)
  }

  fn mint_block(
    store_accounts: &[(&str, AccountState)],
    prev: &Block,
    keypair: &Keypair,
    amount: i64,
  ) -> Block {
    let mutations = store_accounts
      .iter()
      .map(|(account, state)| {
        Mutation::apply(account, *state, Amount::from_millis(amount)).unwrap()
      })
      .collect();
    let tx = Transaction::endorse(keypair, "e1", time::now(), mutations);
    Block::assemble(prev.hash, prev.number, time::now(), vec![tx])
  }

  #[tokio::test]
  async fn init_seeds_genesis() {
    let (store, genesis) = seeded(&["coinbase", "o", "e1"]).await;
    let latest = store.latest_block().await.unwrap();
    assert_eq!(latest, genesis);
    let coinbase = store.latest_account("coinbase").await.unwrap().unwrap();
    assert_eq!(coinbase.state.version, 0);
    assert_eq!(coinbase.state.value, Amount::ZERO);
    assert!(store.latest_account("nobody").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn commit_and_reload_a_block() {
    let (store, genesis) = seeded(&["coinbase", "admin"]).await;
    let keypair = Keypair::generate();
    let admin = store.latest_account("admin").await.unwrap().unwrap();
    let coinbase = store.latest_account("coinbase").await.unwrap().unwrap();
    let block = mint_block(
      &[("admin", admin.state), ("coinbase", coinbase.state)],
      &genesis,
      &keypair,
      100_000,
    );
    store.commit_block(&block).await.unwrap();

    let reloaded = store.block_by_number(2).await.unwrap().unwrap();
    assert_eq!(reloaded, block);
    assert_eq!(store.latest_block().await.unwrap(), block);

    let admin = store.latest_account("admin").await.unwrap().unwrap();
    assert_eq!(admin.state.version, 1);
    assert_eq!(admin.state.value, Amount::from_millis(100_000));
  }

  #[tokio::test]
  async fn commit_is_atomic() {
    let (store, genesis) = seeded(&["coinbase", "admin"]).await;
    let keypair = Keypair::generate();
    let admin = store.latest_account("admin").await.unwrap().unwrap();
    let coinbase = store.latest_account("coinbase").await.unwrap().unwrap();
    let block = mint_block(
      &[("admin", admin.state), ("coinbase", coinbase.state)],
      &genesis,
      &keypair,
      100_000,
    );
    store.commit_block(&block).await.unwrap();
    // committing the same block again violates the primary key and
    // must leave no partial rows behind
    assert!(store.commit_block(&block).await.is_err());
    let states = store
      .account_states(&AccountQuery {
        account: Some("admin".into()),
        limit: 100,
        ..Default::default()
      })
      .await
      .unwrap();
    assert_eq!(states.len(), 2); // versions 0 and 1, not 3
  }

  #[tokio::test]
  async fn account_query_filters() {
    let (store, genesis) = seeded(&["coinbase", "admin"]).await;
    let keypair = Keypair::generate();
    let admin = store.latest_account("admin").await.unwrap().unwrap();
    let coinbase = store.latest_account("coinbase").await.unwrap().unwrap();
    let block = mint_block(
      &[("admin", admin.state), ("coinbase", coinbase.state)],
      &genesis,
      &keypair,
      5_000,
    );
    store.commit_block(&block).await.unwrap();

    let latest = store
      .account_states(&AccountQuery {
        latest_only: true,
        limit: 15,
        ..Default::default()
      })
      .await
      .unwrap();
    assert_eq!(latest.len(), 2);
    assert!(latest.iter().all(|record| record.state.version == 1));

    let pinned = store
      .account_states(&AccountQuery {
        account: Some("admin".into()),
        version: Some(0),
        limit: 15,
        ..Default::default()
      })
      .await
      .unwrap();
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].state.value, Amount::ZERO);

    let paged = store
      .account_states(&AccountQuery {
        limit: 2,
        offset: 2,
        ..Default::default()
      })
      .await
      .unwrap();
    assert_eq!(paged.len(), 2);
  }

  #[tokio::test]
  async fn listing_order_and_pagination() {
    let (store, genesis) = seeded(&["coinbase", "admin"]).await;
    let keypair = Keypair::generate();
    let mut prev = genesis;
    for _ in 0..4 {
      let admin = store.latest_account("admin").await.unwrap().unwrap();
      let coinbase =
        store.latest_account("coinbase").await.unwrap().unwrap();
      let block = mint_block(
        &[("admin", admin.state), ("coinbase", coinbase.state)],
        &prev,
        &keypair,
        1_000,
      );
      store.commit_block(&block).await.unwrap();
      prev = block;
    }

    let newest = store.list_blocks(false, 2, 0).await.unwrap();
    let numbers: Vec<u64> = newest.iter().map(|block| block.number).collect();
    assert_eq!(numbers, vec![5, 4]);

    let oldest = store.list_blocks(true, 3, 1).await.unwrap();
    let numbers: Vec<u64> = oldest.iter().map(|block| block.number).collect();
    assert_eq!(numbers, vec![2, 3, 4]);

    let tip = store.block_by_number(5).await.unwrap().unwrap();
    assert_eq!(tip.hash, newest[0].hash);
    assert!(store.block_by_number(17).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn empty_database_has_no_chain() {
    let store = Store::open_in_memory().await.unwrap();
    assert!(matches!(
      store.latest_block().await,
      Err(StoreError::EmptyChain) | Err(StoreError::Database(_))
    ));
  }
}
