use {
  super::cluster::{wait_for, TestCluster},
  serde_json::json,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn genesis_state() {
  let cluster = TestCluster::start().await;

  let mut hashes = Vec::new();
  for peer in ["o", "e1", "e2"] {
    let block = cluster
      .admin_request(peer, "query-blockchain", json!({"blockchain_number": 1}))
      .await
      .unwrap();
    assert_eq!(block["number"], 1);
    assert_eq!(block["prev_hash"], "00".repeat(32));
    assert!(block["transactions"].as_array().unwrap().is_empty());
    hashes.push(block["hash"].clone());
  }
  assert_eq!(hashes[0], hashes[1]);
  assert_eq!(hashes[1], hashes[2]);

  let rows = cluster
    .admin_request("o", "query-accounts", json!({"latest_version": true}))
    .await
    .unwrap();
  let rows = rows.as_array().unwrap().clone();
  assert_eq!(rows.len(), 6);
  for account in ["coinbase", "o", "e1", "e2", "c", "admin"] {
    let row = rows
      .iter()
      .find(|row| row["account"] == account)
      .unwrap_or_else(|| panic!("no genesis row for {account}"));
    assert_eq!(row["version"], 0);
    assert_eq!(row["value"], 0.0);
  }

  cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mint_transfer_and_listing() {
  let cluster = TestCluster::start().await;

  // mint: the envelope credits both the caller and the coinbase
  let envelope = cluster
    .admin_request("e1", "make-money", json!({"amount": 100.0}))
    .await
    .unwrap();
  let mutations = envelope["mutations"].as_array().unwrap();
  assert_eq!(mutations.len(), 2);
  assert_eq!(mutations[0]["account"], "admin");
  assert_eq!(mutations[1]["account"], "coinbase");
  assert_eq!(envelope["endorser"], "e1");

  cluster
    .admin_request("o", "submit-transactions", json!([envelope]))
    .await
    .unwrap();
  wait_for("mint to commit everywhere", || async {
    cluster.all_peers_at("admin", 100.0).await
      && cluster.all_peers_at("coinbase", 100.0).await
  })
  .await;
  cluster.await_block(2).await;
  let block = cluster
    .admin_request("o", "query-blockchain", json!({"blockchain_number": 2}))
    .await
    .unwrap();
  assert_eq!(block["transactions"].as_array().unwrap().len(), 1);

  // transfer 30 from the admin account to client c
  let envelope = cluster
    .admin_request(
      "e1",
      "transfer-money",
      json!([{"amount": 30.0, "target": "c"}]),
    )
    .await
    .unwrap();
  let mutations = envelope["mutations"].as_array().unwrap();
  assert_eq!(mutations.len(), 2);
  assert_eq!(mutations[0]["account"], "admin");
  assert_eq!(mutations[1]["account"], "c");
  cluster
    .admin_request("o", "submit-transactions", json!([envelope]))
    .await
    .unwrap();
  wait_for("transfer to commit everywhere", || async {
    cluster.all_peers_at("admin", 70.0).await
      && cluster.all_peers_at("c", 30.0).await
  })
  .await;
  cluster.await_block(3).await;

  // two more mints to grow the chain to five blocks
  for (block, amount) in [(4u64, 1.0), (5u64, 2.0)] {
    cluster.mint(amount).await.unwrap();
    cluster.await_block(block).await;
  }

  // newest-first listing gives [5, 4] and agrees with the direct
  // lookup of block #5
  let listed = cluster
    .admin_request("o", "list-blockchains", json!({"asc": false, "limit": 2}))
    .await
    .unwrap();
  let listed = listed.as_array().unwrap().clone();
  let numbers: Vec<u64> =
    listed.iter().map(|block| block["number"].as_u64().unwrap()).collect();
  assert_eq!(numbers, vec![5, 4]);
  let tip = cluster
    .admin_request("o", "query-blockchain", json!({"blockchain_number": 5}))
    .await
    .unwrap();
  assert_eq!(tip["hash"], listed[0]["hash"]);

  // version monotonicity and balance continuity, straight from the
  // orderer's database
  let store = cluster.open_store("o").await;
  let states = store
    .account_states(&crate::store::AccountQuery {
      account: Some("admin".into()),
      limit: 100,
      ..Default::default()
    })
    .await
    .unwrap();
  let versions: Vec<u64> =
    states.iter().map(|record| record.state.version).collect();
  let expected: Vec<u64> = (0..versions.len() as u64).collect();
  assert_eq!(versions, expected);
  assert_eq!(
    states.last().unwrap().state.value,
    crate::primitives::Amount::from_millis(73_000)
  );

  cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_batch_is_rejected_atomically() {
  let cluster = TestCluster::start().await;

  let first = cluster
    .admin_request("e1", "make-money", json!({"amount": 10.0}))
    .await
    .unwrap();
  let second = cluster
    .admin_request("e1", "make-money", json!({"amount": 20.0}))
    .await
    .unwrap();

  // both envelopes mutate the admin and coinbase accounts
  let err = cluster
    .admin_request("o", "submit-transactions", json!([first, second]))
    .await
    .unwrap_err();
  assert_eq!(err.message, "conflict transaction");

  // the rejection left the mempool untouched, so the first envelope
  // alone is still admissible
  cluster
    .admin_request("o", "submit-transactions", json!([first]))
    .await
    .unwrap();
  wait_for("the surviving envelope to commit", || async {
    cluster.all_peers_at("admin", 10.0).await
  })
  .await;

  cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tampered_signature_is_rejected() {
  let cluster = TestCluster::start().await;

  let mut envelope = cluster
    .admin_request("e1", "make-money", json!({"amount": 5.0}))
    .await
    .unwrap();
  let signature = envelope["signature"].as_str().unwrap();
  let tampered = if signature.starts_with('0') {
    format!("1{}", &signature[1..])
  } else {
    format!("0{}", &signature[1..])
  };
  envelope["signature"] = json!(tampered);

  let err = cluster
    .admin_request("o", "submit-transactions", json!([envelope]))
    .await
    .unwrap_err();
  assert_eq!(err.message, "wrong signature");

  // nothing was admitted, so no block follows the genesis block
  let err = cluster
    .admin_request("o", "query-blockchain", json!({"blockchain_number": 2}))
    .await
    .unwrap_err();
  assert_eq!(err.message, "blockchain not found");

  cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_reach_ui_subscribers() {
  let cluster = TestCluster::start().await;
  let mut events = cluster.admin.events.subscribe();

  cluster.mint(1.0).await.unwrap();

  let mut methods = Vec::new();
  while !methods.contains(&"new-blockchain".to_owned())
    || !methods.contains(&"new-blockchain-verified".to_owned())
  {
    let event = tokio::time::timeout(
      std::time::Duration::from_secs(10),
      events.recv(),
    )
    .await
    .expect("timed out waiting for UI events")
    .expect("event stream closed");
    methods.push(event.method);
  }

  cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn topology_lists_identified_inbound_peers() {
  let cluster = TestCluster::start().await;

  let topology = cluster
    .admin_request("o", "query-topology", json!(null))
    .await
    .unwrap();
  let ids: Vec<String> = topology
    .as_array()
    .unwrap()
    .iter()
    .map(|id| id.as_str().unwrap().to_owned())
    .collect();
  assert!(ids.contains(&"e1".to_owned()));
  assert!(ids.contains(&"e2".to_owned()));
  assert!(ids.contains(&"admin".to_owned()));

  cluster.stop().await;
}
