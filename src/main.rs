use {
  anyhow::Context as _,
  clap::StructOpt,
  futures::future::join_all,
  palisade::{
    cli::{CliOpts, Command},
    client,
    config::{NetworkConfig, Role},
    endorser,
    node,
    orderer,
    router::Router,
  },
  std::sync::Arc,
  tracing::{info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  let config = NetworkConfig::load(&opts.config)
    .with_context(|| format!("loading {}", opts.config.display()))?;

  match opts.command {
    Command::Init => node::init_network(&config).await,
    Command::Start { node: Some(id) } => start_node(config, &id).await,
    Command::Start { node: None } => spawn_peers(&opts, &config).await,
  }
}

/// Runs one node in this process until it winds down on its own or
/// an interrupt asks it to.
async fn start_node(config: NetworkConfig, id: &str) -> anyhow::Result<()> {
  info!("starting node {id}");
  info!("version: {}", env!("CARGO_PKG_VERSION"));

  let router: Arc<Router> = if let Some(peer) = config.peer(id).cloned() {
    match peer.role {
      Role::Orderer => orderer::run(config, peer).await?,
      Role::Endorser => endorser::run(config, peer).await?,
      _ => anyhow::bail!("peer {id} has a client role"),
    }
  } else if let Some(entry) = config.client(id).cloned() {
    client::run(config, entry).await?.router
  } else {
    anyhow::bail!("no node {id:?} in the configuration");
  };

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {
      info!("{id}: interrupted, shutting down");
      router.shutdown();
    }
    _ = router.wait() => {}
  }
  router.wait().await;
  info!("{id}: stopped");
  Ok(())
}

/// `start` without `--node`: one child process per configured peer.
async fn spawn_peers(
  opts: &CliOpts,
  config: &NetworkConfig,
) -> anyhow::Result<()> {
  let exe = std::env::current_exe()?;
  let mut children = Vec::new();
  for peer in &config.peers {
    info!("spawning {}", peer.id);
    let child = tokio::process::Command::new(&exe)
      .arg("--config")
      .arg(&opts.config)
      .args(std::iter::repeat("-v").take(opts.verbose as usize))
      .arg("start")
      .arg("--node")
      .arg(&peer.id)
      .spawn()
      .with_context(|| format!("spawning {}", peer.id))?;
    children.push(child);
  }
  let statuses = join_all(children.iter_mut().map(|child| child.wait())).await;
  for status in statuses {
    let status = status?;
    if !status.success() {
      anyhow::bail!("a peer exited with {status}");
    }
  }
  Ok(())
}
