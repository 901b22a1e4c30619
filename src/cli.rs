use {
  clap::{Parser, Subcommand},
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(
    short,
    long,
    default_value = "./palisade.yaml",
    help = "network configuration file, in yaml format"
  )]
  pub config: PathBuf,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,

  #[clap(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Generate keypairs for every configured node and seed each
  /// peer's database with the genesis block.
  Init,

  /// Start one node by id, or every peer as a child process when no
  /// id is given.
  Start {
    #[clap(long, help = "id of the node to start")]
    node: Option<String>,
  },
}
