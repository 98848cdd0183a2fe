use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = demere_cli::Cli::parse();
    demere_cli::init_logging(cli.verbosity());
    demere_cli::run_cli(cli)
}
