//! Entry-point for the `runq` binary.

use clap::Parser;
use runq_cli::Cli;
use runq_cli::run_main;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let exit_code = runtime.block_on(run_main(cli))?;
    std::process::exit(exit_code);
}
