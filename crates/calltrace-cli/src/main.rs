use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = calltrace_cli::Cli::parse();
    calltrace_cli::init_logging(&cli.log_config())?;
    calltrace_cli::run_cli(cli)
}
