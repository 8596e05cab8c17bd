mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let global = &cli.global;
    match cli.command {
        Command::Key(args) => commands::keys::generate(&args, global),
        Command::Escape { key } => commands::keys::escape(&key, global),
        Command::Unescape { key } => commands::keys::unescape(&key, global),
        Command::Hash { file } => commands::json::hash(&file, global),
        Command::Diff(args) => commands::json::diff(&args, global),
        Command::Demo(args) => commands::demo::handle(args, global).await,
        Command::Config(args) => commands::config_cmd::handle(&args, global),
        Command::Completions { shell } => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "truss", &mut std::io::stdout());
            Ok(())
        }
    }
}
