use clap::Parser;
use ghost_lab::telemetry::logging;
use ghost_lab::terminal::{app, cli::Cli, error::CliError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.logging.to_config()) {
        exit_with(CliError::Logging(err.to_string()));
    }
    match app::run(cli).await {
        // stdin may still be parked in a blocking read; don't wait for it
        Ok(()) => std::process::exit(0),
        Err(err) => exit_with(err),
    }
}

fn exit_with(err: CliError) -> ! {
    eprintln!("❌ {err}");
    std::process::exit(1);
}
