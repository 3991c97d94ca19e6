use crate::config::SessionConfig;
use crate::engine::PtyEngine;
use crate::session::{SessionHandle, SessionIdentity};
use crate::terminal::cli::{Cli, Command, HostArgs, JoinArgs};
use crate::terminal::console::{self, StdoutDisplay};
use crate::terminal::error::CliError;
use crate::transport::PeerId;
use crate::transport::tcp::TcpProvider;
use std::sync::Arc;
use tracing::info;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.session.apply(SessionConfig::from_env());
    match cli.command {
        Command::Host(args) => host(config, args).await,
        Command::Join(args) => join(config, args).await,
    }
}

async fn host(config: SessionConfig, args: HostArgs) -> Result<(), CliError> {
    let provider = TcpProvider::new(args.listen).with_advertised_host(args.advertise);
    let handle = SessionHandle::spawn(
        config,
        Arc::new(provider),
        Arc::new(PtyEngine::new(args.command)),
        Arc::new(StdoutDisplay),
    );
    let identity = handle.ready().await?;
    print_banner(&identity, true);
    if !args.no_boot {
        handle.boot().await?;
    }
    let result = console::run(&handle).await;
    handle.dispose().await;
    result
}

async fn join(config: SessionConfig, args: JoinArgs) -> Result<(), CliError> {
    let handle = SessionHandle::spawn(
        config,
        Arc::new(TcpProvider::new(args.listen)),
        Arc::new(PtyEngine::new(Vec::new())),
        Arc::new(StdoutDisplay),
    );
    let identity = handle.ready().await?;
    print_banner(&identity, false);
    let target = PeerId::new(args.target.trim());
    info!(target: "ghost_lab::terminal", remote = %target, "joining host");
    if let Err(err) = handle.connect(target).await {
        handle.dispose().await;
        return Err(err.into());
    }
    let result = console::run(&handle).await;
    handle.dispose().await;
    result
}

fn print_banner(identity: &SessionIdentity, hosting: bool) {
    eprintln!("👻 ghost-lab :: {}", identity.codename);
    eprintln!("   identity: {}", identity.peer_id);
    if hosting {
        eprintln!("   share:    ghost-lab join {}", identity.peer_id);
    }
    eprintln!("   press Ctrl-] for commands (chat, fx, boot, status, log, close, quit)");
    eprintln!();
}
