//! tlsrelay - TLS tunnel for plain TCP and UDP services.

use clap::Parser;
use tlsrelay::{
    run_client, run_server, BuildInfo, Cli, Command, ExitCode, Shutdown, TunnelConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
enum Role {
    Server,
    Client,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    let (role, config) = match cli.command {
        Command::Server(args) => {
            tracing::debug!(?args, "server arguments");
            (Role::Server, TunnelConfig::from_server_args(&args))
        }
        Command::Client(args) => {
            tracing::debug!(?args, "client arguments");
            (Role::Client, TunnelConfig::from_client_args(&args))
        }
        Command::Version => {
            println!("{}", BuildInfo::get().format());
            return;
        }
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, ?role, "invalid configuration");
            std::process::exit(e.exit_code().into());
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to create tokio runtime");
            std::process::exit(ExitCode::Failure.into());
        }
    };

    let result = runtime.block_on(async {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("received SIGINT, shutting down");
                    shutdown.trigger();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to listen for SIGINT");
                    std::future::pending::<()>().await;
                }
            }
        });

        match role {
            Role::Server => run_server(&config, signal).await,
            Role::Client => run_client(&config, signal).await,
        }
    });

    // In-flight sessions are not drained; dropping the runtime ends them.
    drop(runtime);

    if let Err(e) = result {
        tracing::error!(error = %e, ?role, "fatal error");
        std::process::exit(e.exit_code().into());
    }
}
