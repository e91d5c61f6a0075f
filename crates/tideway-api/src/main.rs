//! Tideway CLI and REST API entry point.
//!
//! Binary name: `tide`
//!
//! Parses CLI arguments, initializes storage and the engine, then dispatches
//! to the appropriate command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need logging or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tide", &mut std::io::stdout());
        return Ok(());
    }

    tideway_observe::tracing_setup::init_tracing(cli.log_filter(), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;
    let result = dispatch(cli, state).await;

    tideway_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, state: AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            file,
            input,
            input_file,
            org,
        } => {
            let input = cli::run::read_input(input.as_deref(), input_file.as_deref()).await?;
            cli::run::run_workflow(&state, &file, input, org, cli.json, cli.quiet).await?;
        }

        Commands::Validate { file, canonical } => {
            cli::run::validate_workflow(&state, &file, canonical, cli.json).await?;
        }

        Commands::Status { id, limit } => {
            cli::status::status(&state, id.as_deref(), limit, cli.json).await?;
        }

        Commands::Purge {
            kind,
            all,
            blobs,
            force,
        } => {
            cli::purge::purge(&state, kind.map(Into::into), all, blobs, force, cli.json).await?;
        }

        Commands::Serve { port, host } => {
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Tideway API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
