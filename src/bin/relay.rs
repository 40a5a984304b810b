use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use postoffice::config::{Cli, Config};
use postoffice::relay::{app, RelayState};
use postoffice::tlog;

#[tokio::main]
async fn main() {
    postoffice::logging::init();

    let config = match Config::from_cli_and_env(Cli::parse()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(2);
        }
    };

    let mut state = RelayState::new(config.relay_config());
    match config.payload_validator() {
        Ok(Some(validator)) => state = state.with_validator(validator),
        Ok(None) => {}
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(2);
        }
    }

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("error: failed to bind {}: {error}", config.bind_addr);
            std::process::exit(1);
        }
    };

    tlog!("postoffice relay listening on {}", config.bind_addr);
    tlog!("  max connections: {}", config.max_connections);
    tlog!("  queue capacity: {}", config.queue_capacity);
    match (&config.schema, config.validate_envelopes) {
        (Some(path), _) => tlog!("  frame validation: schema {}", path.display()),
        (None, true) => tlog!("  frame validation: envelope shape"),
        (None, false) => tlog!("  frame validation: off"),
    }

    let shutdown_state = state.clone();
    let drain_state = state.clone();
    let server = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tlog!("shutting down");
        shutdown_state.shutdown_all();
    });

    if let Err(error) = server.await {
        eprintln!("error: server failed: {error}");
        std::process::exit(1);
    }

    // Upgraded sockets outlive the HTTP server; let their teardowns finish.
    if !drain_state.drain(DRAIN_TIMEOUT).await {
        tlog!(
            "gave up waiting for {} connection(s) to close",
            drain_state.current_connection_count()
        );
    }
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tlog!("cannot listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tlog!("cannot listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
