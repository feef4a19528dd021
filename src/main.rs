//! Bridge binary: stdin commands in, stdout events out, logs on stderr.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beam_bridge::protocol::{self, StdoutSink};
use beam_bridge::session::{NetConnector, SessionActor, SessionConfig};

#[tokio::main]
async fn main() {
    // Stdout carries protocol events only; everything else goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let storage_dir = prepare_storage_dir();

    let (command_tx, command_rx) = mpsc::channel(64);
    let sink = StdoutSink;
    let actor = SessionActor::new(
        NetConnector::new(storage_dir),
        command_rx,
        sink.clone(),
        SessionConfig::default(),
    );
    let session = tokio::spawn(actor.run());

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        () = protocol::pump_commands(stdin, command_tx, sink) => {
            tracing::info!("input closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
        () = terminate() => {
            tracing::info!("terminated, shutting down");
        }
    }

    // The command sender is dropped with the losing select branches, which
    // ends the actor loop and runs its teardown.
    let _ = tokio::time::timeout(Duration::from_secs(2), session).await;
}

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Resolve and create the document state directory. Persistence is simply
/// disabled when the platform has no data dir or creation fails.
fn prepare_storage_dir() -> Option<PathBuf> {
    let dir = dirs::data_local_dir()?.join("beam-bridge").join("doc-data");
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            tracing::warn!(?e, dir = %dir.display(), "failed to create storage directory");
            None
        }
    }
}
