//! Process stop requests.

use std::io::Read;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
const SIGABRT: i32 = 6;

/// Resolves on Ctrl+C, SIGTERM or SIGABRT
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = unix_signal(signal::unix::SignalKind::terminate(), "SIGTERM");
    #[cfg(unix)]
    let abort = unix_signal(signal::unix::SignalKind::from_raw(SIGABRT), "SIGABRT");

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let abort = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
        _ = abort => {
            info!("Received SIGABRT signal");
        }
    }
}

#[cfg(unix)]
async fn unix_signal(kind: signal::unix::SignalKind, name: &str) {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install {name} handler");
            std::future::pending::<()>().await;
        }
    }
}

/// Cancel `token` once stdin reaches end of file.
///
/// The orchestrator holds the write end of each shard's stdin and closes it
/// to ask the shard to stop. The reader runs on a detached thread so a
/// pending read never holds up process exit.
pub fn cancel_on_stdin_eof(token: CancellationToken) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 64];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            info!("Stop requested by orchestrator");
            token.cancel();
        })?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sigabrt_requests_shutdown() {
        // Keeps the default abort action away even if the listener under test misses it
        let _guard = signal::unix::signal(signal::unix::SignalKind::from_raw(SIGABRT)).unwrap();

        let stop = tokio::spawn(shutdown_signal());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = std::process::Command::new("kill")
            .args(["-s", "ABRT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), stop)
            .await
            .unwrap()
            .unwrap();
    }
}
