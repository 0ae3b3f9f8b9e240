//! Operator interrupt detection.

use tracing::info;

/// Resolve when the process receives SIGINT or SIGTERM (Ctrl+C on Windows).
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping the loop");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, stopping the loop");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, stopping the loop");
    }

    Ok(())
}
