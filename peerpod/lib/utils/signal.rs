use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::PeerpodResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Cancels `token` on the first SIGINT or SIGTERM.
///
/// The handlers are installed before returning, so a signal received afterwards is never missed.
pub fn cancel_on_signal(token: CancellationToken) -> PeerpodResult<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}
