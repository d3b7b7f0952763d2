pub mod apply;
pub mod destroy;
pub mod graph;
pub mod output;
pub mod plan;
pub mod refresh;
pub mod state;
pub mod unlock;
pub mod validate;

use stackflow_engine::CancelHandle;
use tokio::task::JoinHandle;

/// Cancel `handle` on Ctrl-C. Running provider calls still finish.
pub(crate) fn cancel_on_ctrl_c(handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Interrupt received: waiting for running operations, starting no new ones...");
            tracing::warn!("Cancellation requested");
            handle.cancel();
        }
    })
}
