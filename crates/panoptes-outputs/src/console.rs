//! Console adapter: one JSON line per record on stdout.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use panoptes_telemetry::ExtDataPoint;

pub(crate) async fn run(
    name: String,
    mut rx: mpsc::Receiver<ExtDataPoint>,
    cancel: CancellationToken,
) {
    let mut stdout = tokio::io::stdout();
    loop {
        let point = tokio::select! {
            () = cancel.cancelled() => break,
            point = rx.recv() => point,
        };
        let Some(point) = point else { break };

        match serde_json::to_vec(&point) {
            Ok(mut line) => {
                line.push(b'\n');
                if let Err(e) = stdout.write_all(&line).await {
                    warn!(adapter = %name, error = %e, "stdout write failed");
                }
            }
            Err(e) => debug!(adapter = %name, error = %e, "record not serializable, dropped"),
        }
    }
    let _ = stdout.flush().await;
    debug!(adapter = %name, "console adapter stopped");
}
