//! Merge per-watcher event channels into the applier's single input

use tokio::sync::mpsc;
use tracing::debug;

/// Forward every item from `inputs` into one receiver.
///
/// Items from the same input keep their order; items from different inputs
/// interleave in arrival order. The returned receiver closes once every
/// input has closed.
pub fn fan_in<T>(inputs: Vec<mpsc::Receiver<T>>, capacity: usize) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    for (slot, mut input) in inputs.into_iter().enumerate() {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    debug!("Fan-in output closed; dropping input {}", slot);
                    return;
                }
            }
            debug!("Fan-in input {} closed", slot);
        });
    }

    rx
}
