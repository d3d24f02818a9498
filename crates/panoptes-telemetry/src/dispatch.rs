//! The bounded dispatch channel between decoders and output adapters.
//!
//! Producers never block: a full channel drops the sample and bumps
//! the per-sensor drop counter. Loss under sustained overrun is the
//! documented trade for backpressure-free decoders.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::datapoint::ExtDataPoint;
use crate::metrics::metrics;

/// Creates a dispatch channel with the given capacity.
///
/// Capacity is fixed for the channel's lifetime.
#[must_use]
pub fn channel(capacity: usize) -> (DispatchSender, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchSender { tx }, DispatchReceiver { rx })
}

/// Producer half, cloned into every device worker.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::Sender<ExtDataPoint>,
}

impl DispatchSender {
    /// Non-blocking send. Returns `false` when the sample was dropped
    /// (channel full) or the consumer side is gone.
    pub fn send(&self, sensor: &str, point: ExtDataPoint) -> bool {
        match self.tx.try_send(point) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics().drops_total.with_label_values(&[sensor]).inc();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sensor, "dispatch channel closed, sample discarded");
                false
            }
        }
    }

    /// Remaining capacity, for status reporting.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, drained by the output demux.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::Receiver<ExtDataPoint>,
}

impl DispatchReceiver {
    /// Receives the next data point; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ExtDataPoint> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::{DataPoint, FieldValue};
    use std::collections::BTreeMap;

    fn point(n: i64) -> ExtDataPoint {
        ExtDataPoint {
            output: "console::stdout".into(),
            ds: DataPoint {
                system_id: "127.0.0.1".into(),
                timestamp: n,
                prefix: "/interfaces".into(),
                labels: BTreeMap::new(),
                key: "out-octets".into(),
                value: FieldValue::Int(n),
            },
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let (tx, mut rx) = channel(4);
        assert!(tx.send("sensor1", point(1)));
        assert!(tx.send("sensor1", point(2)));

        assert_eq!(rx.recv().await.unwrap().ds.timestamp, 1);
        assert_eq!(rx.recv().await.unwrap().ds.timestamp, 2);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (tx, mut rx) = channel(1);
        let sensor = "overrun-sensor";
        let before = metrics().drops_total.with_label_values(&[sensor]).get();

        assert!(tx.send(sensor, point(1)));
        // Channel is full: sends keep returning immediately and count
        // drops, the producer never stalls.
        for n in 2..=10 {
            assert!(!tx.send(sensor, point(n)));
        }
        let after = metrics().drops_total.with_label_values(&[sensor]).get();
        assert_eq!(after - before, 9);

        // Only the first sample landed.
        assert_eq!(rx.recv().await.unwrap().ds.timestamp, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_count_drops() {
        let (tx, rx) = channel(1);
        drop(rx);
        let sensor = "closed-sensor";
        let before = metrics().drops_total.with_label_values(&[sensor]).get();
        assert!(!tx.send(sensor, point(1)));
        assert_eq!(metrics().drops_total.with_label_values(&[sensor]).get(), before);
    }
}
