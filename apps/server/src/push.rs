//! Push-notification glue: receipts assembled by topics and the handler
//! seam the actual backends (FCM and friends) implement.
//!
//! Handlers are registered once at startup and injected through shared
//! state. Delivery into a handler is a non-blocking send; a congested
//! backend loses receipts rather than stalling a topic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use palaver_common::Uid;

/// Push action kinds.
pub const ACT_MSG: &str = "msg";
pub const ACT_SUB: &str = "sub";

/// A user targeted by a push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipient {
    /// Count of the user's sessions live when the packet was fanned out.
    pub delivered: usize,
    /// Devices the packet is known to have reached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    /// Unread count to include in the notification.
    pub unread: u64,
}

/// Content of the push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub what: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub silent: bool,
    pub topic: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, rename = "seq")]
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// The push payload plus every recipient, delivered or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub payload: Payload,
    pub to: HashMap<Uid, Recipient>,
}

/// A push backend. `sender` hands back the channel the registry writes
/// receipts into; the backend drains it at its own pace.
pub trait Handler: Send + Sync {
    fn is_ready(&self) -> bool;
    fn sender(&self) -> mpsc::Sender<Receipt>;
    fn stop(&self);
}

/// Registry of configured push handlers.
#[derive(Clone, Default)]
pub struct Push {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Push {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Hand a receipt to every ready handler without blocking. Full handler
    /// queues drop the receipt.
    pub fn push(&self, rcpt: Receipt) {
        for hnd in &self.handlers {
            if !hnd.is_ready() {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = hnd.sender().try_send(rcpt.clone()) {
                tracing::warn!(what = %rcpt.payload.what, "push handler queue full, receipt dropped");
            }
        }
    }

    pub fn stop_all(&self) {
        for hnd in &self.handlers {
            if hnd.is_ready() {
                hnd.stop();
            }
        }
    }
}

/// Built-in handler that logs receipts. Useful in development and as the
/// smallest possible backend example.
pub struct LogHandler {
    tx: mpsc::Sender<Receipt>,
}

impl LogHandler {
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Receipt>(32);
        tokio::spawn(async move {
            while let Some(rcpt) = rx.recv().await {
                tracing::info!(
                    what = %rcpt.payload.what,
                    topic = %rcpt.payload.topic,
                    seq = rcpt.payload.seq_id,
                    recipients = rcpt.to.len(),
                    "push receipt"
                );
            }
        });
        Arc::new(Self { tx })
    }
}

impl Handler for LogHandler {
    fn is_ready(&self) -> bool {
        true
    }

    fn sender(&self) -> mpsc::Sender<Receipt> {
        self.tx.clone()
    }

    fn stop(&self) {}
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Handler that parks received receipts for inspection.
    pub struct CaptureHandler {
        tx: mpsc::Sender<Receipt>,
        pub received: Arc<Mutex<Vec<Receipt>>>,
    }

    impl CaptureHandler {
        pub fn new(capacity: usize) -> Arc<Self> {
            let (tx, mut rx) = mpsc::channel::<Receipt>(capacity);
            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = received.clone();
            tokio::spawn(async move {
                while let Some(rcpt) = rx.recv().await {
                    sink.lock().push(rcpt);
                }
            });
            Arc::new(Self { tx, received })
        }
    }

    impl Handler for CaptureHandler {
        fn is_ready(&self) -> bool {
            true
        }

        fn sender(&self) -> mpsc::Sender<Receipt> {
            self.tx.clone()
        }

        fn stop(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CaptureHandler;
    use super::*;
    use crate::store::types::time_now;

    fn receipt(seq: u64) -> Receipt {
        let mut to = HashMap::new();
        to.insert(
            Uid(1),
            Recipient {
                delivered: 1,
                devices: vec!["dev1".into()],
                unread: 3,
            },
        );
        Receipt {
            payload: Payload {
                what: ACT_MSG.into(),
                silent: false,
                topic: "grpTest".into(),
                ts: time_now(),
                from: Uid(2).user_id(),
                seq_id: seq,
                content: None,
            },
            to,
        }
    }

    #[tokio::test]
    async fn receipts_reach_registered_handlers() {
        let mut push = Push::new();
        let capture = CaptureHandler::new(8);
        push.register(capture.clone());

        push.push(receipt(1));
        push.push(receipt(2));
        tokio::task::yield_now().await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let got = capture.received.lock();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload.seq_id, 1);
        assert_eq!(got[1].to[&Uid(1)].unread, 3);
    }

    #[tokio::test]
    async fn push_does_not_block_on_full_handler() {
        struct StuckHandler {
            tx: mpsc::Sender<Receipt>,
            // Receiver parked, never drained.
            _rx: Mutex<mpsc::Receiver<Receipt>>,
        }
        use parking_lot::Mutex;

        impl Handler for StuckHandler {
            fn is_ready(&self) -> bool {
                true
            }
            fn sender(&self) -> mpsc::Sender<Receipt> {
                self.tx.clone()
            }
            fn stop(&self) {}
        }

        let (tx, rx) = mpsc::channel(1);
        let mut push = Push::new();
        push.register(Arc::new(StuckHandler {
            tx,
            _rx: Mutex::new(rx),
        }));

        // Second receipt hits a full queue; the call must return regardless.
        push.push(receipt(1));
        push.push(receipt(2));
    }
}
