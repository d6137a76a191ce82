//! Failure detector driven by hand: callers decide who looks alive or suspect
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::member::{Member, MemberStatus};
use crate::transport::{FailureDetector, FailureDetectorEvent, LISTENER_CHANNEL_CAPACITY};

#[derive(Debug, Default)]
pub struct ManualFailureDetector {
    listeners: Mutex<Vec<mpsc::Sender<FailureDetectorEvent>>>,
}

impl ManualFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a liveness verdict to every listener
    pub async fn emit(&self, member: Member, status: MemberStatus) {
        let listeners: Vec<mpsc::Sender<FailureDetectorEvent>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|tx| !tx.is_closed());
            listeners.clone()
        };
        let event = FailureDetectorEvent::new(member, status);
        for tx in listeners {
            let _ = tx.send(event.clone()).await;
        }
    }
}

impl FailureDetector for ManualFailureDetector {
    fn listen(&self) -> mpsc::Receiver<FailureDetectorEvent> {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        self.listeners.lock().push(tx);
        rx
    }
}
