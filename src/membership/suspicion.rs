//! Suspicion Scheduler
//!
//! One timer per SUSPECT member. Timers run as sleeping tokio tasks and report
//! expiry back over a channel, so the engine handles the promotion to DEAD on
//! its own loop together with every other update.
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Grace period before a SUSPECT member is declared DEAD.
///
/// `suspicion_mult * max(1, ceil(log2(cluster_size))) * ping_interval`
pub fn suspicion_timeout(
    suspicion_mult: u32,
    cluster_size: usize,
    ping_interval: Duration,
) -> Duration {
    let factor = ceil_log2(cluster_size).max(1);
    ping_interval.saturating_mul(suspicion_mult.saturating_mul(factor))
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Sent by a timer task when its deadline passes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuspicionExpired {
    pub member_id: String,
    pub task_id: u64,
}

#[derive(Debug)]
struct SuspicionTask {
    task_id: u64,
    timeout: Duration,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SuspicionScheduler {
    tasks: HashMap<String, SuspicionTask>,
    next_task_id: u64,
    expired_tx: mpsc::UnboundedSender<SuspicionExpired>,
}

impl SuspicionScheduler {
    pub fn new(expired_tx: mpsc::UnboundedSender<SuspicionExpired>) -> Self {
        Self {
            tasks: HashMap::new(),
            next_task_id: 0,
            expired_tx,
        }
    }

    /// Start a timer for the member unless one is already pending.
    /// Returns true if a new timer was started.
    pub fn schedule(&mut self, member_id: &str, timeout: Duration) -> bool {
        if self.tasks.contains_key(member_id) {
            return false;
        }
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let expired = SuspicionExpired {
            member_id: member_id.to_string(),
            task_id,
        };
        let expired_tx = self.expired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // the engine may already be gone
            let _ = expired_tx.send(expired);
        });
        debug!(
            "Scheduled suspicion timeout for {} in {}ms",
            member_id,
            timeout.as_millis()
        );
        self.tasks.insert(
            member_id.to_string(),
            SuspicionTask {
                task_id,
                timeout,
                handle,
            },
        );
        true
    }

    /// Abort the member's pending timer, if any
    pub fn cancel(&mut self, member_id: &str) -> bool {
        match self.tasks.remove(member_id) {
            Some(task) => {
                task.handle.abort();
                debug!("Cancelled suspicion timeout for {}", member_id);
                true
            }
            None => false,
        }
    }

    /// Claim an expiry notification. False means the timer was cancelled or
    /// replaced after it fired, and the notification must be ignored.
    pub fn expire(&mut self, expired: &SuspicionExpired) -> bool {
        match self.tasks.get(&expired.member_id) {
            Some(task) if task.task_id == expired.task_id => {
                self.tasks.remove(&expired.member_id);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
    }

    pub fn is_scheduled(&self, member_id: &str) -> bool {
        self.tasks.contains_key(member_id)
    }

    pub fn timeout_for(&self, member_id: &str) -> Option<Duration> {
        self.tasks.get(member_id).map(|task| task.timeout)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for SuspicionScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
