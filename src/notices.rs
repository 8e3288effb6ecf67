//! Non-blocking notices for the UI layer ("showing cached data" and the like).
//!
//! Notices are fanned out on a broadcast channel; nobody listening is fine.
//! Repeated identical warnings are throttled so an offline terminal does not
//! flood the UI every time a page mounts.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

const NOTICE_CHANNEL_CAPACITY: usize = 64;
const NOTICE_REPEAT_THROTTLE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncNotice {
    pub namespace: String,
    pub level: NoticeLevel,
    pub message: String,
    pub timestamp: String,
}

impl SyncNotice {
    pub fn new(namespace: &str, level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub struct NoticeBus {
    tx: broadcast::Sender<SyncNotice>,
    last_sent: Mutex<HashMap<(String, String), Instant>>,
    throttle: Duration,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBus {
    pub fn new() -> Self {
        Self::with_throttle(NOTICE_REPEAT_THROTTLE)
    }

    pub fn with_throttle(throttle: Duration) -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            tx,
            last_sent: Mutex::new(HashMap::new()),
            throttle,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.tx.subscribe()
    }

    /// Publish `notice`. Returns `false` when it was throttled.
    pub fn publish(&self, notice: SyncNotice) -> bool {
        if notice.level != NoticeLevel::Info && !self.should_emit(&notice) {
            trace!(namespace = %notice.namespace, "notice throttled");
            return false;
        }
        // Err only means no receivers.
        let _ = self.tx.send(notice);
        true
    }

    fn should_emit(&self, notice: &SyncNotice) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return true;
        };
        let key = (notice.namespace.clone(), notice.message.clone());
        match last_sent.get(&key) {
            Some(previous) if previous.elapsed() < self.throttle => false,
            _ => {
                last_sent.insert(key, Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_notices() {
        let bus = NoticeBus::new();
        let mut rx = bus.subscribe();
        assert!(bus.publish(SyncNotice::new("items", NoticeLevel::Info, "items updated")));
        let got = rx.recv().await.expect("notice");
        assert_eq!(got.namespace, "items");
        assert_eq!(got.level, NoticeLevel::Info);
    }

    #[test]
    fn repeated_warnings_are_throttled() {
        let bus = NoticeBus::new();
        let warn = || SyncNotice::new("stock", NoticeLevel::Warning, "offline");
        assert!(bus.publish(warn()));
        assert!(!bus.publish(warn()));
        // A different message for the same namespace still goes out.
        assert!(bus.publish(SyncNotice::new("stock", NoticeLevel::Warning, "other")));
    }

    #[test]
    fn zero_throttle_emits_everything() {
        let bus = NoticeBus::with_throttle(Duration::ZERO);
        let warn = || SyncNotice::new("stock", NoticeLevel::Warning, "offline");
        assert!(bus.publish(warn()));
        assert!(bus.publish(warn()));
    }

    #[test]
    fn info_is_never_throttled() {
        let bus = NoticeBus::new();
        let info = || SyncNotice::new("items", NoticeLevel::Info, "items updated");
        assert!(bus.publish(info()));
        assert!(bus.publish(info()));
    }
}
