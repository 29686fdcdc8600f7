//! Notification fan-out. A [`NotificationManager`] holds a sequence of
//! adapters and fans a [`Notification`] out to all of them on a best-effort
//! basis (never propagating a single adapter's failure upward), plus a
//! per-question reminder timer that re-sends until cancelled.
//!
//! Console and desktop-OS toast are the two shipped adapters; webhook/chat
//! adapters are out of scope beyond this module's loading contract.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const DEFAULT_REMINDER_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self) -> anyhow::Result<()>;
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Logs notifications at `info` instead of touching any external channel.
pub struct ConsoleAdapter;

#[async_trait]
impl NotificationAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        "console"
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(title = %notification.title, body = %notification.body, "notification");
        Ok(())
    }

    async fn close(&self) {}
}

/// Desktop OS toast via `notify-rust`. `Notification::show()` is synchronous,
/// so the send runs on a blocking thread to avoid stalling the runtime.
pub struct DesktopAdapter;

#[async_trait]
impl NotificationAdapter for DesktopAdapter {
    fn name(&self) -> &str {
        "system"
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let title = notification.title.clone();
        let body = notification.body.clone();
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
        })
        .await
        .map_err(|e| anyhow::anyhow!("desktop notification task panicked: {e}"))?
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("desktop notification failed: {e}"))
    }

    async fn close(&self) {}
}

pub struct NotificationManager {
    adapters: Mutex<Vec<Arc<dyn NotificationAdapter>>>,
    reminders: Mutex<HashMap<String, JoinHandle<()>>>,
    reminder_interval: Duration,
}

impl NotificationManager {
    pub fn new(adapters: Vec<Arc<dyn NotificationAdapter>>) -> Self {
        Self {
            adapters: Mutex::new(adapters),
            reminders: Mutex::new(HashMap::new()),
            reminder_interval: DEFAULT_REMINDER_INTERVAL,
        }
    }

    pub fn with_reminder_interval(mut self, interval: Duration) -> Self {
        self.reminder_interval = interval;
        self
    }

    /// Initializes every adapter in parallel; any that fail are dropped and
    /// a warning is logged. Never returns an error itself.
    pub async fn init(&self) {
        let mut adapters = self.adapters.lock().await;
        let snapshot = adapters.clone();
        let results = futures::future::join_all(
            snapshot.iter().map(|a| async { (a.name().to_string(), a.init().await) }),
        )
        .await;

        let mut surviving = Vec::with_capacity(snapshot.len());
        for (adapter, (name, result)) in snapshot.into_iter().zip(results) {
            match result {
                Ok(()) => surviving.push(adapter),
                Err(err) => tracing::warn!(adapter = %name, error = %err, "notification adapter failed to init, dropping"),
            }
        }
        *adapters = surviving;
    }

    /// Fans `notification` out to every surviving adapter in parallel.
    /// Individual failures are logged, never propagated.
    pub async fn notify(&self, notification: Notification) {
        let adapters = self.adapters.lock().await.clone();
        let notification = Arc::new(notification);
        futures::future::join_all(adapters.iter().map(|adapter| {
            let notification = notification.clone();
            async move {
                if let Err(err) = adapter.send(&notification).await {
                    tracing::warn!(adapter = adapter.name(), error = %err, "notification send failed");
                }
            }
        }))
        .await;
    }

    /// Sends `notification` now, then again every `reminder_interval` until
    /// [`NotificationManager::cancel_reminder`] is called for `id`.
    pub async fn notify_with_reminder(self: &Arc<Self>, id: impl Into<String>, notification: Notification) {
        let id = id.into();
        self.notify(notification.clone()).await;

        let manager = self.clone();
        let interval = self.reminder_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                manager.notify(notification.clone()).await;
            }
        });

        let mut reminders = self.reminders.lock().await;
        if let Some(old) = reminders.insert(id, handle) {
            old.abort();
        }
    }

    pub async fn cancel_reminder(&self, id: &str) {
        if let Some(handle) = self.reminders.lock().await.remove(id) {
            handle.abort();
        }
    }

    /// Cancels every outstanding reminder, then closes every adapter.
    pub async fn close(&self) {
        let mut reminders = self.reminders.lock().await;
        for (_, handle) in reminders.drain() {
            handle.abort();
        }
        drop(reminders);

        let adapters = self.adapters.lock().await.clone();
        futures::future::join_all(adapters.iter().map(|a| a.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingAdapter {
        name: &'static str,
        fail_init: bool,
        sent: Arc<TokioMutex<Vec<Notification>>>,
    }

    #[async_trait]
    impl NotificationAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            self.name
        }

        async fn init(&self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
            self.sent.lock().await.push(notification.clone());
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn init_drops_adapters_that_fail() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let good = Arc::new(RecordingAdapter {
            name: "good",
            fail_init: false,
            sent: sent.clone(),
        });
        let bad = Arc::new(RecordingAdapter {
            name: "bad",
            fail_init: true,
            sent: sent.clone(),
        });
        let manager = NotificationManager::new(vec![good, bad]);
        manager.init().await;
        manager.notify(Notification::new("t", "b")).await;
        assert_eq!(sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn notify_fans_out_to_all_adapters() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let a1 = Arc::new(RecordingAdapter {
            name: "a1",
            fail_init: false,
            sent: sent.clone(),
        });
        let a2 = Arc::new(RecordingAdapter {
            name: "a2",
            fail_init: false,
            sent: sent.clone(),
        });
        let manager = NotificationManager::new(vec![a1, a2]);
        manager.notify(Notification::new("t", "b")).await;
        assert_eq!(sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_reminder_stops_future_resends() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let adapter = Arc::new(RecordingAdapter {
            name: "a",
            fail_init: false,
            sent: sent.clone(),
        });
        let manager = Arc::new(
            NotificationManager::new(vec![adapter]).with_reminder_interval(Duration::from_millis(20)),
        );
        manager
            .notify_with_reminder("q1", Notification::new("t", "b"))
            .await;
        assert_eq!(sent.lock().await.len(), 1);
        manager.cancel_reminder("q1").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // No further resends after cancellation.
        assert_eq!(sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn close_aborts_reminders_and_closes_adapters() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let adapter = Arc::new(RecordingAdapter {
            name: "a",
            fail_init: false,
            sent: sent.clone(),
        });
        let manager = Arc::new(
            NotificationManager::new(vec![adapter]).with_reminder_interval(Duration::from_millis(15)),
        );
        manager
            .notify_with_reminder("q1", Notification::new("t", "b"))
            .await;
        manager.close().await;
        let before = sent.lock().await.len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sent.lock().await.len(), before);
    }
}
