//! Single background worker draining (message, plugin) tasks in order

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NotificationPlugin, PluginSnapshot, RetryPolicy};

struct NotificationTask {
    message: String,
    plugin: Arc<dyn NotificationPlugin>,
    reply: oneshot::Sender<bool>,
}

/// Resolves once the worker has finished every attempt for one plugin
pub struct DeliveryReceipt {
    plugin: String,
    rx: oneshot::Receiver<bool>,
}

impl DeliveryReceipt {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// False when delivery failed or the dispatcher shut down first
    pub async fn delivered(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

pub struct NotificationDispatcher {
    plugins: Mutex<BTreeMap<String, Arc<dyn NotificationPlugin>>>,
    enabled: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<NotificationTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Must be called inside a tokio runtime
    pub fn new(policy: RetryPolicy, enabled: bool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver, policy));

        Self {
            plugins: Mutex::new(BTreeMap::new()),
            enabled: AtomicBool::new(enabled),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn add_plugin(&self, plugin: Arc<dyn NotificationPlugin>) {
        let name = plugin.name().to_string();
        info!(plugin = %name, "Notification plugin registered");
        self.lock_plugins().insert(name, plugin);
    }

    pub fn remove_plugin(&self, name: &str) -> bool {
        self.lock_plugins().remove(name).is_some()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.lock_plugins().keys().cloned().collect()
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Notifications {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn notifications_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Queue the message for every plugin; nothing is queued while disabled
    pub fn send_batch_notifications(&self, message: &str) -> Vec<DeliveryReceipt> {
        if !self.notifications_enabled() {
            return Vec::new();
        }

        let plugins: Vec<_> = self.lock_plugins().values().cloned().collect();
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = sender.as_ref() else {
            warn!("Notification dropped: dispatcher stopped");
            return Vec::new();
        };

        plugins
            .into_iter()
            .map(|plugin| {
                let (reply, rx) = oneshot::channel();
                let name = plugin.name().to_string();
                if sender
                    .send(NotificationTask {
                        message: message.to_string(),
                        plugin,
                        reply,
                    })
                    .is_err()
                {
                    warn!(plugin = %name, "Notification dropped: worker gone");
                }
                DeliveryReceipt { plugin: name, rx }
            })
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<String, PluginSnapshot> {
        self.lock_plugins()
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.stats().snapshot()))
            .collect()
    }

    /// Close the queue and wait for queued deliveries to finish
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|p| p.into_inner()).take());
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Notification worker ended abnormally: {}", e);
            }
            info!("Notification dispatcher stopped");
        }
    }

    fn lock_plugins(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<dyn NotificationPlugin>>> {
        self.plugins.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<NotificationTask>, policy: RetryPolicy) {
    while let Some(task) = receiver.recv().await {
        let delivered = task.plugin.send_notification(&task.message, &policy).await;
        debug!(plugin = task.plugin.name(), delivered, "Notification processed");
        let _ = task.reply.send(delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{fast_policy, FlakyPlugin};

    #[tokio::test]
    async fn test_fans_out_to_every_plugin_in_order() {
        let dispatcher = NotificationDispatcher::new(fast_policy(), true);
        let ok = Arc::new(FlakyPlugin::new("ok", 0));
        let broken = Arc::new(FlakyPlugin::new("broken", u64::MAX));
        dispatcher.add_plugin(ok.clone());
        dispatcher.add_plugin(broken.clone());

        let first = dispatcher.send_batch_notifications("Processed 100 transactions");
        let second = dispatcher.send_batch_notifications("Processed 200 transactions");
        assert_eq!(first.len(), 2);

        let mut outcomes = Vec::new();
        for receipt in first.into_iter().chain(second) {
            outcomes.push((receipt.plugin().to_string(), receipt.delivered().await));
        }
        assert_eq!(outcomes.iter().filter(|(p, ok)| p == "ok" && *ok).count(), 2);
        assert_eq!(outcomes.iter().filter(|(p, ok)| p == "broken" && !*ok).count(), 2);

        assert_eq!(
            *ok.delivered.lock().unwrap(),
            vec!["Processed 100 transactions", "Processed 200 transactions"]
        );
        let stats = dispatcher.stats();
        assert_eq!(stats["ok"], PluginSnapshot { success: 2, failure: 0 });
        assert_eq!(stats["broken"], PluginSnapshot { success: 0, failure: 2 });
    }

    #[tokio::test]
    async fn test_disabled_short_circuits() {
        let dispatcher = NotificationDispatcher::new(fast_policy(), true);
        let plugin = Arc::new(FlakyPlugin::new("p", 0));
        dispatcher.add_plugin(plugin.clone());

        dispatcher.set_notifications_enabled(false);
        assert!(dispatcher.send_batch_notifications("quiet").is_empty());

        dispatcher.set_notifications_enabled(true);
        let receipts = dispatcher.send_batch_notifications("loud");
        assert_eq!(receipts.len(), 1);
        dispatcher.shutdown().await;

        assert_eq!(*plugin.delivered.lock().unwrap(), vec!["loud"]);
        assert!(dispatcher.send_batch_notifications("late").is_empty());
    }

    #[tokio::test]
    async fn test_remove_plugin() {
        let dispatcher = NotificationDispatcher::new(fast_policy(), true);
        dispatcher.add_plugin(Arc::new(FlakyPlugin::new("a", 0)));
        assert!(dispatcher.remove_plugin("a"));
        assert!(dispatcher.plugin_names().is_empty());
        assert!(dispatcher.send_batch_notifications("nobody").is_empty());
    }
}
