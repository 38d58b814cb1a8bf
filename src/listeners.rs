//! Feature-change listeners and the notification thread that invokes them.
//!
//! Callbacks are never run while engine locks are held: committed changes
//! are handed to a dedicated thread over a channel, which preserves commit
//! order per feature.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Opaque handle identifying a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

pub(crate) type FeatureCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_token: u64,
    by_feature: HashMap<String, Vec<(u64, FeatureCallback)>>,
}

/// Token-keyed registry of feature listeners, shared between the engine and
/// the notification thread.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    inner: Mutex<RegistryInner>,
}

impl ListenerRegistry {
    pub fn add(&self, feature: &str, callback: FeatureCallback) -> ListenerToken {
        let mut inner = self
            .inner
            .lock()
            .expect("thread holding listener lock should not panic");
        inner.next_token += 1;
        let token = inner.next_token;
        inner
            .by_feature
            .entry(feature.to_owned())
            .or_default()
            .push((token, callback));
        ListenerToken(token)
    }

    pub fn remove(&self, token: ListenerToken) {
        let mut inner = self
            .inner
            .lock()
            .expect("thread holding listener lock should not panic");
        for listeners in inner.by_feature.values_mut() {
            listeners.retain(|(id, _)| *id != token.0);
        }
    }

    pub fn remove_all(&self, feature: &str) {
        let mut inner = self
            .inner
            .lock()
            .expect("thread holding listener lock should not panic");
        inner.by_feature.remove(feature);
    }

    pub fn clear(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("thread holding listener lock should not panic");
        inner.by_feature.clear();
    }

    fn callbacks_for(&self, feature: &str) -> Vec<FeatureCallback> {
        let inner = self
            .inner
            .lock()
            .expect("thread holding listener lock should not panic");
        inner
            .by_feature
            .get(feature)
            .map(|listeners| listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

enum Message {
    Change { feature: String, value: Option<String> },
    Stop,
}

/// The notification context: a named thread draining committed changes in
/// FIFO order and invoking listener callbacks.
pub(crate) struct NotificationThread {
    sender: Sender<Message>,
    join_handle: Option<JoinHandle<()>>,
}

impl NotificationThread {
    pub fn start(registry: Arc<ListenerRegistry>) -> std::io::Result<NotificationThread> {
        let (sender, receiver) = channel::<Message>();
        let join_handle = std::thread::Builder::new()
            .name("flipkit-notify".to_owned())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Change { feature, value } => {
                            for callback in registry.callbacks_for(&feature) {
                                callback(&feature, value.as_deref());
                            }
                        }
                        Message::Stop => return,
                    }
                }
            })?;

        Ok(NotificationThread {
            sender,
            join_handle: Some(join_handle),
        })
    }

    /// A cloneable handle for publishing committed changes.
    pub fn publisher(&self) -> NotificationPublisher {
        NotificationPublisher {
            sender: self.sender.clone(),
        }
    }

    /// Stop the thread after delivering everything already queued.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(Message::Stop);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NotificationThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub(crate) struct NotificationPublisher {
    sender: Sender<Message>,
}

impl NotificationPublisher {
    pub fn publish(&self, changes: &[(String, Option<String>)]) {
        for (feature, value) in changes {
            // Send fails only after shutdown; changes are dropped then.
            let _ = self.sender.send(Message::Change {
                feature: feature.clone(),
                value: value.clone(),
            });
        }
    }
}
