//! OS colour-scheme signal and the document root's class list.

use std::collections::BTreeSet;
use std::sync::Mutex;
use tokio::sync::watch;

pub trait ColorSchemeSignal: Send + Sync {
    fn prefers_dark(&self) -> bool;

    /// Receiver that observes every change of the OS preference.
    fn watch(&self) -> watch::Receiver<bool>;
}

pub trait RootClassList: Send + Sync {
    fn add_class(&self, token: &str);
    fn remove_class(&self, token: &str);
    fn has_class(&self, token: &str) -> bool;
}

/// Settable colour-scheme signal for headless runs.
#[derive(Debug)]
pub struct ManualColorScheme {
    tx: watch::Sender<bool>,
}

impl ManualColorScheme {
    pub fn new(prefers_dark: bool) -> Self {
        let (tx, _rx) = watch::channel(prefers_dark);
        Self { tx }
    }

    pub fn set_prefers_dark(&self, prefers_dark: bool) {
        self.tx.send_if_modified(|current| {
            if *current == prefers_dark {
                return false;
            }
            *current = prefers_dark;
            true
        });
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ColorSchemeSignal for ManualColorScheme {
    fn prefers_dark(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Default)]
pub struct MemoryClassList {
    tokens: Mutex<BTreeSet<String>>,
}

impl MemoryClassList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RootClassList for MemoryClassList {
    fn add_class(&self, token: &str) {
        self.lock().insert(token.to_string());
    }

    fn remove_class(&self, token: &str) {
        self.lock().remove(token);
    }

    fn has_class(&self, token: &str) -> bool {
        self.lock().contains(token)
    }
}
