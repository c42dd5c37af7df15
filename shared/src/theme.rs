use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::capabilities::{ColorSchemeSignal, RootClassList};
use crate::model::{AppliedTheme, ThemePreference};

/// `dark` iff the preference is dark, or it is `system` and the OS prefers dark.
#[must_use]
pub fn resolve(preference: ThemePreference, prefers_dark: bool) -> AppliedTheme {
    match preference {
        ThemePreference::Dark => AppliedTheme::Dark,
        ThemePreference::System if prefers_dark => AppliedTheme::Dark,
        ThemePreference::Light | ThemePreference::System => AppliedTheme::Light,
    }
}

/// Puts exactly one theme class token on the document root.
#[derive(Clone)]
pub struct ThemeApplier {
    root: Arc<dyn RootClassList>,
    signal: Arc<dyn ColorSchemeSignal>,
}

impl ThemeApplier {
    pub fn new(root: Arc<dyn RootClassList>, signal: Arc<dyn ColorSchemeSignal>) -> Self {
        Self { root, signal }
    }

    pub fn apply(&self, preference: ThemePreference) -> AppliedTheme {
        let applied = resolve(preference, self.signal.prefers_dark());
        for theme in AppliedTheme::ALL {
            if theme != applied {
                self.root.remove_class(theme.class_name());
            }
        }
        self.root.add_class(applied.class_name());
        debug!(%preference, theme = applied.class_name(), "theme applied");
        applied
    }

    /// Theme currently on the root, if any.
    pub fn current(&self) -> Option<AppliedTheme> {
        AppliedTheme::ALL
            .into_iter()
            .find(|theme| self.root.has_class(theme.class_name()))
    }

    pub fn os_preference(&self) -> watch::Receiver<bool> {
        self.signal.watch()
    }
}
