//! Host application state as reported by the embedding platform.

use serde::Deserialize;

/// Coarse activity state of the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Foreground and interactive.
    Active,
    /// Moved off-screen; the platform may reclaim resources at any time.
    Background,
    /// Foreground but not interactive, such as during a transition or an
    /// incoming call overlay. Often transient.
    Inactive,
}

impl HostState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Background => "background",
            Self::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
