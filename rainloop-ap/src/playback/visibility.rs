//! Host visibility tracking
//!
//! Hosts may suspend audio output while the application is hidden and not
//! resume it afterwards. On becoming visible again, a rotation that claims
//! to be playing but has no sounding unit must be restarted.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostVisibility {
    Visible,
    Hidden,
}

impl HostVisibility {
    pub fn from_visible(visible: bool) -> Self {
        if visible {
            HostVisibility::Visible
        } else {
            HostVisibility::Hidden
        }
    }
}

/// What the engine must do after a visibility change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Nothing,
    SelfHeal,
}

#[derive(Debug)]
pub struct VisibilityGuard {
    visibility: HostVisibility,
    hidden_since: Option<f64>,
    heals: u64,
}

impl Default for VisibilityGuard {
    fn default() -> Self {
        Self {
            visibility: HostVisibility::Visible,
            hidden_since: None,
            heals: 0,
        }
    }
}

impl VisibilityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visibility(&self) -> HostVisibility {
        self.visibility
    }

    /// Self-heals requested so far
    pub fn heals(&self) -> u64 {
        self.heals
    }

    /// Record a change. `sounding` is only evaluated when becoming visible
    /// while playing.
    pub fn on_change(
        &mut self,
        visibility: HostVisibility,
        now: f64,
        is_playing: bool,
        sounding: impl FnOnce() -> bool,
    ) -> GuardAction {
        let previous = self.visibility;
        self.visibility = visibility;

        match visibility {
            HostVisibility::Hidden => {
                if previous == HostVisibility::Visible {
                    self.hidden_since = Some(now);
                }
                debug!("Host hidden at {:.3}s", now);
                GuardAction::Nothing
            }
            HostVisibility::Visible => {
                let hidden_for = self.hidden_since.take().map(|t| now - t);
                if is_playing && !sounding() {
                    self.heals += 1;
                    warn!(
                        "Playing but silent after becoming visible (hidden for {}); self-healing",
                        hidden_for
                            .map(|s| format!("{:.1}s", s))
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                    GuardAction::SelfHeal
                } else {
                    GuardAction::Nothing
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_playback_heals() {
        let mut guard = VisibilityGuard::new();
        assert_eq!(guard.on_change(HostVisibility::Hidden, 1.0, true, || true), GuardAction::Nothing);
        assert_eq!(guard.visibility(), HostVisibility::Hidden);
        assert_eq!(
            guard.on_change(HostVisibility::Visible, 30.0, true, || false),
            GuardAction::SelfHeal
        );
        assert_eq!(guard.heals(), 1);
    }

    #[test]
    fn test_sounding_playback_left_alone() {
        let mut guard = VisibilityGuard::new();
        guard.on_change(HostVisibility::Hidden, 1.0, true, || true);
        assert_eq!(
            guard.on_change(HostVisibility::Visible, 2.0, true, || true),
            GuardAction::Nothing
        );
    }

    #[test]
    fn test_stopped_engine_never_heals() {
        let mut guard = VisibilityGuard::new();
        let action = guard.on_change(HostVisibility::Visible, 2.0, false, || {
            panic!("sounding check must not run while stopped")
        });
        assert_eq!(action, GuardAction::Nothing);
    }
}
