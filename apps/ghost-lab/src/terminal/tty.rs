use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::warn;

/// Keeps the controlling terminal in raw mode while alive.
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if !enable {
            return Self(false);
        }
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(err) => {
                warn!(target: "ghost_lab::terminal", error = %err, "failed to enable raw mode");
                Self(false)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}
