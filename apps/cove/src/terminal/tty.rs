//! Terminal save/restore for the supervisor. The state is captured once
//! before the first activation and restored after every departure from the
//! running state: the remote exec puts the shared tty into raw mode, and a
//! reconnect returns control to this process momentarily.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use crossterm::{cursor, execute};
use std::io;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct TerminalState {
    was_raw: bool,
}

impl TerminalState {
    pub fn save() -> io::Result<Self> {
        let was_raw = is_raw_mode_enabled().unwrap_or(false);
        Ok(Self { was_raw })
    }

    /// Puts the terminal back into the captured mode, whichever direction
    /// that is. Safe to call repeatedly.
    pub fn restore(&self) {
        let result = if self.was_raw {
            enable_raw_mode()
        } else {
            disable_raw_mode()
        };
        if let Err(err) = result {
            debug!(error = %err, "failed to restore terminal");
        }
        let _ = execute!(io::stdout(), cursor::Show);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_restore_are_safe_without_a_tty() {
        let state = TerminalState::save().unwrap();
        state.restore();
        state.restore();
    }
}
