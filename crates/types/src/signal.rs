//! Control signals and the reserved jump names that raise them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Jump name that stops the whole invocation.
pub const STOP_JUMP: &str = "_stop";
/// Jump name that breaks out of the nearest loop.
pub const BREAK_JUMP: &str = "_break";
/// Jump name that continues with the next iteration of the nearest loop.
pub const CONTINUE_JUMP: &str = "_continue";

/// Signal used to unwind out of nested step sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Stop,
    Break,
    Continue,
}

impl ControlSignal {
    /// Maps a reserved jump name to its signal; `None` for ordinary step names.
    pub fn from_jump_name(name: &str) -> Option<ControlSignal> {
        match name {
            STOP_JUMP => Some(ControlSignal::Stop),
            BREAK_JUMP => Some(ControlSignal::Break),
            CONTINUE_JUMP => Some(ControlSignal::Continue),
            _ => None,
        }
    }

    /// Break and continue only make sense inside a loop.
    pub fn requires_loop(self) -> bool {
        matches!(self, ControlSignal::Break | ControlSignal::Continue)
    }

    pub fn jump_name(self) -> &'static str {
        match self {
            ControlSignal::Stop => STOP_JUMP,
            ControlSignal::Break => BREAK_JUMP,
            ControlSignal::Continue => CONTINUE_JUMP,
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jump_name())
    }
}
