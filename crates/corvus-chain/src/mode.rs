//! Node operating mode.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Operating mode of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Starting up, chain not yet usable.
    Init,
    /// Caught up, producing and relaying normally.
    Normal,
    /// Catching up with the network.
    Sync,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Init => write!(f, "init"),
            Mode::Normal => write!(f, "normal"),
            Mode::Sync => write!(f, "sync"),
        }
    }
}

/// Holder for the node mode.
///
/// The synchronizer is the sole writer during its lifecycle; everyone
/// else reads.
#[derive(Debug)]
pub struct ModeCell {
    mode: RwLock<Mode>,
}

impl ModeCell {
    /// Create a cell starting in `mode`.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Replace the mode.
    pub fn set_mode(&self, mode: Mode) {
        *self.mode.write() = mode;
    }
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new(Mode::Init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_cell_transitions() {
        let cell = ModeCell::default();
        assert_eq!(cell.mode(), Mode::Init);

        cell.set_mode(Mode::Normal);
        assert_eq!(cell.mode(), Mode::Normal);

        cell.set_mode(Mode::Sync);
        assert_eq!(cell.mode(), Mode::Sync);
    }
}
