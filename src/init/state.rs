//! Init controller states.

use std::fmt;

use crate::shutdown::TerminalAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    MountVfs,
    LoadModules,
    SetupNetwork,
    ImportStorage,
    StartServices,
    Idle,
    ShuttingDown(TerminalAction),
    /// VFS mounts failed; only the console remains.
    Emergency,
}

impl InitState {
    /// Successor in the boot sequence. Idle, ShuttingDown and Emergency
    /// only change on events.
    pub fn next(self) -> Option<InitState> {
        match self {
            InitState::MountVfs => Some(InitState::LoadModules),
            InitState::LoadModules => Some(InitState::SetupNetwork),
            InitState::SetupNetwork => Some(InitState::ImportStorage),
            InitState::ImportStorage => Some(InitState::StartServices),
            InitState::StartServices => Some(InitState::Idle),
            InitState::Idle | InitState::ShuttingDown(_) | InitState::Emergency => None,
        }
    }

    /// Name recorded in the status file.
    pub fn name(self) -> &'static str {
        match self {
            InitState::MountVfs => "mount-vfs",
            InitState::LoadModules => "load-modules",
            InitState::SetupNetwork => "setup-network",
            InitState::ImportStorage => "import-storage",
            InitState::StartServices => "start-services",
            InitState::Idle => "idle",
            InitState::ShuttingDown(_) => "shutting-down",
            InitState::Emergency => "emergency",
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitState::ShuttingDown(action) => write!(f, "shutting-down ({})", action),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_reaches_idle() {
        let mut state = InitState::MountVfs;
        let mut seen = vec![state.name()];
        while let Some(next) = state.next() {
            state = next;
            seen.push(state.name());
        }
        assert_eq!(
            seen,
            [
                "mount-vfs",
                "load-modules",
                "setup-network",
                "import-storage",
                "start-services",
                "idle"
            ]
        );
        assert_eq!(
            InitState::ShuttingDown(TerminalAction::Halt).to_string(),
            "shutting-down (halt)"
        );
    }
}
