//! Operational on/off switch for dispensing

use crate::error::{FaucetError, FaucetResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseState {
    #[default]
    Active,
    Paused,
}

/// Gates dispensing only; administrative operations ignore it.
#[derive(Debug, Clone, Default)]
pub struct PauseGuard {
    state: PauseState,
}

impl PauseGuard {
    pub fn new(paused: bool) -> Self {
        let state = if paused { PauseState::Paused } else { PauseState::Active };
        Self { state }
    }

    pub fn state(&self) -> PauseState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == PauseState::Paused
    }

    /// Active -> Paused.
    pub fn pause(&mut self) -> FaucetResult<()> {
        if self.is_paused() {
            return Err(FaucetError::AlreadyPaused);
        }
        self.state = PauseState::Paused;
        Ok(())
    }

    /// Paused -> Active.
    pub fn unpause(&mut self) -> FaucetResult<()> {
        if !self.is_paused() {
            return Err(FaucetError::NotPaused);
        }
        self.state = PauseState::Active;
        Ok(())
    }

    pub fn ensure_active(&self) -> FaucetResult<()> {
        if self.is_paused() {
            return Err(FaucetError::ServiceSuspended);
        }
        Ok(())
    }
}
