//! Type definitions for the tunnel module.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Value returned across the host boundary when bring-up fails.
pub const FAILURE_SENTINEL: i32 = -1;

/// Opaque identifier of a live tunnel. Always non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelHandle(i32);

impl TunnelHandle {
    /// Interpret a raw value received from the host. Negative values never
    /// name a tunnel.
    pub fn from_raw(raw: i32) -> Option<Self> {
        (raw >= 0).then_some(TunnelHandle(raw))
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub(crate) fn new_unchecked(raw: i32) -> Self {
        debug_assert!(raw >= 0);
        TunnelHandle(raw)
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one tunnel as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Device bring-up in progress; no handle exists yet
    Starting,
    /// Handle valid, acceptor running
    Live,
    /// Removed from the table, resources being released
    TornDown,
}

/// State of a control-connection acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    /// Accepting connections
    Running,
    /// Told to stop, loop not yet exited
    Stopping,
    /// Loop exited and listener dropped
    Stopped,
}

impl AcceptorState {
    fn to_u8(self) -> u8 {
        match self {
            AcceptorState::Running => 0,
            AcceptorState::Stopping => 1,
            AcceptorState::Stopped => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => AcceptorState::Running,
            1 => AcceptorState::Stopping,
            _ => AcceptorState::Stopped,
        }
    }
}

/// Acceptor state shared between the loop and its owner.
#[derive(Debug, Clone)]
pub struct SharedAcceptorState(Arc<AtomicU8>);

impl SharedAcceptorState {
    pub fn new() -> Self {
        SharedAcceptorState(Arc::new(AtomicU8::new(AcceptorState::Running.to_u8())))
    }

    pub fn get(&self) -> AcceptorState {
        AcceptorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: AcceptorState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

impl Default for SharedAcceptorState {
    fn default() -> Self {
        Self::new()
    }
}
