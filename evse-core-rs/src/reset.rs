//! Reset requested by the central system
//!
//! An accepted Reset ends every session first. The host's execute hook runs
//! once no transaction is left to stop, or when the grace period runs out.

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::TimeMs;
use crate::ocpp::ResetType;

/// Asked before a reset is accepted; false refuses it
pub type ResetNotify = Box<dyn FnMut(ResetType) -> bool>;

/// Performs the reset; expected not to return on real hardware
pub type ResetExecute = Box<dyn FnMut(ResetType)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingReset {
    kind: ResetType,
    since: TimeMs,
}

#[derive(Default)]
pub struct ResetService {
    notify: Option<ResetNotify>,
    execute: Option<ResetExecute>,
    pending: Option<PendingReset>,
}

impl ResetService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_notify(&mut self, notify: Option<ResetNotify>) {
        self.notify = notify;
    }

    pub fn set_execute(&mut self, execute: Option<ResetExecute>) {
        self.execute = execute;
    }

    /// Accepted reset waiting to be executed
    pub fn pending(&self) -> Option<ResetType> {
        self.pending.map(|pending| pending.kind)
    }

    /// Decide on a Reset request; an accepted one is executed by [`poll`](Self::poll)
    pub(crate) fn accept(&mut self, kind: ResetType, now: TimeMs) -> bool {
        if self.execute.is_none() {
            warn!("Reset: No execute hook, {:?} reset rejected", kind);
            return false;
        }
        if let Some(notify) = self.notify.as_mut() {
            if !notify(kind) {
                info!("Reset: {:?} reset refused by host", kind);
                return false;
            }
        }

        info!("Reset: {:?} reset accepted", kind);
        self.pending = Some(PendingReset { kind, since: now });
        true
    }

    /// Execute the pending reset once `settled` or after `grace`
    pub(crate) fn poll(&mut self, settled: bool, now: TimeMs, grace: Duration) {
        let Some(pending) = self.pending else {
            return;
        };

        let waited = now.saturating_sub(pending.since);
        if !settled && u128::from(waited) < grace.as_millis() {
            return;
        }
        if !settled {
            warn!("Reset: Transactions still open after {}ms", waited);
        }

        self.pending = None;
        if let Some(execute) = self.execute.as_mut() {
            info!("Reset: Executing {:?} reset", pending.kind);
            execute(pending.kind);
        }
    }
}

impl fmt::Debug for ResetService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetService")
            .field("notify", &self.notify.is_some())
            .field("execute", &self.execute.is_some())
            .field("pending", &self.pending)
            .finish()
    }
}
