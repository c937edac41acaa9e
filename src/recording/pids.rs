// src/recording/pids.rs
//! Pid selection reconciliation
//!
//! Turns a desired set of secondary pids into the minimal sequence of
//! remove/add calls against the source. The primary pid is fixed for the
//! session and never part of the diff.

use crate::source::{Pid, SourceReader};
use crate::utils::errors::Result;
use tracing::{debug, warn};

/// Calls needed to move from the current selection to the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidDiff {
    /// Selected now, not wanted
    pub remove: Vec<Pid>,

    /// Wanted, not selected yet
    pub add: Vec<Pid>,
}

impl PidDiff {
    /// Compute the diff between `current` secondary pids and `desired`
    ///
    /// `desired` may contain duplicates or the primary pid; both are ignored.
    pub fn between(current: &[Pid], desired: &[Pid], primary: Pid) -> Self {
        let mut wanted: Vec<Pid> = Vec::with_capacity(desired.len());
        for pid in desired {
            if *pid != primary && !wanted.contains(pid) {
                wanted.push(*pid);
            }
        }

        let remove = current
            .iter()
            .copied()
            .filter(|pid| *pid != primary && !wanted.contains(pid))
            .collect();
        let add = wanted
            .into_iter()
            .filter(|pid| !current.contains(pid))
            .collect();

        Self { remove, add }
    }

    /// True when the selection already matches
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Secondary pids of a source: its selection minus the leading primary pid
pub fn secondary_pids(source: &dyn SourceReader) -> Vec<Pid> {
    source.current_pids().into_iter().skip(1).collect()
}

/// Bring the source selection to `desired`
///
/// Every call is attempted; the first add failure is returned afterwards.
pub fn reconcile(source: &dyn SourceReader, primary: Pid, desired: &[Pid]) -> Result<PidDiff> {
    let diff = PidDiff::between(&secondary_pids(source), desired, primary);
    if diff.is_empty() {
        debug!("Pid selection unchanged");
        return Ok(diff);
    }

    for pid in &diff.remove {
        debug!("Removing pid 0x{:04x}", pid);
        source.remove_pid(*pid);
    }

    let mut first_error = None;
    for pid in &diff.add {
        debug!("Adding pid 0x{:04x}", pid);
        if let Err(e) = source.add_pid(*pid) {
            warn!("Failed to add pid 0x{:04x}: {}", pid, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(diff),
    }
}

/// Add `pid` unless it is already selected
///
/// Returns `true` if the source was changed.
pub fn ensure_pid(source: &dyn SourceReader, pid: Pid) -> Result<bool> {
    if source.current_pids().contains(&pid) {
        return Ok(false);
    }
    source.add_pid(pid)?;
    Ok(true)
}
