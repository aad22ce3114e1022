//! Process table and lifecycle transitions.
//!
//! Implements the process state machine:
//! CREATED → READY → ACTIVE ⇄ SUSPENDED → TERMINATED
//!
//! NOT a separate actor - owned by the Supervisor behind its table lock and
//! called via &mut self.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, ProcessId, Result};

pub use super::types::{ProcessRecord, ProcessRole, ProcessState, ResourceUsage};

/// Process table - the supervisor's record of every process it created.
#[derive(Debug, Default)]
pub struct ProcessTable {
    pub(crate) processes: HashMap<ProcessId, ProcessRecord>,
    warm: HashMap<ProcessRole, VecDeque<ProcessId>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record.
    pub fn insert(&mut self, record: ProcessRecord) -> Result<()> {
        if self.processes.contains_key(&record.pid) {
            return Err(Error::state_transition(format!(
                "pid {} already exists",
                record.pid
            )));
        }
        self.processes.insert(record.pid, record);
        Ok(())
    }

    fn transition(
        &mut self,
        pid: ProcessId,
        op: &str,
        expected: ProcessState,
        to: ProcessState,
    ) -> Result<&mut ProcessRecord> {
        let record = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;

        if record.state != expected || !record.state.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "cannot {} pid {}: state is {:?}, expected {:?}",
                op, pid, record.state, expected
            )));
        }

        record.state = to;
        Ok(record)
    }

    /// Process acknowledged initialization.
    pub fn mark_ready(&mut self, pid: ProcessId) -> Result<&mut ProcessRecord> {
        let record = self.transition(pid, "mark ready", ProcessState::Created, ProcessState::Ready)?;
        record.last_heartbeat = Instant::now();
        Ok(record)
    }

    pub fn activate(&mut self, pid: ProcessId) -> Result<()> {
        self.transition(pid, "activate", ProcessState::Ready, ProcessState::Active)
            .map(|_| ())
    }

    pub fn suspend(&mut self, pid: ProcessId) -> Result<()> {
        self.transition(pid, "suspend", ProcessState::Active, ProcessState::Suspended)
            .map(|_| ())
    }

    pub fn resume(&mut self, pid: ProcessId) -> Result<()> {
        self.transition(pid, "resume", ProcessState::Suspended, ProcessState::Active)
            .map(|_| ())
    }

    /// Move to Terminated.
    ///
    /// Returns `Ok(Some(record))` for the caller that performed the transition
    /// and `Ok(None)` when the process was already terminated.
    pub fn terminate(
        &mut self,
        pid: ProcessId,
        crash_reason: Option<String>,
    ) -> Result<Option<ProcessRecord>> {
        let record = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;

        if record.state.is_terminal() {
            return Ok(None);
        }

        record.state = ProcessState::Terminated;
        record.terminated_at = Some(Utc::now());
        record.crash_reason = crash_reason;
        if let Some(queue) = self.warm.get_mut(&record.role) {
            queue.retain(|p| *p != pid);
        }
        Ok(Some(record.clone()))
    }

    /// Record a health report. Terminated processes are rejected.
    pub fn record_heartbeat(
        &mut self,
        pid: ProcessId,
        usage: ResourceUsage,
    ) -> Result<&mut ProcessRecord> {
        let record = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;

        if record.state.is_terminal() {
            return Err(Error::RecipientGone(format!("pid {} is terminated", pid)));
        }

        record.usage = usage;
        record.last_heartbeat = Instant::now();
        Ok(record)
    }

    /// Park a process in its role's warm pool.
    pub fn park_warm(&mut self, pid: ProcessId) -> Result<()> {
        let role = self
            .processes
            .get(&pid)
            .map(|r| r.role)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        self.warm.entry(role).or_default().push_back(pid);
        Ok(())
    }

    /// Take the oldest Ready process from the role's warm pool.
    ///
    /// Pooled processes that have not yet reported ready stay queued.
    pub fn take_warm(&mut self, role: ProcessRole) -> Option<ProcessId> {
        let queue = self.warm.get_mut(&role)?;
        let processes = &self.processes;
        let idx = queue.iter().position(|pid| {
            processes
                .get(pid)
                .map_or(false, |r| r.state == ProcessState::Ready)
        })?;
        queue.remove(idx)
    }

    /// Number of processes parked for a role (ready or not).
    pub fn warm_count(&self, role: ProcessRole) -> usize {
        self.warm.get(&role).map_or(0, VecDeque::len)
    }

    pub fn is_warm(&self, pid: ProcessId) -> bool {
        self.warm.values().any(|q| q.contains(&pid))
    }

    /// Non-terminated processes silent for longer than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<ProcessId> {
        let mut stale: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|r| !r.state.is_terminal() && r.role != ProcessRole::Host)
            .filter(|r| now.saturating_duration_since(r.last_heartbeat) > timeout)
            .map(|r| r.pid)
            .collect();
        stale.sort();
        stale
    }

    /// Live processes of a role, ascending pid.
    pub fn live_of_role(&self, role: ProcessRole) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self
            .processes
            .values()
            .filter(|r| r.role == role && r.state.is_live())
            .map(|r| r.pid)
            .collect();
        pids.sort();
        pids
    }

    /// Drop terminated records older than `retention`.
    /// Returns the purged ids.
    pub fn purge_terminated(&mut self, retention: Duration) -> Vec<ProcessId> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut purged = Vec::new();
        self.processes.retain(|pid, r| match r.terminated_at {
            Some(at) if now.signed_duration_since(at) >= retention => {
                purged.push(*pid);
                false
            }
            _ => true,
        });
        purged.sort();
        purged
    }

    /// Get process by PID.
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    /// Get mutable process by PID.
    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut ProcessRecord> {
        self.processes.get_mut(&pid)
    }

    /// List all processes, ascending pid.
    pub fn list(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self.processes.values().cloned().collect();
        records.sort_by_key(|r| r.pid);
        records
    }

    /// List processes by state.
    pub fn list_by_state(&self, state: ProcessState) -> Vec<ProcessRecord> {
        self.processes
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    /// Count processes.
    pub fn count(&self) -> usize {
        self.processes.len()
    }

    /// Count processes by state.
    pub fn count_by_state(&self, state: ProcessState) -> usize {
        self.processes.values().filter(|r| r.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(pid: u64, role: ProcessRole) -> ProcessTable {
        let mut table = ProcessTable::new();
        table
            .insert(ProcessRecord::new(ProcessId::new(pid), role, None))
            .unwrap();
        table
    }

    #[test]
    fn test_state_transitions() {
        let pid = ProcessId::new(1);
        let mut table = table_with(1, ProcessRole::Renderer);
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Created);

        table.mark_ready(pid).unwrap();
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Ready);

        table.activate(pid).unwrap();
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Active);

        table.suspend(pid).unwrap();
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Suspended);

        table.resume(pid).unwrap();
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Active);

        assert!(table.terminate(pid, None).unwrap().is_some());
        assert_eq!(table.get(pid).unwrap().state, ProcessState::Terminated);
        assert!(table.get(pid).unwrap().terminated_at.is_some());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let pid = ProcessId::new(1);
        let mut table = table_with(1, ProcessRole::Renderer);

        let err = table.activate(pid).unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
        assert!(err.to_string().contains("expected Ready"));

        table.terminate(pid, None).unwrap();
        assert!(table.mark_ready(pid).is_err());
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let pid = ProcessId::new(1);
        let mut table = table_with(1, ProcessRole::Graphics);

        let first = table.terminate(pid, Some("gpu hang".into())).unwrap();
        assert_eq!(first.unwrap().crash_reason.as_deref(), Some("gpu hang"));
        assert!(table.terminate(pid, Some("again".into())).unwrap().is_none());
        assert_eq!(
            table.get(pid).unwrap().crash_reason.as_deref(),
            Some("gpu hang")
        );
    }

    #[test]
    fn test_unknown_pid() {
        let mut table = ProcessTable::new();
        assert!(matches!(
            table.mark_ready(ProcessId::new(9)).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_heartbeat_rejected_after_termination() {
        let pid = ProcessId::new(1);
        let mut table = table_with(1, ProcessRole::Utility);
        table.terminate(pid, None).unwrap();
        let err = table
            .record_heartbeat(pid, ResourceUsage::default())
            .unwrap_err();
        assert!(matches!(err, Error::RecipientGone(_)));
    }

    #[test]
    fn test_warm_pool_skips_unready() {
        let mut table = ProcessTable::new();
        for raw in 1..=2 {
            let pid = ProcessId::new(raw);
            table
                .insert(ProcessRecord::new(pid, ProcessRole::Renderer, None))
                .unwrap();
            table.park_warm(pid).unwrap();
        }
        assert_eq!(table.take_warm(ProcessRole::Renderer), None);

        table.mark_ready(ProcessId::new(2)).unwrap();
        assert_eq!(
            table.take_warm(ProcessRole::Renderer),
            Some(ProcessId::new(2))
        );
        assert_eq!(table.warm_count(ProcessRole::Renderer), 1);
        assert!(table.is_warm(ProcessId::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_detection() {
        let mut table = ProcessTable::new();
        table
            .insert(ProcessRecord::new(ProcessId::new(1), ProcessRole::Renderer, None))
            .unwrap();
        table
            .insert(ProcessRecord::new(ProcessId::new(2), ProcessRole::Renderer, None))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        table
            .record_heartbeat(ProcessId::new(2), ResourceUsage::default())
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let stale = table.stale(Instant::now(), Duration::from_secs(15));
        assert_eq!(stale, vec![ProcessId::new(1)]);
    }

    #[test]
    fn test_purge_terminated_keeps_recent() {
        let mut table = table_with(1, ProcessRole::Renderer);
        table
            .insert(ProcessRecord::new(ProcessId::new(2), ProcessRole::Renderer, None))
            .unwrap();
        table.terminate(ProcessId::new(1), None).unwrap();

        assert!(table.purge_terminated(Duration::from_secs(3600)).is_empty());
        assert_eq!(table.purge_terminated(Duration::ZERO), vec![ProcessId::new(1)]);
        assert_eq!(table.count(), 1);
        assert_eq!(table.count_by_state(ProcessState::Created), 1);
    }

    #[test]
    fn test_live_of_role() {
        let mut table = ProcessTable::new();
        for raw in [3, 1, 2] {
            table
                .insert(ProcessRecord::new(ProcessId::new(raw), ProcessRole::ModelExec, None))
                .unwrap();
            table.mark_ready(ProcessId::new(raw)).unwrap();
        }
        table.terminate(ProcessId::new(2), None).unwrap();
        assert_eq!(
            table.live_of_role(ProcessRole::ModelExec),
            vec![ProcessId::new(1), ProcessId::new(3)]
        );
        assert_eq!(table.list_by_state(ProcessState::Ready).len(), 2);
    }
}
