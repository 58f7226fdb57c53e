//! Bookkeeping for simulated processes.
//!
//! A process is one script running on one machine: its tasks, the futures
//! it is suspended on and its cancellation flag. Processes never share
//! state except through packets routed by the cluster.

use std::{
    collections::BTreeMap,
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use super::future::Resolvable;

/// Unique identifier of a process within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    #[cfg(test)]
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessState {
    Running,
    /// Every task returned.
    Finished,
    /// The script called halt.
    Halted(String),
    /// Stopped from outside.
    Killed,
}

pub(crate) struct Process {
    pub machine: Arc<str>,
    pub service: Arc<str>,
    /// Index of the script this process runs, None for the plan
    pub script: Option<usize>,
    pub state: ProcessState,
    pub cancelled: bool,
    tasks: usize,
    pending: Vec<Weak<dyn Resolvable>>,
}

impl Process {
    /// `machine:service` label used in logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.machine, self.service)
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }
}

#[derive(Default)]
pub(crate) struct ProcessTable {
    processes: BTreeMap<ProcessId, Process>,
    next_id: u32,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, machine: Arc<str>, service: Arc<str>, script: Option<usize>) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.processes.insert(
            id,
            Process {
                machine,
                service,
                script,
                state: ProcessState::Running,
                cancelled: false,
                tasks: 0,
                pending: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    pub fn is_running(&self, id: ProcessId) -> bool {
        self.processes.get(&id).is_some_and(Process::is_running)
    }

    pub fn is_cancelled(&self, id: ProcessId) -> bool {
        self.processes.get(&id).map_or(true, |p| p.cancelled)
    }

    /// Ties a suspended future to `id` so cancellation can reach it.
    pub fn register(&mut self, id: ProcessId, pending: Weak<dyn Resolvable>) {
        if let Some(process) = self.processes.get_mut(&id) {
            if process.pending.len() >= 64 {
                process
                    .pending
                    .retain(|p| p.upgrade().is_some_and(|r| r.is_pending()));
            }
            process.pending.push(pending);
        }
    }

    /// Sets the cancellation flag. Returns the futures to cancel; the
    /// caller resolves them once the table is no longer borrowed.
    pub fn cancel(&mut self, id: ProcessId) -> Vec<Rc<dyn Resolvable>> {
        let Some(process) = self.processes.get_mut(&id) else {
            return Vec::new();
        };
        process.cancelled = true;
        std::mem::take(&mut process.pending)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn task_started(&mut self, id: ProcessId) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.tasks += 1;
        }
    }

    /// Returns true if this was the last task of a running process.
    pub fn task_finished(&mut self, id: ProcessId) -> bool {
        let Some(process) = self.processes.get_mut(&id) else {
            return false;
        };
        process.tasks = process.tasks.saturating_sub(1);
        if process.tasks == 0 && process.is_running() {
            process.state = ProcessState::Finished;
            return true;
        }
        false
    }

    pub fn halt(&mut self, id: ProcessId, reason: String) {
        if let Some(process) = self.processes.get_mut(&id) {
            if process.is_running() {
                process.state = ProcessState::Halted(reason);
            }
        }
    }

    pub fn kill(&mut self, id: ProcessId) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.tasks = 0;
            if process.is_running() {
                process.state = ProcessState::Killed;
            }
        }
    }

    /// Forgets the tasks of a halted process.
    pub fn clear_tasks(&mut self, id: ProcessId) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.tasks = 0;
        }
    }

    /// True when at least one process exists and none is running.
    pub fn all_done(&self) -> bool {
        !self.processes.is_empty() && self.processes.values().all(|p| !p.is_running())
    }

    pub fn running(&self) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|(_, p)| p.is_running())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Running processes whose `machine:service` matches `selector`.
    ///
    /// `*` matches everything, a bare machine name matches all of its
    /// services.
    pub fn running_matching(&self, selector: &str) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|(_, p)| p.is_running() && p.script.is_some())
            .filter(|(_, p)| matches_selector(selector, &p.machine, &p.service))
            .map(|(id, _)| *id)
            .collect()
    }

    /// True if a process for `script` is still running.
    pub fn script_running(&self, script: usize) -> bool {
        self.processes
            .values()
            .any(|p| p.script == Some(script) && p.is_running())
    }

    pub fn machine_busy(&self, machine: &str) -> bool {
        self.processes
            .values()
            .any(|p| &*p.machine == machine && p.is_running())
    }
}

/// Matches `machine:service` names against a start/stop selector.
pub(crate) fn matches_selector(selector: &str, machine: &str, service: &str) -> bool {
    match selector.split_once(':') {
        _ if selector == "*" => true,
        Some((m, s)) => m == machine && s == service,
        None => selector == machine,
    }
}
