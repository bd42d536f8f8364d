//! Process table and task services.
//!
//! Tasks and category-2 ISRs are both *processes*: statically configured
//! descriptors scheduled by fixed priority. A descriptor is never destroyed,
//! only re-initialized between activations.
use std::convert::Infallible;

use arrayvec::ArrayVec;

use crate::{
    cfg::{EntryFn, EventMask, TaskId, MAX_HELD_RESOURCES},
    error::{Error, Result},
    kernel::{current_role, Guard, Kernel, KernelState, Role},
    threading,
};

pub(crate) mod readyqueue;

/// Priority of the idle slot. Configured processes use `1..=MAX_PRIORITY`;
/// a higher number means a higher priority.
pub(crate) const IDLE_PRIORITY: u8 = 0;
pub(crate) const MAX_PRIORITY: u8 = 63;

#[derive(Debug)]
pub(crate) enum ProcKind {
    Task,
    Isr {
        #[allow(dead_code)]
        source: u32,
    },
    Idle,
}

/// Immutable per-process configuration.
pub(crate) struct ProcAttr {
    pub name: String,
    pub kind: ProcKind,
    pub base_prio: u8,
    pub max_activations: u32,
    pub auto_start: bool,
    /// Resources this process declared; indexes into the resource table.
    pub declared: Vec<usize>,
    pub entry: EntryFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Suspended,
    Ready,
    Running,
    Waiting,
}

/// The state of a task as reported by [`Kernel::get_task_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Suspended,
    Ready,
    Running,
    Waiting,
}

/// Mutable per-process state.
pub(crate) struct ProcCb {
    pub state: ProcState,
    pub eff_prio: u8,
    /// Outstanding activations, including the one currently running.
    pub activations: u32,
    /// Held resources, most recent last.
    pub held: ArrayVec<usize, MAX_HELD_RESOURCES>,
    pub events_set: EventMask,
    pub events_waited: EventMask,
    /// The context starts a new activation on its next token.
    pub fresh: bool,
    /// The backing thread is executing application code and may be
    /// signal-preempted.
    pub entered: bool,
    /// A remote preemption has been posted against the backing thread.
    pub claimed: bool,
    pub thread: Option<threading::Thread>,
}

impl ProcCb {
    pub fn new() -> Self {
        Self {
            state: ProcState::Suspended,
            eff_prio: IDLE_PRIORITY,
            activations: 0,
            held: ArrayVec::new(),
            events_set: 0,
            events_waited: 0,
            fresh: true,
            entered: false,
            claimed: false,
            thread: None,
        }
    }
}

impl Kernel {
    /// Record one activation of process `idx`, readying it if suspended.
    pub(crate) fn enqueue_activation(&self, st: &mut KernelState, idx: usize) -> Result<()> {
        let attr = &self.proc_attrs[idx];
        let cb = &mut st.procs[idx];
        if cb.activations >= attr.max_activations {
            return Err(Error::Limit);
        }
        cb.activations += 1;
        if cb.state == ProcState::Suspended {
            cb.state = ProcState::Ready;
            cb.eff_prio = attr.base_prio;
            st.ready.push_back(attr.base_prio, idx);
        }
        Ok(())
    }

    /// Retire the running activation of `idx`. The descriptor returns to its
    /// initial state; a queued activation re-enters the ready queue behind
    /// its priority peers. `running` is left for the context to hand over.
    pub(crate) fn retire_running(&self, st: &mut KernelState, idx: usize) {
        let attr = &self.proc_attrs[idx];
        let cb = &mut st.procs[idx];
        debug_assert_eq!(cb.state, ProcState::Running);
        debug_assert!(cb.activations > 0);
        cb.activations -= 1;
        cb.eff_prio = attr.base_prio;
        cb.events_set = 0;
        cb.events_waited = 0;
        cb.fresh = true;
        cb.entered = false;
        cb.claimed = false;
        if cb.activations > 0 {
            cb.state = ProcState::Ready;
            st.ready.push_back(attr.base_prio, idx);
        } else {
            cb.state = ProcState::Suspended;
        }
    }

    /// Correct and report locks the terminating process still holds.
    pub(crate) fn strip_protections(&self, st: &mut KernelState, idx: usize) {
        if !st.procs[idx].held.is_empty() {
            self.force_release_all(st, idx);
        }
        if st.user_all {
            st.user_all = false;
            st.deferred_errors.push(Error::DisabledInt);
        }
        if st.user_suspend > 0 {
            st.user_suspend = 0;
            st.deferred_errors.push(Error::DisabledInt);
        }
    }

    /// Transfer control away from the caller and tear down its activation,
    /// readying a queued activation if one is pending.
    ///
    /// Task context only. A task terminating with resources or interrupt
    /// locks still held has them force-released, reported as protection
    /// errors.
    pub fn terminate_task(&self) -> Result<Infallible> {
        log::trace!("terminate_task");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match self.task_caller(role, &guard) {
            Some(idx) => idx,
            None => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        self.strip_protections(&mut guard, idx);
        self.retire_running(&mut guard, idx);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        crate::context::exit_current()
    }

    /// Terminate the caller and activate `successor` as one step. The
    /// successor's activation limit is checked before anything happens; on
    /// `Limit` the caller keeps running.
    pub fn chain_task(&self, successor: TaskId) -> Result<Infallible> {
        log::trace!("chain_task({successor:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match self.task_caller(role, &guard) {
            Some(idx) => idx,
            None => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        if successor.0 >= self.num_tasks {
            return Err(self.fail(role, guard, Error::BadId));
        }
        // Chaining self reuses the slot freed by the terminating activation.
        if successor.0 != idx {
            let attr = &self.proc_attrs[successor.0];
            if guard.procs[successor.0].activations >= attr.max_activations {
                return Err(self.fail(role, guard, Error::Limit));
            }
        }
        self.strip_protections(&mut guard, idx);
        self.retire_running(&mut guard, idx);
        if let Err(e) = self.enqueue_activation(&mut guard, successor.0) {
            // The limit was checked above
            debug_assert!(false, "chain activation failed: {e}");
            guard.deferred_errors.push(e);
        }
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        crate::context::exit_current()
    }

    /// Request one activation of `task`. If the task is suspended it becomes
    /// ready; otherwise the request is queued, up to the task's limit.
    pub fn activate_task(&self, task: TaskId) -> Result<()> {
        log::trace!("activate_task({task:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if task.0 >= self.num_tasks {
            return Err(self.fail(role, guard, Error::BadId));
        }
        if let Err(e) = self.enqueue_activation(&mut guard, task.0) {
            return Err(self.fail(role, guard, e));
        }
        guard = self.settle(role, guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        Ok(())
    }

    /// Yield to a strictly higher priority ready process, if any. The caller
    /// continues once it is the highest again.
    pub fn schedule(&self) -> Result<()> {
        log::trace!("schedule");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match self.task_caller(role, &guard) {
            Some(idx) => idx,
            None => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if !guard.procs[idx].held.is_empty() {
            return Err(self.fail(role, guard, Error::Resource));
        }
        guard = self.settle(role, guard);
        drop(guard);
        Ok(())
    }

    pub fn get_task_state(&self, task: TaskId) -> Result<TaskState> {
        let role = current_role();
        let guard = self.lock_for(role);
        if task.0 >= self.num_tasks {
            return Err(self.fail(role, guard, Error::BadId));
        }
        let state = match guard.procs[task.0].state {
            ProcState::Suspended => TaskState::Suspended,
            ProcState::Ready => TaskState::Ready,
            ProcState::Running => TaskState::Running,
            ProcState::Waiting => TaskState::Waiting,
        };
        let mut guard = guard;
        self.leave(role, &mut guard);
        drop(guard);
        Ok(state)
    }

    /// The identity of the calling task, or `None` when called from an ISR,
    /// a hook, or a host thread.
    pub fn current_task(&self) -> Option<TaskId> {
        match current_role() {
            Role::Process(idx) if idx < self.num_tasks => Some(TaskId(idx)),
            _ => None,
        }
    }

    /// The caller's process index, if the caller is a task running outside
    /// any delivery context.
    fn task_caller(&self, role: Role, st: &KernelState) -> Option<usize> {
        match role {
            Role::Process(idx)
                if idx < self.num_tasks && st.running == idx && st.lock_depth == 0 =>
            {
                Some(idx)
            }
            _ => None,
        }
    }

    pub(crate) fn recompute_eff_prio(&self, st: &mut KernelState, idx: usize) -> u8 {
        let base = self.proc_attrs[idx].base_prio;
        let ceiling = st.procs[idx]
            .held
            .iter()
            .map(|&rid| self.resource_attrs[rid].ceiling)
            .max()
            .unwrap_or(IDLE_PRIORITY);
        let eff = base.max(ceiling);
        st.procs[idx].eff_prio = eff;
        eff
    }

    /// Restore the caller's preemptible mark without a scheduling decision.
    pub(crate) fn leave(&self, role: Role, guard: &mut Guard<'_>) {
        if let Role::Process(idx) = role {
            if guard.running == idx {
                guard.procs[idx].entered = true;
            }
        }
    }
}
