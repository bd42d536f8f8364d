//! Task events.
//!
//! Each task owns a 32-bit event mask. Setting an event on a task waiting
//! for it makes the task ready again; the scheduling decision follows
//! immediately.
use crate::{
    cfg::{EventMask, TaskId},
    error::{Error, Result},
    kernel::{current_role, Kernel, KernelState, Role},
    task::ProcState,
    threading,
};

impl Kernel {
    pub(crate) fn do_set_event(
        &self,
        st: &mut KernelState,
        idx: usize,
        mask: EventMask,
    ) -> Result<()> {
        let cb = &mut st.procs[idx];
        if cb.state == ProcState::Suspended {
            return Err(Error::State);
        }
        cb.events_set |= mask;
        if cb.state == ProcState::Waiting && cb.events_set & cb.events_waited != 0 {
            cb.events_waited = 0;
            cb.state = ProcState::Ready;
            let prio = cb.eff_prio;
            st.ready.push_back(prio, idx);
            log::debug!("{} released by event", self.proc_name(idx));
        }
        Ok(())
    }

    /// Set `mask` on `task`, waking it if it waits for any of the bits.
    pub fn set_event(&self, task: TaskId, mask: EventMask) -> Result<()> {
        log::trace!("set_event({task:?}, {mask:#x})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if task.0 >= self.num_tasks {
            return Err(self.fail(role, guard, Error::BadId));
        }
        if let Err(e) = self.do_set_event(&mut guard, task.0, mask) {
            return Err(self.fail(role, guard, e));
        }
        guard = self.settle(role, guard);
        drop(guard);
        Ok(())
    }

    /// Clear `mask` from the calling task's own events.
    pub fn clear_event(&self, mask: EventMask) -> Result<()> {
        log::trace!("clear_event({mask:#x})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match role {
            Role::Process(idx) if idx < self.num_tasks && guard.running == idx => idx,
            _ => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        guard.procs[idx].events_set &= !mask;
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    pub fn get_event(&self, task: TaskId) -> Result<EventMask> {
        let role = current_role();
        let mut guard = self.lock_for(role);
        if task.0 >= self.num_tasks {
            return Err(self.fail(role, guard, Error::BadId));
        }
        let mask = guard.procs[task.0].events_set;
        self.leave(role, &mut guard);
        drop(guard);
        Ok(mask)
    }

    /// Block the calling task until one of the bits in `mask` is set.
    /// Returns immediately if one already is. Task context only, and not
    /// while holding a resource.
    pub fn wait_event(&self, mask: EventMask) -> Result<()> {
        log::trace!("wait_event({mask:#x})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match role {
            Role::Process(idx)
                if idx < self.num_tasks && guard.running == idx && guard.lock_depth == 0 =>
            {
                idx
            }
            _ => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if !guard.procs[idx].held.is_empty() {
            return Err(self.fail(role, guard, Error::Resource));
        }
        if mask == 0 {
            return Err(self.fail(role, guard, Error::Value));
        }

        if guard.procs[idx].events_set & mask != 0 {
            self.leave(role, &mut guard);
            drop(guard);
            return Ok(());
        }

        guard.procs[idx].events_waited = mask;
        guard.procs[idx].state = ProcState::Waiting;
        guard.running = self.idle_idx();
        log::debug!("{} waiting for {mask:#x}", self.proc_name(idx));
        self.dispatch_next(&mut guard);
        drop(guard);
        threading::park();

        let mut guard = self.state.lock();
        debug_assert_eq!(guard.running, idx);
        guard.procs[idx].entered = true;
        drop(guard);
        Ok(())
    }
}
