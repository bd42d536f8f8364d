//! Resources with immediate priority ceiling.
//!
//! Locking a resource raises the holder's effective priority to the
//! resource's ceiling, the highest base priority among its declared users.
//! Resources are released strictly in the reverse order of acquisition.
use crate::{
    cfg::ResourceId,
    error::{Error, Result},
    kernel::{current_role, Kernel, KernelState, Role},
};

/// Immutable per-resource configuration.
pub(crate) struct ResourceCfg {
    pub name: String,
    pub ceiling: u8,
}

/// Mutable per-resource state.
pub(crate) struct ResCb {
    pub owner: Option<usize>,
}

impl Kernel {
    pub(crate) fn do_lock_resource(
        &self,
        st: &mut KernelState,
        idx: usize,
        rid: usize,
    ) -> Result<()> {
        if !self.proc_attrs[idx].declared.contains(&rid) {
            return Err(Error::Access);
        }
        if st.resources[rid].owner.is_some() {
            return Err(Error::Access);
        }
        if st.procs[idx].held.try_push(rid).is_err() {
            return Err(Error::Access);
        }
        st.resources[rid].owner = Some(idx);
        let ceiling = self.resource_attrs[rid].ceiling;
        let cb = &mut st.procs[idx];
        cb.eff_prio = cb.eff_prio.max(ceiling);
        Ok(())
    }

    /// Release `rid`, recomputing the holder's effective priority. Returns
    /// whether the priority dropped, in which case the caller owes the
    /// scheduler a decision.
    pub(crate) fn do_release_resource(
        &self,
        st: &mut KernelState,
        idx: usize,
        rid: usize,
    ) -> Result<bool> {
        if st.resources[rid].owner != Some(idx) {
            return Err(Error::NoFunc);
        }
        if st.procs[idx].held.last() != Some(&rid) {
            // Releases must mirror the acquisition order
            return Err(Error::Access);
        }
        st.procs[idx].held.pop();
        st.resources[rid].owner = None;
        let old = st.procs[idx].eff_prio;
        let new = self.recompute_eff_prio(st, idx);
        Ok(new < old)
    }

    /// Release everything `idx` still holds, reporting each leftover as a
    /// protection error.
    pub(crate) fn force_release_all(&self, st: &mut KernelState, idx: usize) {
        while let Some(rid) = st.procs[idx].held.pop() {
            log::warn!(
                "{} terminated holding resource {}",
                self.proc_name(idx),
                self.resource_attrs[rid].name
            );
            st.resources[rid].owner = None;
            st.deferred_errors.push(Error::Resource);
        }
        self.recompute_eff_prio(st, idx);
    }

    /// Occupy `resource`, entering the critical section it guards. The
    /// caller's effective priority is raised to the resource's ceiling.
    pub fn get_resource(&self, resource: ResourceId) -> Result<()> {
        log::trace!("get_resource({resource:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match role {
            Role::Process(idx) if guard.running == idx && guard.lock_depth == 0 => idx,
            _ => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if resource.0 >= self.resource_attrs.len() {
            return Err(self.fail(role, guard, Error::BadId));
        }
        if let Err(e) = self.do_lock_resource(&mut guard, idx, resource.0) {
            return Err(self.fail(role, guard, e));
        }
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Leave the critical section guarded by `resource`. Dropping back to a
    /// lower effective priority is a scheduling decision point.
    pub fn release_resource(&self, resource: ResourceId) -> Result<()> {
        log::trace!("release_resource({resource:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let idx = match role {
            Role::Process(idx) if guard.running == idx && guard.lock_depth == 0 => idx,
            _ => return Err(self.fail(role, guard, Error::CallLevel)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if resource.0 >= self.resource_attrs.len() {
            return Err(self.fail(role, guard, Error::BadId));
        }
        match self.do_release_resource(&mut guard, idx, resource.0) {
            Err(e) => Err(self.fail(role, guard, e)),
            Ok(_lowered) => {
                guard = self.settle(role, guard);
                drop(guard);
                Ok(())
            }
        }
    }
}
