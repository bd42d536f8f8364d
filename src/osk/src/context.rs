//! Execution contexts.
//!
//! Every process owns a dedicated worker thread created at startup; the
//! thread's stack is the process's stack. A context is *fresh* while the
//! worker is parked at the top of its loop (the next token starts a new
//! activation) and *live* while it is somewhere inside the process body.
//! Explicit termination unwinds the body with a private token, returning the
//! context to fresh without recreating the thread.
use std::{
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    error::Error,
    kernel::{Kernel, Role, THREAD_ROLE},
    task::ProcState,
    threading,
};

/// Unwind payload marking an orderly exit from a process body.
pub(crate) struct ExitToken;

/// Leave the current process body by unwinding back to [`worker_main`].
pub(crate) fn exit_current() -> ! {
    resume_unwind(Box::new(ExitToken))
}

/// The worker loop backing one process context.
pub(crate) fn worker_main(kernel: Arc<Kernel>, idx: usize) {
    THREAD_ROLE.with(|role| role.set(Role::Process(idx)));
    log::trace!("context for {} ready", kernel.proc_name(idx));

    loop {
        threading::park();
        if kernel.is_shutting_down() {
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| kernel.run_body(idx)));
        match outcome {
            Ok(()) => {
                // The body returned instead of terminating explicitly. For a
                // task that is fatal; an ISR is terminated implicitly, with
                // any leftover locks corrected and reported.
                if kernel.is_task(idx) {
                    kernel.missing_end(idx);
                    break;
                }
                kernel.implicit_terminate(idx);
            }
            Err(payload) if payload.is::<ExitToken>() => {}
            Err(payload) => {
                kernel.forward_panic(payload);
                break;
            }
        }

        if kernel.is_shutting_down() {
            break;
        }
        kernel.finish_switch(idx);
    }

    log::trace!("context for {} exited", kernel.proc_name(idx));
}

impl Kernel {
    /// Run one activation of the process body on the current thread.
    pub(crate) fn run_body(&self, idx: usize) {
        {
            let mut guard = self.state.lock();
            debug_assert_eq!(guard.running, idx);
            let cb = &mut guard.procs[idx];
            cb.fresh = false;
            cb.entered = true;
        }
        log::debug!("{} is now running", self.proc_name(idx));
        (self.proc_attrs[idx].entry)(self);
    }

    /// Release the virtual processor after the current activation ended and
    /// hand it to the next ready process.
    pub(crate) fn finish_switch(&self, idx: usize) {
        let mut guard = self.state.lock();
        debug_assert_eq!(guard.running, idx);
        guard.running = self.idle_idx();
        self.dispatch_next(&mut guard);
    }

    /// Fatal: a task body returned without `terminate_task`.
    pub(crate) fn missing_end(&self, idx: usize) {
        log::error!("task {} returned without terminating", self.proc_name(idx));
        self.call_error_hook(Error::MissingEnd);
        self.initiate_shutdown(Err(Error::MissingEnd));
    }

    /// An ISR body returned: terminate it implicitly, correcting and
    /// reporting any locks it failed to release.
    pub(crate) fn implicit_terminate(&self, idx: usize) {
        let mut guard = self.state.lock();
        debug_assert_eq!(guard.running, idx);
        debug_assert_eq!(guard.procs[idx].state, ProcState::Running);
        self.strip_protections(&mut guard, idx);
        self.retire_running(&mut guard, idx);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
    }
}
