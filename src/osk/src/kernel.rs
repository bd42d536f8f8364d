//! The kernel object: frozen configuration, the state lock, the notification
//! gate, the dispatcher, and system startup/shutdown.
use std::{
    any::Any,
    cell::Cell,
    collections::{HashMap, VecDeque},
    sync::{mpsc, Arc},
};

use once_cell::sync::OnceCell;
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

use crate::{
    alarm::AlarmCb,
    cfg::{AlarmAttr, Cfg, CounterAttr, TableAttr, TableEnd, TableStart},
    counter::CounterCb,
    error::{Error, Result},
    resource::{ResCb, ResourceCfg},
    schedtable::TableCb,
    task::{
        readyqueue::ReadyQueue, ProcAttr, ProcCb, ProcKind, ProcState, IDLE_PRIORITY,
        MAX_PRIORITY,
    },
    threading,
};

/// What a thread currently is to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// The boot thread, a counter driver thread, or any other thread not
    /// backing a process.
    External,
    /// The backing thread for the process with this index.
    Process(usize),
}

thread_local! {
    /// The current thread's role. Assigned when a context thread starts.
    pub(crate) static THREAD_ROLE: Cell<Role> = const { Cell::new(Role::External) };

    /// Guards against the error hook reporting an error into itself.
    static IN_ERROR_HOOK: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn current_role() -> Role {
    THREAD_ROLE.with(|r| r.get())
}

/// What a notification source is wired to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SourceTarget {
    /// Activate this ISR process.
    Isr(usize),
    /// Advance this counter by one tick.
    Counter(usize),
}

/// All mutable kernel state, guarded by the one state lock.
pub(crate) struct KernelState {
    pub procs: Vec<ProcCb>,
    pub ready: ReadyQueue,
    /// Index of the process owning the virtual processor. The idle slot when
    /// no process does.
    pub running: usize,
    /// Internal masking depth. Non-zero while a notification is being
    /// delivered or the system is booting.
    pub lock_depth: u32,
    /// `disable_all_interrupts` is in effect (non-nesting).
    pub user_all: bool,
    /// `suspend_all_interrupts` nesting depth.
    pub user_suspend: u32,
    /// Sources raised while masked, in arrival order.
    pub pending: VecDeque<u32>,
    pub resources: Vec<ResCb>,
    pub counters: Vec<CounterCb>,
    pub alarms: Vec<AlarmCb>,
    pub tables: Vec<TableCb>,
    pub shutting_down: bool,
    /// Errors detected while the state lock was held, reported through the
    /// error hook once the lock is released.
    pub deferred_errors: Vec<Error>,
}

pub(crate) type Guard<'a> = SpinMutexGuard<'a, KernelState>;

type HookFn = Box<dyn Fn(&Kernel) + Send + Sync>;
type ErrorHookFn = Box<dyn Fn(&Kernel, Error) + Send + Sync>;

/// A configured kernel instance.
///
/// Created by [`Kernel::new`] from a finished [`Cfg`], then run with
/// [`Kernel::start`]. All services are methods on this type and may be called
/// from process bodies, hooks, or host threads; each service documents the
/// contexts it accepts.
pub struct Kernel {
    pub(crate) proc_attrs: Vec<ProcAttr>,
    pub(crate) num_tasks: usize,
    pub(crate) resource_attrs: Vec<ResourceCfg>,
    pub(crate) counter_attrs: Vec<CounterAttr>,
    pub(crate) alarm_attrs: Vec<AlarmAttr>,
    pub(crate) table_attrs: Vec<TableAttr>,
    pub(crate) sources: HashMap<u32, SourceTarget>,
    startup_hook: Option<HookFn>,
    shutdown_hook: Option<HookFn>,
    error_hook: Option<ErrorHookFn>,
    pub(crate) state: SpinMutex<KernelState>,
    started: OnceCell<()>,
    shutdown_status: OnceCell<Result<()>>,
    main_tx: SpinMutex<Option<mpsc::Sender<()>>>,
    panic_payload: SpinMutex<Option<Box<dyn Any + Send>>>,
    timer_txs: SpinMutex<Vec<mpsc::Sender<()>>>,
}

impl Kernel {
    /// Validate and freeze `cfg` into a kernel instance.
    pub fn new(cfg: Cfg) -> Result<Arc<Self>> {
        let mut proc_attrs = Vec::new();
        let num_tasks = cfg.tasks.len();

        for t in cfg.tasks {
            if t.priority < 1 || t.priority > MAX_PRIORITY {
                log::error!("task {}: priority {} out of range", t.name, t.priority);
                return Err(Error::Value);
            }
            if t.max_activations == 0 {
                log::error!("task {}: zero activation limit", t.name);
                return Err(Error::Value);
            }
            proc_attrs.push(ProcAttr {
                name: t.name,
                kind: ProcKind::Task,
                base_prio: t.priority,
                max_activations: t.max_activations,
                auto_start: t.auto_start,
                declared: t.resources.iter().map(|r| r.0).collect(),
                entry: t.entry,
            });
        }

        let mut sources: HashMap<u32, SourceTarget> = HashMap::new();
        for i in cfg.isrs {
            if i.priority < 1 || i.priority > MAX_PRIORITY {
                log::error!("isr {}: priority {} out of range", i.name, i.priority);
                return Err(Error::Value);
            }
            if sources
                .insert(i.source, SourceTarget::Isr(proc_attrs.len()))
                .is_some()
            {
                log::error!("isr {}: source {} already wired", i.name, i.source);
                return Err(Error::Value);
            }
            proc_attrs.push(ProcAttr {
                name: i.name,
                kind: ProcKind::Isr { source: i.source },
                base_prio: i.priority,
                max_activations: 1,
                auto_start: false,
                declared: i.resources.iter().map(|r| r.0).collect(),
                entry: i.entry,
            });
        }

        // The idle slot. It owns no context and is never enqueued; it only
        // occupies `running` while no process does.
        proc_attrs.push(ProcAttr {
            name: "(idle)".to_owned(),
            kind: ProcKind::Idle,
            base_prio: IDLE_PRIORITY,
            max_activations: 1,
            auto_start: false,
            declared: Vec::new(),
            entry: Box::new(|_| {}),
        });

        let num_resources = cfg.resources.len();
        for attrs in &proc_attrs {
            if attrs.declared.iter().any(|&r| r >= num_resources) {
                log::error!("{}: undefined resource declared", attrs.name);
                return Err(Error::BadId);
            }
        }

        // Ceiling = highest base priority among the declared users.
        let resource_attrs = cfg
            .resources
            .iter()
            .enumerate()
            .map(|(rid, r)| ResourceCfg {
                name: r.name.clone(),
                ceiling: proc_attrs
                    .iter()
                    .filter(|p| p.declared.contains(&rid))
                    .map(|p| p.base_prio)
                    .max()
                    .unwrap_or(IDLE_PRIORITY),
            })
            .collect();

        for (cid, c) in cfg.counters.iter().enumerate() {
            if c.max_value == 0 {
                log::error!("counter {}: zero maximum value", c.name);
                return Err(Error::Value);
            }
            if c.drive_period.is_some() && c.source.is_none() {
                log::error!("counter {}: driven but not wired to a source", c.name);
                return Err(Error::Value);
            }
            if let Some(source) = c.source {
                if sources.insert(source, SourceTarget::Counter(cid)).is_some() {
                    log::error!("counter {}: source {} already wired", c.name, source);
                    return Err(Error::Value);
                }
            }
        }

        for a in &cfg.alarms {
            let max = cfg.counters[a.counter.0].max_value;
            if let Some((offset, cycle)) = a.autostart {
                if offset == 0 || offset > max || cycle > max {
                    log::error!("alarm {}: autostart out of range", a.name);
                    return Err(Error::Value);
                }
            }
        }

        for t in &cfg.tables {
            let max = cfg.counters[t.counter.0].max_value;
            if t.duration == 0 || t.duration > max {
                log::error!("schedule table {}: bad duration", t.name);
                return Err(Error::Value);
            }
            if t.entries.is_empty() {
                log::error!("schedule table {}: no expiry points", t.name);
                return Err(Error::Value);
            }
            let mut prev = 0;
            for e in &t.entries {
                if e.offset <= prev || e.offset > t.duration {
                    log::error!("schedule table {}: bad expiry offset {}", t.name, e.offset);
                    return Err(Error::Value);
                }
                prev = e.offset;
            }
            match t.autostart {
                Some(TableStart::Rel(offset)) if offset == 0 || offset > max => {
                    log::error!("schedule table {}: autostart offset out of range", t.name);
                    return Err(Error::Value);
                }
                Some(TableStart::Abs(at)) if at > max => {
                    log::error!("schedule table {}: autostart value out of range", t.name);
                    return Err(Error::Value);
                }
                _ => {}
            }
            if let TableEnd::ChainTo(succ) = t.on_end {
                if cfg.tables[succ.0].counter != t.counter {
                    log::error!("schedule table {}: successor uses another counter", t.name);
                    return Err(Error::Value);
                }
            }
        }

        let idle_idx = proc_attrs.len() - 1;
        let state = KernelState {
            procs: proc_attrs.iter().map(|_| ProcCb::new()).collect(),
            ready: ReadyQueue::new(),
            running: idle_idx,
            lock_depth: 0,
            user_all: false,
            user_suspend: 0,
            pending: VecDeque::new(),
            resources: (0..num_resources).map(|_| ResCb { owner: None }).collect(),
            counters: cfg.counters.iter().map(|_| CounterCb::new()).collect(),
            alarms: cfg.alarms.iter().map(|_| AlarmCb::new()).collect(),
            tables: cfg.tables.iter().map(|_| TableCb::new()).collect(),
            shutting_down: false,
            deferred_errors: Vec::new(),
        };

        Ok(Arc::new(Self {
            proc_attrs,
            num_tasks,
            resource_attrs,
            counter_attrs: cfg.counters,
            alarm_attrs: cfg.alarms,
            table_attrs: cfg.tables,
            sources,
            startup_hook: cfg.startup_hook,
            shutdown_hook: cfg.shutdown_hook,
            error_hook: cfg.error_hook,
            state: SpinMutex::new(state),
            started: OnceCell::new(),
            shutdown_status: OnceCell::new(),
            main_tx: SpinMutex::new(None),
            panic_payload: SpinMutex::new(None),
            timer_txs: SpinMutex::new(Vec::new()),
        }))
    }

    pub(crate) fn idle_idx(&self) -> usize {
        self.proc_attrs.len() - 1
    }

    pub(crate) fn proc_name(&self, idx: usize) -> &str {
        &self.proc_attrs[idx].name
    }

    pub(crate) fn is_task(&self, idx: usize) -> bool {
        matches!(self.proc_attrs[idx].kind, ProcKind::Task)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub(crate) fn masked(st: &KernelState) -> bool {
        st.lock_depth > 0 || st.user_all || st.user_suspend > 0
    }

    /// Acquire the state lock on behalf of `role`.
    ///
    /// A process thread marks itself as being inside the kernel
    /// (`entered = false`), which keeps [`Self::external_reschedule`] from
    /// signal-preempting it while it may hold the lock. If the thread has
    /// already been claimed for preemption, it waits here for the signal to
    /// take effect before entering.
    pub(crate) fn lock_for(&self, role: Role) -> Guard<'_> {
        loop {
            let mut guard = self.state.lock();
            if let Role::Process(idx) = role {
                if guard.running == idx {
                    if guard.procs[idx].claimed {
                        drop(guard);
                        std::thread::yield_now();
                        continue;
                    }
                    guard.procs[idx].entered = false;
                }
            }
            return guard;
        }
    }

    /// Abandon a service with `e`: restore the caller's preemptible mark,
    /// release the lock and report through the error hook.
    pub(crate) fn fail(&self, role: Role, mut guard: Guard<'_>, e: Error) -> Error {
        if let Role::Process(idx) = role {
            if guard.running == idx {
                guard.procs[idx].entered = true;
            }
        }
        drop(guard);
        self.call_error_hook(e);
        e
    }

    /// Act on any scheduling decision made observable by the preceding
    /// state changes, then mark the caller preemptible again.
    pub(crate) fn settle<'a>(&'a self, role: Role, mut guard: Guard<'a>) -> Guard<'a> {
        if !Self::masked(&guard) && !guard.shutting_down {
            match role {
                Role::Process(idx) => guard = self.reschedule_self(guard, idx),
                Role::External => guard = self.external_reschedule(guard),
            }
        }
        if let Role::Process(idx) = role {
            if guard.running == idx {
                guard.procs[idx].entered = true;
            }
        }
        guard
    }

    pub(crate) fn report_all(&self, errs: Vec<Error>) {
        for e in errs {
            self.call_error_hook(e);
        }
    }

    pub(crate) fn call_error_hook(&self, e: Error) {
        log::warn!("service error: {e}");
        if let Some(hook) = &self.error_hook {
            let reentered = IN_ERROR_HOOK.with(|f| f.replace(true));
            if !reentered {
                hook(self, e);
                IN_ERROR_HOOK.with(|f| f.set(false));
            }
        }
    }

    /// Hand the virtual processor to the frontmost ready process, if any.
    /// The caller must have detached the previous occupant of `running`.
    pub(crate) fn dispatch_next(&self, st: &mut KernelState) {
        debug_assert_eq!(st.running, self.idle_idx());
        if st.shutting_down {
            return;
        }
        if let Some(next) = st.ready.pop_highest() {
            let cb = &mut st.procs[next];
            cb.state = ProcState::Running;
            if cb.claimed {
                // Resuming a remote-preempted process: its thread returns
                // straight into application code.
                cb.claimed = false;
                cb.entered = true;
            }
            st.running = next;
            log::debug!("dispatching {}", self.proc_name(next));
            if let Some(thread) = &cb.thread {
                thread.unpark();
            }
        }
    }

    /// Scheduling decision on behalf of the running process itself. If a
    /// strictly higher priority process is ready, the caller is put back at
    /// the front of its priority ring and its thread parks until resumed.
    fn reschedule_self<'a>(&'a self, mut guard: Guard<'a>, idx: usize) -> Guard<'a> {
        debug_assert_eq!(guard.running, idx);
        let eff = guard.procs[idx].eff_prio;
        let preempted = matches!(guard.ready.front_priority(), Some(top) if top > eff);
        if preempted {
            log::debug!("{} preempted", self.proc_name(idx));
            guard.procs[idx].state = ProcState::Ready;
            guard.ready.push_front(eff, idx);
            guard.running = self.idle_idx();
            self.dispatch_next(&mut guard);
            drop(guard);
            threading::park();
            guard = self.state.lock();
            debug_assert_eq!(guard.running, idx);
        }
        guard
    }

    /// Scheduling decision on behalf of a non-process thread. If the running
    /// process is outprioritized, its thread is forced to park at its current
    /// execution point before the winner is dispatched, so process code never
    /// runs on two threads at once.
    fn external_reschedule<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        loop {
            if guard.shutting_down || Self::masked(&guard) {
                return guard;
            }
            let top = match guard.ready.front_priority() {
                Some(top) => top,
                None => return guard,
            };
            let cur = guard.running;
            if cur == self.idle_idx() {
                self.dispatch_next(&mut guard);
                return guard;
            }
            if top <= guard.procs[cur].eff_prio {
                return guard;
            }
            if !guard.procs[cur].entered {
                // Inside a kernel service or not yet executing. Wait until it
                // reaches preemptible code.
                drop(guard);
                std::thread::yield_now();
                guard = self.state.lock();
                continue;
            }
            guard.procs[cur].claimed = true;
            guard.procs[cur].entered = false;
            let thread = guard.procs[cur].thread.clone();
            if let Some(thread) = thread {
                // The state lock stays held across the remote park. The
                // signal can then only land while the target is outside the
                // lock, in application code or spinning to acquire it.
                thread.preempt();
            }
            debug_assert_eq!(guard.running, cur);
            log::debug!("{} preempted externally", self.proc_name(cur));
            let eff = guard.procs[cur].eff_prio;
            guard.procs[cur].state = ProcState::Ready;
            guard.ready.push_front(eff, cur);
            guard.running = self.idle_idx();
        }
    }

    /// Deliver a notification from source `source`.
    ///
    /// Unknown sources are a configuration fault and shut the system down.
    /// While delivery is masked the source is queued and delivered, in
    /// arrival order, when the masking is fully released.
    pub fn raise(&self, source: u32) {
        log::trace!("raise({source})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.shutting_down {
            self.leave(role, &mut guard);
            return;
        }
        if !self.sources.contains_key(&source) {
            log::error!("notification from unknown source {source}");
            drop(guard);
            self.initiate_shutdown(Err(Error::BadId));
            if let Role::Process(_) = role {
                crate::context::exit_current();
            }
            return;
        }
        if Self::masked(&guard) {
            guard.pending.push_back(source);
            self.leave(role, &mut guard);
            return;
        }
        guard.lock_depth += 1;
        guard = self.deliver(guard, source);
        guard = self.unmask_one(guard);
        guard = self.settle(role, guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
    }

    fn deliver<'a>(&'a self, mut guard: Guard<'a>, source: u32) -> Guard<'a> {
        debug_assert!(guard.lock_depth > 0);
        match self.sources[&source] {
            SourceTarget::Isr(idx) => {
                log::debug!("source {source}: activating {}", self.proc_name(idx));
                if let Err(e) = self.enqueue_activation(&mut guard, idx) {
                    guard.deferred_errors.push(e);
                }
            }
            SourceTarget::Counter(cid) => {
                guard = self.tick_counter(guard, cid, 1);
            }
        }
        guard
    }

    /// Decrement the masking depth; on the transition to fully unmasked,
    /// drain queued sources.
    pub(crate) fn unmask_one<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        assert!(guard.lock_depth > 0, "unbalanced unmasking");
        guard.lock_depth -= 1;
        self.drain_pending(guard)
    }

    pub(crate) fn drain_pending<'a>(&'a self, mut guard: Guard<'a>) -> Guard<'a> {
        while !Self::masked(&guard) && !guard.shutting_down {
            let source = match guard.pending.pop_front() {
                Some(source) => source,
                None => break,
            };
            log::debug!("delivering deferred source {source}");
            guard.lock_depth += 1;
            guard = self.deliver(guard, source);
            guard.lock_depth -= 1;
        }
        guard
    }

    /// Disable notification delivery at the application's request.
    /// Not nestable; disabling twice is a protection error.
    pub fn disable_all_interrupts(&self) -> Result<()> {
        log::trace!("disable_all_interrupts");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.user_all {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        guard.user_all = true;
        guard = self.settle(role, guard);
        drop(guard);
        Ok(())
    }

    /// Counterpart of [`Self::disable_all_interrupts`]. Queued sources are
    /// delivered before this returns.
    pub fn enable_all_interrupts(&self) -> Result<()> {
        log::trace!("enable_all_interrupts");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if !guard.user_all {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        guard.user_all = false;
        guard = self.drain_pending(guard);
        guard = self.settle(role, guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        Ok(())
    }

    /// Disable notification delivery, nesting.
    pub fn suspend_all_interrupts(&self) -> Result<()> {
        log::trace!("suspend_all_interrupts");
        let role = current_role();
        let mut guard = self.lock_for(role);
        guard.user_suspend += 1;
        guard = self.settle(role, guard);
        drop(guard);
        Ok(())
    }

    /// Counterpart of [`Self::suspend_all_interrupts`]. The outermost resume
    /// delivers queued sources before it returns.
    pub fn resume_all_interrupts(&self) -> Result<()> {
        log::trace!("resume_all_interrupts");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.user_suspend == 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        guard.user_suspend -= 1;
        guard = self.drain_pending(guard);
        guard = self.settle(role, guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        Ok(())
    }

    /// Boot the system: create every context, run the startup hook, perform
    /// the configured autostarts, open the notification gate, and dispatch.
    ///
    /// Blocks until [`Self::shutdown`] and returns the status passed to it.
    /// A panic escaping a process body is re-thrown here.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.set(()).is_err() {
            log::error!("kernel started twice");
            self.call_error_hook(Error::State);
            return Err(Error::State);
        }
        log::info!("starting up");

        let (tx, rx) = mpsc::channel();
        *self.main_tx.lock() = Some(tx);

        // Mask delivery for the whole boot phase.
        self.state.lock().lock_depth = 1;

        // One context per process. Each worker registers its park state and
        // parks; the first dispatch wakes it into the process entry.
        for idx in 0..self.proc_attrs.len() {
            if matches!(self.proc_attrs[idx].kind, ProcKind::Idle) {
                continue;
            }
            let kernel = Arc::clone(self);
            let handle = threading::spawn(move || crate::context::worker_main(kernel, idx));
            self.state.lock().procs[idx].thread = Some(handle.thread().clone());
        }

        if let Some(hook) = &self.startup_hook {
            hook(self);
        }

        {
            let mut guard = self.state.lock();
            for idx in 0..self.proc_attrs.len() {
                if self.proc_attrs[idx].auto_start {
                    // Cannot exceed the limit on a suspended process
                    let _ = self.enqueue_activation(&mut guard, idx);
                }
            }
            for aid in 0..self.alarm_attrs.len() {
                if let Some((offset, cycle)) = self.alarm_attrs[aid].autostart {
                    self.autostart_alarm(&mut guard, aid, offset, cycle);
                }
            }
            for tid in 0..self.table_attrs.len() {
                if let Some(start) = self.table_attrs[tid].autostart {
                    self.autostart_table(&mut guard, tid, start);
                }
            }
        }

        // Host timer threads driving the bound counters.
        for attr in &self.counter_attrs {
            if let (Some(period), Some(source)) = (attr.drive_period, attr.source) {
                let (timer_tx, timer_rx) = mpsc::channel::<()>();
                self.timer_txs.lock().push(timer_tx);
                let kernel = Arc::clone(self);
                log::trace!("starting the timer thread for counter {}", attr.name);
                std::thread::spawn(move || loop {
                    match timer_rx.recv_timeout(period) {
                        Err(mpsc::RecvTimeoutError::Timeout) => kernel.raise(source),
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                });
            }
        }

        // Open the gate and perform the first dispatch.
        let mut guard = self.state.lock();
        guard = self.unmask_one(guard);
        guard = self.external_reschedule(guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);

        // Block until shutdown.
        let _ = rx.recv();

        if let Some(payload) = self.panic_payload.lock().take() {
            std::panic::resume_unwind(payload);
        }

        let status = self.shutdown_status.get().copied().unwrap_or(Ok(()));
        log::info!("shut down with status {status:?}");
        status
    }

    /// Stop the system, recording `status`. The first recorded status wins.
    ///
    /// When called from a process body this does not return; the calling
    /// context is torn down.
    pub fn shutdown(&self, status: Result<()>) {
        self.initiate_shutdown(status);
        if let Role::Process(_) = current_role() {
            crate::context::exit_current();
        }
    }

    pub(crate) fn initiate_shutdown(&self, status: Result<()>) {
        let role = current_role();
        let guard = self.lock_for(role);
        if guard.shutting_down {
            return;
        }
        let _ = self.shutdown_status.set(status);
        let mut guard = guard;
        guard.shutting_down = true;
        drop(guard);
        log::info!("shutdown initiated ({status:?})");

        if let Some(hook) = &self.shutdown_hook {
            hook(self);
        }

        // Stop the counter driver threads.
        self.timer_txs.lock().clear();

        // Wake the contexts parked between activations so their threads can
        // exit. Contexts parked inside a process body are leaked; their
        // threads die with the host process.
        let threads: Vec<_> = {
            let guard = self.state.lock();
            guard
                .procs
                .iter()
                .filter(|cb| cb.fresh)
                .filter_map(|cb| cb.thread.clone())
                .collect()
        };
        for thread in threads {
            thread.unpark();
        }

        if let Some(tx) = self.main_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn forward_panic(&self, payload: Box<dyn Any + Send>) {
        log::error!("a process body panicked; shutting down");
        *self.panic_payload.lock() = Some(payload);
        self.initiate_shutdown(Ok(()));
    }
}
