//! Schedule tables: rounds of ordered expiry points on a counter.
//!
//! A running table keeps exactly one expiry point armed on its counter, the
//! next one due. Firing it runs the point's actions and arms the following
//! point, or the round end, which repeats, stops, or chains to the successor
//! table.
use crate::{
    cfg::{ScheduleTableId, TableEnd, Tick},
    counter::{Expiry, ExpiryOwner},
    error::{Error, Result},
    kernel::{current_role, Guard, Kernel, KernelState},
};

/// What a table's armed expiry point stands for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TablePoint {
    /// The entry with this index in the table's entry list.
    Entry(usize),
    /// The end of the current round, `duration` ticks past its base.
    RoundEnd,
}

/// Mutable per-table state.
pub(crate) struct TableCb {
    pub state: TableState,
}

pub(crate) enum TableState {
    Stopped,
    /// Started but no point has fired yet. `armed` is the key of the first
    /// point and the round base, or `None` for a synchronous start still
    /// waiting for its alignment.
    Waiting {
        sync: bool,
        armed: Option<(usize, Tick)>,
    },
    Running {
        sync: bool,
        /// Key of the armed point in the counter's pool.
        key: usize,
        /// Counter value corresponding to offset zero of the current round.
        base: Tick,
    },
}

impl TableCb {
    pub fn new() -> Self {
        Self {
            state: TableState::Stopped,
        }
    }
}

/// The externally observable state of a schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Stopped,
    /// Started, before its first expiry point.
    Waiting,
    Running,
    RunningSynchronous,
}

impl Kernel {
    fn arm_point(
        &self,
        st: &mut KernelState,
        tid: usize,
        point: TablePoint,
        due: u64,
    ) -> (usize, Tick) {
        let cid = self.table_attrs[tid].counter.0;
        let due = (due % self.modulus(cid)) as Tick;
        let key = st.counters[cid].expiries.insert(Expiry {
            due,
            owner: ExpiryOwner::Table { table: tid, point },
        });
        log::debug!(
            "table {}: {point:?} armed for {due}",
            self.table_attrs[tid].name
        );
        (key, due)
    }

    /// Begin a round of `tid` based at counter value `base`. The first entry
    /// is armed and the table waits for it.
    fn start_table_at(&self, st: &mut KernelState, tid: usize, base: Tick, sync: bool) {
        let offset = self.table_attrs[tid].entries[0].offset;
        let (key, _) = self.arm_point(st, tid, TablePoint::Entry(0), base as u64 + offset as u64);
        st.tables[tid].state = TableState::Waiting {
            sync,
            armed: Some((key, base)),
        };
    }

    pub(crate) fn autostart_table(
        &self,
        st: &mut KernelState,
        tid: usize,
        start: crate::cfg::TableStart,
    ) {
        let cid = self.table_attrs[tid].counter.0;
        let base = match start {
            crate::cfg::TableStart::Rel(offset) => {
                ((st.counters[cid].value as u64 + offset as u64) % self.modulus(cid)) as Tick
            }
            crate::cfg::TableStart::Abs(at) => at,
        };
        self.start_table_at(st, tid, base, false);
    }

    /// An expiry point of table `tid` was reached: arm the follower, then run
    /// the point's actions, or wind up the round.
    pub(crate) fn fire_table_point<'a>(
        &'a self,
        mut guard: Guard<'a>,
        cid: usize,
        tid: usize,
        point: TablePoint,
    ) -> Guard<'a> {
        let attr = &self.table_attrs[tid];
        debug_assert_eq!(attr.counter.0, cid);
        let (sync, base) = match guard.tables[tid].state {
            TableState::Waiting {
                sync,
                armed: Some((_, base)),
            } => (sync, base),
            TableState::Running { sync, base, .. } => (sync, base),
            _ => {
                debug_assert!(false, "expiry fired for a stopped table");
                return guard;
            }
        };

        match point {
            TablePoint::Entry(i) => {
                let next = if i + 1 < attr.entries.len() {
                    Some((
                        TablePoint::Entry(i + 1),
                        base as u64 + attr.entries[i + 1].offset as u64,
                    ))
                } else if attr.entries[i].offset < attr.duration {
                    Some((TablePoint::RoundEnd, base as u64 + attr.duration as u64))
                } else {
                    // The final point sits on the round boundary; the round
                    // ends on this very tick, so arming it would only come
                    // due after a full counter wrap.
                    None
                };
                match next {
                    Some((next, due)) => {
                        let (key, _) = self.arm_point(&mut guard, tid, next, due);
                        guard.tables[tid].state = TableState::Running { sync, key, base };
                    }
                    None => {
                        guard = self.finish_round(guard, tid, sync, base);
                    }
                }
                for action in &attr.entries[i].actions {
                    guard = self.run_action(guard, action);
                }
            }
            TablePoint::RoundEnd => {
                guard = self.finish_round(guard, tid, sync, base);
            }
        }
        guard
    }

    /// Wind up the round of `tid` that began at `base`: repeat, stop, or
    /// hand over to the successor table.
    fn finish_round<'a>(
        &'a self,
        mut guard: Guard<'a>,
        tid: usize,
        sync: bool,
        base: Tick,
    ) -> Guard<'a> {
        let attr = &self.table_attrs[tid];
        let cid = attr.counter.0;
        let new_base = ((base as u64 + attr.duration as u64) % self.modulus(cid)) as Tick;
        match attr.on_end {
            TableEnd::Repeat => {
                let offset = attr.entries[0].offset;
                let (key, _) = self.arm_point(
                    &mut guard,
                    tid,
                    TablePoint::Entry(0),
                    new_base as u64 + offset as u64,
                );
                guard.tables[tid].state = TableState::Running {
                    sync,
                    key,
                    base: new_base,
                };
            }
            TableEnd::Stop => {
                log::debug!("table {} ran out", attr.name);
                guard.tables[tid].state = TableState::Stopped;
            }
            TableEnd::ChainTo(succ) => {
                guard.tables[tid].state = TableState::Stopped;
                let succ = succ.0;
                if !matches!(guard.tables[succ].state, TableState::Stopped) {
                    log::warn!(
                        "table {}: successor {} is not stopped",
                        attr.name,
                        self.table_attrs[succ].name
                    );
                    guard.deferred_errors.push(Error::State);
                    return guard;
                }
                // The successor continues seamlessly where the
                // predecessor's last round ended.
                log::debug!("table {} chains to {}", attr.name, self.table_attrs[succ].name);
                let offset = self.table_attrs[succ].entries[0].offset;
                let (key, _) = self.arm_point(
                    &mut guard,
                    succ,
                    TablePoint::Entry(0),
                    new_base as u64 + offset as u64,
                );
                guard.tables[succ].state = TableState::Running {
                    sync,
                    key,
                    base: new_base,
                };
            }
        }
        guard
    }

    fn check_table_id(&self, table: ScheduleTableId) -> Result<usize> {
        if table.0 >= self.table_attrs.len() {
            Err(Error::BadId)
        } else {
            Ok(table.0)
        }
    }

    /// Start `table` `offset` ticks from the counter's current value.
    pub fn start_table_rel(&self, table: ScheduleTableId, offset: Tick) -> Result<()> {
        log::trace!("start_table_rel({table:?}, {offset})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        let cid = self.table_attrs[tid].counter.0;
        if offset == 0 || offset > self.counter_attrs[cid].max_value {
            return Err(self.fail(role, guard, Error::Value));
        }
        if !matches!(guard.tables[tid].state, TableState::Stopped) {
            return Err(self.fail(role, guard, Error::State));
        }
        let base = ((guard.counters[cid].value as u64 + offset as u64) % self.modulus(cid)) as Tick;
        self.start_table_at(&mut guard, tid, base, false);
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Start `table` based at absolute counter value `start`.
    pub fn start_table_abs(&self, table: ScheduleTableId, start: Tick) -> Result<()> {
        log::trace!("start_table_abs({table:?}, {start})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        let cid = self.table_attrs[tid].counter.0;
        if start > self.counter_attrs[cid].max_value {
            return Err(self.fail(role, guard, Error::Value));
        }
        if !matches!(guard.tables[tid].state, TableState::Stopped) {
            return Err(self.fail(role, guard, Error::State));
        }
        self.start_table_at(&mut guard, tid, start, false);
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Mark `table` for a synchronous start. Nothing is armed until
    /// [`Self::sync_table`] supplies the alignment.
    pub fn start_table_sync(&self, table: ScheduleTableId) -> Result<()> {
        log::trace!("start_table_sync({table:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        if !matches!(guard.tables[tid].state, TableState::Stopped) {
            return Err(self.fail(role, guard, Error::State));
        }
        guard.tables[tid].state = TableState::Waiting {
            sync: true,
            armed: None,
        };
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Stop `table` immediately, disarming its pending point.
    pub fn stop_table(&self, table: ScheduleTableId) -> Result<()> {
        log::trace!("stop_table({table:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        let key = match guard.tables[tid].state {
            TableState::Stopped => return Err(self.fail(role, guard, Error::NoFunc)),
            TableState::Waiting { armed, .. } => armed.map(|(key, _)| key),
            TableState::Running { key, .. } => Some(key),
        };
        if let Some(key) = key {
            let cid = self.table_attrs[tid].counter.0;
            guard.counters[cid].expiries.remove(key);
        }
        guard.tables[tid].state = TableState::Stopped;
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Align `table` so that its position within the round equals `value`,
    /// and mark it synchronous. Accepted while the table runs or awaits its
    /// synchronous start.
    pub fn sync_table(&self, table: ScheduleTableId, value: Tick) -> Result<()> {
        log::trace!("sync_table({table:?}, {value})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        let attr = &self.table_attrs[tid];
        if value >= attr.duration {
            return Err(self.fail(role, guard, Error::Value));
        }
        let cid = attr.counter.0;
        match guard.tables[tid].state {
            TableState::Waiting { sync: true, armed: None } => {}
            TableState::Running { key, .. } => {
                guard.counters[cid].expiries.remove(key);
            }
            _ => return Err(self.fail(role, guard, Error::State)),
        }
        let modulus = self.modulus(cid);
        let now = guard.counters[cid].value;
        let base = ((now as u64 + modulus - value as u64) % modulus) as Tick;
        let (next, due) = match attr.entries.iter().position(|e| e.offset > value) {
            Some(i) => (
                TablePoint::Entry(i),
                base as u64 + attr.entries[i].offset as u64,
            ),
            None => (TablePoint::RoundEnd, base as u64 + attr.duration as u64),
        };
        let (key, _) = self.arm_point(&mut guard, tid, next, due);
        guard.tables[tid].state = TableState::Running {
            sync: true,
            key,
            base,
        };
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// The current state of `table`.
    pub fn table_status(&self, table: ScheduleTableId) -> Result<TableStatus> {
        let role = current_role();
        let mut guard = self.lock_for(role);
        let tid = match self.check_table_id(table) {
            Ok(tid) => tid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        let status = match guard.tables[tid].state {
            TableState::Stopped => TableStatus::Stopped,
            TableState::Waiting { .. } => TableStatus::Waiting,
            TableState::Running { sync: false, .. } => TableStatus::Running,
            TableState::Running { sync: true, .. } => TableStatus::RunningSynchronous,
        };
        self.leave(role, &mut guard);
        drop(guard);
        Ok(status)
    }
}
