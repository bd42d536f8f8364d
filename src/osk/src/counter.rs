//! Counters: cyclic tick sources feeding alarms and schedule tables.
//!
//! A counter's value lives in `0..=max_value`; all arithmetic is modulo
//! `max_value + 1`. Armed expiry points are pooled in a [`Slab`] keyed by
//! their insertion order, which also serves as the tie-break when several
//! points fall on the same tick.
use std::sync::Arc;

use slab::Slab;

use crate::{
    cfg::{Action, CounterId, Tick},
    error::{Error, Result},
    kernel::{current_role, Guard, Kernel},
    schedtable::TablePoint,
};

/// Mutable per-counter state.
pub(crate) struct CounterCb {
    pub value: Tick,
    pub expiries: Slab<Expiry>,
}

impl CounterCb {
    pub fn new() -> Self {
        Self {
            value: 0,
            expiries: Slab::new(),
        }
    }
}

/// One armed expiry point.
pub(crate) struct Expiry {
    pub due: Tick,
    pub owner: ExpiryOwner,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExpiryOwner {
    Alarm(usize),
    Table { table: usize, point: TablePoint },
}

impl Kernel {
    pub(crate) fn modulus(&self, cid: usize) -> u64 {
        self.counter_attrs[cid].max_value as u64 + 1
    }

    /// Advance counter `cid` by `amount` ticks and fire every expiry point
    /// the advance reaches or passes, in ascending distance order.
    ///
    /// Runs with delivery masked. Points armed by the fired actions (cyclic
    /// re-arms, successor tables) are measured from the new value and are
    /// not fired by this call. A point armed exactly at the old value fires
    /// only after a full wrap.
    pub(crate) fn tick_counter<'a>(&'a self, mut guard: Guard<'a>, cid: usize, amount: Tick) -> Guard<'a> {
        debug_assert!(guard.lock_depth > 0);
        debug_assert!(amount as u64 <= self.counter_attrs[cid].max_value as u64);
        let modulus = self.modulus(cid);
        let old = guard.counters[cid].value;
        let new = ((old as u64 + amount as u64) % modulus) as Tick;
        guard.counters[cid].value = new;
        log::trace!(
            "counter {}: {} -> {}",
            self.counter_attrs[cid].name,
            old,
            new
        );

        // Snapshot the points that fall within (old, old + amount].
        let mut due: Vec<(u64, usize)> = guard.counters[cid]
            .expiries
            .iter()
            .filter_map(|(key, exp)| {
                let delta = (exp.due as u64 + modulus - old as u64) % modulus;
                (delta >= 1 && delta <= amount as u64).then_some((delta, key))
            })
            .collect();
        due.sort_unstable();

        for (_, key) in due {
            // An earlier action in this pass may have canceled the point
            // behind this key, or freed and re-armed the slot for a point
            // outside the window. Re-validate before detaching.
            let still_due = guard.counters[cid].expiries.get(key).map_or(false, |exp| {
                let delta = (exp.due as u64 + modulus - old as u64) % modulus;
                delta >= 1 && delta <= amount as u64
            });
            if !still_due {
                continue;
            }
            let exp = guard.counters[cid].expiries.remove(key);
            match exp.owner {
                ExpiryOwner::Alarm(aid) => {
                    guard = self.fire_alarm(guard, cid, aid, exp.due);
                }
                ExpiryOwner::Table { table, point } => {
                    guard = self.fire_table_point(guard, cid, table, point);
                }
            }
        }
        guard
    }

    /// Carry out one expiry action. Errors it produces are deferred to the
    /// error hook; they never abort the expiry pass.
    pub(crate) fn run_action<'a>(&'a self, mut guard: Guard<'a>, action: &Action) -> Guard<'a> {
        match action {
            Action::ActivateTask(task) => {
                if let Err(e) = self.enqueue_activation(&mut guard, task.0) {
                    guard.deferred_errors.push(e);
                }
            }
            Action::SetEvent(task, mask) => {
                if let Err(e) = self.do_set_event(&mut guard, task.0, *mask) {
                    guard.deferred_errors.push(e);
                }
            }
            Action::IncrementCounter(counter) => {
                guard = self.tick_counter(guard, counter.0, 1);
            }
            Action::Callback(f) => {
                let f = Arc::clone(f);
                // The callback must not observe the state lock held, but
                // delivery stays masked for its duration.
                drop(guard);
                f(self);
                guard = self.state.lock();
            }
        }
        guard
    }

    /// Advance `counter` by one tick from software. Expiry points due at the
    /// new value fire before this returns.
    pub fn increment_counter(&self, counter: CounterId) -> Result<()> {
        log::trace!("increment_counter({counter:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        if counter.0 >= self.counter_attrs.len() {
            return Err(self.fail(role, guard, Error::BadId));
        }
        guard.lock_depth += 1;
        guard = self.tick_counter(guard, counter.0, 1);
        guard = self.unmask_one(guard);
        guard = self.settle(role, guard);
        let errs = std::mem::take(&mut guard.deferred_errors);
        drop(guard);
        self.report_all(errs);
        Ok(())
    }

    /// The current value of `counter`.
    pub fn counter_value(&self, counter: CounterId) -> Result<Tick> {
        let role = current_role();
        let mut guard = self.lock_for(role);
        if counter.0 >= self.counter_attrs.len() {
            return Err(self.fail(role, guard, Error::BadId));
        }
        let value = guard.counters[counter.0].value;
        self.leave(role, &mut guard);
        drop(guard);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{AlarmDef, Cfg, CounterDef, TaskDef};

    fn kernel_with_counter(max: Tick) -> (std::sync::Arc<Kernel>, CounterId) {
        let mut cfg = Cfg::new();
        let c = CounterDef::new("c", max).finish(&mut cfg);
        (Kernel::new(cfg).unwrap(), c)
    }

    #[test]
    fn value_wraps_at_maximum() {
        let (kernel, c) = kernel_with_counter(9);
        {
            let mut guard = kernel.state.lock();
            guard.lock_depth = 1;
            guard.counters[c.0].value = 8;
            let guard2 = kernel.tick_counter(guard, c.0, 1);
            assert_eq!(guard2.counters[c.0].value, 9);
            let guard3 = kernel.tick_counter(guard2, c.0, 1);
            assert_eq!(guard3.counters[c.0].value, 0);
        }
    }

    #[test]
    fn repeated_ticks_cycle_through_all_values() {
        let (kernel, c) = kernel_with_counter(4);
        let mut guard = kernel.state.lock();
        guard.lock_depth = 1;
        let mut seen = Vec::new();
        for _ in 0..10 {
            guard = kernel.tick_counter(guard, c.0, 1);
            seen.push(guard.counters[c.0].value);
        }
        assert_eq!(seen, [1, 2, 3, 4, 0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn a_large_tick_crossing_the_wrap_fires_in_distance_order() {
        let mut cfg = Cfg::new();
        let c = CounterDef::new("c", 9).finish(&mut cfg);
        let ta = TaskDef::new("ta", 3, |_| {}).finish(&mut cfg);
        let tb = TaskDef::new("tb", 3, |_| {}).finish(&mut cfg);
        let near = AlarmDef::new("near", c, Action::ActivateTask(ta)).finish(&mut cfg);
        let far = AlarmDef::new("far", c, Action::ActivateTask(tb)).finish(&mut cfg);
        let kernel = Kernel::new(cfg).unwrap();

        kernel.set_abs_alarm(near, 9, 0).unwrap();
        kernel.set_abs_alarm(far, 1, 0).unwrap();
        let mut guard = kernel.state.lock();
        guard.counters[c.0].value = 7;
        guard.lock_depth = 1;

        // 7 -> 1 passes 9 (distance 2) and then wraps past 1 (distance 4)
        guard = kernel.tick_counter(guard, c.0, 4);
        assert_eq!(guard.counters[c.0].value, 1);
        assert_eq!(guard.ready.pop_highest(), Some(ta.0));
        assert_eq!(guard.ready.pop_highest(), Some(tb.0));
        assert_eq!(guard.ready.pop_highest(), None);
        guard.lock_depth = 0;
    }
}
