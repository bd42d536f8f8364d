//! Alarms: single-action expiry points on a counter.
use crate::{
    cfg::{AlarmId, Tick},
    counter::{Expiry, ExpiryOwner},
    error::{Error, Result},
    kernel::{current_role, Guard, Kernel, KernelState},
};

/// Mutable per-alarm state.
pub(crate) struct AlarmCb {
    pub state: AlarmState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlarmState {
    Idle,
    Armed {
        /// Key of the expiry point in the counter's pool.
        key: usize,
        due: Tick,
        /// Re-arm period; zero for one-shot.
        cycle: Tick,
    },
}

impl AlarmCb {
    pub fn new() -> Self {
        Self {
            state: AlarmState::Idle,
        }
    }
}

impl Kernel {
    fn arm_alarm(&self, st: &mut KernelState, aid: usize, due: Tick, cycle: Tick) {
        let cid = self.alarm_attrs[aid].counter.0;
        let key = st.counters[cid].expiries.insert(Expiry {
            due,
            owner: ExpiryOwner::Alarm(aid),
        });
        st.alarms[aid].state = AlarmState::Armed { key, due, cycle };
        log::debug!(
            "alarm {} armed for {} (cycle {})",
            self.alarm_attrs[aid].name,
            due,
            cycle
        );
    }

    pub(crate) fn autostart_alarm(&self, st: &mut KernelState, aid: usize, offset: Tick, cycle: Tick) {
        let cid = self.alarm_attrs[aid].counter.0;
        let modulus = self.modulus(cid);
        let due = ((st.counters[cid].value as u64 + offset as u64) % modulus) as Tick;
        self.arm_alarm(st, aid, due, cycle);
    }

    /// The alarm's expiry point was reached: re-arm a cyclic alarm, retire a
    /// one-shot one, then carry out the configured action.
    pub(crate) fn fire_alarm<'a>(
        &'a self,
        mut guard: Guard<'a>,
        cid: usize,
        aid: usize,
        due: Tick,
    ) -> Guard<'a> {
        log::debug!("alarm {} expired", self.alarm_attrs[aid].name);
        let cycle = match guard.alarms[aid].state {
            AlarmState::Armed { cycle, .. } => cycle,
            AlarmState::Idle => {
                debug_assert!(false, "expiry fired for an idle alarm");
                return guard;
            }
        };
        if cycle > 0 {
            let modulus = self.modulus(cid);
            let next = ((due as u64 + cycle as u64) % modulus) as Tick;
            self.arm_alarm(&mut guard, aid, next, cycle);
        } else {
            guard.alarms[aid].state = AlarmState::Idle;
        }
        self.run_action(guard, &self.alarm_attrs[aid].action)
    }

    fn check_alarm_id(&self, alarm: AlarmId) -> Result<usize> {
        if alarm.0 >= self.alarm_attrs.len() {
            Err(Error::BadId)
        } else {
            Ok(alarm.0)
        }
    }

    /// Arm `alarm` to expire `increment` ticks from the counter's current
    /// value, re-arming every `cycle` ticks (zero for one-shot).
    pub fn set_rel_alarm(&self, alarm: AlarmId, increment: Tick, cycle: Tick) -> Result<()> {
        log::trace!("set_rel_alarm({alarm:?}, {increment}, {cycle})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let aid = match self.check_alarm_id(alarm) {
            Ok(aid) => aid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        let cid = self.alarm_attrs[aid].counter.0;
        let max = self.counter_attrs[cid].max_value;
        if increment == 0 || increment > max || cycle > max {
            return Err(self.fail(role, guard, Error::Value));
        }
        if guard.alarms[aid].state != AlarmState::Idle {
            return Err(self.fail(role, guard, Error::State));
        }
        let modulus = self.modulus(cid);
        let due = ((guard.counters[cid].value as u64 + increment as u64) % modulus) as Tick;
        self.arm_alarm(&mut guard, aid, due, cycle);
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Arm `alarm` to expire when the counter next reaches the absolute
    /// value `start`. A `start` equal to the current value expires only
    /// after a full wrap of the counter.
    pub fn set_abs_alarm(&self, alarm: AlarmId, start: Tick, cycle: Tick) -> Result<()> {
        log::trace!("set_abs_alarm({alarm:?}, {start}, {cycle})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let aid = match self.check_alarm_id(alarm) {
            Ok(aid) => aid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        if guard.user_all || guard.user_suspend > 0 {
            return Err(self.fail(role, guard, Error::DisabledInt));
        }
        let cid = self.alarm_attrs[aid].counter.0;
        let max = self.counter_attrs[cid].max_value;
        if start > max || cycle > max {
            return Err(self.fail(role, guard, Error::Value));
        }
        if guard.alarms[aid].state != AlarmState::Idle {
            return Err(self.fail(role, guard, Error::State));
        }
        self.arm_alarm(&mut guard, aid, start, cycle);
        self.leave(role, &mut guard);
        drop(guard);
        Ok(())
    }

    /// Disarm `alarm`. Canceling an idle alarm is a `NoFunc` error.
    pub fn cancel_alarm(&self, alarm: AlarmId) -> Result<()> {
        log::trace!("cancel_alarm({alarm:?})");
        let role = current_role();
        let mut guard = self.lock_for(role);
        let aid = match self.check_alarm_id(alarm) {
            Ok(aid) => aid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        match guard.alarms[aid].state {
            AlarmState::Idle => Err(self.fail(role, guard, Error::NoFunc)),
            AlarmState::Armed { key, .. } => {
                let cid = self.alarm_attrs[aid].counter.0;
                guard.counters[cid].expiries.remove(key);
                guard.alarms[aid].state = AlarmState::Idle;
                self.leave(role, &mut guard);
                drop(guard);
                Ok(())
            }
        }
    }

    /// Ticks left until `alarm` expires. Querying an idle alarm is a
    /// `NoFunc` error. An expiry a full counter cycle away reports the
    /// counter's maximum value.
    pub fn alarm_remaining(&self, alarm: AlarmId) -> Result<Tick> {
        let role = current_role();
        let mut guard = self.lock_for(role);
        let aid = match self.check_alarm_id(alarm) {
            Ok(aid) => aid,
            Err(e) => return Err(self.fail(role, guard, e)),
        };
        match guard.alarms[aid].state {
            AlarmState::Idle => Err(self.fail(role, guard, Error::NoFunc)),
            AlarmState::Armed { due, .. } => {
                let cid = self.alarm_attrs[aid].counter.0;
                let modulus = self.modulus(cid);
                let value = guard.counters[cid].value;
                let delta = (due as u64 + modulus - value as u64) % modulus;
                let remaining = if delta == 0 {
                    self.counter_attrs[cid].max_value
                } else {
                    delta as Tick
                };
                self.leave(role, &mut guard);
                drop(guard);
                Ok(remaining)
            }
        }
    }
}
