//! Static system configuration.
//!
//! Every kernel object (task, ISR, resource, counter, alarm, schedule table)
//! is declared up front by finishing a definer object into a [`Cfg`], which
//! is then frozen by [`Kernel::new`](crate::Kernel::new). No objects can be
//! created after the kernel has started.
use std::{sync::Arc, time::Duration};

use crate::{error::Error, Kernel};

/// A point on a counter's cyclic axis.
pub type Tick = u32;

/// A set of task events, one per bit.
pub type EventMask = u32;

/// The body of a task or ISR.
pub type EntryFn = Box<dyn Fn(&Kernel) + Send + Sync>;

/// Maximum number of resources a single process may hold at once.
pub const MAX_HELD_RESOURCES: usize = 16;

macro_rules! define_id {
    ($( #[doc = $doc:literal] $Name:ident, )*) => {
        $(
            #[doc = $doc]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $Name(pub(crate) usize);
        )*
    };
}

define_id! {
    /// Identifies a configured task.
    TaskId,
    /// Identifies a configured category-2 interrupt service routine.
    IsrId,
    /// Identifies a configured resource.
    ResourceId,
    /// Identifies a configured counter.
    CounterId,
    /// Identifies a configured alarm.
    AlarmId,
    /// Identifies a configured schedule table.
    ScheduleTableId,
}

/// What to do when an alarm or a schedule-table expiry point fires.
#[derive(Clone)]
pub enum Action {
    /// Activate the task, as if by `activate_task`. An activation beyond the
    /// task's limit is reported through the error hook and dropped.
    ActivateTask(TaskId),
    /// Set events on the task. Reported and dropped if the task is suspended.
    SetEvent(TaskId, EventMask),
    /// Advance another counter by one tick, within the same expiry pass.
    IncrementCounter(CounterId),
    /// Run an application callback. The callback runs with notification
    /// delivery masked but may not call blocking services.
    Callback(Arc<dyn Fn(&Kernel) + Send + Sync>),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActivateTask(t) => f.debug_tuple("ActivateTask").field(t).finish(),
            Self::SetEvent(t, m) => f.debug_tuple("SetEvent").field(t).field(m).finish(),
            Self::IncrementCounter(c) => f.debug_tuple("IncrementCounter").field(c).finish(),
            Self::Callback(_) => f.write_str("Callback(_)"),
        }
    }
}

pub(crate) struct TaskAttr {
    pub name: String,
    pub priority: u8,
    pub max_activations: u32,
    pub auto_start: bool,
    pub resources: Vec<ResourceId>,
    pub entry: EntryFn,
}

pub(crate) struct IsrAttr {
    pub name: String,
    pub priority: u8,
    pub source: u32,
    pub resources: Vec<ResourceId>,
    pub entry: EntryFn,
}

pub(crate) struct ResourceAttr {
    pub name: String,
}

pub(crate) struct CounterAttr {
    pub name: String,
    pub max_value: Tick,
    pub source: Option<u32>,
    pub drive_period: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TableStart {
    Rel(Tick),
    Abs(Tick),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableEnd {
    Stop,
    Repeat,
    ChainTo(ScheduleTableId),
}

pub(crate) struct TableEntry {
    pub offset: Tick,
    pub actions: Vec<Action>,
}

pub(crate) struct TableAttr {
    pub name: String,
    pub counter: CounterId,
    pub duration: Tick,
    pub entries: Vec<TableEntry>,
    pub on_end: TableEnd,
    pub autostart: Option<TableStart>,
}

pub(crate) struct AlarmAttr {
    pub name: String,
    pub counter: CounterId,
    pub action: Action,
    pub autostart: Option<(Tick, Tick)>,
}

type HookFn = Box<dyn Fn(&Kernel) + Send + Sync>;
type ErrorHookFn = Box<dyn Fn(&Kernel, Error) + Send + Sync>;

/// The collection of object definitions a kernel is built from.
#[derive(Default)]
pub struct Cfg {
    pub(crate) tasks: Vec<TaskAttr>,
    pub(crate) isrs: Vec<IsrAttr>,
    pub(crate) resources: Vec<ResourceAttr>,
    pub(crate) counters: Vec<CounterAttr>,
    pub(crate) alarms: Vec<AlarmAttr>,
    pub(crate) tables: Vec<TableAttr>,
    pub(crate) startup_hook: Option<HookFn>,
    pub(crate) shutdown_hook: Option<HookFn>,
    pub(crate) error_hook: Option<ErrorHookFn>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the application startup hook, run before the first dispatch.
    pub fn startup_hook(&mut self, f: impl Fn(&Kernel) + Send + Sync + 'static) -> &mut Self {
        self.startup_hook = Some(Box::new(f));
        self
    }

    /// Install the application shutdown hook, run once during shutdown.
    pub fn shutdown_hook(&mut self, f: impl Fn(&Kernel) + Send + Sync + 'static) -> &mut Self {
        self.shutdown_hook = Some(Box::new(f));
        self
    }

    /// Install the application error hook. Every recoverable service error
    /// is passed to it before being returned to the caller.
    pub fn error_hook(&mut self, f: impl Fn(&Kernel, Error) + Send + Sync + 'static) -> &mut Self {
        self.error_hook = Some(Box::new(f));
        self
    }

    /// Make `succ` the successor of `pred`: when `pred` finishes its final
    /// round, `succ` starts at the point where `pred` ended.
    pub fn chain_table(&mut self, pred: ScheduleTableId, succ: ScheduleTableId) -> &mut Self {
        self.tables[pred.0].on_end = TableEnd::ChainTo(succ);
        self
    }
}

/// Definer for a task.
pub struct TaskDef {
    attr: TaskAttr,
}

impl TaskDef {
    pub fn new(
        name: impl Into<String>,
        priority: u8,
        entry: impl Fn(&Kernel) + Send + Sync + 'static,
    ) -> Self {
        Self {
            attr: TaskAttr {
                name: name.into(),
                priority,
                max_activations: 1,
                auto_start: false,
                resources: Vec::new(),
                entry: Box::new(entry),
            },
        }
    }

    /// Activate the task once during startup.
    pub fn auto_start(mut self) -> Self {
        self.attr.auto_start = true;
        self
    }

    /// Allow up to `n` concurrent activation requests (default 1).
    pub fn max_activations(mut self, n: u32) -> Self {
        self.attr.max_activations = n;
        self
    }

    /// Declare that the task may lock `resource`.
    pub fn resource(mut self, resource: ResourceId) -> Self {
        self.attr.resources.push(resource);
        self
    }

    pub fn finish(self, cfg: &mut Cfg) -> TaskId {
        cfg.tasks.push(self.attr);
        TaskId(cfg.tasks.len() - 1)
    }
}

/// Definer for a category-2 ISR, triggered by notification source `source`.
pub struct IsrDef {
    attr: IsrAttr,
}

impl IsrDef {
    pub fn new(
        name: impl Into<String>,
        priority: u8,
        source: u32,
        entry: impl Fn(&Kernel) + Send + Sync + 'static,
    ) -> Self {
        Self {
            attr: IsrAttr {
                name: name.into(),
                priority,
                source,
                resources: Vec::new(),
                entry: Box::new(entry),
            },
        }
    }

    /// Declare that the ISR may lock `resource`.
    pub fn resource(mut self, resource: ResourceId) -> Self {
        self.attr.resources.push(resource);
        self
    }

    pub fn finish(self, cfg: &mut Cfg) -> IsrId {
        cfg.isrs.push(self.attr);
        IsrId(cfg.isrs.len() - 1)
    }
}

/// Definer for a resource. The ceiling priority is computed from the
/// declared users, so resources are defined before the processes using them.
pub struct ResourceDef {
    attr: ResourceAttr,
}

impl ResourceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            attr: ResourceAttr { name: name.into() },
        }
    }

    pub fn finish(self, cfg: &mut Cfg) -> ResourceId {
        cfg.resources.push(self.attr);
        ResourceId(cfg.resources.len() - 1)
    }
}

/// Definer for a counter with values in `0..=max_value`.
pub struct CounterDef {
    attr: CounterAttr,
}

impl CounterDef {
    pub fn new(name: impl Into<String>, max_value: Tick) -> Self {
        Self {
            attr: CounterAttr {
                name: name.into(),
                max_value,
                source: None,
                drive_period: None,
            },
        }
    }

    /// Bind the counter to a notification source: each raise of `source`
    /// advances the counter by one tick.
    pub fn source(mut self, source: u32) -> Self {
        self.attr.source = Some(source);
        self
    }

    /// Spawn a host timer thread raising the counter's source every
    /// `period`. Requires [`source`](Self::source).
    pub fn drive_every(mut self, period: Duration) -> Self {
        self.attr.drive_period = Some(period);
        self
    }

    pub fn finish(self, cfg: &mut Cfg) -> CounterId {
        cfg.counters.push(self.attr);
        CounterId(cfg.counters.len() - 1)
    }
}

/// Definer for an alarm on `counter`.
pub struct AlarmDef {
    attr: AlarmAttr,
}

impl AlarmDef {
    pub fn new(name: impl Into<String>, counter: CounterId, action: Action) -> Self {
        Self {
            attr: AlarmAttr {
                name: name.into(),
                counter,
                action,
                autostart: None,
            },
        }
    }

    /// Arm the alarm during startup, `offset` ticks ahead, repeating every
    /// `cycle` ticks (`cycle == 0` for one-shot).
    pub fn auto_start_rel(mut self, offset: Tick, cycle: Tick) -> Self {
        self.attr.autostart = Some((offset, cycle));
        self
    }

    pub fn finish(self, cfg: &mut Cfg) -> AlarmId {
        cfg.alarms.push(self.attr);
        AlarmId(cfg.alarms.len() - 1)
    }
}

/// Definer for a schedule table on `counter` with round length `duration`.
pub struct ScheduleTableDef {
    attr: TableAttr,
}

impl ScheduleTableDef {
    pub fn new(name: impl Into<String>, counter: CounterId, duration: Tick) -> Self {
        Self {
            attr: TableAttr {
                name: name.into(),
                counter,
                duration,
                entries: Vec::new(),
                on_end: TableEnd::Stop,
                autostart: None,
            },
        }
    }

    /// Add `action` at `offset` ticks from the start of each round.
    /// Offsets must be added in ascending order.
    pub fn entry(mut self, offset: Tick, action: Action) -> Self {
        match self.attr.entries.last_mut() {
            Some(last) if last.offset == offset => last.actions.push(action),
            _ => self.attr.entries.push(TableEntry {
                offset,
                actions: vec![action],
            }),
        }
        self
    }

    /// Restart the table from offset zero at the end of each round.
    pub fn repeating(mut self) -> Self {
        self.attr.on_end = TableEnd::Repeat;
        self
    }

    /// Start the table during startup, `offset` ticks ahead.
    pub fn auto_start_rel(mut self, offset: Tick) -> Self {
        self.attr.autostart = Some(TableStart::Rel(offset));
        self
    }

    /// Start the table during startup at absolute counter value `start`.
    pub fn auto_start_abs(mut self, start: Tick) -> Self {
        self.attr.autostart = Some(TableStart::Abs(start));
        self
    }

    pub fn finish(self, cfg: &mut Cfg) -> ScheduleTableId {
        cfg.tables.push(self.attr);
        ScheduleTableId(cfg.tables.len() - 1)
    }
}
