//! A hosted, fixed-priority real-time executive in the OSEK/VDX mold.
//!
//! The kernel schedules statically configured *processes* (tasks and
//! category-2 ISRs) on one virtual processor, emulated with one host thread
//! per process, of which at most one is ever runnable. On top of that sit
//! priority-ceiling resources, task events, and a counter subsystem driving
//! alarms and schedule tables.
//!
//! A system is put together with [`Cfg`] and the definer types, frozen into
//! a [`Kernel`] and run with [`Kernel::start`]:
//!
//! ```rust,no_run
//! use osk::{Cfg, Kernel, TaskDef};
//!
//! let mut cfg = Cfg::new();
//! let t = TaskDef::new("main", 4, |kernel| {
//!     println!("hello");
//!     kernel.shutdown(Ok(()));
//! })
//! .auto_start()
//! .finish(&mut cfg);
//! let _ = t;
//!
//! let kernel = Kernel::new(cfg).unwrap();
//! kernel.start().unwrap();
//! ```
#![cfg_attr(
    not(unix),
    doc = "**This crate only supports Unix-like operating systems.**"
)]

#[cfg(not(unix))]
compile_error!("this crate requires a Unix-like host for its context emulation");

mod alarm;
mod cfg;
mod context;
mod counter;
mod error;
mod event;
mod kernel;
mod resource;
mod schedtable;
mod task;
mod threading;

pub use crate::{
    cfg::{
        Action, AlarmDef, AlarmId, Cfg, CounterDef, CounterId, EntryFn, EventMask, IsrDef, IsrId,
        ResourceDef, ResourceId, ScheduleTableDef, ScheduleTableId, TaskDef, TaskId, Tick,
        MAX_HELD_RESOURCES,
    },
    error::{Error, ErrorKind, Result},
    kernel::Kernel,
    schedtable::TableStatus,
    task::TaskState,
};
