//! Service status codes.
use core::fmt;

/// The result type used by every kernel service.
pub type Result<T> = core::result::Result<T, Error>;

/// The status code returned by a failed kernel service call.
///
/// The variants mirror the classic OSEK `StatusType` values, with two
/// additions for protection faults detected by the kernel itself
/// ([`MissingEnd`](Self::MissingEnd) and [`DisabledInt`](Self::DisabledInt)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Error {
    /// The caller is not allowed to perform the operation on the object,
    /// or a resource is already occupied.
    Access = 1,
    /// The service was called from a context in which it is not available.
    CallLevel = 2,
    /// The object identifier does not name a configured object.
    BadId = 3,
    /// An activation would exceed the task's configured activation limit.
    Limit = 4,
    /// The operation requires an armed or held object, but the object is
    /// idle (canceling an idle alarm, releasing an unheld resource).
    NoFunc = 5,
    /// A task attempted to block or terminate while still holding a
    /// resource, or terminated with a resource held.
    Resource = 6,
    /// The object is in a state that does not admit the operation
    /// (arming an armed alarm, starting a started schedule table).
    State = 7,
    /// A parameter is outside the configured range.
    Value = 8,
    /// A task's body returned instead of terminating explicitly.
    MissingEnd = 9,
    /// The operation was attempted while a user-level interrupt lock was
    /// active, or a context ended without releasing one.
    DisabledInt = 10,
}

/// A coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object exists but is in the wrong state.
    State,
    /// A quantity exceeded a configured bound.
    Limit,
    /// The identifier does not refer to any configured object.
    Identity,
    /// A protection rule was violated.
    Protection,
}

impl Error {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::Access | Self::CallLevel | Self::NoFunc | Self::State => ErrorKind::State,
            Self::Limit | Self::Value => ErrorKind::Limit,
            Self::BadId => ErrorKind::Identity,
            Self::Resource | Self::MissingEnd | Self::DisabledInt => ErrorKind::Protection,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Access => "E_OS_ACCESS",
            Self::CallLevel => "E_OS_CALLEVEL",
            Self::BadId => "E_OS_ID",
            Self::Limit => "E_OS_LIMIT",
            Self::NoFunc => "E_OS_NOFUNC",
            Self::Resource => "E_OS_RESOURCE",
            Self::State => "E_OS_STATE",
            Self::Value => "E_OS_VALUE",
            Self::MissingEnd => "E_OS_MISSINGEND",
            Self::DisabledInt => "E_OS_DISABLEDINT",
        };
        f.write_str(name)
    }
}

impl std::error::Error for Error {}
