//! Status taxonomy, error types, and the two call styles.
//!
//! Every fallible operation in the engine computes a [`Status`]: a small,
//! stable wire code that can be logged or passed across processes. Failures
//! are carried by [`ApparatusError`], whose variants keep enough context to be
//! actionable while always mapping back onto exactly one failure status.
//!
//! ## Goals
//! * **Stable codes:** [`Status`] values never change meaning.
//! * **Composable:** [`Status::combine`] and [`combine_outcomes`] fold many
//!   per-row results into one, keeping the first failure and otherwise the
//!   least trivial success.
//! * **Two styles:** the *polite* style is a plain [`ApparatusResult`]; the
//!   *harsh* style panics on failure for hot paths whose inputs were verified
//!   up front. [`Paradigm`] selects the style at compile time.
//!
//! ## Reporting
//! Failures the caller is expected to handle (invalid arguments, wrong types,
//! lock misuse, ...) are forwarded to a process-wide [`ErrorSink`] when they are
//! raised through [`ApparatusError::surfaced`]. The default sink writes them to
//! the `log` facade at error level.

use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;
use thiserror::Error;

use crate::engine::types::SubjectID;


/// Outcome status codes.
///
/// Values `>= 0` are successes, values `< 0` are failures. The numeric values
/// are part of the wire format.

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation had nothing to do.
    Noop = 0,
    /// The operation completed.
    Success = 1,
    /// An existing resource was reused instead of created.
    Reused = 2,
    /// The operation completed over an empty set.
    NoItems = 3,
    /// The operation was queued and will complete later.
    Deferred = 4,
    /// Unspecified failure.
    Error = -1,
    /// An argument was invalid.
    InvalidArgument = -2,
    /// A required argument was absent.
    NullArgument = -3,
    /// An index was out of range.
    OutOfRange = -4,
    /// An iteration has no more items.
    NoMore = -5,
    /// A resource is not available right now.
    NotAvailable = -6,
    /// The target does not exist (e.g. a stale handle).
    Missing = -7,
    /// The operation is not valid for the target.
    InvalidOperation = -8,
    /// The engine is in a state that forbids the operation.
    InvalidState = -9,
    /// A value had the wrong type.
    WrongType = -10,
    /// The operation is not supported.
    UnsupportedOperation = -11,
    /// The operation has no implementation.
    NoImplementation = -12,
    /// Two requests conflict with each other.
    Conflict = -13,
    /// An internal consistency check failed.
    SanityCheckFailed = -14,
    /// The caller is not allowed to do this.
    NoPermission = -15,
    /// A configured limit was hit.
    OutOfLimit = -16,
    /// An allocation failed.
    NoMemory = -17,
    /// Unrecoverable failure.
    FatalError = -18,
}

impl Status {
    /// Every status, in wire-code order from highest to lowest.
    pub const ALL: [Status; 23] = [
        Status::Deferred,
        Status::NoItems,
        Status::Reused,
        Status::Success,
        Status::Noop,
        Status::Error,
        Status::InvalidArgument,
        Status::NullArgument,
        Status::OutOfRange,
        Status::NoMore,
        Status::NotAvailable,
        Status::Missing,
        Status::InvalidOperation,
        Status::InvalidState,
        Status::WrongType,
        Status::UnsupportedOperation,
        Status::NoImplementation,
        Status::Conflict,
        Status::SanityCheckFailed,
        Status::NoPermission,
        Status::OutOfLimit,
        Status::NoMemory,
        Status::FatalError,
    ];

    /// Returns the wire code.
    #[inline]
    pub const fn code(self) -> i8 {
        self as i8
    }

    /// Resolves a wire code, `None` for unknown codes.
    pub fn from_code(code: i8) -> Option<Status> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }

    /// `true` for codes `>= 0`.
    #[inline]
    pub const fn is_success(self) -> bool {
        self.code() >= 0
    }

    /// `true` for codes `< 0`.
    #[inline]
    pub const fn is_failure(self) -> bool {
        self.code() < 0
    }

    /// Combines two statuses.
    ///
    /// The first failure wins. Among successes the less trivial one wins, so
    /// `Success` beats `Noop`; ties keep `self`.
    #[inline]
    pub const fn combine(self, other: Status) -> Status {
        if self.is_failure() {
            return self;
        }
        if other.is_failure() {
            return other;
        }
        if matches!(self, Status::Noop) {
            return other;
        }
        self
    }

    /// Whether failures with this status go to the report sink.
    pub const fn is_reportable(self) -> bool {
        matches!(
            self,
            Status::InvalidArgument
                | Status::InvalidState
                | Status::OutOfRange
                | Status::WrongType
                | Status::NoMemory
                | Status::Conflict
                | Status::SanityCheckFailed
                | Status::FatalError
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}


/// Failure raised by an engine operation.
///
/// Each variant maps onto exactly one failing [`Status`] through
/// [`ApparatusError::status`].

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApparatusError {
    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required argument was absent.
    #[error("null argument: {0}")]
    NullArgument(&'static str),

    /// An index was outside `[0, len)`.
    #[error("index {index} out of range (length {len})")]
    OutOfRange {
        /// Offending index.
        index: usize,
        /// Valid length.
        len: usize,
    },

    /// The handle does not refer to a live subject.
    #[error("subject {0:#018x} is not valid")]
    StaleSubject(SubjectID),

    /// A looked-up item does not exist.
    #[error("missing: {0}")]
    Missing(String),

    /// The engine's current state forbids the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation makes no sense for its target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A typed access named a different type than the stored one.
    #[error("wrong type: expected `{expected}`, found `{actual}`")]
    WrongType {
        /// Type the storage holds.
        expected: &'static str,
        /// Type the caller asked for.
        actual: &'static str,
    },

    /// The operation is not supported for this input.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Liquid and solid locks were mixed, or a writer re-entered.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A protected resource (e.g. a system flag) was touched.
    #[error("no permission: {0}")]
    NoPermission(String),

    /// A configured limit was exceeded.
    #[error("limit of {limit} {what} reached")]
    OutOfLimit {
        /// What ran out.
        what: &'static str,
        /// The limit.
        limit: usize,
    },

    /// Allocating storage failed.
    #[error("failed to allocate {bytes} bytes")]
    NoMemory {
        /// Requested size.
        bytes: usize,
    },

    /// An internal invariant did not hold.
    #[error("sanity check failed: {0}")]
    SanityCheckFailed(String),

    /// Encoding or decoding a record failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Lock discipline was broken in a way that cannot be recovered.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A user functor or external collaborator reported a failure status.
    #[error("{status} reported: {message}")]
    Reported {
        /// The reported status.
        status: Status,
        /// Free-form context.
        message: String,
    },
}

impl ApparatusError {
    /// Maps the error onto its wire status.
    pub fn status(&self) -> Status {
        match self {
            ApparatusError::InvalidArgument(_) => Status::InvalidArgument,
            ApparatusError::NullArgument(_) => Status::NullArgument,
            ApparatusError::OutOfRange { .. } => Status::OutOfRange,
            ApparatusError::StaleSubject(_) | ApparatusError::Missing(_) => Status::Missing,
            ApparatusError::InvalidState(_) => Status::InvalidState,
            ApparatusError::InvalidOperation(_) => Status::InvalidOperation,
            ApparatusError::WrongType { .. } => Status::WrongType,
            ApparatusError::UnsupportedOperation(_) => Status::UnsupportedOperation,
            ApparatusError::Conflict(_) => Status::Conflict,
            ApparatusError::NoPermission(_) => Status::NoPermission,
            ApparatusError::OutOfLimit { .. } => Status::OutOfLimit,
            ApparatusError::NoMemory { .. } => Status::NoMemory,
            ApparatusError::SanityCheckFailed(_) => Status::SanityCheckFailed,
            ApparatusError::Codec(_) => Status::Error,
            ApparatusError::Fatal(_) => Status::FatalError,
            ApparatusError::Reported { status, .. } => *status,
        }
    }

    /// Builds an error from a failing status reported by user code.
    ///
    /// Success statuses are mapped to `SanityCheckFailed`, since they do not
    /// describe a failure.
    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        if status.is_success() {
            return ApparatusError::SanityCheckFailed(format!(
                "success status {status} used as a failure"
            ));
        }
        ApparatusError::Reported { status, message: message.into() }
    }

    /// Forwards the error to the report sink when its status is one that
    /// callers must see, then returns it unchanged.
    pub fn surfaced(self) -> Self {
        let status = self.status();
        if status.is_reportable() {
            report_error(status, &self.to_string());
        }
        self
    }
}

/// Result type used throughout the engine.
pub type ApparatusResult<T> = Result<T, ApparatusError>;

/// Polite payload-less result: the `Ok` side is always a success status.
pub type Outcome = ApparatusResult<Status>;

/// Combines two outcomes: first failure wins, otherwise [`Status::combine`].
#[inline]
pub fn combine_outcomes(first: Outcome, second: Outcome) -> Outcome {
    match (first, second) {
        (Err(error), _) => Err(error),
        (Ok(_), Err(error)) => Err(error),
        (Ok(a), Ok(b)) => Ok(a.combine(b)),
    }
}


/// Conversion of functor return values into an [`Outcome`].
///
/// Lets per-row functors return nothing (`()` counts as `Success`), a bare
/// [`Status`], or a full result.

pub trait IntoOutcome {
    /// Converts `self` into an outcome.
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    #[inline]
    fn into_outcome(self) -> Outcome {
        Ok(Status::Success)
    }
}

impl IntoOutcome for Status {
    #[inline]
    fn into_outcome(self) -> Outcome {
        if self.is_failure() {
            Err(ApparatusError::from_status(self, "functor returned a failure status"))
        } else {
            Ok(self)
        }
    }
}

impl IntoOutcome for Outcome {
    #[inline]
    fn into_outcome(self) -> Outcome {
        self
    }
}

impl IntoOutcome for ApparatusResult<()> {
    #[inline]
    fn into_outcome(self) -> Outcome {
        self.map(|()| Status::Success)
    }
}


/// Harsh-style access to results: panics on failure.

pub trait HarshResult<T> {
    /// Returns the payload or panics with the failure status and message.
    fn harsh(self) -> T;
}

impl<T> HarshResult<T> for ApparatusResult<T> {
    #[inline]
    #[track_caller]
    fn harsh(self) -> T {
        match self {
            Ok(value) => value,
            Err(error) => panic!("harsh call failed with {}: {error}", error.status()),
        }
    }
}

/// Compile-time selection of the call style for generic entry points.
pub trait Paradigm {
    /// What an entry point returns under this paradigm.
    type Output<T>;

    /// Converts the engine's internal result into the paradigm's output.
    fn deliver<T>(result: ApparatusResult<T>) -> Self::Output<T>;
}

/// Polite paradigm: results are returned to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Polite;

/// Harsh paradigm: failures panic, payloads are returned bare.
#[derive(Debug, Clone, Copy, Default)]
pub struct Harsh;

impl Paradigm for Polite {
    type Output<T> = ApparatusResult<T>;

    #[inline]
    fn deliver<T>(result: ApparatusResult<T>) -> Self::Output<T> {
        result
    }
}

impl Paradigm for Harsh {
    type Output<T> = T;

    #[inline]
    #[track_caller]
    fn deliver<T>(result: ApparatusResult<T>) -> Self::Output<T> {
        result.harsh()
    }
}


/// Receiver of formatted failure reports.
pub trait ErrorSink: Send + Sync {
    /// Called once per surfaced failure.
    fn report(&self, status: Status, message: &str);
}

/// Default sink: forwards reports to `log::error!`.
#[derive(Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, status: Status, message: &str) {
        log::error!(target: "apparatus", "[{status}] {message}");
    }
}

fn sink() -> &'static RwLock<Box<dyn ErrorSink>> {
    static ERROR_SINK: OnceLock<RwLock<Box<dyn ErrorSink>>> = OnceLock::new();
    ERROR_SINK.get_or_init(|| RwLock::new(Box::new(LogSink)))
}

/// Replaces the process-wide report sink, returning the previous one.
pub fn set_error_sink(new_sink: Box<dyn ErrorSink>) -> Box<dyn ErrorSink> {
    std::mem::replace(&mut *sink().write(), new_sink)
}

/// Sends a report to the current sink.
pub fn report_error(status: Status, message: &str) {
    sink().read().report(status, message);
}
