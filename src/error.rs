//! Worker-side error reporting.
//!
//! The worker never aborts on an error: it records an [`ErrorReport`] in a
//! shared sink and keeps draining the task queue so that shutdown stays
//! reachable. Producers observe errors after any barrier operation by
//! draining the sink.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

/// An error reported by the device or the presentation engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum DeviceError {
    #[error("device lost")]
    DeviceLost,
    /// A fence wait ran past the configured timeout. Unrecoverable; treated
    /// like a lost device.
    #[error("fence wait timed out")]
    Timeout,
    #[error("out of device memory")]
    OutOfMemory,
    #[error("presentation surface lost")]
    SurfaceLost,
    /// Any other backend result code, carried raw.
    #[error("device error ({0})")]
    Other(i32),
}

/// One recorded worker error: what failed, and during which operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErrorReport {
    pub error: DeviceError,
    pub operation: &'static str,
}

impl ErrorReport {
    pub(crate) fn new(error: DeviceError, operation: &'static str) -> ErrorReport {
        ErrorReport { error, operation }
    }

    /// Whether this error means the device is gone and in-flight state must
    /// be torn down.
    pub fn is_device_loss(&self) -> bool {
        matches!(self.error, DeviceError::DeviceLost | DeviceError::Timeout)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} during {}", self.error, self.operation)
    }
}

/// FIFO of worker errors, drained by producer threads.
pub(crate) struct ErrorSink {
    errors: Mutex<VecDeque<ErrorReport>>,
}

impl ErrorSink {
    pub(crate) fn new() -> ErrorSink {
        ErrorSink {
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, report: ErrorReport) {
        self.errors.lock().push_back(report);
    }

    pub(crate) fn take(&self) -> Option<ErrorReport> {
        self.errors.lock().pop_front()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}
