//! Out-of-band status channel for the native call boundary.
//!
//! Kernels cannot raise language-level exceptions across the ABI. Instead the
//! executor hands every dispatch a [`StatusSlot`] and the kernel writes exactly
//! one [`Status`] into it before returning. A slot left unwritten is treated by
//! the dispatcher as an internal-error condition, so a kernel that forgets to
//! report cannot masquerade as a success.
//!
//! The slot is write-once: the first write wins and later writes are ignored.
//! This keeps an early, precise failure report from being clobbered by cleanup
//! code running on the way out.

use serde::{Deserialize, Serialize};

/// Enumerated outcome of one dispatched kernel invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The kernel completed and output buffers hold valid results
    Ok,
    /// Malformed or inconsistent descriptor, or a buffer-size mismatch
    InvalidArgument,
    /// The requested kernel name is not in the registry
    Unimplemented,
    /// Reserved for bounded-wait pool policies; unused by the blocking pool
    ResourceExhausted,
    /// Programming error or an underlying routine failing unexpectedly
    Internal,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid argument",
            Self::Unimplemented => "unimplemented",
            Self::ResourceExhausted => "resource exhausted",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// A status code plus an optional human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Outcome code
    pub code: StatusCode,
    /// Optional diagnostic message; `None` for success
    pub message: Option<String>,
}

impl Status {
    /// Successful completion
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    /// Failure with a diagnostic message
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Whether this status reports success
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Write-once slot a kernel fills before returning.
///
/// The caller allocates the slot, passes it through dispatch, and inspects it
/// afterwards. An unwritten slot after the kernel returns means the kernel
/// broke its contract; the dispatcher converts that into
/// [`StatusCode::Internal`].
#[derive(Debug, Default)]
pub struct StatusSlot {
    written: Option<Status>,
}

impl StatusSlot {
    /// Fresh, unwritten slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record success. Ignored if the slot was already written.
    pub fn write_ok(&mut self) {
        self.write(Status::ok());
    }

    /// Record a failure. Ignored if the slot was already written.
    pub fn write_error(&mut self, code: StatusCode, message: impl Into<String>) {
        self.write(Status::error(code, message));
    }

    /// First write wins; double writes are a kernel bug worth a trace, not a
    /// panic.
    pub fn write(&mut self, status: Status) {
        if let Some(existing) = &self.written {
            log::debug!(
                "status slot double write ignored: kept {:?}, dropped {:?}",
                existing.code,
                status.code
            );
            return;
        }
        self.written = Some(status);
    }

    /// Whether the kernel has reported
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.written.is_some()
    }

    /// The recorded status, if any
    #[must_use]
    pub fn get(&self) -> Option<&Status> {
        self.written.as_ref()
    }

    /// The recorded code, if any
    #[must_use]
    pub fn code(&self) -> Option<StatusCode> {
        self.written.as_ref().map(|s| s.code)
    }

    /// Whether the slot holds a success report
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code() == Some(StatusCode::Ok)
    }

    /// Consume the slot, yielding the recorded status
    #[must_use]
    pub fn take(&mut self) -> Option<Status> {
        self.written.take()
    }
}
