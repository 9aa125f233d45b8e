//! Error types for backend operations
//!
//! Two families are kept apart:
//!
//! - configuration errors ([`BackendError::Config`],
//!   [`BackendError::InvalidDeviceIndex`]) describe bad input, are detected
//!   before any device resource is committed, and are always returned;
//! - device faults (everything else) come from a backend call or from kernel
//!   code and are routed through the queue's [`FailurePolicy`].

use std::sync::Arc;

use portacc_core::FailurePolicy;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid request detected before touching any device
    #[error(transparent)]
    Config(#[from] portacc_core::Error),

    /// Device index outside the platform's device list
    #[error("invalid device index {index} for platform {platform} ({count} devices)")]
    InvalidDeviceIndex {
        platform: &'static str,
        index: usize,
        count: usize,
    },

    /// A backend runtime call returned a failure status
    #[error("{backend} call `{op}` failed: {message} ({file}:{line})")]
    Runtime {
        backend: &'static str,
        op: &'static str,
        message: String,
        file: &'static str,
        line: u32,
    },

    /// Kernel code panicked on at least one thread
    #[error("kernel `{kernel}` failed on {acc}: {message}")]
    KernelFailed {
        kernel: String,
        acc: String,
        message: String,
    },

    /// A generic host task panicked
    #[error("host task failed on {queue}: {message}")]
    HostTaskFailed { queue: String, message: String },

    /// A previous task on the queue failed; the queue no longer executes work
    #[error("queue {queue} is faulted: {source}")]
    QueueFaulted {
        queue: String,
        #[source]
        source: Arc<BackendError>,
    },

    /// An allocation could not be satisfied
    #[error("allocation of {bytes} bytes failed on {device}")]
    OutOfMemory { bytes: usize, device: String },

    /// A worker thread could not be started
    #[error("failed to spawn {what} thread: {source}")]
    ThreadSpawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn runtime(
        backend: &'static str,
        op: &'static str,
        message: impl ToString,
        file: &'static str,
        line: u32,
    ) -> Self {
        BackendError::Runtime {
            backend,
            op,
            message: message.to_string(),
            file,
            line,
        }
    }

    pub fn kernel_failed(kernel: impl Into<String>, acc: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::KernelFailed {
            kernel: kernel.into(),
            acc: acc.into(),
            message: message.into(),
        }
    }

    /// Bad input detected before any resource was committed.
    pub fn is_config_error(&self) -> bool {
        matches!(self, BackendError::Config(_) | BackendError::InvalidDeviceIndex { .. })
    }

    /// A failure raised by a backend or by kernel code.
    pub fn is_device_fault(&self) -> bool {
        !self.is_config_error()
    }
}

/// Convert a runtime status into a [`BackendError::Runtime`] carrying the
/// operation name and call site.
///
/// ```rust,ignore
/// let ptr = rt_check!("emu", "malloc", runtime.malloc(1024))?;
/// ```
#[macro_export]
macro_rules! rt_check {
    ($backend:expr, $op:expr, $call:expr) => {
        ($call).map_err(|err| $crate::error::BackendError::runtime($backend, $op, err, file!(), line!()))
    };
}

/// Log a device fault and abort the process.
pub fn abort_with(err: &BackendError) -> ! {
    tracing::error!(error = %err, "fatal backend fault, aborting");
    eprintln!("portacc: fatal backend fault: {err}");
    std::process::abort()
}

/// Apply `policy` to a failed operation.
///
/// Configuration errors are always handed back. Device faults abort the
/// process under [`FailurePolicy::Abort`] and are handed back under
/// [`FailurePolicy::Propagate`].
pub fn escalate(policy: FailurePolicy, err: BackendError) -> BackendError {
    if err.is_device_fault() && policy == FailurePolicy::Abort {
        abort_with(&err);
    }
    if err.is_device_fault() {
        tracing::warn!(error = %err, "backend fault propagated to caller");
    }
    err
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
