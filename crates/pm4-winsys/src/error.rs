use thiserror::Error;

use crate::kernel::KernelError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WinsysError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("submission rejected: {detail}")]
    SubmissionRejected { detail: String },
    #[error("invalid syncobj handle {0}")]
    InvalidSyncobj(u32),
}

impl WinsysError {
    /// Maps a kernel error that is not tied to a submit context.
    ///
    /// Cancellation only poisons a context when it comes back from a submission; see
    /// [`crate::SubmitContext`].
    pub(crate) fn from_kernel(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Self::OutOfHostMemory,
            KernelError::Cancelled => Self::DeviceLost,
            KernelError::Rejected { errno } => Self::SubmissionRejected {
                detail: format!("kernel returned errno {errno}"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, WinsysError>;
