use pm4_winsys::WinsysError;
use thiserror::Error;

use crate::cmd_buffer::CommandBufferStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("submission rejected: {detail}")]
    SubmissionRejected { detail: String },
    #[error("command buffer is not executable (status {status:?})")]
    NotExecutable { status: CommandBufferStatus },
    #[error("secondary command buffers cannot be submitted to a queue")]
    SecondarySubmitted,
}

impl From<WinsysError> for Error {
    fn from(err: WinsysError) -> Self {
        match err {
            WinsysError::OutOfHostMemory => Self::OutOfHostMemory,
            WinsysError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            WinsysError::DeviceLost => Self::DeviceLost,
            WinsysError::SubmissionRejected { detail } => Self::SubmissionRejected { detail },
            WinsysError::InvalidSyncobj(handle) => Self::SubmissionRejected {
                detail: format!("invalid syncobj handle {handle}"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
