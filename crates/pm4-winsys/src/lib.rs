//! Window-system layer: buffer objects, command streams and kernel submission.
//!
//! The crate never talks to a real kernel driver directly. Memory comes from a
//! [`BoAllocator`] and submissions go through a [`KernelDevice`]; [`sim`] provides
//! in-process implementations of both.

pub mod bo;
pub mod bo_list;
pub mod config;
pub mod cs;
pub mod error;
pub mod kernel;
pub mod sim;
pub mod submit;
pub mod syncobj;

pub use bo::{Bo, BoAllocator, BoDesc, BoEntry, BoFlags, BoHandle, Domain};
pub use bo_list::{build_bo_list, BoListBuilder, GlobalBoList};
pub use config::{DebugFlags, WinsysConfig};
pub use cs::{CmdStream, Segment};
pub use error::{Result, WinsysError};
pub use kernel::{
    ContextPriority, HwIp, IbDesc, IbFlags, KernelDevice, KernelError, KernelSubmission,
    SubmitChunk, TimelinePoint,
};
pub use sim::{SimAllocator, SimKernel};
pub use submit::{SubmitContext, SubmitRequest, SyncPoint, Winsys};
pub use syncobj::SyncobjPool;
