//! # Error Definitions
//!
//! Every failure the offload core can surface to its caller. Errors are
//! reported synchronously to the immediate caller; the core never retries.
//!
//! [`Error::NotReady`] is the one variant callers are expected to treat as
//! normal control flow: the request is still running, poll again later.

use std::fmt;

use crate::handles::ContextId;
use crate::handles::EngineAddr;
use crate::handles::LibraryHandle;
use crate::handles::NodeId;
use crate::handles::ProcHandle;
use crate::handles::RequestId;
use crate::handles::SymbolAddr;

/// Direction or kind of a raw memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read,
    Write,
    Alloc,
    Free,
}

impl fmt::Display for MemOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Alloc => write!(f, "alloc"),
            Self::Free => write!(f, "free"),
        }
    }
}

/// Why a request id was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFault {
    /// The id was never issued by this context.
    Unknown,
    /// The id already produced its terminal result.
    Consumed,
    /// Another wait or peek on the same id is in progress.
    Claimed,
}

impl fmt::Display for RequestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "never issued on this context"),
            Self::Consumed => write!(f, "result already consumed"),
            Self::Claimed => write!(f, "result is being retrieved concurrently"),
        }
    }
}

/// Failures of the offload core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport could not create a process on the node.
    ProcessCreation { node: NodeId },
    /// The transport reported a failure while destroying a process.
    ProcessDestroy { proc: ProcHandle, status: i32 },
    /// The transport could not open a context on the process.
    ContextOpen { proc: ProcHandle },
    /// The transport reported a failure while closing a context.
    ContextClose { id: ContextId, status: i32 },
    /// The library could not be loaded into the engine process.
    LibraryLoad { path: String },
    /// The symbol was not found in the library.
    SymbolResolution { lib: LibraryHandle, name: String },
    /// A raw memory operation against the engine failed. Nothing was copied.
    ///
    /// `status` is the transport's failure code; allocation failures have
    /// none.
    MemoryAccess { op: MemOp, addr: EngineAddr, len: usize, status: Option<i32> },
    /// More arguments than a call descriptor can hold.
    TooManyArguments { count: usize },
    /// The argument at `position` has no supported scalar interpretation.
    ArgumentType { position: usize },
    /// The transport refused the call.
    Submission { ctx: ContextId, addr: SymbolAddr },
    /// The transport refused a queued memory transfer.
    TransferSubmission { ctx: ContextId, op: MemOp, addr: EngineAddr, len: usize },
    /// The call raised an exception on the engine.
    CallException { id: RequestId },
    /// The engine failed below the level of the called function.
    CallFailed { id: RequestId },
    /// The call has not finished yet. Retry later.
    NotReady { id: RequestId },
    /// The request id is stale, reused or foreign.
    InvalidRequest { id: RequestId, reason: RequestFault },
    /// The context is closed, foreign, or its process is gone.
    InvalidContext { id: ContextId },
}

impl Error {
    /// Returns true for conditions the caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessCreation { node } => write!(f, "failed to create engine process on {}", node),
            Self::ProcessDestroy { proc, status } => write!(f, "failed to destroy {} (status {})", proc, status),
            Self::ContextOpen { proc } => write!(f, "failed to open context on {}", proc),
            Self::ContextClose { id, status } => write!(f, "failed to close {} (status {})", id, status),
            Self::LibraryLoad { path } => write!(f, "failed to load library '{}'", path),
            Self::SymbolResolution { lib, name } => write!(f, "symbol '{}' not found in {}", name, lib),
            Self::MemoryAccess { op, addr, len, status: Some(status) } => {
                write!(f, "memory {} of {} bytes at {} failed (status {})", op, len, addr, status)
            }
            Self::MemoryAccess { op, addr, len, status: None } => {
                write!(f, "memory {} of {} bytes at {} failed", op, len, addr)
            }
            Self::TooManyArguments { count } => {
                write!(f, "{} arguments given, at most {} are supported", count, crate::args::MAX_ARGS)
            }
            Self::ArgumentType { position } => write!(f, "failed to cast argument {}", position),
            Self::Submission { ctx, addr } => write!(f, "submission of call to {} on {} failed", addr, ctx),
            Self::TransferSubmission { ctx, op, addr, len } => {
                write!(f, "submission of {} of {} bytes at {} on {} failed", op, len, addr, ctx)
            }
            Self::CallException { id } => write!(f, "{} raised an exception on the engine", id),
            Self::CallFailed { id } => write!(f, "{} failed with an engine error", id),
            Self::NotReady { id } => write!(f, "{} has not finished", id),
            Self::InvalidRequest { id, reason } => write!(f, "invalid request {}: {}", id, reason),
            Self::InvalidContext { id } => write!(f, "{} is closed or does not belong to this process", id),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for offload operations.
pub type Result<T> = std::result::Result<T, Error>;
