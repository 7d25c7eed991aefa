//! # Transport Abstraction
//!
//! The native mechanism that actually creates engine processes, schedules
//! calls onto the engine and copies memory across the host/engine boundary.
//!
//! ## Philosophy
//!
//! - **Mirror the native API**: Methods report failure the way the native
//!   offload library does (null handles, zero tokens, non-zero statuses, an
//!   invalid request sentinel). Translating those into [`crate::Error`] is
//!   the core's job, not the transport's.
//! - **No policy**: The transport does not retry, validate request ids
//!   against a context's history, or track ownership. It moves calls and
//!   bytes.

use crate::args::CallArgs;
use crate::buffer::HostBuffer;
use crate::handles::CtxHandle;
use crate::handles::EngineAddr;
use crate::handles::LibraryHandle;
use crate::handles::NodeId;
use crate::handles::ProcHandle;
use crate::handles::SymbolAddr;

/// Returned by the `submit_*` methods when the work was not accepted.
pub const REQUEST_ID_INVALID: u64 = u64::MAX;

/// Native status codes reported by wait and poll.
pub mod status {
    pub const OK: i32 = 0;
    pub const EXCEPTION: i32 = -1;
    pub const ERROR: i32 = -2;
    pub const UNFINISHED: i32 = -3;
}

/// Completion state of a submitted call, as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// The call returned this value.
    Ok(u64),
    /// The called function raised an exception on the engine.
    Exception,
    /// The engine failed while handling the call.
    Error,
    /// The call is still running.
    Unfinished,
}

impl CallState {
    /// Decodes a native `(status, result)` pair.
    ///
    /// Any negative status without a dedicated meaning is an engine error.
    pub fn from_raw(rc: i32, result: u64) -> Self {
        match rc {
            status::OK => Self::Ok(result),
            status::EXCEPTION => Self::Exception,
            status::UNFINISHED => Self::Unfinished,
            _ => Self::Error,
        }
    }
}

/// The native offload mechanism.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
///
/// # invariants
/// - Handles and tokens returned for one process are only ever passed back
///   for that same process.
/// - `read_mem` and `write_mem` copy all bytes or report a non-zero status.
/// - Raw request ids returned by the `submit_*` methods name exactly one
///   piece of work on that context; `wait_call` and `poll_call` report its
///   final state at most once.
/// - Work queued on one context runs in submission order, whether it is a
///   call or a memory transfer.
pub trait Transport: Send + Sync + 'static {
    /// Starts an engine process on `node`. `None` if the node is unusable.
    fn create_process(&self, node: NodeId) -> Option<ProcHandle>;

    /// Terminates an engine process. Returns a non-zero status on failure.
    fn destroy_process(&self, proc: ProcHandle) -> i32;

    /// Opens a call stream on the process. `None` on failure.
    fn open_context(&self, proc: ProcHandle) -> Option<CtxHandle>;

    /// Closes a call stream. Returns a non-zero status on failure.
    fn close_context(&self, ctx: CtxHandle) -> i32;

    /// Loads a shared library into the process. Returns 0 on failure.
    fn load_library(&self, proc: ProcHandle, path: &str) -> u64;

    /// Looks up a symbol in a loaded library. Returns 0 on failure.
    fn resolve_symbol(&self, proc: ProcHandle, lib: LibraryHandle, name: &str) -> u64;

    /// Allocates `size` bytes of engine memory. Returns 0 on failure.
    fn alloc_mem(&self, proc: ProcHandle, size: usize) -> u64;

    /// Releases engine memory from [`Transport::alloc_mem`].
    fn free_mem(&self, proc: ProcHandle, addr: EngineAddr) -> i32;

    /// Copies `dst.len()` bytes from engine address `src` into `dst`.
    fn read_mem(&self, proc: ProcHandle, dst: &mut [u8], src: EngineAddr) -> i32;

    /// Copies `src` to engine address `dst`.
    fn write_mem(&self, proc: ProcHandle, dst: EngineAddr, src: &[u8]) -> i32;

    /// Queues a call to `addr` on the context.
    ///
    /// Returns a raw request id, or [`REQUEST_ID_INVALID`].
    fn submit_call(&self, ctx: CtxHandle, addr: SymbolAddr, args: &CallArgs) -> u64;

    /// Queues a copy of `src` to engine address `dst` on the context.
    ///
    /// Completes with `Ok(0)`, or `Error` if the copy faulted. Returns a raw
    /// request id, or [`REQUEST_ID_INVALID`].
    fn submit_write(&self, ctx: CtxHandle, dst: EngineAddr, src: Vec<u8>) -> u64;

    /// Queues a copy of `dst.len()` bytes from engine address `src` into
    /// `dst` on the context.
    ///
    /// `dst` is written, in full, before the request completes with `Ok(0)`.
    /// A faulted copy completes with `Error` and leaves `dst` untouched.
    fn submit_read(&self, ctx: CtxHandle, dst: HostBuffer, src: EngineAddr) -> u64;

    /// Blocks until the request is final.
    fn wait_call(&self, ctx: CtxHandle, req: u64) -> CallState;

    /// Reports the request's state without blocking.
    fn poll_call(&self, ctx: CtxHandle, req: u64) -> CallState;
}
