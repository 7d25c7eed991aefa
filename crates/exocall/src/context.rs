//! # Execution Context
//!
//! One independent stream of asynchronous calls against an engine process.
//!
//! Calls are submitted with [`Context::call_async`], which returns a
//! [`RequestId`] immediately. The result is retrieved later, either by
//! blocking in [`Context::wait_result`] or by polling with
//! [`Context::peek_result`]. Each request produces exactly one terminal
//! result; after that its id is dead.
//!
//! Memory transfers can be queued on the same stream with
//! [`Context::async_write_mem`] and [`Context::async_read_mem`]. They share
//! the request id space and run in submission order with the calls, so a
//! write queued before a call is visible to it without waiting in between.
//!
//! A context is only usable while it is open and its owning
//! [`Process`](crate::Process) is alive. Closing it (explicitly, or through
//! process teardown) invalidates every request issued on it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;

use crate::args::CallArgs;
use crate::buffer::HostBuffer;
use crate::error::Error;
use crate::error::MemOp;
use crate::error::Result;
use crate::handles::ContextId;
use crate::handles::CtxHandle;
use crate::handles::EngineAddr;
use crate::handles::RequestId;
use crate::handles::SymbolAddr;
use crate::process::ProcessInner;
use crate::tracker::RequestTracker;
use crate::tracker::Target;
use crate::transport::CallState;
use crate::transport::REQUEST_ID_INVALID;
use crate::transport::Transport;

/// Handle to an open context.
///
/// Cheap to clone; all clones refer to the same context. The owning
/// process keeps its own reference purely so it can close the context on
/// teardown.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) id: ContextId,
    handle: CtxHandle,
    process: Weak<ProcessInner>,
    transport: Arc<dyn Transport>,
    requests: RequestTracker,
    /// Serializes submissions against each other and against shutdown.
    submit: Mutex<()>,
    open: AtomicBool,
}

impl ContextInner {
    pub(crate) fn new(
        id: ContextId,
        handle: CtxHandle,
        process: Weak<ProcessInner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            handle,
            process,
            transport,
            requests: RequestTracker::new(),
            submit: Mutex::new(()),
            open: AtomicBool::new(true),
        }
    }

    /// Closes the context. Fails if it was already closed.
    ///
    /// Outstanding requests are forgotten before the transport context is
    /// released, so a wait blocked on one of them reports the context as
    /// invalid rather than a result.
    pub(crate) fn shutdown(&self) -> Result<()> {
        // no submission may register between the flag flip and the clear
        let _guard = self.submit.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidContext { id: self.id });
        }

        let dropped = self.requests.clear();
        let status = self.transport.close_context(self.handle);
        debug!(ctx = %self.id, handle = %self.handle, dropped, status, "context closed");

        if status != 0 {
            return Err(Error::ContextClose { id: self.id, status });
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.open.load(Ordering::Acquire)
            && self.process.upgrade().is_some_and(|p| p.is_alive())
    }
}

impl Context {
    pub(crate) fn new(inner: ContextInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// The context's id within its process.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// The transport's handle for this context.
    pub fn raw_handle(&self) -> CtxHandle {
        self.inner.handle
    }

    /// Whether the context can still be used.
    pub fn is_open(&self) -> bool {
        self.inner.is_live()
    }

    /// Number of submitted requests whose result has not been consumed.
    pub fn pending(&self) -> usize {
        self.inner.requests.outstanding()
    }

    /// Submits a call to `addr` and returns without waiting for it.
    pub fn call_async(&self, addr: SymbolAddr, args: &CallArgs) -> Result<RequestId> {
        self.submit(Target::Call(addr), |transport, ctx| transport.submit_call(ctx, addr, args))
    }

    /// Queues a copy of `src` to engine memory at `dst`.
    ///
    /// The bytes are taken at submission, so `src` may be reused right away.
    /// The request completes with 0, or [`Error::CallFailed`] if the copy
    /// faulted on the engine.
    pub fn async_write_mem(&self, dst: EngineAddr, src: &[u8]) -> Result<RequestId> {
        let target = Target::Write { addr: dst, len: src.len() };
        self.submit(target, |transport, ctx| transport.submit_write(ctx, dst, src.to_vec()))
    }

    /// Queues a copy of `dst.len()` bytes of engine memory at `src` into `dst`.
    ///
    /// `dst` holds the bytes once the request has completed with 0. A
    /// faulted copy completes with [`Error::CallFailed`] and leaves `dst`
    /// untouched.
    pub fn async_read_mem(&self, dst: &HostBuffer, src: EngineAddr) -> Result<RequestId> {
        let target = Target::Read { addr: src, len: dst.len() };
        self.submit(target, |transport, ctx| transport.submit_read(ctx, dst.clone(), src))
    }

    /// Blocks until the request finishes and returns its result.
    ///
    /// There is no timeout. Callers that need one should poll with
    /// [`Context::peek_result`] instead.
    pub fn wait_result(&self, id: RequestId) -> Result<u64> {
        self.ensure_live()?;

        let raw = self.inner.requests.claim(id)?;
        let state = self.inner.transport.wait_call(self.inner.handle, raw);
        self.finish(id, state)
    }

    /// Returns the request's result if it has finished.
    ///
    /// Fails with [`Error::NotReady`] while the call is still running; that
    /// is not a fault and the caller may retry as often as it likes.
    pub fn peek_result(&self, id: RequestId) -> Result<u64> {
        self.ensure_live()?;

        let raw = self.inner.requests.claim(id)?;
        let state = self.inner.transport.poll_call(self.inner.handle, raw);
        self.finish(id, state)
    }

    /// Submits a call and immediately waits for it.
    pub fn call_sync(&self, addr: SymbolAddr, args: &CallArgs) -> Result<u64> {
        let id = self.call_async(addr, args)?;
        self.wait_result(id)
    }

    fn submit<F>(&self, target: Target, send: F) -> Result<RequestId>
    where
        F: FnOnce(&dyn Transport, CtxHandle) -> u64,
    {
        self.ensure_live()?;

        let _guard = self.inner.submit.lock().unwrap_or_else(PoisonError::into_inner);
        // a close may have taken the lock first
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(Error::InvalidContext { id: self.inner.id });
        }

        let raw = send(self.inner.transport.as_ref(), self.inner.handle);
        if raw == REQUEST_ID_INVALID {
            return Err(self.rejected(target));
        }

        let id = self.inner.requests.register(raw, target);
        trace!(ctx = %self.inner.id, req = %id, raw, target = %target, "request submitted");
        Ok(id)
    }

    fn rejected(&self, target: Target) -> Error {
        let ctx = self.inner.id;
        match target {
            Target::Call(addr) => Error::Submission { ctx, addr },
            Target::Read { addr, len } => Error::TransferSubmission { ctx, op: MemOp::Read, addr, len },
            Target::Write { addr, len } => Error::TransferSubmission { ctx, op: MemOp::Write, addr, len },
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.is_live() {
            Ok(())
        } else {
            Err(Error::InvalidContext { id: self.inner.id })
        }
    }

    fn finish(&self, id: RequestId, state: CallState) -> Result<u64> {
        match self.inner.requests.settle(id, state) {
            Some(outcome) if self.inner.open.load(Ordering::Acquire) => outcome,
            _ => Err(Error::InvalidContext { id: self.inner.id }),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .field("open", &self.inner.open.load(Ordering::Relaxed))
            .field("pending", &self.inner.requests.outstanding())
            .finish()
    }
}
