//! # Engine Process
//!
//! A [`Process`] owns one engine process on one accelerator node, together
//! with everything that lives inside it: loaded libraries, resolved symbols,
//! allocated memory and open contexts.
//!
//! Contexts are kept in a registry keyed by [`ContextId`] so teardown can
//! close every one of them before the engine process itself goes away.
//! Dropping a `Process` tears it down; [`Process::destroy`] does the same
//! but reports failures.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::context::Context;
use crate::context::ContextInner;
use crate::error::Error;
use crate::error::MemOp;
use crate::error::Result;
use crate::handles::ContextId;
use crate::handles::EngineAddr;
use crate::handles::LibraryHandle;
use crate::handles::NodeId;
use crate::handles::ProcHandle;
use crate::handles::SymbolAddr;
use crate::transport::Transport;

/// Environment variable naming the accelerator node to run on.
pub const NODE_ENV: &str = "VE_NODE_NUMBER";

/// Configures and creates a [`Process`].
pub struct ProcessBuilder {
    transport: Arc<dyn Transport>,
    node: NodeId,
}

impl ProcessBuilder {
    /// Starts a builder targeting node 0.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, node: NodeId::default() }
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    /// Takes the node from [`NODE_ENV`], falling back to node 0.
    pub fn node_from_env(self) -> Self {
        let value = std::env::var(NODE_ENV).ok();
        let node = parse_node(value.as_deref());
        self.node(node)
    }

    /// Starts the engine process.
    pub fn build(self) -> Result<Process> {
        let node = self.node;
        let handle = self
            .transport
            .create_process(node)
            .ok_or(Error::ProcessCreation { node })?;

        debug!(node = %node, proc = %handle, "engine process created");

        Ok(Process {
            inner: Arc::new(ProcessInner {
                node,
                handle,
                transport: self.transport,
                contexts: DashMap::new(),
                next_context: AtomicU64::new(1),
                alive: AtomicBool::new(true),
            }),
        })
    }
}

pub(crate) fn parse_node(value: Option<&str>) -> NodeId {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return NodeId::default();
    };

    match raw.parse::<u32>() {
        Ok(n) => NodeId(n),
        Err(_) => {
            warn!(var = NODE_ENV, value = raw, "not a node number, using node 0");
            NodeId::default()
        }
    }
}

/// An engine process and the resources it owns.
pub struct Process {
    inner: Arc<ProcessInner>,
}

pub(crate) struct ProcessInner {
    node: NodeId,
    handle: ProcHandle,
    transport: Arc<dyn Transport>,
    contexts: DashMap<ContextId, Arc<ContextInner>>,
    next_context: AtomicU64,
    alive: AtomicBool,
}

impl ProcessInner {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Closes every open context, then destroys the engine process.
    ///
    /// Runs at most once. Returns the first failure but always attempts
    /// every step.
    fn teardown(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;

        let ids: Vec<ContextId> = self.contexts.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some((_, ctx)) = self.contexts.remove(&id) else { continue };
            if let Err(e) = ctx.shutdown() {
                warn!(proc = %self.handle, error = %e, "context close failed during teardown");
                first_error.get_or_insert(e);
            }
        }

        let status = self.transport.destroy_process(self.handle);
        debug!(node = %self.node, proc = %self.handle, status, "engine process destroyed");
        if status != 0 {
            first_error.get_or_insert(Error::ProcessDestroy { proc: self.handle, status });
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Process {
    /// Starts an engine process on `node`.
    pub fn new(transport: Arc<dyn Transport>, node: NodeId) -> Result<Self> {
        ProcessBuilder::new(transport).node(node).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> ProcessBuilder {
        ProcessBuilder::new(transport)
    }

    /// The node this process runs on.
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// The transport's handle for this process.
    pub fn raw_handle(&self) -> ProcHandle {
        self.inner.handle
    }

    /// Ids of the currently open contexts, in opening order.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.inner.contexts.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Loads a shared library into the engine process.
    pub fn load_library(&self, path: &str) -> Result<LibraryHandle> {
        let token = self.inner.transport.load_library(self.inner.handle, path);
        if token == 0 {
            return Err(Error::LibraryLoad { path: path.to_string() });
        }

        let lib = LibraryHandle(token);
        debug!(proc = %self.inner.handle, lib = %lib, path, "library loaded");
        Ok(lib)
    }

    /// Resolves `name` in a library loaded by this process.
    pub fn resolve_symbol(&self, lib: LibraryHandle, name: &str) -> Result<SymbolAddr> {
        let addr = self.inner.transport.resolve_symbol(self.inner.handle, lib, name);
        if addr == 0 {
            return Err(Error::SymbolResolution { lib, name: name.to_string() });
        }

        let sym = SymbolAddr(addr);
        debug!(proc = %self.inner.handle, lib = %lib, sym = %sym, name, "symbol resolved");
        Ok(sym)
    }

    /// Copies `dst.len()` bytes from engine memory at `src` into `dst`.
    ///
    /// On failure `dst` is left untouched.
    pub fn read_mem(&self, dst: &mut [u8], src: EngineAddr) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }

        // Stage through a scratch buffer so a failed transfer never leaves
        // a half-written destination behind.
        let mut scratch = vec![0u8; dst.len()];
        let status = self.inner.transport.read_mem(self.inner.handle, &mut scratch, src);
        if status != 0 {
            return Err(Error::MemoryAccess { op: MemOp::Read, addr: src, len: dst.len(), status: Some(status) });
        }

        dst.copy_from_slice(&scratch);
        trace!(proc = %self.inner.handle, addr = %src, len = dst.len(), "memory read");
        Ok(())
    }

    /// Copies `src` into engine memory at `dst`.
    pub fn write_mem(&self, dst: EngineAddr, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }

        let status = self.inner.transport.write_mem(self.inner.handle, dst, src);
        if status != 0 {
            return Err(Error::MemoryAccess { op: MemOp::Write, addr: dst, len: src.len(), status: Some(status) });
        }

        trace!(proc = %self.inner.handle, addr = %dst, len = src.len(), "memory written");
        Ok(())
    }

    /// Allocates `size` bytes of engine memory.
    pub fn alloc_mem(&self, size: usize) -> Result<EngineAddr> {
        let addr = self.inner.transport.alloc_mem(self.inner.handle, size);
        if addr == 0 {
            return Err(Error::MemoryAccess { op: MemOp::Alloc, addr: EngineAddr(0), len: size, status: None });
        }

        trace!(proc = %self.inner.handle, addr = %EngineAddr(addr), size, "memory allocated");
        Ok(EngineAddr(addr))
    }

    /// Releases engine memory from [`Process::alloc_mem`].
    pub fn free_mem(&self, addr: EngineAddr) -> Result<()> {
        let status = self.inner.transport.free_mem(self.inner.handle, addr);
        if status != 0 {
            return Err(Error::MemoryAccess { op: MemOp::Free, addr, len: 0, status: Some(status) });
        }
        Ok(())
    }

    /// Opens a new context on this process.
    pub fn open_context(&self) -> Result<Context> {
        let handle = self
            .inner
            .transport
            .open_context(self.inner.handle)
            .ok_or(Error::ContextOpen { proc: self.inner.handle })?;

        let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
        let ctx = Context::new(ContextInner::new(
            id,
            handle,
            Arc::downgrade(&self.inner),
            self.inner.transport.clone(),
        ));
        self.inner.contexts.insert(id, ctx.inner.clone());

        debug!(proc = %self.inner.handle, ctx = %id, handle = %handle, "context opened");
        Ok(ctx)
    }

    /// Closes a context opened by this process.
    ///
    /// Fails with [`Error::InvalidContext`] if the context was already
    /// closed or belongs to another process.
    pub fn close_context(&self, ctx: &Context) -> Result<()> {
        let id = ctx.id();
        let owned = self
            .inner
            .contexts
            .remove_if(&id, |_, registered| Arc::ptr_eq(registered, &ctx.inner));

        let Some((_, inner)) = owned else {
            return Err(Error::InvalidContext { id });
        };
        inner.shutdown()
    }

    /// Closes all contexts and destroys the engine process.
    pub fn destroy(self) -> Result<()> {
        self.inner.teardown()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Err(e) = self.inner.teardown() {
            warn!(proc = %self.inner.handle, error = %e, "engine process teardown failed");
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("node", &self.inner.node)
            .field("handle", &self.inner.handle)
            .field("contexts", &self.inner.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        assert_eq!(parse_node(None), NodeId(0));
        assert_eq!(parse_node(Some("")), NodeId(0));
        assert_eq!(parse_node(Some(" 3 ")), NodeId(3));
        assert_eq!(parse_node(Some("ve1")), NodeId(0));
    }
}
