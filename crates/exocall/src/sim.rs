//! # Simulated Engine
//!
//! An in-process [`Transport`] that behaves like a small accelerator:
//! libraries are tables of Rust closures, engine memory is a set of heap
//! regions, and every context runs its calls and queued memory copies in
//! order on a dedicated worker thread.
//!
//! Useful for exercising the offload lifecycle without hardware. Callers
//! must not use [`SimTransport`] from inside an async runtime: waiting on a
//! call blocks the current thread.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use crate::args::CallArgs;
use crate::buffer::HostBuffer;
use crate::handles::CtxHandle;
use crate::handles::EngineAddr;
use crate::handles::LibraryHandle;
use crate::handles::NodeId;
use crate::handles::ProcHandle;
use crate::handles::SymbolAddr;
use crate::transport::CallState;
use crate::transport::REQUEST_ID_INVALID;
use crate::transport::Transport;

const HEAP_BASE: u64 = 0x6000_0000;
const HEAP_ALIGN: u64 = 64;
const TEXT_BASE: u64 = 0x0010_0000;
const TEXT_STRIDE: u64 = 0x40;

/// How a simulated function fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The function raised an exception.
    Exception,
    /// The engine faulted (bad memory access, unknown address, panic).
    Error,
}

impl fmt::Display for SimFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception => write!(f, "exception raised on engine"),
            Self::Error => write!(f, "engine fault"),
        }
    }
}

impl std::error::Error for SimFault {}

pub type Result<T> = std::result::Result<T, SimFault>;

/// Body of a simulated engine function.
pub type SimFn = Arc<dyn Fn(&SimMemory, &CallArgs) -> Result<u64> + Send + Sync>;

/// A named table of functions that can be loaded into a simulated process.
#[derive(Clone, Default)]
pub struct SimLibrary {
    funcs: HashMap<String, SimFn>,
}

impl SimLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exported function.
    pub fn function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&SimMemory, &CallArgs) -> Result<u64> + Send + Sync + 'static,
    {
        self.funcs.insert(name.to_string(), Arc::new(f));
        self
    }
}

struct Heap {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Heap {
    /// Finds the region holding `[addr, addr + len)` and the offset into it.
    fn locate(&self, addr: EngineAddr, len: usize) -> Option<(u64, usize)> {
        let (&base, region) = self.regions.range(..=addr.0).next_back()?;
        let offset = addr.0 - base;
        let end = offset.checked_add(len as u64)?;
        if end > region.len() as u64 {
            return None;
        }
        Some((base, offset as usize))
    }
}

/// Address space of one simulated engine process.
///
/// Accesses must lie entirely inside one live allocation; anything else is
/// an engine fault and copies nothing.
pub struct SimMemory {
    heap: Mutex<Heap>,
}

impl SimMemory {
    fn new() -> Self {
        Self {
            heap: Mutex::new(Heap { regions: BTreeMap::new(), next: HEAP_BASE }),
        }
    }

    pub fn read(&self, src: EngineAddr, dst: &mut [u8]) -> Result<()> {
        let heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let (base, offset) = heap.locate(src, dst.len()).ok_or(SimFault::Error)?;
        let region = heap.regions.get(&base).ok_or(SimFault::Error)?;
        dst.copy_from_slice(&region[offset..offset + dst.len()]);
        Ok(())
    }

    pub fn write(&self, dst: EngineAddr, src: &[u8]) -> Result<()> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let (base, offset) = heap.locate(dst, src.len()).ok_or(SimFault::Error)?;
        let region = heap.regions.get_mut(&base).ok_or(SimFault::Error)?;
        region[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&self, src: EngineAddr) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(src, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&self, dst: EngineAddr, value: u64) -> Result<()> {
        self.write(dst, &value.to_le_bytes())
    }

    /// Allocates a zeroed region. Zero-sized requests fail.
    pub fn alloc(&self, size: usize) -> Option<EngineAddr> {
        if size == 0 {
            return None;
        }

        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let base = heap.next;
        let span = (size as u64).checked_next_multiple_of(HEAP_ALIGN)?;
        // leave an unmapped gap so overruns fault instead of spilling
        heap.next = base.checked_add(span)?.checked_add(HEAP_ALIGN)?;
        heap.regions.insert(base, vec![0u8; size]);
        Some(EngineAddr(base))
    }

    /// Frees a region by its base address.
    pub fn free(&self, addr: EngineAddr) -> bool {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        heap.regions.remove(&addr.0).is_some()
    }
}

struct SimProcess {
    node: NodeId,
    memory: Arc<SimMemory>,
    libs: DashMap<LibraryHandle, String>,
    symbols: DashMap<SymbolAddr, SimFn>,
    names: DashMap<(LibraryHandle, String), SymbolAddr>,
    next_symbol: AtomicU64,
}

enum Work {
    /// `func` is `None` when the address named no resolved symbol.
    Call { func: Option<SimFn>, args: CallArgs },
    Read { src: EngineAddr, dst: HostBuffer },
    Write { dst: EngineAddr, bytes: Vec<u8> },
}

struct Job {
    work: Work,
    reply: oneshot::Sender<CallState>,
}

struct SimContext {
    proc: ProcHandle,
    queue: mpsc::UnboundedSender<Job>,
    inflight: DashMap<u64, oneshot::Receiver<CallState>>,
    next_req: AtomicU64,
}

/// Configures a [`SimTransport`].
#[derive(Default)]
pub struct SimTransportBuilder {
    nodes: HashSet<NodeId>,
    libraries: HashMap<String, SimLibrary>,
}

impl SimTransportBuilder {
    /// Makes `node` available. Without any call, only node 0 exists.
    pub fn node(mut self, node: NodeId) -> Self {
        self.nodes.insert(node);
        self
    }

    /// Makes `library` loadable under `path`.
    pub fn library(mut self, path: impl Into<String>, library: SimLibrary) -> Self {
        self.libraries.insert(path.into(), library);
        self
    }

    pub fn build(mut self) -> SimTransport {
        if self.nodes.is_empty() {
            self.nodes.insert(NodeId(0));
        }

        SimTransport {
            nodes: self.nodes,
            libraries: self.libraries,
            procs: DashMap::new(),
            contexts: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }
}

/// An in-process engine implementing [`Transport`].
pub struct SimTransport {
    nodes: HashSet<NodeId>,
    libraries: HashMap<String, SimLibrary>,
    procs: DashMap<ProcHandle, Arc<SimProcess>>,
    contexts: DashMap<CtxHandle, SimContext>,
    next_handle: AtomicU64,
}

impl SimTransport {
    pub fn builder() -> SimTransportBuilder {
        SimTransportBuilder::default()
    }

    /// Number of engine processes currently running.
    pub fn live_processes(&self) -> usize {
        self.procs.len()
    }

    /// Number of contexts currently open across all processes.
    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn process(&self, proc: ProcHandle) -> Option<Arc<SimProcess>> {
        self.procs.get(&proc).map(|p| p.value().clone())
    }

    /// Puts work on the context's queue and returns its raw request id.
    fn enqueue(&self, ctx: CtxHandle, work: impl FnOnce(ProcHandle) -> Work) -> u64 {
        let Some(context) = self.contexts.get(&ctx) else {
            return REQUEST_ID_INVALID;
        };

        let (reply, result) = oneshot::channel();
        let job = Job { work: work(context.proc), reply };
        if context.queue.send(job).is_err() {
            return REQUEST_ID_INVALID;
        }

        let req = context.next_req.fetch_add(1, Ordering::Relaxed);
        context.inflight.insert(req, result);
        req
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Runs work for one context in submission order until the queue closes.
fn spawn_worker(
    handle: CtxHandle,
    memory: Arc<SimMemory>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("sim-{}", handle))
        .spawn(move || {
            while let Some(job) = jobs.blocking_recv() {
                let state = run(job.work, &memory);
                // the waiter may have gone away with its context
                let _ = job.reply.send(state);
            }
        })?;
    Ok(())
}

fn run(work: Work, memory: &SimMemory) -> CallState {
    match work {
        Work::Call { func: Some(func), args } => execute(&func, memory, &args),
        Work::Call { func: None, .. } => CallState::Error,
        Work::Read { src, dst } => {
            let mut bytes = vec![0u8; dst.len()];
            match memory.read(src, &mut bytes) {
                Ok(()) if dst.fill_from(&bytes) => CallState::Ok(0),
                _ => CallState::Error,
            }
        }
        Work::Write { dst, bytes } => match memory.write(dst, &bytes) {
            Ok(()) => CallState::Ok(0),
            Err(_) => CallState::Error,
        },
    }
}

fn execute(func: &SimFn, memory: &SimMemory, args: &CallArgs) -> CallState {
    match panic::catch_unwind(AssertUnwindSafe(|| func(memory, args))) {
        Ok(Ok(value)) => CallState::Ok(value),
        Ok(Err(SimFault::Exception)) => CallState::Exception,
        Ok(Err(SimFault::Error)) | Err(_) => CallState::Error,
    }
}

fn status<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

impl Transport for SimTransport {
    fn create_process(&self, node: NodeId) -> Option<ProcHandle> {
        if !self.nodes.contains(&node) {
            return None;
        }

        let handle = ProcHandle(self.next_handle());
        self.procs.insert(handle, Arc::new(SimProcess {
            node,
            memory: Arc::new(SimMemory::new()),
            libs: DashMap::new(),
            symbols: DashMap::new(),
            names: DashMap::new(),
            next_symbol: AtomicU64::new(0),
        }));
        Some(handle)
    }

    fn destroy_process(&self, proc: ProcHandle) -> i32 {
        let Some((_, process)) = self.procs.remove(&proc) else {
            return -1;
        };

        // contexts die with their process
        self.contexts.retain(|_, ctx| ctx.proc != proc);
        debug!(node = %process.node, proc = %proc, "sim process exited");
        0
    }

    fn open_context(&self, proc: ProcHandle) -> Option<CtxHandle> {
        let process = self.process(proc)?;
        let handle = CtxHandle(self.next_handle());
        let (queue, jobs) = mpsc::unbounded_channel();

        spawn_worker(handle, process.memory.clone(), jobs).ok()?;
        self.contexts.insert(handle, SimContext {
            proc,
            queue,
            inflight: DashMap::new(),
            next_req: AtomicU64::new(1),
        });
        Some(handle)
    }

    fn close_context(&self, ctx: CtxHandle) -> i32 {
        // Dropping the queue sender stops the worker once it drains.
        match self.contexts.remove(&ctx) {
            Some(_) => 0,
            None => -1,
        }
    }

    fn load_library(&self, proc: ProcHandle, path: &str) -> u64 {
        let Some(process) = self.process(proc) else { return 0 };
        if !self.libraries.contains_key(path) {
            return 0;
        }

        let token = self.next_handle();
        process.libs.insert(LibraryHandle(token), path.to_string());
        token
    }

    fn resolve_symbol(&self, proc: ProcHandle, lib: LibraryHandle, name: &str) -> u64 {
        let Some(process) = self.process(proc) else { return 0 };
        let Some(path) = process.libs.get(&lib).map(|p| p.value().clone()) else { return 0 };
        let Some(func) = self.libraries.get(&path).and_then(|l| l.funcs.get(name)) else { return 0 };

        // Resolving the same symbol twice yields the same address.
        let addr = *process
            .names
            .entry((lib, name.to_string()))
            .or_insert_with(|| {
                let slot = process.next_symbol.fetch_add(1, Ordering::Relaxed);
                let addr = SymbolAddr(TEXT_BASE + slot * TEXT_STRIDE);
                process.symbols.insert(addr, func.clone());
                addr
            });
        addr.0
    }

    fn alloc_mem(&self, proc: ProcHandle, size: usize) -> u64 {
        self.process(proc)
            .and_then(|p| p.memory.alloc(size))
            .map_or(0, |addr| addr.0)
    }

    fn free_mem(&self, proc: ProcHandle, addr: EngineAddr) -> i32 {
        match self.process(proc) {
            Some(p) if p.memory.free(addr) => 0,
            _ => -1,
        }
    }

    fn read_mem(&self, proc: ProcHandle, dst: &mut [u8], src: EngineAddr) -> i32 {
        match self.process(proc) {
            Some(p) => status(p.memory.read(src, dst)),
            None => -1,
        }
    }

    fn write_mem(&self, proc: ProcHandle, dst: EngineAddr, src: &[u8]) -> i32 {
        match self.process(proc) {
            Some(p) => status(p.memory.write(dst, src)),
            None => -1,
        }
    }

    fn submit_call(&self, ctx: CtxHandle, addr: SymbolAddr, args: &CallArgs) -> u64 {
        // An unknown address is accepted and faults when it runs.
        self.enqueue(ctx, |proc| Work::Call {
            func: self.process(proc).and_then(|p| p.symbols.get(&addr).map(|f| f.value().clone())),
            args: *args,
        })
    }

    fn submit_write(&self, ctx: CtxHandle, dst: EngineAddr, src: Vec<u8>) -> u64 {
        self.enqueue(ctx, |_| Work::Write { dst, bytes: src })
    }

    fn submit_read(&self, ctx: CtxHandle, dst: HostBuffer, src: EngineAddr) -> u64 {
        self.enqueue(ctx, |_| Work::Read { src, dst })
    }

    fn wait_call(&self, ctx: CtxHandle, req: u64) -> CallState {
        let result = self
            .contexts
            .get(&ctx)
            .and_then(|c| c.inflight.remove(&req))
            .map(|(_, rx)| rx);

        match result {
            Some(rx) => rx.blocking_recv().unwrap_or(CallState::Error),
            None => CallState::Error,
        }
    }

    fn poll_call(&self, ctx: CtxHandle, req: u64) -> CallState {
        let Some(context) = self.contexts.get(&ctx) else {
            return CallState::Error;
        };

        let Some(polled) = context.inflight.get_mut(&req).map(|mut rx| rx.try_recv()) else {
            return CallState::Error;
        };

        match polled {
            Ok(state) => {
                context.inflight.remove(&req);
                state
            }
            Err(TryRecvError::Empty) => CallState::Unfinished,
            Err(TryRecvError::Closed) => {
                context.inflight.remove(&req);
                CallState::Error
            }
        }
    }
}
