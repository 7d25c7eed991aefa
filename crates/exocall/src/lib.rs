//! # exocall
//!
//! Offloads function calls to an accelerator engine process.
//!
//! A [`Process`] starts an engine process on one node, loads libraries into
//! it and resolves their symbols. A [`Context`] opened on that process
//! submits asynchronous calls to those symbols and hands back
//! [`RequestId`]s, which are later redeemed for results by blocking
//! ([`Context::wait_result`]) or polling ([`Context::peek_result`]).
//! Arguments travel in a fixed-size [`CallArgs`] descriptor. Memory copies
//! can also be queued on a context, ordered with its calls.
//!
//! The actual engine is behind the [`Transport`] trait. [`sim::SimTransport`]
//! is an in-process stand-in.

pub mod args;
pub mod buffer;
pub mod context;
pub mod error;
pub mod handles;
pub mod process;
pub mod sim;
pub mod transport;

mod tracker;

pub use args::Arg;
pub use args::CallArgs;
pub use args::MAX_ARGS;
pub use buffer::HostBuffer;
pub use context::Context;
pub use error::Error;
pub use error::Result;
pub use handles::ContextId;
pub use handles::CtxHandle;
pub use handles::EngineAddr;
pub use handles::LibraryHandle;
pub use handles::NodeId;
pub use handles::ProcHandle;
pub use handles::RequestId;
pub use handles::SymbolAddr;
pub use process::Process;
pub use process::ProcessBuilder;
pub use transport::CallState;
pub use transport::Transport;
