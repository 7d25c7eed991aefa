//! Type-safe handles for engine resources.
//!
//! The native offload API hands out bare integers for everything: process
//! pointers, context pointers, library tokens, symbol addresses, data
//! addresses and request ids. exocall wraps each of them in its own newtype
//! so a library token can never be passed where a symbol address is
//! expected. The compiler catches it.

use std::fmt;

/// Declares a `u64`-backed handle with a prefixed `Display`.
macro_rules! handle {
    ($(#[$doc:meta])* $name:ident, $prefix:literal, hex) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{:#x}"), self.0)
            }
        }
    };
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

/// Index of an accelerator node on this host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

handle!(
    /// Transport-level handle of an engine process.
    ProcHandle, "proc", hex
);

handle!(
    /// Transport-level handle of an open context.
    CtxHandle, "ctx", hex
);

handle!(
    /// Registry key of a context inside its owning [`Process`](crate::Process).
    ///
    /// Unlike [`CtxHandle`], this is minted by exocall and never reused for
    /// the lifetime of the process.
    ContextId, "context"
);

handle!(
    /// Token of a library loaded into an engine process.
    LibraryHandle, "lib", hex
);

handle!(
    /// Entry point of a function in the engine address space.
    SymbolAddr, "sym", hex
);

handle!(
    /// Data address in the engine address space.
    EngineAddr, "addr", hex
);

handle!(
    /// Identifier of one asynchronous call issued on a context.
    ///
    /// Ids are unique within their context and strictly increasing.
    RequestId, "req"
);

impl EngineAddr {
    /// Returns the address `offset` bytes past this one.
    pub fn offset(self, offset: u64) -> Option<EngineAddr> {
        self.0.checked_add(offset).map(EngineAddr)
    }
}
