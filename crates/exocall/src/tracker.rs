//! Request bookkeeping for a single context.
//!
//! Maps exocall's own [`RequestId`]s to the transport's raw ids and enforces
//! the consume-once rule. Ids come from a per-context counter starting at 1,
//! so an id below the counter that is no longer tracked has been consumed.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::error::Error;
use crate::error::RequestFault;
use crate::error::Result;
use crate::handles::EngineAddr;
use crate::handles::RequestId;
use crate::handles::SymbolAddr;
use crate::transport::CallState;

/// Lifecycle of a tracked request.
///
/// Terminal states are never stored: the wait or peek that observes them
/// removes the entry and hands the outcome to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    /// A wait or peek is talking to the transport about this request.
    Claimed,
}

/// What a request does on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Call(SymbolAddr),
    Read { addr: EngineAddr, len: usize },
    Write { addr: EngineAddr, len: usize },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(addr) => write!(f, "call {}", addr),
            Self::Read { addr, len } => write!(f, "read {}B at {}", len, addr),
            Self::Write { addr, len } => write!(f, "write {}B at {}", len, addr),
        }
    }
}

#[derive(Debug)]
struct Entry {
    raw: u64,
    target: Target,
    slot: Slot,
}

pub(crate) struct RequestTracker {
    entries: DashMap<RequestId, Entry>,
    seq: AtomicU64,
}

impl RequestTracker {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Records freshly submitted work and mints its id.
    pub(crate) fn register(&self, raw: u64, target: Target) -> RequestId {
        let id = RequestId(self.seq.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(id, Entry { raw, target, slot: Slot::Pending });
        id
    }

    /// Claims a pending request for retrieval and returns its raw id.
    pub(crate) fn claim(&self, id: RequestId) -> Result<u64> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Err(self.rejection(id));
        };

        if entry.slot == Slot::Claimed {
            return Err(Error::InvalidRequest { id, reason: RequestFault::Claimed });
        }

        entry.slot = Slot::Claimed;
        Ok(entry.raw)
    }

    /// Returns a claimed request to the pending state.
    pub(crate) fn release(&self, id: RequestId) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.slot = Slot::Pending;
        }
    }

    /// Applies the transport's verdict to a claimed request.
    ///
    /// Terminal states consume the entry. `None` means the entry vanished
    /// while claimed, which only happens when the context was closed.
    pub(crate) fn settle(&self, id: RequestId, state: CallState) -> Option<Result<u64>> {
        if state == CallState::Unfinished {
            self.release(id);
            return Some(Err(Error::NotReady { id }));
        }

        let (_, entry) = self.entries.remove(&id)?;
        let outcome = match state {
            CallState::Ok(value) => Ok(value),
            CallState::Exception => Err(Error::CallException { id }),
            CallState::Error | CallState::Unfinished => Err(Error::CallFailed { id }),
        };

        tracing::trace!(req = %id, target = %entry.target, ok = outcome.is_ok(), "request consumed");
        Some(outcome)
    }

    /// Forgets every outstanding request. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of requests not yet consumed.
    pub(crate) fn outstanding(&self) -> usize {
        self.entries.len()
    }

    fn rejection(&self, id: RequestId) -> Error {
        let reason = if id.0 != 0 && id.0 < self.seq.load(Ordering::Relaxed) {
            RequestFault::Consumed
        } else {
            RequestFault::Unknown
        };
        Error::InvalidRequest { id, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYM: Target = Target::Call(SymbolAddr(0x1000));

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let tracker = RequestTracker::new();
        let a = tracker.register(10, SYM);
        let b = tracker.register(10, SYM);
        assert!(b > a);
        assert_eq!(tracker.outstanding(), 2);
    }

    #[test]
    fn test_terminal_state_consumes_once() {
        let tracker = RequestTracker::new();
        let id = tracker.register(5, SYM);

        assert_eq!(tracker.claim(id), Ok(5));
        assert_eq!(tracker.settle(id, CallState::Ok(9)), Some(Ok(9)));
        assert_eq!(
            tracker.claim(id),
            Err(Error::InvalidRequest { id, reason: RequestFault::Consumed })
        );
    }

    #[test]
    fn test_unfinished_releases_claim() {
        let tracker = RequestTracker::new();
        let id = tracker.register(5, SYM);

        tracker.claim(id).unwrap();
        assert_eq!(tracker.settle(id, CallState::Unfinished), Some(Err(Error::NotReady { id })));
        assert_eq!(tracker.claim(id), Ok(5));
    }

    #[test]
    fn test_double_claim_rejected() {
        let tracker = RequestTracker::new();
        let id = tracker.register(5, SYM);

        tracker.claim(id).unwrap();
        assert_eq!(
            tracker.claim(id),
            Err(Error::InvalidRequest { id, reason: RequestFault::Claimed })
        );
    }

    #[test]
    fn test_unknown_id() {
        let tracker = RequestTracker::new();
        let id = RequestId(42);
        assert_eq!(
            tracker.claim(id),
            Err(Error::InvalidRequest { id, reason: RequestFault::Unknown })
        );
    }

    #[test]
    fn test_errored_requests_are_consumed_too() {
        let tracker = RequestTracker::new();
        let a = tracker.register(1, SYM);
        let b = tracker.register(2, SYM);

        tracker.claim(a).unwrap();
        tracker.claim(b).unwrap();
        assert_eq!(tracker.settle(a, CallState::Exception), Some(Err(Error::CallException { id: a })));
        assert_eq!(tracker.settle(b, CallState::Error), Some(Err(Error::CallFailed { id: b })));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_transfers_share_the_id_space() {
        let tracker = RequestTracker::new();
        let write = tracker.register(1, Target::Write { addr: EngineAddr(0x40), len: 8 });
        let call = tracker.register(2, SYM);
        let read = tracker.register(3, Target::Read { addr: EngineAddr(0x40), len: 8 });

        assert!(write < call && call < read);
        assert_eq!(tracker.claim(read), Ok(3));
        assert_eq!(tracker.settle(read, CallState::Error), Some(Err(Error::CallFailed { id: read })));
        assert_eq!(tracker.outstanding(), 2);
    }

    #[test]
    fn test_settle_after_clear() {
        let tracker = RequestTracker::new();
        let id = tracker.register(1, SYM);
        tracker.claim(id).unwrap();
        assert_eq!(tracker.clear(), 1);
        assert_eq!(tracker.settle(id, CallState::Ok(1)), None);
    }
}
