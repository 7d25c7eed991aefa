//! Tests for the wait/peek protocol: polling, blocking and invalidation.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use exocall::Arg;
use exocall::CallArgs;
use exocall::Context;
use exocall::Error;
use exocall::NodeId;
use exocall::Process;
use exocall::RequestId;
use exocall::SymbolAddr;
use exocall::error::RequestFault;
use exocall::sim::SimLibrary;
use exocall::sim::SimTransport;

/// Engine function "slow" that holds each call until the test releases it.
fn gated(value: u64) -> (SimLibrary, mpsc::UnboundedSender<()>) {
    let (release, gate) = mpsc::unbounded_channel::<()>();
    let gate = Mutex::new(gate);
    let lib = SimLibrary::new()
        .function("slow", move |_, _| {
            // a dropped sender also lets the call through
            let _ = gate.lock().unwrap().blocking_recv();
            Ok(value)
        })
        .function("id", |_, args| Ok(args.u64(0).unwrap_or(0)));
    (lib, release)
}

fn setup(value: u64) -> (Process, SymbolAddr, SymbolAddr, mpsc::UnboundedSender<()>) {
    let (lib, release) = gated(value);
    let sim = Arc::new(SimTransport::builder().library("libslow", lib).build());
    let proc = Process::new(sim, NodeId(0)).expect("process");
    let lib = proc.load_library("libslow").expect("library");
    let slow = proc.resolve_symbol(lib, "slow").expect("slow");
    let id = proc.resolve_symbol(lib, "id").expect("id");
    (proc, slow, id, release)
}

/// Polls until the request leaves the pending state.
fn peek_until_done(ctx: &Context, id: RequestId) -> exocall::Result<u64> {
    for _ in 0..5_000 {
        match ctx.peek_result(id) {
            Err(e) if e.is_retryable() => thread::sleep(Duration::from_millis(1)),
            other => return other,
        }
    }
    panic!("{} never finished", id);
}

#[test]
fn test_peek_reports_not_ready_until_released() {
    let (proc, slow, _, release) = setup(99);
    let ctx = proc.open_context().unwrap();
    let req = ctx.call_async(slow, &CallArgs::default()).unwrap();

    for _ in 0..10 {
        assert_eq!(ctx.peek_result(req), Err(Error::NotReady { id: req }));
    }
    assert_eq!(ctx.pending(), 1);

    release.send(()).unwrap();
    assert_eq!(peek_until_done(&ctx, req), Ok(99));
    assert_eq!(
        ctx.peek_result(req),
        Err(Error::InvalidRequest { id: req, reason: RequestFault::Consumed })
    );
}

#[test]
fn test_wait_blocks_until_release() {
    let (proc, slow, _, release) = setup(5);
    let ctx = proc.open_context().unwrap();
    let req = ctx.call_async(slow, &CallArgs::default()).unwrap();

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        release.send(()).unwrap();
    });

    assert_eq!(ctx.wait_result(req), Ok(5));
    releaser.join().unwrap();
}

#[test]
fn test_polling_loop_over_many_contexts() {
    let (proc, slow, id, release) = setup(1);
    let contexts: Vec<Context> = (0..3).map(|_| proc.open_context().unwrap()).collect();

    // one slow call on the first context, quick ones everywhere
    let slow_req = contexts[0].call_async(slow, &CallArgs::default()).unwrap();
    let mut outstanding = Vec::new();
    for (i, ctx) in contexts.iter().enumerate() {
        let req = ctx.call_async(id, &CallArgs::new(&[Arg::U64(100 + i as u64)]).unwrap()).unwrap();
        outstanding.push((i, req));
    }

    let mut done = Vec::new();
    let mut rounds = 0;
    while !outstanding.is_empty() {
        rounds += 1;
        assert!(rounds < 5_000, "polling never converged");

        outstanding.retain(|&(i, req)| match contexts[i].peek_result(req) {
            Ok(v) => {
                done.push((i, v));
                false
            }
            Err(e) if e.is_retryable() => true,
            Err(e) => panic!("unexpected {}", e),
        });

        // the first context is stuck behind the slow call
        if done.len() == 2 && rounds > 10 {
            let _ = release.send(());
        }
        thread::sleep(Duration::from_millis(1));
    }

    done.sort();
    assert_eq!(done, vec![(0, 100), (1, 101), (2, 102)]);
    assert_eq!(contexts[0].wait_result(slow_req), Ok(1));
}

#[test]
fn test_concurrent_waits_on_different_ids() {
    let (proc, _, id, _release) = setup(0);
    let ctx = proc.open_context().unwrap();

    let reqs: Vec<(u64, RequestId)> = (0..16u64)
        .map(|n| (n, ctx.call_async(id, &CallArgs::new(&[Arg::U64(n)]).unwrap()).unwrap()))
        .collect();

    thread::scope(|s| {
        for &(n, req) in &reqs {
            let ctx = &ctx;
            s.spawn(move || assert_eq!(ctx.wait_result(req), Ok(n)));
        }
    });

    assert_eq!(ctx.pending(), 0);
}

#[test]
fn test_close_while_waiting_returns_invalid_context() {
    let (proc, slow, _, release) = setup(3);
    let ctx = proc.open_context().unwrap();
    let req = ctx.call_async(slow, &CallArgs::default()).unwrap();

    let waiter = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.wait_result(req))
    };

    // give the waiter time to block inside the engine
    thread::sleep(Duration::from_millis(50));
    proc.close_context(&ctx).unwrap();
    release.send(()).unwrap();

    assert_eq!(waiter.join().unwrap(), Err(Error::InvalidContext { id: ctx.id() }));
    assert_eq!(ctx.pending(), 0);
}

#[test]
fn test_close_invalidates_pending_request() {
    let (proc, slow, _, release) = setup(3);
    let ctx = proc.open_context().unwrap();
    let req = ctx.call_async(slow, &CallArgs::default()).unwrap();

    proc.close_context(&ctx).unwrap();

    assert_eq!(ctx.wait_result(req), Err(Error::InvalidContext { id: ctx.id() }));
    assert_eq!(ctx.peek_result(req), Err(Error::InvalidContext { id: ctx.id() }));
    assert_eq!(proc.close_context(&ctx), Err(Error::InvalidContext { id: ctx.id() }));

    // let the worker finish the orphaned call
    drop(release);
}

#[test]
fn test_wait_on_other_context_is_rejected() {
    let (proc, _, id, _release) = setup(0);
    let a = proc.open_context().unwrap();
    let b = proc.open_context().unwrap();

    let _ = b.call_async(id, &CallArgs::new(&[Arg::U64(1)]).unwrap()).unwrap();
    let req = a.call_async(id, &CallArgs::new(&[Arg::U64(2)]).unwrap()).unwrap();
    let stray = a.call_async(id, &CallArgs::new(&[Arg::U64(3)]).unwrap()).unwrap();

    // b has issued one id; a's second id is beyond anything b knows
    assert_eq!(
        b.wait_result(stray),
        Err(Error::InvalidRequest { id: stray, reason: RequestFault::Unknown })
    );
    assert_eq!(a.wait_result(req), Ok(2));
    assert_eq!(a.wait_result(stray), Ok(3));
}
