//! Runs a short offload session against the simulated engine.
//!
//! The engine node comes from `VE_NODE_NUMBER`; log filtering from `RUST_LOG`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use exocall::Arg;
use exocall::CallArgs;
use exocall::HostBuffer;
use exocall::NodeId;
use exocall::Process;
use exocall::sim::SimFault;
use exocall::sim::SimLibrary;
use exocall::sim::SimTransport;

fn libdemo() -> SimLibrary {
    SimLibrary::new()
        .function("add", |_, args| {
            let a = args.i64(0).unwrap_or(0);
            let b = args.i64(1).unwrap_or(0);
            Ok(a.wrapping_add(b) as u64)
        })
        .function("sum_words", |mem, args| {
            let base = args.addr(0).ok_or(SimFault::Error)?;
            let count = args.u64(1).unwrap_or(0);
            let mut total = 0u64;
            for i in 0..count {
                let addr = base.offset(i * 8).ok_or(SimFault::Error)?;
                total = total.wrapping_add(mem.read_u64(addr)?);
            }
            Ok(total)
        })
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // serve the first few nodes so VE_NODE_NUMBER can pick one
    let sim = (0..4)
        .fold(SimTransport::builder(), |b, n| b.node(NodeId(n)))
        .library("libdemo.so", libdemo())
        .build();

    let proc = Process::builder(Arc::new(sim))
        .node_from_env()
        .build()
        .context("starting engine process")?;
    info!(node = %proc.node(), proc = %proc.raw_handle(), "engine process up");

    let lib = proc.load_library("libdemo.so")?;
    let add = proc.resolve_symbol(lib, "add")?;
    let sum_words = proc.resolve_symbol(lib, "sum_words")?;
    let ctx = proc.open_context()?;

    let req = ctx.call_async(add, &CallArgs::new(&[Arg::I64(40), Arg::I64(2)])?)?;
    let sum = loop {
        match ctx.peek_result(req) {
            Err(e) if e.is_retryable() => thread::sleep(Duration::from_millis(1)),
            other => break other?,
        }
    };
    info!(%req, sum, "add finished");

    let words: Vec<u64> = (1..=8).collect();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let buf = proc.alloc_mem(bytes.len())?;

    // the copy and the call share the context's queue, so no wait in between
    let copy = ctx.async_write_mem(buf, &bytes)?;
    let req = ctx.call_async(sum_words, &CallArgs::new(&[buf.into(), Arg::U64(words.len() as u64)])?)?;
    let total = ctx.wait_result(req)?;
    ctx.wait_result(copy)?;
    info!(%req, %buf, total, "sum_words finished");

    let back = HostBuffer::zeroed(bytes.len());
    let read = ctx.async_read_mem(&back, buf)?;
    ctx.wait_result(read)?;
    if back.to_vec() != bytes {
        warn!(%buf, "engine buffer changed under the call");
    }
    if total != words.iter().sum::<u64>() {
        warn!(total, "engine sum disagrees with host");
    }

    proc.free_mem(buf)?;
    proc.close_context(&ctx)?;
    proc.destroy()?;
    info!("engine process destroyed");
    Ok(())
}
