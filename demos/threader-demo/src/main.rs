//! Threads two small functions into one call chain that shares a single
//! piece of VM state across both calls (the pattern described by the
//! threader's own end-to-end scenario: a chunk's argument 0 is the
//! interpreter's state pointer, carried forward automatically from call to
//! call, while other arguments are set explicitly per call), publishes the
//! chunk through a hook, and jumps through it.

use std::cell::Cell;

use anyhow::{ensure, Result};
use clap::Parser;

use threader_core::{Engine, Hook};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Initial value of the threaded program's VM state counter.
    #[clap(default_value_t = 41)]
    input: u64,
}

/// Stand-in for an interpreter's per-call VM state. Every threaded function
/// in this demo takes a pointer to one of these as its first argument.
#[repr(C)]
struct VmState {
    counter: Cell<u64>,
}

extern "C" fn add_delta(state: *const VmState, delta: u64) {
    let state = unsafe { &*state };
    state.counter.set(state.counter.get() + delta);
}

extern "C" fn double_counter(state: *const VmState) {
    let state = unsafe { &*state };
    state.counter.set(state.counter.get() * 2);
}

extern "C" fn fallback(_state: *const VmState) {
    log::warn!("threader-demo: fell back to the interpreter path");
}

fn main() -> Result<()> {
    env_logger::builder().filter_level(log::LevelFilter::Info).init();
    let args = Args::parse();

    let engine = Engine::new();
    ensure!(!engine.is_disabled(), "engine disabled itself at startup (unsupported architecture?)");

    let hook = Hook::new();
    let fallback_addr = fallback as usize;

    let mut page = engine.start().expect("fresh engine has room for a chunk");
    page.set_arg(1, 42); // second argument to add_delta; argument 0 (VM state) is threaded automatically
    page.call(add_delta as usize);
    page.call(double_counter as usize);
    let chunk_addr = engine
        .finish(page, Some(hook.clone()), fallback_addr)
        .expect("chunk fit in one page");
    log::info!("threaded chunk published at {chunk_addr:#x}");

    // Force the page executable now rather than waiting for enough chunks
    // to cross an OS-page boundary on their own.
    engine.flush();

    let target = hook.load();
    ensure!(target != 0, "hook still points at the transitional fallback value");
    log::info!("hook resolved to {target:#x}");

    let state = VmState { counter: Cell::new(args.input) };

    // SAFETY: `target` is the address `finish` returned, now committed
    // read-execute by `flush`, and the chunk's calling convention matches
    // `extern "C" fn(*const VmState)` by construction (one argument
    // register in, no return value — the side effect lands in `state`).
    let chained: extern "C" fn(*const VmState) = unsafe { std::mem::transmute(target) };
    chained(&state as *const VmState);
    println!("({} + 42) * 2 = {}", args.input, state.counter.get());

    Ok(())
}
