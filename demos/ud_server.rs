//! Receive UD datagrams on an RDMA device until Ctrl-C.
//!
//! Usage: `ud_server <device> [--listen] [config.toml]`
//!
//! Prints the local endpoint for the client. With `--listen`, also waits for
//! a client on TCP port 13337 and exchanges endpoints with it.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context as _, Result};
use udverbs::prelude::*;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(device) = args.next() else {
        bail!("usage: ud_server <device> [--listen] [config.toml]");
    };
    let mut listen = false;
    let mut config = BenchConfig::default();
    for arg in args {
        if arg == "--listen" {
            listen = true;
        } else {
            config = BenchConfig::load(&arg).with_context(|| format!("loading {}", arg))?;
        }
    }

    // SAFETY: the handler only stores to an atomic.
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };

    let verbs = Verbs::new();
    let ctx = TransportContext::open(&verbs, &device, config.queue_depth)?;
    let ep = ctx.endpoint();
    println!("LID: {}\nQPN: {}\nGID: {}", ep.lid, ep.qpn, ep.gid);

    let result = {
        let mut pump = RecvPump::new(
            RequestRing::receiver(&ctx, config.message_size)?,
            CompletionReaper::new(&ctx, config.poll_batch),
        );
        pump.start()?;
        if listen {
            let peer = Connecter::new(None)?.exchange(&ep)?;
            println!("client: {}", peer);
        }
        run_loop(&mut pump, &STOP, &LoopOptions::from(&config))
    };

    // Tear down whichever way the loop ended.
    ctx.close()?;
    let summary = result?;
    println!(
        "received {} datagrams ({} bytes) in {:?}, {:.3} Gbit/s",
        summary.messages,
        summary.bytes,
        summary.elapsed,
        summary.gbps()
    );
    Ok(())
}
