//! Send UD datagrams to a server until Ctrl-C.
//!
//! Usage:
//!
//! - `ud_client <device> <gid> <lid> <qpn> [config.toml]`, with the values
//!   `ud_server` printed;
//! - `ud_client <device> --connect <server-ipv4> [config.toml]`, to fetch
//!   them from a `ud_server --listen`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context as _, Result};
use udverbs::prelude::*;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

const USAGE: &str = "usage: ud_client <device> (<gid> <lid> <qpn> | --connect <ipv4>) [config.toml]";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!(USAGE);
    }
    let device = &args[0];

    // SAFETY: the handler only stores to an atomic.
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };

    let verbs = Verbs::new();
    let (mut ctx, peer, config) = if args[1] == "--connect" {
        let server: Ipv4Addr = args[2]
            .parse()
            .with_context(|| format!("bad server address {}", args[2]))?;
        let config = load_config(args.get(3))?;
        let ctx = TransportContext::open(&verbs, device, config.queue_depth)?;
        let peer = Connecter::new(Some(server))?.exchange(&ctx.endpoint())?;
        (ctx, peer, config)
    } else {
        if args.len() < 4 {
            bail!(USAGE);
        }
        let peer = QpEndpoint::parse(&args[2], &args[1], &args[3])?;
        let config = load_config(args.get(4))?;
        let ctx = TransportContext::open(&verbs, device, config.queue_depth)?;
        (ctx, peer, config)
    };
    ctx.make_sender(&peer)?;
    println!("sending to {}", peer);

    let result = {
        let mut pump = SendPump::new(
            RequestRing::sender(&ctx, config.message_size)?,
            CompletionReaper::new(&ctx, config.poll_batch),
        );
        let mut seq = 0u64;
        pump.fill_all(|_, buf| {
            let n = buf.len().min(8);
            buf[..n].copy_from_slice(&seq.to_le_bytes()[..n]);
            seq += 1;
        });
        run_loop(&mut pump, &STOP, &LoopOptions::from(&config))
    };

    ctx.close()?;
    let summary = result?;
    println!(
        "sent {} datagrams ({} bytes) in {:?}, {:.3} Gbit/s",
        summary.messages,
        summary.bytes,
        summary.elapsed,
        summary.gbps()
    );
    Ok(())
}

fn load_config(path: Option<&String>) -> Result<BenchConfig> {
    match path {
        Some(path) => BenchConfig::load(path).with_context(|| format!("loading {}", path)),
        None => Ok(BenchConfig::default()),
    }
}
