//! Two software devices on one in-process fabric, one sending to the other.
//!
//! Usage: `ud_loopback [config.toml]`. Runs until Ctrl-C, or until 100 000
//! datagrams have been received.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context as _, Result};
use udverbs::bench::{Backoff, Throughput};
use udverbs::prelude::*;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

const TARGET: u64 = 100_000;

fn stamp(seq: u64, buf: &mut [u8]) {
    let n = buf.len().min(8);
    buf[..n].copy_from_slice(&seq.to_le_bytes()[..n]);
}

fn main() -> Result<()> {
    // SAFETY: the handler only stores to an atomic.
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };

    let config = match std::env::args().nth(1) {
        Some(path) => BenchConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => BenchConfig::default(),
    };

    let fabric = SoftFabric::new()
        .with_device(SoftDevice::new("soft0", 1, "fe80::1".parse()?))
        .with_device(SoftDevice::new("soft1", 2, "fe80::2".parse()?));

    let server = TransportContext::open(&fabric, "soft0", config.queue_depth)?;
    println!("{}", server.endpoint());
    let client =
        TransportContext::open_sender(&fabric, "soft1", config.queue_depth, &server.endpoint())?;

    let summary = {
        let mut recv = RecvPump::new(
            RequestRing::receiver(&server, config.message_size)?,
            CompletionReaper::new(&server, config.poll_batch),
        );
        let mut send = SendPump::new(
            RequestRing::sender(&client, config.message_size)?,
            CompletionReaper::new(&client, config.poll_batch),
        );

        let mut seq = 0u64;
        send.fill_all(|_, buf| {
            stamp(seq, buf);
            seq += 1;
        });
        recv.start()?;
        send.start()?;

        let opts = LoopOptions::from(&config);
        let mut backoff = Backoff::new(opts.backoff_min, opts.backoff_max);
        let mut meter = Throughput::new("received", opts.report_interval);
        let mut short = 0u64;

        while !STOP.load(Ordering::Relaxed) && meter.messages() < TARGET {
            send.step_with(|_, buf| {
                stamp(seq, buf);
                seq += 1;
            })?;
            let got = recv.step_with(|c, payload| {
                if payload.len() != config.message_size {
                    short += 1;
                    eprintln!("slot {}: {} payload bytes", c.slot, payload.len());
                }
            })?;
            if got.messages == 0 {
                backoff.snooze();
            } else {
                backoff.reset();
                meter.record(got);
            }
        }
        if short > 0 {
            bail!("{} datagrams arrived truncated", short);
        }
        meter.summary()
    };

    let stats = fabric.stats();
    println!(
        "received {} datagrams ({} bytes) in {:?}, {:.3} Gbit/s; {} frames on the wire, {} dropped without a receive posted",
        summary.messages,
        summary.bytes,
        summary.elapsed,
        summary.gbps(),
        stats.frames,
        stats.dropped_no_recv,
    );

    client.close()?;
    server.close()?;
    Ok(())
}
