//! Send hand-built RoCE v1 datagrams through a raw Ethernet socket, for
//! hosts without an RDMA NIC. Needs `CAP_NET_RAW`.
//!
//! Usage: `raw_sender <iface> <dst-mac> <src-mac> <qpn> [message-size]`
//!
//! GIDs are the link-local ones derived from the MACs. One datagram goes out
//! per second until Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use udverbs::raw::RawSocket;
use udverbs::wire::{HeaderBuilder, MacAddr};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        bail!("usage: raw_sender <iface> <dst-mac> <src-mac> <qpn> [message-size]");
    }
    let dst: MacAddr = args[1].parse()?;
    let src: MacAddr = args[2].parse()?;
    let qpn: u32 = args[3]
        .parse()
        .with_context(|| format!("bad QPN {}", args[3]))?;
    let message_size: usize = match args.get(4) {
        Some(s) => s.parse().with_context(|| format!("bad message size {}", s))?,
        None => 1024,
    };

    // SAFETY: the handler only stores to an atomic.
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };

    let template = HeaderBuilder::new(message_size)
        .macs(dst, src)
        .gids(src.link_local_gid(), dst.link_local_gid())
        .dest_qp(qpn)
        .build()?;
    let sock = RawSocket::open(&args[0])?;

    let mut payload = vec![0u8; message_size];
    let mut frame = vec![0u8; template.frame_len()];
    let mut sent = 0u64;
    while !STOP.load(Ordering::Relaxed) {
        let n = payload.len().min(8);
        payload[..n].copy_from_slice(&sent.to_le_bytes()[..n]);
        sock.send_with(&template, &payload, &mut frame)?;
        sent += 1;
        if sent == 1 {
            println!("{:?}", template);
        }
        thread::sleep(Duration::from_secs(1));
    }

    println!("sent {} frames on {}", sent, sock.interface());
    Ok(())
}
