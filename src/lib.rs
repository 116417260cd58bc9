//! An Unreliable Datagram transport for raw point-to-point throughput
//! benchmarks over InfiniBand and RoCE.
//!
//! `udverbs` has two halves:
//!
//! - a bit-exact RoCE v1 codec ([`wire`]): Ethernet, GRH, BTH and DETH
//!   headers with the invariant CRC, usable on its own to craft frames for
//!   the plain-Ethernet path in [`raw`];
//! - a zero-copy UD engine ([`rdma`]): a [`TransportContext`] owning the
//!   device, protection domain, completion queue and queue pair, a
//!   [`RequestRing`] of preregistered send or receive slots, and a
//!   [`CompletionReaper`] mapping completions back to slots without
//!   allocating.
//!
//! The engine runs on any [`Provider`]. With the `ibverbs` feature,
//! [`Verbs`](rdma::provider::Verbs) drives real hardware through libibverbs.
//! [`SoftFabric`] is always available: an in-process fabric that moves real
//! RoCE v1 frames between software devices, so everything can be exercised
//! without an RDMA NIC.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::AtomicBool;
//! use udverbs::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = SoftFabric::new()
//!         .with_device(SoftDevice::new("soft0", 1, "fe80::1".parse()?))
//!         .with_device(SoftDevice::new("soft1", 2, "fe80::2".parse()?));
//!
//!     let server = TransportContext::open(&fabric, "soft0", 20)?;
//!     let client = TransportContext::open_sender(&fabric, "soft1", 20, &server.endpoint())?;
//!
//!     let mut recv = RecvPump::new(
//!         RequestRing::receiver(&server, 1024)?,
//!         CompletionReaper::new(&server, 10),
//!     );
//!     recv.start()?;
//!
//!     let mut send = SendPump::new(
//!         RequestRing::sender(&client, 1024)?,
//!         CompletionReaper::new(&client, 10),
//!     );
//!     let opts = LoopOptions {
//!         max_messages: Some(100),
//!         ..Default::default()
//!     };
//!     run_loop(&mut send, &AtomicBool::new(false), &opts)?;
//!
//!     let got = recv.step()?;
//!     assert_eq!(got.messages, 10);
//!     Ok(())
//! }
//! ```

#[macro_use]
mod utils;

#[cfg(feature = "ibverbs")]
mod bindings;

pub mod bench;
pub mod ctrl;
pub mod prelude;
pub mod raw;
pub mod rdma;
pub mod wire;

pub use rdma::context::{ConfigError, TransportContext, TransportError};
pub use rdma::endpoint::QpEndpoint;
pub use rdma::gid::Gid;
pub use rdma::provider::{Provider, SoftDevice, SoftFabric};
pub use rdma::reaper::{Completion, CompletionError, CompletionReaper};
pub use rdma::ring::{PostError, RequestRing};
