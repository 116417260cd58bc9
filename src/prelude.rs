//! The `udverbs` prelude.
//!
//! Everything a benchmark program usually needs, in one import.

pub use crate::bench::{
    run_loop, LoopOptions, LoopSummary, Pump, RecvPump, SendPump, SessionError, StepStats,
};
pub use crate::ctrl::{BenchConfig, Connecter};
pub use crate::rdma::context::{ConfigError, TransportContext, TransportError};
pub use crate::rdma::endpoint::QpEndpoint;
pub use crate::rdma::gid::Gid;
pub use crate::rdma::pool::BufferPool;
#[cfg(feature = "ibverbs")]
pub use crate::rdma::provider::Verbs;
pub use crate::rdma::provider::{Provider, SoftDevice, SoftFabric, WcStatus};
pub use crate::rdma::reaper::{Completion, CompletionError, CompletionReaper};
pub use crate::rdma::ring::{PostError, RequestRing, SlotOwner};
pub use crate::rdma::state::QpState;
pub use crate::wire::{HeaderBuilder, MacAddr, PacketTemplate, RocePacket};
