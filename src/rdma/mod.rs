//! RDMA resources and the UD send/receive engine.

pub mod context;
pub mod endpoint;
pub mod gid;
mod owned;
pub mod perm;
pub mod pool;
pub mod provider;
pub mod reaper;
pub mod ring;
pub mod state;
pub mod type_alias;
pub mod wr;
