use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::*;

/// Opcode of a work completion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    #[default]
    Send,
    /// Receive request.
    Recv,
    /// Anything a UD queue pair does not produce.
    Other(u32),
}

impl WcOpcode {
    /// Decode an `enum ibv_wc_opcode` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => WcOpcode::Send,
            128 => WcOpcode::Recv,
            other => WcOpcode::Other(other),
        }
    }
}

/// Status of a work completion.
///
/// Discriminants follow `enum ibv_wc_status`. The error messages are
/// borrowed from [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and the buffers it references may be reused.
    #[default]
    #[error("success")]
    Success = 0,

    /// The message does not fit the port MTU or the receive buffers.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal queue pair consistency error, e.g. an address handle from
    /// another protection domain.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A scatter/gather element does not reference a valid memory region.
    #[error("local protection error")]
    LocProtErr = 4,

    /// Outstanding when the queue pair entered the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("memory window bind error")]
    MwBindErr = 6,

    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// For UD queue pairs attached to an SRQ, the responder aborted.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    #[error("invalid EE context number")]
    InvEecnErr = 17,

    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Anything else, including statuses this crate does not know.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Decode an `enum ibv_wc_status` value.
    pub fn from_raw(raw: u32) -> Self {
        use WcStatus::*;
        match raw {
            0 => Success,
            1 => LocLenErr,
            2 => LocQpOpErr,
            3 => LocEecOpErr,
            4 => LocProtErr,
            5 => WrFlushErr,
            6 => MwBindErr,
            7 => BadRespErr,
            8 => LocAccessErr,
            9 => RemInvReqErr,
            10 => RemAccessErr,
            11 => RemOpErr,
            12 => RetryExcErr,
            13 => RnrRetryExcErr,
            14 => LocRddViolErr,
            15 => RemInvRdReqErr,
            16 => RemAbortErr,
            17 => InvEecnErr,
            18 => InvEecStateErr,
            19 => FatalErr,
            20 => RespTimeoutErr,
            _ => GeneralErr,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Work completion.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Wc {
    pub wr_id: WrId,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes written into the receive buffers, GRH included.
    pub byte_len: u32,
    /// Local queue pair the completion belongs to.
    pub qp_num: Qpn,
    /// Remote queue pair a receive came from.
    pub src_qp: Qpn,
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_numbering() {
        for raw in 0..=21u32 {
            assert_eq!(WcStatus::from_raw(raw) as u32, raw);
        }
        assert_eq!(WcStatus::from_raw(99), WcStatus::GeneralErr);
        assert_eq!(WcStatus::LocLenErr.to_string(), "local length error");
    }

    #[test]
    fn test_opcode() {
        assert_eq!(WcOpcode::from_raw(0), WcOpcode::Send);
        assert_eq!(WcOpcode::from_raw(128), WcOpcode::Recv);
        assert_eq!(WcOpcode::from_raw(1), WcOpcode::Other(1));
    }
}
