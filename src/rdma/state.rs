//! Queue pair state machine.

use std::fmt;

/// Queue pair state.
///
/// Only the forward path used by unreliable datagram queue pairs is modelled.
/// Every transition must go to the immediate successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QpState {
    /// Freshly created; cannot post anything.
    Reset,
    /// Initialized; receive requests may be posted but nothing is delivered.
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
}

impl QpState {
    /// The state this one may legally transition into, if any.
    #[inline]
    pub fn successor(self) -> Option<QpState> {
        match self {
            QpState::Reset => Some(QpState::Init),
            QpState::Init => Some(QpState::Rtr),
            QpState::Rtr => Some(QpState::Rts),
            QpState::Rts => None,
        }
    }

    /// Whether `self -> to` is a single legal step.
    #[inline]
    pub fn can_transition_to(self, to: QpState) -> bool {
        self.successor() == Some(to)
    }

    /// Whether receive work requests may be posted in this state.
    #[inline]
    pub fn can_post_recv(self) -> bool {
        self >= QpState::Init
    }

    /// Whether inbound datagrams are delivered in this state.
    #[inline]
    pub fn can_receive(self) -> bool {
        self >= QpState::Rtr
    }

    /// Whether send work requests may be posted in this state.
    #[inline]
    pub fn can_send(self) -> bool {
        self == QpState::Rts
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_skipping() {
        assert!(QpState::Reset.can_transition_to(QpState::Init));
        assert!(QpState::Init.can_transition_to(QpState::Rtr));
        assert!(QpState::Rtr.can_transition_to(QpState::Rts));
        assert!(!QpState::Reset.can_transition_to(QpState::Rtr));
        assert!(!QpState::Init.can_transition_to(QpState::Rts));
        assert!(!QpState::Rts.can_transition_to(QpState::Reset));
        assert!(!QpState::Rtr.can_transition_to(QpState::Rtr));
    }

    #[test]
    fn test_capabilities() {
        assert!(!QpState::Reset.can_post_recv());
        assert!(QpState::Init.can_post_recv());
        assert!(!QpState::Init.can_receive());
        assert!(QpState::Rtr.can_receive());
        assert!(!QpState::Rtr.can_send());
        assert!(QpState::Rts.can_send());
    }
}
