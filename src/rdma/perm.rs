use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Memory region access permissions.
///
/// Bit values follow `enum ibv_access_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);

    /// Raw flag bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is also set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Permission {
    /// Local write only: all buffers in this crate are filled by the NIC or
    /// read by it, never accessed remotely.
    fn default() -> Self {
        Self::LOCAL_WRITE
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
