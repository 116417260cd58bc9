/// [`u8`]: **Port number**, identifies a port on an HCA.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies a port on a switch or an HCA in the subnet.
pub type Lid = u16;

/// [`u8`]: **Global identifier (GID) index**, identifies a GID in a port's GID table.
pub type GidIndex = u8;

/// [`u16`]: **Partition key index**, identifies a P_Key in a port's P_Key table.
pub type PkeyIndex = u16;

/// [`u32`]: **Queue pair number**, 24 bits effective.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, 24 bits effective.
pub type Psn = u32;

/// [`u32`]: **Queue key**, guards admission into an unreliable datagram queue pair.
pub type QKey = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u64`]: **Work request identifier**. Always a ring slot index in this crate.
pub type WrId = u64;
