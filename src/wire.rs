//! Wire formats for the packets exchanged between transports.
//!
//! All headers are tightly packed little-endian structures. Every packet
//! begins with the common fields (opcode, RPC id, flags); data-carrying
//! and control opcodes append their own fields after them.

use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::type_alias::*;

/// Flag bit: the packet was sent from client to server. Its absence means
/// the packet was sent from server to client.
pub(crate) const FROM_CLIENT: u8 = 1;

/// Opposite of [`FROM_CLIENT`]; provided to make code more readable.
pub(crate) const FROM_SERVER: u8 = 0;

/// Flag bit (DATA only): the packet is being sent in response to a RESEND
/// request, i.e. it has already been transmitted before.
pub(crate) const RETRANSMISSION: u8 = 2;

/// Flag bit (RESEND only): the receiver has no state for this RPC, so the
/// sender must reset its transmit state and start over from scratch.
pub(crate) const RESTART: u8 = 4;

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PacketOpcode {
    /// An entire request or response message in a single packet.
    AllData = 20,

    /// A portion of a multi-packet request or response message.
    Data = 21,

    /// Receiver-issued token advancing the permissible transmit offset.
    Grant = 22,

    /// Debugging aid: ask the recipient to dump its time trace to the log.
    LogTimeTrace = 23,

    /// Ask the sender to retransmit a range of message bytes.
    Resend = 24,

    /// Liveness signal; resets the recipient's silence timers, nothing else.
    Busy = 25,

    /// Client-to-server unilateral cancellation of an RPC.
    Abort = 26,
}

impl PacketOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            20 => Some(Self::AllData),
            21 => Some(Self::Data),
            22 => Some(Self::Grant),
            23 => Some(Self::LogTimeTrace),
            24 => Some(Self::Resend),
            25 => Some(Self::Busy),
            26 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Human-readable name of an opcode byte, for diagnostics.
pub(crate) fn opcode_symbol(opcode: u8) -> &'static str {
    match PacketOpcode::from_u8(opcode) {
        Some(PacketOpcode::AllData) => "ALL_DATA",
        Some(PacketOpcode::Data) => "DATA",
        Some(PacketOpcode::Grant) => "GRANT",
        Some(PacketOpcode::LogTimeTrace) => "LOG_TIME_TRACE",
        Some(PacketOpcode::Resend) => "RESEND",
        Some(PacketOpcode::Busy) => "BUSY",
        Some(PacketOpcode::Abort) => "ABORT",
        None => "UNKNOWN",
    }
}

/// A unique identifier for an RPC.
///
/// `client_id` distinguishes the initiating transport instance across the
/// cluster; `sequence` is monotone per client. The derived ordering compares
/// `client_id` first, then `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId {
    pub client_id: ClientId,
    pub sequence: Sequence,
}

impl RpcId {
    #[inline(always)]
    pub(crate) fn new(client_id: ClientId, sequence: Sequence) -> Self {
        Self {
            client_id,
            sequence,
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.sequence)
    }
}

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            #[inline(always)]
            pub fn [< set_ $field >](&mut self, val: $field_ty) {
                self.bits[$lsb..=$msb].store_le::<$field_ty>(val);
            }

            #[inline(always)]
            pub fn $field(&self) -> $field_ty {
                self.bits[$lsb..=$msb].load_le::<$field_ty>()
            }
        }
    };
}

/// Define a packed header type over a `u8`-backed bit array.
///
/// Every header carries the common fields in its first 18 bytes:
///
/// | Lsb | Msb |   Name    |
/// | --: | --: | --------- |
/// |   0 |   7 | opcode    |
/// |   8 |  71 | client_id |
/// |  72 | 135 | sequence  |
/// | 136 | 143 | flags     |
macro_rules! packet_header {
    (
        $(#[$meta:meta])*
        $name:ident, $bits:expr, { $($field:ident: $ty:ty [$lsb:expr, $msb:expr]),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub(crate) struct $name {
            bits: bv::BitArr!(for $bits, in u8),
        }

        impl $name {
            /// Size of this header on the wire, in bytes.
            pub const WIRE_SIZE: usize = $bits / 8;

            impl_accessor!(opcode, u8, 0, 7);
            impl_accessor!(client_id, u64, 8, 71);
            impl_accessor!(sequence, u64, 72, 135);
            impl_accessor!(flags, u8, 136, 143);

            $(impl_accessor!($field, $ty, $lsb, $msb);)*

            #[inline]
            pub fn rpc_id(&self) -> RpcId {
                RpcId::new(self.client_id(), self.sequence())
            }

            #[inline]
            pub fn set_rpc_id(&mut self, id: RpcId) {
                self.set_client_id(id.client_id);
                self.set_sequence(id.sequence);
            }

            /// View the header as raw wire bytes.
            #[inline(always)]
            pub fn as_bytes(&self) -> &[u8] {
                self.bits.as_raw_slice()
            }

            /// Parse the first `WIRE_SIZE` bytes of `buf` as this header.
            /// Returns `None` if `buf` is too short.
            pub fn from_bytes(buf: &[u8]) -> Option<Self> {
                if buf.len() < Self::WIRE_SIZE {
                    return None;
                }
                let mut this = Self::default();
                this.bits
                    .as_raw_mut_slice()
                    .copy_from_slice(&buf[..Self::WIRE_SIZE]);
                Some(this)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    bits: bv::BitArray::ZERO,
                }
            }
        }
    };
}

packet_header!(
    /// Header fields common to all packet types; also the complete wire
    /// format for BUSY, ABORT and LOG_TIME_TRACE packets.
    CommonHeader,
    144,
    {}
);

packet_header!(
    /// An ALL_DATA packet carries an entire request or response message.
    /// The bytes after the header are the whole message.
    AllDataHeader,
    160,
    {
        message_length: u16 [144, 159],
    }
);

packet_header!(
    /// A DATA packet carries a portion of a request or response message,
    /// starting at `offset`. `total_length` describes the whole message,
    /// not this packet.
    DataHeader,
    240,
    {
        total_length: u32 [144, 175],
        offset: u32 [176, 207],
        unscheduled_bytes: u32 [208, 239],
    }
);

packet_header!(
    /// A GRANT tells the sender it may now transmit all message bytes up to
    /// (but not including) `offset`, stamping them with `priority`.
    GrantHeader,
    184,
    {
        offset: u32 [144, 175],
        priority: u8 [176, 183],
    }
);

packet_header!(
    /// A RESEND asks the sender to retransmit `length` bytes of the message
    /// starting at `offset`, using `priority`, even if it already sent them.
    /// With the RESTART flag the range and priority are advisory only and
    /// the sender starts over from scratch.
    ResendHeader,
    216,
    {
        offset: u32 [144, 175],
        length: u32 [176, 207],
        priority: u8 [208, 215],
    }
);

impl CommonHeader {
    pub fn new(opcode: PacketOpcode, rpc_id: RpcId, flags: u8) -> Self {
        let mut this = Self::default();
        this.set_opcode(opcode as u8);
        this.set_rpc_id(rpc_id);
        this.set_flags(flags);
        this
    }
}

impl AllDataHeader {
    pub fn new(rpc_id: RpcId, flags: u8, message_length: u16) -> Self {
        let mut this = Self::default();
        this.set_opcode(PacketOpcode::AllData as u8);
        this.set_rpc_id(rpc_id);
        this.set_flags(flags);
        this.set_message_length(message_length);
        this
    }
}

impl DataHeader {
    pub fn new(
        rpc_id: RpcId,
        total_length: u32,
        offset: u32,
        unscheduled_bytes: u32,
        flags: u8,
    ) -> Self {
        let mut this = Self::default();
        this.set_opcode(PacketOpcode::Data as u8);
        this.set_rpc_id(rpc_id);
        this.set_flags(flags);
        this.set_total_length(total_length);
        this.set_offset(offset);
        this.set_unscheduled_bytes(unscheduled_bytes);
        this
    }
}

impl GrantHeader {
    pub fn new(rpc_id: RpcId, offset: u32, priority: u8, flags: u8) -> Self {
        let mut this = Self::default();
        this.set_opcode(PacketOpcode::Grant as u8);
        this.set_rpc_id(rpc_id);
        this.set_flags(flags);
        this.set_offset(offset);
        this.set_priority(priority);
        this
    }
}

impl ResendHeader {
    pub fn new(rpc_id: RpcId, offset: u32, length: u32, priority: u8, flags: u8) -> Self {
        let mut this = Self::default();
        this.set_opcode(PacketOpcode::Resend as u8);
        this.set_rpc_id(rpc_id);
        this.set_flags(flags);
        this.set_offset(offset);
        this.set_length(length);
        this.set_priority(priority);
        this
    }
}

impl fmt::Debug for CommonHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(opcode_symbol(self.opcode()))
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .finish()
    }
}

impl fmt::Debug for AllDataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ALL_DATA")
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .field("message_length", &self.message_length())
            .finish()
    }
}

impl fmt::Debug for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DATA")
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .field("total_length", &self.total_length())
            .field("offset", &self.offset())
            .field("unscheduled_bytes", &self.unscheduled_bytes())
            .finish()
    }
}

impl fmt::Debug for GrantHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GRANT")
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .field("offset", &self.offset())
            .field("priority", &self.priority())
            .finish()
    }
}

impl fmt::Debug for ResendHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RESEND")
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .field("offset", &self.offset())
            .field("length", &self.length())
            .field("priority", &self.priority())
            .finish()
    }
}
