// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Device-visible descriptor and completion layouts.
//!
//! Every multi-byte field is little-endian on the wire. The rest of the crate
//! only sees the decoded views ([`TxDescFields`], the accessors on
//! [`RxqComp`], ...); bit positions never leave this module.

use bitflags::bitflags;

/// Scatter-gather elements carried by one descriptor slot.
pub const MAX_SG_ELEMS: usize = 8;

/// Length of an Ethernet header without VLAN tag.
pub const ETH_HLEN: usize = 14;

/// 802.1Q VLAN ethertype.
pub const ETH_P_8021Q: u16 = 0x8100;

const ADDR_LEN: u32 = 52;
const TXQ_DESC_OPCODE_MASK: u64 = 0xf;
const TXQ_DESC_OPCODE_SHIFT: u32 = 4;
const TXQ_DESC_FLAGS_MASK: u64 = 0xf;
const TXQ_DESC_FLAGS_SHIFT: u32 = 0;
const TXQ_DESC_NSGE_MASK: u64 = 0xf;
const TXQ_DESC_NSGE_SHIFT: u32 = 8;
const TXQ_DESC_ADDR_MASK: u64 = (1 << ADDR_LEN) - 1;
const TXQ_DESC_ADDR_SHIFT: u32 = 12;

/// Color bit inside the last byte of every completion record.
pub const COMP_COLOR_MASK: u8 = 0x80;

const RXQ_COMP_PKT_TYPE_MASK: u8 = 0x7f;

/// Returns whether a completion's color byte carries the expected color.
#[inline]
pub const fn color_match(color: u8, done_color: bool) -> bool {
    ((color & COMP_COLOR_MASK) != 0) == done_color
}

/// Opcode of a transmit descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOpcode {
    /// No checksum offload.
    CsumNone,
    /// Partial checksum: the device completes the sum from `csum_start`.
    CsumPartial,
    /// Full hardware checksum.
    CsumHw,
    /// TCP segmentation offload.
    Tso,
    /// Any other 4-bit value read back from the ring.
    Reserved(u8),
}

impl TxOpcode {
    /// Raw 4-bit encoding.
    pub const fn bits(self) -> u8 {
        match self {
            Self::CsumNone => 0,
            Self::CsumPartial => 1,
            Self::CsumHw => 2,
            Self::Tso => 3,
            Self::Reserved(v) => v & 0xf,
        }
    }

    /// Decodes a raw 4-bit opcode.
    pub const fn from_bits(v: u8) -> Self {
        match v & 0xf {
            0 => Self::CsumNone,
            1 => Self::CsumPartial,
            2 => Self::CsumHw,
            3 => Self::Tso,
            v => Self::Reserved(v),
        }
    }
}

bitflags! {
    /// Per-descriptor transmit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u8 {
        /// Insert `vlan_tci`.
        const VLAN    = 1 << 0;
        /// Packet is tunnel-encapsulated.
        const ENCAP   = 1 << 1;
        /// Last descriptor of a TSO packet.
        const TSO_EOT = 1 << 2;
        /// First descriptor of a TSO packet.
        const TSO_SOT = 1 << 3;
    }
}

/// Packs opcode, flags, SG count and address into the descriptor command word.
pub const fn encode_txq_desc_cmd(opcode: TxOpcode, flags: TxFlags, nsge: u8, addr: u64) -> u64 {
    let mut cmd = (opcode.bits() as u64 & TXQ_DESC_OPCODE_MASK) << TXQ_DESC_OPCODE_SHIFT;
    cmd |= (flags.bits() as u64 & TXQ_DESC_FLAGS_MASK) << TXQ_DESC_FLAGS_SHIFT;
    cmd |= (nsge as u64 & TXQ_DESC_NSGE_MASK) << TXQ_DESC_NSGE_SHIFT;
    cmd |= (addr & TXQ_DESC_ADDR_MASK) << TXQ_DESC_ADDR_SHIFT;
    cmd
}

/// Inverse of [`encode_txq_desc_cmd`].
pub const fn decode_txq_desc_cmd(cmd: u64) -> (TxOpcode, TxFlags, u8, u64) {
    let opcode = TxOpcode::from_bits(((cmd >> TXQ_DESC_OPCODE_SHIFT) & TXQ_DESC_OPCODE_MASK) as u8);
    let flags =
        TxFlags::from_bits_truncate(((cmd >> TXQ_DESC_FLAGS_SHIFT) & TXQ_DESC_FLAGS_MASK) as u8);
    let nsge = ((cmd >> TXQ_DESC_NSGE_SHIFT) & TXQ_DESC_NSGE_MASK) as u8;
    let addr = (cmd >> TXQ_DESC_ADDR_SHIFT) & TXQ_DESC_ADDR_MASK;
    (opcode, flags, nsge, addr)
}

/// Decoded view of a [`TxqDesc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDescFields {
    pub opcode: TxOpcode,
    pub flags: TxFlags,
    pub nsge: u8,
    pub addr: u64,
    pub len: u16,
    pub vlan_tci: u16,
    /// `csum_start` for partial checksum, `hdr_len` for TSO.
    pub hword1: u16,
    /// `csum_offset` for partial checksum, `mss` for TSO.
    pub hword2: u16,
}

/// Transmit descriptor as the device reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxqDesc {
    cmd: u64,
    len: u16,
    vlan_tci: u16,
    hword1: u16,
    hword2: u16,
}

impl TxqDesc {
    /// Encodes a descriptor from its fields.
    pub const fn encode(f: &TxDescFields) -> Self {
        Self {
            cmd: encode_txq_desc_cmd(f.opcode, f.flags, f.nsge, f.addr).to_le(),
            len: f.len.to_le(),
            vlan_tci: f.vlan_tci.to_le(),
            hword1: f.hword1.to_le(),
            hword2: f.hword2.to_le(),
        }
    }

    /// Decodes the descriptor.
    pub const fn decode(&self) -> TxDescFields {
        let (opcode, flags, nsge, addr) = decode_txq_desc_cmd(u64::from_le(self.cmd));
        TxDescFields {
            opcode,
            flags,
            nsge,
            addr,
            len: u16::from_le(self.len),
            vlan_tci: u16::from_le(self.vlan_tci),
            hword1: u16::from_le(self.hword1),
            hword2: u16::from_le(self.hword2),
        }
    }
}

/// One (address, length) pair of a transmit scatter-gather list.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxqSgElem {
    addr: u64,
    len: u16,
    rsvd: [u16; 3],
}

impl TxqSgElem {
    pub const fn new(addr: u64, len: u16) -> Self {
        Self {
            addr: addr.to_le(),
            len: len.to_le(),
            rsvd: [0; 3],
        }
    }

    pub const fn addr(&self) -> u64 {
        u64::from_le(self.addr)
    }

    pub const fn len(&self) -> u16 {
        u16::from_le(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transmit scatter-gather list of one slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxqSgDesc {
    pub elems: [TxqSgElem; MAX_SG_ELEMS],
}

/// Transmit completion record written by the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxqComp {
    status: u8,
    rsvd: u8,
    comp_index: u16,
    rsvd2: [u8; 11],
    color: u8,
}

impl TxqComp {
    /// Builds a record the way the device writes it.
    pub const fn new(comp_index: u16, status: u8, color: bool) -> Self {
        Self {
            status,
            rsvd: 0,
            comp_index: comp_index.to_le(),
            rsvd2: [0; 11],
            color: if color { COMP_COLOR_MASK } else { 0 },
        }
    }

    pub const fn status(&self) -> u8 {
        self.status
    }
}

/// Receive descriptor opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOpcode {
    /// Single buffer.
    Simple = 0,
    /// Main buffer plus scatter-gather buffers.
    Sg = 1,
}

/// Receive descriptor as the device reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxqDesc {
    opcode: u8,
    rsvd: [u8; 5],
    len: u16,
    addr: u64,
}

impl RxqDesc {
    pub fn set_opcode(&mut self, opcode: RxOpcode) {
        self.opcode = opcode as u8;
    }

    pub fn set_buf(&mut self, addr: u64, len: u16) {
        self.addr = addr.to_le();
        self.len = len.to_le();
    }

    /// Zeroes address and length, leaving the opcode.
    pub fn clear_buf(&mut self) {
        self.set_buf(0, 0);
    }

    pub const fn opcode(&self) -> Option<RxOpcode> {
        match self.opcode {
            0 => Some(RxOpcode::Simple),
            1 => Some(RxOpcode::Sg),
            _ => None,
        }
    }

    pub const fn addr(&self) -> u64 {
        u64::from_le(self.addr)
    }

    pub const fn len(&self) -> u16 {
        u16::from_le(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One (address, length) pair of a receive scatter-gather list.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxqSgElem {
    addr: u64,
    len: u16,
    rsvd: [u8; 6],
}

impl RxqSgElem {
    pub fn set_buf(&mut self, addr: u64, len: u16) {
        self.addr = addr.to_le();
        self.len = len.to_le();
    }

    pub const fn addr(&self) -> u64 {
        u64::from_le(self.addr)
    }

    pub const fn len(&self) -> u16 {
        u16::from_le(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive scatter-gather list of one slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxqSgDesc {
    pub elems: [RxqSgElem; MAX_SG_ELEMS],
}

bitflags! {
    /// Checksum and tag indications of a receive completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxCsumFlags: u8 {
        const VLAN    = 1 << 0;
        const CALC    = 1 << 1;
        const TCP_OK  = 1 << 2;
        const TCP_BAD = 1 << 3;
        const UDP_OK  = 1 << 4;
        const UDP_BAD = 1 << 5;
        const IP_OK   = 1 << 6;
        const IP_BAD  = 1 << 7;

        const ANY_BAD = Self::TCP_BAD.bits() | Self::UDP_BAD.bits() | Self::IP_BAD.bits();
    }
}

/// Packet classification reported by a receive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPktType {
    NonIp,
    Ipv4,
    Ipv4Tcp,
    Ipv4Udp,
    Ipv6,
    Ipv6Tcp,
    Ipv6Udp,
    Other(u8),
}

impl RxPktType {
    pub const fn from_bits(v: u8) -> Self {
        match v & RXQ_COMP_PKT_TYPE_MASK {
            0x00 => Self::NonIp,
            0x01 => Self::Ipv4,
            0x03 => Self::Ipv4Tcp,
            0x05 => Self::Ipv4Udp,
            0x08 => Self::Ipv6,
            0x18 => Self::Ipv6Tcp,
            0x28 => Self::Ipv6Udp,
            v => Self::Other(v),
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Self::NonIp => 0x00,
            Self::Ipv4 => 0x01,
            Self::Ipv4Tcp => 0x03,
            Self::Ipv4Udp => 0x05,
            Self::Ipv6 => 0x08,
            Self::Ipv6Tcp => 0x18,
            Self::Ipv6Udp => 0x28,
            Self::Other(v) => v & RXQ_COMP_PKT_TYPE_MASK,
        }
    }
}

/// Receive completion record written by the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxqComp {
    status: u8,
    num_sg_elems: u8,
    comp_index: u16,
    rss_hash: u32,
    csum: u16,
    vlan_tci: u16,
    len: u16,
    csum_flags: u8,
    pkt_type_color: u8,
}

impl RxqComp {
    /// Builds a successful single-buffer record of `len` bytes.
    pub const fn new(comp_index: u16, len: u16, color: bool) -> Self {
        Self {
            status: 0,
            num_sg_elems: 0,
            comp_index: comp_index.to_le(),
            rss_hash: 0,
            csum: 0,
            vlan_tci: 0,
            len: len.to_le(),
            csum_flags: 0,
            pkt_type_color: if color { COMP_COLOR_MASK } else { 0 },
        }
    }

    pub const fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }

    pub const fn with_num_sg_elems(mut self, n: u8) -> Self {
        self.num_sg_elems = n;
        self
    }

    pub const fn with_rss(mut self, pkt_type: RxPktType, hash: u32) -> Self {
        self.pkt_type_color = (self.pkt_type_color & COMP_COLOR_MASK) | pkt_type.bits();
        self.rss_hash = hash.to_le();
        self
    }

    pub const fn with_csum(mut self, flags: RxCsumFlags, csum: u16) -> Self {
        self.csum_flags |= flags.bits();
        self.csum = csum.to_le();
        self
    }

    pub const fn with_vlan(mut self, tci: u16) -> Self {
        self.csum_flags |= RxCsumFlags::VLAN.bits();
        self.vlan_tci = tci.to_le();
        self
    }

    pub const fn status(&self) -> u8 {
        self.status
    }

    pub const fn num_sg_elems(&self) -> u8 {
        self.num_sg_elems
    }

    pub const fn rss_hash(&self) -> u32 {
        u32::from_le(self.rss_hash)
    }

    pub const fn csum(&self) -> u16 {
        u16::from_le(self.csum)
    }

    pub const fn vlan_tci(&self) -> u16 {
        u16::from_le(self.vlan_tci)
    }

    pub const fn len(&self) -> u16 {
        u16::from_le(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn csum_flags(&self) -> RxCsumFlags {
        RxCsumFlags::from_bits_truncate(self.csum_flags)
    }

    pub const fn pkt_type(&self) -> RxPktType {
        RxPktType::from_bits(self.pkt_type_color)
    }
}

/// Common view of completion records for the polling loop.
pub trait CompDesc: Copy + Default {
    /// The raw byte holding the color bit.
    fn color_byte(&self) -> u8;

    /// Descriptor index this record completes.
    fn comp_index(&self) -> u16;

    /// Whether the record is new under the queue's expected color.
    fn is_new(&self, done_color: bool) -> bool {
        color_match(self.color_byte(), done_color)
    }
}

impl CompDesc for TxqComp {
    fn color_byte(&self) -> u8 {
        self.color
    }

    fn comp_index(&self) -> u16 {
        u16::from_le(self.comp_index)
    }
}

impl CompDesc for RxqComp {
    fn color_byte(&self) -> u8 {
        self.pkt_type_color
    }

    fn comp_index(&self) -> u16 {
        u16::from_le(self.comp_index)
    }
}

/// Queue types addressed by the doorbell page.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    AdminQ = 0,
    NotifyQ = 1,
    RxQ = 2,
    TxQ = 3,
    EventQ = 4,
}

/// Doorbell bit asking the device to re-check a queue once.
pub const DBELL_RING_1: u64 = 1 << 16;

/// Queue id field of a doorbell value.
#[inline]
pub const fn dbell_qid(hw_index: u32) -> u64 {
    (hw_index as u64) << 24
}

/// Credit count field of an interrupt credit write.
pub const INTR_CRED_COUNT: u32 = 0xffff;

bitflags! {
    /// Flags accompanying an interrupt credit return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntrCredFlags: u32 {
        /// Unmask the interrupt after crediting.
        const UNMASK         = 1 << 16;
        /// Restart the coalescing timer.
        const RESET_COALESCE = 1 << 24;
    }
}

const _: () = assert!(core::mem::size_of::<TxqDesc>() == 16);
const _: () = assert!(core::mem::size_of::<TxqSgElem>() == 16);
const _: () = assert!(core::mem::size_of::<TxqComp>() == 16);
const _: () = assert!(core::mem::size_of::<RxqDesc>() == 16);
const _: () = assert!(core::mem::size_of::<RxqSgElem>() == 16);
const _: () = assert!(core::mem::size_of::<RxqComp>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txq_cmd_field_positions() {
        let cmd = encode_txq_desc_cmd(TxOpcode::Tso, TxFlags::TSO_SOT | TxFlags::VLAN, 3, 0xabc);
        assert_eq!(cmd & 0xf, 0x9);
        assert_eq!((cmd >> 4) & 0xf, 3);
        assert_eq!((cmd >> 8) & 0xf, 3);
        assert_eq!(cmd >> 12, 0xabc);
    }

    #[test]
    fn txq_desc_decode_matches_fields() {
        let f = TxDescFields {
            opcode: TxOpcode::CsumPartial,
            flags: TxFlags::ENCAP,
            nsge: 2,
            addr: 0x000f_ffff_ffff_f000,
            len: 1514,
            vlan_tci: 7,
            hword1: 34,
            hword2: 16,
        };
        assert_eq!(TxqDesc::encode(&f).decode(), f);
    }

    #[test]
    fn addr_is_truncated_to_52_bits() {
        let (_, _, _, addr) = decode_txq_desc_cmd(encode_txq_desc_cmd(
            TxOpcode::CsumNone,
            TxFlags::empty(),
            0,
            u64::MAX,
        ));
        assert_eq!(addr, (1 << 52) - 1);
    }

    #[test]
    fn unknown_opcode_survives_decode() {
        let (op, ..) = decode_txq_desc_cmd(0xe << 4);
        assert_eq!(op, TxOpcode::Reserved(0xe));
    }

    #[test]
    fn color_only_looks_at_top_bit() {
        assert!(color_match(0x80, true));
        assert!(color_match(0x7f, false));
        assert!(!color_match(0x01, true));
        let c = RxqComp::new(5, 64, true).with_rss(RxPktType::Ipv6Tcp, 1);
        assert!(c.is_new(true));
        assert_eq!(c.pkt_type(), RxPktType::Ipv6Tcp);
        assert_eq!(c.comp_index(), 5);
    }
}
