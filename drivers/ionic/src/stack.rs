// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Network-stack side of the datapath: packet handles, delivery and
//! subqueue flow control.

use crate::{error::IonicResult, hal::RxPage};

/// Segmentation offload request carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsoInfo {
    /// Payload bytes per segment.
    pub size: u16,
    /// The tunnel header also needs a checksum.
    pub outer_csum: bool,
}

/// Partial checksum request: the device sums from `start` and stores the
/// result `offset` bytes further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsumOffload {
    pub start: u16,
    pub offset: u16,
}

/// Network protocol of a packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
    Other,
}

/// Layers covered by a receive hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    L3,
    L4,
}

/// An outgoing packet.
///
/// `data` is the linear head; the remaining `len() - data().len()` bytes live
/// in `nr_frags()` fragments.
pub trait TxPacket {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> &[u8];

    /// Writable view of the linear head, valid after [`TxPacket::cow_head`].
    fn data_mut(&mut self) -> &mut [u8];

    fn nr_frags(&self) -> usize;

    fn frag(&self, i: usize) -> &[u8];

    /// Transmit queue chosen by the stack.
    fn queue_mapping(&self) -> u16;

    fn gso(&self) -> Option<GsoInfo>;

    fn encapsulation(&self) -> bool;

    fn csum_partial(&self) -> Option<CsumOffload>;

    fn vlan_tag(&self) -> Option<u16>;

    /// Collapses all fragments into the linear head.
    fn linearize(&mut self) -> IonicResult;

    /// Makes the header region private to the driver.
    fn cow_head(&mut self) -> IonicResult;

    /// Protocol of the outer (`inner == false`) or inner network header.
    fn l3_proto(&self, inner: bool) -> L3Proto;

    /// Offset of the network header from the start of `data`.
    fn network_offset(&self, inner: bool) -> usize;

    /// Offset of the transport header from the start of `data`.
    fn transport_offset(&self, inner: bool) -> usize;

    /// Called once the packet's last descriptor is written.
    fn tx_timestamp(&mut self) {}
}

/// A packet being assembled on receive.
pub trait RxPacket<P: RxPage> {
    /// Extends the linear area by `len` bytes and returns the new bytes.
    fn put(&mut self, len: usize) -> &mut [u8];

    /// Attaches `len` bytes of `page` at `offset` as the next fragment.
    fn add_frag(&mut self, page: P, offset: usize, len: usize, truesize: usize);

    fn record_rx_queue(&mut self, index: u16);

    fn set_hash(&mut self, hash: u32, ty: HashType);

    /// The device summed the whole packet.
    fn set_csum_complete(&mut self, csum: u16);

    fn put_vlan_tag(&mut self, proto: u16, tci: u16);
}

/// The network stack the datapath delivers to.
pub trait NetStack {
    /// Page handle of the device side, carried by received fragments.
    type Page: RxPage;
    type Tx: TxPacket;
    type Rx: RxPacket<Self::Page>;

    fn stop_subqueue(&self, index: u16);

    fn wake_subqueue(&self, index: u16);

    fn subqueue_stopped(&self, index: u16) -> bool;

    /// More packets are queued behind the current one.
    fn xmit_more(&self) -> bool {
        false
    }

    /// Byte queue limit accounting for posted bytes.
    fn sent_queue(&self, index: u16, bytes: usize);

    /// Byte queue limit accounting for completed packets.
    fn completed_queue(&self, index: u16, pkts: u32, bytes: usize);

    /// The packet was sent.
    fn consume_tx(&self, pkt: Self::Tx);

    /// The packet was dropped.
    fn drop_tx(&self, pkt: Self::Tx);

    /// Allocates a packet with `len` bytes of linear room.
    fn alloc_rx(&self, index: u16, len: usize) -> Option<Self::Rx>;

    /// Returns the queue's fragment-assembly packet.
    fn get_frags(&self, index: u16) -> Option<Self::Rx>;

    fn free_rx(&self, pkt: Self::Rx);

    /// Delivers a linear packet.
    fn gro_receive(&self, index: u16, pkt: Self::Rx);

    /// Delivers a packet built from [`NetStack::get_frags`].
    fn gro_frags(&self, index: u16, pkt: Self::Rx);

    /// Ends a poll cycle; returns whether interrupts may be unmasked.
    fn napi_complete_done(&self, index: u16, work_done: u32) -> bool;
}
