// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Receive path: ring refill, completion handling and packet assembly.

use log::trace;

use crate::{
    buf::{BufInfo, BufPool},
    config::LifConfig,
    cq::CompletionQueue,
    error::IonicResult,
    hal::{DmaDirection, DmaOps, Doorbell, IonicHal, RxPage},
    hw::{
        CompDesc, ETH_P_8021Q, MAX_SG_ELEMS, QueueType, RxCsumFlags, RxOpcode, RxPktType,
        RxqComp, RxqDesc, RxqSgDesc,
    },
    ring::{DescRing, SlotInfo},
    stack::{HashType, NetStack, RxPacket},
    stats::{DebugStats, RateLimit, RxStats, log_ratelimited},
};

/// Buffers per receive slot: the main one plus one per SG element.
pub const RX_BUFS_PER_DESC: usize = 1 + MAX_SG_ELEMS;

/// Software state of one receive slot.
pub struct RxDescInfo<P> {
    bufs: [BufInfo<P>; RX_BUFS_PER_DESC],
    npages: usize,
    posted: bool,
}

impl<P> RxDescInfo<P> {
    pub fn bufs(&self) -> &[BufInfo<P>] {
        &self.bufs
    }

    /// Buffers handed to the device in the last fill.
    pub const fn npages(&self) -> usize {
        self.npages
    }
}

impl<P> Default for RxDescInfo<P> {
    fn default() -> Self {
        Self {
            bufs: core::array::from_fn(|_| BufInfo::new()),
            npages: 0,
            posted: false,
        }
    }
}

impl<P> SlotInfo for RxDescInfo<P> {
    type Cb = ();

    fn set_cb(&mut self, _: ()) {
        self.posted = true;
    }

    fn take_cb(&mut self) -> Option<()> {
        core::mem::take(&mut self.posted).then_some(())
    }
}

/// Receive offloads passed up with packets.
#[derive(Debug, Clone, Copy)]
struct RxFeatures {
    hash: bool,
    csum: bool,
    vlan_strip: bool,
}

/// A receive ring with its buffers.
pub struct RxQueue<P> {
    ring: DescRing<RxqDesc, RxqSgDesc, RxDescInfo<P>>,
    pool: BufPool,
    index: u16,
    max_sg_elems: usize,
    frame_len: usize,
    copybreak: usize,
    features: RxFeatures,
    debug_stats: bool,
    rl: RateLimit,
    pub stats: RxStats,
    pub dbg: DebugStats,
}

impl<P: RxPage> RxQueue<P> {
    pub fn new(index: u16, hw_index: u32, config: &LifConfig) -> IonicResult<Self> {
        Ok(Self {
            ring: DescRing::new(config.nrxq_descs, QueueType::RxQ, hw_index)?,
            pool: BufPool::new(config)?,
            index,
            max_sg_elems: config.rx_max_sg_elems.min(MAX_SG_ELEMS),
            frame_len: config.rx_frame_len(),
            copybreak: config.rx_copybreak as usize,
            features: RxFeatures {
                hash: config.rx_hash,
                csum: config.rx_csum,
                vlan_strip: config.vlan_rx_strip,
            },
            debug_stats: config.debug_stats,
            rl: RateLimit::new(),
            stats: RxStats::default(),
            dbg: DebugStats::default(),
        })
    }

    pub const fn index(&self) -> u16 {
        self.index
    }

    pub fn ring(&self) -> &DescRing<RxqDesc, RxqSgDesc, RxDescInfo<P>> {
        &self.ring
    }

    /// Posts buffers into every free slot, then rings the doorbell once.
    ///
    /// Buffers already held by a slot are reused as-is. An allocation failure
    /// stops the fill early; the slot being built is not posted and keeps the
    /// buffers it got, so the next fill picks up where this one stopped.
    pub fn fill<H>(&mut self, hal: &H)
    where
        H: DmaOps<Page = P> + Doorbell,
    {
        let len = self.frame_len;
        let page_size = self.pool.page_size();
        let mut posted = 0;

        for _ in 0..self.ring.space_avail() {
            let slot = self.ring.head_slot();
            let bufs = &mut slot.info.bufs;
            let mut remain_len = len;

            let buf = &mut bufs[0];
            if buf.is_empty() && self.pool.allocate(hal, buf, true, &mut self.stats).is_err() {
                slot.desc.clear_buf();
                break;
            }
            let frag_len = remain_len.min(page_size - buf.page_offset());
            slot.desc.set_buf(buf.bus_addr().as_u64(), frag_len as u16);
            remain_len -= frag_len;
            let mut nfrags = 1;

            let mut failed = false;
            for j in 0..self.max_sg_elems {
                if remain_len == 0 {
                    break;
                }
                let elem = &mut slot.sg.elems[j];
                let buf = &mut bufs[j + 1];
                if buf.is_empty() && self.pool.allocate(hal, buf, false, &mut self.stats).is_err()
                {
                    elem.set_buf(0, 0);
                    failed = true;
                    break;
                }
                let frag_len = remain_len.min(page_size - buf.page_offset());
                elem.set_buf(buf.bus_addr().as_u64(), frag_len as u16);
                remain_len -= frag_len;
                nfrags += 1;
            }
            if failed {
                break;
            }

            slot.desc.set_opcode(if nfrags > 1 { RxOpcode::Sg } else { RxOpcode::Simple });
            slot.info.npages = nfrags;
            self.ring.post(hal, false, ());
            self.stats.buffers_posted += 1;
            if self.debug_stats {
                self.dbg.record_post(false);
            }
            posted += 1;
        }

        if posted > 0 {
            self.ring.ring_doorbell(hal);
            if self.debug_stats {
                self.dbg.doorbells += 1;
            }
        }
        trace!("rxq{}: posted {posted} buffers", self.index);
    }

    /// Handles one completion record. Returns false, leaving the record in
    /// place, when it is not new or does not match the tail slot.
    pub fn service<H, S>(
        &mut self,
        hal: &H,
        stack: &S,
        in_reset: bool,
        comp: &RxqComp,
        done_color: bool,
    ) -> bool
    where
        H: DmaOps<Page = P>,
        S: NetStack<Page = P>,
    {
        if !comp.is_new(done_color) {
            return false;
        }
        if self.ring.is_empty() {
            self.stats.comp_err += 1;
            log_ratelimited!(self.rl, warn, "rxq{}: completion on empty ring", self.index);
            return false;
        }
        let idx = self.ring.tail();
        if idx != comp.comp_index() {
            self.stats.comp_err += 1;
            log_ratelimited!(
                self.rl,
                warn,
                "rxq{}: completion index {} expected {idx}",
                self.index,
                comp.comp_index()
            );
            return false;
        }
        self.ring.advance_tail();
        self.clean(hal, stack, in_reset, idx, comp);
        self.ring.slot_mut(idx).info.take_cb();
        true
    }

    fn clean<H, S>(&mut self, hal: &H, stack: &S, in_reset: bool, idx: u16, comp: &RxqComp)
    where
        H: DmaOps<Page = P>,
        S: NetStack<Page = P>,
    {
        if comp.status() != 0 || in_reset {
            self.stats.dropped += 1;
            return;
        }
        let len = comp.len() as usize;
        if len > self.frame_len {
            self.stats.dropped += 1;
            log_ratelimited!(self.rl, warn, "rxq{}: packet too large, len {len}", self.index);
            return;
        }

        self.stats.pkts += 1;
        self.stats.bytes += len as u64;

        let copy = len <= self.copybreak;
        let pkt = if copy {
            self.copybreak(hal, stack, idx, len)
        } else {
            self.frags(hal, stack, idx, comp)
        };
        let Some(mut pkt) = pkt else {
            self.stats.dropped += 1;
            return;
        };

        pkt.record_rx_queue(self.index);

        if self.features.hash {
            match comp.pkt_type() {
                RxPktType::Ipv4 | RxPktType::Ipv6 => pkt.set_hash(comp.rss_hash(), HashType::L3),
                RxPktType::Ipv4Tcp
                | RxPktType::Ipv6Tcp
                | RxPktType::Ipv4Udp
                | RxPktType::Ipv6Udp => pkt.set_hash(comp.rss_hash(), HashType::L4),
                RxPktType::NonIp | RxPktType::Other(_) => {}
            }
        }

        let flags = comp.csum_flags();
        if self.features.csum && flags.contains(RxCsumFlags::CALC) {
            pkt.set_csum_complete(comp.csum());
            self.stats.csum_complete += 1;
        } else {
            self.stats.csum_none += 1;
        }
        if flags.intersects(RxCsumFlags::ANY_BAD) {
            self.stats.csum_error += 1;
        }

        if self.features.vlan_strip && flags.contains(RxCsumFlags::VLAN) {
            pkt.put_vlan_tag(ETH_P_8021Q, comp.vlan_tci());
            self.stats.vlan_stripped += 1;
        }

        if copy {
            stack.gro_receive(self.index, pkt);
        } else {
            stack.gro_frags(self.index, pkt);
        }
    }

    /// Copies a small packet out of the main buffer, which stays posted-ready.
    fn copybreak<H, S>(&mut self, hal: &H, stack: &S, idx: u16, len: usize) -> Option<S::Rx>
    where
        H: DmaOps<Page = P>,
        S: NetStack<Page = P>,
    {
        let Some(mut pkt) = stack.alloc_rx(self.index, len) else {
            log_ratelimited!(self.rl, warn, "rxq{}: packet alloc failed", self.index);
            self.stats.alloc_err += 1;
            return None;
        };
        let buf = &self.ring.info(idx).bufs[0];
        let Some(page) = buf.page() else {
            stack.free_rx(pkt);
            return None;
        };
        let addr = buf.bus_addr();
        hal.sync_single_for_cpu(addr, len, DmaDirection::FromDevice);
        page.read(buf.page_offset(), pkt.put(len));
        hal.sync_single_for_device(addr, len, DmaDirection::FromDevice);
        Some(pkt)
    }

    /// Attaches the slot's buffers to a packet without copying.
    fn frags<H, S>(&mut self, hal: &H, stack: &S, idx: u16, comp: &RxqComp) -> Option<S::Rx>
    where
        H: DmaOps<Page = P>,
        S: NetStack<Page = P>,
    {
        let Some(mut pkt) = stack.get_frags(self.index) else {
            log_ratelimited!(self.rl, warn, "rxq{}: packet alloc failed", self.index);
            self.stats.alloc_err += 1;
            return None;
        };
        let page_size = self.pool.page_size();
        let nbufs = comp.num_sg_elems() as usize + 1;
        if nbufs > RX_BUFS_PER_DESC {
            self.stats.comp_err += 1;
            stack.free_rx(pkt);
            return None;
        }

        let mut len = comp.len() as usize;
        let slot = self.ring.slot_mut(idx);
        for buf in slot.info.bufs.iter_mut().take(nbufs) {
            let Some(page) = buf.page() else {
                stack.free_rx(pkt);
                return None;
            };
            let frag_len = len.min(page_size - buf.page_offset());
            len -= frag_len;

            hal.sync_single_for_cpu(buf.bus_addr(), frag_len, DmaDirection::FromDevice);
            pkt.add_frag(page.clone(), buf.page_offset(), frag_len, page_size);

            if !self.pool.recycle(hal, buf, frag_len) {
                self.pool.detach(hal, buf);
            }
            if len == 0 {
                break;
            }
        }
        Some(pkt)
    }

    /// Releases every buffer of the ring without delivering anything.
    pub fn empty<H: DmaOps<Page = P>>(&mut self, hal: &H) {
        let mut idx = self.ring.tail();
        while idx != self.ring.head() {
            let slot = self.ring.slot_mut(idx);
            slot.desc.clear_buf();
            let npages = slot.info.npages;
            for buf in slot.info.bufs.iter_mut().take(npages) {
                self.pool.release(hal, buf);
            }
            slot.info.npages = 0;
            slot.info.take_cb();
            idx = self.ring.next(idx);
        }
        self.ring.reset_tail();

        // Buffers parked in idle slots by recycling or an aborted fill.
        for i in 0..self.ring.num_descs() {
            let slot = self.ring.slot_mut(i);
            for buf in slot.info.bufs.iter_mut().filter(|b| !b.is_empty()) {
                self.pool.release(hal, buf);
            }
        }
    }
}

/// A receive queue bound to its completion queue and interrupt.
pub struct RxQcq<P> {
    pub q: RxQueue<P>,
    pub cq: CompletionQueue<RxqComp>,
    intr_index: u32,
    hw_index: u32,
    armed: bool,
}

impl<P: RxPage> RxQcq<P> {
    pub fn new(index: u16, hw_index: u32, intr_index: u32, config: &LifConfig) -> IonicResult<Self> {
        Ok(Self {
            q: RxQueue::new(index, hw_index, config)?,
            cq: CompletionQueue::new(config.nrxq_descs)?,
            intr_index,
            hw_index,
            armed: false,
        })
    }

    pub const fn intr_index(&self) -> u32 {
        self.intr_index
    }

    pub const fn armed(&self) -> bool {
        self.armed
    }

    /// Called when the event queue reports this queue; allows the next arm.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Asks the device, once, to report the next completion via the event
    /// queue.
    pub fn arm<B: Doorbell + ?Sized>(&mut self, db: &B) {
        if !self.armed {
            self.armed = true;
            crate::napi::arm_doorbell(db, QueueType::RxQ, self.hw_index, self.cq.tail());
        }
    }

    /// Consumes up to `budget` completions.
    pub fn service<H, S>(&mut self, hal: &H, stack: &S, in_reset: bool, budget: u32) -> u32
    where
        H: IonicHal<Page = P>,
        S: NetStack<Page = P>,
    {
        let q = &mut self.q;
        self.cq
            .service(budget, |comp, color| q.service(hal, stack, in_reset, comp, color))
    }
}
