// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Transmit path: descriptor encoding, TSO segmentation, completion cleanup
//! and subqueue flow control.

use core::sync::atomic::{Ordering, fence};

use log::debug;

use crate::{
    config::LifConfig,
    cq::CompletionQueue,
    csum::{tcp_hdrlen, tcp_pseudo_csum},
    error::{IonicError, IonicResult},
    hal::{DmaBusAddress, DmaDirection, DmaOps, Doorbell, IonicHal},
    hw::{
        CompDesc, MAX_SG_ELEMS, QueueType, TxDescFields, TxFlags, TxOpcode, TxqComp, TxqDesc,
        TxqSgDesc, TxqSgElem,
    },
    ring::{DescRing, SlotInfo},
    stack::{NetStack, TxPacket},
    stats::{DebugStats, RateLimit, TxStats, log_ratelimited},
};

/// Free slots demanded after a post so the next packet is likely to fit.
pub const TX_STOP_HEADROOM: usize = 4;

/// What completing a transmit slot involves.
pub enum SlotCb<T> {
    /// A non-final TSO descriptor; only mappings to undo.
    Bare,
    /// The last descriptor of a packet, which is released on completion.
    Packet(T),
}

/// Software state of one transmit slot.
pub struct TxDescInfo<T> {
    cb: Option<SlotCb<T>>,
    bytes: usize,
}

impl<T> TxDescInfo<T> {
    /// Whether the slot is waiting for completion.
    pub fn is_posted(&self) -> bool {
        self.cb.is_some()
    }

    /// Bytes of the packet released from this slot at its last completion.
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

impl<T> Default for TxDescInfo<T> {
    fn default() -> Self {
        Self { cb: None, bytes: 0 }
    }
}

impl<T> SlotInfo for TxDescInfo<T> {
    type Cb = SlotCb<T>;

    fn set_cb(&mut self, cb: SlotCb<T>) {
        self.cb = Some(cb);
    }

    fn take_cb(&mut self) -> Option<SlotCb<T>> {
        self.cb.take()
    }
}

/// Outcome of handing a packet to a transmit queue.
#[derive(Debug)]
pub enum XmitStatus<T> {
    /// The packet is on the ring.
    Queued,
    /// The packet was dropped and released.
    Dropped,
    /// The ring is full; the caller keeps the packet and retries after a wake.
    Busy(T),
}

/// A descriptor mapped at `head` but not posted yet.
#[derive(Debug, Clone, Copy)]
struct PendingDesc {
    addr: DmaBusAddress,
    len: usize,
    nsge: usize,
    /// Mapped with `map_single`.
    single: bool,
}

/// Per-packet TSO constants.
struct TsoParams {
    hdrlen: usize,
    mss: usize,
    flags: TxFlags,
    vlan_tci: u16,
}

/// A transmit ring.
pub struct TxQueue<T> {
    ring: DescRing<TxqDesc, TxqSgDesc, TxDescInfo<T>>,
    index: u16,
    max_sg_elems: usize,
    bql: bool,
    debug_stats: bool,
    rl: RateLimit,
    pub stats: TxStats,
    pub dbg: DebugStats,
}

impl<T: TxPacket> TxQueue<T> {
    pub fn new(index: u16, hw_index: u32, config: &LifConfig) -> IonicResult<Self> {
        Ok(Self {
            ring: DescRing::new(config.ntxq_descs, QueueType::TxQ, hw_index)?,
            index,
            max_sg_elems: config.tx_max_sg_elems.min(MAX_SG_ELEMS),
            bql: config.bql,
            debug_stats: config.debug_stats,
            rl: RateLimit::new(),
            stats: TxStats::default(),
            dbg: DebugStats::default(),
        })
    }

    pub const fn index(&self) -> u16 {
        self.index
    }

    pub fn ring(&self) -> &DescRing<TxqDesc, TxqSgDesc, TxDescInfo<T>> {
        &self.ring
    }

    /// Upper bound of descriptors `pkt` needs. Packets with more fragments
    /// than one descriptor can carry are linearized first.
    pub fn descs_needed(&mut self, pkt: &mut T) -> IonicResult<usize> {
        if let Some(gso) = pkt.gso() {
            if gso.size == 0 {
                return Err(IonicError::BadHeader);
            }
            return Ok(pkt.len().div_ceil(gso.size as usize) + 1);
        }
        if pkt.nr_frags() <= self.max_sg_elems {
            return Ok(1);
        }
        pkt.linearize().map_err(|_| IonicError::Linearize)?;
        self.stats.linearize += 1;
        Ok(1)
    }

    /// Stops the subqueue if fewer than `ndescs` slots are free.
    ///
    /// The stop is published before space is checked again: a completion that
    /// freed slots in between has either seen the stop and woken us, or is
    /// seen here and we wake ourselves.
    pub fn maybe_stop<S: NetStack>(&mut self, stack: &S, ndescs: usize) -> bool {
        if self.ring.has_space(ndescs) {
            return false;
        }
        stack.stop_subqueue(self.index);
        self.stats.stop += 1;

        fence(Ordering::SeqCst);
        if self.ring.has_space(ndescs) {
            stack.wake_subqueue(self.index);
            return false;
        }
        true
    }

    /// Encodes and posts `pkt`.
    pub fn xmit<H, S>(&mut self, hal: &H, stack: &S, mut pkt: T) -> XmitStatus<T>
    where
        H: IonicHal,
        S: NetStack<Page = H::Page, Tx = T>,
    {
        let ndescs = match self.descs_needed(&mut pkt) {
            Ok(n) => n,
            Err(err) => return self.drop_pkt(stack, pkt, err),
        };
        if self.maybe_stop(stack, ndescs) {
            return XmitStatus::Busy(pkt);
        }

        let res = if pkt.gso().is_some() {
            self.tso(hal, &mut pkt)
        } else {
            self.tx(hal, &mut pkt)
        };
        if let Err(err) = res {
            return self.drop_pkt(stack, pkt, err);
        }

        pkt.tx_timestamp();
        if self.bql {
            stack.sent_queue(self.index, pkt.len());
        }
        self.post(hal, !stack.xmit_more(), SlotCb::Packet(pkt));

        self.maybe_stop(stack, TX_STOP_HEADROOM);
        XmitStatus::Queued
    }

    fn drop_pkt<S>(&mut self, stack: &S, pkt: T, err: IonicError) -> XmitStatus<T>
    where
        S: NetStack<Tx = T>,
    {
        log_ratelimited!(self.rl, debug, "txq{}: drop: {err}", self.index);
        self.stats.stop += 1;
        self.stats.drop += 1;
        stack.drop_tx(pkt);
        XmitStatus::Dropped
    }

    fn post<B: Doorbell + ?Sized>(&mut self, db: &B, ring_doorbell: bool, cb: SlotCb<T>) {
        if self.debug_stats {
            self.dbg.record_post(ring_doorbell);
        }
        self.ring.post(db, ring_doorbell, cb);
    }

    fn map_single<H: DmaOps>(&mut self, hal: &H, data: &[u8]) -> IonicResult<DmaBusAddress> {
        hal.map_single(data, DmaDirection::ToDevice).inspect_err(|_| {
            self.stats.dma_map_err += 1;
            log_ratelimited!(self.rl, warn, "txq{}: dma single map failed", self.index);
        })
    }

    fn map_frag<H: DmaOps>(&mut self, hal: &H, data: &[u8]) -> IonicResult<DmaBusAddress> {
        hal.map_frag(data, DmaDirection::ToDevice).inspect_err(|_| {
            self.stats.dma_map_err += 1;
            log_ratelimited!(self.rl, warn, "txq{}: dma frag map failed", self.index);
        })
    }

    /// Writes the head descriptor of a non-TSO packet and its SG list.
    ///
    /// On a mapping failure nothing is posted; mappings made so far for this
    /// packet are left as they are.
    fn tx<H: DmaOps>(&mut self, hal: &H, pkt: &mut T) -> IonicResult {
        let headlen = pkt.data().len();
        let addr = self.map_single(hal, pkt.data())?;

        let vlan = pkt.vlan_tag();
        let mut flags = TxFlags::empty();
        flags.set(TxFlags::VLAN, vlan.is_some());
        flags.set(TxFlags::ENCAP, pkt.encapsulation());

        let (opcode, csum_start, csum_offset) = match pkt.csum_partial() {
            Some(c) => {
                self.stats.csum += 1;
                (TxOpcode::CsumPartial, c.start, c.offset)
            }
            None => {
                self.stats.csum_none += 1;
                (TxOpcode::CsumNone, 0, 0)
            }
        };
        if vlan.is_some() {
            self.stats.vlan_inserted += 1;
        }

        let nfrags = pkt.nr_frags();
        *self.ring.head_slot().desc = TxqDesc::encode(&TxDescFields {
            opcode,
            flags,
            nsge: nfrags as u8,
            addr: addr.as_u64(),
            len: headlen as u16,
            vlan_tci: vlan.unwrap_or(0),
            hword1: csum_start,
            hword2: csum_offset,
        });

        for i in 0..nfrags {
            let frag = pkt.frag(i);
            let addr = self.map_frag(hal, frag)?;
            self.ring.head_slot().sg.elems[i] = TxqSgElem::new(addr.as_u64(), frag.len() as u16);
            self.stats.frags += 1;
        }

        self.stats.pkts += 1;
        self.stats.bytes += pkt.len() as u64;
        Ok(())
    }

    /// Splits a GSO packet over as many descriptors as it has segments.
    ///
    /// Every descriptor but the last is posted here; the last is left written
    /// at `head` for the caller to post with the packet. On failure the ring
    /// is rewound to where it was and every mapping made is undone.
    fn tso<H: IonicHal>(&mut self, hal: &H, pkt: &mut T) -> IonicResult {
        let gso = pkt.gso().ok_or(IonicError::BadHeader)?;
        let encap = pkt.encapsulation();
        tcp_pseudo_csum(pkt, encap)?;

        let th = pkt.transport_offset(encap);
        let hdrlen = th + tcp_hdrlen(pkt.data(), th)?;
        let vlan = pkt.vlan_tag();
        let mut flags = TxFlags::empty();
        flags.set(TxFlags::VLAN, vlan.is_some());
        flags.set(TxFlags::ENCAP, gso.outer_csum);
        let params = TsoParams {
            hdrlen,
            mss: gso.size as usize,
            flags,
            vlan_tci: vlan.unwrap_or(0),
        };

        let abort = self.ring.head();
        let mut pending = None;
        match self.tso_walk(hal, pkt, &params, &mut pending) {
            Ok((pkts, bytes)) => {
                self.stats.pkts += pkts;
                self.stats.bytes += bytes;
                self.stats.tso += 1;
                self.stats.tso_bytes += bytes;
                Ok(())
            }
            Err(err) => {
                self.tso_rewind(hal, abort, pending);
                Err(err)
            }
        }
    }

    fn tso_walk<H: IonicHal>(
        &mut self,
        hal: &H,
        pkt: &T,
        p: &TsoParams,
        pending: &mut Option<PendingDesc>,
    ) -> IonicResult<(u64, u64)> {
        let mut total_pkts = 0;
        let mut total_bytes = 0;
        let mut start = true;
        let mut done = false;
        let mut seglen = p.hdrlen + p.mss;
        let mut frag_left = 0;
        let mut nfrags = pkt.nr_frags();

        let data = pkt.data();
        let mut offset = 0;
        let mut left = data.len();
        while left > 0 {
            let len = seglen.min(left);
            frag_left = seglen - len;
            let chunk = &data[offset..offset + len];
            let addr = if start {
                self.map_single(hal, chunk)?
            } else {
                self.map_frag(hal, chunk)?
            };
            *pending = Some(PendingDesc {
                addr,
                len,
                nsge: 0,
                single: start,
            });
            left -= len;
            offset += len;
            if nfrags > 0 && frag_left > 0 {
                continue;
            }
            done = nfrags == 0 && left == 0;
            self.tso_post(hal, pending, p, start, done)?;
            total_pkts += 1;
            total_bytes += (if start { len } else { len + p.hdrlen }) as u64;
            start = false;
            seglen = p.mss;
        }

        for fi in 0..pkt.nr_frags() {
            let frag = pkt.frag(fi);
            let mut offset = 0;
            let mut left = frag.len();
            nfrags -= 1;
            self.stats.frags += 1;
            while left > 0 {
                let len;
                if frag_left > 0 {
                    len = frag_left.min(left);
                    frag_left -= len;
                    let nsge = pending.as_ref().ok_or(IonicError::BadHeader)?.nsge;
                    if nsge >= self.max_sg_elems {
                        return Err(IonicError::TooManySgElems);
                    }
                    let addr = self.map_frag(hal, &frag[offset..offset + len])?;
                    self.ring.head_slot().sg.elems[nsge] =
                        TxqSgElem::new(addr.as_u64(), len as u16);
                    if let Some(d) = pending.as_mut() {
                        d.nsge += 1;
                    }
                } else {
                    len = p.mss.min(left);
                    frag_left = p.mss - len;
                    let chunk = &frag[offset..offset + len];
                    let addr = if start {
                        self.map_single(hal, chunk)?
                    } else {
                        self.map_frag(hal, chunk)?
                    };
                    *pending = Some(PendingDesc {
                        addr,
                        len,
                        nsge: 0,
                        single: start,
                    });
                }
                left -= len;
                offset += len;
                if nfrags > 0 && frag_left > 0 {
                    continue;
                }
                done = nfrags == 0 && left == 0;
                self.tso_post(hal, pending, p, start, done)?;
                total_pkts += 1;
                total_bytes += (if start { len } else { len + p.hdrlen }) as u64;
                start = false;
            }
        }

        if !done {
            return Err(IonicError::BadHeader);
        }
        Ok((total_pkts, total_bytes))
    }

    /// Writes the pending descriptor at `head`. Non-final descriptors are
    /// posted right away; the final one stays pending for the caller.
    fn tso_post<B: Doorbell + ?Sized>(
        &mut self,
        db: &B,
        pending: &mut Option<PendingDesc>,
        p: &TsoParams,
        start: bool,
        done: bool,
    ) -> IonicResult {
        let d = pending.ok_or(IonicError::BadHeader)?;
        let mut flags = p.flags;
        flags.set(TxFlags::TSO_SOT, start);
        flags.set(TxFlags::TSO_EOT, done);
        *self.ring.head_slot().desc = TxqDesc::encode(&TxDescFields {
            opcode: TxOpcode::Tso,
            flags,
            nsge: d.nsge as u8,
            addr: d.addr.as_u64(),
            len: d.len as u16,
            vlan_tci: p.vlan_tci,
            hword1: p.hdrlen as u16,
            hword2: p.mss as u16,
        });
        if !done {
            *pending = None;
            self.post(db, false, SlotCb::Bare);
        }
        Ok(())
    }

    /// Undoes a failed TSO walk: unmaps every slot posted since `abort`, then
    /// the descriptor still being built, and moves `head` back.
    fn tso_rewind<H: DmaOps>(&mut self, hal: &H, abort: u16, pending: Option<PendingDesc>) {
        let mut idx = abort;
        while idx != self.ring.head() {
            self.unmap_slot(hal, idx);
            self.ring.slot_mut(idx).info.take_cb();
            idx = self.ring.next(idx);
        }
        if let Some(d) = pending {
            if d.single {
                hal.unmap_single(d.addr, d.len, DmaDirection::ToDevice);
            } else {
                hal.unmap_page(d.addr, d.len, DmaDirection::ToDevice);
            }
            let sg = self.ring.sg_desc(self.ring.head());
            for elem in &sg.elems[..d.nsge.min(MAX_SG_ELEMS)] {
                let addr = DmaBusAddress::new(elem.addr());
                hal.unmap_page(addr, elem.len() as usize, DmaDirection::ToDevice);
            }
        }
        self.ring.rewind_head(abort);
    }

    /// Undoes the mappings described by slot `idx`.
    fn unmap_slot<H: DmaOps>(&self, hal: &H, idx: u16) {
        let desc = self.ring.desc(idx).decode();
        let addr = DmaBusAddress::new(desc.addr);
        // TSO continuation descriptors were mapped as pages.
        if desc.opcode != TxOpcode::Tso || desc.flags.contains(TxFlags::TSO_SOT) {
            hal.unmap_single(addr, desc.len as usize, DmaDirection::ToDevice);
        } else {
            hal.unmap_page(addr, desc.len as usize, DmaDirection::ToDevice);
        }
        let sg = self.ring.sg_desc(idx);
        for elem in &sg.elems[..(desc.nsge as usize).min(MAX_SG_ELEMS)] {
            let addr = DmaBusAddress::new(elem.addr());
            hal.unmap_page(addr, elem.len() as usize, DmaDirection::ToDevice);
        }
    }

    /// Releases slot `idx`. Returns the packet's length if the slot carried
    /// one. `completed` is false when draining without device completions.
    fn clean<H, S>(&mut self, hal: &H, stack: &S, idx: u16, completed: bool) -> Option<usize>
    where
        H: DmaOps,
        S: NetStack<Page = H::Page, Tx = T>,
    {
        self.unmap_slot(hal, idx);
        let info = self.ring.slot_mut(idx).info;
        info.bytes = 0;
        let Some(SlotCb::Packet(pkt)) = info.take_cb() else {
            return None;
        };
        // The tail already moved past this slot, so there is room again.
        if completed && stack.subqueue_stopped(self.index) {
            stack.wake_subqueue(self.index);
            self.stats.wake += 1;
        }
        let bytes = pkt.len();
        info.bytes = bytes;
        stack.consume_tx(pkt);
        self.stats.clean += 1;
        Some(bytes)
    }

    /// Handles one completion record, which may retire several slots: one
    /// completion covers every descriptor of a packet up to its last.
    pub fn service<H, S>(&mut self, hal: &H, stack: &S, comp: &TxqComp, done_color: bool) -> bool
    where
        H: DmaOps,
        S: NetStack<Page = H::Page, Tx = T>,
    {
        if !comp.is_new(done_color) {
            return false;
        }
        let mut pkts = 0;
        let mut bytes = 0;
        loop {
            if self.ring.is_empty() {
                self.stats.comp_err += 1;
                log_ratelimited!(
                    self.rl,
                    warn,
                    "txq{}: completion index {} not outstanding",
                    self.index,
                    comp.comp_index()
                );
                break;
            }
            let idx = self.ring.advance_tail();
            if let Some(b) = self.clean(hal, stack, idx, true) {
                pkts += 1;
                bytes += b;
            }
            if idx == comp.comp_index() {
                break;
            }
        }
        if self.bql && pkts > 0 && bytes > 0 {
            stack.completed_queue(self.index, pkts, bytes);
        }
        true
    }

    /// Releases every outstanding slot without waiting for the device.
    pub fn empty<H, S>(&mut self, hal: &H, stack: &S)
    where
        H: DmaOps,
        S: NetStack<Page = H::Page, Tx = T>,
    {
        let mut pkts = 0;
        let mut bytes = 0;
        let mut done = 0;
        while !self.ring.is_empty() {
            let idx = self.ring.advance_tail();
            if let Some(b) = self.clean(hal, stack, idx, false) {
                pkts += 1;
                bytes += b;
            }
            done += 1;
        }
        if self.bql && pkts > 0 && bytes > 0 {
            stack.completed_queue(self.index, pkts, bytes);
        }
        if done > 0 {
            debug!("txq{}: emptied {done} descriptors, {pkts} packets", self.index);
        }
    }
}

/// A transmit queue bound to its completion queue and interrupt.
pub struct TxQcq<T> {
    pub q: TxQueue<T>,
    pub cq: CompletionQueue<TxqComp>,
    intr_index: u32,
    hw_index: u32,
    armed: bool,
}

impl<T: TxPacket> TxQcq<T> {
    pub fn new(index: u16, hw_index: u32, intr_index: u32, config: &LifConfig) -> IonicResult<Self> {
        Ok(Self {
            q: TxQueue::new(index, hw_index, config)?,
            cq: CompletionQueue::new(config.ntxq_descs)?,
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

    pub fn arm<B: Doorbell + ?Sized>(&mut self, db: &B) {
        if !self.armed {
            self.armed = true;
            crate::napi::arm_doorbell(db, QueueType::TxQ, self.hw_index, self.cq.tail());
        }
    }

    /// Consumes up to `budget` completions.
    pub fn service<H, S>(&mut self, hal: &H, stack: &S, budget: u32) -> u32
    where
        H: IonicHal,
        S: NetStack<Page = H::Page, Tx = T>,
    {
        let q = &mut self.q;
        self.cq
            .service(budget, |comp, color| q.service(hal, stack, comp, color))
    }
}
