// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Fixed-size descriptor ring shared with the device.
//!
//! The ring keeps three parallel arrays indexed by slot: the device-visible
//! descriptors, their scatter-gather lists, and per-slot software state. One
//! slot is always left unused so that `head == tail` means empty.

use alloc::{boxed::Box, vec::Vec};

use crate::{
    error::{IonicError, IonicResult},
    hal::Doorbell,
    hw::{QueueType, dbell_qid},
};

/// Software state kept beside each descriptor.
pub trait SlotInfo: Default {
    /// What the completion side must do for this slot.
    type Cb;

    fn set_cb(&mut self, cb: Self::Cb);

    fn take_cb(&mut self) -> Option<Self::Cb>;
}

/// Mutable view of one ring slot.
pub struct Slot<'a, D, S, I> {
    pub desc: &'a mut D,
    pub sg: &'a mut S,
    pub info: &'a mut I,
}

/// A power-of-two ring of descriptors.
pub struct DescRing<D, S, I> {
    descs: Box<[D]>,
    sg_descs: Box<[S]>,
    info: Box<[I]>,
    head_idx: u16,
    tail_idx: u16,
    num_descs: u16,
    qtype: QueueType,
    dbval: u64,
}

impl<D: Default + Copy, S: Default + Copy, I: SlotInfo> DescRing<D, S, I> {
    /// Builds a ring of `num_descs` zeroed slots; `hw_index` is the queue id
    /// the device knows this ring by.
    pub fn new(num_descs: u16, qtype: QueueType, hw_index: u32) -> IonicResult<Self> {
        if !num_descs.is_power_of_two() || num_descs < 2 {
            return Err(IonicError::InvalidConfig);
        }
        let n = num_descs as usize;
        let info: Vec<I> = (0..n).map(|_| I::default()).collect();
        Ok(Self {
            descs: alloc::vec![D::default(); n].into_boxed_slice(),
            sg_descs: alloc::vec![S::default(); n].into_boxed_slice(),
            info: info.into_boxed_slice(),
            head_idx: 0,
            tail_idx: 0,
            num_descs,
            qtype,
            dbval: dbell_qid(hw_index),
        })
    }
}

impl<D, S, I: SlotInfo> DescRing<D, S, I> {
    #[inline]
    pub const fn num_descs(&self) -> u16 {
        self.num_descs
    }

    #[inline]
    pub const fn head(&self) -> u16 {
        self.head_idx
    }

    #[inline]
    pub const fn tail(&self) -> u16 {
        self.tail_idx
    }

    pub const fn qtype(&self) -> QueueType {
        self.qtype
    }

    /// Slot index following `idx`.
    #[inline]
    pub const fn next(&self, idx: u16) -> u16 {
        idx.wrapping_add(1) & (self.num_descs - 1)
    }

    /// Slots posted and not yet completed.
    #[inline]
    pub const fn occupancy(&self) -> u16 {
        self.head_idx.wrapping_sub(self.tail_idx) & (self.num_descs - 1)
    }

    /// Slots that can still be posted.
    #[inline]
    pub const fn space_avail(&self) -> u16 {
        self.num_descs - 1 - self.occupancy()
    }

    #[inline]
    pub const fn has_space(&self, want: usize) -> bool {
        self.space_avail() as usize >= want
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head_idx == self.tail_idx
    }

    pub fn desc(&self, idx: u16) -> &D {
        &self.descs[idx as usize]
    }

    pub fn sg_desc(&self, idx: u16) -> &S {
        &self.sg_descs[idx as usize]
    }

    pub fn info(&self, idx: u16) -> &I {
        &self.info[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u16) -> Slot<'_, D, S, I> {
        let i = idx as usize;
        Slot {
            desc: &mut self.descs[i],
            sg: &mut self.sg_descs[i],
            info: &mut self.info[i],
        }
    }

    /// The slot `post` will publish next.
    pub fn head_slot(&mut self) -> Slot<'_, D, S, I> {
        self.slot_mut(self.head_idx)
    }

    /// Records `cb` in the head slot and publishes it to the device.
    ///
    /// With `ring_doorbell` unset the device is not told; a later post or
    /// [`DescRing::ring_doorbell`] covers every slot published in between.
    pub fn post<B: Doorbell + ?Sized>(&mut self, db: &B, ring_doorbell: bool, cb: I::Cb) {
        self.info[self.head_idx as usize].set_cb(cb);
        self.head_idx = self.next(self.head_idx);
        if ring_doorbell {
            self.ring_doorbell(db);
        }
    }

    /// Tells the device the ring has descriptors up to `head`.
    pub fn ring_doorbell<B: Doorbell + ?Sized>(&self, db: &B) {
        db.ring_doorbell(self.qtype, self.dbval | self.head_idx as u64);
    }

    /// Consumes the tail slot and returns its index.
    pub fn advance_tail(&mut self) -> u16 {
        let idx = self.tail_idx;
        self.tail_idx = self.next(idx);
        idx
    }

    /// Moves `head` back to `idx`, forgetting every slot published since.
    pub(crate) fn rewind_head(&mut self, idx: u16) {
        self.head_idx = idx & (self.num_descs - 1);
    }

    /// Forgets every outstanding slot.
    pub(crate) fn reset_tail(&mut self) {
        self.tail_idx = self.head_idx;
    }
}
