// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Completion queue written by the device.
//!
//! There is no producer index. A record is new when its color bit equals
//! `done_color`; the expected color flips every time `tail` wraps, so the
//! previous lap's records read as stale.

use alloc::boxed::Box;
use core::sync::atomic::{Ordering, fence};

use crate::{
    error::{IonicError, IonicResult},
    hw::CompDesc,
};

pub struct CompletionQueue<C> {
    descs: Box<[C]>,
    tail_idx: u16,
    num_descs: u16,
    done_color: bool,
}

impl<C: CompDesc> CompletionQueue<C> {
    pub fn new(num_descs: u16) -> IonicResult<Self> {
        if !num_descs.is_power_of_two() || num_descs < 2 {
            return Err(IonicError::InvalidConfig);
        }
        Ok(Self {
            descs: alloc::vec![C::default(); num_descs as usize].into_boxed_slice(),
            tail_idx: 0,
            num_descs,
            done_color: true,
        })
    }

    pub const fn num_descs(&self) -> u16 {
        self.num_descs
    }

    pub const fn tail(&self) -> u16 {
        self.tail_idx
    }

    pub const fn done_color(&self) -> bool {
        self.done_color
    }

    /// The record memory the device writes into.
    pub fn descs_mut(&mut self) -> &mut [C] {
        &mut self.descs
    }

    fn read_tail(&self) -> C {
        let slot: *const C = &self.descs[self.tail_idx as usize];
        // SAFETY: `slot` points into our own allocation; the device may change
        // it behind our back, so the read must not be cached or elided.
        unsafe { core::ptr::read_volatile(slot) }
    }

    /// Consumes up to `budget` new records.
    ///
    /// `handler` gets each new record and the current `done_color`; returning
    /// false leaves the record in place and ends the pass.
    pub fn service<F>(&mut self, budget: u32, mut handler: F) -> u32
    where
        F: FnMut(&C, bool) -> bool,
    {
        let mut work_done = 0;
        while work_done < budget {
            let comp = self.read_tail();
            if !comp.is_new(self.done_color) {
                break;
            }
            // Color first, then the rest of the record.
            fence(Ordering::Acquire);
            let comp = self.read_tail();
            if !handler(&comp, self.done_color) {
                break;
            }
            if self.tail_idx == self.num_descs - 1 {
                self.done_color = !self.done_color;
            }
            self.tail_idx = (self.tail_idx + 1) & (self.num_descs - 1);
            work_done += 1;
        }
        work_done
    }
}
