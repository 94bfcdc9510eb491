// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Device-side services the datapath depends on.
//!
//! The host implements [`DmaOps`] over its page allocator and DMA mapping
//! layer, and [`Doorbell`] over the device BAR. A type implementing both is an
//! [`IonicHal`].

use core::fmt;

use crate::{
    error::IonicResult,
    hw::{IntrCredFlags, QueueType},
};

/// A bus memory address as seen by the device.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DmaBusAddress(u64);

impl DmaBusAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The address `off` bytes further into the mapping.
    pub const fn add(self, off: usize) -> Self {
        Self(self.0 + off as u64)
    }
}

impl From<u64> for DmaBusAddress {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for DmaBusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DmaBusAddress")
            .field(&format_args!("{:#X}", self.0))
            .finish()
    }
}

/// Direction of a streaming DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

/// A handle to a (possibly compound) page owned by the host allocator.
///
/// Cloning the handle does not take a page reference; references are managed
/// explicitly through [`DmaOps`].
pub trait RxPage: Clone {
    /// NUMA node the page was allocated on.
    fn nid(&self) -> usize;

    /// Whether the page came from the emergency reserve.
    fn is_pfmemalloc(&self) -> bool;

    /// Copies `buf.len()` bytes starting at `offset` out of the page.
    fn read(&self, offset: usize, buf: &mut [u8]);
}

/// Page allocation and streaming DMA mapping.
pub trait DmaOps {
    type Page: RxPage;

    /// Allocates `1 << order` contiguous pages holding one reference.
    fn alloc_pages(&self, order: u32) -> Option<Self::Page>;

    /// Drops one reference; the pages are freed with the last one.
    fn free_pages(&self, page: Self::Page, order: u32);

    /// Takes one more reference.
    fn get_page(&self, page: &Self::Page);

    fn page_ref_add(&self, page: &Self::Page, n: u32);

    fn page_ref_sub(&self, page: &Self::Page, n: u32);

    /// NUMA node of the calling CPU.
    fn numa_mem_id(&self) -> usize;

    fn map_page(
        &self,
        page: &Self::Page,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> IonicResult<DmaBusAddress>;

    fn unmap_page(&self, addr: DmaBusAddress, len: usize, dir: DmaDirection);

    /// Maps the linear part of a packet.
    fn map_single(&self, data: &[u8], dir: DmaDirection) -> IonicResult<DmaBusAddress>;

    fn unmap_single(&self, addr: DmaBusAddress, len: usize, dir: DmaDirection);

    /// Maps a piece of a packet fragment; undone with [`DmaOps::unmap_page`].
    fn map_frag(&self, data: &[u8], dir: DmaDirection) -> IonicResult<DmaBusAddress>;

    fn sync_single_for_cpu(&self, addr: DmaBusAddress, len: usize, dir: DmaDirection);

    fn sync_single_for_device(&self, addr: DmaBusAddress, len: usize, dir: DmaDirection);
}

/// Doorbell page and interrupt control registers.
pub trait Doorbell {
    /// Writes `value` to the doorbell of queue type `qtype`.
    fn ring_doorbell(&self, qtype: QueueType, value: u64);

    /// Returns `credits` to interrupt `intr_index`.
    fn intr_credits(&self, intr_index: u32, credits: u32, flags: IntrCredFlags);
}

/// Everything the datapath needs from the device side.
pub trait IonicHal: DmaOps + Doorbell {}

impl<T: DmaOps + Doorbell> IonicHal for T {}
