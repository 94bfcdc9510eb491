// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Receive buffer pool.
//!
//! A receive buffer is a mapped page plus an offset into it. After a packet
//! lands in the buffer, the used bytes are rounded up to the split size and the
//! offset moves past them; the rest of the page stays posted as the next
//! buffer. The page itself travels up the stack with the packet, so each reuse
//! needs its own page reference. Order-0 pages take it on reuse. Larger pages
//! take all of them up front (`pagecnt_bias`) and hand them out one by one.

use crate::{
    config::LifConfig,
    error::{AllocError, IonicResult},
    hal::{DmaBusAddress, DmaDirection, DmaOps, RxPage},
    stats::{RateLimit, RxStats, log_ratelimited},
};

/// One receive buffer of a descriptor slot.
#[derive(Debug)]
pub struct BufInfo<P> {
    page: Option<P>,
    page_offset: usize,
    dma_addr: DmaBusAddress,
    pagecnt_bias: u32,
}

impl<P> BufInfo<P> {
    pub const fn new() -> Self {
        Self {
            page: None,
            page_offset: 0,
            dma_addr: DmaBusAddress::new(0),
            pagecnt_bias: 0,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.page.is_none()
    }

    pub const fn page(&self) -> Option<&P> {
        self.page.as_ref()
    }

    pub const fn page_offset(&self) -> usize {
        self.page_offset
    }

    /// Mapping of the whole page.
    pub const fn dma_addr(&self) -> DmaBusAddress {
        self.dma_addr
    }

    /// Device address of the buffer's first free byte.
    pub const fn bus_addr(&self) -> DmaBusAddress {
        self.dma_addr.add(self.page_offset)
    }

    pub const fn pagecnt_bias(&self) -> u32 {
        self.pagecnt_bias
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl<P> Default for BufInfo<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Page sizing and recycling policy of one receive queue.
pub struct BufPool {
    order: u32,
    page_size: usize,
    split_size: usize,
    nsplits: u32,
    rl: RateLimit,
}

impl BufPool {
    /// Sizes the pool from `config`, which must pass
    /// [`LifConfig::validate`].
    pub fn new(config: &LifConfig) -> IonicResult<Self> {
        config.validate()?;
        Ok(Self {
            order: config.page_order,
            page_size: config.page_size(),
            split_size: config.page_split_size,
            nsplits: config.rx_nsplits() as u32,
            rl: RateLimit::new(),
        })
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fills an empty `buf` with a freshly mapped page.
    ///
    /// `main` buffers of higher-order pages take their split references here.
    pub fn allocate<H: DmaOps>(
        &mut self,
        hal: &H,
        buf: &mut BufInfo<H::Page>,
        main: bool,
        stats: &mut RxStats,
    ) -> Result<(), AllocError> {
        let Some(page) = hal.alloc_pages(self.order) else {
            log_ratelimited!(self.rl, error, "rx page alloc failed");
            stats.alloc_err += 1;
            return Err(AllocError::OutOfMemory);
        };
        let dma_addr = match hal.map_page(&page, 0, self.page_size, DmaDirection::FromDevice) {
            Ok(addr) => addr,
            Err(_) => {
                hal.free_pages(page, self.order);
                buf.reset();
                log_ratelimited!(self.rl, error, "rx dma map failed");
                stats.dma_map_err += 1;
                return Err(AllocError::MapFailed);
            }
        };
        let mut bias = 0;
        if main && self.order > 0 {
            bias = self.nsplits.saturating_sub(1);
            if bias > 0 {
                hal.page_ref_add(&page, bias);
            }
        }
        *buf = BufInfo {
            page: Some(page),
            page_offset: 0,
            dma_addr,
            pagecnt_bias: bias,
        };
        Ok(())
    }

    /// Moves `buf` past `used` bytes so the rest of its page can be posted
    /// again. Returns false if the page must not be reused; `buf` then still
    /// holds the page and the caller detaches or releases it.
    pub fn recycle<H: DmaOps>(&self, hal: &H, buf: &mut BufInfo<H::Page>, used: usize) -> bool {
        let Some(page) = buf.page.as_ref() else {
            return false;
        };
        if page.is_pfmemalloc() || page.nid() != hal.numa_mem_id() {
            return false;
        }
        buf.page_offset += used.next_multiple_of(self.split_size);
        if buf.page_offset >= self.page_size {
            return false;
        }
        if self.order > 0 {
            match buf.pagecnt_bias.checked_sub(1) {
                Some(bias) => buf.pagecnt_bias = bias,
                None => return false,
            }
        } else {
            hal.get_page(page);
        }
        true
    }

    /// Unmaps `buf` and forgets its page, whose last reference now belongs to
    /// a packet.
    pub fn detach<H: DmaOps>(&self, hal: &H, buf: &mut BufInfo<H::Page>) {
        if let Some(page) = buf.page.take() {
            hal.unmap_page(buf.dma_addr, self.page_size, DmaDirection::FromDevice);
            if buf.pagecnt_bias > 0 {
                hal.page_ref_sub(&page, buf.pagecnt_bias);
            }
        }
        buf.reset();
    }

    /// Unmaps `buf`, drops every reference it holds and empties it.
    pub fn release<H: DmaOps>(&mut self, hal: &H, buf: &mut BufInfo<H::Page>) {
        let Some(page) = buf.page.take() else {
            log_ratelimited!(self.rl, error, "invalid page in rx buffer free");
            return;
        };
        hal.unmap_page(buf.dma_addr, self.page_size, DmaDirection::FromDevice);
        if buf.pagecnt_bias > 0 {
            hal.page_ref_sub(&page, buf.pagecnt_bias);
        }
        hal.free_pages(page, self.order);
        buf.reset();
    }
}
