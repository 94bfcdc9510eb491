// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Interface configuration, resolved once when queues are built.

use log::warn;

use crate::{
    error::{IonicError, IonicResult},
    hw::{ETH_HLEN, MAX_SG_ELEMS},
};

/// Base page size of the host.
pub const PAGE_SIZE: usize = 4096;

const DEFAULT_MTU: u32 = 1500;
const DEFAULT_RX_COPYBREAK: u32 = 256;
const DEFAULT_TX_BUDGET: u32 = 256;
const DEFAULT_NUM_DESCS: u16 = 1024;
const DEFAULT_PAGE_SPLIT_SIZE: usize = 2048;
const MIN_NUM_DESCS: u16 = 16;

/// Datapath configuration of a logical interface.
#[derive(Debug, Clone)]
pub struct LifConfig {
    /// Largest L3 payload; receive buffers hold `mtu + ETH_HLEN`.
    pub mtu: u32,

    /// Received packets of at most this many bytes are copied.
    pub rx_copybreak: u32,

    /// Scatter-gather elements per transmit descriptor.
    pub tx_max_sg_elems: usize,

    /// Scatter-gather elements per receive descriptor.
    pub rx_max_sg_elems: usize,

    /// Transmit completions serviced per combined poll.
    pub tx_budget: u32,

    /// Transmit ring size.
    pub ntxq_descs: u16,

    /// Receive ring size.
    pub nrxq_descs: u16,

    /// Receive buffer page order.
    pub page_order: u32,

    /// Granularity used when carving a receive page into buffers.
    pub page_split_size: usize,

    /// Report queued and completed bytes to the stack.
    pub bql: bool,

    /// Pass the device RSS hash up with received packets.
    pub rx_hash: bool,

    /// Pass the device checksum up with received packets.
    pub rx_csum: bool,

    /// Pass stripped VLAN tags up with received packets.
    pub vlan_rx_strip: bool,

    /// Re-arm queues through doorbells instead of interrupt credits.
    pub event_queues: bool,

    /// Keep poll and doorbell debug counters.
    pub debug_stats: bool,
}

impl LifConfig {
    /// Create a configuration with default values.
    pub const fn new() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            rx_copybreak: DEFAULT_RX_COPYBREAK,
            tx_max_sg_elems: MAX_SG_ELEMS,
            rx_max_sg_elems: MAX_SG_ELEMS,
            tx_budget: DEFAULT_TX_BUDGET,
            ntxq_descs: DEFAULT_NUM_DESCS,
            nrxq_descs: DEFAULT_NUM_DESCS,
            page_order: 0,
            page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
            bql: true,
            rx_hash: true,
            rx_csum: true,
            vlan_rx_strip: true,
            event_queues: false,
            debug_stats: false,
        }
    }

    /// Size of one receive buffer page.
    pub const fn page_size(&self) -> usize {
        PAGE_SIZE << self.page_order
    }

    /// Largest frame accepted on receive.
    pub const fn rx_frame_len(&self) -> usize {
        self.mtu as usize + ETH_HLEN
    }

    /// Number of receive buffers that fit in one page.
    pub const fn rx_nsplits(&self) -> usize {
        if self.page_split_size == 0 {
            return 0;
        }
        let align_len = self.rx_frame_len().next_multiple_of(self.page_split_size);
        self.page_size() / align_len
    }

    /// Checks that every value is usable by the rings.
    pub fn validate(&self) -> IonicResult {
        for (name, n) in [("ntxq_descs", self.ntxq_descs), ("nrxq_descs", self.nrxq_descs)] {
            if !n.is_power_of_two() || n < MIN_NUM_DESCS {
                warn!("{name} {n} must be a power of two >= {MIN_NUM_DESCS}");
                return Err(IonicError::InvalidConfig);
            }
        }
        if self.tx_max_sg_elems > MAX_SG_ELEMS || self.rx_max_sg_elems > MAX_SG_ELEMS {
            warn!("sg limit above {MAX_SG_ELEMS}");
            return Err(IonicError::InvalidConfig);
        }
        if self.page_split_size == 0 || self.page_split_size > self.page_size() {
            warn!("page split size {} out of range", self.page_split_size);
            return Err(IonicError::InvalidConfig);
        }
        if self.mtu == 0 {
            warn!("zero mtu");
            return Err(IonicError::InvalidConfig);
        }
        // Receive descriptor lengths are 16 bits wide.
        if self.rx_frame_len() > u16::MAX as usize {
            warn!("mtu {} exceeds the receive descriptor length", self.mtu);
            return Err(IonicError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for LifConfig {
    fn default() -> Self {
        Self::new()
    }
}
