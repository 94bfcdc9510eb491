// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Transmit and receive datapath for ionic DMA network adapters.
//!
//! The driver talks to the device through descriptor rings in shared memory.
//! The host posts descriptors at a ring's head and rings a doorbell; the
//! device writes completion records and flips a color bit on every pass over
//! the completion ring, so the host can tell fresh records from stale ones
//! without an index register.
//!
//! - [`DescRing`]: posting side of a queue with per-slot bookkeeping.
//! - [`CompletionQueue`]: color-checked, budgeted completion servicing.
//! - [`BufPool`]: receive pages split into buffers and recycled in place.
//! - [`RxQueue`] / [`TxQueue`]: the receive and transmit paths, including
//!   segmentation offload.
//! - [`Lif`]: queue pairs, the transmit entry point and the poll routines.
//!
//! Memory, DMA mapping and doorbells are provided by an [`IonicHal`]; the
//! packet objects and delivery by a [`NetStack`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod stats;

mod buf;
mod config;
mod cq;
mod csum;
mod error;
mod hal;
pub mod hw;
mod lif;
mod napi;
mod ring;
mod rx;
mod stack;
mod tx;

pub use self::{
    buf::{BufInfo, BufPool},
    config::{LifConfig, PAGE_SIZE},
    cq::CompletionQueue,
    csum::{pseudo_hdr_sum, tcp_hdrlen, tcp_pseudo_csum},
    error::{AllocError, IonicError, IonicResult},
    hal::{DmaBusAddress, DmaDirection, DmaOps, Doorbell, IonicHal, RxPage},
    lif::{Lif, LifState},
    ring::{DescRing, Slot, SlotInfo},
    rx::{RX_BUFS_PER_DESC, RxDescInfo, RxQcq, RxQueue},
    stack::{CsumOffload, GsoInfo, HashType, L3Proto, NetStack, RxPacket, TxPacket},
    stats::{DebugStats, RateLimit, RxStats, TxStats},
    tx::{SlotCb, TX_STOP_HEADROOM, TxDescInfo, TxQcq, TxQueue, XmitStatus},
};
