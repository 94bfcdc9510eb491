// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Logical interface: queue pairs, interface state and the transmit entry
//! point.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, info};
use spin::Mutex;

use crate::{
    config::LifConfig,
    error::IonicResult,
    hal::IonicHal,
    hw::IntrCredFlags,
    rx::RxQcq,
    stack::{NetStack, TxPacket},
    tx::{TxQcq, XmitStatus},
};

bitflags! {
    /// Interface state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LifState: u32 {
        /// Administratively up; transmit is accepted.
        const UP          = 1 << 0;
        /// Queues are being reset; receive completions are dropped.
        const QUEUE_RESET = 1 << 1;
    }
}

/// A logical interface and its queue pairs.
///
/// Each queue sits behind its own lock, taken by the transmit entry point
/// and by the poll routines for that queue. Where both locks of a pair are
/// needed the transmit one is taken first.
pub struct Lif<H: IonicHal, S: NetStack<Page = H::Page>> {
    hal: H,
    stack: S,
    config: LifConfig,
    state: AtomicU32,
    pub(crate) txqcqs: Vec<Mutex<TxQcq<S::Tx>>>,
    pub(crate) rxqcqs: Vec<Mutex<RxQcq<H::Page>>>,
}

impl<H: IonicHal, S: NetStack<Page = H::Page>> Lif<H, S> {
    /// Builds `nxqs` transmit/receive queue pairs. Queue `i` uses hardware
    /// queue id `i` and interrupt `i`.
    pub fn new(hal: H, stack: S, config: LifConfig, nxqs: u16) -> IonicResult<Self> {
        config.validate()?;
        let mut txqcqs = Vec::with_capacity(nxqs as usize);
        let mut rxqcqs = Vec::with_capacity(nxqs as usize);
        for i in 0..nxqs {
            let hw = u32::from(i);
            txqcqs.push(Mutex::new(TxQcq::new(i, hw, hw, &config)?));
            rxqcqs.push(Mutex::new(RxQcq::new(i, hw, hw, &config)?));
        }
        info!(
            "lif: {nxqs} queue pairs, {} tx / {} rx descriptors, mtu {}",
            config.ntxq_descs, config.nrxq_descs, config.mtu
        );
        Ok(Self {
            hal,
            stack,
            config,
            state: AtomicU32::new(0),
            txqcqs,
            rxqcqs,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn config(&self) -> &LifConfig {
        &self.config
    }

    /// Number of queue pairs.
    pub fn nxqs(&self) -> usize {
        self.txqcqs.len()
    }

    pub fn state(&self) -> LifState {
        LifState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, bits: LifState, on: bool) {
        if on {
            self.state.fetch_or(bits.bits(), Ordering::AcqRel);
        } else {
            self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
        }
    }

    pub fn set_up(&self, up: bool) {
        self.set_state(LifState::UP, up);
        debug!("lif: {}", if up { "up" } else { "down" });
    }

    pub fn is_up(&self) -> bool {
        self.state().contains(LifState::UP)
    }

    pub fn set_queue_reset(&self, on: bool) {
        self.set_state(LifState::QUEUE_RESET, on);
    }

    pub fn in_reset(&self) -> bool {
        self.state().contains(LifState::QUEUE_RESET)
    }

    pub fn txqcq(&self, index: u16) -> Option<&Mutex<TxQcq<S::Tx>>> {
        self.txqcqs.get(index as usize)
    }

    pub fn rxqcq(&self, index: u16) -> Option<&Mutex<RxQcq<H::Page>>> {
        self.rxqcqs.get(index as usize)
    }

    /// Queues `pkt` on the transmit queue the stack picked for it, or on
    /// queue 0 if that one does not exist.
    pub fn start_xmit(&self, pkt: S::Tx) -> XmitStatus<S::Tx> {
        if !self.is_up() {
            self.stack.drop_tx(pkt);
            return XmitStatus::Dropped;
        }
        let Some(txq) = self.txqcq(pkt.queue_mapping()).or_else(|| self.txqcq(0)) else {
            self.stack.drop_tx(pkt);
            return XmitStatus::Dropped;
        };
        txq.lock().q.xmit(&self.hal, &self.stack, pkt)
    }

    /// Replenishes receive queue `index`.
    pub fn rx_fill(&self, index: u16) {
        if let Some(rxq) = self.rxqcq(index) {
            rxq.lock().q.fill(&self.hal);
        }
    }

    /// Consumes every pending transmit completion of queue `index`.
    pub fn tx_flush(&self, index: u16) -> u32 {
        let Some(txq) = self.txqcq(index) else {
            return 0;
        };
        let mut qcq = txq.lock();
        let budget = u32::from(qcq.cq.num_descs());
        let work_done = qcq.service(&self.hal, &self.stack, budget);
        if work_done > 0 && !self.config.event_queues {
            self.hal
                .intr_credits(qcq.intr_index(), work_done, IntrCredFlags::RESET_COALESCE);
        }
        work_done
    }

    /// Consumes every pending receive completion of queue `index`.
    pub fn rx_flush(&self, index: u16) -> u32 {
        let Some(rxq) = self.rxqcq(index) else {
            return 0;
        };
        let mut qcq = rxq.lock();
        let budget = u32::from(qcq.cq.num_descs());
        let work_done = qcq.service(&self.hal, &self.stack, self.in_reset(), budget);
        if work_done > 0 && !self.config.event_queues {
            self.hal
                .intr_credits(qcq.intr_index(), work_done, IntrCredFlags::RESET_COALESCE);
        }
        work_done
    }

    /// Releases every packet still on transmit queue `index`.
    pub fn tx_empty(&self, index: u16) {
        if let Some(txq) = self.txqcq(index) {
            txq.lock().q.empty(&self.hal, &self.stack);
        }
    }

    /// Releases every buffer of receive queue `index`.
    pub fn rx_empty(&self, index: u16) {
        if let Some(rxq) = self.rxqcq(index) {
            rxq.lock().q.empty(&self.hal);
        }
    }
}
