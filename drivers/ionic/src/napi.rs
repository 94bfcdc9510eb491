// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Budgeted completion polling.
//!
//! A poll consumes at most `budget` completions. If it finishes under budget
//! and the scheduler accepts completion, the interrupt is unmasked. Whenever
//! work was done or the interrupt is being unmasked, the retired work is
//! credited back to the interrupt, or in event-queue mode each queue is
//! armed once to report its next completion.

use log::trace;

use crate::{
    hal::{Doorbell, IonicHal},
    hw::{DBELL_RING_1, IntrCredFlags, QueueType, dbell_qid},
    lif::Lif,
    stack::NetStack,
};

/// Rings the one-shot arm doorbell of a completion queue at `cq_tail`.
pub(crate) fn arm_doorbell<B: Doorbell + ?Sized>(
    db: &B,
    qtype: QueueType,
    hw_index: u32,
    cq_tail: u16,
) {
    db.ring_doorbell(qtype, DBELL_RING_1 | dbell_qid(hw_index) | u64::from(cq_tail));
}

impl<H: IonicHal, S: NetStack<Page = H::Page>> Lif<H, S> {
    /// Flags to credit with after a poll that did `work_done` of `budget`.
    fn poll_flags(&self, index: u16, work_done: u32, budget: u32) -> IntrCredFlags {
        let mut flags = IntrCredFlags::empty();
        if work_done < budget && self.stack().napi_complete_done(index, work_done) {
            flags |= IntrCredFlags::UNMASK;
        }
        if work_done > 0 || !flags.is_empty() {
            flags |= IntrCredFlags::RESET_COALESCE;
        }
        flags
    }

    /// Polls transmit-only queue `index`. Returns the completions consumed.
    pub fn tx_napi(&self, index: u16, budget: u32) -> u32 {
        let Some(txq) = self.txqcq(index) else {
            return 0;
        };
        let mut qcq = txq.lock();
        let work_done = qcq.service(self.hal(), self.stack(), budget);

        let flags = self.poll_flags(index, work_done, budget);
        if flags.contains(IntrCredFlags::UNMASK) {
            qcq.q.dbg.intr_rearm += 1;
        }
        if !flags.is_empty() {
            if self.config().event_queues {
                qcq.arm(self.hal());
            } else {
                self.hal().intr_credits(qcq.intr_index(), work_done, flags);
            }
        }
        if self.config().debug_stats {
            qcq.q.dbg.record_poll(work_done);
        }
        work_done
    }

    /// Polls receive-only queue `index`, refilling it if anything was
    /// consumed.
    pub fn rx_napi(&self, index: u16, budget: u32) -> u32 {
        let Some(rxq) = self.rxqcq(index) else {
            return 0;
        };
        let mut qcq = rxq.lock();
        let work_done = qcq.service(self.hal(), self.stack(), self.in_reset(), budget);
        if work_done > 0 {
            qcq.q.fill(self.hal());
        }

        let flags = self.poll_flags(index, work_done, budget);
        if flags.contains(IntrCredFlags::UNMASK) {
            qcq.q.dbg.intr_rearm += 1;
        }
        if !flags.is_empty() {
            if self.config().event_queues {
                qcq.arm(self.hal());
            } else {
                self.hal().intr_credits(qcq.intr_index(), work_done, flags);
            }
        }
        if self.config().debug_stats {
            qcq.q.dbg.record_poll(work_done);
        }
        work_done
    }

    /// Polls queue pair `index` sharing one interrupt.
    ///
    /// Transmit completions are consumed under the fixed `tx_budget`, receive
    /// ones under `budget`. Only receive work decides whether the poll is
    /// complete; the credit covers both. Returns the receive work done.
    pub fn txrx_napi(&self, index: u16, budget: u32) -> u32 {
        let (Some(txq), Some(rxq)) = (self.txqcq(index), self.rxqcq(index)) else {
            return 0;
        };
        let mut txqcq = txq.lock();
        let mut rxqcq = rxq.lock();

        let tx_work_done = txqcq.service(self.hal(), self.stack(), self.config().tx_budget);
        let rx_work_done = rxqcq.service(self.hal(), self.stack(), self.in_reset(), budget);
        if rx_work_done > 0 {
            rxqcq.q.fill(self.hal());
        }

        let flags = self.poll_flags(index, rx_work_done, budget);
        if flags.contains(IntrCredFlags::UNMASK) {
            rxqcq.q.dbg.intr_rearm += 1;
        }
        if !flags.is_empty() {
            if self.config().event_queues {
                rxqcq.arm(self.hal());
                txqcq.arm(self.hal());
            } else {
                self.hal()
                    .intr_credits(rxqcq.intr_index(), tx_work_done + rx_work_done, flags);
            }
        }
        if self.config().debug_stats {
            rxqcq.q.dbg.record_poll(rx_work_done);
            txqcq.q.dbg.record_poll(tx_work_done);
        }
        trace!("txrx_napi {index}: tx {tx_work_done} rx {rx_work_done} flags {flags:?}");
        rx_work_done
    }
}
