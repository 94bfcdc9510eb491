// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Host and device doubles shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
};

use ionic::{
    CompletionQueue, CsumOffload, DmaBusAddress, DmaDirection, DmaOps, Doorbell, GsoInfo,
    HashType, IonicError, IonicResult, L3Proto, Lif, LifConfig, NetStack, PAGE_SIZE, RxPacket,
    RxPage, TxPacket,
    hw::{CompDesc, IntrCredFlags, QueueType, RxqComp, TxqComp},
};

pub struct PageInner {
    id: usize,
    nid: usize,
    pfmemalloc: bool,
    refs: AtomicI64,
    data: Mutex<Vec<u8>>,
}

/// A page whose reference count lives with the handle.
#[derive(Clone)]
pub struct MockPage(Arc<PageInner>);

impl MockPage {
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn refs(&self) -> i64 {
        self.0.refs.load(Ordering::SeqCst)
    }

    fn add_refs(&self, n: i64) {
        self.0.refs.fetch_add(n, Ordering::SeqCst);
    }

    /// Drops the reference a delivered packet held.
    pub fn put(&self) {
        self.add_refs(-1);
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        self.0.data.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl RxPage for MockPage {
    fn nid(&self) -> usize {
        self.0.nid
    }

    fn is_pfmemalloc(&self) -> bool {
        self.0.pfmemalloc
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.0.data.lock().unwrap();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Single,
    Page,
}

struct Mapping {
    len: usize,
    kind: MapKind,
    page: Option<(MockPage, usize)>,
}

#[derive(Default)]
struct HalState {
    next_addr: u64,
    pages: Vec<MockPage>,
    mappings: BTreeMap<u64, Mapping>,
    bad_unmaps: usize,
    doorbells: Vec<(QueueType, u64)>,
    credits: Vec<(u32, u32, IntrCredFlags)>,
    alloc_budget: Option<usize>,
    map_single_budget: Option<usize>,
    map_frag_budget: Option<usize>,
    page_nid: usize,
    pfmemalloc: bool,
}

/// Allows one more operation against an optional budget.
fn take(budget: &mut Option<usize>) -> bool {
    match budget {
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
        None => true,
    }
}

/// Page allocator, IOMMU and doorbell page of a fake device.
pub struct MockHal {
    state: Mutex<HalState>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HalState {
                next_addr: 0x1000_0000,
                ..Default::default()
            }),
        }
    }

    fn map(&self, len: usize, kind: MapKind, page: Option<(MockPage, usize)>) -> DmaBusAddress {
        let mut s = self.state.lock().unwrap();
        let addr = s.next_addr;
        s.next_addr += 0x10000;
        s.mappings.insert(addr, Mapping { len, kind, page });
        DmaBusAddress::new(addr)
    }

    fn unmap(&self, addr: DmaBusAddress, len: usize, kind: MapKind) {
        let mut s = self.state.lock().unwrap();
        match s.mappings.remove(&addr.as_u64()) {
            Some(m) if m.len == len && m.kind == kind => {}
            _ => s.bad_unmaps += 1,
        }
    }

    /// Device write into whatever page is mapped at `addr`.
    pub fn dma_write(&self, addr: u64, bytes: &[u8]) {
        let s = self.state.lock().unwrap();
        let (base, m) = s.mappings.range(..=addr).next_back().expect("address not mapped");
        assert!(addr + bytes.len() as u64 <= base + m.len as u64, "write past mapping");
        let (page, off) = m.page.as_ref().expect("not a page mapping");
        page.write(off + (addr - base) as usize, bytes);
    }

    pub fn set_alloc_budget(&self, n: Option<usize>) {
        self.state.lock().unwrap().alloc_budget = n;
    }

    pub fn set_map_single_budget(&self, n: Option<usize>) {
        self.state.lock().unwrap().map_single_budget = n;
    }

    pub fn set_map_frag_budget(&self, n: Option<usize>) {
        self.state.lock().unwrap().map_frag_budget = n;
    }

    /// NUMA node and reserve flag of pages allocated from now on.
    pub fn set_page_kind(&self, nid: usize, pfmemalloc: bool) {
        let mut s = self.state.lock().unwrap();
        s.page_nid = nid;
        s.pfmemalloc = pfmemalloc;
    }

    pub fn pages(&self) -> Vec<MockPage> {
        self.state.lock().unwrap().pages.clone()
    }

    pub fn pages_allocated(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    /// Pages whose reference count is not back to zero.
    pub fn pages_held(&self) -> usize {
        self.pages().iter().filter(|p| p.refs() != 0).count()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    pub fn bad_unmaps(&self) -> usize {
        self.state.lock().unwrap().bad_unmaps
    }

    pub fn doorbells(&self) -> Vec<(QueueType, u64)> {
        self.state.lock().unwrap().doorbells.clone()
    }

    pub fn clear_doorbells(&self) {
        self.state.lock().unwrap().doorbells.clear();
    }

    pub fn credits(&self) -> Vec<(u32, u32, IntrCredFlags)> {
        self.state.lock().unwrap().credits.clone()
    }
}

impl DmaOps for MockHal {
    type Page = MockPage;

    fn alloc_pages(&self, order: u32) -> Option<MockPage> {
        let mut s = self.state.lock().unwrap();
        if !take(&mut s.alloc_budget) {
            return None;
        }
        let page = MockPage(Arc::new(PageInner {
            id: s.pages.len(),
            nid: s.page_nid,
            pfmemalloc: s.pfmemalloc,
            refs: AtomicI64::new(1),
            data: Mutex::new(vec![0; PAGE_SIZE << order]),
        }));
        s.pages.push(page.clone());
        Some(page)
    }

    fn free_pages(&self, page: MockPage, _order: u32) {
        page.add_refs(-1);
    }

    fn get_page(&self, page: &MockPage) {
        page.add_refs(1);
    }

    fn page_ref_add(&self, page: &MockPage, n: u32) {
        page.add_refs(i64::from(n));
    }

    fn page_ref_sub(&self, page: &MockPage, n: u32) {
        page.add_refs(-i64::from(n));
    }

    fn numa_mem_id(&self) -> usize {
        0
    }

    fn map_page(
        &self,
        page: &MockPage,
        offset: usize,
        len: usize,
        _dir: DmaDirection,
    ) -> IonicResult<DmaBusAddress> {
        Ok(self.map(len, MapKind::Page, Some((page.clone(), offset))))
    }

    fn unmap_page(&self, addr: DmaBusAddress, len: usize, _dir: DmaDirection) {
        self.unmap(addr, len, MapKind::Page);
    }

    fn map_single(&self, data: &[u8], _dir: DmaDirection) -> IonicResult<DmaBusAddress> {
        if !take(&mut self.state.lock().unwrap().map_single_budget) {
            return Err(IonicError::DmaMap);
        }
        Ok(self.map(data.len(), MapKind::Single, None))
    }

    fn unmap_single(&self, addr: DmaBusAddress, len: usize, _dir: DmaDirection) {
        self.unmap(addr, len, MapKind::Single);
    }

    fn map_frag(&self, data: &[u8], _dir: DmaDirection) -> IonicResult<DmaBusAddress> {
        if !take(&mut self.state.lock().unwrap().map_frag_budget) {
            return Err(IonicError::DmaMap);
        }
        Ok(self.map(data.len(), MapKind::Page, None))
    }

    fn sync_single_for_cpu(&self, _addr: DmaBusAddress, _len: usize, _dir: DmaDirection) {}

    fn sync_single_for_device(&self, _addr: DmaBusAddress, _len: usize, _dir: DmaDirection) {}
}

impl Doorbell for MockHal {
    fn ring_doorbell(&self, qtype: QueueType, value: u64) {
        self.state.lock().unwrap().doorbells.push((qtype, value));
    }

    fn intr_credits(&self, intr_index: u32, credits: u32, flags: IntrCredFlags) {
        self.state
            .lock()
            .unwrap()
            .credits
            .push((intr_index, credits, flags));
    }
}

/// An outgoing packet with plain byte buffers.
#[derive(Debug, Clone)]
pub struct MockTx {
    pub id: u32,
    pub head: Vec<u8>,
    pub frags: Vec<Vec<u8>>,
    pub queue: u16,
    pub gso: Option<GsoInfo>,
    pub encap: bool,
    pub csum: Option<CsumOffload>,
    pub vlan: Option<u16>,
    pub l3: L3Proto,
    pub nh: usize,
    pub th: usize,
    pub timestamped: bool,
}

impl MockTx {
    pub fn new(id: u32, head_len: usize) -> Self {
        Self {
            id,
            head: vec![id as u8; head_len],
            frags: Vec::new(),
            queue: 0,
            gso: None,
            encap: false,
            csum: None,
            vlan: None,
            l3: L3Proto::Other,
            nh: 14,
            th: 34,
            timestamped: false,
        }
    }

    pub fn with_frags(mut self, lens: &[usize]) -> Self {
        self.frags = lens.iter().map(|&n| vec![0xa5; n]).collect();
        self
    }

    /// Ethernet + IPv4 + TCP headers from 10.0.0.1 to 10.0.0.2, followed by
    /// `payload` head bytes, segmented at `mss`.
    pub fn tcp_v4(id: u32, payload: usize, mss: u16) -> Self {
        let mut head = vec![0u8; TCP_V4_HDRLEN + payload];
        head[12..14].copy_from_slice(&[0x08, 0x00]);
        head[14] = 0x45;
        head[22] = 64;
        head[23] = 6;
        head[24..26].copy_from_slice(&[0xab, 0xcd]);
        head[26..30].copy_from_slice(&[10, 0, 0, 1]);
        head[30..34].copy_from_slice(&[10, 0, 0, 2]);
        head[46] = 0x50;
        head[50..52].copy_from_slice(&[0xff, 0xff]);
        Self {
            head,
            gso: Some(GsoInfo {
                size: mss,
                outer_csum: false,
            }),
            l3: L3Proto::Ipv4,
            ..Self::new(id, 0)
        }
    }
}

pub const TCP_V4_HDRLEN: usize = 54;

impl TxPacket for MockTx {
    fn len(&self) -> usize {
        self.head.len() + self.frags.iter().map(Vec::len).sum::<usize>()
    }

    fn data(&self) -> &[u8] {
        &self.head
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.head
    }

    fn nr_frags(&self) -> usize {
        self.frags.len()
    }

    fn frag(&self, i: usize) -> &[u8] {
        &self.frags[i]
    }

    fn queue_mapping(&self) -> u16 {
        self.queue
    }

    fn gso(&self) -> Option<GsoInfo> {
        self.gso
    }

    fn encapsulation(&self) -> bool {
        self.encap
    }

    fn csum_partial(&self) -> Option<CsumOffload> {
        self.csum
    }

    fn vlan_tag(&self) -> Option<u16> {
        self.vlan
    }

    fn linearize(&mut self) -> IonicResult {
        for frag in self.frags.drain(..) {
            self.head.extend_from_slice(&frag);
        }
        Ok(())
    }

    fn cow_head(&mut self) -> IonicResult {
        Ok(())
    }

    fn l3_proto(&self, _inner: bool) -> L3Proto {
        self.l3
    }

    fn network_offset(&self, _inner: bool) -> usize {
        self.nh
    }

    fn transport_offset(&self, _inner: bool) -> usize {
        self.th
    }

    fn tx_timestamp(&mut self) {
        self.timestamped = true;
    }
}

/// A received packet as the stack would see it.
#[derive(Clone, Default)]
pub struct MockRx {
    pub data: Vec<u8>,
    pub frags: Vec<(MockPage, usize, usize, usize)>,
    pub queue: Option<u16>,
    pub hash: Option<(u32, HashType)>,
    pub csum: Option<u16>,
    pub vlan: Option<(u16, u16)>,
}

impl MockRx {
    /// Bytes carried in fragments.
    pub fn frag_len(&self) -> usize {
        self.frags.iter().map(|f| f.2).sum()
    }

    pub fn frag_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (page, off, len, _) in &self.frags {
            let mut buf = vec![0; *len];
            page.read(*off, &mut buf);
            out.extend_from_slice(&buf);
        }
        out
    }

    pub fn free(self) {
        for (page, ..) in self.frags {
            page.put();
        }
    }
}

impl RxPacket<MockPage> for MockRx {
    fn put(&mut self, len: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + len, 0);
        &mut self.data[start..]
    }

    fn add_frag(&mut self, page: MockPage, offset: usize, len: usize, truesize: usize) {
        self.frags.push((page, offset, len, truesize));
    }

    fn record_rx_queue(&mut self, index: u16) {
        self.queue = Some(index);
    }

    fn set_hash(&mut self, hash: u32, ty: HashType) {
        self.hash = Some((hash, ty));
    }

    fn set_csum_complete(&mut self, csum: u16) {
        self.csum = Some(csum);
    }

    fn put_vlan_tag(&mut self, proto: u16, tci: u16) {
        self.vlan = Some((proto, tci));
    }
}

/// How a received packet reached the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Copied,
    Frags,
}

struct StackState {
    stopped: BTreeSet<u16>,
    xmit_more: bool,
    sent: Vec<(u16, usize)>,
    completed: Vec<(u16, u32, usize)>,
    consumed: Vec<MockTx>,
    dropped: Vec<MockTx>,
    received: Vec<(u16, MockRx, Delivery)>,
    rx_alloc_fails: bool,
    napi_accept: bool,
    napi_calls: Vec<(u16, u32)>,
    wakes: usize,
}

pub struct MockStack {
    state: Mutex<StackState>,
}

impl MockStack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StackState {
                stopped: BTreeSet::new(),
                xmit_more: false,
                sent: Vec::new(),
                completed: Vec::new(),
                consumed: Vec::new(),
                dropped: Vec::new(),
                received: Vec::new(),
                rx_alloc_fails: false,
                napi_accept: true,
                napi_calls: Vec::new(),
                wakes: 0,
            }),
        }
    }

    pub fn set_xmit_more(&self, more: bool) {
        self.state.lock().unwrap().xmit_more = more;
    }

    pub fn set_rx_alloc_fails(&self, fails: bool) {
        self.state.lock().unwrap().rx_alloc_fails = fails;
    }

    pub fn set_napi_accept(&self, accept: bool) {
        self.state.lock().unwrap().napi_accept = accept;
    }

    pub fn sent(&self) -> Vec<(u16, usize)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn completed(&self) -> Vec<(u16, u32, usize)> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn consumed(&self) -> Vec<MockTx> {
        self.state.lock().unwrap().consumed.clone()
    }

    pub fn dropped(&self) -> Vec<MockTx> {
        self.state.lock().unwrap().dropped.clone()
    }

    pub fn take_received(&self) -> Vec<(u16, MockRx, Delivery)> {
        core::mem::take(&mut self.state.lock().unwrap().received)
    }

    pub fn napi_calls(&self) -> Vec<(u16, u32)> {
        self.state.lock().unwrap().napi_calls.clone()
    }

    pub fn wakes(&self) -> usize {
        self.state.lock().unwrap().wakes
    }
}

impl NetStack for MockStack {
    type Page = MockPage;
    type Tx = MockTx;
    type Rx = MockRx;

    fn stop_subqueue(&self, index: u16) {
        self.state.lock().unwrap().stopped.insert(index);
    }

    fn wake_subqueue(&self, index: u16) {
        let mut s = self.state.lock().unwrap();
        s.stopped.remove(&index);
        s.wakes += 1;
    }

    fn subqueue_stopped(&self, index: u16) -> bool {
        self.state.lock().unwrap().stopped.contains(&index)
    }

    fn xmit_more(&self) -> bool {
        self.state.lock().unwrap().xmit_more
    }

    fn sent_queue(&self, index: u16, bytes: usize) {
        self.state.lock().unwrap().sent.push((index, bytes));
    }

    fn completed_queue(&self, index: u16, pkts: u32, bytes: usize) {
        self.state
            .lock()
            .unwrap()
            .completed
            .push((index, pkts, bytes));
    }

    fn consume_tx(&self, pkt: MockTx) {
        self.state.lock().unwrap().consumed.push(pkt);
    }

    fn drop_tx(&self, pkt: MockTx) {
        self.state.lock().unwrap().dropped.push(pkt);
    }

    fn alloc_rx(&self, _index: u16, _len: usize) -> Option<MockRx> {
        (!self.state.lock().unwrap().rx_alloc_fails).then(MockRx::default)
    }

    fn get_frags(&self, _index: u16) -> Option<MockRx> {
        (!self.state.lock().unwrap().rx_alloc_fails).then(MockRx::default)
    }

    fn free_rx(&self, pkt: MockRx) {
        pkt.free();
    }

    fn gro_receive(&self, index: u16, pkt: MockRx) {
        self.state
            .lock()
            .unwrap()
            .received
            .push((index, pkt, Delivery::Copied));
    }

    fn gro_frags(&self, index: u16, pkt: MockRx) {
        self.state
            .lock()
            .unwrap()
            .received
            .push((index, pkt, Delivery::Frags));
    }

    fn napi_complete_done(&self, index: u16, work_done: u32) -> bool {
        let mut s = self.state.lock().unwrap();
        s.napi_calls.push((index, work_done));
        s.napi_accept
    }
}

pub type TestLif = Lif<MockHal, MockStack>;

/// Small rings so tests can wrap them.
pub fn small_config() -> LifConfig {
    LifConfig {
        ntxq_descs: 16,
        nrxq_descs: 16,
        ..LifConfig::new()
    }
}

/// An interface with `nxqs` queue pairs, administratively up.
pub fn new_lif(config: LifConfig, nxqs: u16) -> TestLif {
    let lif = Lif::new(MockHal::new(), MockStack::new(), config, nxqs).unwrap();
    lif.set_up(true);
    lif
}

/// The device's producer side of a completion queue.
pub struct DeviceCq {
    idx: u16,
    color: bool,
}

impl DeviceCq {
    pub fn new() -> Self {
        Self {
            idx: 0,
            color: true,
        }
    }

    pub fn push<C: CompDesc>(&mut self, cq: &mut CompletionQueue<C>, make: impl FnOnce(bool) -> C) {
        cq.descs_mut()[self.idx as usize] = make(self.color);
        self.idx = (self.idx + 1) % cq.num_descs();
        if self.idx == 0 {
            self.color = !self.color;
        }
    }
}

/// Device reports transmit descriptors up to `comp_index` done on `qi`.
pub fn tx_complete(lif: &TestLif, dev: &mut DeviceCq, qi: u16, comp_index: u16) {
    let mut qcq = lif.txqcq(qi).unwrap().lock();
    dev.push(&mut qcq.cq, |color| TxqComp::new(comp_index, 0, color));
}

/// Device writes `payload` into the tail buffer of receive queue `qi` and
/// completes it; `edit` can decorate the record.
pub fn rx_receive(
    lif: &TestLif,
    dev: &mut DeviceCq,
    qi: u16,
    slot: u16,
    payload: &[u8],
    edit: impl FnOnce(RxqComp) -> RxqComp,
) {
    let mut qcq = lif.rxqcq(qi).unwrap().lock();
    let desc = *qcq.q.ring().desc(slot);
    let first = payload.len().min(desc.len() as usize);
    lif.hal().dma_write(desc.addr(), &payload[..first]);
    let mut done = first;
    let mut nsg = 0u8;
    let sg = *qcq.q.ring().sg_desc(slot);
    for elem in sg.elems.iter() {
        if done == payload.len() || elem.len() == 0 {
            break;
        }
        let n = (payload.len() - done).min(elem.len() as usize);
        lif.hal().dma_write(elem.addr(), &payload[done..done + n]);
        done += n;
        nsg += 1;
    }
    dev.push(&mut qcq.cq, |color| {
        edit(RxqComp::new(slot, payload.len() as u16, color).with_num_sg_elems(nsg))
    });
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}
