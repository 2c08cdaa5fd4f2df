// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Creation, the page add pipeline, initialization and teardown.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use spin::RwLock;

use super::backing::BackingStore;
use super::page::{EnclPage, VaPage};
use super::{
    Enclave, EnclaveContext, EnclaveFlags, EnclaveHandle, EnclaveStatsId, EnclInner,
    ArrayStatsValue,
};
use crate::consts::{MEASURE_CHUNKS_PER_PAGE, MEASURE_CHUNK_SIZE, VA_SLOT_COUNT};
use crate::encls::sgx::{EinitToken, SgxEnclPageType, SgxSecInfo, SgxSecs, SgxTcs, SigStruct};
use crate::encls::{EnclsError, EnclsResult, SgxErrorCode};
use crate::epc::{AllocFlags, PageOwner};
use crate::error::{EpcError, EpcResult, ErrorClass};
use crate::memory::addr::{is_aligned, page_index};
use crate::memory::{AddressSpace, AlignedPage, EnclVirtAddr, MmuNotifier, PAGE_SIZE};
use crate::stats::Instant;

const INTR_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A page waiting for the add worker. Holds a reference so the enclave
/// outlives its queue.
pub(crate) struct AddPageReq {
    addr: EnclVirtAddr,
    secinfo: SgxSecInfo,
    mrmask: u16,
    _handle: EnclaveHandle,
}

/// A pending signal, polled between EINIT retries.
#[derive(Debug, Default)]
pub struct Interrupt(AtomicBool);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn is_unmasked_event(ret: &EnclsResult) -> bool {
    matches!(ret, Err(EnclsError::Code(SgxErrorCode::UnmaskedEvent)))
}

/// Sleep for `duration`. Returns `false` as soon as `intr` is raised.
fn sleep_interruptible(duration: Duration, intr: Option<&Interrupt>) -> bool {
    let deadline = std::time::Instant::now() + duration;
    loop {
        if intr.map_or(false, Interrupt::is_pending) {
            return false;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(INTR_POLL_INTERVAL));
    }
}

impl Enclave {
    /// ECREATE an enclave for the process owning `mm` and start its add
    /// worker. The returned handle holds the initial reference.
    pub(crate) fn create(
        id: u64,
        mm: &Arc<AddressSpace>,
        secs: &SgxSecs,
        ctx: EnclaveContext,
    ) -> EpcResult<EnclaveHandle> {
        let start = Instant::now();
        secs.validate(ctx.limits.encl_size_max)?;
        let elrange = secs.elrange();
        let backing = BackingStore::new(secs.size as usize)?;

        let encl = Arc::new(Enclave {
            id,
            tgid: mm.tgid(),
            elrange: elrange.clone(),
            flags: AtomicU32::new(0),
            refcount: AtomicUsize::new(1),
            nr_resident: AtomicUsize::new(0),
            inner: Mutex::new(EnclInner {
                pages: BTreeMap::new(),
                load_list: VecDeque::new(),
                secs: EnclPage::new(elrange.end, Enclave::secs_secinfo()),
                va_pages: Vec::new(),
                va_reserved: 0,
                add_queue: VecDeque::new(),
                add_in_flight: false,
                add_error: None,
                secs_child_cnt: 0,
                backing: Some(backing),
                worker_stop: false,
            }),
            cond: Condvar::new(),
            mm: mm.clone(),
            epc: ctx.epc,
            encls: ctx.encls,
            registry: ctx.registry,
            limits: ctx.limits,
            identity: RwLock::new(None),
            stats: ArrayStatsValue::default(),
        });
        // From here on, dropping the handle undoes everything below.
        let handle = EnclaveHandle::adopt(encl.clone());

        let secs_page = encl.epc.alloc(AllocFlags::empty())?;
        encl.reserve_va_slot()?;
        secs_page.set_owner(PageOwner::Secs { enclave: id })?;
        encl.encls.create(secs_page.paddr(), secs)?;
        encl.lock().secs.epc_page = Some(secs_page);
        if secs.is_debug() {
            encl.set_flags(EnclaveFlags::DEBUG);
        }

        let notifier: Arc<dyn MmuNotifier> = encl.clone();
        mm.register_notifier(id, Arc::downgrade(&notifier))?;
        if let Some(registry) = encl.registry.upgrade() {
            registry.add(&encl)?;
        }

        let worker = encl.clone();
        std::thread::Builder::new()
            .name(format!("sgx-add-{:x}", id))
            .spawn(move || worker.add_page_worker())?;

        encl.atomic_add_stats(EnclaveStatsId::Create, start.elapsed());
        encl_info!(encl, "created for tgid {}", mm.tgid());
        Ok(handle)
    }

    /// Make sure a version slot exists for one more page. VA pages are
    /// allocated without the enclave lock, allocation may evict.
    fn reserve_va_slot(&self) -> EpcResult {
        loop {
            {
                let mut inner = self.lock();
                self.check_alive()?;
                if inner.va_reserved < inner.va_pages.len() * VA_SLOT_COUNT {
                    inner.va_reserved += 1;
                    return Ok(());
                }
            }

            let page = self.epc.alloc(AllocFlags::VA)?;
            page.set_owner(PageOwner::Va { enclave: self.id })?;
            self.encls.add_version_array(page.paddr())?;
            let mut inner = self.lock();
            self.check_alive()?;
            encl_dbg!(self, "new VA page {:#x}", page.paddr());
            inner.va_pages.push(VaPage::new(page));
        }
    }

    fn unreserve_va_slot(inner: &mut EnclInner) {
        inner.va_reserved = inner.va_reserved.saturating_sub(1);
    }

    /// Wait until the add worker drained the queue. Returns with the lock
    /// held, or the error that made the worker give up on a batch.
    pub(crate) fn flush_adds(&self) -> EpcResult<MutexGuard<'_, EnclInner>> {
        let mut inner = self.lock();
        while !inner.add_queue.is_empty() || inner.add_in_flight {
            inner = self.wait(inner);
        }
        self.check_alive()?;
        if let Some(err) = inner.add_error.take() {
            return Err(err);
        }
        Ok(inner)
    }

    /// Block until every queued page was added.
    pub fn wait_for_adds(&self) -> EpcResult {
        self.flush_adds().map(|_| ())
    }

    fn add_page_worker(self: Arc<Self>) {
        debug!("sgx-add-{:x}: started", self.id);
        loop {
            let req = {
                let mut inner = self.lock();
                loop {
                    if inner.worker_stop {
                        debug!("sgx-add-{:x}: stopped", self.id);
                        return;
                    }
                    if let Some(req) = inner.add_queue.pop_front() {
                        inner.add_in_flight = true;
                        break req;
                    }
                    inner = self.wait(inner);
                }
            };

            let mut failed = Vec::new();
            if !self.is_dead() {
                if let Err(e) = self.process_add_page(&req) {
                    let mut inner = self.lock();
                    let loaded = inner.pages.get(&req.addr).map_or(false, |p| p.epc_page.is_some());
                    match e.class() {
                        ErrorClass::Resource | ErrorClass::Transient if !loaded => {
                            encl_warn!(self, "adding page {:#x} failed: {:?}", req.addr, e);
                            failed = self.fail_adds(&mut inner, &req, e);
                        }
                        _ => {
                            encl_err!(self, "adding page {:#x} failed: {:?}", req.addr, e);
                            self.invalidate(&mut inner);
                        }
                    }
                }
            }

            // May drop the last reference, never under the lock.
            drop(failed);
            drop(req);
            let mut inner = self.lock();
            inner.add_in_flight = false;
            self.cond.notify_all();
        }
    }

    /// Out of EPC: forget `req` and everything queued behind it. The enclave
    /// stays usable, `err` goes to the next `flush_adds()`. Returns the
    /// dropped requests so their references go away outside the lock.
    fn fail_adds(
        &self,
        inner: &mut EnclInner,
        req: &AddPageReq,
        err: EpcError,
    ) -> Vec<AddPageReq> {
        let failed: Vec<AddPageReq> = inner.add_queue.drain(..).collect();
        for addr in std::iter::once(req.addr).chain(failed.iter().map(|r| r.addr)) {
            inner.pages.remove(&addr);
            Enclave::unreserve_va_slot(inner);
        }
        encl_dbg!(self, "{} queued pages dropped", failed.len());
        inner.add_error = Some(err);
        failed
    }

    fn process_add_page(&self, req: &AddPageReq) -> EpcResult {
        let epc_page = self.epc.alloc(AllocFlags::empty())?;
        let start = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.check_alive()?;
        if !self.mm.is_alive() {
            return epc_result_err!(EFAULT, "address space is gone");
        }

        let mut data = AlignedPage::new_boxed();
        inner
            .backing()?
            .read_contents(page_index(self.base(), req.addr), &mut data)?;
        let secs = inner.secs_paddr()?;
        let page = match inner.pages.get_mut(&req.addr) {
            Some(page) => page,
            None => return epc_result_err!(EFAULT),
        };
        let paddr = epc_page.paddr();
        epc_page.set_owner(PageOwner::Page {
            enclave: self.id,
            addr: req.addr,
        })?;
        self.mm.insert_pfn(req.addr, paddr, page.mem_flags())?;
        if let Err(e) = self.encls.add(secs, paddr, req.addr, &req.secinfo, &data) {
            self.mm.zap(req.addr);
            return Err(e.into());
        }
        page.epc_page = Some(epc_page);
        inner.secs_child_cnt += 1;
        inner.load_list.push_back(req.addr);
        self.nr_resident.fetch_add(1, Ordering::AcqRel);

        for j in 0..MEASURE_CHUNKS_PER_PAGE {
            if req.mrmask & (1 << j) != 0 {
                self.encls.extend(secs, paddr, j * MEASURE_CHUNK_SIZE)?;
            }
        }
        self.mm.test_and_clear_young(req.addr);
        self.atomic_add_stats(EnclaveStatsId::AddPage, start.elapsed());
        Ok(())
    }

    /// EINIT. Spins, then sleeps between rounds while the gateway reports an
    /// unmasked event. A pending `intr` aborts with `ERESTART`. Pages cannot
    /// be added once this started.
    pub fn init(
        &self,
        sigstruct: &SigStruct,
        token: &EinitToken,
        intr: Option<&Interrupt>,
    ) -> EpcResult {
        let inner = self.flush_adds()?;
        if self.is_initialized() {
            return Ok(());
        }
        if self.flags().contains(EnclaveFlags::INITIALIZING) {
            return epc_result_err!(EBUSY, "EINIT already in progress");
        }
        self.set_flags(EnclaveFlags::INITIALIZING);
        drop(inner);

        let start = Instant::now();
        let ret = self.einit(sigstruct, token, intr);
        let inner = self.lock();
        self.clear_flags(EnclaveFlags::INITIALIZING);
        ret?;
        self.check_alive()?;

        match self.encls.report(inner.secs_paddr()?) {
            Ok(identity) => *self.identity.write() = Some(identity),
            Err(e) => encl_warn!(self, "no report after EINIT: {:?}", e),
        }
        self.set_flags(EnclaveFlags::INITIALIZED);
        drop(inner);
        self.atomic_add_stats(EnclaveStatsId::Init, start.elapsed());
        encl_info!(self, "initialized");
        Ok(())
    }

    fn einit(
        &self,
        sigstruct: &SigStruct,
        token: &EinitToken,
        intr: Option<&Interrupt>,
    ) -> EpcResult {
        let mut ret = Ok(());
        for round in 0..=self.limits.einit_sleep_count {
            {
                let inner = self.lock();
                self.check_alive()?;
                let secs = inner.secs_paddr()?;
                for _ in 0..self.limits.einit_spin_count.max(1) {
                    ret = self.encls.finalize(secs, sigstruct, token);
                    if !is_unmasked_event(&ret) {
                        break;
                    }
                }
            }
            if !is_unmasked_event(&ret) || round == self.limits.einit_sleep_count {
                break;
            }
            if !sleep_interruptible(self.limits.einit_sleep_time, intr) {
                return epc_result_err!(ERESTART, "EINIT interrupted");
            }
        }
        if let Err(e) = ret {
            encl_warn!(self, "EINIT returned {:?}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

impl EnclaveHandle {
    /// Queue one page for EADD. The page must not be in the enclave yet;
    /// `mrmask` selects the 256-byte chunks that are measured.
    pub fn add_page(
        &self,
        addr: EnclVirtAddr,
        data: &[u8; PAGE_SIZE],
        secinfo: SgxSecInfo,
        mrmask: u16,
    ) -> EpcResult {
        secinfo.validate()?;
        if secinfo.page_type == SgxEnclPageType::TCS {
            SgxTcs::from_page(data)?.validate(self.size() as u64)?;
        }
        if !is_aligned(addr) || !self.elrange().contains(&addr) {
            return epc_result_err!(
                EINVAL,
                format!(
                    "add_page(): {:#x} is not a page of ELRANGE {:#x?}",
                    addr,
                    self.elrange()
                )
            );
        }

        self.reserve_va_slot()?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let flags = self.flags();
        let err = if flags.contains(EnclaveFlags::DEAD) {
            Some(epc_err!(ENOTRECOVERABLE, "add_page(): enclave is dead"))
        } else if flags.intersects(EnclaveFlags::INITIALIZED | EnclaveFlags::INITIALIZING) {
            Some(epc_err!(EINVAL, "add_page(): enclave is initialized"))
        } else if inner.pages.contains_key(&addr) {
            Some(epc_err!(EEXIST, format!("add_page(): {:#x} already added", addr)))
        } else {
            None
        };
        if let Some(err) = err {
            Enclave::unreserve_va_slot(inner);
            return Err(err);
        }
        let stored = inner
            .backing()
            .and_then(|backing| backing.write_contents(page_index(self.base(), addr), data));
        if let Err(err) = stored {
            Enclave::unreserve_va_slot(inner);
            return Err(err);
        }

        inner.pages.insert(addr, EnclPage::new(addr, secinfo));
        inner.add_queue.push_back(AddPageReq {
            addr,
            secinfo,
            mrmask,
            _handle: self.clone(),
        });
        self.cond.notify_all();
        encl_dbg!(self, "queued {:#x} {:?}", addr, secinfo);
        Ok(())
    }

    /// Kill the enclave now. Pages are freed at once; the enclave itself
    /// lives until the last reference is dropped.
    pub fn destroy(self) {
        {
            let mut inner = self.lock();
            self.invalidate(&mut inner);
            self.set_flags(EnclaveFlags::TEARDOWN);
        }
        encl_info!(self, "destroyed, {} references left", self.refcount() - 1);
    }
}
