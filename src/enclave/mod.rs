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

//! Enclaves: the pages they own and their lifecycle.

mod backing;
mod call;
mod evict;
mod fault;
mod lifecycle;
mod manager;
mod page;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter, Result};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bitflags::bitflags;
use spin::RwLock;

use self::backing::BackingStore;
use self::lifecycle::AddPageReq;
use self::page::{EnclPage, VaPage};
use crate::config::EpcConfig;
use crate::consts::EPC_RESERVED_PAGES;
use crate::encls::sgx::{ElRange, EnclaveIdentity, SgxEnclPageFlags, SgxEnclPageType, SgxSecInfo};
use crate::encls::Encls;
use crate::epc::EpcAllocator;
use crate::error::{EpcError, EpcResult};
use crate::memory::{AddressSpace, EnclVirtAddr, EpcPhysAddr, MmuNotifier, Tgid};
use crate::stats::StatsValue;

pub use self::call::EnclaveCall;
pub use self::lifecycle::Interrupt;
pub use self::manager::EnclaveManager;
pub use self::page::EnclPageFlags;

bitflags! {
    pub struct EnclaveFlags: u32 {
        const INITIALIZED   = 1 << 0;
        const DEBUG         = 1 << 1;
        const SECS_EVICTED  = 1 << 2;
        const SUSPEND       = 1 << 3;
        const DEAD          = 1 << 4;
        /// Destroyed while other contexts still hold a reference.
        const TEARDOWN      = 1 << 5;
        /// The last reference is gone and every page was freed.
        const RELEASED      = 1 << 6;
        /// EINIT is in progress, no more pages may be added.
        const INITIALIZING  = 1 << 7;
    }
}

/// What the calling runtime sees of an enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveStatus {
    Alive,
    /// Suspended, retry later.
    Lost,
    /// Terminal, the enclave must be created again.
    Dead,
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclaveStatsId {
    Create = 0,
    AddPage = 1,
    Init = 2,
    Block = 3,
    Track = 4,
    WriteBack = 5,
    Reload = 6,
    Fault = 7,
    MaxId = 8,
}

impl EnclaveStatsId {
    const ALL: [EnclaveStatsId; EnclaveStatsId::MaxId as usize] = [
        EnclaveStatsId::Create,
        EnclaveStatsId::AddPage,
        EnclaveStatsId::Init,
        EnclaveStatsId::Block,
        EnclaveStatsId::Track,
        EnclaveStatsId::WriteBack,
        EnclaveStatsId::Reload,
        EnclaveStatsId::Fault,
    ];
}

struct ArrayStatsValue([StatsValue; EnclaveStatsId::MaxId as usize]);

impl Default for ArrayStatsValue {
    fn default() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: StatsValue = StatsValue::new();
        Self([ZERO; EnclaveStatsId::MaxId as usize])
    }
}

/// Retry budgets and limits every enclave inherits from the configuration.
#[derive(Debug, Clone)]
pub(crate) struct EnclLimits {
    pub(crate) fault_retries: usize,
    pub(crate) einit_spin_count: usize,
    pub(crate) einit_sleep_count: usize,
    pub(crate) einit_sleep_time: Duration,
    pub(crate) encl_size_max: u64,
}

impl From<&EpcConfig> for EnclLimits {
    fn from(config: &EpcConfig) -> Self {
        Self {
            fault_retries: config.fault_retries,
            einit_spin_count: config.einit_spin_count,
            einit_sleep_count: config.einit_sleep_count,
            einit_sleep_time: config.einit_sleep_time,
            encl_size_max: config.encl_size_max,
        }
    }
}

/// The process-wide collaborators an enclave is created with.
#[derive(Clone)]
pub(crate) struct EnclaveContext {
    pub(crate) epc: Arc<EpcAllocator>,
    pub(crate) encls: Arc<dyn Encls>,
    pub(crate) registry: Weak<EnclaveManager>,
    pub(crate) limits: EnclLimits,
}

/// Everything guarded by the enclave lock.
pub(crate) struct EnclInner {
    pub(crate) pages: BTreeMap<EnclVirtAddr, EnclPage>,
    /// Resident pages in eviction order.
    pub(crate) load_list: VecDeque<EnclVirtAddr>,
    /// The SECS, kept at `base + size`.
    pub(crate) secs: EnclPage,
    pub(crate) va_pages: Vec<VaPage>,
    /// Version slots promised to pages, bound or not.
    pub(crate) va_reserved: usize,
    pub(crate) add_queue: VecDeque<AddPageReq>,
    pub(crate) add_in_flight: bool,
    /// Why the add worker failed the last batch, reported once.
    pub(crate) add_error: Option<EpcError>,
    pub(crate) secs_child_cnt: usize,
    pub(crate) backing: Option<BackingStore>,
    pub(crate) worker_stop: bool,
}

impl EnclInner {
    pub(crate) fn secs_paddr(&self) -> EpcResult<EpcPhysAddr> {
        self.secs
            .paddr()
            .ok_or_else(|| epc_err!(EFAULT, "SECS is not resident"))
    }

    pub(crate) fn backing(&self) -> EpcResult<&BackingStore> {
        self.backing
            .as_ref()
            .ok_or_else(|| epc_err!(EFAULT, "backing store released"))
    }
}

pub struct Enclave {
    id: u64,
    tgid: Tgid,
    elrange: ElRange,
    flags: AtomicU32,
    /// Outstanding `EnclaveHandle`s.
    refcount: AtomicUsize,
    /// Resident child pages, readable without the lock.
    nr_resident: AtomicUsize,
    inner: Mutex<EnclInner>,
    /// Signalled on every state change waiters may care about.
    cond: Condvar,
    mm: Arc<AddressSpace>,
    epc: Arc<EpcAllocator>,
    encls: Arc<dyn Encls>,
    registry: Weak<EnclaveManager>,
    limits: EnclLimits,
    /// Cached report, filled by a successful init.
    identity: RwLock<Option<EnclaveIdentity>>,
    /// Statistics of enclave operation time.
    stats: ArrayStatsValue,
}

impl Enclave {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn base(&self) -> usize {
        self.elrange.start
    }

    pub fn size(&self) -> usize {
        self.elrange.end - self.elrange.start
    }

    pub fn elrange(&self) -> &ElRange {
        &self.elrange
    }

    pub fn tgid(&self) -> Tgid {
        self.tgid
    }

    pub fn flags(&self) -> EnclaveFlags {
        EnclaveFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: EnclaveFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, flags: EnclaveFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_dead(&self) -> bool {
        self.flags().contains(EnclaveFlags::DEAD)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().contains(EnclaveFlags::INITIALIZED)
    }

    pub fn is_released(&self) -> bool {
        self.flags().contains(EnclaveFlags::RELEASED)
    }

    pub fn status(&self) -> EnclaveStatus {
        let flags = self.flags();
        if flags.contains(EnclaveFlags::DEAD) {
            EnclaveStatus::Dead
        } else if flags.contains(EnclaveFlags::SUSPEND) {
            EnclaveStatus::Lost
        } else {
            EnclaveStatus::Alive
        }
    }

    pub fn identity(&self) -> Option<EnclaveIdentity> {
        self.identity.read().clone()
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn nr_resident(&self) -> usize {
        self.nr_resident.load(Ordering::Acquire)
    }

    /// Pages whose only copy is in the backing store.
    pub fn nr_evicted(&self) -> usize {
        self.lock().pages.values().filter(|p| p.evicted).count()
    }

    pub fn is_resident(&self, addr: EnclVirtAddr) -> bool {
        self.lock()
            .pages
            .get(&addr)
            .map_or(false, |p| p.epc_page.is_some())
    }

    pub fn atomic_add_stats(&self, id: EnclaveStatsId, value: u64) {
        self.stats.0[id as usize].atomic_add(value)
    }

    pub fn stats_count(&self, id: EnclaveStatsId) -> u64 {
        self.stats.0[id as usize].count()
    }

    #[cfg(feature = "stats")]
    fn print_stats(&self) {
        debug!("Enclave {:#x} stats:", self.id);
        for id in EnclaveStatsId::ALL.iter() {
            debug!("  {:?}: {}", id, self.stats.0[*id as usize].as_string());
        }
    }

    pub fn reset_stats(&self) {
        #[cfg(feature = "stats")]
        self.print_stats();
        for value in self.stats.0.iter() {
            value.atomic_reset()
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EnclInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, EnclInner>) -> MutexGuard<'a, EnclInner> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, EnclInner>,
        timeout: Duration,
    ) -> MutexGuard<'a, EnclInner> {
        match self.cond.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }

    /// Wake every context blocked on this enclave so it re-checks its state.
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub(crate) fn check_alive(&self) -> EpcResult {
        if self.is_dead() {
            return epc_result_err!(
                ENOTRECOVERABLE,
                format!("enclave {:#x} is dead", self.id)
            );
        }
        Ok(())
    }

    /// Dead enclaves fail for good, suspended ones only for now.
    pub(crate) fn check_runnable(&self) -> EpcResult {
        self.check_alive()?;
        if self.flags().contains(EnclaveFlags::SUSPEND) {
            return epc_result_err!(EINTR, format!("enclave {:#x} is suspended", self.id));
        }
        Ok(())
    }

    /// Make room in the pool, or let the reserving context finish.
    pub(crate) fn backoff(&self) {
        if self.epc.nr_free() < EPC_RESERVED_PAGES {
            self.epc.swap_pages();
        } else {
            std::thread::yield_now();
        }
    }

    pub(crate) fn secs_secinfo() -> SgxSecInfo {
        SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::SECS)
    }

    /// Kill the enclave: revoke every mapping and free every EPC page. There
    /// is no way back.
    pub(crate) fn invalidate(&self, inner: &mut EnclInner) {
        if !self.is_dead() {
            encl_warn!(self, "invalidated");
        }
        self.set_flags(EnclaveFlags::DEAD);
        self.free_pages(inner);
        self.cond.notify_all();
    }

    /// Children go first, the SECS cannot be removed while it has any.
    fn free_pages(&self, inner: &mut EnclInner) {
        self.mm.zap_range(self.elrange.clone());
        for page in inner.pages.values_mut() {
            page.epc_page = None;
        }
        inner.load_list.clear();
        inner.secs_child_cnt = 0;
        inner.va_pages.clear();
        inner.secs.epc_page = None;
        self.nr_resident.store(0, Ordering::Release);
    }

    /// Take a reference unless the last one is already gone.
    pub(crate) fn try_get(self: &Arc<Self>) -> Option<EnclaveHandle> {
        let mut count = self.refcount.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return None;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(EnclaveHandle {
                        encl: self.clone(),
                    })
                }
                Err(current) => count = current,
            }
        }
    }

    /// The last reference is gone.
    fn release(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        self.mm.unregister_notifier(self.id);

        let mut inner = self.lock();
        self.free_pages(&mut inner);
        inner.worker_stop = true;
        inner.backing = None;
        self.set_flags(EnclaveFlags::RELEASED);
        self.cond.notify_all();
        drop(inner);
        encl_info!(self, "released");
    }

    pub(crate) fn suspend(&self) {
        let _inner = self.lock();
        self.set_flags(EnclaveFlags::SUSPEND);
        self.mm.zap_range(self.elrange.clone());
        self.cond.notify_all();
    }

    pub(crate) fn resume(&self) {
        let _inner = self.lock();
        self.clear_flags(EnclaveFlags::SUSPEND);
        self.cond.notify_all();
    }
}

impl MmuNotifier for Enclave {
    /// The owning process is gone. Only flag the enclave, the pages are
    /// freed by whoever drops the last reference.
    fn release(&self, _mm: &AddressSpace) {
        if !self.is_dead() {
            encl_info!(self, "address space released");
        }
        self.set_flags(EnclaveFlags::DEAD);
        self.cond.notify_all();
    }
}

impl Debug for Enclave {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("Enclave")
            .field("id", &self.id)
            .field("tgid", &self.tgid)
            .field("elrange", &self.elrange)
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .field("nr_resident", &self.nr_resident())
            .finish()
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        #[cfg(feature = "stats")]
        self.print_stats();
    }
}

/// A counted reference to an enclave. Dropping the last one frees every page
/// the enclave still holds.
pub struct EnclaveHandle {
    encl: Arc<Enclave>,
}

impl EnclaveHandle {
    /// Adopt the initial reference of a freshly created enclave.
    fn adopt(encl: Arc<Enclave>) -> Self {
        Self { encl }
    }

    pub fn enclave(&self) -> &Arc<Enclave> {
        &self.encl
    }
}

impl Deref for EnclaveHandle {
    type Target = Enclave;

    fn deref(&self) -> &Enclave {
        &self.encl
    }
}

impl Clone for EnclaveHandle {
    fn clone(&self) -> Self {
        self.encl.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            encl: self.encl.clone(),
        }
    }
}

impl Drop for EnclaveHandle {
    fn drop(&mut self) {
        let prev = self
            .encl
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match prev {
            Ok(1) => self.encl.release(),
            Ok(_) => {}
            Err(_) => error!(
                "EnclaveHandle::drop(): enclave {:#x} refcount underflow",
                self.encl.id
            ),
        }
    }
}

impl Debug for EnclaveHandle {
    fn fmt(&self, f: &mut Formatter) -> Result {
        Debug::fmt(&*self.encl, f)
    }
}
