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

//! EPC page allocation.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use bitmap_allocator::BitAlloc;
use spin::{Mutex, RwLock};

use crate::config::EpcConfig;
use crate::consts::{EPC_RESERVED_PAGES, PAGE_SIZE};
use crate::encls::Encls;
use crate::error::EpcResult;
use crate::memory::{EnclVirtAddr, EpcPhysAddr};

type BankAlloc = bitmap_allocator::BitAlloc64K;

const BANK_MAX_PAGES: usize = 0x10000;

bitflags! {
    pub struct AllocFlags: u32 {
        /// Never run the eviction engine, fail with `EBUSY` instead.
        const ATOMIC    = 1 << 0;
        /// The page becomes a version array page and is never evicted.
        const VA        = 1 << 1;
    }
}

/// Who holds an allocated EPC page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOwner {
    Secs { enclave: u64 },
    Va { enclave: u64 },
    Page { enclave: u64, addr: EnclVirtAddr },
}

/// Drives eviction when the pool runs dry.
pub trait Swapper: Send + Sync {
    /// Run one eviction cycle over at most `nr_to_scan` pages and return the
    /// number of pages written back.
    fn swap_pages(&self, nr_to_scan: usize) -> usize;

    /// Kick the background reclaimer.
    fn wake(&self);
}

struct EpcBank {
    base: EpcPhysAddr,
    nr_pages: usize,
    inner: Box<BankAlloc>,
}

impl EpcBank {
    fn new(base: EpcPhysAddr, nr_pages: usize) -> Self {
        let mut inner = Box::new(BankAlloc::DEFAULT);
        inner.insert(0..nr_pages);
        Self {
            base,
            nr_pages,
            inner,
        }
    }

    fn contains(&self, paddr: EpcPhysAddr) -> bool {
        paddr >= self.base && paddr < self.base + self.nr_pages * PAGE_SIZE
    }

    fn alloc(&mut self) -> Option<EpcPhysAddr> {
        self.inner.alloc().map(|idx| idx * PAGE_SIZE + self.base)
    }

    fn dealloc(&mut self, paddr: EpcPhysAddr) {
        self.inner.dealloc((paddr - self.base) / PAGE_SIZE);
    }

    fn is_free(&self, paddr: EpcPhysAddr) -> bool {
        self.inner.test((paddr - self.base) / PAGE_SIZE)
    }
}

struct FreePool {
    banks: Vec<EpcBank>,
    owners: BTreeMap<EpcPhysAddr, PageOwner>,
}

impl FreePool {
    fn bank_mut(&mut self, paddr: EpcPhysAddr) -> Option<&mut EpcBank> {
        self.banks.iter_mut().find(|b| b.contains(paddr))
    }
}

/// The global pool of EPC pages.
pub struct EpcAllocator {
    pool: Mutex<FreePool>,
    nr_total: usize,
    nr_free: AtomicUsize,
    nr_va_pages: AtomicUsize,
    low_pages: usize,
    swap_cluster: usize,
    sync_reclaim_retries: usize,
    encls: Arc<dyn Encls>,
    swapper: RwLock<Option<Weak<dyn Swapper>>>,
}

/// An exclusively owned EPC page. Dropping it releases the page through the
/// gateway and returns it to the pool.
pub struct EpcPage {
    paddr: EpcPhysAddr,
    is_va: bool,
    allocator: Arc<EpcAllocator>,
}

impl EpcAllocator {
    pub fn new(config: &EpcConfig, encls: Arc<dyn Encls>) -> EpcResult<Arc<Self>> {
        config.validate()?;
        let mut banks = Vec::new();
        for bank in &config.banks {
            let mut base = bank.base;
            let mut left = bank.page_count();
            while left > 0 {
                let nr_pages = left.min(BANK_MAX_PAGES);
                banks.push(EpcBank::new(base, nr_pages));
                base += nr_pages * PAGE_SIZE;
                left -= nr_pages;
            }
        }
        let nr_total = config.total_pages();
        info!(
            "EPC: {} pages in {} banks, watermarks {}/{}",
            nr_total,
            banks.len(),
            config.low_pages,
            config.high_pages
        );
        Ok(Arc::new(Self {
            pool: Mutex::new(FreePool {
                banks,
                owners: BTreeMap::new(),
            }),
            nr_total,
            nr_free: AtomicUsize::new(nr_total),
            nr_va_pages: AtomicUsize::new(0),
            low_pages: config.low_pages,
            swap_cluster: config.swap_cluster,
            sync_reclaim_retries: config.sync_reclaim_retries,
            encls,
            swapper: RwLock::new(None),
        }))
    }

    pub fn set_swapper(&self, swapper: Weak<dyn Swapper>) {
        *self.swapper.write() = Some(swapper);
    }

    pub fn clear_swapper(&self) {
        *self.swapper.write() = None;
    }

    fn swapper(&self) -> Option<Arc<dyn Swapper>> {
        self.swapper.read().as_ref().and_then(|s| s.upgrade())
    }

    pub fn nr_total(&self) -> usize {
        self.nr_total
    }

    pub fn nr_free(&self) -> usize {
        self.nr_free.load(Ordering::Acquire)
    }

    pub fn nr_va_pages(&self) -> usize {
        self.nr_va_pages.load(Ordering::Acquire)
    }

    pub fn owner_of(&self, paddr: EpcPhysAddr) -> Option<PageOwner> {
        self.pool.lock().owners.get(&paddr).copied()
    }

    /// All owned pages, for consistency checks.
    pub fn owners(&self) -> Vec<(EpcPhysAddr, PageOwner)> {
        self.pool.lock().owners.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn alloc_fast(self: &Arc<Self>, is_va: bool) -> Option<EpcPage> {
        let mut pool = self.pool.lock();
        let paddr = pool.banks.iter_mut().find_map(|bank| bank.alloc())?;
        self.nr_free.fetch_sub(1, Ordering::AcqRel);
        if is_va {
            self.nr_va_pages.fetch_add(1, Ordering::AcqRel);
        }
        trace!("Allocate EPC page: {:#x}", paddr);
        Some(EpcPage {
            paddr,
            is_va,
            allocator: self.clone(),
        })
    }

    /// Allocate an EPC page.
    ///
    /// When the pool is empty, an atomic allocation fails with `EBUSY` and a
    /// blocking one runs the eviction engine synchronously and retries.
    /// `ENOMEM` means version array pages hold so much of the EPC that no
    /// eviction could make progress.
    pub fn alloc(self: &Arc<Self>, flags: AllocFlags) -> EpcResult<EpcPage> {
        let is_va = flags.contains(AllocFlags::VA);
        let mut attempts = 0;
        let page = loop {
            if let Some(page) = self.alloc_fast(is_va) {
                break page;
            }

            // We need at minimum two pages for the #PF handler.
            if self.nr_va_pages() + EPC_RESERVED_PAGES > self.nr_total {
                return epc_result_err!(ENOMEM, "EpcAllocator::alloc(): EPC held by VA pages");
            }
            if flags.contains(AllocFlags::ATOMIC) {
                return epc_result_err!(EBUSY, "EpcAllocator::alloc(): no free EPC page");
            }
            let swapper = match self.swapper() {
                Some(swapper) => swapper,
                None => return epc_result_err!(ENOMEM, "EpcAllocator::alloc(): no reclaimer"),
            };
            if attempts >= self.sync_reclaim_retries {
                return epc_result_err!(
                    EBUSY,
                    format!(
                        "EpcAllocator::alloc(): nothing reclaimed after {} rounds",
                        attempts
                    )
                );
            }
            attempts += 1;
            if swapper.swap_pages(self.swap_cluster) == 0 {
                std::thread::yield_now();
            }
        };

        if self.nr_free() < self.low_pages {
            if let Some(swapper) = self.swapper() {
                swapper.wake();
            }
        }
        Ok(page)
    }

    /// Run one synchronous eviction cycle. Returns the number of pages freed.
    pub fn swap_pages(&self) -> usize {
        match self.swapper() {
            Some(swapper) => swapper.swap_pages(self.swap_cluster),
            None => 0,
        }
    }

    fn set_owner(&self, paddr: EpcPhysAddr, owner: PageOwner) -> EpcResult {
        let mut pool = self.pool.lock();
        if let Some(old) = pool.owners.get(&paddr) {
            if *old != owner {
                return epc_result_err!(
                    EEXIST,
                    format!(
                        "EpcAllocator::set_owner(): page {:#x} owned by {:?}, wanted by {:?}",
                        paddr, old, owner
                    )
                );
            }
        }
        pool.owners.insert(paddr, owner);
        Ok(())
    }

    fn free(&self, paddr: EpcPhysAddr, is_va: bool) {
        // The page goes back to the pool even if EREMOVE fails.
        if let Err(e) = self.encls.release(paddr) {
            error!("EpcAllocator::free(): EREMOVE {:#x} failed: {:?}", paddr, e);
        }
        let mut pool = self.pool.lock();
        pool.owners.remove(&paddr);
        match pool.bank_mut(paddr) {
            Some(bank) if !bank.is_free(paddr) => {
                bank.dealloc(paddr);
                self.nr_free.fetch_add(1, Ordering::AcqRel);
                if is_va {
                    self.nr_va_pages.fetch_sub(1, Ordering::AcqRel);
                }
                trace!("Deallocate EPC page: {:#x}", paddr);
            }
            _ => error!("EpcAllocator::free(): bad or double free {:#x}", paddr),
        }
    }
}

impl Debug for EpcAllocator {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("EpcAllocator")
            .field("nr_total", &self.nr_total)
            .field("nr_free", &self.nr_free())
            .field("nr_va_pages", &self.nr_va_pages())
            .finish()
    }
}

impl EpcPage {
    pub fn paddr(&self) -> EpcPhysAddr {
        self.paddr
    }

    pub fn is_va(&self) -> bool {
        self.is_va
    }

    /// Record the owner of this page in the pool's ownership table.
    pub fn set_owner(&self, owner: PageOwner) -> EpcResult {
        self.allocator.set_owner(self.paddr, owner)
    }
}

impl Debug for EpcPage {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "EpcPage({:#x}{})", self.paddr, if self.is_va { ", VA" } else { "" })
    }
}

impl Drop for EpcPage {
    fn drop(&mut self) {
        self.allocator.free(self.paddr, self.is_va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpcBankConfig;
    use crate::encls::soft::SoftEncls;
    use std::sync::atomic::AtomicBool;

    fn allocator(nr_pages: usize) -> Arc<EpcAllocator> {
        let mut config = EpcConfig::with_pages(nr_pages);
        config.low_pages = 1;
        config.high_pages = 2;
        EpcAllocator::new(&config, Arc::new(SoftEncls::new())).unwrap()
    }

    #[test]
    fn test_alloc_free() {
        let alloc = allocator(4);
        assert_eq!(alloc.nr_total(), 4);
        let pages: Vec<_> = (0..4).map(|_| alloc.alloc(AllocFlags::ATOMIC).unwrap()).collect();
        assert_eq!(alloc.nr_free(), 0);
        let err = alloc.alloc(AllocFlags::ATOMIC).unwrap_err();
        assert!(err.is_transient());
        // no reclaimer installed
        let err = alloc.alloc(AllocFlags::empty()).unwrap_err();
        assert_eq!(err.num(), crate::error::EpcErrorNum::ENOMEM);

        let mut paddrs: Vec<_> = pages.iter().map(|p| p.paddr()).collect();
        paddrs.dedup();
        assert_eq!(paddrs.len(), 4);
        drop(pages);
        assert_eq!(alloc.nr_free(), 4);
    }

    #[test]
    fn test_multiple_banks() {
        let mut config = EpcConfig::with_pages(2);
        config.banks.push(EpcBankConfig::new(0x1_0000_0000, 3 * PAGE_SIZE));
        config.low_pages = 0;
        config.high_pages = 0;
        let alloc = EpcAllocator::new(&config, Arc::new(SoftEncls::new())).unwrap();
        assert_eq!(alloc.nr_total(), 5);
        let pages: Vec<_> = (0..5).map(|_| alloc.alloc(AllocFlags::ATOMIC).unwrap()).collect();
        assert!(pages.iter().any(|p| p.paddr() >= 0x1_0000_0000));
    }

    #[test]
    fn test_owner_exclusive() {
        let alloc = allocator(2);
        let page = alloc.alloc(AllocFlags::ATOMIC).unwrap();
        let owner = PageOwner::Page {
            enclave: 1,
            addr: 0x1000,
        };
        page.set_owner(owner).unwrap();
        page.set_owner(owner).unwrap();
        assert!(page.set_owner(PageOwner::Secs { enclave: 2 }).is_err());
        assert_eq!(alloc.owner_of(page.paddr()), Some(owner));
        let paddr = page.paddr();
        drop(page);
        assert_eq!(alloc.owner_of(paddr), None);
    }

    #[test]
    fn test_va_floor() {
        let alloc = allocator(3);
        let _va = alloc.alloc(AllocFlags::VA).unwrap();
        assert_eq!(alloc.nr_va_pages(), 1);
        let _a = alloc.alloc(AllocFlags::ATOMIC).unwrap();
        let _b = alloc.alloc(AllocFlags::ATOMIC | AllocFlags::VA).unwrap();
        // two VA pages out of three leave fewer than two evictable pages
        let err = alloc.alloc(AllocFlags::ATOMIC).unwrap_err();
        assert_eq!(err.num(), crate::error::EpcErrorNum::ENOMEM);
    }

    struct FreeOne {
        victim: Mutex<Option<EpcPage>>,
        woken: AtomicBool,
    }

    impl Swapper for FreeOne {
        fn swap_pages(&self, _nr_to_scan: usize) -> usize {
            self.victim.lock().take().map_or(0, |_| 1)
        }

        fn wake(&self) {
            self.woken.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sync_reclaim_and_wake() {
        let alloc = allocator(2);
        let first = alloc.alloc(AllocFlags::empty()).unwrap();
        let second = alloc.alloc(AllocFlags::empty()).unwrap();
        let swapper = Arc::new(FreeOne {
            victim: Mutex::new(Some(first)),
            woken: AtomicBool::new(false),
        });
        let weak: Weak<dyn Swapper> = Arc::downgrade(&(swapper.clone() as Arc<dyn Swapper>));
        alloc.set_swapper(weak);

        let third = alloc.alloc(AllocFlags::empty()).unwrap();
        assert!(swapper.woken.load(Ordering::SeqCst));
        assert_eq!(alloc.nr_free(), 0);
        // nothing left to evict
        assert!(alloc.alloc(AllocFlags::empty()).unwrap_err().is_transient());
        assert_eq!(alloc.swap_pages(), 0);
        alloc.clear_swapper();
        assert_eq!(alloc.swap_pages(), 0);
        drop((second, third));
    }
}
