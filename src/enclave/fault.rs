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

//! Page faults: reloading evicted pages and the debugger's view.

use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use super::page::EnclPageFlags;
use super::{Enclave, EnclaveFlags, EnclaveStatsId, EnclInner};
use crate::consts::PAGE_SHIFT;
use crate::encls::Encls;
use crate::epc::{AllocFlags, EpcPage, PageOwner};
use crate::error::{EpcErrorNum, EpcResult};
use crate::memory::addr::{align_down, page_index, page_offset};
use crate::memory::{AlignedPage, EnclVirtAddr, EpcPhysAddr};
use crate::stats::Instant;

const DEBUG_WORD: usize = 8;

impl Enclave {
    /// Make the page at `addr` resident and mapped. Called with the enclave
    /// lock held; never blocks on the allocator.
    ///
    /// A page pinned by someone else answers `EBUSY`, the caller drops the
    /// lock and retries.
    pub(crate) fn do_fault(
        &self,
        inner: &mut EnclInner,
        addr: EnclVirtAddr,
        reserve: bool,
    ) -> EpcResult<EpcPhysAddr> {
        self.check_alive()?;
        if !self.is_initialized() {
            return epc_result_err!(EFAULT, "fault on an uninitialized enclave");
        }
        let addr = align_down(addr);
        let page = match inner.pages.get(&addr) {
            Some(page) => page,
            None => return epc_result_err!(EFAULT, format!("no enclave page at {:#x}", addr)),
        };
        if page.is_reserved() {
            return epc_result_err!(EBUSY);
        }

        if let Some(paddr) = page.paddr() {
            // Raced with another fault, or the mapping was revoked.
            if self.mm.translate(addr).is_none() {
                self.mm.insert_pfn(addr, paddr, page.mem_flags())?;
            }
            if reserve {
                if let Some(page) = inner.pages.get_mut(&addr) {
                    page.flags.insert(EnclPageFlags::RESERVED);
                }
            }
            return Ok(paddr);
        }
        if !page.evicted {
            return epc_result_err!(EFAULT, format!("{:#x} was never added", addr));
        }

        let start = Instant::now();
        let epc_page = self.epc.alloc(AllocFlags::ATOMIC)?;
        if self.flags().contains(EnclaveFlags::SECS_EVICTED) {
            let secs_page = self.epc.alloc(AllocFlags::ATOMIC)?;
            if let Err(e) = self.reload_secs(inner, secs_page) {
                encl_err!(self, "reloading the SECS failed: {:?}", e);
                self.invalidate(inner);
                return Err(e);
            }
        }
        // On error `epc_page` goes back to the pool here.
        let paddr = self.reload_page(inner, addr, &epc_page)?;

        let page = match inner.pages.get_mut(&addr) {
            Some(page) => page,
            None => return epc_result_err!(EFAULT),
        };
        let mem_flags = page.mem_flags();
        page.epc_page = Some(epc_page);
        page.evicted = false;
        if reserve {
            page.flags.insert(EnclPageFlags::RESERVED);
        }
        inner.secs_child_cnt += 1;
        inner.load_list.push_back(addr);
        self.nr_resident.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.mm.insert_pfn(addr, paddr, mem_flags) {
            encl_err!(self, "mapping {:#x} failed: {:?}", addr, e);
            self.invalidate(inner);
            return Err(e);
        }
        self.mm.test_and_clear_young(addr);
        self.atomic_add_stats(EnclaveStatsId::Reload, start.elapsed());
        encl_dbg!(self, "reloaded {:#x} into {:#x}", addr, paddr);
        Ok(paddr)
    }

    fn reload_page(
        &self,
        inner: &EnclInner,
        addr: EnclVirtAddr,
        epc_page: &EpcPage,
    ) -> EpcResult<EpcPhysAddr> {
        let page = match inner.pages.get(&addr) {
            Some(page) => page,
            None => return epc_result_err!(EFAULT),
        };
        let va_slot = match page.va_slot {
            Some(slot) => slot,
            None => return epc_result_err!(EFAULT, "evicted page without a version slot"),
        };
        let mut contents = AlignedPage::new_boxed();
        let pcmd = inner
            .backing()?
            .read_page(page_index(self.base(), addr), &mut contents)?;
        epc_page.set_owner(PageOwner::Page {
            enclave: self.id,
            addr,
        })?;
        let secs = inner.secs_paddr()?;
        if let Err(e) = self
            .encls
            .reload(epc_page.paddr(), Some(secs), addr, &contents, &pcmd, va_slot)
        {
            encl_warn!(self, "ELDU of {:#x} failed: {:?}", addr, e);
            return Err(e.into());
        }
        Ok(epc_page.paddr())
    }

    fn reload_secs(&self, inner: &mut EnclInner, secs_page: EpcPage) -> EpcResult {
        let va_slot = match inner.secs.va_slot {
            Some(slot) => slot,
            None => return epc_result_err!(EFAULT, "evicted SECS without a version slot"),
        };
        let mut contents = AlignedPage::new_boxed();
        let pcmd = inner
            .backing()?
            .read_page(self.size() >> PAGE_SHIFT, &mut contents)?;
        secs_page.set_owner(PageOwner::Secs { enclave: self.id })?;
        self.encls
            .reload(secs_page.paddr(), None, 0, &contents, &pcmd, va_slot)?;
        inner.secs.epc_page = Some(secs_page);
        inner.secs.evicted = false;
        self.clear_flags(EnclaveFlags::SECS_EVICTED);
        encl_dbg!(self, "SECS reloaded");
        Ok(())
    }

    /// Drop the enclave lock and retry `f` while it reports `EBUSY`, up to
    /// the fault retry budget.
    fn retry_busy<'a, T>(
        &'a self,
        addr: EnclVirtAddr,
        mut f: impl FnMut() -> EpcResult<(MutexGuard<'a, EnclInner>, T)>,
    ) -> EpcResult<(MutexGuard<'a, EnclInner>, T)> {
        for _ in 0..=self.limits.fault_retries {
            match f() {
                Err(e) if e.num() == EpcErrorNum::EBUSY => self.backoff(),
                ret => return ret,
            }
        }
        epc_result_err!(EBUSY, format!("{:#x} stayed busy", addr))
    }

    /// Resolve a user access to `addr`, faulting the page in if needed.
    /// Returns with the lock held so the page stays resident while the
    /// caller uses it.
    pub(crate) fn fault_in(
        &self,
        addr: EnclVirtAddr,
        write: bool,
    ) -> EpcResult<(MutexGuard<'_, EnclInner>, EpcPhysAddr)> {
        self.retry_busy(addr, move || {
            let mut inner = self.lock();
            self.check_runnable()?;
            if let Some(paddr) = self.mm.touch(addr, write) {
                return Ok((inner, paddr));
            }
            if self.mm.translate(align_down(addr)).is_some() {
                let access = if write { "write" } else { "read" };
                return epc_result_err!(EFAULT, format!("{} access to {:#x} denied", access, addr));
            }
            let start = Instant::now();
            self.do_fault(&mut inner, addr, false)?;
            self.atomic_add_stats(EnclaveStatsId::Fault, start.elapsed());
            match self.mm.touch(addr, write) {
                Some(paddr) => Ok((inner, paddr)),
                None => epc_result_err!(EFAULT),
            }
        })
    }

    /// Fault in the page at `page_addr` and pin it against eviction until
    /// `unreserve()`.
    pub(crate) fn fault_reserve(
        &self,
        page_addr: EnclVirtAddr,
    ) -> EpcResult<(MutexGuard<'_, EnclInner>, EpcPhysAddr)> {
        self.retry_busy(page_addr, move || {
            let mut inner = self.lock();
            self.check_runnable()?;
            let paddr = self.do_fault(&mut inner, page_addr, true)?;
            Ok((inner, paddr))
        })
    }

    pub(crate) fn unreserve(&self, page_addr: EnclVirtAddr) {
        if let Some(page) = self.lock().pages.get_mut(&page_addr) {
            page.flags.remove(EnclPageFlags::RESERVED);
        }
    }

    /// Handle a page fault at `addr` of the owning process.
    pub fn fault(&self, addr: EnclVirtAddr, write: bool) -> EpcResult<EpcPhysAddr> {
        self.fault_in(addr, write).map(|(_, paddr)| paddr)
    }

    /// Read enclave memory through the debugger interface.
    pub fn debug_read(&self, addr: EnclVirtAddr, buf: &mut [u8]) -> EpcResult {
        self.debug_access(addr, buf.len(), false, |encls, paddr, offset, dst, src| {
            let word = encls.debug_read(paddr, offset)?.to_le_bytes();
            buf[dst].copy_from_slice(&word[src]);
            Ok(())
        })
    }

    /// Write enclave memory through the debugger interface. Partial words
    /// are read, patched and written back.
    pub fn debug_write(&self, addr: EnclVirtAddr, data: &[u8]) -> EpcResult {
        self.debug_access(addr, data.len(), true, |encls, paddr, offset, src, dst| {
            let mut word = if dst.len() == DEBUG_WORD {
                [0u8; DEBUG_WORD]
            } else {
                encls.debug_read(paddr, offset)?.to_le_bytes()
            };
            word[dst].copy_from_slice(&data[src]);
            encls.debug_write(paddr, offset, u64::from_le_bytes(word))?;
            Ok(())
        })
    }

    /// Walk `[addr, addr + len)` one 8-byte word at a time. `op` gets the
    /// page, the word's offset in it, the range of the caller's buffer and
    /// the matching range inside the word.
    fn debug_access<F>(&self, addr: EnclVirtAddr, len: usize, write: bool, mut op: F) -> EpcResult
    where
        F: FnMut(&dyn Encls, EpcPhysAddr, usize, Range<usize>, Range<usize>) -> EpcResult,
    {
        if !self.flags().contains(EnclaveFlags::DEBUG) {
            return epc_result_err!(EPERM, format!("enclave {:#x} is not a debug enclave", self.id));
        }
        let end = match addr.checked_add(len) {
            Some(end) if addr >= self.base() && end <= self.elrange.end => end,
            _ => {
                return epc_result_err!(
                    EFAULT,
                    format!("debug access {:#x}+{:#x} outside ELRANGE", addr, len)
                )
            }
        };

        let mut reserved = None;
        let ret = self.debug_access_words(addr, end, write, &mut reserved, &mut op);
        if let Some(page_addr) = reserved {
            self.unreserve(page_addr);
        }
        ret
    }

    fn debug_access_words<F>(
        &self,
        addr: EnclVirtAddr,
        end: EnclVirtAddr,
        write: bool,
        reserved: &mut Option<EnclVirtAddr>,
        op: &mut F,
    ) -> EpcResult
    where
        F: FnMut(&dyn Encls, EpcPhysAddr, usize, Range<usize>, Range<usize>) -> EpcResult,
    {
        let mut pos = addr;
        while pos < end {
            let page_addr = align_down(pos);
            if *reserved != Some(page_addr) {
                if let Some(prev) = reserved.take() {
                    self.unreserve(prev);
                }
                drop(self.fault_reserve(page_addr)?);
                *reserved = Some(page_addr);
            }

            let word_addr = pos & !(DEBUG_WORD - 1);
            let next = (word_addr + DEBUG_WORD).min(end);
            let inner = self.lock();
            self.check_alive()?;
            let page = match inner.pages.get(&page_addr) {
                Some(page) => page,
                None => return epc_result_err!(EFAULT),
            };
            if write && page.is_tcs() {
                return epc_result_err!(EFAULT, format!("TCS {:#x} is read-only", page_addr));
            }
            let paddr = match page.paddr() {
                Some(paddr) => paddr,
                None => return epc_result_err!(EFAULT),
            };
            op(
                &*self.encls,
                paddr,
                page_offset(word_addr),
                pos - addr..next - addr,
                pos - word_addr..next - word_addr,
            )?;
            pos = next;
        }
        Ok(())
    }
}
