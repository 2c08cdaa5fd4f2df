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

//! Write back: picking victims and the BLOCK, TRACK, EWB sequence.

use std::sync::atomic::Ordering;

use super::backing::BackingStore;
use super::page::{EnclPage, EnclPageFlags, VaPage};
use super::{Enclave, EnclaveFlags, EnclaveStatsId, EnclInner};
use crate::consts::PAGE_SHIFT;
use crate::encls::sgx::SgxPcmd;
use crate::encls::{EnclsError, EnclsErrorKind, SgxErrorCode};
use crate::error::EpcResult;
use crate::memory::addr::page_index;
use crate::memory::{AlignedPage, EnclVirtAddr, EpcPhysAddr};
use crate::stats::Instant;

impl Enclave {
    /// Second chance scan of up to `nr_to_scan` resident pages. Victims are
    /// taken off the load list and marked reserved.
    pub(crate) fn isolate_pages(&self, nr_to_scan: usize) -> Vec<EnclVirtAddr> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut victims = Vec::new();
        if self.is_dead() {
            return victims;
        }

        for _ in 0..nr_to_scan.min(inner.load_list.len()) {
            let addr = match inner.load_list.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            let page = match inner.pages.get_mut(&addr) {
                Some(page) if page.epc_page.is_some() => page,
                _ => continue,
            };
            if self.mm.test_and_clear_young(addr) || page.is_reserved() {
                inner.load_list.push_back(addr);
            } else {
                page.flags.insert(EnclPageFlags::RESERVED);
                victims.push(addr);
            }
        }
        victims
    }

    /// Evict the isolated `victims`. Returns the number of EPC pages freed.
    /// Any protocol failure kills the enclave.
    pub(crate) fn write_pages(&self, victims: &[EnclVirtAddr]) -> usize {
        if victims.is_empty() {
            return 0;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let ret = if self.is_dead() {
            Ok(0)
        } else {
            self.write_back_batch(inner, victims)
        };
        for addr in victims {
            if let Some(page) = inner.pages.get_mut(addr) {
                page.flags.remove(EnclPageFlags::RESERVED);
            }
        }
        match ret {
            Ok(nr_freed) => nr_freed,
            Err(e) => {
                encl_err!(self, "write back failed: {:?}", e);
                self.invalidate(inner);
                0
            }
        }
    }

    fn write_back_batch(&self, inner: &mut EnclInner, victims: &[EnclVirtAddr]) -> EpcResult<usize> {
        let secs = inner.secs_paddr()?;

        let start = Instant::now();
        for addr in victims {
            self.mm.zap(*addr);
            let paddr = match inner.pages.get(addr).and_then(|page| page.paddr()) {
                Some(paddr) => paddr,
                None => return epc_result_err!(EFAULT, format!("victim {:#x} is not resident", addr)),
            };
            self.encls.block(paddr)?;
        }
        self.atomic_add_stats(EnclaveStatsId::Block, start.elapsed());

        let start = Instant::now();
        if let Err(e) = self.encls.track(secs) {
            if e.kind() != EnclsErrorKind::Retry {
                return Err(e.into());
            }
            encl_dbg!(self, "ETRACK returned {:?}, kicking", e);
            self.encls.kick_cpus(secs);
            self.encls.track(secs)?;
        }
        self.atomic_add_stats(EnclaveStatsId::Track, start.elapsed());

        let mut nr_freed = 0;
        let EnclInner {
            pages,
            va_pages,
            backing,
            secs: secs_page,
            secs_child_cnt,
            ..
        } = inner;
        let backing = match backing.as_ref() {
            Some(backing) => backing,
            None => return epc_result_err!(EFAULT, "backing store released"),
        };
        for addr in victims {
            let start = Instant::now();
            let page = match pages.get_mut(addr) {
                Some(page) => page,
                None => return epc_result_err!(EFAULT),
            };
            let index = page_index(self.base(), *addr);
            self.write_back(page, va_pages, backing, index, secs)?;
            *secs_child_cnt -= 1;
            self.nr_resident.fetch_sub(1, Ordering::AcqRel);
            nr_freed += 1;
            self.atomic_add_stats(EnclaveStatsId::WriteBack, start.elapsed());
        }

        if *secs_child_cnt == 0 && self.is_initialized() && secs_page.epc_page.is_some() {
            let index = self.size() >> PAGE_SHIFT;
            self.write_back(secs_page, va_pages, backing, index, secs)?;
            self.set_flags(EnclaveFlags::SECS_EVICTED);
            nr_freed += 1;
            encl_dbg!(self, "SECS evicted");
        }
        Ok(nr_freed)
    }

    /// EWB one page into the backing store and free its EPC page. The first
    /// eviction binds a version slot the page keeps for good.
    fn write_back(
        &self,
        page: &mut EnclPage,
        va_pages: &mut [VaPage],
        backing: &BackingStore,
        index: usize,
        secs: EpcPhysAddr,
    ) -> EpcResult {
        let va_slot = match page.va_slot {
            Some(slot) => slot,
            None => {
                let slot = match va_pages.iter_mut().find_map(|va| va.alloc_slot()) {
                    Some(slot) => slot,
                    None => return epc_result_err!(ENOSPC, "no free version slot"),
                };
                page.va_slot = Some(slot);
                slot
            }
        };
        let paddr = match page.paddr() {
            Some(paddr) => paddr,
            None => return epc_result_err!(EFAULT),
        };

        let mut contents = AlignedPage::new_boxed();
        let mut pcmd = SgxPcmd::default();
        let mut ret = self.encls.evict(paddr, va_slot, &mut contents, &mut pcmd);
        if ret == Err(EnclsError::Code(SgxErrorCode::NotTracked)) {
            self.encls.kick_cpus(secs);
            ret = self.encls.evict(paddr, va_slot, &mut contents, &mut pcmd);
        }
        ret?;
        backing.write_page(index, &contents, &pcmd)?;

        page.epc_page = None;
        page.evicted = true;
        encl_dbg!(self, "wrote back {:#x} from {:#x}", page.addr, paddr);
        Ok(())
    }
}
