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

use bitflags::bitflags;

use crate::consts::{VA_SLOT_COUNT, VA_SLOT_SIZE};
use crate::encls::sgx::{SgxEnclPageType, SgxSecInfo};
use crate::epc::EpcPage;
use crate::memory::{EnclVirtAddr, EpcPhysAddr, MemFlags};

bitflags! {
    pub struct EnclPageFlags: u8 {
        /// Thread control structure.
        const TCS       = 1 << 0;
        /// Pinned by a fault, a debugger or the reclaimer.
        const RESERVED  = 1 << 1;
        /// A thread is running on this TCS.
        const ENTERED   = 1 << 2;
    }
}

/// One page of ELRANGE.
///
/// A page is resident (`epc_page` is set), evicted (its sealed image is in
/// the backing store) or waiting for the add worker, never two of them.
#[derive(Debug)]
pub(crate) struct EnclPage {
    pub(crate) addr: EnclVirtAddr,
    pub(crate) flags: EnclPageFlags,
    pub(crate) secinfo: SgxSecInfo,
    pub(crate) epc_page: Option<EpcPage>,
    /// Version slot, bound on the first eviction.
    pub(crate) va_slot: Option<EpcPhysAddr>,
    pub(crate) evicted: bool,
}

impl EnclPage {
    pub(crate) fn new(addr: EnclVirtAddr, secinfo: SgxSecInfo) -> Self {
        let mut flags = EnclPageFlags::empty();
        if secinfo.page_type == SgxEnclPageType::TCS {
            flags |= EnclPageFlags::TCS;
        }
        Self {
            addr,
            flags,
            secinfo,
            epc_page: None,
            va_slot: None,
            evicted: false,
        }
    }

    pub(crate) fn is_tcs(&self) -> bool {
        self.flags.contains(EnclPageFlags::TCS)
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.flags.contains(EnclPageFlags::RESERVED)
    }

    pub(crate) fn paddr(&self) -> Option<EpcPhysAddr> {
        self.epc_page.as_ref().map(|page| page.paddr())
    }

    /// Rights of the user mapping. A TCS is mapped but never accessible.
    pub(crate) fn mem_flags(&self) -> MemFlags {
        if self.is_tcs() {
            MemFlags::empty()
        } else {
            self.secinfo.perms().into()
        }
    }
}

/// A version array page and how many of its slots are bound.
#[derive(Debug)]
pub(crate) struct VaPage {
    epc_page: EpcPage,
    nr_used: usize,
}

impl VaPage {
    pub(crate) fn new(epc_page: EpcPage) -> Self {
        Self {
            epc_page,
            nr_used: 0,
        }
    }

    pub(crate) fn paddr(&self) -> EpcPhysAddr {
        self.epc_page.paddr()
    }

    pub(crate) fn alloc_slot(&mut self) -> Option<EpcPhysAddr> {
        if self.nr_used == VA_SLOT_COUNT {
            return None;
        }
        let slot = self.paddr() + self.nr_used * VA_SLOT_SIZE;
        self.nr_used += 1;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpcConfig;
    use crate::encls::sgx::SgxEnclPageFlags;
    use crate::encls::soft::SoftEncls;
    use crate::epc::{AllocFlags, EpcAllocator};
    use std::sync::Arc;

    #[test]
    fn test_page_flags() {
        let page = EnclPage::new(0x1000, SgxSecInfo::tcs());
        assert!(page.is_tcs());
        assert_eq!(page.mem_flags(), MemFlags::empty());
        assert!(page.paddr().is_none());

        let page = EnclPage::new(
            0x2000,
            SgxSecInfo::reg(SgxEnclPageFlags::R | SgxEnclPageFlags::X),
        );
        assert!(!page.is_tcs());
        assert!(!page.is_reserved());
        assert_eq!(page.mem_flags(), MemFlags::READ | MemFlags::EXECUTE);
    }

    #[test]
    fn test_va_slots() {
        let epc = EpcAllocator::new(&EpcConfig::with_pages(4), Arc::new(SoftEncls::new())).unwrap();
        let mut va = VaPage::new(epc.alloc(AllocFlags::VA).unwrap());
        let first = va.alloc_slot().unwrap();
        assert_eq!(first, va.paddr());
        assert_eq!(va.alloc_slot().unwrap(), first + VA_SLOT_SIZE);
        for _ in 2..VA_SLOT_COUNT {
            assert!(va.alloc_slot().is_some());
        }
        assert!(va.alloc_slot().is_none());
        assert_eq!(epc.nr_va_pages(), 1);
    }
}
