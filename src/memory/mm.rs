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

//! Process address space: the user page table that maps enclave pages.

use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt::{Debug, Formatter, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use super::addr::{is_aligned, EnclVirtAddr, EpcPhysAddr};
use super::{MemFlags, PAGE_SIZE};
use crate::error::EpcResult;

/// Thread group (process) identifier.
pub type Tgid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub paddr: EpcPhysAddr,
    pub flags: MemFlags,
    /// Accessed bit, set by every access through the mapping.
    pub young: bool,
}

/// Callback fired when an address space is torn down.
pub trait MmuNotifier: Send + Sync {
    fn release(&self, mm: &AddressSpace);
}

pub struct AddressSpace {
    tgid: Tgid,
    alive: AtomicBool,
    ptes: Mutex<BTreeMap<EnclVirtAddr, Pte>>,
    notifiers: Mutex<Vec<(u64, Weak<dyn MmuNotifier>)>>,
}

impl AddressSpace {
    pub fn new(tgid: Tgid) -> Arc<Self> {
        Arc::new(Self {
            tgid,
            alive: AtomicBool::new(true),
            ptes: Mutex::new(BTreeMap::new()),
            notifiers: Mutex::new(Vec::new()),
        })
    }

    pub fn tgid(&self) -> Tgid {
        self.tgid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn register_notifier(&self, key: u64, notifier: Weak<dyn MmuNotifier>) -> EpcResult {
        if !self.is_alive() {
            return epc_result_err!(ENOENT, "AddressSpace::register_notifier(): mm is gone");
        }
        let mut notifiers = self.notifiers.lock();
        if notifiers.iter().any(|(k, _)| *k == key) {
            return epc_result_err!(EEXIST);
        }
        notifiers.push((key, notifier));
        Ok(())
    }

    pub fn unregister_notifier(&self, key: u64) {
        self.notifiers.lock().retain(|(k, _)| *k != key);
    }

    /// Map one EPC page at `vaddr`.
    pub fn insert_pfn(&self, vaddr: EnclVirtAddr, paddr: EpcPhysAddr, flags: MemFlags) -> EpcResult {
        if !is_aligned(vaddr) || !is_aligned(paddr) {
            return epc_result_err!(
                EINVAL,
                format!("AddressSpace::insert_pfn(): unaligned {:#x} -> {:#x}", vaddr, paddr)
            );
        }
        if !self.is_alive() {
            return epc_result_err!(EFAULT, "AddressSpace::insert_pfn(): mm is gone");
        }
        match self.ptes.lock().entry(vaddr) {
            Entry::Occupied(e) => epc_result_err!(
                EBUSY,
                format!(
                    "AddressSpace::insert_pfn(): {:#x} already mapped to {:#x}",
                    vaddr,
                    e.get().paddr
                )
            ),
            Entry::Vacant(e) => {
                e.insert(Pte {
                    paddr,
                    flags,
                    young: true,
                });
                Ok(())
            }
        }
    }

    pub fn zap(&self, vaddr: EnclVirtAddr) -> Option<Pte> {
        self.ptes.lock().remove(&vaddr)
    }

    pub fn zap_range(&self, range: Range<EnclVirtAddr>) {
        let mut ptes = self.ptes.lock();
        let keys: Vec<_> = ptes.range(range).map(|(k, _)| *k).collect();
        for key in keys {
            ptes.remove(&key);
        }
    }

    pub fn translate(&self, vaddr: EnclVirtAddr) -> Option<Pte> {
        self.ptes.lock().get(&vaddr).copied()
    }

    /// An access by the CPU. Returns the backing page and sets the accessed
    /// bit, or `None` when the access would fault.
    pub fn touch(&self, vaddr: EnclVirtAddr, write: bool) -> Option<EpcPhysAddr> {
        let vaddr = vaddr & !(PAGE_SIZE - 1);
        let mut ptes = self.ptes.lock();
        let pte = ptes.get_mut(&vaddr)?;
        let need = if write { MemFlags::WRITE } else { MemFlags::READ };
        if !pte.flags.contains(need) {
            return None;
        }
        pte.young = true;
        Some(pte.paddr)
    }

    pub fn test_and_clear_young(&self, vaddr: EnclVirtAddr) -> bool {
        match self.ptes.lock().get_mut(&vaddr) {
            Some(pte) => std::mem::replace(&mut pte.young, false),
            None => false,
        }
    }

    pub fn nr_mapped(&self, range: Range<EnclVirtAddr>) -> usize {
        self.ptes.lock().range(range).count()
    }

    /// The process exits: run every notifier once and drop all mappings.
    pub fn exit(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let notifiers = std::mem::take(&mut *self.notifiers.lock());
        for (_, notifier) in notifiers {
            if let Some(notifier) = notifier.upgrade() {
                notifier.release(self);
            }
        }
        self.ptes.lock().clear();
    }
}

impl Debug for AddressSpace {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("AddressSpace")
            .field("tgid", &self.tgid)
            .field("alive", &self.is_alive())
            .field("nr_ptes", &self.ptes.lock().len())
            .finish()
    }
}
