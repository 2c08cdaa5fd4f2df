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

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;

use super::{Enclave, EnclaveHandle};
use crate::error::EpcResult;
use crate::intervaltree::IntervalTree;
use crate::memory::{EnclVirtAddr, Tgid};

/// The enclaves of one process.
struct TgidCtx {
    tgid: Tgid,
    enclaves: VecDeque<Arc<Enclave>>,
    ranges: IntervalTree<u64>,
    /// Enclaves rotated in the current pass over this process.
    visited: usize,
}

impl TgidCtx {
    fn new(tgid: Tgid) -> Self {
        Self {
            tgid,
            enclaves: VecDeque::new(),
            ranges: IntervalTree::new(),
            visited: 0,
        }
    }
}

/// Every live enclave, grouped by owning process. The order of both deques
/// is the eviction round robin.
#[derive(Default)]
pub struct EnclaveManager {
    ctxs: Mutex<VecDeque<TgidCtx>>,
}

impl EnclaveManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, enclave: &Arc<Enclave>) -> EpcResult {
        let mut ctxs = self.ctxs.lock();
        let pos = match ctxs.iter().position(|ctx| ctx.tgid == enclave.tgid()) {
            Some(pos) => pos,
            None => {
                ctxs.push_back(TgidCtx::new(enclave.tgid()));
                ctxs.len() - 1
            }
        };
        let ctx = &mut ctxs[pos];
        let ret = ctx.ranges.insert(enclave.elrange().clone(), enclave.id());
        match &ret {
            Ok(()) => ctx.enclaves.push_back(enclave.clone()),
            Err(_) if ctx.enclaves.is_empty() => {
                ctxs.remove(pos);
            }
            Err(_) => {}
        }
        ret
    }

    pub fn remove(&self, enclave: &Enclave) {
        let mut ctxs = self.ctxs.lock();
        let pos = match ctxs.iter().position(|ctx| ctx.tgid == enclave.tgid()) {
            Some(pos) => pos,
            None => return,
        };
        let ctx = &mut ctxs[pos];
        let before = ctx.enclaves.len();
        ctx.enclaves.retain(|e| e.id() != enclave.id());
        if ctx.enclaves.len() != before {
            let _ = ctx.ranges.remove(enclave.elrange());
            ctx.visited = ctx.visited.min(ctx.enclaves.len());
        }
        if ctx.enclaves.is_empty() {
            ctxs.remove(pos);
        }
    }

    /// The enclave of process `tgid` whose ELRANGE contains `addr`.
    pub fn find(&self, tgid: Tgid, addr: EnclVirtAddr) -> EpcResult<EnclaveHandle> {
        let ctxs = self.ctxs.lock();
        let found = ctxs
            .iter()
            .find(|ctx| ctx.tgid == tgid)
            .and_then(|ctx| {
                let (_, id) = ctx.ranges.find(addr)?;
                ctx.enclaves.iter().find(|e| e.id() == *id)
            })
            .and_then(|e| e.try_get());
        match found {
            Some(handle) => Ok(handle),
            None => epc_result_err!(
                EFAULT,
                format!("no enclave of tgid {} at {:#x}", tgid, addr)
            ),
        }
    }

    /// Pick the next enclave to evict from. The head process keeps the
    /// head until each of its enclaves was rotated once, so every enclave
    /// is picked once per pass regardless of how they are grouped. Dead
    /// enclaves and enclaves without resident pages are passed over.
    pub fn isolate(&self) -> Option<EnclaveHandle> {
        let mut ctxs = self.ctxs.lock();
        let total: usize = ctxs.iter().map(|ctx| ctx.enclaves.len()).sum();
        for _ in 0..total {
            let ctx = ctxs.front_mut()?;
            let mut victim = None;
            if let Some(encl) = ctx.enclaves.pop_front() {
                if !encl.is_dead() && encl.nr_resident() > 0 {
                    victim = encl.try_get();
                }
                ctx.enclaves.push_back(encl);
            }
            ctx.visited += 1;
            if ctx.visited >= ctx.enclaves.len() {
                ctx.visited = 0;
                ctxs.rotate_left(1);
            }
            if victim.is_some() {
                return victim;
            }
        }
        None
    }

    pub fn all(&self) -> Vec<EnclaveHandle> {
        self.ctxs
            .lock()
            .iter()
            .flat_map(|ctx| ctx.enclaves.iter())
            .filter_map(|e| e.try_get())
            .collect()
    }

    pub fn nr_enclaves(&self) -> usize {
        self.ctxs.lock().iter().map(|ctx| ctx.enclaves.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let manager = EnclaveManager::new();
        assert!(manager.isolate().is_none());
        assert_eq!(manager.find(1, 0x1000).unwrap_err().num(), crate::error::EpcErrorNum::EFAULT);
        assert!(manager.all().is_empty());
        assert_eq!(manager.nr_enclaves(), 0);
    }
}
