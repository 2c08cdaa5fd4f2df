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

//! Process-wide state: the allocator, the registry and the reclaimer,
//! started and stopped explicitly.

use std::fmt::{Debug, Formatter, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::EpcConfig;
use crate::enclave::{Enclave, EnclaveContext, EnclaveHandle, EnclaveManager};
use crate::encls::sgx::SgxSecs;
use crate::encls::Encls;
use crate::epc::{EpcAllocator, Swapper};
use crate::error::EpcResult;
use crate::memory::{AddressSpace, EnclVirtAddr, EpcPhysAddr, Tgid};
use crate::reclaim::Reclaimer;

pub struct EpcSystem {
    config: EpcConfig,
    encls: Arc<dyn Encls>,
    epc: Arc<EpcAllocator>,
    registry: Arc<EnclaveManager>,
    reclaimer: Arc<Reclaimer>,
    next_id: AtomicU64,
}

impl EpcSystem {
    pub fn start(config: EpcConfig, encls: Arc<dyn Encls>) -> EpcResult<Arc<Self>> {
        config.validate()?;
        if let Some(level) = config.log_level {
            crate::logging::init(level);
        }

        let epc = EpcAllocator::new(&config, encls.clone())?;
        let registry = Arc::new(EnclaveManager::new());
        let reclaimer = Arc::new(Reclaimer::new(&config, registry.clone(), epc.clone()));
        let swapper: Weak<dyn Swapper> = Arc::downgrade(&(reclaimer.clone() as Arc<dyn Swapper>));
        epc.set_swapper(swapper);
        if config.enable_reclaimer {
            reclaimer.start()?;
        }
        info!(
            "EPC initialized: {} pages in {} banks, reclaimer {}",
            epc.nr_total(),
            config.banks.len(),
            if config.enable_reclaimer { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            config,
            encls,
            epc,
            registry,
            reclaimer,
            next_id: AtomicU64::new(1),
        }))
    }

    /// Stop the background reclaimer. Synchronous reclaim keeps working.
    pub fn stop(&self) {
        self.reclaimer.stop();
    }

    pub fn config(&self) -> &EpcConfig {
        &self.config
    }

    pub fn encls(&self) -> &Arc<dyn Encls> {
        &self.encls
    }

    pub fn allocator(&self) -> &Arc<EpcAllocator> {
        &self.epc
    }

    pub fn registry(&self) -> &Arc<EnclaveManager> {
        &self.registry
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    fn context(&self) -> EnclaveContext {
        EnclaveContext {
            epc: self.epc.clone(),
            encls: self.encls.clone(),
            registry: Arc::downgrade(&self.registry),
            limits: (&self.config).into(),
        }
    }

    /// ECREATE an enclave in the address space `mm`.
    pub fn create_enclave(&self, mm: &Arc<AddressSpace>, secs: &SgxSecs) -> EpcResult<EnclaveHandle> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        Enclave::create(id, mm, secs, self.context())
    }

    pub fn find_enclave(&self, tgid: Tgid, addr: EnclVirtAddr) -> EpcResult<EnclaveHandle> {
        self.registry.find(tgid, addr)
    }

    /// A page fault of process `tgid` at `addr`.
    pub fn handle_fault(&self, tgid: Tgid, addr: EnclVirtAddr, write: bool) -> EpcResult<EpcPhysAddr> {
        self.find_enclave(tgid, addr)?.fault(addr, write)
    }

    /// The platform is about to lose the EPC: every enclave is revoked until
    /// `resume_all()`.
    pub fn suspend_all(&self) {
        let enclaves = self.registry.all();
        for encl in enclaves.iter() {
            encl.suspend();
        }
        info!("suspended {} enclaves", enclaves.len());
    }

    pub fn resume_all(&self) {
        for encl in self.registry.all() {
            encl.resume();
        }
    }

    /// Wake every context blocked on any enclave.
    pub fn notify_all(&self) {
        for encl in self.registry.all() {
            encl.notify();
        }
    }
}

impl Drop for EpcSystem {
    fn drop(&mut self) {
        self.stop();
        self.epc.clear_swapper();
    }
}

impl Debug for EpcSystem {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("EpcSystem")
            .field("epc", &self.epc)
            .field("nr_enclaves", &self.registry.nr_enclaves())
            .field("reclaimer_running", &self.reclaimer.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encls::soft::SoftEncls;
    use crate::error::EpcErrorNum;

    #[test]
    fn test_sync_reclaim_uses_reclaimer() {
        let mut config = EpcConfig::with_pages(16);
        config.enable_reclaimer = false;
        let system = EpcSystem::start(config, Arc::new(SoftEncls::new())).unwrap();
        assert!(!system.reclaimer().is_running());
        assert_eq!(system.allocator().swap_pages(), 0);
        assert_eq!(system.reclaimer().nr_cycles(), 1);
    }

    #[test]
    fn test_start_stop() {
        let system = EpcSystem::start(EpcConfig::with_pages(16), Arc::new(SoftEncls::new())).unwrap();
        assert!(system.reclaimer().is_running());
        system.stop();
        assert!(!system.reclaimer().is_running());

        let mut config = EpcConfig::with_pages(16);
        config.swap_cluster = 0;
        let err = EpcSystem::start(config, Arc::new(SoftEncls::new())).unwrap_err();
        assert_eq!(err.num(), EpcErrorNum::EINVAL);
    }
}
