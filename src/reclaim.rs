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

//! The eviction engine and its background thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::config::EpcConfig;
use crate::enclave::EnclaveManager;
use crate::epc::{EpcAllocator, Swapper};
use crate::error::EpcResult;
use crate::stats::{Instant, StatsValue};

#[derive(Debug, Default)]
struct ReclaimState {
    stop: bool,
    kicked: bool,
}

pub struct Reclaimer {
    registry: Arc<EnclaveManager>,
    epc: Arc<EpcAllocator>,
    swap_cluster: usize,
    high_pages: usize,
    state: Mutex<ReclaimState>,
    cond: Condvar,
    thread: spin::Mutex<Option<JoinHandle<()>>>,
    nr_cycles: AtomicUsize,
    nr_evicted: AtomicUsize,
    cycle_time: StatsValue,
}

impl Reclaimer {
    pub fn new(config: &EpcConfig, registry: Arc<EnclaveManager>, epc: Arc<EpcAllocator>) -> Self {
        Self {
            registry,
            epc,
            swap_cluster: config.swap_cluster,
            high_pages: config.high_pages,
            state: Mutex::new(ReclaimState::default()),
            cond: Condvar::new(),
            thread: spin::Mutex::new(None),
            nr_cycles: AtomicUsize::new(0),
            nr_evicted: AtomicUsize::new(0),
            cycle_time: StatsValue::new(),
        }
    }

    pub fn nr_cycles(&self) -> usize {
        self.nr_cycles.load(Ordering::Acquire)
    }

    /// EPC pages freed by write back so far.
    pub fn nr_evicted(&self) -> usize {
        self.nr_evicted.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Spawn `ksgxswapd`.
    pub fn start(self: &Arc<Self>) -> EpcResult {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        self.lock_state().stop = false;
        let reclaimer = self.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("ksgxswapd".into())
                .spawn(move || reclaimer.run())?,
        );
        Ok(())
    }

    /// Stop the thread and wait for it. The current cycle runs to the end.
    pub fn stop(&self) {
        self.lock_state().stop = true;
        self.cond.notify_all();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("ksgxswapd: thread panicked");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReclaimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopping(&self) -> bool {
        self.lock_state().stop
    }

    fn run(&self) {
        info!("ksgxswapd: started");
        loop {
            {
                let mut state = self.lock_state();
                while !state.stop && !state.kicked {
                    state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                if state.stop {
                    break;
                }
                state.kicked = false;
            }

            while self.epc.nr_free() < self.high_pages && !self.is_stopping() {
                if self.swap_pages(self.swap_cluster) == 0 {
                    break;
                }
            }
        }
        info!(
            "ksgxswapd: stopped after {} cycles, {} pages evicted",
            self.nr_cycles(),
            self.nr_evicted()
        );
        #[cfg(feature = "stats")]
        debug!("ksgxswapd: cycle time {}", self.cycle_time.as_string());
    }
}

impl Swapper for Reclaimer {
    /// One cycle: the next enclave in round robin order gives up to
    /// `nr_to_scan` pages. An enclave with nothing to give is passed over.
    fn swap_pages(&self, nr_to_scan: usize) -> usize {
        self.nr_cycles.fetch_add(1, Ordering::AcqRel);
        let start = Instant::now();
        let mut nr_freed = 0;
        for _ in 0..self.registry.nr_enclaves() {
            let handle = match self.registry.isolate() {
                Some(handle) => handle,
                None => break,
            };
            let victims = handle.isolate_pages(nr_to_scan);
            if victims.is_empty() {
                continue;
            }
            nr_freed = handle.write_pages(&victims);
            trace!(
                "ksgxswapd: enclave {:#x} gave {} of {} victims",
                handle.id(),
                nr_freed,
                victims.len()
            );
            break;
        }
        self.nr_evicted.fetch_add(nr_freed, Ordering::AcqRel);
        self.cycle_time.atomic_add(start.elapsed());
        nr_freed
    }

    fn wake(&self) {
        self.lock_state().kicked = true;
        self.cond.notify_all();
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}
