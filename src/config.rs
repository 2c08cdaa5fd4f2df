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

use std::time::Duration;

use log::LevelFilter;

use crate::consts::*;
use crate::error::EpcResult;
use crate::memory::addr::{is_aligned, EpcPhysAddr};

/// One physical EPC bank reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpcBankConfig {
    pub base: EpcPhysAddr,
    pub size: usize,
}

impl EpcBankConfig {
    pub const fn new(base: EpcPhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }
}

/// Runtime configuration of the secure page subsystem.
#[derive(Debug, Clone)]
pub struct EpcConfig {
    pub banks: Vec<EpcBankConfig>,
    pub low_pages: usize,
    pub high_pages: usize,
    /// Pages scanned per eviction cycle.
    pub swap_cluster: usize,
    /// Run the background reclaimer thread.
    pub enable_reclaimer: bool,
    /// Synchronous eviction rounds a blocking allocation may run before
    /// reporting `EBUSY`.
    pub sync_reclaim_retries: usize,
    /// Busy retries of a user-triggered fault.
    pub fault_retries: usize,
    pub einit_spin_count: usize,
    pub einit_sleep_count: usize,
    pub einit_sleep_time: Duration,
    pub encl_size_max: u64,
    pub log_level: Option<LevelFilter>,
}

impl Default for EpcConfig {
    fn default() -> Self {
        Self {
            banks: vec![EpcBankConfig::new(DEFAULT_EPC_BASE, DEFAULT_EPC_SIZE)],
            low_pages: DEFAULT_LOW_PAGES,
            high_pages: DEFAULT_HIGH_PAGES,
            swap_cluster: NR_SWAP_CLUSTER_MAX,
            enable_reclaimer: true,
            sync_reclaim_retries: DEFAULT_SYNC_RECLAIM_RETRIES,
            fault_retries: DEFAULT_FAULT_RETRIES,
            einit_spin_count: EINIT_SPIN_COUNT,
            einit_sleep_count: EINIT_SLEEP_COUNT,
            einit_sleep_time: Duration::from_millis(EINIT_SLEEP_TIME_MS),
            encl_size_max: ENCL_SIZE_MAX_64,
            log_level: None,
        }
    }
}

impl EpcConfig {
    /// A single bank of `nr_pages` pages at the default base.
    pub fn with_pages(nr_pages: usize) -> Self {
        Self {
            banks: vec![EpcBankConfig::new(DEFAULT_EPC_BASE, nr_pages * PAGE_SIZE)],
            ..Default::default()
        }
    }

    pub fn total_pages(&self) -> usize {
        self.banks.iter().map(|b| b.page_count()).sum()
    }

    pub fn validate(&self) -> EpcResult {
        if self.banks.is_empty() {
            return epc_result_err!(EINVAL, "EpcConfig::validate(): no EPC banks");
        }
        for bank in &self.banks {
            if bank.size == 0 || !is_aligned(bank.base) || !is_aligned(bank.size) {
                return epc_result_err!(
                    EINVAL,
                    format!("EpcConfig::validate(): invalid bank {:#x?}", bank)
                );
            }
        }
        let mut sorted = self.banks.clone();
        sorted.sort_by_key(|b| b.base);
        for pair in sorted.windows(2) {
            if pair[0].base + pair[0].size > pair[1].base {
                return epc_result_err!(
                    EINVAL,
                    format!("EpcConfig::validate(): overlapping banks {:#x?}", pair)
                );
            }
        }
        if self.low_pages > self.high_pages {
            return epc_result_err!(
                EINVAL,
                format!(
                    "EpcConfig::validate(): low watermark {} above high watermark {}",
                    self.low_pages, self.high_pages
                )
            );
        }
        if self.swap_cluster == 0 {
            return epc_result_err!(EINVAL, "EpcConfig::validate(): empty swap cluster");
        }
        if !self.encl_size_max.is_power_of_two() {
            return epc_result_err!(EINVAL, "EpcConfig::validate(): bad encl_size_max");
        }
        Ok(())
    }
}
