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

pub use crate::memory::{PAGE_SHIFT, PAGE_SIZE};

/// Minimum number of non version-array pages the pool must keep, enough to
/// reload one page together with its SECS.
pub const EPC_RESERVED_PAGES: usize = 2;

/// Background reclaim starts below this many free pages.
pub const DEFAULT_LOW_PAGES: usize = 32;
/// Background reclaim stops at this many free pages.
pub const DEFAULT_HIGH_PAGES: usize = 64;
/// Pages scanned per eviction cycle.
pub const NR_SWAP_CLUSTER_MAX: usize = 16;

pub const DEFAULT_SYNC_RECLAIM_RETRIES: usize = 64;
pub const DEFAULT_FAULT_RETRIES: usize = 1024;

pub const EINIT_SPIN_COUNT: usize = 20;
pub const EINIT_SLEEP_COUNT: usize = 50;
pub const EINIT_SLEEP_TIME_MS: u64 = 20;

/// Largest ELRANGE accepted on a 64-bit host.
pub const ENCL_SIZE_MAX_64: u64 = 1 << 36;

pub const DEFAULT_EPC_BASE: usize = 0x8000_0000;
pub const DEFAULT_EPC_SIZE: usize = 16 * 1024 * 1024; // 16 MB

/// Size of one version array slot.
pub const VA_SLOT_SIZE: usize = 8;
pub const VA_SLOT_COUNT: usize = PAGE_SIZE / VA_SLOT_SIZE;

/// Size of one PCMD record in the metadata backing file.
pub const PCMD_SIZE: usize = 128;
/// The metadata file is `size >> PCMD_SHIFT` bytes of the content file.
pub const PCMD_SHIFT: usize = 5;

/// Granularity of EEXTEND.
pub const MEASURE_CHUNK_SIZE: usize = 256;
pub const MEASURE_CHUNKS_PER_PAGE: usize = PAGE_SIZE / MEASURE_CHUNK_SIZE;
