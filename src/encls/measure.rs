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

use std::mem::size_of;

use sha2::{Digest, Sha256};

use super::sgx::{Sha256Value, SgxSecInfo};
use crate::consts::{MEASURE_CHUNKS_PER_PAGE, MEASURE_CHUNK_SIZE};
use crate::memory::PAGE_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd)]
enum State {
    None,
    Started,
    Update,
    Finished,
}

/// MRENCLAVE: the running SHA-256 over ECREATE, EADD and EEXTEND records.
#[derive(Clone, Debug)]
pub struct Measure {
    state: State,
    hasher: Sha256,
}

impl Measure {
    const DATA_BLOCK_SIZE: usize = 64;
    const SIZE_NAMED_VALUE: usize = 8;

    pub fn new() -> Self {
        Self {
            state: State::None,
            hasher: Sha256::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn start(&mut self, enclave_size: u64, ssa_frame_size: u32) {
        let ecreate_val = "ECREATE";
        let mut data_block = [0; Self::DATA_BLOCK_SIZE];
        let mut offset = 0;

        data_block[..ecreate_val.len()].clone_from_slice(ecreate_val.as_bytes());
        offset += Self::SIZE_NAMED_VALUE;
        data_block[offset..(offset + size_of::<u32>())]
            .clone_from_slice(&ssa_frame_size.to_le_bytes());
        offset += size_of::<u32>();
        data_block[offset..(offset + size_of::<u64>())]
            .clone_from_slice(&enclave_size.to_le_bytes());

        self.hasher.update(data_block);
        self.state = State::Started;
    }

    /// Record an EADD of the page at `page_offset` inside ELRANGE.
    pub fn add(&mut self, page_offset: u64, page_info: SgxSecInfo) {
        let eadd_val = "EADD";
        let mut data_block = [0; Self::DATA_BLOCK_SIZE];
        let mut offset = 0;

        data_block[..eadd_val.len()].clone_from_slice(eadd_val.as_bytes());
        offset += Self::SIZE_NAMED_VALUE;
        data_block[offset..(offset + size_of::<u64>())]
            .clone_from_slice(&page_offset.to_le_bytes());
        offset += size_of::<u64>();
        data_block[offset..(offset + size_of::<u64>())]
            .clone_from_slice(&Into::<u64>::into(page_info).to_le_bytes());

        self.hasher.update(data_block);
        self.state = State::Update;
    }

    /// Record an EEXTEND of the 256-byte chunk at `chunk_offset` inside ELRANGE.
    pub fn extend(&mut self, chunk_offset: u64, chunk: &[u8]) {
        let eextend_val = "EEXTEND";
        let mut data_block = [0; Self::DATA_BLOCK_SIZE];

        data_block[..eextend_val.len()].clone_from_slice(eextend_val.as_bytes());
        data_block[Self::SIZE_NAMED_VALUE..(Self::SIZE_NAMED_VALUE + size_of::<u64>())]
            .clone_from_slice(&chunk_offset.to_le_bytes());
        self.hasher.update(data_block);

        for block in chunk[..MEASURE_CHUNK_SIZE].chunks(Self::DATA_BLOCK_SIZE) {
            self.hasher.update(block);
        }
        self.state = State::Update;
    }

    /// EADD followed by EEXTEND of every chunk selected by `mrmask`, bit `j`
    /// selecting the chunk at `j * 256`.
    pub fn add_page(
        &mut self,
        page_offset: u64,
        page_info: SgxSecInfo,
        page_data: &[u8; PAGE_SIZE],
        mrmask: u16,
    ) {
        self.add(page_offset, page_info);
        for j in 0..MEASURE_CHUNKS_PER_PAGE {
            if mrmask & (1 << j) != 0 {
                let start = j * MEASURE_CHUNK_SIZE;
                self.extend(
                    page_offset + start as u64,
                    &page_data[start..start + MEASURE_CHUNK_SIZE],
                );
            }
        }
    }

    pub fn finish(&mut self) -> Sha256Value {
        self.state = State::Finished;
        self.hasher.finalize_reset().into()
    }
}

impl Default for Measure {
    fn default() -> Self {
        Self::new()
    }
}
