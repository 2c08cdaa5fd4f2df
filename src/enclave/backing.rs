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

//! Per-enclave backing store for evicted pages.
//!
//! Two anonymous files: one holds the page images, one the PCMD records, at
//! `PCMD_SIZE` bytes per page. The SECS is the last page, at `base + size`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use static_assertions::const_assert_eq;

use crate::consts::{PCMD_SHIFT, PCMD_SIZE};
use crate::encls::sgx::SgxPcmd;
use crate::error::EpcResult;
use crate::memory::PAGE_SIZE;

const_assert_eq!(PAGE_SIZE >> PCMD_SHIFT, PCMD_SIZE);

#[derive(Debug)]
pub(crate) struct BackingStore {
    contents: File,
    pcmd: File,
    nr_pages: usize,
}

impl BackingStore {
    pub(crate) fn new(encl_size: usize) -> EpcResult<Self> {
        let size = encl_size + PAGE_SIZE;
        let contents = tempfile::tempfile()?;
        contents.set_len(size as u64)?;
        let pcmd = tempfile::tempfile()?;
        pcmd.set_len((size >> PCMD_SHIFT) as u64)?;
        Ok(Self {
            contents,
            pcmd,
            nr_pages: size / PAGE_SIZE,
        })
    }

    pub(crate) fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    fn check_index(&self, index: usize) -> EpcResult {
        if index >= self.nr_pages {
            return epc_result_err!(
                EINVAL,
                format!(
                    "BackingStore: page index {} out of {} pages",
                    index, self.nr_pages
                )
            );
        }
        Ok(())
    }

    pub(crate) fn write_contents(&self, index: usize, data: &[u8; PAGE_SIZE]) -> EpcResult {
        self.check_index(index)?;
        let mut file = &self.contents;
        file.seek(SeekFrom::Start((index * PAGE_SIZE) as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    pub(crate) fn read_contents(&self, index: usize, data: &mut [u8; PAGE_SIZE]) -> EpcResult {
        self.check_index(index)?;
        let mut file = &self.contents;
        file.seek(SeekFrom::Start((index * PAGE_SIZE) as u64))?;
        file.read_exact(data)?;
        Ok(())
    }

    /// Store the sealed image of an evicted page.
    pub(crate) fn write_page(
        &self,
        index: usize,
        data: &[u8; PAGE_SIZE],
        pcmd: &SgxPcmd,
    ) -> EpcResult {
        self.write_contents(index, data)?;
        let mut file = &self.pcmd;
        file.seek(SeekFrom::Start((index * PCMD_SIZE) as u64))?;
        file.write_all(&pcmd.to_bytes())?;
        Ok(())
    }

    pub(crate) fn read_page(&self, index: usize, data: &mut [u8; PAGE_SIZE]) -> EpcResult<SgxPcmd> {
        self.read_contents(index, data)?;
        let mut bytes = [0u8; PCMD_SIZE];
        let mut file = &self.pcmd;
        file.seek(SeekFrom::Start((index * PCMD_SIZE) as u64))?;
        file.read_exact(&mut bytes)?;
        SgxPcmd::from_bytes(&bytes)
    }
}
