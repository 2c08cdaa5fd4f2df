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

pub mod addr;
mod mm;

use std::ops::{Deref, DerefMut};

use bitflags::bitflags;

pub use addr::{EnclVirtAddr, EpcPhysAddr};
pub use mm::{AddressSpace, MmuNotifier, Pte, Tgid};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

bitflags! {
    /// Access rights of a user mapping.
    pub struct MemFlags: u64 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXECUTE       = 1 << 2;
    }
}

/// A heap allocated, page aligned page buffer.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct AlignedPage([u8; PAGE_SIZE]);

impl AlignedPage {
    pub const fn new() -> Self {
        Self([0; PAGE_SIZE])
    }

    pub fn new_boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    pub fn from_slice(data: &[u8]) -> Box<Self> {
        let mut page = Self::new_boxed();
        let len = data.len().min(PAGE_SIZE);
        page.0[..len].copy_from_slice(&data[..len]);
        page
    }
}

impl Default for AlignedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AlignedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedPage({:02x?}..)", &self.0[..8])
    }
}

impl Deref for AlignedPage {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AlignedPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
