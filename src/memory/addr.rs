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

//! Definition of enclave linear and EPC physical addresses.

use super::{PAGE_SHIFT, PAGE_SIZE};

/// Linear address inside an ELRANGE.
pub type EnclVirtAddr = usize;
/// Physical address of an EPC page.
pub type EpcPhysAddr = usize;

pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

pub const fn page_count(size: usize) -> usize {
    align_up(size) / PAGE_SIZE
}

pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

pub const fn pfn(paddr: EpcPhysAddr) -> usize {
    paddr >> PAGE_SHIFT
}

/// Index of the page holding `addr` inside a range starting at `base`.
pub const fn page_index(base: usize, addr: usize) -> usize {
    (addr - base) >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_down(0x1fff), 0x1000);
        assert_eq!(align_up(0x1001), 0x2000);
        assert!(is_aligned(0x3000));
        assert_eq!(page_count(0x1001), 2);
        assert_eq!(page_offset(0x1234), 0x234);
        assert_eq!(page_index(0x10000, 0x13000), 3);
        assert_eq!(pfn(0x8000_1000), 0x80001);
    }
}
