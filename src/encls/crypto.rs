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

//! Page encryption for write back, and the version array slots that keep
//! evicted pages fresh.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::{AeadInPlace, Aes256Gcm, Key, KeyInit, Nonce as GcmNonce, Tag};
use rand::RngCore;

use super::sgx::SgxSecInfo;
use crate::consts::{VA_SLOT_COUNT, VA_SLOT_SIZE};
use crate::memory::{AlignedPage, EnclVirtAddr, PAGE_SIZE};

pub const RECLAIM_NONCE_LEN: usize = 8;
pub const RECLAIM_KEY_LEN: usize = 32;
pub const RECLAIM_MAC_LEN: usize = 16;

const GCM_NONCE_LEN: usize = 12;

lazy_static! {
    pub static ref RECLAIM_KEY: [u8; RECLAIM_KEY_LEN] = {
        let mut key = [0_u8; RECLAIM_KEY_LEN];
        get_random(&mut key);
        key
    };
    static ref NONCE_SEED: u64 = {
        let mut seed = [0_u8; RECLAIM_NONCE_LEN];
        get_random(&mut seed);
        u64::from_le_bytes(seed)
    };
}

static NONCE_VAL: AtomicU64 = AtomicU64::new(0);

pub fn get_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

pub type NonceValue = u64;
pub type MacValue = [u8; RECLAIM_MAC_LEN];

/// A write back nonce. Never zero, zero marks an empty version slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(NonceValue);

impl Nonce {
    pub fn new() -> Self {
        let _ = NONCE_VAL.compare_exchange(0, *NONCE_SEED, Ordering::AcqRel, Ordering::Acquire);
        loop {
            let nonce = NONCE_VAL.fetch_add(1, Ordering::AcqRel);
            if nonce != 0 {
                return Self(nonce);
            }
        }
    }

    pub fn get_val(&self) -> NonceValue {
        self.0
    }
}

/// Everything the MAC of an evicted page is bound to, besides its contents.
#[derive(Debug)]
pub struct WriteBackInfo {
    /// Nonce used to guarantee the freshness.
    nonce: NonceValue,
    /// Enclave identifier.
    enclave_id: u64,
    /// SecInfo of the write back page.
    sec_info: SgxSecInfo,
    /// Linear address of the write back page.
    vaddr: EnclVirtAddr,
}

impl WriteBackInfo {
    pub fn new(nonce: NonceValue, enclave_id: u64, sec_info: SgxSecInfo, vaddr: EnclVirtAddr) -> Self {
        Self {
            nonce,
            enclave_id,
            sec_info,
            vaddr,
        }
    }

    fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        let secinfo: u64 = self.sec_info.into();
        bytes[0..8].copy_from_slice(&self.nonce.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.enclave_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&secinfo.to_le_bytes());
        bytes[24..32].copy_from_slice(&(self.vaddr as u64).to_le_bytes());
        bytes
    }

    fn gcm_nonce(&self) -> [u8; GCM_NONCE_LEN] {
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce[..RECLAIM_NONCE_LEN].copy_from_slice(&self.nonce.to_le_bytes());
        nonce
    }
}

/// Seal and unseal one page in place.
pub trait CryptoAlg: Send + Sync {
    fn encrypt_page(&self, info: &WriteBackInfo, page: &mut [u8; PAGE_SIZE]) -> Option<MacValue>;

    /// Returns `false` if the MAC does not match, leaving `page` untouched.
    fn decrypt_page(&self, info: &WriteBackInfo, page: &mut [u8; PAGE_SIZE], mac: &MacValue) -> bool;
}

pub struct AesGcmAlg {
    cipher: Aes256Gcm,
}

impl AesGcmAlg {
    pub fn new(key: &[u8; RECLAIM_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }
}

impl Default for AesGcmAlg {
    fn default() -> Self {
        Self::new(&RECLAIM_KEY)
    }
}

impl CryptoAlg for AesGcmAlg {
    fn encrypt_page(&self, info: &WriteBackInfo, page: &mut [u8; PAGE_SIZE]) -> Option<MacValue> {
        let nonce = info.gcm_nonce();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GcmNonce::from_slice(&nonce), &info.to_bytes(), page)
            .ok()?;
        let mut mac = MacValue::default();
        mac.copy_from_slice(tag.as_slice());
        Some(mac)
    }

    fn decrypt_page(&self, info: &WriteBackInfo, page: &mut [u8; PAGE_SIZE], mac: &MacValue) -> bool {
        let nonce = info.gcm_nonce();
        let mut buf = AlignedPage::from_slice(page);
        let ok = self
            .cipher
            .decrypt_in_place_detached(
                GcmNonce::from_slice(&nonce),
                &info.to_bytes(),
                &mut buf[..],
                Tag::from_slice(mac),
            )
            .is_ok();
        if ok {
            page.copy_from_slice(&buf[..]);
        }
        ok
    }
}

/// Index of the 8-byte version slot at `offset` of a VA page.
pub fn va_slot_index(offset: usize) -> Option<usize> {
    if offset % VA_SLOT_SIZE != 0 || offset / VA_SLOT_SIZE >= VA_SLOT_COUNT {
        return None;
    }
    Some(offset / VA_SLOT_SIZE)
}

/// A view of one version slot inside the page data of a VA page.
pub struct VaSlot<'a>(&'a mut [u8]);

impl<'a> VaSlot<'a> {
    pub fn new(page: &'a mut [u8; PAGE_SIZE], offset: usize) -> Option<Self> {
        let idx = va_slot_index(offset)?;
        Some(Self(&mut page[idx * VA_SLOT_SIZE..(idx + 1) * VA_SLOT_SIZE]))
    }

    pub fn is_empty(&self) -> bool {
        self.get() == 0
    }

    pub fn set(&mut self, val: NonceValue) {
        self.0.copy_from_slice(&val.to_le_bytes());
    }

    pub fn get(&self) -> NonceValue {
        let mut word = [0u8; VA_SLOT_SIZE];
        word.copy_from_slice(self.0);
        u64::from_le_bytes(word)
    }

    pub fn clear(&mut self) {
        self.set(0);
    }
}
