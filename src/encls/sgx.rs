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

//! Original SGX structures.

use std::convert::TryFrom;
use std::ops::Range;

use bitflags::bitflags;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;

use super::crypto::MacValue;
use crate::consts::{PAGE_SIZE, PCMD_SIZE};
use crate::error::{EpcError, EpcResult};
use crate::memory::addr::is_aligned;
use crate::memory::{EnclVirtAddr, MemFlags};

pub type Sha256Value = [u8; 32];

/// Enclave Linear Address Range (ELRANGE).
pub type ElRange = Range<EnclVirtAddr>;

bitflags! {
    /// The ATTRIBUTES data structure is comprised of bit-granular fields that are used in the SECS.
    pub struct SgxAttributeFlags: u64 {
        /// This bit indicates if the enclave has been initialized by EINIT.
        const INIT              = 1 << 0;
        /// If 1, the enclave permit debugger to read and write enclave data using EDBGRD and EDBGWR.
        const DEBUG             = 1 << 1;
        /// Enclave runs in 64-bit mode.
        const MODE64BIT         = 1 << 2;
        /// Provisioning Key is available from EGETKEY.
        const PROVISIONKEY      = 1 << 4;
        /// EINIT token key is available from EGETKEY.
        const EINITTOKEN_KEY    = 1 << 5;
        /// Enable CET attributes.
        const CET               = 1 << 6;
        /// Key Separation and Sharing Enabled.
        const KSS               = 1 << 7;
    }
}

/// XFRM features an enclave may request: x87, SSE, AVX, MPX, AVX-512, PKRU.
pub const SGX_XFRM_SUPPORTED: u64 = 0xff | (1 << 9);
const SGX_XFRM_LEGACY: u64 = 0x3;

/// ATTRIBUTES data structure in the SECS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgxAttributes {
    pub flags: SgxAttributeFlags,
    /// XSAVE Feature Request Mask.
    pub xfrm: u64,
}

impl Default for SgxAttributes {
    fn default() -> Self {
        Self {
            flags: SgxAttributeFlags::MODE64BIT,
            xfrm: SGX_XFRM_LEGACY,
        }
    }
}

bitflags! {
    /// Flags describing the state of the enclave page.
    pub struct SgxEnclPageFlags: u8 {
        /// The page can be read from inside the enclave.
        const R         = 1 << 0;
        /// The page can be written from inside the enclave.
        const W         = 1 << 1;
        /// The page can be executed from inside the enclave.
        const X         = 1 << 2;
        /// The page is in the PENDING state.
        const PENDING   = 1 << 3;
        /// The page is in the MODIFIED state.
        const MODIFIED  = 1 << 4;
        /// A permission restriction operation on the page is in progress.
        const PR        = 1 << 5;
        /// The page is in the BLOCKED state.
        const BLOCKED   = 1 << 6;
        /// For EPCM entries, indicates whether the EPCM entry is valid.
        const VALID     = 1 << 7;
    }
}

impl SgxEnclPageFlags {
    pub const PERM_MASK: Self = Self {
        bits: Self::R.bits() | Self::W.bits() | Self::X.bits(),
    };
}

impl From<SgxEnclPageFlags> for MemFlags {
    fn from(flags: SgxEnclPageFlags) -> Self {
        let mut mem_flags = MemFlags::empty();
        if flags.contains(SgxEnclPageFlags::R) {
            mem_flags |= MemFlags::READ;
        }
        if flags.contains(SgxEnclPageFlags::W) {
            mem_flags |= MemFlags::WRITE;
        }
        if flags.contains(SgxEnclPageFlags::X) {
            mem_flags |= MemFlags::EXECUTE;
        }
        mem_flags
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum SgxEnclPageType {
    /// Page is an SECS.
    SECS = 0,
    /// Page is a TCS.
    TCS = 1,
    /// Page is a regular page.
    REG = 2,
    /// Page is a Version Array.
    VA = 3,
    /// Page is in trimmed state.
    TRIM = 4,
}

impl TryFrom<u8> for SgxEnclPageType {
    type Error = EpcError;

    fn try_from(page_type: u8) -> EpcResult<SgxEnclPageType> {
        match page_type {
            0 => Ok(SgxEnclPageType::SECS),
            1 => Ok(SgxEnclPageType::TCS),
            2 => Ok(SgxEnclPageType::REG),
            3 => Ok(SgxEnclPageType::VA),
            4 => Ok(SgxEnclPageType::TRIM),
            _ => epc_result_err!(EINVAL, format!("Invalid page_type={:#x}", page_type)),
        }
    }
}

/// Security information of an enclave page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgxSecInfo {
    pub flags: SgxEnclPageFlags,
    pub page_type: SgxEnclPageType,
}

impl SgxSecInfo {
    const RESERVED_MASK: u64 = !0xff_ffu64;

    pub const fn new(flags: SgxEnclPageFlags, page_type: SgxEnclPageType) -> Self {
        Self { flags, page_type }
    }

    pub fn reg(flags: SgxEnclPageFlags) -> Self {
        Self::new(flags, SgxEnclPageType::REG)
    }

    pub fn tcs() -> Self {
        Self::new(SgxEnclPageFlags::empty(), SgxEnclPageType::TCS)
    }

    pub fn perms(&self) -> SgxEnclPageFlags {
        self.flags & SgxEnclPageFlags::PERM_MASK
    }

    /// Checks a SECINFO supplied for EADD.
    pub fn validate(&self) -> EpcResult {
        let perm = self.perms();
        if perm.contains(SgxEnclPageFlags::W) && !perm.contains(SgxEnclPageFlags::R) {
            return epc_result_err!(EINVAL, "SgxSecInfo::validate(): W without R");
        }
        if self.flags != perm {
            return epc_result_err!(
                EINVAL,
                format!("SgxSecInfo::validate(): state bits {:?}", self.flags - perm)
            );
        }
        match self.page_type {
            SgxEnclPageType::TCS | SgxEnclPageType::REG => Ok(()),
            t => epc_result_err!(
                EINVAL,
                format!("SgxSecInfo::validate(): page type {:?} cannot be added", t)
            ),
        }
    }
}

impl From<SgxSecInfo> for u64 {
    fn from(info: SgxSecInfo) -> u64 {
        ((info.page_type as u64) << 8) | info.flags.bits() as u64
    }
}

impl TryFrom<u64> for SgxSecInfo {
    type Error = EpcError;

    fn try_from(raw: u64) -> EpcResult<Self> {
        if raw & Self::RESERVED_MASK != 0 {
            return epc_result_err!(EINVAL, format!("SECINFO reserved bits set: {:#x}", raw));
        }
        let flags = SgxEnclPageFlags::from_bits(raw as u8)
            .ok_or_else(|| epc_err!(EINVAL, format!("SECINFO flags {:#x}", raw as u8)))?;
        let page_type = SgxEnclPageType::try_from((raw >> 8) as u8)?;
        Ok(Self::new(flags, page_type))
    }
}

/// Paging Crypto Metadata (PCMD), stored in the metadata backing file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SgxPcmd {
    /// SECINFO.
    pub sec_info: SgxSecInfo,
    /// Enclave identifier.
    pub enclave_id: u64,
    /// MAC over PCMD, page contents and nonce.
    pub mac: MacValue,
}

const_assert_eq!(PCMD_SIZE, 128);

impl SgxPcmd {
    const SECINFO_OFFSET: usize = 0;
    const ENCLAVE_ID_OFFSET: usize = 64;
    const MAC_OFFSET: usize = 112;

    pub fn new(sec_info: SgxSecInfo, enclave_id: u64, mac: MacValue) -> Self {
        Self {
            sec_info,
            enclave_id,
            mac,
        }
    }

    pub fn to_bytes(&self) -> [u8; PCMD_SIZE] {
        let mut bytes = [0u8; PCMD_SIZE];
        let secinfo: u64 = self.sec_info.into();
        bytes[Self::SECINFO_OFFSET..Self::SECINFO_OFFSET + 8].copy_from_slice(&secinfo.to_le_bytes());
        bytes[Self::ENCLAVE_ID_OFFSET..Self::ENCLAVE_ID_OFFSET + 8]
            .copy_from_slice(&self.enclave_id.to_le_bytes());
        bytes[Self::MAC_OFFSET..].copy_from_slice(&self.mac);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; PCMD_SIZE]) -> EpcResult<Self> {
        let secinfo = read_u64(bytes, Self::SECINFO_OFFSET);
        let mut mac = MacValue::default();
        mac.copy_from_slice(&bytes[Self::MAC_OFFSET..]);
        Ok(Self {
            sec_info: SgxSecInfo::try_from(secinfo)?,
            enclave_id: read_u64(bytes, Self::ENCLAVE_ID_OFFSET),
            mac,
        })
    }
}

impl Default for SgxPcmd {
    fn default() -> Self {
        Self::new(
            SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::REG),
            0,
            MacValue::default(),
        )
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// SGX Enclave Control Structure (SECS), the fields software supplies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgxSecs {
    /// Size of ELRANGE in bytes.
    pub size: u64,
    /// Base linear address of ELRANGE.
    pub base_addr: u64,
    /// Size of one SSA frame in pages.
    pub ssa_frame_size: u32,
    pub misc_select: u32,
    pub attributes: SgxAttributes,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
}

impl SgxSecs {
    pub fn new(base_addr: u64, size: u64) -> Self {
        Self {
            size,
            base_addr,
            ssa_frame_size: 1,
            misc_select: 0,
            attributes: SgxAttributes::default(),
            isv_prod_id: 0,
            isv_svn: 0,
        }
    }

    pub fn elrange(&self) -> ElRange {
        self.base_addr as usize..(self.base_addr + self.size) as usize
    }

    pub fn is_debug(&self) -> bool {
        self.attributes.flags.contains(SgxAttributeFlags::DEBUG)
    }

    /// Checks a SECS supplied for ECREATE.
    pub fn validate(&self, size_max: u64) -> EpcResult {
        let flags = self.attributes.flags;
        if flags.contains(SgxAttributeFlags::INIT) {
            return epc_result_err!(EINVAL, "SgxSecs::validate(): INIT attribute set");
        }
        if !flags.contains(SgxAttributeFlags::MODE64BIT) {
            return epc_result_err!(EINVAL, "SgxSecs::validate(): 32-bit enclaves unsupported");
        }
        if self.size < 2 * PAGE_SIZE as u64 || !self.size.is_power_of_two() {
            return epc_result_err!(
                EINVAL,
                format!("SgxSecs::validate(): bad size {:#x}", self.size)
            );
        }
        if self.size > size_max {
            return epc_result_err!(
                EINVAL,
                format!(
                    "SgxSecs::validate(): size {:#x} exceeds {:#x}",
                    self.size, size_max
                )
            );
        }
        if self.base_addr & (self.size - 1) != 0 {
            return epc_result_err!(
                EINVAL,
                format!(
                    "SgxSecs::validate(): base {:#x} not aligned to size {:#x}",
                    self.base_addr, self.size
                )
            );
        }
        let xfrm = self.attributes.xfrm;
        if xfrm & SGX_XFRM_LEGACY != SGX_XFRM_LEGACY || xfrm & !SGX_XFRM_SUPPORTED != 0 {
            return epc_result_err!(EINVAL, format!("SgxSecs::validate(): xfrm {:#x}", xfrm));
        }
        // BNDREGS and BNDCSR go together.
        if (xfrm >> 3) & 1 != (xfrm >> 4) & 1 {
            return epc_result_err!(EINVAL, "SgxSecs::validate(): BNDREGS != BNDCSR");
        }
        if self.ssa_frame_size == 0 {
            return epc_result_err!(EINVAL, "SgxSecs::validate(): zero SSA frame size");
        }
        Ok(())
    }
}

bitflags! {
    pub struct SgxTcsFlags: u64 {
        /// Debug opt-in for the thread.
        const DBGOPTIN = 1 << 0;
    }
}

/// Thread Control Structure, the fields the host validates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgxTcs {
    pub flags: u64,
    pub ossa: u64,
    pub nssa: u32,
    pub oentry: u64,
    pub ofsbase: u64,
    pub ogsbase: u64,
    pub fslimit: u32,
    pub gslimit: u32,
}

impl SgxTcs {
    const FLAGS_OFFSET: usize = 8;
    const OSSA_OFFSET: usize = 16;
    const NSSA_OFFSET: usize = 28;
    const OENTRY_OFFSET: usize = 32;
    const OFSBASE_OFFSET: usize = 48;
    const OGSBASE_OFFSET: usize = 56;
    const FSLIMIT_OFFSET: usize = 64;
    const GSLIMIT_OFFSET: usize = 68;
    const RESERVED_OFFSET: usize = 72;

    pub fn from_page(page: &[u8; PAGE_SIZE]) -> EpcResult<Self> {
        if page[Self::RESERVED_OFFSET..].iter().any(|b| *b != 0) {
            return epc_result_err!(EINVAL, "SgxTcs::from_page(): reserved bytes set");
        }
        Ok(Self {
            flags: read_u64(page, Self::FLAGS_OFFSET),
            ossa: read_u64(page, Self::OSSA_OFFSET),
            nssa: read_u32(page, Self::NSSA_OFFSET),
            oentry: read_u64(page, Self::OENTRY_OFFSET),
            ofsbase: read_u64(page, Self::OFSBASE_OFFSET),
            ogsbase: read_u64(page, Self::OGSBASE_OFFSET),
            fslimit: read_u32(page, Self::FSLIMIT_OFFSET),
            gslimit: read_u32(page, Self::GSLIMIT_OFFSET),
        })
    }

    pub fn to_page(&self) -> Box<crate::memory::AlignedPage> {
        let mut page = crate::memory::AlignedPage::new_boxed();
        page[Self::FLAGS_OFFSET..Self::FLAGS_OFFSET + 8].copy_from_slice(&self.flags.to_le_bytes());
        page[Self::OSSA_OFFSET..Self::OSSA_OFFSET + 8].copy_from_slice(&self.ossa.to_le_bytes());
        page[Self::NSSA_OFFSET..Self::NSSA_OFFSET + 4].copy_from_slice(&self.nssa.to_le_bytes());
        page[Self::OENTRY_OFFSET..Self::OENTRY_OFFSET + 8]
            .copy_from_slice(&self.oentry.to_le_bytes());
        page[Self::OFSBASE_OFFSET..Self::OFSBASE_OFFSET + 8]
            .copy_from_slice(&self.ofsbase.to_le_bytes());
        page[Self::OGSBASE_OFFSET..Self::OGSBASE_OFFSET + 8]
            .copy_from_slice(&self.ogsbase.to_le_bytes());
        page[Self::FSLIMIT_OFFSET..Self::FSLIMIT_OFFSET + 4]
            .copy_from_slice(&self.fslimit.to_le_bytes());
        page[Self::GSLIMIT_OFFSET..Self::GSLIMIT_OFFSET + 4]
            .copy_from_slice(&self.gslimit.to_le_bytes());
        page
    }

    /// Checks a TCS page against the enclave size.
    pub fn validate(&self, encl_size: u64) -> EpcResult {
        let valid_offset = |offset: u64| is_aligned(offset as usize) && offset < encl_size;

        if self.flags & !SgxTcsFlags::all().bits() != 0 {
            return epc_result_err!(EINVAL, "SgxTcs::validate(): reserved flags");
        }
        if self.flags & SgxTcsFlags::DBGOPTIN.bits() != 0 {
            return epc_result_err!(EINVAL, "SgxTcs::validate(): DBGOPTIN set");
        }
        if !valid_offset(self.ossa) || !valid_offset(self.ofsbase) || !valid_offset(self.ogsbase) {
            return epc_result_err!(
                EINVAL,
                format!(
                    "SgxTcs::validate(): bad offsets ossa={:#x} ofsbase={:#x} ogsbase={:#x}",
                    self.ossa, self.ofsbase, self.ogsbase
                )
            );
        }
        if self.fslimit & 0xfff != 0xfff || self.gslimit & 0xfff != 0xfff {
            return epc_result_err!(EINVAL, "SgxTcs::validate(): bad FS/GS limit");
        }
        Ok(())
    }
}

/// The enclave signature structure, the fields EINIT consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigStruct {
    /// Signer's RSA modulus.
    pub modulus: Vec<u8>,
    /// Expected MRENCLAVE.
    pub enclave_hash: Sha256Value,
    pub attributes: SgxAttributes,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
}

impl SigStruct {
    pub fn new(enclave_hash: Sha256Value, modulus: &[u8]) -> Self {
        Self {
            modulus: modulus.to_vec(),
            enclave_hash,
            attributes: SgxAttributes::default(),
            isv_prod_id: 0,
            isv_svn: 0,
        }
    }

    /// MRSIGNER: hash of the signer's public key.
    pub fn mr_signer(&self) -> Sha256Value {
        let mut hasher = Sha256::new();
        hasher.update(&self.modulus);
        hasher.finalize().into()
    }
}

/// Launch token authorizing EINIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EinitToken {
    pub valid: bool,
    pub mr_enclave: Sha256Value,
    pub mr_signer: Sha256Value,
    pub attributes: Option<SgxAttributes>,
}

impl EinitToken {
    pub fn for_sigstruct(sigstruct: &SigStruct) -> Self {
        Self {
            valid: true,
            mr_enclave: sigstruct.enclave_hash,
            mr_signer: sigstruct.mr_signer(),
            attributes: None,
        }
    }
}

/// What a report about an initialized enclave carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveIdentity {
    pub mr_enclave: Sha256Value,
    pub mr_signer: Sha256Value,
    pub attributes: SgxAttributes,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
}
