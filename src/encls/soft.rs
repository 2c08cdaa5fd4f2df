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

//! A software ENCLS: the EPCM and the leaf semantics emulated in memory.
//!
//! Page contents live in the emulated EPCM, evicted pages are sealed with
//! AES-GCM and bound to a version slot, tracking follows the ETRACK epoch
//! rules. Failures can be injected per leaf.

use std::collections::HashMap;

use spin::Mutex;

use super::crypto::{AesGcmAlg, CryptoAlg, Nonce, VaSlot, WriteBackInfo};
use super::measure::Measure;
use super::sgx::{
    EinitToken, EnclaveIdentity, SgxAttributeFlags, SgxEnclPageFlags, SgxEnclPageType, SgxPcmd,
    SgxSecInfo, SgxSecs, SigStruct,
};
use super::tlb_track::TLBFlushTrackingState;
use super::{Encls, EnclsError, EnclsFault, EnclsOp, EnclsResult, SgxErrorCode};
use crate::consts::MEASURE_CHUNK_SIZE;
use crate::memory::addr::{align_down, is_aligned, page_offset};
use crate::memory::{AlignedPage, EnclVirtAddr, EpcPhysAddr, PAGE_SIZE};

const GP: EnclsError = EnclsError::Fault(EnclsFault::GeneralProtection);
const PF: EnclsError = EnclsError::Fault(EnclsFault::PageFault);

const fn code(code: SgxErrorCode) -> EnclsError {
    EnclsError::Code(code)
}

/// Enclave Page Cache Map Entry
struct EpcmEntry {
    /// R, W, X and BLOCKED fields.
    flags: SgxEnclPageFlags,
    page_type: SgxEnclPageType,
    /// Linear enclave address of the EPC page.
    vaddr: EnclVirtAddr,
    /// Enclave owning the page, zero for VA pages.
    eid: u64,
    data: Box<AlignedPage>,
}

impl EpcmEntry {
    fn new(
        flags: SgxEnclPageFlags,
        page_type: SgxEnclPageType,
        vaddr: EnclVirtAddr,
        eid: u64,
        data: Box<AlignedPage>,
    ) -> Self {
        Self {
            flags,
            page_type,
            vaddr,
            eid,
            data,
        }
    }

    fn sec_info(&self) -> SgxSecInfo {
        SgxSecInfo::new(self.flags & SgxEnclPageFlags::PERM_MASK, self.page_type)
    }

    fn is_blocked(&self) -> bool {
        self.flags.contains(SgxEnclPageFlags::BLOCKED)
    }
}

/// What the hardware keeps inside the SECS.
struct SoftEnclave {
    /// `None` while the SECS is evicted.
    secs_paddr: Option<EpcPhysAddr>,
    secs: SgxSecs,
    measure: Measure,
    identity: Option<EnclaveIdentity>,
    tracking: TLBFlushTrackingState,
    child_cnt: usize,
}

impl SoftEnclave {
    fn is_initialized(&self) -> bool {
        self.identity.is_some()
    }
}

struct SoftState {
    epcm: HashMap<EpcPhysAddr, EpcmEntry>,
    enclaves: HashMap<u64, SoftEnclave>,
    /// TCS pages currently entered, with the enclave and the processor.
    entered: HashMap<EpcPhysAddr, (u64, usize)>,
    next_eid: u64,
}

impl SoftState {
    fn entry(&self, paddr: EpcPhysAddr) -> EnclsResult<&EpcmEntry> {
        self.epcm.get(&paddr).ok_or(GP)
    }

    fn entry_mut(&mut self, paddr: EpcPhysAddr) -> EnclsResult<&mut EpcmEntry> {
        self.epcm.get_mut(&paddr).ok_or(GP)
    }

    fn check_free(&self, paddr: EpcPhysAddr) -> EnclsResult {
        if !is_aligned(paddr) || self.epcm.contains_key(&paddr) {
            return Err(GP);
        }
        Ok(())
    }

    fn secs_eid(&self, secs: EpcPhysAddr) -> EnclsResult<u64> {
        let entry = self.entry(secs)?;
        if entry.page_type != SgxEnclPageType::SECS {
            return Err(GP);
        }
        Ok(entry.eid)
    }

    fn enclave(&self, eid: u64) -> EnclsResult<&SoftEnclave> {
        self.enclaves.get(&eid).ok_or(GP)
    }

    fn enclave_mut(&mut self, eid: u64) -> EnclsResult<&mut SoftEnclave> {
        self.enclaves.get_mut(&eid).ok_or(GP)
    }

    fn va_slot(&mut self, va_slot: EpcPhysAddr) -> EnclsResult<VaSlot> {
        let entry = self.entry_mut(align_down(va_slot))?;
        if entry.page_type != SgxEnclPageType::VA {
            return Err(GP);
        }
        VaSlot::new(&mut entry.data, page_offset(va_slot)).ok_or(GP)
    }

    /// The page `linaddr` resolves to for the thread running on `tcs`.
    fn enclave_access(
        &mut self,
        tcs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        len: usize,
        need: SgxEnclPageFlags,
    ) -> EnclsResult<&mut EpcmEntry> {
        let (eid, _) = *self.entered.get(&tcs).ok_or(GP)?;
        if page_offset(linaddr) + len > PAGE_SIZE {
            return Err(GP);
        }
        let entry = self.epcm.get_mut(&page).ok_or(PF)?;
        if entry.eid != eid
            || entry.vaddr != align_down(linaddr)
            || entry.page_type != SgxEnclPageType::REG
            || entry.is_blocked()
            || !entry.flags.contains(need)
        {
            return Err(PF);
        }
        Ok(entry)
    }
}

pub struct SoftEncls {
    state: Mutex<SoftState>,
    injected: Mutex<HashMap<EnclsOp, (EnclsError, usize)>>,
    counters: Mutex<HashMap<EnclsOp, usize>>,
    crypto: Box<dyn CryptoAlg>,
}

impl SoftEncls {
    pub fn new() -> Self {
        Self::with_crypto(Box::new(AesGcmAlg::default()))
    }

    pub fn with_crypto(crypto: Box<dyn CryptoAlg>) -> Self {
        Self {
            state: Mutex::new(SoftState {
                epcm: HashMap::new(),
                enclaves: HashMap::new(),
                entered: HashMap::new(),
                next_eid: 1,
            }),
            injected: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            crypto,
        }
    }

    /// Make the next `count` invocations of `op` fail with `err`.
    pub fn inject_failure(&self, op: EnclsOp, err: EnclsError, count: usize) {
        if count == 0 {
            self.injected.lock().remove(&op);
        } else {
            self.injected.lock().insert(op, (err, count));
        }
    }

    /// How many times `op` was invoked.
    pub fn op_count(&self, op: EnclsOp) -> usize {
        self.counters.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn is_valid(&self, paddr: EpcPhysAddr) -> bool {
        self.state.lock().epcm.contains_key(&paddr)
    }

    pub fn nr_valid_pages(&self) -> usize {
        self.state.lock().epcm.len()
    }

    /// Resident children of the enclave whose SECS is at `secs`.
    pub fn child_count(&self, secs: EpcPhysAddr) -> Option<usize> {
        let state = self.state.lock();
        let eid = state.secs_eid(secs).ok()?;
        state.enclave(eid).ok().map(|e| e.child_cnt)
    }

    fn begin(&self, op: EnclsOp) -> EnclsResult {
        *self.counters.lock().entry(op).or_insert(0) += 1;
        let mut injected = self.injected.lock();
        let (err, exhausted) = match injected.get_mut(&op) {
            Some((err, left)) => {
                *left -= 1;
                (*err, *left == 0)
            }
            None => return Ok(()),
        };
        if exhausted {
            injected.remove(&op);
        }
        trace!("SoftEncls: injected {:?} into {:?}", err, op);
        Err(err)
    }
}

impl Default for SoftEncls {
    fn default() -> Self {
        Self::new()
    }
}

impl Encls for SoftEncls {
    fn create(&self, secs_page: EpcPhysAddr, secs: &SgxSecs) -> EnclsResult {
        self.begin(EnclsOp::Create)?;
        if secs.validate(u64::MAX).is_err() {
            return Err(GP);
        }
        let mut state = self.state.lock();
        state.check_free(secs_page)?;
        let eid = state.next_eid;
        state.next_eid += 1;

        let mut measure = Measure::new();
        measure.start(secs.size, secs.ssa_frame_size);
        state.enclaves.insert(
            eid,
            SoftEnclave {
                secs_paddr: Some(secs_page),
                secs: secs.clone(),
                measure,
                identity: None,
                tracking: TLBFlushTrackingState::default(),
                child_cnt: 0,
            },
        );
        state.epcm.insert(
            secs_page,
            EpcmEntry::new(
                SgxEnclPageFlags::empty(),
                SgxEnclPageType::SECS,
                0,
                eid,
                AlignedPage::new_boxed(),
            ),
        );
        Ok(())
    }

    fn add(
        &self,
        secs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        secinfo: &SgxSecInfo,
        src: &[u8; PAGE_SIZE],
    ) -> EnclsResult {
        self.begin(EnclsOp::Add)?;
        if secinfo.validate().is_err() || !is_aligned(linaddr) {
            return Err(GP);
        }
        let mut state = self.state.lock();
        let eid = state.secs_eid(secs)?;
        state.check_free(page)?;
        let encl = state.enclave_mut(eid)?;
        if encl.is_initialized() || !encl.secs.elrange().contains(&linaddr) {
            return Err(GP);
        }
        encl.measure
            .add((linaddr - encl.secs.base_addr as usize) as u64, *secinfo);
        encl.child_cnt += 1;

        let flags = match secinfo.page_type {
            SgxEnclPageType::TCS => SgxEnclPageFlags::empty(),
            _ => secinfo.perms(),
        };
        state.epcm.insert(
            page,
            EpcmEntry::new(flags, secinfo.page_type, linaddr, eid, AlignedPage::from_slice(src)),
        );
        Ok(())
    }

    fn extend(&self, secs: EpcPhysAddr, page: EpcPhysAddr, offset: usize) -> EnclsResult {
        self.begin(EnclsOp::Extend)?;
        if offset % MEASURE_CHUNK_SIZE != 0 || offset >= PAGE_SIZE {
            return Err(GP);
        }
        let mut state = self.state.lock();
        let eid = state.secs_eid(secs)?;
        let (vaddr, chunk) = {
            let entry = state.entry(page)?;
            if entry.eid != eid {
                return Err(GP);
            }
            (
                entry.vaddr,
                entry.data[offset..offset + MEASURE_CHUNK_SIZE].to_vec(),
            )
        };
        let encl = state.enclave_mut(eid)?;
        if encl.is_initialized() {
            return Err(GP);
        }
        let chunk_offset = vaddr - encl.secs.base_addr as usize + offset;
        encl.measure.extend(chunk_offset as u64, &chunk);
        Ok(())
    }

    fn finalize(
        &self,
        secs: EpcPhysAddr,
        sigstruct: &SigStruct,
        token: &EinitToken,
    ) -> EnclsResult {
        self.begin(EnclsOp::Finalize)?;
        let mut state = self.state.lock();
        let eid = state.secs_eid(secs)?;
        let encl = state.enclave_mut(eid)?;
        if encl.is_initialized() {
            return Err(GP);
        }

        let mr_enclave = encl.measure.clone().finish();
        if mr_enclave != sigstruct.enclave_hash {
            return Err(code(SgxErrorCode::InvalidMeasurement));
        }
        let mr_signer = sigstruct.mr_signer();
        if !token.valid || token.mr_enclave != mr_enclave || token.mr_signer != mr_signer {
            return Err(code(SgxErrorCode::InvalidEinitToken));
        }
        if let Some(attributes) = token.attributes {
            if attributes != encl.secs.attributes {
                return Err(code(SgxErrorCode::InvalidAttribute));
            }
        }

        let mut attributes = encl.secs.attributes;
        attributes.flags |= SgxAttributeFlags::INIT;
        encl.measure.finish();
        encl.identity = Some(EnclaveIdentity {
            mr_enclave,
            mr_signer,
            attributes,
            isv_prod_id: sigstruct.isv_prod_id,
            isv_svn: sigstruct.isv_svn,
        });
        Ok(())
    }

    fn add_version_array(&self, page: EpcPhysAddr) -> EnclsResult {
        self.begin(EnclsOp::AddVersionArray)?;
        let mut state = self.state.lock();
        state.check_free(page)?;
        state.epcm.insert(
            page,
            EpcmEntry::new(
                SgxEnclPageFlags::empty(),
                SgxEnclPageType::VA,
                0,
                0,
                AlignedPage::new_boxed(),
            ),
        );
        Ok(())
    }

    fn block(&self, page: EpcPhysAddr) -> EnclsResult {
        self.begin(EnclsOp::Block)?;
        let mut state = self.state.lock();
        let entry = state.entry_mut(page)?;
        match entry.page_type {
            SgxEnclPageType::SECS => return Err(code(SgxErrorCode::PgIsSecs)),
            SgxEnclPageType::VA => return Err(code(SgxErrorCode::NotBlockable)),
            _ => {}
        }
        if entry.is_blocked() {
            return Err(code(SgxErrorCode::BlkState));
        }
        entry.flags |= SgxEnclPageFlags::BLOCKED;
        let eid = entry.eid;
        state
            .enclave_mut(eid)?
            .tracking
            .require_track_for_write_back();
        Ok(())
    }

    fn track(&self, secs: EpcPhysAddr) -> EnclsResult {
        self.begin(EnclsOp::Track)?;
        let mut state = self.state.lock();
        let eid = state.secs_eid(secs)?;
        if !state.enclave_mut(eid)?.tracking.activate() {
            return Err(code(SgxErrorCode::PrevTrkIncmpl));
        }
        Ok(())
    }

    fn evict(
        &self,
        page: EpcPhysAddr,
        va_slot: EpcPhysAddr,
        contents: &mut [u8; PAGE_SIZE],
        pcmd: &mut SgxPcmd,
    ) -> EnclsResult {
        self.begin(EnclsOp::Evict)?;
        let mut state = self.state.lock();
        let (sec_info, vaddr, eid) = {
            let entry = state.entry(page)?;
            match entry.page_type {
                SgxEnclPageType::VA | SgxEnclPageType::TRIM => return Err(GP),
                SgxEnclPageType::SECS => {}
                _ if !entry.is_blocked() => return Err(code(SgxErrorCode::PageNotBlocked)),
                _ => {}
            }
            (entry.sec_info(), entry.vaddr, entry.eid)
        };
        let is_secs = sec_info.page_type == SgxEnclPageType::SECS;
        {
            let encl = state.enclave(eid)?;
            if is_secs && encl.child_cnt > 0 {
                return Err(code(SgxErrorCode::ChildPresent));
            }
            if !is_secs && !encl.tracking.is_write_back_tracking_done() {
                return Err(code(SgxErrorCode::NotTracked));
            }
        }
        if !state.va_slot(va_slot)?.is_empty() {
            return Err(code(SgxErrorCode::VaSlotOccupied));
        }

        let nonce = Nonce::new().get_val();
        let info = WriteBackInfo::new(nonce, eid, sec_info, vaddr);
        contents.copy_from_slice(&state.entry(page)?.data[..]);
        let mac = self.crypto.encrypt_page(&info, contents).ok_or(GP)?;
        *pcmd = SgxPcmd::new(sec_info, eid, mac);

        state.va_slot(va_slot)?.set(nonce);
        state.epcm.remove(&page);
        let encl = state.enclave_mut(eid)?;
        if is_secs {
            encl.secs_paddr = None;
        } else {
            encl.child_cnt -= 1;
        }
        Ok(())
    }

    fn reload(
        &self,
        page: EpcPhysAddr,
        secs: Option<EpcPhysAddr>,
        linaddr: EnclVirtAddr,
        contents: &[u8; PAGE_SIZE],
        pcmd: &SgxPcmd,
        va_slot: EpcPhysAddr,
    ) -> EnclsResult {
        self.begin(EnclsOp::Reload)?;
        let mut state = self.state.lock();
        state.check_free(page)?;
        let nonce = state.va_slot(va_slot)?.get();
        let sec_info = pcmd.sec_info;
        let (eid, vaddr) = match secs {
            Some(secs) => {
                if sec_info.page_type == SgxEnclPageType::SECS {
                    return Err(GP);
                }
                (state.secs_eid(secs)?, linaddr)
            }
            None => {
                if sec_info.page_type != SgxEnclPageType::SECS
                    || state.enclave(pcmd.enclave_id)?.secs_paddr.is_some()
                {
                    return Err(GP);
                }
                (pcmd.enclave_id, 0)
            }
        };

        let info = WriteBackInfo::new(nonce, eid, sec_info, vaddr);
        let mut data = AlignedPage::from_slice(contents);
        if !self.crypto.decrypt_page(&info, &mut data, &pcmd.mac) {
            return Err(code(SgxErrorCode::MacCompareFail));
        }

        let encl = state.enclave_mut(eid)?;
        if secs.is_some() {
            encl.child_cnt += 1;
        } else {
            encl.secs_paddr = Some(page);
        }
        state.epcm.insert(
            page,
            EpcmEntry::new(sec_info.flags, sec_info.page_type, vaddr, eid, data),
        );
        state.va_slot(va_slot)?.clear();
        Ok(())
    }

    fn release(&self, page: EpcPhysAddr) -> EnclsResult {
        self.begin(EnclsOp::Release)?;
        let mut state = self.state.lock();
        let (page_type, eid) = match state.epcm.get(&page) {
            Some(entry) => (entry.page_type, entry.eid),
            None => return Ok(()),
        };
        match page_type {
            SgxEnclPageType::SECS => {
                if state.enclave(eid)?.child_cnt > 0 {
                    return Err(code(SgxErrorCode::ChildPresent));
                }
                state.enclaves.remove(&eid);
            }
            SgxEnclPageType::VA => {}
            _ => {
                if let Some(encl) = state.enclaves.get_mut(&eid) {
                    encl.child_cnt = encl.child_cnt.saturating_sub(1);
                }
            }
        }
        state.epcm.remove(&page);
        state.entered.remove(&page);
        Ok(())
    }

    fn debug_read(&self, page: EpcPhysAddr, offset: usize) -> EnclsResult<u64> {
        self.begin(EnclsOp::DebugRead)?;
        let state = self.state.lock();
        let entry = state.entry(page)?;
        if offset % 8 != 0 || offset >= PAGE_SIZE {
            return Err(GP);
        }
        match entry.page_type {
            SgxEnclPageType::REG | SgxEnclPageType::TCS => {}
            _ => return Err(GP),
        }
        if !state.enclave(entry.eid)?.secs.is_debug() {
            return Err(GP);
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&entry.data[offset..offset + 8]);
        Ok(u64::from_le_bytes(word))
    }

    fn debug_write(&self, page: EpcPhysAddr, offset: usize, value: u64) -> EnclsResult {
        self.begin(EnclsOp::DebugWrite)?;
        let mut state = self.state.lock();
        if offset % 8 != 0 || offset >= PAGE_SIZE {
            return Err(GP);
        }
        let eid = {
            let entry = state.entry(page)?;
            if entry.page_type != SgxEnclPageType::REG {
                return Err(GP);
            }
            entry.eid
        };
        if !state.enclave(eid)?.secs.is_debug() {
            return Err(GP);
        }
        let entry = state.entry_mut(page)?;
        entry.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn report(&self, secs: EpcPhysAddr) -> EnclsResult<EnclaveIdentity> {
        self.begin(EnclsOp::Report)?;
        let state = self.state.lock();
        let eid = state.secs_eid(secs)?;
        state.enclave(eid)?.identity.clone().ok_or(GP)
    }

    fn enter(&self, tcs: EpcPhysAddr, cpu: usize) -> EnclsResult {
        self.begin(EnclsOp::Enter)?;
        let mut state = self.state.lock();
        let eid = {
            let entry = state.entry(tcs)?;
            if entry.page_type != SgxEnclPageType::TCS {
                return Err(GP);
            }
            if entry.is_blocked() {
                return Err(PF);
            }
            entry.eid
        };
        if state.entered.contains_key(&tcs) {
            // TCS busy
            return Err(GP);
        }
        let encl = state.enclave_mut(eid)?;
        if !encl.is_initialized() {
            return Err(GP);
        }
        encl.tracking.enter(cpu);
        state.entered.insert(tcs, (eid, cpu));
        Ok(())
    }

    fn exit(&self, tcs: EpcPhysAddr, cpu: usize) -> EnclsResult {
        self.begin(EnclsOp::Exit)?;
        let mut state = self.state.lock();
        let (eid, _) = state.entered.remove(&tcs).ok_or(GP)?;
        if let Some(encl) = state.enclaves.get_mut(&eid) {
            encl.tracking.exit(cpu);
        }
        Ok(())
    }

    fn enclave_read(
        &self,
        tcs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        buf: &mut [u8],
    ) -> EnclsResult {
        self.begin(EnclsOp::Access)?;
        let mut state = self.state.lock();
        let entry = state.enclave_access(tcs, page, linaddr, buf.len(), SgxEnclPageFlags::R)?;
        let offset = page_offset(linaddr);
        buf.copy_from_slice(&entry.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn enclave_write(
        &self,
        tcs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        data: &[u8],
    ) -> EnclsResult {
        self.begin(EnclsOp::Access)?;
        let mut state = self.state.lock();
        let entry = state.enclave_access(tcs, page, linaddr, data.len(), SgxEnclPageFlags::W)?;
        let offset = page_offset(linaddr);
        entry.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn kick_cpus(&self, secs: EpcPhysAddr) {
        let mut state = self.state.lock();
        if let Ok(eid) = state.secs_eid(secs) {
            if let Some(encl) = state.enclaves.get_mut(&eid) {
                encl.tracking.kick();
            }
        }
    }
}
