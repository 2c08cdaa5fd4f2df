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

//! The privileged ENCLS leaf functions the page lifecycle is built on.

pub mod crypto;
pub mod measure;
pub mod sgx;
pub mod soft;
pub mod tlb_track;

use std::fmt::{Debug, Display, Formatter, Result};

use crate::error::{EpcError, EpcErrorNum};
use crate::memory::{EnclVirtAddr, EpcPhysAddr, PAGE_SIZE};

use self::sgx::{EinitToken, EnclaveIdentity, SgxPcmd, SgxSecInfo, SgxSecs, SigStruct};

/// Exception raised by an ENCLS leaf instead of an error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclsFault {
    /// #GP: an operand is not in the state the leaf requires.
    GeneralProtection,
    /// #PF: an operand page is not accessible.
    PageFault,
}

/// Error codes returned in RAX.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)]
pub enum SgxErrorCode {
    InvalidSigStruct = 1,
    InvalidAttribute = 2,
    BlkState = 3,
    InvalidMeasurement = 4,
    NotBlockable = 5,
    PgInvld = 6,
    LockFail = 7,
    InvalidSignature = 8,
    MacCompareFail = 9,
    PageNotBlocked = 10,
    NotTracked = 11,
    VaSlotOccupied = 12,
    ChildPresent = 13,
    EnclaveAct = 14,
    EntryEpochLocked = 15,
    InvalidEinitToken = 16,
    PrevTrkIncmpl = 17,
    PgIsSecs = 18,
    UnmaskedEvent = 128,
    InvalidKeyname = 256,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum EnclsError {
    Fault(EnclsFault),
    Code(SgxErrorCode),
}

/// The closed taxonomy every gateway failure falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclsErrorKind {
    /// Try the same operation again.
    Retry,
    /// The request itself was refused.
    Reject,
    /// The leaf faulted; nothing can be assumed about the operands.
    Fault,
    ResourceExhausted,
}

pub type EnclsResult<T = ()> = std::result::Result<T, EnclsError>;

impl EnclsError {
    pub fn kind(&self) -> EnclsErrorKind {
        use SgxErrorCode::*;
        match *self {
            EnclsError::Fault(_) => EnclsErrorKind::Fault,
            EnclsError::Code(UnmaskedEvent | LockFail | EntryEpochLocked | PrevTrkIncmpl | NotTracked) => {
                EnclsErrorKind::Retry
            }
            EnclsError::Code(VaSlotOccupied) => EnclsErrorKind::ResourceExhausted,
            EnclsError::Code(_) => EnclsErrorKind::Reject,
        }
    }

    /// Linux driver convention: positive SGX code, negative errno for faults.
    pub fn code(&self) -> i32 {
        match *self {
            EnclsError::Fault(_) => EpcErrorNum::EFAULT.code(),
            EnclsError::Code(code) => code as u32 as i32,
        }
    }

    fn errno(&self) -> EpcErrorNum {
        use SgxErrorCode::*;
        match *self {
            EnclsError::Code(MacCompareFail) => EpcErrorNum::EBADMSG,
            EnclsError::Code(
                InvalidSigStruct | InvalidAttribute | InvalidMeasurement | InvalidSignature
                | InvalidEinitToken,
            ) => EpcErrorNum::EPERM,
            EnclsError::Fault(_) => EpcErrorNum::EFAULT,
            _ => match self.kind() {
                EnclsErrorKind::Retry => EpcErrorNum::EBUSY,
                EnclsErrorKind::ResourceExhausted => EpcErrorNum::ENOSPC,
                _ => EpcErrorNum::EIO,
            },
        }
    }
}

impl Debug for EnclsError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            EnclsError::Fault(fault) => write!(f, "ENCLS fault {:?}", fault),
            EnclsError::Code(code) => write!(f, "SGX error {:?} ({})", code, *code as u32),
        }
    }
}

impl Display for EnclsError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        Debug::fmt(self, f)
    }
}

impl From<EnclsError> for EpcError {
    #[track_caller]
    fn from(err: EnclsError) -> Self {
        let loc = std::panic::Location::caller();
        EpcError::new(
            err.errno(),
            loc.file(),
            loc.line(),
            loc.column(),
            Some(format!("{:?}", err)),
        )
    }
}

/// Names of the gateway operations, for statistics and fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnclsOp {
    Create,
    Add,
    Extend,
    Finalize,
    AddVersionArray,
    Block,
    Track,
    Evict,
    Reload,
    Release,
    DebugRead,
    DebugWrite,
    Report,
    Enter,
    Exit,
    Access,
}

/// The secure-instruction gateway.
///
/// Every operation is synchronous and irreversible once it succeeded. Pages
/// are named by their EPC physical address; the caller guarantees it owns
/// them.
pub trait Encls: Send + Sync {
    /// ECREATE: turn `secs_page` into the control page of a new enclave.
    fn create(&self, secs_page: EpcPhysAddr, secs: &SgxSecs) -> EnclsResult;

    /// EADD: copy `src` into `page` at `linaddr` and measure the page header.
    fn add(
        &self,
        secs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        secinfo: &SgxSecInfo,
        src: &[u8; PAGE_SIZE],
    ) -> EnclsResult;

    /// EEXTEND: measure the 256 bytes at `offset` of `page`.
    fn extend(&self, secs: EpcPhysAddr, page: EpcPhysAddr, offset: usize) -> EnclsResult;

    /// EINIT: finalize the measurement against a signature and launch token.
    fn finalize(&self, secs: EpcPhysAddr, sigstruct: &SigStruct, token: &EinitToken)
        -> EnclsResult;

    /// EPA: turn `page` into an empty version array.
    fn add_version_array(&self, page: EpcPhysAddr) -> EnclsResult;

    /// EBLOCK: no new TLB entries may be created for `page`.
    fn block(&self, page: EpcPhysAddr) -> EnclsResult;

    /// ETRACK: start an epoch every thread inside the enclave must leave.
    fn track(&self, secs: EpcPhysAddr) -> EnclsResult;

    /// EWB: encrypt `page` into `contents`, record the version in `va_slot`
    /// and invalidate the page.
    fn evict(
        &self,
        page: EpcPhysAddr,
        va_slot: EpcPhysAddr,
        contents: &mut [u8; PAGE_SIZE],
        pcmd: &mut SgxPcmd,
    ) -> EnclsResult;

    /// ELDU: verify and decrypt `contents` into `page`, consuming `va_slot`.
    /// `secs` is `None` when the page being loaded is the SECS itself.
    fn reload(
        &self,
        page: EpcPhysAddr,
        secs: Option<EpcPhysAddr>,
        linaddr: EnclVirtAddr,
        contents: &[u8; PAGE_SIZE],
        pcmd: &SgxPcmd,
        va_slot: EpcPhysAddr,
    ) -> EnclsResult;

    /// EREMOVE: destroy the contents of `page`. Removing an invalid page is
    /// a no-op.
    fn release(&self, page: EpcPhysAddr) -> EnclsResult;

    /// EDBGRD: read the 8-byte word at `offset` of `page`.
    fn debug_read(&self, page: EpcPhysAddr, offset: usize) -> EnclsResult<u64>;

    /// EDBGWR: write the 8-byte word at `offset` of `page`.
    fn debug_write(&self, page: EpcPhysAddr, offset: usize, value: u64) -> EnclsResult;

    /// The identity of an initialized enclave, as a report would carry it.
    fn report(&self, secs: EpcPhysAddr) -> EnclsResult<EnclaveIdentity>;

    /// A logical processor enters the enclave through `tcs`.
    fn enter(&self, tcs: EpcPhysAddr, cpu: usize) -> EnclsResult;

    /// A logical processor leaves the enclave it entered through `tcs`.
    fn exit(&self, tcs: EpcPhysAddr, cpu: usize) -> EnclsResult;

    /// A load at `linaddr` by the thread running on `tcs`, served by `page`.
    fn enclave_read(
        &self,
        tcs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        buf: &mut [u8],
    ) -> EnclsResult;

    /// A store at `linaddr` by the thread running on `tcs`, served by `page`.
    fn enclave_write(
        &self,
        tcs: EpcPhysAddr,
        page: EpcPhysAddr,
        linaddr: EnclVirtAddr,
        data: &[u8],
    ) -> EnclsResult;

    /// Force every logical processor executing inside the enclave out of it,
    /// completing the current tracking epoch.
    fn kick_cpus(&self, secs: EpcPhysAddr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            EnclsError::Code(SgxErrorCode::UnmaskedEvent).kind(),
            EnclsErrorKind::Retry
        );
        assert_eq!(
            EnclsError::Code(SgxErrorCode::InvalidMeasurement).kind(),
            EnclsErrorKind::Reject
        );
        assert_eq!(
            EnclsError::Fault(EnclsFault::GeneralProtection).kind(),
            EnclsErrorKind::Fault
        );
        assert_eq!(EnclsError::Code(SgxErrorCode::NotTracked).code(), 11);
    }

    #[test]
    fn test_into_epc_error() {
        let err: EpcError = EnclsError::Code(SgxErrorCode::MacCompareFail).into();
        assert_eq!(err.class(), ErrorClass::Integrity);
        let err: EpcError = EnclsError::Code(SgxErrorCode::LockFail).into();
        assert_eq!(err.class(), ErrorClass::Transient);
        let err: EpcError = EnclsError::Code(SgxErrorCode::PageNotBlocked).into();
        assert_eq!(err.class(), ErrorClass::Protocol);
        let err: EpcError = EnclsError::Fault(EnclsFault::PageFault).into();
        assert_eq!(err.num(), EpcErrorNum::EFAULT);
    }
}
