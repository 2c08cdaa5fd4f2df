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

use std::fmt::{Debug, Formatter, Result};
use std::time::Duration;

use super::page::EnclPageFlags;
use super::EnclaveHandle;
use crate::cpumask::current_cpu;
use crate::error::EpcResult;
use crate::memory::addr::page_offset;
use crate::memory::{EnclVirtAddr, EpcPhysAddr, PAGE_SIZE};

/// A logical processor running inside an enclave on one TCS.
///
/// The TCS stays resident and the enclave referenced until the call is
/// dropped.
pub struct EnclaveCall {
    handle: EnclaveHandle,
    tcs: EnclVirtAddr,
    tcs_paddr: EpcPhysAddr,
    cpu: usize,
}

impl EnclaveHandle {
    /// EENTER through the TCS at `tcs`.
    pub fn enter(&self, tcs: EnclVirtAddr) -> EpcResult<EnclaveCall> {
        {
            let inner = self.lock();
            self.check_runnable()?;
            match inner.pages.get(&tcs) {
                Some(page) if page.is_tcs() => {
                    if page.flags.contains(EnclPageFlags::ENTERED) {
                        return epc_result_err!(EBUSY, format!("TCS {:#x} is in use", tcs));
                    }
                }
                _ => return epc_result_err!(EINVAL, format!("{:#x} is not a TCS", tcs)),
            }
        }

        let (mut inner, tcs_paddr) = self.fault_reserve(tcs)?;
        let cpu = current_cpu();
        let entered = self.encls.enter(tcs_paddr, cpu);
        if let Some(page) = inner.pages.get_mut(&tcs) {
            match entered {
                Ok(()) => page.flags.insert(EnclPageFlags::ENTERED),
                Err(_) => page.flags.remove(EnclPageFlags::RESERVED),
            }
        }
        drop(inner);
        entered?;

        encl_dbg!(self, "cpu {} entered through {:#x}", cpu, tcs);
        Ok(EnclaveCall {
            handle: self.clone(),
            tcs,
            tcs_paddr,
            cpu,
        })
    }
}

impl EnclaveCall {
    pub fn handle(&self) -> &EnclaveHandle {
        &self.handle
    }

    pub fn tcs(&self) -> EnclVirtAddr {
        self.tcs
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// A load by the enclave thread, faulting pages in as needed.
    pub fn read(&self, addr: EnclVirtAddr, buf: &mut [u8]) -> EpcResult {
        let mut done = 0;
        while done < buf.len() {
            let pos = addr + done;
            let len = (PAGE_SIZE - page_offset(pos)).min(buf.len() - done);
            let (_inner, paddr) = self.handle.fault_in(pos, false)?;
            self.handle
                .encls
                .enclave_read(self.tcs_paddr, paddr, pos, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// A store by the enclave thread, faulting pages in as needed.
    pub fn write(&self, addr: EnclVirtAddr, data: &[u8]) -> EpcResult {
        let mut done = 0;
        while done < data.len() {
            let pos = addr + done;
            let len = (PAGE_SIZE - page_offset(pos)).min(data.len() - done);
            let (_inner, paddr) = self.handle.fault_in(pos, true)?;
            self.handle
                .encls
                .enclave_write(self.tcs_paddr, paddr, pos, &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Sleep until the enclave changes state or `timeout` passes.
    /// Fails once the enclave is dead.
    pub fn wait(&self, timeout: Duration) -> EpcResult {
        let inner = self.handle.lock();
        self.handle.check_alive()?;
        let inner = self.handle.wait_timeout(inner, timeout);
        self.handle.check_alive()?;
        drop(inner);
        Ok(())
    }
}

impl Drop for EnclaveCall {
    fn drop(&mut self) {
        let mut inner = self.handle.lock();
        if let Err(e) = self.handle.encls.exit(self.tcs_paddr, self.cpu) {
            if !self.handle.is_dead() {
                encl_warn!(self.handle, "EEXIT from {:#x} failed: {:?}", self.tcs, e);
            }
        }
        if let Some(page) = inner.pages.get_mut(&self.tcs) {
            page.flags.remove(EnclPageFlags::RESERVED | EnclPageFlags::ENTERED);
        }
    }
}

impl Debug for EnclaveCall {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("EnclaveCall")
            .field("enclave", &self.handle.id())
            .field("tcs", &self.tcs)
            .field("cpu", &self.cpu)
            .finish()
    }
}
