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

//! Lifecycle of SGX enclave pages inside the EPC: allocation, eviction to
//! an encrypted backing store, reload on fault and enclave teardown.
//!
//! The privileged instructions go through the [`Encls`] gateway;
//! [`SoftEncls`] implements it in software.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod logging;
#[macro_use]
pub mod error;

pub mod config;
pub mod consts;
pub mod cpumask;
pub mod enclave;
pub mod encls;
pub mod epc;
pub mod intervaltree;
pub mod memory;
pub mod reclaim;
pub mod stats;
pub mod system;

pub use config::{EpcBankConfig, EpcConfig};
pub use enclave::{
    Enclave, EnclaveCall, EnclaveFlags, EnclaveHandle, EnclaveManager, EnclaveStatus, Interrupt,
};
pub use encls::soft::SoftEncls;
pub use encls::{Encls, EnclsError, EnclsResult};
pub use epc::{AllocFlags, EpcAllocator, EpcPage, PageOwner};
pub use error::{EpcError, EpcErrorNum, EpcResult, ErrorClass};
pub use memory::{AddressSpace, EnclVirtAddr, EpcPhysAddr, Tgid};
pub use reclaim::Reclaimer;
pub use system::EpcSystem;
