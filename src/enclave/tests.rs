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

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use super::*;
use crate::encls::measure::Measure;
use crate::encls::sgx::{
    EinitToken, SgxAttributeFlags, SgxEnclPageFlags, SgxSecInfo, SgxSecs, SgxTcs, SigStruct,
};
use crate::encls::soft::SoftEncls;
use crate::encls::{EnclsError, EnclsOp, SgxErrorCode};
use crate::epc::PageOwner;
use crate::error::{EpcErrorNum, ErrorClass};
use crate::memory::{AlignedPage, PAGE_SIZE};
use crate::system::EpcSystem;

const BASE: usize = 0x100_0000;
const TGID: Tgid = 100;

fn config(nr_pages: usize) -> EpcConfig {
    let mut config = EpcConfig::with_pages(nr_pages);
    config.enable_reclaimer = false;
    config.einit_sleep_time = Duration::from_millis(1);
    config
}

struct Env {
    encls: Arc<SoftEncls>,
    system: Arc<EpcSystem>,
    mm: Arc<AddressSpace>,
}

impl Env {
    fn new(config: EpcConfig) -> Self {
        let encls = Arc::new(SoftEncls::new());
        let system = EpcSystem::start(config, encls.clone()).unwrap();
        Self {
            encls,
            system,
            mm: AddressSpace::new(TGID),
        }
    }

    fn nr_free(&self) -> usize {
        self.system.allocator().nr_free()
    }
}

fn rw() -> SgxSecInfo {
    SgxSecInfo::reg(SgxEnclPageFlags::R | SgxEnclPageFlags::W)
}

fn pattern(seed: u8) -> Box<AlignedPage> {
    let mut page = AlignedPage::new_boxed();
    for (i, b) in page.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
    page
}

fn tcs_page() -> Box<AlignedPage> {
    SgxTcs {
        ossa: PAGE_SIZE as u64,
        nssa: 1,
        fslimit: 0xfff,
        gslimit: 0xfff,
        ..Default::default()
    }
    .to_page()
}

/// Adds pages and keeps the MRENCLAVE the signer would compute.
struct Builder {
    secs: SgxSecs,
    measure: Measure,
}

impl Builder {
    fn new(base: usize, nr_pages: usize, debug: bool) -> Self {
        let mut secs = SgxSecs::new(base as u64, (nr_pages * PAGE_SIZE) as u64);
        if debug {
            secs.attributes.flags |= SgxAttributeFlags::DEBUG;
        }
        let mut measure = Measure::new();
        measure.start(secs.size, secs.ssa_frame_size);
        Self { secs, measure }
    }

    fn addr(&self, index: usize) -> EnclVirtAddr {
        self.secs.base_addr as usize + index * PAGE_SIZE
    }

    fn create(&self, env: &Env) -> EnclaveHandle {
        env.system.create_enclave(&env.mm, &self.secs).unwrap()
    }

    fn add(
        &mut self,
        handle: &EnclaveHandle,
        index: usize,
        data: &AlignedPage,
        secinfo: SgxSecInfo,
    ) -> EpcResult {
        handle.add_page(self.addr(index), data, secinfo, 0xffff)?;
        self.measure
            .add_page((index * PAGE_SIZE) as u64, secinfo, data, 0xffff);
        Ok(())
    }

    fn sigstruct(&self) -> SigStruct {
        SigStruct::new(self.measure.clone().finish(), b"test signer")
    }

    fn init(&self, handle: &EnclaveHandle) -> EpcResult {
        let sigstruct = self.sigstruct();
        handle.init(&sigstruct, &EinitToken::for_sigstruct(&sigstruct), None)
    }
}

/// REG pages at indices `0..nr_reg`, then `nr_tcs` TCS pages.
fn build_at(
    env: &Env,
    base: usize,
    nr_pages: usize,
    nr_reg: usize,
    nr_tcs: usize,
    debug: bool,
) -> EnclaveHandle {
    let mut builder = Builder::new(base, nr_pages, debug);
    let handle = builder.create(env);
    for i in 0..nr_reg {
        builder.add(&handle, i, &pattern(i as u8), rw()).unwrap();
    }
    for i in nr_reg..nr_reg + nr_tcs {
        builder.add(&handle, i, &tcs_page(), SgxSecInfo::tcs()).unwrap();
    }
    builder.init(&handle).unwrap();
    handle
}

fn build(env: &Env, nr_reg: usize, nr_tcs: usize, debug: bool) -> EnclaveHandle {
    build_at(env, BASE, 16, nr_reg, nr_tcs, debug)
}

fn addr(index: usize) -> EnclVirtAddr {
    BASE + index * PAGE_SIZE
}

/// Two passes per round: the first one only clears accessed bits.
fn evict_all(handle: &EnclaveHandle) {
    for _ in 0..4 {
        let victims = handle.isolate_pages(usize::MAX);
        handle.write_pages(&victims);
        if handle.nr_resident() == 0 {
            break;
        }
    }
}

fn check_exclusive(env: &Env, handle: &EnclaveHandle) {
    let epc = env.system.allocator();
    let inner = handle.lock();
    let mut seen = HashSet::new();
    for page in inner.pages.values() {
        if let Some(paddr) = page.paddr() {
            assert!(seen.insert(paddr), "{:#x} owned twice", paddr);
            assert!(!page.evicted);
            assert_eq!(
                epc.owner_of(paddr),
                Some(PageOwner::Page {
                    enclave: handle.id(),
                    addr: page.addr
                })
            );
        }
    }
    let owned = epc
        .owners()
        .iter()
        .filter(|(_, owner)| matches!(owner, PageOwner::Page { .. }))
        .count();
    assert_eq!(owned, seen.len());
    assert_eq!(handle.nr_resident(), seen.len());
}

fn errno<T: Debug>(ret: EpcResult<T>) -> EpcErrorNum {
    ret.unwrap_err().num()
}

#[test]
fn test_flags_and_stats_ids() {
    for (i, id) in EnclaveStatsId::ALL.iter().enumerate() {
        assert_eq!(*id as usize, i);
    }
    assert_eq!(EnclaveFlags::all().bits().count_ones(), 8);
    assert_eq!(EnclPageFlags::all().bits().count_ones(), 3);
}

#[test]
fn test_create_add_init() {
    let env = Env::new(config(64));
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    assert_eq!(handle.refcount(), 1);
    for i in 0..3 {
        builder.add(&handle, i, &pattern(i as u8), rw()).unwrap();
    }
    builder.add(&handle, 3, &tcs_page(), SgxSecInfo::tcs()).unwrap();
    handle.wait_for_adds().unwrap();
    assert_eq!(handle.nr_resident(), 4);
    assert_eq!(handle.stats_count(EnclaveStatsId::AddPage), 4);
    assert!(!handle.is_initialized());

    builder.init(&handle).unwrap();
    assert!(handle.is_initialized());
    let identity = handle.identity().unwrap();
    assert_eq!(identity.mr_enclave, builder.sigstruct().enclave_hash);
    // idempotent
    builder.init(&handle).unwrap();
    assert_eq!(env.encls.op_count(EnclsOp::Finalize), 1);

    let call = handle.enter(builder.addr(3)).unwrap();
    let mut buf = [0u8; 16];
    call.read(builder.addr(1) + 8, &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(1)[8..24]);
    call.write(builder.addr(2), b"hello").unwrap();
    call.read(builder.addr(2), &mut buf[..5]).unwrap();
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(errno(handle.enter(builder.addr(3))), EpcErrorNum::EBUSY);
    assert_eq!(errno(handle.enter(builder.addr(2))), EpcErrorNum::EINVAL);
    drop(call);
    drop(handle.enter(builder.addr(3)).unwrap());

    let found = env.system.find_enclave(TGID, builder.addr(2) + 5).unwrap();
    assert_eq!(found.id(), handle.id());
    assert_eq!(handle.refcount(), 2);
    drop(found);
    assert_eq!(
        errno(env.system.find_enclave(TGID, builder.addr(8))),
        EpcErrorNum::EFAULT
    );
}

#[test]
fn test_add_page_validation() {
    let env = Env::new(config(64));
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    let data = pattern(0);

    assert_eq!(
        errno(handle.add_page(BASE + 8, &data, rw(), 0)),
        EpcErrorNum::EINVAL
    );
    assert_eq!(
        errno(handle.add_page(BASE + 8 * PAGE_SIZE, &data, rw(), 0)),
        EpcErrorNum::EINVAL
    );
    assert_eq!(
        errno(handle.add_page(BASE, &data, SgxSecInfo::reg(SgxEnclPageFlags::W), 0)),
        EpcErrorNum::EINVAL
    );
    let mut tcs = SgxTcs::from_page(&tcs_page()).unwrap();
    tcs.fslimit = 0;
    assert_eq!(
        errno(handle.add_page(BASE, &tcs.to_page(), SgxSecInfo::tcs(), 0)),
        EpcErrorNum::EINVAL
    );

    builder.add(&handle, 0, &data, rw()).unwrap();
    assert_eq!(
        errno(handle.add_page(BASE, &data, rw(), 0)),
        EpcErrorNum::EEXIST
    );
    builder.init(&handle).unwrap();
    assert_eq!(
        errno(handle.add_page(addr(1), &data, rw(), 0)),
        EpcErrorNum::EINVAL
    );
    assert_eq!(handle.lock().va_reserved, 2);
}

#[test]
fn test_evict_reload_round_trip() {
    let env = Env::new(config(64));
    let handle = build(&env, 4, 1, true);
    handle.debug_write(addr(2) + 100, b"survives eviction").unwrap();

    evict_all(&handle);
    assert_eq!(handle.nr_resident(), 0);
    assert_eq!(handle.nr_evicted(), 5);
    assert!(handle.flags().contains(EnclaveFlags::SECS_EVICTED));
    // only the VA page is left
    assert_eq!(env.nr_free(), 63);
    assert_eq!(env.system.allocator().nr_va_pages(), 1);
    assert_eq!(env.encls.nr_valid_pages(), 1);

    let mut buf = [0u8; 17];
    handle.debug_read(addr(2) + 100, &mut buf).unwrap();
    assert_eq!(&buf, b"survives eviction");
    assert!(!handle.flags().contains(EnclaveFlags::SECS_EVICTED));
    assert!(handle.is_resident(addr(2)));
    assert_eq!(handle.nr_resident(), 1);
    assert_eq!(handle.stats_count(EnclaveStatsId::Reload), 1);

    // the version slot is bound once and reused
    let slot = handle.lock().pages[&addr(2)].va_slot;
    evict_all(&handle);
    handle.debug_read(addr(2), &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(2)[..17]);
    assert_eq!(handle.lock().pages[&addr(2)].va_slot, slot);
    assert_eq!(env.system.allocator().nr_va_pages(), 1);
    check_exclusive(&env, &handle);
}

#[test]
fn test_reload_failure_does_not_leak() {
    let env = Env::new(config(64));
    let handle = build(&env, 3, 1, false);

    let victims = handle.isolate_pages(1);
    assert_eq!(victims, vec![addr(0)]);
    assert_eq!(handle.write_pages(&victims), 1);
    assert!(!handle.is_resident(addr(0)));

    let free = env.nr_free();
    env.encls.inject_failure(
        EnclsOp::Reload,
        EnclsError::Code(SgxErrorCode::MacCompareFail),
        1,
    );
    assert_eq!(errno(handle.fault(addr(0), false)), EpcErrorNum::EBADMSG);
    assert_eq!(env.nr_free(), free);
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    assert!(!handle.is_resident(addr(0)));
    check_exclusive(&env, &handle);

    handle.fault(addr(0), true).unwrap();
    assert_eq!(env.nr_free(), free - 1);
    check_exclusive(&env, &handle);
}

#[test]
fn test_stale_image_rejected() {
    let env = Env::new(config(64));
    let handle = build(&env, 2, 1, true);

    let victims = handle.isolate_pages(1);
    assert_eq!(victims, vec![addr(0)]);
    handle.write_pages(&victims);
    let (stale, stale_pcmd) = {
        let inner = handle.lock();
        let mut data = AlignedPage::new_boxed();
        let pcmd = inner.backing().unwrap().read_page(0, &mut data).unwrap();
        (data, pcmd)
    };

    handle.debug_write(addr(0), b"version 2").unwrap();
    evict_all(&handle);
    handle
        .lock()
        .backing()
        .unwrap()
        .write_page(0, &stale, &stale_pcmd)
        .unwrap();

    let mut buf = [0u8; 9];
    assert_eq!(
        errno(handle.debug_read(addr(0), &mut buf)),
        EpcErrorNum::EBADMSG
    );
    assert!(!handle.is_resident(addr(0)));
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    // other pages are unaffected
    handle.debug_read(addr(1), &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(1)[..9]);
}

#[test]
fn test_round_robin_between_processes() {
    let env = Env::new(config(128));
    let other = Env {
        encls: env.encls.clone(),
        system: env.system.clone(),
        mm: AddressSpace::new(TGID + 1),
    };
    let a = build(&env, 2, 0, false);
    let b = build(&other, 2, 0, false);
    let c = build_at(&env, BASE + 0x10_0000, 16, 2, 0, false);

    let registry = env.system.registry();
    assert_eq!(registry.nr_enclaves(), 3);
    let order: Vec<u64> = (0..6)
        .map(|_| registry.isolate().unwrap().id())
        .collect();
    assert_eq!(order, vec![a.id(), c.id(), b.id(), a.id(), c.id(), b.id()]);

    // nothing resident, passed over
    evict_all(&b);
    assert!((0..4).all(|_| registry.isolate().unwrap().id() != b.id()));

    c.clone().destroy();
    assert!((0..4).all(|_| registry.isolate().unwrap().id() == a.id()));
}

#[test]
fn test_destroy_with_calls_in_flight() {
    const NR_CALLS: usize = 8;
    let env = Env::new(config(64));
    let handle = build(&env, 1, NR_CALLS, false);
    let weak = Arc::downgrade(handle.enclave());

    let entered = Arc::new(Barrier::new(NR_CALLS + 1));
    let (done_tx, done_rx) = mpsc::channel();
    let (last_tx, last_rx) = mpsc::channel::<()>();
    let mut last_rx = Some(last_rx);
    let mut threads = Vec::new();
    for i in 0..NR_CALLS {
        let handle = handle.clone();
        let entered = entered.clone();
        let done_tx = done_tx.clone();
        let last_rx = if i == NR_CALLS - 1 { last_rx.take() } else { None };
        threads.push(thread::spawn(move || {
            let call = handle.enter(addr(1 + i)).unwrap();
            entered.wait();
            let err = loop {
                if let Err(e) = call.wait(Duration::from_millis(10)) {
                    break e;
                }
            };
            assert_eq!(err.num(), EpcErrorNum::ENOTRECOVERABLE);
            assert_eq!(errno(call.read(addr(0), &mut [0u8; 8])), EpcErrorNum::ENOTRECOVERABLE);
            if let Some(rx) = last_rx {
                rx.recv().unwrap();
            }
            drop(call);
            drop(handle);
            done_tx.send(i).unwrap();
        }));
    }

    entered.wait();
    handle.destroy();
    for _ in 0..NR_CALLS - 1 {
        done_rx.recv().unwrap();
    }
    {
        let encl = weak.upgrade().unwrap();
        assert_eq!(encl.status(), EnclaveStatus::Dead);
        assert!(encl.flags().contains(EnclaveFlags::TEARDOWN));
        assert!(!encl.is_released());
        // the last thread's handle and its call
        assert_eq!(encl.refcount(), 2);
    }
    // pages went with the teardown, the enclave waits for the last call
    assert_eq!(env.nr_free(), 64);

    last_tx.send(()).unwrap();
    assert_eq!(done_rx.recv().unwrap(), NR_CALLS - 1);
    for t in threads {
        t.join().unwrap();
    }
    if let Some(encl) = weak.upgrade() {
        assert!(encl.is_released());
    }
    assert_eq!(env.system.registry().nr_enclaves(), 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while weak.upgrade().is_some() {
        assert!(Instant::now() < deadline, "add worker kept the enclave alive");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_four_page_pool() {
    let mut config = config(4);
    config.swap_cluster = 1;
    let env = Env::new(config);

    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    for i in 0..6 {
        builder.add(&handle, i, &pattern(i as u8), rw()).unwrap();
    }
    handle.wait_for_adds().unwrap();

    assert_eq!(env.nr_free(), 0);
    let resident = handle.nr_resident();
    let evicted = handle.nr_evicted();
    assert!(evicted >= 2);
    assert!(resident <= 4);
    assert_eq!(resident + evicted, 6);
    assert_eq!(env.system.reclaimer().nr_evicted(), evicted);
    check_exclusive(&env, &handle);

    builder.init(&handle).unwrap();
    for i in 0..6 {
        handle.fault(addr(i), false).unwrap();
        assert!(handle.is_resident(addr(i)));
        check_exclusive(&env, &handle);
    }
    assert_eq!(handle.status(), EnclaveStatus::Alive);
}

#[test]
fn test_init_retries() {
    let mut config = config(64);
    config.einit_spin_count = 4;
    config.einit_sleep_count = 5;
    let env = Env::new(config);
    let unmasked = EnclsError::Code(SgxErrorCode::UnmaskedEvent);

    // recovers after a few sleeps
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    builder.add(&handle, 0, &pattern(0), rw()).unwrap();
    env.encls.inject_failure(EnclsOp::Finalize, unmasked, 4 + 3);
    builder.init(&handle).unwrap();
    assert_eq!(env.encls.op_count(EnclsOp::Finalize), 4 + 4);

    // an interrupt ends the wait
    let mut builder = Builder::new(BASE + 0x10_0000, 8, false);
    let handle = builder.create(&env);
    builder.add(&handle, 0, &pattern(0), rw()).unwrap();
    env.encls.inject_failure(EnclsOp::Finalize, unmasked, 1000);
    let intr = Interrupt::new();
    intr.raise();
    let sigstruct = builder.sigstruct();
    let token = EinitToken::for_sigstruct(&sigstruct);
    assert_eq!(
        errno(handle.init(&sigstruct, &token, Some(&intr))),
        EpcErrorNum::ERESTART
    );
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    assert!(!handle.is_initialized());

    // budget exhausted
    let before = env.encls.op_count(EnclsOp::Finalize);
    assert_eq!(errno(handle.init(&sigstruct, &token, None)), EpcErrorNum::EBUSY);
    assert_eq!(env.encls.op_count(EnclsOp::Finalize) - before, 4 * 6);

    // a rejection is not retried
    env.encls.inject_failure(EnclsOp::Finalize, unmasked, 0);
    let wrong = SigStruct::new([0u8; 32], b"test signer");
    assert!(handle
        .init(&wrong, &EinitToken::for_sigstruct(&wrong), None)
        .is_err());
    assert_eq!(handle.status(), EnclaveStatus::Alive);

    intr.clear();
    handle.init(&sigstruct, &token, Some(&intr)).unwrap();
    assert!(handle.identity().is_some());
}

#[test]
fn test_process_exit() {
    let env = Env::new(config(64));
    let handle = build(&env, 3, 1, false);
    handle.fault(addr(0), false).unwrap();

    env.mm.exit();
    assert_eq!(handle.status(), EnclaveStatus::Dead);
    assert_eq!(errno(handle.fault(addr(0), false)), EpcErrorNum::ENOTRECOVERABLE);
    assert_eq!(
        errno(handle.add_page(addr(5), &pattern(5), rw(), 0)),
        EpcErrorNum::ENOTRECOVERABLE
    );
    assert!(handle.isolate_pages(16).is_empty());

    drop(handle);
    assert_eq!(env.nr_free(), 64);
    assert_eq!(env.system.allocator().nr_va_pages(), 0);
    assert_eq!(env.encls.nr_valid_pages(), 0);
    assert_eq!(env.system.registry().nr_enclaves(), 0);
}

#[test]
fn test_debug_access() {
    let env = Env::new(config(64));
    let handle = build(&env, 3, 1, false);
    let mut buf = [0u8; 8];
    assert_eq!(errno(handle.debug_read(addr(0), &mut buf)), EpcErrorNum::EPERM);

    let handle = build_at(&env, BASE + 0x10_0000, 16, 3, 1, true);
    let base = handle.base();
    // unaligned, across a page boundary
    let at = base + 2 * PAGE_SIZE - 3;
    handle.debug_write(at, b"abcdef").unwrap();
    let mut buf = [0u8; 10];
    handle.debug_read(at - 2, &mut buf).unwrap();
    assert_eq!(&buf[2..8], b"abcdef");
    assert_eq!(buf[0], pattern(1)[PAGE_SIZE - 5]);
    assert_eq!(buf[9], pattern(2)[4]);

    let tcs = base + 3 * PAGE_SIZE;
    let mut word = [0u8; 4];
    handle.debug_read(tcs + 64, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 0xfff);
    assert_eq!(errno(handle.debug_write(tcs, &[1])), EpcErrorNum::EFAULT);
    assert_eq!(
        errno(handle.debug_read(base + 16 * PAGE_SIZE - 4, &mut buf)),
        EpcErrorNum::EFAULT
    );

    let inner = handle.lock();
    assert!(inner.pages.values().all(|page| !page.is_reserved()));
}

#[test]
fn test_suspend_resume() {
    let env = Env::new(config(64));
    let handle = build(&env, 2, 1, false);
    env.system.handle_fault(TGID, addr(1), true).unwrap();

    env.system.suspend_all();
    assert_eq!(handle.status(), EnclaveStatus::Lost);
    assert!(env.mm.translate(addr(1)).is_none());
    assert_eq!(
        errno(env.system.handle_fault(TGID, addr(1), false)),
        EpcErrorNum::EINTR
    );

    env.system.resume_all();
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    env.system.handle_fault(TGID, addr(1), false).unwrap();
    assert!(env.mm.translate(addr(1)).is_some());
}

#[test]
fn test_kick_on_not_tracked() {
    let env = Env::new(config(64));
    let handle = build(&env, 3, 1, false);
    let call = handle.enter(addr(3)).unwrap();
    let evicts = env.encls.op_count(EnclsOp::Evict);

    evict_all(&handle);
    // the TCS is pinned by the running thread
    assert_eq!(handle.nr_resident(), 1);
    assert!(handle.is_resident(addr(3)));
    assert!(!handle.flags().contains(EnclaveFlags::SECS_EVICTED));
    assert_eq!(env.encls.op_count(EnclsOp::Evict) - evicts, 3 + 1);

    let mut buf = [0u8; 4];
    call.read(addr(2), &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(2)[..4]);
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    drop(call);
    check_exclusive(&env, &handle);
}

#[test]
fn test_concurrent_access_with_reclaimer() {
    let mut config = EpcConfig::with_pages(8);
    config.low_pages = 2;
    config.high_pages = 4;
    config.swap_cluster = 2;
    let env = Env::new(config);
    let handle = build(&env, 6, 0, true);

    let threads: Vec<_> = (0..3)
        .map(|t| {
            let handle = handle.clone();
            thread::spawn(move || {
                for round in 0..50u8 {
                    for i in [t, t + 3] {
                        let at = addr(i) + 8 * round as usize;
                        let val = [round, t as u8, i as u8];
                        handle.debug_write(at, &val).unwrap();
                        let mut back = [0u8; 3];
                        handle.debug_read(at, &mut back).unwrap();
                        assert_eq!(back, val);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    check_exclusive(&env, &handle);
    env.system.stop();
    assert!(!env.system.reclaimer().is_running());
}

#[test]
fn test_round_robin_uneven_processes() {
    let env = Env::new(config(128));
    let other = Env {
        encls: env.encls.clone(),
        system: env.system.clone(),
        mm: AddressSpace::new(TGID + 1),
    };
    let mut ids = HashSet::new();
    let mut handles = Vec::new();
    for i in 0..3 {
        let handle = build_at(&env, BASE + i * 0x10_0000, 16, 2, 0, false);
        ids.insert(handle.id());
        handles.push(handle);
    }
    let lone = build(&other, 2, 0, false);
    ids.insert(lone.id());

    let registry = env.system.registry();
    let order: Vec<u64> = (0..12)
        .map(|_| registry.isolate().unwrap().id())
        .collect();
    for pass in order.chunks(4) {
        assert_eq!(pass.iter().copied().collect::<HashSet<_>>(), ids);
    }
    // consecutive windows too, not only aligned passes
    for window in order.windows(4) {
        assert_eq!(window.iter().collect::<HashSet<_>>().len(), 4);
    }
}

#[test]
fn test_add_rejected_while_initializing() {
    let mut config = config(64);
    config.einit_spin_count = 1;
    config.einit_sleep_count = 2;
    config.einit_sleep_time = Duration::from_millis(50);
    let env = Env::new(config);
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    builder.add(&handle, 0, &pattern(0), rw()).unwrap();
    handle.wait_for_adds().unwrap();
    env.encls.inject_failure(
        EnclsOp::Finalize,
        EnclsError::Code(SgxErrorCode::UnmaskedEvent),
        2,
    );

    let sigstruct = builder.sigstruct();
    let start = Instant::now();
    let init = {
        let handle = handle.clone();
        thread::spawn(move || {
            let token = EinitToken::for_sigstruct(&sigstruct);
            handle.init(&sigstruct, &token, None)
        })
    };
    while env.encls.op_count(EnclsOp::Finalize) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        errno(handle.add_page(addr(1), &pattern(1), rw(), 0xffff)),
        EpcErrorNum::EINVAL
    );
    assert_eq!(errno(builder.init(&handle)), EpcErrorNum::EBUSY);
    // wakeups do not cut the sleep short
    for _ in 0..20 {
        handle.notify();
        thread::sleep(Duration::from_millis(1));
    }
    init.join().unwrap().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(env.encls.op_count(EnclsOp::Finalize), 3);
    assert!(handle.is_initialized());
    assert!(!handle.flags().contains(EnclaveFlags::INITIALIZING));
    assert!(!handle.lock().pages.contains_key(&addr(1)));
    assert_eq!(handle.lock().va_reserved, 2);
    assert_eq!(handle.identity().unwrap().mr_enclave, builder.sigstruct().enclave_hash);
}

#[test]
fn test_init_interrupted_while_sleeping() {
    let mut config = config(64);
    config.einit_spin_count = 1;
    config.einit_sleep_count = 1;
    config.einit_sleep_time = Duration::from_secs(10);
    let env = Env::new(config);
    let unmasked = EnclsError::Code(SgxErrorCode::UnmaskedEvent);
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    builder.add(&handle, 0, &pattern(0), rw()).unwrap();
    env.encls.inject_failure(EnclsOp::Finalize, unmasked, 1000);

    let intr = Arc::new(Interrupt::new());
    let sigstruct = builder.sigstruct();
    let start = Instant::now();
    let init = {
        let handle = handle.clone();
        let intr = intr.clone();
        thread::spawn(move || {
            let token = EinitToken::for_sigstruct(&sigstruct);
            handle.init(&sigstruct, &token, Some(&*intr))
        })
    };
    while env.encls.op_count(EnclsOp::Finalize) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(5));
    intr.raise();
    assert_eq!(errno(init.join().unwrap()), EpcErrorNum::ERESTART);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(env.encls.op_count(EnclsOp::Finalize), 1);
    assert_eq!(handle.status(), EnclaveStatus::Alive);

    // pages can be added again after an aborted EINIT
    env.encls.inject_failure(EnclsOp::Finalize, unmasked, 0);
    builder.add(&handle, 1, &pattern(1), rw()).unwrap();
    builder.init(&handle).unwrap();
    assert!(handle.is_resident(addr(1)));
}

#[test]
fn test_add_out_of_epc_keeps_enclave() {
    let mut config = config(4);
    config.sync_reclaim_retries = 2;
    let env = Env::new(config);
    // SECS and VA page of two enclaves fill the pool
    let other = Builder::new(BASE + 0x10_0000, 8, false).create(&env);
    let mut builder = Builder::new(BASE, 8, false);
    let handle = builder.create(&env);
    assert_eq!(env.nr_free(), 0);

    handle.add_page(addr(0), &pattern(0), rw(), 0xffff).unwrap();
    handle.add_page(addr(1), &pattern(1), rw(), 0xffff).unwrap();
    let err = handle.wait_for_adds().unwrap_err();
    assert_eq!(err.num(), EpcErrorNum::EBUSY);
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(handle.status(), EnclaveStatus::Alive);
    assert!(handle.lock().pages.is_empty());
    assert_eq!(handle.lock().va_reserved, 1);
    assert_eq!(handle.refcount(), 1);
    // reported once
    handle.wait_for_adds().unwrap();

    drop(other);
    assert_eq!(env.nr_free(), 2);
    builder.add(&handle, 0, &pattern(0), rw()).unwrap();
    builder.init(&handle).unwrap();
    assert!(handle.is_resident(addr(0)));
    check_exclusive(&env, &handle);
}

#[test]
fn test_add_failure_kills_enclave() {
    let env = Env::new(config(64));
    let handle = Builder::new(BASE, 8, false).create(&env);
    env.encls.inject_failure(EnclsOp::Add, EnclsError::Code(SgxErrorCode::PgInvld), 1);
    handle.add_page(addr(0), &pattern(0), rw(), 0xffff).unwrap();
    for i in 1..4 {
        // the worker may already have failed the first page
        if let Err(e) = handle.add_page(addr(i), &pattern(i as u8), rw(), 0xffff) {
            assert_eq!(e.num(), EpcErrorNum::ENOTRECOVERABLE);
        }
    }
    assert_eq!(errno(handle.wait_for_adds()), EpcErrorNum::ENOTRECOVERABLE);
    assert_eq!(handle.status(), EnclaveStatus::Dead);
    assert_eq!(handle.nr_resident(), 0);
    // queued requests released their references
    assert_eq!(handle.refcount(), 1);
    assert_eq!(env.mm.nr_mapped(handle.elrange().clone()), 0);

    drop(handle);
    assert_eq!(env.nr_free(), 64);
    assert_eq!(env.encls.nr_valid_pages(), 0);
    assert_eq!(env.system.registry().nr_enclaves(), 0);
}

#[test]
fn test_write_back_failure_kills_enclave() {
    for op in [EnclsOp::Block, EnclsOp::Track, EnclsOp::Evict] {
        let env = Env::new(config(64));
        let handle = build(&env, 3, 1, false);
        handle.fault(addr(0), false).unwrap();
        assert!(env.mm.nr_mapped(handle.elrange().clone()) > 0);

        env.encls.inject_failure(op, EnclsError::Code(SgxErrorCode::PgInvld), 1);
        let mut victims = handle.isolate_pages(usize::MAX);
        if victims.is_empty() {
            victims = handle.isolate_pages(usize::MAX);
        }
        assert!(!victims.is_empty(), "{:?}", op);
        assert_eq!(handle.write_pages(&victims), 0, "{:?}", op);

        assert_eq!(handle.status(), EnclaveStatus::Dead, "{:?}", op);
        assert_eq!(handle.nr_resident(), 0);
        assert_eq!(env.mm.nr_mapped(handle.elrange().clone()), 0);
        assert!(handle
            .lock()
            .pages
            .values()
            .all(|page| page.paddr().is_none() && !page.flags.contains(EnclPageFlags::RESERVED)));
        assert_eq!(errno(handle.fault(addr(0), false)), EpcErrorNum::ENOTRECOVERABLE);

        drop(handle);
        assert_eq!(env.nr_free(), 64, "{:?}", op);
        assert_eq!(env.encls.nr_valid_pages(), 0, "{:?}", op);
    }
}

#[test]
fn test_secs_reload_failure_kills_enclave() {
    let env = Env::new(config(64));
    let handle = build(&env, 2, 1, false);
    evict_all(&handle);
    assert!(handle.flags().contains(EnclaveFlags::SECS_EVICTED));

    env.encls.inject_failure(
        EnclsOp::Reload,
        EnclsError::Code(SgxErrorCode::MacCompareFail),
        1,
    );
    assert_eq!(errno(handle.fault(addr(0), false)), EpcErrorNum::EBADMSG);
    assert_eq!(handle.status(), EnclaveStatus::Dead);
    assert_eq!(errno(handle.fault(addr(1), false)), EpcErrorNum::ENOTRECOVERABLE);
    assert_eq!(env.system.allocator().nr_va_pages(), 0);

    drop(handle);
    assert_eq!(env.nr_free(), 64);
    assert_eq!(env.encls.nr_valid_pages(), 0);
}

#[test]
fn test_reset_stats() {
    let env = Env::new(config(64));
    let handle = build(&env, 3, 1, false);
    evict_all(&handle);
    assert_eq!(handle.stats_count(EnclaveStatsId::AddPage), 4);
    assert!(handle.stats_count(EnclaveStatsId::WriteBack) > 0);

    handle.reset_stats();
    for id in EnclaveStatsId::ALL.iter() {
        assert_eq!(handle.stats_count(*id), 0, "{:?}", id);
    }
    handle.fault(addr(0), false).unwrap();
    assert_eq!(handle.stats_count(EnclaveStatsId::Reload), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Read(usize),
    Write(usize, u8),
    Swap,
    Fault(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..6usize).prop_map(Op::Read),
        (0..6usize, any::<u8>()).prop_map(|(i, v)| Op::Write(i, v)),
        Just(Op::Swap),
        (0..6usize).prop_map(Op::Fault),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_pages_owned_once(ops in prop::collection::vec(op(), 1..40)) {
        let env = Env::new(config(6));
        let handle = build(&env, 6, 0, true);
        let mut model: Vec<u8> = (0..6).map(|i| pattern(i as u8)[0]).collect();

        for op in ops {
            match op {
                Op::Read(i) => {
                    let mut b = [0u8; 1];
                    handle.debug_read(addr(i), &mut b).unwrap();
                    prop_assert_eq!(b[0], model[i]);
                }
                Op::Write(i, v) => {
                    handle.debug_write(addr(i), &[v]).unwrap();
                    model[i] = v;
                }
                Op::Swap => {
                    env.system.allocator().swap_pages();
                }
                Op::Fault(i) => {
                    handle.fault(addr(i), false).unwrap();
                }
            }
            check_exclusive(&env, &handle);
            let secs = !handle.flags().contains(EnclaveFlags::SECS_EVICTED) as usize;
            prop_assert_eq!(env.nr_free() + handle.nr_resident() + secs + 1, 6);
        }
        prop_assert_eq!(handle.status(), EnclaveStatus::Alive);
    }
}
