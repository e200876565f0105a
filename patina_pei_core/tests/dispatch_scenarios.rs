//! PEI Core Dispatch Integration Tests
//!
//! Boots the core on host memory with firmware volumes built in memory. PEIMs are plain functions registered with
//! the [`StaticImageLoader`]; they record what they observe through the per-thread recorder in `common`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
mod common;

use core::{ffi::c_void, mem::size_of, slice};

use common::{events, guid, peim, permanent_memory, record, requires, Platform};
use patina_internal_pei_depex::Depex;
use patina_pei::{
    error::{EfiError, Result},
    pi::{
        ppi::{DxeIplPpi, NotifyDescriptor, PpiDescriptor, DXE_IPL_PPI_GUID, MEMORY_DISCOVERED_PPI_GUID},
        status_code::{
            EfiStatusCodeType, EfiStatusCodeValue, EFI_SOFTWARE_PEI_CORE, EFI_SW_PEI_CORE_EC_DXEIPL_NOT_FOUND,
            EFI_SW_PEI_CORE_EC_MEMORY_NOT_INSTALLED,
        },
    },
    services::{FileHandle, PeiServices, PeimEntryPoint},
};
use patina_pei_core::{Core, StaticImageLoader, StatusCodeReporter};
use patina_pei_ffs::builder::VolumeBuilder;
use r_efi::efi;

static G1: efi::Guid = guid(0x61);
static G2: efi::Guid = guid(0x62);
static G3: efi::Guid = guid(0x63);
static HEAP_PPI: efi::Guid = guid(0x64);

static IFACE_A: u32 = 0xA;
static IFACE_B: u32 = 0xB;
static IFACE_C: u32 = 0xC;

const fn iface(value: &'static u32) -> *mut c_void {
    value as *const u32 as *mut c_void
}

fn read(ppi: *mut c_void) -> u32 {
    unsafe { (ppi as *const u32).read_unaligned() }
}

static G1_A: [PpiDescriptor; 1] = [PpiDescriptor::new(&G1, iface(&IFACE_A)).terminate()];
static G1_B: [PpiDescriptor; 1] = [PpiDescriptor::new(&G1, iface(&IFACE_B)).terminate()];
static G1_C: [PpiDescriptor; 1] = [PpiDescriptor::new(&G1, iface(&IFACE_C)).terminate()];
static G2_A: [PpiDescriptor; 1] = [PpiDescriptor::new(&G2, iface(&IFACE_A)).terminate()];
static G3_A: [PpiDescriptor; 1] = [PpiDescriptor::new(&G3, iface(&IFACE_A)).terminate()];

fn on_g1(_: &mut dyn PeiServices, _: &NotifyDescriptor, ppi: *mut c_void) -> Result<()> {
    record(format!("notify {:#x}", read(ppi)));
    Ok(())
}

static G1_CALLBACK: [NotifyDescriptor; 1] = [NotifyDescriptor::callback(&G1, on_g1).terminate()];

/// Records the name of the PEIM and installs nothing.
macro_rules! recording_peim {
    ($name:ident) => {
        fn $name(_: FileHandle, _: &mut dyn PeiServices) -> Result<()> {
            record(stringify!($name));
            Ok(())
        }
    };
    ($name:ident, $ppi_list:expr) => {
        fn $name(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
            record(stringify!($name));
            services.install_ppi(&$ppi_list)
        }
    };
}

fn boot(volume: VolumeBuilder, loader: StaticImageLoader) -> (Platform, patina_pei_core::CoreInstance) {
    let platform = Platform::new(volume.build());
    let core = Core::default().with_image_loader(loader).initialize(&platform.sec_core_data(), None).unwrap();
    (platform, core)
}

// Scenario A: a notify registered after the install fires once, synchronously, with the installed interface.

const SCENARIO_A: efi::Guid = guid(0xA0);

fn install_then_notify(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    services.install_ppi(&G1_A)?;
    record("installed");
    services.notify_ppi(&G1_CALLBACK)?;
    record("notify registered");
    Ok(())
}

#[test]
fn scenario_a_notify_after_install_fires_inside_notify_ppi() {
    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(SCENARIO_A, None)),
        StaticImageLoader::new().with_peim(SCENARIO_A, install_then_notify),
    );
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["installed", "notify 0xa", "notify registered"]);
}

// Scenario B: a notify registered before the install fires once, during the install call.

const SCENARIO_B: efi::Guid = guid(0xB0);

fn notify_then_install(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    services.notify_ppi(&G1_CALLBACK)?;
    record("notify registered");
    services.install_ppi(&G1_A)?;
    record("installed");
    Ok(())
}

#[test]
fn scenario_b_notify_before_install_fires_inside_install_ppi() {
    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(SCENARIO_B, None)),
        StaticImageLoader::new().with_peim(SCENARIO_B, notify_then_install),
    );
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["notify registered", "notify 0xa", "installed"]);
}

// Scenario C: PUSH(G1) PUSH(G2) AND turns true once both are installed.

const NEEDS_BOTH: efi::Guid = guid(0xC0);
const GIVES_G1: efi::Guid = guid(0xC1);
const GIVES_G2: efi::Guid = guid(0xC2);

recording_peim!(needs_both);
recording_peim!(gives_g1, G1_A);
recording_peim!(gives_g2, G2_A);

#[test]
fn scenario_c_and_expression_is_reevaluated() {
    let expression = Depex::from(requires(&[G1, G2]));
    assert_eq!(expression.eval(|guid| *guid == G1), Ok(false));
    assert_eq!(expression.eval(|guid| *guid == G1 || *guid == G2), Ok(true));

    let (_platform, core) = boot(
        VolumeBuilder::new()
            .with_file(peim(NEEDS_BOTH, Some(requires(&[G1, G2]))))
            .with_file(peim(GIVES_G1, None))
            .with_file(peim(GIVES_G2, Some(requires(&[G1])))),
        StaticImageLoader::new()
            .with_peim(NEEDS_BOTH, needs_both)
            .with_peim(GIVES_G1, gives_g1)
            .with_peim(GIVES_G2, gives_g2),
    );
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["gives_g1", "gives_g2", "needs_both"]);
}

// Scenario D: M2 depends on a PPI only M1 installs; one dispatch call runs both.

const M1: efi::Guid = guid(0xD1);
const M2: efi::Guid = guid(0xD2);

recording_peim!(m1, G1_A);
recording_peim!(m2);

#[test]
fn scenario_d_dispatch_continues_to_fixed_point() {
    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(M2, Some(requires(&[G1])))).with_file(peim(M1, None)),
        StaticImageLoader::new().with_peim(M1, m1).with_peim(M2, m2),
    );
    let core = core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["m1", "m2"]);
    assert_eq!(core.dispatched_peims(), [M2, M1]);
}

// Scenario E: migration after three PEIMs ran, with two pending on PPIs that only appear afterwards.

const E_WAITS_FOR_MEMORY: efi::Guid = guid(0xE1);
const E_WAITS_FOR_G3: efi::Guid = guid(0xE2);
const E_FIRST: efi::Guid = guid(0xE3);
const E_SECOND: efi::Guid = guid(0xE4);
const E_MEMORY: efi::Guid = guid(0xE5);

/// Installs two instances of a PPI whose descriptors and interfaces live in the HOB heap.
fn e_first(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    record("e_first");
    for value in [0xFEED_u32, 0xBEEF] {
        let interface = services.allocate_pool(size_of::<u32>())? as *mut u32;
        let descriptor = services.allocate_pool(size_of::<PpiDescriptor>())? as *mut PpiDescriptor;
        unsafe {
            interface.write_unaligned(value);
            descriptor.write_unaligned(PpiDescriptor::new(&HEAP_PPI, interface as *mut c_void).terminate());
            services.install_ppi(slice::from_raw_parts(descriptor, 1))?;
        }
    }
    Ok(())
}

recording_peim!(e_second);

fn e_memory(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    record("e_memory");
    let (base, length) = permanent_memory();
    services.install_pei_memory(base, length)
}

fn e_waits_for_memory(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    let (base, length) = permanent_memory();
    let hob_list = services.get_hob_list()? as u64;
    assert!(hob_list >= base && hob_list < base + length);
    record("e_waits_for_memory");
    services.install_ppi(&G3_A)
}

fn dxe_ipl_entry(_: &DxeIplPpi, _: &mut dyn PeiServices, hob_list: *const c_void) -> Result<()> {
    let (base, length) = permanent_memory();
    assert!((hob_list as u64) >= base && (hob_list as u64) < base + length);
    record("dxe ipl");
    Ok(())
}

static DXE_IPL: DxeIplPpi = DxeIplPpi { entry: dxe_ipl_entry };
static DXE_IPL_LIST: [PpiDescriptor; 1] =
    [PpiDescriptor::new(&DXE_IPL_PPI_GUID, &DXE_IPL as *const DxeIplPpi as *mut c_void).terminate()];

fn e_waits_for_g3(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    let (base, length) = permanent_memory();
    let values = (0..2)
        .map(|instance| {
            let located = services.locate_ppi(&HEAP_PPI, instance)?;
            assert!((located.ppi as u64) >= base && (located.ppi as u64) < base + length);
            Ok(read(located.ppi))
        })
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(services.locate_ppi(&HEAP_PPI, 2).err(), Some(EfiError::NotFound));
    record(format!("e_waits_for_g3 {:#x} {:#x}", values[0], values[1]));
    services.install_ppi(&DXE_IPL_LIST)
}

fn scenario_e_boot() -> (Platform, patina_pei_core::CoreInstance) {
    boot(
        VolumeBuilder::new()
            .with_file(peim(E_WAITS_FOR_MEMORY, Some(requires(&[MEMORY_DISCOVERED_PPI_GUID]))))
            .with_file(peim(E_WAITS_FOR_G3, Some(requires(&[G3]))))
            .with_file(peim(E_FIRST, None))
            .with_file(peim(E_SECOND, None))
            .with_file(peim(E_MEMORY, None)),
        StaticImageLoader::new()
            .with_peim(E_WAITS_FOR_MEMORY, e_waits_for_memory)
            .with_peim(E_WAITS_FOR_G3, e_waits_for_g3)
            .with_peim(E_FIRST, e_first)
            .with_peim(E_SECOND, e_second)
            .with_peim(E_MEMORY, e_memory),
    )
}

#[test]
fn scenario_e_migration_restarts_dispatch_without_rerunning_peims() {
    let (_platform, core) = scenario_e_boot();
    assert!(!core.is_running_from_permanent_memory());

    let core = core.dispatch_until_quiescent().unwrap();
    assert!(core.is_running_from_permanent_memory());
    assert_eq!(
        events(),
        ["e_first", "e_second", "e_memory", "e_waits_for_memory", "e_waits_for_g3 0xfeed 0xbeef"]
    );
    assert_eq!(core.dispatched_peims().len(), 5);

    // Hand-off runs the dispatcher once more; nothing runs twice.
    core.start().unwrap();
    assert_eq!(events(), ["dxe ipl"]);
}

// P1: each PEIM runs at most once, whatever order the volume lists a dependency chain in.

const CHAIN: [efi::Guid; 4] = [guid(0x71), guid(0x72), guid(0x73), guid(0x74)];
static CHAIN_PPIS: [efi::Guid; 4] = [guid(0x81), guid(0x82), guid(0x83), guid(0x84)];
static CHAIN_LISTS: [[PpiDescriptor; 1]; 4] = [
    [PpiDescriptor::new(&CHAIN_PPIS[0], iface(&IFACE_A)).terminate()],
    [PpiDescriptor::new(&CHAIN_PPIS[1], iface(&IFACE_A)).terminate()],
    [PpiDescriptor::new(&CHAIN_PPIS[2], iface(&IFACE_A)).terminate()],
    [PpiDescriptor::new(&CHAIN_PPIS[3], iface(&IFACE_A)).terminate()],
];

recording_peim!(chain_0, CHAIN_LISTS[0]);
recording_peim!(chain_1, CHAIN_LISTS[1]);
recording_peim!(chain_2, CHAIN_LISTS[2]);
recording_peim!(chain_3, CHAIN_LISTS[3]);

fn permutations(items: Vec<usize>) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items];
    }
    let mut result = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let mut rest = items.clone();
        rest.remove(index);
        for mut tail in permutations(rest) {
            tail.insert(0, *item);
            result.push(tail);
        }
    }
    result
}

#[test]
fn p1_and_p4_every_volume_order_runs_the_chain_once_in_dependency_order() {
    let entries: [PeimEntryPoint; 4] = [chain_0, chain_1, chain_2, chain_3];
    for order in permutations((0..4).collect()) {
        let mut volume = VolumeBuilder::new();
        for index in &order {
            let depex = (*index > 0).then(|| requires(&[CHAIN_PPIS[index - 1]]));
            volume = volume.with_file(peim(CHAIN[*index], depex));
        }
        // Never satisfiable: never runs and never fails the dispatch.
        volume = volume.with_file(peim(guid(0x7F), Some(requires(&[guid(0x8F)]))));
        let loader =
            (0..4).fold(StaticImageLoader::new(), |loader, index| loader.with_peim(CHAIN[index], entries[index]));

        let (_platform, core) = boot(volume, loader);
        let core = core.dispatch_until_quiescent().unwrap();
        assert_eq!(events(), ["chain_0", "chain_1", "chain_2", "chain_3"], "volume order {:?}", order);
        assert_eq!(core.dispatched_peims().len(), 4);
        assert!(!core.dispatched_peims().contains(&guid(0x7F)));
    }
}

// P2: every (notify, install) pair with matching GUID fires exactly once.

const P2_PEIM: efi::Guid = guid(0x92);

fn second_g1_notify(_: &mut dyn PeiServices, _: &NotifyDescriptor, ppi: *mut c_void) -> Result<()> {
    record(format!("second {:#x}", read(ppi)));
    Ok(())
}

static SECOND_G1_CALLBACK: [NotifyDescriptor; 1] =
    [NotifyDescriptor::callback(&G1, second_g1_notify).terminate()];

fn interleaved_notifies(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    services.notify_ppi(&G1_CALLBACK)?;
    services.install_ppi(&G1_A)?;
    services.install_ppi(&G2_A)?;
    services.install_ppi(&G1_B)?;
    services.notify_ppi(&SECOND_G1_CALLBACK)?;
    services.install_ppi(&G1_C)
}

#[test]
fn p2_notifies_fire_once_per_matching_install() {
    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(P2_PEIM, None)),
        StaticImageLoader::new().with_peim(P2_PEIM, interleaved_notifies),
    );
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(
        events(),
        ["notify 0xa", "notify 0xb", "second 0xa", "second 0xb", "notify 0xc", "second 0xc"]
    );
}

// P3: the evaluator matches direct interpretation, and rejects malformed expressions.

#[derive(Debug, Clone)]
enum Expr {
    Ppi(efi::Guid),
    Literal(bool),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn interpret(&self, installed: &[efi::Guid]) -> bool {
        match self {
            Expr::Ppi(guid) => installed.contains(guid),
            Expr::Literal(value) => *value,
            Expr::Not(inner) => !inner.interpret(installed),
            Expr::And(left, right) => left.interpret(installed) && right.interpret(installed),
            Expr::Or(left, right) => left.interpret(installed) || right.interpret(installed),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        use common::depex::*;
        match self {
            Expr::Ppi(guid) => {
                out.push(PUSH);
                out.extend_from_slice(guid.as_bytes());
            }
            Expr::Literal(value) => out.push(if *value { TRUE } else { FALSE }),
            Expr::Not(inner) => {
                inner.encode(out);
                out.push(NOT);
            }
            Expr::And(left, right) => {
                left.encode(out);
                right.encode(out);
                out.push(AND);
            }
            Expr::Or(left, right) => {
                left.encode(out);
                right.encode(out);
                out.push(OR);
            }
        }
    }
}

fn expressions(depth: usize) -> Vec<Expr> {
    let mut all = vec![Expr::Ppi(G1), Expr::Ppi(G2), Expr::Literal(true), Expr::Literal(false)];
    if depth == 0 {
        return all;
    }
    let smaller = expressions(depth - 1);
    for left in &smaller {
        all.push(Expr::Not(Box::new(left.clone())));
        for right in &smaller {
            all.push(Expr::And(Box::new(left.clone()), Box::new(right.clone())));
            all.push(Expr::Or(Box::new(left.clone()), Box::new(right.clone())));
        }
    }
    all
}

#[test]
fn p3_evaluator_matches_direct_interpretation() {
    let oracles: [&[efi::Guid]; 4] = [&[], &[G1], &[G2], &[G1, G2]];
    for expression in expressions(1) {
        let mut bytes = Vec::new();
        expression.encode(&mut bytes);
        bytes.push(common::depex::END);
        let depex = Depex::from(bytes);
        for installed in oracles {
            assert_eq!(
                depex.eval(|guid| installed.contains(guid)),
                Ok(expression.interpret(installed)),
                "{:?} with {} installed",
                expression,
                installed.len()
            );
        }
    }
}

#[test]
fn p3_malformed_expressions_are_rejected_and_peim_never_runs() {
    use common::depex::*;
    let malformed: [Vec<u8>; 5] =
        [vec![AND, END], vec![TRUE, TRUE, END], vec![0x42, END], vec![PUSH, 0x01, 0x02, 0x03], vec![TRUE]];
    for bytes in &malformed {
        assert!(Depex::from(bytes.clone()).eval(|_| true).is_err(), "{:02x?}", bytes);
    }

    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(NEEDS_BOTH, Some(vec![TRUE, TRUE, END]))),
        StaticImageLoader::new().with_peim(NEEDS_BOTH, needs_both),
    );
    let core = core.dispatch_until_quiescent().unwrap();
    assert!(events().is_empty());
    assert!(core.dispatched_peims().is_empty());
}

// P5: located PPIs keep their payload and order across migration, dispatched PEIMs stay dispatched.

#[test]
fn p5_migration_preserves_ppis_and_dispatched_set() {
    let (_platform, core) = scenario_e_boot();
    let core = core.dispatch_until_quiescent().unwrap();
    let dispatched = core.dispatched_peims();
    assert!(dispatched.contains(&E_FIRST) && dispatched.contains(&E_SECOND) && dispatched.contains(&E_MEMORY));
    assert!(events().contains(&"e_waits_for_g3 0xfeed 0xbeef".to_string()));
}

// P6: reinstall keeps the slot position; unrelated installs do not shift instances.

const P6_PEIM: efi::Guid = guid(0x96);
static IFACE_D: u32 = 0xD;
static G1_D: PpiDescriptor = PpiDescriptor::new(&G1, iface(&IFACE_D)).terminate();

fn reinstall_in_place(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
    services.install_ppi(&G1_A)?;
    services.install_ppi(&G2_A)?;
    services.install_ppi(&G1_B)?;
    let g2_before = services.locate_ppi(&G2, 0)?;

    services.reinstall_ppi(&G1_A[0], &G1_D)?;
    assert_eq!(read(services.locate_ppi(&G1, 0)?.ppi), 0xD);
    assert_eq!(read(services.locate_ppi(&G1, 1)?.ppi), 0xB);
    assert_eq!(services.locate_ppi(&G1, 0)?.descriptor, &G1_D as *const PpiDescriptor);

    services.install_ppi(&G3_A)?;
    assert_eq!(services.locate_ppi(&G2, 0)?, g2_before);
    assert_eq!(services.reinstall_ppi(&G1_A[0], &G1_D), Err(EfiError::NotFound));
    record("checked");
    Ok(())
}

#[test]
fn p6_reinstall_preserves_order() {
    let (_platform, core) = boot(
        VolumeBuilder::new().with_file(peim(P6_PEIM, None)),
        StaticImageLoader::new().with_peim(P6_PEIM, reinstall_in_place),
    );
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["checked"]);
}

// Hand-off failures are reported and returned.

struct RecordingReporter;

impl StatusCodeReporter for RecordingReporter {
    fn report(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        _: u32,
        _: Option<efi::Guid>,
        _: &[u8],
    ) -> Result<()> {
        record(format!("status {:#x} {:#x}", code_type, value));
        Ok(())
    }
}

fn status(events: &[String], value: EfiStatusCodeValue) -> bool {
    events.iter().any(|event| event.starts_with("status 0x90000002") && event.ends_with(&format!("{:#x}", value)))
}

#[test]
fn start_without_permanent_memory_is_fatal() {
    let platform = Platform::new(VolumeBuilder::new().build());
    let core =
        Core::default().with_status_code_reporter(RecordingReporter).initialize(&platform.sec_core_data(), None);
    assert_eq!(core.and_then(|core| core.start()), Err(EfiError::DeviceError));
    assert!(status(&events(), EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_EC_MEMORY_NOT_INSTALLED));
}

#[test]
fn start_without_dxe_ipl_is_fatal() {
    let platform = Platform::new(VolumeBuilder::new().with_file(peim(E_MEMORY, None)).build());
    let core = Core::default()
        .with_image_loader(StaticImageLoader::new().with_peim(E_MEMORY, e_memory))
        .with_status_code_reporter(RecordingReporter)
        .initialize(&platform.sec_core_data(), None);
    assert_eq!(core.and_then(|core| core.start()), Err(EfiError::NotFound));
    assert!(status(&events(), EFI_SOFTWARE_PEI_CORE | EFI_SW_PEI_CORE_EC_DXEIPL_NOT_FOUND));
}

#[test]
fn sec_ppis_are_visible_to_the_first_peim() {
    fn sees_sec_ppi(_: FileHandle, services: &mut dyn PeiServices) -> Result<()> {
        record(format!("sec ppi {:#x}", read(services.locate_ppi(&G2, 0)?.ppi)));
        Ok(())
    }

    let platform = Platform::new(VolumeBuilder::new().with_file(peim(M2, Some(requires(&[G2])))).build());
    let core = Core::default()
        .with_image_loader(StaticImageLoader::new().with_peim(M2, sees_sec_ppi))
        .initialize(&platform.sec_core_data(), Some(&G2_A))
        .unwrap();
    core.dispatch_until_quiescent().unwrap();
    assert_eq!(events(), ["sec ppi 0xa"]);
}
