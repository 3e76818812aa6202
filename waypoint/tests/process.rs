/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Forked-tracee integration tests for the process controller.
//!
//! Children are either real executables launched under trace (launched
//! tracees run with ASLR disabled, so code addresses repeat across runs and
//! can be discovered by a scout run) or forked copies of the test binary
//! that spin on shared statics until the debugger releases them.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use waypoint::disassemble;
use waypoint::Errno;
use waypoint::Error;
use waypoint::HardwareStopPointRef;
use waypoint::LaunchStep;
use waypoint::Pid;
use waypoint::Process;
use waypoint::ProcessState;
use waypoint::RegisterId;
use waypoint::RegisterValue;
use waypoint::StopPoint;
use waypoint::StopPointMode;
use waypoint::TrapKind;
use waypoint::VirtAddr;

/// Forks a child that runs `body` and exits.
fn fork_child<F: FnOnce()>(body: F) -> Pid {
    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            // Suppress core dumps; some children die by signal on purpose.
            let limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
            body();
            unsafe { libc::_exit(0) }
        }
    }
}

/// Kills and reaps a forked child when the test is done with it.
struct ChildGuard(Pid);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = signal::kill(self.0, Signal::SIGKILL);
        let _ = waitpid(self.0, None);
    }
}

fn launch(path: &str) -> Process {
    Process::launch(Path::new(path), true, None).unwrap()
}

fn spin_forever() {
    loop {
        std::hint::spin_loop();
    }
}

fn addr_of(value: &AtomicU64) -> VirtAddr {
    VirtAddr::new(value as *const AtomicU64 as u64)
}

#[test]
fn launch_runs_to_exit() {
    let mut process = launch("/bin/true");
    assert_eq!(process.state(), ProcessState::Stopped);

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Exited);
    assert_eq!(reason.info, 0);
    assert_eq!(process.state(), ProcessState::Exited);
}

#[test]
fn launch_reports_child_exec_failure() {
    let err = Process::launch(Path::new("/surely/not/a/real/binary"), true, None).unwrap_err();
    match err {
        Error::Launch { step, errno } => {
            assert_eq!(step, LaunchStep::Exec);
            assert_eq!(errno, Errno::ENOENT);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn dead_tracees_refuse_control() {
    let mut process = launch("/bin/true");
    process.resume().unwrap();
    assert_eq!(
        process.wait_on_signal().unwrap().state,
        ProcessState::Exited
    );

    assert!(process.resume().is_err());
    assert!(process.step_instruction().is_err());
}

#[test]
fn attach_requires_a_real_pid() {
    assert!(Process::attach(Pid::from_raw(0)).is_err());
    assert!(Process::attach(Pid::from_raw(-2)).is_err());
}

#[test]
fn stdout_replacement_captures_output() {
    let (mut reader, writer) = waypoint::pipe().unwrap();
    let mut process =
        Process::launch(Path::new("/bin/echo"), true, Some(writer.as_raw_fd())).unwrap();
    drop(writer);

    process.resume().unwrap();
    assert_eq!(
        process.wait_on_signal().unwrap().state,
        ProcessState::Exited
    );

    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    assert_eq!(out, "\n");
}

#[test]
fn software_breakpoint_hits_and_stays_transparent() {
    // Scout run: walk a few instructions past the exec stop to find a code
    // address the next run has not reached yet.
    let target = {
        let mut scout = launch("/bin/true");
        for _ in 0..4 {
            assert_eq!(
                scout.step_instruction().unwrap().state,
                ProcessState::Stopped
            );
        }
        scout.get_pc()
    };

    let mut process = launch("/bin/true");
    assert_ne!(process.get_pc(), target);
    let original = process.read_memory(target, 1).unwrap()[0];

    let id = process
        .create_breakpoint_site(target, false, false)
        .unwrap()
        .id();
    assert!(id > 0);
    process.enable_breakpoint_site(id).unwrap();

    // The trap byte shows up in raw reads and never in trap-free ones.
    assert_eq!(process.read_memory(target, 1).unwrap(), [0xcc]);
    assert_eq!(
        process.read_memory_without_traps(target, 1).unwrap(),
        [original]
    );

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Stopped);
    assert_eq!(reason.info, Signal::SIGTRAP as u8);
    assert_eq!(reason.trap, Some(TrapKind::SoftwareBreakpoint));
    // The pc points at the breakpoint, not one past the trap byte.
    assert_eq!(process.get_pc(), target);

    // Stepping over the site executes the original instruction and re-arms
    // the trap.
    let reason = process.step_instruction().unwrap();
    assert_eq!(reason.state, ProcessState::Stopped);
    assert_ne!(process.get_pc(), target);
    assert!(process.breakpoint_sites().get_by_id(id).unwrap().is_enabled());
    assert_eq!(process.read_memory(target, 1).unwrap(), [0xcc]);

    // Removal restores the original byte and the tracee runs out clean.
    process.remove_breakpoint_site(id).unwrap();
    assert!(!process.breakpoint_sites().contains_id(id));
    assert_eq!(process.read_memory(target, 1).unwrap(), [original]);

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Exited);
    assert_eq!(reason.info, 0);
}

#[test]
fn disassembler_sees_through_traps() {
    let mut process = launch("/bin/true");
    let pc = process.get_pc();

    let clean = disassemble(&process, Some(pc), 5).unwrap();
    assert_eq!(clean.len(), 5);
    assert_eq!(clean[0].address, pc);
    assert!(clean.windows(2).all(|w| w[1].address > w[0].address));

    // An armed trap at pc must not decode as int3.
    let id = process.create_breakpoint_site(pc, false, false).unwrap().id();
    process.enable_breakpoint_site(id).unwrap();
    let through = disassemble(&process, Some(pc), 5).unwrap();
    assert_eq!(through[0].text, clean[0].text);
    assert_ne!(through[0].text, "int3");
}

#[test]
fn memory_round_trip_and_trap_transparency() {
    static BUFFER: [AtomicU64; 4] = [
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
    ];

    let pid = fork_child(spin_forever);
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();

    let address = addr_of(&BUFFER[0]);
    let payload: Vec<u8> = (0u8..20).collect();
    process.write_memory(address, &payload).unwrap();
    assert_eq!(process.read_memory(address, 20).unwrap(), payload);

    // A write across an armed software trap lands in the saved byte; the
    // trap byte stays put.
    let site_id = process
        .create_breakpoint_site(address + 8, false, false)
        .unwrap()
        .id();
    process.enable_breakpoint_site(site_id).unwrap();

    let payload: Vec<u8> = (100u8..120).collect();
    process.write_memory(address, &payload).unwrap();

    let mut with_trap = payload.clone();
    with_trap[8] = 0xcc;
    assert_eq!(process.read_memory(address, 20).unwrap(), with_trap);
    assert_eq!(
        process.read_memory_without_traps(address, 20).unwrap(),
        payload
    );

    // Disabling restores the freshly written byte, not a stale one.
    process.disable_breakpoint_site(site_id).unwrap();
    assert_eq!(process.read_memory(address, 20).unwrap(), payload);
}

#[test]
fn register_writes_reach_the_tracee() {
    let pid = fork_child(spin_forever);
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();

    process
        .write_register(RegisterId::r13, RegisterValue::U64(0xcafe_babe_1234_5678))
        .unwrap();
    process
        .write_register(RegisterId::xmm0, RegisterValue::Bytes16([0x5a; 16]))
        .unwrap();

    // A single step forces a full register refresh from the kernel, so
    // these reads prove the writes reached the tracee.
    assert_eq!(
        process.step_instruction().unwrap().state,
        ProcessState::Stopped
    );
    assert_eq!(
        process.registers().read_by_id(RegisterId::r13),
        RegisterValue::U64(0xcafe_babe_1234_5678)
    );
    assert_eq!(
        process.registers().read_by_id(RegisterId::xmm0),
        RegisterValue::Bytes16([0x5a; 16])
    );

    // Whole-block general-purpose write-back.
    let mut gprs = *process.registers().gprs();
    gprs.r14 = 0x1020_3040;
    process.write_gprs(gprs).unwrap();
    assert_eq!(
        process.step_instruction().unwrap().state,
        ProcessState::Stopped
    );
    assert_eq!(process.registers().read_u64(RegisterId::r14), 0x1020_3040);

    // Oversized writes fail and leave the register alone.
    let before = process.registers().read_u64(RegisterId::r13);
    let err = process
        .write_register(RegisterId::r13d, RegisterValue::U64(1))
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
    assert_eq!(process.registers().read_u64(RegisterId::r13), before);
}

#[test]
fn resuming_at_a_bad_pc_faults() {
    let pid = fork_child(spin_forever);
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();

    process.set_pc(VirtAddr::new(0x100)).unwrap();
    assert_eq!(process.get_pc(), VirtAddr::new(0x100));

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Stopped);
    assert_eq!(reason.info, Signal::SIGSEGV as u8);
}

#[test]
fn watchpoint_reports_old_and_new_data() {
    static RELEASE: AtomicU64 = AtomicU64::new(0);
    static WATCHED: AtomicU64 = AtomicU64::new(0x1122_3344);

    let pid = fork_child(|| {
        while RELEASE.load(Ordering::Relaxed) == 0 {
            std::hint::spin_loop();
        }
        WATCHED.store(0xfeed_f00d, Ordering::Relaxed);
        unsafe { libc::_exit(7) }
    });
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();

    let id = process
        .create_watchpoint(addr_of(&WATCHED), StopPointMode::Write, 8)
        .unwrap()
        .id();
    process.enable_watchpoint(id).unwrap();
    let watchpoint = process.watchpoints().get_by_id(id).unwrap();
    assert_eq!(watchpoint.data(), Some(0x1122_3344));
    assert_eq!(watchpoint.previous_data(), None);

    // Release the child; its next store must fire the watchpoint.
    process
        .write_memory(addr_of(&RELEASE), &1u64.to_le_bytes())
        .unwrap();
    process.resume().unwrap();

    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Stopped);
    assert_eq!(reason.info, Signal::SIGTRAP as u8);
    assert_eq!(reason.trap, Some(TrapKind::HardwareStopPoint));
    assert_eq!(
        process.current_hardware_stoppoint().unwrap(),
        HardwareStopPointRef::Watchpoint(id)
    );

    let watchpoint = process.watchpoints().get_by_id(id).unwrap();
    assert_eq!(watchpoint.data(), Some(0xfeed_f00d));
    assert_eq!(watchpoint.previous_data(), Some(0x1122_3344));

    process.remove_watchpoint(id).unwrap();
    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Exited);
    assert_eq!(reason.info, 7);
}

#[inline(never)]
fn unvisited_code() {
    std::hint::black_box(());
}

#[test]
fn hardware_slots_exhaust_and_recycle() {
    static SLOTS: [AtomicU64; 4] = [
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
    ];

    let pid = fork_child(spin_forever);
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();

    // One hardware breakpoint and three watchpoints fill all four slots.
    let hw_site = process
        .create_breakpoint_site(VirtAddr::new(unvisited_code as usize as u64), true, false)
        .unwrap()
        .id();
    process.enable_breakpoint_site(hw_site).unwrap();

    let mut watchpoints = Vec::new();
    for slot in &SLOTS[..3] {
        let id = process
            .create_watchpoint(addr_of(slot), StopPointMode::ReadWrite, 8)
            .unwrap()
            .id();
        process.enable_watchpoint(id).unwrap();
        watchpoints.push(id);
    }

    let fifth = process
        .create_watchpoint(addr_of(&SLOTS[3]), StopPointMode::Write, 8)
        .unwrap()
        .id();
    let err = process.enable_watchpoint(fifth).unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
    assert!(!process.watchpoints().get_by_id(fifth).unwrap().is_enabled());

    // Freeing any one slot lets the fifth stop-point in, on the freed slot.
    let freed = process
        .watchpoints()
        .get_by_id(watchpoints[1])
        .unwrap()
        .hardware_slot()
        .unwrap();
    process.disable_watchpoint(watchpoints[1]).unwrap();
    process.enable_watchpoint(fifth).unwrap();
    assert_eq!(
        process.watchpoints().get_by_id(fifth).unwrap().hardware_slot(),
        Some(freed)
    );
}

#[test]
fn stop_point_validation() {
    static SPOT: AtomicU64 = AtomicU64::new(0);

    let pid = fork_child(spin_forever);
    let _guard = ChildGuard(pid);
    let mut process = Process::attach(pid).unwrap();
    let address = addr_of(&SPOT);

    // Two breakpoint sites may not share an address.
    process.create_breakpoint_site(address, false, false).unwrap();
    assert!(process.create_breakpoint_site(address, false, false).is_err());

    // Watchpoint sizes are the four hardware lengths, aligned.
    assert!(process
        .create_watchpoint(address + 16, StopPointMode::Write, 3)
        .is_err());
    assert!(process
        .create_watchpoint(address + 1, StopPointMode::Write, 4)
        .is_err());

    // Unknown ids are usage errors.
    assert!(process.enable_breakpoint_site(999).is_err());
    assert!(process.remove_watchpoint(999).is_err());

    // Internal sites draw from the negative id range.
    let internal = process
        .create_breakpoint_site(address + 32, false, true)
        .unwrap()
        .id();
    let internal_next = process
        .create_breakpoint_site(address + 40, false, true)
        .unwrap()
        .id();
    assert!(internal < 0);
    assert!(internal_next < internal);
}
