/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tracee ownership and control.
//!
//! [`Process`] owns exactly one tracee: it launches or attaches to it,
//! resumes and steps it, reads and writes its registers and memory, and
//! manages its stop-points. Every operation runs synchronously on the
//! caller's thread; the only blocking point is `waitpid` inside
//! [`Process::wait_on_signal`].

use core::fmt;
use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::sys::personality;
use nix::sys::personality::Persona;
use nix::sys::ptrace;
use nix::sys::ptrace::regset;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use syscalls::Errno;
use tracing::debug;

use crate::addr::VirtAddr;
use crate::breakpoint::BreakpointSite;
use crate::breakpoint::INT3;
use crate::error::Context;
use crate::error::Error;
use crate::error::LaunchError;
use crate::error::LaunchStep;
use crate::error::Result;
use crate::fd::pipe;
use crate::fd::Fd;
use crate::register_info::register_info_by_id;
use crate::register_info::RegisterId;
use crate::register_info::RegisterKind;
use crate::registers::RegisterValue;
use crate::registers::Registers;
use crate::stoppoint::StopPoint;
use crate::stoppoint::StopPointCollection;
use crate::stoppoint::StopPointId;
use crate::watchpoint::StopPointMode;
use crate::watchpoint::Watchpoint;

/// What the tracee is doing, as far as the last wait told us.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    /// In a ptrace stop; registers and memory may be inspected.
    Stopped,
    /// Running; only a wait can observe the next state.
    Running,
    /// Gone: exited with a status. Terminal.
    Exited,
    /// Gone: killed by a signal. Terminal.
    Terminated,
}

/// Why a SIGTRAP stop happened, per the kernel's siginfo.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapKind {
    /// A completed `PTRACE_SINGLESTEP`.
    SingleStep,
    /// An `int3` patched by a software breakpoint site.
    SoftwareBreakpoint,
    /// A debug-register hit: hardware breakpoint or watchpoint.
    HardwareStopPoint,
}

/// Why the tracee is no longer running.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StopReason {
    /// The state the tracee moved to.
    pub state: ProcessState,
    /// The stop signal number, or the exit status for [`ProcessState::Exited`].
    pub info: u8,
    /// SIGTRAP classification, when the stop was a SIGTRAP under ptrace.
    pub trap: Option<TrapKind>,
}

impl StopReason {
    fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self {
                state: ProcessState::Exited,
                info: code as u8,
                trap: None,
            },
            WaitStatus::Signaled(_, sig, _) => Self {
                state: ProcessState::Terminated,
                info: sig as u8,
                trap: None,
            },
            WaitStatus::Stopped(_, sig) | WaitStatus::PtraceEvent(_, sig, _) => Self {
                state: ProcessState::Stopped,
                info: sig as u8,
                trap: None,
            },
            WaitStatus::PtraceSyscall(_) => Self {
                state: ProcessState::Stopped,
                info: Signal::SIGTRAP as u8,
                trap: None,
            },
            // Neither WNOHANG nor WCONTINUED is ever passed to waitpid.
            WaitStatus::StillAlive | WaitStatus::Continued(_) => {
                unreachable!("unexpected wait status {:?}", status)
            }
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let write_signal = |f: &mut fmt::Formatter, info: u8| match Signal::try_from(info as i32) {
            Ok(sig) => write!(f, "{sig}"),
            Err(_) => write!(f, "signal {info}"),
        };

        match self.state {
            ProcessState::Stopped => {
                write!(f, "stopped with ")?;
                write_signal(f, self.info)
            }
            ProcessState::Exited => write!(f, "exited with status {}", self.info),
            ProcessState::Terminated => {
                write!(f, "terminated with ")?;
                write_signal(f, self.info)
            }
            ProcessState::Running => write!(f, "running"),
        }
    }
}

/// Which hardware stop-point fired, per the DR6 status bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HardwareStopPointRef {
    /// A hardware breakpoint site with this id.
    Breakpoint(StopPointId),
    /// A watchpoint with this id.
    Watchpoint(StopPointId),
}

/// A debugged process.
///
/// Owning controllers (created with [`Process::launch`]) kill the tracee when
/// dropped; attached controllers ([`Process::attach`]) detach and let it run
/// on.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    state: ProcessState,
    is_attached: bool,
    terminate_on_end: bool,
    registers: Registers,
    breakpoint_sites: StopPointCollection<BreakpointSite>,
    watchpoints: StopPointCollection<Watchpoint>,
    next_stoppoint_id: StopPointId,
    next_internal_id: StopPointId,
}

impl Process {
    fn new(pid: Pid, terminate_on_end: bool, is_attached: bool) -> Self {
        Self {
            pid,
            state: ProcessState::Stopped,
            is_attached,
            terminate_on_end,
            registers: Registers::new(),
            breakpoint_sites: StopPointCollection::default(),
            watchpoints: StopPointCollection::default(),
            next_stoppoint_id: 1,
            next_internal_id: 0,
        }
    }

    /// Forks and execs `path` as a tracee.
    ///
    /// The child moves into its own process group, disables address-space
    /// randomization, optionally redirects stdout to `stdout_replacement`
    /// (borrowed; the caller keeps ownership), and requests tracing before
    /// the exec when `debug` is set. A child-side failure travels back over
    /// a close-on-exec pipe and surfaces as [`Error::Launch`].
    pub fn launch(path: &Path, debug: bool, stdout_replacement: Option<RawFd>) -> Result<Self> {
        let program = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::usage("program path contains a NUL byte"))?;
        let (mut reader, mut writer) = pipe().context("pipe2")?;

        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                drop(writer);
                if let Some(launch_error) = recv_launch_error(&mut reader)? {
                    // Reap the failed child before surfacing its error.
                    let _ = waitpid(child, None);
                    return Err(launch_error.into());
                }

                let mut process = Self::new(child, true, debug);
                if debug {
                    process.wait_on_signal()?;
                }
                debug!(pid = child.as_raw(), path = %path.display(), "launched tracee");
                Ok(process)
            }
            ForkResult::Child => {
                drop(reader);
                // Only failure paths reach this point; a successful execvp
                // never returns and closes the pipe via close-on-exec.
                let error = exec_child(&program, debug, stdout_replacement);
                send_launch_error(&mut writer, error);
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// Attaches to an already-running process.
    pub fn attach(pid: Pid) -> Result<Self> {
        if pid.as_raw() <= 0 {
            return Err(Error::usage(format!("cannot attach to pid {pid}")));
        }
        ptrace::attach(pid).context("PTRACE_ATTACH")?;

        let mut process = Self::new(pid, false, true);
        process.wait_on_signal()?;
        debug!(pid = pid.as_raw(), "attached to tracee");
        Ok(process)
    }

    /// The tracee's process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The tracee's state as of the last wait.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The register file, valid as of the last stop.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// The breakpoint sites installed on this tracee.
    pub fn breakpoint_sites(&self) -> &StopPointCollection<BreakpointSite> {
        &self.breakpoint_sites
    }

    /// The watchpoints installed on this tracee.
    pub fn watchpoints(&self) -> &StopPointCollection<Watchpoint> {
        &self.watchpoints
    }

    /// The current program counter.
    pub fn get_pc(&self) -> VirtAddr {
        VirtAddr::new(self.registers.read_u64(RegisterId::rip))
    }

    /// Points the program counter at `address`.
    pub fn set_pc(&mut self, address: VirtAddr) -> Result<()> {
        self.write_register(RegisterId::rip, RegisterValue::U64(address.as_u64()))
    }

    fn expect_stopped(&self, what: &str) -> Result<()> {
        match self.state {
            ProcessState::Stopped => Ok(()),
            ProcessState::Running => {
                Err(Error::usage(format!("cannot {what}: tracee is running")))
            }
            ProcessState::Exited | ProcessState::Terminated => {
                Err(Error::usage(format!("cannot {what}: tracee is gone")))
            }
        }
    }

    /// Resumes the tracee.
    ///
    /// A breakpoint under the current pc is transparently stepped off and
    /// re-armed first, so the tracee makes progress instead of re-trapping
    /// in place.
    pub fn resume(&mut self) -> Result<()> {
        self.expect_stopped("resume")?;

        if self.breakpoint_sites.enabled_at(self.get_pc()) {
            let reason = self.step_instruction()?;
            if reason.state != ProcessState::Stopped {
                return Err(Error::usage(format!("cannot resume: tracee {reason}")));
            }
        }

        ptrace::cont(self.pid, None).context("PTRACE_CONT")?;
        self.state = ProcessState::Running;
        debug!(pid = self.pid.as_raw(), "resumed tracee");
        Ok(())
    }

    /// Executes one instruction and reports the resulting stop.
    ///
    /// This is the transparent-step primitive: a breakpoint under the pc is
    /// disarmed so the original instruction runs, then re-armed once the
    /// step lands. [`Process::resume`] relies on it to move off a
    /// just-reported breakpoint.
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        self.expect_stopped("step")?;

        let to_reenable = self
            .breakpoint_sites
            .get_by_address(self.get_pc())
            .filter(|site| site.is_enabled())
            .map(StopPoint::id);
        if let Some(id) = to_reenable {
            self.disable_breakpoint_site(id)?;
        }

        ptrace::step(self.pid, None).context("PTRACE_SINGLESTEP")?;
        let reason = self.wait_on_signal()?;

        if let Some(id) = to_reenable {
            if self.state == ProcessState::Stopped {
                self.enable_breakpoint_site(id)?;
            }
        }
        Ok(reason)
    }

    /// Blocks until the tracee changes state and decodes why.
    ///
    /// On a stop the register image is refreshed, a SIGTRAP is classified
    /// via siginfo, the pc is rewound onto a just-hit software breakpoint
    /// (the CPU leaves it one past the trap byte), and a fired watchpoint
    /// gets its data resampled.
    pub fn wait_on_signal(&mut self) -> Result<StopReason> {
        let status = waitpid(self.pid, None).context("waitpid")?;
        let mut reason = StopReason::from_wait_status(status);
        self.state = reason.state;
        debug!(pid = self.pid.as_raw(), reason = %reason, "tracee changed state");

        if self.is_attached && self.state == ProcessState::Stopped {
            self.read_all_registers()?;

            if reason.info == Signal::SIGTRAP as u8 {
                reason.trap = self.trap_kind()?;

                let trap_site = self.get_pc() - 1;
                let hit_software_trap = self
                    .breakpoint_sites
                    .get_by_address(trap_site)
                    .map(|site| site.is_enabled() && !site.is_hardware())
                    .unwrap_or(false);
                if hit_software_trap {
                    self.set_pc(trap_site)?;
                }

                if reason.trap == Some(TrapKind::HardwareStopPoint) {
                    if let HardwareStopPointRef::Watchpoint(id) =
                        self.current_hardware_stoppoint()?
                    {
                        self.update_watchpoint_data(id)?;
                    }

                    // The B0-B3 status bits are sticky; reset the tracee's
                    // DR6 so the next hit reports only its own slot. The
                    // image keeps this stop's bits until the next refresh.
                    let dr6 = register_info_by_id(RegisterId::dr6);
                    self.write_user_area(dr6.offset, 0)?;
                }
            }
        }

        Ok(reason)
    }

    fn trap_kind(&self) -> Result<Option<TrapKind>> {
        let siginfo = ptrace::getsiginfo(self.pid).context("PTRACE_GETSIGINFO")?;
        Ok(match siginfo.si_code {
            libc::TRAP_TRACE => Some(TrapKind::SingleStep),
            libc::TRAP_BRKPT | libc::SI_KERNEL => Some(TrapKind::SoftwareBreakpoint),
            libc::TRAP_HWBKPT => Some(TrapKind::HardwareStopPoint),
            _ => None,
        })
    }

    fn read_all_registers(&mut self) -> Result<()> {
        let gprs = ptrace::getregs(self.pid).context("PTRACE_GETREGS")?;
        self.registers.set_gprs(gprs);

        let fprs =
            ptrace::getregset::<regset::NT_PRFPREG>(self.pid).context("PTRACE_GETFPREGS")?;
        self.registers.set_fprs(fprs);

        // The debug registers are only reachable one user-area word at a
        // time.
        for index in 0..8 {
            let info = register_info_by_id(RegisterId::dr(index));
            let word = ptrace::read_user(self.pid, info.offset as *mut libc::c_void)
                .context("PTRACE_PEEKUSER")?;
            self.registers.set_debugreg(index, word as u64);
        }
        Ok(())
    }

    /// Writes `value` into a register, both in the image and in the tracee.
    ///
    /// Floating-point registers flush the whole FP block; everything else
    /// flushes the 8-byte-aligned user-area word covering the register.
    pub fn write_register(&mut self, id: RegisterId, value: RegisterValue) -> Result<()> {
        let info = register_info_by_id(id);
        self.registers.write(info, value)?;

        if info.kind == RegisterKind::Fpr {
            self.write_fprs()
        } else {
            let aligned = info.offset & !7;
            let word = self.registers.user_word_at(aligned);
            self.write_user_area(aligned, word)
        }
    }

    /// Writes one 8-byte word into the tracee's user area.
    pub fn write_user_area(&mut self, offset: usize, word: u64) -> Result<()> {
        ptrace::write_user(self.pid, offset as *mut libc::c_void, word as i64)
            .context("PTRACE_POKEUSER")
    }

    /// Replaces the tracee's general-purpose registers wholesale.
    pub fn write_gprs(&mut self, gprs: libc::user_regs_struct) -> Result<()> {
        self.registers.set_gprs(gprs);
        ptrace::setregs(self.pid, gprs).context("PTRACE_SETREGS")
    }

    fn write_fprs(&mut self) -> Result<()> {
        ptrace::setregset::<regset::NT_PRFPREG>(self.pid, *self.registers.fprs())
            .context("PTRACE_SETFPREGS")
    }

    /// Reads exactly `len` bytes of tracee memory.
    ///
    /// Bulk reads go through `process_vm_readv`; kernels or seccomp policies
    /// that refuse it fall back to a `PTRACE_PEEKDATA` word loop.
    pub fn read_memory(&self, address: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }

        if let Err(err) = self.read_memory_vectored(address, &mut buf) {
            match err {
                Error::Os { errno, .. } if errno == Errno::ENOSYS || errno == Errno::EPERM => {
                    self.read_memory_words(address, &mut buf)?;
                }
                err => return Err(err),
            }
        }
        Ok(buf)
    }

    fn read_memory_vectored(&self, address: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let from = address + filled as u64;
            // Stop each chunk at a page boundary so one unmapped page cannot
            // fail bytes from the pages before it.
            let chunk = (buf.len() - filled).min((from.next_page_boundary() - from) as usize);
            let local = libc::iovec {
                iov_base: buf[filled..].as_mut_ptr() as *mut libc::c_void,
                iov_len: chunk,
            };
            let remote = libc::iovec {
                iov_base: from.as_u64() as *mut libc::c_void,
                iov_len: chunk,
            };

            let read = Errno::result(unsafe {
                libc::process_vm_readv(self.pid.as_raw(), &local, 1, &remote, 1, 0)
            })
            .context("process_vm_readv")?;
            if read == 0 {
                return Err(Error::Os {
                    context: "process_vm_readv",
                    errno: Errno::EFAULT,
                });
            }
            filled += read as usize;
        }
        Ok(())
    }

    fn read_memory_words(&self, address: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let word = ptrace::read(
                self.pid,
                (address + filled as u64).as_u64() as *mut libc::c_void,
            )
            .context("PTRACE_PEEKDATA")?;
            let bytes = (word as u64).to_le_bytes();
            let take = (buf.len() - filled).min(8);
            buf[filled..filled + take].copy_from_slice(&bytes[..take]);
            filled += take;
        }
        Ok(())
    }

    /// Like [`Process::read_memory`], but with the original byte of every
    /// enabled software breakpoint in the range restored.
    ///
    /// This is the view the disassembler and any other reader of the real
    /// instruction stream must use.
    pub fn read_memory_without_traps(&self, address: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut bytes = self.read_memory(address, len)?;
        for site in &self.breakpoint_sites {
            if !site.is_enabled() || site.is_hardware() || site.address() < address {
                continue;
            }
            let offset = (site.address() - address) as usize;
            if offset >= len {
                continue;
            }
            if let Some(saved) = site.saved_byte {
                bytes[offset] = saved;
            }
        }
        Ok(bytes)
    }

    /// Writes `data` into tracee memory, one aligned word at a time.
    ///
    /// Bytes that land on an armed software trap go into the site's saved
    /// byte instead; the trap byte stays in place so the site survives the
    /// write. A failure on word N leaves the words before it written.
    pub fn write_memory(&mut self, address: VirtAddr, data: &[u8]) -> Result<()> {
        self.expect_stopped("write memory")?;
        let mut patched = data.to_vec();

        for site in self.breakpoint_sites.iter_mut() {
            if !site.is_enabled || site.is_hardware || site.address < address {
                continue;
            }
            let offset = (site.address - address) as usize;
            if offset >= patched.len() {
                continue;
            }
            site.saved_byte = Some(patched[offset]);
            patched[offset] = INT3;
        }

        let mut written = 0;
        while written < patched.len() {
            let remaining = &patched[written..];
            let mut word = [0u8; 8];
            if remaining.len() >= 8 {
                word.copy_from_slice(&remaining[..8]);
            } else {
                // Splice the short tail over the word already there.
                let existing = self.read_memory(address + written as u64, 8)?;
                word.copy_from_slice(&existing);
                word[..remaining.len()].copy_from_slice(remaining);
            }
            ptrace::write(
                self.pid,
                (address + written as u64).as_u64() as *mut libc::c_void,
                i64::from_le_bytes(word),
            )
            .context("PTRACE_POKEDATA")?;
            written += 8;
        }
        Ok(())
    }

    /// Registers a breakpoint site at `address` without arming it.
    ///
    /// Internal sites draw ids from a disjoint negative range and are meant
    /// for the engine's own bookkeeping; listings skip them.
    pub fn create_breakpoint_site(
        &mut self,
        address: VirtAddr,
        hardware: bool,
        internal: bool,
    ) -> Result<&mut BreakpointSite> {
        if self.breakpoint_sites.contains_address(address) {
            return Err(Error::usage(format!(
                "breakpoint site already created at address {address}"
            )));
        }

        let id = if internal {
            self.next_internal_id -= 1;
            self.next_internal_id
        } else {
            let id = self.next_stoppoint_id;
            self.next_stoppoint_id += 1;
            id
        };
        debug!(id, %address, hardware, "created breakpoint site");
        Ok(self
            .breakpoint_sites
            .push(BreakpointSite::new(id, address, hardware, internal)))
    }

    /// Registers a watchpoint over `size` bytes at `address` without arming
    /// it.
    pub fn create_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StopPointMode,
        size: usize,
    ) -> Result<&mut Watchpoint> {
        if self.watchpoints.contains_address(address) {
            return Err(Error::usage(format!(
                "watchpoint already created at address {address}"
            )));
        }

        let watchpoint = Watchpoint::new(self.next_stoppoint_id, address, mode, size)?;
        self.next_stoppoint_id += 1;
        debug!(id = watchpoint.id(), %address, mode = %watchpoint.mode(), size, "created watchpoint");
        Ok(self.watchpoints.push(watchpoint))
    }

    fn find_site(&self, id: StopPointId) -> Result<&BreakpointSite> {
        self.breakpoint_sites
            .get_by_id(id)
            .ok_or_else(|| Error::usage(format!("no breakpoint site with id {id}")))
    }

    fn find_site_mut(&mut self, id: StopPointId) -> Result<&mut BreakpointSite> {
        self.breakpoint_sites
            .get_by_id_mut(id)
            .ok_or_else(|| Error::usage(format!("no breakpoint site with id {id}")))
    }

    fn find_watchpoint(&self, id: StopPointId) -> Result<&Watchpoint> {
        self.watchpoints
            .get_by_id(id)
            .ok_or_else(|| Error::usage(format!("no watchpoint with id {id}")))
    }

    fn find_watchpoint_mut(&mut self, id: StopPointId) -> Result<&mut Watchpoint> {
        self.watchpoints
            .get_by_id_mut(id)
            .ok_or_else(|| Error::usage(format!("no watchpoint with id {id}")))
    }

    /// Arms a breakpoint site. Idempotent.
    pub fn enable_breakpoint_site(&mut self, id: StopPointId) -> Result<()> {
        let site = self.find_site(id)?;
        if site.is_enabled() {
            return Ok(());
        }
        let address = site.address();

        if site.is_hardware() {
            let slot = self.set_hardware_stoppoint(address, StopPointMode::Execute, 1)?;
            let site = self.find_site_mut(id)?;
            site.hardware_slot = Some(slot);
            site.is_enabled = true;
        } else {
            let saved = self.patch_trap_byte(address)?;
            let site = self.find_site_mut(id)?;
            site.saved_byte = Some(saved);
            site.is_enabled = true;
        }
        debug!(id, %address, "enabled breakpoint site");
        Ok(())
    }

    /// Disarms a breakpoint site. Idempotent.
    pub fn disable_breakpoint_site(&mut self, id: StopPointId) -> Result<()> {
        let site = self.find_site(id)?;
        if !site.is_enabled() {
            return Ok(());
        }
        let address = site.address();
        let slot = site.hardware_slot;
        let saved = site.saved_byte;

        if site.is_hardware() {
            if let Some(slot) = slot {
                self.clear_hardware_stoppoint(slot)?;
            }
        } else if let Some(saved) = saved {
            self.restore_trap_byte(address, saved)?;
        }

        let site = self.find_site_mut(id)?;
        site.hardware_slot = None;
        site.saved_byte = None;
        site.is_enabled = false;
        debug!(id, %address, "disabled breakpoint site");
        Ok(())
    }

    /// Disarms and removes a breakpoint site.
    pub fn remove_breakpoint_site(&mut self, id: StopPointId) -> Result<()> {
        self.disable_breakpoint_site(id)?;
        self.breakpoint_sites.remove_by_id(id);
        Ok(())
    }

    /// Disarms and removes the breakpoint site at `address`.
    pub fn remove_breakpoint_site_at(&mut self, address: VirtAddr) -> Result<()> {
        let id = self
            .breakpoint_sites
            .get_by_address(address)
            .map(StopPoint::id)
            .ok_or_else(|| Error::usage(format!("no breakpoint site at address {address}")))?;
        self.remove_breakpoint_site(id)
    }

    /// Arms a watchpoint and samples its first data snapshot. Idempotent.
    pub fn enable_watchpoint(&mut self, id: StopPointId) -> Result<()> {
        let watchpoint = self.find_watchpoint(id)?;
        if watchpoint.is_enabled() {
            return Ok(());
        }
        let address = watchpoint.address();
        let mode = watchpoint.mode();
        let size = watchpoint.size();

        let slot = self.set_hardware_stoppoint(address, mode, size)?;
        let data = match self.read_watched_data(address, size) {
            Ok(data) => data,
            Err(err) => {
                // Failed enables must not leak the slot.
                let _ = self.clear_hardware_stoppoint(slot);
                return Err(err);
            }
        };

        let watchpoint = self.find_watchpoint_mut(id)?;
        watchpoint.hardware_slot = Some(slot);
        watchpoint.is_enabled = true;
        watchpoint.data = Some(data);
        debug!(id, %address, "enabled watchpoint");
        Ok(())
    }

    /// Disarms a watchpoint. Idempotent.
    pub fn disable_watchpoint(&mut self, id: StopPointId) -> Result<()> {
        let watchpoint = self.find_watchpoint(id)?;
        if !watchpoint.is_enabled() {
            return Ok(());
        }
        if let Some(slot) = watchpoint.hardware_slot() {
            self.clear_hardware_stoppoint(slot)?;
        }

        let watchpoint = self.find_watchpoint_mut(id)?;
        watchpoint.hardware_slot = None;
        watchpoint.is_enabled = false;
        Ok(())
    }

    /// Disarms and removes a watchpoint.
    pub fn remove_watchpoint(&mut self, id: StopPointId) -> Result<()> {
        self.disable_watchpoint(id)?;
        self.watchpoints.remove_by_id(id);
        Ok(())
    }

    /// Disarms and removes the watchpoint at `address`.
    pub fn remove_watchpoint_at(&mut self, address: VirtAddr) -> Result<()> {
        let id = self
            .watchpoints
            .get_by_address(address)
            .map(StopPoint::id)
            .ok_or_else(|| Error::usage(format!("no watchpoint at address {address}")))?;
        self.remove_watchpoint(id)
    }

    /// Shifts a fired watchpoint's snapshot into `previous_data` and
    /// resamples the watched bytes.
    pub fn update_watchpoint_data(&mut self, id: StopPointId) -> Result<()> {
        let watchpoint = self.find_watchpoint(id)?;
        let address = watchpoint.address();
        let size = watchpoint.size();

        let data = self.read_watched_data(address, size)?;
        let watchpoint = self.find_watchpoint_mut(id)?;
        watchpoint.previous_data = watchpoint.data;
        watchpoint.data = Some(data);
        Ok(())
    }

    fn read_watched_data(&self, address: VirtAddr, size: usize) -> Result<u64> {
        let bytes = self.read_memory(address, size)?;
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn patch_trap_byte(&mut self, address: VirtAddr) -> Result<u8> {
        let word = ptrace::read(self.pid, address.as_u64() as *mut libc::c_void)
            .context("PTRACE_PEEKDATA")? as u64;
        let saved = (word & 0xff) as u8;
        let patched = (word & !0xff) | u64::from(INT3);
        ptrace::write(
            self.pid,
            address.as_u64() as *mut libc::c_void,
            patched as i64,
        )
        .context("PTRACE_POKEDATA")?;
        Ok(saved)
    }

    fn restore_trap_byte(&mut self, address: VirtAddr, saved: u8) -> Result<()> {
        let word = ptrace::read(self.pid, address.as_u64() as *mut libc::c_void)
            .context("PTRACE_PEEKDATA")? as u64;
        let restored = (word & !0xff) | u64::from(saved);
        ptrace::write(
            self.pid,
            address.as_u64() as *mut libc::c_void,
            restored as i64,
        )
        .context("PTRACE_POKEDATA")
    }

    /// Claims a free debug-register slot and arms it.
    ///
    /// Slots are handed out lowest-index first; DR7 gets the slot's
    /// local-enable bit plus its mode and length fields. Fails without
    /// consuming a slot when all four are taken or the size is not
    /// encodable.
    fn set_hardware_stoppoint(
        &mut self,
        address: VirtAddr,
        mode: StopPointMode,
        size: usize,
    ) -> Result<usize> {
        let control = self.registers.read_u64(RegisterId::dr7);
        let slot = free_hardware_slot(control)?;
        let mode_bits = encode_hardware_mode(mode);
        let size_bits = encode_hardware_size(size)?;

        self.write_register(RegisterId::dr(slot), RegisterValue::U64(address.as_u64()))?;

        let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
        let control = (control & !clear_mask)
            | 1u64 << (slot * 2)
            | mode_bits << (slot * 4 + 16)
            | size_bits << (slot * 4 + 18);
        self.write_register(RegisterId::dr7, RegisterValue::U64(control))?;
        debug!(slot, %address, %mode, size, "armed hardware stop-point");
        Ok(slot)
    }

    /// Releases a debug-register slot: zeroes its address register and its
    /// DR7 fields.
    fn clear_hardware_stoppoint(&mut self, slot: usize) -> Result<()> {
        self.write_register(RegisterId::dr(slot), RegisterValue::U64(0))?;

        let control = self.registers.read_u64(RegisterId::dr7);
        let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
        self.write_register(RegisterId::dr7, RegisterValue::U64(control & !clear_mask))?;
        debug!(slot, "cleared hardware stop-point");
        Ok(())
    }

    /// Decodes DR6 into the stop-point that caused the current hardware
    /// stop.
    pub fn current_hardware_stoppoint(&self) -> Result<HardwareStopPointRef> {
        let status = self.registers.read_u64(RegisterId::dr6);
        if status & 0b1111 == 0 {
            return Err(Error::usage("no hardware stop-point has fired"));
        }
        let slot = (status & 0b1111).trailing_zeros() as usize;
        let address = VirtAddr::new(self.registers.read_u64(RegisterId::dr(slot)));

        if let Some(watchpoint) = self.watchpoints.get_by_address(address) {
            return Ok(HardwareStopPointRef::Watchpoint(watchpoint.id()));
        }
        if let Some(site) = self.breakpoint_sites.get_by_address(address) {
            if site.is_hardware() {
                return Ok(HardwareStopPointRef::Breakpoint(site.id()));
            }
        }
        Err(Error::usage(format!(
            "no stop-point owns the fired hardware slot {slot}"
        )))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.is_attached {
            if self.state == ProcessState::Running {
                let _ = signal::kill(self.pid, Signal::SIGSTOP);
                let _ = waitpid(self.pid, None);
                self.state = ProcessState::Stopped;
            }
            if self.state == ProcessState::Stopped {
                // Leave no trap bytes or armed debug registers behind in a
                // process that keeps running after we detach.
                let ids: Vec<_> = self.breakpoint_sites.iter().map(StopPoint::id).collect();
                for id in ids {
                    let _ = self.disable_breakpoint_site(id);
                }
                let ids: Vec<_> = self.watchpoints.iter().map(StopPoint::id).collect();
                for id in ids {
                    let _ = self.disable_watchpoint(id);
                }
                let _ = ptrace::detach(self.pid, None);
                let _ = signal::kill(self.pid, Signal::SIGCONT);
            }
        }
        if self.terminate_on_end {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Runs in the forked child; returns only on failure.
fn exec_child(program: &CStr, debug: bool, stdout_replacement: Option<RawFd>) -> LaunchError {
    // A fresh process group, so a SIGINT aimed at the debugger does not also
    // land on the tracee.
    if let Err(errno) = Errno::result(unsafe { libc::setpgid(0, 0) }) {
        return LaunchError::new(LaunchStep::SetPgid, errno);
    }

    // Keep code addresses reproducible from run to run.
    if let Err(err) = personality::set(Persona::ADDR_NO_RANDOMIZE) {
        return LaunchError::new(LaunchStep::DisableAslr, Errno::new(err as i32));
    }

    if let Some(fd) = stdout_replacement {
        if let Err(errno) = Errno::result(unsafe { libc::dup2(fd, libc::STDOUT_FILENO) }) {
            return LaunchError::new(LaunchStep::RedirectStdout, errno);
        }
    }

    if debug {
        if let Err(err) = ptrace::traceme() {
            return LaunchError::new(LaunchStep::TraceMe, Errno::new(err as i32));
        }
    }

    let argv = [program.as_ptr(), core::ptr::null()];
    let errno = Errno::result(unsafe { libc::execvp(program.as_ptr(), argv.as_ptr()) })
        .expect_err("execvp returned success");
    LaunchError::new(LaunchStep::Exec, errno)
}

/// Ships a launch failure to the parent. Nothing can be done if the write
/// itself fails.
fn send_launch_error(fd: &mut Fd, error: LaunchError) {
    let _ = fd.write(&error.into_bytes());
}

/// Reads the child's launch verdict: `None` when the pipe closed clean on a
/// successful exec.
fn recv_launch_error(fd: &mut Fd) -> Result<Option<LaunchError>> {
    let mut bytes = [0u8; 8];
    loop {
        match fd.read(&mut bytes) {
            Ok(0) => return Ok(None),
            Ok(8) => return Ok(Some(LaunchError::from_bytes(bytes))),
            // The eight-byte record is far below PIPE_BUF, so it arrives
            // whole or not at all.
            Ok(n) => panic!("launch pipe: unexpected read of {n} bytes"),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(Error::Os {
                    context: "reading the launch pipe",
                    errno: Errno::new(err.raw_os_error().unwrap_or(0)),
                })
            }
        }
    }
}

fn free_hardware_slot(control: u64) -> Result<usize> {
    // DR7 packs a local and a global enable bit per slot; a slot is free
    // when both are clear.
    for slot in 0..4 {
        if control & (0b11 << (slot * 2)) == 0 {
            return Ok(slot);
        }
    }
    Err(Error::usage("all four hardware stop-point slots are in use"))
}

fn encode_hardware_mode(mode: StopPointMode) -> u64 {
    match mode {
        StopPointMode::Execute => 0b00,
        StopPointMode::Write => 0b01,
        StopPointMode::ReadWrite => 0b11,
    }
}

fn encode_hardware_size(size: usize) -> Result<u64> {
    // DR7 LEN values; 8-byte ranges take the spare 0b10 code.
    match size {
        1 => Ok(0b00),
        2 => Ok(0b01),
        8 => Ok(0b10),
        4 => Ok(0b11),
        _ => Err(Error::usage(format!(
            "invalid hardware stop-point size {size}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_slot_allocation() {
        assert_eq!(free_hardware_slot(0).unwrap(), 0);
        assert_eq!(free_hardware_slot(0b01).unwrap(), 1);
        assert_eq!(free_hardware_slot(0b0101).unwrap(), 2);
        // A globally-enabled slot counts as taken.
        assert_eq!(free_hardware_slot(0b1010).unwrap(), 2);
        assert_eq!(free_hardware_slot(0b0100_0101).unwrap(), 3);
        assert!(free_hardware_slot(0b0101_0101).is_err());
    }

    #[test]
    fn hardware_field_encodings() {
        assert_eq!(encode_hardware_mode(StopPointMode::Execute), 0b00);
        assert_eq!(encode_hardware_mode(StopPointMode::Write), 0b01);
        assert_eq!(encode_hardware_mode(StopPointMode::ReadWrite), 0b11);

        assert_eq!(encode_hardware_size(1).unwrap(), 0b00);
        assert_eq!(encode_hardware_size(2).unwrap(), 0b01);
        assert_eq!(encode_hardware_size(4).unwrap(), 0b11);
        assert_eq!(encode_hardware_size(8).unwrap(), 0b10);
        assert!(encode_hardware_size(3).is_err());
    }

    #[test]
    fn stop_reason_decoding() {
        let pid = Pid::from_raw(1234);

        let reason = StopReason::from_wait_status(WaitStatus::Exited(pid, 3));
        assert_eq!(reason.state, ProcessState::Exited);
        assert_eq!(reason.info, 3);
        assert_eq!(reason.to_string(), "exited with status 3");

        let reason =
            StopReason::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGTRAP));
        assert_eq!(reason.state, ProcessState::Stopped);
        assert_eq!(reason.info, Signal::SIGTRAP as u8);
        assert_eq!(reason.to_string(), "stopped with SIGTRAP");

        let reason =
            StopReason::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false));
        assert_eq!(reason.state, ProcessState::Terminated);
        assert_eq!(reason.to_string(), "terminated with SIGKILL");
    }
}
