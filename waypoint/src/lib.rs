/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_os = "linux")]
#![deny(rustdoc::broken_intra_doc_links)]

//! A native debugger engine for x86-64 Linux.
//!
//! The engine drives one tracee through the kernel's ptrace interface:
//! launch or attach, resume and single-step, typed register access over the
//! kernel user area, memory I/O that stays transparent to installed traps,
//! and software/hardware stop-points backed by `int3` patching and the x86
//! debug registers. Everything is synchronous and blocking; the only
//! suspension point is `waitpid` inside [`Process::wait_on_signal`].

mod addr;
mod breakpoint;
mod disasm;
mod error;
mod fd;
mod process;
mod register_info;
mod registers;
mod stoppoint;
mod watchpoint;

pub use crate::addr::VirtAddr;
pub use crate::breakpoint::BreakpointSite;
pub use crate::disasm::disassemble;
pub use crate::disasm::Instruction;
pub use crate::error::Error;
pub use crate::error::LaunchStep;
pub use crate::error::Result;
pub use crate::fd::pipe;
pub use crate::fd::Fd;
pub use crate::process::HardwareStopPointRef;
pub use crate::process::Process;
pub use crate::process::ProcessState;
pub use crate::process::StopReason;
pub use crate::process::TrapKind;
pub use crate::register_info::register_info_by_dwarf;
pub use crate::register_info::register_info_by_id;
pub use crate::register_info::register_info_by_name;
pub use crate::register_info::RegisterFormat;
pub use crate::register_info::RegisterId;
pub use crate::register_info::RegisterInfo;
pub use crate::register_info::RegisterKind;
pub use crate::register_info::REGISTER_INFOS;
pub use crate::registers::RegisterValue;
pub use crate::registers::Registers;
pub use crate::stoppoint::StopPoint;
pub use crate::stoppoint::StopPointCollection;
pub use crate::stoppoint::StopPointId;
pub use crate::watchpoint::StopPointMode;
pub use crate::watchpoint::Watchpoint;

// Re-exports so that callers don't need to depend on `nix` or `syscalls`.
pub use nix::unistd::Pid;
pub use syscalls::Errno;
