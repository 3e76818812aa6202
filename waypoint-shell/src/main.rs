/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The interactive command shell driving the waypoint debugger engine.

use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use reedline::DefaultPrompt;
use reedline::DefaultPromptSegment;
use reedline::Reedline;
use reedline::Signal;
use tracing_subscriber::EnvFilter;
use waypoint::disassemble;
use waypoint::register_info_by_name;
use waypoint::HardwareStopPointRef;
use waypoint::Pid;
use waypoint::Process;
use waypoint::ProcessState;
use waypoint::RegisterFormat;
use waypoint::RegisterInfo;
use waypoint::RegisterKind;
use waypoint::RegisterValue;
use waypoint::StopPoint;
use waypoint::StopPointId;
use waypoint::StopPointMode;
use waypoint::StopReason;
use waypoint::TrapKind;
use waypoint::VirtAddr;
use waypoint::REGISTER_INFOS;

/// A native debugger for x86-64 Linux.
#[derive(Debug, Parser)]
#[command(name = "waypoint")]
struct Args {
    /// Attach to a running process instead of launching one.
    #[arg(short = 'p', long = "pid", value_name = "PID", conflicts_with = "program")]
    pid: Option<i32>,

    /// Path of the program to launch under the debugger.
    #[arg(value_name = "PROGRAM", required_unless_present = "pid")]
    program: Option<PathBuf>,
}

/// The tracee's pid, for the SIGINT handler.
static TRACEE_PID: AtomicI32 = AtomicI32::new(0);

/// Ctrl-C stops the tracee rather than killing the debugger. The tracee
/// lives in its own process group, so the SIGSTOP has to be forwarded by
/// hand.
extern "C" fn on_sigint(_signum: libc::c_int) {
    let pid = TRACEE_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe { libc::kill(pid, libc::SIGSTOP) };
    }
}

fn install_sigint_handler() {
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let process = match (args.pid, &args.program) {
        (Some(pid), _) => Process::attach(Pid::from_raw(pid))?,
        (None, Some(program)) => {
            let process = Process::launch(program, true, None)?;
            println!("Launched process with PID {}", process.pid());
            process
        }
        (None, None) => unreachable!("clap requires a pid or a program"),
    };

    TRACEE_PID.store(process.pid().as_raw(), Ordering::Relaxed);
    install_sigint_handler();

    main_loop(process)
}

fn main_loop(mut process: Process) -> Result<()> {
    let mut editor = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("waypoint".to_owned()),
        DefaultPromptSegment::Empty,
    );
    let mut last_line = String::new();

    loop {
        match editor.read_line(&prompt)? {
            Signal::Success(line) => {
                // An empty line repeats the previous command.
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    last_line = trimmed.to_owned();
                }
                if last_line.is_empty() {
                    continue;
                }
                let line = last_line.clone();
                if let Err(err) = handle_command(&mut process, &line) {
                    eprintln!("error: {err:#}");
                }
            }
            Signal::CtrlC => continue,
            Signal::CtrlD => return Ok(()),
        }
    }
}

fn is_prefix(text: &str, of: &str) -> bool {
    !text.is_empty() && of.starts_with(text)
}

fn handle_command(process: &mut Process, line: &str) -> Result<()> {
    let args: Vec<&str> = line.split_whitespace().collect();
    let command = args[0];

    if is_prefix(command, "continue") {
        process.resume()?;
        let reason = process.wait_on_signal()?;
        handle_stop(process, reason)
    } else if is_prefix(command, "step") {
        let reason = process.step_instruction()?;
        handle_stop(process, reason)
    } else if is_prefix(command, "register") {
        handle_register_command(process, &args)
    } else if is_prefix(command, "breakpoint") {
        handle_breakpoint_command(process, &args)
    } else if is_prefix(command, "watchpoint") {
        handle_watchpoint_command(process, &args)
    } else if is_prefix(command, "memory") {
        handle_memory_command(process, &args)
    } else if is_prefix(command, "disassemble") {
        handle_disassemble_command(process, &args)
    } else if is_prefix(command, "help") {
        print_help(&args);
        Ok(())
    } else {
        bail!("unknown command; try 'help'")
    }
}

fn handle_stop(process: &Process, reason: StopReason) -> Result<()> {
    if reason.state != ProcessState::Stopped {
        println!("Process {} {}", process.pid(), reason);
        return Ok(());
    }

    println!(
        "Process {} {} at {}",
        process.pid(),
        reason,
        process.get_pc()
    );

    if reason.trap == Some(TrapKind::HardwareStopPoint) {
        if let HardwareStopPointRef::Watchpoint(id) = process.current_hardware_stoppoint()? {
            print_watchpoint_hit(process, id)?;
        }
    }

    print_disassembly(process, None, 5)
}

fn print_watchpoint_hit(process: &Process, id: StopPointId) -> Result<()> {
    let watchpoint = process
        .watchpoints()
        .get_by_id(id)
        .context("fired watchpoint is gone")?;
    println!("Watchpoint {} hit at {}", id, watchpoint.address());
    if let (Some(old), Some(new)) = (watchpoint.previous_data(), watchpoint.data()) {
        println!("Old value: {old:#x}");
        println!("New value: {new:#x}");
    }
    Ok(())
}

fn handle_register_command(process: &mut Process, args: &[&str]) -> Result<()> {
    if args.len() < 2 {
        print_help(&["help", "register"]);
        return Ok(());
    }
    if is_prefix(args[1], "read") {
        handle_register_read(process, args)
    } else if is_prefix(args[1], "write") {
        handle_register_write(process, args)
    } else {
        print_help(&["help", "register"]);
        Ok(())
    }
}

fn handle_register_read(process: &Process, args: &[&str]) -> Result<()> {
    match args.get(2) {
        None | Some(&"all") => {
            let all = args.get(2).is_some();
            for info in REGISTER_INFOS {
                let wanted = if all {
                    // Sub-registers only alias bytes already being printed.
                    info.kind != RegisterKind::SubGpr
                } else {
                    info.kind == RegisterKind::Gpr && info.name != "orig_rax"
                };
                if wanted {
                    println!("{:10}{}", info.name, process.registers().read(info));
                }
            }
        }
        Some(name) => {
            let info = register_info_by_name(name)?;
            println!("{:10}{}", info.name, process.registers().read(info));
        }
    }
    Ok(())
}

fn handle_register_write(process: &mut Process, args: &[&str]) -> Result<()> {
    if args.len() != 4 {
        print_help(&["help", "register"]);
        return Ok(());
    }
    let info = register_info_by_name(args[2])?;
    let value = parse_register_value(info, args[3])?;
    process.write_register(info.id, value)?;
    Ok(())
}

fn parse_register_value(info: &RegisterInfo, text: &str) -> Result<RegisterValue> {
    match info.format {
        RegisterFormat::Uint => {
            let value = parse_u64(text)?;
            Ok(match info.size {
                1 => RegisterValue::U8(
                    u8::try_from(value).context("value does not fit a byte register")?,
                ),
                2 => RegisterValue::U16(
                    u16::try_from(value).context("value does not fit a 16-bit register")?,
                ),
                4 => RegisterValue::U32(
                    u32::try_from(value).context("value does not fit a 32-bit register")?,
                ),
                _ => RegisterValue::U64(value),
            })
        }
        RegisterFormat::DoubleFloat => {
            let value: f64 = text.parse().context("expected a floating-point value")?;
            Ok(if info.size == 4 {
                RegisterValue::F32(value as f32)
            } else {
                RegisterValue::F64(value)
            })
        }
        RegisterFormat::LongDouble | RegisterFormat::Vector => {
            let bytes = parse_byte_vector(text)?;
            if bytes.len() != info.size {
                bail!("{} expects exactly {} bytes", info.name, info.size);
            }
            Ok(match info.size {
                8 => {
                    let mut out = [0u8; 8];
                    out.copy_from_slice(&bytes);
                    RegisterValue::Bytes8(out)
                }
                _ => {
                    let mut out = [0u8; 16];
                    out.copy_from_slice(&bytes);
                    if info.format == RegisterFormat::LongDouble {
                        RegisterValue::LongDouble(out)
                    } else {
                        RegisterValue::Bytes16(out)
                    }
                }
            })
        }
    }
}

fn handle_breakpoint_command(process: &mut Process, args: &[&str]) -> Result<()> {
    if args.len() < 2 {
        print_help(&["help", "breakpoint"]);
        return Ok(());
    }
    let command = args[1];

    if is_prefix(command, "list") {
        if process.breakpoint_sites().is_empty() {
            println!("No breakpoints set");
        } else {
            println!("Current breakpoints:");
            for site in process.breakpoint_sites() {
                if site.is_internal() {
                    continue;
                }
                println!(
                    "{}: address = {}, {}",
                    site.id(),
                    site.address(),
                    if site.is_enabled() { "enabled" } else { "disabled" }
                );
            }
        }
        return Ok(());
    }

    if args.len() < 3 {
        print_help(&["help", "breakpoint"]);
        return Ok(());
    }

    if is_prefix(command, "set") {
        let address = parse_address(args[2])?;
        let hardware = match args.get(3) {
            Some(&"-h") => true,
            Some(_) => bail!("invalid breakpoint command argument"),
            None => false,
        };
        let id = process.create_breakpoint_site(address, hardware, false)?.id();
        process.enable_breakpoint_site(id)?;
        return Ok(());
    }

    let id: StopPointId = args[2].parse().context("command expects a breakpoint id")?;
    if is_prefix(command, "enable") {
        process.enable_breakpoint_site(id)?;
    } else if is_prefix(command, "disable") {
        process.disable_breakpoint_site(id)?;
    } else if is_prefix(command, "delete") {
        process.remove_breakpoint_site(id)?;
    } else {
        print_help(&["help", "breakpoint"]);
    }
    Ok(())
}

fn handle_watchpoint_command(process: &mut Process, args: &[&str]) -> Result<()> {
    if args.len() < 2 {
        print_help(&["help", "watchpoint"]);
        return Ok(());
    }
    let command = args[1];

    if is_prefix(command, "list") {
        if process.watchpoints().is_empty() {
            println!("No watchpoints set");
        } else {
            println!("Current watchpoints:");
            for point in process.watchpoints() {
                println!(
                    "{}: address = {}, mode = {}, size = {}, {}",
                    point.id(),
                    point.address(),
                    point.mode(),
                    point.size(),
                    if point.is_enabled() { "enabled" } else { "disabled" }
                );
            }
        }
        return Ok(());
    }

    if is_prefix(command, "set") {
        if args.len() != 5 {
            print_help(&["help", "watchpoint"]);
            return Ok(());
        }
        let address = parse_address(args[2])?;
        let mode = match args[3] {
            "write" => StopPointMode::Write,
            "rw" => StopPointMode::ReadWrite,
            "execute" => StopPointMode::Execute,
            _ => {
                print_help(&["help", "watchpoint"]);
                return Ok(());
            }
        };
        let size: usize = args[4].parse().context("invalid watchpoint size")?;

        let id = process.create_watchpoint(address, mode, size)?.id();
        process.enable_watchpoint(id)?;
        return Ok(());
    }

    if args.len() < 3 {
        print_help(&["help", "watchpoint"]);
        return Ok(());
    }

    let id: StopPointId = args[2].parse().context("command expects a watchpoint id")?;
    if is_prefix(command, "enable") {
        process.enable_watchpoint(id)?;
    } else if is_prefix(command, "disable") {
        process.disable_watchpoint(id)?;
    } else if is_prefix(command, "delete") {
        process.remove_watchpoint(id)?;
    } else {
        print_help(&["help", "watchpoint"]);
    }
    Ok(())
}

fn handle_memory_command(process: &mut Process, args: &[&str]) -> Result<()> {
    if args.len() < 3 {
        print_help(&["help", "memory"]);
        return Ok(());
    }
    if is_prefix(args[1], "read") {
        let address = parse_address(args[2])?;
        let len = match args.get(3) {
            Some(text) => text.parse().context("invalid number of bytes")?,
            None => 32,
        };

        let data = process.read_memory(address, len)?;
        for (i, line) in data.chunks(16).enumerate() {
            let bytes: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
            println!(
                "{:#016x}: {}",
                address.as_u64() + i as u64 * 16,
                bytes.join(" ")
            );
        }
        Ok(())
    } else if is_prefix(args[1], "write") {
        if args.len() != 4 {
            print_help(&["help", "memory"]);
            return Ok(());
        }
        let address = parse_address(args[2])?;
        let data = parse_byte_vector(args[3])?;
        process.write_memory(address, &data)?;
        Ok(())
    } else {
        print_help(&["help", "memory"]);
        Ok(())
    }
}

fn handle_disassemble_command(process: &Process, args: &[&str]) -> Result<()> {
    let mut address = None;
    let mut count = 5;

    let mut it = args[1..].iter();
    while let Some(arg) = it.next() {
        match *arg {
            "-a" => {
                let text = it.next().context("-a expects an address")?;
                address = Some(parse_address(text)?);
            }
            "-c" => {
                let text = it.next().context("-c expects an instruction count")?;
                count = text.parse().context("invalid instruction count")?;
            }
            _ => {
                print_help(&["help", "disassemble"]);
                return Ok(());
            }
        }
    }

    print_disassembly(process, address, count)
}

fn print_disassembly(process: &Process, address: Option<VirtAddr>, count: usize) -> Result<()> {
    for instruction in disassemble(process, address, count)? {
        println!("{:#018x}: {}", instruction.address.as_u64(), instruction.text);
    }
    Ok(())
}

fn parse_address(text: &str) -> Result<VirtAddr> {
    let digits = text
        .strip_prefix("0x")
        .context("expected an address in hexadecimal, prefixed with '0x'")?;
    let address = u64::from_str_radix(digits, 16).context("invalid address")?;
    Ok(VirtAddr::new(address))
}

fn parse_u64(text: &str) -> Result<u64> {
    if let Some(digits) = text.strip_prefix("0x") {
        u64::from_str_radix(digits, 16).context("invalid hexadecimal value")
    } else {
        text.parse().context("invalid integer value")
    }
}

fn parse_byte_vector(text: &str) -> Result<Vec<u8>> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .context("expected bytes like [0xde,0xad,0xbe,0xef]")?;

    inner
        .split(',')
        .map(|part| {
            let part = part.trim();
            let part = part.strip_prefix("0x").unwrap_or(part);
            u8::from_str_radix(part, 16).context("invalid byte")
        })
        .collect()
}

fn print_help(args: &[&str]) {
    if args.len() == 1 {
        eprintln!(
            "Available commands:
    breakpoint  - Commands for operating on breakpoints
    continue    - Resume the process
    disassemble - Disassemble machine code to assembly
    memory      - Commands for operating on memory
    register    - Commands for operating on registers
    step        - Step over a single instruction
    watchpoint  - Commands for operating on watchpoints"
        );
    } else if is_prefix(args[1], "breakpoint") {
        eprintln!(
            "Available commands:
    list
    delete <id>
    disable <id>
    enable <id>
    set <address>
    set <address> -h"
        );
    } else if is_prefix(args[1], "disassemble") {
        eprintln!(
            "Available options:
    -c <number of instructions>
    -a <start address>"
        );
    } else if is_prefix(args[1], "memory") {
        eprintln!(
            "Available commands:
    read <address>
    read <address> <number_of_bytes>
    write <address> <bytes>"
        );
    } else if is_prefix(args[1], "register") {
        eprintln!(
            "Available commands:
    read
    read <register>
    read all
    write <register> <value>"
        );
    } else if is_prefix(args[1], "watchpoint") {
        eprintln!(
            "Available commands:
    list
    delete <id>
    disable <id>
    enable <id>
    set <address> <write|rw|execute> <size>"
        );
    } else {
        eprintln!("No help available on that");
    }
}
