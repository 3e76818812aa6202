/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thin adapter over the iced-x86 instruction decoder.

use iced_x86::Decoder;
use iced_x86::DecoderOptions;
use iced_x86::Formatter;
use iced_x86::IntelFormatter;

use crate::addr::VirtAddr;
use crate::error::Result;
use crate::process::Process;

/// Maximum encoded length of one x86 instruction.
const MAX_INSTRUCTION_LEN: usize = 15;

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Where the instruction starts.
    pub address: VirtAddr,
    /// Intel-syntax text.
    pub text: String,
}

/// Decodes `count` instructions starting at `address` (the current pc when
/// `None`).
///
/// The decoder is fed through [`Process::read_memory_without_traps`], so
/// armed software breakpoints never show up as spurious `int3`s.
pub fn disassemble(
    process: &Process,
    address: Option<VirtAddr>,
    count: usize,
) -> Result<Vec<Instruction>> {
    let address = address.unwrap_or_else(|| process.get_pc());
    let code = process.read_memory_without_traps(address, count * MAX_INSTRUCTION_LEN)?;

    let mut decoder = Decoder::with_ip(64, &code, address.as_u64(), DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instructions = Vec::with_capacity(count);
    let mut text = String::new();

    while instructions.len() < count && decoder.can_decode() {
        let instruction = decoder.decode();
        text.clear();
        formatter.format(&instruction, &mut text);
        instructions.push(Instruction {
            address: VirtAddr::new(instruction.ip()),
            text: text.clone(),
        });
    }

    Ok(instructions)
}
