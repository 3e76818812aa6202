/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The tracee register file: a typed view over the kernel user-area image.

use core::fmt;

use crate::error::Error;
use crate::error::Result;
use crate::register_info::register_info_by_id;
use crate::register_info::RegisterFormat;
use crate::register_info::RegisterId;
use crate::register_info::RegisterInfo;

/// A value read from or written to a single register.
///
/// Reads produce the variant dictated by the register's catalog entry. Writes
/// accept any variant that fits: integers narrower than the register are
/// zero-extended, everything else must match the register size exactly.
#[derive(Debug, Copy, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// An x87 80-bit extended float in its 16-byte register slot.
    LongDouble([u8; 16]),
    Bytes8([u8; 8]),
    Bytes16([u8; 16]),
}

impl RegisterValue {
    /// Payload width in bytes.
    pub fn byte_width(&self) -> usize {
        match self {
            Self::U8(_) | Self::I8(_) => 1,
            Self::U16(_) | Self::I16(_) => 2,
            Self::U32(_) | Self::I32(_) | Self::F32(_) => 4,
            Self::U64(_) | Self::I64(_) | Self::F64(_) | Self::Bytes8(_) => 8,
            Self::LongDouble(_) | Self::Bytes16(_) => 16,
        }
    }

    /// The value as an unsigned 64-bit integer, if it is an integer.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => Some(v),
            Self::I8(v) => Some(v as u8 as u64),
            Self::I16(v) => Some(v as u16 as u64),
            Self::I32(v) => Some(v as u32 as u64),
            Self::I64(v) => Some(v as u64),
            _ => None,
        }
    }

    fn is_integer(&self) -> bool {
        self.as_u64().is_some()
    }

    /// The value's bytes, zero-extended into a 16-byte little-endian buffer.
    fn widened_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match *self {
            Self::U8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
            Self::U16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            Self::I8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            Self::LongDouble(v) | Self::Bytes16(v) => out = v,
            Self::Bytes8(v) => out[..8].copy_from_slice(&v),
        }
        out
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn bytes(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
            write!(f, "[")?;
            for (i, b) in bytes.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{b:#04x}")?;
            }
            write!(f, "]")
        }

        match self {
            Self::U8(v) => write!(f, "{v:#x}"),
            Self::U16(v) => write!(f, "{v:#x}"),
            Self::U32(v) => write!(f, "{v:#x}"),
            Self::U64(v) => write!(f, "{v:#x}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::LongDouble(v) | Self::Bytes16(v) => bytes(f, v),
            Self::Bytes8(v) => bytes(f, v),
        }
    }
}

/// In-memory image of the tracee's general-purpose, floating-point, and debug
/// registers, laid out exactly as the kernel's per-thread user area.
///
/// The image reflects tracee state as of the last stop; the owning
/// [`crate::Process`] refreshes it on every stop and flushes every write back
/// before the tracee runs again.
#[derive(Debug)]
pub struct Registers {
    data: libc::user,
}

impl Registers {
    pub(crate) fn new() -> Self {
        Self {
            // Plain-old-data image; an all-zero user area is a valid "no
            // state yet" starting point.
            data: unsafe { core::mem::zeroed() },
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                &self.data as *const libc::user as *const u8,
                core::mem::size_of::<libc::user>(),
            )
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                &mut self.data as *mut libc::user as *mut u8,
                core::mem::size_of::<libc::user>(),
            )
        }
    }

    fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.as_bytes()[offset..offset + N]);
        out
    }

    /// Reads a register as the typed value its catalog entry prescribes.
    pub fn read(&self, info: &RegisterInfo) -> RegisterValue {
        use RegisterFormat::*;
        match (info.format, info.size) {
            (Uint, 1) => RegisterValue::U8(u8::from_le_bytes(self.read_bytes(info.offset))),
            (Uint, 2) => RegisterValue::U16(u16::from_le_bytes(self.read_bytes(info.offset))),
            (Uint, 4) => RegisterValue::U32(u32::from_le_bytes(self.read_bytes(info.offset))),
            (Uint, 8) => RegisterValue::U64(u64::from_le_bytes(self.read_bytes(info.offset))),
            (DoubleFloat, 4) => RegisterValue::F32(f32::from_le_bytes(self.read_bytes(info.offset))),
            (DoubleFloat, 8) => RegisterValue::F64(f64::from_le_bytes(self.read_bytes(info.offset))),
            (LongDouble, 16) => RegisterValue::LongDouble(self.read_bytes(info.offset)),
            (Vector, 8) => RegisterValue::Bytes8(self.read_bytes(info.offset)),
            (Vector, 16) => RegisterValue::Bytes16(self.read_bytes(info.offset)),
            (format, size) => unreachable!("malformed catalog entry: {format:?}/{size}"),
        }
    }

    /// Reads a register by id.
    pub fn read_by_id(&self, id: RegisterId) -> RegisterValue {
        self.read(register_info_by_id(id))
    }

    /// Reads an integer register, zero-extended to 64 bits.
    pub fn read_u64(&self, id: RegisterId) -> u64 {
        match self.read_by_id(id).as_u64() {
            Some(value) => value,
            None => unreachable!("{:?} is not an integer register", id),
        }
    }

    /// Splices `value` into the image at `info`'s slot.
    ///
    /// This only updates the image; the owning process flushes the covering
    /// user-area word (or the whole FP block) to the tracee.
    pub(crate) fn write(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        let width = value.byte_width();
        if width > info.size || (!value.is_integer() && width != info.size) {
            return Err(Error::usage(format!(
                "a {width}-byte value does not fit register {} ({} bytes)",
                info.name, info.size
            )));
        }

        let widened = value.widened_bytes();
        let offset = info.offset;
        self.as_bytes_mut()[offset..offset + info.size].copy_from_slice(&widened[..info.size]);
        Ok(())
    }

    /// The user-area word covering `aligned_offset`, for `PTRACE_POKEUSER`.
    pub(crate) fn user_word_at(&self, aligned_offset: usize) -> u64 {
        debug_assert_eq!(aligned_offset % 8, 0);
        u64::from_le_bytes(self.read_bytes(aligned_offset))
    }

    pub(crate) fn set_gprs(&mut self, regs: libc::user_regs_struct) {
        self.data.regs = regs;
    }

    pub(crate) fn set_fprs(&mut self, fpregs: libc::user_fpregs_struct) {
        self.data.i387 = fpregs;
    }

    pub(crate) fn set_debugreg(&mut self, index: usize, value: u64) {
        self.data.u_debugreg[index] = value;
    }

    /// The raw general-purpose register block.
    pub fn gprs(&self) -> &libc::user_regs_struct {
        &self.data.regs
    }

    /// The raw floating-point register block.
    pub fn fprs(&self) -> &libc::user_fpregs_struct {
        &self.data.i387
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_info::register_info_by_name;

    #[test]
    fn write_then_read() {
        let mut regs = Registers::new();
        let rax = register_info_by_id(RegisterId::rax);

        regs.write(rax, RegisterValue::U64(0xdead_beef_cafe_f00d)).unwrap();
        assert_eq!(
            regs.read_by_id(RegisterId::rax),
            RegisterValue::U64(0xdead_beef_cafe_f00d)
        );
    }

    #[test]
    fn sub_registers_alias() {
        let mut regs = Registers::new();
        regs.write(
            register_info_by_id(RegisterId::rax),
            RegisterValue::U64(0x1111_2222_3333_4444),
        )
        .unwrap();

        assert_eq!(
            regs.read_by_id(RegisterId::eax),
            RegisterValue::U32(0x3333_4444)
        );
        assert_eq!(regs.read_by_id(RegisterId::ax), RegisterValue::U16(0x4444));
        assert_eq!(regs.read_by_id(RegisterId::al), RegisterValue::U8(0x44));
        assert_eq!(regs.read_by_id(RegisterId::ah), RegisterValue::U8(0x44));

        // Writing a sub-register only touches its slice of the parent.
        regs.write(register_info_by_id(RegisterId::ah), RegisterValue::U8(0xff))
            .unwrap();
        assert_eq!(regs.read_u64(RegisterId::rax), 0x1111_2222_3333_ff44);
    }

    #[test]
    fn integer_writes_zero_extend() {
        let mut regs = Registers::new();
        let rdx = register_info_by_id(RegisterId::rdx);

        regs.write(rdx, RegisterValue::U64(u64::MAX)).unwrap();
        regs.write(rdx, RegisterValue::U8(0x7f)).unwrap();
        assert_eq!(regs.read_u64(RegisterId::rdx), 0x7f);

        regs.write(rdx, RegisterValue::I16(-1)).unwrap();
        assert_eq!(regs.read_u64(RegisterId::rdx), 0xffff);
    }

    #[test]
    fn oversized_write_fails_and_changes_nothing() {
        let mut regs = Registers::new();
        let eax = register_info_by_name("eax").unwrap();

        regs.write(eax, RegisterValue::U32(7)).unwrap();
        let err = regs.write(eax, RegisterValue::U64(1)).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(regs.read_by_id(RegisterId::eax), RegisterValue::U32(7));
    }

    #[test]
    fn non_integer_widths_must_match() {
        let mut regs = Registers::new();
        let st0 = register_info_by_id(RegisterId::st0);
        let xmm0 = register_info_by_id(RegisterId::xmm0);

        assert!(regs.write(st0, RegisterValue::F64(1.0)).is_err());
        assert!(regs.write(st0, RegisterValue::LongDouble([0xab; 16])).is_ok());

        let value = RegisterValue::Bytes16([0x5a; 16]);
        regs.write(xmm0, value).unwrap();
        assert_eq!(regs.read_by_id(RegisterId::xmm0), value);
        assert!(regs.write(xmm0, RegisterValue::Bytes8([0; 8])).is_err());
    }

    #[test]
    fn debug_registers() {
        let mut regs = Registers::new();
        regs.set_debugreg(7, 0xf0f0);
        assert_eq!(regs.read_u64(RegisterId::dr7), 0xf0f0);

        regs.write(
            register_info_by_id(RegisterId::dr0),
            RegisterValue::U64(0x401000),
        )
        .unwrap();
        assert_eq!(regs.read_u64(RegisterId::dr(0)), 0x401000);
    }

    #[test]
    fn value_formatting() {
        assert_eq!(RegisterValue::U64(0xff).to_string(), "0xff");
        assert_eq!(RegisterValue::I32(-3).to_string(), "-3");
        assert_eq!(
            RegisterValue::Bytes8([1, 2, 3, 4, 5, 6, 7, 8]).to_string(),
            "[0x01,0x02,0x03,0x04,0x05,0x06,0x07,0x08]"
        );
    }
}
