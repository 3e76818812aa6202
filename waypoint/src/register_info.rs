/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The static register catalog.
//!
//! One entry per CPU register the debugger can touch: its name, DWARF number,
//! byte size, offset into the kernel user area, class, and display format.
//! The `register_list!` macro below is the single source of truth; it
//! generates both the dense [`RegisterId`] enum and the info table, with
//! user-area offsets computed from the `libc` struct layouts.

use crate::error::Error;
use crate::error::Result;

/// Class of a register.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RegisterKind {
    /// A full 64-bit general-purpose register.
    Gpr,
    /// An aliased slice of a general-purpose register (`eax`, `ah`, ...).
    SubGpr,
    /// An x87/SSE floating-point register or FP status word.
    Fpr,
    /// An x86 debug register.
    Dr,
}

/// How values of a register are rendered and typed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RegisterFormat {
    /// Unsigned integer of the register's size.
    Uint,
    /// IEEE double precision float.
    DoubleFloat,
    /// x87 80-bit extended float, stored in a 16-byte slot.
    LongDouble,
    /// Raw byte vector (MMX/SSE).
    Vector,
}

/// Static description of one register.
#[derive(Debug)]
pub struct RegisterInfo {
    /// Dense internal id.
    pub id: RegisterId,
    /// Lower-case register name, as the shell spells it.
    pub name: &'static str,
    /// DWARF register number, where one exists.
    pub dwarf: Option<i32>,
    /// Value size in bytes.
    pub size: usize,
    /// Byte offset into the kernel-exposed `user` area.
    pub offset: usize,
    /// Register class.
    pub kind: RegisterKind,
    /// Value format.
    pub format: RegisterFormat,
}

const fn dwarf_opt(raw: i32) -> Option<i32> {
    if raw < 0 { None } else { Some(raw) }
}

const FP_SLOT: usize = 16;
const DR_SIZE: usize = 8;

// The catalog. Columns: (name, location, dwarf, kind, format, size).
// Locations name the backing field of `libc::user`; `gpr8h` is the
// high-byte alias one past its parent's offset.
macro_rules! register_list {
    ($m:ident) => {
        $m! {
            // 64-bit general purpose registers.
            (rax, gpr(rax), 0, Gpr, Uint, 8);
            (rdx, gpr(rdx), 1, Gpr, Uint, 8);
            (rcx, gpr(rcx), 2, Gpr, Uint, 8);
            (rbx, gpr(rbx), 3, Gpr, Uint, 8);
            (rsi, gpr(rsi), 4, Gpr, Uint, 8);
            (rdi, gpr(rdi), 5, Gpr, Uint, 8);
            (rbp, gpr(rbp), 6, Gpr, Uint, 8);
            (rsp, gpr(rsp), 7, Gpr, Uint, 8);
            (r8, gpr(r8), 8, Gpr, Uint, 8);
            (r9, gpr(r9), 9, Gpr, Uint, 8);
            (r10, gpr(r10), 10, Gpr, Uint, 8);
            (r11, gpr(r11), 11, Gpr, Uint, 8);
            (r12, gpr(r12), 12, Gpr, Uint, 8);
            (r13, gpr(r13), 13, Gpr, Uint, 8);
            (r14, gpr(r14), 14, Gpr, Uint, 8);
            (r15, gpr(r15), 15, Gpr, Uint, 8);
            (rip, gpr(rip), 16, Gpr, Uint, 8);
            (eflags, gpr(eflags), 49, Gpr, Uint, 8);
            (cs, gpr(cs), 51, Gpr, Uint, 8);
            (fs, gpr(fs), 54, Gpr, Uint, 8);
            (gs, gpr(gs), 55, Gpr, Uint, 8);
            (ss, gpr(ss), 52, Gpr, Uint, 8);
            (ds, gpr(ds), 53, Gpr, Uint, 8);
            (es, gpr(es), 50, Gpr, Uint, 8);
            (orig_rax, gpr(orig_rax), -1, Gpr, Uint, 8);
            (fs_base, gpr(fs_base), 58, Gpr, Uint, 8);
            (gs_base, gpr(gs_base), 59, Gpr, Uint, 8);

            // 32-bit sub-registers.
            (eax, gpr(rax), -1, SubGpr, Uint, 4);
            (edx, gpr(rdx), -1, SubGpr, Uint, 4);
            (ecx, gpr(rcx), -1, SubGpr, Uint, 4);
            (ebx, gpr(rbx), -1, SubGpr, Uint, 4);
            (esi, gpr(rsi), -1, SubGpr, Uint, 4);
            (edi, gpr(rdi), -1, SubGpr, Uint, 4);
            (ebp, gpr(rbp), -1, SubGpr, Uint, 4);
            (esp, gpr(rsp), -1, SubGpr, Uint, 4);
            (r8d, gpr(r8), -1, SubGpr, Uint, 4);
            (r9d, gpr(r9), -1, SubGpr, Uint, 4);
            (r10d, gpr(r10), -1, SubGpr, Uint, 4);
            (r11d, gpr(r11), -1, SubGpr, Uint, 4);
            (r12d, gpr(r12), -1, SubGpr, Uint, 4);
            (r13d, gpr(r13), -1, SubGpr, Uint, 4);
            (r14d, gpr(r14), -1, SubGpr, Uint, 4);
            (r15d, gpr(r15), -1, SubGpr, Uint, 4);

            // 16-bit sub-registers.
            (ax, gpr(rax), -1, SubGpr, Uint, 2);
            (dx, gpr(rdx), -1, SubGpr, Uint, 2);
            (cx, gpr(rcx), -1, SubGpr, Uint, 2);
            (bx, gpr(rbx), -1, SubGpr, Uint, 2);
            (si, gpr(rsi), -1, SubGpr, Uint, 2);
            (di, gpr(rdi), -1, SubGpr, Uint, 2);
            (bp, gpr(rbp), -1, SubGpr, Uint, 2);
            (sp, gpr(rsp), -1, SubGpr, Uint, 2);
            (r8w, gpr(r8), -1, SubGpr, Uint, 2);
            (r9w, gpr(r9), -1, SubGpr, Uint, 2);
            (r10w, gpr(r10), -1, SubGpr, Uint, 2);
            (r11w, gpr(r11), -1, SubGpr, Uint, 2);
            (r12w, gpr(r12), -1, SubGpr, Uint, 2);
            (r13w, gpr(r13), -1, SubGpr, Uint, 2);
            (r14w, gpr(r14), -1, SubGpr, Uint, 2);
            (r15w, gpr(r15), -1, SubGpr, Uint, 2);

            // High-byte sub-registers.
            (ah, gpr8h(rax), -1, SubGpr, Uint, 1);
            (dh, gpr8h(rdx), -1, SubGpr, Uint, 1);
            (ch, gpr8h(rcx), -1, SubGpr, Uint, 1);
            (bh, gpr8h(rbx), -1, SubGpr, Uint, 1);

            // Low-byte sub-registers.
            (al, gpr(rax), -1, SubGpr, Uint, 1);
            (dl, gpr(rdx), -1, SubGpr, Uint, 1);
            (cl, gpr(rcx), -1, SubGpr, Uint, 1);
            (bl, gpr(rbx), -1, SubGpr, Uint, 1);
            (sil, gpr(rsi), -1, SubGpr, Uint, 1);
            (dil, gpr(rdi), -1, SubGpr, Uint, 1);
            (bpl, gpr(rbp), -1, SubGpr, Uint, 1);
            (spl, gpr(rsp), -1, SubGpr, Uint, 1);
            (r8b, gpr(r8), -1, SubGpr, Uint, 1);
            (r9b, gpr(r9), -1, SubGpr, Uint, 1);
            (r10b, gpr(r10), -1, SubGpr, Uint, 1);
            (r11b, gpr(r11), -1, SubGpr, Uint, 1);
            (r12b, gpr(r12), -1, SubGpr, Uint, 1);
            (r13b, gpr(r13), -1, SubGpr, Uint, 1);
            (r14b, gpr(r14), -1, SubGpr, Uint, 1);
            (r15b, gpr(r15), -1, SubGpr, Uint, 1);

            // x87 control and status words.
            (fcw, fpu(cwd), 65, Fpr, Uint, 2);
            (fsw, fpu(swd), 66, Fpr, Uint, 2);
            (ftw, fpu(ftw), -1, Fpr, Uint, 2);
            (fop, fpu(fop), -1, Fpr, Uint, 2);
            (frip, fpu(rip), -1, Fpr, Uint, 8);
            (frdp, fpu(rdp), -1, Fpr, Uint, 8);
            (mxcsr, fpu(mxcsr), 64, Fpr, Uint, 4);
            (mxcsrmask, fpu(mxcr_mask), -1, Fpr, Uint, 4);

            // x87 stack registers, 16-byte slots.
            (st0, fp_slot(st_space, 0), 33, Fpr, LongDouble, 16);
            (st1, fp_slot(st_space, 1), 34, Fpr, LongDouble, 16);
            (st2, fp_slot(st_space, 2), 35, Fpr, LongDouble, 16);
            (st3, fp_slot(st_space, 3), 36, Fpr, LongDouble, 16);
            (st4, fp_slot(st_space, 4), 37, Fpr, LongDouble, 16);
            (st5, fp_slot(st_space, 5), 38, Fpr, LongDouble, 16);
            (st6, fp_slot(st_space, 6), 39, Fpr, LongDouble, 16);
            (st7, fp_slot(st_space, 7), 40, Fpr, LongDouble, 16);

            // MMX registers alias the low 8 bytes of the x87 slots.
            (mm0, fp_slot(st_space, 0), 41, Fpr, Vector, 8);
            (mm1, fp_slot(st_space, 1), 42, Fpr, Vector, 8);
            (mm2, fp_slot(st_space, 2), 43, Fpr, Vector, 8);
            (mm3, fp_slot(st_space, 3), 44, Fpr, Vector, 8);
            (mm4, fp_slot(st_space, 4), 45, Fpr, Vector, 8);
            (mm5, fp_slot(st_space, 5), 46, Fpr, Vector, 8);
            (mm6, fp_slot(st_space, 6), 47, Fpr, Vector, 8);
            (mm7, fp_slot(st_space, 7), 48, Fpr, Vector, 8);

            // SSE registers.
            (xmm0, fp_slot(xmm_space, 0), 17, Fpr, Vector, 16);
            (xmm1, fp_slot(xmm_space, 1), 18, Fpr, Vector, 16);
            (xmm2, fp_slot(xmm_space, 2), 19, Fpr, Vector, 16);
            (xmm3, fp_slot(xmm_space, 3), 20, Fpr, Vector, 16);
            (xmm4, fp_slot(xmm_space, 4), 21, Fpr, Vector, 16);
            (xmm5, fp_slot(xmm_space, 5), 22, Fpr, Vector, 16);
            (xmm6, fp_slot(xmm_space, 6), 23, Fpr, Vector, 16);
            (xmm7, fp_slot(xmm_space, 7), 24, Fpr, Vector, 16);
            (xmm8, fp_slot(xmm_space, 8), 25, Fpr, Vector, 16);
            (xmm9, fp_slot(xmm_space, 9), 26, Fpr, Vector, 16);
            (xmm10, fp_slot(xmm_space, 10), 27, Fpr, Vector, 16);
            (xmm11, fp_slot(xmm_space, 11), 28, Fpr, Vector, 16);
            (xmm12, fp_slot(xmm_space, 12), 29, Fpr, Vector, 16);
            (xmm13, fp_slot(xmm_space, 13), 30, Fpr, Vector, 16);
            (xmm14, fp_slot(xmm_space, 14), 31, Fpr, Vector, 16);
            (xmm15, fp_slot(xmm_space, 15), 32, Fpr, Vector, 16);

            // Debug registers.
            (dr0, debugreg(0), -1, Dr, Uint, 8);
            (dr1, debugreg(1), -1, Dr, Uint, 8);
            (dr2, debugreg(2), -1, Dr, Uint, 8);
            (dr3, debugreg(3), -1, Dr, Uint, 8);
            (dr4, debugreg(4), -1, Dr, Uint, 8);
            (dr5, debugreg(5), -1, Dr, Uint, 8);
            (dr6, debugreg(6), -1, Dr, Uint, 8);
            (dr7, debugreg(7), -1, Dr, Uint, 8);
        }
    };
}

macro_rules! define_register_id {
    ( $( ($name:ident, $loc:ident($($loc_args:tt)*), $dwarf:expr, $kind:ident, $format:ident, $size:expr); )* ) => {
        /// Dense id of every register in the catalog. Names mirror the
        /// assembly spelling.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        #[allow(non_camel_case_types)]
        #[allow(missing_docs)]
        pub enum RegisterId {
            $( $name, )*
        }
    };
}

macro_rules! define_register_infos {
    ( $( ($name:ident, $loc:ident($($loc_args:tt)*), $dwarf:expr, $kind:ident, $format:ident, $size:expr); )* ) => {
        /// The catalog, in [`RegisterId`] order.
        pub const REGISTER_INFOS: &[RegisterInfo] = &[
            $(
                RegisterInfo {
                    id: RegisterId::$name,
                    name: stringify!($name),
                    dwarf: dwarf_opt($dwarf),
                    size: $size,
                    offset: define_register_infos!(@offset $loc($($loc_args)*)),
                    kind: RegisterKind::$kind,
                    format: RegisterFormat::$format,
                },
            )*
        ];
    };

    (@offset gpr($field:ident)) => {
        memoffset::offset_of!(libc::user, regs)
            + memoffset::offset_of!(libc::user_regs_struct, $field)
    };
    (@offset gpr8h($field:ident)) => {
        memoffset::offset_of!(libc::user, regs)
            + memoffset::offset_of!(libc::user_regs_struct, $field)
            + 1
    };
    (@offset fpu($field:ident)) => {
        memoffset::offset_of!(libc::user, i387)
            + memoffset::offset_of!(libc::user_fpregs_struct, $field)
    };
    (@offset fp_slot($field:ident, $index:expr)) => {
        memoffset::offset_of!(libc::user, i387)
            + memoffset::offset_of!(libc::user_fpregs_struct, $field)
            + $index * FP_SLOT
    };
    (@offset debugreg($index:expr)) => {
        memoffset::offset_of!(libc::user, u_debugreg) + $index * DR_SIZE
    };
}

register_list!(define_register_id);
register_list!(define_register_infos);

impl RegisterId {
    /// The id of debug register `index` (0 through 7).
    ///
    /// Panics on an out-of-range index; slot indices inside the engine only
    /// ever come from the four-entry allocator or the fixed 0..8 refresh
    /// loop.
    pub fn dr(index: usize) -> Self {
        match index {
            0 => Self::dr0,
            1 => Self::dr1,
            2 => Self::dr2,
            3 => Self::dr3,
            4 => Self::dr4,
            5 => Self::dr5,
            6 => Self::dr6,
            7 => Self::dr7,
            _ => panic!("debug register index out of range: {index}"),
        }
    }
}

/// Looks up the catalog entry for `id`.
pub fn register_info_by_id(id: RegisterId) -> &'static RegisterInfo {
    let info = &REGISTER_INFOS[id as usize];
    debug_assert_eq!(info.id, id);
    info
}

/// Looks up a register by its lower-case name, e.g. `"rip"` or `"xmm3"`.
pub fn register_info_by_name(name: &str) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::usage(format!("no register named '{name}'")))
}

/// Looks up a register by its DWARF number.
pub fn register_info_by_dwarf(dwarf: i32) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.dwarf == Some(dwarf))
        .ok_or_else(|| Error::usage(format!("no register with DWARF number {dwarf}")))
}
