/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Software and hardware breakpoint sites.

use crate::addr::VirtAddr;
use crate::stoppoint::StopPoint;
use crate::stoppoint::StopPointId;

/// The one-byte x86 software trap opcode.
pub(crate) const INT3: u8 = 0xcc;

/// One breakpoint at a virtual address.
///
/// A software site patches [`INT3`] over the first byte of the instruction at
/// its address; a hardware site occupies one of the four debug-register
/// slots. Sites are created through [`crate::Process::create_breakpoint_site`]
/// and armed, disarmed, and removed through the owning process, which holds
/// the only handle to the tracee.
#[derive(Debug)]
pub struct BreakpointSite {
    pub(crate) id: StopPointId,
    pub(crate) address: VirtAddr,
    pub(crate) is_enabled: bool,
    pub(crate) is_hardware: bool,
    pub(crate) is_internal: bool,
    /// The original first byte of the patched instruction. `Some` exactly
    /// while a software site is enabled.
    pub(crate) saved_byte: Option<u8>,
    /// The debug-register slot. `Some` exactly while a hardware site is
    /// enabled.
    pub(crate) hardware_slot: Option<usize>,
}

impl BreakpointSite {
    pub(crate) fn new(
        id: StopPointId,
        address: VirtAddr,
        is_hardware: bool,
        is_internal: bool,
    ) -> Self {
        Self {
            id,
            address,
            is_enabled: false,
            is_hardware,
            is_internal,
            saved_byte: None,
            hardware_slot: None,
        }
    }

    /// Whether this site uses a debug-register slot instead of an `int3`
    /// patch.
    pub fn is_hardware(&self) -> bool {
        self.is_hardware
    }

    /// Whether this site was created for the engine's own use. Internal
    /// sites carry negative ids and are skipped by listings.
    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// The occupied debug-register slot of an enabled hardware site.
    pub fn hardware_slot(&self) -> Option<usize> {
        self.hardware_slot
    }
}

impl StopPoint for BreakpointSite {
    fn id(&self) -> StopPointId {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }
}
