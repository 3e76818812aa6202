/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hardware data watchpoints.

use core::fmt;

use crate::addr::VirtAddr;
use crate::error::Error;
use crate::error::Result;
use crate::stoppoint::StopPoint;
use crate::stoppoint::StopPointId;

/// What kind of access fires a hardware stop-point.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StopPointMode {
    /// Instruction fetch. Equivalent to a hardware breakpoint of length 1.
    Execute,
    /// Data write.
    Write,
    /// Data read or write.
    ReadWrite,
}

impl fmt::Display for StopPointMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::ReadWrite => "read/write",
        };
        fmt::Write::write_str(f, text)
    }
}

/// One hardware data watchpoint over `size` bytes at an address.
///
/// Like breakpoint sites, watchpoints are passive records: the owning
/// [`crate::Process`] arms them into a debug-register slot, keeps
/// `data`/`previous_data` up to date when they fire, and disarms them on
/// removal.
#[derive(Debug)]
pub struct Watchpoint {
    pub(crate) id: StopPointId,
    pub(crate) address: VirtAddr,
    pub(crate) mode: StopPointMode,
    pub(crate) size: usize,
    pub(crate) is_enabled: bool,
    pub(crate) hardware_slot: Option<usize>,
    /// The watched bytes as of the last sample, zero-extended into a word.
    pub(crate) data: Option<u64>,
    /// The sample before the most recent one. Empty until the watchpoint
    /// first fires.
    pub(crate) previous_data: Option<u64>,
}

impl Watchpoint {
    pub(crate) fn new(
        id: StopPointId,
        address: VirtAddr,
        mode: StopPointMode,
        size: usize,
    ) -> Result<Self> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(Error::usage(format!(
                "invalid watchpoint size {size}; must be 1, 2, 4, or 8"
            )));
        }
        if address.as_u64() & (size as u64 - 1) != 0 {
            return Err(Error::usage(format!(
                "watchpoint address {address} is not aligned to its size {size}"
            )));
        }

        Ok(Self {
            id,
            address,
            mode,
            size,
            is_enabled: false,
            hardware_slot: None,
            data: None,
            previous_data: None,
        })
    }

    /// The access kind this watchpoint observes.
    pub fn mode(&self) -> StopPointMode {
        self.mode
    }

    /// The watched span in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The occupied debug-register slot while enabled.
    pub fn hardware_slot(&self) -> Option<usize> {
        self.hardware_slot
    }

    /// The watched bytes as of the last sample.
    pub fn data(&self) -> Option<u64> {
        self.data
    }

    /// The sample before the most recent one.
    pub fn previous_data(&self) -> Option<u64> {
        self.previous_data
    }
}

impl StopPoint for Watchpoint {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_must_be_a_hardware_length() {
        for size in [1, 2, 4, 8] {
            assert!(Watchpoint::new(1, VirtAddr::new(0x1000), StopPointMode::Write, size).is_ok());
        }
        for size in [0, 3, 5, 16] {
            assert!(Watchpoint::new(1, VirtAddr::new(0x1000), StopPointMode::Write, size).is_err());
        }
    }

    #[test]
    fn address_must_be_aligned() {
        assert!(Watchpoint::new(1, VirtAddr::new(0x1001), StopPointMode::Write, 4).is_err());
        assert!(Watchpoint::new(1, VirtAddr::new(0x1004), StopPointMode::Write, 4).is_ok());
        // Byte watchpoints have no alignment requirement.
        assert!(Watchpoint::new(1, VirtAddr::new(0x1003), StopPointMode::ReadWrite, 1).is_ok());
    }
}
