/// The four register classes served by the dispatcher
///
/// Coil and discrete-input memory holds one byte per point (0 or 1) so that
/// the application can address points directly by byte. Register memory
/// holds two bytes per register, big-endian.

use serde::{Deserialize, Serialize};

use crate::address_space::AddressSpace;
use crate::error::{ServerError, ServerResult};
use crate::DATA_POOL_LENGTH;

/// Register class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl Region {
    /// Snapshot order
    pub const ALL: [Region; 4] = [
        Region::Coil,
        Region::DiscreteInput,
        Region::HoldingRegister,
        Region::InputRegister,
    ];

    /// Bytes of memory per addressable unit
    pub fn unit_size(self) -> usize {
        match self {
            Region::Coil | Region::DiscreteInput => 1,
            Region::HoldingRegister | Region::InputRegister => 2,
        }
    }

    /// Whether protocol clients may write this region
    pub fn is_writable(self) -> bool {
        matches!(self, Region::Coil | Region::HoldingRegister)
    }
}

/// A resolved `(region, offset, length)` triple
///
/// Produced by whatever address parser the embedding application uses.
/// `offset` and `length` are in units of the region (points or registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub region: Region,
    pub offset: u16,
    pub length: u16,
}

impl ResolvedAddress {
    pub fn new(region: Region, offset: u16, length: u16) -> Self {
        Self { region, offset, length }
    }

    /// Byte index of the first unit
    pub fn byte_index(&self) -> usize {
        self.offset as usize * self.region.unit_size()
    }

    /// Number of bytes covered
    pub fn byte_len(&self) -> usize {
        self.length as usize * self.region.unit_size()
    }
}

/// Memory for all four register classes
#[derive(Debug)]
pub struct DataPool {
    units: usize,
    coils: AddressSpace,
    discrete_inputs: AddressSpace,
    holding_registers: AddressSpace,
    input_registers: AddressSpace,
}

impl DataPool {
    /// Create a pool with `units` addressable points/registers per region
    pub fn new(units: usize) -> Self {
        Self {
            units,
            coils: AddressSpace::new(units * Region::Coil.unit_size()),
            discrete_inputs: AddressSpace::new(units * Region::DiscreteInput.unit_size()),
            holding_registers: AddressSpace::new(units * Region::HoldingRegister.unit_size()),
            input_registers: AddressSpace::new(units * Region::InputRegister.unit_size()),
        }
    }

    /// Addressable units per region
    pub fn units(&self) -> usize {
        self.units
    }

    pub fn region(&self, region: Region) -> &AddressSpace {
        match region {
            Region::Coil => &self.coils,
            Region::DiscreteInput => &self.discrete_inputs,
            Region::HoldingRegister => &self.holding_registers,
            Region::InputRegister => &self.input_registers,
        }
    }

    /// Total snapshot size in bytes
    pub fn snapshot_len(&self) -> usize {
        Region::ALL.iter().map(|r| self.region(*r).capacity()).sum()
    }

    /// Concatenation of all regions in snapshot order
    pub fn dump(&self) -> ServerResult<Vec<u8>> {
        let mut blob = Vec::with_capacity(self.snapshot_len());
        for region in Region::ALL {
            blob.extend_from_slice(&self.region(region).dump()?);
        }
        Ok(blob)
    }

    /// Restore all regions from a snapshot
    ///
    /// The size is checked up front so a short blob leaves every region
    /// untouched.
    pub fn load(&self, blob: &[u8]) -> ServerResult<()> {
        let expected = self.snapshot_len();
        if blob.len() < expected {
            return Err(ServerError::snapshot(expected, blob.len()));
        }
        let mut offset = 0;
        for region in Region::ALL {
            let space = self.region(region);
            space.load(&blob[offset..offset + space.capacity()])?;
            offset += space.capacity();
        }
        Ok(())
    }
}

impl Default for DataPool {
    fn default() -> Self {
        Self::new(DATA_POOL_LENGTH)
    }
}
