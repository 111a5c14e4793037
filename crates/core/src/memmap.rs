//! Paged physical address map.
//!
//! The 32-bit address space is split into 64 KiB windows. Each window points
//! into a backing region at some offset, so a buffer smaller than the range it
//! is installed over repeats (mirrors) across that range. Windows that nothing
//! has been installed over point at the dummy region: reads return
//! [`DUMMY_FILL`] and writes are dropped.
//!
//! Regions are stored big-endian, matching the bus they model.

use thiserror::Error;

/// Address bits covered by a single window.
pub const WINDOW_BITS: u32 = 16;
/// Bytes covered by a single window.
pub const WINDOW_SIZE: usize = 1 << WINDOW_BITS;
const WINDOW_MASK: u32 = WINDOW_SIZE as u32 - 1;
const WINDOW_COUNT: usize = 1 << (32 - WINDOW_BITS);

/// Byte value of every read that lands in the dummy region.
pub const DUMMY_FILL: u8 = 0x00;

/// Handle to a backing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u16);

impl RegionId {
    /// Read-as-fill, write-ignored region backing every unmapped window.
    pub const DUMMY: RegionId = RegionId(0);
}

/// Access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Long => 4,
        }
    }

    /// Clear the low address bits this width ignores.
    pub fn align(self, addr: u32) -> u32 {
        addr & !(self.bytes() - 1)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("range {start:#010x}-{end:#010x} is not window aligned")]
    Unaligned { start: u32, end: u32 },
    #[error("region length {0:#x} is not a non-zero multiple of the window size")]
    BadLength(usize),
    #[error("region length {len:#x} exceeds range length {range:#x}")]
    RegionTooLarge { len: usize, range: u64 },
    #[error("unknown region {0:?}")]
    UnknownRegion(RegionId),
    #[error("too many regions")]
    Full,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    region: RegionId,
    offset: usize,
    writable: bool,
}

const UNMAPPED: Window = Window {
    region: RegionId::DUMMY,
    offset: 0,
    writable: false,
};

#[derive(Debug, Clone)]
struct Region {
    name: String,
    data: Vec<u8>,
}

/// Window table plus the buffers it points into.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    regions: Vec<Region>,
    windows: Vec<Window>,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            regions: vec![Region {
                name: "dummy".to_string(),
                data: vec![DUMMY_FILL; WINDOW_SIZE],
            }],
            windows: vec![UNMAPPED; WINDOW_COUNT],
        }
    }

    /// Register a backing buffer. Its length must be a non-zero multiple of
    /// [`WINDOW_SIZE`].
    pub fn add_region(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<RegionId, MapError> {
        if data.is_empty() || data.len() % WINDOW_SIZE != 0 {
            return Err(MapError::BadLength(data.len()));
        }
        let id = u16::try_from(self.regions.len()).map_err(|_| MapError::Full)?;
        self.regions.push(Region {
            name: name.into(),
            data,
        });
        Ok(RegionId(id))
    }

    fn region_ref(&self, id: RegionId) -> Result<&Region, MapError> {
        self.regions.get(id.0 as usize).ok_or(MapError::UnknownRegion(id))
    }

    pub fn region_name(&self, id: RegionId) -> Option<&str> {
        self.regions.get(id.0 as usize).map(|r| r.name.as_str())
    }

    pub fn region(&self, id: RegionId) -> Option<&[u8]> {
        self.regions.get(id.0 as usize).map(|r| r.data.as_slice())
    }

    /// Mutable access to a region's contents. The dummy region stays
    /// read-only.
    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut [u8]> {
        if id == RegionId::DUMMY {
            return None;
        }
        self.regions.get_mut(id.0 as usize).map(|r| r.data.as_mut_slice())
    }

    /// Point every window in `start..=end` at `region`, or at the dummy region
    /// when `region` is `None`. The region repeats across the range.
    pub fn install(&mut self, start: u32, end: u32, region: Option<RegionId>, writable: bool) -> Result<(), MapError> {
        let bound = end as u64 + 1;
        if start & WINDOW_MASK != 0 || bound % WINDOW_SIZE as u64 != 0 || bound <= start as u64 {
            return Err(MapError::Unaligned { start, end });
        }

        let region = region.unwrap_or(RegionId::DUMMY);
        let len = self.region_ref(region)?.data.len();
        let range = bound - start as u64;
        if region != RegionId::DUMMY && len as u64 > range {
            return Err(MapError::RegionTooLarge { len, range });
        }
        let writable = writable && region != RegionId::DUMMY;

        let mut addr = start as u64;
        while addr < bound {
            let offset = if region == RegionId::DUMMY {
                0
            } else {
                ((addr - start as u64) % len as u64) as usize
            };
            self.windows[(addr >> WINDOW_BITS) as usize] = Window {
                region,
                offset,
                writable,
            };
            addr += WINDOW_SIZE as u64;
        }
        Ok(())
    }

    #[inline]
    fn window(&self, addr: u32) -> &Window {
        &self.windows[(addr >> WINDOW_BITS) as usize]
    }

    /// Region and byte offset `addr` resolves to.
    pub fn resolve(&self, addr: u32) -> (RegionId, usize) {
        let w = self.window(addr);
        (w.region, w.offset + (addr & WINDOW_MASK) as usize)
    }

    pub fn is_writable(&self, addr: u32) -> bool {
        self.window(addr).writable
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.window(addr).region != RegionId::DUMMY
    }

    /// Big-endian read, address aligned down to the access width.
    pub fn read(&self, addr: u32, width: Width) -> u32 {
        let addr = width.align(addr);
        let (region, off) = self.resolve(addr);
        read_be(&self.regions[region.0 as usize].data[off..], width)
    }

    /// Big-endian write. Returns whether the target was writable.
    pub fn write(&mut self, addr: u32, width: Width, value: u32) -> bool {
        let addr = width.align(addr);
        let w = *self.window(addr);
        if !w.writable {
            return false;
        }
        let off = w.offset + (addr & WINDOW_MASK) as usize;
        write_be(&mut self.regions[w.region.0 as usize].data[off..], width, value);
        true
    }
}

fn read_be(bytes: &[u8], width: Width) -> u32 {
    match width {
        Width::Byte => bytes[0] as u32,
        Width::Word => u16::from_be_bytes([bytes[0], bytes[1]]) as u32,
        Width::Long => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn write_be(bytes: &mut [u8], width: Width, value: u32) {
    match width {
        Width::Byte => bytes[0] = value as u8,
        Width::Word => bytes[..2].copy_from_slice(&(value as u16).to_be_bytes()),
        Width::Long => bytes[..4].copy_from_slice(&value.to_be_bytes()),
    }
}
