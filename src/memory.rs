//! Guest physical memory.
//!
//! The guest sees the AGB memory map: BIOS at the bottom, work RAM, the I/O
//! register window, and the cartridge image high up. Everything except the
//! I/O window is plain memory backed by host allocations; the I/O window is
//! never raw-mapped and is instead intercepted by [`io::IoRegisterBank`].
//!
//! Because the host fetches instructions through a separate cache path, any
//! mutation of guest-executable bytes performed outside normal guest stores
//! (image loading, relocation, patching) must be followed by a cache
//! synchronization before guest code runs. The trait models that with
//! [`GuestMemory::sync_caches`]; the virtual machine refuses to start while
//! the caches are out of sync.
//!
//! [`io::IoRegisterBank`]: ../io/struct.IoRegisterBank.html

use memmap::MmapMut;
use utils::NoDebug;

use std::{fmt, iter, ptr};
use std::borrow::Cow;
use std::error::Error;
use std::ops::RangeInclusive;

/// Base address of the guest BIOS image.
pub const BIOS_BASE: u32 = 0x0000_0000;
/// Size of the guest BIOS image in bytes.
pub const BIOS_LEN: u32 = 16 * 1024;
/// Base address of external work RAM.
pub const EWRAM_BASE: u32 = 0x0200_0000;
/// Size of external work RAM.
pub const EWRAM_LEN: u32 = 256 * 1024;
/// Base address of internal work RAM.
pub const IWRAM_BASE: u32 = 0x0300_0000;
/// Size of internal work RAM.
pub const IWRAM_LEN: u32 = 32 * 1024;
/// Base address of the memory-mapped I/O register window.
pub const IO_BASE: u32 = 0x0400_0000;
/// Size of the I/O register window.
pub const IO_LEN: u32 = 0x400;
/// Base address of the cartridge image.
pub const ROM_BASE: u32 = 0x0800_0000;
/// Maximum cartridge image size.
pub const ROM_MAX_LEN: u32 = 32 * 1024 * 1024;

/// End of the guest-addressable span backed by `MmapMemory`.
const GUEST_SPAN: u32 = ROM_BASE + ROM_MAX_LEN;

pub trait GuestMemory {
    /// Maps a block of data into the guest address space.
    ///
    /// It is an error to call this when `range` overlaps an already mapped
    /// piece of memory. If `data` is too small to fill the entire range, it is
    /// padded with 0 bytes.
    ///
    /// # Parameters
    ///
    /// * `range`: The guest address range where the data should be mapped.
    /// * `data`: The data to map into the guest address space.
    /// * `name`: Debug name of the mapping (eg. `<bios>` or `<cart>`).
    fn add_mapping(&mut self, range: RangeInclusive<u32>, data: &[u8], name: &str)
        -> Result<(), MapError>;

    /// Returns an iterator over all currently installed memory mappings.
    fn mappings(&self) -> Mappings;

    /// Determines the mapping the given address is a part of.
    fn mapping_containing_addr(&self, addr: u32) -> Option<Mapping> {
        self.mappings().find(|mapping| {
            *mapping.range().start() <= addr && *mapping.range().end() >= addr
        })
    }

    fn load8(&self, addr: u32) -> Result<u8, MemoryError>;

    fn store8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError>;

    fn load16(&self, addr: u32) -> Result<u16, MemoryError> {
        let (b0, b1) = (self.load8(addr)? as u16, self.load8(addr + 1)? as u16);
        Ok(b1 << 8 | b0)
    }

    fn load32(&self, addr: u32) -> Result<u32, MemoryError> {
        let (lo, hi) = (self.load16(addr)? as u32, self.load16(addr + 2)? as u32);
        Ok(hi << 16 | lo)
    }

    fn store16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.store8(addr, value as u8)?;
        self.store8(addr + 1, (value >> 8) as u8)
    }

    fn store32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.store16(addr, value as u16)?;
        self.store16(addr + 2, (value >> 16) as u16)
    }

    /// Writes back the data cache and invalidates the instruction cache for
    /// everything mutated by the host since the last call.
    ///
    /// `add_mapping` and the `store*` accessors mutate guest memory behind the
    /// host's instruction fetch path, so the loader must call this after the
    /// last patch and before control first transfers to the guest.
    fn sync_caches(&mut self);

    /// Whether guest-executable memory is clean with respect to the host's
    /// instruction fetch path.
    fn caches_synced(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Mapping<'a> {
    range: RangeInclusive<u32>,
    name: Cow<'a, str>,
}

impl<'a> Mapping<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.range.clone()
    }
}

impl<'a> fmt::Display for Mapping<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (start, end) = (self.range.start(), self.range.end());
        write!(f, "{:08X}-{:08X} {}", start, end, self.name)
    }
}

/// Iterator over memory mappings.
#[allow(missing_debug_implementations)] // annoying to do here
pub struct Mappings<'a> {
    inner: Box<Iterator<Item = Mapping<'a>> + 'a>,
}

impl<'a> Mappings<'a> {
    fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Mapping<'a>>,
        I::IntoIter: 'a,
    {
        Self {
            inner: Box::new(iter.into_iter()),
        }
    }
}

impl<'a> Iterator for Mappings<'a> {
    type Item = Mapping<'a>;

    fn next(&mut self) -> Option<<Self as Iterator>::Item> {
        self.inner.next()
    }
}

fn overlaps(a: &RangeInclusive<u32>, b: &RangeInclusive<u32>) -> bool {
    a.start() <= b.end() && b.start() <= a.end()
}

/// A guest memory implementation that stores each mapping in its own `Vec`.
///
/// Lookups scan the mapping list, which is slow but entirely predictable.
/// This is mostly useful for tests.
#[derive(Debug)]
pub struct ArrayMemory {
    regions: Vec<Region>,
    synced: bool,
}

#[derive(Debug)]
struct Region {
    range: RangeInclusive<u32>,
    data: NoDebug<Vec<u8>>,
    name: String,
}

impl ArrayMemory {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            synced: true,
        }
    }

    fn region_for(&self, addr: u32) -> Result<(&Region, usize), MemoryError> {
        self.regions
            .iter()
            .find(|r| *r.range.start() <= addr && addr <= *r.range.end())
            .map(|r| (r, (addr - r.range.start()) as usize))
            .ok_or(MemoryError::Fault)
    }

    fn region_for_mut(&mut self, addr: u32) -> Result<(&mut Region, usize), MemoryError> {
        self.regions
            .iter_mut()
            .find(|r| *r.range.start() <= addr && addr <= *r.range.end())
            .map(|r| {
                let off = (addr - r.range.start()) as usize;
                (r, off)
            })
            .ok_or(MemoryError::Fault)
    }
}

impl GuestMemory for ArrayMemory {
    fn add_mapping(&mut self, range: RangeInclusive<u32>, data: &[u8], name: &str)
        -> Result<(), MapError>
    {
        if self.regions.iter().any(|r| overlaps(&r.range, &range)) {
            return Err(MapError::Overlap);
        }

        let len = (range.end() - range.start() + 1) as usize;
        let mut vec = data.to_vec();
        vec.resize(len, 0);

        self.regions.push(Region {
            range,
            data: vec.into(),
            name: name.to_owned(),
        });
        self.synced = false;
        Ok(())
    }

    fn mappings(&self) -> Mappings {
        Mappings::new(self.regions.iter().map(|r| Mapping {
            range: r.range.clone(),
            name: Cow::from(&r.name[..]),
        }))
    }

    fn load8(&self, addr: u32) -> Result<u8, MemoryError> {
        let (region, off) = self.region_for(addr)?;
        Ok(region.data[off])
    }

    fn store8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        let (region, off) = self.region_for_mut(addr)?;
        region.data[off] = value;
        self.synced = false;
        Ok(())
    }

    fn sync_caches(&mut self) {
        self.synced = true;
    }

    fn caches_synced(&self) -> bool {
        self.synced
    }
}

/// Guest memory backed by one large anonymous host mapping covering the whole
/// guest-addressable span.
///
/// This is the implementation the guest actually executes out of: the host
/// can hand the mapped pages to its MMU and run guest code in place.
#[derive(Debug)]
pub struct MmapMemory {
    mapping: MmapMut,
    mappings: Vec<Mapping<'static>>,
    synced: bool,
}

impl MmapMemory {
    pub fn new() -> Self {
        Self {
            mapping: MmapMut::map_anon(GUEST_SPAN as usize)
                .expect("could not map guest address space"),
            mappings: Vec::new(),
            synced: true,
        }
    }

    fn check(&self, addr: u32, size: u32) -> Result<(), MemoryError> {
        if addr.checked_add(size).map_or(true, |end| end > GUEST_SPAN) {
            Err(MemoryError::Fault)
        } else {
            Ok(())
        }
    }

    fn ptr(&self, addr: u32) -> *const u8 {
        unsafe { self.mapping.as_ptr().offset(addr as usize as isize) }
    }

    fn ptr_mut(&mut self, addr: u32) -> *mut u8 {
        unsafe { self.mapping.as_mut_ptr().offset(addr as usize as isize) }
    }
}

impl GuestMemory for MmapMemory {
    fn add_mapping(&mut self, range: RangeInclusive<u32>, data: &[u8], name: &str)
        -> Result<(), MapError>
    {
        if *range.end() >= GUEST_SPAN {
            return Err(MapError::OutOfSpan);
        }
        if self.mappings.iter().any(|m| overlaps(&m.range, &range)) {
            return Err(MapError::Overlap);
        }

        let mut vec = data.to_vec();
        let len = range.end() - range.start() + 1;
        vec.resize(len as usize, 0);

        let byte_range = *range.start() as usize..=*range.end() as usize;
        self.mapping[byte_range].copy_from_slice(&vec);

        self.mappings.push(Mapping {
            range,
            name: name.to_owned().into(),
        });
        self.synced = false;
        Ok(())
    }

    fn mappings(&self) -> Mappings {
        Mappings::new(self.mappings.iter().cloned())
    }

    fn load8(&self, addr: u32) -> Result<u8, MemoryError> {
        self.check(addr, 1)?;
        Ok(unsafe { *self.ptr(addr) })
    }

    fn store8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.check(addr, 1)?;
        unsafe { *self.ptr_mut(addr) = value };
        self.synced = false;
        Ok(())
    }

    fn load16(&self, addr: u32) -> Result<u16, MemoryError> {
        self.check(addr, 2)?;
        Ok(unsafe { ptr::read_unaligned(self.ptr(addr) as *const u16) })
    }

    fn load32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.check(addr, 4)?;
        Ok(unsafe { ptr::read_unaligned(self.ptr(addr) as *const u32) })
    }

    fn store16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.check(addr, 2)?;
        unsafe { ptr::write_unaligned(self.ptr_mut(addr) as *mut u16, value) };
        self.synced = false;
        Ok(())
    }

    fn store32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.check(addr, 4)?;
        unsafe { ptr::write_unaligned(self.ptr_mut(addr) as *mut u32, value) };
        self.synced = false;
        Ok(())
    }

    fn sync_caches(&mut self) {
        // On the real host this is a dcache write-back plus icache invalidate
        // over the mutated span. The anonymous mapping is coherent, so only
        // the bookkeeping bit remains.
        self.synced = true;
    }

    fn caches_synced(&self) -> bool {
        self.synced
    }
}

/// An error that can occur when reading or writing guest memory.
#[derive(Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// Accessed address is not mapped at all.
    Fault,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "guest memory access error")
    }
}

impl Error for MemoryError {}

/// Error returned by `add_mapping`.
#[derive(Debug, PartialEq, Eq)]
pub enum MapError {
    /// The mapping would overlap with an existing one.
    Overlap,

    /// Attempted to map something beyond the guest-addressable span.
    OutOfSpan,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::Overlap => write!(f, "existing mapping overlaps"),
            MapError::OutOfSpan => write!(f, "attempt to map memory outside the guest span"),
        }
    }
}

impl Error for MapError {}
