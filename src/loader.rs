//! Stages guest images: verify, map, relocate, patch, synchronize caches.
//!
//! The steps run in that order, each exactly once. Relocation must precede
//! patching because the patch targets assume a relocated vector layout, and
//! the cache synchronization must come last because the host fetches
//! instructions through a separate path from the one these writes take.

use bios::{crc32, is_trap_encoding, PatchSet, VmPatch};
use memory::{GuestMemory, MapError, MemoryError, ROM_MAX_LEN};
use vm::trap::TrapTable;

use std::error::Error;
use std::fmt;

/// Stages a BIOS image at `base` and returns the trap dispatch table for it.
pub fn load_bios<M: GuestMemory>(
    mem: &mut M,
    base: u32,
    image: &[u8],
    set: &PatchSet,
) -> Result<TrapTable, LoaderError> {
    verify(image, set)?;
    info!(
        "staging '{}' at {:#010X}-{:#010X}",
        set.version,
        base,
        base + set.image_len - 1
    );
    mem.add_mapping(base..=base + set.image_len - 1, image, "<bios>")?;
    relocate(mem, base, set)?;
    patch(mem, base, set.patches)?;
    mem.sync_caches();
    Ok(set.trap_table(base))
}

/// Maps a cartridge image at `base` and applies per-title patches, merging
/// their trap addresses into `table`.
pub fn load_rom<M: GuestMemory>(
    mem: &mut M,
    base: u32,
    image: &[u8],
    extra: &[VmPatch],
    table: &mut TrapTable,
) -> Result<(), LoaderError> {
    if image.is_empty() {
        return Err(LoaderError::RomEmpty);
    }
    if image.len() as u32 > ROM_MAX_LEN {
        return Err(LoaderError::RomTooLarge(image.len()));
    }
    info!(
        "mapping cartridge image at {:#010X} ({} bytes, {} patches)",
        base,
        image.len(),
        extra.len()
    );
    mem.add_mapping(base..=base + image.len() as u32 - 1, image, "<cart>")?;
    patch(mem, base, extra)?;
    for p in extra {
        table.insert(base + p.offset, p.op);
    }
    mem.sync_caches();
    Ok(())
}

fn verify(image: &[u8], set: &PatchSet) -> Result<(), LoaderError> {
    if image.len() as u32 != set.image_len {
        return Err(LoaderError::WrongSize {
            expected: set.image_len,
            found: image.len() as u32,
        });
    }
    let found = crc32(image);
    if found != set.digest {
        return Err(LoaderError::DigestMismatch {
            expected: set.digest,
            found,
        });
    }
    Ok(())
}

/// Rebases every absolute address embedded in the image to `base`.
fn relocate<M: GuestMemory>(mem: &mut M, base: u32, set: &PatchSet) -> Result<(), MemoryError> {
    for &(start, count) in set.word_tables {
        for i in 0..count as u32 {
            let addr = base + start as u32 + i * 4;
            let word = mem.load32(addr)?;
            mem.store32(addr, word.wrapping_add(base))?;
        }
    }
    for &offset in set.relocations {
        let addr = base + offset as u32;
        let word = mem.load32(addr)?;
        mem.store32(addr, word.wrapping_add(base))?;
    }
    for &(offset, value) in set.halfword_fixups {
        mem.store16(base + offset as u32, value)?;
    }
    Ok(())
}

fn patch<M: GuestMemory>(mem: &mut M, base: u32, patches: &[VmPatch]) -> Result<(), MemoryError> {
    for p in patches {
        debug_assert!(is_trap_encoding(p.encoding));
        trace!("patching {:#010X} to {:#010X}", base + p.offset, p.encoding);
        mem.store32(base + p.offset, p.encoding)?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoaderError {
    /// The image does not have the size the patch set was built for.
    WrongSize { expected: u32, found: u32 },
    /// The image is not the build the patch set was derived from. Applying
    /// the tables anyway would silently corrupt instructions, so this is
    /// checked up front and fatal.
    DigestMismatch { expected: u32, found: u32 },
    /// Cartridge image is zero bytes; there is nothing to map.
    RomEmpty,
    /// Cartridge image exceeds the addressable window.
    RomTooLarge(usize),
    /// Mapping the image failed.
    Map(MapError),
    /// A table offset fell outside the mapped image.
    Memory(MemoryError),
}

impl From<MapError> for LoaderError {
    fn from(e: MapError) -> Self {
        LoaderError::Map(e)
    }
}

impl From<MemoryError> for LoaderError {
    fn from(e: MemoryError) -> Self {
        LoaderError::Memory(e)
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoaderError::WrongSize { expected, found } => {
                write!(f, "image is {} bytes, patch set expects {}", found, expected)
            }
            LoaderError::DigestMismatch { expected, found } => write!(
                f,
                "image digest {:#010X} does not match the patch set ({:#010X})",
                found, expected
            ),
            LoaderError::RomEmpty => write!(f, "cartridge image is empty"),
            LoaderError::RomTooLarge(len) => {
                write!(f, "cartridge image of {} bytes exceeds the window", len)
            }
            LoaderError::Map(e) => e.fmt(f),
            LoaderError::Memory(e) => e.fmt(f),
        }
    }
}

impl Error for LoaderError {}
