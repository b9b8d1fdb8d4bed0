extern crate agbvm;
extern crate env_logger;
extern crate termcolor;
extern crate log;
#[macro_use] extern crate structopt;

use agbvm::bios::AGB_BIOS;
use agbvm::loader;
use agbvm::memory::{GuestMemory, MmapMemory, BIOS_BASE, ROM_BASE};

use structopt::StructOpt;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use std::{fs, process, u32};
use std::error::Error;
use std::io::Write;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

/// Parse a number that might be hexadecimal.
fn parse_hex(src: &str) -> Result<u32, ParseIntError> {
    if src.starts_with("0x") {
        u32::from_str_radix(&src[2..], 16)
    } else {
        u32::from_str(src)
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "agbvm", about = "Stage an AGB BIOS and cartridge image for native execution.")]
struct Opt {
    /// Path to the BIOS image to verify, relocate and patch.
    #[structopt(parse(from_os_str))]
    bios: PathBuf,

    /// Path to the cartridge image to map.
    #[structopt(parse(from_os_str))]
    rom: Option<PathBuf>,

    /// Base address the BIOS is relocated to (can also be a hexadecimal value
    /// starting with `0x`).
    #[structopt(long = "bios-base", parse(try_from_str = "parse_hex"))]
    bios_base: Option<u32>,

    /// Base address the cartridge image is mapped at.
    #[structopt(long = "rom-base", parse(try_from_str = "parse_hex"))]
    rom_base: Option<u32>,

    /// Write the staged (relocated and patched) BIOS image to this file.
    #[structopt(long = "out", parse(from_os_str))]
    out: Option<PathBuf>,
}

fn run() -> Result<(), Box<Error>> {
    let opt = Opt::from_args();

    let bios = fs::read(&opt.bios)?;
    let bios_base = opt.bios_base.unwrap_or(BIOS_BASE);

    let mut mem = MmapMemory::new();
    let mut table = loader::load_bios(&mut mem, bios_base, &bios, &AGB_BIOS)?;
    eprintln!("staged '{}' at {:#010X}", AGB_BIOS.version, bios_base);

    if let Some(rom_path) = &opt.rom {
        let rom = fs::read(rom_path)?;
        let rom_base = opt.rom_base.unwrap_or(ROM_BASE);
        loader::load_rom(&mut mem, rom_base, &rom, &[], &mut table)?;
    }

    println!("memory map:");
    for mapping in mem.mappings() {
        println!("  {}", mapping);
    }

    let mut out = StandardStream::stdout(ColorChoice::Auto);
    writeln!(out, "trap dispatch table ({} entries):", table.len())?;
    for (addr, op) in table.iter() {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(out, "  {:08X}", addr)?;
        out.reset()?;
        writeln!(out, "  {:?}", op)?;
    }

    if let Some(path) = &opt.out {
        let mut staged = Vec::with_capacity(AGB_BIOS.image_len as usize);
        for offset in 0..AGB_BIOS.image_len {
            staged.push(mem.load8(bios_base + offset)?);
        }
        fs::write(path, &staged)?;
        eprintln!("wrote staged image to '{}'", path.display());
    }

    Ok(())
}

fn main() {
    // By default, log all `info!` messages and higher
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    match run() {
        Ok(()) => {},
        Err(e) => {
            // distinct colored marker, the host-side analog of the failure
            // screen color on the real device
            let mut stderr = StandardStream::stderr(ColorChoice::Auto);
            let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
            let _ = write!(stderr, "error");
            let _ = stderr.reset();
            let _ = writeln!(stderr, ": {}", e);
            process::exit(1);
        },
    }
}
