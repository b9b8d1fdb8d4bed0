//! Trap-and-emulate virtualization of AGB guest software.
//!
//! The guest BIOS and cartridge image stay resident in guest memory and run
//! *natively* on the host CPU. Only the handful of privileged instructions the
//! host cannot (or must not) execute (status register access and exception
//! returns) are rewritten at load time into trap-inducing encodings. When one
//! of them faults, the [`vm`] module emulates its effect against a shadow
//! register file and resumes native execution.

#![warn(missing_debug_implementations)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate bitpat;
#[macro_use] extern crate log;
#[macro_use] extern crate num_derive;
extern crate num_traits;
extern crate memmap;

pub mod bios;
pub mod io;
pub mod loader;
pub mod memory;
pub mod vm;
mod utils;
