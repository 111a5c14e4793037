//! Shared helpers for the session-level tests.

#![allow(dead_code)]

use emu_core::System;
use emu_saturn::{MemoryStore, NvStore, Saturn, SessionConfig, BIOS_SIZE};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// Reset vectors: PC 0x100, SP top of the first 64KB of high work RAM.
pub const ENTRY: u32 = 0x100;
pub const STACK: u32 = 0x0601_0000;

/// MOV.L @(3,PC),R1; MOV #5,R2; loop: MOV.L R2,@R1; ADD #1,R2; BRA loop; NOP
///
/// Stores an incrementing counter to the address in the literal at 0x110.
pub const STORE_LOOP: &[u16] = &[0xD103, 0xE205, 0x2122, 0x7201, 0xAFFC, 0x0009, 0x0009, 0x0009];
pub const STORE_LOOP_LITERAL: usize = 0x110;

/// MOV.L @(2,PC),R1; MOV #5,R2; MOV.B R2,@R1; spin: BRA spin; NOP
///
/// Writes one byte to the address in the literal at 0x10C, then spins.
pub const STORE_ONCE: &[u16] = &[0xD102, 0xE205, 0x2120, 0xAFFE, 0x0009, 0x0009];
pub const STORE_ONCE_LITERAL: usize = 0x10C;

/// A BIOS image running `program` from the reset vector, with 32-bit
/// `literals` placed at the given offsets.
pub fn bios_image(program: &[u16], literals: &[(usize, u32)]) -> Vec<u8> {
    let mut bios = vec![0u8; BIOS_SIZE];
    bios[0..4].copy_from_slice(&ENTRY.to_be_bytes());
    bios[4..8].copy_from_slice(&STACK.to_be_bytes());
    let base = ENTRY as usize;
    for (i, word) in program.iter().enumerate() {
        bios[base + 2 * i..base + 2 * i + 2].copy_from_slice(&word.to_be_bytes());
    }
    for &(offset, value) in literals {
        bios[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }
    bios
}

/// Store-loop BIOS writing to `target`.
pub fn store_loop_bios(target: u32) -> Vec<u8> {
    bios_image(STORE_LOOP, &[(STORE_LOOP_LITERAL, target)])
}

/// NV store the test keeps a handle to after the session takes ownership.
#[derive(Clone, Default)]
pub struct SharedStore(pub Rc<RefCell<MemoryStore>>);

impl NvStore for SharedStore {
    fn load(&mut self, ext: &str) -> io::Result<Option<Vec<u8>>> {
        self.0.borrow_mut().load(ext)
    }

    fn save(&mut self, ext: &str, data: &[u8]) -> io::Result<()> {
        self.0.borrow_mut().save(ext, data)
    }
}

pub fn session_with(config: SessionConfig, bios: &[u8]) -> Saturn {
    let mut saturn = Saturn::with_store(config, Box::new(MemoryStore::default())).unwrap();
    saturn.mount("BIOS", bios).unwrap();
    saturn
}

pub fn session(bios: &[u8]) -> Saturn {
    session_with(SessionConfig::default(), bios)
}
