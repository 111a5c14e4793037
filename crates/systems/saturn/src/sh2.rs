//! Hitachi SH-2 core
//!
//! Only a small interpreter subset is implemented: enough data movement,
//! arithmetic and branching to generate realistic bus traffic for the timing
//! machinery. Everything else decodes as a NOP and is reported through the
//! `Stubs` log category.
//!
//! The on-chip instruction cache (4 ways, 64 sets, 16-byte lines) is modeled
//! when the session enables instruction-cache emulation. Without it, fetches
//! from the cached area read memory directly and cost only the issue cycle.

use crate::bus::{Bus, EXT_MASK};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::memmap::Width;
use emu_core::scheduler::Timestamp;
use serde::{Deserialize, Serialize};

/// Memory interface seen by an SH-2.
///
/// Timed accesses start no earlier than `*ts` and leave `*ts` at the time the
/// bus released the CPU.
pub trait Sh2Bus {
    fn read(&mut self, ts: &mut Timestamp, addr: u32, width: Width) -> u32;

    fn write(&mut self, ts: &mut Timestamp, addr: u32, width: Width, value: u32);

    /// Untimed read, used for reset vectors and cache-hit fetches.
    fn read_raw(&self, addr: u32, width: Width) -> u32;
}

impl Sh2Bus for Bus {
    fn read(&mut self, ts: &mut Timestamp, addr: u32, width: Width) -> u32 {
        self.cpu_read(ts, addr, width)
    }

    fn write(&mut self, ts: &mut Timestamp, addr: u32, width: Width, value: u32) {
        self.cpu_write(ts, addr, width, value)
    }

    fn read_raw(&self, addr: u32, width: Width) -> u32 {
        self.mem.map.read(addr & EXT_MASK, width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuId {
    Master,
    Slave,
}

impl CpuId {
    pub fn name(self) -> &'static str {
        match self {
            CpuId::Master => "SH2-M",
            CpuId::Slave => "SH2-S",
        }
    }

    pub fn index(self) -> usize {
        match self {
            CpuId::Master => 0,
            CpuId::Slave => 1,
        }
    }
}

/// Cache control register address.
pub const CCR_ADDR: u32 = 0xFFFF_FE92;
/// Cache enable.
pub const CCR_CE: u32 = 0x01;
/// Instruction replacement disable.
pub const CCR_ID: u32 = 0x02;
/// Cache purge, self-clearing.
pub const CCR_CP: u32 = 0x10;

const CACHE_SETS: usize = 64;
const CACHE_WAYS: usize = 4;
const LINE_SIZE: u32 = 16;

/// Addresses at which one external location can sit in the cached area.
const CACHED_MIRRORS: [u32; 4] = [0x0000_0000, 0x0800_0000, 0x1000_0000, 0x1800_0000];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheLine {
    tag: u32,
    valid: bool,
    data: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheSet {
    ways: [CacheLine; CACHE_WAYS],
    /// Way indices, most recently used first.
    lru: [u8; CACHE_WAYS],
}

impl Default for CacheSet {
    fn default() -> Self {
        Self {
            ways: Default::default(),
            lru: [0, 1, 2, 3],
        }
    }
}

impl CacheSet {
    fn touch(&mut self, way: usize) {
        let pos = self.lru.iter().position(|&w| w as usize == way).unwrap_or(CACHE_WAYS - 1);
        self.lru.copy_within(0..pos, 1);
        self.lru[0] = way as u8;
    }
}

/// Instruction cache, 4-way set associative with LRU replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ICache {
    sets: Vec<CacheSet>,
}

impl Default for ICache {
    fn default() -> Self {
        Self {
            sets: vec![CacheSet::default(); CACHE_SETS],
        }
    }
}

impl ICache {
    fn tag(addr: u32) -> u32 {
        (addr >> 10) & 0x7FFFF
    }

    fn set(addr: u32) -> usize {
        ((addr >> 4) & 0x3F) as usize
    }

    fn lookup(&self, addr: u32) -> Option<usize> {
        let tag = Self::tag(addr);
        self.sets[Self::set(addr)]
            .ways
            .iter()
            .position(|line| line.valid && line.tag == tag)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.lookup(addr).is_some()
    }

    /// Fetch a word on a hit.
    fn read_word(&mut self, addr: u32) -> Option<u16> {
        let way = self.lookup(addr)?;
        let set = &mut self.sets[Self::set(addr)];
        set.touch(way);
        let off = (addr & (LINE_SIZE - 2)) as usize;
        let data = &set.ways[way].data;
        Some(u16::from_be_bytes([data[off], data[off + 1]]))
    }

    /// Replace the least recently used way of `addr`'s set.
    fn fill(&mut self, addr: u32, data: [u8; 16]) {
        let set = &mut self.sets[Self::set(addr)];
        let way = set.lru[CACHE_WAYS - 1] as usize;
        set.ways[way] = CacheLine {
            tag: Self::tag(addr),
            valid: true,
            data,
        };
        set.touch(way);
    }

    /// Update a cached copy, if any, without changing replacement order.
    pub fn write_update(&mut self, addr: u32, width: Width, value: u32) {
        let Some(way) = self.lookup(addr) else {
            return;
        };
        let addr = width.align(addr);
        let off = (addr & (LINE_SIZE - 1)) as usize;
        let bytes = value.to_be_bytes();
        let n = width.bytes() as usize;
        self.sets[Self::set(addr)].ways[way].data[off..off + n].copy_from_slice(&bytes[4 - n..]);
    }

    pub fn invalidate_all(&mut self) {
        for set in &mut self.sets {
            for line in &mut set.ways {
                line.valid = false;
            }
        }
    }
}

/// One SH-2 processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sh2 {
    pub id: CpuId,
    /// General registers R0-R15
    pub regs: [u32; 16],
    /// Address of the next instruction to fetch
    pub pc: u32,
    pub sr: u32,
    /// Local timestamp
    pub timestamp: Timestamp,
    pub ccr: u32,
    /// Target of a taken delayed branch, applied after the delay slot.
    delay_branch: Option<u32>,
    frt_captures: u32,
    cache: ICache,
}

const SR_T: u32 = 0x0001;

impl Sh2 {
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            regs: [0; 16],
            pc: 0,
            sr: 0xF0,
            timestamp: 0,
            ccr: 0,
            delay_branch: None,
            frt_captures: 0,
            cache: ICache::default(),
        }
    }

    /// Power-on or manual reset: load PC and SP from the vector table.
    pub fn reset<B: Sh2Bus>(&mut self, bus: &B) {
        self.regs = [0; 16];
        self.sr = 0xF0;
        self.ccr = 0;
        self.delay_branch = None;
        self.frt_captures = 0;
        self.cache.invalidate_all();
        self.pc = bus.read_raw(0, Width::Long);
        self.regs[15] = bus.read_raw(4, Width::Long);
    }

    pub fn t(&self) -> bool {
        self.sr & SR_T != 0
    }

    fn set_t(&mut self, t: bool) {
        if t {
            self.sr |= SR_T;
        } else {
            self.sr &= !SR_T;
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.ccr & CCR_CE != 0
    }

    pub fn cache(&self) -> &ICache {
        &self.cache
    }

    /// Keep cached copies of an externally modified byte coherent.
    pub fn cache_write_update(&mut self, addr: u32, value: u8) {
        if !self.cache_enabled() {
            return;
        }
        let a = addr & EXT_MASK;
        for base in CACHED_MIRRORS {
            self.cache.write_update(base | a, Width::Byte, value as u32);
        }
    }

    /// FRT input-capture edge.
    pub fn pulse_fti(&mut self) {
        self.frt_captures = self.frt_captures.wrapping_add(1);
    }

    pub fn frt_captures(&self) -> u32 {
        self.frt_captures
    }

    pub fn adjust_ts(&mut self, delta: Timestamp) {
        self.timestamp += delta;
    }

    /// Called after a state load. Cache contents recorded under a different
    /// cache emulation mode are meaningless.
    pub fn post_state_load(&mut self, cache_mode_changed: bool) {
        if cache_mode_changed {
            self.cache.invalidate_all();
        }
    }

    fn fetch<const ICACHE: bool, B: Sh2Bus>(&mut self, bus: &mut B, addr: u32) -> u16 {
        match addr >> 29 {
            0 if ICACHE && self.cache_enabled() => {
                if let Some(op) = self.cache.read_word(addr) {
                    return op;
                }
                if self.ccr & CCR_ID != 0 {
                    return bus.read(&mut self.timestamp, addr, Width::Word) as u16;
                }
                let base = addr & !(LINE_SIZE - 1);
                let mut line = [0u8; 16];
                for (i, chunk) in line.chunks_exact_mut(4).enumerate() {
                    let v = bus.read(&mut self.timestamp, base + 4 * i as u32, Width::Long);
                    chunk.copy_from_slice(&v.to_be_bytes());
                }
                self.cache.fill(addr, line);
                let off = (addr & (LINE_SIZE - 2)) as usize;
                u16::from_be_bytes([line[off], line[off + 1]])
            }
            0 if !ICACHE => bus.read_raw(addr, Width::Word) as u16,
            0 | 1 => bus.read(&mut self.timestamp, addr, Width::Word) as u16,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("{}: instruction fetch from {:#010x} not emulated", self.id.name(), addr)
                });
                0x0009
            }
        }
    }

    fn read_data<B: Sh2Bus>(&mut self, bus: &mut B, addr: u32, width: Width) -> u32 {
        match addr >> 29 {
            0 | 1 => bus.read(&mut self.timestamp, addr, width),
            _ if addr == CCR_ADDR && width == Width::Byte => self.ccr,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("{}: read from on-chip address {:#010x} not emulated", self.id.name(), addr)
                });
                0
            }
        }
    }

    fn write_data<const ICACHE: bool, B: Sh2Bus>(&mut self, bus: &mut B, addr: u32, width: Width, value: u32) {
        match addr >> 29 {
            0 => {
                if ICACHE && self.cache_enabled() {
                    self.cache.write_update(addr, width, value);
                }
                bus.write(&mut self.timestamp, addr, width, value);
            }
            1 => bus.write(&mut self.timestamp, addr, width, value),
            _ if addr == CCR_ADDR && width == Width::Byte => {
                if value & CCR_CP != 0 {
                    self.cache.invalidate_all();
                }
                self.ccr = value & 0xFF & !CCR_CP;
            }
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!(
                        "{}: write of {:#x} to on-chip address {:#010x} not emulated",
                        self.id.name(),
                        value,
                        addr
                    )
                });
            }
        }
    }

    /// Execute one instruction.
    pub fn step<const ICACHE: bool, B: Sh2Bus>(&mut self, bus: &mut B) {
        let pending = self.delay_branch.take();
        let addr = self.pc;
        let op = self.fetch::<ICACHE, B>(bus, addr);
        self.pc = addr.wrapping_add(2);
        self.timestamp += 1;

        self.execute::<ICACHE, B>(bus, addr, op);

        if let Some(target) = pending {
            self.pc = target;
        }
    }

    fn execute<const ICACHE: bool, B: Sh2Bus>(&mut self, bus: &mut B, addr: u32, op: u16) {
        let n = ((op >> 8) & 0xF) as usize;
        let m = ((op >> 4) & 0xF) as usize;
        let imm8 = op as u8 as i8 as i32 as u32;
        // PC as seen by PC-relative operands: instruction address + 4.
        let pc4 = addr.wrapping_add(4);

        match op >> 12 {
            0x0 if op == 0x0009 => {}
            0x2 if op & 0xF <= 2 => {
                let width = [Width::Byte, Width::Word, Width::Long][(op & 0xF) as usize];
                let (a, v) = (self.regs[n], self.regs[m]);
                self.write_data::<ICACHE, B>(bus, a, width, v);
            }
            0x3 if op & 0xF == 0xC => self.regs[n] = self.regs[n].wrapping_add(self.regs[m]),
            0x4 if op & 0xFF == 0x10 => {
                self.regs[n] = self.regs[n].wrapping_sub(1);
                let t = self.regs[n] == 0;
                self.set_t(t);
            }
            0x6 if op & 0xF <= 2 => {
                let a = self.regs[m];
                self.regs[n] = match op & 0xF {
                    0 => self.read_data(bus, a, Width::Byte) as u8 as i8 as i32 as u32,
                    1 => self.read_data(bus, a, Width::Word) as u16 as i16 as i32 as u32,
                    _ => self.read_data(bus, a, Width::Long),
                };
            }
            0x6 if op & 0xF == 3 => self.regs[n] = self.regs[m],
            0x7 => self.regs[n] = self.regs[n].wrapping_add(imm8),
            0x8 if n == 0x8 => {
                let t = self.regs[0] == imm8;
                self.set_t(t);
            }
            0x8 if n == 0x9 || n == 0xB => {
                if self.t() == (n == 0x9) {
                    self.pc = pc4.wrapping_add(imm8 << 1);
                    self.timestamp += 2;
                }
            }
            0x9 => {
                let a = pc4.wrapping_add((op as u32 & 0xFF) << 1);
                self.regs[n] = self.read_data(bus, a, Width::Word) as u16 as i16 as i32 as u32;
            }
            0xA => {
                let disp = (((op as u32) << 20) as i32 >> 20) as u32;
                self.delay_branch = Some(pc4.wrapping_add(disp << 1));
                self.timestamp += 1;
            }
            0xD => {
                let a = (pc4 & !3).wrapping_add((op as u32 & 0xFF) << 2);
                self.regs[n] = self.read_data(bus, a, Width::Long);
            }
            0xE => self.regs[n] = imm8,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!(
                        "{}: unimplemented opcode {:#06x} at {:#010x}",
                        self.id.name(),
                        op,
                        addr
                    )
                });
            }
        }
    }
}
