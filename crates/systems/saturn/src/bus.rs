//! SH-2 external bus.
//!
//! The SH-2s see a 27-bit external address space, mirrored in the cached
//! area (0x00000000-0x1FFFFFFF) and the cache-through area (+0x20000000):
//! - 0x00000000-0x000FFFFF: BIOS ROM (512KB, mirrored), CS0
//! - 0x00100000-0x0017FFFF: SMPC registers, CS0
//! - 0x00180000-0x001FFFFF: Backup RAM (32KB, odd bytes only), CS0
//! - 0x00200000-0x003FFFFF: Low work RAM (1MB, mirrored), CS0
//! - 0x01000000-0x01FFFFFF: FRT input-capture trigger, CS0
//! - 0x02000000-0x05FFFFFF: A-bus, B-bus and SCU registers, CS1/CS2
//! - 0x06000000-0x07FFFFFF: High work RAM (1MB, mirrored), CS3
//!
//! CS0 is a 16-bit bus: 32-bit accesses are split into two 16-bit bus cycles,
//! each charged separately. Accesses from the CPUs advance the bus timestamp;
//! accesses from the SH-2 DMA engines are accounted in a caller-held
//! accumulator instead.

use crate::config::WaitStates;
use crate::events::{Device, DeviceIo, Devices, EventId, Firing, SyncState};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::memmap::{MapError, MemoryMap, RegionId, Width};
use emu_core::scheduler::{EventList, Timestamp};

/// Address bits decoded by the external bus.
pub const EXT_MASK: u32 = 0x07FF_FFFF;
/// Offset of the cache-through mirror.
pub const CACHE_THROUGH: u32 = 0x2000_0000;

pub const BIOS_SIZE: usize = 512 * 1024;
pub const WORK_RAM_SIZE: usize = 1 << 20;
pub const BACKUP_RAM_SIZE: usize = 32 * 1024;

const BACKUP_RAM_FORMAT: &[u8; 16] = b"BackUpRam Format";

const LOW_RAM: (u32, u32) = (0x0020_0000, 0x003F_FFFF);
const BIOS: (u32, u32) = (0x0000_0000, 0x000F_FFFF);
const HIGH_RAM: (u32, u32) = (0x0600_0000, 0x07FF_FFFF);
const CS12_START: u32 = 0x0200_0000;
const CS3_START: u32 = 0x0600_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cs0 {
    Bios,
    Smpc,
    BackupRam,
    LowRam,
    FrtTrigger,
    Other,
}

impl Cs0 {
    fn decode(a: u32) -> Self {
        match a {
            0x0020_0000..=0x003F_FFFF => Cs0::LowRam,
            0x0000_0000..=0x000F_FFFF => Cs0::Bios,
            0x0010_0000..=0x0017_FFFF => Cs0::Smpc,
            0x0018_0000..=0x001F_FFFF => Cs0::BackupRam,
            0x0100_0000..=0x01FF_FFFF => Cs0::FrtTrigger,
            _ => Cs0::Other,
        }
    }
}

/// Where the wait states of one access go.
enum Initiator<'a> {
    /// The bus timestamp.
    Cpu(&'a mut Timestamp),
    /// An SH-2 DMA accumulator.
    Dma(&'a mut i32),
}

impl Initiator<'_> {
    fn charge(&mut self, cycles: i32) {
        match self {
            Initiator::Cpu(ts) => **ts += cycles,
            Initiator::Dma(acc) => **acc += cycles,
        }
    }

    fn is_dma(&self) -> bool {
        matches!(self, Initiator::Dma(_))
    }
}

/// Select the byte lane of a 16-bit bus value.
fn narrow(word: u32, a: u32, width: Width) -> u32 {
    match width {
        Width::Byte if a & 1 != 0 => word & 0xFF,
        Width::Byte => (word >> 8) & 0xFF,
        _ => word & 0xFFFF,
    }
}

/// Fill the first 64 bytes of backup RAM with the format signature.
pub fn format_backup_ram(ram: &mut [u8]) {
    ram.fill(0);
    for (i, b) in ram.iter_mut().take(0x40).enumerate() {
        *b = BACKUP_RAM_FORMAT[i & 0xF];
    }
}

/// Memory-backed parts of the bus: the window map plus backup RAM and the FRT
/// trigger latch.
pub struct Memory {
    pub(crate) map: MemoryMap,
    pub(crate) wait: WaitStates,
    bios: RegionId,
    low_ram: RegionId,
    high_ram: RegionId,
    backup_ram: Vec<u8>,
    backup_dirty: bool,
    fti_pulses: [u32; 2],
}

impl Memory {
    pub fn new(wait: WaitStates) -> Result<Self, MapError> {
        let mut map = MemoryMap::new();
        let bios = map.add_region("bios", vec![0; BIOS_SIZE])?;
        let low_ram = map.add_region("work ram low", vec![0; WORK_RAM_SIZE])?;
        let high_ram = map.add_region("work ram high", vec![0; WORK_RAM_SIZE])?;

        let mut backup_ram = vec![0; BACKUP_RAM_SIZE];
        format_backup_ram(&mut backup_ram);

        let mut mem = Self {
            map,
            wait,
            bios,
            low_ram,
            high_ram,
            backup_ram,
            backup_dirty: false,
            fti_pulses: [0; 2],
        };
        mem.map_physical(BIOS.0, BIOS.1, Some(bios), false)?;
        mem.map_physical(LOW_RAM.0, LOW_RAM.1, Some(low_ram), true)?;
        mem.map_physical(HIGH_RAM.0, HIGH_RAM.1, Some(high_ram), true)?;
        Ok(mem)
    }

    /// Install a physical range in both the cached and the cache-through
    /// areas. `None` maps the dummy region.
    pub fn map_physical(&mut self, start: u32, end: u32, region: Option<RegionId>, writable: bool) -> Result<(), MapError> {
        debug_assert!(start < CACHE_THROUGH && end < CACHE_THROUGH);
        for base in [0, CACHE_THROUGH] {
            self.map.install(base + start, base + end, region, writable)?;
        }
        Ok(())
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn bios(&self) -> &[u8] {
        self.map.region(self.bios).unwrap_or_default()
    }

    pub(crate) fn bios_mut(&mut self) -> Option<&mut [u8]> {
        self.map.region_mut(self.bios)
    }

    pub fn work_ram_low(&self) -> &[u8] {
        self.map.region(self.low_ram).unwrap_or_default()
    }

    pub fn work_ram_high(&self) -> &[u8] {
        self.map.region(self.high_ram).unwrap_or_default()
    }

    pub(crate) fn work_ram_low_mut(&mut self) -> Option<&mut [u8]> {
        self.map.region_mut(self.low_ram)
    }

    pub(crate) fn work_ram_high_mut(&mut self) -> Option<&mut [u8]> {
        self.map.region_mut(self.high_ram)
    }

    pub fn backup_ram(&self) -> &[u8] {
        &self.backup_ram
    }

    pub(crate) fn backup_ram_mut(&mut self) -> &mut [u8] {
        &mut self.backup_ram
    }

    pub(crate) fn mark_backup_dirty(&mut self) {
        self.backup_dirty = true;
    }

    /// Returns and clears the backup RAM dirty flag.
    pub fn take_backup_dirty(&mut self) -> bool {
        std::mem::take(&mut self.backup_dirty)
    }

    /// FRT input-capture pulses per CPU since the last call.
    pub(crate) fn take_fti_pulses(&mut self) -> [u32; 2] {
        std::mem::take(&mut self.fti_pulses)
    }

    /// Read a byte without wait states.
    pub fn peek(&self, addr: u32) -> u8 {
        self.map.read(addr & EXT_MASK, Width::Byte) as u8
    }

    /// Write a byte without wait states. Returns whether the byte landed.
    pub fn poke(&mut self, addr: u32, value: u8) -> bool {
        self.map.write(addr & EXT_MASK, Width::Byte, value as u32)
    }

    fn read_cs0(&mut self, a: u32, width: Width, init: &mut Initiator) -> u32 {
        let w = &self.wait;
        let word = match Cs0::decode(a) {
            Cs0::LowRam => {
                init.charge(w.low_ram);
                self.map.read(a, Width::Word)
            }
            Cs0::Bios => {
                init.charge(w.bios);
                self.map.read(a, Width::Word)
            }
            Cs0::BackupRam => {
                init.charge(w.backup_ram);
                0xFF00 | self.backup_ram[((a >> 1) & 0x7FFF) as usize] as u32
            }
            Cs0::FrtTrigger => {
                init.charge(if init.is_dma() { -w.frt_trigger } else { w.frt_trigger });
                self.map.read(a, Width::Word)
            }
            Cs0::Smpc => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("DMA read from SMPC window {:#010x}", a)
                });
                0xFFFF
            }
            Cs0::Other => {
                init.charge(w.cs0_other);
                self.map.read(a, Width::Word)
            }
        };
        narrow(word, a, width)
    }

    fn write_cs0(&mut self, a: u32, width: Width, value: u32, init: &mut Initiator) {
        let w = &self.wait;
        match Cs0::decode(a) {
            Cs0::LowRam => {
                init.charge(w.low_ram);
                self.map.write(a, width, value);
            }
            Cs0::Bios => init.charge(w.bios),
            Cs0::BackupRam => {
                init.charge(w.backup_ram);
                if width != Width::Byte || a & 1 != 0 {
                    self.backup_ram[((a >> 1) & 0x7FFF) as usize] = value as u8;
                    self.backup_dirty = true;
                }
            }
            Cs0::FrtTrigger => {
                init.charge(if init.is_dma() { -w.frt_trigger } else { w.frt_trigger });
                if width != Width::Byte {
                    let cpu = (((a >> 23) & 1) ^ 1) as usize;
                    self.fti_pulses[cpu] += 1;
                }
            }
            Cs0::Smpc => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("DMA write of {:#x} to SMPC window {:#010x}", value, a)
                });
            }
            Cs0::Other => init.charge(w.cs0_other),
        }
    }

    fn read_cs3(&mut self, a: u32, width: Width, init: &mut Initiator) -> u32 {
        match init {
            Initiator::Cpu(ts) => **ts += self.wait.high_ram_read,
            Initiator::Dma(acc) => **acc -= self.wait.dma_high_ram_read_credit,
        }
        self.map.read(a, width)
    }

    fn write_cs3(&mut self, a: u32, width: Width, value: u32, init: &mut Initiator) {
        self.map.write(a, width, value);
        match init {
            Initiator::Cpu(ts) => {
                let align = self.wait.high_ram_write_align;
                **ts = (**ts + align) & !(align - 1);
            }
            Initiator::Dma(acc) => **acc -= self.wait.dma_high_ram_write_credit,
        }
    }

    /// SH-2 DMA read; wait states go to `acc`.
    pub fn dma_read(&mut self, addr: u32, width: Width, acc: &mut i32) -> u32 {
        let a = width.align(addr & EXT_MASK);
        let mut init = Initiator::Dma(acc);
        match a {
            _ if a >= CS3_START => self.read_cs3(a, width, &mut init),
            _ if a >= CS12_START => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("DMA read from CS1/CS2 {:#010x}", a)
                });
                self.map.read(a, width)
            }
            _ if width == Width::Long => {
                (self.read_cs0(a, Width::Word, &mut init) << 16) | self.read_cs0(a + 2, Width::Word, &mut init)
            }
            _ => self.read_cs0(a, width, &mut init),
        }
    }

    pub fn dma_write(&mut self, addr: u32, width: Width, value: u32, acc: &mut i32) {
        let a = width.align(addr & EXT_MASK);
        let mut init = Initiator::Dma(acc);
        match a {
            _ if a >= CS3_START => self.write_cs3(a, width, value, &mut init),
            _ if a >= CS12_START => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("DMA write of {:#x} to CS1/CS2 {:#010x}", value, a)
                });
                self.map.write(a, width, value);
            }
            _ if width == Width::Long => {
                self.write_cs0(a, Width::Word, value >> 16, &mut init);
                self.write_cs0(a + 2, Width::Word, value & 0xFFFF, &mut init);
            }
            _ => self.write_cs0(a, width, value, &mut init),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PeripheralWindow {
    start: u32,
    end: u32,
    device: EventId,
}

/// The external bus: memory, scheduler, bus timing and the device table.
pub struct Bus {
    pub(crate) mem: Memory,
    pub(crate) events: EventList,
    pub(crate) sync: SyncState,
    pub(crate) devices: Devices,
    peripherals: Vec<PeripheralWindow>,
}

impl Bus {
    pub fn new(wait: WaitStates, devices: Vec<Box<dyn Device>>) -> Result<Self, MapError> {
        Ok(Self {
            mem: Memory::new(wait)?,
            events: crate::events::new_event_list(),
            sync: SyncState::default(),
            devices: Devices::new(devices),
            peripherals: Vec::new(),
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.sync.timestamp
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Route `start..=end` of CS1/CS2 to a device. Later windows shadow
    /// earlier overlapping ones.
    pub(crate) fn add_peripheral(&mut self, start: u32, end: u32, device: EventId) {
        self.peripherals.push(PeripheralWindow { start, end, device });
    }

    fn peripheral_at(&self, a: u32) -> Option<EventId> {
        self.peripherals
            .iter()
            .rev()
            .find(|p| (p.start..=p.end).contains(&a))
            .map(|p| p.device)
    }

    /// Fire events that came due at or before the bus timestamp.
    pub(crate) fn check_events(&mut self) {
        if self.sync.timestamp >= self.events.next_wake() {
            let ts = self.sync.timestamp;
            self.run_events(ts);
        }
    }

    pub(crate) fn run_events(&mut self, timestamp: Timestamp) -> bool {
        let mut firing = Firing {
            devices: &mut self.devices,
            sync: &mut self.sync,
            mem: &mut self.mem,
        };
        self.events.run_to(timestamp, &mut firing)
    }

    pub(crate) fn force_events(&mut self, timestamp: Timestamp) {
        let mut firing = Firing {
            devices: &mut self.devices,
            sync: &mut self.sync,
            mem: &mut self.mem,
        };
        self.events.force_update(timestamp, &mut firing);
    }

    fn device_read(&mut self, id: EventId, a: u32, width: Width) -> u32 {
        let mut io = DeviceIo::new(&mut self.events, &mut self.sync, &mut self.mem);
        match self.devices.get_mut(id) {
            Some(device) => device.read(a, width, &mut io),
            None => 0,
        }
    }

    fn device_write(&mut self, id: EventId, a: u32, width: Width, value: u32) {
        let mut io = DeviceIo::new(&mut self.events, &mut self.sync, &mut self.mem);
        if let Some(device) = self.devices.get_mut(id) {
            device.write(a, width, value, &mut io);
        }
    }

    /// CPU read. `ts` is the CPU's timestamp; the access starts no earlier
    /// than it and the CPU resumes when the bus is done.
    pub fn cpu_read(&mut self, ts: &mut Timestamp, addr: u32, width: Width) -> u32 {
        self.sync.timestamp = self.sync.timestamp.max(*ts);
        let a = width.align(addr & EXT_MASK);
        let value = if a >= CS3_START {
            self.mem.read_cs3(a, width, &mut Initiator::Cpu(&mut self.sync.timestamp))
        } else if a >= CS12_START {
            self.read_cs12(a, width)
        } else if width == Width::Long {
            (self.read_cs0(a, Width::Word) << 16) | self.read_cs0(a + 2, Width::Word)
        } else {
            self.read_cs0(a, width)
        };
        *ts = self.sync.timestamp;
        value
    }

    pub fn cpu_write(&mut self, ts: &mut Timestamp, addr: u32, width: Width, value: u32) {
        self.sync.timestamp = self.sync.timestamp.max(*ts);
        let a = width.align(addr & EXT_MASK);
        if a >= CS3_START {
            self.mem
                .write_cs3(a, width, value, &mut Initiator::Cpu(&mut self.sync.timestamp));
        } else if a >= CS12_START {
            self.write_cs12(a, width, value);
        } else if width == Width::Long {
            self.write_cs0(a, Width::Word, value >> 16);
            self.write_cs0(a + 2, Width::Word, value & 0xFFFF);
        } else {
            self.write_cs0(a, width, value);
        }
        *ts = self.sync.timestamp;
    }

    fn read_cs0(&mut self, a: u32, width: Width) -> u32 {
        if Cs0::decode(a) == Cs0::Smpc {
            self.check_events();
            let reg = self.device_read(EventId::Smpc, a, width) & 0xFF;
            return narrow(0xFF00 | reg, a, width);
        }
        self.mem.read_cs0(a, width, &mut Initiator::Cpu(&mut self.sync.timestamp))
    }

    fn write_cs0(&mut self, a: u32, width: Width, value: u32) {
        if Cs0::decode(a) == Cs0::Smpc {
            self.check_events();
            if width == Width::Word || a & 1 != 0 {
                self.device_write(EventId::Smpc, a, width, value & 0xFF);
            }
            return;
        }
        self.mem
            .write_cs0(a, width, value, &mut Initiator::Cpu(&mut self.sync.timestamp));
    }

    fn read_cs12(&mut self, a: u32, width: Width) -> u32 {
        self.sync.timestamp += self.mem.wait.peripheral;
        match self.peripheral_at(a) {
            Some(id) => {
                self.check_events();
                self.device_read(id, a, width)
            }
            None => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("read from unregistered peripheral address {:#010x}", a)
                });
                self.mem.map.read(a, width)
            }
        }
    }

    fn write_cs12(&mut self, a: u32, width: Width, value: u32) {
        self.sync.timestamp += self.mem.wait.peripheral;
        match self.peripheral_at(a) {
            Some(id) => {
                self.check_events();
                self.device_write(id, a, width, value);
            }
            None => {
                log(LogCategory::Bus, LogLevel::Trace, || {
                    format!("write of {:#x} to unregistered peripheral address {:#010x}", value, a)
                });
                self.mem.map.write(a, width, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::default_devices;
    use emu_core::memmap::DUMMY_FILL;
    use emu_core::scheduler::EVENT_DISABLED;

    fn bus() -> Bus {
        Bus::new(WaitStates::default(), default_devices(100_000)).unwrap()
    }

    #[test]
    fn test_low_ram_round_trip_and_dummy() {
        let mut bus = bus();
        let mut ts = 0;
        bus.cpu_write(&mut ts, 0x0020_0010, Width::Byte, 0xAB);
        assert_eq!(bus.cpu_read(&mut ts, 0x0020_0010, Width::Byte), 0xAB);
        assert_eq!(bus.memory().peek(0x0020_0010), 0xAB);

        let dummy = bus.cpu_read(&mut ts, 0x0040_0100, Width::Byte);
        assert_eq!(dummy, DUMMY_FILL as u32);
        assert_eq!(bus.cpu_read(&mut ts, 0x0040_0100, Width::Byte), dummy);
    }

    #[test]
    fn test_cache_through_mirror() {
        let mut bus = bus();
        let mut ts = 0;
        bus.cpu_write(&mut ts, 0x2600_0100, Width::Long, 0xCAFE_F00D);
        assert_eq!(bus.cpu_read(&mut ts, 0x0600_0100, Width::Long), 0xCAFE_F00D);
        assert_eq!(bus.cpu_read(&mut ts, 0x0610_0100, Width::Long), 0xCAFE_F00D, "1MB mirror");
    }

    #[test]
    fn test_wait_states() {
        let mut bus = bus();
        let mut ts = 10;

        bus.cpu_read(&mut ts, 0x0020_0000, Width::Word);
        assert_eq!(ts, 17, "low RAM word");
        bus.cpu_read(&mut ts, 0x0020_0000, Width::Long);
        assert_eq!(ts, 31, "low RAM long is two bus cycles");
        bus.cpu_read(&mut ts, 0x0000_0000, Width::Word);
        assert_eq!(ts, 39, "BIOS");
        bus.cpu_read(&mut ts, 0x0090_0000, Width::Word);
        assert_eq!(ts, 43, "other CS0");
        bus.cpu_read(&mut ts, 0x0600_0000, Width::Long);
        assert_eq!(ts, 50, "high RAM read");
        bus.cpu_write(&mut ts, 0x0600_0000, Width::Long, 1);
        assert_eq!(ts, 52, "high RAM write rounds up to a multiple of 4");
    }

    #[test]
    fn test_cpu_waits_for_busy_bus() {
        let mut bus = bus();
        bus.sync.timestamp = 100;
        let mut ts = 40;
        bus.cpu_read(&mut ts, 0x0600_0000, Width::Long);
        assert_eq!(ts, 107);
        assert_eq!(bus.timestamp(), 107);
    }

    #[test]
    fn test_dma_accumulator() {
        let mut bus = bus();
        let mut acc = 0;
        bus.mem.dma_write(0x0600_0010, Width::Long, 0x1234_5678, &mut acc);
        assert_eq!(acc, -3);
        assert_eq!(bus.mem.dma_read(0x0600_0010, Width::Long, &mut acc), 0x1234_5678);
        assert_eq!(acc, -9);
        bus.mem.dma_read(0x0020_0000, Width::Long, &mut acc);
        assert_eq!(acc, 5);
        assert_eq!(bus.timestamp(), 0, "DMA never touches the bus timestamp");
    }

    #[test]
    fn test_backup_ram_odd_bytes() {
        let mut bus = bus();
        let mut ts = 0;
        assert_eq!(bus.cpu_read(&mut ts, 0x0018_0001, Width::Byte), b'B' as u32);
        assert_eq!(bus.cpu_read(&mut ts, 0x0018_0000, Width::Byte), 0xFF);
        assert_eq!(bus.cpu_read(&mut ts, 0x0018_0002, Width::Word), 0xFF00 | b'a' as u32);
        assert!(!bus.mem.take_backup_dirty());

        bus.cpu_write(&mut ts, 0x0018_0100, Width::Byte, 0x11);
        assert!(!bus.mem.take_backup_dirty(), "even byte writes are dropped");
        bus.cpu_write(&mut ts, 0x0018_0101, Width::Byte, 0x22);
        assert!(bus.mem.take_backup_dirty());
        assert_eq!(bus.mem.backup_ram()[0x80], 0x22);
    }

    #[test]
    fn test_frt_trigger_pulses_other_cpu() {
        let mut bus = bus();
        let mut ts = 0;
        bus.cpu_write(&mut ts, 0x0100_0000, Width::Word, 0);
        bus.cpu_write(&mut ts, 0x0180_0000, Width::Word, 0);
        bus.cpu_write(&mut ts, 0x0180_0000, Width::Word, 0);
        bus.cpu_write(&mut ts, 0x0180_0000, Width::Byte, 0);
        assert_eq!(bus.mem.take_fti_pulses(), [2, 1]);
        assert_eq!(bus.mem.take_fti_pulses(), [0, 0]);
    }

    struct Registers {
        last_write: Option<(u32, u32)>,
    }

    impl Device for Registers {
        fn name(&self) -> &str {
            "regs"
        }

        fn read(&mut self, addr: u32, _width: Width, io: &mut DeviceIo) -> u32 {
            io.stall(3);
            addr & 0xFF
        }

        fn write(&mut self, addr: u32, _width: Width, value: u32, _io: &mut DeviceIo) {
            self.last_write = Some((addr, value));
        }
    }

    #[test]
    fn test_peripheral_window_routes_to_device() {
        let mut bus = bus();
        bus.devices
            .replace(EventId::Cdb, Box::new(Registers { last_write: None }));
        bus.add_peripheral(0x0589_0000, 0x0589_FFFF, EventId::Cdb);

        let mut ts = 0;
        assert_eq!(bus.cpu_read(&mut ts, 0x2589_0024, Width::Word), 0x24);
        assert_eq!(ts, 3, "device stall advances the bus");
        bus.cpu_write(&mut ts, 0x0589_0008, Width::Word, 0x55);
        assert_eq!(bus.cpu_read(&mut ts, 0x0500_0000, Width::Word), DUMMY_FILL as u32 * 0x101);
    }

    #[test]
    fn test_access_fires_due_events_first() {
        let mut bus = bus();
        bus.events.begin_running();
        bus.force_events(0);
        bus.events.schedule(EventId::Cdb.index(), 5);
        bus.devices
            .replace(EventId::Cdb, Box::new(Registers { last_write: None }));
        bus.add_peripheral(0x0589_0000, 0x0589_FFFF, EventId::Cdb);

        let mut ts = 6;
        bus.cpu_read(&mut ts, 0x0589_0000, Width::Word);
        assert_eq!(bus.events.time(EventId::Cdb.index()), EVENT_DISABLED);
    }

    #[test]
    fn test_backup_format_pattern() {
        let mut ram = vec![0xEE; BACKUP_RAM_SIZE];
        format_backup_ram(&mut ram);
        assert_eq!(&ram[..16], BACKUP_RAM_FORMAT);
        assert_eq!(&ram[0x30..0x40], BACKUP_RAM_FORMAT);
        assert_eq!(ram[0x40], 0);
    }
}
