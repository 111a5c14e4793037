//! Sega Saturn timing core.
//!
//! Two SH-2s share one external bus. A sorted event list drives every other
//! subsystem: each one owns a slot, and the step loop fires slots as the
//! effective clock reaches them. Device models plug into the slots through
//! the [`Device`] trait; out of the box every slot holds an idle stand-in,
//! except the VDP2 slot whose [`FrameTimer`] paces frames.
//!
//! ```no_run
//! use emu_core::System;
//! use emu_saturn::{Saturn, SessionConfig};
//!
//! let mut saturn = Saturn::new(SessionConfig::default())?;
//! saturn.mount("BIOS", &std::fs::read("sega_101.bin")?)?;
//! let cycles = saturn.run_frame()?;
//! let state = saturn.take_snapshot()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bus;
mod config;
mod devices;
mod events;
mod persist;
mod sh2;
mod snapshot;
mod stepper;

pub use bus::{format_backup_ram, Memory, BACKUP_RAM_SIZE, BIOS_SIZE, CACHE_THROUGH, EXT_MASK, WORK_RAM_SIZE};
pub use config::{CacheMode, CartType, Region, SessionConfig, WaitStates, MASTER_CLOCK_NTSC, MASTER_CLOCK_PAL};
pub use devices::{FrameTimer, IdleDevice};
pub use events::{Device, DeviceIo, EventId, MidSyncHook};
pub use persist::{FileStore, MemoryStore, NvFlusher, NvStore, BACKUP_RAM_EXT, CART_NV_EXT};
pub use sh2::{CpuId, ICache, Sh2, CCR_ADDR, CCR_CE};
pub use snapshot::{Identity, Snapshot, SnapshotError, LEGACY_EVENT_VERSION, SNAPSHOT_VERSION};
pub use stepper::{DebugHook, StepView};

use bus::Bus;
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::memmap::MapError;
use emu_core::scheduler::{EventList, Timestamp};
use emu_core::{MountPointInfo, System};
use sha2::{Digest, Sha256};
use stepper::Machine;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaturnError {
    #[error("BIOS image must be 524288 bytes, got {0}")]
    InvalidBios(usize),
    #[error("No BIOS loaded")]
    NoBios,
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Memory map error: {0}")]
    Map(#[from] MapError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("Peripheral window {start:#010x}-{end:#010x} is outside CS1/CS2")]
    InvalidPeripheral { start: u32, end: u32 },
    #[error("{0:?} is not a device slot")]
    NotADeviceSlot(EventId),
}

const CS12_RANGE: (u32, u32) = (0x0200_0000, 0x05FF_FFFF);

/// SHA-256 of a media image, lowercase hex.
pub fn media_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// One emulated console session.
pub struct Saturn {
    config: SessionConfig,
    machine: Machine,
    bios_hash: Option<String>,
    store: Box<dyn NvStore>,
    backup_flush: NvFlusher,
    cart_flush: NvFlusher,
}

impl Saturn {
    /// Session with NV files under `config.nv_dir`.
    pub fn new(config: SessionConfig) -> Result<Self, SaturnError> {
        let store = FileStore::new(config.nv_dir.clone(), config.nv_name.clone());
        Self::with_store(config, Box::new(store))
    }

    pub fn with_store(config: SessionConfig, mut store: Box<dyn NvStore>) -> Result<Self, SaturnError> {
        config.validate().map_err(SaturnError::Config)?;

        let bus = Bus::new(
            config.wait_states.clone(),
            devices::default_devices(config.cycles_per_frame()),
        )?;
        let mut machine = Machine::new(bus);
        machine.reset(true);

        match store.load(BACKUP_RAM_EXT)? {
            Some(data) if data.len() == BACKUP_RAM_SIZE => {
                machine.bus.mem.backup_ram_mut().copy_from_slice(&data);
            }
            Some(data) => {
                log(LogCategory::Persist, LogLevel::Warn, || {
                    format!(
                        "backup RAM image is {} bytes, expected {}; starting formatted",
                        data.len(),
                        BACKUP_RAM_SIZE
                    )
                });
            }
            None => {}
        }

        log(LogCategory::CPU, LogLevel::Info, || {
            format!(
                "Session: region {:?}, cache mode: {}, cart: {}",
                config.region,
                config.cache_mode.describe(),
                config.cart_type.describe()
            )
        });

        let master_clock = config.master_clock();
        Ok(Self {
            config,
            machine,
            bios_hash: None,
            store,
            backup_flush: NvFlusher::new(master_clock),
            cart_flush: NvFlusher::new(master_clock),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cycles_per_frame(&self) -> Timestamp {
        self.config.cycles_per_frame()
    }

    pub fn bios_hash(&self) -> Option<&str> {
        self.bios_hash.as_deref()
    }

    /// Install a 512KB BIOS image and power-cycle the CPUs.
    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), SaturnError> {
        if data.len() != BIOS_SIZE {
            return Err(SaturnError::InvalidBios(data.len()));
        }
        if let Some(bios) = self.machine.bus.mem.bios_mut() {
            bios.copy_from_slice(data);
        }
        self.bios_hash = Some(media_hash(data));
        self.machine.reset(true);
        Ok(())
    }

    /// Put a device model in an event slot, returning the one it replaces.
    ///
    /// A cart device with NV data gets its saved image loaded.
    pub fn attach_device(
        &mut self,
        id: EventId,
        mut device: Box<dyn Device>,
    ) -> Result<Option<Box<dyn Device>>, SaturnError> {
        if !id.is_device() {
            return Err(SaturnError::NotADeviceSlot(id));
        }
        if id == EventId::Cart {
            if let Some(expected) = device.nv_data().map(|d| d.len()) {
                match self.store.load(CART_NV_EXT)? {
                    Some(data) if data.len() == expected => device.load_nv(&data),
                    Some(data) => log(LogCategory::Persist, LogLevel::Warn, || {
                        format!("cart NV image is {} bytes, expected {}; ignored", data.len(), expected)
                    }),
                    None => {}
                }
            }
            self.cart_flush.clear();
        }
        Ok(self.machine.bus.devices.replace(id, device))
    }

    pub fn device(&self, id: EventId) -> Option<&dyn Device> {
        self.machine.bus.devices().get(id)
    }

    /// Route a CS1/CS2 address range to the device in slot `id`.
    pub fn map_peripheral(&mut self, start: u32, end: u32, id: EventId) -> Result<(), SaturnError> {
        if start > end || start < CS12_RANGE.0 || end > CS12_RANGE.1 {
            return Err(SaturnError::InvalidPeripheral { start, end });
        }
        if !id.is_device() {
            return Err(SaturnError::NotADeviceSlot(id));
        }
        self.machine.bus.add_peripheral(start, end, id);
        Ok(())
    }

    /// Host callback run at most once per frame, around mid-frame.
    pub fn set_midsync_hook(&mut self, hook: impl FnMut(Timestamp) + 'static) {
        self.machine.bus.devices.midsync_hook = Some(Box::new(hook));
    }

    /// Called before every instruction of either CPU. Switches the step loop
    /// into debug mode while set.
    pub fn set_debug_hook(&mut self, hook: impl FnMut(&StepView) + 'static) {
        self.machine.debug_hook = Some(Box::new(hook));
    }

    pub fn clear_debug_hook(&mut self) {
        self.machine.debug_hook = None;
    }

    /// Switch the slave CPU on or off at the start of the next frame.
    pub fn request_slave_power(&mut self, on: bool) {
        self.machine.bus.sync.slave_power_request = Some(on);
    }

    pub fn slave_on(&self) -> bool {
        self.machine.slave_on
    }

    pub fn cpu(&self, id: CpuId) -> &Sh2 {
        &self.machine.cpus[id.index()]
    }

    pub fn memory(&self) -> &Memory {
        self.machine.bus.memory()
    }

    pub fn events(&self) -> &EventList {
        self.machine.bus.events()
    }

    pub fn bus_timestamp(&self) -> Timestamp {
        self.machine.bus.timestamp()
    }

    /// Read a byte without wait states or side effects.
    pub fn peek(&self, addr: u32) -> u8 {
        self.machine.bus.memory().peek(addr)
    }

    /// Write a byte without wait states, keeping instruction caches
    /// coherent. Returns whether the address was writable.
    pub fn poke(&mut self, addr: u32, value: u8) -> bool {
        let landed = self.machine.bus.mem.poke(addr, value);
        if landed && self.config.cache_mode.emulates_icache() {
            for cpu in &mut self.machine.cpus {
                cpu.cache_write_update(addr, value);
            }
        }
        landed
    }

    /// Write all NV data now, regardless of pending delays.
    pub fn flush_nv(&mut self) -> Result<(), SaturnError> {
        self.store
            .save(BACKUP_RAM_EXT, self.machine.bus.memory().backup_ram())?;
        self.backup_flush.clear();
        if let Some(data) = self.machine.bus.devices().get(EventId::Cart).and_then(|d| d.nv_data()) {
            self.store.save(CART_NV_EXT, data)?;
        }
        self.cart_flush.clear();
        Ok(())
    }

    fn update_nv(&mut self, master_cycles: i64) {
        let dirty = self.machine.bus.mem.take_backup_dirty();
        if self.backup_flush.tick(dirty, master_cycles) {
            match self
                .store
                .save(BACKUP_RAM_EXT, self.machine.bus.memory().backup_ram())
            {
                Ok(()) => log(LogCategory::Persist, LogLevel::Debug, || "backup RAM saved".to_string()),
                Err(e) => {
                    log(LogCategory::Persist, LogLevel::Warn, || {
                        format!("backup RAM save failed: {}; retrying in 60 seconds", e)
                    });
                    self.backup_flush.retry_later();
                }
            }
        }

        let Some(cart) = self.machine.bus.devices.get_mut(EventId::Cart) else {
            return;
        };
        let dirty = cart.take_nv_dirty();
        if self.cart_flush.tick(dirty, master_cycles) {
            let Some(data) = cart.nv_data() else {
                return;
            };
            match self.store.save(CART_NV_EXT, data) {
                Ok(()) => log(LogCategory::Persist, LogLevel::Debug, || "cart NV saved".to_string()),
                Err(e) => {
                    log(LogCategory::Persist, LogLevel::Warn, || {
                        format!("cart NV save failed: {}; retrying in 60 seconds", e)
                    });
                    self.cart_flush.retry_later();
                }
            }
        }
    }

    fn identity(&self) -> Result<Identity<'_>, SaturnError> {
        let bios_sha256 = self.bios_hash.as_deref().ok_or(SaturnError::NoBios)?;
        Ok(Identity {
            bios_sha256,
            cart_type: self.config.cart_type,
            icache_emulated: self.config.cache_mode.emulates_icache(),
        })
    }
}

impl System for Saturn {
    type Error = SaturnError;

    fn reset(&mut self, powering_up: bool) {
        self.machine.reset(powering_up);
    }

    fn run_frame(&mut self) -> Result<u32, Self::Error> {
        if self.bios_hash.is_none() {
            return Err(SaturnError::NoBios);
        }
        let icache = self.config.cache_mode.emulates_icache();
        let debug = self.config.debug_hooks || self.machine.debug_hook.is_some();

        let end_ts = self.machine.run_frame(icache, debug);
        self.update_nv(end_ts as i64 * self.config.clock_div as i64);
        Ok(end_ts as u32)
    }

    fn take_snapshot(&self) -> Result<Vec<u8>, Self::Error> {
        let snapshot = Snapshot::capture(&self.machine, self.identity()?)?;
        Ok(snapshot.to_bytes()?)
    }

    fn apply_snapshot(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let snapshot = Snapshot::from_bytes(data).map_err(|e| {
            log(LogCategory::SaveState, LogLevel::Warn, || format!("snapshot rejected: {}", e));
            e
        })?;
        let bios_hash = self.bios_hash.clone().ok_or(SaturnError::NoBios)?;
        let identity = Identity {
            bios_sha256: &bios_hash,
            cart_type: self.config.cart_type,
            icache_emulated: self.config.cache_mode.emulates_icache(),
        };
        snapshot.apply(&mut self.machine, identity)?;
        Ok(())
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: "BIOS".to_string(),
            name: "BIOS ROM".to_string(),
            extensions: vec!["bin".to_string(), "rom".to_string()],
            required: true,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        match mount_point_id {
            "BIOS" => self.load_bios(data),
            _ => Err(SaturnError::InvalidMountPoint(mount_point_id.to_string())),
        }
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        match mount_point_id {
            "BIOS" => {
                if let Some(bios) = self.machine.bus.mem.bios_mut() {
                    bios.fill(0);
                }
                self.bios_hash = None;
                Ok(())
            }
            _ => Err(SaturnError::InvalidMountPoint(mount_point_id.to_string())),
        }
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        mount_point_id == "BIOS" && self.bios_hash.is_some()
    }
}
