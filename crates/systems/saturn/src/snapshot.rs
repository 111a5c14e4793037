//! Save states.
//!
//! A snapshot is a JSON document carrying the timing machinery (bus
//! timestamp, event wake times and list order), work RAM, both CPUs and an
//! opaque blob per device. BIOS and media contents are not stored; the BIOS
//! SHA-256 and the cart type identify the session a snapshot belongs to, and
//! snapshots from any other session are refused before anything is touched.

use crate::bus::{BACKUP_RAM_SIZE, WORK_RAM_SIZE};
use crate::config::CartType;
use crate::events::EventId;
use crate::sh2::{CpuId, Sh2};
use crate::stepper::Machine;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::scheduler::{EventRestoreError, PackedEvents, Timestamp, EVENT_DISABLED, TIMESTAMP_LIMIT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Current format version.
pub const SNAPSHOT_VERSION: u32 = 0x0010_2700;
/// Snapshots older than this encode disabled events as any time at or past
/// [`TIMESTAMP_LIMIT`].
pub const LEGACY_EVENT_VERSION: u32 = 0x0010_2600;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("snapshot was taken with a different BIOS ({found}, expected {expected})")]
    BiosMismatch { expected: String, found: String },
    #[error("snapshot was taken with cart {found:?}, session has {expected:?}")]
    CartMismatch { expected: CartType, found: CartType },
    #[error("bad event data: {0}")]
    Events(#[from] EventRestoreError),
    #[error("bad {name} data: {reason}")]
    Blob { name: String, reason: String },
    #[error("state of {name} rejected: {source}")]
    Device {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub bios_sha256: String,
    pub cart_type: CartType,
    pub timestamp: Timestamp,
    pub bus_lock: u32,
    /// Cached next wake time when the snapshot was taken. Recomputed on load.
    pub next_wake: Timestamp,
    pub events: PackedEvents,
    pub work_ram_low: String,
    pub work_ram_high: String,
    pub backup_ram: String,
    /// Whether instruction-cache emulation was on when recorded.
    pub icache_emulated: bool,
    pub slave_on: bool,
    pub cpus: BTreeMap<String, Value>,
    pub devices: BTreeMap<String, Value>,
}

/// Session identity a snapshot must match.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    pub bios_sha256: &'a str,
    pub cart_type: CartType,
    pub icache_emulated: bool,
}

fn blob_error(name: &str, reason: impl Into<String>) -> SnapshotError {
    SnapshotError::Blob {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn decode_blob(name: &str, text: &str, len: usize) -> Result<Vec<u8>, SnapshotError> {
    let data = BASE64.decode(text).map_err(|e| blob_error(name, e.to_string()))?;
    if data.len() != len {
        return Err(blob_error(name, format!("{} bytes, expected {}", data.len(), len)));
    }
    Ok(data)
}

fn decode_cpu(cpus: &BTreeMap<String, Value>, id: CpuId) -> Result<Sh2, SnapshotError> {
    let state = cpus
        .get(id.name())
        .ok_or_else(|| blob_error(id.name(), "missing"))?;
    let cpu: Sh2 = serde_json::from_value(state.clone()).map_err(|e| blob_error(id.name(), e.to_string()))?;
    if cpu.id != id {
        return Err(blob_error(id.name(), format!("holds state of {}", cpu.id.name())));
    }
    Ok(cpu)
}

impl Snapshot {
    pub fn capture(machine: &Machine, identity: Identity) -> Result<Self, SnapshotError> {
        let mem = machine.bus.memory();
        let mut cpus = BTreeMap::new();
        for cpu in &machine.cpus {
            cpus.insert(cpu.id.name().to_string(), serde_json::to_value(cpu)?);
        }
        let mut devices = BTreeMap::new();
        for id in EventId::ALL.into_iter().filter(|id| id.is_device()) {
            if let Some(device) = machine.bus.devices().get(id) {
                let state = device.save_state().map_err(|source| SnapshotError::Device {
                    name: id.name().to_string(),
                    source,
                })?;
                devices.insert(id.name().to_string(), state);
            }
        }

        Ok(Self {
            version: SNAPSHOT_VERSION,
            bios_sha256: identity.bios_sha256.to_string(),
            cart_type: identity.cart_type,
            timestamp: machine.bus.timestamp(),
            bus_lock: machine.bus.sync.bus_lock,
            next_wake: machine.bus.events().next_wake(),
            events: machine.bus.events().pack(),
            work_ram_low: BASE64.encode(mem.work_ram_low()),
            work_ram_high: BASE64.encode(mem.work_ram_high()),
            backup_ram: BASE64.encode(mem.backup_ram()),
            icache_emulated: identity.icache_emulated,
            slave_on: machine.slave_on,
            cpus,
            devices,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Refuse snapshots of another session.
    pub fn check_identity(&self, identity: &Identity) -> Result<(), SnapshotError> {
        if self.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version));
        }
        if self.bios_sha256 != identity.bios_sha256 {
            return Err(SnapshotError::BiosMismatch {
                expected: identity.bios_sha256.to_string(),
                found: self.bios_sha256.clone(),
            });
        }
        if self.cart_type != identity.cart_type {
            return Err(SnapshotError::CartMismatch {
                expected: identity.cart_type,
                found: self.cart_type,
            });
        }
        Ok(())
    }

    /// Event data in the current encoding.
    fn current_events(&self) -> PackedEvents {
        let mut events = self.events.clone();
        if self.version < LEGACY_EVENT_VERSION {
            for t in &mut events.times {
                if *t >= TIMESTAMP_LIMIT {
                    *t = EVENT_DISABLED;
                }
            }
        }
        events
    }

    /// Decode and check everything a restore needs without touching
    /// `machine`.
    fn stage(&self, machine: &Machine, identity: &Identity) -> Result<Staged, SnapshotError> {
        self.check_identity(identity)?;

        let low = decode_blob("work_ram_low", &self.work_ram_low, WORK_RAM_SIZE)?;
        let high = decode_blob("work_ram_high", &self.work_ram_high, WORK_RAM_SIZE)?;
        let backup = decode_blob("backup_ram", &self.backup_ram, BACKUP_RAM_SIZE)?;
        let cpus = [decode_cpu(&self.cpus, CpuId::Master)?, decode_cpu(&self.cpus, CpuId::Slave)?];

        for id in EventId::ALL.into_iter().filter(|id| id.is_device()) {
            let state = self
                .devices
                .get(id.name())
                .ok_or_else(|| blob_error(id.name(), "missing"))?;
            if let Some(device) = machine.bus.devices().get(id) {
                device.check_state(state).map_err(|source| SnapshotError::Device {
                    name: id.name().to_string(),
                    source,
                })?;
            }
        }

        Ok(Staged {
            low,
            high,
            backup,
            cpus,
            events: self.current_events(),
        })
    }

    fn commit(&self, machine: &mut Machine, staged: Staged, mode_changed: bool) {
        let mem = &mut machine.bus.mem;
        if let Some(ram) = mem.work_ram_low_mut() {
            ram.copy_from_slice(&staged.low);
        }
        if let Some(ram) = mem.work_ram_high_mut() {
            ram.copy_from_slice(&staged.high);
        }
        mem.backup_ram_mut().copy_from_slice(&staged.backup);

        machine.bus.sync.timestamp = self.timestamp;
        machine.bus.sync.bus_lock = self.bus_lock;
        machine.bus.sync.slave_power_request = None;
        machine.bus.events.set_idle();
        machine.slave_on = self.slave_on;

        machine.cpus = staged.cpus;
        for cpu in &mut machine.cpus {
            cpu.post_state_load(mode_changed);
        }
    }

    fn load_devices(&self, machine: &mut Machine) -> Result<(), SnapshotError> {
        for id in EventId::ALL.into_iter().filter(|id| id.is_device()) {
            let (Some(state), Some(device)) = (self.devices.get(id.name()), machine.bus.devices.get_mut(id)) else {
                continue;
            };
            device.load_state(state).map_err(|source| SnapshotError::Device {
                name: id.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Restore into `machine`.
    ///
    /// Identity, RAM, CPU and device blobs are all checked before anything
    /// is changed. Bad event data resets the scheduler to its default
    /// arming. A device that passes its check but still refuses its blob
    /// rolls the whole machine back to the state it had before the call.
    pub fn apply(&self, machine: &mut Machine, identity: Identity) -> Result<(), SnapshotError> {
        let staged = match self.stage(machine, &identity) {
            Ok(staged) => staged,
            Err(e) => {
                log(LogCategory::SaveState, LogLevel::Warn, || format!("snapshot rejected: {}", e));
                return Err(e);
            }
        };
        let previous = Snapshot::capture(machine, identity)?;
        let pending_power = machine.bus.sync.slave_power_request;

        if let Err(e) = machine.bus.events.restore(&staged.events) {
            log(LogCategory::SaveState, LogLevel::Warn, || {
                format!("snapshot event data invalid ({}), scheduler reset to default arming", e)
            });
            return Err(e.into());
        }
        self.commit(machine, staged, self.icache_emulated != identity.icache_emulated);

        if let Err(e) = self.load_devices(machine) {
            log(LogCategory::SaveState, LogLevel::Warn, || {
                format!("snapshot rejected: {}; rolling back", e)
            });
            previous.roll_back(machine, &identity);
            machine.bus.sync.slave_power_request = pending_power;
            return Err(e);
        }

        // Restored backup RAM goes through the normal delayed save.
        machine.bus.mem.mark_backup_dirty();
        log(LogCategory::SaveState, LogLevel::Debug, || {
            format!("snapshot v{:#x} applied at timestamp {}", self.version, self.timestamp)
        });
        Ok(())
    }

    /// Put back state captured from this same machine.
    fn roll_back(&self, machine: &mut Machine, identity: &Identity) {
        let result = self.stage(machine, identity).and_then(|staged| {
            machine.bus.events.restore(&staged.events)?;
            self.commit(machine, staged, false);
            self.load_devices(machine)
        });
        if let Err(e) = result {
            log(LogCategory::SaveState, LogLevel::Error, || format!("rollback failed: {}", e));
        }
    }
}

/// Decoded snapshot contents, ready to commit.
struct Staged {
    low: Vec<u8>,
    high: Vec<u8>,
    backup: Vec<u8>,
    cpus: [Sh2; 2],
    events: PackedEvents,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::WaitStates;
    use crate::devices::default_devices;

    const ID: Identity = Identity {
        bios_sha256: "abc123",
        cart_type: CartType::None,
        icache_emulated: false,
    };

    fn machine() -> Machine {
        let bus = Bus::new(WaitStates::default(), default_devices(10_000)).unwrap();
        let mut m = Machine::new(bus);
        m.reset(true);
        m
    }

    fn rearranged() -> Machine {
        let mut m = machine();
        m.bus.events.begin_running();
        for (i, id) in EventId::ALL.iter().enumerate() {
            m.bus.events.schedule(id.index(), 1000 - 10 * i as Timestamp);
        }
        m.bus.events.disable(EventId::Sound.index());
        m.bus.events.set_idle();
        m.bus.sync.timestamp = 321;
        m.cpus[0].regs[3] = 0xDEAD_BEEF;
        m.cpus[1].pc = 0x0600_1000;
        m
    }

    #[test]
    fn test_round_trip_restores_timing_state() {
        let src = rearranged();
        let bytes = Snapshot::capture(&src, ID).unwrap().to_bytes().unwrap();

        let mut dst = machine();
        Snapshot::from_bytes(&bytes).unwrap().apply(&mut dst, ID).unwrap();

        assert_eq!(dst.bus.events().pack(), src.bus.events().pack());
        assert_eq!(dst.bus.timestamp(), 321);
        assert_eq!(dst.cpus[0].regs[3], 0xDEAD_BEEF);
        assert_eq!(dst.cpus[1].pc, 0x0600_1000);
        assert!(dst.bus.events().check_links().is_ok());
    }

    #[test]
    fn test_identity_mismatch_changes_nothing() {
        let src = rearranged();
        let snap = Snapshot::capture(&src, ID).unwrap();
        let mut dst = machine();
        let before = dst.bus.events().pack();

        let other_bios = Identity {
            bios_sha256: "ffff",
            ..ID
        };
        assert!(matches!(
            snap.apply(&mut dst, other_bios),
            Err(SnapshotError::BiosMismatch { .. })
        ));
        let other_cart = Identity {
            cart_type: CartType::ExtRam4M,
            ..ID
        };
        assert!(matches!(
            snap.apply(&mut dst, other_cart),
            Err(SnapshotError::CartMismatch { .. })
        ));
        assert_eq!(dst.bus.events().pack(), before);
        assert_eq!(dst.bus.timestamp(), 0);
    }

    #[test]
    fn test_duplicate_event_index_resets_scheduler() {
        let src = rearranged();
        let mut snap = Snapshot::capture(&src, ID).unwrap();
        snap.events.order[1] = snap.events.order[0];

        let mut dst = rearranged();
        let result = snap.apply(&mut dst, ID);
        assert!(matches!(result, Err(SnapshotError::Events(EventRestoreError::Duplicate(_)))));
        assert_eq!(dst.bus.events().pack(), machine().bus.events().pack(), "default arming");
    }

    #[test]
    fn test_legacy_disabled_times_remapped() {
        let src = rearranged();
        let mut snap = Snapshot::capture(&src, ID).unwrap();
        snap.version = 0x0010_2500;
        let sound = EventId::Sound.index();
        snap.events.times[sound] = TIMESTAMP_LIMIT;

        let mut dst = machine();
        snap.apply(&mut dst, ID).unwrap();
        assert_eq!(dst.bus.events().time(sound), EVENT_DISABLED);
    }

    #[test]
    fn test_future_version_rejected() {
        let mut snap = Snapshot::capture(&machine(), ID).unwrap();
        snap.version = SNAPSHOT_VERSION + 1;
        assert!(matches!(
            snap.apply(&mut machine(), ID),
            Err(SnapshotError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_truncated_ram_blob_rejected_before_commit() {
        let mut snap = Snapshot::capture(&rearranged(), ID).unwrap();
        snap.work_ram_high = BASE64.encode([0u8; 16]);
        let mut dst = machine();
        assert!(matches!(snap.apply(&mut dst, ID), Err(SnapshotError::Blob { .. })));
        assert_eq!(dst.bus.timestamp(), 0);
    }

    #[test]
    fn test_cache_invalidated_when_mode_differs() {
        let mut src = machine();
        src.cpus[0].ccr = crate::sh2::CCR_CE;
        let snap = Snapshot::capture(&src, ID).unwrap();
        let live = Identity {
            icache_emulated: true,
            ..ID
        };
        let mut dst = machine();
        snap.apply(&mut dst, live).unwrap();
        assert!(dst.cpus[0].cache_enabled());
        assert!(!dst.cpus[0].cache().contains(0));
    }

    /// Passes the pre-check but refuses its first load.
    #[derive(Default)]
    struct RefusesOnce {
        refused: bool,
    }

    impl crate::events::Device for RefusesOnce {
        fn name(&self) -> &str {
            "CDB"
        }

        fn load_state(&mut self, _state: &Value) -> Result<(), serde_json::Error> {
            if self.refused {
                return Ok(());
            }
            self.refused = true;
            Err(serde::de::Error::custom("refused"))
        }
    }

    #[test]
    fn test_device_refusing_load_rolls_back() {
        let snap = Snapshot::capture(&rearranged(), ID).unwrap();
        let mut dst = machine();
        dst.bus.devices.replace(EventId::Cdb, Box::new(RefusesOnce::default()));
        dst.bus.sync.timestamp = 77;
        dst.cpus[0].regs[3] = 0x1234;
        let before = dst.bus.events().pack();

        let result = snap.apply(&mut dst, ID);
        assert!(matches!(result, Err(SnapshotError::Device { ref name, .. }) if name == "CDB"));
        assert_eq!(dst.bus.events().pack(), before);
        assert_eq!(dst.bus.timestamp(), 77);
        assert_eq!(dst.cpus[0].regs[3], 0x1234);
        assert!(!dst.bus.mem.take_backup_dirty());
    }

    #[test]
    fn test_missing_device_blob_rejected_before_commit() {
        let mut snap = Snapshot::capture(&rearranged(), ID).unwrap();
        snap.devices.remove("CDB");
        let mut dst = machine();
        let before = dst.bus.events().pack();
        assert!(matches!(
            snap.apply(&mut dst, ID),
            Err(SnapshotError::Blob { ref name, .. }) if name == "CDB"
        ));
        assert_eq!(dst.bus.events().pack(), before);
    }

    #[test]
    fn test_blobs_keyed_by_slot() {
        let mut src = machine();
        src.bus.devices.replace(EventId::Cdb, Box::new(crate::devices::IdleDevice::new("VDP2")));
        let snap = Snapshot::capture(&src, ID).unwrap();
        assert_eq!(snap.devices.len(), EventId::DEVICE_COUNT);
        assert!(snap.devices["VDP2"].is_object(), "frame timer state kept");
        assert!(snap.devices["CDB"].is_null());
    }

    #[test]
    fn test_applied_backup_ram_marked_dirty() {
        let snap = Snapshot::capture(&rearranged(), ID).unwrap();
        let mut dst = machine();
        assert!(!dst.bus.mem.take_backup_dirty());
        snap.apply(&mut dst, ID).unwrap();
        assert!(dst.bus.mem.take_backup_dirty());
    }

    #[test]
    fn test_malformed_bytes() {
        assert!(matches!(
            Snapshot::from_bytes(b"not json"),
            Err(SnapshotError::Decode(_))
        ));
    }
}
