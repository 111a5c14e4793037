//! Event slots and the devices behind them.
//!
//! Every hardware subsystem owns one slot in the scheduler. When a slot comes
//! due the dispatcher hands the device a [`DeviceIo`], through which it can see
//! the bus timestamp, stall the bus, re-arm other slots and ask the step loop
//! to come out to its outer boundary.
//!
//! Two slots carry fixed behavior ahead of the device model:
//!
//! - The SH-2 on-chip DMA slots catch up to the bus timestamp when they are
//!   behind it, and back off one cycle at a time while another master holds
//!   the bus.
//! - `MidSync` runs the host mid-frame hook at most once per frame and then
//!   disables itself.

use crate::bus::Memory;
use emu_core::memmap::Width;
use emu_core::scheduler::{EventHandler, EventList, Timestamp, EVENT_DISABLED};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scheduler slots, in default arming order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    ShMasterDma,
    ShSlaveDma,
    ScuDma,
    ScuDsp,
    Smpc,
    Vdp1,
    Vdp2,
    Cdb,
    Sound,
    Cart,
    MidSync,
}

impl EventId {
    pub const ALL: [EventId; 11] = [
        EventId::ShMasterDma,
        EventId::ShSlaveDma,
        EventId::ScuDma,
        EventId::ScuDsp,
        EventId::Smpc,
        EventId::Vdp1,
        EventId::Vdp2,
        EventId::Cdb,
        EventId::Sound,
        EventId::Cart,
        EventId::MidSync,
    ];

    /// Slots backed by a [`Device`]; every slot except `MidSync`.
    pub const DEVICE_COUNT: usize = 10;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_device(self) -> bool {
        self != EventId::MidSync
    }

    pub fn name(self) -> &'static str {
        match self {
            EventId::ShMasterDma => "SH2-M DMA",
            EventId::ShSlaveDma => "SH2-S DMA",
            EventId::ScuDma => "SCU DMA",
            EventId::ScuDsp => "SCU DSP",
            EventId::Smpc => "SMPC",
            EventId::Vdp1 => "VDP1",
            EventId::Vdp2 => "VDP2",
            EventId::Cdb => "CDB",
            EventId::Sound => "SOUND",
            EventId::Cart => "CART",
            EventId::MidSync => "MIDSYNC",
        }
    }
}

/// A fresh scheduler in default arming: every slot due at time 0, `MidSync`
/// disabled.
pub fn new_event_list() -> EventList {
    EventList::new(EventId::ALL.len()).with_initially_disabled(EventId::MidSync.index())
}

/// Bus-global timing state shared between the bus, the step loop and event
/// handlers.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Bus timestamp.
    pub timestamp: Timestamp,
    /// Nonzero while another bus master (SCU DMA) owns the SH-2 bus.
    pub bus_lock: u32,
    /// Pending slave power change, applied at the step loop's outer boundary.
    pub slave_power_request: Option<bool>,
    /// Cleared once the mid-frame hook has run; set again at frame start.
    pub allow_midsync: bool,
}

/// What a device may touch while it runs.
pub struct DeviceIo<'a> {
    pub(crate) events: &'a mut EventList,
    pub(crate) sync: &'a mut SyncState,
    pub(crate) mem: &'a mut Memory,
}

impl<'a> DeviceIo<'a> {
    pub(crate) fn new(events: &'a mut EventList, sync: &'a mut SyncState, mem: &'a mut Memory) -> Self {
        Self { events, sync, mem }
    }

    /// Current bus timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.sync.timestamp
    }

    /// Hold the bus for `cycles`.
    pub fn stall(&mut self, cycles: Timestamp) {
        self.sync.timestamp += cycles;
    }

    pub fn schedule(&mut self, event: EventId, timestamp: Timestamp) {
        self.events.schedule(event.index(), timestamp);
    }

    pub fn disable(&mut self, event: EventId) {
        self.events.disable(event.index());
    }

    pub fn event_time(&self, event: EventId) -> Timestamp {
        self.events.time(event.index())
    }

    /// Leave the inner step loop; the frame resumes after outer-loop
    /// housekeeping.
    pub fn request_exit(&mut self) {
        self.events.request_exit();
    }

    /// End the current frame.
    pub fn end_frame(&mut self) {
        self.events.request_frame_end();
    }

    pub fn lock_bus(&mut self) {
        self.sync.bus_lock += 1;
    }

    pub fn unlock_bus(&mut self) {
        self.sync.bus_lock = self.sync.bus_lock.saturating_sub(1);
    }

    /// Switch the slave CPU on or off. Takes effect at the step loop's outer
    /// boundary, never inside a handler.
    pub fn request_slave_power(&mut self, on: bool) {
        self.sync.slave_power_request = Some(on);
        self.events.request_exit();
    }

    /// DMA-initiated read. Wait states go to `acc` instead of the bus
    /// timestamp.
    pub fn dma_read(&mut self, addr: u32, width: Width, acc: &mut i32) -> u32 {
        self.mem.dma_read(addr, width, acc)
    }

    pub fn dma_write(&mut self, addr: u32, width: Width, value: u32, acc: &mut i32) {
        self.mem.dma_write(addr, width, value, acc)
    }
}

/// A hardware subsystem bound to one event slot.
///
/// Peripheral register windows mapped to a device's slot route reads and
/// writes to [`Device::read`] and [`Device::write`] with the 27-bit physical
/// address. The SMPC slot additionally receives the SMPC window of CS0.
pub trait Device {
    fn name(&self) -> &str;

    fn reset(&mut self, _powering_up: bool) {}

    /// Called when the device's slot comes due, or with the current time when
    /// all events are forced to update. Returns the next wake time.
    fn update(&mut self, _timestamp: Timestamp, _io: &mut DeviceIo) -> Timestamp {
        EVENT_DISABLED
    }

    fn read(&mut self, _addr: u32, _width: Width, _io: &mut DeviceIo) -> u32 {
        0
    }

    fn write(&mut self, _addr: u32, _width: Width, _value: u32, _io: &mut DeviceIo) {}

    /// Shift internal timestamps after the scheduler has been rebased.
    fn adjust_ts(&mut self, _delta: Timestamp) {}

    fn save_state(&self) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    /// Whether [`Device::load_state`] would accept `state`. Runs before any
    /// part of a snapshot is applied.
    fn check_state(&self, _state: &Value) -> Result<(), serde_json::Error> {
        Ok(())
    }

    fn load_state(&mut self, _state: &Value) -> Result<(), serde_json::Error> {
        Ok(())
    }

    /// Non-volatile contents, for devices that have any.
    fn nv_data(&self) -> Option<&[u8]> {
        None
    }

    fn load_nv(&mut self, _data: &[u8]) {}

    /// Returns and clears the NV dirty flag.
    fn take_nv_dirty(&mut self) -> bool {
        false
    }
}

pub type MidSyncHook = Box<dyn FnMut(Timestamp)>;

/// Device table indexed by event slot, plus the mid-frame hook.
pub struct Devices {
    slots: Vec<Box<dyn Device>>,
    pub(crate) midsync_hook: Option<MidSyncHook>,
}

impl Devices {
    pub fn new(slots: Vec<Box<dyn Device>>) -> Self {
        debug_assert_eq!(slots.len(), EventId::DEVICE_COUNT);
        Self {
            slots,
            midsync_hook: None,
        }
    }

    pub fn get(&self, id: EventId) -> Option<&dyn Device> {
        self.slots.get(id.index()).map(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut (dyn Device + 'static)> {
        self.slots.get_mut(id.index()).map(|d| d.as_mut())
    }

    /// Swap in a device, returning the old one.
    pub fn replace(&mut self, id: EventId, device: Box<dyn Device>) -> Option<Box<dyn Device>> {
        self.slots
            .get_mut(id.index())
            .map(|slot| std::mem::replace(slot, device))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Device> {
        self.slots.iter().map(|d| d.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Device>> {
        self.slots.iter_mut()
    }

    pub fn reset(&mut self, powering_up: bool) {
        for d in &mut self.slots {
            d.reset(powering_up);
        }
    }

    pub fn adjust_ts(&mut self, delta: Timestamp) {
        for d in &mut self.slots {
            d.adjust_ts(delta);
        }
    }
}

/// Routes due events to their devices.
pub(crate) struct Firing<'a> {
    pub devices: &'a mut Devices,
    pub sync: &'a mut SyncState,
    pub mem: &'a mut Memory,
}

impl EventHandler for Firing<'_> {
    fn handle(&mut self, event: usize, timestamp: Timestamp, events: &mut EventList) -> Timestamp {
        let Some(id) = EventId::from_index(event) else {
            return EVENT_DISABLED;
        };

        match id {
            EventId::MidSync => {
                if self.sync.allow_midsync {
                    if let Some(hook) = self.devices.midsync_hook.as_mut() {
                        hook(timestamp);
                    }
                    self.sync.allow_midsync = false;
                }
                EVENT_DISABLED
            }
            EventId::ShMasterDma | EventId::ShSlaveDma if timestamp < self.sync.timestamp => self.sync.timestamp,
            EventId::ShMasterDma | EventId::ShSlaveDma if self.sync.bus_lock != 0 => timestamp + 1,
            _ => {
                let mut io = DeviceIo::new(events, self.sync, self.mem);
                match self.devices.slots.get_mut(id.index()) {
                    Some(device) => device.update(timestamp, &mut io),
                    None => EVENT_DISABLED,
                }
            }
        }
    }
}
