//! Stand-in devices.
//!
//! A session starts with an [`IdleDevice`] in every slot except VDP2, which
//! gets a [`FrameTimer`] so that frames end on time and the mid-frame hook
//! fires once per frame. Real device models replace these through
//! `Saturn::attach_device`.

use crate::events::{Device, DeviceIo, EventId};
use emu_core::scheduler::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Never wakes, reads as zero.
pub struct IdleDevice {
    name: String,
}

impl IdleDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Device for IdleDevice {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Frame pacing: arms the mid-frame sync halfway through each frame and ends
/// the frame at the full period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameTimer {
    cycles_per_frame: Timestamp,
    next_edge: Timestamp,
    at_midpoint: bool,
    frames: u64,
}

impl FrameTimer {
    pub fn new(cycles_per_frame: Timestamp) -> Self {
        let mut timer = Self {
            cycles_per_frame,
            next_edge: 0,
            at_midpoint: true,
            frames: 0,
        };
        timer.reset(true);
        timer
    }

    fn half(&self) -> Timestamp {
        self.cycles_per_frame / 2
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn decode_state(&self, state: &Value) -> Result<Self, serde_json::Error> {
        let restored = FrameTimer::deserialize(state)?;
        if restored.cycles_per_frame != self.cycles_per_frame {
            return Err(serde::de::Error::custom(format!(
                "frame length {} does not match session frame length {}",
                restored.cycles_per_frame, self.cycles_per_frame
            )));
        }
        Ok(restored)
    }
}

impl Device for FrameTimer {
    fn name(&self) -> &str {
        EventId::Vdp2.name()
    }

    fn reset(&mut self, powering_up: bool) {
        self.next_edge = self.half();
        self.at_midpoint = true;
        if powering_up {
            self.frames = 0;
        }
    }

    fn update(&mut self, timestamp: Timestamp, io: &mut DeviceIo) -> Timestamp {
        if timestamp < self.next_edge {
            return self.next_edge;
        }

        if self.at_midpoint {
            io.schedule(EventId::MidSync, timestamp);
            self.next_edge += self.cycles_per_frame - self.half();
        } else {
            self.frames += 1;
            io.end_frame();
            self.next_edge += self.half();
        }
        self.at_midpoint = !self.at_midpoint;
        self.next_edge
    }

    fn adjust_ts(&mut self, delta: Timestamp) {
        self.next_edge += delta;
    }

    fn save_state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn check_state(&self, state: &Value) -> Result<(), serde_json::Error> {
        self.decode_state(state).map(|_| ())
    }

    fn load_state(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        *self = self.decode_state(state)?;
        Ok(())
    }
}

/// Placeholder for a slot whose wake time is never used.
pub(crate) fn idle_for(id: EventId) -> Box<dyn Device> {
    debug_assert!(id.is_device());
    Box::new(IdleDevice::new(id.name()))
}

/// Default device table for a session.
pub(crate) fn default_devices(cycles_per_frame: Timestamp) -> Vec<Box<dyn Device>> {
    EventId::ALL
        .iter()
        .filter(|id| id.is_device())
        .map(|&id| match id {
            EventId::Vdp2 => Box::new(FrameTimer::new(cycles_per_frame)) as Box<dyn Device>,
            _ => idle_for(id),
        })
        .collect()
}
