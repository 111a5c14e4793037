//! Frame loop behaviour through the public session API.

mod common;

use common::*;
use emu_core::memmap::Width;
use emu_core::scheduler::Timestamp;
use emu_core::System;
use emu_saturn::{CacheMode, CpuId, Device, DeviceIo, EventId, Region, SessionConfig, StepView};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Longest single instruction of the test programs, in cycles.
const MAX_STEP: u32 = 64;

#[test]
fn test_frames_consume_one_frame_of_cycles() {
    let mut saturn = session(&store_loop_bios(0x0020_0000));
    let per_frame = saturn.cycles_per_frame() as u32;
    assert_eq!(per_frame, 477_750);

    let mut total = 0u64;
    for _ in 0..3 {
        let cycles = saturn.run_frame().unwrap();
        assert!(
            cycles + MAX_STEP >= per_frame && cycles <= per_frame + MAX_STEP,
            "frame took {} cycles",
            cycles
        );
        total += cycles as u64;
    }
    let drift = total as i64 - 3 * per_frame as i64;
    assert!(drift.abs() < MAX_STEP as i64, "frames drift by {}", drift);
    assert!(saturn.bus_timestamp() < MAX_STEP as Timestamp);
}

#[test]
fn test_pal_frame_length() {
    let config = SessionConfig {
        region: Region::Europe,
        ..SessionConfig::default()
    };
    let mut saturn = session_with(config, &store_loop_bios(0x0020_0000));
    let cycles = saturn.run_frame().unwrap();
    assert!((568_750..568_750 + MAX_STEP).contains(&cycles));
}

#[test]
fn test_program_output_visible_to_peek() {
    let mut saturn = session(&store_loop_bios(0x0600_0000));
    saturn.run_frame().unwrap();
    let value = u32::from_be_bytes([
        saturn.peek(0x0600_0000),
        saturn.peek(0x0600_0001),
        saturn.peek(0x0600_0002),
        saturn.peek(0x0600_0003),
    ]);
    assert!(value > 1000, "store loop ran only {} times", value - 5);
    assert_eq!(
        saturn.memory().map().read(0x0610_0000, Width::Long),
        value,
        "high RAM mirrors every 1MB"
    );
}

#[test]
fn test_midsync_hook_once_per_frame() {
    let mut saturn = session(&store_loop_bios(0x0020_0000));
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    saturn.set_midsync_hook(move |ts| sink.borrow_mut().push(ts));

    for _ in 0..4 {
        saturn.run_frame().unwrap();
    }
    let calls = calls.borrow();
    assert_eq!(calls.len(), 4);
    let half = saturn.cycles_per_frame() / 2;
    for &ts in calls.iter() {
        assert!((ts - half).abs() < MAX_STEP as Timestamp, "mid-frame sync at {}", ts);
    }
}

#[test]
fn test_slave_bounded_by_master() {
    let mut saturn = session(&store_loop_bios(0x0020_0000));
    saturn.request_slave_power(true);

    let slave_steps = Rc::new(Cell::new(0u64));
    let violations = Rc::new(Cell::new(0u64));
    let (steps, bad) = (Rc::clone(&slave_steps), Rc::clone(&violations));
    saturn.set_debug_hook(move |v: &StepView| {
        if v.cpu == CpuId::Slave {
            steps.set(steps.get() + 1);
            if v.cpu_timestamp >= v.master_timestamp {
                bad.set(bad.get() + 1);
            }
        }
    });

    saturn.run_frame().unwrap();
    assert!(saturn.slave_on());
    assert!(slave_steps.get() > 1000);
    assert_eq!(violations.get(), 0);

    let master = saturn.cpu(CpuId::Master).timestamp;
    let slave = saturn.cpu(CpuId::Slave).timestamp;
    assert!(
        slave >= master && slave - master < MAX_STEP as Timestamp,
        "slave {} master {}",
        slave,
        master
    );
}

#[test]
fn test_slave_power_off() {
    let mut saturn = session(&store_loop_bios(0x0020_0000));
    saturn.request_slave_power(true);
    saturn.run_frame().unwrap();
    let pc = saturn.cpu(CpuId::Slave).pc;

    saturn.request_slave_power(false);
    saturn.run_frame().unwrap();
    assert!(!saturn.slave_on());
    assert_eq!(saturn.cpu(CpuId::Slave).pc, pc, "slave stopped");
    assert_eq!(
        saturn.cpu(CpuId::Slave).timestamp,
        saturn.cpu(CpuId::Master).timestamp
    );
}

#[test]
fn test_icache_mode_runs_same_program() {
    let config = SessionConfig {
        cache_mode: CacheMode::Full,
        ..SessionConfig::default()
    };
    let mut saturn = session_with(config, &store_loop_bios(0x0020_0000));
    saturn.run_frame().unwrap();
    assert!(saturn.memory().map().read(0x0020_0000, Width::Long) > 5);
}

/// Counts register writes and wakes every `period` cycles.
struct Ticker {
    period: Timestamp,
    wakes: Rc<Cell<u32>>,
    writes: Rc<Cell<u32>>,
    stall: Timestamp,
}

impl Device for Ticker {
    fn name(&self) -> &str {
        "CDB"
    }

    fn update(&mut self, timestamp: Timestamp, _io: &mut DeviceIo) -> Timestamp {
        self.wakes.set(self.wakes.get() + 1);
        timestamp + self.period
    }

    fn write(&mut self, _addr: u32, _width: Width, _value: u32, io: &mut DeviceIo) {
        self.writes.set(self.writes.get() + 1);
        io.stall(self.stall);
    }
}

#[test]
fn test_device_wakes_and_register_writes() {
    let mut saturn = session(&store_loop_bios(0x2589_0000));
    let wakes = Rc::new(Cell::new(0));
    let writes = Rc::new(Cell::new(0));
    saturn
        .attach_device(
            EventId::Cdb,
            Box::new(Ticker {
                period: 1000,
                wakes: Rc::clone(&wakes),
                writes: Rc::clone(&writes),
                stall: 20,
            }),
        )
        .unwrap();
    saturn.map_peripheral(0x0589_0000, 0x0589_FFFF, EventId::Cdb).unwrap();

    let cycles = saturn.run_frame().unwrap();
    let expected_wakes = cycles / 1000;
    assert!(
        (expected_wakes..=expected_wakes + 2).contains(&wakes.get()),
        "{} wakes over {} cycles",
        wakes.get(),
        cycles
    );
    // Each loop pass is 5 cycles of instructions plus the 20-cycle stall.
    assert!(writes.get() > cycles / 30 && writes.get() < cycles / 20);
}
