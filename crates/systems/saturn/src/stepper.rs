//! Frame loop for the two SH-2s.
//!
//! The master steps one instruction at a time; the slave then runs until it
//! has caught up with the master, so it never leads. The effective clock is
//! the later of the master's timestamp and the bus timestamp, and events fire
//! whenever it reaches the scheduler's next wake time.
//!
//! Instruction-cache emulation and debug hooks are compile-time parameters of
//! the loop. The variant is picked once per frame from [`RUN_LOOPS`].

use crate::bus::Bus;
use crate::sh2::{CpuId, Sh2};
use emu_core::logging::{log, LogCategory, LogLevel};
use emu_core::scheduler::{RunState, Timestamp};

/// What a debug hook sees before each instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepView {
    pub cpu: CpuId,
    pub pc: u32,
    pub cpu_timestamp: Timestamp,
    pub master_timestamp: Timestamp,
    pub bus_timestamp: Timestamp,
    pub eff_timestamp: Timestamp,
}

pub type DebugHook = Box<dyn FnMut(&StepView)>;

pub struct Machine {
    pub cpus: [Sh2; 2],
    pub bus: Bus,
    pub slave_on: bool,
    pub(crate) debug_hook: Option<DebugHook>,
}

type RunLoop = fn(&mut Machine) -> Timestamp;

/// Indexed by `[icache][debug]`.
pub const RUN_LOOPS: [[RunLoop; 2]; 2] = [
    [run_loop::<false, false>, run_loop::<false, true>],
    [run_loop::<true, false>, run_loop::<true, true>],
];

impl Machine {
    pub fn new(bus: Bus) -> Self {
        Self {
            cpus: [Sh2::new(CpuId::Master), Sh2::new(CpuId::Slave)],
            bus,
            slave_on: false,
            debug_hook: None,
        }
    }

    pub fn reset(&mut self, powering_up: bool) {
        if powering_up {
            if let Some(ram) = self.bus.mem.work_ram_low_mut() {
                ram.fill(0);
            }
            if let Some(ram) = self.bus.mem.work_ram_high_mut() {
                ram.fill(0);
            }
        }
        self.bus.sync.bus_lock = 0;
        self.bus.sync.slave_power_request = None;
        self.bus.events.reset();
        self.bus.devices.reset(powering_up);
        self.slave_on = false;
        for cpu in &mut self.cpus {
            cpu.reset(&self.bus);
        }
    }

    /// Run one frame and return the timestamp it ended at, which is also the
    /// number of CPU cycles it consumed. All timestamps are rebased to it on
    /// return.
    pub fn run_frame(&mut self, icache: bool, debug: bool) -> Timestamp {
        self.bus.sync.allow_midsync = true;
        let run = RUN_LOOPS[icache as usize][debug as usize];
        let end_ts = run(self);
        self.end_frame(end_ts);
        end_ts
    }

    /// Apply a pending slave power change. Only called between inner loops.
    fn apply_slave_power(&mut self) {
        let Some(on) = self.bus.sync.slave_power_request.take() else {
            return;
        };
        if on == self.slave_on {
            return;
        }
        log(LogCategory::CPU, LogLevel::Debug, || {
            format!("SH2-S {} at {}", if on { "on" } else { "off" }, self.cpus[0].timestamp)
        });
        self.slave_on = on;
        if on {
            let [master, slave] = &mut self.cpus;
            slave.reset(&self.bus);
            slave.timestamp = master.timestamp;
        }
    }

    fn deliver_fti(&mut self) {
        let pulses = self.bus.mem.take_fti_pulses();
        for (cpu, n) in self.cpus.iter_mut().zip(pulses) {
            for _ in 0..n {
                cpu.pulse_fti();
            }
        }
    }

    fn end_frame(&mut self, end_ts: Timestamp) {
        self.bus.force_events(end_ts);
        self.bus.events.rebase(end_ts);
        self.bus.devices.adjust_ts(-end_ts);
        self.bus.sync.timestamp -= end_ts;
        for cpu in &mut self.cpus {
            cpu.adjust_ts(-end_ts);
        }
        self.bus.events.set_idle();
    }

    #[inline(always)]
    fn step_cpu<const ICACHE: bool, const DEBUG: bool>(&mut self, which: usize, eff: Timestamp) {
        if DEBUG {
            if let Some(hook) = self.debug_hook.as_mut() {
                let cpu = &self.cpus[which];
                hook(&StepView {
                    cpu: cpu.id,
                    pc: cpu.pc,
                    cpu_timestamp: cpu.timestamp,
                    master_timestamp: self.cpus[0].timestamp,
                    bus_timestamp: self.bus.sync.timestamp,
                    eff_timestamp: eff,
                });
            }
        }
        self.cpus[which].step::<ICACHE, Bus>(&mut self.bus);
        self.deliver_fti();
    }
}

fn run_loop<const ICACHE: bool, const DEBUG: bool>(m: &mut Machine) -> Timestamp {
    let mut eff = m.cpus[0].timestamp.max(m.bus.sync.timestamp);
    loop {
        m.apply_slave_power();
        m.bus.events.begin_running();
        m.bus.force_events(eff);

        loop {
            loop {
                m.step_cpu::<ICACHE, DEBUG>(0, eff);
                if m.slave_on {
                    while m.cpus[0].timestamp > m.cpus[1].timestamp {
                        m.step_cpu::<ICACHE, DEBUG>(1, eff);
                    }
                } else {
                    m.cpus[1].timestamp = m.cpus[0].timestamp;
                }

                eff = m.cpus[0].timestamp;
                if m.bus.sync.timestamp > eff {
                    eff = m.bus.sync.timestamp;
                } else {
                    m.bus.sync.timestamp = eff;
                }

                if eff >= m.bus.events.next_wake() {
                    break;
                }
            }
            if !m.bus.run_events(eff) {
                break;
            }
        }

        if m.bus.events.state() != RunState::ExitRequested {
            break;
        }
    }
    eff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitStates;
    use crate::devices::default_devices;
    use crate::events::{Device, DeviceIo, EventId};
    use emu_core::memmap::Width;
    use emu_core::scheduler::EVENT_DISABLED;
    use std::cell::RefCell;
    use std::rc::Rc;

    const FRAME: Timestamp = 10_000;

    fn bios_with(program: &[u16]) -> Machine {
        let bus = Bus::new(WaitStates::default(), default_devices(FRAME)).unwrap();
        let mut m = Machine::new(bus);
        if let Some(bios) = m.bus.mem.bios_mut() {
            bios[0..4].copy_from_slice(&0x100u32.to_be_bytes());
            bios[4..8].copy_from_slice(&0x0601_0000u32.to_be_bytes());
            for (i, w) in program.iter().enumerate() {
                bios[0x100 + 2 * i..0x102 + 2 * i].copy_from_slice(&w.to_be_bytes());
            }
            bios[0x110..0x114].copy_from_slice(&0x0020_0000u32.to_be_bytes());
        }
        m.reset(true);
        m
    }

    const STORE_LOOP: [u16; 8] = [0xD103, 0xE205, 0x2122, 0x7201, 0xAFFC, 0x0009, 0x0009, 0x0009];

    #[test]
    fn test_frame_ends_at_frame_length() {
        let mut m = bios_with(&STORE_LOOP);
        let end = m.run_frame(false, false);
        assert!(end >= FRAME, "frame ended early at {}", end);
        assert!(end < FRAME + 64, "frame overshot to {}", end);
        assert!(m.bus.timestamp() < 64);
        assert_eq!(m.bus.events.state(), RunState::Idle);
        assert!(
            m.bus.memory().map().read(0x0020_0000, Width::Long) > 5,
            "program stored to low RAM"
        );
    }

    #[test]
    fn test_timestamps_rebased_after_frame() {
        let mut m = bios_with(&STORE_LOOP);
        m.run_frame(false, false);
        let next = m.bus.events.time(EventId::Vdp2.index());
        assert!(next > 0 && next <= FRAME / 2, "frame timer rebased to {}", next);
        assert!(m.cpus[0].timestamp <= m.bus.timestamp());

        let second = m.run_frame(false, false);
        assert!((FRAME - 64..FRAME + 64).contains(&second));
    }

    #[test]
    fn test_all_loop_variants_agree() {
        let mut ends = Vec::new();
        for icache in [false, true] {
            for debug in [false, true] {
                let mut m = bios_with(&STORE_LOOP);
                m.run_frame(icache, debug);
                ends.push(m.bus.memory().work_ram_low()[..4].to_vec());
            }
        }
        assert_eq!(ends[0], ends[1], "debug hook mode does not change results");
        assert_eq!(ends[2], ends[3]);
    }

    #[test]
    fn test_slave_never_leads_master() {
        let mut m = bios_with(&STORE_LOOP);
        m.bus.sync.slave_power_request = Some(true);
        let views = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&views);
        m.debug_hook = Some(Box::new(move |v: &StepView| sink.borrow_mut().push(*v)));

        m.run_frame(false, true);
        assert!(m.slave_on);
        let views = views.borrow();
        let slave_steps: Vec<_> = views.iter().filter(|v| v.cpu == CpuId::Slave).collect();
        assert!(!slave_steps.is_empty());
        for v in slave_steps {
            assert!(
                v.cpu_timestamp < v.master_timestamp,
                "slave stepped at {} with master at {}",
                v.cpu_timestamp,
                v.master_timestamp
            );
        }
    }

    #[test]
    fn test_slave_off_follows_master() {
        let mut m = bios_with(&STORE_LOOP);
        m.run_frame(false, false);
        assert!(!m.slave_on);
        assert_eq!(m.cpus[1].timestamp, m.cpus[0].timestamp);
        assert_eq!(m.cpus[1].pc, 0x100, "slave never ran");
    }

    struct PowerToggle {
        fire_at: Timestamp,
    }

    impl Device for PowerToggle {
        fn name(&self) -> &str {
            "SMPC"
        }

        fn update(&mut self, timestamp: Timestamp, io: &mut DeviceIo) -> Timestamp {
            if timestamp < self.fire_at {
                return self.fire_at;
            }
            io.request_slave_power(true);
            EVENT_DISABLED
        }
    }

    #[test]
    fn test_slave_power_applied_at_outer_boundary() {
        let mut m = bios_with(&STORE_LOOP);
        m.bus
            .devices
            .replace(EventId::Smpc, Box::new(PowerToggle { fire_at: 2_000 }));
        m.run_frame(false, false);
        assert!(m.slave_on);
        assert_eq!(m.bus.sync.slave_power_request, None);
        assert_ne!(m.cpus[1].pc, 0x100, "slave ran after power-on");
    }

    #[test]
    fn test_fti_delivered_to_other_cpu() {
        // MOV.L @(3,PC),R1 with literal 0x01000000; MOV.W R2,@R1; BRA self; NOP
        let program = [0xD103, 0x2121, 0xAFFE, 0x0009];
        let mut m = bios_with(&program);
        if let Some(bios) = m.bus.mem.bios_mut() {
            bios[0x110..0x114].copy_from_slice(&0x0100_0000u32.to_be_bytes());
        }
        m.run_frame(false, false);
        assert_eq!(m.cpus[1].frt_captures(), 1);
        assert_eq!(m.cpus[0].frt_captures(), 0);
    }

    #[test]
    fn test_midsync_hook_once_per_frame() {
        let mut m = bios_with(&STORE_LOOP);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&calls);
        m.bus.devices.midsync_hook = Some(Box::new(move |ts: Timestamp| sink.borrow_mut().push(ts)));
        m.run_frame(false, false);
        m.run_frame(false, false);
        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|&ts| (FRAME / 2 - 64..FRAME / 2 + 64).contains(&ts)));
    }

    #[test]
    fn test_bus_time_wins_over_master() {
        let mut m = bios_with(&STORE_LOOP);
        m.bus.sync.timestamp = 500;
        let views = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&views);
        m.debug_hook = Some(Box::new(move |v: &StepView| sink.borrow_mut().push(*v)));
        m.run_frame(false, true);
        let views = views.borrow();
        assert!(views[1].eff_timestamp >= 500);
        assert!(m.bus.memory().map().read(0x0020_0000, Width::Long) > 0);
    }
}
