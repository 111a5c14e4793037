//! Process-wide diagnostic logging.
//!
//! - **LogConfig**: global, lock-free level table (one level per category plus
//!   a global fallback)
//! - **LogLevel**: Off < Error < Warn < Info < Debug < Trace
//! - **LogCategory**: CPU, Bus, Events, SaveState, Persist, Stubs
//! - **log()**: the single entry point; messages are built lazily
//!
//! Each category is rate limited with a one-second sliding window so that a
//! misbehaving guest program hammering an unmapped register cannot flood the
//! output. Output goes to stderr, or to a file written from a background
//! thread once [`LogConfig::set_log_file`] has been called.
//!
//! ```rust
//! use emu_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Events, LogLevel::Debug, || {
//!     format!("event {} rescheduled to {}", 3, 0x1234)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Verbosity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Parse a level name or number, case-insensitively.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        Self::ALL.get(val as usize).copied().unwrap_or(LogLevel::Off)
    }
}

/// Subsystem a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Processor stepping and cache control
    CPU,
    /// Memory map and peripheral accesses
    Bus,
    /// Scheduler and event handlers
    Events,
    /// Snapshot capture and restore
    SaveState,
    /// Non-volatile memory flushing
    Persist,
    /// Unimplemented features
    Stubs,
}

const CATEGORY_COUNT: usize = 6;

impl LogCategory {
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::CPU,
        LogCategory::Bus,
        LogCategory::Events,
        LogCategory::SaveState,
        LogCategory::Persist,
        LogCategory::Stubs,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Window {
    stamps: VecDeque<Instant>,
    dropped: usize,
    last_report: Option<Instant>,
}

/// Per-category sliding-window limiter.
struct RateLimiter {
    max_per_second: AtomicUsize,
    window: Duration,
    windows: Mutex<[Window; CATEGORY_COUNT]>,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            window: Duration::from_secs(1),
            windows: Mutex::new(Default::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Window; CATEGORY_COUNT]> {
        // A panic while holding the lock only leaves stale timestamps behind.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether the message may go out, plus the number of dropped
    /// messages to report if a report is due.
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut windows = self.lock();
        let w = &mut windows[category.index()];

        while w
            .stamps
            .front()
            .is_some_and(|&front| now.duration_since(front) > self.window)
        {
            w.stamps.pop_front();
        }

        if w.stamps.len() < self.max_per_second.load(Ordering::Relaxed) {
            w.stamps.push_back(now);
            if w.dropped > 0 {
                let dropped = std::mem::take(&mut w.dropped);
                w.last_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        w.dropped += 1;
        let report_due = w
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.window);
        if report_due {
            w.last_report = Some(now);
            (false, Some(std::mem::take(&mut w.dropped)))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration.
pub struct LogConfig {
    global_level: AtomicU8,
    levels: [AtomicU8; CATEGORY_COUNT],
    sink: Mutex<Option<Sender<String>>>,
    to_file: AtomicBool,
    limiter: RateLimiter,
}

impl LogConfig {
    /// Everything off, 60 messages per second per category.
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            sink: Mutex::new(None),
            to_file: AtomicBool::new(false),
            limiter: RateLimiter::new(60),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category set to anything but `Off` uses its own level; otherwise the
    /// global level applies.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let threshold = match self.get_level(category) {
            LogLevel::Off => self.get_global_level(),
            own => own,
        };
        level != LogLevel::Off && level <= threshold
    }

    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    pub fn set_rate_limit(&self, max_per_second: usize) {
        self.limiter.max_per_second.store(max_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.limiter.max_per_second.load(Ordering::Relaxed)
    }

    /// Append log output to `path` from a background writer thread.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new().name("log-writer".to_string()).spawn(move || {
            while let Ok(message) = receiver.recv() {
                let _ = writeln!(file, "{}", message);
                let _ = file.flush();
            }
        })?;

        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        self.to_file.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Go back to stderr. The writer thread exits once its channel closes.
    pub fn clear_log_file(&self) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.to_file.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: String) {
        if self.to_file.load(Ordering::Relaxed) {
            let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
            match sink.as_ref().map(|s| s.send(message)) {
                Some(Ok(())) => {}
                Some(Err(e)) => eprintln!("{}", e.0),
                None => {}
            }
        } else {
            eprintln!("{}", message);
        }
    }
}

/// Log a lazily built message.
///
/// `message_fn` only runs when the category is enabled at `level` and the
/// category's rate limit has room. Dropped messages are summarised at most
/// once per second.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped) = config.limiter.should_allow(category);
    if let Some(count) = dropped.filter(|&n| n > 0) {
        config.write_message(format!(
            "[{:?}] WARNING: rate limit exceeded, {} message(s) dropped",
            category, count
        ));
    }
    if allowed {
        config.write_message(format!("[{:?}] {}", category, message_fn()));
    }
}
