//! Session configuration.
//!
//! Everything is defaulted, so an empty JSON object is a valid configuration:
//!
//! ```json
//! { "region": "Europe", "cache_mode": "Full", "wait_states": { "low_ram": 7 } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Master clock in master-clock units per second.
pub const MASTER_CLOCK_NTSC: i64 = 1_746_818_182;
pub const MASTER_CLOCK_PAL: i64 = 1_734_687_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Region {
    #[default]
    Japan,
    NorthAmerica,
    Europe,
    AsiaNtsc,
    AsiaPal,
    Brazil,
    Korea,
}

impl Region {
    pub fn is_pal(self) -> bool {
        matches!(self, Region::Europe | Region::AsiaPal)
    }

    /// SMPC area code reported to the BIOS.
    pub fn area_code(self) -> u8 {
        match self {
            Region::Japan => 0x1,
            Region::AsiaNtsc => 0x2,
            Region::NorthAmerica => 0x4,
            Region::Brazil => 0x5,
            Region::Korea => 0x6,
            Region::AsiaPal => 0xA,
            Region::Europe => 0xC,
        }
    }

    pub fn master_clock(self) -> i64 {
        if self.is_pal() {
            MASTER_CLOCK_PAL
        } else {
            MASTER_CLOCK_NTSC
        }
    }
}

/// How much of the SH-2 caches is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Data cache only, with high-level bypass
    #[default]
    DataBypass,
    /// Data cache only
    Data,
    /// Data and instruction cache
    Full,
}

impl CacheMode {
    pub fn emulates_icache(self) -> bool {
        self == CacheMode::Full
    }

    pub fn describe(self) -> &'static str {
        match self {
            CacheMode::DataBypass => "Data only, with high-level bypass",
            CacheMode::Data => "Data only",
            CacheMode::Full => "Full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CartType {
    #[default]
    None,
    BackupMemory,
    ExtRam1M,
    ExtRam4M,
    Kof95,
    Ultraman,
    Cs1Ram16M,
    NetlinkModem,
    Debug,
}

impl CartType {
    pub fn describe(self) -> &'static str {
        match self {
            CartType::None => "None",
            CartType::BackupMemory => "Backup Memory",
            CartType::ExtRam1M => "1MiB Extended RAM",
            CartType::ExtRam4M => "4MiB Extended RAM",
            CartType::Kof95 => "King of Fighters '95 ROM",
            CartType::Ultraman => "Ultraman ROM",
            CartType::Cs1Ram16M => "16MiB CS1 RAM",
            CartType::NetlinkModem => "Netlink Modem",
            CartType::Debug => "Debug",
        }
    }
}

/// Bus wait states in CPU cycles.
///
/// CS0 costs are per 16-bit bus cycle; a 32-bit access to a CS0 region is
/// charged twice. DMA credits are subtracted from the DMA accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitStates {
    pub bios: i32,
    pub low_ram: i32,
    pub backup_ram: i32,
    pub frt_trigger: i32,
    pub cs0_other: i32,
    pub high_ram_read: i32,
    /// High RAM writes round the bus timestamp up to a multiple of this.
    pub high_ram_write_align: i32,
    pub dma_high_ram_read_credit: i32,
    pub dma_high_ram_write_credit: i32,
    pub peripheral: i32,
}

impl Default for WaitStates {
    fn default() -> Self {
        Self {
            bios: 8,
            low_ram: 7,
            backup_ram: 8,
            frt_trigger: 8,
            cs0_other: 4,
            high_ram_read: 7,
            high_ram_write_align: 4,
            dma_high_ram_read_credit: 6,
            dma_high_ram_write_credit: 3,
            peripheral: 0,
        }
    }
}

const MAX_WAIT: i32 = 64;

impl WaitStates {
    pub fn validate(&self) -> Result<(), String> {
        let costs = [
            ("bios", self.bios),
            ("low_ram", self.low_ram),
            ("backup_ram", self.backup_ram),
            ("frt_trigger", self.frt_trigger),
            ("cs0_other", self.cs0_other),
            ("high_ram_read", self.high_ram_read),
            ("high_ram_write_align", self.high_ram_write_align),
            ("dma_high_ram_read_credit", self.dma_high_ram_read_credit),
            ("dma_high_ram_write_credit", self.dma_high_ram_write_credit),
            ("peripheral", self.peripheral),
        ];
        for (name, value) in costs {
            if !(0..=MAX_WAIT).contains(&value) {
                return Err(format!("wait state {} = {} outside 0..={}", name, value, MAX_WAIT));
            }
        }
        if self.high_ram_write_align == 0 || (self.high_ram_write_align as u32).count_ones() != 1 {
            return Err(format!(
                "high_ram_write_align = {} is not a power of two",
                self.high_ram_write_align
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub region: Region,
    pub cache_mode: CacheMode,
    pub cart_type: CartType,
    /// Master clock to CPU clock divider (61 for 320/640 pixel modes, 65 for
    /// 352/704).
    pub clock_div: u32,
    pub wait_states: WaitStates,
    pub nv_dir: PathBuf,
    pub nv_name: String,
    /// Run every frame through the debug-hook step loop.
    pub debug_hooks: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region: Region::default(),
            cache_mode: CacheMode::default(),
            cart_type: CartType::default(),
            clock_div: 61,
            wait_states: WaitStates::default(),
            nv_dir: PathBuf::from("."),
            nv_name: "saturn".to_string(),
            debug_hooks: false,
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.clock_div != 61 && self.clock_div != 65 {
            return Err(format!("clock_div must be 61 or 65, got {}", self.clock_div));
        }
        if self.nv_name.is_empty() {
            return Err("nv_name must not be empty".to_string());
        }
        self.wait_states.validate()
    }

    pub fn master_clock(&self) -> i64 {
        self.region.master_clock()
    }

    /// CPU cycles in one video frame.
    pub fn cycles_per_frame(&self) -> i32 {
        let div = self.clock_div as i64;
        let cycles = if self.region.is_pal() {
            self.master_clock() / (div * 50)
        } else {
            self.master_clock() * 1001 / (div * 60_000)
        };
        cycles as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        let config = SessionConfig::from_json("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_wait_states() {
        let config = SessionConfig::from_json(
            r#"{"region":"Europe","cache_mode":"Full","wait_states":{"low_ram":9}}"#,
        )
        .unwrap();
        assert!(config.region.is_pal());
        assert!(config.cache_mode.emulates_icache());
        assert_eq!(config.wait_states.low_ram, 9);
        assert_eq!(config.wait_states.bios, 8, "unspecified fields keep defaults");
    }

    #[test]
    fn test_wait_state_validation() {
        let mut ws = WaitStates::default();
        assert!(ws.validate().is_ok());
        ws.high_ram_write_align = 3;
        assert!(ws.validate().is_err());
        ws.high_ram_write_align = 4;
        ws.bios = 65;
        assert!(ws.validate().is_err());
        ws.bios = -1;
        assert!(ws.validate().is_err());
    }

    #[test]
    fn test_clock_div_validation() {
        let config = SessionConfig {
            clock_div: 60,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cycles_per_frame() {
        let ntsc = SessionConfig::default();
        assert_eq!(ntsc.cycles_per_frame(), 477_750);
        let pal = SessionConfig {
            region: Region::Europe,
            ..SessionConfig::default()
        };
        assert_eq!(pal.cycles_per_frame(), 568_750);
    }
}
