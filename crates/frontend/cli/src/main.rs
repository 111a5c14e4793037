use anyhow::{Context, Result};
use clap::Parser;
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::System;
use emu_saturn::{Saturn, SessionConfig};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Path to the 512KB BIOS image
    #[arg(required_unless_present = "dump_config")]
    bios: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Session configuration as JSON (region, cache mode, wait states, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a snapshot here after the last frame
    #[arg(long)]
    save: Option<PathBuf>,

    /// Apply this snapshot before running
    #[arg(long)]
    load: Option<PathBuf>,

    /// Core log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Send core logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the consumed cycles of every frame
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Print the effective session configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    dump_config: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let Some(level) = LogLevel::from_str(&args.log_level) else {
        anyhow::bail!("Unknown log level: {}", args.log_level);
    };
    LogConfig::global().set_global_level(level);
    if let Some(path) = &args.log_file {
        LogConfig::global()
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }

    let config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            SessionConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    log::info!(
        "{:?}, {} cycles per frame, cache mode: {}",
        config.region,
        config.cycles_per_frame(),
        config.cache_mode.describe()
    );

    let mut saturn = Saturn::new(config)?;
    let Some(bios_path) = &args.bios else {
        anyhow::bail!("No BIOS image given");
    };
    let bios = fs::read(bios_path).with_context(|| format!("reading BIOS {}", bios_path.display()))?;
    saturn.mount("BIOS", &bios)?;

    if let Some(path) = &args.load {
        let data = fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        saturn.apply_snapshot(&data)?;
        log::info!("Loaded snapshot {}", path.display());
    }

    let mut total: u64 = 0;
    for frame in 1..=args.frames {
        let cycles = saturn.run_frame()?;
        total += cycles as u64;
        if args.verbose {
            println!("Frame {}: {} cycles", frame, cycles);
        }
    }
    println!("Ran {} frames, {} CPU cycles", args.frames, total);

    if let Some(path) = &args.save {
        fs::write(path, saturn.take_snapshot()?).with_context(|| format!("writing snapshot {}", path.display()))?;
        log::info!("Saved snapshot {}", path.display());
    }

    saturn.flush_nv()?;
    LogConfig::global().clear_log_file();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_config_needs_no_bios() {
        let args = Args::try_parse_from(["emu_cli", "--dump-config"]).unwrap();
        assert!(args.dump_config);
        assert!(args.bios.is_none());
        assert!(Args::try_parse_from(["emu_cli"]).is_err());
    }

    #[test]
    fn test_dumped_config_reads_back() {
        let config = SessionConfig::default();
        let text = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(SessionConfig::from_json(&text).unwrap(), config);
    }
}
