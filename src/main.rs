// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! # ppm-tools
//!
//! This CLI provides tools for working with PPM-programmed automotive
//! microcontrollers: inspecting the chip catalog, checking how an Intel-HEX
//! image maps onto a chip's memories, and exercising the full programming
//! stack against the built-in software target.
//!
//! Commands supported: chips, check, simulate

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};

use std::num;
use std::path::PathBuf;
use std::process::ExitCode;
use std::result;
use std::time::Duration;

use ppm_tools::bootloader::{Action, Bootloader, Memory};
use ppm_tools::chip;
use ppm_tools::crc;
use ppm_tools::error::describe;
use ppm_tools::hex::HexImage;
use ppm_tools::sim::{self, SimChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MemoryArg {
    Flash,
    FlashCs,
    Nvram,
}

impl From<MemoryArg> for Memory {
    fn from(memory: MemoryArg) -> Self {
        match memory {
            MemoryArg::Flash => Memory::Flash,
            MemoryArg::FlashCs => Memory::FlashCs,
            MemoryArg::Nvram => Memory::Nvram,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActionArg {
    Program,
    Verify,
}

impl From<ActionArg> for Action {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Program => Action::Program,
            ActionArg::Verify => Action::Verify,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the chips in the catalog.
    Chips,
    /// Check how a HEX image maps onto a chip memory, offline.
    Check {
        #[arg(short, long, value_parser = parse_maybe_hex16)]
        /// Project id of the target chip.
        chip: u16,
        #[arg(short, long, value_enum, default_value_t = MemoryArg::Flash)]
        /// The memory region to check against.
        memory: MemoryArg,
        /// The HEX image to check.
        hexfile: PathBuf,
    },
    /// Run a full action against the built-in software target.
    Simulate {
        #[arg(short, long, value_parser = parse_maybe_hex16)]
        /// Project id the simulated chip reports.
        chip: u16,
        #[arg(short, long, value_enum, default_value_t = MemoryArg::Flash)]
        /// The memory region to act on.
        memory: MemoryArg,
        #[arg(short, long, value_enum, default_value_t = ActionArg::Program)]
        /// The action to perform.
        action: ActionArg,
        #[arg(short, long, default_value_t = 296_296)]
        /// The average bitrate to run the session at.
        bitrate: u32,
        #[arg(long)]
        /// Ack-less broadcast mode.
        broadcast: bool,
        #[arg(long)]
        /// Assume the user cycles target power by hand.
        manual_power: bool,
        /// The HEX image to act with.
        hexfile: PathBuf,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    /// The task to perform.
    command: Commands,
    #[command(flatten)]
    /// The level of output verbosity.
    verbose: clap_verbosity_flag::Verbosity,
}

fn parse_maybe_hex16(arg: &str) -> result::Result<u16, num::ParseIntError> {
    if let Some(hex) = arg.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        arg.parse::<u16>()
    }
}

fn words_from_le(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from(pair[0]) | (u16::from(*pair.get(1).unwrap_or(&0)) << 8))
        .collect()
}

fn print_chips() {
    println!(
        "{:<14} {:>10} {:>8} {:>9} {:>7}  capabilities",
        "name", "project id", "flash", "flash-cs", "eeprom"
    );
    for chip in chip::catalog() {
        let Some(loader) = chip.ppm else {
            continue;
        };
        let mut caps = vec!["flash"];
        if loader.flash_cs_programming {
            caps.push("flash-cs");
        }
        caps.push("eeprom-prog");
        if loader.eeprom_verification {
            caps.push("eeprom-verify");
        }
        if loader.prog_keys.is_some() {
            caps.push("keys");
        }
        println!(
            "{:<14} {:>#10x} {:>7}K {:>8}B {:>6}B  {}",
            chip.name,
            chip.project_id,
            chip.flash.length / 1024,
            chip.flash_cs.length,
            chip.nv_memory.length,
            caps.join(",")
        );
    }
}

fn run_check(chip_id: u16, memory: MemoryArg, path: &PathBuf) -> i32 {
    let hex = match HexImage::load(path) {
        Ok(hex) => hex,
        Err(err) => {
            error!("{err}");
            return err.code();
        }
    };
    let Some(chip) = chip::by_project_id(chip_id) else {
        error!("project id {chip_id:#06x} is not in the catalog");
        return -20;
    };
    let Some(loader) = chip.ppm else {
        error!("{} has no PPM bootloader", chip.name);
        return -20;
    };

    let region = match memory {
        MemoryArg::Flash => &chip.flash,
        MemoryArg::FlashCs => &chip.flash_cs,
        MemoryArg::Nvram => &chip.nv_memory,
    };

    let (Some(hex_min), Some(hex_max)) = (hex.min_address(), hex.max_address()) else {
        error!("{}", describe(-23));
        return -23;
    };
    println!(
        "image covers {hex_min:#06x}..{hex_max:#06x}, memory is {:#06x}..{:#06x}",
        region.start,
        region.end()
    );
    if hex_min > region.end() || hex_max < region.start {
        error!("{}", describe(-23));
        return -23;
    }

    let pages = region.length / region.page;
    let progress = ProgressBar::new(u64::from(pages));
    progress
        .set_style(ProgressStyle::with_template("{bar:^20.red/white.bold} {percent:>3}%").unwrap());
    let mut covered_pages = 0u32;
    let mut covered_bytes = 0usize;
    for page in 0..pages {
        let addr = region.start + page * region.page;
        let count = hex.count_bytes_in_range(addr, region.page);
        if count != 0 {
            covered_pages += 1;
            covered_bytes += count;
        }
        progress.set_position(u64::from(page + 1));
    }
    progress.finish_and_clear();
    println!(
        "{covered_bytes} image bytes in {covered_pages} of {pages} pages ({}B each)",
        region.page
    );

    let mut content = vec![0u8; region.length as usize];
    hex.fill(region.start, &mut content);
    match memory {
        MemoryArg::Flash => {
            let image_crc = (loader.flash_crc)(&words_from_le(&content));
            println!("flash crc the programming session would carry: {image_crc:#08x}");
        }
        MemoryArg::FlashCs | MemoryArg::Nvram => {
            println!(
                "crc-16 over the gap-filled region: {:#06x}",
                crc::crc16(&content)
            );
        }
    }

    0
}

fn run_simulate(
    chip_id: u16,
    memory: MemoryArg,
    action: ActionArg,
    bitrate: u32,
    broadcast: bool,
    manual_power: bool,
    path: &PathBuf,
) -> i32 {
    let hex = match HexImage::load(path) {
        Ok(hex) => hex,
        Err(err) => {
            error!("{err}");
            return err.code();
        }
    };

    let channel = SimChannel::new(chip_id);
    let handle = channel.handle();
    if action == ActionArg::Verify {
        // A verify-only run expects a previously programmed part.
        if let Some(chip) = chip::by_project_id(chip_id) {
            sim::prime_from_image(&handle, chip, &hex);
        }
    }

    let mut bootloader = match Bootloader::new(channel) {
        Ok(bootloader) => bootloader,
        Err(err) => {
            error!("{err}");
            return err.code();
        }
    };

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("talking to the simulated target...");
    let result = bootloader.do_action(
        manual_power,
        broadcast,
        bitrate,
        memory.into(),
        action.into(),
        &hex,
    );
    spinner.finish_and_clear();

    info!(
        "simulated target saw sessions {:02x?}, {} chip reset(s)",
        handle.sessions_seen(),
        handle.chip_resets()
    );

    match result {
        Ok(()) => {
            println!("{}", describe(0));
            0
        }
        Err(err) => {
            error!("{err}");
            err.code()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    info!(
        "ppm-tools version: {}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR")
    );

    let code = match &cli.command {
        Commands::Chips => {
            print_chips();
            0
        }
        Commands::Check {
            chip,
            memory,
            hexfile,
        } => run_check(*chip, *memory, hexfile),
        Commands::Simulate {
            chip,
            memory,
            action,
            bitrate,
            broadcast,
            manual_power,
            hexfile,
        } => run_simulate(
            *chip,
            *memory,
            *action,
            *bitrate,
            *broadcast,
            *manual_power,
            hexfile,
        ),
    };

    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
