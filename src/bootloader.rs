// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! The bootloader orchestrator.
//!
//! Drives a complete programming or verification action: enter programming
//! mode, identify the connected chip, map the HEX image onto the chip's
//! memories, run the programming/CRC sessions with timeouts shaped by the
//! chip's erase and write timings, and always reset the chip out of
//! session mode on the way out.
//!
//! This is the only layer aware of HEX images, chips and memory semantics;
//! everything below it moves opaque frame words.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::chip::{self, Chip, MemoryLayout, PpmLoader};
use crate::error::{Error, Result};
use crate::hex::HexImage;
use crate::line::{PpmLine, PulseChannel};
use crate::session::{words_from_le_bytes, SessionConfig, SessionEngine};

/// Memory region an action addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    Flash,
    FlashCs,
    Nvram,
}

/// What to do with the addressed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Program,
    Verify,
}

/// Host callout controlling the target's supply.
///
/// The default [`NoPower`] implementation reports an unpowered chip and
/// ignores switch requests, for setups where the user cycles power by
/// hand.
pub trait PowerControl {
    fn set_power(&mut self, enable: bool);
    fn is_powered(&self) -> bool;
}

/// Power callout for targets the host cannot switch.
#[derive(Debug, Default)]
pub struct NoPower;

impl PowerControl for NoPower {
    fn set_power(&mut self, _enable: bool) {}

    fn is_powered(&self) -> bool {
        false
    }
}

/// Pattern time when the host cycles the target supply [µs].
const PATTERN_TIME_HOST_POWER_US: u32 = 50_000;
/// Pattern time when the user cycles power manually [µs].
const PATTERN_TIME_MANUAL_POWER_US: u32 = 100_000;

/// `ceil(ms · 1.25)`, the safety margin applied to chip-reported timings.
fn with_margin(ms: u32) -> u16 {
    ((ms * 5).div_ceil(4)) as u16
}

/// `ceil(len · 6.25e-5)` ms, the slave's CRC computation time over `len`
/// bytes.
fn crc_time(len: u32) -> u16 {
    len.div_ceil(16_000) as u16
}

fn image_range(hex: &HexImage) -> Result<(u32, u32)> {
    match (hex.min_address(), hex.max_address()) {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(Error::MissingData),
    }
}

fn demand_overlap(hex: &HexImage, start: u32, end: u32) -> Result<()> {
    let (hex_min, hex_max) = image_range(hex)?;
    if hex_min > end || hex_max < start {
        return Err(Error::MissingData);
    }
    Ok(())
}

/// Length to program into a partially writeable memory: from the region
/// start up to the last image byte, clamped to the writeable window and
/// rounded up to a full page.
fn clamped_page_aligned_len(hex: &HexImage, memory: &MemoryLayout, limit: u32) -> Result<u32> {
    let (_, hex_max) = image_range(hex)?;
    let mut len = hex_max.saturating_sub(memory.start) + 1;
    if len > limit {
        len = limit;
    }
    if len % memory.page != 0 {
        len = len - len % memory.page + memory.page;
    }
    Ok(len)
}

/// A PPM bootloader bound to one line.
pub struct Bootloader<C: PulseChannel, P: PowerControl = NoPower> {
    line: PpmLine<C>,
    power: P,
}

impl<C: PulseChannel> Bootloader<C, NoPower> {
    /// Builds a bootloader without host power control.
    pub fn new(channel: C) -> Result<Self> {
        Self::with_power(channel, NoPower)
    }
}

impl<C: PulseChannel, P: PowerControl> Bootloader<C, P> {
    /// Builds a bootloader with a host power-switch callout.
    pub fn with_power(channel: C, power: P) -> Result<Self> {
        Ok(Bootloader {
            line: PpmLine::new(channel)?,
            power,
        })
    }

    /// Performs a full programming or verification action on the connected
    /// chip.
    ///
    /// Whatever the outcome, the chip is reset out of session mode before
    /// this returns, and host-controlled power is switched off.
    pub fn do_action(
        &mut self,
        manual_power: bool,
        broadcast: bool,
        bitrate: u32,
        memory: Memory,
        action: Action,
        hex: &HexImage,
    ) -> Result<()> {
        let pattern_time = if manual_power {
            PATTERN_TIME_MANUAL_POWER_US
        } else {
            if self.power.is_powered() {
                self.power.set_power(false);
                thread::sleep(Duration::from_millis(100));
            }
            PATTERN_TIME_HOST_POWER_US
        };

        let entry = self.enter_programming_mode(broadcast, bitrate, pattern_time);
        let result = match entry {
            Ok(chip) => self.run_action(chip, broadcast, memory, action, hex),
            Err(err) => Err(err),
        };

        if let Err(err) = self.exit_programming_mode(broadcast) {
            debug!("chip reset on exit failed: {err}");
        }
        if !manual_power {
            self.power.set_power(false);
        }

        result
    }

    fn enter_programming_mode(
        &mut self,
        broadcast: bool,
        bitrate: u32,
        pattern_time_us: u32,
    ) -> Result<&'static Chip> {
        info!("entering programming mode");

        let line = &mut self.line;
        let power = &mut self.power;
        line.send_enter_pattern(pattern_time_us, || power.set_power(true))
            .map_err(|_| Error::EnterPpm)?;

        thread::sleep(Duration::from_millis(5));

        line.set_bitrate(bitrate).map_err(|_| Error::SetBitrate)?;
        line.send_calibration().map_err(|_| Error::Calibration)?;

        let mut unlock_cfg = SessionConfig::UNLOCK;
        unlock_cfg.request_ack = !broadcast;
        let project_id = SessionEngine::new(line)
            .unlock(&unlock_cfg)
            .map_err(|_| Error::Unlock)?;
        info!("unlocked, project id {project_id:#06x}");

        let chip = chip::by_project_id(project_id).ok_or(Error::ChipNotSupported)?;
        if chip.ppm.is_none() {
            return Err(Error::ChipNotSupported);
        }
        info!("connected chip: {}", chip.name);
        Ok(chip)
    }

    fn exit_programming_mode(&mut self, broadcast: bool) -> Result<()> {
        let mut reset_cfg = SessionConfig::CHIP_RESET;
        reset_cfg.request_ack = !broadcast;
        SessionEngine::new(&mut self.line)
            .chip_reset(&reset_cfg)
            .map(|_| ())
    }

    fn run_action(
        &mut self,
        chip: &'static Chip,
        broadcast: bool,
        memory: Memory,
        action: Action,
        hex: &HexImage,
    ) -> Result<()> {
        let loader = chip.ppm.ok_or(Error::ChipNotSupported)?;
        match (memory, action) {
            (Memory::Flash, Action::Program) => self.program_flash(chip, &loader, broadcast, hex),
            (Memory::Flash, Action::Verify) => self.verify_flash(chip, &loader, hex),
            (Memory::FlashCs, _) if !loader.flash_cs_programming => {
                Err(Error::ActionNotSupported)
            }
            (Memory::FlashCs, Action::Program) => {
                self.program_flash_cs(chip, &loader, broadcast, hex)
            }
            (Memory::FlashCs, Action::Verify) => self.verify_flash_cs(chip, hex),
            (Memory::Nvram, Action::Program) => self.program_eeprom(chip, &loader, broadcast, hex),
            (Memory::Nvram, Action::Verify) if loader.eeprom_verification => {
                self.verify_eeprom(chip, hex)
            }
            (Memory::Nvram, Action::Verify) => Err(Error::ActionNotSupported),
        }
    }

    /// Runs the programming-keys session when the chip requires keys;
    /// chips without key material skip straight to programming.
    fn prog_keys_if_needed(&mut self, loader: &PpmLoader, broadcast: bool) -> Result<()> {
        let Some(keys) = loader.prog_keys else {
            return Ok(());
        };
        let mut cfg = SessionConfig::PROG_KEYS;
        cfg.request_ack = !broadcast;
        SessionEngine::new(&mut self.line)
            .prog_keys(&cfg, keys)
            .map_err(|_| Error::ProgrammingFailed)
    }

    fn program_flash(
        &mut self,
        chip: &'static Chip,
        loader: &PpmLoader,
        broadcast: bool,
        hex: &HexImage,
    ) -> Result<()> {
        self.prog_keys_if_needed(loader, broadcast)?;

        let memory = &chip.flash;
        demand_overlap(hex, memory.start, memory.end())?;

        let mut content = vec![0u8; memory.length as usize];
        hex.fill(memory.start, &mut content);

        let mut cfg = SessionConfig::FLASH_PROG;
        cfg.request_ack = !broadcast;
        cfg.page_size = memory.page_words();
        cfg.flash_crc = Some(loader.flash_crc);
        cfg.page0_ack_timeout = with_margin(memory.length / memory.erase_unit * memory.erase_time);
        cfg.page_n_ack_timeout = with_margin(memory.write_time);
        cfg.session_ack_timeout = cfg.page_n_ack_timeout + crc_time(memory.length);

        info!("programming flash, {} bytes", content.len());
        SessionEngine::new(&mut self.line)
            .flash_program(&cfg, &content)
            .map_err(|_| Error::ProgrammingFailed)
    }

    fn verify_flash(&mut self, chip: &'static Chip, loader: &PpmLoader, hex: &HexImage) -> Result<()> {
        let memory = &chip.flash;
        if memory.length <= 4 {
            return Err(Error::MissingData);
        }
        demand_overlap(hex, memory.start, memory.end())?;

        let mut content = vec![0u8; memory.length as usize];
        hex.fill(memory.start, &mut content);
        let expected = (loader.flash_crc)(&words_from_le_bytes(&content));

        let mut cfg = SessionConfig::FLASH_CRC;
        cfg.page_size = memory.page_words();
        cfg.session_ack_timeout = crc_time(memory.length);

        info!("verifying flash against image crc {expected:#08x}");
        let chip_crc = SessionEngine::new(&mut self.line)
            .flash_crc(&cfg, memory.length as usize)
            .map_err(|_| Error::VerifyFailed)?;
        if chip_crc != expected {
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    fn program_flash_cs(
        &mut self,
        chip: &'static Chip,
        loader: &PpmLoader,
        broadcast: bool,
        hex: &HexImage,
    ) -> Result<()> {
        self.prog_keys_if_needed(loader, broadcast)?;

        let memory = &chip.flash_cs;
        demand_overlap(hex, memory.start, memory.writeable_end())?;
        let mem_len = clamped_page_aligned_len(hex, memory, memory.writeable)?;

        let mut content = vec![0u8; mem_len as usize];
        hex.fill(memory.start, &mut content);

        let mut cfg = SessionConfig::FLASH_CS_PROG;
        cfg.request_ack = !broadcast;
        cfg.page_size = memory.page_words();
        cfg.page0_ack_timeout = with_margin(mem_len / memory.page * memory.erase_time);
        cfg.page_n_ack_timeout = with_margin(memory.write_time);
        cfg.session_ack_timeout = cfg.page_n_ack_timeout + crc_time(mem_len);

        info!("programming flash cs, {} bytes", content.len());
        SessionEngine::new(&mut self.line)
            .flash_cs_program(&cfg, &content)
            .map_err(|_| Error::ProgrammingFailed)
    }

    fn verify_flash_cs(&mut self, chip: &'static Chip, hex: &HexImage) -> Result<()> {
        let memory = &chip.flash_cs;
        demand_overlap(hex, memory.start, memory.end())?;
        let mem_len = clamped_page_aligned_len(hex, memory, memory.length)?;

        let mut content = vec![0u8; mem_len as usize];
        hex.fill(memory.start, &mut content);
        let expected = crate::crc::crc16(&content);

        let mut cfg = SessionConfig::FLASH_CS_CRC;
        cfg.page_size = memory.page_words();

        info!("verifying flash cs against image crc {expected:#06x}");
        let chip_crc = SessionEngine::new(&mut self.line)
            .flash_cs_crc(&cfg, mem_len as usize)
            .map_err(|_| Error::VerifyFailed)?;
        if chip_crc != expected {
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    /// Walks the writeable EEPROM window in page strides, gathering
    /// contiguous runs of image-covered pages and flushing each run as one
    /// programming session.
    fn program_eeprom(
        &mut self,
        chip: &'static Chip,
        loader: &PpmLoader,
        broadcast: bool,
        hex: &HexImage,
    ) -> Result<()> {
        self.prog_keys_if_needed(loader, broadcast)?;

        let memory = &chip.nv_memory;
        demand_overlap(hex, memory.start, memory.writeable_end())?;

        let page = memory.page;
        let mut content = vec![0u8; memory.writeable as usize];
        let mem_end = memory.writeable_end();

        let mut curr_addr = memory.start;
        while curr_addr < mem_end {
            let curr_off = curr_addr - memory.start;
            let mut curr_len: u32 = 0;
            while curr_addr < mem_end {
                if hex.count_bytes_in_range(curr_addr, page) != 0 {
                    let dst = curr_len as usize;
                    hex.fill(curr_addr, &mut content[dst..dst + page as usize]);
                    curr_len += page;
                    curr_addr += page;
                } else {
                    curr_addr += page;
                    break;
                }
            }

            if curr_len > 0 {
                let mut cfg = SessionConfig::EEPROM_PROG;
                cfg.request_ack = !broadcast;
                cfg.page_size = memory.page_words();
                cfg.page0_ack_timeout = with_margin(memory.write_time);
                cfg.page_n_ack_timeout = with_margin(memory.write_time);
                cfg.session_ack_timeout = cfg.page_n_ack_timeout;

                info!("programming eeprom run, {curr_len} bytes at offset {curr_off:#x}");
                SessionEngine::new(&mut self.line)
                    .eeprom_program(&cfg, curr_off as u16, &content[..curr_len as usize])
                    .map_err(|_| Error::ProgrammingFailed)?;
            }
        }

        Ok(())
    }

    fn verify_eeprom(&mut self, chip: &'static Chip, hex: &HexImage) -> Result<()> {
        let memory = &chip.nv_memory;
        demand_overlap(hex, memory.start, memory.end())?;

        let page = memory.page;
        let mut content = vec![0u8; memory.length as usize];
        let mem_end = memory.end();

        let mut curr_addr = memory.start;
        while curr_addr < mem_end {
            let curr_off = curr_addr - memory.start;
            let mut curr_len: u32 = 0;
            while curr_addr < mem_end {
                if hex.count_bytes_in_range(curr_addr, page) != 0 {
                    let dst = curr_len as usize;
                    hex.fill(curr_addr, &mut content[dst..dst + page as usize]);
                    curr_len += page;
                    curr_addr += page;
                } else {
                    curr_addr += page;
                    break;
                }
            }

            if curr_len > 0 {
                let expected = crate::crc::crc16(&content[..curr_len as usize]);
                let mut cfg = SessionConfig::EEPROM_CRC;
                cfg.page_size = memory.page_words();

                let chip_crc = SessionEngine::new(&mut self.line)
                    .eeprom_crc(&cfg, curr_off as u16, curr_len as usize)
                    .map_err(|_| Error::VerifyFailed)?;
                if chip_crc != expected {
                    return Err(Error::VerifyFailed);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_rounds_up() {
        assert_eq!(with_margin(80), 100);
        assert_eq!(with_margin(8), 10);
        assert_eq!(with_margin(5), 7);
        assert_eq!(with_margin(0), 0);
    }

    #[test]
    fn crc_time_rounds_up() {
        assert_eq!(crc_time(0x8000), 3);
        assert_eq!(crc_time(16_000), 1);
        assert_eq!(crc_time(1), 1);
    }
}
