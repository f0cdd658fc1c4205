// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Orchestrator behavior: full programming/verification actions against
//! the simulated part, coverage errors, capability gates and the
//! always-reset guarantee.

mod common;

use std::sync::{Arc, Mutex};

use common::image;
use ppm_tools::bootloader::{Action, Bootloader, Memory, PowerControl};
use ppm_tools::chip;
use ppm_tools::crc::crc24_bootrom;
use ppm_tools::error::Error;
use ppm_tools::sim::{self, SimChannel, SimHandle};

const BITRATE: u32 = 296_296;

fn sim_bootloader(project_id: u16) -> (Bootloader<SimChannel>, SimHandle) {
    let channel = SimChannel::new(project_id);
    let handle = channel.handle();
    (Bootloader::new(channel).unwrap(), handle)
}

#[test]
fn flash_program_then_verify_round_trips() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let hex = image(&[(0x4000, &[0x11u8; 64]), (0x4100, &[0x22u8; 32])]);

    bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Program, &hex)
        .unwrap();
    bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Verify, &hex)
        .unwrap();

    // One chip reset per action, no more.
    assert_eq!(handle.chip_resets(), 2);
    // 32 KiB in 128-byte pages.
    assert_eq!(handle.page_log().len(), 256);
}

#[test]
fn flash_verify_against_a_primed_part_matches() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let part = chip::by_project_id(0x4D32).unwrap();
    let hex = image(&[(0x4000, &[0xA5u8; 128])]);

    sim::prime_from_image(&handle, part, &hex);
    bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Verify, &hex)
        .unwrap();
    assert_eq!(handle.chip_resets(), 1);
}

#[test]
fn flash_crc_mismatch_fails_verification() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let part = chip::by_project_id(0x4D32).unwrap();
    let hex = image(&[(0x4000, &[0xA5u8; 128])]);

    let mut content = vec![0u8; part.flash.length as usize];
    hex.fill(part.flash.start, &mut content);
    let words: Vec<u16> = content
        .chunks(2)
        .map(|pair| u16::from(pair[0]) | u16::from(pair[1]) << 8)
        .collect();
    // Differs in the low byte only.
    handle.prime_flash_crc(crc24_bootrom(&words) ^ 0x01);

    let err = bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Verify, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::VerifyFailed));
    assert_eq!(handle.chip_resets(), 1);
}

#[test]
fn image_outside_the_memory_yields_missing_data_without_programming() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let hex = image(&[(0x0000, &[0xEEu8; 16])]);

    let err = bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Program, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::MissingData));
    // Entry and exit only: unlock, then chip reset.
    assert_eq!(handle.sessions_seen(), vec![0x44, 0x45]);
    assert!(handle.page_log().is_empty());
}

#[test]
fn unknown_project_id_is_rejected_but_the_chip_is_still_reset() {
    let (mut bootloader, handle) = sim_bootloader(0x0BAD);
    let hex = image(&[(0x4000, &[0x00u8; 16])]);

    let err = bootloader
        .do_action(false, false, BITRATE, Memory::Flash, Action::Program, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::ChipNotSupported));
    assert_eq!(handle.sessions_seen(), vec![0x44, 0x45]);
    assert_eq!(handle.chip_resets(), 1);
}

#[test]
fn sparse_eeprom_image_programs_one_session_per_run() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    // Pages 0 and 3 of the EEPROM (8-byte pages at 0x0800).
    let hex = image(&[(0x0800, &[0x31u8; 8]), (0x0818, &[0x42u8; 8])]);

    bootloader
        .do_action(false, false, BITRATE, Memory::Nvram, Action::Program, &hex)
        .unwrap();

    let runs: Vec<[u16; 4]> = handle
        .session_log()
        .into_iter()
        .filter(|frame| (frame[0] >> 8) & 0x7F == 0x06)
        .collect();
    assert_eq!(runs.len(), 2);
    // One page each, at page offsets 0 and 3.
    assert_eq!((runs[0][1], runs[0][2]), (1, 0));
    assert_eq!((runs[1][1], runs[1][2]), (1, 3));
}

#[test]
fn eeprom_verify_round_trips_per_run() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let part = chip::by_project_id(0x4D32).unwrap();
    let hex = image(&[(0x0800, &[0x31u8; 8]), (0x0818, &[0x42u8; 8])]);

    sim::prime_from_image(&handle, part, &hex);
    bootloader
        .do_action(false, false, BITRATE, Memory::Nvram, Action::Verify, &hex)
        .unwrap();
    assert_eq!(handle.chip_resets(), 1);
}

#[test]
fn flash_cs_program_then_verify_round_trips() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let hex = image(&[(0x1000, &[0x77u8; 64])]);

    bootloader
        .do_action(false, false, BITRATE, Memory::FlashCs, Action::Program, &hex)
        .unwrap();
    bootloader
        .do_action(false, false, BITRATE, Memory::FlashCs, Action::Verify, &hex)
        .unwrap();
    assert_eq!(handle.chip_resets(), 2);
}

#[test]
fn keyed_chips_get_a_prog_keys_session_first() {
    let (mut bootloader, handle) = sim_bootloader(0x3A10);
    let hex = image(&[(0x0800, &[0x13u8; 8])]);

    bootloader
        .do_action(false, false, BITRATE, Memory::Nvram, Action::Program, &hex)
        .unwrap();
    assert_eq!(handle.sessions_seen(), vec![0x44, 0x03, 0x06, 0x45]);
}

#[test]
fn capability_gates_reject_unsupported_actions() {
    // ganymede-kf has no flash-CS programming session.
    let (mut bootloader, handle) = sim_bootloader(0x3A11);
    let hex = image(&[(0x1000, &[0x00u8; 16])]);
    let err = bootloader
        .do_action(false, false, BITRATE, Memory::FlashCs, Action::Program, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::ActionNotSupported));
    assert_eq!(handle.chip_resets(), 1);

    // ganymede-xfe cannot verify its EEPROM.
    let (mut bootloader, handle) = sim_bootloader(0x3A10);
    let hex = image(&[(0x0800, &[0x00u8; 8])]);
    let err = bootloader
        .do_action(false, false, BITRATE, Memory::Nvram, Action::Verify, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::ActionNotSupported));
    assert_eq!(handle.chip_resets(), 1);
}

#[test]
fn broadcast_mode_cannot_identify_the_chip() {
    let (mut bootloader, handle) = sim_bootloader(0x4D32);
    let hex = image(&[(0x4000, &[0x55u8; 16])]);

    let err = bootloader
        .do_action(false, true, BITRATE, Memory::Flash, Action::Program, &hex)
        .unwrap_err();
    assert!(matches!(err, Error::ChipNotSupported));
    // The ack-less chip reset still went out.
    assert_eq!(handle.chip_resets(), 1);
}

#[derive(Clone, Default)]
struct RecordingPower {
    log: Arc<Mutex<Vec<bool>>>,
    powered: bool,
}

impl PowerControl for RecordingPower {
    fn set_power(&mut self, enable: bool) {
        self.log.lock().unwrap().push(enable);
        self.powered = enable;
    }

    fn is_powered(&self) -> bool {
        self.powered
    }
}

#[test]
fn host_power_is_cycled_around_the_action() {
    let power = RecordingPower {
        powered: true,
        ..RecordingPower::default()
    };
    let log = Arc::clone(&power.log);

    let channel = SimChannel::new(0x4D32);
    let mut bootloader = Bootloader::with_power(channel, power).unwrap();
    let hex = image(&[(0x0800, &[0x01u8; 8])]);
    bootloader
        .do_action(false, false, BITRATE, Memory::Nvram, Action::Program, &hex)
        .unwrap();

    // Already-powered chip is switched off first, on while the enter
    // pattern is on the wire, and off again at the end.
    assert_eq!(*log.lock().unwrap(), vec![false, true, false]);
}

#[test]
fn manual_power_is_left_alone() {
    let power = RecordingPower::default();
    let log = Arc::clone(&power.log);

    let channel = SimChannel::new(0x4D32);
    let mut bootloader = Bootloader::with_power(channel, power).unwrap();
    let hex = image(&[(0x0800, &[0x01u8; 8])]);
    bootloader
        .do_action(true, false, BITRATE, Memory::Nvram, Action::Program, &hex)
        .unwrap();

    // The enter-pattern callout still fires, but nothing is switched off.
    assert_eq!(*log.lock().unwrap(), vec![true]);
}
