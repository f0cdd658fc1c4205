// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! This crate contains a host-side bootloader for a family of automotive
//! mixed-signal microcontrollers programmed over a proprietary single-wire,
//! pulse-position-modulated (PPM) protocol. It programs and verifies the
//! flash, flash-CS and EEPROM regions of a connected chip from an Intel-HEX
//! image, using the per-chip memory and timing description from the
//! built-in catalog.
//!
//! The stack has four layers, leaves first:
//!
//! - [`codec`] encodes frames into pulse-width symbols and back, and derives
//!   line timing from a requested bitrate;
//! - [`line`] owns the physical pulse channel, half-duplex switching and the
//!   bounded receive queue;
//! - [`session`] runs the session-frame/page-frame/acknowledge protocol with
//!   per-page retries and per-session timeouts;
//! - [`bootloader`] enters programming mode, identifies the chip, and maps
//!   HEX-image regions onto programming and verification sessions.
//!
//! The physical layer is abstracted behind [`line::PulseChannel`]; a
//! software target implementation lives in [`sim`] for bench testing
//! without silicon. A companion binary drives all of this from the command
//! line.

pub mod bootloader;
pub mod chip;
pub mod codec;
pub mod crc;
pub mod error;
pub mod hex;
pub mod line;
pub mod session;
pub mod sim;

pub use bootloader::{Action, Bootloader, Memory, NoPower, PowerControl};
pub use error::{describe, Error, Result};
pub use hex::HexImage;
