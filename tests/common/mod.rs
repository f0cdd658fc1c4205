// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ppm_tools::codec::{LineTiming, Pulse};
use ppm_tools::error::{Error, Result};
use ppm_tools::hex::HexImage;
use ppm_tools::line::{LineShared, PpmLine, PulseChannel};
use ppm_tools::sim::{SimChannel, SimHandle};

/// Formats one Intel-HEX data record with a valid checksum.
pub fn record(addr: u16, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
    bytes.extend_from_slice(data);
    let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{hex}\n")
}

/// Builds a HEX image from (address, bytes) chunks.
pub fn image(chunks: &[(u16, &[u8])]) -> HexImage {
    let mut text = String::new();
    for (addr, data) in chunks {
        text.push_str(&record(*addr, data));
    }
    text.push_str(":00000001FF\n");
    text.parse().unwrap()
}

/// A line driven by a simulated part, plus the handle to inspect it.
pub fn sim_line(project_id: u16) -> (PpmLine<SimChannel>, SimHandle) {
    let channel = SimChannel::new(project_id);
    let handle = channel.handle();
    (PpmLine::new(channel).unwrap(), handle)
}

/// Wraps a channel and injects transmit faults: the first `skip`
/// transmissions pass through, the next `fail` return a line error
/// without reaching the wire.
pub struct FlakyChannel<C: PulseChannel> {
    inner: C,
    skip: u32,
    fail: u32,
}

impl<C: PulseChannel> FlakyChannel<C> {
    pub fn new(inner: C, skip: u32, fail: u32) -> Self {
        FlakyChannel { inner, skip, fail }
    }
}

impl<C: PulseChannel> PulseChannel for FlakyChannel<C> {
    fn connect(&mut self, events: Arc<LineShared>) {
        self.inner.connect(events);
    }

    fn set_timing(&mut self, timing: &LineTiming) -> Result<()> {
        self.inner.set_timing(timing)
    }

    fn transmit(&mut self, pulses: &[Pulse], repeat: u32) -> Result<()> {
        if self.skip > 0 {
            self.skip -= 1;
        } else if self.fail > 0 {
            self.fail -= 1;
            return Err(Error::Line("injected transmit fault".to_string()));
        }
        self.inner.transmit(pulses, repeat)
    }
}

/// A line whose first `skip` transmissions work and next `fail` fault,
/// plus the handle to the simulated part behind it.
pub fn flaky_sim_line(
    project_id: u16,
    skip: u32,
    fail: u32,
) -> (PpmLine<FlakyChannel<SimChannel>>, SimHandle) {
    let channel = SimChannel::new(project_id);
    let handle = channel.handle();
    let line = PpmLine::new(FlakyChannel::new(channel, skip, fail)).unwrap();
    (line, handle)
}
