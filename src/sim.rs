// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! A software PPM target.
//!
//! [`SimChannel`] implements [`PulseChannel`] with no hardware behind it:
//! every transmitted frame is decoded with the crate codec and answered the
//! way a well-behaved slave bootrom answers, including the session-ack
//! word-0 erratum. It backs the CLI `simulate` subcommand and the
//! integration tests, and doubles as a worked example of the completion
//! contract a real backend has to honor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::chip::Chip;
use crate::codec::{
    decode_symbols, encode_frame, words_to_bytes, FrameTag, LineTiming, Pulse, RawFrame,
};
use crate::crc;
use crate::error::{Error, Result};
use crate::hex::HexImage;
use crate::line::{LineShared, PulseChannel, SymbolBuffer};
use crate::session::words_from_le_bytes;

const ID_PROG_KEYS: u8 = 0x03;
const ID_FLASH_PROG: u8 = 0x04;
const ID_EEPROM_PROG: u8 = 0x06;
const ID_FLASH_CS_PROG: u8 = 0x07;
const ID_RAM_PROG: u8 = 0x08;
const ID_FLASH_CRC: u8 = 0x43;
const ID_UNLOCK: u8 = 0x44;
const ID_CHIP_RESET: u8 = 0x45;
const ID_EEPROM_CRC: u8 = 0x47;
const ID_FLASH_CS_CRC: u8 = 0x48;

struct Reply {
    tag: FrameTag,
    words: Vec<u16>,
}

struct OpenSession {
    id: u8,
    request_ack: bool,
    page_size: u8,
    page_count: u16,
    offset: u16,
    checksum: u16,
    pages_done: u16,
}

#[derive(Default)]
struct SimState {
    project_id: u16,
    open: Option<OpenSession>,
    flash_crc: Option<u32>,
    flash_cs_crc: Option<u16>,
    eeprom_crcs: HashMap<u16, u16>,
    session_log: Vec<[u16; 4]>,
    page_log: Vec<(u8, Vec<u16>)>,
    corrupt_page_acks: u32,
    corrupt_session_acks: u32,
}

impl SimState {
    fn session_ack(&mut self, open: &OpenSession) -> Reply {
        let (word2, word3) = match open.id {
            ID_UNLOCK | ID_CHIP_RESET => (0, self.project_id),
            ID_PROG_KEYS => (0xBEBE, 0xBEBE),
            ID_FLASH_PROG => (open.offset, open.checksum),
            ID_EEPROM_PROG | ID_FLASH_CS_PROG => (0, open.checksum),
            ID_FLASH_CRC => {
                let value = self.flash_crc.unwrap_or(0);
                (((value >> 16) & 0xFF) as u16, value as u16)
            }
            ID_EEPROM_CRC => (0, self.eeprom_crcs.get(&open.offset).copied().unwrap_or(0)),
            ID_FLASH_CS_CRC => (0, self.flash_cs_crc.unwrap_or(0)),
            _ => (0, 0),
        };
        let mut page_count = open.page_count;
        if self.corrupt_session_acks > 0 {
            self.corrupt_session_acks -= 1;
            page_count ^= 0x0001;
        }
        Reply {
            tag: FrameTag::Session,
            words: vec![
                // Word 0 reads one high on real silicon.
                ((u16::from(open.id) << 8) | u16::from(open.page_size)).wrapping_add(1),
                page_count,
                word2,
                word3,
            ],
        }
    }

    /// Records what a completed programming session leaves in the part, so
    /// a later CRC read-back answers consistently.
    fn record_programming(&mut self, open: &OpenSession) {
        match open.id {
            ID_FLASH_PROG => {
                self.flash_crc =
                    Some(u32::from(open.offset & 0xFF) << 16 | u32::from(open.checksum));
            }
            ID_EEPROM_PROG => {
                self.eeprom_crcs.insert(open.offset, open.checksum);
            }
            ID_FLASH_CS_PROG => {
                self.flash_cs_crc = Some(open.checksum);
            }
            _ => {}
        }
    }

    fn handle_session_frame(&mut self, words: &[u16]) -> Vec<Reply> {
        if words.len() < 4 {
            return Vec::new();
        }
        let command = (words[0] >> 8) as u8;
        let open = OpenSession {
            id: command & 0x7F,
            request_ack: command & 0x80 != 0,
            page_size: words[0] as u8,
            page_count: words[1],
            offset: words[2],
            checksum: words[3],
            pages_done: 0,
        };
        debug!(
            "sim: session {:#04x}, {} pages announced",
            open.id, open.page_count
        );
        self.session_log
            .push([words[0], words[1], words[2], words[3]]);

        // Only the programming sessions move pages; the CRC read-backs
        // announce a length without any page payload.
        let expects_pages = matches!(
            open.id,
            ID_PROG_KEYS | ID_FLASH_PROG | ID_EEPROM_PROG | ID_FLASH_CS_PROG | ID_RAM_PROG
        ) && open.page_count > 0;

        let mut replies = Vec::new();
        if !expects_pages {
            if open.request_ack {
                replies.push(self.session_ack(&open));
            }
            self.open = None;
        } else {
            self.open = Some(open);
        }
        replies
    }

    fn handle_page_frame(&mut self, words: &[u16]) -> Vec<Reply> {
        let Some(mut open) = self.open.take() else {
            return Vec::new();
        };
        let Some((header, data)) = words.split_first() else {
            self.open = Some(open);
            return Vec::new();
        };

        let sequence = (header >> 8) as u8;
        let checksum = (crc::page_checksum(data) & 0xFF) as u8;
        self.page_log.push((sequence, data.to_vec()));

        // A corrupted ack models a page mangled in transit: the slave
        // rejects it and waits for the retransmission.
        if self.corrupt_page_acks > 0 {
            self.corrupt_page_acks -= 1;
            let replies = if open.request_ack {
                let ack = (u16::from(sequence) << 8 | u16::from(checksum)) ^ 0x0001;
                vec![Reply {
                    tag: FrameTag::Page,
                    words: vec![ack],
                }]
            } else {
                Vec::new()
            };
            self.open = Some(open);
            return replies;
        }

        open.pages_done = open.pages_done.max(u16::from(sequence) + 1);

        let mut replies = Vec::new();
        if open.request_ack {
            replies.push(Reply {
                tag: FrameTag::Page,
                words: vec![u16::from(sequence) << 8 | u16::from(checksum)],
            });
        }

        if open.pages_done >= open.page_count {
            self.record_programming(&open);
            if open.request_ack {
                replies.push(self.session_ack(&open));
            }
            self.open = None;
        } else {
            self.open = Some(open);
        }
        replies
    }

    fn handle_frame(&mut self, frame: &RawFrame) -> Vec<Reply> {
        match frame.tag {
            FrameTag::Session => self.handle_session_frame(&frame.words()),
            FrameTag::Page => self.handle_page_frame(&frame.words()),
            _ => Vec::new(),
        }
    }
}

/// Inspection and priming handle onto a [`SimChannel`], usable after the
/// channel has been moved into a line.
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    /// Presets the flash CRC the simulated part reports, as if it had been
    /// programmed earlier.
    pub fn prime_flash_crc(&self, value: u32) {
        self.0.lock().unwrap().flash_crc = Some(value);
    }

    pub fn prime_flash_cs_crc(&self, value: u16) {
        self.0.lock().unwrap().flash_cs_crc = Some(value);
    }

    /// Presets the EEPROM CRC reported for a run starting at `page_offset`.
    pub fn prime_eeprom_crc(&self, page_offset: u16, value: u16) {
        self.0.lock().unwrap().eeprom_crcs.insert(page_offset, value);
    }

    /// Makes the next `count` page acks carry a corrupted checksum byte,
    /// as if the pages were mangled on the wire.
    pub fn corrupt_next_page_acks(&self, count: u32) {
        self.0.lock().unwrap().corrupt_page_acks = count;
    }

    /// Makes the next `count` session acks report a wrong page count.
    pub fn corrupt_next_session_acks(&self, count: u32) {
        self.0.lock().unwrap().corrupt_session_acks = count;
    }

    /// Raw words of every session frame observed, in order.
    pub fn session_log(&self) -> Vec<[u16; 4]> {
        self.0.lock().unwrap().session_log.clone()
    }

    /// Session ids observed, in order.
    pub fn sessions_seen(&self) -> Vec<u8> {
        self.session_log()
            .iter()
            .map(|frame| ((frame[0] >> 8) & 0x7F) as u8)
            .collect()
    }

    /// Number of chip-reset sessions observed.
    pub fn chip_resets(&self) -> usize {
        self.sessions_seen()
            .iter()
            .filter(|id| **id == ID_CHIP_RESET)
            .count()
    }

    /// Sequence number and data words of every page frame observed,
    /// retransmissions included.
    pub fn page_log(&self) -> Vec<(u8, Vec<u16>)> {
        self.0.lock().unwrap().page_log.clone()
    }
}

/// A [`PulseChannel`] backed by a simulated slave instead of hardware.
pub struct SimChannel {
    events: Option<Arc<LineShared>>,
    state: Arc<Mutex<SimState>>,
    armed: Option<SymbolBuffer>,
}

impl SimChannel {
    /// Creates a simulated part reporting `project_id` from unlock and
    /// chip-reset.
    pub fn new(project_id: u16) -> Self {
        SimChannel {
            events: None,
            state: Arc::new(Mutex::new(SimState {
                project_id,
                ..SimState::default()
            })),
            armed: None,
        }
    }

    /// Handle for priming and inspecting the simulated part.
    pub fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.state))
    }
}

impl PulseChannel for SimChannel {
    fn connect(&mut self, events: Arc<LineShared>) {
        self.events = Some(events);
    }

    fn set_timing(&mut self, _timing: &LineTiming) -> Result<()> {
        // Reconfiguration tears down an armed receive.
        if let (Some(buffer), Some(events)) = (self.armed.take(), self.events.as_ref()) {
            events.reclaim(buffer);
        }
        Ok(())
    }

    fn transmit(&mut self, pulses: &[Pulse], _repeat: u32) -> Result<()> {
        let events = self
            .events
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Line("channel not connected".to_string()))?;

        if let Some(buffer) = self.armed.take() {
            events.reclaim(buffer);
        }

        // Calibration pulses and the enter pattern do not decode as frames
        // and draw no response, like real silicon staying quiet.
        let replies = match decode_symbols(pulses) {
            Ok(frame) => self.state.lock().unwrap().handle_frame(&frame),
            Err(_) => Vec::new(),
        };

        self.armed = events.transmit_complete().map(|rearm| rearm.buffer);

        for reply in replies {
            let Some(mut buffer) = self.armed.take() else {
                break;
            };
            buffer.clear();
            let pulses = encode_frame(reply.tag, &words_to_bytes(&reply.words))?;
            for pulse in pulses {
                if buffer.push(pulse).is_err() {
                    break;
                }
            }
            self.armed = events
                .receive_complete(buffer, true)
                .map(|rearm| rearm.buffer);
        }

        Ok(())
    }
}

/// Primes a simulated part as if `hex` had already been programmed into
/// `chip`, so verify-only runs succeed against it.
pub fn prime_from_image(handle: &SimHandle, chip: &Chip, hex: &HexImage) {
    let Some(loader) = chip.ppm else { return };

    let flash = &chip.flash;
    let mut content = vec![0u8; flash.length as usize];
    hex.fill(flash.start, &mut content);
    handle.prime_flash_crc((loader.flash_crc)(&words_from_le_bytes(&content)));

    if let Some(hex_max) = hex.max_address() {
        let flash_cs = &chip.flash_cs;
        if hex_max >= flash_cs.start {
            let mut len = hex_max - flash_cs.start + 1;
            len = len.min(flash_cs.length);
            if len % flash_cs.page != 0 {
                len = len - len % flash_cs.page + flash_cs.page;
            }
            let mut content = vec![0u8; len as usize];
            hex.fill(flash_cs.start, &mut content);
            handle.prime_flash_cs_crc(crc::crc16(&content));
        }
    }

    // EEPROM answers are per contiguous run of covered pages, keyed by the
    // run's page offset.
    let nv = &chip.nv_memory;
    let mut run = vec![0u8; nv.length as usize];
    let mut curr_addr = nv.start;
    let mem_end = nv.end();
    while curr_addr < mem_end {
        let curr_off = curr_addr - nv.start;
        let mut curr_len: u32 = 0;
        while curr_addr < mem_end {
            if hex.count_bytes_in_range(curr_addr, nv.page) != 0 {
                let dst = curr_len as usize;
                hex.fill(curr_addr, &mut run[dst..dst + nv.page as usize]);
                curr_len += nv.page;
                curr_addr += nv.page;
            } else {
                curr_addr += nv.page;
                break;
            }
        }
        if curr_len > 0 {
            let page_offset = (curr_off / nv.page) as u16;
            handle.prime_eeprom_crc(page_offset, crc::crc16(&run[..curr_len as usize]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::PpmLine;
    use crate::session::{SessionConfig, SessionEngine};

    #[test]
    fn unlock_round_trip_reports_project_id() {
        let channel = SimChannel::new(0x4D32);
        let handle = channel.handle();
        let mut line = PpmLine::new(channel).unwrap();
        let project_id = SessionEngine::new(&mut line)
            .unlock(&SessionConfig::UNLOCK)
            .unwrap();
        assert_eq!(project_id, 0x4D32);
        assert_eq!(handle.sessions_seen(), vec![0x44]);
        assert!(handle.page_log().is_empty());
    }

    #[test]
    fn primed_flash_crc_reads_back() {
        let channel = SimChannel::new(0x4D32);
        let handle = channel.handle();
        handle.prime_flash_crc(0x00AB_1234);
        let mut line = PpmLine::new(channel).unwrap();
        let mut cfg = SessionConfig::FLASH_CRC;
        cfg.page_size = 64;
        let value = SessionEngine::new(&mut line).flash_crc(&cfg, 1024).unwrap();
        assert_eq!(value, 0x00AB_1234);
    }
}
