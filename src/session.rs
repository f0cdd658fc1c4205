// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! PPM sessions.
//!
//! Every exchange with the slave is the same dance: one session frame
//! announcing the operation, zero or more page frames carrying data, a page
//! acknowledge per page, and finally a session acknowledge. The dance is
//! parameterized by a [`SessionConfig`]; the per-operation entry points
//! below supply the magic offsets, checksums and reply validation.
//!
//! ## Frame layouts
//!
//! Session frame (4 words):
//!
//! | word | content |
//! |------|---------|
//! | 0    | high byte: session id, bit 7 set when an ack is requested; low byte: page size in words |
//! | 1    | page count |
//! | 2    | operation-specific offset |
//! | 3    | operation-specific checksum |
//!
//! Page frame (1 + page-size words): word 0 carries the sequence number in
//! the high byte and the page checksum in the low byte, followed by the
//! page's data words.

use std::thread;
use std::time::Duration;

use log::{debug, error};

use crate::codec::{FrameTag, MAX_PAGE_DATA_WORDS};
use crate::crc;
use crate::crc::FlashCrcFn;
use crate::error::{Error, Result};
use crate::line::{PpmLine, PulseChannel};

/// Session identifiers understood by the slave bootrom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionId {
    /// Programming keys transfer.
    ProgKeys = 0x03,
    /// Flash programming.
    FlashProg = 0x04,
    /// EEPROM (and IUM) programming.
    EepromProg = 0x06,
    /// Flash customer-section programming.
    FlashCsProg = 0x07,
    /// RAM program upload.
    RamProg = 0x08,
    /// Flash CRC read-back.
    FlashCrc = 0x43,
    /// Unlock session mode.
    Unlock = 0x44,
    /// Chip reset.
    ChipReset = 0x45,
    /// EEPROM CRC read-back.
    EepromCrc = 0x47,
    /// Flash customer-section CRC read-back.
    FlashCsCrc = 0x48,
}

/// Parameters of one session invocation.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub session_id: SessionId,
    /// Page size of this session's pages, in 16-bit words.
    pub page_size: u8,
    /// Request acknowledges from the slave; disabled in broadcast mode.
    pub request_ack: bool,
    /// Transmission attempts allowed per page.
    pub page_retry: u8,
    /// Acknowledge timeout for the first page [ms].
    pub page0_ack_timeout: u16,
    /// Acknowledge timeout for subsequent pages [ms].
    pub page_n_ack_timeout: u16,
    /// Session acknowledge timeout [ms].
    pub session_ack_timeout: u16,
    /// Flash CRC routine, flash programming sessions only.
    pub flash_crc: Option<FlashCrcFn>,
}

impl SessionConfig {
    pub const UNLOCK: SessionConfig = SessionConfig {
        session_id: SessionId::Unlock,
        page_size: 0,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 0,
        page_n_ack_timeout: 0,
        session_ack_timeout: 10,
        flash_crc: None,
    };

    pub const PROG_KEYS: SessionConfig = SessionConfig {
        session_id: SessionId::ProgKeys,
        page_size: 8,
        request_ack: true,
        page_retry: 1,
        page0_ack_timeout: 25,
        page_n_ack_timeout: 10,
        session_ack_timeout: 10,
        flash_crc: None,
    };

    /// Flash programming for the 24-bit bootrom-CRC parts.
    pub const FLASH_PROG: SessionConfig = SessionConfig {
        session_id: SessionId::FlashProg,
        page_size: 64,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 100,
        page_n_ack_timeout: 10,
        session_ack_timeout: 10,
        flash_crc: Some(crc::crc24_bootrom),
    };

    /// Flash programming for the XFE family.
    pub const FLASH_PROG_XFE: SessionConfig = SessionConfig {
        flash_crc: Some(crc::crc24_xfe),
        ..SessionConfig::FLASH_PROG
    };

    /// Flash programming for the KF family.
    pub const FLASH_PROG_KF: SessionConfig = SessionConfig {
        flash_crc: Some(crc::crc24_kf),
        ..SessionConfig::FLASH_PROG
    };

    pub const EEPROM_PROG: SessionConfig = SessionConfig {
        session_id: SessionId::EepromProg,
        page_size: 4,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 15,
        page_n_ack_timeout: 15,
        session_ack_timeout: 17,
        flash_crc: None,
    };

    /// IUM programming shares the EEPROM session id with its own page
    /// geometry and timings.
    pub const IUM_PROG: SessionConfig = SessionConfig {
        session_id: SessionId::EepromProg,
        page_size: 64,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 8,
        page_n_ack_timeout: 8,
        session_ack_timeout: 10,
        flash_crc: None,
    };

    pub const FLASH_CS_PROG: SessionConfig = SessionConfig {
        session_id: SessionId::FlashCsProg,
        page_size: 64,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 50,
        page_n_ack_timeout: 7,
        session_ack_timeout: 15,
        flash_crc: None,
    };

    pub const FLASH_CRC: SessionConfig = SessionConfig {
        session_id: SessionId::FlashCrc,
        page_size: 0,
        request_ack: true,
        page_retry: 5,
        page0_ack_timeout: 0,
        page_n_ack_timeout: 0,
        session_ack_timeout: 5,
        flash_crc: None,
    };

    pub const EEPROM_CRC: SessionConfig = SessionConfig {
        session_id: SessionId::EepromCrc,
        session_ack_timeout: 5,
        ..SessionConfig::FLASH_CRC
    };

    pub const IUM_CRC: SessionConfig = SessionConfig {
        session_id: SessionId::EepromCrc,
        session_ack_timeout: 8,
        ..SessionConfig::FLASH_CRC
    };

    pub const FLASH_CS_CRC: SessionConfig = SessionConfig {
        session_id: SessionId::FlashCsCrc,
        session_ack_timeout: 5,
        ..SessionConfig::FLASH_CRC
    };

    pub const CHIP_RESET: SessionConfig = SessionConfig {
        session_id: SessionId::ChipReset,
        session_ack_timeout: 10,
        ..SessionConfig::FLASH_CRC
    };
}

pub(crate) fn words_from_le_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from(pair[0]) | (u16::from(*pair.get(1).unwrap_or(&0)) << 8))
        .collect()
}

/// Drives sessions over a [`PpmLine`].
pub struct SessionEngine<'a, C: PulseChannel> {
    line: &'a mut PpmLine<C>,
}

impl<'a, C: PulseChannel> SessionEngine<'a, C> {
    pub fn new(line: &'a mut PpmLine<C>) -> Self {
        SessionEngine { line }
    }

    fn send_session_frame(
        &mut self,
        config: &SessionConfig,
        page_count: u16,
        offset: u16,
        checksum: u16,
    ) -> Result<()> {
        let mut command = u16::from(config.session_id as u8);
        if config.request_ack {
            command |= 0x80;
        }
        let frame = [
            (command << 8) | u16::from(config.page_size),
            page_count,
            offset,
            checksum,
        ];
        self.line.send_frame(FrameTag::Session, &frame)
    }

    fn receive_session_ack(&mut self, timeout_ms: u16) -> Option<Vec<u16>> {
        let (tag, mut words) = self.line.wait_response(timeout_ms)?;
        if tag != FrameTag::Session {
            debug!("discarding {tag:?} frame while waiting for a session ack");
            return None;
        }
        // The slave reports the session ack's first word one high (device
        // erratum); undo before validating content.
        if let Some(first) = words.first_mut() {
            *first = first.wrapping_sub(1);
        }
        Some(words)
    }

    fn send_page_frame(&mut self, sequence: u8, page_checksum: u8, words: &[u16]) -> Result<()> {
        if words.len() > MAX_PAGE_DATA_WORDS {
            return Err(Error::InvalidArg("page data exceeds 128 words"));
        }
        let mut frame = Vec::with_capacity(1 + words.len());
        frame.push(u16::from(sequence) << 8 | u16::from(page_checksum));
        frame.extend_from_slice(words);
        self.line.send_frame(FrameTag::Page, &frame)
    }

    fn receive_page_ack(&mut self, timeout_ms: u16) -> Option<Vec<u16>> {
        let (tag, words) = self.line.wait_response(timeout_ms)?;
        if tag != FrameTag::Page {
            debug!("discarding {tag:?} frame while waiting for a page ack");
            return None;
        }
        Some(words)
    }

    /// Runs one complete session: the session frame, every page with its
    /// retries, and the session acknowledge.
    ///
    /// `payload_word_len` sets the page count announced to the slave; the
    /// CRC read-back sessions announce a length without sending any pages,
    /// so it is independent of `payload`.
    ///
    /// Returns the validated session-ack words, or `None` when the session
    /// produced no acceptable ack (which is the expected outcome with
    /// `request_ack` disabled). A failed frame transmission, a page
    /// exhausting its retries and a missing or invalid ack all end up in
    /// the same `None`; the entry points resolve it against `request_ack`.
    /// Only argument preconditions surface as errors.
    fn handle_session(
        &mut self,
        config: &SessionConfig,
        offset: u16,
        checksum: u16,
        payload: Option<&[u16]>,
        payload_word_len: usize,
    ) -> Result<Option<Vec<u16>>> {
        let page_count = if config.page_size == 0 {
            0
        } else {
            payload_word_len.div_ceil(usize::from(config.page_size)) as u16
        };

        match self.send_session_frame(config, page_count, offset, checksum) {
            Ok(()) => {}
            Err(err @ Error::InvalidArg(_)) => return Err(err),
            Err(_) => {
                error!("session frame transmission failed");
                return Ok(None);
            }
        }

        if let Some(payload) = payload {
            let page_words = usize::from(config.page_size);
            for seqnr in 0..page_count {
                let sequence = (seqnr & 0xFF) as u8;
                // The last page may be short; the frame always carries a
                // full page, zero-padded.
                let mut page = vec![0u16; page_words];
                let start = usize::from(seqnr) * page_words;
                let end = payload.len().min(start + page_words);
                if start < end {
                    page[..end - start].copy_from_slice(&payload[start..end]);
                }
                let page_checksum = (crc::page_checksum(&page) & 0xFF) as u8;

                let timeout = if seqnr == 0 {
                    config.page0_ack_timeout
                } else {
                    config.page_n_ack_timeout
                };

                let mut acknowledged = false;
                for _attempt in 0..config.page_retry {
                    // A transmission failure costs this attempt, like a
                    // bad or missing ack.
                    match self.send_page_frame(sequence, page_checksum, &page) {
                        Ok(()) => {}
                        Err(err @ Error::InvalidArg(_)) => return Err(err),
                        Err(_) => {
                            debug!("page {seqnr} transmission failed, retrying");
                            continue;
                        }
                    }

                    if !config.request_ack {
                        // Give the slave its write/erase time, then move on.
                        thread::sleep(Duration::from_millis(timeout.into()));
                        acknowledged = true;
                        break;
                    }

                    if let Some(ack) = self.receive_page_ack(timeout) {
                        let expected = u16::from(sequence) << 8 | u16::from(page_checksum);
                        if ack.first() == Some(&expected) {
                            acknowledged = true;
                            break;
                        }
                        debug!("page {seqnr} ack mismatch, retrying");
                    }
                }

                if !acknowledged {
                    error!(
                        "page {} not acknowledged after {} attempts",
                        seqnr, config.page_retry
                    );
                    return Ok(None);
                }
            }
        }

        if !config.request_ack {
            thread::sleep(Duration::from_millis(config.session_ack_timeout.into()));
            return Ok(None);
        }

        match self.receive_session_ack(config.session_ack_timeout) {
            Some(reply)
                if reply.len() >= 2
                    && reply[0]
                        == (u16::from(config.session_id as u8) << 8)
                            | u16::from(config.page_size)
                    && reply[1] == page_count =>
            {
                Ok(Some(reply))
            }
            Some(_) => {
                error!("session ack content mismatch");
                Ok(None)
            }
            None => {
                error!("no session ack received");
                Ok(None)
            }
        }
    }

    /// Unlocks session mode. Returns the slave's project id, or 0 in
    /// broadcast mode where no reply is expected.
    pub fn unlock(&mut self, config: &SessionConfig) -> Result<u16> {
        debug!("unlock session");
        match self.handle_session(config, 0x8374, 0xBF12, None, 0)? {
            Some(reply) if reply.len() == 4 => Ok(reply[3]),
            Some(_) => Err(Error::Session("incorrect unlock response length")),
            None if !config.request_ack => Ok(0),
            None => Err(Error::Session("no unlock response received")),
        }
    }

    /// Transfers the programming keys unblocking write sessions.
    pub fn prog_keys(&mut self, config: &SessionConfig, keys: &[u16]) -> Result<()> {
        debug!("programming keys session");
        match self.handle_session(config, 0xBEBE, 0xBEBE, Some(keys), keys.len())? {
            Some(reply) if reply.len() == 4 && reply[2] == 0xBEBE && reply[3] == 0xBEBE => Ok(()),
            Some(_) => Err(Error::Session("incorrect programming keys response")),
            None if !config.request_ack => Ok(()),
            None => Err(Error::Session("no programming keys response received")),
        }
    }

    /// Programs the flash image.
    ///
    /// The image words carry their 24-bit CRC in the session frame, split
    /// as offset = bits 16..24 and checksum = bits 0..16, and the slave
    /// echoes both in the ack. Page 0 must be the last page on the wire,
    /// so the payload starts at page 1 and wraps page 0 to the tail.
    pub fn flash_program(&mut self, config: &SessionConfig, flash_bytes: &[u8]) -> Result<()> {
        debug!("flash programming session, {} bytes", flash_bytes.len());
        let crc_fn = config
            .flash_crc
            .ok_or(Error::InvalidArg("flash programming needs a crc routine"))?;
        let page_words = usize::from(config.page_size);
        if page_words == 0 {
            return Err(Error::InvalidArg("flash programming needs a page size"));
        }

        let words_len = flash_bytes.len().div_ceil(2);
        let mut words = vec![0u16; words_len + page_words];
        for (i, pair) in flash_bytes.chunks(2).enumerate() {
            words[i] = u16::from(pair[0]) | (u16::from(*pair.get(1).unwrap_or(&0)) << 8);
        }

        let flash_crc = crc_fn(&words[..words_len]);
        // Wrap page 0 to the tail so it is transmitted last.
        words.copy_within(0..page_words, words_len);

        let offset = ((flash_crc >> 16) & 0xFF) as u16;
        let checksum = flash_crc as u16;
        let payload = &words[page_words..page_words + words_len];

        match self.handle_session(config, offset, checksum, Some(payload), words_len)? {
            Some(reply) if reply.len() == 4 && reply[2] == offset && reply[3] == checksum => Ok(()),
            Some(_) => Err(Error::Session("incorrect flash programming response")),
            None if !config.request_ack => Ok(()),
            None => Err(Error::Session("no flash programming response received")),
        }
    }

    /// Programs a page-aligned run of EEPROM data starting `mem_offset`
    /// bytes into the memory.
    pub fn eeprom_program(
        &mut self,
        config: &SessionConfig,
        mem_offset: u16,
        data: &[u8],
    ) -> Result<()> {
        debug!(
            "eeprom programming session, {} bytes at offset {mem_offset:#x}",
            data.len()
        );
        let page_words = usize::from(config.page_size);
        if page_words == 0 {
            return Err(Error::InvalidArg("eeprom programming needs a page size"));
        }

        let page_offset = usize::from(mem_offset).div_ceil(2 * page_words) as u16;
        let eeprom_crc = crc::crc16(data);
        let words = words_from_le_bytes(data);

        match self.handle_session(config, page_offset, eeprom_crc, Some(&words), words.len())? {
            Some(reply) if reply.len() == 4 && reply[3] == eeprom_crc => Ok(()),
            Some(_) => Err(Error::Session("incorrect eeprom programming response")),
            None if !config.request_ack => Ok(()),
            None => Err(Error::Session("no eeprom programming response received")),
        }
    }

    /// Programs the flash customer section.
    pub fn flash_cs_program(&mut self, config: &SessionConfig, data: &[u8]) -> Result<()> {
        debug!("flash cs programming session, {} bytes", data.len());
        let flash_crc = crc::crc16(data);
        let words = words_from_le_bytes(data);

        match self.handle_session(config, 0, flash_crc, Some(&words), words.len())? {
            Some(reply) if reply.len() == 4 && reply[2] == 0 && reply[3] == flash_crc => Ok(()),
            Some(_) => Err(Error::Session("incorrect flash cs programming response")),
            None if !config.request_ack => Ok(()),
            None => Err(Error::Session("no flash cs programming response received")),
        }
    }

    /// Reads back the 24-bit CRC the slave computes over the first
    /// `byte_len` bytes of flash.
    pub fn flash_crc(&mut self, config: &SessionConfig, byte_len: usize) -> Result<u32> {
        debug!("flash crc session over {byte_len} bytes");
        let words_len = byte_len.div_ceil(2);
        match self.handle_session(config, 0, 0, None, words_len)? {
            Some(reply) if reply.len() == 4 => {
                Ok(u32::from(reply[2] & 0xFF) << 16 | u32::from(reply[3]))
            }
            Some(_) => Err(Error::Session("incorrect flash crc response length")),
            None if !config.request_ack => Ok(0),
            None => Err(Error::Session("no flash crc response received")),
        }
    }

    /// Reads back the slave's 16-bit EEPROM CRC over `byte_len` bytes
    /// starting `offset` bytes into the memory.
    pub fn eeprom_crc(
        &mut self,
        config: &SessionConfig,
        offset: u16,
        byte_len: usize,
    ) -> Result<u16> {
        debug!("eeprom crc session over {byte_len} bytes at offset {offset:#x}");
        let page_words = usize::from(config.page_size);
        if page_words == 0 {
            return Err(Error::InvalidArg("eeprom crc needs a page size"));
        }
        let words_len = byte_len.div_ceil(2);
        let page_offset = usize::from(offset).div_ceil(2 * page_words) as u16;
        match self.handle_session(config, page_offset, 0, None, words_len)? {
            Some(reply) if reply.len() == 4 => Ok(reply[3]),
            Some(_) => Err(Error::Session("incorrect eeprom crc response length")),
            None if !config.request_ack => Ok(0),
            None => Err(Error::Session("no eeprom crc response received")),
        }
    }

    /// Reads back the slave's 16-bit flash-CS CRC over `byte_len` bytes.
    pub fn flash_cs_crc(&mut self, config: &SessionConfig, byte_len: usize) -> Result<u16> {
        debug!("flash cs crc session over {byte_len} bytes");
        let words_len = byte_len.div_ceil(2);
        match self.handle_session(config, 0, 0, None, words_len)? {
            Some(reply) if reply.len() == 4 => Ok(reply[3]),
            Some(_) => Err(Error::Session("incorrect flash cs crc response length")),
            None if !config.request_ack => Ok(0),
            None => Err(Error::Session("no flash cs crc response received")),
        }
    }

    /// Resets the chip out of session mode. Returns the project id from
    /// the ack, or 0 in broadcast mode.
    pub fn chip_reset(&mut self, config: &SessionConfig) -> Result<u16> {
        debug!("chip reset session");
        match self.handle_session(config, 0, 0, None, 0)? {
            Some(reply) if reply.len() == 4 => Ok(reply[3]),
            Some(_) => Err(Error::Session("incorrect chip reset response length")),
            None if !config.request_ack => Ok(0),
            None => Err(Error::Session("no chip reset response received")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_table() {
        let unlock = SessionConfig::UNLOCK;
        assert_eq!(unlock.session_id as u8, 0x44);
        assert_eq!(unlock.page_size, 0);
        assert_eq!(unlock.session_ack_timeout, 10);
        assert_eq!(unlock.page_retry, 5);

        let keys = SessionConfig::PROG_KEYS;
        assert_eq!(keys.session_id as u8, 0x03);
        assert_eq!(
            (keys.page_size, keys.page0_ack_timeout, keys.page_retry),
            (8, 25, 1)
        );

        let flash = SessionConfig::FLASH_PROG;
        assert_eq!(flash.session_id as u8, 0x04);
        assert_eq!(
            (flash.page_size, flash.page0_ack_timeout, flash.page_n_ack_timeout),
            (64, 100, 10)
        );
        assert!(flash.flash_crc.is_some());
        assert_ne!(
            SessionConfig::FLASH_PROG_XFE.flash_crc.map(|f| f as usize),
            SessionConfig::FLASH_PROG_KF.flash_crc.map(|f| f as usize)
        );

        assert_eq!(SessionConfig::EEPROM_PROG.session_id as u8, 0x06);
        assert_eq!(SessionConfig::IUM_PROG.session_id as u8, 0x06);
        assert_eq!(SessionConfig::IUM_PROG.page_size, 64);
        assert_eq!(SessionConfig::FLASH_CS_PROG.session_id as u8, 0x07);
        assert_eq!(SessionConfig::FLASH_CRC.session_id as u8, 0x43);
        assert_eq!(SessionConfig::EEPROM_CRC.session_id as u8, 0x47);
        assert_eq!(SessionConfig::IUM_CRC.session_ack_timeout, 8);
        assert_eq!(SessionConfig::FLASH_CS_CRC.session_id as u8, 0x48);
        assert_eq!(SessionConfig::CHIP_RESET.session_id as u8, 0x45);
    }

    #[test]
    fn le_word_reinterpretation_pads_odd_tails() {
        assert_eq!(words_from_le_bytes(&[0x34, 0x12, 0xCD]), [0x1234, 0x00CD]);
        assert!(words_from_le_bytes(&[]).is_empty());
    }
}
