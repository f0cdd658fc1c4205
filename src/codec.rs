// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Pulse-position-modulation wire codec.
//!
//! A PPM frame is a single timed pulse sequence: one long leading pulse
//! identifying the frame class, followed by data symbols carrying two bits
//! each, terminated by a trailing low. All durations below are in wire ticks
//! of 0.25 µs unless noted otherwise.
//!
//! A data symbol's value is carried in its *total* duration (high plus low
//! time). The four symbol values are evenly spaced by [`BIT_DISTANCE`]
//! starting at [`SYMBOL_BASE_TIME`]:
//!
//! | value | total time |
//! |-------|-----------|
//! | 0b00  | 4.5 µs    |
//! | 0b01  | 6.0 µs    |
//! | 0b10  | 7.5 µs    |
//! | 0b11  | 9.0 µs    |
//!
//! Bytes are sent most-significant symbol first, four symbols per byte, and
//! pair up into big-endian 16-bit words for the session layer.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::error::{Error, Result};

/// Distance between two adjacent symbol total times [ticks].
pub const BIT_DISTANCE: u16 = 6;
/// Low time terminating every pulse [ticks].
pub const PULSE_LOW_TIME: u16 = 6;
/// Leading pulse total time of a session frame [ticks].
pub const SESSION_PULSE_TIME: u16 = 48;
/// Leading pulse total time of a page frame [ticks].
pub const PAGE_PULSE_TIME: u16 = 54;
/// Total time of the calibration pulse [ticks].
pub const CALIB_PULSE_TIME: u16 = 75;
/// Total time of the fastest data symbol (value 0b00) [ticks].
pub const SYMBOL_BASE_TIME: u16 = 18;
/// Total time of the slowest acceptable data symbol [ticks].
pub const SYMBOL_MAX_TIME: u16 = 90;
/// Number of data symbols transmitted per byte.
pub const SYMBOLS_PER_BYTE: usize = 4;

/// Maximum number of data words in a page frame.
pub const MAX_PAGE_DATA_WORDS: usize = 128;
/// Maximum number of words in any frame (page header word plus data).
pub const MAX_FRAME_WORDS: usize = 1 + MAX_PAGE_DATA_WORDS;
/// Maximum number of payload bytes in any frame.
pub const MAX_FRAME_BYTES: usize = MAX_FRAME_WORDS * 2;

/// Wire resolution applied before a calibration frame has set a bitrate
/// (0.25 µs ticks).
pub const DEFAULT_RESOLUTION_HZ: u32 = 4_000_000;

/// One wire pulse: a high time followed by a low time, both in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pulse {
    pub high: u16,
    pub low: u16,
}

impl Pulse {
    /// Marks the end of a transmission; decoders skip it.
    pub const END: Pulse = Pulse { high: 0, low: 0 };

    /// Builds a pulse of the given total duration with the standard trailing
    /// low time.
    const fn with_total(total: u16) -> Self {
        Pulse {
            high: total - PULSE_LOW_TIME,
            low: PULSE_LOW_TIME,
        }
    }

    /// Total duration of the pulse in ticks.
    pub fn total(&self) -> u32 {
        u32::from(self.high) + u32::from(self.low)
    }
}

/// Classification of a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameTag {
    /// Four-word session open/acknowledge frame.
    Session,
    /// Page frame: header word plus up to 128 data words.
    Page,
    /// Bare calibration pulse, no payload.
    Calibration,
    /// Enter-programming-mode pulse pattern.
    EnterPattern,
    /// Not (yet) classified.
    #[default]
    Unknown,
}

/// Reasons a received symbol stream failed to decode.
///
/// These never surface to bootloader callers; the offending frame is dropped
/// and the session-layer timeout covers the silence.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The leading pulse matched neither frame class.
    #[error("leading pulse matches no frame class")]
    Framing,
    /// A data symbol's total duration was outside the acceptance window.
    #[error("data symbol outside timing acceptance window")]
    Timing,
}

/// A decoded frame as it travels through the receive queue.
///
/// The payload lives in a fixed-capacity buffer so the record can be built
/// and enqueued from the line-completion context without allocating.
#[derive(Debug, Clone, Default)]
pub struct RawFrame {
    pub tag: FrameTag,
    pub data: heapless::Vec<u8, MAX_FRAME_BYTES>,
}

impl RawFrame {
    /// Payload regrouped into big-endian 16-bit words. A trailing odd byte
    /// is dropped.
    pub fn words(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect()
    }
}

/// The enter-programming-mode pulse pattern.
///
/// Repeating the four pulse widths for long enough while the target powers
/// up diverts its boot flow into the PPM bootloader.
#[derive(Debug, Clone, Copy)]
pub struct EnterPattern {
    /// The four pulse widths making up one repetition [µs].
    pub widths_us: [u32; 4],
    /// Duration of one repetition [µs].
    pub total_us: u32,
}

impl EnterPattern {
    pub const DEFAULT: EnterPattern = EnterPattern {
        widths_us: [30, 90, 45, 45],
        total_us: 210,
    };

    /// The pattern as high/low pulse pairs at the default wire resolution.
    pub fn pulses(&self) -> [Pulse; 2] {
        let t = |us: u32| (us * 4) as u16;
        [
            Pulse {
                high: t(self.widths_us[0]),
                low: t(self.widths_us[1]),
            },
            Pulse {
                high: t(self.widths_us[2]),
                low: t(self.widths_us[3]),
            },
        ]
    }

    /// Number of repetitions needed to keep the pattern on the wire for
    /// `pattern_time_us`, never less than one.
    pub fn repeats(&self, pattern_time_us: u32) -> u32 {
        (pattern_time_us / self.total_us).max(1)
    }
}

fn lead_pulse(tag: FrameTag) -> Option<Pulse> {
    match tag {
        FrameTag::Session => Some(Pulse::with_total(SESSION_PULSE_TIME)),
        FrameTag::Page => Some(Pulse::with_total(PAGE_PULSE_TIME)),
        FrameTag::Calibration => Some(Pulse::with_total(CALIB_PULSE_TIME)),
        FrameTag::EnterPattern | FrameTag::Unknown => None,
    }
}

fn symbol(value: u8) -> Pulse {
    Pulse::with_total(SYMBOL_BASE_TIME + BIT_DISTANCE * u16::from(value & 0x03))
}

/// Encodes a frame into its pulse sequence: leading pulse, four symbols per
/// payload byte (most-significant symbol first), terminating low.
///
/// # Errors
///
/// [`Error::InvalidArg`] when `tag` has no wire representation as a framed
/// transmission (enter-pattern emission goes through [`EnterPattern`]).
pub fn encode_frame(tag: FrameTag, payload: &[u8]) -> Result<Vec<Pulse>> {
    let lead = lead_pulse(tag).ok_or(Error::InvalidArg("frame tag has no leading pulse"))?;

    let mut pulses = Vec::with_capacity(2 + payload.len() * SYMBOLS_PER_BYTE);
    pulses.push(lead);
    for byte in payload {
        for shift in [6u8, 4, 2, 0] {
            pulses.push(symbol(byte >> shift));
        }
    }
    pulses.push(Pulse::END);
    Ok(pulses)
}

/// Packs 16-bit words into the big-endian byte stream a frame carries.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * 2];
    BigEndian::write_u16_into(words, &mut bytes);
    bytes
}

fn classify_lead(total: u32) -> core::result::Result<FrameTag, DecodeError> {
    let band = u32::from(BIT_DISTANCE / 2);
    if total.abs_diff(u32::from(SESSION_PULSE_TIME)) <= band {
        Ok(FrameTag::Session)
    } else if total.abs_diff(u32::from(PAGE_PULSE_TIME)) <= band {
        Ok(FrameTag::Page)
    } else {
        Err(DecodeError::Framing)
    }
}

/// Decodes a captured symbol stream back into a frame.
///
/// The first symbol classifies the frame, the last one is the trailing low
/// and carries no data. Any data symbol outside the acceptance window
/// aborts the frame; the caller drops it and keeps listening.
///
/// Callable from the line-completion context: does not allocate.
pub fn decode_symbols(symbols: &[Pulse]) -> core::result::Result<RawFrame, DecodeError> {
    let lead = symbols.first().ok_or(DecodeError::Framing)?;
    let tag = classify_lead(lead.total())?;

    let mut frame = RawFrame {
        tag,
        data: heapless::Vec::new(),
    };
    let mut current = 0u8;
    let mut bits_filled = 0u8;

    let data_symbols = if symbols.len() > 1 {
        &symbols[1..symbols.len() - 1]
    } else {
        &[][..]
    };
    for pulse in data_symbols {
        let total = pulse.total();
        if total < u32::from(SYMBOL_BASE_TIME) || total > u32::from(SYMBOL_MAX_TIME) {
            return Err(DecodeError::Timing);
        }

        let value = ((total - u32::from(SYMBOL_BASE_TIME)) / u32::from(BIT_DISTANCE)) & 0x03;
        current = (current << 2) | value as u8;
        bits_filled += 2;

        if bits_filled == 8 {
            if frame.data.push(current).is_err() {
                break;
            }
            current = 0;
            bits_filled = 0;
        }
    }

    // A truncated byte is emitted left-aligned.
    if bits_filled > 0 {
        let _ = frame.data.push(current << (8 - bits_filled));
    }

    Ok(frame)
}

/// Receive-side line timing, reconfigured as a unit when the bitrate
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTiming {
    /// Wire tick rate [Hz].
    pub resolution_hz: u32,
    /// Shortest pulse accepted by the receiver [ns].
    pub rx_min_ns: u32,
    /// Longest pulse accepted by the receiver [ns].
    pub rx_max_ns: u32,
}

impl LineTiming {
    /// Timing in effect before any calibration frame: 0.25 µs ticks and the
    /// 1–22.5 µs acceptance window.
    pub const DEFAULT: LineTiming = LineTiming {
        resolution_hz: DEFAULT_RESOLUTION_HZ,
        rx_min_ns: 1_000,
        rx_max_ns: 22_500,
    };

    /// Derives the line timing for an average bitrate.
    ///
    /// With as many ones as zeroes on the wire the average symbol lasts
    /// 6.75 µs and carries two bits, so `resolution = bitrate / 2 · 27`.
    /// The acceptance window scales from the 1–22.5 µs window at the
    /// default timing.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero bitrate.
    pub fn from_bitrate(bitrate: u32) -> Result<Self> {
        if bitrate == 0 {
            return Err(Error::InvalidArg("bitrate must be non-zero"));
        }

        Ok(LineTiming {
            resolution_hz: bitrate / 2 * 27,
            rx_min_ns: (8_000_000_000u64 / 27 / u64::from(bitrate)) as u32,
            rx_max_ns: (20_000_000_000u64 / 3 / u64::from(bitrate)) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(lead: u16, totals: &[u16]) -> Vec<Pulse> {
        let mut pulses = vec![Pulse::with_total(lead)];
        pulses.extend(totals.iter().map(|t| Pulse::with_total(*t)));
        pulses.push(Pulse::END);
        pulses
    }

    #[test]
    fn symbol_totals_decode_to_their_values() {
        let decoded = decode_symbols(&frame(SESSION_PULSE_TIME, &[18, 24, 30, 36])).unwrap();
        assert_eq!(decoded.tag, FrameTag::Session);
        assert_eq!(decoded.data.as_slice(), &[0b00_01_10_11]);
    }

    #[test]
    fn lead_classification_bands() {
        for total in [45, 48, 50] {
            assert_eq!(
                decode_symbols(&frame(total, &[])).unwrap().tag,
                FrameTag::Session
            );
        }
        for total in [52, 54, 57] {
            assert_eq!(
                decode_symbols(&frame(total, &[])).unwrap().tag,
                FrameTag::Page
            );
        }
        assert_eq!(
            decode_symbols(&frame(60, &[])).unwrap_err(),
            DecodeError::Framing
        );
    }

    #[test]
    fn out_of_window_symbol_aborts_decoding() {
        assert_eq!(
            decode_symbols(&frame(SESSION_PULSE_TIME, &[24, 17, 24, 24])).unwrap_err(),
            DecodeError::Timing
        );
        assert_eq!(
            decode_symbols(&frame(PAGE_PULSE_TIME, &[91])).unwrap_err(),
            DecodeError::Timing
        );
    }

    #[test]
    fn empty_symbol_stream_is_a_framing_error() {
        assert_eq!(decode_symbols(&[]).unwrap_err(), DecodeError::Framing);
    }

    #[test]
    fn encode_decode_are_inverses() {
        for len in [0usize, 1, 2, 7, 129, MAX_FRAME_BYTES] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 5) as u8).collect();
            for tag in [FrameTag::Session, FrameTag::Page] {
                let pulses = encode_frame(tag, &payload).unwrap();
                let decoded = decode_symbols(&pulses).unwrap();
                assert_eq!(decoded.tag, tag);
                assert_eq!(decoded.data.as_slice(), payload.as_slice());
            }
        }
    }

    #[test]
    fn truncated_reception_left_aligns_last_byte() {
        let mut pulses = encode_frame(FrameTag::Page, &[0xAB, 0xCD]).unwrap();
        // Drop the end marker and the last two data symbols: 0xCD loses its
        // low nibble.
        pulses.truncate(pulses.len() - 3);
        pulses.push(Pulse::END);
        let decoded = decode_symbols(&pulses).unwrap();
        assert_eq!(decoded.data.as_slice(), &[0xAB, 0xC0]);
    }

    #[test]
    fn words_round_trip_big_endian() {
        let words = [0x1234u16, 0xBEEF, 0x00FF];
        let bytes = words_to_bytes(&words);
        assert_eq!(bytes, [0x12, 0x34, 0xBE, 0xEF, 0x00, 0xFF]);
        let frame = RawFrame {
            tag: FrameTag::Session,
            data: heapless::Vec::from_slice(&bytes).unwrap(),
        };
        assert_eq!(frame.words(), words);
    }

    #[test]
    fn calibration_is_a_bare_pulse() {
        let pulses = encode_frame(FrameTag::Calibration, &[]).unwrap();
        assert_eq!(pulses.len(), 2);
        assert_eq!(pulses[0].total(), u32::from(CALIB_PULSE_TIME));
        assert_eq!(pulses[1], Pulse::END);
    }

    #[test]
    fn enter_pattern_shape() {
        let pattern = EnterPattern::DEFAULT;
        let pulses = pattern.pulses();
        let total_ticks: u32 = pulses.iter().map(Pulse::total).sum();
        assert_eq!(total_ticks, pattern.total_us * 4);
        assert_eq!(pattern.repeats(50_000), 238);
        assert_eq!(pattern.repeats(100), 1);
    }

    #[test]
    fn bitrate_scaling_keeps_mean_pulse_in_window() {
        for bitrate in [100_000u32, 296_296, 500_000, 1_000_000] {
            let timing = LineTiming::from_bitrate(bitrate).unwrap();
            // Two bits per symbol: the mean symbol lasts 2/bitrate seconds.
            let mean_ns = 2_000_000_000u64 / u64::from(bitrate);
            assert!(u64::from(timing.rx_min_ns) < mean_ns);
            assert!(mean_ns < u64::from(timing.rx_max_ns));
        }
    }

    #[test]
    fn default_bitrate_matches_default_timing() {
        let timing = LineTiming::from_bitrate(296_296).unwrap();
        assert_eq!(timing.resolution_hz, 3_999_996);
        assert_eq!(timing.rx_min_ns, 1_000);
        assert_eq!(timing.rx_max_ns, 22_500);
    }

    #[test]
    fn zero_bitrate_is_rejected() {
        assert!(matches!(
            LineTiming::from_bitrate(0),
            Err(Error::InvalidArg(_))
        ));
    }
}
