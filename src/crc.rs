// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Checksum primitives shared by the session layer and the orchestrator.
//!
//! The slave bootrom checks three kinds of integrity values:
//!
//! - a CRC-16 over byte streams (EEPROM and flash-CS payloads), the
//!   AUG-CCITT variant primed with 0x1D0F,
//! - a 24-bit CRC over the 16-bit flash words, with one polynomial per chip
//!   family,
//! - a single-byte page checksum carried in every page frame header.

use crc::{Algorithm, Crc};

/// Flash CRC routine selected per chip family: 24-bit CRC over the flash
/// image words.
pub type FlashCrcFn = fn(&[u16]) -> u32;

const CRC_16_AUG_CCITT: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_SPI_FUJITSU);

/// CRC-16 (poly 0x1021, init 0x1D0F) over a byte stream, as checked by the
/// slave for EEPROM and flash-CS payloads.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_16_AUG_CCITT.checksum(bytes)
}

const fn crc24_algorithm(poly: u32) -> Algorithm<u32> {
    Algorithm {
        width: 24,
        poly,
        init: 0x00_0001,
        refin: false,
        refout: false,
        xorout: 0,
        check: 0,
        residue: 0,
    }
}

/// Bootrom flash CRC used by the 24-bit parts (FlexRay polynomial).
static CRC_24_BOOTROM: Algorithm<u32> = crc24_algorithm(0x5D_6DCB);
/// Flash CRC polynomial of the XFE family bootrom.
static CRC_24_XFE: Algorithm<u32> = crc24_algorithm(0x86_4CFB);
/// Flash CRC polynomial of the KF family bootrom.
static CRC_24_KF: Algorithm<u32> = crc24_algorithm(0x32_8B63);

fn crc24(algorithm: &'static Algorithm<u32>, words: &[u16]) -> u32 {
    let crc = Crc::<u32>::new(algorithm);
    let mut digest = crc.digest();
    for word in words {
        digest.update(&word.to_be_bytes());
    }
    digest.finalize()
}

/// 24-bit flash CRC, bootrom variant A.
pub fn crc24_bootrom(words: &[u16]) -> u32 {
    crc24(&CRC_24_BOOTROM, words)
}

/// 24-bit flash CRC, XFE bootrom variant.
pub fn crc24_xfe(words: &[u16]) -> u32 {
    crc24(&CRC_24_XFE, words)
}

/// 24-bit flash CRC, KF bootrom variant.
pub fn crc24_kf(words: &[u16]) -> u32 {
    crc24(&CRC_24_KF, words)
}

/// Page checksum carried in the low byte of every page frame header:
/// ones' complement of the end-around-carry sum of the page words.
pub fn page_checksum(words: &[u16]) -> u16 {
    let mut sum: u32 = words.iter().map(|w| u32::from(*w)).sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // AUG-CCITT catalog check input/value.
        assert_eq!(crc16(b"123456789"), 0xE5CC);
    }

    #[test]
    fn crc24_variants_disagree() {
        let words = [0x1234u16, 0x5678, 0x9ABC, 0xDEF0];
        let a = crc24_bootrom(&words);
        let xfe = crc24_xfe(&words);
        let kf = crc24_kf(&words);
        assert!(a <= 0xFF_FFFF && xfe <= 0xFF_FFFF && kf <= 0xFF_FFFF);
        assert_ne!(a, xfe);
        assert_ne!(a, kf);
        assert_ne!(xfe, kf);
    }

    #[test]
    fn crc24_of_nothing_is_the_init_value() {
        assert_eq!(crc24_bootrom(&[]), 1);
    }

    #[test]
    fn page_checksum_folds_carries() {
        assert_eq!(page_checksum(&[]), 0xFFFF);
        assert_eq!(page_checksum(&[0x0001]), 0xFFFE);
        // 0xFFFF + 0x0001 wraps with end-around carry to 0x0001.
        assert_eq!(page_checksum(&[0xFFFF, 0x0001]), 0xFFFE);
    }
}
