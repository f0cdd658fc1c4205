// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Catalog of supported parts: memory maps, programming timings and key
//! material, indexed by the project id the chip reports during unlock.

use crate::crc;
use crate::crc::FlashCrcFn;

/// One programmable memory region of a part.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// First byte address of the region.
    pub start: u32,
    /// Total length in bytes.
    pub length: u32,
    /// Writeable length in bytes, at most `length`.
    pub writeable: u32,
    /// Page size in bytes.
    pub page: u32,
    /// Erase granularity in bytes.
    pub erase_unit: u32,
    /// Time to erase one erase unit [ms].
    pub erase_time: u32,
    /// Time to write one page [ms].
    pub write_time: u32,
}

impl MemoryLayout {
    /// Page size in 16-bit words, as carried in session frames.
    pub fn page_words(&self) -> u8 {
        (self.page / 2) as u8
    }

    /// Last byte address of the region.
    pub fn end(&self) -> u32 {
        self.start + self.length - 1
    }

    /// Last writeable byte address of the region.
    pub fn writeable_end(&self) -> u32 {
        self.start + self.writeable - 1
    }
}

/// PPM bootloader record of a part. Absent for parts whose bootrom only
/// speaks other protocols.
#[derive(Debug, Clone, Copy)]
pub struct PpmLoader {
    /// Programming keys transferred before any flash/EEPROM write session,
    /// when the part requires them.
    pub prog_keys: Option<&'static [u16]>,
    /// Whether the bootrom implements the flash-CS programming session.
    pub flash_cs_programming: bool,
    /// Whether the bootrom implements the EEPROM CRC session.
    pub eeprom_verification: bool,
    /// Flash CRC routine of this family's bootrom.
    pub flash_crc: FlashCrcFn,
}

/// A supported part.
#[derive(Debug, Clone, Copy)]
pub struct Chip {
    pub name: &'static str,
    /// Family identifier reported by unlock and chip-reset.
    pub project_id: u16,
    pub flash: MemoryLayout,
    pub flash_cs: MemoryLayout,
    pub nv_memory: MemoryLayout,
    pub ppm: Option<PpmLoader>,
}

static GANYMEDE_PROG_KEYS: [u16; 8] = [
    0x5F3A, 0x1CE9, 0x8B07, 0xA44D, 0x0F26, 0xD581, 0x6E9C, 0x23B8,
];

static CHIPS: [Chip; 3] = [
    Chip {
        name: "amalthea",
        project_id: 0x4D32,
        flash: MemoryLayout {
            start: 0x4000,
            length: 0x8000,
            writeable: 0x8000,
            page: 128,
            erase_unit: 0x8000,
            erase_time: 80,
            write_time: 8,
        },
        flash_cs: MemoryLayout {
            start: 0x1000,
            length: 0x400,
            writeable: 0x380,
            page: 128,
            erase_unit: 128,
            erase_time: 40,
            write_time: 5,
        },
        nv_memory: MemoryLayout {
            start: 0x0800,
            length: 0x200,
            writeable: 0x180,
            page: 8,
            erase_unit: 8,
            erase_time: 4,
            write_time: 12,
        },
        ppm: Some(PpmLoader {
            prog_keys: None,
            flash_cs_programming: true,
            eeprom_verification: true,
            flash_crc: crc::crc24_bootrom,
        }),
    },
    Chip {
        name: "ganymede-xfe",
        project_id: 0x3A10,
        flash: MemoryLayout {
            start: 0x4000,
            length: 0x1_0000,
            writeable: 0x1_0000,
            page: 128,
            erase_unit: 0x1000,
            erase_time: 6,
            write_time: 8,
        },
        flash_cs: MemoryLayout {
            start: 0x1000,
            length: 0x800,
            writeable: 0x700,
            page: 128,
            erase_unit: 128,
            erase_time: 40,
            write_time: 5,
        },
        nv_memory: MemoryLayout {
            start: 0x0800,
            length: 0x400,
            writeable: 0x300,
            page: 8,
            erase_unit: 8,
            erase_time: 4,
            write_time: 12,
        },
        ppm: Some(PpmLoader {
            prog_keys: Some(&GANYMEDE_PROG_KEYS),
            flash_cs_programming: true,
            eeprom_verification: false,
            flash_crc: crc::crc24_xfe,
        }),
    },
    Chip {
        name: "ganymede-kf",
        project_id: 0x3A11,
        flash: MemoryLayout {
            start: 0x4000,
            length: 0x1_0000,
            writeable: 0x1_0000,
            page: 128,
            erase_unit: 0x1000,
            erase_time: 6,
            write_time: 8,
        },
        flash_cs: MemoryLayout {
            start: 0x1000,
            length: 0x800,
            writeable: 0x700,
            page: 128,
            erase_unit: 128,
            erase_time: 40,
            write_time: 5,
        },
        nv_memory: MemoryLayout {
            start: 0x0800,
            length: 0x400,
            writeable: 0x300,
            page: 8,
            erase_unit: 8,
            erase_time: 4,
            write_time: 12,
        },
        ppm: Some(PpmLoader {
            prog_keys: Some(&GANYMEDE_PROG_KEYS),
            flash_cs_programming: false,
            eeprom_verification: true,
            flash_crc: crc::crc24_kf,
        }),
    },
];

/// All parts the tool knows about.
pub fn catalog() -> &'static [Chip] {
    &CHIPS
}

/// Looks up a part by the project id it reported.
pub fn by_project_id(project_id: u16) -> Option<&'static Chip> {
    CHIPS.iter().find(|chip| chip.project_id == project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_project_id() {
        assert_eq!(by_project_id(0x4D32).unwrap().name, "amalthea");
        assert!(by_project_id(0x0000).is_none());
    }

    #[test]
    fn catalog_is_consistent() {
        for chip in catalog() {
            for memory in [&chip.flash, &chip.flash_cs, &chip.nv_memory] {
                assert!(memory.writeable <= memory.length, "{}", chip.name);
                assert_eq!(memory.length % memory.page, 0, "{}", chip.name);
                assert!(u32::from(memory.page_words()) * 2 == memory.page);
            }
            if let Some(loader) = &chip.ppm {
                if let Some(keys) = loader.prog_keys {
                    // Keys are paged in 8-word pages by the key session.
                    assert_eq!(keys.len() % 8, 0, "{}", chip.name);
                }
            }
        }
    }
}
