// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Error type and the stable error codes reported by the bootloader.

use std::io;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

/// Errors that can be emitted by the bootloader and related functions.
///
/// The variants that correspond to a bootloader action outcome carry a
/// stable numeric code (see [`Error::code`]); scripts built on top of the
/// CLI rely on those values not changing.
#[derive(Debug, Error)]
pub enum Error {
    /// Catch-all for failures without a more specific classification.
    #[error("unknown error")]
    Unknown,
    /// Resource or logic failure inside the host tool itself.
    #[error("internal error: {0}")]
    Internal(String),
    /// The requested bitrate could not be applied to the line.
    #[error("failed setting new bitrate")]
    SetBitrate,
    /// The enter-PPM pulse pattern could not be transmitted.
    #[error("failed entering ppm mode")]
    EnterPpm,
    /// The calibration frame could not be transmitted.
    #[error("failed sending calibration frame")]
    Calibration,
    /// The unlock session got no (or an invalid) acknowledge.
    #[error("failed unlocking session mode")]
    Unlock,
    /// The project id reported by the chip is not in the catalog, or the
    /// catalog entry carries no PPM bootloader record.
    #[error("connected chip is not supported")]
    ChipNotSupported,
    /// The chip does not support the requested memory/action combination.
    #[error("action is not supported")]
    ActionNotSupported,
    /// The HEX image could not be parsed.
    #[error("hex image could not be read: {0}")]
    InvalidHex(String),
    /// The HEX image carries no data for the addressed memory.
    #[error("no data for the memory in the hex image")]
    MissingData,
    /// A programming session did not complete.
    #[error("programming failed")]
    ProgrammingFailed,
    /// The CRC reported by the chip does not match the image.
    #[error("verification failed")]
    VerifyFailed,
    /// A precondition on caller-supplied arguments failed before any wire
    /// activity took place.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// The platform pulse channel reported a failure.
    #[error("line error: {0}")]
    Line(String),
    /// A session ran to completion without an acceptable acknowledge.
    #[error("session failed: {0}")]
    Session(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Stable numeric code for this error.
    ///
    /// Variants without a dedicated code map onto the generic failure codes
    /// (`-1` unknown, `-2` internal).
    pub fn code(&self) -> i32 {
        match self {
            Error::Unknown | Error::Line(_) | Error::Session(_) => -1,
            Error::Internal(_) | Error::InvalidArg(_) | Error::Io(_) => -2,
            Error::SetBitrate => -16,
            Error::EnterPpm => -17,
            Error::Calibration => -18,
            Error::Unlock => -19,
            Error::ChipNotSupported => -20,
            Error::ActionNotSupported => -21,
            Error::InvalidHex(_) => -22,
            Error::MissingData => -23,
            Error::ProgrammingFailed => -24,
            Error::VerifyFailed => -25,
        }
    }
}

const ERROR_CODE_NAMES: &[(i32, &str)] = &[
    (0, "operation was successful"),
    (-1, "unknown error"),
    (-2, "internal error"),
    (-16, "failed setting new baudrate"),
    (-17, "failed entering ppm mode"),
    (-18, "failed sending calibration frame"),
    (-19, "failed unlocking session mode"),
    (-20, "connected chip is not supported"),
    (-21, "action is not supported"),
    (-22, "hex file could not be read"),
    (-23, "no data for the memory in the hex file"),
    (-24, "programming failed"),
    (-25, "verification failed"),
];

/// Looks up the human-readable message for a stable error code.
pub fn describe(code: i32) -> &'static str {
    ERROR_CODE_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or("unrecognized error code")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Unknown.code(), -1);
        assert_eq!(Error::SetBitrate.code(), -16);
        assert_eq!(Error::EnterPpm.code(), -17);
        assert_eq!(Error::Calibration.code(), -18);
        assert_eq!(Error::Unlock.code(), -19);
        assert_eq!(Error::ChipNotSupported.code(), -20);
        assert_eq!(Error::ActionNotSupported.code(), -21);
        assert_eq!(Error::InvalidHex(String::new()).code(), -22);
        assert_eq!(Error::MissingData.code(), -23);
        assert_eq!(Error::ProgrammingFailed.code(), -24);
        assert_eq!(Error::VerifyFailed.code(), -25);
    }

    #[test]
    fn every_code_has_a_message() {
        assert_eq!(describe(0), "operation was successful");
        assert_eq!(describe(-25), "verification failed");
        assert_eq!(describe(42), "unrecognized error code");
    }
}
