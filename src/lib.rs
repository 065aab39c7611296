//! Library for parsing and generating MPEG transport stream PSI/SI tables
//! and packetized elementary streams (PES).
//!
//! Tables are fed 188-byte TS packets through their `push_packet` entry
//! points until they report themselves initialized, may then be mutated
//! through their builder methods, and can be re-serialized into TS packets
//! that round-trip byte-for-byte. Covered tables: PAT, CAT, PMT, NIT, SDT,
//! EIT, TDT/TOT and opaque private sections.
//!
//! Diagnostics are emitted through the [`log`] facade; install any `log`
//! sink (`pretty_env_logger`, `env_logger`, ...) to capture them.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! dvbsi-io = "~0.1.0"
//! ```

#![allow(unused)]
#![deny(unsafe_code)]

use std::result;

mod slice_reader;
pub use slice_reader::SliceReader;

pub mod crc32;
pub mod desc;
pub mod es;
pub mod packet;
pub mod pes;
pub mod section;
pub mod tables;
pub mod time;

pub use packet::{AdaptationFieldHeader, PacketHeader, PcrTimestamp, ScrambleControl, TsHeader};
pub use pes::{Pes, PesDemux};
pub use section::Section;
pub use tables::{Cat, Eit, Nit, Pat, Pmt, PrivateSection, Sdt, SectionTable, SiTable, Tdt};

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;
/// Maximum payload bytes a packet can carry (only the fixed header removed).
pub const TS_MAX_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

/// Errors that may be encountered while parsing transport stream structures.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorDetails {
    /// Encountered when a [`SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    /// This is the error when encountering any other value.
    LostSync,
    /// Encountered for inconsistent adaptation field parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent section header parses.
    BadSectionHeader,
    /// Encountered for inconsistent PES header parses.
    BadPesHeader,
    /// Encountered when a section fails its CRC check.
    CrcMismatch {
        /// CRC computed over the whole section; zero for a valid section.
        computed: u32,
        /// CRC stored in the trailing four section bytes.
        stored: u32,
    },
}

/// Error type encapsulating all possible parser errors.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// Expands to [`format_args`] for a 90kHz timestamp of any integer type.
///
/// Format is <hours>:<minutes>:<seconds>:<90kHz-ticks>
///
/// # Example
///
/// ```
/// use dvbsi_io::pts_format_args;
/// assert_eq!(std::fmt::format(pts_format_args!(900000)), "0:0:10:0");
/// ```
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Renders a byte slice as space-separated hex octets, `col` columns per
/// line (0 for a single line).
pub fn hex_dump(data: &[u8], col: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        let sep = if col != 0 && i % col == col - 1 { '\n' } else { ' ' };
        let _ = write!(out, "{:02x}{}", b, sep);
    }
    out
}

pub(crate) fn compare_data(prefix: &str, a: &[u8], b: &[u8]) {
    if a == b {
        log::info!("   **** {} generator is correct ****", prefix);
        return;
    }
    for i in 0..a.len().min(b.len()) {
        log::info!(
            "{:03} - {:02x} {:02x} | {}",
            i,
            a[i],
            b[i],
            if a[i] == b[i] { "ok" } else { "err" }
        );
    }
    if a.len() != b.len() {
        log::info!("{}: length mismatch {} vs {}", prefix, a.len(), b.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_formats_octets() {
        assert_eq!(hex_dump(&[0x47, 0x1f, 0xff], 0), "47 1f ff ");
    }
}
