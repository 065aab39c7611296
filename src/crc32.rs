//! CRC-32/MPEG-2 for section integrity.
//!
//! Polynomial 0x04C11DB7, register initialised to 0xFFFFFFFF, left shifting,
//! no final XOR. A section that carries a correct trailing CRC hashes to
//! zero when the CRC bytes are included in the computation.

use crc::{Crc, CRC_32_MPEG_2};
use log::warn;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the CRC-32/MPEG-2 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// Computes the CRC over `buf[..len]` and stores it big-endian at
/// `buf[len..len + 4]`. Returns the computed CRC.
pub fn write_section_crc(buf: &mut [u8], len: usize) -> u32 {
    let crc = crc32(&buf[..len]);
    buf[len..len + 4].copy_from_slice(&crc.to_be_bytes());
    crc
}

/// Verifies the trailing CRC of a complete section (header through CRC
/// bytes). Logs a diagnostic naming `table` on mismatch.
pub fn section_crc_check(section_bytes: &[u8], table: &str) -> bool {
    if section_bytes.len() < 4 {
        warn!("!!! {} section too short for CRC check", table);
        return false;
    }
    let check_crc = crc32(section_bytes);
    if check_crc != 0 {
        let stored = u32::from_be_bytes([
            section_bytes[section_bytes.len() - 4],
            section_bytes[section_bytes.len() - 3],
            section_bytes[section_bytes.len() - 2],
            section_bytes[section_bytes.len() - 1],
        ]);
        warn!(
            "!!! Wrong {} table CRC! It should be 0 but it is 0x{:08x} (CRC in data is 0x{:08x})",
            table, check_crc, stored
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // CRC-32/MPEG-2 of "123456789" is 0x0376E6E7.
        assert_eq!(crc32(b"123456789"), 0x0376E6E7);
    }

    #[test]
    fn appended_crc_hashes_to_zero() {
        let mut buf = [0_u8; 16];
        buf[..12].copy_from_slice(b"section body");
        write_section_crc(&mut buf, 12);
        assert_eq!(crc32(&buf), 0);
        assert!(section_crc_check(&buf, "TEST"));
    }

    #[test]
    fn single_bit_flips_are_detected() {
        let mut buf = vec![0xA5_u8; 20];
        let len = buf.len() - 4;
        write_section_crc(&mut buf, len);
        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut corrupt = buf.clone();
                corrupt[byte] ^= 1 << bit;
                assert_ne!(crc32(&corrupt), 0, "flip at byte {} bit {}", byte, bit);
            }
        }
    }
}
