//! Opaque private sections: accumulated and compared as raw bytes, no CRC
//! enforcement, any table id.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::section::Section;
use crate::{compare_data, hex_dump, TS_PACKET_SIZE};
use log::{info, warn};

/// Private section accumulator.
#[derive(Default)]
pub struct PrivateSection {
    pub(crate) state: TableState,
}

impl TableParser for PrivateSection {
    const PID: Option<u16> = None;
    const NAME: &'static str = "PRIVSEC";

    fn accepts_table_id(_table_id: u8) -> bool {
        true
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        // No interpretation and no CRC enforcement
        true
    }
}

impl PrivateSection {
    /// Allocates an empty accumulator.
    pub fn new() -> PrivateSection {
        PrivateSection::default()
    }

    /// Feeds one TS packet; returns self for chaining.
    pub fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) -> &mut Self {
        push_section_packet(self, packet);
        self
    }

    /// True once a complete section is held.
    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    /// The underlying section accumulator.
    pub fn section(&self) -> &Section {
        &self.state.section
    }

    /// Re-emits the retained packet images.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        (0..self.state.section.num_packets())
            .map(|i| *self.state.section.packet(i))
            .collect()
    }

    /// Re-feeds the retained packets through a fresh accumulator.
    pub fn copy(&self) -> Option<PrivateSection> {
        let mut new = PrivateSection::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying private section!");
            None
        }
    }

    /// Compares section length and raw section bytes.
    pub fn is_same(&self, other: &PrivateSection) -> bool {
        self.state.section.section_length == other.state.section.section_length
            && self.state.section.full_data() == other.state.section.full_data()
    }

    /// Logs the section and a hex dump of its body.
    pub fn dump(&self) {
        self.state.section.dump();
        info!(
            "  * Section data:\n{}",
            hex_dump(self.state.section.data(), 16)
        );
        if let Some(copy) = self.copy() {
            compare_data(
                "PRIVSEC (tspacket->struct)",
                copy.section().packets_bytes(),
                self.section().packets_bytes(),
            );
        }
    }
}

impl SectionTable for PrivateSection {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        PrivateSection::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        PrivateSection::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        PrivateSection::generate(self)
    }

    fn dump(&self) {
        PrivateSection::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TsHeader;
    use crate::section::SectionHeaderBits;

    fn private_packets(payload: &[u8]) -> Vec<[u8; TS_PACKET_SIZE]> {
        let section_length = payload.len() as u16;
        let mut section = vec![0_u8; 3 + payload.len()];
        let head = SectionHeaderBits::new()
            .with_table_id(0x8A)
            .with_section_syntax_indicator(false)
            .with_private_indicator(true)
            .with_reserved(3)
            .with_section_length(section_length);
        section[0..3].copy_from_slice(&head.into_bytes());
        section[3..].copy_from_slice(payload);

        let hdr = TsHeader {
            pusi: true,
            pid: 0x0100,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        };
        Section::gen_ts_packets(&hdr, &section, 0)
    }

    #[test]
    fn accumulates_without_crc() {
        let payload: Vec<u8> = (0..100).collect();
        let packets = private_packets(&payload);
        let mut privsec = PrivateSection::new();
        for packet in &packets {
            privsec.push_packet(packet);
        }
        assert!(privsec.is_initialized());
        assert_eq!(privsec.section().table_id, 0x8A);
        assert_eq!(privsec.section().data(), &payload[..]);
        assert!(privsec.is_same(&privsec.copy().unwrap()));
    }

    #[test]
    fn multi_packet_private_section() {
        let payload: Vec<u8> = (0..=255).cycle().take(300).map(|b| b as u8).collect();
        let packets = private_packets(&payload);
        assert!(packets.len() > 1);
        let mut privsec = PrivateSection::new();
        for packet in &packets {
            privsec.push_packet(packet);
        }
        assert!(privsec.is_initialized());
        assert_eq!(privsec.section().data(), &payload[..]);
    }
}
