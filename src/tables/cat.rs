//! Conditional access table parser plus the EMM lookup helpers.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::desc::{ca_system, dump_descriptors, find_ca_descriptor, CaSystem};
use crate::section::Section;
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};

/// Conditional access table accumulator.
#[derive(Default)]
pub struct Cat {
    pub(crate) state: TableState,
    /// The descriptor blob of the section body, typically CA descriptors.
    pub program_info: Vec<u8>,
}

impl TableParser for Cat {
    const PID: Option<u16> = None;
    const NAME: &'static str = "CAT";

    fn accepts_table_id(table_id: u8) -> bool {
        table_id == 0x01
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.program_info.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        self.program_info = self.state.section.data().to_vec();
        self.state.section.crc_check(Self::NAME)
    }
}

impl Cat {
    /// Allocates an empty accumulator.
    pub fn new() -> Cat {
        Cat::default()
    }

    /// Feeds one TS packet; returns self for chaining.
    pub fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) -> &mut Self {
        push_section_packet(self, packet);
        self
    }

    /// True once a complete CRC-valid table is held.
    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    /// The underlying section accumulator.
    pub fn section(&self) -> &Section {
        &self.state.section
    }

    /// Finds the EMM carrier for a CA system: `(CA id, CA PID)`.
    pub fn emm_info(&self, req: CaSystem) -> Option<(u16, u16)> {
        find_ca_descriptor(&self.program_info, |ca_id, _| ca_system(ca_id) == req)
    }

    /// Finds the EMM PID registered for an exact CA id.
    pub fn emm_pid_by_caid(&self, caid: u16) -> Option<u16> {
        find_ca_descriptor(&self.program_info, |ca_id, _| ca_id == caid).map(|(_, pid)| pid)
    }

    /// Finds the CA id that owns an EMM PID.
    pub fn emm_caid_by_pid(&self, pid: u16) -> Option<u16> {
        find_ca_descriptor(&self.program_info, |_, ca_pid| ca_pid == pid).map(|(id, _)| id)
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8;

        secdata[curpos..curpos + self.program_info.len()].copy_from_slice(&self.program_info);
        curpos += self.program_info.len();

        crc32::write_section_crc(&mut secdata, curpos);
        curpos += 4;

        Section::gen_ts_packets(&self.state.ts_header(), &secdata[..curpos], section.pointer_field)
    }

    /// Re-feeds the retained packets through a fresh accumulator.
    pub fn copy(&self) -> Option<Cat> {
        let mut new = Cat::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying CAT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Cat) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "CAT (tspacket->struct)",
                copy.section().packets_bytes(),
                self.section().packets_bytes(),
            );
        }
        let packets = self.generate();
        if packets.len() != self.section().num_packets() {
            info!(
                "ERROR: num_packets:{} != sec->num_packets:{}",
                packets.len(),
                self.section().num_packets()
            );
        }
        let flat: Vec<u8> = packets.iter().flat_map(|p| p.iter().copied()).collect();
        compare_data("CAT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();
        if !self.program_info.is_empty() {
            info!("  * Descriptor dump:");
            dump_descriptors(&self.program_info);
        }
        self.check_generator();
    }
}

impl SectionTable for Cat {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Cat::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Cat::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Cat::generate(self)
    }

    fn dump(&self) {
        Cat::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TsHeader;
    use crate::section::SectionHeaderBits;

    /// Builds a single-packet CAT section carrying `descriptors` on `pid`.
    fn cat_packet(pid: u16, descriptors: &[u8]) -> [u8; TS_PACKET_SIZE] {
        let section_length = (5 + descriptors.len() + 4) as u16;
        let mut section = vec![0_u8; 3 + section_length as usize];
        let head = SectionHeaderBits::new()
            .with_table_id(0x01)
            .with_section_syntax_indicator(true)
            .with_reserved(3)
            .with_section_length(section_length);
        section[0..3].copy_from_slice(&head.into_bytes());
        section[3] = 0xFF; // table id extension
        section[4] = 0xFF;
        section[5] = 0xC1 | (1 << 1); // version 1, current
        section[6] = 0;
        section[7] = 0;
        section[8..8 + descriptors.len()].copy_from_slice(descriptors);
        let crc_at = section.len() - 4;
        crc32::write_section_crc(&mut section, crc_at);

        let hdr = TsHeader {
            pusi: true,
            pid,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        };
        let packets = Section::gen_ts_packets(&hdr, &section, 0);
        packets[0]
    }

    #[test]
    fn parses_and_finds_emm_carriers() {
        let descriptors = [
            0x09, 0x04, 0x0B, 0x00, 0xE1, 0x23, // CONAX EMM on PID 0x123
            0x09, 0x04, 0x06, 0x02, 0xE4, 0x56, // IRDETO EMM on PID 0x456
        ];
        let mut cat = Cat::new();
        cat.push_packet(&cat_packet(0x0001, &descriptors));
        assert!(cat.is_initialized());
        assert_eq!(cat.program_info.len(), descriptors.len());

        assert_eq!(cat.emm_info(CaSystem::Conax), Some((0x0B00, 0x0123)));
        assert_eq!(cat.emm_info(CaSystem::Irdeto), Some((0x0602, 0x0456)));
        assert_eq!(cat.emm_info(CaSystem::Nagra), None);
        assert_eq!(cat.emm_pid_by_caid(0x0602), Some(0x0456));
        assert_eq!(cat.emm_caid_by_pid(0x0123), Some(0x0B00));
    }

    #[test]
    fn regenerates_identical_packets() {
        let descriptors = [0x09, 0x04, 0x18, 0x01, 0xE2, 0x00];
        let packet = cat_packet(0x0001, &descriptors);
        let mut cat = Cat::new();
        cat.push_packet(&packet);
        assert!(cat.is_initialized());
        let packets = cat.generate();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][..], packet[..]);
        assert!(cat.is_same(&cat.copy().unwrap()));
    }
}
