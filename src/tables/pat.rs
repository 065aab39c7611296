//! Program association table parser and generator.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::packet::TsHeader;
use crate::section::{Section, SectionFields};
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};
use modular_bitfield_msb::prelude::*;

const MAX_PROGRAMS: usize = 128;

/// Wire layout of one PAT entry.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PatEntryBits {
    pub program_num: B16,
    pub reserved: B3,
    pub pid: B13,
}

/// One association: program number to PMT PID. Program number 0 names the
/// NIT PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    /// Program number.
    pub program: u16,
    /// Three reserved bits.
    pub reserved: u8,
    /// PMT (or NIT) PID.
    pub pid: u16,
}

/// Program association table accumulator/builder.
#[derive(Default)]
pub struct Pat {
    pub(crate) state: TableState,
    /// Programs in section order, unique by program number.
    pub programs: Vec<PatProgram>,
}

impl TableParser for Pat {
    const PID: Option<u16> = Some(0x0000);
    const NAME: &'static str = "PAT";

    fn accepts_table_id(table_id: u8) -> bool {
        table_id == 0x00
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.programs.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        let mut programs = Vec::with_capacity(self.state.section.data_len() / 4);
        for chunk in self.state.section.data().chunks_exact(4) {
            if programs.len() >= MAX_PROGRAMS {
                warn!(
                    "PAT contains too many programs (>{}), not all are initialized!",
                    MAX_PROGRAMS
                );
                break;
            }
            let bits = PatEntryBits::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            programs.push(PatProgram {
                program: bits.program_num(),
                reserved: bits.reserved(),
                pid: bits.pid(),
            });
        }
        self.programs = programs;
        self.state.section.crc_check(Self::NAME)
    }
}

impl Pat {
    /// Allocates an empty accumulator.
    pub fn new() -> Pat {
        Pat::default()
    }

    /// Builds an empty PAT ready for generation.
    pub fn init(transport_stream_id: u16) -> Pat {
        let mut pat = Pat::new();
        pat.state.held = Some(TsHeader {
            pid: 0x0000,
            pusi: true,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        });
        pat.state.section.begin(&SectionFields {
            table_id: 0x00,
            section_syntax_indicator: true,
            private_indicator: false,
            reserved1: 3,
            section_length: 9, // Empty section
            id_number: transport_stream_id,
            reserved2: 3,
            version_number: 1,
            current_next_indicator: true,
            ..SectionFields::default()
        });
        pat.state.initialized = true;
        pat.regenerate_packets();
        pat
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

    /// Adds a program association. Duplicate program numbers are refused.
    /// Bumps the version number and grows the section by one entry.
    pub fn add_program(&mut self, program: u16, pid: u16) -> bool {
        if self.programs.len() >= MAX_PROGRAMS {
            return false;
        }
        if self.programs.iter().any(|prg| prg.program == program) {
            warn!("!!! Program 0x{:04x} ({}) already exists in PAT!", program, program);
            return false;
        }

        let section = &mut self.state.section;
        section.version_number = (section.version_number + 1) & 0x1F;
        section.section_length += 4;

        self.programs.push(PatProgram {
            program,
            reserved: 7,
            pid,
        });
        self.regenerate_packets();
        true
    }

    /// Deletes a program association, compacting the list.
    pub fn del_program(&mut self, program: u16) -> bool {
        let pos = match self.programs.iter().position(|prg| prg.program == program) {
            Some(pos) => pos,
            None => return false,
        };
        warn!("!!! Found program 0x{:04x} ({}) for deleting.", program, program);
        self.programs.remove(pos);

        let section = &mut self.state.section;
        section.version_number = (section.version_number + 1) & 0x1F;
        section.section_length -= 4;

        self.regenerate_packets();
        true
    }

    /// True for PIDs that carry PSI: the reserved low range, SDT/EIT/RST/
    /// TDT, and every PMT PID this PAT names.
    pub fn is_psi_pid(&self, pid: u16) -> bool {
        if pid < 0x10 || pid == 0x11 || pid == 0x12 || pid == 0x13 || pid == 0x14 {
            return true;
        }
        self.programs.iter().any(|prg| prg.pid == pid)
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8; // First data byte follows the extended header

        for prg in &self.programs {
            let bits = PatEntryBits::new()
                .with_program_num(prg.program)
                .with_reserved(prg.reserved & 0x7)
                .with_pid(prg.pid & 0x1FFF);
            secdata[curpos..curpos + 4].copy_from_slice(&bits.into_bytes());
            curpos += 4;
        }
        crc32::write_section_crc(&mut secdata, curpos);
        curpos += 4;

        Section::gen_ts_packets(&self.state.ts_header(), &secdata[..curpos], section.pointer_field)
    }

    fn regenerate_packets(&mut self) {
        let packets = self.generate();
        self.state.section.set_packets(&packets);
    }

    /// Re-feeds the retained packets through a fresh accumulator.
    pub fn copy(&self) -> Option<Pat> {
        let mut new = Pat::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying PAT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Pat) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "PAT (tspacket->struct)",
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
        compare_data("PAT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();

        info!("  * PAT data");
        info!("    * num_programs: {}", self.programs.len());
        for (i, prg) in self.programs.iter().enumerate() {
            info!(
                "      * [{:02}/{:02}]: Program No 0x{:04x} ({:5}) -> PID {:04x} ({}) /res: 0x{:02x}/",
                i + 1,
                self.programs.len(),
                prg.program,
                prg.program,
                prg.pid,
                prg.pid,
                prg.reserved
            );
            // Program number 0 is the network PID, not a program
            if prg.program == 0 {
                info!("      - NIT PID {:04x} ({})", prg.pid, prg.pid);
            }
        }

        self.check_generator();
    }
}

impl SectionTable for Pat {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Pat::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Pat::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Pat::generate(self)
    }

    fn dump(&self) {
        Pat::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_add_del_round_trip() {
        let mut pat = Pat::init(0x7878);
        assert!(pat.add_program(1, 0x100));
        assert!(pat.add_program(2, 0x100));
        assert!(pat.add_program(3, 0x100));
        assert!(pat.del_program(2));

        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.programs[0].program, 1);
        assert_eq!(pat.programs[0].pid, 0x100);
        assert_eq!(pat.programs[1].program, 3);
        assert_eq!(pat.programs[1].pid, 0x100);
        // 9 bytes empty section + 4 per remaining program
        assert_eq!(pat.section().section_length, 17);
        // Seeded at 1, bumped by three adds and one delete
        assert_eq!(pat.section().version_number, 5);

        // The regenerated section carries a well-formed CRC
        let copy = pat.copy().expect("copy re-parses");
        assert!(copy.section().crc_check("PAT"));
        assert_eq!(copy.programs, pat.programs);
        assert_eq!(copy.section().id_number, 0x7878);
    }

    #[test]
    fn duplicate_program_refused() {
        let mut pat = Pat::init(1);
        assert!(pat.add_program(7, 0x200));
        let length = pat.section().section_length;
        let version = pat.section().version_number;
        assert!(!pat.add_program(7, 0x300));
        assert_eq!(pat.section().section_length, length);
        assert_eq!(pat.section().version_number, version);
    }

    #[test]
    fn generation_is_deterministic_and_byte_exact() {
        let mut pat = Pat::init(0x0042);
        pat.add_program(0, 0x0010); // NIT
        pat.add_program(1, 0x0100);
        pat.add_program(2, 0x0101);

        let first = pat.generate();
        let second = pat.generate();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);

        let mut replayed = Pat::new();
        for packet in &first {
            replayed.push_packet(packet);
        }
        assert!(replayed.is_initialized());
        assert_eq!(replayed.generate(), first);
        assert!(replayed.is_same(&replayed.copy().unwrap()));
    }

    #[test]
    fn wrong_pid_and_table_id_ignored() {
        let mut pat = Pat::init(1);
        pat.add_program(1, 0x100);
        let packets = pat.generate();

        // Re-address the packet to a different PID
        let mut wrong_pid = packets[0];
        wrong_pid[1] = (wrong_pid[1] & 0xE0) | 0x01;
        let mut fresh = Pat::new();
        fresh.push_packet(&wrong_pid);
        assert!(!fresh.is_initialized());

        // Corrupt the table id; the accumulator must discard the packet
        let mut wrong_table = packets[0];
        wrong_table[5] = 0x02;
        let mut fresh = Pat::new();
        fresh.push_packet(&wrong_table);
        assert!(!fresh.is_initialized());
    }

    #[test]
    fn corrupted_crc_resets_table() {
        let mut pat = Pat::init(1);
        pat.add_program(1, 0x100);
        let mut packets = pat.generate();
        // Flip one payload bit; CRC check must reject the section
        packets[0][12] ^= 0x01;
        let mut fresh = Pat::new();
        fresh.push_packet(&packets[0]);
        assert!(!fresh.is_initialized());
        assert!(fresh.programs.is_empty());
    }

    #[test]
    fn psi_pid_classification() {
        let mut pat = Pat::init(1);
        pat.add_program(1, 0x100);
        assert!(pat.is_psi_pid(0x0000));
        assert!(pat.is_psi_pid(0x0011));
        assert!(pat.is_psi_pid(0x0100));
        assert!(!pat.is_psi_pid(0x0200));
    }
}
