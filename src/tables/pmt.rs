//! Program map table parser and generator plus the ECM lookup helpers.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::desc::{
    ca_system, dump_descriptors, find_ca_descriptor, h222_stream_type_desc, CaSystem,
};
use crate::section::Section;
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};
use modular_bitfield_msb::prelude::*;

const MAX_STREAMS: usize = 128;

/// Wire layout of the fixed 4-byte PMT prefix.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PmtHeaderBits {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    pub program_info_length: B12,
}

/// Wire layout of one elementary stream entry header.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct EsInfoBits {
    pub stream_type: B8,
    pub reserved: B3,
    pub pid: B13,
    pub reserved2: B4,
    pub es_info_length: B12,
}

/// One elementary stream of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// H.222.0 stream type.
    pub stream_type: u8,
    /// Three reserved bits.
    pub reserved1: u8,
    /// Elementary stream PID.
    pub pid: u16,
    /// Four reserved bits.
    pub reserved2: u8,
    /// ES_info descriptor blob.
    pub es_info: Vec<u8>,
}

/// Program map table accumulator.
#[derive(Default)]
pub struct Pmt {
    pub(crate) state: TableState,
    /// Three reserved bits before the PCR PID.
    pub reserved1: u8,
    /// PID carrying the program clock reference.
    pub pcr_pid: u16,
    /// Four reserved bits before the program info length.
    pub reserved2: u8,
    /// Program-level descriptor blob.
    pub program_info: Vec<u8>,
    /// Elementary streams in section order.
    pub streams: Vec<PmtStream>,
}

impl TableParser for Pmt {
    const PID: Option<u16> = None;
    const NAME: &'static str = "PMT";

    fn accepts_table_id(table_id: u8) -> bool {
        table_id == 0x02
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.reserved1 = 0;
        self.pcr_pid = 0;
        self.reserved2 = 0;
        self.program_info.clear();
        self.streams.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        let data = self.state.section.data();
        if data.len() < 4 {
            warn!("PMT section body too short ({} bytes)", data.len());
            return false;
        }
        let head = PmtHeaderBits::from_bytes([data[0], data[1], data[2], data[3]]);
        let program_info_len = head.program_info_length() as usize;
        if 4 + program_info_len > data.len() {
            warn!("PMT program_info overruns the section");
            return false;
        }

        let reserved1 = head.reserved();
        let pcr_pid = head.pcr_pid();
        let reserved2 = head.reserved2();
        let program_info = data[4..4 + program_info_len].to_vec();

        let mut streams = Vec::new();
        let mut stream_data = &data[4 + program_info_len..];
        while stream_data.len() >= 5 {
            if streams.len() >= MAX_STREAMS {
                warn!(
                    "PMT contains too many streams (>{}), not all are initialized!",
                    MAX_STREAMS
                );
                break;
            }
            let entry = EsInfoBits::from_bytes([
                stream_data[0],
                stream_data[1],
                stream_data[2],
                stream_data[3],
                stream_data[4],
            ]);
            let es_info_len = entry.es_info_length() as usize;
            if 5 + es_info_len > stream_data.len() {
                warn!("PMT ES_info overruns the section");
                break;
            }
            streams.push(PmtStream {
                stream_type: entry.stream_type(),
                reserved1: entry.reserved(),
                pid: entry.pid(),
                reserved2: entry.reserved2(),
                es_info: stream_data[5..5 + es_info_len].to_vec(),
            });
            stream_data = &stream_data[5 + es_info_len..];
        }

        self.reserved1 = reserved1;
        self.pcr_pid = pcr_pid;
        self.reserved2 = reserved2;
        self.program_info = program_info;
        self.streams = streams;
        self.state.section.crc_check(Self::NAME)
    }
}

impl Pmt {
    /// Allocates an empty accumulator.
    pub fn new() -> Pmt {
        Pmt::default()
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

    /// The elementary stream entry on `pid`, if any.
    pub fn stream_by_pid(&self, pid: u16) -> Option<&PmtStream> {
        self.streams.iter().find(|stream| stream.pid == pid)
    }

    /// Finds the ECM carrier for a CA system, scanning the program info
    /// first and each stream's ES_info after: `(CA id, CA PID)`.
    pub fn ecm_info(&self, req: CaSystem) -> Option<(u16, u16)> {
        self.find_ca(|ca_id, _| ca_system(ca_id) == req)
    }

    /// Finds the ECM PID registered for an exact CA id.
    pub fn ecm_pid_by_caid(&self, caid: u16) -> Option<u16> {
        self.find_ca(|ca_id, _| ca_id == caid).map(|(_, pid)| pid)
    }

    /// Finds the CA id that owns an ECM PID.
    pub fn ecm_caid_by_pid(&self, pid: u16) -> Option<u16> {
        self.find_ca(|_, ca_pid| ca_pid == pid).map(|(id, _)| id)
    }

    fn find_ca<F>(&self, matches: F) -> Option<(u16, u16)>
    where
        F: Fn(u16, u16) -> bool + Copy,
    {
        if let Some(found) = find_ca_descriptor(&self.program_info, matches) {
            return Some(found);
        }
        self.streams
            .iter()
            .find_map(|stream| find_ca_descriptor(&stream.es_info, matches))
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8;

        let head = PmtHeaderBits::new()
            .with_reserved(self.reserved1 & 0x7)
            .with_pcr_pid(self.pcr_pid & 0x1FFF)
            .with_reserved2(self.reserved2 & 0xF)
            .with_program_info_length((self.program_info.len() as u16) & 0xFFF);
        secdata[curpos..curpos + 4].copy_from_slice(&head.into_bytes());
        curpos += 4;

        secdata[curpos..curpos + self.program_info.len()].copy_from_slice(&self.program_info);
        curpos += self.program_info.len();

        for stream in &self.streams {
            let entry = EsInfoBits::new()
                .with_stream_type(stream.stream_type)
                .with_reserved(stream.reserved1 & 0x7)
                .with_pid(stream.pid & 0x1FFF)
                .with_reserved2(stream.reserved2 & 0xF)
                .with_es_info_length((stream.es_info.len() as u16) & 0xFFF);
            secdata[curpos..curpos + 5].copy_from_slice(&entry.into_bytes());
            curpos += 5;
            secdata[curpos..curpos + stream.es_info.len()].copy_from_slice(&stream.es_info);
            curpos += stream.es_info.len();
        }

        crc32::write_section_crc(&mut secdata, curpos);
        curpos += 4;

        Section::gen_ts_packets(&self.state.ts_header(), &secdata[..curpos], section.pointer_field)
    }

    /// Re-feeds the retained packets through a fresh accumulator.
    pub fn copy(&self) -> Option<Pmt> {
        let mut new = Pmt::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying PMT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Pmt) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "PMT (tspacket->struct)",
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
        compare_data("PMT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();

        info!("  * PMT data");
        info!("    * PCR PID     : {:04x} ({})", self.pcr_pid, self.pcr_pid);
        info!("    * program_len : {}", self.program_info.len());
        info!("    * num_streams : {}", self.streams.len());

        if !self.program_info.is_empty() {
            info!("  * Program info:");
            dump_descriptors(&self.program_info);
        }

        for (i, stream) in self.streams.iter().enumerate() {
            info!(
                "    * [{:02}/{:02}] PID {:04x} ({}) -> Stream type: 0x{:02x} ({}) /es_info_size: {}/ {}",
                i + 1,
                self.streams.len(),
                stream.pid,
                stream.pid,
                stream.stream_type,
                stream.stream_type,
                stream.es_info.len(),
                h222_stream_type_desc(stream.stream_type)
            );
            if !stream.es_info.is_empty() {
                dump_descriptors(&stream.es_info);
            }
        }

        self.check_generator();
    }
}

impl SectionTable for Pmt {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Pmt::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Pmt::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Pmt::generate(self)
    }

    fn dump(&self) {
        Pmt::dump(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::TsHeader;
    use crate::section::SectionHeaderBits;
    use crate::section::SectionSyntaxBits;

    /// Builds a single-packet PMT for tests across the crate.
    pub(crate) fn build_pmt_packet(
        pmt_pid: u16,
        pcr_pid: u16,
        program_info: &[u8],
        streams: &[(u8, u16, &[u8])],
    ) -> [u8; TS_PACKET_SIZE] {
        let streams_len: usize = streams.iter().map(|(_, _, info)| 5 + info.len()).sum();
        let section_length = (5 + 4 + program_info.len() + streams_len + 4) as u16;
        let mut section = vec![0_u8; 3 + section_length as usize];

        let head = SectionHeaderBits::new()
            .with_table_id(0x02)
            .with_section_syntax_indicator(true)
            .with_reserved(3)
            .with_section_length(section_length);
        section[0..3].copy_from_slice(&head.into_bytes());
        let ext = SectionSyntaxBits::new()
            .with_id_number(1)
            .with_reserved(3)
            .with_version_number(1)
            .with_current_next_indicator(true);
        section[3..8].copy_from_slice(&ext.into_bytes());

        let mut pos = 8;
        let prefix = PmtHeaderBits::new()
            .with_reserved(7)
            .with_pcr_pid(pcr_pid)
            .with_reserved2(0xF)
            .with_program_info_length(program_info.len() as u16);
        section[pos..pos + 4].copy_from_slice(&prefix.into_bytes());
        pos += 4;
        section[pos..pos + program_info.len()].copy_from_slice(program_info);
        pos += program_info.len();
        for (stream_type, pid, es_info) in streams {
            let entry = EsInfoBits::new()
                .with_stream_type(*stream_type)
                .with_reserved(7)
                .with_pid(*pid)
                .with_reserved2(0xF)
                .with_es_info_length(es_info.len() as u16);
            section[pos..pos + 5].copy_from_slice(&entry.into_bytes());
            pos += 5;
            section[pos..pos + es_info.len()].copy_from_slice(es_info);
            pos += es_info.len();
        }
        crc32::write_section_crc(&mut section, pos);

        let hdr = TsHeader {
            pusi: true,
            pid: pmt_pid,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        };
        Section::gen_ts_packets(&hdr, &section, 0)[0]
    }

    #[test]
    fn parses_streams_and_descriptors() {
        let ca = [0x09, 0x04, 0x0B, 0x00, 0xE5, 0x00]; // CONAX ECM on PID 0x500
        let audio_lang = [0x0A, 0x04, b'b', b'u', b'l', 0x00];
        let packet = build_pmt_packet(
            0x100,
            0x0201,
            &ca,
            &[(0x02, 0x0201, &[]), (0x04, 0x0202, &audio_lang)],
        );

        let mut pmt = Pmt::new();
        pmt.push_packet(&packet);
        assert!(pmt.is_initialized());
        assert_eq!(pmt.pcr_pid, 0x0201);
        assert_eq!(pmt.program_info, ca);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[0].stream_type, 0x02);
        assert_eq!(pmt.streams[0].pid, 0x0201);
        assert!(pmt.streams[0].es_info.is_empty());
        assert_eq!(pmt.streams[1].es_info, audio_lang);
        assert_eq!(pmt.stream_by_pid(0x0202).unwrap().stream_type, 0x04);
    }

    #[test]
    fn ecm_lookup_covers_program_and_stream_info() {
        let stream_ca = [0x09, 0x04, 0x06, 0x10, 0xE6, 0x00]; // IRDETO on stream
        let packet = build_pmt_packet(0x100, 0x0201, &[], &[(0x02, 0x0201, &stream_ca)]);
        let mut pmt = Pmt::new();
        pmt.push_packet(&packet);
        assert!(pmt.is_initialized());
        assert_eq!(pmt.ecm_info(CaSystem::Irdeto), Some((0x0610, 0x0600)));
        assert_eq!(pmt.ecm_pid_by_caid(0x0610), Some(0x0600));
        assert_eq!(pmt.ecm_caid_by_pid(0x0600), Some(0x0610));
        assert_eq!(pmt.ecm_info(CaSystem::Seca), None);
    }

    #[test]
    fn regenerates_identical_packets() {
        let packet = build_pmt_packet(0x100, 0x0201, &[], &[(0x1B, 0x0201, &[])]);
        let mut pmt = Pmt::new();
        pmt.push_packet(&packet);
        assert!(pmt.is_initialized());
        let packets = pmt.generate();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][..], packet[..]);
        assert!(pmt.is_same(&pmt.copy().unwrap()));
    }
}
