//! PSI/SI section reassembly and fragmentation.
//!
//! A [`Section`] owns two stable buffers: `section_data` holds the section
//! bytes as they are joined from successive TS packets, `packet_data`
//! retains the original packets so a fully assembled table can be re-emitted
//! byte-for-byte. Resetting a section cycles the surrounding state while the
//! buffers keep their identity.

use super::{Error, ErrorDetails, Result, TS_PACKET_SIZE};
use crate::packet::TsHeader;
use crate::{crc32, SliceReader};
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::convert::TryInto;

pub(crate) const SECTION_BUFFER_SIZE: usize = 4096;
pub(crate) const PACKET_BUFFER_SIZE: usize = 5120;
pub(crate) const MAX_SECTION_PACKETS: usize = PACKET_BUFFER_SIZE / TS_PACKET_SIZE;

/// Largest value `section_length` may take when building tables.
pub const MAX_SECTION_LENGTH: u16 = 4093;

/// Wire layout of the first three section header bytes.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SectionHeaderBits {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_indicator: bool,
    pub reserved: B2,
    pub section_length: B12,
}

/// Wire layout of the five extended-syntax bytes.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SectionSyntaxBits {
    pub id_number: B16,
    pub reserved: B2,
    pub version_number: B5,
    pub current_next_indicator: bool,
    pub section_number: B8,
    pub last_section_number: B8,
}

/// Decoded section header fields, as captured from a PUSI packet before the
/// accumulator commits to the section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectionFields {
    /// Offset from the first payload byte to the section start.
    pub pointer_field: u8,
    /// Table id.
    pub table_id: u8,
    /// Set for tables using the extended syntax.
    pub section_syntax_indicator: bool,
    /// Private indicator bit.
    pub private_indicator: bool,
    /// Two reserved bits following the indicators.
    pub reserved1: u8,
    /// 12-bit section length.
    pub section_length: u16,
    /// Transport stream / program / service id field.
    pub id_number: u16,
    /// Two reserved bits of the extended syntax.
    pub reserved2: u8,
    /// 5-bit version number.
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// Section accumulator and generator state.
#[derive(Debug, Clone)]
pub struct Section {
    /// Offset from the first payload byte to the section start.
    pub pointer_field: u8,
    /// Table id.
    pub table_id: u8,
    /// Set for tables using the extended syntax.
    pub section_syntax_indicator: bool,
    /// Private indicator bit.
    pub private_indicator: bool,
    /// Two reserved bits following the indicators.
    pub reserved1: u8,
    /// 12-bit section length.
    pub section_length: u16,
    /// Transport stream / program / service id field.
    pub id_number: u16,
    /// Two reserved bits of the extended syntax.
    pub reserved2: u8,
    /// 5-bit version number.
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
    /// CRC read from the trailing four section bytes.
    pub crc: u32,
    section_data: Box<[u8; SECTION_BUFFER_SIZE]>,
    packet_data: Box<[u8; PACKET_BUFFER_SIZE]>,
    section_pos: usize,
    num_packets: usize,
    assembled: bool,
}

impl Default for Section {
    fn default() -> Self {
        Self::new()
    }
}

impl Section {
    /// Allocates an empty section.
    pub fn new() -> Self {
        Self {
            pointer_field: 0,
            table_id: 0,
            section_syntax_indicator: false,
            private_indicator: false,
            reserved1: 0,
            section_length: 0,
            id_number: 0,
            reserved2: 0,
            version_number: 0,
            current_next_indicator: false,
            section_number: 0,
            last_section_number: 0,
            crc: 0,
            section_data: Box::new([0; SECTION_BUFFER_SIZE]),
            packet_data: Box::new([0; PACKET_BUFFER_SIZE]),
            section_pos: 0,
            num_packets: 0,
            assembled: false,
        }
    }

    /// Clears all state while the owned buffers keep their identity.
    pub fn reset(&mut self) {
        self.pointer_field = 0;
        self.table_id = 0;
        self.section_syntax_indicator = false;
        self.private_indicator = false;
        self.reserved1 = 0;
        self.section_length = 0;
        self.id_number = 0;
        self.reserved2 = 0;
        self.version_number = 0;
        self.current_next_indicator = false;
        self.section_number = 0;
        self.last_section_number = 0;
        self.crc = 0;
        self.section_data.iter_mut().for_each(|b| *b = 0);
        self.packet_data.iter_mut().for_each(|b| *b = 0);
        self.section_pos = 0;
        self.num_packets = 0;
        self.assembled = false;
    }

    /// Parses the section header at the start of a PUSI packet's payload.
    ///
    /// Returns `None` on truncation, a zero `section_length`, or the
    /// stuffing table (0x72); callers discard the packet in that case.
    pub fn fields_from_packet(
        packet: &[u8; TS_PACKET_SIZE],
        hdr: &TsHeader,
    ) -> Option<SectionFields> {
        let mut reader = SliceReader::new(&packet[hdr.payload_offset as usize..]);
        let pointer_field = reader.read_u8().ok()?;
        reader.skip(pointer_field as usize).ok()?;

        let head = SectionHeaderBits::from_bytes(*reader.read_array_ref::<3>().ok()?);
        let mut fields = SectionFields {
            pointer_field,
            table_id: head.table_id(),
            section_syntax_indicator: head.section_syntax_indicator(),
            private_indicator: head.private_indicator(),
            reserved1: head.reserved(),
            section_length: head.section_length(),
            ..SectionFields::default()
        };

        if fields.section_length == 0 {
            return None;
        }
        if fields.section_length > MAX_SECTION_LENGTH {
            warn!(
                "section_length {} above the {} limit, dropping",
                fields.section_length, MAX_SECTION_LENGTH
            );
            return None;
        }
        // Stuffing table, ignore.
        if fields.table_id == 0x72 {
            return None;
        }

        if fields.section_syntax_indicator {
            let ext = SectionSyntaxBits::from_bytes(*reader.read_array_ref::<5>().ok()?);
            fields.id_number = ext.id_number();
            fields.reserved2 = ext.reserved();
            fields.version_number = ext.version_number();
            fields.current_next_indicator = ext.current_next_indicator();
            fields.section_number = ext.section_number();
            fields.last_section_number = ext.last_section_number();
        }

        Some(fields)
    }

    /// Begins assembling a fresh section described by `fields`.
    pub fn begin(&mut self, fields: &SectionFields) {
        self.pointer_field = fields.pointer_field;
        self.table_id = fields.table_id;
        self.section_syntax_indicator = fields.section_syntax_indicator;
        self.private_indicator = fields.private_indicator;
        self.reserved1 = fields.reserved1;
        self.section_length = fields.section_length;
        self.id_number = fields.id_number;
        self.reserved2 = fields.reserved2;
        self.version_number = fields.version_number;
        self.current_next_indicator = fields.current_next_indicator;
        self.section_number = fields.section_number;
        self.last_section_number = fields.last_section_number;
        self.crc = 0;
        self.section_pos = 0;
        self.num_packets = 0;
        self.assembled = false;
    }

    /// Offset of the table body within the section bytes.
    pub fn data_offset(&self) -> usize {
        if self.section_syntax_indicator {
            3 + 5
        } else {
            3
        }
    }

    /// Length of the table body (extended header and CRC excluded).
    pub fn data_len(&self) -> usize {
        if self.section_syntax_indicator {
            (self.section_length as usize).saturating_sub(9)
        } else {
            self.section_length as usize
        }
    }

    /// Total section bytes including the 3-byte header.
    pub fn section_data_len(&self) -> usize {
        self.section_length as usize + 3
    }

    /// The table body bytes.
    pub fn data(&self) -> &[u8] {
        &self.section_data[self.data_offset()..self.data_offset() + self.data_len()]
    }

    /// The whole section: header, body, trailing CRC.
    pub fn full_data(&self) -> &[u8] {
        &self.section_data[..self.section_data_len().min(SECTION_BUFFER_SIZE)]
    }

    /// True once all section bytes have been accumulated.
    pub fn assembled(&self) -> bool {
        self.assembled
    }

    /// Number of TS packets the section was carried in.
    pub fn num_packets(&self) -> usize {
        self.num_packets
    }

    /// The `idx`-th retained TS packet.
    pub fn packet(&self, idx: usize) -> &[u8; TS_PACKET_SIZE] {
        self.packet_data[idx * TS_PACKET_SIZE..(idx + 1) * TS_PACKET_SIZE]
            .try_into()
            .expect("packet index within num_packets")
    }

    /// All retained packet bytes.
    pub fn packets_bytes(&self) -> &[u8] {
        &self.packet_data[..self.num_packets * TS_PACKET_SIZE]
    }

    /// Replaces the retained packet images (used after regeneration).
    pub fn set_packets(&mut self, packets: &[[u8; TS_PACKET_SIZE]]) {
        let count = packets.len().min(MAX_SECTION_PACKETS);
        for (i, packet) in packets.iter().take(count).enumerate() {
            self.packet_data[i * TS_PACKET_SIZE..(i + 1) * TS_PACKET_SIZE]
                .copy_from_slice(packet);
        }
        self.num_packets = count;
    }

    /// Appends one TS packet's payload to the section, retaining the whole
    /// packet for byte-identical re-emission.
    pub fn add_packet(&mut self, hdr: &TsHeader, packet: &[u8; TS_PACKET_SIZE]) {
        if self.section_length == 0 {
            return;
        }
        let mut payload_offset = hdr.payload_offset as usize;
        if hdr.pusi {
            payload_offset += self.pointer_field as usize + 1;
        }
        if payload_offset >= TS_PACKET_SIZE {
            return;
        }
        let to_copy = (TS_PACKET_SIZE - payload_offset)
            .min(self.section_data_len() - self.section_pos)
            .min(SECTION_BUFFER_SIZE - self.section_pos);
        if to_copy == 0 {
            return;
        }
        if self.num_packets >= MAX_SECTION_PACKETS {
            warn!("section spans more than {} packets, dropping", MAX_SECTION_PACKETS);
            return;
        }

        self.section_data[self.section_pos..self.section_pos + to_copy]
            .copy_from_slice(&packet[payload_offset..payload_offset + to_copy]);
        self.packet_data
            [self.num_packets * TS_PACKET_SIZE..(self.num_packets + 1) * TS_PACKET_SIZE]
            .copy_from_slice(packet);
        self.section_pos += to_copy;
        self.num_packets += 1;
        self.assembled = self.section_pos >= self.section_data_len();

        if self.assembled && self.section_data_len() >= 4 {
            let end = self.section_data_len();
            self.crc = u32::from_be_bytes([
                self.section_data[end - 4],
                self.section_data[end - 3],
                self.section_data[end - 2],
                self.section_data[end - 1],
            ]);
        }
    }

    /// Verifies the trailing CRC over the whole section, logging `table` on
    /// mismatch.
    pub fn crc_check(&self, table: &str) -> bool {
        crc32::section_crc_check(self.full_data(), table)
    }

    /// Writes the 3-byte header (plus the 5 extended-syntax bytes when
    /// applicable) into `out`.
    pub fn generate_header(&self, out: &mut [u8]) {
        let head = SectionHeaderBits::new()
            .with_table_id(self.table_id)
            .with_section_syntax_indicator(self.section_syntax_indicator)
            .with_private_indicator(self.private_indicator)
            .with_reserved(self.reserved1 & 0x3)
            .with_section_length(self.section_length & 0xFFF);
        out[0..3].copy_from_slice(&head.into_bytes());
        if self.section_syntax_indicator {
            let ext = SectionSyntaxBits::new()
                .with_id_number(self.id_number)
                .with_reserved(self.reserved2 & 0x3)
                .with_version_number(self.version_number & 0x1F)
                .with_current_next_indicator(self.current_next_indicator)
                .with_section_number(self.section_number)
                .with_last_section_number(self.last_section_number);
            out[3..8].copy_from_slice(&ext.into_bytes());
        }
    }

    /// Fragments assembled section bytes into TS packets.
    ///
    /// The first packet carries PUSI and the pointer field; the following
    /// packets clear PUSI and increment the continuity counter modulo 16.
    /// Unused packet tails are 0xFF stuffing.
    pub fn gen_ts_packets(
        ts_header: &TsHeader,
        section_bytes: &[u8],
        pointer_field: u8,
    ) -> Vec<[u8; TS_PACKET_SIZE]> {
        let section_sz = section_bytes.len();
        let mut np = 1_usize;
        let mut sect = section_sz as i64 - (TS_PACKET_SIZE as i64 - 5);
        while sect > 0 {
            sect -= TS_PACKET_SIZE as i64 - 4;
            np += 1;
        }

        let mut tshdr = *ts_header;
        let mut packets = vec![[0_u8; TS_PACKET_SIZE]; np];
        let mut sect_pos = 0_usize;
        for (i, packet) in packets.iter_mut().enumerate() {
            let mut dataofs = 4_usize;
            if i == 0 {
                if ts_header.adapt_len > 0 {
                    dataofs += ts_header.adapt_len as usize + 1;
                }
                dataofs += pointer_field as usize + 1;
            } else {
                tshdr.pusi = false;
                tshdr.adapt_field = false;
                tshdr.adapt_len = 0;
                tshdr.continuity = (tshdr.continuity + 1) & 0xF;
            }
            tshdr.generate(packet);
            if i == 0 {
                if ts_header.adapt_len > 0 {
                    packet[4] = ts_header.adapt_len;
                    packet[5] = ts_header.adapt_flags;
                    packet[5 + ts_header.adapt_len as usize] = pointer_field;
                } else {
                    packet[4] = pointer_field;
                }
            }
            let maxdatasize = TS_PACKET_SIZE - dataofs;
            let copied = maxdatasize.min(section_sz - sect_pos);
            packet[dataofs..dataofs + copied]
                .copy_from_slice(&section_bytes[sect_pos..sect_pos + copied]);
            sect_pos += copied;
        }
        packets
    }

    /// Compares table id, version, section number, section length and the
    /// raw section bytes.
    pub fn is_same(&self, other: &Section) -> bool {
        self.table_id == other.table_id
            && self.version_number == other.version_number
            && self.section_number == other.section_number
            && self.section_length == other.section_length
            && self.full_data() == other.full_data()
    }

    /// Logs the section header trace.
    pub fn dump_header(&self) {
        log::info!("  * Section header");
        if self.pointer_field != 0 {
            log::info!("    - Pointer field      : {}", self.pointer_field);
        }
        log::info!(
            "    - Table id           : {:03x} ({}) {}",
            self.table_id,
            self.table_id,
            table_id_name(self.table_id)
        );
        log::info!(
            "    - Section length     : {:03x} ({}) [num_packets:{}]",
            self.section_length,
            self.section_length,
            self.num_packets
        );
        if !self.section_syntax_indicator {
            log::info!("    - Private section syntax");
        } else {
            log::info!(
                "    - TS ID / Program No : {:04x} ({})",
                self.id_number,
                self.id_number
            );
            log::info!(
                "    - Version number {}, current next {}, section number {}, last section number {}",
                self.version_number,
                self.current_next_indicator as u8,
                self.section_number,
                self.last_section_number
            );
        }
        if self.crc != 0 && self.crc != 0xffffffff {
            log::info!("    - CRC                : 0x{:08x}", self.crc);
        }
    }

    /// Logs the table name, each retained packet header, and the section
    /// header.
    pub fn dump(&self) {
        log::info!("{} table", table_family_name(self.table_id));
        for i in 0..self.num_packets {
            if let Ok(hdr) = TsHeader::parse(self.packet(i)) {
                hdr.dump();
            }
        }
        self.dump_header();
    }
}

/// Long-form table id description for section header dumps.
pub fn table_id_name(table_id: u8) -> &'static str {
    match table_id {
        0x00 => "program_association_section",
        0x01 => "conditional_access_section",
        0x02 => "program_map_section",
        0x03 => "transport_stream_description_section",
        0x04..=0x3f => "reserved",
        0x40 => "network_information_section - actual_network",
        0x41 => "network_information_section - other_network",
        0x42 => "service_description_section - actual_transport_stream",
        0x43..=0x45 => "reserved for future use",
        0x46 => "service_description_section - other_transport_stream",
        0x47..=0x49 => "reserved for future use",
        0x4a => "bouquet_association_section",
        0x4b..=0x4d => "reserved for future use",
        0x4e => "event_information_section - actual_transport_stream, present/following",
        0x4f => "event_information_section - other_transport_stream, present/following",
        0x50..=0x5f => "event_information_section - actual_transport_stream, schedule",
        0x60..=0x6f => "event_information_section - other_transport_stream, schedule",
        0x70 => "time_date_section",
        0x71 => "running_status_section",
        0x72 => "stuffing_section",
        0x73 => "time_offset_section",
        0x74 => "application information section (TS 102 812)",
        0x75 => "container section (TS 102 323)",
        0x76 => "related content section (TS 102 323)",
        0x77 => "content identifier section (TS 102 323)",
        0x78 => "MPE-FEC section (EN 301 192)",
        0x79 => "resolution notification section (TS 102 323)",
        0x7a..=0x7d => "reserved for future use",
        0x7e => "discontinuity_information_section",
        0x7f => "section_information_section",
        0x83 => "lcn_description_section - other",
        0x80..=0xfe => "user defined",
        0xff => "reserved",
    }
}

pub(crate) fn table_family_name(table_id: u8) -> &'static str {
    match table_id {
        0x00 => "PAT",
        0x01 => "CAT",
        0x02 => "PMT",
        0x03 => "TSDT",
        0x40 | 0x41 => "NIT",
        0x42 | 0x46 => "SDT",
        0x4a => "BAT",
        0x4e..=0x6f => "EIT",
        0x70 => "TDT",
        0x71 => "RST",
        0x72 => "STUFFING",
        0x73 => "TOT",
        0x7e => "DIS",
        0x7f => "SIS",
        0x80..=0xfe => "USER_DEFINED",
        0xff => "RESERVED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_header(pid: u16) -> TsHeader {
        TsHeader {
            pusi: true,
            pid,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        }
    }

    #[test]
    fn short_section_fits_one_packet() {
        let section = vec![0xAB_u8; 183];
        let packets = Section::gen_ts_packets(&reference_header(0x11), &section, 0);
        assert_eq!(packets.len(), 1);
        let hdr = TsHeader::parse(&packets[0]).unwrap();
        assert!(hdr.pusi);
        assert_eq!(packets[0][4], 0);
        assert_eq!(&packets[0][5..188], &section[..]);
    }

    #[test]
    fn long_section_spills_with_continuity() {
        let section = vec![0xCD_u8; 185];
        let packets = Section::gen_ts_packets(&reference_header(0x11), &section, 0);
        assert_eq!(packets.len(), 2);
        let first = TsHeader::parse(&packets[0]).unwrap();
        let second = TsHeader::parse(&packets[1]).unwrap();
        assert!(first.pusi);
        assert!(!second.pusi);
        assert_eq!(second.continuity, (first.continuity + 1) & 0xF);
        assert_eq!(&packets[1][4..6], &[0xCD, 0xCD]);
        // 0xFF stuffing after the section tail
        assert!(packets[1][6..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn header_fields_round_trip() {
        let mut section = Section::new();
        section.begin(&SectionFields {
            table_id: 0x42,
            section_syntax_indicator: true,
            private_indicator: true,
            reserved1: 3,
            section_length: 21,
            id_number: 0x1234,
            reserved2: 3,
            version_number: 5,
            current_next_indicator: true,
            section_number: 1,
            last_section_number: 2,
            ..SectionFields::default()
        });
        let mut out = [0_u8; 8];
        section.generate_header(&mut out);

        let mut packet = [0xFF_u8; TS_PACKET_SIZE];
        let hdr = reference_header(0x11);
        hdr.generate(&mut packet);
        packet[4] = 0; // pointer field
        packet[5..13].copy_from_slice(&out);
        let fields = Section::fields_from_packet(&packet, &hdr).unwrap();
        assert_eq!(fields.table_id, 0x42);
        assert_eq!(fields.section_length, 21);
        assert_eq!(fields.id_number, 0x1234);
        assert_eq!(fields.version_number, 5);
        assert_eq!(fields.section_number, 1);
        assert_eq!(fields.last_section_number, 2);
    }

    #[test]
    fn stuffing_and_empty_sections_discarded() {
        let hdr = reference_header(0x11);
        let mut packet = [0xFF_u8; TS_PACKET_SIZE];
        hdr.generate(&mut packet);
        packet[4] = 0;
        packet[5] = 0x72; // stuffing table id
        packet[6] = 0xB0;
        packet[7] = 10;
        assert!(Section::fields_from_packet(&packet, &hdr).is_none());
        packet[5] = 0x42;
        packet[6] = 0xB0;
        packet[7] = 0; // zero section_length
        assert!(Section::fields_from_packet(&packet, &hdr).is_none());
    }
}
