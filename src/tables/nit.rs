//! Network information table parser and generator, with the cable-network
//! descriptor builders.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::desc::dump_descriptors;
use crate::packet::TsHeader;
use crate::section::{Section, SectionFields, MAX_SECTION_LENGTH};
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};
use modular_bitfield_msb::prelude::*;

const MAX_STREAMS: usize = 128;

/// Wire layout of a reserved(4)+length(12) pair as used before the network
/// info blob and the TS loop.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct NitLengthBits {
    pub reserved: B4,
    pub length: B12,
}

/// Wire layout of one TS-loop entry header.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct NitEntryBits {
    pub transport_stream_id: B16,
    pub original_network_id: B16,
    pub reserved: B4,
    pub descriptors_length: B12,
}

/// One transport stream described by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NitStream {
    /// Transport stream id.
    pub transport_stream_id: u16,
    /// Originating network id.
    pub original_network_id: u16,
    /// Four reserved bits.
    pub reserved1: u8,
    /// Transport descriptor blob.
    pub descriptors: Vec<u8>,
}

/// Network information table accumulator/builder.
#[derive(Default)]
pub struct Nit {
    pub(crate) state: TableState,
    /// Four reserved bits before the network info length.
    pub reserved1: u8,
    /// Network-level descriptor blob.
    pub network_info: Vec<u8>,
    /// Four reserved bits before the TS loop length.
    pub reserved2: u8,
    /// Byte length of the TS loop.
    pub ts_loop_size: u16,
    /// Transport stream entries in section order.
    pub streams: Vec<NitStream>,
}

impl TableParser for Nit {
    const PID: Option<u16> = Some(0x0010);
    const NAME: &'static str = "NIT";

    fn accepts_table_id(table_id: u8) -> bool {
        table_id == 0x40
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.reserved1 = 0;
        self.network_info.clear();
        self.reserved2 = 0;
        self.ts_loop_size = 0;
        self.streams.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        let data = self.state.section.data();
        if data.len() < 4 {
            warn!("NIT section body too short ({} bytes)", data.len());
            return false;
        }
        let head = NitLengthBits::from_bytes([data[0], data[1]]);
        let network_info_len = head.length() as usize;
        if 2 + network_info_len + 2 > data.len() {
            warn!("NIT network_info overruns the section");
            return false;
        }
        let reserved1 = head.reserved();
        let network_info = data[2..2 + network_info_len].to_vec();

        let loop_head = NitLengthBits::from_bytes([
            data[2 + network_info_len],
            data[3 + network_info_len],
        ]);
        let reserved2 = loop_head.reserved();
        let ts_loop_size = loop_head.length();

        let mut streams = Vec::new();
        let loop_start = 4 + network_info_len;
        let loop_end = (loop_start + ts_loop_size as usize).min(data.len());
        let mut entry_data = &data[loop_start..loop_end];
        while entry_data.len() >= 6 {
            if streams.len() >= MAX_STREAMS {
                warn!("!!! Too many streams in NIT, max {}", MAX_STREAMS);
                break;
            }
            let entry = NitEntryBits::from_bytes([
                entry_data[0],
                entry_data[1],
                entry_data[2],
                entry_data[3],
                entry_data[4],
                entry_data[5],
            ]);
            let desc_len = entry.descriptors_length() as usize;
            if 6 + desc_len > entry_data.len() {
                warn!("NIT descriptor loop overruns the section");
                break;
            }
            streams.push(NitStream {
                transport_stream_id: entry.transport_stream_id(),
                original_network_id: entry.original_network_id(),
                reserved1: entry.reserved(),
                descriptors: entry_data[6..6 + desc_len].to_vec(),
            });
            entry_data = &entry_data[6 + desc_len..];
        }

        self.reserved1 = reserved1;
        self.network_info = network_info;
        self.reserved2 = reserved2;
        self.ts_loop_size = ts_loop_size;
        self.streams = streams;
        self.state.section.crc_check(Self::NAME)
    }
}

impl Nit {
    /// Allocates an empty accumulator.
    pub fn new() -> Nit {
        Nit::default()
    }

    /// Builds an empty NIT for `network_id` ready for generation.
    pub fn init(network_id: u16) -> Nit {
        let mut nit = Nit::new();
        nit.state.held = Some(TsHeader {
            pid: 0x0010,
            pusi: true,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        });
        nit.state.section.begin(&SectionFields {
            table_id: 0x40,
            section_syntax_indicator: true,
            private_indicator: true,
            reserved1: 3,
            section_length: 9 + 4, // Empty section plus both length fields
            id_number: network_id,
            reserved2: 3,
            version_number: 1,
            current_next_indicator: true,
            ..SectionFields::default()
        });
        nit.reserved1 = 0xF;
        nit.reserved2 = 0xF;
        nit.state.initialized = true;
        nit.regenerate_packets();
        nit
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

    /// Sets the network name descriptor (tag 0x40) as the network info.
    pub fn add_network_name_descriptor(&mut self, network_name: &str) -> bool {
        if network_name.is_empty() || network_name.len() > 255 {
            return false;
        }
        let mut descriptor = Vec::with_capacity(network_name.len() + 2);
        descriptor.push(0x40); // Network name descriptor
        descriptor.push(network_name.len() as u8);
        descriptor.extend_from_slice(network_name.as_bytes());

        self.state.section.section_length += descriptor.len() as u16;
        self.network_info = descriptor;
        self.regenerate_packets();
        true
    }

    fn add_stream(&mut self, ts_id: u16, org_net_id: u16, descriptors: Vec<u8>) -> bool {
        if self.streams.len() >= MAX_STREAMS - 1 || descriptors.is_empty() {
            return false;
        }
        let stream_len = (2 + 2 + 1 + 1 + descriptors.len()) as u16;
        if stream_len + self.state.section.section_length > MAX_SECTION_LENGTH {
            warn!(
                "NIT no space left, max {}, current {} will become {}!",
                MAX_SECTION_LENGTH,
                self.state.section.section_length,
                stream_len + self.state.section.section_length
            );
            return false;
        }

        self.ts_loop_size += stream_len;
        self.state.section.section_length += stream_len;
        self.streams.push(NitStream {
            transport_stream_id: ts_id,
            original_network_id: org_net_id,
            reserved1: 15,
            descriptors,
        });
        self.regenerate_packets();
        true
    }

    /// Adds a TS-loop entry carrying a cable frequency list descriptor
    /// (tag 0x62, coding type cable).
    pub fn add_frequency_list_descriptor_cable(
        &mut self,
        ts_id: u16,
        org_net_id: u16,
        freqs: &[u32],
    ) -> bool {
        if freqs.is_empty() || freqs.len() > 63 {
            return false;
        }
        let desc_size = 2 + 1 + freqs.len() * 4;
        let mut desc = Vec::with_capacity(desc_size);
        desc.push(0x62); // frequency_list_descriptor
        desc.push((desc_size - 2) as u8);
        desc.push(0xFC | 2); // 6 reserved bits, coding type cable
        for freq in freqs {
            desc.extend_from_slice(&freq.to_be_bytes());
        }
        self.add_stream(ts_id, org_net_id, desc)
    }

    /// Adds a TS-loop entry carrying a cable delivery system descriptor
    /// (tag 0x44). FEC outer and inner are left "not defined".
    pub fn add_cable_delivery_descriptor(
        &mut self,
        ts_id: u16,
        org_net_id: u16,
        freq: u32,
        modulation: u8,
        symbol_rate: u32,
    ) -> bool {
        self.add_stream(
            ts_id,
            org_net_id,
            cable_delivery_descriptor(freq, modulation, symbol_rate),
        )
    }

    /// Adds a TS-loop entry carrying a service list descriptor (tag 0x41).
    /// Each entry packs `service_id << 8 | service_type`; at most 85 fit.
    pub fn add_service_list_descriptor(
        &mut self,
        ts_id: u16,
        org_net_id: u16,
        services: &[u32],
    ) -> bool {
        if services.is_empty() || services.len() > 85 {
            // 85 * 3 == 255
            return false;
        }
        self.add_stream(ts_id, org_net_id, service_list_descriptor(services))
    }

    /// Adds a TS-loop entry carrying the NorDig private data specifier
    /// descriptor (tag 0x5F, specifier 0x00000029).
    pub fn add_nordig_specifier_descriptor(&mut self, ts_id: u16, org_net_id: u16) -> bool {
        self.add_stream(ts_id, org_net_id, nordig_specifier_descriptor())
    }

    /// Adds a TS-loop entry carrying a logical channel number descriptor
    /// (tag 0x83). Each entry packs `service_id << 16 | visibility/LCN`.
    pub fn add_lcn_descriptor(&mut self, ts_id: u16, org_net_id: u16, services: &[u32]) -> bool {
        if services.is_empty() || services.len() > 85 {
            return false;
        }
        self.add_stream(ts_id, org_net_id, lcn_descriptor(services))
    }

    /// Adds one TS-loop entry carrying the full NorDig cable bundle: cable
    /// delivery, service list, private specifier and LCN descriptors.
    pub fn add_stream_descriptors(
        &mut self,
        ts_id: u16,
        org_net_id: u16,
        freq: u32,
        modulation: u8,
        symbol_rate: u32,
        lcn_services: &[u32],
        svc_services: &[u32],
    ) -> bool {
        if svc_services.is_empty() || svc_services.len() > 85 || lcn_services.len() > 85 {
            return false;
        }
        let mut desc = cable_delivery_descriptor(freq, modulation, symbol_rate);
        desc.extend_from_slice(&service_list_descriptor(svc_services));
        desc.extend_from_slice(&nordig_specifier_descriptor());
        desc.extend_from_slice(&lcn_descriptor(lcn_services));
        self.add_stream(ts_id, org_net_id, desc)
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8;

        let head = NitLengthBits::new()
            .with_reserved(self.reserved1 & 0xF)
            .with_length((self.network_info.len() as u16) & 0xFFF);
        secdata[curpos..curpos + 2].copy_from_slice(&head.into_bytes());
        curpos += 2;

        secdata[curpos..curpos + self.network_info.len()].copy_from_slice(&self.network_info);
        curpos += self.network_info.len();

        let loop_head = NitLengthBits::new()
            .with_reserved(self.reserved2 & 0xF)
            .with_length(self.ts_loop_size & 0xFFF);
        secdata[curpos..curpos + 2].copy_from_slice(&loop_head.into_bytes());
        curpos += 2;

        for stream in &self.streams {
            let entry = NitEntryBits::new()
                .with_transport_stream_id(stream.transport_stream_id)
                .with_original_network_id(stream.original_network_id)
                .with_reserved(stream.reserved1 & 0xF)
                .with_descriptors_length((stream.descriptors.len() as u16) & 0xFFF);
            secdata[curpos..curpos + 6].copy_from_slice(&entry.into_bytes());
            curpos += 6;
            secdata[curpos..curpos + stream.descriptors.len()]
                .copy_from_slice(&stream.descriptors);
            curpos += stream.descriptors.len();
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
    pub fn copy(&self) -> Option<Nit> {
        let mut new = Nit::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying NIT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Nit) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "NIT (tspacket->struct)",
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
        compare_data("NIT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();

        info!("  * NIT data");
        info!("    * network_len : {}", self.network_info.len());
        info!("    * ts_loop_len : {}", self.ts_loop_size);
        info!("    * num_streams : {}", self.streams.len());

        if !self.network_info.is_empty() {
            info!("  * Network info:");
            dump_descriptors(&self.network_info);
        }

        for (i, stream) in self.streams.iter().enumerate() {
            info!(
                "    - [{:02}/{:02}] | TS_id: 0x{:04x} ({}) ORG_net_id: 0x{:04x} ({}) Desc_size: {}",
                i + 1,
                self.streams.len(),
                stream.transport_stream_id,
                stream.transport_stream_id,
                stream.original_network_id,
                stream.original_network_id,
                stream.descriptors.len()
            );
            if !stream.descriptors.is_empty() {
                dump_descriptors(&stream.descriptors);
            }
        }

        self.check_generator();
    }
}

fn cable_delivery_descriptor(freq: u32, modulation: u8, symbol_rate: u32) -> Vec<u8> {
    let mut desc = vec![0_u8; 13];
    desc[0] = 0x44; // cable_delivery_system_descriptor
    desc[1] = 11;
    desc[2..6].copy_from_slice(&freq.to_be_bytes());
    desc[6] = 0xFF; // 8 reserved bits
    desc[7] = 0xF0; // 4 reserved bits, FEC_outer not defined
    desc[8] = modulation;
    desc[9] = ((symbol_rate >> 20) & 0xFF) as u8;
    desc[10] = ((symbol_rate >> 12) & 0xFF) as u8;
    desc[11] = ((symbol_rate >> 4) & 0xFF) as u8;
    desc[12] = ((symbol_rate & 0xF) as u8) << 4; // FEC_inner not defined
    desc
}

fn service_list_descriptor(services: &[u32]) -> Vec<u8> {
    let desc_size = 2 + services.len() * 3;
    let mut desc = Vec::with_capacity(desc_size);
    desc.push(0x41); // service_list_descriptor
    desc.push((desc_size - 2) as u8);
    for srv in services {
        desc.push(((srv >> 16) & 0xFF) as u8); // service_id
        desc.push(((srv >> 8) & 0xFF) as u8);
        desc.push((srv & 0xFF) as u8); // service_type
    }
    desc
}

fn nordig_specifier_descriptor() -> Vec<u8> {
    vec![0x5F, 0x04, 0x00, 0x00, 0x00, 0x29]
}

fn lcn_descriptor(services: &[u32]) -> Vec<u8> {
    let desc_size = 2 + services.len() * 4;
    let mut desc = Vec::with_capacity(desc_size);
    desc.push(0x83); // logical_channel_descriptor
    desc.push((desc_size - 2) as u8);
    for srv in services {
        desc.extend_from_slice(&srv.to_be_bytes());
    }
    desc
}

impl SectionTable for Nit {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Nit::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Nit::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Nit::generate(self)
    }

    fn dump(&self) {
        Nit::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cable_network_round_trip() {
        let mut nit = Nit::init(0x1234);
        assert!(nit.add_network_name_descriptor("CableCo"));
        assert!(nit.add_cable_delivery_descriptor(1, 1, 0x03460000, 3, 0x0068750));
        assert!(nit.add_service_list_descriptor(1, 1, &[(1007 << 8) | 0x01, (1008 << 8) | 0x02]));
        assert!(nit.add_nordig_specifier_descriptor(1, 1));
        assert!(nit.add_lcn_descriptor(1, 1, &[(1007 << 16) | 0x8000 | 1]));

        let copy = nit.copy().expect("round-trips through packets");
        assert_eq!(copy.section().id_number, 0x1234);
        assert_eq!(copy.network_info[0], 0x40);
        assert_eq!(&copy.network_info[2..], b"CableCo");
        assert_eq!(copy.streams.len(), 4);
        assert_eq!(copy.streams[0].descriptors[0], 0x44);
        assert_eq!(copy.streams[1].descriptors[0], 0x41);
        assert_eq!(copy.streams[2].descriptors, nordig_specifier_descriptor());
        assert_eq!(copy.streams[3].descriptors[0], 0x83);
        assert_eq!(copy.ts_loop_size, nit.ts_loop_size);
        assert_eq!(copy.streams, nit.streams);

        // Accounting: every stream adds its entry header plus descriptors
        let expected_loop: usize = nit.streams.iter().map(|s| 6 + s.descriptors.len()).sum();
        assert_eq!(nit.ts_loop_size as usize, expected_loop);
    }

    #[test]
    fn combined_stream_descriptors() {
        let mut nit = Nit::init(1);
        let services = [(1_u32 << 8) | 0x01, (2 << 8) | 0x01];
        let lcns = [(1_u32 << 16) | 1, (2 << 16) | 2];
        assert!(nit.add_stream_descriptors(1, 1, 0x0346, 3, 6875, &lcns, &services));
        assert_eq!(nit.streams.len(), 1);
        // cable(13) + service list(2+6) + nordig(6) + lcn(2+8)
        assert_eq!(nit.streams[0].descriptors.len(), 13 + 8 + 6 + 10);
        let copy = nit.copy().unwrap();
        assert_eq!(copy.streams, nit.streams);
    }

    #[test]
    fn generation_is_byte_exact() {
        let mut nit = Nit::init(7);
        nit.add_network_name_descriptor("N");
        nit.add_service_list_descriptor(1, 1, &[(1 << 8) | 1]);
        let first = nit.generate();
        assert_eq!(first, nit.generate());
        let mut replayed = Nit::new();
        for packet in &first {
            replayed.push_packet(packet);
        }
        assert!(replayed.is_initialized());
        assert_eq!(replayed.generate(), first);
    }
}
