//! Service description table parser and generator.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::desc::dump_descriptors;
use crate::packet::TsHeader;
use crate::section::{Section, SectionFields, MAX_SECTION_LENGTH};
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};
use modular_bitfield_msb::prelude::*;

const MAX_SERVICES: usize = 128;

/// Wire layout of one SDT service entry header.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct SdtEntryBits {
    pub service_id: B16,
    pub reserved: B6,
    pub eit_schedule_flag: bool,
    pub eit_present_following_flag: bool,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_length: B12,
}

/// One described service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdtService {
    /// Service id (program number).
    pub service_id: u16,
    /// Six reserved bits.
    pub reserved1: u8,
    /// EIT schedule information is present for this service.
    pub eit_schedule_flag: bool,
    /// EIT present/following information is present for this service.
    pub eit_present_following_flag: bool,
    /// Running status code.
    pub running_status: u8,
    /// Scrambling indication.
    pub free_ca_mode: bool,
    /// Service descriptor blob.
    pub descriptors: Vec<u8>,
}

/// Service description table accumulator/builder.
#[derive(Default)]
pub struct Sdt {
    pub(crate) state: TableState,
    /// Originating network id.
    pub original_network_id: u16,
    /// Reserved byte following the network id.
    pub reserved: u8,
    /// Services in section order.
    pub services: Vec<SdtService>,
}

impl TableParser for Sdt {
    const PID: Option<u16> = Some(0x0011);
    const NAME: &'static str = "SDT";

    fn accepts_table_id(table_id: u8) -> bool {
        table_id == 0x42
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.original_network_id = 0;
        self.reserved = 0;
        self.services.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        let data = self.state.section.data();
        if data.len() < 3 {
            warn!("SDT section body too short ({} bytes)", data.len());
            return false;
        }
        let original_network_id = ((data[0] as u16) << 8) | data[1] as u16;
        let reserved = data[2];

        let mut services = Vec::new();
        let mut entry_data = &data[3..];
        while entry_data.len() >= 5 {
            if services.len() >= MAX_SERVICES {
                warn!(
                    "SDT contains too many services (>{}), not all are initialized!",
                    MAX_SERVICES
                );
                break;
            }
            let entry = SdtEntryBits::from_bytes([
                entry_data[0],
                entry_data[1],
                entry_data[2],
                entry_data[3],
                entry_data[4],
            ]);
            let desc_len = entry.descriptors_length() as usize;
            if 5 + desc_len > entry_data.len() {
                warn!("SDT descriptor loop overruns the section");
                break;
            }
            services.push(SdtService {
                service_id: entry.service_id(),
                reserved1: entry.reserved(),
                eit_schedule_flag: entry.eit_schedule_flag(),
                eit_present_following_flag: entry.eit_present_following_flag(),
                running_status: entry.running_status(),
                free_ca_mode: entry.free_ca_mode(),
                descriptors: entry_data[5..5 + desc_len].to_vec(),
            });
            entry_data = &entry_data[5 + desc_len..];
        }

        self.original_network_id = original_network_id;
        self.reserved = reserved;
        self.services = services;
        self.state.section.crc_check(Self::NAME)
    }
}

impl Sdt {
    /// Allocates an empty accumulator.
    pub fn new() -> Sdt {
        Sdt::default()
    }

    /// Builds an empty SDT ready for generation.
    pub fn init(original_network_id: u16, transport_stream_id: u16) -> Sdt {
        let mut sdt = Sdt::new();
        sdt.state.held = Some(TsHeader {
            pid: 0x0011,
            pusi: true,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        });
        sdt.state.section.begin(&SectionFields {
            table_id: 0x42,
            section_syntax_indicator: true,
            private_indicator: true,
            reserved1: 3,
            section_length: 9 + 3, // Empty section plus the SDT prefix
            id_number: transport_stream_id,
            reserved2: 3,
            version_number: 1,
            current_next_indicator: true,
            ..SectionFields::default()
        });
        sdt.original_network_id = original_network_id;
        sdt.reserved = 0xFF;
        sdt.state.initialized = true;
        sdt.regenerate_packets();
        sdt
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

    fn add_service(&mut self, service_id: u16, descriptors: Vec<u8>) -> bool {
        if self.services.len() >= MAX_SERVICES - 1 || descriptors.is_empty() {
            return false;
        }
        let entry_len = (5 + descriptors.len()) as u16;
        if entry_len + self.state.section.section_length > MAX_SECTION_LENGTH {
            warn!(
                "SDT no space left, max {}, current {} will become {}!",
                MAX_SECTION_LENGTH,
                self.state.section.section_length,
                entry_len + self.state.section.section_length
            );
            return false;
        }
        self.state.section.section_length += entry_len;

        self.services.push(SdtService {
            service_id,
            reserved1: 63,
            eit_schedule_flag: false,
            eit_present_following_flag: true,
            running_status: 4,
            free_ca_mode: false,
            descriptors,
        });
        self.regenerate_packets();
        true
    }

    /// Adds a service entry carrying one service descriptor (tag 0x48).
    /// `video` selects digital TV over digital radio.
    pub fn add_service_descriptor(
        &mut self,
        service_id: u16,
        video: bool,
        provider_name: &str,
        service_name: &str,
    ) -> bool {
        if provider_name.is_empty() && service_name.is_empty() {
            return false;
        }
        let desc_size = 2 + 1 + 1 + provider_name.len() + 1 + service_name.len();
        if desc_size - 2 > 255 {
            warn!(
                "SDT service_descriptor size > 255 is not supported ({})!",
                desc_size
            );
            return false;
        }

        let mut desc = Vec::with_capacity(desc_size);
        desc.push(0x48); // Service descriptor
        desc.push((desc_size - 2) as u8);
        // DVB Table 75: 0x01 digital tv, 0x02 digital radio
        desc.push(if video { 0x01 } else { 0x02 });
        desc.push(provider_name.len() as u8);
        desc.extend_from_slice(provider_name.as_bytes());
        desc.push(service_name.len() as u8);
        desc.extend_from_slice(service_name.as_bytes());

        self.add_service(service_id, desc)
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8;

        secdata[curpos] = (self.original_network_id >> 8) as u8;
        secdata[curpos + 1] = (self.original_network_id & 0xFF) as u8;
        secdata[curpos + 2] = self.reserved;
        curpos += 3;

        for service in &self.services {
            let entry = SdtEntryBits::new()
                .with_service_id(service.service_id)
                .with_reserved(service.reserved1 & 0x3F)
                .with_eit_schedule_flag(service.eit_schedule_flag)
                .with_eit_present_following_flag(service.eit_present_following_flag)
                .with_running_status(service.running_status & 0x7)
                .with_free_ca_mode(service.free_ca_mode)
                .with_descriptors_length((service.descriptors.len() as u16) & 0xFFF);
            secdata[curpos..curpos + 5].copy_from_slice(&entry.into_bytes());
            curpos += 5;
            secdata[curpos..curpos + service.descriptors.len()]
                .copy_from_slice(&service.descriptors);
            curpos += service.descriptors.len();
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
    pub fn copy(&self) -> Option<Sdt> {
        let mut new = Sdt::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying SDT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Sdt) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "SDT (tspacket->struct)",
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
        compare_data("SDT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();

        info!("  * SDT data");
        info!(
            "    * org_net_id  : {:04x} ({})",
            self.original_network_id, self.original_network_id
        );
        info!("    * reserved    : {}", self.reserved);
        info!("    * num_streams : {}", self.services.len());

        for (i, service) in self.services.iter().enumerate() {
            info!(
                "    * [{:02}/{:02}] Service_id: {:04x} ({}) EIT_schedule: {} EIT_present: {} Running_status: {} free_CA_mode: {} /desc_size: {}/",
                i + 1,
                self.services.len(),
                service.service_id,
                service.service_id,
                service.eit_schedule_flag as u8,
                service.eit_present_following_flag as u8,
                service.running_status,
                service.free_ca_mode as u8,
                service.descriptors.len()
            );
            if !service.descriptors.is_empty() {
                dump_descriptors(&service.descriptors);
            }
        }

        self.check_generator();
    }
}

impl SectionTable for Sdt {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Sdt::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Sdt::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Sdt::generate(self)
    }

    fn dump(&self) {
        Sdt::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_descriptor_layout() {
        let mut sdt = Sdt::init(1, 2);
        assert!(sdt.add_service_descriptor(1007, true, "BULSATCOM", "bTV"));

        assert_eq!(sdt.services.len(), 1);
        let service = &sdt.services[0];
        assert_eq!(service.service_id, 1007);
        // tag, length, service_type, provider len+name, service len+name
        let desc_size = 2 + 1 + 1 + "BULSATCOM".len() + 1 + "bTV".len();
        assert_eq!(service.descriptors.len(), desc_size);
        assert_eq!(service.descriptors[0], 0x48);
        assert_eq!(service.descriptors[1] as usize, desc_size - 2);
        assert_eq!(service.descriptors[2], 0x01); // digital tv
        assert_eq!(service.descriptors[3] as usize, "BULSATCOM".len());
        assert_eq!(&service.descriptors[4..13], b"BULSATCOM");
        assert_eq!(service.descriptors[13] as usize, "bTV".len());
        assert_eq!(&service.descriptors[14..17], b"bTV");

        assert_eq!(
            sdt.section().section_length as usize,
            12 + (2 + 1 + 2 + desc_size)
        );

        let copy = sdt.copy().expect("round-trips through packets");
        assert_eq!(copy.original_network_id, 1);
        assert_eq!(copy.section().id_number, 2);
        assert_eq!(copy.services, sdt.services);
    }

    #[test]
    fn radio_services_use_type_two() {
        let mut sdt = Sdt::init(1, 2);
        assert!(sdt.add_service_descriptor(9, false, "PROVIDER", "SERVICE"));
        assert_eq!(sdt.services[0].descriptors[2], 0x02);
    }

    #[test]
    fn refuses_additions_past_section_limit() {
        let mut sdt = Sdt::init(1, 2);
        let provider = "P".repeat(120);
        let service = "S".repeat(120);
        let mut added = 0;
        while sdt.add_service_descriptor(added as u16, true, &provider, &service) {
            added += 1;
            assert!(added < 64, "the limit must kick in");
        }
        let length = sdt.section().section_length;
        assert!(length <= MAX_SECTION_LENGTH);
        let services = sdt.services.len();
        // A refused addition leaves the table untouched
        assert!(!sdt.add_service_descriptor(9999, true, &provider, &service));
        assert_eq!(sdt.section().section_length, length);
        assert_eq!(sdt.services.len(), services);
    }

    #[test]
    fn generation_is_byte_exact() {
        let mut sdt = Sdt::init(0x0001, 0x0002);
        sdt.add_service_descriptor(1007, true, "BULSATCOM", "bTV");
        let first = sdt.generate();
        assert_eq!(first, sdt.generate());
        let mut replayed = Sdt::new();
        for packet in &first {
            replayed.push_packet(packet);
        }
        assert!(replayed.is_initialized());
        assert_eq!(replayed.generate(), first);
    }
}
