//! Event information table parser and generator.

use super::{push_section_packet, SectionTable, TableParser, TableState};
use crate::desc::dump_descriptors;
use crate::packet::TsHeader;
use crate::section::{Section, SectionFields, MAX_SECTION_LENGTH};
use crate::time::{decode_bcd_duration, decode_mjd_datetime, encode_bcd_duration, encode_mjd};
use crate::{compare_data, crc32, TS_PACKET_SIZE};
use log::{info, warn};
use modular_bitfield_msb::prelude::*;

const MAX_EVENTS: usize = 128;

/// Wire layout of one EIT event header.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct EitEventBits {
    pub event_id: B16,
    pub start_time_mjd: B16,
    pub start_time_bcd: B24,
    pub duration_bcd: B24,
    pub running_status: B3,
    pub free_ca_mode: bool,
    pub descriptors_length: B12,
}

/// One described event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EitEvent {
    /// Event id.
    pub event_id: u16,
    /// Start day as MJD.
    pub start_time_mjd: u16,
    /// Start time of day as BCD hh:mm:ss.
    pub start_time_bcd: u32,
    /// Duration as BCD hh:mm:ss.
    pub duration_bcd: u32,
    /// Running status code (1 not running, 4 running).
    pub running_status: u8,
    /// Scrambling indication.
    pub free_ca_mode: bool,
    /// Event descriptor blob.
    pub descriptors: Vec<u8>,
}

/// Event information table accumulator/builder.
#[derive(Default)]
pub struct Eit {
    pub(crate) state: TableState,
    /// Transport stream the events belong to.
    pub transport_stream_id: u16,
    /// Originating network id.
    pub original_network_id: u16,
    /// Last section number of this segment.
    pub segment_last_section_number: u8,
    /// Last table id in use for this service.
    pub last_table_id: u8,
    /// Events in section order.
    pub events: Vec<EitEvent>,
}

impl TableParser for Eit {
    const PID: Option<u16> = Some(0x0012);
    const NAME: &'static str = "EIT";

    fn accepts_table_id(table_id: u8) -> bool {
        // 0x4E present/following, 0x50..=0x5F schedule (actual TS)
        table_id == 0x4E || (0x50..=0x5F).contains(&table_id)
    }

    fn state(&mut self) -> &mut TableState {
        &mut self.state
    }

    fn clear(&mut self) {
        self.transport_stream_id = 0;
        self.original_network_id = 0;
        self.segment_last_section_number = 0;
        self.last_table_id = 0;
        self.events.clear();
        self.state.clear();
    }

    fn parse_table(&mut self) -> bool {
        let data = self.state.section.data();
        if data.len() < 6 {
            warn!("EIT section body too short ({} bytes)", data.len());
            return false;
        }
        let transport_stream_id = ((data[0] as u16) << 8) | data[1] as u16;
        let original_network_id = ((data[2] as u16) << 8) | data[3] as u16;
        let segment_last_section_number = data[4];
        let last_table_id = data[5];

        let mut events = Vec::new();
        let mut event_data = &data[6..];
        while event_data.len() >= 12 {
            if events.len() >= MAX_EVENTS {
                warn!("!!! Too many events in EIT, max {}", MAX_EVENTS);
                break;
            }
            let mut head = [0_u8; 12];
            head.copy_from_slice(&event_data[..12]);
            let entry = EitEventBits::from_bytes(head);
            let desc_len = entry.descriptors_length() as usize;
            if 12 + desc_len > event_data.len() {
                warn!("EIT descriptor loop overruns the section");
                break;
            }
            events.push(EitEvent {
                event_id: entry.event_id(),
                start_time_mjd: entry.start_time_mjd(),
                start_time_bcd: entry.start_time_bcd(),
                duration_bcd: entry.duration_bcd(),
                running_status: entry.running_status(),
                free_ca_mode: entry.free_ca_mode(),
                descriptors: event_data[12..12 + desc_len].to_vec(),
            });
            event_data = &event_data[12 + desc_len..];
        }

        self.transport_stream_id = transport_stream_id;
        self.original_network_id = original_network_id;
        self.segment_last_section_number = segment_last_section_number;
        self.last_table_id = last_table_id;
        self.events = events;
        self.state.section.crc_check(Self::NAME)
    }
}

impl Eit {
    /// Allocates an empty accumulator.
    pub fn new() -> Eit {
        Eit::default()
    }

    /// Builds an empty EIT for `service_id` ready for generation.
    pub fn init(
        service_id: u16,
        transport_stream_id: u16,
        original_network_id: u16,
        table_id: u8,
        section_number: u8,
        last_section_number: u8,
    ) -> Eit {
        let mut eit = Eit::new();
        eit.state.held = Some(TsHeader {
            pid: 0x0012,
            pusi: true,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        });
        eit.state.section.begin(&SectionFields {
            table_id,
            section_syntax_indicator: true,
            private_indicator: true,
            reserved1: 3,
            section_length: 9 + 6, // Empty section plus the EIT prefix
            id_number: service_id,
            reserved2: 3,
            version_number: 1,
            current_next_indicator: true,
            section_number,
            last_section_number,
            ..SectionFields::default()
        });
        eit.transport_stream_id = transport_stream_id;
        eit.original_network_id = original_network_id;
        eit.segment_last_section_number = 0;
        eit.last_table_id = table_id;
        eit.state.initialized = true;
        eit.regenerate_packets();
        eit
    }

    /// [`Eit::init`] shortcut for the present/following table (0x4E).
    pub fn init_pf(
        service_id: u16,
        transport_stream_id: u16,
        original_network_id: u16,
        section_number: u8,
        last_section_number: u8,
    ) -> Eit {
        Eit::init(
            service_id,
            transport_stream_id,
            original_network_id,
            0x4E,
            section_number,
            last_section_number,
        )
    }

    /// [`Eit::init`] shortcut for the first schedule table (0x50).
    pub fn init_schedule(
        service_id: u16,
        transport_stream_id: u16,
        original_network_id: u16,
        section_number: u8,
        last_section_number: u8,
    ) -> Eit {
        Eit::init(
            service_id,
            transport_stream_id,
            original_network_id,
            0x50,
            section_number,
            last_section_number,
        )
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

    fn add_event(
        &mut self,
        event_id: u16,
        running: bool,
        start_time: i64,
        duration_sec: u32,
        descriptors: Vec<u8>,
    ) -> bool {
        if self.events.len() >= MAX_EVENTS - 1 || descriptors.is_empty() {
            return false;
        }
        let entry_len = (12 + descriptors.len()) as u16;
        if entry_len + self.state.section.section_length > MAX_SECTION_LENGTH {
            warn!(
                "EIT no space left, max {}, current {} will become {}!",
                MAX_SECTION_LENGTH,
                self.state.section.section_length,
                entry_len + self.state.section.section_length
            );
            return false;
        }

        let (start_mjd, start_bcd) = encode_mjd(start_time);
        self.state.section.section_length += entry_len;
        self.events.push(EitEvent {
            event_id,
            start_time_mjd: start_mjd,
            start_time_bcd: start_bcd,
            duration_bcd: encode_bcd_duration(duration_sec),
            running_status: if running { 4 } else { 1 },
            free_ca_mode: false,
            descriptors,
        });
        self.regenerate_packets();
        true
    }

    /// Adds an event carrying one short event descriptor (tag 0x4D) with
    /// language code "bul".
    pub fn add_short_event_descriptor(
        &mut self,
        event_id: u16,
        running: bool,
        start_time: i64,
        duration_sec: u32,
        event_name: &str,
        event_short_descr: &str,
    ) -> bool {
        let desc_size = 2 + 3 + 1 + event_name.len() + 1 + event_short_descr.len();
        if desc_size > 255 {
            warn!(
                "EIT short event descriptor size > 255 is not supported ({})!",
                desc_size
            );
            return false;
        }
        if event_name.is_empty() {
            warn!("EIT event_name is empty!");
            return false;
        }

        let mut desc = Vec::with_capacity(desc_size);
        desc.push(0x4D); // Short event descriptor
        desc.push((desc_size - 2) as u8);
        desc.extend_from_slice(b"bul");
        desc.push(event_name.len() as u8);
        desc.extend_from_slice(event_name.as_bytes());
        desc.push(event_short_descr.len() as u8);
        desc.extend_from_slice(event_short_descr.as_bytes());

        self.add_event(event_id, running, start_time, duration_sec, desc)
    }

    /// Adds an event carrying one extended event descriptor (tag 0x4E) with
    /// language code "bul" and no items.
    pub fn add_extended_event_descriptor(
        &mut self,
        event_id: u16,
        running: bool,
        start_time: i64,
        duration_sec: u32,
        text: &str,
    ) -> bool {
        // tag+len, lang, descriptor numbers, items length, text length
        let desc_size = 2 + 3 + 1 + 1 + 1 + text.len();
        if desc_size > 257 {
            warn!(
                "EIT extended event descriptor size > 255 is not supported ({})!",
                desc_size
            );
            return false;
        }
        if text.is_empty() {
            warn!("EIT text is empty!");
            return false;
        }

        let mut desc = Vec::with_capacity(desc_size);
        desc.push(0x4E); // Extended event descriptor
        desc.push((desc_size - 2) as u8);
        desc.push(0x00); // descriptor_number, last_descriptor_number
        desc.extend_from_slice(b"bul");
        desc.push(0); // Length of items (items are not supported)
        desc.push(text.len() as u8);
        desc.extend_from_slice(text.as_bytes());

        self.add_event(event_id, running, start_time, duration_sec, desc)
    }

    /// Serializes the table into TS packets.
    pub fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut secdata = [0_u8; crate::section::SECTION_BUFFER_SIZE];
        let section = &self.state.section;
        section.generate_header(&mut secdata);
        let mut curpos = 8;

        secdata[curpos] = (self.transport_stream_id >> 8) as u8;
        secdata[curpos + 1] = (self.transport_stream_id & 0xFF) as u8;
        secdata[curpos + 2] = (self.original_network_id >> 8) as u8;
        secdata[curpos + 3] = (self.original_network_id & 0xFF) as u8;
        secdata[curpos + 4] = self.segment_last_section_number;
        secdata[curpos + 5] = self.last_table_id;
        curpos += 6;

        for event in &self.events {
            let entry = EitEventBits::new()
                .with_event_id(event.event_id)
                .with_start_time_mjd(event.start_time_mjd)
                .with_start_time_bcd(event.start_time_bcd & 0xFF_FFFF)
                .with_duration_bcd(event.duration_bcd & 0xFF_FFFF)
                .with_running_status(event.running_status & 0x7)
                .with_free_ca_mode(event.free_ca_mode)
                .with_descriptors_length((event.descriptors.len() as u16) & 0xFFF);
            secdata[curpos..curpos + 12].copy_from_slice(&entry.into_bytes());
            curpos += 12;
            secdata[curpos..curpos + event.descriptors.len()].copy_from_slice(&event.descriptors);
            curpos += event.descriptors.len();
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
    pub fn copy(&self) -> Option<Eit> {
        let mut new = Eit::new();
        for i in 0..self.state.section.num_packets() {
            new.push_packet(self.state.section.packet(i));
        }
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying EIT!");
            None
        }
    }

    /// Compares the section identity and raw bytes of two tables.
    pub fn is_same(&self, other: &Eit) -> bool {
        self.state.section.is_same(&other.state.section)
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data(
                "EIT (tspacket->struct)",
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
        compare_data("EIT (struct->tspacket)", self.section().packets_bytes(), &flat);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        self.state.section.dump();

        info!("  * EIT data");
        info!(
            "    * ts_stream_id    : 0x{:04x} ({})",
            self.transport_stream_id, self.transport_stream_id
        );
        info!(
            "    * org_network_id  : 0x{:04x} ({})",
            self.original_network_id, self.original_network_id
        );
        info!("    * seg_last_sec_num: {}", self.segment_last_section_number);
        info!(
            "    * last_table_id   : 0x{:02x} ({})",
            self.last_table_id, self.last_table_id
        );
        info!("    * num_events      : {}", self.events.len());

        for (i, event) in self.events.iter().enumerate() {
            let (_, hour, min, sec) = decode_bcd_duration(event.duration_bcd);
            info!("    * Event_id [{:02}/{:02}]", i + 1, self.events.len());
            info!("      - Event_id  : 0x{:04x} ({})", event.event_id, event.event_id);
            if let Some(start) = decode_mjd_datetime(event.start_time_mjd, event.start_time_bcd) {
                info!(
                    "      - Start_time: {} (0x{:04x}{:06x})",
                    start, event.start_time_mjd, event.start_time_bcd
                );
            }
            info!(
                "      - Duration  : {:02}:{:02}:{:02} (0x{:06x})",
                hour, min, sec, event.duration_bcd
            );
            info!(
                "      - Running_status: {} free_CA_mode: {} /desc_size: {}/",
                event.running_status,
                event.free_ca_mode as u8,
                event.descriptors.len()
            );
            if !event.descriptors.is_empty() {
                dump_descriptors(&event.descriptors);
            }
        }

        self.check_generator();
    }
}

impl SectionTable for Eit {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Eit::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Eit::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        Eit::generate(self)
    }

    fn dump(&self) {
        Eit::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 1234567890;

    #[test]
    fn short_event_fills_exactly_one_packet() {
        let mut eit = Eit::init(1, 2, 3, 0x4E, 0, 0);
        let name = "x".repeat(95);
        let text = "y".repeat(51);
        assert!(eit.add_short_event_descriptor(4, true, START, 3600, &name, &text));

        // 3 header bytes + section_length == one full packet payload
        assert_eq!(eit.section().section_length as usize + 3, 183);
        let packets = eit.generate();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn short_event_spills_two_crc_bytes() {
        let mut eit = Eit::init(1, 2, 3, 0x4E, 0, 0);
        let name = "x".repeat(95);
        let text = "y".repeat(53);
        assert!(eit.add_short_event_descriptor(4, true, START, 3600, &name, &text));

        assert_eq!(eit.section().section_length as usize + 3, 185);
        let packets = eit.generate();
        assert_eq!(packets.len(), 2);

        // The second packet carries exactly the last two CRC bytes
        let second = TsHeader::parse(&packets[1]).unwrap();
        assert!(!second.pusi);
        assert!(packets[1][6..].iter().all(|&b| b == 0xFF));
        let mut section_bytes = Vec::new();
        section_bytes.extend_from_slice(&packets[0][5..]);
        section_bytes.extend_from_slice(&packets[1][4..6]);
        assert_eq!(crc32::crc32(&section_bytes), 0);
    }

    #[test]
    fn event_fields_round_trip() {
        let mut eit = Eit::init(1, 2, 3, 0x4E, 0, 0);
        assert!(eit.add_short_event_descriptor(4, true, START, 3600, "event", "text"));
        assert!(eit.add_extended_event_descriptor(5, false, START + 3600, 1800, "long text"));

        let copy = eit.copy().expect("round-trips through packets");
        assert_eq!(copy.section().id_number, 1);
        assert_eq!(copy.transport_stream_id, 2);
        assert_eq!(copy.original_network_id, 3);
        assert_eq!(copy.last_table_id, 0x4E);
        assert_eq!(copy.events, eit.events);

        let event = &copy.events[0];
        assert_eq!(event.running_status, 4);
        assert_eq!(event.descriptors[0], 0x4D);
        assert_eq!(&event.descriptors[2..5], b"bul");
        assert_eq!(
            crate::time::decode_mjd(event.start_time_mjd, event.start_time_bcd),
            START
        );
        assert_eq!(decode_bcd_duration(event.duration_bcd).0, 3600);

        let extended = &copy.events[1];
        assert_eq!(extended.running_status, 1);
        assert_eq!(extended.descriptors[0], 0x4E);
        assert_eq!(extended.descriptors[2], 0x00);
        assert_eq!(&extended.descriptors[3..6], b"bul");
        assert_eq!(extended.descriptors[6], 0);
    }

    #[test]
    fn schedule_table_ids_accepted() {
        let mut eit = Eit::init(1, 2, 3, 0x55, 0, 0);
        eit.add_short_event_descriptor(4, true, START, 60, "e", "");
        let packets = eit.generate();
        let mut replayed = Eit::new();
        for packet in &packets {
            replayed.push_packet(packet);
        }
        assert!(replayed.is_initialized());
        assert_eq!(replayed.section().table_id, 0x55);
    }

    #[test]
    fn out_of_range_table_ids_rejected() {
        // 0x60 is an other-TS schedule id; this accumulator must ignore it
        let mut eit = Eit::init(1, 2, 3, 0x4E, 0, 0);
        eit.add_short_event_descriptor(4, true, START, 60, "e", "");
        let mut packets = eit.generate();
        packets[0][5] = 0x60;
        let mut replayed = Eit::new();
        replayed.push_packet(&packets[0]);
        assert!(!replayed.is_initialized());
    }

    #[test]
    fn refuses_additions_past_section_limit() {
        let mut eit = Eit::init(1, 2, 3, 0x50, 0, 0);
        let name = "z".repeat(117);
        let text = "x".repeat(131);
        let mut added = 0;
        while eit.add_short_event_descriptor(added as u16, true, START, 3600, &name, &text) {
            added += 1;
            assert!(added < 64, "the limit must kick in");
        }
        let length = eit.section().section_length;
        assert!(length <= MAX_SECTION_LENGTH);
        let events = eit.events.len();
        assert!(!eit.add_short_event_descriptor(9999, true, START, 3600, &name, &text));
        assert_eq!(eit.section().section_length, length);
        assert_eq!(eit.events.len(), events);
    }
}
