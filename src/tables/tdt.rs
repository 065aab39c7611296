//! Time/date (TDT) and time offset (TOT) table codec.
//!
//! Both tables are non-syntactic single-packet sections on PID 0x14
//! carrying an MJD+BCD UTC timestamp; the TOT adds a descriptor loop
//! (usually one local_time_offset_descriptor) and a CRC.

use super::SectionTable;
use crate::desc::dump_descriptors;
use crate::packet::TsHeader;
use crate::time::{decode_mjd, decode_mjd_datetime, encode_mjd, euro_dst_end, euro_dst_start};
use crate::{compare_data, crc32, TS_MAX_PAYLOAD_SIZE, TS_PACKET_SIZE};
use chrono::{DateTime, Datelike, Utc};
use log::{info, warn};

/// Time/date or time offset table. `table_id` 0x70 marks a TDT, 0x73 a TOT.
#[derive(Clone)]
pub struct Tdt {
    /// TS header used when regenerating the packet.
    pub ts_header: TsHeader,
    /// Offset from the first payload byte to the section start.
    pub pointer_field: u8,
    /// 0x70 for TDT, 0x73 for TOT.
    pub table_id: u8,
    /// Always zero for these tables.
    pub section_syntax_indicator: bool,
    /// Reserved bit after the syntax indicator.
    pub reserved_1: u8,
    /// Two reserved bits before the section length.
    pub reserved_2: u8,
    /// Section length in bytes.
    pub section_length: u16,
    /// UTC day as MJD.
    pub mjd: u16,
    /// UTC time of day as BCD hh:mm:ss.
    pub bcd: u32,
    /// Four reserved bits before the TOT descriptor loop length.
    pub reserved_3: u8,
    /// TOT descriptor blob (empty for TDT).
    pub descriptors: Vec<u8>,
    /// TOT CRC as read from the wire.
    pub crc: u32,
    /// Decoded UTC timestamp.
    pub utc: i64,
    packet_data: Box<[u8; TS_PACKET_SIZE]>,
    initialized: bool,
}

impl Default for Tdt {
    fn default() -> Self {
        Self::new()
    }
}

impl Tdt {
    /// Allocates an empty accumulator.
    pub fn new() -> Tdt {
        Tdt {
            ts_header: TsHeader::default(),
            pointer_field: 0,
            table_id: 0,
            section_syntax_indicator: false,
            reserved_1: 0,
            reserved_2: 0,
            section_length: 0,
            mjd: 0,
            bcd: 0,
            reserved_3: 0,
            descriptors: Vec::new(),
            crc: 0,
            utc: 0,
            packet_data: Box::new([0; TS_PACKET_SIZE]),
            initialized: false,
        }
    }

    fn init_empty(ts: i64, tot: bool) -> Tdt {
        let mut tdt = Tdt::new();
        tdt.ts_header = TsHeader {
            pid: 0x0014,
            pusi: true,
            payload_field: true,
            payload_offset: 4,
            ..TsHeader::default()
        };
        tdt.table_id = 0x70;
        tdt.section_syntax_indicator = false;
        tdt.reserved_1 = 1;
        tdt.reserved_2 = 3;
        tdt.section_length = 5; // 5 bytes UTC_time

        let (mjd, bcd) = encode_mjd(ts);
        tdt.mjd = mjd;
        tdt.bcd = bcd;
        tdt.utc = decode_mjd(mjd, bcd);

        if tot {
            tdt.table_id = 0x73;
            tdt.reserved_3 = 0xF;
            // 5 bytes UTC_time, 2 bytes loop length, 4 bytes CRC
            tdt.section_length = 5 + 2 + 4;
        }

        tdt.initialized = true;
        tdt.regenerate_packet();
        tdt
    }

    /// Builds a TDT carrying `ts`.
    pub fn init(ts: i64) -> Tdt {
        Tdt::init_empty(ts, false)
    }

    /// Builds a TOT carrying `ts` with an empty descriptor loop.
    pub fn init_tot(ts: i64) -> Tdt {
        Tdt::init_empty(ts, true)
    }

    /// True once a table has been parsed or seeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The retained single-packet image.
    pub fn packet(&self) -> &[u8; TS_PACKET_SIZE] {
        &self.packet_data
    }

    fn clear(&mut self) {
        let mut fresh = Tdt::new();
        std::mem::swap(&mut fresh.packet_data, &mut self.packet_data);
        *self = fresh;
        self.packet_data.iter_mut().for_each(|b| *b = 0);
    }

    /// Feeds one TS packet; returns self for chaining. Packets off PID 0x14
    /// or with a broken section are discarded.
    pub fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) -> &mut Self {
        let hdr = match TsHeader::parse(packet) {
            Ok(hdr) if hdr.payload_field => hdr,
            _ => return self,
        };
        if hdr.pid != 0x0014 {
            return self;
        }
        if !self.parse(&hdr, packet) {
            self.clear();
        }
        self
    }

    fn parse(&mut self, hdr: &TsHeader, packet: &[u8; TS_PACKET_SIZE]) -> bool {
        let payload = &packet[hdr.payload_offset as usize..];
        if payload.is_empty() {
            return false;
        }
        let pointer_field = payload[0];
        let data = &payload[1 + pointer_field as usize..];
        if data.len() < 8 {
            warn!("!!! Section start outside of TS packet!");
            return false;
        }

        if data[0] != 0x70 && data[0] != 0x73 {
            warn!("Invalid TDT/TOT Table_ID 0x{:02x}", data[0]);
            return false;
        }

        self.ts_header = *hdr;
        self.pointer_field = pointer_field;
        self.table_id = data[0];
        self.section_syntax_indicator = data[1] >> 7 != 0;
        self.reserved_1 = (data[1] >> 6) & 0x1;
        self.reserved_2 = (data[1] >> 4) & 0x3;
        self.section_length = (((data[1] & 0x0F) as u16) << 8) | data[2] as u16;
        if self.section_length as usize > TS_MAX_PAYLOAD_SIZE - 8 {
            warn!(
                "TDT/TOT section length is too big: {} (max: {})",
                self.section_length,
                TS_MAX_PAYLOAD_SIZE - 8
            );
            return false;
        }

        self.mjd = ((data[3] as u16) << 8) | data[4] as u16;
        self.bcd = ((data[5] as u32) << 16) | ((data[6] as u32) << 8) | data[7] as u32;

        if self.table_id == 0x73 {
            if data.len() < 10 {
                return false;
            }
            self.reserved_3 = data[8] >> 4;
            let descriptors_size = (((data[8] & 0x0F) as usize) << 8) | data[9] as usize;
            if descriptors_size > TS_MAX_PAYLOAD_SIZE - 10 {
                warn!(
                    "TDT/TOT descriptors_size is too big: {} (max: {})",
                    descriptors_size,
                    TS_MAX_PAYLOAD_SIZE - 10
                );
                return false;
            }
            if data.len() < 10 + descriptors_size + 4 {
                return false;
            }
            self.descriptors = data[10..10 + descriptors_size].to_vec();
            let crc_at = 10 + descriptors_size;
            self.crc = u32::from_be_bytes([
                data[crc_at],
                data[crc_at + 1],
                data[crc_at + 2],
                data[crc_at + 3],
            ]);
            if !crc32::section_crc_check(&data[..crc_at + 4], "TOT") {
                return false;
            }
        } else {
            self.descriptors.clear();
            self.crc = 0;
        }

        self.utc = decode_mjd(self.mjd, self.bcd);
        self.packet_data.copy_from_slice(packet);
        self.initialized = true;
        true
    }

    /// Writes the single TS packet image of this table.
    pub fn generate_packet(&self, packet: &mut [u8; TS_PACKET_SIZE]) {
        self.ts_header.generate(packet);

        packet[4] = self.pointer_field;
        let start = 4 + self.pointer_field as usize + 1;

        packet[start] = self.table_id;
        packet[start + 1] = ((self.section_syntax_indicator as u8) << 7)
            | ((self.reserved_1 & 0x1) << 6)
            | ((self.reserved_2 & 0x3) << 4)
            | ((self.section_length >> 8) & 0x0F) as u8;
        packet[start + 2] = (self.section_length & 0xFF) as u8;

        packet[start + 3] = (self.mjd >> 8) as u8;
        packet[start + 4] = (self.mjd & 0xFF) as u8;
        packet[start + 5] = (self.bcd >> 16) as u8;
        packet[start + 6] = ((self.bcd >> 8) & 0xFF) as u8;
        packet[start + 7] = (self.bcd & 0xFF) as u8;

        if self.table_id == 0x73 {
            packet[start + 8] =
                ((self.reserved_3 & 0xF) << 4) | ((self.descriptors.len() >> 8) & 0x0F) as u8;
            packet[start + 9] = (self.descriptors.len() & 0xFF) as u8;
            packet[start + 10..start + 10 + self.descriptors.len()]
                .copy_from_slice(&self.descriptors);
            let crc_at = start + 10 + self.descriptors.len();
            let crc = crc32::crc32(&packet[start..crc_at]);
            packet[crc_at..crc_at + 4].copy_from_slice(&crc.to_be_bytes());
        }
    }

    fn regenerate_packet(&mut self) {
        let mut packet = [0_u8; TS_PACKET_SIZE];
        self.generate_packet(&mut packet);
        self.packet_data.copy_from_slice(&packet);
    }

    /// Rewrites the carried UTC time.
    pub fn set_time(&mut self, ts: i64) {
        let (mjd, bcd) = encode_mjd(ts);
        self.mjd = mjd;
        self.bcd = bcd;
        self.utc = decode_mjd(mjd, bcd);
        self.regenerate_packet();
    }

    /// Writes a local_time_offset_descriptor (tag 0x58) for country "BUL":
    /// current offset, polarity, and the next change time/offset. TOT only.
    pub fn set_localtime_offset(
        &mut self,
        now: i64,
        change_time: i64,
        polarity: u8,
        offset: u16,
        offset_next: u16,
    ) {
        if self.table_id != 0x73 {
            return;
        }

        let (mjd, bcd) = encode_mjd(now);
        self.mjd = mjd;
        self.bcd = bcd;
        self.utc = decode_mjd(mjd, bcd);

        let (change_mjd, change_bcd) = encode_mjd(change_time);

        if self.descriptors.is_empty() {
            self.descriptors = vec![0; 15];
            self.section_length += 15;
        }
        let lto = &mut self.descriptors[..15];
        lto[0] = 0x58; // Descriptor tag
        lto[1] = 13; // 13 octets
        lto[2] = b'B'; // Country code
        lto[3] = b'U';
        lto[4] = b'L';
        // Country region (6 bits), reserved (1 bit), polarity (1 bit)
        lto[5] = 0x02 | (polarity & 0x1);

        lto[6] = (offset >> 8) as u8; // Local time offset (16 bits, bcd)
        lto[7] = (offset & 0xFF) as u8;

        lto[8] = (change_mjd >> 8) as u8; // Time of change (40 bits)
        lto[9] = (change_mjd & 0xFF) as u8;
        lto[10] = (change_bcd >> 16) as u8;
        lto[11] = ((change_bcd >> 8) & 0xFF) as u8;
        lto[12] = (change_bcd & 0xFF) as u8;

        lto[13] = (offset_next >> 8) as u8; // Next time offset (16 bits, bcd)
        lto[14] = (offset_next & 0xFF) as u8;

        self.regenerate_packet();
    }

    /// Computes the Europe/Sofia local time offset schedule for `now` and
    /// writes it through [`Tdt::set_localtime_offset`].
    pub fn set_localtime_offset_sofia(&mut self, now: i64) {
        let polarity = 0; // UTC + offset
        let year = DateTime::<Utc>::from_timestamp(now, 0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .year();
        let dst_start = euro_dst_start(year);
        let dst_end = euro_dst_end(year);

        let (current_offset, next_offset, change_time) = if now < dst_start {
            // Winter time now, summer next
            (0x0200, 0x0300, dst_start)
        } else if now < dst_end {
            // Summer time now, winter next
            (0x0300, 0x0200, dst_end)
        } else {
            // Winter again, next change starts next year's summer
            (0x0200, 0x0300, euro_dst_start(year + 1))
        };

        self.set_localtime_offset(now, change_time, polarity, current_offset, next_offset);
    }

    /// Re-parses the retained packet image through a fresh accumulator.
    pub fn copy(&self) -> Option<Tdt> {
        let mut new = Tdt::new();
        new.push_packet(&self.packet_data);
        if new.is_initialized() {
            Some(new)
        } else {
            warn!("Error copying TDT/TOT!");
            None
        }
    }

    /// Compares identity, time fields and descriptor bytes.
    pub fn is_same(&self, other: &Tdt) -> bool {
        self.table_id == other.table_id
            && self.section_length == other.section_length
            && self.mjd == other.mjd
            && self.bcd == other.bcd
            && self.descriptors == other.descriptors
    }

    fn check_generator(&self) {
        if let Some(copy) = self.copy() {
            compare_data("TDT/TOT (packet->data)", &copy.packet_data[..], &self.packet_data[..]);
        }
        let mut packet = [0_u8; TS_PACKET_SIZE];
        self.generate_packet(&mut packet);
        compare_data("TDT/TOT (data->packet)", &self.packet_data[..], &packet);
    }

    /// Logs the structured table and runs the generator self-check.
    pub fn dump(&self) {
        let prefix = if self.table_id == 0x70 { "TDT" } else { "TOT" };
        info!("{} packet dump", prefix);
        self.ts_header.dump();
        info!(
            "    - Table id           : {:03x} ({}) {}",
            self.table_id, self.table_id, prefix
        );
        info!(
            "    - Section length     : {:03x} ({})",
            self.section_length, self.section_length
        );
        info!("  * {} data", prefix);
        if let Some(when) = decode_mjd_datetime(self.mjd, self.bcd) {
            info!(
                "    - MJD                : 0x{:04x} ({}) unixts: {}",
                self.mjd,
                when.date(),
                self.utc
            );
            info!("    - BCD                : 0x{:06x} ({})", self.bcd, when.time());
        }
        info!("    - UTC Time           : {}", self.utc);
        if self.table_id == 0x73 {
            if !self.descriptors.is_empty() {
                dump_descriptors(&self.descriptors);
            }
            info!("  * CRC 0x{:08x}", self.crc);
        }

        self.check_generator();
    }
}

impl SectionTable for Tdt {
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        Tdt::push_packet(self, packet);
    }

    fn is_initialized(&self) -> bool {
        Tdt::is_initialized(self)
    }

    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut packet = [0_u8; TS_PACKET_SIZE];
        self.generate_packet(&mut packet);
        vec![packet]
    }

    fn dump(&self) {
        Tdt::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINTER_TS: i64 = 1234567890; // 2009-02-13 23:31:30 UTC
    const SUMMER_TS: i64 = 1246406400; // 2009-07-01 00:00:00 UTC

    #[test]
    fn tdt_round_trip() {
        let tdt = Tdt::init(WINTER_TS);
        assert_eq!(tdt.table_id, 0x70);
        assert_eq!(tdt.section_length, 5);
        assert_eq!(tdt.utc, WINTER_TS);

        let copy = tdt.copy().expect("parses its own packet");
        assert_eq!(copy.table_id, 0x70);
        assert_eq!(copy.mjd, tdt.mjd);
        assert_eq!(copy.bcd, tdt.bcd);
        assert_eq!(copy.utc, WINTER_TS);
        assert!(tdt.is_same(&copy));
    }

    #[test]
    fn set_time_updates_packet() {
        let mut tdt = Tdt::init(WINTER_TS);
        tdt.set_time(WINTER_TS + 3600);
        let copy = tdt.copy().unwrap();
        assert_eq!(copy.utc, WINTER_TS + 3600);
    }

    #[test]
    fn sofia_offsets_in_winter() {
        let mut tot = Tdt::init_tot(WINTER_TS);
        tot.set_localtime_offset_sofia(WINTER_TS);

        assert_eq!(tot.table_id, 0x73);
        assert_eq!(tot.descriptors.len(), 15);
        let lto = &tot.descriptors;
        assert_eq!(lto[0], 0x58);
        assert_eq!(lto[1], 13);
        assert_eq!(&lto[2..5], b"BUL");
        assert_eq!(lto[5] & 0x01, 0); // polarity: UTC + offset
        assert_eq!(((lto[6] as u16) << 8) | lto[7] as u16, 0x0200);
        assert_eq!(((lto[13] as u16) << 8) | lto[14] as u16, 0x0300);

        // Change time is the 2009 DST start (March 29, 01:00 UTC)
        let change_mjd = ((lto[8] as u16) << 8) | lto[9] as u16;
        let change_bcd =
            ((lto[10] as u32) << 16) | ((lto[11] as u32) << 8) | lto[12] as u32;
        assert_eq!(decode_mjd(change_mjd, change_bcd), euro_dst_start(2009));

        // A TOT survives a wire round trip with its CRC intact
        let copy = tot.copy().expect("parses its own packet");
        assert_eq!(copy.descriptors, tot.descriptors);
        assert_eq!(copy.utc, WINTER_TS);
    }

    #[test]
    fn sofia_offsets_in_summer() {
        let mut tot = Tdt::init_tot(SUMMER_TS);
        tot.set_localtime_offset_sofia(SUMMER_TS);
        let lto = &tot.descriptors;
        assert_eq!(((lto[6] as u16) << 8) | lto[7] as u16, 0x0300);
        assert_eq!(((lto[13] as u16) << 8) | lto[14] as u16, 0x0200);
        let change_mjd = ((lto[8] as u16) << 8) | lto[9] as u16;
        let change_bcd =
            ((lto[10] as u32) << 16) | ((lto[11] as u32) << 8) | lto[12] as u32;
        assert_eq!(decode_mjd(change_mjd, change_bcd), euro_dst_end(2009));
    }

    #[test]
    fn corrupted_tot_crc_is_dropped() {
        let mut tot = Tdt::init_tot(WINTER_TS);
        tot.set_localtime_offset_sofia(WINTER_TS);
        let mut packet = *tot.packet();
        packet[10] ^= 0x01;
        let mut fresh = Tdt::new();
        fresh.push_packet(&packet);
        assert!(!fresh.is_initialized());
    }

    #[test]
    fn wrong_pid_ignored() {
        let tdt = Tdt::init(WINTER_TS);
        let mut packet = *tdt.packet();
        packet[2] = 0x15; // PID 0x15
        let mut fresh = Tdt::new();
        fresh.push_packet(&packet);
        assert!(!fresh.is_initialized());
    }
}
