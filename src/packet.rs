//! TS packet codec: the 4-byte link-layer header, adaptation field, PCR,
//! scrambling control, and the 33-bit PTS/DTS marker-interleaved form.

use super::{Error, ErrorDetails, Result, TS_MAX_PAYLOAD_SIZE, TS_PACKET_SIZE};
use crate::pts_format_args;
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::fmt::{Debug, Formatter};

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub scramble: B2,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Packets may contain adaptation meta data in addition or in lieu of payload data. This header
/// specifies the particular type(s) of meta-data contained.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// TSC information used in a packet's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrambleControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

impl ScrambleControl {
    /// Maps the two wire bits to the control variant.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => ScrambleControl::NotScrambled,
            1 => ScrambleControl::Reserved,
            2 => ScrambleControl::ScrambledEvenKey,
            _ => ScrambleControl::ScrambledOddKey,
        }
    }

    /// The two wire bits of this variant.
    pub fn bits(self) -> u8 {
        match self {
            ScrambleControl::NotScrambled => 0,
            ScrambleControl::Reserved => 1,
            ScrambleControl::ScrambledEvenKey => 2,
            ScrambleControl::ScrambledOddKey => 3,
        }
    }
}

/// Structured view of one TS packet header with the derived payload
/// geometry. This is mutable working memory; the wire layout lives in
/// [`PacketHeader`]/[`AdaptationFieldHeader`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub tei: bool,
    /// Payload unit start indicator.
    pub pusi: bool,
    /// Transport priority.
    pub prio: bool,
    /// 13-bit packet identifier.
    pub pid: u16,
    /// Two scrambling-control bits.
    pub scramble: u8,
    /// Adaptation field present.
    pub adapt_field: bool,
    /// Payload present.
    pub payload_field: bool,
    /// 4-bit continuity counter.
    pub continuity: u8,
    /// Adaptation field length byte (when the field is present).
    pub adapt_len: u8,
    /// Adaptation field flags byte (when `adapt_len > 0`).
    pub adapt_flags: u8,
    /// First payload byte offset within the packet.
    pub payload_offset: u8,
    /// Payload bytes within the packet (0 when no payload is flagged).
    pub payload_size: u8,
}

impl TsHeader {
    /// Parses a packet header, rejecting bad sync bytes, contradictory
    /// flags, and impossible adaptation lengths (`adapt_len + 5 <= 188`).
    pub fn parse(packet: &[u8; TS_PACKET_SIZE]) -> Result<TsHeader> {
        let bits = PacketHeader::from_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if bits.sync_byte() != 0x47 {
            return Err(Error {
                location: 0,
                details: ErrorDetails::LostSync,
            });
        }

        let mut hdr = TsHeader {
            tei: bits.tei(),
            pusi: bits.pusi(),
            prio: bits.priority(),
            pid: bits.pid(),
            scramble: bits.scramble(),
            adapt_field: bits.has_adaptation_field(),
            payload_field: bits.has_payload(),
            continuity: bits.continuity_counter(),
            ..TsHeader::default()
        };

        if !hdr.adapt_field && !hdr.payload_field {
            return Err(Error {
                location: 3,
                details: ErrorDetails::BadAdaptationHeader,
            });
        }

        if hdr.adapt_field {
            hdr.adapt_len = packet[4];
            if hdr.adapt_len > 0 {
                hdr.adapt_flags = packet[5];
            }
            if hdr.payload_field && hdr.adapt_len > 182 {
                return Err(Error {
                    location: 4,
                    details: ErrorDetails::BadAdaptationHeader,
                });
            }
            if hdr.adapt_len as usize + 5 > TS_PACKET_SIZE {
                return Err(Error {
                    location: 4,
                    details: ErrorDetails::BadAdaptationHeader,
                });
            }
            hdr.payload_offset = 5 + hdr.adapt_len;
        } else {
            hdr.payload_offset = 4;
        }

        if hdr.payload_field {
            if hdr.payload_offset as usize > TS_MAX_PAYLOAD_SIZE {
                return Err(Error {
                    location: 4,
                    details: ErrorDetails::BadAdaptationHeader,
                });
            }
            hdr.payload_size = (TS_PACKET_SIZE - hdr.payload_offset as usize) as u8;
        }

        Ok(hdr)
    }

    /// Regenerates the packet header bytes; the rest of the packet is
    /// filled with 0xFF stuffing first.
    pub fn generate(&self, packet: &mut [u8; TS_PACKET_SIZE]) {
        for b in packet.iter_mut() {
            *b = 0xFF;
        }
        let bits = PacketHeader::new()
            .with_sync_byte(0x47)
            .with_tei(self.tei)
            .with_pusi(self.pusi)
            .with_priority(self.prio)
            .with_pid(self.pid)
            .with_scramble(self.scramble & 0x3)
            .with_has_adaptation_field(self.adapt_field)
            .with_has_payload(self.payload_field)
            .with_continuity_counter(self.continuity & 0xF);
        packet[0..4].copy_from_slice(&bits.into_bytes());
        if self.adapt_field {
            packet[4] = self.adapt_len;
            if self.adapt_len > 0 {
                packet[5] = self.adapt_flags;
            }
        }
    }

    /// Logs a single-line trace of the header fields.
    pub fn dump(&self) {
        log::info!(
            "*** tei:{} pusi:{} prio:{} pid:{:04x} ({}) scramble:{} adapt:{} payload:{} adapt_len:{} adapt_flags:{} | pofs:{} plen:{}",
            self.tei as u8,
            self.pusi as u8,
            self.prio as u8,
            self.pid,
            self.pid,
            self.scramble,
            self.adapt_field as u8,
            self.payload_field as u8,
            self.adapt_len,
            self.adapt_flags,
            self.payload_offset,
            self.payload_size
        );
    }

    /// The payload bytes of `packet` as addressed by this header.
    pub fn payload<'a>(&self, packet: &'a [u8; TS_PACKET_SIZE]) -> &'a [u8] {
        &packet[self.payload_offset as usize..]
    }
}

/// Overwrites `packet` with a null packet (PID 0x1FFF, stuffing payload).
pub fn init_null_packet(packet: &mut [u8; TS_PACKET_SIZE]) {
    for b in packet.iter_mut() {
        *b = 0xFF;
    }
    packet[0] = 0x47;
    packet[1] = 0x1f;
    packet[2] = 0xff;
    packet[3] = 0x00;
}

/// Scrambling control of a raw packet.
pub fn packet_scramble_control(packet: &[u8; TS_PACKET_SIZE]) -> ScrambleControl {
    ScrambleControl::from_bits(packet[3] >> 6)
}

/// True when the packet is scrambled with either key.
pub fn packet_is_scrambled(packet: &[u8; TS_PACKET_SIZE]) -> bool {
    packet[3] >> 6 > 1
}

/// Rewrites the packet's scrambling-control bits.
pub fn set_packet_scrambled(packet: &mut [u8; TS_PACKET_SIZE], control: ScrambleControl) {
    packet[3] = (packet[3] & 0x3F) | (control.bits() << 6);
}

/// Program clock reference (PCR) for synchronizing the decoder with the encoder.
///
/// Periodically sent for every program contained in the transport stream.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
pub struct PcrTimestamp {
    /// 33-bits of a 90kHz base clock. May be formatted with [`pts_format_args`].
    pub base: u64,
    /// 9-bits of a 27MHz clock rolling over every 300 counts to the base.
    pub extension: u16,
}

impl PcrTimestamp {
    /// The combined 27MHz value `base * 300 + extension`.
    pub fn pcr(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }

    /// Splits a 27MHz value into base and extension.
    pub fn from_pcr(pcr: u64) -> Self {
        Self {
            base: pcr / 300,
            extension: (pcr % 300) as u16,
        }
    }
}

impl Debug for PcrTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcrTimestamp")
            .field("base", &pts_format_args!(self.base))
            .field("extension", &self.extension)
            .finish()
    }
}

pub(crate) fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

/// True when the packet's adaptation field signals a PCR.
pub fn packet_has_pcr(packet: &[u8; TS_PACKET_SIZE]) -> bool {
    packet[0] == 0x47
        && packet[3] & 0x20 != 0 // adaptation field present
        && packet[4] > 6
        && packet[5] & 0x10 != 0 // PCR flag
}

/// Reads the PCR split into base and extension; [`packet_has_pcr`] must
/// hold.
pub fn packet_pcr_parts(packet: &[u8; TS_PACKET_SIZE]) -> Option<PcrTimestamp> {
    if !packet_has_pcr(packet) {
        return None;
    }
    let b: &[u8] = &packet[6..12];
    let mut six = [0_u8; 6];
    six.copy_from_slice(b);
    Some(parse_pcr(&six))
}

/// Reads the combined 27MHz PCR value.
pub fn packet_pcr(packet: &[u8; TS_PACKET_SIZE]) -> Option<u64> {
    packet_pcr_parts(packet).map(|p| p.pcr())
}

/// Writes a PCR (base + extension) at the packet's PCR position (byte 6).
pub fn set_packet_pcr_parts(packet: &mut [u8; TS_PACKET_SIZE], pcr: &PcrTimestamp) {
    packet[6] = ((pcr.base >> 25) & 0xFF) as u8;
    packet[7] = ((pcr.base >> 17) & 0xFF) as u8;
    packet[8] = ((pcr.base >> 9) & 0xFF) as u8;
    packet[9] = ((pcr.base >> 1) & 0xFF) as u8;
    // 0x7e are the six reserved bits
    packet[10] = 0x7e | (((pcr.extension >> 8) & 0x01) as u8) | (((pcr.base & 0x01) as u8) << 7);
    packet[11] = (pcr.extension & 0xFF) as u8;
}

/// Writes a combined 27MHz PCR value.
pub fn set_packet_pcr(packet: &mut [u8; TS_PACKET_SIZE], pcr: u64) {
    set_packet_pcr_parts(packet, &PcrTimestamp::from_pcr(pcr));
}

const MAX_PTS_VALUE: u64 = 0x1_FFFF_FFFF;

/// Decodes a 33-bit PTS/DTS from its 5-byte marker-interleaved form.
///
/// `required_guard` is the nibble expected in the top four bits: 2 for a
/// solitary PTS, 3 for a PTS preceding a DTS, 1 for a DTS. Guard and marker
/// violations are logged but decoding continues.
pub fn decode_pts_dts(data: &[u8; 5], required_guard: u8) -> u64 {
    if data[0] >> 4 != required_guard {
        warn!(
            "PTS/DTS guard mismatch, expected {} got {}",
            required_guard,
            data[0] >> 4
        );
    }
    if data[0] & 0x01 == 0 || data[2] & 0x01 == 0 || data[4] & 0x01 == 0 {
        warn!("PTS/DTS marker bits are not all set");
    }
    let pts1 = ((data[0] & 0x0E) as u64) >> 1;
    let pts2 = ((data[1] as u64) << 7) | (((data[2] & 0xFE) as u64) >> 1);
    let pts3 = ((data[3] as u64) << 7) | (((data[4] & 0xFE) as u64) >> 1);
    (pts1 << 30) | (pts2 << 15) | pts3
}

/// Encodes a 33-bit PTS/DTS with the given guard nibble. Values above
/// 2^33 - 1 are clamped by repeated modulus subtraction (logged once).
pub fn encode_pts_dts(data: &mut [u8; 5], guard: u8, mut value: u64) {
    if value > MAX_PTS_VALUE {
        warn!("PTS/DTS value {} above 2^33-1, clamping", value);
        while value > MAX_PTS_VALUE {
            value -= MAX_PTS_VALUE;
        }
    }
    let pts1 = ((value >> 30) & 0x07) as u32;
    let pts2 = ((value >> 15) & 0x7FFF) as u32;
    let pts3 = (value & 0x7FFF) as u32;

    data[0] = (guard << 4) | ((pts1 << 1) as u8) | 0x01;
    data[1] = ((pts2 & 0x7F80) >> 7) as u8;
    data[2] = (((pts2 & 0x007F) << 1) as u8) | 0x01;
    data[3] = ((pts3 & 0x7F80) >> 7) as u8;
    data[4] = (((pts3 & 0x007F) << 1) as u8) | 0x01;
}

/// Probes a packet for the start of a PES unit. Returns the payload offset
/// and the declared PES packet length when the payload begins with the PES
/// start prefix on a supported stream id.
pub fn packet_pes_start(packet: &[u8; TS_PACKET_SIZE]) -> Option<(usize, u16)> {
    let hdr = TsHeader::parse(packet).ok()?;
    if !hdr.pusi || !hdr.payload_field {
        return None;
    }
    let ofs = hdr.payload_offset as usize;
    // 6 bytes PES header, 2 bytes PES flags
    if ofs + 6 + 2 >= TS_PACKET_SIZE {
        return None;
    }
    let payload = &packet[ofs..];
    if payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
        return None;
    }
    let stream_id = payload[3];
    if !crate::pes::is_pes_stream_supported(stream_id) {
        return None;
    }
    let pes_packet_len = ((payload[4] as u16) << 8) | payload[5] as u16;
    Some((ofs, pes_packet_len))
}

/// Decodes the PTS and DTS carried by a PES-start packet, when present.
pub fn packet_pts_dts(packet: &[u8; TS_PACKET_SIZE]) -> Option<(Option<u64>, Option<u64>)> {
    let (ofs, _) = packet_pes_start(packet)?;
    let data = &packet[ofs..];
    if data.len() < 8 || data[6] & 0xC0 != 0x80 {
        return None;
    }
    let pts_flag = data[7] & 0x80 != 0;
    let dts_flag = data[7] & 0x40 != 0;
    // A DTS without a PTS is not a valid flag combination
    if !pts_flag && dts_flag {
        return None;
    }
    if !pts_flag {
        return Some((None, None));
    }
    let mut five = [0_u8; 5];
    if dts_flag {
        if data.len() < 19 {
            return None;
        }
        five.copy_from_slice(&data[9..14]);
        let pts = decode_pts_dts(&five, 3);
        five.copy_from_slice(&data[14..19]);
        let dts = decode_pts_dts(&five, 1);
        Some((Some(pts), Some(dts)))
    } else {
        if data.len() < 14 {
            return None;
        }
        five.copy_from_slice(&data[9..14]);
        Some((Some(decode_pts_dts(&five, 2)), None))
    }
}

/// Rewrites a solitary PTS inside a PES-start packet.
pub fn change_packet_pts(packet: &mut [u8; TS_PACKET_SIZE], pts: u64) {
    let ofs = match TsHeader::parse(packet) {
        Ok(hdr) => hdr.payload_offset as usize,
        Err(_) => return,
    };
    if ofs + 14 > TS_PACKET_SIZE {
        return;
    }
    let mut five = [0_u8; 5];
    encode_pts_dts(&mut five, 2, pts);
    packet[ofs + 9..ofs + 14].copy_from_slice(&five);
}

/// Rewrites the PTS and DTS inside a PES-start packet.
pub fn change_packet_pts_dts(packet: &mut [u8; TS_PACKET_SIZE], pts: u64, dts: u64) {
    let ofs = match TsHeader::parse(packet) {
        Ok(hdr) => hdr.payload_offset as usize,
        Err(_) => return,
    };
    if ofs + 19 > TS_PACKET_SIZE {
        return;
    }
    let mut five = [0_u8; 5];
    encode_pts_dts(&mut five, 3, pts);
    packet[ofs + 9..ofs + 14].copy_from_slice(&five);
    encode_pts_dts(&mut five, 1, dts);
    packet[ofs + 14..ofs + 19].copy_from_slice(&five);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for &pid in &[0_u16, 1, 0x100, 0x1000, 0x1FFE] {
            for continuity in 0..16_u8 {
                for &(adapt, payload) in &[(false, true), (true, true), (true, false)] {
                    let max_adapt = if payload { 182 } else { 183 };
                    for &adapt_len in &[0_u8, 1, 7, max_adapt] {
                        let mut hdr = TsHeader {
                            pusi: continuity % 2 == 0,
                            prio: pid % 3 == 0,
                            pid,
                            scramble: (continuity % 4),
                            adapt_field: adapt,
                            payload_field: payload,
                            continuity,
                            ..TsHeader::default()
                        };
                        if adapt {
                            hdr.adapt_len = adapt_len;
                            if adapt_len > 0 {
                                hdr.adapt_flags = 0x10;
                            }
                            hdr.payload_offset = 5 + adapt_len;
                        } else {
                            hdr.payload_offset = 4;
                        }
                        if payload {
                            hdr.payload_size =
                                (TS_PACKET_SIZE - hdr.payload_offset as usize) as u8;
                        }

                        let mut packet = [0_u8; TS_PACKET_SIZE];
                        hdr.generate(&mut packet);
                        assert_eq!(TsHeader::parse(&packet).unwrap(), hdr);
                    }
                }
            }
        }
    }

    #[test]
    fn bad_packets_rejected() {
        let mut packet = [0_u8; TS_PACKET_SIZE];
        // Bad sync byte
        assert!(TsHeader::parse(&packet).is_err());
        // Neither adaptation nor payload
        packet[0] = 0x47;
        packet[3] = 0x00;
        assert!(TsHeader::parse(&packet).is_err());
        // Adaptation length overflowing a payload-carrying packet
        packet[3] = 0x30;
        packet[4] = 183;
        assert!(TsHeader::parse(&packet).is_err());
    }

    #[test]
    fn pcr_round_trip() {
        let mut packet = [0_u8; TS_PACKET_SIZE];
        let hdr = TsHeader {
            pid: 0x100,
            adapt_field: true,
            payload_field: false,
            adapt_len: 183,
            adapt_flags: 0x10,
            payload_offset: 188,
            ..TsHeader::default()
        };
        hdr.generate(&mut packet);
        assert!(packet_has_pcr(&packet));

        for &base in &[0_u64, 1, 90_000, (1 << 33) - 1] {
            for &extension in &[0_u16, 1, 299] {
                let stamp = PcrTimestamp { base, extension };
                set_packet_pcr_parts(&mut packet, &stamp);
                let read = packet_pcr_parts(&packet).unwrap();
                assert_eq!(read, stamp);
                assert_eq!(read.pcr(), base * 300 + extension as u64);
            }
        }

        set_packet_pcr(&mut packet, 12345 * 300 + 123);
        assert_eq!(packet_pcr(&packet), Some(12345 * 300 + 123));
    }

    #[test]
    fn pts_dts_round_trip() {
        let mut buf = [0_u8; 5];
        let mut value = 0_u64;
        while value < (1 << 33) {
            for &guard in &[1_u8, 2, 3] {
                encode_pts_dts(&mut buf, guard, value);
                assert_eq!(buf[0] & 0x01, 1);
                assert_eq!(buf[2] & 0x01, 1);
                assert_eq!(buf[4] & 0x01, 1);
                assert_eq!(buf[0] >> 4, guard);
                assert_eq!(decode_pts_dts(&buf, guard), value);
            }
            value = value * 3 + 1;
        }
        encode_pts_dts(&mut buf, 2, (1 << 33) - 1);
        assert_eq!(decode_pts_dts(&buf, 2), (1 << 33) - 1);
    }

    #[test]
    fn scramble_bits() {
        let mut packet = [0_u8; TS_PACKET_SIZE];
        init_null_packet(&mut packet);
        assert!(!packet_is_scrambled(&packet));
        set_packet_scrambled(&mut packet, ScrambleControl::ScrambledOddKey);
        assert!(packet_is_scrambled(&packet));
        assert_eq!(
            packet_scramble_control(&packet),
            ScrambleControl::ScrambledOddKey
        );
        set_packet_scrambled(&mut packet, ScrambleControl::NotScrambled);
        assert!(!packet_is_scrambled(&packet));
    }
}
