//! PES reassembly: per-PID accumulation of packetized elementary stream
//! units, header decoding, and stream classification.
//!
//! Bounded units complete when the declared length is reached; video units
//! with `pes_packet_len == 0` are unbounded and complete only when the next
//! PUSI packet for the PID is observed, which [`PesDemux`] handles with a
//! current/next unit pair per PID.

use crate::desc::{
    descriptors, h222_stream_id_desc, is_stream_type_audio, is_stream_type_video, StreamType,
};
use crate::es::MpegAudioHeader;
use crate::packet::{decode_pts_dts, TsHeader};
use crate::tables::{Pat, Pmt};
use crate::{pts_format_args, TS_PACKET_SIZE};
use log::warn;
use modular_bitfield_msb::prelude::*;
use num_traits::FromPrimitive;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

const PES_DATA_SIZE_BUFFER: usize = 1024;
const PES_MAX_DATA_SIZE: usize = 1024 * 1024;

/// Program stream map stream id.
pub const STREAM_ID_PROGRAM_STREAM_MAP: u8 = 0xBC;
/// Private stream 1 stream id.
pub const STREAM_ID_PRIVATE_STREAM_1: u8 = 0xBD;
/// Padding stream stream id.
pub const STREAM_ID_PADDING_STREAM: u8 = 0xBE;
/// Private stream 2 stream id.
pub const STREAM_ID_PRIVATE_STREAM_2: u8 = 0xBF;
/// ECM stream id.
pub const STREAM_ID_ECM_STREAM: u8 = 0xF0;
/// EMM stream id.
pub const STREAM_ID_EMM_STREAM: u8 = 0xF1;
/// DSM-CC stream id.
pub const STREAM_ID_DSMCC_STREAM: u8 = 0xF2;
/// H.222 E stream id.
pub const STREAM_ID_H222_E_STREAM: u8 = 0xF8;
/// Program stream directory stream id.
pub const STREAM_ID_PROGRAM_STREAM_DIRECTORY: u8 = 0xFF;

/// True for audio stream ids (0xC0..=0xDF).
pub fn is_audio_stream_id(stream_id: u8) -> bool {
    (0xC0..=0xDF).contains(&stream_id)
}

/// True for video stream ids (0xE0..=0xEF).
pub fn is_video_stream_id(stream_id: u8) -> bool {
    (0xE0..=0xEF).contains(&stream_id)
}

/// True for stream ids this reassembler handles (H.222.0 Table 2-18 minus
/// maps, padding, ECM/EMM, DSM-CC, H.222 E and the stream directory).
pub fn is_pes_stream_supported(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        STREAM_ID_PROGRAM_STREAM_MAP
            | STREAM_ID_PADDING_STREAM
            | STREAM_ID_PRIVATE_STREAM_2
            | STREAM_ID_ECM_STREAM
            | STREAM_ID_EMM_STREAM
            | STREAM_ID_PROGRAM_STREAM_DIRECTORY
            | STREAM_ID_DSMCC_STREAM
            | STREAM_ID_H222_E_STREAM
    )
}

/// True for PMT stream types whose PIDs carry PES units.
pub fn is_pes_carrying_stream_type(stream_type: u8) -> bool {
    matches!(stream_type, 0x01..=0x04 | 0x06..=0x11 | 0x15 | 0x1B | 0x42)
}

/// Wire layout of the 6-byte PES start.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// Wire layout of the 3 optional header bytes that follow for supported
/// streams.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// Effective PES unit length: the declared 16-bit length when non-zero,
/// unbounded until the next PUSI otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesLength {
    /// No unit has started.
    Unset,
    /// Declared length was zero; the end is known only at the next PUSI.
    Unbounded,
    /// Effective length in bytes.
    Bounded(usize),
}

impl Default for PesLength {
    fn default() -> Self {
        PesLength::Unset
    }
}

/// Stream classification flags, from the stream id, PMT stream type and
/// descriptors, and the elementary stream itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StreamKind {
    pub is_audio: bool,
    pub is_audio_mpeg1: bool,
    pub is_audio_mpeg1l1: bool,
    pub is_audio_mpeg1l2: bool,
    pub is_audio_mpeg1l3: bool,
    pub is_audio_mpeg2: bool,
    pub is_audio_aac: bool,
    pub is_audio_ac3: bool,
    pub is_audio_dts: bool,
    pub is_video: bool,
    pub is_video_mpeg1: bool,
    pub is_video_mpeg2: bool,
    pub is_video_mpeg4: bool,
    pub is_video_h264: bool,
    pub is_video_avs: bool,
    pub is_teletext: bool,
    pub is_subtitle: bool,
}

/// One PES unit under (or after) reassembly.
#[derive(Debug, Default, Clone)]
pub struct Pes {
    /// TS header of the packet that started the unit.
    pub ts_header: TsHeader,
    /// Stream id; non-zero once the unit has started.
    pub stream_id: u8,
    /// Declared PES packet length (0 allowed for video).
    pub pes_packet_len: u16,
    real_pes_packet_len: PesLength,
    /// Stream classification.
    pub kind: StreamKind,

    /// First flag byte as found on the wire.
    pub flags_1: u8,
    /// PES scrambling control.
    pub scrambling: u8,
    /// PES priority.
    pub priority: bool,
    /// Data alignment indicator.
    pub data_alignment: bool,
    /// Copyright flag.
    pub copyright: bool,
    /// Original-or-copy flag.
    pub original_or_copy: bool,

    /// Second flag byte as found on the wire.
    pub flags_2: u8,
    /// PTS present.
    pub pts_flag: bool,
    /// DTS present.
    pub dts_flag: bool,
    /// ESCR present.
    pub escr_flag: bool,
    /// ES rate present.
    pub es_rate_flag: bool,
    /// Trick mode present.
    pub trick_mode_flag: bool,
    /// Additional copy info present.
    pub add_copy_info_flag: bool,
    /// Previous PES CRC present.
    pub pes_crc_flag: bool,
    /// Extension bitmap present.
    pub pes_extension_flag: bool,

    /// Length of the optional header area.
    pub pes_header_len: u8,
    /// Decoded presentation timestamp.
    pub pts: Option<u64>,
    /// Decoded decode timestamp.
    pub dts: Option<u64>,
    /// Decoded elementary stream clock reference (27MHz).
    pub escr: Option<u64>,

    /// Extension flag byte as found on the wire.
    pub flags_3: u8,
    /// PES private data present.
    pub pes_private_data_flag: bool,
    /// Pack header field present.
    pub pack_header_field_flag: bool,
    /// Program packet sequence counter present.
    pub program_packet_seq_counter_flag: bool,
    /// P-STD buffer info present.
    pub p_std_buffer_flag: bool,
    /// Second extension present.
    pub pes_extension2_flag: bool,
    /// The 16 private data bytes, kept opaque.
    pub pes_private_data: Option<[u8; 16]>,
    pack_header: Option<(usize, usize)>,
    pes_extension2: Option<(usize, usize)>,

    pes_data: Vec<u8>,
    pes_data_initialized: bool,
    es_data_offset: usize,
    /// Elementary stream byte count derived from the effective length.
    pub es_data_size: usize,
    initialized: bool,
    /// Decoded MPEG audio frame header, when the ES carries one.
    pub mpeg_audio_header: Option<MpegAudioHeader>,
}

impl Pes {
    /// Allocates an empty unit with the initial reassembly buffer.
    pub fn new() -> Pes {
        let mut pes = Pes::default();
        pes.pes_data.reserve_exact(PES_DATA_SIZE_BUFFER);
        pes
    }

    /// Resets all state; the reassembly buffer keeps its allocation.
    pub fn clear(&mut self) {
        let mut data = std::mem::take(&mut self.pes_data);
        data.clear();
        *self = Pes::default();
        self.pes_data = data;
    }

    /// True once the unit is fully assembled and its header parsed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The effective unit length.
    pub fn real_packet_len(&self) -> PesLength {
        self.real_pes_packet_len
    }

    /// The accumulated unit bytes.
    pub fn pes_data(&self) -> &[u8] {
        &self.pes_data
    }

    /// The elementary stream bytes past header and stuffing.
    pub fn es_data(&self) -> &[u8] {
        let end = (self.es_data_offset + self.es_data_size).min(self.pes_data.len());
        &self.pes_data[self.es_data_offset.min(end)..end]
    }

    /// Pack header bytes, when the extension carried one.
    pub fn pack_header(&self) -> Option<&[u8]> {
        self.pack_header
            .map(|(ofs, len)| &self.pes_data[ofs..ofs + len])
    }

    /// Extension-2 bytes, when present.
    pub fn pes_extension2(&self) -> Option<&[u8]> {
        self.pes_extension2
            .map(|(ofs, len)| &self.pes_data[ofs..ofs + len])
    }

    fn add_payload(&mut self, payload: &[u8]) {
        // Grow by doubling up to the hard cap
        let needed = self.pes_data.len() + payload.len();
        while self.pes_data.capacity() < needed && self.pes_data.capacity() < PES_MAX_DATA_SIZE {
            let cap = self.pes_data.capacity().max(PES_DATA_SIZE_BUFFER);
            self.pes_data.reserve_exact(cap);
        }
        self.pes_data.extend_from_slice(payload);
        if self.pes_packet_len != 0 && self.pes_data.len() >= self.pes_packet_len as usize {
            // Declared size reached, the unit can be parsed
            self.pes_data_initialized = true;
        }
    }

    /// Reports whether the unit assembling here finished before
    /// `next_packet`. For unbounded units a PUSI on `next_packet` marks the
    /// end, fixes the effective length, and parses the unit.
    pub fn is_finished(&mut self, next_packet: &[u8; TS_PACKET_SIZE]) -> bool {
        if self.pes_data_initialized {
            return true;
        }
        let pusi = next_packet[0] == 0x47 && next_packet[1] & 0x40 != 0;
        if pusi && self.real_pes_packet_len == PesLength::Unbounded {
            self.real_pes_packet_len = PesLength::Bounded(self.pes_data.len());
            self.pes_data_initialized = true;
            if !self.parse() {
                warn!("error parsing!");
                self.clear();
                return false;
            }
            return true;
        }
        false
    }

    /// Feeds one TS packet of this unit's PID. A PUSI packet restarts the
    /// unit; the PMT, when given, refines the stream classification.
    pub fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE], pmt: Option<&Pmt>) -> &mut Self {
        let hdr = match TsHeader::parse(packet) {
            Ok(hdr) => hdr,
            Err(_) => return self,
        };
        if !hdr.payload_field || hdr.payload_size == 0 {
            return self;
        }
        let payload = &packet[hdr.payload_offset as usize..];

        if hdr.pusi {
            // A new unit starts; drop anything mid-assembly
            if self.ts_header.pusi {
                self.clear();
            }
            if payload.len() >= 6 && payload[0] == 0x00 && payload[1] == 0x00 && payload[2] == 0x01
            {
                self.ts_header = hdr;
                let stream_id = payload[3];
                let pes_packet_len = ((payload[4] as u16) << 8) | payload[5] as u16;
                if pes_packet_len == 0 && self.real_pes_packet_len == PesLength::Unbounded {
                    warn!("!!! ERROR: New pes with pes_packet_len == 0, started before the old was finished");
                    self.clear();
                    return self;
                }
                self.real_pes_packet_len = if pes_packet_len > 0 {
                    PesLength::Bounded(pes_packet_len as usize)
                } else {
                    PesLength::Unbounded
                };
                self.stream_id = stream_id;
                self.pes_packet_len = pes_packet_len;
                self.fill_type(pmt, hdr.pid);
            } else {
                warn!(
                    "!!! PES_start_code_prefix not found. Expected 0x00 0x00 0x01 but got 0x{:02x} 0x{:02x} 0x{:02x}! PID {:03x}",
                    payload.first().copied().unwrap_or(0),
                    payload.get(1).copied().unwrap_or(0),
                    payload.get(2).copied().unwrap_or(0),
                    hdr.pid
                );
                self.clear();
                return self;
            }
        }

        if self.stream_id != 0 {
            self.add_payload(payload);
            if self.pes_data.len() > PES_MAX_DATA_SIZE {
                warn!(
                    "PES payload size {} exceeded pes_data_max_size: {} pid: {:03x}",
                    self.pes_data.len(),
                    PES_MAX_DATA_SIZE,
                    self.ts_header.pid
                );
                self.clear();
                return self;
            }
        }

        if self.pes_data_initialized && !self.initialized && !self.parse() {
            self.clear();
        }

        self
    }

    /// Overlays the stream-id classification with PMT stream type and
    /// descriptor knowledge for `pid`.
    pub fn fill_type(&mut self, pmt: Option<&Pmt>, pid: u16) {
        self.kind.is_audio = is_audio_stream_id(self.stream_id);
        self.kind.is_video = is_video_stream_id(self.stream_id);

        let pmt = match pmt {
            Some(pmt) if pmt.is_initialized() => pmt,
            _ => return,
        };
        let stream = match pmt.streams.iter().find(|stream| stream.pid == pid) {
            Some(stream) => stream,
            None => return,
        };

        let kind = &mut self.kind;
        kind.is_audio = kind.is_audio && is_stream_type_audio(stream.stream_type);
        kind.is_audio_mpeg1 =
            kind.is_audio && StreamType::from_u8(stream.stream_type) == Some(StreamType::Mpeg1Audio);
        kind.is_audio_mpeg2 =
            kind.is_audio && StreamType::from_u8(stream.stream_type) == Some(StreamType::Mpeg2Audio);
        // AC-3 needs descriptor confirmation; the stream type is not enough
        kind.is_audio_aac =
            kind.is_audio && StreamType::from_u8(stream.stream_type) == Some(StreamType::AdtsAudio);

        kind.is_video = kind.is_video && is_stream_type_video(stream.stream_type);
        kind.is_video_mpeg1 =
            kind.is_video && StreamType::from_u8(stream.stream_type) == Some(StreamType::Mpeg1Video);
        kind.is_video_mpeg2 =
            kind.is_video && StreamType::from_u8(stream.stream_type) == Some(StreamType::Mpeg2Video);
        kind.is_video_mpeg4 = kind.is_video
            && StreamType::from_u8(stream.stream_type) == Some(StreamType::Mpeg4Part2Video);
        kind.is_video_h264 =
            kind.is_video && StreamType::from_u8(stream.stream_type) == Some(StreamType::AvcVideo);
        kind.is_video_avs =
            kind.is_video && StreamType::from_u8(stream.stream_type) == Some(StreamType::AvsVideo);

        for (tag, data) in descriptors(&stream.es_info) {
            match tag {
                0x03 => {
                    // Audio stream descriptor
                    if !data.is_empty() {
                        let id = data[0] & 0x40 != 0;
                        let layer = (data[0] & 0x30) >> 4;
                        if id {
                            kind.is_audio = true;
                            kind.is_audio_mpeg1l1 = layer == 3;
                            kind.is_audio_mpeg1l2 = layer == 2;
                            kind.is_audio_mpeg1l3 = layer == 1;
                        }
                    }
                }
                0x05 => {
                    // Registration descriptor, see smpte-ra.org/mpegreg
                    if data.len() == 4 {
                        let ident = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                        if ident == 0x41432D33 {
                            // "AC-3"
                            kind.is_audio = true;
                            kind.is_audio_ac3 = true;
                        }
                        if ident == 0x44545331 || ident == 0x44545332 || ident == 0x44545333 {
                            // "DTS1".."DTS3"
                            kind.is_audio = true;
                            kind.is_audio_dts = true;
                        }
                    }
                }
                0x6A => {
                    kind.is_audio = true;
                    kind.is_audio_ac3 = true;
                }
                0x7B => {
                    kind.is_audio = true;
                    kind.is_audio_dts = true;
                }
                0x56 => kind.is_teletext = true,
                0x59 => kind.is_subtitle = true,
                _ => {}
            }
        }
    }

    /// Decodes the PES header of the assembled unit. Returns false (and the
    /// caller clears the unit) on any structural violation.
    pub fn parse(&mut self) -> bool {
        if !self.pes_data_initialized {
            warn!("!!! pes_data_initialized not true");
            return false;
        }
        let real_len = match self.real_pes_packet_len {
            PesLength::Bounded(len) => len,
            _ => {
                warn!("!!! unbounded PES parsed before its end was seen");
                return false;
            }
        };
        let data = &self.pes_data;
        if data.len() < 9 {
            warn!("!!! PES data_size < 6");
            return false;
        }

        let head = PesHeader::from_bytes([data[0], data[1], data[2], data[3], data[4], data[5]]);
        if head.start_code() != 0x000001 {
            warn!(
                "!!! PES_start_code_prefix error! Expected 0x00 0x00 0x01 but got 0x{:02x} 0x{:02x} 0x{:02x}! PID {:03x}",
                data[0], data[1], data[2], self.ts_header.pid
            );
            return false;
        }

        self.stream_id = head.stream_id();
        self.pes_packet_len = head.packet_length();

        if !is_pes_stream_supported(self.stream_id) {
            warn!(
                "!!! Unsupported stream, ignore! (0x{:02x}) PID {:03x}",
                self.stream_id, self.ts_header.pid
            );
            return false;
        }

        let optional = PesOptionalHeader::from_bytes([data[6], data[7], data[8]]);
        if optional.marker_bits() != 0b10 {
            warn!(
                "!!! No 10 bits at PES start, expected 0x80 got 0x{:02x}! PID {:03x}",
                data[6] & 0xC0,
                self.ts_header.pid
            );
            return false;
        }
        self.flags_1 = data[6];
        self.scrambling = optional.scrambling_control();
        self.priority = optional.priority();
        self.data_alignment = optional.data_alignment_indicator();
        self.copyright = optional.copyright();
        self.original_or_copy = optional.original();

        self.flags_2 = data[7];
        self.pts_flag = optional.has_pts();
        self.dts_flag = optional.has_dts();
        self.escr_flag = optional.escr();
        self.es_rate_flag = optional.es_rate();
        self.trick_mode_flag = optional.dsm_trick_mode();
        self.add_copy_info_flag = optional.has_additional_copy_info();
        self.pes_crc_flag = optional.has_crc();
        self.pes_extension_flag = optional.has_extension();

        self.pes_header_len = optional.additional_header_length();
        let mut dpos = 9_usize;

        let pid = self.ts_header.pid;
        let data_len = data.len();
        let need = move |dpos: usize, bytes: usize| {
            if dpos + bytes > data_len {
                warn!("!!! PES optional fields overrun the unit! PID {:03x}", pid);
                false
            } else {
                true
            }
        };

        // A DTS without a PTS is not a valid flag combination
        if !self.pts_flag && self.dts_flag {
            return false;
        }

        if self.pts_flag && !self.dts_flag {
            if !need(dpos, 5) {
                return false;
            }
            let mut five = [0_u8; 5];
            five.copy_from_slice(&data[dpos..dpos + 5]);
            self.pts = Some(decode_pts_dts(&five, 2));
            dpos += 5;
        }

        if self.pts_flag && self.dts_flag {
            if !need(dpos, 10) {
                return false;
            }
            let mut five = [0_u8; 5];
            five.copy_from_slice(&data[dpos..dpos + 5]);
            self.pts = Some(decode_pts_dts(&five, 3));
            dpos += 5;
            five.copy_from_slice(&data[dpos..dpos + 5]);
            self.dts = Some(decode_pts_dts(&five, 1));
            dpos += 5;
        }

        if self.escr_flag {
            if !need(dpos, 6) {
                return false;
            }
            let escr_base = ((data[dpos + 4] as u64) >> 3)
                | ((data[dpos + 3] as u64) << 5)
                | ((data[dpos + 2] as u64) << 13)
                | ((data[dpos + 1] as u64) << 20)
                | (((data[dpos] as u64) & 0x03) << 28)
                | (((data[dpos] as u64) & 0x38) << 27);
            let escr_extn =
                ((data[dpos + 5] as u32) >> 1) | ((data[dpos + 4] as u32 & 0x01) << 7);
            self.escr = Some(escr_base * 300 + escr_extn as u64);
            dpos += 6;
        }

        if self.es_rate_flag {
            // Not decoded
            if !need(dpos, 3) {
                return false;
            }
            dpos += 3;
        }

        if self.trick_mode_flag {
            // Not decoded
            if !need(dpos, 1) {
                return false;
            }
            dpos += 1;
        }

        if self.add_copy_info_flag {
            // Not decoded
            if !need(dpos, 1) {
                return false;
            }
            dpos += 1;
        }

        if self.pes_crc_flag {
            // Not decoded
            if !need(dpos, 2) {
                return false;
            }
            dpos += 2;
        }

        if self.pes_extension_flag {
            if !need(dpos, 1) {
                return false;
            }
            self.flags_3 = data[dpos];
            self.pes_private_data_flag = data[dpos] & 0x80 != 0;
            self.pack_header_field_flag = data[dpos] & 0x40 != 0;
            self.program_packet_seq_counter_flag = data[dpos] & 0x20 != 0;
            self.p_std_buffer_flag = data[dpos] & 0x10 != 0;
            self.pes_extension2_flag = data[dpos] & 0x01 != 0;
            dpos += 1;

            if self.pes_private_data_flag {
                if !need(dpos, 16) {
                    return false;
                }
                // The 16 bytes are application-defined, kept opaque
                let mut private = [0_u8; 16];
                private.copy_from_slice(&data[dpos..dpos + 16]);
                self.pes_private_data = Some(private);
                dpos += 16;
            }

            if self.pack_header_field_flag {
                if !need(dpos, 1) {
                    return false;
                }
                let pack_len = data[dpos] as usize;
                if !need(dpos + 1, pack_len) {
                    return false;
                }
                self.pack_header = Some((dpos + 1, pack_len));
                dpos += 1 + pack_len;
            }

            if self.program_packet_seq_counter_flag {
                // Not decoded
                if !need(dpos, 2) {
                    return false;
                }
                dpos += 2;
            }

            if self.p_std_buffer_flag {
                if !need(dpos, 2) {
                    return false;
                }
                // First two bits must be 01
                if data[dpos] & 0xC0 != 0x40 {
                    return false;
                }
                dpos += 2;
            }

            if self.pes_extension2_flag {
                if !need(dpos, 1) {
                    return false;
                }
                let ext_len = (data[dpos] & 0x7F) as usize;
                if !need(dpos + 1, ext_len) {
                    return false;
                }
                self.pes_extension2 = Some((dpos + 1, ext_len));
                dpos += 1 + ext_len;
            }
        }

        // Skip stuffing bytes (8 is the minimum PES header length)
        let mut maxstuffing = 32;
        while maxstuffing > 0
            && dpos >= 8
            && dpos - 8 <= self.pes_header_len as usize
            && dpos < data.len()
            && data[dpos] == 0xFF
        {
            dpos += 1;
            maxstuffing -= 1;
        }

        self.es_data_offset = dpos;
        self.es_data_size = real_len.saturating_sub(dpos);
        self.initialized = true;

        if self.data_alignment {
            self.parse_es();
        }

        true
    }

    pub(crate) fn parse_es(&mut self) {
        if self.es_data().is_empty() {
            return;
        }

        // MPEG audio frame header right at the access-point boundary
        if (self.kind.is_audio_mpeg1 || self.kind.is_audio_mpeg2) && self.es_data().len() > 4 {
            if let Some(header) = MpegAudioHeader::parse(self.es_data()) {
                if header.id {
                    match header.layer {
                        3 => self.kind.is_audio_mpeg1l1 = true,
                        2 => self.kind.is_audio_mpeg1l2 = true,
                        1 => self.kind.is_audio_mpeg1l3 = true,
                        _ => {}
                    }
                }
                self.mpeg_audio_header = Some(header);
            }
        }

        // Distinguish AC-3 from DTS by the elementary stream sync pattern
        if self.kind.is_audio_ac3 {
            let es = self.es_data();
            let is_ac3_sync = es.len() >= 2 && es[0] == 0x0B && es[1] == 0x77;
            let is_dts_sync =
                es.len() >= 4 && es[0] == 0x7F && es[1] == 0xFE && es[2] == 0x80 && es[3] == 0x01;
            if is_ac3_sync {
                self.kind.is_audio = true;
                self.kind.is_audio_ac3 = true;
                self.kind.is_audio_dts = false;
            }
            if is_dts_sync {
                self.kind.is_audio = true;
                self.kind.is_audio_ac3 = false;
                self.kind.is_audio_dts = true;
            }
        }
    }

    /// Logs a trace of the assembled unit.
    pub fn dump(&self) {
        if !self.initialized {
            return;
        }
        log::info!("PES packet");
        self.ts_header.dump();
        let kind = &self.kind;
        log::info!(
            "  * Content    : {}{}{}{}{}{}{}{}{}{}{}{}{}{}{}{}{}",
            if kind.is_audio { "Audio " } else { "" },
            if kind.is_audio_mpeg1 { "MP1 " } else { "" },
            if kind.is_audio_mpeg1l1 { "Layer1 " } else { "" },
            if kind.is_audio_mpeg1l2 { "Layer2 " } else { "" },
            if kind.is_audio_mpeg1l3 { "Layer3 " } else { "" },
            if kind.is_audio_mpeg2 { "MP2 " } else { "" },
            if kind.is_audio_aac { "AAC " } else { "" },
            if kind.is_audio_ac3 { "AC3 " } else { "" },
            if kind.is_audio_dts { "DTS " } else { "" },
            if kind.is_video { "Video " } else { "" },
            if kind.is_video_mpeg1 { "MPEG1 " } else { "" },
            if kind.is_video_mpeg2 { "MPEG2 " } else { "" },
            if kind.is_video_mpeg4 { "MPEG4p2 " } else { "" },
            if kind.is_video_h264 { "H.264 " } else { "" },
            if kind.is_video_avs { "AVS " } else { "" },
            if kind.is_teletext { "Teletext " } else { "" },
            if kind.is_subtitle { "Subtitles " } else { "" }
        );
        log::info!(
            "  * Stream_id  : 0x{:02x} ({}) {}",
            self.stream_id,
            self.stream_id,
            h222_stream_id_desc(self.stream_id)
        );
        log::info!(
            "  * Packet len : 0x{:04x} ({}) real_len: {:?}",
            self.pes_packet_len,
            self.pes_packet_len,
            self.real_pes_packet_len
        );
        log::info!("  * Header len : {}", self.pes_header_len);
        log::info!(
            "  * Flags 1    : 0x{:02x} | scrambling={} priority={} data_align={} copyright={} org_or_copy={}",
            self.flags_1,
            self.scrambling,
            self.priority as u8,
            self.data_alignment as u8,
            self.copyright as u8,
            self.original_or_copy as u8
        );
        log::info!(
            "  * Flags 2    : 0x{:02x} | {}{}{}{}{}{}{}{}",
            self.flags_2,
            if self.pts_flag { "PTS " } else { "" },
            if self.dts_flag { "DTS " } else { "" },
            if self.escr_flag { "ESCR " } else { "" },
            if self.es_rate_flag { "ES_rate " } else { "" },
            if self.trick_mode_flag { "Trick_mode " } else { "" },
            if self.add_copy_info_flag { "Add_copy " } else { "" },
            if self.pes_crc_flag { "PES_CRC " } else { "" },
            if self.pes_extension_flag { "PES_Ext " } else { "" }
        );
        if let Some(pts) = self.pts {
            log::info!("  * PTS        : {} ({})", pts, pts_format_args!(pts));
        }
        if let Some(dts) = self.dts {
            log::info!("  * DTS        : {} ({})", dts, pts_format_args!(dts));
        }
        if let Some(escr) = self.escr {
            log::info!("  * ESCR       : {}", escr);
        }
        if self.pes_extension_flag {
            log::info!(
                "  * Ext flags  : 0x{:02x} | {}{}{}{}{}",
                self.flags_3,
                if self.pes_private_data_flag { "Private_data_flag " } else { "" },
                if self.pack_header_field_flag { "Pack_header_flag " } else { "" },
                if self.program_packet_seq_counter_flag { "Prg_pack_seq_flag " } else { "" },
                if self.p_std_buffer_flag { "P-STD_buf_flag " } else { "" },
                if self.pes_extension2_flag { "Ext2_flag " } else { "" }
            );
        }
        if let Some(private) = &self.pes_private_data {
            log::info!("  * PES priv_data : {}", crate::hex_dump(private, 0));
        }
        log::info!(
            "  - Private    : pes_data_pos:{} es_data_size:{}",
            self.pes_data.len(),
            self.es_data_size
        );
        log::info!(
            "  - ES dump    : {}...",
            crate::hex_dump(&self.es_data()[..self.es_data().len().min(32)], 0)
        );
        if let Some(header) = &self.mpeg_audio_header {
            header.dump();
        }
    }
}

/// One per-PID reassembly slot: the current unit plus the unit that the
/// PUSI ending an unbounded stream started.
#[derive(Default)]
pub struct PesEntry {
    /// Unit under assembly, or the finished unit until the next packet of
    /// this PID arrives.
    pub pes: Pes,
    pes_next: Option<Pes>,
}

/// Per-PID PES reassembler over the streams a PMT describes.
#[derive(Default)]
pub struct PesDemux {
    entries: HashMap<u16, PesEntry>,
}

impl PesDemux {
    /// Allocates an empty demultiplexer.
    pub fn new() -> PesDemux {
        PesDemux::default()
    }

    /// The reassembly slot for a PID, if one was created.
    pub fn entry(&self, pid: u16) -> Option<&PesEntry> {
        self.entries.get(&pid)
    }

    /// Routes one TS packet. PSI PIDs (per the PAT) are skipped, unknown
    /// PIDs are admitted only when the PMT lists a PES-carrying stream type
    /// for them. Returns the PID's slot; its `pes` is the finished unit
    /// exactly when `pes.is_initialized()`.
    pub fn push_packet(
        &mut self,
        packet: &[u8; TS_PACKET_SIZE],
        pat: &Pat,
        pmt: &Pmt,
    ) -> Option<&PesEntry> {
        let hdr = TsHeader::parse(packet).ok()?;
        let pid = hdr.pid;
        if pat.is_psi_pid(pid) {
            return None;
        }

        let entry = match self.entries.entry(pid) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let carries = pmt
                    .streams
                    .iter()
                    .any(|stream| stream.pid == pid && is_pes_carrying_stream_type(stream.stream_type));
                if !carries {
                    return None;
                }
                vacant.insert(PesEntry::default())
            }
        };

        // The previous packet finished a unit; rotate it out now
        if let Some(next) = entry.pes_next.take() {
            entry.pes = next;
        }

        // Unbounded units end exactly when the next PUSI shows up; the
        // finished unit stays readable while the successor assembles aside
        if entry.pes.is_finished(packet) {
            let mut next = Pes::new();
            next.push_packet(packet, Some(pmt));
            entry.pes_next = Some(next);
        } else {
            entry.pes.push_packet(packet, Some(pmt));
        }

        self.entries.get(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::pmt::tests::build_pmt_packet;
    use crate::packet::encode_pts_dts;

    /// Builds a TS packet with exactly `chunk` as payload, using an
    /// adaptation field to absorb the slack.
    fn ts_packet(pid: u16, pusi: bool, continuity: u8, chunk: &[u8]) -> [u8; TS_PACKET_SIZE] {
        assert!(chunk.len() <= 184 && !chunk.is_empty());
        let mut hdr = TsHeader {
            pusi,
            pid,
            payload_field: true,
            continuity,
            ..TsHeader::default()
        };
        if chunk.len() == 184 {
            hdr.payload_offset = 4;
        } else {
            hdr.adapt_field = true;
            hdr.adapt_len = (183 - chunk.len()) as u8;
            hdr.payload_offset = 5 + hdr.adapt_len;
        }
        let mut packet = [0_u8; TS_PACKET_SIZE];
        hdr.generate(&mut packet);
        packet[hdr.payload_offset as usize..].copy_from_slice(chunk);
        packet
    }

    /// A bounded PES unit: start prefix, declared length, flag bytes, no
    /// optional fields, then the elementary payload.
    fn bounded_pes(stream_id: u8, es: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, stream_id];
        let declared = (3 + es.len()) as u16;
        pes.extend_from_slice(&declared.to_be_bytes());
        pes.extend_from_slice(&[0x80, 0x00, 0x00]);
        pes.extend_from_slice(es);
        pes
    }

    #[test]
    fn bounded_pes_reassembles_identically_for_any_split() {
        let es: Vec<u8> = (0..359).map(|i| (i % 251) as u8).collect();
        let pes = bounded_pes(0xC0, &es);
        assert_eq!(pes.len(), 368);

        let splits: [&[usize]; 3] = [&[184, 184], &[92, 92, 184], &[100, 84, 100, 84]];
        let mut outputs = Vec::new();
        for split in &splits {
            let mut unit = Pes::new();
            let mut offset = 0;
            for (i, &len) in split.iter().enumerate() {
                let packet = ts_packet(0x200, i == 0, i as u8, &pes[offset..offset + len]);
                unit.push_packet(&packet, None);
                offset += len;
            }
            assert_eq!(offset, pes.len());
            assert!(unit.is_initialized(), "split {:?}", split);
            assert_eq!(unit.stream_id, 0xC0);
            assert_eq!(unit.pes_packet_len as usize, pes.len() - 6);
            assert!(unit.kind.is_audio);
            outputs.push(unit.es_data().to_vec());
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
        // The elementary payload starts right after the 9 header bytes
        assert_eq!(&outputs[0][..], &pes[9..9 + outputs[0].len()]);
    }

    #[test]
    fn unbounded_video_pes_with_pts_dts() {
        // PES with stream_id 0xE0, unbounded length, PTS+DTS
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00];
        pes.extend_from_slice(&[0x80, 0xC0, 0x0A]);
        let mut stamp = [0_u8; 5];
        encode_pts_dts(&mut stamp, 3, 0x1_FFFF_FFFF);
        pes.extend_from_slice(&stamp);
        encode_pts_dts(&mut stamp, 1, 0x0000_0001);
        pes.extend_from_slice(&stamp);
        let es_start = pes.len();
        while pes.len() < 3 * 184 {
            pes.push((pes.len() % 247) as u8);
        }

        let mut unit = Pes::new();
        for i in 0..3 {
            let packet = ts_packet(0x300, i == 0, i as u8, &pes[i * 184..(i + 1) * 184]);
            unit.push_packet(&packet, None);
        }
        assert!(!unit.is_initialized());

        // The next PUSI packet releases the unit
        let next_unit = bounded_pes(0xE0, &[0; 32]);
        let next_packet = ts_packet(0x300, true, 3, &next_unit);
        assert!(unit.is_finished(&next_packet));
        assert!(unit.is_initialized());

        assert_eq!(unit.pts, Some((1 << 33) - 1));
        assert_eq!(unit.dts, Some(1));
        assert!(unit.kind.is_video);
        assert_eq!(unit.real_packet_len(), PesLength::Bounded(3 * 184));
        assert_eq!(unit.es_data(), &pes[es_start..]);
    }

    #[test]
    fn missing_start_prefix_clears_unit() {
        let mut unit = Pes::new();
        let garbage = [0xAA_u8; 184];
        let packet = ts_packet(0x300, true, 0, &garbage);
        unit.push_packet(&packet, None);
        assert!(!unit.is_initialized());
        assert_eq!(unit.stream_id, 0);
        assert!(unit.pes_data().is_empty());
    }

    #[test]
    fn pmt_classification_overlays_stream_id() {
        let ac3_desc = [0x6A, 0x00];
        let pmt_packet = build_pmt_packet(
            0x100,
            0x0201,
            &[],
            &[(0x1B, 0x0201, &[]), (0x06, 0x0202, &ac3_desc)],
        );
        let mut pmt = Pmt::new();
        pmt.push_packet(&pmt_packet);
        assert!(pmt.is_initialized());

        let mut video = Pes::new();
        video.stream_id = 0xE0;
        video.fill_type(Some(&pmt), 0x0201);
        assert!(video.kind.is_video);
        assert!(video.kind.is_video_h264);
        assert!(!video.kind.is_audio);

        let mut private = Pes::new();
        private.stream_id = 0xBD;
        private.fill_type(Some(&pmt), 0x0202);
        assert!(private.kind.is_audio);
        assert!(private.kind.is_audio_ac3);
    }

    #[test]
    fn demux_routes_by_pmt_and_skips_psi() {
        let pmt_packet = build_pmt_packet(0x100, 0x0201, &[], &[(0x03, 0x0202, &[])]);
        let mut pmt = Pmt::new();
        pmt.push_packet(&pmt_packet);
        let mut pat = Pat::init(1);
        pat.add_program(1, 0x100);

        let es: Vec<u8> = (0..178).map(|i| i as u8).collect();
        let pes = bounded_pes(0xC0, &es);
        assert_eq!(pes.len(), 187);

        let mut demux = PesDemux::new();
        // Unknown PID: not in the PMT
        let stray = ts_packet(0x400, true, 0, &pes[..184]);
        assert!(demux.push_packet(&stray, &pat, &pmt).is_none());
        // PSI PID: skipped outright
        let psi = ts_packet(0x0011, true, 0, &pes[..184]);
        assert!(demux.push_packet(&psi, &pat, &pmt).is_none());

        let first = ts_packet(0x0202, true, 0, &pes[..184]);
        demux.push_packet(&first, &pat, &pmt);
        let second = ts_packet(0x0202, false, 1, &pes[184..]);
        let entry = demux.push_packet(&second, &pat, &pmt).unwrap();
        assert!(entry.pes.is_initialized());
        assert!(entry.pes.kind.is_audio);
        assert!(entry.pes.kind.is_audio_mpeg1);
    }

    #[test]
    fn demux_releases_unbounded_unit_on_next_pusi() {
        let pmt_packet = build_pmt_packet(0x100, 0x0201, &[], &[(0x1B, 0x0201, &[])]);
        let mut pmt = Pmt::new();
        pmt.push_packet(&pmt_packet);
        let mut pat = Pat::init(1);
        pat.add_program(1, 0x100);

        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        while pes.len() < 2 * 184 {
            pes.push(0x42);
        }

        let mut demux = PesDemux::new();
        for i in 0..2 {
            demux.push_packet(
                &ts_packet(0x0201, i == 0, i as u8, &pes[i * 184..(i + 1) * 184]),
                &pat,
                &pmt,
            );
        }
        // Still unbounded: nothing finished yet
        assert!(!demux.entry(0x0201).unwrap().pes.is_initialized());

        let successor = bounded_pes(0xE0, &[1, 2, 3]);
        let entry = demux
            .push_packet(&ts_packet(0x0201, true, 2, &successor), &pat, &pmt)
            .unwrap();
        assert!(entry.pes.is_initialized());
        assert_eq!(entry.pes.real_packet_len(), PesLength::Bounded(2 * 184));
    }
}
