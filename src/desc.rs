//! MPEG/DVB descriptor walking, pretty-printing, CA descriptor lookups and
//! H.222.0 stream classification.

use crate::hex_dump;
use crate::time::decode_mjd_datetime;
use log::{info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use smallvec::SmallVec;

/// One decoded tag-length-value descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Descriptor tag.
    pub tag: u8,
    /// Descriptor payload.
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    /// Parses every well-formed descriptor in `blob`; a truncated trailing
    /// entry is dropped (and logged by the walker).
    pub fn parse_all(blob: &[u8]) -> Vec<Descriptor> {
        descriptors(blob)
            .map(|(tag, data)| {
                let mut payload = SmallVec::new();
                payload.extend_from_slice(data);
                Descriptor { tag, data: payload }
            })
            .collect()
    }
}

/// Bounds-checked iterator over a tag-length-value descriptor blob.
///
/// A descriptor whose declared length exceeds the remaining bytes ends the
/// walk; everything before it is still yielded.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let tag = self.data[0];
        let length = self.data[1] as usize;
        let rest = &self.data[2..];
        if length > rest.len() {
            warn!(
                "!!! Descriptor 0x{:02x} says length {}, but only {} bytes left",
                tag,
                length,
                rest.len()
            );
            self.data = &[];
            return None;
        }
        let (payload, tail) = rest.split_at(length);
        self.data = tail;
        Some((tag, payload))
    }
}

/// Walks the descriptors of `blob`.
pub fn descriptors(blob: &[u8]) -> DescriptorIter {
    DescriptorIter { data: blob }
}

/// Conditional access systems recognized by the CA descriptor lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaSystem {
    /// 0x0100 - 0x01FF Canal Plus (SECA/Mediaguard)
    Seca,
    /// 0x0500 - 0x05FF France Telecom
    Viaccess,
    /// 0x0600 - 0x06FF Irdeto
    Irdeto,
    /// 0x0900 - 0x09FF News Datacom (NDS/Videoguard)
    Videoguard,
    /// 0x0B00 - 0x0BFF Norwegian Telekom
    Conax,
    /// 0x0D00 - 0x0DFF CryptoWorks
    Cryptoworks,
    /// 0x1800 - 0x18FF Kudelski SA (Nagravision)
    Nagra,
    /// 0x4AE0 - 0x4AE1 OOO Cifra (DRE-Crypt)
    DreCrypt,
    /// 0x5581 & 0x4AEE Bulcrypt
    Bulcrypt,
    /// 0x5501 & 0x5504 & 0x5511 Griffin (not in dvbservices.com registration)
    Griffin,
    /// 0x4ABF DGCrypt (Beijing Compunicate Technology Inc.)
    DgCrypt,
    /// Everything else.
    Unknown,
}

impl CaSystem {
    /// Human readable system name.
    pub fn name(self) -> &'static str {
        match self {
            CaSystem::Seca => "SECA",
            CaSystem::Viaccess => "VIACCESS",
            CaSystem::Irdeto => "IRDETO",
            CaSystem::Videoguard => "VIDEOGUARD",
            CaSystem::Conax => "CONAX",
            CaSystem::Cryptoworks => "CRYPTOWORKS",
            CaSystem::Nagra => "NAGRA",
            CaSystem::DreCrypt => "DRE-CRYPT",
            CaSystem::Bulcrypt => "BULCRYPT",
            CaSystem::Griffin => "GRIFFIN",
            CaSystem::DgCrypt => "DGCRYPT",
            CaSystem::Unknown => "UNKNOWN",
        }
    }
}

/// Classifies a CA system id.
pub fn ca_system(ca_id: u16) -> CaSystem {
    match ca_id {
        0x0100..=0x01FF => CaSystem::Seca,
        0x0500..=0x05FF => CaSystem::Viaccess,
        0x0600..=0x06FF => CaSystem::Irdeto,
        0x0900..=0x09FF => CaSystem::Videoguard,
        0x0B00..=0x0BFF => CaSystem::Conax,
        0x0D00..=0x0DFF => CaSystem::Cryptoworks,
        0x1800..=0x18FF => CaSystem::Nagra,
        0x4ABF => CaSystem::DgCrypt,
        0x4AE0 | 0x4AE1 => CaSystem::DreCrypt,
        0x5581 | 0x4AEE => CaSystem::Bulcrypt,
        0x5501 | 0x5504 | 0x5506 | 0x5508 | 0x5509 | 0x550E | 0x5511 => CaSystem::Griffin,
        _ => CaSystem::Unknown,
    }
}

/// Scans a descriptor blob for the first CA descriptor (tag 9, length >= 4)
/// whose (CA id, CA PID) pair satisfies `matches`.
pub(crate) fn find_ca_descriptor<F>(blob: &[u8], matches: F) -> Option<(u16, u16)>
where
    F: Fn(u16, u16) -> bool,
{
    for (tag, data) in descriptors(blob) {
        if tag == 9 && data.len() >= 4 {
            let ca_id = ((data[0] as u16) << 8) | data[1] as u16;
            let ca_pid = (((data[2] & 0x1F) as u16) << 8) | data[3] as u16;
            if matches(ca_id, ca_pid) {
                return Some((ca_id, ca_pid));
            }
        }
    }
    None
}

fn dvb_print_string(pad: &str, prefix: &str, input: &[u8]) {
    if input.is_empty() {
        info!("{}  {} \"\" (size: 0)", pad, prefix);
        return;
    }
    if input[0] < 32 {
        info!(
            "{}  {} \"{}\" (charset: 0x{:02x} size: {})",
            pad,
            prefix,
            String::from_utf8_lossy(&input[1..]),
            input[0],
            input.len() - 1
        );
    } else {
        info!(
            "{}  {} \"{}\" (size: {})",
            pad,
            prefix,
            String::from_utf8_lossy(input),
            input.len()
        );
    }
}

/// Pretty-prints a descriptor blob through the logging sink, one block per
/// descriptor. Unknown tags are hex-dumped; a truncated entry stops the
/// walk without reading past the buffer.
pub fn dump_descriptors(blob: &[u8]) {
    let pad = "        * ";
    for (tag, data) in descriptors(blob) {
        let this_length = data.len();
        match tag {
            0x02 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Video stream descriptor: {}",
                    pad,
                    tag,
                    tag,
                    this_length,
                    hex_dump(data, 0)
                );
                if !data.is_empty() {
                    let frame_rate_code = (data[0] & 0x78) >> 3;
                    info!(
                        "{}  - multiple_frame_rate_flag     : {}",
                        pad,
                        (data[0] >> 7) & 1
                    );
                    info!(
                        "{}  - frame_rate_code              : {} ({})",
                        pad,
                        frame_rate_code,
                        match frame_rate_code {
                            0 => "forbidden",
                            1 => "23.976",
                            2 => "24.00",
                            3 => "25.00",
                            4 => "29.97",
                            5 => "30.00",
                            6 => "50.00",
                            7 => "59.94",
                            8 => "60.00",
                            _ => "reserved",
                        }
                    );
                    info!("{}  - mpeg1_only_flag              : {}", pad, (data[0] >> 2) & 1);
                    info!("{}  - constraint_parameter_flag    : {}", pad, (data[0] >> 1) & 1);
                    info!("{}  - still_picture_flag           : {}", pad, data[0] & 1);
                }
            }
            0x03 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Audio stream descriptor: {}",
                    pad,
                    tag,
                    tag,
                    this_length,
                    hex_dump(data, 0)
                );
                if !data.is_empty() {
                    let layer = (data[0] & 0x30) >> 4;
                    info!("{}  - free_format_flag : {}", pad, (data[0] >> 7) & 1);
                    info!(
                        "{}  - ID               : {} ({})",
                        pad,
                        (data[0] >> 6) & 1,
                        if data[0] & 0x40 != 0 { "MPEG Audio" } else { "Other" }
                    );
                    info!(
                        "{}  - layer            : {} ({})",
                        pad,
                        layer,
                        match layer {
                            1 => "Layer III",
                            2 => "Layer II",
                            3 => "Layer I",
                            _ => "reserved",
                        }
                    );
                    info!("{}  - vbr_audio_flag   : {}", pad, (data[0] >> 3) & 1);
                }
            }
            0x05 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Registration descriptor",
                    pad, tag, tag, this_length
                );
                if data.len() >= 4 {
                    let ident = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    info!(
                        "{}  Registration ident: 0x{:08x} ({}{}{}{})",
                        pad,
                        ident,
                        data[0] as char,
                        data[1] as char,
                        data[2] as char,
                        data[3] as char
                    );
                    dvb_print_string(pad, "Registration data :", &data[4..]);
                }
            }
            0x06 => {
                let alignment = data.first().copied().unwrap_or(0);
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Data stream alignment descriptor: Alignment type: 0x{:02x} ({})",
                    pad,
                    tag,
                    tag,
                    this_length,
                    alignment,
                    match alignment {
                        0x01 => "Slice, or video access unit",
                        0x02 => "Video access unit",
                        0x03 => "GOP, or SEQ",
                        0x04 => "SEQ",
                        _ => "Reserved",
                    }
                );
            }
            0x09 => {
                if data.len() >= 4 {
                    let ca_id = ((data[0] as u16) << 8) | data[1] as u16;
                    let ca_pid = (((data[2] & 0x1F) as u16) << 8) | data[3] as u16;
                    info!(
                        "{}Tag 0x{:02x} ({:02}), sz: {}, CA descriptor: CAID 0x{:04x} ({:02}) | CA PID 0x{:04x} ({}) | {}",
                        pad,
                        tag,
                        tag,
                        this_length,
                        ca_id,
                        ca_id,
                        ca_pid,
                        ca_pid,
                        ca_system(ca_id).name()
                    );
                }
            }
            0x0A => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Language descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(4) {
                    let audio_type = entry[3];
                    info!(
                        "{}  Lang: {}{}{} Type: ({}) {}",
                        pad,
                        entry[0] as char,
                        entry[1] as char,
                        entry[2] as char,
                        audio_type,
                        match audio_type {
                            0 => "",
                            1 => "clean effects",
                            2 => "visual impaired commentary",
                            3 => "hearing impaired",
                            _ => "reserved",
                        }
                    );
                }
            }
            0x0E => {
                if data.len() >= 3 {
                    let max_bitrate = (((data[0] & 0x3F) as u32) << 16)
                        | ((data[1] as u32) << 8)
                        | data[2] as u32;
                    info!(
                        "{}Tag 0x{:02x} ({:02}), sz: {}, Maximum bitrate descriptor: 0x{:04x} ({} Bytes/sec)",
                        pad,
                        tag,
                        tag,
                        this_length,
                        max_bitrate,
                        max_bitrate * 50
                    );
                }
            }
            0x40 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Network name descriptor",
                    pad, tag, tag, this_length
                );
                dvb_print_string(pad, "Network name:", data);
            }
            0x41 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Service_list_descriptor",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(3) {
                    let service_id = ((entry[0] as u16) << 8) | entry[1] as u16;
                    info!(
                        "{}  Service_Id: 0x{:04x} ({}) Type: 0x{:02x} ({})",
                        pad, service_id, service_id, entry[2], entry[2]
                    );
                }
            }
            0x44 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Cable_delivery_system descriptor",
                    pad, tag, tag, this_length
                );
                if data.len() >= 11 {
                    let freq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let fec_outer = data[5] & 0x0F;
                    let modulation = data[6];
                    let symbol_rate = ((data[7] as u32) << 20)
                        | ((data[8] as u32) << 12)
                        | ((data[9] as u32) << 4)
                        | ((data[10] as u32) >> 4);
                    let fec_inner = data[10] & 0x0F;
                    info!("{}  Frequency  : 0x{:08x}", pad, freq);
                    info!(
                        "{}  FEC_outer  : {} (0x{:x})",
                        pad,
                        match fec_outer {
                            0 => "Not defined",
                            1 => "no outer FEC coding",
                            2 => "RS (204/188)",
                            _ => "Reserved",
                        },
                        fec_outer
                    );
                    info!(
                        "{}  Modulation : {} ({}/0x{:02x})",
                        pad,
                        match modulation {
                            0 => "Not defined",
                            1 => "16-QAM",
                            2 => "32-QAM",
                            3 => "64-QAM",
                            4 => "128-QAM",
                            5 => "256-QAM",
                            _ => "Reserved",
                        },
                        modulation,
                        modulation
                    );
                    info!("{}  symbol_rate: 0x{:07x}", pad, symbol_rate);
                    info!("{}  FEC_inner  : 0x{:x}", pad, fec_inner);
                }
            }
            0x45 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, VBI_data descriptor (not decoded)",
                    pad, tag, tag, this_length
                );
            }
            0x48 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Service descriptor:",
                    pad, tag, tag, this_length
                );
                if data.len() >= 2 {
                    info!(
                        "{}  Service type : {}",
                        pad,
                        match data[0] {
                            0x01 => "digital tv service",
                            0x02 => "digital radio service",
                            _ => "other",
                        }
                    );
                    let provider_len = (data[1] as usize).min(data.len() - 2);
                    dvb_print_string(pad, "Provider name:", &data[2..2 + provider_len]);
                    let service_ofs = 2 + provider_len;
                    if data.len() > service_ofs {
                        let service_len =
                            (data[service_ofs] as usize).min(data.len() - service_ofs - 1);
                        dvb_print_string(
                            pad,
                            "Service name :",
                            &data[service_ofs + 1..service_ofs + 1 + service_len],
                        );
                    }
                }
            }
            0x4D => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Short event descriptor:",
                    pad, tag, tag, this_length
                );
                if data.len() >= 4 {
                    info!(
                        "{}  Lang : {}{}{}",
                        pad, data[0] as char, data[1] as char, data[2] as char
                    );
                    let event_len = (data[3] as usize).min(data.len() - 4);
                    dvb_print_string(pad, "Event:", &data[4..4 + event_len]);
                    let text_ofs = 4 + event_len;
                    if data.len() > text_ofs {
                        let text_len = (data[text_ofs] as usize).min(data.len() - text_ofs - 1);
                        dvb_print_string(pad, "Text :", &data[text_ofs + 1..text_ofs + 1 + text_len]);
                    }
                }
            }
            0x4E => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Extended event descriptor:",
                    pad, tag, tag, this_length
                );
                if data.len() >= 5 {
                    info!(
                        "{}  Desc_number: {} Last Desc_number: {}",
                        pad,
                        data[0] >> 4,
                        data[0] & 0x0F
                    );
                    info!(
                        "{}  Lang    : {}{}{}",
                        pad, data[1] as char, data[2] as char, data[3] as char
                    );
                    let items_len = (data[4] as usize).min(data.len() - 5);
                    info!("{}  ItemsLen: {}", pad, items_len);
                    let text_ofs = 5 + items_len;
                    if data.len() > text_ofs {
                        let text_len = (data[text_ofs] as usize).min(data.len() - text_ofs - 1);
                        dvb_print_string(
                            pad,
                            "Text    :",
                            &data[text_ofs + 1..text_ofs + 1 + text_len],
                        );
                    }
                }
            }
            0x50 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Component descriptor:",
                    pad, tag, tag, this_length
                );
                if data.len() >= 6 {
                    info!(
                        "{}  Stream_content: {} Component_type:{} Component_tag:{}",
                        pad,
                        data[0] & 0x0F,
                        data[1],
                        data[2]
                    );
                    info!(
                        "{}  Lang : {}{}{}",
                        pad, data[3] as char, data[4] as char, data[5] as char
                    );
                    dvb_print_string(pad, "Text :", &data[6..]);
                }
            }
            0x52 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Stream identifier descriptor: Component_tag: 0x{:02x} ({})",
                    pad,
                    tag,
                    tag,
                    this_length,
                    data.first().copied().unwrap_or(0),
                    data.first().copied().unwrap_or(0)
                );
            }
            0x54 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Content descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(2) {
                    info!(
                        "{}  Content1: {} Content2: {} User1: {} User2: {}",
                        pad,
                        entry[0] >> 4,
                        entry[0] & 0x0F,
                        entry[1] >> 4,
                        entry[1] & 0x0F
                    );
                }
            }
            0x55 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Parental rating descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(4) {
                    info!(
                        "{}  Country: {}{}{}",
                        pad, entry[0] as char, entry[1] as char, entry[2] as char
                    );
                    match entry[3] {
                        0 => info!("{}  Rating : undefined", pad),
                        rating @ 0x01..=0x0F => {
                            info!("{}  Rating : min age {} years", pad, rating + 3)
                        }
                        rating => info!("{}  Rating : private - 0x{:02x} ({})", pad, rating, rating),
                    }
                }
            }
            0x56 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Teletext descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(5) {
                    info!(
                        "{}  Lang: {}{}{}",
                        pad, entry[0] as char, entry[1] as char, entry[2] as char
                    );
                    let teletext_type = (entry[3] & 0xF8) >> 3;
                    info!(
                        "{}  Type: {}, Desc: {}",
                        pad,
                        teletext_type,
                        match teletext_type {
                            1 => "Initial",
                            2 => "Subtitles",
                            3 => "Additional info",
                            4 => "Program schedule",
                            5 => "Hearing impaired subtitles",
                            _ => "(reserved)",
                        }
                    );
                    info!(
                        "{}  Magazine: {}, Page: {}",
                        pad,
                        entry[3] & 0x07,
                        entry[4]
                    );
                }
            }
            0x58 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Local timeoffset descriptor",
                    pad, tag, tag, this_length
                );
                if this_length % 13 != 0 {
                    info!("{}  !!! length % 13 != 0 ({})", pad, this_length);
                    continue;
                }
                for entry in data.chunks_exact(13) {
                    let polarity = entry[3] & 0x01;
                    let lto = ((entry[4] as u16) << 8) | entry[5] as u16;
                    let mjd = ((entry[6] as u16) << 8) | entry[7] as u16;
                    let bcd = ((entry[8] as u32) << 16) | ((entry[9] as u32) << 8) | entry[10] as u32;
                    let lto_next = ((entry[11] as u16) << 8) | entry[12] as u16;
                    info!(
                        "{}  Country code: {}{}{}",
                        pad, entry[0] as char, entry[1] as char, entry[2] as char
                    );
                    info!("{}  Region_id   : {}", pad, entry[3] >> 2);
                    info!("{}  LTO polarity: {}", pad, polarity);
                    info!(
                        "{}  LTO         : {}{:04x}",
                        pad,
                        if polarity != 0 { '-' } else { '+' },
                        lto
                    );
                    if let Some(change) = decode_mjd_datetime(mjd, bcd) {
                        info!(
                            "{}  Change time : ({}) /0x{:04x}{:06x}/",
                            pad, change, mjd, bcd
                        );
                    }
                    info!(
                        "{}  LTO next    : {}{:04x}",
                        pad,
                        if polarity != 0 { '-' } else { '+' },
                        lto_next
                    );
                }
            }
            0x59 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Subtitling descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(8) {
                    let composition_page_id = ((entry[4] as u16) << 8) | entry[5] as u16;
                    let ancillary_page_id = ((entry[6] as u16) << 8) | entry[7] as u16;
                    info!(
                        "{}  Lang: {}{}{}, Sub_type: {}, Composition_page_id: {}, Ancillary_page_id: {}",
                        pad,
                        entry[0] as char,
                        entry[1] as char,
                        entry[2] as char,
                        entry[3],
                        composition_page_id,
                        ancillary_page_id
                    );
                }
            }
            0x5F => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Private data specifier descriptor:",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(4) {
                    info!(
                        "{}  Specifier: 0x{:02x}{:02x}{:02x}{:02x}",
                        pad, entry[0], entry[1], entry[2], entry[3]
                    );
                }
            }
            0x62 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Frequency_list_descriptor",
                    pad, tag, tag, this_length
                );
                if !data.is_empty() {
                    let coding_type = data[0] & 0x03;
                    info!(
                        "{}  Coding_type: {} ({}/0x{:x})",
                        pad,
                        match coding_type {
                            0 => "Not defined",
                            1 => "Satellite",
                            2 => "Cable",
                            _ => "Terrestrial",
                        },
                        coding_type,
                        coding_type
                    );
                    for entry in data[1..].chunks_exact(4) {
                        let freq = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
                        info!("{}  Frequency: 0x{:08x}", pad, freq);
                    }
                }
            }
            0x69 => {
                if data.len() >= 3 {
                    info!(
                        "{}Tag 0x{:02x} ({:02}), sz: {}, PDC descriptor: Prg_id_label: 0x{:02x}{:02x}{:02x}",
                        pad,
                        tag,
                        tag,
                        this_length,
                        data[0] & 0x0F,
                        data[1],
                        data[2]
                    );
                }
            }
            0x6A => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, AC-3 descriptor",
                    pad, tag, tag, this_length
                );
            }
            0x7B => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, DTS descriptor",
                    pad, tag, tag, this_length
                );
            }
            0x83 => {
                info!(
                    "{}Tag 0x{:02x} ({:02}), sz: {}, Logical channel descriptor",
                    pad, tag, tag, this_length
                );
                for entry in data.chunks_exact(4) {
                    let service_id = ((entry[0] as u16) << 8) | entry[1] as u16;
                    let visible = entry[2] >> 7;
                    let lcn = (((entry[2] & 0x3F) as u16) << 8) | entry[3] as u16;
                    info!(
                        "{}  Service_ID: 0x{:04x} ({:4}) LCN: {:3} Visible: {}",
                        pad, service_id, service_id, lcn, visible
                    );
                }
            }
            _ => {
                info!(
                    "{}*** Unknown Tag 0x{:02x} ({:02}), sz: {}, data: {}",
                    pad,
                    tag,
                    tag,
                    this_length,
                    hex_dump(data, 0)
                );
            }
        }
    }
}

/// H.222.0 / ISO 13818-1 stream type assignments relevant to PES
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum StreamType {
    /// MPEG-1 video.
    Mpeg1Video = 0x01,
    /// H.262 / MPEG-2 video.
    Mpeg2Video = 0x02,
    /// MPEG-1 audio.
    Mpeg1Audio = 0x03,
    /// MPEG-2 audio.
    Mpeg2Audio = 0x04,
    /// Private PES data; AC-3 in DVB is signalled through descriptor 0x6A.
    PrivateData = 0x06,
    /// AAC with ADTS transport syntax.
    AdtsAudio = 0x0F,
    /// MPEG-4 part 2 video.
    Mpeg4Part2Video = 0x10,
    /// H.264 / MPEG-4 part 10 video.
    AvcVideo = 0x1B,
    /// Chinese AVS video.
    AvsVideo = 0x42,
    /// AC-3 in ATSC systems.
    AtscAc3Audio = 0x81,
}

/// True for the video stream types (MPEG-1/2, MPEG-4 part 2, H.264, AVS).
pub fn is_stream_type_video(stream_type: u8) -> bool {
    matches!(
        StreamType::from_u8(stream_type),
        Some(StreamType::Mpeg1Video)
            | Some(StreamType::Mpeg2Video)
            | Some(StreamType::Mpeg4Part2Video)
            | Some(StreamType::AvcVideo)
            | Some(StreamType::AvsVideo)
    )
}

/// True for the stream types that commonly carry AC-3. The descriptors must
/// still be consulted to be certain.
pub fn is_stream_type_ac3(stream_type: u8) -> bool {
    matches!(
        StreamType::from_u8(stream_type),
        Some(StreamType::PrivateData) | Some(StreamType::AtscAc3Audio)
    )
}

/// True for the audio stream types (MPEG-1/2, ADTS AAC, AC-3 carriers).
pub fn is_stream_type_audio(stream_type: u8) -> bool {
    matches!(
        StreamType::from_u8(stream_type),
        Some(StreamType::Mpeg1Audio) | Some(StreamType::Mpeg2Audio) | Some(StreamType::AdtsAudio)
    ) || is_stream_type_ac3(stream_type)
}

/// ISO/IEC 13818-1 Table 2-29 stream type description.
pub fn h222_stream_type_desc(stream_type: u8) -> &'static str {
    match stream_type {
        0x01 => "11172-2 video (MPEG-1)",
        0x02 => "H.262/13818-2 video (MPEG-2) or 11172-2 constrained video",
        0x03 => "11172-3 audio (MPEG-1)",
        0x04 => "13818-3 audio (MPEG-2)",
        0x05 => "H.222.0/13818-1 private sections",
        0x06 => "H.222.0/13818-1 PES private data",
        0x07 => "13522 MHEG",
        0x08 => "H.222.0/13818-1 Annex A - DSM CC",
        0x09 => "H.222.1",
        0x0A => "13818-6 type A",
        0x0B => "13818-6 type B",
        0x0C => "13818-6 type C",
        0x0D => "13818-6 type D",
        0x0E => "H.222.0/13818-1 auxiliary",
        0x0F => "13818-7 Audio with ADTS transport syntax",
        0x10 => "14496-2 Visual (MPEG-4 part 2 video)",
        0x11 => "14496-3 Audio with LATM transport syntax (14496-3/AMD 1)",
        0x12 => "14496-1 SL-packetized or FlexMux stream in PES packets",
        0x13 => "14496-1 SL-packetized or FlexMux stream in 14496 sections",
        0x14 => "ISO/IEC 13818-6 Synchronized Download Protocol",
        0x15 => "Metadata in PES packets",
        0x16 => "Metadata in metadata_sections",
        0x17 => "Metadata in 13818-6 Data Carousel",
        0x18 => "Metadata in 13818-6 Object Carousel",
        0x19 => "Metadata in 13818-6 Synchronized Download Protocol",
        0x1A => "13818-11 MPEG-2 IPMP stream",
        0x1B => "H.264/14496-10 video (MPEG-4/AVC)",
        0x42 => "AVS Video",
        0x7F => "IPMP stream",
        0x00 | 0x1C..=0x7D => "Reserved",
        _ => "Unknown",
    }
}

/// ISO 13818-1 Table 2-18 system start code description.
pub fn h222_stream_id_desc(stream_id: u8) -> String {
    match stream_id {
        0xbc => "Program stream map".to_string(),
        0xbd => "Private stream 1".to_string(),
        0xbe => "Padding stream".to_string(),
        0xbf => "Private stream 2".to_string(),
        0xf0 => "ECM stream".to_string(),
        0xf1 => "EMM stream".to_string(),
        0xf2 => "DSMCC stream".to_string(),
        0xf3 => "13522 stream".to_string(),
        0xf4 => "H.222 A stream".to_string(),
        0xf5 => "H.222 B stream".to_string(),
        0xf6 => "H.222 C stream".to_string(),
        0xf7 => "H.222 D stream".to_string(),
        0xf8 => "H.222 E stream".to_string(),
        0xf9 => "Ancillary stream".to_string(),
        0xff => "Program stream directory".to_string(),
        0xc0..=0xdf => format!("Audio stream {}", stream_id & 0x1f),
        0xe0..=0xef => format!("Video stream {}", stream_id & 0x0f),
        0xfc..=0xfe => "Reserved data stream".to_string(),
        _ => format!("Unrecognised stream id 0x{:02x}", stream_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walker_stops_on_truncated_entry() {
        // Two good descriptors, then one claiming 10 bytes with only 2 left.
        let blob = [
            0x52, 0x01, 0x07, // stream identifier
            0x6A, 0x00, // AC-3, empty
            0x48, 0x0A, 0x01, 0x00, // truncated service descriptor
        ];
        let parsed = Descriptor::parse_all(&blob);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].tag, 0x52);
        assert_eq!(&parsed[0].data[..], &[0x07]);
        assert_eq!(parsed[1].tag, 0x6A);
        assert!(parsed[1].data.is_empty());
    }

    #[test]
    fn ca_system_ranges() {
        assert_eq!(ca_system(0x0100), CaSystem::Seca);
        assert_eq!(ca_system(0x01FF), CaSystem::Seca);
        assert_eq!(ca_system(0x0604), CaSystem::Irdeto);
        assert_eq!(ca_system(0x0B00), CaSystem::Conax);
        assert_eq!(ca_system(0x1811), CaSystem::Nagra);
        assert_eq!(ca_system(0x4ABF), CaSystem::DgCrypt);
        assert_eq!(ca_system(0x4AE1), CaSystem::DreCrypt);
        assert_eq!(ca_system(0x5581), CaSystem::Bulcrypt);
        assert_eq!(ca_system(0x5504), CaSystem::Griffin);
        assert_eq!(ca_system(0x2000), CaSystem::Unknown);
    }

    #[test]
    fn ca_descriptor_lookup() {
        let blob = [
            0x52, 0x01, 0x07, // unrelated descriptor
            0x09, 0x04, 0x0B, 0x00, 0xE1, 0x23, // CONAX on PID 0x123
            0x09, 0x04, 0x06, 0x02, 0xE4, 0x56, // IRDETO on PID 0x456
        ];
        let found = find_ca_descriptor(&blob, |id, _| ca_system(id) == CaSystem::Irdeto);
        assert_eq!(found, Some((0x0602, 0x0456)));
        let found = find_ca_descriptor(&blob, |_, pid| pid == 0x123);
        assert_eq!(found, Some((0x0B00, 0x0123)));
        assert!(find_ca_descriptor(&blob, |id, _| id == 0x1800).is_none());
    }

    #[test]
    fn stream_type_classes() {
        assert!(is_stream_type_video(0x02));
        assert!(is_stream_type_video(0x1B));
        assert!(!is_stream_type_video(0x03));
        assert!(is_stream_type_audio(0x03));
        assert!(is_stream_type_audio(0x0F));
        assert!(is_stream_type_audio(0x81));
        assert!(is_stream_type_ac3(0x06));
        assert!(!is_stream_type_ac3(0x04));
    }
}
