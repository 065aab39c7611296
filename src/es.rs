//! Elementary stream probing: the MPEG-1 audio frame header (ISO 11172-3).

use log::{info, warn};

/// Decoded 4-byte MPEG audio frame header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MpegAudioHeader {
    /// 12-bit sync word, always 0xFFF.
    pub syncword: u16,
    /// ID bit; set for MPEG audio.
    pub id: bool,
    /// Layer code: 3 Layer I, 2 Layer II, 1 Layer III.
    pub layer: u8,
    /// Protection (CRC absent) bit.
    pub protection_bit: bool,
    /// Bitrate table index.
    pub bitrate_index: u8,
    /// Sampling frequency code.
    pub sampling_freq: u8,
    /// Padding bit.
    pub padding_bit: bool,
    /// Private bit.
    pub private_bit: bool,
    /// Channel mode.
    pub mode: u8,
    /// Mode extension.
    pub mode_extension: u8,
    /// Copyright bit.
    pub copyright: bool,
    /// Original-or-home bit.
    pub original: bool,
    /// Emphasis code.
    pub emphasis: u8,
}

impl MpegAudioHeader {
    /// Decodes the frame header at the start of `data`; `None` when the
    /// sync word is absent or the input is shorter than four bytes.
    pub fn parse(data: &[u8]) -> Option<MpegAudioHeader> {
        if data.len() < 4 {
            return None;
        }
        let header = MpegAudioHeader {
            syncword: ((data[0] as u16) << 4) | ((data[1] as u16) >> 4),
            id: data[1] & 0x08 != 0,
            layer: (data[1] & 0x06) >> 1,
            protection_bit: data[1] & 0x01 != 0,
            bitrate_index: data[2] >> 4,
            sampling_freq: (data[2] & 0x0C) >> 2,
            padding_bit: data[2] & 0x02 != 0,
            private_bit: data[2] & 0x01 != 0,
            mode: data[3] >> 6,
            mode_extension: (data[3] & 0x30) >> 4,
            copyright: data[3] & 0x08 != 0,
            original: data[3] & 0x04 != 0,
            emphasis: data[3] & 0x03,
        };
        if header.syncword != 0xFFF {
            warn!(
                "!!! Error parsing mpeg audio header! Syncword should be 0xfff but it is 0x{:03x}!",
                header.syncword
            );
            return None;
        }
        Some(header)
    }

    /// The frame bitrate in kbit/s, when the layer and index name one.
    pub fn bitrate_kbps(&self) -> Option<u32> {
        // See ISO 11172-3, bitrate tables per layer
        const LAYER1: [u32; 15] = [
            0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
        ];
        const LAYER2: [u32; 15] = [
            0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
        ];
        const LAYER3: [u32; 15] = [
            0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
        ];
        let table = match self.layer {
            3 => &LAYER1,
            2 => &LAYER2,
            1 => &LAYER3,
            _ => return None,
        };
        table.get(self.bitrate_index as usize).copied()
    }

    /// Logs the decoded header fields.
    pub fn dump(&self) {
        info!("  - ES analyze audio frame");
        info!("    - Syncword      : {:x}", self.syncword);
        info!(
            "    - ID            : {} ({})",
            self.id as u8,
            if self.id { "MPEG Audio" } else { "Other" }
        );
        info!(
            "    - layer         : {} ({})",
            self.layer,
            match self.layer {
                1 => "Layer III",
                2 => "Layer II",
                3 => "Layer I",
                _ => "reserved",
            }
        );
        info!("    - protection_bit: {}", self.protection_bit as u8);
        info!(
            "    - bitrate_index : {} ({} kBit/s)",
            self.bitrate_index,
            self.bitrate_kbps().unwrap_or(0)
        );
        info!(
            "    - sampl_freq    : {} ({})",
            self.sampling_freq,
            match self.sampling_freq {
                0 => "44.1 kHz",
                1 => "48 kHz",
                2 => "32 kHz",
                _ => "reserved",
            }
        );
        info!("    - padding_bit   : {}", self.padding_bit as u8);
        info!("    - private_bit   : {}", self.private_bit as u8);
        info!(
            "    - mode          : {} ({})",
            self.mode,
            match self.mode {
                0 => "stereo",
                1 => "join_stereo",
                2 => "dual_channel",
                _ => "single_channel",
            }
        );
        info!("    - mode_extension: {:x}", self.mode_extension);
        info!("    - copyright     : {}", self.copyright as u8);
        info!("    - org_home      : {}", self.original as u8);
        info!(
            "    - emphasis      : {} ({})",
            self.emphasis,
            match self.emphasis {
                0 => "none",
                1 => "50/15 microseconds",
                2 => "reserved",
                _ => "CCITT J.17",
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layer2_header() {
        // 0xFFFC: sync 0xFFF, ID 1, layer 2 (Layer II), no protection
        // 0xC4: bitrate index 12 (256 kbit/s), 48 kHz, no padding
        // 0x00: stereo
        let header = MpegAudioHeader::parse(&[0xFF, 0xFC, 0xC4, 0x00]).unwrap();
        assert_eq!(header.syncword, 0xFFF);
        assert!(header.id);
        assert_eq!(header.layer, 2);
        assert_eq!(header.bitrate_index, 12);
        assert_eq!(header.bitrate_kbps(), Some(256));
        assert_eq!(header.sampling_freq, 1);
        assert_eq!(header.mode, 0);
    }

    #[test]
    fn rejects_bad_sync() {
        assert!(MpegAudioHeader::parse(&[0xFF, 0x6C, 0xC4, 0x00]).is_none());
        assert!(MpegAudioHeader::parse(&[0xFF, 0xFC]).is_none());
    }
}
