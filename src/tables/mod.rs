//! PSI/SI table codecs.
//!
//! Every codec is an accumulator: feed it 188-byte TS packets through
//! `push_packet` until `is_initialized` reports true, then read the
//! structured fields, optionally mutate, and `generate` fresh packets.
//! Structural violations reset the accumulator and are logged; nothing
//! escapes to the caller.

use crate::packet::TsHeader;
use crate::section::Section;
use crate::TS_PACKET_SIZE;
use enum_dispatch::enum_dispatch;

pub mod cat;
pub mod eit;
pub mod nit;
pub mod pat;
pub mod pmt;
pub mod privsec;
pub mod sdt;
pub mod tdt;

pub use cat::Cat;
pub use eit::{Eit, EitEvent};
pub use nit::{Nit, NitStream};
pub use pat::{Pat, PatProgram};
pub use pmt::{Pmt, PmtStream};
pub use privsec::PrivateSection;
pub use sdt::{Sdt, SdtService};
pub use tdt::Tdt;

/// Shared accumulator state of the section-based table codecs: the TS
/// header held for the in-progress section, the section buffers, and the
/// table-level initialized flag.
#[derive(Debug, Default, Clone)]
pub(crate) struct TableState {
    pub held: Option<TsHeader>,
    pub section: Section,
    pub initialized: bool,
}

impl TableState {
    pub fn clear(&mut self) {
        self.held = None;
        self.section.reset();
        self.initialized = false;
    }

    /// The TS header used when regenerating packets; a freshly built table
    /// holds the header its `init` seeded.
    pub fn ts_header(&self) -> TsHeader {
        self.held.unwrap_or_default()
    }
}

/// Hooks each section-based table codec provides to the shared push engine.
pub(crate) trait TableParser {
    /// PID this table is constrained to, when the standard assigns one.
    const PID: Option<u16>;
    /// Table name used in diagnostics.
    const NAME: &'static str;

    fn accepts_table_id(table_id: u8) -> bool;
    fn state(&mut self) -> &mut TableState;
    /// Full reset: entries and accumulator state.
    fn clear(&mut self);
    /// Runs once the section is assembled; false resets the accumulator.
    fn parse_table(&mut self) -> bool;
}

/// The shared push protocol: header parse, PID constraint, restart on a new
/// PUSI, section header validation, accumulation, and parse-on-completion.
pub(crate) fn push_section_packet<T: TableParser>(tbl: &mut T, packet: &[u8; TS_PACKET_SIZE]) {
    let hdr = match TsHeader::parse(packet) {
        Ok(hdr) if hdr.payload_field => hdr,
        _ => return,
    };

    if let Some(pid) = T::PID {
        if hdr.pid != pid {
            return;
        }
    }

    // A PUSI while mid-section restarts gathering on this packet.
    if hdr.pusi && tbl.state().held.map_or(false, |held| held.pusi) {
        tbl.clear();
    }
    if !tbl.state().held.map_or(false, |held| held.pusi) {
        tbl.state().held = Some(hdr);
    }

    if hdr.pusi {
        match Section::fields_from_packet(packet, &hdr) {
            Some(fields) if T::accepts_table_id(fields.table_id) => {
                tbl.state().section.begin(&fields);
            }
            _ => {
                tbl.state().held = None;
                return;
            }
        }
    }

    if !tbl.state().initialized {
        let state = tbl.state();
        state.section.add_packet(&hdr, packet);
        if state.section.assembled() {
            if tbl.parse_table() {
                tbl.state().initialized = true;
            } else {
                tbl.clear();
            }
        }
    }
}

/// Uniform handle over the table codecs.
#[enum_dispatch]
pub trait SectionTable {
    /// Feeds one 188-byte TS packet to the accumulator.
    fn push_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]);
    /// True once a complete, CRC-valid table has been assembled.
    fn is_initialized(&self) -> bool;
    /// Re-serializes the table into TS packets.
    fn generate(&self) -> Vec<[u8; TS_PACKET_SIZE]>;
    /// Emits the human-readable trace, including the generator self-check.
    fn dump(&self);
}

/// Any of the supported SI/PSI table codecs behind one static dispatch.
#[enum_dispatch(SectionTable)]
pub enum SiTable {
    /// Program association table.
    Pat(Pat),
    /// Conditional access table.
    Cat(Cat),
    /// Program map table.
    Pmt(Pmt),
    /// Network information table.
    Nit(Nit),
    /// Service description table.
    Sdt(Sdt),
    /// Event information table.
    Eit(Eit),
    /// Time/date and time-offset tables.
    Tdt(Tdt),
    /// Opaque private section.
    PrivateSection(PrivateSection),
}
