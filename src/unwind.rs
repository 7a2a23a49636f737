//! `__compact_unwind` decoding. Each fixed-size entry describes how to
//! unwind through one code range; the compiler leaves the cross-references
//! as relocations, so parsing means applying a very restricted relocation
//! shape and binding every record onto the subsection it covers.

use crate::bail;
use crate::error::Result;
use crate::macho;
use crate::macho::CompactUnwindEntry;
use crate::object_file::ObjectFile;
use crate::subsections::InputSection;
use crate::symbol_db::SymbolSlot;
use object::LittleEndian;
use std::mem::offset_of;

#[derive(Clone, Copy)]
pub struct UnwindRecord<'data> {
    pub code_len: u32,
    pub encoding: u32,

    /// The code subsection this record covers. Always set after a
    /// successful parse.
    pub subsec: Option<u32>,
    pub offset: u64,

    /// The personality routine, as the owning file's symbol slot: a
    /// relocation may name any native symbol-table entry, local ones
    /// included.
    pub personality: Option<SymbolSlot<'data>>,

    pub lsda: Option<u32>,
    pub lsda_offset: u64,
}

impl UnwindRecord<'_> {
    fn new(code_len: u32, encoding: u32) -> Self {
        UnwindRecord {
            code_len,
            encoding,
            subsec: None,
            offset: 0,
            personality: None,
            lsda: None,
            lsda_offset: 0,
        }
    }
}

const ENTRY_SIZE: u64 = size_of::<CompactUnwindEntry>() as u64;
const CODE_START: u64 = offset_of!(CompactUnwindEntry, code_start) as u64;
const PERSONALITY: u64 = offset_of!(CompactUnwindEntry, personality) as u64;
const LSDA: u64 = offset_of!(CompactUnwindEntry, lsda) as u64;

pub(crate) fn parse_compact_unwind<'data>(
    file: &mut ObjectFile<'data>,
    hdr: &InputSection<'data>,
) -> Result {
    let e = LittleEndian;

    if hdr.size % ENTRY_SIZE != 0 {
        bail!("{}: invalid __compact_unwind section size", file.common);
    }
    let num_entries = (hdr.size / ENTRY_SIZE) as usize;

    let entries: &[CompactUnwindEntry] =
        macho::slice_at(file.data, u64::from(hdr.file_offset), num_entries)?;
    file.unwind_records = entries
        .iter()
        .map(|entry| UnwindRecord::new(entry.code_len.get(e), entry.encoding.get(e)))
        .collect();

    let relocs: &[macho::MachRel] =
        macho::slice_at(file.data, u64::from(hdr.reloc_offset), hdr.nrelocs as usize)?;

    for (reloc_index, reloc) in relocs.iter().enumerate() {
        let info = reloc.info(e);
        let offset = u64::from(info.r_address);
        if offset >= hdr.size {
            bail!("{}: relocation offset too large: {reloc_index}", file.common);
        }
        let entry_index = (offset / ENTRY_SIZE) as usize;

        let unsupported = || {
            anyhow::anyhow!(
                "{}: __compact_unwind: unsupported relocation: {reloc_index}",
                file.common
            )
        };

        // All compact-unwind relocations are absolute 8-byte pointers.
        if info.r_pcrel || info.r_length != 3 || info.r_type != 0 {
            return Err(unsupported());
        }

        match offset % ENTRY_SIZE {
            CODE_START => {
                if info.r_extern {
                    return Err(unsupported());
                }
                let addr = entries[entry_index].code_start.get(e);
                let target = file.find_subsection(addr).ok_or_else(unsupported)?;
                let record = &mut file.unwind_records[entry_index];
                record.subsec = Some(target);
                record.offset = addr - file.subsections[target as usize].input_addr;
            }
            PERSONALITY => {
                let personality = if info.r_extern {
                    // The relocation names a symbol-table slot directly;
                    // any slot is fair game, local ones included.
                    match file.syms.get(info.r_symbolnum as usize) {
                        Some(&slot) => slot,
                        None => return Err(unsupported()),
                    }
                } else {
                    let addr = entries[entry_index].personality.get(e);
                    let sym = file.find_symbol(addr).ok_or_else(|| {
                        anyhow::anyhow!(
                            "{}: __compact_unwind: unsupported local personality reference: \
                             {reloc_index}",
                            file.common
                        )
                    })?;
                    SymbolSlot::Global(sym)
                };
                file.unwind_records[entry_index].personality = Some(personality);
            }
            LSDA => {
                if info.r_extern {
                    return Err(unsupported());
                }
                let addr = entries[entry_index].lsda.get(e);
                let target = file.find_subsection(addr).ok_or_else(unsupported)?;
                let record = &mut file.unwind_records[entry_index];
                record.lsda = Some(target);
                record.lsda_offset = addr - file.subsections[target as usize].input_addr;
            }
            _ => return Err(unsupported()),
        }
    }

    for (i, record) in file.unwind_records.iter().enumerate() {
        if record.subsec.is_none() {
            bail!(
                "{}: __compact_unwind: missing relocation at {i}",
                file.common
            );
        }
    }

    // Order records by target so each subsection's records are one
    // contiguous run, then note the run on the subsection itself.
    let subsections = &file.subsections;
    file.unwind_records.sort_by_key(|record| {
        (
            subsections[record.subsec.unwrap() as usize].input_addr,
            record.offset,
        )
    });

    let mut i = 0;
    while i < num_entries {
        let subsec = file.unwind_records[i].subsec.unwrap();
        let start = i;
        while i < num_entries && file.unwind_records[i].subsec == Some(subsec) {
            i += 1;
        }
        let subsec = &mut file.subsections[subsec as usize];
        subsec.unwind_offset = start as u32;
        subsec.nunwind = (i - start) as u32;
    }

    Ok(())
}
