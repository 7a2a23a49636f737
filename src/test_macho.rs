//! Builds complete little-endian Mach-O images in memory for tests:
//! relocatable objects with sections, symbol tables and relocations, and
//! dylibs with an export trie. Layout mirrors what the decoder expects;
//! nothing here is reachable outside `cfg(test)`.

use crate::args::Input;
use crate::args::Modifiers;
use crate::macho::MachSym;
use object::LittleEndian as LE;
use object::U16;
use object::U32;
use object::U64Bytes;
use object::macho;

pub(crate) struct ObjBuilder {
    flags: u32,
    sections: Vec<SecSpec>,
    syms: Vec<SymSpec>,
    linker_options: Vec<String>,
}

pub(crate) struct SecSpec {
    segment: String,
    section: String,
    addr: u64,
    align: u32,
    flags: u32,
    data: Vec<u8>,
    relocs: Vec<RelocSpec>,
}

#[derive(Clone, Copy)]
pub(crate) struct RelocSpec {
    pub(crate) address: u32,
    pub(crate) symbolnum: u32,
    pub(crate) pcrel: bool,
    pub(crate) length: u8,
    pub(crate) is_extern: bool,
    pub(crate) r_type: u8,
}

pub(crate) struct SymSpec {
    pub(crate) name: String,
    pub(crate) n_type: u8,
    pub(crate) sect: u8,
    pub(crate) desc: u16,
    pub(crate) value: u64,
}

impl ObjBuilder {
    pub(crate) fn new() -> ObjBuilder {
        ObjBuilder {
            flags: macho::MH_SUBSECTIONS_VIA_SYMBOLS,
            sections: Vec::new(),
            syms: Vec::new(),
            linker_options: Vec::new(),
        }
    }

    /// Clears MH_SUBSECTIONS_VIA_SYMBOLS: each section moves as one unit.
    pub(crate) fn whole_sections(mut self) -> ObjBuilder {
        self.flags = 0;
        self
    }

    pub(crate) fn section(self, segment: &str, section: &str, addr: u64, align: u32, data: &[u8]) -> ObjBuilder {
        self.section_with_flags(segment, section, addr, align, data, 0)
    }

    pub(crate) fn section_with_flags(
        mut self,
        segment: &str,
        section: &str,
        addr: u64,
        align: u32,
        data: &[u8],
        flags: u32,
    ) -> ObjBuilder {
        self.sections.push(SecSpec {
            segment: segment.to_owned(),
            section: section.to_owned(),
            addr,
            align,
            flags,
            data: data.to_vec(),
            relocs: Vec::new(),
        });
        self
    }

    /// Attaches a relocation to the most recently added section.
    pub(crate) fn reloc(mut self, reloc: RelocSpec) -> ObjBuilder {
        self.sections.last_mut().expect("no section to relocate").relocs.push(reloc);
        self
    }

    pub(crate) fn sym(mut self, spec: SymSpec) -> ObjBuilder {
        self.syms.push(spec);
        self
    }

    pub(crate) fn global(self, name: &str, sect: u8, value: u64) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_SECT | macho::N_EXT,
            sect,
            desc: 0,
            value,
        })
    }

    pub(crate) fn weak_global(self, name: &str, sect: u8, value: u64) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_SECT | macho::N_EXT,
            sect,
            desc: macho::N_WEAK_DEF,
            value,
        })
    }

    pub(crate) fn alt_entry(self, name: &str, sect: u8, value: u64) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_SECT | macho::N_EXT,
            sect,
            desc: macho::N_ALT_ENTRY,
            value,
        })
    }

    pub(crate) fn local(self, name: &str, sect: u8, value: u64) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_SECT,
            sect,
            desc: 0,
            value,
        })
    }

    pub(crate) fn private_extern(self, name: &str, sect: u8, value: u64) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_SECT | macho::N_EXT | macho::N_PEXT,
            sect,
            desc: 0,
            value,
        })
    }

    pub(crate) fn undefined(self, name: &str) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_UNDF | macho::N_EXT,
            sect: 0,
            desc: 0,
            value: 0,
        })
    }

    pub(crate) fn common(self, name: &str, size: u64, p2align: u16) -> ObjBuilder {
        self.sym(SymSpec {
            name: name.to_owned(),
            n_type: macho::N_UNDF | macho::N_EXT,
            sect: 0,
            desc: p2align << 8,
            value: size,
        })
    }

    pub(crate) fn linker_option(mut self, option: &str) -> ObjBuilder {
        self.linker_options.push(option.to_owned());
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let e = LE;
        let nsects = self.sections.len();

        let segment_cmdsize = size_of::<macho::SegmentCommand64<LE>>()
            + nsects * size_of::<macho::Section64<LE>>();
        let symtab_cmdsize = size_of::<macho::SymtabCommand<LE>>();

        let mut linker_option_cmds: Vec<Vec<u8>> = Vec::new();
        if !self.linker_options.is_empty() {
            let payload_len: usize = self.linker_options.iter().map(|o| o.len() + 1).sum();
            let cmdsize = align_up(size_of::<macho::LinkerOptionCommand<LE>>() + payload_len, 8);
            let mut bytes = Vec::with_capacity(cmdsize);
            bytes.extend_from_slice(object::bytes_of(&macho::LinkerOptionCommand {
                cmd: U32::new(e, macho::LC_LINKER_OPTION),
                cmdsize: U32::new(e, cmdsize as u32),
                count: U32::new(e, self.linker_options.len() as u32),
            }));
            for option in &self.linker_options {
                bytes.extend_from_slice(option.as_bytes());
                bytes.push(0);
            }
            bytes.resize(cmdsize, 0);
            linker_option_cmds.push(bytes);
        }

        let ncmds = 2 + linker_option_cmds.len();
        let sizeofcmds = segment_cmdsize
            + symtab_cmdsize
            + linker_option_cmds.iter().map(Vec::len).sum::<usize>();
        let header_end = size_of::<macho::MachHeader64<LE>>() + sizeofcmds;

        // Content layout: section data, then relocations, then the symbol
        // table, then the string table. Blobs sit on 8-byte boundaries the
        // way a real assembler places them.
        let mut cursor = header_end;
        let mut data_offsets = Vec::with_capacity(nsects);
        for sec in &self.sections {
            cursor = align_up(cursor, 8);
            data_offsets.push(cursor as u32);
            cursor += sec.data.len();
        }
        let mut reloc_offsets = Vec::with_capacity(nsects);
        for sec in &self.sections {
            cursor = align_up(cursor, 8);
            reloc_offsets.push(if sec.relocs.is_empty() { 0 } else { cursor as u32 });
            cursor += sec.relocs.len() * size_of::<macho::Relocation<LE>>();
        }
        cursor = align_up(cursor, 8);
        let symoff = cursor as u32;
        cursor += self.syms.len() * size_of::<MachSym>();
        let stroff = cursor as u32;

        let mut strtab = vec![0u8];
        let strx: Vec<u32> = self
            .syms
            .iter()
            .map(|sym| {
                let offset = strtab.len() as u32;
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                offset
            })
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(object::bytes_of(&macho::MachHeader64 {
            magic: U32::new(object::BigEndian, macho::MH_CIGAM_64),
            cputype: U32::new(e, macho::CPU_TYPE_X86_64),
            cpusubtype: U32::new(e, 3),
            filetype: U32::new(e, macho::MH_OBJECT),
            ncmds: U32::new(e, ncmds as u32),
            sizeofcmds: U32::new(e, sizeofcmds as u32),
            flags: U32::new(e, self.flags),
            reserved: U32::new(e, 0),
        }));

        // segment_command_64, serialized field by field.
        push_u32(&mut out, macho::LC_SEGMENT_64);
        push_u32(&mut out, segment_cmdsize as u32);
        out.extend_from_slice(&[0u8; 16]); // segname
        push_u64(&mut out, 0); // vmaddr
        push_u64(&mut out, 0); // vmsize
        push_u64(&mut out, 0); // fileoff
        push_u64(&mut out, 0); // filesize
        push_u32(&mut out, 7); // maxprot
        push_u32(&mut out, 7); // initprot
        push_u32(&mut out, nsects as u32);
        push_u32(&mut out, 0); // flags

        // section_64 headers.
        for (i, sec) in self.sections.iter().enumerate() {
            out.extend_from_slice(&fixed_16(&sec.section));
            out.extend_from_slice(&fixed_16(&sec.segment));
            push_u64(&mut out, sec.addr);
            push_u64(&mut out, sec.data.len() as u64);
            push_u32(&mut out, data_offsets[i]);
            push_u32(&mut out, sec.align);
            push_u32(&mut out, reloc_offsets[i]);
            push_u32(&mut out, sec.relocs.len() as u32);
            push_u32(&mut out, sec.flags);
            push_u32(&mut out, 0); // reserved1
            push_u32(&mut out, 0); // reserved2
            push_u32(&mut out, 0); // reserved3
        }

        out.extend_from_slice(object::bytes_of(&macho::SymtabCommand {
            cmd: U32::new(e, macho::LC_SYMTAB),
            cmdsize: U32::new(e, symtab_cmdsize as u32),
            symoff: U32::new(e, symoff),
            nsyms: U32::new(e, self.syms.len() as u32),
            stroff: U32::new(e, stroff),
            strsize: U32::new(e, strtab.len() as u32),
        }));

        for cmd in &linker_option_cmds {
            out.extend_from_slice(cmd);
        }

        debug_assert_eq!(out.len(), header_end);

        for (i, sec) in self.sections.iter().enumerate() {
            out.resize(data_offsets[i] as usize, 0);
            out.extend_from_slice(&sec.data);
        }
        for (i, sec) in self.sections.iter().enumerate() {
            if !sec.relocs.is_empty() {
                out.resize(reloc_offsets[i] as usize, 0);
            }
            for reloc in &sec.relocs {
                let word1 = reloc.symbolnum & 0x00ff_ffff
                    | u32::from(reloc.pcrel) << 24
                    | u32::from(reloc.length) << 25
                    | u32::from(reloc.is_extern) << 27
                    | u32::from(reloc.r_type) << 28;
                out.extend_from_slice(object::bytes_of(&macho::Relocation {
                    r_word0: U32::new(e, reloc.address),
                    r_word1: U32::new(e, word1),
                }));
            }
        }
        out.resize(symoff as usize, 0);
        for (i, sym) in self.syms.iter().enumerate() {
            out.extend_from_slice(object::bytes_of(&MachSym {
                n_strx: U32::new(e, strx[i]),
                n_type: sym.n_type,
                n_sect: sym.sect,
                n_desc: U16::new(e, sym.desc),
                n_value: U64Bytes::new(e, sym.value),
            }));
        }
        out.extend_from_slice(&strtab);
        out
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.next_multiple_of(alignment)
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn fixed_16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    assert!(name.len() <= 16, "section name too long: {name}");
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Encodes a flat export trie: one root with a child edge per symbol.
pub(crate) fn encode_export_trie(exports: &[(&str, bool)]) -> Vec<u8> {
    // Root: no terminal info, then one (name, offset) edge per export.
    let root_size: usize = 2 + exports
        .iter()
        .map(|(name, _)| name.len() + 2)
        .sum::<usize>();

    let mut out = vec![0u8, exports.len() as u8];
    for (i, (name, _)) in exports.iter().enumerate() {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        // Terminal nodes are 4 bytes each, laid out after the root.
        let child_offset = root_size + i * 4;
        assert!(child_offset < 0x80, "trie too large for single-byte offsets");
        out.push(child_offset as u8);
    }
    assert_eq!(out.len(), root_size);

    for (_, weak) in exports {
        let flags = if *weak {
            macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION as u8
        } else {
            0
        };
        // ULEB payload size, flags, address, then zero children.
        out.extend_from_slice(&[2, flags, 0, 0]);
    }
    out
}

/// Builds a minimal dylib image: LC_ID_DYLIB, an export trie, and one
/// LC_REEXPORT_DYLIB per reexported path.
pub(crate) fn build_dylib(
    install_name: &str,
    exports: &[(&str, bool)],
    reexports: &[&str],
) -> Vec<u8> {
    let e = LE;
    let trie = encode_export_trie(exports);

    let dylib_cmd = |cmd: u32, name: &str| -> Vec<u8> {
        let fixed = size_of::<macho::DylibCommand<LE>>();
        let cmdsize = align_up(fixed + name.len() + 1, 8);
        let mut bytes = Vec::with_capacity(cmdsize);
        bytes.extend_from_slice(object::bytes_of(&macho::DylibCommand {
            cmd: U32::new(e, cmd),
            cmdsize: U32::new(e, cmdsize as u32),
            dylib: macho::Dylib {
                name: macho::LcStr {
                    offset: U32::new(e, fixed as u32),
                },
                timestamp: U32::new(e, 0),
                current_version: U32::new(e, 0),
                compatibility_version: U32::new(e, 0),
            },
        }));
        bytes.extend_from_slice(name.as_bytes());
        bytes.resize(cmdsize, 0);
        bytes
    };

    let id_cmd = dylib_cmd(macho::LC_ID_DYLIB, install_name);
    let reexport_cmds: Vec<Vec<u8>> = reexports
        .iter()
        .map(|path| dylib_cmd(macho::LC_REEXPORT_DYLIB, path))
        .collect();
    let trie_cmdsize = size_of::<macho::LinkeditDataCommand<LE>>();

    let ncmds = 2 + reexport_cmds.len();
    let sizeofcmds =
        id_cmd.len() + trie_cmdsize + reexport_cmds.iter().map(Vec::len).sum::<usize>();
    let header_end = size_of::<macho::MachHeader64<LE>>() + sizeofcmds;

    let mut out = Vec::new();
    out.extend_from_slice(object::bytes_of(&macho::MachHeader64 {
        magic: U32::new(object::BigEndian, macho::MH_CIGAM_64),
        cputype: U32::new(e, macho::CPU_TYPE_X86_64),
        cpusubtype: U32::new(e, 3),
        filetype: U32::new(e, macho::MH_DYLIB),
        ncmds: U32::new(e, ncmds as u32),
        sizeofcmds: U32::new(e, sizeofcmds as u32),
        flags: U32::new(e, 0),
        reserved: U32::new(e, 0),
    }));
    out.extend_from_slice(&id_cmd);
    out.extend_from_slice(object::bytes_of(&macho::LinkeditDataCommand {
        cmd: U32::new(e, macho::LC_DYLD_EXPORTS_TRIE),
        cmdsize: U32::new(e, trie_cmdsize as u32),
        dataoff: U32::new(e, header_end as u32),
        datasize: U32::new(e, trie.len() as u32),
    }));
    for cmd in &reexport_cmds {
        out.extend_from_slice(cmd);
    }
    debug_assert_eq!(out.len(), header_end);
    out.extend_from_slice(&trie);
    out
}

pub(crate) fn bitcode_bytes() -> Vec<u8> {
    b"BC\xc0\xde-test-module".to_vec()
}

pub(crate) fn input(path: &str) -> Input {
    Input {
        path: path.into(),
        archive_name: None,
        modifiers: Modifiers::default(),
    }
}

pub(crate) fn archive_input(path: &str, archive: &str) -> Input {
    Input {
        path: path.into(),
        archive_name: Some(archive.to_owned()),
        modifiers: Modifiers::default(),
    }
}
