//! Parsing and per-file resolution operations for relocatable Mach-O
//! objects (and LLVM bitcode standing in for one). An object contributes
//! sections carved into subsections, a native symbol table attached to the
//! global symbol database, and compact-unwind records bound back onto the
//! code subsections they describe.

use crate::args::Args;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::files::File;
use crate::files::FileCommon;
use crate::files::FileId;
use crate::input_data::InputFile;
use crate::lto::LtoModule;
use crate::lto::lto_symbol_to_mach_sym;
use crate::macho;
use crate::macho::MachSym;
use crate::macho::MachSymExt as _;
use crate::subsections::InputSection;
use crate::subsections::SplitRegion;
use crate::subsections::Subsection;
use crate::subsections::coalesce_regions;
use crate::subsections::cstring_pieces;
use crate::subsections::infer_cstring_p2align;
use crate::symbol_db::ParseResources;
use crate::symbol_db::Scope;
use crate::symbol_db::SubsecRef;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolSlot;
use crate::symbol_db::definition_rank;
use crate::symbol_db::symbol_rank;
use crate::unwind::UnwindRecord;
use crossbeam_queue::SegQueue;
use object::LittleEndian;
use object::macho::LC_DATA_IN_CODE;
use object::macho::LC_LINKER_OPTION;
use object::macho::LC_SYMTAB;
use object::macho::MH_SUBSECTIONS_VIA_SYMBOLS;
use object::macho::N_ABS;
use object::macho::N_ALT_ENTRY;
use object::macho::N_SECT;
use object::macho::N_UNDF;
use object::macho::N_WEAK_DEF;
use object::macho::N_WEAK_REF;
use object::read::macho::Segment as _;
use std::borrow::Cow;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub struct ObjectFile<'data> {
    pub common: FileCommon<'data>,

    pub(crate) data: &'data [u8],

    /// One slot per section header; None for debug sections and for
    /// `__LD,__compact_unwind` (which is consumed, not linked).
    pub sections: Vec<Option<InputSection<'data>>>,

    /// Sorted by input address once parsing completes.
    pub subsections: Vec<Subsection>,

    /// Storage for non-external symbols; external slots alias the global
    /// symbol table instead.
    pub(crate) local_syms: Vec<LocalSymbol<'data>>,

    /// One entry per native symbol slot, same index space as `mach_syms`.
    pub(crate) syms: Vec<SymbolSlot<'data>>,

    /// The native symbol array: borrowed from the file for Mach-O,
    /// synthesised for bitcode.
    pub(crate) mach_syms: Cow<'data, [MachSym]>,

    /// Parallel to `mach_syms`: the subsection a `N_SECT` symbol landed
    /// in, for sections that were split.
    pub(crate) sym_to_subsec: Vec<Option<u32>>,

    pub(crate) unwind_sec: Option<InputSection<'data>>,
    pub unwind_records: Vec<UnwindRecord<'data>>,

    pub data_in_code: &'data [macho::DataInCodeEntry],

    pub(crate) lto_module: Option<Box<dyn LtoModule>>,

    /// Index of the synthetic `__DATA,__common` section, created lazily
    /// when this file wins a common symbol.
    common_section: Option<u32>,
}

pub struct LocalSymbol<'data> {
    pub name: &'data str,

    /// None when the symbol lives outside any split section, in which
    /// case `value` stays absolute.
    pub subsec: Option<u32>,

    pub value: u64,
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn new(input: &'data InputFile, file_id: FileId, args: &Args) -> ObjectFile<'data> {
        ObjectFile {
            common: FileCommon {
                input,
                file_id,
                is_alive: AtomicBool::new(input.archive_name.is_none() || args.all_load),
                is_hidden: input.modifiers.hidden,
                is_weak: false,
                is_reexported: false,
            },
            data: input.data(),
            sections: Vec::new(),
            subsections: Vec::new(),
            local_syms: Vec::new(),
            syms: Vec::new(),
            mach_syms: Cow::Borrowed(&[]),
            sym_to_subsec: Vec::new(),
            unwind_sec: None,
            unwind_records: Vec::new(),
            data_in_code: &[],
            lto_module: None,
            common_section: None,
        }
    }

    pub(crate) fn parse(&mut self, resources: &ParseResources<'data, '_>) -> Result {
        if FileKind::identify_bytes(self.data)? == FileKind::LlvmBitcode {
            return self.parse_lto_symbols(resources);
        }

        self.parse_sections()?;
        self.parse_symbols(resources)?;

        let header: &macho::MachHeader = macho::struct_at(self.data, 0)?;
        if header.flags.get(LittleEndian) & MH_SUBSECTIONS_VIA_SYMBOLS != 0 {
            self.split_subsections_via_symbols()?;
        } else {
            self.init_subsections();
        }
        self.sort_subsections();
        self.fix_subsec_members();

        if let Some(unwind_sec) = self.unwind_sec.take() {
            crate::unwind::parse_compact_unwind(self, &unwind_sec)?;
            self.unwind_sec = Some(unwind_sec);
        }

        self.parse_data_in_code()?;
        Ok(())
    }

    fn parse_sections(&mut self) -> Result {
        let mut commands = macho::load_commands(self.data)?;
        while let Some(command) = commands.next()? {
            let Some((segment, section_data)) = command.segment_64()? else {
                continue;
            };

            for header in segment.sections(LittleEndian, section_data)? {
                self.sections.push(None);

                let isec = InputSection::parse(header, self.data)?;
                if isec.matches("__LD", "__compact_unwind") {
                    self.unwind_sec = Some(isec);
                    continue;
                }
                if isec.is_debug() {
                    continue;
                }

                *self.sections.last_mut().unwrap() = Some(isec);
            }
        }
        Ok(())
    }

    fn parse_symbols(&mut self, resources: &ParseResources<'data, '_>) -> Result {
        let Some(command) = macho::find_load_command(self.data, LC_SYMTAB)? else {
            return Ok(());
        };
        let symtab: &macho::SymtabCommand = command.data()?;
        let e = LittleEndian;

        let nsyms = symtab.nsyms.get(e) as usize;
        let mach_syms: &'data [MachSym] =
            macho::slice_at(self.data, u64::from(symtab.symoff.get(e)), nsyms)?;

        let stroff = symtab.stroff.get(e) as usize;
        let strsize = symtab.strsize.get(e) as usize;
        let strtab = stroff
            .checked_add(strsize)
            .and_then(|end| self.data.get(stroff..end))
            .ok_or_else(|| anyhow::anyhow!("symbol string table extends past end of file"))?;

        self.syms.reserve(nsyms);
        self.local_syms
            .reserve(mach_syms.iter().filter(|m| !m.is_extern()).count());

        for msym in mach_syms {
            let name = macho::c_str_at(strtab, u64::from(msym.n_strx.get(e)))?;

            if msym.is_extern() {
                self.syms
                    .push(SymbolSlot::Global(resources.names.get_symbol(name)));
                continue;
            }

            let value = match msym.sym_type() {
                N_UNDF => bail!("{name}: local undefined symbol?"),
                N_ABS => msym.value(),
                // Filled by fix_subsec_members once subsections exist.
                N_SECT => 0,
                t => bail!("unknown symbol type for {name}: {t}"),
            };

            self.syms
                .push(SymbolSlot::Local(self.local_syms.len() as u32));
            self.local_syms.push(LocalSymbol {
                name,
                subsec: None,
                value,
            });
        }

        self.mach_syms = Cow::Borrowed(mach_syms);
        Ok(())
    }

    fn split_subsections_via_symbols(&mut self) -> Result {
        self.sym_to_subsec = vec![None; self.mach_syms.len()];

        // Collect the symbol-defined region starts of every regular
        // section. `__TEXT,__cstring` splits on string boundaries instead.
        let mut split_sections: Vec<(u32, Vec<SplitRegion>)> = Vec::new();
        let mut section_to_split: Vec<Option<usize>> = vec![None; self.sections.len()];
        for (index, section) in self.sections.iter().enumerate() {
            if let Some(isec) = section
                && !isec.matches("__TEXT", "__cstring")
            {
                section_to_split[index] = Some(split_sections.len());
                split_sections.push((index as u32, Vec::new()));
            }
        }

        for (i, msym) in self.mach_syms.iter().enumerate() {
            if msym.sym_type() != N_SECT {
                continue;
            }
            let Some(section_index) = usize::from(msym.n_sect).checked_sub(1) else {
                continue;
            };
            let Some(&Some(split_index)) = section_to_split.get(section_index) else {
                continue;
            };
            let isec = self.sections[section_index].as_ref().unwrap();
            let Some(offset) = msym.value().checked_sub(isec.addr) else {
                bail!(
                    "symbol at {:#x} lies below its section {},{}",
                    msym.value(),
                    isec.segment_name,
                    isec.section_name
                );
            };
            split_sections[split_index].1.push(SplitRegion::at_symbol(
                offset,
                i as u32,
                msym.desc() & N_ALT_ENTRY != 0,
            ));
        }

        split_sections
            .sort_by_key(|&(index, _)| self.sections[index as usize].as_ref().unwrap().addr);

        for (section_index, mut regions) in split_sections {
            let isec = self.sections[section_index as usize].as_ref().unwrap();
            coalesce_regions(&mut regions, isec.size);

            let mut current: Option<u32> = None;
            for region in &regions {
                if !region.is_alt_entry {
                    self.subsections.push(Subsection::new(
                        section_index,
                        isec,
                        region.offset,
                        region.size,
                        isec.p2align,
                    ));
                    current = Some((self.subsections.len() - 1) as u32);
                }
                if let Some(symbol_index) = region.symbol_index {
                    self.sym_to_subsec[symbol_index as usize] = current;
                }
            }
        }

        for (index, section) in self.sections.iter().enumerate() {
            let Some(isec) = section else { continue };
            if !isec.matches("__TEXT", "__cstring") {
                continue;
            }
            for (offset, size) in cstring_pieces(isec.contents)
                .with_context(|| format!("in {}", self.common))?
            {
                let p2align = infer_cstring_p2align(isec.p2align, offset);
                self.subsections
                    .push(Subsection::new(index as u32, isec, offset, size, p2align));
            }
        }

        Ok(())
    }

    /// The whole-section strategy: objects built without
    /// `MH_SUBSECTIONS_VIA_SYMBOLS` must move each section as one unit.
    fn init_subsections(&mut self) {
        let mut section_to_subsec: Vec<Option<u32>> = vec![None; self.sections.len()];

        for (index, section) in self.sections.iter().enumerate() {
            if let Some(isec) = section {
                section_to_subsec[index] = Some(self.subsections.len() as u32);
                self.subsections.push(Subsection::new(
                    index as u32,
                    isec,
                    0,
                    isec.size,
                    isec.p2align,
                ));
            }
        }

        self.sym_to_subsec = self
            .mach_syms
            .iter()
            .map(|msym| {
                if msym.sym_type() == N_SECT {
                    usize::from(msym.n_sect)
                        .checked_sub(1)
                        .and_then(|i| section_to_subsec.get(i).copied().flatten())
                } else {
                    None
                }
            })
            .collect();
    }

    fn sort_subsections(&mut self) {
        let mut order: Vec<u32> = (0..self.subsections.len() as u32).collect();
        order.sort_by_key(|&i| self.subsections[i as usize].input_addr);

        let mut new_index = vec![0u32; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old as usize] = new as u32;
        }

        self.subsections = order
            .iter()
            .map(|&old| self.subsections[old as usize])
            .collect();
        for slot in &mut self.sym_to_subsec {
            if let Some(index) = slot {
                *index = new_index[*index as usize];
            }
        }
    }

    /// Rebinds each local `N_SECT` symbol to the subsection containing it.
    /// A symbol outside every subsection (e.g. one labelling
    /// `__compact_unwind` data) keeps its absolute value.
    fn fix_subsec_members(&mut self) {
        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            if msym.is_extern() || msym.sym_type() != N_SECT {
                continue;
            }
            let SymbolSlot::Local(local_index) = self.syms[i] else {
                continue;
            };

            let subsec = self.sym_to_subsec[i].or_else(|| self.find_subsection(msym.value()));
            let local = &mut self.local_syms[local_index as usize];
            match subsec {
                Some(index) => {
                    local.subsec = Some(index);
                    local.value = msym.value() - self.subsections[index as usize].input_addr;
                }
                None => {
                    local.subsec = None;
                    local.value = msym.value();
                }
            }
        }
    }

    /// The subsection with the greatest input address at or below `addr`.
    pub(crate) fn find_subsection(&self, addr: u64) -> Option<u32> {
        let index = self.subsections.partition_point(|s| s.input_addr <= addr);
        index.checked_sub(1).map(|i| i as u32)
    }

    /// Linear scan for an external symbol whose address equals `addr`;
    /// used to resolve non-extern personality relocations.
    pub(crate) fn find_symbol(&self, addr: u64) -> Option<&'data Symbol<'data>> {
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if msym.is_extern()
                && msym.value() == addr
                && let SymbolSlot::Global(sym) = self.syms[i]
            {
                return Some(sym);
            }
        }
        None
    }

    fn parse_data_in_code(&mut self) -> Result {
        let Some(command) = macho::find_load_command(self.data, LC_DATA_IN_CODE)? else {
            return Ok(());
        };
        let header: &macho::LinkeditDataCommand = command.data()?;
        let e = LittleEndian;
        let count = header.datasize.get(e) as usize / size_of::<macho::DataInCodeEntry>();
        self.data_in_code = macho::slice_at(self.data, u64::from(header.dataoff.get(e)), count)?;
        Ok(())
    }

    /// `-l`/`-framework` requests embedded by the compiler. Empty for
    /// bitcode inputs, whose options travel inside the module.
    pub fn linker_options(&self) -> Result<Vec<&'data str>> {
        if self.lto_module.is_some() {
            return Ok(Vec::new());
        }
        let Some(raw) = macho::find_command_bytes(self.data, LC_LINKER_OPTION)? else {
            return Ok(Vec::new());
        };
        let header: &macho::LinkerOptionCommand = macho::struct_at(raw, 0)?;
        let count = header.count.get(LittleEndian);

        let mut cursor = raw
            .get(size_of::<macho::LinkerOptionCommand>()..)
            .unwrap_or(&[]);
        let mut options = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let option = macho::c_str_at(cursor, 0)?;
            cursor = &cursor[option.len() + 1..];
            options.push(option);
        }
        Ok(options)
    }

    /// Whether this object carries Objective-C or Swift metadata that
    /// `-ObjC`-style load policies must keep.
    pub fn is_objc_object(&self) -> bool {
        for isec in self.sections.iter().flatten() {
            if isec.matches("__DATA", "__objc_catlist") || isec.matches("__TEXT", "__swift") {
                return true;
            }
        }
        for (i, msym) in self.mach_syms.iter().enumerate() {
            if !msym.is_undefined()
                && msym.is_extern()
                && let SymbolSlot::Global(sym) = self.syms[i]
                && sym.name.starts_with("_OBJC_CLASS_$_")
            {
                return true;
            }
        }
        false
    }

    fn parse_lto_symbols(&mut self, resources: &ParseResources<'data, '_>) -> Result {
        let Some(plugin) = resources.args.lto_plugin.as_ref() else {
            bail!("{}: bitcode input, but no LTO plugin is loaded", self.common);
        };
        let module = plugin
            .create_module(self.data)
            .with_context(|| format!("{}: failed to create LTO module", self.common))?;

        let num_symbols = module.num_symbols();
        let bump = resources.strings.get();
        let mut mach_syms = Vec::with_capacity(num_symbols);
        self.syms.reserve(num_symbols);

        for i in 0..num_symbols {
            let name: &'data str = bump.alloc_str(module.symbol_name(i));
            self.syms
                .push(SymbolSlot::Global(resources.names.get_symbol(name)));
            mach_syms.push(
                lto_symbol_to_mach_sym(module.symbol_attributes(i))
                    .with_context(|| format!("{}: symbol {name}", self.common))?,
            );
        }

        self.mach_syms = Cow::Owned(mach_syms);
        self.lto_module = Some(module);
        Ok(())
    }

    fn merged_scope(&self, current: Scope, msym: &MachSym) -> Scope {
        // Once any file sees the name as plain extern it stays exported;
        // private-extern is only the result when every view agrees.
        if current == Scope::Extern {
            return Scope::Extern;
        }
        let private = self.common.is_hidden
            || msym.is_private_extern()
            || (msym.desc() & (N_WEAK_REF | N_WEAK_DEF)) == (N_WEAK_REF | N_WEAK_DEF);
        if private {
            Scope::PrivateExtern
        } else {
            Scope::Extern
        }
    }

    /// Offers every defined external symbol of this file to the global
    /// table, keeping whichever definition ranks best. Runs concurrently
    /// with other files; the per-symbol mutex covers each read-modify-write.
    pub(crate) fn resolve_symbols(&self, db: &SymbolDb<'data>) -> Result {
        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            if !msym.is_extern() || msym.is_undefined() {
                continue;
            }
            let SymbolSlot::Global(sym) = self.syms[i] else {
                continue;
            };
            let is_weak = msym.desc() & N_WEAK_DEF != 0;

            let mut state = sym.lock();

            // Scope merges whether or not this file wins the definition.
            state.scope = self.merged_scope(state.scope, &msym);

            if definition_rank(&db.files, self.common.file_id, msym.is_common(), is_weak)
                >= symbol_rank(&db.files, &state)
            {
                continue;
            }

            state.file = Some(self.common.file_id);
            state.is_imported = false;
            state.is_weak = is_weak;

            match msym.sym_type() {
                N_UNDF => {
                    debug_assert!(msym.is_common());
                    state.subsec = None;
                    state.value = msym.value();
                    state.is_common = true;
                }
                N_ABS => {
                    state.subsec = None;
                    state.value = msym.value();
                    state.is_common = false;
                }
                N_SECT => {
                    let Some(index) =
                        self.sym_to_subsec[i].or_else(|| self.find_subsection(msym.value()))
                    else {
                        bail!("{}: {sym}: definition outside any subsection", self.common);
                    };
                    state.subsec = Some(SubsecRef {
                        file: self.common.file_id,
                        index,
                    });
                    state.value = msym.value() - self.subsections[index as usize].input_addr;
                    state.is_common = false;
                }
                t => bail!("{sym}: unknown symbol type: {t}"),
            }
        }
        Ok(())
    }

    /// Walks this live object's references and revives the files that
    /// define them. Newly-revived objects are handed to the scope so any
    /// idle worker can continue the propagation.
    pub(crate) fn mark_live_objects<'scope>(
        &self,
        db: &'scope SymbolDb<'data>,
        scope: &rayon::Scope<'scope>,
    ) where
        'data: 'scope,
    {
        debug_assert!(self.common.is_alive.load(Ordering::SeqCst));

        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            if !msym.is_extern() {
                continue;
            }
            let SymbolSlot::Global(sym) = self.syms[i] else {
                continue;
            };

            let state = sym.lock();
            let Some(owner) = state.file else {
                continue;
            };

            // An undefined reference needs its definition; a common here
            // needs a real definition if the winner is one.
            let keep = msym.is_undefined() || (msym.is_common() && !state.is_common);
            if !keep {
                continue;
            }

            let target = &db.files[owner.as_usize()];
            if !target.common().is_alive.swap(true, Ordering::SeqCst)
                && let File::Object(object) = target
            {
                let object: &'scope ObjectFile<'data> = object;
                scope.spawn(move |scope| object.mark_live_objects(db, scope));
            }
        }
    }

    /// Gives each common symbol this file won real storage: a zero-fill
    /// subsection in the synthetic `__DATA,__common` section, sized and
    /// aligned per the native symbol.
    pub(crate) fn convert_common_symbols(&mut self) {
        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            let SymbolSlot::Global(sym) = self.syms[i] else {
                continue;
            };

            let mut state = sym.lock();
            if state.file != Some(self.common.file_id) || !state.is_common {
                continue;
            }

            let section = self.common_section_index();
            self.subsections.push(Subsection {
                section,
                input_offset: 0,
                input_size: msym.value(),
                input_addr: 0,
                p2align: msym.common_p2align(),
                unwind_offset: 0,
                nunwind: 0,
            });

            state.is_imported = false;
            state.is_weak = false;
            state.subsec = Some(SubsecRef {
                file: self.common.file_id,
                index: (self.subsections.len() - 1) as u32,
            });
            state.value = 0;
            state.is_common = false;
        }
    }

    fn common_section_index(&mut self) -> u32 {
        if let Some(index) = self.common_section {
            return index;
        }
        let index = self.sections.len() as u32;
        self.sections.push(Some(InputSection::synthetic_common()));
        self.common_section = Some(index);
        index
    }

    /// Post-resolution consistency check: two strong, non-common
    /// definitions of one name in different files is an error. Diagnostics
    /// accumulate; resolution itself is left untouched.
    pub(crate) fn check_duplicate_symbols(&self, db: &SymbolDb<'data>, errors: &SegQueue<String>) {
        for i in 0..self.mach_syms.len() {
            let msym = self.mach_syms[i];
            if msym.is_undefined() || msym.is_common() || msym.desc() & N_WEAK_DEF != 0 {
                continue;
            }
            let SymbolSlot::Global(sym) = self.syms[i] else {
                continue;
            };
            if let Some(owner) = sym.snapshot().file
                && owner != self.common.file_id
            {
                errors.push(format!(
                    "duplicate symbol: {}: {}: {sym}",
                    self.common,
                    db.files[owner.as_usize()].common()
                ));
            }
        }
    }
}
