//! Dynamic libraries as resolution inputs. A dylib contributes nothing to
//! layout; it is a bag of exported names (strong and weak) plus the
//! transitive exports of everything it reexports, each resolving at
//! import rank.

use crate::args::Args;
use crate::args::Modifiers;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::files::FileCommon;
use crate::files::FileId;
use crate::input_data::InputFile;
use crate::input_data::find_external_lib;
use crate::macho;
use crate::symbol_db::ParseResources;
use crate::symbol_db::Scope;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolNameTable;
use crate::symbol_db::definition_rank;
use crate::symbol_db::symbol_rank;
use crate::tapi;
use bumpalo_herd::Herd;
use hashbrown::HashSet;
use object::LittleEndian;
use object::macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION;
use object::macho::LC_DYLD_EXPORTS_TRIE;
use object::macho::LC_DYLD_INFO_ONLY;
use object::macho::LC_ID_DYLIB;
use object::macho::LC_REEXPORT_DYLIB;
use std::sync::atomic::AtomicBool;

pub struct DylibFile<'data> {
    pub common: FileCommon<'data>,

    pub(crate) data: &'data [u8],

    pub install_name: &'data str,
    pub reexported_libs: Vec<&'data str>,

    pub(crate) exports: HashSet<&'data str>,
    pub(crate) weak_exports: HashSet<&'data str>,

    /// One canonical symbol per distinct exported name, in sorted order.
    pub(crate) syms: Vec<&'data Symbol<'data>>,

    /// Parallel to `syms`: whether that name is only weakly exported.
    pub(crate) is_weak_symbol: Vec<bool>,
}

/// Decoded exports of one dylib or stub, before reexport merging.
struct DylibExports<'data> {
    install_name: &'data str,
    reexported_libs: Vec<&'data str>,
    exports: HashSet<&'data str>,
    weak_exports: HashSet<&'data str>,
}

/// A dylib discovered through a reexport chain, waiting to be registered
/// as an input file of its own.
pub(crate) struct PendingChild<'data> {
    input: &'data InputFile,
    exports: DylibExports<'data>,
}

impl<'data> DylibFile<'data> {
    pub(crate) fn new(
        input: &'data InputFile,
        file_id: FileId,
        args: &Args,
    ) -> DylibFile<'data> {
        DylibFile {
            common: FileCommon {
                input,
                file_id,
                is_alive: AtomicBool::new(input.modifiers.needed || !args.dead_strip_dylibs),
                is_hidden: false,
                is_weak: input.modifiers.weak,
                is_reexported: input.modifiers.reexport,
            },
            data: input.data(),
            install_name: "",
            reexported_libs: Vec::new(),
            exports: HashSet::new(),
            weak_exports: HashSet::new(),
            syms: Vec::new(),
            is_weak_symbol: Vec::new(),
        }
    }

    /// Parses this dylib and walks its reexport chain. Every reexported
    /// library folds its (transitive) exports into this dylib's set and
    /// is also returned so the caller can register it as an input file of
    /// its own. The walk is a DAG in practice; visited install names stop
    /// cycles.
    pub(crate) fn parse(
        &mut self,
        resources: &ParseResources<'data, '_>,
    ) -> Result<Vec<PendingChild<'data>>> {
        let mut decoded = parse_exports(self.data, resources.strings)?;

        let mut visited: HashSet<&'data str> = HashSet::new();
        visited.insert(decoded.install_name);
        let mut children: Vec<Option<PendingChild<'data>>> = Vec::new();
        merge_reexports(&mut decoded, resources, &mut visited, &mut children)?;

        self.install_name = decoded.install_name;
        self.reexported_libs = decoded.reexported_libs;
        self.exports = decoded.exports;
        self.weak_exports = decoded.weak_exports;
        self.attach_export_symbols(resources.names);

        Ok(children.into_iter().flatten().collect())
    }

    /// Builds the file for a dylib reached through a reexport chain. It
    /// takes a priority of its own and the load modifiers of the library
    /// that pulled it in.
    pub(crate) fn from_reexport(
        child: PendingChild<'data>,
        file_id: FileId,
        modifiers: Modifiers,
        args: &Args,
        names: &SymbolNameTable<'data>,
    ) -> DylibFile<'data> {
        let mut dylib = DylibFile {
            common: FileCommon {
                input: child.input,
                file_id,
                is_alive: AtomicBool::new(modifiers.needed || !args.dead_strip_dylibs),
                is_hidden: false,
                is_weak: modifiers.weak,
                is_reexported: modifiers.reexport,
            },
            data: child.input.data(),
            install_name: child.exports.install_name,
            reexported_libs: child.exports.reexported_libs,
            exports: child.exports.exports,
            weak_exports: child.exports.weak_exports,
            syms: Vec::new(),
            is_weak_symbol: Vec::new(),
        };
        dylib.attach_export_symbols(names);
        dylib
    }

    /// Interns one canonical symbol per distinct exported name, strong
    /// exports first, in sorted order.
    fn attach_export_symbols(&mut self, names: &SymbolNameTable<'data>) {
        let mut strong: Vec<&'data str> = self.exports.iter().copied().collect();
        strong.sort_unstable();
        for name in strong {
            self.syms.push(names.get_symbol(name));
            self.is_weak_symbol.push(false);
        }

        let mut weak: Vec<&'data str> = self
            .weak_exports
            .iter()
            .copied()
            .filter(|name| !self.exports.contains(name))
            .collect();
        weak.sort_unstable();
        for name in weak {
            self.syms.push(names.get_symbol(name));
            self.is_weak_symbol.push(true);
        }
    }

    /// Every export resolves at dylib rank; winners become imports.
    pub(crate) fn resolve_symbols(&self, db: &SymbolDb<'data>) {
        for (i, sym) in self.syms.iter().enumerate() {
            let is_weak = self.common.is_weak || self.is_weak_symbol[i];

            let mut state = sym.lock();
            if definition_rank(&db.files, self.common.file_id, false, is_weak)
                < symbol_rank(&db.files, &state)
            {
                state.file = Some(self.common.file_id);
                state.scope = Scope::Local;
                state.is_imported = true;
                state.is_weak = is_weak;
                state.subsec = None;
                state.value = 0;
                state.is_common = false;
            }
        }
    }
}

fn parse_exports<'data>(data: &'data [u8], strings: &'data Herd) -> Result<DylibExports<'data>> {
    match FileKind::identify_bytes(data)? {
        FileKind::Tapi => {
            let stub = tapi::parse(data)?;
            Ok(DylibExports {
                install_name: stub.install_name,
                reexported_libs: stub.reexported_libs,
                exports: stub.exports.into_iter().collect(),
                weak_exports: stub.weak_exports.into_iter().collect(),
            })
        }
        FileKind::MachDylib => parse_dylib_exports(data, strings),
        kind => bail!("{kind} is not a dylib"),
    }
}

fn parse_dylib_exports<'data>(
    data: &'data [u8],
    strings: &'data Herd,
) -> Result<DylibExports<'data>> {
    let e = LittleEndian;
    let mut decoded = DylibExports {
        install_name: "",
        reexported_libs: Vec::new(),
        exports: HashSet::new(),
        weak_exports: HashSet::new(),
    };

    let mut commands = macho::load_commands(data)?;
    while let Some(command) = commands.next()? {
        match command.cmd() {
            LC_ID_DYLIB => {
                let dylib: &macho::DylibCommand = command.data()?;
                let name = command.string(e, dylib.dylib.name)?;
                decoded.install_name = std::str::from_utf8(name)?;
            }
            LC_DYLD_INFO_ONLY => {
                let info: &macho::DyldInfoCommand = command.data()?;
                let offset = info.export_off.get(e);
                if offset != 0 {
                    let trie =
                        trie_region(data, offset, info.export_size.get(e)).ok_or_else(|| {
                            anyhow::anyhow!("export info extends past end of file")
                        })?;
                    read_trie(trie, strings, &mut decoded)?;
                }
            }
            LC_DYLD_EXPORTS_TRIE => {
                let info: &macho::LinkeditDataCommand = command.data()?;
                let trie = trie_region(data, info.dataoff.get(e), info.datasize.get(e))
                    .ok_or_else(|| anyhow::anyhow!("export trie extends past end of file"))?;
                read_trie(trie, strings, &mut decoded)?;
            }
            LC_REEXPORT_DYLIB => {
                let dylib: &macho::DylibCommand = command.data()?;
                let name = command.string(e, dylib.dylib.name)?;
                decoded.reexported_libs.push(std::str::from_utf8(name)?);
            }
            _ => {}
        }
    }

    Ok(decoded)
}

fn trie_region(data: &[u8], offset: u32, size: u32) -> Option<&[u8]> {
    data.get(offset as usize..(offset as usize).checked_add(size as usize)?)
}

/// Decodes an export trie. Nodes are visited iteratively with an explicit
/// stack; a node budget bounds malformed input whose child offsets loop.
fn read_trie<'data>(
    trie: &[u8],
    strings: &'data Herd,
    decoded: &mut DylibExports<'data>,
) -> Result {
    if trie.is_empty() {
        return Ok(());
    }

    let mut stack: Vec<(usize, String)> = vec![(0, String::new())];
    let mut budget = trie.len() + 1;

    while let Some((offset, prefix)) = stack.pop() {
        budget = budget
            .checked_sub(1)
            .ok_or_else(|| anyhow::anyhow!("malformed export trie: node loop"))?;

        let mut buf = trie
            .get(offset..)
            .ok_or_else(|| anyhow::anyhow!("export trie offset out of bounds"))?;

        let Some(&terminal) = buf.first() else {
            bail!("truncated export trie node");
        };
        if terminal != 0 {
            macho::read_uleb(&mut buf)?; // terminal payload size
            let flags = macho::read_uleb(&mut buf)?;
            macho::read_uleb(&mut buf)?; // address

            let name: &'data str = strings.get().alloc_str(&prefix);
            if flags == u64::from(EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) {
                decoded.weak_exports.insert(name);
            } else {
                decoded.exports.insert(name);
            }
        } else {
            buf = &buf[1..];
        }

        let Some((&nchild, mut rest)) = buf.split_first() else {
            bail!("truncated export trie node");
        };
        for _ in 0..nchild {
            let suffix = macho::c_str_at(rest, 0)?;
            rest = &rest[suffix.len() + 1..];
            let mut cursor = rest;
            let child_offset = macho::read_uleb(&mut cursor)?;
            rest = cursor;
            stack.push((usize::try_from(child_offset)?, format!("{prefix}{suffix}")));
        }
    }

    Ok(())
}

fn merge_reexports<'data>(
    decoded: &mut DylibExports<'data>,
    resources: &ParseResources<'data, '_>,
    visited: &mut HashSet<&'data str>,
    children: &mut Vec<Option<PendingChild<'data>>>,
) -> Result {
    for i in 0..decoded.reexported_libs.len() {
        let path = decoded.reexported_libs[i];

        let file = find_external_lib(resources.input_data, resources.args, path)?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{}: cannot open reexported library {path}",
                    decoded.install_name
                )
            })?;

        let mut child = parse_exports(file.data(), resources.strings)
            .with_context(|| format!("Failed to parse reexported library {path}"))?;

        if !visited.insert(child.install_name) {
            continue;
        }

        // Reserve the slot up front so children register in discovery
        // order, ahead of anything their own reexports pull in.
        let slot = children.len();
        children.push(None);

        merge_reexports(&mut child, resources, visited, children)?;

        decoded.exports.extend(child.exports.iter().copied());
        decoded.weak_exports.extend(child.weak_exports.iter().copied());

        children[slot] = Some(PendingChild {
            input: file,
            exports: child,
        });
    }
    Ok(())
}
