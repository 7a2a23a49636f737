//! The process-wide symbol table: one canonical `Symbol` per external
//! name, interned on first sight and never moved. Files refer to symbols
//! by reference and symbols refer back to their winning file by ID, so the
//! table owns every record for the whole link.
//!
//! Resolution is a minimum over a strict total order. Each candidate
//! definition gets a rank `(tier << 24) | file_priority`; lower wins.
//! Tiers, highest priority first:
//!
//!   1. strong definition in a live object
//!   2. weak definition in a live object
//!   3. strong definition in a dylib or dead archive member
//!   4. weak definition in a dylib or dead archive member
//!   5. common symbol in a live object
//!   6. common symbol in a dead archive member
//!   7. unclaimed
//!
//! File priorities are unique, so no two candidates from different files
//! ever compare equal and the winner is schedule-independent.

use crate::args::Args;
use crate::dylib::DylibFile;
use crate::dylib::PendingChild;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::files::File;
use crate::files::FileId;
use crate::input_data::InputData;
use crate::input_data::InputFile;
use bumpalo_herd::Herd;
use colosseum::sync::Arena;
use hashbrown::HashMap;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::fmt::Display;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// Backing stores with stable addresses: the symbol arena and the bump
/// allocator for names synthesised during parsing (export-trie prefixes,
/// LTO symbol names). Declared by the caller so borrows of both can share
/// the input-data lifetime.
pub struct Arenas<'data> {
    pub(crate) symbols: Arena<Symbol<'data>>,
    pub(crate) strings: Herd,
}

impl Default for Arenas<'_> {
    fn default() -> Self {
        Arenas {
            symbols: Arena::new(),
            strings: Herd::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    PrivateExtern,
    Extern,
}

/// A subsection named from outside its owning file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsecRef {
    pub file: FileId,
    pub index: u32,
}

pub struct Symbol<'data> {
    pub name: &'data str,

    /// All reads-then-writes of the resolution state (scope merge,
    /// rank compare-and-overwrite, liveness checks) hold this for the
    /// whole read-modify-write.
    state: Mutex<SymbolState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolState {
    pub file: Option<FileId>,
    pub scope: Scope,
    pub subsec: Option<SubsecRef>,

    /// Absolute if `subsec` is None, otherwise an offset within it. For a
    /// common symbol this holds the required size instead.
    pub value: u64,

    pub p2align: u8,
    pub is_imported: bool,
    pub is_weak: bool,
    pub is_common: bool,
}

impl SymbolState {
    pub(crate) fn unclaimed() -> SymbolState {
        SymbolState {
            file: None,
            scope: Scope::Local,
            subsec: None,
            value: 0,
            p2align: 0,
            is_imported: false,
            is_weak: false,
            is_common: false,
        }
    }
}

impl<'data> Symbol<'data> {
    fn new(name: &'data str) -> Symbol<'data> {
        Symbol {
            name,
            state: Mutex::new(SymbolState::unclaimed()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SymbolState> {
        self.state.lock().unwrap()
    }

    /// A point-in-time copy of the resolution state.
    pub fn snapshot(&self) -> SymbolState {
        *self.lock()
    }

    pub(crate) fn clear_if_owned_by(&self, file_id: FileId) {
        let mut state = self.lock();
        if state.file == Some(file_id) {
            *state = SymbolState::unclaimed();
        }
    }
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.name, f)
    }
}

/// A file's view of one native symbol-table slot: external slots alias the
/// canonical table entry, non-external slots index the file's own
/// `local_syms` storage. Same index space as the native symbol array.
#[derive(Clone, Copy)]
pub enum SymbolSlot<'data> {
    Global(&'data Symbol<'data>),
    Local(u32),
}

pub(crate) const UNCLAIMED_RANK: u64 = 7 << 24;

fn tier(is_dylib: bool, is_alive: bool, is_common: bool, is_weak: bool) -> u64 {
    if is_common {
        // Commons can't come from dylibs; the object parser never emits one.
        debug_assert!(!is_dylib);
        if is_alive { 5 } else { 6 }
    } else if is_dylib || !is_alive {
        if is_weak { 4 } else { 3 }
    } else if is_weak {
        2
    } else {
        1
    }
}

pub(crate) fn definition_rank(
    files: &[File<'_>],
    file_id: FileId,
    is_common: bool,
    is_weak: bool,
) -> u64 {
    let file = &files[file_id.as_usize()];
    (tier(file.is_dylib(), file.is_alive(), is_common, is_weak) << 24) | file_id.priority()
}

pub(crate) fn symbol_rank(files: &[File<'_>], state: &SymbolState) -> u64 {
    match state.file {
        None => UNCLAIMED_RANK,
        Some(file_id) => definition_rank(files, file_id, state.is_common, state.is_weak),
    }
}

const SHARD_COUNT: usize = 32;

pub(crate) struct SymbolNameTable<'data> {
    arenas: &'data Arenas<'data>,
    shards: Vec<Mutex<HashMap<PrehashedName<'data>, &'data Symbol<'data>, PassThroughState>>>,
}

/// Symbol names are hashed once, then carried with their hash so the
/// sharded maps never rehash the bytes.
#[derive(Clone, Copy)]
struct PrehashedName<'data> {
    hash: u64,
    name: &'data str,
}

impl<'data> PrehashedName<'data> {
    fn new(name: &'data str) -> PrehashedName<'data> {
        PrehashedName {
            hash: foldhash::fast::FixedState::default().hash_one(name.as_bytes()),
            name,
        }
    }
}

impl PartialEq for PrehashedName<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PrehashedName<'_> {}

impl Hash for PrehashedName<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Default, Clone)]
struct PassThroughState;

#[derive(Default)]
struct PassThroughHasher {
    hash: u64,
}

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write_u64(&mut self, value: u64) {
        self.hash = value;
    }

    fn write(&mut self, _bytes: &[u8]) {
        unreachable!("prehashed keys only hash via write_u64");
    }
}

impl BuildHasher for PassThroughState {
    type Hasher = PassThroughHasher;

    fn build_hasher(&self) -> PassThroughHasher {
        PassThroughHasher::default()
    }
}

impl<'data> SymbolNameTable<'data> {
    fn new(arenas: &'data Arenas<'data>) -> SymbolNameTable<'data> {
        SymbolNameTable {
            arenas,
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::with_hasher(PassThroughState)))
                .collect(),
        }
    }

    /// Returns the canonical symbol for `name`, interning it on first use.
    pub(crate) fn get_symbol(&self, name: &'data str) -> &'data Symbol<'data> {
        let key = PrehashedName::new(name);
        let mut shard = self.shards[key.hash as usize % SHARD_COUNT].lock().unwrap();
        *shard
            .entry(key)
            .or_insert_with(|| &*self.arenas.symbols.alloc(Symbol::new(name)))
    }

    fn lookup(&self, name: &'data str) -> Option<&'data Symbol<'data>> {
        let key = PrehashedName::new(name);
        let shard = self.shards[key.hash as usize % SHARD_COUNT].lock().unwrap();
        shard.get(&key).copied()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

/// Everything a file needs while parsing itself.
pub(crate) struct ParseResources<'data, 'scope> {
    pub(crate) args: &'data Args,
    pub(crate) input_data: &'data InputData,
    pub(crate) names: &'scope SymbolNameTable<'data>,
    pub(crate) strings: &'data Herd,
}

pub struct SymbolDb<'data> {
    pub args: &'data Args,

    /// All registered input files, in priority order.
    pub files: Vec<File<'data>>,

    names: SymbolNameTable<'data>,
}

impl<'data> std::fmt::Debug for SymbolDb<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolDb")
            .field("files", &self.files.len())
            .finish()
    }
}

impl<'data> SymbolDb<'data> {
    /// Opens the inputs named by `args` and parses them all.
    pub fn build(
        args: &'data Args,
        input_data: &'data InputData,
        arenas: &'data Arenas<'data>,
    ) -> Result<SymbolDb<'data>> {
        let input_files = args
            .inputs
            .iter()
            .map(|input| {
                input_data.open(&input.path, input.archive_name.clone(), input.modifiers)
            })
            .collect::<Result<Vec<&InputFile>>>()?;
        Self::build_from_files(args, input_files, input_data, arenas)
    }

    /// Parses already-opened inputs. Registration order fixes each file's
    /// priority.
    pub fn build_from_files(
        args: &'data Args,
        input_files: Vec<&'data InputFile>,
        input_data: &'data InputData,
        arenas: &'data Arenas<'data>,
    ) -> Result<SymbolDb<'data>> {
        let _span = tracing::info_span!("Parse input files").entered();

        let names = SymbolNameTable::new(arenas);

        let mut files = input_files
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let file_id = FileId::new(index);
                let kind = FileKind::identify_bytes(input.data())
                    .with_context(|| format!("`{}`", input.filename.display()))?;
                Ok(match kind {
                    FileKind::MachObject | FileKind::LlvmBitcode => {
                        File::Object(Box::new(crate::object_file::ObjectFile::new(
                            input, file_id, args,
                        )))
                    }
                    FileKind::MachDylib | FileKind::Tapi => {
                        File::Dylib(Box::new(DylibFile::new(input, file_id, args)))
                    }
                })
            })
            .collect::<Result<Vec<File>>>()?;

        let resources = ParseResources {
            args,
            input_data,
            names: &names,
            strings: &arenas.strings,
        };

        let pending_children: Vec<Vec<PendingChild>> = files
            .par_iter_mut()
            .map(|file| file.parse(&resources))
            .collect::<Result<_>>()?;

        // Dylibs reached through reexport chains become input files of
        // their own, prioritized after everything on the command line and
        // carrying the load modifiers of the library that pulled them in.
        for (parent_index, children) in pending_children.into_iter().enumerate() {
            let modifiers = files[parent_index].common().input.modifiers;
            for child in children {
                let file_id = FileId::new(files.len());
                files.push(File::Dylib(Box::new(DylibFile::from_reexport(
                    child, file_id, modifiers, args, &names,
                ))));
            }
        }

        tracing::debug!(
            files = files.len(),
            symbols = names.len(),
            "parsed input files"
        );

        Ok(SymbolDb { args, files, names })
    }

    pub fn file(&self, file_id: FileId) -> &File<'data> {
        &self.files[file_id.as_usize()]
    }

    /// Looks up an interned symbol by name. The name must outlive the
    /// link (string literals always do).
    pub fn symbol(&self, name: &'data str) -> Option<&'data Symbol<'data>> {
        self.names.lookup(name)
    }

    /// Convenience for tests and reporting: the resolved state of `name`.
    pub fn symbol_state(&self, name: &'data str) -> Option<SymbolState> {
        self.symbol(name).map(Symbol::snapshot)
    }

    pub fn num_symbols(&self) -> usize {
        self.names.len()
    }
}
