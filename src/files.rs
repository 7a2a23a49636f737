//! Input files as the resolver sees them. `File` is a closed set of
//! variants rather than an open hierarchy: both kinds participate in
//! symbol resolution and diagnostics, and nothing else ever extends it.

use crate::dylib::DylibFile;
use crate::error::Context as _;
use crate::error::Result;
use crate::input_data::InputFile;
use crate::object_file::ObjectFile;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Identifies an input file. The value doubles as the file's resolution
/// priority: files registered earlier win rank ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u32);

impl FileId {
    pub(crate) fn new(index: usize) -> FileId {
        FileId(u32::try_from(index).expect("more than u32::MAX input files"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn priority(self) -> u64 {
        u64::from(self.0)
    }
}

pub enum File<'data> {
    Object(Box<ObjectFile<'data>>),
    Dylib(Box<DylibFile<'data>>),
}

/// State shared by both file variants.
pub struct FileCommon<'data> {
    pub input: &'data InputFile,
    pub file_id: FileId,

    /// Whether this file contributes to the link. Archive members start
    /// dead and are flipped alive at most once by live-set propagation.
    pub is_alive: AtomicBool,

    pub is_hidden: bool,
    pub is_weak: bool,
    pub is_reexported: bool,
}

impl<'data> File<'data> {
    pub(crate) fn common(&self) -> &FileCommon<'data> {
        match self {
            File::Object(o) => &o.common,
            File::Dylib(d) => &d.common,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.common().file_id
    }

    pub fn is_alive(&self) -> bool {
        self.common().is_alive.load(Ordering::SeqCst)
    }

    pub fn is_dylib(&self) -> bool {
        matches!(self, File::Dylib(_))
    }

    pub fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            File::Object(o) => Some(o),
            File::Dylib(_) => None,
        }
    }

    pub fn as_dylib(&self) -> Option<&DylibFile<'data>> {
        match self {
            File::Object(_) => None,
            File::Dylib(d) => Some(d),
        }
    }

    /// Parses the file. Dylibs may hand back reexported children for the
    /// caller to register as input files of their own.
    pub(crate) fn parse(
        &mut self,
        resources: &crate::symbol_db::ParseResources<'data, '_>,
    ) -> Result<Vec<crate::dylib::PendingChild<'data>>> {
        match self {
            File::Object(o) => {
                o.parse(resources)
                    .with_context(|| format!("Failed to parse {}", o.common))?;
                Ok(Vec::new())
            }
            File::Dylib(d) => d
                .parse(resources)
                .with_context(|| format!("Failed to parse {}", d.common)),
        }
    }

    pub(crate) fn resolve_symbols(&self, db: &crate::symbol_db::SymbolDb<'data>) -> Result {
        match self {
            File::Object(o) => o.resolve_symbols(db),
            File::Dylib(d) => {
                d.resolve_symbols(db);
                Ok(())
            }
        }
    }

    /// Releases every symbol this file won, returning each to the
    /// unclaimed state. Called on files that stayed dead so their
    /// definitions don't shadow live ones when resolution re-runs.
    pub(crate) fn clear_symbols(&self) {
        match self {
            File::Object(o) => {
                for slot in &o.syms {
                    if let crate::symbol_db::SymbolSlot::Global(sym) = slot {
                        sym.clear_if_owned_by(o.common.file_id);
                    }
                }
            }
            File::Dylib(d) => {
                for sym in &d.syms {
                    sym.clear_if_owned_by(d.common.file_id);
                }
            }
        }
    }
}

impl Display for FileCommon<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.input.archive_name {
            Some(archive) => write!(
                f,
                "{}({})",
                archive,
                self.input.filename.display()
            ),
            None => write!(f, "{}", self.input.filename.display()),
        }
    }
}

impl Display for File<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.common(), f)
    }
}
