//! The ingestion and symbol-resolution core of a Mach-O linker: it maps
//! input files (objects, dylibs, TAPI stubs, LLVM bitcode), carves their
//! sections into subsections, resolves every external name through a
//! priority lattice, and computes which archive members join the link.
//! Layout and output writing happen downstream of the graph this crate
//! produces.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) use anyhow::bail;

pub mod args;
pub mod dylib;
pub mod error;
pub(crate) mod file_kind;
pub mod files;
pub mod input_data;
pub mod lto;
pub(crate) mod macho;
pub mod object_file;
pub mod resolution;
pub mod subsections;
pub mod symbol_db;
pub(crate) mod tapi;
#[cfg(test)]
pub(crate) mod test_macho;
pub mod unwind;

pub use args::Args;
pub use error::Result;
pub use files::File;
pub use files::FileId;
pub use input_data::InputData;
pub use symbol_db::Arenas;
pub use symbol_db::Scope;
pub use symbol_db::SymbolDb;
pub use symbol_db::SymbolState;

/// Parses every input and runs resolution to its fixed point. The
/// returned database borrows `input_data` and `arenas`, which the caller
/// keeps alive for as long as the graph is inspected.
pub fn link<'data>(
    args: &'data Args,
    input_data: &'data InputData,
    arenas: &'data Arenas<'data>,
) -> Result<SymbolDb<'data>> {
    let mut db = SymbolDb::build(args, input_data, arenas)?;
    resolution::resolve(&mut db)?;
    Ok(db)
}

/// Entry point for the binary: link the inputs named by `args` and drop
/// the graph. Useful on its own for exercising ingestion and diagnosing
/// resolution problems.
pub fn run(args: &Args) -> Result {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();

    let input_data = InputData::new();
    let arenas = Arenas::default();
    let db = link(args, &input_data, &arenas)?;

    tracing::info!(
        files = db.files.len(),
        symbols = db.num_symbols(),
        live_files = db.files.iter().filter(|f| f.is_alive()).count(),
        "resolution complete"
    );
    Ok(())
}
