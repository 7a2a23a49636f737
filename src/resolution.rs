//! The global resolution pipeline. Phases run in order with a barrier
//! between each; within a phase, files are processed in parallel and the
//! per-symbol mutexes carry all cross-file coordination:
//!
//! 1. every file offers its definitions (rank order decides winners);
//! 2. live-set propagation revives referenced archive members, feeding
//!    newly-live objects back to idle workers;
//! 3. files that stayed dead release their symbols and live files
//!    re-offer theirs, so dead definitions can't shadow live ones;
//! 4. common symbols get real zero-fill storage;
//! 5. duplicate definitions are reported.
//!
//! Ranks form a strict total order, so the fixed point is independent of
//! scheduling, and liveness only ever goes from dead to alive, so the
//! propagation is confluent.

use crate::bail;
use crate::error::Result;
use crate::files::File;
use crate::object_file::ObjectFile;
use crate::symbol_db::SymbolDb;
use crossbeam_queue::SegQueue;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

pub fn resolve(db: &mut SymbolDb) -> Result {
    resolve_all_symbols(db)?;
    mark_live_objects(db);
    sweep_dead_files(db)?;
    convert_common_symbols(db);
    check_duplicate_symbols(db)
}

fn resolve_all_symbols(db: &SymbolDb) -> Result {
    let _span = tracing::info_span!("Resolve symbols").entered();
    db.files
        .par_iter()
        .try_for_each(|file| file.resolve_symbols(db))
}

fn mark_live_objects(db: &SymbolDb) {
    let _span = tracing::info_span!("Mark live objects").entered();

    let roots: Vec<&ObjectFile> = db
        .files
        .iter()
        .filter_map(File::as_object)
        .filter(|object| object.common.is_alive.load(std::sync::atomic::Ordering::SeqCst))
        .collect();

    rayon::in_place_scope(|scope| {
        roots
            .into_par_iter()
            .for_each(|object| object.mark_live_objects(db, scope));
    });
}

/// Dead files surrender their symbols, then live files resolve again so
/// every name settles on its best live candidate.
fn sweep_dead_files(db: &SymbolDb) -> Result {
    let _span = tracing::info_span!("Sweep dead files").entered();

    db.files.par_iter().for_each(|file| {
        if !file.is_alive() {
            file.clear_symbols();
        }
    });

    db.files.par_iter().try_for_each(|file| {
        if file.is_alive() {
            file.resolve_symbols(db)
        } else {
            Ok(())
        }
    })
}

fn convert_common_symbols(db: &mut SymbolDb) {
    let _span = tracing::info_span!("Convert common symbols").entered();

    db.files.par_iter_mut().for_each(|file| {
        if let File::Object(object) = file {
            object.convert_common_symbols();
        }
    });
}

fn check_duplicate_symbols(db: &SymbolDb) -> Result {
    let _span = tracing::info_span!("Check duplicate symbols").entered();

    let errors = SegQueue::new();
    db.files.par_iter().for_each(|file| {
        if file.is_alive()
            && let Some(object) = file.as_object()
        {
            object.check_duplicate_symbols(db, &errors);
        }
    });

    if errors.is_empty() {
        return Ok(());
    }

    let mut messages: Vec<String> = std::iter::from_fn(|| errors.pop()).collect();
    messages.sort();
    let count = messages.len();
    for message in &messages {
        tracing::error!("{message}");
    }
    bail!("{count} duplicate symbol(s)");
}
