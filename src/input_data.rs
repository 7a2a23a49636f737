//! Code for getting input bytes into memory. Files opened here are given
//! out as `&InputFile` with the lifetime of this struct, so worker threads
//! can open additional files (reexported dylibs) mid-parse without
//! invalidating anything already handed out.

use crate::args::Args;
use crate::args::Modifiers;
use crate::error::Context as _;
use crate::error::Result;
use colosseum::sync::Arena;
use hashbrown::HashMap;
use memmap2::Mmap;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct InputData {
    files: Arena<InputFile>,

    /// In-memory inputs registered by path: archive members extracted
    /// upstream and embedder/test-supplied buffers. Consulted before the
    /// filesystem.
    staged: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

pub struct InputFile {
    pub filename: PathBuf,

    /// Name of the archive this file was extracted from, if any.
    pub archive_name: Option<String>,

    pub modifiers: Modifiers,

    data: FileBytes,
}

enum FileBytes {
    Mapped(Mmap),
    Owned(AlignedBytes),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(mmap) => mmap,
            FileBytes::Owned(bytes) => bytes,
        }
    }
}

/// Owned file contents with the same alignment guarantee an mmap gives:
/// the raw-struct views the decoder takes require the buffer base to be
/// at least 8-byte aligned, which a plain `Vec<u8>` does not promise.
struct AlignedBytes {
    storage: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    fn new(bytes: &[u8]) -> AlignedBytes {
        let mut storage = vec![0u64; bytes.len().div_ceil(8)];
        for (word, chunk) in storage.iter_mut().zip(bytes.chunks(8)) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(buf);
        }
        AlignedBytes {
            storage,
            len: bytes.len(),
        }
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &object::bytes_of_slice(&self.storage)[..self.len]
    }
}

impl InputFile {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for InputData {
    fn default() -> Self {
        Self::new()
    }
}

impl InputData {
    pub fn new() -> InputData {
        InputData {
            files: Arena::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an in-memory file under `path`. Later opens of that path
    /// use these bytes instead of the filesystem.
    pub fn stage(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.staged.lock().unwrap().insert(path.into(), bytes);
    }

    pub fn open(
        &self,
        path: &Path,
        archive_name: Option<String>,
        modifiers: Modifiers,
    ) -> Result<&InputFile> {
        match self.open_if_exists(path, archive_name, modifiers)? {
            Some(file) => Ok(file),
            None => crate::bail!("Failed to open input file `{}`: not found", path.display()),
        }
    }

    pub fn open_if_exists(
        &self,
        path: &Path,
        archive_name: Option<String>,
        modifiers: Modifiers,
    ) -> Result<Option<&InputFile>> {
        if let Some(bytes) = self.staged.lock().unwrap().get(path) {
            return Ok(Some(self.files.alloc(InputFile {
                filename: path.to_owned(),
                archive_name,
                modifiers,
                data: FileBytes::Owned(AlignedBytes::new(bytes)),
            })));
        }

        if !path.exists() {
            return Ok(None);
        }

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        // Safety: this is only sound as long as nothing truncates or rewrites
        // the file while we have it mapped. That's the same compromise every
        // mmap-based linker makes; reading whole inputs up front would cost
        // more than it buys.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        Ok(Some(self.files.alloc(InputFile {
            filename: path.to_owned(),
            archive_name,
            modifiers,
            data: FileBytes::Mapped(mmap),
        })))
    }
}

/// Locates a library by install-name-style path: relative paths open
/// as-is; absolute paths probe each configured syslibroot, preferring a
/// `.tbd` stub over the binary dylib it describes.
pub fn find_external_lib<'data>(
    input_data: &'data InputData,
    args: &Args,
    path: &str,
) -> Result<Option<&'data InputFile>> {
    let modifiers = Modifiers::default();

    if !path.starts_with('/') {
        return input_data.open_if_exists(Path::new(path), None, modifiers);
    }

    for root in &args.syslibroot {
        let rooted = |suffix: &str| {
            let mut joined = root.as_os_str().to_owned();
            joined.push(path);
            joined.push(suffix);
            PathBuf::from(joined)
        };

        let candidates: Vec<PathBuf> = if path.ends_with(".tbd") {
            vec![rooted("")]
        } else if let Some(stem) = path.strip_suffix(".dylib") {
            let mut with_tbd = root.as_os_str().to_owned();
            with_tbd.push(stem);
            with_tbd.push(".tbd");
            vec![PathBuf::from(with_tbd), rooted("")]
        } else {
            vec![rooted(".tbd"), rooted(".dylib")]
        };

        for candidate in &candidates {
            if let Some(file) = input_data.open_if_exists(candidate, None, modifiers)? {
                return Ok(Some(file));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_files_shadow_the_filesystem() {
        let input_data = InputData::new();
        input_data.stage("/virtual/a.o", vec![1, 2, 3]);

        let file = input_data
            .open(Path::new("/virtual/a.o"), Some("libx.a".to_owned()), Modifiers::default())
            .unwrap();
        assert_eq!(file.data(), [1, 2, 3]);
        assert_eq!(file.archive_name.as_deref(), Some("libx.a"));

        assert!(
            input_data
                .open_if_exists(Path::new("/virtual/missing.o"), None, Modifiers::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn finder_prefers_tbd_stubs_under_syslibroot() {
        let input_data = InputData::new();
        input_data.stage("/sdk/usr/lib/libc.tbd", b"--- !tapi-tbd".to_vec());

        let mut args = crate::args::Args::empty();
        args.syslibroot.push(PathBuf::from("/sdk"));

        // A `.dylib` request is satisfied by the stub with the same stem.
        let found = find_external_lib(&input_data, &args, "/usr/lib/libc.dylib")
            .unwrap()
            .unwrap();
        assert_eq!(found.filename, PathBuf::from("/sdk/usr/lib/libc.tbd"));

        // An extensionless request probes `.tbd` first too.
        let found = find_external_lib(&input_data, &args, "/usr/lib/libc")
            .unwrap()
            .unwrap();
        assert_eq!(found.filename, PathBuf::from("/sdk/usr/lib/libc.tbd"));

        // Absolute paths without a matching root are not found.
        assert!(
            find_external_lib(&input_data, &args, "/usr/lib/libother.dylib")
                .unwrap()
                .is_none()
        );
    }
}
