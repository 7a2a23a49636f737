//! Code for identifying what sort of file we're dealing with based on the bytes of the file.

use crate::bail;
use crate::error::Result;
use crate::macho;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileKind {
    MachObject,
    MachDylib,
    Tapi,
    LlvmBitcode,
}

const LLVM_BITCODE_MAGIC: &[u8] = b"BC\xc0\xde";
const TAPI_MAGIC: &[u8] = b"--- !tapi-tbd";

impl FileKind {
    pub fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(LLVM_BITCODE_MAGIC) {
            return Ok(FileKind::LlvmBitcode);
        }
        if bytes.starts_with(TAPI_MAGIC) {
            return Ok(FileKind::Tapi);
        }

        let header: &macho::MachHeader = macho::struct_at(bytes, 0)
            .map_err(|_| anyhow::anyhow!("File too short to classify"))?;
        let e = LittleEndian;

        // Only little-endian 64-bit Mach-O is supported. The magic field is
        // stored in the file's own byte order, so a valid LE file reads back
        // MH_MAGIC_64 when interpreted as LE.
        if header.magic.get(object::BigEndian) != object::macho::MH_CIGAM_64 {
            bail!("Not a 64-bit little-endian Mach-O file");
        }

        match header.filetype.get(e) {
            object::macho::MH_OBJECT => Ok(FileKind::MachObject),
            object::macho::MH_DYLIB => Ok(FileKind::MachDylib),
            t => bail!("Unsupported Mach-O file type {t}"),
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::MachObject => "Mach-O object",
            FileKind::MachDylib => "Mach-O dylib",
            FileKind::Tapi => "TAPI stub",
            FileKind::LlvmBitcode => "LLVM bitcode",
        };
        std::fmt::Display::fmt(s, f)
    }
}
