//! Raw views over the Mach-O on-disk format. Everything here is a constant-
//! sized reinterpretation of the mapped input bytes; nothing is copied. The
//! struct layouts come from the `object` crate, which mirrors Apple's
//! `mach-o/loader.h` / `mach-o/nlist.h`.

use crate::bail;
use crate::error::Result;
use object::LittleEndian;
use object::U32;
use object::U32Bytes;
use object::U64Bytes;
use object::macho;

pub(crate) type LE = LittleEndian;

pub(crate) type MachHeader = macho::MachHeader64<LE>;
pub(crate) type MachSection = macho::Section64<LE>;
pub(crate) type SymtabCommand = macho::SymtabCommand<LE>;
pub(crate) type MachSym = macho::Nlist64<LE>;
pub(crate) type MachRel = macho::Relocation<LE>;
pub(crate) type LinkeditDataCommand = macho::LinkeditDataCommand<LE>;
pub(crate) type LinkerOptionCommand = macho::LinkerOptionCommand<LE>;
pub(crate) type DylibCommand = macho::DylibCommand<LE>;
pub(crate) type DyldInfoCommand = macho::DyldInfoCommand<LE>;
pub(crate) type DataInCodeEntry = macho::DataInCodeEntry<LE>;
pub(crate) type LoadCommandData<'data> = object::read::macho::LoadCommandData<'data, LE>;

/// One `__compact_unwind` entry. The `object` crate doesn't define this
/// layout, so we do; it's bit-exact per Apple's compact-unwind format.
/// Byte-order wrappers keep the view valid at any buffer alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct CompactUnwindEntry {
    pub(crate) code_start: U64Bytes<LE>,
    pub(crate) code_len: U32Bytes<LE>,
    pub(crate) encoding: U32Bytes<LE>,
    pub(crate) personality: U64Bytes<LE>,
    pub(crate) lsda: U64Bytes<LE>,
}

// Safety: repr(C), no padding (8+4+4+8+8), all fields are themselves Pod.
unsafe impl object::Pod for CompactUnwindEntry {}

/// Reinterprets `count` `T`s starting at `offset`. Out-of-bounds is fatal,
/// per the decoding contract: we never guess at missing bytes.
pub(crate) fn slice_at<T: object::Pod>(data: &[u8], offset: u64, count: usize) -> Result<&[T]> {
    let offset = usize::try_from(offset)?;
    let bytes = data
        .get(offset..)
        .ok_or_else(|| anyhow::anyhow!("offset {offset:#x} is outside the file"))?;
    match object::slice_from_bytes::<T>(bytes, count) {
        Ok((slice, _)) => Ok(slice),
        Err(()) => bail!("{count} records at {offset:#x} extend past the end of the file"),
    }
}

pub(crate) fn struct_at<T: object::Pod>(data: &[u8], offset: u64) -> Result<&T> {
    Ok(&slice_at::<T>(data, offset, 1)?[0])
}

/// Iterates the load commands of `data`, which must start with a Mach
/// header. Decoding stops with an error on a truncated or misaligned
/// command rather than tolerating it.
pub(crate) fn load_commands(data: &[u8]) -> Result<LoadCommandIter<'_>> {
    use object::read::macho::MachHeader as _;
    let header = MachHeader::parse(data, 0)?;
    let inner = header.load_commands(LittleEndian, data, 0)?;
    Ok(LoadCommandIter { inner })
}

pub(crate) struct LoadCommandIter<'data> {
    inner: object::read::macho::LoadCommandIterator<'data, LE>,
}

impl<'data> LoadCommandIter<'data> {
    pub(crate) fn next(&mut self) -> Result<Option<LoadCommandData<'data>>> {
        Ok(self.inner.next()?)
    }
}

/// Returns the first load command of the given kind, or None.
pub(crate) fn find_load_command(data: &[u8], kind: u32) -> Result<Option<LoadCommandData<'_>>> {
    let mut commands = load_commands(data)?;
    while let Some(command) = commands.next()? {
        if command.cmd() == kind {
            return Ok(Some(command));
        }
    }
    Ok(None)
}

/// Like `find_load_command`, but yields the command's full byte range,
/// for commands whose payload trails the fixed header.
pub(crate) fn find_command_bytes(data: &[u8], kind: u32) -> Result<Option<&[u8]>> {
    let header: &MachHeader = struct_at(data, 0)?;
    let e = LittleEndian;
    let mut offset = size_of::<MachHeader>();

    for _ in 0..header.ncmds.get(e) {
        let words: &[U32<LE>] = slice_at(data, offset as u64, 2)?;
        let cmd = words[0].get(e);
        let cmdsize = words[1].get(e) as usize;
        if cmdsize < 8 {
            bail!("invalid load command size {cmdsize}");
        }
        let bytes = data
            .get(offset..offset + cmdsize)
            .ok_or_else(|| anyhow::anyhow!("load command extends past end of file"))?;
        if cmd == kind {
            return Ok(Some(bytes));
        }
        offset += cmdsize;
    }
    Ok(None)
}

/// Decodes a fixed-width, NUL-padded name field (segment and section names).
pub(crate) fn fixed_name(bytes: &[u8; 16]) -> &str {
    let len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..len]).unwrap_or("")
}

/// Reads the NUL-terminated string starting at `offset`.
pub(crate) fn c_str_at(data: &[u8], offset: u64) -> Result<&str> {
    let offset = usize::try_from(offset)?;
    let bytes = data
        .get(offset..)
        .ok_or_else(|| anyhow::anyhow!("string offset {offset:#x} is outside the file"))?;
    let len = memchr::memchr(0, bytes)
        .ok_or_else(|| anyhow::anyhow!("unterminated string at {offset:#x}"))?;
    Ok(std::str::from_utf8(&bytes[..len])?)
}

/// Reads a ULEB128-encoded integer, advancing `buf` past it.
pub(crate) fn read_uleb(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            bail!("truncated ULEB128 value");
        };
        *buf = rest;
        if shift >= 64 || (shift == 63 && byte & 0x7f > 1) {
            bail!("ULEB128 value overflows 64 bits");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub(crate) trait MachSymExt {
    fn is_extern(&self) -> bool;
    fn is_private_extern(&self) -> bool;
    fn sym_type(&self) -> u8;
    fn desc(&self) -> u16;
    fn value(&self) -> u64;
    /// A tentative definition: storage is allocated by the linker.
    fn is_common(&self) -> bool;
    fn is_undefined(&self) -> bool;
    /// Alignment of a common symbol, encoded in the descriptor.
    fn common_p2align(&self) -> u8;
}

impl MachSymExt for MachSym {
    fn is_extern(&self) -> bool {
        self.n_type & macho::N_EXT != 0
    }

    fn is_private_extern(&self) -> bool {
        self.n_type & macho::N_PEXT != 0
    }

    fn sym_type(&self) -> u8 {
        self.n_type & macho::N_TYPE
    }

    fn desc(&self) -> u16 {
        self.n_desc.get(LittleEndian)
    }

    fn value(&self) -> u64 {
        self.n_value.get(LittleEndian)
    }

    fn is_common(&self) -> bool {
        self.is_extern() && self.sym_type() == macho::N_UNDF && self.value() != 0
    }

    fn is_undefined(&self) -> bool {
        self.sym_type() == macho::N_UNDF && self.value() == 0
    }

    fn common_p2align(&self) -> u8 {
        ((self.desc() >> 8) & 0x0f) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::U16;
    use object::U64Bytes;

    #[test]
    fn uleb_decoding() {
        let encode = |mut v: u64| {
            let mut out = Vec::new();
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    out.push(byte);
                    return out;
                }
                out.push(byte | 0x80);
            }
        };

        for value in [0, 1, 127, 128, 0x3fff, 0x4000, u64::MAX] {
            let bytes = encode(value);
            let mut cursor = bytes.as_slice();
            assert_eq!(read_uleb(&mut cursor).unwrap(), value);
            assert!(cursor.is_empty());
        }

        // Truncated in the middle of a multi-byte value.
        let mut cursor: &[u8] = &[0x80];
        assert!(read_uleb(&mut cursor).is_err());

        // 11 continuation bytes can't fit in 64 bits.
        let mut cursor: &[u8] = &[0xff; 11];
        assert!(read_uleb(&mut cursor).is_err());
    }

    #[test]
    fn compact_unwind_entry_layout() {
        assert_eq!(size_of::<CompactUnwindEntry>(), 32);
        assert_eq!(std::mem::offset_of!(CompactUnwindEntry, code_start), 0);
        assert_eq!(std::mem::offset_of!(CompactUnwindEntry, personality), 16);
        assert_eq!(std::mem::offset_of!(CompactUnwindEntry, lsda), 24);
    }

    #[test]
    fn mach_sym_bits() {
        let sym = |n_type: u8, n_desc: u16, n_value: u64| MachSym {
            n_strx: U32::new(LittleEndian, 0),
            n_type,
            n_sect: 0,
            n_desc: U16::new(LittleEndian, n_desc),
            n_value: U64Bytes::new(LittleEndian, n_value),
        };

        let undef = sym(macho::N_UNDF | macho::N_EXT, 0, 0);
        assert!(undef.is_undefined());
        assert!(!undef.is_common());

        let common = sym(macho::N_UNDF | macho::N_EXT, 3 << 8, 16);
        assert!(common.is_common());
        assert!(!common.is_undefined());
        assert_eq!(common.common_p2align(), 3);

        let hidden = sym(macho::N_SECT | macho::N_EXT | macho::N_PEXT, 0, 0x100);
        assert!(hidden.is_extern());
        assert!(hidden.is_private_extern());
        assert_eq!(hidden.sym_type(), macho::N_SECT);
    }

    #[test]
    fn fixed_names() {
        assert_eq!(fixed_name(b"__TEXT\0\0\0\0\0\0\0\0\0\0"), "__TEXT");
        assert_eq!(fixed_name(b"0123456789abcdef"), "0123456789abcdef");
    }
}
