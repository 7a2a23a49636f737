//! The seam to the host's LTO machinery. We only consume the symbol-reader
//! half of the libLTO interface: enough to give a bitcode module a
//! native-shaped symbol table so it can take part in resolution like any
//! other object. Code generation happens elsewhere, after resolution.

use crate::bail;
use crate::error::Result;
use crate::macho::MachSym;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64Bytes;
use object::macho::N_ABS;
use object::macho::N_EXT;
use object::macho::N_UNDF;

/// Mirrors `lto_symbol_attributes` from `llvm-c/lto.h`.
pub const LTO_SYMBOL_ALIGNMENT_MASK: u32 = 0x0000_001f;
pub const LTO_SYMBOL_DEFINITION_MASK: u32 = 0x0000_0700;
pub const LTO_SYMBOL_DEFINITION_REGULAR: u32 = 0x0000_0100;
pub const LTO_SYMBOL_DEFINITION_TENTATIVE: u32 = 0x0000_0200;
pub const LTO_SYMBOL_DEFINITION_WEAK: u32 = 0x0000_0300;
pub const LTO_SYMBOL_DEFINITION_UNDEFINED: u32 = 0x0000_0400;
pub const LTO_SYMBOL_DEFINITION_WEAKUNDEF: u32 = 0x0000_0500;
pub const LTO_SYMBOL_SCOPE_MASK: u32 = 0x0000_3800;
pub const LTO_SYMBOL_SCOPE_INTERNAL: u32 = 0x0000_0800;
pub const LTO_SYMBOL_SCOPE_HIDDEN: u32 = 0x0000_1000;
pub const LTO_SYMBOL_SCOPE_PROTECTED: u32 = 0x0000_2000;
pub const LTO_SYMBOL_SCOPE_DEFAULT: u32 = 0x0000_1800;
pub const LTO_SYMBOL_SCOPE_DEFAULT_CAN_BE_HIDDEN: u32 = 0x0000_2800;

/// Loaded LTO implementation, installed by the embedder. Corresponds to a
/// dlopen'd libLTO; this crate never loads one itself.
pub trait LtoPlugin: Send + Sync {
    /// `lto_module_create_from_memory`.
    fn create_module(&self, data: &[u8]) -> Result<Box<dyn LtoModule>>;
}

/// One bitcode module's symbol reader.
pub trait LtoModule: Send + Sync {
    /// `lto_module_get_num_symbols`.
    fn num_symbols(&self) -> usize;

    /// `lto_module_get_symbol_name`.
    fn symbol_name(&self, index: usize) -> &str;

    /// `lto_module_get_symbol_attribute`.
    fn symbol_attributes(&self, index: usize) -> u32;
}

/// Synthesises the native symbol record an LTO symbol stands for: regular,
/// tentative and weak definitions appear absolute, undefined stays
/// undefined, and scope maps onto the extern bit.
pub(crate) fn lto_symbol_to_mach_sym(attributes: u32) -> Result<MachSym> {
    let e = LittleEndian;
    let p2align = (attributes & LTO_SYMBOL_ALIGNMENT_MASK) as u16;

    let n_type = match attributes & LTO_SYMBOL_DEFINITION_MASK {
        LTO_SYMBOL_DEFINITION_REGULAR
        | LTO_SYMBOL_DEFINITION_TENTATIVE
        | LTO_SYMBOL_DEFINITION_WEAK => N_ABS,
        LTO_SYMBOL_DEFINITION_UNDEFINED | LTO_SYMBOL_DEFINITION_WEAKUNDEF => N_UNDF,
        other => bail!("unknown LTO symbol definition {other:#x}"),
    };

    let n_ext = match attributes & LTO_SYMBOL_SCOPE_MASK {
        0 | LTO_SYMBOL_SCOPE_INTERNAL | LTO_SYMBOL_SCOPE_HIDDEN => 0,
        LTO_SYMBOL_SCOPE_DEFAULT
        | LTO_SYMBOL_SCOPE_PROTECTED
        | LTO_SYMBOL_SCOPE_DEFAULT_CAN_BE_HIDDEN => N_EXT,
        other => bail!("unknown LTO symbol scope {other:#x}"),
    };

    Ok(MachSym {
        n_strx: U32::new(e, 0),
        n_type: n_type | n_ext,
        n_sect: 0,
        n_desc: U16::new(e, p2align << 8),
        n_value: U64Bytes::new(e, 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::MachSymExt as _;

    #[test]
    fn definitions_become_absolute_symbols() {
        let sym = lto_symbol_to_mach_sym(
            LTO_SYMBOL_DEFINITION_REGULAR | LTO_SYMBOL_SCOPE_DEFAULT | 4,
        )
        .unwrap();
        assert!(sym.is_extern());
        assert_eq!(sym.sym_type(), N_ABS);
        assert_eq!(sym.common_p2align(), 4);

        let undef = lto_symbol_to_mach_sym(
            LTO_SYMBOL_DEFINITION_UNDEFINED | LTO_SYMBOL_SCOPE_DEFAULT,
        )
        .unwrap();
        assert!(undef.is_extern());
        assert!(undef.is_undefined());
    }

    #[test]
    fn internal_scope_clears_the_extern_bit() {
        let sym = lto_symbol_to_mach_sym(
            LTO_SYMBOL_DEFINITION_REGULAR | LTO_SYMBOL_SCOPE_INTERNAL,
        )
        .unwrap();
        assert!(!sym.is_extern());

        assert!(lto_symbol_to_mach_sym(0x0700).is_err());
    }
}
