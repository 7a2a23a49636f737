//! A handwritten parser for our arguments.
//!
//! The flags we accept follow the platform linker's spelling, which means
//! single-dash long options and stateful per-input modifiers: options like
//! `-weak_library` change how the file they name is loaded, not a global
//! setting. A per-input `Modifiers` snapshot keeps that association.

use crate::bail;
use crate::error::Result;
use crate::lto::LtoPlugin;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Args {
    pub inputs: Vec<Input>,

    /// Load every archive member, not just the ones that resolve an
    /// undefined reference.
    pub all_load: bool,

    /// Drop dylibs whose symbols are never referenced.
    pub dead_strip_dylibs: bool,

    /// SDK roots prepended when searching for absolute library paths.
    pub syslibroot: Vec<PathBuf>,

    /// Host-provided LTO plugin. There is no command-line spelling for
    /// this; embedders install it after parsing.
    pub lto_plugin: Option<Arc<dyn LtoPlugin>>,
}

#[derive(Debug, Clone)]
pub struct Input {
    pub path: PathBuf,

    /// Set when this input is a member extracted from an archive upstream.
    pub archive_name: Option<String>,

    pub modifiers: Modifiers,
}

/// Per-input load behaviour, captured at the point the input appeared on
/// the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    /// Definitions from this file get private-extern visibility.
    pub hidden: bool,

    /// Keep the dylib even under `-dead_strip_dylibs`.
    pub needed: bool,

    /// Missing-at-runtime dylib; all its definitions bind weakly.
    pub weak: bool,

    /// Re-export this dylib from the output image.
    pub reexport: bool,
}

impl Args {
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
        let mut args = Args {
            inputs: Vec::new(),
            all_load: false,
            dead_strip_dylibs: false,
            syslibroot: Vec::new(),
            lto_plugin: None,
        };

        let mut input = input.peekable();

        let next_value = |input: &mut std::iter::Peekable<I>, flag: &str| -> Result<String> {
            match input.next() {
                Some(value) => Ok(value.as_ref().to_owned()),
                None => bail!("Missing argument to {flag}"),
            }
        };

        fn push_input(args: &mut Args, modifiers: Modifiers, path: String) {
            args.inputs.push(Input {
                path: PathBuf::from(path),
                archive_name: None,
                modifiers,
            });
        }

        while let Some(arg) = input.next() {
            let arg = arg.as_ref();
            match arg {
                "-all_load" => args.all_load = true,
                "-dead_strip_dylibs" => args.dead_strip_dylibs = true,
                "-syslibroot" => {
                    let root = next_value(&mut input, arg)?;
                    args.syslibroot.push(PathBuf::from(root));
                }
                "-load_hidden" => {
                    let path = next_value(&mut input, arg)?;
                    push_input(&mut args, Modifiers { hidden: true, ..Modifiers::default() }, path);
                }
                "-needed_library" => {
                    let path = next_value(&mut input, arg)?;
                    push_input(&mut args, Modifiers { needed: true, ..Modifiers::default() }, path);
                }
                "-weak_library" => {
                    let path = next_value(&mut input, arg)?;
                    push_input(&mut args, Modifiers { weak: true, ..Modifiers::default() }, path);
                }
                "-reexport_library" => {
                    let path = next_value(&mut input, arg)?;
                    push_input(&mut args, Modifiers { reexport: true, ..Modifiers::default() }, path);
                }
                other if other.starts_with('-') => {
                    bail!("Unrecognized argument `{other}`");
                }
                path => push_input(&mut args, Modifiers::default(), path.to_owned()),
            }
        }

        Ok(args)
    }

    /// An empty argument set, for embedders that build inputs directly.
    pub fn empty() -> Args {
        Args::parse(std::iter::empty::<&str>()).expect("empty args always parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse(args.iter().copied()).unwrap()
    }

    #[test]
    fn positional_inputs_and_globals() {
        let args = parse(&[
            "main.o",
            "-all_load",
            "-syslibroot",
            "/sdk",
            "-syslibroot",
            "/fallback",
            "-dead_strip_dylibs",
            "libfoo.dylib",
        ]);
        assert!(args.all_load);
        assert!(args.dead_strip_dylibs);
        assert_eq!(args.syslibroot, [PathBuf::from("/sdk"), PathBuf::from("/fallback")]);
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.inputs[0].modifiers, Modifiers::default());
    }

    #[test]
    fn library_modifiers() {
        let args = parse(&[
            "-weak_library",
            "libw.dylib",
            "-needed_library",
            "libn.tbd",
            "-reexport_library",
            "libr.dylib",
            "-load_hidden",
            "member.o",
        ]);
        assert!(args.inputs[0].modifiers.weak);
        assert!(args.inputs[1].modifiers.needed);
        assert!(args.inputs[2].modifiers.reexport);
        assert!(args.inputs[3].modifiers.hidden);
    }

    #[test]
    fn rejects_unknown_flags_and_missing_values() {
        assert!(Args::parse(["-no_such_flag"].iter().copied()).is_err());
        assert!(Args::parse(["-syslibroot"].iter().copied()).is_err());
    }
}
