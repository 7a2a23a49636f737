//! A parser for the subset of TAPI (`.tbd`) documents a linker needs:
//! the install name, the exported and weak-exported symbol lists, and the
//! reexported-library paths. TAPI files are YAML, but like the other text
//! formats we consume, the structure we accept is narrow enough that a
//! small hand-rolled lexer beats carrying a YAML stack: zero-indent keys
//! open sections, and the lists we care about are flow-style `[ ... ]`
//! sequences, possibly spanning lines. Only the first document of a
//! multi-document stub is read.

use crate::bail;
use crate::error::Result;

#[derive(Default, Debug)]
pub(crate) struct TextStub<'data> {
    pub(crate) install_name: &'data str,
    pub(crate) reexported_libs: Vec<&'data str>,
    pub(crate) exports: Vec<&'data str>,
    pub(crate) weak_exports: Vec<&'data str>,
}

#[derive(PartialEq, Clone, Copy)]
enum Section {
    Preamble,
    Exports,
    ReexportedLibraries,
    Other,
}

pub(crate) fn parse(data: &[u8]) -> Result<TextStub<'_>> {
    let text = std::str::from_utf8(data)?;

    let mut stub = TextStub::default();
    let mut section = Section::Preamble;
    let mut saw_document = false;

    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();
        if trimmed.starts_with("---") {
            if saw_document {
                break;
            }
            saw_document = true;
            continue;
        }
        if trimmed == "..." {
            break;
        }

        let body = trimmed.trim_start();
        if body.is_empty() || body.starts_with('#') {
            continue;
        }
        let top_level = !trimmed.starts_with([' ', '\t']);

        // List entries start with a dash; the key follows it.
        let body = body.strip_prefix("- ").unwrap_or(body);
        let Some((key, value)) = body.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if top_level {
            section = match key {
                "exports" | "reexports" => Section::Exports,
                "reexported-libraries" => Section::ReexportedLibraries,
                "install-name" => {
                    if stub.install_name.is_empty() {
                        stub.install_name = unquote(value);
                    }
                    Section::Preamble
                }
                _ => Section::Other,
            };
            continue;
        }

        match (section, key) {
            (Section::Exports, "symbols" | "objc-classes") => {
                read_flow_list(value, &mut lines, &mut stub.exports)?;
            }
            (Section::Exports, "weak-symbols" | "weak-def-symbols") => {
                read_flow_list(value, &mut lines, &mut stub.weak_exports)?;
            }
            (Section::Exports, "re-exports") => {
                read_flow_list(value, &mut lines, &mut stub.reexported_libs)?;
            }
            (Section::ReexportedLibraries, "libraries") => {
                read_flow_list(value, &mut lines, &mut stub.reexported_libs)?;
            }
            _ => {}
        }
    }

    if !saw_document || stub.install_name.is_empty() {
        bail!("not a usable TAPI document: missing install-name");
    }
    Ok(stub)
}

/// Reads a `[ a, b, c ]` sequence starting at `value`, consuming further
/// lines until the closing bracket. A bare scalar is accepted as a
/// one-element list.
fn read_flow_list<'data>(
    value: &'data str,
    lines: &mut std::str::Lines<'data>,
    out: &mut Vec<&'data str>,
) -> Result {
    let mut segment = value.trim();

    let Some(rest) = segment.strip_prefix('[') else {
        if !segment.is_empty() {
            out.push(unquote(segment));
        }
        return Ok(());
    };
    segment = rest;

    loop {
        let mut done = false;
        let mut items = segment;
        if let Some(rest) = items.trim_end().strip_suffix(']') {
            items = rest;
            done = true;
        }
        for item in items.split(',') {
            let item = unquote(item.trim());
            if !item.is_empty() {
                out.push(item);
            }
        }
        if done {
            return Ok(());
        }
        let Some(next) = lines.next() else {
            bail!("unterminated list in TAPI document");
        };
        segment = next.trim();
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}
