//! Symbol versioning: applies version-script clauses to resolved symbols and
//! parses `sym@ver` / `sym@@ver` suffixes when building a shared object.

use crate::context::Context;
use crate::elf::VERSYM_HIDDEN;
use crate::elf::VER_NDX_LAST_RESERVED;
use crate::input_file::FileId;
use anyhow::anyhow;
use foldhash::HashMap;
use foldhash::HashMapExt;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::borrow::Cow;

/// Translates one shell-style glob into regex syntax. Character classes pass
/// through; everything else that regex treats specially gets escaped.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' | ']' => out.push(c),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Compiles a clause's glob patterns into one anchored alternation.
fn compile_alternation(patterns: &[&str]) -> Result<Option<regex::bytes::Regex>, regex::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternation = patterns
        .iter()
        .map(|p| glob_to_regex(p))
        .collect::<Vec<_>>()
        .join("|");
    regex::bytes::Regex::new(&format!("^(?:{alternation})$")).map(Some)
}

fn compile_str_alternation(patterns: &[&str]) -> Result<Option<regex::Regex>, regex::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternation = patterns
        .iter()
        .map(|p| glob_to_regex(p))
        .collect::<Vec<_>>()
        .join("|");
    regex::Regex::new(&format!("^(?:{alternation})$")).map(Some)
}

/// Demangles an Itanium-mangled name; anything else is returned as-is.
fn demangled(name: &[u8]) -> Cow<str> {
    if name.starts_with(b"_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            return Cow::Owned(symbol.to_string());
        }
    }
    String::from_utf8_lossy(name)
}

/// Assigns version indices from the version script. Literal names bind by
/// table lookup; glob patterns are matched against every symbol we define,
/// and `extern "C++"` patterns against the demangled form.
#[tracing::instrument(skip_all, name = "Apply version script")]
pub(crate) fn apply_version_script(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    for clause in &ctx.args.version_patterns {
        let mut globs: Vec<&str> = Vec::new();
        for pattern in &clause.patterns {
            if pattern.contains(['*', '?', '[']) {
                globs.push(pattern);
                continue;
            }
            let Some(id) = db.get(pattern.as_bytes()) else {
                continue;
            };
            let sym = db.symbol(id);
            if sym.state().file.is_some_and(|f| !f.is_dso()) {
                sym.update(|s| s.ver_idx = clause.ver_idx);
            }
        }
        if globs.is_empty() && clause.cpp_patterns.is_empty() {
            continue;
        }

        let regex = match compile_alternation(&globs) {
            Ok(regex) => regex,
            Err(_) => {
                ctx.error(anyhow!("invalid version pattern: {}", globs.join(", ")));
                continue;
            }
        };
        let cpp_patterns: Vec<&str> = clause.cpp_patterns.iter().map(String::as_str).collect();
        let cpp_regex = match compile_str_alternation(&cpp_patterns) {
            Ok(regex) => regex,
            Err(_) => {
                ctx.error(anyhow!(
                    "invalid version pattern: {}",
                    cpp_patterns.join(", ")
                ));
                continue;
            }
        };

        ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
            if !file.is_alive() {
                return;
            }
            for (_, _, id) in file.globals() {
                let sym = db.symbol(id);
                if sym.state().file != Some(FileId::Object(i)) {
                    continue;
                }
                let name = sym.name().bytes();
                if let Some(regex) = &regex {
                    if regex.is_match(name) {
                        sym.update(|s| s.ver_idx = clause.ver_idx);
                        continue;
                    }
                }
                if let Some(cpp_regex) = &cpp_regex {
                    if cpp_regex.is_match(&demangled(name)) {
                        sym.update(|s| s.ver_idx = clause.ver_idx);
                    }
                }
            }
        });
    }
}

/// Resolves `@ver`/`@@ver` suffixes against `--version-definitions` when
/// producing a shared object. `@@` marks the default; a plain `@` version
/// additionally sets the hidden bit.
#[tracing::instrument(skip_all, name = "Parse symbol versions")]
pub(crate) fn parse_symbol_version(ctx: &mut Context) {
    if !ctx.args.output_kind.is_shared_object() {
        return;
    }
    let db = &ctx.symbol_db;
    let mut verdefs: HashMap<&str, u16> = HashMap::new();
    for (i, name) in ctx.args.version_definitions.iter().enumerate() {
        verdefs.insert(name, i as u16 + VER_NDX_LAST_RESERVED + 1);
    }

    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            return;
        }
        for (offset, symver) in file.symvers.iter().enumerate() {
            let Some(symver) = symver else { continue };
            let sym_index = file.first_global + offset;
            let Some(id) = file.symbols[sym_index] else {
                continue;
            };
            let sym = db.symbol(id);
            if sym.state().file != Some(FileId::Object(i)) {
                continue;
            }
            let (is_default, version) = match symver.strip_prefix('@') {
                Some(rest) => (true, rest),
                None => (false, *symver),
            };
            match verdefs.get(version) {
                Some(&ver_idx) => sym.update(|s| {
                    s.ver_idx = ver_idx;
                    if !is_default {
                        s.ver_idx |= VERSYM_HIDDEN;
                    }
                }),
                None => ctx.error(anyhow!(
                    "{}: symbol {} has undefined version {}",
                    file,
                    sym.name(),
                    version
                )),
            }
        }
    });
}
