//! Input files as seen by the core: relocatable objects (possibly archive
//! members) and shared objects. The parser produces these; the core only
//! flips liveness bits and resolves their symbols.

use crate::elf::InputRelocation;
use crate::elf::InputSectionHeader;
use crate::elf::InputSymbol;
use crate::output_section::OutputSectionId;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::SymbolId;
use smallvec::SmallVec;
use std::ops::Range;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

/// Identifies an input file. Indexes into `Context::objs` / `Context::dsos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileId {
    Object(usize),
    Shared(usize),
}

impl FileId {
    pub(crate) fn is_dso(self) -> bool {
        matches!(self, FileId::Shared(_))
    }
}

/// A slice of an input file destined for some output section.
#[derive(Debug)]
pub struct InputSection<'data> {
    pub header: InputSectionHeader<'data>,
    pub data: &'data [u8],
    pub relocations: Vec<InputRelocation>,
    pub is_alive: bool,

    /// Where this section goes in the output. At most one of these is set
    /// once sections have been distributed.
    pub output_section: Option<OutputSectionId>,
    pub merged: Option<MergedSectionId>,

    /// Offset within the output section, assigned by the sizing pass.
    pub offset: u64,
}

impl<'data> InputSection<'data> {
    pub fn new(header: InputSectionHeader<'data>, data: &'data [u8]) -> InputSection<'data> {
        InputSection {
            header,
            data,
            relocations: Vec::new(),
            is_alive: true,
            output_section: None,
            merged: None,
            offset: 0,
        }
    }
}

/// A comdat group: sections that are kept or discarded together.
#[derive(Debug)]
pub struct ComdatGroup<'data> {
    pub name: &'data [u8],
    /// Indices into the owning file's section table.
    pub members: SmallVec<[u32; 4]>,
}

pub struct ObjectFile<'data> {
    pub name: String,
    /// Name of the archive this member came from, if any.
    pub archive_name: Option<String>,

    /// Deterministic tie-break rank; assigned from command-line order.
    pub priority: u32,

    /// Whether this file is part of the link. Archive members start dead and
    /// are pulled in by the liveness sweep.
    pub is_alive: AtomicBool,

    /// Whether this file was found inside an archive, i.e. its definitions
    /// are installed lazily.
    pub lazy: bool,

    pub elf_syms: Vec<InputSymbol<'data>>,
    /// Index of the first non-local symbol in `elf_syms`.
    pub first_global: usize,

    /// Global symbol table entries for `elf_syms`; `None` for locals and
    /// nameless symbols.
    pub symbols: Vec<Option<SymbolId>>,

    /// `@version` suffixes from `.symver` directives, one slot per global.
    pub symvers: Vec<Option<&'data str>>,

    /// For symbols defined inside merged (string) sections: the fragment the
    /// symbol points into and the symbol's offset within that fragment.
    pub sym_fragments: Vec<Option<(MergedSectionId, u32, u64)>>,

    pub sections: Vec<Option<InputSection<'data>>>,
    pub comdat_groups: Vec<ComdatGroup<'data>>,

    /// GNU property note feature bits.
    pub features: u32,

    /// Set when the archive this member came from was named by
    /// `--exclude-libs`.
    pub exclude_libs: bool,
}

impl<'data> ObjectFile<'data> {
    pub fn new(
        name: String,
        lazy: bool,
        elf_syms: Vec<InputSymbol<'data>>,
        first_global: usize,
        sections: Vec<Option<InputSection<'data>>>,
    ) -> ObjectFile<'data> {
        let num_syms = elf_syms.len();
        let num_globals = num_syms.saturating_sub(first_global);
        ObjectFile {
            name,
            archive_name: None,
            priority: 0,
            is_alive: AtomicBool::new(!lazy),
            lazy,
            elf_syms,
            first_global,
            symbols: vec![None; num_syms],
            symvers: vec![None; num_globals],
            sym_fragments: vec![None; num_syms],
            sections,
            comdat_groups: Vec::new(),
            features: 0,
            exclude_libs: false,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Relaxed)
    }

    /// Marks the file alive. Returns whether it was dead before, i.e. whether
    /// the caller is responsible for processing it.
    pub(crate) fn mark_alive(&self) -> bool {
        !self.is_alive.swap(true, Relaxed)
    }

    pub(crate) fn section(&self, index: usize) -> Option<&InputSection<'data>> {
        self.sections.get(index).and_then(Option::as_ref)
    }

    /// Iterates `(symbol table index, input symbol, global symbol ID)` over
    /// the file's named globals.
    pub(crate) fn globals(
        &self,
    ) -> impl Iterator<Item = (usize, &InputSymbol<'data>, SymbolId)> + '_ {
        self.elf_syms
            .iter()
            .enumerate()
            .skip(self.first_global)
            .filter_map(|(i, esym)| Some((i, esym, self.symbols[i]?)))
    }
}

impl std::fmt::Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.archive_name {
            Some(archive) => write!(f, "{}({})", archive, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

pub struct SharedFile<'data> {
    pub name: String,
    pub soname: &'data [u8],
    pub priority: u32,
    pub is_alive: AtomicBool,
    /// With `--as-needed`, the DSO only becomes a dependency if something
    /// references it.
    pub as_needed: bool,

    pub elf_syms: Vec<InputSymbol<'data>>,
    pub first_global: usize,
    pub symbols: Vec<Option<SymbolId>>,

    /// Version names defined by the DSO, indexed by version index.
    pub version_names: Vec<&'data [u8]>,
    /// `.gnu.version` entry per symbol (hidden bit included).
    pub sym_versions: Vec<u16>,

    /// Address ranges the DSO maps read-only. Used to pick the target section
    /// for copy relocations.
    pub readonly_ranges: Vec<Range<u64>>,
}

impl<'data> SharedFile<'data> {
    pub fn new(
        name: String,
        soname: &'data [u8],
        as_needed: bool,
        elf_syms: Vec<InputSymbol<'data>>,
        first_global: usize,
    ) -> SharedFile<'data> {
        let num_syms = elf_syms.len();
        SharedFile {
            name,
            soname,
            priority: 0,
            is_alive: AtomicBool::new(!as_needed),
            as_needed,
            elf_syms,
            first_global,
            symbols: vec![None; num_syms],
            version_names: Vec::new(),
            sym_versions: vec![0; num_syms],
            readonly_ranges: Vec::new(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Relaxed)
    }

    pub(crate) fn mark_alive(&self) -> bool {
        !self.is_alive.swap(true, Relaxed)
    }

    /// Whether the DSO defines `value` in a read-only segment.
    pub(crate) fn is_readonly(&self, value: u64) -> bool {
        self.readonly_ranges.iter().any(|r| r.contains(&value))
    }

    pub(crate) fn globals(
        &self,
    ) -> impl Iterator<Item = (usize, &InputSymbol<'data>, SymbolId)> + '_ {
        self.elf_syms
            .iter()
            .enumerate()
            .skip(self.first_global)
            .filter_map(|(i, esym)| Some((i, esym, self.symbols[i]?)))
    }

    /// Other defined globals of this DSO that share `value`. A copy-relocated
    /// symbol's aliases must reach the output dynsym as well, with the same
    /// value, so the runtime resolves every alias to the copied location.
    pub(crate) fn find_aliases(&self, value: u64, except: SymbolId) -> SmallVec<[SymbolId; 2]> {
        self.globals()
            .filter(|(_, esym, id)| {
                *id != except && esym.is_defined() && !esym.is_local() && esym.value == value
            })
            .map(|(_, _, id)| id)
            .collect()
    }
}

impl std::fmt::Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
