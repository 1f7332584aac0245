//! The process-wide symbol table. Each distinct global name maps to exactly
//! one [`Symbol`] record. Names are collected from every input in parallel,
//! then merged single-threaded into a table that never reallocates, so symbol
//! references stay valid while resolution mutates the records concurrently
//! under their per-symbol locks.

use crate::args::Args;
use crate::elf::STV_DEFAULT;
use crate::elf::VER_NDX_UNSPECIFIED;
use crate::hash::hash_bytes;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::input_file::SharedFile;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Mutex;

/// An interned symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolName<'data>(&'data [u8]);

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        SymbolName(bytes)
    }

    pub(crate) fn prehashed(bytes: &'data [u8]) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(SymbolName(bytes), hash_bytes(bytes))
    }

    pub fn bytes(&self) -> &'data [u8] {
        self.0
    }
}

impl std::fmt::Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0))
    }
}

/// An ID for a global symbol. Also an index into `SymbolDb::symbols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn from_usize(value: usize) -> SymbolId {
        SymbolId(u32::try_from(value).expect("Symbols overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

bitflags::bitflags! {
    /// What the relocation scan determined a symbol to need. OR-ed
    /// concurrently, consumed (and cleared) by the slot allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NeedsFlags: u32 {
        const GOT = 1 << 0;
        const PLT = 1 << 1;
        const GOTTP = 1 << 2;
        const TLSGD = 1 << 3;
        const TLSDESC = 1 << 4;
        const TLSLD = 1 << 5;
        const COPYREL = 1 << 6;
    }
}

/// Ranks competing definitions for the same name. Lower wins; ties are broken
/// by file priority (also lower wins), which makes resolution independent of
/// install order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DefinitionTier {
    Strong,
    Weak,
    Common,
    /// Defined in an archive member that hasn't been loaded.
    Lazy,
    Dso,
    Undefined,
}

/// Resolution state of one symbol. Guarded by the per-symbol mutex.
#[derive(Debug, Clone, Copy)]
pub struct SymbolState {
    pub file: Option<FileId>,
    pub tier: DefinitionTier,
    pub priority: u32,
    /// Index of the winning definition in the owning file's symbol table.
    pub local_idx: u32,
    pub value: u64,
    pub visibility: u8,
    pub ver_idx: u16,
    /// Output section index, once known.
    pub shndx: u32,
    pub is_imported: bool,
    pub is_exported: bool,
    pub is_weak: bool,
    pub has_copyrel: bool,
    pub copyrel_readonly: bool,
    /// Index into the context's `symbol_aux` table.
    pub aux_idx: Option<u32>,
}

impl Default for SymbolState {
    fn default() -> SymbolState {
        SymbolState {
            file: None,
            tier: DefinitionTier::Undefined,
            priority: u32::MAX,
            local_idx: 0,
            value: 0,
            visibility: STV_DEFAULT,
            ver_idx: VER_NDX_UNSPECIFIED,
            shndx: 0,
            is_imported: false,
            is_exported: false,
            is_weak: false,
            has_copyrel: false,
            copyrel_readonly: false,
            aux_idx: None,
        }
    }
}

/// A definition competing for a symbol.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) file: FileId,
    pub(crate) tier: DefinitionTier,
    pub(crate) priority: u32,
    pub(crate) local_idx: u32,
    pub(crate) value: u64,
    pub(crate) visibility: u8,
    pub(crate) is_weak: bool,
}

pub struct Symbol<'data> {
    name: SymbolName<'data>,
    state: Mutex<SymbolState>,
    needs: AtomicU32,
}

impl<'data> Symbol<'data> {
    fn new(name: SymbolName<'data>) -> Symbol<'data> {
        Symbol {
            name,
            state: Mutex::new(SymbolState::default()),
            needs: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> SymbolName<'data> {
        self.name
    }

    /// Copies out the current resolution state.
    pub fn state(&self) -> SymbolState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut SymbolState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Installs `cand` if it outranks the current definition. Returns whether
    /// the candidate won.
    pub(crate) fn install(&self, cand: Candidate) -> bool {
        let mut state = self.state.lock().unwrap();
        if (cand.tier, cand.priority) < (state.tier, state.priority) {
            state.file = Some(cand.file);
            state.tier = cand.tier;
            state.priority = cand.priority;
            state.local_idx = cand.local_idx;
            state.value = cand.value;
            state.visibility = cand.visibility;
            state.is_weak = cand.is_weak;
            true
        } else {
            false
        }
    }

    /// Re-initialises the record as if unresolved, but only while `file`
    /// still owns the winning definition. Used when an input is found to be
    /// dead after the liveness sweep.
    pub(crate) fn reset_if_owned_by(&self, file: FileId) {
        let mut state = self.state.lock().unwrap();
        if state.file == Some(file) {
            *state = SymbolState::default();
        }
    }

    pub(crate) fn add_needs(&self, flags: NeedsFlags) {
        self.needs.fetch_or(flags.bits(), Relaxed);
    }

    pub(crate) fn needs(&self) -> NeedsFlags {
        NeedsFlags::from_bits_truncate(self.needs.load(Relaxed))
    }

    pub(crate) fn clear_needs(&self) {
        self.needs.store(0, Relaxed);
    }
}

pub struct SymbolDb<'data> {
    names: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolDb<'data> {
    /// Builds the table from every global name in the inputs, plus
    /// `--defsym` left-hand sides and `extra_names` (the linker-synthesized
    /// symbol names). Fills in each file's name-to-symbol mapping.
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub fn build(
        objs: &mut [ObjectFile<'data>],
        dsos: &mut [SharedFile<'data>],
        args: &'data Args,
        extra_names: impl IntoIterator<Item = &'data [u8]>,
    ) -> SymbolDb<'data> {
        let obj_names: Vec<Vec<(usize, PreHashed<SymbolName<'data>>)>> = objs
            .par_iter()
            .map(|file| collect_global_names(&file.elf_syms, file.first_global))
            .collect();
        let dso_names: Vec<Vec<(usize, PreHashed<SymbolName<'data>>)>> = dsos
            .par_iter()
            .map(|file| collect_global_names(&file.elf_syms, file.first_global))
            .collect();

        let approx_num_symbols = obj_names.iter().chain(dso_names.iter()).map(Vec::len).sum();
        let mut db = SymbolDb {
            names: PassThroughHashMap::with_capacity_and_hasher(
                approx_num_symbols,
                Default::default(),
            ),
            symbols: Vec::with_capacity(approx_num_symbols),
        };

        for (file, pending) in objs.iter_mut().zip(obj_names) {
            for (sym_index, name) in pending {
                file.symbols[sym_index] = Some(db.intern_prehashed(name));
            }
        }
        for (file, pending) in dsos.iter_mut().zip(dso_names) {
            for (sym_index, name) in pending {
                file.symbols[sym_index] = Some(db.intern_prehashed(name));
            }
        }

        for (name, _value) in &args.defsyms {
            db.intern(name.as_bytes());
        }
        for name in extra_names {
            db.intern(name);
        }
        db
    }

    pub(crate) fn intern(&mut self, name: &'data [u8]) -> SymbolId {
        self.intern_prehashed(SymbolName::prehashed(name))
    }

    fn intern_prehashed(&mut self, name: PreHashed<SymbolName<'data>>) -> SymbolId {
        if let Some(id) = self.names.get(&name) {
            return *id;
        }
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(Symbol::new(*name));
        self.names.insert(name, id);
        id
    }

    pub fn get(&self, name: &'data [u8]) -> Option<SymbolId> {
        self.names.get(&SymbolName::prehashed(name)).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn symbols_iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol<'data>)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(raw, sym)| (SymbolId::from_usize(raw), sym))
    }
}

/// Auxiliary slot numbers for a symbol that landed in the GOT, PLT or dynamic
/// symbol table. Indexed by `SymbolState::aux_idx`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolAux {
    pub got_idx: Option<u32>,
    pub gottp_idx: Option<u32>,
    pub tlsgd_idx: Option<u32>,
    pub tlsdesc_idx: Option<u32>,
    pub plt_idx: Option<u32>,
    pub pltgot_idx: Option<u32>,
    pub dynsym_idx: Option<u32>,
}

fn collect_global_names<'data>(
    elf_syms: &[crate::elf::InputSymbol<'data>],
    first_global: usize,
) -> Vec<(usize, PreHashed<SymbolName<'data>>)> {
    elf_syms
        .iter()
        .enumerate()
        .skip(first_global)
        .filter(|(_, sym)| !sym.name.is_empty())
        .map(|(i, sym)| (i, SymbolName::prehashed(sym.name)))
        .collect()
}
