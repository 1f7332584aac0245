//! Linker-generated output chunks: headers, GOT, PLT, dynamic tables, hash
//! tables and friends. Chunks are created up front in a fixed order; their
//! sizes are finalized once slot allocation has run.

use crate::arch::Arch;
use crate::args::Args;
use crate::args::BuildIdOption;
use crate::context::Context;
use crate::elf;
use crate::elf::SectionHeader;
use crate::elf::STT_GNU_IFUNC;
use crate::error::Result;
use crate::output_section::OutputSectionId;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::SymbolId;
use foldhash::HashMap;
use foldhash::HashMapExt;
use std::sync::atomic::Ordering::Relaxed;

/// An index into the context's chunk storage. Stable across sorting; only
/// `chunk_order` is rearranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkId(u32);

impl ChunkId {
    pub(crate) fn new(raw: u32) -> ChunkId {
        ChunkId(raw)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// The ELF header, program header table or section header table.
    Header(HeaderKind),
    Synthetic(SyntheticKind),
    /// Concatenation of input sections.
    Output(OutputSectionId),
    /// Deduplicated string/constant pool.
    Merged(MergedSectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Ehdr,
    Phdr,
    Shdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    Got,
    GotPlt,
    RelDyn,
    RelPlt,
    Strtab,
    Shstrtab,
    Plt,
    PltGot,
    Symtab,
    Dynsym,
    Dynstr,
    EhFrame,
    EhFrameHdr,
    Dynbss,
    DynbssRelro,
    Interp,
    BuildId,
    Hash,
    GnuHash,
    Verdef,
    Versym,
    Verneed,
    NoteProperty,
    Repro,
    Dynamic,
}

pub struct Chunk<'data> {
    pub name: &'data [u8],
    pub shdr: SectionHeader,
    /// Output section index; 0 until assigned, headers never get one.
    pub shndx: u32,
    pub kind: ChunkKind,
}

impl<'data> Chunk<'data> {
    pub(crate) fn is_header(&self) -> bool {
        matches!(self.kind, ChunkKind::Header(_))
    }

    pub(crate) fn is_tbss(&self) -> bool {
        self.shdr.is_nobits() && self.shdr.is_tls()
    }
}

/// Handles to the synthetic chunks, in creation order.
pub struct ChunkIds {
    pub ehdr: ChunkId,
    pub phdr: ChunkId,
    pub shdr: ChunkId,
    pub got: ChunkId,
    pub gotplt: ChunkId,
    pub reldyn: ChunkId,
    pub relplt: ChunkId,
    pub strtab: ChunkId,
    pub shstrtab: ChunkId,
    pub plt: ChunkId,
    pub pltgot: ChunkId,
    pub symtab: ChunkId,
    pub dynsym: ChunkId,
    pub dynstr: ChunkId,
    pub eh_frame: ChunkId,
    pub dynbss: ChunkId,
    pub dynbss_relro: ChunkId,
    pub interp: Option<ChunkId>,
    pub buildid: Option<ChunkId>,
    pub eh_frame_hdr: Option<ChunkId>,
    pub hash: Option<ChunkId>,
    pub gnu_hash: Option<ChunkId>,
    pub verdef: Option<ChunkId>,
    pub dynamic: ChunkId,
    pub versym: ChunkId,
    pub verneed: ChunkId,
    pub note_property: ChunkId,
    pub repro: Option<ChunkId>,
}

pub(crate) fn create_synthetic_sections<'data>(
    args: &Args,
    arch: Arch,
    chunks: &mut Vec<Chunk<'data>>,
) -> ChunkIds {
    let word = arch.word_size;
    let rela_type = if arch.is_rela {
        elf::SHT_RELA
    } else {
        object::elf::SHT_REL
    };
    let alloc = u64::from(elf::SHF_ALLOC);
    let write = u64::from(elf::SHF_WRITE);
    let exec = u64::from(elf::SHF_EXECINSTR);

    let mut add = |name: &'static str, kind: ChunkKind, shdr: SectionHeader| {
        let id = ChunkId::new(chunks.len() as u32);
        chunks.push(Chunk {
            name: name.as_bytes(),
            shdr,
            shndx: 0,
            kind,
        });
        id
    };
    let header = |sh_flags, sh_addralign| SectionHeader {
        sh_flags,
        sh_addralign,
        ..Default::default()
    };
    let section = |sh_type, sh_flags, sh_addralign, sh_entsize| SectionHeader {
        sh_type,
        sh_flags,
        sh_addralign,
        sh_entsize,
        ..Default::default()
    };

    let ehdr = add("", ChunkKind::Header(HeaderKind::Ehdr), header(alloc, 8));
    let phdr = add(
        ".phdr",
        ChunkKind::Header(HeaderKind::Phdr),
        header(alloc, 8),
    );
    let shdr = add(".shdr", ChunkKind::Header(HeaderKind::Shdr), header(0, 8));

    let synth = ChunkKind::Synthetic;
    let got = add(
        ".got",
        synth(SyntheticKind::Got),
        section(elf::SHT_PROGBITS, alloc | write, word, word),
    );
    let gotplt = add(
        ".got.plt",
        synth(SyntheticKind::GotPlt),
        section(elf::SHT_PROGBITS, alloc | write, word, word),
    );
    let reldyn = add(
        ".rela.dyn",
        synth(SyntheticKind::RelDyn),
        section(rela_type, alloc, word, arch.rel_size),
    );
    let relplt = add(
        ".rela.plt",
        synth(SyntheticKind::RelPlt),
        section(rela_type, alloc, word, arch.rel_size),
    );
    let strtab = add(
        ".strtab",
        synth(SyntheticKind::Strtab),
        section(elf::SHT_STRTAB, 0, 1, 0),
    );
    let shstrtab = add(
        ".shstrtab",
        synth(SyntheticKind::Shstrtab),
        section(elf::SHT_STRTAB, 0, 1, 0),
    );
    let plt = add(
        ".plt",
        synth(SyntheticKind::Plt),
        section(elf::SHT_PROGBITS, alloc | exec, 16, arch.plt_entry_size),
    );
    let pltgot = add(
        ".plt.got",
        synth(SyntheticKind::PltGot),
        section(elf::SHT_PROGBITS, alloc | exec, 8, arch.plt_got_entry_size),
    );
    let symtab = add(
        ".symtab",
        synth(SyntheticKind::Symtab),
        section(elf::SHT_SYMTAB, 0, word, arch.sym_size),
    );
    let dynsym = add(
        ".dynsym",
        synth(SyntheticKind::Dynsym),
        section(elf::SHT_DYNSYM, alloc, word, arch.sym_size),
    );
    let dynstr = add(
        ".dynstr",
        synth(SyntheticKind::Dynstr),
        section(elf::SHT_STRTAB, alloc, 1, 0),
    );
    let eh_frame = add(
        ".eh_frame",
        synth(SyntheticKind::EhFrame),
        section(elf::SHT_PROGBITS, alloc, word, 0),
    );
    let dynbss = add(
        ".dynbss",
        synth(SyntheticKind::Dynbss),
        section(elf::SHT_NOBITS, alloc | write, 64, 0),
    );
    let dynbss_relro = add(
        ".dynbss.rel.ro",
        synth(SyntheticKind::DynbssRelro),
        section(elf::SHT_NOBITS, alloc | write, 64, 0),
    );

    let interp = args.dynamic_linker.as_ref().map(|_| {
        add(
            ".interp",
            synth(SyntheticKind::Interp),
            section(elf::SHT_PROGBITS, alloc, 1, 0),
        )
    });
    let buildid = (args.build_id != BuildIdOption::None).then(|| {
        add(
            ".note.gnu.build-id",
            synth(SyntheticKind::BuildId),
            section(elf::SHT_NOTE, alloc, 4, 0),
        )
    });
    let eh_frame_hdr = args.eh_frame_hdr.then(|| {
        add(
            ".eh_frame_hdr",
            synth(SyntheticKind::EhFrameHdr),
            section(elf::SHT_PROGBITS, alloc, 4, 0),
        )
    });
    let hash = args.hash_style_sysv.then(|| {
        add(
            ".hash",
            synth(SyntheticKind::Hash),
            section(elf::SHT_HASH, alloc, 4, 4),
        )
    });
    let gnu_hash = args.hash_style_gnu.then(|| {
        add(
            ".gnu.hash",
            synth(SyntheticKind::GnuHash),
            section(elf::SHT_GNU_HASH, alloc, word, 0),
        )
    });
    let verdef = (!args.version_definitions.is_empty()).then(|| {
        add(
            ".gnu.version_d",
            synth(SyntheticKind::Verdef),
            section(elf::SHT_GNU_VERDEF, alloc, word, 0),
        )
    });

    let dynamic = add(
        ".dynamic",
        synth(SyntheticKind::Dynamic),
        section(elf::SHT_DYNAMIC, alloc | write, word, arch.dyn_size),
    );
    let versym = add(
        ".gnu.version",
        synth(SyntheticKind::Versym),
        section(elf::SHT_GNU_VERSYM, alloc, 2, 2),
    );
    let verneed = add(
        ".gnu.version_r",
        synth(SyntheticKind::Verneed),
        section(elf::SHT_GNU_VERNEED, alloc, 4, 0),
    );
    let note_property = add(
        ".note.gnu.property",
        synth(SyntheticKind::NoteProperty),
        section(elf::SHT_NOTE, alloc, 8, 0),
    );
    let repro = args.repro.then(|| {
        add(
            ".repro",
            synth(SyntheticKind::Repro),
            section(elf::SHT_PROGBITS, 0, 1, 0),
        )
    });

    ChunkIds {
        ehdr,
        phdr,
        shdr,
        got,
        gotplt,
        reldyn,
        relplt,
        strtab,
        shstrtab,
        plt,
        pltgot,
        symtab,
        dynsym,
        dynstr,
        eh_frame,
        dynbss,
        dynbss_relro,
        interp,
        buildid,
        eh_frame_hdr,
        hash,
        gnu_hash,
        verdef,
        dynamic,
        versym,
        verneed,
        note_property,
        repro,
    }
}

/// GOT slot bookkeeping. Slot numbers are assigned in allocation order; the
/// slot count determines the section size.
#[derive(Default)]
pub struct GotSection {
    pub got_syms: Vec<SymbolId>,
    pub gottp_syms: Vec<SymbolId>,
    pub tlsgd_syms: Vec<SymbolId>,
    pub tlsdesc_syms: Vec<SymbolId>,
    pub tlsld_slot: Option<u32>,
    next_slot: u32,
}

impl GotSection {
    pub(crate) fn alloc_slots(&mut self, count: u32) -> u32 {
        let slot = self.next_slot;
        self.next_slot += count;
        slot
    }

    pub(crate) fn add_tlsld(&mut self) -> u32 {
        if let Some(slot) = self.tlsld_slot {
            return slot;
        }
        let slot = self.alloc_slots(2);
        self.tlsld_slot = Some(slot);
        slot
    }

    pub(crate) fn num_slots(&self) -> u32 {
        self.next_slot
    }
}

#[derive(Default)]
pub struct PltSection {
    pub symbols: Vec<SymbolId>,
}

#[derive(Default)]
pub struct DynsymSection {
    pub symbols: Vec<SymbolId>,
}

/// Copy-relocation area. Each symbol gets a slot sized and aligned for the
/// variable being copied out of its DSO.
#[derive(Default)]
pub struct DynbssSection {
    pub symbols: Vec<SymbolId>,
    pub size: u64,
    pub alignment: u64,
}

impl DynbssSection {
    pub(crate) fn alloc(&mut self, id: SymbolId, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let offset = crate::layout::align_to(self.size, align);
        self.size = offset + size.max(1);
        self.alignment = self.alignment.max(align);
        self.symbols.push(id);
        offset
    }
}

/// A deduplicating string table (`.dynstr`-shaped). Offset 0 is the empty
/// string.
pub struct StringTable {
    offsets: HashMap<Vec<u8>, u32>,
    pub size: u64,
}

impl Default for StringTable {
    fn default() -> StringTable {
        StringTable {
            offsets: HashMap::new(),
            size: 1,
        }
    }
}

impl StringTable {
    pub(crate) fn add(&mut self, bytes: &[u8]) -> u32 {
        if bytes.is_empty() {
            return 0;
        }
        if let Some(offset) = self.offsets.get(bytes) {
            return *offset;
        }
        let offset = self.size as u32;
        self.offsets.insert(bytes.to_vec(), offset);
        self.size += bytes.len() as u64 + 1;
        offset
    }

    pub fn get(&self, bytes: &[u8]) -> Option<u32> {
        self.offsets.get(bytes).copied()
    }
}

/// `.gnu.version_r` contents derived from the versions that imported symbols
/// carry in their defining DSOs.
#[derive(Default)]
pub struct VersionRequirements {
    /// Number of version-needed records, i.e. the `DT_VERNEEDNUM` value.
    pub count: u64,
    pub size: u64,
    /// Whether any dynamic symbol carries a non-trivial version.
    pub any_versions: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum EntryValue {
    Val(u64),
    ChunkAddr(ChunkId),
    ChunkSize(ChunkId),
    /// Offset into `.dynstr`.
    StrOff(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct DynamicEntry {
    pub tag: i64,
    pub value: EntryValue,
}

/// Per-kind counts of `.rela.dyn` entries. IRELATIVE entries come first so
/// that `__rela_iplt_start`/`__rela_iplt_end` can delimit them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelDynCounts {
    pub(crate) irelative: u64,
    pub(crate) relative: u64,
    pub(crate) addressable: u64,
    pub(crate) tls: u64,
    pub(crate) copy: u64,
}

impl RelDynCounts {
    pub(crate) fn total(&self) -> u64 {
        self.irelative + self.relative + self.addressable + self.tls + self.copy
    }
}

pub(crate) fn reldyn_counts(ctx: &Context) -> RelDynCounts {
    let pic = ctx.args.output_kind.is_pic();
    let mut counts = RelDynCounts {
        relative: ctx.num_dynrel_relative.load(Relaxed),
        addressable: ctx.num_dynrel_addressable.load(Relaxed),
        copy: (ctx.dynbss.symbols.len() + ctx.dynbss_relro.symbols.len()) as u64,
        ..Default::default()
    };
    for &id in &ctx.got.got_syms {
        let state = ctx.symbol_db.symbol(id).state();
        if ctx.symbol_type(&state) == STT_GNU_IFUNC {
            counts.irelative += 1;
        } else if state.is_imported {
            counts.addressable += 1;
        } else if pic {
            counts.relative += 1;
        }
    }
    for &id in &ctx.got.gottp_syms {
        let state = ctx.symbol_db.symbol(id).state();
        if state.is_imported || pic {
            counts.tls += 1;
        }
    }
    for &id in &ctx.got.tlsgd_syms {
        let state = ctx.symbol_db.symbol(id).state();
        if state.is_imported {
            counts.tls += 2;
        } else if pic {
            counts.tls += 1;
        }
    }
    for &id in &ctx.got.tlsdesc_syms {
        let state = ctx.symbol_db.symbol(id).state();
        if state.is_imported || pic {
            counts.tls += 1;
        }
    }
    if ctx.got.tlsld_slot.is_some() && pic {
        counts.tls += 1;
    }
    counts
}

/// Number of IRELATIVE-producing GOT entries, used for the
/// `__rela_iplt_start`/`__rela_iplt_end` subrange.
pub(crate) fn num_irelative_relocs(ctx: &Context) -> u64 {
    ctx.got
        .got_syms
        .iter()
        .filter(|&&id| {
            let state = ctx.symbol_db.symbol(id).state();
            ctx.symbol_type(&state) == STT_GNU_IFUNC
        })
        .count() as u64
}

/// Collects the version requirements of imported symbols and accounts for the
/// version-name strings in `.dynstr`.
fn build_version_requirements(ctx: &mut Context) {
    let mut per_dso: HashMap<usize, Vec<&[u8]>> = HashMap::new();
    for &id in &ctx.dynsym.symbols {
        let state = ctx.symbol_db.symbol(id).state();
        let Some(crate::input_file::FileId::Shared(j)) = state.file else {
            continue;
        };
        if !state.is_imported {
            continue;
        }
        let dso = &ctx.dsos[j];
        let raw = dso
            .sym_versions
            .get(state.local_idx as usize)
            .copied()
            .unwrap_or(0);
        let ver = raw & !elf::VERSYM_HIDDEN;
        if ver <= elf::VER_NDX_GLOBAL {
            continue;
        }
        let Some(&name) = dso.version_names.get(ver as usize) else {
            continue;
        };
        let versions = per_dso.entry(j).or_default();
        if !versions.contains(&name) {
            versions.push(name);
        }
    }

    let mut req = VersionRequirements::default();
    let mut names = Vec::new();
    for (_, versions) in per_dso {
        req.count += 1;
        req.size += elf::VERNEED_SIZE + versions.len() as u64 * elf::VERNAUX_SIZE;
        names.extend(versions);
    }
    req.any_versions = req.count > 0;
    for name in names {
        ctx.dynstr.add(name);
    }
    ctx.verneed = req;
}

fn build_dynamic_entries(ctx: &mut Context) {
    use object::elf::*;

    let mut entries = Vec::new();
    if !ctx.has_dynamic_section() {
        ctx.dynamic_entries = entries;
        return;
    }
    let ids = &ctx.ids;
    let mut sonames = Vec::new();
    for (_, dso) in ctx.live_dsos() {
        sonames.push(dso.soname);
    }
    for soname in sonames {
        let offset = ctx.dynstr.add(soname);
        entries.push(DynamicEntry {
            tag: DT_NEEDED as i64,
            value: EntryValue::StrOff(offset),
        });
    }
    if ctx.args.output_kind.is_shared_object() {
        if let Some(soname) = &ctx.args.soname {
            let offset = ctx.dynstr.add(soname.as_bytes());
            entries.push(DynamicEntry {
                tag: DT_SONAME as i64,
                value: EntryValue::StrOff(offset),
            });
        }
    }

    let counts = reldyn_counts(ctx);
    if counts.total() > 0 {
        entries.push(DynamicEntry {
            tag: DT_RELA as i64,
            value: EntryValue::ChunkAddr(ids.reldyn),
        });
        entries.push(DynamicEntry {
            tag: DT_RELASZ as i64,
            value: EntryValue::ChunkSize(ids.reldyn),
        });
        entries.push(DynamicEntry {
            tag: DT_RELAENT as i64,
            value: EntryValue::Val(ctx.arch.rel_size),
        });
        if counts.relative > 0 {
            entries.push(DynamicEntry {
                tag: DT_RELACOUNT as i64,
                value: EntryValue::Val(counts.relative),
            });
        }
    }
    if !ctx.plt.symbols.is_empty() {
        entries.push(DynamicEntry {
            tag: DT_JMPREL as i64,
            value: EntryValue::ChunkAddr(ids.relplt),
        });
        entries.push(DynamicEntry {
            tag: DT_PLTRELSZ as i64,
            value: EntryValue::ChunkSize(ids.relplt),
        });
        entries.push(DynamicEntry {
            tag: DT_PLTREL as i64,
            value: EntryValue::Val(if ctx.arch.is_rela {
                DT_RELA as u64
            } else {
                DT_REL as u64
            }),
        });
        entries.push(DynamicEntry {
            tag: DT_PLTGOT as i64,
            value: EntryValue::ChunkAddr(ids.gotplt),
        });
    }

    entries.push(DynamicEntry {
        tag: DT_SYMTAB as i64,
        value: EntryValue::ChunkAddr(ids.dynsym),
    });
    entries.push(DynamicEntry {
        tag: DT_SYMENT as i64,
        value: EntryValue::Val(ctx.arch.sym_size),
    });
    entries.push(DynamicEntry {
        tag: DT_STRTAB as i64,
        value: EntryValue::ChunkAddr(ids.dynstr),
    });
    entries.push(DynamicEntry {
        tag: DT_STRSZ as i64,
        value: EntryValue::ChunkSize(ids.dynstr),
    });

    let mut array_entry = |sh_type: u32, addr_tag: u32, size_tag: u32| {
        if let Some(chunk_id) = find_output_chunk_by_type(ctx, sh_type) {
            entries.push(DynamicEntry {
                tag: addr_tag as i64,
                value: EntryValue::ChunkAddr(chunk_id),
            });
            entries.push(DynamicEntry {
                tag: size_tag as i64,
                value: EntryValue::ChunkSize(chunk_id),
            });
        }
    };
    array_entry(elf::SHT_INIT_ARRAY, DT_INIT_ARRAY, DT_INIT_ARRAYSZ);
    array_entry(elf::SHT_FINI_ARRAY, DT_FINI_ARRAY, DT_FINI_ARRAYSZ);
    array_entry(
        elf::SHT_PREINIT_ARRAY,
        DT_PREINIT_ARRAY,
        DT_PREINIT_ARRAYSZ,
    );

    if !ctx.dynsym.symbols.is_empty() {
        if let Some(hash) = ids.hash {
            entries.push(DynamicEntry {
                tag: DT_HASH as i64,
                value: EntryValue::ChunkAddr(hash),
            });
        }
        if let Some(gnu_hash) = ids.gnu_hash {
            entries.push(DynamicEntry {
                tag: DT_GNU_HASH as i64,
                value: EntryValue::ChunkAddr(gnu_hash),
            });
        }
    }
    if ctx.verneed.any_versions {
        entries.push(DynamicEntry {
            tag: DT_VERNEED as i64,
            value: EntryValue::ChunkAddr(ids.verneed),
        });
        entries.push(DynamicEntry {
            tag: DT_VERNEEDNUM as i64,
            value: EntryValue::Val(ctx.verneed.count),
        });
    }
    if let Some(verdef) = ids.verdef {
        entries.push(DynamicEntry {
            tag: DT_VERDEF as i64,
            value: EntryValue::ChunkAddr(verdef),
        });
        entries.push(DynamicEntry {
            tag: DT_VERDEFNUM as i64,
            value: EntryValue::Val(ctx.args.version_definitions.len() as u64),
        });
    }
    if ctx.verneed.any_versions || ids.verdef.is_some() {
        entries.push(DynamicEntry {
            tag: DT_VERSYM as i64,
            value: EntryValue::ChunkAddr(ids.versym),
        });
    }

    if ctx.args.b_symbolic {
        entries.push(DynamicEntry {
            tag: DT_FLAGS as i64,
            value: EntryValue::Val(DF_SYMBOLIC as u64),
        });
    }
    if ctx.args.output_kind == crate::args::OutputKind::PositionIndependentExecutable {
        entries.push(DynamicEntry {
            tag: DT_FLAGS_1 as i64,
            value: EntryValue::Val(DF_1_PIE as u64),
        });
    }
    if ctx.args.output_kind.is_executable() {
        entries.push(DynamicEntry {
            tag: DT_DEBUG as i64,
            value: EntryValue::Val(0),
        });
    }
    entries.push(DynamicEntry {
        tag: DT_NULL as i64,
        value: EntryValue::Val(0),
    });
    ctx.dynamic_entries = entries;
}

fn find_output_chunk_by_type(ctx: &Context, sh_type: u32) -> Option<ChunkId> {
    ctx.chunk_order
        .iter()
        .copied()
        .find(|&id| {
            let chunk = ctx.chunk(id);
            matches!(chunk.kind, ChunkKind::Output(_)) && chunk.shdr.sh_type == sh_type
        })
}

/// Turns the symbolic dynamic entries into concrete `(tag, value)` pairs.
/// Must run after layout so chunk addresses are final.
pub(crate) fn resolve_dynamic_entries(ctx: &Context) -> Vec<(i64, u64)> {
    ctx.dynamic_entries
        .iter()
        .map(|entry| {
            let value = match entry.value {
                EntryValue::Val(v) => v,
                EntryValue::ChunkAddr(id) => ctx.chunk(id).shdr.sh_addr,
                EntryValue::ChunkSize(id) => ctx.chunk(id).shdr.sh_size,
                EntryValue::StrOff(off) => u64::from(off),
            };
            (entry.tag, value)
        })
        .collect()
}

/// Sizes for `.symtab`/`.strtab`: every named symbol of every live file,
/// locals first.
fn compute_symtab_sizes(ctx: &Context) -> (u64, u64, u64) {
    let mut num_locals = 0u64;
    let mut num_globals = 0u64;
    let mut strtab_size = 1u64;
    for (i, file) in ctx.live_objs() {
        for (sym_index, esym) in file.elf_syms.iter().enumerate() {
            if esym.name.is_empty() {
                continue;
            }
            if esym.is_local() {
                // Locals in sections that lost comdat deduplication are gone.
                if let crate::elf::SymbolPlacement::Section(sec) = esym.placement {
                    if !file.section(sec).is_some_and(|s| s.is_alive) {
                        continue;
                    }
                }
                num_locals += 1;
                strtab_size += esym.name.len() as u64 + 1;
            } else {
                let Some(id) = file.symbols[sym_index] else {
                    continue;
                };
                let state = ctx.symbol_db.symbol(id).state();
                if state.file == Some(crate::input_file::FileId::Object(i)) {
                    num_globals += 1;
                    strtab_size += esym.name.len() as u64 + 1;
                }
            }
        }
    }
    (num_locals, num_globals, strtab_size)
}

/// Computes the final size of every synthetic chunk. Called after slot
/// allocation and before chunks are sorted for layout.
#[tracing::instrument(skip_all, name = "Update synthetic section sizes")]
pub(crate) fn update_synthetic_shdrs(ctx: &mut Context) -> Result {
    build_version_requirements(ctx);
    build_dynamic_entries(ctx);

    ctx.features = ctx
        .live_objs()
        .map(|(_, f)| f.features)
        .fold(!0u32, |acc, f| acc & f);
    if ctx.features == !0 {
        ctx.features = 0;
    }
    if ctx.args.required_features != 0 {
        for (_, file) in ctx.live_objs() {
            let missing = ctx.args.required_features & !file.features;
            if missing != 0 {
                tracing::warn!(
                    file = %file,
                    missing_features = missing,
                    "input lacks requested GNU properties"
                );
            }
        }
    }

    let word = ctx.arch.word_size;
    let (num_locals, num_globals, strtab_size) = compute_symtab_sizes(ctx);
    let num_dynsym = ctx.dynsym.symbols.len() as u64;
    let counts = reldyn_counts(ctx);

    let eh_frame_size = {
        let mut size = 0u64;
        for &(obj, sec) in &ctx.eh_frame_members {
            if let Some(isec) = ctx.objs[obj].section(sec) {
                size = crate::layout::align_to(size, isec.header.sh_addralign.max(1))
                    + isec.header.sh_size;
            }
        }
        size
    };
    // One terminator plus an estimated FDE per input contribution. The real
    // frame index is produced by the writer.
    let num_fdes = ctx.eh_frame_members.len() as u64;

    let num_defined_dynsyms = ctx
        .dynsym
        .symbols
        .iter()
        .filter(|&&id| {
            let state = ctx.symbol_db.symbol(id).state();
            state.is_exported
        })
        .count() as u64;

    for id in ctx.chunk_order.clone() {
        let kind = ctx.chunk(id).kind;
        let ChunkKind::Synthetic(kind) = kind else {
            continue;
        };
        let size = match kind {
            SyntheticKind::Got => u64::from(ctx.got.num_slots()) * word,
            SyntheticKind::GotPlt => (3 + ctx.plt.symbols.len() as u64) * word,
            SyntheticKind::RelDyn => counts.total() * ctx.arch.rel_size,
            SyntheticKind::RelPlt => ctx.plt.symbols.len() as u64 * ctx.arch.rel_size,
            SyntheticKind::Strtab => {
                if num_locals + num_globals == 0 {
                    0
                } else {
                    strtab_size
                }
            }
            SyntheticKind::Shstrtab => {
                // Filled in after pruning, once the surviving chunk names are
                // known.
                1
            }
            SyntheticKind::Plt => {
                if ctx.plt.symbols.is_empty() {
                    0
                } else {
                    (1 + ctx.plt.symbols.len() as u64) * ctx.arch.plt_entry_size
                }
            }
            SyntheticKind::PltGot => {
                ctx.pltgot.symbols.len() as u64 * ctx.arch.plt_got_entry_size
            }
            SyntheticKind::Symtab => {
                if num_locals + num_globals == 0 {
                    0
                } else {
                    (1 + num_locals + num_globals) * ctx.arch.sym_size
                }
            }
            SyntheticKind::Dynsym => {
                if ctx.has_dynamic_section() {
                    (1 + num_dynsym) * ctx.arch.sym_size
                } else {
                    0
                }
            }
            SyntheticKind::Dynstr => {
                if ctx.has_dynamic_section() {
                    ctx.dynstr.size
                } else {
                    0
                }
            }
            SyntheticKind::EhFrame => eh_frame_size,
            SyntheticKind::EhFrameHdr => {
                if eh_frame_size == 0 {
                    0
                } else {
                    12 + 8 * num_fdes
                }
            }
            SyntheticKind::Dynbss => ctx.dynbss.size,
            SyntheticKind::DynbssRelro => ctx.dynbss_relro.size,
            SyntheticKind::Interp => ctx
                .args
                .dynamic_linker
                .as_ref()
                .filter(|_| ctx.has_dynamic_section())
                .map_or(0, |path| path.len() as u64 + 1),
            SyntheticKind::BuildId => {
                if ctx.args.build_id == BuildIdOption::None {
                    0
                } else {
                    16 + ctx.args.build_id.hash_size() as u64
                }
            }
            SyntheticKind::Hash => {
                if num_dynsym == 0 {
                    0
                } else {
                    let n = 1 + num_dynsym;
                    4 * (2 + n + n)
                }
            }
            SyntheticKind::GnuHash => {
                if num_dynsym == 0 {
                    0
                } else {
                    let num_buckets = (num_defined_dynsyms / 8).max(1);
                    let num_bloom = (num_defined_dynsyms / 8).max(1);
                    16 + num_bloom * 8 + num_buckets * 4 + num_defined_dynsyms * 4
                }
            }
            SyntheticKind::Verdef => {
                let n = ctx.args.version_definitions.len() as u64;
                for name in &ctx.args.version_definitions {
                    ctx.dynstr.add(name.as_bytes());
                }
                (1 + n) * (elf::VERDEF_SIZE + elf::VERDAUX_SIZE)
            }
            SyntheticKind::Versym => {
                if ctx.verneed.any_versions || ctx.ids.verdef.is_some() {
                    (1 + num_dynsym) * 2
                } else {
                    0
                }
            }
            SyntheticKind::Verneed => ctx.verneed.size,
            SyntheticKind::NoteProperty => {
                if ctx.features == 0 {
                    0
                } else {
                    32
                }
            }
            SyntheticKind::Repro => ctx.repro_payload.len() as u64,
            SyntheticKind::Dynamic => {
                ctx.dynamic_entries.len() as u64 * ctx.arch.dyn_size
            }
        };
        ctx.chunk_mut(id).shdr.sh_size = size;
    }

    // Verdef sizing may have grown dynstr.
    let dynstr_id = ctx.ids.dynstr;
    if ctx.has_dynamic_section() {
        ctx.chunk_mut(dynstr_id).shdr.sh_size = ctx.dynstr.size;
    }
    Ok(())
}
