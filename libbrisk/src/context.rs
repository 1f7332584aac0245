//! Link-wide state threaded through every pass.

use crate::arch::Arch;
use crate::args::Args;
use crate::elf::InputSymbol;
use crate::elf::SymbolPlacement;
use crate::elf::STT_NOTYPE;
use crate::error::ErrorSink;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::input_file::SharedFile;
use crate::output_section::OutputSections;
use crate::string_merging::MergedSection;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::SymbolAux;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolState;
use crate::synthetic::Chunk;
use crate::synthetic::ChunkId;
use crate::synthetic::ChunkIds;
use crate::synthetic::DynamicEntry;
use crate::synthetic::DynbssSection;
use crate::synthetic::DynsymSection;
use crate::synthetic::GotSection;
use crate::synthetic::PltSection;
use crate::synthetic::StringTable;
use crate::synthetic::VersionRequirements;
use std::sync::atomic::AtomicU64;

/// Names the linker may synthesize. They're interned up front so the symbol
/// table can stay immutable once built.
const SYNTHETIC_SYMBOL_NAMES: &[&str] = &[
    "__ehdr_start",
    "__executable_start",
    "__init_array_start",
    "__init_array_end",
    "__fini_array_start",
    "__fini_array_end",
    "__preinit_array_start",
    "__preinit_array_end",
    "_DYNAMIC",
    "_GLOBAL_OFFSET_TABLE_",
    "__bss_start",
    "_end",
    "_etext",
    "_edata",
    "__GNU_EH_FRAME_HDR",
    "end",
    "etext",
    "edata",
];

pub struct Context<'data> {
    pub args: &'data Args,
    pub arch: Arch,

    pub objs: Vec<ObjectFile<'data>>,
    pub dsos: Vec<SharedFile<'data>>,
    pub symbol_db: SymbolDb<'data>,
    pub symbol_aux: Vec<SymbolAux>,
    pub errors: ErrorSink,

    /// Chunk storage. Append-only; `chunk_order` holds the display order.
    pub chunks: Vec<Chunk<'data>>,
    pub chunk_order: Vec<ChunkId>,
    pub ids: ChunkIds,

    pub output_sections: OutputSections<'data>,
    pub merged_sections: Vec<MergedSection<'data>>,
    /// The `.comment` merged section, which receives the linker version
    /// string.
    pub comment_section: MergedSectionId,
    /// Input sections routed to the synthetic `.eh_frame` chunk.
    pub eh_frame_members: Vec<(usize, usize)>,

    pub got: GotSection,
    pub plt: PltSection,
    pub pltgot: PltSection,
    pub dynsym: DynsymSection,
    pub dynstr: StringTable,
    pub dynbss: DynbssSection,
    pub dynbss_relro: DynbssSection,
    pub dynamic_entries: Vec<DynamicEntry>,
    pub verneed: VersionRequirements,

    /// Index into `objs` of the file holding linker-synthesized symbols.
    pub internal_obj: Option<usize>,

    /// Set when an input looks like GCC intermediate code; the link continues
    /// with incomplete semantics and the driver may refuse to proceed.
    pub gcc_lto: bool,

    /// Intersection of the GNU property feature bits of all live objects.
    pub features: u32,

    /// Dynamic relocation counts accumulated by the relocation scan.
    pub num_dynrel_relative: AtomicU64,
    pub num_dynrel_addressable: AtomicU64,

    /// Contents of the repro section, provided by the driver when `--repro`
    /// is in effect.
    pub repro_payload: Vec<u8>,

    /// Number of program headers, fixed during layout.
    pub num_segments: u64,
}

impl<'data> Context<'data> {
    pub fn new(
        args: &'data Args,
        arch: Arch,
        mut objs: Vec<ObjectFile<'data>>,
        mut dsos: Vec<SharedFile<'data>>,
    ) -> Context<'data> {
        // Priority 1 is reserved for the internal file.
        for (i, obj) in objs.iter_mut().enumerate() {
            obj.priority = 2 + i as u32;
        }
        let num_objs = objs.len();
        for (j, dso) in dsos.iter_mut().enumerate() {
            dso.priority = 2 + (num_objs + j) as u32;
        }

        let (start_iplt, end_iplt) = arch.iplt_symbol_names();
        let extra_names = SYNTHETIC_SYMBOL_NAMES
            .iter()
            .copied()
            .chain([start_iplt, end_iplt])
            .map(str::as_bytes);
        let symbol_db = SymbolDb::build(&mut objs, &mut dsos, args, extra_names);

        let mut chunks = Vec::new();
        let ids = crate::synthetic::create_synthetic_sections(args, arch, &mut chunks);
        let chunk_order = (0..chunks.len() as u32).map(ChunkId::new).collect();

        let mut merged_sections = Vec::new();
        let comment_section = MergedSectionId::new(merged_sections.len());
        merged_sections.push(MergedSection::comment());

        Context {
            args,
            arch,
            objs,
            dsos,
            symbol_db,
            symbol_aux: Vec::new(),
            errors: ErrorSink::default(),
            chunks,
            chunk_order,
            ids,
            output_sections: OutputSections::default(),
            merged_sections,
            comment_section,
            eh_frame_members: Vec::new(),
            got: GotSection::default(),
            plt: PltSection::default(),
            pltgot: PltSection::default(),
            dynsym: DynsymSection::default(),
            dynstr: StringTable::default(),
            dynbss: DynbssSection::default(),
            dynbss_relro: DynbssSection::default(),
            dynamic_entries: Vec::new(),
            verneed: VersionRequirements::default(),
            internal_obj: None,
            gcc_lto: false,
            features: 0,
            num_dynrel_relative: AtomicU64::new(0),
            num_dynrel_addressable: AtomicU64::new(0),
            repro_payload: Vec::new(),
            num_segments: 0,
        }
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk<'data> {
        &self.chunks[id.as_usize()]
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk<'data> {
        &mut self.chunks[id.as_usize()]
    }

    pub(crate) fn error(&self, error: crate::error::Error) {
        self.errors.report(error);
    }

    pub(crate) fn live_objs(&self) -> impl Iterator<Item = (usize, &ObjectFile<'data>)> {
        self.objs.iter().enumerate().filter(|(_, f)| f.is_alive())
    }

    pub(crate) fn live_dsos(&self) -> impl Iterator<Item = (usize, &SharedFile<'data>)> {
        self.dsos.iter().enumerate().filter(|(_, f)| f.is_alive())
    }

    pub(crate) fn has_dynamic_section(&self) -> bool {
        self.args.output_kind.is_pic()
            || self.args.dynamic_linker.is_some()
            || self.live_dsos().next().is_some()
    }

    pub(crate) fn file_display(&self, file: FileId) -> String {
        match file {
            FileId::Object(i) => self.objs[i].to_string(),
            FileId::Shared(j) => self.dsos[j].to_string(),
        }
    }

    /// The input symbol record behind a symbol's winning definition.
    pub(crate) fn winning_esym(&self, state: &SymbolState) -> Option<&InputSymbol<'data>> {
        match state.file? {
            FileId::Object(i) => self.objs[i].elf_syms.get(state.local_idx as usize),
            FileId::Shared(j) => self.dsos[j].elf_syms.get(state.local_idx as usize),
        }
    }

    /// ELF symbol type (`STT_*`) of a symbol's winning definition.
    pub(crate) fn symbol_type(&self, state: &SymbolState) -> u8 {
        self.winning_esym(state).map_or(STT_NOTYPE, |e| e.sym_type)
    }

    /// Resolved virtual address of a symbol, once layout has run.
    pub(crate) fn symbol_address(&self, id: SymbolId) -> u64 {
        let state = self.symbol_db.symbol(id).state();
        if state.has_copyrel {
            let chunk = if state.copyrel_readonly {
                self.ids.dynbss_relro
            } else {
                self.ids.dynbss
            };
            return self.chunk(chunk).shdr.sh_addr + state.value;
        }
        let Some(FileId::Object(i)) = state.file else {
            // DSO definitions and unresolved symbols have no address of
            // their own in the output image.
            return state.value;
        };
        let file = &self.objs[i];
        let Some(esym) = file.elf_syms.get(state.local_idx as usize) else {
            return state.value;
        };
        match esym.placement {
            SymbolPlacement::Undefined | SymbolPlacement::Absolute | SymbolPlacement::Common => {
                state.value
            }
            SymbolPlacement::Section(sec) => {
                let Some(isec) = file.section(sec) else {
                    return state.value;
                };
                if isec.merged.is_some() {
                    let Some((merged_id, frag, delta)) =
                        file.sym_fragments[state.local_idx as usize]
                    else {
                        return 0;
                    };
                    let merged = &self.merged_sections[merged_id.as_usize()];
                    let Some(chunk) = merged.chunk else { return 0 };
                    return self.chunk(chunk).shdr.sh_addr + merged.fragment_offset(frag) + delta;
                }
                let Some(osec) = isec.output_section else {
                    return 0;
                };
                let Some(chunk) = self.output_sections.get(osec).chunk else {
                    return 0;
                };
                self.chunk(chunk).shdr.sh_addr + isec.offset + esym.value
            }
        }
    }

    /// Makes sure `id` has a slot in the auxiliary table and returns its
    /// index.
    pub(crate) fn ensure_aux(&mut self, id: SymbolId) -> usize {
        let sym = self.symbol_db.symbol(id);
        let state = sym.state();
        if let Some(aux_idx) = state.aux_idx {
            return aux_idx as usize;
        }
        let aux_idx = self.symbol_aux.len();
        self.symbol_aux.push(SymbolAux::default());
        sym.update(|s| s.aux_idx = Some(aux_idx as u32));
        aux_idx
    }

    pub fn aux_for(&self, state: &SymbolState) -> Option<&SymbolAux> {
        state.aux_idx.map(|i| &self.symbol_aux[i as usize])
    }
}
