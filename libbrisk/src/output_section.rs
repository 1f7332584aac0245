//! Distributes live input sections into output sections and computes member
//! offsets. Binning is sharded so that an output section with millions of
//! members can be built in parallel while keeping a deterministic member
//! order.

use crate::context::Context;
use crate::elf;
use crate::layout::align_to;
use crate::synthetic::Chunk;
use crate::synthetic::ChunkId;
use crate::synthetic::ChunkKind;
use foldhash::HashMap;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
use rayon::slice::ParallelSliceMut;

const NUM_SHARDS: usize = 128;

/// Identifies an output section. Also an index into
/// `OutputSections::sections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSectionId(u32);

impl OutputSectionId {
    fn from_usize(raw: usize) -> OutputSectionId {
        OutputSectionId(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub struct OutputSection<'data> {
    pub name: &'data [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    /// `(object index, section index)` pairs in deterministic order.
    pub members: Vec<(usize, usize)>,
    pub size: u64,
    pub alignment: u64,
    pub chunk: Option<ChunkId>,
}

#[derive(Default)]
pub struct OutputSections<'data> {
    pub(crate) sections: Vec<OutputSection<'data>>,
    by_key: HashMap<(&'data [u8], u32, u64), OutputSectionId>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn get_or_create(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> OutputSectionId {
        if let Some(id) = self.by_key.get(&(name, sh_type, sh_flags)) {
            return *id;
        }
        let id = OutputSectionId::from_usize(self.sections.len());
        self.sections.push(OutputSection {
            name,
            sh_type,
            sh_flags,
            members: Vec::new(),
            size: 0,
            alignment: 1,
            chunk: None,
        });
        self.by_key.insert((name, sh_type, sh_flags), id);
        id
    }

    pub fn get(&self, id: OutputSectionId) -> &OutputSection<'data> {
        &self.sections[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.sections.len()
    }
}

/// Well-known prefixes that are merged into one output section. Order
/// matters: the first match wins, so longer prefixes come before their
/// shorter counterparts.
const MERGED_NAME_PREFIXES: &[&[u8]] = &[
    b".text",
    b".data.rel.ro",
    b".data",
    b".rodata",
    b".bss.rel.ro",
    b".bss",
    b".init_array",
    b".fini_array",
    b".preinit_array",
    b".tdata",
    b".tbss",
    b".gcc_except_table",
    b".ctors",
    b".dtors",
    b".comment",
];

pub(crate) fn output_section_name<'data>(name: &'data [u8]) -> &'data [u8] {
    for &prefix in MERGED_NAME_PREFIXES {
        if name == prefix {
            return prefix;
        }
        if name.len() > prefix.len()
            && name.starts_with(prefix)
            && name[prefix.len()] == b'.'
        {
            return prefix;
        }
    }
    name
}

/// Flags that distinguish output sections. The rest (group membership,
/// compression and the like) is a per-input concern.
const OUTPUT_FLAGS_MASK: u64 = (elf::SHF_ALLOC as u64)
    | (elf::SHF_WRITE as u64)
    | (elf::SHF_EXECINSTR as u64)
    | (elf::SHF_TLS as u64);

fn should_discard(header: &elf::InputSectionHeader) -> bool {
    matches!(
        header.sh_type,
        elf::SHT_NULL
            | object::elf::SHT_GROUP
            | object::elf::SHT_SYMTAB
            | object::elf::SHT_STRTAB
            | object::elf::SHT_REL
            | object::elf::SHT_RELA
    ) || header.sh_flags & u64::from(object::elf::SHF_EXCLUDE) != 0
}

/// Decides which output (or merged) section each live input section belongs
/// to. Runs sequentially over files in priority order so that section IDs are
/// deterministic.
#[tracing::instrument(skip_all, name = "Assign output sections")]
pub(crate) fn assign_output_sections(ctx: &mut Context) {
    let objs = &mut ctx.objs;
    let output_sections = &mut ctx.output_sections;
    let merged_sections = &mut ctx.merged_sections;
    let eh_frame_members = &mut ctx.eh_frame_members;

    for (obj_index, file) in objs.iter_mut().enumerate() {
        if !file.is_alive() {
            continue;
        }
        for (sec_index, slot) in file.sections.iter_mut().enumerate() {
            let Some(isec) = slot else { continue };
            if !isec.is_alive {
                continue;
            }
            let header = isec.header;
            if should_discard(&header) {
                isec.is_alive = false;
                continue;
            }
            if header.name == b".eh_frame" {
                eh_frame_members.push((obj_index, sec_index));
                continue;
            }
            let name = output_section_name(header.name);
            let merge_flags = u64::from(elf::SHF_MERGE) | u64::from(elf::SHF_STRINGS);
            if header.sh_flags & merge_flags == merge_flags {
                let id = crate::string_merging::merged_id_for(
                    merged_sections,
                    name,
                    header.sh_type,
                    header.sh_flags & OUTPUT_FLAGS_MASK,
                );
                isec.merged = Some(id);
            } else {
                let id = output_sections.get_or_create(
                    name,
                    header.sh_type,
                    header.sh_flags & OUTPUT_FLAGS_MASK,
                );
                isec.output_section = Some(id);
            }
        }
    }
}

/// Builds the reverse edge from output sections to their input sections.
/// Input files are split into a fixed number of shards; each shard collects
/// per-output-section vectors, and the reduction appends them in shard order
/// so that the result is independent of scheduling.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub(crate) fn bin_sections(ctx: &mut Context) {
    if ctx.objs.is_empty() {
        return;
    }
    let num_osec = ctx.output_sections.len();
    if num_osec == 0 {
        return;
    }
    let unit = ctx.objs.len().div_ceil(NUM_SHARDS);
    let objs = &ctx.objs;

    let groups: Vec<Vec<Vec<(usize, usize)>>> = objs
        .par_chunks(unit)
        .enumerate()
        .map(|(shard_index, files)| {
            let base = shard_index * unit;
            let mut group = vec![Vec::new(); num_osec];
            for (k, file) in files.iter().enumerate() {
                if !file.is_alive() {
                    continue;
                }
                for (sec_index, slot) in file.sections.iter().enumerate() {
                    let Some(isec) = slot else { continue };
                    if isec.is_alive {
                        if let Some(osec) = isec.output_section {
                            group[osec.as_usize()].push((base + k, sec_index));
                        }
                    }
                }
            }
            group
        })
        .collect();

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (j, members) in group.iter().enumerate() {
            sizes[j] += members.len();
        }
    }

    ctx.output_sections
        .sections
        .par_iter_mut()
        .enumerate()
        .for_each(|(j, osec)| {
            osec.members.reserve_exact(sizes[j]);
            for group in &groups {
                osec.members.extend_from_slice(&group[j]);
            }
        });
}

/// Sorts `.init_array`/`.fini_array` members by the numeric priority embedded
/// in the input section name. Members without a priority run last.
#[tracing::instrument(skip_all, name = "Sort init/fini arrays")]
pub(crate) fn sort_init_fini(ctx: &mut Context) {
    let objs = &ctx.objs;
    for osec in &mut ctx.output_sections.sections {
        if osec.name == b".init_array" || osec.name == b".fini_array" {
            osec.members.sort_by_key(|&(obj, sec)| {
                objs[obj]
                    .section(sec)
                    .map_or(DEFAULT_INIT_PRIORITY, |isec| {
                        init_fini_priority(isec.header.name)
                    })
            });
        }
    }
}

const DEFAULT_INIT_PRIORITY: u32 = 65536;

fn init_fini_priority(name: &[u8]) -> u32 {
    let Some(dot) = name.iter().rposition(|&b| b == b'.') else {
        return DEFAULT_INIT_PRIORITY;
    };
    let (prefix, digits) = name.split_at(dot);
    let digits = &digits[1..];
    if !prefix.ends_with(b"_array") || digits.is_empty() {
        return DEFAULT_INIT_PRIORITY;
    }
    let mut value: u32 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return DEFAULT_INIT_PRIORITY;
        }
        value = value * 10 + u32::from(b - b'0');
    }
    value
}

#[derive(Clone, Copy)]
struct ScanState {
    offset: u64,
    align: u64,
}

fn combine(lhs: ScanState, rhs: ScanState) -> ScanState {
    ScanState {
        offset: align_to(lhs.offset, rhs.align) + rhs.offset,
        align: lhs.align.max(rhs.align),
    }
}

const SCAN_BLOCK: usize = 10_000;

/// Computes each member's offset plus the section's size and alignment via a
/// block-wise parallel prefix scan.
fn scan_members(
    members: &[(usize, usize)],
    objs: &[crate::input_file::ObjectFile],
) -> (Vec<u64>, u64, u64) {
    let header_of = |&(obj, sec): &(usize, usize)| {
        let isec = objs[obj].section(sec).expect("binned section exists");
        (isec.header.sh_size, isec.header.sh_addralign.max(1))
    };

    let summaries: Vec<ScanState> = members
        .par_chunks(SCAN_BLOCK)
        .map(|block| {
            let mut sum = ScanState {
                offset: 0,
                align: 1,
            };
            for member in block {
                let (size, align) = header_of(member);
                sum.offset = align_to(sum.offset, align) + size;
                sum.align = sum.align.max(align);
            }
            sum
        })
        .collect();

    let mut prefixes = Vec::with_capacity(summaries.len());
    let mut running = ScanState {
        offset: 0,
        align: 1,
    };
    for summary in &summaries {
        prefixes.push(running);
        running = combine(running, *summary);
    }

    let mut offsets = vec![0u64; members.len()];
    offsets
        .par_chunks_mut(SCAN_BLOCK)
        .enumerate()
        .for_each(|(block_index, out)| {
            let mut sum = prefixes[block_index];
            let block = &members[block_index * SCAN_BLOCK..];
            for (slot, member) in out.iter_mut().zip(block) {
                let (size, align) = header_of(member);
                sum.offset = align_to(sum.offset, align);
                *slot = sum.offset;
                sum.offset += size;
                sum.align = sum.align.max(align);
            }
        });

    (offsets, running.offset, running.align)
}

/// Assigns each input section its offset within its output section and
/// finalizes output section sizes and alignments.
#[tracing::instrument(skip_all, name = "Compute section sizes")]
pub(crate) fn compute_section_sizes(ctx: &mut Context) {
    let objs = &ctx.objs;
    let results: Vec<(Vec<u64>, u64, u64)> = ctx
        .output_sections
        .sections
        .par_iter()
        .map(|osec| scan_members(&osec.members, objs))
        .collect();

    for (osec, (_, size, align)) in ctx.output_sections.sections.iter_mut().zip(&results) {
        osec.size = *size;
        osec.alignment = *align;
    }

    let output_sections = &ctx.output_sections;
    let objs = &mut ctx.objs;
    for (osec, (offsets, _, _)) in output_sections.sections.iter().zip(&results) {
        for (&(obj, sec), &offset) in osec.members.iter().zip(offsets) {
            if let Some(isec) = objs[obj].sections[sec].as_mut() {
                isec.offset = offset;
            }
        }
    }
}

/// Appends the non-empty output and merged sections to the chunk table.
/// They were created in file order, which depends only on inputs, but we sort
/// by `(name, type, flags)` to mirror what a parallel creation order would
/// require anyway.
#[tracing::instrument(skip_all, name = "Collect output sections")]
pub(crate) fn collect_output_section_chunks(ctx: &mut Context) {
    enum Source {
        Output(usize),
        Merged(usize),
    }

    let mut pending: Vec<(&[u8], u32, u64, u64, u64, Source)> = Vec::new();
    for (idx, osec) in ctx.output_sections.sections.iter().enumerate() {
        if !osec.members.is_empty() {
            pending.push((
                osec.name,
                osec.sh_type,
                osec.sh_flags,
                osec.size,
                osec.alignment,
                Source::Output(idx),
            ));
        }
    }
    for (idx, merged) in ctx.merged_sections.iter().enumerate() {
        if merged.size > 0 {
            pending.push((
                merged.name,
                merged.sh_type,
                merged.sh_flags,
                merged.size,
                merged.alignment,
                Source::Merged(idx),
            ));
        }
    }
    pending.sort_by_key(|&(name, sh_type, sh_flags, ..)| (name, sh_type, sh_flags));

    for (name, sh_type, sh_flags, size, alignment, source) in pending {
        let chunk_id = ChunkId::new(ctx.chunks.len() as u32);
        let kind = match source {
            Source::Output(idx) => {
                ctx.output_sections.sections[idx].chunk = Some(chunk_id);
                ChunkKind::Output(OutputSectionId::from_usize(idx))
            }
            Source::Merged(idx) => {
                ctx.merged_sections[idx].chunk = Some(chunk_id);
                ChunkKind::Merged(crate::string_merging::MergedSectionId::new(idx))
            }
        };
        ctx.chunks.push(Chunk {
            name,
            shdr: elf::SectionHeader {
                sh_type,
                sh_flags,
                sh_size: size,
                sh_addralign: alignment.max(1),
                ..Default::default()
            },
            shndx: 0,
            kind,
        });
        ctx.chunk_order.push(chunk_id);
    }
}
