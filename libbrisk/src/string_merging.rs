//! Merged sections: deduplicated string pools built from `SHF_MERGE` +
//! `SHF_STRINGS` input sections, keyed by content. `.comment` is one of
//! these; it additionally receives the linker identification string.

use crate::context::Context;
use crate::elf::SymbolPlacement;
use crate::input_file::ObjectFile;
use crate::layout::align_to;
use crate::synthetic::ChunkId;
use hashbrown::HashMap;
use memchr::memchr;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::borrow::Cow;
use std::sync::Mutex;

const LINKER_VERSION: &str = concat!("brisk ", env!("CARGO_PKG_VERSION"));

/// Environment variable that, when non-empty, records the full command line
/// in `.comment` for debugging.
const DEBUG_ENV_VAR: &str = "BRISK_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergedSectionId(u32);

impl MergedSectionId {
    pub(crate) fn new(raw: usize) -> MergedSectionId {
        MergedSectionId(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Fragment {
    align: u64,
    offset: u64,
    is_alive: bool,
}

#[derive(Default)]
struct MergeInner<'data> {
    by_content: HashMap<Cow<'data, [u8]>, u32>,
    frags: Vec<Fragment>,
}

pub struct MergedSection<'data> {
    pub name: &'data [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    inner: Mutex<MergeInner<'data>>,
    pub size: u64,
    pub alignment: u64,
    pub chunk: Option<ChunkId>,
}

impl<'data> MergedSection<'data> {
    fn new(name: &'data [u8], sh_type: u32, sh_flags: u64) -> MergedSection<'data> {
        MergedSection {
            name,
            sh_type,
            sh_flags,
            inner: Mutex::new(MergeInner::default()),
            size: 0,
            alignment: 1,
            chunk: None,
        }
    }

    pub(crate) fn comment() -> MergedSection<'data> {
        MergedSection::new(b".comment", crate::elf::SHT_PROGBITS, 0)
    }

    /// Inserts `bytes`, deduplicating against identical content. Returns the
    /// fragment index.
    pub(crate) fn insert(&self, bytes: Cow<'data, [u8]>, align: u64) -> u32 {
        let align = align.max(1);
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.by_content.get(bytes.as_ref()) {
            let frag = &mut inner.frags[idx as usize];
            frag.align = frag.align.max(align);
            frag.is_alive = true;
            return idx;
        }
        let idx = inner.frags.len() as u32;
        inner.frags.push(Fragment {
            align,
            offset: 0,
            is_alive: true,
        });
        inner.by_content.insert(bytes, idx);
        idx
    }

    /// Assigns every live fragment an offset. Content order is used so the
    /// result doesn't depend on which thread inserted a fragment first.
    pub(crate) fn assign_offsets(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        let MergeInner { by_content, frags } = inner;
        let mut items: Vec<(&[u8], u32)> = by_content
            .iter()
            .map(|(content, &idx)| (content.as_ref(), idx))
            .collect();
        items.sort();
        let mut offset = 0u64;
        let mut alignment = 1u64;
        for (bytes, idx) in items {
            let frag = &mut frags[idx as usize];
            if !frag.is_alive {
                continue;
            }
            offset = align_to(offset, frag.align);
            frag.offset = offset;
            offset += bytes.len() as u64;
            alignment = alignment.max(frag.align);
        }
        self.size = offset;
        self.alignment = alignment;
    }

    pub(crate) fn fragment_offset(&self, idx: u32) -> u64 {
        self.inner.lock().unwrap().frags[idx as usize].offset
    }
}

/// Finds or creates the merged section for `(name, type, flags)`.
pub(crate) fn merged_id_for<'data>(
    merged_sections: &mut Vec<MergedSection<'data>>,
    name: &'data [u8],
    sh_type: u32,
    sh_flags: u64,
) -> MergedSectionId {
    if let Some(idx) = merged_sections
        .iter()
        .position(|m| m.name == name && m.sh_type == sh_type && m.sh_flags == sh_flags)
    {
        return MergedSectionId::new(idx);
    }
    let id = MergedSectionId::new(merged_sections.len());
    merged_sections.push(MergedSection::new(name, sh_type, sh_flags));
    id
}

/// Splits every live merge-section of `file` into fragments and records which
/// fragment each symbol points into.
fn merge_file_sections<'data>(file: &mut ObjectFile<'data>, merged: &[MergedSection<'data>]) {
    let mut per_section: Vec<(usize, MergedSectionId, Vec<u64>, Vec<u32>)> = Vec::new();
    for (sec_index, slot) in file.sections.iter().enumerate() {
        let Some(isec) = slot else { continue };
        if !isec.is_alive {
            continue;
        }
        let Some(merged_id) = isec.merged else {
            continue;
        };
        let section = &merged[merged_id.as_usize()];
        let align = isec.header.sh_addralign.max(1);
        let mut starts = Vec::new();
        let mut frag_ids = Vec::new();
        let mut remaining = isec.data;
        let mut input_offset = 0u64;
        while !remaining.is_empty() {
            // Strings are NUL-terminated; a missing terminator ends the
            // section.
            let len = memchr(0, remaining).map_or(remaining.len(), |i| i + 1);
            let (bytes, rest) = remaining.split_at(len);
            let frag = section.insert(Cow::Borrowed(bytes), align);
            starts.push(input_offset);
            frag_ids.push(frag);
            input_offset += len as u64;
            remaining = rest;
        }
        per_section.push((sec_index, merged_id, starts, frag_ids));
    }

    for (sym_index, esym) in file.elf_syms.iter().enumerate() {
        let SymbolPlacement::Section(sec) = esym.placement else {
            continue;
        };
        let Some((_, merged_id, starts, frag_ids)) =
            per_section.iter().find(|(s, ..)| *s == sec)
        else {
            continue;
        };
        if starts.is_empty() {
            continue;
        }
        let pos = starts.partition_point(|&start| start <= esym.value) - 1;
        let delta = esym.value - starts[pos];
        file.sym_fragments[sym_index] = Some((*merged_id, frag_ids[pos], delta));
    }
}

/// Populates merged sections from the live inputs, adds the linker
/// identification string to `.comment`, then fixes fragment offsets.
#[tracing::instrument(skip_all, name = "Compute merged section sizes")]
pub(crate) fn compute_merged_section_sizes(ctx: &mut Context) {
    {
        let merged = &ctx.merged_sections;
        ctx.objs.par_iter_mut().for_each(|file| {
            if file.is_alive() {
                merge_file_sections(file, merged);
            }
        });
    }

    let comment = &ctx.merged_sections[ctx.comment_section.as_usize()];
    comment.insert(
        Cow::Owned(format!("{LINKER_VERSION}\0").into_bytes()),
        1,
    );
    if let Ok(value) = std::env::var(DEBUG_ENV_VAR) {
        if !value.is_empty() {
            let cmdline = ctx.args.cmdline.join(" ");
            comment.insert(
                Cow::Owned(format!("brisk command line: {cmdline}\0").into_bytes()),
                1,
            );
        }
    }

    ctx.merged_sections
        .par_iter_mut()
        .for_each(MergedSection::assign_offsets);
}
