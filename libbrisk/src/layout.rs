//! Output layout: orders the chunk list, assigns virtual addresses and file
//! offsets, and binds the linker-synthesized symbols to their final
//! addresses.

use crate::context::Context;
use crate::elf;
use crate::elf::SymbolPlacement;
use crate::input_file::FileId;
use crate::symbol_db::SymbolId;
use crate::synthetic::ChunkId;
use crate::synthetic::ChunkKind;
use std::mem::take;

pub(crate) fn align_to(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Returns the smallest `n` such that `n >= value` and
/// `n % align == skew % align`.
pub(crate) fn align_with_skew(value: u64, align: u64, skew: u64) -> u64 {
    let skew = skew % align;
    align_to(value + align - skew, align) - align + skew
}

fn is_relro(ctx: &Context, id: ChunkId) -> bool {
    if !ctx.args.z_relro {
        return false;
    }
    if id == ctx.ids.got || id == ctx.ids.dynamic || id == ctx.ids.dynbss_relro {
        return true;
    }
    let chunk = ctx.chunk(id);
    matches!(
        chunk.shdr.sh_type,
        elf::SHT_INIT_ARRAY | elf::SHT_FINI_ARRAY | elf::SHT_PREINIT_ARRAY
    ) || chunk.name == b".ctors"
        || chunk.name == b".dtors"
        || chunk.name.ends_with(b".rel.ro")
}

/// Total order over output chunks:
///
///   ELF header, program header, .interp,
///   alloc notes (by alignment),
///   alloc sections keyed by (writable, executable, !tls, !relro, bss),
///   non-alloc sections,
///   section header.
fn get_section_rank(ctx: &Context, id: ChunkId) -> u64 {
    if id == ctx.ids.ehdr {
        return 0;
    }
    if id == ctx.ids.phdr {
        return 1;
    }
    if Some(id) == ctx.ids.interp {
        return 2;
    }
    if id == ctx.ids.shdr {
        return 1 << 30;
    }
    let chunk = ctx.chunk(id);
    let flags = chunk.shdr.sh_flags;
    if chunk.shdr.sh_type == elf::SHT_NOTE && chunk.shdr.is_alloc() {
        return (1 << 10) + chunk.shdr.sh_addralign;
    }
    if !chunk.shdr.is_alloc() {
        return (1 << 30) - 1;
    }
    let writable = u64::from(flags & u64::from(elf::SHF_WRITE) != 0);
    let exec = u64::from(flags & u64::from(elf::SHF_EXECINSTR) != 0);
    let tls = u64::from(chunk.shdr.is_tls());
    let relro = u64::from(is_relro(ctx, id));
    let is_bss = u64::from(chunk.shdr.is_nobits());
    (1 << 20)
        | (writable << 19)
        | (exec << 18)
        | ((1 - tls) << 17)
        | ((1 - relro) << 16)
        | (is_bss << 15)
}

/// Chunks that sizing decided are empty don't appear in the output at all.
#[tracing::instrument(skip_all, name = "Prune empty chunks")]
pub(crate) fn prune_empty_chunks(ctx: &mut Context) {
    let mut order = take(&mut ctx.chunk_order);
    order.retain(|&id| {
        let chunk = ctx.chunk(id);
        chunk.is_header() || chunk.shdr.sh_size != 0
    });
    ctx.chunk_order = order;
}

#[tracing::instrument(skip_all, name = "Sort chunks")]
pub(crate) fn sort_chunks(ctx: &mut Context) {
    let mut order = take(&mut ctx.chunk_order);
    order.sort_by_key(|&id| get_section_rank(ctx, id));
    ctx.chunk_order = order;
}

fn page_permissions(ctx: &Context, id: ChunkId) -> u32 {
    let chunk = ctx.chunk(id);
    let mut perms = 4; // readable
    if chunk.shdr.sh_flags & u64::from(elf::SHF_WRITE) != 0 {
        perms |= 2;
    }
    if chunk.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
        perms |= 1;
    }
    perms
}

/// Whether two adjacent chunks must go in different PT_LOAD segments.
fn separate_page(ctx: &Context, a: ChunkId, b: ChunkId) -> bool {
    page_permissions(ctx, a) != page_permissions(ctx, b) || is_relro(ctx, a) != is_relro(ctx, b)
}

fn count_segments(ctx: &Context) -> u64 {
    let mut num = 1; // PT_PHDR
    let mut prev_load: Option<ChunkId> = None;
    let mut prev_was_note = false;
    let mut has_tls = false;
    let mut has_relro = false;
    for &id in &ctx.chunk_order {
        let chunk = ctx.chunk(id);
        if !chunk.shdr.is_alloc() {
            continue;
        }
        match prev_load {
            Some(prev) if !separate_page(ctx, prev, id) => {}
            _ => num += 1, // a new PT_LOAD
        }
        prev_load = Some(id);
        if chunk.shdr.sh_type == elf::SHT_NOTE {
            if !prev_was_note {
                num += 1; // one PT_NOTE per run of notes
            }
            prev_was_note = true;
        } else {
            prev_was_note = false;
        }
        has_tls |= chunk.shdr.is_tls();
        has_relro |= is_relro(ctx, id);
    }
    if ctx
        .ids
        .interp
        .is_some_and(|id| ctx.chunk(id).shdr.sh_size != 0)
    {
        num += 1; // PT_INTERP
    }
    if ctx.chunk(ctx.ids.dynamic).shdr.sh_size != 0 {
        num += 1; // PT_DYNAMIC
    }
    if ctx
        .ids
        .eh_frame_hdr
        .is_some_and(|id| ctx.chunk(id).shdr.sh_size != 0)
    {
        num += 1; // PT_GNU_EH_FRAME
    }
    if has_tls {
        num += 1; // PT_TLS
    }
    if has_relro {
        num += 1; // PT_GNU_RELRO
    }
    num += 1; // PT_GNU_STACK
    num
}

/// Assigns section indices and the header sizes that depend on the final
/// chunk list, and fills in section-header link fields.
#[tracing::instrument(skip_all, name = "Finalize headers")]
pub(crate) fn finalise_header_sizes(ctx: &mut Context) {
    let order = ctx.chunk_order.clone();

    let mut shndx = 1u32;
    let mut shstrtab_size = 1u64;
    for &id in &order {
        if ctx.chunk(id).is_header() {
            continue;
        }
        ctx.chunk_mut(id).shndx = shndx;
        shndx += 1;
        let name_len = ctx.chunk(id).name.len() as u64;
        if name_len != 0 {
            shstrtab_size += name_len + 1;
        }
    }

    let shstrtab = ctx.ids.shstrtab;
    ctx.chunk_mut(shstrtab).shdr.sh_size = shstrtab_size;

    let num_sections = u64::from(shndx);
    let ehdr = ctx.ids.ehdr;
    ctx.chunk_mut(ehdr).shdr.sh_size = ctx.arch.ehdr_size;
    let shdr = ctx.ids.shdr;
    ctx.chunk_mut(shdr).shdr.sh_size = num_sections * ctx.arch.shdr_entry_size;
    ctx.num_segments = count_segments(ctx);
    let phdr = ctx.ids.phdr;
    ctx.chunk_mut(phdr).shdr.sh_size = ctx.num_segments * ctx.arch.phdr_entry_size;

    let dynsym_idx = ctx.chunk(ctx.ids.dynsym).shndx;
    let dynstr_idx = ctx.chunk(ctx.ids.dynstr).shndx;
    let strtab_idx = ctx.chunk(ctx.ids.strtab).shndx;
    let gotplt_idx = ctx.chunk(ctx.ids.gotplt).shndx;
    let mut set_link = |id: Option<ChunkId>, link: u32| {
        if let Some(id) = id {
            ctx.chunks[id.as_usize()].shdr.sh_link = link;
        }
    };
    set_link(Some(ctx.ids.reldyn), dynsym_idx);
    set_link(Some(ctx.ids.relplt), dynsym_idx);
    set_link(ctx.ids.hash, dynsym_idx);
    set_link(ctx.ids.gnu_hash, dynsym_idx);
    set_link(Some(ctx.ids.versym), dynsym_idx);
    set_link(Some(ctx.ids.verneed), dynstr_idx);
    set_link(ctx.ids.verdef, dynstr_idx);
    set_link(Some(ctx.ids.dynsym), dynstr_idx);
    set_link(Some(ctx.ids.dynamic), dynstr_idx);
    set_link(Some(ctx.ids.symtab), strtab_idx);
    let relplt = ctx.ids.relplt;
    ctx.chunk_mut(relplt).shdr.sh_info = gotplt_idx;
    let dynsym = ctx.ids.dynsym;
    ctx.chunk_mut(dynsym).shdr.sh_info = 1;
}

/// Assigns virtual addresses and file offsets to every chunk, in sorted
/// order. Returns the output file size.
#[tracing::instrument(skip_all, name = "Assign addresses and offsets")]
pub(crate) fn set_osec_offsets(ctx: &mut Context) -> u64 {
    let order = ctx.chunk_order.clone();
    let page_size = ctx.arch.page_size;

    // Virtual addresses. A chunk whose permissions or RELRO status differ
    // from its predecessor starts a new page. TBSS gets an address but does
    // not advance the cursor.
    let mut addr = ctx.args.image_base;
    let mut prev: Option<ChunkId> = None;
    for &id in &order {
        if !ctx.chunk(id).shdr.is_alloc() {
            continue;
        }
        if let Some(prev) = prev {
            if separate_page(ctx, prev, id) {
                addr = align_to(addr, page_size);
            }
        }
        prev = Some(id);
        if ctx.chunk(id).is_tbss() {
            ctx.chunk_mut(id).shdr.sh_addr = addr;
            continue;
        }
        addr = align_to(addr, ctx.chunk(id).shdr.sh_addralign.max(1));
        ctx.chunk_mut(id).shdr.sh_addr = addr;
        addr += ctx.chunk(id).shdr.sh_size;
    }

    // TBSS chunks overlap whatever follows them: the zero-initialised tail of
    // a TLS template image is never read at runtime, and overlapping saves a
    // PT_LOAD segment.
    let mut i = 0;
    while i < order.len() {
        if !ctx.chunk(order[i]).is_tbss() {
            i += 1;
            continue;
        }
        let mut tbss_addr = ctx.chunk(order[i]).shdr.sh_addr;
        while i < order.len() && ctx.chunk(order[i]).is_tbss() {
            let id = order[i];
            tbss_addr = align_to(tbss_addr, ctx.chunk(id).shdr.sh_addralign.max(1));
            ctx.chunk_mut(id).shdr.sh_addr = tbss_addr;
            tbss_addr += ctx.chunk(id).shdr.sh_size;
            i += 1;
        }
    }

    // File offsets: NOBITS consumes no file space; everything else lands on
    // the smallest offset congruent to its address modulo the page size.
    let mut fileoff = 0u64;
    for &id in &order {
        if ctx.chunk(id).shdr.is_nobits() {
            ctx.chunk_mut(id).shdr.sh_offset = fileoff;
        } else {
            fileoff = align_with_skew(fileoff, page_size, ctx.chunk(id).shdr.sh_addr);
            ctx.chunk_mut(id).shdr.sh_offset = fileoff;
            fileoff += ctx.chunk(id).shdr.sh_size;
        }
    }
    fileoff
}

fn parse_defsym_addr(expr: &str) -> Option<u64> {
    if let Some(hex) = expr.strip_prefix("0x").or_else(|| expr.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if !expr.is_empty() && expr.bytes().all(|b| b.is_ascii_digit()) {
        return expr.parse().ok();
    }
    None
}

/// Output section index of the chunk a symbol's definition landed in.
fn symbol_shndx(ctx: &Context, id: SymbolId) -> u32 {
    let state = ctx.symbol_db.symbol(id).state();
    let Some(FileId::Object(i)) = state.file else {
        return 0;
    };
    let file = &ctx.objs[i];
    let Some(esym) = file.elf_syms.get(state.local_idx as usize) else {
        return 0;
    };
    let SymbolPlacement::Section(sec) = esym.placement else {
        return 0;
    };
    let Some(isec) = file.section(sec) else { return 0 };
    let Some(osec) = isec.output_section else {
        return 0;
    };
    let Some(chunk) = ctx.output_sections.get(osec).chunk else {
        return 0;
    };
    ctx.chunk(chunk).shndx
}

/// Binds the well-known linker-synthesized symbols to their final addresses.
#[tracing::instrument(skip_all, name = "Fix synthetic symbols")]
pub(crate) fn fix_synthetic_symbols(ctx: &Context) {
    let Some(internal_index) = ctx.internal_obj else {
        return;
    };
    let internal = FileId::Object(internal_index);
    let db = &ctx.symbol_db;

    let set = |name: &str, shndx: u32, value: u64| {
        let Some(id) = db.get(name.as_bytes()) else {
            return;
        };
        let sym = db.symbol(id);
        if sym.state().file == Some(internal) {
            sym.update(|s| {
                s.shndx = shndx;
                s.value = value;
            });
        }
    };
    let start_of = |id: ChunkId| {
        let chunk = ctx.chunk(id);
        (chunk.shndx, chunk.shdr.sh_addr)
    };
    let end_of = |id: ChunkId| {
        let chunk = ctx.chunk(id);
        (chunk.shndx, chunk.shdr.sh_addr + chunk.shdr.sh_size)
    };

    // __bss_start points at the first .bss output section.
    for &id in &ctx.chunk_order {
        let chunk = ctx.chunk(id);
        if matches!(chunk.kind, ChunkKind::Output(_)) && chunk.name == b".bss" {
            let (shndx, value) = start_of(id);
            set("__bss_start", shndx, value);
            break;
        }
    }

    let ehdr_addr = ctx.chunk(ctx.ids.ehdr).shdr.sh_addr;
    set("__ehdr_start", 1, ehdr_addr);
    set("__executable_start", 1, ehdr_addr);

    // The IRELATIVE entries sit at the front of .rela.dyn.
    let (iplt_start_name, iplt_end_name) = ctx.arch.iplt_symbol_names();
    let (reldyn_shndx, reldyn_addr) = start_of(ctx.ids.reldyn);
    let num_irelative = crate::synthetic::num_irelative_relocs(ctx);
    set(iplt_start_name, reldyn_shndx, reldyn_addr);
    set(
        iplt_end_name,
        reldyn_shndx,
        reldyn_addr + num_irelative * ctx.arch.rel_size,
    );

    for &id in &ctx.chunk_order {
        match ctx.chunk(id).shdr.sh_type {
            elf::SHT_INIT_ARRAY => {
                let (shndx, value) = start_of(id);
                set("__init_array_start", shndx, value);
                let (shndx, value) = end_of(id);
                set("__init_array_end", shndx, value);
            }
            elf::SHT_FINI_ARRAY => {
                let (shndx, value) = start_of(id);
                set("__fini_array_start", shndx, value);
                let (shndx, value) = end_of(id);
                set("__fini_array_end", shndx, value);
            }
            _ => {}
        }
    }

    // _end/_etext/_edata trail the last chunk of their class.
    for &id in &ctx.chunk_order {
        let chunk = ctx.chunk(id);
        if chunk.is_header() {
            continue;
        }
        let (shndx, value) = end_of(id);
        if chunk.shdr.is_alloc() {
            set("_end", shndx, value);
            set("end", shndx, value);
        }
        if chunk.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
            set("_etext", shndx, value);
            set("etext", shndx, value);
        }
        if !chunk.shdr.is_nobits() && chunk.shdr.is_alloc() {
            set("_edata", shndx, value);
            set("edata", shndx, value);
        }
    }

    let (shndx, value) = start_of(ctx.ids.dynamic);
    set("_DYNAMIC", shndx, value);

    let got_chunk = if ctx.arch.global_offset_table_in_got_plt() {
        ctx.ids.gotplt
    } else {
        ctx.ids.got
    };
    let (shndx, value) = start_of(got_chunk);
    set("_GLOBAL_OFFSET_TABLE_", shndx, value);

    if let Some(id) = ctx.ids.eh_frame_hdr {
        let (shndx, value) = start_of(id);
        set("__GNU_EH_FRAME_HDR", shndx, value);
    }

    // __start_<sec>/__stop_<sec> bind to the boundaries of the chunk with
    // that exact name; with no such chunk they stay zero.
    for (id, sym) in db.symbols_iter() {
        if sym.state().file != Some(internal) {
            continue;
        }
        let name = sym.name().bytes();
        let (section_name, is_start) = if let Some(s) = name.strip_prefix(b"__start_") {
            (s, true)
        } else if let Some(s) = name.strip_prefix(b"__stop_") {
            (s, false)
        } else {
            continue;
        };
        if !crate::elf::is_c_identifier(section_name) {
            continue;
        }
        let Some(&chunk_id) = ctx
            .chunk_order
            .iter()
            .find(|&&cid| ctx.chunk(cid).name == section_name)
        else {
            continue;
        };
        let (shndx, value) = if is_start {
            start_of(chunk_id)
        } else {
            end_of(chunk_id)
        };
        db.symbol(id).update(|s| {
            s.shndx = shndx;
            s.value = value;
        });
    }

    // Copy-relocated symbols live in their .dynbss slot.
    for (chunk_id, section) in [
        (ctx.ids.dynbss, &ctx.dynbss),
        (ctx.ids.dynbss_relro, &ctx.dynbss_relro),
    ] {
        let shndx = ctx.chunk(chunk_id).shndx;
        for &sym_id in &section.symbols {
            db.symbol(sym_id).update(|s| s.shndx = shndx);
        }
    }

    // --defsym: a literal right-hand side is an absolute value; a symbolic
    // one takes the referenced symbol's address and visibility.
    for (name, expr) in &ctx.args.defsyms {
        let Some(id) = db.get(name.as_bytes()) else {
            continue;
        };
        if let Some(addr) = parse_defsym_addr(expr) {
            db.symbol(id).update(|s| {
                s.value = addr;
                s.shndx = 0;
            });
            continue;
        }
        let target = db
            .get(expr.as_bytes())
            .filter(|&tid| db.symbol(tid).state().file.is_some());
        let Some(target) = target else {
            ctx.error(anyhow::anyhow!("--defsym: undefined symbol: {expr}"));
            continue;
        };
        let address = ctx.symbol_address(target);
        let target_state = db.symbol(target).state();
        let shndx = symbol_shndx(ctx, target);
        db.symbol(id).update(|s| {
            s.value = address;
            s.visibility = target_state.visibility;
            s.shndx = shndx;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 1), 9);
        assert_eq!(align_to(9, 0), 9);
    }

    #[test]
    fn align_with_skew_is_minimal_and_congruent() {
        for &(value, align, skew) in &[
            (0u64, 4096u64, 0u64),
            (1, 4096, 0),
            (100, 4096, 52),
            (5000, 4096, 52),
            (4148, 4096, 52),
            (12345, 65536, 999),
        ] {
            let n = align_with_skew(value, align, skew);
            assert!(n >= value);
            assert_eq!(n % align, skew % align, "value={value} skew={skew}");
            assert!(n < value + align);
        }
    }

    #[test]
    fn defsym_literal_parsing() {
        assert_eq!(parse_defsym_addr("0x1000"), Some(0x1000));
        assert_eq!(parse_defsym_addr("0X20"), Some(0x20));
        assert_eq!(parse_defsym_addr("4096"), Some(4096));
        assert_eq!(parse_defsym_addr("other_sym"), None);
        assert_eq!(parse_defsym_addr("0x10garbage"), None);
        assert_eq!(parse_defsym_addr(""), None);
    }
}
