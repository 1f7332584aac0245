//! Relocation scanning and dynamic slot allocation. The scan ORs requirement
//! bits into each referenced symbol; the allocator then walks the aggregated
//! set once, in file-priority order, handing out dynsym/GOT/PLT/copy-reloc
//! slots deterministically.

use crate::context::Context;
use crate::elf::RelocationClass;
use crate::elf::SHF_ALLOC;
use crate::elf::STT_FUNC;
use crate::elf::STT_GNU_IFUNC;
use crate::elf::SymbolPlacement;
use crate::input_file::FileId;
use crate::symbol_db::NeedsFlags;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolState;
use anyhow::anyhow;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering::Relaxed;

/// Whether a reference to this symbol needs a RELATIVE dynamic relocation in
/// position-independent output: the symbol has a fixed location in the image
/// but the image base doesn't.
fn needs_relative_reloc(ctx: &Context, state: &SymbolState) -> bool {
    if !matches!(state.file, Some(FileId::Object(_))) {
        return false;
    }
    ctx.winning_esym(state)
        .is_some_and(|esym| esym.placement != SymbolPlacement::Absolute)
}

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    let pic = ctx.args.output_kind.is_pic();
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for slot in &file.sections {
            let Some(isec) = slot else { continue };
            if !isec.is_alive || isec.header.sh_flags & u64::from(SHF_ALLOC) == 0 {
                continue;
            }
            for rel in &isec.relocations {
                let Some(&Some(id)) = file.symbols.get(rel.symbol) else {
                    // References to locals never need dynamic support.
                    continue;
                };
                let sym = db.symbol(id);
                let state = sym.state();
                if state.file.is_none() {
                    // Weak undefined; resolves to zero. Strong undefineds
                    // were reported by the claim pass.
                    continue;
                }
                let sym_type = ctx.symbol_type(&state);
                if sym_type == STT_GNU_IFUNC {
                    sym.add_needs(NeedsFlags::GOT | NeedsFlags::PLT);
                }
                let is_func = sym_type == STT_FUNC;
                match rel.class {
                    RelocationClass::Absolute => {
                        if state.is_imported {
                            if is_func {
                                sym.add_needs(NeedsFlags::PLT);
                            } else if !pic {
                                sym.add_needs(NeedsFlags::COPYREL);
                            } else {
                                ctx.num_dynrel_addressable.fetch_add(1, Relaxed);
                            }
                        } else if pic && needs_relative_reloc(ctx, &state) {
                            ctx.num_dynrel_relative.fetch_add(1, Relaxed);
                        }
                    }
                    RelocationClass::PcRelative => {
                        if state.is_imported {
                            if is_func {
                                sym.add_needs(NeedsFlags::PLT);
                            } else if !pic {
                                sym.add_needs(NeedsFlags::COPYREL);
                            } else {
                                ctx.error(anyhow!(
                                    "{}: direct reference to imported symbol {}; \
                                     recompile with -fPIC",
                                    file,
                                    sym.name()
                                ));
                            }
                        }
                    }
                    RelocationClass::PltCall => {
                        if state.is_imported {
                            sym.add_needs(NeedsFlags::PLT);
                        }
                    }
                    RelocationClass::Got => sym.add_needs(NeedsFlags::GOT),
                    RelocationClass::GotTp => sym.add_needs(NeedsFlags::GOTTP),
                    RelocationClass::TlsGd => sym.add_needs(NeedsFlags::TLSGD),
                    RelocationClass::TlsLd => sym.add_needs(NeedsFlags::TLSLD),
                    RelocationClass::TlsDesc => sym.add_needs(NeedsFlags::TLSDESC),
                }
            }
        }
    });
}

fn set_aux(ctx: &mut Context, id: SymbolId, f: impl FnOnce(&mut crate::symbol_db::SymbolAux)) {
    let aux_idx = ctx
        .symbol_db
        .symbol(id)
        .state()
        .aux_idx
        .expect("aux slot allocated before use");
    f(&mut ctx.symbol_aux[aux_idx as usize]);
}

fn add_dynsym(ctx: &mut Context, id: SymbolId) {
    let aux_idx = ctx.ensure_aux(id);
    if ctx.symbol_aux[aux_idx].dynsym_idx.is_some() {
        return;
    }
    let dynsym_idx = 1 + ctx.dynsym.symbols.len() as u32;
    ctx.dynsym.symbols.push(id);
    ctx.symbol_aux[aux_idx].dynsym_idx = Some(dynsym_idx);
    let name = ctx.symbol_db.symbol(id).name().bytes();
    ctx.dynstr.add(name);
}

fn copy_alignment(size: u64) -> u64 {
    if size == 0 {
        8
    } else {
        size.next_power_of_two().min(64)
    }
}

fn allocate_copy_relocation(ctx: &mut Context, id: SymbolId, state: &SymbolState) {
    let Some(FileId::Shared(dso_index)) = state.file else {
        ctx.error(anyhow!(
            "copy relocation against symbol {} not defined by a shared object",
            ctx.symbol_db.symbol(id).name()
        ));
        return;
    };
    let dso = &ctx.dsos[dso_index];
    let Some(esym) = dso.elf_syms.get(state.local_idx as usize) else {
        return;
    };
    let size = esym.size;
    let readonly = dso.is_readonly(esym.value);
    let aliases = dso.find_aliases(esym.value, id);

    let align = copy_alignment(size);
    let offset = if readonly {
        ctx.dynbss_relro.alloc(id, size, align)
    } else {
        ctx.dynbss.alloc(id, size, align)
    };
    ctx.symbol_db.symbol(id).update(|s| {
        s.has_copyrel = true;
        s.copyrel_readonly = readonly;
        s.is_exported = true;
        s.value = offset;
    });

    // Every alias resolves to the copied location, otherwise the runtime
    // would see two addresses for one variable.
    for alias in aliases {
        ctx.ensure_aux(alias);
        ctx.symbol_db.symbol(alias).update(|s| {
            s.is_imported = true;
            s.is_exported = true;
            s.has_copyrel = true;
            s.copyrel_readonly = readonly;
            s.value = offset;
        });
        add_dynsym(ctx, alias);
    }
}

/// Walks the symbols the scan flagged (plus everything imported or exported)
/// and assigns their table slots. Requirement bits are cleared afterwards so
/// a repeated call cannot double-allocate.
#[tracing::instrument(skip_all, name = "Assign dynamic slots")]
pub(crate) fn assign_dynamic_slots(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    let wants_slot = |file_id: FileId, id: SymbolId| {
        let sym = db.symbol(id);
        let state = sym.state();
        state.file == Some(file_id)
            && (!sym.needs().is_empty() || state.is_imported || state.is_exported)
    };
    let from_objs: Vec<Vec<SymbolId>> = ctx
        .objs
        .par_iter()
        .enumerate()
        .map(|(i, file)| {
            if !file.is_alive() {
                return Vec::new();
            }
            file.globals()
                .filter(|(_, _, id)| wants_slot(FileId::Object(i), *id))
                .map(|(_, _, id)| id)
                .collect()
        })
        .collect();
    let from_dsos: Vec<Vec<SymbolId>> = ctx
        .dsos
        .par_iter()
        .enumerate()
        .map(|(j, file)| {
            if !file.is_alive() {
                return Vec::new();
            }
            file.globals()
                .filter(|(_, _, id)| wants_slot(FileId::Shared(j), *id))
                .map(|(_, _, id)| id)
                .collect()
        })
        .collect();
    let queue: Vec<SymbolId> = from_objs.into_iter().chain(from_dsos).flatten().collect();

    let pic = ctx.args.output_kind.is_pic();
    let has_dynamic = ctx.has_dynamic_section();

    for id in queue {
        ctx.ensure_aux(id);
        let state = ctx.symbol_db.symbol(id).state();
        let needs = ctx.symbol_db.symbol(id).needs();

        if has_dynamic && (state.is_imported || state.is_exported) {
            add_dynsym(ctx, id);
        }

        if needs.contains(NeedsFlags::GOT) {
            let slot = ctx.got.alloc_slots(1);
            ctx.got.got_syms.push(id);
            set_aux(ctx, id, |aux| aux.got_idx = Some(slot));
        }

        if needs.contains(NeedsFlags::PLT) {
            // A canonical PLT entry becomes the symbol's address in a
            // non-PIC executable, so the symbol is both imported and
            // exported.
            let canonical = !pic && state.is_imported;
            if canonical {
                ctx.symbol_db.symbol(id).update(|s| s.is_exported = true);
            }
            if needs.contains(NeedsFlags::GOT) && !canonical {
                let idx = ctx.pltgot.symbols.len() as u32;
                ctx.pltgot.symbols.push(id);
                set_aux(ctx, id, |aux| aux.pltgot_idx = Some(idx));
            } else {
                // A canonical PLT can't go in .plt.got: .plt.got entries
                // load from .got, and the .got entry would in turn point at
                // the canonical PLT.
                let idx = ctx.plt.symbols.len() as u32;
                ctx.plt.symbols.push(id);
                set_aux(ctx, id, |aux| aux.plt_idx = Some(idx));
            }
        }

        if needs.contains(NeedsFlags::GOTTP) {
            let slot = ctx.got.alloc_slots(1);
            ctx.got.gottp_syms.push(id);
            set_aux(ctx, id, |aux| aux.gottp_idx = Some(slot));
        }
        if needs.contains(NeedsFlags::TLSGD) {
            let slot = ctx.got.alloc_slots(2);
            ctx.got.tlsgd_syms.push(id);
            set_aux(ctx, id, |aux| aux.tlsgd_idx = Some(slot));
        }
        if needs.contains(NeedsFlags::TLSDESC) {
            let slot = ctx.got.alloc_slots(2);
            ctx.got.tlsdesc_syms.push(id);
            set_aux(ctx, id, |aux| aux.tlsdesc_idx = Some(slot));
        }
        if needs.contains(NeedsFlags::TLSLD) {
            ctx.got.add_tlsld();
        }
        if needs.contains(NeedsFlags::COPYREL) {
            allocate_copy_relocation(ctx, id, &state);
        }

        ctx.symbol_db.symbol(id).clear_needs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_alignment_follows_size() {
        assert_eq!(copy_alignment(0), 8);
        assert_eq!(copy_alignment(1), 1);
        assert_eq!(copy_alignment(4), 4);
        assert_eq!(copy_alignment(24), 32);
        assert_eq!(copy_alignment(4096), 64);
    }
}
