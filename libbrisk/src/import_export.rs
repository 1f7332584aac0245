//! Decides, for every resolved global, whether it is imported from a shared
//! object, exported to the dynamic symbol table, or both. Classification is
//! monotone: passes only ever turn the bits on.

use crate::context::Context;
use crate::elf::STT_FUNC;
use crate::elf::STV_HIDDEN;
use crate::elf::STV_PROTECTED;
use crate::elf::VER_NDX_LOCAL;
use crate::input_file::FileId;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;

#[tracing::instrument(skip_all, name = "Compute import/export")]
pub(crate) fn compute_import_export(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    let shared = ctx.args.output_kind.is_shared_object();

    // Symbols that DSOs reference and a regular object defines must be
    // visible to the runtime linker.
    if !shared {
        let objs = &ctx.objs;
        ctx.dsos.par_iter().for_each(|file| {
            if !file.is_alive() {
                return;
            }
            for (_, _, id) in file.globals() {
                let sym = db.symbol(id);
                let state = sym.state();
                let Some(FileId::Object(oi)) = state.file else {
                    continue;
                };
                if state.visibility == STV_HIDDEN || objs[oi].exclude_libs {
                    continue;
                }
                sym.update(|s| s.is_exported = true);
            }
        });
    }

    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            return;
        }
        for (_, _, id) in file.globals() {
            let sym = db.symbol(id);
            let state = sym.state();
            let Some(winner) = state.file else { continue };
            if state.visibility == STV_HIDDEN || state.ver_idx == VER_NDX_LOCAL {
                continue;
            }
            if winner != FileId::Object(i) && winner.is_dso() {
                sym.update(|s| s.is_imported = true);
                continue;
            }
            if winner == FileId::Object(i) {
                if file.exclude_libs {
                    continue;
                }
                sym.update(|s| s.is_exported = true);
                // In a shared object, a default-visibility definition can be
                // interposed at runtime unless -Bsymbolic says otherwise.
                if shared
                    && state.visibility != STV_PROTECTED
                    && !ctx.args.b_symbolic
                    && !(ctx.args.b_symbolic_functions && ctx.symbol_type(&state) == STT_FUNC)
                {
                    sym.update(|s| s.is_imported = true);
                }
            }
        }
    });
}
