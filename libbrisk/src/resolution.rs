//! Resolves symbol references between inputs, decides which archive members
//! and shared objects take part in the link, and de-duplicates comdat groups.
//!
//! Definitions are installed concurrently; each symbol record is guarded by
//! its own lock and the `(tier, priority)` tie-break is total, so the outcome
//! is independent of scheduling. Archive members are pulled in by a
//! work-stealing graph traversal that feeds newly loaded files back into the
//! pool.

use crate::context::Context;
use crate::elf::InputSectionHeader;
use crate::elf::InputSymbol;
use crate::elf::SymbolPlacement;
use crate::elf::SHF_ALLOC;
use crate::elf::SHF_TLS;
use crate::elf::SHF_WRITE;
use crate::elf::SHT_NOBITS;
use crate::elf::STB_GLOBAL;
use crate::elf::STB_LOCAL;
use crate::elf::STT_NOTYPE;
use crate::elf::STT_TLS;
use crate::elf::STV_DEFAULT;
use crate::elf::STV_HIDDEN;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::input_file::SharedFile;
use crate::symbol_db::Candidate;
use crate::symbol_db::DefinitionTier;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::anyhow;
use crossbeam_queue::SegQueue;
use foldhash::HashMap;
use foldhash::HashMapExt;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

/// Marks archive members named by `--exclude-libs`; their symbols are kept
/// out of the dynamic symbol table.
#[tracing::instrument(skip_all, name = "Apply exclude-libs")]
pub(crate) fn apply_exclude_libs(ctx: &mut Context) {
    if ctx.args.exclude_libs.is_empty() {
        return;
    }
    let all = ctx.args.exclude_libs.iter().any(|name| name == "ALL");
    for file in &mut ctx.objs {
        let Some(archive) = &file.archive_name else {
            continue;
        };
        let basename = archive.rsplit('/').next().unwrap_or(archive.as_str());
        if all || ctx.args.exclude_libs.iter().any(|name| name == basename) {
            file.exclude_libs = true;
        }
    }
}

/// Installs the winning definition for every global, then walks the
/// reference graph to decide which archive members and DSOs are live.
#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub(crate) fn resolve_symbols(ctx: &mut Context) {
    let db = &ctx.symbol_db;

    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        install_object_definitions(db, FileId::Object(i), file, file.lazy && !file.is_alive());
    });
    ctx.dsos.par_iter().enumerate().for_each(|(j, file)| {
        install_dso_definitions(db, FileId::Shared(j), file);
    });

    // Roots of the reachability sweep: every file given directly on the
    // command line, plus symbols the user asked for explicitly.
    let mut roots: Vec<usize> = ctx
        .objs
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_alive())
        .map(|(i, _)| i)
        .collect();
    let root_names = ctx
        .args
        .undefined
        .iter()
        .chain(&ctx.args.require_defined)
        .chain(&ctx.args.entry);
    for name in root_names {
        let Some(id) = db.get(name.as_bytes()) else {
            continue;
        };
        if let Some(FileId::Object(i)) = db.symbol(id).state().file {
            if ctx.objs[i].mark_alive() {
                install_object_definitions(db, FileId::Object(i), &ctx.objs[i], false);
                roots.push(i);
            }
        }
    }

    {
        let objs = &ctx.objs;
        let loaded = &SegQueue::new();
        rayon::scope(|scope| {
            for i in roots {
                scope.spawn(move |scope| mark_live_objects(db, objs, loaded, i, scope));
            }
        });
        if !loaded.is_empty() {
            tracing::debug!(loaded_archive_members = loaded.len());
        }
    }

    // Definitions published by eliminated archive members are withdrawn as if
    // they had never been seen.
    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            for (_, _, id) in file.globals() {
                db.symbol(id).reset_if_owned_by(FileId::Object(i));
            }
        }
    });

    // DSOs referenced by an undefined of a live object are needed at runtime.
    {
        let dsos = &ctx.dsos;
        ctx.objs.par_iter().for_each(|file| {
            if !file.is_alive() {
                return;
            }
            for (_, esym, id) in file.globals() {
                if !esym.is_undefined() {
                    continue;
                }
                let sym = db.symbol(id);
                if let Some(FileId::Shared(j)) = sym.state().file {
                    dsos[j].mark_alive();
                    if esym.is_undefined_strong() {
                        sym.update(|s| s.is_weak = false);
                    }
                }
            }
        });

        // DSOs referenced by live DSOs are alive too, to a fixed point.
        let dso_roots: Vec<usize> = dsos
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_alive())
            .map(|(j, _)| j)
            .collect();
        rayon::scope(|scope| {
            for j in dso_roots {
                scope.spawn(move |scope| mark_live_dsos(db, dsos, j, scope));
            }
        });
    }

    ctx.dsos.par_iter().enumerate().for_each(|(j, file)| {
        if !file.is_alive() {
            for (_, _, id) in file.globals() {
                db.symbol(id).reset_if_owned_by(FileId::Shared(j));
            }
        }
    });

    // Tentative definitions are resolved last, over the survivors only.
    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            return;
        }
        for (idx, esym, id) in file.globals() {
            if esym.is_common() {
                db.symbol(id).install(Candidate {
                    file: FileId::Object(i),
                    tier: DefinitionTier::Common,
                    priority: file.priority,
                    local_idx: idx as u32,
                    value: esym.value,
                    visibility: esym.visibility,
                    is_weak: esym.is_weak(),
                });
            }
        }
    });

    let gcc_lto = db
        .get(b"__gnu_lto_slim")
        .and_then(|id| db.symbol(id).state().file);
    if let Some(file) = gcc_lto {
        tracing::warn!(
            file = %ctx.file_display(file),
            "looks like GCC intermediate code, which is not supported; \
             continuing with incomplete semantics"
        );
        ctx.gcc_lto = true;
    }
}

fn install_object_definitions<'data>(
    db: &SymbolDb<'data>,
    file_id: FileId,
    file: &ObjectFile<'data>,
    as_lazy: bool,
) {
    for (idx, esym, id) in file.globals() {
        if !esym.is_defined() {
            continue;
        }
        let tier = if as_lazy {
            DefinitionTier::Lazy
        } else if esym.is_weak() {
            DefinitionTier::Weak
        } else {
            DefinitionTier::Strong
        };
        db.symbol(id).install(Candidate {
            file: file_id,
            tier,
            priority: file.priority,
            local_idx: idx as u32,
            value: esym.value,
            visibility: esym.visibility,
            is_weak: esym.is_weak(),
        });
    }
}

fn install_dso_definitions<'data>(
    db: &SymbolDb<'data>,
    file_id: FileId,
    file: &SharedFile<'data>,
) {
    for (idx, esym, id) in file.globals() {
        if esym.is_undefined() {
            continue;
        }
        db.symbol(id).install(Candidate {
            file: file_id,
            tier: DefinitionTier::Dso,
            priority: file.priority,
            local_idx: idx as u32,
            value: esym.value,
            visibility: esym.visibility,
            is_weak: esym.is_weak(),
        });
    }
}

/// One step of the liveness BFS: a strong undefined (or tentative) reference
/// whose winning definition sits in a not-yet-loaded archive member drags
/// that member in. Loading upgrades the member's lazy claims to regular
/// definitions and feeds it back into the traversal.
fn mark_live_objects<'scope, 'data: 'scope>(
    db: &'scope SymbolDb<'data>,
    objs: &'scope [ObjectFile<'data>],
    loaded: &'scope SegQueue<usize>,
    index: usize,
    scope: &rayon::Scope<'scope>,
) {
    for (_, esym, id) in objs[index].globals() {
        if !esym.is_undefined_strong() && !esym.is_common() {
            continue;
        }
        let state = db.symbol(id).state();
        if let Some(FileId::Object(j)) = state.file {
            if !objs[j].is_alive() && objs[j].mark_alive() {
                install_object_definitions(db, FileId::Object(j), &objs[j], false);
                loaded.push(j);
                scope.spawn(move |scope| mark_live_objects(db, objs, loaded, j, scope));
            }
        }
    }
}

fn mark_live_dsos<'scope, 'data: 'scope>(
    db: &'scope SymbolDb<'data>,
    dsos: &'scope [SharedFile<'data>],
    index: usize,
    scope: &rayon::Scope<'scope>,
) {
    for (_, _, id) in dsos[index].globals() {
        let state = db.symbol(id).state();
        if let Some(FileId::Shared(k)) = state.file {
            if k != index && dsos[k].mark_alive() {
                scope.spawn(move |scope| mark_live_dsos(db, dsos, k, scope));
            }
        }
    }
}

/// Keeps one comdat group per key. The representative is the group from the
/// live file with the smallest priority; all members of losing groups are
/// discarded. Election and elimination run as two phases so the second can
/// mutate sections without racing the first.
#[tracing::instrument(skip_all, name = "Eliminate comdats")]
pub(crate) fn eliminate_comdats(ctx: &mut Context) {
    let representatives: HashMap<&[u8], u32> = ctx
        .objs
        .par_iter()
        .fold(HashMap::new, |mut map: HashMap<&[u8], u32>, file| {
            if file.is_alive() {
                for group in &file.comdat_groups {
                    map.entry(group.name)
                        .and_modify(|p| *p = (*p).min(file.priority))
                        .or_insert(file.priority);
                }
            }
            map
        })
        .reduce(HashMap::new, |mut lhs, rhs| {
            for (name, priority) in rhs {
                lhs.entry(name)
                    .and_modify(|p| *p = (*p).min(priority))
                    .or_insert(priority);
            }
            lhs
        });

    ctx.objs.par_iter_mut().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        let priority = file.priority;
        for group_index in 0..file.comdat_groups.len() {
            if representatives[file.comdat_groups[group_index].name] == priority {
                continue;
            }
            let members = file.comdat_groups[group_index].members.clone();
            for member in members {
                if let Some(isec) = file.sections[member as usize].as_mut() {
                    isec.is_alive = false;
                }
            }
        }
    });
}

/// Promotes surviving tentative definitions to zero-initialised sections in
/// their owning files.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    ctx.objs.par_iter_mut().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            return;
        }
        let winners: Vec<usize> = file
            .globals()
            .filter(|(_, esym, id)| {
                esym.is_common() && db.symbol(*id).state().file == Some(FileId::Object(i))
            })
            .map(|(idx, _, _)| idx)
            .collect();
        for idx in winners {
            let esym = file.elf_syms[idx];
            let is_tls = esym.sym_type == STT_TLS;
            let header = InputSectionHeader {
                name: if is_tls { b".tls_common" } else { b".common" },
                sh_type: SHT_NOBITS,
                sh_flags: u64::from(SHF_ALLOC)
                    | u64::from(SHF_WRITE)
                    | if is_tls { u64::from(SHF_TLS) } else { 0 },
                sh_size: esym.size,
                // For commons, the value holds the required alignment.
                sh_addralign: esym.value.max(1),
                sh_entsize: 0,
            };
            let sec_index = file.sections.len();
            file.sections
                .push(Some(crate::input_file::InputSection::new(header, &[])));
            file.elf_syms[idx].placement = SymbolPlacement::Section(sec_index);
            file.elf_syms[idx].value = 0;
            if let Some(id) = file.symbols[idx] {
                db.symbol(id).update(|s| {
                    s.tier = DefinitionTier::Strong;
                    s.value = 0;
                });
            }
        }
    });
}

/// Builds the object that owns linker-synthesized symbols: section boundary
/// markers, `_DYNAMIC` and friends, and `--defsym` definitions. Their values
/// are still zero here; the post-layout fixup binds them to real addresses.
#[tracing::instrument(skip_all, name = "Create internal file")]
pub(crate) fn create_internal_file(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    let (iplt_start, iplt_end) = ctx.arch.iplt_symbol_names();

    let mut names: Vec<(&[u8], u8)> = vec![
        (b"__ehdr_start", STV_HIDDEN),
        (b"__executable_start", STV_HIDDEN),
        (b"__init_array_start", STV_HIDDEN),
        (b"__init_array_end", STV_HIDDEN),
        (b"__fini_array_start", STV_HIDDEN),
        (b"__fini_array_end", STV_HIDDEN),
        (b"__preinit_array_start", STV_HIDDEN),
        (b"__preinit_array_end", STV_HIDDEN),
        (b"_DYNAMIC", STV_HIDDEN),
        (b"_GLOBAL_OFFSET_TABLE_", STV_HIDDEN),
        (b"__bss_start", STV_HIDDEN),
        (b"_end", STV_HIDDEN),
        (b"_etext", STV_HIDDEN),
        (b"_edata", STV_HIDDEN),
        (iplt_start.as_bytes(), STV_HIDDEN),
        (iplt_end.as_bytes(), STV_HIDDEN),
    ];
    if ctx.args.eh_frame_hdr {
        names.push((b"__GNU_EH_FRAME_HDR", STV_HIDDEN));
    }
    // The unprefixed variants exist only when nothing else provides them.
    for name in [b"end".as_slice(), b"etext".as_slice(), b"edata".as_slice()] {
        let taken = db
            .get(name)
            .is_some_and(|id| db.symbol(id).state().file.is_some());
        if !taken {
            names.push((name, STV_HIDDEN));
        }
    }
    // Boundary symbols for C-identifier-named sections. Only referenced names
    // exist in the symbol table, which is exactly the set we must define.
    for (_, sym) in ctx.symbol_db.symbols_iter() {
        let name = sym.name().bytes();
        let suffix = name
            .strip_prefix(b"__start_")
            .or_else(|| name.strip_prefix(b"__stop_"));
        if let Some(suffix) = suffix {
            if crate::elf::is_c_identifier(suffix) {
                names.push((name, STV_HIDDEN));
            }
        }
    }
    for (name, _) in &ctx.args.defsyms {
        names.push((name.as_bytes(), STV_DEFAULT));
    }

    let mut elf_syms = vec![InputSymbol {
        name: b"",
        bind: STB_LOCAL,
        sym_type: STT_NOTYPE,
        visibility: STV_DEFAULT,
        placement: SymbolPlacement::Undefined,
        value: 0,
        size: 0,
    }];
    let mut symbols: Vec<Option<SymbolId>> = vec![None];
    for (name, visibility) in names {
        let Some(id) = db.get(name) else { continue };
        elf_syms.push(InputSymbol {
            name,
            bind: STB_GLOBAL,
            sym_type: STT_NOTYPE,
            visibility,
            placement: SymbolPlacement::Absolute,
            value: 0,
            size: 0,
        });
        symbols.push(Some(id));
    }

    let mut file = ObjectFile::new("<synthetic>".to_owned(), false, elf_syms, 1, Vec::new());
    file.priority = 1;
    file.symbols = symbols;
    let index = ctx.objs.len();
    install_object_definitions(db, FileId::Object(index), &file, false);
    ctx.objs.push(file);
    ctx.internal_obj = Some(index);
}

/// Reports duplicate strong definitions. They don't stop resolution, but the
/// checkpoint after this pass fails the link.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub(crate) fn check_duplicate_symbols(ctx: &Context) {
    let db = &ctx.symbol_db;
    let internal = ctx.internal_obj.map(FileId::Object);
    ctx.objs.par_iter().enumerate().for_each(|(i, file)| {
        if !file.is_alive() {
            return;
        }
        for (_, esym, id) in file.globals() {
            if !esym.is_defined() || esym.is_weak() {
                continue;
            }
            if let SymbolPlacement::Section(sec) = esym.placement {
                if !file.section(sec).is_some_and(|s| s.is_alive) {
                    continue;
                }
            }
            let state = db.symbol(id).state();
            match state.file {
                None => {}
                Some(winner) if winner == FileId::Object(i) || Some(winner) == internal => {}
                Some(winner) => ctx.error(anyhow!(
                    "duplicate symbol: {}: {}: {}",
                    file,
                    ctx.file_display(winner),
                    db.symbol(id).name()
                )),
            }
        }
    });
}

/// After resolution and liveness, strong undefineds with no provider are
/// errors. Weak undefineds are claimed as absolute zero.
#[tracing::instrument(skip_all, name = "Claim unresolved symbols")]
pub(crate) fn claim_unresolved_symbols(ctx: &Context) {
    let db = &ctx.symbol_db;
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for (_, esym, id) in file.globals() {
            if !esym.is_undefined_strong() {
                continue;
            }
            if db.symbol(id).state().file.is_none() {
                ctx.error(anyhow!(
                    "undefined symbol: {}: {}",
                    file,
                    db.symbol(id).name()
                ));
            }
        }
    });
    for name in &ctx.args.require_defined {
        let defined = db
            .get(name.as_bytes())
            .is_some_and(|id| db.symbol(id).state().file.is_some());
        if !defined {
            ctx.error(anyhow!("--require-defined: undefined symbol: {name}"));
        }
    }
}
