//! Symbol resolution and output layout core of the brisk linker.
//!
//! The crate consumes typed input records (object files, archive members and
//! shared objects, already parsed elsewhere), decides which inputs are live
//! and which symbol definitions win, classifies every referenced symbol into
//! the dynamic tables it needs (dynsym, GOT, PLT, copy relocations, TLS
//! slots), and lays the output chunks out in memory and in the file. Applying
//! relocations and writing bytes is the caller's job; what it gets back is a
//! fully ordered chunk list with final addresses, offsets and sizes, the
//! dynamic symbol assignments, and the `.dynamic` entry list.

pub mod arch;
pub mod args;
pub mod context;
pub mod elf;
pub mod error;
pub mod input_file;
pub mod output_section;
pub mod string_merging;
pub mod symbol_db;
pub mod synthetic;

mod hash;
mod import_export;
mod layout;
mod resolution;
mod scanning;
mod versioning;

pub use crate::context::Context;
pub use crate::error::Result;

/// Finalized layout facts the writer needs beyond what `Context` carries.
#[derive(Debug)]
pub struct LinkOutput {
    /// Total size of the output file.
    pub file_size: u64,
    /// Number of program headers.
    pub num_segments: u64,
    /// Resolved `.dynamic` entries as `(tag, value)` pairs.
    pub dynamic_entries: Vec<(i64, u64)>,
}

/// Runs the resolution and layout pipeline. Each pass is a barrier: it only
/// starts once the previous pass has completed, and errors accumulated by a
/// pass surface at the next checkpoint.
pub fn link(ctx: &mut Context) -> Result<LinkOutput> {
    resolution::apply_exclude_libs(ctx);
    resolution::resolve_symbols(ctx);
    resolution::eliminate_comdats(ctx);
    resolution::convert_common_symbols(ctx);
    versioning::apply_version_script(ctx);
    versioning::parse_symbol_version(ctx);
    import_export::compute_import_export(ctx);

    output_section::assign_output_sections(ctx);
    string_merging::compute_merged_section_sizes(ctx);
    output_section::bin_sections(ctx);
    output_section::sort_init_fini(ctx);
    output_section::compute_section_sizes(ctx);
    output_section::collect_output_section_chunks(ctx);

    resolution::create_internal_file(ctx);
    resolution::check_duplicate_symbols(ctx);
    ctx.errors.checkpoint()?;

    resolution::claim_unresolved_symbols(ctx);
    scanning::scan_relocations(ctx);
    ctx.errors.checkpoint()?;
    scanning::assign_dynamic_slots(ctx);

    synthetic::update_synthetic_shdrs(ctx)?;
    layout::prune_empty_chunks(ctx);
    layout::sort_chunks(ctx);
    layout::finalise_header_sizes(ctx);
    let file_size = layout::set_osec_offsets(ctx);
    layout::fix_synthetic_symbols(ctx);
    ctx.errors.checkpoint()?;

    let dynamic_entries = synthetic::resolve_dynamic_entries(ctx);
    Ok(LinkOutput {
        file_size,
        num_segments: ctx.num_segments,
        dynamic_entries,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::arch::Arch;
    use crate::args::Args;
    use crate::elf::InputRelocation;
    use crate::elf::InputSectionHeader;
    use crate::elf::InputSymbol;
    use crate::elf::RelocationClass;
    use crate::elf::SymbolPlacement;
    use crate::elf::SHF_ALLOC;
    use crate::elf::SHF_TLS;
    use crate::elf::SHF_WRITE;
    use crate::elf::SHT_NOBITS;
    use crate::elf::SHT_PROGBITS;
    use crate::elf::STB_GLOBAL;
    use crate::elf::STB_WEAK;
    use crate::elf::STT_FUNC;
    use crate::elf::STT_NOTYPE;
    use crate::elf::STT_OBJECT;
    use crate::elf::STV_DEFAULT;
    use crate::input_file::InputSection;
    use crate::input_file::ObjectFile;
    use crate::input_file::SharedFile;

    pub(crate) fn leak_args(args: Args) -> &'static Args {
        Box::leak(Box::new(args))
    }

    pub(crate) fn esym(
        name: &'static str,
        bind: u8,
        sym_type: u8,
        placement: SymbolPlacement,
        value: u64,
        size: u64,
    ) -> InputSymbol<'static> {
        InputSymbol {
            name: name.as_bytes(),
            bind,
            sym_type,
            visibility: STV_DEFAULT,
            placement,
            value,
            size,
        }
    }

    pub(crate) fn def(name: &'static str, sec: usize) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_NOTYPE, SymbolPlacement::Section(sec), 0, 0)
    }

    pub(crate) fn func_def(name: &'static str, sec: usize) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_FUNC, SymbolPlacement::Section(sec), 0, 0)
    }

    pub(crate) fn weak_def(name: &'static str, sec: usize) -> InputSymbol<'static> {
        esym(name, STB_WEAK, STT_NOTYPE, SymbolPlacement::Section(sec), 0, 0)
    }

    pub(crate) fn undef(name: &'static str) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_NOTYPE, SymbolPlacement::Undefined, 0, 0)
    }

    pub(crate) fn weak_undef(name: &'static str) -> InputSymbol<'static> {
        esym(name, STB_WEAK, STT_NOTYPE, SymbolPlacement::Undefined, 0, 0)
    }

    pub(crate) fn common(name: &'static str, size: u64, align: u64) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_OBJECT, SymbolPlacement::Common, align, size)
    }

    /// A defined symbol of a shared object; `value` is its address inside
    /// the DSO image.
    pub(crate) fn dso_func(name: &'static str, value: u64) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_FUNC, SymbolPlacement::Absolute, value, 0)
    }

    pub(crate) fn dso_object(name: &'static str, value: u64, size: u64) -> InputSymbol<'static> {
        esym(name, STB_GLOBAL, STT_OBJECT, SymbolPlacement::Absolute, value, size)
    }

    pub(crate) fn section(
        name: &'static str,
        sh_type: u32,
        sh_flags: u64,
        size: u64,
        align: u64,
    ) -> InputSection<'static> {
        InputSection::new(
            InputSectionHeader {
                name: name.as_bytes(),
                sh_type,
                sh_flags,
                sh_size: size,
                sh_addralign: align,
                sh_entsize: 0,
            },
            &[],
        )
    }

    pub(crate) fn progbits(name: &'static str, size: u64, align: u64) -> InputSection<'static> {
        section(name, SHT_PROGBITS, SHF_ALLOC as u64, size, align)
    }

    pub(crate) fn data_section(name: &'static str, size: u64, align: u64) -> InputSection<'static> {
        section(
            name,
            SHT_PROGBITS,
            SHF_ALLOC as u64 | SHF_WRITE as u64,
            size,
            align,
        )
    }

    pub(crate) fn nobits(name: &'static str, size: u64, align: u64) -> InputSection<'static> {
        section(
            name,
            SHT_NOBITS,
            SHF_ALLOC as u64 | SHF_WRITE as u64,
            size,
            align,
        )
    }

    pub(crate) fn tls_section(
        name: &'static str,
        sh_type: u32,
        size: u64,
        align: u64,
    ) -> InputSection<'static> {
        section(
            name,
            sh_type,
            SHF_ALLOC as u64 | SHF_WRITE as u64 | SHF_TLS as u64,
            size,
            align,
        )
    }

    pub(crate) fn rel(class: RelocationClass, symbol: usize) -> InputRelocation {
        InputRelocation {
            offset: 0,
            class,
            symbol,
            addend: 0,
        }
    }

    pub(crate) fn make_obj(
        name: &'static str,
        lazy: bool,
        syms: Vec<InputSymbol<'static>>,
        sections: Vec<InputSection<'static>>,
    ) -> ObjectFile<'static> {
        ObjectFile::new(
            name.to_owned(),
            lazy,
            syms,
            0,
            sections.into_iter().map(Some).collect(),
        )
    }

    pub(crate) fn make_dso(
        name: &'static str,
        soname: &'static str,
        as_needed: bool,
        syms: Vec<InputSymbol<'static>>,
    ) -> SharedFile<'static> {
        SharedFile::new(name.to_owned(), soname.as_bytes(), as_needed, syms, 0)
    }

    pub(crate) fn x86_64() -> Arch {
        crate::arch::X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use crate::args::Args;
    use crate::args::OutputKind;
    use crate::args::VersionPattern;
    use crate::context::Context;
    use crate::elf::RelocationClass;
    use crate::elf::SHT_FINI_ARRAY;
    use crate::elf::SHT_INIT_ARRAY;
    use crate::elf::SHT_NOBITS;
    use crate::elf::SHT_PROGBITS;
    use crate::elf::SHF_ALLOC;
    use crate::elf::SHF_WRITE;
    use crate::elf::VER_NDX_GLOBAL;
    use crate::elf::VER_NDX_LOCAL;
    use crate::input_file::FileId;
    use crate::input_file::ObjectFile;
    use crate::input_file::SharedFile;
    use crate::link;
    use crate::LinkOutput;

    fn run(
        args: &'static Args,
        objs: Vec<ObjectFile<'static>>,
        dsos: Vec<SharedFile<'static>>,
    ) -> (Context<'static>, LinkOutput) {
        let mut ctx = Context::new(args, x86_64(), objs, dsos);
        let output = link(&mut ctx).expect("link failed");
        (ctx, output)
    }

    fn dynsym_names(ctx: &Context) -> Vec<String> {
        ctx.dynsym
            .symbols
            .iter()
            .map(|&id| ctx.symbol_db.symbol(id).name().to_string())
            .collect()
    }

    fn symbol_state(ctx: &Context<'static>, name: &'static str) -> crate::symbol_db::SymbolState {
        let id = ctx.symbol_db.get(name.as_bytes()).expect("symbol interned");
        ctx.symbol_db.symbol(id).state()
    }

    fn exec_args() -> Args {
        Args {
            output_kind: OutputKind::Executable,
            entry: Some("main".to_owned()),
            ..Args::default()
        }
    }

    fn pie_args() -> Args {
        Args {
            output_kind: OutputKind::PositionIndependentExecutable,
            entry: Some("main".to_owned()),
            ..Args::default()
        }
    }

    // A version script `{ foo; local: *; }` keeps `foo` in the dynamic
    // symbol table and demotes everything else to local scope.
    #[test]
    fn version_script_local_suppression() {
        let args = leak_args(Args {
            version_patterns: vec![
                VersionPattern {
                    ver_idx: VER_NDX_LOCAL,
                    patterns: vec!["*".to_owned()],
                    cpp_patterns: vec![],
                },
                VersionPattern {
                    ver_idx: VER_NDX_GLOBAL,
                    patterns: vec!["foo".to_owned()],
                    cpp_patterns: vec![],
                },
            ],
            ..exec_args()
        });
        let obj = make_obj(
            "a.o",
            false,
            vec![def("foo", 0), func_def("main", 0)],
            vec![progbits(".text", 0x10, 4)],
        );
        let (ctx, _) = run(args, vec![obj], vec![]);

        let names = dynsym_names(&ctx);
        assert!(names.contains(&"foo".to_owned()));
        assert!(!names.contains(&"main".to_owned()));
        assert_eq!(symbol_state(&ctx, "main").ver_idx, VER_NDX_LOCAL);
        assert!(!symbol_state(&ctx, "main").is_exported);
        assert!(symbol_state(&ctx, "foo").is_exported);
    }

    // Linking against a DSO produces a NEEDED entry, an undefined dynsym for
    // the imported function, and RELACOUNT matching the RELATIVE relocations.
    #[test]
    fn dynamic_tag_emission() {
        let args = leak_args(pie_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("__libc_start_main")],
            vec![
                progbits(".text", 0x20, 16),
                data_section(".data", 8, 8),
            ],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![rel(RelocationClass::PltCall, 1)];
        // An address-of-main in .data needs a RELATIVE relocation in a PIE.
        obj.sections[1].as_mut().unwrap().relocations = vec![rel(RelocationClass::Absolute, 0)];
        let dso = make_dso(
            "libc.so",
            "libc.so",
            false,
            vec![dso_func("__libc_start_main", 0x5000)],
        );
        let (ctx, output) = run(args, vec![obj], vec![dso]);

        let needed = output
            .dynamic_entries
            .iter()
            .find(|&&(tag, _)| tag == object::elf::DT_NEEDED as i64)
            .expect("NEEDED entry");
        assert_eq!(
            ctx.dynstr.get(b"libc.so"),
            Some(needed.1 as u32),
            "NEEDED points at the soname in .dynstr"
        );

        assert!(dynsym_names(&ctx).contains(&"__libc_start_main".to_owned()));
        let state = symbol_state(&ctx, "__libc_start_main");
        assert!(state.is_imported);
        assert!(matches!(state.file, Some(FileId::Shared(0))));

        let relacount = output
            .dynamic_entries
            .iter()
            .find(|&&(tag, _)| tag == object::elf::DT_RELACOUNT as i64)
            .expect("RELACOUNT entry");
        assert_eq!(relacount.1, 1);
        let reldyn = ctx.chunk(ctx.ids.reldyn);
        assert!(reldyn.shdr.sh_size >= relacount.1 * ctx.arch.rel_size);
    }

    // A function whose address is taken in a non-PIC executable gets a
    // canonical PLT entry in .plt, and becomes both imported and exported so
    // pointer equality holds across the DSO boundary.
    #[test]
    fn canonical_plt() {
        let args = leak_args(exec_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("hello")],
            vec![progbits(".text", 0x20, 16)],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![
            rel(RelocationClass::PltCall, 1),
            rel(RelocationClass::Absolute, 1),
        ];
        let dso = make_dso("libhello.so", "libhello.so", false, vec![dso_func("hello", 0x1000)]);
        let (ctx, _) = run(args, vec![obj], vec![dso]);

        let hello = ctx.symbol_db.get(b"hello").unwrap();
        assert!(ctx.plt.symbols.contains(&hello), "canonical PLT goes in .plt");
        assert!(ctx.pltgot.symbols.is_empty());
        let state = symbol_state(&ctx, "hello");
        assert!(state.is_imported);
        assert!(state.is_exported);
        let aux = ctx.aux_for(&state).unwrap();
        assert!(aux.plt_idx.is_some());
        assert!(aux.pltgot_idx.is_none());
        // Requirement bits are consumed by allocation.
        assert!(ctx.symbol_db.symbol(hello).needs().is_empty());
    }

    // With both GOT and PLT needed in position-independent output, the PLT
    // entry can share the GOT slot and goes in .plt.got.
    #[test]
    fn plt_via_got_in_pic_output() {
        let args = leak_args(pie_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("hello")],
            vec![progbits(".text", 0x20, 16)],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![
            rel(RelocationClass::PltCall, 1),
            rel(RelocationClass::Got, 1),
        ];
        let dso = make_dso("libhello.so", "libhello.so", false, vec![dso_func("hello", 0x1000)]);
        let (ctx, _) = run(args, vec![obj], vec![dso]);

        let hello = ctx.symbol_db.get(b"hello").unwrap();
        assert!(ctx.pltgot.symbols.contains(&hello));
        assert!(ctx.plt.symbols.is_empty());
        let state = symbol_state(&ctx, "hello");
        assert!(state.is_imported);
        assert!(!state.is_exported, "no canonical PLT in PIC output");
    }

    // Copying an initialised DSO variable into .dynbss must carry every
    // alias along, all resolving to the same copied address.
    #[test]
    fn copy_relocation_with_alias() {
        let args = leak_args(exec_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("foo")],
            vec![progbits(".text", 0x20, 16)],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![rel(RelocationClass::Absolute, 1)];
        let dso = make_dso(
            "libfoo.so",
            "libfoo.so",
            false,
            vec![dso_object("foo", 0x2000, 4), dso_object("bar", 0x2000, 4)],
        );
        let (ctx, _) = run(args, vec![obj], vec![dso]);

        let foo = symbol_state(&ctx, "foo");
        let bar = symbol_state(&ctx, "bar");
        assert!(foo.has_copyrel);
        assert!(bar.has_copyrel);
        assert!(!foo.copyrel_readonly);
        assert_eq!(foo.value, bar.value, "aliases share the copied slot");
        assert!(foo.is_imported && foo.is_exported);
        assert!(bar.is_imported && bar.is_exported);
        assert_eq!(ctx.dynbss.symbols.len(), 1);
        assert_eq!(ctx.dynbss_relro.symbols.len(), 0);
        let names = dynsym_names(&ctx);
        assert!(names.contains(&"foo".to_owned()));
        assert!(names.contains(&"bar".to_owned()));
    }

    // A variable the DSO keeps in a read-only segment is copied into
    // .dynbss.rel.ro instead.
    #[test]
    fn copy_relocation_readonly_target() {
        let args = leak_args(exec_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("ro_var")],
            vec![progbits(".text", 0x20, 16)],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![rel(RelocationClass::Absolute, 1)];
        let mut dso = make_dso(
            "libro.so",
            "libro.so",
            false,
            vec![dso_object("ro_var", 0x3000, 8)],
        );
        dso.readonly_ranges = vec![0x2000..0x4000];
        let (ctx, _) = run(args, vec![obj], vec![dso]);

        let state = symbol_state(&ctx, "ro_var");
        assert!(state.has_copyrel);
        assert!(state.copyrel_readonly);
        assert_eq!(ctx.dynbss_relro.symbols.len(), 1);
        assert!(ctx.dynbss.symbols.is_empty());
    }

    // .init_array.N members sort by N; unsuffixed members run last.
    #[test]
    fn init_array_priority_ordering() {
        let args = leak_args(exec_args());
        let mk = |name: &'static str, sec_name: &'static str| {
            make_obj(
                name,
                false,
                vec![def(name, 0)],
                vec![section(
                    sec_name,
                    SHT_INIT_ARRAY,
                    SHF_ALLOC as u64 | SHF_WRITE as u64,
                    8,
                    8,
                )],
            )
        };
        let a = mk("a", ".init_array.300");
        let b = mk("b", ".init_array.100");
        let c = mk("c", ".init_array");
        let (ctx, _) = run(args, vec![a, b, c], vec![]);

        let osec = ctx
            .output_sections
            .sections
            .iter()
            .find(|o| o.name == b".init_array")
            .expect("init_array output section");
        let owners: Vec<usize> = osec.members.iter().map(|&(obj, _)| obj).collect();
        assert_eq!(owners, vec![1, 0, 2], ".100 before .300 before default");

        // Boundary symbols cover the whole array.
        let start = symbol_state(&ctx, "__init_array_start");
        let end = symbol_state(&ctx, "__init_array_end");
        assert_eq!(end.value - start.value, 24);
    }

    // __start_<sec>/__stop_<sec> delimit a C-identifier-named section; with
    // no such section they resolve to zero.
    #[test]
    fn start_stop_symbols() {
        let args = leak_args(exec_args());
        let mut syms = vec![func_def("main", 0)];
        syms.push(undef("__start_foo_bar"));
        syms.push(undef("__stop_foo_bar"));
        syms.push(weak_undef("__start_absent"));
        let obj = make_obj(
            "main.o",
            false,
            syms,
            vec![
                progbits(".text", 0x10, 4),
                progbits("foo_bar", 0x20, 8),
            ],
        );
        let (ctx, _) = run(args, vec![obj], vec![]);

        let chunk = ctx
            .chunk_order
            .iter()
            .map(|&id| ctx.chunk(id))
            .find(|c| c.name == b"foo_bar")
            .expect("foo_bar chunk");
        let start = symbol_state(&ctx, "__start_foo_bar");
        let stop = symbol_state(&ctx, "__stop_foo_bar");
        assert_eq!(start.value, chunk.shdr.sh_addr);
        assert_eq!(stop.value, chunk.shdr.sh_addr + 0x20);
        assert_eq!(start.shndx, chunk.shndx);
        assert_eq!(symbol_state(&ctx, "__start_absent").value, 0);
    }

    // An archive member is loaded only when a strong reference needs it.
    #[test]
    fn archive_member_loading() {
        let member = || {
            make_obj(
                "helper.o",
                true,
                vec![func_def("helper", 0)],
                vec![progbits(".text", 0x10, 4)],
            )
        };

        // Referenced: the member joins the link and its definition is real.
        let args = leak_args(exec_args());
        let mut obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("helper")],
            vec![progbits(".text", 0x10, 4)],
        );
        obj.sections[0].as_mut().unwrap().relocations = vec![rel(RelocationClass::PltCall, 1)];
        let (ctx, _) = run(args, vec![obj, member()], vec![]);
        assert!(ctx.objs[1].is_alive());
        let state = symbol_state(&ctx, "helper");
        assert_eq!(state.file, Some(FileId::Object(1)));
        assert_eq!(state.tier, crate::symbol_db::DefinitionTier::Strong);

        // Unreferenced: the member stays out and its claim is withdrawn.
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 0x10, 4)],
        );
        let (ctx, _) = run(args, vec![obj, member()], vec![]);
        assert!(!ctx.objs[1].is_alive());
        assert!(symbol_state(&ctx, "helper").file.is_none());
    }

    // `--undefined` drags a member in even with no real reference.
    #[test]
    fn undefined_flag_loads_archive_member() {
        let args = leak_args(Args {
            undefined: vec!["keepme".to_owned()],
            ..exec_args()
        });
        let member = make_obj(
            "keep.o",
            true,
            vec![func_def("keepme", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let main = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let (ctx, _) = run(args, vec![main, member], vec![]);
        assert!(ctx.objs[1].is_alive());
    }

    // Even a weak undefined keeps the DSO that satisfies it alive.
    #[test]
    fn weak_undefined_marks_dso_alive() {
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), weak_undef("maybe")],
            vec![progbits(".text", 8, 4)],
        );
        let dso = make_dso("libm.so", "libm.so", true, vec![dso_func("maybe", 0x100)]);
        let (ctx, _) = run(args, vec![obj], vec![dso]);
        assert!(ctx.dsos[0].is_alive());
    }

    #[test]
    fn as_needed_dso_without_references_is_dropped() {
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let dso = make_dso("libx.so", "libx.so", true, vec![dso_func("unused", 0x100)]);
        let (ctx, output) = run(args, vec![obj], vec![dso]);
        assert!(!ctx.dsos[0].is_alive());
        assert!(symbol_state(&ctx, "unused").file.is_none());
        assert!(!output
            .dynamic_entries
            .iter()
            .any(|&(tag, _)| tag == object::elf::DT_NEEDED as i64));
    }

    #[test]
    fn comdat_groups_keep_lowest_priority() {
        let args = leak_args(exec_args());
        let mk = |name: &'static str| {
            let mut obj = make_obj(
                name,
                false,
                vec![weak_def("inline_fn", 0), func_def(name, 1)],
                vec![
                    progbits(".text.inline_fn", 0x10, 4),
                    progbits(".text", 0x10, 4),
                ],
            );
            obj.comdat_groups.push(crate::input_file::ComdatGroup {
                name: b"inline_fn",
                members: smallvec::smallvec![0],
            });
            obj
        };
        let (ctx, _) = run(args, vec![mk("a"), mk("b")], vec![]);
        assert!(ctx.objs[0].sections[0].as_ref().unwrap().is_alive);
        assert!(!ctx.objs[1].sections[0].as_ref().unwrap().is_alive);
    }

    #[test]
    fn duplicate_strong_definitions_fail_the_link() {
        let args = leak_args(exec_args());
        let a = make_obj(
            "a.o",
            false,
            vec![func_def("main", 0), def("dup", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let b = make_obj("b.o", false, vec![def("dup", 0)], vec![progbits(".text", 8, 4)]);
        let mut ctx = Context::new(args, x86_64(), vec![a, b], vec![]);
        let err = link(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("duplicate symbol"), "{err}");
    }

    #[test]
    fn unresolved_strong_reference_fails_the_link() {
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("missing")],
            vec![progbits(".text", 8, 4)],
        );
        let mut ctx = Context::new(args, x86_64(), vec![obj], vec![]);
        let err = link(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("undefined symbol"), "{err}");
        assert!(err.contains("missing"), "{err}");
    }

    #[test]
    fn common_symbols_become_bss_when_unopposed() {
        let args = leak_args(exec_args());
        let a = make_obj(
            "a.o",
            false,
            vec![func_def("main", 0), common("buf", 64, 16)],
            vec![progbits(".text", 8, 4)],
        );
        let b = make_obj("b.o", false, vec![def("strong_x", 0), common("buf", 32, 8)], vec![
            progbits(".text", 8, 4),
        ]);
        let (ctx, _) = run(args, vec![a, b], vec![]);

        // The first file's common wins the priority tie-break and owns the
        // converted definition.
        let state = symbol_state(&ctx, "buf");
        assert_eq!(state.file, Some(FileId::Object(0)));
        let file = &ctx.objs[0];
        let esym = file
            .elf_syms
            .iter()
            .find(|e| e.name == b"buf")
            .unwrap();
        let crate::elf::SymbolPlacement::Section(sec) = esym.placement else {
            panic!("common not converted");
        };
        let isec = file.section(sec).unwrap();
        assert_eq!(isec.header.sh_type, SHT_NOBITS);
        assert_eq!(isec.header.sh_size, 64);
        assert_eq!(isec.header.sh_addralign, 16);
    }

    #[test]
    fn common_loses_to_strong_definition() {
        let args = leak_args(exec_args());
        let a = make_obj(
            "a.o",
            false,
            vec![func_def("main", 0), common("x", 8, 8)],
            vec![progbits(".text", 8, 4)],
        );
        let b = make_obj("b.o", false, vec![def("x", 0)], vec![data_section(".data", 8, 8)]);
        let (ctx, _) = run(args, vec![a, b], vec![]);
        let state = symbol_state(&ctx, "x");
        assert_eq!(state.file, Some(FileId::Object(1)));
        assert_eq!(state.tier, crate::symbol_db::DefinitionTier::Strong);
    }

    // One module-wide slot no matter how many files use local-dynamic TLS.
    #[test]
    fn tlsld_allocates_one_module_slot() {
        let args = leak_args(pie_args());
        let mk = |name: &'static str, tls_var: &'static str| {
            let mut obj = make_obj(
                name,
                false,
                vec![
                    func_def(name, 0),
                    crate::testing::esym(
                        tls_var,
                        crate::elf::STB_GLOBAL,
                        crate::elf::STT_TLS,
                        crate::elf::SymbolPlacement::Section(1),
                        0,
                        8,
                    ),
                ],
                vec![
                    progbits(".text", 0x10, 4),
                    tls_section(".tdata", SHT_PROGBITS, 8, 8),
                ],
            );
            obj.sections[0].as_mut().unwrap().relocations =
                vec![rel(RelocationClass::TlsLd, 1)];
            obj
        };
        let a = mk("main", "tls_a");
        let b = mk("other", "tls_b");
        let (ctx, _) = run(args, vec![a, b], vec![]);
        assert!(ctx.got.tlsld_slot.is_some());
        assert_eq!(ctx.got.num_slots(), 2, "one module-id/offset pair");
    }

    // Section order, address/offset congruence and TBSS overlap. Linked
    // statically so no RELRO chunk lands between .tbss and .data.
    #[test]
    fn layout_invariants() {
        let args = leak_args(Args {
            dynamic_linker: None,
            ..exec_args()
        });
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 1)],
            vec![
                progbits(".rodata", 0x40, 8),
                section(
                    ".text",
                    SHT_PROGBITS,
                    SHF_ALLOC as u64 | crate::elf::SHF_EXECINSTR as u64,
                    0x100,
                    16,
                ),
                tls_section(".tdata", SHT_PROGBITS, 0x10, 8),
                tls_section(".tbss", SHT_NOBITS, 0x30, 8),
                data_section(".data", 0x20, 8),
                nobits(".bss", 0x50, 8),
            ],
        );
        let (ctx, output) = run(args, vec![obj], vec![]);

        let order: Vec<&[u8]> = ctx
            .chunk_order
            .iter()
            .map(|&id| ctx.chunk(id).name)
            .collect();
        let pos = |name: &[u8]| order.iter().position(|&n| n == name).unwrap();
        assert_eq!(order[0], b"", "ELF header first");
        assert_eq!(order[1], b".phdr");
        assert_eq!(*order.last().unwrap(), b".shdr");
        assert!(pos(b".rodata") < pos(b".text"), "ro data before code");
        assert!(pos(b".text") < pos(b".tdata"), "code before writable");
        assert!(pos(b".tdata") < pos(b".tbss"));
        assert!(pos(b".tbss") < pos(b".data"));
        assert!(pos(b".data") < pos(b".bss"));

        // fileoff ≡ vaddr (mod page) for everything that occupies file space.
        let page = ctx.arch.page_size;
        for &id in &ctx.chunk_order {
            let shdr = ctx.chunk(id).shdr;
            if shdr.is_alloc() && !shdr.is_nobits() {
                assert_eq!(
                    shdr.sh_offset % page,
                    shdr.sh_addr % page,
                    "chunk {:?}",
                    String::from_utf8_lossy(ctx.chunk(id).name)
                );
            }
        }

        // TBSS takes no file space and overlaps what follows it: the next
        // non-TBSS alloc chunk starts at the first TBSS address.
        let tbss_pos = pos(b".tbss");
        let tbss = ctx.chunk(ctx.chunk_order[tbss_pos]);
        let next = ctx.chunk_order[tbss_pos + 1..]
            .iter()
            .map(|&id| ctx.chunk(id))
            .find(|c| c.shdr.is_alloc() && !c.is_tbss())
            .unwrap();
        assert_eq!(next.shdr.sh_addr, tbss.shdr.sh_addr);

        // Addresses keep growing across non-TBSS alloc chunks.
        let mut last_end = 0;
        for &id in &ctx.chunk_order {
            let chunk = ctx.chunk(id);
            if !chunk.shdr.is_alloc() || chunk.is_tbss() {
                continue;
            }
            assert!(chunk.shdr.sh_addr >= last_end);
            last_end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
        }
        assert!(output.file_size > 0);
    }

    #[test]
    fn defsym_literal_and_symbolic() {
        let args = leak_args(Args {
            defsyms: vec![
                ("fixed_addr".to_owned(), "0x123000".to_owned()),
                ("alias_of_main".to_owned(), "main".to_owned()),
            ],
            ..exec_args()
        });
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 0x10, 16)],
        );
        let (ctx, _) = run(args, vec![obj], vec![]);

        assert_eq!(symbol_state(&ctx, "fixed_addr").value, 0x123000);
        let main_id = ctx.symbol_db.get(b"main").unwrap();
        assert_eq!(
            symbol_state(&ctx, "alias_of_main").value,
            ctx.symbol_address(main_id)
        );
    }

    #[test]
    fn defsym_with_undefined_target_fails() {
        let args = leak_args(Args {
            defsyms: vec![("broken".to_owned(), "no_such_symbol".to_owned())],
            ..exec_args()
        });
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let mut ctx = Context::new(args, x86_64(), vec![obj], vec![]);
        let err = link(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("--defsym"), "{err}");
    }

    #[test]
    fn sym_at_version_suffixes_in_shared_output() {
        let args = leak_args(Args {
            output_kind: OutputKind::SharedObject,
            entry: None,
            dynamic_linker: None,
            version_definitions: vec!["VERS_1".to_owned()],
            ..Args::default()
        });
        let mut obj = make_obj(
            "lib.o",
            false,
            vec![func_def("api_default", 0), func_def("api_old", 0)],
            vec![progbits(".text", 0x20, 16)],
        );
        obj.symvers[0] = Some("@VERS_1");
        obj.symvers[1] = Some("VERS_1");
        let (ctx, _) = run(args, vec![obj], vec![]);

        let default_ver = symbol_state(&ctx, "api_default").ver_idx;
        let old_ver = symbol_state(&ctx, "api_old").ver_idx;
        assert_eq!(default_ver, 2);
        assert_eq!(old_ver, 2 | crate::elf::VERSYM_HIDDEN);
    }

    #[test]
    fn unknown_symbol_version_fails() {
        let args = leak_args(Args {
            output_kind: OutputKind::SharedObject,
            entry: None,
            dynamic_linker: None,
            ..Args::default()
        });
        let mut obj = make_obj(
            "lib.o",
            false,
            vec![func_def("api", 0)],
            vec![progbits(".text", 8, 4)],
        );
        obj.symvers[0] = Some("NO_SUCH_VERSION");
        let mut ctx = Context::new(args, x86_64(), vec![obj], vec![]);
        let err = link(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("undefined version"), "{err}");
    }

    #[test]
    fn bsymbolic_disables_interposition() {
        let mk_args = |b_symbolic| {
            leak_args(Args {
                output_kind: OutputKind::SharedObject,
                entry: None,
                dynamic_linker: None,
                b_symbolic,
                ..Args::default()
            })
        };
        let mk_obj = || {
            make_obj(
                "lib.o",
                false,
                vec![func_def("api", 0)],
                vec![progbits(".text", 8, 4)],
            )
        };
        let (ctx, _) = run(mk_args(false), vec![mk_obj()], vec![]);
        let state = symbol_state(&ctx, "api");
        assert!(state.is_exported && state.is_imported);

        let (ctx, _) = run(mk_args(true), vec![mk_obj()], vec![]);
        let state = symbol_state(&ctx, "api");
        assert!(state.is_exported && !state.is_imported);
    }

    #[test]
    fn fini_array_gets_boundary_symbols() {
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![
                progbits(".text", 8, 4),
                section(
                    ".fini_array",
                    SHT_FINI_ARRAY,
                    SHF_ALLOC as u64 | SHF_WRITE as u64,
                    16,
                    8,
                ),
            ],
        );
        let (ctx, _) = run(args, vec![obj], vec![]);
        let start = symbol_state(&ctx, "__fini_array_start");
        let end = symbol_state(&ctx, "__fini_array_end");
        assert_eq!(end.value - start.value, 16);
        assert_ne!(start.value, 0);
    }

    // The whole pipeline is a deterministic function of its inputs.
    #[test]
    fn relink_is_byte_identical() {
        let build = || {
            let args = leak_args(pie_args());
            let mut obj = make_obj(
                "main.o",
                false,
                vec![func_def("main", 0), undef("puts")],
                vec![
                    progbits(".text", 0x40, 16),
                    data_section(".data", 0x10, 8),
                    nobits(".bss", 0x20, 8),
                ],
            );
            obj.sections[0].as_mut().unwrap().relocations =
                vec![rel(RelocationClass::PltCall, 1)];
            let dso = make_dso("libc.so", "libc.so", false, vec![dso_func("puts", 0x900)]);
            run(args, vec![obj], vec![dso])
        };
        let (ctx_a, out_a) = build();
        let (ctx_b, out_b) = build();

        assert_eq!(out_a.file_size, out_b.file_size);
        assert_eq!(out_a.num_segments, out_b.num_segments);
        assert_eq!(out_a.dynamic_entries, out_b.dynamic_entries);
        let shape = |ctx: &Context| {
            ctx.chunk_order
                .iter()
                .map(|&id| {
                    let c = ctx.chunk(id);
                    (
                        c.name.to_vec(),
                        c.shdr.sh_addr,
                        c.shdr.sh_offset,
                        c.shdr.sh_size,
                        c.shndx,
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&ctx_a), shape(&ctx_b));
        assert_eq!(dynsym_names(&ctx_a), dynsym_names(&ctx_b));
    }

    // Members of an --exclude-libs archive keep their symbols out of the
    // dynamic table even though they'd otherwise be exported.
    #[test]
    fn exclude_libs_suppresses_exports() {
        let args = leak_args(Args {
            exclude_libs: vec!["libhelper.a".to_owned()],
            ..exec_args()
        });
        let mut member = make_obj(
            "helper.o",
            true,
            vec![func_def("helper", 0)],
            vec![progbits(".text", 8, 4)],
        );
        member.archive_name = Some("path/to/libhelper.a".to_owned());
        let mut main_obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0), undef("helper")],
            vec![progbits(".text", 8, 4)],
        );
        main_obj.sections[0].as_mut().unwrap().relocations =
            vec![rel(RelocationClass::PltCall, 1)];
        let (ctx, _) = run(args, vec![main_obj, member], vec![]);
        assert!(ctx.objs[1].is_alive());
        assert!(!symbol_state(&ctx, "helper").is_exported);
        assert!(symbol_state(&ctx, "main").is_exported);
    }

    // The .comment merged section always carries the linker version string.
    #[test]
    fn comment_section_has_version_string() {
        let args = leak_args(exec_args());
        let obj = make_obj(
            "main.o",
            false,
            vec![func_def("main", 0)],
            vec![progbits(".text", 8, 4)],
        );
        let (ctx, _) = run(args, vec![obj], vec![]);
        let comment = &ctx.merged_sections[ctx.comment_section.as_usize()];
        assert!(comment.size > 0);
        assert!(comment.chunk.is_some());
    }
}
