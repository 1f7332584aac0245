//! Target capability descriptors. The core never looks at relocation opcodes;
//! everything architecture-specific that it needs is captured here and passed
//! through the pipeline as plain data.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    /// ELF `e_machine` value.
    pub machine: u16,

    pub page_size: u64,

    /// Whether relocation records carry explicit addends (RELA) rather than
    /// in-place addends (REL).
    pub is_rela: bool,

    /// Pointer width in bytes. Also the size of one GOT slot.
    pub word_size: u64,

    pub plt_entry_size: u64,
    pub plt_got_entry_size: u64,

    /// Size of one relocation record in `.rela.dyn` / `.rel.dyn`.
    pub rel_size: u64,

    /// Size of one symbol-table entry.
    pub sym_size: u64,

    /// Size of one `.dynamic` entry.
    pub dyn_size: u64,

    pub ehdr_size: u64,
    pub phdr_entry_size: u64,
    pub shdr_entry_size: u64,
}

pub const X86_64: Arch = Arch {
    machine: object::elf::EM_X86_64,
    page_size: 4096,
    is_rela: true,
    word_size: 8,
    plt_entry_size: 16,
    plt_got_entry_size: 8,
    rel_size: 24,
    sym_size: 24,
    dyn_size: 16,
    ehdr_size: 64,
    phdr_entry_size: 56,
    shdr_entry_size: 64,
};

pub const I386: Arch = Arch {
    machine: object::elf::EM_386,
    page_size: 4096,
    is_rela: false,
    word_size: 4,
    plt_entry_size: 16,
    plt_got_entry_size: 8,
    rel_size: 8,
    sym_size: 16,
    dyn_size: 8,
    ehdr_size: 52,
    phdr_entry_size: 32,
    shdr_entry_size: 40,
};

pub const AARCH64: Arch = Arch {
    machine: object::elf::EM_AARCH64,
    page_size: 65536,
    is_rela: true,
    word_size: 8,
    plt_entry_size: 16,
    plt_got_entry_size: 16,
    rel_size: 24,
    sym_size: 24,
    dyn_size: 16,
    ehdr_size: 64,
    phdr_entry_size: 56,
    shdr_entry_size: 64,
};

impl Arch {
    /// On the x86 family `_GLOBAL_OFFSET_TABLE_` points at `.got.plt`; on
    /// AArch64 it points at `.got`.
    pub(crate) fn global_offset_table_in_got_plt(self) -> bool {
        matches!(self.machine, object::elf::EM_X86_64 | object::elf::EM_386)
    }

    /// Name of the symbol pair delimiting IRELATIVE relocations.
    pub(crate) fn iplt_symbol_names(self) -> (&'static str, &'static str) {
        if self.is_rela {
            ("__rela_iplt_start", "__rela_iplt_end")
        } else {
            ("__rel_iplt_start", "__rel_iplt_end")
        }
    }
}
