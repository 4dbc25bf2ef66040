use nix::libc::user_regs_struct;
use strum_macros::{Display, EnumIter, EnumString};

/// General purpose registers of a traced x86_64 thread.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

/// Register values of one thread, captured at a stop.
#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl From<user_regs_struct> for RegisterMap {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterMap")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .field("rsp", &format_args!("{:#x}", self.0.rsp))
            .finish_non_exhaustive()
    }
}

impl RegisterMap {
    pub fn value(&self, register: Register) -> u64 {
        let regs = &self.0;
        match register {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::OrigRax => regs.orig_rax,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
        }
    }

    pub fn pc(&self) -> u64 {
        self.value(Register::Rip)
    }
}
