//! Architecture-specific register and flag definitions.
//!
//! The dispatch loop and breakpoint machinery are architecture-agnostic; the
//! 32/64-bit split is confined to this module and to the register accessor.
//! x86 targets get the `E*` register set, every other build (including the
//! portable non-Windows surface) gets the x86-64 set.

pub mod debugreg;

use bitflags::bitflags;

bitflags! {
    /// EFLAGS/RFLAGS status bits at their architectural positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag.
        const PF = 1 << 2;
        /// Auxiliary carry flag.
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag. Setting it makes the CPU raise a single-step
        /// exception after the next instruction executes.
        const TF = 1 << 8;
        /// Interrupt-enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        /// General-purpose registers of the debugged architecture.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Register {
            Eax,
            Ebx,
            Ecx,
            Edx,
            Esi,
            Edi,
            Ebp,
            Esp,
            /// Instruction pointer.
            Eip,
        }

        /// Machine word of the debugged architecture.
        pub type RegValue = u32;
    } else {
        /// General-purpose registers of the debugged architecture.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Register {
            Rax,
            Rbx,
            Rcx,
            Rdx,
            Rsi,
            Rdi,
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
            /// Instruction pointer.
            Rip,
        }

        /// Machine word of the debugged architecture.
        pub type RegValue = u64;
    }
}

#[cfg(test)]
mod tests {
    use super::Eflags;

    #[test]
    fn flag_bits_sit_at_their_architectural_positions() {
        assert_eq!(Eflags::CF.bits(), 0x001);
        assert_eq!(Eflags::PF.bits(), 0x004);
        assert_eq!(Eflags::AF.bits(), 0x010);
        assert_eq!(Eflags::ZF.bits(), 0x040);
        assert_eq!(Eflags::SF.bits(), 0x080);
        assert_eq!(Eflags::TF.bits(), 0x100);
        assert_eq!(Eflags::IF.bits(), 0x200);
        assert_eq!(Eflags::DF.bits(), 0x400);
        assert_eq!(Eflags::OF.bits(), 0x800);
    }

    #[test]
    fn masking_eflags_isolates_a_single_flag() {
        let eflags = 0x0000_0246u32; // PF | ZF | IF, the usual idle pattern
        assert!(Eflags::from_bits_retain(eflags).contains(Eflags::ZF));
        assert!(!Eflags::from_bits_retain(eflags).contains(Eflags::CF));
    }
}
