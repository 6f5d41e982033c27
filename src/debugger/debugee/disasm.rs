use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use capstone::arch::x86::ArchSyntax;
use capstone::arch::BuildsCapstoneSyntax;
use capstone::prelude::*;

/// Assembler mnemonic flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsmFlavor {
    #[default]
    Intel,
    Gnu,
    /// Go assembler mnemonics are not supported by the disassembler engine,
    /// plain intel syntax used instead.
    Go,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: RelocatedAddress,
    pub mnemonic: Option<String>,
    pub operands: Option<String>,
    pub bytes: Vec<u8>,
}

/// Capstone based disassembler.
pub struct Disassembler {
    cs: Capstone,
}

impl Disassembler {
    pub fn new(flavor: AsmFlavor) -> Result<Self, Error> {
        let syntax = match flavor {
            AsmFlavor::Gnu => ArchSyntax::Att,
            AsmFlavor::Intel | AsmFlavor::Go => ArchSyntax::Intel,
        };
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(syntax)
            .build()
            .map_err(Error::DisAsmInit)?;
        Ok(Self { cs })
    }

    /// Disassemble a memory range of the debugee.
    ///
    /// Bytes patched by enabled software breakpoints are restored from their saved
    /// originals before decoding.
    ///
    /// # Arguments
    ///
    /// * `debugee`: debugee instance
    /// * `from`: start of the range
    /// * `len`: range length in bytes
    /// * `breakpoints`: currently installed breakpoints
    pub fn disasm_range(
        &self,
        debugee: &Debugee,
        from: RelocatedAddress,
        len: usize,
        breakpoints: &[&Breakpoint],
    ) -> Result<Vec<Instruction>, Error> {
        let pid = debugee.tracee_ctl().proc_pid();
        let mut data = crate::debugger::read_memory_by_pid(pid, from.as_usize(), len)?;

        // hide int3 patches from the output
        for brkpt in breakpoints {
            if !brkpt.is_enabled() {
                continue;
            }
            let addr = brkpt.addr.as_usize();
            if addr >= from.as_usize() && addr < from.as_usize() + len {
                if let Some(saved) = brkpt.saved_byte() {
                    data[addr - from.as_usize()] = saved;
                }
            }
        }
        let instructions = self
            .cs
            .disasm_all(&data, from.as_u64())
            .map_err(Error::DisAsm)?;

        Ok(instructions
            .iter()
            .map(|ins| Instruction {
                address: RelocatedAddress::from(ins.address()),
                mnemonic: ins.mnemonic().map(ToString::to_string),
                operands: ins.op_str().map(ToString::to_string),
                bytes: ins.bytes().to_vec(),
            })
            .collect())
    }
}

/// Disassembled body of a single function.
pub struct FunctionAssembly {
    pub name: Option<String>,
    pub addr_in_focus: GlobalAddress,
    pub instructions: Vec<Instruction>,
}
