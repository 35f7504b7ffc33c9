//! Module compilation: machine IR emission, the data section, and
//! symbol resolution.
//!
//! Symbol references are resolved through a chain of
//! [`SymbolResolver`]s, first hit wins; only names no resolver claims
//! fall back to the module's own definitions. That ordering is what
//! makes the reflected-globals table authoritative: a global whose
//! ahead-of-time address is known never gets a second copy here.

use crate::backend::x64::assembler::{Assembler, Label, Width};
use crate::backend::x64::memory::ExecutableBuffer;
use crate::backend::x64::Gpr;
use crate::context_pass::{run_context_pass, CarrierAbi};
use crate::lower::lower_function;
use crate::minst::{MAluOp, MFunction, MInst};
use drti_core::SpecializeError;
use drti_ir::module::{Linkage, Module};
use rustc_hash::FxHashMap;

/// Answers symbol lookups with absolute addresses.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<usize>;
}

/// An absolute-address patch site in the emitted code.
struct Reloc {
    /// Offset of the imm64 field.
    pos: usize,
    sym: String,
}

struct EmitResult {
    code: Vec<u8>,
    func_offsets: FxHashMap<String, usize>,
    relocs: Vec<Reloc>,
}

fn emit_functions(funcs: &[MFunction]) -> Result<EmitResult, SpecializeError> {
    let mut asm = Assembler::new();
    let mut func_offsets = FxHashMap::default();
    let mut relocs = Vec::new();

    for func in funcs {
        asm.align_to(16);
        func_offsets.insert(func.name.clone(), asm.offset());
        let frame = func.frame_size();

        asm.push_r(Gpr::Rbp);
        asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
        asm.push_r(Gpr::R14);
        asm.sub_ri(Gpr::Rsp, frame);

        let labels: Vec<Label> = (0..func.blocks.len()).map(|_| asm.create_label()).collect();
        for (bidx, block) in func.blocks.iter().enumerate() {
            asm.bind_label(labels[bidx]);
            for inst in &block.insts {
                emit_inst(&mut asm, frame, inst, &labels, &mut relocs);
            }
        }
    }

    let code = asm.finalize().map_err(SpecializeError::CodegenFailure)?;
    Ok(EmitResult {
        code,
        func_offsets,
        relocs,
    })
}

fn emit_inst(
    asm: &mut Assembler,
    frame: i32,
    inst: &MInst,
    labels: &[Label],
    relocs: &mut Vec<Reloc>,
) {
    match inst {
        MInst::LoadSlot { dst, slot } => {
            asm.mov_load(*dst, Gpr::Rbp, MFunction::slot_disp(*slot), Width::B8);
        }
        MInst::StoreSlot { slot, src } => {
            asm.mov_store(Gpr::Rbp, MFunction::slot_disp(*slot), *src, Width::B8);
        }
        MInst::MovImm { dst, value } => {
            asm.mov_ri64(*dst, *value);
        }
        MInst::MovSymAddr { dst, sym } => {
            let pos = asm.mov_ri64(*dst, 0);
            relocs.push(Reloc {
                pos,
                sym: sym.clone(),
            });
        }
        MInst::MovRR { dst, src } => asm.mov_rr(*dst, *src),
        MInst::Load {
            dst,
            base,
            disp,
            width,
        } => asm.mov_load(*dst, *base, *disp, *width),
        MInst::Store {
            base,
            disp,
            src,
            width,
        } => asm.mov_store(*base, *disp, *src, *width),
        MInst::Alu { op, dst, src } => match op {
            MAluOp::Add => asm.add_rr(*dst, *src),
            MAluOp::Sub => asm.sub_rr(*dst, *src),
            MAluOp::Mul => asm.imul_rr(*dst, *src),
            MAluOp::And => asm.and_rr(*dst, *src),
            MAluOp::Or => asm.or_rr(*dst, *src),
            MAluOp::Xor => asm.xor_rr(*dst, *src),
        },
        MInst::CmpRR { lhs, rhs } => asm.cmp_rr(*lhs, *rhs),
        MInst::TestRR { lhs, rhs } => asm.test_rr(*lhs, *rhs),
        MInst::Setcc { cc, dst } => asm.setcc_zext(*cc, *dst),
        MInst::CodeAddr { dst } => asm.lea_rip(*dst),
        MInst::RetAddr { dst } => {
            asm.mov_load(*dst, Gpr::Rbp, 8, Width::B8);
        }
        MInst::CallSym { sym, stash } => {
            let pos = asm.mov_ri64(Gpr::R10, 0);
            relocs.push(Reloc {
                pos,
                sym: sym.clone(),
            });
            if *stash {
                asm.stash_before_call(Assembler::call_r_len(Gpr::R10));
            }
            asm.call_r(Gpr::R10);
        }
        MInst::CallReg { reg, stash } => {
            if *stash {
                asm.stash_before_call(Assembler::call_r_len(*reg));
            }
            asm.call_r(*reg);
        }
        MInst::Jmp { target } => asm.jmp_label(labels[*target as usize]),
        MInst::Jcc { cc, target } => asm.jcc_label(*cc, labels[*target as usize]),
        MInst::Epilogue => {
            asm.add_ri(Gpr::Rsp, frame);
            asm.pop_r(Gpr::R14);
            asm.pop_r(Gpr::Rbp);
        }
        MInst::Ret => asm.ret(),
        MInst::JmpReg { reg } => asm.jmp_r(*reg),
    }
}

// =============================================================================
// Compiled module
// =============================================================================

/// A compiled module: executable code, its materialized data section,
/// and the symbol tables into both.
#[derive(Debug)]
pub struct CompiledModule {
    buffer: ExecutableBuffer,
    /// Backing storage for the data section; generated code addresses
    /// it directly.
    #[allow(dead_code)]
    data: Box<[u64]>,
    code_symbols: FxHashMap<String, usize>,
    data_symbols: FxHashMap<String, usize>,
}

impl CompiledModule {
    /// Absolute entry address of a compiled function.
    pub fn function_address(&self, name: &str) -> Option<usize> {
        self.code_symbols.get(name).copied()
    }

    /// Absolute address of a global materialized in this module's
    /// data section.
    pub fn global_address(&self, name: &str) -> Option<usize> {
        self.data_symbols.get(name).copied()
    }

    /// Base of the code region.
    pub fn code_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Size of the emitted code.
    pub fn code_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `addr` points into this module's code.
    pub fn contains_address(&self, addr: usize) -> bool {
        let base = self.buffer.as_ptr() as usize;
        addr >= base && addr < base + self.buffer.len()
    }

    /// Pin this module for the life of the process. Live function
    /// pointers into the code require exactly that.
    pub fn leak(self) -> &'static CompiledModule {
        Box::leak(Box::new(self))
    }
}

/// Compile every defined function of `module`, materialize its
/// unclaimed globals, and resolve all symbol references.
pub fn compile_module(
    module: &Module,
    resolvers: &[&dyn SymbolResolver],
) -> Result<CompiledModule, SpecializeError> {
    let abi = CarrierAbi::system_v();
    let chain = |name: &str| resolvers.iter().find_map(|r| r.resolve(name));

    let mut mfuncs = Vec::new();
    for func in &module.functions {
        if func.is_declaration() {
            continue;
        }
        if func.linkage == Linkage::AvailableExternally {
            // The authoritative copy already exists; never re-emit.
            continue;
        }
        let mut mfunc = lower_function(func)?;
        run_context_pass(&mut mfunc, &abi);
        mfuncs.push(mfunc);
    }

    let emitted = emit_functions(&mfuncs)?;

    // Data section: globals no resolver claims get storage here, one
    // 8-byte word each, naturally aligned.
    let mut data_layout: Vec<(String, usize, u64)> = Vec::new();
    for global in &module.globals {
        if chain(&global.name).is_some() {
            continue;
        }
        match (global.init, global.linkage) {
            (Some(_), Linkage::AvailableExternally) => {
                return Err(SpecializeError::CodegenFailure(format!(
                    "available-externally global {} has no resolved address",
                    global.name
                )));
            }
            (Some(init), _) => {
                let word = data_layout.len();
                data_layout.push((global.name.clone(), word, init));
            }
            (None, _) => {
                return Err(SpecializeError::CodegenFailure(format!(
                    "unresolved global declaration {}",
                    global.name
                )));
            }
        }
    }
    let data: Box<[u64]> = data_layout.iter().map(|(_, _, init)| *init).collect();

    let mut buffer = ExecutableBuffer::new(emitted.code.len().max(1)).ok_or_else(|| {
        SpecializeError::CodegenFailure("executable memory allocation failed".to_string())
    })?;
    let code_base = buffer.as_ptr() as usize;
    let data_base = data.as_ptr() as usize;

    let code_symbols: FxHashMap<String, usize> = emitted
        .func_offsets
        .iter()
        .map(|(name, off)| (name.clone(), code_base + off))
        .collect();
    let data_symbols: FxHashMap<String, usize> = data_layout
        .iter()
        .map(|(name, word, _)| (name.clone(), data_base + word * 8))
        .collect();

    let mut code = emitted.code;
    for reloc in &emitted.relocs {
        let addr = chain(&reloc.sym)
            .or_else(|| code_symbols.get(&reloc.sym).copied())
            .or_else(|| data_symbols.get(&reloc.sym).copied())
            .ok_or_else(|| {
                log::error!("drti: unresolved symbol {}", reloc.sym);
                SpecializeError::CodegenFailure(format!("unresolved symbol {}", reloc.sym))
            })?;
        log::trace!("drti: resolved {} as {:#x}", reloc.sym, addr);
        code[reloc.pos..reloc.pos + 8].copy_from_slice(&(addr as u64).to_le_bytes());
    }

    buffer.emit_bytes(&code);
    if !buffer.make_executable() {
        return Err(SpecializeError::CodegenFailure(
            "mprotect to executable failed".to_string(),
        ));
    }

    for (name, addr) in &code_symbols {
        log::debug!("drti: compiled {} at {:#x}", name, addr);
    }

    Ok(CompiledModule {
        buffer,
        data,
        code_symbols,
        data_symbols,
    })
}

/// A fixed name → address table, the building block for resolver
/// chains.
#[derive(Default)]
pub struct TableResolver {
    map: FxHashMap<String, usize>,
}

impl TableResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, addr: usize) {
        self.map.insert(name.to_string(), addr);
    }
}

impl SymbolResolver for TableResolver {
    fn resolve(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}
