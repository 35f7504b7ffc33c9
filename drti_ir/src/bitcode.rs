//! Binary serialization of modules.
//!
//! This is the "bitcode" a decorated translation unit embeds next to
//! its machine code. Little-endian throughout; a four-byte magic and a
//! format version gate the reader. The encoding preserves declaration
//! order exactly, which the reflect address tables depend on.

use crate::module::{
    BinOpKind, Block, BlockId, CmpKind, Function, Global, Inst, Linkage, Module, Terminator,
    ValueId,
};
use crate::types::{Signature, Ty};
use smallvec::SmallVec;
use thiserror::Error;

/// Four bytes at offset zero of every bitcode blob.
pub const BITCODE_MAGIC: [u8; 4] = *b"DRTI";

/// Format version the reader accepts.
pub const BITCODE_VERSION: u32 = 1;

/// Malformed-bitcode diagnostics.
#[derive(Debug, Error)]
pub enum BitcodeError {
    #[error("truncated bitcode")]
    UnexpectedEof,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported bitcode version {0}")]
    BadVersion(u32),
    #[error("invalid {what} tag {tag}")]
    BadTag { what: &'static str, tag: u8 },
    #[error("invalid utf-8 in string")]
    BadString,
    #[error("{0}")]
    Invalid(String),
}

// =============================================================================
// Writer
// =============================================================================

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn ty(&mut self, ty: &Ty) {
        match ty {
            Ty::Void => self.u8(0),
            Ty::I8 => self.u8(1),
            Ty::I32 => self.u8(2),
            Ty::I64 => self.u8(3),
            Ty::F64 => self.u8(4),
            Ty::Ptr(None) => self.u8(5),
            Ty::Ptr(Some(name)) => {
                self.u8(6);
                self.str(name);
            }
        }
    }

    fn sig(&mut self, sig: &Signature) {
        self.u32(sig.params.len() as u32);
        for p in &sig.params {
            self.ty(p);
        }
        self.ty(&sig.ret);
    }

    fn linkage(&mut self, linkage: Linkage) {
        self.u8(match linkage {
            Linkage::Internal => 0,
            Linkage::External => 1,
            Linkage::LinkOnce => 2,
            Linkage::AvailableExternally => 3,
        });
    }

    fn value(&mut self, v: ValueId) {
        self.u32(v.0);
    }

    fn values(&mut self, vs: &[ValueId]) {
        self.u32(vs.len() as u32);
        for v in vs {
            self.value(*v);
        }
    }

    fn inst(&mut self, inst: &Inst) {
        match inst {
            Inst::ConstInt { ty, value } => {
                self.u8(0);
                self.ty(ty);
                self.u64(*value as u64);
            }
            Inst::ConstPtr { ty, value } => {
                self.u8(1);
                self.ty(ty);
                self.u64(*value);
            }
            Inst::GlobalAddr { name } => {
                self.u8(2);
                self.str(name);
            }
            Inst::Load { ty, ptr } => {
                self.u8(3);
                self.ty(ty);
                self.value(*ptr);
            }
            Inst::Store { ptr, value } => {
                self.u8(4);
                self.value(*ptr);
                self.value(*value);
            }
            Inst::BinOp { op, ty, lhs, rhs } => {
                self.u8(5);
                self.u8(*op as u8);
                self.ty(ty);
                self.value(*lhs);
                self.value(*rhs);
            }
            Inst::ICmp { op, lhs, rhs } => {
                self.u8(6);
                self.u8(*op as u8);
                self.value(*lhs);
                self.value(*rhs);
            }
            Inst::Call { callee, sig, args } => {
                self.u8(7);
                self.str(callee);
                self.sig(sig);
                self.values(args);
            }
            Inst::CallIndirect { callee, sig, args } => {
                self.u8(8);
                self.value(*callee);
                self.sig(sig);
                self.values(args);
            }
            Inst::Cast { ty, value } => {
                self.u8(9);
                self.ty(ty);
                self.value(*value);
            }
            Inst::Phi { ty, incomings } => {
                self.u8(10);
                self.ty(ty);
                self.u32(incomings.len() as u32);
                for (block, value) in incomings {
                    self.u32(block.0);
                    self.value(*value);
                }
            }
            Inst::CodeAddr => self.u8(11),
            Inst::RetAddr => self.u8(12),
        }
    }

    fn term(&mut self, term: &Terminator) {
        match term {
            Terminator::Ret { value } => {
                self.u8(0);
                match value {
                    Some(v) => {
                        self.u8(1);
                        self.value(*v);
                    }
                    None => self.u8(0),
                }
            }
            Terminator::Br { target } => {
                self.u8(1);
                self.u32(target.0);
            }
            Terminator::CondBr {
                cond,
                then_blk,
                else_blk,
            } => {
                self.u8(2);
                self.value(*cond);
                self.u32(then_blk.0);
                self.u32(else_blk.0);
            }
            Terminator::TailCall { callee, sig, args } => {
                self.u8(3);
                self.value(*callee);
                self.sig(sig);
                self.values(args);
            }
        }
    }
}

/// Serialize a module to bitcode bytes.
pub fn write_module(module: &Module) -> Vec<u8> {
    let mut w = Writer { out: Vec::new() };
    w.out.extend_from_slice(&BITCODE_MAGIC);
    w.u32(BITCODE_VERSION);
    w.str(&module.name);

    w.u32(module.globals.len() as u32);
    for global in &module.globals {
        w.str(&global.name);
        w.ty(&global.ty);
        w.linkage(global.linkage);
        w.u8(global.is_const as u8);
        match global.init {
            Some(init) => {
                w.u8(1);
                w.u64(init);
            }
            None => w.u8(0),
        }
    }

    w.u32(module.functions.len() as u32);
    for func in &module.functions {
        w.str(&func.name);
        w.sig(&func.sig);
        w.linkage(func.linkage);
        w.u8(func.always_inline as u8);
        w.u32(func.next_value);
        w.u32(func.blocks.len() as u32);
        for block in &func.blocks {
            w.u32(block.insts.len() as u32);
            for (id, inst) in &block.insts {
                w.value(*id);
                w.inst(inst);
            }
            w.term(&block.term);
        }
    }

    w.out
}

// =============================================================================
// Reader
// =============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BitcodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(BitcodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BitcodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BitcodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, BitcodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self) -> Result<String, BitcodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BitcodeError::BadString)
    }

    fn ty(&mut self) -> Result<Ty, BitcodeError> {
        match self.u8()? {
            0 => Ok(Ty::Void),
            1 => Ok(Ty::I8),
            2 => Ok(Ty::I32),
            3 => Ok(Ty::I64),
            4 => Ok(Ty::F64),
            5 => Ok(Ty::Ptr(None)),
            6 => Ok(Ty::Ptr(Some(self.str()?))),
            tag => Err(BitcodeError::BadTag { what: "type", tag }),
        }
    }

    fn sig(&mut self) -> Result<Signature, BitcodeError> {
        let nparams = self.u32()? as usize;
        let mut params = Vec::with_capacity(nparams.min(64));
        for _ in 0..nparams {
            params.push(self.ty()?);
        }
        let ret = self.ty()?;
        Ok(Signature::new(params, ret))
    }

    fn linkage(&mut self) -> Result<Linkage, BitcodeError> {
        match self.u8()? {
            0 => Ok(Linkage::Internal),
            1 => Ok(Linkage::External),
            2 => Ok(Linkage::LinkOnce),
            3 => Ok(Linkage::AvailableExternally),
            tag => Err(BitcodeError::BadTag {
                what: "linkage",
                tag,
            }),
        }
    }

    fn value(&mut self) -> Result<ValueId, BitcodeError> {
        Ok(ValueId(self.u32()?))
    }

    fn values(&mut self) -> Result<SmallVec<[ValueId; 4]>, BitcodeError> {
        let n = self.u32()? as usize;
        let mut vs = SmallVec::new();
        for _ in 0..n {
            vs.push(self.value()?);
        }
        Ok(vs)
    }

    fn binop_kind(&mut self) -> Result<BinOpKind, BitcodeError> {
        match self.u8()? {
            0 => Ok(BinOpKind::Add),
            1 => Ok(BinOpKind::Sub),
            2 => Ok(BinOpKind::Mul),
            3 => Ok(BinOpKind::And),
            4 => Ok(BinOpKind::Or),
            5 => Ok(BinOpKind::Xor),
            tag => Err(BitcodeError::BadTag { what: "binop", tag }),
        }
    }

    fn cmp_kind(&mut self) -> Result<CmpKind, BitcodeError> {
        match self.u8()? {
            0 => Ok(CmpKind::Eq),
            1 => Ok(CmpKind::Ne),
            2 => Ok(CmpKind::Lt),
            3 => Ok(CmpKind::Gt),
            tag => Err(BitcodeError::BadTag { what: "cmp", tag }),
        }
    }

    fn inst(&mut self) -> Result<Inst, BitcodeError> {
        match self.u8()? {
            0 => Ok(Inst::ConstInt {
                ty: self.ty()?,
                value: self.u64()? as i64,
            }),
            1 => Ok(Inst::ConstPtr {
                ty: self.ty()?,
                value: self.u64()?,
            }),
            2 => Ok(Inst::GlobalAddr { name: self.str()? }),
            3 => Ok(Inst::Load {
                ty: self.ty()?,
                ptr: self.value()?,
            }),
            4 => Ok(Inst::Store {
                ptr: self.value()?,
                value: self.value()?,
            }),
            5 => {
                let op = self.binop_kind()?;
                Ok(Inst::BinOp {
                    op,
                    ty: self.ty()?,
                    lhs: self.value()?,
                    rhs: self.value()?,
                })
            }
            6 => {
                let op = self.cmp_kind()?;
                Ok(Inst::ICmp {
                    op,
                    lhs: self.value()?,
                    rhs: self.value()?,
                })
            }
            7 => Ok(Inst::Call {
                callee: self.str()?,
                sig: self.sig()?,
                args: self.values()?,
            }),
            8 => Ok(Inst::CallIndirect {
                callee: self.value()?,
                sig: self.sig()?,
                args: self.values()?,
            }),
            9 => Ok(Inst::Cast {
                ty: self.ty()?,
                value: self.value()?,
            }),
            10 => {
                let ty = self.ty()?;
                let n = self.u32()? as usize;
                let mut incomings = SmallVec::new();
                for _ in 0..n {
                    let block = BlockId(self.u32()?);
                    let value = self.value()?;
                    incomings.push((block, value));
                }
                Ok(Inst::Phi { ty, incomings })
            }
            11 => Ok(Inst::CodeAddr),
            12 => Ok(Inst::RetAddr),
            tag => Err(BitcodeError::BadTag {
                what: "instruction",
                tag,
            }),
        }
    }

    fn term(&mut self) -> Result<Terminator, BitcodeError> {
        match self.u8()? {
            0 => {
                let value = if self.u8()? != 0 {
                    Some(self.value()?)
                } else {
                    None
                };
                Ok(Terminator::Ret { value })
            }
            1 => Ok(Terminator::Br {
                target: BlockId(self.u32()?),
            }),
            2 => Ok(Terminator::CondBr {
                cond: self.value()?,
                then_blk: BlockId(self.u32()?),
                else_blk: BlockId(self.u32()?),
            }),
            3 => Ok(Terminator::TailCall {
                callee: self.value()?,
                sig: self.sig()?,
                args: self.values()?,
            }),
            tag => Err(BitcodeError::BadTag {
                what: "terminator",
                tag,
            }),
        }
    }
}

/// Deserialize and structurally validate a module.
pub fn read_module(bytes: &[u8]) -> Result<Module, BitcodeError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(4)? != BITCODE_MAGIC {
        return Err(BitcodeError::BadMagic);
    }
    let version = r.u32()?;
    if version != BITCODE_VERSION {
        return Err(BitcodeError::BadVersion(version));
    }

    let mut module = Module::new(&r.str()?);

    let nglobals = r.u32()? as usize;
    for _ in 0..nglobals {
        let name = r.str()?;
        let ty = r.ty()?;
        let linkage = r.linkage()?;
        let is_const = r.u8()? != 0;
        let init = if r.u8()? != 0 { Some(r.u64()?) } else { None };
        module.globals.push(Global {
            name,
            ty,
            linkage,
            is_const,
            init,
        });
    }

    let nfuncs = r.u32()? as usize;
    for _ in 0..nfuncs {
        let name = r.str()?;
        let sig = r.sig()?;
        let linkage = r.linkage()?;
        let always_inline = r.u8()? != 0;
        let next_value = r.u32()?;
        let nblocks = r.u32()? as usize;
        let mut blocks = Vec::with_capacity(nblocks.min(1024));
        for _ in 0..nblocks {
            let ninsts = r.u32()? as usize;
            let mut insts = Vec::with_capacity(ninsts.min(4096));
            for _ in 0..ninsts {
                let id = r.value()?;
                let inst = r.inst()?;
                insts.push((id, inst));
            }
            let term = r.term()?;
            blocks.push(Block { insts, term });
        }
        let func = Function {
            name,
            sig,
            linkage,
            always_inline,
            blocks,
            next_value,
        };
        validate_function(&func)?;
        module.functions.push(func);
    }

    if r.pos != r.bytes.len() {
        return Err(BitcodeError::Invalid("trailing bytes".to_string()));
    }

    Ok(module)
}

/// Structural checks the rest of the pipeline relies on.
fn validate_function(func: &Function) -> Result<(), BitcodeError> {
    let nblocks = func.blocks.len() as u32;
    let bad_value = |v: ValueId| v != ValueId::INVALID && v.0 >= func.next_value;

    for block in &func.blocks {
        for (id, inst) in &block.insts {
            if bad_value(*id) {
                return Err(BitcodeError::Invalid(format!(
                    "{}: result id {} out of range",
                    func.name, id
                )));
            }
            let mut bad = false;
            inst.for_each_operand(|v| bad |= v == ValueId::INVALID || bad_value(v));
            if let Inst::Phi { incomings, .. } = inst {
                bad |= incomings.iter().any(|(b, _)| b.0 >= nblocks);
            }
            if bad {
                return Err(BitcodeError::Invalid(format!(
                    "{}: operand out of range",
                    func.name
                )));
            }
        }
        let mut bad = false;
        block.term.for_each_operand(|v| bad |= v == ValueId::INVALID || bad_value(v));
        bad |= block.term.successors().iter().any(|b| b.0 >= nblocks);
        if bad {
            return Err(BitcodeError::Invalid(format!(
                "{}: terminator out of range",
                func.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FunctionBuilder, ModuleBuilder};

    fn sample_module() -> Module {
        let mut fb = FunctionBuilder::new(
            "invoke",
            Signature::new(vec![Ty::raw_ptr()], Ty::raw_ptr()),
        );
        let target = fb.param(0);
        let result = fb.call_indirect(target, Signature::new(vec![], Ty::raw_ptr()), &[]);
        fb.ret(Some(result));

        let mut mb = ModuleBuilder::new("sample");
        mb.define_global("counter", Ty::I64, Linkage::Internal, 0)
            .declare_function("helper", Signature::new(vec![Ty::I64], Ty::Void))
            .add_function(fb.finish());
        mb.build()
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let module = sample_module();
        let bytes = write_module(&module);
        let back = read_module(&bytes).expect("round trip");

        assert_eq!(back.name, module.name);
        assert_eq!(back.globals, module.globals);
        assert_eq!(back.functions, module.functions);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = write_module(&sample_module());
        bytes[0] = b'X';
        assert!(matches!(read_module(&bytes), Err(BitcodeError::BadMagic)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut bytes = write_module(&sample_module());
        bytes[4] = 0xff;
        assert!(matches!(
            read_module(&bytes),
            Err(BitcodeError::BadVersion(_))
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = write_module(&sample_module());
        for len in [5, 16, bytes.len() / 2, bytes.len() - 1] {
            assert!(read_module(&bytes[..len]).is_err(), "len {}", len);
        }
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut module = sample_module();
        // Corrupt: reference a value id past next_value.
        let func = module.function_mut("invoke").unwrap();
        func.blocks[0].term = Terminator::Ret {
            value: Some(ValueId(1000)),
        };
        let bytes = write_module(&module);
        assert!(matches!(
            read_module(&bytes),
            Err(BitcodeError::Invalid(_))
        ));
    }
}
