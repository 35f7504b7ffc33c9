//! x64 assembler: a code buffer with labels, fixups and the
//! decorated-call stash sequence.

use super::encoder::{modrm, rex, sib};
use super::registers::Gpr;
use drti_core::config::{stash_magic, RETALIGN, STASH_BYTES};

/// Condition codes (the `cc` nibble of Jcc/SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
    L = 0xC,
    G = 0xF,
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B1,
    B4,
    B8,
}

/// A forward-referenceable code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

struct Fixup {
    /// Offset of the rel32 displacement field.
    pos: usize,
    label: Label,
}

/// Code buffer for emitting x64 instructions.
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn create_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.code.len());
    }

    // -------------------------------------------------------------------------
    // Raw emission
    // -------------------------------------------------------------------------

    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Pad with NOPs to an alignment boundary.
    pub fn align_to(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.nop();
        }
    }

    fn maybe_rex(&mut self, w: bool, r: bool, b: bool) {
        if w || r || b {
            self.emit_u8(rex(w, r, false, b));
        }
    }

    /// ModR/M (+ SIB) + disp32 for a `[base + disp]` operand.
    fn mem_operand(&mut self, reg_field: u8, base: Gpr, disp: i32) {
        if base.needs_sib_as_base() {
            self.emit_u8(modrm(0b10, reg_field, 0b100));
            self.emit_u8(sib(0, 0b100, base.low_bits()));
        } else {
            self.emit_u8(modrm(0b10, reg_field, base.low_bits()));
        }
        self.emit_u32(disp as u32);
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    pub fn push_r(&mut self, reg: Gpr) {
        self.maybe_rex(false, false, reg.high_bit());
        self.emit_u8(0x50 + reg.low_bits());
    }

    pub fn pop_r(&mut self, reg: Gpr) {
        self.maybe_rex(false, false, reg.high_bit());
        self.emit_u8(0x58 + reg.low_bits());
    }

    /// `mov dst, src` (64-bit).
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit_u8(rex(true, src.high_bit(), false, dst.high_bit()));
        self.emit_u8(0x89);
        self.emit_u8(modrm(0b11, src.low_bits(), dst.low_bits()));
    }

    /// `mov dst, imm64`. Returns the offset of the immediate so the
    /// caller can register a relocation against it.
    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) -> usize {
        self.emit_u8(rex(true, false, false, dst.high_bit()));
        self.emit_u8(0xB8 + dst.low_bits());
        let imm_pos = self.code.len();
        self.emit_u64(imm);
        imm_pos
    }

    /// `mov dst, [base + disp]`, zero-extending for narrow widths.
    pub fn mov_load(&mut self, dst: Gpr, base: Gpr, disp: i32, width: Width) {
        match width {
            Width::B8 => {
                self.emit_u8(rex(true, dst.high_bit(), false, base.high_bit()));
                self.emit_u8(0x8B);
                self.mem_operand(dst.low_bits(), base, disp);
            }
            Width::B4 => {
                self.maybe_rex(false, dst.high_bit(), base.high_bit());
                self.emit_u8(0x8B);
                self.mem_operand(dst.low_bits(), base, disp);
            }
            Width::B1 => {
                self.emit_u8(rex(true, dst.high_bit(), false, base.high_bit()));
                self.emit_u8(0x0F);
                self.emit_u8(0xB6);
                self.mem_operand(dst.low_bits(), base, disp);
            }
        }
    }

    /// `mov [base + disp], src`.
    pub fn mov_store(&mut self, base: Gpr, disp: i32, src: Gpr, width: Width) {
        match width {
            Width::B8 => {
                self.emit_u8(rex(true, src.high_bit(), false, base.high_bit()));
                self.emit_u8(0x89);
                self.mem_operand(src.low_bits(), base, disp);
            }
            Width::B4 => {
                self.maybe_rex(false, src.high_bit(), base.high_bit());
                self.emit_u8(0x89);
                self.mem_operand(src.low_bits(), base, disp);
            }
            Width::B1 => {
                // Without a REX prefix, encodings 4-7 select AH..BH;
                // the lowering only stores bytes from RAX/RCX.
                debug_assert!(src.encoding() < 4 || src.high_bit());
                self.maybe_rex(false, src.high_bit(), base.high_bit());
                self.emit_u8(0x88);
                self.mem_operand(src.low_bits(), base, disp);
            }
        }
    }

    fn alu_rr(&mut self, opcode: u8, dst: Gpr, src: Gpr) {
        self.emit_u8(rex(true, src.high_bit(), false, dst.high_bit()));
        self.emit_u8(opcode);
        self.emit_u8(modrm(0b11, src.low_bits(), dst.low_bits()));
    }

    pub fn add_rr(&mut self, dst: Gpr, src: Gpr) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn sub_rr(&mut self, dst: Gpr, src: Gpr) {
        self.alu_rr(0x29, dst, src);
    }

    pub fn and_rr(&mut self, dst: Gpr, src: Gpr) {
        self.alu_rr(0x21, dst, src);
    }

    pub fn or_rr(&mut self, dst: Gpr, src: Gpr) {
        self.alu_rr(0x09, dst, src);
    }

    pub fn xor_rr(&mut self, dst: Gpr, src: Gpr) {
        self.alu_rr(0x31, dst, src);
    }

    pub fn imul_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit_u8(rex(true, dst.high_bit(), false, src.high_bit()));
        self.emit_u8(0x0F);
        self.emit_u8(0xAF);
        self.emit_u8(modrm(0b11, dst.low_bits(), src.low_bits()));
    }

    pub fn add_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit_u8(rex(true, false, false, dst.high_bit()));
        self.emit_u8(0x81);
        self.emit_u8(modrm(0b11, 0, dst.low_bits()));
        self.emit_u32(imm as u32);
    }

    pub fn sub_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit_u8(rex(true, false, false, dst.high_bit()));
        self.emit_u8(0x81);
        self.emit_u8(modrm(0b11, 5, dst.low_bits()));
        self.emit_u32(imm as u32);
    }

    /// `cmp lhs, rhs` (computes lhs - rhs, sets flags).
    pub fn cmp_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.emit_u8(rex(true, rhs.high_bit(), false, lhs.high_bit()));
        self.emit_u8(0x39);
        self.emit_u8(modrm(0b11, rhs.low_bits(), lhs.low_bits()));
    }

    pub fn test_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.emit_u8(rex(true, rhs.high_bit(), false, lhs.high_bit()));
        self.emit_u8(0x85);
        self.emit_u8(modrm(0b11, rhs.low_bits(), lhs.low_bits()));
    }

    /// SETcc into the low byte of `dst`, then zero-extend to 64 bits.
    pub fn setcc_zext(&mut self, cc: Cond, dst: Gpr) {
        // SETcc on encodings 4-7 without REX would hit AH..BH.
        debug_assert!(dst.encoding() < 4);
        self.emit_u8(0x0F);
        self.emit_u8(0x90 + cc as u8);
        self.emit_u8(modrm(0b11, 0, dst.low_bits()));
        self.emit_u8(rex(true, dst.high_bit(), false, dst.high_bit()));
        self.emit_u8(0x0F);
        self.emit_u8(0xB6);
        self.emit_u8(modrm(0b11, dst.low_bits(), dst.low_bits()));
    }

    /// `call reg`. Returns the encoded length in bytes.
    pub fn call_r(&mut self, reg: Gpr) -> usize {
        let start = self.code.len();
        self.maybe_rex(false, false, reg.high_bit());
        self.emit_u8(0xFF);
        self.emit_u8(modrm(0b11, 2, reg.low_bits()));
        self.code.len() - start
    }

    /// Encoded length of `call reg` without emitting it.
    pub const fn call_r_len(reg: Gpr) -> usize {
        if reg.high_bit() {
            3
        } else {
            2
        }
    }

    pub fn jmp_r(&mut self, reg: Gpr) {
        self.maybe_rex(false, false, reg.high_bit());
        self.emit_u8(0xFF);
        self.emit_u8(modrm(0b11, 4, reg.low_bits()));
    }

    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.emit_u8(0x90);
    }

    pub fn jmp_label(&mut self, label: Label) {
        self.emit_u8(0xE9);
        let pos = self.code.len();
        self.emit_u32(0);
        self.fixups.push(Fixup { pos, label });
    }

    pub fn jcc_label(&mut self, cc: Cond, label: Label) {
        self.emit_u8(0x0F);
        self.emit_u8(0x80 + cc as u8);
        let pos = self.code.len();
        self.emit_u32(0);
        self.fixups.push(Fixup { pos, label });
    }

    /// `lea dst, [rip]` — the address of the next instruction.
    pub fn lea_rip(&mut self, dst: Gpr) {
        self.emit_u8(rex(true, dst.high_bit(), false, false));
        self.emit_u8(0x8D);
        self.emit_u8(modrm(0b00, dst.low_bits(), 0b101));
        self.emit_u32(0);
    }

    /// Emit the stash sequence in front of a call of `call_len` bytes:
    /// a jump over the stash, alignment padding, the magic word, and
    /// NOP fill sized so the call's return address lands exactly
    /// `RETALIGN` past the magic. The caller must emit the call
    /// instruction immediately afterwards.
    pub fn stash_before_call(&mut self, call_len: usize) {
        debug_assert!(call_len <= RETALIGN - STASH_BYTES);
        self.emit_u8(0xEB);
        let disp_pos = self.code.len();
        self.emit_u8(0);
        // Skipped bytes; NOP keeps disassemblers calm.
        self.align_to(RETALIGN);
        self.emit_u64(stash_magic());
        for _ in 0..(RETALIGN - STASH_BYTES - call_len) {
            self.nop();
        }
        let target = self.code.len();
        let disp = target - (disp_pos + 1);
        debug_assert!(disp <= i8::MAX as usize);
        self.code[disp_pos] = disp as u8;
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Resolve all label fixups and return the code bytes.
    pub fn finalize(mut self) -> Result<Vec<u8>, String> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0 as usize]
                .ok_or_else(|| format!("unbound label {:?}", fixup.label))?;
            let disp = target as i64 - (fixup.pos as i64 + 4);
            let disp: i32 = disp
                .try_into()
                .map_err(|_| "rel32 displacement out of range".to_string())?;
            self.code[fixup.pos..fixup.pos + 4].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(self.code)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
