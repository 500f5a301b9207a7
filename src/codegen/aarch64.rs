//! ARM64 lowering
//!
//! Same frame and pool discipline as the x86-64 backend. Method/global
//! tokens cannot ride in mov immediates (they must stay contiguous 8-byte
//! words for the linker), so they are loaded PC-relative from a per-method
//! literal pool placed after the return.

use std::collections::HashMap;

use super::link::MethodCode;
use super::{
    frame_size, frame_vars, global_token, method_token, Cond, Fragment, Method, Op, Relation,
    Value, Width,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg(u8);

const X8: Reg = Reg(8); // syscall number
const X9: Reg = Reg(9); // call target scratch
/// sp/xzr register number in the relevant encodings.
const SP: u8 = 31;

/// Scratch pool, x0 first (the hot register and return value).
const POOL: [Reg; 12] = [
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(4),
    Reg(5),
    Reg(6),
    Reg(7),
    Reg(9),
    Reg(10),
    Reg(11),
    Reg(12),
];

/// Syscall and call arguments both use x0-x5.
const ARG_ABI: [Reg; 6] = [Reg(0), Reg(1), Reg(2), Reg(3), Reg(4), Reg(5)];

enum FixupKind {
    Branch,
    CondBranch,
}

struct Emitter {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String, FixupKind)>,
    /// (ldr instruction offset, token) pairs awaiting the literal pool.
    literals: Vec<(usize, u64)>,
    free: Vec<Reg>,
    slots: HashMap<String, u32>,
    label_seq: usize,
}

pub fn lower_method(method: &Method) -> Result<MethodCode> {
    let vars = frame_vars(method);
    let frame = frame_size(vars.len());
    if frame >= 0x1000 {
        return Err(Error::Config(format!(
            "frame of {frame} bytes exceeds the add/sub immediate range"
        )));
    }
    let mut e = Emitter {
        code: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
        literals: Vec::new(),
        free: POOL.to_vec(),
        slots: vars
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32 * 8))
            .collect(),
        label_seq: 0,
    };

    if frame > 0 {
        e.word(0xd100_0000 | ((frame & 0xfff) << 10) | ((SP as u32) << 5) | SP as u32);
    }
    e.lower_block(&method.body)?;
    if frame > 0 {
        e.word(0x9100_0000 | ((frame & 0xfff) << 10) | ((SP as u32) << 5) | SP as u32);
    }
    e.word(0xd65f_03c0); // ret
    e.resolve_fixups(&method.name)?;
    let reloc_sites = e.flush_literals();
    Ok(MethodCode {
        code: e.code,
        reloc_sites,
    })
}

impl Emitter {
    fn word(&mut self, insn: u32) {
        self.code.extend_from_slice(&insn.to_le_bytes());
    }

    // --- register pool ---

    fn alloc(&mut self, preferred: Option<Reg>) -> Result<Reg> {
        if let Some(p) = preferred {
            if let Some(i) = self.free.iter().position(|&r| r == p) {
                return Ok(self.free.remove(i));
            }
        }
        if self.free.is_empty() {
            return Err(Error::Config("register pool exhausted".into()));
        }
        Ok(self.free.remove(0))
    }

    fn release(&mut self, reg: Reg) {
        let rank = |r: Reg| POOL.iter().position(|&p| p == r).unwrap_or(POOL.len());
        let pos = self
            .free
            .iter()
            .position(|&r| rank(r) > rank(reg))
            .unwrap_or(self.free.len());
        self.free.insert(pos, reg);
    }

    fn slot(&self, name: &str) -> Result<u32> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown variable {name:?}")))
    }

    // --- instruction helpers ---

    fn mov_imm(&mut self, reg: Reg, value: i64) {
        let v = value as u64;
        // movz clears the register; movk patches the nonzero halves.
        self.word(0xd280_0000 | (((v & 0xffff) as u32) << 5) | reg.0 as u32);
        for hw in 1..4u32 {
            let half = ((v >> (16 * hw)) & 0xffff) as u32;
            if half != 0 {
                self.word(0xf280_0000 | (hw << 21) | (half << 5) | reg.0 as u32);
            }
        }
    }

    /// Load a link-time token from the literal pool.
    fn mov_token(&mut self, reg: Reg, token: u64) {
        self.literals.push((self.code.len(), token));
        self.word(0x5800_0000 | reg.0 as u32); // ldr xd, <literal>; offset patched later
    }

    fn load_slot(&mut self, reg: Reg, off: u32) {
        self.word(0xf940_0000 | ((off / 8) << 10) | ((SP as u32) << 5) | reg.0 as u32);
    }

    fn store_slot(&mut self, reg: Reg, off: u32) {
        self.word(0xf900_0000 | ((off / 8) << 10) | ((SP as u32) << 5) | reg.0 as u32);
    }

    fn load_mem(&mut self, dst: Reg, base: Reg, disp: i32, width: Width) -> Result<()> {
        match width {
            Width::Quad => {
                if disp < 0 || disp % 8 != 0 || disp >= 0x8000 {
                    return Err(Error::Config(format!("unencodable displacement {disp}")));
                }
                self.word(
                    0xf940_0000
                        | (((disp as u32) / 8) << 10)
                        | ((base.0 as u32) << 5)
                        | dst.0 as u32,
                );
            }
            Width::Byte => {
                if !(0..0x1000).contains(&disp) {
                    return Err(Error::Config(format!("unencodable displacement {disp}")));
                }
                self.word(
                    0x3940_0000 | ((disp as u32) << 10) | ((base.0 as u32) << 5) | dst.0 as u32,
                );
            }
        }
        Ok(())
    }

    fn store_mem(&mut self, value: Reg, base: Reg, disp: i32, width: Width) -> Result<()> {
        match width {
            Width::Quad => {
                if disp < 0 || disp % 8 != 0 || disp >= 0x8000 {
                    return Err(Error::Config(format!("unencodable displacement {disp}")));
                }
                self.word(
                    0xf900_0000
                        | (((disp as u32) / 8) << 10)
                        | ((base.0 as u32) << 5)
                        | value.0 as u32,
                );
            }
            Width::Byte => {
                if !(0..0x1000).contains(&disp) {
                    return Err(Error::Config(format!("unencodable displacement {disp}")));
                }
                self.word(
                    0x3900_0000 | ((disp as u32) << 10) | ((base.0 as u32) << 5) | value.0 as u32,
                );
            }
        }
        Ok(())
    }

    fn add_sub_imm(&mut self, sub: bool, dst: Reg, src: Reg, imm: u32) {
        let base = if sub { 0xd100_0000 } else { 0x9100_0000 };
        self.word(base | ((imm & 0xfff) << 10) | ((src.0 as u32) << 5) | dst.0 as u32);
    }

    fn alu_reg(&mut self, base: u32, dst: Reg, lhs: Reg, rhs: Reg) {
        self.word(base | ((rhs.0 as u32) << 16) | ((lhs.0 as u32) << 5) | dst.0 as u32);
    }

    fn cmp_imm(&mut self, reg: Reg, imm: u32) {
        self.word(0xf100_001f | ((imm & 0xfff) << 10) | ((reg.0 as u32) << 5));
    }

    fn cmp_reg(&mut self, lhs: Reg, rhs: Reg) {
        self.word(0xeb00_001f | ((rhs.0 as u32) << 16) | ((lhs.0 as u32) << 5));
    }

    fn tst(&mut self, reg: Reg) {
        self.word(0xea00_001f | ((reg.0 as u32) << 16) | ((reg.0 as u32) << 5));
    }

    fn b_cond(&mut self, cond: u32, label: &str) {
        self.fixups
            .push((self.code.len(), label.to_string(), FixupKind::CondBranch));
        self.word(0x5400_0000 | cond);
    }

    fn b(&mut self, label: &str) {
        self.fixups
            .push((self.code.len(), label.to_string(), FixupKind::Branch));
        self.word(0x1400_0000);
    }

    fn bind_label(&mut self, name: &str) -> Result<()> {
        if self.labels.insert(name.to_string(), self.code.len()).is_some() {
            return Err(Error::Config(format!("duplicate label {name:?}")));
        }
        Ok(())
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.label_seq += 1;
        format!("__{stem}_{}", self.label_seq)
    }

    fn resolve_fixups(&mut self, method: &str) -> Result<()> {
        for (pos, label, kind) in std::mem::take(&mut self.fixups) {
            let target = *self.labels.get(&label).ok_or_else(|| {
                Error::Config(format!("undefined label {label:?} in method {method:?}"))
            })?;
            let rel = (target as i64 - pos as i64) / 4;
            let mut insn = u32::from_le_bytes(self.code[pos..pos + 4].try_into().unwrap());
            match kind {
                FixupKind::Branch => {
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(Error::Config(format!("branch to {label:?} out of range")));
                    }
                    insn |= (rel as u32) & 0x03ff_ffff;
                }
                FixupKind::CondBranch => {
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(Error::Config(format!("branch to {label:?} out of range")));
                    }
                    insn |= ((rel as u32) & 0x7_ffff) << 5;
                }
            }
            self.code[pos..pos + 4].copy_from_slice(&insn.to_le_bytes());
        }
        Ok(())
    }

    /// Emit the literal pool after the code and patch every `ldr` toward it.
    /// Returns the token word offsets for the linker.
    fn flush_literals(&mut self) -> Vec<usize> {
        let mut sites = Vec::new();
        while self.code.len() % 8 != 0 {
            // Pool is past the ret; padding is never executed.
            self.word(0xd503_201f); // nop
        }
        for (ldr_pos, token) in std::mem::take(&mut self.literals) {
            let pool_pos = self.code.len();
            sites.push(pool_pos);
            self.code.extend_from_slice(&token.to_le_bytes());
            let rel = ((pool_pos - ldr_pos) / 4) as u32;
            let mut insn = u32::from_le_bytes(self.code[ldr_pos..ldr_pos + 4].try_into().unwrap());
            insn |= (rel & 0x7_ffff) << 5;
            self.code[ldr_pos..ldr_pos + 4].copy_from_slice(&insn.to_le_bytes());
        }
        sites
    }

    // --- value evaluation ---

    fn eval(&mut self, value: &Value, preferred: Option<Reg>) -> Result<Reg> {
        let reg = self.alloc(preferred)?;
        match value {
            Value::Int(v) => self.mov_imm(reg, *v),
            Value::Var(name) => {
                let slot = self.slot(name)?;
                self.load_slot(reg, slot);
            }
            Value::Method(name) => self.mov_token(reg, method_token(name)),
            Value::Global(name) => self.mov_token(reg, global_token(name)),
        }
        Ok(reg)
    }

    // --- fragment lowering ---

    fn lower_block(&mut self, block: &[Fragment]) -> Result<()> {
        for frag in block {
            self.lower_fragment(frag)?;
        }
        Ok(())
    }

    fn lower_fragment(&mut self, frag: &Fragment) -> Result<()> {
        match frag {
            Fragment::DeclareParam { name, index } => {
                let reg = *ARG_ABI
                    .get(*index)
                    .ok_or_else(|| Error::Config(format!("parameter index {index} too high")))?;
                let slot = self.slot(name)?;
                self.store_slot(reg, slot);
            }
            Fragment::Assign { name, value } => {
                let reg = self.eval(value, Some(Reg(0)))?;
                let slot = self.slot(name)?;
                self.store_slot(reg, slot);
                self.release(reg);
            }
            Fragment::LoadMem {
                dst,
                base,
                disp,
                width,
            } => {
                let b = self.eval(base, None)?;
                let d = self.alloc(Some(Reg(0)))?;
                self.load_mem(d, b, *disp, *width)?;
                let slot = self.slot(dst)?;
                self.store_slot(d, slot);
                self.release(d);
                self.release(b);
            }
            Fragment::StoreMem {
                base,
                disp,
                value,
                width,
            } => {
                let v = self.eval(value, Some(Reg(0)))?;
                let b = self.eval(base, None)?;
                self.store_mem(v, b, *disp, *width)?;
                self.release(b);
                self.release(v);
            }
            Fragment::BinOp { dst, op, lhs, rhs } => {
                let d = self.eval(lhs, Some(Reg(0)))?;
                self.lower_op(*op, d, rhs)?;
                let slot = self.slot(dst)?;
                self.store_slot(d, slot);
                self.release(d);
            }
            Fragment::Syscall { nr, args, result } => {
                if args.len() > ARG_ABI.len() {
                    return Err(Error::Config(format!(
                        "syscall with {} arguments (max 6)",
                        args.len()
                    )));
                }
                let mut used = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    let reg = self.eval(arg, Some(ARG_ABI[i]))?;
                    if reg != ARG_ABI[i] {
                        return Err(Error::Config(
                            "syscall argument register unavailable".into(),
                        ));
                    }
                    used.push(reg);
                }
                self.mov_imm(X8, *nr);
                self.word(0xd400_0001); // svc #0
                if let Some(result) = result {
                    let slot = self.slot(result)?;
                    self.store_slot(Reg(0), slot);
                }
                for reg in used {
                    self.release(reg);
                }
            }
            Fragment::If {
                cond,
                then_block,
                else_block,
            } => {
                let else_label = self.fresh_label("else");
                let end_label = self.fresh_label("endif");
                self.lower_cond_branch(cond, &else_label)?;
                self.lower_block(then_block)?;
                if !else_block.is_empty() {
                    self.b(&end_label);
                }
                self.bind_label(&else_label)?;
                self.lower_block(else_block)?;
                if !else_block.is_empty() {
                    self.bind_label(&end_label)?;
                }
            }
            Fragment::Label(name) => self.bind_label(name)?,
            Fragment::Goto(name) => self.b(name),
            Fragment::Call {
                method,
                args,
                result,
            } => {
                if args.len() > ARG_ABI.len() {
                    return Err(Error::Config(format!(
                        "call with {} arguments (max 6)",
                        args.len()
                    )));
                }
                let mut used = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    let reg = self.eval(arg, Some(ARG_ABI[i]))?;
                    if reg != ARG_ABI[i] {
                        return Err(Error::Config("call argument register unavailable".into()));
                    }
                    used.push(reg);
                }
                let addr = self.alloc(Some(X9))?;
                self.mov_token(addr, method_token(method));
                // Save and restore the link register around the call; no
                // frame slot is reserved for it.
                self.word(0xf81f_0ffe); // str x30, [sp, #-16]!
                self.word(0xd63f_0000 | ((addr.0 as u32) << 5)); // blr
                self.word(0xf84107fe); // ldr x30, [sp], #16
                if let Some(result) = result {
                    let slot = self.slot(result)?;
                    self.store_slot(Reg(0), slot);
                }
                self.release(addr);
                for reg in used {
                    self.release(reg);
                }
            }
            Fragment::Scope { body } => self.lower_block(body)?,
            Fragment::Printf { .. } => {
                return Err(Error::Config(
                    "printf fragment reached the emitter unexpanded".into(),
                ))
            }
        }
        Ok(())
    }

    fn lower_op(&mut self, op: Op, dst: Reg, rhs: &Value) -> Result<()> {
        match op {
            Op::Add | Op::Sub => {
                let sub = op == Op::Sub;
                match rhs {
                    Value::Int(v) if (0..0x1000).contains(v) => {
                        self.add_sub_imm(sub, dst, dst, *v as u32);
                    }
                    other => {
                        let r = self.eval(other, None)?;
                        let base = if sub { 0xcb00_0000 } else { 0x8b00_0000 };
                        self.alu_reg(base, dst, dst, r);
                        self.release(r);
                    }
                }
            }
            Op::And => {
                // Bitmask immediates are not worth encoding; go through a reg.
                let r = self.eval(rhs, None)?;
                self.alu_reg(0x8a00_0000, dst, dst, r);
                self.release(r);
            }
            Op::Shl => match rhs {
                Value::Int(v) if (0..64).contains(v) => {
                    let s = *v as u32;
                    let immr = (64 - s) % 64;
                    let imms = 63 - s;
                    self.word(
                        0xd340_0000 | (immr << 16) | (imms << 10) | ((dst.0 as u32) << 5)
                            | dst.0 as u32,
                    );
                }
                other => {
                    let r = self.eval(other, None)?;
                    self.alu_reg(0x9ac0_2000, dst, dst, r); // lslv
                    self.release(r);
                }
            },
            Op::Shr => match rhs {
                Value::Int(v) if (0..64).contains(v) => {
                    let s = *v as u32;
                    self.word(
                        0xd340_0000 | (s << 16) | (63 << 10) | ((dst.0 as u32) << 5)
                            | dst.0 as u32,
                    );
                }
                other => {
                    let r = self.eval(other, None)?;
                    self.alu_reg(0x9ac0_2400, dst, dst, r); // lsrv
                    self.release(r);
                }
            },
        }
        Ok(())
    }

    /// Branch to `target` when `cond` is FALSE.
    fn lower_cond_branch(&mut self, cond: &Cond, target: &str) -> Result<()> {
        match cond {
            Cond::IsNegative(v) => {
                let r = self.eval(v, Some(Reg(0)))?;
                self.tst(r);
                self.release(r);
                self.b_cond(5, target); // b.pl
            }
            Cond::IsZero(v) => {
                let r = self.eval(v, Some(Reg(0)))?;
                self.tst(r);
                self.release(r);
                self.b_cond(1, target); // b.ne
            }
            Cond::Compare(a, rel, b) => {
                let ra = self.eval(a, Some(Reg(0)))?;
                match b {
                    Value::Int(v) if (0..0x1000).contains(v) => self.cmp_imm(ra, *v as u32),
                    other => {
                        let rb = self.eval(other, None)?;
                        self.cmp_reg(ra, rb);
                        self.release(rb);
                    }
                }
                self.release(ra);
                let cond = match rel {
                    Relation::Eq => 1,  // b.ne
                    Relation::Ne => 0,  // b.eq
                    Relation::Lt => 10, // b.ge
                    Relation::Le => 12, // b.gt
                    Relation::Gt => 13, // b.le
                    Relation::Ge => 11, // b.lt
                };
                self.b_cond(cond, target);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{GLOBAL_TOKEN_PREFIX, METHOD_TOKEN_PREFIX};

    fn method(body: Vec<Fragment>) -> Method {
        Method {
            name: "m".into(),
            body,
        }
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn empty_method_is_bare_ret() {
        let mc = lower_method(&method(vec![])).unwrap();
        assert_eq!(words(&mc.code), vec![0xd65f_03c0]);
    }

    #[test]
    fn frame_setup_and_spill() {
        let mc = lower_method(&method(vec![Fragment::Assign {
            name: "x".into(),
            value: Value::Int(7),
        }]))
        .unwrap();
        let w = words(&mc.code);
        // sub sp, sp, #16
        assert_eq!(w[0], 0xd100_0000 | (16 << 10) | (31 << 5) | 31);
        // movz x0, #7
        assert_eq!(w[1], 0xd280_0000 | (7 << 5));
        // str x0, [sp]
        assert_eq!(w[2], 0xf900_0000 | (31 << 5));
        // add sp / ret at the end
        assert_eq!(w[w.len() - 1], 0xd65f_03c0);
    }

    #[test]
    fn syscall_marshalling_zero_one_three_six() {
        for nargs in [0usize, 1, 3, 6] {
            let args: Vec<Value> = (0..nargs).map(|i| Value::Int(i as i64 + 1)).collect();
            let mc = lower_method(&method(vec![Fragment::Syscall {
                nr: 64,
                args,
                result: None,
            }]))
            .unwrap();
            let w = words(&mc.code);
            assert!(w.contains(&0xd400_0001), "svc #0");
            // movz x8, #64
            assert!(w.contains(&(0xd280_0000 | (64 << 5) | 8)));
            if nargs >= 1 {
                // movz x0, #1
                assert!(w.contains(&(0xd280_0000 | (1 << 5))));
            }
            if nargs >= 3 {
                // movz x2, #3
                assert!(w.contains(&(0xd280_0000 | (3 << 5) | 2)));
            }
            if nargs == 6 {
                // movz x5, #6
                assert!(w.contains(&(0xd280_0000 | (6 << 5) | 5)));
            }
        }
    }

    #[test]
    fn tokens_live_in_the_literal_pool() {
        let mc = lower_method(&method(vec![Fragment::Assign {
            name: "p".into(),
            value: Value::Global("buf".into()),
        }]))
        .unwrap();
        assert_eq!(mc.reloc_sites.len(), 1);
        let site = mc.reloc_sites[0];
        assert_eq!(site % 8, 0, "pool entries are 8-byte aligned");
        let word = u64::from_le_bytes(mc.code[site..site + 8].try_into().unwrap());
        assert_eq!((word >> 48) as u16, GLOBAL_TOKEN_PREFIX);
        // The ldr literal offset points exactly at the pool entry.
        let w = words(&mc.code);
        let ldr = w
            .iter()
            .position(|&i| i & 0xff00_0000 == 0x5800_0000)
            .unwrap();
        let imm19 = ((w[ldr] >> 5) & 0x7_ffff) as usize;
        assert_eq!(ldr * 4 + imm19 * 4, site);
    }

    #[test]
    fn call_saves_link_register() {
        let mc = lower_method(&method(vec![Fragment::Call {
            method: "helper".into(),
            args: vec![Value::Int(1)],
            result: Some("r".into()),
        }]))
        .unwrap();
        let w = words(&mc.code);
        assert!(w.contains(&0xf81f_0ffe), "str x30, [sp, #-16]!");
        assert!(w.contains(&0xf841_07fe), "ldr x30, [sp], #16");
        // blr x9
        assert!(w.contains(&(0xd63f_0000 | (9 << 5))));
        let site = mc.reloc_sites[0];
        let word = u64::from_le_bytes(mc.code[site..site + 8].try_into().unwrap());
        assert_eq!((word >> 48) as u16, METHOD_TOKEN_PREFIX);
    }

    #[test]
    fn shifts_encode_as_ubfm() {
        let mc = lower_method(&method(vec![Fragment::BinOp {
            dst: "x".into(),
            op: Op::Shr,
            lhs: Value::Int(0x100),
            rhs: Value::Int(4),
        }]))
        .unwrap();
        let w = words(&mc.code);
        // lsr x0, x0, #4 == ubfm x0, x0, #4, #63
        assert!(w.contains(&(0xd340_0000 | (4 << 16) | (63 << 10))));

        let mc = lower_method(&method(vec![Fragment::BinOp {
            dst: "x".into(),
            op: Op::Shl,
            lhs: Value::Int(1),
            rhs: Value::Int(8),
        }]))
        .unwrap();
        let w = words(&mc.code);
        // lsl x0, x0, #8 == ubfm x0, x0, #56, #55
        assert!(w.contains(&(0xd340_0000 | (56 << 16) | (55 << 10))));
    }

    #[test]
    fn goto_branches_backward() {
        let mc = lower_method(&method(vec![
            Fragment::Label("top".into()),
            Fragment::Goto("top".into()),
        ]))
        .unwrap();
        let w = words(&mc.code);
        // b . (rel 0): the label sits at the branch itself.
        assert_eq!(w[0], 0x1400_0000);
    }

    #[test]
    fn compare_uses_inverse_condition() {
        let mc = lower_method(&method(vec![Fragment::If {
            cond: Cond::Compare(Value::Int(1), Relation::Lt, Value::Int(2)),
            then_block: vec![],
            else_block: vec![],
        }]))
        .unwrap();
        let w = words(&mc.code);
        // cmp x0, #2
        assert!(w.contains(&(0xf100_001f | (2 << 10))));
        // b.ge with rel 1 (next instruction)
        assert!(w.iter().any(|&i| i & 0xff00_000f == 0x5400_000a));
    }

    #[test]
    fn large_immediates_use_movk_halves() {
        let mc = lower_method(&method(vec![Fragment::Assign {
            name: "x".into(),
            value: Value::Int(0x0001_0002_0003_0004),
        }]))
        .unwrap();
        let w = words(&mc.code);
        assert!(w.contains(&(0xd280_0000 | (4 << 5)))); // movz x0, #4
        assert!(w.contains(&(0xf280_0000 | (1 << 21) | (3 << 5)))); // movk hw1
        assert!(w.contains(&(0xf280_0000 | (2 << 21) | (2 << 5)))); // movk hw2
        assert!(w.contains(&(0xf280_0000 | (3 << 21) | (1 << 5)))); // movk hw3
    }
}
