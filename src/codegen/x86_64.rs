//! x86-64 lowering
//!
//! Frame variables live at fixed offsets from RSP. Register allocation is
//! scope-local and pool-based, with RAX as the hot scratch register and the
//! syscall/call ABI registers handed out as preferred hints so argument
//! marshalling needs no extra moves.

use std::collections::HashMap;

use super::link::MethodCode;
use super::{
    frame_size, frame_vars, global_token, method_token, Cond, Fragment, Method, Op, Relation,
    Value, Width,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg(u8);

const RAX: Reg = Reg(0);
const RCX: Reg = Reg(1);
const RDX: Reg = Reg(2);
const RSI: Reg = Reg(6);
const RDI: Reg = Reg(7);
const R8: Reg = Reg(8);
const R9: Reg = Reg(9);
const R10: Reg = Reg(10);
const R11: Reg = Reg(11);

/// Caller-saved scratch pool, preference order (RAX first: the hot register).
const POOL: [Reg; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

/// Syscall argument registers, in order.
const SYSCALL_ABI: [Reg; 6] = [RDI, RSI, RDX, R10, R8, R9];

/// Method-call argument registers (System V).
const CALL_ABI: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

struct Emitter {
    code: Vec<u8>,
    reloc_sites: Vec<usize>,
    labels: HashMap<String, usize>,
    /// (offset of rel32 field, target label)
    fixups: Vec<(usize, String)>,
    free: Vec<Reg>,
    slots: HashMap<String, u32>,
    label_seq: usize,
}

pub fn lower_method(method: &Method) -> Result<MethodCode> {
    let vars = frame_vars(method);
    let frame = frame_size(vars.len());
    let mut e = Emitter {
        code: Vec::new(),
        reloc_sites: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
        free: POOL.to_vec(),
        slots: vars
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32 * 8))
            .collect(),
        label_seq: 0,
    };

    if frame > 0 {
        e.sub_rsp(frame);
    }
    e.lower_block(&method.body)?;
    if frame > 0 {
        e.add_rsp(frame);
    }
    e.code.push(0xc3); // ret
    e.resolve_fixups(&method.name)?;
    Ok(MethodCode {
        code: e.code,
        reloc_sites: e.reloc_sites,
    })
}

impl Emitter {
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

    // --- raw encoding ---

    fn rex(&mut self, w: bool, reg: Reg, base: Reg) {
        let mut v = 0x40u8;
        if w {
            v |= 0x08;
        }
        if reg.0 >= 8 {
            v |= 0x04;
        }
        if base.0 >= 8 {
            v |= 0x01;
        }
        self.code.push(v);
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.code.push((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM+SIB+disp32 for `[rsp + disp]`.
    fn rsp_mem(&mut self, reg: Reg, disp: u32) {
        self.modrm(0b10, reg.0, 0b100);
        self.code.push(0x24); // SIB: base=rsp, no index
        self.code.extend_from_slice(&disp.to_le_bytes());
    }

    /// ModRM+disp32 for `[base + disp]` with a pool base register.
    fn base_mem(&mut self, reg: Reg, base: Reg, disp: i32) {
        self.modrm(0b10, reg.0, base.0);
        self.code.extend_from_slice(&disp.to_le_bytes());
    }

    fn mov_imm64(&mut self, reg: Reg, imm: u64) {
        self.rex(true, Reg(0), reg);
        self.code.push(0xb8 + (reg.0 & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    fn mov_token(&mut self, reg: Reg, token: u64) {
        self.rex(true, Reg(0), reg);
        self.code.push(0xb8 + (reg.0 & 7));
        self.reloc_sites.push(self.code.len());
        self.code.extend_from_slice(&token.to_le_bytes());
    }

    fn mov_imm(&mut self, reg: Reg, imm: i64) {
        if let Ok(v) = i32::try_from(imm) {
            // Sign-extended 32-bit form.
            self.rex(true, Reg(0), reg);
            self.code.push(0xc7);
            self.modrm(0b11, 0, reg.0);
            self.code.extend_from_slice(&v.to_le_bytes());
        } else {
            self.mov_imm64(reg, imm as u64);
        }
    }

    fn load_var(&mut self, reg: Reg, disp: u32) {
        self.rex(true, reg, Reg(0));
        self.code.push(0x8b);
        self.rsp_mem(reg, disp);
    }

    fn store_var(&mut self, reg: Reg, disp: u32) {
        self.rex(true, reg, Reg(0));
        self.code.push(0x89);
        self.rsp_mem(reg, disp);
    }

    fn load_mem(&mut self, dst: Reg, base: Reg, disp: i32, width: Width) {
        match width {
            Width::Quad => {
                self.rex(true, dst, base);
                self.code.push(0x8b);
                self.base_mem(dst, base, disp);
            }
            Width::Byte => {
                // movzx r64, byte ptr [base+disp]
                self.rex(true, dst, base);
                self.code.push(0x0f);
                self.code.push(0xb6);
                self.base_mem(dst, base, disp);
            }
        }
    }

    fn store_mem(&mut self, value: Reg, base: Reg, disp: i32, width: Width) {
        match width {
            Width::Quad => {
                self.rex(true, value, base);
                self.code.push(0x89);
                self.base_mem(value, base, disp);
            }
            Width::Byte => {
                self.rex(false, value, base);
                self.code.push(0x88);
                self.base_mem(value, base, disp);
            }
        }
    }

    fn alu_reg(&mut self, opcode: u8, src: Reg, dst: Reg) {
        self.rex(true, src, dst);
        self.code.push(opcode);
        self.modrm(0b11, src.0, dst.0);
    }

    /// `81 /n` or `83 /n` immediate ALU form.
    fn alu_imm(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex(true, Reg(0), dst);
        if let Ok(v) = i8::try_from(imm) {
            self.code.push(0x83);
            self.modrm(0b11, ext, dst.0);
            self.code.push(v as u8);
        } else {
            self.code.push(0x81);
            self.modrm(0b11, ext, dst.0);
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    fn shift_imm(&mut self, ext: u8, dst: Reg, amount: u8) {
        self.rex(true, Reg(0), dst);
        self.code.push(0xc1);
        self.modrm(0b11, ext, dst.0);
        self.code.push(amount);
    }

    fn shift_cl(&mut self, ext: u8, dst: Reg) {
        self.rex(true, Reg(0), dst);
        self.code.push(0xd3);
        self.modrm(0b11, ext, dst.0);
    }

    fn test(&mut self, reg: Reg) {
        self.rex(true, reg, reg);
        self.code.push(0x85);
        self.modrm(0b11, reg.0, reg.0);
    }

    fn sub_rsp(&mut self, n: u32) {
        self.code.extend_from_slice(&[0x48, 0x81, 0xec]);
        self.code.extend_from_slice(&n.to_le_bytes());
    }

    fn add_rsp(&mut self, n: u32) {
        self.code.extend_from_slice(&[0x48, 0x81, 0xc4]);
        self.code.extend_from_slice(&n.to_le_bytes());
    }

    fn syscall(&mut self) {
        self.code.extend_from_slice(&[0x0f, 0x05]);
    }

    fn call_reg(&mut self, reg: Reg) {
        if reg.0 >= 8 {
            self.code.push(0x41);
        }
        self.code.push(0xff);
        self.modrm(0b11, 2, reg.0);
    }

    /// Conditional jump with a label fixup; `cc` is the low opcode nibble.
    fn jcc(&mut self, cc: u8, label: &str) {
        self.code.push(0x0f);
        self.code.push(0x80 | cc);
        self.fixups.push((self.code.len(), label.to_string()));
        self.code.extend_from_slice(&[0; 4]);
    }

    fn jmp(&mut self, label: &str) {
        self.code.push(0xe9);
        self.fixups.push((self.code.len(), label.to_string()));
        self.code.extend_from_slice(&[0; 4]);
    }

    fn bind_label(&mut self, name: &str) -> Result<()> {
        if self.labels.insert(name.to_string(), self.code.len()).is_some() {
            return Err(Error::Config(format!("duplicate label {name:?}")));
        }
        Ok(())
    }

    fn resolve_fixups(&mut self, method: &str) -> Result<()> {
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = *self.labels.get(&label).ok_or_else(|| {
                Error::Config(format!("undefined label {label:?} in method {method:?}"))
            })?;
            let rel = target as i64 - (pos as i64 + 4);
            let rel = i32::try_from(rel)
                .map_err(|_| Error::Config(format!("branch to {label:?} out of range")))?;
            self.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.label_seq += 1;
        format!("__{stem}_{}", self.label_seq)
    }

    // --- value evaluation ---

    fn eval(&mut self, value: &Value, preferred: Option<Reg>) -> Result<Reg> {
        let reg = self.alloc(preferred)?;
        match value {
            Value::Int(v) => self.mov_imm(reg, *v),
            Value::Var(name) => {
                let slot = self.slot(name)?;
                self.load_var(reg, slot);
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
                let reg = *CALL_ABI
                    .get(*index)
                    .ok_or_else(|| Error::Config(format!("parameter index {index} too high")))?;
                let slot = self.slot(name)?;
                self.store_var(reg, slot);
            }
            Fragment::Assign { name, value } => {
                let reg = self.eval(value, Some(RAX))?;
                let slot = self.slot(name)?;
                self.store_var(reg, slot);
                self.release(reg);
            }
            Fragment::LoadMem {
                dst,
                base,
                disp,
                width,
            } => {
                let b = self.eval(base, None)?;
                let d = self.alloc(Some(RAX))?;
                self.load_mem(d, b, *disp, *width);
                let slot = self.slot(dst)?;
                self.store_var(d, slot);
                self.release(d);
                self.release(b);
            }
            Fragment::StoreMem {
                base,
                disp,
                value,
                width,
            } => {
                let v = self.eval(value, Some(RAX))?;
                let b = self.eval(base, None)?;
                self.store_mem(v, b, *disp, *width);
                self.release(b);
                self.release(v);
            }
            Fragment::BinOp { dst, op, lhs, rhs } => {
                let d = self.eval(lhs, Some(RAX))?;
                self.lower_op(*op, d, rhs)?;
                let slot = self.slot(dst)?;
                self.store_var(d, slot);
                self.release(d);
            }
            Fragment::Syscall { nr, args, result } => {
                if args.len() > SYSCALL_ABI.len() {
                    return Err(Error::Config(format!(
                        "syscall with {} arguments (max 6)",
                        args.len()
                    )));
                }
                let mut used = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    let reg = self.eval(arg, Some(SYSCALL_ABI[i]))?;
                    if reg != SYSCALL_ABI[i] {
                        return Err(Error::Config(
                            "syscall argument register unavailable".into(),
                        ));
                    }
                    used.push(reg);
                }
                let nr_reg = self.alloc(Some(RAX))?;
                if nr_reg != RAX {
                    return Err(Error::Config("RAX unavailable for syscall number".into()));
                }
                self.mov_imm(nr_reg, *nr);
                self.syscall();
                if let Some(result) = result {
                    let slot = self.slot(result)?;
                    self.store_var(RAX, slot);
                }
                self.release(nr_reg);
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
                    self.jmp(&end_label);
                }
                self.bind_label(&else_label)?;
                self.lower_block(else_block)?;
                if !else_block.is_empty() {
                    self.bind_label(&end_label)?;
                }
            }
            Fragment::Label(name) => self.bind_label(name)?,
            Fragment::Goto(name) => self.jmp(name),
            Fragment::Call {
                method,
                args,
                result,
            } => {
                if args.len() > CALL_ABI.len() {
                    return Err(Error::Config(format!(
                        "call with {} arguments (max 6)",
                        args.len()
                    )));
                }
                let mut used = Vec::new();
                for (i, arg) in args.iter().enumerate() {
                    let reg = self.eval(arg, Some(CALL_ABI[i]))?;
                    if reg != CALL_ABI[i] {
                        return Err(Error::Config("call argument register unavailable".into()));
                    }
                    used.push(reg);
                }
                let addr = self.alloc(Some(RAX))?;
                self.mov_token(addr, method_token(method));
                self.call_reg(addr);
                if let Some(result) = result {
                    let slot = self.slot(result)?;
                    self.store_var(RAX, slot);
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
            Op::Add | Op::Sub | Op::And => {
                let (imm_ext, reg_op) = match op {
                    Op::Add => (0, 0x01),
                    Op::Sub => (5, 0x29),
                    Op::And => (4, 0x21),
                    _ => unreachable!(),
                };
                match rhs {
                    Value::Int(v) if i32::try_from(*v).is_ok() => {
                        self.alu_imm(imm_ext, dst, *v as i32);
                    }
                    other => {
                        let r = self.eval(other, None)?;
                        self.alu_reg(reg_op, r, dst);
                        self.release(r);
                    }
                }
            }
            Op::Shl | Op::Shr => {
                let ext = if op == Op::Shl { 4 } else { 5 };
                match rhs {
                    Value::Int(v) if (0..64).contains(v) => self.shift_imm(ext, dst, *v as u8),
                    other => {
                        // Variable shift counts go through CL.
                        let r = self.eval(other, Some(RCX))?;
                        if r != RCX {
                            return Err(Error::Config("RCX unavailable for shift count".into()));
                        }
                        self.shift_cl(ext, dst);
                        self.release(r);
                    }
                }
            }
        }
        Ok(())
    }

    /// Branch to `target` when `cond` is FALSE.
    fn lower_cond_branch(&mut self, cond: &Cond, target: &str) -> Result<()> {
        match cond {
            Cond::IsNegative(v) => {
                let r = self.eval(v, Some(RAX))?;
                self.test(r);
                self.release(r);
                self.jcc(0x9, target); // jns
            }
            Cond::IsZero(v) => {
                let r = self.eval(v, Some(RAX))?;
                self.test(r);
                self.release(r);
                self.jcc(0x5, target); // jnz
            }
            Cond::Compare(a, rel, b) => {
                let ra = self.eval(a, Some(RAX))?;
                match b {
                    Value::Int(v) if i32::try_from(*v).is_ok() => {
                        self.alu_imm(7, ra, *v as i32);
                    }
                    other => {
                        let rb = self.eval(other, None)?;
                        self.alu_reg(0x39, rb, ra);
                        self.release(rb);
                    }
                }
                self.release(ra);
                // Jump on the inverse relation.
                let cc = match rel {
                    Relation::Eq => 0x5, // jne
                    Relation::Ne => 0x4, // je
                    Relation::Lt => 0xd, // jge
                    Relation::Le => 0xf, // jg
                    Relation::Gt => 0xe, // jle
                    Relation::Ge => 0xc, // jl
                };
                self.jcc(cc, target);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::METHOD_TOKEN_PREFIX;

    fn method(body: Vec<Fragment>) -> Method {
        Method {
            name: "m".into(),
            body,
        }
    }

    /// Find a byte pattern in emitted code.
    fn contains(code: &[u8], needle: &[u8]) -> bool {
        code.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn empty_method_is_bare_ret() {
        let mc = lower_method(&method(vec![])).unwrap();
        assert_eq!(mc.code, vec![0xc3]);
    }

    #[test]
    fn assign_emits_frame_and_spill() {
        let mc = lower_method(&method(vec![Fragment::Assign {
            name: "x".into(),
            value: Value::Int(5),
        }]))
        .unwrap();
        // sub rsp, 16
        assert_eq!(&mc.code[..7], &[0x48, 0x81, 0xec, 0x10, 0, 0, 0]);
        // mov rax, 5 (sign-extended imm32 form)
        assert!(contains(&mc.code, &[0x48, 0xc7, 0xc0, 5, 0, 0, 0]));
        // mov [rsp+0], rax
        assert!(contains(&mc.code, &[0x48, 0x89, 0x84, 0x24, 0, 0, 0, 0]));
        assert_eq!(*mc.code.last().unwrap(), 0xc3);
    }

    #[test]
    fn syscall_marshalling_zero_one_three_six() {
        for nargs in [0usize, 1, 3, 6] {
            let args: Vec<Value> = (0..nargs).map(|i| Value::Int(i as i64 + 10)).collect();
            let mc = lower_method(&method(vec![Fragment::Syscall {
                nr: 60,
                args,
                result: None,
            }]))
            .unwrap();
            assert!(contains(&mc.code, &[0x0f, 0x05]), "syscall insn");
            // mov rax, 60 right before syscall
            assert!(contains(&mc.code, &[0x48, 0xc7, 0xc0, 60, 0, 0, 0, 0x0f, 0x05]));
            if nargs >= 1 {
                // mov rdi, 10
                assert!(contains(&mc.code, &[0x48, 0xc7, 0xc7, 10, 0, 0, 0]));
            }
            if nargs >= 3 {
                // mov rdx, 12
                assert!(contains(&mc.code, &[0x48, 0xc7, 0xc2, 12, 0, 0, 0]));
            }
            if nargs == 6 {
                // mov r9, 15
                assert!(contains(&mc.code, &[0x49, 0xc7, 0xc1, 15, 0, 0, 0]));
            }
        }
    }

    #[test]
    fn syscall_mixes_immediates_and_variables() {
        let mc = lower_method(&method(vec![
            Fragment::Assign {
                name: "fd".into(),
                value: Value::Int(1),
            },
            Fragment::Syscall {
                nr: 1,
                args: vec![Value::var("fd"), Value::Int(0), Value::Int(0)],
                result: Some("ret".into()),
            },
        ]))
        .unwrap();
        // mov rdi, [rsp+0]
        assert!(contains(&mc.code, &[0x48, 0x8b, 0xbc, 0x24, 0, 0, 0, 0]));
        // result spill: mov [rsp+8], rax
        assert!(contains(&mc.code, &[0x48, 0x89, 0x84, 0x24, 8, 0, 0, 0]));
    }

    #[test]
    fn method_reference_is_a_recorded_token() {
        let mc = lower_method(&method(vec![Fragment::Call {
            method: "helper".into(),
            args: vec![],
            result: None,
        }]))
        .unwrap();
        assert_eq!(mc.reloc_sites.len(), 1);
        let site = mc.reloc_sites[0];
        let word = u64::from_le_bytes(mc.code[site..site + 8].try_into().unwrap());
        assert_eq!((word >> 48) as u16, METHOD_TOKEN_PREFIX);
        // call rax
        assert!(contains(&mc.code, &[0xff, 0xd0]));
    }

    #[test]
    fn goto_and_label_resolve() {
        let mc = lower_method(&method(vec![
            Fragment::Label("top".into()),
            Fragment::Goto("top".into()),
        ]))
        .unwrap();
        // jmp rel32 = -5 (back to the label at the jmp's own start).
        assert_eq!(&mc.code[..5], &[0xe9, 0xfb, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn undefined_label_fails() {
        assert!(lower_method(&method(vec![Fragment::Goto("nowhere".into())])).is_err());
    }

    #[test]
    fn compare_branches_on_inverse_condition() {
        let mc = lower_method(&method(vec![Fragment::If {
            cond: Cond::Compare(Value::Int(1), Relation::Lt, Value::Int(2)),
            then_block: vec![],
            else_block: vec![],
        }]))
        .unwrap();
        // cmp rax, 2 (imm8 form) then jge rel32
        assert!(contains(&mc.code, &[0x48, 0x83, 0xf8, 2, 0x0f, 0x8d]));
    }

    #[test]
    fn shifts_use_imm_or_cl() {
        let mc = lower_method(&method(vec![Fragment::BinOp {
            dst: "x".into(),
            op: Op::Shr,
            lhs: Value::Int(256),
            rhs: Value::Int(4),
        }]))
        .unwrap();
        // shr rax, 4
        assert!(contains(&mc.code, &[0x48, 0xc1, 0xe8, 4]));

        let mc = lower_method(&method(vec![Fragment::BinOp {
            dst: "x".into(),
            op: Op::Shl,
            lhs: Value::Int(1),
            rhs: Value::var("n"),
        }]))
        .unwrap();
        // shl rax, cl
        assert!(contains(&mc.code, &[0x48, 0xd3, 0xe0]));
    }

    #[test]
    fn byte_store_uses_byte_opcode() {
        let mc = lower_method(&method(vec![Fragment::StoreMem {
            base: Value::var("p"),
            disp: 0,
            value: Value::Int(65),
            width: Width::Byte,
        }]))
        .unwrap();
        // mov byte [rcx+disp32], al : REX 88 /r
        assert!(contains(&mc.code, &[0x40, 0x88, 0x81, 0, 0, 0, 0]));
    }

    #[test]
    fn large_immediates_use_movabs() {
        let mc = lower_method(&method(vec![Fragment::Assign {
            name: "x".into(),
            value: Value::Int(0x1122_3344_5566_7788),
        }]))
        .unwrap();
        // movabs rax, imm64
        assert!(contains(
            &mc.code,
            &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        ));
    }
}
