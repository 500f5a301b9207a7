//! Guest init code generator
//!
//! An architecture-neutral IR for straight-line syscall-driven programs,
//! lowered to x86-64 or ARM64 machine code and emitted as a standalone
//! position-dependent ELF. Method and global references are materialized as
//! 64-bit prefix tokens during lowering and patched by [`link`].

pub mod aarch64;
pub mod elf;
pub mod link;
pub mod x86_64;

use crate::{Error, Result};

/// High 16 bits of a method-address token.
pub const METHOD_TOKEN_PREFIX: u16 = 0x5ead;
/// High 16 bits of a global-address token.
pub const GLOBAL_TOKEN_PREFIX: u16 = 0x5eae;

/// 48-bit FNV-1a of a symbol name.
pub fn fnv48(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in name.as_bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash & 0x0000_ffff_ffff_ffff
}

/// The 64-bit token lowered for a method reference.
pub fn method_token(name: &str) -> u64 {
    ((METHOD_TOKEN_PREFIX as u64) << 48) | fnv48(name)
}

/// The 64-bit token lowered for a global reference.
pub fn global_token(name: &str) -> u64 {
    ((GLOBAL_TOKEN_PREFIX as u64) << 48) | fnv48(name)
}

/// Compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X86_64,
    Aarch64,
}

impl Target {
    /// write(2) syscall number, used by the printf lowering.
    fn sys_write(self) -> i64 {
        match self {
            Target::X86_64 => 1,
            Target::Aarch64 => 64,
        }
    }
}

/// A value an instruction operand can draw from.
#[derive(Debug, Clone)]
pub enum Value {
    /// Integer constant.
    Int(i64),
    /// A stack-frame variable.
    Var(String),
    /// Address of another method (patched at link time).
    Method(String),
    /// Address of a named global (patched at link time).
    Global(String),
}

impl Value {
    pub fn var(name: &str) -> Self {
        Value::Var(name.to_string())
    }
}

/// Comparison relations, signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Branch conditions.
#[derive(Debug, Clone)]
pub enum Cond {
    IsNegative(Value),
    IsZero(Value),
    Compare(Value, Relation, Value),
}

/// Two-operand integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    And,
    Shl,
    Shr,
}

/// Memory access width for load/store fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Quad,
}

/// One element of a printf-style debug write.
#[derive(Debug, Clone)]
pub enum PrintfPart {
    Text(String),
    /// Rendered as lowercase hex with leading zeros stripped.
    Hex(Value),
}

/// A straight-line program fragment.
#[derive(Debug, Clone)]
pub enum Fragment {
    /// Bind `name` to ABI argument register `index`, spilled on entry.
    DeclareParam { name: String, index: usize },
    /// `name = value`
    Assign { name: String, value: Value },
    /// `dst = *(base + disp)`
    LoadMem {
        dst: String,
        base: Value,
        disp: i32,
        width: Width,
    },
    /// `*(base + disp) = value`
    StoreMem {
        base: Value,
        disp: i32,
        value: Value,
        width: Width,
    },
    /// `dst = lhs op rhs`
    BinOp {
        dst: String,
        op: Op,
        lhs: Value,
        rhs: Value,
    },
    /// Platform syscall; result stored if requested.
    Syscall {
        nr: i64,
        args: Vec<Value>,
        result: Option<String>,
    },
    /// Conditional with then/else blocks.
    If {
        cond: Cond,
        then_block: Vec<Fragment>,
        else_block: Vec<Fragment>,
    },
    Label(String),
    Goto(String),
    /// Indirect call to another method by name.
    Call {
        method: String,
        args: Vec<Value>,
        result: Option<String>,
    },
    /// Formatted write to the debug channel (fd 1).
    Printf { parts: Vec<PrintfPart> },
    /// A typed stack-slot scope; slot names live for the whole frame.
    Scope { body: Vec<Fragment> },
}

/// A named global: zero-initialized storage in BSS.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub size: u64,
    pub align: u64,
}

/// One method: a named block of fragments.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub body: Vec<Fragment>,
}

/// A whole program. `methods[0]` is the entrypoint; globals are laid out in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub methods: Vec<Method>,
    pub globals: Vec<(String, Global)>,
}

impl Program {
    pub fn global(&mut self, name: &str, size: u64, align: u64) {
        self.globals.push((name.to_string(), Global { size, align }));
    }
}

/// Compile a program to a standalone ELF executable for `target`.
pub fn compile(program: &Program, target: Target) -> Result<Vec<u8>> {
    let lowered = expand_printf(program, target)?;
    let mut methods = Vec::with_capacity(lowered.methods.len());
    for method in &lowered.methods {
        let code = match target {
            Target::X86_64 => x86_64::lower_method(method)?,
            Target::Aarch64 => aarch64::lower_method(method)?,
        };
        methods.push((method.name.clone(), code));
    }
    let image = link::link(&methods, &lowered.globals)?;
    Ok(elf::emit(target, &image))
}

// ---------------------------------------------------------------------------
// Printf expansion
// ---------------------------------------------------------------------------

const PRINTF_BUF: &str = "__printf_buf";
const HEX_BUF: &str = "__hex_buf";
const PUT_HEX: &str = "__put_hex";

/// Rewrite every `Printf` fragment into primitive stores, syscalls, and a
/// call to a synthesized hex-formatting helper. Implicit storage lands in
/// BSS ahead of the program's declared globals.
fn expand_printf(program: &Program, target: Target) -> Result<Program> {
    let mut uses_printf = false;
    let mut uses_hex = false;
    let mut out = Program::default();
    for method in &program.methods {
        let mut body = Vec::new();
        expand_block(&method.body, target, &mut body, &mut uses_printf, &mut uses_hex)?;
        out.methods.push(Method {
            name: method.name.clone(),
            body,
        });
    }
    if uses_printf {
        out.globals.push((
            PRINTF_BUF.to_string(),
            Global {
                size: PRINTF_BUF_SIZE,
                align: 8,
            },
        ));
    }
    if uses_hex {
        out.globals
            .push((HEX_BUF.to_string(), Global { size: 16, align: 8 }));
        out.methods.push(put_hex_method(target));
    }
    out.globals.extend(program.globals.iter().cloned());
    Ok(out)
}

const PRINTF_BUF_SIZE: u64 = 128;

fn expand_block(
    block: &[Fragment],
    target: Target,
    out: &mut Vec<Fragment>,
    uses_printf: &mut bool,
    uses_hex: &mut bool,
) -> Result<()> {
    for frag in block {
        match frag {
            Fragment::Printf { parts } => {
                for part in parts {
                    match part {
                        PrintfPart::Text(text) => {
                            if text.len() as u64 > PRINTF_BUF_SIZE {
                                return Err(Error::Config(format!(
                                    "printf text of {} bytes exceeds the staging buffer",
                                    text.len()
                                )));
                            }
                            *uses_printf = true;
                            emit_text_write(text, target, out);
                        }
                        PrintfPart::Hex(value) => {
                            *uses_hex = true;
                            out.push(Fragment::Call {
                                method: PUT_HEX.to_string(),
                                args: vec![value.clone()],
                                result: None,
                            });
                        }
                    }
                }
            }
            Fragment::If {
                cond,
                then_block,
                else_block,
            } => {
                let mut then_out = Vec::new();
                let mut else_out = Vec::new();
                expand_block(then_block, target, &mut then_out, uses_printf, uses_hex)?;
                expand_block(else_block, target, &mut else_out, uses_printf, uses_hex)?;
                out.push(Fragment::If {
                    cond: cond.clone(),
                    then_block: then_out,
                    else_block: else_out,
                });
            }
            Fragment::Scope { body } => {
                let mut body_out = Vec::new();
                expand_block(body, target, &mut body_out, uses_printf, uses_hex)?;
                out.push(Fragment::Scope { body: body_out });
            }
            other => out.push(other.clone()),
        }
    }
    Ok(())
}

/// Stage a literal string in the printf buffer via immediate stores, then
/// write(1, buf, len).
fn emit_text_write(text: &str, target: Target, out: &mut Vec<Fragment>) {
    let bytes = text.as_bytes();
    let mut off = 0usize;
    while off < bytes.len() {
        let mut chunk = [0u8; 8];
        let n = (bytes.len() - off).min(8);
        chunk[..n].copy_from_slice(&bytes[off..off + n]);
        out.push(Fragment::StoreMem {
            base: Value::Global(PRINTF_BUF.to_string()),
            disp: off as i32,
            value: Value::Int(i64::from_le_bytes(chunk)),
            width: Width::Quad,
        });
        off += 8;
    }
    out.push(Fragment::Syscall {
        nr: target.sys_write(),
        args: vec![
            Value::Int(1),
            Value::Global(PRINTF_BUF.to_string()),
            Value::Int(bytes.len() as i64),
        ],
        result: None,
    });
}

/// The synthesized hex formatter: renders its argument into the hex buffer,
/// strips leading zeros (keeping at least one digit), and writes the result.
fn put_hex_method(target: Target) -> Method {
    use Fragment::*;
    let value = || Value::var("value");
    let body = vec![
        DeclareParam {
            name: "value".into(),
            index: 0,
        },
        // Render 16 nibbles, highest first.
        Assign {
            name: "i".into(),
            value: Value::Int(0),
        },
        Assign {
            name: "rest".into(),
            value: value(),
        },
        Label("render".into()),
        // digit = rest >> 60 (top nibble)
        BinOp {
            dst: "digit".into(),
            op: Op::Shr,
            lhs: Value::var("rest"),
            rhs: Value::Int(60),
        },
        If {
            cond: Cond::Compare(Value::var("digit"), Relation::Lt, Value::Int(10)),
            then_block: vec![BinOp {
                dst: "ch".into(),
                op: Op::Add,
                lhs: Value::var("digit"),
                rhs: Value::Int(b'0' as i64),
            }],
            else_block: vec![BinOp {
                dst: "ch".into(),
                op: Op::Add,
                lhs: Value::var("digit"),
                rhs: Value::Int(b'a' as i64 - 10),
            }],
        },
        BinOp {
            dst: "slot".into(),
            op: Op::Add,
            lhs: Value::Global(HEX_BUF.into()),
            rhs: Value::var("i"),
        },
        StoreMem {
            base: Value::var("slot"),
            disp: 0,
            value: Value::var("ch"),
            width: Width::Byte,
        },
        BinOp {
            dst: "rest".into(),
            op: Op::Shl,
            lhs: Value::var("rest"),
            rhs: Value::Int(4),
        },
        BinOp {
            dst: "i".into(),
            op: Op::Add,
            lhs: Value::var("i"),
            rhs: Value::Int(1),
        },
        If {
            cond: Cond::Compare(Value::var("i"), Relation::Lt, Value::Int(16)),
            then_block: vec![Goto("render".into())],
            else_block: vec![],
        },
        // Skip leading zeros, keeping the final digit.
        Assign {
            name: "start".into(),
            value: Value::Int(0),
        },
        Label("scan".into()),
        If {
            cond: Cond::Compare(Value::var("start"), Relation::Ge, Value::Int(15)),
            then_block: vec![Goto("emit".into())],
            else_block: vec![],
        },
        BinOp {
            dst: "slot".into(),
            op: Op::Add,
            lhs: Value::Global(HEX_BUF.into()),
            rhs: Value::var("start"),
        },
        LoadMem {
            dst: "ch".into(),
            base: Value::var("slot"),
            disp: 0,
            width: Width::Byte,
        },
        If {
            cond: Cond::Compare(Value::var("ch"), Relation::Ne, Value::Int(b'0' as i64)),
            then_block: vec![Goto("emit".into())],
            else_block: vec![],
        },
        BinOp {
            dst: "start".into(),
            op: Op::Add,
            lhs: Value::var("start"),
            rhs: Value::Int(1),
        },
        Goto("scan".into()),
        Label("emit".into()),
        BinOp {
            dst: "ptr".into(),
            op: Op::Add,
            lhs: Value::Global(HEX_BUF.into()),
            rhs: Value::var("start"),
        },
        BinOp {
            dst: "len".into(),
            op: Op::Sub,
            lhs: Value::Int(16),
            rhs: Value::var("start"),
        },
        Syscall {
            nr: target.sys_write(),
            args: vec![Value::Int(1), Value::var("ptr"), Value::var("len")],
            result: None,
        },
    ];
    Method {
        name: PUT_HEX.into(),
        body,
    }
}

/// Collect every frame variable a method references, in first-use order.
pub(crate) fn frame_vars(method: &Method) -> Vec<String> {
    fn add(vars: &mut Vec<String>, name: &str) {
        if !vars.iter().any(|v| v == name) {
            vars.push(name.to_string());
        }
    }
    fn add_value(vars: &mut Vec<String>, value: &Value) {
        if let Value::Var(name) = value {
            add(vars, name);
        }
    }
    fn walk(vars: &mut Vec<String>, block: &[Fragment]) {
        for frag in block {
            match frag {
                Fragment::DeclareParam { name, .. } => add(vars, name),
                Fragment::Assign { name, value } => {
                    add_value(vars, value);
                    add(vars, name);
                }
                Fragment::LoadMem { dst, base, .. } => {
                    add_value(vars, base);
                    add(vars, dst);
                }
                Fragment::StoreMem { base, value, .. } => {
                    add_value(vars, base);
                    add_value(vars, value);
                }
                Fragment::BinOp { dst, lhs, rhs, .. } => {
                    add_value(vars, lhs);
                    add_value(vars, rhs);
                    add(vars, dst);
                }
                Fragment::Syscall { args, result, .. } => {
                    for a in args {
                        add_value(vars, a);
                    }
                    if let Some(r) = result {
                        add(vars, r);
                    }
                }
                Fragment::If {
                    cond,
                    then_block,
                    else_block,
                } => {
                    match cond {
                        Cond::IsNegative(v) | Cond::IsZero(v) => add_value(vars, v),
                        Cond::Compare(a, _, b) => {
                            add_value(vars, a);
                            add_value(vars, b);
                        }
                    }
                    walk(vars, then_block);
                    walk(vars, else_block);
                }
                Fragment::Call { args, result, .. } => {
                    for a in args {
                        add_value(vars, a);
                    }
                    if let Some(r) = result {
                        add(vars, r);
                    }
                }
                Fragment::Scope { body } => walk(vars, body),
                Fragment::Printf { parts } => {
                    for p in parts {
                        if let PrintfPart::Hex(v) = p {
                            add_value(vars, v);
                        }
                    }
                }
                Fragment::Label(_) | Fragment::Goto(_) => {}
            }
        }
    }
    let mut vars = Vec::new();
    walk(&mut vars, &method.body);
    vars
}

/// Frame size for a variable count: 8 bytes per slot, 16-byte aligned.
pub(crate) fn frame_size(nvars: usize) -> u32 {
    ((nvars as u32 * 8) + 15) & !15
}
