use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use thiserror::Error;

use super::spec::{AluOp, Cond, ImmOp, Instruction, MemOp, Reg, RelOp, REL_OFFSET_MAX, REL_OFFSET_MIN};
use crate::rom::{Rom, RomError};

const ADDR_SPACE_END: u32 = 0x10000;

pub fn assemble(asm: &str) -> Result<Image, AsmError> {
    let lines = asm.split('\n').map(|x| x.to_string()).collect();
    let assembler = Assembler::new(lines);
    assembler.assemble()
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct AsmError {
    pub line: usize,
    pub kind: AsmErrorKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmErrorKind {
    #[error("cannot parse `{0}`")]
    Syntax(String),
    #[error("unknown mnemonic `{0}`")]
    UnknownMnemonic(String),
    #[error("unknown directive `.{0}`")]
    UnknownDirective(String),
    #[error("`{mnemonic}` expects {expected} operand(s), found {found}")]
    OperandCount {
        mnemonic: String,
        expected: &'static str,
        found: usize,
    },
    #[error("`{0}` is not a register")]
    BadRegister(String),
    #[error("undefined symbol `{0}`")]
    UndefinedSymbol(String),
    #[error("`{0}` is already defined")]
    Redefined(String),
    #[error("value {value} does not fit in {what}")]
    OutOfRange { value: i64, what: &'static str },
    #[error("jump target {target:#06x} is out of relative range")]
    JumpOutOfRange { target: i64 },
    #[error("jump target {target:#06x} is not word aligned")]
    Misaligned { target: i64 },
    #[error("cannot move location counter back from {from:#06x} to {to:#06x}")]
    Backwards { from: u32, to: u32 },
    #[error("image extends past 0xffff")]
    Overflow,
}

/// Assembled bytes starting at `origin`, with the symbol table that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub origin: u16,
    pub bytes: Vec<u8>,
    symbols: BTreeMap<String, i64>,
}

impl Image {
    /// One past the last byte; may be 0x10000.
    pub fn end(&self) -> u32 {
        self.origin as u32 + self.bytes.len() as u32
    }

    pub fn symbols(&self) -> &BTreeMap<String, i64> {
        &self.symbols
    }

    pub fn symbol(&self, name: &str) -> Option<u16> {
        self.symbols.get(name).map(|v| *v as u16)
    }

    pub fn to_rom(&self) -> Result<Rom, RomError> {
        Rom::from_image(self)
    }

    pub fn to_hex_listing(&self) -> String {
        self.bytes
            .chunks(16)
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "{:04x}: {}",
                    self.origin as usize + i * 16,
                    chunk.iter().map(|b| format!("{:02x}", b)).join(" ")
                )
            })
            .join("\n")
    }
}

#[derive(Debug, PartialEq)]
enum Statement {
    Label { name: String },
    Directive { name: String, args: String },
    Instruction { mnemonic: String, operands: Vec<String> },
}

// output of the layout pass, each piece pinned to its address
#[derive(Debug)]
enum Item {
    Fill,
    Words(Vec<String>),
    Bytes(Vec<String>),
    Ascii(Vec<u8>),
    Instruction { mnemonic: String, operands: Vec<String> },
}

struct Assembler {
    lines: Vec<(usize, String)>,
    symbols: HashMap<String, i64>,
}

impl Assembler {
    fn new(lines: Vec<String>) -> Self {
        Assembler {
            lines: lines
                .into_iter()
                .enumerate()
                .map(|(i, l)| (i + 1, l))
                .collect(),
            symbols: HashMap::new(),
        }
    }

    fn pre_process(&mut self) {
        // remove comments and trim
        for (_, l) in self.lines.iter_mut() {
            *l = strip_comment(l).trim().to_string();
        }
        // remove empty lines
        self.lines.retain(|(_, l)| !l.is_empty());
    }

    fn define(&mut self, name: &str, value: i64) -> Result<(), AsmErrorKind> {
        if self.symbols.contains_key(name) {
            return Err(AsmErrorKind::Redefined(name.to_string()));
        }
        self.symbols.insert(name.to_string(), value);
        Ok(())
    }

    fn assemble(mut self) -> Result<Image, AsmError> {
        self.pre_process();

        let lines = std::mem::take(&mut self.lines);
        let mut statements: Vec<(usize, Statement)> = vec![];
        for (line, text) in lines.iter() {
            let parsed = parse_line(text).map_err(|kind| AsmError { line: *line, kind })?;
            statements.extend(parsed.into_iter().map(|s| (*line, s)));
        }

        // calculate addr for labels and lay out every statement
        let mut origin: Option<u32> = None;
        let mut curr_addr: u32 = 0;
        let mut items: Vec<(usize, u32, Item)> = vec![];
        for (line, s) in statements.into_iter() {
            let err = |kind| AsmError { line, kind };
            let (item, size) = match s {
                Statement::Label { name } => {
                    self.define(&name, curr_addr as i64).map_err(err)?;
                    continue;
                }
                Statement::Directive { name, args } => {
                    match self.layout_directive(&name, &args, &mut origin, curr_addr) {
                        Ok(Some(Layout::Emit(item, size))) => (item, size),
                        Ok(Some(Layout::MoveTo(target))) => {
                            curr_addr = target;
                            items.push((line, curr_addr, Item::Fill));
                            continue;
                        }
                        Ok(None) => continue,
                        Err(kind) => return Err(err(kind)),
                    }
                }
                Statement::Instruction { mnemonic, operands } => {
                    let size = instruction_size(&mnemonic)
                        .ok_or_else(|| err(AsmErrorKind::UnknownMnemonic(mnemonic.clone())))?;
                    (Item::Instruction { mnemonic, operands }, size)
                }
            };
            origin.get_or_insert(curr_addr);
            items.push((line, curr_addr, item));
            curr_addr += size;
            if curr_addr > ADDR_SPACE_END {
                return Err(err(AsmErrorKind::Overflow));
            }
        }

        // assemble each item with every symbol known
        let origin = origin.unwrap_or(0);
        let mut result: Vec<u8> = vec![];
        for (line, addr, item) in items.iter() {
            let err = |kind| AsmError { line: *line, kind };
            result.resize((addr - origin) as usize, 0);
            match item {
                Item::Fill => {}
                Item::Words(values) => {
                    for v in values {
                        let word = self.eval_ranged(v, -0x8000, 0xffff, "16 bits").map_err(err)?;
                        result.extend(&(word as u16).to_le_bytes());
                    }
                }
                Item::Bytes(values) => {
                    for v in values {
                        let byte = self.eval_ranged(v, -0x80, 0xff, "8 bits").map_err(err)?;
                        result.push(byte as u8);
                    }
                }
                Item::Ascii(bytes) => result.extend(bytes),
                Item::Instruction { mnemonic, operands } => {
                    let insts = self
                        .build_instruction(mnemonic, operands, *addr)
                        .map_err(err)?;
                    for inst in insts {
                        // instructions are stored big-endian
                        result.extend(&inst.encode().to_be_bytes());
                    }
                }
            }
        }

        debug!(
            "assembled {} bytes at {:04x}, {} symbols",
            result.len(),
            origin,
            self.symbols.len()
        );
        Ok(Image {
            origin: origin as u16,
            bytes: result,
            symbols: self.symbols.into_iter().collect(),
        })
    }

    fn layout_directive(
        &mut self,
        name: &str,
        args: &str,
        origin: &mut Option<u32>,
        curr_addr: u32,
    ) -> Result<Option<Layout>, AsmErrorKind> {
        lazy_static! {
            static ref SET_RE: Regex =
                Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\s*,\s*|\s+)(.+)$").unwrap();
        }

        match &name.to_lowercase()[..] {
            "org" => {
                let target = self.eval_ranged(args, 0, 0xffff, "an address")? as u32;
                // the first .org places the image, later ones only move forward
                if origin.is_none() {
                    *origin = Some(target);
                } else if target < curr_addr {
                    return Err(AsmErrorKind::Backwards {
                        from: curr_addr,
                        to: target,
                    });
                }
                Ok(Some(Layout::MoveTo(target)))
            }
            "spaceto" => {
                let target = self.eval_ranged(args, 0, ADDR_SPACE_END as i64, "an address")? as u32;
                if target < curr_addr {
                    return Err(AsmErrorKind::Backwards {
                        from: curr_addr,
                        to: target,
                    });
                }
                origin.get_or_insert(curr_addr);
                Ok(Some(Layout::MoveTo(target)))
            }
            "set" => {
                let cap = SET_RE
                    .captures(args)
                    .ok_or_else(|| AsmErrorKind::Syntax(format!(".set {}", args)))?;
                let value = self.eval(&cap[2])?;
                self.define(&cap[1], value)?;
                Ok(None)
            }
            "data" => {
                let values = split_operands(args);
                let size = 2 * values.len() as u32;
                Ok(Some(Layout::Emit(Item::Words(values), size)))
            }
            "byte" => {
                let values = split_operands(args);
                let size = values.len() as u32;
                Ok(Some(Layout::Emit(Item::Bytes(values), size)))
            }
            "ascii" => {
                let bytes = parse_string(args)?;
                let size = bytes.len() as u32;
                Ok(Some(Layout::Emit(Item::Ascii(bytes), size)))
            }
            _ => Err(AsmErrorKind::UnknownDirective(name.to_string())),
        }
    }

    fn eval(&self, expr: &str) -> Result<i64, AsmErrorKind> {
        eval_expr(expr, &self.symbols)
    }

    fn eval_ranged(
        &self,
        expr: &str,
        min: i64,
        max: i64,
        what: &'static str,
    ) -> Result<i64, AsmErrorKind> {
        let value = self.eval(expr)?;
        if value < min || value > max {
            return Err(AsmErrorKind::OutOfRange { value, what });
        }
        Ok(value)
    }

    fn build_instruction(
        &self,
        mnemonic: &str,
        operands: &[String],
        addr: u32,
    ) -> Result<Vec<Instruction>, AsmErrorKind> {
        use Instruction::*;

        let mnemonic = mnemonic.to_lowercase();
        let expect = |counts: &[usize], expected: &'static str| {
            if counts.contains(&operands.len()) {
                Ok(())
            } else {
                Err(AsmErrorKind::OperandCount {
                    mnemonic: mnemonic.clone(),
                    expected,
                    found: operands.len(),
                })
            }
        };
        let reg = |i: usize| parse_reg(&operands[i]);
        let reg_or_zero = |i: usize| {
            if i < operands.len() {
                parse_reg(&operands[i])
            } else {
                Ok(Reg::ZERO)
            }
        };

        let inst = match &mnemonic[..] {
            "ldi" | "ldh" | "adi" | "sbi" => {
                expect(&[2], "2")?;
                let (op, min) = match &mnemonic[..] {
                    "ldi" => (ImmOp::Ldi, -0x80),
                    "ldh" => (ImmOp::Ldh, 0),
                    "adi" => (ImmOp::Adi, 0),
                    _ => (ImmOp::Sbi, 0),
                };
                let imm = self.eval_ranged(&operands[1], min, 0xff, "8 bits")?;
                Imm {
                    op,
                    rd: reg(0)?,
                    imm: imm as u8,
                }
            }
            "li" => {
                expect(&[2], "2")?;
                let rd = reg(0)?;
                let value = self.eval_ranged(&operands[1], -0x8000, 0xffff, "16 bits")? as u16;
                return Ok(vec![
                    Imm {
                        op: ImmOp::Ldi,
                        rd,
                        imm: value as u8,
                    },
                    Imm {
                        op: ImmOp::Ldh,
                        rd,
                        imm: (value >> 8) as u8,
                    },
                ]);
            }
            "ldw" | "stw" | "ldb" | "stb" => {
                expect(&[2, 3], "2 or 3")?;
                let op = match &mnemonic[..] {
                    "ldw" => MemOp::Ldw,
                    "stw" => MemOp::Stw,
                    "ldb" => MemOp::Ldb,
                    _ => MemOp::Stb,
                };
                Mem {
                    op,
                    rd: reg(0)?,
                    ra: reg(1)?,
                    ro: reg_or_zero(2)?,
                }
            }
            "rjmp" | "rcall" | "rjz" | "rjn" => {
                expect(&[1], "1")?;
                let op = match &mnemonic[..] {
                    "rjmp" => RelOp::Rjmp,
                    "rcall" => RelOp::Rcall,
                    "rjz" => RelOp::Rjz,
                    _ => RelOp::Rjn,
                };
                let target = self.eval_ranged(&operands[0], 0, 0xffff, "an address")?;
                let offset = target - addr as i64;
                if offset % 2 != 0 {
                    return Err(AsmErrorKind::Misaligned { target });
                }
                if offset < REL_OFFSET_MIN as i64 || offset > REL_OFFSET_MAX as i64 {
                    return Err(AsmErrorKind::JumpOutOfRange { target });
                }
                Rel {
                    op,
                    offset: offset as i16,
                }
            }
            "jmp" | "jz" | "jnz" | "jn" => {
                expect(&[1, 2], "1 or 2")?;
                let cond = match &mnemonic[..] {
                    "jmp" => Cond::Always,
                    "jz" => Cond::Zero,
                    "jnz" => Cond::NotZero,
                    _ => Cond::Negative,
                };
                Jump {
                    cond,
                    ra: reg(0)?,
                    rl: reg_or_zero(1)?,
                }
            }
            "call" => {
                expect(&[1], "1")?;
                Jump {
                    cond: Cond::Always,
                    ra: reg(0)?,
                    rl: Reg::LR,
                }
            }
            "ret" => {
                expect(&[0], "0")?;
                Jump {
                    cond: Cond::Always,
                    ra: Reg::LR,
                    rl: Reg::ZERO,
                }
            }
            "psr" => {
                expect(&[1], "1")?;
                Psr { rs: reg(0)? }
            }
            "iret" => {
                expect(&[1], "1")?;
                Iret { rs: reg(0)? }
            }
            "gfl" => {
                expect(&[1], "1")?;
                Gfl { rd: reg(0)? }
            }
            "sfl" => {
                expect(&[1], "1")?;
                Sfl { rs: reg(0)? }
            }
            "push" | "pop" | "mov" | "msx" => {
                expect(&[2], "2")?;
                let (r1, r2) = (reg(0)?, reg(1)?);
                match &mnemonic[..] {
                    "push" => Push { rs: r1, rv: r2 },
                    "pop" => Pop { rs: r1, rd: r2 },
                    "mov" => Mov { rs: r1, rd: r2 },
                    _ => Msx { rs: r1, rd: r2 },
                }
            }
            "int" => {
                expect(&[0], "0")?;
                Int
            }
            "nop" => {
                expect(&[0], "0")?;
                Nop
            }
            m => {
                let op = AluOp::from_mnemonic(m)
                    .ok_or_else(|| AsmErrorKind::UnknownMnemonic(m.to_string()))?;
                match op {
                    // single register forms name the register the op acts on
                    AluOp::Not | AluOp::Rdf if operands.len() == 1 => Alu {
                        op,
                        rs: Reg::ZERO,
                        rd: reg(0)?,
                    },
                    AluOp::Wrf if operands.len() == 1 => Alu {
                        op,
                        rs: reg(0)?,
                        rd: Reg::ZERO,
                    },
                    AluOp::Not | AluOp::Rdf | AluOp::Wrf => {
                        expect(&[1, 2], "1 or 2")?;
                        Alu {
                            op,
                            rs: reg(0)?,
                            rd: reg(1)?,
                        }
                    }
                    _ => {
                        expect(&[2], "2")?;
                        Alu {
                            op,
                            rs: reg(0)?,
                            rd: reg(1)?,
                        }
                    }
                }
            }
        };
        Ok(vec![inst])
    }
}

enum Layout {
    Emit(Item, u32),
    MoveTo(u32),
}

fn instruction_size(mnemonic: &str) -> Option<u32> {
    let known = [
        "ldi", "ldh", "adi", "sbi", "ldw", "stw", "ldb", "stb", "rjmp", "rcall", "rjz", "rjn",
        "jmp", "jz", "jnz", "jn", "call", "ret", "psr", "iret", "gfl", "sfl", "push", "pop",
        "mov", "msx", "int", "nop",
    ];
    let m = mnemonic.to_lowercase();
    if m == "li" {
        Some(4)
    } else if known.contains(&&m[..]) || AluOp::from_mnemonic(&m).is_some() {
        Some(2)
    } else {
        None
    }
}

// cut at the first `;` that is not inside a quoted literal
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                ';' => return &line[..i],
                _ => {}
            },
        }
    }
    line
}

// split on top-level commas, leaving quoted literals and parentheses intact
fn split_operands(s: &str) -> Vec<String> {
    let mut result = vec![];
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0;
    for c in s.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    result.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() || !result.is_empty() {
        result.push(current.trim().to_string());
    }
    result
}

fn parse_line(s: &str) -> Result<Vec<Statement>, AsmErrorKind> {
    lazy_static! {
        static ref LABEL_RE: Regex = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*):\s*(.*)$").unwrap();
        static ref DIRECTIVE_RE: Regex = Regex::new(r"^\.([A-Za-z]+)(?:\s+(.*))?$").unwrap();
        static ref INSTRUCTION_RE: Regex = Regex::new(r"^([A-Za-z]+)(?:\s+(.*))?$").unwrap();
    }

    let mut statements = vec![];
    let mut rest = s;
    if let Some(cap) = LABEL_RE.captures(s) {
        statements.push(Statement::Label {
            name: cap[1].to_string(),
        });
        rest = cap.get(2).map_or("", |m| m.as_str());
    }
    if rest.is_empty() {
        return Ok(statements);
    }

    if let Some(cap) = DIRECTIVE_RE.captures(rest) {
        statements.push(Statement::Directive {
            name: cap[1].to_string(),
            args: cap.get(2).map_or("", |m| m.as_str()).trim().to_string(),
        });
    } else if let Some(cap) = INSTRUCTION_RE.captures(rest) {
        statements.push(Statement::Instruction {
            mnemonic: cap[1].to_string(),
            operands: split_operands(cap.get(2).map_or("", |m| m.as_str())),
        });
    } else {
        return Err(AsmErrorKind::Syntax(rest.to_string()));
    }
    Ok(statements)
}

fn parse_reg(s: &str) -> Result<Reg, AsmErrorKind> {
    lazy_static! {
        static ref REG_RE: Regex = Regex::new(r"(?i)^r([0-9]{1,2})$").unwrap();
    }
    match &s.to_lowercase()[..] {
        "sp" => return Ok(Reg::SP),
        "lr" => return Ok(Reg::LR),
        "pc" => return Ok(Reg::PC),
        _ => {}
    }
    REG_RE
        .captures(s)
        .and_then(|cap| cap[1].parse::<u8>().ok())
        .filter(|n| *n < 16)
        .map(Reg)
        .ok_or_else(|| AsmErrorKind::BadRegister(s.to_string()))
}

fn unescape(c: &str) -> Option<u8> {
    let mut chars = c.chars();
    match (chars.next()?, chars.next()) {
        ('\\', Some(e)) => match e {
            'n' => Some(b'\n'),
            'r' => Some(b'\r'),
            't' => Some(b'\t'),
            '0' => Some(0),
            'e' => Some(0x1b),
            '\\' | '\'' | '"' => Some(e as u8),
            'x' => u8::from_str_radix(chars.as_str(), 16).ok(),
            _ => None,
        },
        (ch, None) if ch.is_ascii() => Some(ch as u8),
        _ => None,
    }
}

fn parse_string(s: &str) -> Result<Vec<u8>, AsmErrorKind> {
    lazy_static! {
        static ref STRING_RE: Regex = Regex::new(r#"^"((?:\\.|[^"\\])*)"$"#).unwrap();
        static ref CHAR_RE: Regex = Regex::new(r"\\x[0-9a-fA-F]{2}|\\.|.").unwrap();
    }
    let syntax = || AsmErrorKind::Syntax(s.to_string());
    let cap = STRING_RE.captures(s.trim()).ok_or_else(syntax)?;
    CHAR_RE
        .find_iter(&cap[1])
        .map(|m| unescape(m.as_str()).ok_or_else(syntax))
        .collect()
}

fn eval_expr(expr: &str, symbols: &HashMap<String, i64>) -> Result<i64, AsmErrorKind> {
    lazy_static! {
        static ref DEC_RE: Regex = Regex::new(r"^-?[0-9]+$").unwrap();
        static ref HEX_RE: Regex = Regex::new(r"(?i)^(-)?(?:0x|\$)([0-9a-f]+)$").unwrap();
        static ref BIN_RE: Regex = Regex::new(r"(?i)^(-)?0b([01]+)$").unwrap();
        static ref CHAR_RE: Regex = Regex::new(r"^'(\\x[0-9a-fA-F]{2}|\\.|[^'\\])'$").unwrap();
        static ref BYTE_OF_RE: Regex = Regex::new(r"(?i)^(lo|hi)\((.*)\)$").unwrap();
        static ref SYMBOL_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }

    let s = expr.trim();
    let syntax = || AsmErrorKind::Syntax(s.to_string());

    if let Some((i, op)) = find_binary_operator(s) {
        let lhs = eval_expr(&s[..i], symbols)?;
        let rhs = eval_expr(&s[i + 1..], symbols)?;
        let value = if op == '+' {
            lhs.checked_add(rhs)
        } else {
            lhs.checked_sub(rhs)
        };
        return value.ok_or(AsmErrorKind::OutOfRange {
            value: lhs,
            what: "an expression",
        });
    }

    let signed = |negative: bool, v: i64| if negative { -v } else { v };
    if DEC_RE.is_match(s) {
        s.parse::<i64>().map_err(|_| syntax())
    } else if let Some(cap) = HEX_RE.captures(s) {
        let v = i64::from_str_radix(&cap[2], 16).map_err(|_| syntax())?;
        Ok(signed(cap.get(1).is_some(), v))
    } else if let Some(cap) = BIN_RE.captures(s) {
        let v = i64::from_str_radix(&cap[2], 2).map_err(|_| syntax())?;
        Ok(signed(cap.get(1).is_some(), v))
    } else if let Some(cap) = CHAR_RE.captures(s) {
        unescape(&cap[1]).map(|b| b as i64).ok_or_else(syntax)
    } else if let Some(cap) = BYTE_OF_RE.captures(s) {
        let v = eval_expr(&cap[2], symbols)?;
        Ok(if cap[1].eq_ignore_ascii_case("lo") {
            v & 0xff
        } else {
            (v >> 8) & 0xff
        })
    } else if s.starts_with('(') && s.ends_with(')') {
        eval_expr(&s[1..s.len() - 1], symbols)
    } else if let Some(inner) = s.strip_prefix('-') {
        let v = eval_expr(inner, symbols)?;
        v.checked_neg().ok_or(AsmErrorKind::OutOfRange {
            value: v,
            what: "an expression",
        })
    } else if SYMBOL_RE.is_match(s) {
        symbols
            .get(s)
            .copied()
            .ok_or_else(|| AsmErrorKind::UndefinedSymbol(s.to_string()))
    } else {
        Err(syntax())
    }
}

// last top-level `+`/`-` that follows an operand, so evaluation is left to right
fn find_binary_operator(s: &str) -> Option<(usize, char)> {
    let mut found = None;
    let mut depth = 0;
    let mut in_char = false;
    let mut escaped = false;
    let mut prev: Option<char> = None;
    for (i, c) in s.char_indices() {
        if in_char {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '\'' {
                in_char = false;
                prev = Some(c);
            }
            continue;
        }
        match c {
            '\'' => in_char = true,
            '(' => depth += 1,
            ')' => depth -= 1,
            '+' | '-' if depth == 0 => {
                let follows_operand =
                    matches!(prev, Some(p) if p.is_ascii_alphanumeric() || p == '_' || p == ')' || p == '\'');
                if follows_operand {
                    found = Some((i, c));
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            prev = Some(c);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_process() {
        let mut assembler = Assembler::new(vec![
            "  ldi r1, ';' ; a comment".to_string(),
            "  ;;; a comment".to_string(),
            "   ".to_string(),
            "  Nop".to_string(),
        ]);
        assembler.pre_process();
        assert_eq!(
            assembler.lines,
            vec![(1, "ldi r1, ';'".to_string()), (4, "Nop".to_string())]
        );
    }

    #[test]
    fn test_parse_label_statement() {
        assert_eq!(
            parse_line("loop:"),
            Ok(vec![Statement::Label {
                name: "loop".to_string()
            }])
        );
        assert_eq!(
            parse_line("wait: rjmp wait"),
            Ok(vec![
                Statement::Label {
                    name: "wait".to_string()
                },
                Statement::Instruction {
                    mnemonic: "rjmp".to_string(),
                    operands: vec!["wait".to_string()],
                },
            ])
        );
    }

    #[test]
    fn test_parse_directive_statement() {
        assert_eq!(
            parse_line(".set TX_HI 0xe0"),
            Ok(vec![Statement::Directive {
                name: "set".to_string(),
                args: "TX_HI 0xe0".to_string(),
            }])
        );
        assert_eq!(
            parse_line(".data irq, nmi, reset"),
            Ok(vec![Statement::Directive {
                name: "data".to_string(),
                args: "irq, nmi, reset".to_string(),
            }])
        );
    }

    #[test]
    fn test_parse_instruction_statement() {
        let codes = vec!["ldi r1, 'A'", "stb r2, r1, r0", "ret", "ldi r3, ','"];
        let statements = vec![
            Statement::Instruction {
                mnemonic: "ldi".to_string(),
                operands: vec!["r1".to_string(), "'A'".to_string()],
            },
            Statement::Instruction {
                mnemonic: "stb".to_string(),
                operands: vec!["r2".to_string(), "r1".to_string(), "r0".to_string()],
            },
            Statement::Instruction {
                mnemonic: "ret".to_string(),
                operands: vec![],
            },
            Statement::Instruction {
                mnemonic: "ldi".to_string(),
                operands: vec!["r3".to_string(), "','".to_string()],
            },
        ];
        for (c, s) in codes.iter().zip(statements.into_iter()) {
            assert_eq!(parse_line(c), Ok(vec![s]));
        }
    }

    #[test]
    fn test_parse_reg() {
        assert_eq!(parse_reg("r0"), Ok(Reg(0)));
        assert_eq!(parse_reg("R15"), Ok(Reg(15)));
        assert_eq!(parse_reg("sp"), Ok(Reg::SP));
        assert_eq!(parse_reg("LR"), Ok(Reg::LR));
        assert_eq!(
            parse_reg("r16"),
            Err(AsmErrorKind::BadRegister("r16".to_string()))
        );
        assert_eq!(
            parse_reg("0x10"),
            Err(AsmErrorKind::BadRegister("0x10".to_string()))
        );
    }

    #[test]
    fn test_eval_expr() {
        use itertools::izip;

        let mut symbols = HashMap::new();
        symbols.insert("TX".to_string(), 0xe000);
        symbols.insert("start".to_string(), 0xf000);

        let exprs = vec![
            "42",
            "-3",
            "0x2A",
            "$2a",
            "0b1010",
            "'A'",
            r"'\n'",
            r"'\x1b'",
            "lo(0x1234)",
            "hi(0x1234)",
            "TX + 2",
            "start - TX",
            "hi(TX) - 1",
            "'-' + 1",
            "1 - 2 + 3",
            "-start",
        ];
        let expected: Vec<i64> = vec![
            42, -3, 42, 42, 10, 65, 10, 0x1b, 0x34, 0x12, 0xe002, 0x1000, 0xdf, 46, 2, -0xf000,
        ];
        for (e, v) in izip!(exprs, expected) {
            assert_eq!(eval_expr(e, &symbols), Ok(v), "{}", e);
        }

        assert_eq!(
            eval_expr("nowhere", &symbols),
            Err(AsmErrorKind::UndefinedSymbol("nowhere".to_string()))
        );
        assert_eq!(
            eval_expr("0xg", &symbols),
            Err(AsmErrorKind::Syntax("0xg".to_string()))
        );
    }

    #[test]
    fn test_parse_string() {
        assert_eq!(parse_string(r#""hi;\n""#), Ok(b"hi;\n".to_vec()));
        assert_eq!(parse_string(r#""a\"b\\""#), Ok(b"a\"b\\".to_vec()));
        assert!(parse_string("hi").is_err());
    }

    #[test]
    fn test_assemble_statement() {
        let code = r"
        .org 0xf000
        start:
            ldi r1, 'A'
            li r2, 0xe000
            stb r1, r2
            rjmp start
        ";
        let image = assert_code_assemble_to(code, "41 10 00 20 e0 21 20 17 7f cc");
        assert_eq!(image.origin, 0xf000);
        assert_eq!(image.symbol("start"), Some(0xf000));
    }

    #[test]
    fn test_assemble_with_forward_label() {
        let code = r"
            rcall sub
            nop
        sub:
            ret
        ";
        let image = assert_code_assemble_to(code, "80 2d 00 f8 e0 08");
        assert_eq!(image.origin, 0);
    }

    #[test]
    fn test_assemble_with_set() {
        let code = r"
        .set TX, 0xe000        ; an address
        .set SENTINEL 4        ; a constant
            ldi r1, lo(TX)
            ldh r1, hi(TX)
            sbi r3, SENTINEL
            ldi r4, -1
        ";
        assert_code_assemble_to(code, "00 10 e0 11 04 33 ff 40");
    }

    #[test]
    fn test_assemble_register_forms() {
        let code = r"
            push sp, r1
            pop sp, r1
            psr sp
            iret sp
            gfl r3
            sfl r1
            sub r1, r2
            not r1
            wrf r1
            call r4
            jnz r4, lr
            int
        ";
        assert_code_assemble_to(
            code,
            "d1 88 d1 98 d0 48 d0 58 03 68 10 78 12 29 01 59 10 f9 4e 08 4e 28 00 c8",
        );
    }

    #[test]
    fn test_assemble_directives() {
        let code = r#"
        .org 0x0010
        .byte 1, 2, 0xff
        .org 0x0014
        .data 0x1234, end
        .ascii "hi;\n"
        end:
        .spaceto 0x0020
        "#;
        let image = assert_code_assemble_to(
            code,
            "01 02 ff 00 34 12 1c 00 68 69 3b 0a 00 00 00 00",
        );
        assert_eq!(image.origin, 0x0010);
        assert_eq!(image.end(), 0x0020);
        assert_eq!(image.symbol("end"), Some(0x001c));
    }

    #[test]
    fn test_hex_listing() {
        let image = assemble(".org 0xf000\n.spaceto 0xf012\n.byte 0xaa").unwrap();
        let listing = image.to_hex_listing();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("f000: 00 00"));
        assert_eq!(lines[1], "f010: 00 00 aa");
    }

    #[test]
    fn test_assemble_errors() {
        let cases: Vec<(&str, usize, AsmErrorKind)> = vec![
            (
                "foo r1",
                1,
                AsmErrorKind::UnknownMnemonic("foo".to_string()),
            ),
            (
                "ldi r1, 300",
                1,
                AsmErrorKind::OutOfRange {
                    value: 300,
                    what: "8 bits",
                },
            ),
            (
                ".org 0x10\nnop\n.org 0x08",
                3,
                AsmErrorKind::Backwards {
                    from: 0x12,
                    to: 0x08,
                },
            ),
            (
                "rjmp nowhere",
                1,
                AsmErrorKind::UndefinedSymbol("nowhere".to_string()),
            ),
            ("a:\na:", 2, AsmErrorKind::Redefined("a".to_string())),
            (
                "mov r1",
                1,
                AsmErrorKind::OperandCount {
                    mnemonic: "mov".to_string(),
                    expected: "2",
                    found: 1,
                },
            ),
            (
                "ldw r16, r1",
                1,
                AsmErrorKind::BadRegister("r16".to_string()),
            ),
            (
                "rjmp 0x3000",
                1,
                AsmErrorKind::JumpOutOfRange { target: 0x3000 },
            ),
            ("rjmp 3", 1, AsmErrorKind::Misaligned { target: 3 }),
            (".org 0xfffe\n.data 1, 2", 2, AsmErrorKind::Overflow),
            (
                ".frob 1",
                1,
                AsmErrorKind::UnknownDirective("frob".to_string()),
            ),
            (
                ".set 1 2",
                1,
                AsmErrorKind::Syntax(".set 1 2".to_string()),
            ),
            (".set AB5", 1, AsmErrorKind::Syntax(".set AB5".to_string())),
            (".set ABC", 1, AsmErrorKind::Syntax(".set ABC".to_string())),
            (
                ".org 0x10\nnop\n.spaceto 0x08",
                3,
                AsmErrorKind::Backwards {
                    from: 0x12,
                    to: 0x08,
                },
            ),
            (
                "ldi r1, 0x7fffffffffffffff + 1",
                1,
                AsmErrorKind::OutOfRange {
                    value: i64::MAX,
                    what: "an expression",
                },
            ),
            (
                ".data 0 - 0x7fffffffffffffff - 2",
                1,
                AsmErrorKind::OutOfRange {
                    value: -i64::MAX,
                    what: "an expression",
                },
            ),
        ];
        for (code, line, kind) in cases {
            assert_eq!(assemble(code), Err(AsmError { line, kind }), "{}", code);
        }
    }

    // ----- Helper Test Functions -----
    fn assert_code_assemble_to(code_str: &str, expected_bytes_str: &str) -> Image {
        let expected_bytes: Vec<u8> = expected_bytes_str
            .split_whitespace()
            .map(|byte_str| u8::from_str_radix(byte_str, 16).unwrap())
            .collect();
        let image = assemble(code_str).unwrap();
        println!("Expected: {:02X?}", expected_bytes);
        println!("Actual:   {:02X?}", image.bytes);
        assert_eq!(image.bytes, expected_bytes);
        image
    }
}
