use std::fmt::Write;

use rustc_hash::FxHashMap;

use crate::bytecode::ir::{Function, Program};
use crate::bytecode::op::{Instr, Opcode, Operand, decode_all};

const RULE: &str = "════════════════════════════════════════";

impl Program {
    /// Human-readable listing of the whole program.
    ///
    /// Output depends only on the program, so it is stable across runs and
    /// suitable for golden tests.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();

        out.push_str("=== constants ===\n");
        for (id, s) in self.constants.iter() {
            let _ = writeln!(out, "  {:4}  {:?}", id, s);
        }

        if !self.natives.is_empty() {
            out.push_str("=== natives ===\n");
            for (id, desc) in self.natives.iter().enumerate() {
                let _ = writeln!(out, "  {:4}  {}  {}", id, desc.name, desc.signature);
            }
        }

        if !self.globals.is_empty() {
            out.push_str("=== globals ===\n");
            for g in &self.globals {
                let _ = writeln!(out, "  @{:<3}  {} {}", g.slot, g.ty, g.name);
            }
        }

        for f in &self.functions {
            out.push('\n');
            self.write_function(&mut out, f);
        }
        out
    }

    fn write_function(&self, out: &mut String, f: &Function) {
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, " function {} {}  {}", f.id, f.name, f.signature);
        let locals: Vec<&str> = f.locals.iter().map(|t| t.name()).collect();
        let _ = writeln!(out, " locals   [{}]", locals.join(", "));
        if !f.captures.is_empty() {
            let captures: Vec<String> = f
                .captures
                .iter()
                .map(|c| format!("({}, {})", c.function, c.slot))
                .collect();
            let _ = writeln!(out, " captures {}", captures.join(" "));
        }
        if let Some(nid) = f.native {
            let name = self
                .natives
                .get(nid as usize)
                .map(|d| d.name.as_str())
                .unwrap_or("?");
            let _ = writeln!(out, " native   {} ({})", nid, name);
            let _ = writeln!(out, "{}", RULE);
            return;
        }
        let _ = writeln!(out, " {} bytes", f.code.len());
        let _ = writeln!(out, "{}", RULE);

        let instrs = match decode_all(f.code.bytes()) {
            Ok(instrs) => instrs,
            Err(e) => {
                let _ = writeln!(out, "  <{}>", e);
                return;
            }
        };
        let targets = collect_jump_targets(&instrs);

        for instr in &instrs {
            if targets.contains(&instr.offset) {
                out.push_str("      ┌──────────────────────────────────\n");
                let _ = write!(out, "{:04} ► ", instr.offset);
            } else {
                let _ = write!(out, "{:04}   ", instr.offset);
            }
            out.push_str(&self.format_instr(f, instr));
            out.push('\n');
        }
    }

    fn format_instr(&self, f: &Function, instr: &Instr) -> String {
        let op = instr.op.mnemonic();
        match instr.operand {
            Operand::None => op.to_string(),
            Operand::Int(v) => format!("{:<12}{}", op, v),
            Operand::Double(v) => format!("{:<12}{:?}", op, v),
            Operand::U16(v) => {
                let note = match instr.op {
                    Opcode::Sload => self.constants.get(v).map(|s| format!("{:?}", s)),
                    Opcode::Call => self.function(v).map(|callee| callee.name.clone()),
                    Opcode::CallNative => self.natives.get(v as usize).map(|d| d.name.clone()),
                    _ => f.locals.get(v as usize).map(|t| t.name().to_string()),
                };
                match note {
                    Some(note) => format!("{:<12}{:<8}; {}", op, v, note),
                    None => format!("{:<12}{}", op, v),
                }
            }
            Operand::Ctx { function, slot } => {
                let pair = format!("({}, {})", function, slot);
                match self.function(function) {
                    Some(owner) => format!("{:<12}{:<8}; {}", op, pair, owner.name),
                    None => format!("{:<12}{}", op, pair),
                }
            }
            Operand::Jump(target) => {
                let rel = target as i64 - (instr.offset as i64 + 1);
                let direction = if target <= instr.offset { "↑" } else { "↓" };
                format!("{:<12}{:+} {} (→ {:04})", op, rel, direction, target)
            }
        }
    }

    /// Opcode frequency table over every function.
    pub fn stats(&self) -> String {
        let mut counts: FxHashMap<Opcode, usize> = FxHashMap::default();
        let mut total = 0usize;
        let mut bytes = 0usize;
        for f in &self.functions {
            bytes += f.code.len();
            let Ok(instrs) = decode_all(f.code.bytes()) else {
                continue;
            };
            for instr in instrs {
                *counts.entry(instr.op).or_insert(0) += 1;
                total += 1;
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "Functions:    {}", self.functions.len());
        let _ = writeln!(out, "Constants:    {}", self.constants.len());
        let _ = writeln!(out, "Natives:      {}", self.natives.len());
        let _ = writeln!(out, "Instructions: {}", total);
        let _ = writeln!(out, "Code bytes:   {}", bytes);
        out.push_str("\nOp frequency:\n");

        let mut rows: Vec<(Opcode, usize)> = counts.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(u8::from(a.0).cmp(&u8::from(b.0))));
        for (op, count) in rows.iter().take(10) {
            let pct = (*count as f64 / total as f64) * 100.0;
            let _ = writeln!(out, "  {:<14} {:>4} ({:>5.1}%)", op.mnemonic(), count, pct);
        }
        out
    }
}

fn collect_jump_targets(instrs: &[Instr]) -> Vec<usize> {
    let mut targets = Vec::new();
    for instr in instrs {
        if let Operand::Jump(target) = instr.operand
            && !targets.contains(&target)
        {
            targets.push(target);
        }
    }
    targets
}
