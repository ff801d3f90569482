//! Packed instructions and compiled code fragments.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::{
    bytecode::op::Opcode,
    intern::Interns,
    value::{StringRef, Value, format_number},
};

/// One 32-bit instruction word: an opcode, an output register `r0`, and
/// either two more register operands or a 16-bit immediate, depending on
/// the opcode.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: Opcode,
    pub r0: u8,
    pub r1: u8,
    pub r2: u8,
}

impl Instruction {
    /// Three-register form.
    pub fn abc(op: Opcode, r0: u8, r1: u8, r2: u8) -> Self {
        Self { op, r0, r1, r2 }
    }

    /// Register + immediate form: the immediate is packed little-endian
    /// into the two register operand bytes.
    pub fn with_imm(op: Opcode, r0: u8, imm: u16) -> Self {
        let [r1, r2] = imm.to_le_bytes();
        Self { op, r0, r1, r2 }
    }

    /// The 16-bit immediate view of the payload.
    #[inline]
    pub fn imm(self) -> u16 {
        u16::from_le_bytes([self.r1, self.r2])
    }
}

/// A compiler-recorded capture: which register of the enclosing frame to
/// box, and which register of the new frame mirrors it.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    pub source: u8,
    pub dest: u8,
}

/// The compiled form of one function literal (or a module body).
///
/// Owned behind `Rc`: closures share their fragment, and nested function
/// literals live in the parent fragment's `fragments` list, indexed by
/// `AllocFunc`'s immediate.
#[derive(Debug, Default)]
pub struct CodeFragment {
    pub name: String,
    pub instructions: Vec<Instruction>,
    /// Constant pool: numbers and interned strings, loaded by `LoadConst`.
    pub constants: Vec<Value>,
    pub capture_info: Vec<CaptureInfo>,
    /// Child fragments for nested function literals.
    pub fragments: Vec<Rc<CodeFragment>>,
    /// 1-based source line per instruction, for error reports.
    pub line_numbers: Vec<u32>,
    /// One past the highest register index this fragment touches.
    pub max_register: u16,
    /// Parameter count, checked at call time.
    pub arity: u8,
}

impl CodeFragment {
    /// Appends a number constant, returning its pool index.
    pub fn store_number(&mut self, d: f64) -> Option<u16> {
        let index = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(Value::number(d));
        Some(index)
    }

    /// Appends an interned-string constant, returning its pool index.
    pub fn store_string(&mut self, value: Value) -> Option<u16> {
        let index = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        Some(index)
    }

    /// Human-readable listing of this fragment and its children, used by
    /// the `-D` CLI flag.
    pub fn disassemble(&self, interns: &Interns) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, interns);
        out
    }

    fn disassemble_into(&self, out: &mut String, interns: &Interns) {
        let _ = writeln!(out, "function: {} (arity {}, registers {})", self.name, self.arity, self.max_register);
        for (i, ins) in self.instructions.iter().enumerate() {
            let _ = writeln!(
                out,
                "    {i}: {} {} {} {}  (line {})",
                ins.op, ins.r0, ins.r1, ins.r2, self.line_numbers[i]
            );
        }
        if !self.constants.is_empty() {
            let _ = writeln!(out, "  constants:");
            for (i, constant) in self.constants.iter().enumerate() {
                let text = match constant.as_string() {
                    Some(StringRef::Interned(id)) => format!("{:?}", interns.get(id)),
                    _ => constant.as_number().map_or_else(|| format!("{constant:?}"), format_number),
                };
                let _ = writeln!(out, "    {i}: {text}");
            }
        }
        if !self.capture_info.is_empty() {
            let _ = writeln!(out, "  captures:");
            for (i, cap) in self.capture_info.iter().enumerate() {
                let _ = writeln!(out, "    {i}: r{} -> r{}", cap.source, cap.dest);
            }
        }
        for child in &self.fragments {
            child.disassemble_into(out, interns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_round_trips_through_operand_bytes() {
        for imm in [0u16, 1, 255, 256, 0x1234, u16::MAX] {
            let ins = Instruction::with_imm(Opcode::LoadConst, 7, imm);
            assert_eq!(ins.imm(), imm);
            assert_eq!(ins.r0, 7);
        }
    }

    #[test]
    fn instruction_word_is_packed() {
        assert_eq!(std::mem::size_of::<Instruction>(), 4);
    }
}
