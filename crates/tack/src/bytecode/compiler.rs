//! Single-pass AST to bytecode compiler.
//!
//! One `FuncFrame` per function literal being compiled, stacked so that a
//! nested literal can reach the frames above it: that is how lexical
//! captures work. Each frame owns a 256-entry register file
//! (`Free | Busy | Bound`), a scope stack, and the `CodeFragment` being
//! emitted. Register allocation, capture planning and jump patching all
//! happen in this one pass; there is no later optimization stage.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    ast::{AstKind, AstNode},
    bytecode::{
        code::{CaptureInfo, CodeFragment, Instruction},
        op::Opcode,
    },
    error::CompileError,
    intern::Interns,
    value::Value,
};

pub(crate) const MAX_REGISTERS: usize = 256;
/// Slots reserved below a callee's argument range for the frame header
/// (saved pc, saved closure, saved stack base).
pub(crate) const STACK_FRAME_OVERHEAD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegState {
    Free,
    Busy,
    Bound,
}

/// Where a name lives: a frame register, or a global slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Variable {
    pub reg: u8,
    pub is_const: bool,
    pub is_global: bool,
    pub global_id: u16,
}

/// Module-level name table. Populated during compilation and kept by the
/// VM so the host can resolve globals by name afterwards.
#[derive(Debug, Default)]
pub(crate) struct ModuleScope {
    pub bindings: AHashMap<String, Variable>,
}

/// One lexical scope: local bindings only (globals live in `ModuleScope`).
#[derive(Debug, Default)]
struct Scope {
    bindings: AHashMap<String, Variable>,
}

/// Compilation state for one function literal.
struct FuncFrame {
    registers: [RegState; MAX_REGISTERS],
    scopes: Vec<Scope>,
    fragment: CodeFragment,
}

impl FuncFrame {
    fn new(name: String) -> Self {
        Self {
            registers: [RegState::Free; MAX_REGISTERS],
            scopes: vec![Scope::default()],
            fragment: CodeFragment {
                name,
                ..CodeFragment::default()
            },
        }
    }

    fn touch_register(&mut self, reg: usize) {
        let used = reg as u16 + 1;
        if used > self.fragment.max_register {
            self.fragment.max_register = used;
        }
    }
}

pub(crate) struct Compiler<'a> {
    frames: Vec<FuncFrame>,
    /// The module being compiled; `let`/`const` at module level bind here.
    module: &'a mut ModuleScope,
    /// The `[global]` namespace: host-registered names like `print`.
    global_ns: &'a ModuleScope,
    interns: &'a mut Interns,
    next_global_id: &'a mut u16,
    /// Source line attributed to the instructions being emitted.
    line: u32,
}

impl<'a> Compiler<'a> {
    pub fn new(
        module: &'a mut ModuleScope,
        global_ns: &'a ModuleScope,
        interns: &'a mut Interns,
        next_global_id: &'a mut u16,
    ) -> Self {
        Self {
            frames: Vec::new(),
            module,
            global_ns,
            interns,
            next_global_id,
            line: 1,
        }
    }

    /// Compiles a parsed module into its root fragment: a zero-argument
    /// function wrapping the module's statement list.
    pub fn compile_module(mut self, name: &str, module_ast: &AstNode) -> Result<CodeFragment, CompileError> {
        self.frames.push(FuncFrame::new(name.to_owned()));
        self.compile_stat(&module_ast.children[0])?;
        self.emit(Opcode::Ret, 0, 0, 0);
        Ok(self.frames.pop().expect("module frame missing").fragment)
    }

    // ---- frame and register plumbing ---------------------------------

    fn frame(&self) -> &FuncFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut FuncFrame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Module-level code binds declarations as globals.
    fn in_module_frame(&self) -> bool {
        self.frames.len() == 1
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(message, self.line)
    }

    fn allocate_register_in(&mut self, frame_idx: usize) -> Result<u8, CompileError> {
        let frame = &mut self.frames[frame_idx];
        for i in 0..MAX_REGISTERS {
            if frame.registers[i] == RegState::Free {
                frame.registers[i] = RegState::Busy;
                frame.touch_register(i);
                return Ok(i as u8);
            }
        }
        Err(self.err("ran out of registers"))
    }

    fn allocate_register(&mut self) -> Result<u8, CompileError> {
        self.allocate_register_in(self.frames.len() - 1)
    }

    /// Two consecutive registers, for the two-variable `for` form.
    fn allocate_register_pair(&mut self) -> Result<u8, CompileError> {
        let frame = self.frame_mut();
        for i in 0..MAX_REGISTERS - 1 {
            if frame.registers[i] == RegState::Free && frame.registers[i + 1] == RegState::Free {
                frame.registers[i] = RegState::Busy;
                frame.registers[i + 1] = RegState::Busy;
                frame.touch_register(i + 1);
                return Ok(i as u8);
            }
        }
        Err(self.err("ran out of registers"))
    }

    /// One past the highest non-free register: where call arguments and
    /// aggregate elements are staged contiguously.
    fn get_end_register(&self) -> usize {
        let frame = self.frame();
        for i in (0..MAX_REGISTERS).rev() {
            if frame.registers[i] != RegState::Free {
                return i + 1;
            }
        }
        0
    }

    fn free_register(&mut self, reg: u8) {
        let frame = self.frame_mut();
        if frame.registers[reg as usize] != RegState::Bound {
            frame.registers[reg as usize] = RegState::Free;
        }
    }

    fn free_all_registers(&mut self) {
        for i in 0..MAX_REGISTERS {
            self.free_register(i as u8);
        }
    }

    fn push_scope(&mut self) {
        self.frame_mut().scopes.push(Scope::default());
    }

    /// Bindings disappear with the scope; their registers stay bound for
    /// the rest of the function so live captures keep their slots.
    fn pop_scope(&mut self) {
        self.frame_mut().scopes.pop();
    }

    fn bind_local(&mut self, name: &str, reg: u8, is_const: bool) {
        let frame = self.frame_mut();
        frame.registers[reg as usize] = RegState::Bound;
        let var = Variable {
            reg,
            is_const,
            is_global: false,
            global_id: 0,
        };
        frame
            .scopes
            .last_mut()
            .expect("frame without scope")
            .bindings
            .insert(name.to_owned(), var);
    }

    /// Creates (or re-binds) a module-level global.
    fn bind_global(&mut self, name: &str, is_const: bool) -> Result<Variable, CompileError> {
        if let Some(var) = self.module.bindings.get_mut(name) {
            var.is_const = is_const;
            return Ok(*var);
        }
        if *self.next_global_id == u16::MAX {
            return Err(self.err("too many globals"));
        }
        let var = Variable {
            reg: 0xff,
            is_const,
            is_global: true,
            global_id: *self.next_global_id,
        };
        *self.next_global_id += 1;
        self.module.bindings.insert(name.to_owned(), var);
        Ok(var)
    }

    /// Copies a value out of a register owned by another binding, so that
    /// `let b = a` gives `b` its own storage instead of aliasing `a`.
    fn ensure_owned(&mut self, reg: u8) -> Result<u8, CompileError> {
        if self.frame().registers[reg as usize] == RegState::Bound {
            let fresh = self.allocate_register()?;
            self.emit(Opcode::Move, fresh, reg, 0);
            Ok(fresh)
        } else {
            Ok(reg)
        }
    }

    /// Resolves `name`: current frame's scopes, enclosing frames (creating
    /// a capture mirror in every frame crossed), then module and host
    /// globals.
    fn lookup(&mut self, name: &str) -> Result<Option<Variable>, CompileError> {
        let current = self.frames.len() - 1;
        let mut found = None;
        'search: for frame_idx in (0..self.frames.len()).rev() {
            for scope in self.frames[frame_idx].scopes.iter().rev() {
                if let Some(&var) = scope.bindings.get(name) {
                    found = Some((frame_idx, var));
                    break 'search;
                }
            }
        }
        if let Some((frame_idx, var)) = found {
            if var.is_global || frame_idx == current {
                return Ok(Some(var));
            }
            // A local of an enclosing function: mirror it into every
            // frame between its home and here, recording a capture at
            // each function boundary.
            let mut source = var.reg;
            let mut mirror = var;
            for k in frame_idx + 1..=current {
                mirror = self.capture_into(k, name, source, var.is_const)?;
                source = mirror.reg;
            }
            return Ok(Some(mirror));
        }
        if let Some(&var) = self.module.bindings.get(name) {
            return Ok(Some(var));
        }
        if let Some(&var) = self.global_ns.bindings.get(name) {
            return Ok(Some(var));
        }
        Ok(None)
    }

    /// Adds a capture of `source` (a register of frame `k - 1`) to frame
    /// `k`: allocates the mirror register, records the capture plan, and
    /// emits the `ReadCapture` that loads the box when the closure runs.
    fn capture_into(&mut self, k: usize, name: &str, source: u8, is_const: bool) -> Result<Variable, CompileError> {
        let reg = self.allocate_register_in(k)?;
        let line = self.line;
        let frame = &mut self.frames[k];
        if frame.fragment.capture_info.len() >= u8::MAX as usize {
            return Err(CompileError::new("too many captures in one function", line));
        }
        let capture_index = frame.fragment.capture_info.len() as u8;
        frame.fragment.capture_info.push(CaptureInfo { source, dest: reg });
        frame
            .fragment
            .instructions
            .push(Instruction::abc(Opcode::ReadCapture, reg, capture_index, 0));
        frame.fragment.line_numbers.push(line);
        frame.registers[reg as usize] = RegState::Bound;
        let var = Variable {
            reg,
            is_const,
            is_global: false,
            global_id: 0,
        };
        frame
            .scopes
            .last_mut()
            .expect("frame without scope")
            .bindings
            .insert(name.to_owned(), var);
        Ok(var)
    }

    // ---- emission ----------------------------------------------------

    fn emit(&mut self, op: Opcode, r0: u8, r1: u8, r2: u8) {
        let line = self.line;
        let frame = self.frame_mut();
        frame.fragment.instructions.push(Instruction::abc(op, r0, r1, r2));
        frame.fragment.line_numbers.push(line);
    }

    fn emit_imm(&mut self, op: Opcode, r0: u8, imm: u16) {
        let line = self.line;
        let frame = self.frame_mut();
        frame.fragment.instructions.push(Instruction::with_imm(op, r0, imm));
        frame.fragment.line_numbers.push(line);
    }

    fn here(&self) -> usize {
        self.frame().fragment.instructions.len()
    }

    /// Emits a forward-jump placeholder, to be patched later.
    fn emit_jump_placeholder(&mut self) -> usize {
        let at = self.here();
        self.emit_imm(Opcode::JumpForward, 0, 0);
        at
    }

    /// Patches the placeholder at `at` to land on `target`.
    fn patch_jump(&mut self, at: usize, target: usize) -> Result<(), CompileError> {
        let offset = target - at;
        let offset = u16::try_from(offset).map_err(|_| self.err("jump too far"))?;
        let line = self.frame().fragment.line_numbers[at];
        self.frame_mut().fragment.instructions[at] = Instruction::with_imm(Opcode::JumpForward, 0, offset);
        self.frame_mut().fragment.line_numbers[at] = line;
        Ok(())
    }

    /// Emits a backward jump to `target`.
    fn emit_jump_back(&mut self, target: usize) -> Result<(), CompileError> {
        let offset = self.here() - target;
        let offset = u16::try_from(offset).map_err(|_| self.err("jump too far"))?;
        self.emit_imm(Opcode::JumpBack, 0, offset);
        Ok(())
    }

    fn store_number(&mut self, d: f64) -> Result<u16, CompileError> {
        let line = self.line;
        self.frame_mut()
            .fragment
            .store_number(d)
            .ok_or_else(|| CompileError::new("too many constants", line))
    }

    fn store_string(&mut self, text: &str) -> Result<u16, CompileError> {
        let id = self.interns.intern(text);
        let line = self.line;
        self.frame_mut()
            .fragment
            .store_string(Value::interned_string(id))
            .ok_or_else(|| CompileError::new("too many constants", line))
    }

    // ---- statements --------------------------------------------------

    fn compile_stat(&mut self, node: &AstNode) -> Result<(), CompileError> {
        self.line = node.line;
        match node.kind {
            AstKind::StatList => {
                self.push_scope();
                for stat in &node.children {
                    self.compile_stat(stat)?;
                    self.free_all_registers();
                }
                self.pop_scope();
            }
            AstKind::Block => self.compile_stat(&node.children[0])?,
            AstKind::VarDecl | AstKind::ConstDecl => self.compile_decl(node)?,
            AstKind::Assign => self.compile_assign(node)?,
            AstKind::If => self.compile_if(node)?,
            AstKind::While => self.compile_while(node)?,
            AstKind::For => self.compile_for(node)?,
            AstKind::For2 => self.compile_for_pair(node)?,
            AstKind::ForInt => self.compile_for_int(node)?,
            AstKind::Return => self.compile_return(node)?,
            _ => {
                let reg = self.compile_exp(node)?;
                self.free_register(reg);
            }
        }
        Ok(())
    }

    fn compile_decl(&mut self, node: &AstNode) -> Result<(), CompileError> {
        let is_const = node.kind == AstKind::ConstDecl;
        let value_reg = self.compile_exp(&node.children[1])?;
        self.line = node.line;
        let name = &node.children[0].text;
        if self.in_module_frame() {
            let var = self.bind_global(name, is_const)?;
            self.emit_imm(Opcode::WriteGlobal, value_reg, var.global_id);
            self.free_register(value_reg);
        } else {
            let reg = self.ensure_owned(value_reg)?;
            self.bind_local(name, reg, is_const);
        }
        Ok(())
    }

    fn compile_assign(&mut self, node: &AstNode) -> Result<(), CompileError> {
        let source = self.compile_exp(&node.children[1])?;
        let lhs = &node.children[0];
        self.line = node.line;
        match lhs.kind {
            AstKind::Identifier => {
                let Some(var) = self.lookup(&lhs.text)? else {
                    return Err(self.err(format!("can't find variable: {}", lhs.text)));
                };
                if var.is_const {
                    return Err(self.err(format!("can't reassign const variable: {}", lhs.text)));
                }
                if var.is_global {
                    self.emit_imm(Opcode::WriteGlobal, source, var.global_id);
                } else {
                    self.emit(Opcode::Move, var.reg, source, 0);
                }
            }
            AstKind::Index => {
                let array_reg = self.compile_exp(&lhs.children[0])?;
                let index_reg = self.compile_exp(&lhs.children[1])?;
                self.emit(Opcode::StoreArray, source, array_reg, index_reg);
                self.free_register(index_reg);
                self.free_register(array_reg);
            }
            AstKind::Access => {
                let object_reg = self.compile_exp(&lhs.children[0])?;
                let key_reg = self.allocate_register()?;
                let key_index = self.store_string(&lhs.children[1].text)?;
                self.emit_imm(Opcode::LoadConst, key_reg, key_index);
                self.emit(Opcode::StoreObject, source, object_reg, key_reg);
                self.free_register(object_reg);
                self.free_register(key_reg);
            }
            _ => return Err(self.err("illegal assignment target")),
        }
        self.free_register(source);
        Ok(())
    }

    fn compile_if(&mut self, node: &AstNode) -> Result<(), CompileError> {
        let has_else = node.children.len() == 3;
        let cond_reg = self.compile_exp(&node.children[0])?;
        self.emit(Opcode::CondSkip, cond_reg, 0, 0);
        self.free_register(cond_reg);

        let skip_if = self.emit_jump_placeholder();
        self.compile_stat(&node.children[1])?;

        if has_else {
            let skip_else = self.emit_jump_placeholder();
            self.compile_stat(&node.children[2])?;
            let end_else = self.here();
            self.patch_jump(skip_if, skip_else + 1)?;
            self.patch_jump(skip_else, end_else)?;
        } else {
            let end_if = self.here();
            self.patch_jump(skip_if, end_if)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, node: &AstNode) -> Result<(), CompileError> {
        let cond_eval = self.here();
        let cond_reg = self.compile_exp(&node.children[0])?;
        self.emit(Opcode::CondSkip, cond_reg, 0, 0);
        self.free_register(cond_reg);
        let skip_loop = self.emit_jump_placeholder();
        self.compile_stat(&node.children[1])?;
        self.emit_jump_back(cond_eval)?;
        let after_loop = self.here();
        self.patch_jump(skip_loop, after_loop)?;
        Ok(())
    }

    /// `for v in e { … }`: the iterator state machine over an array or an
    /// object's keys. The iterable and state registers are pinned for the
    /// duration of the loop so statement-level register recycling inside
    /// the body cannot reuse them.
    fn compile_for(&mut self, node: &AstNode) -> Result<(), CompileError> {
        self.push_scope();
        let iter_reg = self.compile_exp(&node.children[1])?;
        self.line = node.line;
        let iter_prev = self.pin_register(iter_reg);
        let state_reg = self.allocate_register()?;
        let state_prev = self.pin_register(state_reg);
        let var_reg = self.allocate_register()?;
        self.bind_local(&node.children[0].text, var_reg, false);

        self.emit(Opcode::ForIterInit, state_reg, iter_reg, 0);
        let top = self.here();
        self.emit(Opcode::ForIter, state_reg, iter_reg, var_reg);
        let skip_loop = self.emit_jump_placeholder();
        self.compile_stat(node.children.last().expect("for body missing"))?;
        self.emit(Opcode::ForIterNext, state_reg, iter_reg, 0);
        self.emit_jump_back(top)?;
        let after_loop = self.here();
        self.patch_jump(skip_loop, after_loop)?;

        self.pop_scope();
        self.unpin_register(iter_reg, iter_prev);
        self.unpin_register(state_reg, state_prev);
        Ok(())
    }

    /// `for k, v in e { … }`: like `compile_for` but with a consecutive
    /// register pair receiving key and value.
    fn compile_for_pair(&mut self, node: &AstNode) -> Result<(), CompileError> {
        self.push_scope();
        let iter_reg = self.compile_exp(&node.children[2])?;
        self.line = node.line;
        let iter_prev = self.pin_register(iter_reg);
        let state_reg = self.allocate_register()?;
        let state_prev = self.pin_register(state_reg);
        let key_reg = self.allocate_register_pair()?;
        self.bind_local(&node.children[0].text, key_reg, false);
        self.bind_local(&node.children[1].text, key_reg + 1, false);

        self.emit(Opcode::ForIterInit, state_reg, iter_reg, 0);
        let top = self.here();
        self.emit(Opcode::ForIterPair, state_reg, iter_reg, key_reg);
        let skip_loop = self.emit_jump_placeholder();
        self.compile_stat(&node.children[3])?;
        self.emit(Opcode::ForIterNext, state_reg, iter_reg, 0);
        self.emit_jump_back(top)?;
        let after_loop = self.here();
        self.patch_jump(skip_loop, after_loop)?;

        self.pop_scope();
        self.unpin_register(iter_reg, iter_prev);
        self.unpin_register(state_reg, state_prev);
        Ok(())
    }

    /// `for i in a .. b { … }`: integer range. The counter gets its own
    /// register so the loop never mutates a source variable's storage.
    fn compile_for_int(&mut self, node: &AstNode) -> Result<(), CompileError> {
        self.push_scope();
        let start_reg = self.compile_exp(&node.children[1])?;
        self.line = node.line;
        let counter_reg = self.allocate_register()?;
        self.emit(Opcode::Move, counter_reg, start_reg, 0);
        self.free_register(start_reg);
        let bound_src = self.compile_exp(&node.children[2])?;
        let bound_reg = self.ensure_owned(bound_src)?;
        let bound_prev = self.pin_register(bound_reg);
        self.bind_local(&node.children[0].text, counter_reg, false);

        let top = self.here();
        self.emit(Opcode::ForInt, counter_reg, bound_reg, 0);
        let skip_loop = self.emit_jump_placeholder();
        self.compile_stat(&node.children[3])?;
        self.emit(Opcode::Increment, counter_reg, 0, 0);
        self.emit_jump_back(top)?;
        let after_loop = self.here();
        self.patch_jump(skip_loop, after_loop)?;

        self.pop_scope();
        self.unpin_register(bound_reg, bound_prev);
        Ok(())
    }

    fn compile_return(&mut self, node: &AstNode) -> Result<(), CompileError> {
        if let Some(value) = node.children.first() {
            let reg = self.compile_exp(value)?;
            self.line = node.line;
            self.emit(Opcode::Ret, 1, reg, 0);
            self.free_register(reg);
        } else {
            self.emit(Opcode::Ret, 0, 0, 0);
        }
        Ok(())
    }

    /// Marks a register `Bound` for the duration of a loop, returning the
    /// state to restore afterwards.
    fn pin_register(&mut self, reg: u8) -> bool {
        let frame = self.frame_mut();
        let was_bound = frame.registers[reg as usize] == RegState::Bound;
        frame.registers[reg as usize] = RegState::Bound;
        was_bound
    }

    fn unpin_register(&mut self, reg: u8, was_bound: bool) {
        if !was_bound {
            self.frame_mut().registers[reg as usize] = RegState::Free;
        }
    }

    // ---- expressions -------------------------------------------------

    fn compile_exp(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        self.line = node.line;
        match node.kind {
            AstKind::Identifier => self.compile_identifier(node),
            AstKind::NumLiteral => self.compile_number(node),
            AstKind::StringLiteral => {
                let out = self.allocate_register()?;
                let index = self.store_string(&node.text)?;
                self.emit_imm(Opcode::LoadConst, out, index);
                Ok(out)
            }
            AstKind::ArrayLiteral => self.compile_array_literal(node),
            AstKind::ObjectLiteral => self.compile_object_literal(node),
            AstKind::FuncLiteral => self.compile_func_literal(node),
            AstKind::Call => self.compile_call(node),
            AstKind::Index => {
                let array_reg = self.compile_exp(&node.children[0])?;
                let index_reg = self.compile_exp(&node.children[1])?;
                let out = self.allocate_register()?;
                self.emit(Opcode::LoadArray, out, array_reg, index_reg);
                self.free_register(array_reg);
                self.free_register(index_reg);
                Ok(out)
            }
            AstKind::Access => {
                let object_reg = self.compile_exp(&node.children[0])?;
                let key_reg = self.allocate_register()?;
                let key_index = self.store_string(&node.children[1].text)?;
                self.emit_imm(Opcode::LoadConst, key_reg, key_index);
                let out = self.allocate_register()?;
                self.emit(Opcode::LoadObject, out, object_reg, key_reg);
                self.free_register(object_reg);
                self.free_register(key_reg);
                Ok(out)
            }
            AstKind::Ternary => self.compile_ternary(node),
            AstKind::Negate | AstKind::Not | AstKind::BitNot | AstKind::Len => {
                let opcode = match node.kind {
                    AstKind::Negate => Opcode::Negate,
                    AstKind::Not => Opcode::Not,
                    AstKind::BitNot => Opcode::BitNot,
                    _ => Opcode::Len,
                };
                let operand = self.compile_exp(&node.children[0])?;
                let out = self.allocate_register()?;
                self.emit(opcode, out, operand, 0);
                self.free_register(operand);
                Ok(out)
            }
            kind => {
                let Some(opcode) = binary_opcode(kind) else {
                    return Err(self.err(format!("cannot compile node: {kind}")));
                };
                let lhs = self.compile_exp(&node.children[0])?;
                let rhs = self.compile_exp(&node.children[1])?;
                let out = self.allocate_register()?;
                self.emit(opcode, out, lhs, rhs);
                self.free_register(lhs);
                self.free_register(rhs);
                Ok(out)
            }
        }
    }

    fn compile_identifier(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let Some(var) = self.lookup(&node.text)? else {
            return Err(self.err(format!("can't find variable: {}", node.text)));
        };
        if var.is_global {
            let out = self.allocate_register()?;
            self.emit_imm(Opcode::ReadGlobal, out, var.global_id);
            Ok(out)
        } else {
            Ok(var.reg)
        }
    }

    fn compile_number(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let out = self.allocate_register()?;
        let n = node.number;
        // Small non-negative integers load as immediates; everything else
        // goes through the constant pool.
        if n.trunc() == n && (0.0..=f64::from(u16::MAX)).contains(&n) {
            self.emit_imm(Opcode::LoadSmallInt, out, n as u16);
        } else {
            let index = self.store_number(n)?;
            self.emit_imm(Opcode::LoadConst, out, index);
        }
        Ok(out)
    }

    fn compile_array_literal(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let out = self.allocate_register()?;
        let count = node.children.len();
        if count > u8::MAX as usize {
            return Err(self.err("array literal has too many elements"));
        }
        let mut element_regs = Vec::with_capacity(count);
        for element in &node.children {
            element_regs.push(self.compile_exp(element)?);
        }
        self.line = node.line;
        let end = self.get_end_register();
        if end + count > MAX_REGISTERS {
            return Err(self.err("ran out of registers"));
        }
        for (i, &reg) in element_regs.iter().enumerate() {
            self.emit(Opcode::Move, (end + i) as u8, reg, 0);
        }
        if count > 0 {
            self.frame_mut().touch_register(end + count - 1);
        }
        for reg in element_regs {
            self.free_register(reg);
        }
        self.emit(Opcode::AllocArray, out, count as u8, end as u8);
        Ok(out)
    }

    fn compile_object_literal(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let out = self.allocate_register()?;
        let count = node.children.len();
        if count > 127 {
            return Err(self.err("object literal has too many entries"));
        }
        let mut key_indices = Vec::with_capacity(count);
        let mut value_regs = Vec::with_capacity(count);
        for pair in &node.children {
            key_indices.push(self.store_string(&pair.children[0].text)?);
            value_regs.push(self.compile_exp(&pair.children[1])?);
        }
        self.line = node.line;
        let end = self.get_end_register();
        if end + count * 2 > MAX_REGISTERS {
            return Err(self.err("ran out of registers"));
        }
        for i in 0..count {
            self.emit_imm(Opcode::LoadConst, (end + i * 2) as u8, key_indices[i]);
            self.emit(Opcode::Move, (end + i * 2 + 1) as u8, value_regs[i], 0);
        }
        if count > 0 {
            self.frame_mut().touch_register(end + count * 2 - 1);
        }
        for reg in value_regs {
            self.free_register(reg);
        }
        self.emit(Opcode::AllocObject, out, count as u8, end as u8);
        Ok(out)
    }

    fn compile_ternary(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let out = self.allocate_register()?;
        let cond_reg = self.compile_exp(&node.children[0])?;
        self.emit(Opcode::CondSkip, cond_reg, 0, 0);
        self.free_register(cond_reg);
        let skip_then = self.emit_jump_placeholder();

        // Each branch gets its own scope: a capture mirror created inside
        // one branch must not be reused by the other, whose path would
        // never have loaded it.
        self.push_scope();
        let then_reg = self.compile_exp(&node.children[1])?;
        self.emit(Opcode::Move, out, then_reg, 0);
        self.free_register(then_reg);
        self.pop_scope();
        let skip_else = self.emit_jump_placeholder();

        self.push_scope();
        let else_reg = self.compile_exp(&node.children[2])?;
        self.emit(Opcode::Move, out, else_reg, 0);
        self.free_register(else_reg);
        self.pop_scope();

        let end = self.here();
        self.patch_jump(skip_then, skip_else + 1)?;
        self.patch_jump(skip_else, end)?;
        Ok(out)
    }

    /// Compiles a function literal: lower the child fragment first (its
    /// lookups may add captures and `ReadCapture` loads to this frame),
    /// then allocate the closure over it.
    fn compile_func_literal(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let named = node.children.len() == 3;
        let out = self.allocate_register()?;
        let mut global_binding = None;
        if named {
            let name = &node.children[2].text;
            // Bind before compiling the body so the function can recurse
            // through its own name.
            if self.in_module_frame() {
                global_binding = Some(self.bind_global(name, true)?);
            } else {
                self.bind_local(name, out, true);
            }
        }

        let label = if named { &*node.children[2].text } else { "(anonymous)" };
        let full_name = format!("{}::{}", self.frame().fragment.name, label);
        let fragment = self.compile_function(node, full_name)?;

        let frame = self.frame_mut();
        let index = u16::try_from(frame.fragment.fragments.len()).map_err(|_| {
            CompileError::new("too many nested functions", node.line)
        })?;
        frame.fragment.fragments.push(Rc::new(fragment));
        self.line = node.line;
        self.emit_imm(Opcode::AllocFunc, out, index);
        if let Some(var) = global_binding {
            self.emit_imm(Opcode::WriteGlobal, out, var.global_id);
        }
        Ok(out)
    }

    fn compile_function(&mut self, node: &AstNode, name: String) -> Result<CodeFragment, CompileError> {
        self.frames.push(FuncFrame::new(name));
        let params = &node.children[0].children;
        if params.len() > u8::MAX as usize {
            return Err(self.err("too many parameters"));
        }
        for (i, param) in params.iter().enumerate() {
            let frame = self.frame();
            if frame.scopes[0].bindings.contains_key(&*param.text) {
                return Err(CompileError::new(
                    format!("duplicate parameter: {}", param.text),
                    param.line,
                ));
            }
            self.frame_mut().touch_register(i);
            self.bind_local(&param.text, i as u8, false);
        }
        self.frame_mut().fragment.arity = params.len() as u8;
        self.compile_stat(&node.children[1])?;
        self.emit(Opcode::Ret, 0, 0, 0);
        Ok(self.frames.pop().expect("function frame missing").fragment)
    }

    fn compile_call(&mut self, node: &AstNode) -> Result<u8, CompileError> {
        let args = &node.children[1].children;
        if args.len() > u8::MAX as usize {
            return Err(self.err("too many call arguments"));
        }
        let mut arg_regs = Vec::with_capacity(args.len());
        for arg in args {
            arg_regs.push(self.compile_exp(arg)?);
        }
        let func_reg = self.compile_exp(&node.children[0])?;
        self.line = node.line;

        // Stage the arguments contiguously above the frame's in-use
        // registers, leaving the three header slots below them.
        let end = self.get_end_register();
        let top = end + STACK_FRAME_OVERHEAD + args.len();
        if top > MAX_REGISTERS {
            return Err(self.err("ran out of registers"));
        }
        for (i, &reg) in arg_regs.iter().enumerate() {
            self.emit(Opcode::Move, (end + STACK_FRAME_OVERHEAD + i) as u8, reg, 0);
        }
        if top > end {
            self.frame_mut().touch_register(top - 1);
        }
        self.emit(Opcode::Call, func_reg, args.len() as u8, end as u8);
        for reg in arg_regs {
            self.free_register(reg);
        }
        self.free_register(func_reg);
        // The return value lands in the end register.
        self.frame_mut().registers[end] = RegState::Busy;
        self.frame_mut().touch_register(end);
        Ok(end as u8)
    }
}

fn binary_opcode(kind: AstKind) -> Option<Opcode> {
    Some(match kind {
        AstKind::Or => Opcode::Or,
        AstKind::And => Opcode::And,
        AstKind::BitOr => Opcode::BitOr,
        AstKind::BitXor => Opcode::BitXor,
        AstKind::BitAnd => Opcode::BitAnd,
        AstKind::Equal => Opcode::Equal,
        AstKind::NotEqual => Opcode::NotEqual,
        AstKind::LessEq => Opcode::LessEq,
        AstKind::GreaterEq => Opcode::GreaterEq,
        AstKind::Less => Opcode::Less,
        AstKind::Greater => Opcode::Greater,
        AstKind::Shl => Opcode::Shl,
        AstKind::Shr => Opcode::Shr,
        AstKind::Add => Opcode::Add,
        AstKind::Sub => Opcode::Sub,
        AstKind::Mul => Opcode::Mul,
        AstKind::Div => Opcode::Div,
        AstKind::Mod => Opcode::Mod,
        AstKind::Pow => Opcode::Pow,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    fn compile(src: &str) -> Result<CodeFragment, CompileError> {
        let ast = parse(src).expect("test source should parse");
        let mut module = ModuleScope::default();
        let global_ns = ModuleScope::default();
        let mut interns = Interns::new();
        let mut next_gid = 0;
        Compiler::new(&mut module, &global_ns, &mut interns, &mut next_gid).compile_module("test", &ast)
    }

    /// Walks a fragment tree checking the compiler's structural
    /// guarantees: register ceiling, in-range jumps, in-range captures.
    fn check_fragment(fragment: &CodeFragment) {
        assert!(fragment.max_register as usize <= MAX_REGISTERS, "{}", fragment.name);
        assert_eq!(fragment.instructions.len(), fragment.line_numbers.len());
        for (i, ins) in fragment.instructions.iter().enumerate() {
            match ins.op {
                Opcode::JumpForward => {
                    assert!(i + ins.imm() as usize <= fragment.instructions.len(), "{}", fragment.name);
                }
                Opcode::JumpBack => {
                    assert!(ins.imm() as usize <= i, "{}", fragment.name);
                }
                Opcode::ReadCapture => {
                    assert!((ins.r1 as usize) < fragment.capture_info.len(), "{}", fragment.name);
                }
                Opcode::LoadConst => {
                    assert!((ins.imm() as usize) < fragment.constants.len(), "{}", fragment.name);
                }
                _ => {}
            }
        }
        for child in &fragment.fragments {
            check_fragment(child);
        }
    }

    #[test]
    fn module_fragment_always_returns() {
        let fragment = compile("let x = 1").unwrap();
        assert_eq!(fragment.instructions.last().map(|i| i.op), Some(Opcode::Ret));
        check_fragment(&fragment);
    }

    #[test]
    fn structural_invariants_hold_across_features() {
        let sources = [
            "let a = 1 + 2 * 3 - 4 / 5 % 6 ** 7",
            "let f = fn(a, b) { return a < b ? a : b }",
            "let o = { a = 1, b = 2 }\no.a = o.a + o.b",
            "let arr = [1, 2, 3]\nfor v in arr { let y = v }",
            "for k, v in { a = 1 } { let t = v }",
            "for i in 0 .. 10 { while i > 100 { i = 0 } }",
            "let make = fn() { let x = 0; return fn() { x = x + 1; return x } }",
            "if 1 < 2 { let a = 1 } else { if 2 < 3 { let b = 2 } }",
        ];
        for src in sources {
            let fragment = compile(src).unwrap_or_else(|e| panic!("{src}: {e}"));
            check_fragment(&fragment);
        }
    }

    #[test]
    fn undeclared_name_is_a_compile_error() {
        let err = compile("let x = missing").unwrap_err();
        assert!(err.message.contains("can't find variable"), "{}", err.message);
    }

    #[test]
    fn const_reassignment_is_a_compile_error() {
        let err = compile("const x = 1\nx = 2").unwrap_err();
        assert!(err.message.contains("const"), "{}", err.message);
        assert_eq!(err.line, 2);
    }

    #[test]
    fn illegal_assignment_target_is_rejected() {
        let err = compile("let f = fn() { return 0 }\nf() = 3").unwrap_err();
        assert!(err.message.contains("illegal assignment target"), "{}", err.message);
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let err = compile("let f = fn(a, a) { return a }").unwrap_err();
        assert!(err.message.contains("duplicate parameter"), "{}", err.message);
    }

    #[test]
    fn closure_capture_is_planned() {
        let fragment = compile("let make = fn() { let x = 0; return fn() { return x } }").unwrap();
        let outer = &fragment.fragments[0];
        let inner = &outer.fragments[0];
        assert_eq!(inner.capture_info.len(), 1);
        assert!(inner.instructions.iter().any(|i| i.op == Opcode::ReadCapture));
        check_fragment(&fragment);
    }

    #[test]
    fn capture_through_two_boundaries_mirrors_each_frame() {
        let fragment =
            compile("let f = fn() { let x = 1; return fn() { return fn() { return x } } }").unwrap();
        let outer = &fragment.fragments[0];
        let middle = &outer.fragments[0];
        let inner = &middle.fragments[0];
        assert_eq!(middle.capture_info.len(), 1);
        assert_eq!(inner.capture_info.len(), 1);
        check_fragment(&fragment);
    }

    #[test]
    fn module_declarations_become_globals() {
        let fragment = compile("let a = 1\nconst b = 2").unwrap();
        let writes = fragment
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::WriteGlobal)
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn small_integers_avoid_the_constant_pool() {
        let fragment = compile("let a = 42").unwrap();
        assert!(fragment.instructions.iter().any(|i| i.op == Opcode::LoadSmallInt));
        let fragment = compile("let a = 1.5").unwrap();
        assert!(fragment.instructions.iter().any(|i| i.op == Opcode::LoadConst));
    }
}
