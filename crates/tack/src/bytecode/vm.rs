//! The virtual machine.
//!
//! A `Vm` owns everything a running program needs: the fixed value stack,
//! the dense globals table, the heap, the intern table, the host function
//! registry, and the loaded-module map. Registers are stack slots
//! addressed relative to `stackbase`; a Box-tagged slot is read and
//! written through transparently, which is what makes captured variables
//! shared between closures.
//!
//! The call protocol reserves three header slots below a callee's
//! argument range: the saved program counter, the caller's closure, and
//! the caller's stack base. `Ret` restores them, zeroes the abandoned
//! frame (stale Box slots must never survive into a later frame), and
//! leaves the return value in the caller's staging register. The garbage
//! collector walks this header chain to find its stack roots.

use std::{path::PathBuf, rc::Rc};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{
        code::{CodeFragment, Instruction},
        compiler::{Compiler, ModuleScope, STACK_FRAME_OVERHEAD, Variable},
        op::Opcode,
    },
    error::{RunError, RunErrorKind, RunResult, TackError},
    heap::{GcState, Heap, HeapStats},
    intern::{Interns, StringId},
    io::{PrintWriter, StdPrint},
    object::ObjectData,
    parse::parse,
    value::{StringRef, Type, Value, format_number},
};

/// Fixed stack capacity, in values.
pub const MAX_STACK: usize = 4096;

/// Signature for host functions callable from Tack. Arguments are already
/// on the VM stack; the slice views them in place.
pub type CFunction = fn(&mut Vm, &[Value]) -> RunResult<Value>;

/// A Tack virtual machine instance. Instances share nothing.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interns: Interns,
    globals: Vec<Value>,
    stack: Vec<Value>,
    stackbase: usize,
    cfunctions: Vec<CFunction>,
    /// Host-registered bindings, the parent namespace of every module.
    global_scope: ModuleScope,
    /// Loaded modules by name; presence means the module already ran.
    modules: AHashMap<String, ModuleScope>,
    module_dirs: Vec<PathBuf>,
    next_global_id: u16,
    pub(crate) writer: Box<dyn PrintWriter>,
    last_error: Option<RunError>,
    log_ast: bool,
    log_bytecode: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            interns: Interns::new(),
            globals: Vec::new(),
            stack: vec![Value::NULL; MAX_STACK],
            stackbase: 0,
            cfunctions: Vec::new(),
            global_scope: ModuleScope::default(),
            modules: AHashMap::new(),
            module_dirs: Vec::new(),
            next_global_id: 0,
            writer: Box::new(StdPrint),
            last_error: None,
            log_ast: false,
            log_bytecode: false,
        };
        // Language-level constants, visible to every module.
        vm.set_global("null", Value::NULL, true);
        vm.set_global("true", Value::TRUE, true);
        vm.set_global("false", Value::FALSE, true);
        vm
    }

    /// Replaces the `print` output destination.
    pub fn set_writer(&mut self, writer: Box<dyn PrintWriter>) {
        self.writer = writer;
    }

    /// Dump the parsed AST of each loaded module to stderr.
    pub fn set_log_ast(&mut self, enabled: bool) {
        self.log_ast = enabled;
    }

    /// Dump the compiled bytecode of each loaded module to stderr.
    pub fn set_log_bytecode(&mut self, enabled: bool) {
        self.log_bytecode = enabled;
    }

    // ---- embedding API: globals --------------------------------------

    /// Binds `name` in the host namespace, creating the binding if needed.
    pub fn set_global(&mut self, name: &str, value: Value, is_const: bool) {
        let global_id = if let Some(var) = self.global_scope.bindings.get(name) {
            var.global_id
        } else {
            debug_assert!(self.next_global_id < u16::MAX, "global table exhausted");
            let global_id = self.next_global_id;
            self.next_global_id += 1;
            self.global_scope.bindings.insert(
                name.to_owned(),
                Variable {
                    reg: 0xff,
                    is_const,
                    is_global: true,
                    global_id,
                },
            );
            global_id
        };
        if self.globals.len() <= global_id as usize {
            self.globals.resize(global_id as usize + 1, Value::NULL);
        }
        self.globals[global_id as usize] = value;
    }

    /// Binds `name` inside a loaded module's namespace. Returns false when
    /// the module is unknown.
    pub fn set_global_in(&mut self, name: &str, module: &str, value: Value, is_const: bool) -> bool {
        let Some(scope) = self.modules.get_mut(module) else {
            return false;
        };
        let global_id = if let Some(var) = scope.bindings.get(name) {
            var.global_id
        } else {
            debug_assert!(self.next_global_id < u16::MAX, "global table exhausted");
            let global_id = self.next_global_id;
            self.next_global_id += 1;
            scope.bindings.insert(
                name.to_owned(),
                Variable {
                    reg: 0xff,
                    is_const,
                    is_global: true,
                    global_id,
                },
            );
            global_id
        };
        if self.globals.len() <= global_id as usize {
            self.globals.resize(global_id as usize + 1, Value::NULL);
        }
        self.globals[global_id as usize] = value;
        true
    }

    /// Reads a host-namespace global; `null` when unbound.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Value {
        self.read_scope_global(&self.global_scope, name)
    }

    /// Reads a global from a loaded module's namespace; `null` when the
    /// module or the name is unknown.
    #[must_use]
    pub fn get_global_in(&self, name: &str, module: &str) -> Value {
        match self.modules.get(module) {
            Some(scope) => self.read_scope_global(scope, name),
            None => Value::NULL,
        }
    }

    fn read_scope_global(&self, scope: &ModuleScope, name: &str) -> Value {
        scope
            .bindings
            .get(name)
            .and_then(|var| self.globals.get(var.global_id as usize))
            .copied()
            .unwrap_or(Value::NULL)
    }

    /// Registers a host function and returns its callable value.
    pub fn register_cfunction(&mut self, f: CFunction) -> Value {
        let index = self.cfunctions.len() as u32;
        self.cfunctions.push(f);
        Value::cfunction(index)
    }

    /// Registers a host function under a const global name.
    pub fn set_global_fn(&mut self, name: &str, f: CFunction) {
        let value = self.register_cfunction(f);
        self.set_global(name, value, true);
    }

    // ---- embedding API: allocation -----------------------------------

    /// Allocates an empty array. Refcount starts at zero: pin with
    /// [`Vm::retain`] to keep it across the next collection point.
    pub fn alloc_array(&mut self) -> Value {
        Value::array(self.heap.alloc_array(Vec::new()))
    }

    pub fn alloc_object(&mut self) -> Value {
        Value::object(self.heap.alloc_object(ObjectData::new()))
    }

    /// Allocates a transient (GC-managed) string.
    pub fn alloc_string(&mut self, text: &str) -> Value {
        Value::transient_string(self.heap.alloc_string(text))
    }

    /// Interns a string for the VM's lifetime.
    pub fn intern_string(&mut self, text: &str) -> Value {
        Value::interned_string(self.interns.intern(text))
    }

    /// Removes a key from an object value, leaving a tombstone so that
    /// live iteration cursors stay valid. Returns the removed value, or
    /// `None` when the value is not an object or the key is absent.
    pub fn object_remove(&mut self, object: Value, key: &str) -> Option<Value> {
        let id = object.as_object()?;
        let key = self.interns.lookup(key)?;
        self.heap.objects.get_mut(id)?.remove(key)
    }

    /// Pins a heap value so the collector treats it as a root.
    pub fn retain(&mut self, value: Value) {
        self.heap.retain(value);
    }

    pub fn release(&mut self, value: Value) {
        self.heap.release(value);
    }

    #[must_use]
    pub fn gc_state(&self) -> GcState {
        self.heap.gc_state()
    }

    pub fn set_gc_state(&mut self, state: GcState) {
        self.heap.set_gc_state(state);
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Runs a full collection immediately, with globals and host pins as
    /// the only roots. Intended for hosts between VM invocations.
    pub fn collect_now(&mut self) {
        for i in 0..self.globals.len() {
            let value = self.globals[i];
            self.heap.mark(value);
        }
        self.heap.mark_pinned();
        self.heap.sweep();
    }

    /// The last runtime error reported by [`Vm::call`], if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&RunError> {
        self.last_error.as_ref()
    }

    // ---- module loading ----------------------------------------------

    /// Appends a directory to the module search path; the empty string
    /// means the current working directory.
    pub fn add_module_dir(&mut self, dir: &str) {
        if dir.is_empty() {
            self.module_dirs
                .push(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        } else {
            self.module_dirs.push(PathBuf::from(dir));
        }
    }

    /// Loads, compiles and runs `name + ".tack"` from the search path.
    /// Idempotent: a module's top level runs once.
    pub fn load_module(&mut self, name: &str) -> Result<(), TackError> {
        if self.modules.contains_key(name) {
            return Ok(());
        }
        let filename = format!("{name}.tack");
        let source = self
            .module_dirs
            .iter()
            .find_map(|dir| std::fs::read_to_string(dir.join(&filename)).ok());
        let Some(source) = source else {
            return Err(TackError::Module(format!("unable to load module: {name}")));
        };
        self.load_source(name, &source)
    }

    /// Compiles and runs source text as the module `name`. The module's
    /// top level is wrapped as a zero-argument function and called once;
    /// a runtime error inside it is reported like any other call.
    pub fn load_source(&mut self, name: &str, source: &str) -> Result<(), TackError> {
        if self.modules.contains_key(name) {
            return Ok(());
        }
        let ast = parse(source)?;
        if self.log_ast {
            eprintln!("{}", ast.dump());
        }
        let mut scope = ModuleScope::default();
        let fragment = Compiler::new(
            &mut scope,
            &self.global_scope,
            &mut self.interns,
            &mut self.next_global_id,
        )
        .compile_module(name, &ast)?;
        if self.log_bytecode {
            eprintln!("{}", fragment.disassemble(&self.interns));
        }
        self.globals.resize(self.next_global_id as usize, Value::NULL);

        let closure_id = self.heap.alloc_closure(Rc::new(fragment));
        let func = Value::function(closure_id);
        self.heap.retain(func);
        self.call(func, &[]);
        self.heap.release(func);
        self.modules.insert(name.to_owned(), scope);
        Ok(())
    }

    // ---- calls -------------------------------------------------------

    /// Calls a function or host function. A runtime error unwinds to this
    /// boundary: it is reported to stderr, recorded for
    /// [`Vm::last_error`], and `null` is returned.
    pub fn call(&mut self, f: Value, args: &[Value]) -> Value {
        match self.run_call(f, args) {
            Ok(value) => {
                self.last_error = None;
                value
            }
            Err(err) => {
                eprintln!("runtime error: {err}");
                self.last_error = Some(err);
                Value::NULL
            }
        }
    }

    /// Like [`Vm::call`], but propagates the error instead of reporting
    /// it. Builtins use this to reenter the VM so a failure inside a
    /// callback unwinds to the outermost host call.
    pub(crate) fn run_call(&mut self, f: Value, args: &[Value]) -> RunResult<Value> {
        if let Some(index) = f.as_cfunction() {
            let Some(&func) = self.cfunctions.get(index as usize) else {
                return Err(RunError::type_error("unknown host function"));
            };
            return func(self, args);
        }
        let Some(closure_id) = f.as_function() else {
            return Err(RunError::type_error(format!(
                "tried to call a {} value",
                f.type_of()
            )));
        };
        let frag = self.closure_fragment(closure_id)?;
        if args.len() != frag.arity as usize {
            return Err(RunError::new(
                RunErrorKind::ArityError,
                format!("{} expects {} arguments, got {}", frag.name, frag.arity, args.len()),
            ));
        }
        let initial_base = self.stackbase;
        let new_base = initial_base + STACK_FRAME_OVERHEAD;
        if new_base + frag.max_register as usize > MAX_STACK {
            return Err(RunError::new(RunErrorKind::StackOverflow, "stack overflow"));
        }
        // Frame header for the entry frame; the saved closure is the
        // callee itself, and the saved base terminates the GC's walk.
        self.stack[initial_base] = Value::number(frag.instructions.len() as f64);
        self.stack[initial_base + 1] = f;
        self.stack[initial_base + 2] = Value::number(initial_base as f64);
        self.stackbase = new_base;
        for (i, &arg) in args.iter().enumerate() {
            self.stack[new_base + i] = arg;
        }
        // Clear the rest of the frame: a reentrant host call may sit
        // above a partially-used caller frame.
        for slot in args.len()..frag.max_register as usize {
            self.stack[new_base + slot] = Value::NULL;
        }

        let result = self.execute(closure_id, frag, initial_base);
        if result.is_err() {
            // Unwind: drop everything this call pushed and scrub stale
            // Box slots out of the abandoned region.
            for slot in initial_base..MAX_STACK {
                self.stack[slot] = Value::NULL;
            }
            self.stackbase = initial_base;
        }
        result
    }

    /// The dispatch loop. Runs until the frame that `run_call` pushed
    /// returns.
    fn execute(&mut self, entry_closure: u32, entry_frag: Rc<CodeFragment>, initial_base: usize) -> RunResult<Value> {
        let mut closure_id = entry_closure;
        let mut frag = entry_frag;
        let mut pc: usize = 0;

        macro_rules! throw {
            ($err:expr) => {{
                let err: RunError = $err;
                let line = frag.line_numbers.get(pc).copied().unwrap_or(0);
                return Err(err.at(&frag.name, line));
            }};
        }
        macro_rules! attempt {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => throw!(err),
                }
            };
        }

        loop {
            let Some(&ins) = frag.instructions.get(pc) else {
                throw!(RunError::type_error("fell off the end of the bytecode"));
            };
            let base = self.stackbase;
            match ins.op {
                Opcode::LoadConst => {
                    let Some(&constant) = frag.constants.get(ins.imm() as usize) else {
                        throw!(RunError::type_error("malformed bytecode: bad constant index"));
                    };
                    self.set_reg(base, ins.r0, constant);
                }
                Opcode::LoadSmallInt => self.set_reg(base, ins.r0, Value::number(f64::from(ins.imm()))),
                Opcode::LoadBool => self.set_reg(base, ins.r0, Value::boolean(ins.r1 != 0)),
                Opcode::LoadNull => self.set_reg(base, ins.r0, Value::NULL),
                Opcode::Move => {
                    let value = self.reg(base, ins.r1);
                    self.set_reg(base, ins.r0, value);
                }
                Opcode::ReadGlobal => {
                    let value = self.globals.get(ins.imm() as usize).copied().unwrap_or(Value::NULL);
                    self.set_reg(base, ins.r0, value);
                }
                Opcode::WriteGlobal => {
                    let value = self.reg(base, ins.r0);
                    let index = ins.imm() as usize;
                    if index >= self.globals.len() {
                        self.globals.resize(index + 1, Value::NULL);
                    }
                    self.globals[index] = value;
                }
                Opcode::ReadCapture => {
                    let value = self
                        .heap
                        .closures
                        .get(closure_id)
                        .and_then(|c| c.captures.get(ins.r1 as usize))
                        .copied()
                        .unwrap_or(Value::NULL);
                    self.stack[base + ins.r0 as usize] = value;
                }
                Opcode::ZeroCapture => self.stack[base + ins.r0 as usize] = Value::NULL,

                Opcode::Increment => {
                    let Some(n) = self.reg(base, ins.r0).as_number() else {
                        throw!(RunError::type_error("increment expected a number"));
                    };
                    self.set_reg(base, ins.r0, Value::number(n + 1.0));
                }
                Opcode::Negate => {
                    let Some(n) = self.reg(base, ins.r1).as_number() else {
                        throw!(RunError::type_error("unary '-' expected a number"));
                    };
                    self.set_reg(base, ins.r0, Value::number(-n));
                }
                Opcode::Not => {
                    let value = self.reg(base, ins.r1);
                    self.set_reg(base, ins.r0, Value::boolean(!value.truthy()));
                }
                Opcode::BitNot => {
                    let Some(n) = self.reg(base, ins.r1).as_number() else {
                        throw!(RunError::type_error("unary '~' expected a number"));
                    };
                    self.set_reg(base, ins.r0, Value::number(f64::from(!(n as u32))));
                }
                Opcode::Len => attempt!(self.exec_len(ins)),

                Opcode::Add => attempt!(self.exec_add(ins)),
                Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                    attempt!(self.exec_arith(ins));
                }
                Opcode::Shl | Opcode::Shr => attempt!(self.exec_shift(ins)),
                Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => attempt!(self.exec_bitwise(ins)),
                Opcode::Equal => {
                    let result = self.reg(base, ins.r1).equals(self.reg(base, ins.r2));
                    self.set_reg(base, ins.r0, Value::boolean(result));
                }
                Opcode::NotEqual => {
                    let result = !self.reg(base, ins.r1).equals(self.reg(base, ins.r2));
                    self.set_reg(base, ins.r0, Value::boolean(result));
                }
                Opcode::Less | Opcode::Greater | Opcode::LessEq | Opcode::GreaterEq => {
                    attempt!(self.exec_compare(ins));
                }
                Opcode::And => {
                    let result = self.reg(base, ins.r1).truthy() && self.reg(base, ins.r2).truthy();
                    self.set_reg(base, ins.r0, Value::boolean(result));
                }
                Opcode::Or => {
                    let result = self.reg(base, ins.r1).truthy() || self.reg(base, ins.r2).truthy();
                    self.set_reg(base, ins.r0, Value::boolean(result));
                }

                Opcode::JumpForward => {
                    pc += ins.imm() as usize;
                    continue;
                }
                Opcode::JumpBack => {
                    let Some(target) = pc.checked_sub(ins.imm() as usize) else {
                        throw!(RunError::type_error("malformed bytecode: jump out of range"));
                    };
                    pc = target;
                    continue;
                }
                Opcode::CondSkip => {
                    if self.reg(base, ins.r0).truthy() {
                        pc += 1;
                    }
                }

                Opcode::ForInt => {
                    let counter = self.reg(base, ins.r0).as_number();
                    let bound = self.reg(base, ins.r1).as_number();
                    let (Some(counter), Some(bound)) = (counter, bound) else {
                        throw!(RunError::type_error("for range expected numbers"));
                    };
                    if counter < bound {
                        pc += 1;
                    }
                }
                Opcode::ForIterInit => {
                    let iterable = self.reg(base, ins.r1);
                    if iterable.is_array() {
                        self.stack[base + ins.r0 as usize] = Value::number(0.0);
                    } else if let Some(id) = iterable.as_object() {
                        let first = self.heap.objects.get(id).map_or(0, ObjectData::first_slot);
                        self.stack[base + ins.r0 as usize] = Value::number(f64::from(first));
                    } else {
                        throw!(RunError::type_error("for loop expected array or object"));
                    }
                }
                Opcode::ForIter => {
                    let iterable = self.reg(base, ins.r1);
                    let cursor = self.cursor(base, ins.r0);
                    if let Some(id) = iterable.as_array() {
                        let element = self.heap.arrays.get(id).and_then(|a| a.get(cursor).copied());
                        if let Some(element) = element {
                            self.set_reg(base, ins.r2, element);
                            pc += 1;
                        }
                    } else if let Some(id) = iterable.as_object() {
                        let key = self.heap.objects.get(id).and_then(|o| {
                            (cursor < o.end_slot() as usize).then(|| o.key_at(cursor as u32))
                        });
                        if let Some(key) = key {
                            self.set_reg(base, ins.r2, Value::interned_string(key));
                            pc += 1;
                        }
                    } else {
                        throw!(RunError::type_error("for loop expected array or object"));
                    }
                }
                Opcode::ForIterPair => {
                    let iterable = self.reg(base, ins.r1);
                    let Some(id) = iterable.as_object() else {
                        throw!(RunError::type_error("two-variable for loop expected an object"));
                    };
                    let cursor = self.cursor(base, ins.r0);
                    let entry = self.heap.objects.get(id).and_then(|o| {
                        (cursor < o.end_slot() as usize).then(|| (o.key_at(cursor as u32), o.value_at(cursor as u32)))
                    });
                    if let Some((key, value)) = entry {
                        self.set_reg(base, ins.r2, Value::interned_string(key));
                        self.set_reg(base, ins.r2 + 1, value);
                        pc += 1;
                    }
                }
                Opcode::ForIterNext => {
                    let iterable = self.reg(base, ins.r1);
                    let cursor = self.cursor(base, ins.r0);
                    if iterable.is_array() {
                        self.stack[base + ins.r0 as usize] = Value::number(cursor as f64 + 1.0);
                    } else if let Some(id) = iterable.as_object() {
                        let next = self.heap.objects.get(id).map_or(0, |o| o.next_slot(cursor as u32));
                        self.stack[base + ins.r0 as usize] = Value::number(f64::from(next));
                    }
                }

                Opcode::AllocArray => {
                    let count = ins.r1 as usize;
                    let values: Vec<Value> = (0..count).map(|i| self.reg(base, ins.r2 + i as u8)).collect();
                    let id = self.heap.alloc_array(values);
                    self.set_reg(base, ins.r0, Value::array(id));
                }
                Opcode::AllocObject => {
                    let count = ins.r1 as usize;
                    let id = self.heap.alloc_object(ObjectData::new());
                    for i in 0..count {
                        let key = self.reg(base, ins.r2 + (i * 2) as u8);
                        let value = self.reg(base, ins.r2 + (i * 2 + 1) as u8);
                        let key = attempt!(self.key_id(key));
                        if let Some(object) = self.heap.objects.get_mut(id) {
                            object.set(key, value);
                        }
                    }
                    self.set_reg(base, ins.r0, Value::object(id));
                }
                Opcode::AllocFunc => {
                    let Some(child) = frag.fragments.get(ins.imm() as usize).cloned() else {
                        throw!(RunError::type_error("malformed bytecode: bad fragment index"));
                    };
                    let id = self.heap.alloc_closure(child.clone());
                    // The capture-boxing protocol: box each source
                    // register in place unless it already holds a box, so
                    // aliasing closures share one cell.
                    let mut captures = Vec::with_capacity(child.capture_info.len());
                    for capture in &child.capture_info {
                        let slot = base + capture.source as usize;
                        let current = self.stack[slot];
                        let boxed = if current.is_boxed() {
                            current
                        } else {
                            let box_id = self.heap.alloc_box(current);
                            let value = Value::boxed(box_id);
                            self.stack[slot] = value;
                            value
                        };
                        captures.push(boxed);
                    }
                    if let Some(closure) = self.heap.closures.get_mut(id) {
                        closure.captures = captures;
                    }
                    self.set_reg(base, ins.r0, Value::function(id));
                }
                Opcode::AllocBox => {
                    let value = self.reg(base, ins.r1);
                    let id = self.heap.alloc_box(value);
                    self.stack[base + ins.r0 as usize] = Value::boxed(id);
                }

                Opcode::LoadArray => attempt!(self.exec_load_array(ins)),
                Opcode::StoreArray => attempt!(self.exec_store_array(ins)),
                Opcode::LoadObject => attempt!(self.exec_load_object(ins)),
                Opcode::StoreObject => attempt!(self.exec_store_object(ins)),

                Opcode::Call => {
                    let callee = self.reg(base, ins.r0);
                    let nargs = ins.r1 as usize;
                    let end = ins.r2 as usize;
                    if let Some(id) = callee.as_function() {
                        let callee_frag = attempt!(self.closure_fragment(id));
                        if nargs != callee_frag.arity as usize {
                            throw!(RunError::new(
                                RunErrorKind::ArityError,
                                format!(
                                    "{} expects {} arguments, got {}",
                                    callee_frag.name, callee_frag.arity, nargs
                                ),
                            ));
                        }
                        let new_base = base + end + STACK_FRAME_OVERHEAD;
                        if new_base + callee_frag.max_register as usize > MAX_STACK {
                            throw!(RunError::new(RunErrorKind::StackOverflow, "stack overflow"));
                        }
                        self.stack[new_base - 3] = Value::number(pc as f64);
                        self.stack[new_base - 2] = Value::function(closure_id);
                        self.stack[new_base - 1] = Value::number(base as f64);
                        self.stackbase = new_base;
                        closure_id = id;
                        frag = callee_frag;
                        pc = 0;
                        continue;
                    } else if let Some(index) = callee.as_cfunction() {
                        let Some(&func) = self.cfunctions.get(index as usize) else {
                            throw!(RunError::type_error("unknown host function"));
                        };
                        let new_base = base + end + STACK_FRAME_OVERHEAD;
                        // Header written so a reentrant call's collector
                        // can walk back into this frame.
                        self.stack[new_base - 3] = Value::number(pc as f64);
                        self.stack[new_base - 2] = Value::function(closure_id);
                        self.stack[new_base - 1] = Value::number(base as f64);
                        let args: SmallVec<[Value; 8]> =
                            self.stack[new_base..new_base + nargs].iter().copied().collect();
                        self.stackbase = new_base;
                        let result = func(self, &args);
                        self.stackbase = base;
                        let value = attempt!(result);
                        self.stack[base + end] = value;
                    } else {
                        throw!(RunError::type_error(format!(
                            "tried to call a {} value",
                            callee.type_of()
                        )));
                    }
                }
                Opcode::Ret => {
                    let ret = if ins.r0 != 0 { self.reg(base, ins.r1) } else { Value::NULL };
                    if self.heap.should_collect() {
                        self.heap.mark(ret);
                        self.collect_garbage(closure_id);
                    }
                    let header = base - STACK_FRAME_OVERHEAD;
                    let saved_pc = self.stack[header].as_number().unwrap_or(0.0) as usize;
                    let saved_closure = self.stack[header + 1];
                    let saved_base = self.stack[header + 2].as_number().unwrap_or(0.0) as usize;
                    // Scrub the abandoned frame: stale Box slots would
                    // make later writes to these registers write through.
                    for slot in base..base + frag.max_register as usize {
                        self.stack[slot] = Value::NULL;
                    }
                    self.stack[header] = ret;
                    self.stack[header + 1] = Value::NULL;
                    self.stack[header + 2] = Value::NULL;
                    self.stackbase = saved_base;
                    if saved_base == initial_base {
                        return Ok(ret);
                    }
                    let Some(id) = saved_closure.as_function() else {
                        throw!(RunError::type_error("corrupted call frame"));
                    };
                    closure_id = id;
                    frag = attempt!(self.closure_fragment(id));
                    pc = saved_pc;
                }
            }
            pc += 1;
        }
    }

    // ---- register access ---------------------------------------------

    /// Reads a register, dereferencing a capture Box transparently.
    #[inline]
    fn reg(&self, base: usize, r: u8) -> Value {
        let value = self.stack[base + r as usize];
        match value.as_boxed() {
            Some(id) => self.heap.boxes.get(id).copied().unwrap_or(Value::NULL),
            None => value,
        }
    }

    /// Writes a register, writing through a capture Box transparently.
    #[inline]
    fn set_reg(&mut self, base: usize, r: u8, value: Value) {
        let slot = base + r as usize;
        if let Some(id) = self.stack[slot].as_boxed() {
            if let Some(cell) = self.heap.boxes.get_mut(id) {
                *cell = value;
                return;
            }
        }
        self.stack[slot] = value;
    }

    /// Raw read of an iterator-state slot.
    #[inline]
    fn cursor(&self, base: usize, r: u8) -> usize {
        self.stack[base + r as usize].as_number().unwrap_or(0.0) as usize
    }

    fn closure_fragment(&self, id: u32) -> RunResult<Rc<CodeFragment>> {
        self.heap
            .closures
            .get(id)
            .map(|c| c.fragment.clone())
            .ok_or_else(|| RunError::type_error("dangling function reference"))
    }

    // ---- opcode helpers ----------------------------------------------

    fn exec_len(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let value = self.reg(base, ins.r1);
        let len = if let Some(id) = value.as_array() {
            self.heap.arrays.get(id).map_or(0, Vec::len)
        } else if let Some(id) = value.as_object() {
            self.heap.objects.get(id).map_or(0, ObjectData::len)
        } else if let Some(r) = value.as_string() {
            self.string_text(r).len()
        } else {
            return Err(RunError::type_error("operator '#' expected string, array or object"));
        };
        self.set_reg(base, ins.r0, Value::number(len as f64));
        Ok(())
    }

    fn exec_add(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let lhs = self.reg(base, ins.r1);
        let rhs = self.reg(base, ins.r2);
        if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
            self.set_reg(base, ins.r0, Value::number(a + b));
            return Ok(());
        }
        if let (Some(a), Some(b)) = (lhs.as_string(), rhs.as_string()) {
            let mut text = String::with_capacity(self.string_text(a).len() + self.string_text(b).len());
            text.push_str(self.string_text(a));
            text.push_str(self.string_text(b));
            let id = self.heap.alloc_string(&text);
            self.set_reg(base, ins.r0, Value::transient_string(id));
            return Ok(());
        }
        if let (Some(a), Some(b)) = (lhs.as_array(), rhs.as_array()) {
            let mut joined = self.heap.arrays.get(a).cloned().unwrap_or_default();
            if let Some(right) = self.heap.arrays.get(b) {
                joined.extend_from_slice(right);
            }
            let id = self.heap.alloc_array(joined);
            self.set_reg(base, ins.r0, Value::array(id));
            return Ok(());
        }
        Err(RunError::type_error("operator '+' expected number, string or array"))
    }

    fn exec_arith(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let lhs = self.reg(base, ins.r1).as_number();
        let rhs = self.reg(base, ins.r2).as_number();
        let (Some(a), Some(b)) = (lhs, rhs) else {
            return Err(RunError::type_error(format!(
                "operator '{}' expected numbers",
                arith_symbol(ins.op)
            )));
        };
        let result = match ins.op {
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            Opcode::Mod => a % b,
            _ => a.powf(b),
        };
        self.set_reg(base, ins.r0, Value::number(result));
        Ok(())
    }

    /// `<<` and `>>`: bit shifts on numbers, append and pop on arrays.
    fn exec_shift(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let lhs = self.reg(base, ins.r1);
        let rhs = self.reg(base, ins.r2);
        if let Some(id) = lhs.as_array() {
            if ins.op == Opcode::Shl {
                if let Some(values) = self.heap.arrays.get_mut(id) {
                    values.push(rhs);
                }
                self.set_reg(base, ins.r0, rhs);
            } else {
                let popped = self.heap.arrays.get_mut(id).and_then(Vec::pop);
                let Some(popped) = popped else {
                    return Err(RunError::bounds_error("pop from empty array"));
                };
                self.set_reg(base, ins.r0, popped);
            }
            return Ok(());
        }
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            return Err(RunError::type_error("shift operator expected number or array"));
        };
        let result = if ins.op == Opcode::Shl {
            (a as u32).wrapping_shl(b as u32)
        } else {
            (a as u32).wrapping_shr(b as u32)
        };
        self.set_reg(base, ins.r0, Value::number(f64::from(result)));
        Ok(())
    }

    fn exec_bitwise(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let lhs = self.reg(base, ins.r1).as_number();
        let rhs = self.reg(base, ins.r2).as_number();
        let (Some(a), Some(b)) = (lhs, rhs) else {
            return Err(RunError::type_error("bitwise operator expected numbers"));
        };
        let (a, b) = (a as u32, b as u32);
        let result = match ins.op {
            Opcode::BitAnd => a & b,
            Opcode::BitOr => a | b,
            _ => a ^ b,
        };
        self.set_reg(base, ins.r0, Value::number(f64::from(result)));
        Ok(())
    }

    fn exec_compare(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let lhs = self.reg(base, ins.r1).as_number();
        let rhs = self.reg(base, ins.r2).as_number();
        let (Some(a), Some(b)) = (lhs, rhs) else {
            return Err(RunError::type_error("comparison expected numbers"));
        };
        let result = match ins.op {
            Opcode::Less => a < b,
            Opcode::Greater => a > b,
            Opcode::LessEq => a <= b,
            _ => a >= b,
        };
        self.set_reg(base, ins.r0, Value::boolean(result));
        Ok(())
    }

    fn exec_load_array(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let array = self.reg(base, ins.r1);
        let index = self.reg(base, ins.r2);
        let Some(id) = array.as_array() else {
            return Err(RunError::type_error("index expected an array"));
        };
        let Some(n) = index.as_number() else {
            return Err(RunError::type_error("array index must be a number"));
        };
        let values = self.heap.arrays.get(id).map(Vec::as_slice).unwrap_or_default();
        let i = n as i64;
        if i < 0 || i >= values.len() as i64 {
            return Err(RunError::bounds_error(format!("index {} out of range", format_number(n))));
        }
        let value = values[i as usize];
        self.set_reg(base, ins.r0, value);
        Ok(())
    }

    fn exec_store_array(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let value = self.reg(base, ins.r0);
        let array = self.reg(base, ins.r1);
        let index = self.reg(base, ins.r2);
        let Some(id) = array.as_array() else {
            return Err(RunError::type_error("index expected an array"));
        };
        let Some(n) = index.as_number() else {
            return Err(RunError::type_error("array index must be a number"));
        };
        let i = n as i64;
        let Some(values) = self.heap.arrays.get_mut(id) else {
            return Ok(());
        };
        if i < 0 || i >= values.len() as i64 {
            return Err(RunError::bounds_error(format!("index {} out of range", format_number(n))));
        }
        values[i as usize] = value;
        Ok(())
    }

    fn exec_load_object(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let object = self.reg(base, ins.r1);
        let key = self.reg(base, ins.r2);
        let Some(id) = object.as_object() else {
            return Err(RunError::type_error(format!(
                "field access expected an object, got {}",
                object.type_of()
            )));
        };
        let key_id = self.key_id(key)?;
        let value = self.heap.objects.get(id).and_then(|o| o.get(key_id));
        let Some(value) = value else {
            return Err(RunError::bounds_error(format!(
                "key not found: {}",
                self.interns.get(key_id)
            )));
        };
        self.set_reg(base, ins.r0, value);
        Ok(())
    }

    fn exec_store_object(&mut self, ins: Instruction) -> RunResult<()> {
        let base = self.stackbase;
        let value = self.reg(base, ins.r0);
        let object = self.reg(base, ins.r1);
        let key = self.reg(base, ins.r2);
        let Some(id) = object.as_object() else {
            return Err(RunError::type_error(format!(
                "field assignment expected an object, got {}",
                object.type_of()
            )));
        };
        let key_id = self.key_id(key)?;
        if let Some(data) = self.heap.objects.get_mut(id) {
            data.set(key_id, value);
        }
        Ok(())
    }

    /// Resolves a string value to an interned key id, interning transient
    /// text on the way.
    fn key_id(&mut self, key: Value) -> RunResult<StringId> {
        match key.as_string() {
            Some(StringRef::Interned(id)) => Ok(id),
            Some(StringRef::Transient(id)) => {
                let text: Box<str> = self.heap.strings.get(id).cloned().unwrap_or_default();
                Ok(self.interns.intern(&text))
            }
            None => Err(RunError::type_error(format!(
                "object key must be a string, got {}",
                key.type_of()
            ))),
        }
    }

    // ---- garbage collection ------------------------------------------

    /// Mark-and-sweep with the roots the heap contract requires: all
    /// globals, every live frame found by walking the header chain from
    /// the current base, and host-pinned entries.
    fn collect_garbage(&mut self, current_closure: u32) {
        for i in 0..self.globals.len() {
            let value = self.globals[i];
            self.heap.mark(value);
        }
        let mut base = self.stackbase;
        let mut closure = Value::function(current_closure);
        loop {
            let Some(id) = closure.as_function() else { break };
            self.heap.mark(closure);
            let max = self
                .heap
                .closures
                .get(id)
                .map_or(0, |c| c.fragment.max_register as usize);
            for slot in base..(base + max).min(MAX_STACK) {
                let value = self.stack[slot];
                self.heap.mark(value);
            }
            if base < STACK_FRAME_OVERHEAD {
                break;
            }
            let header = base - STACK_FRAME_OVERHEAD;
            let next_closure = self.stack[header + 1];
            let next_base = self.stack[header + 2].as_number().unwrap_or(0.0) as usize;
            if next_base >= base && base > 0 {
                break;
            }
            closure = next_closure;
            base = next_base;
        }
        self.heap.mark_pinned();
        self.heap.sweep();
    }

    // ---- value display -----------------------------------------------

    /// Resolves a string reference to its text.
    #[must_use]
    pub fn string_text(&self, r: StringRef) -> &str {
        match r {
            StringRef::Interned(id) => self.interns.get(id),
            StringRef::Transient(id) => self.heap.strings.get(id).map_or("", |s| &**s),
        }
    }

    /// Formats a value the way `print` and `tostring` show it.
    #[must_use]
    pub fn format_value(&self, value: Value) -> String {
        let mut out = String::new();
        self.format_into(&mut out, value, 0);
        out
    }

    fn format_into(&self, out: &mut String, value: Value, depth: usize) {
        if depth > 8 {
            out.push_str("...");
            return;
        }
        match value.type_of() {
            Type::Null => out.push_str("null"),
            Type::Boolean => out.push_str(if value == Value::TRUE { "true" } else { "false" }),
            Type::Number => out.push_str(&format_number(value.as_number().unwrap_or(f64::NAN))),
            Type::String => {
                if let Some(r) = value.as_string() {
                    out.push_str(self.string_text(r));
                }
            }
            Type::Array => {
                let Some(values) = value.as_array().and_then(|id| self.heap.arrays.get(id)) else {
                    out.push_str("array []");
                    return;
                };
                if values.is_empty() {
                    out.push_str("array []");
                    return;
                }
                out.push_str("array [ ");
                for (i, &element) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.format_into(out, element, depth + 1);
                }
                out.push_str(" ]");
            }
            Type::Object => {
                let Some(object) = value.as_object().and_then(|id| self.heap.objects.get(id)) else {
                    out.push_str("object {}");
                    return;
                };
                if object.is_empty() {
                    out.push_str("object {}");
                    return;
                }
                out.push_str("object { ");
                let mut first = true;
                for (key, entry) in object.iter() {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    out.push_str(self.interns.get(key));
                    out.push_str(" = ");
                    self.format_into(out, entry, depth + 1);
                }
                out.push_str(" }");
            }
            Type::Function => {
                let name = value
                    .as_function()
                    .and_then(|id| self.heap.closures.get(id))
                    .map_or("?", |c| c.fragment.name.as_str());
                out.push_str("function: ");
                out.push_str(name);
            }
            Type::CFunction => out.push_str("cfunction"),
            Type::Pointer => {
                let _ = std::fmt::Write::write_fmt(
                    out,
                    format_args!("pointer({:#x})", value.as_pointer().unwrap_or(0)),
                );
            }
            Type::Box => {
                out.push_str("box(");
                if let Some(inner) = value.as_boxed().and_then(|id| self.heap.boxes.get(id)) {
                    self.format_into(out, *inner, depth + 1);
                }
                out.push(')');
            }
        }
    }
}

impl RunError {
    /// Attaches fragment/line context unless already attributed.
    fn at(mut self, fragment: &str, line: u32) -> Self {
        if self.location.is_none() {
            self.location = Some((fragment.to_owned(), line));
        }
        self
    }
}

fn arith_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Sub => "-",
        Opcode::Mul => "*",
        Opcode::Div => "/",
        Opcode::Mod => "%",
        _ => "**",
    }
}
