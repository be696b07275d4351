// File: src/vm.rs
//
// Stack-based bytecode virtual machine. Owns the operand stack, call
// frames, globals, the heap/GC, and every piece of state the compiler
// threads itself through (`current_compiler`) and the GC needs rooted
// (`gcs`, open upvalues, the compiler chain). Dispatch is a single `run`
// loop re-reading the current frame each iteration rather than caching
// frame registers — this crate favors a direct mapping to spec over a
// micro-optimized dispatch loop.

use crate::ast::Program;
use crate::chunk::{Chunk, OpCode};
use crate::compiler::{self, Compiler};
use crate::errors::{find_closest_match, ErrorKind, RuffError, SourceLocation};
use crate::gc::{HasHeader, Heap};
use crate::object::{
    self, Dict, NativeFn, ObjBuiltinType, ObjClass, ObjFunction, ObjHeader, ObjInstance, ObjMethod,
    ObjNativeFunction, ObjType, StrKey,
};
use crate::value::Value;

/// Hard cap on call depth. Not part of the language's observable semantics —
/// just a guard against a runaway recursive script taking down the host
/// process instead of reporting a runtime error.
const FRAMES_MAX: usize = 1024;

struct Frame {
    /// An ObjFunction (closure) — even the top-level script is wrapped in
    /// one with no upvalues, so every frame is handled uniformly.
    function: *mut ObjHeader,
    ip: usize,
    stack_base: usize,
    is_constructor: bool,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Dict,
    pub(crate) heap: Heap,
    init_string: *mut ObjHeader,
    open_upvalues: Vec<*mut ObjHeader>,
    pub(crate) gcs: Vec<Value>,
    pub(crate) current_compiler: Option<*mut Compiler>,
    builtin_int: *mut ObjHeader,
    builtin_float: *mut ObjHeader,
    builtin_bool: *mut ObjHeader,
    builtin_string: *mut ObjHeader,
    builtin_null: *mut ObjHeader,
    /// Byte offset of the instruction currently dispatching, in the current
    /// frame's chunk — used to resolve a span for runtime error reporting.
    cur_inst_ip: usize,
}

fn fresh_header(tag: ObjType) -> ObjHeader {
    ObjHeader { tag, marked: false, next: std::ptr::null_mut(), dict: Dict::default() }
}

fn is_numeric(v: Value) -> bool {
    v.is_int() || v.is_float()
}

fn as_f64(v: Value) -> f64 {
    if v.is_int() {
        v.as_int() as f64
    } else {
        v.as_float()
    }
}

fn is_string_obj(v: Value) -> bool {
    v.is_object() && unsafe { (*v.as_object()).tag == ObjType::String }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.copy_string(b"init");
        let builtin_int = Self::alloc_builtin_type(&mut heap, "int");
        let builtin_float = Self::alloc_builtin_type(&mut heap, "float");
        let builtin_bool = Self::alloc_builtin_type(&mut heap, "bool");
        let builtin_string = Self::alloc_builtin_type(&mut heap, "string");
        let builtin_null = Self::alloc_builtin_type(&mut heap, "null");

        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Dict::default(),
            heap,
            init_string,
            open_upvalues: Vec::new(),
            gcs: Vec::new(),
            current_compiler: None,
            builtin_int,
            builtin_float,
            builtin_bool,
            builtin_string,
            builtin_null,
            cur_inst_ip: 0,
        };
        vm.register_native("clock", native_clock);
        vm.register_native("print", native_print);
        vm.register_native("abs", native_abs);
        vm
    }

    fn alloc_builtin_type(heap: &mut Heap, name: &str) -> *mut ObjHeader {
        let name_ptr = heap.copy_string(name.as_bytes());
        let obj = ObjBuiltinType { header: fresh_header(ObjType::BuiltinType), name: name_ptr };
        heap.alloc(obj) as *mut ObjHeader
    }

    fn register_native(&mut self, name: &str, func: NativeFn) {
        let name_ptr = self.heap.copy_string(name.as_bytes());
        let obj = ObjNativeFunction { header: fresh_header(ObjType::NativeFunction), name: name_ptr, func };
        let ptr = self.heap.alloc(obj) as *mut ObjHeader;
        self.globals.insert(StrKey(name_ptr), Value::object(ptr));
    }

    // ---- GC plumbing -----------------------------------------------------

    /// Every allocation routed through the heap goes through here (or
    /// `intern`/`take_string`) so a collection always sees an accurate root
    /// set immediately beforehand.
    pub(crate) fn alloc<T: HasHeader>(&mut self, value: T) -> *mut T {
        self.maybe_collect();
        self.heap.alloc(value)
    }

    pub(crate) fn intern(&mut self, bytes: &[u8]) -> *mut ObjHeader {
        self.maybe_collect();
        self.heap.copy_string(bytes)
    }

    pub(crate) fn take_string(&mut self, bytes: Vec<u8>) -> *mut ObjHeader {
        self.maybe_collect();
        self.heap.take_string(bytes)
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.collect();
        }
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.gcs.len() {
            let v = self.gcs[i];
            self.heap.mark_value(v);
        }
        for frame in self.frames.iter() {
            self.heap.mark_object(frame.function);
        }
        for &uv in self.open_upvalues.iter() {
            self.heap.mark_object(uv);
        }
        for (k, v) in self.globals.iter() {
            self.heap.mark_object(k.0);
            self.heap.mark_value(*v);
        }
        self.heap.mark_object(self.init_string);
        self.heap.mark_object(self.builtin_int);
        self.heap.mark_object(self.builtin_float);
        self.heap.mark_object(self.builtin_bool);
        self.heap.mark_object(self.builtin_string);
        self.heap.mark_object(self.builtin_null);
        if let Some(c) = self.current_compiler {
            compiler::mark_chain(&mut self.heap, c);
        }
    }

    // ---- stack helpers -----------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn chunk_of(&self, func_ptr: *mut ObjHeader) -> &Chunk {
        unsafe {
            let function = object::as_function(func_ptr);
            &object::as_function_code(function.code).chunk
        }
    }

    fn read_u8(&mut self) -> u8 {
        let func_ptr = self.current_frame().function;
        let ip = self.current_frame().ip;
        let byte = self.chunk_of(func_ptr).code[ip];
        self.current_frame_mut().ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let func_ptr = self.current_frame().function;
        let ip = self.current_frame().ip;
        let v = self.chunk_of(func_ptr).read_u16(ip);
        self.current_frame_mut().ip = ip + 2;
        v
    }

    fn read_constant(&self, idx: u16) -> Value {
        let func_ptr = self.current_frame().function;
        self.chunk_of(func_ptr).constants[idx as usize]
    }

    fn loc(&self) -> SourceLocation {
        match self.frames.last() {
            Some(frame) => {
                let span = self.chunk_of(frame.function).span_at(self.cur_inst_ip);
                SourceLocation::new(span.line, span.column)
            }
            None => SourceLocation::unknown(),
        }
    }

    fn undefined_variable_error(&self, name: &str) -> RuffError {
        let err = RuffError::undefined_variable(name.to_string(), self.loc());
        let candidates: Vec<String> = self
            .globals
            .keys()
            .map(|k| unsafe { object::as_string(k.0).as_str().to_string() })
            .collect();
        match find_closest_match(name, &candidates) {
            Some(sugg) => err.with_suggestion(sugg.to_string()),
            None => err,
        }
    }

    fn member_not_found_error(&self, ptr: *mut ObjHeader, name: &str) -> RuffError {
        let type_name = unsafe { (*ptr).type_name() };
        let err = RuffError::new(
            ErrorKind::UndefinedVariable,
            format!("'{}' has no member '{}'", type_name, name),
            self.loc(),
        );
        let candidates: Vec<String> = unsafe {
            (*ptr).dict.keys().map(|k| object::as_string(k.0).as_str().to_string()).collect()
        };
        match find_closest_match(name, &candidates) {
            Some(sugg) => err.with_suggestion(sugg.to_string()),
            None => err,
        }
    }

    // ---- member lookup -------------------------------------------------

    fn get_member_class_chain(&self, class_ptr: *mut ObjHeader, key: StrKey) -> Option<(Value, bool)> {
        unsafe {
            let c = object::as_class(class_ptr);
            if let Some(v) = c.header.dict.get(&key) {
                return Some((*v, true));
            }
            match c.parent {
                Some(p) => self.get_member_class_chain(p, key),
                None => None,
            }
        }
    }

    fn get_member_obj(&self, ptr: *mut ObjHeader, key: StrKey) -> Option<(Value, bool)> {
        unsafe {
            if let Some(v) = (*ptr).dict.get(&key) {
                return Some((*v, false));
            }
            match (*ptr).tag {
                ObjType::Instance => {
                    let inst = object::as_instance(ptr);
                    self.get_member_class_chain(inst.class, key)
                }
                ObjType::Class => {
                    let c = object::as_class(ptr);
                    match c.parent {
                        Some(p) => self.get_member_class_chain(p, key),
                        None => None,
                    }
                }
                _ => None,
            }
        }
    }

    fn builtin_type_for(&self, v: Value) -> Option<*mut ObjHeader> {
        if v.is_int() {
            Some(self.builtin_int)
        } else if v.is_float() {
            Some(self.builtin_float)
        } else if v.is_bool() {
            Some(self.builtin_bool)
        } else if v.is_null() {
            Some(self.builtin_null)
        } else if is_string_obj(v) {
            Some(self.builtin_string)
        } else {
            None
        }
    }

    fn lookup_builtin_type(&self, bt: *mut ObjHeader, key: StrKey) -> Option<(Value, bool)> {
        unsafe { (*bt).dict.get(&key).map(|v| (*v, true)) }
    }

    /// Resolves `receiver.<name>` for both GetMember and Invoke. Strings are
    /// objects but carry no Instance/Class machinery of their own, so a
    /// dict miss on a String falls back to the `string` BuiltinType's
    /// method table rather than failing outright.
    fn get_member_value(&self, receiver: Value, name_ptr: *mut ObjHeader) -> Result<(Value, bool), RuffError> {
        let key = StrKey(name_ptr);
        let name = unsafe { object::as_string(name_ptr).as_str().to_string() };
        if receiver.is_object() {
            let ptr = receiver.as_object();
            if let Some(found) = self.get_member_obj(ptr, key) {
                return Ok(found);
            }
            if is_string_obj(receiver) {
                if let Some(found) = self.lookup_builtin_type(self.builtin_string, key) {
                    return Ok(found);
                }
            }
            return Err(self.member_not_found_error(ptr, &name));
        }
        if let Some(bt) = self.builtin_type_for(receiver) {
            if let Some(found) = self.lookup_builtin_type(bt, key) {
                return Ok(found);
            }
            return Err(self.member_not_found_error(bt, &name));
        }
        Err(RuffError::type_error(format!("'{}' has no members", receiver.type_name()), self.loc()))
    }

    // ---- upvalues --------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjHeader {
        if let Some(&uv) = self.open_upvalues.iter().find(|&&uv| unsafe { object::as_upvalue(uv).slot == slot }) {
            return uv;
        }
        let obj = object::ObjUpValue { header: fresh_header(ObjType::UpValue), slot, closed: Value::null() };
        let ptr = self.alloc(obj) as *mut ObjHeader;
        let pos = self
            .open_upvalues
            .iter()
            .position(|&uv| unsafe { object::as_upvalue(uv).slot < slot })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, ptr);
        ptr
    }

    fn close_upvalues_from(&mut self, from_slot: usize) {
        let stack_ptr = self.stack.as_ptr();
        self.open_upvalues.retain(|&uv| unsafe {
            let u = object::as_upvalue_mut(uv);
            if u.slot >= from_slot {
                u.closed = *stack_ptr.add(u.slot);
                u.slot = 0;
                false
            } else {
                true
            }
        });
    }

    fn close_single_upvalue(&mut self, slot: usize) {
        if let Some(pos) = self.open_upvalues.iter().position(|&uv| unsafe { object::as_upvalue(uv).slot == slot }) {
            let uv = self.open_upvalues.remove(pos);
            unsafe {
                let u = object::as_upvalue_mut(uv);
                u.closed = self.stack[slot];
                u.slot = 0;
            }
        }
    }

    // ---- calling convention ----------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuffError> {
        if !callee.is_object() {
            return Err(RuffError::type_error(
                format!("value of type '{}' is not callable", callee.type_name()),
                self.loc(),
            ));
        }
        let ptr = callee.as_object();
        match unsafe { (*ptr).tag } {
            ObjType::Function => self.call_function(ptr, argc),
            ObjType::NativeFunction => self.call_native(ptr, argc),
            ObjType::Class => self.call_class(ptr, argc),
            ObjType::Method => {
                let m = unsafe { object::as_method(ptr) };
                self.call_method_like(argc, m.func, m.receiver)
            }
            _ => Err(RuffError::type_error(
                format!("value of type '{}' is not callable", unsafe { (*ptr).type_name() }),
                self.loc(),
            )),
        }
    }

    fn call_function(&mut self, func_ptr: *mut ObjHeader, total_args: usize) -> Result<(), RuffError> {
        let code_ptr = unsafe { object::as_function(func_ptr).code };
        let arity = unsafe { object::as_function_code(code_ptr).arity } as usize;
        if arity != total_args {
            return Err(RuffError::arity_error(arity as u8, total_args, self.loc()));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuffError::runtime_error("stack overflow".to_string(), self.loc()));
        }
        let stack_base = self.stack.len() - total_args - 1;
        self.frames.push(Frame { function: func_ptr, ip: 0, stack_base, is_constructor: false });
        Ok(())
    }

    fn call_native(&mut self, ptr: *mut ObjHeader, argc: usize) -> Result<(), RuffError> {
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let native = unsafe { object::as_native_function(ptr).func };
        let result = native(self, argc as u32, &args)?;
        self.stack.truncate(base - 1);
        self.stack.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_ptr: *mut ObjHeader, argc: usize) -> Result<(), RuffError> {
        let instance = ObjInstance { header: fresh_header(ObjType::Instance), class: class_ptr };
        let inst_ptr = self.alloc(instance) as *mut ObjHeader;
        let inst_val = Value::object(inst_ptr);
        let callee_slot = self.stack.len() - argc - 1;
        self.stack[callee_slot] = inst_val;

        let init_key = StrKey(self.init_string);
        match self.get_member_class_chain(class_ptr, init_key) {
            Some((init_val, _)) if init_val.is_object() && unsafe { (*init_val.as_object()).tag == ObjType::Function } => {
                self.call_method_like(argc, init_val.as_object(), inst_val)?;
                self.frames.last_mut().unwrap().is_constructor = true;
                Ok(())
            }
            Some(_) => Err(RuffError::type_error("'init' is not a function".to_string(), self.loc())),
            None => {
                if argc != 0 {
                    return Err(RuffError::arity_error(0, argc, self.loc()));
                }
                Ok(())
            }
        }
    }

    /// Splices `this_val` in right before the arguments, then calls the
    /// underlying Function with `argc + 1` total arguments — "this" is
    /// simply the method's literal first declared parameter.
    fn call_method_like(&mut self, argc: usize, func_ptr: *mut ObjHeader, this_val: Value) -> Result<(), RuffError> {
        let insert_at = self.stack.len() - argc;
        self.stack.insert(insert_at, this_val);
        self.call_function(func_ptr, argc + 1)
    }

    fn bind_method(&mut self, receiver: Value, func_ptr: *mut ObjHeader) -> Value {
        self.gcs.push(receiver);
        let method = ObjMethod { header: fresh_header(ObjType::Method), receiver, func: func_ptr };
        let ptr = self.alloc(method) as *mut ObjHeader;
        self.gcs.pop();
        Value::object(ptr)
    }

    // ---- arithmetic --------------------------------------------------------

    fn add_values(&mut self, a: Value, b: Value) -> Result<Value, RuffError> {
        if a.is_int() && b.is_int() {
            return Ok(Value::int(a.as_int().wrapping_add(b.as_int())));
        }
        if is_numeric(a) && is_numeric(b) {
            return Ok(Value::float(as_f64(a) + as_f64(b)));
        }
        if is_string_obj(a) && is_string_obj(b) {
            let a_bytes = unsafe { object::as_string(a.as_object()).bytes.clone() };
            let b_bytes = unsafe { object::as_string(b.as_object()).bytes.clone() };
            self.gcs.push(a);
            self.gcs.push(b);
            let mut bytes = Vec::with_capacity(a_bytes.len() + b_bytes.len());
            bytes.extend_from_slice(&a_bytes);
            bytes.extend_from_slice(&b_bytes);
            let ptr = self.take_string(bytes);
            self.gcs.pop();
            self.gcs.pop();
            return Ok(Value::object(ptr));
        }
        Err(RuffError::type_error(
            format!("cannot add {} and {}", a.type_name(), b.type_name()),
            self.loc(),
        ))
    }

    fn arith(&self, a: Value, b: Value, op: char) -> Result<Value, RuffError> {
        if a.is_int() && b.is_int() {
            let (ai, bi) = (a.as_int(), b.as_int());
            let r = match op {
                '-' => ai.wrapping_sub(bi),
                '*' => ai.wrapping_mul(bi),
                '/' => {
                    if bi == 0 {
                        return Err(RuffError::new(
                            ErrorKind::DivisionByZero,
                            "division by zero".to_string(),
                            self.loc(),
                        ));
                    }
                    ai.wrapping_div(bi)
                }
                _ => unreachable!(),
            };
            return Ok(Value::int(r));
        }
        if is_numeric(a) && is_numeric(b) {
            let (af, bf) = (as_f64(a), as_f64(b));
            let r = match op {
                '-' => af - bf,
                '*' => af * bf,
                '/' => af / bf,
                _ => unreachable!(),
            };
            return Ok(Value::float(r));
        }
        Err(RuffError::type_error(
            format!("cannot apply operator to {} and {}", a.type_name(), b.type_name()),
            self.loc(),
        ))
    }

    fn compare(&self, a: Value, b: Value, op: char) -> Result<Value, RuffError> {
        if is_numeric(a) && is_numeric(b) {
            let (af, bf) = (as_f64(a), as_f64(b));
            let r = match op {
                '<' => af < bf,
                '>' => af > bf,
                _ => unreachable!(),
            };
            return Ok(Value::bool(r));
        }
        Err(RuffError::type_error(
            format!("cannot compare {} and {}", a.type_name(), b.type_name()),
            self.loc(),
        ))
    }

    // ---- top-level entry points --------------------------------------------

    pub fn interpret(&mut self, program: &Program) -> Result<i32, RuffError> {
        let code_ptr = compiler::compile(self, program)?;
        self.gcs.push(Value::object(code_ptr));
        let func_obj = ObjFunction { header: fresh_header(ObjType::Function), code: code_ptr, upvalues: Vec::new() };
        let func_ptr = self.alloc(func_obj) as *mut ObjHeader;
        self.gcs.pop();
        self.stack.push(Value::object(func_ptr));
        self.frames.push(Frame { function: func_ptr, ip: 0, stack_base: 0, is_constructor: false });
        self.run()
    }

    /// Names currently bound in the global scope, for REPL introspection.
    pub fn global_names(&self) -> Vec<String> {
        self.globals.keys().map(|k| unsafe { object::as_string(k.0).as_str().to_string() }).collect()
    }

    pub fn disassemble_program(&mut self, program: &Program) -> Result<String, RuffError> {
        let code_ptr = compiler::compile(self, program)?;
        let mut out = String::new();
        unsafe {
            object::disassemble_nested(code_ptr, &mut out).map_err(|_| {
                RuffError::runtime_error(
                    "failed to format bytecode dump".to_string(),
                    SourceLocation::unknown(),
                )
            })?;
        }
        Ok(out)
    }

    fn run(&mut self) -> Result<i32, RuffError> {
        loop {
            self.cur_inst_ip = self.current_frame().ip;
            let op = OpCode::from_byte(self.read_u8());
            match op {
                OpCode::Null => self.push(Value::null()),
                OpCode::True => self.push(Value::bool(true)),
                OpCode::False => self.push(Value::bool(false)),
                OpCode::Constant => {
                    let idx = self.read_u16();
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.add_values(a, b)?;
                    self.push(r);
                }
                OpCode::Sub => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.arith(a, b, '-')?;
                    self.push(r);
                }
                OpCode::Mul => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.arith(a, b, '*')?;
                    self.push(r);
                }
                OpCode::Div => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.arith(a, b, '/')?;
                    self.push(r);
                }
                OpCode::LessThan => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.compare(a, b, '<')?;
                    self.push(r);
                }
                OpCode::GreaterThan => {
                    let b = self.pop();
                    let a = self.pop();
                    let r = self.compare(a, b, '>')?;
                    self.push(r);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.raw_eq(&b)));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsy() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::GetLocal => {
                    let idx = self.read_u16() as usize;
                    let slot = self.current_frame().stack_base + idx;
                    self.push(self.stack[slot]);
                }
                OpCode::SetLocal => {
                    let idx = self.read_u16() as usize;
                    let slot = self.current_frame().stack_base + idx;
                    self.stack[slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    match self.globals.get(&StrKey(name_ptr)) {
                        Some(&v) => self.push(v),
                        None => {
                            let name = unsafe { object::as_string(name_ptr).as_str().to_string() };
                            return Err(self.undefined_variable_error(&name));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let key = StrKey(name_ptr);
                    if !self.globals.contains_key(&key) {
                        let name = unsafe { object::as_string(name_ptr).as_str().to_string() };
                        return Err(self.undefined_variable_error(&name));
                    }
                    self.globals.insert(key, self.peek(0));
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let value = self.pop();
                    self.globals.insert(StrKey(name_ptr), value);
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_u16() as usize;
                    let func_ptr = self.current_frame().function;
                    let uv_ptr = unsafe { object::as_function(func_ptr).upvalues[idx] };
                    let uv = unsafe { object::as_upvalue(uv_ptr) };
                    let v = if uv.slot != 0 { self.stack[uv.slot] } else { uv.closed };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_u16() as usize;
                    let value = self.peek(0);
                    let func_ptr = self.current_frame().function;
                    let uv_ptr = unsafe { object::as_function(func_ptr).upvalues[idx] };
                    let uv = unsafe { object::as_upvalue_mut(uv_ptr) };
                    if uv.slot != 0 {
                        let slot = uv.slot;
                        self.stack[slot] = value;
                    } else {
                        uv.closed = value;
                    }
                }
                OpCode::CloseUpvalue => {
                    let slot = self.stack.len() - 1;
                    self.close_single_upvalue(slot);
                    self.pop();
                }
                OpCode::CloseFunction => {
                    let idx = self.read_u16();
                    let code_val = self.read_constant(idx);
                    let code_ptr = code_val.as_object();
                    let num_upvalues = self.read_u8();
                    let mut upvalues = Vec::with_capacity(num_upvalues as usize);
                    for _ in 0..num_upvalues {
                        let is_local = self.read_u8() != 0;
                        let index = self.read_u16() as usize;
                        if is_local {
                            let slot = self.current_frame().stack_base + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            let func_ptr = self.current_frame().function;
                            upvalues.push(unsafe { object::as_function(func_ptr).upvalues[index] });
                        }
                    }
                    let func_obj = ObjFunction { header: fresh_header(ObjType::Function), code: code_ptr, upvalues };
                    let ptr = self.alloc(func_obj) as *mut ObjHeader;
                    self.push(Value::object(ptr));
                }
                OpCode::Call => {
                    let argc = self.read_u8() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let argc = self.read_u8() as usize;
                    let receiver = self.peek(argc);
                    let (value, is_method) = self.get_member_value(receiver, name_ptr)?;
                    if is_method && value.is_object() && unsafe { (*value.as_object()).tag == ObjType::Function } {
                        self.call_method_like(argc, value.as_object(), receiver)?;
                    } else {
                        let base = self.stack.len() - argc - 1;
                        self.stack[base] = value;
                        self.call_value(value, argc)?;
                    }
                }
                OpCode::Return => {
                    let mut ret = self.pop();
                    let frame = self.frames.pop().expect("Return with no active frame");
                    self.close_upvalues_from(frame.stack_base);
                    if frame.is_constructor {
                        ret = self.stack[frame.stack_base + 1];
                    }
                    self.stack.truncate(frame.stack_base);
                    if self.frames.is_empty() {
                        if !ret.is_int() {
                            return Err(RuffError::top_level_return_type(self.loc()));
                        }
                        return Ok(ret.as_int());
                    }
                    self.push(ret);
                }
                OpCode::Class => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let class = ObjClass { header: fresh_header(ObjType::Class), name: name_ptr, parent: None };
                    let ptr = self.alloc(class) as *mut ObjHeader;
                    self.push(Value::object(ptr));
                }
                OpCode::Inherit => {
                    let sub_val = self.peek(0);
                    let super_val = self.peek(1);
                    if !super_val.is_object() || unsafe { (*super_val.as_object()).tag != ObjType::Class } {
                        return Err(RuffError::type_error("superclass must be a class".to_string(), self.loc()));
                    }
                    unsafe {
                        object::as_class_mut(sub_val.as_object()).parent = Some(super_val.as_object());
                    }
                }
                OpCode::AttachMethod => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let func_val = self.pop();
                    let class_val = self.peek(0);
                    unsafe {
                        (*class_val.as_object()).dict.insert(StrKey(name_ptr), func_val);
                    }
                }
                OpCode::GetMember => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let receiver = self.pop();
                    let (value, is_method) = self.get_member_value(receiver, name_ptr)?;
                    if is_method && value.is_object() && unsafe { (*value.as_object()).tag == ObjType::Function } {
                        let bound = self.bind_method(receiver, value.as_object());
                        self.push(bound);
                    } else {
                        self.push(value);
                    }
                }
                OpCode::SetMember => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let value = self.pop();
                    let receiver = self.pop();
                    if !receiver.is_object() {
                        return Err(RuffError::type_error(
                            format!("cannot set a member on a {}", receiver.type_name()),
                            self.loc(),
                        ));
                    }
                    let ptr = receiver.as_object();
                    if unsafe { (*ptr).is_immutable() } {
                        return Err(RuffError::type_error(
                            format!("'{}' values are immutable", unsafe { (*ptr).type_name() }),
                            self.loc(),
                        ));
                    }
                    unsafe {
                        (*ptr).dict.insert(StrKey(name_ptr), value);
                    }
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let idx = self.read_u16();
                    let name_ptr = self.read_constant(idx).as_object();
                    let superclass_val = self.pop();
                    let this_val = self.pop();
                    if !superclass_val.is_object() || unsafe { (*superclass_val.as_object()).tag != ObjType::Class } {
                        return Err(RuffError::type_error("'super' is not a class".to_string(), self.loc()));
                    }
                    let key = StrKey(name_ptr);
                    match self.get_member_class_chain(superclass_val.as_object(), key) {
                        Some((value, _)) if value.is_object() && unsafe { (*value.as_object()).tag == ObjType::Function } => {
                            let bound = self.bind_method(this_val, value.as_object());
                            self.push(bound);
                        }
                        Some((value, _)) => self.push(value),
                        None => {
                            let name = unsafe { object::as_string(name_ptr).as_str().to_string() };
                            return Err(self.member_not_found_error(superclass_val.as_object(), &name));
                        }
                    }
                }
                OpCode::Halt => {
                    if let Some(frame) = self.frames.pop() {
                        self.stack.truncate(frame.stack_base);
                    }
                    return Ok(0);
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// ---- native functions -----------------------------------------------------

fn native_clock(_vm: &mut Vm, argc: u32, _args: &[Value]) -> Result<Value, RuffError> {
    if argc != 0 {
        return Err(RuffError::arity_error(0, argc as usize, SourceLocation::unknown()));
    }
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::float(secs))
}

fn native_print(_vm: &mut Vm, _argc: u32, args: &[Value]) -> Result<Value, RuffError> {
    let parts: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    println!("{}", parts.join(" "));
    Ok(Value::null())
}

fn native_abs(_vm: &mut Vm, argc: u32, args: &[Value]) -> Result<Value, RuffError> {
    if argc != 1 {
        return Err(RuffError::arity_error(1, argc as usize, SourceLocation::unknown()));
    }
    let v = args[0];
    if !v.is_int() {
        return Err(RuffError::type_error(
            format!("abs expects an int, got {}", v.type_name()),
            SourceLocation::unknown(),
        ));
    }
    Ok(Value::int(v.as_int().wrapping_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn run(src: &str) -> i32 {
        let program = Parser::new(tokenize(src)).parse();
        let mut vm = Vm::new();
        vm.interpret(&program).expect("interpret should succeed")
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("return 1 + 2 * 3;"), 7);
    }

    #[test]
    fn int_division_truncates_toward_zero() {
        assert_eq!(run("return 7 / 2;"), 3);
        assert_eq!(run("return -7 / 2;"), -3);
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let program = Parser::new(tokenize("return 1 / 0;")).parse();
        let mut vm = Vm::new();
        let err = vm.interpret(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
    }

    #[test]
    fn closures_share_captured_state() {
        let src = "
            def counter() {
                let n = 0;
                def inc() { n = n + 1; return n; }
                return inc;
            }
            let c = counter();
            c(); c();
            return c();
        ";
        assert_eq!(run(src), 3);
    }

    #[test]
    fn while_loop_accumulates() {
        let src = "
            let i = 0; let sum = 0;
            while (i < 5) { sum = sum + i; i = i + 1; }
            return sum;
        ";
        assert_eq!(run(src), 10);
    }

    #[test]
    fn undefined_global_reports_name_error() {
        let program = Parser::new(tokenize("return missing;")).parse();
        let mut vm = Vm::new();
        let err = vm.interpret(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedVariable);
    }
}
