// File: src/compiler.rs
//
// Single-pass AST-to-bytecode compiler. Each function body gets its own
// `Compiler`, linked to the one enclosing it via `enclosing`; the active
// compiler is threaded through `Vm.current_compiler` (a raw pointer into
// whichever Rust stack frame is currently compiling) rather than passed
// explicitly to every helper, mirroring how the compiled-function chain is
// a GC root: the collector walks exactly this same `enclosing` chain to
// mark every in-progress FunctionCode.

use crate::ast::*;
use crate::chunk::{Chunk, OpCode, Span};
use crate::errors::{RuffError, SourceLocation};
use crate::object::{self, ObjFunctionCode, ObjHeader, ObjType};
use crate::value::Value;
use crate::vm::Vm;

struct LocalVar {
    name: String,
    depth: i32,
    captured: bool,
}

struct UpVar {
    index: u16,
    is_local: bool,
}

/// One nested function body's compile-time state. Allocated on the Rust
/// stack of `compile_function_body`; `enclosing` points at the Compiler one
/// level out (or is `None` for the top-level script).
pub(crate) struct Compiler {
    enclosing: Option<*mut Compiler>,
    function: *mut ObjHeader, // ObjFunctionCode, mutated in place as we compile
    locals: Vec<LocalVar>,
    upvalues: Vec<UpVar>,
    scope_depth: i32,
}

/// Walks the chain of in-progress compilers rooted at `c`, marking each
/// partially-built `ObjFunctionCode` so a collection triggered mid-compile
/// (by `emit_constant_value`, `identifier_constant`, ...) can't reclaim it.
pub(crate) fn mark_chain(heap: &mut crate::gc::Heap, mut c: *mut Compiler) {
    while !c.is_null() {
        unsafe {
            heap.mark_object((*c).function);
            c = (*c).enclosing.unwrap_or(std::ptr::null_mut());
        }
    }
}

enum LocalLookup {
    NotFound,
    Found(u16),
    Uninitialized,
}

enum VarResolution {
    Local(u16),
    Upvalue(u16),
    Global,
}

fn loc(span: Span) -> SourceLocation {
    SourceLocation::new(span.line, span.column)
}

fn current(vm: &Vm) -> *mut Compiler {
    vm.current_compiler.expect("compiler function invoked with no active compiler") as *mut Compiler
}

/// Safe only because the pointee lives on some ancestor Rust stack frame for
/// at least as long as `vm.current_compiler` names it.
fn chunk_mut(vm: &Vm) -> &mut Chunk {
    unsafe {
        let c = current(vm);
        &mut object::as_function_code_mut((*c).function).chunk
    }
}

fn emit_u16_op(vm: &mut Vm, op: OpCode, value: u16, span: Span) {
    chunk_mut(vm).emit_op(op, span);
    chunk_mut(vm).emit_u16(value, span);
}

/// Emit a literal, protecting it on the GC-protection stack while the pool
/// entry is created — adding to the constant pool can itself allocate and
/// trigger a collection, so the value must already be a reachable root.
fn emit_constant_value(vm: &mut Vm, value: Value, span: Span) {
    if value.is_object() {
        vm.gcs.push(value);
    }
    chunk_mut(vm).emit_constant(value, span);
    if value.is_object() {
        vm.gcs.pop();
    }
}

fn identifier_constant(vm: &mut Vm, name: &str) -> u16 {
    let ptr = vm.intern(name.as_bytes());
    let value = Value::object(ptr);
    vm.gcs.push(value);
    let idx = chunk_mut(vm).add_constant(value);
    vm.gcs.pop();
    idx
}

fn resolve_local(compiler: *mut Compiler, name: &str) -> LocalLookup {
    unsafe {
        let c = &*compiler;
        for (i, local) in c.locals.iter().enumerate().rev() {
            if local.name == name {
                return if local.depth < 0 { LocalLookup::Uninitialized } else { LocalLookup::Found(i as u16) };
            }
        }
        LocalLookup::NotFound
    }
}

fn add_upvalue(compiler: *mut Compiler, index: u16, is_local: bool) -> u16 {
    unsafe {
        let c = &mut *compiler;
        for (i, uv) in c.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u16;
            }
        }
        c.upvalues.push(UpVar { index, is_local });
        (c.upvalues.len() - 1) as u16
    }
}

/// Recurses outward through `enclosing` links, capturing the variable at
/// every intermediate level as it goes.
fn resolve_upvalue(compiler: *mut Compiler, name: &str, span: Span) -> Result<Option<u16>, RuffError> {
    unsafe {
        let enclosing = match (*compiler).enclosing {
            Some(e) => e,
            None => return Ok(None),
        };
        match resolve_local(enclosing, name) {
            LocalLookup::Found(idx) => {
                (*enclosing).locals[idx as usize].captured = true;
                return Ok(Some(add_upvalue(compiler, idx, true)));
            }
            LocalLookup::Uninitialized => {
                return Err(RuffError::compile_error(
                    format!("cannot read local variable '{}' in its own initializer", name),
                    loc(span),
                ));
            }
            LocalLookup::NotFound => {}
        }
        if let Some(up_idx) = resolve_upvalue(enclosing, name, span)? {
            return Ok(Some(add_upvalue(compiler, up_idx, false)));
        }
        Ok(None)
    }
}

fn resolve_variable(compiler: *mut Compiler, name: &str, span: Span) -> Result<VarResolution, RuffError> {
    match resolve_local(compiler, name) {
        LocalLookup::Found(idx) => return Ok(VarResolution::Local(idx)),
        LocalLookup::Uninitialized => {
            return Err(RuffError::compile_error(
                format!("cannot read local variable '{}' in its own initializer", name),
                loc(span),
            ));
        }
        LocalLookup::NotFound => {}
    }
    if let Some(idx) = resolve_upvalue(compiler, name, span)? {
        return Ok(VarResolution::Upvalue(idx));
    }
    Ok(VarResolution::Global)
}

fn declare_local(vm: &mut Vm, name: &str, span: Span) -> Result<(), RuffError> {
    unsafe {
        let c = &mut *current(vm);
        if c.locals.len() >= 0x1_0000 {
            return Err(RuffError::compile_error("too many local variables in one function".into(), loc(span)));
        }
        c.locals.push(LocalVar { name: name.to_string(), depth: -1, captured: false });
    }
    Ok(())
}

fn mark_initialized(vm: &mut Vm) {
    unsafe {
        let c = &mut *current(vm);
        let depth = c.scope_depth;
        if let Some(last) = c.locals.last_mut() {
            last.depth = depth;
        }
    }
}

fn begin_scope(vm: &mut Vm) {
    unsafe {
        (*current(vm)).scope_depth += 1;
    }
}

fn end_scope(vm: &mut Vm, span: Span) {
    unsafe {
        let c = current(vm);
        (*c).scope_depth -= 1;
        let depth = (*c).scope_depth;
        loop {
            let should_pop = matches!((*c).locals.last(), Some(l) if l.depth > depth);
            if !should_pop {
                break;
            }
            let captured = (*c).locals.pop().unwrap().captured;
            if captured {
                chunk_mut(vm).emit_op(OpCode::CloseUpvalue, span);
            } else {
                chunk_mut(vm).emit_op(OpCode::Pop, span);
            }
        }
    }
}

fn in_local_scope(vm: &Vm) -> bool {
    unsafe { (*current(vm)).scope_depth > 0 }
}

fn compile_variable(vm: &mut Vm, name: &str, span: Span) -> Result<(), RuffError> {
    match resolve_variable(current(vm), name, span)? {
        VarResolution::Local(idx) => emit_u16_op(vm, OpCode::GetLocal, idx, span),
        VarResolution::Upvalue(idx) => emit_u16_op(vm, OpCode::GetUpvalue, idx, span),
        VarResolution::Global => {
            let idx = identifier_constant(vm, name);
            emit_u16_op(vm, OpCode::GetGlobal, idx, span);
        }
    }
    Ok(())
}

fn compile_assign_variable(vm: &mut Vm, name: &str, span: Span) -> Result<(), RuffError> {
    match resolve_variable(current(vm), name, span)? {
        VarResolution::Local(idx) => emit_u16_op(vm, OpCode::SetLocal, idx, span),
        VarResolution::Upvalue(idx) => emit_u16_op(vm, OpCode::SetUpvalue, idx, span),
        VarResolution::Global => {
            let idx = identifier_constant(vm, name);
            emit_u16_op(vm, OpCode::SetGlobal, idx, span);
        }
    }
    Ok(())
}

fn compile_int_literal(vm: &mut Vm, text: &str, base: IntBase, span: Span) -> Result<(), RuffError> {
    let radix = match base {
        IntBase::Decimal => 10,
        IntBase::Hex => 16,
        IntBase::Binary => 2,
    };
    let n = i64::from_str_radix(text, radix)
        .map_err(|_| RuffError::compile_error(format!("invalid integer literal '{}'", text), loc(span)))?
        as i32;
    emit_constant_value(vm, Value::int(n), span);
    Ok(())
}

fn compile_float_literal(vm: &mut Vm, text: &str, span: Span) -> Result<(), RuffError> {
    let n: f64 = text
        .parse()
        .map_err(|_| RuffError::compile_error(format!("invalid float literal '{}'", text), loc(span)))?;
    emit_constant_value(vm, Value::float(n), span);
    Ok(())
}

fn compile_string_literal(vm: &mut Vm, bytes: &[u8], span: Span) -> Result<(), RuffError> {
    let ptr = vm.intern(bytes);
    emit_constant_value(vm, Value::object(ptr), span);
    Ok(())
}

fn compile_super_get(vm: &mut Vm, name: &str, span: Span) -> Result<(), RuffError> {
    compile_variable(vm, "this", span)?;
    compile_variable(vm, "super", span)?;
    let idx = identifier_constant(vm, name);
    chunk_mut(vm).emit_op(OpCode::GetSuper, span);
    chunk_mut(vm).emit_u16(idx, span);
    Ok(())
}

fn compile_call(vm: &mut Vm, callee: &Expr, args: &[Expr], span: Span) -> Result<(), RuffError> {
    if args.len() > 255 {
        return Err(RuffError::compile_error("too many arguments in call".into(), loc(span)));
    }
    if let Expr::Member { receiver, name, .. } = callee {
        compile_expr(vm, receiver)?;
        for a in args {
            compile_expr(vm, a)?;
        }
        let idx = identifier_constant(vm, name);
        chunk_mut(vm).emit_op(OpCode::Invoke, span);
        chunk_mut(vm).emit_u16(idx, span);
        chunk_mut(vm).emit_u8(args.len() as u8, span);
    } else {
        compile_expr(vm, callee)?;
        for a in args {
            compile_expr(vm, a)?;
        }
        chunk_mut(vm).emit_op(OpCode::Call, span);
        chunk_mut(vm).emit_u8(args.len() as u8, span);
    }
    Ok(())
}

fn compile_assignment(vm: &mut Vm, target: &Expr, value: &Expr, span: Span) -> Result<(), RuffError> {
    match target {
        Expr::Identifier { name, .. } => {
            compile_expr(vm, value)?;
            compile_assign_variable(vm, name, span)
        }
        Expr::Member { receiver, name, .. } => {
            compile_expr(vm, value)?;
            compile_expr(vm, receiver)?;
            let idx = identifier_constant(vm, name);
            chunk_mut(vm).emit_op(OpCode::SetMember, span);
            chunk_mut(vm).emit_u16(idx, span);
            Ok(())
        }
        _ => Err(RuffError::compile_error("invalid assignment target".into(), loc(span))),
    }
}

fn compile_binary(vm: &mut Vm, op: BinOp, left: &Expr, right: &Expr, span: Span) -> Result<(), RuffError> {
    match op {
        BinOp::Assignment => compile_assignment(vm, left, right, span),
        BinOp::And => {
            compile_expr(vm, left)?;
            chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
            let end_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
            chunk_mut(vm).emit_op(OpCode::Pop, span);
            compile_expr(vm, right)?;
            chunk_mut(vm).patch_jump_here(end_jump);
            Ok(())
        }
        BinOp::Or => {
            compile_expr(vm, left)?;
            chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
            let else_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
            chunk_mut(vm).emit_op(OpCode::Jump, span);
            let end_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
            chunk_mut(vm).patch_jump_here(else_jump);
            chunk_mut(vm).emit_op(OpCode::Pop, span);
            compile_expr(vm, right)?;
            chunk_mut(vm).patch_jump_here(end_jump);
            Ok(())
        }
        _ => {
            compile_expr(vm, left)?;
            compile_expr(vm, right)?;
            let code = match op {
                BinOp::Plus => OpCode::Add,
                BinOp::Minus => OpCode::Sub,
                BinOp::Multiply => OpCode::Mul,
                BinOp::Divide => OpCode::Div,
                BinOp::Equals => OpCode::Equal,
                BinOp::LessThan => OpCode::LessThan,
                BinOp::GreaterThan => OpCode::GreaterThan,
                BinOp::Assignment | BinOp::And | BinOp::Or => unreachable!(),
            };
            chunk_mut(vm).emit_op(code, span);
            Ok(())
        }
    }
}

/// Neither `Negate` nor `Not` has a dedicated opcode; both translate into
/// existing arithmetic/jump opcodes rather than growing the opcode set.
fn compile_unary(vm: &mut Vm, op: UnOp, operand: &Expr, span: Span) -> Result<(), RuffError> {
    match op {
        UnOp::Negate => {
            emit_constant_value(vm, Value::int(0), span);
            compile_expr(vm, operand)?;
            chunk_mut(vm).emit_op(OpCode::Sub, span);
        }
        UnOp::Not => {
            compile_expr(vm, operand)?;
            chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
            let falsy_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
            chunk_mut(vm).emit_op(OpCode::Pop, span);
            chunk_mut(vm).emit_op(OpCode::False, span);
            chunk_mut(vm).emit_op(OpCode::Jump, span);
            let end_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
            chunk_mut(vm).patch_jump_here(falsy_jump);
            chunk_mut(vm).emit_op(OpCode::Pop, span);
            chunk_mut(vm).emit_op(OpCode::True, span);
            chunk_mut(vm).patch_jump_here(end_jump);
        }
    }
    Ok(())
}

fn compile_expr(vm: &mut Vm, expr: &Expr) -> Result<(), RuffError> {
    match expr {
        Expr::Int { text, base, span } => compile_int_literal(vm, text, *base, *span),
        Expr::Float { text, span } => compile_float_literal(vm, text, *span),
        Expr::Str { bytes, span } => compile_string_literal(vm, bytes, *span),
        Expr::Bool { value, span } => {
            chunk_mut(vm).emit_op(if *value { OpCode::True } else { OpCode::False }, *span);
            Ok(())
        }
        Expr::Null { span } => {
            chunk_mut(vm).emit_op(OpCode::Null, *span);
            Ok(())
        }
        Expr::Identifier { name, span } => compile_variable(vm, name, *span),
        Expr::Super { name, span } => compile_super_get(vm, name, *span),
        Expr::Member { receiver, name, span } => {
            compile_expr(vm, receiver)?;
            let idx = identifier_constant(vm, name);
            chunk_mut(vm).emit_op(OpCode::GetMember, *span);
            chunk_mut(vm).emit_u16(idx, *span);
            Ok(())
        }
        Expr::Call { callee, args, span } => compile_call(vm, callee, args, *span),
        Expr::Binary { op, left, right, span } => compile_binary(vm, *op, left, right, *span),
        Expr::Unary { op, operand, span } => compile_unary(vm, *op, operand, *span),
        Expr::Function(lit) => compile_function_literal(vm, lit),
    }
}

fn compile_var_decl(vm: &mut Vm, name: &str, init: &Option<Expr>, span: Span) -> Result<(), RuffError> {
    let is_local = in_local_scope(vm);
    if is_local {
        declare_local(vm, name, span)?;
    }
    match init {
        Some(e) => compile_expr(vm, e)?,
        None => {
            chunk_mut(vm).emit_op(OpCode::Null, span);
        }
    }
    if is_local {
        mark_initialized(vm);
    } else {
        let idx = identifier_constant(vm, name);
        emit_u16_op(vm, OpCode::DefineGlobal, idx, span);
    }
    Ok(())
}

/// Allocates the nested `ObjFunctionCode`, compiles its body in a fresh
/// `Compiler`, and returns the object pointer plus the upvalue descriptors
/// the parent needs to emit alongside `CloseFunction`.
fn compile_function_body(vm: &mut Vm, lit: &FunctionLit) -> Result<(*mut ObjHeader, Vec<UpVar>), RuffError> {
    if lit.params.len() > 255 {
        return Err(RuffError::compile_error("too many parameters".into(), loc(lit.span)));
    }
    let display_name = lit.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
    let name_ptr = vm.intern(display_name.as_bytes());
    let func_obj = {
        let obj = ObjFunctionCode {
            header: ObjHeader {
                tag: ObjType::FunctionCode,
                marked: false,
                next: std::ptr::null_mut(),
                dict: Default::default(),
            },
            name: name_ptr,
            chunk: Chunk::new(),
            arity: lit.params.len() as u8,
            upvalue_count: 0,
        };
        vm.heap.alloc(obj) as *mut ObjHeader
    };

    let mut compiler = Compiler {
        enclosing: vm.current_compiler,
        function: func_obj,
        locals: vec![LocalVar { name: String::new(), depth: 0, captured: false }],
        upvalues: Vec::new(),
        scope_depth: 0,
    };
    vm.current_compiler = Some(&mut compiler as *mut Compiler);

    let body_result: Result<(), RuffError> = (|| {
        for param in &lit.params {
            declare_local(vm, param, lit.span)?;
            mark_initialized(vm);
        }
        begin_scope(vm);
        for stmt in &lit.body {
            compile_stmt(vm, stmt)?;
        }
        end_scope(vm, lit.span);
        chunk_mut(vm).emit_op(OpCode::Null, lit.span);
        chunk_mut(vm).emit_op(OpCode::Return, lit.span);
        Ok(())
    })();

    vm.current_compiler = compiler.enclosing;
    body_result?;

    unsafe {
        object::as_function_code_mut(func_obj).upvalue_count = compiler.upvalues.len() as u8;
    }
    Ok((func_obj, compiler.upvalues))
}

/// Decorators are pushed top-to-bottom *before* the function is compiled;
/// because each `Call 1` always consumes the top two stack slots as
/// `(callee, arg)`, repeating it once per decorator naturally applies them
/// innermost-first without any explicit reordering of the emitted bytecode.
fn compile_function_literal(vm: &mut Vm, lit: &FunctionLit) -> Result<(), RuffError> {
    for deco in &lit.decorators {
        compile_expr(vm, deco)?;
    }
    let (func_obj, upvalues) = compile_function_body(vm, lit)?;
    let value = Value::object(func_obj);
    vm.gcs.push(value);
    let idx = chunk_mut(vm).add_constant(value);
    chunk_mut(vm).emit_op(OpCode::CloseFunction, lit.span);
    chunk_mut(vm).emit_u16(idx, lit.span);
    chunk_mut(vm).emit_u8(upvalues.len() as u8, lit.span);
    for uv in &upvalues {
        chunk_mut(vm).emit_u8(if uv.is_local { 1 } else { 0 }, lit.span);
        chunk_mut(vm).emit_u16(uv.index, lit.span);
    }
    vm.gcs.pop();

    for _ in 0..lit.decorators.len() {
        chunk_mut(vm).emit_op(OpCode::Call, lit.span);
        chunk_mut(vm).emit_u8(1, lit.span);
    }
    Ok(())
}

fn compile_function_decl(vm: &mut Vm, lit: &FunctionLit) -> Result<(), RuffError> {
    let name = lit.name.clone().unwrap_or_default();
    let is_local = in_local_scope(vm);
    if is_local {
        declare_local(vm, &name, lit.span)?;
        mark_initialized(vm);
    }
    compile_function_literal(vm, lit)?;
    if !is_local {
        let idx = identifier_constant(vm, &name);
        emit_u16_op(vm, OpCode::DefineGlobal, idx, lit.span);
    }
    Ok(())
}

fn compile_class_decl(vm: &mut Vm, class: &ClassDecl) -> Result<(), RuffError> {
    let span = class.span;
    let is_local = in_local_scope(vm);
    if is_local {
        declare_local(vm, &class.name, span)?;
    }
    let name_idx = identifier_constant(vm, &class.name);
    chunk_mut(vm).emit_op(OpCode::Class, span);
    chunk_mut(vm).emit_u16(name_idx, span);
    if is_local {
        mark_initialized(vm);
    } else {
        emit_u16_op(vm, OpCode::DefineGlobal, name_idx, span);
    }

    let mut opened_super_scope = false;
    if let Some(super_name) = &class.superclass {
        if super_name == &class.name {
            return Err(RuffError::compile_error(
                format!("class '{}' cannot inherit from itself", class.name),
                loc(span),
            ));
        }
        compile_variable(vm, super_name, span)?;
        begin_scope(vm);
        declare_local(vm, "super", span)?;
        mark_initialized(vm);
        opened_super_scope = true;
        compile_variable(vm, &class.name, span)?;
        chunk_mut(vm).emit_op(OpCode::Inherit, span);
    } else {
        compile_variable(vm, &class.name, span)?;
    }

    for method in &class.methods {
        compile_function_literal(vm, method)?;
        let method_name = method.name.as_deref().unwrap_or("");
        let method_idx = identifier_constant(vm, method_name);
        chunk_mut(vm).emit_op(OpCode::AttachMethod, span);
        chunk_mut(vm).emit_u16(method_idx, span);
    }

    chunk_mut(vm).emit_op(OpCode::Pop, span);
    if opened_super_scope {
        end_scope(vm, span);
    }
    Ok(())
}

fn compile_if(
    vm: &mut Vm,
    cond: &Expr,
    then_branch: &[Stmt],
    else_branch: &Option<Vec<Stmt>>,
    span: Span,
) -> Result<(), RuffError> {
    compile_expr(vm, cond)?;
    chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
    let then_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
    chunk_mut(vm).emit_op(OpCode::Pop, span);
    begin_scope(vm);
    for s in then_branch {
        compile_stmt(vm, s)?;
    }
    end_scope(vm, span);
    chunk_mut(vm).emit_op(OpCode::Jump, span);
    let else_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
    chunk_mut(vm).patch_jump_here(then_jump);
    chunk_mut(vm).emit_op(OpCode::Pop, span);
    if let Some(else_stmts) = else_branch {
        begin_scope(vm);
        for s in else_stmts {
            compile_stmt(vm, s)?;
        }
        end_scope(vm, span);
    }
    chunk_mut(vm).patch_jump_here(else_jump);
    Ok(())
}

fn compile_while(vm: &mut Vm, cond: &Expr, body: &[Stmt], span: Span) -> Result<(), RuffError> {
    let loop_start = chunk_mut(vm).current_offset();
    compile_expr(vm, cond)?;
    chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
    let exit_jump = chunk_mut(vm).emit_u16(0xFFFF, span);
    chunk_mut(vm).emit_op(OpCode::Pop, span);
    begin_scope(vm);
    for s in body {
        compile_stmt(vm, s)?;
    }
    end_scope(vm, span);
    chunk_mut(vm).emit_loop(loop_start, span);
    chunk_mut(vm).patch_jump_here(exit_jump);
    chunk_mut(vm).emit_op(OpCode::Pop, span);
    Ok(())
}

fn compile_for(vm: &mut Vm, header: &ForHeader, body: &[Stmt], span: Span) -> Result<(), RuffError> {
    begin_scope(vm);
    if let Some(init) = &header.init {
        compile_stmt(vm, init)?;
    }
    let loop_start = chunk_mut(vm).current_offset();
    let exit_jump = if let Some(cond) = &header.cond {
        compile_expr(vm, cond)?;
        chunk_mut(vm).emit_op(OpCode::JumpIfFalse, span);
        let off = chunk_mut(vm).emit_u16(0xFFFF, span);
        chunk_mut(vm).emit_op(OpCode::Pop, span);
        Some(off)
    } else {
        None
    };
    begin_scope(vm);
    for s in body {
        compile_stmt(vm, s)?;
    }
    end_scope(vm, span);
    if let Some(step) = &header.step {
        compile_expr(vm, step)?;
        chunk_mut(vm).emit_op(OpCode::Pop, span);
    }
    chunk_mut(vm).emit_loop(loop_start, span);
    if let Some(off) = exit_jump {
        chunk_mut(vm).patch_jump_here(off);
        chunk_mut(vm).emit_op(OpCode::Pop, span);
    }
    end_scope(vm, span);
    Ok(())
}

fn compile_stmt(vm: &mut Vm, stmt: &Stmt) -> Result<(), RuffError> {
    match stmt {
        Stmt::Expr(e) => {
            let span = e.span();
            compile_expr(vm, e)?;
            chunk_mut(vm).emit_op(OpCode::Pop, span);
            Ok(())
        }
        Stmt::VarDecl { name, init, span } => compile_var_decl(vm, name, init, *span),
        Stmt::FunctionDecl(lit) => compile_function_decl(vm, lit),
        Stmt::ClassDecl(c) => compile_class_decl(vm, c),
        Stmt::Block(stmts) => {
            let span = stmts.first().map(Stmt::span).unwrap_or_else(Span::unknown);
            begin_scope(vm);
            for s in stmts {
                compile_stmt(vm, s)?;
            }
            end_scope(vm, span);
            Ok(())
        }
        Stmt::If { cond, then_branch, else_branch, span } => {
            compile_if(vm, cond, then_branch, else_branch, *span)
        }
        Stmt::While { cond, body, span } => compile_while(vm, cond, body, *span),
        Stmt::For { header, body, span } => compile_for(vm, header, body, *span),
        Stmt::Return { value, span, .. } => {
            match value {
                Some(e) => compile_expr(vm, e)?,
                None => {
                    chunk_mut(vm).emit_op(OpCode::Null, *span);
                }
            }
            chunk_mut(vm).emit_op(OpCode::Return, *span);
            Ok(())
        }
    }
}

/// Compiles a full program into a top-level `ObjFunctionCode`. The
/// top-level's implicit fall-through is `Halt` (exit code 0), distinct from
/// the `Constant Null; Return` safety net nested functions get — an
/// explicit top-level `return <expr>` still compiles to `Return` and is
/// subject to the VM's int-only top-level-return check.
pub fn compile(vm: &mut Vm, program: &Program) -> Result<*mut ObjHeader, RuffError> {
    let name_ptr = vm.intern(b"<script>");
    let func_obj = {
        let obj = ObjFunctionCode {
            header: ObjHeader {
                tag: ObjType::FunctionCode,
                marked: false,
                next: std::ptr::null_mut(),
                dict: Default::default(),
            },
            name: name_ptr,
            chunk: Chunk::new(),
            arity: 0,
            upvalue_count: 0,
        };
        vm.heap.alloc(obj) as *mut ObjHeader
    };

    let mut compiler = Compiler {
        enclosing: vm.current_compiler,
        function: func_obj,
        locals: vec![LocalVar { name: String::new(), depth: 0, captured: false }],
        upvalues: Vec::new(),
        scope_depth: 0,
    };
    vm.current_compiler = Some(&mut compiler as *mut Compiler);

    let result: Result<(), RuffError> = (|| {
        for stmt in &program.statements {
            compile_stmt(vm, stmt)?;
        }
        Ok(())
    })();

    chunk_mut(vm).emit_op(OpCode::Halt, Span::unknown());
    vm.current_compiler = compiler.enclosing;
    result?;
    Ok(func_obj)
}
