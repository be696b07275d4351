// File: src/object.rs
//
// Heap object header and variant payloads. Every object the GC tracks
// starts with the same `ObjHeader` prefix (tag, mark bit, intrusive list
// link, property dict); variant structs place it as their first field so a
// `*mut ObjHeader` can be reinterpreted as the concrete type once the tag is
// checked.

use crate::chunk::Chunk;
use crate::errors::RuffError;
use crate::value::Value;
use crate::vm::Vm;
use ahash::AHashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    String,
    FunctionCode,
    Function,
    UpValue,
    Class,
    Instance,
    Method,
    NativeFunction,
    BuiltinType,
}

/// A property-map key: an interned string, compared and hashed by pointer
/// identity. Valid because interning guarantees equal bytes share a pointer.
#[derive(Clone, Copy)]
pub struct StrKey(pub *mut ObjHeader);

impl PartialEq for StrKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for StrKey {}
impl std::hash::Hash for StrKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Safety: a StrKey is only ever built from a live ObjString pointer.
        unsafe { (*self.0).as_string().hash.hash(state) }
    }
}

pub type Dict = AHashMap<StrKey, Value>;

/// The common prefix of every heap object.
#[repr(C)]
pub struct ObjHeader {
    pub tag: ObjType,
    pub marked: bool,
    pub next: *mut ObjHeader,
    pub dict: Dict,
}

impl ObjHeader {
    pub fn type_name(&self) -> &'static str {
        match self.tag {
            ObjType::String => "string",
            ObjType::FunctionCode => "function",
            ObjType::Function => "function",
            ObjType::UpValue => "upvalue",
            ObjType::Class => "class",
            ObjType::Instance => "instance",
            ObjType::Method => "method",
            ObjType::NativeFunction => "function",
            ObjType::BuiltinType => "type",
        }
    }

    /// Strings, compiled functions, and native functions carry no mutable
    /// per-object attribute surface beyond what the language exposes
    /// directly; `SetMember` on them is a runtime error.
    pub fn is_immutable(&self) -> bool {
        matches!(self.tag, ObjType::String | ObjType::FunctionCode | ObjType::NativeFunction)
    }

    /// # Safety
    /// `ptr` must point at a live `ObjHeader` whose tag is `ObjType::String`.
    pub unsafe fn as_string(&self) -> &ObjString {
        debug_assert_eq!(self.tag, ObjType::String);
        &*(self as *const ObjHeader as *const ObjString)
    }
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u64,
    pub bytes: Box<[u8]>,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf8>")
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    // FNV-1a — stable, cheap, and independent of process hasher seeding so
    // two distinct VM instances intern identical strings identically.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

#[repr(C)]
pub struct ObjFunctionCode {
    pub header: ObjHeader,
    pub name: *mut ObjHeader, // ObjString
    pub chunk: Chunk,
    pub arity: u8,
    pub upvalue_count: u8,
}

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub code: *mut ObjHeader,         // ObjFunctionCode
    pub upvalues: Vec<*mut ObjHeader>, // ObjUpValue
}

#[repr(C)]
pub struct ObjUpValue {
    pub header: ObjHeader,
    /// `0` means closed (value lives in `closed`); otherwise an index into
    /// the VM's operand stack.
    pub slot: usize,
    pub closed: Value,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: *mut ObjHeader,           // ObjString
    pub parent: Option<*mut ObjHeader>, // ObjClass
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: *mut ObjHeader, // ObjClass
}

#[repr(C)]
pub struct ObjMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub func: *mut ObjHeader, // ObjFunction
}

pub type NativeFn = fn(&mut Vm, u32, &[Value]) -> Result<Value, RuffError>;

#[repr(C)]
pub struct ObjNativeFunction {
    pub header: ObjHeader,
    pub name: *mut ObjHeader, // ObjString
    pub func: NativeFn,
}

#[repr(C)]
pub struct ObjBuiltinType {
    pub header: ObjHeader,
    pub name: *mut ObjHeader, // ObjString
}

macro_rules! downcast {
    ($fn_name:ident, $ty:ty, $tag:expr) => {
        /// # Safety
        /// `ptr` must point at a live object whose tag is `$tag`.
        pub unsafe fn $fn_name<'a>(ptr: *mut ObjHeader) -> &'a $ty {
            debug_assert_eq!((*ptr).tag, $tag);
            &*(ptr as *const $ty)
        }
    };
}

macro_rules! downcast_mut {
    ($fn_name:ident, $ty:ty, $tag:expr) => {
        /// # Safety
        /// `ptr` must point at a live object whose tag is `$tag`.
        pub unsafe fn $fn_name<'a>(ptr: *mut ObjHeader) -> &'a mut $ty {
            debug_assert_eq!((*ptr).tag, $tag);
            &mut *(ptr as *mut $ty)
        }
    };
}

downcast!(as_string, ObjString, ObjType::String);
downcast!(as_function_code, ObjFunctionCode, ObjType::FunctionCode);
downcast_mut!(as_function_code_mut, ObjFunctionCode, ObjType::FunctionCode);
downcast!(as_function, ObjFunction, ObjType::Function);
downcast_mut!(as_function_mut, ObjFunction, ObjType::Function);
downcast!(as_upvalue, ObjUpValue, ObjType::UpValue);
downcast_mut!(as_upvalue_mut, ObjUpValue, ObjType::UpValue);
downcast!(as_class, ObjClass, ObjType::Class);
downcast_mut!(as_class_mut, ObjClass, ObjType::Class);
downcast!(as_instance, ObjInstance, ObjType::Instance);
downcast!(as_method, ObjMethod, ObjType::Method);
downcast!(as_native_function, ObjNativeFunction, ObjType::NativeFunction);
downcast!(as_builtin_type, ObjBuiltinType, ObjType::BuiltinType);

/// # Safety
/// `ptr` must point at a live, correctly-tagged object.
pub unsafe fn fmt_object(ptr: *mut ObjHeader, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (*ptr).tag {
        ObjType::String => write!(f, "{}", as_string(ptr).as_str()),
        ObjType::FunctionCode => {
            let fun = as_function_code(ptr);
            write!(f, "<fn {}>", as_string(fun.name).as_str())
        }
        ObjType::Function => {
            let func = as_function(ptr);
            let code = as_function_code(func.code);
            write!(f, "<fn {}>", as_string(code.name).as_str())
        }
        ObjType::UpValue => write!(f, "<upvalue>"),
        ObjType::Class => write!(f, "<class {}>", as_string(as_class(ptr).name).as_str()),
        ObjType::Instance => {
            let inst = as_instance(ptr);
            write!(f, "<{} instance>", as_string(as_class(inst.class).name).as_str())
        }
        ObjType::Method => {
            let method = as_method(ptr);
            let code = as_function_code(as_function(method.func).code);
            write!(f, "<bound method {}>", as_string(code.name).as_str())
        }
        ObjType::NativeFunction => {
            write!(f, "<native fn {}>", as_string(as_native_function(ptr).name).as_str())
        }
        ObjType::BuiltinType => write!(f, "<type {}>", as_string(as_builtin_type(ptr).name).as_str()),
    }
}

/// # Safety
/// `ptr` must point at a live `ObjFunctionCode`.
pub unsafe fn disassemble_nested(ptr: *mut ObjHeader, out: &mut impl fmt::Write) -> fmt::Result {
    if (*ptr).tag != ObjType::FunctionCode {
        return Ok(());
    }
    let fun = as_function_code(ptr);
    let name = as_string(fun.name).as_str().to_string();
    crate::chunk::disassemble(&fun.chunk, &name, out)
}
