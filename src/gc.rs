// File: src/gc.rs
//
// Size-tracking allocator and mark-sweep collector for every heap object the
// language allocates. The VM owns one `Heap` and feeds it its own root set
// (operand stack, frames, globals, ...) on each collection; this module only
// implements the mechanical parts: linking new objects in, tracing the
// reachability graph from a gray worklist, and sweeping the unreached.
//
// Routing every *language* heap allocation through `Heap::alloc`/`intern`
// (rather than installing a `#[global_allocator]`) avoids the alternative:
// a true global hook would also intercept allocations made by
// `clap`/`rustyline`/`colored` that have no GC root information to mark,
// making correct collection impossible.

use crate::object::{
    hash_bytes, ObjBuiltinType, ObjClass, ObjFunction, ObjFunctionCode, ObjHeader, ObjInstance,
    ObjMethod, ObjNativeFunction, ObjString, ObjType, ObjUpValue,
};
use crate::value::Value;
use ahash::AHashMap;
use std::mem::size_of;

/// Collections run once `bytes_allocated` crosses this multiple of the size
/// observed after the previous collection.
const GC_HEAP_GROW_FACTOR: usize = 2;
/// Never schedule the first collection before the heap holds at least this
/// much, so short-lived scripts don't pay for a collection at all.
const MIN_NEXT_GC: usize = 1 << 20;

/// Implemented by every heap object payload so the allocator can link it
/// into the intrusive object list uniformly.
pub trait HasHeader {
    fn header_mut(&mut self) -> &mut ObjHeader;
}

macro_rules! impl_has_header {
    ($ty:ty) => {
        impl HasHeader for $ty {
            fn header_mut(&mut self) -> &mut ObjHeader {
                &mut self.header
            }
        }
    };
}

impl_has_header!(ObjString);
impl_has_header!(ObjFunctionCode);
impl_has_header!(ObjFunction);
impl_has_header!(ObjUpValue);
impl_has_header!(ObjClass);
impl_has_header!(ObjInstance);
impl_has_header!(ObjMethod);
impl_has_header!(ObjNativeFunction);
impl_has_header!(ObjBuiltinType);

pub struct Heap {
    objects: *mut ObjHeader,
    strings: AHashMap<Box<[u8]>, *mut ObjHeader>,
    bytes_allocated: usize,
    next_gc: usize,
    paused: bool,
    stress: bool,
    gray: Vec<*mut ObjHeader>,
}

impl Heap {
    pub fn new() -> Self {
        let stress = std::env::var("RUFF_GC_STRESS").is_ok();
        Heap {
            objects: std::ptr::null_mut(),
            strings: AHashMap::default(),
            bytes_allocated: 0,
            next_gc: MIN_NEXT_GC,
            paused: false,
            stress,
            gray: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        !self.paused && (self.stress || self.bytes_allocated > self.next_gc)
    }

    /// Link a freshly-built object into the heap, accounting its size.
    /// Does not itself check `should_collect` — callers (the VM) decide when
    /// to collect, since only they know the current root set.
    pub fn alloc<T: HasHeader>(&mut self, mut value: T) -> *mut T {
        self.bytes_allocated += size_of::<T>();
        {
            let header = value.header_mut();
            header.next = self.objects;
            header.marked = false;
        }
        let ptr = Box::into_raw(Box::new(value));
        self.objects = ptr as *mut ObjHeader;
        ptr
    }

    fn intern_bytes(&mut self, bytes: &[u8]) -> *mut ObjHeader {
        if let Some(&ptr) = self.strings.get(bytes) {
            return ptr;
        }
        let hash = hash_bytes(bytes);
        let boxed: Box<[u8]> = bytes.to_vec().into_boxed_slice();
        let obj = ObjString {
            header: ObjHeader {
                tag: ObjType::String,
                marked: false,
                next: std::ptr::null_mut(),
                dict: Default::default(),
            },
            hash,
            bytes: boxed.clone(),
        };
        let ptr = self.alloc(obj) as *mut ObjHeader;
        self.strings.insert(boxed, ptr);
        ptr
    }

    /// Intern a borrowed byte slice, copying only on first sight.
    pub fn copy_string(&mut self, bytes: &[u8]) -> *mut ObjHeader {
        self.intern_bytes(bytes)
    }

    /// Intern an owned buffer, reusing it as the canonical storage when the
    /// string has not been seen before.
    pub fn take_string(&mut self, bytes: Vec<u8>) -> *mut ObjHeader {
        if let Some(&ptr) = self.strings.get(bytes.as_slice()) {
            return ptr;
        }
        self.intern_bytes(&bytes)
    }

    pub fn mark_value(&mut self, v: Value) {
        if v.is_object() {
            self.mark_object(v.as_object());
        }
    }

    pub fn mark_object(&mut self, ptr: *mut ObjHeader) {
        if ptr.is_null() {
            return;
        }
        // Safety: every pointer reachable from a live root is a pointer the
        // heap itself allocated and has not yet swept.
        unsafe {
            if (*ptr).marked {
                return;
            }
            (*ptr).marked = true;
        }
        self.gray.push(ptr);
    }

    fn blacken(&mut self, ptr: *mut ObjHeader) {
        use crate::object::*;
        unsafe {
            let dict_ptr = &(*ptr).dict as *const crate::object::Dict;
            for (k, v) in (*dict_ptr).iter() {
                self.mark_object(k.0);
                self.mark_value(*v);
            }
            match (*ptr).tag {
                ObjType::String => {}
                ObjType::NativeFunction => self.mark_object(as_native_function(ptr).name),
                ObjType::BuiltinType => self.mark_object(as_builtin_type(ptr).name),
                ObjType::Class => {
                    let c = as_class(ptr);
                    self.mark_object(c.name);
                    if let Some(parent) = c.parent {
                        self.mark_object(parent);
                    }
                }
                ObjType::UpValue => {
                    let uv = as_upvalue(ptr);
                    if uv.slot == 0 {
                        self.mark_value(uv.closed);
                    }
                }
                ObjType::Method => {
                    let m = as_method(ptr);
                    self.mark_value(m.receiver);
                    self.mark_object(m.func);
                }
                ObjType::Instance => self.mark_object(as_instance(ptr).class),
                ObjType::FunctionCode => {
                    let fun = as_function_code(ptr);
                    self.mark_object(fun.name);
                    for c in fun.chunk.constants.iter() {
                        self.mark_value(*c);
                    }
                }
                ObjType::Function => {
                    let fun = as_function(ptr);
                    self.mark_object(fun.code);
                    for uv in fun.upvalues.iter() {
                        self.mark_object(*uv);
                    }
                }
            }
        }
    }

    fn trace(&mut self) {
        while let Some(ptr) = self.gray.pop() {
            self.blacken(ptr);
        }
    }

    /// # Safety
    /// `ptr`'s tag must match the variant being freed; the pointer must not
    /// be used again afterward.
    unsafe fn free_object(&mut self, ptr: *mut ObjHeader) {
        match (*ptr).tag {
            ObjType::String => {
                let s = crate::object::as_string(ptr);
                self.strings.remove(s.bytes.as_ref());
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjString>());
                drop(Box::from_raw(ptr as *mut ObjString));
            }
            ObjType::FunctionCode => {
                self.bytes_allocated =
                    self.bytes_allocated.saturating_sub(size_of::<ObjFunctionCode>());
                drop(Box::from_raw(ptr as *mut ObjFunctionCode));
            }
            ObjType::Function => {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjFunction>());
                drop(Box::from_raw(ptr as *mut ObjFunction));
            }
            ObjType::UpValue => {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjUpValue>());
                drop(Box::from_raw(ptr as *mut ObjUpValue));
            }
            ObjType::Class => {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjClass>());
                drop(Box::from_raw(ptr as *mut ObjClass));
            }
            ObjType::Instance => {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjInstance>());
                drop(Box::from_raw(ptr as *mut ObjInstance));
            }
            ObjType::Method => {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size_of::<ObjMethod>());
                drop(Box::from_raw(ptr as *mut ObjMethod));
            }
            ObjType::NativeFunction => {
                self.bytes_allocated =
                    self.bytes_allocated.saturating_sub(size_of::<ObjNativeFunction>());
                drop(Box::from_raw(ptr as *mut ObjNativeFunction));
            }
            ObjType::BuiltinType => {
                self.bytes_allocated =
                    self.bytes_allocated.saturating_sub(size_of::<ObjBuiltinType>());
                drop(Box::from_raw(ptr as *mut ObjBuiltinType));
            }
        }
    }

    fn sweep(&mut self) {
        unsafe {
            let mut prev: *mut ObjHeader = std::ptr::null_mut();
            let mut cur = self.objects;
            while !cur.is_null() {
                let next = (*cur).next;
                if (*cur).marked {
                    (*cur).marked = false;
                    prev = cur;
                } else {
                    if prev.is_null() {
                        self.objects = next;
                    } else {
                        (*prev).next = next;
                    }
                    self.free_object(cur);
                }
                cur = next;
            }
        }
    }

    /// Run a full collection. The caller must have already marked every
    /// root it owns (stack, frames, globals, upvalues, compiler chain, ...)
    /// via `mark_value`/`mark_object` before calling this.
    pub fn collect(&mut self) {
        self.paused = true;
        self.trace();
        self.sweep();
        self.next_gc = self.bytes_allocated.max(MIN_NEXT_GC) * GC_HEAP_GROW_FACTOR;
        self.paused = false;
    }

    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.objects;
        unsafe {
            while !cur.is_null() {
                n += 1;
                cur = (*cur).next;
            }
        }
        n
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            let mut cur = self.objects;
            while !cur.is_null() {
                let next = (*cur).next;
                self.free_object(cur);
                cur = next;
            }
        }
        self.objects = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjHeader, ObjString, ObjType};

    fn fresh_string(heap: &mut Heap, s: &str) -> *mut ObjHeader {
        heap.copy_string(s.as_bytes())
    }

    #[test]
    fn interning_returns_canonical_pointer_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = fresh_string(&mut heap, "hello");
        let b = fresh_string(&mut heap, "hello");
        let c = fresh_string(&mut heap, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unreached_strings_are_swept() {
        let mut heap = Heap::new();
        let _kept = fresh_string(&mut heap, "kept");
        let _dropped = fresh_string(&mut heap, "dropped");
        assert_eq!(heap.object_count(), 2);

        heap.mark_object(_kept);
        heap.collect();
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn next_gc_grows_after_collection() {
        let mut heap = Heap::new();
        let before = heap.next_gc();
        heap.collect();
        assert!(heap.next_gc() >= before);
        assert!(heap.next_gc() >= heap.bytes_allocated());
    }
}
