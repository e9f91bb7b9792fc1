//! This module makes the host VM's C functions and data layouts available
//! to the Rust side of bbjit.
//!
//! ## Linking notes
//!
//! The bbjit crate compiles to a native static library that gets linked
//! into the VM binary. By declaring external functions here and using them,
//! we are asserting that the symbols have a definition in one of the object
//! files the final link sees. Declaring a function that has no definition
//! anywhere causes a linking error, so only symbols the VM actually exports
//! (or that the VM's bbjit glue file defines for us) may appear below.
//!
//! ## Testing without the VM
//!
//! `cargo test` does not link the VM, so every external declaration is
//! gated on `#[cfg(not(test))]` and replaced by a panicking stand-in for
//! test builds. Tests exercise compilation machinery that stays on the
//! Rust side of this boundary; if a test trips one of the stand-ins, the
//! test is reaching into the VM and needs to be restructured.

// Host types use snake_case names. Allow them so we use one name across languages.
#![allow(non_camel_case_types)]
// A lot of imported host globals aren't all-caps
#![allow(non_upper_case_globals)]
#![allow(dead_code)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint};
use std::panic::{catch_unwind, UnwindSafe};

// The host build asserts this layout. u64 rather than usize so the
// x86-64 lowering never has to ask how wide a handle is.
pub type size_t = u64;

/// An interned string handle from the host VM
pub type ID = u64;

/// Operand word in an instruction sequence
pub type rb_num_t = u64;

/// Per-class redefinition flags. These are just shifted 1s but not
/// explicitly an enum on the C side.
pub type RedefinitionFlag = u32;

/// Basic operator discriminant (BOP_PLUS and friends)
pub type ruby_basic_operators = u32;

/// Ruby object type tag (the T_xxx values)
pub type ruby_value_type = u32;

/// Bytecode opcode discriminant
pub type ruby_vminsn_type = u32;

pub type rb_method_visibility_t = u32;
pub type rb_method_type_t = u32;
pub type rb_optimized_method_type_t = u32;
pub type imemo_type = u32;

/// Opaque iseq type for opaque iseq pointers from the VM.
/// Opaque struct pattern per <https://doc.rust-lang.org/nomicon/ffi.html#representing-opaque-structs>
#[repr(C)]
pub struct rb_iseq_t {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Pointer to an ISEQ
pub type IseqPtr = *const rb_iseq_t;

/// Opaque execution-context type from the VM
#[repr(C)]
pub struct rb_execution_context_struct {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}
pub type rb_execution_context_t = rb_execution_context_struct;

/// Pointer to an execution context
pub type EcPtr = *const rb_execution_context_struct;

/// Opaque control frame struct. We only address its fields through the
/// RUBY_OFFSET_CFP_* constants, which the configure script checks.
#[repr(C)]
pub struct rb_control_frame_struct {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Pointer to a control frame (CFP)
pub type CfpPtr = *mut rb_control_frame_struct;

/// Opaque cref (lexical scope) struct
#[repr(C)]
pub struct rb_cref_t {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Opaque method definition struct
#[repr(C)]
pub struct rb_method_definition_t {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Opaque cfunc body struct
#[repr(C)]
pub struct rb_method_cfunc_t {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Opaque call data (call cache + call info pair)
#[repr(C)]
pub struct rb_call_data {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Opaque call info
#[repr(C)]
pub struct rb_callinfo {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// Opaque hash table from the host
#[repr(C)]
pub struct st_table {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

/// An object handle, matching VALUE on the C side. Methods here assume a
/// real handle; the interpreter occasionally smuggles plain integers
/// through VALUE, but those never cross this boundary.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(transparent)] // same size and alignment as simply `usize`
pub struct VALUE(pub usize);

/// Header shared by all heap objects
#[repr(C)]
pub struct RBasic {
    pub flags: VALUE,
    pub klass: VALUE,
}

/// Callable method entry. Field order must match the host's
/// rb_callable_method_entry_struct.
#[repr(C)]
pub struct rb_callable_method_entry_t {
    pub flags: VALUE,
    pub defined_class: VALUE,
    pub def: *mut rb_method_definition_t,
    pub called_id: ID,
    pub owner: VALUE,
}

/// Descriptor for a builtin function implemented in C
#[repr(C)]
pub struct rb_builtin_function {
    pub func_ptr: *const std::os::raw::c_void,
    pub argc: c_int,
    pub index: c_int,
    pub name: *const c_char,
}

/// Entry in an object's ivar name to slot index table
#[repr(C)]
pub struct rb_iv_index_tbl_entry {
    pub index: u32,
    pub class_serial: u64,
    pub class_value: VALUE,
}

/// Inline constant cache entry. Layout checked by RUBY_OFFSET_ICE_VALUE.
#[repr(C)]
pub struct iseq_inline_constant_cache_entry {
    pub flags: VALUE,
    pub value: VALUE,
    pub ic_cref: *const rb_cref_t,
}

/// Inline constant cache. The iseq records which instruction index reads
/// through this cache so we can invalidate the right block versions.
#[repr(C)]
pub struct iseq_inline_constant_cache {
    pub entry: *const iseq_inline_constant_cache_entry,
    pub get_insn_idx: c_uint,
}

pub type IC = *const iseq_inline_constant_cache;

impl VALUE {
    /// Print the value like the debugger's rp(VALUE) would
    pub fn dump_info(self) {
        unsafe { rb_obj_info_dump(self) }
    }

    /// Ruby truthiness. Only nil and false are falsy.
    pub fn test(self) -> bool {
        let VALUE(cval) = self;
        let VALUE(qnilval) = Qnil;
        (cval & !qnilval) != 0
    }

    /// Return true if the value is an immediate integer, flonum or static symbol
    fn immediate_p(self) -> bool {
        let VALUE(cval) = self;
        (cval & (RUBY_IMMEDIATE_MASK as usize)) != 0
    }

    /// Return true if the value is an immediate, nil or false
    pub fn special_const_p(self) -> bool {
        self.immediate_p() || !self.test()
    }

    /// Return true if the value is a tagged fixnum
    pub fn fixnum_p(self) -> bool {
        let VALUE(cval) = self;
        let flag = RUBY_FIXNUM_FLAG as usize;
        (cval & flag) == flag
    }

    /// Return true if the value is an immediate float (flonum)
    pub fn flonum_p(self) -> bool {
        let VALUE(cval) = self;
        let mask = RUBY_FLONUM_MASK as usize;
        let flag = RUBY_FLONUM_FLAG as usize;
        (cval & mask) == flag
    }

    /// Return true for a static (non-heap) symbol
    pub fn static_sym_p(self) -> bool {
        let VALUE(cval) = self;
        let flag = RUBY_SYMBOL_FLAG as usize;
        (cval & 0xff) == flag
    }

    /// Whether the value is nil
    pub fn nil_p(self) -> bool {
        self == Qnil
    }

    /// Read the flag bits from the object header, then return a type tag (e.g. RUBY_T_ARRAY)
    pub fn builtin_type(self) -> ruby_value_type {
        assert!(!self.special_const_p());

        let VALUE(cval) = self;
        let rbasic_ptr = cval as *const RBasic;
        let flags_bits: usize = unsafe { (*rbasic_ptr).flags }.as_usize();
        (flags_bits & (RUBY_T_MASK as usize)) as ruby_value_type
    }

    pub fn class_of(self) -> VALUE {
        unsafe { rb_bbjit_class_of(self) }
    }

    pub fn as_isize(self) -> isize {
        let VALUE(is) = self;
        is as isize
    }

    pub fn as_i32(self) -> i32 {
        self.as_i64().try_into().unwrap()
    }

    pub fn as_u32(self) -> u32 {
        let VALUE(i) = self;
        i.try_into().unwrap()
    }

    pub fn as_i64(self) -> i64 {
        let VALUE(i) = self;
        i as i64
    }

    pub fn as_u64(self) -> u64 {
        let VALUE(i) = self;
        i.try_into().unwrap()
    }

    pub fn as_usize(self) -> usize {
        let VALUE(us) = self;
        us
    }

    pub fn as_ptr<T>(self) -> *const T {
        let VALUE(us) = self;
        us as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        let VALUE(us) = self;
        us as *mut T
    }

    /// Null check for opaque pointers.
    /// Similar to [std::ptr::NonNull], but for `*const T`.
    pub fn as_optional_ptr<T>(self) -> Option<*const T> {
        let ptr: *const T = self.as_ptr();

        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// Debug-assert that `self` is an iseq
    pub fn as_iseq(self) -> IseqPtr {
        let ptr: IseqPtr = self.as_ptr();

        #[cfg(all(debug_assertions, not(test)))]
        if !ptr.is_null() {
            unsafe { rb_assert_iseq_handle(self) }
        }

        ptr
    }

    /// Debug-assert that `self` is a method entry
    pub fn as_cme(self) -> *const rb_callable_method_entry_t {
        let ptr: *const rb_callable_method_entry_t = self.as_ptr();

        #[cfg(all(debug_assertions, not(test)))]
        if !ptr.is_null() {
            unsafe { rb_assert_cme_handle(self) }
        }

        ptr
    }

    pub fn fixnum_from_usize(item: usize) -> Self {
        assert!(item <= (RUBY_FIXNUM_MAX as usize));
        let k: usize = item.wrapping_add(item.wrapping_add(1));
        VALUE(k)
    }
}

impl From<IseqPtr> for VALUE {
    fn from(iseq: IseqPtr) -> Self {
        VALUE(iseq as usize)
    }
}

impl From<*const rb_callable_method_entry_t> for VALUE {
    fn from(cme: *const rb_callable_method_entry_t) -> Self {
        VALUE(cme as usize)
    }
}

impl From<VALUE> for u64 {
    fn from(value: VALUE) -> Self {
        let VALUE(uimm) = value;
        uimm as u64
    }
}

impl From<VALUE> for i64 {
    fn from(value: VALUE) -> Self {
        let VALUE(uimm) = value;
        assert!(uimm <= (i64::MAX as usize));
        uimm as i64
    }
}

impl From<VALUE> for i32 {
    fn from(value: VALUE) -> Self {
        let VALUE(uimm) = value;
        assert!(uimm <= (i32::MAX as usize));
        uimm.try_into().unwrap()
    }
}

// Special constants. Non-idiomatic capitalization to match the C names.
pub const Qfalse: VALUE = VALUE(0x00);
pub const Qnil: VALUE = VALUE(0x08);
pub const Qtrue: VALUE = VALUE(0x14);
pub const Qundef: VALUE = VALUE(0x34);

// Value tagging bits
pub const RUBY_IMMEDIATE_MASK: u32 = 0x07;
pub const RUBY_FIXNUM_FLAG: u32 = 0x01;
pub const RUBY_FLONUM_MASK: u32 = 0x03;
pub const RUBY_FLONUM_FLAG: u32 = 0x02;
pub const RUBY_SYMBOL_FLAG: u32 = 0x0c;
pub const RUBY_SPECIAL_SHIFT: u32 = 8;

// Object type tags
pub const RUBY_T_NONE: ruby_value_type = 0x00;
pub const RUBY_T_OBJECT: ruby_value_type = 0x01;
pub const RUBY_T_CLASS: ruby_value_type = 0x02;
pub const RUBY_T_MODULE: ruby_value_type = 0x03;
pub const RUBY_T_FLOAT: ruby_value_type = 0x04;
pub const RUBY_T_STRING: ruby_value_type = 0x05;
pub const RUBY_T_REGEXP: ruby_value_type = 0x06;
pub const RUBY_T_ARRAY: ruby_value_type = 0x07;
pub const RUBY_T_HASH: ruby_value_type = 0x08;
pub const RUBY_T_STRUCT: ruby_value_type = 0x0b;
pub const RUBY_T_NIL: ruby_value_type = 0x11;
pub const RUBY_T_TRUE: ruby_value_type = 0x12;
pub const RUBY_T_FALSE: ruby_value_type = 0x13;
pub const RUBY_T_SYMBOL: ruby_value_type = 0x14;
pub const RUBY_T_FIXNUM: ruby_value_type = 0x15;
pub const RUBY_T_IMEMO: ruby_value_type = 0x1a;
pub const RUBY_T_ICLASS: ruby_value_type = 0x1c;
pub const RUBY_T_MASK: ruby_value_type = 0x1f;

// Object header flag bits
pub const RUBY_FL_USHIFT: u32 = 12;
pub const RUBY_FL_FREEZE: u32 = 1 << 11;
pub const RUBY_FL_SINGLETON: u32 = 1 << RUBY_FL_USHIFT; // FL_USER0
pub const ROBJECT_EMBED: u32 = 1 << (RUBY_FL_USHIFT + 1); // FL_USER1
pub const ROBJECT_EMBED_LEN_MAX: usize = 3;
pub const RARRAY_EMBED_FLAG: u32 = 1 << (RUBY_FL_USHIFT + 1); // FL_USER1
pub const RARRAY_EMBED_LEN_MASK: u32 = (1 << (RUBY_FL_USHIFT + 4)) | (1 << (RUBY_FL_USHIFT + 3));
pub const RARRAY_EMBED_LEN_SHIFT: u32 = RUBY_FL_USHIFT + 3;
pub const RUBY_ENCODING_MASK: u64 = 0x7f << (RUBY_FL_USHIFT + 10);
pub const RMODULE_IS_REFINEMENT: u32 = 1 << (RUBY_FL_USHIFT + 3); // FL_USER3
pub const RSTRUCT_EMBED_LEN_MASK: usize = 0b1111111 << (RUBY_FL_USHIFT + 1); // FL_USER1..FL_USER7

// Per-class basic operator redefinition flags
pub const INTEGER_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 0;
pub const FLOAT_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 1;
pub const STRING_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 2;
pub const ARRAY_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 3;
pub const HASH_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 4;
pub const SYMBOL_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 6;
pub const NIL_REDEFINED_OP_FLAG: RedefinitionFlag = 1 << 9;

// Basic operators
pub const BOP_PLUS: ruby_basic_operators = 0;
pub const BOP_MINUS: ruby_basic_operators = 1;
pub const BOP_MULT: ruby_basic_operators = 2;
pub const BOP_DIV: ruby_basic_operators = 3;
pub const BOP_MOD: ruby_basic_operators = 4;
pub const BOP_EQ: ruby_basic_operators = 5;
pub const BOP_EQQ: ruby_basic_operators = 6;
pub const BOP_LT: ruby_basic_operators = 7;
pub const BOP_LE: ruby_basic_operators = 8;
pub const BOP_LTLT: ruby_basic_operators = 9;
pub const BOP_AREF: ruby_basic_operators = 10;
pub const BOP_ASET: ruby_basic_operators = 11;
pub const BOP_LENGTH: ruby_basic_operators = 12;
pub const BOP_SIZE: ruby_basic_operators = 13;
pub const BOP_EMPTY_P: ruby_basic_operators = 14;
pub const BOP_NIL_P: ruby_basic_operators = 15;
pub const BOP_SUCC: ruby_basic_operators = 16;
pub const BOP_GT: ruby_basic_operators = 17;
pub const BOP_GE: ruby_basic_operators = 18;
pub const BOP_NOT: ruby_basic_operators = 19;
pub const BOP_NEQ: ruby_basic_operators = 20;
pub const BOP_MATCH: ruby_basic_operators = 21;
pub const BOP_FREEZE: ruby_basic_operators = 22;
pub const BOP_UMINUS: ruby_basic_operators = 23;
pub const BOP_MAX: ruby_basic_operators = 24;
pub const BOP_MIN: ruby_basic_operators = 25;
pub const BOP_AND: ruby_basic_operators = 26;
pub const BOP_OR: ruby_basic_operators = 27;

// Call site flag bits
pub const VM_CALL_ARGS_SPLAT: u32 = 1 << 0;
pub const VM_CALL_ARGS_BLOCKARG: u32 = 1 << 1;
pub const VM_CALL_FCALL: u32 = 1 << 2;
pub const VM_CALL_VCALL: u32 = 1 << 3;
pub const VM_CALL_ARGS_SIMPLE: u32 = 1 << 4;
pub const VM_CALL_BLOCKISEQ: u32 = 1 << 5;
pub const VM_CALL_KWARG: u32 = 1 << 6;
pub const VM_CALL_KW_SPLAT: u32 = 1 << 7;
pub const VM_CALL_TAILCALL: u32 = 1 << 8;
pub const VM_CALL_SUPER: u32 = 1 << 9;
pub const VM_CALL_ZSUPER: u32 = 1 << 10;
pub const VM_CALL_OPT_SEND: u32 = 1 << 11;

// Method entry visibility
pub const METHOD_VISI_UNDEF: rb_method_visibility_t = 0;
pub const METHOD_VISI_PUBLIC: rb_method_visibility_t = 1;
pub const METHOD_VISI_PRIVATE: rb_method_visibility_t = 2;
pub const METHOD_VISI_PROTECTED: rb_method_visibility_t = 3;

// Method definition kinds
pub const VM_METHOD_TYPE_ISEQ: rb_method_type_t = 0;
pub const VM_METHOD_TYPE_CFUNC: rb_method_type_t = 1;
pub const VM_METHOD_TYPE_ATTRSET: rb_method_type_t = 2;
pub const VM_METHOD_TYPE_IVAR: rb_method_type_t = 3;
pub const VM_METHOD_TYPE_BMETHOD: rb_method_type_t = 4;
pub const VM_METHOD_TYPE_ZSUPER: rb_method_type_t = 5;
pub const VM_METHOD_TYPE_ALIAS: rb_method_type_t = 6;
pub const VM_METHOD_TYPE_UNDEF: rb_method_type_t = 7;
pub const VM_METHOD_TYPE_NOTIMPLEMENTED: rb_method_type_t = 8;
pub const VM_METHOD_TYPE_OPTIMIZED: rb_method_type_t = 9;
pub const VM_METHOD_TYPE_MISSING: rb_method_type_t = 10;
pub const VM_METHOD_TYPE_REFINED: rb_method_type_t = 11;

// Optimized method kinds
pub const OPTIMIZED_METHOD_TYPE_SEND: rb_optimized_method_type_t = 0;
pub const OPTIMIZED_METHOD_TYPE_CALL: rb_optimized_method_type_t = 1;
pub const OPTIMIZED_METHOD_TYPE_BLOCK_CALL: rb_optimized_method_type_t = 2;
pub const OPTIMIZED_METHOD_TYPE_STRUCT_AREF: rb_optimized_method_type_t = 3;
pub const OPTIMIZED_METHOD_TYPE_STRUCT_ASET: rb_optimized_method_type_t = 4;

// Frame magic and environment flags
pub const VM_FRAME_MAGIC_METHOD: u32 = 0x11110001;
pub const VM_FRAME_MAGIC_CFUNC: u32 = 0x55550001;
pub const VM_FRAME_FLAG_CFRAME: u32 = 0x0080;
pub const VM_FRAME_FLAG_MODIFIED_BLOCK_PARAM: u32 = 0x0400;
pub const VM_ENV_FLAG_LOCAL: u32 = 0x0002;
pub const VM_ENV_FLAG_WB_REQUIRED: u32 = 0x0008;
pub const VM_ENV_DATA_SIZE: u32 = 3;
pub const VM_ENV_DATA_INDEX_ME_CREF: i32 = -2;
pub const VM_ENV_DATA_INDEX_SPECVAL: i32 = -1;
pub const VM_ENV_DATA_INDEX_FLAGS: i32 = 0;
pub const VM_BLOCK_HANDLER_NONE: u32 = 0;
pub const VM_SPECIAL_OBJECT_VMCORE: u32 = 1;

pub const imemo_iseq: imemo_type = 7;

// Bytecode opcodes. The numbering matches the host's insns.def ordering;
// the second half of the table holds the trace_ variants.
pub const YARVINSN_nop: ruby_vminsn_type = 0;
pub const YARVINSN_getlocal: ruby_vminsn_type = 1;
pub const YARVINSN_setlocal: ruby_vminsn_type = 2;
pub const YARVINSN_getblockparam: ruby_vminsn_type = 3;
pub const YARVINSN_setblockparam: ruby_vminsn_type = 4;
pub const YARVINSN_getblockparamproxy: ruby_vminsn_type = 5;
pub const YARVINSN_getspecial: ruby_vminsn_type = 6;
pub const YARVINSN_setspecial: ruby_vminsn_type = 7;
pub const YARVINSN_getinstancevariable: ruby_vminsn_type = 8;
pub const YARVINSN_setinstancevariable: ruby_vminsn_type = 9;
pub const YARVINSN_getclassvariable: ruby_vminsn_type = 10;
pub const YARVINSN_setclassvariable: ruby_vminsn_type = 11;
pub const YARVINSN_getconstant: ruby_vminsn_type = 12;
pub const YARVINSN_setconstant: ruby_vminsn_type = 13;
pub const YARVINSN_getglobal: ruby_vminsn_type = 14;
pub const YARVINSN_setglobal: ruby_vminsn_type = 15;
pub const YARVINSN_putnil: ruby_vminsn_type = 16;
pub const YARVINSN_putself: ruby_vminsn_type = 17;
pub const YARVINSN_putobject: ruby_vminsn_type = 18;
pub const YARVINSN_putspecialobject: ruby_vminsn_type = 19;
pub const YARVINSN_putstring: ruby_vminsn_type = 20;
pub const YARVINSN_concatstrings: ruby_vminsn_type = 21;
pub const YARVINSN_anytostring: ruby_vminsn_type = 22;
pub const YARVINSN_toregexp: ruby_vminsn_type = 23;
pub const YARVINSN_intern: ruby_vminsn_type = 24;
pub const YARVINSN_newarray: ruby_vminsn_type = 25;
pub const YARVINSN_newarraykwsplat: ruby_vminsn_type = 26;
pub const YARVINSN_duparray: ruby_vminsn_type = 27;
pub const YARVINSN_duphash: ruby_vminsn_type = 28;
pub const YARVINSN_expandarray: ruby_vminsn_type = 29;
pub const YARVINSN_concatarray: ruby_vminsn_type = 30;
pub const YARVINSN_splatarray: ruby_vminsn_type = 31;
pub const YARVINSN_newhash: ruby_vminsn_type = 32;
pub const YARVINSN_newrange: ruby_vminsn_type = 33;
pub const YARVINSN_pop: ruby_vminsn_type = 34;
pub const YARVINSN_dup: ruby_vminsn_type = 35;
pub const YARVINSN_dupn: ruby_vminsn_type = 36;
pub const YARVINSN_swap: ruby_vminsn_type = 37;
pub const YARVINSN_topn: ruby_vminsn_type = 38;
pub const YARVINSN_setn: ruby_vminsn_type = 39;
pub const YARVINSN_adjuststack: ruby_vminsn_type = 40;
pub const YARVINSN_defined: ruby_vminsn_type = 41;
pub const YARVINSN_checkmatch: ruby_vminsn_type = 42;
pub const YARVINSN_checkkeyword: ruby_vminsn_type = 43;
pub const YARVINSN_checktype: ruby_vminsn_type = 44;
pub const YARVINSN_defineclass: ruby_vminsn_type = 45;
pub const YARVINSN_definemethod: ruby_vminsn_type = 46;
pub const YARVINSN_definesmethod: ruby_vminsn_type = 47;
pub const YARVINSN_send: ruby_vminsn_type = 48;
pub const YARVINSN_opt_send_without_block: ruby_vminsn_type = 49;
pub const YARVINSN_objtostring: ruby_vminsn_type = 50;
pub const YARVINSN_opt_str_freeze: ruby_vminsn_type = 51;
pub const YARVINSN_opt_nil_p: ruby_vminsn_type = 52;
pub const YARVINSN_opt_str_uminus: ruby_vminsn_type = 53;
pub const YARVINSN_opt_newarray_max: ruby_vminsn_type = 54;
pub const YARVINSN_opt_newarray_min: ruby_vminsn_type = 55;
pub const YARVINSN_invokesuper: ruby_vminsn_type = 56;
pub const YARVINSN_invokeblock: ruby_vminsn_type = 57;
pub const YARVINSN_leave: ruby_vminsn_type = 58;
pub const YARVINSN_throw: ruby_vminsn_type = 59;
pub const YARVINSN_jump: ruby_vminsn_type = 60;
pub const YARVINSN_branchif: ruby_vminsn_type = 61;
pub const YARVINSN_branchunless: ruby_vminsn_type = 62;
pub const YARVINSN_branchnil: ruby_vminsn_type = 63;
pub const YARVINSN_opt_getinlinecache: ruby_vminsn_type = 64;
pub const YARVINSN_opt_setinlinecache: ruby_vminsn_type = 65;
pub const YARVINSN_once: ruby_vminsn_type = 66;
pub const YARVINSN_opt_case_dispatch: ruby_vminsn_type = 67;
pub const YARVINSN_opt_plus: ruby_vminsn_type = 68;
pub const YARVINSN_opt_minus: ruby_vminsn_type = 69;
pub const YARVINSN_opt_mult: ruby_vminsn_type = 70;
pub const YARVINSN_opt_div: ruby_vminsn_type = 71;
pub const YARVINSN_opt_mod: ruby_vminsn_type = 72;
pub const YARVINSN_opt_eq: ruby_vminsn_type = 73;
pub const YARVINSN_opt_neq: ruby_vminsn_type = 74;
pub const YARVINSN_opt_lt: ruby_vminsn_type = 75;
pub const YARVINSN_opt_le: ruby_vminsn_type = 76;
pub const YARVINSN_opt_gt: ruby_vminsn_type = 77;
pub const YARVINSN_opt_ge: ruby_vminsn_type = 78;
pub const YARVINSN_opt_ltlt: ruby_vminsn_type = 79;
pub const YARVINSN_opt_and: ruby_vminsn_type = 80;
pub const YARVINSN_opt_or: ruby_vminsn_type = 81;
pub const YARVINSN_opt_aref: ruby_vminsn_type = 82;
pub const YARVINSN_opt_aset: ruby_vminsn_type = 83;
pub const YARVINSN_opt_aset_with: ruby_vminsn_type = 84;
pub const YARVINSN_opt_aref_with: ruby_vminsn_type = 85;
pub const YARVINSN_opt_length: ruby_vminsn_type = 86;
pub const YARVINSN_opt_size: ruby_vminsn_type = 87;
pub const YARVINSN_opt_empty_p: ruby_vminsn_type = 88;
pub const YARVINSN_opt_succ: ruby_vminsn_type = 89;
pub const YARVINSN_opt_not: ruby_vminsn_type = 90;
pub const YARVINSN_opt_regexpmatch2: ruby_vminsn_type = 91;
pub const YARVINSN_invokebuiltin: ruby_vminsn_type = 92;
pub const YARVINSN_opt_invokebuiltin_delegate: ruby_vminsn_type = 93;
pub const YARVINSN_opt_invokebuiltin_delegate_leave: ruby_vminsn_type = 94;
pub const YARVINSN_getlocal_WC_0: ruby_vminsn_type = 95;
pub const YARVINSN_getlocal_WC_1: ruby_vminsn_type = 96;
pub const YARVINSN_setlocal_WC_0: ruby_vminsn_type = 97;
pub const YARVINSN_setlocal_WC_1: ruby_vminsn_type = 98;
pub const YARVINSN_putobject_INT2FIX_0_: ruby_vminsn_type = 99;
pub const YARVINSN_putobject_INT2FIX_1_: ruby_vminsn_type = 100;

/// Number of opcodes including the trace_ variants in the second half
pub const VM_INSTRUCTION_SIZE: ruby_vminsn_type = 202;

// Layout constants, checked against the C structs by the configure script.
pub const SIZEOF_VALUE: usize = 8;
pub const SIZEOF_VALUE_I32: i32 = SIZEOF_VALUE as i32;

pub const RUBY_LONG_MIN: isize = std::os::raw::c_long::MIN as isize;
pub const RUBY_LONG_MAX: isize = std::os::raw::c_long::MAX as isize;

pub const RUBY_FIXNUM_MIN: isize = RUBY_LONG_MIN / 2;
pub const RUBY_FIXNUM_MAX: isize = RUBY_LONG_MAX / 2;

pub const RUBY_OFFSET_RBASIC_FLAGS: i32 = 0; // struct RBasic, field "flags"
pub const RUBY_OFFSET_RBASIC_KLASS: i32 = 8; // struct RBasic, field "klass"
pub const RUBY_OFFSET_RARRAY_AS_HEAP_LEN: i32 = 16; // struct RArray, subfield "as.heap.len"
pub const RUBY_OFFSET_RARRAY_AS_HEAP_PTR: i32 = 32; // struct RArray, subfield "as.heap.ptr"
pub const RUBY_OFFSET_RARRAY_AS_ARY: i32 = 16; // struct RArray, subfield "as.ary"

pub const RUBY_OFFSET_ROBJECT_AS_ARY: i32 = 16; // struct RObject, subfield "as.ary"
pub const RUBY_OFFSET_ROBJECT_AS_HEAP_NUMIV: i32 = 16; // struct RObject, subfield "as.heap.numiv"
pub const RUBY_OFFSET_ROBJECT_AS_HEAP_IVPTR: i32 = 24; // struct RObject, subfield "as.heap.ivptr"

pub const RUBY_OFFSET_RSTRUCT_AS_HEAP_PTR: i32 = 24; // struct RStruct, subfield "as.heap.ptr"
pub const RUBY_OFFSET_RSTRUCT_AS_ARY: i32 = 16; // struct RStruct, subfield "as.ary"

// Constants from rb_control_frame_t
pub const RUBY_OFFSET_CFP_PC: i32 = 0;
pub const RUBY_OFFSET_CFP_SP: i32 = 8;
pub const RUBY_OFFSET_CFP_ISEQ: i32 = 16;
pub const RUBY_OFFSET_CFP_SELF: i32 = 24;
pub const RUBY_OFFSET_CFP_EP: i32 = 32;
pub const RUBY_OFFSET_CFP_BLOCK_CODE: i32 = 40;
pub const RUBY_OFFSET_CFP_BP: i32 = 48;
pub const RUBY_OFFSET_CFP_JIT_RETURN: i32 = 56;
pub const RUBY_SIZEOF_CONTROL_FRAME: usize = 64;

// Constants from rb_execution_context_t
pub const RUBY_OFFSET_EC_CFP: i32 = 16;
pub const RUBY_OFFSET_EC_INTERRUPT_FLAG: i32 = 32; // rb_atomic_t (u32)
pub const RUBY_OFFSET_EC_INTERRUPT_MASK: i32 = 36; // rb_atomic_t (u32)
pub const RUBY_OFFSET_EC_THREAD_PTR: i32 = 48;

// Constants from rb_thread_t
pub const RUBY_OFFSET_THREAD_SELF: i32 = 16;

// Constants from the inline constant cache structs
pub const RUBY_OFFSET_IC_ENTRY: i32 = 0;
pub const RUBY_OFFSET_ICE_VALUE: i32 = 8;

/// Declare functions the host VM (or its bbjit glue file) exports to us.
/// `cargo test` does not link the VM, so test builds get a panicking
/// stand-in for each declaration instead.
macro_rules! host_fns {
    ($(pub fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)?;)*) => {
        #[cfg(not(test))]
        extern "C" {
            $(pub fn $name($($arg: $ty),*) $(-> $ret)?;)*
        }

        $(
            #[cfg(test)]
            #[allow(unused_variables)]
            pub unsafe extern "C" fn $name($($arg: $ty),*) $(-> $ret)? {
                panic!(concat!(
                    stringify!($name),
                    " is a host VM function, and we don't link against the VM for Rust testing!"
                ))
            }
        )*
    }
}

host_fns! {
    // Instruction sequences and bytecode decoding
    pub fn rb_iseq_pc_at_idx(iseq: IseqPtr, insn_idx: u32) -> *mut VALUE;
    pub fn rb_iseq_opcode_at_pc(iseq: IseqPtr, pc: *const VALUE) -> c_int;
    pub fn rb_iseq_encoded_size(iseq: IseqPtr) -> c_uint;
    pub fn rb_insn_len(opcode: VALUE) -> c_int;
    pub fn rb_insn_name(opcode: VALUE) -> *const c_char;
    pub fn rb_vm_insn_addr2opcode(addr: *const std::os::raw::c_void) -> c_int;
    pub fn rb_get_iseq_body_local_table_size(iseq: IseqPtr) -> c_uint;
    pub fn rb_get_iseq_body_param_size(iseq: IseqPtr) -> c_uint;
    pub fn rb_get_iseq_body_param_lead_num(iseq: IseqPtr) -> c_int;
    pub fn rb_get_iseq_body_param_opt_num(iseq: IseqPtr) -> c_int;
    pub fn rb_get_iseq_body_param_opt_table(iseq: IseqPtr) -> *const VALUE;
    pub fn rb_get_iseq_body_stack_max(iseq: IseqPtr) -> c_uint;
    pub fn rb_get_iseq_body_local_iseq(iseq: IseqPtr) -> IseqPtr;
    pub fn rb_get_iseq_body_iseq_encoded(iseq: IseqPtr) -> *mut VALUE;
    pub fn rb_get_iseq_flags_has_opt(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_has_kw(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_has_rest(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_has_post(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_has_kwrest(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_has_block(iseq: IseqPtr) -> bool;
    pub fn rb_get_iseq_flags_accepts_no_kwarg(iseq: IseqPtr) -> bool;
    pub fn rb_leaf_builtin_function(iseq: IseqPtr) -> *const rb_builtin_function;
    pub fn rb_iseq_reset_jit_func(iseq: IseqPtr);
    pub fn rb_iseq_get_bbjit_payload(iseq: IseqPtr) -> *mut std::os::raw::c_void;
    pub fn rb_iseq_set_bbjit_payload(iseq: IseqPtr, payload: *mut std::os::raw::c_void);
    pub fn rb_bbjit_for_each_iseq(
        callback: Option<unsafe extern "C" fn(iseq: IseqPtr, data: *mut std::os::raw::c_void)>,
        data: *mut std::os::raw::c_void,
    );

    // Execution context and control frames
    pub fn rb_get_ec_cfp(ec: EcPtr) -> CfpPtr;
    pub fn rb_get_cfp_pc(cfp: CfpPtr) -> *mut VALUE;
    pub fn rb_get_cfp_sp(cfp: CfpPtr) -> *mut VALUE;
    pub fn rb_get_cfp_self(cfp: CfpPtr) -> VALUE;
    pub fn rb_get_cfp_ep(cfp: CfpPtr) -> *const VALUE;
    pub fn rb_get_cfp_iseq(cfp: CfpPtr) -> IseqPtr;
    pub fn rb_set_cfp_pc(cfp: CfpPtr, pc: *const VALUE);
    pub fn rb_set_cfp_sp(cfp: CfpPtr, sp: *mut VALUE);
    pub fn rb_vm_frame_method_entry(cfp: CfpPtr) -> *const rb_callable_method_entry_t;

    // Call site info
    pub fn rb_get_call_data_ci(cd: *const rb_call_data) -> *const rb_callinfo;
    pub fn rb_vm_ci_argc(ci: *const rb_callinfo) -> c_int;
    pub fn rb_vm_ci_mid(ci: *const rb_callinfo) -> ID;
    pub fn rb_vm_ci_flag(ci: *const rb_callinfo) -> c_uint;

    // Method entries
    pub fn rb_callable_method_entry(klass: VALUE, id: ID) -> *const rb_callable_method_entry_t;
    pub fn rb_aliased_callable_method_entry(
        me: *const rb_callable_method_entry_t,
    ) -> *const rb_callable_method_entry_t;
    pub fn rb_method_entry_at(obj: VALUE, id: ID) -> *const rb_callable_method_entry_t;
    pub fn rb_METHOD_ENTRY_VISI(me: *const rb_callable_method_entry_t) -> rb_method_visibility_t;
    pub fn rb_get_cme_def_type(cme: *const rb_callable_method_entry_t) -> rb_method_type_t;
    pub fn rb_get_cme_def_body_attr_id(cme: *const rb_callable_method_entry_t) -> ID;
    pub fn rb_get_cme_def_body_optimized_type(
        cme: *const rb_callable_method_entry_t,
    ) -> rb_optimized_method_type_t;
    pub fn rb_get_cme_def_body_optimized_index(cme: *const rb_callable_method_entry_t) -> c_uint;
    pub fn rb_get_cme_def_body_cfunc(
        cme: *const rb_callable_method_entry_t,
    ) -> *mut rb_method_cfunc_t;
    pub fn rb_get_def_method_serial(def: *const rb_method_definition_t) -> u64;
    pub fn rb_get_def_original_id(def: *const rb_method_definition_t) -> ID;
    pub fn rb_get_def_iseq_ptr(def: *const rb_method_definition_t) -> IseqPtr;
    pub fn rb_get_mct_argc(mct: *const rb_method_cfunc_t) -> c_int;
    pub fn rb_get_mct_func(mct: *const rb_method_cfunc_t) -> *const u8;

    // Object model
    pub fn rb_bbjit_class_of(obj: VALUE) -> VALUE;
    pub fn rb_obj_is_kind_of(obj: VALUE, klass: VALUE) -> VALUE;
    pub fn rb_attr_get(obj: VALUE, id: ID) -> VALUE;
    pub fn rb_singleton_class(klass: VALUE) -> VALUE;
    pub fn rb_intern(name: *const c_char) -> ID;
    pub fn rb_obj_info_dump(obj: VALUE);
    pub fn rb_obj_info(obj: VALUE) -> *const c_char;
    pub fn rb_class_get_superclass(klass: VALUE) -> VALUE;
    pub fn rb_RCLASS_ORIGIN(klass: VALUE) -> VALUE;
    pub fn rb_FL_TEST_RAW(obj: VALUE, flags: VALUE) -> VALUE;
    pub fn rb_RB_TYPE_P(obj: VALUE, t: ruby_value_type) -> bool;
    pub fn rb_BASIC_OP_UNREDEFINED_P(bop: ruby_basic_operators, klass: RedefinitionFlag) -> bool;
    pub fn rb_RSTRUCT_LEN(st: VALUE) -> i64;
    pub fn rb_RSTRUCT_SET(st: VALUE, k: c_int, v: VALUE);
    pub fn rb_IMEMO_TYPE_P(imemo: VALUE, imemo_type: imemo_type) -> c_int;
    pub fn rb_assert_iseq_handle(handle: VALUE);
    pub fn rb_assert_cme_handle(handle: VALUE);

    // Garbage collector
    pub fn rb_gc_mark(obj: VALUE);
    pub fn rb_gc_mark_movable(obj: VALUE);
    pub fn rb_gc_location(obj: VALUE) -> VALUE;

    // Runtime routines called from generated code or compile-time paths
    pub fn rb_ec_ary_new_from_values(ec: EcPtr, n: i64, elts: *const VALUE) -> VALUE;
    pub fn rb_ary_resurrect(ary: VALUE) -> VALUE;
    pub fn rb_ary_store(ary: VALUE, idx: i64, val: VALUE);
    pub fn rb_ary_clear(ary: VALUE) -> VALUE;
    pub fn rb_ary_tmp_new_from_values(flags: VALUE, n: i64, elts: *const VALUE) -> VALUE;
    pub fn rb_yarv_ary_entry_internal(ary: VALUE, offset: i64) -> VALUE;
    pub fn rb_hash_new() -> VALUE;
    pub fn rb_hash_new_with_size(size: u64) -> VALUE;
    pub fn rb_hash_resurrect(hash: VALUE) -> VALUE;
    pub fn rb_hash_bulk_insert(n: i64, elts: *const VALUE, hash: VALUE);
    pub fn rb_hash_aref(hash: VALUE, key: VALUE) -> VALUE;
    pub fn rb_hash_aset(hash: VALUE, key: VALUE, val: VALUE) -> VALUE;
    pub fn rb_yarv_str_eql_internal(str1: VALUE, str2: VALUE) -> VALUE;
    pub fn rb_ec_str_resurrect(ec: EcPtr, str: VALUE) -> VALUE;
    pub fn rb_str_concat_literals(n: size_t, strings: *const VALUE) -> VALUE;
    pub fn rb_str_intern(str: VALUE) -> VALUE;
    pub fn rb_str_bytesize(str: VALUE) -> VALUE;
    pub fn rb_str_dup(str: VALUE) -> VALUE;
    pub fn rb_str_append(dst: VALUE, src: VALUE) -> VALUE;
    pub fn rb_bbjit_str_simple_append(dst: VALUE, src: VALUE) -> VALUE;
    pub fn rb_obj_as_string_result(str: VALUE, obj: VALUE) -> VALUE;
    pub fn rb_range_new(low: VALUE, high: VALUE, flag: c_int) -> VALUE;
    pub fn rb_reg_new_ary(ary: VALUE, options: c_int) -> VALUE;
    pub fn rb_backref_get() -> VALUE;
    pub fn rb_reg_last_match(match_data: VALUE) -> VALUE;
    pub fn rb_reg_match_pre(match_data: VALUE) -> VALUE;
    pub fn rb_reg_match_post(match_data: VALUE) -> VALUE;
    pub fn rb_reg_match_last(match_data: VALUE) -> VALUE;
    pub fn rb_reg_nth_match(nth: c_int, match_data: VALUE) -> VALUE;
    pub fn rb_gvar_get(id: ID) -> VALUE;
    pub fn rb_gvar_set(id: ID, val: VALUE) -> VALUE;
    pub fn rb_ivar_get(obj: VALUE, id: ID) -> VALUE;
    pub fn rb_iv_index_tbl_lookup(
        iv_index_tbl: *mut st_table,
        id: ID,
        ent: *mut *const rb_iv_index_tbl_entry,
    ) -> bool;
    pub fn rb_bbjit_iv_index_tbl(obj: VALUE) -> *mut st_table;
    pub fn rb_vm_splat_array(flag: VALUE, ary: VALUE) -> VALUE;
    pub fn rb_vm_defined(
        ec: EcPtr,
        reg_cfp: CfpPtr,
        op_type: rb_num_t,
        obj: VALUE,
        v: VALUE,
    ) -> bool;
    pub fn rb_vm_setinstancevariable(
        iseq: IseqPtr,
        obj: VALUE,
        id: ID,
        val: VALUE,
        ic: *const std::os::raw::c_void,
    );
    pub fn rb_vm_opt_mod(recv: VALUE, obj: VALUE) -> VALUE;
    pub fn rb_vm_bh_to_procval(ec: EcPtr, block_handler: VALUE) -> VALUE;
    pub fn rb_vm_ic_hit_p(ic: IC, reg_ep: *const VALUE) -> bool;

    // bbjit glue compiled into the host
    pub fn rb_bbjit_reserve_addr_space(mem_size: u32) -> *mut u8;
    pub fn rb_bbjit_get_page_size() -> u32;
    pub fn rb_bbjit_mark_writable(mem_block: *mut std::os::raw::c_void, mem_size: u32) -> bool;
    pub fn rb_bbjit_mark_executable(mem_block: *mut std::os::raw::c_void, mem_size: u32);
    pub fn rb_bbjit_mark_unused(mem_block: *mut std::os::raw::c_void, mem_size: u32) -> bool;
    pub fn rb_bbjit_vm_lock_then_barrier(
        recursive_lock_level: *mut c_uint,
        file: *const c_char,
        line: c_int,
    );
    pub fn rb_bbjit_vm_unlock(
        recursive_lock_level: *mut c_uint,
        file: *const c_char,
        line: c_int,
    );
    pub fn rb_bbjit_obj_written(old: VALUE, young: VALUE, file: *const c_char, line: c_int);
    pub fn rb_bbjit_multi_ractor_p() -> bool;
    pub fn rb_bbjit_c_method_tracing_enabled(ec: EcPtr) -> bool;
    pub fn rb_bbjit_full_cfunc_return(ec: EcPtr, return_value: VALUE);
    pub fn rb_bug(message: *const c_char) -> !;
}

// Well-known class and module handles, plus the block parameter proxy
// singleton. These are GC roots and never move.
#[cfg(not(test))]
extern "C" {
    pub static mut rb_cBasicObject: VALUE;
    pub static mut rb_cModule: VALUE;
    pub static mut rb_cNilClass: VALUE;
    pub static mut rb_cTrueClass: VALUE;
    pub static mut rb_cFalseClass: VALUE;
    pub static mut rb_cInteger: VALUE;
    pub static mut rb_cFloat: VALUE;
    pub static mut rb_cSymbol: VALUE;
    pub static mut rb_cString: VALUE;
    pub static mut rb_cThread: VALUE;
    pub static mut rb_cArray: VALUE;
    pub static mut rb_cHash: VALUE;
    pub static mut rb_mKernel: VALUE;
    pub static mut rb_mRubyVMFrozenCore: VALUE;
    pub static mut rb_block_param_proxy: VALUE;
    pub static mut id__attached__: ID;
}

// Distinct heap-looking dummies so class comparisons stay meaningful in tests.
#[cfg(test)]
pub static mut rb_cBasicObject: VALUE = VALUE(0x1000);
#[cfg(test)]
pub static mut rb_cModule: VALUE = VALUE(0x1010);
#[cfg(test)]
pub static mut rb_cNilClass: VALUE = VALUE(0x1020);
#[cfg(test)]
pub static mut rb_cTrueClass: VALUE = VALUE(0x1030);
#[cfg(test)]
pub static mut rb_cFalseClass: VALUE = VALUE(0x1040);
#[cfg(test)]
pub static mut rb_cInteger: VALUE = VALUE(0x1050);
#[cfg(test)]
pub static mut rb_cFloat: VALUE = VALUE(0x1060);
#[cfg(test)]
pub static mut rb_cSymbol: VALUE = VALUE(0x1070);
#[cfg(test)]
pub static mut rb_cString: VALUE = VALUE(0x1080);
#[cfg(test)]
pub static mut rb_cThread: VALUE = VALUE(0x1090);
#[cfg(test)]
pub static mut rb_cArray: VALUE = VALUE(0x10a0);
#[cfg(test)]
pub static mut rb_cHash: VALUE = VALUE(0x10b0);
#[cfg(test)]
pub static mut rb_mKernel: VALUE = VALUE(0x10c0);
#[cfg(test)]
pub static mut rb_mRubyVMFrozenCore: VALUE = VALUE(0x10d0);
#[cfg(test)]
pub static mut rb_block_param_proxy: VALUE = VALUE(0x10e0);
#[cfg(test)]
pub static mut id__attached__: ID = 0;

// Renames so call sites read like the C they mirror
pub use rb_yarv_ary_entry_internal as rb_ary_entry_internal;
pub use rb_yarv_str_eql_internal as rb_str_eql_internal;
pub use rb_get_ec_cfp as get_ec_cfp;
pub use rb_get_cfp_pc as get_cfp_pc;
pub use rb_get_cfp_sp as get_cfp_sp;
pub use rb_get_cfp_self as get_cfp_self;
pub use rb_get_cfp_ep as get_cfp_ep;
pub use rb_get_cfp_iseq as get_cfp_iseq;
pub use rb_get_cme_def_type as get_cme_def_type;
pub use rb_get_cme_def_body_attr_id as get_cme_def_body_attr_id;
pub use rb_get_cme_def_body_optimized_type as get_cme_def_body_optimized_type;
pub use rb_get_cme_def_body_optimized_index as get_cme_def_body_optimized_index;
pub use rb_get_cme_def_body_cfunc as get_cme_def_body_cfunc;
pub use rb_get_def_method_serial as get_def_method_serial;
pub use rb_get_def_original_id as get_def_original_id;
pub use rb_get_def_iseq_ptr as get_def_iseq_ptr;
pub use rb_get_mct_argc as get_mct_argc;
pub use rb_get_mct_func as get_mct_func;
pub use rb_iseq_encoded_size as get_iseq_encoded_size;
pub use rb_get_iseq_body_local_table_size as get_iseq_body_local_table_size;
pub use rb_get_iseq_body_param_size as get_iseq_body_param_size;
pub use rb_get_iseq_body_param_lead_num as get_iseq_body_param_lead_num;
pub use rb_get_iseq_body_param_opt_num as get_iseq_body_param_opt_num;
pub use rb_get_iseq_body_param_opt_table as get_iseq_body_param_opt_table;
pub use rb_get_iseq_body_stack_max as get_iseq_body_stack_max;
pub use rb_get_iseq_body_local_iseq as get_iseq_body_local_iseq;
pub use rb_get_iseq_body_iseq_encoded as get_iseq_body_iseq_encoded;
pub use rb_get_iseq_flags_has_opt as get_iseq_flags_has_opt;
pub use rb_get_iseq_flags_has_kw as get_iseq_flags_has_kw;
pub use rb_get_iseq_flags_has_rest as get_iseq_flags_has_rest;
pub use rb_get_iseq_flags_has_post as get_iseq_flags_has_post;
pub use rb_get_iseq_flags_has_kwrest as get_iseq_flags_has_kwrest;
pub use rb_get_iseq_flags_has_block as get_iseq_flags_has_block;
pub use rb_get_iseq_flags_accepts_no_kwarg as get_iseq_flags_accepts_no_kwarg;
pub use rb_get_call_data_ci as get_call_data_ci;
pub use rb_vm_ci_argc as vm_ci_argc;
pub use rb_vm_ci_mid as vm_ci_mid;
pub use rb_vm_ci_flag as vm_ci_flag;
pub use rb_METHOD_ENTRY_VISI as METHOD_ENTRY_VISI;
pub use rb_FL_TEST_RAW as FL_TEST_RAW;
pub use rb_FL_TEST_RAW as FL_TEST;
pub use rb_RB_TYPE_P as RB_TYPE_P;
pub use rb_BASIC_OP_UNREDEFINED_P as BASIC_OP_UNREDEFINED_P;
pub use rb_RSTRUCT_LEN as RSTRUCT_LEN;
pub use rb_RSTRUCT_SET as RSTRUCT_SET;
pub use rb_RCLASS_ORIGIN as RCLASS_ORIGIN;

/// Owned Rust string for an opcode's name
#[cfg(not(test))]
pub fn insn_name(opcode: usize) -> String {
    unsafe {
        // Look up the host's NULL-terminated insn name string
        let op_name = rb_insn_name(VALUE(opcode));
        let op_name = CStr::from_ptr(op_name).to_str().unwrap();
        op_name.to_string()
    }
}

/// Avoid calling the host in `cargo test`
#[cfg(test)]
pub fn insn_name(opcode: usize) -> String {
    format!("insn_{}", opcode)
}

#[allow(unused_variables)]
pub fn insn_len(opcode: usize) -> u32 {
    #[cfg(test)]
    panic!("insn_len is a host VM function, and we don't link against the VM for Rust testing!");

    #[cfg(not(test))]
    unsafe {
        rb_insn_len(VALUE(opcode)).try_into().unwrap()
    }
}

/// Given an ISEQ pointer, convert PC to insn_idx
pub fn iseq_pc_to_insn_idx(iseq: IseqPtr, pc: *mut VALUE) -> Option<u32> {
    let pc_zero = unsafe { rb_iseq_pc_at_idx(iseq, 0) };
    unsafe { pc.offset_from(pc_zero) }.try_into().ok()
}

/// A Rust source location, passed to the C-side debug facilities.
/// Use the [src_loc!] macro to create an instance.
pub struct SourceLocation {
    pub file: &'static CStr,
    pub line: c_int,
}

/// Capture a [SourceLocation] here.
macro_rules! src_loc {
    () => {{
        // The literal is static and nul-terminated, so CStr conversion is safe.
        let file: &'static str = concat!(file!(), '\0');
        $crate::cruby::SourceLocation {
            file: unsafe { std::ffi::CStr::from_ptr(file.as_ptr().cast()) },
            line: line!().try_into().unwrap(),
        }
    }};
}
pub(crate) use src_loc;

/// Run the GC write barrier. Required after making a new edge in the object
/// reference graph from `old` to `young`.
macro_rules! obj_written {
    ($old: expr, $young: expr) => {
        let (old, young): (VALUE, VALUE) = ($old, $young);
        let src_loc = $crate::cruby::src_loc!();
        unsafe { rb_bbjit_obj_written(old, young, src_loc.file.as_ptr(), src_loc.line) };
    };
}
pub(crate) use obj_written;

/// Acquire the VM lock, make sure all other threads are asleep, then run
/// the closure while holding the lock. Returns the closure's result.
/// Use with [src_loc!].
///
/// Code patching with ractors live requires the lock.
#[cfg(not(test))]
pub fn with_vm_lock<F, R>(loc: SourceLocation, func: F) -> R
where
    F: FnOnce() -> R + UnwindSafe,
{
    let file = loc.file.as_ptr();
    let line = loc.line;
    let mut recursive_lock_level: c_uint = 0;

    unsafe { rb_bbjit_vm_lock_then_barrier(&mut recursive_lock_level, file, line) };

    let ret = match catch_unwind(func) {
        Ok(result) => result,
        Err(_) => {
            // Recovery might have been possible earlier; an unwind
            // that reaches the FFI boundary is not survivable.
            let _ = catch_unwind(|| {
                // Printing itself can panic.
                eprintln!(
                    "bbjit panicked while holding VM lock acquired at {}:{}. Aborting...",
                    loc.file.to_string_lossy(),
                    line,
                );
            });
            std::process::abort();
        }
    };

    unsafe { rb_bbjit_vm_unlock(&mut recursive_lock_level, file, line) };

    ret
}

/// There is no lock to take in tests; run the closure directly.
#[cfg(test)]
pub fn with_vm_lock<F, R>(_loc: SourceLocation, func: F) -> R
where
    F: FnOnce() -> R + UnwindSafe,
{
    func()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_tagging() {
        assert!(!Qnil.test());
        assert!(!Qfalse.test());
        assert!(Qtrue.test());

        assert!(Qnil.special_const_p());
        assert!(Qfalse.special_const_p());
        assert!(Qtrue.special_const_p());

        // Tagged fixnums
        let seven = VALUE::fixnum_from_usize(7);
        assert_eq!(seven.as_usize(), 15);
        assert!(seven.fixnum_p());
        assert!(!seven.flonum_p());
        assert!(seven.special_const_p());

        // A heap-looking pointer is none of the above
        let heap = VALUE(0x100020);
        assert!(!heap.special_const_p());
        assert!(!heap.fixnum_p());
    }

    #[test]
    fn test_fixnum_from_usize() {
        assert_eq!(VALUE::fixnum_from_usize(0), VALUE(1));
        assert_eq!(VALUE::fixnum_from_usize(1), VALUE(3));
    }
}
