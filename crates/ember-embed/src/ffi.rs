//! C API
//!
//! Exposes the embedding bridge to C hosts. The API follows these rules:
//! - only C-compatible types cross the boundary; runtimes, values and
//!   cached calls are opaque pointers
//! - fallible functions return a [`Status`], or NULL / `false` as a
//!   sentinel; output handles are set to NULL on failure
//! - the message of the last failure is kept on the runtime handle and
//!   read with `ember_last_error`
//! - every value handle is freed by the host with `ember_value_free`
//!
//! A runtime handle is single-threaded. In threaded mode the handle only
//! submits work: the `*mut EmberVM` passed to a `ember_thread_call_*`
//! function or to a native callback is a temporary view of the same
//! runtime, valid only until that function returns, and must never be
//! destroyed.

use crate::context::{GuestContext, MemberAccess};
use crate::coordinator::WorkerThread;
use crate::error::{EmbedError, Result, Status};
use crate::handle::ValueHandle;
use crate::introspect::{TypeInfo, TypeKind};
use crate::options::{IntegrationMode, ResolveStrategy, RuntimeOptions};
use crate::resolver::CachedCall;
use crate::runtime::{not_initialized, Runtime};
use ember_core::TypeTag;
use parking_lot::Mutex;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr;

// ============================================================================
// Opaque Types
// ============================================================================

/// Opaque handle to an embedded runtime
#[repr(C)]
pub struct EmberVM {
    _private: [u8; 0],
}

/// Opaque handle to a guest value
#[repr(C)]
pub struct EmberValue {
    _private: [u8; 0],
}

/// Opaque handle to a resolved static method
#[repr(C)]
pub struct EmberCachedCall {
    _private: [u8; 0],
}

/// Opaque snapshot of a class, see `ember_find_type`
#[repr(C)]
pub struct EmberTypeInfo {
    _private: [u8; 0],
}

/// Parameter and return types of typed callbacks
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmberType {
    /// No value (returns only)
    Void = 0,
    /// Any value
    Dynamic = 1,
    /// 32-bit integer
    Int = 2,
    /// 64-bit float
    Float = 3,
    /// 32-bit float
    Single = 4,
    /// Boolean
    Bool = 5,
    /// Guest string
    String = 6,
    /// Raw text
    Bytes = 7,
    /// Closure
    Function = 8,
}

impl From<EmberType> for TypeTag {
    fn from(ty: EmberType) -> Self {
        match ty {
            EmberType::Void => TypeTag::Void,
            EmberType::Dynamic => TypeTag::Dynamic,
            EmberType::Int => TypeTag::Int,
            EmberType::Float => TypeTag::Float,
            EmberType::Single => TypeTag::Single,
            EmberType::Bool => TypeTag::Bool,
            EmberType::String => TypeTag::String,
            EmberType::Bytes => TypeTag::Bytes,
            EmberType::Function => TypeTag::Function,
        }
    }
}

/// Heap statistics
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmberStats {
    /// Live heap objects
    pub live_objects: usize,
    /// Explicit roots, including rooted handles
    pub roots: usize,
    /// Completed collections
    pub collections: u64,
    /// Pending guest timers
    pub pending_events: usize,
}

/// Native callback. `argv` holds `argc` borrowed values, freed when the
/// callback returns. The callback returns a new value (or NULL for null)
/// whose ownership passes to the runtime, or one of the `argv` pointers
/// unchanged.
pub type EmberNativeCallback =
    extern "C" fn(vm: *mut EmberVM, argc: c_int, argv: *const *mut EmberValue, userdata: *mut c_void) -> *mut EmberValue;

/// Work submitted to the worker thread
pub type EmberThreadFn = extern "C" fn(vm: *mut EmberVM, userdata: *mut c_void);

/// Visitor for `ember_list_types`. `ty` is borrowed for the duration of
/// the call.
pub type EmberTypeCallback = extern "C" fn(ty: *const EmberTypeInfo, userdata: *mut c_void);

/// Reload notification; `changed` tells whether any code changed
pub type EmberReloadCallback = extern "C" fn(changed: bool, userdata: *mut c_void);

// Where the runtime behind a handle currently lives
enum Slot {
    Empty,
    Owned(Runtime),
    Worker(WorkerThread),
    // Runtime lent to a worker job; valid for the duration of the job
    Borrowed(*mut Runtime),
    // Callback context; valid for the duration of the callback
    Guest(*mut GuestContext<'static>),
}

// Internal representation of EmberTypeInfo: the snapshot plus the C
// strings handed out for it
struct TypeView {
    info: TypeInfo,
    name: CString,
    field_names: Vec<CString>,
    field_types: Vec<CString>,
    method_names: Vec<CString>,
}

impl TypeView {
    fn new(info: TypeInfo) -> Self {
        Self {
            name: c_string(&info.name),
            field_names: info.fields.iter().map(|f| c_string(&f.name)).collect(),
            field_types: info.fields.iter().map(|f| c_string(&f.type_name)).collect(),
            method_names: info.methods.iter().map(|m| c_string(&m.name)).collect(),
            info,
        }
    }

    fn into_raw(self) -> *mut EmberTypeInfo {
        Box::into_raw(Box::new(self)).cast()
    }
}

#[derive(Default)]
struct Diagnostics {
    error: Option<CString>,
    exception: Option<(CString, CString)>,
}

// Internal representation of EmberVM (not exposed to C)
struct VmHandle {
    slot: Slot,
    diag: Mutex<Diagnostics>,
}

// Host pointer carried into closures that run on other threads
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);

// SAFETY: the pointer is opaque to the bridge and only handed back to the
// host, which is responsible for its thread safety.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "\\0")).unwrap_or_default()
}

fn on_worker() -> EmbedError {
    EmbedError::WrongThread("the runtime is owned by its worker thread; submit work with ember_thread_call_sync".to_string())
}

impl VmHandle {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            diag: Mutex::new(Diagnostics::default()),
        }
    }

    fn as_vm(&mut self) -> *mut EmberVM {
        (self as *mut VmHandle).cast()
    }

    fn access(&mut self) -> Result<&mut dyn MemberAccess> {
        match &mut self.slot {
            Slot::Owned(rt) => Ok(rt),
            // SAFETY: borrowed slots only exist on the stack of the job or
            // callback that lent the pointer.
            Slot::Borrowed(rt) => Ok(unsafe { &mut **rt }),
            Slot::Guest(ctx) => Ok(unsafe { &mut **ctx }),
            Slot::Worker(_) => Err(on_worker()),
            Slot::Empty => Err(not_initialized()),
        }
    }

    fn runtime(&mut self) -> Result<&mut Runtime> {
        match &mut self.slot {
            Slot::Owned(rt) => Ok(rt),
            // SAFETY: see `access`.
            Slot::Borrowed(rt) => Ok(unsafe { &mut **rt }),
            Slot::Guest(_) => Err(EmbedError::InvalidArgument(
                "operation not available inside a native callback".to_string(),
            )),
            Slot::Worker(_) => Err(on_worker()),
            Slot::Empty => Err(not_initialized()),
        }
    }

    fn root(&mut self, value: &ValueHandle) -> Result<ValueHandle> {
        if let Slot::Guest(ctx) = self.slot {
            // SAFETY: see `access`.
            return unsafe { (*ctx).root(value) };
        }
        self.runtime()?.root(value)
    }

    fn is_temporary(&self) -> bool {
        matches!(self.slot, Slot::Borrowed(_) | Slot::Guest(_))
    }

    /// Forget the exception of the previous guest call
    fn begin_call(&self) {
        self.diag.lock().exception = None;
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        let mut diag = self.diag.lock();
        match &result {
            Ok(_) => diag.error = None,
            Err(err) => {
                if let EmbedError::Exception { message, stack } = err {
                    diag.exception = Some((c_string(message), c_string(stack)));
                }
                diag.error = Some(c_string(&err.to_string()));
            }
        }
        result
    }

    fn status<T>(&self, result: Result<T>) -> Status {
        match self.report(result) {
            Ok(_) => Status::Ok,
            Err(err) => err.status(),
        }
    }
}

unsafe fn vm_handle<'a>(vm: *mut EmberVM) -> Option<&'a mut VmHandle> {
    vm.cast::<VmHandle>().as_mut()
}

unsafe fn shared_handle<'a>(vm: *mut EmberVM) -> Option<&'a VmHandle> {
    vm.cast::<VmHandle>().as_ref()
}

unsafe fn text_arg<'a>(s: *const c_char, what: &'static str) -> Result<&'a str> {
    if s.is_null() {
        return Err(EmbedError::NullArgument(what));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| EmbedError::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

unsafe fn strings_arg<'a>(argc: c_int, argv: *const *const c_char) -> Result<Vec<&'a str>> {
    let count = usize::try_from(argc).map_err(|_| EmbedError::InvalidArgument(format!("negative argc {}", argc)))?;
    if count == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(EmbedError::NullArgument("argv"));
    }
    std::slice::from_raw_parts(argv, count)
        .iter()
        .map(|arg| text_arg(*arg, "argv element"))
        .collect()
}

fn into_value(handle: ValueHandle) -> *mut EmberValue {
    Box::into_raw(Box::new(handle)).cast()
}

unsafe fn value_ref<'a>(value: *const EmberValue) -> Option<&'a ValueHandle> {
    value.cast::<ValueHandle>().as_ref()
}

unsafe fn value_arg<'a>(value: *const EmberValue, what: &'static str) -> Result<&'a ValueHandle> {
    value_ref(value).ok_or(EmbedError::NullArgument(what))
}

unsafe fn args_arg<'a>(argc: c_int, argv: *const *mut EmberValue) -> Result<Vec<&'a ValueHandle>> {
    let count = usize::try_from(argc).map_err(|_| EmbedError::InvalidArgument(format!("negative argument count {}", argc)))?;
    if count == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(EmbedError::NullArgument("argv"));
    }
    std::slice::from_raw_parts(argv, count)
        .iter()
        .map(|arg| value_arg(*arg, "argv element"))
        .collect()
}

/// Store a call result in `out`, or NULL on failure
unsafe fn write_out(out: *mut *mut EmberValue, result: Result<ValueHandle>) -> Result<()> {
    match result {
        Ok(value) => {
            if !out.is_null() {
                *out = into_value(value);
            }
            Ok(())
        }
        Err(err) => {
            if !out.is_null() {
                *out = ptr::null_mut();
            }
            Err(err)
        }
    }
}

unsafe fn write_flag(out: *mut bool, result: Result<bool>) -> Result<()> {
    if !out.is_null() {
        *out = matches!(result, Ok(true));
    }
    result.map(|_| ())
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create a runtime configured from the `EMBER_*` environment variables
///
/// # Returns
/// * Non-null pointer to EmberVM. Nothing is allocated in the guest until
///   `ember_init()`.
///
/// # Safety
/// The returned runtime must be freed with `ember_vm_destroy()`
///
/// # Example (C)
/// ```c
/// EmberVM* vm = ember_vm_new();
/// const char* args[] = { "game" };
/// if (ember_init(vm, 1, args) != EMBER_OK
///     || ember_load_file(vm, "game.ebc") != EMBER_OK
///     || ember_run_entry(vm) != EMBER_OK) {
///     fprintf(stderr, "startup failed: %s\n", ember_last_error(vm));
/// }
/// ember_vm_destroy(vm);
/// ```
#[no_mangle]
pub extern "C" fn ember_vm_new() -> *mut EmberVM {
    new_vm(RuntimeOptions::from_env())
}

/// Create a runtime with an explicit integration mode and resolution
/// strategy; other options come from the environment
///
/// # Safety
/// The returned runtime must be freed with `ember_vm_destroy()`
#[no_mangle]
pub extern "C" fn ember_vm_new_with(mode: IntegrationMode, strategy: ResolveStrategy) -> *mut EmberVM {
    let options = RuntimeOptions {
        mode,
        strategy,
        ..RuntimeOptions::from_env()
    };
    new_vm(options)
}

fn new_vm(options: RuntimeOptions) -> *mut EmberVM {
    let handle = Box::new(VmHandle::new(Slot::Owned(Runtime::new(options))));
    Box::into_raw(handle).cast()
}

/// Destroy a runtime, stopping its worker thread first if one runs
///
/// # Safety
/// - `vm` must come from `ember_vm_new()` and must not be used afterwards
/// - temporary handles passed to callbacks and worker jobs are ignored
/// - NULL is ignored
#[no_mangle]
pub unsafe extern "C" fn ember_vm_destroy(vm: *mut EmberVM) {
    match shared_handle(vm) {
        None => return,
        Some(handle) if handle.is_temporary() => {
            log::warn!("ember_vm_destroy called on a temporary runtime handle; ignored");
            return;
        }
        Some(_) => {}
    }
    let handle = Box::from_raw(vm.cast::<VmHandle>());
    drop(handle);
}

/// Initialize the guest VM with program arguments
///
/// # Arguments
/// * `argc` - Number of entries in `argv`
/// * `argv` - Null-terminated UTF-8 strings; may be NULL when `argc` is 0
///
/// # Safety
/// `vm` must be valid; `argv` must hold `argc` valid strings
#[no_mangle]
pub unsafe extern "C" fn ember_init(vm: *mut EmberVM, argc: c_int, argv: *const *const c_char) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = strings_arg(argc, argv).and_then(|args| handle.runtime()?.initialize(&args));
    handle.status(result)
}

/// Load a program image from disk
///
/// # Safety
/// `vm` must be valid; `path` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn ember_load_file(vm: *mut EmberVM, path: *const c_char) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = text_arg(path, "path").and_then(|path| handle.runtime()?.load_file(Path::new(path)));
    handle.status(result)
}

/// Load a program image from memory
///
/// # Safety
/// `vm` must be valid; `data` must point to `length` readable bytes
#[no_mangle]
pub unsafe extern "C" fn ember_load_memory(vm: *mut EmberVM, data: *const u8, length: usize) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = if data.is_null() {
        Err(EmbedError::NullArgument("data"))
    } else {
        let bytes = std::slice::from_raw_parts(data, length);
        handle.runtime().and_then(|rt| rt.load_bytes(bytes))
    };
    handle.status(result)
}

/// Run static initializers and the entry point. In threaded mode use
/// `ember_thread_start()` instead.
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_run_entry(vm: *mut EmberVM) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = handle.runtime().and_then(Runtime::run_entry);
    handle.status(result)
}

/// Whether a program is loaded
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_is_loaded(vm: *mut EmberVM) -> bool {
    vm_handle(vm)
        .and_then(|handle| handle.runtime().ok())
        .map(|rt| rt.is_loaded())
        .unwrap_or(false)
}

/// Run a full collection
///
/// # Arguments
/// * `freed` - Optional pointer receiving the number of objects freed
///
/// # Safety
/// `vm` must be valid; `freed` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_collect_garbage(vm: *mut EmberVM, freed: *mut usize) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = handle.runtime().and_then(Runtime::collect_garbage);
    if let (Ok(count), false) = (&result, freed.is_null()) {
        *freed = *count;
    }
    handle.status(result)
}

/// Fill `out` with heap statistics
///
/// # Safety
/// `vm` and `out` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_stats(vm: *mut EmberVM, out: *mut EmberStats) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = if out.is_null() {
        Err(EmbedError::NullArgument("out"))
    } else {
        handle.runtime().and_then(|rt| rt.stats().ok_or_else(not_initialized))
    };
    if let Ok(stats) = &result {
        *out = EmberStats {
            live_objects: stats.live_objects,
            roots: stats.roots,
            collections: stats.gc.collections,
            pending_events: stats.pending_events,
        };
    }
    handle.status(result)
}

// ============================================================================
// Value Functions
// ============================================================================

/// Box a 32-bit integer
#[no_mangle]
pub extern "C" fn ember_value_int(value: i32) -> *mut EmberValue {
    into_value(ValueHandle::int(value))
}

/// Box a 64-bit float
#[no_mangle]
pub extern "C" fn ember_value_float(value: f64) -> *mut EmberValue {
    into_value(ValueHandle::float(value))
}

/// Box a 32-bit float
#[no_mangle]
pub extern "C" fn ember_value_single(value: f32) -> *mut EmberValue {
    into_value(ValueHandle::single(value))
}

/// Box a boolean
#[no_mangle]
pub extern "C" fn ember_value_bool(value: bool) -> *mut EmberValue {
    into_value(ValueHandle::bool(value))
}

/// Null value
#[no_mangle]
pub extern "C" fn ember_value_null() -> *mut EmberValue {
    into_value(ValueHandle::null())
}

/// Box a UTF-8 string as guest text. The handle is not rooted: pass it to a
/// call before allocating anything else.
///
/// # Returns
/// * NULL on failure (check `ember_last_error()`)
///
/// # Safety
/// `vm` must be valid; `text` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn ember_value_string(vm: *mut EmberVM, text: *const c_char) -> *mut EmberValue {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = text_arg(text, "text").and_then(|text| handle.access()?.box_string(text));
    handle.report(result).map(into_value).unwrap_or(ptr::null_mut())
}

/// Integer content, or `default` for non-numeric values
///
/// # Safety
/// `value` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_value_as_int(value: *const EmberValue, default: i32) -> i32 {
    value_ref(value).map(|v| v.as_int(default)).unwrap_or(default)
}

/// Float content, or `default` for non-numeric values
///
/// # Safety
/// `value` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_value_as_float(value: *const EmberValue, default: f64) -> f64 {
    value_ref(value).map(|v| v.as_float(default)).unwrap_or(default)
}

/// Single-precision content, or `default` for non-numeric values
///
/// # Safety
/// `value` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_value_as_single(value: *const EmberValue, default: f32) -> f32 {
    value_ref(value).map(|v| v.as_single(default)).unwrap_or(default)
}

/// Boolean content, or `default` for non-boolean values
///
/// # Safety
/// `value` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_value_as_bool(value: *const EmberValue, default: bool) -> bool {
    value_ref(value).map(|v| v.as_bool(default)).unwrap_or(default)
}

/// Copy of the text of a guest string
///
/// # Returns
/// * New string to release with `ember_string_free()`
/// * NULL when `value` is not a string
///
/// # Safety
/// `vm` and `value` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_value_as_string(vm: *mut EmberVM, value: *const EmberValue) -> *mut c_char {
    let (Some(handle), Some(value)) = (vm_handle(vm), value_ref(value)) else {
        return ptr::null_mut();
    };
    handle
        .access()
        .ok()
        .and_then(|access| access.as_string(value))
        .map(|text| c_string(&text).into_raw())
        .unwrap_or(ptr::null_mut())
}

/// Free a string returned by `ember_value_as_string()`
///
/// # Safety
/// `s` must come from `ember_value_as_string()` or be NULL
#[no_mangle]
pub unsafe extern "C" fn ember_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    drop(CString::from_raw(s));
}

/// Whether the value is null. A NULL pointer counts as null.
///
/// # Safety
/// `value` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_value_is_null(value: *const EmberValue) -> bool {
    value_ref(value).map(ValueHandle::is_null).unwrap_or(true)
}

/// Root a value so it survives collections until freed
///
/// # Returns
/// * New rooted handle; the original stays valid and must be freed too
/// * NULL on failure
///
/// # Safety
/// `vm` and `value` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_value_root(vm: *mut EmberVM, value: *const EmberValue) -> *mut EmberValue {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = value_arg(value, "value").and_then(|value| handle.root(value));
    handle.report(result).map(into_value).unwrap_or(ptr::null_mut())
}

/// Free a value handle, releasing its root
///
/// # Safety
/// `value` must come from this API and must not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn ember_value_free(value: *mut EmberValue) {
    if value.is_null() {
        return;
    }
    drop(Box::from_raw(value.cast::<ValueHandle>()));
}

// ============================================================================
// Member Access
// ============================================================================

/// Read a static field
///
/// # Returns
/// * New value handle, NULL on failure
///
/// # Safety
/// `vm` must be valid; names must be valid null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn ember_get_static_field(
    vm: *mut EmberVM,
    type_name: *const c_char,
    field: *const c_char,
) -> *mut EmberValue {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = (|| {
        let type_name = text_arg(type_name, "type_name")?;
        let field = text_arg(field, "field")?;
        handle.access()?.get_static_field(type_name, field)
    })();
    handle.report(result).map(into_value).unwrap_or(ptr::null_mut())
}

/// Write a static field
///
/// # Safety
/// `vm` and `value` must be valid; names must be valid null-terminated
/// strings
#[no_mangle]
pub unsafe extern "C" fn ember_set_static_field(
    vm: *mut EmberVM,
    type_name: *const c_char,
    field: *const c_char,
    value: *const EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let type_name = text_arg(type_name, "type_name")?;
        let field = text_arg(field, "field")?;
        let value = value_arg(value, "value")?;
        handle.access()?.set_static_field(type_name, field, value)
    })();
    handle.status(result)
}

/// Call a static method by name
///
/// # Arguments
/// * `argc`, `argv` - Arguments; `argv` may be NULL when `argc` is 0
/// * `out` - Optional pointer receiving the result; set to NULL on failure
///
/// # Safety
/// `vm` must be valid; `argv` must hold `argc` valid values
///
/// # Example (C)
/// ```c
/// EmberValue* points = ember_value_int(100);
/// EmberValue* result = NULL;
/// if (ember_call_static(vm, "Game", "addPoints", 1, &points, &result) == EMBER_EXCEPTION_THROWN) {
///     fprintf(stderr, "%s\n%s\n", ember_exception_message(vm), ember_exception_stack(vm));
/// }
/// ember_value_free(points);
/// ember_value_free(result);
/// ```
#[no_mangle]
pub unsafe extern "C" fn ember_call_static(
    vm: *mut EmberVM,
    type_name: *const c_char,
    method: *const c_char,
    argc: c_int,
    argv: *const *mut EmberValue,
    out: *mut *mut EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let type_name = text_arg(type_name, "type_name")?;
        let method = text_arg(method, "method")?;
        let args = args_arg(argc, argv)?;
        handle.access()?.call_static(type_name, method, &args)
    })();
    let result = write_out(out, result);
    handle.status(result)
}

/// Construct an instance. The result is rooted until freed.
///
/// # Safety
/// As for `ember_call_static()`
#[no_mangle]
pub unsafe extern "C" fn ember_new_instance(
    vm: *mut EmberVM,
    type_name: *const c_char,
    argc: c_int,
    argv: *const *mut EmberValue,
    out: *mut *mut EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let type_name = text_arg(type_name, "type_name")?;
        let args = args_arg(argc, argv)?;
        handle.access()?.new_instance(type_name, &args)
    })();
    let result = write_out(out, result);
    handle.status(result)
}

/// Read an instance field
///
/// # Returns
/// * New value handle, NULL on failure
///
/// # Safety
/// `vm` and `object` must be valid; `field` must be a valid string
#[no_mangle]
pub unsafe extern "C" fn ember_get_field(
    vm: *mut EmberVM,
    object: *const EmberValue,
    field: *const c_char,
) -> *mut EmberValue {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = (|| {
        let object = value_arg(object, "object")?;
        let field = text_arg(field, "field")?;
        handle.access()?.get_field(object, field)
    })();
    handle.report(result).map(into_value).unwrap_or(ptr::null_mut())
}

/// Write an instance field
///
/// # Safety
/// `vm`, `object` and `value` must be valid; `field` must be a valid string
#[no_mangle]
pub unsafe extern "C" fn ember_set_field(
    vm: *mut EmberVM,
    object: *const EmberValue,
    field: *const c_char,
    value: *const EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let object = value_arg(object, "object")?;
        let field = text_arg(field, "field")?;
        let value = value_arg(value, "value")?;
        handle.access()?.set_field(object, field, value)
    })();
    handle.status(result)
}

/// Call an instance method
///
/// # Safety
/// As for `ember_call_static()`; `object` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_call_method(
    vm: *mut EmberVM,
    object: *const EmberValue,
    method: *const c_char,
    argc: c_int,
    argv: *const *mut EmberValue,
    out: *mut *mut EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let object = value_arg(object, "object")?;
        let method = text_arg(method, "method")?;
        let args = args_arg(argc, argv)?;
        handle.access()?.call_method(object, method, &args)
    })();
    let result = write_out(out, result);
    handle.status(result)
}

/// Call a closure value
///
/// # Safety
/// As for `ember_call_static()`; `closure` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_call_closure(
    vm: *mut EmberVM,
    closure: *const EmberValue,
    argc: c_int,
    argv: *const *mut EmberValue,
    out: *mut *mut EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let closure = value_arg(closure, "closure")?;
        let args = args_arg(argc, argv)?;
        handle.access()?.call_closure(closure, &args)
    })();
    let result = write_out(out, result);
    handle.status(result)
}

/// Whether `object` is an instance of `type_name` or one of its subclasses
///
/// # Safety
/// `vm` and `object` must be valid; `type_name` must be a valid string
#[no_mangle]
pub unsafe extern "C" fn ember_is_instance_of(
    vm: *mut EmberVM,
    object: *const EmberValue,
    type_name: *const c_char,
) -> bool {
    let (Some(handle), Some(object)) = (vm_handle(vm), value_ref(object)) else {
        return false;
    };
    match (text_arg(type_name, "type_name"), handle.access()) {
        (Ok(type_name), Ok(access)) => access.is_instance_of(object, type_name),
        _ => false,
    }
}

// ============================================================================
// Cached Calls
// ============================================================================

/// Resolve a static method once for repeated calls
///
/// # Returns
/// * Handle to free with `ember_cached_call_free()`, NULL on failure
///
/// # Safety
/// `vm` must be valid; names must be valid null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn ember_cache_static_method(
    vm: *mut EmberVM,
    type_name: *const c_char,
    method: *const c_char,
) -> *mut EmberCachedCall {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = (|| {
        let type_name = text_arg(type_name, "type_name")?;
        let method = text_arg(method, "method")?;
        handle.runtime()?.cache_static_method(type_name, method)
    })();
    handle
        .report(result)
        .map(|call| Box::into_raw(Box::new(call)).cast())
        .unwrap_or(ptr::null_mut())
}

/// Call a cached static method. Calls cached before a reload are resolved
/// again by name; a call cached on another VM fails with `TypeMismatch`.
///
/// # Safety
/// As for `ember_call_static()`; `call` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_call_cached(
    vm: *mut EmberVM,
    call: *const EmberCachedCall,
    argc: c_int,
    argv: *const *mut EmberValue,
    out: *mut *mut EmberValue,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = (|| {
        let call = call.cast::<CachedCall>().as_ref().ok_or(EmbedError::NullArgument("call"))?;
        let args = args_arg(argc, argv)?;
        handle.runtime()?.call_cached(call, &args)
    })();
    let result = write_out(out, result);
    handle.status(result)
}

/// Free a cached call
///
/// # Safety
/// `call` must come from `ember_cache_static_method()` or be NULL
#[no_mangle]
pub unsafe extern "C" fn ember_cached_call_free(call: *mut EmberCachedCall) {
    if call.is_null() {
        return;
    }
    drop(Box::from_raw(call.cast::<CachedCall>()));
}

// ============================================================================
// Callbacks
// ============================================================================

unsafe fn run_native(
    func: EmberNativeCallback,
    userdata: *mut c_void,
    ctx: &mut GuestContext<'_>,
    args: &[ValueHandle],
) -> Result<ValueHandle> {
    let mut scratch = VmHandle::new(Slot::Guest((ctx as *mut GuestContext<'_>).cast()));
    let argv: Vec<*mut EmberValue> = args.iter().map(|arg| into_value(arg.share())).collect();
    let argc = c_int::try_from(argv.len()).unwrap_or(c_int::MAX);
    let ret = func(scratch.as_vm(), argc, argv.as_ptr(), userdata);
    let result = if ret.is_null() {
        ValueHandle::null()
    } else if let Some(i) = argv.iter().position(|&arg| arg == ret) {
        // Returning an argument hands back a borrowed value
        args[i].share()
    } else {
        *Box::from_raw(ret.cast::<ValueHandle>())
    };
    for arg in argv {
        ember_value_free(arg);
    }
    Ok(result)
}

/// Register a native callback the guest can call as `name`
///
/// # Arguments
/// * `arity` - Number of arguments, 0 to 4
/// * `userdata` - Passed back to every invocation
///
/// # Safety
/// `vm` must be valid; `name` must be a valid string; `userdata` must stay
/// valid until the callback is unregistered or the runtime destroyed
///
/// # Example (C)
/// ```c
/// static EmberValue* twice(EmberVM* vm, int argc, EmberValue* const* argv, void* ud) {
///     return ember_value_int(ember_value_as_int(argv[0], 0) * 2);
/// }
/// ember_register_callback(vm, "double", twice, 1, NULL);
/// ```
#[no_mangle]
pub unsafe extern "C" fn ember_register_callback(
    vm: *mut EmberVM,
    name: *const c_char,
    func: Option<EmberNativeCallback>,
    arity: c_int,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let userdata = SendPtr(userdata);
    let result = (|| {
        let name = text_arg(name, "name")?;
        let func = func.ok_or(EmbedError::NullArgument("func"))?;
        let arity = usize::try_from(arity).map_err(|_| EmbedError::InvalidArgument(format!("negative arity {}", arity)))?;
        handle
            .runtime()?
            .register_callback(name, arity, move |ctx, args| run_native(func, userdata.get(), ctx, args))
    })();
    handle.status(result)
}

/// Register a native callback with declared parameter and return types.
/// Arguments are checked before the callback runs.
///
/// # Safety
/// As for `ember_register_callback()`; `params` must hold `param_count`
/// entries
#[no_mangle]
pub unsafe extern "C" fn ember_register_typed_callback(
    vm: *mut EmberVM,
    name: *const c_char,
    func: Option<EmberNativeCallback>,
    params: *const EmberType,
    param_count: c_int,
    ret: EmberType,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let userdata = SendPtr(userdata);
    let result = (|| {
        let name = text_arg(name, "name")?;
        let func = func.ok_or(EmbedError::NullArgument("func"))?;
        let count = usize::try_from(param_count)
            .map_err(|_| EmbedError::InvalidArgument(format!("negative parameter count {}", param_count)))?;
        let params: Vec<TypeTag> = match count {
            0 => Vec::new(),
            _ if params.is_null() => return Err(EmbedError::NullArgument("params")),
            _ => std::slice::from_raw_parts(params, count).iter().map(|ty| TypeTag::from(*ty)).collect(),
        };
        handle
            .runtime()?
            .register_typed_callback(name, &params, ret.into(), move |ctx, args| {
                run_native(func, userdata.get(), ctx, args)
            })
    })();
    handle.status(result)
}

/// Remove a registered callback
///
/// # Safety
/// `vm` must be valid; `name` must be a valid string
#[no_mangle]
pub unsafe extern "C" fn ember_unregister_callback(vm: *mut EmberVM, name: *const c_char) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = text_arg(name, "name").and_then(|name| handle.runtime()?.unregister_callback(name));
    handle.status(result)
}

/// Guest closure of a registered callback, for passing to guest code
///
/// # Returns
/// * New value handle, NULL when no callback has that name
///
/// # Safety
/// `vm` must be valid; `name` must be a valid string
#[no_mangle]
pub unsafe extern "C" fn ember_get_callback(vm: *mut EmberVM, name: *const c_char) -> *mut EmberValue {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = text_arg(name, "name").and_then(|name| handle.runtime()?.callback(name));
    handle.report(result).map(into_value).unwrap_or(ptr::null_mut())
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Message of the last failed operation on this handle, or NULL. Valid
/// until the next call on the handle.
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_last_error(vm: *mut EmberVM) -> *const c_char {
    shared_handle(vm)
        .and_then(|handle| handle.diag.lock().error.as_ref().map(|e| e.as_ptr()))
        .unwrap_or(ptr::null())
}

/// Message of the pending guest exception, or NULL
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_exception_message(vm: *mut EmberVM) -> *const c_char {
    shared_handle(vm)
        .and_then(|handle| handle.diag.lock().exception.as_ref().map(|(message, _)| message.as_ptr()))
        .unwrap_or(ptr::null())
}

/// Stack trace of the pending guest exception, one frame per line, or NULL
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_exception_stack(vm: *mut EmberVM) -> *const c_char {
    shared_handle(vm)
        .and_then(|handle| handle.diag.lock().exception.as_ref().map(|(_, stack)| stack.as_ptr()))
        .unwrap_or(ptr::null())
}

/// Whether a guest exception is pending
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_has_exception(vm: *mut EmberVM) -> bool {
    shared_handle(vm)
        .map(|handle| handle.diag.lock().exception.is_some())
        .unwrap_or(false)
}

/// Forget the pending guest exception
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_clear_exception(vm: *mut EmberVM) {
    let Some(handle) = vm_handle(vm) else {
        return;
    };
    handle.begin_call();
    if let Ok(rt) = handle.runtime() {
        rt.clear_exception();
    }
}

/// Static description of a status code
#[no_mangle]
pub extern "C" fn ember_status_string(status: Status) -> *const c_char {
    status.message().as_ptr()
}

/// Library version
#[no_mangle]
pub extern "C" fn ember_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr().cast()
}

// ============================================================================
// Type Introspection
// ============================================================================

unsafe fn type_ref<'a>(ty: *const EmberTypeInfo) -> Option<&'a TypeView> {
    ty.cast::<TypeView>().as_ref()
}

fn c_index(index: c_int) -> Option<usize> {
    usize::try_from(index).ok()
}

fn c_count(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(c_int::MAX)
}

/// Look up a class by name
///
/// # Returns
/// * New type snapshot, freed with `ember_type_free()`
/// * NULL on failure (see `ember_last_error()`)
///
/// # Safety
/// `vm` must be valid; `name` must be a valid C string
#[no_mangle]
pub unsafe extern "C" fn ember_find_type(vm: *mut EmberVM, name: *const c_char) -> *mut EmberTypeInfo {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = text_arg(name, "name").and_then(|name| handle.runtime()?.find_type(name));
    handle
        .report(result)
        .map(|info| TypeView::new(info).into_raw())
        .unwrap_or(ptr::null_mut())
}

/// Call `callback` once per class of the loaded program, in type table order
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_list_types(
    vm: *mut EmberVM,
    callback: Option<EmberTypeCallback>,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = callback
        .ok_or(EmbedError::NullArgument("callback"))
        .and_then(|callback| Ok((callback, handle.runtime()?.list_types()?)));
    let result = result.map(|(callback, types)| {
        for info in types {
            let view = TypeView::new(info);
            callback((&view as *const TypeView).cast(), userdata);
        }
    });
    handle.status(result)
}

/// Free a type snapshot
///
/// # Safety
/// `ty` must come from `ember_find_type()` / `ember_class_get_super()` or
/// be NULL
#[no_mangle]
pub unsafe extern "C" fn ember_type_free(ty: *mut EmberTypeInfo) {
    if ty.is_null() {
        return;
    }
    drop(Box::from_raw(ty.cast::<TypeView>()));
}

/// Kind of a class: `String` for the builtin string class, else `Object`.
/// `Void` for NULL.
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_type_get_kind(ty: *const EmberTypeInfo) -> TypeKind {
    type_ref(ty).map(|view| view.info.kind).unwrap_or(TypeKind::Void)
}

/// Class name, valid until the snapshot is freed; NULL for NULL
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_type_get_name(ty: *const EmberTypeInfo) -> *const c_char {
    type_ref(ty).map(|view| view.name.as_ptr()).unwrap_or(ptr::null())
}

/// Parent class of `ty`
///
/// # Returns
/// * New type snapshot, freed with `ember_type_free()`
/// * NULL for a root class (status cleared) or on failure
///
/// # Safety
/// `vm` and `ty` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_super(vm: *mut EmberVM, ty: *const EmberTypeInfo) -> *mut EmberTypeInfo {
    let Some(handle) = vm_handle(vm) else {
        return ptr::null_mut();
    };
    let result = type_ref(ty)
        .ok_or(EmbedError::NullArgument("ty"))
        .and_then(|view| handle.runtime()?.superclass(&view.info));
    handle
        .report(result)
        .ok()
        .flatten()
        .map(|info| TypeView::new(info).into_raw())
        .unwrap_or(ptr::null_mut())
}

/// Number of instance fields declared on the class itself; -1 for NULL
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_field_count(ty: *const EmberTypeInfo) -> c_int {
    type_ref(ty).map(|view| c_count(view.field_names.len())).unwrap_or(-1)
}

/// Name of a declared field; NULL when out of range
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_field_name(ty: *const EmberTypeInfo, index: c_int) -> *const c_char {
    type_ref(ty)
        .zip(c_index(index))
        .and_then(|(view, i)| view.field_names.get(i))
        .map(|name| name.as_ptr())
        .unwrap_or(ptr::null())
}

/// Declared type of a field as text (`int`, `String`, a class name); NULL
/// when out of range
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_field_type(ty: *const EmberTypeInfo, index: c_int) -> *const c_char {
    type_ref(ty)
        .zip(c_index(index))
        .and_then(|(view, i)| view.field_types.get(i))
        .map(|name| name.as_ptr())
        .unwrap_or(ptr::null())
}

/// Kind of a field's declared type; `Void` when out of range
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_field_kind(ty: *const EmberTypeInfo, index: c_int) -> TypeKind {
    type_ref(ty)
        .zip(c_index(index))
        .and_then(|(view, i)| view.info.fields.get(i))
        .map(|field| field.kind())
        .unwrap_or(TypeKind::Void)
}

/// Number of methods declared on the class itself; -1 for NULL
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_method_count(ty: *const EmberTypeInfo) -> c_int {
    type_ref(ty).map(|view| c_count(view.method_names.len())).unwrap_or(-1)
}

/// Name of a declared method; NULL when out of range
///
/// # Safety
/// `ty` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_class_get_method_name(ty: *const EmberTypeInfo, index: c_int) -> *const c_char {
    type_ref(ty)
        .zip(c_index(index))
        .and_then(|(view, i)| view.method_names.get(i))
        .map(|name| name.as_ptr())
        .unwrap_or(ptr::null())
}

// ============================================================================
// Integration Modes
// ============================================================================

/// Change the integration mode; only before the entry point runs
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_set_mode(vm: *mut EmberVM, mode: IntegrationMode) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = handle.runtime().and_then(|rt| rt.set_mode(mode));
    handle.status(result)
}

/// Advance guest time and run due timers (direct mode)
///
/// # Arguments
/// * `delta_seconds` - Elapsed time, non-negative
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_update(vm: *mut EmberVM, delta_seconds: f32) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = handle.runtime().and_then(|rt| rt.update(delta_seconds));
    handle.status(result)
}

/// Whether guest timers are queued
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_has_pending_work(vm: *mut EmberVM) -> bool {
    vm_handle(vm)
        .and_then(|handle| handle.runtime().ok())
        .map(|rt| rt.has_pending_work())
        .unwrap_or(false)
}

/// Move the runtime to a worker thread and run the entry point there.
/// Blocks until the entry point finished.
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_thread_start(vm: *mut EmberVM) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    handle.begin_call();
    let result = match std::mem::replace(&mut handle.slot, Slot::Empty) {
        Slot::Owned(runtime) => match WorkerThread::start(runtime) {
            Ok(worker) => {
                handle.slot = Slot::Worker(worker);
                Ok(())
            }
            Err(failure) => {
                if let Some(runtime) = failure.runtime {
                    handle.slot = Slot::Owned(runtime);
                }
                Err(failure.error)
            }
        },
        other => {
            let err = match &other {
                Slot::Worker(_) => EmbedError::ThreadAlreadyRunning,
                Slot::Empty => not_initialized(),
                _ => EmbedError::WrongThread("cannot start a worker from inside the runtime".to_string()),
            };
            handle.slot = other;
            Err(err)
        }
    };
    handle.status(result)
}

/// Stop the worker thread and return the runtime to the handle. Queued
/// work is dropped.
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_thread_stop(vm: *mut EmberVM) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = match std::mem::replace(&mut handle.slot, Slot::Empty) {
        Slot::Worker(worker) => worker.stop().map(|runtime| handle.slot = Slot::Owned(runtime)),
        other => {
            let err = match &other {
                Slot::Borrowed(_) | Slot::Guest(_) => {
                    EmbedError::WrongThread("the worker cannot stop itself".to_string())
                }
                _ => EmbedError::ThreadNotRunning("no worker thread started".to_string()),
            };
            handle.slot = other;
            Err(err)
        }
    };
    handle.status(result)
}

/// Whether the worker thread is serving calls
///
/// # Safety
/// `vm` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_thread_is_running(vm: *mut EmberVM) -> bool {
    match shared_handle(vm).map(|handle| &handle.slot) {
        Some(Slot::Worker(worker)) => worker.is_running(),
        _ => false,
    }
}

fn run_job(runtime: &mut Runtime, func: EmberThreadFn, userdata: *mut c_void) {
    let mut scratch = VmHandle::new(Slot::Borrowed(runtime));
    func(scratch.as_vm(), userdata);
}

/// Run `func` on the worker thread and wait until it returned. `func`
/// receives a temporary runtime handle usable for any call.
///
/// May be called from any thread except the worker.
///
/// # Safety
/// `vm` must be valid; `userdata` must be usable from the worker thread
#[no_mangle]
pub unsafe extern "C" fn ember_thread_call_sync(
    vm: *mut EmberVM,
    func: Option<EmberThreadFn>,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = shared_handle(vm) else {
        return Status::NullArgument;
    };
    let userdata = SendPtr(userdata);
    let result = match (&handle.slot, func) {
        (_, None) => Err(EmbedError::NullArgument("func")),
        (Slot::Worker(worker), Some(func)) => worker.call_sync(move |rt| run_job(rt, func, userdata.get())),
        _ => Err(EmbedError::ThreadNotRunning("no worker thread started".to_string())),
    };
    handle.status(result)
}

/// Queue `func` on the worker thread without waiting. `on_done`, if given,
/// runs on the worker right after `func`.
///
/// # Safety
/// As for `ember_thread_call_sync()`; `userdata` must stay valid until
/// `on_done` ran
#[no_mangle]
pub unsafe extern "C" fn ember_thread_call_async(
    vm: *mut EmberVM,
    func: Option<EmberThreadFn>,
    on_done: Option<EmberThreadFn>,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = shared_handle(vm) else {
        return Status::NullArgument;
    };
    let userdata = SendPtr(userdata);
    let result = match (&handle.slot, func) {
        (_, None) => Err(EmbedError::NullArgument("func")),
        (Slot::Worker(worker), Some(func)) => worker.call_async(
            move |rt| run_job(rt, func, userdata.get()),
            move |rt, ()| {
                if let Some(on_done) = on_done {
                    run_job(rt, on_done, userdata.get());
                }
            },
        ),
        _ => Err(EmbedError::ThreadNotRunning("no worker thread started".to_string())),
    };
    handle.status(result)
}

// ============================================================================
// Hot Reload
// ============================================================================

/// Enable hot reload; only before a program is loaded
///
/// # Safety
/// `vm` must be valid
#[no_mangle]
pub unsafe extern "C" fn ember_enable_hot_reload(vm: *mut EmberVM, enable: bool) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = handle.runtime().and_then(|rt| rt.enable_hot_reload(enable));
    handle.status(result)
}

/// Patch the running program from a file
///
/// # Arguments
/// * `path` - Program image, or NULL for the file originally loaded
/// * `changed` - Optional pointer receiving whether any code changed
///
/// # Safety
/// `vm` must be valid; `path` and `changed` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_reload_file(vm: *mut EmberVM, path: *const c_char, changed: *mut bool) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = (|| {
        let path = if path.is_null() {
            None
        } else {
            Some(Path::new(text_arg(path, "path")?))
        };
        handle.runtime()?.reload_file(path)
    })();
    let result = write_flag(changed, result);
    handle.status(result)
}

/// Patch the running program from an in-memory image
///
/// # Safety
/// `vm` must be valid; `data` must point to `length` readable bytes;
/// `changed` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_reload_memory(
    vm: *mut EmberVM,
    data: *const u8,
    length: usize,
    changed: *mut bool,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = if data.is_null() {
        Err(EmbedError::NullArgument("data"))
    } else {
        let bytes = std::slice::from_raw_parts(data, length);
        handle.runtime().and_then(|rt| rt.reload_bytes(bytes))
    };
    let result = write_flag(changed, result);
    handle.status(result)
}

/// Set the function called after every successful reload; NULL removes it
///
/// # Safety
/// `vm` must be valid; `userdata` must stay valid while the callback is set
#[no_mangle]
pub unsafe extern "C" fn ember_set_reload_callback(
    vm: *mut EmberVM,
    callback: Option<EmberReloadCallback>,
    userdata: *mut c_void,
) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let userdata = SendPtr(userdata);
    let result = handle.runtime().map(|rt| match callback {
        Some(callback) => rt.set_reload_callback(move |changed| callback(changed, userdata.get())),
        None => rt.clear_reload_callback(),
    });
    handle.status(result)
}

/// Reload if the program file changed size since it was last read
///
/// # Arguments
/// * `reloaded` - Optional pointer receiving whether a reload happened
///
/// # Safety
/// `vm` must be valid; `reloaded` must be valid or NULL
#[no_mangle]
pub unsafe extern "C" fn ember_check_reload(vm: *mut EmberVM, reloaded: *mut bool) -> Status {
    let Some(handle) = vm_handle(vm) else {
        return Status::NullArgument;
    };
    let result = handle.runtime().and_then(Runtime::check_for_reload);
    let result = write_flag(reloaded, result);
    handle.status(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_lifecycle() {
        unsafe {
            let vm = ember_vm_new();
            assert!(!vm.is_null());
            assert_eq!(ember_run_entry(vm), Status::NotInitialized);
            assert!(!ember_last_error(vm).is_null());
            assert_eq!(ember_init(vm, 0, ptr::null()), Status::Ok);
            assert!(ember_last_error(vm).is_null());
            assert_eq!(ember_init(vm, 0, ptr::null()), Status::AlreadyInitialized);
            ember_vm_destroy(vm);
            ember_vm_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn test_value_creation() {
        unsafe {
            let i = ember_value_int(42);
            assert_eq!(ember_value_as_int(i, 0), 42);
            assert!(ember_value_as_bool(i, false));
            ember_value_free(i);

            let f = ember_value_float(2.5);
            assert_eq!(ember_value_as_float(f, 0.0), 2.5);
            ember_value_free(f);

            let null = ember_value_null();
            assert!(ember_value_is_null(null));
            assert_eq!(ember_value_as_int(null, -7), -7);
            ember_value_free(null);

            assert!(ember_value_is_null(ptr::null()));
            assert_eq!(ember_value_as_int(ptr::null(), 3), 3);
        }
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert_eq!(ember_load_file(ptr::null_mut(), ptr::null()), Status::NullArgument);
            let vm = ember_vm_new();
            assert_eq!(ember_load_file(vm, ptr::null()), Status::NullArgument);
            assert!(ember_get_static_field(vm, ptr::null(), ptr::null()).is_null());

            let sentinel = ember_value_int(1);
            let mut out = sentinel;
            let status = ember_call_static(vm, c"Game".as_ptr(), ptr::null(), 0, ptr::null(), &mut out);
            assert_eq!(status, Status::NullArgument);
            assert!(out.is_null());
            ember_value_free(sentinel);
            ember_vm_destroy(vm);
        }
    }

    #[test]
    fn test_status_strings() {
        let ok = unsafe { CStr::from_ptr(ember_status_string(Status::Ok)) };
        assert_eq!(ok.to_str().unwrap(), "ok");
        let version = unsafe { CStr::from_ptr(ember_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_thread_calls_without_worker() {
        extern "C" fn noop(_vm: *mut EmberVM, _userdata: *mut c_void) {}
        unsafe {
            let vm = ember_vm_new();
            assert_eq!(ember_thread_call_sync(vm, Some(noop), ptr::null_mut()), Status::ThreadNotStarted);
            assert_eq!(ember_thread_stop(vm), Status::ThreadNotStarted);
            assert!(!ember_thread_is_running(vm));
            ember_vm_destroy(vm);
        }
    }
}
