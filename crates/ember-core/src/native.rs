//! Host functions callable from guest code

use crate::types::Signature;
use crate::value::Value;
use crate::vm::Vm;
use crate::VmResult;

/// A host function wrapped in a guest closure.
///
/// The interpreter checks the argument count against `signature()` before
/// calling. Implementations may re-enter the VM through `vm`.
pub trait NativeFunction: Send + Sync {
    /// Name used in stack traces
    fn name(&self) -> &str;

    /// Declared parameter and return types
    fn signature(&self) -> Signature;

    /// Invoke with exactly `signature().arity()` arguments
    fn call(&self, vm: &mut Vm, args: &[Value]) -> VmResult<Value>;
}
