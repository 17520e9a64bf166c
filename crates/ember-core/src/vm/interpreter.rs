//! Bytecode interpreter
//!
//! Frames live on the VM (not the native stack) so the collector sees
//! every local and operand. Guest exceptions unwind frame by frame; a
//! frame with an active `Try` handler catches them. Runtime faults (null
//! access, type errors) are catchable as well; stack overflow and heap
//! exhaustion are not.

use super::Vm;
use crate::object::{ClosureTarget, HeapObject};
use crate::opcode::Opcode;
use crate::types::{Function, FunctionId, TypeTag};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::sync::Arc;

/// A guest exception that escaped to the embedder
#[derive(Debug, Clone)]
pub struct GuestException {
    /// Thrown value; only meaningful while it is still reachable
    pub value: Value,
    /// String conversion of the value, taken when it was thrown
    pub message: String,
    /// Functions unwound, innermost first
    pub trace: Vec<String>,
}

impl GuestException {
    /// Stack trace, one `at <function>` line per frame
    pub fn stack(&self) -> String {
        self.trace.join("\n")
    }
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    target: usize,
    depth: usize,
}

pub(crate) struct Frame {
    function: Arc<Function>,
    pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
    handlers: Vec<Handler>,
}

impl Frame {
    pub(crate) fn trace(&self, out: &mut Vec<Value>) {
        out.extend(self.locals.iter().copied().filter(Value::is_ref));
        out.extend(self.stack.iter().copied().filter(Value::is_ref));
    }
}

enum Flow {
    Continue,
    Return(Value),
}

impl Vm {
    /// Call a bytecode function. `this` is required for instance methods.
    pub fn call_function(
        &mut self,
        func: FunctionId,
        this: Option<Value>,
        args: &[Value],
    ) -> VmResult<Value> {
        let function = self
            .program_ref()?
            .function(func)
            .cloned()
            .ok_or_else(|| VmError::MethodNotFound(format!("function {}", func)))?;
        self.enter(function, this, args)
    }

    /// Call a closure value
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        if callee.is_null() {
            return Err(VmError::NullAccess("call of null function".to_string()));
        }
        let closure = match self.heap.deref(callee) {
            Some(HeapObject::Closure(c)) => c.clone(),
            Some(_) => return Err(VmError::TypeError("value is not a function".to_string())),
            None => return Err(VmError::NullAccess("function was collected".to_string())),
        };
        match closure.target {
            ClosureTarget::Function(func) => self.call_function(func, closure.bound, args),
            ClosureTarget::Native(native) => {
                let expected = native.signature().arity();
                if args.len() != expected {
                    return Err(VmError::ArgCount {
                        name: native.name().to_string(),
                        expected,
                        got: args.len(),
                    });
                }
                let mark = self.enter_native_scope();
                for arg in args {
                    self.pin(*arg);
                }
                let result = native.call(self, args);
                self.leave_native_scope(mark);
                result
            }
        }
    }

    fn check_argument(&self, function: &Function, tag: TypeTag, arg: Value) -> VmResult<()> {
        let ok = match tag {
            TypeTag::String => arg.is_null() || self.is_string(arg),
            TypeTag::Object(ty) => arg.is_null() || self.is_instance_of(arg, ty),
            TypeTag::Function => arg.is_null() || self.is_closure(arg),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(VmError::TypeError(format!(
                "{}: expected {:?} argument, got {}",
                function.name,
                tag,
                self.describe_kind(arg)
            )))
        }
    }

    fn describe_kind(&self, value: Value) -> String {
        match self.heap.deref(value) {
            Some(HeapObject::Text(_)) => "raw text".to_string(),
            Some(HeapObject::Object(_)) => self.display(value),
            Some(other) => other.kind_name().to_string(),
            None => format!("{:?}", value.kind()),
        }
    }

    fn enter(&mut self, function: Arc<Function>, this: Option<Value>, args: &[Value]) -> VmResult<Value> {
        if args.len() != function.arity() {
            return Err(VmError::ArgCount {
                name: function.name.clone(),
                expected: function.arity(),
                got: args.len(),
            });
        }
        if self.frames.len() >= self.options.max_call_depth {
            return Err(VmError::StackOverflow);
        }
        for (tag, arg) in function.signature.params.iter().zip(args) {
            self.check_argument(&function, *tag, *arg)?;
        }

        let mut locals = vec![Value::null(); usize::from(function.locals)];
        let mut slot = 0;
        if function.is_method {
            match this {
                Some(receiver) if !receiver.is_null() => locals[0] = receiver,
                _ => {
                    return Err(VmError::NullAccess(format!("{} called without receiver", function.name)))
                }
            }
            slot = 1;
        }
        locals[slot..slot + args.len()].copy_from_slice(args);

        self.frames.push(Frame {
            function,
            pc: 0,
            locals,
            stack: Vec::new(),
            handlers: Vec::new(),
        });
        let result = self.execute();
        self.frames.pop();
        result
    }

    fn execute(&mut self) -> VmResult<Value> {
        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) => self.unwind(err)?,
            }
        }
    }

    /// Route an error to the current frame's innermost handler, or
    /// propagate it out of the frame.
    fn unwind(&mut self, err: VmError) -> VmResult<()> {
        let has_handler = self.frames.last().map(|f| !f.handlers.is_empty()).unwrap_or(false);
        if !(has_handler && err.is_catchable()) {
            let mut err = err;
            if let (VmError::Thrown(exc), Some(frame)) = (&mut err, self.frames.last()) {
                exc.trace.push(format!("at {}", frame.function.name));
            }
            return Err(err);
        }

        let caught = match err {
            VmError::Thrown(exc) => exc.value,
            fault => self.alloc_string(&fault.to_string())?,
        };
        let frame = self.frame()?;
        if let Some(handler) = frame.handlers.pop() {
            frame.stack.truncate(handler.depth);
            frame.stack.push(caught);
            frame.pc = handler.target;
        }
        Ok(())
    }

    fn throw(&self, value: Value) -> VmError {
        VmError::Thrown(Box::new(GuestException {
            value,
            message: self.display(value),
            trace: Vec::new(),
        }))
    }

    // ========================================================================
    // Frame helpers
    // ========================================================================

    fn frame(&mut self) -> VmResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::Internal("no active frame".to_string()))
    }

    fn push(&mut self, value: Value) -> VmResult<()> {
        self.frame()?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.frame()?
            .stack
            .pop()
            .ok_or_else(|| VmError::Internal("operand stack underflow".to_string()))
    }

    fn pop_n(&mut self, n: u8) -> VmResult<Vec<Value>> {
        let frame = self.frame()?;
        let n = usize::from(n);
        if frame.stack.len() < n {
            return Err(VmError::Internal("operand stack underflow".to_string()));
        }
        let at = frame.stack.len() - n;
        Ok(frame.stack.split_off(at))
    }

    fn peek(&mut self, depth: usize) -> VmResult<Value> {
        let stack = &self.frame()?.stack;
        stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| stack[i])
            .ok_or_else(|| VmError::Internal("operand stack underflow".to_string()))
    }

    fn number(&self, value: Value) -> VmResult<f64> {
        value
            .as_number()
            .ok_or_else(|| VmError::TypeError(format!("expected number, got {}", self.describe_kind(value))))
    }

    fn string_operand(&self, idx: u32) -> VmResult<String> {
        self.program_ref()?
            .string(idx)
            .map(str::to_string)
            .ok_or_else(|| VmError::Internal(format!("string {} out of range", idx)))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn step(&mut self) -> VmResult<Flow> {
        let frame = self.frame()?;
        let Some(op) = frame.function.code.get(frame.pc).copied() else {
            return Ok(Flow::Return(Value::null()));
        };
        frame.pc += 1;

        match op {
            Opcode::ConstNull => self.push(Value::null())?,
            Opcode::ConstI32(i) => self.push(Value::i32(i))?,
            Opcode::ConstF64(f) => self.push(Value::f64(f))?,
            Opcode::ConstBool(b) => self.push(Value::bool(b))?,
            Opcode::ConstStr(idx) => {
                let text = self.string_operand(idx)?;
                let value = self.alloc_string(&text)?;
                self.push(value)?;
            }

            Opcode::LoadLocal(l) => {
                let frame = self.frame()?;
                let value = frame.locals[usize::from(l)];
                frame.stack.push(value);
            }
            Opcode::StoreLocal(l) => {
                let value = self.pop()?;
                self.frame()?.locals[usize::from(l)] = value;
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let value = self.peek(0)?;
                self.push(value)?;
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => self.arithmetic(op)?,
            Opcode::Neg => {
                let a = self.pop()?;
                let result = match a.as_i32() {
                    Some(i) => Value::i32(i.wrapping_neg()),
                    None => Value::f64(-self.number(a)?),
                };
                self.push(result)?;
            }
            Opcode::Not => {
                let a = self.pop()?;
                self.push(Value::bool(!a.is_truthy()))?;
            }
            Opcode::Eq | Opcode::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = self.values_equal(a, b);
                self.push(Value::bool(if op == Opcode::Eq { equal } else { !equal }))?;
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                let (x, y) = (self.number(a)?, self.number(b)?);
                let result = match op {
                    Opcode::Lt => x < y,
                    Opcode::Le => x <= y,
                    Opcode::Gt => x > y,
                    _ => x >= y,
                };
                self.push(Value::bool(result))?;
            }

            Opcode::Jmp(target) => self.frame()?.pc = target as usize,
            Opcode::JmpIfFalse(target) => {
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.frame()?.pc = target as usize;
                }
            }
            Opcode::Return => return Ok(Flow::Return(self.pop()?)),
            Opcode::ReturnVoid => return Ok(Flow::Return(Value::null())),

            Opcode::GetStatic { ty, slot } => {
                let value = self.get_static(ty, slot)?;
                self.push(value)?;
            }
            Opcode::SetStatic { ty, slot } => {
                let value = self.pop()?;
                self.set_static(ty, slot, value)?;
            }
            Opcode::GetField(slot) => {
                let object = self.pop()?;
                let value = self.get_field(object, slot)?;
                self.push(value)?;
            }
            Opcode::SetField(slot) => {
                let value = self.pop()?;
                let object = self.pop()?;
                self.set_field(object, slot, value)?;
            }

            Opcode::New { ty, argc } => {
                // Allocate while the arguments are still on the operand stack
                let instance = self.alloc_instance(ty)?;
                let args = self.pop_n(argc)?;
                let ctor = self.program_ref()?.type_def(ty).and_then(|t| t.constructor);
                match ctor {
                    Some(ctor) => {
                        self.call_function(ctor, Some(instance), &args)?;
                    }
                    None if !args.is_empty() => {
                        return Err(VmError::ArgCount {
                            name: format!("{}.new", self.program_ref()?.type_name(ty)),
                            expected: 0,
                            got: args.len(),
                        })
                    }
                    None => {}
                }
                self.push(instance)?;
            }
            Opcode::Call { func, argc } => {
                let args = self.pop_n(argc)?;
                let result = self.call_function(func, None, &args)?;
                self.push(result)?;
            }
            Opcode::CallMethod { name, argc } => {
                let args = self.pop_n(argc)?;
                let receiver = self.pop()?;
                let name = self.string_operand(name)?;
                if receiver.is_null() {
                    return Err(VmError::NullAccess(format!("call of {} on null", name)));
                }
                let ty = self
                    .type_of(receiver)
                    .ok_or_else(|| VmError::TypeError(format!("{} has no methods", self.describe_kind(receiver))))?;
                let program = self.program_ref()?;
                let func = program.method_by_name(ty, &name, false).ok_or_else(|| {
                    VmError::MethodNotFound(format!("{}.{}", program.type_name(ty), name))
                })?;
                let result = self.call_function(func, Some(receiver), &args)?;
                self.push(result)?;
            }
            Opcode::CallClosure { argc } => {
                let args = self.pop_n(argc)?;
                let callee = self.pop()?;
                let result = self.call_value(callee, &args)?;
                self.push(result)?;
            }
            Opcode::MakeClosure(func) => {
                let closure = self.alloc_closure(func, None)?;
                self.push(closure)?;
            }
            Opcode::Schedule => {
                let delay = self.pop()?;
                let callback = self.pop()?;
                let delay = self.number(delay)?;
                self.schedule(callback, delay)?;
            }

            Opcode::Throw => {
                let value = self.pop()?;
                return Err(self.throw(value));
            }
            Opcode::Try(target) => {
                let frame = self.frame()?;
                let depth = frame.stack.len();
                frame.handlers.push(Handler {
                    target: target as usize,
                    depth,
                });
            }
            Opcode::EndTry => {
                self.frame()?.handlers.pop();
            }

            Opcode::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                let text = self.display(a) + &self.display(b);
                let value = self.alloc_string(&text)?;
                self.push(value)?;
            }
            Opcode::ToStr => {
                let a = self.pop()?;
                let text = self.display(a);
                let value = self.alloc_string(&text)?;
                self.push(value)?;
            }
            Opcode::InstanceOf(ty) => {
                let a = self.pop()?;
                let result = self.is_instance_of(a, ty);
                self.push(Value::bool(result))?;
            }
        }
        Ok(Flow::Continue)
    }

    fn arithmetic(&mut self, op: Opcode) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a.as_i32(), b.as_i32(), op) {
            (Some(x), Some(y), Opcode::Add) => Value::i32(x.wrapping_add(y)),
            (Some(x), Some(y), Opcode::Sub) => Value::i32(x.wrapping_sub(y)),
            (Some(x), Some(y), Opcode::Mul) => Value::i32(x.wrapping_mul(y)),
            (Some(_), Some(0), Opcode::Mod) => {
                return Err(VmError::TypeError("integer modulo by zero".to_string()))
            }
            (Some(x), Some(y), Opcode::Mod) => Value::i32(x.wrapping_rem(y)),
            _ => {
                let (x, y) = (self.number(a)?, self.number(b)?);
                Value::f64(match op {
                    Opcode::Add => x + y,
                    Opcode::Sub => x - y,
                    Opcode::Mul => x * y,
                    Opcode::Div => x / y,
                    _ => x % y,
                })
            }
        };
        self.push(result)
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return x == y;
        }
        if a.is_ref() && b.is_ref() && a != b {
            if let (Some(x), Some(y)) = (self.text_of(a), self.text_of(b)) {
                return x == y;
            }
        }
        a == b
    }
}
