//! Instruction set
//!
//! A stack machine. Operands are taken from the top of the operand stack,
//! left operand pushed first. Calls pop their arguments (last argument on
//! top) and always push a result, `null` for void functions.

use crate::types::{FunctionId, TypeId};
use serde::{Deserialize, Serialize};

/// Interpreter instruction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    // Constants
    /// Push null
    ConstNull,
    /// Push an integer
    ConstI32(i32),
    /// Push a float
    ConstF64(f64),
    /// Push a boolean
    ConstBool(bool),
    /// Push a `String` object built from the string pool entry
    ConstStr(u32),

    // Locals and stack
    /// Push a local
    LoadLocal(u16),
    /// Pop into a local
    StoreLocal(u16),
    /// Discard the top value
    Pop,
    /// Duplicate the top value
    Dup,

    // Arithmetic and comparison
    /// a + b (numeric)
    Add,
    /// a - b
    Sub,
    /// a * b
    Mul,
    /// a / b, always a float
    Div,
    /// a % b
    Mod,
    /// -a
    Neg,
    /// !a
    Not,
    /// a == b
    Eq,
    /// a != b
    Ne,
    /// a < b
    Lt,
    /// a <= b
    Le,
    /// a > b
    Gt,
    /// a >= b
    Ge,

    // Control flow
    /// Jump to an instruction index
    Jmp(u32),
    /// Pop; jump when falsy
    JmpIfFalse(u32),
    /// Return the top value
    Return,
    /// Return null
    ReturnVoid,

    // Statics and fields
    /// Push a static field of a type
    GetStatic {
        /// Owning type
        ty: TypeId,
        /// Static slot
        slot: u16,
    },
    /// Pop into a static field of a type
    SetStatic {
        /// Owning type
        ty: TypeId,
        /// Static slot
        slot: u16,
    },
    /// Pop an object, push one of its fields
    GetField(u16),
    /// Pop a value and an object (object below), store the field
    SetField(u16),

    // Objects and calls
    /// Allocate an instance and run its constructor with `argc` arguments
    New {
        /// Class to instantiate
        ty: TypeId,
        /// Constructor arguments
        argc: u8,
    },
    /// Call a function directly
    Call {
        /// Callee
        func: FunctionId,
        /// Argument count
        argc: u8,
    },
    /// Call a method by name on the receiver below the arguments
    CallMethod {
        /// String pool index of the method name
        name: u32,
        /// Argument count
        argc: u8,
    },
    /// Call the closure below the arguments
    CallClosure {
        /// Argument count
        argc: u8,
    },
    /// Push a closure over a function
    MakeClosure(FunctionId),
    /// Pop a delay in milliseconds and a closure (closure below); queue a timer
    Schedule,

    // Exceptions
    /// Pop a value and throw it
    Throw,
    /// Install a handler at the given instruction index
    Try(u32),
    /// Remove the innermost handler
    EndTry,

    // Strings and types
    /// Pop two values, push their concatenated text
    Concat,
    /// Pop a value, push its text as a `String`
    ToStr,
    /// Pop a value, push whether it is an instance of the type
    InstanceOf(TypeId),
}

impl Opcode {
    /// Rewrite the indices an instruction refers to.
    ///
    /// Used when code from one program is spliced into another.
    pub fn remap(
        self,
        ty: impl Fn(TypeId) -> TypeId,
        func: impl Fn(FunctionId) -> FunctionId,
        string: impl Fn(u32) -> u32,
    ) -> Opcode {
        match self {
            Opcode::ConstStr(s) => Opcode::ConstStr(string(s)),
            Opcode::GetStatic { ty: t, slot } => Opcode::GetStatic { ty: ty(t), slot },
            Opcode::SetStatic { ty: t, slot } => Opcode::SetStatic { ty: ty(t), slot },
            Opcode::New { ty: t, argc } => Opcode::New { ty: ty(t), argc },
            Opcode::Call { func: f, argc } => Opcode::Call { func: func(f), argc },
            Opcode::CallMethod { name, argc } => Opcode::CallMethod {
                name: string(name),
                argc,
            },
            Opcode::MakeClosure(f) => Opcode::MakeClosure(func(f)),
            Opcode::InstanceOf(t) => Opcode::InstanceOf(ty(t)),
            other => other,
        }
    }
}
