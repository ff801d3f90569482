//! Opcode definitions.

use strum::{Display, IntoStaticStr};

/// One opcode per instruction word. The operand layout (two register
/// operands vs. a 16-bit immediate) is fixed per opcode; see the VM's
/// dispatch loop for each contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Opcode {
    // Loads
    LoadConst,
    LoadSmallInt,
    LoadBool,
    LoadNull,

    // Moves and frame plumbing
    Move,
    ReadCapture,
    ZeroCapture,
    ReadGlobal,
    WriteGlobal,

    // Unary
    Increment,
    Negate,
    Not,
    BitNot,
    Len,

    // Comparison
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEq,
    GreaterEq,

    // Binary
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,

    // Control flow
    JumpForward,
    JumpBack,
    CondSkip,

    // For-loop state machine
    ForInt,
    ForIter,
    ForIterPair,
    ForIterInit,
    ForIterNext,

    // Allocation
    AllocArray,
    AllocObject,
    AllocFunc,
    AllocBox,

    // Indexing
    LoadArray,
    StoreArray,
    LoadObject,
    StoreObject,

    // Calls
    Call,
    Ret,
}
