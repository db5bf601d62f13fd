//! AST to bytecode translation.
//!
//! Translation runs in two passes. The resolver walks the tree, assigns
//! function ids and local slots, and records where every name points. The
//! emitter then walks each function body and produces bytecode, checking
//! types as it goes.

mod emit;
mod resolve;

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{NodeId, Program, Type};
use crate::bytecode::BranchOutOfRange;
use crate::diagnostics::Position;
use crate::module::{Module, MAX_CONSTANTS};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslationError {
    #[error("{position}: undefined variable '{name}'")]
    UndefinedVariable { name: String, position: Position },
    #[error("{position}: undefined function '{name}'")]
    UndefinedFunction { name: String, position: Position },
    #[error("{position}: '{name}' is already declared in this scope")]
    Redeclaration { name: String, position: Position },
    #[error("{position}: expected {expected}, found {found}")]
    TypeMismatch {
        expected: Type,
        found: Type,
        position: Position,
    },
    #[error("{position}: operator '{op}' cannot be applied to {operand}")]
    BadOperandType {
        op: &'static str,
        operand: Type,
        position: Position,
    },
    #[error("{position}: operator '{op}' cannot be applied to {lhs} and {rhs}")]
    BadOperandTypes {
        op: &'static str,
        lhs: Type,
        rhs: Type,
        position: Position,
    },
    #[error("{position}: '{name}' expects {expected} argument(s), got {found}")]
    WrongArity {
        name: String,
        expected: usize,
        found: usize,
        position: Position,
    },
    #[error("{position}: loop variable '{name}' must be a declared int variable")]
    LoopVarNotInt { name: String, position: Position },
    #[error("{position}: void value used where a value is required")]
    VoidOperand { position: Position },
    #[error("{position}: return with a value in a void function")]
    ReturnInVoid { position: Position },
    #[error("{position}: return without a value in a function returning {expected}")]
    MissingReturnValue { expected: Type, position: Position },
    #[error("too many string constants (limit {MAX_CONSTANTS})")]
    TooManyConstants,
    #[error("function '{name}' has too many local variables")]
    TooManyLocals { name: String },
    #[error("too many functions")]
    TooManyFunctions,
    #[error(transparent)]
    BranchOutOfRange(#[from] BranchOutOfRange),
}

/// Where a resolved variable lives: a slot in the frame of the function
/// that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    pub owner: u16,
    pub slot: u16,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Function(u16),
    Native(u16),
}

/// Side tables produced by the resolver, keyed by AST node id.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Variable references: `Var` expressions, assignment and loop statements.
    pub vars: HashMap<NodeId, VarSlot>,
    /// Call expressions.
    pub calls: HashMap<NodeId, CallTarget>,
    /// Hidden slot holding the upper bound of each for loop.
    pub loop_bounds: HashMap<NodeId, u16>,
    /// Function declarations, plus the program root for the top function.
    pub functions: HashMap<NodeId, u16>,
}

/// Translate a parsed program into an executable module. The top-level code
/// becomes function 0.
pub fn translate(program: &Program) -> Result<Module, TranslationError> {
    let (resolution, module) = resolve::resolve(program)?;
    emit::emit(program, &resolution, module)
}
