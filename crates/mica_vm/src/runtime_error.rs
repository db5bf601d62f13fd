use thiserror::Error;

use mica_core::Type;
use mica_native::NativeError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("function {function} offset {offset}: {detail}")]
    MalformedBytecode {
        function: u16,
        offset: u32,
        detail: String,
    },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack holds {found} where {expected} was expected")]
    UnexpectedOperand { expected: Type, found: Type },
    #[error("no live frame owns context {context}")]
    BrokenClosure { context: u16 },
    #[error("call to unknown function id {id}")]
    UnknownFunction { id: u16 },
    #[error("call to unknown native id {id}")]
    UnknownNative { id: u16 },
    #[error("unknown string constant {id}")]
    UnknownConstant { id: u16 },
    #[error("call depth limit of {limit} frames exceeded")]
    CallDepthExceeded { limit: usize },
    #[error("step limit of {limit} instructions exceeded")]
    StepLimitExceeded { limit: u64 },
    #[error(transparent)]
    Native(#[from] NativeError),
}

impl RuntimeError {
    /// Stable machine-readable code, for tooling that reports errors.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::DivisionByZero => "E0500",
            RuntimeError::MalformedBytecode { .. } => "E0501",
            RuntimeError::StackUnderflow => "E0502",
            RuntimeError::UnexpectedOperand { .. } => "E0503",
            RuntimeError::BrokenClosure { .. } => "E0504",
            RuntimeError::UnknownFunction { .. } => "E0505",
            RuntimeError::UnknownNative { .. } => "E0506",
            RuntimeError::UnknownConstant { .. } => "E0507",
            RuntimeError::CallDepthExceeded { .. } => "E0508",
            RuntimeError::StepLimitExceeded { .. } => "E0509",
            RuntimeError::Native(_) => "E0510",
        }
    }
}
