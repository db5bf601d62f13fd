//! Executable modules: the output of translation and the input to the VM.

use std::collections::HashMap;

use crate::ast::Type;
use crate::bytecode::Bytecode;

/// Interned string literals, addressed by dense 16-bit ids.
#[derive(Debug, Default, Clone)]
pub struct ConstantPool {
    strings: Vec<String>,
    ids: HashMap<String, u16>,
}

/// 2^16 distinct literals fit in the Sload operand.
pub const MAX_CONSTANTS: usize = u16::MAX as usize + 1;

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a literal, returning its id. Repeated literals share one id.
    /// Returns `None` once the pool is full.
    pub fn intern(&mut self, text: &str) -> Option<u16> {
        if let Some(&id) = self.ids.get(text) {
            return Some(id);
        }
        if self.strings.len() >= MAX_CONSTANTS {
            return None;
        }
        let id = self.strings.len() as u16;
        self.strings.push(text.to_owned());
        self.ids.insert(text.to_owned(), id);
        Some(id)
    }

    pub fn get(&self, id: u16) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// A translated function: bytecode plus the frame layout the VM needs.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub id: u16,
    pub name: String,
    /// Parameter types in declaration order. Parameters occupy the first
    /// `params.len()` local slots.
    pub params: Vec<Type>,
    pub return_type: Type,
    /// Total local slot count, parameters included.
    pub locals: u16,
    pub code: Bytecode,
}

/// A declared native function, bound by symbol name at first call.
#[derive(Debug, Clone)]
pub struct NativeInfo {
    pub id: u16,
    pub name: String,
    pub symbol: String,
    pub params: Vec<Type>,
    pub return_type: Type,
}

/// The id of the synthesized top-level function.
pub const TOP_FUNCTION_ID: u16 = 0;

#[derive(Debug, Default, Clone)]
pub struct Module {
    pub constants: ConstantPool,
    pub functions: Vec<FunctionInfo>,
    pub natives: Vec<NativeInfo>,
}

impl Module {
    pub fn function(&self, id: u16) -> Option<&FunctionInfo> {
        self.functions.get(id as usize)
    }

    pub fn native(&self, id: u16) -> Option<&NativeInfo> {
        self.natives.get(id as usize)
    }

    pub fn top(&self) -> Option<&FunctionInfo> {
        self.function(TOP_FUNCTION_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.intern("hello").unwrap();
        let b = pool.intern("world").unwrap();
        let c = pool.intern("hello").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(b), Some("world"));
        assert_eq!(pool.len(), 2);
    }
}
