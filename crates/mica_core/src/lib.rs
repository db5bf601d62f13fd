//! Mica front end: lexer, parser, and bytecode translator.
//!
//! The pipeline is source text, token stream, AST, executable [`Module`].
//! Everything that can go wrong before the first instruction executes is a
//! [`CompileError`]; runtime failures live in the interpreter crate.

pub mod ast;
pub mod bytecode;
pub mod diagnostics;
pub mod disasm;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod translate;

use thiserror::Error;

pub use ast::Type;
pub use diagnostics::{Position, Span};
pub use module::{Module, TOP_FUNCTION_ID};
pub use translate::TranslationError;

pub const TOOL_NAME: &str = "mica";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Translate(#[from] translate::TranslationError),
}

/// Compile a source string into an executable module.
pub fn compile(source: &str) -> Result<Module, CompileError> {
    let tokens = lexer::lex(source)?;
    let program = parser::parse(&tokens)?;
    let module = translate::translate(&program)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_small_program() {
        let module = compile(
            "int i;\n\
             for (i in 1..3) {\n\
               print(i, '\\n');\n\
             }",
        )
        .unwrap();
        assert_eq!(module.functions.len(), 1);
        assert!(!module.top().unwrap().code.is_empty());
    }

    #[test]
    fn lex_errors_surface_as_compile_errors() {
        assert!(matches!(compile("int a; a = 'oops"), Err(CompileError::Lex(_))));
    }

    #[test]
    fn parse_errors_surface_as_compile_errors() {
        assert!(matches!(compile("int a a;"), Err(CompileError::Parse(_))));
    }

    #[test]
    fn translation_errors_surface_as_compile_errors() {
        assert!(matches!(compile("a = 1;"), Err(CompileError::Translate(_))));
    }

    #[test]
    fn disassembly_mentions_every_function() {
        let module = compile(
            "function int twice(int x) { return 2 * x; }\n\
             print(twice(21));",
        )
        .unwrap();
        let listing = disasm::disassemble(&module);
        assert!(listing.contains(".function 0 <top>"));
        assert!(listing.contains(".function 1 twice"));
        assert!(listing.contains("call 1 (twice)"));
    }
}
