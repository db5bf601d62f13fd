//! Name resolution and frame layout.
//!
//! Variables resolve lexically to a slot in the frame of the declaring
//! function. At runtime a slot owned by an enclosing function is looked up
//! against that function's innermost live frame, so nested functions see
//! the variables of whoever is calling them.

use std::collections::HashMap;

use crate::ast::{
    Block, Expr, ExprKind, FunctionBody, FunctionDecl, Program, Stmt, StmtKind, Type,
};
use crate::bytecode::Bytecode;
use crate::module::{FunctionInfo, Module, NativeInfo, TOP_FUNCTION_ID};

use super::{CallTarget, Resolution, TranslationError, VarSlot};

const MAX_FUNCTIONS: usize = u16::MAX as usize + 1;
// Slot ids and frame sizes are u16, so a frame holds at most 65535 slots.
const MAX_LOCALS: u32 = u16::MAX as u32;

pub fn resolve(program: &Program) -> Result<(Resolution, Module), TranslationError> {
    let mut resolver = Resolver::new();
    resolver.functions.push(FunctionInfo {
        id: TOP_FUNCTION_ID,
        name: "<top>".to_owned(),
        params: Vec::new(),
        return_type: Type::Void,
        locals: 0,
        code: Bytecode::new(),
    });
    resolver.resolve_block(&program.top)?;
    resolver.functions[TOP_FUNCTION_ID as usize].locals = resolver.frame.next_slot as u16;

    let module = Module {
        constants: Default::default(),
        functions: resolver.functions,
        natives: resolver.natives,
    };
    Ok((resolver.resolution, module))
}

#[derive(Default)]
struct Scope {
    vars: HashMap<String, VarSlot>,
    funcs: HashMap<String, CallTarget>,
}

/// Slot allocation state for the function currently being resolved.
struct Frame {
    id: u16,
    next_slot: u32,
}

struct Resolver {
    resolution: Resolution,
    functions: Vec<FunctionInfo>,
    natives: Vec<NativeInfo>,
    scopes: Vec<Scope>,
    frame: Frame,
}

impl Resolver {
    fn new() -> Self {
        Resolver {
            resolution: Resolution::default(),
            functions: Vec::new(),
            natives: Vec::new(),
            scopes: Vec::new(),
            frame: Frame {
                id: TOP_FUNCTION_ID,
                next_slot: 0,
            },
        }
    }

    fn scope_mut(&mut self) -> &mut Scope {
        // Every declaration site sits inside a block, and blocks open a
        // scope before resolving their statements.
        self.scopes.last_mut().expect("a scope is always open")
    }

    fn alloc_slot(&mut self) -> Result<u16, TranslationError> {
        let slot = self.frame.next_slot;
        if slot >= MAX_LOCALS {
            let name = self.functions[self.frame.id as usize].name.clone();
            return Err(TranslationError::TooManyLocals { name });
        }
        self.frame.next_slot = slot + 1;
        Ok(slot as u16)
    }

    fn declare_var(
        &mut self,
        name: &str,
        ty: Type,
        position: crate::diagnostics::Position,
    ) -> Result<VarSlot, TranslationError> {
        let owner = self.frame.id;
        let slot = self.alloc_slot()?;
        let var = VarSlot { owner, slot, ty };
        if self.scope_mut().vars.insert(name.to_owned(), var).is_some() {
            return Err(TranslationError::Redeclaration {
                name: name.to_owned(),
                position,
            });
        }
        Ok(var)
    }

    fn lookup_var(&self, name: &str) -> Option<VarSlot> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name).copied())
    }

    fn lookup_func(&self, name: &str) -> Option<CallTarget> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.funcs.get(name).copied())
    }

    fn resolve_block(&mut self, block: &Block) -> Result<(), TranslationError> {
        self.scopes.push(Scope::default());
        // Register every function declared in this block up front, so
        // siblings can call each other regardless of declaration order.
        for stmt in &block.stmts {
            if let StmtKind::Function(decl) = &stmt.kind {
                self.register_function(decl)?;
            }
        }
        for stmt in &block.stmts {
            self.resolve_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn register_function(&mut self, decl: &FunctionDecl) -> Result<(), TranslationError> {
        let target = match &decl.body {
            FunctionBody::Block(_) => {
                if self.functions.len() >= MAX_FUNCTIONS {
                    return Err(TranslationError::TooManyFunctions);
                }
                let id = self.functions.len() as u16;
                self.functions.push(FunctionInfo {
                    id,
                    name: decl.name.clone(),
                    params: decl.params.iter().map(|p| p.ty).collect(),
                    return_type: decl.return_type,
                    locals: 0,
                    code: Bytecode::new(),
                });
                self.resolution.functions.insert(decl.id, id);
                CallTarget::Function(id)
            }
            FunctionBody::Native { symbol } => {
                if self.natives.len() >= MAX_FUNCTIONS {
                    return Err(TranslationError::TooManyFunctions);
                }
                let id = self.natives.len() as u16;
                self.natives.push(NativeInfo {
                    id,
                    name: decl.name.clone(),
                    symbol: symbol.clone(),
                    params: decl.params.iter().map(|p| p.ty).collect(),
                    return_type: decl.return_type,
                });
                CallTarget::Native(id)
            }
        };
        if self.scope_mut().funcs.insert(decl.name.clone(), target).is_some() {
            return Err(TranslationError::Redeclaration {
                name: decl.name.clone(),
                position: decl.span.start,
            });
        }
        Ok(())
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) -> Result<(), TranslationError> {
        match &stmt.kind {
            StmtKind::Decl { name, ty } => {
                self.declare_var(name, *ty, stmt.span.start)?;
            }
            StmtKind::Assign { name, value, .. } => {
                let var = self.lookup_var(name).ok_or_else(|| {
                    TranslationError::UndefinedVariable {
                        name: name.clone(),
                        position: stmt.span.start,
                    }
                })?;
                self.resolution.vars.insert(stmt.id, var);
                self.resolve_expr(value)?;
            }
            StmtKind::Print { args } => {
                for arg in args {
                    self.resolve_expr(arg)?;
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.resolve_expr(cond)?;
                self.resolve_block(then_block)?;
                if let Some(else_block) = else_block {
                    self.resolve_block(else_block)?;
                }
            }
            StmtKind::While { cond, body } => {
                self.resolve_expr(cond)?;
                self.resolve_block(body)?;
            }
            StmtKind::For {
                var,
                from,
                to,
                body,
            } => {
                let slot = self.lookup_var(var).ok_or_else(|| {
                    TranslationError::UndefinedVariable {
                        name: var.clone(),
                        position: stmt.span.start,
                    }
                })?;
                if slot.ty != Type::Int {
                    return Err(TranslationError::LoopVarNotInt {
                        name: var.clone(),
                        position: stmt.span.start,
                    });
                }
                self.resolution.vars.insert(stmt.id, slot);
                // The upper bound is evaluated once into a hidden slot of
                // the enclosing function's frame.
                let bound = self.alloc_slot()?;
                self.resolution.loop_bounds.insert(stmt.id, bound);
                self.resolve_expr(from)?;
                self.resolve_expr(to)?;
                self.resolve_block(body)?;
            }
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.resolve_expr(value)?;
                }
            }
            StmtKind::Function(decl) => {
                if let FunctionBody::Block(body) = &decl.body {
                    self.resolve_function_body(decl, body)?;
                }
            }
            StmtKind::Expr { expr } => {
                self.resolve_expr(expr)?;
            }
        }
        Ok(())
    }

    fn resolve_function_body(
        &mut self,
        decl: &FunctionDecl,
        body: &Block,
    ) -> Result<(), TranslationError> {
        let id = self.resolution.functions[&decl.id];
        let saved = std::mem::replace(&mut self.frame, Frame { id, next_slot: 0 });
        self.scopes.push(Scope::default());
        // Parameters occupy the first slots, in declaration order.
        for param in &decl.params {
            let var = self.declare_var(&param.name, param.ty, param.span.start)?;
            debug_assert_eq!(var.owner, id);
        }
        self.resolve_block(body)?;
        self.scopes.pop();
        let frame = std::mem::replace(&mut self.frame, saved);
        self.functions[id as usize].locals = frame.next_slot as u16;
        Ok(())
    }

    fn resolve_expr(&mut self, expr: &Expr) -> Result<(), TranslationError> {
        match &expr.kind {
            ExprKind::IntLit(_) | ExprKind::DoubleLit(_) | ExprKind::StrLit(_) => {}
            ExprKind::Var(name) => {
                let var = self.lookup_var(name).ok_or_else(|| {
                    TranslationError::UndefinedVariable {
                        name: name.clone(),
                        position: expr.span.start,
                    }
                })?;
                self.resolution.vars.insert(expr.id, var);
            }
            ExprKind::Call { name, args } => {
                let target = self.lookup_func(name).ok_or_else(|| {
                    TranslationError::UndefinedFunction {
                        name: name.clone(),
                        position: expr.span.start,
                    }
                })?;
                self.resolution.calls.insert(expr.id, target);
                for arg in args {
                    self.resolve_expr(arg)?;
                }
            }
            ExprKind::Unary { operand, .. } => self.resolve_expr(operand)?,
            ExprKind::Binary { left, right, .. } => {
                self.resolve_expr(left)?;
                self.resolve_expr(right)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::lexer::lex;
    use crate::parser::parse;

    use super::*;

    fn resolve_source(source: &str) -> Result<(Resolution, Module), TranslationError> {
        let tokens = lex(source).expect("lexes");
        let program = parse(&tokens).expect("parses");
        resolve(&program)
    }

    #[test]
    fn locals_are_counted_per_function() {
        let (_, module) = resolve_source(
            "int a; double b;\n\
             function int f(int x) {\n\
               int y;\n\
               return x + y;\n\
             }",
        )
        .unwrap();
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.top().unwrap().locals, 2);
        let f = &module.functions[1];
        assert_eq!(f.name, "f");
        assert_eq!(f.params, vec![Type::Int]);
        assert_eq!(f.locals, 2);
    }

    #[test]
    fn undefined_variable_is_reported() {
        let err = resolve_source("x = 1;").unwrap_err();
        assert!(matches!(err, TranslationError::UndefinedVariable { ref name, .. } if name == "x"));
    }

    #[test]
    fn redeclaration_in_same_scope_is_rejected() {
        let err = resolve_source("int a; double a;").unwrap_err();
        assert!(matches!(err, TranslationError::Redeclaration { ref name, .. } if name == "a"));
    }

    #[test]
    fn shadowing_in_nested_block_is_allowed() {
        resolve_source("int a; if (1) { double a; a = 0.5; }").unwrap();
    }

    #[test]
    fn loop_over_non_int_is_rejected() {
        let err = resolve_source("double d; for (d in 0..3) {}").unwrap_err();
        assert!(matches!(err, TranslationError::LoopVarNotInt { .. }));
    }

    #[test]
    fn native_declarations_get_their_own_table() {
        let (_, module) =
            resolve_source("function int size(string s) native 'strlen';").unwrap();
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.natives.len(), 1);
        assert_eq!(module.natives[0].symbol, "strlen");
    }

    #[test]
    fn loop_bound_takes_a_hidden_slot() {
        let (resolution, module) = resolve_source("int i; for (i in 0..3) {}").unwrap();
        assert_eq!(module.top().unwrap().locals, 2);
        assert_eq!(resolution.loop_bounds.len(), 1);
    }
}
