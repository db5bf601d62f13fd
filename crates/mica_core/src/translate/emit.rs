//! Bytecode emission and type checking.
//!
//! One pass over the resolved tree per function. Every expression leaves
//! exactly one value on the stack (or none, for void calls); statements
//! leave the stack as they found it. The emitter tracks the static type of
//! the top of stack through expression recursion, so no type information
//! survives into the bytecode beyond the typed opcodes themselves.

use crate::ast::{
    BinaryOp, Block, Expr, ExprKind, FunctionBody, NodeId, Program, Stmt, StmtKind, Type, UnaryOp,
};
use crate::bytecode::{Bytecode, Label, Op};
use crate::diagnostics::Position;
use crate::module::{Module, TOP_FUNCTION_ID};

use super::{CallTarget, Resolution, TranslationError, VarSlot};

pub(super) fn emit(
    program: &Program,
    resolution: &Resolution,
    module: Module,
) -> Result<Module, TranslationError> {
    let mut emitter = Emitter {
        resolution,
        module,
        code: Bytecode::new(),
        current: TOP_FUNCTION_ID,
        return_type: Type::Void,
    };
    emitter.emit_function(TOP_FUNCTION_ID, Type::Void, &program.top)?;
    Ok(emitter.module)
}

struct Emitter<'a> {
    resolution: &'a Resolution,
    module: Module,
    /// Code of the function currently being emitted.
    code: Bytecode,
    current: u16,
    return_type: Type,
}

impl<'a> Emitter<'a> {
    fn var(&self, id: NodeId) -> VarSlot {
        // The resolver recorded a slot for every name it accepted.
        self.resolution.vars[&id]
    }

    fn emit_function(
        &mut self,
        id: u16,
        return_type: Type,
        body: &Block,
    ) -> Result<(), TranslationError> {
        let saved_code = std::mem::take(&mut self.code);
        let saved_current = self.current;
        let saved_return = self.return_type;
        self.current = id;
        self.return_type = return_type;

        self.emit_block(body)?;
        // Falling off the end returns the zero of the return type; the top
        // function halts instead.
        if id == TOP_FUNCTION_ID {
            self.code.add_op(Op::Stop);
        } else {
            match return_type {
                Type::Void => {}
                Type::Int => self.push_int(0),
                Type::Double => {
                    self.code.add_op(Op::Dload);
                    self.code.add_f64(0.0);
                }
                Type::Str | Type::Invalid => {
                    let id = self
                        .module
                        .constants
                        .intern("")
                        .ok_or(TranslationError::TooManyConstants)?;
                    self.code.add_op(Op::Sload);
                    self.code.add_u16(id);
                }
            }
            self.code.add_op(Op::Return);
        }

        self.module.functions[id as usize].code =
            std::mem::replace(&mut self.code, saved_code);
        self.current = saved_current;
        self.return_type = saved_return;
        Ok(())
    }

    fn emit_block(&mut self, block: &Block) -> Result<(), TranslationError> {
        for stmt in &block.stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), TranslationError> {
        match &stmt.kind {
            // Locals start as the zero of their type; no code needed.
            StmtKind::Decl { .. } => {}
            StmtKind::Assign { op, value, .. } => {
                self.emit_assign(stmt, *op, value)?;
            }
            StmtKind::Print { args } => {
                for arg in args {
                    let ty = self.emit_expr(arg)?;
                    match ty {
                        Type::Int => self.code.add_op(Op::PrintI),
                        Type::Double => self.code.add_op(Op::PrintD),
                        Type::Str => self.code.add_op(Op::PrintS),
                        Type::Void | Type::Invalid => {
                            return Err(TranslationError::VoidOperand {
                                position: arg.span.start,
                            })
                        }
                    }
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let mut else_label = Label::new();
                self.emit_condition(cond)?;
                self.push_int(0);
                self.code.add_branch(Op::IfIcmpE, &mut else_label)?;
                self.emit_block(then_block)?;
                match else_block {
                    Some(else_block) => {
                        let mut end = Label::new();
                        self.code.add_branch(Op::Ja, &mut end)?;
                        self.code.bind(&mut else_label)?;
                        self.emit_block(else_block)?;
                        self.code.bind(&mut end)?;
                    }
                    None => self.code.bind(&mut else_label)?,
                }
            }
            StmtKind::While { cond, body } => {
                let mut head = Label::new();
                let mut end = Label::new();
                self.code.bind(&mut head)?;
                self.emit_condition(cond)?;
                self.push_int(0);
                self.code.add_branch(Op::IfIcmpE, &mut end)?;
                self.emit_block(body)?;
                self.code.add_branch(Op::Ja, &mut head)?;
                self.code.bind(&mut end)?;
            }
            StmtKind::For { from, to, body, .. } => {
                self.emit_for(stmt, from, to, body)?;
            }
            StmtKind::Return { value } => {
                self.emit_return(stmt, value.as_ref())?;
            }
            StmtKind::Function(decl) => {
                if let FunctionBody::Block(body) = &decl.body {
                    let id = self.resolution.functions[&decl.id];
                    self.emit_function(id, decl.return_type, body)?;
                }
            }
            StmtKind::Expr { expr } => {
                let ty = self.emit_expr(expr)?;
                if ty != Type::Void {
                    self.code.add_op(Op::Pop);
                }
            }
        }
        Ok(())
    }

    fn emit_assign(
        &mut self,
        stmt: &Stmt,
        op: crate::ast::AssignOp,
        value: &Expr,
    ) -> Result<(), TranslationError> {
        use crate::ast::AssignOp;

        let var = self.var(stmt.id);
        match op {
            AssignOp::Set => {
                let ty = self.emit_expr(value)?;
                self.coerce(ty, var.ty, value.span.start)?;
            }
            AssignOp::AddSet | AssignOp::SubSet => {
                let symbol = if op == AssignOp::AddSet { "+=" } else { "-=" };
                if var.ty != Type::Int && var.ty != Type::Double {
                    return Err(TranslationError::BadOperandType {
                        op: symbol,
                        operand: var.ty,
                        position: stmt.span.start,
                    });
                }
                self.load_var(var);
                let ty = self.emit_expr(value)?;
                self.coerce(ty, var.ty, value.span.start)?;
                let code = match (var.ty, op) {
                    (Type::Int, AssignOp::AddSet) => Op::Iadd,
                    (Type::Int, AssignOp::SubSet) => Op::Isub,
                    (Type::Double, AssignOp::AddSet) => Op::Dadd,
                    _ => Op::Dsub,
                };
                self.code.add_op(code);
            }
        }
        self.store_var(var);
        Ok(())
    }

    fn emit_for(
        &mut self,
        stmt: &Stmt,
        from: &Expr,
        to: &Expr,
        body: &Block,
    ) -> Result<(), TranslationError> {
        let var = self.var(stmt.id);
        let bound = self.resolution.loop_bounds[&stmt.id];

        // Bounds evaluate left to right, each exactly once; the upper
        // bound lands in its hidden slot.
        let ty = self.emit_expr(from)?;
        self.require(ty, Type::Int, from.span.start)?;
        self.store_var(var);

        let ty = self.emit_expr(to)?;
        self.require(ty, Type::Int, to.span.start)?;
        self.code.add_op(Op::StoreIVar);
        self.code.add_u16(bound);

        let mut head = Label::new();
        let mut end = Label::new();
        self.code.bind(&mut head)?;
        self.load_var(var);
        self.code.add_op(Op::LoadIVar);
        self.code.add_u16(bound);
        // The range is inclusive: leave once the counter passes the bound.
        self.code.add_branch(Op::IfIcmpG, &mut end)?;
        self.emit_block(body)?;
        self.load_var(var);
        self.push_int(1);
        self.code.add_op(Op::Iadd);
        self.store_var(var);
        self.code.add_branch(Op::Ja, &mut head)?;
        self.code.bind(&mut end)?;
        Ok(())
    }

    fn emit_return(
        &mut self,
        stmt: &Stmt,
        value: Option<&Expr>,
    ) -> Result<(), TranslationError> {
        match value {
            Some(value) => {
                if self.return_type == Type::Void {
                    return Err(TranslationError::ReturnInVoid {
                        position: stmt.span.start,
                    });
                }
                let ty = self.emit_expr(value)?;
                self.coerce(ty, self.return_type, value.span.start)?;
            }
            None => {
                if self.return_type != Type::Void {
                    return Err(TranslationError::MissingReturnValue {
                        expected: self.return_type,
                        position: stmt.span.start,
                    });
                }
            }
        }
        if self.current == TOP_FUNCTION_ID {
            self.code.add_op(Op::Stop);
        } else {
            self.code.add_op(Op::Return);
        }
        Ok(())
    }

    fn emit_expr(&mut self, expr: &Expr) -> Result<Type, TranslationError> {
        match &expr.kind {
            ExprKind::IntLit(value) => {
                self.push_int(*value);
                Ok(Type::Int)
            }
            ExprKind::DoubleLit(value) => {
                self.code.add_op(Op::Dload);
                self.code.add_f64(*value);
                Ok(Type::Double)
            }
            ExprKind::StrLit(text) => {
                let id = self
                    .module
                    .constants
                    .intern(text)
                    .ok_or(TranslationError::TooManyConstants)?;
                self.code.add_op(Op::Sload);
                self.code.add_u16(id);
                Ok(Type::Str)
            }
            ExprKind::Var(_) => {
                let var = self.var(expr.id);
                self.load_var(var);
                Ok(var.ty)
            }
            ExprKind::Call { name, args } => self.emit_call(expr, name, args),
            ExprKind::Unary { op, operand } => self.emit_unary(expr, *op, operand),
            ExprKind::Binary { op, left, right } => self.emit_binary(expr, *op, left, right),
        }
    }

    fn emit_call(
        &mut self,
        expr: &Expr,
        name: &str,
        args: &[Expr],
    ) -> Result<Type, TranslationError> {
        let target = self.resolution.calls[&expr.id];
        let (params, return_type) = match target {
            CallTarget::Function(id) => {
                let func = &self.module.functions[id as usize];
                (func.params.clone(), func.return_type)
            }
            CallTarget::Native(id) => {
                let native = &self.module.natives[id as usize];
                (native.params.clone(), native.return_type)
            }
        };
        if args.len() != params.len() {
            return Err(TranslationError::WrongArity {
                name: name.to_owned(),
                expected: params.len(),
                found: args.len(),
                position: expr.span.start,
            });
        }
        for (arg, param) in args.iter().zip(&params) {
            let ty = self.emit_expr(arg)?;
            self.coerce(ty, *param, arg.span.start)?;
        }
        match target {
            CallTarget::Function(id) => {
                self.code.add_op(Op::Call);
                self.code.add_u16(id);
            }
            CallTarget::Native(id) => {
                self.code.add_op(Op::CallNative);
                self.code.add_u16(id);
            }
        }
        Ok(return_type)
    }

    fn emit_unary(
        &mut self,
        expr: &Expr,
        op: UnaryOp,
        operand: &Expr,
    ) -> Result<Type, TranslationError> {
        match op {
            UnaryOp::Neg => {
                let ty = self.emit_expr(operand)?;
                match ty {
                    Type::Int => self.code.add_op(Op::Ineg),
                    Type::Double => self.code.add_op(Op::Dneg),
                    _ => {
                        return Err(TranslationError::BadOperandType {
                            op: "-",
                            operand: ty,
                            position: expr.span.start,
                        })
                    }
                }
                Ok(ty)
            }
            UnaryOp::Not => {
                self.emit_condition(operand)?;
                let mut is_zero = Label::new();
                let mut end = Label::new();
                self.push_int(0);
                self.code.add_branch(Op::IfIcmpE, &mut is_zero)?;
                self.push_int(0);
                self.code.add_branch(Op::Ja, &mut end)?;
                self.code.bind(&mut is_zero)?;
                self.push_int(1);
                self.code.bind(&mut end)?;
                Ok(Type::Int)
            }
        }
    }

    fn emit_binary(
        &mut self,
        expr: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Type, TranslationError> {
        if op.is_logical() {
            return self.emit_logical(op, left, right);
        }
        if op == BinaryOp::Mod {
            let lt = self.emit_expr(left)?;
            let rt = self.emit_expr(right)?;
            if lt != Type::Int || rt != Type::Int {
                return Err(self.bad_operands(op, lt, rt, expr.span.start));
            }
            self.code.add_op(Op::Imod);
            return Ok(Type::Int);
        }

        let lt = self.emit_expr(left)?;
        let rt = self.emit_expr(right)?;
        let common = self.unify_numeric(op, lt, rt, expr.span.start)?;

        if op.is_comparison() {
            return self.emit_comparison(op, common);
        }
        let code = match (common, op) {
            (Type::Int, BinaryOp::Add) => Op::Iadd,
            (Type::Int, BinaryOp::Sub) => Op::Isub,
            (Type::Int, BinaryOp::Mul) => Op::Imul,
            (Type::Int, BinaryOp::Div) => Op::Idiv,
            (Type::Double, BinaryOp::Add) => Op::Dadd,
            (Type::Double, BinaryOp::Sub) => Op::Dsub,
            (Type::Double, BinaryOp::Mul) => Op::Dmul,
            _ => Op::Ddiv,
        };
        self.code.add_op(code);
        Ok(common)
    }

    /// Both operands are already on the stack. Widen to double if the
    /// types are mixed; a buried int is widened under the top via Swap.
    fn unify_numeric(
        &mut self,
        op: BinaryOp,
        lt: Type,
        rt: Type,
        position: Position,
    ) -> Result<Type, TranslationError> {
        match (lt, rt) {
            (Type::Int, Type::Int) => Ok(Type::Int),
            (Type::Double, Type::Double) => Ok(Type::Double),
            (Type::Double, Type::Int) => {
                self.code.add_op(Op::I2d);
                Ok(Type::Double)
            }
            (Type::Int, Type::Double) => {
                self.code.add_op(Op::Swap);
                self.code.add_op(Op::I2d);
                self.code.add_op(Op::Swap);
                Ok(Type::Double)
            }
            _ => Err(self.bad_operands(op, lt, rt, position)),
        }
    }

    fn emit_comparison(&mut self, op: BinaryOp, common: Type) -> Result<Type, TranslationError> {
        let branch = match op {
            BinaryOp::Eq => Op::IfIcmpE,
            BinaryOp::Ne => Op::IfIcmpNe,
            BinaryOp::Lt => Op::IfIcmpL,
            BinaryOp::Le => Op::IfIcmpLe,
            BinaryOp::Gt => Op::IfIcmpG,
            _ => Op::IfIcmpGe,
        };
        // Doubles go through Dcmp, which reduces to comparing the sign of
        // the difference against zero.
        if common == Type::Double {
            self.code.add_op(Op::Dcmp);
            self.push_int(0);
        }
        let mut is_true = Label::new();
        let mut end = Label::new();
        self.code.add_branch(branch, &mut is_true)?;
        self.push_int(0);
        self.code.add_branch(Op::Ja, &mut end)?;
        self.code.bind(&mut is_true)?;
        self.push_int(1);
        self.code.bind(&mut end)?;
        Ok(Type::Int)
    }

    fn emit_logical(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Type, TranslationError> {
        let mut short = Label::new();
        let mut end = Label::new();
        let (branch, shortcut, fallthrough) = if op == BinaryOp::And {
            // Any zero operand decides the answer.
            (Op::IfIcmpE, 0, 1)
        } else {
            (Op::IfIcmpNe, 1, 0)
        };
        self.emit_condition(left)?;
        self.push_int(0);
        self.code.add_branch(branch, &mut short)?;
        self.emit_condition(right)?;
        self.push_int(0);
        self.code.add_branch(branch, &mut short)?;
        self.push_int(fallthrough);
        self.code.add_branch(Op::Ja, &mut end)?;
        self.code.bind(&mut short)?;
        self.push_int(shortcut);
        self.code.bind(&mut end)?;
        Ok(Type::Int)
    }

    /// Emit `expr` as a truth value: an int, with strings reduced to
    /// empty / non-empty.
    fn emit_condition(&mut self, expr: &Expr) -> Result<(), TranslationError> {
        let ty = self.emit_expr(expr)?;
        match ty {
            Type::Int => Ok(()),
            Type::Str => {
                self.code.add_op(Op::S2i);
                Ok(())
            }
            _ => Err(TranslationError::TypeMismatch {
                expected: Type::Int,
                found: ty,
                position: expr.span.start,
            }),
        }
    }

    /// Convert the value on top of the stack from `from` to `to`. Only
    /// int-to-double widening is implicit.
    fn coerce(&mut self, from: Type, to: Type, position: Position) -> Result<(), TranslationError> {
        if from == to && from != Type::Void && from != Type::Invalid {
            return Ok(());
        }
        if from == Type::Int && to == Type::Double {
            self.code.add_op(Op::I2d);
            return Ok(());
        }
        Err(TranslationError::TypeMismatch {
            expected: to,
            found: from,
            position,
        })
    }

    fn require(&self, found: Type, expected: Type, position: Position) -> Result<(), TranslationError> {
        if found == expected {
            Ok(())
        } else {
            Err(TranslationError::TypeMismatch {
                expected,
                found,
                position,
            })
        }
    }

    fn bad_operands(
        &self,
        op: BinaryOp,
        lhs: Type,
        rhs: Type,
        position: Position,
    ) -> TranslationError {
        TranslationError::BadOperandTypes {
            op: op.symbol(),
            lhs,
            rhs,
            position,
        }
    }

    fn push_int(&mut self, value: i64) {
        self.code.add_op(Op::Iload);
        self.code.add_i64(value);
    }

    fn load_var(&mut self, var: VarSlot) {
        if var.owner == self.current {
            let op = match var.ty {
                Type::Int => Op::LoadIVar,
                Type::Double => Op::LoadDVar,
                _ => Op::LoadSVar,
            };
            self.code.add_op(op);
            self.code.add_u16(var.slot);
        } else {
            let op = match var.ty {
                Type::Int => Op::LoadCtxIVar,
                Type::Double => Op::LoadCtxDVar,
                _ => Op::LoadCtxSVar,
            };
            self.code.add_op(op);
            self.code.add_u16(var.owner);
            self.code.add_u16(var.slot);
        }
    }

    fn store_var(&mut self, var: VarSlot) {
        if var.owner == self.current {
            let op = match var.ty {
                Type::Int => Op::StoreIVar,
                Type::Double => Op::StoreDVar,
                _ => Op::StoreSVar,
            };
            self.code.add_op(op);
            self.code.add_u16(var.slot);
        } else {
            let op = match var.ty {
                Type::Int => Op::StoreCtxIVar,
                Type::Double => Op::StoreCtxDVar,
                _ => Op::StoreCtxSVar,
            };
            self.code.add_op(op);
            self.code.add_u16(var.owner);
            self.code.add_u16(var.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::Op;
    use crate::lexer::lex;
    use crate::module::Module;
    use crate::parser::parse;
    use crate::translate::{translate, TranslationError};

    fn translate_source(source: &str) -> Result<Module, TranslationError> {
        let tokens = lex(source).expect("lexes");
        let program = parse(&tokens).expect("parses");
        translate(&program)
    }

    fn ops(module: &Module, id: u16) -> Vec<Op> {
        let code = &module.functions[id as usize].code;
        let mut out = Vec::new();
        let mut index = 0;
        while index < code.len() {
            let op = code.op_at(index).expect("valid opcode");
            out.push(op);
            index += 1 + op.operand_width() as u32;
        }
        out
    }

    #[test]
    fn top_level_ends_with_stop() {
        let module = translate_source("print(1);").unwrap();
        assert_eq!(ops(&module, 0), vec![Op::Iload, Op::PrintI, Op::Stop]);
    }

    #[test]
    fn mixed_arithmetic_widens_to_double() {
        let module = translate_source("print(1 + 2.5);").unwrap();
        assert_eq!(
            ops(&module, 0),
            vec![Op::Iload, Op::Dload, Op::Swap, Op::I2d, Op::Swap, Op::Dadd, Op::PrintD, Op::Stop]
        );
    }

    #[test]
    fn double_on_the_left_widens_the_right() {
        let module = translate_source("print(2.5 - 1);").unwrap();
        assert_eq!(
            ops(&module, 0),
            vec![Op::Dload, Op::Iload, Op::I2d, Op::Dsub, Op::PrintD, Op::Stop]
        );
    }

    #[test]
    fn int_comparison_avoids_icmp() {
        let module = translate_source("print(1 < 2);").unwrap();
        let ops = ops(&module, 0);
        assert!(ops.contains(&Op::IfIcmpL));
        assert!(!ops.contains(&Op::Icmp));
    }

    #[test]
    fn double_comparison_goes_through_dcmp() {
        let module = translate_source("print(1.5 < 2.5);").unwrap();
        assert!(ops(&module, 0).contains(&Op::Dcmp));
    }

    #[test]
    fn functions_end_with_return() {
        let module = translate_source(
            "function int f() { return 3; }\n\
             print(f());",
        )
        .unwrap();
        let f = ops(&module, 1);
        assert_eq!(f.first(), Some(&Op::Iload));
        assert!(f.contains(&Op::Return));
        assert_eq!(ops(&module, 0), vec![Op::Call, Op::PrintI, Op::Stop]);
    }

    #[test]
    fn nested_function_uses_context_accessors() {
        let module = translate_source(
            "int a;\n\
             function void bump() { a += 1; }\n\
             bump();",
        )
        .unwrap();
        let bump = ops(&module, 1);
        assert!(bump.contains(&Op::LoadCtxIVar));
        assert!(bump.contains(&Op::StoreCtxIVar));
    }

    #[test]
    fn string_literals_are_pooled() {
        let module = translate_source("print('a', 'b', 'a');").unwrap();
        assert_eq!(module.constants.len(), 2);
    }

    #[test]
    fn assigning_double_to_int_is_rejected() {
        let err = translate_source("int a; a = 1.5;").unwrap_err();
        assert!(matches!(err, TranslationError::TypeMismatch { .. }));
    }

    #[test]
    fn int_widens_on_assignment_to_double() {
        let module = translate_source("double d; d = 1;").unwrap();
        assert_eq!(
            ops(&module, 0),
            vec![Op::Iload, Op::I2d, Op::StoreDVar, Op::Stop]
        );
    }

    #[test]
    fn modulo_requires_ints() {
        let err = translate_source("print(5.0 % 2);").unwrap_err();
        assert!(matches!(err, TranslationError::BadOperandTypes { .. }));
    }

    #[test]
    fn call_arity_is_checked() {
        let err = translate_source(
            "function int f(int x) { return x; }\n\
             print(f(1, 2));",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TranslationError::WrongArity { expected: 1, found: 2, .. }
        ));
    }

    #[test]
    fn discarded_call_result_is_popped() {
        let module = translate_source(
            "function int f() { return 1; }\n\
             f();",
        )
        .unwrap();
        assert_eq!(ops(&module, 0), vec![Op::Call, Op::Pop, Op::Stop]);
    }

    #[test]
    fn return_value_in_void_function_is_rejected() {
        let err = translate_source("function void f() { return 1; } f();").unwrap_err();
        assert!(matches!(err, TranslationError::ReturnInVoid { .. }));
    }

    #[test]
    fn string_condition_goes_through_truthiness() {
        let module = translate_source("string s; if (s) { print(1); }").unwrap();
        assert!(ops(&module, 0).contains(&Op::S2i));
    }
}
