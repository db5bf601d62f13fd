//! The bytecode interpreter.
//!
//! A straightforward dispatch loop over one operand stack and the frame
//! arena in [`crate::frame`]. The translator guarantees well-typed
//! bytecode, so every type or bounds check here failing means the module
//! was built or patched by hand; the interpreter still refuses to trust
//! its input and reports instead of crashing.

use mica_core::bytecode::Op;
use mica_core::module::{Module, TOP_FUNCTION_ID};
use mica_core::Type;
use mica_native::{Bridge, NativeArg, NativeReturn};

use crate::frame::FrameStack;
use crate::runtime_error::RuntimeError;
use crate::value::{StrRef, Value};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Abort after this many executed instructions.
    pub step_limit: Option<u64>,
    /// Maximum call stack depth, in frames.
    pub max_call_depth: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            step_limit: None,
            max_call_depth: 8192,
        }
    }
}

/// Run a module to completion and return what it printed. Output produced
/// before a runtime error is discarded; use [`Vm`] directly to keep it.
pub fn interpret(module: &Module) -> Result<String, RuntimeError> {
    let mut vm = Vm::new(module);
    vm.run()?;
    Ok(vm.into_output())
}

pub struct Vm<'m> {
    module: &'m Module,
    options: RunOptions,
    stack: Vec<Value>,
    frames: FrameStack,
    /// Strings returned by native calls, referenced by `StrRef::Owned`.
    owned: Vec<String>,
    output: String,
    bridge: Option<Bridge>,
    steps: u64,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self::with_options(module, RunOptions::default())
    }

    pub fn with_options(module: &'m Module, options: RunOptions) -> Self {
        Vm {
            module,
            options,
            stack: Vec::new(),
            frames: FrameStack::new(module.functions.len()),
            owned: Vec::new(),
            output: String::new(),
            bridge: None,
            steps: 0,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let top = self
            .module
            .top()
            .ok_or(RuntimeError::UnknownFunction { id: TOP_FUNCTION_ID })?;
        self.frames.push(TOP_FUNCTION_ID, top.locals);
        loop {
            if let Some(limit) = self.options.step_limit {
                if self.steps >= limit {
                    return Err(RuntimeError::StepLimitExceeded { limit });
                }
            }
            self.steps += 1;
            if !self.step()? {
                return Ok(());
            }
        }
    }

    /// Execute one instruction. Returns false when the program halts.
    fn step(&mut self) -> Result<bool, RuntimeError> {
        let module = self.module;
        let (function, ip) = match self.frames.current() {
            Some(frame) => (frame.function, frame.ip),
            None => return Ok(false),
        };
        let func = module
            .function(function)
            .ok_or(RuntimeError::UnknownFunction { id: function })?;
        let code = &func.code;
        let op = code
            .op_at(ip)
            .ok_or_else(|| malformed(function, ip, "invalid opcode"))?;
        let operand = ip + 1;
        let mut next = operand + op.operand_width() as u32;

        macro_rules! operand_u16 {
            ($at:expr) => {
                code.u16_at($at)
                    .ok_or_else(|| malformed(function, ip, "truncated operand"))?
            };
        }

        match op {
            Op::Invalid => return Err(malformed(function, ip, "invalid opcode")),

            Op::Iload => {
                let value = code
                    .i64_at(operand)
                    .ok_or_else(|| malformed(function, ip, "truncated operand"))?;
                self.push(Value::Int(value));
            }
            Op::Dload => {
                let value = code
                    .f64_at(operand)
                    .ok_or_else(|| malformed(function, ip, "truncated operand"))?;
                self.push(Value::Double(value));
            }
            Op::Sload => {
                let id = operand_u16!(operand);
                if module.constants.get(id).is_none() {
                    return Err(RuntimeError::UnknownConstant { id });
                }
                self.push(Value::Str(StrRef::Const(id)));
            }

            Op::Iadd => self.int_binop(i64::wrapping_add)?,
            Op::Isub => self.int_binop(i64::wrapping_sub)?,
            Op::Imul => self.int_binop(i64::wrapping_mul)?,
            Op::Idiv => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.push(Value::Int(a.wrapping_div(b)));
            }
            Op::Imod => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                self.push(Value::Int(a.wrapping_rem(b)));
            }
            Op::Ineg => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_neg()));
            }

            Op::Dadd => self.double_binop(|a, b| a + b)?,
            Op::Dsub => self.double_binop(|a, b| a - b)?,
            Op::Dmul => self.double_binop(|a, b| a * b)?,
            // IEEE division; x/0.0 is inf or NaN, not an error.
            Op::Ddiv => self.double_binop(|a, b| a / b)?,
            Op::Dneg => {
                let a = self.pop_double()?;
                self.push(Value::Double(-a));
            }

            Op::I2d => {
                let a = self.pop_int()?;
                self.push(Value::Double(a as f64));
            }
            Op::D2i => {
                // Saturating truncation toward zero.
                let a = self.pop_double()?;
                self.push(Value::Int(a as i64));
            }
            Op::S2i => {
                let r = self.pop_str()?;
                let truthy = !self.str_text(r, function, ip)?.is_empty();
                self.push(Value::Int(truthy as i64));
            }

            Op::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Op::Pop => {
                self.pop()?;
            }

            Op::LoadIVar | Op::LoadDVar | Op::LoadSVar => {
                let slot = operand_u16!(operand);
                let value = self.read_slot(function, slot, load_type(op))?;
                self.push(value);
            }
            Op::StoreIVar | Op::StoreDVar | Op::StoreSVar => {
                let slot = operand_u16!(operand);
                let value = self.pop_typed(load_type(op))?;
                self.write_slot(function, slot, value)?;
            }
            Op::LoadCtxIVar | Op::LoadCtxDVar | Op::LoadCtxSVar => {
                let context = operand_u16!(operand);
                let slot = operand_u16!(operand + 2);
                let value = self.read_ctx_slot(context, slot, load_type(op))?;
                self.push(value);
            }
            Op::StoreCtxIVar | Op::StoreCtxDVar | Op::StoreCtxSVar => {
                let context = operand_u16!(operand);
                let slot = operand_u16!(operand + 2);
                let value = self.pop_typed(load_type(op))?;
                self.write_ctx_slot(context, slot, value)?;
            }

            Op::Icmp => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Value::Int(a.cmp(&b) as i64));
            }
            Op::Dcmp => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                // NaN compares as greater, matching an a < b / a == b chain.
                let sign = if a < b {
                    -1
                } else if a == b {
                    0
                } else {
                    1
                };
                self.push(Value::Int(sign));
            }

            Op::Ja => {
                next = self.branch_target(func, ip)?;
            }
            Op::IfIcmpE | Op::IfIcmpNe | Op::IfIcmpG | Op::IfIcmpGe | Op::IfIcmpL
            | Op::IfIcmpLe => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let taken = match op {
                    Op::IfIcmpE => a == b,
                    Op::IfIcmpNe => a != b,
                    Op::IfIcmpG => a > b,
                    Op::IfIcmpGe => a >= b,
                    Op::IfIcmpL => a < b,
                    _ => a <= b,
                };
                if taken {
                    next = self.branch_target(func, ip)?;
                }
            }

            Op::PrintI => {
                let a = self.pop_int()?;
                self.output.push_str(&a.to_string());
            }
            Op::PrintD => {
                let a = self.pop_double()?;
                self.output.push_str(&a.to_string());
            }
            Op::PrintS => {
                let r = self.pop_str()?;
                match r {
                    StrRef::Empty => {}
                    StrRef::Const(id) => {
                        let text = module
                            .constants
                            .get(id)
                            .ok_or(RuntimeError::UnknownConstant { id })?;
                        self.output.push_str(text);
                    }
                    StrRef::Owned(index) => {
                        let text = self
                            .owned
                            .get(index as usize)
                            .cloned()
                            .ok_or_else(|| malformed(function, ip, "dangling native string"))?;
                        self.output.push_str(&text);
                    }
                }
            }

            Op::Call => {
                let id = operand_u16!(operand);
                self.enter_function(id, next)?;
                return Ok(true);
            }
            Op::CallNative => {
                let id = operand_u16!(operand);
                self.call_native(id, function, ip)?;
            }
            Op::Return => return Ok(self.frames.pop()),
            Op::Stop => return Ok(false),
        }

        if let Some(frame) = self.frames.current_mut() {
            frame.ip = next;
        }
        Ok(true)
    }

    fn enter_function(&mut self, id: u16, return_to: u32) -> Result<(), RuntimeError> {
        let func = self
            .module
            .function(id)
            .ok_or(RuntimeError::UnknownFunction { id })?;
        if self.frames.depth() >= self.options.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded {
                limit: self.options.max_call_depth,
            });
        }
        let params = &func.params;
        if (func.locals as usize) < params.len() {
            return Err(malformed(id, 0, "frame smaller than parameter list"));
        }
        // Arguments were pushed left to right; pop them back into the
        // first slots of the callee frame.
        let mut args = Vec::with_capacity(params.len());
        for &ty in params.iter().rev() {
            args.push(self.pop_typed(ty)?);
        }
        if let Some(frame) = self.frames.current_mut() {
            frame.ip = return_to;
        }
        self.frames.push(id, func.locals);
        let frame = self
            .frames
            .current_mut()
            .ok_or(RuntimeError::StackUnderflow)?;
        for (slot, value) in args.into_iter().rev().enumerate() {
            frame.locals[slot] = Some(value);
        }
        Ok(())
    }

    fn call_native(&mut self, id: u16, function: u16, ip: u32) -> Result<(), RuntimeError> {
        let native = self
            .module
            .native(id)
            .ok_or(RuntimeError::UnknownNative { id })?;
        let mut args = Vec::with_capacity(native.params.len());
        for &ty in native.params.iter().rev() {
            let arg = match ty {
                Type::Int => NativeArg::Int(self.pop_int()?),
                Type::Double => NativeArg::Double(self.pop_double()?),
                _ => {
                    let r = self.pop_str()?;
                    NativeArg::Str(self.str_text(r, function, ip)?.to_owned())
                }
            };
            args.push(arg);
        }
        args.reverse();

        // The bridge is opened at the first native call; a program that
        // never reaches one never touches the loader.
        let bridge = match &mut self.bridge {
            Some(bridge) => bridge,
            empty => empty.insert(Bridge::host_process()?),
        };
        let result = bridge.call(&native.name, &native.symbol, &args, native.return_type)?;
        match result {
            NativeReturn::Int(value) => self.push(Value::Int(value)),
            NativeReturn::Double(value) => self.push(Value::Double(value)),
            NativeReturn::Str(text) => {
                let index = self.owned.len() as u32;
                self.owned.push(text);
                self.push(Value::Str(StrRef::Owned(index)));
            }
            NativeReturn::Void => {}
        }
        Ok(())
    }

    fn branch_target(
        &self,
        func: &mica_core::module::FunctionInfo,
        ip: u32,
    ) -> Result<u32, RuntimeError> {
        let offset = func
            .code
            .i16_at(ip + 1)
            .ok_or_else(|| malformed(func.id, ip, "truncated branch offset"))?;
        let target = ip as i64 + 3 + offset as i64;
        if target < 0 || target >= func.code.len() as i64 {
            return Err(malformed(func.id, ip, "branch outside the function"));
        }
        Ok(target as u32)
    }

    fn read_slot(&self, function: u16, slot: u16, ty: Type) -> Result<Value, RuntimeError> {
        let frame = self
            .frames
            .current()
            .ok_or(RuntimeError::StackUnderflow)?;
        self.read_frame_slot(frame, function, slot, ty)
    }

    fn read_ctx_slot(&self, context: u16, slot: u16, ty: Type) -> Result<Value, RuntimeError> {
        let index = self
            .frames
            .innermost_of(context)
            .ok_or(RuntimeError::BrokenClosure { context })?;
        let frame = self.frames.frame(index);
        self.read_frame_slot(frame, context, slot, ty)
    }

    fn read_frame_slot(
        &self,
        frame: &crate::frame::Frame,
        function: u16,
        slot: u16,
        ty: Type,
    ) -> Result<Value, RuntimeError> {
        let cell = frame
            .locals
            .get(slot as usize)
            .ok_or_else(|| malformed(function, frame.ip, "slot out of range"))?;
        match cell {
            None => Ok(Value::zero(ty)),
            Some(value) if value.type_of() == ty => Ok(*value),
            Some(value) => Err(RuntimeError::UnexpectedOperand {
                expected: ty,
                found: value.type_of(),
            }),
        }
    }

    fn write_slot(&mut self, function: u16, slot: u16, value: Value) -> Result<(), RuntimeError> {
        let frame = self
            .frames
            .current_mut()
            .ok_or(RuntimeError::StackUnderflow)?;
        let cell = frame
            .locals
            .get_mut(slot as usize)
            .ok_or_else(|| malformed(function, 0, "slot out of range"))?;
        *cell = Some(value);
        Ok(())
    }

    fn write_ctx_slot(&mut self, context: u16, slot: u16, value: Value) -> Result<(), RuntimeError> {
        let index = self
            .frames
            .innermost_of(context)
            .ok_or(RuntimeError::BrokenClosure { context })?;
        let frame = self.frames.frame_mut(index);
        let cell = frame
            .locals
            .get_mut(slot as usize)
            .ok_or_else(|| malformed(context, 0, "slot out of range"))?;
        *cell = Some(value);
        Ok(())
    }

    fn str_text(&self, r: StrRef, function: u16, ip: u32) -> Result<&str, RuntimeError> {
        match r {
            StrRef::Empty => Ok(""),
            StrRef::Const(id) => self
                .module
                .constants
                .get(id)
                .ok_or(RuntimeError::UnknownConstant { id }),
            StrRef::Owned(index) => self
                .owned
                .get(index as usize)
                .map(String::as_str)
                .ok_or_else(|| malformed(function, ip, "dangling native string")),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_typed(&mut self, ty: Type) -> Result<Value, RuntimeError> {
        let value = self.pop()?;
        if value.type_of() != ty {
            return Err(RuntimeError::UnexpectedOperand {
                expected: ty,
                found: value.type_of(),
            });
        }
        Ok(value)
    }

    fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        match self.pop()? {
            Value::Int(value) => Ok(value),
            other => Err(RuntimeError::UnexpectedOperand {
                expected: Type::Int,
                found: other.type_of(),
            }),
        }
    }

    fn pop_double(&mut self) -> Result<f64, RuntimeError> {
        match self.pop()? {
            Value::Double(value) => Ok(value),
            other => Err(RuntimeError::UnexpectedOperand {
                expected: Type::Double,
                found: other.type_of(),
            }),
        }
    }

    fn pop_str(&mut self) -> Result<StrRef, RuntimeError> {
        match self.pop()? {
            Value::Str(r) => Ok(r),
            other => Err(RuntimeError::UnexpectedOperand {
                expected: Type::Str,
                found: other.type_of(),
            }),
        }
    }

    fn int_binop(&mut self, apply: fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(apply(a, b)));
        Ok(())
    }

    fn double_binop(&mut self, apply: fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop_double()?;
        let a = self.pop_double()?;
        self.push(Value::Double(apply(a, b)));
        Ok(())
    }
}

fn load_type(op: Op) -> Type {
    match op {
        Op::LoadIVar | Op::StoreIVar | Op::LoadCtxIVar | Op::StoreCtxIVar => Type::Int,
        Op::LoadDVar | Op::StoreDVar | Op::LoadCtxDVar | Op::StoreCtxDVar => Type::Double,
        _ => Type::Str,
    }
}

fn malformed(function: u16, offset: u32, detail: &str) -> RuntimeError {
    RuntimeError::MalformedBytecode {
        function,
        offset,
        detail: detail.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use mica_core::bytecode::{Bytecode, Op};
    use mica_core::module::{FunctionInfo, Module};
    use mica_core::Type;

    use super::*;

    // Owned string references only come from native calls and stay valid
    // for the life of the VM, so a dangling one can only be planted by
    // hand. It must still be reported, not papered over.
    #[test]
    fn dangling_native_string_is_reported() {
        let mut code = Bytecode::new();
        code.add_op(Op::PrintS);
        code.add_op(Op::Stop);
        let module = Module {
            constants: Default::default(),
            functions: vec![FunctionInfo {
                id: 0,
                name: "<top>".to_owned(),
                params: vec![],
                return_type: Type::Void,
                locals: 0,
                code,
            }],
            natives: vec![],
        };
        let mut vm = Vm::new(&module);
        vm.stack.push(Value::Str(StrRef::Owned(7)));
        assert!(matches!(
            vm.run(),
            Err(RuntimeError::MalformedBytecode { ref detail, .. })
                if detail == "dangling native string"
        ));
    }
}
