//! Human-readable bytecode listings.

use std::fmt::Write;

use crate::bytecode::Op;
use crate::module::{FunctionInfo, Module};

pub fn disassemble(module: &Module) -> String {
    let mut out = String::new();
    for id in 0..module.constants.len() {
        if let Some(text) = module.constants.get(id as u16) {
            let _ = writeln!(out, ".const {id} {text:?}");
        }
    }
    for func in &module.functions {
        let _ = writeln!(out);
        disassemble_function(&mut out, module, func);
    }
    for native in &module.natives {
        let _ = writeln!(
            out,
            "\n.native {} {} '{}' ({} params) -> {}",
            native.id,
            native.name,
            native.symbol,
            native.params.len(),
            native.return_type
        );
    }
    out
}

fn disassemble_function(out: &mut String, module: &Module, func: &FunctionInfo) {
    let _ = writeln!(
        out,
        ".function {} {} ({} params, {} locals) -> {}",
        func.id,
        func.name,
        func.params.len(),
        func.locals,
        func.return_type
    );
    let code = &func.code;
    let mut index = 0u32;
    while index < code.len() {
        let Some(op) = code.op_at(index) else {
            let _ = writeln!(out, "  {index:6}: .byte {:#04x}", code.byte_at(index).unwrap_or(0));
            index += 1;
            continue;
        };
        let _ = write!(out, "  {index:6}: {}", op.mnemonic());
        let operand = index + 1;
        match op {
            Op::Iload => {
                let _ = write!(out, " {}", code.i64_at(operand).unwrap_or(0));
            }
            Op::Dload => {
                let _ = write!(out, " {}", code.f64_at(operand).unwrap_or(0.0));
            }
            Op::Sload => {
                let id = code.u16_at(operand).unwrap_or(0);
                let text = module.constants.get(id).unwrap_or("<bad id>");
                let _ = write!(out, " {id} {text:?}");
            }
            Op::LoadIVar | Op::LoadDVar | Op::LoadSVar | Op::StoreIVar | Op::StoreDVar
            | Op::StoreSVar => {
                let _ = write!(out, " @{}", code.u16_at(operand).unwrap_or(0));
            }
            Op::LoadCtxIVar | Op::LoadCtxDVar | Op::LoadCtxSVar | Op::StoreCtxIVar
            | Op::StoreCtxDVar | Op::StoreCtxSVar => {
                let ctx = code.u16_at(operand).unwrap_or(0);
                let slot = code.u16_at(operand + 2).unwrap_or(0);
                let _ = write!(out, " ctx={ctx} @{slot}");
            }
            op if op.is_branch() => {
                let offset = code.i16_at(operand).unwrap_or(0);
                let target = (operand as i64 + 2 + offset as i64).max(0);
                let _ = write!(out, " {offset:+} -> {target}");
            }
            Op::Call | Op::CallNative => {
                let id = code.u16_at(operand).unwrap_or(0);
                let name = if op == Op::Call {
                    module.function(id).map(|f| f.name.as_str())
                } else {
                    module.native(id).map(|n| n.name.as_str())
                };
                let _ = write!(out, " {id} ({})", name.unwrap_or("<bad id>"));
            }
            _ => {}
        }
        let _ = writeln!(out);
        index = operand + op.operand_width() as u32;
    }
}
