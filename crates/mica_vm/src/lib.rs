//! Mica bytecode interpreter.

mod frame;
mod runtime_error;
mod value;
mod vm;

pub use runtime_error::RuntimeError;
pub use vm::{interpret, RunOptions, Vm};

#[cfg(test)]
mod tests {
    use mica_core::bytecode::{Bytecode, Op};
    use mica_core::compile;
    use mica_core::module::{FunctionInfo, Module};
    use mica_core::Type;
    use mica_native::NativeError;

    use super::*;

    fn run(source: &str) -> String {
        let module = compile(source).expect("compiles");
        interpret(&module).expect("runs")
    }

    fn run_err(source: &str) -> RuntimeError {
        let module = compile(source).expect("compiles");
        interpret(&module).expect_err("fails at runtime")
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(run("print(20 / 3, ' ', 20 % 3);"), "6 2");
    }

    #[test]
    fn mixed_arithmetic_is_double() {
        assert_eq!(run("print(1 + 2.5);"), "3.5");
    }

    #[test]
    fn subtraction_keeps_operand_order() {
        assert_eq!(run("print(7 - 3, ' ', 7.5 - 0.5, ' ', 2 - 10);"), "4 7 -8");
    }

    #[test]
    fn unwritten_variables_read_as_zero() {
        assert_eq!(run("int a; double d; string s; print(a, ' ', d, s);"), "0 0");
    }

    #[test]
    fn for_ranges_are_inclusive() {
        assert_eq!(run("int i; for (i in 0..4) { print(i); }"), "01234");
    }

    #[test]
    fn for_bounds_evaluate_left_to_right_once() {
        assert_eq!(
            run("int i;\n\
                 function int lo() { print('l'); return 1; }\n\
                 function int hi() { print('h'); return 2; }\n\
                 for (i in lo()..hi()) { print(i); }"),
            "lh12"
        );
    }

    #[test]
    fn empty_ranges_skip_the_body() {
        assert_eq!(run("int i; for (i in 5..0) { print(i); } print('done');"), "done");
    }

    #[test]
    fn while_loops_run_to_exhaustion() {
        assert_eq!(
            run("int n; n = 3; while (n > 0) { print(n); n -= 1; }"),
            "321"
        );
    }

    #[test]
    fn if_takes_the_right_arm() {
        assert_eq!(
            run("int a; a = 2;\n\
                 if (a > 1) { print('big'); } else { print('small'); }\n\
                 if (a > 5) { print('?'); }"),
            "big"
        );
    }

    #[test]
    fn string_truthiness() {
        assert_eq!(
            run("if ('') { print('yes'); } else { print('no'); }\n\
                 if ('x') { print('yes'); }"),
            "noyes"
        );
    }

    #[test]
    fn logical_operators_short_circuit() {
        // The right operand would divide by zero if evaluated.
        assert_eq!(run("print(0 && 1 / 0, 1 || 1 / 0);"), "01");
    }

    #[test]
    fn recursion() {
        assert_eq!(
            run("function int fact(int n) {\n\
                   if (n < 2) { return 1; }\n\
                   return n * fact(n - 1);\n\
                 }\n\
                 print(fact(5));"),
            "120"
        );
    }

    #[test]
    fn nested_functions_reach_enclosing_variables() {
        assert_eq!(
            run("int count;\n\
                 function void bump() { count += 1; }\n\
                 bump(); bump(); bump();\n\
                 print(count);"),
            "3"
        );
    }

    #[test]
    fn context_reads_see_the_innermost_live_frame() {
        // After each recursive call returns, tell() reads the n of the
        // frame that is innermost at that moment.
        assert_eq!(
            run("function void outer(int n) {\n\
                   function void tell() { print(n); }\n\
                   if (n > 0) { outer(n - 1); }\n\
                   tell();\n\
                 }\n\
                 outer(2);"),
            "012"
        );
    }

    #[test]
    fn double_comparisons() {
        assert_eq!(
            run("double x; x = 1.5;\n\
                 print(x < 2.0, x > 2.0, x == 1.5, x != 1.5);"),
            "1010"
        );
    }

    #[test]
    fn division_by_zero_is_fatal_for_ints_only() {
        assert_eq!(run_err("print(1 / 0);"), RuntimeError::DivisionByZero);
        assert_eq!(run_err("int a; print(4 % a);"), RuntimeError::DivisionByZero);
        assert_eq!(run("print(1.0 / 0.0);"), "inf");
    }

    #[test]
    fn step_limit_stops_infinite_loops() {
        let module = compile("while (1) {}").unwrap();
        let options = RunOptions {
            step_limit: Some(10_000),
            ..RunOptions::default()
        };
        let mut vm = Vm::with_options(&module, options);
        assert_eq!(
            vm.run(),
            Err(RuntimeError::StepLimitExceeded { limit: 10_000 })
        );
    }

    #[test]
    fn runaway_recursion_hits_the_depth_limit() {
        let err = run_err("function void f() { f(); } f();");
        assert!(matches!(err, RuntimeError::CallDepthExceeded { .. }));
    }

    #[test]
    fn output_survives_a_runtime_error() {
        let module = compile("print('before '); print(1 / 0);").unwrap();
        let mut vm = Vm::new(&module);
        assert_eq!(vm.run(), Err(RuntimeError::DivisionByZero));
        assert_eq!(vm.output(), "before ");
    }

    #[test]
    fn native_int_call() {
        assert_eq!(
            run("function int size(string s) native 'strlen';\n\
                 print(size('tests'));"),
            "5"
        );
    }

    #[test]
    fn native_double_call() {
        // ldexp resolves from libc itself; it takes a float-class and an
        // integer-class argument and returns a double.
        assert_eq!(
            run("function double scale(double x, int e) native 'ldexp';\n\
                 print(scale(1.5, 3));"),
            "12"
        );
    }

    #[test]
    fn native_string_result() {
        assert_eq!(
            run("function string find(string hay, string needle) native 'strstr';\n\
                 print(find('stack machine', 'machine'));"),
            "machine"
        );
    }

    #[test]
    fn missing_native_symbol_fails_at_first_call() {
        // Declaring the native is fine; only calling it resolves the symbol.
        assert_eq!(
            run("function int ghost() native 'mica_no_such_symbol'; print('ok');"),
            "ok"
        );
        let err = run_err(
            "function int ghost() native 'mica_no_such_symbol';\n\
             print(ghost());",
        );
        assert_eq!(
            err,
            RuntimeError::Native(NativeError::SymbolNotFound(
                "mica_no_such_symbol".to_owned()
            ))
        );
    }

    #[test]
    fn context_access_without_a_live_frame_is_a_broken_closure() {
        // Hand-built module: the top function reads a context variable of
        // function 1, which never gets a frame.
        let mut code = Bytecode::new();
        code.add_op(Op::LoadCtxIVar);
        code.add_u16(1);
        code.add_u16(0);
        code.add_op(Op::PrintI);
        code.add_op(Op::Stop);
        let module = Module {
            constants: Default::default(),
            functions: vec![
                FunctionInfo {
                    id: 0,
                    name: "<top>".to_owned(),
                    params: vec![],
                    return_type: Type::Void,
                    locals: 0,
                    code,
                },
                FunctionInfo {
                    id: 1,
                    name: "orphan".to_owned(),
                    params: vec![],
                    return_type: Type::Void,
                    locals: 1,
                    code: Bytecode::new(),
                },
            ],
            natives: vec![],
        };
        assert_eq!(
            interpret(&module),
            Err(RuntimeError::BrokenClosure { context: 1 })
        );
    }

    #[test]
    fn icmp_pushes_the_sign_of_the_difference() {
        // The translator prefers the fused compare-and-branch forms, so
        // Icmp only shows up in hand-built modules.
        let mut code = Bytecode::new();
        for (a, b) in [(1i64, 2i64), (2, 2), (5, -1)] {
            code.add_op(Op::Iload);
            code.add_i64(a);
            code.add_op(Op::Iload);
            code.add_i64(b);
            code.add_op(Op::Icmp);
            code.add_op(Op::PrintI);
        }
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
        assert_eq!(interpret(&module).unwrap(), "-101");
    }

    #[test]
    fn malformed_bytecode_is_reported_not_trusted() {
        let mut code = Bytecode::new();
        code.add_op(Op::Iload);
        // Truncated operand: only two of the eight bytes follow.
        code.add_u16(7);
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
        assert!(matches!(
            interpret(&module),
            Err(RuntimeError::MalformedBytecode { .. })
        ));
    }

    #[test]
    fn stack_underflow_is_reported() {
        let mut code = Bytecode::new();
        code.add_op(Op::Iadd);
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
        assert_eq!(interpret(&module), Err(RuntimeError::StackUnderflow));
    }
}
