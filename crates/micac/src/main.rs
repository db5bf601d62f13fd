use std::env;
use std::fs;
use std::process;

use serde::Serialize;

use mica_core::{compile, disasm, CompileError, TOOL_NAME, VERSION};
use mica_vm::{RunOptions, RuntimeError, Vm};

const HELP: &str = "\
Mica compiler and interpreter

Usage:
  mica <command> [options]

Commands:
  check <file> [--json]
  run <file> [--json] [--step-limit <n>]
  disasm <file>

Options:
  -h, --help     Show this help message
  --version      Show version information
";

const CHECK_HELP: &str = "\
Usage:
  mica check <file> [--json]

Options:
  --json         Emit a JSON report instead of plain diagnostics
  -h, --help     Show this help message
";

const RUN_HELP: &str = "\
Usage:
  mica run <file> [--json] [--step-limit <n>]

Options:
  --json         Emit a JSON report (program output goes into the report)
  --step-limit   Abort after <n> executed instructions
  -h, --help     Show this help message
";

const DISASM_HELP: &str = "\
Usage:
  mica disasm <file>

Options:
  -h, --help     Show this help message
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Check {
        path: String,
        json: bool,
    },
    Run {
        path: String,
        json: bool,
        step_limit: Option<u64>,
    },
    Disasm {
        path: String,
    },
}

#[derive(Serialize)]
struct Issue {
    phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: String,
}

#[derive(Serialize)]
struct Report {
    tool: &'static str,
    version: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Issue>,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help") {
        print!("{HELP}");
        return;
    }
    if args[0] == "--version" {
        println!("{TOOL_NAME} {VERSION}");
        return;
    }
    if args[0] == "check" && contains_help_flag(&args[1..]) {
        print!("{CHECK_HELP}");
        return;
    }
    if args[0] == "run" && contains_help_flag(&args[1..]) {
        print!("{RUN_HELP}");
        return;
    }
    if args[0] == "disasm" && contains_help_flag(&args[1..]) {
        print!("{DISASM_HELP}");
        return;
    }

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            eprintln!("{HELP}");
            process::exit(2);
        }
    };

    process::exit(execute(command));
}

fn contains_help_flag(args: &[String]) -> bool {
    args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help"))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    match args[0].as_str() {
        "check" => parse_check(&args[1..]),
        "run" => parse_run(&args[1..]),
        "disasm" => parse_disasm(&args[1..]),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_check(args: &[String]) -> Result<Command, String> {
    let mut path = None;
    let mut json = false;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            _ => set_path(&mut path, arg)?,
        }
    }
    let path = path.ok_or_else(|| "missing path for check".to_string())?;
    Ok(Command::Check { path, json })
}

fn parse_run(args: &[String]) -> Result<Command, String> {
    let mut path = None;
    let mut json = false;
    let mut step_limit = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--step-limit" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--step-limit needs a value".to_string())?;
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid step limit '{value}'"))?;
                step_limit = Some(parsed);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            _ => set_path(&mut path, arg)?,
        }
    }
    let path = path.ok_or_else(|| "missing path for run".to_string())?;
    Ok(Command::Run {
        path,
        json,
        step_limit,
    })
}

fn parse_disasm(args: &[String]) -> Result<Command, String> {
    let mut path = None;
    for arg in args {
        match arg.as_str() {
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            _ => set_path(&mut path, arg)?,
        }
    }
    let path = path.ok_or_else(|| "missing path for disasm".to_string())?;
    Ok(Command::Disasm { path })
}

fn set_path(slot: &mut Option<String>, arg: &str) -> Result<(), String> {
    if slot.is_some() {
        return Err(format!("unexpected argument '{arg}'"));
    }
    *slot = Some(arg.to_owned());
    Ok(())
}

fn execute(command: Command) -> i32 {
    match command {
        Command::Check { path, json } => check(&path, json),
        Command::Run {
            path,
            json,
            step_limit,
        } => run(&path, json, step_limit),
        Command::Disasm { path } => disassemble(&path),
    }
}

fn read_source(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("cannot read '{path}': {err}"))
}

fn compile_issue(error: &CompileError) -> Issue {
    let phase = match error {
        CompileError::Lex(_) => "lex",
        CompileError::Parse(_) => "parse",
        CompileError::Translate(_) => "translation",
    };
    Issue {
        phase,
        code: None,
        message: error.to_string(),
    }
}

fn runtime_issue(error: &RuntimeError) -> Issue {
    Issue {
        phase: "runtime",
        code: Some(error.code()),
        message: error.to_string(),
    }
}

fn print_report(report: &Report) {
    let rendered = serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string());
    println!("{rendered}");
}

fn check(path: &str, json: bool) -> i32 {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };
    match compile(&source) {
        Ok(_) => {
            if json {
                print_report(&Report {
                    tool: TOOL_NAME,
                    version: VERSION,
                    ok: true,
                    stdout: None,
                    error: None,
                });
            }
            0
        }
        Err(error) => {
            if json {
                print_report(&Report {
                    tool: TOOL_NAME,
                    version: VERSION,
                    ok: false,
                    stdout: None,
                    error: Some(compile_issue(&error)),
                });
            } else {
                eprintln!("{path}: {error}");
            }
            1
        }
    }
}

fn run(path: &str, json: bool, step_limit: Option<u64>) -> i32 {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };
    let module = match compile(&source) {
        Ok(module) => module,
        Err(error) => {
            if json {
                print_report(&Report {
                    tool: TOOL_NAME,
                    version: VERSION,
                    ok: false,
                    stdout: None,
                    error: Some(compile_issue(&error)),
                });
            } else {
                eprintln!("{path}: {error}");
            }
            return 1;
        }
    };

    let options = RunOptions {
        step_limit,
        ..RunOptions::default()
    };
    let mut vm = Vm::with_options(&module, options);
    let result = vm.run();
    match result {
        Ok(()) => {
            if json {
                print_report(&Report {
                    tool: TOOL_NAME,
                    version: VERSION,
                    ok: true,
                    stdout: Some(vm.into_output()),
                    error: None,
                });
            } else {
                print!("{}", vm.output());
            }
            0
        }
        Err(error) => {
            if json {
                print_report(&Report {
                    tool: TOOL_NAME,
                    version: VERSION,
                    ok: false,
                    stdout: Some(vm.into_output()),
                    error: Some(runtime_issue(&error)),
                });
            } else {
                // Whatever the program printed before failing still counts.
                print!("{}", vm.output());
                eprintln!("runtime error: {error}");
            }
            1
        }
    }
}

fn disassemble(path: &str) -> i32 {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };
    match compile(&source) {
        Ok(module) => {
            print!("{}", disasm::disassemble(&module));
            0
        }
        Err(error) => {
            eprintln!("{path}: {error}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_options() {
        let args = vec![
            "run".to_string(),
            "prog.mica".to_string(),
            "--json".to_string(),
            "--step-limit".to_string(),
            "5000".to_string(),
        ];
        assert_eq!(
            parse_command(&args).unwrap(),
            Command::Run {
                path: "prog.mica".to_string(),
                json: true,
                step_limit: Some(5000),
            }
        );
    }

    #[test]
    fn rejects_unknown_options() {
        let args = vec!["check".to_string(), "--weird".to_string()];
        assert!(parse_command(&args).is_err());
    }

    #[test]
    fn rejects_extra_paths() {
        let args = vec!["disasm".to_string(), "a".to_string(), "b".to_string()];
        assert!(parse_command(&args).is_err());
    }
}
