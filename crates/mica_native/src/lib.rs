//! Host-process native calls.
//!
//! Declared natives are bound by symbol name against the running process,
//! so anything the interpreter binary links (libc included) is callable.
//! Arguments are marshalled through a pair of canonical `extern "C"` call
//! shapes: one slot per integer-class argument (ints and string pointers)
//! and one per float-class argument. On the supported SysV x86-64 and
//! AAPCS64 ABIs the first four of each class travel in registers, and a
//! callee taking fewer simply ignores the rest, so a single shape covers
//! every signature within those limits.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};

use libloading::Library;
use thiserror::Error;

use mica_core::Type;

/// Register-class argument limits of the canonical call shapes.
pub const MAX_INT_ARGS: usize = 4;
pub const MAX_FLOAT_ARGS: usize = 4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    #[error("cannot open host process symbols: {0}")]
    HostOpen(String),
    #[error("native symbol '{0}' not found in the host process")]
    SymbolNotFound(String),
    #[error("native function '{name}' has an unsupported signature: {reason}")]
    UnsupportedSignature { name: String, reason: String },
    #[error("string argument for native '{0}' contains a NUL byte")]
    InvalidString(String),
}

#[derive(Debug, Clone)]
pub enum NativeArg {
    Int(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone)]
pub enum NativeReturn {
    Int(i64),
    Double(f64),
    Str(String),
    Void,
}

type IntShape = unsafe extern "C" fn(i64, i64, i64, i64, f64, f64, f64, f64) -> i64;
type FloatShape = unsafe extern "C" fn(i64, i64, i64, i64, f64, f64, f64, f64) -> f64;

/// Resolves and calls symbols in the host process. Resolved addresses are
/// cached per symbol name.
pub struct Bridge {
    lib: Library,
    cache: HashMap<String, *mut c_void>,
}

impl Bridge {
    /// Open the running process itself as a library.
    pub fn host_process() -> Result<Self, NativeError> {
        Ok(Bridge {
            lib: open_self()?,
            cache: HashMap::new(),
        })
    }

    fn resolve(&mut self, symbol: &str) -> Result<*mut c_void, NativeError> {
        if let Some(&addr) = self.cache.get(symbol) {
            return Ok(addr);
        }
        let addr: *mut c_void = unsafe {
            *self
                .lib
                .get::<*mut c_void>(symbol.as_bytes())
                .map_err(|_| NativeError::SymbolNotFound(symbol.to_owned()))?
        };
        if addr.is_null() {
            return Err(NativeError::SymbolNotFound(symbol.to_owned()));
        }
        self.cache.insert(symbol.to_owned(), addr);
        Ok(addr)
    }

    /// Call `symbol` with `args`, interpreting the result as `return_type`.
    ///
    /// A returned `char*` is copied out immediately, so the callee may
    /// reuse or free its buffer afterwards.
    pub fn call(
        &mut self,
        name: &str,
        symbol: &str,
        args: &[NativeArg],
        return_type: Type,
    ) -> Result<NativeReturn, NativeError> {
        let mut ints = [0i64; MAX_INT_ARGS];
        let mut floats = [0f64; MAX_FLOAT_ARGS];
        let mut int_count = 0;
        let mut float_count = 0;
        // Keep marshalled C strings alive across the call.
        let mut holders: Vec<CString> = Vec::new();

        for arg in args {
            match arg {
                NativeArg::Int(value) => {
                    if int_count == MAX_INT_ARGS {
                        return Err(self.too_many(name, "integer"));
                    }
                    ints[int_count] = *value;
                    int_count += 1;
                }
                NativeArg::Str(text) => {
                    if int_count == MAX_INT_ARGS {
                        return Err(self.too_many(name, "integer"));
                    }
                    let cstr = CString::new(text.as_str())
                        .map_err(|_| NativeError::InvalidString(name.to_owned()))?;
                    ints[int_count] = cstr.as_ptr() as i64;
                    holders.push(cstr);
                    int_count += 1;
                }
                NativeArg::Double(value) => {
                    if float_count == MAX_FLOAT_ARGS {
                        return Err(self.too_many(name, "float"));
                    }
                    floats[float_count] = *value;
                    float_count += 1;
                }
            }
        }

        let addr = self.resolve(symbol)?;
        let result = unsafe {
            match return_type {
                Type::Double => {
                    let func: FloatShape = std::mem::transmute(addr);
                    NativeReturn::Double(func(
                        ints[0], ints[1], ints[2], ints[3], floats[0], floats[1], floats[2],
                        floats[3],
                    ))
                }
                _ => {
                    let func: IntShape = std::mem::transmute(addr);
                    let raw = func(
                        ints[0], ints[1], ints[2], ints[3], floats[0], floats[1], floats[2],
                        floats[3],
                    );
                    match return_type {
                        Type::Int => NativeReturn::Int(raw),
                        Type::Str => NativeReturn::Str(copy_c_string(raw as *const c_char)),
                        _ => NativeReturn::Void,
                    }
                }
            }
        };
        drop(holders);
        Ok(result)
    }

    fn too_many(&self, name: &str, class: &str) -> NativeError {
        NativeError::UnsupportedSignature {
            name: name.to_owned(),
            reason: format!("more than {MAX_INT_ARGS} {class}-class arguments"),
        }
    }
}

#[cfg(unix)]
fn open_self() -> Result<Library, NativeError> {
    Ok(Library::from(libloading::os::unix::Library::this()))
}

#[cfg(windows)]
fn open_self() -> Result<Library, NativeError> {
    libloading::os::windows::Library::this()
        .map(Library::from)
        .map_err(|err| NativeError::HostOpen(err.to_string()))
}

unsafe fn copy_c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // These call straight into libc, which every test binary links.

    #[test]
    fn calls_an_int_native() {
        let mut bridge = Bridge::host_process().unwrap();
        let result = bridge
            .call("abs", "labs", &[NativeArg::Int(-7)], Type::Int)
            .unwrap();
        assert!(matches!(result, NativeReturn::Int(7)));
    }

    #[test]
    fn marshals_string_arguments() {
        let mut bridge = Bridge::host_process().unwrap();
        let result = bridge
            .call(
                "size",
                "strlen",
                &[NativeArg::Str("mica".to_owned())],
                Type::Int,
            )
            .unwrap();
        assert!(matches!(result, NativeReturn::Int(4)));
    }

    #[test]
    fn marshals_double_arguments() {
        // ldexp lives in libc proper, unlike most of the math library, so
        // the test binary can always resolve it.
        let mut bridge = Bridge::host_process().unwrap();
        let result = bridge
            .call(
                "scale",
                "ldexp",
                &[NativeArg::Double(1.5), NativeArg::Int(3)],
                Type::Double,
            )
            .unwrap();
        match result {
            NativeReturn::Double(value) => assert!((value - 12.0).abs() < 1e-12),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn copies_returned_strings() {
        let mut bridge = Bridge::host_process().unwrap();
        let result = bridge
            .call(
                "find",
                "strstr",
                &[
                    NativeArg::Str("stack machine".to_owned()),
                    NativeArg::Str("machine".to_owned()),
                ],
                Type::Str,
            )
            .unwrap();
        assert!(matches!(result, NativeReturn::Str(ref text) if text == "machine"));
    }

    #[test]
    fn missing_symbols_are_reported() {
        let mut bridge = Bridge::host_process().unwrap();
        let err = bridge
            .call("nope", "mica_no_such_symbol", &[], Type::Void)
            .unwrap_err();
        assert!(matches!(err, NativeError::SymbolNotFound(_)));
    }

    #[test]
    fn oversized_signatures_are_rejected() {
        let mut bridge = Bridge::host_process().unwrap();
        let args = vec![NativeArg::Int(0); MAX_INT_ARGS + 1];
        let err = bridge.call("wide", "labs", &args, Type::Int).unwrap_err();
        assert!(matches!(err, NativeError::UnsupportedSignature { .. }));
    }
}
