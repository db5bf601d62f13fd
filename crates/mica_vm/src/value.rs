use mica_core::Type;

/// A reference to string storage. String values never own their bytes; they
/// point either at the module's constant pool or at the interpreter's table
/// of strings produced by native calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrRef {
    /// The empty string, the zero value of string slots.
    Empty,
    /// A pooled literal.
    Const(u16),
    /// An interpreter-owned string returned by a native call.
    Owned(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    Int(i64),
    Double(f64),
    Str(StrRef),
}

impl Value {
    pub(crate) fn type_of(&self) -> Type {
        match self {
            Value::Int(_) => Type::Int,
            Value::Double(_) => Type::Double,
            Value::Str(_) => Type::Str,
        }
    }

    /// The zero value a freshly declared variable of `ty` reads as.
    pub(crate) fn zero(ty: Type) -> Value {
        match ty {
            Type::Double => Value::Double(0.0),
            Type::Str => Value::Str(StrRef::Empty),
            _ => Value::Int(0),
        }
    }
}
