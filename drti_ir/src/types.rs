//! Value types.
//!
//! The type system is deliberately small: integers of the widths the
//! accounting records use, a raw double word, and pointers. Pointers
//! are *nominal* — `Ptr(Some("interface"))` and `Ptr(Some("impl"))`
//! are distinct types — because converter lookup during call-site
//! rewriting keys on exactly that distinction.

use std::fmt;

/// A value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    /// No value (function returns, store results).
    Void,
    /// 8-bit integer (comparison results).
    I8,
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 64-bit float, moved as raw bits by the back end.
    F64,
    /// Pointer, optionally to a named nominal type.
    Ptr(Option<String>),
}

impl Ty {
    /// Opaque code/data pointer.
    #[inline]
    pub fn raw_ptr() -> Ty {
        Ty::Ptr(None)
    }

    /// Pointer to a named nominal type.
    #[inline]
    pub fn ptr_to(name: &str) -> Ty {
        Ty::Ptr(Some(name.to_string()))
    }

    /// Whether values of this type occupy a slot.
    #[inline]
    pub fn is_value(&self) -> bool {
        !matches!(self, Ty::Void)
    }

    /// Whether this is any pointer type.
    #[inline]
    pub fn is_ptr(&self) -> bool {
        matches!(self, Ty::Ptr(_))
    }

    /// Size in bytes when stored in memory.
    #[inline]
    pub fn mem_size(&self) -> usize {
        match self {
            Ty::Void => 0,
            Ty::I8 => 1,
            Ty::I32 => 4,
            Ty::I64 | Ty::F64 | Ty::Ptr(_) => 8,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::I8 => write!(f, "i8"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::F64 => write!(f, "f64"),
            Ty::Ptr(None) => write!(f, "ptr"),
            Ty::Ptr(Some(name)) => write!(f, "{}*", name),
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub ret: Ty,
}

impl Signature {
    pub fn new(params: Vec<Ty>, ret: Ty) -> Self {
        Signature { params, ret }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
