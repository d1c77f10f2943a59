use serde::{Deserialize, Serialize};

/// Static type of a variable, expression, parameter or function result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VarType {
    /// Placeholder for "not yet known"; never survives type checking.
    Invalid,
    Void,
    Int,
    Double,
    /// Id of an interned string.
    String,
}

impl VarType {
    pub fn name(self) -> &'static str {
        match self {
            VarType::Invalid => "<invalid>",
            VarType::Void => "void",
            VarType::Int => "int",
            VarType::Double => "double",
            VarType::String => "string",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, VarType::Int | VarType::Double)
    }

    /// True for types a value of which can live in a slot or on the stack.
    pub fn is_value(self) -> bool {
        matches!(self, VarType::Int | VarType::Double | VarType::String)
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Calling signature shared by script functions and native descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub return_type: VarType,
    pub params: Vec<VarType>,
}

impl Signature {
    pub fn new(return_type: VarType, params: Vec<VarType>) -> Self {
        Self {
            return_type,
            params,
        }
    }
}

impl std::fmt::Display for Signature {
    /// Formats as `ret(p0, p1, ...)`, e.g. `double(double, int)`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.return_type)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}
