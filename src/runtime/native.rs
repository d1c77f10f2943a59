//! Host functions callable through `CALLNATIVE`.
//!
//! A program only carries native *descriptors* (symbol and signature). The
//! interpreter looks the symbol up in a [`NativeRegistry`] the first time a
//! descriptor is called and checks that both signatures agree.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::lang::types::{Signature, VarType};
use crate::lang::value::Value;

pub type NativeId = u16;

/// Host function body. Arguments arrive in declaration order and already
/// match the signature's parameter types.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Option<Value>, NativeError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    #[error("{0}")]
    Failed(String),

    #[error("returned {found}, declared {expected}")]
    BadResult { expected: VarType, found: VarType },
}

#[derive(Clone)]
pub struct NativeEntry {
    pub name: String,
    pub signature: Signature,
    func: NativeFn,
}

impl NativeEntry {
    /// Calls the host function and checks its result against the signature.
    pub fn call(&self, args: &[Value]) -> Result<Option<Value>, NativeError> {
        let result = (self.func)(args)?;
        let found = result.as_ref().map_or(VarType::Void, Value::var_type);
        if found != self.signature.return_type {
            return Err(NativeError::BadResult {
                expected: self.signature.return_type,
                found,
            });
        }
        Ok(result)
    }
}

impl std::fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
    by_name: FxHashMap<String, NativeId>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` under `name`. Registering a name again replaces the
    /// earlier entry and keeps its id.
    pub fn register<F>(&mut self, name: &str, signature: Signature, func: F) -> NativeId
    where
        F: Fn(&[Value]) -> Result<Option<Value>, NativeError> + Send + Sync + 'static,
    {
        let entry = NativeEntry {
            name: name.to_string(),
            signature,
            func: Arc::new(func),
        };
        if let Some(&id) = self.by_name.get(name) {
            self.entries[id as usize] = entry;
            return id;
        }
        let id = self.entries.len() as NativeId;
        self.entries.push(entry);
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<NativeId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: NativeId) -> Option<&NativeEntry> {
        self.entries.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `sqrt`, `pow`, `floor`, `abs` and `strlen`.
    pub fn with_std() -> Self {
        use VarType::{Double, Int, String};

        let mut registry = Self::new();
        registry.register("sqrt", Signature::new(Double, vec![Double]), |args| {
            Ok(Some(Value::Double(double_arg(args, 0)?.sqrt())))
        });
        registry.register("pow", Signature::new(Double, vec![Double, Double]), |args| {
            Ok(Some(Value::Double(
                double_arg(args, 0)?.powf(double_arg(args, 1)?),
            )))
        });
        registry.register("floor", Signature::new(Int, vec![Double]), |args| {
            Ok(Some(Value::Int(double_arg(args, 0)?.floor() as i64)))
        });
        registry.register("abs", Signature::new(Double, vec![Double]), |args| {
            Ok(Some(Value::Double(double_arg(args, 0)?.abs())))
        });
        registry.register("strlen", Signature::new(Int, vec![String]), |args| {
            let s = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| NativeError::Failed("expected a string argument".into()))?;
            Ok(Some(Value::Int(s.chars().count() as i64)))
        });
        registry
    }
}

fn double_arg(args: &[Value], index: usize) -> Result<f64, NativeError> {
    args.get(index)
        .and_then(Value::as_double)
        .ok_or_else(|| NativeError::Failed(format!("argument {} must be a double", index + 1)))
}
