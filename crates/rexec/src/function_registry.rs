use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::types::Value;

/// A locally registered operation peers can invoke.
pub type Handler = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Positional argument kinds an operation accepts, e.g. `"sn"` for
/// a string followed by a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgMask(String);

impl ArgMask {
    /// Parse a mask made of `s` and `n` symbols.
    pub fn parse(mask: &str) -> Result<Self, BrokerError> {
        if mask.chars().all(|c| c == 's' || c == 'n') {
            Ok(Self(mask.to_string()))
        } else {
            Err(BrokerError::InvalidMask {
                mask: mask.to_string(),
            })
        }
    }

    /// Check arity and each argument's kind, position by position.
    pub fn check_args(&self, args: &[Value]) -> bool {
        args.len() == self.0.len()
            && args
                .iter()
                .zip(self.0.chars())
                .all(|(arg, symbol)| arg.kind_symbol() == symbol)
    }
}

impl fmt::Display for ArgMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered operation.
#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub handler: Handler,
    pub mask: ArgMask,
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// Operation names mapped to local handlers.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A second registration of the same
    /// name replaces the first.
    pub fn register(
        &mut self,
        name: &str,
        handler: Handler,
        mask: ArgMask,
    ) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::EmptyName);
        }
        let entry = FunctionEntry {
            name: name.to_string(),
            handler,
            mask,
        };
        if self.functions.insert(name.to_string(), entry).is_some() {
            tracing::warn!(name, "duplicate function registration, overwritten");
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
