use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{accepts, TypeRegistry};
use crate::value::Value;

/// Why a signature string could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("not a signature: {0:?}")]
    Syntax(String),

    #[error("argument {position} has unknown type {type_name:?}")]
    UnknownType { position: usize, type_name: String },
}

/// First difference between an argument list and a signature.
///
/// Positions are zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Count { actual: usize, expected: usize },
    Type {
        position: usize,
        actual: String,
        expected: String,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Count { actual, expected } => write!(
                f,
                "the number of arguments is {actual}, it should be {expected}"
            ),
            Mismatch::Type {
                position,
                actual,
                expected,
            } => write!(
                f,
                "argument {position} is {actual}, it should be {expected}"
            ),
        }
    }
}

/// An operation name plus its ordered argument types, e.g. `add(int,int)`.
///
/// Equality is structural: same name, same types in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSignature {
    name: String,
    arg_types: Vec<String>,
}

impl CallSignature {
    pub fn new<I, S>(name: impl Into<String>, arg_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            arg_types: arg_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `name(type1,type2,...)`.
    ///
    /// The text must contain exactly one `(` and one `)`, the name must be
    /// non-empty, and nothing may follow the closing parenthesis. Whitespace
    /// around the name and each type is ignored.
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let syntax = || SignatureError::Syntax(text.to_string());
        let trimmed = text.trim();

        if trimmed.matches('(').count() != 1 || trimmed.matches(')').count() != 1 {
            return Err(syntax());
        }
        let open = trimmed.find('(').ok_or_else(syntax)?;
        let close = trimmed.find(')').ok_or_else(syntax)?;
        if close != trimmed.len() - 1 || close < open {
            return Err(syntax());
        }

        let name = trimmed[..open].trim();
        if name.is_empty() {
            return Err(syntax());
        }

        let inner = trimmed[open + 1..close].trim();
        let arg_types = if inner.is_empty() {
            Vec::new()
        } else {
            let parts: Vec<String> = inner.split(',').map(|t| t.trim().to_string()).collect();
            if parts.iter().any(String::is_empty) {
                return Err(syntax());
            }
            parts
        };

        Ok(Self {
            name: name.to_string(),
            arg_types,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_types(&self) -> &[String] {
        &self.arg_types
    }

    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    /// Check every declared type is known to `registry`.
    pub fn validate(&self, registry: &TypeRegistry) -> Result<(), SignatureError> {
        match self
            .arg_types
            .iter()
            .position(|type_name| !registry.contains(type_name))
        {
            Some(position) => Err(SignatureError::UnknownType {
                position,
                type_name: self.arg_types[position].clone(),
            }),
            None => Ok(()),
        }
    }

    /// Compare `args` against the declared types, position by position.
    pub fn test(&self, args: &[Value]) -> Result<(), Mismatch> {
        if args.len() != self.arg_types.len() {
            return Err(Mismatch::Count {
                actual: args.len(),
                expected: self.arg_types.len(),
            });
        }
        for (position, (declared, arg)) in self.arg_types.iter().zip(args).enumerate() {
            if !accepts(declared, arg) {
                return Err(Mismatch::Type {
                    position,
                    actual: arg.type_name().to_string(),
                    expected: declared.clone(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for CallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.arg_types.join(","))
    }
}

impl FromStr for CallSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
