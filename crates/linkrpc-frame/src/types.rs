use std::collections::BTreeSet;

use crate::value::Value;

/// Declared argument type that accepts every value.
pub const ANY: &str = "any";

const BUILTIN: [&str; 10] = [
    ANY, "null", "bool", "int", "uint", "double", "string", "bytes", "list", "map",
];

/// The set of type names this process knows how to carry.
///
/// Signatures naming anything else fail [`crate::CallSignature::validate`].
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    names: BTreeSet<String>,
}

impl TypeRegistry {
    /// A registry holding only the built-in value types.
    pub fn new() -> Self {
        Self {
            names: BUILTIN.iter().map(|name| name.to_string()).collect(),
        }
    }

    /// Register an application type carried as [`Value::Custom`].
    pub fn register(&mut self, type_name: impl Into<String>) -> &mut Self {
        self.names.insert(type_name.into());
        self
    }

    pub fn with(mut self, type_name: impl Into<String>) -> Self {
        self.register(type_name);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.names.contains(type_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `value` satisfies a declared type.
pub fn accepts(declared: &str, value: &Value) -> bool {
    declared == ANY || declared == value.type_name()
}
