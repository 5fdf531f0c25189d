use std::collections::BTreeMap;
use std::fmt;

use linkrpc_frame::{TypeRegistry, Value};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Type tag of an [`AuthToken`] argument.
pub const AUTH_TOKEN_TYPE: &str = "AuthToken";

/// Credentials presented to a service's `auth` operation.
///
/// Travels as a [`Value::Custom`] whose payload is the token's JSON form.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub username: String,
    pub password: String,
    /// Extra client-supplied fields (API keys, tenant ids, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_data: BTreeMap<String, String>,
}

impl AuthToken {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            client_data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_data.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty() && self.client_data.is_empty()
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(Value::Custom {
            type_name: AUTH_TOKEN_TYPE.to_string(),
            data: serde_json::to_vec(self)?,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Custom { type_name, data } if type_name == AUTH_TOKEN_TYPE => {
                Ok(serde_json::from_slice(data)?)
            }
            other => Err(SessionError::Protocol(format!(
                "expected {AUTH_TOKEN_TYPE}, got {}",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("username", &self.username)
            .field(
                "password",
                &format_args!("<redacted:{} bytes>", self.password.len()),
            )
            .field("client_data", &self.client_data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Built-in types plus the ones the session layer carries.
pub fn session_types() -> TypeRegistry {
    TypeRegistry::new().with(AUTH_TOKEN_TYPE)
}
