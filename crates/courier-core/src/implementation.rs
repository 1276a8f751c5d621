//! Served implementations and their descriptors.
//!
//! A side of a connection may serve one [`Implementation`]. Its
//! [`ServiceDescriptor`] is declared up front and returned verbatim by the
//! `handshake` command, so the peer learns the method list without any
//! runtime introspection.

use crate::config::ProtocolConfig;
use crate::value::{Callback, Value};
use crate::{CourierError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Name and ordered method list of a served implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<String>,
}

impl ServiceDescriptor {
    /// Build a descriptor, dropping repeated method names.
    ///
    /// Each name keeps the position of its first occurrence.
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for method in methods {
            let method = method.into();
            if !unique.contains(&method) {
                unique.push(method);
            }
        }

        Self {
            name: name.into(),
            methods: unique,
        }
    }

    /// Descriptor reported when nothing is served.
    pub fn none() -> Self {
        Self {
            name: ProtocolConfig::NO_IMPLEMENTATION_NAME.to_string(),
            methods: Vec::new(),
        }
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn to_value(&self) -> Value {
        Value::record([
            ("name", Value::from(self.name.as_str())),
            ("methods", Value::from(self.methods.clone())),
        ])
    }

    /// Parse a handshake result.
    pub fn from_value(value: &Value) -> Result<Self> {
        let json = value.to_json().ok_or_else(|| CourierError::HandshakeFailed {
            message: "descriptor contains a callback".to_string(),
        })?;

        serde_json::from_value(json).map_err(|e| CourierError::HandshakeFailed {
            message: format!("malformed descriptor: {}", e),
        })
    }
}

/// An object whose methods can be invoked by the peer.
#[async_trait::async_trait]
pub trait Implementation: Send + Sync + 'static {
    /// Statically declared name and methods.
    fn descriptor(&self) -> ServiceDescriptor;

    /// Invoke `method` with rehydrated `args`.
    ///
    /// Only called with names listed in [`Implementation::descriptor`].
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

/// Closure-backed [`Implementation`].
///
/// ```ignore
/// let table = MethodTable::new("Greeter")
///     .sync_method("greet", |args| Ok(Value::from(format!("hi {:?}", args))));
/// ```
pub struct MethodTable {
    name: String,
    methods: IndexMap<String, Callback>,
}

impl MethodTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: IndexMap::new(),
        }
    }

    /// Register an async method. Registering a name again replaces the
    /// earlier handler but keeps its position.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.methods.insert(name.into(), Callback::new(f));
        self
    }

    /// Register a synchronous method.
    pub fn sync_method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Callback::from_fn(f));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[async_trait::async_trait]
impl Implementation for MethodTable {
    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(self.name.clone(), self.methods.keys().cloned())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| CourierError::NotCallable {
                target: method.to_string(),
            })?;
        handler.call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_dedupes_in_first_position() {
        let descriptor = ServiceDescriptor::new("Svc", ["b", "a", "b", "c", "a"]);
        assert_eq!(descriptor.methods, vec!["b", "a", "c"]);
        assert!(descriptor.has_method("c"));
        assert!(!descriptor.has_method("d"));
    }

    #[test]
    fn test_none_descriptor() {
        let descriptor = ServiceDescriptor::none();
        assert_eq!(descriptor.name, "<none>");
        assert!(descriptor.methods.is_empty());
    }

    #[test]
    fn test_descriptor_value_round_trip() {
        let descriptor = ServiceDescriptor::new("Svc", ["echo", "repeat"]);
        let value = descriptor.to_value();

        assert_eq!(value.get("name").and_then(Value::as_str), Some("Svc"));
        assert_eq!(ServiceDescriptor::from_value(&value).unwrap(), descriptor);
    }

    #[test]
    fn test_malformed_descriptor_is_a_handshake_failure() {
        let result = ServiceDescriptor::from_value(&Value::from("nope"));
        assert!(matches!(result, Err(CourierError::HandshakeFailed { .. })));

        let with_callback = Value::record([(
            "name",
            Value::from(Callback::from_fn(|_| Ok(Value::Null))),
        )]);
        assert!(matches!(
            ServiceDescriptor::from_value(&with_callback),
            Err(CourierError::HandshakeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_method_table_invokes_handlers() {
        let table = MethodTable::new("Math")
            .sync_method("double", |args| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::from(n * 2))
            })
            .method("later", |_args| async { Ok(Value::from("done")) });

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.invoke("double", vec![Value::from(21)]).await.unwrap(),
            Value::from(42)
        );
        assert_eq!(table.invoke("later", vec![]).await.unwrap(), Value::from("done"));
        assert!(matches!(
            table.invoke("missing", vec![]).await,
            Err(CourierError::NotCallable { .. })
        ));
    }

    #[tokio::test]
    async fn test_reregistering_overrides_in_place() {
        let table = MethodTable::new("Svc")
            .sync_method("a", |_| Ok(Value::from(1)))
            .sync_method("b", |_| Ok(Value::from(2)))
            .sync_method("a", |_| Ok(Value::from(3)));

        assert_eq!(table.descriptor().methods, vec!["a", "b"]);
        assert_eq!(table.invoke("a", vec![]).await.unwrap(), Value::from(3));
    }
}
