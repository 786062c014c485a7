use crate::{
    error::MethodError,
    message::Message,
    net::channel::Channel,
    types::{Decode, Encode, Value},
};
use futures::future::BoxFuture;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

/// A server-side operation, registered under a name and invoked for each CALL of that name.
///
/// `channel` is the connection the CALL arrived on. Methods may keep it to push
/// messages later (subscriptions and the like).
pub trait Method: Send + Sync + 'static {
    type Body: Decode + Send;
    type Output: Encode;

    fn invoke<'call>(
        &'call self,
        channel: &'call Channel,
        request: &'call Message,
        body: Self::Body,
    ) -> BoxFuture<'call, Result<Self::Output, MethodError>>;
}

/// The type-erased form of [`Method`] stored in the registry.
pub trait DynamicMethod: Send + Sync {
    fn invoke<'call>(
        &'call self,
        channel: &'call Channel,
        request: &'call Message,
        body: Value,
    ) -> BoxFuture<'call, Result<Value, MethodError>>;
}

struct TypedMethod<M>(M);

impl<M: Method> DynamicMethod for TypedMethod<M> {
    fn invoke<'call>(
        &'call self,
        channel: &'call Channel,
        request: &'call Message,
        body: Value,
    ) -> BoxFuture<'call, Result<Value, MethodError>> {
        Box::pin(async move {
            let body = M::Body::decode(body)?;
            let output = self.0.invoke(channel, request, body).await?;
            Ok(M::Output::encode(output))
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method {0} is already registered")]
    Duplicate(String),

    #[error("method name must not be empty")]
    EmptyName,
}

/// Maps command names to methods.
///
/// Filled before the server starts; the server then holds it behind an `Arc` and only
/// reads from it.
#[derive(Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Arc<dyn DynamicMethod>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Method>(&mut self, name: &str, method: M) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.methods.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        self.methods
            .insert(name.to_owned(), Arc::new(TypedMethod(method)));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn DynamicMethod>> {
        self.methods.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Method for Echo {
        invoke! {
            async fn invoke(&self, _channel, _request, body: Value) -> Value {
                Ok(body)
            }
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = MethodRegistry::new();
        registry.register("echo", Echo).unwrap();
        assert_eq!(
            registry.register("echo", Echo),
            Err(RegistryError::Duplicate("echo".into()))
        );
        assert_eq!(registry.register("", Echo), Err(RegistryError::EmptyName));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = MethodRegistry::new();
        registry.register("echo", Echo).unwrap();
        registry.register("ping", Echo).unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("doesNotExist").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), ["echo", "ping"]);
    }
}
