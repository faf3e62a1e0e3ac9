//! Explicit subscriber registration.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    ConsumerContext, ConsumerExecutorDescriptor, ErasedHandler, HandlerResult, InvokeError,
    RegistryError,
};
use crate::config::Naming;

/// A subscriber as declared, before names are qualified.
struct Registration {
    topic: String,
    group: Option<String>,
    implementation: &'static str,
    one_way: bool,
    handler: ErasedHandler,
}

/// Collects subscribers. Names are qualified when the registry is built.
#[derive(Default)]
pub struct ConsumerRegistryBuilder {
    registrations: Vec<Registration>,
}

impl ConsumerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic` in the default group.
    pub fn subscribe<T, F, Fut>(self, topic: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(ConsumerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register::<T, _, _, ()>(topic.into(), None, true, handler)
    }

    /// Subscribe `handler` to `topic` in `group`.
    pub fn subscribe_in_group<T, F, Fut>(
        self,
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(ConsumerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register::<T, _, _, ()>(topic.into(), Some(group.into()), true, handler)
    }

    /// Subscribe a handler whose return value is published to the message's
    /// `CallbackName`, if it carries one.
    pub fn subscribe_with_reply<T, R, F, Fut>(
        self,
        topic: impl Into<String>,
        group: Option<String>,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ConsumerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.register::<T, _, _, R>(topic.into(), group, false, handler)
    }

    fn register<T, F, Fut, R>(
        mut self,
        topic: String,
        group: Option<String>,
        one_way: bool,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ConsumerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(
            move |ctx: ConsumerContext, body: Option<serde_json::Value>| {
                let handler = handler.clone();
                async move {
                    let value = body.unwrap_or(serde_json::Value::Null);
                    let arg: T = serde_json::from_value(value).map_err(|source| {
                        InvokeError::Deserialize {
                            implementation: std::any::type_name::<T>(),
                            source,
                        }
                    })?;
                    let reply = (*handler)(ctx, arg).await?;
                    if one_way {
                        return Ok(None);
                    }
                    serde_json::to_value(reply)
                        .map(Some)
                        .map_err(InvokeError::Reply)
                }
                .boxed()
            },
        );

        self.registrations.push(Registration {
            topic,
            group,
            implementation: std::any::type_name::<T>(),
            one_way,
            handler: erased,
        });
        self
    }

    /// Qualify names and check for duplicate `(group, topic)` pairs.
    pub fn build(self, naming: &Naming) -> Result<ConsumerRegistry, RegistryError> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.registrations.len());

        for registration in self.registrations {
            if registration.topic.is_empty() {
                return Err(RegistryError::EmptyTopic);
            }
            let topic = naming.topic(&registration.topic);
            let group = naming.group(registration.group.as_deref());
            if !seen.insert((group.clone(), topic.clone())) {
                return Err(RegistryError::DuplicateSubscriber { group, topic });
            }
            descriptors.push(ConsumerExecutorDescriptor {
                topic,
                group,
                implementation: registration.implementation,
                one_way: registration.one_way,
                handler: registration.handler,
            });
        }

        Ok(ConsumerRegistry { descriptors })
    }
}

/// Immutable set of registered subscribers.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    descriptors: Vec<ConsumerExecutorDescriptor>,
}

impl ConsumerRegistry {
    pub fn builder() -> ConsumerRegistryBuilder {
        ConsumerRegistryBuilder::new()
    }

    pub fn descriptors(&self) -> &[ConsumerExecutorDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Distinct groups, in registration order.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for d in &self.descriptors {
            if !groups.contains(&d.group) {
                groups.push(d.group.clone());
            }
        }
        groups
    }

    /// Topics subscribed by `group`.
    pub fn topics(&self, group: &str) -> Vec<String> {
        self.descriptors
            .iter()
            .filter(|d| d.group == group)
            .map(|d| d.topic.clone())
            .collect()
    }
}
