//! Handler registry.
//!
//! Handlers are registered at startup as closures keyed by message type.
//! Each entry carries its own failure rules, consulted before the endpoint
//! and global rules.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::MessageContext;
use crate::continuation::FailureRuleCollection;
use crate::envelope::Message;
use crate::types::BoxError;

/// Executes application code for one received envelope.
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    async fn invoke(
        &self,
        context: MessageContext,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError>;
}

/// Adapts an async closure over a typed message.
pub struct FnHandler<M, F> {
    handler: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F> FnHandler<M, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, Fut> HandlerInvoker for FnHandler<M, F>
where
    M: Message,
    F: Fn(M, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    async fn invoke(
        &self,
        context: MessageContext,
        _cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        let message: M = context.envelope().decode()?;
        (self.handler)(message, context).await
    }
}

/// A registered handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub invoker: Arc<dyn HandlerInvoker>,
    pub failures: FailureRuleCollection,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("rules", &self.failures.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Message type to handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed async closure. A later registration replaces an
    /// earlier one for the same type.
    pub fn register<M, F, Fut>(&mut self, handler: F, failures: FailureRuleCollection)
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.register_invoker(
            M::message_type(),
            Arc::new(FnHandler::<M, F>::new(handler)),
            failures,
            M::execution_timeout(),
        );
    }

    pub fn register_invoker(
        &mut self,
        message_type: impl Into<String>,
        invoker: Arc<dyn HandlerInvoker>,
        failures: FailureRuleCollection,
        timeout: Option<Duration>,
    ) {
        let message_type = message_type.into();
        tracing::debug!("handler_registered: type={}", message_type);
        self.handlers.insert(
            message_type,
            HandlerEntry {
                invoker,
                failures,
                timeout,
            },
        );
    }

    pub fn get(&self, message_type: &str) -> Option<&HandlerEntry> {
        self.handlers.get(message_type)
    }

    pub fn handled_types(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
