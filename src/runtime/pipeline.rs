//! Handler pipeline: executes one received envelope against its handler
//! and routes failures through the continuation engine.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Weak};

use super::context::{owed_reply, Cascade, ReceiveLifecycle};
use super::recovery::with_recovery_async;
use super::{Inner, MessageContext, Runtime};
use crate::continuation::{classify, EnvelopeLifecycle};
use crate::envelope::Envelope;
use crate::routing::Endpoint;
use crate::transports::{ExecutionOutcome, HandlerPipeline, Listener};
use crate::types::{BoxError, Error};

/// Pipeline shared by every listening agent of a runtime.
pub(crate) struct RuntimePipeline {
    runtime: Weak<Inner>,
}

impl RuntimePipeline {
    pub fn new(runtime: Weak<Inner>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl HandlerPipeline for RuntimePipeline {
    async fn execute(
        &self,
        endpoint: &Arc<Endpoint>,
        envelope: Envelope,
        channel: Arc<dyn Listener>,
    ) -> ExecutionOutcome {
        match self.runtime.upgrade() {
            Some(inner) => Runtime(inner).execute(endpoint, envelope, channel).await,
            None => {
                tracing::warn!("pipeline_runtime_dropped: id={}", envelope.id);
                ExecutionOutcome::Failed
            }
        }
    }
}

impl Runtime {
    async fn execute(
        &self,
        endpoint: &Arc<Endpoint>,
        mut envelope: Envelope,
        channel: Arc<dyn Listener>,
    ) -> ExecutionOutcome {
        loop {
            envelope.attempts += 1;
            let mut lifecycle =
                ReceiveLifecycle::new(self.clone(), endpoint.clone(), channel.clone(), envelope);
            let now = Utc::now();

            if lifecycle.envelope().is_expired(now) {
                self.0.logger.discarded(lifecycle.envelope());
                if let Err(e) = lifecycle.complete().await {
                    tracing::error!("complete_failed: id={}, error={}", lifecycle.envelope().id, e);
                }
                return ExecutionOutcome::Succeeded;
            }

            if lifecycle.envelope().is_response {
                let reply = lifecycle.envelope().clone();
                if !self.0.replies.complete(reply) {
                    tracing::debug!("unmatched_reply_dropped: id={}", lifecycle.envelope().id);
                }
                if let Err(e) = lifecycle.complete().await {
                    tracing::error!("complete_failed: id={}, error={}", lifecycle.envelope().id, e);
                }
                return ExecutionOutcome::Succeeded;
            }

            let Some(handler) = self.0.handlers.get(&lifecycle.envelope().message_type).cloned() else {
                self.0.logger.no_handler(lifecycle.envelope());
                if let Err(e) = lifecycle.complete().await {
                    tracing::error!("complete_failed: id={}, error={}", lifecycle.envelope().id, e);
                }
                return ExecutionOutcome::Succeeded;
            };

            let context = MessageContext::new(lifecycle.envelope().clone(), self.service_name());
            let timeout = handler
                .timeout
                .unwrap_or(self.0.config.messaging.default_execution_timeout);
            let invocation = handler
                .invoker
                .invoke(context.clone(), self.0.cancel.child_token());
            let message_type = lifecycle.envelope().message_type.clone();
            let outcome = with_recovery_async(
                async move {
                    match tokio::time::timeout(timeout, invocation).await {
                        Ok(result) => Ok(result),
                        Err(_) => Ok(Err(Box::new(Error::timeout(format!(
                            "handler for {} exceeded {:?}",
                            message_type, timeout
                        ))) as BoxError)),
                    }
                },
                "message_handler",
            )
            .await
            .unwrap_or_else(|panic| Err(Box::new(panic) as BoxError));

            let error = match outcome {
                Ok(()) => match self.finish_success(&mut lifecycle, &context).await {
                    Ok(()) => {
                        self.0.logger.message_succeeded(lifecycle.envelope());
                        return ExecutionOutcome::Succeeded;
                    }
                    Err(e) => Box::new(e) as BoxError,
                },
                Err(error) => error,
            };
            context.take_enlisted().rollback();

            let error_text = error.to_string();
            tracing::warn!(
                "message_failed: id={}, type={}, attempt={}, error={}",
                lifecycle.envelope().id,
                lifecycle.envelope().message_type,
                lifecycle.envelope().attempts,
                error_text
            );
            let kind = classify(
                error.as_ref(),
                lifecycle.envelope(),
                &[&handler.failures, &endpoint.failures, &self.0.failures],
            );
            let continuation = kind.build(&error_text);
            if let Err(e) = continuation.execute(&mut lifecycle, self, Utc::now()).await {
                tracing::error!(
                    "continuation_failed: id={}, continuation={:?}, error={}",
                    lifecycle.envelope().id,
                    continuation,
                    e
                );
            }

            if !lifecycle.retry_requested() {
                return ExecutionOutcome::Failed;
            }
            envelope = lifecycle.into_envelope();
        }
    }

    /// Route what the handler produced, then complete the envelope.
    async fn finish_success(
        &self,
        lifecycle: &mut ReceiveLifecycle,
        context: &MessageContext,
    ) -> crate::types::Result<()> {
        let enlisted = context.take_enlisted();
        let outgoing = match self.route_outgoing(lifecycle.envelope(), context.take_cascades()) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                enlisted.rollback();
                return Err(e);
            }
        };
        lifecycle.complete_with(outgoing, enlisted).await
    }

    fn route_outgoing(
        &self,
        envelope: &Envelope,
        cascades: Vec<Cascade>,
    ) -> crate::types::Result<Vec<(Arc<Endpoint>, Envelope)>> {
        let mut outgoing = Vec::new();
        if let Some(reply) = owed_reply(envelope, &cascades, self.service_name())? {
            outgoing.extend(self.route_reply(reply)?);
        }
        for cascade in cascades {
            outgoing.extend(self.route_cascade(cascade)?);
        }
        Ok(outgoing)
    }
}
