//! Inbound action routing
//!
//! Charge point initiated CALLs are answered by handlers registered per
//! action name. The registry is built once at startup and shared read-only by
//! every session. Unregistered actions are answered with `NotImplemented`.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::HandlerError;
use crate::ocpp::{Call, CallError, CallResult, ErrorCode, OcppMessage};

/// Maximum time a single inbound handler is allowed to run
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// What a handler knows about the request it is serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Identity of the charge point that sent the CALL
    pub identity: String,
    pub message_id: String,
}

/// Trait implemented by every inbound action handler
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapts a typed async function into an [`ActionHandler`].
///
/// The request type is the handler's input schema: a payload that does not
/// deserialize into it is answered with a CALLERROR before `f` runs.
struct TypedHandler<F, Req, Resp> {
    f: F,
    _schema: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> ActionHandler for TypedHandler<F, Req, Resp>
where
    F: Fn(HandlerContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(payload)?;
        let response = (self.f)(ctx.clone(), request).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Registry mapping action names to handlers
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    handler_timeout: Duration,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Register a handler for an action name, replacing any previous one
    pub fn register(&mut self, action: impl Into<String>, handler: impl ActionHandler + 'static) {
        self.handlers.insert(action.into(), Arc::new(handler));
    }

    /// Register an async function taking and returning serde types
    pub fn register_typed<F, Fut, Req, Resp>(&mut self, action: impl Into<String>, f: F)
    where
        F: Fn(HandlerContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.register(
            action,
            TypedHandler {
                f,
                _schema: PhantomData,
            },
        );
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// List all registered action names (sorted)
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `call` and build the reply envelope.
    ///
    /// Always produces a CALLRESULT or CALLERROR carrying the CALL's message id;
    /// handler errors, panics and overruns become CALLERRORs.
    pub async fn dispatch(&self, identity: &str, call: Call) -> OcppMessage {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let Some(handler) = self.handlers.get(&action).cloned() else {
            warn!("{}: no handler for {}, replying NotImplemented", identity, action);
            let err = HandlerError::not_implemented(&action);
            return OcppMessage::CallError(CallError::new(message_id, err.code, err.description));
        };

        let ctx = HandlerContext {
            identity: identity.to_string(),
            message_id: message_id.clone(),
        };

        // Own task so a panicking handler cannot take the session down with it
        let mut task = tokio::spawn(async move { handler.handle(&ctx, payload).await });

        let outcome = match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!("{}: handler for {} failed: {}", identity, action, join_err);
                Err(HandlerError::internal(format!("Handler for {} failed", action)))
            }
            Err(_elapsed) => {
                task.abort();
                error!(
                    "{}: handler for {} timed out after {:?}",
                    identity, action, self.handler_timeout
                );
                Err(HandlerError::internal(format!("Handler for {} timed out", action)))
            }
        };

        match outcome {
            Ok(payload) => OcppMessage::CallResult(CallResult {
                message_id,
                payload,
            }),
            Err(err) => {
                warn!("{}: {} rejected: {}", identity, action, err);
                OcppMessage::CallError(CallError::new(message_id, err.code, err.description))
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

/// Shorthand used by handlers for semantic validation failures
pub fn constraint_violation(description: impl Into<String>) -> HandlerError {
    HandlerError::new(ErrorCode::PropertyConstraintViolation, description)
}
