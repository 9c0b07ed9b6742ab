//! # Command Handlers
//!
//! A handler turns one command payload into either reply data or a
//! structured failure. Handlers run on their own task; a panic inside one is
//! caught by the dispatcher and answered with a `500` failure.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_types::{codes, CorrelationId, ErrorBody};
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

/// Per-item context handed to a handler.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub correlation_id: CorrelationId,
    pub command: String,
    pub queue: String,
    /// The broker delivered this item before and it was never acked.
    pub redelivered: bool,
}

/// Failure a handler reports to its caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: i32,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(codes::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl From<HandlerError> for ErrorBody {
    fn from(err: HandlerError) -> Self {
        ErrorBody::new(err.code, err.message)
    }
}

/// Executes one command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, ctx: &CommandContext) -> Result<Value, HandlerError>;
}

/// Handler backed by an async closure over the raw JSON payload.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: &CommandContext) -> Result<Value, HandlerError> {
        (self.f)(payload, ctx.clone()).await
    }
}

/// Handler with a typed request and response.
///
/// A payload that does not decode into `Req` is answered with `400`.
pub struct TypedHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

pub fn typed_handler<F, Fut, Req, Resp>(f: F) -> TypedHandler<F, Req, Resp>
where
    F: Fn(Req, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> CommandHandler for TypedHandler<F, Req, Resp>
where
    F: Fn(Req, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: &CommandContext) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| HandlerError::bad_request(format!("invalid payload: {e}")))?;
        let response = (self.f)(request, ctx.clone()).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::internal(format!("unserializable response: {e}")))
    }
}

/// Liveness probe; always answers `{"status":"ok"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthHandler;

#[async_trait]
impl CommandHandler for HealthHandler {
    async fn handle(&self, _payload: Value, _ctx: &CommandContext) -> Result<Value, HandlerError> {
        Ok(serde_json::json!({ "status": "ok" }))
    }
}
