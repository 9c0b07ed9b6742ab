//! # Command Registry
//!
//! Command name to handler table for one worker. Built once, immutable
//! afterwards. Every registry answers a health command.

use crate::handler::{
    handler_fn, typed_handler, CommandContext, CommandHandler, HandlerError, HealthHandler,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Registration errors, reported by [`CommandRegistryBuilder::build`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command registered twice: {0}")]
    DuplicateCommand(String),

    #[error("command name cannot be empty")]
    EmptyName,
}

/// Immutable command table.
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    health_command: String,
}

impl CommandRegistry {
    /// Start a registry for `service`; its health command is `<service>.health`.
    pub fn builder(service: &str) -> CommandRegistryBuilder {
        CommandRegistryBuilder::new(service)
    }

    pub fn get(&self, command: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(command)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn health_command(&self) -> &str {
        &self.health_command
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands())
            .field("health_command", &self.health_command)
            .finish()
    }
}

/// Collects handlers; duplicates are detected at [`build`](Self::build).
pub struct CommandRegistryBuilder {
    entries: Vec<(String, Arc<dyn CommandHandler>)>,
    health_command: String,
}

impl CommandRegistryBuilder {
    pub fn new(service: &str) -> Self {
        Self {
            entries: Vec::new(),
            health_command: format!("{}.health", service.to_lowercase()),
        }
    }

    /// Override the health command name.
    #[must_use]
    pub fn health_command(mut self, name: impl Into<String>) -> Self {
        self.health_command = name.into();
        self
    }

    #[must_use]
    pub fn command(mut self, name: impl Into<String>, handler: impl CommandHandler) -> Self {
        self.entries.push((name.into(), Arc::new(handler)));
        self
    }

    /// Register an async closure over the raw payload.
    #[must_use]
    pub fn command_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.command(name, handler_fn(f))
    }

    /// Register an async closure with typed request and response.
    #[must_use]
    pub fn command_typed<F, Fut, Req, Resp>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Req, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.command(name, typed_handler(f))
    }

    pub fn build(self) -> Result<CommandRegistry, RegistryError> {
        let mut handlers: HashMap<String, Arc<dyn CommandHandler>> = HashMap::new();
        let health: Arc<dyn CommandHandler> = Arc::new(HealthHandler);
        let all = std::iter::once((self.health_command.clone(), health)).chain(self.entries);

        for (name, handler) in all {
            if name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if handlers.contains_key(&name) {
                return Err(RegistryError::DuplicateCommand(name));
            }
            handlers.insert(name, handler);
        }

        Ok(CommandRegistry {
            handlers,
            health_command: self.health_command,
        })
    }
}
