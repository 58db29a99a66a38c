//! Named request/response channel with a middleware chain and broadcast to
//! connected observers.

use async_trait::async_trait;
use flowcore::NodeError;
use flowruntime::Backoff;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error raised by a handler or middleware.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("Invalid arguments: {}", err))
    }
}

impl From<NodeError> for HandlerError {
    fn from(err: NodeError) -> Self {
        Self(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wire response for a channel call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelResponse {
    /// `channel_error` is true when no handler exists for the method, false
    /// when the handler itself failed.
    #[serde(rename_all = "camelCase")]
    Failure { error: String, channel_error: bool },
    Success { result: Value },
}

impl ChannelResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelResponse::Success { .. })
    }
}

/// Event pushed to every connected observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub data: Value,
}

/// Middleware contract: receive the call and decide whether and when to
/// invoke the rest of the chain through `next`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, method: &str, args: Value, next: Next<'_>) -> HandlerResult;
}

/// The remainder of a middleware chain, ending at the handler. Copy, so a
/// middleware may call it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handler: &'a Handler,
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn run(self, method: &'a str, args: Value) -> BoxFuture<'a, HandlerResult> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware.handle(
                method,
                args,
                Next {
                    handler: self.handler,
                    chain: rest,
                },
            ),
            None => (self.handler)(args),
        }
    }
}

pub struct ChannelServer {
    name: String,
    handlers: RwLock<HashMap<String, Handler>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<BroadcastMessage>>>,
}

impl ChannelServer {
    /// A channel whose chain starts with request logging.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let logging: Arc<dyn Middleware> = Arc::new(LoggingMiddleware::new(name.clone()));
        Self {
            name,
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(vec![logging]),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the handler for `method`, replacing any previous one.
    pub fn handle<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let method = method.into();
        tracing::debug!(channel = %self.name, "Registering handler: {}", method);
        let boxed: Handler =
            Arc::new(move |args: Value| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(args)) });
        write(&self.handlers).insert(method, boxed);
    }

    pub fn remove_handler(&self, method: &str) -> bool {
        write(&self.handlers).remove(method).is_some()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = read(&self.handlers).keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Append to the chain. Runs after logging and any earlier middleware.
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        write(&self.middleware).push(Arc::new(middleware));
    }

    pub async fn dispatch(&self, method: &str, args: Value) -> ChannelResponse {
        let Some(handler) = read(&self.handlers).get(method).cloned() else {
            tracing::warn!(channel = %self.name, "No handler for method: {}", method);
            return ChannelResponse::Failure {
                error: format!("No handler registered for '{}'", method),
                channel_error: true,
            };
        };
        let chain = read(&self.middleware).clone();

        let next = Next {
            handler: &handler,
            chain: &chain,
        };
        match next.run(method, args).await {
            Ok(result) => ChannelResponse::Success { result },
            Err(err) => ChannelResponse::Failure {
                error: err.to_string(),
                channel_error: false,
            },
        }
    }

    /// Register an observer. It is dropped from the channel the first time a
    /// broadcast finds its receiver closed.
    pub fn connect(&self) -> mpsc::UnboundedReceiver<BroadcastMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers).push(tx);
        rx
    }

    /// Push to every connected observer. Returns how many received it.
    pub fn broadcast(&self, event: impl Into<String>, data: Value) -> usize {
        let message = BroadcastMessage {
            event: event.into(),
            data,
        };
        let mut observers = lock(&self.observers);
        observers.retain(|tx| tx.send(message.clone()).is_ok());
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        let mut observers = lock(&self.observers);
        observers.retain(|tx| !tx.is_closed());
        observers.len()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Logs every call with its duration and outcome.
pub struct LoggingMiddleware {
    channel: String,
}

impl LoggingMiddleware {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, method: &str, args: Value, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        tracing::debug!(channel = %self.channel, "-> {}", method);
        let result = next.run(method, args).await;
        let elapsed = started.elapsed().as_millis();
        match &result {
            Ok(_) => tracing::info!(channel = %self.channel, "{} completed in {}ms", method, elapsed),
            Err(err) => {
                tracing::warn!(channel = %self.channel, "{} failed after {}ms: {}", method, elapsed, err)
            }
        }
        result
    }
}

/// Re-runs the rest of the chain on failure with exponential backoff.
pub struct RetryMiddleware {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, method: &str, args: Value, next: Next<'_>) -> HandlerResult {
        let mut attempt = 0;
        loop {
            match next.run(method, args.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt + 1 >= self.max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {}ms",
                        method,
                        attempt + 1,
                        self.max_attempts,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Rejects calls whose arguments fail the validator registered for their
/// method. Methods without a validator pass through.
#[derive(Default)]
pub struct ValidationMiddleware {
    validators: HashMap<String, Validator>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        mut self,
        method: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validators.insert(method.into(), Arc::new(validator));
        self
    }

    /// Require each dotted path (e.g. `node.id`) to be present and non-null.
    pub fn require_fields(self, method: impl Into<String>, fields: &[&str]) -> Self {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.validate(method, move |args| {
            let missing: Vec<&str> = fields
                .iter()
                .filter(|path| lookup(args, path).map_or(true, Value::is_null))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("missing required fields: {}", missing.join(", ")))
            }
        })
    }
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, key| current.get(key))
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, method: &str, args: Value, next: Next<'_>) -> HandlerResult {
        if let Some(validator) = self.validators.get(method) {
            validator(&args).map_err(|reason| {
                HandlerError(format!("Validation failed for {}: {}", method, reason))
            })?;
        }
        next.run(method, args).await
    }
}
