use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;

use crate::{domain::ScheduledAction, errors::ExecutionError};

/// Port for the code that actually performs an action (send a message, call
/// an API, ...). The core never interprets `payload`; executors dispatch on
/// `kind`.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ScheduledAction) -> Result<(), ExecutionError>;
}

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'static>>;
type ExecFn = Arc<dyn Fn(ScheduledAction) -> BoxFuture + Send + Sync>;

/// Adapts an async closure into an [`ActionExecutor`].
#[derive(Clone)]
pub struct FnExecutor {
    f: ExecFn,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ScheduledAction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |action: ScheduledAction| -> BoxFuture { Box::pin(f(action)) }),
        }
    }
}

#[async_trait]
impl ActionExecutor for FnExecutor {
    async fn execute(&self, action: &ScheduledAction) -> Result<(), ExecutionError> {
        (self.f)(action.clone()).await
    }
}
