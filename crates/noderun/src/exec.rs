//! Running one node's transformation inside a fresh execution context.

use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    deref::deref,
    reference::ResolverChain,
    sandbox::{Entry, ExecutionError, Result, SandboxBuilder},
    schema::{self, Path, Schema, ValidationError},
    value::{Map, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Running,
    Completed,
    Failed,
    Disposed,
}

/// A single, one-shot run of an entry point.
///
/// The context is built when [`Invocation::run`] starts and disposed when it
/// returns, so callables in the result cannot be invoked afterwards.
#[derive(Debug)]
pub struct Invocation {
    entry: Entry,
    builder: SandboxBuilder,
    label: String,
    state: Mutex<InvocationState>,
}

impl Invocation {
    #[must_use]
    pub fn new(entry: Entry, builder: SandboxBuilder) -> Self {
        Self {
            entry,
            builder,
            label: String::new(),
            state: Mutex::new(InvocationState::Created),
        }
    }

    /// Name recorded on the invocation's tracing span.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn state(&self) -> InvocationState {
        *self.state.lock()
    }

    /// Build the context, call the entry point with `{ data }` and
    /// dereference the result.
    ///
    /// Cancelling `cancel` disposes the context and fails the run with
    /// [`ExecutionError::Disposed`], even while the script never yields.
    /// If the call finished first, its outcome stands.
    ///
    /// # Errors
    /// Any [`ExecutionError`]; also [`ExecutionError::Internal`] if the
    /// invocation was already started.
    #[tracing::instrument(
        target = "noderun::exec",
        name = "invocation",
        skip_all,
        fields(node = %self.label)
    )]
    pub async fn run(&self, data: Value, cancel: &CancellationToken) -> Result<Value> {
        {
            let mut state = self.state.lock();
            if *state != InvocationState::Created {
                return Err(ExecutionError::Internal(
                    "invocation has already been started".to_owned(),
                ));
            }
            *state = InvocationState::Running;
        }
        tracing::debug!("invocation running");

        let built = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecutionError::Disposed),
            built = self.builder.build(self.entry.clone()) => built,
        };
        let context = match built {
            Ok(context) => context,
            Err(err) => return self.finish(Err(err)),
        };

        let args = Value::Object(Map::from([("data".to_owned(), data)]));
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                context.dispose();
                Err(ExecutionError::Disposed)
            }
            result = async { deref(context.call(vec![args]).await?).await } => result,
        };
        context.dispose();
        self.finish(outcome)
    }

    fn finish(&self, outcome: Result<Value>) -> Result<Value> {
        let state = match &outcome {
            Ok(_) => InvocationState::Completed,
            Err(ExecutionError::Disposed) => InvocationState::Disposed,
            Err(_) => InvocationState::Failed,
        };
        *self.state.lock() = state;
        match &outcome {
            Ok(_) => tracing::debug!(?state, "invocation finished"),
            Err(error) => tracing::debug!(?state, %error, "invocation finished"),
        }
        outcome
    }
}

/// A node's transformation and the shapes it accepts and produces.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    /// Function expression invoked with `{ data }`.
    pub code: String,
    #[serde(default = "Schema::any")]
    pub input_schema: Schema,
    #[serde(default)]
    pub output_schema: Option<Schema>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    Input(#[source] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid output: {0}")]
    Output(#[source] ValidationError),
}

/// Resolves inputs, runs the node and validates what it returned.
#[derive(Debug, Clone, Default)]
pub struct NodeExecutor {
    builder: SandboxBuilder,
}

impl NodeExecutor {
    #[must_use]
    pub const fn new(builder: SandboxBuilder) -> Self {
        Self { builder }
    }

    /// # Errors
    /// [`NodeError::Input`] if `inputs` do not satisfy the input schema,
    /// [`NodeError::Execution`] if the run fails, and [`NodeError::Output`]
    /// if the result does not satisfy the output schema.
    pub async fn invoke(
        &self,
        node: &NodeSpec,
        inputs: Value,
        resolvers: &ResolverChain,
        cancel: &CancellationToken,
    ) -> core::result::Result<Value, NodeError> {
        let root = Path::root();
        let data = schema::resolve(&root, Some(inputs), &node.input_schema, resolvers)
            .await
            .map_err(NodeError::Input)?
            .unwrap_or_default();

        let output = Invocation::new(Entry::expression(node.code.as_str()), self.builder.clone())
            .with_label(node.id.as_str())
            .run(data, cancel)
            .await?;

        match &node.output_schema {
            Some(schema) => Ok(schema::resolve(&root, Some(output), schema, resolvers)
                .await
                .map_err(NodeError::Output)?
                .unwrap_or_default()),
            None => Ok(output),
        }
    }
}
