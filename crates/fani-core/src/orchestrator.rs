//! Function invocation orchestrator.
//!
//! Publishing ([`Orchestrator::deploy`]) stores the bytecode and a
//! descriptor pointing at it. Invoking ([`Orchestrator::call`]) walks a
//! fixed sequence of stages:
//!
//! ```text
//! Resolving ─▶ FetchingBytecode ─▶ FetchingArgs ─▶ Executing ─▶ PublishingResult ─▶ Done
//!     │               │                 │              │                │
//!     └───────────────┴─────────────────┴──────────────┴────────────────┴─▶ Failed(kind)
//! ```
//!
//! Each stage has its own timeout and the first failure aborts the rest.

use crate::cache::CacheEntry;
use crate::context::NodeContext;
use crate::descriptor::{ArgumentSpec, DescriptorCodec, FunctionDescriptor};
use crate::error::{CoreError, ErrorKind, Result};
use crate::sandbox::ExecutionResult;
use bytes::{BufMut, Bytes, BytesMut};
use fani_store::ContentAddress;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Stage of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Resolving,
    FetchingBytecode,
    FetchingArgs,
    Executing,
    PublishingResult,
    Done,
    /// Terminal failure, with the kind of the error that caused it.
    Failed(ErrorKind),
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Resolving => f.write_str("resolving"),
            CallState::FetchingBytecode => f.write_str("fetching bytecode"),
            CallState::FetchingArgs => f.write_str("fetching arguments"),
            CallState::Executing => f.write_str("executing"),
            CallState::PublishingResult => f.write_str("publishing result"),
            CallState::Done => f.write_str("done"),
            CallState::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// A failed invocation and the stage it failed in.
#[derive(Debug, Clone, Error)]
#[error("{stage} failed: {error}")]
pub struct InvocationError {
    pub stage: CallState,
    #[source]
    pub error: CoreError,
}

impl InvocationError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// How argument contents become the module's single input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputAssembly {
    /// Only the first argument is passed; the rest are fetched and
    /// ignored. No arguments means empty input.
    #[default]
    FirstArgument,
    /// All arguments, framed as a big-endian `u32` count followed by a
    /// `u32` length and the bytes of each argument.
    Framed,
}

impl InputAssembly {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "first" | "first-argument" => Some(Self::FirstArgument),
            "framed" | "all" => Some(Self::Framed),
            _ => None,
        }
    }

    /// Build the input buffer from fetched argument contents.
    pub fn assemble(&self, args: &[Bytes]) -> Result<Bytes> {
        match self {
            InputAssembly::FirstArgument => Ok(args.first().cloned().unwrap_or_default()),
            InputAssembly::Framed => {
                let total: usize = args.iter().map(|a| 4 + a.len()).sum();
                let mut buf = BytesMut::with_capacity(4 + total);
                buf.put_u32(frame_len(args.len())?);
                for arg in args {
                    buf.put_u32(frame_len(arg.len())?);
                    buf.put_slice(arg);
                }
                Ok(buf.freeze())
            }
        }
    }
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| CoreError::SandboxFault(format!("input of {len} bytes cannot be framed")))
}

/// Time limits per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Fetching and decoding the descriptor (default: 30s).
    pub resolve: Duration,
    /// Fetching bytecode and each argument (default: 30s).
    pub fetch: Duration,
    /// Running the module (default: 60s).
    pub execute: Duration,
    /// Each store write (default: 30s).
    pub publish: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            resolve: Duration::from_secs(30),
            fetch: Duration::from_secs(30),
            execute: Duration::from_secs(60),
            publish: Duration::from_secs(30),
        }
    }
}

/// Publishes and invokes functions.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<NodeContext>,
    codec: DescriptorCodec,
}

impl Orchestrator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let codec = DescriptorCodec::new(Arc::clone(ctx.store()));
        Self { ctx, codec }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Publish `bytecode` under the name `id`, returning the descriptor address.
    pub async fn deploy(&self, bytecode: Bytes, id: &str) -> Result<ContentAddress> {
        self.deploy_with_args(bytecode, id, Vec::new()).await
    }

    /// Publish `bytecode` with declared arguments.
    pub async fn deploy_with_args(
        &self,
        bytecode: Bytes,
        id: &str,
        args: Vec<ArgumentSpec>,
    ) -> Result<ContentAddress> {
        let limit = self.ctx.timeouts().publish;
        let mut descriptor = FunctionDescriptor {
            id: id.to_string(),
            bytecode: ContentAddress::of(&bytecode),
            args,
        };
        descriptor.validate()?;

        let size = bytecode.len();
        descriptor.bytecode = publish_within(limit, async {
            self.ctx.store().put(bytecode).await.map_err(CoreError::publish)
        })
        .await?;
        let address = publish_within(limit, self.codec.publish(&descriptor)).await?;

        tracing::info!(
            id = %descriptor.id,
            bytecode = %descriptor.bytecode,
            descriptor = %address,
            size,
            "Deployed function"
        );
        Ok(address)
    }

    /// Invoke the function at `descriptor` with the given argument
    /// addresses and publish its output, returning the result address.
    pub async fn call(
        &self,
        descriptor: &ContentAddress,
        args: &[ContentAddress],
    ) -> std::result::Result<ContentAddress, InvocationError> {
        let start = Instant::now();
        let timeouts = *self.ctx.timeouts();
        let mut call = Progress::new(*descriptor);

        let function = call
            .stage(timeouts.resolve, self.codec.resolve(descriptor))
            .await?;

        call.advance(CallState::FetchingBytecode);
        let entry = call
            .stage(timeouts.fetch, self.ctx.cache().ensure(&function.bytecode))
            .await?;

        call.advance(CallState::FetchingArgs);
        let mut contents = Vec::with_capacity(args.len());
        for arg in args {
            let data = call
                .stage(timeouts.fetch, async {
                    self.ctx.store().get(arg).await.map_err(CoreError::from)
                })
                .await?;
            tracing::trace!(argument = %arg, size = data.len(), "Fetched argument");
            contents.push(data);
        }

        call.advance(CallState::Executing);
        let input = self
            .ctx
            .input_assembly()
            .assemble(&contents)
            .map_err(|e| call.fail(e))?;
        let result = call
            .stage(timeouts.execute, self.run(&entry, input, timeouts.execute))
            .await?;
        let output = result.into_output().map_err(|e| call.fail(e))?;

        call.advance(CallState::PublishingResult);
        let output_size = output.len();
        let address = call
            .stage(timeouts.publish, async {
                self.ctx.store().put(output).await.map_err(CoreError::publish)
            })
            .await?;

        call.advance(CallState::Done);
        tracing::info!(
            function = %function.id,
            descriptor = %descriptor,
            result = %address,
            args = args.len(),
            output_size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Call completed"
        );
        Ok(address)
    }

    /// Run the function at `descriptor` locally with no input and return
    /// its output without publishing it.
    pub async fn execute(
        &self,
        descriptor: &ContentAddress,
    ) -> std::result::Result<ExecutionResult, InvocationError> {
        let timeouts = *self.ctx.timeouts();
        let mut call = Progress::new(*descriptor);

        let function = call
            .stage(timeouts.resolve, self.codec.resolve(descriptor))
            .await?;

        call.advance(CallState::FetchingBytecode);
        let entry = call
            .stage(timeouts.fetch, self.ctx.cache().ensure(&function.bytecode))
            .await?;

        call.advance(CallState::Executing);
        let result = call
            .stage(timeouts.execute, self.run(&entry, Bytes::new(), timeouts.execute))
            .await?;
        if let Err(e) = result.clone().into_output() {
            return Err(call.fail(e));
        }

        call.advance(CallState::Done);
        tracing::info!(
            function = %function.id,
            descriptor = %descriptor,
            output_size = result.output.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Executed function locally"
        );
        Ok(result)
    }

    async fn run(&self, entry: &CacheEntry, input: Bytes, limit: Duration) -> Result<ExecutionResult> {
        let sandbox = self.ctx.sandbox();
        let module = sandbox.load(entry).await?;
        sandbox.run(&module, input, limit).await
    }
}

/// Tracks the stage of one invocation and attributes failures to it.
struct Progress {
    descriptor: ContentAddress,
    state: CallState,
}

impl Progress {
    fn new(descriptor: ContentAddress) -> Self {
        tracing::debug!(descriptor = %descriptor, state = %CallState::Resolving, "Invocation started");
        Self {
            descriptor,
            state: CallState::Resolving,
        }
    }

    fn advance(&mut self, next: CallState) {
        tracing::debug!(descriptor = %self.descriptor, from = %self.state, to = %next, "Invocation stage");
        self.state = next;
    }

    fn fail(&mut self, error: CoreError) -> InvocationError {
        let stage = self.state;
        self.state = CallState::Failed(error.kind());
        tracing::error!(
            descriptor = %self.descriptor,
            stage = %stage,
            kind = %error.kind(),
            error = %error,
            "Invocation failed"
        );
        InvocationError { stage, error }
    }

    /// Run one piece of the current stage under `limit`.
    async fn stage<T>(
        &mut self,
        limit: Duration,
        work: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, InvocationError> {
        match tokio::time::timeout(limit, work).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => {
                let error = timeout_error(self.state, limit);
                Err(self.fail(error))
            }
        }
    }
}

/// The error a stage timeout is reported as.
fn timeout_error(state: CallState, limit: Duration) -> CoreError {
    let message = format!("{state} timed out after {limit:?}");
    match state {
        CallState::Executing => CoreError::SandboxFault(message),
        CallState::PublishingResult => CoreError::Publish(message),
        _ => CoreError::ContentUnavailable(message),
    }
}

async fn publish_within<T>(limit: Duration, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| CoreError::Publish(format!("store write timed out after {limit:?}")))?
}
