//! Sandboxed execution of WebAssembly modules.
//!
//! [`ExecutionSandbox`] is the seam to the bytecode runtime: load a cached
//! module, then run it against one input buffer and collect one output
//! buffer. [`ProcessSandbox`] drives an external runtime binary
//! (`wasmtime run <module>` by default) as a child process. Input goes to
//! the child's stdin and output is read from its stdout; the module gets no
//! other host access from us (cleared environment, no preopened
//! directories, no inherited stdio).

use crate::cache::CacheEntry;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fani_store::ContentAddress;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Largest output a module may produce (16 MiB).
pub const MAX_OUTPUT_SIZE: usize = 16 * 1024 * 1024;

/// Stderr beyond this is dropped.
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// WebAssembly binary magic number.
const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Accepted header versions: core modules and components.
const WASM_VERSIONS: [[u8; 4]; 2] = [[1, 0, 0, 0], [0x0d, 0, 1, 0]];

/// A module accepted by a sandbox and ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    pub address: ContentAddress,
    pub path: PathBuf,
}

/// Result of running a module.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Bytes written to stdout.
    pub output: Bytes,
    /// Exit code, -1 if terminated by a signal.
    pub exit_code: i32,
    /// Diagnostic output, lossily decoded.
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Check if the module exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The output of a successful run, or a fault describing the failure.
    pub fn into_output(self) -> Result<Bytes> {
        if self.success() {
            return Ok(self.output);
        }
        let stderr = self.stderr.trim();
        Err(CoreError::SandboxFault(if stderr.is_empty() {
            format!("module exited with code {}", self.exit_code)
        } else {
            format!("module exited with code {}: {stderr}", self.exit_code)
        }))
    }
}

/// Runs bytecode in isolation.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    /// Check that the cached blob is usable bytecode.
    async fn load(&self, entry: &CacheEntry) -> Result<ModuleHandle>;

    /// Run `module` with `input` as its only input.
    ///
    /// A trap surfaces as a non-success [`ExecutionResult`]; exceeding
    /// `timeout` or an output limit is a [`CoreError::SandboxFault`].
    async fn run(
        &self,
        module: &ModuleHandle,
        input: Bytes,
        timeout: Duration,
    ) -> Result<ExecutionResult>;
}

/// Configuration for [`ProcessSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Runtime binary, looked up on `PATH` (default: `wasmtime`).
    pub runtime: PathBuf,
    /// Arguments; `{module}` is replaced with the module path
    /// (default: `run {module}`).
    pub runtime_args: Vec<String>,
    /// Output limit in bytes (default: [`MAX_OUTPUT_SIZE`]).
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: PathBuf::from("wasmtime"),
            runtime_args: vec!["run".into(), "{module}".into()],
            max_output_bytes: MAX_OUTPUT_SIZE,
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the runtime binary.
    pub fn runtime(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.config.runtime = runtime.into();
        self
    }

    /// Set the runtime arguments.
    pub fn runtime_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.runtime_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the output limit.
    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.config.max_output_bytes = limit;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<SandboxConfig> {
        if self.config.runtime.as_os_str().is_empty() {
            return Err(CoreError::SandboxLoad("runtime is required".into()));
        }
        if self.config.max_output_bytes == 0 {
            return Err(CoreError::SandboxLoad(
                "max_output_bytes must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Sandbox backed by an external WebAssembly runtime process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn command(&self, module: &ModuleHandle) -> Command {
        let module_path = module.path.to_string_lossy();
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(
            self.config
                .runtime_args
                .iter()
                .map(|arg| arg.replace("{module}", &module_path)),
        )
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        // The runtime itself may need PATH; the module never sees it
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd
    }
}

#[async_trait]
impl ExecutionSandbox for ProcessSandbox {
    async fn load(&self, entry: &CacheEntry) -> Result<ModuleHandle> {
        let mut file = tokio::fs::File::open(&entry.path)
            .await
            .map_err(|e| CoreError::SandboxLoad(format!("{}: {e}", entry.path.display())))?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                CoreError::SandboxLoad(format!(
                    "{} is too short to be a WebAssembly module",
                    entry.address
                ))
            } else {
                CoreError::SandboxLoad(format!("{}: {e}", entry.path.display()))
            }
        })?;

        if header[..4] != WASM_MAGIC {
            return Err(CoreError::SandboxLoad(format!(
                "{} is not a WebAssembly module",
                entry.address
            )));
        }
        if !WASM_VERSIONS.iter().any(|v| header[4..] == v[..]) {
            return Err(CoreError::SandboxLoad(format!(
                "{} has unsupported WebAssembly version {:02x?}",
                entry.address,
                &header[4..]
            )));
        }

        tracing::debug!(address = %entry.address, size = entry.size, "Loaded module");
        Ok(ModuleHandle {
            address: entry.address,
            path: entry.path.clone(),
        })
    }

    async fn run(
        &self,
        module: &ModuleHandle,
        input: Bytes,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let mut child = self.command(module).spawn().map_err(|e| {
            CoreError::SandboxFault(format!(
                "failed to start {}: {e}",
                self.config.runtime.display()
            ))
        })?;

        let (mut stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => return Err(CoreError::SandboxFault("child stdio not captured".into())),
            };

        let input_len = input.len();
        let writer = tokio::spawn(async move {
            // Modules that ignore their input close stdin early
            if let Err(e) = stdin.write_all(&input).await {
                tracing::trace!(error = %e, "Module did not consume all input");
            }
        });

        let limit = self.config.max_output_bytes;
        let outcome = tokio::time::timeout(timeout, async {
            tokio::join!(
                read_capped(stdout, limit),
                read_capped(stderr, MAX_STDERR_SIZE),
                child.wait()
            )
        })
        .await;
        writer.abort();

        let (stdout, stderr, status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill timed out module");
                }
                tracing::warn!(address = %module.address, timeout_ms = timeout.as_millis() as u64, "Module timed out");
                return Err(CoreError::SandboxFault(format!(
                    "execution timed out after {timeout:?}"
                )));
            }
        };

        let status =
            status.map_err(|e| CoreError::SandboxFault(format!("failed to wait for module: {e}")))?;
        let (output, overflowed) =
            stdout.map_err(|e| CoreError::SandboxFault(format!("failed to read output: {e}")))?;
        if overflowed {
            return Err(CoreError::SandboxFault(format!(
                "output exceeds {limit} bytes"
            )));
        }
        let (stderr, _) = stderr.unwrap_or_default();

        let result = ExecutionResult {
            output: Bytes::from(output),
            exit_code: status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed: start.elapsed(),
        };
        tracing::debug!(
            address = %module.address,
            input_bytes = input_len,
            output_bytes = result.output.len(),
            exit_code = result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Module finished"
        );
        Ok(result)
    }
}

/// Drain `reader`, keeping at most `cap` bytes. The flag reports whether
/// anything was discarded.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut overflowed = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            overflowed = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok((kept, overflowed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn entry_with(dir: &tempfile::TempDir, data: &[u8]) -> CacheEntry {
        let address = ContentAddress::of(data);
        let path = dir.path().join(address.to_string());
        tokio::fs::write(&path, data).await.unwrap();
        CacheEntry {
            address,
            path,
            fetched_at: Utc::now(),
            size: data.len() as u64,
        }
    }

    fn handle() -> ModuleHandle {
        ModuleHandle {
            address: ContentAddress::of(b"module"),
            path: PathBuf::from("/nonexistent/module.wasm"),
        }
    }

    /// A "runtime" that echoes its input.
    fn echo(max_output_bytes: usize) -> ProcessSandbox {
        ProcessSandbox::new(
            SandboxConfig::builder()
                .runtime("cat")
                .runtime_args(Vec::<String>::new())
                .max_output_bytes(max_output_bytes)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.runtime, PathBuf::from("wasmtime"));
        assert_eq!(config.runtime_args, vec!["run", "{module}"]);
        assert_eq!(config.max_output_bytes, MAX_OUTPUT_SIZE);
    }

    #[test]
    fn test_builder_rejects_zero_output_limit() {
        assert!(SandboxConfig::builder().max_output_bytes(0).build().is_err());
    }

    #[test]
    fn test_module_path_substitution() {
        let sandbox = ProcessSandbox::default();
        let cmd = sandbox.command(&handle());
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["run", "/nonexistent/module.wasm"]);
    }

    #[test]
    fn test_non_success_becomes_fault() {
        let result = ExecutionResult {
            output: Bytes::new(),
            exit_code: 134,
            stderr: "wasm trap: unreachable\n".into(),
            elapsed: Duration::ZERO,
        };
        let err = result.into_output().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SandboxExecutionFault);
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_load_accepts_core_module() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(&dir, b"\0asm\x01\0\0\0").await;
        let module = ProcessSandbox::default().load(&entry).await.unwrap();
        assert_eq!(module.address, entry.address);
        assert_eq!(module.path, entry.path);
    }

    #[tokio::test]
    async fn test_load_rejects_non_wasm() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with(&dir, b"#!/bin/sh\necho hi\n").await;
        let err = ProcessSandbox::default().load(&entry).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SandboxLoadError);
    }

    #[tokio::test]
    async fn test_load_rejects_short_and_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let short = entry_with(&dir, b"\0asm").await;
        assert!(ProcessSandbox::default().load(&short).await.is_err());

        let future = entry_with(&dir, b"\0asm\x02\0\0\0").await;
        let err = ProcessSandbox::default().load(&future).await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_passes_input_to_output() {
        let result = echo(MAX_OUTPUT_SIZE)
            .run(&handle(), Bytes::from_static(b"world"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.output, Bytes::from_static(b"world"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_empty_input() {
        let result = echo(MAX_OUTPUT_SIZE)
            .run(&handle(), Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.output.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_output_limit() {
        let err = echo(4)
            .run(&handle(), Bytes::from_static(b"too much output"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SandboxExecutionFault);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout() {
        let sandbox = ProcessSandbox::new(
            SandboxConfig::builder()
                .runtime("sleep")
                .runtime_args(["5"])
                .build()
                .unwrap(),
        );
        let start = Instant::now();
        let err = sandbox
            .run(&handle(), Bytes::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SandboxExecutionFault);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let sandbox = ProcessSandbox::new(
            SandboxConfig::builder()
                .runtime("false")
                .runtime_args(Vec::<String>::new())
                .build()
                .unwrap(),
        );
        let result = sandbox
            .run(&handle(), Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.success());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_missing_runtime_is_fault() {
        let sandbox = ProcessSandbox::new(
            SandboxConfig::builder()
                .runtime("fani-no-such-runtime")
                .build()
                .unwrap(),
        );
        let err = sandbox
            .run(&handle(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SandboxExecutionFault);
    }
}
