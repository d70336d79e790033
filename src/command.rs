//! Shared command-line execution for every adapter.
//!
//! An adapter implements [`CommandLine`]: it declares its input and output
//! schema and knows how to list its outputs after a run. [`run`] does the
//! rest: validate, assemble the argument vector, launch one subprocess,
//! check the exit status and verify that declared outputs exist.

use crate::error::{AdapterError, Result};
use crate::filemanip::{absolute, absolute_from_cwd};
use crate::schema::{build_args, FieldSpec, InputRecord, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Declaration of one output slot.
#[derive(Debug, Clone, Copy)]
pub struct OutputField {
    pub name: &'static str,
    /// The run fails with `OutputNotFound` if a listed path is missing.
    pub must_exist: bool,
    pub desc: &'static str,
}

impl OutputField {
    pub const fn new(name: &'static str, desc: &'static str) -> Self {
        Self {
            name,
            must_exist: true,
            desc,
        }
    }

    pub const fn optional(self) -> Self {
        Self {
            must_exist: false,
            ..self
        }
    }
}

/// One output slot holds a single path or an ordered list of paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputValue {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
}

impl OutputValue {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            OutputValue::Path(p) => vec![p.as_path()],
            OutputValue::Paths(ps) => ps.iter().map(PathBuf::as_path).collect(),
        }
    }
}

/// Output slot name to resulting path(s). Unresolved slots are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutputRecord(BTreeMap<String, OutputValue>);

impl OutputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_path(&mut self, slot: &str, path: impl Into<PathBuf>) {
        self.0
            .insert(slot.to_string(), OutputValue::Path(path.into()));
    }

    pub fn insert_paths(&mut self, slot: &str, paths: Vec<PathBuf>) {
        self.0.insert(slot.to_string(), OutputValue::Paths(paths));
    }

    pub fn get(&self, slot: &str) -> Option<&OutputValue> {
        self.0.get(slot)
    }

    /// Paths of `slot`, empty when the slot is undefined.
    pub fn paths(&self, slot: &str) -> Vec<&Path> {
        self.get(slot).map(OutputValue::paths).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every (slot, path) pair, slot-ordered.
    pub fn rows(&self) -> Vec<(&str, &Path)> {
        self.0
            .iter()
            .flat_map(|(slot, value)| value.paths().into_iter().map(move |p| (slot.as_str(), p)))
            .collect()
    }

    /// Resolve every relative path against `base`.
    pub fn absolutize(self, base: &Path) -> Self {
        let map = self
            .0
            .into_iter()
            .map(|(slot, value)| {
                let value = match value {
                    OutputValue::Path(p) => OutputValue::Path(absolute(base, p)),
                    OutputValue::Paths(ps) => {
                        OutputValue::Paths(ps.into_iter().map(|p| absolute(base, p)).collect())
                    }
                };
                (slot, value)
            })
            .collect();
        OutputRecord(map)
    }
}

/// Where and with which binary an adapter runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Working directory of the subprocess, always absolute; relative paths
    /// resolve here.
    pub cwd: PathBuf,
    /// Replaces the adapter's default binary name.
    pub binary: Option<String>,
}

impl RunContext {
    /// A relative `cwd` is taken from the process working directory.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        Self {
            cwd: absolute_from_cwd(&cwd).unwrap_or(cwd),
            binary: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn program(&self, adapter: &dyn CommandLine) -> String {
        self.binary
            .clone()
            .unwrap_or_else(|| adapter.default_binary().to_string())
    }
}

/// Captured result of one subprocess.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A wrapped command-line tool.
pub trait CommandLine: Send + Sync {
    /// Name used on the CLI and in reports.
    fn name(&self) -> &'static str;

    fn default_binary(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldSpec];

    fn output_fields(&self) -> &'static [OutputField];

    fn inputs(&self) -> &InputRecord;

    /// Value for an unset field declared as generated.
    fn generated_value(&self, _field: &FieldSpec, _ctx: &RunContext) -> Option<Value> {
        None
    }

    /// Write auxiliary files the tool expects before it is launched.
    fn prepare(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Whether a zero exit status can be trusted as success.
    fn exit_status_reliable(&self) -> bool {
        true
    }

    /// Output paths of a successful run; relative paths are resolved later.
    fn list_outputs(&self, ctx: &RunContext, output: &CommandOutput) -> Result<OutputRecord>;
}

/// Result of [`run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub output: CommandOutput,
    pub outputs: OutputRecord,
}

/// Validated argument vector, without the program name.
pub fn arguments(adapter: &dyn CommandLine, ctx: &RunContext) -> Result<Vec<String>> {
    build_args(adapter.fields(), adapter.inputs(), &ctx.cwd, |field| {
        adapter.generated_value(field, ctx)
    })
}

/// Full command line as it would be typed into a shell.
pub fn command_line(adapter: &dyn CommandLine, ctx: &RunContext) -> Result<String> {
    let mut argv = vec![ctx.program(adapter)];
    argv.extend(arguments(adapter, ctx)?);
    Ok(shell_join(&argv))
}

/// Join tokens with spaces, single-quoting those that contain whitespace.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.chars().any(char::is_whitespace) {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Check if `program` can be launched.
///
/// Only the launch is checked; several wrapped tools exit non-zero when
/// asked for help.
pub fn binary_available(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Run `program` in `cwd` and capture its output.
pub async fn execute(program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
    let start = std::time::Instant::now();

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AdapterError::Execution {
            command: program.to_string(),
            code: None,
            message: format!("failed to launch: {}", e),
        })?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Validate, launch, and collect the outputs of one adapter invocation.
pub async fn run(adapter: &dyn CommandLine, ctx: &RunContext) -> Result<RunResult> {
    let args = arguments(adapter, ctx)?;
    adapter.prepare(ctx)?;

    let program = ctx.program(adapter);
    info!(
        adapter = adapter.name(),
        program = %program,
        args = ?args,
        cwd = %ctx.cwd.display(),
        "Launching external tool"
    );

    let output = execute(&program, &args, &ctx.cwd).await?;
    debug!(
        adapter = adapter.name(),
        exit_code = ?output.exit_code,
        elapsed_ms = output.elapsed_ms,
        "External tool finished"
    );

    if !output.success() {
        let message = if output.stderr.trim().is_empty() {
            output.stdout.clone()
        } else {
            output.stderr.clone()
        };
        return Err(AdapterError::Execution {
            command: program,
            code: output.exit_code,
            message: message.trim().to_string(),
        });
    }

    if !adapter.exit_status_reliable() && !output.stderr.trim().is_empty() {
        warn!(
            adapter = adapter.name(),
            stderr = %output.stderr.trim(),
            "Tool exited with status 0 but wrote to stderr; its exit status is not reliable"
        );
    }

    let outputs = adapter.list_outputs(ctx, &output)?.absolutize(&ctx.cwd);
    verify_outputs(adapter.output_fields(), &outputs)?;

    let mut argv = vec![program];
    argv.extend(args);
    Ok(RunResult {
        argv,
        output,
        outputs,
    })
}

/// Fail with `OutputNotFound` for the first missing path of a must-exist slot.
pub fn verify_outputs(fields: &[OutputField], outputs: &OutputRecord) -> Result<()> {
    for field in fields.iter().filter(|f| f.must_exist) {
        for path in outputs.paths(field.name) {
            if !path.exists() {
                return Err(AdapterError::OutputNotFound {
                    slot: field.name.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}
