//! The map renderer seam.
//!
//! The shipped [`CommandRenderer`] runs one external process per job, so a
//! crash in the plotting stack cannot take the worker down with it. The
//! child is killed when its render future is dropped, which is how an
//! aborted unit or an expired render timeout stops it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use meteomap_core::{Parameter, RegionBounds};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Everything the renderer needs to draw one map.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub source_ref: &'a str,
    pub parameter: Parameter,
    /// `None` renders the whole domain of the source file.
    pub bounds: Option<&'a RegionBounds>,
    /// Where the PNG must be written.
    pub output: &'a Path,
}

/// Map rendering. One call draws one map; the worker pool bounds how many
/// calls run at once.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render one map into `request.output`.
    async fn render(&self, request: &RenderRequest<'_>) -> Result<(), RenderError>;

    /// Open `source_ref` under the given decoder filter so its side-car
    /// index is built. `None` opens the file unfiltered.
    async fn build_index(&self, source_ref: &str, filter: Option<&str>) -> Result<(), RenderError>;
}

/// Errors raised while rendering a single map.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to start renderer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for renderer '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Renderer '{program}' killed after {limit:?}")]
    Timeout { program: String, limit: Duration },

    #[error("Renderer reported success but wrote no file at {0}")]
    MissingOutput(PathBuf),
}

/// Longest stderr excerpt kept in a [`RenderError::Failed`].
const MAX_STDERR_LEN: usize = 2000;

/// Stderr bytes held in memory while the child runs. Older output is
/// discarded as newer output arrives.
const MAX_CAPTURE_BYTES: usize = 16 * 1024;

/// Renders by running an external command per job.
///
/// Invocation:
///
/// ```text
/// <command> --source <ref> --parameter <name> --output <png> [--bbox lon_min,lon_max,lat_min,lat_max]
/// <command> --source <ref> --index-only [--filter shortName=<name>]
/// ```
///
/// Stdout is discarded. Stderr is drained while the child runs and its tail
/// is reported on failure.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    base_args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            timeout: None,
        }
    }

    /// Split a whitespace-separated command line. Returns `None` when the
    /// line is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Kill any invocation still running after `limit`.
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), RenderError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RenderError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stderr = child.stderr.take();

        // Stderr is read alongside the wait so a chatty child never blocks
        // on a full pipe.
        let finished = async { tokio::join!(child.wait(), read_tail(stderr)) };
        let (waited, stderr) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(done) => done,
                // Dropping `child` kills the process.
                Err(_) => {
                    return Err(RenderError::Timeout {
                        program: self.program.clone(),
                        limit,
                    })
                }
            },
            None => finished.await,
        };

        let status = waited.map_err(|source| RenderError::Wait {
            program: self.program.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(RenderError::Failed {
                status: status.to_string(),
                stderr: stderr_tail(&stderr),
            })
        }
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, request: &RenderRequest<'_>) -> Result<(), RenderError> {
        self.run(render_args(request)).await?;

        let written = tokio::fs::metadata(request.output)
            .await
            .is_ok_and(|m| m.is_file());
        if !written {
            return Err(RenderError::MissingOutput(request.output.to_path_buf()));
        }
        Ok(())
    }

    async fn build_index(&self, source_ref: &str, filter: Option<&str>) -> Result<(), RenderError> {
        self.run(index_args(source_ref, filter)).await
    }
}

fn render_args(request: &RenderRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--source".into(),
        request.source_ref.into(),
        "--parameter".into(),
        request.parameter.as_str().into(),
        "--output".into(),
        request.output.into(),
    ];
    if let Some(b) = request.bounds {
        args.push("--bbox".into());
        args.push(format!("{},{},{},{}", b.lon_min, b.lon_max, b.lat_min, b.lat_max).into());
    }
    args
}

fn index_args(source_ref: &str, filter: Option<&str>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--source".into(), source_ref.into(), "--index-only".into()];
    if let Some(short_name) = filter {
        args.push("--filter".into());
        args.push(format!("shortName={short_name}").into());
    }
    args
}

/// Read `stream` to the end, keeping at most [`MAX_CAPTURE_BYTES`] of its
/// most recent output.
async fn read_tail<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut stream) = stream else {
        return tail;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > MAX_CAPTURE_BYTES {
                    let excess = tail.len() - MAX_CAPTURE_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_STDERR_LEN {
        return text.to_string();
    }
    let mut start = text.len() - MAX_STDERR_LEN;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
