use async_trait::async_trait;
use omap_bench_types::BuildSpec;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

#[derive(Debug)]
pub enum BuildError {
  Failed {
    step: &'static str,
    status: ExitStatus,
    stderr: String,
  },
  Spawn {
    step: &'static str,
    source: io::Error,
  },
}

impl Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::Failed { step, status, .. } => write!(f, "`{step}` failed ({status})"),
      BuildError::Spawn { step, source } => write!(f, "failed to run `{step}`: {source}"),
    }
  }
}

impl Error for BuildError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      BuildError::Spawn { source, .. } => Some(source),
      _ => None,
    }
  }
}

/// Rebuilds the measured program.
#[async_trait]
pub trait Builder: Send + Sync {
  async fn build(&self, spec: &BuildSpec) -> Result<(), BuildError>;
}

pub fn cflags(flags: &[String]) -> String {
  let mut out = "CFLAGS=".to_string();
  for flag in flags {
    out.push_str(" -D");
    out.push_str(flag);
  }
  out
}

pub fn make_args(spec: &BuildSpec) -> Vec<String> {
  let (sgx_debug, sgx_prerelease) = if spec.debug { (1, 0) } else { (0, 1) };
  let mut args = vec![
    format!("SGX_DEBUG={sgx_debug}"),
    format!("SGX_PRERELEASE={sgx_prerelease}"),
    format!("CONFIG={}", spec.config),
    cflags(&spec.flags),
  ];
  args.extend(spec.additional_vars.iter().cloned());
  args
}

/// Runs `make clean` and then `make` with the enclave configuration and flags.
pub struct MakeBuilder {
  make: String,
}

impl MakeBuilder {
  pub fn new() -> Self {
    Self {
      make: "make".to_string(),
    }
  }

  /// Uses a different make binary, e.g. `gmake`.
  pub fn with_program(make: impl Into<String>) -> Self {
    Self { make: make.into() }
  }

  async fn make(
    &self,
    step: &'static str,
    dir: Option<&Path>,
    args: &[String],
  ) -> Result<(), BuildError> {
    let mut cmd = Command::new(&self.make);
    cmd
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped());
    if let Some(dir) = dir {
      cmd.current_dir(dir);
    };
    let output = cmd
      .output()
      .await
      .map_err(|source| BuildError::Spawn { step, source })?;
    if !output.status.success() {
      return Err(BuildError::Failed {
        step,
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    };
    Ok(())
  }
}

impl Default for MakeBuilder {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Builder for MakeBuilder {
  async fn build(&self, spec: &BuildSpec) -> Result<(), BuildError> {
    let dir = spec.dir.as_deref();
    info!("make clean");
    self.make("make clean", dir, &["clean".to_string()]).await?;
    let args = make_args(spec);
    info!(config = %spec.config, flags = ?spec.flags, debug = spec.debug, "make");
    self.make("make", dir, &args).await
  }
}
