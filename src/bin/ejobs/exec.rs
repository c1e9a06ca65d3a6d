use std::io;
use std::process::Stdio;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use enchanted_jobs::types::job::Job;
use enchanted_jobs::Handler;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, instrument};

/// Runs an external command per job.
#[derive(Debug)]
pub(crate) struct Exec {
    program: String,
    args: Vec<String>,
}

impl Exec {
    pub(crate) fn new(cmd: &[String]) -> Result<Self> {
        let (program, args) = cmd.split_first().context("missing command")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Handler for Exec {
    #[instrument(name = "exec", skip_all, fields(id = %job.id, job = %job.job))]
    async fn handle(&self, job: &Job) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("EJOBS_ID", &job.id)
            .env("EJOBS_JOB", &job.job)
            .env("EJOBS_PIPELINE", &job.pipeline)
            .env("EJOBS_ATTEMPT", job.attempt.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;

        let mut stdin = child.stdin.take().context("no stdin on child")?;
        match stdin.write_all(job.payload.as_bytes()).await {
            // The command is free to ignore its input.
            Err(error) if error.kind() != io::ErrorKind::BrokenPipe => {
                return Err(error).context("writing payload");
            },
            _ => {},
        }
        drop(stdin);

        let timeout = job.options.timeout();
        let status = match time::timeout(timeout, child.wait()).await {
            Ok(status) => status.context("waiting for command")?,
            Err(_) => bail!("timed out after {timeout:?}"),
        };

        debug!(%status, "command finished");
        ensure!(status.success(), "command failed: {status}");
        Ok(())
    }
}
