mod args;
mod exec;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use enchanted_jobs::config::Config;
use enchanted_jobs::event::{Event, Events, TracingListener};
use enchanted_jobs::pool::handler::ErrorHandler;
use enchanted_jobs::{HandlerPool, Job, JobOptions, Jobs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Command};
use crate::exec::Exec;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::Serve { cmd } => serve(&config, &cmd, cancel).await,
        Command::Push {
            job,
            payload,
            pipeline,
            delay,
            max_attempts,
        } => {
            let job = Job::new(job, payload).with_options(JobOptions {
                pipeline,
                delay: Duration::from_millis(delay),
                max_attempts,
                ..Default::default()
            });

            let running = Running::start(&config).await?;
            let pushed = running.jobs.push(job).await;
            running.stop().await?;

            println!("{}", pushed?);
            Ok(())
        },
        Command::Stat => {
            let running = Running::start(&config).await?;
            let stats = running.jobs.stats().await;
            running.stop().await?;

            print!("{}", serde_yaml::to_string(&stats?)?);
            Ok(())
        },
    }
}

/// Consumes every configured pipeline until cancelled.
async fn serve(config: &Config, cmd: &[String], cancel: CancellationToken) -> Result<()> {
    let jobs = Arc::new(Jobs::from_config(
        config,
        Events::new().with_listener(TracingListener),
    )?);

    let handlers = HandlerPool::replicate(Arc::new(Exec::new(cmd)?), config.workers)?;
    let on_error: ErrorHandler = Arc::new(|job: &Job, error: &anyhow::Error| {
        error!(id = %job.id, job = %job.job, attempt = job.attempt, error = format!("{error:#}"), "job buried");
    });
    jobs.consume(handlers, Some(on_error)).await?;

    {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            info!("stopping, waiting for running jobs");
            jobs.stop().await;
        });
    }

    jobs.serve().await?;
    Ok(())
}

/// Brokers served in the background for a one-off command.
struct Running {
    jobs: Arc<Jobs>,
    serve: JoinHandle<enchanted_jobs::Result<()>>,
}

impl Running {
    /// Serves every broker and waits for all of them to be ready.
    async fn start(config: &Config) -> Result<Self> {
        let (ready_tx, mut ready_rx) = watch::channel(0usize);
        let events = Events::new()
            .with_listener(TracingListener)
            .with_listener(move |event: &Event<'_>| {
                if let Event::BrokerReady { .. } = event {
                    ready_tx.send_modify(|n| *n += 1);
                }
            });

        let jobs = Arc::new(Jobs::from_config(config, events)?);
        let brokers = jobs.brokers().count();
        let mut serve = tokio::spawn({
            let jobs = jobs.clone();
            async move { jobs.serve().await }
        });

        select! {
            ready = ready_rx.wait_for(|n| *n >= brokers) => {
                ready.context("brokers went away before starting")?;
            },
            served = &mut serve => {
                served??;
                bail!("brokers stopped before starting");
            },
        }

        Ok(Self { jobs, serve })
    }

    async fn stop(self) -> Result<()> {
        self.jobs.stop().await;
        self.serve.await??;
        Ok(())
    }
}
