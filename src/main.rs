use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transcript_uploader::auth::{PasswordAuthenticator, SessionStore};
use transcript_uploader::cli::{Cli, Commands, OutputFormat};
use transcript_uploader::config::Config;
use transcript_uploader::output::{self, UploadReport};
use transcript_uploader::upload::{TransportError, UploadPipeline};
use transcript_uploader::utils::{format_duration, format_file_size};
use transcript_uploader::{CandidateFile, FileRecord, UploadError};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "transcript_uploader=debug,tpupload=debug"
    } else {
        "transcript_uploader=info,tpupload=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Login { email, password } => {
            let client = reqwest::Client::new();
            let authenticator = PasswordAuthenticator::new(client, config.auth_root(), config.service.anon_key.clone());
            let session = authenticator.sign_in(&email, &password).await?;

            let store = SessionStore::new(config.session_path()?);
            store.save(&session)?;

            println!(
                "Signed in as {} ({}); session valid for {}",
                session.email.as_deref().unwrap_or(&email),
                session.user_id,
                format_duration(session.remaining().num_seconds())
            );
        }
        Commands::Logout => {
            let store = SessionStore::new(config.session_path()?);
            if store.clear()? {
                println!("Signed out");
            } else {
                println!("No stored session");
            }
        }
        Commands::Whoami => {
            let store = SessionStore::new(config.session_path()?);
            match store.load()? {
                Some(session) if session.is_expired() => {
                    println!("Session for {} expired at {}", session.user_id, session.expires_at);
                }
                Some(session) => {
                    println!("User ID: {}", session.user_id);
                    if let Some(email) = &session.email {
                        println!("E-mail:  {}", email);
                    }
                    println!("Expires: {} (in {})", session.expires_at, format_duration(session.remaining().num_seconds()));
                }
                None => println!("Not signed in"),
            }
        }
        Commands::Check { files, mime_type } => {
            check_files(&config, files, mime_type).await?;
        }
        Commands::Upload {
            files,
            mime_type,
            format,
        } => {
            upload_files(&config, files, mime_type, &format, cli.quiet).await?;
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                config.interactive_setup()?;
            }
        }
    }

    Ok(())
}

async fn candidate(path: &Path, mime_type: Option<&str>) -> Result<CandidateFile> {
    let file = CandidateFile::from_path(path).await?;
    Ok(match mime_type {
        Some(mime) => file.with_mime_type(mime),
        None => file,
    })
}

async fn check_files(config: &Config, files: Vec<PathBuf>, mime_type: Option<String>) -> Result<()> {
    let policy = config.upload_policy();
    let mut failures = 0;

    for path in &files {
        let verdict = candidate(path, mime_type.as_deref())
            .await
            .and_then(|file| {
                policy
                    .validate(&file)
                    .map(|_| file)
                    .map_err(anyhow::Error::from)
            });

        match verdict {
            Ok(file) => println!(
                "✔ {} ({}, {})",
                path.display(),
                format_file_size(file.size()),
                file.mime_type()
            ),
            Err(e) => {
                failures += 1;
                println!("✘ {}: {}", path.display(), e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} files would be rejected", failures, files.len());
    }
    Ok(())
}

async fn upload_files(
    config: &Config,
    files: Vec<PathBuf>,
    mime_type: Option<String>,
    format: &OutputFormat,
    quiet: bool,
) -> Result<()> {
    let pipeline = UploadPipeline::from_config(config).context("Failed to set up upload pipeline")?;

    let progress = if quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:20!} [{bar:30.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("=> ");

    let interrupted = CancellationToken::new();
    let on_interrupt = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling uploads");
            on_interrupt.cancel();
        }
    });

    let total = files.len();
    let reports: Vec<UploadReport> = futures_util::stream::iter(files)
        .map(|path| {
            let pipeline = pipeline.clone();
            let bar = progress.add(ProgressBar::new(100).with_style(style.clone()));
            let interrupted = interrupted.clone();
            let mime_type = mime_type.clone();
            async move {
                bar.set_prefix(
                    path.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string()),
                );
                let outcome = upload_one(&pipeline, &path, mime_type.as_deref(), &bar, &interrupted).await;
                UploadReport {
                    file: path.display().to_string(),
                    outcome,
                }
            }
        })
        .buffered(config.app.max_concurrent_uploads)
        .collect()
        .await;

    output::print_reports(&reports, format)?;

    let failed = reports.iter().filter(|r| r.outcome.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} uploads failed", failed, total);
    }
    Ok(())
}

async fn upload_one(
    pipeline: &UploadPipeline,
    path: &Path,
    mime_type: Option<&str>,
    bar: &ProgressBar,
    interrupted: &CancellationToken,
) -> std::result::Result<FileRecord, UploadError> {
    let file = candidate(path, mime_type).await.map_err(|e| {
        bar.abandon_with_message("unreadable");
        UploadError::Transport(TransportError::Source {
            path: path.display().to_string(),
            message: format!("{:#}", e),
        })
    })?;

    let mut handle = pipeline.start(file);
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            update = handle.next_update() => match update {
                Some(update) => {
                    bar.set_position(update.progress as u64);
                    bar.set_message(update.state.label());
                    bar.tick();
                }
                None => break,
            },
            _ = interrupted.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                handle.cancel();
            }
        }
    }

    let outcome = handle.finish().await;
    match &outcome {
        Ok(_) => bar.finish_with_message("done"),
        Err(e) => bar.abandon_with_message(e.kind()),
    }
    outcome
}
