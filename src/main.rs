// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod chat;
mod cli;

use std::io;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands};
use tally_config::Config;
use tally_core::{DispatchOptions, JobPoller, PollPolicy, QueryDispatcher, TurnOutcome};
use tally_input::MentionResolver;
use tally_service::{AnalysisService, FileDescriptor, MockService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Some(Commands::Completions { shell }) = &cli.command {
        cli::print_completions(*shell);
        return Ok(());
    }

    let mut config = tally_config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    if let Some(Commands::ShowConfig) = &cli.command {
        println!("{}", toml::to_string_pretty(&config).context("serializing config")?);
        return Ok(());
    }

    let service = build_service(&cli, &config)?;
    let session = config.query.default_session.clone();

    match cli.command {
        Some(cmd) => run_command(cmd, service, &config, &session).await,
        None => run_chat(cli.resume, service, &config, session).await,
    }
}

fn build_service(cli: &Cli, config: &Config) -> anyhow::Result<Arc<dyn AnalysisService>> {
    if cli.offline {
        return Ok(Arc::new(MockService::default()));
    }
    let http = tally_service::from_config(&config.server)
        .with_context(|| format!("connecting to {}", config.server.base_url))?;
    Ok(Arc::new(http))
}

async fn run_chat(
    resume: bool,
    service: Arc<dyn AnalysisService>,
    config: &Config,
    session: String,
) -> anyhow::Result<()> {
    let sessions = Arc::new(chat::SessionRefresh::new(service.clone()));
    let dispatcher = Arc::new(
        QueryDispatcher::new(service.clone(), DispatchOptions::from_config(&config.query))
            .with_observer(sessions.clone()),
    );
    if resume {
        match dispatcher.load_history(&session).await {
            Ok(n) => eprintln!("resumed '{session}' with {n} messages"),
            Err(e) => eprintln!("could not load history of '{session}': {e}"),
        }
    }

    let ctx = chat::ChatContext {
        dispatcher,
        poller: JobPoller::new(service, PollPolicy::from(&config.upload)),
        resolver: MentionResolver::from_config(&config.mention),
        sessions,
        session,
    };
    chat::run(ctx, is_stdin_tty()).await
}

async fn run_command(
    cmd: Commands,
    service: Arc<dyn AnalysisService>,
    config: &Config,
    session: &str,
) -> anyhow::Result<()> {
    match cmd {
        Commands::Ask { question, json } => {
            let dispatcher =
                QueryDispatcher::new(service, DispatchOptions::from_config(&config.query));
            let outcome = chat::run_turn(&dispatcher, session, &question.join(" "), !json).await?;
            match outcome {
                TurnOutcome::Reconciled { message } => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&message)?);
                    }
                    Ok(())
                }
                TurnOutcome::RolledBack { failure, .. } => Err(failure.into()),
            }
        }
        Commands::Upload { path, group } => {
            let poller = JobPoller::new(service.clone(), PollPolicy::from(&config.upload));
            let (tx, printer) = chat::spawn_progress_printer();
            let outcome = poller
                .upload_and_poll(&path, Some(tx))
                .await
                .with_context(|| format!("uploading {}", path.display()))?;
            let _ = printer.await;
            chat::print_job_outcome(&outcome);
            if let Some(err) = outcome.error() {
                return Err(err.into());
            }
            if let Some(group) = group {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("upload path has no file name")?;
                service.set_file_group(&filename, &group).await?;
                println!("{filename} -> group '{group}'");
            }
            Ok(())
        }
        Commands::History => {
            let dispatcher = QueryDispatcher::new(service, DispatchOptions::default());
            dispatcher.load_history(session).await?;
            chat::print_transcript(&dispatcher.messages(session));
            Ok(())
        }
        Commands::Clear => {
            let dispatcher = QueryDispatcher::new(service, DispatchOptions::default());
            dispatcher.clear_history(session).await?;
            println!("history of '{session}' cleared");
            Ok(())
        }
        Commands::Files { delete: Some(filename) } => {
            service.delete_file(&filename).await?;
            println!("deleted {filename}");
            Ok(())
        }
        Commands::Files { delete: None } => {
            for f in service.list_files().await? {
                println!("{}", format_file(&f));
            }
            Ok(())
        }
        Commands::Sessions => {
            for s in service.list_sessions().await? {
                let marker = if s.session_id == session { "*" } else { " " };
                println!("{marker} {}", s.session_id);
            }
            Ok(())
        }
        Commands::Models { json } => {
            let models = service.list_models().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                for m in models.iter().filter(|m| m.enabled) {
                    println!("{:<28} {:<24} {:<10} {}", m.id, m.label, m.provider, m.cost);
                }
            }
            Ok(())
        }
        Commands::Complete { text } => {
            let mut resolver = MentionResolver::from_config(&config.mention);
            resolver.set_catalogue(&service.list_files().await?);
            chat::print_candidates(&mut resolver, &text);
            Ok(())
        }
        Commands::ShowConfig | Commands::Completions { .. } => Ok(()),
    }
}

/// One line of `tally files`: name, size, upload time and group.
pub(crate) fn format_file(f: &FileDescriptor) -> String {
    let uploaded = chrono::DateTime::from_timestamp(f.created_at as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let group = f.group.as_deref().unwrap_or("-");
    format!("{:<32} {:>10} {uploaded}  {group}", f.filename, human_size(f.size))
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn is_stdin_tty() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::isatty(io::stdin().as_raw_fd()) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn file_line_shows_group_and_date() {
        let f = FileDescriptor {
            filename: "revenue.csv".into(),
            size: 2048,
            created_at: 0.0,
            group: Some("finance".into()),
        };
        let line = format_file(&f);
        assert!(line.starts_with("revenue.csv"));
        assert!(line.contains("2.0 KB"));
        assert!(line.contains("1970-01-01 00:00"));
        assert!(line.ends_with("finance"));
    }
}
