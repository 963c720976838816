use std::sync::Arc;

use anyhow::{Context, bail};

use entity_emailer::config::{EmailerConfig, JobScheduleConfig, SmtpConfig};
use entity_emailer::dispatcher::Dispatcher;
use entity_emailer::expander::AddressExpander;
use entity_emailer::jobs;
use entity_emailer::materializer::EmailMaterializer;
use entity_emailer::render::TemplateRenderer;
use entity_emailer::resolver::RecipientResolver;
use entity_emailer::store::LibSqlBackend;
use entity_emailer::transport::SmtpMailer;

const USAGE: &str = "usage: entity-emailer [convert|send|run]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    if !matches!(mode.as_str(), "convert" | "send" | "run") {
        bail!("unknown command '{mode}'\n{USAGE}");
    }

    let emailer_config = EmailerConfig::from_env()?;
    let schedule_config = JobScheduleConfig::from_env()?;

    eprintln!("📧 Entity Emailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", schedule_config.db_path.display());
    eprintln!("   Medium: {}", emailer_config.email_medium_name);

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&schedule_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    schedule_config.db_path.display()
                )
            })?,
    );

    // ── Components ───────────────────────────────────────────────────────
    let resolver = RecipientResolver::new(&emailer_config, db.clone(), db.clone());
    let materializer = Arc::new(EmailMaterializer::new(
        resolver.clone(),
        db.clone(),
        db.clone(),
    ));

    if mode == "convert" {
        let report = jobs::convert_events_to_emails(&materializer).await?;
        eprintln!("   Converted: {} created, {} failed", report.created, report.failed);
        return Ok(());
    }

    let smtp_config = SmtpConfig::from_env()?;
    let mailer = Arc::new(SmtpMailer::new(&smtp_config)?);
    let dispatcher = Arc::new(Dispatcher::new(
        emailer_config,
        db.clone(),
        db.clone(),
        AddressExpander::new(resolver),
        Arc::new(TemplateRenderer::new(&schedule_config.template_dir)),
        mailer,
    ));

    if mode == "send" {
        let report = jobs::send_unsent_scheduled_emails(&dispatcher).await?;
        eprintln!("   Sent: {} sent, {} failed", report.sent, report.failed);
        return Ok(());
    }

    // ── Scheduled jobs ───────────────────────────────────────────────────
    eprintln!("   Convert cron: {}", schedule_config.convert_schedule);
    eprintln!("   Send cron: {}", schedule_config.send_schedule);

    let convert_handle = jobs::spawn_job_ticker(
        "convert_events_to_emails",
        schedule_config.convert_cron()?,
        move || {
            let materializer = Arc::clone(&materializer);
            async move {
                jobs::convert_events_to_emails(&materializer).await?;
                Ok(())
            }
        },
    );
    let send_handle = jobs::spawn_job_ticker(
        "send_unsent_scheduled_emails",
        schedule_config.send_cron()?,
        move || {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                jobs::send_unsent_scheduled_emails(&dispatcher).await?;
                Ok(())
            }
        },
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    convert_handle.abort();
    send_handle.abort();
    Ok(())
}
