//! maild - submit mail from JSON lines on stdin through the dispatch daemon.
//!
//! Each input line is one `EmailCtx` object. The daemon keeps a single SMTP
//! session open while lines keep arriving and closes it when input goes quiet.
//! EOF, SIGINT or SIGTERM closes the queue and waits for the daemon to drain.

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use maild::{Config, EmailCtx, MailerCell, SendError, SmtpDialer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("maild_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        tls = ?config.smtp.tls,
        credentials_set = config.smtp.has_credentials(),
        idle_timeout_ms = config.daemon.idle_timeout.as_millis() as u64,
        close_on_exit = config.daemon.close_on_exit,
        "config_loaded"
    );

    let cell = MailerCell::new();
    let mailer = cell.init(config.daemon.clone(), SmtpDialer::new(config.smtp.clone()));

    // Create shutdown signal future
    let shutdown = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
    };

    // Pin the shutdown future
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut line_number = 0u64;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("maild_stopping");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!(lines = line_number, "stdin_closed");
                    break;
                };
                line_number += 1;

                if line.trim().is_empty() {
                    continue;
                }

                let ctx: EmailCtx = match serde_json::from_str(&line) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        warn!(line = line_number, error = %e, "input_parse_failed");
                        continue;
                    }
                };

                match mailer.send(&ctx).await {
                    Ok(()) => info!(line = line_number, subject = %ctx.subject, "mail_enqueued"),
                    Err(SendError::Message(e)) => {
                        warn!(line = line_number, error = %e, "mail_build_failed");
                    }
                    Err(SendError::Dispatch(e)) => {
                        error!(line = line_number, error = %e, "mail_enqueue_failed");
                        break;
                    }
                }
            }
        }
    }

    if let Some(stats) = cell.shutdown().await {
        info!(
            sent = stats.sent,
            dropped = stats.dropped,
            "maild_shutdown_complete"
        );
    }

    Ok(())
}
