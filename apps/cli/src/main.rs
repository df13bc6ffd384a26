use std::{
    fs::OpenOptions,
    io::Write as _,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use campaign_core::CampaignController;
use chrono::Local;
use clap::{Parser, ValueEnum};
use delivery::HttpEngineProvider;
use shared::{
    domain::{CampaignMode, Nation, TelegramKind, TelegramParams},
    protocol::{LogLevel, Notification},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(name = "tgcast", about = "Dispatches NationStates telegram campaigns")]
struct Cli {
    /// Recipient specification, e.g. "nation_one, nation_two".
    recipients: String,
    /// Nation name or email identifying who operates this campaign.
    #[arg(long)]
    user_agent: Option<String>,
    /// Telegram API client key.
    #[arg(long)]
    client_key: Option<String>,
    #[arg(long)]
    telegram_id: String,
    #[arg(long)]
    secret_key: String,
    #[arg(long, value_enum, default_value = "standard")]
    kind: Kind,
    /// Evaluate and report recipients without sending telegrams.
    #[arg(long)]
    dry_run: bool,
    /// Keep the campaign running and pick up newly matching recipients.
    #[arg(long)]
    continuous: bool,
    /// Include failure details in per-recipient reports.
    #[arg(long)]
    verbose: bool,
    /// Milliseconds between delivery attempts, overriding both
    /// configured rates.
    #[arg(long)]
    rate_ms: Option<u64>,
    /// Seconds between recipient re-evaluations in continuous mode.
    #[arg(long)]
    refresh_secs: Option<u64>,
    #[arg(long, default_value = "tgcast.toml")]
    config: PathBuf,
    /// Append a timestamped line for every delivered telegram.
    #[arg(long)]
    sent_log: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Kind {
    Recruitment,
    Standard,
}

impl From<Kind> for TelegramKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Recruitment => TelegramKind::Recruitment,
            Kind::Standard => TelegramKind::NonRecruitment,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.config);

    let Some(user_agent) = cli.user_agent.clone().or_else(|| settings.user_agent.clone()) else {
        bail!("a user agent is required (--user-agent or the config file)");
    };
    let Some(client_key) = cli.client_key.clone().or_else(|| settings.client_key.clone()) else {
        bail!("a client key is required (--client-key or the config file)");
    };

    let mut engine_config = settings.engine_config();
    if let Some(rate_ms) = cli.rate_ms {
        let rate = Duration::from_millis(rate_ms);
        engine_config.recruitment_rate = rate;
        engine_config.standard_rate = rate;
    }
    if let Some(refresh_secs) = cli.refresh_secs {
        engine_config.refresh_interval = Duration::from_secs(refresh_secs);
    }

    let provider = Arc::new(HttpEngineProvider::new(
        settings.api_base_url.clone(),
        engine_config,
    ));
    let controller = CampaignController::new(provider);
    let mut notifications = controller.subscribe();

    let params = TelegramParams {
        telegram_id: cli.telegram_id.clone(),
        secret_key: cli.secret_key.clone(),
        kind: cli.kind.into(),
    };
    let mode = if cli.continuous {
        CampaignMode::Continuous
    } else {
        CampaignMode::OneShot
    };

    // first Ctrl-C cancels cooperatively, a second one exits hard
    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                controller.cancel().await;
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                process::exit(130);
            }
        });
    }

    controller
        .start(
            &user_agent,
            &client_key,
            &cli.recipients,
            params,
            mode,
            cli.dry_run,
            cli.verbose,
        )
        .await;

    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!("display fell behind, skipped {skipped} notifications");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Some(cancelled) = render(notification, cli.sent_log.as_deref())? {
            if cancelled {
                process::exit(130);
            }
            break;
        }
    }

    Ok(())
}

/// Prints one notification; returns the outcome tag once the campaign
/// is over.
fn render(notification: Notification, sent_log: Option<&Path>) -> Result<Option<bool>> {
    match notification {
        Notification::Log {
            level: LogLevel::Info,
            text,
        } => info!("{text}"),
        Notification::Log {
            level: LogLevel::Error,
            text,
        } => error!("{text}"),
        Notification::JobSent { nations } => {
            info!(
                "Sending to {} recipient(s): {}",
                nations.len(),
                join_nations(&nations)
            );
        }
        Notification::JobWaiting => {
            info!("No recipients match yet; waiting for new ones.");
        }
        Notification::RecipientSent { nation } => {
            info!("Telegram sent to {nation}.");
            if let Some(path) = sent_log {
                append_sent(path, &nation)?;
            }
        }
        Notification::RecipientFailed { nation, detail } => match detail {
            Some(detail) => error!("Failed to send to {nation}: {detail}"),
            None => error!("Failed to send to {nation}."),
        },
        Notification::NewRecipients { nations } => {
            info!(
                "Discovered {} new recipient(s): {}",
                nations.len(),
                join_nations(&nations)
            );
        }
        Notification::Finished { cancelled } => return Ok(Some(cancelled)),
    }
    Ok(None)
}

fn join_nations(nations: &[Nation]) -> String {
    nations
        .iter()
        .map(Nation::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn append_sent(path: &Path, nation: &Nation) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open sent log '{}'", path.display()))?;
    writeln!(file, "{} {nation}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn render_surfaces_the_finished_outcome() {
        assert_eq!(
            render(Notification::Finished { cancelled: true }, None).expect("render"),
            Some(true)
        );
        assert_eq!(
            render(Notification::Finished { cancelled: false }, None).expect("render"),
            Some(false)
        );
        assert_eq!(
            render(Notification::JobWaiting, None).expect("render"),
            None
        );
    }

    #[test]
    fn render_appends_sent_nations_to_the_log() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("tgcast_sent_log_test_{suffix}"));

        let outcome = render(
            Notification::RecipientSent {
                nation: Nation::new("testlandia"),
            },
            Some(&path),
        )
        .expect("render");
        assert_eq!(outcome, None);

        let logged = fs::read_to_string(&path).expect("sent log");
        assert!(logged.trim().ends_with("testlandia"));

        fs::remove_file(path).expect("cleanup");
    }
}
