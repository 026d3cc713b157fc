use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use mailsched_core::config::MailschedConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependencies that are chatty below `warn`.
const QUIET: &[&str] = &["lettre=warn", "hyper=warn", "hyper_util=warn"];

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `logging.level`, then the profile
/// default. Logs go to stderr and, when `logging.file` is set, are also
/// appended to that file without ANSI colours.
pub fn init(config: &MailschedConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(config)))?;

    let file_layer = match config.logging.file.as_deref() {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn directives(config: &MailschedConfig) -> String {
    let base = config
        .logging
        .level
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| config.default_log_level().to_string());
    std::iter::once(base.as_str())
        .chain(QUIET.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}
