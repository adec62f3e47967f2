use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Characters kept at each end of a masked idempotency key.
const KEY_VISIBLE_CHARS: usize = 4;

/// Configuration for logging.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_file: bool,
    pub include_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_file: false,
            include_line: false,
        }
    }
}

impl LogConfig {
    /// Builds a config from the `[application]` settings.
    pub fn from_settings(level: &str, format: &str) -> Self {
        Self {
            level: level.to_string(),
            format: LogFormat::from(format),
            ..Self::default()
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `config.level`.
/// A second call leaves the first subscriber in place.
pub fn init_logging(config: &LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let fmt_layer = fmt::layer()
        .with_target(config.include_target)
        .with_file(config.include_file)
        .with_line_number(config.include_line);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt_layer.json().with_span_events(FmtSpan::CLOSE).boxed(),
        LogFormat::Compact => fmt_layer.compact().boxed(),
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
    };

    match tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
    {
        Ok(()) => tracing::info!(level = %config.level, format = ?config.format, "Logging initialized"),
        Err(e) => tracing::warn!("Logging already initialized: {}", e),
    }
}

/// Masks all but `visible_chars` characters at each end.
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        return "*".repeat(chars.len());
    }

    let prefix: String = chars[..visible_chars].iter().collect();
    let suffix: String = chars[chars.len() - visible_chars..].iter().collect();
    let masked_len = chars.len() - (visible_chars * 2);

    format!("{}{}{}", prefix, "*".repeat(masked_len), suffix)
}

/// Idempotency keys as they appear in log fields.
pub fn mask_key(key: &str) -> String {
    mask_sensitive(key, KEY_VISIBLE_CHARS)
}
