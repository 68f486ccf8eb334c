//! Claude Usage - multi-account Claude quota tracker
//!
//! Tracks several Claude accounts by their web session key, polls each
//! account's usage buckets, and can mirror an account into Claude Code by
//! exchanging its session key for OAuth tokens.

pub mod accounts;
pub mod bridge;
pub mod config;
pub mod debug_settings;
pub mod oauth;
pub mod storage;
pub mod usage;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use accounts::{Account, AccountId, AccountRegistry};
pub use config::AppConfig;

/// Initialize logging: stderr filtered by `RUST_LOG`, plus the debug log
/// file when `CLAUDE_USAGE_DEBUG_LOG` is set
pub fn init_logging() {
    debug_settings::set_file_logging(debug_settings::file_logging_from_env());

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "claude_usage_lib=info".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(debug_settings::file_writer()),
        )
        .with(filter)
        .try_init();
}
