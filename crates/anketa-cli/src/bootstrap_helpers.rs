use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; `--log-level` replaces the `warn` default otherwise.
pub(crate) fn init_tracing(log_level: Option<&str>) {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    let env_filter = match log_level {
        Some(directive) if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() => {
            builder.parse_lossy(directive)
        }
        _ => builder.from_env_lossy(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
