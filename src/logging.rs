use env_logger::{Builder, Env};
use std::io::Write;

const DEFAULT_FILTER: &str = "grove=info";

/// Installs the process-wide logger. Honours `RUST_LOG`; calling it more
/// than once is harmless.
pub fn init_logging() {
    let env = Env::default().default_filter_or(DEFAULT_FILTER);
    let result = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialised; keeping existing configuration");
    }
}
