//! Logging bootstrapper for programs embedding the key manager.

use env_logger::Env;
use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "KEYROOT_LOG_FORMAT";
const LEVEL_ENV: &str = "KEYROOT_LOG_LEVEL";

/// Initialize the global logger.
///
/// The first caller wins; later calls are no-ops. `RUST_LOG` takes
/// precedence, then `KEYROOT_LOG_LEVEL`, then `default_level`. Output is one
/// JSON object per line unless `KEYROOT_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));

    if wants_json(env::var(FORMAT_ENV).ok().as_deref()) {
        builder.format(|buf, record| {
            let payload = json_line(
                &buf.timestamp().to_string(),
                record.level(),
                record.target(),
                &record.args().to_string(),
            );
            writeln!(buf, "{payload}")
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}

fn wants_json(format: Option<&str>) -> bool {
    !matches!(format, Some(value) if value.eq_ignore_ascii_case("plain"))
}

fn json_line(timestamp: &str, level: log::Level, target: &str, message: &str) -> Value {
    json!({
        "timestamp": timestamp,
        "level": level.to_string().to_lowercase(),
        "target": target,
        "message": message,
    })
}
