//! Logging bootstrapper shared by the tdx-init binaries.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "TDX_INIT_LOG_FORMAT";
const LEVEL_ENV: &str = "TDX_INIT_LOG_LEVEL";

/// Initialize the global logger.
///
/// The first caller wins; later calls are no-ops. When `RUST_LOG` is unset the
/// level comes from `TDX_INIT_LOG_LEVEL`, then `default_level`. Output is JSON
/// lines unless `TDX_INIT_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let default_level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", &default_level);
    }

    let plain = env::var(FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("plain"))
        .unwrap_or(false);

    let mut builder = env_logger::Builder::from_env(Env::default());
    if plain {
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
    } else {
        builder.format(|buf, record| {
            let payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", payload)
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}
