//! Log initialisation for the manager process.

use colored::ColoredString;
use env_logger::Env;
use std::io::Write;

/// Install the process-wide logger. `RUST_LOG` wins; otherwise `info`,
/// or `debug` when the manager runs with `--debug`. Every line carries a
/// colored process tag so manager and worker output stay tellable apart
/// when interleaved in one terminal.
pub fn init_logging(process: ColoredString, debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {} {} {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                buf.default_styled_level(record.level()),
                process,
                record.args()
            )
        })
        .try_init();
}
