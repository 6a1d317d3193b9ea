//! Logging setup shared by the sensor binaries.
//!
//! Sensors log through the `log` facade. Binaries install `env_logger` once at
//! boot; `RUST_LOG` still wins over the level picked here.

use log::LevelFilter;

/// Level used when the configuration asks for debug output.
const DEBUG_LEVEL: LevelFilter = LevelFilter::Debug;

/// Level used otherwise.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Map the `debug` configuration flag to a level filter.
#[must_use]
pub fn level_for(debug: bool) -> LevelFilter {
    if debug {
        DEBUG_LEVEL
    } else {
        DEFAULT_LEVEL
    }
}

/// Install the `env_logger` backend.
///
/// Calling this more than once is harmless; later calls only adjust the
/// maximum level.
pub fn init(debug: bool) {
    let level = level_for(debug);
    let installed = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();

    if installed.is_err() {
        log::set_max_level(level);
    }
}

/// Toggle debug output at runtime after a configuration change.
pub fn apply_debug(debug: bool) {
    log::set_max_level(level_for(debug));
}
