use lazy_static::lazy_static;
use std::{io::Write, time::Instant};

lazy_static! {
    /// Test started timestamp
    static ref START: Instant = Instant::now();
}

/// Initialize logger
pub fn init() {
    lazy_static::initialize(&START);

    env_logger::Builder::new()
        .parse_filters("debug")
        .format(|buf, record| {
            let elapsed = START.elapsed();
            let timestamp = format!("{}.{:06}s", elapsed.as_secs(), elapsed.subsec_micros());
            let level = buf.default_styled_level(record.metadata().level());

            if let Some(module_path) = record
                .module_path()
                .and_then(|module_path| module_path.find("::").map(|p| &module_path[p + 2..]))
            {
                writeln!(
                    buf,
                    "{}: {:<5}: {} {}",
                    timestamp,
                    level,
                    module_path,
                    record.args(),
                )
            } else {
                writeln!(buf, "{}: {:<5}: {}", timestamp, level, record.args())
            }
        })
        .init()
}
