#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors and validation errors are both fine; panics are not.
    if let Ok(cfg) = filler_config::load_toml(data) {
        if cfg.validate().is_ok() {
            assert!(!cfg.station_serials().is_empty());
        }
    }
});
