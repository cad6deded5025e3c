#![no_main]
use filler_config::{BottleRecord, Settings};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(settings) = Settings::parse(data) {
        // Rendering and reparsing keeps every key.
        let again = Settings::parse(&settings.render()).expect("rendered settings reparse");
        assert_eq!(again.render(), settings.render());
        for i in 0..4 {
            let _ = settings.station_calibration(i);
            let _ = settings.station_enabled(i);
        }
        if let Ok(bottles) = settings.bottles() {
            for b in bottles {
                let (lo, hi) = b.full_range(15.0);
                assert!(lo <= hi, "full range inverted for {}", b.id);
            }
        }
    }
    if let Some((id, value)) = data.split_once('=') {
        let _ = BottleRecord::parse(id, value);
    }
});
