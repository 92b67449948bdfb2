#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors are fine; parsing and validation must never panic.
    if let Ok(cfg) = senscal_config::load_toml(data) {
        let _ = cfg.validate();
        for sensor in &cfg.simulated.sensors {
            let _ = sensor.sensor_id();
        }
    }
});
