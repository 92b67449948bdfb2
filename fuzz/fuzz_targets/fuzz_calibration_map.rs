#![no_main]
use libfuzzer_sys::fuzz_target;
use senscal_core::CalibrationMap;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Ok(mut map) = CalibrationMap::from_value(&value) {
        // Whatever loads must store back to something that loads again.
        let _ = map.current_group();
        map.fail_interrupted();
        let again = CalibrationMap::from_value(&map.to_value()).expect("stored map reloads");
        assert_eq!(again, map);
    }
});
