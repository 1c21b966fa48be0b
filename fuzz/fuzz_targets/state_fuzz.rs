#![no_main]
use gfsvol::Snapshot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut snapshot) = Snapshot::from_json(data) {
        snapshot.prune();
        // A pruned snapshot must survive its own encoding
        if let Ok(bytes) = snapshot.to_json() {
            assert!(Snapshot::from_json(&bytes).is_ok());
        }
    }
});
