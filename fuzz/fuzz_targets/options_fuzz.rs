#![no_main]
use gfsvol::modules::options::{parse_option_string, to_mount_args};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(parsed) = parse_option_string(input) {
            let args = to_mount_args(&parsed.options);
            assert_eq!(args.len(), parsed.options.len() * 2);
        }
    }
});
