#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = teaport::tlv::parse_phase2(data);

    let mut cursor = teaport::TlvCursor::new(data);
    while let Some(item) = cursor.next() {
        if item.is_err() {
            break;
        }
    }
});
