#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = teaport::TeapFrame::parse(data) {
        let mut reassembler = teaport::wire::Reassembler::new();
        let _ = reassembler.push(&frame);
    }
});
