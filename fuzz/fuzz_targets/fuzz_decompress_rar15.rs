#![no_main]
use libfuzzer_sys::fuzz_target;
use rar_decode::{decompress, FormatVersion};

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    // First 4 bytes: unpacked_size (capped to 4MB)
    let unpacked_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64 % (4 * 1024 * 1024);

    // Byte 4: window_size_log (18-22)
    let window_size = 1u64 << (18 + data[4] % 5);

    let _ = decompress(FormatVersion::V15, &data[5..], unpacked_size, window_size);
});
