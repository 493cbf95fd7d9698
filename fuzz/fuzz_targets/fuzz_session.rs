#![no_main]
use libfuzzer_sys::fuzz_target;
use rar_decode::{DecodeSession, DecodeStatus, FormatVersion, MemberInfo};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    // Byte 0: format code, byte 1: split point, bytes 2-3: unpacked size
    let version = match data[0] % 4 {
        0 => FormatVersion::V15,
        1 => FormatVersion::V20,
        2 => FormatVersion::V29,
        _ => FormatVersion::V50,
    };
    let body = &data[4..];
    let split = (data[1] as usize * body.len()) / 256;
    let unpacked_size = u16::from_le_bytes([data[2], data[3]]) as u64;

    let mut session = DecodeSession::new();
    session.pause_handle().pause();
    let mut sink = Vec::<u8>::new();
    for (i, packed) in [&body[..split], &body[split..]].into_iter().enumerate() {
        let info = MemberInfo::new(version, unpacked_size, 0x40000).with_solid(i > 0);
        if session.begin_member(info).is_err() {
            return;
        }
        let mut src = packed;
        loop {
            match session.decode_until_flush_or_pause(&mut src, &mut sink) {
                Ok(DecodeStatus::Paused { .. }) => continue,
                Ok(DecodeStatus::Finished { .. }) | Err(_) => break,
            }
        }
    }
});
