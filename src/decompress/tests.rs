//! Decode scenarios that run whole members through a session.
//!
//! Streams are assembled bit by bit with equal-length codes, so the
//! expected output of every member is known exactly.

use super::*;
use crate::decompress::bit_reader::BitWriter;
use crate::decompress::codes::LENGTH_BITS;
use crate::decompress::huffman::canonical_codes;
use crate::decompress::rar5::put_header;
use crate::decompress::vm::tests::{declaration, xor_program};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Read};

const WINDOW: u64 = 0x40000;

/// Every used symbol gets the same code length.
fn flat_lengths(size: usize, used: &[u16]) -> Vec<u8> {
    let bits = used.len().max(2).next_power_of_two().trailing_zeros() as u8;
    let mut lengths = vec![0u8; size];
    for &s in used {
        lengths[s as usize] = bits;
    }
    lengths
}

struct Codes(Vec<(u32, u32)>);

impl Codes {
    fn new(lengths: &[u8]) -> Self {
        Self(canonical_codes(lengths))
    }

    fn put(&self, w: &mut BitWriter, symbol: u16) {
        let (code, len) = self.0[symbol as usize];
        assert!(len > 0, "symbol {symbol} has no code");
        w.put(code, len);
    }
}

/// Meta table with a five-bit code for every meta symbol, so each length
/// is written as its own value.
fn put_lengths(w: &mut BitWriter, meta_symbols: usize, tables: &[&[u8]]) {
    for _ in 0..meta_symbols {
        w.put(5, 4);
    }
    for table in tables {
        for &len in *table {
            w.put(len as u32, 5);
        }
    }
}

/// RAR 3.x LZ tables plus helpers for the symbols the tests use.
struct Lz29 {
    main_lengths: Vec<u8>,
    dist_lengths: Vec<u8>,
    main: Codes,
    dist: Codes,
}

impl Lz29 {
    fn new(main_used: &[u16], dist_used: &[u16]) -> Self {
        let main_lengths = flat_lengths(299, main_used);
        let dist_lengths = flat_lengths(60, dist_used);
        Self {
            main: Codes::new(&main_lengths),
            dist: Codes::new(&dist_lengths),
            main_lengths,
            dist_lengths,
        }
    }

    fn put_tables(&self, w: &mut BitWriter) {
        // LZ block, fresh tables.
        w.put(0, 2);
        put_lengths(w, 20, &[&self.main_lengths, &self.dist_lengths, &[0; 17], &[0; 28]]);
    }

    fn literals(&self, w: &mut BitWriter, bytes: &[u8]) {
        for &b in bytes {
            self.main.put(w, b as u16);
        }
    }

    /// Match whose distance slot has no extra bits.
    fn long_match(&self, w: &mut BitWriter, length_slot: u16, extra: u32, dist_slot: u16) {
        self.main.put(w, 271 + length_slot);
        w.put(extra, LENGTH_BITS[length_slot as usize] as u32);
        self.dist.put(w, dist_slot);
    }

    /// End of member, tables kept for a solid successor.
    fn end(&self, w: &mut BitWriter) {
        self.main.put(w, 256);
        w.put(0, 2);
    }
}

/// Codes for the "abcabcabcd" members; distance slots 2 and 3 are 3 and 4.
fn abcd29() -> Lz29 {
    Lz29::new(&[b'a' as u16, b'b' as u16, b'c' as u16, b'd' as u16, 256, 274], &[2, 3])
}

fn rar29_sample() -> Vec<u8> {
    let lz = abcd29();
    let mut w = BitWriter::new();
    lz.put_tables(&mut w);
    lz.literals(&mut w, b"abc");
    lz.long_match(&mut w, 3, 0, 2);
    lz.literals(&mut w, b"d");
    lz.end(&mut w);
    w.finish()
}

/// `x` followed by `count` matches of 258 bytes at distance 1.
fn rar29_run(count: usize) -> (Vec<u8>, u64) {
    let lz = Lz29::new(&[b'x' as u16, 256, 298], &[0]);
    let mut w = BitWriter::new();
    lz.put_tables(&mut w);
    lz.literals(&mut w, b"x");
    for _ in 0..count {
        lz.long_match(&mut w, 27, 31, 0);
    }
    lz.end(&mut w);
    (w.finish(), 1 + 258 * count as u64)
}

/// One RAR 5 block carrying its own tables.
fn rar5_block(main_used: &[u16], dist_used: &[u16], last: bool, symbols: impl FnOnce(&mut BitWriter, &Codes, &Codes)) -> Vec<u8> {
    let main_lengths = flat_lengths(306, main_used);
    let dist_lengths = flat_lengths(64, dist_used);
    let mut body = BitWriter::new();
    put_lengths(&mut body, 20, &[&main_lengths, &dist_lengths, &[0; 16], &[0; 44]]);
    symbols(&mut body, &Codes::new(&main_lengths), &Codes::new(&dist_lengths));
    let bits = body.bit_len();
    let payload = body.finish();
    let bit_size = bits - (payload.len() - 1) * 8;

    let mut header = BitWriter::new();
    put_header(&mut header, payload.len(), bit_size as u32, last, true);
    let mut block = header.finish();
    block.extend_from_slice(&payload);
    block
}

/// "abc", a six byte match at distance 3, "d", then a repeat of the
/// match: "abcabcabcdbcdbcd".
fn rar5_sample() -> Vec<u8> {
    let main = [b'a' as u16, b'b' as u16, b'c' as u16, b'd' as u16, 257, 266];
    rar5_block(&main, &[2], true, |w, main, dist| {
        for b in *b"abc" {
            main.put(w, b as u16);
        }
        main.put(w, 266);
        dist.put(w, 2);
        main.put(w, b'd' as u16);
        main.put(w, 257);
    })
}

/// Symbol 257 followed by a declaration for a new slot with an explicit
/// length; the code size goes in the byte after the flags.
fn put_vm_code(lz: &Lz29, w: &mut BitWriter, code: &[u8]) {
    assert!((7..263).contains(&code.len()));
    lz.main.put(w, 257);
    w.put(0x80 | 0x20 | 6, 8);
    w.put(code.len() as u32 - 7, 8);
    for &b in code {
        w.put(b as u32, 8);
    }
}

/// Reader that hands out a few bytes per call.
struct Trickle<'a> {
    data: &'a [u8],
    chunk: usize,
}

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.chunk).min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

#[test]
fn test_rar29_literals_and_matches() {
    let out = decompress(FormatVersion::V29, &rar29_sample(), 10, WINDOW).unwrap();
    assert_eq!(out, b"abcabcabcd");
}

#[test]
fn test_rar29_vm_filter() {
    let lz = Lz29::new(&[b'A' as u16, b'B' as u16, 256, 257], &[]);
    let code = declaration(&xor_program(0x5a), 1, 0, 8);

    let mut w = BitWriter::new();
    lz.put_tables(&mut w);
    put_vm_code(&lz, &mut w, &code);
    lz.literals(&mut w, b"ABABBABA");
    lz.end(&mut w);

    let out = decompress(FormatVersion::V29, &w.finish(), 8, WINDOW).unwrap();
    let expected: Vec<u8> = b"ABABBABA".iter().map(|b| b ^ 0x5a).collect();
    assert_eq!(out, expected);
}

#[test]
fn test_rar29_chained_vm_filters() {
    let lz = Lz29::new(&[b'A' as u16, b'B' as u16, 256, 257], &[]);
    let mut w = BitWriter::new();
    lz.put_tables(&mut w);
    // Two programs over the same eight bytes: the second runs on the
    // first one's output.
    put_vm_code(&lz, &mut w, &declaration(&xor_program(0x5a), 1, 0, 8));
    put_vm_code(&lz, &mut w, &declaration(&xor_program(0x21), 2, 0, 8));
    lz.literals(&mut w, b"AABBABBA");
    lz.end(&mut w);

    let out = decompress(FormatVersion::V29, &w.finish(), 8, WINDOW).unwrap();
    let expected: Vec<u8> = b"AABBABBA".iter().map(|b| b ^ 0x5a ^ 0x21).collect();
    assert_eq!(out, expected);
}

#[test]
fn test_rar29_corrupt_meta_table() {
    let mut w = BitWriter::new();
    w.put(0, 2);
    put_lengths(&mut w, 20, &[]);
    // Repeat-previous as the very first length.
    w.put(16, 5);
    w.put(0, 3);
    let err = decompress(FormatVersion::V29, &w.finish(), 10, WINDOW).unwrap_err();
    assert!(matches!(err, DecompressError::InvalidHuffmanTable));
}

#[test]
fn test_rar29_ppm_block_without_model() {
    // PPMd flag set on the first table read.
    let err = decompress(FormatVersion::V29, &[0x80, 0x00, 0x00], 10, WINDOW).unwrap_err();
    assert!(matches!(err, DecompressError::PpmUnavailable));
}

#[test]
fn test_output_clamped_to_declared_size() {
    let mut session = DecodeSession::new();
    let mut out = Vec::<u8>::new();
    let written = session
        .decode_member(
            MemberInfo::new(FormatVersion::V29, 6, WINDOW),
            &mut &rar29_sample()[..],
            &mut out,
        )
        .unwrap();
    assert_eq!(written, 6);
    assert_eq!(out, b"abcabc");
}

#[test]
fn test_stream_end_before_declared_size() {
    let err = decompress(FormatVersion::V29, &rar29_sample(), 20, WINDOW).unwrap_err();
    assert!(matches!(
        err,
        DecompressError::IncompleteData {
            written: 10,
            expected: 20
        }
    ));
}

#[test]
fn test_truncated_input() {
    let (data, size) = rar29_run(400);
    let err = decompress(FormatVersion::V29, &data[..data.len() / 2], size, WINDOW).unwrap_err();
    match err {
        DecompressError::IncompleteData { written, expected } => {
            assert_eq!(expected, size);
            assert!(written > 0 && written < size);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_solid_member_reaches_back() {
    let lz = abcd29();
    let mut w = BitWriter::new();
    // No tables: the solid member continues with the previous ones.
    lz.long_match(&mut w, 3, 0, 3);
    lz.end(&mut w);
    let second = w.finish();

    let mut session = DecodeSession::new();
    let mut out = Vec::<u8>::new();
    session
        .decode_member(
            MemberInfo::new(FormatVersion::V29, 10, WINDOW),
            &mut &rar29_sample()[..],
            &mut out,
        )
        .unwrap();
    assert_eq!(out, b"abcabcabcd");

    out.clear();
    let info = MemberInfo::new(FormatVersion::V29, 6, WINDOW).with_solid(true);
    session.decode_member(info, &mut &second[..], &mut out).unwrap();
    assert_eq!(out, b"abcdab");
}

#[test]
fn test_solid_flag_ignored_after_format_change() {
    let mut session = DecodeSession::new();
    let mut out = Vec::<u8>::new();
    session
        .decode_member(
            MemberInfo::new(FormatVersion::V50, 16, WINDOW),
            &mut &rar5_sample()[..],
            &mut out,
        )
        .unwrap();

    out.clear();
    let info = MemberInfo::new(FormatVersion::V29, 10, WINDOW).with_solid(true);
    session.decode_member(info, &mut &rar29_sample()[..], &mut out).unwrap();
    assert_eq!(out, b"abcabcabcd");
}

#[test]
fn test_pause_and_resume_match_single_pass() {
    let (data, size) = rar29_run(1200);
    assert!(size > WINDOW);

    let mut session = DecodeSession::new();
    let handle = session.pause_handle();
    handle.pause();
    session
        .begin_member(MemberInfo::new(FormatVersion::V29, size, WINDOW))
        .unwrap();

    let mut src = &data[..];
    let mut out = Vec::<u8>::new();
    let mut pauses = 0;
    loop {
        match session.decode_until_flush_or_pause(&mut src, &mut out).unwrap() {
            DecodeStatus::Paused { written } => {
                pauses += 1;
                assert_eq!(written, out.len() as u64);
                assert_eq!(session.written(), written);
                assert!(session.is_member_active());
            }
            DecodeStatus::Finished { written } => {
                assert_eq!(written, size);
                break;
            }
        }
    }
    assert!(pauses >= 1);
    assert!(!session.is_member_active());
    assert_eq!(out, decompress(FormatVersion::V29, &data, size, WINDOW).unwrap());
    assert!(out.iter().all(|&b| b == b'x'));
}

#[test]
fn test_decode_member_runs_through_pauses() {
    let (data, size) = rar29_run(1200);
    let mut session = DecodeSession::new();
    session.pause_handle().pause();
    let mut out = Vec::<u8>::new();
    let written = session
        .decode_member(MemberInfo::new(FormatVersion::V29, size, WINDOW), &mut &data[..], &mut out)
        .unwrap();
    assert_eq!(written, size);
    assert_eq!(out.len() as u64, size);
}

#[test]
fn test_sharded_window_matches_flat() {
    let (data, size) = rar29_run(2500);
    let info = MemberInfo::new(FormatVersion::V29, size, 0x80000);
    assert!(size > 0x80000);

    let options = DecoderOptions::default()
        .with_contiguous_window_limit(0x40000)
        .with_shard_size(0x10000);
    let mut sharded = DecodeSession::with_options(options);
    let mut sharded_out = Vec::<u8>::new();
    sharded.decode_member(info, &mut &data[..], &mut sharded_out).unwrap();

    let mut flat = DecodeSession::new();
    let mut flat_out = Vec::<u8>::new();
    flat.decode_member(info, &mut &data[..], &mut flat_out).unwrap();

    assert_eq!(sharded_out.len() as u64, size);
    assert_eq!(sharded_out, flat_out);
}

#[test]
fn test_trickled_input_matches_whole() {
    let (data, size) = rar29_run(300);
    let mut session = DecodeSession::new();
    let mut out = Vec::<u8>::new();
    session
        .decode_member(
            MemberInfo::new(FormatVersion::V29, size, WINDOW),
            &mut Trickle { data: &data, chunk: 7 },
            &mut out,
        )
        .unwrap();
    assert_eq!(out, decompress(FormatVersion::V29, &data, size, WINDOW).unwrap());
}

#[test]
fn test_rar5_block_with_repeat() {
    let out = decompress(FormatVersion::V50, &rar5_sample(), 16, WINDOW).unwrap();
    assert_eq!(out, b"abcabcabcdbcdbcd");
}

#[test]
fn test_rar5_delta_filter() {
    let data = rar5_block(&[0xff, 256, b'z' as u16], &[], true, |w, main, _| {
        main.put(w, 256);
        // Start +0, four bytes, delta over one channel.
        w.put(0, 2);
        w.put(0, 8);
        w.put(0, 2);
        w.put(4, 8);
        w.put(0, 3);
        w.put(0, 5);
        for _ in 0..4 {
            main.put(w, 0xff);
        }
        main.put(w, b'z' as u16);
    });
    let out = decompress(FormatVersion::V50, &data, 5, WINDOW).unwrap();
    assert_eq!(out, [1, 2, 3, 4, b'z']);
}

/// Filter declaration: start and length relative to the current output
/// position, then a delta filter over one channel.
fn put_delta_filter(w: &mut BitWriter, main: &Codes, start: u32, length: u32) {
    main.put(w, 256);
    w.put(0, 2);
    w.put(start, 8);
    w.put(0, 2);
    w.put(length, 8);
    w.put(0, 3);
    w.put(0, 5);
}

#[test]
fn test_rar5_filters_with_plain_gap() {
    let main_used = [0xfe, 0xff, 256, b'g' as u16, b'z' as u16];
    let data = rar5_block(&main_used, &[], true, |w, main, _| {
        put_delta_filter(w, main, 0, 3);
        put_delta_filter(w, main, 5, 3);
        for b in [0xff, 0xff, 0xff, b'g', b'g', 0xfe, 0xfe, 0xfe, b'z'] {
            main.put(w, b as u16);
        }
    });
    let out = decompress(FormatVersion::V50, &data, 9, WINDOW).unwrap();
    assert_eq!(out, [1, 2, 3, b'g', b'g', 2, 4, 6, b'z']);
}

#[test]
fn test_rar5_two_blocks() {
    let mut data = rar5_block(&[b'a' as u16, b'b' as u16], &[], false, |w, main, _| {
        main.put(w, b'a' as u16);
        main.put(w, b'b' as u16);
    });
    data.extend(rar5_block(&[b'c' as u16, 262], &[0], true, |w, main, dist| {
        main.put(w, b'c' as u16);
        // Two bytes at distance 1.
        main.put(w, 262);
        dist.put(w, 0);
    }));
    let out = decompress(FormatVersion::V50, &data, 5, WINDOW).unwrap();
    assert_eq!(out, b"abccc");
}

#[test]
fn test_rar5_block_checksum() {
    let mut data = rar5_sample();
    data[1] ^= 0xff;
    let err = decompress(FormatVersion::V50, &data, 16, WINDOW).unwrap_err();
    assert!(matches!(err, DecompressError::BlockChecksum { .. }));
}

#[test]
fn test_rar5_first_block_without_tables() {
    let mut w = BitWriter::new();
    put_header(&mut w, 1, 8, true, false);
    w.put(0, 8);
    let err = decompress(FormatVersion::V50, &w.finish(), 4, WINDOW).unwrap_err();
    assert!(matches!(err, DecompressError::InvalidHuffmanTable));
}

#[test]
fn test_rar20_lz_member() {
    let main = flat_lengths(298, &[b'a' as u16, b'b' as u16, b'c' as u16, b'd' as u16, 273]);
    let dist = flat_lengths(48, &[2]);
    let (main_codes, dist_codes) = (Codes::new(&main), Codes::new(&dist));

    let mut w = BitWriter::new();
    w.put(0, 2);
    put_lengths(&mut w, 19, &[&main, &dist, &[0; 28]]);
    for b in *b"abc" {
        main_codes.put(&mut w, b as u16);
    }
    // Six bytes at distance 3.
    main_codes.put(&mut w, 273);
    dist_codes.put(&mut w, 2);
    main_codes.put(&mut w, b'd' as u16);

    let out = decompress(FormatVersion::V20, &w.finish(), 10, WINDOW).unwrap();
    assert_eq!(out, b"abcabcabcd");
}

#[test]
fn test_rar20_audio_member() {
    let mut lengths = vec![0u8; 257];
    lengths[0] = 1;
    lengths[246] = 1;
    let codes = Codes::new(&lengths);

    let mut w = BitWriter::new();
    // Audio block, fresh tables, one channel.
    w.put(0b10, 2);
    w.put(0, 2);
    put_lengths(&mut w, 19, &[&lengths]);
    codes.put(&mut w, 246);
    for _ in 0..4 {
        codes.put(&mut w, 0);
    }

    let out = decompress(FormatVersion::V20, &w.finish(), 5, WINDOW).unwrap();
    assert_eq!(out, [10; 5]);
}

#[test]
fn test_rar15_chunked_input_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(15);
    let data: Vec<u8> = (0..4096).map(|_| rng.random()).collect();
    let whole = decompress(FormatVersion::V15, &data, 2000, WINDOW);

    let mut session = DecodeSession::new();
    let mut out = Vec::<u8>::new();
    let trickled = session
        .decode_member(
            MemberInfo::new(FormatVersion::V15, 2000, WINDOW),
            &mut Trickle { data: &data, chunk: 3 },
            &mut out,
        )
        .map(|_| out);
    assert_eq!(format!("{whole:?}"), format!("{trickled:?}"));
}

#[test]
fn test_garbage_input_never_panics() {
    let mut rng = StdRng::seed_from_u64(0xbad);
    for version in [FormatVersion::V15, FormatVersion::V20, FormatVersion::V29, FormatVersion::V50] {
        for _ in 0..16 {
            let len = rng.random_range(1..2048);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            if let Ok(out) = decompress(version, &data, 1024, WINDOW) {
                assert_eq!(out.len(), 1024);
            }
        }
    }
}

#[cfg(feature = "async")]
#[tokio::test]
async fn test_async_driver() {
    let data = rar5_sample();
    let mut session = DecodeSession::new();
    session
        .begin_member(MemberInfo::new(FormatVersion::V50, 16, WINDOW))
        .unwrap();
    let mut src = TokioSource::new(&data[..]);
    let mut sink = TokioSink::new(Vec::<u8>::new());
    let status = session
        .decode_until_flush_or_pause_async(&mut src, &mut sink)
        .await
        .unwrap();
    assert_eq!(status, DecodeStatus::Finished { written: 16 });
    assert_eq!(sink.into_inner(), b"abcabcabcdbcdbcd");
}
