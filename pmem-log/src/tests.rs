use crate::layout;

#[test]
fn header_round_trip() {
    let buf = layout::encode(0x1f_f000);
    let decoded = layout::decode(&buf).unwrap();
    assert_eq!(decoded.capacity, 0x1f_f000);
    assert_eq!(decoded.write_offset, 0);
}

#[test]
fn header_rejects_bad_magic() {
    let mut buf = layout::encode(4096);
    buf[0] ^= 0xff;
    assert!(layout::decode(&buf).is_err());
}

#[test]
fn header_rejects_checksum_mismatch() {
    let mut buf = layout::encode(4096);
    // Flip a covered field without recomputing the checksum.
    buf[16] ^= 0x01;
    assert!(matches!(
        layout::decode(&buf),
        Err("header checksum mismatch")
    ));
}

#[test]
fn header_rejects_unknown_version() {
    let mut buf = layout::encode(4096);
    buf[8..12].copy_from_slice(&99u32.to_le_bytes());
    assert!(layout::decode(&buf).is_err());
}

#[test]
fn truncated_header_is_rejected() {
    let buf = layout::encode(4096);
    assert!(matches!(layout::decode(&buf[..16]), Err("header truncated")));
}

#[test]
fn validate_checks_offset_and_capacity() {
    let capacity = 4096u64;
    let file_len = capacity + layout::HEADER_LEN as u64;

    let mut decoded = layout::decode(&layout::encode(capacity)).unwrap();
    layout::validate(&decoded, file_len).unwrap();

    decoded.write_offset = capacity;
    layout::validate(&decoded, file_len).unwrap();

    decoded.write_offset = capacity + 1;
    assert!(layout::validate(&decoded, file_len).is_err());

    decoded.write_offset = 0;
    assert!(layout::validate(&decoded, file_len + 1).is_err());
}
