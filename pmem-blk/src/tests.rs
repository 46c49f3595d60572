use crate::layout::{self, STATE_ERROR, STATE_NORMAL, STATE_ZERO};

#[test]
fn entry_packing() {
    let entry = layout::entry_new(0x3fff_ffff, STATE_ERROR);
    assert_eq!(layout::entry_phys(entry), 0x3fff_ffff);
    assert_eq!(layout::entry_state(entry), STATE_ERROR);

    let entry = layout::entry_new(7, STATE_NORMAL);
    assert_eq!(layout::entry_phys(entry), 7);
    assert_eq!(layout::entry_state(entry), STATE_NORMAL);

    let entry = layout::entry_new(0, STATE_ZERO);
    assert_eq!(layout::entry_state(entry), STATE_ZERO);
}

#[test]
fn geometry_charges_overhead_against_the_pool() {
    let pool_size = 2 * 1024 * 1024u64;
    let geo = layout::geometry(pool_size, 512).unwrap();

    assert!(geo.nblock >= 1);
    assert!(geo.nblock < pool_size / 512);
    assert!(geo.nblock * 512 < pool_size);
    assert_eq!(geo.data_off % 4096, 0);
    assert!(geo.data_off >= layout::HEADER_LEN as u64 + 4 * geo.nblock);
    assert!(geo.end() <= pool_size);
}

#[test]
fn geometry_rejects_hopeless_sizes() {
    assert!(layout::geometry(2 * 1024 * 1024, 0).is_none());
    // Header plus map plus the spare block cannot fit.
    assert!(layout::geometry(8192, 8192).is_none());
    assert!(layout::geometry(0, 512).is_none());
}

#[test]
fn geometry_single_block_pool() {
    // Smallest pool holding one 4 KiB block: header page, map page, data
    // for block + spare.
    let geo = layout::geometry(4 * 4096, 4096).unwrap();
    assert_eq!(geo.nblock, 1);
    assert_eq!(geo.nphys(), 2);
}

#[test]
fn header_round_trip() {
    let geo = layout::geometry(2 * 1024 * 1024, 512).unwrap();
    let decoded = layout::decode(&layout::encode(&geo)).unwrap();
    assert_eq!(decoded, geo);
    layout::validate(&decoded, 2 * 1024 * 1024).unwrap();
}

#[test]
fn header_rejects_corruption() {
    let geo = layout::geometry(2 * 1024 * 1024, 512).unwrap();
    let good = layout::encode(&geo);

    let mut bad = good;
    bad[0] ^= 0xff;
    assert!(layout::decode(&bad).is_err());

    let mut bad = good;
    bad[16] ^= 0x01;
    assert!(matches!(layout::decode(&bad), Err("header checksum mismatch")));
}

#[test]
fn validate_rejects_shrunk_file() {
    let geo = layout::geometry(2 * 1024 * 1024, 512).unwrap();
    assert!(layout::validate(&geo, geo.end() - 1).is_err());
    layout::validate(&geo, geo.end()).unwrap();
}
