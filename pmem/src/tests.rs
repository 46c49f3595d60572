use crate::{check_version, has_hw_drain, hw, Error, MapFlags};

#[test]
fn flag_algebra() {
    let flags = MapFlags::CREATE | MapFlags::EXCLUSIVE;
    assert!(flags.contains(MapFlags::CREATE));
    assert!(flags.contains(MapFlags::EXCLUSIVE));
    assert!(!flags.contains(MapFlags::SPARSE));
    assert!(!flags.contains(MapFlags::CREATE | MapFlags::SPARSE));
    assert!(MapFlags::empty().is_empty());
    assert!(!flags.is_empty());

    let mut flags = MapFlags::CREATE;
    flags |= MapFlags::SPARSE;
    assert!(flags.contains(MapFlags::SPARSE));
}

#[test]
fn page_alignment() {
    assert_eq!(hw::page_align_up(1), 4096);
    assert_eq!(hw::page_align_up(4096), 4096);
    assert_eq!(hw::page_align_up(4097), 8192);
}

#[test]
fn flush_and_drain_on_ordinary_memory() {
    // The flush primitives must accept any valid address and never fail.
    let buf = vec![0xa5u8; 4096];
    hw::flush(buf.as_ptr(), buf.len());
    hw::drain();
    hw::flush(buf.as_ptr(), 0);
}

#[test]
fn hw_drain_is_a_stable_answer() {
    assert_eq!(has_hw_drain(), has_hw_drain());
}

#[test]
fn version_gate() {
    check_version(crate::VERSION_MAJOR, crate::VERSION_MINOR).unwrap();
    check_version(crate::VERSION_MAJOR, 0).unwrap();

    let err = check_version(1000, 0).unwrap_err();
    assert!(matches!(err, Error::Version(_)));
    assert!(err.to_string().contains("major version"));

    let err = check_version(crate::VERSION_MAJOR, 1000).unwrap_err();
    assert!(matches!(err, Error::Version(_)));
}
