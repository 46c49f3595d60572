use pmem_log::{check, check_version, Error, LogPool, MIN_POOL};

const POOL_SIZE: u64 = 2 * 1024 * 1024;
const MODE: u32 = 0o666;

fn new_pool(dir: &tempfile::TempDir) -> (std::path::PathBuf, LogPool) {
    let path = dir.path().join("log.pool");
    let pool = LogPool::create(&path, POOL_SIZE, MODE).unwrap();
    (path, pool)
}

#[test]
fn create_append_tell() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    assert!(pool.nbyte() < POOL_SIZE);
    assert_eq!(pool.tell(), 0);

    pool.append(b"hello").unwrap();
    assert_eq!(pool.tell(), 5);
}

#[test]
fn create_rejects_tiny_pool() {
    let dir = tempfile::tempdir().unwrap();
    let err = LogPool::create(dir.path().join("tiny.pool"), MIN_POOL - 1, MODE).unwrap_err();
    assert!(matches!(err, Error::Create(_)));
}

#[test]
fn create_rejects_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (path, pool) = new_pool(&dir);
    pool.close().unwrap();
    assert!(matches!(
        LogPool::create(&path, POOL_SIZE, MODE),
        Err(Error::Create(_))
    ));
}

#[test]
fn out_of_space_leaves_offset_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);
    let capacity = pool.nbyte();

    let chunk = vec![0x5au8; 64 * 1024];
    let mut total = 0u64;
    let failure = loop {
        match pool.append(&chunk) {
            Ok(()) => total += chunk.len() as u64,
            Err(err) => break err,
        }
        assert_eq!(pool.tell(), total);
    };

    assert!(matches!(failure, Error::OutOfSpace { .. }));
    assert_eq!(pool.tell(), total);
    assert!(capacity - total < chunk.len() as u64);

    // The remaining tail can still be filled exactly to capacity.
    let tail = vec![1u8; (capacity - total) as usize];
    pool.append(&tail).unwrap();
    assert_eq!(pool.tell(), capacity);
    assert!(matches!(
        pool.append(&[0]),
        Err(Error::OutOfSpace {
            requested: 1,
            remaining: 0
        })
    ));
}

#[test]
fn empty_append_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);
    pool.append(&[]).unwrap();
    assert_eq!(pool.tell(), 0);
}

#[test]
fn rewind_resets_write_point() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    pool.append(b"first").unwrap();
    pool.rewind().unwrap();
    assert_eq!(pool.tell(), 0);

    // The next append starts at the beginning of the log again.
    pool.append(b"second").unwrap();
    assert_eq!(pool.tell(), 6);
    let mut seen = Vec::new();
    pool.walk(0, |chunk| {
        seen.extend_from_slice(chunk);
        true
    });
    assert_eq!(seen, b"second");
}

#[test]
fn walk_visits_chunks_in_write_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    pool.append(b"aaaa").unwrap();
    pool.append(b"bbbb").unwrap();
    pool.append(b"cccc").unwrap();

    let mut chunks = Vec::new();
    pool.walk(4, |chunk| {
        chunks.push(chunk.to_vec());
        true
    });
    assert_eq!(chunks, vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()]);
}

#[test]
fn walk_stops_when_callback_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    pool.append(b"aaaabbbbcccc").unwrap();

    let mut visits = 0;
    pool.walk(4, |chunk| {
        assert_eq!(chunk, b"aaaa");
        visits += 1;
        false
    });
    assert_eq!(visits, 1);
}

#[test]
fn walk_zero_chunk_size_is_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    pool.append(b"abc").unwrap();
    pool.append(b"def").unwrap();

    let chunks: Vec<_> = pool.chunks(0).collect();
    assert_eq!(chunks, vec![b"abcdef".as_slice()]);
}

#[test]
fn walk_includes_trailing_partial_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, mut pool) = new_pool(&dir);

    pool.append(b"aaaabb").unwrap();
    let chunks: Vec<_> = pool.chunks(4).collect();
    assert_eq!(chunks, vec![b"aaaa".as_slice(), b"bb".as_slice()]);
}

#[test]
fn empty_log_walks_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, pool) = new_pool(&dir);
    pool.walk(0, |_| panic!("callback on empty log"));
    assert_eq!(pool.chunks(16).count(), 0);
}

#[test]
fn log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut pool) = new_pool(&dir);

    pool.append(b"write ahead").unwrap();
    let capacity = pool.nbyte();
    pool.close().unwrap();

    let pool = LogPool::open(&path).unwrap();
    assert_eq!(pool.nbyte(), capacity);
    assert_eq!(pool.tell(), 11);

    let mut replayed = Vec::new();
    pool.walk(0, |chunk| {
        replayed.extend_from_slice(chunk);
        true
    });
    assert_eq!(replayed, b"write ahead");
}

#[test]
fn open_missing_pool_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        LogPool::open(dir.path().join("nope.pool")),
        Err(Error::Open(_))
    ));
}

#[test]
fn open_rejects_foreign_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.pool");
    std::fs::write(&path, vec![0x42u8; 8192]).unwrap();
    assert!(matches!(LogPool::open(&path), Err(Error::Format(_))));
}

#[test]
fn check_probes_consistency() {
    let dir = tempfile::tempdir().unwrap();
    let (path, mut pool) = new_pool(&dir);
    pool.append(b"consistent").unwrap();
    pool.close().unwrap();

    assert!(check(&path));

    let garbage = dir.path().join("garbage.pool");
    std::fs::write(&garbage, vec![0u8; 8192]).unwrap();
    assert!(!check(&garbage));
    assert!(!check(dir.path().join("missing.pool")));
}

#[test]
fn version_gate() {
    check_version(pmem_log::VERSION_MAJOR, pmem_log::VERSION_MINOR).unwrap();
    assert!(matches!(check_version(1000, 0), Err(Error::Version(_))));
}
