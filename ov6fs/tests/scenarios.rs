//! End-to-end scenarios a caller should be able to run against a freshly
//! mounted filesystem, each exercising one documented behavior rather than
//! a single algorithmic layer in isolation.

use ov6fs::{FileSystem, MemSectorDevice, Process};

fn mount(sectors: usize) -> FileSystem<MemSectorDevice> {
    FileSystem::mount(MemSectorDevice::new(sectors), sectors, true).unwrap()
}

#[test]
fn s1_big_sequential_io() {
    let fs = mount(8192);
    let proc = Process::at_root();
    const MAGIC: [u8; 8] = 0x3f6598a1u64.to_le_bytes();

    assert!(fs.create(&proc, "/big", 0).unwrap());
    let f = fs.open(&proc, "/big").unwrap().unwrap();

    const TOTAL: usize = 2 * 1024 * 1024;
    let chunk = [MAGIC; 4096].concat();
    let mut written = 0;
    while written < TOTAL {
        written += f.write(&chunk).unwrap();
    }
    assert_eq!(written, TOTAL);
    f.close().unwrap();

    let f = fs.open(&proc, "/big").unwrap().unwrap();
    let mut buf = vec![0u8; TOTAL];
    let mut read = 0;
    while read < TOTAL {
        read += f.read(&mut buf[read..]).unwrap();
    }
    assert_eq!(read, TOTAL);
    for word in buf.chunks_exact(8) {
        assert_eq!(word, MAGIC);
    }
    f.close().unwrap();
}

#[test]
fn s2_two_handles_independent_offsets() {
    let fs = mount(64);
    let proc = Process::at_root();
    assert!(fs.create(&proc, "/word.txt", 0).unwrap());
    let setup = fs.open(&proc, "/word.txt").unwrap().unwrap();
    setup.write(b"word").unwrap();
    setup.close().unwrap();

    let h1 = fs.open(&proc, "/word.txt").unwrap().unwrap();
    let h2 = fs.open(&proc, "/word.txt").unwrap().unwrap();

    let mut buf1 = [0u8; 4];
    assert_eq!(h1.read(&mut buf1).unwrap(), 4);
    assert_eq!(&buf1, b"word");

    let mut buf2 = [0u8; 4];
    assert_eq!(h2.read(&mut buf2).unwrap(), 4);
    assert_eq!(&buf2, b"word");

    assert_eq!(h1.tell(), 4);
    assert_eq!(h2.tell(), 4);

    h1.close().unwrap();
    h2.close().unwrap();
}

#[test]
fn s3_create_remove_recreate() {
    let fs = mount(64);
    let proc = Process::at_root();

    assert!(fs.open(&proc, "/nums.txt").unwrap().is_none());
    assert!(fs.create(&proc, "/nums.txt", 128).unwrap());
    assert!(fs.open(&proc, "/nums.txt").unwrap().is_some());

    let f = fs.open(&proc, "/nums.txt").unwrap().unwrap();
    assert_eq!(f.length().unwrap(), 128);
    f.seek(0);
    assert_eq!(f.write(b"1234 5678 9547\n").unwrap(), 15);
    f.close().unwrap();

    let f = fs.open(&proc, "/nums.txt").unwrap().unwrap();
    let mut buf = [0u8; 15];
    assert_eq!(f.read(&mut buf).unwrap(), 15);
    assert_eq!(&buf, b"1234 5678 9547\n");
    f.close().unwrap();
}

#[test]
fn s4_sparse_read() {
    let fs = mount(64);
    let proc = Process::at_root();
    assert!(fs.create(&proc, "/sparse", 0).unwrap());
    let f = fs.open(&proc, "/sparse").unwrap().unwrap();

    f.seek(1_000_000);
    assert_eq!(f.write(&[0xAA]).unwrap(), 1);

    f.seek(0);
    let mut prefix = [0u8; 8];
    assert_eq!(f.read(&mut prefix).unwrap(), 8);
    assert_eq!(prefix, [0; 8]);

    f.seek(1_000_000);
    let mut byte = [0u8; 1];
    assert_eq!(f.read(&mut byte).unwrap(), 1);
    assert_eq!(byte, [0xAA]);

    assert!(f.length().unwrap() as usize >= 1_000_001);
    f.close().unwrap();
}

#[test]
fn s5_non_empty_directory_refuses_removal() {
    let fs = mount(64);
    let proc = Process::at_root();

    assert!(fs.mkdir(&proc, "/d", 0).unwrap());
    assert!(fs.create(&proc, "/d/f", 0).unwrap());

    assert!(!fs.remove(&proc, "/d").unwrap());
    assert!(fs.remove(&proc, "/d/f").unwrap());
    assert!(fs.remove(&proc, "/d").unwrap());
}

#[test]
fn s6_seek_and_tell() {
    let fs = mount(64);
    let proc = Process::at_root();
    assert!(fs.create(&proc, "/word.txt", 0).unwrap());
    let f = fs.open(&proc, "/word.txt").unwrap().unwrap();
    assert_eq!(f.write(b"abcd_efgh_ijkl_mnop_").unwrap(), 20);

    let expected = [b"abcd", b"efgh", b"ijkl", b"mnop"];
    for (i, word) in expected.iter().enumerate() {
        let pos = i * 5;
        f.seek(pos);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, *word);
        assert_eq!(f.tell(), pos + 4);
    }
    f.close().unwrap();
}
