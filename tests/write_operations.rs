use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use segfs::{FileType, Lfs, LfsConfig, LfsError, LfsVolume, MemoryBlockDevice, BLOCK_SIZE};
use std::sync::Arc;

const SIXTEEN_MIB: usize = 16 * 1024 * 1024;

// Helper function to create a test filesystem
async fn setup_test_fs(size: usize) -> (Arc<MemoryBlockDevice>, Lfs) {
    env_logger::builder().is_test(true).try_init().ok();

    let device = Arc::new(MemoryBlockDevice::new(size));
    let fs = Lfs::format(device.clone(), LfsConfig::default())
        .await
        .expect("Failed to format");
    (device, fs)
}

#[tokio::test]
async fn test_file_create_and_write() {
    let (_, mut fs) = setup_test_fs(SIXTEEN_MIB).await;

    assert!(fs.create_node("/test.txt", FileType::Regular).await.unwrap());
    let content = b"Hello, segfs!";
    assert_eq!(fs.write_data("/test.txt", 0, content).await.unwrap(), content.len() as u64);

    assert_eq!(fs.get_length("/test.txt").await.unwrap(), content.len() as u64);
    assert_eq!(fs.read_data("/test.txt", 0, 1024).await.unwrap(), content);
}

#[tokio::test]
async fn test_file_append() {
    let (_, mut fs) = setup_test_fs(SIXTEEN_MIB).await;
    fs.create_node("/append.txt", FileType::Regular).await.unwrap();

    let mut expected = Vec::new();
    for line in ["first line\n", "second line\n", "third line\n"] {
        let end = fs.get_length("/append.txt").await.unwrap();
        fs.write_data("/append.txt", end, line.as_bytes()).await.unwrap();
        expected.extend_from_slice(line.as_bytes());
    }

    let data = fs.read_data("/append.txt", 0, 1024).await.unwrap();
    assert_eq!(data, expected);
}

#[tokio::test]
async fn test_unaligned_write_across_blocks() {
    let (_, mut fs) = setup_test_fs(SIXTEEN_MIB).await;
    fs.create_node("/span", FileType::Regular).await.unwrap();

    // 3 bytes before a block boundary, 5 after it
    let offset = BLOCK_SIZE as u64 - 3;
    fs.write_data("/span", offset, b"ABCDEFGH").await.unwrap();
    assert_eq!(fs.get_length("/span").await.unwrap(), 8);

    // size does not cover the offset, so the bytes are not readable yet
    assert_eq!(fs.read_data("/span", offset, 8).await.unwrap(), Vec::<u8>::new());

    fs.write_data("/span", 0, &vec![b'.'; BLOCK_SIZE]).await.unwrap();
    assert_eq!(fs.get_length("/span").await.unwrap(), BLOCK_SIZE as u64 + 8);
    let data = fs.read_data("/span", offset, 8).await.unwrap();
    assert_eq!(data, b"...DEFGH");
}

#[tokio::test]
async fn test_large_file_reaches_double_indirect() {
    let (device, mut fs) = setup_test_fs(SIXTEEN_MIB).await;
    let mut rng = StdRng::seed_from_u64(522);

    // 530 blocks: direct, single-indirect and the start of double-indirect
    let mut data = vec![0u8; 530 * BLOCK_SIZE];
    rng.fill(&mut data[..]);

    fs.create_node("/large", FileType::Regular).await.unwrap();
    assert_eq!(fs.write_data("/large", 0, &data).await.unwrap(), data.len() as u64);
    assert_eq!(fs.read_data("/large", 0, data.len() as u64).await.unwrap(), data);

    let tail = 525 * BLOCK_SIZE + 17;
    assert_eq!(fs.read_data("/large", tail as u64, 100).await.unwrap(), &data[tail..tail + 100]);

    fs.unmount().await.unwrap();
    let mut fs = Lfs::mount(device, LfsConfig::default()).await.unwrap().unwrap();
    assert_eq!(fs.read_data("/large", 0, data.len() as u64).await.unwrap(), data);
}

#[tokio::test]
async fn test_overwrite_in_middle() {
    let (_, mut fs) = setup_test_fs(SIXTEEN_MIB).await;
    fs.create_node("/doc", FileType::Regular).await.unwrap();
    fs.write_data("/doc", 0, b"The quick brown fox").await.unwrap();

    fs.write_data("/doc", 4, b"slow!").await.unwrap();
    let data = fs.read_data("/doc", 0, 19).await.unwrap();
    assert_eq!(data, b"The slow! brown fox");
}

#[tokio::test]
async fn test_device_full() {
    // superblock plus three segments
    let (_, mut fs) = setup_test_fs((1 + 3 * 256) * BLOCK_SIZE).await;
    fs.create_node("/fill", FileType::Regular).await.unwrap();

    let data = vec![0x77u8; 4 * 1024 * 1024];
    let result = fs.write_data("/fill", 0, &data).await;
    assert!(matches!(result, Err(LfsError::NoSpace)), "got {:?}", result.map(|_| ()));
}

#[tokio::test]
async fn test_directory_operations() {
    let (_, mut fs) = setup_test_fs(SIXTEEN_MIB).await;

    assert!(fs.create_node("/src", FileType::Directory).await.unwrap());
    assert!(fs.create_node("/src/main.rs", FileType::Regular).await.unwrap());
    assert!(fs.create_node("/src/lib.rs", FileType::Regular).await.unwrap());
    assert!(fs.create_node("/src/bin", FileType::Directory).await.unwrap());

    let children = fs.get_children("/src").await.unwrap();
    assert_eq!(children, vec![".", "..", "main.rs", "lib.rs", "bin"]);
    assert_eq!(fs.get_file_type("/src/bin").await.unwrap(), Some(FileType::Directory));
    assert_eq!(fs.get_length("/src/bin").await.unwrap(), 0);
    assert!(fs.get_children("/src/main.rs").await.unwrap().is_empty());

    assert!(!fs.delete_node("/src").await.unwrap());
    for path in ["/src/main.rs", "/src/lib.rs", "/src/bin", "/src"] {
        assert!(fs.delete_node(path).await.unwrap(), "delete {}", path);
    }
    assert_eq!(fs.get_children("/").await.unwrap(), vec![".", ".."]);
}

#[tokio::test]
async fn test_concurrent_writers() {
    env_logger::builder().is_test(true).try_init().ok();

    let device = Arc::new(MemoryBlockDevice::new(SIXTEEN_MIB));
    let volume = Arc::new(
        LfsVolume::format(device.clone(), LfsConfig::default())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for task in 0..4u8 {
        let volume = volume.clone();
        handles.push(tokio::spawn(async move {
            let dir = format!("/task{}", task);
            volume.create_node(&dir, FileType::Directory).await.unwrap();
            for i in 0..10u8 {
                let path = format!("{}/f{}", dir, i);
                volume.create_node(&path, FileType::Regular).await.unwrap();
                volume.write_data(&path, 0, &[task, i]).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let volume = Arc::try_unwrap(volume).ok().expect("volume still shared");
    volume.unmount().await.unwrap();

    let mut fs = Lfs::mount(device, LfsConfig::default()).await.unwrap().unwrap();
    for task in 0..4u8 {
        let dir = format!("/task{}", task);
        assert_eq!(fs.get_children(&dir).await.unwrap().len(), 12);
        let path = format!("{}/f9", dir);
        assert_eq!(fs.read_data(&path, 0, 2).await.unwrap(), vec![task, 9]);
    }
}
