use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;

use keeldb::storage::disk::DiskManager;
use keeldb::BufferPoolManager;

/// Buffer pool over a scratch database file. The temp file handle must stay
/// alive for the duration of the test.
pub fn create_test_buffer_pool(
    pool_size: usize,
) -> Result<(Arc<BufferPoolManager>, Arc<DiskManager>, NamedTempFile)> {
    init_test_logging();
    let temp_file = NamedTempFile::new()?;
    let disk_manager = Arc::new(DiskManager::new(temp_file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, Arc::clone(&disk_manager)));
    Ok((buffer_pool, disk_manager, temp_file))
}

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
