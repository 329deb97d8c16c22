use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

use cloudsync_types::CoreResult;

/// An open cache slot. Supports the read/write/seek/truncate/sync
/// operations spec §4.3 requires of `ContentCache::open`.
pub struct CacheHandle {
    file: File,
}

impl CacheHandle {
    pub(crate) fn open_for_write(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub(crate) fn open_read_only(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> CoreResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    pub fn truncate(&mut self, len: u64) -> CoreResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&mut self) -> CoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> CoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}
