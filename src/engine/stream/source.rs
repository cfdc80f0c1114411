use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

use memmap2::Mmap;
use tracing::info;

use crate::engine::cache::ranges::{DiskRange, FileId};

/// Storage-side collaborator: reads raw byte ranges for a file.
pub trait SourceReader: Send + Sync {
    fn read_ranges(&self, file: FileId, ranges: &[DiskRange]) -> io::Result<Vec<Vec<u8>>>;
}

/// Memory-mapped implementation over registered files.
pub struct MmapSourceReader {
    maps: RwLock<HashMap<FileId, Arc<Mmap>>>,
}

impl MmapSourceReader {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(&self, file: FileId, path: &Path) -> io::Result<()> {
        let handle = File::open(path)?;
        let mmap = unsafe { Mmap::map(&handle)? };
        info!(
            target: "striadb::source",
            file,
            path = %path.display(),
            len = mmap.len(),
            "Source file mapped"
        );
        self.maps.write().unwrap().insert(file, Arc::new(mmap));
        Ok(())
    }

    fn map_for(&self, file: FileId) -> io::Result<Arc<Mmap>> {
        self.maps
            .read()
            .unwrap()
            .get(&file)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("file {file} not registered")))
    }
}

impl Default for MmapSourceReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceReader for MmapSourceReader {
    fn read_ranges(&self, file: FileId, ranges: &[DiskRange]) -> io::Result<Vec<Vec<u8>>> {
        let mmap = self.map_for(file)?;
        let mut out = Vec::with_capacity(ranges.len());
        for range in ranges {
            let end = range.end as usize;
            if end > mmap.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("range [{}, {}) beyond file end {}", range.start, range.end, mmap.len()),
                ));
            }
            out.push(mmap[range.start as usize..end].to_vec());
        }
        Ok(out)
    }
}
