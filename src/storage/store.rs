use std::{
    collections::{hash_map::Entry, HashMap},
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use log::debug;
use parking_lot::Mutex;

use super::{PagePosition, PAGE_SIZE};
use crate::types::SmallResult;

/// Raw page persistence.
///
/// Reading a page that was never written yields zeroes.
pub trait PageStore: Send + Sync {
    fn read_page(&self, pos: &PagePosition, buf: &mut [u8]) -> SmallResult;

    fn write_page(&self, pos: &PagePosition, buf: &[u8]) -> SmallResult;

    /// Number of pages the file currently spans.
    fn page_count(&self, file_id: i32) -> SmallResult<i64>;

    /// Grow the file to `length` pages. Never shrinks.
    fn raise(&self, file_id: i32, length: i64) -> SmallResult;
}

#[derive(Default)]
struct MemoryFile {
    pages: HashMap<i64, Box<[u8]>>,
    length: i64,
}

/// A store keeping every page in memory.
///
/// It counts physical reads, and can be slowed down to widen race
/// windows in tests.
pub struct MemoryStore {
    files: Mutex<HashMap<i32, MemoryFile>>,
    reads: AtomicUsize,
    read_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            read_delay: None,
        }
    }

    pub fn with_read_delay(delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn reads_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryStore {
    fn read_page(&self, pos: &PagePosition, buf: &mut [u8]) -> SmallResult {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }

        let files = self.files.lock();
        match files.get(&pos.file_id).and_then(|f| f.pages.get(&pos.page_number)) {
            Some(data) => buf.copy_from_slice(data),
            None => {
                for b in buf.iter_mut() {
                    *b = 0;
                }
            }
        }
        Ok(())
    }

    fn write_page(&self, pos: &PagePosition, buf: &[u8]) -> SmallResult {
        let mut files = self.files.lock();
        let file = files.entry(pos.file_id).or_insert_with(MemoryFile::default);
        file.pages.insert(pos.page_number, buf.to_vec().into_boxed_slice());
        if pos.page_number >= file.length {
            file.length = pos.page_number + 1;
        }
        Ok(())
    }

    fn page_count(&self, file_id: i32) -> SmallResult<i64> {
        Ok(self.files.lock().get(&file_id).map_or(0, |f| f.length))
    }

    fn raise(&self, file_id: i32, length: i64) -> SmallResult {
        let mut files = self.files.lock();
        let file = files.entry(file_id).or_insert_with(MemoryFile::default);
        if length > file.length {
            file.length = length;
        }
        Ok(())
    }
}

/// One file per file id inside a directory, page `n` at byte offset
/// `n * PAGE_SIZE`.
pub struct FileStore {
    dir: PathBuf,
    files: Mutex<HashMap<i32, File>>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> SmallResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn with_file<T, F>(&self, file_id: i32, action: F) -> SmallResult<T>
    where
        F: FnOnce(&mut File) -> SmallResult<T>,
    {
        let mut files = self.files.lock();
        let file = match files.entry(file_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let path = self.dir.join(format!("{}.page", file_id));
                debug!("open page file {:?}", path);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                e.insert(file)
            }
        };
        action(file)
    }
}

impl PageStore for FileStore {
    fn read_page(&self, pos: &PagePosition, buf: &mut [u8]) -> SmallResult {
        self.with_file(pos.file_id, |file| {
            let start = pos.page_number as u64 * PAGE_SIZE as u64;
            let len = file.metadata()?.len();
            if start + PAGE_SIZE as u64 > len {
                for b in buf.iter_mut() {
                    *b = 0;
                }
                return Ok(());
            }
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(buf)?;
            Ok(())
        })
    }

    fn write_page(&self, pos: &PagePosition, buf: &[u8]) -> SmallResult {
        self.with_file(pos.file_id, |file| {
            let start = pos.page_number as u64 * PAGE_SIZE as u64;
            file.seek(SeekFrom::Start(start))?;
            file.write_all(buf)?;
            file.flush()?;
            Ok(())
        })
    }

    fn page_count(&self, file_id: i32) -> SmallResult<i64> {
        self.with_file(file_id, |file| {
            Ok((file.metadata()?.len() / PAGE_SIZE as u64) as i64)
        })
    }

    fn raise(&self, file_id: i32, length: i64) -> SmallResult {
        self.with_file(file_id, |file| {
            let target = length as u64 * PAGE_SIZE as u64;
            if file.metadata()?.len() < target {
                file.set_len(target)?;
            }
            Ok(())
        })
    }
}
