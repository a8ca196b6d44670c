use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::cache::BlockCache;
use crate::clock::Clock;
use crate::flash::{FileConfig, FlashDevice, FlashError};
use crate::layout::RegionLayout;
use crate::meta::{Journal, JournalEntry, MetaData, METADATA_SIZE};
use crate::row::{format_timestamp, ColumnSet};
use crate::sanitize::{clean_buffer, DEFAULT_SENTINEL};
use crate::viewer::VIEWER_HTML;
use crate::writer::{DataWriter, WriteError};

pub use crate::row::TimeStampFormat;

/// Name under which the host sees the log.
pub const LOG_FILE_NAME: &str = "MY_DATA.HTM";

#[derive(Debug, Error)]
pub enum LogError {
    /// A row operation arrived outside an open row transaction.
    #[error("no row transaction in progress")]
    InvalidState,
    /// The data region is exhausted; appends are dropped until `clear`.
    #[error("log storage is full")]
    NoResources,
    /// The grown column headers no longer fit in the metadata page.
    #[error("column headers no longer fit in the metadata page")]
    HeadingSpace,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Flash(#[from] FlashError),
}

impl From<WriteError> for LogError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Full => LogError::NoResources,
            WriteError::Flash(e) => LogError::Flash(e),
        }
    }
}

#[derive(Clone, TypedBuilder)]
pub struct LogConfig {
    /// Pages reserved for the checkpoint journal.
    #[builder(default = 2)]
    pub journal_pages: u32,
    /// Granularity of the block cache and of journal checkpoints.
    #[builder(default = 1024)]
    pub cache_block_size: u32,
    /// Number of blocks the cache holds.
    #[builder(default = 4)]
    pub cache_blocks: usize,
    /// Byte substituted for sequences that would break the host document.
    #[builder(default = DEFAULT_SENTINEL)]
    pub sentinel: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Copy, Default)]
struct Status {
    initialized: bool,
    row_started: bool,
}

/// Append-only key/value logger over a flash device that doubles as a
/// host-visible HTML document.
///
/// Columns are added on first use and historical data is never rewritten;
/// each completed row becomes one CSV line behind the embedded viewer. All
/// mutating entry points funnel through a single mutex.
pub struct DataLog<F: FlashDevice, C: Clock> {
    inner: Mutex<LogInner<F, C>>,
}

struct LogInner<F: FlashDevice, C: Clock> {
    cache: BlockCache<F>,
    clock: C,
    config: LogConfig,
    layout: RegionLayout,
    journal: Journal,
    writer: DataWriter,
    columns: ColumnSet,
    status: Status,
    heading_start: u32,
    heading_length: u32,
    time_stamp_format: TimeStampFormat,
    time_stamp_heading: String,
}

impl<F: FlashDevice, C: Clock> DataLog<F, C> {
    pub fn new(flash: F, clock: C, config: LogConfig) -> Result<Self, LogError> {
        if config.cache_block_size == 0 || flash.page_size() % config.cache_block_size != 0 {
            return Err(LogError::InvalidConfig(
                "cache block size must divide the flash page size",
            ));
        }
        if config.cache_blocks == 0 {
            return Err(LogError::InvalidConfig("cache must hold at least one block"));
        }
        if config.journal_pages == 0 {
            return Err(LogError::InvalidConfig("at least one journal page is required"));
        }
        let page_size = flash.page_size();
        let cache = BlockCache::new(flash, config.cache_block_size, config.cache_blocks);
        Ok(Self {
            inner: Mutex::new(LogInner {
                cache,
                clock,
                config,
                layout: RegionLayout::default(),
                journal: Journal::new(0, 0, page_size),
                writer: DataWriter::new(0, 0),
                columns: ColumnSet::default(),
                status: Status::default(),
                heading_start: 0,
                heading_length: 0,
                time_stamp_format: TimeStampFormat::None,
                time_stamp_heading: String::new(),
            }),
        })
    }

    /// Load an existing log store, or format a new one if none is found.
    pub fn init(&self) -> Result<(), LogError> {
        self.inner.lock().init()
    }

    /// Reformat the store, discarding all data. `full_erase` also erases
    /// every data page rather than just the first.
    pub fn clear(&self, full_erase: bool) -> Result<(), LogError> {
        self.inner.lock().clear(full_erase)
    }

    /// Mark the store invalid so the next `init` reformats it.
    pub fn invalidate(&self) -> Result<(), LogError> {
        self.inner.lock().invalidate()
    }

    /// Whether a valid log store is present on the medium.
    pub fn is_present(&self) -> bool {
        self.inner.lock().is_present().unwrap_or(false)
    }

    /// Whether the data region is exhausted.
    pub fn is_full(&self) -> bool {
        self.inner.lock().writer.is_full()
    }

    /// Choose the timestamp column added to each row, creating the column
    /// when the format is not `None`.
    pub fn set_time_stamp(&self, format: TimeStampFormat) -> Result<(), LogError> {
        self.inner.lock().set_time_stamp(format)
    }

    /// Open a new row, implicitly completing any row already open.
    pub fn begin_row(&self) -> Result<(), LogError> {
        self.inner.lock().begin_row()
    }

    /// Set one key/value pair in the open row, opening a row and adding the
    /// column as needed.
    pub fn log_data(&self, key: &str, value: &str) -> Result<(), LogError> {
        self.inner.lock().log_data(key, value)
    }

    /// Complete the open row and push it to flash.
    pub fn end_row(&self) -> Result<(), LogError> {
        self.inner.lock().end_row()
    }

    /// Append raw text to the log, bypassing row composition.
    pub fn log_string(&self, s: &str) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.init()?;
        inner.log_string(s.as_bytes())
    }

    /// Register a column ahead of time; a no-op when the key exists.
    /// `value` seeds the pending value for the current row.
    pub fn add_heading(&self, key: &str, value: &str) -> Result<(), LogError> {
        self.inner.lock().columns.add_heading(key, value);
        Ok(())
    }

    /// Consume the log and hand back the flash device.
    pub fn into_flash(self) -> F {
        self.inner.into_inner().cache.into_device()
    }
}

impl<F: FlashDevice, C: Clock> LogInner<F, C> {
    fn init(&mut self) -> Result<(), LogError> {
        if self.status.initialized {
            return Ok(());
        }

        if self.is_present()? {
            let page_size = self.cache.device().page_size();
            let journal_pages =
                (self.layout.data_start - self.layout.start_address) / page_size - 1;
            self.journal = Journal::new(self.layout.journal_start, self.layout.data_start, page_size);
            self.writer = DataWriter::new(self.layout.data_start, self.layout.log_end);

            let checkpoint = self.journal.recover(&mut self.cache)?;
            self.writer.set_data_end(checkpoint);

            // The journal is block-coarse; scan forward over bytes written
            // after the last checkpoint until unused flash appears.
            let mut d = [0u8; 1];
            while self.writer.data_end() < self.layout.log_end {
                self.cache.read(self.writer.data_end(), &mut d)?;
                if d[0] == 0xFF {
                    break;
                }
                self.writer.set_data_end(self.writer.data_end() + 1);
            }

            self.recover_headings()?;
            debug!(
                journal_pages,
                data_end = self.writer.data_end(),
                columns = self.columns.len(),
                "recovered existing log store"
            );
            self.status.initialized = true;
            return Ok(());
        }

        // No valid store found; reformat the medium.
        self.clear(false)
    }

    fn is_present(&mut self) -> Result<bool, LogError> {
        if self.status.initialized {
            return Ok(true);
        }

        let device = self.cache.device();
        let page_size = device.page_size();
        let flash_start = device.flash_start();
        let flash_end = device.flash_end();
        let start_address =
            RegionLayout::header_end(flash_start, page_size, VIEWER_HTML.len() as u32);

        // Read the metadata directly; probing a blank device through the
        // cache would just preheat it with useless blocks.
        let mut raw = [0u8; METADATA_SIZE as usize];
        device.read(start_address, &mut raw)?;

        let Some(meta) = MetaData::parse(&raw) else {
            return Ok(false);
        };

        self.layout.start_address = start_address;
        self.layout.journal_start = start_address + page_size;
        self.layout.data_start = meta.data_start;
        self.layout.log_end = meta.log_end;

        Ok(meta.data_start >= start_address + 2 * page_size
            && meta.data_start < meta.log_end
            && meta.log_end < flash_end)
    }

    fn clear(&mut self, full_erase: bool) -> Result<(), LogError> {
        let device = self.cache.device();
        let page_size = device.page_size();
        let flash_start = device.flash_start();
        let flash_end = device.flash_end();

        self.layout = RegionLayout::compute(
            flash_start,
            flash_end,
            page_size,
            VIEWER_HTML.len() as u32,
            self.config.journal_pages,
        );
        self.journal = Journal::new(self.layout.journal_start, self.layout.data_start, page_size);
        self.writer = DataWriter::new(self.layout.data_start, self.layout.log_end);
        self.status = Status::default();
        self.heading_start = 0;
        self.heading_length = 0;
        self.columns.clear();

        // Neutralize any previous full marker with a plain word write; a
        // page erase here would wear the medium on every reformat.
        self.cache.device_mut().write(self.layout.log_end, &[0u8; 4])?;

        self.cache.clear();
        let erase_end = if full_erase {
            self.layout.log_end
        } else {
            self.layout.data_start
        };
        let mut page = flash_start;
        while page <= erase_end {
            self.cache.device_mut().erase(page)?;
            page += page_size;
        }

        // The header is written once and read rarely; keep it out of the cache.
        self.cache.device_mut().write(flash_start, &VIEWER_HTML)?;

        let meta = MetaData {
            log_end: self.layout.log_end,
            data_start: self.layout.data_start,
        };
        self.cache.write(self.layout.start_address, &meta.to_bytes())?;

        // Record that the log is empty.
        self.cache.write(self.journal.head(), &JournalEntry::UNUSED.0)?;

        let device = self.cache.device_mut();
        device.set_configuration(
            FileConfig {
                file_name: LOG_FILE_NAME.to_owned(),
                file_size: flash_end - flash_start - page_size,
                visible: true,
            },
            true,
        )?;
        device.remount();

        self.status.initialized = true;
        debug!(
            data_start = self.layout.data_start,
            log_end = self.layout.log_end,
            full_erase,
            "formatted log store"
        );
        Ok(())
    }

    fn invalidate(&mut self) -> Result<(), LogError> {
        debug!("invalidating log store");
        if self.is_present()? {
            let zeros = [0u8; METADATA_SIZE as usize];
            let device = self.cache.device_mut();
            device.write(self.layout.start_address, &zeros)?;
            device.write(self.layout.log_end, &zeros[..4])?;
        }
        self.status.initialized = false;
        Ok(())
    }

    fn set_time_stamp(&mut self, format: TimeStampFormat) -> Result<(), LogError> {
        self.init()?;
        self.time_stamp_format = format;

        let Some(units) = format.unit_label() else {
            return Ok(());
        };
        self.time_stamp_heading = format!("Time ({units})");
        let heading = self.time_stamp_heading.clone();
        self.columns.add_heading(&heading, "");
        Ok(())
    }

    fn begin_row(&mut self) -> Result<(), LogError> {
        self.init()?;

        // An already-open row is completed first.
        if self.status.row_started {
            let _ = self.end_row();
        }

        self.columns.reset_values();
        self.status.row_started = true;
        Ok(())
    }

    fn log_data(&mut self, key: &str, value: &str) -> Result<(), LogError> {
        self.init()?;

        if !self.status.row_started {
            self.begin_row()?;
        }

        let sentinel = self.config.sentinel;
        let key = match clean_buffer(key.as_bytes(), true, sentinel) {
            Some(c) => String::from_utf8_lossy(&c).into_owned(),
            None => key.to_owned(),
        };
        let value = match clean_buffer(value.as_bytes(), true, sentinel) {
            Some(c) => String::from_utf8_lossy(&c).into_owned(),
            None => value.to_owned(),
        };

        if !self.columns.set_value(&key, &value) {
            self.columns.add_heading(&key, &value);
        }
        Ok(())
    }

    fn end_row(&mut self) -> Result<(), LogError> {
        if !self.status.row_started {
            return Err(LogError::InvalidState);
        }
        self.init()?;

        if self.time_stamp_format != TimeStampFormat::None {
            let stamp = format_timestamp(self.clock.now_ms(), self.time_stamp_format);
            let heading = self.time_stamp_heading.clone();
            self.log_data(&heading, &stamp)?;
        }

        if self.columns.dirty() {
            self.flush_headings()?;
        }

        if let Some(row) = self.columns.row_line() {
            match self.log_string(row.as_bytes()) {
                Err(LogError::NoResources) => {}
                other => other?,
            }
        }

        self.status.row_started = false;
        if self.writer.is_full() {
            return Err(LogError::NoResources);
        }
        Ok(())
    }

    /// Retire the previous header line in place and write the grown one
    /// after it, then replay it into the data region so the CSV stream
    /// carries the schema in line order.
    fn flush_headings(&mut self) -> Result<(), LogError> {
        if self.heading_start == 0 {
            self.heading_start = self.layout.start_address + METADATA_SIZE;
        }

        let line = self.columns.heading_line();
        if self.heading_start + self.heading_length + line.len() as u32 > self.layout.journal_start
        {
            self.status.row_started = false;
            return Err(LogError::HeadingSpace);
        }

        // Old line first: zeroed bytes stay distinguishable from unused
        // flash, so recovery can skip them.
        let zeros = vec![0u8; self.heading_length as usize];
        self.cache.write(self.heading_start, &zeros)?;
        self.heading_start += self.heading_length;
        self.cache.write(self.heading_start, line.as_bytes())?;
        self.heading_length = line.len() as u32;

        match self.log_string(line.as_bytes()) {
            Err(LogError::NoResources) => {}
            other => other?,
        }
        self.columns.mark_clean();
        Ok(())
    }

    fn log_string(&mut self, s: &[u8]) -> Result<(), LogError> {
        let result = match clean_buffer(s, false, self.config.sentinel) {
            Some(cleaned) => self
                .writer
                .append(&mut self.cache, &mut self.journal, &cleaned),
            None => self.writer.append(&mut self.cache, &mut self.journal, s),
        };
        Ok(result?)
    }

    /// Rebuild the column schema from the header lines trailing the
    /// metadata record: skip the zeroed remains of retired lines, then read
    /// keys up to the first unused byte.
    fn recover_headings(&mut self) -> Result<(), LogError> {
        let bound = self.layout.journal_start;
        let mut start = self.layout.start_address + METADATA_SIZE;
        let mut c = [0u8; 1];

        self.cache.read(start, &mut c)?;
        while c[0] == 0x00 && start < bound {
            start += 1;
            self.cache.read(start, &mut c)?;
        }

        let mut end = start;
        while c[0] != 0xFF && end < bound {
            end += 1;
            self.cache.read(end, &mut c)?;
        }

        self.heading_length = end - start;
        self.heading_start = 0;
        self.columns.clear();

        if self.heading_length > 0 {
            self.heading_start = start;
            let mut raw = vec![0u8; self.heading_length as usize];
            self.cache.read(start, &mut raw)?;

            // Each separator terminates one key; an unterminated tail
            // fragment is dropped.
            let mut keys = Vec::new();
            let mut current = Vec::new();
            for b in raw {
                if b == b',' || b == b'\n' {
                    keys.push(String::from_utf8_lossy(&current).into_owned());
                    current.clear();
                } else {
                    current.push(b);
                }
            }
            self.columns.rebuild(keys);
        }
        Ok(())
    }
}
