use tracing::debug;

use crate::cache::BlockCache;
use crate::flash::{FlashDevice, FlashError};
use crate::meta::Journal;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteError {
    /// The data region cannot hold the whole line; the log is now full.
    Full,
    Flash(FlashError),
}

impl From<FlashError> for WriteError {
    fn from(e: FlashError) -> Self {
        WriteError::Flash(e)
    }
}

/// Appends raw bytes into the data region.
///
/// Pages ahead of the cursor are erased eagerly, just before a write would
/// fill or cross into them, so programming never has to touch bytes that
/// were already written. Crossing a cache-block boundary checkpoints the new
/// data end in the journal.
pub(crate) struct DataWriter {
    data_start: u32,
    data_end: u32,
    log_end: u32,
    full: bool,
}

impl DataWriter {
    pub fn new(data_start: u32, log_end: u32) -> Self {
        Self {
            data_start,
            data_end: data_start,
            log_end,
            full: false,
        }
    }

    pub fn data_end(&self) -> u32 {
        self.data_end
    }

    pub fn set_data_end(&mut self, data_end: u32) {
        self.data_end = data_end;
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn append<F: FlashDevice>(
        &mut self,
        cache: &mut BlockCache<F>,
        journal: &mut Journal,
        mut data: &[u8],
    ) -> Result<(), WriteError> {
        let old_end = self.data_end;

        // A line that cannot be written whole marks the log as exhausted.
        if data.len() as u32 > self.log_end - self.data_end {
            if !self.full {
                cache.write(self.log_end + 1, b"FUL")?;
                self.full = true;
                debug!(data_end = self.data_end, "log store is full");
            }
            return Err(WriteError::Full);
        }

        let page_size = cache.device().page_size();
        while !data.is_empty() {
            let space_on_page = page_size - self.data_end % page_size;
            let n = (data.len() as u32).min(space_on_page) as usize;

            // Filling (or overspilling) this page? Ready the next one now.
            if space_on_page <= data.len() as u32 && self.data_end + space_on_page < self.log_end {
                let next_page = (self.data_end / page_size + 1) * page_size;
                cache.device_mut().erase(next_page)?;
            }

            cache.write(self.data_end, &data[..n])?;
            self.data_end += n as u32;
            data = &data[n..];
        }

        let block = cache.block_size();
        if self.data_end / block != old_end / block {
            journal.append(cache, self.data_end)?;
        }
        Ok(())
    }
}
