use tracing::debug;

use crate::cache::BlockCache;
use crate::flash::{FlashDevice, FlashError};

/// On-flash format tag, newline included.
pub(crate) const LOG_VERSION: &[u8; 18] = b"UBIT_LOG_FS_V_001\n";
/// Significant bytes of the version tag compared during the presence check.
pub(crate) const VERSION_PROBE_LEN: usize = 17;
/// Total size of the fixed ASCII metadata record.
pub(crate) const METADATA_SIZE: u32 = 40;
/// Width of one journal entry: 8 uppercase hex digits.
pub(crate) const JOURNAL_ENTRY_SIZE: u32 = 8;

/// Parse a hexadecimal ASCII field the way `strtoul(.., 16)` would: an
/// optional `0x` prefix, then the longest run of hex digits. Garbage (such
/// as the `0xFF` fill of unused flash) parses as 0.
pub(crate) fn parse_hex(field: &[u8]) -> u32 {
    let digits = match field {
        [b'0', b'x' | b'X', rest @ ..] => rest,
        _ => field,
    };
    let mut value: u32 = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => break,
        };
        value = value.wrapping_mul(16).wrapping_add(d as u32);
    }
    value
}

/// The fixed 40-byte metadata record at the start of the metadata page.
///
/// Layout (all ASCII): `version[18]`, `logEnd[11]`, `dataStart[11]`, where
/// each address field is `0x` + 8 uppercase nibbles + `\n`. The embedded
/// viewer script hardcodes these offsets, so the order is load-bearing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MetaData {
    pub log_end: u32,
    pub data_start: u32,
}

impl MetaData {
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE as usize] {
        let mut out = [0u8; METADATA_SIZE as usize];
        out[..18].copy_from_slice(LOG_VERSION);
        write_addr(&mut out[18..29], self.log_end);
        write_addr(&mut out[29..40], self.data_start);
        out
    }

    /// `None` when the version probe fails; range validation is the
    /// presence check's job.
    pub fn parse(raw: &[u8; METADATA_SIZE as usize]) -> Option<Self> {
        if raw[..VERSION_PROBE_LEN] != LOG_VERSION[..VERSION_PROBE_LEN] {
            return None;
        }
        Some(Self {
            log_end: parse_hex(&raw[18..28]),
            data_start: parse_hex(&raw[29..39]),
        })
    }
}

fn write_addr(out: &mut [u8], value: u32) {
    out[..2].copy_from_slice(b"0x");
    for i in 0..8 {
        let nibble = (value >> (28 - 4 * i)) & 0xF;
        out[2 + i] = if nibble > 9 {
            b'A' + nibble as u8 - 10
        } else {
            b'0' + nibble as u8
        };
    }
    out[10] = b'\n';
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct JournalEntry(pub [u8; JOURNAL_ENTRY_SIZE as usize]);

impl JournalEntry {
    /// An entry that has never been written: the erased-flash fill.
    pub const UNUSED: JournalEntry = JournalEntry([0xFF; 8]);
    /// An entry retired by overwriting it with zeroes.
    pub const INVALIDATED: JournalEntry = JournalEntry([0x00; 8]);

    /// Encode a checkpoint length as 8 uppercase hex digits.
    pub fn for_length(length: u32) -> Self {
        let mut e = [0u8; 8];
        for (i, b) in e.iter_mut().enumerate() {
            let nibble = (length >> (28 - 4 * i)) & 0xF;
            *b = if nibble > 9 {
                b'A' + nibble as u8 - 10
            } else {
                b'0' + nibble as u8
            };
        }
        JournalEntry(e)
    }

    pub fn contains_only(&self, byte: u8) -> bool {
        self.0.iter().all(|&b| b == byte)
    }

    pub fn length(&self) -> u32 {
        parse_hex(&self.0)
    }
}

/// The rolling journal of data-end checkpoints.
///
/// Entries are appended head-first through the journal pages; the previous
/// head is zeroed only after the new one is durable, so a crash at any point
/// leaves at least one authoritative entry to recover from.
pub(crate) struct Journal {
    start: u32,
    head: u32,
    data_start: u32,
    page_size: u32,
}

impl Journal {
    pub fn new(start: u32, data_start: u32, page_size: u32) -> Self {
        Self {
            start,
            head: start,
            data_start,
            page_size,
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    /// Walk the journal and return the most recent checkpointed data end.
    ///
    /// The walk keeps consuming entries until an unused one follows a valid
    /// one; a later non-zero entry always supersedes an earlier candidate.
    /// An all-`0xFF` entry with no prior candidate parses as length 0, which
    /// makes a freshly formatted log its own checkpoint at `data_start`.
    pub fn recover<F: FlashDevice>(
        &mut self,
        cache: &mut BlockCache<F>,
    ) -> Result<u32, FlashError> {
        self.head = self.start;
        let mut data_end = self.data_start;
        let mut addr = self.start;
        let mut valid = false;
        while addr < self.data_start {
            let mut entry = JournalEntry([0u8; 8]);
            cache.read(addr, &mut entry.0)?;
            if entry.contains_only(0xFF) && valid {
                break;
            }
            if !entry.contains_only(0x00) {
                self.head = addr;
                data_end = self.data_start + entry.length();
                valid = true;
            }
            addr += JOURNAL_ENTRY_SIZE;
        }
        debug!(head = self.head, data_end, "journal walk complete");
        Ok(data_end)
    }

    /// Record a new checkpoint, rounded down to the cache block size.
    ///
    /// The fresh entry must be durable before the previous one is zeroed;
    /// both writes go through the write-through cache in that order.
    pub fn append<F: FlashDevice>(
        &mut self,
        cache: &mut BlockCache<F>,
        data_end: u32,
    ) -> Result<(), FlashError> {
        let old_head = self.head;
        self.head += JOURNAL_ENTRY_SIZE;

        if self.head % self.page_size == 0 {
            if self.head == self.data_start {
                debug!(head = self.start, "journal wrapped");
                self.head = self.start;
            }
            cache.erase(self.head);
            cache.device_mut().erase(self.head)?;
        }

        let block = cache.block_size();
        let length = (data_end - self.data_start) / block * block;
        cache.write(self.head, &JournalEntry::for_length(length).0)?;
        cache.write(old_head, &JournalEntry::INVALIDATED.0)?;
        Ok(())
    }
}
