//! # Emberlog: an append-only data log that lives inside a flash-resident HTML file.
//!
//! Emberlog turns the spare internal flash of a small device into a
//! column-oriented CSV logger whose on-flash image is, byte for byte, an HTML
//! document. The same medium is exposed to a host computer as a read-only
//! file; opening it in a browser runs an embedded JavaScript viewer that
//! parses the raw log regions hidden inside an HTML comment and renders the
//! data as a table, with no software to install on either side.
//!
//! The engine is built as a stack of small layers, each one unaware of what
//! sits above it:
//!
//! - **Flash facade** (`flash`): a trait over a NOR-style controller with
//!   page-erase/program semantics and a host-file configuration surface. The
//!   crate ships a RAM-backed simulator with the same semantics so everything
//!   above it can be exercised without hardware.
//!
//! - **Block cache** (`cache`): a write-through cache of a few fixed-size
//!   blocks. The journal and the row writer revisit the same small regions
//!   constantly; caching makes that cheap while write-through keeps every
//!   completed write durable.
//!
//! - **Metadata and journal** (`meta`): a fixed ASCII metadata record that
//!   both the device and the embedded viewer can parse, plus a rolling
//!   journal of data-end checkpoints. A checkpoint is only coarse (cache
//!   block granularity); recovery walks the journal and then scans forward
//!   byte-by-byte, so the exact end of data survives a crash without paying
//!   for a journal write per byte.
//!
//! - **Data writer and row assembler** (`writer`, `row`): the append
//!   protocol with eager page pre-erase, and the row state machine that
//!   turns key/value pairs into CSV lines, growing the column schema on
//!   first use without ever rewriting historical data.
//!
//! - **Lifecycle facade** (`log`): [`DataLog`], the public API. A single
//!   mutex serializes writers; rows open and close implicitly around the
//!   calls the caller actually makes.

pub(crate) mod cache;
pub mod clock;
pub mod flash;
pub(crate) mod layout;
pub mod log;
pub(crate) mod meta;
pub(crate) mod row;
pub(crate) mod sanitize;
pub(crate) mod viewer;
pub(crate) mod writer;

pub use clock::{Clock, SystemClock};
pub use flash::{FileConfig, FlashDevice, FlashError, MemFlash};
pub use log::{DataLog, LogConfig, LogError, TimeStampFormat, LOG_FILE_NAME};
