use emberlog::{Clock, DataLog, LogConfig, LogError, MemFlash, TimeStampFormat, LOG_FILE_NAME};

const FLASH_SIZE: u32 = 128 * 1024;
const PAGE_SIZE: u32 = 4096;
const START_ADDRESS: usize = 4096;
const JOURNAL_START: usize = 8192;
const DATA_START: usize = 16384;
const LOG_END: usize = (FLASH_SIZE - PAGE_SIZE - 4) as usize;

struct FixedClock(u64);

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

fn new_log() -> DataLog<MemFlash, FixedClock> {
    reopen(MemFlash::new(FLASH_SIZE, PAGE_SIZE))
}

fn reopen(flash: MemFlash) -> DataLog<MemFlash, FixedClock> {
    DataLog::new(flash, FixedClock(0), LogConfig::default()).unwrap()
}

/// Data region bytes up to the first unused byte.
fn data_text(flash: &MemFlash) -> String {
    let data = &flash.data()[DATA_START..LOG_END];
    let end = data.iter().position(|&b| b == 0xFF).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec()).unwrap()
}

#[test]
fn cold_start_formats_a_valid_store() {
    let log = new_log();
    log.clear(true).unwrap();
    assert!(log.is_present());
    assert!(!log.is_full());

    let flash = log.into_flash();
    assert_eq!(
        &flash.data()[START_ADDRESS..START_ADDRESS + 17],
        b"UBIT_LOG_FS_V_001"
    );
    assert_eq!(
        &flash.data()[START_ADDRESS + 18..START_ADDRESS + 29],
        format!("0x{:08X}\n", LOG_END).as_bytes()
    );
    assert_eq!(
        &flash.data()[START_ADDRESS + 29..START_ADDRESS + 40],
        format!("0x{:08X}\n", DATA_START).as_bytes()
    );

    let config = flash.config().unwrap();
    assert_eq!(config.file_name, LOG_FILE_NAME);
    assert_eq!(config.file_size, FLASH_SIZE - PAGE_SIZE);
    assert!(config.visible);
    assert_eq!(flash.remounts(), 1);
}

#[test]
fn init_formats_blank_flash() {
    let log = new_log();
    assert!(!log.is_present());
    log.init().unwrap();
    assert!(log.is_present());
    assert_eq!(data_text(&log.into_flash()), "");
}

#[test]
fn single_timestamped_row() {
    let log = new_log();
    log.set_time_stamp(TimeStampFormat::Seconds).unwrap();
    log.begin_row().unwrap();
    log.log_data("x", "42").unwrap();
    log.end_row().unwrap();
    assert_eq!(
        data_text(&log.into_flash()),
        "Time (seconds),x\n0.00,42\n"
    );
}

#[test]
fn schema_growth_replays_headings() {
    let log = new_log();
    log.begin_row().unwrap();
    log.log_data("a", "1").unwrap();
    log.end_row().unwrap();
    log.begin_row().unwrap();
    log.log_data("a", "2").unwrap();
    log.log_data("b", "3").unwrap();
    log.end_row().unwrap();

    let flash = log.into_flash();
    assert_eq!(data_text(&flash), "a\n1\na,b\n2,3\n");

    // The first header line is retired in place with zero bytes and the
    // grown one written right after it.
    let slot = START_ADDRESS + 40;
    assert_eq!(
        &flash.data()[slot..slot + 6],
        &[0x00, 0x00, b'a', b',', b'b', b'\n']
    );
    assert_eq!(flash.data()[slot + 6], 0xFF);
}

#[test]
fn rows_open_and_close_implicitly() {
    let log = new_log();
    log.log_data("a", "1").unwrap();
    // begin_row on an open row completes it first.
    log.begin_row().unwrap();
    log.log_data("a", "2").unwrap();
    log.end_row().unwrap();
    assert_eq!(data_text(&log.into_flash()), "a\n1\n2\n");
}

#[test]
fn end_row_without_open_row_is_invalid_state() {
    let log = new_log();
    assert!(matches!(log.end_row(), Err(LogError::InvalidState)));
}

#[test]
fn all_empty_rows_are_suppressed() {
    let log = new_log();
    log.init().unwrap();
    log.add_heading("a", "").unwrap();
    log.begin_row().unwrap();
    log.end_row().unwrap();
    // The grown schema still flushes its header line; only the value row
    // (all cells empty) is suppressed.
    assert_eq!(data_text(&log.into_flash()), "a\n");
}

#[test]
fn cell_values_are_sanitized() {
    let log = new_log();
    log.log_data("note", "a-->b,c\t").unwrap();
    log.end_row().unwrap();

    let text = data_text(&log.into_flash());
    let s = '\u{1a}';
    assert_eq!(text, format!("note\na{s}{s}{s}b{s}c{s}\n"));
    // One column means the data row carries no separators at all.
    assert_eq!(text.lines().nth(1).unwrap().matches(',').count(), 0);
}

#[test]
fn raw_strings_keep_separators_but_not_comment_terminators() {
    let log = new_log();
    log.log_string("x-->y,z\n").unwrap();
    let s = '\u{1a}';
    assert_eq!(data_text(&log.into_flash()), format!("x{s}{s}{s}y,z\n"));
}

#[test]
fn filling_the_log_sets_full_and_drops_appends() {
    let flash = MemFlash::new(10 * PAGE_SIZE, PAGE_SIZE);
    let log = reopen(flash);
    log.clear(true).unwrap();

    let line = "x".repeat(1000);
    let mut writes = 0;
    loop {
        match log.log_string(&line) {
            Ok(()) => writes += 1,
            Err(LogError::NoResources) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(writes < 100, "log never filled");
    }
    let log_end = (10 * PAGE_SIZE - PAGE_SIZE - 4) as usize;
    let capacity = log_end - DATA_START;
    assert_eq!(writes, capacity / 1000);
    assert!(log.is_full());

    // Further appends are refused without touching the data region.
    assert!(matches!(log.log_string(&line), Err(LogError::NoResources)));

    let flash = log.into_flash();
    assert_eq!(&flash.data()[log_end + 1..log_end + 4], b"FUL");
    let written = flash.data()[DATA_START..log_end]
        .iter()
        .filter(|&&b| b == b'x')
        .count();
    assert_eq!(written, writes * 1000);
}

#[test]
fn reopen_recovers_data_end_and_schema() {
    let log = new_log();
    log.begin_row().unwrap();
    log.log_data("a", "1").unwrap();
    log.end_row().unwrap();

    // Nothing here crossed a cache block, so the journal still holds only
    // its formatted state; recovery must find the end by scanning.
    let log = reopen(log.into_flash());
    log.init().unwrap();
    log.begin_row().unwrap();
    log.log_data("a", "9").unwrap();
    log.end_row().unwrap();

    // The recovered schema already contains "a": no second header line.
    assert_eq!(data_text(&log.into_flash()), "a\n1\n9\n");
}

#[test]
fn recovery_survives_a_dropped_journal_write() {
    let line = "y".repeat(600);

    // Crash after the new journal entry became durable but before the old
    // one was retired.
    let log = new_log();
    log.log_string(&line).unwrap();
    log.log_string(&line).unwrap();
    let mut flash = log.into_flash();
    for b in &mut flash.data_mut()[JOURNAL_START..JOURNAL_START + 8] {
        *b = 0xFF;
    }
    let log = reopen(flash);
    log.init().unwrap();
    log.log_string("Z").unwrap();
    let text = data_text(&log.into_flash());
    assert_eq!(text.len(), 1201);
    assert!(text.ends_with('Z'));

    // Crash before the new journal entry was written at all.
    let log = new_log();
    log.log_string(&line).unwrap();
    log.log_string(&line).unwrap();
    let mut flash = log.into_flash();
    for b in &mut flash.data_mut()[JOURNAL_START..JOURNAL_START + 16] {
        *b = 0xFF;
    }
    let log = reopen(flash);
    log.init().unwrap();
    log.log_string("Z").unwrap();
    let text = data_text(&log.into_flash());
    assert_eq!(text.len(), 1201);
    assert!(text.ends_with('Z'));
}

#[test]
fn invalidate_forces_reformat_on_next_init() {
    let log = new_log();
    log.log_string("hello\n").unwrap();
    log.invalidate().unwrap();
    assert!(!log.is_present());

    let log = reopen(log.into_flash());
    log.init().unwrap();
    assert!(log.is_present());
    assert_eq!(data_text(&log.into_flash()), "");
}

#[test]
fn schema_growth_beyond_the_metadata_page_is_rejected() {
    let log = new_log();
    let mut capped = false;
    for i in 0..40 {
        log.begin_row().unwrap();
        let key = format!("column_{i:03}_{}", "k".repeat(120));
        log.log_data(&key, "1").unwrap();
        match log.end_row() {
            Ok(()) => {}
            Err(LogError::HeadingSpace) => {
                capped = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(capped, "heading growth was never rejected");
}

/// With the device's real geometry (1 KiB pages, 2 KiB header) the on-flash
/// image must line up with the offsets the embedded viewer script hardcodes:
/// metadata at file offset 2048, journal entries from metadata offset 1024,
/// data wherever the metadata's `dataStart` field says.
#[test]
fn device_geometry_matches_viewer_contract() {
    let flash = MemFlash::new(128 * 1024, 1024);
    let log = DataLog::new(flash, FixedClock(0), LogConfig::default()).unwrap();
    log.clear(true).unwrap();
    log.begin_row().unwrap();
    log.log_data("x", "7").unwrap();
    log.end_row().unwrap();

    let flash = log.into_flash();
    let marker = b"<!--FS_START";
    assert_eq!(&flash.data()[2048 - marker.len()..2048], marker);

    // Parse the image the way the viewer script does.
    let meta = &flash.data()[2048..];
    assert_eq!(&meta[..17], b"UBIT_LOG_FS_V_001");
    let parse_hex = |field: &[u8]| {
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
    };
    let log_end = parse_hex(&meta[18..28]).unwrap();
    let data_start = parse_hex(&meta[29..39]).unwrap();
    assert_eq!(log_end, 128 * 1024 - 1024 - 4);
    assert_eq!(data_start, 2048 + 1024 + 2 * 1024);

    // Journal entries sit at metadata offset 1024 and step by 8 until one
    // parses; here none has been checkpointed, so every slot is unused.
    let mut offset = 1024usize;
    let mut checkpoint = None;
    while offset != (data_start - 2048) as usize {
        let entry = &meta[offset..offset + 8];
        if let Some(value) = parse_hex(entry) {
            checkpoint = Some(value);
            break;
        }
        offset += 8;
    }
    assert_eq!(checkpoint, None);

    let data = &flash.data()[data_start as usize..];
    let end = data.iter().position(|&b| b == 0xFF).unwrap();
    assert_eq!(&data[..end], b"x\n7\n");
}

#[test]
fn randomized_rows_replay_in_order() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(42);
    let log = new_log();
    log.init().unwrap();
    for key in ["a", "b", "c"] {
        log.add_heading(key, "").unwrap();
    }

    let mut expected = String::from("a,b,c\n");
    for _ in 0..200 {
        log.begin_row().unwrap();
        let vals: Vec<String> = (0..3).map(|_| rng.gen_range(0..1000).to_string()).collect();
        for (key, value) in ["a", "b", "c"].iter().zip(&vals) {
            log.log_data(key, value).unwrap();
        }
        log.end_row().unwrap();
        expected.push_str(&format!("{},{},{}\n", vals[0], vals[1], vals[2]));
    }

    let flash = log.into_flash();
    assert_eq!(data_text(&flash), expected);

    // Exactly one journal entry is live after a run of successful rows.
    let live = flash.data()[JOURNAL_START..DATA_START]
        .chunks(8)
        .filter(|e| !e.iter().all(|&b| b == 0x00) && !e.iter().all(|&b| b == 0xFF))
        .count();
    assert_eq!(live, 1);

    // And the whole log survives a reopen.
    let log = reopen(flash);
    log.init().unwrap();
    assert_eq!(data_text(&log.into_flash()), expected);
}
