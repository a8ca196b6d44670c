/// Granularity of the timestamp column stitched into each row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeStampFormat {
    #[default]
    None,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeStampFormat {
    /// Divisor applied to the millisecond clock. Values above 1 yield
    /// centi-units so the formatter can carry two decimal places.
    /// Days shares the Hours divisor and label.
    pub(crate) fn divisor(self) -> u64 {
        match self {
            TimeStampFormat::None => 0,
            TimeStampFormat::Milliseconds => 1,
            TimeStampFormat::Seconds => 10,
            TimeStampFormat::Minutes => 600,
            TimeStampFormat::Hours | TimeStampFormat::Days => 36_000,
        }
    }

    pub(crate) fn unit_label(self) -> Option<&'static str> {
        match self {
            TimeStampFormat::None => None,
            TimeStampFormat::Milliseconds => Some("milliseconds"),
            TimeStampFormat::Seconds => Some("seconds"),
            TimeStampFormat::Minutes => Some("minutes"),
            TimeStampFormat::Hours | TimeStampFormat::Days => Some("hours"),
        }
    }
}

/// Render the clock reading in the requested unit.
///
/// The value is split around one billion before formatting so the decimal
/// string stays exact well past 32 bits of milliseconds; for units coarser
/// than milliseconds the low two digits become the fractional part.
pub(crate) fn format_timestamp(now_ms: u64, format: TimeStampFormat) -> String {
    let divisor = match format.divisor() {
        0 => return String::new(),
        d => d,
    };
    let t = now_ms / divisor;
    let mut billions = t / 1_000_000_000;
    let mut units = t % 1_000_000_000;
    let mut fraction = 0;

    if divisor > 1 {
        fraction = units % 100;
        units /= 100;
        billions /= 100;
    }

    let mut s = String::new();
    if billions > 0 {
        s.push_str(&billions.to_string());
        s.push_str(&format!("{units:09}"));
    } else {
        s.push_str(&units.to_string());
    }
    if divisor > 1 {
        s.push_str(&format!(".{fraction:02}"));
    }
    s
}

struct Column {
    key: String,
    value: String,
}

/// The ordered column schema plus the pending values of the open row.
///
/// Append-only within a session; `dirty` tracks whether the schema grew
/// since the header line was last flushed to flash.
#[derive(Default)]
pub(crate) struct ColumnSet {
    columns: Vec<Column>,
    dirty: bool,
}

impl ColumnSet {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn clear(&mut self) {
        self.columns.clear();
        self.dirty = false;
    }

    /// Rebuild the schema from recovered keys; values start empty and the
    /// header line is already on flash, so the schema is not dirty.
    pub fn rebuild(&mut self, keys: Vec<String>) {
        self.columns = keys
            .into_iter()
            .map(|key| Column {
                key,
                value: String::new(),
            })
            .collect();
        self.dirty = false;
    }

    /// Append a column unless the key already exists.
    pub fn add_heading(&mut self, key: &str, value: &str) {
        if self.columns.iter().any(|c| c.key == key) {
            return;
        }
        self.columns.push(Column {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        self.dirty = true;
    }

    /// Set the pending value of an existing column. Returns false when the
    /// key is unknown.
    pub fn set_value(&mut self, key: &str, value: &str) -> bool {
        match self.columns.iter_mut().find(|c| c.key == key) {
            Some(c) => {
                c.value = value.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn reset_values(&mut self) {
        for c in &mut self.columns {
            c.value.clear();
        }
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// `key1,key2,...,keyN\n`
    pub fn heading_line(&self) -> String {
        let mut line = String::new();
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&c.key);
        }
        line.push('\n');
        line
    }

    /// Pending values joined by commas, or `None` when every value is empty.
    pub fn row_line(&self) -> Option<String> {
        let mut line = String::new();
        let mut empty = true;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&c.value);
            if !c.value.is_empty() {
                empty = false;
            }
        }
        if empty {
            return None;
        }
        line.push('\n');
        Some(line)
    }
}
