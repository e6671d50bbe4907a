use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

pub type BookId = i64;

/// Sentinel for an interval that has not been closed yet.
pub const OPEN: u64 = u64::MAX;

/// Half-open validity interval `[from, to)`, in microseconds since the Unix epoch.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Validity {
    pub from: u64,
    pub to: u64, // OPEN for the active version
}

impl Validity {
    pub fn open_at(from: u64) -> Self {
        Self { from, to: OPEN }
    }

    pub fn is_open(&self) -> bool {
        self.to == OPEN
    }

    pub fn contains(&self, ts: u64) -> bool {
        self.from <= ts && ts < self.to
    }

    pub fn closed_at(self, to: u64) -> Self {
        Self { from: self.from, to }
    }

    /// `None` while open, which is how the interval end is rendered to callers.
    pub fn end(&self) -> Option<u64> {
        if self.is_open() { None } else { Some(self.to) }
    }
}

/// Business attributes of a book. Everything the caller is allowed to write.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub struct Book {
    pub title: String,
    pub stock: i64,
}

impl Book {
    pub fn new(title: impl Into<String>, stock: i64) -> Self {
        Self { title: title.into(), stock }
    }
}

/// A row of the current table. Always open.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Record {
    pub id: BookId,
    pub fields: Book,
    pub valid_time: Validity,
}

impl Record {
    pub fn new(id: BookId, fields: Book, ts: u64) -> Self {
        Self {
            id,
            fields,
            valid_time: Validity::open_at(ts),
        }
    }

    /// Copy of this version closed at `ts`, ready for the history table.
    pub fn archive(&self, ts: u64) -> HistoryRecord {
        HistoryRecord {
            id: self.id,
            fields: self.fields.clone(),
            valid_time: self.valid_time.closed_at(ts),
        }
    }
}

/// A superseded version. `valid_time.to` is never OPEN.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct HistoryRecord {
    pub id: BookId,
    pub fields: Book,
    pub valid_time: Validity,
}

/// Wire shape shared by current and history rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    #[serde(rename = "ID")]
    pub id: BookId,
    pub title: String,
    pub stock: i64,
    #[serde(rename = "validFrom")]
    pub valid_from: u64,
    #[serde(rename = "validTo")]
    pub valid_to: Option<u64>,
}

impl From<&Record> for BookView {
    fn from(r: &Record) -> Self {
        Self {
            id: r.id,
            title: r.fields.title.clone(),
            stock: r.fields.stock,
            valid_from: r.valid_time.from,
            valid_to: r.valid_time.end(),
        }
    }
}

impl From<&HistoryRecord> for BookView {
    fn from(r: &HistoryRecord) -> Self {
        Self {
            id: r.id,
            title: r.fields.title.clone(),
            stock: r.fields.stock,
            valid_from: r.valid_time.from,
            valid_to: r.valid_time.end(),
        }
    }
}

/// Result of an as-of lookup: either the live row or an archived one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    Current(Record),
    Archived(HistoryRecord),
}

impl Version {
    pub fn fields(&self) -> &Book {
        match self {
            Version::Current(r) => &r.fields,
            Version::Archived(h) => &h.fields,
        }
    }

    pub fn valid_time(&self) -> Validity {
        match self {
            Version::Current(r) => r.valid_time,
            Version::Archived(h) => h.valid_time,
        }
    }

    pub fn view(&self) -> BookView {
        match self {
            Version::Current(r) => r.into(),
            Version::Archived(h) => h.into(),
        }
    }
}
