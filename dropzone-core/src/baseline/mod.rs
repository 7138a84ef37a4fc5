//! Baseline correlation.
//!
//! A source file's content yields a timestamp which is recorded as an empty
//! marker file under `<base>/Baseline/`. Pending target files in comparison
//! folders carry a `_#1_` placeholder; when a record matching their
//! timestamp and name fragment appears, the placeholder is replaced by the
//! record's `C<d>W<d+>` tag.

mod correlator;
mod extract;
mod record;

pub use correlator::{BaselineCorrelator, RenameOutcome, rename_with_key};
pub use extract::extract_timestamp;
pub use record::{
    BASELINE_DIR, BaselineRecord, CorrelationKey, PLACEHOLDER, RECORD_EXTENSION,
};
