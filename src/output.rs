//! JSON persistence of a reconciled record set.
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::reconcile::RecordSet;

/// Default file the client writes to.
pub const DEFAULT_OUTPUT: &str = "output.json";

/// Writes `records` as a pretty-printed JSON array ordered by sequence.
pub fn to_writer<W: Write>(writer: W, records: &RecordSet) -> Result<()> {
    let ordered: Vec<_> = records.records().collect();
    serde_json::to_writer_pretty(writer, &ordered)
        .map_err(|e| Error::Encode(format!("serializing records to JSON: {e}")))
}

/// Writes `records` to `path`, creating parent directories as needed.
pub fn write_json(path: &Path, records: &RecordSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(e, format!("creating {}", parent.display())))?;
        }
    }
    let file = File::create(path).map_err(|e| Error::io(e, format!("creating {}", path.display())))?;
    let mut w = BufWriter::new(file);
    to_writer(&mut w, records)?;
    w.flush().map_err(|e| Error::io(e, format!("flushing {}", path.display())))
}
