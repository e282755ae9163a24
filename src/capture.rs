//! Durable binary capture of a reconciled run.
//!
//! A capture is a sequence of frames, each laid out as
//! `[len: u32 LE][crc32: u32 LE][payload]`, where the payload is a
//! bincode-encoded [`CaptureFrame`]. The first frame is always a
//! [`CaptureHeader`]; every following frame holds one record in ascending
//! sequence order.
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reconcile::{Gap, RecordSet};
use crate::record::Record;

pub const CAPTURE_VERSION: u16 = 1;
/// Upper bound on a single frame payload; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    /// `host:port` the records were fetched from.
    pub endpoint: String,
    pub max_sequence: Option<i32>,
    /// Runs of sequences that could not be recovered.
    pub unresolved: Vec<Gap>,
}

impl CaptureHeader {
    pub fn new(endpoint: impl Into<String>, records: &RecordSet) -> Self {
        Self {
            version: CAPTURE_VERSION,
            created_unix_ns: now_unix_ns(),
            endpoint: endpoint.into(),
            max_sequence: records.max_sequence(),
            unresolved: records.gaps().collect(),
        }
    }

    /// Replaces the gaps derived from the records with the ones a
    /// reconciliation pass actually left open.
    pub fn with_unresolved(mut self, unresolved: Vec<Gap>) -> Self {
        self.unresolved = unresolved;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaptureFrame {
    Header(CaptureHeader),
    Record(Record),
}

pub fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    hasher.finalize()
}

fn write_frame<W: Write>(w: &mut W, frame: &CaptureFrame) -> Result<()> {
    let payload =
        bincode::serialize(frame).map_err(|e| Error::Encode(format!("bincode encode: {e}")))?;
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())
        .and_then(|()| w.write_all(&crc32(&payload).to_le_bytes()))
        .and_then(|()| w.write_all(&payload))
        .map_err(|e| Error::io(e, "writing capture frame"))
}

/// Reads one frame; `Ok(None)` on a clean end of file.
fn read_frame<R: Read>(r: &mut R, index: usize) -> Result<Option<CaptureFrame>> {
    let mut word = [0u8; 4];
    match r.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::io(e, format!("reading length of frame {index}"))),
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Capture(format!("frame {index} claims {len} bytes")));
    }
    r.read_exact(&mut word)
        .map_err(|e| Error::io(e, format!("reading checksum of frame {index}")))?;
    let crc_on_file = u32::from_le_bytes(word);
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .map_err(|e| Error::io(e, format!("reading payload of frame {index}")))?;
    let crc_calc = crc32(&payload);
    if crc_calc != crc_on_file {
        return Err(Error::Capture(format!(
            "CRC mismatch at frame {index}: file={crc_on_file:#x}, calc={crc_calc:#x}"
        )));
    }
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| Error::Capture(format!("bincode decode of frame {index}: {e}")))
}

pub struct CaptureWriter<W: Write> {
    w: W,
}

impl<W: Write> CaptureWriter<W> {
    /// Starts a capture by writing `header`.
    pub fn new(mut w: W, header: CaptureHeader) -> Result<Self> {
        write_frame(&mut w, &CaptureFrame::Header(header))?;
        Ok(Self { w })
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        write_frame(&mut self.w, &CaptureFrame::Record(record.clone()))
    }

    /// Flushes and returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.w.flush().map_err(|e| Error::io(e, "flushing capture"))?;
        Ok(self.w)
    }
}

/// Iterates the records of a capture after validating its header.
pub struct CaptureReader<R: Read> {
    r: R,
    header: CaptureHeader,
    frames: usize,
}

impl<R: Read> CaptureReader<R> {
    /// # Errors
    /// Returns [`Error::Capture`] if the first frame is missing or not a header.
    pub fn new(mut r: R) -> Result<Self> {
        match read_frame(&mut r, 0)? {
            Some(CaptureFrame::Header(header)) => Ok(Self { r, header, frames: 1 }),
            Some(CaptureFrame::Record(_)) => {
                Err(Error::Capture("capture does not start with a header".to_owned()))
            }
            None => Err(Error::Capture("empty capture".to_owned())),
        }
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.frames;
        self.frames += 1;
        match read_frame(&mut self.r, index) {
            Ok(None) => None,
            Ok(Some(CaptureFrame::Record(record))) => Some(Ok(record)),
            Ok(Some(CaptureFrame::Header(_))) => {
                Some(Err(Error::Capture(format!("unexpected header at frame {index}"))))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Writes `records` to a new capture file at `path`.
pub fn write_capture(path: &Path, header: CaptureHeader, records: &RecordSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(e, format!("creating {}", parent.display())))?;
        }
    }
    let file = File::create(path).map_err(|e| Error::io(e, format!("creating {}", path.display())))?;
    let mut writer = CaptureWriter::new(BufWriter::new(file), header)?;
    for record in records.records() {
        writer.write_record(record)?;
    }
    writer.finish()?;
    Ok(())
}

/// Reads a whole capture file back into a [`RecordSet`].
pub fn read_capture(path: &Path) -> Result<(CaptureHeader, RecordSet)> {
    let file = File::open(path).map_err(|e| Error::io(e, format!("opening {}", path.display())))?;
    let reader = CaptureReader::new(BufReader::new(file))?;
    let header = reader.header().clone();
    let records = reader.collect::<Result<RecordSet>>()?;
    Ok((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordSet {
        [1, 2, 4]
            .into_iter()
            .map(|sequence| Record { symbol: "AMZN".into(), side: 'S', quantity: 3, price: 7, sequence })
            .collect()
    }

    #[test]
    fn header_reports_unresolved_gaps() {
        let header = CaptureHeader::new("127.0.0.1:3000", &sample());
        assert_eq!(header.version, CAPTURE_VERSION);
        assert_eq!(header.max_sequence, Some(4));
        assert_eq!(header.unresolved, vec![Gap::new(3, 3)]);
    }

    #[test]
    fn reconciled_gaps_override_derived_ones() {
        let mut set = sample();
        set.insert(Record { symbol: "AMZN".into(), side: 'S', quantity: 3, price: 7, sequence: 900 });
        let header = CaptureHeader::new("h:1", &set).with_unresolved(vec![Gap::new(3, 3)]);
        assert_eq!(header.max_sequence, Some(900));
        assert_eq!(header.unresolved, vec![Gap::new(3, 3)]);
    }

    #[test]
    fn reads_back_what_was_written() {
        let set = sample();
        let header = CaptureHeader::new("h:1", &set);
        let mut writer = CaptureWriter::new(Vec::new(), header.clone()).unwrap();
        for r in set.records() {
            writer.write_record(r).unwrap();
        }
        let bytes = writer.finish().unwrap();

        let reader = CaptureReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.header(), &header);
        let back = reader.collect::<Result<RecordSet>>().unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut writer = CaptureWriter::new(Vec::new(), CaptureHeader::new("h:1", &sample())).unwrap();
        writer.write_record(sample().get(1).unwrap()).unwrap();
        let mut bytes = writer.finish().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut reader = CaptureReader::new(bytes.as_slice()).unwrap();
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, Error::Capture(msg) if msg.contains("CRC mismatch")));
    }

    #[test]
    fn rejects_capture_without_header() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &CaptureFrame::Record(sample().get(1).unwrap().clone())).unwrap();
        assert!(matches!(CaptureReader::new(bytes.as_slice()), Err(Error::Capture(_))));
        assert!(matches!(CaptureReader::new(&[0u8; 0][..]), Err(Error::Capture(_))));
    }
}
