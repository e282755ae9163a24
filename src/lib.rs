//! ABX exchange client library.
//!
//! This crate provides the pieces used by the `abx_client` binary and the
//! `abx-replay` tool:
//!
//! - `record`: the fixed 17-byte order packet and its big-endian codec
//! - `frame`: splitting an arbitrarily chunked byte stream into packets
//! - `reconcile`: sequence-keyed record set, gap detection and one-at-a-time
//!   recovery through the [`Recover`] trait
//! - `client`: the two-byte request protocol over TCP, stream-all and
//!   resend channels, cancellation
//! - `output` / `capture`: JSON output and a CRC-framed binary capture
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/replay.rs`)
//! drive these modules end to end.
pub mod capture;
pub mod client;
pub mod error;
pub mod frame;
pub mod output;
pub mod reconcile;
pub mod record;

pub use client::{AbxClient, ClientConfig, Connector, Reconciled, ShutdownHandle};
pub use error::{Error, Result};
pub use frame::{FrameDecoder, Frames};
pub use reconcile::{reconcile, Gap, Recover, RecordSet};
pub use record::{Record, Side, RECORD_LEN};
