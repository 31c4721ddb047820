//! Streaming tar decoder
//!
//! [`Extract`] accepts chunks of any size and boundary, buffers them in a
//! [`ByteQueue`] and hands every completed entry to an [`EntrySink`]. GNU
//! long-name/long-link records and PAX extended headers are folded into the
//! header that follows them.
//!
//! # Usage
//!
//! ```rust
//! use tar_stream::{Extract, Pack, PackOptions, TarEntry};
//!
//! let mut pack = Pack::new();
//! pack.add(&b"hi"[..], PackOptions::new("a.txt")).unwrap();
//! pack.done();
//! let archive = pack.take_output();
//!
//! let mut extract = Extract::default();
//! let mut entries: Vec<TarEntry> = Vec::new();
//! for chunk in archive.chunks(100) {
//!     extract.write(chunk.to_vec(), &mut entries).unwrap();
//! }
//! extract.end(&mut entries).unwrap();
//!
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].header.name, "a.txt");
//! assert_eq!(entries[0].data, b"hi");
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{TarError, TarResult};
use crate::header::{BLOCK_SIZE, DecodeOptions, TarHeader, TypeFlag, decode, padding_for, read_str};
use crate::pax::{LINKPATH_KEY, PATH_KEY, decode_pax};
use crate::queue::ByteQueue;

/// Largest extension payload (PAX or GNU long name) accepted
pub const MAX_EXTENSION_SIZE: u64 = 1 << 20;

/// Largest up-front allocation for an entry body
const MAX_PREALLOC: u64 = 1 << 20;

/// Tar entry struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub header: TarHeader,
    pub data: Vec<u8>,
}

/// Receiver of the events produced by [`Extract`]
pub trait EntrySink {
    /// A complete entry, in archive order
    fn on_entry(&mut self, header: TarHeader, data: Vec<u8>);

    /// A fatal decode error; no further events follow
    fn on_error(&mut self, _error: &TarError) {}

    /// All input consumed
    fn on_close(&mut self) {}
}

impl EntrySink for Vec<TarEntry> {
    fn on_entry(&mut self, header: TarHeader, data: Vec<u8>) {
        self.push(TarEntry { header, data });
    }
}

/// Decoder state
#[derive(Debug)]
enum State {
    AwaitingHeader,
    ReadingBody {
        header: TarHeader,
        missing: u64,
        data: Vec<u8>,
    },
    HandlingExtension {
        typeflag: TypeFlag,
        size: u64,
        missing: u64,
        data: Vec<u8>,
    },
    Padding {
        missing: usize,
    },
    Closed,
    Errored,
}

impl State {
    /// State after `size` bytes of content: padding if any, else next header
    fn after_content(size: u64) -> Self {
        match padding_for(size) {
            0 => Self::AwaitingHeader,
            missing => Self::Padding { missing },
        }
    }
}

/// GNU and PAX overrides waiting for the next standard header
#[derive(Debug, Default)]
struct PendingExtension {
    long_name: Option<String>,
    long_link: Option<String>,
    pax: Option<BTreeMap<String, String>>,
}

impl PendingExtension {
    fn is_empty(&self) -> bool {
        self.long_name.is_none() && self.long_link.is_none() && self.pax.is_none()
    }

    /// Fold the overrides into `header`. GNU names go first, then global PAX
    /// attributes, then the per-entry PAX attributes.
    fn apply(self, mut header: TarHeader, global: &BTreeMap<String, String>) -> TarHeader {
        if let Some(name) = self.long_name {
            header.name = name;
        }
        if let Some(linkname) = self.long_link {
            header.linkname = linkname;
        }
        if global.is_empty() && self.pax.is_none() {
            return header;
        }
        let mut attrs = global.clone();
        attrs.extend(self.pax.unwrap_or_default());
        for (key, value) in &attrs {
            apply_pax_field(&mut header, key, value);
        }
        header.pax = attrs;
        header
    }
}

fn apply_pax_field(header: &mut TarHeader, key: &str, value: &str) {
    match key {
        PATH_KEY => header.name = value.to_string(),
        LINKPATH_KEY => header.linkname = value.to_string(),
        "uname" => header.uname = value.to_string(),
        "gname" => header.gname = value.to_string(),
        "size" => set_parsed(&mut header.size, value),
        "uid" => set_parsed(&mut header.uid, value),
        "gid" => set_parsed(&mut header.gid, value),
        // fractional seconds are dropped
        "mtime" => set_parsed(&mut header.mtime, value.split('.').next().unwrap_or(value)),
        _ => {}
    }
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, value: &str) {
    match value.parse() {
        Ok(parsed) => *field = parsed,
        Err(_) => warn!("ignoring unparsable PAX value {value:?}"),
    }
}

/// Streaming tar decoder
#[derive(Debug)]
pub struct Extract {
    options: DecodeOptions,
    queue: ByteQueue,
    state: State,
    pending: PendingExtension,
    global: BTreeMap<String, String>,
    consumed: u64,
    zero_blocks: u32,
    terminated: bool,
}

impl Default for Extract {
    fn default() -> Self {
        Self::new(DecodeOptions::default())
    }
}

impl Extract {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            queue: ByteQueue::new(),
            state: State::AwaitingHeader,
            pending: PendingExtension::default(),
            global: BTreeMap::new(),
            consumed: 0,
            zero_blocks: 0,
            terminated: false,
        }
    }

    /// Bytes of archive consumed so far
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes received but not yet consumed
    pub fn bytes_buffered(&self) -> usize {
        self.queue.len()
    }

    /// True once two consecutive zero blocks were seen
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True after `end` or a fatal error
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed | State::Errored)
    }

    /// Feed the next chunk of the archive. Every entry completed by this
    /// chunk is passed to `sink` before returning.
    pub fn write<S>(&mut self, chunk: impl Into<Bytes>, sink: &mut S) -> TarResult<()>
    where
        S: EntrySink + ?Sized,
    {
        if self.is_closed() {
            return Err(TarError::Closed);
        }
        self.queue.push(chunk);
        trace!(
            "{} bytes buffered in {} chunks",
            self.queue.len(),
            self.queue.chunk_count()
        );
        let result = self.drive(sink);
        self.check(result, sink)
    }

    /// Signal the end of input. Fails with [`TarError::Truncated`] when the
    /// input stopped inside an entry.
    pub fn end<S>(&mut self, sink: &mut S) -> TarResult<()>
    where
        S: EntrySink + ?Sized,
    {
        if self.is_closed() {
            return Err(TarError::Closed);
        }
        let result = self.finish();
        self.check(result, sink)?;
        self.state = State::Closed;
        sink.on_close();
        Ok(())
    }

    fn check<S>(&mut self, result: TarResult<()>, sink: &mut S) -> TarResult<()>
    where
        S: EntrySink + ?Sized,
    {
        if let Err(err) = &result {
            warn!("tar extract failed at offset {}: {err}", self.consumed);
            sink.on_error(err);
            self.state = State::Errored;
        }
        result
    }

    fn finish(&mut self) -> TarResult<()> {
        let unconsumed = self.queue.inserted_len() - self.consumed;
        debug_assert_eq!(unconsumed, self.queue.len() as u64);
        let missing = match &self.state {
            State::ReadingBody { missing, .. } | State::HandlingExtension { missing, .. } => *missing,
            State::AwaitingHeader if unconsumed > 0 => {
                let leftover = self.queue.peek(self.queue.len())?;
                if leftover.iter().any(|&b| b != 0) {
                    BLOCK_SIZE as u64 - unconsumed
                } else {
                    0
                }
            }
            State::Padding { missing } => {
                debug!("input ended inside {missing} bytes of padding");
                0
            }
            _ => 0,
        };
        if missing > 0 {
            return Err(TarError::Truncated {
                offset: self.consumed,
                missing,
            });
        }
        if !self.pending.is_empty() {
            warn!("input ended with an extension header but no entry for it");
        }
        if !self.terminated {
            warn!("input ended at offset {} without end-of-archive marker", self.consumed);
        }
        Ok(())
    }

    /// Run the state machine until it needs more input
    fn drive<S>(&mut self, sink: &mut S) -> TarResult<()>
    where
        S: EntrySink + ?Sized,
    {
        loop {
            let state = std::mem::replace(&mut self.state, State::AwaitingHeader);
            self.state = match state {
                State::AwaitingHeader => {
                    if self.queue.len() < BLOCK_SIZE {
                        return Ok(());
                    }
                    self.read_header()?
                }
                State::ReadingBody {
                    header,
                    missing,
                    mut data,
                } => {
                    let missing = self.take_content(missing, &mut data)?;
                    if missing > 0 {
                        self.state = State::ReadingBody { header, missing, data };
                        return Ok(());
                    }
                    trace!("entry {:?} complete ({} bytes)", header.name, header.size);
                    let next = State::after_content(header.size);
                    sink.on_entry(header, data);
                    next
                }
                State::HandlingExtension {
                    typeflag,
                    size,
                    missing,
                    mut data,
                } => {
                    let missing = self.take_content(missing, &mut data)?;
                    if missing > 0 {
                        self.state = State::HandlingExtension {
                            typeflag,
                            size,
                            missing,
                            data,
                        };
                        return Ok(());
                    }
                    self.merge_extension(typeflag, &data)?;
                    State::after_content(size)
                }
                State::Padding { missing } => {
                    let take = missing.min(self.queue.len());
                    self.queue.skip(take)?;
                    self.consumed += take as u64;
                    if take < missing {
                        self.state = State::Padding {
                            missing: missing - take,
                        };
                        return Ok(());
                    }
                    State::AwaitingHeader
                }
                terminal @ (State::Closed | State::Errored) => {
                    self.state = terminal;
                    return Ok(());
                }
            };
        }
    }

    /// Move up to `missing` buffered bytes into `data`, returning what is
    /// still missing
    fn take_content(&mut self, missing: u64, data: &mut Vec<u8>) -> TarResult<u64> {
        let take = missing.min(self.queue.len() as u64);
        self.queue.shift_into(take as usize, data)?;
        self.consumed += take;
        Ok(missing - take)
    }

    /// Decode the next block. Caller guarantees a full block is buffered.
    fn read_header(&mut self) -> TarResult<State> {
        let block = self.queue.shift(BLOCK_SIZE)?;
        let offset = self.consumed;
        self.consumed += BLOCK_SIZE as u64;
        let header = match decode(&block, &self.options) {
            Ok(header) => header,
            // terminator or stray padding block
            Err(TarError::NotAHeader) => {
                self.note_zero_block();
                return Ok(State::AwaitingHeader);
            }
            Err(err) => return Err(err),
        };
        self.zero_blocks = 0;

        if header.typeflag.is_extension() {
            debug!(
                "{:?} extension header at offset {offset} ({} bytes)",
                header.typeflag, header.size
            );
            if header.size > MAX_EXTENSION_SIZE {
                return Err(TarError::InvalidPaxRecord(format!(
                    "extension header of {} bytes exceeds {MAX_EXTENSION_SIZE}",
                    header.size
                )));
            }
            return Ok(State::HandlingExtension {
                typeflag: header.typeflag,
                size: header.size,
                missing: header.size,
                data: Vec::with_capacity(header.size as usize),
            });
        }

        let pending = std::mem::take(&mut self.pending);
        let header = pending.apply(header, &self.global);
        trace!("header {:?} at offset {offset} ({} bytes)", header.name, header.size);
        Ok(State::ReadingBody {
            missing: header.size,
            data: Vec::with_capacity(header.size.min(MAX_PREALLOC) as usize),
            header,
        })
    }

    fn note_zero_block(&mut self) {
        self.zero_blocks += 1;
        if self.zero_blocks == 2 && !self.terminated {
            debug!("end-of-archive marker at offset {}", self.consumed);
            self.terminated = true;
        } else if self.zero_blocks == 1 {
            trace!("zero block at offset {}", self.consumed - BLOCK_SIZE as u64);
        }
    }

    fn merge_extension(&mut self, typeflag: TypeFlag, data: &[u8]) -> TarResult<()> {
        match typeflag {
            TypeFlag::PaxExtended => {
                let attrs = decode_pax(data)?;
                self.pending.pax.get_or_insert_with(BTreeMap::new).extend(attrs);
            }
            TypeFlag::PaxGlobal => {
                let attrs = decode_pax(data)?;
                self.global.extend(attrs);
            }
            TypeFlag::GnuLongName => {
                self.pending.long_name = Some(read_str(data, self.options.filename_encoding));
            }
            TypeFlag::GnuLongLink => {
                self.pending.long_link = Some(read_str(data, self.options.filename_encoding));
            }
            other => warn!("ignoring {other:?} extension payload"),
        }
        Ok(())
    }
}

/// Decode a whole in-memory archive
pub fn read_tar(data: &[u8]) -> TarResult<Vec<TarEntry>> {
    let mut entries = Vec::new();
    let mut extract = Extract::default();
    extract.write(data.to_vec(), &mut entries)?;
    extract.end(&mut entries)?;
    Ok(entries)
}
