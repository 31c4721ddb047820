//! Streaming tar encoder
//!
//! [`Pack::add`] writes the header, content and padding of one entry to an
//! internal output queue right away; the transport drains it through
//! [`Pack::read_chunk`], [`Pack::take_output`] or `std::io::Read`.

use std::collections::BTreeMap;
use std::io::{self, Read};

use bytes::Bytes;
use chrono::Utc;
use tracing::debug;

use crate::error::{TarError, TarResult};
use crate::extract::MAX_EXTENSION_SIZE;
use crate::header::{
    F_MODE, LINKNAME_MAX, NAME_MAX, TarHeader, TypeFlag, encode, full_name, padding_for, truncate_str,
};
use crate::pax::encode_pax;
use crate::queue::ByteQueue;

/// Name of the `x` block preceding an entry with PAX attributes
pub const PAX_HEADER_NAME: &str = "PaxHeader";

static ZEROS: [u8; 1024] = [0; 1024];

/// Metadata of one packed entry
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub filename: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub typeflag: TypeFlag,
    pub linkname: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
    /// Unix seconds, `None` for now
    pub mtime: Option<u64>,
    /// Extended attributes; non-empty triggers a PAX header
    pub pax: BTreeMap<String, String>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            filename: String::new(),
            mode: F_MODE,
            uid: 0,
            gid: 0,
            typeflag: TypeFlag::Regular,
            linkname: String::new(),
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            mtime: None,
            pax: BTreeMap::new(),
        }
    }
}

impl PackOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn typeflag(mut self, typeflag: TypeFlag) -> Self {
        self.typeflag = typeflag;
        self
    }

    pub fn linkname(mut self, linkname: impl Into<String>) -> Self {
        self.linkname = linkname.into();
        self
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn owner_names(mut self, uname: impl Into<String>, gname: impl Into<String>) -> Self {
        self.uname = uname.into();
        self.gname = gname.into();
        self
    }

    pub fn device(mut self, devmajor: u32, devminor: u32) -> Self {
        self.devmajor = devmajor;
        self.devminor = devminor;
        self
    }

    pub fn mtime(mut self, mtime: u64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn pax_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pax.insert(key.into(), value.into());
        self
    }

    /// Header for `size` bytes of content
    fn resolve(self, size: u64) -> TarHeader {
        let mtime = self
            .mtime
            .unwrap_or_else(|| u64::try_from(Utc::now().timestamp()).unwrap_or(0));
        TarHeader {
            name: self.filename,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size,
            mtime,
            typeflag: self.typeflag,
            linkname: self.linkname,
            uname: self.uname,
            gname: self.gname,
            devmajor: self.devmajor,
            devminor: self.devminor,
            pax: self.pax,
        }
    }
}

/// Streaming tar encoder
#[derive(Debug, Default)]
pub struct Pack {
    output: ByteQueue,
    finished: bool,
    entries: usize,
}

impl Pack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. Nothing is written when it fails.
    pub fn add(&mut self, content: impl Into<Bytes>, options: PackOptions) -> TarResult<()> {
        if self.finished {
            return Err(TarError::HasFinished);
        }
        let content = content.into();
        let header = options.resolve(content.len() as u64);

        let (block, pax) = match encode(&header) {
            Ok(block) if header.pax.is_empty() => (block, None),
            Ok(block) => (block, Some(pax_entry(&header)?)),
            Err(TarError::InvalidName(_) | TarError::InvalidNameLength(_) | TarError::InvalidLinkname(_)) => {
                debug!("{:?} does not fit a ustar header, adding PAX record", header.name);
                let block = encode(&placeholder(&header))?;
                (block, Some(pax_entry(&header)?))
            }
            Err(err) => return Err(err),
        };

        if let Some((pax_block, payload)) = pax {
            let padding = padding_for(payload.len() as u64);
            self.output.push(pax_block.to_vec());
            self.output.push(payload);
            self.push_zeros(padding);
        }
        self.output.push(block.to_vec());
        self.output.push(content);
        self.push_zeros(padding_for(header.size));
        self.entries += 1;
        Ok(())
    }

    fn push_zeros(&mut self, len: usize) {
        if len > 0 {
            self.output.push(Bytes::from_static(&ZEROS[..len]));
        }
    }

    /// Write the end-of-archive marker. Calling it again does nothing.
    pub fn done(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.push_zeros(ZEROS.len());
        debug!("tar pack finished with {} entries", self.entries);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of entries added so far
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Bytes waiting to be drained
    pub fn buffered_len(&self) -> usize {
        self.output.len()
    }

    /// Drain up to `max` bytes of output
    pub fn read_chunk(&mut self, max: usize) -> Option<Bytes> {
        let len = max.min(self.output.len());
        if len == 0 {
            return None;
        }
        self.output.shift(len).ok()
    }

    /// Drain all buffered output
    pub fn take_output(&mut self) -> Bytes {
        let len = self.output.len();
        self.output.shift(len).unwrap_or_default()
    }
}

/// Returns `Ok(0)` whenever nothing is buffered, so drain only after `done`
/// when end-of-file matters.
impl Read for Pack {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_chunk(buf.len()) {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }
}

/// `x` header block and PAX payload carrying the full name, link target
/// and extra attributes of `header`
fn pax_entry(header: &TarHeader) -> TarResult<([u8; 512], Vec<u8>)> {
    let payload = encode_pax(&full_name(header), &header.linkname, &header.pax);
    if payload.len() as u64 > MAX_EXTENSION_SIZE {
        return Err(TarError::InvalidPaxRecord(format!(
            "PAX payload of {} bytes exceeds {MAX_EXTENSION_SIZE}",
            payload.len()
        )));
    }
    let pax_header = TarHeader {
        name: PAX_HEADER_NAME.to_string(),
        typeflag: TypeFlag::PaxExtended,
        size: payload.len() as u64,
        linkname: String::new(),
        pax: BTreeMap::new(),
        ..header.clone()
    };
    Ok((encode(&pax_header)?, payload))
}

/// Header carrying a ustar-sized stand-in for a name or link target that
/// only fits the PAX record
fn placeholder(header: &TarHeader) -> TarHeader {
    TarHeader {
        name: truncate_str(&header.name, NAME_MAX - 1).to_string(),
        linkname: truncate_str(&header.linkname, LINKNAME_MAX).to_string(),
        pax: BTreeMap::new(),
        ..header.clone()
    }
}
