//! Tar header codec
//!
//! Encodes a [`TarHeader`] into a single 512-byte ustar block and decodes a
//! block back, verifying the checksum on the way.
//!
//! # Usage
//!
//! ```rust
//! use tar_stream::header::{decode, encode, DecodeOptions, TarHeader};
//!
//! let header = TarHeader::new("hello.txt".to_string(), 0o644, 12);
//! let block = encode(&header).unwrap();
//! assert_eq!(block.len(), 512);
//!
//! let decoded = decode(&block, &DecodeOptions::default()).unwrap();
//! assert_eq!(decoded, header);
//! ```
//!
//! # Block layout
//!
//! | offset | size | field    |
//! |--------|------|----------|
//! | 0      | 100  | name     |
//! | 100    | 8    | mode     |
//! | 108    | 8    | uid      |
//! | 116    | 8    | gid      |
//! | 124    | 12   | size     |
//! | 136    | 12   | mtime    |
//! | 148    | 8    | checksum |
//! | 156    | 1    | typeflag |
//! | 157    | 100  | linkname |
//! | 257    | 6    | magic    |
//! | 263    | 2    | version  |
//! | 265    | 32   | uname    |
//! | 297    | 32   | gname    |
//! | 329    | 8    | devmajor |
//! | 337    | 8    | devminor |
//! | 345    | 155  | prefix   |

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Range;

use tracing::warn;

use crate::error::{TarError, TarResult};

/// Size of a tar block
pub const BLOCK_SIZE: usize = 512;

/// Max bytes of the name field
pub const NAME_MAX: usize = 100;
/// Max bytes of the prefix field
pub const PREFIX_MAX: usize = 155;
/// Max bytes of name + prefix
pub const PATH_MAX: usize = 255;
/// Max bytes of the linkname field
pub const LINKNAME_MAX: usize = 100;
/// Max bytes of the uname/gname fields
pub const OWNER_NAME_MAX: usize = 32;

/// Default mode of regular files (rw-r--r--)
pub const F_MODE: u32 = 0o644;
/// Default mode of directories (rwxr-xr-x)
pub const D_MODE: u32 = 0o755;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CHECKSUM: Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const LINKNAME: Range<usize> = 157..257;
const MAGIC: Range<usize> = 257..263;
const VERSION: Range<usize> = 263..265;
const UNAME: Range<usize> = 265..297;
const GNAME: Range<usize> = 297..329;
const DEVMAJOR: Range<usize> = 329..337;
const DEVMINOR: Range<usize> = 337..345;
const PREFIX: Range<usize> = 345..500;

const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
const USTAR_VERSION: &[u8; 2] = b"00";

/// Digits of the 8-byte numeric fields
const SHORT_DIGITS: usize = 6;
/// Digits of the 12-byte numeric fields
const LONG_DIGITS: usize = 11;
/// Largest size that still fits 11 octal digits (8 GiB - 1)
const OCTAL_SIZE_MAX: u64 = 0o77777777777;
const BASE256_MARKER: u8 = 0x80;
const BASE256_NEGATIVE: u8 = 0xFF;

/// Checksum of a block whose bytes are all zero
pub const EMPTY_CHECKSUM: u32 = 8 * b' ' as u32;

/// Entry type stored in the typeflag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypeFlag {
    /// `0` or NUL
    #[default]
    Regular,
    /// `1`
    HardLink,
    /// `2`
    Symlink,
    /// `3`
    CharDevice,
    /// `4`
    BlockDevice,
    /// `5`
    Directory,
    /// `6`
    Fifo,
    /// `7`
    Contiguous,
    /// `x`: PAX attributes for the next entry
    PaxExtended,
    /// `g`: PAX attributes for all following entries
    PaxGlobal,
    /// `K`: GNU long link target for the next entry
    GnuLongLink,
    /// `L`: GNU long name for the next entry
    GnuLongName,
    /// Anything else, kept as the raw byte
    Other(u8),
}

impl TypeFlag {
    /// Parse from the typeflag byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'0' | 0 => Self::Regular,
            b'1' => Self::HardLink,
            b'2' => Self::Symlink,
            b'3' => Self::CharDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'7' => Self::Contiguous,
            b'x' => Self::PaxExtended,
            b'g' => Self::PaxGlobal,
            b'K' => Self::GnuLongLink,
            b'L' => Self::GnuLongName,
            other => Self::Other(other),
        }
    }

    /// Byte written to the typeflag field
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Regular => b'0',
            Self::HardLink => b'1',
            Self::Symlink => b'2',
            Self::CharDevice => b'3',
            Self::BlockDevice => b'4',
            Self::Directory => b'5',
            Self::Fifo => b'6',
            Self::Contiguous => b'7',
            Self::PaxExtended => b'x',
            Self::PaxGlobal => b'g',
            Self::GnuLongLink => b'K',
            Self::GnuLongName => b'L',
            Self::Other(byte) => byte,
        }
    }

    /// True for the PAX and GNU records that modify the following header
    pub fn is_extension(self) -> bool {
        matches!(
            self,
            Self::PaxExtended | Self::PaxGlobal | Self::GnuLongLink | Self::GnuLongName
        )
    }
}

/// Text codec used for name, linkname, uname and gname
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenameEncoding {
    /// UTF-8, invalid sequences replaced with U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
}

impl FilenameEncoding {
    /// Decode raw field bytes into a string
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Options for [`decode`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub filename_encoding: FilenameEncoding,
}

/// Logical tar header
///
/// `name` is the full path: the ustar prefix is split off on encode and
/// joined back on decode. `pax` holds the extended attributes merged into
/// this header while extracting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub typeflag: TypeFlag,
    pub linkname: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
    pub pax: BTreeMap<String, String>,
}

impl Default for TarHeader {
    fn default() -> Self {
        Self {
            name: String::new(),
            mode: F_MODE,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            typeflag: TypeFlag::Regular,
            linkname: String::new(),
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            pax: BTreeMap::new(),
        }
    }
}

impl TarHeader {
    /// Create a new TarHeader with minimal required fields
    /// Other fields are filled with default values
    pub fn new(name: String, mode: u32, size: u64) -> Self {
        Self {
            name,
            mode,
            size,
            ..Self::default()
        }
    }

    /// Parse a TarHeader from a 512-byte slice
    pub fn from_bytes(data: &[u8]) -> TarResult<Self> {
        decode(data, &DecodeOptions::default())
    }

    /// Convert the TarHeader to a 512-byte array
    pub fn to_bytes(&self) -> TarResult<[u8; BLOCK_SIZE]> {
        encode(self)
    }

    pub fn is_directory(&self) -> bool {
        self.typeflag == TypeFlag::Directory
    }
}

/// Number of zero bytes that follow `size` bytes of content
pub fn padding_for(size: u64) -> usize {
    let block = BLOCK_SIZE as u64;
    ((block - size % block) % block) as usize
}

/// Split a path into ustar `(prefix, name)`.
///
/// Names of at most 100 bytes are returned unsplit. Longer names are cut at
/// the first `/` that leaves at most 100 bytes in the name part. A directory
/// path may be cut at its trailing `/`, leaving the name part empty.
pub fn split_name(path: &str) -> TarResult<(&str, &str)> {
    if path.len() <= NAME_MAX {
        return Ok(("", path));
    }
    let cut = path
        .match_indices('/')
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .map(|i| (i, path.len() - i - 1))
        .find(|&(_, rest)| rest <= NAME_MAX && (rest > 0 || path.ends_with('/')))
        .map(|(i, _)| i)
        .ok_or_else(|| TarError::InvalidName(path.to_string()))?;
    let (prefix, name) = (&path[..cut], &path[cut + 1..]);
    if prefix.len() + name.len() > PATH_MAX {
        return Err(TarError::InvalidNameLength(prefix.len() + name.len()));
    }
    if prefix.len() > PREFIX_MAX {
        return Err(TarError::InvalidName(path.to_string()));
    }
    Ok((prefix, name))
}

/// Entry name as stored in the archive: directories end in `/`
pub(crate) fn full_name(header: &TarHeader) -> Cow<'_, str> {
    if header.typeflag == TypeFlag::Directory && !header.name.ends_with('/') {
        return Cow::Owned(format!("{}/", header.name));
    }
    Cow::Borrowed(&header.name)
}

/// Encode a header into a 512-byte block
pub fn encode(header: &TarHeader) -> TarResult<[u8; BLOCK_SIZE]> {
    let name = full_name(header);
    let (prefix, name) = split_name(&name)?;
    if header.linkname.len() > LINKNAME_MAX {
        return Err(TarError::InvalidLinkname(header.linkname.len()));
    }

    let mut block = [0u8; BLOCK_SIZE];
    write_str(&mut block[NAME], name);
    write_octal(&mut block[MODE], u64::from(header.mode), SHORT_DIGITS);
    write_octal(&mut block[UID], u64::from(header.uid), SHORT_DIGITS);
    write_octal(&mut block[GID], u64::from(header.gid), SHORT_DIGITS);
    write_size(&mut block[SIZE], header.size);
    write_octal(&mut block[MTIME], header.mtime, LONG_DIGITS);
    block[TYPEFLAG] = header.typeflag.as_byte();
    write_str(&mut block[LINKNAME], &header.linkname);
    block[MAGIC].copy_from_slice(USTAR_MAGIC);
    block[VERSION].copy_from_slice(USTAR_VERSION);
    write_str(&mut block[UNAME], truncate_str(&header.uname, OWNER_NAME_MAX));
    write_str(&mut block[GNAME], truncate_str(&header.gname, OWNER_NAME_MAX));
    write_octal(&mut block[DEVMAJOR], u64::from(header.devmajor), SHORT_DIGITS);
    write_octal(&mut block[DEVMINOR], u64::from(header.devminor), SHORT_DIGITS);
    write_str(&mut block[PREFIX], prefix);

    // checksum goes last, over the finished block
    let checksum = format!("{:06o}\0 ", calc_checksum(&block));
    block[CHECKSUM].copy_from_slice(checksum.as_bytes());
    Ok(block)
}

/// Decode a 512-byte block into a header
///
/// Fails with [`TarError::NotAHeader`] for an all-zero block and with
/// [`TarError::InvalidChecksum`] when the stored checksum does not match.
pub fn decode(block: &[u8], options: &DecodeOptions) -> TarResult<TarHeader> {
    if block.len() < BLOCK_SIZE {
        return Err(TarError::InsufficientBytes {
            requested: BLOCK_SIZE,
            available: block.len(),
        });
    }
    let actual = calc_checksum(block);
    if actual == EMPTY_CHECKSUM {
        return Err(TarError::NotAHeader);
    }
    let expected = read_u32(&block[CHECKSUM])?;
    if expected != actual {
        return Err(TarError::InvalidChecksum { expected, actual });
    }

    let encoding = options.filename_encoding;
    let mut name = read_str(&block[NAME], encoding);
    if read_field(&block[MAGIC]) == b"ustar" {
        let prefix = read_str(&block[PREFIX], encoding);
        if !prefix.is_empty() {
            name = format!("{prefix}/{name}");
        }
    }
    let size = read_numeric(&block[SIZE])?;
    let raw_flag = block[TYPEFLAG];
    let mut typeflag = TypeFlag::from_byte(raw_flag);
    if typeflag == TypeFlag::Regular && size == 0 && name.ends_with('/') {
        typeflag = TypeFlag::Directory;
    }

    Ok(TarHeader {
        name,
        mode: read_u32(&block[MODE])?,
        uid: read_u32(&block[UID])?,
        gid: read_u32(&block[GID])?,
        size,
        mtime: read_mtime(&block[MTIME])?,
        typeflag,
        linkname: read_str(&block[LINKNAME], encoding),
        uname: read_str(&block[UNAME], encoding),
        gname: read_str(&block[GNAME], encoding),
        devmajor: read_u32(&block[DEVMAJOR])?,
        devminor: read_u32(&block[DEVMINOR])?,
        pax: BTreeMap::new(),
    })
}

/// Calc checksum of the header bytes
pub fn calc_checksum(data: &[u8]) -> u32 {
    if data.len() < BLOCK_SIZE {
        return 0;
    }
    let mut sum: u32 = 0;
    for (i, &b) in data.iter().take(BLOCK_SIZE).enumerate() {
        if CHECKSUM.contains(&i) {
            sum += u32::from(b' ');
        } else {
            sum += u32::from(b);
        }
    }
    sum
}

/// Bytes of a NUL terminated field
pub(crate) fn read_field(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..end]
}

pub(crate) fn read_str(data: &[u8], encoding: FilenameEncoding) -> String {
    encoding.decode(read_field(data))
}

/// Longest prefix of `s` that fits `max` bytes without splitting a char
pub(crate) fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Zero padded octal followed by a space. Values too wide for the field are
/// clamped to all sevens.
fn write_octal(field: &mut [u8], value: u64, digits: usize) {
    let mut text = format!("{value:0digits$o}");
    if text.len() > digits {
        text = "7".repeat(digits);
    }
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = b' ';
}

/// Octal when it fits 11 digits, base-256 otherwise
fn write_size(field: &mut [u8], size: u64) {
    if size <= OCTAL_SIZE_MAX {
        write_octal(field, size, LONG_DIGITS);
        return;
    }
    field.fill(0);
    field[0] = BASE256_MARKER;
    let magnitude = size.to_be_bytes();
    let start = field.len() - magnitude.len();
    field[start..].copy_from_slice(&magnitude);
}

fn read_signed(field: &[u8]) -> TarResult<i128> {
    match field.first() {
        Some(&marker) if marker & 0x80 != 0 => read_base256(field),
        _ => read_octal(field).map(i128::from),
    }
}

/// Unsigned field; negative base-256 values are rejected
fn read_numeric(field: &[u8]) -> TarResult<u64> {
    let value = read_signed(field)?;
    u64::try_from(value).map_err(|_| TarError::InvalidBase256(field.to_vec()))
}

/// Modification time; times before the epoch are clamped to 0
fn read_mtime(field: &[u8]) -> TarResult<u64> {
    let value = read_signed(field)?;
    if value < 0 {
        warn!("mtime {value} is before 1970, using 0");
        return Ok(0);
    }
    u64::try_from(value).map_err(|_| TarError::InvalidBase256(field.to_vec()))
}

fn read_u32(field: &[u8]) -> TarResult<u32> {
    let value = read_numeric(field)?;
    u32::try_from(value).map_err(|_| TarError::InvalidOctalFormat(format!("{value:o}")))
}

fn read_octal(field: &[u8]) -> TarResult<u64> {
    let start = field
        .iter()
        .position(|&b| b != b' ' && b != 0)
        .unwrap_or(field.len());
    let digits = &field[start..];
    let end = digits
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(digits.len());
    let digits = &digits[..end];
    if digits.is_empty() {
        return Ok(0);
    }
    let invalid = || TarError::InvalidOctalFormat(String::from_utf8_lossy(digits).into_owned());
    let text = std::str::from_utf8(digits).map_err(|_| invalid())?;
    u64::from_str_radix(text, 8).map_err(|_| invalid())
}

/// Big-endian two's complement. `0x80` marks a positive value, `0xFF` a
/// negative one.
fn read_base256(field: &[u8]) -> TarResult<i128> {
    let init = match field[0] {
        BASE256_MARKER => 0,
        BASE256_NEGATIVE => -1,
        _ => return Err(TarError::InvalidBase256(field.to_vec())),
    };
    // 12-byte fields carry 88 bits after the marker
    if field.len() > 16 {
        return Err(TarError::InvalidBase256(field.to_vec()));
    }
    Ok(field[1..]
        .iter()
        .fold(init, |acc: i128, &b| (acc << 8) | i128::from(b)))
}
