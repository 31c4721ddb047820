//! Streaming tar archive encoder and decoder
//!
//! # Usage
//!
//! ## Packing files into a TAR archive
//!
//! ```rust,no_run
//! use tar_stream::pack;
//!
//! pack("archive.tar", &["file1.txt", "file2.txt"]).unwrap();
//! // Creates archive.tar containing file1.txt and file2.txt
//! pack("archive.tar.gz", &["file1.txt", "file2.txt"]).unwrap();
//! // Creates archive.tar.gz that is gzip-compressed
//! ```
//!
//! ## Unpacking files from a TAR archive
//!
//! ```rust,no_run
//! use tar_stream::unpack;
//!
//! unpack("archive.tar.gz", "output_directory").unwrap();
//! // Extracts all files from archive.tar.gz to output_directory/
//! ```
//!
//! ## Listing files in a TAR archive
//!
//! ```rust,no_run
//! use tar_stream::list;
//!
//! match list("archive.tar") {
//!     Ok(headers) => {
//!         println!("Files in archive:");
//!         for header in headers {
//!             println!("  {} ({} bytes)", header.name, header.size);
//!         }
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```
//!
//! ## Streaming API
//!
//! ```rust
//! use tar_stream::{Extract, Pack, PackOptions, TarEntry};
//!
//! let mut pack = Pack::new();
//! pack.add(&b"Hello, World"[..], PackOptions::new("hello.txt").pax_attr("owner", "root"))
//!     .unwrap();
//! pack.done();
//!
//! let mut extract = Extract::default();
//! let mut entries: Vec<TarEntry> = Vec::new();
//! while let Some(chunk) = pack.read_chunk(700) {
//!     extract.write(chunk, &mut entries).unwrap();
//! }
//! extract.end(&mut entries).unwrap();
//!
//! assert_eq!(entries[0].header.name, "hello.txt");
//! assert_eq!(entries[0].header.pax["owner"], "root");
//! assert_eq!(entries[0].data, b"Hello, World");
//! ```

pub mod error;
pub mod extract;
pub mod header;
pub mod pack;
pub mod pax;
pub mod queue;

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

pub use error::{TarError, TarResult};
pub use extract::{EntrySink, Extract, TarEntry, read_tar};
pub use header::{DecodeOptions, FilenameEncoding, TarHeader, TypeFlag, decode, encode};
pub use pack::{Pack, PackOptions};
pub use pax::{decode_pax, encode_pax};
pub use queue::ByteQueue;

/// Read size used when streaming an archive file through [`Extract`]
const CHUNK_SIZE: usize = 64 * 1024;

// ----------------------------------------------------------------
// simple methods for reading and writing tar archive files
// ----------------------------------------------------------------

fn is_gzipped(tarfile: &str) -> bool {
    tarfile.ends_with(".tar.gz") || tarfile.ends_with(".tgz")
}

/// Packs files into a tar archive (supports .tar and .tar.gz)
///
/// Missing files are skipped with a warning.
pub fn pack(tarfile: &str, files: &[&str]) -> TarResult<()> {
    let file = fs::File::create(tarfile)?;
    let count = if is_gzipped(tarfile) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        let count = write_archive(&mut encoder, files)?;
        encoder.finish()?;
        count
    } else {
        let mut writer = BufWriter::new(file);
        let count = write_archive(&mut writer, files)?;
        writer.flush()?;
        count
    };
    debug!("created {tarfile} with {count} entries");
    Ok(())
}

fn write_archive<W: Write>(out: &mut W, files: &[&str]) -> TarResult<usize> {
    let mut pack = Pack::new();
    for file_path in files {
        let path = Path::new(file_path);
        if !path.is_file() {
            warn!("file not found: {file_path}");
            continue;
        }
        let data = fs::read(path)?;
        let filename = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mut options = PackOptions::new(filename);
        if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
            let mtime = DateTime::<Utc>::from(modified).timestamp();
            options = options.mtime(u64::try_from(mtime).unwrap_or(0));
        }
        pack.add(data, options)?;
        io::copy(&mut pack, out)?;
    }
    pack.done();
    io::copy(&mut pack, out)?;
    Ok(pack.entry_count())
}

fn open_archive(tarfile: &str) -> TarResult<Box<dyn Read>> {
    let file = BufReader::new(fs::File::open(tarfile)?);
    if is_gzipped(tarfile) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Stream `tarfile` through [`Extract`], handing each entry to `on_entry`
fn for_each_entry<F>(tarfile: &str, mut on_entry: F) -> TarResult<()>
where
    F: FnMut(TarEntry) -> TarResult<()>,
{
    let mut reader = open_archive(tarfile)?;
    let mut extract = Extract::default();
    let mut entries: Vec<TarEntry> = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        extract.write(buf[..n].to_vec(), &mut entries)?;
        for entry in entries.drain(..) {
            on_entry(entry)?;
        }
    }
    extract.end(&mut entries)?;
    for entry in entries.drain(..) {
        on_entry(entry)?;
    }
    Ok(())
}

/// Lists TarHeader in a tar archive (supports .tar and .tar.gz)
pub fn list(tarfile: &str) -> TarResult<Vec<TarHeader>> {
    let mut headers = Vec::new();
    for_each_entry(tarfile, |entry| {
        headers.push(entry.header);
        Ok(())
    })?;
    Ok(headers)
}

/// Unpacks files from a tar archive (supports .tar and .tar.gz)
///
/// Entries whose names are absolute or contain `..` are skipped. Only
/// directories and regular files are written.
pub fn unpack(tarfile: &str, output_dir: &str) -> TarResult<()> {
    let output_path = Path::new(output_dir);
    fs::create_dir_all(output_path)?;

    for_each_entry(tarfile, |entry| {
        let Some(target) = entry_path(output_path, &entry.header.name) else {
            warn!("skipping unsafe entry name {:?}", entry.header.name);
            return Ok(());
        };
        match entry.header.typeflag {
            TypeFlag::Directory => fs::create_dir_all(&target)?,
            TypeFlag::Regular | TypeFlag::Contiguous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, &entry.data)?;
                debug!("extracted {}", entry.header.name);
            }
            other => debug!("skipping {other:?} entry {}", entry.header.name),
        }
        Ok(())
    })
}

/// Location of `name` below `root`, or `None` when it would escape it
fn entry_path(root: &Path, name: &str) -> Option<PathBuf> {
    let mut target = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(target)
}
