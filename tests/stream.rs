use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tar_stream::header::{BLOCK_SIZE, D_MODE, DecodeOptions, FilenameEncoding, PREFIX_MAX};
use tar_stream::{
    EntrySink, Extract, Pack, PackOptions, TarEntry, TarError, TarHeader, TypeFlag, encode,
};

#[derive(Default)]
struct Collect {
    entries: Vec<TarEntry>,
    errors: Vec<String>,
    closed: bool,
}

impl EntrySink for Collect {
    fn on_entry(&mut self, header: TarHeader, data: Vec<u8>) {
        self.entries.push(TarEntry { header, data });
    }

    fn on_error(&mut self, error: &TarError) {
        self.errors.push(error.to_string());
    }

    fn on_close(&mut self) {
        self.closed = true;
    }
}

fn archive_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut pack = Pack::new();
    for (name, data) in files {
        pack.add(data.to_vec(), PackOptions::new(*name).mtime(1_600_000_000))
            .unwrap();
    }
    pack.done();
    pack.take_output().to_vec()
}

fn extract_in_chunks(archive: &[u8], cuts: &[usize]) -> Collect {
    let mut sink = Collect::default();
    let mut extract = Extract::default();
    let mut start = 0;
    for &cut in cuts {
        extract.write(archive[start..cut].to_vec(), &mut sink).unwrap();
        start = cut;
    }
    extract.write(archive[start..].to_vec(), &mut sink).unwrap();
    extract.end(&mut sink).unwrap();
    sink
}

#[test]
fn pack_then_extract_single_file() {
    let archive = archive_of(&[("a.txt", &b"hi"[..])]);
    let sink = extract_in_chunks(&archive, &[]);
    assert_eq!(sink.entries.len(), 1);
    assert_eq!(sink.entries[0].header.name, "a.txt");
    assert_eq!(sink.entries[0].header.size, 2);
    assert_eq!(sink.entries[0].data, b"hi");
    assert!(sink.errors.is_empty());
    assert!(sink.closed);
}

#[test]
fn pack_then_extract_many_files() {
    let files: [(&str, &[u8]); 3] = [
        ("assets/logo.svg", b"<svg/>"),
        ("assets/empty.txt", b""),
        ("assets/block.bin", &[0xAB; 1536]),
    ];
    let sink = extract_in_chunks(&archive_of(&files), &[100, 600, 2000]);
    assert_eq!(sink.entries.len(), 3);
    for (entry, (name, data)) in sink.entries.iter().zip(files) {
        assert_eq!(entry.header.name, name);
        assert_eq!(entry.header.mtime, 1_600_000_000);
        assert_eq!(entry.data, data);
    }
}

#[test]
fn pax_attribute_reaches_the_entry() {
    let mut pack = Pack::new();
    pack.add(&b"secret"[..], PackOptions::new("etc/shadow").pax_attr("owner", "root"))
        .unwrap();
    pack.add(&b"plain"[..], PackOptions::new("plain.txt")).unwrap();
    pack.done();

    let sink = extract_in_chunks(&pack.take_output(), &[]);
    assert_eq!(sink.entries.len(), 2);
    assert_eq!(sink.entries[0].header.name, "etc/shadow");
    assert_eq!(sink.entries[0].header.pax["owner"], "root");
    assert_eq!(sink.entries[0].data, b"secret");
    assert!(sink.entries[1].header.pax.is_empty());
}

#[test]
fn name_split_into_prefix() {
    let name = format!("{}/{}", "p".repeat(59), "n".repeat(90));
    assert_eq!(name.len(), 150);

    let block = encode(&TarHeader::new(name.clone(), 0o644, 0)).unwrap();
    assert_eq!(&block[345..345 + 59], "p".repeat(59).as_bytes());
    assert_eq!(block[345 + 59], 0);
    assert_eq!(&block[..90], "n".repeat(90).as_bytes());
    assert_eq!(block[90], 0);

    let archive = archive_of(&[(name.as_str(), &b"x"[..])]);
    // no PAX record needed
    assert_eq!(archive.len(), 512 * 4);
    let sink = extract_in_chunks(&archive, &[]);
    assert_eq!(sink.entries[0].header.name, name);
}

#[test]
fn names_beyond_ustar_survive_through_pax() {
    let deep = format!("{}/file.txt", "d".repeat(PREFIX_MAX + 20));
    let flat = "f".repeat(180);
    let archive = archive_of(&[(deep.as_str(), &b"deep"[..]), (flat.as_str(), &b"flat"[..])]);
    let sink = extract_in_chunks(&archive, &[513, 1500]);
    assert_eq!(sink.entries.len(), 2);
    assert_eq!(sink.entries[0].header.name, deep);
    assert_eq!(sink.entries[0].data, b"deep");
    assert_eq!(sink.entries[1].header.name, flat);
}

#[test]
fn gzip_transport() {
    let archive = archive_of(&[("one.txt", &b"first"[..]), ("two.txt", &[9u8; 4000][..])]);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&archive).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut sink = Collect::default();
    let mut extract = Extract::default();
    let mut buf = [0u8; 333];
    loop {
        let n = decoder.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        extract.write(buf[..n].to_vec(), &mut sink).unwrap();
    }
    extract.end(&mut sink).unwrap();

    assert_eq!(sink.entries.len(), 2);
    assert_eq!(sink.entries[1].data, vec![9u8; 4000]);
    assert_eq!(extract.bytes_consumed(), archive.len() as u64);
}

#[test]
fn pack_as_reader() {
    let mut pack = Pack::new();
    pack.add(&b"streamed"[..], PackOptions::new("r.txt")).unwrap();
    pack.done();
    let mut archive = Vec::new();
    std::io::copy(&mut pack, &mut archive).unwrap();
    let sink = extract_in_chunks(&archive, &[]);
    assert_eq!(sink.entries[0].data, b"streamed");
}

#[test]
fn truncated_stream_reports_error() {
    let archive = archive_of(&[("cut.bin", &[5u8; 2000][..])]);
    let mut sink = Collect::default();
    let mut extract = Extract::default();
    extract.write(archive[..1200].to_vec(), &mut sink).unwrap();
    let err = extract.end(&mut sink).unwrap_err();
    assert!(matches!(err, TarError::Truncated { offset: 1200, missing: 1312 }));
    assert_eq!(sink.errors.len(), 1);
    assert!(!sink.closed);
    assert!(matches!(
        extract.write(archive[1200..].to_vec(), &mut sink),
        Err(TarError::Closed)
    ));
}

#[test]
fn huge_entry_header_streams_without_buffering() {
    let size = 1u64 << 34;
    let mut header = TarHeader::new("huge.img".to_string(), 0o600, size);
    header.mtime = 1;
    let mut archive = encode(&header).unwrap().to_vec();
    assert_eq!(archive[124], 0x80);
    archive.extend_from_slice(&[1u8; 4096]);

    let mut sink = Collect::default();
    let mut extract = Extract::default();
    extract.write(archive, &mut sink).unwrap();
    assert_eq!(extract.bytes_buffered(), 0);
    let err = extract.end(&mut sink).unwrap_err();
    match err {
        TarError::Truncated { missing, .. } => assert_eq!(missing, size - 4096),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn latin1_names() {
    let mut block = encode(&TarHeader::new("caf_.txt".to_string(), 0o644, 0)).unwrap();
    block[3] = 0xE9;
    // refresh checksum after patching the name
    let sum: u32 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 32 } else { u32::from(b) })
        .sum();
    block[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());

    let mut archive = block.to_vec();
    archive.extend_from_slice(&[0u8; 1024]);
    let mut entries: Vec<TarEntry> = Vec::new();
    let mut extract = Extract::new(DecodeOptions {
        filename_encoding: FilenameEncoding::Latin1,
    });
    extract.write(archive, &mut entries).unwrap();
    extract.end(&mut entries).unwrap();
    assert_eq!(entries[0].header.name, "café.txt");
}

#[test]
fn directories_and_links() {
    let mut pack = Pack::new();
    pack.add(Vec::new(), PackOptions::new("dir").typeflag(TypeFlag::Directory).mode(D_MODE))
        .unwrap();
    pack.add(
        Vec::new(),
        PackOptions::new("dir/link").typeflag(TypeFlag::Symlink).linkname("../target"),
    )
    .unwrap();
    pack.done();

    let sink = extract_in_chunks(&pack.take_output(), &[BLOCK_SIZE]);
    assert_eq!(sink.entries[0].header.name, "dir/");
    assert!(sink.entries[0].header.is_directory());
    assert_eq!(sink.entries[0].header.mode, D_MODE);
    assert_eq!(sink.entries[1].header.typeflag, TypeFlag::Symlink);
    assert_eq!(sink.entries[1].header.linkname, "../target");
}

fn sample_archive() -> Vec<u8> {
    let mut pack = Pack::new();
    pack.add(vec![1u8; 700], PackOptions::new("a.bin").mtime(10)).unwrap();
    pack.add(Vec::new(), PackOptions::new("empty").mtime(10)).unwrap();
    pack.add(
        &b"pax body"[..],
        PackOptions::new("x".repeat(130)).mtime(10).pax_attr("comment", "split me"),
    )
    .unwrap();
    pack.add(vec![2u8; 512], PackOptions::new("b.bin").mtime(10)).unwrap();
    pack.done();
    pack.take_output().to_vec()
}

proptest! {
    #[test]
    fn chunk_boundaries_do_not_matter(cuts in prop::collection::vec(0usize..4096, 0..12)) {
        let archive = sample_archive();
        let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % archive.len()).collect();
        cuts.sort_unstable();

        let whole = extract_in_chunks(&archive, &[]);
        let split = extract_in_chunks(&archive, &cuts);
        prop_assert_eq!(whole.entries.len(), 4);
        prop_assert_eq!(&split.entries, &whole.entries);
        prop_assert!(split.closed);
    }
}
