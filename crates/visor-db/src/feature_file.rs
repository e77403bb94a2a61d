//! Binary feature files.
//!
//! Two layouts share one header and are read transparently:
//!
//! ```text
//! blob:        MAGIC | kind=0 | rows u64 | cols u64 | rows*cols f32 | rows * path
//! chunk index: MAGIC | kind=1 | rows u64 | cols u64 | n u32 | n * chunk path
//! ```
//!
//! All integers and floats are little-endian; a path is a `u32` byte
//! length followed by UTF-8. Chunk paths are relative to the directory of
//! the chunk index and each chunk is itself a blob.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use visor_core::{Error, FeatureMatrix, Result};

const MAGIC: &[u8; 4] = b"VSRF";
const KIND_BLOB: u8 = 0;
const KIND_CHUNK_INDEX: u8 = 1;
/// Magic and kind byte.
const HEADER_LEN: u64 = 5;

/// Feature rows with their parallel path list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureData {
    pub feats: FeatureMatrix,
    pub paths: Vec<String>,
}

impl FeatureData {
    pub fn new(feats: FeatureMatrix, paths: Vec<String>) -> Result<Self> {
        if feats.rows() != paths.len() {
            return Err(Error::FeatureFile(format!(
                "{} feature rows but {} paths",
                feats.rows(),
                paths.len()
            )));
        }
        Ok(Self { feats, paths })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Which representation a feature file uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Blob,
    /// Chunk file names, relative to the index directory, in row order.
    Chunked(Vec<String>),
}

/// Parsed chunk index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    pub rows: usize,
    pub cols: usize,
    pub chunks: Vec<String>,
}

// ─── Reading ───────────────────────────────────────────────────────────────

/// Read a feature file of either layout.
pub fn read_features(path: &Path) -> Result<FeatureData> {
    Ok(read_features_with_layout(path)?.0)
}

/// Read a feature file and report which layout it uses.
pub fn read_features_with_layout(path: &Path) -> Result<(FeatureData, Layout)> {
    let (mut reader, body_len) = open_body(path)?;
    match read_header(&mut reader, path)? {
        KIND_BLOB => Ok((read_blob_body(&mut reader, path, body_len)?, Layout::Blob)),
        KIND_CHUNK_INDEX => {
            let index = read_chunk_index_body(&mut reader, path, body_len)?;
            let data = read_chunks(path, &index)?;
            Ok((data, Layout::Chunked(index.chunks)))
        }
        other => Err(Error::FeatureFile(format!(
            "{}: unknown layout kind {}",
            path.display(),
            other
        ))),
    }
}

/// Read only the chunk index, without loading the chunks.
pub fn read_chunk_index(path: &Path) -> Result<ChunkIndex> {
    let (mut reader, body_len) = open_body(path)?;
    match read_header(&mut reader, path)? {
        KIND_CHUNK_INDEX => read_chunk_index_body(&mut reader, path, body_len),
        _ => Err(Error::FeatureFile(format!("{} is not a chunk index", path.display()))),
    }
}

fn read_chunks(index_path: &Path, index: &ChunkIndex) -> Result<FeatureData> {
    let dir = parent_dir(index_path);
    let mut feats = FeatureMatrix::with_cols(index.cols);
    let mut paths = Vec::new();
    for chunk in &index.chunks {
        let chunk_path = dir.join(chunk);
        let (mut reader, body_len) = open_body(&chunk_path)?;
        if read_header(&mut reader, &chunk_path)? != KIND_BLOB {
            return Err(Error::FeatureFile(format!(
                "chunk {} is not a blob",
                chunk_path.display()
            )));
        }
        let data = read_blob_body(&mut reader, &chunk_path, body_len)?;
        feats.append(&data.feats)?;
        paths.extend(data.paths);
    }
    if feats.rows() != index.rows {
        return Err(Error::FeatureFile(format!(
            "{}: index lists {} rows but chunks hold {}",
            index_path.display(),
            index.rows,
            feats.rows()
        )));
    }
    debug!(chunk_count = index.chunks.len(), rows = index.rows, "Chunked feature file loaded");
    FeatureData::new(feats, paths)
}

fn read_header(reader: &mut impl Read, path: &Path) -> Result<u8> {
    let mut magic = [0u8; 4];
    read_exact(reader, &mut magic, path)?;
    if &magic != MAGIC {
        return Err(Error::FeatureFile(format!("{}: not a feature file", path.display())));
    }
    let mut kind = [0u8; 1];
    read_exact(reader, &mut kind, path)?;
    Ok(kind[0])
}

/// `body_len` is the file size minus the header; sizes claimed by the
/// body are checked against it before anything is allocated.
fn read_blob_body(reader: &mut impl Read, path: &Path, body_len: u64) -> Result<FeatureData> {
    let rows = read_u64(reader, path)?;
    let cols = read_u64(reader, path)?;
    let too_large = || {
        Error::FeatureFile(format!(
            "{}: header claims {}x{} features but the file holds {} bytes",
            path.display(),
            rows,
            cols,
            body_len
        ))
    };

    // Floats, plus at least a length prefix per path.
    let float_bytes = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(too_large)?;
    let min_len = rows
        .checked_mul(4)
        .and_then(|n| n.checked_add(float_bytes))
        .and_then(|n| n.checked_add(16))
        .ok_or_else(too_large)?;
    if min_len > body_len {
        return Err(too_large());
    }
    let rows = to_usize(rows, path)?;
    let cols = to_usize(cols, path)?;

    let mut bytes = vec![0u8; to_usize(float_bytes, path)?];
    read_exact(reader, &mut bytes, path)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let mut paths = Vec::new();
    for _ in 0..rows {
        paths.push(read_string(reader, path)?);
    }
    FeatureData::new(FeatureMatrix::from_vec(rows, cols, data)?, paths)
}

fn read_chunk_index_body(reader: &mut impl Read, path: &Path, body_len: u64) -> Result<ChunkIndex> {
    let rows = to_usize(read_u64(reader, path)?, path)?;
    let cols = to_usize(read_u64(reader, path)?, path)?;
    let count = read_u32(reader, path)?;
    if u64::from(count) * 4 + 20 > body_len {
        return Err(Error::FeatureFile(format!(
            "{}: index lists {} chunks but the file holds {} bytes",
            path.display(),
            count,
            body_len
        )));
    }
    let mut chunks = Vec::new();
    for _ in 0..count {
        chunks.push(read_string(reader, path)?);
    }
    Ok(ChunkIndex { rows, cols, chunks })
}

fn to_usize(value: u64, path: &Path) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::FeatureFile(format!("{}: size {} is out of range", path.display(), value)))
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            Error::FeatureFile(format!("{}: file is truncated", path.display()))
        }
        _ => Error::Io(e),
    })
}

fn read_u64(reader: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, path)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, path)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_string(reader: &mut impl Read, path: &Path) -> Result<String> {
    let len = read_u32(reader, path)?;
    let mut buf = Vec::new();
    reader.by_ref().take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() as u64 != u64::from(len) {
        return Err(Error::FeatureFile(format!("{}: file is truncated", path.display())));
    }
    String::from_utf8(buf)
        .map_err(|_| Error::FeatureFile(format!("{}: path is not valid UTF-8", path.display())))
}

// ─── Writing ───────────────────────────────────────────────────────────────

/// Write rows and paths as a single blob.
pub fn write_blob(path: &Path, feats: &FeatureMatrix, paths: &[String]) -> Result<()> {
    if feats.rows() != paths.len() {
        return Err(Error::FeatureFile(format!(
            "{} feature rows but {} paths",
            feats.rows(),
            paths.len()
        )));
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[KIND_BLOB])?;
    writer.write_all(&(feats.rows() as u64).to_le_bytes())?;
    writer.write_all(&(feats.cols() as u64).to_le_bytes())?;
    for value in feats.as_slice() {
        writer.write_all(&value.to_le_bytes())?;
    }
    for p in paths {
        write_string(&mut writer, p)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Write a chunk index listing `chunks` (relative to its directory).
pub fn write_chunk_index(path: &Path, chunks: &[String], rows: usize, cols: usize) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[KIND_CHUNK_INDEX])?;
    writer.write_all(&(rows as u64).to_le_bytes())?;
    writer.write_all(&(cols as u64).to_le_bytes())?;
    writer.write_all(&(chunks.len() as u32).to_le_bytes())?;
    for chunk in chunks {
        write_string(&mut writer, chunk)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Name of the chunk holding rows `start..end` of `index_path`:
/// `<stem>_<start+1>-<end><ext>`.
pub fn chunk_file_name(index_path: &Path, start: usize, end: usize) -> String {
    let stem = index_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "feats".to_string());
    let ext = index_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}_{}-{}{}", stem, start + 1, end, ext)
}

/// Write `feats`/`paths` split into blobs of `chunk_size` rows plus a
/// chunk index at `index_path`. Returns the chunk file names.
pub fn write_chunked(
    index_path: &Path,
    feats: &FeatureMatrix,
    paths: &[String],
    chunk_size: usize,
) -> Result<Vec<String>> {
    let chunk_size = chunk_size.max(1);
    let dir = parent_dir(index_path);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < feats.rows() {
        let end = (start + chunk_size).min(feats.rows());
        let name = chunk_file_name(index_path, start, end);
        write_blob(&dir.join(&name), &slice_rows(feats, start, end)?, &paths[start..end])?;
        chunks.push(name);
        start = end;
    }
    write_chunk_index(index_path, &chunks, feats.rows(), feats.cols())?;
    debug!(chunk_count = chunks.len(), rows = feats.rows(), "Chunked feature file written");
    Ok(chunks)
}

/// Copy rows `start..end` into a new matrix.
pub fn slice_rows(feats: &FeatureMatrix, start: usize, end: usize) -> Result<FeatureMatrix> {
    let cols = feats.cols();
    FeatureMatrix::from_vec(
        end - start,
        cols,
        feats.as_slice()[start * cols..end * cols].to_vec(),
    )
}

fn write_string(writer: &mut impl Write, s: &str) -> Result<()> {
    writer.write_all(&(s.len() as u32).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        Error::FeatureFile(format!("cannot open {}: {}", path.display(), e))
    })
}

/// Open for reading, along with the byte count after the header.
fn open_body(path: &Path) -> Result<(BufReader<File>, u64)> {
    let file = open(path)?;
    let len = file.metadata()?.len();
    Ok((BufReader::new(file), len.saturating_sub(HEADER_LEN)))
}

/// Directory containing `path`, `.` for bare file names.
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// `path` with `.suffix` appended to its full file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
