// imports
use crate::error::{Error, Result};
use crate::records::{Record, Token, TokenPair, Weighted};

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::debug;

/// Pull side of a record stream. Sources are forward-only; re-scanning a file
/// means opening it again through its codec.
pub type RecordSource<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Push side of a record stream.
///
/// Every sink is a scoped resource: `close` flushes buffered records and
/// releases the underlying handle. It is idempotent and must be called once
/// the last record is written, `drain_into` does so on every exit path.
pub trait RecordSink<T>: Send {
    fn write(&mut self, record: T) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

impl<T, S: RecordSink<T> + ?Sized> RecordSink<T> for Box<S> {
    fn write(&mut self, record: T) -> Result<()> {
        (**self).write(record)
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Copies every record of `source` into `sink` and closes the sink, also when
/// the copy fails half way. Returns the number of records read.
pub fn drain_into<T, I, S>(source: I, sink: &mut S) -> Result<u64>
where
    I: IntoIterator<Item = Result<T>>,
    S: RecordSink<T> + ?Sized,
{
    let mut count = 0;
    let copied = copy_records(source, sink, &mut count);
    let closed = sink.close();
    copied?;
    closed?;
    Ok(count)
}

fn copy_records<T, I, S>(source: I, sink: &mut S, count: &mut u64) -> Result<()>
where
    I: IntoIterator<Item = Result<T>>,
    S: RecordSink<T> + ?Sized,
{
    for record in source {
        sink.write(record?)?;
        *count += 1;
    }
    Ok(())
}

/// Opens a file for both codecs, ungzipping when its name ends in `.gz`.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let f = File::open(path).map_err(|e| Error::io(format!("cannot open {}", path.display()), e))?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(GzDecoder::new(BufReader::new(f)))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

/// A file being written, gzipped or not. `finish` must be called to learn
/// whether the last bytes (and the gzip trailer) reached the disk.
pub enum FileWriter {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
}

impl FileWriter {

    pub fn finish(self) -> std::io::Result<()> {
        let mut inner = match self {
            FileWriter::Plain(w) => w,
            FileWriter::Gz(gz) => gz.finish()?,
        };
        inner.flush()
    }
}

impl Write for FileWriter {

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            FileWriter::Plain(w) => w.write(buf),
            FileWriter::Gz(gz) => gz.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            FileWriter::Plain(w) => w.flush(),
            FileWriter::Gz(gz) => gz.flush(),
        }
    }
}

pub fn open_writer(path: &Path, compress: bool) -> Result<FileWriter> {
    let f = File::create(path).map_err(|e| Error::io(format!("cannot create {}", path.display()), e))?;
    let f = BufWriter::new(f);
    if compress || is_gz(path) {
        Ok(FileWriter::Gz(GzEncoder::new(f, Compression::fast())))
    } else {
        Ok(FileWriter::Plain(f))
    }
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

/// Moves a finished file into place. Falls back to copy and delete when the
/// rename crosses file systems. `dst` is either the complete file or left
/// as it was.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_into_place(src, dst)?;
    fs::remove_file(src).map_err(|e| Error::io(format!("cannot remove {}", src.display()), e))?;
    Ok(())
}

// copies into a hidden sibling of dst, then renames it over dst on the same
// file system; the sibling is removed when any step fails
pub fn copy_into_place(src: &Path, dst: &Path) -> Result<()> {
    let context = || format!("cannot move {} to {}", src.display(), dst.display());
    let parent = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".moving-")
        .tempfile_in(parent)
        .map_err(|e| Error::io(context(), e))?;
    let mut reader = File::open(src).map_err(|e| Error::io(context(), e))?;
    std::io::copy(&mut reader, staged.as_file_mut()).map_err(|e| Error::io(context(), e))?;
    staged.as_file().sync_all().map_err(|e| Error::io(context(), e))?;
    staged.persist(dst).map_err(|e| Error::io(context(), e.error))?;
    Ok(())
}

/// Opens sources and sinks of one on-disk encoding.
pub trait RecordCodec<T>: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<RecordSource<T>>;
    fn open_sink(&self, path: &Path) -> Result<Box<dyn RecordSink<T>>>;
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// binary codec, bincode records back to back

pub struct BinaryCodec<T> {
    compress: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BinaryCodec<T> {
    pub fn new(compress: bool) -> BinaryCodec<T> {
        Self { compress, _marker: PhantomData }
    }
}

impl<T: Record> RecordCodec<T> for BinaryCodec<T> {

    fn open_source(&self, path: &Path) -> Result<RecordSource<T>> {
        // gzip is detected from the writer side flag, so a compressed run file
        // without a .gz suffix still needs the decoder
        let reader: Box<dyn BufRead + Send> = if self.compress && !is_gz(path) {
            let f = File::open(path).map_err(|e| Error::io(format!("cannot open {}", path.display()), e))?;
            Box::new(BufReader::new(GzDecoder::new(BufReader::new(f))))
        } else {
            open_reader(path)?
        };
        Ok(Box::new(BinarySource::<T> {
            reader,
            context: path.display().to_string(),
            done: false,
            _marker: PhantomData,
        }))
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn RecordSink<T>>> {
        let writer = open_writer(path, self.compress)?;
        Ok(Box::new(BinarySink { writer: Some(writer), context: path.display().to_string() }))
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

struct BinarySource<T> {
    reader: Box<dyn BufRead + Send>,
    context: String,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Iterator for BinarySource<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // an empty buffer at a record boundary is the end of the stream, a
        // truncated record surfaces as a decoding error instead
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                self.done = true;
                None
            }
            Ok(_) => match bincode::deserialize_from(&mut self.reader) {
                Ok(record) => Some(Ok(record)),
                Err(e) => {
                    self.done = true;
                    Some(Err(Error::format(self.context.clone(), e.to_string())))
                }
            },
            Err(e) => {
                self.done = true;
                Some(Err(Error::io(format!("cannot read {}", self.context), e)))
            }
        }
    }
}

struct BinarySink {
    writer: Option<FileWriter>,
    context: String,
}

impl<T: Record> RecordSink<T> for BinarySink {

    fn write(&mut self, record: T) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => Ok(bincode::serialize_into(writer, &record)?),
            None => Err(Error::format(self.context.clone(), "write after close")),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish().map_err(|e| Error::io(format!("cannot finish {}", self.context), e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// tab separated text

/// Records with a tab separated text form.
pub trait TsvRecord: Sized {
    fn to_fields(&self) -> Vec<String>;
    fn from_fields(fields: &[&str]) -> std::result::Result<Self, String>;
}

fn parse_field<F: std::str::FromStr>(fields: &[&str], i: usize, name: &str) -> std::result::Result<F, String> {
    let field = fields.get(i).ok_or_else(|| format!("missing {} column", name))?;
    field.trim().parse::<F>().map_err(|_| format!("cannot parse {} from \"{}\"", name, field))
}

impl TsvRecord for Token {
    fn to_fields(&self) -> Vec<String> {
        vec![self.id.to_string()]
    }
    fn from_fields(fields: &[&str]) -> std::result::Result<Self, String> {
        Ok(Token::new(parse_field(fields, 0, "id")?))
    }
}

impl TsvRecord for TokenPair {
    fn to_fields(&self) -> Vec<String> {
        vec![self.id1.to_string(), self.id2.to_string()]
    }
    fn from_fields(fields: &[&str]) -> std::result::Result<Self, String> {
        Ok(TokenPair::new(parse_field(fields, 0, "id1")?, parse_field(fields, 1, "id2")?))
    }
}

impl<T: TsvRecord> TsvRecord for Weighted<T> {
    fn to_fields(&self) -> Vec<String> {
        let mut fields = self.record.to_fields();
        fields.push(self.weight.to_string());
        fields
    }
    fn from_fields(fields: &[&str]) -> std::result::Result<Self, String> {
        let (weight, head) = fields.split_last().ok_or_else(|| String::from("empty line"))?;
        let record = T::from_fields(head)?;
        let weight: f64 = weight.trim().parse().map_err(|_| format!("cannot parse weight from \"{}\"", weight))?;
        Ok(Weighted::new(record, weight))
    }
}

pub struct TsvCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TsvCodec<T> {
    pub fn new() -> TsvCodec<T> {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for TsvCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TsvRecord + Send + 'static> RecordCodec<T> for TsvCodec<T> {

    fn open_source(&self, path: &Path) -> Result<RecordSource<T>> {
        let reader = open_reader(path)?;
        let context = path.display().to_string();
        let records = reader.lines().enumerate().filter_map(move |(i, line)| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::io(format!("cannot read {}", context), e))),
            };
            if line.trim().is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            Some(T::from_fields(&fields).map_err(|m| Error::format(format!("{}:{}", context, i + 1), m)))
        });
        Ok(Box::new(records))
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn RecordSink<T>>> {
        let writer = open_writer(path, false)?;
        Ok(Box::new(TsvSink { writer: Some(writer), context: path.display().to_string(), _marker: PhantomData }))
    }

    fn name(&self) -> &'static str {
        "tsv"
    }
}

struct TsvSink<T> {
    writer: Option<FileWriter>,
    context: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: TsvRecord> RecordSink<T> for TsvSink<T> {

    fn write(&mut self, record: T) -> Result<()> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(Error::format(self.context.clone(), "write after close")),
        };
        let line = record.to_fields().join("\t");
        writeln!(writer, "{}", line).map_err(|e| Error::io(format!("cannot write {}", self.context), e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish().map_err(|e| Error::io(format!("cannot finish {}", self.context), e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// in-memory and channel plumbing

/// Collects records in memory, shared so a test or caller can look inside
/// after the producer gave the sink away.
#[derive(Clone, Default)]
pub struct VecSink<T> {
    records: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> VecSink<T> {
    pub fn new() -> VecSink<T> {
        Self { records: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn records(&self) -> Vec<T> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl<T: Send> RecordSink<T> for VecSink<T> {
    fn write(&mut self, record: T) -> Result<()> {
        self.records.lock().map_err(|_| Error::disconnected("vec sink poisoned"))?.push(record);
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Wraps an in-memory vector as a record source.
pub fn vec_source<T: Send + 'static>(records: Vec<T>) -> RecordSource<T> {
    Box::new(records.into_iter().map(Ok))
}

/// Consumer end of a bounded producer/consumer hand-off.
pub fn channel_source<T: Send + 'static>(rx: Receiver<Result<T>>) -> RecordSource<T> {
    Box::new(rx.into_iter())
}

// ---------------------------------------------------------------------------
// temp files

/// Hands out unique temp files to concurrent callers and remembers which ones
/// are still on disk.
pub struct TempFileFactory {
    dir: PathBuf,
    live: Mutex<HashSet<PathBuf>>,
}

impl TempFileFactory {

    pub fn new(dir: Option<&Path>) -> Result<TempFileFactory> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir(),
        };
        fs::create_dir_all(&dir).map_err(|e| Error::io(format!("cannot create temp dir {}", dir.display()), e))?;
        Ok(Self { dir, live: Mutex::new(HashSet::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create_file(&self) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("run-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| Error::io(format!("cannot create temp file in {}", self.dir.display()), e))?;
        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| Error::io("cannot keep temp file", e.error))?;
        if let Ok(mut live) = self.live.lock() {
            live.insert(path.clone());
        }
        Ok(path)
    }

    /// Deletes a temp file this factory handed out.
    pub fn delete(&self, path: &Path) -> Result<()> {
        if let Ok(mut live) = self.live.lock() {
            live.remove(path);
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("cannot delete {}", path.display()), e)),
        }
    }

    /// Forgets a file without deleting it, e.g. after it was moved into place.
    pub fn release(&self, path: &Path) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(path);
        }
    }

    pub fn live_files(&self) -> Vec<PathBuf> {
        self.live.lock().map(|l| l.iter().cloned().collect()).unwrap_or_default()
    }

    /// Removes every temp file still on disk, returns how many went.
    pub fn cleanup(&self) -> usize {
        let files = match self.live.lock() {
            Ok(mut live) => live.drain().collect::<Vec<PathBuf>>(),
            Err(_) => return 0,
        };
        let mut removed = 0;
        for file in files {
            if fs::remove_file(&file).is_ok() {
                removed += 1;
            }
        }
        debug!("removed {} temp files from {}", removed, self.dir.display());
        removed
    }
}

/// Reads a whole file into memory, mainly for small side files.
pub fn read_to_string(path: &Path) -> Result<String> {
    let mut reader = open_reader(path)?;
    let mut buf = String::new();
    reader.read_to_string(&mut buf).map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
    Ok(buf)
}
