//! Segmented, buffered disk streams.
//!
//! A stream is a sequence of segment files `<dir>/<prefix>.NNNNNNNN` written
//! append-only through a page buffer. When a segment reaches its size limit
//! the writer rotates to the next segment number (modulo `max_segments`, so
//! the namespace is circular); the reader follows segment by segment,
//! deleting consumed segments when `delete_on_close` is set. Record
//! begin/end brackets make sure rotation only ever happens between records.
//!
//! Streams can serialize their own cursor state (segment number and byte
//! offset) into the queue-info file, so a disk queue can resume exactly
//! where it stopped.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use crate::serial::{
    self, ObjectId, PropType, Property, RecordType, SerialError,
};

/// Page buffer size for stream I/O.
const IO_BUF_SIZE: usize = 4096;

/// Zero-padded width of segment numbers in file names.
const SEGMENT_NUM_DIGITS: usize = 8;

#[derive(Debug, Snafu)]
pub enum StreamError {
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("end of stream"))]
    Eof,
    #[snafu(display("stream has no file prefix"))]
    FilePrefixMissing,
    #[snafu(display("persisted stream state is incomplete: missing {name}"))]
    BadState { name: &'static str },
}

impl StreamError {
    pub fn is_eof(&self) -> bool {
        matches!(self, StreamError::Eof)
    }
}

/// How segment files are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamType {
    /// One plain file named exactly `<prefix>` (used for the queue-info
    /// file).
    SingleFile = 0,
    /// Numbered segments, wrapping modulo `max_segments`.
    Circular = 1,
}

impl StreamType {
    fn from_wire(v: i64) -> Result<Self, StreamError> {
        match v {
            0 => Ok(StreamType::SingleFile),
            _ => Ok(StreamType::Circular),
        }
    }
}

/// Identity and limits of a stream; shared by readers and writers.
#[derive(Clone, Debug)]
pub struct StreamSpec {
    pub dir: PathBuf,
    pub prefix: String,
    pub stream_type: StreamType,
    /// Segment-number namespace size; 0 disables rotation on read.
    pub max_segments: u32,
    pub max_segment_size: u64,
}

impl StreamSpec {
    fn file_name(&self, seg_num: u32) -> PathBuf {
        match self.stream_type {
            StreamType::SingleFile => self.dir.join(&self.prefix),
            StreamType::Circular => self
                .dir
                .join(format!("{}.{:0width$}", self.prefix, seg_num, width = SEGMENT_NUM_DIGITS)),
        }
    }
}

/// Persistable cursor state of a stream.
///
/// Property names follow the on-disk format and must not change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamState {
    pub seg_num: u32,
    pub prefix: String,
    pub max_segments: u32,
    pub delete_on_close: bool,
    pub stream_type: StreamType,
    /// 1 = read, 2 = write.
    pub mode: u8,
    pub open_mode: u32,
    pub offset: u64,
}

impl StreamState {
    /// Writes this state as one `strm` object record.
    pub fn serialize(&self, out: &mut StreamWriter) -> Result<(), SerialError> {
        serial::begin_record(out, RecordType::Object, ObjectId::Stream, 1)?;
        serial::write_prop_num(out, "iCurrFNum", PropType::Int, i64::from(self.seg_num))?;
        serial::write_prop_str(out, "pszFName", self.prefix.as_bytes())?;
        serial::write_prop_num(out, "iMaxFiles", PropType::Int, i64::from(self.max_segments))?;
        serial::write_prop_num(
            out,
            "bDeleteOnClose",
            PropType::Int,
            i64::from(self.delete_on_close),
        )?;
        serial::write_prop_num(out, "sType", PropType::Int, self.stream_type as i64)?;
        serial::write_prop_num(out, "tOperationsMode", PropType::Int, i64::from(self.mode))?;
        serial::write_prop_num(out, "tOpenMode", PropType::Int, i64::from(self.open_mode))?;
        serial::write_prop_num(out, "iCurrOffs", PropType::Long, self.offset as i64)?;
        serial::end_record(out)?;
        Ok(())
    }

    /// Rebuilds state from the properties of one `strm` record.
    pub fn from_properties(props: &[Property]) -> Result<Self, StreamError> {
        fn num(props: &[Property], name: &'static str) -> Result<i64, StreamError> {
            props
                .iter()
                .find(|p| p.name == name)
                .and_then(|p| p.value.as_num())
                .ok_or(StreamError::BadState { name })
        }
        let prefix = props
            .iter()
            .find(|p| p.name == "pszFName")
            .and_then(|p| p.value.as_bytes())
            .ok_or(StreamError::BadState { name: "pszFName" })?;
        Ok(StreamState {
            seg_num: num(props, "iCurrFNum")? as u32,
            prefix: String::from_utf8_lossy(prefix).into_owned(),
            max_segments: num(props, "iMaxFiles")? as u32,
            delete_on_close: num(props, "bDeleteOnClose")? != 0,
            stream_type: StreamType::from_wire(num(props, "sType")?)?,
            mode: num(props, "tOperationsMode")? as u8,
            open_mode: num(props, "tOpenMode")? as u32,
            offset: num(props, "iCurrOffs")? as u64,
        })
    }
}

/* -------------------------------- writer -------------------------------- */

/// Buffered writer half of a stream.
#[derive(Debug)]
pub struct StreamWriter {
    spec: StreamSpec,
    seg_num: u32,
    offset: u64,
    buf: Vec<u8>,
    file: Option<File>,
    in_record: bool,
}

impl StreamWriter {
    /// Creates a fresh stream starting at segment 1, offset 0. A stale file
    /// under the same name is truncated.
    pub fn create(spec: StreamSpec) -> Result<Self, StreamError> {
        let mut this = StreamWriter {
            spec,
            seg_num: 1,
            offset: 0,
            buf: Vec::with_capacity(IO_BUF_SIZE),
            file: None,
            in_record: false,
        };
        this.open_file()?;
        Ok(this)
    }

    /// Reopens a stream at a persisted cursor position.
    pub fn from_state(dir: &Path, state: &StreamState, max_segment_size: u64) -> Result<Self, StreamError> {
        let spec = StreamSpec {
            dir: dir.to_path_buf(),
            prefix: state.prefix.clone(),
            stream_type: state.stream_type,
            max_segments: state.max_segments,
            max_segment_size,
        };
        let mut this = StreamWriter {
            spec,
            seg_num: state.seg_num,
            offset: state.offset,
            buf: Vec::with_capacity(IO_BUF_SIZE),
            file: None,
            in_record: false,
        };
        this.seek_current()?;
        Ok(this)
    }

    pub fn state(&self) -> StreamState {
        StreamState {
            seg_num: self.seg_num,
            prefix: self.spec.prefix.clone(),
            max_segments: self.spec.max_segments,
            delete_on_close: false,
            stream_type: self.spec.stream_type,
            mode: 2,
            open_mode: 0o600,
            offset: self.offset,
        }
    }

    fn current_path(&self) -> PathBuf {
        self.spec.file_name(self.seg_num)
    }

    fn open_file(&mut self) -> Result<(), StreamError> {
        if self.file.is_some() {
            return Ok(());
        }
        let path = self.current_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(self.offset == 0)
            .open(&path)
            .context(IoSnafu { path: path.clone() })?;
        trace!(path = %path.display(), "opened segment for write");
        self.file = Some(file);
        Ok(())
    }

    /// Flushes pending writes, then repositions the file cursor at the
    /// stream's current offset.
    fn seek_current(&mut self) -> Result<(), StreamError> {
        self.open_file()?;
        let path = self.current_path();
        let file = self.file.as_mut().expect("file opened above");
        file.seek(SeekFrom::Start(self.offset))
            .context(IoSnafu { path })?;
        Ok(())
    }

    fn write_page(&mut self) -> Result<(), StreamError> {
        self.open_file()?;
        let path = self.current_path();
        let file = self.file.as_mut().expect("file opened above");
        file.write_all(&self.buf).context(IoSnafu { path })?;
        self.offset += self.buf.len() as u64;
        self.buf.clear();
        if self.spec.stream_type == StreamType::Circular && !self.in_record {
            self.check_next_segment()?;
        }
        Ok(())
    }

    fn check_next_segment(&mut self) -> Result<(), StreamError> {
        if self.offset >= self.spec.max_segment_size && self.spec.max_segments != 0 {
            debug!(
                segment = self.seg_num,
                offset = self.offset,
                "segment size limit reached, rotating"
            );
            self.file = None;
            self.seg_num = (self.seg_num + 1) % self.spec.max_segments;
            self.offset = 0;
        }
        Ok(())
    }

    pub fn write_byte(&mut self, c: u8) -> Result<(), StreamError> {
        if self.buf.len() == IO_BUF_SIZE {
            self.write_page()?;
        }
        self.buf.push(c);
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        for &c in data {
            self.write_byte(c)?;
        }
        Ok(())
    }

    /// Writes a decimal integer in ASCII.
    pub fn write_long(&mut self, val: i64) -> Result<(), StreamError> {
        let buf = val.to_string();
        self.write_all(buf.as_bytes())
    }

    /// Marks the start of a record; rotation is suppressed until the
    /// matching [`record_end`](Self::record_end).
    pub fn record_begin(&mut self) {
        debug_assert!(!self.in_record);
        self.in_record = true;
    }

    /// Marks the end of a record and rotates the segment if it is over its
    /// size limit.
    pub fn record_end(&mut self) -> Result<(), StreamError> {
        debug_assert!(self.in_record);
        self.in_record = false;
        if self.spec.stream_type == StreamType::Circular {
            self.check_next_segment()?;
        }
        Ok(())
    }

    /// Writes the page even if it is only partially filled.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if !self.buf.is_empty() {
            self.write_page()?;
        }
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "failed to flush stream on drop");
        }
    }
}

/* -------------------------------- reader -------------------------------- */

/// Buffered reader half of a stream, with one character of lookahead.
#[derive(Debug)]
pub struct StreamReader {
    spec: StreamSpec,
    seg_num: u32,
    offset: u64,
    buf: Vec<u8>,
    buf_pos: usize,
    unget: Option<u8>,
    file: Option<File>,
    delete_on_close: bool,
}

impl StreamReader {
    /// Opens a fresh reader at segment 1, offset 0.
    pub fn open(spec: StreamSpec, delete_on_close: bool) -> Result<Self, StreamError> {
        Ok(StreamReader {
            spec,
            seg_num: 1,
            offset: 0,
            buf: Vec::new(),
            buf_pos: 0,
            unget: None,
            file: None,
            delete_on_close,
        })
    }

    /// Reopens a reader at a persisted cursor position.
    pub fn from_state(dir: &Path, state: &StreamState, max_segment_size: u64) -> Result<Self, StreamError> {
        let spec = StreamSpec {
            dir: dir.to_path_buf(),
            prefix: state.prefix.clone(),
            stream_type: state.stream_type,
            max_segments: state.max_segments,
            max_segment_size,
        };
        let mut this = StreamReader {
            spec,
            seg_num: state.seg_num,
            offset: state.offset,
            buf: Vec::new(),
            buf_pos: 0,
            unget: None,
            file: None,
            delete_on_close: state.delete_on_close,
        };
        this.seek_current()?;
        Ok(this)
    }

    pub fn state(&self) -> StreamState {
        StreamState {
            seg_num: self.seg_num,
            prefix: self.spec.prefix.clone(),
            max_segments: self.spec.max_segments,
            delete_on_close: self.delete_on_close,
            stream_type: self.spec.stream_type,
            mode: 1,
            open_mode: 0o600,
            offset: self.offset,
        }
    }

    pub fn set_delete_on_close(&mut self, on: bool) {
        self.delete_on_close = on;
    }

    fn current_path(&self) -> PathBuf {
        self.spec.file_name(self.seg_num)
    }

    /// Repositions the OS cursor at the stream offset and invalidates the
    /// read buffer.
    fn seek_current(&mut self) -> Result<(), StreamError> {
        let path = self.current_path();
        let mut file = File::open(&path).context(IoSnafu { path: path.clone() })?;
        file.seek(SeekFrom::Start(self.offset))
            .context(IoSnafu { path })?;
        self.file = Some(file);
        self.buf.clear();
        self.buf_pos = 0;
        self.unget = None;
        Ok(())
    }

    fn close_segment(&mut self) {
        self.file = None;
        if self.delete_on_close {
            let path = self.current_path();
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "could not remove consumed segment");
            } else {
                trace!(path = %path.display(), "removed consumed segment");
            }
        }
    }

    fn refill(&mut self) -> Result<(), StreamError> {
        loop {
            if self.file.is_none() {
                let path = self.current_path();
                match File::open(&path) {
                    Ok(f) => self.file = Some(f),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // The segment was never written: genuine end of
                        // store, not damage.
                        return Err(StreamError::Eof);
                    }
                    Err(e) => return Err(StreamError::Io { path, source: e }),
                }
            }
            let path = self.current_path();
            self.buf.resize(IO_BUF_SIZE, 0);
            let n = self
                .file
                .as_mut()
                .expect("file opened above")
                .read(&mut self.buf)
                .context(IoSnafu { path })?;
            if n == 0 {
                if self.spec.max_segments == 0 || self.spec.stream_type == StreamType::SingleFile {
                    return Err(StreamError::Eof);
                }
                // Multiple segments: advance to the next one.
                self.close_segment();
                self.seg_num = (self.seg_num + 1) % self.spec.max_segments;
                self.offset = 0;
                continue;
            }
            self.buf.truncate(n);
            self.buf_pos = 0;
            return Ok(());
        }
    }

    /// Reads one byte, refilling the page buffer and advancing segments as
    /// needed.
    pub fn read_byte(&mut self) -> Result<u8, StreamError> {
        if let Some(c) = self.unget.take() {
            self.offset += 1;
            return Ok(c);
        }
        if self.buf_pos >= self.buf.len() {
            self.refill()?;
        }
        let c = self.buf[self.buf_pos];
        self.buf_pos += 1;
        self.offset += 1;
        Ok(c)
    }

    /// Buffers one byte for the next read. Only a single byte of lookahead
    /// is supported; a second unread without an intervening read is a logic
    /// error.
    pub fn unread_byte(&mut self, c: u8) {
        debug_assert!(self.unget.is_none());
        self.unget = Some(c);
        self.offset -= 1;
    }

    /// Closes the reader, honoring `delete_on_close` for the current
    /// segment.
    pub fn close(mut self) {
        if self.file.is_some() || self.delete_on_close {
            self.close_segment();
        }
        self.delete_on_close = false;
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if self.delete_on_close {
            self.close_segment();
        }
    }
}
