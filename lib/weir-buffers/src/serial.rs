//! Framed text records for on-disk persistence.
//!
//! Every object spilled to disk (queued messages, the queue-info record, the
//! stream cursors themselves) is written as one record:
//!
//! ```text
//! '<' <RecType:3> ':' '1' ':' <ObjId> ':' <Version> ':' <ClassName> ':' '\n'
//! ( '+' <PropName> ':' <TypeCode> ':' <ByteLen> ':' <RawBytes> ':' '\n' )*
//! '>' "End" '\n' '.' '\n'
//! ```
//!
//! `RecType` is `Obj` for a constructible object and `OPB` for a property bag
//! that only updates an existing object. A reader that finds damaged framing
//! enters resync: it skips forward until a newline followed by `<`, pushes
//! the `<` back, and retries the header.

use snafu::Snafu;

use crate::stream::{StreamError, StreamReader, StreamWriter};

pub const COOKIE_OBJLINE: u8 = b'<';
pub const COOKIE_PROPLINE: u8 = b'+';
pub const COOKIE_ENDLINE: u8 = b'>';
pub const COOKIE_BLANKLINE: u8 = b'.';

/// Serializer format version, fixed at `1`.
const SERIAL_VERSION: u8 = b'1';

#[derive(Debug, Snafu)]
pub enum SerialError {
    #[snafu(display("invalid record header"))]
    InvalidHeader,
    #[snafu(display("invalid record type in header"))]
    InvalidHeaderRecType,
    #[snafu(display("unsupported serializer version in header"))]
    InvalidHeaderVers,
    #[snafu(display("invalid object id {id}"))]
    InvalidObjectId { id: i64 },
    #[snafu(display("invalid field delimiter"))]
    InvalidDelimiter,
    #[snafu(display("invalid property framing"))]
    InvalidPropFrame,
    #[snafu(display("invalid record trailer"))]
    InvalidTrailer,
    #[snafu(display("property arrived out of sequence: {name}"))]
    SequenceError { name: String },
    #[snafu(context(false))]
    Stream { source: StreamError },
}

impl SerialError {
    /// True for end-of-store, which callers usually treat as "no more
    /// records" rather than damage.
    pub fn is_eof(&self) -> bool {
        matches!(self, SerialError::Stream { source } if source.is_eof())
    }
}

/// Record type tag, always exactly three octets on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    /// A record carrying everything needed to construct the object.
    Object,
    /// A property bag: a subset of properties updating an existing object.
    PropBag,
}

impl RecordType {
    fn tag(self) -> &'static [u8; 3] {
        match self {
            RecordType::Object => b"Obj",
            RecordType::PropBag => b"OPB",
        }
    }
}

/// Registry of persistable object types.
///
/// The numeric id only exists inside record headers, so that a reader can
/// check it is reconstructing the kind of object it expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectId {
    Msg = 1,
    Stream = 2,
    Queue = 3,
}

impl ObjectId {
    pub fn class_name(self) -> &'static str {
        match self {
            ObjectId::Msg => "msg",
            ObjectId::Stream => "strm",
            ObjectId::Queue => "queue",
        }
    }

    fn from_wire(id: i64) -> Result<Self, SerialError> {
        match id {
            1 => Ok(ObjectId::Msg),
            2 => Ok(ObjectId::Stream),
            3 => Ok(ObjectId::Queue),
            other => Err(SerialError::InvalidObjectId { id: other }),
        }
    }
}

/// Wire type codes for property values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropType {
    Psz = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    CStr = 5,
    SyslogTime = 6,
}

impl PropType {
    fn from_wire(v: i64) -> Result<Self, SerialError> {
        match v {
            1 => Ok(PropType::Psz),
            2 => Ok(PropType::Short),
            3 => Ok(PropType::Int),
            4 => Ok(PropType::Long),
            5 => Ok(PropType::CStr),
            6 => Ok(PropType::SyslogTime),
            _ => Err(SerialError::InvalidPropFrame),
        }
    }
}

/// The twelve-field timestamp carried by syslog messages.
///
/// This is the wire representation (type code 6): colon-separated decimal
/// fields with a literal `+`/`-` octet for the offset direction. It keeps
/// the fractional-second precision of the original record, which a plain
/// calendar type cannot carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyslogTime {
    /// 1 = wall-clock time with timezone offset, 2 = UTC-normalized.
    pub time_type: i32,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    /// Fractional seconds as an integer, interpreted per `secfrac_precision`
    /// decimal digits.
    pub secfrac: u32,
    pub secfrac_precision: u8,
    /// `b'+'` or `b'-'`.
    pub offset_mode: u8,
    pub offset_hour: u32,
    pub offset_minute: u32,
}

impl Default for SyslogTime {
    fn default() -> Self {
        SyslogTime {
            time_type: 1,
            year: 1970,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            secfrac: 0,
            secfrac_precision: 0,
            offset_mode: b'+',
            offset_hour: 0,
            offset_minute: 0,
        }
    }
}

/// A parsed record header.
#[derive(Debug)]
pub struct RecordHeader {
    pub rec_type: RecordType,
    pub object_id: ObjectId,
    pub version: i64,
}

/// A decoded property value.
#[derive(Debug, Clone)]
pub enum PropValue {
    Str(Vec<u8>),
    Num(i64),
    Time(SyslogTime),
}

impl PropValue {
    pub fn as_num(&self) -> Option<i64> {
        match self {
            PropValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropValue::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<&SyslogTime> {
        match self {
            PropValue::Time(t) => Some(t),
            _ => None,
        }
    }
}

/// One decoded property line.
#[derive(Debug)]
pub struct Property {
    pub name: String,
    pub value: PropValue,
}

/* ---------------------------- serialization ---------------------------- */

/// Begins a record: bracket marker plus header line.
pub fn begin_record(
    strm: &mut StreamWriter,
    rec_type: RecordType,
    id: ObjectId,
    version: u32,
) -> Result<(), SerialError> {
    strm.record_begin();
    strm.write_byte(COOKIE_OBJLINE)?;
    strm.write_all(rec_type.tag())?;
    strm.write_byte(b':')?;
    strm.write_byte(SERIAL_VERSION)?;
    strm.write_byte(b':')?;
    strm.write_long(id as i64)?;
    strm.write_byte(b':')?;
    strm.write_long(i64::from(version))?;
    // The class name is for human readers only and is skipped on read.
    strm.write_byte(b':')?;
    strm.write_all(id.class_name().as_bytes())?;
    strm.write_byte(b':')?;
    strm.write_byte(b'\n')?;
    Ok(())
}

fn write_prop_raw(
    strm: &mut StreamWriter,
    name: &str,
    prop_type: PropType,
    payload: &[u8],
) -> Result<(), SerialError> {
    strm.write_byte(COOKIE_PROPLINE)?;
    strm.write_all(name.as_bytes())?;
    strm.write_byte(b':')?;
    strm.write_long(prop_type as i64)?;
    strm.write_byte(b':')?;
    strm.write_long(payload.len() as i64)?;
    strm.write_byte(b':')?;
    strm.write_all(payload)?;
    strm.write_byte(b':')?;
    strm.write_byte(b'\n')?;
    Ok(())
}

/// Appends a string property (type `PSZ`).
pub fn write_prop_str(strm: &mut StreamWriter, name: &str, val: &[u8]) -> Result<(), SerialError> {
    write_prop_raw(strm, name, PropType::Psz, val)
}

/// Appends a counted-string property (type `CSTR`).
pub fn write_prop_cstr(strm: &mut StreamWriter, name: &str, val: &[u8]) -> Result<(), SerialError> {
    write_prop_raw(strm, name, PropType::CStr, val)
}

/// Appends an integer property with the given width tag.
pub fn write_prop_num(
    strm: &mut StreamWriter,
    name: &str,
    prop_type: PropType,
    val: i64,
) -> Result<(), SerialError> {
    debug_assert!(matches!(
        prop_type,
        PropType::Short | PropType::Int | PropType::Long
    ));
    let buf = val.to_string();
    write_prop_raw(strm, name, prop_type, buf.as_bytes())
}

/// Appends a timestamp property (type `SYSLOGTIME`).
pub fn write_prop_time(
    strm: &mut StreamWriter,
    name: &str,
    t: &SyslogTime,
) -> Result<(), SerialError> {
    let buf = format!(
        "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
        t.time_type,
        t.year,
        t.month,
        t.day,
        t.hour,
        t.minute,
        t.second,
        t.secfrac,
        t.secfrac_precision,
        t.offset_mode as char,
        t.offset_hour,
        t.offset_minute
    );
    write_prop_raw(strm, name, PropType::SyslogTime, buf.as_bytes())
}

/// Ends a record: trailer lines plus rotation checkpoint.
pub fn end_record(strm: &mut StreamWriter) -> Result<(), SerialError> {
    strm.write_byte(COOKIE_ENDLINE)?;
    strm.write_all(b"End\n")?;
    strm.write_byte(COOKIE_BLANKLINE)?;
    strm.write_byte(b'\n')?;
    strm.record_end()?;
    Ok(())
}

/* --------------------------- deserialization --------------------------- */

/// Reads a signed decimal terminated by `:`.
fn read_long(strm: &mut StreamReader) -> Result<i64, SerialError> {
    let mut c = strm.read_byte()?;
    let negative = if c == b'-' {
        c = strm.read_byte()?;
        true
    } else {
        false
    };
    let mut val: i64 = 0;
    let mut seen = false;
    while c.is_ascii_digit() {
        val = val * 10 + i64::from(c - b'0');
        seen = true;
        c = strm.read_byte()?;
    }
    if !seen || c != b':' {
        return Err(SerialError::InvalidDelimiter);
    }
    Ok(if negative { -val } else { val })
}

/// Reads exactly `len` payload octets followed by the `:` terminator.
fn read_str(strm: &mut StreamReader, len: usize) -> Result<Vec<u8>, SerialError> {
    let mut buf = Vec::with_capacity(len);
    for _ in 0..len {
        buf.push(strm.read_byte()?);
    }
    if strm.read_byte()? != b':' {
        return Err(SerialError::InvalidDelimiter);
    }
    Ok(buf)
}

fn read_time(strm: &mut StreamReader) -> Result<SyslogTime, SerialError> {
    let mut t = SyslogTime {
        time_type: read_long(strm)? as i32,
        year: read_long(strm)? as i32,
        month: read_long(strm)? as u32,
        day: read_long(strm)? as u32,
        hour: read_long(strm)? as u32,
        minute: read_long(strm)? as u32,
        second: read_long(strm)? as u32,
        secfrac: read_long(strm)? as u32,
        secfrac_precision: read_long(strm)? as u8,
        ..SyslogTime::default()
    };
    // The offset direction is a single literal octet, not a number.
    t.offset_mode = strm.read_byte()?;
    if strm.read_byte()? != b':' {
        return Err(SerialError::InvalidDelimiter);
    }
    t.offset_hour = read_long(strm)? as u32;
    t.offset_minute = read_long(strm)? as u32;
    Ok(t)
}

/// Parses a record header. The caller must be positioned at the `<` cookie.
pub fn read_header(
    strm: &mut StreamReader,
    expected: RecordType,
) -> Result<RecordHeader, SerialError> {
    if strm.read_byte()? != COOKIE_OBJLINE {
        return Err(SerialError::InvalidHeader);
    }
    let tag = expected.tag();
    for &want in tag.iter() {
        if strm.read_byte()? != want {
            return Err(SerialError::InvalidHeaderRecType);
        }
    }
    if strm.read_byte()? != b':' {
        return Err(SerialError::InvalidHeader);
    }
    if strm.read_byte()? != SERIAL_VERSION {
        return Err(SerialError::InvalidHeaderVers);
    }
    if strm.read_byte()? != b':' {
        return Err(SerialError::InvalidHeaderVers);
    }
    let object_id = ObjectId::from_wire(read_long(strm)?)?;
    let version = read_long(strm)?;
    // Skip the class name up to the delimiting newline.
    loop {
        if strm.read_byte()? == b'\n' {
            break;
        }
    }
    Ok(RecordHeader {
        rec_type: expected,
        object_id,
        version,
    })
}

/// Parses the next property line, or returns `None` when the trailer cookie
/// is reached (the cookie is pushed back for [`read_trailer`]).
pub fn next_property(strm: &mut StreamReader) -> Result<Option<Property>, SerialError> {
    let c = strm.read_byte()?;
    if c != COOKIE_PROPLINE {
        strm.unread_byte(c);
        return Ok(None);
    }

    let mut name = Vec::new();
    let mut c = strm.read_byte()?;
    while c != b':' {
        name.push(c);
        c = strm.read_byte()?;
    }
    let name = String::from_utf8_lossy(&name).into_owned();

    let prop_type = PropType::from_wire(read_long(strm)?)?;
    let len = read_long(strm)?;
    if len < 0 {
        return Err(SerialError::InvalidPropFrame);
    }

    let value = match prop_type {
        PropType::Psz | PropType::CStr => PropValue::Str(read_str(strm, len as usize)?),
        PropType::Short | PropType::Int | PropType::Long => PropValue::Num(read_long(strm)?),
        PropType::SyslogTime => PropValue::Time(read_time(strm)?),
    };

    if strm.read_byte()? != b'\n' {
        return Err(SerialError::InvalidPropFrame);
    }
    Ok(Some(Property { name, value }))
}

/// Verifies the `>End\n.\n` trailer.
pub fn read_trailer(strm: &mut StreamReader) -> Result<(), SerialError> {
    for &want in b">End\n.\n".iter() {
        if strm.read_byte()? != want {
            return Err(SerialError::InvalidTrailer);
        }
    }
    Ok(())
}

/// Resynchronizes a damaged store: skips until a newline immediately
/// followed by the object cookie, then pushes the cookie back. End of store
/// surfaces as the underlying EOF error.
pub fn try_recover(strm: &mut StreamReader) -> Result<(), SerialError> {
    let mut was_nl = false;
    loop {
        let c = strm.read_byte()?;
        if c == b'\n' {
            was_nl = true;
        } else if was_nl && c == COOKIE_OBJLINE {
            strm.unread_byte(c);
            debug!("deserializer resynced on object cookie");
            return Ok(());
        } else {
            was_nl = false;
        }
    }
}

/// Reads a record header, resyncing over damaged framing until a readable
/// header or end of store is found.
pub fn read_header_recovering(
    strm: &mut StreamReader,
    expected: RecordType,
) -> Result<RecordHeader, SerialError> {
    loop {
        match read_header(strm, expected) {
            Ok(hdr) => return Ok(hdr),
            Err(e) if e.is_eof() => return Err(e),
            Err(e) => {
                debug!(error = %e, "record header damaged, trying to resync");
                try_recover(strm)?;
            }
        }
    }
}

/// Collects all properties of the current record and checks the trailer.
pub fn read_properties(strm: &mut StreamReader) -> Result<Vec<Property>, SerialError> {
    let mut props = Vec::new();
    while let Some(prop) = next_property(strm)? {
        props.push(prop);
    }
    read_trailer(strm)?;
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamSpec, StreamType};
    use tempfile::TempDir;

    fn specs(dir: &TempDir) -> StreamSpec {
        StreamSpec {
            dir: dir.path().to_path_buf(),
            prefix: "rec".into(),
            stream_type: StreamType::Circular,
            max_segments: 100,
            max_segment_size: 1024 * 1024,
        }
    }

    #[test]
    fn record_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut w = StreamWriter::create(specs(&dir)).unwrap();
        begin_record(&mut w, RecordType::Object, ObjectId::Msg, 1).unwrap();
        write_prop_num(&mut w, "iSeverity", PropType::Short, 5).unwrap();
        write_prop_str(&mut w, "pszRawMsg", b"<13>hello world").unwrap();
        let t = SyslogTime {
            year: 2024,
            month: 10,
            day: 11,
            hour: 22,
            minute: 14,
            second: 15,
            secfrac: 3,
            secfrac_precision: 1,
            offset_mode: b'-',
            offset_hour: 5,
            offset_minute: 30,
            ..SyslogTime::default()
        };
        write_prop_time(&mut w, "tTIMESTAMP", &t).unwrap();
        end_record(&mut w).unwrap();
        w.flush().unwrap();

        let mut r = StreamReader::open(specs(&dir), false).unwrap();
        let hdr = read_header(&mut r, RecordType::Object).unwrap();
        assert_eq!(hdr.object_id, ObjectId::Msg);
        let props = read_properties(&mut r).unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].name, "iSeverity");
        assert_eq!(props[0].value.as_num(), Some(5));
        assert_eq!(props[1].value.as_bytes(), Some(&b"<13>hello world"[..]));
        assert_eq!(props[2].value.as_time(), Some(&t));
    }

    #[test]
    fn payload_may_contain_delimiters() {
        let dir = TempDir::new().unwrap();
        let mut w = StreamWriter::create(specs(&dir)).unwrap();
        begin_record(&mut w, RecordType::PropBag, ObjectId::Queue, 1).unwrap();
        write_prop_str(&mut w, "raw", b"colons:and\nnewlines:+<>.").unwrap();
        end_record(&mut w).unwrap();
        w.flush().unwrap();

        let mut r = StreamReader::open(specs(&dir), false).unwrap();
        read_header(&mut r, RecordType::PropBag).unwrap();
        let props = read_properties(&mut r).unwrap();
        assert_eq!(props[0].value.as_bytes(), Some(&b"colons:and\nnewlines:+<>."[..]));
    }

    #[test]
    fn resync_skips_garbage_between_records() {
        let dir = TempDir::new().unwrap();
        let mut w = StreamWriter::create(specs(&dir)).unwrap();
        w.write_all(b"####damaged prefix####\n").unwrap();
        begin_record(&mut w, RecordType::Object, ObjectId::Msg, 1).unwrap();
        write_prop_num(&mut w, "iFacility", PropType::Short, 4).unwrap();
        end_record(&mut w).unwrap();
        w.flush().unwrap();

        let mut r = StreamReader::open(specs(&dir), false).unwrap();
        let hdr = read_header_recovering(&mut r, RecordType::Object).unwrap();
        assert_eq!(hdr.object_id, ObjectId::Msg);
        let props = read_properties(&mut r).unwrap();
        assert_eq!(props[0].value.as_num(), Some(4));
    }

    #[test]
    fn eof_is_distinguished_from_damage() {
        let dir = TempDir::new().unwrap();
        let w = StreamWriter::create(specs(&dir)).unwrap();
        drop(w);

        let mut r = StreamReader::open(specs(&dir), false).unwrap();
        let err = read_header_recovering(&mut r, RecordType::Object).unwrap_err();
        assert!(err.is_eof());
    }

    mod arbitrary {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Property payloads are length-framed, so any byte content
            // (including cookies, colons, and newlines) must round-trip.
            #[test]
            fn any_payload_round_trips(
                payload in prop::collection::vec(any::<u8>(), 0..512),
                num in any::<i64>(),
            ) {
                let dir = TempDir::new().unwrap();
                let mut w = StreamWriter::create(specs(&dir)).unwrap();
                begin_record(&mut w, RecordType::Object, ObjectId::Msg, 1).unwrap();
                write_prop_str(&mut w, "pszRawMsg", &payload).unwrap();
                write_prop_num(&mut w, "offMSG", PropType::Long, num).unwrap();
                end_record(&mut w).unwrap();
                w.flush().unwrap();

                let mut r = StreamReader::open(specs(&dir), false).unwrap();
                read_header(&mut r, RecordType::Object).unwrap();
                let props = read_properties(&mut r).unwrap();
                prop_assert_eq!(props[0].value.as_bytes(), Some(&payload[..]));
                prop_assert_eq!(props[1].value.as_num(), Some(num));
            }
        }
    }
}
