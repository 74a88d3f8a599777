//! The message object.
//!
//! A [`Message`] owns one log record: the raw buffer as received, the parse
//! cursors into it, the scalar header fields filled in by the parser chain,
//! a JSON property tree, and a set of lazily rendered views (formatted
//! timestamps, the program name, a UUID). Mutation happens while the
//! message is still exclusively owned; once wrapped in a [`MsgRef`] and
//! shared across action queues it is read-only by construction, with only
//! the caches remaining interior-mutable behind their own lock.

mod serialize;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use snafu::Snafu;
use uuid::Uuid;

use crate::datetime::{self, SyslogTime};
use crate::json::{self, JsonError};
use crate::pri::{facility_name, severity_name, Pri};
use crate::template::TemplateEntry;

/// Message state flags, set by listeners and parsers.
pub mod flags {
    /// The hostname must be parsed out of the record.
    pub const PARSE_HOSTNAME: u32 = 0x01;
    /// Ignore any timestamp in the record; keep the reception time.
    pub const IGNORE_DATE: u32 = 0x02;
    /// The peer address still needs reverse resolution.
    pub const NEEDS_DNS_RESOLUTION: u32 = 0x04;
    /// Internally generated record (never hostname-parsed).
    pub const INTERNAL: u32 = 0x08;
    /// The record carried no parseable header.
    pub const HEADERLESS: u32 = 0x10;
}

#[derive(Debug, Snafu)]
pub enum MsgError {
    #[snafu(display("unknown property: {name}"))]
    InvalidProperty { name: String },
    #[snafu(transparent)]
    Json { source: JsonError },
}

/// Lazily rendered views. All of them derive from fields that invalidate
/// them on mutation.
#[derive(Debug, Default)]
struct Caches {
    program_name: Option<String>,
    uuid: Option<String>,
    rfc3164: Option<String>,
    rfc3339: Option<String>,
    mysql: Option<String>,
    pgsql: Option<String>,
    unixtime: Option<String>,
    secfrac: Option<String>,
}

impl Caches {
    fn invalidate_time(&mut self) {
        self.rfc3164 = None;
        self.rfc3339 = None;
        self.mysql = None;
        self.pgsql = None;
        self.unixtime = None;
        self.secfrac = None;
    }
}

/// One log record in flight.
#[derive(Debug)]
pub struct Message {
    raw: Vec<u8>,
    off_after_pri: usize,
    off_msg: usize,
    protocol_version: u8,
    severity: u8,
    facility: u8,
    flags: u32,
    /// Unix seconds at generation/reception.
    gen_time: i64,
    rcvd_at: SyslogTime,
    reported: SyslogTime,
    hostname: Option<String>,
    tag: Option<String>,
    app_name: Option<String>,
    proc_id: Option<String>,
    msg_id: Option<String>,
    structured_data: Option<String>,
    input_name: Option<String>,
    rcv_from: Option<String>,
    rcv_from_ip: Option<String>,
    ruleset: Option<String>,
    json: Value,
    caches: Mutex<Caches>,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Clone for Message {
    /// Deep copy of scalars and the JSON tree. Caches start cold in the
    /// clone and are recomputed on demand.
    fn clone(&self) -> Self {
        Message {
            raw: self.raw.clone(),
            off_after_pri: self.off_after_pri,
            off_msg: self.off_msg,
            protocol_version: self.protocol_version,
            severity: self.severity,
            facility: self.facility,
            flags: self.flags,
            gen_time: self.gen_time,
            rcvd_at: self.rcvd_at,
            reported: self.reported,
            hostname: self.hostname.clone(),
            tag: self.tag.clone(),
            app_name: self.app_name.clone(),
            proc_id: self.proc_id.clone(),
            msg_id: self.msg_id.clone(),
            structured_data: self.structured_data.clone(),
            input_name: self.input_name.clone(),
            rcv_from: self.rcv_from.clone(),
            rcv_from_ip: self.rcv_from_ip.clone(),
            ruleset: self.ruleset.clone(),
            json: self.json.clone(),
            caches: Mutex::new(Caches::default()),
        }
    }
}

impl Message {
    pub fn new() -> Self {
        let (now, secs) = datetime::now();
        Message::with_time(now, secs)
    }

    /// Constructs with explicit reception time; both timestamps start out
    /// as the reception time until a parser finds one in the record.
    pub fn with_time(rcvd_at: SyslogTime, gen_time: i64) -> Self {
        Message {
            raw: Vec::new(),
            off_after_pri: 0,
            off_msg: 0,
            protocol_version: 0,
            severity: (crate::pri::DEFAULT_PRI & 7) as u8,
            facility: (crate::pri::DEFAULT_PRI >> 3) as u8,
            flags: 0,
            gen_time,
            rcvd_at,
            reported: rcvd_at,
            hostname: None,
            tag: None,
            app_name: None,
            proc_id: None,
            msg_id: None,
            structured_data: None,
            input_name: None,
            rcv_from: None,
            rcv_from_ip: None,
            ruleset: None,
            json: Value::Null,
            caches: Mutex::new(Caches::default()),
        }
    }

    /* ------------------------------ raw buffer ------------------------------ */

    /// Stores the wire bytes. All derived views are invalidated; parse
    /// cursors are clamped into the new buffer.
    pub fn set_raw(&mut self, buf: &[u8]) {
        self.raw = buf.to_vec();
        self.off_after_pri = self.off_after_pri.min(self.raw.len());
        self.off_msg = self.off_msg.max(self.off_after_pri).min(self.raw.len());
        let mut caches = self.caches.lock();
        *caches = Caches::default();
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// In-place access for transform parsers that rewrite the buffer. The
    /// caller is responsible for re-adjusting offsets it has invalidated;
    /// offsets are re-clamped when it returns.
    pub fn with_raw_mut<R>(&mut self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let r = f(&mut self.raw);
        self.off_after_pri = self.off_after_pri.min(self.raw.len());
        self.off_msg = self.off_msg.max(self.off_after_pri).min(self.raw.len());
        self.caches.lock().program_name = None;
        r
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /* ------------------------------- cursors -------------------------------- */

    pub fn set_after_pri_offset(&mut self, off: usize) {
        self.off_after_pri = off.min(self.raw.len());
        if self.off_msg < self.off_after_pri {
            self.off_msg = self.off_after_pri;
        }
    }

    pub fn after_pri_offset(&self) -> usize {
        self.off_after_pri
    }

    /// Sets the start of the free-form message body. An offset equal to
    /// the raw length is legal and yields an empty body.
    pub fn set_msg_offset(&mut self, off: usize) {
        self.off_msg = off.max(self.off_after_pri).min(self.raw.len());
    }

    pub fn msg_offset(&self) -> usize {
        self.off_msg
    }

    pub fn msg_len(&self) -> usize {
        self.raw.len() - self.off_msg
    }

    /// The free-form message body (everything after the parsed header).
    pub fn body(&self) -> &[u8] {
        &self.raw[self.off_msg..]
    }

    /// The record text after the PRI prefix.
    pub fn after_pri(&self) -> &[u8] {
        &self.raw[self.off_after_pri..]
    }

    /* ------------------------------- scalars -------------------------------- */

    pub fn apply_pri(&mut self, pri: Pri) {
        self.facility = pri.facility;
        self.severity = pri.severity;
        self.off_after_pri = pri.length.min(self.raw.len());
        if self.off_msg < self.off_after_pri {
            self.off_msg = self.off_after_pri;
        }
    }

    pub fn severity(&self) -> u8 {
        self.severity
    }

    pub fn set_severity(&mut self, severity: u8) {
        self.severity = severity & 7;
    }

    pub fn facility(&self) -> u8 {
        self.facility
    }

    pub fn set_facility(&mut self, facility: u8) {
        self.facility = facility;
    }

    pub fn pri(&self) -> u16 {
        u16::from(self.facility) * 8 + u16::from(self.severity)
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Only versions 0 (legacy) and 1 (syslog-protocol) exist; anything
    /// else is coerced to 0.
    pub fn set_protocol_version(&mut self, version: u8) {
        if version > 1 {
            debug!(version, "unsupported protocol version, using 0");
            self.protocol_version = 0;
        } else {
            self.protocol_version = version;
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /* ------------------------------ timestamps ------------------------------ */

    pub fn reported_time(&self) -> &SyslogTime {
        &self.reported
    }

    pub fn set_reported_time(&mut self, t: SyslogTime) {
        self.reported = t;
        self.caches.lock().invalidate_time();
    }

    pub fn rcvd_time(&self) -> &SyslogTime {
        &self.rcvd_at
    }

    pub fn set_rcvd_time(&mut self, t: SyslogTime) {
        self.rcvd_at = t;
    }

    pub fn gen_time(&self) -> i64 {
        self.gen_time
    }

    pub fn set_gen_time(&mut self, secs: i64) {
        self.gen_time = secs;
    }

    fn cached<F>(&self, pick: fn(&mut Caches) -> &mut Option<String>, render: F) -> String
    where
        F: FnOnce(&SyslogTime) -> String,
    {
        let mut caches = self.caches.lock();
        let slot = pick(&mut caches);
        if let Some(v) = slot {
            return v.clone();
        }
        let rendered = render(&self.reported);
        *slot = Some(rendered.clone());
        rendered
    }

    pub fn reported_rfc3164(&self) -> String {
        self.cached(|c| &mut c.rfc3164, datetime::format_rfc3164)
    }

    pub fn reported_rfc3339(&self) -> String {
        self.cached(|c| &mut c.rfc3339, datetime::format_rfc3339)
    }

    pub fn reported_mysql(&self) -> String {
        self.cached(|c| &mut c.mysql, datetime::format_mysql)
    }

    pub fn reported_pgsql(&self) -> String {
        self.cached(|c| &mut c.pgsql, datetime::format_pgsql)
    }

    pub fn reported_unixtime(&self) -> String {
        self.cached(|c| &mut c.unixtime, |t| datetime::to_unix_seconds(t).to_string())
    }

    pub fn reported_secfrac(&self) -> String {
        self.cached(|c| &mut c.secfrac, datetime::format_secfrac)
    }

    /* ---------------------------- string fields ----------------------------- */

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
        self.caches.lock().program_name = None;
    }

    pub fn set_app_name(&mut self, app_name: impl Into<String>) {
        self.app_name = Some(app_name.into());
    }

    pub fn set_proc_id(&mut self, proc_id: impl Into<String>) {
        self.proc_id = Some(proc_id.into());
    }

    pub fn msg_id(&self) -> &str {
        self.msg_id.as_deref().unwrap_or("-")
    }

    pub fn set_msg_id(&mut self, msg_id: impl Into<String>) {
        self.msg_id = Some(msg_id.into());
    }

    pub fn structured_data(&self) -> Option<&str> {
        self.structured_data.as_deref()
    }

    pub fn set_structured_data(&mut self, sd: impl Into<String>) {
        self.structured_data = Some(sd.into());
    }

    pub fn input_name(&self) -> Option<&str> {
        self.input_name.as_deref()
    }

    pub fn set_input_name(&mut self, name: impl Into<String>) {
        self.input_name = Some(name.into());
    }

    pub fn rcv_from(&self) -> Option<&str> {
        self.rcv_from.as_deref()
    }

    pub fn set_rcv_from(&mut self, host: impl Into<String>) {
        self.rcv_from = Some(host.into());
    }

    pub fn rcv_from_ip(&self) -> Option<&str> {
        self.rcv_from_ip.as_deref()
    }

    pub fn set_rcv_from_ip(&mut self, ip: impl Into<String>) {
        self.rcv_from_ip = Some(ip.into());
    }

    pub fn ruleset(&self) -> Option<&str> {
        self.ruleset.as_deref()
    }

    pub fn set_ruleset(&mut self, name: impl Into<String>) {
        self.ruleset = Some(name.into());
    }

    /* ----------------------------- derivations ------------------------------ */

    /// The program name: the longest prefix of the tag consisting of
    /// printable characters other than `:`, `[`, and `/`. Cached.
    pub fn program_name(&self) -> String {
        let mut caches = self.caches.lock();
        if let Some(v) = &caches.program_name {
            return v.clone();
        }
        let tag = self.tag.as_deref().unwrap_or("");
        let end = tag
            .bytes()
            .position(|b| {
                (!b.is_ascii_graphic() && b != b' ') || b == b':' || b == b'[' || b == b'/'
            })
            .unwrap_or(tag.len());
        let name = tag[..end].to_string();
        caches.program_name = Some(name.clone());
        name
    }

    /// APPNAME, emulated from the program name for legacy records that
    /// never carried one.
    pub fn app_name(&self) -> String {
        match &self.app_name {
            Some(name) => name.clone(),
            None => self.program_name(),
        }
    }

    /// PROCID, emulated from the `[pid]` part of the tag for legacy
    /// records. Without a closing bracket there is no PROCID; the nil
    /// value `-` is returned.
    pub fn proc_id(&self) -> String {
        if let Some(pid) = &self.proc_id {
            return pid.clone();
        }
        let tag = self.tag.as_deref().unwrap_or("");
        if let Some(open) = tag.find('[') {
            if let Some(close) = tag[open + 1..].find(']') {
                return tag[open + 1..open + 1 + close].to_string();
            }
        }
        "-".to_string()
    }

    /// The message UUID, generated on first request and stable afterwards.
    pub fn uuid(&self) -> String {
        let mut caches = self.caches.lock();
        caches
            .uuid
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    pub(crate) fn uuid_raw(&self) -> Option<String> {
        self.caches.lock().uuid.clone()
    }

    pub(crate) fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.caches.lock().uuid = Some(uuid.into());
    }

    /* ------------------------------ JSON tree ------------------------------- */

    pub fn json(&self) -> &Value {
        &self.json
    }

    /// Merges `val` into the property tree at the dotted path, creating
    /// intermediate objects on demand.
    pub fn add_json(&mut self, path: &str, val: Value) -> Result<(), MsgError> {
        json::set(&mut self.json, path, val)?;
        Ok(())
    }

    /// Removes the value at the dotted path.
    pub fn del_json(&mut self, path: &str) -> Result<(), MsgError> {
        json::del(&mut self.json, path)?;
        Ok(())
    }

    pub fn get_json(&self, path: &str) -> Result<&Value, MsgError> {
        Ok(json::get(&self.json, path)?)
    }

    /* ------------------------------ properties ------------------------------ */

    /// Returns a named property as text, optionally transformed by a
    /// template entry. Never modifies the message (caches aside).
    pub fn get_property(
        &self,
        name: &str,
        entry: Option<&TemplateEntry>,
    ) -> Result<String, MsgError> {
        let value = match name {
            "msg" => String::from_utf8_lossy(self.body()).into_owned(),
            "rawmsg" => String::from_utf8_lossy(&self.raw).into_owned(),
            "rawmsg-after-pri" => String::from_utf8_lossy(self.after_pri()).into_owned(),
            "hostname" | "source" => self
                .hostname
                .as_deref()
                .or(self.rcv_from.as_deref())
                .unwrap_or("[localhost]")
                .to_string(),
            "fromhost" => self.rcv_from.clone().unwrap_or_default(),
            "fromhost-ip" => self.rcv_from_ip.clone().unwrap_or_default(),
            "syslogtag" => self.tag.clone().unwrap_or_default(),
            "programname" => self.program_name(),
            "pri" => self.pri().to_string(),
            "pri-text" => format!(
                "{}.{}",
                facility_name(self.facility),
                severity_name(self.severity)
            ),
            "syslogfacility" => self.facility.to_string(),
            "syslogfacility-text" => facility_name(self.facility).to_string(),
            "syslogseverity" | "syslogpriority" => self.severity.to_string(),
            "syslogseverity-text" | "syslogpriority-text" => {
                severity_name(self.severity).to_string()
            }
            "timereported" | "timestamp" => self.reported_rfc3164(),
            "timereported-rfc3339" => self.reported_rfc3339(),
            "timegenerated" => datetime::format_rfc3164(&self.rcvd_at),
            "app-name" => self.app_name(),
            "procid" => self.proc_id(),
            "msgid" => self.msg_id().to_string(),
            "structured-data" => self.structured_data.clone().unwrap_or_else(|| "-".to_string()),
            "inputname" => self.input_name.clone().unwrap_or_default(),
            "uuid" => self.uuid(),
            path if path.starts_with('!') => match json::get(&self.json, path) {
                Ok(Value::String(s)) => s.clone(),
                Ok(v) => json::to_text(v),
                // Unset properties render as the empty string, like every
                // other absent field.
                Err(JsonError::NotFound { .. }) => String::new(),
                Err(e) => return Err(e.into()),
            },
            _ => {
                return Err(MsgError::InvalidProperty {
                    name: name.to_string(),
                })
            }
        };

        Ok(match entry {
            Some(entry) => entry.apply(&value),
            None => value,
        })
    }
}

/// Shared handle to a message.
///
/// Cloning increments the reference count; the message is destroyed when
/// the last handle drops. Mutation is only possible while exactly one
/// handle exists, which makes shared messages structurally read-only.
#[derive(Clone, Debug)]
pub struct MsgRef(Arc<Message>);

impl MsgRef {
    pub fn new(msg: Message) -> Self {
        MsgRef(Arc::new(msg))
    }

    /// Mutable access, available only while unshared.
    pub fn get_mut(&mut self) -> Option<&mut Message> {
        Arc::get_mut(&mut self.0)
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Deep copy (scalars + JSON tree) into a fresh unshared message.
    pub fn deep_clone(&self) -> Message {
        (*self.0).clone()
    }
}

impl From<Message> for MsgRef {
    fn from(msg: Message) -> Self {
        MsgRef::new(msg)
    }
}

impl std::ops::Deref for MsgRef {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pri::parse_pri;
    use crate::template::{Substring, TemplateEntry};
    use serde_json::json;

    fn sample() -> Message {
        let mut msg = Message::new();
        msg.set_raw(b"<34>Oct 11 22:14:15 mymachine su: 'su root' failed");
        msg.apply_pri(parse_pri(msg.raw()));
        msg.set_hostname("mymachine");
        msg.set_tag("su:");
        msg.set_msg_offset(34);
        msg
    }

    #[test]
    fn offsets_are_clamped() {
        let mut msg = Message::new();
        msg.set_raw(b"<13>x");
        msg.set_msg_offset(100);
        assert_eq!(msg.msg_offset(), 5);
        assert_eq!(msg.msg_len(), 0);
        assert_eq!(msg.body(), b"");
    }

    #[test]
    fn program_name_stops_at_separators() {
        let mut msg = Message::new();
        msg.set_tag("su:");
        assert_eq!(msg.program_name(), "su");
        msg.set_tag("sshd[123]:");
        assert_eq!(msg.program_name(), "sshd");
        msg.set_tag("app/module");
        assert_eq!(msg.program_name(), "app");
    }

    #[test]
    fn tag_mutation_invalidates_program_name_cache() {
        let mut msg = Message::new();
        msg.set_tag("first:");
        assert_eq!(msg.program_name(), "first");
        msg.set_tag("second:");
        assert_eq!(msg.program_name(), "second");
    }

    #[test]
    fn procid_emulation_from_tag() {
        let mut msg = Message::new();
        msg.set_tag("sshd[4711]:");
        assert_eq!(msg.proc_id(), "4711");
        msg.set_tag("sshd[noclose");
        assert_eq!(msg.proc_id(), "-");
        msg.set_proc_id("99");
        assert_eq!(msg.proc_id(), "99");
    }

    #[test]
    fn appname_falls_back_to_program_name() {
        let mut msg = Message::new();
        msg.set_tag("cron[1]:");
        assert_eq!(msg.app_name(), "cron");
        msg.set_app_name("better");
        assert_eq!(msg.app_name(), "better");
    }

    #[test]
    fn property_lookup_basics() {
        let msg = sample();
        assert_eq!(msg.get_property("hostname", None).unwrap(), "mymachine");
        assert_eq!(msg.get_property("syslogtag", None).unwrap(), "su:");
        assert_eq!(msg.get_property("pri", None).unwrap(), "34");
        assert_eq!(msg.get_property("syslogfacility-text", None).unwrap(), "auth");
        assert_eq!(msg.get_property("syslogseverity-text", None).unwrap(), "crit");
        assert_eq!(
            msg.get_property("msg", None).unwrap(),
            "'su root' failed"
        );
        assert!(msg.get_property("no-such-property", None).is_err());
    }

    #[test]
    fn property_with_template_transform() {
        let msg = sample();
        let entry = TemplateEntry {
            substring: Some(Substring::Chars { from: 0, to: 3 }),
            ..Default::default()
        };
        assert_eq!(msg.get_property("hostname", Some(&entry)).unwrap(), "mym");
    }

    #[test]
    fn json_properties_render_as_text() {
        let mut msg = Message::new();
        msg.add_json("!user!name", json!("alice")).unwrap();
        msg.add_json("!user!id", json!(7)).unwrap();
        assert_eq!(msg.get_property("!user!name", None).unwrap(), "alice");
        assert_eq!(msg.get_property("!user!id", None).unwrap(), "7");
        assert_eq!(msg.get_property("!missing", None).unwrap(), "");
    }

    #[test]
    fn uuid_is_stable_per_message() {
        let msg = Message::new();
        let first = msg.uuid();
        assert_eq!(msg.uuid(), first);
    }

    #[test]
    fn timestamp_cache_invalidation() {
        let mut msg = sample();
        let first = msg.reported_rfc3164();
        let mut t = *msg.reported_time();
        t.day = 12;
        msg.set_reported_time(t);
        let second = msg.reported_rfc3164();
        assert_ne!(first, second);
        assert!(second.contains("12"));
    }

    #[test]
    fn shared_message_is_read_only() {
        let mut msg_ref = MsgRef::new(sample());
        assert!(msg_ref.get_mut().is_some());
        let other = msg_ref.clone();
        assert_eq!(msg_ref.ref_count(), 2);
        assert!(msg_ref.get_mut().is_none());
        drop(other);
        assert_eq!(msg_ref.ref_count(), 1);
        assert!(msg_ref.get_mut().is_some());
    }

    #[test]
    fn deep_clone_is_independent() {
        let original = MsgRef::new(sample());
        let mut copy = original.deep_clone();
        copy.set_hostname("elsewhere");
        assert_eq!(original.hostname(), Some("mymachine"));
        assert_eq!(copy.hostname(), Some("elsewhere"));
        assert_eq!(copy.json(), original.json());
    }
}
