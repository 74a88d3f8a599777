//! Message persistence: the property-bag record used by disk queues.
//!
//! Properties are written in a fixed order ending with `offMSG`, which
//! doubles as the end-of-record sentinel. Readers tolerate omitted optional
//! fields and skip unknown ones, but reordering is a sequence error: a
//! record whose terminating property is not `offMSG` is rejected.

use serde_json::Value;

use weir_buffers::serial::{
    self, ObjectId, PropType, Property, RecordType, SerialError,
};
use weir_buffers::{Bufferable, StreamReader, StreamWriter};

use crate::json;

use super::{Message, MsgRef};

/// The documented property order. `offMSG` must stay last: it is the
/// deserializer's sentinel.
const PROP_ORDER: [&str; 21] = [
    "iProtocolVersion",
    "iSeverity",
    "iFacility",
    "msgFlags",
    "ttGenTime",
    "tRcvdAt",
    "tTIMESTAMP",
    "pszTAG",
    "pszRawMsg",
    "pszHOSTNAME",
    "pszInputName",
    "pszRcvFrom",
    "pszRcvFromIP",
    "json",
    "pCSStrucData",
    "pCSAPPNAME",
    "pCSPROCID",
    "pCSMSGID",
    "pszUUID",
    "pszRuleset",
    "offMSG",
];

fn write_opt_str(
    strm: &mut StreamWriter,
    name: &str,
    val: Option<&str>,
) -> Result<(), SerialError> {
    match val {
        Some(v) => serial::write_prop_str(strm, name, v.as_bytes()),
        None => Ok(()),
    }
}

fn write_opt_cstr(
    strm: &mut StreamWriter,
    name: &str,
    val: Option<&str>,
) -> Result<(), SerialError> {
    match val {
        Some(v) => serial::write_prop_cstr(strm, name, v.as_bytes()),
        None => Ok(()),
    }
}

impl Bufferable for MsgRef {
    fn serialize(&self, strm: &mut StreamWriter) -> Result<(), SerialError> {
        let msg: &Message = self;
        serial::begin_record(strm, RecordType::Object, ObjectId::Msg, 1)?;
        serial::write_prop_num(
            strm,
            "iProtocolVersion",
            PropType::Short,
            i64::from(msg.protocol_version),
        )?;
        serial::write_prop_num(strm, "iSeverity", PropType::Short, i64::from(msg.severity))?;
        serial::write_prop_num(strm, "iFacility", PropType::Short, i64::from(msg.facility))?;
        serial::write_prop_num(strm, "msgFlags", PropType::Int, i64::from(msg.flags))?;
        serial::write_prop_num(strm, "ttGenTime", PropType::Int, msg.gen_time)?;
        serial::write_prop_time(strm, "tRcvdAt", &msg.rcvd_at)?;
        serial::write_prop_time(strm, "tTIMESTAMP", &msg.reported)?;
        write_opt_str(strm, "pszTAG", msg.tag())?;
        serial::write_prop_str(strm, "pszRawMsg", msg.raw())?;
        write_opt_str(strm, "pszHOSTNAME", msg.hostname())?;
        write_opt_str(strm, "pszInputName", msg.input_name())?;
        write_opt_str(strm, "pszRcvFrom", msg.rcv_from())?;
        write_opt_str(strm, "pszRcvFromIP", msg.rcv_from_ip())?;
        if !msg.json.is_null() {
            serial::write_prop_str(strm, "json", json::to_text(&msg.json).as_bytes())?;
        }
        write_opt_cstr(strm, "pCSStrucData", msg.structured_data())?;
        write_opt_cstr(strm, "pCSAPPNAME", msg.app_name.as_deref())?;
        write_opt_cstr(strm, "pCSPROCID", msg.proc_id.as_deref())?;
        write_opt_cstr(strm, "pCSMSGID", msg.msg_id.as_deref())?;
        write_opt_str(strm, "pszUUID", msg.uuid_raw().as_deref())?;
        // The ruleset travels by name; the binding is re-resolved on load.
        write_opt_str(strm, "pszRuleset", msg.ruleset())?;
        // Serialized after the raw buffer so the offset can be validated
        // against it on load.
        serial::write_prop_num(strm, "offMSG", PropType::Short, msg.off_msg as i64)?;
        serial::end_record(strm)
    }

    fn deserialize(strm: &mut StreamReader) -> Result<Self, SerialError> {
        let hdr = serial::read_header_recovering(strm, RecordType::Object)?;
        if hdr.object_id != ObjectId::Msg {
            return Err(SerialError::InvalidObjectId {
                id: hdr.object_id as i64,
            });
        }

        let mut msg = Message::new();
        let mut cursor = 0usize;
        while let Some(prop) = serial::next_property(strm)? {
            match PROP_ORDER.iter().position(|n| *n == prop.name) {
                Some(idx) if idx >= cursor => {
                    cursor = idx + 1;
                    apply_property(&mut msg, &prop);
                }
                Some(_) => {
                    return Err(SerialError::SequenceError { name: prop.name });
                }
                None => {
                    // Unknown properties are skipped for forward
                    // compatibility.
                    debug!(name = %prop.name, "ignoring unknown message property");
                }
            }
        }
        serial::read_trailer(strm)?;

        // The record must terminate with offMSG.
        if cursor != PROP_ORDER.len() {
            return Err(SerialError::SequenceError {
                name: "offMSG".to_string(),
            });
        }
        Ok(MsgRef::new(msg))
    }

    fn severity(&self) -> Option<u8> {
        Some(self.0.severity())
    }
}

fn apply_property(msg: &mut Message, prop: &Property) {
    let num = prop.value.as_num();
    let text = prop
        .value
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned());
    match prop.name.as_str() {
        "iProtocolVersion" => msg.set_protocol_version(num.unwrap_or(0) as u8),
        "iSeverity" => msg.severity = num.unwrap_or(0) as u8,
        "iFacility" => msg.facility = num.unwrap_or(0) as u8,
        "msgFlags" => msg.flags = num.unwrap_or(0) as u32,
        "ttGenTime" => msg.gen_time = num.unwrap_or(0),
        "tRcvdAt" => {
            if let Some(t) = prop.value.as_time() {
                msg.rcvd_at = *t;
            }
        }
        "tTIMESTAMP" => {
            if let Some(t) = prop.value.as_time() {
                msg.set_reported_time(*t);
            }
        }
        "pszTAG" => {
            if let Some(t) = text {
                msg.set_tag(t);
            }
        }
        "pszRawMsg" => {
            if let Some(b) = prop.value.as_bytes() {
                msg.set_raw(b);
            }
        }
        "pszHOSTNAME" => {
            if let Some(t) = text {
                msg.set_hostname(t);
            }
        }
        "pszInputName" => {
            if let Some(t) = text {
                msg.set_input_name(t);
            }
        }
        "pszRcvFrom" => {
            if let Some(t) = text {
                msg.set_rcv_from(t);
            }
        }
        "pszRcvFromIP" => {
            if let Some(t) = text {
                msg.set_rcv_from_ip(t);
            }
        }
        "json" => {
            if let Some(t) = &text {
                match serde_json::from_str::<Value>(t) {
                    Ok(v) => msg.json = v,
                    Err(e) => debug!(error = %e, "discarding unparseable json property"),
                }
            }
        }
        "pCSStrucData" => {
            if let Some(t) = text {
                msg.set_structured_data(t);
            }
        }
        "pCSAPPNAME" => {
            if let Some(t) = text {
                msg.set_app_name(t);
            }
        }
        "pCSPROCID" => {
            if let Some(t) = text {
                msg.set_proc_id(t);
            }
        }
        "pCSMSGID" => {
            if let Some(t) = text {
                msg.set_msg_id(t);
            }
        }
        "pszUUID" => {
            if let Some(t) = text {
                msg.set_uuid(t);
            }
        }
        "pszRuleset" => {
            if let Some(t) = text {
                msg.set_ruleset(t);
            }
        }
        "offMSG" => msg.set_msg_offset(num.unwrap_or(0).max(0) as usize),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pri::parse_pri;
    use serde_json::json;
    use tempfile::TempDir;
    use weir_buffers::stream::{StreamSpec, StreamType};

    fn spec(dir: &TempDir) -> StreamSpec {
        StreamSpec {
            dir: dir.path().to_path_buf(),
            prefix: "msg".into(),
            stream_type: StreamType::Circular,
            max_segments: 100,
            max_segment_size: 1024 * 1024,
        }
    }

    fn full_message() -> Message {
        let mut msg = Message::new();
        msg.set_raw(b"<165>1 2003-10-11T22:14:15.003Z host app 1 ID47 - body here");
        msg.apply_pri(parse_pri(msg.raw()));
        msg.set_protocol_version(1);
        msg.set_hostname("host");
        msg.set_tag("app[1]:");
        msg.set_app_name("app");
        msg.set_proc_id("1");
        msg.set_msg_id("ID47");
        msg.set_structured_data("[ex@32473 k=\"v\"]");
        msg.set_input_name("udp");
        msg.set_rcv_from("relay.example.net");
        msg.set_rcv_from_ip("192.0.2.7");
        msg.set_ruleset("remote");
        msg.add_json("!meta!seq", json!(17)).unwrap();
        msg.add_json("!meta!path", json!("/var/log")).unwrap();
        msg.set_msg_offset(48);
        msg
    }

    #[test]
    fn round_trip_preserves_all_scalars() {
        let dir = TempDir::new().unwrap();
        let original = full_message();
        let msg_ref = MsgRef::new(original.clone());

        let mut w = weir_buffers::StreamWriter::create(spec(&dir)).unwrap();
        Bufferable::serialize(&msg_ref, &mut w).unwrap();
        w.flush().unwrap();

        let mut r = weir_buffers::StreamReader::open(spec(&dir), false).unwrap();
        let loaded = MsgRef::deserialize(&mut r).unwrap();

        assert_eq!(loaded.raw(), original.raw());
        assert_eq!(loaded.protocol_version(), 1);
        assert_eq!(loaded.severity(), Some(original.severity()));
        assert_eq!(loaded.facility(), original.facility());
        assert_eq!(loaded.reported_time(), original.reported_time());
        assert_eq!(loaded.rcvd_time(), original.rcvd_time());
        assert_eq!(loaded.gen_time(), original.gen_time());
        assert_eq!(loaded.hostname(), original.hostname());
        assert_eq!(loaded.tag(), original.tag());
        assert_eq!(loaded.app_name(), original.app_name());
        assert_eq!(loaded.proc_id(), original.proc_id());
        assert_eq!(loaded.msg_id(), original.msg_id());
        assert_eq!(loaded.structured_data(), original.structured_data());
        assert_eq!(loaded.input_name(), original.input_name());
        assert_eq!(loaded.rcv_from(), original.rcv_from());
        assert_eq!(loaded.rcv_from_ip(), original.rcv_from_ip());
        assert_eq!(loaded.ruleset(), original.ruleset());
        assert_eq!(loaded.msg_offset(), original.msg_offset());
        assert_eq!(loaded.json(), original.json());
    }

    #[test]
    fn sparse_message_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut msg = Message::new();
        msg.set_raw(b"<13>bare message");
        msg.apply_pri(parse_pri(msg.raw()));
        let msg_ref = MsgRef::new(msg);

        let mut w = weir_buffers::StreamWriter::create(spec(&dir)).unwrap();
        Bufferable::serialize(&msg_ref, &mut w).unwrap();
        w.flush().unwrap();

        let mut r = weir_buffers::StreamReader::open(spec(&dir), false).unwrap();
        let loaded = MsgRef::deserialize(&mut r).unwrap();
        assert_eq!(loaded.raw(), msg_ref.raw());
        assert_eq!(loaded.hostname(), None);
        assert_eq!(loaded.tag(), None);
        assert!(loaded.json().is_null());
    }

    #[test]
    fn multiple_records_stream_in_fifo_order() {
        let dir = TempDir::new().unwrap();
        let mut w = weir_buffers::StreamWriter::create(spec(&dir)).unwrap();
        for i in 0..10u32 {
            let mut msg = Message::new();
            msg.set_raw(format!("<13>record number {i}").as_bytes());
            msg.apply_pri(parse_pri(msg.raw()));
            Bufferable::serialize(&MsgRef::new(msg), &mut w).unwrap();
        }
        w.flush().unwrap();

        let mut r = weir_buffers::StreamReader::open(spec(&dir), false).unwrap();
        for i in 0..10u32 {
            let loaded = MsgRef::deserialize(&mut r).unwrap();
            assert_eq!(loaded.raw(), format!("<13>record number {i}").as_bytes());
        }
        assert!(MsgRef::deserialize(&mut r).unwrap_err().is_eof());
    }

    #[test]
    fn severity_feeds_the_discard_gate() {
        let mut msg = Message::new();
        msg.set_raw(b"<11>x");
        msg.apply_pri(parse_pri(msg.raw()));
        let msg_ref = MsgRef::new(msg);
        assert_eq!(Bufferable::severity(&msg_ref), Some(3));
    }
}
