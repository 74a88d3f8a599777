//! String generators: fixed output formats rendered without a template.
//!
//! Output actions that always use the same line layout skip the template
//! machinery and call a generator directly.

use weir_core::Message;

/// The traditional syslog file line: timestamp, hostname, tag, message,
/// newline. A leading space is inserted ahead of the body unless the body
/// brings its own.
pub fn traditional_file_format(msg: &Message) -> String {
    let hostname = msg
        .hostname()
        .or(msg.rcv_from())
        .unwrap_or("-");
    let tag = msg.tag().unwrap_or("");
    let body = String::from_utf8_lossy(msg.body());
    let mut out = String::with_capacity(64 + tag.len() + body.len());
    out.push_str(&msg.reported_rfc3164());
    out.push(' ');
    out.push_str(hostname);
    out.push(' ');
    out.push_str(tag);
    if !body.starts_with(' ') {
        out.push(' ');
    }
    out.push_str(&body);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::pri::parse_pri;

    fn sample(raw: &[u8], msg_offset: usize) -> Message {
        let mut msg = Message::new();
        msg.set_raw(raw);
        msg.apply_pri(parse_pri(raw));
        msg.set_hostname("host");
        msg.set_tag("su:");
        msg.set_msg_offset(msg_offset);
        msg
    }

    #[test]
    fn renders_the_classic_line() {
        let msg = sample(b"<13>Oct 11 22:14:15 host su: hello", 29);
        let line = traditional_file_format(&msg);
        assert!(line.ends_with(" host su: hello\n"));
        assert!(line.starts_with(&msg.reported_rfc3164()));
    }

    #[test]
    fn does_not_double_the_leading_space() {
        // A body that already starts with a space (the legacy default)
        // must not get a second one.
        let msg = sample(b"<13>Oct 11 22:14:15 host su: hello", 28);
        assert_eq!(msg.body(), b" hello");
        let line = traditional_file_format(&msg);
        assert!(line.ends_with(" host su: hello\n"));
        assert!(!line.contains("su:  hello"));
    }

    #[test]
    fn falls_back_to_the_sender_for_the_hostname() {
        let mut msg = Message::new();
        msg.set_raw(b"<13>x");
        msg.set_rcv_from("relay.example.net");
        let line = traditional_file_format(&msg);
        assert!(line.contains(" relay.example.net "));
    }
}
