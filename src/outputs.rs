//! Built-in output actions.
//!
//! Real output modules are pluggable and out of scope here; the daemon
//! ships a file writer and a discard sink, which is enough to run the
//! pipeline end to end and to exercise the action submission contract.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::ruleset::OutputFn;
use crate::strgen;

#[derive(Debug, Snafu)]
pub enum OutputBuildError {
    #[snafu(display("unknown output type: {kind}"))]
    UnknownOutput { kind: String },
    #[snafu(display("output {name} requires a path"))]
    MissingPath { name: String },
    #[snafu(display("could not open {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Appends classic one-line syslog text: timestamp, hostname, tag, body.
fn file_output(path: &Path) -> Result<OutputFn, OutputBuildError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(OpenSnafu {
            path: path.to_path_buf(),
        })?;
    let file = Arc::new(Mutex::new(file));
    let path = path.to_path_buf();
    Ok(Arc::new(move |msg| {
        let line = strgen::traditional_file_format(msg);
        let mut file: parking_lot::MutexGuard<'_, File> = file.lock();
        file.write_all(line.as_bytes()).map_err(|e| {
            format!("write to {} failed: {e}", path.display()).into()
        })
    }))
}

/// Builds an output callback by type name.
pub fn build_output(
    name: &str,
    kind: &str,
    path: Option<&Path>,
) -> Result<OutputFn, OutputBuildError> {
    match kind {
        "file" => {
            let path = path.ok_or_else(|| OutputBuildError::MissingPath {
                name: name.to_string(),
            })?;
            file_output(path)
        }
        "null" => Ok(Arc::new(|_msg| Ok(()))),
        other => Err(OutputBuildError::UnknownOutput {
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use weir_core::{Message, MsgRef};

    #[test]
    fn file_output_appends_formatted_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let output = build_output("test", "file", Some(&path)).unwrap();

        let mut msg = Message::new();
        msg.set_raw(b"<13>Oct 11 22:14:15 host su: hello");
        msg.apply_pri(weir_core::pri::parse_pri(msg.raw()));
        msg.set_hostname("host");
        msg.set_tag("su:");
        msg.set_msg_offset(29);
        output(&MsgRef::new(msg)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("host su:"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn unknown_output_type_is_rejected() {
        assert!(build_output("x", "telepathy", None).is_err());
    }
}
