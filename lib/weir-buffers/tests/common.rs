//! Shared helpers for queue integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weir_buffers::serial::{self, ObjectId, PropType, RecordType, SerialError};
use weir_buffers::{Bufferable, Consumer, StreamReader, StreamWriter};

/// A minimal queueable record: a severity plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestRecord {
    pub severity: u8,
    pub payload: Vec<u8>,
}

impl TestRecord {
    pub fn new(severity: u8, payload: impl Into<Vec<u8>>) -> Self {
        TestRecord {
            severity,
            payload: payload.into(),
        }
    }
}

impl Bufferable for TestRecord {
    fn serialize(&self, strm: &mut StreamWriter) -> Result<(), SerialError> {
        serial::begin_record(strm, RecordType::Object, ObjectId::Msg, 1)?;
        serial::write_prop_num(strm, "iSeverity", PropType::Short, i64::from(self.severity))?;
        serial::write_prop_str(strm, "pszRawMsg", &self.payload)?;
        serial::end_record(strm)?;
        Ok(())
    }

    fn deserialize(strm: &mut StreamReader) -> Result<Self, SerialError> {
        serial::read_header_recovering(strm, RecordType::Object)?;
        let props = serial::read_properties(strm)?;
        let severity = props
            .iter()
            .find(|p| p.name == "iSeverity")
            .and_then(|p| p.value.as_num())
            .unwrap_or(0) as u8;
        let payload = props
            .iter()
            .find(|p| p.name == "pszRawMsg")
            .and_then(|p| p.value.as_bytes())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        Ok(TestRecord { severity, payload })
    }

    fn severity(&self) -> Option<u8> {
        Some(self.severity)
    }
}

/// A consumer that collects everything it receives.
pub fn collecting_consumer() -> (Consumer<TestRecord>, Arc<Mutex<Vec<TestRecord>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer: Consumer<TestRecord> = Arc::new(move |rec| {
        sink.lock().unwrap().push(rec);
        Ok(())
    });
    (consumer, seen)
}

/// A consumer that sleeps per record, to simulate a slow action.
pub fn slow_consumer(delay: Duration) -> (Consumer<TestRecord>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let consumer: Consumer<TestRecord> = Arc::new(move |_rec| {
        std::thread::sleep(delay);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (consumer, count)
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
