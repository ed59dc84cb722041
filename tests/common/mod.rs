#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use polar_rec::config::{ReconnectPolicy, RecorderConfig};
use polar_rec::error::{Error, Result};
use polar_rec::recorder::{RecordSink, SinkFactory};
use polar_rec::types::{Record, SessionState, Subject};

/// Short timeouts and a small retry budget so failure paths finish quickly.
pub fn fast_config() -> RecorderConfig {
    RecorderConfig {
        devices: Vec::new(),
        connect_timeout_ms: 1_000,
        subscribe_timeout_ms: 1_000,
        start_timeout_ms: 5_000,
        stop_grace_ms: 500,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 80,
            max_attempts: 3,
        },
        ..RecorderConfig::default()
    }
}

/// Heart Rate Measurement payload: u8 value, no optional fields.
pub fn hr(bpm: u8) -> Vec<u8> {
    vec![0x00, bpm]
}

pub async fn wait_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("session never reached {want}"))
        .is_ok();
    assert!(reached, "session dropped before reaching {want}");
}

/// Poll `cond` every few milliseconds for up to 30 s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..6_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Collects every record in memory; subjects listed in `failing` reject writes.
#[derive(Clone, Default)]
pub struct MemorySinks {
    pub records: Arc<Mutex<Vec<Record>>>,
    pub failing: Vec<Subject>,
    /// Time each append takes, to model a slow disk.
    pub append_delay: Duration,
}

impl MemorySinks {
    pub fn records_of(&self, subject: &str) -> Vec<Record> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.subject.as_str() == subject)
            .cloned()
            .collect()
    }
}

struct MemorySink {
    subject: Subject,
    records: Arc<Mutex<Vec<Record>>>,
    failing: bool,
    append_delay: Duration,
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&mut self, record: &Record) -> Result<()> {
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        }
        if self.failing {
            return Err(Error::Write {
                subject: self.subject.to_string(),
                reason: "disk full".into(),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SinkFactory for MemorySinks {
    async fn create(&self, subject: &Subject, _phase: &str) -> Result<Box<dyn RecordSink>> {
        Ok(Box::new(MemorySink {
            subject: subject.clone(),
            records: Arc::clone(&self.records),
            failing: self.failing.contains(subject),
            append_delay: self.append_delay,
        }))
    }
}
