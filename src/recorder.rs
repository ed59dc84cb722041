//! Recording pipeline: session sample streams → tagged records → per-subject sinks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::registry::SubjectStream;
use crate::types::{DeviceIdentity, Record, Sample, Subject};

/// Records buffered by a consumer before it flushes its sink.
const FLUSH_EVERY: u64 = 32;

/// Destination for one subject's records.
#[async_trait]
pub trait RecordSink: Send {
    async fn append(&mut self, record: &Record) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Opens the sink dedicated to a subject for a given phase.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(&self, subject: &Subject, phase: &str) -> Result<Box<dyn RecordSink>>;
}

// ── CSV ──────────────────────────────────────────────────────────────────────

pub const CSV_HEADER: &str =
    "timestamp,time,device,sample_type,heartrate,rr_intervals,ppg_channels,subject,phase";

/// Appends records to `<dir>/<subject>_<phase>.csv`.
///
/// The header is written only when the file is new or empty, so repeated runs
/// of the same phase accumulate in one file.
pub struct CsvSink {
    path: PathBuf,
    subject: Subject,
    out: BufWriter<tokio::fs::File>,
    started_at: DateTime<Utc>,
}

impl CsvSink {
    /// `started_at` is the run start; the `time` column counts seconds from it.
    pub async fn open(
        path: impl Into<PathBuf>,
        subject: Subject,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let fresh = file.metadata().await?.len() == 0;
        let mut out = BufWriter::new(file);
        if fresh {
            out.write_all(CSV_HEADER.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        debug!("{}: writing {}", subject, path.display());
        Ok(Self {
            path,
            subject,
            out,
            started_at,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, e: impl std::fmt::Display) -> Error {
        Error::Write {
            subject: self.subject.to_string(),
            reason: format!("{}: {e}", self.path.display()),
        }
    }
}

/// Quote a field if it would otherwise break the row.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

pub fn csv_row(record: &Record, started_at: DateTime<Utc>) -> String {
    let ts = record.sample.timestamp();
    let elapsed = (ts - started_at)
        .num_microseconds()
        .map_or(0.0, |us| us as f64 / 1e6);
    let (heartrate, rr, ppg) = match &record.sample {
        Sample::HeartRate(s) => (s.bpm.to_string(), join(&s.rr_intervals), String::new()),
        Sample::Ppg(s) => (String::new(), String::new(), join(&s.channel_readings)),
    };
    format!(
        "{},{elapsed:.6},{},{},{heartrate},{rr},{ppg},{},{}",
        ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        csv_field(&record.device.name),
        record.sample.kind_name(),
        csv_field(record.subject.as_str()),
        csv_field(&record.phase),
    )
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn append(&mut self, record: &Record) -> Result<()> {
        let mut line = csv_row(record, self.started_at);
        line.push('\n');
        if let Err(e) = self.out.write_all(line.as_bytes()).await {
            return Err(self.write_error(e));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.out.flush().await {
            return Err(self.write_error(e));
        }
        Ok(())
    }
}

/// Creates one [`CsvSink`] per subject under a common directory.
pub struct CsvSinkFactory {
    dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl CsvSinkFactory {
    pub fn new(dir: impl Into<PathBuf>, started_at: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            started_at,
        }
    }

    pub fn path_for(&self, subject: &Subject, phase: &str) -> PathBuf {
        self.dir.join(format!("{subject}_{phase}.csv"))
    }
}

#[async_trait]
impl SinkFactory for CsvSinkFactory {
    async fn create(&self, subject: &Subject, phase: &str) -> Result<Box<dyn RecordSink>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let sink = CsvSink::open(self.path_for(subject, phase), subject.clone(), self.started_at)
            .await
            .map_err(|e| Error::Write {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(sink))
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// What happened to one subject's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectReport {
    pub subject: Subject,
    pub device: DeviceIdentity,
    pub written: u64,
    pub failed: u64,
    pub first_error: Option<String>,
}

impl SubjectReport {
    fn new(subject: Subject, device: DeviceIdentity) -> Self {
        Self {
            subject,
            device,
            written: 0,
            failed: 0,
            first_error: None,
        }
    }

    fn fail(&mut self, e: &Error) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(e.to_string());
        }
    }
}

/// Summary of a recording run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingReport {
    pub subjects: Vec<SubjectReport>,
    /// Devices whose reconnect budget ran out during the run.
    pub lost: Vec<DeviceIdentity>,
}

impl RecordingReport {
    pub fn subject(&self, subject: &Subject) -> Option<&SubjectReport> {
        self.subjects.iter().find(|r| &r.subject == subject)
    }

    pub fn total_written(&self) -> u64 {
        self.subjects.iter().map(|r| r.written).sum()
    }
}

/// Spawn one consumer per stream.  The handle resolves once every stream has
/// ended (its session closed) and every sink is flushed.
pub fn spawn_pipeline(
    phase: impl Into<String>,
    streams: Vec<SubjectStream>,
    factory: Arc<dyn SinkFactory>,
) -> JoinHandle<RecordingReport> {
    let phase = phase.into();
    let consumers: Vec<JoinHandle<SubjectReport>> = streams
        .into_iter()
        .map(|stream| tokio::spawn(consume(phase.clone(), stream, Arc::clone(&factory))))
        .collect();

    tokio::spawn(async move {
        let mut report = RecordingReport::default();
        for result in join_all(consumers).await {
            match result {
                Ok(subject) => report.subjects.push(subject),
                Err(e) => warn!("recording consumer panicked: {e}"),
            }
        }
        report
    })
}

async fn consume(
    phase: String,
    mut stream: SubjectStream,
    factory: Arc<dyn SinkFactory>,
) -> SubjectReport {
    let mut report = SubjectReport::new(stream.subject.clone(), stream.device.clone());

    let mut sink = match factory.create(&stream.subject, &phase).await {
        Ok(sink) => sink,
        Err(e) => {
            error!("{}: cannot open sink: {e}", stream.subject);
            // Keep draining so the session never blocks on a dead consumer.
            while stream.samples.recv().await.is_some() {
                report.fail(&e);
            }
            return report;
        }
    };

    let mut unflushed = 0u64;
    while let Some(sample) = stream.samples.recv().await {
        let record = Record {
            subject: stream.subject.clone(),
            phase: phase.clone(),
            device: stream.device.clone(),
            sample,
        };
        match sink.append(&record).await {
            Ok(()) => {
                report.written += 1;
                unflushed += 1;
            }
            Err(e) => {
                if report.first_error.is_none() {
                    error!("{}: {e}", stream.subject);
                }
                report.fail(&e);
            }
        }
        if unflushed >= FLUSH_EVERY {
            if let Err(e) = sink.flush().await {
                warn!("{}: {e}", stream.subject);
                report.first_error.get_or_insert_with(|| e.to_string());
            }
            unflushed = 0;
        }
    }

    if let Err(e) = sink.flush().await {
        warn!("{}: {e}", stream.subject);
        report.first_error.get_or_insert_with(|| e.to_string());
    }
    info!(
        "{}: {} record(s) written, {} failed",
        stream.subject, report.written, report.failed
    );
    report
}
