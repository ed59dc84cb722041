//! Device ↔ subject assignment and the set of live sessions for a run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::session::{DeviceSession, SampleStream, SessionMode};
use crate::transport::Transport;
use crate::types::{DeviceIdentity, SessionEvent, SessionState, Subject};

/// Positional pairing of sensors with the people wearing them.
///
/// The `i`-th subject wears the `i`-th device.  Devices past the last subject
/// stay unassigned and are never connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    entries: Vec<(DeviceIdentity, Subject)>,
    unassigned: Vec<DeviceIdentity>,
}

impl DeviceAssignment {
    pub fn new(devices: &[DeviceIdentity], subjects: &[Subject]) -> Result<Self> {
        if subjects.len() > devices.len() {
            return Err(Error::Config(format!(
                "{} subject(s) but only {} device(s)",
                subjects.len(),
                devices.len()
            )));
        }
        let mut seen = HashSet::new();
        for subject in subjects {
            if subject.as_str().trim().is_empty() {
                return Err(Error::Config("empty subject label".into()));
            }
            if !seen.insert(subject.as_str()) {
                return Err(Error::Config(format!("subject {subject} listed twice")));
            }
        }
        let entries = devices
            .iter()
            .cloned()
            .zip(subjects.iter().cloned())
            .collect();
        let unassigned = devices[subjects.len()..].to_vec();
        Ok(Self {
            entries,
            unassigned,
        })
    }

    /// Every device, each labelled with its own name.
    ///
    /// Used by the query commands, which talk to the whole sensor pool.
    pub fn all_devices(devices: &[DeviceIdentity]) -> Self {
        Self {
            entries: devices
                .iter()
                .map(|d| (d.clone(), Subject::new(d.name.clone())))
                .collect(),
            unassigned: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[(DeviceIdentity, Subject)] {
        &self.entries
    }

    pub fn subject_of(&self, device: &DeviceIdentity) -> Option<&Subject> {
        self.entries
            .iter()
            .find(|(d, _)| d == device)
            .map(|(_, s)| s)
    }

    pub fn unassigned(&self) -> &[DeviceIdentity] {
        &self.unassigned
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of [`SessionRegistry::start_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub streaming: Vec<DeviceIdentity>,
    /// Sessions that closed before streaming (retry budget exhausted).
    pub failed: Vec<DeviceIdentity>,
    /// Sessions still connecting when the start timeout expired.  They keep
    /// retrying in the background.
    pub pending: Vec<DeviceIdentity>,
}

/// A session's sample stream paired with whoever wears the device.
pub struct SubjectStream {
    pub subject: Subject,
    pub device: DeviceIdentity,
    pub samples: SampleStream,
}

/// One [`DeviceSession`] per assigned device.
pub struct SessionRegistry {
    assignment: Arc<DeviceAssignment>,
    config: Arc<RecorderConfig>,
    sessions: Vec<DeviceSession>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl SessionRegistry {
    /// Build idle sessions for every assigned device.  Sessions are cancelled
    /// together with `cancel`.
    pub fn new(
        transport: Arc<dyn Transport>,
        assignment: Arc<DeviceAssignment>,
        config: Arc<RecorderConfig>,
        mode: SessionMode,
        cancel: &CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = assignment
            .entries()
            .iter()
            .map(|(device, _)| {
                DeviceSession::new(
                    device.clone(),
                    Arc::clone(&transport),
                    Arc::clone(&config),
                    mode,
                    Some(events_tx.clone()),
                    cancel.child_token(),
                )
            })
            .collect();
        for device in assignment.unassigned() {
            info!("{device}: no subject assigned, leaving it alone");
        }
        Self {
            assignment,
            config,
            sessions,
            events: Some(events_rx),
        }
    }

    pub fn assignment(&self) -> &DeviceAssignment {
        &self.assignment
    }

    pub fn sessions(&self) -> &[DeviceSession] {
        &self.sessions
    }

    pub fn session(&self, device: &DeviceIdentity) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.device() == device)
    }

    /// Start every session and wait until each streams or gives up, bounded
    /// by the start timeout.  Partial success is not an error.
    pub async fn start_all(&mut self) -> StartReport {
        for session in &mut self.sessions {
            session.start();
        }

        let settle = join_all(self.sessions.iter().map(|s| s.wait_settled()));
        if tokio::time::timeout(self.config.start_timeout(), settle)
            .await
            .is_err()
        {
            warn!(
                "not every device settled within {} s",
                self.config.start_timeout().as_secs_f32()
            );
        }

        let mut report = StartReport::default();
        for session in &self.sessions {
            let device = session.device().clone();
            match session.state() {
                SessionState::Streaming => report.streaming.push(device),
                SessionState::Closed => report.failed.push(device),
                _ => report.pending.push(device),
            }
        }
        info!(
            "{} streaming, {} failed, {} pending",
            report.streaming.len(),
            report.failed.len(),
            report.pending.len()
        );
        report
    }

    /// Stop every session concurrently.  Safe to call more than once.
    pub async fn stop_all(&mut self) {
        join_all(self.sessions.iter_mut().map(|s| s.stop())).await;
    }

    /// Hand out each session's sample stream with its subject.  Streams
    /// already taken are skipped.
    pub fn take_streams(&mut self) -> Vec<SubjectStream> {
        let assignment = Arc::clone(&self.assignment);
        self.sessions
            .iter_mut()
            .filter_map(|session| {
                let subject = assignment.subject_of(session.device())?.clone();
                let samples = session.outbound_samples()?;
                Some(SubjectStream {
                    subject,
                    device: session.device().clone(),
                    samples,
                })
            })
            .collect()
    }

    /// The shared lifecycle event feed.  Returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn devices(n: usize) -> Vec<DeviceIdentity> {
        (1..=n)
            .map(|i| DeviceIdentity::named(format!("Polar OH1 d{i}")))
            .collect()
    }

    fn subjects(labels: &[&str]) -> Vec<Subject> {
        labels.iter().map(|&l| Subject::from(l)).collect()
    }

    #[test]
    fn subjects_map_to_devices_by_position() {
        let devices = devices(3);
        let assignment = DeviceAssignment::new(&devices, &subjects(&["A", "B", "C"])).unwrap();
        let pairs: Vec<(String, String)> = assignment
            .entries()
            .iter()
            .map(|(d, s)| (d.name.clone(), s.to_string()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Polar OH1 d1".to_string(), "A".to_string()),
                ("Polar OH1 d2".to_string(), "B".to_string()),
                ("Polar OH1 d3".to_string(), "C".to_string()),
            ]
        );
        assert!(assignment.unassigned().is_empty());
    }

    #[test]
    fn fewer_subjects_leave_devices_unassigned() {
        let devices = devices(3);
        let assignment = DeviceAssignment::new(&devices, &subjects(&["A", "B"])).unwrap();
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment.unassigned(), &devices[2..]);
        assert_eq!(assignment.subject_of(&devices[2]), None);
        assert_eq!(assignment.subject_of(&devices[1]), Some(&Subject::from("B")));
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        let devices = devices(2);
        for labels in [vec!["A", "B", "C"], vec!["A", "A"], vec!["A", " "]] {
            assert!(
                matches!(
                    DeviceAssignment::new(&devices, &subjects(&labels)),
                    Err(Error::Config(_))
                ),
                "{labels:?} should be rejected"
            );
        }
    }

    #[test]
    fn all_devices_labels_each_device_with_its_name() {
        let devices = devices(2);
        let assignment = DeviceAssignment::all_devices(&devices);
        assert_eq!(
            assignment.subject_of(&devices[1]),
            Some(&Subject::from("Polar OH1 d2"))
        );
    }
}
