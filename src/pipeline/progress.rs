// Progress channel: live, ordered, single-subscriber event stream per job.
//
// The publisher side appends every line to the job's log before handing it to
// the subscriber. The log is the durable record; the live stream is best
// effort and carries only what happens while a subscriber is attached.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{JobError, JobResult};
use crate::jobs::JobId;

/// Final result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

impl JobOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Line(String),
    /// Terminal event. Always the last one a subscription yields.
    Done(JobOutcome),
}

type Subscriber = (u64, SyncSender<ProgressEvent>);

#[derive(Debug, Default)]
struct Slot {
    subscriber: Option<Subscriber>,
}

/// Hub of per-job progress streams. Clones share state.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    capacity: usize,
    slots: Arc<Mutex<HashMap<JobId, Slot>>>,
    next_token: Arc<AtomicU64>,
}

impl ProgressChannel {
    /// `capacity` bounds the events queued for a slow subscriber; beyond that
    /// the publisher waits.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_live(&self, id: &JobId) -> bool {
        self.lock().contains_key(id)
    }

    /// Start a stream for `id`, logging to `log_path` (truncated).
    pub fn open(&self, id: &JobId, log_path: &Path) -> JobResult<ProgressPublisher> {
        {
            let mut slots = self.lock();
            if slots.contains_key(id) {
                return Err(JobError::JobBusy(id.to_string()));
            }
            slots.insert(id.clone(), Slot::default());
        }

        let log = match File::create(log_path) {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                self.lock().remove(id);
                return Err(e.into());
            }
        };

        Ok(ProgressPublisher {
            id: id.clone(),
            log,
            hub: self.clone(),
            finished: false,
        })
    }

    /// Attach the live observer for `id`.
    ///
    /// A job with no running stream yields an empty subscription: there is no
    /// replay, finished output must be read from storage.
    pub fn subscribe(&self, id: &JobId) -> JobResult<Subscription> {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(id) else {
            return Ok(Subscription::empty());
        };
        if slot.subscriber.is_some() {
            return Err(JobError::JobBusy(id.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        slot.subscriber = Some((token, sender));
        Ok(Subscription {
            receiver: Some(receiver),
            attachment: Some((self.clone(), id.clone(), token)),
            done: false,
        })
    }

    fn subscriber(&self, id: &JobId) -> Option<Subscriber> {
        self.lock().get(id).and_then(|slot| slot.subscriber.clone())
    }

    fn detach(&self, id: &JobId, token: u64) {
        if let Some(slot) = self.lock().get_mut(id) {
            if slot.subscriber.as_ref().is_some_and(|(t, _)| *t == token) {
                slot.subscriber = None;
            }
        }
    }
}

/// Producer end of one job's stream. Emits exactly one `Done`, either through
/// [`finish`](Self::finish) or, if dropped early, as a failure.
pub struct ProgressPublisher {
    id: JobId,
    log: BufWriter<File>,
    hub: ProgressChannel,
    finished: bool,
}

impl ProgressPublisher {
    /// Log the line, then hand it to the subscriber (waiting if its queue is full).
    pub fn publish(&mut self, line: &str) -> JobResult<()> {
        writeln!(self.log, "{line}")?;
        self.log.flush()?;

        if let Some((token, sender)) = self.hub.subscriber(&self.id) {
            if sender.send(ProgressEvent::Line(line.to_owned())).is_err() {
                tracing::debug!("Subscriber for job {} went away", self.id);
                self.hub.detach(&self.id, token);
            }
        }
        Ok(())
    }

    pub fn finish(mut self, outcome: JobOutcome) {
        self.close(outcome);
    }

    fn close(&mut self, outcome: JobOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.log.flush() {
            tracing::warn!("Failed to flush log for job {}: {}", self.id, e);
        }
        let slot = self.hub.lock().remove(&self.id);
        if let Some((_, sender)) = slot.and_then(|s| s.subscriber) {
            let _ = sender.send(ProgressEvent::Done(outcome));
        }
    }
}

impl Drop for ProgressPublisher {
    fn drop(&mut self) {
        self.close(JobOutcome::failed("pipeline aborted"));
    }
}

/// Consumer end: yields lines in emission order, then one `Done`, then ends.
pub struct Subscription {
    receiver: Option<Receiver<ProgressEvent>>,
    attachment: Option<(ProgressChannel, JobId, u64)>,
    done: bool,
}

impl Subscription {
    fn empty() -> Self {
        Self {
            receiver: None,
            attachment: None,
            done: true,
        }
    }

    /// False for subscriptions to jobs that had no running stream.
    pub fn is_live(&self) -> bool {
        self.receiver.is_some()
    }
}

impl Iterator for Subscription {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        let event = self.receiver.as_ref()?.recv().ok();
        match &event {
            Some(ProgressEvent::Done(_)) | None => self.done = true,
            Some(ProgressEvent::Line(_)) => {}
        }
        event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((hub, id, token)) = self.attachment.take() {
            hub.detach(&id, token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn lines(events: &[ProgressEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Line(l) => Some(l.as_str()),
                ProgressEvent::Done(_) => None,
            })
            .collect()
    }

    fn done_count(events: &[ProgressEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Done(_)))
            .count()
    }

    #[test]
    fn test_lines_then_single_done() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let mut publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        let subscription = hub.subscribe(&id).unwrap();

        let producer = std::thread::spawn(move || {
            publisher.publish("first").unwrap();
            publisher.publish("DONE").unwrap();
            publisher.publish("last").unwrap();
            publisher.finish(JobOutcome::Completed);
        });

        let events: Vec<ProgressEvent> = subscription.collect();
        producer.join().unwrap();
        assert_eq!(lines(&events), vec!["first", "DONE", "last"]);
        assert_eq!(done_count(&events), 1);
        assert_eq!(events.last(), Some(&ProgressEvent::Done(JobOutcome::Completed)));
    }

    #[test]
    fn test_every_line_is_logged() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("stdout.log");
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let mut publisher = hub.open(&id, &log_path).unwrap();
        publisher.publish("no subscriber yet").unwrap();
        publisher.publish("still none").unwrap();
        publisher.finish(JobOutcome::Completed);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log, "no subscriber yet\nstill none\n");
    }

    #[test]
    fn test_late_subscriber_sees_only_new_lines() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let mut publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        publisher.publish("missed").unwrap();

        let subscription = hub.subscribe(&id).unwrap();
        publisher.publish("seen").unwrap();
        publisher.finish(JobOutcome::failed("boom"));

        let events: Vec<ProgressEvent> = subscription.collect();
        assert_eq!(lines(&events), vec!["seen"]);
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Done(JobOutcome::failed("boom")))
        );
    }

    #[test]
    fn test_subscribe_to_finished_job_is_empty() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        publisher.finish(JobOutcome::Completed);

        let mut subscription = hub.subscribe(&id).unwrap();
        assert!(!subscription.is_live());
        assert!(subscription.next().is_none());
    }

    #[test]
    fn test_subscribe_to_unknown_job_is_empty() {
        let hub = ProgressChannel::new(8);
        let subscription = hub.subscribe(&JobId::generate()).unwrap();
        assert_eq!(subscription.count(), 0);
    }

    #[test]
    fn test_second_subscriber_is_busy_until_first_drops() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let _publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();

        let first = hub.subscribe(&id).unwrap();
        assert!(matches!(hub.subscribe(&id), Err(JobError::JobBusy(_))));
        drop(first);
        assert!(hub.subscribe(&id).unwrap().is_live());
    }

    #[test]
    fn test_open_twice_is_busy() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let _publisher = hub.open(&id, &tmp.path().join("a.log")).unwrap();
        assert!(matches!(
            hub.open(&id, &tmp.path().join("b.log")),
            Err(JobError::JobBusy(_))
        ));
    }

    #[test]
    fn test_dropped_publisher_still_sends_done() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(8);
        let id = JobId::generate();
        let publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        let subscription = hub.subscribe(&id).unwrap();
        drop(publisher);

        let events: Vec<ProgressEvent> = subscription.collect();
        assert_eq!(
            events,
            vec![ProgressEvent::Done(JobOutcome::failed("pipeline aborted"))]
        );
        assert!(!hub.is_live(&id));
    }

    #[test]
    fn test_departed_subscriber_does_not_block_publisher() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(1);
        let id = JobId::generate();
        let mut publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        let subscription = hub.subscribe(&id).unwrap();
        drop(subscription);

        for i in 0..10 {
            publisher.publish(&format!("line {i}")).unwrap();
        }
        publisher.finish(JobOutcome::Completed);
    }

    #[test]
    fn test_slow_subscriber_gets_everything_in_order() {
        let tmp = TempDir::new().unwrap();
        let hub = ProgressChannel::new(1);
        let id = JobId::generate();
        let mut publisher = hub.open(&id, &tmp.path().join("stdout.log")).unwrap();
        let subscription = hub.subscribe(&id).unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0..50 {
                publisher.publish(&i.to_string()).unwrap();
            }
            publisher.finish(JobOutcome::Completed);
        });

        let mut received = Vec::new();
        for event in subscription {
            if let ProgressEvent::Line(line) = event {
                if received.len() % 10 == 0 {
                    std::thread::sleep(Duration::from_millis(5));
                }
                received.push(line.parse::<u32>().unwrap());
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(JobOutcome::Completed.to_string(), "completed");
        assert_eq!(JobOutcome::failed("cancelled").to_string(), "failed: cancelled");
        assert!(!JobOutcome::failed("x").is_completed());
    }
}
