use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::model::{ExecutionOutput, ExecutionResult};

/// What subscribers of a session channel receive.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Output(ExecutionOutput),
    /// Terminal event; nothing follows it for this execution.
    Completed(ExecutionResult),
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Output(_) => "output",
            Self::Completed(_) => "complete",
        }
    }
}

struct Channel {
    tx: broadcast::Sender<StreamEvent>,
    /// An execution publishes on this channel until `complete`.
    running: bool,
}

/// Logical broadcast channels keyed by session id.
///
/// A channel exists from the first subscriber or the first execution,
/// whichever comes first. Finished results are kept for `retention` so that
/// a subscriber arriving after the run still gets its outputs and
/// completion.
pub struct SessionHub {
    channels: DashMap<String, Channel>,
    finished: DashMap<String, (Instant, ExecutionResult)>,
    capacity: usize,
    retention: Duration,
}

impl SessionHub {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            finished: DashMap::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    fn entry(&self, session_id: &str) -> dashmap::mapref::one::RefMut<'_, String, Channel> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(self.capacity).0,
                running: false,
            })
    }

    /// The sending half of a session's channel, created on first use.
    pub fn channel(&self, session_id: &str) -> broadcast::Sender<StreamEvent> {
        self.entry(session_id).tx.clone()
    }

    /// The channel an execution publishes on. It outlives its subscribers
    /// until [`SessionHub::complete`] retires it.
    pub fn open(&self, session_id: &str) -> broadcast::Sender<StreamEvent> {
        let mut channel = self.entry(session_id);
        channel.running = true;
        channel.tx.clone()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamEvent> {
        debug!(session = %session_id, "New stream subscriber");
        self.entry(session_id).tx.subscribe()
    }

    /// Subscribe to a session, replaying its result if it finished recently.
    ///
    /// The live receiver is taken before the retained result is looked up, so
    /// a run completing in between is seen one way or the other.
    pub fn watch(self: &Arc<Self>, session_id: &str) -> Subscription {
        let receiver = self.subscribe(session_id);
        if let Some(result) = self.retained(session_id) {
            drop(receiver);
            self.release(session_id);
            debug!(session = %session_id, "Replaying finished session");
            return Subscription::replay(self.clone(), session_id, result);
        }
        Subscription {
            session_id: session_id.to_string(),
            hub: self.clone(),
            backlog: VecDeque::new(),
            receiver: Some(receiver),
        }
    }

    /// Publish the terminal event and retire the channel.
    ///
    /// Subscribers drain what was already sent and then see the channel close.
    pub fn complete(&self, session_id: &str, result: ExecutionResult) {
        self.prune();
        if !self.retention.is_zero() {
            self.finished
                .insert(session_id.to_string(), (Instant::now(), result.clone()));
        }
        if let Some((_, channel)) = self.channels.remove(session_id) {
            let _ = channel.tx.send(StreamEvent::Completed(result));
        }
    }

    /// Drop the retained result of a previous run under this id.
    pub fn forget(&self, session_id: &str) {
        self.finished.remove(session_id);
    }

    fn retained(&self, session_id: &str) -> Option<ExecutionResult> {
        let entry = self.finished.get(session_id)?;
        let (at, result) = entry.value();
        (at.elapsed() < self.retention).then(|| result.clone())
    }

    fn prune(&self) {
        let retention = self.retention;
        self.finished.retain(|_, (at, _)| at.elapsed() < retention);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|channel| channel.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop an idle channel once nobody listens any more.
    pub fn release(&self, session_id: &str) {
        self.channels.remove_if(session_id, |_, channel| {
            !channel.running && channel.tx.receiver_count() == 0
        });
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One subscriber's view of a session. Dropping it releases the channel
/// when it was the last listener.
pub struct Subscription {
    session_id: String,
    hub: Arc<SessionHub>,
    backlog: VecDeque<StreamEvent>,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
}

impl Subscription {
    fn replay(hub: Arc<SessionHub>, session_id: &str, result: ExecutionResult) -> Self {
        let mut backlog: VecDeque<StreamEvent> = result
            .outputs
            .iter()
            .cloned()
            .map(StreamEvent::Output)
            .collect();
        backlog.push_back(StreamEvent::Completed(result));
        Self {
            session_id: session_id.to_string(),
            hub,
            backlog,
            receiver: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this subscription replays a finished run.
    pub fn is_replay(&self) -> bool {
        self.receiver.is_none()
    }

    /// The next event, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %self.session_id, skipped, "Slow stream subscriber missed outputs");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.receiver.take().is_some() {
            self.hub.release(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(retention_secs: u64) -> Arc<SessionHub> {
        Arc::new(SessionHub::new(16, Duration::from_secs(retention_secs)))
    }

    fn finished(content: &str) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        result.success = true;
        result.outputs.push(ExecutionOutput::text(content));
        result
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let hub = hub(0);
        let mut a = hub.subscribe("s1");
        let mut b = hub.subscribe("s1");
        hub.channel("s1")
            .send(StreamEvent::Output(ExecutionOutput::text("hi")))
            .unwrap();

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                StreamEvent::Output(o) => assert_eq!(o.content, "hi"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let hub = hub(0);
        assert!(hub
            .channel("lonely")
            .send(StreamEvent::Output(ExecutionOutput::text("x")))
            .is_err());
        hub.release("lonely");
        assert!(hub.is_empty());
    }

    #[test]
    fn test_release_keeps_watched_channels() {
        let hub = hub(0);
        let _rx = hub.subscribe("watched");
        hub.release("watched");
        assert_eq!(hub.subscriber_count("watched"), 1);
        assert_eq!(StreamEvent::Completed(ExecutionResult::default()).name(), "complete");
    }

    #[tokio::test]
    async fn test_complete_lets_subscribers_drain() {
        let hub = hub(0);
        let mut rx = hub.subscribe("done");
        hub.channel("done")
            .send(StreamEvent::Output(ExecutionOutput::text("hi")))
            .unwrap();
        hub.complete("done", ExecutionResult::default());
        assert!(hub.is_empty());

        assert!(matches!(rx.recv().await, Ok(StreamEvent::Output(_))));
        assert!(matches!(rx.recv().await, Ok(StreamEvent::Completed(_))));
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_watch_before_execution_receives_live_events() {
        let hub = hub(60);
        let mut subscription = hub.watch("early");
        assert!(!subscription.is_replay());

        // The execution picks up the channel the subscriber created.
        hub.open("early")
            .send(StreamEvent::Output(ExecutionOutput::text("live")))
            .unwrap();
        hub.complete("early", finished("live"));

        match subscription.recv().await {
            Some(StreamEvent::Output(o)) => assert_eq!(o.content, "live"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(subscription.recv().await, Some(StreamEvent::Completed(_))));
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_late_watcher_gets_replay() {
        let hub = hub(60);
        hub.complete("late", finished("hi"));

        let mut subscription = hub.watch("late");
        assert!(subscription.is_replay());
        assert!(hub.is_empty());
        match subscription.recv().await {
            Some(StreamEvent::Output(o)) => assert_eq!(o.content, "hi"),
            other => panic!("unexpected {:?}", other),
        }
        match subscription.recv().await {
            Some(StreamEvent::Completed(result)) => assert!(result.success),
            other => panic!("unexpected {:?}", other),
        }
        assert!(subscription.recv().await.is_none());
    }

    #[test]
    fn test_forget_and_zero_retention_skip_replay() {
        let hub = hub(60);
        hub.complete("again", finished("old"));
        hub.forget("again");
        assert!(!hub.watch("again").is_replay());

        let hub = SessionHub::new(16, Duration::ZERO);
        let hub = Arc::new(hub);
        hub.complete("none", finished("x"));
        assert!(!hub.watch("none").is_replay());
    }

    #[tokio::test]
    async fn test_running_channel_survives_subscriber_churn() {
        let hub = hub(0);
        let tx = hub.open("busy");
        drop(hub.watch("busy"));
        assert_eq!(hub.len(), 1);

        let mut subscription = hub.watch("busy");
        tx.send(StreamEvent::Output(ExecutionOutput::text("still here")))
            .unwrap();
        match subscription.recv().await {
            Some(StreamEvent::Output(o)) => assert_eq!(o.content, "still here"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dropped_subscription_releases_channel() {
        let hub = hub(0);
        let subscription = hub.watch("gone");
        assert_eq!(hub.subscriber_count("gone"), 1);
        drop(subscription);
        assert!(hub.is_empty());
    }
}
