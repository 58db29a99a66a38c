use super::base::{EventBus, EventKind, ExecutionEvent, ProgressEvent};
use super::throttle::Throttle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

pub const DEFAULT_PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

pub type Listener = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(u64, Listener)>>> {
        self.by_kind.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, event: &ExecutionEvent) {
        // Snapshot first so listeners may subscribe or unsubscribe while being called.
        let listeners: Vec<Listener> = self
            .lock()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Handle returned by [`EventEmitter::on`].
pub struct Subscription {
    id: u64,
    kind: EventKind,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Some(entries) = listeners.lock().get_mut(&self.kind) {
                entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Per-run pub/sub for execution events, with throttled progress.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<Listeners>,
    progress: Arc<Throttle<ProgressEvent>>,
}

impl EventEmitter {
    pub fn new(progress_interval: Duration) -> Self {
        let listeners = Arc::new(Listeners::default());
        let sink = listeners.clone();
        let progress = Throttle::new(progress_interval, move |event: ProgressEvent| {
            sink.dispatch(&ExecutionEvent::Progress(event));
        });
        Self {
            listeners,
            progress,
        }
    }

    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ExecutionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            kind,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Forward every event kind into a process-wide bus.
    pub fn forward_to(&self, bus: &EventBus) -> Vec<Subscription> {
        EventKind::ALL
            .iter()
            .map(|kind| {
                let sender = bus.sender();
                self.on(*kind, move |event| {
                    let _ = sender.send(event.clone());
                })
            })
            .collect()
    }

    /// Progress is throttled; terminal events flush pending progress first so
    /// observers never see progress arrive after completion.
    pub fn emit(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Progress(progress) => self.progress.push(progress),
            ExecutionEvent::Started(_) => self.listeners.dispatch(&event),
            ExecutionEvent::Completed(_) | ExecutionEvent::Error(_) => {
                self.progress.flush();
                self.listeners.dispatch(&event);
            }
        }
    }

    pub fn emit_progress(&self, event: ProgressEvent) {
        self.progress.push(event);
    }

    pub fn flush(&self) -> bool {
        self.progress.flush()
    }

    pub fn remove_all_listeners(&self) {
        self.progress.cancel();
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_THROTTLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::base::StartedEvent;
    use chrono::Utc;

    fn progress(value: u8) -> ProgressEvent {
        ProgressEvent {
            node_id: "n1".into(),
            execution_id: "e1".into(),
            progress: value,
            node_progress: value,
            message: format!("{}%", value),
            estimated_time_remaining: None,
            nodes: Vec::new(),
        }
    }

    fn recorder(emitter: &EventEmitter, kind: EventKind) -> Arc<Mutex<Vec<ExecutionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        emitter.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_throttled() {
        let emitter = EventEmitter::new(Duration::from_millis(100));
        let seen = recorder(&emitter, EventKind::Progress);

        for i in 0..12 {
            emitter.emit_progress(progress(i * 5));
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = seen.lock().unwrap();
        assert!(seen.len() <= 2, "got {} emissions", seen.len());
        match seen.last() {
            Some(ExecutionEvent::Progress(p)) => assert_eq!(p.progress, 55),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_last_pending() {
        let emitter = EventEmitter::new(Duration::from_millis(100));
        let seen = recorder(&emitter, EventKind::Progress);

        emitter.emit_progress(progress(10));
        emitter.emit_progress(progress(20));
        emitter.emit_progress(progress(90));
        assert!(emitter.flush());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], ExecutionEvent::Progress(p) if p.progress == 90));
    }

    #[test]
    fn test_unsubscribe_and_remove_all() {
        let emitter = EventEmitter::default();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let subscription = emitter.on(EventKind::Started, move |_| *counter.lock().unwrap() += 1);
        let _other = emitter.on(EventKind::Error, |_| {});

        let started = ExecutionEvent::Started(StartedEvent {
            execution_id: "e1".into(),
            node_id: "n1".into(),
            node_type: "debug.log".into(),
            timestamp: Utc::now(),
            graph: None,
        });
        emitter.emit(started.clone());
        subscription.unsubscribe();
        emitter.emit(started);
        assert_eq!(*seen.lock().unwrap(), 1);

        assert_eq!(emitter.listener_count(EventKind::Error), 1);
        emitter.emit_progress(progress(1));
        emitter.emit_progress(progress(2));
        emitter.remove_all_listeners();
        assert_eq!(emitter.listener_count(EventKind::Error), 0);
        assert!(!emitter.flush());
    }
}
