mod base;
mod emitter;
mod throttle;

pub use base::{
    CompletedEvent, ErrorEvent, EventBus, EventKind, ExecutionEvent, GraphSummary, NodeSnapshot,
    ProgressEvent, StartedEvent,
};
pub use emitter::{EventEmitter, Listener, Subscription, DEFAULT_PROGRESS_THROTTLE};
pub use throttle::Throttle;
