pub mod condition;
pub mod wait;
pub mod watcher;

pub use condition::{
    evaluate_conditions, Condition, ConditionField, ConditionResult, Operator, TickerField,
};
pub use wait::{EventWaiter, WaitOutcome, WaitRequest, WaitStatus, CANCELLED_REASON};
pub use watcher::{Phase, SubscriptionResult, SubscriptionSpec, SubscriptionWatcher, WatchOutcome};
