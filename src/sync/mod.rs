//! Push synchronization: events, channels and the reconciler that patches
//! cached collections in place.

pub mod channel;
pub mod events;
pub mod reconciler;

pub use channel::{InMemoryPushChannel, Subscription};
pub use events::{PushEvent, PushOperation};
pub use reconciler::{
    page_key, InsertPosition, ReconcileOutcome, ReconcilerConfig, ReconcilerHandle,
    UpdateReconciler,
};
