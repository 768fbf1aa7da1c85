//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls [`events::InternalEvent::emit`] on the given event, which records
/// the corresponding Prometheus metric.
///
/// ```ignore
/// use snowdrift::metrics::events::MessagesAcked;
///
/// emit!(MessagesAcked { count: 100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
