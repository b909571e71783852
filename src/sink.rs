//! Diagnostic message sink.
//!
//! Every failure and every logged verification rejection is reported as a
//! `(component, message, is_error)` record. Builders carry their own sink
//! handle; the process-wide one is what [`ContextBuilder::new`] picks up.
//!
//! [`ContextBuilder::new`]: crate::ContextBuilder::new

use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info};

/// Component tag for context construction records.
pub const CONTEXT_COMPONENT: &str = "TLS_Context";
/// Component tag for peer certificate verification records.
pub const CERT_COMPONENT: &str = "Cert";

/// Receiver of diagnostic records.
pub trait MessageSink: Send + Sync {
    /// Handles a single record.
    fn message(&self, component: &str, text: &str, is_error: bool);
}

impl<F> MessageSink for F
where
    F: Fn(&str, &str, bool) + Send + Sync,
{
    fn message(&self, component: &str, text: &str, is_error: bool) {
        self(component, text, is_error);
    }
}

/// Sink forwarding records to [`tracing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn message(&self, component: &str, text: &str, is_error: bool) {
        if is_error {
            error!(component, "{text}");
        } else {
            info!(component, "{text}");
        }
    }
}

static GLOBAL_SINK: RwLock<Option<Arc<dyn MessageSink>>> = RwLock::new(None);

/// Replaces the process-wide sink.
pub fn set_message_sink(sink: Arc<dyn MessageSink>) {
    *GLOBAL_SINK.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
}

/// Returns the process-wide sink, [`TracingSink`] if none was installed.
#[must_use]
pub fn message_sink() -> Arc<dyn MessageSink> {
    GLOBAL_SINK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_else(|| Arc::new(TracingSink))
}
