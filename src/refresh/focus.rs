//! Host focus and visibility signals.
//!
//! The host application forwards window focus and visibility changes into a
//! [`FocusSignal`]. Queries with `refetch_on_window_focus` listen to it and run
//! their refresh gate when the host becomes visible again.
//!
//! ```
//! use query_signal::refresh::focus::{FocusSignal, HostEvent, Visibility};
//!
//! let signal = FocusSignal::new();
//! signal.emit(HostEvent::VisibilityChange(Visibility::Hidden));
//! assert!(!signal.is_visible());
//! signal.emit(HostEvent::Focus);
//! assert!(signal.is_visible());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Visibility of the host surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// An event reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    /// The host window gained focus. Implies the window is visible.
    Focus,
    VisibilityChange(Visibility),
}

/// A broadcast source of [`HostEvent`]s that remembers the current visibility.
///
/// Clones share the same channel, so the host can keep one clone and hand
/// another to the query client.
#[derive(Debug, Clone)]
pub struct FocusSignal {
    sender: broadcast::Sender<HostEvent>,
    visible: Arc<AtomicBool>,
}

impl FocusSignal {
    /// Creates a signal with room for `capacity` undelivered events per listener.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self {
            sender,
            visible: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates a signal with the default capacity (64).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Records and broadcasts a host event.
    ///
    /// Returns the number of listeners that received it; zero listeners is not an
    /// error, the visibility is still updated.
    pub fn emit(&self, event: HostEvent) -> usize {
        match event {
            HostEvent::Focus => self.visible.store(true, Ordering::Release),
            HostEvent::VisibilityChange(visibility) => self
                .visible
                .store(visibility == Visibility::Visible, Ordering::Release),
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Whether the host was visible as of the last event.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Returns the number of active listeners.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Streams events emitted from now on. Events a lagging listener missed are skipped.
    pub fn events(&self) -> BoxStream<'static, HostEvent> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|result| async move { result.ok() })
            .boxed()
    }
}

impl Default for FocusSignal {
    fn default() -> Self {
        Self::new()
    }
}
