//! Event sources for the execution loop.
//!
//! The engine pulls one event at a time from an [`EventSource`]. A
//! [`Scheduler`](crate::scheduler::Scheduler) is the usual source; an
//! [`EventQueue`] lets another task submit events as it goes.

use async_trait::async_trait;
use mda_core::error::{AcqError, AcqResult};
use mda_core::event::AcquisitionEvent;
use tokio::sync::mpsc;

/// Something the engine can pull events from.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` when the source is exhausted.
    async fn next_event(&mut self) -> Option<AcquisitionEvent>;
}

#[async_trait]
impl EventSource for crate::scheduler::Scheduler {
    async fn next_event(&mut self) -> Option<AcquisitionEvent> {
        crate::scheduler::Scheduler::next_event(self)
    }
}

/// Bounded queue of externally submitted events.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::Receiver<AcquisitionEvent>,
}

/// Submitting side of an [`EventQueue`].
#[derive(Debug, Clone)]
pub struct EventQueueHandle {
    tx: mpsc::Sender<AcquisitionEvent>,
}

impl EventQueue {
    /// Queue holding at most `depth` pending events.
    #[must_use]
    pub fn new(depth: usize) -> (EventQueueHandle, Self) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (EventQueueHandle { tx }, Self { rx })
    }
}

#[async_trait]
impl EventSource for EventQueue {
    async fn next_event(&mut self) -> Option<AcquisitionEvent> {
        self.rx.recv().await
    }
}

impl EventQueueHandle {
    /// Submits an event, waiting for room.
    pub async fn submit(&self, event: AcquisitionEvent) -> AcqResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AcqError::InvalidState("event queue consumer is gone".into()))
    }

    /// Submits several events in order.
    pub async fn submit_all(
        &self,
        events: impl IntoIterator<Item = AcquisitionEvent> + Send,
    ) -> AcqResult<()> {
        for event in events {
            self.submit(event).await?;
        }
        Ok(())
    }

    /// Wakes a loop blocked on the queue without doing anything else.
    pub async fn requery(&self) -> AcqResult<()> {
        self.submit(AcquisitionEvent::RequeryQueue).await
    }

    /// Ends the engine task consuming this queue.
    pub async fn finish(&self) -> AcqResult<()> {
        self.submit(AcquisitionEvent::EngineTaskFinished).await
    }
}
