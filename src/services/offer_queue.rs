// src/services/offer_queue.rs
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{KestrelError, KestrelResult};

/// One unit of scheduler work, bound to a single dispatch. Redelivered tasks
/// carry their attempt count.
#[derive(Debug, Clone)]
pub struct OfferTask {
    pub dispatch_id: String,
    pub attempt: u32,
}

impl OfferTask {
    pub fn new(dispatch_id: impl Into<String>) -> Self {
        Self {
            dispatch_id: dispatch_id.into(),
            attempt: 0,
        }
    }

    pub fn redelivery(&self) -> Self {
        Self {
            dispatch_id: self.dispatch_id.clone(),
            attempt: self.attempt + 1,
        }
    }
}

#[async_trait]
pub trait OfferQueue: Send + Sync {
    async fn enqueue(&self, task: OfferTask) -> KestrelResult<()>;
}

/// In-process queue over an unbounded channel. The channel hands each task to
/// exactly one worker, which is what keeps a dispatch single-writer.
pub struct InMemoryOfferQueue {
    tx: mpsc::UnboundedSender<OfferTask>,
}

impl InMemoryOfferQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OfferTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OfferQueue for InMemoryOfferQueue {
    async fn enqueue(&self, task: OfferTask) -> KestrelResult<()> {
        self.tx
            .send(task)
            .map_err(|_| KestrelError::internal("offer queue receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_delivers_in_order() {
        let (queue, mut rx) = InMemoryOfferQueue::channel();
        queue.enqueue(OfferTask::new("dsp-1")).await.unwrap();
        queue.enqueue(OfferTask::new("dsp-2")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().dispatch_id, "dsp-1");
        assert_eq!(rx.recv().await.unwrap().dispatch_id, "dsp-2");
    }

    #[tokio::test]
    async fn redelivery_bumps_attempt() {
        let task = OfferTask::new("dsp-1");
        assert_eq!(task.attempt, 0);
        assert_eq!(task.redelivery().attempt, 1);
        assert_eq!(task.redelivery().redelivery().attempt, 2);
    }
}
