use std::sync::Arc;
use tokio::sync::watch;

use crate::vision::Frame;

/// Latest-frame slot. Publishing replaces the previous frame; readers that
/// fall behind skip straight to the newest one.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: Frame) -> Arc<Frame> {
        let frame = Arc::new(frame);
        self.tx.send_replace(Some(Arc::clone(&frame)));
        frame
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage};

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, DynamicImage::ImageLuma8(GrayImage::new(2, 2)))
    }

    #[test]
    fn newest_frame_wins() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        let mut rx = slot.subscribe();
        slot.publish(frame(1));
        slot.publish(frame(2));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().map(|f| f.seq), Some(2));
        assert_eq!(slot.latest().map(|f| f.seq), Some(2));
    }
}
