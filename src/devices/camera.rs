use image::DynamicImage;

use crate::vision::Frame;

/// A frame source. `grab` blocks until the next frame is ready and `read`
/// decodes it.
pub trait Camera: Send {
    fn open(&mut self) -> bool;
    fn is_opened(&self) -> bool;
    fn grab(&mut self) -> bool;
    fn read(&mut self) -> Option<DynamicImage>;
}

/// Live preview surface.
pub trait Display: Send {
    /// Current drawable size; `(0, 0)` while the window is minimized.
    fn viewport(&self) -> (u32, u32);
    fn render(&mut self, frame: &Frame);
}
