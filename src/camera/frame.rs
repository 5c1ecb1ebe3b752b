use image::GrayImage;

/// One acquired image. `timestamp_ms` counts from the first frame of the
/// source (the run epoch) and strictly increases.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp_ms: i64,
    pub image: GrayImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
