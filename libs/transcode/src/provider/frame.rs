use std::fmt;

use bytes::Bytes;

/// Release hook for the resources backing a decoded frame.
pub struct FrameLease(Box<dyn FnOnce() + Send>);

impl FrameLease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        FrameLease(Box::new(release))
    }

    fn release(self) {
        (self.0)()
    }
}

/// A decoded picture.
///
/// Frames hold provider resources until [`VideoFrame::close`] is called or the frame
/// is dropped, whichever comes first. The lease is released exactly once.
pub struct VideoFrame {
    timestamp: i64,
    duration: Option<u64>,
    coded_width: u32,
    coded_height: u32,
    data: Bytes,
    lease: Option<FrameLease>,
}

impl VideoFrame {
    pub fn new(
        timestamp: i64,
        duration: Option<u64>,
        coded_width: u32,
        coded_height: u32,
        data: Bytes,
    ) -> Self {
        Self {
            timestamp,
            duration,
            coded_width,
            coded_height,
            data,
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: FrameLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Presentation timestamp in microseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    pub fn coded_width(&self) -> u32 {
        self.coded_width
    }

    pub fn coded_height(&self) -> u32 {
        self.coded_height
    }

    /// Opaque picture payload; its layout is private to the provider that made it.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("coded_width", &self.coded_width)
            .field("coded_height", &self.coded_height)
            .field("len", &self.data.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}
