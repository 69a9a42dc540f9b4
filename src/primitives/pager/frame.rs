use parking_lot::RwLock;
use std::sync::Arc;

/// One page worth of bytes. Frames are shared by `Arc` so outstanding guards
/// survive growth of the frame table.
#[derive(Clone)]
pub struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
        }
    }
}
