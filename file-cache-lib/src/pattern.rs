/// Per-handle access pattern tracking. A read is sequential when it starts
/// exactly where the previous read on the same handle ended; the very first
/// read on a handle is random.
#[derive(Debug, Default)]
pub struct AccessState {
    last: Option<(u64, u64)>,
    sequential_bytes: u64,
}

impl AccessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies the read and records it as the new previous read.
    pub fn classify(&mut self, offset: u64, length: u64) -> bool {
        let is_sequential = match self.last {
            Some((prev_offset, prev_length)) => offset == prev_offset + prev_length,
            None => false,
        };
        if is_sequential {
            self.sequential_bytes = self.sequential_bytes.saturating_add(length);
        } else {
            self.sequential_bytes = length;
        }
        self.last = Some((offset, length));
        is_sequential
    }

    /// Bytes read through the current unbroken sequential run.
    pub fn sequential_bytes(&self) -> u64 {
        self.sequential_bytes
    }
}
