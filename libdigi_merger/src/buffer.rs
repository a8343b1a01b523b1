/// Growable scratch buffer for decoded samples.
///
/// A decoder keeps one of these for its whole run. It grows to fit the largest waveform
/// seen so far and is never shrunk, so steady-state decoding does not allocate.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    samples: Vec<i32>,
    high_water: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the buffer and make room for at least `expected` samples
    pub fn reset(&mut self, expected: usize) {
        self.samples.clear();
        if self.samples.capacity() < expected {
            self.samples.reserve(expected);
        }
    }

    pub fn push(&mut self, sample: i32) {
        self.samples.push(sample);
        self.high_water = self.high_water.max(self.samples.len());
    }

    /// Append `count` copies of `sample`
    pub fn push_run(&mut self, sample: i32, count: usize) {
        self.samples.resize(self.samples.len() + count, sample);
        self.high_water = self.high_water.max(self.samples.len());
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Largest number of samples held at once
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Copy the current contents out as an owned waveform
    pub fn to_waveform(&self) -> Vec<i32> {
        self.samples.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_shrinks() {
        let mut buffer = SampleBuffer::new();
        buffer.reset(64);
        buffer.push_run(7, 64);
        let cap = buffer.capacity();
        buffer.reset(4);
        buffer.push(1);
        assert_eq!(buffer.as_slice(), [1]);
        assert!(buffer.capacity() >= cap);
        assert_eq!(buffer.high_water(), 64);
    }
}
