use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::io;

/// Endless, epoch-shuffled iteration over an owned corpus.
///
/// The cursor and the permuted copy are the entire iteration state. Each pass
/// starts with a fresh in-place shuffle drawn from the cycler's own RNG, so two
/// cyclers never share randomness. One consumer per instance.
#[derive(Debug)]
pub struct CorpusCycler<T> {
    label: String,
    items: Vec<T>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl<T: Clone> CorpusCycler<T> {
    pub fn new(label: impl Into<String>, items: Vec<T>, seed: u64) -> io::Result<Self> {
        let label = label.into();
        if items.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot cycle over empty corpus '{label}'"),
            ));
        }

        Ok(Self {
            label,
            items,
            cursor: 0,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of completed passes.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn next_item(&mut self) -> T {
        if self.cursor == 0 {
            self.items.shuffle(&mut self.rng);
        }

        let item = self.items[self.cursor].clone();
        self.cursor += 1;

        if self.cursor == self.items.len() {
            self.cursor = 0;
            self.epoch += 1;
            tracing::debug!(corpus = %self.label, epoch = self.epoch, "finished corpus pass");
        }

        item
    }
}

impl<T: Clone> Iterator for CorpusCycler<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        Some(self.next_item())
    }
}
