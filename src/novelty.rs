//! Sliced Bloom filter backing `REMEMBER(time, duration, x)`.
//!
//! The remembered window is cut into slices, each a plain Bloom filter
//! covering `duration / S` seconds. Probes consult every retained slice;
//! inserts go to the slice covering the event time. When time moves past
//! the current slice the oldest one is recycled, and its new width is
//! chosen from the observed fill ratios: the per-slice item count is
//! estimated as `-(bits/k) * ln(1 - fill)`, and the recycled slice gets
//! `8.7` bits per estimated item (about a 1.5% false-positive rate),
//! clamped to at least 1024 bits and damped so a quiet slice never halves
//! the allocation in one step.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const NB_HASHES: usize = 6;
const MIN_BITS: usize = 1024;
const BITS_PER_ITEM: f64 = 8.7;

#[derive(Debug, Clone)]
struct Slice {
    start_time: f64,
    /// Bit array packed in u64 words
    words: Vec<u64>,
    nb_bits: usize,
    nb_set: usize,
}

impl Slice {
    fn new(start_time: f64, nb_bits: usize) -> Self {
        Slice {
            start_time,
            words: vec![0u64; nb_bits.div_ceil(64)],
            nb_bits,
            nb_set: 0,
        }
    }

    fn set(&mut self, bit: usize) {
        let w = bit / 64;
        let mask = 1u64 << (bit % 64);
        if self.words[w] & mask == 0 {
            self.words[w] |= mask;
            self.nb_set += 1;
        }
    }

    fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    fn fill_ratio(&self) -> f64 {
        self.nb_set as f64 / self.nb_bits as f64
    }

    /// Items inserted, estimated back from the fill ratio.
    fn estimated_items(&self) -> f64 {
        let fr = self.fill_ratio().min(0.999_999);
        -(self.nb_bits as f64 / NB_HASHES as f64) * (1.0 - fr).ln()
    }
}

/// Novelty filter: was `x` seen within the last `duration` seconds?
#[derive(Debug, Clone)]
pub struct NoveltyFilter {
    slice_width: f64,
    slices: Vec<Slice>,
    /// Round-robin index of the slice covering the most recent times
    current: usize,
    salts: [u64; NB_HASHES],
    started: bool,
}

impl NoveltyFilter {
    /// `duration` in seconds, cut into `nb_slices` slices.
    pub fn new(duration: f64, nb_slices: usize) -> Self {
        let nb_slices = nb_slices.max(1);
        let slice_width = (duration / nb_slices as f64).max(f64::MIN_POSITIVE);
        let mut salts = [0u64; NB_HASHES];
        for s in &mut salts {
            *s = rand::random();
        }
        NoveltyFilter {
            slice_width,
            slices: (0..nb_slices).map(|_| Slice::new(0.0, MIN_BITS)).collect(),
            current: nb_slices - 1,
            salts,
            started: false,
        }
    }

    fn bit_of<T: Hash>(&self, salt: u64, x: &T, nb_bits: usize) -> usize {
        let mut h = DefaultHasher::new();
        salt.hash(&mut h);
        x.hash(&mut h);
        (h.finish() % nb_bits as u64) as usize
    }

    /// Rotate until the current slice covers `t`, recycling oldest slices.
    fn advance_to(&mut self, t: f64) {
        while t >= self.slices[self.current].start_time + self.slice_width {
            let new_start = self.slices[self.current].start_time + self.slice_width;
            // size the recycled slice from the busiest retained slice
            let max_items = self
                .slices
                .iter()
                .map(Slice::estimated_items)
                .fold(0.0f64, f64::max);
            let wanted = ((BITS_PER_ITEM * max_items) as usize).max(MIN_BITS);
            let oldest = (self.current + 1) % self.slices.len();
            let old_bits = self.slices[oldest].nb_bits;
            // damped shrink: never drop below the midpoint in one rotation
            let nb_bits = if wanted < old_bits {
                wanted.max(old_bits.div_ceil(2) + wanted / 2)
            } else {
                wanted
            };
            self.slices[oldest] = Slice::new(new_start, nb_bits);
            self.current = oldest;
        }
    }

    /// Record `x` at time `t`; returns true when `x` was already seen
    /// within the remembered window.
    pub fn remember<T: Hash>(&mut self, t: f64, x: &T) -> bool {
        if !self.started {
            // align the slice ladder so the last slice covers t
            let n = self.slices.len();
            for (i, s) in self.slices.iter_mut().enumerate() {
                s.start_time = t - self.slice_width * (n - 1 - i) as f64;
            }
            self.current = n - 1;
            self.started = true;
        }
        self.advance_to(t);

        let seen = self.slices.iter().any(|s| {
            (0..NB_HASHES).all(|j| s.get(self.bit_of(self.salts[j], x, s.nb_bits)))
        });

        // insert into the slice whose window covers t, or the current one
        // for times older than everything retained
        let idx = self
            .slices
            .iter()
            .position(|s| t >= s.start_time && t < s.start_time + self.slice_width)
            .unwrap_or(self.current);
        for j in 0..NB_HASHES {
            let bit = self.bit_of(self.salts[j], x, self.slices[idx].nb_bits);
            self.slices[idx].set(bit);
        }
        seen
    }

    /// Total bits currently allocated, across slices.
    pub fn nb_bits(&self) -> usize {
        self.slices.iter().map(|s| s.nb_bits).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives_within_window() {
        let mut f = NoveltyFilter::new(60.0, 6);
        for i in 0..1000u64 {
            f.remember(1.0, &i);
        }
        for i in 0..1000u64 {
            assert!(f.remember(2.0, &i), "lost item {i}");
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut f = NoveltyFilter::new(60.0, 6);
        for i in 0..1000u64 {
            f.remember(1.0, &i);
        }
        let mut hits = 0usize;
        for i in 10_000..20_000u64 {
            if f.remember(3.0, &i) {
                hits += 1;
            }
        }
        // target 1.5%, allow headroom up to 3%
        assert!(hits < 300, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn old_items_are_forgotten_after_the_window() {
        let mut f = NoveltyFilter::new(10.0, 5);
        f.remember(0.0, &"ancient");
        // drive time far past the window so every slice recycled
        for t in 1..40 {
            f.remember(f64::from(t), &format!("filler-{t}"));
        }
        assert!(!f.remember(39.5, &"ancient"));
    }

    #[test]
    fn filter_grows_under_load() {
        let mut f = NoveltyFilter::new(10.0, 5);
        let initial = f.nb_bits();
        let mut t = 0.0;
        for i in 0..50_000u64 {
            f.remember(t, &i);
            t += 0.0004; // ~20k items per 8s window
        }
        assert!(f.nb_bits() > initial, "filter never resized");
    }

    #[test]
    fn repeat_within_window_reports_seen() {
        let mut f = NoveltyFilter::new(60.0, 6);
        assert!(!f.remember(1.0, &"alpha"));
        assert!(f.remember(5.0, &"alpha"));
        assert!(!f.remember(5.0, &"beta"));
    }
}
