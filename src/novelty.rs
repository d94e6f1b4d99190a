//! The novelty filter behind `REMEMBER(time, duration, x)`: has `x` been
//! seen within the last `duration` seconds?
//!
//! A sliced Bloom filter: `NB_SLICES` slices each covering
//! `duration / NB_SLICES` seconds of event time. Probes hit every slice;
//! inserts go to the slice whose window covers the event time. When time
//! moves past the current slice, the oldest one is recycled, and its new
//! bit width is chosen from the observed fill ratios so the filter
//! tracks the actual insertion rate (target false-positive rate 1.5%).

use xxhash_rust::xxh3::xxh3_64_with_seed;

const NB_SLICES: usize = 10;
const NB_HASHES: u32 = 6;
const MIN_BITS: u32 = 1024;
/// Bits per expected item for ~1.5% false positives with 6 hashes.
const BITS_PER_ITEM: f64 = 8.7;

struct Slice {
    start_time: f64,
    bits: Vec<u64>,
    nb_bits: u32,
    nb_set: u32,
}

impl Slice {
    fn new(start_time: f64, nb_bits: u32) -> Slice {
        Slice {
            start_time,
            bits: vec![0; (nb_bits as usize).div_ceil(64)],
            nb_bits,
            nb_set: 0,
        }
    }

    fn set(&mut self, h: u64) {
        let bit = (h % self.nb_bits as u64) as usize;
        let mask = 1u64 << (bit % 64);
        if self.bits[bit / 64] & mask == 0 {
            self.bits[bit / 64] |= mask;
            self.nb_set += 1;
        }
    }

    fn get(&self, h: u64) -> bool {
        let bit = (h % self.nb_bits as u64) as usize;
        self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    fn fill_ratio(&self) -> f64 {
        self.nb_set as f64 / self.nb_bits as f64
    }

    /// Estimate how many distinct items were inserted from the fill
    /// ratio: n̂ = -(nb_bits / k) · ln(1 - fr).
    fn estimated_items(&self) -> f64 {
        let fr = self.fill_ratio().min(0.999_999);
        -(self.nb_bits as f64 / NB_HASHES as f64) * (1.0 - fr).ln()
    }
}

pub struct NoveltyFilter {
    slices: Vec<Slice>,
    /// Round-robin index of the most recent slice.
    current: usize,
    slice_width: f64,
    salts: [u64; NB_HASHES as usize],
    started: bool,
}

impl NoveltyFilter {
    pub fn new(duration: f64) -> NoveltyFilter {
        let slice_width = (duration / NB_SLICES as f64).max(1e-9);
        let mut salts = [0u64; NB_HASHES as usize];
        for (i, s) in salts.iter_mut().enumerate() {
            *s = rand::random::<u64>().wrapping_add(i as u64);
        }
        NoveltyFilter {
            slices: Vec::new(),
            current: 0,
            slice_width,
            salts,
            started: false,
        }
    }

    /// True when `x` was seen within the covered window; `x` is then
    /// remembered at time `t`.
    pub fn remember(&mut self, t: f64, x: &[u8]) -> bool {
        self.advance_to(t);
        let hashes = self.hashes(x);
        let seen = self.probe(&hashes);
        if let Some(slice) = self.covering_slice(t) {
            for h in &hashes {
                self.slices[slice].set(*h);
            }
        }
        seen
    }

    fn hashes(&self, x: &[u8]) -> Vec<u64> {
        self.salts
            .iter()
            .map(|salt| xxh3_64_with_seed(x, *salt))
            .collect()
    }

    fn probe(&self, hashes: &[u64]) -> bool {
        self.slices
            .iter()
            .any(|s| hashes.iter().all(|h| s.get(*h)))
    }

    /// Probe without inserting; only statistics tests need this.
    #[cfg(test)]
    fn seen(&mut self, t: f64, x: &[u8]) -> bool {
        self.advance_to(t);
        let hashes = self.hashes(x);
        self.probe(&hashes)
    }

    fn advance_to(&mut self, t: f64) {
        if !self.started {
            // Align the first slice on the event time.
            for i in 0..NB_SLICES {
                self.slices.push(Slice::new(
                    t - (NB_SLICES - 1 - i) as f64 * self.slice_width,
                    MIN_BITS,
                ));
            }
            self.current = NB_SLICES - 1;
            self.started = true;
            return;
        }
        while t >= self.slices[self.current].start_time + self.slice_width {
            let next_start = self.slices[self.current].start_time + self.slice_width;
            let nb_bits = self.next_slice_bits();
            let oldest = (self.current + 1) % NB_SLICES;
            self.slices[oldest] = Slice::new(next_start, nb_bits);
            self.current = oldest;
        }
    }

    /// Size the recycled slice from the observed fill: enough bits for
    /// the busiest recent slice, clamped below, and damped so one quiet
    /// slice cannot halve the filter.
    fn next_slice_bits(&self) -> u32 {
        let max_items = self
            .slices
            .iter()
            .map(Slice::estimated_items)
            .fold(0.0f64, f64::max);
        let target = (BITS_PER_ITEM * max_items) as u32;
        let old = self.slices[self.current].nb_bits;
        let damped = target.max((target + old) / 2);
        damped.max(MIN_BITS)
    }

    /// The slice whose time window covers `t`; `None` when `t` is older
    /// than everything retained.
    fn covering_slice(&self, t: f64) -> Option<usize> {
        for off in 0..NB_SLICES {
            let i = (self.current + NB_SLICES - off) % NB_SLICES;
            let s = &self.slices[i];
            if t >= s.start_time {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives_within_the_window() {
        let mut f = NoveltyFilter::new(100.0);
        for i in 0..1000u32 {
            f.remember(0.0, format!("item-{i}").as_bytes());
        }
        for i in 0..1000u32 {
            let key = format!("item-{i}");
            assert!(f.remember(1.0, key.as_bytes()), "{key} forgotten");
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let mut f = NoveltyFilter::new(100.0);
        for i in 0..100u32 {
            f.remember(0.0, format!("present-{i}").as_bytes());
        }
        let mut hits = 0;
        for i in 0..1000u32 {
            if f.seen(1.0, format!("absent-{i}").as_bytes()) {
                hits += 1;
            }
        }
        // 1.5% design target, 3% headroom.
        assert!(hits <= 30, "false positive rate too high: {hits}/1000");
    }

    #[test]
    fn old_items_age_out() {
        let mut f = NoveltyFilter::new(10.0);
        f.remember(0.0, b"ephemeral");
        assert!(f.remember(1.0, b"ephemeral"));
        // Far beyond the duration: every slice has been recycled.
        assert!(!f.remember(100.0, b"ephemeral"));
    }

    #[test]
    fn slices_grow_under_load() {
        let mut f = NoveltyFilter::new(10.0);
        for i in 0..20_000u32 {
            f.remember(0.5, format!("k{i}").as_bytes());
        }
        // Tick over a slice boundary and check the recycled slice grew.
        f.remember(1.6, b"tick");
        let grown = f.slices.iter().map(|s| s.nb_bits).max().unwrap();
        assert!(grown > MIN_BITS, "slice did not grow: {grown}");
    }
}
