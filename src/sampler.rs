//! Token sampling strategies
//!
//! Takes a logits vector of vocabulary length and returns the next token
//! index. Three strategies, dispatched through one sum type:
//!
//! - **Argmax**: greedy; ties go to the lowest index
//! - **Simple**: temperature-1 softmax, inverse-CDF draw
//! - **Nucleus**: temperature softmax restricted to the smallest
//!   probability-mass prefix ≥ p
//!
//! Randomness comes from a 64-bit xorshift* generator so runs are exactly
//! reproducible from a seed. The inverse-CDF routines fall back to the last
//! candidate to survive accumulated floating-point drift.

use crate::kernels;

/// 64-bit xorshift* pseudo-random generator
///
/// State evolution: `s ^= s>>12; s ^= s<<25; s ^= s>>27`, output
/// `(s * 0x2545F4914F6CDD1D) >> 32`.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Seed the generator; a zero state would be a fixed point, so it is
    /// replaced with the output multiplier
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x2545_F491_4F6C_DD1D } else { seed },
        }
    }

    /// Next 32 random bits
    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    /// Random f32 in `[0, 1)` with 24 bits of resolution
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16_777_216.0
    }
}

/// Softmax with temperature scaling into a fresh probability vector
fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let mut probs: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();
    kernels::softmax(&mut probs);
    probs
}

/// Inverse-CDF draw from a probability slice
///
/// `coin` must lie in `[0, total mass)`. Falls back to the last index when
/// rounding error keeps the accumulator below the coin.
fn sample_from_distribution(probs: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i;
        }
    }
    probs.len() - 1
}

/// Index of the maximum element; ties resolve to the lowest index
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

/// Token sampler, dispatched by strategy
#[derive(Debug, Clone)]
pub enum Sampler {
    /// Greedy argmax
    Argmax,
    /// Temperature-1 categorical sampling
    Simple {
        /// Generator state
        rng: XorShiftRng,
    },
    /// Nucleus (top-p) sampling with temperature
    Nucleus {
        /// Softmax temperature; clamped away from zero so the `T → 0`
        /// limit degenerates toward argmax instead of NaN
        temperature: f32,
        /// Cumulative probability threshold
        top_p: f32,
        /// Generator state
        rng: XorShiftRng,
        /// Sort scratch reused across calls: `(prob, index)`
        prob_index: Vec<(f32, usize)>,
    },
}

impl Sampler {
    /// Greedy sampler
    #[must_use]
    pub fn argmax() -> Self {
        Self::Argmax
    }

    /// Plain categorical sampler at temperature 1
    #[must_use]
    pub fn simple(seed: u64) -> Self {
        Self::Simple {
            rng: XorShiftRng::new(seed),
        }
    }

    /// Nucleus sampler with scratch preallocated for `vocab_size` entries
    #[must_use]
    pub fn nucleus(vocab_size: usize, temperature: f32, top_p: f32, seed: u64) -> Self {
        Self::Nucleus {
            temperature: temperature.max(1e-10),
            top_p,
            rng: XorShiftRng::new(seed),
            prob_index: Vec::with_capacity(vocab_size),
        }
    }

    /// Sample the next token index from a logits vector
    pub fn sample(&mut self, logits: &[f32]) -> usize {
        match self {
            Self::Argmax => argmax(logits),
            Self::Simple { rng } => {
                let probs = softmax_with_temperature(logits, 1.0);
                let coin = rng.next_f32();
                sample_from_distribution(&probs, coin)
            }
            Self::Nucleus {
                temperature,
                top_p,
                rng,
                prob_index,
            } => sample_nucleus(logits, *temperature, *top_p, rng, prob_index),
        }
    }
}

/// Nucleus sampling body
///
/// Entries below `(1 - p) / (V - 1)` cannot be part of any valid nucleus
/// and are discarded before the sort. The kept entries sort descending by
/// probability; the shortest prefix whose cumulative mass meets or exceeds
/// `p` forms the nucleus, and the draw rescales to that prefix mass.
fn sample_nucleus(
    logits: &[f32],
    temperature: f32,
    top_p: f32,
    rng: &mut XorShiftRng,
    prob_index: &mut Vec<(f32, usize)>,
) -> usize {
    if logits.len() < 2 {
        return 0;
    }

    let probs = softmax_with_temperature(logits, temperature);

    prob_index.clear();
    let cutoff = (1.0 - top_p) / (probs.len() - 1) as f32;
    for (i, &p) in probs.iter().enumerate() {
        if p >= cutoff {
            prob_index.push((p, i));
        }
    }
    // A small p over a near-uniform distribution can leave nothing above
    // the cutoff; degrade to greedy rather than sampling an empty nucleus
    if prob_index.is_empty() {
        return argmax(&probs);
    }
    prob_index.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut last = prob_index.len() - 1;
    for (i, &(p, _)) in prob_index.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            last = i;
            break;
        }
    }

    let coin = rng.next_f32() * cumulative;
    let nucleus = &prob_index[..=last];

    let mut cdf = 0.0f32;
    for &(p, index) in nucleus {
        cdf += p;
        if coin < cdf {
            return index;
        }
    }
    nucleus[last].1
}
