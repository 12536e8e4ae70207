use serde::{Deserialize, Serialize};

/// Distance metric of a store. Chosen once at construction and never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared L2 distance.
    Euclidean,
    /// `1 - cos(a, b)`, in `[0, 2]`.
    #[default]
    Cosine,
}

const LANES: usize = 8;

impl Metric {
    /// Calculate distance. LOWER is ALWAYS closer/better.
    ///
    /// Accumulates into 8 independent lanes so LLVM can keep a full AVX register busy;
    /// the tail is folded in scalar.
    #[inline(always)]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Metric::Euclidean => {
                let mut acc = [0.0f32; LANES];
                for (ac, bc) in a.chunks_exact(LANES).zip(b.chunks_exact(LANES)) {
                    for i in 0..LANES {
                        let d = ac[i] - bc[i];
                        acc[i] += d * d;
                    }
                }
                let tail = a.len() - a.len() % LANES;
                let mut sum: f32 = acc.iter().sum();
                for i in tail..a.len() {
                    let d = a[i] - b[i];
                    sum += d * d;
                }
                sum
            }
            Metric::Cosine => {
                let mut dot = [0.0f32; LANES];
                let mut na = [0.0f32; LANES];
                let mut nb = [0.0f32; LANES];
                for (ac, bc) in a.chunks_exact(LANES).zip(b.chunks_exact(LANES)) {
                    for i in 0..LANES {
                        dot[i] += ac[i] * bc[i];
                        na[i] += ac[i] * ac[i];
                        nb[i] += bc[i] * bc[i];
                    }
                }
                let tail = a.len() - a.len() % LANES;
                let (mut dot, mut na, mut nb): (f32, f32, f32) =
                    (dot.iter().sum(), na.iter().sum(), nb.iter().sum());
                for i in tail..a.len() {
                    dot += a[i] * b[i];
                    na += a[i] * a[i];
                    nb += b[i] * b[i];
                }

                // A zero vector has no direction; treat it as orthogonal to everything.
                if na == 0.0 || nb == 0.0 {
                    return 1.0;
                }
                (1.0 - dot / (na.sqrt() * nb.sqrt())).max(0.0)
            }
        }
    }

    /// Similarity score reported to callers: higher is better.
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::Euclidean => 1.0 / (1.0 + distance.sqrt()),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}
