//! Per-request feature extraction.
//!
//! [`extract`] derives the routing feature vector from the parsed chat
//! request: token estimate, code/math flags, character-3-gram entropy,
//! context ratio, prompt embedding, and nearest-centroid assignment. The
//! embedding call is the only suspension point and runs under a 25 ms soft
//! deadline; everything else is pure string work measured in microseconds.
//!
//! Extraction never fails. A missed deadline or collaborator error produces
//! well-formed fallback features (zero-vector embedding, cluster 0, a single
//! unit distance, neutral entropy) with the text-scan heuristics still
//! populated — the triage classifier downstream always gets a usable input.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, LazyLock, Mutex,
};
use std::time::Duration;

use lru::LruCache;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Embedding dimension the routing artifact is trained against.
pub const EMBEDDING_DIM: usize = 384;

/// Reference context window the context ratio is normalized by.
pub const NOMINAL_CONTEXT_TOKENS: u64 = 128_000;

/// How many nearest centroids are recorded per request.
pub const TOP_CENTROIDS: usize = 5;

/// Soft deadline for the embedding call.
const EMBED_DEADLINE: Duration = Duration::from_millis(25);

/// Entropy reported when the prompt is too short to measure (< 3 chars) or
/// extraction fell back entirely.
const NEUTRAL_ENTROPY_BITS: f64 = 4.0;

/// Minimum embedding-cache capacity.
const CACHE_CAPACITY: usize = 1_024;

/// The feature vector produced once per request, immutable thereafter.
#[derive(Debug, Clone)]
pub struct Features {
    pub embedding: Vec<f32>,
    /// Nearest centroid id, in `[0, K)`.
    pub cluster_id: usize,
    /// Distances to the nearest centroids, ascending.
    pub centroid_distances: Vec<f32>,
    /// Estimated prompt tokens: `ceil(len / 4)`.
    pub tokens: u64,
    pub has_code: bool,
    pub has_math: bool,
    /// Shannon entropy of the character-3-gram distribution, in bits.
    pub ngram_entropy: f64,
    /// `min(1, tokens / 128_000)`.
    pub context_ratio: f64,
}

/// Contract the external embedding model must satisfy.
#[async_trait::async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Nearest-centroid lookup over the artifact's centroid matrix.
///
/// An exact linear scan: K is small (tens to a few hundred clusters), so a
/// real ANN structure buys nothing here. The trait boundary is the seam a
/// heavier index would plug into.
#[derive(Debug, Clone, Default)]
pub struct CentroidIndex {
    centroids: Vec<Vec<f32>>,
}

impl CentroidIndex {
    pub fn new(centroids: Vec<Vec<f32>>) -> Self {
        Self { centroids }
    }

    /// Number of clusters (K).
    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Top-`n` nearest centroid `(id, euclidean distance)` pairs, ascending.
    pub fn search(&self, embedding: &[f32], n: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(id, c)| (id, euclidean(embedding, c)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(n);
        scored
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Feature extractor with a per-text embedding cache.
pub struct FeatureExtractor {
    embedder: Option<Arc<dyn EmbeddingService>>,
    cache: Mutex<LruCache<[u8; 32], Vec<f32>>>,
    /// Requests that fell back past the embedding deadline or an error.
    pub fallback_count: AtomicU64,
}

impl FeatureExtractor {
    pub fn new(embedder: Option<Arc<dyn EmbeddingService>>) -> Self {
        Self {
            embedder,
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            fallback_count: AtomicU64::new(0),
        }
    }

    /// Derive features for one request.
    ///
    /// `messages` is the ordered `(role, content)` sequence from the request
    /// body; `index` is the current artifact's centroid index. A missing,
    /// slow, or malformed embedding short-circuits to [`fallback_features`]
    /// — searching the index with a substitute vector would assign an
    /// arbitrary cluster.
    pub async fn extract(&self, messages: &[(String, String)], index: &CentroidIndex) -> Features {
        let prompt = messages
            .iter()
            .map(|(_, content)| content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let embedding = match self.embed_with_deadline(&prompt).await {
            Some(v) if v.len() == EMBEDDING_DIM => v,
            Some(v) => {
                debug!(got = v.len(), want = EMBEDDING_DIM, "embedding dimension mismatch");
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                return fallback_features(&prompt);
            }
            None => {
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                return fallback_features(&prompt);
            }
        };

        let tokens = (prompt.len() as u64).div_ceil(4);
        let (cluster_id, centroid_distances) = if index.is_empty() {
            (0, vec![1.0])
        } else {
            let hits = index.search(&embedding, TOP_CENTROIDS);
            match hits.first() {
                Some(&(id, _)) => (id, hits.iter().map(|&(_, d)| d).collect()),
                None => (0, vec![1.0]),
            }
        };

        Features {
            embedding,
            cluster_id,
            centroid_distances,
            tokens,
            has_code: detect_code(&prompt),
            has_math: detect_math(&prompt),
            ngram_entropy: trigram_entropy(&prompt),
            context_ratio: (tokens as f64 / NOMINAL_CONTEXT_TOKENS as f64).min(1.0),
        }
    }

    async fn embed_with_deadline(&self, prompt: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;

        let key: [u8; 32] = Sha256::digest(prompt.as_bytes()).into();
        if let Some(hit) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            return Some(hit.clone());
        }

        match tokio::time::timeout(EMBED_DEADLINE, embedder.embed(prompt)).await {
            Ok(Ok(v)) => {
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .put(key, v.clone());
                Some(v)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "embedding call failed");
                None
            }
            Err(_) => {
                debug!("embedding call exceeded soft deadline");
                None
            }
        }
    }
}

/// Fully degraded features: text heuristics only, zero embedding, cluster 0.
pub fn fallback_features(prompt: &str) -> Features {
    let tokens = (prompt.len() as u64).div_ceil(4);
    Features {
        embedding: vec![0.0; EMBEDDING_DIM],
        cluster_id: 0,
        centroid_distances: vec![1.0],
        tokens,
        has_code: detect_code(prompt),
        has_math: detect_math(prompt),
        ngram_entropy: NEUTRAL_ENTROPY_BITS,
        context_ratio: (tokens as f64 / NOMINAL_CONTEXT_TOKENS as f64).min(1.0),
    }
}

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"```",                                     // fenced block
        r"`[^`\n]+`",                               // inline span
        r"\b(?:fn|pub fn|impl|let mut)\b",          // Rust
        r"\b(?:def|class|import|lambda)\s",         // Python
        r"\b(?:function|const|var|=>)\s",           // JavaScript
        r"#include\s*<",                            // C/C++
        r"\b(?:SELECT|INSERT|UPDATE|DELETE)\s+.+\s+(?:FROM|INTO|SET)\b", // SQL
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static code regex"))
    .collect()
});

static MATH_DOLLAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$[^$]+\$\$|\$[^$\n]+\$").expect("static math regex"));

const MATH_UNICODE: &[char] = &[
    '∑', '∫', '√', 'π', '≤', '≥', '≠', '±', '×', '÷', '∂', '∇', '∈', '∉', '∀', '∃', '⊂', '⊆',
    '∞', '≈', '≡',
];

/// True when the prompt shows a fenced block, inline code span, or
/// language-keyword shapes.
pub(crate) fn detect_code(prompt: &str) -> bool {
    CODE_PATTERNS.iter().any(|r| r.is_match(prompt))
}

/// True on LaTeX delimiters or mathematical Unicode code points.
pub(crate) fn detect_math(prompt: &str) -> bool {
    MATH_DOLLAR.is_match(prompt) || prompt.chars().any(|c| MATH_UNICODE.contains(&c))
}

/// Shannon entropy of the character-3-gram frequency distribution, in bits.
pub(crate) fn trigram_entropy(prompt: &str) -> f64 {
    let chars: Vec<char> = prompt.chars().collect();
    if chars.len() < 3 {
        return NEUTRAL_ENTROPY_BITS;
    }

    let mut counts: std::collections::HashMap<[char; 3], u64> = std::collections::HashMap::new();
    for w in chars.windows(3) {
        *counts.entry([w[0], w[1], w[2]]).or_default() += 1;
    }

    let total = (chars.len() - 2) as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}
