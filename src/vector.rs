//! Dense vector helpers used by the grouper and the merger.
//!
//! Embeddings are stored as `f32`. Running sums of topic members are kept in
//! `f64` so that long sequences of joins and removals do not accumulate
//! rounding error in the centroid.

/// Cosine similarity of two vectors of equal length.
///
/// Returns `0.0` when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())) as f32
}

/// Unit-length copy of `v`; zero vectors come back unchanged.
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| (*x as f64 / norm) as f32).collect()
}

/// Dot product of two vectors already scaled to unit length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum::<f64>() as f32
}

pub fn add_assign(sum: &mut [f64], v: &[f32]) {
    for (s, x) in sum.iter_mut().zip(v) {
        *s += *x as f64;
    }
}

pub fn to_sum(v: &[f32]) -> Vec<f64> {
    v.iter().map(|x| *x as f64).collect()
}

/// `sum / count`, or an empty vector when `count` is zero.
pub fn centroid_from_sum(sum: &[f64], count: usize) -> Vec<f32> {
    if count == 0 {
        return Vec::new();
    }
    let n = count as f64;
    sum.iter().map(|s| (s / n) as f32).collect()
}

/// Arithmetic mean of a set of vectors of equal length.
pub fn mean<'a, I>(vectors: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for v in vectors {
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        }
        add_assign(&mut sum, v);
        count += 1;
    }
    centroid_from_sum(&sum, count)
}

/// True when every component is finite and at least one is non-zero.
pub fn is_usable(v: &[f32]) -> bool {
    !v.is_empty() && v.iter().all(|x| x.is_finite()) && v.iter().any(|x| *x != 0.0)
}
