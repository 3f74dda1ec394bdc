//! Vector math and BLOB codec shared by the store, the index and the
//! signal engine.
//!
//! Vectors are stored in SQLite as little-endian `f32` BLOBs.

/// Encode a float vector as a little-endian byte BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero vector on either side.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize(&mut out);
    out
}

/// Weighted mean of `vectors`; `None` when the input is empty or all
/// weights are zero.
pub fn weighted_average(vectors: &[(&[f32], f32)]) -> Option<Vec<f32>> {
    let dims = vectors.first()?.0.len();
    let mut acc = vec![0.0f32; dims];
    let mut total = 0.0f32;
    for (v, w) in vectors {
        if v.len() != dims {
            continue;
        }
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x * w;
        }
        total += w;
    }
    if total <= f32::EPSILON {
        return None;
    }
    for a in acc.iter_mut() {
        *a /= total;
    }
    Some(acc)
}
