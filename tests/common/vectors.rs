use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generate `n` random vectors of dimension `dims` with uniform f32 values in
/// [-1, 1], flattened row-major.
pub fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dims).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Generate vectors clustered around `n_clusters` known centroids.
/// Returns (flat vectors, flat centroids).
///
/// Each centroid is a random unit vector. Vectors in each cluster are the
/// centroid plus uniform noise in `[-noise, noise]` per component.
pub fn clustered_vectors(
    n_clusters: usize,
    n_per_cluster: usize,
    dims: usize,
    noise: f32,
    seed: u64,
) -> (Vec<f32>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut centroids = Vec::with_capacity(n_clusters * dims);
    for _ in 0..n_clusters {
        let v: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        centroids.extend(v.iter().map(|x| x / norm));
    }

    let mut vectors = Vec::with_capacity(n_clusters * n_per_cluster * dims);
    for centroid in centroids.chunks_exact(dims) {
        for _ in 0..n_per_cluster {
            vectors.extend(centroid.iter().map(|&c| c + rng.gen_range(-noise..noise)));
        }
    }

    (vectors, centroids)
}

/// Row `i` of a flat vector buffer.
pub fn row(vectors: &[f32], dims: usize, i: usize) -> &[f32] {
    &vectors[i * dims..(i + 1) * dims]
}
