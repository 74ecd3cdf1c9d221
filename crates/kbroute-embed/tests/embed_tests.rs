use candle_core::{DType, Device, Tensor};
use kbroute_core::traits::Embedder;
use kbroute_embed::{masked_mean_l2, HashEmbedder};

#[test]
fn masked_mean_l2_ignores_padding_tokens() {
    let dev = Device::Cpu;
    // Two tokens with hidden dim 4; second token is masked out.
    let h = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], (1, 2, 4), &dev).unwrap();
    let mask = Tensor::from_slice(&[1u32, 0u32], (1, 2), &dev).unwrap().to_dtype(DType::F32).unwrap();
    let out = masked_mean_l2(&h, &mask).unwrap();
    let v: Vec<Vec<f32>> = out.to_vec2().unwrap();
    let norm: f32 = (1.0f32 + 4.0 + 9.0 + 16.0).sqrt();
    let expected = [1.0 / norm, 2.0 / norm, 3.0 / norm, 4.0 / norm];
    for (a, b) in v[0].iter().cloned().zip(expected) {
        assert!((a - b).abs() < 1e-5, "a={} b={}", a, b);
    }
}

#[test]
fn hash_embedder_is_deterministic_and_normalized() {
    let e = HashEmbedder::new(16);
    assert_eq!(e.dim(), 16);
    assert_eq!(e.id(), "hash:d16");
    let a = e.embed("Karma yoga and duty").unwrap();
    let b = e.embed("karma YOGA and duty").unwrap();
    assert_eq!(a, b, "tokens are case-folded");
    assert_eq!(a.len(), 16);
    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-4, "norm={}", norm);
}

#[test]
fn hash_embedder_handles_empty_text() {
    let e = HashEmbedder::new(8);
    let v = e.embed("").unwrap();
    assert!(v.iter().all(|x| *x == 0.0));
}
