use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
#[cfg(feature = "cuda")]
use symtensor_core::FallbackPolicy;
use symtensor_core::{CompileConfig, ElemKind, Graph, ReduceOpType, Tensor, VarId};

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len(), "{got:?} vs {want:?}");
    for (g, w) in got.iter().zip(want) {
        assert_relative_eq!(*g, *w, epsilon = 1e-6, max_relative = 1e-5);
    }
}

struct RandomCase {
    graph: Graph,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    args: Vec<Tensor>,
}

/// An elementwise chain over two same-shaped inputs, optionally followed by
/// a layout change and a reduction. Shapes include empty and single-element axes.
fn random_case(rng: &mut StdRng) -> RandomCase {
    const DIMS: [usize; 5] = [0, 1, 1, 3, 7];
    let mut rank = rng.gen_range(1..=2usize);
    let shape = (0..rank)
        .map(|_| DIMS[rng.gen_range(0..DIMS.len())])
        .collect::<Vec<_>>();
    let numel = shape.iter().product::<usize>();
    let values = Uniform::new(-2f32, 2f32);
    let mut args = Vec::new();
    for _ in 0..2 {
        let data = (0..numel).map(|_| values.sample(&mut *rng)).collect::<Vec<_>>();
        args.push(Tensor::from_vec(shape.clone(), data).unwrap());
    }

    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, rank);
    let y = g.input(ElemKind::F32, rank);
    let mut v = x;
    for _ in 0..rng.gen_range(1..=4) {
        v = match rng.gen_range(0..9) {
            0 => g.tanh(v),
            1 => g.sigmoid(v),
            2 => g.neg(v),
            3 => g.relu(v),
            4 => {
                let t = g.tanh(v).unwrap();
                g.exp(t)
            }
            5 => g.add(v, y),
            6 => g.mul(v, y),
            7 => g.sub(y, v),
            _ => {
                let c = g.scalar(rng.gen_range(-1.5f32..1.5));
                g.mul(v, c)
            }
        }
        .unwrap();
    }
    let mut outputs = vec![v];

    if rank == 2 && rng.gen_bool(0.5) {
        v = g.transpose(v, [1, 0]).unwrap();
    }
    if rng.gen_bool(0.5) {
        v = g.reshape(v, [numel]).unwrap();
        rank = 1;
    }
    if rng.gen_bool(0.7) {
        let axis = if rng.gen_bool(0.5) {
            None
        } else {
            Some(rng.gen_range(0..rank))
        };
        let op = [ReduceOpType::Sum, ReduceOpType::Mean, ReduceOpType::Max][rng.gen_range(0..3)];
        v = g.reduce(op, v, axis).unwrap();
    }
    if v != outputs[0] {
        outputs.push(v);
    }
    RandomCase {
        graph: g,
        inputs: vec![x, y],
        outputs,
        args,
    }
}

/// The mean of an empty axis is NaN on every target.
fn assert_agree(got: &Tensor, want: &Tensor, case: usize) {
    assert_eq!(got.shape(), want.shape(), "case {case}");
    let (got, want) = (got.to_vec::<f32>().unwrap(), want.to_vec::<f32>().unwrap());
    for (g, w) in got.iter().zip(&want) {
        if w.is_nan() {
            assert!(g.is_nan(), "case {case}: {got:?} vs {want:?}");
            continue;
        }
        assert_relative_eq!(*g, *w, epsilon = 1e-5, max_relative = 1e-4);
    }
}

macro_rules! test_for_device {
    ($config:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn config() -> CompileConfig {
                let _ = env_logger::builder().is_test(true).try_init();
                $config
            }

            #[test]
            fn add_div() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 1);
                let y = g.input(ElemKind::F32, 1);
                let s = g.add(x, y).unwrap();
                let q = g.div(s, y).unwrap();
                let mut f = g.compile(&[x, y], &[q], &[], &config()).unwrap();
                let out = f
                    .call(&[
                        Tensor::vector(vec![1f32, 2., 3., 4.]),
                        Tensor::vector(vec![2f32; 4]),
                    ])
                    .unwrap();
                assert_close(&out[0].to_vec::<f32>().unwrap(), &[1.5, 2.0, 2.5, 3.0]);
            }

            #[test]
            fn scalar_constants_broadcast() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 2);
                let half = g.scalar(0.5f32);
                let shift = g.scalar(-1f32);
                let a = g.mul(x, half).unwrap();
                let b = g.add(a, shift).unwrap();
                let y = g.relu(b).unwrap();
                let mut f = g.compile(&[x], &[y], &[], &config()).unwrap();
                let input = Tensor::from_vec([2, 2], vec![0f32, 2., 4., 6.]).unwrap();
                let out = f.call(&[input]).unwrap();
                assert_eq!(out[0].shape(), &[2, 2]);
                assert_close(&out[0].to_vec::<f32>().unwrap(), &[0.0, 0.0, 1.0, 2.0]);
            }

            #[test]
            fn transcendental_chain() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 1);
                let a = g.tanh(x).unwrap();
                let b = g.sigmoid(x).unwrap();
                let c = g.sub(a, b).unwrap();
                let d = g.exp(c).unwrap();
                let mut f = g.compile(&[x], &[d], &[], &config()).unwrap();
                let xs = vec![-2f32, -0.5, 0.0, 0.5, 2.0];
                let out = f.call(&[Tensor::vector(xs.clone())]).unwrap();
                let want = xs
                    .iter()
                    .map(|x| (x.tanh() - 1.0 / (1.0 + (-x).exp())).exp())
                    .collect::<Vec<_>>();
                assert_close(&out[0].to_vec::<f32>().unwrap(), &want);
            }

            #[test]
            fn reductions() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 2);
                let rows = g.sum(x, Some(1)).unwrap();
                let cols = g.mean(x, Some(0)).unwrap();
                let top = g.reduce(ReduceOpType::Max, x, None).unwrap();
                let mut f = g.compile(&[x], &[rows, cols, top], &[], &config()).unwrap();
                let input = Tensor::from_vec([2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap();
                let out = f.call(&[input]).unwrap();
                assert_close(&out[0].to_vec::<f32>().unwrap(), &[6.0, 15.0]);
                assert_close(&out[1].to_vec::<f32>().unwrap(), &[2.5, 3.5, 4.5]);
                assert!(out[2].shape().is_empty());
                assert_close(&out[2].to_vec::<f32>().unwrap(), &[6.0]);
            }

            #[test]
            fn matmul() {
                let mut g = Graph::new();
                let a = g.input(ElemKind::F32, 2);
                let b = g.input(ElemKind::F32, 2);
                let c = g.matmul(a, b).unwrap();
                let mut f = g.compile(&[a, b], &[c], &[], &config()).unwrap();
                let out = f
                    .call(&[
                        Tensor::from_vec([2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap(),
                        Tensor::from_vec([3, 2], vec![7f32, 8., 9., 10., 11., 12.]).unwrap(),
                    ])
                    .unwrap();
                assert_eq!(out[0].shape(), &[2, 2]);
                assert_close(&out[0].to_vec::<f32>().unwrap(), &[58., 64., 139., 154.]);
            }

            #[test]
            fn transpose_then_reshape() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 2);
                let t = g.transpose(x, [1, 0]).unwrap();
                let r = g.reshape(t, [6]).unwrap();
                let mut f = g.compile(&[x], &[t, r], &[], &config()).unwrap();
                let input = Tensor::from_vec([2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap();
                let out = f.call(&[input]).unwrap();
                assert_eq!(out[0].shape(), &[3, 2]);
                assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![1., 4., 2., 5., 3., 6.]);
            }

            #[test]
            fn integer_division_by_zero() {
                let mut g = Graph::new();
                let a = g.input(ElemKind::I32, 1);
                let b = g.input(ElemKind::I32, 1);
                let q = g.div(a, b).unwrap();
                let mut f = g.compile(&[a, b], &[q], &[], &config()).unwrap();
                let out = f
                    .call(&[
                        Tensor::vector(vec![7i32, -8, 3]),
                        Tensor::vector(vec![0i32, 2, 0]),
                    ])
                    .unwrap();
                assert_eq!(out[0].to_vec::<i32>().unwrap(), vec![0, -4, 0]);
            }

            #[test]
            fn shapes_change_between_calls() {
                let mut g = Graph::new();
                let x = g.input(ElemKind::F32, 1);
                let y = g.exp(x).unwrap();
                let z = g.neg(y).unwrap();
                let mut f = g.compile(&[x], &[z], &[], &config()).unwrap();
                for n in [8usize, 3, 16, 1] {
                    let xs = (0..n).map(|i| i as f32 * 0.1).collect::<Vec<_>>();
                    let out = f.call(&[Tensor::vector(xs.clone())]).unwrap();
                    let want = xs.iter().map(|x| -x.exp()).collect::<Vec<_>>();
                    assert_close(&out[0].to_vec::<f32>().unwrap(), &want);
                }
            }

            #[test]
            fn random_graphs_match_host() {
                let mut rng = StdRng::seed_from_u64(0x5eed);
                for case in 0..64 {
                    let RandomCase { graph, inputs, outputs, args } = random_case(&mut rng);
                    let mut want = graph
                        .compile(&inputs, &outputs, &[], &CompileConfig::host())
                        .unwrap();
                    let mut got = graph.compile(&inputs, &outputs, &[], &config()).unwrap();
                    let want = want.call(&args).unwrap();
                    let got = got.call(&args).unwrap();
                    assert_eq!(got.len(), want.len());
                    for (g, w) in got.iter().zip(&want) {
                        assert_agree(g, w, case);
                    }
                }
            }
        }
    };
}

test_for_device!(CompileConfig::host(), host_ops);
test_for_device!(CompileConfig::sim(0), sim_ops);
#[cfg(feature = "cuda")]
test_for_device!(
    CompileConfig::cuda(0).with_fallback(FallbackPolicy::Silent),
    cuda_ops
);

#[test]
fn mixed_kinds_promote() {
    let mut g = Graph::new();
    let a = g.input(ElemKind::I32, 1);
    let b = g.input(ElemKind::F32, 1);
    let c = g.add(a, b).unwrap();
    assert_eq!(g.ty(c).unwrap().elem, ElemKind::F64);
    let mut f = g.compile(&[a, b], &[c], &[], &CompileConfig::host()).unwrap();
    let out = f
        .call(&[Tensor::vector(vec![1i32, 2]), Tensor::vector(vec![0.5f32, 0.25])])
        .unwrap();
    assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![1.5, 2.25]);
}
