use approx::assert_relative_eq;
use symtensor_core::{
    optimizer::{PassContext, Pipeline},
    Capability, CompileConfig, ElemKind, Error, ExecutionContext, FallbackPolicy, Graph,
    Location, Program, Tensor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn diamond() -> (Graph, Vec<symtensor_core::VarId>, symtensor_core::VarId) {
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let a = g.exp(x).unwrap();
    let b = g.neg(a).unwrap();
    let c = g.sqrt(a).unwrap();
    let d = g.add(b, c).unwrap();
    (g, vec![x], d)
}

#[test]
fn round_trip_is_identity() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let d = g.to_device(x, 0).unwrap();
    let h = g.to_host(d).unwrap();
    let mut f = g.compile(&[x], &[h], &[], &CompileConfig::sim(0)).unwrap();
    assert!(f.thunks().is_empty());
    assert_eq!(f.program().outputs(), f.program().inputs());
    let out = f.call(&[Tensor::vector(vec![1f32, 2., 3.])]).unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![1., 2., 3.]);
    assert_eq!(f.stats().transfers, 0);
}

#[test]
fn pipeline_is_idempotent() {
    init();
    let ctx = ExecutionContext::new(&CompileConfig::sim(0)).unwrap();
    let cx = PassContext::new(&ctx);
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let e = g.exp(x).unwrap();
    let two = g.scalar(2f32);
    let m = g.mul(e, two).unwrap();
    let s = g.sum(m, None).unwrap();
    let program = Program::new(g, &[x], &[s], &[]).unwrap();

    let pipeline = Pipeline::standard(ctx.config()).unwrap();
    let (once, report) = pipeline.run(program, &cx).unwrap();
    let (twice, _) = pipeline.run(once.clone(), &cx).unwrap();
    assert_eq!(once.node_count(), twice.node_count());
    assert_eq!(once.transfer_count(), twice.transfer_count());
    // x and the constant go up; the sum stays on the device until it is read.
    assert_eq!(once.transfer_count(), 2);
    let fusion = report.get("fusion").unwrap();
    assert!(fusion.nodes_after < fusion.nodes_before);
}

#[test]
fn diamond_keeps_shared_intermediate() {
    init();
    let (g, inputs, d) = diamond();
    let mut f = g.compile(&inputs, &[d], &[], &CompileConfig::host()).unwrap();
    let thunks = f.thunks();
    assert_eq!(thunks.len(), 2);
    assert_eq!(thunks[0].op, "exp");
    assert_eq!(thunks[1].op, "fused[add(neg(in0), sqrt(in0))]");
    assert_eq!(thunks[1].capability, Capability::Elementwise);

    let xs = vec![-1f32, 0.0, 0.5, 2.0];
    let out = f.call(&[Tensor::vector(xs.clone())]).unwrap();
    assert_eq!(f.stats().dispatches, 2);
    for (got, x) in out[0].to_vec::<f32>().unwrap().iter().zip(&xs) {
        let a = x.exp();
        assert_relative_eq!(*got, -a + a.sqrt(), max_relative = 1e-5);
    }
}

#[test]
fn fusion_can_be_excluded() {
    init();
    let (g, inputs, d) = diamond();
    let config = CompileConfig::host().exclude_pass("fusion");
    let mut unfused = g.compile(&inputs, &[d], &[], &config).unwrap();
    let mut fused = g.compile(&inputs, &[d], &[], &CompileConfig::host()).unwrap();
    assert_eq!(unfused.thunks().len(), 4);
    assert!(unfused.report().get("fusion").is_none());

    let x = Tensor::vector(vec![0.1f32, 0.7, 1.3]);
    let a = unfused.call(&[x.clone()]).unwrap();
    let b = fused.call(&[x]).unwrap();
    assert!(a[0].all_close(&b[0], 1e-6, 1e-6));
}

#[test]
fn placement_cannot_be_excluded() {
    let (g, inputs, d) = diamond();
    let config = CompileConfig::host().exclude_pass("placement");
    let err = g.compile(&inputs, &[d], &[], &config).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn schedules_are_deterministic() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 2);
    let y = g.input(ElemKind::F32, 2);
    let p = g.matmul(x, y).unwrap();
    let t = g.transpose(p, [1, 0]).unwrap();
    let s = g.sum(t, Some(0)).unwrap();
    let e = g.exp(s).unwrap();
    let m = g.max(p, None).unwrap();
    let config = CompileConfig::sim(0);
    let a = g.compile(&[x, y], &[e, m], &[], &config).unwrap();
    let b = g.compile(&[x, y], &[e, m], &[], &config).unwrap();
    assert_eq!(a.thunks(), b.thunks());
    assert_eq!(a.to_dot(), b.to_dot());
}

#[test]
fn unsupported_kind_follows_fallback_policy() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F64, 1);
    let y = g.exp(x).unwrap();

    let err = g.compile(&[x], &[y], &[], &CompileConfig::sim(0)).unwrap_err();
    match err {
        Error::Placement { node, op, device, .. } => {
            assert_eq!(node, "exp#n0");
            assert_eq!(op, "exp");
            assert_eq!(device, "sim:0");
        }
        other => panic!("unexpected error {other}"),
    }

    let config = CompileConfig::sim(0).with_fallback(FallbackPolicy::Warn);
    let mut f = g.compile(&[x], &[y], &[], &config).unwrap();
    assert!(f.thunks().iter().all(|t| t.location == Location::Host));
    let out = f.call(&[Tensor::vector(vec![0f64, 1.0])]).unwrap();
    assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![1.0, 1f64.exp()]);
}

#[test]
fn constants_fold_away() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let a = g.scalar(3f32);
    let b = g.scalar(4f32);
    let ab = g.mul(a, b).unwrap();
    let r = g.sqrt(ab).unwrap();
    let y = g.add(x, r).unwrap();
    let f = g.compile(&[x], &[y], &[], &CompileConfig::host()).unwrap();
    assert_eq!(f.thunks().len(), 1);
    assert_eq!(f.thunks()[0].op, "add");
}
