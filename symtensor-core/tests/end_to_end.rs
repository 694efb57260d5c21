use symtensor_core::{
    Capability, CompileConfig, ElemKind, Graph, Location, SharedValue, Tensor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn repeated_exp_agrees_between_host_and_accelerator() {
    init();
    const N: usize = 230_400;
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let y = g.exp(x).unwrap();
    let mut host = g.compile(&[x], &[y], &[], &CompileConfig::host()).unwrap();
    let mut sim = g.compile(&[x], &[y], &[], &CompileConfig::sim(0)).unwrap();

    assert!(!sim
        .thunks()
        .iter()
        .any(|t| t.capability == Capability::Elementwise && t.location == Location::Host));

    let input = Tensor::vector((0..N).map(|i| (i % 512) as f32 / 64.0 - 4.0).collect::<Vec<_>>());
    let (mut a, mut b) = (None, None);
    for _ in 0..1000 {
        a = Some(host.call(&[input.clone()]).unwrap().remove(0));
        b = Some(sim.call(&[input.clone()]).unwrap().remove(0));
    }
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.shape(), &[N]);
    assert!(a.max_abs_diff(&b).unwrap() <= 1e-5 * 4f64.exp());
    assert!(a.all_close(&b, 1e-5, 1e-6));

    assert_eq!(sim.stats().calls, 1000);
    assert_eq!(sim.stats().dispatches, 1000);
    // One buffer on the device, reused by every later call.
    assert_eq!(sim.stats().memory.allocations, 1);
}

fn accumulator(config: &CompileConfig) -> (SharedValue, symtensor_core::Function) {
    let mut g = Graph::new();
    let acc = g.shared(Tensor::vector(vec![0f32; 3]));
    let x = g.input(ElemKind::F32, 1);
    let next = g.add(acc.var, x).unwrap();
    let f = g
        .compile(&[x], &[acc.var, next], &[(acc.var, next)], config)
        .unwrap();
    (acc.value, f)
}

#[test]
fn updates_apply_after_the_call() {
    init();
    for config in [CompileConfig::host(), CompileConfig::sim(0)] {
        let (acc, mut f) = accumulator(&config);
        let ones = Tensor::vector(vec![1f32; 3]);

        let out = f.call(&[ones.clone()]).unwrap();
        // Reads during the call see the value from before it.
        assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![0.0; 3]);
        assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![1.0; 3]);
        assert_eq!(acc.get().unwrap().to_vec::<f32>().unwrap(), vec![1.0; 3]);

        for _ in 0..4 {
            f.call(&[ones.clone()]).unwrap();
        }
        assert_eq!(acc.get().unwrap().to_vec::<f32>().unwrap(), vec![5.0; 3]);

        acc.set(Tensor::vector(vec![10f32, 20., 30.])).unwrap();
        let out = f.call(&[ones]).unwrap();
        assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![11., 21., 31.]);
    }
}

#[test]
fn swapped_updates_read_old_values() {
    init();
    let mut g = Graph::new();
    let a = g.shared(Tensor::vector(vec![1i32, 2]));
    let b = g.shared(Tensor::vector(vec![3i32, 4]));
    let mut f = g
        .compile(&[], &[], &[(a.var, b.var), (b.var, a.var)], &CompileConfig::host())
        .unwrap();
    f.call(&[]).unwrap();
    assert_eq!(a.value.get().unwrap().to_vec::<i32>().unwrap(), vec![3, 4]);
    assert_eq!(b.value.get().unwrap().to_vec::<i32>().unwrap(), vec![1, 2]);
}

#[test]
fn values_can_be_shared_between_functions() {
    init();
    let mut g = Graph::new();
    let w = g.shared(Tensor::vector(vec![2f32, 2.]));
    let x = g.input(ElemKind::F32, 1);
    let y = g.mul(w.var, x).unwrap();
    let mut apply = g.compile(&[x], &[y], &[], &CompileConfig::host()).unwrap();

    let mut h = Graph::new();
    let w2 = h.shared_value(w.value.clone());
    let half = h.scalar(0.5f32);
    let scaled = h.mul(w2.var, half).unwrap();
    let mut shrink = h
        .compile(&[], &[], &[(w2.var, scaled)], &CompileConfig::host())
        .unwrap();

    let x_val = Tensor::vector(vec![3f32, 5.]);
    assert_eq!(apply.call(&[x_val.clone()]).unwrap()[0].to_vec::<f32>().unwrap(), vec![6., 10.]);
    shrink.call(&[]).unwrap();
    assert_eq!(apply.call(&[x_val]).unwrap()[0].to_vec::<f32>().unwrap(), vec![3., 5.]);
}
