use symtensor_core::{
    CallState, CompileConfig, ElemKind, Error, FaultPlan, Function, Graph, SimConfig, Tensor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn exp_function(config: CompileConfig) -> Function {
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let y = g.exp(x).unwrap();
    g.compile(&[x], &[y], &[], &config).unwrap()
}

fn sim_with(sim: SimConfig) -> CompileConfig {
    CompileConfig::sim(0).with_sim(sim)
}

#[test]
fn bad_calls_are_rejected_before_running() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 2);
    let y = g.input(ElemKind::F32, 2);
    let z = g.add(x, y).unwrap();
    let mut f = g.compile(&[x, y], &[z], &[], &CompileConfig::host()).unwrap();
    let m = Tensor::zeros(ElemKind::F32, [2, 2]);

    let err = f.call(&[m.clone()]).unwrap_err();
    assert!(matches!(err, Error::InvalidCall(_)), "{err}");
    let err = f
        .call(&[m.clone(), Tensor::zeros(ElemKind::I32, [2, 2])])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCall(_)), "{err}");
    let err = f.call(&[m.clone(), Tensor::vector(vec![1f32; 4])]).unwrap_err();
    assert!(matches!(err, Error::InvalidCall(_)), "{err}");

    assert_eq!(f.stats().calls, 0);
    assert_eq!(f.state(), CallState::Idle);
    let out = f.call(&[m.clone(), m]).unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![0.0; 4]);
    assert_eq!(f.state(), CallState::Complete);
}

#[test]
fn shape_mismatch_at_runtime_leaves_function_usable() {
    init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let y = g.input(ElemKind::F32, 1);
    let z = g.mul(x, y).unwrap();
    let mut f = g.compile(&[x, y], &[z], &[], &CompileConfig::host()).unwrap();

    let err = f
        .call(&[Tensor::vector(vec![1f32, 2., 3.]), Tensor::vector(vec![1f32; 4])])
        .unwrap_err();
    assert!(matches!(err, Error::Shape { .. }), "{err}");
    assert!(!f.is_poisoned());
    assert_eq!(f.state(), CallState::Idle);

    let out = f
        .call(&[Tensor::vector(vec![1f32, 2., 3.]), Tensor::vector(vec![2f32; 3])])
        .unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![2., 4., 6.]);
}

#[test]
fn kernel_failure_is_reported_and_recovered() {
    init();
    let mut f = exp_function(sim_with(SimConfig {
        fault: Some(FaultPlan::kernel_failure(1)),
        ..Default::default()
    }));

    let err = f.call(&[Tensor::vector(vec![0f32; 8])]).unwrap_err();
    assert!(err.is_device_error(), "{err}");
    assert!(!err.is_fatal());
    assert!(!f.is_poisoned());
    assert_eq!(f.state(), CallState::Idle);

    let out = f.call(&[Tensor::vector(vec![0f32; 8])]).unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![1.0; 8]);
    assert_eq!(f.state(), CallState::Complete);
}

#[test]
fn context_loss_poisons_the_function() {
    init();
    let mut f = exp_function(sim_with(SimConfig {
        fault: Some(FaultPlan::context_loss(1)),
        ..Default::default()
    }));

    let err = f.call(&[Tensor::vector(vec![0f32; 8])]).unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(f.is_poisoned());
    assert_eq!(f.state(), CallState::Idle);

    let err = f.call(&[Tensor::vector(vec![0f32; 8])]).unwrap_err();
    assert!(matches!(err, Error::FunctionPoisoned(_)), "{err}");
    // A fork runs on the same lost device.
    let mut fork = f.fork();
    assert!(fork.call(&[Tensor::vector(vec![0f32; 8])]).is_err());
}

#[test]
fn out_of_device_memory_is_not_fatal() {
    init();
    let mut f = exp_function(sim_with(SimConfig {
        memory_limit: Some(1024),
        ..Default::default()
    }));

    let err = f.call(&[Tensor::vector(vec![0f32; 1000])]).unwrap_err();
    assert!(err.is_device_error(), "{err}");
    assert!(!err.is_fatal());
    assert!(!f.is_poisoned());

    let out = f.call(&[Tensor::vector(vec![0f32; 16])]).unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![1.0; 16]);
}

#[test]
fn compile_errors_name_the_problem() {
    init();
    let mut g = Graph::new();
    let a = g.input(ElemKind::F32, 2);
    let b = g.input(ElemKind::F32, 1);
    assert!(matches!(
        g.matmul(a, b),
        Err(Error::GraphConstruction { .. })
    ));
    let u = g.input(ElemKind::U32, 1);
    assert!(matches!(g.neg(u), Err(Error::Type { .. })));

    let x = g.input(ElemKind::F32, 1);
    let y = g.exp(x).unwrap();
    // An output that is not computed from the declared inputs.
    let err = g.compile(&[a], &[y], &[], &CompileConfig::host()).unwrap_err();
    assert!(matches!(err, Error::GraphConstruction { .. }), "{err}");
}
