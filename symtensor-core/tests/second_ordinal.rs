//! Lives in its own test binary: accelerator leases are process wide.

use symtensor_core::{CompileConfig, ElemKind, Error, ExecutionContext, Graph, Tensor};

#[test]
fn only_one_accelerator_per_process() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let y = g.sqrt(x).unwrap();

    let mut first = g.compile(&[x], &[y], &[], &CompileConfig::sim(0)).unwrap();
    let err = g.compile(&[x], &[y], &[], &CompileConfig::sim(1)).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");
    // The same ordinal can be shared.
    let mut second = g.compile(&[x], &[y], &[], &CompileConfig::sim(0)).unwrap();

    let input = Tensor::vector(vec![4f32, 9.]);
    assert_eq!(first.call(&[input.clone()]).unwrap()[0].to_vec::<f32>().unwrap(), vec![2., 3.]);
    assert_eq!(second.call(&[input]).unwrap()[0].to_vec::<f32>().unwrap(), vec![2., 3.]);

    drop((first, second));
    let ctx = ExecutionContext::new(&CompileConfig::sim(1)).unwrap();
    assert_eq!(ctx.target_name(), "sim:1");
}
