use symtensor_core::{CompileConfig, ElemKind, Graph, Tensor};

fn main() -> symtensor_core::Result<()> {
    env_logger::init();

    let mut graph = Graph::new();
    let a = graph.input(ElemKind::F32, 2);
    let b = graph.input(ElemKind::F32, 2);
    let c = graph.scalar(3f32);
    let d = graph.scalar(4f32);
    let ab = graph.mul(a, b)?;
    let res = graph.add(ab, c)?;
    let res = graph.add(res, d)?;

    // Device, precision and passes come from SYMTENSOR_FLAGS, e.g. `device=sim0`.
    let config = CompileConfig::from_env()?;
    let mut f = graph.compile(&[a, b], &[res], &[], &config)?;
    println!("{}", f.to_dot());

    let out = f.call(&[
        Tensor::full(1f32, [3, 4]),
        Tensor::full(2f32, [3, 4]),
    ])?;
    assert_eq!(out[0].to_vec::<f32>()?, vec![9.0; 12]);
    println!("{:?} on {}: {:?}", out[0].shape(), f.context().target_name(), out[0].data());
    Ok(())
}
