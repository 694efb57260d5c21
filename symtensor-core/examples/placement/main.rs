use std::time::Instant;

use symtensor_core::{CompileConfig, ElemKind, FallbackPolicy, Graph, Tensor};

/// Compile one graph for the host and for the simulated accelerator and show what the
/// optimizer did to it.
fn main() -> symtensor_core::Result<()> {
    env_logger::init();
    const N: usize = 230_400;
    const ITERATIONS: usize = 100;

    let mut graph = Graph::new();
    let x = graph.input(ElemKind::F32, 1);
    let e = graph.exp(x)?;
    let s = graph.sqrt(e)?;
    let y = graph.add(e, s)?;
    // f64 is not supported by the accelerator and falls back to the host.
    let wide = graph.cast(y, ElemKind::F64)?;
    let total = graph.sum(wide, None)?;

    let input = Tensor::vector((0..N).map(|i| (i % 100) as f32 / 100.0).collect::<Vec<_>>());
    for config in [
        CompileConfig::host(),
        CompileConfig::sim(0).with_fallback(FallbackPolicy::Warn),
    ] {
        let mut f = graph.compile(&[x], &[y, total], &[], &config)?;
        println!("== {}", f.context().target_name());
        for pass in &f.report().passes {
            println!(
                "{:>14}: {} -> {} nodes, {} -> {} transfers",
                pass.name,
                pass.nodes_before,
                pass.nodes_after,
                pass.transfers_before,
                pass.transfers_after
            );
        }
        for t in f.thunks() {
            println!("{:>24} {:<40} {:?}", t.location.to_string(), t.op, t.capability);
        }

        let start = Instant::now();
        let mut out = Vec::new();
        for _ in 0..ITERATIONS {
            out = f.call(&[input.clone()])?;
        }
        let elapsed = start.elapsed() / ITERATIONS as u32;
        println!("sum = {:?}, {elapsed:?} per call", out[1].to_vec::<f64>()?);
        println!("{:?}", f.stats());
    }
    Ok(())
}
