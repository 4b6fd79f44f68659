//! Small pipelines for tests, benchmarks and the command-line frontend.

use crate::dag::{Access, DagBuilder, FuncDef, FunctionDag, Index, StageDef, Var};

/// `input -> f1 -> ... -> f{interior} -> output`, all one-dimensional and
/// elementwise.
pub fn pointwise_chain(interior: usize, extent: i64) -> FunctionDag {
    elementwise(interior, &[(0, extent)])
}

/// Like [pointwise_chain], but over a `width` by `height` grid.
pub fn pointwise_grid(interior: usize, width: i64, height: i64) -> FunctionDag {
    elementwise(interior, &[(0, width), (0, height)])
}

fn elementwise(interior: usize, estimates: &[(i64, i64)]) -> FunctionDag {
    let dims = estimates.len();
    let mut builder = DagBuilder::new().add(FuncDef::input("input", dims));
    let mut prev = "input".to_owned();
    for i in 1..=interior {
        let name = format!("f{i}");
        builder = builder.add(
            FuncDef::func(&name, dims).stage(StageDef::new().reads(Access::pointwise(&prev, dims))),
        );
        prev = name;
    }
    builder
        .add(FuncDef::output("output", estimates).stage(StageDef::new().reads(Access::pointwise(&prev, dims))))
        .build()
        .expect("elementwise pipeline should be well-formed")
}

/// A separable 3x3 box blur.
pub fn blur(width: i64, height: i64) -> FunctionDag {
    let x = Var::Pure(0);
    let y = Var::Pure(1);
    DagBuilder::new()
        .add(FuncDef::input("input", 2))
        .add(FuncDef::func("blur_x", 2).stage(StageDef::new().reads(
            Access::new("input", vec![Index::stencil(x, -1, 1), Index::var(y)]).calls(3),
        )))
        .add(
            FuncDef::output("output", &[(0, width), (0, height)]).stage(StageDef::new().reads(
                Access::new("blur_x", vec![Index::var(x), Index::stencil(y, -1, 1)]).calls(3),
            )),
        )
        .build()
        .expect("blur should be well-formed")
}

/// `c(x, y) = sum_k a(k, y) * b(x, k)` over `n` by `n` matrices.
pub fn matmul(n: i64) -> FunctionDag {
    let k = Var::Reduction(0);
    DagBuilder::new()
        .add(FuncDef::input("a", 2))
        .add(FuncDef::input("b", 2))
        .add(
            FuncDef::output("c", &[(0, n), (0, n)])
                .stage(StageDef::new().ops(1.0))
                .stage(
                    StageDef::new()
                        .rvar("k", 0, n - 1)
                        .reads(Access::new("a", vec![Index::var(k), Index::var(Var::Pure(1))]))
                        .reads(Access::new("b", vec![Index::var(Var::Pure(0)), Index::var(k)]))
                        .ops(2.0),
                ),
        )
        .build()
        .expect("matmul should be well-formed")
}

/// Counts `samples` values into `bins` buckets. The update scatters to
/// data-dependent bins, so it has no pure loops.
pub fn histogram(bins: i64, samples: i64) -> FunctionDag {
    DagBuilder::new()
        .add(FuncDef::input("samples", 1))
        .add(
            FuncDef::output("hist", &[(0, bins)])
                .computed_union_with(0, 0, bins - 1)
                .stage(StageDef::new().ops(1.0))
                .stage(
                    StageDef::new()
                        .rvar("r", 0, samples - 1)
                        .rvars_only()
                        .reads(Access::new("samples", vec![Index::var(Var::Reduction(0))])),
                ),
        )
        .build()
        .expect("histogram should be well-formed")
}
