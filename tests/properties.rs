//! Property tests of strategy construction and of result preservation.

mod common;

use common::Kernel;
use proptest::prelude::*;
use tessera::{CodegenStrategy, PromotionOptions, TilingOptions};
use tessera_ir::IrContext;
use tessera_ir::dialect::linalg;

#[derive(Clone, Copy, Debug)]
enum Step {
    Tile,
    Promote,
    Vectorize,
}

fn arb_steps() -> impl Strategy<Value = Vec<(Step, bool)>> {
    let step = prop_oneof![Just(Step::Tile), Just(Step::Promote), Just(Step::Vectorize)];
    prop::collection::vec((step, any::<bool>()), 0..8)
}

fn tiles() -> TilingOptions {
    TilingOptions::default().with_tile_sizes([2, 2, 2])
}

proptest! {
    #[test]
    fn prop_conditional_builders_equal_filtered_appends(steps in arb_steps()) {
        let mut conditional = CodegenStrategy::new();
        let mut filtered = CodegenStrategy::new();
        for &(step, cond) in &steps {
            match step {
                Step::Tile => {
                    conditional.tile_if::<linalg::Matmul>(cond, tiles());
                    if cond {
                        filtered.tile::<linalg::Matmul>(tiles());
                    }
                }
                Step::Promote => {
                    conditional.promote_named_if::<linalg::LinalgOp>(cond, "linalg.matvec", PromotionOptions::default());
                    if cond {
                        filtered.promote_named::<linalg::LinalgOp>("linalg.matvec", PromotionOptions::default());
                    }
                }
                Step::Vectorize => {
                    conditional.vectorize_if::<linalg::Matmul>(cond);
                    if cond {
                        filtered.vectorize::<linalg::Matmul>();
                    }
                }
            }
        }
        prop_assert_eq!(conditional.len(), steps.iter().filter(|(_, cond)| *cond).count());
        prop_assert_eq!(format!("{conditional:?}"), format!("{filtered:?}"));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tile_promote_vectorize_preserves_results(
        m in 1i64..7,
        n in 1i64..7,
        k in 1i64..7,
        sizes in prop::collection::vec(0i64..5, 3),
        full_tiles in any::<bool>(),
    ) {
        let mut ctx = IrContext::new();
        let kernel = Kernel::matmul(&mut ctx, "matmul", m, n, k);
        let mut strategy = CodegenStrategy::new();
        strategy
            .tile::<linalg::Matmul>(TilingOptions::default().with_tile_sizes(sizes))
            .promote::<linalg::Matmul>(PromotionOptions::default().with_use_full_tile_buffers_by_default(full_tiles))
            .vectorize::<linalg::Matmul>();
        strategy.transform(&mut ctx, kernel.func).unwrap();
        prop_assert_eq!(kernel.run(&ctx), kernel.expected());
    }
}
