//! Kernels and reference results shared by the integration tests.

use tessera_ir::dialect::{core, func, linalg};
use tessera_ir::interp::{Interpreter, RuntimeValue};
use tessera_ir::walk::post_order;
use tessera_ir::{IrContext, Location, OpRef, Span, Symbol, ValueRef};

#[derive(Clone, Copy)]
enum Computation {
    /// `C(m x n) += A(m x k) * B(k x n)`
    Matmul { m: usize, n: usize, k: usize },
    /// `y(m) += A(m x n) * x(n)`
    Matvec { m: usize, n: usize },
}

/// A function running one structured operation on static
/// `memref<..xf32>` arguments, the accumulator last.
pub struct Kernel {
    pub func: func::Func,
    computation: Computation,
    shapes: Vec<Vec<i64>>,
}

pub fn location(ctx: &mut IrContext) -> Location {
    let path = ctx.paths.intern("kernels.mlir".to_owned());
    Location::new(path, Span::default())
}

fn input(len: i64, salt: i64) -> Vec<f32> {
    (0..len).map(|i| ((i * 3 + salt) % 7 - 3) as f32).collect()
}

impl Kernel {
    fn build(
        ctx: &mut IrContext,
        name: &'static str,
        computation: Computation,
        shapes: Vec<Vec<i64>>,
        body: impl FnOnce(&mut IrContext, Location, &[ValueRef]) -> OpRef,
    ) -> Self {
        let loc = location(ctx);
        let f32_ty = ctx.types.f32();
        let types: Vec<_> = shapes.iter().map(|s| ctx.types.memref(f32_ty, s, 0)).collect();
        let func = func::func(ctx, loc, Symbol::new(name), &types);
        let args = func.args(ctx).to_vec();
        let op = body(ctx, loc, &args);
        let ret = func::r#return(ctx, loc, []);
        let entry = func.entry_block(ctx);
        ctx.push_op(entry, op);
        ctx.push_op(entry, ret.op_ref());
        Kernel {
            func,
            computation,
            shapes,
        }
    }

    pub fn matmul(ctx: &mut IrContext, name: &'static str, m: i64, n: i64, k: i64) -> Self {
        let computation = Computation::Matmul {
            m: m as usize,
            n: n as usize,
            k: k as usize,
        };
        Self::build(ctx, name, computation, vec![vec![m, k], vec![k, n], vec![m, n]], |ctx, loc, args| {
            linalg::matmul(ctx, loc, args[0], args[1], args[2]).op_ref()
        })
    }

    #[allow(dead_code)]
    pub fn matvec(ctx: &mut IrContext, name: &'static str, m: i64, n: i64) -> Self {
        let computation = Computation::Matvec {
            m: m as usize,
            n: n as usize,
        };
        Self::build(ctx, name, computation, vec![vec![m, n], vec![n], vec![m]], |ctx, loc, args| {
            linalg::matvec(ctx, loc, args[0], args[1], args[2]).op_ref()
        })
    }

    fn inputs(&self) -> Vec<Vec<f32>> {
        self.shapes
            .iter()
            .zip([1, 2, 5])
            .map(|(shape, salt)| input(shape.iter().product(), salt))
            .collect()
    }

    /// Interpret the kernel and return the accumulator.
    pub fn run(&self, ctx: &IrContext) -> Vec<f32> {
        let mut interp = Interpreter::new(ctx);
        let args: Vec<RuntimeValue> = self
            .shapes
            .iter()
            .zip(self.inputs())
            .map(|(shape, data)| interp.buffer_f32(shape, data))
            .collect();
        interp.call(self.func, &args).unwrap();
        interp.read_f32(&args[2]).unwrap()
    }

    pub fn expected(&self) -> Vec<f32> {
        let inputs = self.inputs();
        let (a, b, mut acc) = (&inputs[0], &inputs[1], inputs[2].clone());
        match self.computation {
            Computation::Matmul { m, n, k } => {
                for i in 0..m {
                    for j in 0..n {
                        acc[i * n + j] += (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum::<f32>();
                    }
                }
            }
            Computation::Matvec { m, n } => {
                for i in 0..m {
                    acc[i] += (0..n).map(|j| a[i * n + j] * b[j]).sum::<f32>();
                }
            }
        }
        acc
    }
}

/// A module holding one matmul kernel per `(name, m, n, k)` entry.
#[allow(dead_code)]
pub fn module(ctx: &mut IrContext, sizes: &[(&'static str, i64, i64, i64)]) -> (core::Module, Vec<Kernel>) {
    let loc = location(ctx);
    let module = core::module(ctx, loc, Symbol::new("kernels"));
    let kernels = sizes
        .iter()
        .map(|&(name, m, n, k)| {
            let kernel = Kernel::matmul(ctx, name, m, n, k);
            module.push(ctx, kernel.func.op_ref());
            kernel
        })
        .collect();
    (module, kernels)
}

/// Check that every operand is defined earlier in an enclosing block.
#[allow(dead_code)]
pub fn assert_defined_before_use(ctx: &IrContext, root: OpRef) {
    for op in post_order(ctx, root) {
        for &value in ctx.op_operands(op) {
            let Some(def) = ctx.defining_op(value) else {
                continue;
            };
            let block = ctx.op(def).parent_block.expect("operand defined outside any block");
            let mut user = op;
            while ctx.op(user).parent_block != Some(block) {
                user = ctx
                    .parent_op(user)
                    .unwrap_or_else(|| panic!("{value} is used by {op} outside the block defining it"));
            }
            let ops = &ctx.block(block).ops;
            let position = |o: OpRef| ops.iter().position(|&x| x == o);
            assert!(
                position(def) < position(user),
                "{value} is used by {op} before its definition"
            );
        }
    }
}
