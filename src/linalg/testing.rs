//! Small kernels shared by the rewrite tests, with reference results.

use tessera_ir::dialect::{arith, func, linalg};
use tessera_ir::interp::{Interpreter, RuntimeValue};
use tessera_ir::{DYNAMIC, IrContext, Location, OpRef, Span, Symbol, ValueRef};

pub(crate) struct Fixture {
    pub ctx: IrContext,
    pub func: func::Func,
    /// Shape of every function argument.
    shapes: Vec<Vec<i64>>,
}

/// Deterministic small integers, exact in `f32` arithmetic.
fn input(len: i64, salt: i64) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 + salt) % 5 - 2) as f32).collect()
}

impl Fixture {
    fn build(
        name: &'static str,
        shapes: &[&[i64]],
        body: impl FnOnce(&mut IrContext, Location, &[ValueRef]) -> Vec<OpRef>,
    ) -> Self {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern(format!("{name}.mlir"));
        let loc = Location::new(path, Span::default());
        let f32_ty = ctx.types.f32();
        let arg_types: Vec<_> = shapes.iter().map(|s| ctx.types.memref(f32_ty, s, 0)).collect();
        let func = func::func(&mut ctx, loc, Symbol::new(name), &arg_types);
        let args = func.args(&ctx).to_vec();
        let entry = func.entry_block(&ctx);
        let mut ops = body(&mut ctx, loc, &args);
        ops.push(func::r#return(&mut ctx, loc, []).op_ref());
        for op in ops {
            ctx.push_op(entry, op);
        }
        Fixture {
            ctx,
            func,
            shapes: shapes.iter().map(|s| s.to_vec()).collect(),
        }
    }

    /// `C(m x n) += A(m x k) * B(k x n)`.
    pub fn matmul(m: i64, n: i64, k: i64) -> Self {
        Self::build("matmul", &[&[m, k], &[k, n], &[m, n]], |ctx, loc, args| {
            vec![linalg::matmul(ctx, loc, args[0], args[1], args[2]).op_ref()]
        })
    }

    /// A matmul whose operands have unknown extents.
    pub fn dynamic_matmul(n: i64) -> Self {
        let mut fx = Self::build(
            "dynamic_matmul",
            &[&[DYNAMIC, n], &[n, DYNAMIC], &[DYNAMIC, DYNAMIC]],
            |ctx, loc, args| vec![linalg::matmul(ctx, loc, args[0], args[1], args[2]).op_ref()],
        );
        fx.shapes.clear();
        fx
    }

    /// `y = 1.0; y += A(m x n) * x(n)`.
    pub fn matvec_after_fill(m: i64, n: i64) -> Self {
        Self::build("matvec", &[&[m, n], &[n], &[m]], |ctx, loc, args| {
            let one = arith::const_f32(ctx, loc, 1.0);
            let fill = linalg::fill(ctx, loc, one.result(ctx), args[2]);
            let matvec = linalg::matvec(ctx, loc, args[0], args[1], args[2]);
            vec![one.op_ref(), fill.op_ref(), matvec.op_ref()]
        })
    }

    fn inputs(&self) -> Vec<Vec<f32>> {
        self.shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| input(shape.iter().product(), i as i64 + 3))
            .collect()
    }

    /// Run the function on the fixture inputs and return the last argument.
    fn run(&self) -> Vec<f32> {
        let mut interp = Interpreter::new(&self.ctx);
        let args: Vec<RuntimeValue> = self
            .shapes
            .iter()
            .zip(self.inputs())
            .map(|(shape, data)| interp.buffer_f32(shape, data))
            .collect();
        interp.call(self.func, &args).unwrap();
        interp.read_f32(args.last().unwrap()).unwrap()
    }

    pub fn run_matmul(&self) -> Vec<f32> {
        self.run()
    }

    pub fn expected_matmul(&self) -> Vec<f32> {
        let (m, k, n) = (self.shapes[0][0] as usize, self.shapes[0][1] as usize, self.shapes[1][1] as usize);
        let [a, b, mut c]: [Vec<f32>; 3] = self.inputs().try_into().unwrap();
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    c[i * n + j] += a[i * k + l] * b[l * n + j];
                }
            }
        }
        c
    }

    pub fn run_matvec(&self) -> Vec<f32> {
        self.run()
    }

    pub fn expected_matvec(&self) -> Vec<f32> {
        let (m, n) = (self.shapes[0][0] as usize, self.shapes[0][1] as usize);
        let [a, x, _]: [Vec<f32>; 3] = self.inputs().try_into().unwrap();
        (0..m)
            .map(|i| 1.0 + (0..n).map(|j| a[i * n + j] * x[j]).sum::<f32>())
            .collect()
    }
}
