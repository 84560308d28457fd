//! Reference interpreter.
//!
//! Executes a `func.func` over concrete buffers so a function can be compared
//! before and after transformation. Buffers hold scalars of their element
//! type; vectors always hold `f32` elements.

use std::collections::HashMap;

use derive_more::{Display, Error, From};
use smallvec::SmallVec;

use crate::context::IrContext;
use crate::dialect::arith::{self, BinaryOp};
use crate::dialect::{func, linalg, memref, scf, vector};
use crate::ops::{ConversionError, DialectOp, OpName};
use crate::refs::{BlockRef, OpRef, TypeRef, ValueRef};
use crate::types::{Attribute, MemRefType, VectorType};

/// Handle of a buffer owned by an [`Interpreter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Strided view into a buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct MemRefView {
    pub buffer: BufferId,
    pub offset: i64,
    pub sizes: SmallVec<[i64; 4]>,
    pub strides: SmallVec<[i64; 4]>,
}

impl MemRefView {
    fn contiguous(buffer: BufferId, shape: &[i64]) -> Self {
        Self {
            buffer,
            offset: 0,
            sizes: shape.into(),
            strides: row_major_strides(shape),
        }
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Position of `indices` in the underlying buffer, or `None` when any
    /// index lies outside the view.
    fn linear(&self, indices: &[i64]) -> Option<usize> {
        if indices.len() != self.rank() {
            return None;
        }
        let mut at = self.offset;
        for ((&i, &size), &stride) in indices.iter().zip(&self.sizes).zip(&self.strides) {
            if i < 0 || i >= size {
                return None;
            }
            at += i * stride;
        }
        Some(at as usize)
    }
}

/// Value of a vector register.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorValue {
    pub shape: SmallVec<[i64; 4]>,
    pub data: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Bool(bool),
    Float(f32),
    Vector(VectorValue),
    MemRef(MemRefView),
}

impl RuntimeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RuntimeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            RuntimeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemRefView> {
        match self {
            RuntimeValue::MemRef(view) => Some(view),
            _ => None,
        }
    }
}

/// Execution failure.
#[derive(Clone, Debug, Display, Error, From, PartialEq)]
pub enum InterpError {
    #[from]
    #[display("{source}")]
    Conversion { source: ConversionError },
    #[display("operation `{name}` is not supported")]
    Unsupported { name: String },
    #[display("value {value} is used before it is defined")]
    Undefined { value: ValueRef },
    #[display("`{op}` expected {expected}")]
    TypeMismatch { op: String, expected: &'static str },
    #[display("`{op}` accessed {indices:?} outside of {sizes:?}")]
    OutOfBounds {
        op: String,
        indices: Vec<i64>,
        sizes: Vec<i64>,
    },
    #[display("`{op}` overflowed")]
    Overflow { op: String },
    #[display("`{op}` requires a statically shaped type")]
    DynamicShape { op: String },
    #[display("buffer {buffer} used after deallocation")]
    UseAfterFree { buffer: usize },
    #[display("loop step must be positive, got {step}")]
    InvalidStep { step: i64 },
    #[display("function expects {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
}

struct Buffer {
    data: Vec<RuntimeValue>,
    live: bool,
}

enum Flow {
    Next,
    Return(Vec<RuntimeValue>),
}

/// Interpreter over one [`IrContext`].
pub struct Interpreter<'a> {
    ctx: &'a IrContext,
    buffers: Vec<Buffer>,
    env: HashMap<ValueRef, RuntimeValue>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a IrContext) -> Self {
        Self {
            ctx,
            buffers: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Create a row-major `f32` buffer and return a view of all of it.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not have exactly one element per position of
    /// `shape`.
    pub fn buffer_f32(&mut self, shape: &[i64], data: impl IntoIterator<Item = f32>) -> RuntimeValue {
        let data: Vec<RuntimeValue> = data.into_iter().map(RuntimeValue::Float).collect();
        assert_eq!(
            data.len() as i64,
            shape.iter().product::<i64>(),
            "buffer_f32: data does not match shape {shape:?}",
        );
        RuntimeValue::MemRef(self.push_buffer(shape, data))
    }

    /// Read every element of a float view in row-major order.
    pub fn read_f32(&self, value: &RuntimeValue) -> Result<Vec<f32>, InterpError> {
        let view = value.as_memref().ok_or_else(|| InterpError::TypeMismatch {
            op: "read_f32".to_owned(),
            expected: "a memref",
        })?;
        let mut out = Vec::new();
        for_each_index(&view.sizes, |idx| {
            let at = self.position("read_f32", view, idx)?;
            out.push(self.element_f32("read_f32", view.buffer, at)?);
            Ok(())
        })?;
        Ok(out)
    }

    /// Run `func` with `args` bound to its entry block arguments.
    pub fn call(
        &mut self,
        func: func::Func,
        args: &[RuntimeValue],
    ) -> Result<Vec<RuntimeValue>, InterpError> {
        let params = func.args(self.ctx);
        if params.len() != args.len() {
            return Err(InterpError::ArgumentCount {
                expected: params.len(),
                actual: args.len(),
            });
        }
        for (&param, arg) in params.iter().zip(args) {
            self.env.insert(param, arg.clone());
        }
        match self.exec_block(func.entry_block(self.ctx))? {
            Flow::Return(values) => Ok(values),
            Flow::Next => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn exec_block(&mut self, block: BlockRef) -> Result<Flow, InterpError> {
        let ctx = self.ctx;
        for &op in &ctx.block(block).ops {
            if let Flow::Return(values) = self.exec_op(op)? {
                return Ok(Flow::Return(values));
            }
        }
        Ok(Flow::Next)
    }

    fn exec_op(&mut self, op: OpRef) -> Result<Flow, InterpError> {
        let ctx = self.ctx;
        let name = OpName::of(ctx, op).to_string();
        let name = name.as_str();

        if let Some(kind) = BinaryOp::of(ctx, op) {
            let operands = ctx.op_operands(op);
            let value = self.binary(name, kind, operands[0], operands[1])?;
            self.define(ctx.op_result(op, 0), value);
            return Ok(Flow::Next);
        }
        if let Some(lp) = scf::AnyLoop::from_op(ctx, op) {
            self.exec_loop(name, lp)?;
            return Ok(Flow::Next);
        }

        match name {
            "func.return" => {
                let ret = func::Return::from_op(ctx, op)?;
                let values: Vec<RuntimeValue> = ret
                    .values(ctx)
                    .iter()
                    .map(|&v| self.get(v).cloned())
                    .collect::<Result<_, _>>()?;
                return Ok(Flow::Return(values));
            }
            "scf.yield" => {}
            "scf.if" => {
                let branch = scf::If::from_op(ctx, op)?;
                let block = match self.get(branch.condition(ctx))? {
                    RuntimeValue::Bool(true) => branch.then_block(ctx),
                    RuntimeValue::Bool(false) => branch.else_block(ctx),
                    _ => return Err(mismatch(name, "an i1 condition")),
                };
                self.exec_block(block)?;
            }
            "arith.constant" => {
                let constant = arith::Constant::from_op(ctx, op)?;
                let ty = ctx.op_result_types(op)[0];
                let value = self.constant(name, ty, constant.value(ctx))?;
                self.define(constant.result(ctx), value);
            }
            "arith.cmpi" => {
                let cmp = arith::CmpI::from_op(ctx, op)?;
                let predicate = cmp
                    .predicate(ctx)
                    .ok_or(ConversionError::MissingAttribute("predicate"))?;
                let lhs = self.int(name, cmp.lhs(ctx))?;
                let rhs = self.int(name, cmp.rhs(ctx))?;
                self.define(cmp.result(ctx), RuntimeValue::Bool(predicate.evaluate(lhs, rhs)));
            }
            "memref.alloc" | "memref.alloca" => {
                let ty = ctx.op_result_types(op)[0];
                let shape = self.static_memref(name, ty)?;
                let zero = if ctx.types.is_f32(shape.elem) {
                    RuntimeValue::Float(0.0)
                } else {
                    RuntimeValue::Int(0)
                };
                let len = shape.shape.iter().product::<i64>() as usize;
                let view = self.push_buffer(&shape.shape, vec![zero; len]);
                self.define(ctx.op_result(op, 0), RuntimeValue::MemRef(view));
            }
            "memref.dealloc" => {
                let dealloc = memref::Dealloc::from_op(ctx, op)?;
                let view = self.memref(name, dealloc.buffer(ctx))?;
                self.buffers[view.buffer.0].live = false;
            }
            "memref.dim" => {
                let dim = memref::Dim::from_op(ctx, op)?;
                let view = self.memref(name, dim.source(ctx))?;
                let size = *view
                    .sizes
                    .get(dim.index(ctx))
                    .ok_or_else(|| mismatch(name, "a dimension inside the rank"))?;
                self.define(dim.result(ctx), RuntimeValue::Int(size));
            }
            "memref.subview" => self.exec_subview(name, memref::SubView::from_op(ctx, op)?)?,
            "memref.load" => {
                let load = memref::Load::from_op(ctx, op)?;
                let view = self.memref(name, load.memref(ctx))?;
                let indices = self.ints(name, load.indices(ctx))?;
                let at = self.position(name, &view, &indices)?;
                let value = self.element(name, view.buffer, at)?.clone();
                self.define(load.result(ctx), value);
            }
            "memref.store" => {
                let store = memref::Store::from_op(ctx, op)?;
                let value = self.get(store.value(ctx))?.clone();
                let view = self.memref(name, store.memref(ctx))?;
                let indices = self.ints(name, store.indices(ctx))?;
                let at = self.position(name, &view, &indices)?;
                *self.element_mut(view.buffer, at)? = value;
            }
            "memref.copy" => {
                let copy = memref::Copy::from_op(ctx, op)?;
                let source = self.memref(name, copy.source(ctx))?;
                let target = self.memref(name, copy.target(ctx))?;
                if source.sizes != target.sizes {
                    return Err(mismatch(name, "views of identical extents"));
                }
                for_each_index(&source.sizes, |idx| {
                    let from = self.position(name, &source, idx)?;
                    let to = self.position(name, &target, idx)?;
                    let value = self.element(name, source.buffer, from)?.clone();
                    *self.element_mut(target.buffer, to)? = value;
                    Ok(())
                })?;
            }
            "linalg.fill" => {
                let fill = linalg::Fill::from_op(ctx, op)?;
                let value = self.get(fill.value(ctx))?.clone();
                let output = self.memref(name, fill.output(ctx))?;
                for_each_index(&output.sizes, |idx| {
                    let at = self.position(name, &output, idx)?;
                    *self.element_mut(output.buffer, at)? = value.clone();
                    Ok(())
                })?;
            }
            "linalg.matmul" => {
                let operands = ctx.op_operands(op);
                let (a, b, c) = (
                    self.memref(name, operands[0])?,
                    self.memref(name, operands[1])?,
                    self.memref(name, operands[2])?,
                );
                let (m, k, n) = (a.sizes[0], a.sizes[1], b.sizes[1]);
                for i in 0..m {
                    for j in 0..n {
                        let out = self.position(name, &c, &[i, j])?;
                        let mut acc = self.element_f32(name, c.buffer, out)?;
                        for p in 0..k {
                            let lhs = self.position(name, &a, &[i, p])?;
                            let rhs = self.position(name, &b, &[p, j])?;
                            acc += self.element_f32(name, a.buffer, lhs)?
                                * self.element_f32(name, b.buffer, rhs)?;
                        }
                        *self.element_mut(c.buffer, out)? = RuntimeValue::Float(acc);
                    }
                }
            }
            "linalg.matvec" => {
                let operands = ctx.op_operands(op);
                let (a, x, y) = (
                    self.memref(name, operands[0])?,
                    self.memref(name, operands[1])?,
                    self.memref(name, operands[2])?,
                );
                for i in 0..a.sizes[0] {
                    let out = self.position(name, &y, &[i])?;
                    let mut acc = self.element_f32(name, y.buffer, out)?;
                    for j in 0..a.sizes[1] {
                        let lhs = self.position(name, &a, &[i, j])?;
                        let rhs = self.position(name, &x, &[j])?;
                        acc += self.element_f32(name, a.buffer, lhs)?
                            * self.element_f32(name, x.buffer, rhs)?;
                    }
                    *self.element_mut(y.buffer, out)? = RuntimeValue::Float(acc);
                }
            }
            _ if ctx.op(op).dialect == "vector" => self.exec_vector(name, op)?,
            _ => {
                return Err(InterpError::Unsupported {
                    name: name.to_owned(),
                });
            }
        }
        Ok(Flow::Next)
    }

    fn exec_loop(&mut self, name: &str, lp: scf::AnyLoop) -> Result<(), InterpError> {
        let dims = lp.dims(self.ctx);
        let mut ranges = Vec::with_capacity(dims.len());
        for &(lb, ub, step, _) in &dims {
            let (lb, ub, step) = (self.int(name, lb)?, self.int(name, ub)?, self.int(name, step)?);
            if step <= 0 {
                return Err(InterpError::InvalidStep { step });
            }
            ranges.push((lb, ub, step));
        }
        let ivs: Vec<ValueRef> = dims.iter().map(|d| d.3).collect();
        let body = lp.body_block(self.ctx);
        self.iterate(&ranges, &mut Vec::new(), &ivs, body)
    }

    fn iterate(
        &mut self,
        ranges: &[(i64, i64, i64)],
        point: &mut Vec<i64>,
        ivs: &[ValueRef],
        body: BlockRef,
    ) -> Result<(), InterpError> {
        let Some(&(lb, ub, step)) = ranges.get(point.len()) else {
            for (&iv, &x) in ivs.iter().zip(point.iter()) {
                self.define(iv, RuntimeValue::Int(x));
            }
            self.exec_block(body)?;
            return Ok(());
        };
        let mut i = lb;
        while i < ub {
            point.push(i);
            self.iterate(ranges, point, ivs, body)?;
            point.pop();
            i += step;
        }
        Ok(())
    }

    fn exec_subview(&mut self, name: &str, view: memref::SubView) -> Result<(), InterpError> {
        let ctx = self.ctx;
        let base = self.memref(name, view.source(ctx))?;
        let offsets = self.index_values(name, &view.offsets(ctx))?;
        let sizes = self.index_values(name, &view.sizes(ctx))?;
        let fits = offsets
            .iter()
            .zip(&sizes)
            .zip(&base.sizes)
            .all(|((&o, &s), &extent)| o >= 0 && s >= 0 && o + s <= extent);
        if !fits || offsets.len() != base.rank() {
            return Err(InterpError::OutOfBounds {
                op: name.to_owned(),
                indices: offsets,
                sizes: base.sizes.to_vec(),
            });
        }
        let offset = base.offset
            + offsets
                .iter()
                .zip(&base.strides)
                .map(|(o, s)| o * s)
                .sum::<i64>();
        let result = MemRefView {
            buffer: base.buffer,
            offset,
            sizes: sizes.into_iter().collect(),
            strides: base.strides.clone(),
        };
        self.define(view.result(ctx), RuntimeValue::MemRef(result));
        Ok(())
    }

    fn exec_vector(&mut self, name: &str, op: OpRef) -> Result<(), InterpError> {
        let ctx = self.ctx;
        let result = match name {
            "vector.transfer_read" => {
                let read = vector::TransferRead::from_op(ctx, op)?;
                let shape = self.vector_shape(name, ctx.op_result_types(op)[0])?;
                let view = self.memref(name, read.source(ctx))?;
                let base = self.ints(name, read.indices(ctx))?;
                let padding = if read.in_bounds(ctx) {
                    None
                } else {
                    Some(self.float(name, read.padding(ctx))?)
                };
                let data = self.read_vector(name, &view, &base, &shape, padding)?;
                RuntimeValue::Vector(VectorValue { shape, data })
            }
            "vector.load" => {
                let load = vector::Load::from_op(ctx, op)?;
                let shape = self.vector_shape(name, ctx.op_result_types(op)[0])?;
                let view = self.memref(name, load.memref(ctx))?;
                let base = self.ints(name, load.indices(ctx))?;
                let data = self.read_vector(name, &view, &base, &shape, None)?;
                RuntimeValue::Vector(VectorValue { shape, data })
            }
            "vector.transfer_write" => {
                let write = vector::TransferWrite::from_op(ctx, op)?;
                let value = self.vector(name, write.vector(ctx))?;
                let view = self.memref(name, write.dest(ctx))?;
                let base = self.ints(name, write.indices(ctx))?;
                return self.write_vector(name, &view, &base, &value, !write.in_bounds(ctx));
            }
            "vector.store" => {
                let store = vector::Store::from_op(ctx, op)?;
                let value = self.vector(name, store.vector(ctx))?;
                let view = self.memref(name, store.memref(ctx))?;
                let base = self.ints(name, store.indices(ctx))?;
                return self.write_vector(name, &view, &base, &value, false);
            }
            "vector.contract" => self.contract(name, vector::Contract::from_op(ctx, op)?)?,
            "vector.broadcast" => {
                let broadcast = vector::Broadcast::from_op(ctx, op)?;
                let shape = self.vector_shape(name, ctx.op_result_types(op)[0])?;
                let len = shape.iter().product::<i64>() as usize;
                let data = match self.get(broadcast.source(ctx))? {
                    RuntimeValue::Float(x) => vec![*x; len],
                    RuntimeValue::Vector(v)
                        if !v.data.is_empty() && shape.ends_with(&v.shape) =>
                    {
                        (0..len).map(|i| v.data[i % v.data.len()]).collect()
                    }
                    _ => return Err(mismatch(name, "a scalar or trailing-shape vector")),
                };
                RuntimeValue::Vector(VectorValue { shape, data })
            }
            "vector.transpose" => {
                let transpose = vector::Transpose::from_op(ctx, op)?;
                let source = self.vector(name, transpose.source(ctx))?;
                let perm = transpose.permutation(ctx);
                let shape: SmallVec<[i64; 4]> = perm.iter().map(|&p| source.shape[p]).collect();
                let mut data = Vec::with_capacity(source.data.len());
                let mut from = vec![0; perm.len()];
                for_each_index(&shape, |idx| {
                    for (k, &p) in perm.iter().enumerate() {
                        from[p] = idx[k];
                    }
                    data.push(source.data[linear_index(&source.shape, &from)]);
                    Ok(())
                })?;
                RuntimeValue::Vector(VectorValue { shape, data })
            }
            "vector.extract" => {
                let extract = vector::Extract::from_op(ctx, op)?;
                let source = self.vector(name, extract.source(ctx))?;
                let position = to_i64(&extract.position(ctx));
                let (shape, range) = sub_vector(&source.shape, &position);
                if shape.is_empty() {
                    RuntimeValue::Float(source.data[range.start])
                } else {
                    RuntimeValue::Vector(VectorValue {
                        shape,
                        data: source.data[range].to_vec(),
                    })
                }
            }
            "vector.insert" => {
                let insert = vector::Insert::from_op(ctx, op)?;
                let mut dest = self.vector(name, insert.dest(ctx))?;
                let position = to_i64(&insert.position(ctx));
                let (_, range) = sub_vector(&dest.shape, &position);
                match self.get(insert.source(ctx))? {
                    RuntimeValue::Float(x) => dest.data[range.start] = *x,
                    RuntimeValue::Vector(v) if v.data.len() == range.len() => {
                        dest.data[range].copy_from_slice(&v.data)
                    }
                    _ => return Err(mismatch(name, "a source matching the insert position")),
                }
                RuntimeValue::Vector(dest)
            }
            "vector.outerproduct" => {
                let outer = vector::OuterProduct::from_op(ctx, op)?;
                let lhs = self.vector(name, outer.lhs(ctx))?;
                let shape = self.vector_shape(name, ctx.op_result_types(op)[0])?;
                let mut data = match self.get(outer.rhs(ctx))? {
                    RuntimeValue::Float(x) => lhs.data.iter().map(|a| a * x).collect::<Vec<_>>(),
                    RuntimeValue::Vector(rhs) => lhs
                        .data
                        .iter()
                        .flat_map(|a| rhs.data.iter().map(move |b| a * b))
                        .collect(),
                    _ => return Err(mismatch(name, "a vector or scalar rhs")),
                };
                if let Some(acc) = outer.acc(ctx) {
                    let acc = self.vector(name, acc)?;
                    for (d, a) in data.iter_mut().zip(&acc.data) {
                        *d += a;
                    }
                }
                RuntimeValue::Vector(VectorValue { shape, data })
            }
            "vector.reduction" => {
                let reduction = vector::Reduction::from_op(ctx, op)?;
                let source = self.vector(name, reduction.source(ctx))?;
                RuntimeValue::Float(source.data.iter().sum())
            }
            "vector.shape_cast" => {
                let cast = vector::ShapeCast::from_op(ctx, op)?;
                let source = self.vector(name, cast.source(ctx))?;
                let shape = self.vector_shape(name, ctx.op_result_types(op)[0])?;
                RuntimeValue::Vector(VectorValue {
                    shape,
                    data: source.data,
                })
            }
            "vector.matrix_multiply" => {
                let mm = vector::MatrixMultiply::from_op(ctx, op)?;
                let (rows, inner, columns) = mm.dims(ctx);
                let lhs = self.vector(name, mm.lhs(ctx))?;
                let rhs = self.vector(name, mm.rhs(ctx))?;
                let mut data = vec![0.0; rows * columns];
                for i in 0..rows {
                    for j in 0..columns {
                        data[i * columns + j] = (0..inner)
                            .map(|k| lhs.data[i * inner + k] * rhs.data[k * columns + j])
                            .sum();
                    }
                }
                RuntimeValue::Vector(VectorValue {
                    shape: [(rows * columns) as i64].into_iter().collect(),
                    data,
                })
            }
            _ => {
                return Err(InterpError::Unsupported {
                    name: name.to_owned(),
                });
            }
        };
        self.define(ctx.op_result(op, 0), result);
        Ok(())
    }

    fn contract(&self, name: &str, contract: vector::Contract) -> Result<RuntimeValue, InterpError> {
        let ctx = self.ctx;
        let maps = contract.indexing_maps(ctx);
        let loops = contract.iterator_types(ctx).len();
        if maps.len() != 3 {
            return Err(mismatch(name, "three indexing maps"));
        }
        let lhs = self.vector(name, contract.lhs(ctx))?;
        let rhs = self.vector(name, contract.rhs(ctx))?;
        let (acc_shape, mut acc) = match self.get(contract.acc(ctx))? {
            RuntimeValue::Float(x) => (SmallVec::new(), vec![*x]),
            RuntimeValue::Vector(v) => (v.shape.clone(), v.data.clone()),
            _ => return Err(mismatch(name, "a vector or scalar accumulator")),
        };

        let mut extents = vec![None; loops];
        for (map, shape) in [(&maps[0], &lhs.shape), (&maps[1], &rhs.shape), (&maps[2], &acc_shape)] {
            for (&l, &size) in map.iter().zip(shape.iter()) {
                if let Some(slot) = extents.get_mut(l) {
                    *slot = Some(size);
                }
            }
        }
        let extents: Vec<i64> = extents
            .into_iter()
            .collect::<Option<_>>()
            .ok_or_else(|| mismatch(name, "operands covering every loop"))?;

        let project = |map: &[usize], point: &[i64]| -> Vec<i64> {
            map.iter().map(|&l| point[l]).collect()
        };
        for_each_index(&extents, |point| {
            let a = lhs.data[linear_index(&lhs.shape, &project(&maps[0], point))];
            let b = rhs.data[linear_index(&rhs.shape, &project(&maps[1], point))];
            acc[linear_index(&acc_shape, &project(&maps[2], point))] += a * b;
            Ok(())
        })?;

        Ok(if acc_shape.is_empty() {
            RuntimeValue::Float(acc[0])
        } else {
            RuntimeValue::Vector(VectorValue {
                shape: acc_shape,
                data: acc,
            })
        })
    }

    fn binary(
        &self,
        name: &str,
        kind: BinaryOp,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> Result<RuntimeValue, InterpError> {
        let overflow = || InterpError::Overflow {
            op: name.to_owned(),
        };
        if !kind.is_float() {
            let (a, b) = (self.int(name, lhs)?, self.int(name, rhs)?);
            return kind.fold_int(a, b).map(RuntimeValue::Int).ok_or_else(overflow);
        }
        match (self.get(lhs)?, self.get(rhs)?) {
            (RuntimeValue::Float(a), RuntimeValue::Float(b)) => kind
                .fold_float(*a, *b)
                .map(RuntimeValue::Float)
                .ok_or_else(overflow),
            (RuntimeValue::Vector(a), RuntimeValue::Vector(b)) if a.shape == b.shape => {
                let data = a
                    .data
                    .iter()
                    .zip(&b.data)
                    .map(|(&x, &y)| kind.fold_float(x, y).ok_or_else(overflow))
                    .collect::<Result<_, _>>()?;
                Ok(RuntimeValue::Vector(VectorValue {
                    shape: a.shape.clone(),
                    data,
                }))
            }
            _ => Err(mismatch(name, "float operands of one shape")),
        }
    }

    fn constant(&self, name: &str, ty: TypeRef, value: Attribute) -> Result<RuntimeValue, InterpError> {
        let types = &self.ctx.types;
        match value {
            Attribute::Bool(b) => Ok(RuntimeValue::Bool(b)),
            Attribute::FloatBits(_) => value
                .as_float()
                .map(|f| RuntimeValue::Float(f as f32))
                .ok_or_else(|| mismatch(name, "a float value")),
            Attribute::IntBits(_) if types.is_f32(ty) => value
                .as_int()
                .map(|i| RuntimeValue::Float(i as f32))
                .ok_or_else(|| mismatch(name, "an integer value")),
            Attribute::IntBits(_) => value
                .as_int()
                .map(RuntimeValue::Int)
                .ok_or_else(|| mismatch(name, "an integer value")),
            _ => Err(mismatch(name, "a scalar value")),
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn push_buffer(&mut self, shape: &[i64], data: Vec<RuntimeValue>) -> MemRefView {
        let id = BufferId(self.buffers.len());
        self.buffers.push(Buffer { data, live: true });
        MemRefView::contiguous(id, shape)
    }

    fn position(&self, name: &str, view: &MemRefView, indices: &[i64]) -> Result<usize, InterpError> {
        view.linear(indices).ok_or_else(|| InterpError::OutOfBounds {
            op: name.to_owned(),
            indices: indices.to_vec(),
            sizes: view.sizes.to_vec(),
        })
    }

    fn live_buffer(&self, id: BufferId) -> Result<&Buffer, InterpError> {
        let buffer = &self.buffers[id.0];
        if !buffer.live {
            return Err(InterpError::UseAfterFree { buffer: id.0 });
        }
        Ok(buffer)
    }

    fn element(&self, name: &str, id: BufferId, at: usize) -> Result<&RuntimeValue, InterpError> {
        self.live_buffer(id)?
            .data
            .get(at)
            .ok_or_else(|| mismatch(name, "an element inside the buffer"))
    }

    fn element_f32(&self, name: &str, id: BufferId, at: usize) -> Result<f32, InterpError> {
        self.element(name, id, at)?
            .as_float()
            .ok_or_else(|| mismatch(name, "a float buffer"))
    }

    fn element_mut(&mut self, id: BufferId, at: usize) -> Result<&mut RuntimeValue, InterpError> {
        self.live_buffer(id)?;
        Ok(&mut self.buffers[id.0].data[at])
    }

    /// Read `shape` elements starting at `base`; the vector covers the
    /// trailing dimensions of the view. Positions outside the view take
    /// `padding`, or fail when there is none.
    fn read_vector(
        &self,
        name: &str,
        view: &MemRefView,
        base: &[i64],
        shape: &[i64],
        padding: Option<f32>,
    ) -> Result<Vec<f32>, InterpError> {
        let lead = trailing_offset(name, view, base, shape)?;
        let mut data = Vec::new();
        for_each_index(shape, |p| {
            let mut idx = base.to_vec();
            for (d, &x) in p.iter().enumerate() {
                idx[lead + d] += x;
            }
            let value = match (view.linear(&idx), padding) {
                (Some(at), _) => self.element_f32(name, view.buffer, at)?,
                (None, Some(pad)) => pad,
                (None, None) => {
                    return Err(InterpError::OutOfBounds {
                        op: name.to_owned(),
                        indices: idx,
                        sizes: view.sizes.to_vec(),
                    });
                }
            };
            data.push(value);
            Ok(())
        })?;
        Ok(data)
    }

    fn write_vector(
        &mut self,
        name: &str,
        view: &MemRefView,
        base: &[i64],
        value: &VectorValue,
        masked: bool,
    ) -> Result<(), InterpError> {
        let lead = trailing_offset(name, view, base, &value.shape)?;
        let mut flat = 0;
        for_each_index(&value.shape, |p| {
            let mut idx = base.to_vec();
            for (d, &x) in p.iter().enumerate() {
                idx[lead + d] += x;
            }
            match view.linear(&idx) {
                Some(at) => *self.element_mut(view.buffer, at)? = RuntimeValue::Float(value.data[flat]),
                None if masked => {}
                None => {
                    return Err(InterpError::OutOfBounds {
                        op: name.to_owned(),
                        indices: idx,
                        sizes: view.sizes.to_vec(),
                    });
                }
            }
            flat += 1;
            Ok(())
        })
    }

    // ========================================================================
    // Values
    // ========================================================================

    fn define(&mut self, value: ValueRef, runtime: RuntimeValue) {
        self.env.insert(value, runtime);
    }

    fn get(&self, value: ValueRef) -> Result<&RuntimeValue, InterpError> {
        self.env.get(&value).ok_or(InterpError::Undefined { value })
    }

    fn int(&self, name: &str, value: ValueRef) -> Result<i64, InterpError> {
        self.get(value)?
            .as_int()
            .ok_or_else(|| mismatch(name, "an integer operand"))
    }

    fn ints(&self, name: &str, values: &[ValueRef]) -> Result<Vec<i64>, InterpError> {
        values.iter().map(|&v| self.int(name, v)).collect()
    }

    fn index_values(&self, name: &str, values: &[memref::IndexValue]) -> Result<Vec<i64>, InterpError> {
        values
            .iter()
            .map(|v| match *v {
                memref::IndexValue::Static(s) => Ok(s),
                memref::IndexValue::Dynamic(d) => self.int(name, d),
            })
            .collect()
    }

    fn float(&self, name: &str, value: ValueRef) -> Result<f32, InterpError> {
        self.get(value)?
            .as_float()
            .ok_or_else(|| mismatch(name, "a float operand"))
    }

    fn memref(&self, name: &str, value: ValueRef) -> Result<MemRefView, InterpError> {
        self.get(value)?
            .as_memref()
            .cloned()
            .ok_or_else(|| mismatch(name, "a memref operand"))
    }

    fn vector(&self, name: &str, value: ValueRef) -> Result<VectorValue, InterpError> {
        match self.get(value)? {
            RuntimeValue::Vector(v) => Ok(v.clone()),
            _ => Err(mismatch(name, "a vector operand")),
        }
    }

    fn vector_shape(&self, name: &str, ty: TypeRef) -> Result<SmallVec<[i64; 4]>, InterpError> {
        VectorType::from_type(&self.ctx.types, ty)
            .map(|v| v.shape)
            .ok_or_else(|| mismatch(name, "a vector result type"))
    }

    fn static_memref(&self, name: &str, ty: TypeRef) -> Result<MemRefType, InterpError> {
        match MemRefType::from_type(&self.ctx.types, ty) {
            Some(view) if view.has_static_shape() => Ok(view),
            Some(_) => Err(InterpError::DynamicShape {
                op: name.to_owned(),
            }),
            None => Err(mismatch(name, "a memref result type")),
        }
    }
}

fn mismatch(op: &str, expected: &'static str) -> InterpError {
    InterpError::TypeMismatch {
        op: op.to_owned(),
        expected,
    }
}

fn row_major_strides(shape: &[i64]) -> SmallVec<[i64; 4]> {
    let mut strides: SmallVec<[i64; 4]> = SmallVec::from_elem(1, shape.len());
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

fn linear_index(shape: &[i64], idx: &[i64]) -> usize {
    row_major_strides(shape)
        .iter()
        .zip(idx)
        .map(|(s, i)| s * i)
        .sum::<i64>() as usize
}

fn to_i64(values: &[usize]) -> Vec<i64> {
    values.iter().map(|&v| v as i64).collect()
}

/// Shape and flat range of the sub-vector at a leading `position`.
fn sub_vector(shape: &[i64], position: &[i64]) -> (SmallVec<[i64; 4]>, std::ops::Range<usize>) {
    let rest: SmallVec<[i64; 4]> = shape[position.len()..].into();
    let len = rest.iter().product::<i64>() as usize;
    let mut full = position.to_vec();
    full.resize(shape.len(), 0);
    let start = linear_index(shape, &full);
    (rest, start..start + len)
}

/// Index of the first view dimension covered by a vector of `shape`.
fn trailing_offset(name: &str, view: &MemRefView, base: &[i64], shape: &[i64]) -> Result<usize, InterpError> {
    if base.len() != view.rank() || shape.len() > view.rank() {
        return Err(mismatch(name, "indices for every dimension and a vector of lower rank"));
    }
    Ok(view.rank() - shape.len())
}

/// Call `f` with every index of `shape` in row-major order.
fn for_each_index(
    shape: &[i64],
    mut f: impl FnMut(&[i64]) -> Result<(), InterpError>,
) -> Result<(), InterpError> {
    if shape.iter().any(|&d| d <= 0) {
        return Ok(());
    }
    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx)?;
        let mut d = shape.len();
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::IteratorType;
    use crate::symbol::Symbol;
    use crate::types::{Location, Span};

    fn loc(ctx: &mut IrContext) -> Location {
        let path = ctx.paths.intern("interp.mlir".to_owned());
        Location::new(path, Span::default())
    }

    fn matmul_func(ctx: &mut IrContext, m: i64, k: i64, n: i64) -> func::Func {
        let loc = loc(ctx);
        let f32_ty = ctx.types.f32();
        let a = ctx.types.memref(f32_ty, &[m, k], 0);
        let b = ctx.types.memref(f32_ty, &[k, n], 0);
        let c = ctx.types.memref(f32_ty, &[m, n], 0);
        let f = func::func(ctx, loc, Symbol::new("matmul"), &[a, b, c]);
        let args = f.args(ctx).to_vec();
        let mm = linalg::matmul(ctx, loc, args[0], args[1], args[2]);
        let ret = func::r#return(ctx, loc, []);
        let entry = f.entry_block(ctx);
        ctx.push_op(entry, mm.op_ref());
        ctx.push_op(entry, ret.op_ref());
        f
    }

    #[test]
    fn executes_linalg_matmul() {
        let mut ctx = IrContext::new();
        let f = matmul_func(&mut ctx, 2, 3, 2);
        let mut interp = Interpreter::new(&ctx);
        let a = interp.buffer_f32(&[2, 3], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = interp.buffer_f32(&[3, 2], [1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let c = interp.buffer_f32(&[2, 2], [1.0; 4]);
        interp.call(f, &[a, b, c.clone()]).unwrap();
        assert_eq!(interp.read_f32(&c).unwrap(), vec![5.0, 6.0, 11.0, 12.0]);
    }

    #[test]
    fn loops_subviews_and_padded_transfers() {
        let mut ctx = IrContext::new();
        let loc = loc(&mut ctx);
        let f32_ty = ctx.types.f32();
        let mem = ctx.types.memref(f32_ty, &[3], 0);
        let out = ctx.types.memref(f32_ty, &[4], 0);
        let f = func::func(&mut ctx, loc, Symbol::new("f"), &[mem, out]);
        let (src, dst) = (f.args(&ctx)[0], f.args(&ctx)[1]);
        let entry = f.entry_block(&ctx);

        let c0 = arith::const_index(&mut ctx, loc, 0);
        let pad = arith::const_f32(&mut ctx, loc, -1.0);
        let vec_ty = ctx.types.vector(f32_ty, &[4]);
        let (c0v, padv) = (c0.result(&ctx), pad.result(&ctx));
        let read = vector::transfer_read(&mut ctx, loc, vec_ty, src, &[c0v], padv, false);
        let readv = read.result(&ctx);
        let twice = arith::addf(&mut ctx, loc, readv, readv);
        let twicev = twice.result(&ctx);
        let write = vector::transfer_write(&mut ctx, loc, twicev, dst, &[c0v], true);
        let ret = func::r#return(&mut ctx, loc, []);
        for op in [c0.op_ref(), pad.op_ref(), read.op_ref(), twice.op_ref(), write.op_ref(), ret.op_ref()] {
            ctx.push_op(entry, op);
        }

        let mut interp = Interpreter::new(&ctx);
        let a = interp.buffer_f32(&[3], [1.0, 2.0, 3.0]);
        let b = interp.buffer_f32(&[4], [0.0; 4]);
        interp.call(f, &[a, b.clone()]).unwrap();
        assert_eq!(interp.read_f32(&b).unwrap(), vec![2.0, 4.0, 6.0, -2.0]);
    }

    #[test]
    fn contraction_matches_matmul() {
        let mut ctx = IrContext::new();
        let loc = loc(&mut ctx);
        let f32_ty = ctx.types.f32();
        let mem = ctx.types.memref(f32_ty, &[2, 2], 0);
        let f = func::func(&mut ctx, loc, Symbol::new("f"), &[mem, mem, mem]);
        let args = f.args(&ctx).to_vec();
        let entry = f.entry_block(&ctx);

        let c0 = arith::const_index(&mut ctx, loc, 0).result(&ctx);
        let pad = arith::const_f32(&mut ctx, loc, 0.0).result(&ctx);
        for v in [c0, pad] {
            let def = ctx.defining_op(v).unwrap();
            ctx.push_op(entry, def);
        }
        let vty = ctx.types.vector(f32_ty, &[2, 2]);
        let reads: Vec<_> = args
            .iter()
            .map(|&m| vector::transfer_read(&mut ctx, loc, vty, m, &[c0, c0], pad, true))
            .collect();
        for r in &reads {
            ctx.push_op(entry, r.op_ref());
        }
        let (a, b, c) = (reads[0].result(&ctx), reads[1].result(&ctx), reads[2].result(&ctx));
        let iters = [IteratorType::Parallel, IteratorType::Parallel, IteratorType::Reduction];
        let contract = vector::contract(&mut ctx, loc, a, b, c, [&[0, 2], &[2, 1], &[0, 1]], &iters);
        ctx.push_op(entry, contract.op_ref());
        let product = contract.result(&ctx);
        let write = vector::transfer_write(&mut ctx, loc, product, args[2], &[c0, c0], true);
        ctx.push_op(entry, write.op_ref());

        let mut interp = Interpreter::new(&ctx);
        let a = interp.buffer_f32(&[2, 2], [1.0, 2.0, 3.0, 4.0]);
        let b = interp.buffer_f32(&[2, 2], [5.0, 6.0, 7.0, 8.0]);
        let c = interp.buffer_f32(&[2, 2], [1.0, 1.0, 1.0, 1.0]);
        interp.call(f, &[a, b, c.clone()]).unwrap();
        assert_eq!(interp.read_f32(&c).unwrap(), vec![20.0, 23.0, 44.0, 51.0]);
    }

    #[test]
    fn reports_out_of_bounds_access() {
        let mut ctx = IrContext::new();
        let loc = loc(&mut ctx);
        let f32_ty = ctx.types.f32();
        let ty = ctx.types.memref(f32_ty, &[2], 0);
        let f = func::func(&mut ctx, loc, Symbol::new("f"), &[]);
        let entry = f.entry_block(&ctx);
        let buf = memref::alloc(&mut ctx, loc, ty, None);
        let c2 = arith::const_index(&mut ctx, loc, 2);
        let (bufv, c2v) = (buf.result(&ctx), c2.result(&ctx));
        let load = memref::load(&mut ctx, loc, bufv, [c2v]);
        for op in [buf.op_ref(), c2.op_ref(), load.op_ref()] {
            ctx.push_op(entry, op);
        }

        let err = Interpreter::new(&ctx).call(f, &[]).unwrap_err();
        assert_eq!(err.to_string(), "`memref.load` accessed [2] outside of [2]");
    }
}
