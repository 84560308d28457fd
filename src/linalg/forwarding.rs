//! Forwarding of vector transfers through promoted buffers.
//!
//! After promotion and vectorization a tile travels
//! `memref.copy -> local buffer -> vector.transfer_read` on the way in and
//! `vector.transfer_write -> local buffer -> memref.copy` on the way out.
//! These rules access the original view directly and drop the copies, which
//! leaves the local buffers unused.

use smallvec::SmallVec;
use tracing::trace;

use tessera_ir::dialect::{arith, linalg, memref, vector};
use tessera_ir::effects::{self, written_buffers};
use tessera_ir::ops::DialectOp;
use tessera_ir::rewrite::{PatternRewriter, RewritePattern};
use tessera_ir::{BlockRef, IrContext, MemRefType, OpName, OpRef, ValueRef, VectorType};

/// Whether `value` is the result of `memref.alloc` or `memref.alloca`.
fn is_local_buffer(ctx: &IrContext, value: ValueRef) -> bool {
    ctx.defining_op(value).is_some_and(|def| {
        <memref::Alloc as DialectOp>::matches(ctx, def) || <memref::Alloca as DialectOp>::matches(ctx, def)
    })
}

/// Follow `memref.subview` sources back to the underlying buffer.
fn root_buffer(ctx: &IrContext, mut value: ValueRef) -> ValueRef {
    while let Some(view) = ctx
        .defining_op(value)
        .and_then(|def| memref::SubView::from_op(ctx, def).ok())
    {
        value = view.source(ctx);
    }
    value
}

/// Users of a local buffer, looking through views of it at offset zero.
struct BufferUses {
    /// Results of the zero-offset views of the buffer.
    views: SmallVec<[ValueRef; 2]>,
    /// Every other user of the buffer or of one of its views.
    users: Vec<OpRef>,
    /// Users of any other view; these make the buffer unsuitable.
    escapes: bool,
}

impl BufferUses {
    fn collect(ctx: &IrContext, buffer: ValueRef) -> Self {
        let mut uses = BufferUses {
            views: SmallVec::new(),
            users: Vec::new(),
            escapes: false,
        };
        for user in ctx.users(buffer) {
            match memref::SubView::from_op(ctx, user) {
                Ok(view) => {
                    let at_origin = view.offsets(ctx).iter().all(|o| o.constant(ctx) == Some(0));
                    if !at_origin {
                        uses.escapes = true;
                        continue;
                    }
                    let result = view.result(ctx);
                    uses.views.push(result);
                    uses.users.extend(ctx.users(result));
                }
                Err(_) => uses.users.push(user),
            }
        }
        uses.users.sort();
        uses.users.dedup();
        uses
    }

    /// `value` is the buffer itself or one of its zero-offset views.
    fn covers(&self, buffer: ValueRef, value: ValueRef) -> bool {
        value == buffer || self.views.contains(&value)
    }
}

fn position(ctx: &IrContext, block: BlockRef, op: OpRef) -> Option<usize> {
    ctx.block(block).ops.iter().position(|&o| o == op)
}

/// Whether two values hold the same constant (or are the same value).
fn same_value(ctx: &IrContext, a: ValueRef, b: ValueRef) -> bool {
    if a == b {
        return true;
    }
    match (arith::constant_float(ctx, a), arith::constant_float(ctx, b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn is_dealloc(ctx: &IrContext, op: OpRef) -> bool {
    <memref::Dealloc as DialectOp>::matches(ctx, op)
}

/// `memref.copy %in -> %buf` (or into a view of `%buf` filled with the
/// padding value) followed by `vector.transfer_read %buf` becomes
/// `vector.transfer_read %in`.
pub struct CopyTransferReadForwarding;

impl CopyTransferReadForwarding {
    /// Whether `op`, sitting between the copy and the read, may change what
    /// the read would observe through `source`.
    fn clobbers(ctx: &IrContext, op: OpRef, source: ValueRef) -> bool {
        if !ctx.op(op).regions.is_empty() {
            return effects::effects(ctx, op).write;
        }
        let source_root = root_buffer(ctx, source);
        written_buffers(ctx, op).into_iter().any(|w| {
            let root = root_buffer(ctx, w);
            root == source_root || !is_local_buffer(ctx, root)
        })
    }
}

impl RewritePattern for CopyTransferReadForwarding {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(read) = vector::TransferRead::from_op(ctx, op) else {
            return false;
        };
        let buffer = read.source(ctx);
        let Some(block) = ctx.op(op).parent_block else {
            return false;
        };
        if !is_local_buffer(ctx, buffer) {
            return false;
        }
        let uses = BufferUses::collect(ctx, buffer);
        if uses.escapes {
            return false;
        }

        let copies: SmallVec<[memref::Copy; 1]> = uses
            .users
            .iter()
            .filter_map(|&u| memref::Copy::from_op(ctx, u).ok())
            .filter(|c| uses.covers(buffer, c.target(ctx)))
            .collect();
        let [copy] = copies.as_slice() else {
            return false;
        };
        let copy = *copy;
        let fills: SmallVec<[linalg::Fill; 1]> = uses
            .users
            .iter()
            .filter_map(|&u| linalg::Fill::from_op(ctx, u).ok())
            .collect();
        if fills.len() > 1 {
            return false;
        }
        let fill = fills.first().copied();
        let full = copy.target(ctx) == buffer;
        match fill {
            Some(fill) if fill.output(ctx) != buffer || !same_value(ctx, fill.value(ctx), read.padding(ctx)) => {
                return false;
            }
            None if !full => return false,
            _ => {}
        }

        let (Some(copy_at), Some(read_at)) = (position(ctx, block, copy.op_ref()), position(ctx, block, op)) else {
            return false;
        };
        if copy_at > read_at {
            return false;
        }
        if let Some(fill) = fill {
            if position(ctx, block, fill.op_ref()).is_none_or(|at| at > copy_at) {
                return false;
            }
        }

        // Later users must start by overwriting the whole buffer.
        let handled = |u: OpRef| u == op || u == copy.op_ref() || fill.is_some_and(|f| f.op_ref() == u) || is_dealloc(ctx, u);
        let mut later = Vec::new();
        for &user in uses.users.iter().filter(|&&u| !handled(u)) {
            match position(ctx, block, user) {
                Some(at) if at > read_at => later.push((at, user)),
                _ => return false,
            }
        }
        if let Some(&(_, first)) = later.iter().min() {
            let buffer_shape = MemRefType::from_type(&ctx.types, ctx.value_ty(buffer)).map(|t| t.shape);
            let overwrites = vector::TransferWrite::from_op(ctx, first).is_ok_and(|w| {
                let written = VectorType::from_type(&ctx.types, ctx.value_ty(w.vector(ctx))).map(|t| t.shape);
                w.dest(ctx) == buffer && written.is_some() && written == buffer_shape
            });
            if !overwrites {
                return false;
            }
        }

        let source = copy.source(ctx);
        let between: Vec<OpRef> = ctx.block(block).ops[copy_at + 1..read_at].to_vec();
        if between.iter().any(|&o| Self::clobbers(ctx, o, source)) {
            return false;
        }

        let loc = ctx.op(op).location;
        let ty = ctx.op_result_types(op)[0];
        let indices: Vec<ValueRef> = read.indices(ctx).to_vec();
        let padding = read.padding(ctx);
        let in_bounds = read.in_bounds(ctx) && full;
        let forwarded = vector::transfer_read(ctx, loc, ty, source, &indices, padding, in_bounds);
        trace!(%op, forwarded = %forwarded.op_ref(), "forwarded copy into transfer_read");
        rewriter.replace_op(forwarded.op_ref());
        rewriter.erase_other(copy.op_ref());
        if let Some(fill) = fill {
            rewriter.erase_other(fill.op_ref());
        }
        true
    }

    fn name(&self) -> &'static str {
        "CopyTransferReadForwarding"
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn root(&self) -> Option<OpName> {
        Some(vector::TransferRead::op_name())
    }
}

/// `vector.transfer_write %v -> %buf` followed by `memref.copy %buf -> %out`
/// (or from a view of `%buf`) becomes `vector.transfer_write %v -> %out`.
pub struct TransferWriteCopyForwarding;

impl RewritePattern for TransferWriteCopyForwarding {
    fn match_and_rewrite(
        &self,
        ctx: &mut IrContext,
        op: OpRef,
        rewriter: &mut PatternRewriter,
    ) -> bool {
        let Ok(write) = vector::TransferWrite::from_op(ctx, op) else {
            return false;
        };
        let buffer = write.dest(ctx);
        let Some(block) = ctx.op(op).parent_block else {
            return false;
        };
        if !is_local_buffer(ctx, buffer) {
            return false;
        }
        let uses = BufferUses::collect(ctx, buffer);
        if uses.escapes {
            return false;
        }
        let Some(write_at) = position(ctx, block, op) else {
            return false;
        };

        // The first copy out of the buffer after the write.
        let Some((copy_at, copy)) = uses
            .users
            .iter()
            .filter_map(|&u| {
                let copy = memref::Copy::from_op(ctx, u).ok()?;
                let at = position(ctx, block, u)?;
                (at > write_at && uses.covers(buffer, copy.source(ctx))).then_some((at, copy))
            })
            .min_by_key(|&(at, _)| at)
        else {
            return false;
        };

        let between = &ctx.block(block).ops[write_at + 1..copy_at];
        if between.iter().any(|&o| {
            let fx = effects::effects(ctx, o);
            fx.read || fx.write || fx.free
        }) {
            return false;
        }
        for &user in &uses.users {
            if user == op || user == copy.op_ref() || is_dealloc(ctx, user) {
                continue;
            }
            match position(ctx, block, user) {
                Some(at) if at < write_at => {}
                _ => return false,
            }
        }

        let loc = ctx.op(op).location;
        let target = copy.target(ctx);
        let indices: Vec<ValueRef> = write.indices(ctx).to_vec();
        let in_bounds = write.in_bounds(ctx) && copy.source(ctx) == buffer;
        let forwarded = vector::transfer_write(ctx, loc, write.vector(ctx), target, &indices, in_bounds);
        trace!(%op, forwarded = %forwarded.op_ref(), "forwarded transfer_write into copy");
        rewriter.replace_op(forwarded.op_ref());
        rewriter.erase_other(copy.op_ref());
        true
    }

    fn name(&self) -> &'static str {
        "TransferWriteCopyForwarding"
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn root(&self) -> Option<OpName> {
        Some(vector::TransferWrite::op_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::dialect::func;
    use tessera_ir::interp::Interpreter;
    use tessera_ir::rewrite::{GreedyRewriteConfig, RewritePatternSet, apply_patterns_greedily};
    use tessera_ir::walk::collect_nested;
    use tessera_ir::{Location, Span, Symbol};

    struct RoundTrip {
        ctx: IrContext,
        func: func::Func,
    }

    /// `out = in + in` through two local buffers. With `partial`, the input
    /// buffer is larger than the tile and filled with `fill_value` first.
    fn round_trip(partial: bool, fill_value: f32) -> RoundTrip {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("forwarding.mlir".to_owned());
        let loc = Location::new(path, Span::default());
        let f32_ty = ctx.types.f32();
        let io_ty = ctx.types.memref(f32_ty, &[2, 2], 0);
        let f = func::func(&mut ctx, loc, Symbol::new("round_trip"), &[io_ty, io_ty]);
        let (input, output) = (f.args(&ctx)[0], f.args(&ctx)[1]);
        let entry = f.entry_block(&ctx);
        let mut ops = Vec::new();

        let buf_shape: &[i64] = if partial { &[4, 4] } else { &[2, 2] };
        let buf_ty = ctx.types.memref(f32_ty, buf_shape, 0);
        let in_buf = memref::alloc(&mut ctx, loc, buf_ty, None);
        let in_buf_v = in_buf.result(&ctx);
        ops.push(in_buf.op_ref());
        let pad = arith::const_f32(&mut ctx, loc, 0.0);
        let pad_v = pad.result(&ctx);
        ops.push(pad.op_ref());
        let copy_target = if partial {
            let fv = arith::const_f32(&mut ctx, loc, fill_value);
            let fv_v = fv.result(&ctx);
            let fill = linalg::fill(&mut ctx, loc, fv_v, in_buf_v);
            let zero = memref::IndexValue::Static(0);
            let two = memref::IndexValue::Static(2);
            let view = memref::subview(&mut ctx, loc, in_buf_v, &[zero, zero], &[two, two]);
            ops.extend([fv.op_ref(), fill.op_ref(), view.op_ref()]);
            view.result(&ctx)
        } else {
            in_buf_v
        };
        let copy_in = memref::copy(&mut ctx, loc, input, copy_target);
        let c0 = arith::const_index(&mut ctx, loc, 0);
        let c0v = c0.result(&ctx);
        ops.extend([copy_in.op_ref(), c0.op_ref()]);

        let vec_ty = ctx.types.vector(f32_ty, buf_shape);
        let read = vector::transfer_read(&mut ctx, loc, vec_ty, in_buf_v, &[c0v, c0v], pad_v, true);
        let read_v = read.result(&ctx);
        let sum = arith::addf(&mut ctx, loc, read_v, read_v);
        let out_buf = memref::alloc(&mut ctx, loc, buf_ty, None);
        let out_buf_v = out_buf.result(&ctx);
        let sumv = sum.result(&ctx);
        let write = vector::transfer_write(&mut ctx, loc, sumv, out_buf_v, &[c0v, c0v], true);
        ops.extend([read.op_ref(), sum.op_ref(), out_buf.op_ref(), write.op_ref()]);
        let copy_source = if partial {
            let zero = memref::IndexValue::Static(0);
            let two = memref::IndexValue::Static(2);
            let view = memref::subview(&mut ctx, loc, out_buf_v, &[zero, zero], &[two, two]);
            ops.push(view.op_ref());
            view.result(&ctx)
        } else {
            out_buf_v
        };
        let copy_out = memref::copy(&mut ctx, loc, copy_source, output);
        let free_in = memref::dealloc(&mut ctx, loc, in_buf_v);
        let free_out = memref::dealloc(&mut ctx, loc, out_buf_v);
        let ret = func::r#return(&mut ctx, loc, []);
        ops.extend([copy_out.op_ref(), free_in.op_ref(), free_out.op_ref(), ret.op_ref()]);
        for op in ops {
            ctx.push_op(entry, op);
        }
        RoundTrip { ctx, func: f }
    }

    impl RoundTrip {
        fn forward(&mut self) -> usize {
            let mut patterns = RewritePatternSet::new();
            patterns.add(CopyTransferReadForwarding).add(TransferWriteCopyForwarding);
            apply_patterns_greedily(&mut self.ctx, self.func.op_ref(), &patterns, GreedyRewriteConfig::default())
                .unwrap()
                .total_changes
        }

        fn run(&self) -> Vec<f32> {
            let mut interp = Interpreter::new(&self.ctx);
            let input = interp.buffer_f32(&[2, 2], [1.0, 2.0, 3.0, 4.0]);
            let output = interp.buffer_f32(&[2, 2], [0.0; 4]);
            interp.call(self.func, &[input, output.clone()]).unwrap();
            interp.read_f32(&output).unwrap()
        }
    }

    #[test]
    fn forwards_both_directions_of_a_full_buffer() {
        let mut rt = round_trip(false, 0.0);
        assert_eq!(rt.run(), vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(rt.forward(), 2);
        let root = rt.func.op_ref();
        assert!(collect_nested::<memref::Copy>(&rt.ctx, root).is_empty());

        let args = rt.func.args(&rt.ctx).to_vec();
        let read = vector::TransferRead::from_op(&rt.ctx, collect_nested::<vector::TransferRead>(&rt.ctx, root)[0]).unwrap();
        assert_eq!(read.source(&rt.ctx), args[0]);
        assert!(read.in_bounds(&rt.ctx));
        let write = vector::TransferWrite::from_op(&rt.ctx, collect_nested::<vector::TransferWrite>(&rt.ctx, root)[0]).unwrap();
        assert_eq!(write.dest(&rt.ctx), args[1]);
        assert_eq!(rt.run(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn partial_buffers_become_padded_transfers() {
        let mut rt = round_trip(true, 0.0);
        assert_eq!(rt.forward(), 2);
        let root = rt.func.op_ref();
        assert!(collect_nested::<memref::Copy>(&rt.ctx, root).is_empty());
        assert!(collect_nested::<linalg::Fill>(&rt.ctx, root).is_empty());
        let read = vector::TransferRead::from_op(&rt.ctx, collect_nested::<vector::TransferRead>(&rt.ctx, root)[0]).unwrap();
        assert!(!read.in_bounds(&rt.ctx));
        assert_eq!(rt.run(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn fill_must_match_the_padding() {
        let mut rt = round_trip(true, 1.0);
        assert_eq!(rt.forward(), 1, "only the write side is forwarded");
        let root = rt.func.op_ref();
        assert_eq!(collect_nested::<memref::Copy>(&rt.ctx, root).len(), 1);
        assert_eq!(rt.run(), vec![2.0, 4.0, 6.0, 8.0]);
    }
}
