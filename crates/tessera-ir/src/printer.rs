//! Text format printer.
//!
//! Prints IR in an MLIR-like generic form:
//!
//! ```text
//! func.func @matmul(%0: memref<8x8xf32>, %1: memref<8x8xf32>, %2: memref<8x8xf32>) {
//!   linalg.matmul %0, %1, %2
//!   func.return
//! }
//! ```
//!
//! Attributes are printed sorted by name so the output does not depend on
//! symbol interning order.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;

use crate::context::IrContext;
use crate::dialect::{core, func};
use crate::ops::DialectOp;
use crate::refs::*;
use crate::symbol::Symbol;
use crate::types::*;

/// Print state for value numbering.
struct PrintState<'a> {
    ctx: &'a IrContext,
    value_names: HashMap<ValueRef, String>,
    next_value_num: usize,
    next_block_num: usize,
}

impl<'a> PrintState<'a> {
    fn new(ctx: &'a IrContext) -> Self {
        Self {
            ctx,
            value_names: HashMap::new(),
            next_value_num: 0,
            next_block_num: 0,
        }
    }

    fn assign_value_name(&mut self, v: ValueRef) -> String {
        let name = format!("%{}", self.next_value_num);
        self.next_value_num += 1;
        self.value_names.insert(v, name.clone());
        name
    }

    fn get_value_name(&self, v: ValueRef) -> &str {
        self.value_names.get(&v).map(|s| s.as_str()).unwrap_or("%?")
    }

    fn next_block_label(&mut self) -> String {
        let label = format!("^bb{}", self.next_block_num);
        self.next_block_num += 1;
        label
    }

    fn reset_numbering(&mut self) {
        self.next_value_num = 0;
        self.next_block_num = 0;
        self.value_names.clear();
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Print an operation as IR text.
pub fn print_op(ctx: &IrContext, op: OpRef) -> String {
    let mut state = PrintState::new(ctx);
    let mut out = String::new();
    print_operation(&mut state, &mut out, op, 0).expect("fmt::Write to String never fails");
    out
}

/// Print a type as IR text.
pub fn print_type(ctx: &IrContext, ty: TypeRef) -> String {
    let mut out = String::new();
    write_type(ctx, &mut out, ty).expect("fmt::Write to String never fails");
    out
}

/// Print a `core.module` with every function numbered from zero.
pub fn print_module(ctx: &IrContext, module: core::Module) -> String {
    let mut state = PrintState::new(ctx);
    let mut out = String::new();
    print_module_op(&mut state, &mut out, module.op_ref())
        .expect("fmt::Write to String never fails");
    out
}

// ============================================================================
// Type printing
// ============================================================================

fn write_shape(f: &mut impl Write, shape: &[i64]) -> fmt::Result {
    for &d in shape {
        if d == DYNAMIC {
            f.write_str("?x")?;
        } else {
            write!(f, "{d}x")?;
        }
    }
    Ok(())
}

fn write_type(ctx: &IrContext, f: &mut impl Write, ty: TypeRef) -> fmt::Result {
    if let Some(mem) = MemRefType::from_type(&ctx.types, ty) {
        f.write_str("memref<")?;
        write_shape(f, &mem.shape)?;
        write_type(ctx, f, mem.elem)?;
        if mem.memory_space != 0 {
            write!(f, ", {}", mem.memory_space)?;
        }
        return f.write_char('>');
    }
    if let Some(vec) = VectorType::from_type(&ctx.types, ty) {
        f.write_str("vector<")?;
        write_shape(f, &vec.shape)?;
        write_type(ctx, f, vec.elem)?;
        return f.write_char('>');
    }

    let data = ctx.types.get(ty);
    if data.dialect == "core" && data.params.is_empty() && data.attrs.is_empty() {
        return write!(f, "{}", data.name);
    }
    write!(f, "{}.{}", data.dialect, data.name)?;
    if !data.params.is_empty() {
        f.write_char('(')?;
        for (i, &param) in data.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write_type(ctx, f, param)?;
        }
        f.write_char(')')?;
    }
    Ok(())
}

// ============================================================================
// Attribute printing
// ============================================================================

fn write_attribute(ctx: &IrContext, f: &mut impl Write, attr: &Attribute) -> fmt::Result {
    match attr {
        Attribute::Unit => f.write_str("unit"),
        Attribute::Bool(b) => write!(f, "{b}"),
        Attribute::IntBits(_) => write!(f, "{}", attr.as_int().unwrap_or_default()),
        Attribute::FloatBits(bits) => {
            let v = f64::from_bits(*bits);
            let s = format!("{v}");
            f.write_str(&s)?;
            // Ensure decimal point for finite whole numbers (don't corrupt inf/NaN)
            if v.is_finite() && !s.contains('.') && !s.contains('e') && !s.contains('E') {
                f.write_str(".0")?;
            }
            Ok(())
        }
        Attribute::String(s) => write!(f, "{s:?}"),
        Attribute::Symbol(sym) => write!(f, "@{sym}"),
        Attribute::Type(ty) => write_type(ctx, f, *ty),
        Attribute::List(list) => {
            f.write_char('[')?;
            for (i, item) in list.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_attribute(ctx, f, item)?;
            }
            f.write_char(']')
        }
    }
}

// ============================================================================
// Operation printing
// ============================================================================

fn print_operation(
    state: &mut PrintState<'_>,
    f: &mut impl Write,
    op: OpRef,
    indent: usize,
) -> fmt::Result {
    if core::Module::matches(state.ctx, op) {
        return print_module_op(state, f, op);
    }
    if func::Func::matches(state.ctx, op) {
        return print_func_op(state, f, op, indent);
    }
    print_generic_op(state, f, op, indent)
}

fn print_generic_op(
    state: &mut PrintState<'_>,
    f: &mut impl Write,
    op: OpRef,
    indent: usize,
) -> fmt::Result {
    let indent_str = " ".repeat(indent);
    write!(f, "{indent_str}")?;

    // Results
    let results = state.ctx.op_results(op);
    if !results.is_empty() {
        for (i, &v) in results.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let name = state.assign_value_name(v);
            f.write_str(&name)?;
        }
        f.write_str(" = ")?;
    }

    let data = state.ctx.op(op);
    write!(f, "{}.{}", data.dialect, data.name)?;

    // Operands
    let operands = state.ctx.op_operands(op);
    if !operands.is_empty() {
        f.write_char(' ')?;
        for (i, &v) in operands.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(state.get_value_name(v))?;
        }
    }

    // Attributes
    let attrs = &state.ctx.op(op).attributes;
    if !attrs.is_empty() {
        let mut sorted: Vec<(String, &Attribute)> =
            attrs.iter().map(|(k, v)| (k.to_string(), v)).collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        f.write_str(" {")?;
        for (i, (key, val)) in sorted.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key} = ")?;
            write_attribute(state.ctx, f, val)?;
        }
        f.write_char('}')?;
    }

    // Result types
    let result_types = state.ctx.op_result_types(op);
    if !result_types.is_empty() {
        f.write_str(" : ")?;
        for (i, &ty) in result_types.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write_type(state.ctx, f, ty)?;
        }
    }

    // Regions
    let regions = state.ctx.op(op).regions.clone();
    for region in regions {
        f.write_str(" {\n")?;
        print_region(state, f, region, indent + 2)?;
        write!(f, "{indent_str}}}")?;
    }

    f.write_char('\n')
}

// ============================================================================
// Region / Block printing
// ============================================================================

fn write_block_args(state: &mut PrintState<'_>, f: &mut impl Write, block: BlockRef) -> fmt::Result {
    let args = state.ctx.block_args(block);
    f.write_char('(')?;
    for (j, &arg) in args.iter().enumerate() {
        if j > 0 {
            f.write_str(", ")?;
        }
        let arg_name = state.assign_value_name(arg);
        write!(f, "{arg_name}: ")?;
        write_type(state.ctx, f, state.ctx.value_ty(arg))?;
    }
    f.write_char(')')
}

fn print_region(
    state: &mut PrintState<'_>,
    f: &mut impl Write,
    region: RegionRef,
    indent: usize,
) -> fmt::Result {
    let blocks: Vec<BlockRef> = state.ctx.region(region).blocks.to_vec();
    let can_elide_label = blocks.len() == 1 && state.ctx.block_args(blocks[0]).is_empty();

    for block in blocks {
        if !can_elide_label {
            let label = state.next_block_label();
            write!(f, "{}{label}", " ".repeat(indent.saturating_sub(2)))?;
            if !state.ctx.block_args(block).is_empty() {
                write_block_args(state, f, block)?;
            }
            f.write_str(":\n")?;
        }
        let ops: Vec<OpRef> = state.ctx.block(block).ops.to_vec();
        for op in ops {
            print_operation(state, f, op, indent)?;
        }
    }

    Ok(())
}

// ============================================================================
// Special operation printers
// ============================================================================

fn print_module_op(state: &mut PrintState<'_>, f: &mut impl Write, op: OpRef) -> fmt::Result {
    let data = state.ctx.op(op);
    f.write_str("core.module")?;

    if let Some(Attribute::Symbol(name)) = data.attributes.get(&Symbol::new("sym_name")) {
        write!(f, " @{name}")?;
    }

    f.write_str(" {\n")?;
    let module = core::Module::from_op_unchecked(op);
    let ops: Vec<OpRef> = state.ctx.block(module.body_block(state.ctx)).ops.to_vec();
    for child_op in ops {
        state.reset_numbering();
        print_operation(state, f, child_op, 2)?;
    }
    f.write_str("}\n")
}

fn print_func_op(
    state: &mut PrintState<'_>,
    f: &mut impl Write,
    op: OpRef,
    indent: usize,
) -> fmt::Result {
    let indent_str = " ".repeat(indent);
    let func = func::Func::from_op_unchecked(op);
    write!(f, "{indent_str}func.func @{}", func.sym_name(state.ctx))?;

    state.reset_numbering();
    let entry = func.entry_block(state.ctx);
    write_block_args(state, f, entry)?;
    f.write_str(" {\n")?;

    let ops: Vec<OpRef> = state.ctx.block(entry).ops.to_vec();
    for child_op in ops {
        print_operation(state, f, child_op, indent + 2)?;
    }
    writeln!(f, "{indent_str}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{arith, linalg, scf};

    fn test_location(ctx: &mut IrContext) -> Location {
        let path = ctx.paths.intern("test.mlir".to_owned());
        Location::new(path, Span::new(0, 0))
    }

    #[test]
    fn builtin_types_are_compact() {
        let mut ctx = IrContext::new();
        let f32_ty = ctx.types.f32();
        let mem = ctx.types.memref(f32_ty, &[8, DYNAMIC], 0);
        let local = ctx.types.memref(f32_ty, &[4], 3);
        let vec = ctx.types.vector(f32_ty, &[4, 4]);
        let index = ctx.types.index();
        assert_eq!(print_type(&ctx, mem), "memref<8x?xf32>");
        assert_eq!(print_type(&ctx, local), "memref<4xf32, 3>");
        assert_eq!(print_type(&ctx, vec), "vector<4x4xf32>");
        assert_eq!(print_type(&ctx, index), "index");
    }

    #[test]
    fn print_function_with_loop() {
        let mut ctx = IrContext::new();
        let loc = test_location(&mut ctx);
        let f32_ty = ctx.types.f32();
        let mem = ctx.types.memref(f32_ty, &[8, 8], 0);
        let f = func::func(&mut ctx, loc, Symbol::new("kernel"), &[mem, mem, mem]);
        let entry = f.entry_block(&ctx);
        let args = f.args(&ctx).to_vec();

        let c0 = arith::const_index(&mut ctx, loc, 0);
        let c8 = arith::const_index(&mut ctx, loc, 8);
        ctx.push_op(entry, c0.op_ref());
        ctx.push_op(entry, c8.op_ref());
        let (c0v, c8v) = (c0.result(&ctx), c8.result(&ctx));
        let lp = scf::for_loop(&mut ctx, loc, c0v, c8v, c8v);
        ctx.push_op(entry, lp.op_ref());
        let mm = linalg::matmul(&mut ctx, loc, args[0], args[1], args[2]);
        let body = lp.body_block(&ctx);
        scf::insert_in_body(&mut ctx, body, mm.op_ref());
        let ret = func::r#return(&mut ctx, loc, []);
        ctx.push_op(entry, ret.op_ref());

        let module = core::module(&mut ctx, loc, Symbol::new("m"));
        module.push(&mut ctx, f.op_ref());

        insta::assert_snapshot!(print_module(&ctx, module), @r"
        core.module @m {
          func.func @kernel(%0: memref<8x8xf32>, %1: memref<8x8xf32>, %2: memref<8x8xf32>) {
            %3 = arith.constant {value = 0} : index
            %4 = arith.constant {value = 8} : index
            scf.for %3, %4, %4 {
            ^bb0(%5: index):
              linalg.matmul %0, %1, %2
              scf.yield
            }
            func.return
          }
        }
        ");
    }
}
