//! Structured control-flow emission.
//!
//! Loops and branches must declare their merge block before any branch
//! into the construct. The emitters here allocate every label up front
//! and leave the caller positioned inside the body between the begin and
//! end calls. Misuse (ending a construct that was never begun, ending in
//! the wrong order) is a caller bug; these emitters assume well-formed
//! nesting and do not attempt to detect it.

use crate::asm::{BinaryOp, CmpOp, StorageClass};
use crate::error::CompileError;
use crate::id::Id;
use crate::program::Program;

/// An open `for` loop counting an induction variable from 0 to a bound.
///
/// Block structure: `header` declares the merge, `cond` tests the bound,
/// the body runs between `begin_for` and `end_for`, `cont` increments,
/// `exit` rejoins.
#[derive(Debug)]
pub struct ForLoop {
    header: Id,
    cont: Id,
    exit: Id,
    var: Id,
    var_type: Id,
    one: Id,
}

/// An open bounds-guard branch. The body is expected to end with an
/// explicit return; `end_if` only places the merge label.
#[derive(Debug)]
pub struct IfBlock {
    merge: Id,
}

impl Program {
    /// Opens a loop running an induction variable over `0..bound`
    /// (unsigned less-than test). Leaves emission inside the body block.
    pub fn begin_for(&mut self, bound: Id) -> Result<ForLoop, CompileError> {
        let uint = self.uint_type();
        let zero = self.const_u32(0);
        let one = self.const_u32(1);
        let var = self.add_var(uint, StorageClass::Function, Some(zero))?;

        let header = self.alloc_id();
        let cond = self.alloc_id();
        let body = self.alloc_id();
        let cont = self.alloc_id();
        let exit = self.alloc_id();

        self.asm.push_branch(header);
        self.asm.push_label(header);
        self.asm.push_loop_merge(exit, cont);
        self.asm.push_branch(cond);

        self.asm.push_label(cond);
        let i = self.load_var(uint, var);
        let in_range = self.compare(CmpOp::ULessThan, i, bound);
        self.asm.push_branch_conditional(in_range, body, exit);

        self.asm.push_label(body);
        Ok(ForLoop {
            header,
            cont,
            exit,
            var,
            var_type: uint,
            one,
        })
    }

    /// Loads the current induction value inside the loop body.
    pub fn load_induction(&mut self, lp: &ForLoop) -> Id {
        self.load_var(lp.var_type, lp.var)
    }

    /// Closes the loop body: increments the induction variable, branches
    /// back to the header, and places the exit label.
    pub fn end_for(&mut self, lp: ForLoop) {
        self.asm.push_branch(lp.cont);
        self.asm.push_label(lp.cont);
        let i = self.load_var(lp.var_type, lp.var);
        let next = self.alloc_id();
        self.asm.push_binary(BinaryOp::IAdd, next, lp.var_type, i, lp.one);
        self.store_var(lp.var, next);
        self.asm.push_branch(lp.header);
        self.asm.push_label(lp.exit);
    }

    /// Opens a guarded branch taken when `a <op> b` holds. Leaves
    /// emission inside the guard body.
    pub fn begin_if(&mut self, a: Id, op: CmpOp, b: Id) -> IfBlock {
        let cond = self.compare(op, a, b);
        let body = self.alloc_id();
        let merge = self.alloc_id();
        self.asm.push_selection_merge(merge);
        self.asm.push_branch_conditional(cond, body, merge);
        self.asm.push_label(body);
        IfBlock { merge }
    }

    /// Places the merge label. The guard body must already have
    /// terminated (the one pattern lowering emits is a bare return).
    pub fn end_if(&mut self, block: IfBlock) {
        self.asm.push_label(block.merge);
    }

    /// Guard that returns from the kernel when the invocation index on
    /// `axis` falls outside the tensor's extent on that axis.
    pub fn invocation_bounds_check(
        &mut self,
        meta: &crate::program::TensorMeta,
        axis: usize,
    ) -> Result<(), CompileError> {
        let invocation = self.load_invocation_index(axis as u32);
        let extent = self.load_tensor_shape_element(meta, axis)?;
        let guard = self.begin_if(invocation, CmpOp::UGreaterThan, extent);
        self.asm.push_return();
        self.end_if(guard);
        Ok(())
    }
}
