//! Extended-instruction-set intrinsics.
//!
//! The standard math extension (`GLSL.std.450`) is imported once per
//! module; intrinsics reference it by the import id plus an entry name.

use crate::id::Id;
use crate::program::Program;

impl Program {
    /// Floating-point maximum via the standard math extension.
    pub fn ext_max(&mut self, ty: Id, a: Id, b: Id) -> Id {
        let set = self.glsl_ext();
        let id = self.alloc_id();
        self.asm.push_ext_inst(id, ty, set, "FMax", &[a, b]);
        id
    }
}
