//! Assembly text emission.
//!
//! The assembler is a set of append-only string sections, one per region
//! of the final module. Instructions may be pushed in any interleaving;
//! [`Assembler::assemble`] concatenates the sections in the fixed module
//! order, so the output is well-formed regardless of emission order.
//!
//! Function bodies are buffered separately: the open function accumulates
//! its signature, local variables, and body instructions in independent
//! buffers that are flushed into the functions section only when the
//! function is closed. That lets callers declare function-local variables
//! at any point while the body is being built, even though SPIR-V requires
//! all `OpVariable`s to sit at the top of the entry block.

use std::fmt::Write as _;

use crate::id::Id;

/// SPIR-V storage classes used by the backend.
///
/// `Constant` is not a real storage class: it marks tensors whose payload
/// is baked into the module as a constant composite. Accesses to such
/// tensors go through a function-local copy, so their pointers are in the
/// `Function` class.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum StorageClass {
    Input,
    Uniform,
    StorageBuffer,
    Workgroup,
    Function,
    Private,
    Constant,
}

impl StorageClass {
    /// The storage class pointers into this tensor actually use.
    pub fn for_access(self) -> Self {
        match self {
            Self::Constant => Self::Function,
            other => other,
        }
    }

    /// Whether types in this class carry explicit layout decorations
    /// (`Offset`, `ArrayStride`).
    pub fn explicit_layout(self) -> bool {
        matches!(self, Self::Uniform | Self::StorageBuffer)
    }

    /// The operand keyword.
    ///
    /// # Panics
    ///
    /// Panics for [`StorageClass::Constant`], which must be mapped through
    /// [`StorageClass::for_access`] before emission.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Uniform => "Uniform",
            Self::StorageBuffer => "StorageBuffer",
            Self::Workgroup => "Workgroup",
            Self::Function => "Function",
            Self::Private => "Private",
            Self::Constant => panic!("constant pseudo-class has no SPIR-V keyword"),
        }
    }
}

/// Arithmetic instructions on scalar operands.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    IAdd,
    IMul,
    FAdd,
    FMul,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IAdd => "OpIAdd",
            Self::IMul => "OpIMul",
            Self::FAdd => "OpFAdd",
            Self::FMul => "OpFMul",
        }
    }
}

/// Comparison instructions producing a boolean.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum CmpOp {
    ULessThan,
    UGreaterThan,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ULessThan => "OpULessThan",
            Self::UGreaterThan => "OpUGreaterThan",
        }
    }
}

/// Built-in variable decorations.
#[derive(Clone, Copy, Debug)]
pub enum BuiltIn {
    GlobalInvocationId,
}

impl BuiltIn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalInvocationId => "GlobalInvocationId",
        }
    }
}

/// Buffers for the function currently being emitted.
#[derive(Debug, Default)]
struct FunctionBuffer {
    /// `OpFunction` and the entry `OpLabel`.
    prologue: String,
    /// Function-local `OpVariable`s, which must precede the body.
    locals: String,
    /// Everything else.
    body: String,
}

impl FunctionBuffer {
    fn is_open(&self) -> bool {
        !self.prologue.is_empty()
    }

    fn take(&mut self) -> String {
        let mut out = std::mem::take(&mut self.prologue);
        out.push_str(&self.locals);
        out.push_str(&self.body);
        self.locals.clear();
        self.body.clear();
        out
    }
}

/// Section-ordered SPIR-V assembly writer.
#[derive(Debug, Default)]
pub struct Assembler {
    header: String,
    ext_imports: String,
    entry: String,
    decorations: String,
    globals: String,
    functions: String,
    current: FunctionBuffer,
}

impl Assembler {
    pub fn new() -> Self {
        let mut asm = Self::default();
        asm.header.push_str("OpCapability Shader\n");
        asm.header.push_str("OpMemoryModel Logical GLSL450\n");
        asm
    }

    /// Whether a function body is currently open.
    pub fn in_function(&self) -> bool {
        self.current.is_open()
    }

    // Module-level sections.

    pub fn push_ext_import(&mut self, id: Id, name: &str) {
        let _ = writeln!(self.ext_imports, "%{id} = OpExtInstImport \"{name}\"");
    }

    pub fn push_entry_point(&mut self, main: Id, name: &str, interface: &[Id], local_size: [u32; 3]) {
        let _ = write!(self.entry, "OpEntryPoint GLCompute %{main} \"{name}\"");
        for var in interface {
            let _ = write!(self.entry, " %{var}");
        }
        self.entry.push('\n');
        let [x, y, z] = local_size;
        let _ = writeln!(self.entry, "OpExecutionMode %{main} LocalSize {x} {y} {z}");
    }

    pub fn push_decorate_block(&mut self, target: Id) {
        let _ = writeln!(self.decorations, "OpDecorate %{target} Block");
    }

    pub fn push_decorate_binding(&mut self, target: Id, set: u32, binding: u32) {
        let _ = writeln!(self.decorations, "OpDecorate %{target} DescriptorSet {set}");
        let _ = writeln!(self.decorations, "OpDecorate %{target} Binding {binding}");
    }

    pub fn push_decorate_builtin(&mut self, target: Id, builtin: BuiltIn) {
        let _ = writeln!(
            self.decorations,
            "OpDecorate %{target} BuiltIn {}",
            builtin.as_str()
        );
    }

    pub fn push_decorate_array_stride(&mut self, target: Id, stride: u32) {
        let _ = writeln!(self.decorations, "OpDecorate %{target} ArrayStride {stride}");
    }

    pub fn push_member_offset(&mut self, target: Id, member: u32, offset: u32) {
        let _ = writeln!(
            self.decorations,
            "OpMemberDecorate %{target} {member} Offset {offset}"
        );
    }

    // Types and constants (globals section).

    pub fn push_void_type(&mut self, id: Id) {
        let _ = writeln!(self.globals, "%{id} = OpTypeVoid");
    }

    pub fn push_bool_type(&mut self, id: Id) {
        let _ = writeln!(self.globals, "%{id} = OpTypeBool");
    }

    pub fn push_float_type(&mut self, id: Id, width: u32) {
        let _ = writeln!(self.globals, "%{id} = OpTypeFloat {width}");
    }

    pub fn push_int_type(&mut self, id: Id, width: u32, signed: bool) {
        let _ = writeln!(self.globals, "%{id} = OpTypeInt {width} {}", u32::from(signed));
    }

    pub fn push_vector_type(&mut self, id: Id, component: Id, count: u32) {
        let _ = writeln!(self.globals, "%{id} = OpTypeVector %{component} {count}");
    }

    pub fn push_array_type(&mut self, id: Id, element: Id, length: Id) {
        let _ = writeln!(self.globals, "%{id} = OpTypeArray %{element} %{length}");
    }

    pub fn push_struct_type(&mut self, id: Id, fields: &[Id]) {
        let _ = write!(self.globals, "%{id} = OpTypeStruct");
        for field in fields {
            let _ = write!(self.globals, " %{field}");
        }
        self.globals.push('\n');
    }

    pub fn push_function_type(&mut self, id: Id, ret: Id) {
        let _ = writeln!(self.globals, "%{id} = OpTypeFunction %{ret}");
    }

    pub fn push_pointer_type(&mut self, id: Id, storage: StorageClass, pointee: Id) {
        let _ = writeln!(
            self.globals,
            "%{id} = OpTypePointer {} %{pointee}",
            storage.as_str()
        );
    }

    pub fn push_constant(&mut self, id: Id, ty: Id, value: &str) {
        let _ = writeln!(self.globals, "%{id} = OpConstant %{ty} {value}");
    }

    pub fn push_constant_composite(&mut self, id: Id, ty: Id, elements: &[Id]) {
        let _ = write!(self.globals, "%{id} = OpConstantComposite %{ty}");
        for element in elements {
            let _ = write!(self.globals, " %{element}");
        }
        self.globals.push('\n');
    }

    /// A module-scope variable. Function-scope variables go through
    /// [`Assembler::push_local_variable`] instead.
    pub fn push_global_variable(
        &mut self,
        id: Id,
        pointer_type: Id,
        storage: StorageClass,
        init: Option<Id>,
    ) {
        let _ = write!(
            self.globals,
            "%{id} = OpVariable %{pointer_type} {}",
            storage.as_str()
        );
        if let Some(init) = init {
            let _ = write!(self.globals, " %{init}");
        }
        self.globals.push('\n');
    }

    // Function bodies.

    pub fn push_function(&mut self, id: Id, ret: Id, fn_type: Id, entry_label: Id) {
        let _ = writeln!(self.current.prologue, "\n%{id} = OpFunction %{ret} None %{fn_type}");
        let _ = writeln!(self.current.prologue, "\t%{entry_label} = OpLabel");
    }

    /// Closes the open function, flushing its buffers into the module.
    pub fn push_function_end(&mut self) {
        self.current.body.push_str("\t\tOpReturn\n");
        self.current.body.push_str("\t\tOpFunctionEnd\n");
        let flushed = self.current.take();
        self.functions.push_str(&flushed);
    }

    pub fn push_local_variable(&mut self, id: Id, pointer_type: Id, init: Option<Id>) {
        let _ = write!(self.current.locals, "\t%{id} = OpVariable %{pointer_type} Function");
        if let Some(init) = init {
            let _ = write!(self.current.locals, " %{init}");
        }
        self.current.locals.push('\n');
    }

    pub fn push_label(&mut self, id: Id) {
        let _ = writeln!(self.current.body, "\t%{id} = OpLabel");
    }

    pub fn push_load(&mut self, id: Id, ty: Id, pointer: Id) {
        let _ = writeln!(self.current.body, "\t%{id} = OpLoad %{ty} %{pointer}");
    }

    pub fn push_store(&mut self, pointer: Id, object: Id) {
        let _ = writeln!(self.current.body, "\t\tOpStore %{pointer} %{object}");
    }

    pub fn push_access_chain(&mut self, id: Id, ty: Id, base: Id, indices: &[Id]) {
        let _ = write!(self.current.body, "\t%{id} = OpAccessChain %{ty} %{base}");
        for index in indices {
            let _ = write!(self.current.body, " %{index}");
        }
        self.current.body.push('\n');
    }

    pub fn push_binary(&mut self, op: BinaryOp, id: Id, ty: Id, a: Id, b: Id) {
        let _ = writeln!(self.current.body, "\t%{id} = {} %{ty} %{a} %{b}", op.as_str());
    }

    pub fn push_compare(&mut self, op: CmpOp, id: Id, bool_ty: Id, a: Id, b: Id) {
        let _ = writeln!(
            self.current.body,
            "\t%{id} = {} %{bool_ty} %{a} %{b}",
            op.as_str()
        );
    }

    pub fn push_ext_inst(&mut self, id: Id, ty: Id, set: Id, inst: &str, args: &[Id]) {
        let _ = write!(self.current.body, "\t%{id} = OpExtInst %{ty} %{set} {inst}");
        for arg in args {
            let _ = write!(self.current.body, " %{arg}");
        }
        self.current.body.push('\n');
    }

    pub fn push_function_call(&mut self, id: Id, ret_ty: Id, func: Id) {
        let _ = writeln!(self.current.body, "\t%{id} = OpFunctionCall %{ret_ty} %{func}");
    }

    pub fn push_control_barrier(&mut self, execution: Id, memory: Id, semantics: Id) {
        let _ = writeln!(
            self.current.body,
            "\t\tOpControlBarrier %{execution} %{memory} %{semantics}"
        );
    }

    pub fn push_return(&mut self) {
        self.current.body.push_str("\t\tOpReturn\n");
    }

    pub fn push_branch(&mut self, target: Id) {
        let _ = writeln!(self.current.body, "\t\tOpBranch %{target}");
    }

    pub fn push_branch_conditional(&mut self, cond: Id, if_true: Id, if_false: Id) {
        let _ = writeln!(
            self.current.body,
            "\t\tOpBranchConditional %{cond} %{if_true} %{if_false}"
        );
    }

    pub fn push_loop_merge(&mut self, merge: Id, continue_target: Id) {
        let _ = writeln!(
            self.current.body,
            "\t\tOpLoopMerge %{merge} %{continue_target} None"
        );
    }

    pub fn push_selection_merge(&mut self, merge: Id) {
        let _ = writeln!(self.current.body, "\t\tOpSelectionMerge %{merge} None");
    }

    /// Concatenates the sections into the final module text.
    pub fn assemble(&self) -> String {
        let mut out = String::with_capacity(
            self.header.len()
                + self.ext_imports.len()
                + self.entry.len()
                + self.decorations.len()
                + self.globals.len()
                + self.functions.len(),
        );
        out.push_str(&self.header);
        out.push_str(&self.ext_imports);
        out.push_str(&self.entry);
        out.push_str(&self.decorations);
        out.push_str(&self.globals);
        out.push_str(&self.functions);
        out
    }
}
