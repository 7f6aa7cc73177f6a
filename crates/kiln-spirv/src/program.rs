//! Module-level program builder.
//!
//! [`Program`] owns the id allocator, the assembler, and the interning
//! tables, and exposes the operations the lowering code composes: type
//! and constant creation, variables, tensor registration, functions, and
//! the entry-point driver. Layout-aware tensor access lives in `layout`,
//! structured control flow in `flow`, and operator lowering in `lower`;
//! all of them are `impl Program` blocks over this state.

use std::collections::HashMap;

use kiln_graph::{DType, TensorType};
use tracing::debug;

use crate::asm::{Assembler, BinaryOp, BuiltIn, CmpOp, StorageClass};
use crate::error::CompileError;
use crate::id::{Id, IdAllocator};
use crate::intern::{ConstTable, TypeKey, TypeTable};

/// Workgroup dimensions every generated kernel is dispatched with.
pub const LOCAL_SIZE: [u32; 3] = [4, 4, 1];

/// Scope value `Workgroup`.
const SCOPE_WORKGROUP: u32 = 2;
/// Memory semantics `AcquireRelease | WorkgroupMemory`.
const SEMANTICS_WORKGROUP_ACQ_REL: u32 = 0x108;

/// Everything the code generator tracks about a registered tensor.
///
/// Buffer and workgroup tensors are module variables (`id` names the
/// variable). Compile-time-constant tensors are constant composites
/// (`id` names the composite) and additionally record the ids of their
/// fields and field array types so accesses can materialize local copies.
#[derive(Clone, Debug)]
pub struct TensorMeta {
    pub name: String,
    pub dtype: DType,
    pub storage: StorageClass,
    pub id: Id,
    /// Element type id.
    pub elem_type: Id,
    /// Declared shape, for static bookkeeping (loop bounds, strides).
    pub shape: Vec<u32>,
    /// Constant tensors only; [`Id::INVALID`] otherwise.
    pub dims_id: Id,
    pub shape_id: Id,
    pub data_id: Id,
    pub shape_array_type: Id,
    pub data_array_type: Id,
}

impl TensorMeta {
    /// Meta for a tensor backed by a module variable.
    pub(crate) fn variable(
        name: String,
        dtype: DType,
        storage: StorageClass,
        id: Id,
        elem_type: Id,
        shape: Vec<u32>,
    ) -> Self {
        Self {
            name,
            dtype,
            storage,
            id,
            elem_type,
            shape,
            dims_id: Id::INVALID,
            shape_id: Id::INVALID,
            data_id: Id::INVALID,
            shape_array_type: Id::INVALID,
            data_array_type: Id::INVALID,
        }
    }
}

/// A defined function.
#[derive(Clone, Copy, Debug)]
pub struct FunctionHeader {
    pub id: Id,
    pub return_type: Id,
}

/// One compiled layer: its kernel function and the workgroup-shared
/// tensors it touches. Drives barrier placement in the entry kernel.
#[derive(Clone, Debug)]
struct Layer {
    func: Id,
    workgroup_tensors: Vec<Id>,
}

/// Builder for one SPIR-V module.
#[derive(Debug)]
pub struct Program {
    ids: IdAllocator,
    pub(crate) asm: Assembler,
    types: TypeTable,
    consts: ConstTable,
    tensors: HashMap<String, TensorMeta>,
    functions: HashMap<Id, FunctionHeader>,
    layers: Vec<Layer>,
    /// Entry-point interface variables, deduplicated, in first-use order.
    interface: Vec<Id>,
    /// Function the emitter is currently inside; keys the memo tables.
    current_function: Id,
    // Memoization tables. Keys carry the function id so entries never
    // leak across function bodies.
    chains: HashMap<(Id, Id, Vec<Id>), Id>,
    pub(crate) shape_loads: HashMap<(Id, Id, usize), Id>,
    pub(crate) element_loads: HashMap<(Id, Id, Id), Id>,
    invocation_loads: HashMap<(Id, u32), Id>,
    pub(crate) const_copies: HashMap<(Id, Id), Id>,
    binary_memo: HashMap<(Id, BinaryOp, Id, Id), Id>,
    invocation_var: Id,
    glsl_ext: Id,
    input_bindings: u32,
    output_bindings: u32,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        let ids = IdAllocator::new();
        let mut asm = Assembler::new();
        let glsl_ext = ids.next();
        asm.push_ext_import(glsl_ext, "GLSL.std.450");
        Self {
            ids,
            asm,
            types: TypeTable::default(),
            consts: ConstTable::default(),
            tensors: HashMap::new(),
            functions: HashMap::new(),
            layers: Vec::new(),
            interface: Vec::new(),
            current_function: Id::INVALID,
            chains: HashMap::new(),
            shape_loads: HashMap::new(),
            element_loads: HashMap::new(),
            invocation_loads: HashMap::new(),
            const_copies: HashMap::new(),
            binary_memo: HashMap::new(),
            invocation_var: Id::INVALID,
            glsl_ext,
            input_bindings: 0,
            output_bindings: 0,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> Id {
        self.ids.next()
    }

    pub(crate) fn glsl_ext(&self) -> Id {
        self.glsl_ext
    }

    pub(crate) fn current_function(&self) -> Id {
        self.current_function
    }

    // Scalar types.

    pub(crate) fn void_type(&mut self) -> Id {
        let key = TypeKey::Void;
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_void_type(id);
        self.types.insert(key, id);
        id
    }

    pub(crate) fn bool_type(&mut self) -> Id {
        let key = TypeKey::Bool;
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_bool_type(id);
        self.types.insert(key, id);
        id
    }

    pub(crate) fn float_type(&mut self) -> Id {
        let key = TypeKey::Float { width: 32 };
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_float_type(id, 32);
        self.types.insert(key, id);
        id
    }

    pub(crate) fn uint_type(&mut self) -> Id {
        self.int_type(false)
    }

    pub(crate) fn int_type(&mut self, signed: bool) -> Id {
        let key = TypeKey::Int { width: 32, signed };
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_int_type(id, 32, signed);
        self.types.insert(key, id);
        id
    }

    /// The on-device element type for a graph data type.
    pub fn add_dtype(&mut self, dtype: DType) -> Result<Id, CompileError> {
        match dtype {
            DType::Float => Ok(self.float_type()),
            DType::Uint32 => Ok(self.uint_type()),
            DType::Int32 => Ok(self.int_type(true)),
            DType::Bool => Ok(self.bool_type()),
            other => Err(CompileError::UnsupportedDType { dtype: other }),
        }
    }

    // Composite types.

    pub(crate) fn add_vector_type(&mut self, component: Id, count: u32) -> Id {
        let key = TypeKey::Vector { component, count };
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_vector_type(id, component, count);
        self.types.insert(key, id);
        id
    }

    /// An array type. With `reuse` the definition is interned; without it
    /// a fresh definition is emitted so it can carry its own decorations.
    /// Layout-decorated classes get an `ArrayStride`.
    pub(crate) fn add_array_type(
        &mut self,
        element: Id,
        length: u32,
        stride: u32,
        storage: StorageClass,
        reuse: bool,
    ) -> Id {
        let key = TypeKey::Array { element, length };
        if reuse {
            if let Some(id) = self.types.get(&key) {
                return id;
            }
        }
        let length_const = self.const_u32(length);
        let id = self.ids.next();
        self.asm.push_array_type(id, element, length_const);
        if storage.explicit_layout() {
            self.asm.push_decorate_array_stride(id, stride);
        }
        if reuse {
            self.types.insert(key, id);
        }
        id
    }

    pub(crate) fn add_struct_type(&mut self, fields: &[Id], reuse: bool) -> Id {
        let key = TypeKey::Struct {
            fields: fields.to_vec(),
        };
        if reuse {
            if let Some(id) = self.types.get(&key) {
                return id;
            }
        }
        let id = self.ids.next();
        self.asm.push_struct_type(id, fields);
        if reuse {
            self.types.insert(key, id);
        }
        id
    }

    pub(crate) fn add_function_type(&mut self, ret: Id) -> Id {
        let key = TypeKey::Function { ret };
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_function_type(id, ret);
        self.types.insert(key, id);
        id
    }

    pub(crate) fn add_pointer_type(&mut self, storage: StorageClass, pointee: Id) -> Id {
        let storage = storage.for_access();
        let key = TypeKey::Pointer { storage, pointee };
        if let Some(id) = self.types.get(&key) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_pointer_type(id, storage, pointee);
        self.types.insert(key, id);
        id
    }

    // Constants.

    pub fn const_u32(&mut self, value: u32) -> Id {
        let ty = self.uint_type();
        if let Some(id) = self.consts.get_int(ty, u64::from(value)) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_constant(id, ty, &value.to_string());
        self.consts.insert_int(ty, u64::from(value), id);
        id
    }

    pub fn const_f32(&mut self, value: f32) -> Id {
        let ty = self.float_type();
        if let Some(id) = self.consts.get_float(ty, value) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_constant(id, ty, &value.to_string());
        self.consts.insert_float(ty, value, id);
        id
    }

    /// The zero constant of a given element type.
    pub fn const_zero(&mut self, dtype: DType) -> Result<Id, CompileError> {
        match dtype {
            DType::Float => Ok(self.const_f32(0.0)),
            DType::Uint32 => Ok(self.const_u32(0)),
            DType::Int32 => {
                let ty = self.int_type(true);
                if let Some(id) = self.consts.get_int(ty, 0) {
                    return Ok(id);
                }
                let id = self.ids.next();
                self.asm.push_constant(id, ty, "0");
                self.consts.insert_int(ty, 0, id);
                Ok(id)
            }
            other => Err(CompileError::UnsupportedDType { dtype: other }),
        }
    }

    pub(crate) fn add_composite_const(&mut self, ty: Id, elements: Vec<Id>) -> Id {
        if let Some(id) = self.consts.get_composite(ty, &elements) {
            return id;
        }
        let id = self.ids.next();
        self.asm.push_constant_composite(id, ty, &elements);
        self.consts.insert_composite(ty, elements, id);
        id
    }

    // Variables.

    /// Declares a variable of the given pointee type. `Function`-class
    /// variables land in the open function's locals; anything else is a
    /// module variable.
    pub fn add_var(
        &mut self,
        pointee: Id,
        storage: StorageClass,
        init: Option<Id>,
    ) -> Result<Id, CompileError> {
        let storage = storage.for_access();
        let ptr = self.add_pointer_type(storage, pointee);
        let id = self.ids.next();
        if storage == StorageClass::Function {
            if !self.asm.in_function() {
                return Err(CompileError::NoOpenFunction);
            }
            self.asm.push_local_variable(id, ptr, init);
        } else {
            self.asm.push_global_variable(id, ptr, storage, init);
        }
        Ok(id)
    }

    /// The `GlobalInvocationId` builtin variable, created on first use
    /// and listed in the entry interface.
    pub fn global_invocation_id(&mut self) -> Id {
        if !self.invocation_var.is_invalid() {
            return self.invocation_var;
        }
        let uint = self.uint_type();
        let vec3 = self.add_vector_type(uint, 3);
        let ptr = self.add_pointer_type(StorageClass::Input, vec3);
        let id = self.ids.next();
        self.asm.push_global_variable(id, ptr, StorageClass::Input, None);
        self.asm.push_decorate_builtin(id, BuiltIn::GlobalInvocationId);
        self.invocation_var = id;
        self.push_interface(id);
        id
    }

    /// Loads one component of the invocation id, memoized per function.
    pub fn load_invocation_index(&mut self, index: u32) -> Id {
        let key = (self.current_function, index);
        if let Some(id) = self.invocation_loads.get(&key) {
            return *id;
        }
        let var = self.global_invocation_id();
        let uint = self.uint_type();
        let ptr = self.add_pointer_type(StorageClass::Input, uint);
        let index_const = self.const_u32(index);
        let chain = self.access_chain(ptr, var, &[index_const]);
        let id = self.ids.next();
        self.asm.push_load(id, uint, chain);
        self.invocation_loads.insert(key, id);
        id
    }

    // Instructions.

    pub fn load_var(&mut self, ty: Id, pointer: Id) -> Id {
        let id = self.ids.next();
        self.asm.push_load(id, ty, pointer);
        id
    }

    pub fn store_var(&mut self, pointer: Id, object: Id) {
        self.asm.push_store(pointer, object);
    }

    /// An `OpAccessChain`, memoized per function on (base, indices).
    pub fn access_chain(&mut self, ptr_ty: Id, base: Id, indices: &[Id]) -> Id {
        let key = (self.current_function, base, indices.to_vec());
        if let Some(id) = self.chains.get(&key) {
            return *id;
        }
        let id = self.ids.next();
        self.asm.push_access_chain(id, ptr_ty, base, indices);
        self.chains.insert(key, id);
        id
    }

    /// A binary arithmetic op, memoized per function on (op, a, b).
    pub fn binary_op(&mut self, op: BinaryOp, ty: Id, a: Id, b: Id) -> Id {
        let key = (self.current_function, op, a, b);
        if let Some(id) = self.binary_memo.get(&key) {
            return *id;
        }
        let id = self.ids.next();
        self.asm.push_binary(op, id, ty, a, b);
        self.binary_memo.insert(key, id);
        id
    }

    pub fn compare(&mut self, op: CmpOp, a: Id, b: Id) -> Id {
        let boolean = self.bool_type();
        let id = self.ids.next();
        self.asm.push_compare(op, id, boolean, a, b);
        id
    }

    /// Workgroup-scope execution and memory barrier.
    pub fn workgroup_barrier(&mut self) {
        let scope = self.const_u32(SCOPE_WORKGROUP);
        let semantics = self.const_u32(SEMANTICS_WORKGROUP_ACQ_REL);
        self.asm.push_control_barrier(scope, scope, semantics);
    }

    // Functions.

    /// Opens a new `void()` function and makes it current.
    pub fn begin_function(&mut self) -> Id {
        let void = self.void_type();
        let fn_ty = self.add_function_type(void);
        let id = self.ids.next();
        let entry_label = self.ids.next();
        self.asm.push_function(id, void, fn_ty, entry_label);
        self.functions.insert(
            id,
            FunctionHeader {
                id,
                return_type: void,
            },
        );
        self.current_function = id;
        id
    }

    pub fn end_function(&mut self) {
        self.asm.push_function_end();
        self.current_function = Id::INVALID;
    }

    pub fn call_function(&mut self, func: Id) -> Result<Id, CompileError> {
        let header = self
            .functions
            .get(&func)
            .copied()
            .ok_or(CompileError::UnknownFunction(func))?;
        let id = self.ids.next();
        self.asm.push_function_call(id, header.return_type, func);
        Ok(id)
    }

    // Tensor registry.

    pub fn tensor(&self, name: &str) -> Option<&TensorMeta> {
        self.tensors.get(name)
    }

    /// Registers a tensor, first registration wins. Returns the winning
    /// meta, which may differ from `meta` if the name was already taken.
    pub(crate) fn register_tensor(&mut self, meta: TensorMeta) -> TensorMeta {
        self.tensors
            .entry(meta.name.clone())
            .or_insert(meta)
            .clone()
    }

    pub(crate) fn push_interface(&mut self, var: Id) {
        if !self.interface.contains(&var) {
            self.interface.push(var);
        }
    }

    /// Registers an externally visible input tensor (descriptor set 0).
    pub fn add_input(&mut self, ty: &TensorType) -> Result<(), CompileError> {
        debug!(tensor = %ty.name, shape = ?ty.shape, "registering input");
        self.add_buffer_tensor(ty, 0)
    }

    /// Registers an externally visible output tensor (descriptor set 1).
    pub fn add_output(&mut self, ty: &TensorType) -> Result<(), CompileError> {
        debug!(tensor = %ty.name, shape = ?ty.shape, "registering output");
        self.add_buffer_tensor(ty, 1)
    }

    fn add_buffer_tensor(&mut self, ty: &TensorType, set: u32) -> Result<(), CompileError> {
        if ty.dims() > kiln_graph::MAX_RANK {
            return Err(kiln_graph::TensorError::RankTooHigh {
                name: ty.name.clone(),
                dims: ty.dims(),
            }
            .into());
        }
        let storage = StorageClass::StorageBuffer;
        let inner = self.add_tensor_type(ty, storage, false)?;
        // Outer wrapper struct carries the Block decoration; accesses
        // index through it with a leading zero.
        let wrapper = self.add_struct_type(&[inner], false);
        self.asm.push_decorate_block(wrapper);
        self.asm.push_member_offset(wrapper, 0, 0);
        let var = self.add_var(wrapper, storage, None)?;
        let binding = if set == 0 {
            let b = self.input_bindings;
            self.input_bindings += 1;
            b
        } else {
            let b = self.output_bindings;
            self.output_bindings += 1;
            b
        };
        self.asm.push_decorate_binding(var, set, binding);
        let elem = self.add_dtype(ty.dtype)?;
        let meta = TensorMeta::variable(
            ty.name.clone(),
            ty.dtype,
            storage,
            var,
            elem,
            ty.shape.clone(),
        );
        self.register_tensor(meta);
        self.push_interface(var);
        Ok(())
    }

    /// Records a compiled layer for the entry-point driver.
    pub(crate) fn push_layer(&mut self, func: Id, workgroup_tensors: Vec<Id>) {
        self.layers.push(Layer {
            func,
            workgroup_tensors,
        });
    }

    /// Emits the entry kernel: calls each layer in order, separating two
    /// consecutive layers with a workgroup barrier only when they touch a
    /// common workgroup-shared tensor.
    pub fn set_main(&mut self) -> Result<(), CompileError> {
        self.global_invocation_id();
        let main = self.begin_function();
        let layers = self.layers.clone();
        for (i, layer) in layers.iter().enumerate() {
            if i > 0 && shares_workgroup_tensor(&layers[i - 1], layer) {
                debug!(layer = i, "inserting workgroup barrier");
                self.workgroup_barrier();
            }
            self.call_function(layer.func)?;
        }
        self.end_function();
        self.asm
            .push_entry_point(main, "main", &self.interface, LOCAL_SIZE);
        debug!(layers = layers.len(), "entry kernel emitted");
        Ok(())
    }

    /// Final module text.
    pub fn assemble(&self) -> String {
        self.asm.assemble()
    }
}

fn shares_workgroup_tensor(a: &Layer, b: &Layer) -> bool {
    a.workgroup_tensors
        .iter()
        .any(|t| b.workgroup_tensors.contains(t))
}
