//! Runtime state: frames, stacks, module registries, async tables, and the
//! pending-operation slots the driver services.
//!
//! State mutators follow the teacher pattern of the suspend/resume
//! interpreter: `resume_with_*` consume the state and return the next one,
//! so there is no hidden aliasing between a suspended snapshot and a
//! resumed run. A paused state (any `awaiting_*` status) serializes to a
//! binary snapshot with [`RunState::dump`] and restores with
//! [`RunState::load`]; in-flight futures live only in the driver and are
//! never part of the snapshot.

use std::path::PathBuf;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    ai::request::AiInteraction,
    builtins::ArgsRegistry,
    error::{ErrorDetails, SourceLoc},
    instruction::{AsyncBinding, Instr, ReturnExpectation},
    program::{AiOpKind, DestructureField, FunctionDef, ImportKind, Program, Span},
    scheduler::{AsyncEntry, OpId, StartDescriptor},
    trace::IdCounters,
    value::{ModelDescriptor, StructuralType, TypeLookup, ValueData, WrappedValue, validate_and_coerce},
};

/// Execution status. `Running` means the step engine can make synchronous
/// progress; each `Awaiting*` names the external service the driver must
/// provide before stepping can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Running,
    AwaitingAi,
    AwaitingHost,
    AwaitingImportedHost,
    AwaitingTool,
    AwaitingCompress,
    AwaitingUser,
    AwaitingAsync,
    Completed,
    Error,
}

impl Status {
    #[must_use]
    pub fn is_awaiting(self) -> bool {
        matches!(
            self,
            Self::AwaitingAi
                | Self::AwaitingHost
                | Self::AwaitingImportedHost
                | Self::AwaitingTool
                | Self::AwaitingCompress
                | Self::AwaitingUser
                | Self::AwaitingAsync
        )
    }
}

/// One lexical scope within a frame. Loop-body scopes are flagged so the
/// compress operation can find the innermost loop's bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub vars: AHashMap<String, WrappedValue>,
    pub is_loop: bool,
}

impl Scope {
    #[must_use]
    pub fn new(is_loop: bool) -> Self {
        Self {
            vars: AHashMap::new(),
            is_loop,
        }
    }
}

/// An activation frame. Frames tagged with `module_path` resolve free names
/// against that module's globals instead of the program's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    /// Lexical scopes, innermost last. Most frames never outgrow the
    /// inline capacity.
    pub scopes: SmallVec<[Scope; 2]>,
    pub module_path: Option<String>,
}

impl Frame {
    #[must_use]
    pub fn new(name: impl Into<String>, module_path: Option<String>) -> Self {
        Self {
            name: name.into(),
            scopes: smallvec![Scope::new(false)],
            module_path,
        }
    }
}

/// A loaded Vibe module: its evaluated globals, export set, functions, and
/// its own import registry (a module's imports are visible only to it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VibeModule {
    pub file: String,
    pub globals: AHashMap<String, WrappedValue>,
    pub exports: AHashSet<String>,
    pub functions: AHashMap<String, FunctionDef>,
    pub imported_names: AHashMap<String, ImportedNameInfo>,
}

/// A loaded host-language module: just its export list; invocation goes
/// through the host-module capability at await time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostModule {
    pub exports: Vec<String>,
}

/// Where an imported local name came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedNameInfo {
    pub source_path: String,
    pub kind: ImportKind,
    pub original_name: String,
}

// --- pending-operation descriptors, at most one set at a time ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiPending {
    pub kind: AiOpKind,
    pub prompt: String,
    pub model: ModelDescriptor,
    pub expectation: ReturnExpectation,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBlockPending {
    pub params: Vec<String>,
    pub body: String,
    pub values: Vec<WrappedValue>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedHostPending {
    pub module: String,
    pub function: String,
    pub args: Vec<WrappedValue>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPending {
    pub name: String,
    pub args: Vec<WrappedValue>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressPending {
    pub model: ModelDescriptor,
    /// Loop-scope summary prompt, assembled at suspend time.
    pub prompt: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPending {
    pub prompt: String,
    pub span: Span,
}

/// Options for creating an initial state.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root_dir: PathBuf,
    pub max_parallel: usize,
    pub program_args: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            max_parallel: 4,
            program_args: Vec::new(),
        }
    }
}

/// The full runtime state of one program execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub status: Status,
    /// Script file of the main program, used in error locations.
    pub file: String,
    /// Call stack; last element is the innermost frame.
    pub call_stack: Vec<Frame>,
    /// Instruction stack; last element is the next instruction.
    pub instruction_stack: Vec<Instr>,
    /// Operand stack for multi-operand instructions.
    pub value_stack: Vec<WrappedValue>,
    pub functions: AHashMap<String, FunctionDef>,
    pub type_defs: AHashMap<String, StructuralType>,
    pub vibe_modules: AHashMap<String, VibeModule>,
    pub host_modules: AHashMap<String, HostModule>,
    pub imported_names: AHashMap<String, ImportedNameInfo>,
    pub async_ops: AHashMap<OpId, AsyncEntry>,
    /// Started (or scheduled) operations not yet joined.
    pub pending_async_ids: AHashSet<OpId>,
    /// Frontier of an explicit await: the ops the driver must resolve next.
    pub awaiting_async_ids: Vec<OpId>,
    /// Scheduled starts the driver has not yet converted into live work.
    pub pending_async_starts: Vec<StartDescriptor>,
    pub async_var_to_op: AHashMap<String, OpId>,
    next_op_id: u32,
    pub pending_ai: Option<AiPending>,
    pub pending_host_block: Option<HostBlockPending>,
    pub pending_imported_host_call: Option<ImportedHostPending>,
    pub pending_tool: Option<ToolPending>,
    pub pending_compress: Option<CompressPending>,
    pub pending_user: Option<UserPending>,
    /// Set when the next declare expects a multi-field return.
    pub pending_destructuring: Option<Vec<DestructureField>>,
    pub last_result: WrappedValue,
    pub error_object: Option<ErrorDetails>,
    pub is_in_async_isolation: bool,
    pub root_dir: PathBuf,
    /// Bound on simultaneously running async operations.
    pub max_parallel: usize,
    pub ai_interactions: Vec<AiInteraction>,
    pub args: ArgsRegistry,
    pub id_counters: IdCounters,
}

impl RunState {
    /// Creates the initial state for a program: registries seeded, the root
    /// frame pushed, and the top-level statements compiled onto the
    /// instruction stack. Imports are loaded separately by the driver.
    #[must_use]
    pub fn create_initial_state(program: &Program, options: RunOptions) -> Self {
        let mut state = Self::bare(program.file.clone(), options);
        for func in &program.functions {
            state.functions.insert(func.name.clone(), func.clone());
        }
        for ty in &program.type_defs {
            state.type_defs.insert(ty.name.clone(), ty.clone());
        }
        crate::step::push_stmts(&mut state, &program.statements);
        state
    }

    fn bare(file: String, options: RunOptions) -> Self {
        Self {
            status: Status::Running,
            file,
            call_stack: vec![Frame::new("main", None)],
            instruction_stack: Vec::new(),
            value_stack: Vec::new(),
            functions: AHashMap::new(),
            type_defs: AHashMap::new(),
            vibe_modules: AHashMap::new(),
            host_modules: AHashMap::new(),
            imported_names: AHashMap::new(),
            async_ops: AHashMap::new(),
            pending_async_ids: AHashSet::new(),
            awaiting_async_ids: Vec::new(),
            pending_async_starts: Vec::new(),
            async_var_to_op: AHashMap::new(),
            next_op_id: 0,
            pending_ai: None,
            pending_host_block: None,
            pending_imported_host_call: None,
            pending_tool: None,
            pending_compress: None,
            pending_user: None,
            pending_destructuring: None,
            last_result: WrappedValue::null(),
            error_object: None,
            is_in_async_isolation: false,
            root_dir: options.root_dir,
            max_parallel: options.max_parallel.max(1),
            ai_interactions: Vec::new(),
            args: ArgsRegistry::new(options.program_args),
            id_counters: IdCounters::default(),
        }
    }

    /// An empty running state, for unit tests that drive internals directly.
    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self::bare("test.vibe".to_owned(), RunOptions::default())
    }

    // --- snapshotting ---

    /// Serializes the state to a binary snapshot.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a state from a binary snapshot produced by [`dump`](Self::dump).
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    // --- ids and locations ---

    pub fn alloc_op_id(&mut self) -> OpId {
        let id = OpId::new(self.next_op_id);
        self.next_op_id += 1;
        id
    }

    /// Resolves a span to a full source location using the current frame's
    /// module file when inside a module function.
    #[must_use]
    pub fn loc(&self, span: Span) -> SourceLoc {
        let file = self
            .current_frame()
            .and_then(|f| f.module_path.as_ref())
            .and_then(|p| self.vibe_modules.get(p))
            .map_or(self.file.as_str(), |m| m.file.as_str());
        SourceLoc::new(file, span.line, span.column)
    }

    // --- frames and scopes ---

    #[must_use]
    pub fn current_frame(&self) -> Option<&Frame> {
        self.call_stack.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.call_stack.last_mut()
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.call_stack.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.call_stack.pop()
    }

    /// Current call depth; step-over support skips stepping while the depth
    /// is greater than it was at the step boundary.
    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn enter_scope(&mut self, is_loop: bool) {
        if let Some(frame) = self.current_frame_mut() {
            frame.scopes.push(Scope::new(is_loop));
        }
    }

    pub fn exit_scope(&mut self) {
        if let Some(frame) = self.current_frame_mut()
            && frame.scopes.len() > 1
        {
            frame.scopes.pop();
        }
    }

    /// The innermost loop scope of the current frame, for compress.
    #[must_use]
    pub fn innermost_loop_scope(&self) -> Option<&Scope> {
        self.current_frame()?.scopes.iter().rev().find(|s| s.is_loop)
    }

    // --- name resolution ---
    //
    // Order: innermost frame scopes → module globals (when the frame is
    // tagged with a module path, the module's, never the caller's; else the
    // program's) → the frame's import registry → fail.

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&WrappedValue> {
        let frame = self.current_frame()?;
        for scope in frame.scopes.iter().rev() {
            if let Some(value) = scope.vars.get(name) {
                return Some(value);
            }
        }
        if let Some(path) = &frame.module_path {
            if let Some(module) = self.vibe_modules.get(path)
                && let Some(value) = module.globals.get(name)
            {
                return Some(value);
            }
            // Program globals remain visible behind the module's own.
            if let Some(value) = self.program_global(name) {
                return Some(value);
            }
            if let Some(module) = self.vibe_modules.get(path)
                && let Some(info) = module.imported_names.get(name)
            {
                return self.imported_value(info);
            }
            return None;
        }
        if let Some(value) = self.program_global(name) {
            return Some(value);
        }
        if let Some(info) = self.imported_names.get(name) {
            return self.imported_value(info);
        }
        None
    }

    fn program_global(&self, name: &str) -> Option<&WrappedValue> {
        let root = self.call_stack.first()?;
        root.scopes.first()?.vars.get(name)
    }

    /// Resolves an imported name to an exported module global, when the
    /// export is a value (functions resolve at call time instead).
    fn imported_value(&self, info: &ImportedNameInfo) -> Option<&WrappedValue> {
        if info.kind != ImportKind::Vibe {
            return None;
        }
        let module = self.vibe_modules.get(&info.source_path)?;
        if module.exports.contains(&info.original_name) {
            module.globals.get(&info.original_name)
        } else {
            None
        }
    }

    /// Binds a new variable in the innermost scope. Redeclaring a name in
    /// the same scope is a scope error.
    pub fn declare(&mut self, name: &str, value: WrappedValue) -> Result<(), ErrorDetails> {
        let Some(frame) = self.current_frame_mut() else {
            return Err(ErrorDetails::internal("declare with no active frame"));
        };
        let scope = frame.scopes.last_mut().expect("frame always has a scope");
        if scope.vars.contains_key(name) {
            return Err(ErrorDetails::scope_error(format!("'{name}' is already declared")));
        }
        scope.vars.insert(name.to_owned(), value);
        Ok(())
    }

    /// Stores into an existing binding, innermost scope first, then the
    /// enclosing module's globals for module frames. Checks the const flag
    /// and re-validates against the binding's declared type.
    pub fn assign_name(&mut self, name: &str, value: WrappedValue) -> Result<(), ErrorDetails> {
        let type_defs = self.type_defs.clone();
        let module_path = self.current_frame().and_then(|f| f.module_path.clone());

        let slot = self.find_binding_mut(name, module_path.as_deref());
        let Some(slot) = slot else {
            return Err(ErrorDetails::undefined(name));
        };
        if slot.is_const {
            return Err(ErrorDetails::scope_error(format!("cannot assign to constant '{name}'")));
        }
        let incoming = coerce_to_binding(value, slot, name, &type_defs);
        let declared = slot.declared_type.clone();
        let is_private = slot.is_private;
        *slot = incoming.with_type(declared);
        slot.is_private = is_private;
        Ok(())
    }

    /// Mutable lookup of an existing binding, used by path assignment.
    pub(crate) fn binding_for_path_mut(&mut self, name: &str) -> Option<&mut WrappedValue> {
        let module_path = self.current_frame().and_then(|f| f.module_path.clone());
        self.find_binding_mut(name, module_path.as_deref())
    }

    fn find_binding_mut(&mut self, name: &str, module_path: Option<&str>) -> Option<&mut WrappedValue> {
        // Split borrows: scan frame scopes first, then fall back to globals.
        let in_frame = self
            .call_stack
            .last()
            .map(|frame| frame.scopes.iter().rev().any(|s| s.vars.contains_key(name)))
            .unwrap_or(false);
        if in_frame {
            let frame = self.call_stack.last_mut()?;
            for scope in frame.scopes.iter_mut().rev() {
                if let Some(value) = scope.vars.get_mut(name) {
                    return Some(value);
                }
            }
            return None;
        }
        if let Some(path) = module_path {
            if self.vibe_modules.get(path).is_some_and(|m| m.globals.contains_key(name)) {
                return self.vibe_modules.get_mut(path)?.globals.get_mut(name);
            }
            return None;
        }
        let root = self.call_stack.first_mut()?;
        root.scopes.first_mut()?.vars.get_mut(name)
    }

    // --- suspension and resumption ---

    fn clear_pending_slots(&mut self) {
        self.pending_ai = None;
        self.pending_host_block = None;
        self.pending_imported_host_call = None;
        self.pending_tool = None;
        self.pending_compress = None;
        self.pending_user = None;
    }

    /// Injects an LM result and resumes. A no-op unless the state is
    /// actually awaiting an LM response.
    #[must_use]
    pub fn resume_with_ai_response(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingAi || self.pending_ai.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Injects a host-block result and resumes.
    #[must_use]
    pub fn resume_with_host_result(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingHost || self.pending_host_block.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Injects an imported host-function result and resumes.
    #[must_use]
    pub fn resume_with_imported_host_result(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingImportedHost || self.pending_imported_host_call.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Injects a tool result and resumes.
    #[must_use]
    pub fn resume_with_tool_result(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingTool || self.pending_tool.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Injects a compression summary and resumes.
    #[must_use]
    pub fn resume_with_compress_result(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingCompress || self.pending_compress.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Injects a user-input answer and resumes.
    #[must_use]
    pub fn resume_with_user_input(mut self, value: WrappedValue) -> Self {
        if self.status != Status::AwaitingUser || self.pending_user.is_none() {
            return self;
        }
        self.clear_pending_slots();
        self.value_stack.push(value);
        self.status = Status::Running;
        self
    }

    /// Applies terminal async entries for the awaited frontier: rebinds the
    /// declaring variables to their resolved (or errored) values, removes
    /// joined entries, and resumes. A no-op unless awaiting async results.
    #[must_use]
    pub fn resume_with_async_results(mut self) -> Self {
        if self.status != Status::AwaitingAsync {
            return self;
        }
        let awaited = std::mem::take(&mut self.awaiting_async_ids);
        let mut unresolved = Vec::new();
        for op_id in awaited {
            let Some(entry) = self.async_ops.get(&op_id) else {
                continue;
            };
            if !entry.is_terminal() {
                unresolved.push(op_id);
                continue;
            }
            let entry = self.async_ops.remove(&op_id).expect("entry just read");
            self.pending_async_ids.remove(&op_id);
            self.bind_async_outcome(&entry);
        }
        if unresolved.is_empty() {
            self.status = Status::Running;
        } else {
            self.awaiting_async_ids = unresolved;
        }
        self
    }

    /// Writes a resolved async outcome into the variables it was declared
    /// for. Failures become errored values on the binding; declared types
    /// re-validate with failures likewise becoming errored values.
    fn bind_async_outcome(&mut self, entry: &AsyncEntry) {
        let resolved = match (&entry.value, &entry.error) {
            (_, Some(detail)) => WrappedValue::as_error(detail.clone()),
            (Some(value), None) => {
                let mut v = value.clone();
                v.async_handle = None;
                v
            }
            (None, None) => WrappedValue::null(),
        };
        match &entry.binding {
            AsyncBinding::Single { name, ty } => {
                let type_defs = self.type_defs.clone();
                let value = match ty {
                    Some(declared) if !resolved.is_errored() => {
                        match validate_and_coerce(resolved.payload().clone(), declared, name, &type_defs) {
                            Ok(payload) => {
                                let mut v = WrappedValue::wrap(payload, resolved.source);
                                v.declared_type = Some(declared.clone());
                                v
                            }
                            Err(detail) => WrappedValue::as_error(detail),
                        }
                    }
                    _ => resolved,
                };
                self.rebind_async_var(name, value);
            }
            AsyncBinding::Fields(fields) => {
                self.bind_destructured(fields, &resolved);
            }
        }
    }

    /// Binds each destructured field out of a resolved record. An errored
    /// source value errors every field with the same details.
    pub fn bind_destructured(&mut self, fields: &[DestructureField], resolved: &WrappedValue) {
        use crate::value::Payload;
        let type_defs = self.type_defs.clone();
        for field in fields {
            let value = match &resolved.data {
                ValueData::Err(detail) => WrappedValue::as_error(detail.clone()),
                ValueData::Ok(Payload::Record(record)) => match record.get(&field.name) {
                    Some(payload) => {
                        match validate_and_coerce(payload.clone(), &field.ty, &field.name, &type_defs) {
                            Ok(coerced) => {
                                let mut v = WrappedValue::wrap(coerced, resolved.source);
                                v.declared_type = Some(field.ty.clone());
                                v
                            }
                            Err(detail) => WrappedValue::as_error(detail),
                        }
                    }
                    None => WrappedValue::as_error(ErrorDetails::value_error(format!(
                        "missing field '{}' in structured result",
                        field.name
                    ))),
                },
                ValueData::Ok(other) => WrappedValue::as_error(ErrorDetails::value_error(format!(
                    "expected a record for destructuring, got {}",
                    other.type_name()
                ))),
            };
            self.rebind_async_var(&field.name, value);
        }
    }

    /// Replaces a pending variable with its resolved value, preserving the
    /// binding's flags. Falls back to declaring when the variable has not
    /// been bound yet (the start suspended before its declare ran).
    fn rebind_async_var(&mut self, name: &str, value: WrappedValue) {
        self.async_var_to_op.remove(name);
        for frame in self.call_stack.iter_mut().rev() {
            for scope in frame.scopes.iter_mut().rev() {
                if let Some(slot) = scope.vars.get_mut(name) {
                    let is_const = slot.is_const;
                    let is_private = slot.is_private;
                    let declared = slot.declared_type.clone();
                    *slot = value;
                    slot.is_const = is_const;
                    slot.is_private = is_private;
                    if slot.declared_type.is_none() {
                        slot.declared_type = declared;
                    }
                    return;
                }
            }
        }
        self.value_stack.push(value);
    }

    /// Fails the run: installs the error object and flips to `Error`.
    pub fn fail(&mut self, detail: ErrorDetails) {
        self.error_object = Some(detail);
        self.status = Status::Error;
        self.instruction_stack.clear();
    }

    /// Deep-clones the state for an isolated async function invocation:
    /// async tables and pending slots reset, instruction and value stacks
    /// empty. The clone shares nothing mutable with the parent.
    #[must_use]
    pub fn clone_for_isolation(&self) -> Self {
        let mut clone = self.clone();
        clone.status = Status::Running;
        clone.instruction_stack.clear();
        clone.value_stack.clear();
        clone.async_ops.clear();
        clone.pending_async_ids.clear();
        clone.awaiting_async_ids.clear();
        clone.pending_async_starts.clear();
        clone.async_var_to_op.clear();
        clone.clear_pending_slots();
        clone.pending_destructuring = None;
        clone.error_object = None;
        clone.last_result = WrappedValue::null();
        clone.is_in_async_isolation = true;
        clone
    }
}

impl TypeLookup for RunState {
    fn lookup_type(&self, name: &str) -> Option<&StructuralType> {
        self.type_defs.get(name)
    }
}

/// Coerces an incoming value to a binding's declared type, turning failures
/// into errored values (assignment-time mismatches are not fatal).
fn coerce_to_binding(
    value: WrappedValue,
    slot: &WrappedValue,
    name: &str,
    type_defs: &AHashMap<String, StructuralType>,
) -> WrappedValue {
    let Some(declared) = &slot.declared_type else {
        return value;
    };
    if value.is_errored() || value.is_pending() {
        return value;
    }
    match validate_and_coerce(value.payload().clone(), declared, name, type_defs) {
        Ok(payload) => {
            let mut v = WrappedValue::wrap(payload, value.source);
            v.async_handle = value.async_handle;
            v
        }
        Err(detail) => WrappedValue::as_error(detail),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::{Payload, ValueSource};

    fn int(v: i64) -> WrappedValue {
        WrappedValue::wrap(Payload::Int(v), ValueSource::Literal)
    }

    #[test]
    fn declare_and_lookup_through_scopes() {
        let mut state = RunState::empty_for_tests();
        state.declare("x", int(1)).unwrap();
        state.enter_scope(false);
        state.declare("y", int(2)).unwrap();
        assert_eq!(*state.lookup("x").unwrap().payload(), Payload::Int(1));
        assert_eq!(*state.lookup("y").unwrap().payload(), Payload::Int(2));
        state.exit_scope();
        assert!(state.lookup("y").is_none());
    }

    #[test]
    fn redeclare_in_same_scope_errors() {
        let mut state = RunState::empty_for_tests();
        state.declare("x", int(1)).unwrap();
        assert!(state.declare("x", int(2)).is_err());
        // Shadowing in an inner scope is fine.
        state.enter_scope(false);
        state.declare("x", int(3)).unwrap();
        assert_eq!(*state.lookup("x").unwrap().payload(), Payload::Int(3));
    }

    #[test]
    fn assign_respects_const() {
        let mut state = RunState::empty_for_tests();
        let mut value = int(1);
        value.is_const = true;
        state.declare("k", value).unwrap();
        let err = state.assign_name("k", int(2)).unwrap_err();
        assert!(err.message.contains("constant"));
    }

    #[test]
    fn assign_coerces_against_declared_type() {
        let mut state = RunState::empty_for_tests();
        let mut value = int(1);
        value.declared_type = Some(crate::value::DeclaredType::Number);
        state.declare("n", value).unwrap();
        state.assign_name("n", WrappedValue::wrap(Payload::Text("no".into()), ValueSource::Literal)).unwrap();
        assert!(state.lookup("n").unwrap().is_errored());
    }

    #[test]
    fn resume_is_noop_when_not_awaiting() {
        let state = RunState::empty_for_tests();
        let before = state.clone();
        let after = state.resume_with_ai_response(int(5));
        assert_eq!(after, before);
    }

    #[test]
    fn snapshot_round_trip_preserves_state() {
        let mut state = RunState::empty_for_tests();
        state.declare("x", int(42)).unwrap();
        state.status = Status::AwaitingAi;
        state.pending_ai = Some(AiPending {
            kind: AiOpKind::Do,
            prompt: "p".into(),
            model: ModelDescriptor {
                name: "m".into(),
                api_key: "k".into(),
                url: None,
                provider: None,
                tools: Vec::new(),
                thinking_level: None,
                server_tools: Vec::new(),
            },
            expectation: ReturnExpectation::Untyped,
            span: Span::default(),
        });
        let bytes = state.dump().unwrap();
        let restored = RunState::load(&bytes).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn isolation_clone_resets_async_state() {
        let mut state = RunState::empty_for_tests();
        let op = state.alloc_op_id();
        state.pending_async_ids.insert(op);
        state.declare("x", int(9)).unwrap();
        let clone = state.clone_for_isolation();
        assert!(clone.pending_async_ids.is_empty());
        assert!(clone.is_in_async_isolation);
        assert_eq!(*clone.lookup("x").unwrap().payload(), Payload::Int(9));
        assert!(!state.is_in_async_isolation);
    }
}
