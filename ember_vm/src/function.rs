//! Functions, executables and scopes.
//!
//! A `FunctionExecutable` is the shared, compile-once part of a function: its
//! name, declared parameters and the code the code cache compiles from. A
//! `Function` pairs an executable with the scope it closed over. Host
//! functions have no executable; their native code runs directly.

use crate::engine::Engine;
use crate::error::VmResult;
use crate::frame::CallFrame;
use crate::value::Value;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Native code standing in for a function body.
pub type NativeCode = Arc<dyn Fn(&Engine, &CallFrame<'_>) -> VmResult<Value> + Send + Sync>;

static NEXT_EXECUTABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a function executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutableId(u64);

impl ExecutableId {
    /// Raw id value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

// =============================================================================
// Function Executable
// =============================================================================

/// Compile-once description of a script function.
pub struct FunctionExecutable {
    id: ExecutableId,
    name: String,
    parameter_count: usize,
    code: NativeCode,
}

impl FunctionExecutable {
    /// Create an executable with `parameter_count` declared parameters.
    pub fn new<F>(name: impl Into<String>, parameter_count: usize, code: F) -> Arc<Self>
    where
        F: Fn(&Engine, &CallFrame<'_>) -> VmResult<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: ExecutableId(NEXT_EXECUTABLE_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            parameter_count,
            code: Arc::new(code),
        })
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> ExecutableId {
        self.id
    }

    /// Function name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters, excluding the receiver.
    #[inline]
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Frame slots the code expects, receiver included.
    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.parameter_count + 1
    }

    /// The code compiled code blocks run.
    #[inline]
    pub fn code(&self) -> &NativeCode {
        &self.code
    }
}

impl fmt::Debug for FunctionExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionExecutable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parameter_count", &self.parameter_count)
            .finish()
    }
}

// =============================================================================
// Scope
// =============================================================================

/// A lexical scope a function is defined in.
#[derive(Debug)]
pub struct Scope {
    name: String,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    /// The outermost scope.
    pub fn global() -> Arc<Self> {
        Arc::new(Self {
            name: "global".into(),
            parent: None,
        })
    }

    /// A scope nested inside this one.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Some(Arc::clone(self)),
        })
    }

    /// Scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enclosing scope.
    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Nesting depth; the global scope is 0.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(scope) = current {
            depth += 1;
            current = scope.parent.as_ref();
        }
        depth
    }
}

// =============================================================================
// Function
// =============================================================================

/// What a function runs.
#[derive(Clone)]
pub enum FunctionKind {
    /// Compiled through the code cache.
    Script(Arc<FunctionExecutable>),
    /// Native code called directly.
    Host(NativeCode),
}

/// A callable function object.
pub struct Function {
    name: String,
    kind: FunctionKind,
    scope: Arc<Scope>,
}

impl Function {
    /// A script function closing over `scope`.
    pub fn new(executable: &Arc<FunctionExecutable>, scope: &Arc<Scope>) -> Arc<Self> {
        Arc::new(Self {
            name: executable.name().to_owned(),
            kind: FunctionKind::Script(Arc::clone(executable)),
            scope: Arc::clone(scope),
        })
    }

    /// A host function.
    pub fn host<F>(name: impl Into<String>, code: F) -> Arc<Self>
    where
        F: Fn(&Engine, &CallFrame<'_>) -> VmResult<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            kind: FunctionKind::Host(Arc::new(code)),
            scope: Scope::global(),
        })
    }

    /// Function name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The function's kind.
    #[inline]
    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    /// True for host functions.
    #[inline]
    pub fn is_host(&self) -> bool {
        matches!(self.kind, FunctionKind::Host(_))
    }

    /// The executable of a script function.
    #[inline]
    pub fn executable(&self) -> Option<&Arc<FunctionExecutable>> {
        match &self.kind {
            FunctionKind::Script(executable) => Some(executable),
            FunctionKind::Host(_) => None,
        }
    }

    /// Defining scope.
    #[inline]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("host", &self.is_host())
            .field("scope", &self.scope.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_ids_are_unique() {
        let a = FunctionExecutable::new("a", 0, |_, _| Ok(Value::Undefined));
        let b = FunctionExecutable::new("b", 2, |_, _| Ok(Value::Undefined));
        assert_ne!(a.id(), b.id());
        assert_eq!(b.parameter_count(), 2);
        assert_eq!(b.num_parameters(), 3);
    }

    #[test]
    fn test_function_kinds() {
        let global = Scope::global();
        let exe = FunctionExecutable::new("f", 1, |_, _| Ok(Value::Null));
        let f = Function::new(&exe, &global);
        assert!(!f.is_host());
        assert_eq!(f.name(), "f");
        assert!(Arc::ptr_eq(f.executable().unwrap(), &exe));

        let h = Function::host("print", |_, _| Ok(Value::Undefined));
        assert!(h.is_host());
        assert!(h.executable().is_none());
    }

    #[test]
    fn test_scope_nesting() {
        let global = Scope::global();
        let outer = global.child("outer");
        let inner = outer.child("inner");
        assert_eq!(global.depth(), 0);
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.parent().map(|s| s.name()), Some("outer"));
    }
}
