use std::sync::Arc;

use callprof_protocol::{MethodId, MethodName, SharedStr, THREAD_METHOD_ID};
use serde::{Deserialize, Serialize};

/// Resolves instrumented method ids to their names.
///
/// Implemented by whatever owns the instrumentation state; the engine only
/// reads from it.
pub trait MethodNameResolver: Send + Sync {
    /// One past the highest method id that may resolve.
    fn method_count(&self) -> usize;
    fn resolve(&self, id: MethodId) -> Option<MethodName>;
}

/// Decides whether a class is profiled. Methods of classes that fail it are
/// folded into their caller.
pub trait InstrumentationFilter: Send + Sync {
    fn passes(&self, class_name: &str) -> bool;
}

impl<F> InstrumentationFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn passes(&self, class_name: &str) -> bool {
        self(class_name)
    }
}

/// Dense id-to-name table. Index 0 belongs to the thread pseudo-method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodTable {
    names: Vec<MethodName>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self {
            names: vec![MethodName::owner("<thread>")],
        }
    }

    /// Builds a table from names for ids `1..`. Id 0 is reserved.
    pub fn from_methods(methods: impl IntoIterator<Item = MethodName>) -> Self {
        let mut table = Self::new();
        table.names.extend(methods);
        table
    }

    /// Takes a complete table, including the entry at index 0.
    pub fn from_raw(names: Vec<MethodName>) -> Self {
        if names.is_empty() {
            Self::new()
        } else {
            Self { names }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.len() <= 1
    }

    /// Appends a name and returns its id, or `None` once the id space is full.
    pub fn push(&mut self, name: MethodName) -> Option<MethodId> {
        let id = MethodId::try_from(self.names.len()).ok()?;
        self.names.push(name);
        Some(id)
    }

    /// Stores `name` at `id`, growing the table with placeholders.
    pub fn set(&mut self, id: MethodId, name: MethodName) {
        let idx = usize::from(id);
        if idx >= self.names.len() {
            self.names.resize(idx + 1, MethodName::owner(""));
        }
        self.names[idx] = name;
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodName> {
        self.names.get(usize::from(id))
    }

    pub fn display_name(&self, id: MethodId) -> SharedStr {
        match self.get(id) {
            Some(name) if id != THREAD_METHOD_ID && !name.class.is_empty() => {
                name.display_name().into()
            }
            _ => format!("<unknown #{id}>").into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MethodId, &MethodName)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as MethodId, n))
    }

    pub fn as_slice(&self) -> &[MethodName] {
        &self.names
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodNameResolver for MethodTable {
    fn method_count(&self) -> usize {
        self.names.len()
    }

    fn resolve(&self, id: MethodId) -> Option<MethodName> {
        self.get(id).cloned()
    }
}

/// Maps every method id to the id of its owning class or package in a
/// derived name table.
#[derive(Debug, Clone)]
pub struct OwnerMapping {
    pub names: Arc<MethodTable>,
    pub owner_of: Vec<MethodId>,
    /// Owner used for ids outside `owner_of`.
    pub unknown: MethodId,
}

impl OwnerMapping {
    pub fn by_class(methods: &MethodTable) -> Self {
        Self::build(methods, |m| m.class.to_string())
    }

    pub fn by_package(methods: &MethodTable) -> Self {
        Self::build(methods, |m| m.package().to_string())
    }

    fn build(methods: &MethodTable, key: impl Fn(&MethodName) -> String) -> Self {
        let mut names = MethodTable::new();
        let mut ids = std::collections::HashMap::<String, MethodId>::new();
        let mut owner_of = Vec::with_capacity(methods.len());
        owner_of.push(THREAD_METHOD_ID);

        let mut intern = |owner: String, names: &mut MethodTable| -> MethodId {
            if let Some(&id) = ids.get(&owner) {
                return id;
            }
            let id = names
                .push(MethodName::owner(owner.as_str()))
                .unwrap_or(MethodId::MAX);
            ids.insert(owner, id);
            id
        };

        for (_, method) in methods.iter().skip(1) {
            let owner = if method.class.is_empty() {
                "<unknown>".to_string()
            } else {
                key(method)
            };
            owner_of.push(intern(owner, &mut names));
        }
        let unknown = intern("<unknown>".to_string(), &mut names);

        Self {
            names: Arc::new(names),
            owner_of,
            unknown,
        }
    }

    pub fn owner(&self, method: MethodId) -> MethodId {
        self.owner_of
            .get(usize::from(method))
            .copied()
            .unwrap_or(self.unknown)
    }
}
