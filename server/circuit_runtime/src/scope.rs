use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered at configuration time; runs once per circuit to seed its scope.
pub type ScopedFactory = Arc<dyn Fn(&mut ServiceScope) + Send + Sync>;

/// Scoped state owned by exactly one circuit, keyed by type.
#[derive(Default)]
pub struct ServiceScope {
    values: HashMap<TypeId, Box<dyn Any + Send>>,
    disposed: bool,
}

impl ServiceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn build(factories: &[ScopedFactory]) -> Self {
        let mut scope = Self::new();
        for factory in factories {
            factory(&mut scope);
        }
        scope
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Drops every scoped value. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.values.clear();
    }
}
