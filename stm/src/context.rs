// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// An immutable map of services, keyed by their type. Transactions read it
/// through [`crate::Stm::service`] and scope it with [`crate::Stm::provide_service`].
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a copy of this context with `service` added, replacing any
    /// service of the same type.
    pub fn add<S>(&self, service: S) -> Self
    where
        S: Send + Sync + 'static,
    {
        let mut services = (*self.services).clone();
        services.insert(TypeId::of::<S>(), Arc::new(service));

        Self {
            services: Arc::new(services),
        }
    }

    pub fn get<S>(&self) -> Option<&S>
    where
        S: 'static,
    {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|service| service.downcast_ref::<S>())
    }

    pub fn contains<S>(&self) -> bool
    where
        S: 'static,
    {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Merges `other` into this context. Services of `other` win.
    pub fn merge(&self, other: &Context) -> Self {
        let mut services = (*self.services).clone();
        services.extend(other.services.iter().map(|(k, v)| (*k, v.clone())));

        Self {
            services: Arc::new(services),
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("services", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Context;

    #[derive(Debug, PartialEq)]
    struct Limit(usize);

    #[test]
    fn test_add_and_get() {
        let empty = Context::empty();
        let context = empty.add(Limit(3)).add("name");

        assert!(empty.is_empty());
        assert_eq!(context.get::<Limit>(), Some(&Limit(3)));
        assert_eq!(context.get::<&str>(), Some(&"name"));
        assert!(!context.contains::<u64>());
    }

    #[test]
    fn test_merge_prefers_other() {
        let a = Context::empty().add(Limit(1)).add(5u8);
        let b = Context::empty().add(Limit(2));

        let merged = a.merge(&b);
        assert_eq!(merged.get::<Limit>(), Some(&Limit(2)));
        assert_eq!(merged.get::<u8>(), Some(&5));
        assert_eq!(merged.len(), 2);
    }
}
