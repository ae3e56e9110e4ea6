//! Registration owners
//!
//! A [`ModuleToken`] tags every listener or handler a dynamically loaded
//! extension registers. Unloading the extension revokes everything tagged with
//! its token in one call.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque owner of a group of registrations.
///
/// Tokens compare by identity: two tokens created with the same name are still
/// different owners.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ModuleToken {
    id: u64,
    name: Arc<str>,
}

impl ModuleToken {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ModuleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleToken")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ModuleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_with_same_name_are_distinct() {
        let a = ModuleToken::new("bridge");
        let b = ModuleToken::new("bridge");
        assert_ne!(a, b);
        assert_eq!(a.name(), b.name());
        assert_eq!(a.clone(), a);
    }
}
