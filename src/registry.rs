use super::ast::Prototype;
use std::collections::HashMap;
use tracing::{trace, warn};

/// Session-wide table of the most recent prototype seen for each function
/// name, from either a `def` or an `extern`.
#[derive(Debug, Default)]
pub(crate) struct PrototypeRegistry {
    protos: HashMap<String, Prototype>,
}

impl PrototypeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Prototype> {
        self.protos.get(name)
    }

    /// Registers `proto`, silently replacing an older entry of the same name.
    /// Returns the replaced entry so a failed definition can put it back.
    pub(crate) fn insert(&mut self, proto: Prototype) -> Option<Prototype> {
        let previous = self.protos.insert(proto.name.clone(), proto);
        if let Some(old) = &previous {
            let new = &self.protos[&old.name];
            if old.arity() != new.arity() {
                warn!(
                    name = %old.name,
                    old = old.arity(),
                    new = new.arity(),
                    "function redeclared with a different number of parameters"
                );
            }
        }
        trace!(registered = self.protos.len(), "prototype registry updated");
        previous
    }

    /// Undoes an `insert` of `name`, given what that insert returned.
    pub(crate) fn restore(&mut self, name: &str, previous: Option<Prototype>) {
        match previous {
            Some(proto) => {
                self.protos.insert(name.to_owned(), proto);
            }
            None => {
                self.protos.remove(name);
            }
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Prototype> {
        self.protos.remove(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn proto(name: &str, params: &[&str]) -> Prototype {
        Prototype::new(name, params.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn test_latest_wins() {
        let mut r = PrototypeRegistry::new();
        assert_eq!(r.insert(proto("k", &[])), None);
        assert_eq!(r.insert(proto("k", &[])), Some(proto("k", &[])));
        assert!(r.get("k").is_some());
    }

    #[test]
    fn test_redeclaration_with_different_arity_is_permitted() {
        let mut r = PrototypeRegistry::new();
        r.insert(proto("g", &["x"]));
        r.insert(proto("g", &["a", "b"]));
        assert_eq!(r.get("g").map(Prototype::arity), Some(2));
    }

    #[test]
    fn test_restore() {
        let mut r = PrototypeRegistry::new();
        r.insert(proto("f", &["x"]));
        let previous = r.insert(proto("f", &["x", "y"]));
        r.restore("f", previous);
        assert_eq!(r.get("f"), Some(&proto("f", &["x"])));

        let previous = r.insert(proto("h", &[]));
        r.restore("h", previous);
        assert!(r.get("h").is_none());
    }
}
