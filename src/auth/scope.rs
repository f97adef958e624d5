use std::collections::BTreeSet;

/// `<resourceType>:<resourceName>:<action>[,<action>...]`, merged across concurrent
/// operations on the same `(resourceType, resourceName)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Scope {
    pub resource_type: String,
    pub resource_name: String,
    actions: BTreeSet<String>,
}

const WILDCARD: &str = "*";

impl Scope {
    pub fn new(resource_type: impl Into<String>, resource_name: impl Into<String>, actions: &[&str]) -> Self {
        Scope {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            actions: actions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let resource_type = parts.next()?.to_string();
        let resource_name = parts.next()?.to_string();
        let actions = parts.next()?.split(',').map(|s| s.to_string()).collect();
        Some(Scope {
            resource_type,
            resource_name,
            actions,
        })
    }

    pub fn key(&self) -> (String, String) {
        (self.resource_type.clone(), self.resource_name.clone())
    }

    /// Merging with `*` collapses the action set to `{*}`; otherwise actions accumulate
    /// as a sorted union.
    pub fn merge(&mut self, other: &Scope) {
        if self.actions.contains(WILDCARD) {
            return;
        }
        if other.actions.contains(WILDCARD) {
            self.actions.clear();
            self.actions.insert(WILDCARD.to_string());
            return;
        }
        self.actions.extend(other.actions.iter().cloned());
    }

    /// Stable serialisation: `*` alone, or the sorted, comma-joined action list.
    pub fn actions_serialized(&self) -> String {
        if self.actions.contains(WILDCARD) {
            WILDCARD.to_string()
        } else {
            self.actions.iter().cloned().collect::<Vec<_>>().join(",")
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            self.actions_serialized()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_serializes() {
        let s = Scope::parse("repository:samalba/my-app:pull,push").unwrap();
        assert_eq!(s.resource_type, "repository");
        assert_eq!(s.resource_name, "samalba/my-app");
        assert_eq!(s.actions_serialized(), "pull,push");
    }

    #[test]
    fn merge_is_commutative_union() {
        let mut a = Scope::new("repository", "r", &["pull"]);
        let b = Scope::new("repository", "r", &["push"]);
        a.merge(&b);
        assert_eq!(a.actions_serialized(), "pull,push");

        let mut a2 = Scope::new("repository", "r", &["push"]);
        let b2 = Scope::new("repository", "r", &["pull"]);
        a2.merge(&b2);
        assert_eq!(a2.actions_serialized(), "pull,push");
    }

    #[test]
    fn merge_with_wildcard_collapses() {
        let mut a = Scope::new("repository", "r", &["pull", "push"]);
        let star = Scope::new("repository", "r", &["*"]);
        a.merge(&star);
        assert_eq!(a.actions_serialized(), "*");
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = Scope::new("repository", "r", &["pull"]);
        let b = a.clone();
        a.merge(&b);
        assert_eq!(a.actions_serialized(), "pull");
    }
}
