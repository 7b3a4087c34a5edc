//! RBAC policy engine.
//!
//! A decision is a triple (subject, object, action):
//! - subject: `key:<id>`, `user:<id>`, `team:<id>`, `org:<id>`, `role:<name>`
//! - object: an HTTP path (optionally with a trailing `*`), a typed
//!   resource like `model:<name>`, or `*`
//! - action: an upper-cased HTTP method, the synthetic `use` verb, or `*`
//!
//! Subjects inherit policies through `g(child, parent)` grouping edges:
//! a policy attached to any ancestor applies to all descendants. The policy
//! set is additive and union-positive — a request is authorized iff at
//! least one matching policy exists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

/// Routes whose POST bodies carry a `model` field subject to the
/// model-access sub-check.
pub const MODEL_INVOCATION_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/embeddings",
];

/// Synthetic action for model invocation.
pub const ACTION_USE: &str = "use";

pub const WILDCARD: &str = "*";

#[derive(Default)]
struct EnforcerInner {
    /// (subject, object, action) triples.
    policies: HashSet<(String, String, String)>,
    /// child subject → parent subjects.
    parents: HashMap<String, HashSet<String>>,
}

/// The policy store and evaluator. Cheap to share behind an `Arc`; reads
/// take the read lock, mutations the write lock.
pub struct Enforcer {
    inner: RwLock<EnforcerInner>,
}

impl Default for Enforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl Enforcer {
    /// Create an enforcer pre-seeded with the default role policies.
    pub fn new() -> Self {
        let enforcer = Enforcer {
            inner: RwLock::new(EnforcerInner::default()),
        };
        enforcer.seed_default_policies();
        enforcer
    }

    fn seed_default_policies(&self) {
        let defaults: &[(&str, &str, &str)] = &[
            ("role:proxy_admin", "*", "*"),
            ("role:proxy_admin_viewer", "*", "GET"),
            ("role:proxy_admin_viewer", "*", "HEAD"),
            ("role:management", "*", "*"),
            ("role:read_only", "/v1/models", "GET"),
            ("role:read_only", "/v1/models", "HEAD"),
            ("role:llm_api", "/v1/chat/completions", "POST"),
            ("role:llm_api", "/v1/completions", "POST"),
            ("role:llm_api", "/v1/embeddings", "POST"),
            ("role:llm_api", "/embeddings", "POST"),
        ];
        // Lock cannot be poisoned here: we hold the only reference.
        let mut inner = self.inner.write().expect("fresh enforcer lock");
        for (sub, obj, act) in defaults {
            inner
                .policies
                .insert((sub.to_string(), obj.to_string(), act.to_string()));
        }
    }

    /// Add `p(sub, obj, act)`. Idempotent.
    pub fn add_policy(&self, sub: &str, obj: &str, act: &str) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("policy engine lock poisoned"))?;
        inner
            .policies
            .insert((sub.to_string(), obj.to_string(), act.to_string()));
        Ok(())
    }

    /// Add the grouping edge `g(child, parent)`. Idempotent.
    pub fn add_grouping(&self, child: &str, parent: &str) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("policy engine lock poisoned"))?;
        inner
            .parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
        Ok(())
    }

    /// Replace the subject's model-invocation policies with one per allowed
    /// model. An empty set grants the `model:*` wildcard.
    pub fn sync_model_policies(&self, sub: &str, allowed_models: &[String]) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("policy engine lock poisoned"))?;
        inner
            .policies
            .retain(|(s, o, a)| !(s == sub && a == ACTION_USE && o.starts_with("model:")));
        if allowed_models.is_empty() {
            inner
                .policies
                .insert((sub.to_string(), "model:*".to_string(), ACTION_USE.to_string()));
        } else {
            for model in allowed_models {
                inner.policies.insert((
                    sub.to_string(),
                    format!("model:{}", model),
                    ACTION_USE.to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Authorize `r(sub, obj, act)`. Errors are engine failures (surface as
    /// 500); `Ok(false)` is a policy denial (403).
    pub fn enforce(&self, sub: &str, obj: &str, act: &str) -> anyhow::Result<bool> {
        let inner = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("policy engine lock poisoned"))?;

        // All subjects the request subject belongs to, including itself.
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(sub.to_string());
        queue.push_back(sub.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(parents) = inner.parents.get(&current) {
                for parent in parents {
                    if reachable.insert(parent.clone()) {
                        queue.push_back(parent.clone());
                    }
                }
            }
        }

        Ok(inner.policies.iter().any(|(psub, pobj, pact)| {
            reachable.contains(psub) && object_matches(pobj, obj) && action_matches(pact, act)
        }))
    }
}

/// Object match: equal, wildcard, or trailing-`*` glob. A `*` terminates
/// the pattern and matches any suffix; otherwise comparison is literal.
fn object_matches(pattern: &str, object: &str) -> bool {
    if pattern == WILDCARD || pattern == object {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => object.starts_with(prefix),
        None => false,
    }
}

fn action_matches(pattern: &str, action: &str) -> bool {
    pattern == WILDCARD || pattern == action
}

/// Whether a (path, method) pair is a model-invocation request that needs
/// the model-access sub-check.
pub fn is_model_invocation(path: &str, method: &str) -> bool {
    method == "POST" && MODEL_INVOCATION_ROUTES.contains(&path)
}

// ── Tests ───────────────────────────────────────────────────────
