//! Typed variable store with copy-on-write scope chains
//!
//! Command templates are declared once against a root scope (e.g. a link
//! line referencing `${LIBS}` and `${LIBPATH}`) and instantiated per job by
//! overriding those variables in the job's local scope. Scopes form a chain:
//! a derived scope defers to its parents until a key is first read or
//! written, at which point the value is captured locally, so mutating a
//! derived scope never affects its parent or siblings.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::BuildError;

/// Extra variables supplied at an expansion call site
pub type VarMap = HashMap<String, Value>;

/// A deferred value: computed lazily at expansion time with access to the
/// current scope and the call-site extras. May itself return a template.
pub type DeferredFn = dyn Fn(&Scope, &VarMap) -> Result<Value> + Send + Sync;

/// A variable value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Deferred(Arc<DeferredFn>),
}

impl Value {
    pub fn str<S: Into<String>>(s: S) -> Self {
        Value::Str(s.into())
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&Scope, &VarMap) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Deferred(Arc::new(f))
    }

    /// Scalar text of an already-expanded value; `None` for lists and
    /// deferred values, which have no single-string rendering.
    fn render(&self) -> Option<String> {
        match self {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::List(_) | Value::Deferred(_) => None,
        }
    }

    /// Flatten an expanded value into plain strings (argv elements)
    ///
    /// Null disappears; a deferred value is a programming error here, since
    /// only already-expanded values may be turned into command lines.
    pub fn try_strings(&self) -> Result<Vec<String>> {
        match self {
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.extend(item.try_strings()?);
                }
                Ok(out)
            }
            Value::Null => Ok(Vec::new()),
            Value::Deferred(_) => {
                Err(BuildError::UnknownVariableType("<deferred>".to_string()).into())
            }
            other => Ok(other.render().into_iter().collect()),
        }
    }

    /// Stable text used when hashing a command identity
    pub(crate) fn canonical_text(&self) -> String {
        match self {
            Value::Null => "~".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::canonical_text).collect();
                format!("[{}]", parts.join("\u{1f}"))
            }
            Value::Deferred(_) => "<deferred>".to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            // Content equality is undecidable for closures; fall back to identity
            (Value::Deferred(a), Value::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

struct ScopeData {
    locals: Mutex<HashMap<String, Value>>,
    parent: Option<Scope>,
}

/// A hierarchical, copy-on-write variable scope
///
/// `Clone` produces another handle to the *same* scope; use [`Scope::derive`]
/// to layer a new scope on top of this one.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeData>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A fresh root scope with no parent
    pub fn new() -> Self {
        Scope {
            inner: Arc::new(ScopeData {
                locals: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// A new scope chained onto this one, optionally merging extra values
    ///
    /// Keys not overridden locally defer to the parent chain; a parent's
    /// value is captured into local storage the first time the key is read
    /// or written after this point.
    pub fn derive(&self, extra: VarMap) -> Scope {
        let child = Scope {
            inner: Arc::new(ScopeData {
                locals: Mutex::new(HashMap::new()),
                parent: Some(self.clone()),
            }),
        };
        child.merge(extra);
        child
    }

    /// Look up a variable, capturing an inherited value locally on first read
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.locals.lock().unwrap().get(name) {
            return Some(value.clone());
        }
        let inherited = self.inner.parent.as_ref()?.lookup(name)?;
        self.inner
            .locals
            .lock()
            .unwrap()
            .insert(name.to_string(), inherited.clone());
        Some(inherited)
    }

    // Chain walk without the copy-on-access capture
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.locals.lock().unwrap().get(name) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref()?.lookup(name)
    }

    /// Set a variable in this scope only; parents and siblings are unaffected
    pub fn set<S: Into<String>, V: Into<Value>>(&self, name: S, value: V) {
        self.inner
            .locals
            .lock()
            .unwrap()
            .insert(name.into(), value.into());
    }

    /// Overwrite several variables at this scope
    pub fn merge(&self, values: VarMap) {
        let mut locals = self.inner.locals.lock().unwrap();
        for (name, value) in values {
            locals.insert(name, value);
        }
    }

    /// Recursively expand a template value against this scope
    ///
    /// Atomic values pass through; lists expand elementwise and flatten one
    /// level; deferred values are invoked and their result re-expanded;
    /// strings substitute the last `${name}` placeholder and recurse on the
    /// prefix. A list-valued variable combines with the surrounding text by
    /// cross-joining, producing one string per element (per prefix element,
    /// if the expanded prefix is itself a list).
    pub fn expand(&self, template: &Value, extra: &VarMap) -> Result<Value> {
        match template {
            Value::Null | Value::Bool(_) => Ok(template.clone()),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.expand(item, extra)? {
                        Value::List(inner) => out.extend(inner),
                        value => out.push(value),
                    }
                }
                Ok(Value::List(out))
            }
            Value::Deferred(f) => {
                let value = f(self, extra)?;
                self.expand(&value, extra)
            }
            Value::Str(s) => self.expand_str(s, extra),
        }
    }

    fn expand_str(&self, s: &str, extra: &VarMap) -> Result<Value> {
        // Last complete `${name}`; an unterminated `${` stays literal and
        // does not shadow complete placeholders before it.
        let mut search_end = s.len();
        let (start, end) = loop {
            let Some(start) = s[..search_end].rfind("${") else {
                return Ok(Value::Str(s.to_string()));
            };
            match s[start..].find('}') {
                Some(close) => break (start, start + close),
                None => search_end = start,
            }
        };
        let name = &s[start + 2..end];
        let suffix = &s[end + 1..];

        // Call-site extras shadow the scope chain; an unbound name expands
        // to the empty string, make-style.
        let bound = match extra.get(name) {
            Some(value) => value.clone(),
            None => self.get(name).unwrap_or(Value::Null),
        };
        let value = self.expand(&bound, extra)?;
        let prefix = self.expand_str(&s[..start], extra)?;

        combine(name, prefix, value, suffix)
    }
}

// Join an expanded prefix, variable value, and verbatim suffix into one
// scalar or a cross-joined list.
fn combine(name: &str, prefix: Value, value: Value, suffix: &str) -> Result<Value> {
    let prefixes: Vec<String> = match prefix {
        Value::List(items) => items
            .iter()
            .map(|item| {
                item.render()
                    .ok_or_else(|| BuildError::UnknownVariableType(name.to_string()))
            })
            .collect::<Result<_, _>>()?,
        scalar => vec![scalar
            .render()
            .ok_or_else(|| BuildError::UnknownVariableType(name.to_string()))?],
    };

    match value {
        Value::List(items) => {
            let mut out = Vec::with_capacity(prefixes.len() * items.len());
            for p in &prefixes {
                for item in &items {
                    let text = item
                        .render()
                        .ok_or_else(|| BuildError::UnknownVariableType(name.to_string()))?;
                    out.push(Value::Str(format!("{p}{text}{suffix}")));
                }
            }
            Ok(Value::List(out))
        }
        scalar => {
            let text = scalar
                .render()
                .ok_or_else(|| BuildError::UnknownVariableType(name.to_string()))?;
            if prefixes.len() == 1 {
                Ok(Value::Str(format!("{}{text}{suffix}", prefixes[0])))
            } else {
                Ok(Value::List(
                    prefixes
                        .iter()
                        .map(|p| Value::Str(format!("{p}{text}{suffix}")))
                        .collect(),
                ))
            }
        }
    }
}
