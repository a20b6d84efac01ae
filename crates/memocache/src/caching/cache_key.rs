use std::cmp::Ordering;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::CacheError;

/// Turns call arguments into an `args_id`, see [`resolve_key`].
pub type HashFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Identifies a single cache entry: `(prefix, function_id, args_id)`.
///
/// The storage key is formed as `prefix:function_id:args_id`, or `function_id:args_id` if no
/// prefix is used. The same key is used to deduplicate background refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefix: Option<Arc<str>>,
    function_id: Arc<str>,
    args_id: Arc<str>,
}

impl CacheKey {
    pub fn new(prefix: Option<Arc<str>>, function_id: Arc<str>, args_id: impl Into<Arc<str>>) -> Self {
        Self {
            prefix,
            function_id,
            args_id: args_id.into(),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn args_id(&self) -> &str {
        &self.args_id
    }

    /// Returns the full key under which the entry is stored.
    pub fn storage_key(&self) -> String {
        storage_key(self.prefix(), &self.function_id, &self.args_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = self.prefix() {
            write!(f, "{prefix}:")?;
        }
        write!(f, "{}:{}", self.function_id, self.args_id)
    }
}

/// Joins the parts of a cache key into the key used by storage backends.
pub fn storage_key(prefix: Option<&str>, function_id: &str, args_id: &str) -> String {
    let mut key = function_prefix(prefix, function_id);
    key.push_str(args_id);
    key
}

/// The common key prefix of all entries of one function, including the trailing separator.
///
/// The separator makes sure that clearing `fn1` does not also clear `fn10`.
pub fn function_prefix(prefix: Option<&str>, function_id: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{function_id}:"),
        None => format!("{function_id}:"),
    }
}

/// The common key prefix of all entries in a namespace, including the trailing separator.
pub fn namespace_prefix(prefix: &str) -> String {
    format!("{prefix}:")
}

/// Hashes call arguments into a stable `args_id`.
///
/// Objects are hashed independently of the order their fields were inserted in, see
/// [`canonicalize`].
pub fn resolve_key(args: &Value) -> String {
    let canonical = canonicalize(args);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Converts the arguments into JSON and hashes them with `hash`.
pub fn resolve_args<A, H>(args: &A, hash: H) -> Result<String, CacheError>
where
    A: Serialize + ?Sized,
    H: FnOnce(&Value) -> String,
{
    let value = serde_json::to_value(args)
        .map_err(|err| CacheError::KeyResolution(err.to_string()))?;
    Ok(hash(&value))
}

/// Serializes a JSON value into its canonical form.
///
/// The fields of every object, at any depth, are ordered by their case-folded name, with the
/// original name as tie breaker. Arrays keep their order.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|(a, _), (b, _)| compare_field_names(a, b));

            out.push('{');
            for (idx, (name, item)) in fields.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                // `Display` for `Value` emits compact JSON, writing into a `String` does not fail
                let _ = write!(out, "{}:", Value::from(name.as_str()));
                write_canonical(out, item);
            }
            out.push('}');
        }
        primitive => {
            let _ = write!(out, "{primitive}");
        }
    }
}

fn compare_field_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
