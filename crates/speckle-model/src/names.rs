//! Dynamic property naming conventions.
//!
//! | Prefix | Meaning |
//! |---|---|
//! | `__name` | ignored: neither written nor hashed |
//! | `@name` | detached: serialized as its own fragment |
//! | `@(N)name` | detached and chunked into slices of `N` elements |

use speckle_types::wire;

use crate::error::{ModelError, ModelResult};
use crate::schema::FieldRole;

/// Role implied by a dynamic property name.
///
/// A malformed chunk prefix such as `@(x)name` falls back to plain detach;
/// [`validate_dynamic_name`] rejects such names on write.
pub fn role_of(name: &str) -> FieldRole {
    if name.starts_with(wire::IGNORED_PREFIX) {
        return FieldRole::Ignored;
    }
    if let Some((chunk_size, _)) = chunk_prefix(name) {
        return FieldRole::Chunked { chunk_size };
    }
    if name.starts_with(wire::DETACH_PREFIX) {
        return FieldRole::Detached;
    }
    FieldRole::Plain
}

/// Split `@(N)rest` into `(N, rest)`.
pub fn chunk_prefix(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("@(")?;
    let close = rest.find(')')?;
    let size: usize = rest[..close].parse().ok()?;
    if size == 0 {
        return None;
    }
    Some((size, &rest[close + 1..]))
}

/// The name with its detach or chunk prefix removed.
pub fn base_name(name: &str) -> &str {
    if let Some((_, rest)) = chunk_prefix(name) {
        return rest;
    }
    name.strip_prefix(wire::DETACH_PREFIX).unwrap_or(name)
}

/// Check a dynamic property name before it is stored.
pub fn validate_dynamic_name(name: &str) -> ModelResult<()> {
    let invalid = |reason: &str| ModelError::InvalidPropertyName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if wire::is_reserved(name) {
        return Err(ModelError::ReservedName(name.to_string()));
    }
    if name.contains('.') || name.contains('/') {
        return Err(invalid("'.' and '/' are not allowed"));
    }
    if name.starts_with("@@") {
        return Err(invalid("only one leading '@' is allowed"));
    }
    if name.starts_with("@(") {
        match chunk_prefix(name) {
            None => return Err(invalid("chunk prefix must be '@(N)' with N > 0")),
            Some((_, "")) => return Err(invalid("chunked property needs a name after the prefix")),
            Some(_) => {}
        }
    } else if name == "@" {
        return Err(invalid("detached property needs a name after '@'"));
    }
    Ok(())
}
