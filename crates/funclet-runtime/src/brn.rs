//! Function names and BRN resource names.
//!
//! A function is addressed by a bare name (`thumbnail`), by
//! `name:qualifier`, or by a full resource name
//! `brn:<service>:<region>:<uid>:function:<name>[:<qualifier>]`. A
//! qualifier that is `$LATEST` or all digits selects a version; anything
//! else is an alias.

use funclet_common::error::{FuncletError, Result};
use serde::{Deserialize, Serialize};

/// Version qualifier addressing the unpublished head of a function.
pub const LATEST: &str = "$LATEST";

const BRN_PREFIX: &str = "brn";
const FUNCTION_RESOURCE: &str = "function";
const MAX_NAME_LEN: usize = 64;
const MAX_ALIAS_LEN: usize = 128;

/// A parsed function reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Bare function name.
    pub thumbnail: String,
    /// Version qualifier, empty if none.
    pub version: String,
    /// Alias qualifier, empty if none.
    pub alias: String,
}

/// Splits a function name into thumbnail, version and alias.
///
/// # Errors
///
/// Returns `FuncletError::InvalidFunctionName` if the name is malformed or
/// a full resource name belongs to a different user than `uid`.
pub fn deal_fname(uid: &str, fname: &str) -> Result<FunctionRef> {
    let invalid = || FuncletError::InvalidFunctionName { name: fname.to_string() };
    let parts: Vec<&str> = fname.split(':').collect();

    let (name, qualifier) = match parts.as_slice() {
        [name] => (*name, None),
        [name, qualifier] => (*name, Some(*qualifier)),
        [BRN_PREFIX, _service, _region, owner, FUNCTION_RESOURCE, name, rest @ ..] if rest.len() <= 1 => {
            if *owner != uid {
                return Err(invalid());
            }
            (*name, rest.first().copied())
        }
        _ => return Err(invalid()),
    };

    if !valid_name(name) {
        return Err(invalid());
    }
    let mut parsed = FunctionRef {
        thumbnail: name.to_string(),
        ..FunctionRef::default()
    };
    match qualifier {
        None => {}
        Some(q) if is_version(q) => parsed.version = q.to_string(),
        Some(q) if valid_alias(q) => parsed.alias = q.to_string(),
        Some(_) => return Err(invalid()),
    }
    Ok(parsed)
}

fn is_version(qualifier: &str) -> bool {
    qualifier == LATEST || (!qualifier.is_empty() && qualifier.bytes().all(|b| b.is_ascii_digit()))
}

fn valid_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && name.bytes().next().is_some_and(|b| b.is_ascii_alphabetic())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(r: &FunctionRef) -> (&str, &str, &str) {
        (&r.thumbnail, &r.version, &r.alias)
    }

    #[test]
    fn bare_name_has_no_qualifier() {
        let r = deal_fname("u1", "function-name").unwrap();
        assert_eq!(parts(&r), ("function-name", "", ""));
    }

    #[test]
    fn qualifier_is_version_or_alias() {
        assert_eq!(parts(&deal_fname("u1", "f:3").unwrap()), ("f", "3", ""));
        assert_eq!(parts(&deal_fname("u1", "f:$LATEST").unwrap()), ("f", "$LATEST", ""));
        assert_eq!(parts(&deal_fname("u1", "f:prod").unwrap()), ("f", "", "prod"));
    }

    #[test]
    fn full_resource_name() {
        let r = deal_fname("u1", "brn:cfc:bj:u1:function:resize_img:7").unwrap();
        assert_eq!(parts(&r), ("resize_img", "7", ""));
        let r = deal_fname("u1", "brn:cfc:bj:u1:function:resize_img").unwrap();
        assert_eq!(parts(&r), ("resize_img", "", ""));
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let err = deal_fname("u1", "brn:cfc:bj:u2:function:f").unwrap_err();
        assert!(matches!(err, FuncletError::InvalidFunctionName { .. }));
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in ["", "9lives", "a b", "f:", "f:a b", "a:b:c", "brn:cfc:bj:u1:layer:f"] {
            assert!(deal_fname("u1", bad).is_err(), "{bad:?} accepted");
        }
        assert!(deal_fname("u1", &"x".repeat(65)).is_err());
    }
}
