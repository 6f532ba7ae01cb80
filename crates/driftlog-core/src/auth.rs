//! Access control for log operations.
//!
//! A deliberately small deny-by-default ACL table: each subject is granted
//! `(object, action)` pairs, with `*` matching any object. The server
//! consults [`Authorizer::authorize`] before every operation.

use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Grants an action on every object.
pub const OBJECT_WILDCARD: &str = "*";

pub const PRODUCE_ACTION: &str = "produce";
pub const CONSUME_ACTION: &str = "consume";

#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    acls: HashMap<String, HashSet<(String, String)>>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `subject` permission to perform `action` on `object`.
    pub fn allow(
        mut self,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.acls
            .entry(subject.into())
            .or_default()
            .insert((object.into(), action.into()));
        self
    }

    /// Check whether `subject` may perform `action` on `object`.
    /// Unknown subjects are denied.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<()> {
        let allowed = self.acls.get(subject).is_some_and(|grants| {
            grants.contains(&(object.to_string(), action.to_string()))
                || grants.contains(&(OBJECT_WILDCARD.to_string(), action.to_string()))
        });

        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                subject: subject.to_string(),
                action: action.to_string(),
                object: object.to_string(),
            })
        }
    }
}
