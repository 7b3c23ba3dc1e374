//! Per-property authorization
//!
//! Every property a query touches is checked along with its ancestors, and
//! for containers, all of its descendants. Filtering on a property readable
//! only at an elevated grant raises the level the whole query runs at, so
//! the result set cannot reveal what the caller could not read directly.

use crate::schema::{AccessLevel, Property, PropertyType, ResolvedProperty};

use super::chain::Chain;
use super::context::CompileContext;
use super::errors::{QueryError, QueryResult};
use super::rules::validate_field_path;

/// Which checks `process_property` applies
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyChecks {
    /// Trusted stages bypass ACL evaluation entirely
    pub skip_acl: bool,
    pub skip_index_check: bool,
    /// Check only the property and its ancestors, not its descendants
    pub skip_child_processing: bool,
    pub allow_custom_readers: bool,
    pub require_array: bool,
    pub no_array_parents: bool,
}

impl PropertyChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trusted(mut self, skip_acl: bool) -> Self {
        self.skip_acl = skip_acl;
        self
    }

    pub fn skip_index_check(mut self) -> Self {
        self.skip_index_check = true;
        self
    }

    pub fn skip_children(mut self) -> Self {
        self.skip_child_processing = true;
        self
    }

    pub fn require_array(mut self) -> Self {
        self.require_array = true;
        self
    }

    pub fn no_array_parents(mut self) -> Self {
        self.no_array_parents = true;
        self
    }
}

impl CompileContext {
    /// Resolves `path` relative to the nearest property on the chain and
    /// authorizes every candidate.
    pub fn process_property(
        &mut self,
        path: &str,
        chain: &Chain,
        checks: PropertyChecks,
    ) -> QueryResult<Vec<ResolvedProperty>> {
        validate_field_path(path, chain)?;

        let parent = chain.last_property(&[]).cloned();
        let candidates = self.resolve(path, parent.as_ref());
        if candidates.is_empty() {
            return Err(QueryError::property_not_found().at(chain.to_string()));
        }

        for candidate in &candidates {
            // references never expose their children to a query
            let skip_children = checks.skip_child_processing
                || candidate.type_name() == PropertyType::Reference;

            for ancestor in candidate.parents() {
                self.check_property_access(chain, ancestor, false, checks)?;
            }
            if skip_children {
                self.check_property_access(chain, candidate.property(), checks.allow_custom_readers, checks)?;
            } else {
                let mut nodes = Vec::new();
                candidate.property().walk(&mut |p| nodes.push(p));
                for node in nodes {
                    let allow = std::ptr::eq(node, candidate.property()) && checks.allow_custom_readers;
                    self.check_property_access(chain, node, allow, checks)?;
                }
            }

            // containers defer the index requirement to their children
            if !checks.skip_index_check && !self.options().ignores_indexes() {
                let property = candidate.property();
                if !(property.indexed || property.native_index) && !property.property_type.is_container() {
                    return Err(QueryError::invalid_argument("Property is not indexed.").at(path));
                }
            }

            if checks.require_array && !self.is_array(candidate) {
                return Err(QueryError::invalid_argument(format!(
                    "Property must be an array ({}).",
                    path
                ))
                .at(chain.to_string()));
            }

            if checks.no_array_parents
                && candidate.parents().iter().any(|p| self.is_array_property(p))
            {
                return Err(QueryError::invalid_argument(
                    "Operation not available for properties with array parents.",
                )
                .at(path));
            }
        }

        Ok(candidates)
    }

    /// Candidates of an ambiguous path must agree on type and array-ness
    pub fn assert_properties_match(&self, candidates: &[ResolvedProperty]) -> QueryResult<ResolvedProperty> {
        let first = candidates
            .first()
            .ok_or_else(QueryError::property_not_found)?;
        let array = self.is_array(first);
        for other in &candidates[1..] {
            if self.is_array(other) != array || other.type_name() != first.type_name() {
                return Err(QueryError::unsupported(
                    "Similarly named properties in disparate types must be of the same type.",
                )
                .at(first.full_path()));
            }
        }
        Ok(first.clone())
    }

    /// Group and sort references must resolve to exactly one stored field
    pub fn single_property(&self, candidates: &[ResolvedProperty]) -> QueryResult<ResolvedProperty> {
        match candidates {
            [only] => Ok(only.clone()),
            [] => Err(QueryError::property_not_found()),
            [first, ..] => Err(QueryError::unsupported(
                "Ambiguously named property cannot be processed across types.",
            )
            .at(first.full_path())),
        }
    }

    fn check_property_access(
        &mut self,
        chain: &Chain,
        property: &Property,
        allow_custom_readers: bool,
        checks: PropertyChecks,
    ) -> QueryResult<()> {
        if !property.readable {
            return Err(QueryError::property_not_found().at(chain.to_string()));
        }

        if checks.skip_acl {
            return Ok(());
        }

        // hidden before any ACL evaluation so a refusal cannot confirm existence
        if property.read_access == AccessLevel::System && !self.options().allow_system_access {
            return Err(QueryError::property_not_found().at(property.full_path()));
        }

        let opts = self.options();
        if opts.strict
            && !allow_custom_readers
            && (property.custom_reader || property.is_virtual)
            && !property.native_index
            && !opts.ignores_indexes()
        {
            return Err(QueryError::invalid_argument("Property is not available for operation.")
                .at(property.full_path()));
        }

        if property.acl.iter().any(|entry| !entry.is_targeted()) {
            return Err(QueryError::unsupported(
                "Operation is not available for properties with custom non-targeted acl entries.",
            )
            .at(property.full_path()));
        }

        if property.acl.is_empty() {
            self.bump_access_level(property.read_access);
        } else if !self.ac().has_read_access(property) {
            return Err(QueryError::access_denied("Cannot perform operation on non-accessible property.")
                .at(property.full_path()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::parser::errors::QueryErrorKind;
    use crate::parser::options::ParserOptions;
    use crate::schema::{AccessContext, AclEntry, IndexSlot, Model, Principal};

    fn model() -> Arc<Model> {
        Arc::new(
            Model::new(
                "c_account",
                "contexts",
                vec![
                    Property::new("c_email", PropertyType::String)
                        .indexed(1)
                        .with_read_access(AccessLevel::Update),
                    Property::new("c_secret", PropertyType::String).indexed(2).unreadable(),
                    Property::new("c_internal", PropertyType::String)
                        .indexed(3)
                        .with_read_access(AccessLevel::System),
                    Property::new("c_notes", PropertyType::String).indexed(4).with_acl(vec![
                        AclEntry::role("auditor", AccessLevel::Read),
                    ])
                    .with_read_access(AccessLevel::Delete),
                    Property::new("c_mine", PropertyType::String)
                        .indexed(5)
                        .with_acl(vec![AclEntry::owner(AccessLevel::Read)]),
                    Property::new("c_plain", PropertyType::String),
                    Property::new("c_profile", PropertyType::Document).with_properties(vec![
                        Property::new("c_age", PropertyType::Number)
                            .indexed(6)
                            .with_read_access(AccessLevel::Share),
                    ]),
                ],
                (1..=6).map(|i| IndexSlot::new(i, format!("s{}", i))).collect(),
            )
            .unwrap(),
        )
    }

    fn context(principal: Principal) -> CompileContext {
        CompileContext::new(
            vec![model()],
            AccessContext::new(principal, AccessLevel::Read),
            ParserOptions::default(),
        )
    }

    fn kind(cx: &mut CompileContext, path: &str) -> QueryErrorKind {
        cx.process_property(path, &Chain::new(), PropertyChecks::new())
            .unwrap_err()
            .kind()
    }

    #[test]
    fn test_empty_acl_bumps_access_level() {
        let mut cx = context(Principal::anonymous());
        cx.process_property("c_email", &Chain::new(), PropertyChecks::new())
            .unwrap();
        assert_eq!(cx.access_level(), AccessLevel::Update);
    }

    #[test]
    fn test_container_walks_children() {
        let mut cx = context(Principal::anonymous());
        cx.process_property("c_profile", &Chain::new(), PropertyChecks::new())
            .unwrap();
        assert_eq!(cx.access_level(), AccessLevel::Share);
    }

    #[test]
    fn test_hidden_properties_are_not_found() {
        let mut cx = context(Principal::anonymous());
        assert_eq!(kind(&mut cx, "c_secret"), QueryErrorKind::NotFound);
        assert_eq!(kind(&mut cx, "c_internal"), QueryErrorKind::NotFound);
        assert_eq!(kind(&mut cx, "c_missing"), QueryErrorKind::NotFound);
    }

    #[test]
    fn test_explicit_acl_refusal_is_access_denied() {
        let mut cx = context(Principal::anonymous());
        assert_eq!(kind(&mut cx, "c_notes"), QueryErrorKind::AccessDenied);

        let mut auditor = context(Principal::anonymous().with_role("auditor"));
        assert_eq!(kind(&mut auditor, "c_notes"), QueryErrorKind::AccessDenied);
    }

    #[test]
    fn test_non_targeted_acl_is_unsupported() {
        let mut cx = context(Principal::anonymous());
        assert_eq!(kind(&mut cx, "c_mine"), QueryErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_unindexed_property_rejected() {
        let mut cx = context(Principal::anonymous());
        let err = cx
            .process_property("c_plain", &Chain::new(), PropertyChecks::new())
            .unwrap_err();
        assert_eq!(err.message(), "Property is not indexed.");

        assert!(cx
            .process_property("c_plain", &Chain::new(), PropertyChecks::new().skip_index_check())
            .is_ok());
    }

    #[test]
    fn test_trusted_checks_skip_acl() {
        let mut cx = context(Principal::anonymous());
        cx.process_property("c_notes", &Chain::new(), PropertyChecks::new().trusted(true))
            .unwrap();
        assert_eq!(cx.access_level(), AccessLevel::None);
    }
}
