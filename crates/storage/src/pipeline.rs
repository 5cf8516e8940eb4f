//! In-memory evaluation of compiled stage lists.
//!
//! This interpreter backs [`InMemoryRepository`](crate::repository::InMemoryRepository)
//! and mirrors the semantics the SQLite renderer produces: a field that has
//! no value on a node fails every condition placed on it (the SQL `NULL`
//! behavior), an empty membership list matches nothing, and skip/limit are
//! applied in stage order so the cumulative-limit pagination comes out the
//! same on both executors.

use std::cmp::Ordering;

use coach_core::model::ContentNode;
use coach_core::query::{Expr, FilterValue, MatchSpec, Scalar, SortSpec, Stage, fields};

use crate::repository::StorageError;

/// Reads the scalar value of a named field off a node.
///
/// `Ok(None)` means the field exists in the schema but has no value on this
/// node; an unknown field name is an error, matching the SQLite column
/// whitelist.
fn field_scalar(node: &ContentNode, field: &str) -> Result<Option<Scalar>, StorageError> {
    Ok(match field {
        fields::ID => Some(Scalar::from(&node.id)),
        fields::KIND => Some(Scalar::Str(node.kind.as_str().to_owned())),
        fields::NAME => Some(Scalar::Str(node.name.clone())),
        fields::PARENT_ID => node.parent_id.as_ref().map(Scalar::from),
        fields::ORDER => Some(Scalar::Int(node.order)),
        fields::CREATED_BY => Some(Scalar::from(&node.created_by)),
        fields::SHARE_WITH => Some(Scalar::Str(node.share_with.as_str().to_owned())),
        fields::IS_PUBLIC => Some(Scalar::Bool(node.is_public)),
        fields::IS_DELETED => Some(Scalar::Bool(node.is_deleted)),
        fields::DELETED_AT => node.deleted_at.map(Scalar::Time),
        fields::CREATED_AT => Some(Scalar::Time(node.created_at)),
        fields::VERSION => node.version.map(Scalar::Int),
        fields::IS_OLD_VERSION => Some(Scalar::Bool(node.is_old_version)),
        fields::PARENT_PROGRAM_ID => node.parent_program_id.as_ref().map(Scalar::from),
        fields::LIB_PROGRAM_ID => node.lib_program_id.as_ref().map(Scalar::from),
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown field: {other}"
            )));
        }
    })
}

fn scalar_cmp(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a, b) {
        (Scalar::Str(x), Scalar::Str(y)) => Some(x.cmp(y)),
        (Scalar::Int(x), Scalar::Int(y)) => Some(x.cmp(y)),
        (Scalar::Bool(x), Scalar::Bool(y)) => Some(x.cmp(y)),
        (Scalar::Time(x), Scalar::Time(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn eval_expr(value: &Scalar, expr: &Expr) -> bool {
    match expr {
        Expr::Gt(rhs) => scalar_cmp(value, rhs) == Some(Ordering::Greater),
        Expr::Gte(rhs) => {
            matches!(scalar_cmp(value, rhs), Some(Ordering::Greater | Ordering::Equal))
        }
        Expr::Lt(rhs) => scalar_cmp(value, rhs) == Some(Ordering::Less),
        Expr::Lte(rhs) => {
            matches!(scalar_cmp(value, rhs), Some(Ordering::Less | Ordering::Equal))
        }
        Expr::Ne(rhs) => scalar_cmp(value, rhs).is_some_and(|ord| ord != Ordering::Equal),
    }
}

fn condition_holds(
    node: &ContentNode,
    field: &str,
    condition: &FilterValue,
) -> Result<bool, StorageError> {
    let Some(value) = field_scalar(node, field)? else {
        // A valueless field never satisfies a condition, including Ne.
        return Ok(false);
    };
    Ok(match condition {
        FilterValue::Eq(expected) => value == *expected,
        FilterValue::In(set) => set.contains(&value),
        FilterValue::Raw(expr) => eval_expr(&value, expr),
        FilterValue::Absent => true,
    })
}

/// Evaluates a match specification against one node.
///
/// # Errors
///
/// Returns `StorageError::Serialization` for unknown field names.
pub(crate) fn eval_match(node: &ContentNode, spec: &MatchSpec) -> Result<bool, StorageError> {
    for (field, condition) in spec.conditions() {
        if !condition_holds(node, field, condition)? {
            return Ok(false);
        }
    }
    let mut any_present = false;
    for (field, condition) in spec.any_conditions() {
        any_present = true;
        if condition_holds(node, field, condition)? {
            return Ok(true);
        }
    }
    Ok(!any_present)
}

fn sort_nodes(nodes: &mut [ContentNode], sort: &SortSpec) -> Result<(), StorageError> {
    // Pre-check the field name so sort_by can stay infallible.
    let (field, descending) = match sort {
        SortSpec::Asc(field) => (field.as_str(), false),
        SortSpec::Desc(field) => (field.as_str(), true),
        // No text index here; fall back to a deterministic id order.
        SortSpec::Relevance => (fields::ID, false),
    };
    if !nodes.is_empty() {
        field_scalar(&nodes[0], field)?;
    }
    nodes.sort_by(|a, b| {
        let ka = field_scalar(a, field).ok().flatten();
        let kb = field_scalar(b, field).ok().flatten();
        let primary = match (ka, kb) {
            (Some(x), Some(y)) => scalar_cmp(&x, &y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let primary = if descending { primary.reverse() } else { primary };
        primary.then_with(|| a.id.cmp(&b.id))
    });
    Ok(())
}

/// Runs a compiled stage list over a node snapshot, in stage order.
///
/// # Errors
///
/// Returns `StorageError::Serialization` for unknown field names.
pub(crate) fn apply_stages(
    mut nodes: Vec<ContentNode>,
    stages: &[Stage],
) -> Result<Vec<ContentNode>, StorageError> {
    for stage in stages {
        match stage {
            Stage::Match(spec) => {
                let mut kept = Vec::with_capacity(nodes.len());
                for node in nodes {
                    if eval_match(&node, spec)? {
                        kept.push(node);
                    }
                }
                nodes = kept;
            }
            Stage::Sort(sort) => sort_nodes(&mut nodes, sort)?,
            Stage::Skip(n) => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX);
                if n >= nodes.len() {
                    nodes.clear();
                } else {
                    nodes.drain(..n);
                }
            }
            Stage::Limit(n) => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX);
                nodes.truncate(n);
            }
            // Rows are materialized as full nodes; the projection carries no
            // information the caller cannot ignore.
            Stage::Project(_) => {}
        }
    }
    Ok(nodes)
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
