//! Rendering of compiled stage lists into SQL fragments with bound values.
//!
//! Field names are whitelisted against the known columns; anything else is
//! a `Serialization` error rather than a string spliced into SQL. Values
//! are always carried as positional binds.

use coach_core::query::{Expr, FilterValue, MatchSpec, Scalar, SortSpec, Stage, fields};

use crate::repository::StorageError;

pub(crate) struct RenderedPipeline {
    /// Leading-space `" WHERE ..."` fragment, or empty.
    pub where_sql: String,
    /// Leading-space `" ORDER BY ..."` fragment, or empty.
    pub order_sql: String,
    /// Leading-space `" LIMIT .. OFFSET .."` fragment, or empty.
    pub limit_sql: String,
    pub binds: Vec<Scalar>,
}

fn column(field: &str) -> Result<&'static str, StorageError> {
    Ok(match field {
        fields::ID => "id",
        fields::KIND => "kind",
        fields::NAME => "name",
        fields::PARENT_ID => "parent_id",
        // `order` is a SQL keyword; the column is named position.
        fields::ORDER => "position",
        fields::CREATED_BY => "created_by",
        fields::SHARE_WITH => "share_with",
        fields::IS_PUBLIC => "is_public",
        fields::IS_DELETED => "is_deleted",
        fields::DELETED_AT => "deleted_at",
        fields::CREATED_AT => "created_at",
        fields::VERSION => "version",
        fields::IS_OLD_VERSION => "is_old_version",
        fields::PARENT_PROGRAM_ID => "parent_program_id",
        fields::LIB_PROGRAM_ID => "lib_program_id",
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown field: {other}"
            )));
        }
    })
}

fn render_condition(
    field: &str,
    value: &FilterValue,
    binds: &mut Vec<Scalar>,
) -> Result<Option<String>, StorageError> {
    let col = column(field)?;
    Ok(match value {
        FilterValue::Absent => None,
        FilterValue::Eq(scalar) => {
            binds.push(scalar.clone());
            Some(format!("{col} = ?{}", binds.len()))
        }
        FilterValue::In(set) => {
            if set.is_empty() {
                // Empty membership matches nothing.
                Some("1 = 0".to_owned())
            } else {
                let mut placeholders = Vec::with_capacity(set.len());
                for scalar in set {
                    binds.push(scalar.clone());
                    placeholders.push(format!("?{}", binds.len()));
                }
                Some(format!("{col} IN ({})", placeholders.join(", ")))
            }
        }
        FilterValue::Raw(expr) => {
            let (op, operand) = match expr {
                Expr::Gt(s) => (">", s),
                Expr::Gte(s) => (">=", s),
                Expr::Lt(s) => ("<", s),
                Expr::Lte(s) => ("<=", s),
                Expr::Ne(s) => ("<>", s),
            };
            binds.push(operand.clone());
            Some(format!("{col} {op} ?{}", binds.len()))
        }
    })
}

/// Renders the body of a WHERE clause, without the keyword.
///
/// Returns `None` when every condition compiled away.
pub(crate) fn render_match(
    spec: &MatchSpec,
    binds: &mut Vec<Scalar>,
) -> Result<Option<String>, StorageError> {
    let mut clauses = Vec::new();
    for (field, value) in spec.conditions() {
        if let Some(clause) = render_condition(field, value, binds)? {
            clauses.push(clause);
        }
    }
    let mut any = Vec::new();
    for (field, value) in spec.any_conditions() {
        if let Some(clause) = render_condition(field, value, binds)? {
            any.push(clause);
        }
    }
    if !any.is_empty() {
        clauses.push(format!("({})", any.join(" OR ")));
    }
    Ok(if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    })
}

fn render_sort(sort: &SortSpec) -> Result<String, StorageError> {
    Ok(match sort {
        SortSpec::Asc(field) => format!(" ORDER BY {} ASC, id ASC", column(field)?),
        SortSpec::Desc(field) => format!(" ORDER BY {} DESC, id ASC", column(field)?),
        // No text index in this backend; keep ordering deterministic.
        SortSpec::Relevance => " ORDER BY id ASC".to_owned(),
    })
}

/// Folds a compiled stage list into SQL fragments.
///
/// Compiled pipelines carry at most one skip and one limit; a later stage
/// of the same kind overrides an earlier one. Skip and limit render as
/// `LIMIT n OFFSET m`, matching stage order (limit counts rows remaining
/// after the skip); that is what preserves the cumulative limit on pages
/// past the first.
pub(crate) fn render_stages(stages: &[Stage]) -> Result<RenderedPipeline, StorageError> {
    let mut binds = Vec::new();
    let mut wheres = Vec::new();
    let mut order_sql = String::new();
    let mut skip: Option<u64> = None;
    let mut limit: Option<u64> = None;

    for stage in stages {
        match stage {
            Stage::Match(spec) => {
                if let Some(clause) = render_match(spec, &mut binds)? {
                    wheres.push(clause);
                }
            }
            Stage::Sort(sort) => order_sql = render_sort(sort)?,
            Stage::Skip(n) => skip = Some(*n),
            Stage::Limit(n) => limit = Some(*n),
            // Rows are materialized as full typed nodes.
            Stage::Project(_) => {}
        }
    }

    let where_sql = if wheres.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", wheres.join(" AND "))
    };
    let limit_sql = if skip.is_none() && limit.is_none() {
        String::new()
    } else {
        // SQLite requires LIMIT before OFFSET; -1 means unbounded.
        let bound = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        format!(" LIMIT {bound} OFFSET {}", skip.unwrap_or(0))
    };

    Ok(RenderedPipeline {
        where_sql,
        order_sql,
        limit_sql,
        binds,
    })
}

/// Attaches a scalar to a query as a positional bind.
pub(crate) fn bind_scalar<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    scalar: &Scalar,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match scalar {
        Scalar::Str(s) => query.bind(s.clone()),
        Scalar::Int(i) => query.bind(*i),
        Scalar::Bool(b) => query.bind(*b),
        Scalar::Time(t) => query.bind(*t),
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use coach_core::model::UserId;
    use coach_core::query::{Page, Query};

    #[test]
    fn renders_conjunction_and_acl_disjunction() {
        let spec = MatchSpec::new()
            .field(fields::KIND, "session")
            .field(fields::IS_DELETED, false)
            .visible_to(&UserId::new("alice"));
        let mut binds = Vec::new();
        let clause = render_match(&spec, &mut binds).unwrap().unwrap();
        assert_eq!(
            clause,
            "kind = ?1 AND is_deleted = ?2 AND (created_by = ?3 OR share_with = ?4)"
        );
        assert_eq!(binds.len(), 4);
    }

    #[test]
    fn order_field_renders_as_position_column() {
        let spec = MatchSpec::new().field(fields::ORDER, Expr::Gt(Scalar::Int(3)));
        let mut binds = Vec::new();
        let clause = render_match(&spec, &mut binds).unwrap().unwrap();
        assert_eq!(clause, "position > ?1");
    }

    #[test]
    fn unknown_field_is_rejected_not_spliced() {
        let spec = MatchSpec::new().field("name; DROP TABLE content_nodes", 1_i64);
        let mut binds = Vec::new();
        assert!(matches!(
            render_match(&spec, &mut binds),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn empty_membership_renders_as_false() {
        let spec = MatchSpec::new().field(fields::ID, Vec::<Scalar>::new());
        let mut binds = Vec::new();
        let clause = render_match(&spec, &mut binds).unwrap().unwrap();
        assert_eq!(clause, "1 = 0");
        assert!(binds.is_empty());
    }

    #[test]
    fn pipeline_renders_cumulative_limit_after_offset() {
        let stages = Query::new(MatchSpec::new().field(fields::KIND, "exercise"))
            .sort(SortSpec::Asc(fields::ORDER.to_owned()))
            .page(Page::new(2, 10))
            .into_stages();
        let rendered = render_stages(&stages).unwrap();
        assert_eq!(rendered.where_sql, " WHERE kind = ?1");
        assert_eq!(rendered.order_sql, " ORDER BY position ASC, id ASC");
        assert_eq!(rendered.limit_sql, " LIMIT 20 OFFSET 10");
    }

    #[test]
    fn relevance_sort_falls_back_to_id_order() {
        let rendered = render_stages(&[Stage::Sort(SortSpec::Relevance)]).unwrap();
        assert_eq!(rendered.order_sql, " ORDER BY id ASC");
    }

    #[test]
    fn empty_match_renders_no_where_clause() {
        let rendered = render_stages(&[Stage::Match(MatchSpec::new())]).unwrap();
        assert!(rendered.where_sql.is_empty());
        assert!(rendered.binds.is_empty());
    }
}
