//! Declarative query objects and their compilation into aggregation stages.
//!
//! Callers describe a query as a [`MatchSpec`] (field conditions), an
//! optional [`SortSpec`], a [`Page`], and an optional projection. The
//! compiler turns that into an ordered [`Stage`] list which a storage
//! backend executes; nothing in this module performs I/O.
//!
//! Conditions are a tagged union decided at the call site. There is no
//! runtime type sniffing: a caller that wants "no filter" passes
//! [`FilterValue::Absent`] (or uses a constructor that produces it, such as
//! [`FilterValue::text`] on an empty string) and absent entries are dropped
//! during compilation.

use chrono::{DateTime, Utc};

use crate::model::{NodeId, ShareScope, UserId};

//
// ─── SCALARS & CONDITIONS ──────────────────────────────────────────────────────
//

/// A scalar comparable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(value: DateTime<Utc>) -> Self {
        Scalar::Time(value)
    }
}

impl From<&NodeId> for Scalar {
    fn from(value: &NodeId) -> Self {
        Scalar::Str(value.as_str().to_owned())
    }
}

impl From<&UserId> for Scalar {
    fn from(value: &UserId) -> Self {
        Scalar::Str(value.as_str().to_owned())
    }
}

/// A pre-built operator expression.
///
/// Passed through to the backend verbatim; the compiler does not inspect or
/// validate the operand against the field it is applied to.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Gt(Scalar),
    Gte(Scalar),
    Lt(Scalar),
    Lte(Scalar),
    Ne(Scalar),
}

/// One field condition inside a match specification.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Field equals the scalar. Both `true` and `false` are significant.
    Eq(Scalar),
    /// Field is any of the listed scalars (membership semantics).
    In(Vec<Scalar>),
    /// Pre-built operator expression, passed through untouched.
    Raw(Expr),
    /// No condition; the field is dropped from the compiled match stage.
    Absent,
}

impl FilterValue {
    /// Equality on a text value, where an empty string means "no filter".
    ///
    /// This preserves a convention the callers rely on throughout: an empty
    /// search box drops the condition entirely. Equality against the empty
    /// string cannot be expressed through this constructor.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            FilterValue::Absent
        } else {
            FilterValue::Eq(Scalar::Str(value))
        }
    }

    /// Wraps an optional condition; `None` compiles to no filter.
    #[must_use]
    pub fn opt(value: Option<impl Into<FilterValue>>) -> Self {
        value.map_or(FilterValue::Absent, Into::into)
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, FilterValue::Absent)
    }
}

impl From<Scalar> for FilterValue {
    fn from(value: Scalar) -> Self {
        FilterValue::Eq(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Eq(Scalar::Int(value))
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Eq(Scalar::Bool(value))
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::text(value)
    }
}

impl From<&NodeId> for FilterValue {
    fn from(value: &NodeId) -> Self {
        FilterValue::Eq(Scalar::from(value))
    }
}

impl From<&UserId> for FilterValue {
    fn from(value: &UserId) -> Self {
        FilterValue::Eq(Scalar::from(value))
    }
}

impl From<Vec<Scalar>> for FilterValue {
    fn from(values: Vec<Scalar>) -> Self {
        FilterValue::In(values)
    }
}

impl From<Expr> for FilterValue {
    fn from(expr: Expr) -> Self {
        FilterValue::Raw(expr)
    }
}

//
// ─── FIELD NAMES ───────────────────────────────────────────────────────────────
//

/// Canonical field names shared by the compiler and every executor.
pub mod fields {
    pub const ID: &str = "id";
    pub const KIND: &str = "kind";
    pub const NAME: &str = "name";
    pub const PARENT_ID: &str = "parent_id";
    pub const ORDER: &str = "order";
    pub const CREATED_BY: &str = "created_by";
    pub const SHARE_WITH: &str = "share_with";
    pub const IS_PUBLIC: &str = "is_public";
    pub const IS_DELETED: &str = "is_deleted";
    pub const DELETED_AT: &str = "deleted_at";
    pub const CREATED_AT: &str = "created_at";
    pub const VERSION: &str = "version";
    pub const IS_OLD_VERSION: &str = "is_old_version";
    pub const PARENT_PROGRAM_ID: &str = "parent_program_id";
    pub const LIB_PROGRAM_ID: &str = "lib_program_id";
}

//
// ─── MATCH SPECIFICATION ───────────────────────────────────────────────────────
//

/// Conjunction of field conditions, plus at most one disjunction group.
///
/// The disjunction group exists for the access-control clause: a node
/// matches when its creator is the caller *or* it is shared with everyone.
/// [`MatchSpec::visible_to`] is the only producer of that group and must
/// stay in lockstep with
/// [`ContentNode::is_visible_to`](crate::model::ContentNode::is_visible_to).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSpec {
    all: Vec<(String, FilterValue)>,
    any: Vec<(String, FilterValue)>,
}

impl MatchSpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a conjunctive condition. Absent values are kept out of the
    /// compiled output but tolerated here so call sites can thread optional
    /// filters without branching.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<FilterValue>) -> Self {
        self.all.push((name.to_owned(), value.into()));
        self
    }

    /// Adds a condition to the disjunction group.
    #[must_use]
    pub fn any_field(mut self, name: &str, value: impl Into<FilterValue>) -> Self {
        self.any.push((name.to_owned(), value.into()));
        self
    }

    /// Appends the access-control clause for the given user.
    #[must_use]
    pub fn visible_to(self, user: &UserId) -> Self {
        self.any_field(fields::CREATED_BY, user)
            .any_field(fields::SHARE_WITH, ShareScope::All.as_str())
    }

    /// Conjunctive conditions with absent entries removed.
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.all
            .iter()
            .filter(|(_, value)| !value.is_absent())
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Disjunction-group conditions with absent entries removed.
    pub fn any_conditions(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.any
            .iter()
            .filter(|(_, value)| !value.is_absent())
            .map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions().next().is_none() && self.any_conditions().next().is_none()
    }
}

//
// ─── SORT, PAGE, STAGES ────────────────────────────────────────────────────────
//

/// Sort order for a compiled pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SortSpec {
    Asc(String),
    Desc(String),
    /// Text-relevance marker. Backends without a text index substitute a
    /// deterministic id order.
    Relevance,
}

impl SortSpec {
    #[must_use]
    pub fn asc(field: &str) -> Self {
        SortSpec::Asc(field.to_owned())
    }

    #[must_use]
    pub fn desc(field: &str) -> Self {
        SortSpec::Desc(field.to_owned())
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    number: u32,
    size: u32,
}

impl Page {
    /// Creates a page request; both values are clamped to at least 1.
    #[must_use]
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number: number.max(1),
            size: size.max(1),
        }
    }

    #[must_use]
    pub fn number(self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn size(self) -> u32 {
        self.size
    }

    /// Rows skipped before the page starts.
    #[must_use]
    pub fn skip(self) -> u64 {
        u64::from(self.number - 1) * u64::from(self.size)
    }

    /// Value of the limit stage: the cumulative row count through the end
    /// of the requested page, not the page size.
    ///
    /// Kept for compatibility with existing callers: pages past the first
    /// can therefore surface more than `size` rows when the backend applies
    /// the limit after the skip. Regression tests pin this.
    #[must_use]
    pub fn cumulative_limit(self) -> u64 {
        u64::from(self.number) * u64::from(self.size)
    }
}

/// One stage of a compiled pipeline, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(MatchSpec),
    Sort(SortSpec),
    Skip(u64),
    Limit(u64),
    /// Field names to retain in the result. Executors that materialize
    /// typed rows may treat this as metadata.
    Project(Vec<String>),
}

/// A declarative query, compiled with [`Query::into_stages`].
#[derive(Debug, Clone, Default)]
pub struct Query {
    filter: MatchSpec,
    sort: Option<SortSpec>,
    page: Option<Page>,
    projection: Option<Vec<String>>,
}

impl Query {
    #[must_use]
    pub fn new(filter: MatchSpec) -> Self {
        Self {
            filter,
            sort: None,
            page: None,
            projection: None,
        }
    }

    #[must_use]
    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub fn page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    #[must_use]
    pub fn project(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(fields);
        self
    }

    /// Compiles the query into its ordered stage list:
    /// match, sort?, skip, limit, project?.
    #[must_use]
    pub fn into_stages(self) -> Vec<Stage> {
        let mut stages = vec![Stage::Match(self.filter)];
        if let Some(sort) = self.sort {
            stages.push(Stage::Sort(sort));
        }
        if let Some(page) = self.page {
            stages.push(Stage::Skip(page.skip()));
            stages.push(Stage::Limit(page.cumulative_limit()));
        }
        if let Some(fields) = self.projection {
            stages.push(Stage::Project(fields));
        }
        stages
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_compiles_to_no_filter() {
        let spec = MatchSpec::new()
            .field(fields::NAME, FilterValue::text(""))
            .field(fields::KIND, FilterValue::text("program"));
        let retained: Vec<_> = spec.conditions().collect();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].0, fields::KIND);
    }

    #[test]
    fn false_boolean_is_a_real_condition() {
        let spec = MatchSpec::new().field(fields::IS_DELETED, false);
        let retained: Vec<_> = spec.conditions().collect();
        assert_eq!(
            retained[0].1,
            &FilterValue::Eq(Scalar::Bool(false))
        );
    }

    #[test]
    fn none_option_compiles_to_no_filter() {
        let spec = MatchSpec::new().field(fields::VERSION, FilterValue::opt(None::<i64>));
        assert!(spec.is_empty());
    }

    #[test]
    fn array_becomes_membership_condition() {
        let spec = MatchSpec::new().field(
            fields::ID,
            vec![Scalar::from("a"), Scalar::from("b")],
        );
        let retained: Vec<_> = spec.conditions().collect();
        assert_eq!(
            retained[0].1,
            &FilterValue::In(vec![Scalar::from("a"), Scalar::from("b")])
        );
    }

    #[test]
    fn raw_expression_passes_through_verbatim() {
        let spec = MatchSpec::new().field(fields::ORDER, Expr::Gt(Scalar::Int(3)));
        let retained: Vec<_> = spec.conditions().collect();
        assert_eq!(retained[0].1, &FilterValue::Raw(Expr::Gt(Scalar::Int(3))));
    }

    #[test]
    fn visible_to_builds_the_acl_disjunction() {
        let user = UserId::new("alice");
        let spec = MatchSpec::new().visible_to(&user);
        let any: Vec<_> = spec.any_conditions().collect();
        assert_eq!(any.len(), 2);
        assert_eq!(any[0].0, fields::CREATED_BY);
        assert_eq!(any[0].1, &FilterValue::Eq(Scalar::from("alice")));
        assert_eq!(any[1].0, fields::SHARE_WITH);
        assert_eq!(any[1].1, &FilterValue::Eq(Scalar::from("ALL")));
    }

    #[test]
    fn stages_come_out_in_pipeline_order() {
        let stages = Query::new(MatchSpec::new().field(fields::KIND, "session"))
            .sort(SortSpec::asc(fields::ORDER))
            .page(Page::new(1, 25))
            .project(vec![fields::ID.to_owned(), fields::NAME.to_owned()])
            .into_stages();

        assert_eq!(stages.len(), 5);
        assert!(matches!(stages[0], Stage::Match(_)));
        assert!(matches!(stages[1], Stage::Sort(SortSpec::Asc(_))));
        assert_eq!(stages[2], Stage::Skip(0));
        assert_eq!(stages[3], Stage::Limit(25));
        assert!(matches!(stages[4], Stage::Project(_)));
    }

    #[test]
    fn limit_stage_is_cumulative_not_per_page() {
        // Page 2 of size 10 skips 10 rows and carries a limit of 20, so a
        // backend applying limit after skip can return up to 20 rows.
        let page = Page::new(2, 10);
        assert_eq!(page.skip(), 10);
        assert_eq!(page.cumulative_limit(), 20);

        let stages = Query::new(MatchSpec::new()).page(page).into_stages();
        assert_eq!(stages[1], Stage::Skip(10));
        assert_eq!(stages[2], Stage::Limit(20));
    }

    #[test]
    fn page_clamps_to_one_based() {
        let page = Page::new(0, 0);
        assert_eq!(page.number(), 1);
        assert_eq!(page.size(), 1);
        assert_eq!(page.skip(), 0);
    }

    #[test]
    fn sort_and_page_are_optional() {
        let stages = Query::new(MatchSpec::new().field(fields::KIND, "program")).into_stages();
        assert_eq!(stages.len(), 1);
        assert!(matches!(stages[0], Stage::Match(_)));
    }
}
