use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::ids::{NodeId, UserId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeError {
    #[error("node id cannot be empty")]
    EmptyId,

    #[error("node name cannot be empty")]
    EmptyName,

    #[error("program nodes cannot reference a parent")]
    UnexpectedParent,

    #[error("{0} nodes require a parent")]
    MissingParent(NodeKind),
}

//
// ─── KIND & SHARING ────────────────────────────────────────────────────────────
//

/// The three levels of the content tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Program,
    Session,
    Exercise,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Program => "program",
            NodeKind::Session => "session",
            NodeKind::Exercise => "exercise",
        }
    }

    /// The kind directly below this one in the tree, if any.
    #[must_use]
    pub fn child(self) -> Option<NodeKind> {
        match self {
            NodeKind::Program => Some(NodeKind::Session),
            NodeKind::Session => Some(NodeKind::Exercise),
            NodeKind::Exercise => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a node is shared with.
///
/// `Owner` nodes are visible only to their creator; `All` nodes are visible
/// to every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareScope {
    All,
    Owner,
}

impl ShareScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ShareScope::All => "ALL",
            ShareScope::Owner => "OWNER",
        }
    }
}

//
// ─── CONTENT NODE ──────────────────────────────────────────────────────────────
//

/// A document in the three-level content tree.
///
/// One struct covers all three levels; `kind` discriminates and the
/// constructors enforce the parent invariants (programs are roots, sessions
/// hang off programs, exercises off sessions). The versioning fields are
/// only populated for programs.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    /// `None` for programs, the owning session/program otherwise.
    pub parent_id: Option<NodeId>,
    /// Sibling sequence. Relative ordering is the contract; values need not
    /// be contiguous.
    pub order: i64,
    pub created_by: UserId,
    pub share_with: ShareScope,
    pub is_public: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Live version number of a published program.
    pub version: Option<i64>,
    /// Set on program versions superseded by a later publish.
    pub is_old_version: bool,
    pub parent_program_id: Option<NodeId>,
    pub lib_program_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl ContentNode {
    /// Creates a program root.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the id or name is empty.
    pub fn program(
        id: NodeId,
        name: impl Into<String>,
        created_by: UserId,
        order: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, NodeError> {
        Self::build(id, NodeKind::Program, name, None, created_by, order, created_at)
    }

    /// Creates a session under the given program.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the id or name is empty.
    pub fn session(
        id: NodeId,
        program_id: NodeId,
        name: impl Into<String>,
        created_by: UserId,
        order: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, NodeError> {
        Self::build(
            id,
            NodeKind::Session,
            name,
            Some(program_id),
            created_by,
            order,
            created_at,
        )
    }

    /// Creates an exercise under the given session.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the id or name is empty.
    pub fn exercise(
        id: NodeId,
        session_id: NodeId,
        name: impl Into<String>,
        created_by: UserId,
        order: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, NodeError> {
        Self::build(
            id,
            NodeKind::Exercise,
            name,
            Some(session_id),
            created_by,
            order,
            created_at,
        )
    }

    fn build(
        id: NodeId,
        kind: NodeKind,
        name: impl Into<String>,
        parent_id: Option<NodeId>,
        created_by: UserId,
        order: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, NodeError> {
        let node = Self {
            id,
            kind,
            name: name.into(),
            parent_id,
            order,
            created_by,
            share_with: ShareScope::Owner,
            is_public: false,
            is_deleted: false,
            deleted_at: None,
            version: None,
            is_old_version: false,
            parent_program_id: None,
            lib_program_id: None,
            created_at,
        };
        node.validate()?;
        Ok(node)
    }

    /// Re-checks the structural invariants, e.g. after deserializing a
    /// persisted row.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` when an invariant is violated.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.id.as_str().is_empty() {
            return Err(NodeError::EmptyId);
        }
        if self.name.trim().is_empty() {
            return Err(NodeError::EmptyName);
        }
        match (self.kind, &self.parent_id) {
            (NodeKind::Program, Some(_)) => Err(NodeError::UnexpectedParent),
            (NodeKind::Session | NodeKind::Exercise, None) => {
                Err(NodeError::MissingParent(self.kind))
            }
            _ => Ok(()),
        }
    }

    /// The visibility predicate: the creator always sees their own nodes,
    /// everyone sees nodes shared with all.
    ///
    /// This is the single source of truth for access checks; the
    /// match-clause form lives in [`crate::query::MatchSpec::visible_to`]
    /// and the two must agree.
    #[must_use]
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        self.created_by == *user || self.share_with == ShareScope::All
    }

    /// The id that keys this program's version lineage.
    ///
    /// Falls back to the node's own id for a program that was never
    /// published from a library copy.
    #[must_use]
    pub fn lineage_root(&self) -> &NodeId {
        self.lib_program_id
            .as_ref()
            .or(self.parent_program_id.as_ref())
            .unwrap_or(&self.id)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
