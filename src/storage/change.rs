// ============================================================================
// Change Journal
// ============================================================================
//
// Every mutation of the memory backend made inside a transaction is recorded
// as a reversible Change. Rollback undoes the journal newest first.
//
// ============================================================================

use super::table::Row;

/// One stored link of a relation, kept on its canonical side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub model: String,
    pub relation: String,
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone)]
pub enum Change {
    InsertRow { model: String, id: i64 },

    UpdateRow { model: String, id: i64, old_row: Row },

    DeleteRow { model: String, id: i64, old_row: Row },

    AddLink(Link),

    RemoveLink(Link),
}

impl Change {
    /// The model whose rows or links were touched.
    pub fn model(&self) -> &str {
        match self {
            Change::InsertRow { model, .. }
            | Change::UpdateRow { model, .. }
            | Change::DeleteRow { model, .. } => model,
            Change::AddLink(link) | Change::RemoveLink(link) => &link.model,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Change::AddLink(_) | Change::RemoveLink(_))
    }
}
