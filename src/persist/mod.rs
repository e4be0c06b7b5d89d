// ============================================================================
// Persister
// ============================================================================
//
// Resolves every entity of a graph against backend records. Each entity is
// looked up through its getter groups, created through its creator groups or
// dropped with a reason. Once resolution settles, field values and relation
// links are written in resolution order. Drops never abort the call; backend
// errors do.
//
// ============================================================================

mod resolver;
pub mod signals;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{Level, event, info_span};
use uuid::Uuid;

use crate::core::{EntityId, PersistConfig, RecordRef, Result, Target};
use crate::graph::Graph;
use crate::storage::Backend;

use resolver::{NodeState, Resolver};
pub use signals::{AfterPersist, BeforePersist, Signal, Signals, SubscriptionId};

/// Why an entity was left out of a persist call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No creator group had all of its keys.
    NotEnoughData,
    /// Nothing was found and the entity may not create records.
    UpdateOnlyMode,
    /// Nothing was found and the entity only looks records up.
    GetOnlyMode,
    /// Several records matched, or the record was already claimed, and the
    /// type does not allow it.
    AmbiguousMatchNotAllowed,
}

impl DropReason {
    /// Machine readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotEnoughData => "not_enough_data",
            Self::UpdateOnlyMode => "update_only_mode",
            Self::GetOnlyMode => "get_only_mode",
            Self::AmbiguousMatchNotAllowed => "ambiguous_match_not_allowed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotEnoughData => "cannot create: not enough data",
            Self::UpdateOnlyMode => "cannot create: update-only mode",
            Self::GetOnlyMode => "cannot create: get-only mode",
            Self::AmbiguousMatchNotAllowed => "ambiguous match not allowed",
        };
        f.write_str(text)
    }
}

/// A dropped entity. Also the payload of the `dropped` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedItem {
    pub item: EntityId,
    pub type_name: String,
    pub reason: DropReason,
}

/// An ambiguity the merge policy did not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    pub item: EntityId,
    pub type_name: String,
    /// The competing records.
    pub records: Vec<RecordRef>,
    pub message: String,
}

/// Result of [`Persister::persist`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    /// Top-level items that were not dropped, in input order.
    pub items: Vec<EntityId>,
    /// Records of each entry of `items`. Several only when merging.
    pub records: Vec<Vec<RecordRef>>,
    /// Every dropped entity, top-level or nested.
    pub dropped: Vec<DroppedItem>,
    pub failures: Vec<ResolutionFailure>,
}

impl PersistOutcome {
    pub fn into_parts(self) -> (Vec<EntityId>, Vec<Vec<RecordRef>>) {
        (self.items, self.records)
    }

    pub fn is_dropped(&self, id: EntityId) -> bool {
        self.dropped.iter().any(|d| d.item == id)
    }

    /// Records of a top-level item, if it was persisted.
    pub fn records_of(&self, id: EntityId) -> Option<&[RecordRef]> {
        self.items
            .iter()
            .position(|item| *item == id)
            .map(|i| self.records[i].as_slice())
    }
}

/// Persists entity graphs into a [`Backend`].
///
/// Pass `&mut backend` to keep using the backend afterwards.
pub struct Persister<B: Backend> {
    backend: B,
    config: PersistConfig,
    signals: Signals,
}

impl<B: Backend> Persister<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: PersistConfig::default(),
            signals: Signals::default(),
        }
    }

    pub fn with_config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn signals(&mut self) -> &mut Signals {
        &mut self.signals
    }

    /// Persists an entity, or every member of a collection, together with
    /// everything reachable from it.
    pub fn persist(&mut self, graph: &mut Graph, target: impl Into<Target>) -> Result<PersistOutcome> {
        let target = target.into();
        let span = info_span!("persist", persist_id = %Uuid::new_v4(), target = ?target);
        let _enter = span.enter();

        if self.config.process_items {
            graph.process(target)?;
        }

        let top: Vec<EntityId> = match target {
            Target::Entity(id) => vec![id],
            Target::Collection(id) => graph.members(id)?.to_vec(),
        };
        for item in &top {
            let snapshot = if self.config.snapshot_before_persist {
                graph.to_flat(*item)?
            } else {
                Json::Null
            };
            self.signals.before_persist.emit(&BeforePersist {
                item: *item,
                snapshot,
            });
        }

        let order = graph.walk(target)?;
        event!(Level::DEBUG, nodes = order.len(), items = top.len(), "resolving");
        let resolution = Resolver::new(graph, &mut self.backend, order)?.run()?;

        for dropped in &resolution.dropped {
            self.signals.dropped.emit(dropped);
        }

        let mut outcome = PersistOutcome {
            dropped: resolution.dropped.clone(),
            failures: resolution.failures.clone(),
            ..PersistOutcome::default()
        };
        for item in &top {
            if let Some(NodeState::Resolved(records)) = resolution.states.get(item) {
                outcome.items.push(*item);
                outcome.records.push(records.clone());
            }

            let reachable: HashSet<EntityId> = graph.walk(*item)?.into_iter().collect();
            let resolved: Vec<EntityId> = resolution
                .resolved_order
                .iter()
                .copied()
                .filter(|id| reachable.contains(id))
                .collect();
            let records = resolved
                .iter()
                .filter_map(|id| match resolution.states.get(id) {
                    Some(NodeState::Resolved(records)) => Some(records.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect();
            self.signals.after_persist.emit(&AfterPersist {
                item: *item,
                resolved,
                records,
            });
        }

        event!(
            Level::INFO,
            persisted = outcome.items.len(),
            dropped = outcome.dropped.len(),
            failures = outcome.failures.len(),
            "persist finished"
        );
        Ok(outcome)
    }
}
