use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

/// Input fields the resolver rewrites before dispatching a call.
pub const REFERENCE_LIST_FIELDS: &[&str] = &["character_ids", "scene_ids"];

/// Entity kinds that creator tools produce. Each kind owns an alias prefix
/// and a 1-based counter inside the batch context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Character,
    Scene,
}

impl EntityKind {
    pub fn for_creator_tool(tool: &str) -> Option<Self> {
        match tool {
            "createCharacter" => Some(Self::Character),
            "createScene" => Some(Self::Scene),
            _ => None,
        }
    }

    pub fn alias_prefix(self) -> &'static str {
        match self {
            Self::Character => "c-",
            Self::Scene => "s-",
        }
    }

    /// Payload field carrying the new identifier for this kind.
    pub fn id_field(self) -> &'static str {
        match self {
            Self::Character => "character_id",
            Self::Scene => "scene_id",
        }
    }
}

/// Synthetic-alias to real-identifier map, scoped to one batch.
#[derive(Debug, Default)]
pub struct AliasMap {
    entries: HashMap<String, String>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins on key collision; the reference behavior is a plain
    /// map assignment and re-registration is not an error.
    pub fn register(&mut self, key: String, real_id: String) {
        if let Some(previous) = self.entries.insert(key.clone(), real_id.clone()) {
            debug!("alias {key} re-registered: {previous} -> {real_id}");
        }
    }

    /// An unresolved alias is assumed to already be a real identifier, for
    /// example one created by a previous, separate request.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.entries.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites every recognized reference-list entry in place. Entries with
    /// no registered alias pass through unchanged.
    pub fn substitute_input(&self, input: &mut Map<String, Value>) {
        for field in REFERENCE_LIST_FIELDS {
            let Some(Value::Array(ids)) = input.get_mut(*field) else {
                continue;
            };
            for id in ids.iter_mut() {
                if let Some(alias) = id.as_str() {
                    let resolved = self.resolve(alias);
                    if resolved != alias {
                        *id = Value::String(resolved.to_owned());
                    }
                }
            }
        }
    }
}

/// Per-request counters and accumulated identifier lists, threaded through
/// the batch loop.
#[derive(Debug, Default)]
pub struct BatchContext {
    character_count: u32,
    scene_count: u32,
    pub character_ids: Vec<String>,
    pub scene_ids: Vec<String>,
}

impl BatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the deterministic alias key for the next created entity of
    /// `kind` and advances that kind's counter. The first entity of a kind
    /// gets index 1.
    pub fn next_alias_key(&mut self, kind: EntityKind) -> String {
        let counter = match kind {
            EntityKind::Character => &mut self.character_count,
            EntityKind::Scene => &mut self.scene_count,
        };
        *counter += 1;
        format!("{}{}", kind.alias_prefix(), *counter)
    }

    pub fn record_created_ids(&mut self, kind: EntityKind, ids: &[String]) {
        let list = match kind {
            EntityKind::Character => &mut self.character_ids,
            EntityKind::Scene => &mut self.scene_ids,
        };
        list.extend(ids.iter().cloned());
    }
}
