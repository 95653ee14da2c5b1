//! The unit of transfer between an agent and upstream.
//!
//! Rows are carried as JSON objects. The only structure outpost relies on is
//! described by [`SyncTable`]: primary key columns, whether the table carries
//! an `agent_id`, whether it can be reconciled by `id`/`updated_at`, and the
//! optional self-referencing parent column.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Error, Result};

/// A synced row as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// Tables that participate in agent/upstream sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Canaries,
    ConfigScrapers,
    Checks,
    CheckStatuses,
    Components,
    ConfigItems,
    ConfigRelationships,
}

impl SyncTable {
    /// Every table, parents before children. Inserts follow this order and
    /// deletes run in reverse.
    pub const ALL: [SyncTable; 7] = [
        SyncTable::Canaries,
        SyncTable::ConfigScrapers,
        SyncTable::Checks,
        SyncTable::CheckStatuses,
        SyncTable::Components,
        SyncTable::ConfigItems,
        SyncTable::ConfigRelationships,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            SyncTable::Canaries => "canaries",
            SyncTable::ConfigScrapers => "config_scrapers",
            SyncTable::Checks => "checks",
            SyncTable::CheckStatuses => "check_statuses",
            SyncTable::Components => "components",
            SyncTable::ConfigItems => "config_items",
            SyncTable::ConfigRelationships => "config_relationships",
        }
    }

    pub fn primary_key(self) -> &'static [&'static str] {
        match self {
            SyncTable::CheckStatuses => &["check_id", "time"],
            SyncTable::ConfigRelationships => &["config_id", "related_id", "relation"],
            _ => &["id"],
        }
    }

    /// Whether rows carry the owning agent's id.
    pub fn has_agent_id(self) -> bool {
        !matches!(
            self,
            SyncTable::CheckStatuses | SyncTable::ConfigRelationships
        )
    }

    /// Whether the table has a single `id` key plus `updated_at`, which the
    /// page digest needs.
    pub fn is_reconcilable(self) -> bool {
        self.has_agent_id()
    }

    /// Self-referencing parent column, if any.
    pub fn parent_column(self) -> Option<&'static str> {
        match self {
            SyncTable::Components | SyncTable::ConfigItems => Some("parent_id"),
            _ => None,
        }
    }

    /// Reconcilable tables in insertion order.
    pub fn reconcilable() -> impl Iterator<Item = SyncTable> {
        Self::ALL.into_iter().filter(|t| t.is_reconcilable())
    }

    /// Primary key of `row` as text. Composite keys are joined with `:`.
    pub fn row_key(self, row: &Row) -> Option<String> {
        let parts: Option<Vec<String>> = self
            .primary_key()
            .iter()
            .map(|col| row.get(*col).and_then(value_as_key))
            .collect();
        parts.map(|p| p.join(":"))
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for SyncTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SyncTable::ALL
            .into_iter()
            .find(|t| t.table_name() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sync table: {s}")))
    }
}

fn value_as_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Body of a conflict response: primary keys that still violate a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushFkError {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// A heterogeneous bundle of rows pushed to (or deleted from) upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub canaries: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_scrapers: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check_statuses: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_items: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_relationships: Vec<Row>,
}

impl PushData {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Total number of rows across every table.
    pub fn count(&self) -> usize {
        SyncTable::ALL.iter().map(|t| self.rows(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn rows(&self, table: SyncTable) -> &[Row] {
        match table {
            SyncTable::Canaries => &self.canaries,
            SyncTable::ConfigScrapers => &self.config_scrapers,
            SyncTable::Checks => &self.checks,
            SyncTable::CheckStatuses => &self.check_statuses,
            SyncTable::Components => &self.components,
            SyncTable::ConfigItems => &self.config_items,
            SyncTable::ConfigRelationships => &self.config_relationships,
        }
    }

    pub fn rows_mut(&mut self, table: SyncTable) -> &mut Vec<Row> {
        match table {
            SyncTable::Canaries => &mut self.canaries,
            SyncTable::ConfigScrapers => &mut self.config_scrapers,
            SyncTable::Checks => &mut self.checks,
            SyncTable::CheckStatuses => &mut self.check_statuses,
            SyncTable::Components => &mut self.components,
            SyncTable::ConfigItems => &mut self.config_items,
            SyncTable::ConfigRelationships => &mut self.config_relationships,
        }
    }

    pub fn add_rows(&mut self, table: SyncTable, rows: impl IntoIterator<Item = Row>) {
        self.rows_mut(table).extend(rows);
    }

    /// Non-empty tables in insertion order.
    pub fn tables(&self) -> impl Iterator<Item = (SyncTable, &[Row])> {
        SyncTable::ALL
            .into_iter()
            .map(move |t| (t, self.rows(t)))
            .filter(|(_, rows)| !rows.is_empty())
    }

    /// Primary keys of the rows in `table`.
    pub fn ids(&self, table: SyncTable) -> Vec<String> {
        self.rows(table)
            .iter()
            .filter_map(|row| table.row_key(row))
            .collect()
    }

    /// Stamp `agent_id` onto every row of every table that has the column.
    pub fn populate_agent_id(&mut self, agent_id: Uuid) {
        let value = JsonValue::String(agent_id.to_string());
        for table in SyncTable::ALL.into_iter().filter(|t| t.has_agent_id()) {
            for row in self.rows_mut(table) {
                row.insert("agent_id".to_string(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_count_sums_all_tables() {
        let mut data = PushData::new("agent-a");
        assert_eq!(data.count(), 0);
        assert!(data.is_empty());

        data.add_rows(SyncTable::Canaries, [row(json!({"id": "c1"}))]);
        data.add_rows(
            SyncTable::ConfigItems,
            [row(json!({"id": "i1"})), row(json!({"id": "i2"}))],
        );
        data.add_rows(
            SyncTable::CheckStatuses,
            [row(json!({"check_id": "k", "time": "2026-01-01"}))],
        );
        assert_eq!(data.count(), 4);
        assert!(!data.is_empty());
    }

    #[test]
    fn test_populate_agent_id_skips_tables_without_column() {
        let agent = Uuid::new_v4();
        let mut data = PushData::new("agent-a");
        data.add_rows(SyncTable::Checks, [row(json!({"id": "k1"}))]);
        data.add_rows(
            SyncTable::ConfigRelationships,
            [row(json!({"config_id": "a", "related_id": "b", "relation": "owns"}))],
        );

        data.populate_agent_id(agent);

        assert_eq!(data.checks[0]["agent_id"], json!(agent.to_string()));
        assert!(data.config_relationships[0].get("agent_id").is_none());
    }

    #[test]
    fn test_row_key_composite_and_missing() {
        let rel = row(json!({"config_id": "a", "related_id": "b", "relation": "owns"}));
        assert_eq!(
            SyncTable::ConfigRelationships.row_key(&rel),
            Some("a:b:owns".to_string())
        );
        let partial = row(json!({"config_id": "a"}));
        assert_eq!(SyncTable::ConfigRelationships.row_key(&partial), None);
        let numeric = row(json!({"id": 42}));
        assert_eq!(SyncTable::Checks.row_key(&numeric), Some("42".to_string()));
    }

    #[test]
    fn test_tables_yields_non_empty_in_insert_order() {
        let mut data = PushData::new("a");
        data.add_rows(SyncTable::ConfigItems, [row(json!({"id": "i"}))]);
        data.add_rows(SyncTable::Canaries, [row(json!({"id": "c"}))]);
        let order: Vec<_> = data.tables().map(|(t, _)| t).collect();
        assert_eq!(order, vec![SyncTable::Canaries, SyncTable::ConfigItems]);
    }

    #[test]
    fn test_sync_table_from_str() {
        assert_eq!(
            "config_items".parse::<SyncTable>().unwrap(),
            SyncTable::ConfigItems
        );
        assert!("notes".parse::<SyncTable>().is_err());
    }

    #[test]
    fn test_reconcilable_tables() {
        let tables: Vec<_> = SyncTable::reconcilable().collect();
        assert!(!tables.contains(&SyncTable::CheckStatuses));
        assert!(!tables.contains(&SyncTable::ConfigRelationships));
        assert_eq!(tables.len(), 5);
    }

    #[test]
    fn test_empty_slices_are_omitted_on_the_wire() {
        let mut data = PushData::new("agent-a");
        data.add_rows(SyncTable::Checks, [row(json!({"id": "k1"}))]);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["agent_name"], "agent-a");
        assert!(json.get("canaries").is_none());
        assert_eq!(json["checks"][0]["id"], "k1");

        let back: PushData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}
