//! Per-restaurant table layout and the combination planner.
//!
//! The graph is built once from venue configuration and shared read-only
//! across requests. Planning is pure computation: it never touches the store
//! and never awaits.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{SeatingPreference, Table, Zone};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate table id {0}")]
    DuplicateTable(Ulid),
    #[error("duplicate zone id {0}")]
    DuplicateZone(Ulid),
    #[error("table {table} references unknown zone {zone}")]
    UnknownZone { table: Ulid, zone: Ulid },
    #[error("table {table} lists unknown adjacent table {adjacent}")]
    UnknownAdjacent { table: Ulid, adjacent: Ulid },
    #[error("table {0} lists itself as adjacent")]
    SelfAdjacent(Ulid),
    #[error("table {0} has an invalid capacity range")]
    InvalidCapacity(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Every pair of tables in a merge must be directly adjacent.
    /// Off is a degraded mode for venues that rearrange furniture freely.
    pub require_adjacency: bool,
    /// Merged tables must share a zone.
    pub lock_zone: bool,
    pub max_tables: usize,
    /// Largest tolerated `capacity - party_size`. `None` means unbounded.
    pub max_overage: Option<u32>,
    /// Upper bound on merge search nodes; singles are always considered.
    pub max_evaluations: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            require_adjacency: true,
            lock_zone: true,
            max_tables: 3,
            max_overage: None,
            max_evaluations: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combination {
    /// Sorted ascending.
    pub table_ids: Vec<Ulid>,
    pub table_numbers: Vec<String>,
    pub zone_id: Option<Ulid>,
    pub total_capacity: u32,
    pub slack: u32,
    pub matches_preference: bool,
}

impl Combination {
    pub fn len(&self) -> usize {
        self.table_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table_ids.is_empty()
    }

    /// Human-readable key: table numbers joined with `+`.
    pub fn key(&self) -> String {
        self.table_numbers.join("+")
    }

    /// Fewest tables, then least slack, then preference match, then table ids.
    fn rank(&self, other: &Self) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then(self.slack.cmp(&other.slack))
            .then(other.matches_preference.cmp(&self.matches_preference))
            .then_with(|| self.table_ids.cmp(&other.table_ids))
    }
}

#[derive(Debug, Clone)]
pub struct TableGraph {
    tables: BTreeMap<Ulid, Table>,
    zones: HashMap<Ulid, Zone>,
    adjacency: HashMap<Ulid, BTreeSet<Ulid>>,
}

impl TableGraph {
    /// Validate the layout and symmetrize adjacency: if A lists B, B is adjacent to A.
    pub fn new(zones: Vec<Zone>, tables: Vec<Table>) -> Result<Self, GraphError> {
        if tables.len() > MAX_TABLES_PER_RESTAURANT {
            return Err(GraphError::LimitExceeded("too many tables"));
        }
        if zones.len() > MAX_ZONES_PER_RESTAURANT {
            return Err(GraphError::LimitExceeded("too many zones"));
        }

        let mut zone_map = HashMap::with_capacity(zones.len());
        for zone in zones {
            if zone.name.len() > MAX_NAME_LEN {
                return Err(GraphError::LimitExceeded("zone name too long"));
            }
            let id = zone.id;
            if zone_map.insert(id, zone).is_some() {
                return Err(GraphError::DuplicateZone(id));
            }
        }

        let mut table_map = BTreeMap::new();
        for table in tables {
            if table.capacity == 0 || table.min_party_size > table.capacity {
                return Err(GraphError::InvalidCapacity(table.id));
            }
            if table.number.len() > MAX_NAME_LEN {
                return Err(GraphError::LimitExceeded("table number too long"));
            }
            if !zone_map.contains_key(&table.zone_id) {
                return Err(GraphError::UnknownZone {
                    table: table.id,
                    zone: table.zone_id,
                });
            }
            let id = table.id;
            if table_map.insert(id, table).is_some() {
                return Err(GraphError::DuplicateTable(id));
            }
        }

        let mut adjacency: HashMap<Ulid, BTreeSet<Ulid>> = HashMap::new();
        for table in table_map.values() {
            for other in &table.adjacent {
                if *other == table.id {
                    return Err(GraphError::SelfAdjacent(table.id));
                }
                if !table_map.contains_key(other) {
                    return Err(GraphError::UnknownAdjacent {
                        table: table.id,
                        adjacent: *other,
                    });
                }
                adjacency.entry(table.id).or_default().insert(*other);
                adjacency.entry(*other).or_default().insert(table.id);
            }
        }

        Ok(Self {
            tables: table_map,
            zones: zone_map,
            adjacency,
        })
    }

    pub fn table(&self, id: &Ulid) -> Option<&Table> {
        self.tables.get(id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn table_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.tables.keys().copied()
    }

    pub fn zone(&self, id: &Ulid) -> Option<&Zone> {
        self.zones.get(id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn are_adjacent(&self, a: &Ulid, b: &Ulid) -> bool {
        self.adjacency.get(a).is_some_and(|set| set.contains(b))
    }

    /// Combined capacity of `ids`, or `None` if any id is unknown.
    pub fn capacity_of(&self, ids: &[Ulid]) -> Option<u32> {
        ids.iter()
            .map(|id| self.tables.get(id).map(|t| t.capacity))
            .sum()
    }

    /// Table numbers for `ids`, in the same order; unknown ids are skipped.
    pub fn numbers_of(&self, ids: &[Ulid]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.tables.get(id).map(|t| t.number.clone()))
            .collect()
    }

    fn matches(&self, table: &Table, preference: SeatingPreference) -> bool {
        preference.matches(table, self.zones.get(&table.zone_id))
    }

    /// Ranked single-table and merged combinations able to seat `party_size`.
    ///
    /// A single table must accept the party on its own (`min_party_size` up to
    /// `capacity`). Merges ignore per-table minimums and only need the combined
    /// capacity to cover the party. Once a partial merge covers the party it is
    /// not extended further: a superset always ranks worse.
    pub fn find_combinations(
        &self,
        party_size: u32,
        preference: SeatingPreference,
        excluded: &HashSet<Ulid>,
        options: &PlannerOptions,
    ) -> Vec<Combination> {
        if party_size == 0 {
            return Vec::new();
        }
        let within_overage =
            |capacity: u32| options.max_overage.is_none_or(|max| capacity.saturating_sub(party_size) <= max);

        let mut candidates: Vec<&Table> = self
            .tables
            .values()
            .filter(|t| t.active && !excluded.contains(&t.id))
            .filter(|t| options.max_overage.is_none_or(|max| t.capacity <= party_size.saturating_add(max)))
            .collect();
        candidates.sort_by(|a, b| {
            a.capacity
                .cmp(&b.capacity)
                .then_with(|| a.number.cmp(&b.number))
                .then(a.id.cmp(&b.id))
        });

        let mut found = Vec::new();

        for table in &candidates {
            if table.min_party_size <= party_size
                && party_size <= table.capacity
                && within_overage(table.capacity)
            {
                found.push(self.combination(&[table], party_size, preference));
            }
        }

        if options.max_tables >= 2 {
            let mut search = MergeSearch {
                graph: self,
                candidates: &candidates,
                party_size,
                preference,
                options,
                evaluations: 0,
                found: &mut found,
            };
            let mut current = Vec::with_capacity(options.max_tables);
            search.extend(0, &mut current, 0);
        }

        found.sort_by(|a, b| a.rank(b));
        found
    }

    fn combination(&self, tables: &[&Table], party_size: u32, preference: SeatingPreference) -> Combination {
        let mut sorted: Vec<&Table> = tables.to_vec();
        sorted.sort_by_key(|t| t.id);
        let total_capacity: u32 = sorted.iter().map(|t| t.capacity).sum();
        let first_zone = sorted.first().map(|t| t.zone_id);
        let zone_id = first_zone.filter(|z| sorted.iter().all(|t| t.zone_id == *z));
        Combination {
            table_ids: sorted.iter().map(|t| t.id).collect(),
            table_numbers: sorted.iter().map(|t| t.number.clone()).collect(),
            zone_id,
            total_capacity,
            slack: total_capacity.saturating_sub(party_size),
            matches_preference: sorted.iter().all(|t| self.matches(t, preference)),
        }
    }
}

struct MergeSearch<'a> {
    graph: &'a TableGraph,
    candidates: &'a [&'a Table],
    party_size: u32,
    preference: SeatingPreference,
    options: &'a PlannerOptions,
    evaluations: usize,
    found: &'a mut Vec<Combination>,
}

impl<'a> MergeSearch<'a> {
    fn extend(&mut self, from: usize, current: &mut Vec<&'a Table>, capacity: u32) {
        for idx in from..self.candidates.len() {
            if self.evaluations >= self.options.max_evaluations {
                return;
            }
            let table = self.candidates[idx];
            if !self.compatible(current, table) {
                continue;
            }
            self.evaluations += 1;

            let total = capacity.saturating_add(table.capacity);
            current.push(table);
            if total >= self.party_size {
                if current.len() >= 2
                    && self
                        .options
                        .max_overage
                        .is_none_or(|max| total.saturating_sub(self.party_size) <= max)
                {
                    let combo = self.graph.combination(current, self.party_size, self.preference);
                    self.found.push(combo);
                }
            } else if current.len() < self.options.max_tables {
                self.extend(idx + 1, current, total);
            }
            current.pop();
        }
    }

    fn compatible(&self, current: &[&Table], next: &Table) -> bool {
        current.iter().all(|t| {
            (!self.options.lock_zone || t.zone_id == next.zone_id)
                && (!self.options.require_adjacency || self.graph.are_adjacent(&t.id, &next.id))
        })
    }
}
