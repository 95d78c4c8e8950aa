//! Per-team key/value data with last-write-wins merging.
//!
//! Local writes are visible immediately and queued per team as
//! [`SyncChange`]s until the sync worker flushes them to reachable members.
//! The roster lives in the same store (`team_member` items, `null` for a
//! removed member), so membership changes merge like any other data.

use crate::error::Result;
use crate::identity::PeerId;
use crate::protocol::SyncChange;
use crate::{load_json, lock, store_json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use storage::Storage;

pub const MEMBER_TYPE: &str = "team_member";
pub const INFO_TYPE: &str = "team_info";
pub const NAME_KEY: &str = "name";

const TEAMS_INDEX_KEY: &str = "teams";

fn team_key(team_id: &str) -> String {
    format!("team/{}", team_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamDataItem {
    pub team_id: String,
    pub data_type: String,
    pub data_key: String,
    pub value: Value,
    /// Local count of accepted writes
    pub version: u64,
    pub updated_at: u64,
    pub created_by: Option<PeerId>,
}

impl TeamDataItem {
    fn as_change(&self) -> SyncChange {
        SyncChange {
            data_type: self.data_type.clone(),
            data_key: self.data_key.clone(),
            value: self.value.clone(),
            timestamp: self.updated_at,
            created_by: self.created_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not newer than what is stored
    Stale,
    /// We are not a member of the team
    NotMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamSummary {
    pub team_id: String,
    pub name: Option<String>,
    pub members: Vec<PeerId>,
}

#[derive(Default)]
struct Team {
    items: BTreeMap<(String, String), TeamDataItem>,
    pending: Vec<SyncChange>,
}

impl Team {
    fn is_member(&self, peer_id: &str) -> bool {
        self.items
            .get(&(MEMBER_TYPE.to_string(), peer_id.to_string()))
            .is_some_and(|item| !item.value.is_null())
    }

    fn members(&self) -> Vec<PeerId> {
        self.items
            .values()
            .filter(|i| i.data_type == MEMBER_TYPE && !i.value.is_null())
            .map(|i| i.data_key.clone())
            .collect()
    }

    /// Store `change` if it is newer than what we hold.
    fn merge(&mut self, team_id: &str, change: &SyncChange) -> bool {
        let key = (change.data_type.clone(), change.data_key.clone());
        match self.items.get_mut(&key) {
            Some(item) if change.timestamp <= item.updated_at => false,
            Some(item) => {
                item.value = change.value.clone();
                item.updated_at = change.timestamp;
                item.version += 1;
                if change.created_by.is_some() {
                    item.created_by = change.created_by.clone();
                }
                true
            }
            None => {
                self.items.insert(
                    key,
                    TeamDataItem {
                        team_id: team_id.to_string(),
                        data_type: change.data_type.clone(),
                        data_key: change.data_key.clone(),
                        value: change.value.clone(),
                        version: 1,
                        updated_at: change.timestamp,
                        created_by: change.created_by.clone(),
                    },
                );
                true
            }
        }
    }
}

pub struct TeamStore {
    self_id: PeerId,
    teams: Mutex<HashMap<String, Team>>,
    storage: Arc<dyn Storage>,
    /// Held from snapshot to `put` so writes land in mutation order
    persist_lock: tokio::sync::Mutex<()>,
}

impl TeamStore {
    pub async fn load(storage: Arc<dyn Storage>, self_id: &str) -> Result<Self> {
        let ids: Vec<String> = load_json(storage.as_ref(), TEAMS_INDEX_KEY).await?.unwrap_or_default();
        let mut teams = HashMap::new();
        for id in ids {
            let items: Vec<TeamDataItem> = load_json(storage.as_ref(), &team_key(&id)).await?.unwrap_or_default();
            let team = Team {
                items: items
                    .into_iter()
                    .map(|i| ((i.data_type.clone(), i.data_key.clone()), i))
                    .collect(),
                pending: Vec::new(),
            };
            teams.insert(id, team);
        }
        tracing::debug!(teams = teams.len(), "Loaded team data");
        Ok(Self {
            self_id: self_id.to_string(),
            teams: Mutex::new(teams),
            storage,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Local write. The timestamp always supersedes what we already hold for the key.
    pub async fn set(&self, team_id: &str, data_type: &str, data_key: &str, value: Value, now: u64) -> Result<SyncChange> {
        let (change, new_team) = {
            let mut teams = lock(&self.teams);
            let new_team = !teams.contains_key(team_id);
            let team = teams.entry(team_id.to_string()).or_default();
            let floor = team
                .items
                .get(&(data_type.to_string(), data_key.to_string()))
                .map_or(0, |i| i.updated_at + 1);
            let change = SyncChange {
                data_type: data_type.to_string(),
                data_key: data_key.to_string(),
                value,
                timestamp: now.max(floor),
                created_by: Some(self.self_id.clone()),
            };
            team.merge(team_id, &change);
            team.pending.push(change.clone());
            (change, new_team)
        };
        self.persist_team(team_id, new_team).await?;
        Ok(change)
    }

    /// Apply one incoming change.
    pub async fn apply_remote(&self, team_id: &str, change: &SyncChange) -> Result<ApplyOutcome> {
        let mut applied = self.apply_batch(team_id, std::slice::from_ref(change)).await?;
        Ok(match applied.pop() {
            Some(_) => ApplyOutcome::Applied,
            None if self.is_member(team_id, &self.self_id) => ApplyOutcome::Stale,
            None => ApplyOutcome::NotMember,
        })
    }

    /// Apply a batch of incoming changes; returns those that were newer.
    /// Everything is discarded when we are not a member of the team.
    pub async fn apply_batch(&self, team_id: &str, changes: &[SyncChange]) -> Result<Vec<SyncChange>> {
        let applied: Vec<SyncChange> = {
            let mut teams = lock(&self.teams);
            let Some(team) = teams.get_mut(team_id) else {
                return Ok(Vec::new());
            };
            if !team.is_member(&self.self_id) {
                return Ok(Vec::new());
            }
            changes.iter().filter(|c| team.merge(team_id, c)).cloned().collect()
        };
        if !applied.is_empty() {
            self.persist_team(team_id, false).await?;
        }
        Ok(applied)
    }

    pub fn get(&self, team_id: &str, data_type: Option<&str>) -> Vec<TeamDataItem> {
        let teams = lock(&self.teams);
        let Some(team) = teams.get(team_id) else {
            return Vec::new();
        };
        team.items
            .values()
            .filter(|i| data_type.map_or(true, |t| i.data_type == t))
            .cloned()
            .collect()
    }

    pub fn get_item(&self, team_id: &str, data_type: &str, data_key: &str) -> Option<TeamDataItem> {
        lock(&self.teams)
            .get(team_id)?
            .items
            .get(&(data_type.to_string(), data_key.to_string()))
            .cloned()
    }

    /// Every item we hold for the team, as changes for a full resync.
    pub fn snapshot(&self, team_id: &str) -> Vec<SyncChange> {
        lock(&self.teams)
            .get(team_id)
            .map(|t| t.items.values().map(TeamDataItem::as_change).collect())
            .unwrap_or_default()
    }

    /// Take every team's queued local changes.
    pub fn drain_pending(&self) -> Vec<(String, Vec<SyncChange>)> {
        let mut teams = lock(&self.teams);
        let mut out: Vec<_> = teams
            .iter_mut()
            .filter(|(_, t)| !t.pending.is_empty())
            .map(|(id, t)| (id.clone(), std::mem::take(&mut t.pending)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn members(&self, team_id: &str) -> Vec<PeerId> {
        lock(&self.teams).get(team_id).map(Team::members).unwrap_or_default()
    }

    pub fn is_member(&self, team_id: &str, peer_id: &str) -> bool {
        lock(&self.teams).get(team_id).is_some_and(|t| t.is_member(peer_id))
    }

    /// True when the team holds nothing beyond its roster and name.
    pub fn has_only_roster(&self, team_id: &str) -> bool {
        lock(&self.teams).get(team_id).map_or(true, |t| {
            t.items.values().all(|i| i.data_type == MEMBER_TYPE || i.data_type == INFO_TYPE)
        })
    }

    /// Teams we belong to that list `peer_id` as a member.
    pub fn shared_teams(&self, peer_id: &str) -> Vec<String> {
        let mut ids: Vec<_> = lock(&self.teams)
            .iter()
            .filter(|(_, t)| t.is_member(&self.self_id) && t.is_member(peer_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn teams(&self) -> Vec<TeamSummary> {
        let teams = lock(&self.teams);
        let mut out: Vec<_> = teams
            .iter()
            .map(|(id, t)| TeamSummary {
                team_id: id.clone(),
                name: t
                    .items
                    .get(&(INFO_TYPE.to_string(), NAME_KEY.to_string()))
                    .and_then(|i| i.value.as_str().map(str::to_string)),
                members: t.members(),
            })
            .collect();
        out.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        out
    }

    /// New team with us as the only member.
    pub async fn create_team(&self, name: &str, now: u64) -> Result<String> {
        let team_id = uuid::Uuid::new_v4().to_string();
        self.set(&team_id, INFO_TYPE, NAME_KEY, json!(name), now).await?;
        self.set(&team_id, MEMBER_TYPE, &self.self_id, json!({ "joined_at": now }), now).await?;
        tracing::info!(team_id = %team_id, name, "Created team");
        Ok(team_id)
    }

    pub async fn add_member(&self, team_id: &str, peer_id: &str, now: u64) -> Result<SyncChange> {
        self.set(team_id, MEMBER_TYPE, peer_id, json!({ "joined_at": now }), now).await
    }

    /// Tombstone the member.
    pub async fn remove_member(&self, team_id: &str, peer_id: &str, now: u64) -> Result<SyncChange> {
        self.set(team_id, MEMBER_TYPE, peer_id, Value::Null, now).await
    }

    /// Seed a team from an invitation with timestamp 0, so any real write
    /// from the team supersedes it. Nothing is queued for sending.
    pub async fn seed_from_invitation(&self, team_id: &str, team_name: &str, members: &[PeerId]) -> Result<()> {
        let new_team = {
            let mut teams = lock(&self.teams);
            let new_team = !teams.contains_key(team_id);
            let team = teams.entry(team_id.to_string()).or_default();
            let mut seed = vec![SyncChange {
                data_type: INFO_TYPE.to_string(),
                data_key: NAME_KEY.to_string(),
                value: json!(team_name),
                timestamp: 0,
                created_by: None,
            }];
            for member in members.iter().chain(std::iter::once(&self.self_id)) {
                seed.push(SyncChange {
                    data_type: MEMBER_TYPE.to_string(),
                    data_key: member.clone(),
                    value: json!({ "joined_at": 0 }),
                    timestamp: 0,
                    created_by: None,
                });
            }
            for change in &seed {
                team.merge(team_id, change);
            }
            new_team
        };
        self.persist_team(team_id, new_team).await
    }

    async fn persist_team(&self, team_id: &str, update_index: bool) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let items = self.get(team_id, None);
        store_json(self.storage.as_ref(), &team_key(team_id), &items).await?;
        if update_index {
            let mut ids: Vec<String> = lock(&self.teams).keys().cloned().collect();
            ids.sort();
            store_json(self.storage.as_ref(), TEAMS_INDEX_KEY, &ids).await?;
        }
        Ok(())
    }
}
