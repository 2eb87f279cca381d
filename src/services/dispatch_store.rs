// src/services/dispatch_store.rs
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::{KestrelError, KestrelResult};
use crate::models::dispatch::{CandidateStatus, Dispatch, DispatchOutcome};

/// Result of a conditional write. Conflicts are normal control-flow for the
/// scheduler: they mean another writer got there first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict,
}

/// Durable record of a dispatch attempt. All operations are linearizable per
/// dispatch id; conditional writes are the only way statuses move.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn create(&self, dispatch: Dispatch) -> KestrelResult<()>;

    async fn read(&self, id: &str) -> KestrelResult<Option<Dispatch>>;

    /// Conditional status transition for one candidate. Conflicts when the
    /// stored status differs from `expected` or the outcome is terminal.
    async fn set_candidate_status(
        &self,
        id: &str,
        index: usize,
        expected: CandidateStatus,
        next: CandidateStatus,
    ) -> KestrelResult<CasOutcome>;

    async fn advance_cursor(&self, id: &str, from: usize, to: usize) -> KestrelResult<CasOutcome>;

    /// Atomically set candidates[index] to assigned, outcome to assigned and
    /// record the ride id. Requires candidates[index]=acked, outcome=pending.
    async fn commit_assignment(
        &self,
        id: &str,
        index: usize,
        ride_id: &str,
    ) -> KestrelResult<CasOutcome>;

    async fn cancel(&self, id: &str) -> KestrelResult<CasOutcome>;

    async fn mark_exhausted(&self, id: &str) -> KestrelResult<CasOutcome>;
}

fn check_transition(expected: CandidateStatus, next: CandidateStatus) -> KestrelResult<()> {
    if expected.can_transition(next) {
        Ok(())
    } else {
        Err(KestrelError::internal(format!(
            "illegal candidate transition requested: {:?} -> {:?}",
            expected, next
        )))
    }
}

// ------------------------------
// In-memory implementation
// ------------------------------

/// Map-backed store. The single RwLock serialises writers, which gives the
/// per-id linearizability the contract asks for. Used by tests and
/// redis-less deployments.
pub struct MemoryDispatchStore {
    records: RwLock<HashMap<String, Dispatch>>,
}

impl MemoryDispatchStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Every record in the store. Handy for assertions and admin tooling.
    pub async fn all(&self) -> Vec<Dispatch> {
        self.records.read().await.values().cloned().collect()
    }
}

impl Default for MemoryDispatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStore for MemoryDispatchStore {
    async fn create(&self, dispatch: Dispatch) -> KestrelResult<()> {
        let mut records = self.records.write().await;
        records.insert(dispatch.id.clone(), dispatch);
        Ok(())
    }

    async fn read(&self, id: &str) -> KestrelResult<Option<Dispatch>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn set_candidate_status(
        &self,
        id: &str,
        index: usize,
        expected: CandidateStatus,
        next: CandidateStatus,
    ) -> KestrelResult<CasOutcome> {
        check_transition(expected, next)?;

        let mut records = self.records.write().await;
        let dispatch = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::DispatchNotFound(id.to_string()))?;

        if dispatch.outcome.is_terminal() {
            return Ok(CasOutcome::Conflict);
        }
        let candidate = dispatch
            .candidates
            .get_mut(index)
            .ok_or_else(|| KestrelError::internal(format!("candidate index {} out of range", index)))?;
        if candidate.status != expected {
            return Ok(CasOutcome::Conflict);
        }
        candidate.status = next;
        Ok(CasOutcome::Applied)
    }

    async fn advance_cursor(&self, id: &str, from: usize, to: usize) -> KestrelResult<CasOutcome> {
        let mut records = self.records.write().await;
        let dispatch = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::DispatchNotFound(id.to_string()))?;

        if dispatch.outcome.is_terminal() || dispatch.cursor != from || to < from {
            return Ok(CasOutcome::Conflict);
        }
        dispatch.cursor = to;
        Ok(CasOutcome::Applied)
    }

    async fn commit_assignment(
        &self,
        id: &str,
        index: usize,
        ride_id: &str,
    ) -> KestrelResult<CasOutcome> {
        let mut records = self.records.write().await;
        let dispatch = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::DispatchNotFound(id.to_string()))?;

        if dispatch.outcome != DispatchOutcome::Pending {
            return Ok(CasOutcome::Conflict);
        }
        let candidate = dispatch
            .candidates
            .get_mut(index)
            .ok_or_else(|| KestrelError::internal(format!("candidate index {} out of range", index)))?;
        if candidate.status != CandidateStatus::Acked {
            return Ok(CasOutcome::Conflict);
        }
        candidate.status = CandidateStatus::Assigned;
        dispatch.outcome = DispatchOutcome::Assigned;
        dispatch.ride_id = Some(ride_id.to_string());
        Ok(CasOutcome::Applied)
    }

    async fn cancel(&self, id: &str) -> KestrelResult<CasOutcome> {
        let mut records = self.records.write().await;
        let dispatch = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::DispatchNotFound(id.to_string()))?;

        if dispatch.outcome.is_terminal() {
            return Ok(CasOutcome::Conflict);
        }
        dispatch.outcome = DispatchOutcome::Cancelled;
        Ok(CasOutcome::Applied)
    }

    async fn mark_exhausted(&self, id: &str) -> KestrelResult<CasOutcome> {
        let mut records = self.records.write().await;
        let dispatch = records
            .get_mut(id)
            .ok_or_else(|| KestrelError::DispatchNotFound(id.to_string()))?;

        if dispatch.outcome.is_terminal() {
            return Ok(CasOutcome::Conflict);
        }
        dispatch.outcome = DispatchOutcome::Exhausted;
        Ok(CasOutcome::Applied)
    }
}

// ------------------------------
// Redis implementation
// ------------------------------

/// One JSON document per dispatch under `dispatch:{id}`. Every conditional
/// write runs as a Lua script so the read-check-write is atomic server-side.
pub struct RedisDispatchStore {
    client: redis::Client,
    set_status: redis::Script,
    advance: redis::Script,
    commit: redis::Script,
    terminate: redis::Script,
}

const SET_STATUS_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local d = cjson.decode(raw)
if d.outcome ~= 'pending' then return 'conflict' end
local cand = d.candidates[tonumber(ARGV[1]) + 1]
if cand == nil then return 'missing' end
if cand.status ~= ARGV[2] then return 'conflict' end
cand.status = ARGV[3]
redis.call('SET', KEYS[1], cjson.encode(d))
return 'ok'
"#;

const ADVANCE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local d = cjson.decode(raw)
if d.outcome ~= 'pending' then return 'conflict' end
local from = tonumber(ARGV[1])
local to = tonumber(ARGV[2])
if d.cursor ~= from or to < from then return 'conflict' end
d.cursor = to
redis.call('SET', KEYS[1], cjson.encode(d))
return 'ok'
"#;

const COMMIT_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local d = cjson.decode(raw)
if d.outcome ~= 'pending' then return 'conflict' end
local cand = d.candidates[tonumber(ARGV[1]) + 1]
if cand == nil then return 'missing' end
if cand.status ~= 'acked' then return 'conflict' end
cand.status = 'assigned'
d.outcome = 'assigned'
d.ride_id = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(d))
return 'ok'
"#;

const TERMINATE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local d = cjson.decode(raw)
if d.outcome ~= 'pending' then return 'conflict' end
d.outcome = ARGV[1]
redis.call('SET', KEYS[1], cjson.encode(d))
return 'ok'
"#;

impl RedisDispatchStore {
    pub fn new(redis_url: &str) -> KestrelResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            set_status: redis::Script::new(SET_STATUS_LUA),
            advance: redis::Script::new(ADVANCE_LUA),
            commit: redis::Script::new(COMMIT_LUA),
            terminate: redis::Script::new(TERMINATE_LUA),
        })
    }

    fn key(id: &str) -> String {
        format!("dispatch:{}", id)
    }

    async fn connection(&self) -> KestrelResult<redis::aio::Connection> {
        Ok(self.client.get_async_connection().await?)
    }

    fn interpret(id: &str, verdict: String) -> KestrelResult<CasOutcome> {
        match verdict.as_str() {
            "ok" => Ok(CasOutcome::Applied),
            "conflict" => Ok(CasOutcome::Conflict),
            "missing" => Err(KestrelError::DispatchNotFound(id.to_string())),
            other => Err(KestrelError::internal(format!(
                "unexpected script verdict: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl DispatchStore for RedisDispatchStore {
    async fn create(&self, dispatch: Dispatch) -> KestrelResult<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(&dispatch)?;
        let _: () = redis::cmd("SET")
            .arg(Self::key(&dispatch.id))
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read(&self, id: &str) -> KestrelResult<Option<Dispatch>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_candidate_status(
        &self,
        id: &str,
        index: usize,
        expected: CandidateStatus,
        next: CandidateStatus,
    ) -> KestrelResult<CasOutcome> {
        check_transition(expected, next)?;

        let mut conn = self.connection().await?;
        let verdict: String = self
            .set_status
            .key(Self::key(id))
            .arg(index as i64)
            .arg(expected.as_wire())
            .arg(next.as_wire())
            .invoke_async(&mut conn)
            .await?;
        Self::interpret(id, verdict)
    }

    async fn advance_cursor(&self, id: &str, from: usize, to: usize) -> KestrelResult<CasOutcome> {
        let mut conn = self.connection().await?;
        let verdict: String = self
            .advance
            .key(Self::key(id))
            .arg(from as i64)
            .arg(to as i64)
            .invoke_async(&mut conn)
            .await?;
        Self::interpret(id, verdict)
    }

    async fn commit_assignment(
        &self,
        id: &str,
        index: usize,
        ride_id: &str,
    ) -> KestrelResult<CasOutcome> {
        let mut conn = self.connection().await?;
        let verdict: String = self
            .commit
            .key(Self::key(id))
            .arg(index as i64)
            .arg(ride_id)
            .invoke_async(&mut conn)
            .await?;
        Self::interpret(id, verdict)
    }

    async fn cancel(&self, id: &str) -> KestrelResult<CasOutcome> {
        let mut conn = self.connection().await?;
        let verdict: String = self
            .terminate
            .key(Self::key(id))
            .arg("cancelled")
            .invoke_async(&mut conn)
            .await?;
        Self::interpret(id, verdict)
    }

    async fn mark_exhausted(&self, id: &str) -> KestrelResult<CasOutcome> {
        let mut conn = self.connection().await?;
        let verdict: String = self
            .terminate
            .key(Self::key(id))
            .arg("exhausted")
            .invoke_async(&mut conn)
            .await?;
        Self::interpret(id, verdict)
    }
}
