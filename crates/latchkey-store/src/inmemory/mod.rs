//! In-memory store backend.
//!
//! A thread-safe, single-process implementation of [`KeyValueStore`] with the same
//! atomicity guarantees as the Redis backend: every command and every batch runs
//! under one mutex, keys carry a modification revision for `watch`, expiry is applied
//! on access and by a periodic sweep, and blocking pops wait on a [`Notify`] signalled
//! by pushes.

mod zset;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use self::zset::SortedSet;
use self::zset::normalize_range;
use crate::command::Aggregate;
use crate::command::Command;
use crate::command::KeyTtl;
use crate::command::Reply;
use crate::command::SetCondition;
use crate::command::format_score;
use crate::error::StoreError;
use crate::traits::KeyValueStore;
use crate::traits::WatchSession;
use crate::traits::reject_blocking;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(SortedSet),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty_container(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Revision at which each key was last modified.
    ///
    /// A record outlives its entry only while a watch session is open on the key,
    /// so that a delete or expiry is still visible to that session.
    versions: HashMap<String, u64>,
    /// Open watch sessions per key.
    watchers: HashMap<String, usize>,
    revision: u64,
    applied: u64,
}

/// Commands applied between sweeps of expired keys nobody reads again.
const ACTIVE_EXPIRY_INTERVAL: u64 = 1024;

impl State {
    fn touch(&mut self, key: &str) {
        self.revision += 1;
        if self.entries.contains_key(key) || self.watchers.contains_key(key) {
            self.versions.insert(key.to_string(), self.revision);
        } else {
            self.versions.remove(key);
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Forget the revision of a key that no longer exists and nobody watches.
    fn forget_if_idle(&mut self, key: &str) {
        if !self.entries.contains_key(key) && !self.watchers.contains_key(key) {
            self.versions.remove(key);
        }
    }

    fn watch_key(&mut self, key: &str) {
        *self.watchers.entry(key.to_string()).or_default() += 1;
    }

    fn unwatch_key(&mut self, key: &str) {
        if let Some(count) = self.watchers.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.watchers.remove(key);
                self.forget_if_idle(key);
            }
        }
    }

    fn purge_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn sweep_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            trace!(count = expired.len(), "sweeping expired keys");
        }
        for key in expired {
            self.entries.remove(&key);
            self.touch(&key);
        }
    }

    /// Drop a container key once its last element is gone.
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty_container) {
            self.entries.remove(key);
            self.forget_if_idle(key);
        }
    }

    fn zset(&self, key: &str) -> Result<Option<&SortedSet>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z), ..
            }) => Ok(Some(z)),
            Some(_) => wrong_type(key),
        }
    }

    fn zset_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut SortedSet>, StoreError> {
        if create && !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), Entry::new(Value::ZSet(SortedSet::default())));
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z), ..
            }) => Ok(Some(z)),
            Some(_) => wrong_type(key),
        }
    }

    fn set(&self, key: &str) -> Result<Option<&BTreeSet<String>>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Set(s), .. }) => Ok(Some(s)),
            Some(_) => wrong_type(key),
        }
    }

    fn set_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut BTreeSet<String>>, StoreError> {
        if create && !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new())));
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry { value: Value::Set(s), .. }) => Ok(Some(s)),
            Some(_) => wrong_type(key),
        }
    }

    fn list(&self, key: &str) -> Result<Option<&VecDeque<String>>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l), ..
            }) => Ok(Some(l)),
            Some(_) => wrong_type(key),
        }
    }

    fn list_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        if create && !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l), ..
            }) => Ok(Some(l)),
            Some(_) => wrong_type(key),
        }
    }

    /// Members and scores of a sorted set or plain set (score 1) used as a
    /// union/intersection source.
    fn weighted_source(&self, key: &str, weight: f64) -> Result<HashMap<String, f64>, StoreError> {
        let weigh = |score: f64| {
            let value = score * weight;
            if value.is_nan() { 0.0 } else { value }
        };
        match self.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::ZSet(z), ..
            }) => Ok(z.scores().iter().map(|(m, s)| (m.clone(), weigh(*s))).collect()),
            Some(Entry { value: Value::Set(s), .. }) => Ok(s.iter().map(|m| (m.clone(), weigh(1.0))).collect()),
            Some(_) => wrong_type(key),
        }
    }

    fn store_zset(&mut self, destination: &str, scores: HashMap<String, f64>) -> Reply {
        let count = scores.len() as i64;
        if scores.is_empty() {
            self.entries.remove(destination);
        } else {
            self.entries
                .insert(destination.to_string(), Entry::new(Value::ZSet(SortedSet::from_scores(scores))));
        }
        self.touch(destination);
        Reply::Integer(count)
    }

    fn apply(&mut self, command: &Command, now: Instant) -> Result<Reply, StoreError> {
        self.applied += 1;
        if self.applied % ACTIVE_EXPIRY_INTERVAL == 0 {
            self.sweep_expired(now);
        }
        for key in referenced_keys(command) {
            self.purge_expired(key, now);
        }

        match command {
            Command::Ping => Ok(Reply::Text("PONG".to_string())),

            Command::Get { key } => match self.entries.get(key) {
                None => Ok(Reply::Nil),
                Some(Entry { value: Value::Str(s), .. }) => Ok(Reply::Text(s.clone())),
                Some(_) => wrong_type(key),
            },

            Command::Set {
                key,
                value,
                ttl,
                condition,
            } => {
                if ttl.is_some_and(|t| t.is_zero()) {
                    return Err(StoreError::InvalidCommand {
                        reason: "invalid expire time in SET".to_string(),
                    });
                }
                if *condition == SetCondition::IfAbsent && self.entries.contains_key(key) {
                    return Ok(Reply::Nil);
                }
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Str(value.clone()),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                self.touch(key);
                Ok(Reply::Ok)
            }

            Command::Delete { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.entries.remove(key).is_some() {
                        self.touch(key);
                        removed += 1;
                    }
                }
                Ok(Reply::Integer(removed))
            }

            Command::PExpire { key, ttl } => match self.entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + *ttl);
                    self.touch(key);
                    Ok(Reply::Integer(1))
                }
                None => Ok(Reply::Integer(0)),
            },

            Command::PTtl { key } => {
                let ttl = match self.entries.get(key) {
                    None => KeyTtl::Missing,
                    Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
                    Some(Entry {
                        expires_at: Some(at), ..
                    }) => KeyTtl::Expires(at.saturating_duration_since(now)),
                };
                Ok(Reply::Integer(ttl.to_pttl()))
            }

            Command::Incr { key } => {
                let current = match self.entries.get(key) {
                    None => 0,
                    Some(Entry { value: Value::Str(s), .. }) => {
                        s.parse::<i64>().map_err(|_| StoreError::NotAnInteger { key: key.clone() })?
                    }
                    Some(_) => return wrong_type(key),
                };
                let next = current.checked_add(1).ok_or_else(|| StoreError::Server {
                    message: "increment or decrement would overflow".to_string(),
                })?;
                match self.entries.get_mut(key) {
                    Some(entry) => entry.value = Value::Str(next.to_string()),
                    None => {
                        self.entries.insert(key.clone(), Entry::new(Value::Str(next.to_string())));
                    }
                }
                self.touch(key);
                Ok(Reply::Integer(next))
            }

            Command::SAdd { key, members } => {
                let set = self.set_mut(key, true)?.ok_or_else(|| missing(key))?;
                let added = members.iter().filter(|m| set.insert((*m).clone())).count();
                if added > 0 {
                    self.touch(key);
                }
                self.drop_if_empty(key);
                Ok(Reply::Integer(added as i64))
            }

            Command::SRem { key, members } => {
                let removed = match self.set_mut(key, false)? {
                    Some(set) => members.iter().filter(|m| set.remove(m.as_str())).count(),
                    None => 0,
                };
                if removed > 0 {
                    self.touch(key);
                    self.drop_if_empty(key);
                }
                Ok(Reply::Integer(removed as i64))
            }

            Command::SMembers { key } => {
                let members: Vec<Reply> = self.set(key)?.map(|s| s.iter().cloned().map(Reply::Text).collect()).unwrap_or_default();
                Ok(Reply::Array(members))
            }

            Command::SIsMember { key, member } => {
                let present = self.set(key)?.is_some_and(|s| s.contains(member));
                Ok(Reply::Integer(present as i64))
            }

            Command::ZAdd { key, members } => {
                let zset = self.zset_mut(key, true)?.ok_or_else(|| missing(key))?;
                let added = members.iter().filter(|(m, s)| zset.insert(m, *s)).count();
                self.touch(key);
                self.drop_if_empty(key);
                Ok(Reply::Integer(added as i64))
            }

            Command::ZRem { key, members } => {
                let removed = match self.zset_mut(key, false)? {
                    Some(zset) => members.iter().filter(|m| zset.remove(m)).count(),
                    None => 0,
                };
                if removed > 0 {
                    self.touch(key);
                    self.drop_if_empty(key);
                }
                Ok(Reply::Integer(removed as i64))
            }

            Command::ZCard { key } => Ok(Reply::Integer(self.zset(key)?.map_or(0, |z| z.len() as i64))),

            Command::ZScore { key, member } => {
                Ok(match self.zset(key)?.and_then(|z| z.score(member)) {
                    Some(score) => Reply::Text(format_score(score)),
                    None => Reply::Nil,
                })
            }

            Command::ZRank { key, member } => Ok(match self.zset(key)?.and_then(|z| z.rank(member)) {
                Some(rank) => Reply::Integer(rank as i64),
                None => Reply::Nil,
            }),

            Command::ZIncrBy { key, member, delta } => {
                let zset = self.zset_mut(key, true)?.ok_or_else(|| missing(key))?;
                let score = zset.score(member).unwrap_or(0.0) + delta;
                zset.insert(member, score);
                self.touch(key);
                Ok(Reply::Text(format_score(score)))
            }

            Command::ZRange {
                key,
                start,
                stop,
                with_scores,
            } => {
                let hits = self.zset(key)?.map(|z| z.range_by_rank(*start, *stop)).unwrap_or_default();
                Ok(scored_reply(hits, *with_scores))
            }

            Command::ZRangeByScore {
                key,
                min,
                max,
                with_scores,
            } => {
                let hits = self.zset(key)?.map(|z| z.range_by_score(*min, *max)).unwrap_or_default();
                Ok(scored_reply(hits, *with_scores))
            }

            Command::ZRemRangeByScore { key, min, max } => {
                let removed = match self.zset_mut(key, false)? {
                    Some(zset) => {
                        let hits = zset.range_by_score(*min, *max);
                        zset.remove_all(&hits)
                    }
                    None => 0,
                };
                if removed > 0 {
                    self.touch(key);
                    self.drop_if_empty(key);
                }
                Ok(Reply::Integer(removed as i64))
            }

            Command::ZRemRangeByRank { key, start, stop } => {
                let removed = match self.zset_mut(key, false)? {
                    Some(zset) => {
                        let hits = zset.range_by_rank(*start, *stop);
                        zset.remove_all(&hits)
                    }
                    None => 0,
                };
                if removed > 0 {
                    self.touch(key);
                    self.drop_if_empty(key);
                }
                Ok(Reply::Integer(removed as i64))
            }

            Command::ZUnionStore {
                destination,
                sources,
                aggregate,
            } => {
                let mut result: HashMap<String, f64> = HashMap::new();
                for (key, weight) in sources {
                    for (member, score) in self.weighted_source(key, *weight)? {
                        result
                            .entry(member)
                            .and_modify(|acc| *acc = aggregate.combine(*acc, score))
                            .or_insert(score);
                    }
                }
                Ok(self.store_zset(destination, result))
            }

            Command::ZInterStore {
                destination,
                sources,
                aggregate,
            } => {
                let result = intersect(self, sources, *aggregate)?;
                Ok(self.store_zset(destination, result))
            }

            Command::RPush { key, values } => {
                let list = self.list_mut(key, true)?.ok_or_else(|| missing(key))?;
                list.extend(values.iter().cloned());
                let len = list.len() as i64;
                self.touch(key);
                self.drop_if_empty(key);
                Ok(Reply::Integer(len))
            }

            Command::LPop { key } => {
                let popped = match self.list_mut(key, false)? {
                    Some(list) => list.pop_front(),
                    None => None,
                };
                match popped {
                    Some(value) => {
                        self.touch(key);
                        self.drop_if_empty(key);
                        Ok(Reply::Text(value))
                    }
                    None => Ok(Reply::Nil),
                }
            }

            Command::LLen { key } => Ok(Reply::Integer(self.list(key)?.map_or(0, |l| l.len() as i64))),

            Command::LRange { key, start, stop } => {
                let items = match self.list(key)? {
                    Some(list) => match normalize_range(*start, *stop, list.len()) {
                        Some((from, to)) => list.range(from..=to).cloned().map(Reply::Text).collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(Reply::Array(items))
            }

            Command::BLPop { .. } => Err(StoreError::InvalidCommand {
                reason: "BLPOP must be executed on its own".to_string(),
            }),

            Command::FlushDb => {
                let keys: Vec<String> = self.entries.keys().cloned().collect();
                self.entries.clear();
                for key in keys {
                    self.touch(&key);
                }
                Ok(Reply::Ok)
            }
        }
    }

    /// Pop from the first non-empty list in `keys`.
    fn pop_first(&mut self, keys: &[String], now: Instant) -> Result<Option<(String, String)>, StoreError> {
        for key in keys {
            self.purge_expired(key, now);
            let popped = match self.list_mut(key, false)? {
                Some(list) => list.pop_front(),
                None => None,
            };
            if let Some(value) = popped {
                self.touch(key);
                self.drop_if_empty(key);
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

fn intersect(
    state: &State,
    sources: &[(String, f64)],
    aggregate: Aggregate,
) -> Result<HashMap<String, f64>, StoreError> {
    let mut iter = sources.iter();
    let Some((first, weight)) = iter.next() else {
        return Ok(HashMap::new());
    };
    let mut result = state.weighted_source(first, *weight)?;
    for (key, weight) in iter {
        let other = state.weighted_source(key, *weight)?;
        result.retain(|member, _| other.contains_key(member));
        for (member, acc) in result.iter_mut() {
            if let Some(score) = other.get(member) {
                *acc = aggregate.combine(*acc, *score);
            }
        }
    }
    Ok(result)
}

fn scored_reply(hits: Vec<(String, f64)>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(hits.len() * if with_scores { 2 } else { 1 });
    for (member, score) in hits {
        items.push(Reply::Text(member));
        if with_scores {
            items.push(Reply::Text(format_score(score)));
        }
    }
    Reply::Array(items)
}

fn referenced_keys(command: &Command) -> Vec<&str> {
    match command {
        Command::Ping | Command::FlushDb => Vec::new(),
        Command::Delete { keys } | Command::BLPop { keys, .. } => keys.iter().map(String::as_str).collect(),
        Command::ZUnionStore {
            destination, sources, ..
        }
        | Command::ZInterStore {
            destination, sources, ..
        } => std::iter::once(destination.as_str())
            .chain(sources.iter().map(|(k, _)| k.as_str()))
            .collect(),
        Command::Get { key }
        | Command::Set { key, .. }
        | Command::PExpire { key, .. }
        | Command::PTtl { key }
        | Command::Incr { key }
        | Command::SAdd { key, .. }
        | Command::SRem { key, .. }
        | Command::SMembers { key }
        | Command::SIsMember { key, .. }
        | Command::ZAdd { key, .. }
        | Command::ZRem { key, .. }
        | Command::ZCard { key }
        | Command::ZScore { key, .. }
        | Command::ZRank { key, .. }
        | Command::ZIncrBy { key, .. }
        | Command::ZRange { key, .. }
        | Command::ZRangeByScore { key, .. }
        | Command::ZRemRangeByScore { key, .. }
        | Command::ZRemRangeByRank { key, .. }
        | Command::RPush { key, .. }
        | Command::LPop { key }
        | Command::LLen { key }
        | Command::LRange { key, .. } => vec![key.as_str()],
    }
}

fn wrong_type<T>(key: &str) -> Result<T, StoreError> {
    Err(StoreError::WrongType { key: key.to_string() })
}

fn missing(key: &str) -> StoreError {
    StoreError::Server {
        message: format!("key '{}' vanished during command", key),
    }
}

fn pushes(commands: &[Command]) -> bool {
    commands.iter().any(|c| matches!(c, Command::RPush { .. }))
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    pushed: Notify,
}

impl Shared {
    fn apply_all(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        let now = Instant::now();
        let result = {
            let mut state = self.state.lock();
            commands.iter().map(|c| state.apply(c, now)).collect::<Result<Vec<_>, _>>()
        };
        if pushes(commands) {
            self.pushed.notify_waiters();
        }
        result
    }

    async fn blocking_pop(&self, keys: &[String], timeout: Duration) -> Result<Reply, StoreError> {
        if timeout.is_zero() || keys.is_empty() {
            return Err(StoreError::InvalidCommand {
                reason: "BLPOP needs at least one key and a non-zero timeout".to_string(),
            });
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self.state.lock().pop_first(keys, Instant::now())?;
            if let Some((key, value)) = popped {
                return Ok(Reply::Array(vec![Reply::Text(key), Reply::Text(value)]));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Reply::Nil);
            }
        }
    }
}

/// In-memory [`KeyValueStore`].
///
/// Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create a new empty store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        trace!(command = command.name(), "in-memory execute");
        if let Command::BLPop { keys, timeout } = &command {
            return self.shared.blocking_pop(keys, *timeout).await;
        }
        let mut replies = self.shared.apply_all(std::slice::from_ref(&command))?;
        replies.pop().ok_or_else(|| StoreError::Protocol {
            reason: "missing reply".to_string(),
        })
    }

    async fn execute_batch(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        reject_blocking(&commands)?;
        self.shared.apply_all(&commands)
    }

    async fn watch(&self, keys: Vec<String>) -> Result<Box<dyn WatchSession>, StoreError> {
        let now = Instant::now();
        let observed = {
            let mut state = self.shared.state.lock();
            keys.into_iter()
                .map(|key| {
                    state.purge_expired(&key, now);
                    state.watch_key(&key);
                    let version = state.version(&key);
                    (key, version)
                })
                .collect()
        };
        Ok(Box::new(InMemoryWatch {
            shared: Arc::clone(&self.shared),
            observed,
        }))
    }
}

struct InMemoryWatch {
    shared: Arc<Shared>,
    observed: Vec<(String, u64)>,
}

#[async_trait]
impl WatchSession for InMemoryWatch {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        reject_blocking(std::slice::from_ref(&command))?;
        let mut replies = self.shared.apply_all(std::slice::from_ref(&command))?;
        replies.pop().ok_or_else(|| StoreError::Protocol {
            reason: "missing reply".to_string(),
        })
    }

    async fn commit(self: Box<Self>, commands: Vec<Command>) -> Result<Option<Vec<Reply>>, StoreError> {
        reject_blocking(&commands)?;
        let now = Instant::now();
        let result = {
            let mut state = self.shared.state.lock();
            let mut changed = false;
            for (key, version) in &self.observed {
                state.purge_expired(key, now);
                if state.version(key) != *version {
                    changed = true;
                    break;
                }
            }
            if changed {
                return Ok(None);
            }
            commands.iter().map(|c| state.apply(c, now)).collect::<Result<Vec<_>, _>>()
        };
        if pushes(&commands) {
            self.shared.pushed.notify_waiters();
        }
        result.map(Some)
    }

    async fn discard(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for InMemoryWatch {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for (key, _) in &self.observed {
            state.unwatch_key(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScoreBound;

    #[tokio::test]
    async fn test_set_nx_and_get() {
        let store = InMemoryStore::new();
        assert!(store.execute(Command::set_nx("k", "a", None)).await.unwrap().into_bool().unwrap());
        assert!(!store.execute(Command::set_nx("k", "b", None)).await.unwrap().into_bool().unwrap());
        let value = store.execute(Command::get("k")).await.unwrap().into_optional_text().unwrap();
        assert_eq!(value.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store.execute(Command::set_nx("k", "a", Some(Duration::from_millis(20)))).await.unwrap();
        let ttl = store.execute(Command::pttl("k")).await.unwrap().into_ttl().unwrap();
        assert!(matches!(ttl, KeyTtl::Expires(_)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.execute(Command::get("k")).await.unwrap(), Reply::Nil);
        assert_eq!(store.execute(Command::pttl("k")).await.unwrap().into_ttl().unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_pttl_without_expiry() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "a")).await.unwrap();
        assert_eq!(store.execute(Command::pttl("k")).await.unwrap().into_ttl().unwrap(), KeyTtl::Persistent);
        assert!(store.execute(Command::pexpire("k", Duration::from_secs(5))).await.unwrap().into_bool().unwrap());
        assert!(matches!(
            store.execute(Command::pttl("k")).await.unwrap().into_ttl().unwrap(),
            KeyTtl::Expires(_)
        ));
    }

    #[tokio::test]
    async fn test_incr_and_wrong_type() {
        let store = InMemoryStore::new();
        assert_eq!(store.execute(Command::incr("c")).await.unwrap(), Reply::Integer(1));
        assert_eq!(store.execute(Command::incr("c")).await.unwrap(), Reply::Integer(2));
        store.execute(Command::set("s", "abc")).await.unwrap();
        assert!(matches!(store.execute(Command::incr("s")).await, Err(StoreError::NotAnInteger { .. })));
        store.execute(Command::rpush("l", "x")).await.unwrap();
        assert!(matches!(store.execute(Command::get("l")).await, Err(StoreError::WrongType { .. })));
    }

    #[tokio::test]
    async fn test_zadd_reports_new_members() {
        let store = InMemoryStore::new();
        assert_eq!(store.execute(Command::zadd("z", "a", 1.0)).await.unwrap(), Reply::Integer(1));
        assert_eq!(store.execute(Command::zadd("z", "a", 2.0)).await.unwrap(), Reply::Integer(0));
        let score = store.execute(Command::zscore("z", "a")).await.unwrap().into_optional_score().unwrap();
        assert_eq!(score, Some(2.0));
    }

    #[tokio::test]
    async fn test_zrem_range_by_score_drops_empty_key() {
        let store = InMemoryStore::new();
        store.execute(Command::zadd("z", "a", 1.0)).await.unwrap();
        store.execute(Command::zadd("z", "b", 5.0)).await.unwrap();
        let removed = store
            .execute(Command::zrem_range_by_score("z", ScoreBound::NegInfinity, ScoreBound::Inclusive(1.0)))
            .await
            .unwrap();
        assert_eq!(removed, Reply::Integer(1));
        store.execute(Command::zrem("z", "b")).await.unwrap();
        assert_eq!(store.execute(Command::zcard("z")).await.unwrap(), Reply::Integer(0));
        assert_eq!(store.execute(Command::pttl("z")).await.unwrap().into_ttl().unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_zinterstore_with_zero_weight_keeps_left_scores() {
        let store = InMemoryStore::new();
        store.execute(Command::zadd("owner", "a", 1.0)).await.unwrap();
        store.execute(Command::zadd("owner", "b", 2.0)).await.unwrap();
        store.execute(Command::zadd("slots", "b", 1700000000000.0)).await.unwrap();
        store.execute(Command::zadd("slots", "c", 1700000000001.0)).await.unwrap();

        let count = store
            .execute(Command::ZInterStore {
                destination: "owner".into(),
                sources: vec![("owner".into(), 1.0), ("slots".into(), 0.0)],
                aggregate: Aggregate::Sum,
            })
            .await
            .unwrap();
        assert_eq!(count, Reply::Integer(1));
        let owners = store.execute(Command::zrange_with_scores("owner", 0, -1)).await.unwrap();
        assert_eq!(owners.into_scored_members().unwrap(), vec![("b".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn test_zunionstore_aggregates() {
        let store = InMemoryStore::new();
        store.execute(Command::zadd("a", "x", 1.0)).await.unwrap();
        store.execute(Command::zadd("b", "x", 4.0)).await.unwrap();
        store.execute(Command::zadd("b", "y", 2.0)).await.unwrap();
        store
            .execute(Command::ZUnionStore {
                destination: "u".into(),
                sources: vec![("a".into(), 1.0), ("b".into(), 1.0)],
                aggregate: Aggregate::Max,
            })
            .await
            .unwrap();
        let members = store.execute(Command::zrange_with_scores("u", 0, -1)).await.unwrap();
        assert_eq!(members.into_scored_members().unwrap(), vec![("y".to_string(), 2.0), ("x".to_string(), 4.0)]);
    }

    #[tokio::test]
    async fn test_batch_is_applied_in_order() {
        let store = InMemoryStore::new();
        let replies = store
            .execute_batch(vec![
                Command::zadd("z", "a", 1.0),
                Command::zadd("z", "b", 2.0),
                Command::zrank("z", "b"),
            ])
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Integer(1), Reply::Integer(1), Reply::Integer(1)]);
    }

    #[tokio::test]
    async fn test_batch_rejects_blocking_pop() {
        let store = InMemoryStore::new();
        let result = store.execute_batch(vec![Command::blpop(vec!["q".into()], Duration::from_millis(10))]).await;
        assert!(matches!(result, Err(StoreError::InvalidCommand { .. })));
    }

    #[tokio::test]
    async fn test_watch_commit_succeeds_without_interference() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "1")).await.unwrap();
        let mut session = store.watch(vec!["k".into()]).await.unwrap();
        let value = session.execute(Command::get("k")).await.unwrap();
        assert_eq!(value, Reply::Text("1".into()));
        let replies = session.commit(vec![Command::set("k", "2")]).await.unwrap();
        assert_eq!(replies, Some(vec![Reply::Ok]));
    }

    #[tokio::test]
    async fn test_watch_detects_concurrent_write() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "1")).await.unwrap();
        let session = store.watch(vec!["k".into()]).await.unwrap();
        store.execute(Command::set("k", "other")).await.unwrap();
        assert_eq!(session.commit(vec![Command::set("k", "2")]).await.unwrap(), None);
        let value = store.execute(Command::get("k")).await.unwrap();
        assert_eq!(value, Reply::Text("other".into()));
    }

    #[tokio::test]
    async fn test_watch_detects_delete_and_expiry() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "1")).await.unwrap();
        let session = store.watch(vec!["k".into()]).await.unwrap();
        store.execute(Command::del("k")).await.unwrap();
        assert_eq!(session.commit(vec![Command::set("k", "2")]).await.unwrap(), None);

        store.execute(Command::set_nx("e", "1", Some(Duration::from_millis(10)))).await.unwrap();
        let session = store.watch(vec!["e".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.commit(vec![Command::set("e", "2")]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blpop_respects_key_priority() {
        let store = InMemoryStore::new();
        store.execute(Command::rpush("low", "l1")).await.unwrap();
        store.execute(Command::rpush("high", "h1")).await.unwrap();
        let popped = store
            .execute(Command::blpop(vec!["high".into(), "low".into()], Duration::from_millis(50)))
            .await
            .unwrap()
            .into_popped()
            .unwrap();
        assert_eq!(popped, Some(("high".to_string(), "h1".to_string())));
    }

    #[tokio::test]
    async fn test_blpop_times_out() {
        let store = InMemoryStore::new();
        let reply = store.execute(Command::blpop(vec!["empty".into()], Duration::from_millis(20))).await.unwrap();
        assert_eq!(reply, Reply::Nil);
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = InMemoryStore::new();
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.execute(Command::blpop(vec!["q".into()], Duration::from_secs(5))).await.unwrap().into_popped()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.execute(Command::rpush("q", "job")).await.unwrap();
        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped, Some(("q".to_string(), "job".to_string())));
    }

    #[tokio::test]
    async fn test_revisions_do_not_outlive_deleted_keys() {
        let store = InMemoryStore::new();
        for i in 0..10_000 {
            let key = format!("lock:{}", i);
            store.execute(Command::set_nx(key.clone(), "t", None)).await.unwrap();
            store.execute(Command::del(key)).await.unwrap();
        }
        let state = store.shared.state.lock();
        assert!(state.entries.is_empty());
        assert!(state.versions.is_empty());
        assert!(state.watchers.is_empty());
    }

    #[tokio::test]
    async fn test_watched_delete_kept_until_session_ends() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "1")).await.unwrap();
        let session = store.watch(vec!["k".into()]).await.unwrap();
        store.execute(Command::del("k")).await.unwrap();
        assert!(store.shared.state.lock().versions.contains_key("k"));

        assert_eq!(session.commit(vec![Command::set("k", "2")]).await.unwrap(), None);
        let state = store.shared.state.lock();
        assert!(state.versions.is_empty());
        assert!(state.watchers.is_empty());
    }

    #[tokio::test]
    async fn test_unread_expired_keys_are_swept() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            store
                .execute(Command::set_nx(format!("lease:{}", i), "t", Some(Duration::from_millis(1))))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..ACTIVE_EXPIRY_INTERVAL {
            store.execute(Command::Ping).await.unwrap();
        }
        let state = store.shared.state.lock();
        assert!(state.entries.is_empty());
        assert!(state.versions.is_empty());
    }

    #[tokio::test]
    async fn test_lrange_and_flush() {
        let store = InMemoryStore::new();
        for v in ["a", "b", "c"] {
            store.execute(Command::rpush("l", v)).await.unwrap();
        }
        let items = store.execute(Command::lrange("l", 0, -1)).await.unwrap().into_texts().unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
        store.execute(Command::FlushDb).await.unwrap();
        assert_eq!(store.execute(Command::llen("l")).await.unwrap(), Reply::Integer(0));
    }
}
