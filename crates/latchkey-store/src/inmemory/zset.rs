//! Ordered member/score set with Redis ordering semantics.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::command::ScoreBound;

/// f64 with a total order so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by `(score, member)`, ties broken lexicographically.
#[derive(Debug, Clone, Default)]
pub(crate) struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    pub(crate) fn len(&self) -> usize {
        self.scores.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Insert or update a member. Returns `true` if the member is new.
    pub(crate) fn insert(&mut self, member: &str, score: f64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                self.order.insert((Score(score), member.to_string()));
                false
            }
            None => {
                self.order.insert((Score(score), member.to_string()));
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub(crate) fn rank(&self, member: &str) -> Option<usize> {
        let score = self.score(member)?;
        let target = (Score(score), member.to_string());
        Some(self.order.range(..&target).count())
    }

    /// Members in order with their scores.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.order.iter().map(|(score, member)| (member.as_str(), score.0))
    }

    pub(crate) fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(String, f64)> {
        match normalize_range(start, stop, self.len()) {
            Some((from, to)) => self
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(m, s)| (m.to_string(), s))
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn range_by_score(&self, min: ScoreBound, max: ScoreBound) -> Vec<(String, f64)> {
        self.iter()
            .skip_while(|(_, s)| !min.admits_from_below(*s))
            .take_while(|(_, s)| max.admits_from_above(*s))
            .map(|(m, s)| (m.to_string(), s))
            .collect()
    }

    /// Remove the given members, returning how many were present.
    pub(crate) fn remove_all(&mut self, members: &[(String, f64)]) -> usize {
        members.iter().filter(|(m, _)| self.remove(m)).count()
    }

    pub(crate) fn scores(&self) -> &HashMap<String, f64> {
        &self.scores
    }

    pub(crate) fn from_scores(scores: HashMap<String, f64>) -> Self {
        let mut set = SortedSet::default();
        for (member, score) in scores {
            set.insert(&member, score);
        }
        set
    }
}

/// Resolve Redis-style inclusive `start..=stop` indices against `len`.
///
/// Negative indices count from the end. Returns `None` for an empty range.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
