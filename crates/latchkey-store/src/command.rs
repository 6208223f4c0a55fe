//! Commands understood by every store backend and the replies they produce.
//!
//! Reply shapes follow the Redis conventions so that the in-memory backend and the
//! Redis backend are interchangeable:
//!
//! | Command | Reply |
//! |---------|-------|
//! | `Get`, `ZScore`, `ZIncrBy` | `Text` or `Nil` |
//! | `Set` | `Ok`, or `Nil` when the condition prevented the write |
//! | `Delete`, `Incr`, `ZAdd`, `ZRem`, `ZCard`, `RPush`, `LLen`, `SAdd`, `SRem`, ... | `Integer` |
//! | `PTtl` | `Integer` (`-2` missing, `-1` no expiry, else milliseconds) |
//! | `ZRank` | `Integer` or `Nil` |
//! | `ZRange*`, `LRange`, `SMembers` | `Array` of `Text` (member/score pairs when scores are requested) |
//! | `BLPop` | `Array([key, value])` or `Nil` on timeout |

use std::fmt;
use std::time::Duration;

use crate::error::StoreError;

/// A bound for score-range commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// Negative infinity.
    NegInfinity,
    /// Score greater than or equal / less than or equal to the value.
    Inclusive(f64),
    /// Score strictly beyond the value.
    Exclusive(f64),
    /// Positive infinity.
    PosInfinity,
}

impl ScoreBound {
    /// Whether `score` satisfies this bound used as a minimum.
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => true,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
            ScoreBound::PosInfinity => false,
        }
    }

    /// Whether `score` satisfies this bound used as a maximum.
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => false,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
            ScoreBound::PosInfinity => true,
        }
    }
}

impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInfinity => write!(f, "-inf"),
            ScoreBound::Inclusive(v) => write!(f, "{}", v),
            ScoreBound::Exclusive(v) => write!(f, "({}", v),
            ScoreBound::PosInfinity => write!(f, "+inf"),
        }
    }
}

/// How scores are combined by `ZUnionStore` / `ZInterStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

impl Aggregate {
    /// Combine two weighted scores.
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            Aggregate::Sum => a + b,
            Aggregate::Min => a.min(b),
            Aggregate::Max => a.max(b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// Write condition for `Set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    /// Always write.
    #[default]
    Always,
    /// Only write when the key does not exist (`NX`).
    IfAbsent,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Decode a `PTTL` integer reply.
    pub fn from_pttl(value: i64) -> Self {
        match value {
            -2 => KeyTtl::Missing,
            v if v < 0 => KeyTtl::Persistent,
            v => KeyTtl::Expires(Duration::from_millis(v as u64)),
        }
    }

    /// Encode as a `PTTL` integer reply.
    pub fn to_pttl(self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }
}

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
        condition: SetCondition,
    },
    Delete {
        keys: Vec<String>,
    },
    PExpire {
        key: String,
        ttl: Duration,
    },
    PTtl {
        key: String,
    },
    Incr {
        key: String,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    SMembers {
        key: String,
    },
    SIsMember {
        key: String,
        member: String,
    },
    /// Reply is the number of members that were newly inserted.
    ZAdd {
        key: String,
        members: Vec<(String, f64)>,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    ZCard {
        key: String,
    },
    ZScore {
        key: String,
        member: String,
    },
    ZRank {
        key: String,
        member: String,
    },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    /// Negative indices count from the end, as in Redis.
    ZRange {
        key: String,
        start: i64,
        stop: i64,
        with_scores: bool,
    },
    ZRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
        with_scores: bool,
    },
    ZRemRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    ZRemRangeByRank {
        key: String,
        start: i64,
        stop: i64,
    },
    /// Sources are `(key, weight)` pairs.
    ZUnionStore {
        destination: String,
        sources: Vec<(String, f64)>,
        aggregate: Aggregate,
    },
    ZInterStore {
        destination: String,
        sources: Vec<(String, f64)>,
        aggregate: Aggregate,
    },
    RPush {
        key: String,
        values: Vec<String>,
    },
    LPop {
        key: String,
    },
    LLen {
        key: String,
    },
    LRange {
        key: String,
        start: i64,
        stop: i64,
    },
    /// Blocking pop across `keys`; the first non-empty key wins.
    ///
    /// Not allowed inside batches or transactions.
    BLPop {
        keys: Vec<String>,
        timeout: Duration,
    },
    FlushDb,
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
            condition: SetCondition::Always,
        }
    }

    /// Set-if-absent, optionally with an expiry.
    pub fn set_nx(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
            condition: SetCondition::IfAbsent,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Delete { keys: vec![key.into()] }
    }

    pub fn pexpire(key: impl Into<String>, ttl: Duration) -> Self {
        Command::PExpire { key: key.into(), ttl }
    }

    pub fn pttl(key: impl Into<String>) -> Self {
        Command::PTtl { key: key.into() }
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Command::Incr { key: key.into() }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Command::ZAdd {
            key: key.into(),
            members: vec![(member.into(), score)],
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::ZRem {
            key: key.into(),
            members: vec![member.into()],
        }
    }

    pub fn zcard(key: impl Into<String>) -> Self {
        Command::ZCard { key: key.into() }
    }

    pub fn zscore(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::ZScore {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn zrank(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::ZRank {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn zrange_with_scores(key: impl Into<String>, start: i64, stop: i64) -> Self {
        Command::ZRange {
            key: key.into(),
            start,
            stop,
            with_scores: true,
        }
    }

    pub fn zrem_range_by_score(key: impl Into<String>, min: ScoreBound, max: ScoreBound) -> Self {
        Command::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        }
    }

    pub fn rpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::RPush {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    pub fn llen(key: impl Into<String>) -> Self {
        Command::LLen { key: key.into() }
    }

    pub fn lrange(key: impl Into<String>, start: i64, stop: i64) -> Self {
        Command::LRange {
            key: key.into(),
            start,
            stop,
        }
    }

    pub fn blpop(keys: Vec<String>, timeout: Duration) -> Self {
        Command::BLPop { keys, timeout }
    }

    /// Redis command name, used for logging and wire encoding.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Delete { .. } => "DEL",
            Command::PExpire { .. } => "PEXPIRE",
            Command::PTtl { .. } => "PTTL",
            Command::Incr { .. } => "INCR",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZCard { .. } => "ZCARD",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZRank { .. } => "ZRANK",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZRange { .. } => "ZRANGE",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Command::ZUnionStore { .. } => "ZUNIONSTORE",
            Command::ZInterStore { .. } => "ZINTERSTORE",
            Command::RPush { .. } => "RPUSH",
            Command::LPop { .. } => "LPOP",
            Command::LLen { .. } => "LLEN",
            Command::LRange { .. } => "LRANGE",
            Command::BLPop { .. } => "BLPOP",
            Command::FlushDb => "FLUSHDB",
        }
    }

    /// Whether the command may wait on the server.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Command::BLPop { .. })
    }

    /// Whether the command only reads, so sending it twice is harmless.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Ping
                | Command::Get { .. }
                | Command::PTtl { .. }
                | Command::SMembers { .. }
                | Command::SIsMember { .. }
                | Command::ZCard { .. }
                | Command::ZScore { .. }
                | Command::ZRank { .. }
                | Command::ZRange { .. }
                | Command::ZRangeByScore { .. }
                | Command::LLen { .. }
                | Command::LRange { .. }
        )
    }
}

/// A decoded store reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Integer(i64),
    Text(String),
    Array(Vec<Reply>),
}

impl Reply {
    fn unexpected(self, expected: &str) -> StoreError {
        StoreError::UnexpectedReply {
            expected: expected.to_string(),
            reply: format!("{:?}", self),
        }
    }

    /// An integer reply.
    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    /// Integer or nil, as returned by `ZRANK`.
    pub fn into_optional_integer(self) -> Result<Option<i64>, StoreError> {
        match self {
            Reply::Integer(n) => Ok(Some(n)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected("integer or nil")),
        }
    }

    /// `Ok` or a non-zero integer is `true`, `Nil` or zero is `false`.
    pub fn into_bool(self) -> Result<bool, StoreError> {
        match self {
            Reply::Ok => Ok(true),
            Reply::Nil => Ok(false),
            Reply::Integer(n) => Ok(n != 0),
            other => Err(other.unexpected("status or integer")),
        }
    }

    /// Bulk string or nil, as returned by `GET`.
    pub fn into_optional_text(self) -> Result<Option<String>, StoreError> {
        match self {
            Reply::Text(s) => Ok(Some(s)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected("text or nil")),
        }
    }

    /// A score reply (`ZSCORE`, `ZINCRBY`).
    pub fn into_optional_score(self) -> Result<Option<f64>, StoreError> {
        match self.into_optional_text()? {
            Some(text) => parse_score(&text).map(Some),
            None => Ok(None),
        }
    }

    pub fn into_texts(self) -> Result<Vec<String>, StoreError> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Text(s) => Ok(s),
                    other => Err(other.unexpected("text")),
                })
                .collect(),
            Reply::Nil => Ok(Vec::new()),
            other => Err(other.unexpected("array")),
        }
    }

    /// Alternating member/score pairs from a `WITHSCORES` range.
    pub fn into_scored_members(self) -> Result<Vec<(String, f64)>, StoreError> {
        let texts = self.into_texts()?;
        if texts.len() % 2 != 0 {
            return Err(StoreError::Protocol {
                reason: format!("odd number of elements ({}) in scored range", texts.len()),
            });
        }
        let mut pairs = Vec::with_capacity(texts.len() / 2);
        let mut iter = texts.into_iter();
        while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
            pairs.push((member, parse_score(&score)?));
        }
        Ok(pairs)
    }

    /// `BLPOP` result: the key popped from and the value.
    pub fn into_popped(self) -> Result<Option<(String, String)>, StoreError> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Array(items) if items.len() == 2 => {
                let mut texts = Reply::Array(items).into_texts()?.into_iter();
                match (texts.next(), texts.next()) {
                    (Some(key), Some(value)) => Ok(Some((key, value))),
                    _ => Err(StoreError::Protocol {
                        reason: "short BLPOP reply".to_string(),
                    }),
                }
            }
            other => Err(other.unexpected("two-element array or nil")),
        }
    }

    /// A `PTTL` reply.
    pub fn into_ttl(self) -> Result<KeyTtl, StoreError> {
        self.into_integer().map(KeyTtl::from_pttl)
    }
}

/// Render a score the way Redis does.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", score)
    }
}

/// Parse a score, accepting `inf`, `+inf` and `-inf`.
pub fn parse_score(text: &str) -> Result<f64, StoreError> {
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => other.parse::<f64>().map_err(|_| StoreError::Protocol {
            reason: format!("invalid score '{}'", other),
        }),
    }
}
