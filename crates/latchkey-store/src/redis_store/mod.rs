//! Redis store backend.
//!
//! Built on the `redis` crate. Plain commands and batches share one
//! [`ConnectionManager`], which reconnects after the server drops the link. `WATCH`
//! state and blocking pops belong to a connection, so each watch session and each
//! `BLPOP` runs on a dedicated connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::Cmd;
use redis::ConnectionAddr;
use redis::ConnectionInfo;
use redis::ErrorKind;
use redis::RedisConnectionInfo;
use redis::RedisError;
use redis::RedisResult;
use redis::Value;
use redis::aio::ConnectionLike;
use redis::aio::ConnectionManager;
use redis::aio::ConnectionManagerConfig;
use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::command::Command;
use crate::command::Reply;
use crate::command::ScoreBound;
use crate::command::SetCondition;
use crate::command::format_score;
use crate::error::StoreError;
use crate::traits::KeyValueStore;
use crate::traits::WatchSession;
use crate::traits::reject_blocking;

const DEFAULT_PORT: u16 = 6379;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `host:port` of the server.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// ACL user name, used together with `password`.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index.
    #[serde(default)]
    pub db: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on a reply to a non-blocking command.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_addr() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            username: None,
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl RedisConfig {
    fn connection_info(&self) -> Result<ConnectionInfo, StoreError> {
        let (host, port) = match self.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| StoreError::Connection {
                    addr: self.addr.clone(),
                    reason: format!("invalid port '{}'", port),
                })?;
                (host.trim_start_matches('[').trim_end_matches(']').to_string(), port)
            }
            None => (self.addr.clone(), DEFAULT_PORT),
        };
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: i64::from(self.db),
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }

    fn connect_error(&self, err: impl std::fmt::Display) -> StoreError {
        StoreError::Connection {
            addr: self.addr.clone(),
            reason: err.to_string(),
        }
    }
}

/// [`KeyValueStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    config: RedisConfig,
}

impl RedisStore {
    /// Connect to the server and verify it answers PING.
    pub async fn connect(config: RedisConfig) -> Result<Arc<Self>, StoreError> {
        let client = Client::open(config.connection_info()?).map_err(|e| config.connect_error(e))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .set_response_timeout(Duration::from_millis(config.response_timeout_ms));
        let manager = ConnectionManager::new_with_config(client.clone(), manager_config)
            .await
            .map_err(|e| config.connect_error(e))?;

        let store = Self {
            client,
            manager,
            config,
        };
        match store.execute(Command::Ping).await? {
            Reply::Text(pong) if pong == "PONG" => {}
            other => {
                return Err(StoreError::UnexpectedReply {
                    expected: "PONG".to_string(),
                    reply: format!("{:?}", other),
                });
            }
        }
        debug!(addr = %store.config.addr, db = store.config.db, "redis connection established");
        Ok(Arc::new(store))
    }

    /// Connection settings this store was opened with.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Open a connection that nothing else shares.
    async fn dedicated(&self) -> Result<MultiplexedConnection, StoreError> {
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(limit, self.client.get_multiplexed_async_connection()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(self.config.connect_error(err)),
            Err(_) => Err(self.config.connect_error(format!("timed out after {}ms", self.config.connect_timeout_ms))),
        }
    }

    fn error(&self, err: RedisError) -> StoreError {
        store_error(err, self.config.response_timeout_ms)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        let cmd = to_cmd(&command);
        if command.is_blocking() {
            let mut conn = self.dedicated().await?;
            let value: RedisResult<Value> = cmd.query_async(&mut conn).await;
            return into_reply(value.map_err(|e| self.error(e))?);
        }

        let mut conn = self.manager.clone();
        let first: RedisResult<Value> = cmd.query_async(&mut conn).await;
        let value = match first {
            Ok(value) => value,
            // The manager reconnects after a dropped link; a read is safe to send again.
            Err(err) if is_link_failure(&err) && command.is_read_only() => {
                debug!(command = command.name(), error = %err, "redis link lost, resending read");
                let retried: RedisResult<Value> = cmd.query_async(&mut conn).await;
                retried.map_err(|e| self.error(e))?
            }
            Err(err) => return Err(self.error(err)),
        };
        into_reply(value)
    }

    async fn execute_batch(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        reject_blocking(&commands)?;
        let mut conn = self.manager.clone();
        let value = exec_atomic(&mut conn, &commands).await.map_err(|e| self.error(e))?;
        exec_replies(value)?.ok_or_else(|| StoreError::Protocol {
            reason: "EXEC aborted without a watch".to_string(),
        })
    }

    async fn watch(&self, keys: Vec<String>) -> Result<Box<dyn WatchSession>, StoreError> {
        let mut conn = self.dedicated().await?;
        if !keys.is_empty() {
            let watched: RedisResult<()> = redis::cmd("WATCH").arg(&keys).query_async(&mut conn).await;
            watched.map_err(|e| self.error(e))?;
        }
        Ok(Box::new(RedisWatch {
            conn,
            response_timeout_ms: self.config.response_timeout_ms,
        }))
    }
}

/// Send `commands` as one `MULTI`/`EXEC` pipeline and return the raw `EXEC` reply.
async fn exec_atomic<C>(conn: &mut C, commands: &[Command]) -> RedisResult<Value>
where C: ConnectionLike + Send {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in commands {
        pipe.add_command(to_cmd(command));
    }
    pipe.query_async(conn).await
}

/// Decode an `EXEC` reply. `Ok(None)` means a watched key changed.
fn exec_replies(value: Value) -> Result<Option<Vec<Reply>>, StoreError> {
    match value {
        Value::Nil => Ok(None),
        Value::Array(items) => items.into_iter().map(into_reply).collect::<Result<Vec<_>, _>>().map(Some),
        other => Err(StoreError::UnexpectedReply {
            expected: "EXEC array".to_string(),
            reply: format!("{:?}", other),
        }),
    }
}

struct RedisWatch {
    conn: MultiplexedConnection,
    response_timeout_ms: u64,
}

#[async_trait]
impl WatchSession for RedisWatch {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        reject_blocking(std::slice::from_ref(&command))?;
        let value: RedisResult<Value> = to_cmd(&command).query_async(&mut self.conn).await;
        into_reply(value.map_err(|e| store_error(e, self.response_timeout_ms))?)
    }

    async fn commit(self: Box<Self>, commands: Vec<Command>) -> Result<Option<Vec<Reply>>, StoreError> {
        reject_blocking(&commands)?;
        let RedisWatch {
            mut conn,
            response_timeout_ms,
        } = *self;
        let value = exec_atomic(&mut conn, &commands)
            .await
            .map_err(|e| store_error(e, response_timeout_ms))?;
        let replies = exec_replies(value)?;
        if replies.is_none() {
            debug!("watched key changed before EXEC");
        }
        Ok(replies)
    }

    async fn discard(self: Box<Self>) -> Result<(), StoreError> {
        let RedisWatch {
            mut conn,
            response_timeout_ms,
        } = *self;
        let unwatched: RedisResult<()> = redis::cmd("UNWATCH").query_async(&mut conn).await;
        unwatched.map_err(|e| store_error(e, response_timeout_ms))
    }
}

fn is_link_failure(err: &RedisError) -> bool {
    err.is_connection_dropped() || (err.is_io_error() && !err.is_timeout())
}

fn store_error(err: RedisError, response_timeout_ms: u64) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout {
            duration_ms: response_timeout_ms,
        }
    } else if err.is_io_error() || err.is_connection_dropped() {
        StoreError::Io {
            reason: err.to_string(),
        }
    } else if err.kind() == ErrorKind::TypeError {
        StoreError::Protocol {
            reason: err.to_string(),
        }
    } else {
        StoreError::Server {
            message: err.to_string(),
        }
    }
}

fn into_reply(value: Value) -> Result<Reply, StoreError> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Integer(n)),
        Value::SimpleString(s) => Ok(Reply::Text(s)),
        Value::BulkString(bytes) => String::from_utf8(bytes).map(Reply::Text).map_err(|_| StoreError::Protocol {
            reason: "bulk string is not valid UTF-8".to_string(),
        }),
        Value::Array(items) => items.into_iter().map(into_reply).collect::<Result<_, _>>().map(Reply::Array),
        other => Err(StoreError::UnexpectedReply {
            expected: "RESP2 reply".to_string(),
            reply: format!("{:?}", other),
        }),
    }
}

fn to_cmd(command: &Command) -> Cmd {
    let mut cmd = Cmd::new();
    for arg in command_args(command) {
        cmd.arg(arg);
    }
    cmd
}

fn bytes(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn bound(b: &ScoreBound) -> Vec<u8> {
    b.to_string().into_bytes()
}

fn millis(d: &std::time::Duration) -> Vec<u8> {
    d.as_millis().max(1).to_string().into_bytes()
}

/// Encode a command as RESP arguments.
pub(crate) fn command_args(command: &Command) -> Vec<Vec<u8>> {
    let mut args = vec![bytes(command.name())];
    match command {
        Command::Ping | Command::FlushDb => {}
        Command::Get { key }
        | Command::PTtl { key }
        | Command::Incr { key }
        | Command::SMembers { key }
        | Command::ZCard { key }
        | Command::LPop { key }
        | Command::LLen { key } => args.push(bytes(key)),
        Command::Set {
            key,
            value,
            ttl,
            condition,
        } => {
            args.push(bytes(key));
            args.push(bytes(value));
            if let Some(ttl) = ttl {
                args.push(bytes("PX"));
                args.push(millis(ttl));
            }
            if *condition == SetCondition::IfAbsent {
                args.push(bytes("NX"));
            }
        }
        Command::Delete { keys } => args.extend(keys.iter().map(|k| bytes(k))),
        Command::PExpire { key, ttl } => {
            args.push(bytes(key));
            args.push(millis(ttl));
        }
        Command::SAdd { key, members } | Command::SRem { key, members } | Command::ZRem { key, members } => {
            args.push(bytes(key));
            args.extend(members.iter().map(|m| bytes(m)));
        }
        Command::RPush { key, values } => {
            args.push(bytes(key));
            args.extend(values.iter().map(|v| bytes(v)));
        }
        Command::SIsMember { key, member } | Command::ZScore { key, member } | Command::ZRank { key, member } => {
            args.push(bytes(key));
            args.push(bytes(member));
        }
        Command::ZAdd { key, members } => {
            args.push(bytes(key));
            for (member, score) in members {
                args.push(format_score(*score).into_bytes());
                args.push(bytes(member));
            }
        }
        Command::ZIncrBy { key, member, delta } => {
            args.push(bytes(key));
            args.push(format_score(*delta).into_bytes());
            args.push(bytes(member));
        }
        Command::ZRange {
            key,
            start,
            stop,
            with_scores,
        } => {
            args.push(bytes(key));
            args.push(start.to_string().into_bytes());
            args.push(stop.to_string().into_bytes());
            if *with_scores {
                args.push(bytes("WITHSCORES"));
            }
        }
        Command::ZRangeByScore {
            key,
            min,
            max,
            with_scores,
        } => {
            args.push(bytes(key));
            args.push(bound(min));
            args.push(bound(max));
            if *with_scores {
                args.push(bytes("WITHSCORES"));
            }
        }
        Command::ZRemRangeByScore { key, min, max } => {
            args.push(bytes(key));
            args.push(bound(min));
            args.push(bound(max));
        }
        Command::ZRemRangeByRank { key, start, stop } | Command::LRange { key, start, stop } => {
            args.push(bytes(key));
            args.push(start.to_string().into_bytes());
            args.push(stop.to_string().into_bytes());
        }
        Command::ZUnionStore {
            destination,
            sources,
            aggregate,
        }
        | Command::ZInterStore {
            destination,
            sources,
            aggregate,
        } => {
            args.push(bytes(destination));
            args.push(sources.len().to_string().into_bytes());
            args.extend(sources.iter().map(|(k, _)| bytes(k)));
            args.push(bytes("WEIGHTS"));
            args.extend(sources.iter().map(|(_, w)| format_score(*w).into_bytes()));
            args.push(bytes("AGGREGATE"));
            args.push(bytes(aggregate.as_str()));
        }
        Command::BLPop { keys, timeout } => {
            args.extend(keys.iter().map(|k| bytes(k)));
            // A zero timeout would block forever.
            args.push(format!("{:.3}", timeout.as_secs_f64().max(0.001)).into_bytes());
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;
    use tokio::net::tcp::OwnedReadHalf;

    use super::*;
    use crate::command::Aggregate;

    /// Read one request array of bulk strings, or `None` once the client hangs up.
    async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8(buf).ok()?);
        }
        Some(args)
    }

    /// A server that answers `+PONG` to everything. The first connection hangs up
    /// right after its first PING, the way an idle timeout or restart would.
    async fn spawn_flaky_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((socket, _)) = listener.accept().await {
                accepted += 1;
                let hang_up_after_ping = accepted == 1;
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    while let Some(args) = read_request(&mut reader).await {
                        if write.write_all(b"+PONG\r\n").await.is_err() {
                            return;
                        }
                        if hang_up_after_ping && args.first().is_some_and(|a| a.eq_ignore_ascii_case("PING")) {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drops_link() {
        let addr = spawn_flaky_server().await;
        let store = RedisStore::connect(RedisConfig {
            addr,
            ..Default::default()
        })
        .await
        .unwrap();
        // Let the client notice the first connection is gone.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = store.execute(Command::Ping).await.unwrap();
        assert_eq!(reply, Reply::Text("PONG".to_string()));
    }

    #[test]
    fn test_connection_info_from_addr() {
        let config = RedisConfig {
            addr: "redis.internal:6380".to_string(),
            password: Some("hunter2".to_string()),
            db: 3,
            ..Default::default()
        };
        let info = config.connection_info().unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6380) if host == "redis.internal"));
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("hunter2"));

        let bare = RedisConfig {
            addr: "localhost".to_string(),
            ..Default::default()
        };
        let info = bare.connection_info().unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, DEFAULT_PORT) if host == "localhost"));

        let bad = RedisConfig {
            addr: "localhost:port".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad.connection_info(), Err(StoreError::Connection { .. })));
    }

    #[test]
    fn test_error_mapping() {
        let timed_out = RedisError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(store_error(timed_out, 250), StoreError::Timeout { duration_ms: 250 });

        let reset = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(is_link_failure(&reset));
        assert!(matches!(store_error(reset, 250), StoreError::Io { .. }));

        let rejected = RedisError::from((ErrorKind::ResponseError, "value is not an integer"));
        assert!(!is_link_failure(&rejected));
        assert!(matches!(store_error(rejected, 250), StoreError::Server { .. }));
    }

    #[test]
    fn test_reply_decoding() {
        let value = Value::Array(vec![
            Value::BulkString(b"queue:a".to_vec()),
            Value::BulkString(b"job".to_vec()),
        ]);
        assert_eq!(
            into_reply(value).unwrap(),
            Reply::Array(vec![Reply::Text("queue:a".into()), Reply::Text("job".into())])
        );
        assert_eq!(into_reply(Value::Okay).unwrap(), Reply::Ok);
        assert_eq!(into_reply(Value::Int(3)).unwrap(), Reply::Integer(3));
        assert_eq!(exec_replies(Value::Nil).unwrap(), None);
        assert!(matches!(into_reply(Value::BulkString(vec![0xff])), Err(StoreError::Protocol { .. })));
    }

    fn render(command: &Command) -> Vec<String> {
        command_args(command).into_iter().map(|a| String::from_utf8(a).unwrap()).collect()
    }

    #[test]
    fn test_set_nx_with_lease() {
        let args = render(&Command::set_nx("lock:a", "t1", Some(Duration::from_millis(1500))));
        assert_eq!(args, vec!["SET", "lock:a", "t1", "PX", "1500", "NX"]);
    }

    #[test]
    fn test_zadd_puts_score_first() {
        let args = render(&Command::zadd("sem:a", "t1", 1700000000123.0));
        assert_eq!(args, vec!["ZADD", "sem:a", "1700000000123", "t1"]);
    }

    #[test]
    fn test_zinterstore_weights() {
        let args = render(&Command::ZInterStore {
            destination: "sem:a:owner".into(),
            sources: vec![("sem:a:owner".into(), 1.0), ("sem:a".into(), 0.0)],
            aggregate: Aggregate::Sum,
        });
        assert_eq!(
            args,
            vec!["ZINTERSTORE", "sem:a:owner", "2", "sem:a:owner", "sem:a", "WEIGHTS", "1", "0", "AGGREGATE", "SUM"]
        );
    }

    #[test]
    fn test_score_bounds() {
        let args = render(&Command::zrem_range_by_score("sem:a", ScoreBound::NegInfinity, ScoreBound::Inclusive(99.0)));
        assert_eq!(args, vec!["ZREMRANGEBYSCORE", "sem:a", "-inf", "99"]);
    }

    #[test]
    fn test_blpop_timeout_in_seconds() {
        let args = render(&Command::blpop(vec!["queue:a".into(), "queue:b".into()], Duration::from_millis(1500)));
        assert_eq!(args, vec!["BLPOP", "queue:a", "queue:b", "1.500"]);
    }

    #[test]
    fn test_zrange_withscores() {
        let args = render(&Command::zrange_with_scores("delayed:", 0, 0));
        assert_eq!(args, vec!["ZRANGE", "delayed:", "0", "0", "WITHSCORES"]);
    }
}
