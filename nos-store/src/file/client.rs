//! 文件存储客户端
//!
//! `FileConnection` 在事务内缓冲写入，提交时作为一个 `W` 批次发送，
//! 由服务端在记录锁内完成版本检查与写入。传输层可以是 TCP，也可以是进程内调用。
//!
use super::protocol::{Request, Response, WriteEntry, decode_token, read_message};
use super::server::FileServer;
use crate::config::StoreConfig;
use crate::connection::{Connection, ConnectionFactory};
use nos_domain::error::{ErrorCategory, StoreError, StoreResult};
use nos_domain::generator::Sequence;
use nos_domain::key::PrimaryKey;
use nos_domain::mapping::StoredRecord;
use nos_domain::version::Version;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::str::FromStr;
use std::sync::Arc;

/// 一次请求/响应往返
pub trait Transport: Send {
    fn round_trip(&mut self, request: &Request) -> StoreResult<Response>;

    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

fn transport_error(action: &str, addr: SocketAddr, e: io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => StoreError::StoreTimeout {
            reason: format!("{action} {addr}: {e}"),
        },
        _ => StoreError::unavailable(format!("{action} {addr}: {e}")),
    }
}

pub struct TcpTransport {
    addr: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// 出错后流可能错位，不再使用
    broken: bool,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, config: &StoreConfig) -> StoreResult<Self> {
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|e| transport_error("connect to", addr, e))?;
        stream.set_read_timeout(Some(config.read_timeout()))?;
        stream.set_write_timeout(Some(config.read_timeout()))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        tracing::debug!(target: "nos::file", %addr, "connected to file server");
        Ok(Self {
            addr,
            reader,
            writer: stream,
            broken: false,
        })
    }

    fn exchange(&mut self, request: &Request) -> StoreResult<Response> {
        let wire = request.encode()?;
        self.writer
            .write_all(wire.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| transport_error("send to", self.addr, e))?;
        let lines = match read_message(&mut self.reader) {
            Ok(Some(lines)) => lines,
            Ok(None) => {
                return Err(StoreError::unavailable(format!(
                    "{} closed the connection",
                    self.addr
                )));
            }
            Err(StoreError::Io { source }) => {
                return Err(transport_error("read from", self.addr, source));
            }
            Err(e) => return Err(e),
        };
        Response::decode(&lines)
    }
}

impl Transport for TcpTransport {
    fn round_trip(&mut self, request: &Request) -> StoreResult<Response> {
        if self.broken {
            return Err(StoreError::unavailable(format!(
                "connection to {} is unusable after an earlier failure",
                self.addr
            )));
        }
        let result = self.exchange(request);
        if let Err(e) = &result {
            if e.category() == ErrorCategory::Transport {
                self.broken = true;
            }
        }
        result
    }

    fn close(&mut self) -> StoreResult<()> {
        match self.writer.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// 进程内传输：请求与响应仍经过线上编码
pub struct LocalTransport {
    server: Arc<FileServer>,
    owner: u64,
}

impl LocalTransport {
    pub fn new(server: Arc<FileServer>) -> Self {
        let owner = server.new_owner();
        Self { server, owner }
    }
}

impl Transport for LocalTransport {
    fn round_trip(&mut self, request: &Request) -> StoreResult<Response> {
        let request = Request::decode(&wire_lines(&request.encode()?))?;
        let response = self.server.handle(self.owner, request);
        Response::decode(&wire_lines(&response.encode()))
    }
}

fn wire_lines(wire: &str) -> Vec<String> {
    wire.lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct FileConnection {
    transport: Box<dyn Transport>,
    pending: Option<Vec<WriteEntry>>,
    closed: bool,
}

impl FileConnection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: None,
            closed: false,
        }
    }

    fn request(&mut self, request: Request) -> StoreResult<Response> {
        if self.closed {
            return Err(StoreError::illegal_state("file connection is closed"));
        }
        match self.transport.round_trip(&request)? {
            Response::Error { kind, detail } => Err(Response::into_error(kind, &detail)),
            response => Ok(response),
        }
    }

    fn value<T>(&mut self, request: Request) -> StoreResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.request(request)? {
            Response::Ok { value: Some(v), .. } => v
                .parse()
                .map_err(|e| StoreError::protocol(format!("bad value {v:?}: {e}"))),
            other => Err(StoreError::protocol(format!("expected a value, got {other:?}"))),
        }
    }

    fn write(&mut self, entry: WriteEntry) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::illegal_state("file connection is closed"));
        }
        match self.pending.as_mut() {
            Some(pending) => {
                pending.push(entry);
                Ok(())
            }
            None => self.send(vec![entry]),
        }
    }

    fn send(&mut self, entries: Vec<WriteEntry>) -> StoreResult<()> {
        match self.request(Request::Write { entries })? {
            Response::Ok { .. } => Ok(()),
            other => Err(StoreError::protocol(format!("unexpected write response {other:?}"))),
        }
    }

    /// 本连接暂存写入中对该记录的最后一次修改
    fn staged(&self, type_name: &str, key: &PrimaryKey) -> Option<Option<StoredRecord>> {
        let key = key.string_value();
        self.pending
            .iter()
            .flatten()
            .rev()
            .find(|e| e.type_name() == type_name && e.key() == key)
            .map(|e| e.record().cloned())
    }
}

fn parse_record(line: &str) -> StoreResult<StoredRecord> {
    serde_json::from_str(line).map_err(|e| StoreError::integrity(format!("bad stored record: {e}")))
}

impl Connection for FileConnection {
    fn begin(&mut self) -> StoreResult<()> {
        if self.pending.is_some() {
            return Err(StoreError::illegal_state("transaction already started"));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let Some(pending) = self.pending.take() else {
            return Err(StoreError::illegal_state("no transaction to commit"));
        };
        if pending.is_empty() {
            return Ok(());
        }
        self.send(pending)
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.pending = None;
        Ok(())
    }

    /// 类型目录在首次写入时由服务端创建
    fn has_table(&mut self, _type_name: &str) -> StoreResult<bool> {
        Ok(true)
    }

    fn create_table(&mut self, _type_name: &str) -> StoreResult<()> {
        Ok(())
    }

    fn insert(&mut self, record: &StoredRecord) -> StoreResult<()> {
        self.write(WriteEntry::Create(record.clone()))
    }

    fn update(&mut self, record: &StoredRecord, expected: &Version) -> StoreResult<()> {
        self.write(WriteEntry::Update {
            record: record.clone(),
            expected: expected.sequence(),
        })
    }

    fn delete(
        &mut self,
        type_name: &str,
        key: &PrimaryKey,
        expected: Option<&Version>,
    ) -> StoreResult<()> {
        self.write(WriteEntry::Delete {
            type_name: type_name.to_string(),
            key: key.string_value(),
            expected: expected.map(Version::sequence),
        })
    }

    fn select(&mut self, type_name: &str, key: &PrimaryKey) -> StoreResult<Option<StoredRecord>> {
        if let Some(staged) = self.staged(type_name, key) {
            return Ok(staged);
        }
        let response = self.request(Request::Read {
            type_name: type_name.to_string(),
            key: key.string_value(),
        })?;
        match response {
            Response::NotFound => Ok(None),
            Response::Ok { body, .. } => match body.first() {
                Some(line) => parse_record(line).map(Some),
                None => Err(StoreError::protocol("read response without data")),
            },
            Response::Error { .. } => Err(StoreError::protocol("unexpected error response")),
        }
    }

    fn select_all(&mut self, type_name: &str) -> StoreResult<Vec<StoredRecord>> {
        match self.request(Request::List {
            type_name: type_name.to_string(),
        })? {
            Response::Ok { body, .. } => body.iter().map(String::as_str).map(parse_record).collect(),
            other => Err(StoreError::protocol(format!("unexpected list response {other:?}"))),
        }
    }

    fn count(&mut self, type_name: &str) -> StoreResult<u64> {
        self.value(Request::HasInstances {
            type_name: type_name.to_string(),
        })
    }

    fn reserve_sequence(&mut self, sequence: Sequence, size: u64) -> StoreResult<u64> {
        self.value(Request::NextBatch {
            sequence: sequence.name().to_string(),
            size,
        })
    }

    fn service(&mut self, name: &str) -> StoreResult<Option<String>> {
        match self.request(Request::GetService {
            name: name.to_string(),
        })? {
            Response::NotFound => Ok(None),
            Response::Ok { value: Some(v), .. } => decode_token(&v).map(Some),
            other => Err(StoreError::protocol(format!("unexpected service response {other:?}"))),
        }
    }

    fn save_service(&mut self, name: &str, reference: &str) -> StoreResult<()> {
        self.request(Request::SaveService {
            name: name.to_string(),
            reference: reference.to_string(),
        })
        .map(drop)
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.pending = None;
        self.closed = true;
        self.transport.close()
    }
}

enum Target {
    Tcp {
        addr: SocketAddr,
        config: StoreConfig,
    },
    Local(Arc<FileServer>),
}

pub struct FileConnectionFactory {
    target: Target,
}

impl FileConnectionFactory {
    /// 连接/读取超时取自 `config`
    pub fn tcp(addr: SocketAddr, config: StoreConfig) -> Self {
        Self {
            target: Target::Tcp { addr, config },
        }
    }

    pub fn local(server: Arc<FileServer>) -> Self {
        Self {
            target: Target::Local(server),
        }
    }
}

impl ConnectionFactory for FileConnectionFactory {
    fn open(&self) -> StoreResult<Box<dyn Connection>> {
        let transport: Box<dyn Transport> = match &self.target {
            Target::Tcp { addr, config } => Box::new(TcpTransport::connect(*addr, config)?),
            Target::Local(server) => {
                if server.is_shut_down() {
                    return Err(StoreError::unavailable("file server is shut down"));
                }
                Box::new(LocalTransport::new(server.clone()))
            }
        };
        Ok(Box::new(FileConnection::new(transport)))
    }

    fn describe(&self) -> String {
        match &self.target {
            Target::Tcp { addr, .. } => format!("file server at {addr}"),
            Target::Local(server) => format!("file store in {}", server.directory().display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_domain::mapping::Record;
    use std::net::TcpListener;

    fn record(key: i64, version: &Version) -> StoredRecord {
        StoredRecord::builder()
            .type_name("Widget")
            .key(PrimaryKey::Integer(key))
            .version(version.clone())
            .data(Record::new())
            .build()
    }

    #[test]
    fn writes_are_buffered_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::open(dir.path(), &StoreConfig::default()).unwrap();
        let factory = FileConnectionFactory::local(server);
        let mut writer = factory.open().unwrap();
        let mut reader = factory.open().unwrap();
        let key = PrimaryKey::Integer(1);

        writer.begin().unwrap();
        writer.insert(&record(1, &Version::new("a"))).unwrap();
        assert!(writer.select("Widget", &key).unwrap().is_some());
        assert!(reader.select("Widget", &key).unwrap().is_none());
        writer.commit().unwrap();
        assert_eq!(reader.count("Widget").unwrap(), 1);

        writer.begin().unwrap();
        writer.delete("Widget", &key, None).unwrap();
        assert!(writer.select("Widget", &key).unwrap().is_none());
        writer.rollback().unwrap();
        assert!(reader.select("Widget", &key).unwrap().is_some());
    }

    #[test]
    fn server_errors_map_back() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::open(dir.path(), &StoreConfig::default()).unwrap();
        let mut conn = FileConnectionFactory::local(server).open().unwrap();
        let v1 = Version::new("a");
        conn.insert(&record(1, &v1)).unwrap();

        assert!(matches!(
            conn.insert(&record(1, &v1)),
            Err(StoreError::DuplicateKey { .. })
        ));
        assert!(matches!(
            conn.update(&record(1, &v1.next("b").unwrap().next("b").unwrap()), &v1.next("b").unwrap()),
            Err(StoreError::OptimisticLock {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert!(matches!(
            conn.delete("Widget", &PrimaryKey::Integer(9), None),
            Err(StoreError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn tcp_round_trip_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::open(dir.path(), &StoreConfig::default()).unwrap();
        let handle = server.serve(TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
        let factory = FileConnectionFactory::tcp(handle.local_addr(), StoreConfig::default());

        let mut conn = factory.open().unwrap();
        assert_eq!(conn.reserve_sequence(Sequence::Object, 10).unwrap(), 10);
        conn.save_service("catalog", "Catalog@a b").unwrap();
        assert_eq!(
            conn.service("catalog").unwrap().as_deref(),
            Some("Catalog@a b")
        );
        conn.close().unwrap();
        handle.stop().unwrap();

        // 只接受连接、从不应答的对端
        let silent = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = StoreConfig::builder().read_timeout_ms(100).build();
        let mut transport = TcpTransport::connect(silent.local_addr().unwrap(), &config).unwrap();
        let _peer = silent.accept().unwrap();
        match transport.round_trip(&Request::Status) {
            Err(StoreError::StoreTimeout { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            transport.round_trip(&Request::Status),
            Err(StoreError::StoreUnavailable { .. })
        ));
    }
}
