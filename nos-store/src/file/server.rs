//! 文件存储服务端
//!
//! 目录布局：
//!
//! ```text
//! <dir>/<type>/<key-hex>.data   首行 `<C|U> <key-hex> <version>`，随后一行 JSON 记录，以空行结束
//! <dir>/recovery.log            写批次的预写日志
//! <dir>/serials/<name>          序列当前值
//! <dir>/services                服务表，每行 `<name> <reference>`
//! ```
//!
//! `<key-hex>`：整数主键为其十六进制值，序列主键本身即十六进制文本，字符串主键为其 UTF-8 字节的十六进制。
//!
//! 写批次：按排序后的记录标识依次加排他锁（等待有上限），逐条做版本检查，
//! 先把整个批次写入恢复日志并落盘，再更新数据文件，最后清空日志。
//! 打开目录时重放日志中完整的批次，不完整的批次丢弃。
//!
use super::locks::LockManager;
use super::protocol::{Request, Response, WriteEntry, decode_token, encode_token, read_message};
use crate::config::StoreConfig;
use nos_domain::error::{ErrorCategory, StoreError, StoreResult};
use nos_domain::key::{KeyKind, PrimaryKey};
use nos_domain::mapping::StoredRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECOVERY_LOG: &str = "recovery.log";
const SERIALS: &str = "serials";
const SERVICES: &str = "services";
const DATA_EXTENSION: &str = "data";
const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub struct FileServer {
    dir: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
    key_kind: KeyKind,
    /// 同时串行化批次的落盘
    log: Mutex<File>,
    serials: Mutex<()>,
    services: Mutex<()>,
    next_owner: AtomicU64,
    shutting_down: AtomicBool,
}

impl FileServer {
    /// 打开（必要时创建）存储目录并重放恢复日志
    pub fn open(dir: impl Into<PathBuf>, config: &StoreConfig) -> StoreResult<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SERIALS))?;
        let log_path = dir.join(RECOVERY_LOG);
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let server = Self {
            dir,
            locks: LockManager::new(),
            lock_timeout: config.lock_timeout(),
            key_kind: config.key_kind(),
            log: Mutex::new(log),
            serials: Mutex::new(()),
            services: Mutex::new(()),
            next_owner: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        };
        server.recover()?;
        tracing::info!(target: "nos::file", dir = %server.dir.display(), "file server opened");
        Ok(Arc::new(server))
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// 新的锁所有者（一个客户端会话）
    pub fn new_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 处理一个请求；错误转换为 `error` 响应
    pub fn handle(&self, owner: u64, request: Request) -> Response {
        let code = request.code();
        match self.dispatch(owner, request) {
            Ok(response) => response,
            Err(e) => {
                match e.category() {
                    ErrorCategory::Concurrency | ErrorCategory::NotFound => {
                        tracing::debug!(target: "nos::file", owner, %code, error = %e, "request rejected");
                    }
                    _ => tracing::warn!(target: "nos::file", owner, %code, error = %e, "request failed"),
                }
                Response::from_error(&e)
            }
        }
    }

    fn dispatch(&self, owner: u64, request: Request) -> StoreResult<Response> {
        match request {
            Request::List { type_name } => {
                let mut body = Vec::new();
                for key in self.keys(&type_name)? {
                    let _guard = self.locks.read(owner, &lock_id(&type_name, &key), self.lock_timeout)?;
                    if let Some(record) = self.read_record(&type_name, &key)? {
                        body.push(serde_json::to_string(&record)?);
                    }
                }
                Ok(Response::lines(body))
            }
            Request::Read { type_name, key } => {
                let _guard = self.locks.read(owner, &lock_id(&type_name, &key), self.lock_timeout)?;
                match self.read_record(&type_name, &key)? {
                    Some(record) => Ok(Response::lines(vec![serde_json::to_string(&record)?])),
                    None => Ok(Response::NotFound),
                }
            }
            Request::Write { entries } => {
                self.write_batch(owner, entries)?;
                Ok(Response::ok())
            }
            Request::HasInstances { type_name } => Ok(Response::value(self.keys(&type_name)?.len())),
            Request::GetService { name } => {
                let _guard = self.services.lock();
                match self.load_services()?.remove(&name) {
                    Some(reference) => Ok(Response::value(encode_token(&reference))),
                    None => Ok(Response::NotFound),
                }
            }
            Request::SaveService { name, reference } => {
                let _guard = self.services.lock();
                let mut services = self.load_services()?;
                services.insert(name, reference);
                let mut names: Vec<_> = services.into_iter().collect();
                names.sort();
                let text: String = names
                    .iter()
                    .map(|(n, r)| format!("{} {}\n", encode_token(n), encode_token(r)))
                    .collect();
                write_atomically(&self.dir.join(SERVICES), text.as_bytes())?;
                Ok(Response::ok())
            }
            Request::NextBatch { sequence, size } => Ok(Response::value(self.next_batch(&sequence, size)?)),
            Request::Status => Ok(Response::value(format!(
                "{} locks={}",
                if self.is_shut_down() { "stopping" } else { "ready" },
                self.locks.held()
            ))),
        }
    }

    // --- 数据文件 ---

    fn type_dir(&self, type_name: &str) -> PathBuf {
        self.dir.join(encode_token(type_name))
    }

    fn data_path(&self, type_name: &str, key: &str) -> StoreResult<PathBuf> {
        Ok(self
            .type_dir(type_name)
            .join(format!("{}.{DATA_EXTENSION}", key_hex(self.key_kind, key)?)))
    }

    /// 类型目录下所有记录的主键
    fn keys(&self, type_name: &str) -> StoreResult<Vec<String>> {
        let entries = match fs::read_dir(self.type_dir(type_name)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match key_from_hex(self.key_kind, stem) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(target: "nos::file", path = %path.display(), error = %e, "ignoring stray data file");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn read_record(&self, type_name: &str, key: &str) -> StoreResult<Option<StoredRecord>> {
        let path = self.data_path(type_name, key)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        if !matches!(header.split_whitespace().next(), Some("C" | "U")) {
            return Err(StoreError::integrity(format!(
                "{}: bad header {header:?}",
                path.display()
            )));
        }
        let data = lines.next().unwrap_or_default();
        serde_json::from_str(data)
            .map(Some)
            .map_err(|e| StoreError::integrity(format!("{}: {e}", path.display())))
    }

    fn apply(&self, entry: &WriteEntry) -> StoreResult<()> {
        let (type_name, key) = (entry.type_name(), entry.key());
        let path = self.data_path(type_name, &key)?;
        match entry {
            WriteEntry::Create(record) | WriteEntry::Update { record, .. } => {
                let code = if matches!(entry, WriteEntry::Create(_)) { 'C' } else { 'U' };
                let version = record.version().map_or(0, |v| v.sequence());
                let text = format!(
                    "{code} {} {version}\n{}\n\n",
                    key_hex(self.key_kind, &key)?,
                    serde_json::to_string(record)?
                );
                fs::create_dir_all(self.type_dir(type_name))?;
                write_atomically(&path, text.as_bytes())
            }
            WriteEntry::Delete { .. } => match fs::remove_file(&path) {
                // 重放时可能已删除
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other.map_err(Into::into),
            },
        }
    }

    // --- 写批次 ---

    fn write_batch(&self, owner: u64, entries: Vec<WriteEntry>) -> StoreResult<()> {
        if self.is_shut_down() {
            return Err(StoreError::unavailable("file server is shutting down"));
        }
        if entries.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<String> = entries
            .iter()
            .map(|e| lock_id(e.type_name(), &e.key()))
            .collect();
        // 固定加锁顺序，避免批次之间死锁
        ids.sort();
        ids.dedup();
        let _guard = self.locks.write_all(owner, &ids, self.lock_timeout)?;

        self.check_versions(&entries)?;

        let mut log = self.log.lock();
        let mut text = format!("B {}\n", entries.len());
        for entry in &entries {
            for line in entry.encode_lines()? {
                text.push_str(&line);
                text.push('\n');
            }
        }
        text.push_str("E\n");
        log.write_all(text.as_bytes())?;
        log.sync_data()?;

        for entry in &entries {
            self.apply(entry)?;
        }
        log.set_len(0)?;
        log.sync_data()?;
        tracing::debug!(target: "nos::file", owner, entries = entries.len(), "write batch applied");
        Ok(())
    }

    /// 批次内后面的条目看到前面条目的效果
    fn check_versions(&self, entries: &[WriteEntry]) -> StoreResult<()> {
        let mut overlay: HashMap<String, Option<u64>> = HashMap::new();
        for entry in entries {
            let (type_name, key) = (entry.type_name(), entry.key());
            let id = lock_id(type_name, &key);
            let current = match overlay.get(&id) {
                Some(state) => *state,
                None => self
                    .read_record(type_name, &key)?
                    .map(|r| r.version().map_or(0, |v| v.sequence())),
            };
            let reference = format!("{type_name}@{key}");
            let check = |expected: u64, actual: u64| {
                if expected == actual {
                    Ok(())
                } else {
                    Err(StoreError::OptimisticLock {
                        reference: reference.clone(),
                        expected,
                        actual,
                    })
                }
            };

            match (entry, current) {
                (WriteEntry::Create(_), Some(_)) => {
                    return Err(StoreError::DuplicateKey {
                        reference: reference.clone(),
                    });
                }
                (WriteEntry::Update { .. } | WriteEntry::Delete { .. }, None) => {
                    return Err(StoreError::ObjectNotFound {
                        reference: reference.clone(),
                    });
                }
                (WriteEntry::Update { expected, .. }, Some(actual)) => check(*expected, actual)?,
                (WriteEntry::Delete { expected: Some(expected), .. }, Some(actual)) => {
                    check(*expected, actual)?
                }
                _ => {}
            }

            let after = entry
                .record()
                .map(|r| r.version().map_or(0, |v| v.sequence()));
            overlay.insert(id, after);
        }
        Ok(())
    }

    /// 重放恢复日志中完整的批次，然后清空日志
    fn recover(&self) -> StoreResult<()> {
        let text = fs::read_to_string(self.dir.join(RECOVERY_LOG))?;
        if text.trim().is_empty() {
            return Ok(());
        }

        let mut lines = text.lines().filter(|l| !l.is_empty());
        let mut replayed = 0usize;
        let mut discarded = false;
        while let Some(line) = lines.next() {
            let batch = line
                .strip_prefix("B ")
                .and_then(|n| n.trim().parse::<usize>().ok())
                .and_then(|count| {
                    (0..count)
                        .map(|_| WriteEntry::decode_lines(&mut lines).ok())
                        .collect::<Option<Vec<_>>>()
                })
                .filter(|_| lines.next() == Some("E"));
            match batch {
                Some(entries) => {
                    for entry in &entries {
                        self.apply(entry)?;
                    }
                    replayed += 1;
                }
                None => {
                    discarded = true;
                    break;
                }
            }
        }

        let log = self.log.lock();
        log.set_len(0)?;
        log.sync_data()?;
        tracing::info!(target: "nos::file", replayed, discarded, "recovery log replayed");
        Ok(())
    }

    // --- 序列与服务表 ---

    fn next_batch(&self, sequence: &str, size: u64) -> StoreResult<u64> {
        if size == 0 {
            return Err(StoreError::protocol("batch size must be at least 1"));
        }
        let _guard = self.serials.lock();
        let path = self.dir.join(SERIALS).join(encode_token(sequence));
        let current = match fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| StoreError::integrity(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let high = current
            .checked_add(size)
            .ok_or_else(|| StoreError::SequenceExhausted {
                sequence: sequence.to_string(),
                next: current,
                limit: u64::MAX,
            })?;
        write_atomically(&path, format!("{high}\n").as_bytes())?;
        Ok(high)
    }

    fn load_services(&self) -> StoreResult<HashMap<String, String>> {
        let text = match fs::read_to_string(self.dir.join(SERVICES)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(target: "nos::file", "service table not created yet");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let (name, reference) = line
                    .split_once(' ')
                    .ok_or_else(|| StoreError::integrity(format!("bad service entry {line:?}")))?;
                Ok((decode_token(name)?, decode_token(reference)?))
            })
            .collect()
    }

    // --- 网络 ---

    /// 在后台线程接受连接，每个客户端一个线程
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> StoreResult<ServerHandle> {
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let server = Arc::clone(self);
        let accept = thread::Builder::new()
            .name("nos-file-accept".to_string())
            .spawn(move || server.accept_loop(listener))?;
        tracing::info!(target: "nos::file", %addr, "file server listening");
        Ok(ServerHandle {
            addr,
            server: Arc::clone(self),
            accept: Some(accept),
        })
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.is_shut_down() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let owner = self.new_owner();
                    let spawned = thread::Builder::new()
                        .name(format!("nos-file-client-{owner}"))
                        .spawn(move || server.session(owner, peer, stream));
                    if let Err(e) = spawned {
                        tracing::warn!(target: "nos::file", %peer, error = %e, "cannot start client thread");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    tracing::warn!(target: "nos::file", error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        tracing::debug!(target: "nos::file", "accept loop stopped");
    }

    fn session(&self, owner: u64, peer: SocketAddr, stream: TcpStream) {
        tracing::debug!(target: "nos::file", %peer, owner, "client connected");
        if let Err(e) = self.converse(owner, stream) {
            tracing::debug!(target: "nos::file", %peer, owner, error = %e, "client session ended with error");
        }
        tracing::debug!(target: "nos::file", %peer, owner, "client disconnected");
    }

    fn converse(&self, owner: u64, stream: TcpStream) -> StoreResult<()> {
        stream.set_nonblocking(false)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        while let Some(message) = read_message(&mut reader)? {
            let response = match Request::decode(&message) {
                Ok(request) => self.handle(owner, request),
                Err(e) => Response::from_error(&e),
            };
            writer.write_all(response.encode().as_bytes())?;
            writer.flush()?;
        }
        Ok(())
    }

    /// 停止接受写入，并等待所有记录锁释放
    pub fn shutdown(&self) -> StoreResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.locks.drain(self.lock_timeout) {
            Ok(()) => {
                tracing::info!(target: "nos::file", "file server shut down");
                Ok(())
            }
            Err(held) => Err(StoreError::StoreTimeout {
                reason: format!("{held} record locks still held at shutdown"),
            }),
        }
    }
}

/// 正在监听的服务端
pub struct ServerHandle {
    addr: SocketAddr,
    server: Arc<FileServer>,
    accept: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server(&self) -> &Arc<FileServer> {
        &self.server
    }

    pub fn stop(mut self) -> StoreResult<()> {
        let result = self.server.shutdown();
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        result
    }
}

/// 数据文件名中的主键
fn key_hex(kind: KeyKind, key: &str) -> StoreResult<String> {
    match PrimaryKey::parse(kind, key)? {
        PrimaryKey::Integer(v) => Ok(format!("{v:x}")),
        PrimaryKey::Serial(v) => Ok(format!("{v:x}")),
        PrimaryKey::String(v) => Ok(v.bytes().map(|b| format!("{b:02x}")).collect()),
    }
}

fn key_from_hex(kind: KeyKind, hex: &str) -> StoreResult<String> {
    let malformed = |reason: &str| StoreError::MalformedKey {
        input: hex.to_string(),
        reason: reason.to_string(),
    };
    if hex.is_empty() || !hex.is_ascii() {
        return Err(malformed("not a hex file name"));
    }
    match kind {
        KeyKind::Integer => u64::from_str_radix(hex, 16)
            .map(|v| (v as i64).to_string())
            .map_err(|e| malformed(&e.to_string())),
        KeyKind::Serial => u64::from_str_radix(hex, 16)
            .map(|v| format!("{v:x}"))
            .map_err(|e| malformed(&e.to_string())),
        KeyKind::String => {
            if hex.len() % 2 != 0 {
                return Err(malformed("odd number of hex digits"));
            }
            let bytes = hex
                .as_bytes()
                .chunks(2)
                .map(|pair| {
                    std::str::from_utf8(pair)
                        .ok()
                        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed("bad hex digits"))?;
            String::from_utf8(bytes).map_err(|e| malformed(&e.to_string()))
        }
    }
}

fn lock_id(type_name: &str, key: &str) -> String {
    format!("{}/{}", encode_token(type_name), encode_token(key))
}

/// 先写临时文件再改名
fn write_atomically(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
