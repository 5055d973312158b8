//! 文件存储的行协议
//!
//! 请求：首行为单字符命令加空白分隔的头字段，随后是正文行，以空行结束。
//!
//! | 命令 | 头字段                 | 正文                          |
//! |------|------------------------|-------------------------------|
//! | `L`  | 类型                   |                               |
//! | `R`  | 类型 主键              |                               |
//! | `W`  | 条目数                 | 每个条目一行头，C/U 另带一行 JSON |
//! | `I`  | 类型                   |                               |
//! | `S`  | 服务名                 |                               |
//! | `T`  | 服务名 引用串          |                               |
//! | `N`  | 序列名 批大小          |                               |
//! | `X`  |                        |                               |
//!
//! 响应：`ok [值]`、`error <种类> <说明>` 或 `not-found`，随后的正文行同样以空行结束。
//! 头字段中的主键与名称经 `encode_token` 转义，不含空白。
//!
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::mapping::StoredRecord;
use std::fmt::Write as _;
use std::io::BufRead;

const ESCAPE: char = '~';

/// 头字段转义：安全字符原样保留，否则 `~` 加 UTF-8 字节的十六进制
pub fn encode_token(raw: &str) -> String {
    let safe = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if safe {
        return raw.to_string();
    }
    let mut token = String::with_capacity(1 + raw.len() * 2);
    token.push(ESCAPE);
    for byte in raw.as_bytes() {
        let _ = write!(token, "{byte:02x}");
    }
    token
}

pub fn decode_token(token: &str) -> StoreResult<String> {
    let Some(hex) = token.strip_prefix(ESCAPE) else {
        return Ok(token.to_string());
    };
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(StoreError::protocol(format!("malformed escaped token {token:?}")));
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
        .ok_or_else(|| StoreError::protocol(format!("bad escaped token {token:?}")))?;
    String::from_utf8(bytes).map_err(|e| StoreError::protocol(format!("bad escaped token {token:?}: {e}")))
}

/// 写批次中的一个条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEntry {
    Create(StoredRecord),
    Update {
        record: StoredRecord,
        expected: u64,
    },
    Delete {
        type_name: String,
        key: String,
        expected: Option<u64>,
    },
}

impl WriteEntry {
    pub fn type_name(&self) -> &str {
        match self {
            WriteEntry::Create(record) | WriteEntry::Update { record, .. } => record.type_name(),
            WriteEntry::Delete { type_name, .. } => type_name,
        }
    }

    /// 主键的文本形式
    pub fn key(&self) -> String {
        match self {
            WriteEntry::Create(record) | WriteEntry::Update { record, .. } => {
                record.key().string_value()
            }
            WriteEntry::Delete { key, .. } => key.clone(),
        }
    }

    pub fn record(&self) -> Option<&StoredRecord> {
        match self {
            WriteEntry::Create(record) | WriteEntry::Update { record, .. } => Some(record),
            WriteEntry::Delete { .. } => None,
        }
    }

    fn code(&self) -> char {
        match self {
            WriteEntry::Create(_) => 'C',
            WriteEntry::Update { .. } => 'U',
            WriteEntry::Delete { .. } => 'D',
        }
    }

    /// 头行加（C/U 的）数据行
    pub fn encode_lines(&self) -> StoreResult<Vec<String>> {
        let version = self
            .record()
            .and_then(|r| r.version())
            .map_or_else(|| "-".to_string(), |v| v.sequence().to_string());
        let expected = match self {
            WriteEntry::Create(_) => "-".to_string(),
            WriteEntry::Update { expected, .. } => expected.to_string(),
            WriteEntry::Delete { expected, .. } => {
                expected.map_or_else(|| "-".to_string(), |e| e.to_string())
            }
        };
        let mut lines = vec![format!(
            "{} {} {} {version} {expected}",
            self.code(),
            encode_token(self.type_name()),
            encode_token(&self.key())
        )];
        if let Some(record) = self.record() {
            lines.push(serde_json::to_string(record)?);
        }
        Ok(lines)
    }

    /// 从行迭代器中读出一个条目
    pub fn decode_lines<'a>(lines: &mut impl Iterator<Item = &'a str>) -> StoreResult<Self> {
        let header = lines
            .next()
            .ok_or_else(|| StoreError::protocol("missing write entry"))?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        let [code, type_name, key, _version, expected] = fields[..] else {
            return Err(StoreError::protocol(format!("bad write entry {header:?}")));
        };
        let expected = match expected {
            "-" => None,
            n => Some(n.parse::<u64>().map_err(|e| {
                StoreError::protocol(format!("bad expected version in {header:?}: {e}"))
            })?),
        };

        let mut record = || -> StoreResult<StoredRecord> {
            let line = lines
                .next()
                .ok_or_else(|| StoreError::protocol(format!("missing data for {header:?}")))?;
            serde_json::from_str(line)
                .map_err(|e| StoreError::protocol(format!("bad record data: {e}")))
        };

        match code {
            "C" => Ok(WriteEntry::Create(record()?)),
            "U" => Ok(WriteEntry::Update {
                record: record()?,
                expected: expected
                    .ok_or_else(|| StoreError::protocol("update without expected version"))?,
            }),
            "D" => Ok(WriteEntry::Delete {
                type_name: decode_token(type_name)?,
                key: decode_token(key)?,
                expected,
            }),
            other => Err(StoreError::protocol(format!("unknown write code {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    List { type_name: String },
    Read { type_name: String, key: String },
    Write { entries: Vec<WriteEntry> },
    HasInstances { type_name: String },
    GetService { name: String },
    SaveService { name: String, reference: String },
    NextBatch { sequence: String, size: u64 },
    Status,
}

impl Request {
    pub fn code(&self) -> char {
        match self {
            Request::List { .. } => 'L',
            Request::Read { .. } => 'R',
            Request::Write { .. } => 'W',
            Request::HasInstances { .. } => 'I',
            Request::GetService { .. } => 'S',
            Request::SaveService { .. } => 'T',
            Request::NextBatch { .. } => 'N',
            Request::Status => 'X',
        }
    }

    pub fn encode(&self) -> StoreResult<String> {
        let mut header = vec![self.code().to_string()];
        let mut body = Vec::new();
        match self {
            Request::List { type_name } | Request::HasInstances { type_name } => {
                header.push(encode_token(type_name));
            }
            Request::Read { type_name, key } => {
                header.push(encode_token(type_name));
                header.push(encode_token(key));
            }
            Request::Write { entries } => {
                header.push(entries.len().to_string());
                for entry in entries {
                    body.extend(entry.encode_lines()?);
                }
            }
            Request::GetService { name } => header.push(encode_token(name)),
            Request::SaveService { name, reference } => {
                header.push(encode_token(name));
                header.push(encode_token(reference));
            }
            Request::NextBatch { sequence, size } => {
                header.push(encode_token(sequence));
                header.push(size.to_string());
            }
            Request::Status => {}
        }
        Ok(frame(&header.join(" "), &body))
    }

    pub fn decode(lines: &[String]) -> StoreResult<Self> {
        let Some((header, body)) = lines.split_first() else {
            return Err(StoreError::protocol("empty request"));
        };
        let fields: Vec<&str> = header.split_whitespace().collect();
        let Some((code, args)) = fields.split_first() else {
            return Err(StoreError::protocol("empty request header"));
        };
        let arg = |i: usize| -> StoreResult<String> {
            args.get(i)
                .ok_or_else(|| StoreError::protocol(format!("{code}: missing argument {i}")))
                .and_then(|a| decode_token(a))
        };

        let request = match *code {
            "L" => Request::List { type_name: arg(0)? },
            "R" => Request::Read {
                type_name: arg(0)?,
                key: arg(1)?,
            },
            "W" => {
                let count: usize = arg(0)?
                    .parse()
                    .map_err(|e| StoreError::protocol(format!("bad entry count: {e}")))?;
                let mut lines = body.iter().map(String::as_str);
                let entries = (0..count)
                    .map(|_| WriteEntry::decode_lines(&mut lines))
                    .collect::<StoreResult<Vec<_>>>()?;
                if lines.next().is_some() {
                    return Err(StoreError::protocol("trailing lines after write entries"));
                }
                Request::Write { entries }
            }
            "I" => Request::HasInstances { type_name: arg(0)? },
            "S" => Request::GetService { name: arg(0)? },
            "T" => Request::SaveService {
                name: arg(0)?,
                reference: arg(1)?,
            },
            "N" => Request::NextBatch {
                sequence: arg(0)?,
                size: arg(1)?
                    .parse()
                    .map_err(|e| StoreError::protocol(format!("bad batch size: {e}")))?,
            },
            "X" => Request::Status,
            other => return Err(StoreError::protocol(format!("unknown command {other:?}"))),
        };
        Ok(request)
    }
}

/// 错误种类，客户端据此还原 `StoreError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Version,
    Locked,
    Duplicate,
    Missing,
    Protocol,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Version => "version",
            ErrorKind::Locked => "locked",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Missing => "missing",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "version" => ErrorKind::Version,
            "locked" => ErrorKind::Locked,
            "duplicate" => ErrorKind::Duplicate,
            "missing" => ErrorKind::Missing,
            "protocol" => ErrorKind::Protocol,
            "internal" => ErrorKind::Internal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok {
        value: Option<String>,
        body: Vec<String>,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
    NotFound,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok {
            value: None,
            body: Vec::new(),
        }
    }

    pub fn value(value: impl ToString) -> Self {
        Response::Ok {
            value: Some(value.to_string()),
            body: Vec::new(),
        }
    }

    pub fn lines(body: Vec<String>) -> Self {
        Response::Ok { value: None, body }
    }

    /// 服务端错误到线上错误种类与说明
    pub fn from_error(error: &StoreError) -> Self {
        let (kind, detail) = match error {
            StoreError::OptimisticLock {
                reference,
                expected,
                actual,
            } => (
                ErrorKind::Version,
                format!("{} {expected} {actual}", encode_token(reference)),
            ),
            StoreError::LockConflict { reference } => (ErrorKind::Locked, encode_token(reference)),
            StoreError::DuplicateKey { reference } => {
                (ErrorKind::Duplicate, encode_token(reference))
            }
            StoreError::ObjectNotFound { reference } => {
                (ErrorKind::Missing, encode_token(reference))
            }
            StoreError::Protocol { reason } => (ErrorKind::Protocol, reason.clone()),
            other => (ErrorKind::Internal, other.to_string()),
        };
        Response::Error { kind, detail }
    }

    /// 线上错误还原为 `StoreError`
    pub fn into_error(kind: ErrorKind, detail: &str) -> StoreError {
        let mut fields = detail.split_whitespace();
        let reference = fields
            .next()
            .map(|r| decode_token(r).unwrap_or_else(|_| r.to_string()))
            .unwrap_or_default();
        match kind {
            ErrorKind::Version => {
                let mut number = || fields.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                let expected = number();
                let actual = number();
                StoreError::OptimisticLock {
                    reference,
                    expected,
                    actual,
                }
            }
            ErrorKind::Locked => StoreError::LockConflict { reference },
            ErrorKind::Duplicate => StoreError::DuplicateKey { reference },
            ErrorKind::Missing => StoreError::ObjectNotFound { reference },
            ErrorKind::Protocol => StoreError::protocol(detail),
            ErrorKind::Internal => StoreError::unavailable(format!("file server error: {detail}")),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Response::Ok { value: None, body } => frame("ok", body),
            Response::Ok {
                value: Some(value),
                body,
            } => frame(&format!("ok {value}"), body),
            Response::Error { kind, detail } => {
                // 说明只占头行
                let detail = detail.replace(['\r', '\n'], " ");
                frame(&format!("error {} {detail}", kind.name()), &[])
            }
            Response::NotFound => frame("not-found", &[]),
        }
    }

    pub fn decode(lines: &[String]) -> StoreResult<Self> {
        let Some((header, body)) = lines.split_first() else {
            return Err(StoreError::protocol("empty response"));
        };
        let (status, rest) = header
            .split_once(' ')
            .map_or((header.as_str(), None), |(s, r)| (s, Some(r)));
        match status {
            "ok" => Ok(Response::Ok {
                value: rest.map(str::to_string),
                body: body.to_vec(),
            }),
            "not-found" => Ok(Response::NotFound),
            "error" => {
                let (kind, detail) = rest
                    .and_then(|r| {
                        let (k, d) = r.split_once(' ').unwrap_or((r, ""));
                        ErrorKind::parse(k).map(|k| (k, d.to_string()))
                    })
                    .ok_or_else(|| StoreError::protocol(format!("bad error response {header:?}")))?;
                Ok(Response::Error { kind, detail })
            }
            other => Err(StoreError::protocol(format!("unknown response status {other:?}"))),
        }
    }
}

fn frame(header: &str, body: &[String]) -> String {
    let mut out = String::with_capacity(header.len() + 2);
    out.push_str(header);
    out.push('\n');
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// 读一条以空行结束的消息；对端在消息开始前关闭时返回 `None`
pub fn read_message(reader: &mut impl BufRead) -> StoreResult<Option<Vec<String>>> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(StoreError::protocol("connection closed mid-message"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                // 消息之间多余的空行
                continue;
            }
            return Ok(Some(lines));
        }
        lines.push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_domain::key::PrimaryKey;
    use nos_domain::mapping::Record;
    use nos_domain::version::Version;
    use std::io::Cursor;

    fn record(key: &str) -> StoredRecord {
        StoredRecord::builder()
            .type_name("Widget")
            .key(PrimaryKey::String(key.to_string()))
            .version(Version::new("a").next("b").unwrap())
            .data(Record::new())
            .build()
    }

    fn lines(text: &str) -> Vec<String> {
        read_message(&mut Cursor::new(text)).unwrap().unwrap()
    }

    #[test]
    fn tokens_escape_whitespace() {
        assert_eq!(encode_token("Widget@12"), "Widget@12");
        let escaped = encode_token("two words");
        assert!(escaped.starts_with('~'));
        assert!(!escaped.contains(' '));
        assert_eq!(decode_token(&escaped).unwrap(), "two words");
        assert!(decode_token("~zz").is_err());
    }

    #[test]
    fn non_ascii_escaped_token_is_a_protocol_error() {
        assert!(matches!(
            decode_token("~aé1"),
            Err(StoreError::Protocol { .. })
        ));
        assert!(matches!(
            Request::decode(&["R ~aé1 1".to_string()]),
            Err(StoreError::Protocol { .. })
        ));
        assert_eq!(decode_token("~c3a9").unwrap(), "é");
    }

    #[test]
    fn write_batch_wire_shape() {
        let request = Request::Write {
            entries: vec![
                WriteEntry::Update {
                    record: record("a b"),
                    expected: 1,
                },
                WriteEntry::Delete {
                    type_name: "Widget".into(),
                    key: "7".into(),
                    expected: None,
                },
            ],
        };
        let wire = request.encode().unwrap();
        let mut wire_lines = wire.lines();
        assert_eq!(wire_lines.next(), Some("W 2"));
        assert_eq!(wire_lines.next(), Some("U Widget ~612062 2 1"));
        assert!(wire_lines.next().unwrap().starts_with('{'));
        assert_eq!(wire_lines.next(), Some("D Widget 7 - -"));
        assert!(wire.ends_with("\n\n"));

        assert_eq!(Request::decode(&lines(&wire)).unwrap(), request);
    }

    #[test]
    fn malformed_requests_are_protocol_errors() {
        for text in ["Q x\n\n", "R Widget\n\n", "W 1\n\n", "N object-ids many\n\n"] {
            match Request::decode(&lines(text)) {
                Err(StoreError::Protocol { .. }) => {}
                other => panic!("{text:?}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn errors_survive_the_wire() {
        let error = StoreError::OptimisticLock {
            reference: "Widget@1".into(),
            expected: 1,
            actual: 2,
        };
        let wire = Response::from_error(&error).encode();
        assert_eq!(wire, "error version Widget@1 1 2\n\n");
        match Response::decode(&lines(&wire)).unwrap() {
            Response::Error { kind, detail } => match Response::into_error(kind, &detail) {
                StoreError::OptimisticLock {
                    reference,
                    expected,
                    actual,
                } => assert_eq!((reference.as_str(), expected, actual), ("Widget@1", 1, 2)),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_message_handles_eof() {
        let mut empty = Cursor::new("");
        assert!(read_message(&mut empty).unwrap().is_none());
        let mut cut = Cursor::new("ok 1\n");
        assert!(read_message(&mut cut).is_err());
        assert_eq!(Response::decode(&lines("\nnot-found\n\n")).unwrap(), Response::NotFound);
    }
}
