//! Client requests

use crate::error::{ProtoError, ProtoResult};
use crate::header::{MessageType, RequestType};
use crate::wire::{
    get_bool, get_count, get_opt_string, get_opt_u64, get_string, get_string_list, get_u8,
    get_u32, get_u64, put_count, put_opt_string, put_opt_u64, put_string, put_string_list,
};
use bytes::{Buf, BufMut};
use tapestage_common::{RequestKind, Requester};

/// Who sent a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub requester: Requester,
    pub host: String,
    pub pid: u32,
}

impl ClientInfo {
    fn encode(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.requester.user);
        put_string(buf, &self.requester.group);
        buf.put_u32(self.requester.uid);
        buf.put_u32(self.requester.gid);
        put_string(buf, &self.host);
        buf.put_u32(self.pid);
    }

    fn decode(buf: &mut impl Buf) -> ProtoResult<Self> {
        let user = get_string(buf, "user")?;
        let group = get_string(buf, "group")?;
        let uid = get_u32(buf, "uid")?;
        let gid = get_u32(buf, "gid")?;
        let host = get_string(buf, "host")?;
        let pid = get_u32(buf, "pid")?;
        Ok(Self {
            requester: Requester::new(user, group, uid, gid),
            host,
            pid,
        })
    }
}

/// Tape volume and file positions of a stage request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapeSpec {
    pub vid: String,
    pub side: u8,
    pub label: String,
    /// File sequence list, e.g. `1-3,5`, `u2` or `7-`
    pub fseq: String,
    /// File ids, one per file when `fseq` uses `u`
    pub fids: Vec<String>,
}

/// One file of an HSM stage request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HsmFileSpec {
    pub path: String,
    pub server: String,
    pub file_id: u64,
    pub file_class: u32,
    pub foreign: bool,
}

/// Where the files of a stage request come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageSource {
    /// Plain disk allocation
    None,
    Tape(TapeSpec),
    Disk { paths: Vec<String> },
    Hsm { files: Vec<HsmFileSpec> },
}

impl StageSource {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::None => buf.put_u8(0),
            Self::Tape(tape) => {
                buf.put_u8(1);
                put_string(buf, &tape.vid);
                buf.put_u8(tape.side);
                put_string(buf, &tape.label);
                put_string(buf, &tape.fseq);
                put_string_list(buf, &tape.fids);
            }
            Self::Disk { paths } => {
                buf.put_u8(2);
                put_string_list(buf, paths);
            }
            Self::Hsm { files } => {
                buf.put_u8(3);
                put_count(buf, files.len());
                for file in files {
                    put_string(buf, &file.path);
                    put_string(buf, &file.server);
                    buf.put_u64(file.file_id);
                    buf.put_u32(file.file_class);
                    buf.put_u8(u8::from(file.foreign));
                }
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> ProtoResult<Self> {
        Ok(match get_u8(buf, "source")? {
            0 => Self::None,
            1 => Self::Tape(TapeSpec {
                vid: get_string(buf, "vid")?,
                side: get_u8(buf, "side")?,
                label: get_string(buf, "label")?,
                fseq: get_string(buf, "fseq")?,
                fids: get_string_list(buf, "fids")?,
            }),
            2 => Self::Disk {
                paths: get_string_list(buf, "disk paths")?,
            },
            3 => {
                let count = get_count(buf, "hsm files")?;
                let mut files = Vec::with_capacity(count);
                for _ in 0..count {
                    files.push(HsmFileSpec {
                        path: get_string(buf, "hsm path")?,
                        server: get_string(buf, "hsm server")?,
                        file_id: get_u64(buf, "hsm file id")?,
                        file_class: get_u32(buf, "hsm file class")?,
                        foreign: get_bool(buf, "hsm foreign")?,
                    });
                }
                Self::Hsm { files }
            }
            other => return Err(ProtoError::Malformed(format!("unknown source tag {other}"))),
        })
    }
}

/// stage-in, stage-out, stage-write, stage-alloc and stage-catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageRequest {
    pub kind: RequestKind,
    pub client: ClientInfo,
    /// Pool name, empty for the default, `NOPOOL` for none
    pub pool: String,
    /// Requested size in bytes, 0 lets the stager pick the default
    pub size: u64,
    /// Suppress informational lines
    pub silent: bool,
    /// Mark recalled files read-only
    pub read_only: bool,
    pub source: StageSource,
    /// Visible paths, one per file
    pub user_paths: Vec<String>,
}

impl StageRequest {
    const fn request_type(&self) -> RequestType {
        match self.kind {
            RequestKind::StageIn => RequestType::StageIn,
            RequestKind::StageOut => RequestType::StageOut,
            RequestKind::StageWrite => RequestType::StageWrite,
            RequestKind::StageAlloc => RequestType::Alloc,
            RequestKind::StageCatalogued => RequestType::Catalog,
            RequestKind::StagePut => RequestType::StagePut,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        self.client.encode(buf);
        put_string(buf, &self.pool);
        buf.put_u64(self.size);
        buf.put_u8(u8::from(self.silent));
        buf.put_u8(u8::from(self.read_only));
        self.source.encode(buf);
        put_string_list(buf, &self.user_paths);
    }

    fn decode(kind: RequestKind, buf: &mut impl Buf) -> ProtoResult<Self> {
        Ok(Self {
            kind,
            client: ClientInfo::decode(buf)?,
            pool: get_string(buf, "pool")?,
            size: get_u64(buf, "size")?,
            silent: get_bool(buf, "silent")?,
            read_only: get_bool(buf, "read_only")?,
            source: StageSource::decode(buf)?,
            user_paths: get_string_list(buf, "user paths")?,
        })
    }
}

/// Start migration of written files
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutRequest {
    pub client: ClientInfo,
    pub user_paths: Vec<String>,
    pub hsm_paths: Vec<String>,
}

/// Catalog listing filter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub pool: Option<String>,
    pub path: Option<String>,
    pub reqid: Option<u32>,
    pub vid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub client: ClientInfo,
    pub filter: QueryFilter,
    /// Append pool statistics
    pub stats: bool,
}

/// What a clear request removes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearSelector {
    Path(String),
    ReqId(u32),
    Tape { vid: String, fseq: String },
    Pool(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClearRequest {
    pub client: ClientInfo,
    pub selector: ClearSelector,
    /// Remove entries even when a request is working on them
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KillRequest {
    pub client: ClientInfo,
    /// Process id of the client call to kill; 0 means the sender itself
    pub target_pid: u32,
    /// Unique id returned to API clients; 0 when killing by pid
    pub unique_id: u64,
}

/// End of a client write session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRequest {
    pub client: ClientInfo,
    pub user_path: String,
    /// Bytes written, probed from the file when absent
    pub actual_size: Option<u64>,
}

/// init and shutdown
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminRequest {
    pub client: ClientInfo,
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub client: ClientInfo,
    pub user_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChangeRequest {
    pub client: ClientInfo,
    pub user_path: String,
    pub retention_secs: Option<u64>,
    pub migration_delay_secs: Option<u64>,
}

/// Decoded client request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Stage(StageRequest),
    Put(PutRequest),
    Query(QueryRequest),
    Clear(ClearRequest),
    Kill(KillRequest),
    Update(UpdateRequest),
    Init(AdminRequest),
    Get(GetRequest),
    FileChange(FileChangeRequest),
    Shutdown(AdminRequest),
    Ping(ClientInfo),
}

impl Request {
    #[must_use]
    pub const fn request_type(&self) -> RequestType {
        match self {
            Self::Stage(r) => r.request_type(),
            Self::Put(_) => RequestType::StagePut,
            Self::Query(_) => RequestType::Query,
            Self::Clear(_) => RequestType::Clear,
            Self::Kill(_) => RequestType::Kill,
            Self::Update(_) => RequestType::UpdateCallback,
            Self::Init(_) => RequestType::Init,
            Self::Get(_) => RequestType::Get,
            Self::FileChange(_) => RequestType::FileChange,
            Self::Shutdown(_) => RequestType::Shutdown,
            Self::Ping(_) => RequestType::Ping,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &ClientInfo {
        match self {
            Self::Stage(r) => &r.client,
            Self::Put(r) => &r.client,
            Self::Query(r) => &r.client,
            Self::Clear(r) => &r.client,
            Self::Kill(r) => &r.client,
            Self::Update(r) => &r.client,
            Self::Init(r) | Self::Shutdown(r) => &r.client,
            Self::Get(r) => &r.client,
            Self::FileChange(r) => &r.client,
            Self::Ping(c) => c,
        }
    }

    pub fn encode_body(&self, buf: &mut impl BufMut) {
        match self {
            Self::Stage(r) => r.encode(buf),
            Self::Put(r) => {
                r.client.encode(buf);
                put_string_list(buf, &r.user_paths);
                put_string_list(buf, &r.hsm_paths);
            }
            Self::Query(r) => {
                r.client.encode(buf);
                put_opt_string(buf, r.filter.pool.as_deref());
                put_opt_string(buf, r.filter.path.as_deref());
                put_opt_u64(buf, r.filter.reqid.map(u64::from));
                put_opt_string(buf, r.filter.vid.as_deref());
                buf.put_u8(u8::from(r.stats));
            }
            Self::Clear(r) => {
                r.client.encode(buf);
                match &r.selector {
                    ClearSelector::Path(path) => {
                        buf.put_u8(0);
                        put_string(buf, path);
                    }
                    ClearSelector::ReqId(id) => {
                        buf.put_u8(1);
                        buf.put_u32(*id);
                    }
                    ClearSelector::Tape { vid, fseq } => {
                        buf.put_u8(2);
                        put_string(buf, vid);
                        put_string(buf, fseq);
                    }
                    ClearSelector::Pool(pool) => {
                        buf.put_u8(3);
                        put_string(buf, pool);
                    }
                }
                buf.put_u8(u8::from(r.force));
            }
            Self::Kill(r) => {
                r.client.encode(buf);
                buf.put_u32(r.target_pid);
                buf.put_u64(r.unique_id);
            }
            Self::Update(r) => {
                r.client.encode(buf);
                put_string(buf, &r.user_path);
                put_opt_u64(buf, r.actual_size);
            }
            Self::Init(r) | Self::Shutdown(r) => {
                r.client.encode(buf);
                buf.put_u8(u8::from(r.force));
            }
            Self::Get(r) => {
                r.client.encode(buf);
                put_string(buf, &r.user_path);
            }
            Self::FileChange(r) => {
                r.client.encode(buf);
                put_string(buf, &r.user_path);
                put_opt_u64(buf, r.retention_secs);
                put_opt_u64(buf, r.migration_delay_secs);
            }
            Self::Ping(client) => client.encode(buf),
        }
    }

    pub fn decode_body(request_type: RequestType, buf: &mut impl Buf) -> ProtoResult<Self> {
        let request = match request_type {
            RequestType::StageIn => Self::Stage(StageRequest::decode(RequestKind::StageIn, buf)?),
            RequestType::StageOut => {
                Self::Stage(StageRequest::decode(RequestKind::StageOut, buf)?)
            }
            RequestType::StageWrite => {
                Self::Stage(StageRequest::decode(RequestKind::StageWrite, buf)?)
            }
            RequestType::Alloc => Self::Stage(StageRequest::decode(RequestKind::StageAlloc, buf)?),
            RequestType::Catalog => {
                Self::Stage(StageRequest::decode(RequestKind::StageCatalogued, buf)?)
            }
            RequestType::StagePut => Self::Put(PutRequest {
                client: ClientInfo::decode(buf)?,
                user_paths: get_string_list(buf, "user paths")?,
                hsm_paths: get_string_list(buf, "hsm paths")?,
            }),
            RequestType::Query => {
                let client = ClientInfo::decode(buf)?;
                let pool = get_opt_string(buf, "pool")?;
                let path = get_opt_string(buf, "path")?;
                let reqid = get_opt_u64(buf, "reqid")?
                    .map(|id| {
                        u32::try_from(id)
                            .map_err(|_| ProtoError::Malformed(format!("reqid {id} out of range")))
                    })
                    .transpose()?;
                let vid = get_opt_string(buf, "vid")?;
                Self::Query(QueryRequest {
                    client,
                    filter: QueryFilter {
                        pool,
                        path,
                        reqid,
                        vid,
                    },
                    stats: get_bool(buf, "stats")?,
                })
            }
            RequestType::Clear => {
                let client = ClientInfo::decode(buf)?;
                let selector = match get_u8(buf, "selector")? {
                    0 => ClearSelector::Path(get_string(buf, "path")?),
                    1 => ClearSelector::ReqId(get_u32(buf, "reqid")?),
                    2 => ClearSelector::Tape {
                        vid: get_string(buf, "vid")?,
                        fseq: get_string(buf, "fseq")?,
                    },
                    3 => ClearSelector::Pool(get_string(buf, "pool")?),
                    other => {
                        return Err(ProtoError::Malformed(format!(
                            "unknown clear selector {other}"
                        )));
                    }
                };
                Self::Clear(ClearRequest {
                    client,
                    selector,
                    force: get_bool(buf, "force")?,
                })
            }
            RequestType::Kill => Self::Kill(KillRequest {
                client: ClientInfo::decode(buf)?,
                target_pid: get_u32(buf, "pid")?,
                unique_id: get_u64(buf, "unique id")?,
            }),
            RequestType::UpdateCallback => Self::Update(UpdateRequest {
                client: ClientInfo::decode(buf)?,
                user_path: get_string(buf, "path")?,
                actual_size: get_opt_u64(buf, "size")?,
            }),
            RequestType::Init => Self::Init(AdminRequest {
                client: ClientInfo::decode(buf)?,
                force: get_bool(buf, "force")?,
            }),
            RequestType::Shutdown => Self::Shutdown(AdminRequest {
                client: ClientInfo::decode(buf)?,
                force: get_bool(buf, "force")?,
            }),
            RequestType::Get => Self::Get(GetRequest {
                client: ClientInfo::decode(buf)?,
                user_path: get_string(buf, "path")?,
            }),
            RequestType::FileChange => Self::FileChange(FileChangeRequest {
                client: ClientInfo::decode(buf)?,
                user_path: get_string(buf, "path")?,
                retention_secs: get_opt_u64(buf, "retention")?,
                migration_delay_secs: get_opt_u64(buf, "migration delay")?,
            }),
            RequestType::Ping => Self::Ping(ClientInfo::decode(buf)?),
        };
        if buf.has_remaining() {
            return Err(ProtoError::Malformed(format!(
                "{} trailing bytes after {}",
                buf.remaining(),
                request_type.name()
            )));
        }
        Ok(request)
    }
}

/// A request together with the protocol revision it arrived with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub magic: u32,
    pub api: bool,
    pub request: Request,
}

impl RequestFrame {
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        MessageType {
            request: self.request.request_type(),
            api: self.api,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn client() -> ClientInfo {
        ClientInfo {
            requester: Requester::new("alice", "phys", 1001, 100),
            host: "lxplus01".into(),
            pid: 4242,
        }
    }

    fn reencode(request: &Request) -> Request {
        let mut buf = BytesMut::new();
        request.encode_body(&mut buf);
        Request::decode_body(request.request_type(), &mut buf).unwrap()
    }

    #[test]
    fn test_stage_in_tape_request() {
        let request = Request::Stage(StageRequest {
            kind: RequestKind::StageIn,
            client: client(),
            pool: "default".into(),
            size: 0,
            silent: false,
            read_only: true,
            source: StageSource::Tape(TapeSpec {
                vid: "T00001".into(),
                side: 0,
                label: "al".into(),
                fseq: "1-3".into(),
                fids: vec![],
            }),
            user_paths: vec!["/data/a".into(), "/data/b".into(), "/data/c".into()],
        });
        assert_eq!(reencode(&request), request);
        assert_eq!(request.request_type(), RequestType::StageIn);
    }

    #[test]
    fn test_catalog_kind_follows_request_type() {
        let request = Request::Stage(StageRequest {
            kind: RequestKind::StageCatalogued,
            client: client(),
            pool: String::new(),
            size: 10,
            silent: true,
            read_only: false,
            source: StageSource::Hsm {
                files: vec![HsmFileSpec {
                    path: "/hsm/exp/f1".into(),
                    server: "ns01".into(),
                    file_id: 77,
                    file_class: 2,
                    foreign: false,
                }],
            },
            user_paths: vec!["/srv/stage1/f1".into()],
        });
        assert_eq!(request.request_type(), RequestType::Catalog);
        assert_eq!(reencode(&request), request);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        Request::Ping(client()).encode_body(&mut buf);
        buf.put_u8(9);
        assert!(matches!(
            Request::decode_body(RequestType::Ping, &mut buf),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_clear_selector() {
        let mut buf = BytesMut::new();
        client().encode(&mut buf);
        buf.put_u8(9);
        assert!(Request::decode_body(RequestType::Clear, &mut buf).is_err());
    }
}
