//! Minimal in-memory 9P servers backing the client and file-system tests.
//!
//! `scripted` drives a connection from a closure, one incoming message at a
//! time; [`MemFs`] is a small tree-in-a-HashMap server speaking enough of
//! the protocol to exercise every client operation.

use {
    crate::{
        fcall::*,
        serialize::{self, Encodable},
    },
    bytes::{BytesMut, buf::BufMut},
    futures::sink::SinkExt,
    std::{collections::HashMap, io::Cursor},
    tokio::io::DuplexStream,
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// Serve one connection from a closure. Returning `None` hangs up;
/// returning several messages sends them back to back.
pub(crate) fn scripted<F>(mut handle: F) -> DuplexStream
where
    F: FnMut(Msg) -> Option<Vec<Msg>> + Send + 'static,
{
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let (r, w) = tokio::io::split(server);
        let mut reader = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(r);
        let mut writer = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(w);
        while let Some(Ok(frame)) = reader.next().await {
            let Ok(msg) = serialize::read_msg(&mut Cursor::new(&frame[..])) else {
                continue;
            };
            let Some(replies) = handle(msg) else {
                return;
            };
            for reply in replies {
                let mut buf = BytesMut::with_capacity(reply.size() as usize).writer();
                serialize::write_msg(&mut buf, &reply).unwrap();
                if writer.send(buf.into_inner().freeze()).await.is_err() {
                    return;
                }
            }
        }
    });
    client
}

struct Node {
    qid: QId,
    mode: u32,
    content: Vec<u8>,
}

/// A tiny single-connection 9P server over an in-memory file tree.
pub(crate) struct MemFs {
    nodes: HashMap<String, Node>,
    fids: HashMap<u32, String>,
    qidgen: u64,
}

impl MemFs {
    pub(crate) fn new() -> MemFs {
        let mut fs = MemFs {
            nodes: HashMap::new(),
            fids: HashMap::new(),
            qidgen: 0,
        };
        fs.insert("/", true, Vec::new());
        fs
    }

    pub(crate) fn add_dir(&mut self, path: &str) {
        self.insert(path, true, Vec::new());
    }

    pub(crate) fn add_file(&mut self, path: &str, content: &[u8]) {
        self.insert(path, false, content.to_vec());
    }

    pub(crate) fn serve(mut self) -> DuplexStream {
        scripted(move |msg| Some(vec![self.dispatch(msg)]))
    }

    fn insert(&mut self, path: &str, dir: bool, content: Vec<u8>) {
        self.qidgen += 1;
        let qid = QId {
            typ: if dir { QIdType::DIR } else { QIdType::FILE },
            version: 0,
            path: self.qidgen,
        };
        let mode = if dir { dm::DIR | 0o755 } else { 0o644 };
        self.nodes.insert(path.to_owned(), Node { qid, mode, content });
    }

    fn stat_of(&self, path: &str) -> Stat {
        let node = &self.nodes[path];
        let name = if path == "/" {
            "/".to_owned()
        } else {
            path.rsplit('/').next().unwrap().to_owned()
        };
        Stat {
            typ: 0,
            dev: 0,
            qid: node.qid,
            mode: node.mode,
            atime: 0,
            mtime: 0,
            length: if node.qid.is_dir() {
                0
            } else {
                node.content.len() as u64
            },
            name,
            uid: "styx".to_owned(),
            gid: "styx".to_owned(),
            muid: "styx".to_owned(),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_owned()
        } else {
            format!("{}/", dir)
        };
        let mut v: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| {
                p.starts_with(&prefix) && p.as_str() != "/" && !p[prefix.len()..].contains('/')
            })
            .cloned()
            .collect();
        v.sort();
        v
    }

    fn dispatch(&mut self, msg: Msg) -> Msg {
        let tag = msg.tag;
        let body = self.reply(msg.body).unwrap_or_else(|e| FCall::RError {
            ename: e.to_owned(),
        });
        Msg { tag, body }
    }

    fn reply(&mut self, t: FCall) -> std::result::Result<FCall, &'static str> {
        Ok(match t {
            FCall::TVersion { msize, version } => FCall::RVersion {
                msize: msize.min(MAXRPC),
                version: if version.starts_with("9P") {
                    P92000.to_owned()
                } else {
                    VERSION_UNKNOWN.to_owned()
                },
            },
            FCall::TAuth { .. } => return Err("authentication not required"),
            FCall::TAttach { fid, .. } => {
                self.fids.insert(fid, "/".to_owned());
                FCall::RAttach {
                    qid: self.nodes["/"].qid,
                }
            }
            FCall::TFlush { .. } => FCall::RFlush,
            FCall::TWalk { fid, newfid, wnames } => {
                let mut path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                let mut wqids = Vec::new();
                for (i, name) in wnames.iter().enumerate() {
                    if !self.nodes[&path].qid.is_dir() {
                        if i == 0 {
                            return Err("not a directory");
                        }
                        return Ok(FCall::RWalk { wqids });
                    }
                    let next = if name == ".." {
                        parent_of(&path)
                    } else if path == "/" {
                        format!("/{}", name)
                    } else {
                        format!("{}/{}", path, name)
                    };
                    match self.nodes.get(&next) {
                        Some(node) => {
                            wqids.push(node.qid);
                            path = next;
                        }
                        None => {
                            if i == 0 {
                                return Err("does not exist");
                            }
                            return Ok(FCall::RWalk { wqids });
                        }
                    }
                }
                self.fids.insert(newfid, path);
                FCall::RWalk { wqids }
            }
            FCall::TOpen { fid, mode } => {
                let path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                let node = self.nodes.get_mut(&path).ok_or("does not exist")?;
                if mode & om::TRUNC != 0 && !node.qid.is_dir() {
                    node.content.clear();
                }
                FCall::ROpen {
                    qid: node.qid,
                    iounit: 0,
                }
            }
            FCall::TCreate {
                fid,
                name,
                perm,
                mode: _,
            } => {
                let dir = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                if !self.nodes[&dir].qid.is_dir() {
                    return Err("not a directory");
                }
                let path = if dir == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", dir, name)
                };
                if self.nodes.contains_key(&path) {
                    return Err("file already exists");
                }
                self.insert(&path, perm & dm::DIR != 0, Vec::new());
                self.fids.insert(fid, path.clone());
                FCall::RCreate {
                    qid: self.nodes[&path].qid,
                    iounit: 0,
                }
            }
            FCall::TRead { fid, offset, count } => {
                let path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                if self.nodes[&path].qid.is_dir() {
                    // whole stat records only, from a record boundary
                    let mut data = Vec::new();
                    let mut pos: u64 = 0;
                    for child in self.children(&path) {
                        let mut rec = Vec::new();
                        self.stat_of(&child).encode(&mut rec).unwrap();
                        if pos < offset {
                            pos += rec.len() as u64;
                            continue;
                        }
                        if data.len() + rec.len() > count as usize {
                            break;
                        }
                        pos += rec.len() as u64;
                        data.extend_from_slice(&rec);
                    }
                    FCall::RRead { data: Data(data) }
                } else {
                    let content = &self.nodes[&path].content;
                    let start = (offset as usize).min(content.len());
                    let end = (offset as usize + count as usize).min(content.len());
                    FCall::RRead {
                        data: Data(content[start..end].to_vec()),
                    }
                }
            }
            FCall::TWrite { fid, offset, data } => {
                let path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                let node = self.nodes.get_mut(&path).ok_or("does not exist")?;
                if node.qid.is_dir() {
                    return Err("file is a directory");
                }
                let off = offset as usize;
                if node.content.len() < off + data.0.len() {
                    node.content.resize(off + data.0.len(), 0);
                }
                node.content[off..off + data.0.len()].copy_from_slice(&data.0);
                node.qid.version += 1;
                FCall::RWrite {
                    count: data.0.len() as u32,
                }
            }
            FCall::TClunk { fid } => {
                self.fids.remove(&fid).ok_or("unknown fid")?;
                FCall::RClunk
            }
            FCall::TRemove { fid } => {
                let path = self.fids.remove(&fid).ok_or("unknown fid")?;
                self.nodes.remove(&path).ok_or("does not exist")?;
                FCall::RRemove
            }
            FCall::TStat { fid } => {
                let path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                if !self.nodes.contains_key(&path) {
                    return Err("does not exist");
                }
                FCall::RStat {
                    stat: self.stat_of(&path),
                }
            }
            FCall::TWStat { fid, stat } => {
                let path = self.fids.get(&fid).ok_or("unknown fid")?.clone();
                let node = self.nodes.get_mut(&path).ok_or("does not exist")?;
                if stat.mode != !0 {
                    node.mode = stat.mode;
                }
                FCall::RWStat
            }
            _ => return Err("invalid message"),
        })
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => path[..i].to_owned(),
    }
}
