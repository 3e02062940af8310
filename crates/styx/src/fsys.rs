//! File-system and file-level access to an attached 9P tree.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        client::Conn,
        error::Error,
        fcall::*,
        serialize::Decodable,
        utils::Result,
    },
    log::trace,
    std::{
        io::{Cursor, SeekFrom},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
    },
};

// arbitrary value bigger than the largest single directory entry
const DIRREAD: u32 = 4096;

const EPROTO: &str = "mismatched 9P reply";

fn proto() -> Error {
    Error::Proto(EPROTO.to_owned())
}

/// A parsed path: `.` components squeezed out, `..` left for the server.
struct Parse {
    els: Vec<String>,
    abs: bool,
}

impl Parse {
    fn new(name: &str) -> Parse {
        Parse {
            abs: name.starts_with('/'),
            els: name
                .split('/')
                .filter(|s| !s.is_empty() && *s != ".")
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// Join a path element onto a tracked name; `..` pops a segment lexically.
fn add_name(base: &str, elem: &str) -> String {
    if elem == ".." {
        return match base.rfind('/') {
            Some(i) if i > 0 => base[..i].to_owned(),
            _ => "/".to_owned(),
        };
    }
    if base.is_empty() || !base.ends_with('/') {
        format!("{}/{}", base, elem)
    } else {
        format!("{}{}", base, elem)
    }
}

fn open_mode(mode: u8) -> u8 {
    let m = mode & 3;
    if m == om::EXEC { om::READ } else { m }
}

/// An attached file system (file tree) on a 9P connection.
///
/// `Fsys` provides operations to access and change the file system using
/// hierarchical names: create, open, stat, wstat, remove, chdir and getwd.
/// All but chdir and getwd apply to all file types including directories;
/// chdir and getwd are restricted to directories.
///
/// Create and open access named files for I/O, returning [`File`] instances.
/// Absolute names resolve from the tree root; relative names resolve from
/// the current directory once one has been set with
/// [`chdir`](Fsys::chdir).
pub struct Fsys {
    conn: Conn,
    root: Arc<File>,
    dot: Mutex<Option<Arc<File>>>,
    closed: AtomicBool,
}

impl Fsys {
    pub(crate) fn new(conn: Conn, root: File) -> Fsys {
        Fsys {
            conn,
            root: Arc::new(root),
            dot: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the file `name` with the given open mode (eg, [`om::READ`],
    /// [`om::WRITE`], or [`om::RDWR`]) for subsequent file I/O.
    pub async fn open(&self, name: &str, mode: u8) -> Result<File> {
        let p = Parse::new(name);
        let fd = self.walk_path(&p).await?;
        match self.conn.rpc(FCall::TOpen { fid: fd.fid(), mode }).await {
            Ok(FCall::ROpen { qid, iounit }) => {
                let name = fd.path().to_owned();
                let fid = fd.take_fid();
                Ok(File::opened(
                    self.conn.clone(),
                    fid,
                    qid,
                    open_mode(mode),
                    iounit,
                    name,
                ))
            }
            Ok(_) => {
                fd.close().await;
                Err(proto())
            }
            Err(e) => {
                fd.close().await;
                Err(e)
            }
        }
    }

    /// Create the file `name` if it does not exist, or truncate it if it
    /// does, then open it with the given open mode. If the file had to be
    /// created, its permissions are set to `perm`; otherwise `perm` is
    /// ignored. A create refused because another client created the file
    /// first is absorbed by retrying the open.
    pub async fn create(&self, name: &str, mode: u8, perm: u32) -> Result<File> {
        let p = Parse::new(name);
        let Some((entry, penult)) = p.els.split_last() else {
            return Err(Error::Exists);
        };
        let from = self.walk_from(&p);
        let fd = self.walk(&from, penult, p.abs).await?;

        // the entry may already exist
        match self.open_trunc(&fd, entry, mode).await {
            Ok(Some(file)) => return Ok(file),
            Ok(None) => {}
            Err(e) => {
                fd.close().await;
                return Err(e);
            }
        }

        // must create
        match self
            .conn
            .rpc(FCall::TCreate {
                fid: fd.fid(),
                name: entry.clone(),
                perm,
                mode,
            })
            .await
        {
            Ok(FCall::RCreate { qid, iounit }) => {
                let name = add_name(fd.path(), entry);
                let fid = fd.take_fid();
                Ok(File::opened(
                    self.conn.clone(),
                    fid,
                    qid,
                    open_mode(mode),
                    iounit,
                    name,
                ))
            }
            Ok(_) => {
                fd.close().await;
                Err(proto())
            }
            Err(create_err) => {
                // to allow for a create/create race, attempt a second open
                match self.open_trunc(&fd, entry, mode).await {
                    Ok(Some(file)) => Ok(file),
                    _ => {
                        fd.close().await;
                        // restore the original diagnostic
                        Err(create_err)
                    }
                }
            }
        }
    }

    /// Return the directory information for the named file.
    pub async fn stat(&self, name: &str) -> Result<Stat> {
        let p = Parse::new(name);
        let fd = self.walk_path(&p).await?;
        let r = fd.stat().await;
        fd.close().await;
        r
    }

    /// Update the directory information for the named file.
    ///
    /// The [`Stat`] parameter has a special form: fields that should not
    /// change carry the file's original values or the "don't care" values of
    /// [`Stat::nulldir`].
    pub async fn wstat(&self, name: &str, stat: &Stat) -> Result<()> {
        let p = Parse::new(name);
        let fd = self.walk_path(&p).await?;
        let r = fd.wstat(stat).await;
        fd.close().await;
        r
    }

    /// Remove the named file.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let p = Parse::new(name);
        let fd = self.walk_path(&p).await?;
        let r = match self.conn.rpc(FCall::TRemove { fid: fd.fid() }).await {
            Ok(FCall::RRemove) => Ok(()),
            Ok(_) => Err(proto()),
            Err(e) => Err(e),
        };
        // TRemove clunks the fid server-side even when the remove fails
        self.conn.free_fid(fd.take_fid());
        r
    }

    /// Set the current directory to the named directory. Relative names in
    /// later operations resolve from it. The previous current directory is
    /// released once the new one is installed.
    pub async fn chdir(&self, name: &str) -> Result<()> {
        let p = Parse::new(name);
        let fd = self.walk_path(&p).await?;
        if !fd.qid().is_dir() {
            let path = fd.path().to_owned();
            fd.close().await;
            return Err(Error::NotDir(path));
        }
        let old = self.dot.lock().unwrap().replace(Arc::new(fd));
        if let Some(old) = old {
            old.close().await;
        }
        Ok(())
    }

    /// Return the name of the current directory.
    pub fn getwd(&self) -> String {
        match self.dot.lock().unwrap().as_ref() {
            Some(fd) => fd.path().to_owned(),
            None => self.root.path().to_owned(),
        }
    }

    /// Close this file system instance (ie, detach), releasing the root and
    /// current directories. The underlying connection is closed after all
    /// open files and all other users of the connection have been closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dot = self.dot.lock().unwrap().take();
        if let Some(dot) = dot {
            dot.close().await;
        }
        self.root.close().await;
        self.conn.close();
    }

    /* implementation */

    fn walk_from(&self, p: &Parse) -> Arc<File> {
        if !p.abs {
            // the reference held by dot keeps the fid alive for this walk
            if let Some(dot) = self.dot.lock().unwrap().as_ref() {
                return dot.clone();
            }
        }
        self.root.clone()
    }

    async fn walk_path(&self, p: &Parse) -> Result<File> {
        let from = self.walk_from(p);
        self.walk(&from, &p.els, p.abs).await
    }

    /// Walk `els` from `from` onto a fresh fid, in chunks of [`MAXWELEM`].
    async fn walk(&self, from: &File, els: &[String], abs: bool) -> Result<File> {
        let newfid = self.conn.alloc_fid()?;
        match self.walk_into(from, newfid, els, abs).await {
            Ok((qid, name)) => Ok(File::walked(self.conn.clone(), newfid, qid, name)),
            Err(e) => {
                self.conn.free_fid(newfid);
                Err(e)
            }
        }
    }

    async fn walk_into(
        &self,
        from: &File,
        newfid: u32,
        els: &[String],
        abs: bool,
    ) -> Result<(QId, String)> {
        let mut name = from.path().to_owned();
        let mut qid = from.qid();
        let mut fromfid = from.fid();
        let mut done = 0;
        loop {
            let n = (els.len() - done).min(MAXWELEM);
            let wnames = els[done..done + n].to_vec();
            let wqids = match self
                .conn
                .rpc(FCall::TWalk {
                    fid: fromfid,
                    newfid,
                    wnames,
                })
                .await
            {
                Ok(FCall::RWalk { wqids }) => wqids,
                Ok(_) => {
                    self.unwind_walk(newfid, done).await;
                    return Err(proto());
                }
                // a walk that fails at its first element is refused outright
                // by the server, with its own diagnostic
                Err(e) => {
                    self.unwind_walk(newfid, done).await;
                    return Err(e);
                }
            };
            if wqids.len() < n {
                let last = wqids.last().copied().unwrap_or(qid);
                self.unwind_walk(newfid, done).await;
                return Err(walk_failed(els, abs, done + wqids.len(), last));
            }
            for el in &els[done..done + n] {
                name = add_name(&name, el);
            }
            if let Some(q) = wqids.last() {
                qid = *q;
            }
            done += n;
            if done == els.len() {
                return Ok((qid, name));
            }
            // continue from the partially resolved fid
            fromfid = newfid;
        }
    }

    /// A chunked walk that fails after its first round leaves `newfid`
    /// standing at an intermediate file; release it server-side.
    async fn unwind_walk(&self, newfid: u32, done: usize) {
        if done > 0 {
            let _ = self.conn.rpc(FCall::TClunk { fid: newfid }).await;
        }
    }

    /// Walk one level in place (the fid names its own new version on
    /// success), then open with truncation. `Ok(None)` means the entry does
    /// not exist and must be created.
    async fn open_trunc(&self, fd: &File, entry: &str, mode: u8) -> Result<Option<File>> {
        match self
            .conn
            .rpc(FCall::TWalk {
                fid: fd.fid(),
                newfid: fd.fid(),
                wnames: vec![entry.to_owned()],
            })
            .await
        {
            Ok(FCall::RWalk { .. }) => {}
            Ok(_) => return Err(proto()),
            Err(Error::Remote(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        match self
            .conn
            .rpc(FCall::TOpen {
                fid: fd.fid(),
                mode: mode | om::TRUNC,
            })
            .await
        {
            Ok(FCall::ROpen { qid, iounit }) => {
                let name = add_name(fd.path(), entry);
                let fid = fd.take_fid();
                Ok(Some(File::opened(
                    self.conn.clone(),
                    fid,
                    qid,
                    open_mode(mode),
                    iounit,
                    name,
                )))
            }
            Ok(_) => Err(proto()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Fsys {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.conn.close();
        }
    }
}

/// Classify a partial walk reply. The failing element is `els[i]`; `last`
/// is the qid of the last element the server did resolve (the starting
/// file's when it resolved none).
fn walk_failed(els: &[String], abs: bool, i: usize, last: QId) -> Error {
    let mut path = if abs { "/".to_owned() } else { String::new() };
    path.push_str(&els[..i].join("/"));
    if i != els.len() - 1 || !last.is_dir() {
        Error::NotDir(path)
    } else {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&els[i]);
        Error::NotFound(path)
    }
}

/// A file descriptor open on a file in a 9P file system, usually obtained
/// from [`Fsys::open`] or [`Fsys::create`].
///
/// Reads and writes come both with and without an explicit file offset; the
/// offset-free forms share a current position. Transfers larger than the
/// connection's message size are split into as many rounds as needed.
/// Closing drops the server-side fid exactly once however many times it is
/// called.
pub struct File {
    conn: Conn,
    fidn: u32,
    qid: QId,
    mode: Option<u8>,
    iounit: u32,
    name: String,
    offset: Mutex<u64>,
    closed: AtomicBool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("fidn", &self.fidn)
            .field("qid", &self.qid)
            .field("mode", &self.mode)
            .field("iounit", &self.iounit)
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("closed", &self.closed)
            .finish()
    }
}

impl File {
    pub(crate) fn walked(conn: Conn, fid: u32, qid: QId, name: String) -> File {
        File {
            conn,
            fidn: fid,
            qid,
            mode: None,
            iounit: 0,
            name,
            offset: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn opened(
        conn: Conn,
        fid: u32,
        qid: QId,
        mode: u8,
        iounit: u32,
        name: String,
    ) -> File {
        File {
            conn,
            fidn: fid,
            qid,
            mode: Some(mode),
            iounit,
            name,
            offset: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn fid(&self) -> u32 {
        self.fidn
    }

    /// Hand the fid over to a successor handle; this handle no longer owns
    /// it and its close becomes a no-op.
    pub(crate) fn take_fid(&self) -> u32 {
        self.closed.store(true, Ordering::SeqCst);
        self.fidn
    }

    /// The identity the server assigned this file.
    pub fn qid(&self) -> QId {
        self.qid
    }

    /// The path name by which this file was reached.
    pub fn path(&self) -> &str {
        &self.name
    }

    /// The suggested transfer size in bytes for reads and writes, or 0 if
    /// the server left it unspecified.
    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    /// The current file position in bytes.
    pub fn position(&self) -> u64 {
        *self.offset.lock().unwrap()
    }

    pub fn is_dir(&self) -> bool {
        self.qid.is_dir()
    }

    /// True if the file is marked exclusive-use.
    pub fn is_exclusive(&self) -> bool {
        self.qid.typ.contains(QIdType::EXCL)
    }

    /// True if the file is marked append-only.
    pub fn is_append_only(&self) -> bool {
        self.qid.typ.contains(QIdType::APPEND)
    }

    /// Read up to `n` bytes starting at the current offset, advancing it by
    /// the number of bytes read. An empty result means end of file.
    pub async fn read(&self, n: u32) -> Result<Vec<u8>> {
        let off = *self.offset.lock().unwrap();
        let data = self.read_at(n, off).await?;
        *self.offset.lock().unwrap() += data.len() as u64;
        Ok(data)
    }

    /// Read up to `n` bytes starting at `offset`. The current file position
    /// is unchanged. An empty result means end of file.
    pub async fn read_at(&self, n: u32, mut offset: u64) -> Result<Vec<u8>> {
        self.check_io(om::READ)?;
        let mut n = n;
        let mut result = Vec::new();
        loop {
            let nreq = n.min(self.io_limit());
            let reply = self
                .conn
                .rpc(FCall::TRead {
                    fid: self.fidn,
                    offset,
                    count: nreq,
                })
                .await?;
            let FCall::RRead { data } = reply else {
                return Err(proto());
            };
            let mut data = data.0;
            if data.len() > nreq as usize {
                // guard against broken servers
                data.truncate(nreq as usize);
            }
            let nr = data.len() as u32;
            offset += nr as u64;
            n -= nr;
            result.append(&mut data);
            if nr != nreq || n == 0 {
                return Ok(result);
            }
        }
    }

    /// Write all of `buf` starting at the current offset, advancing it by
    /// the number of bytes written.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check_io(om::WRITE)?;
        // assume it all goes, and roll the offset back if not
        let off = {
            let mut offset = self.offset.lock().unwrap();
            let off = *offset;
            *offset += buf.len() as u64;
            off
        };
        match self.write_at(buf, off).await {
            Ok(n) => {
                if n < buf.len() {
                    *self.offset.lock().unwrap() -= (buf.len() - n) as u64;
                }
                Ok(n)
            }
            Err(e) => {
                *self.offset.lock().unwrap() -= buf.len() as u64;
                Err(e)
            }
        }
    }

    /// Write all of `buf` starting at `offset`. The current file position
    /// is unchanged.
    pub async fn write_at(&self, buf: &[u8], mut offset: u64) -> Result<usize> {
        self.check_io(om::WRITE)?;
        if self.qid.is_dir() {
            return Err(Error::IsDir);
        }
        let mut n = buf.len();
        let mut count = 0;
        loop {
            let nreq = n.min(self.io_limit() as usize);
            let reply = self
                .conn
                .rpc(FCall::TWrite {
                    fid: self.fidn,
                    offset,
                    data: Data(buf[count..count + nreq].to_vec()),
                })
                .await?;
            let FCall::RWrite { count: nr } = reply else {
                return Err(proto());
            };
            let nr = (nr as usize).min(nreq);
            offset += nr as u64;
            n -= nr;
            count += nr;
            if nr != nreq || n == 0 {
                return Ok(count);
            }
        }
    }

    /// Change the current file position, returning the resulting offset.
    ///
    /// Directories only rewind: any seek other than to absolute offset 0 is
    /// refused. End-relative seeks consult the server for the file length.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        match pos {
            SeekFrom::Start(off) => {
                if self.qid.is_dir() && off != 0 {
                    return Err(Error::IsDir);
                }
                *self.offset.lock().unwrap() = off;
                Ok(off)
            }
            SeekFrom::Current(delta) => {
                if self.qid.is_dir() {
                    return Err(Error::IsDir);
                }
                let mut offset = self.offset.lock().unwrap();
                let off = *offset as i64 + delta;
                if off < 0 {
                    return Err(Error::NegOffset);
                }
                *offset = off as u64;
                Ok(off as u64)
            }
            SeekFrom::End(delta) => {
                if self.qid.is_dir() {
                    return Err(Error::IsDir);
                }
                let stat = self.stat().await?;
                let off = stat.length as i64 + delta;
                if off < 0 {
                    return Err(Error::NegOffset);
                }
                *self.offset.lock().unwrap() = off as u64;
                Ok(off as u64)
            }
        }
    }

    /// Return the directory entry that describes this file.
    pub async fn stat(&self) -> Result<Stat> {
        match self.conn.rpc(FCall::TStat { fid: self.fidn }).await {
            Ok(FCall::RStat { stat }) => Ok(stat),
            Ok(_) => Err(proto()),
            Err(e) => Err(e),
        }
    }

    /// Attempt to update the directory entry for this file; see
    /// [`Fsys::wstat`] for the `no change' convention.
    pub async fn wstat(&self, stat: &Stat) -> Result<()> {
        match self
            .conn
            .rpc(FCall::TWStat {
                fid: self.fidn,
                stat: stat.clone(),
            })
            .await
        {
            Ok(FCall::RWStat) => Ok(()),
            Ok(_) => Err(proto()),
            Err(e) => Err(e),
        }
    }

    /// Read the next batch of directory entries from a directory open for
    /// reading, advancing the directory offset. An empty result means the
    /// end of the directory. Iteration restarts only from offset 0.
    pub async fn dir_read(&self) -> Result<Vec<Stat>> {
        if !self.qid.is_dir() {
            return Err(Error::BadUse("not a directory"));
        }
        let b = self.read(DIRREAD).await?;
        let mut entries = Vec::new();
        let mut buf = Cursor::new(&b[..]);
        while (buf.position() as usize) < b.len() {
            match Stat::decode(&mut buf) {
                Ok(stat) => entries.push(stat),
                Err(_) => break, // server error?
            }
        }
        Ok(entries)
    }

    /// Read all directory entries remaining from the current offset.
    pub async fn dir_read_all(&self) -> Result<Vec<Stat>> {
        let mut entries = Vec::new();
        loop {
            let batch = self.dir_read().await?;
            if batch.is_empty() {
                return Ok(entries);
            }
            entries.extend(batch);
        }
    }

    /// Close the file, clunking the underlying fid if this is the first
    /// close. Close always succeeds from the caller's point of view: the
    /// local resources are released even if the clunk fails on the wire.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.conn.rpc(FCall::TClunk { fid: self.fidn }).await;
        self.conn.free_fid(self.fidn);
    }

    fn io_limit(&self) -> u32 {
        match self.conn.msize() {
            0 => MAXRPC - IOHDRSZ,
            msize => msize - IOHDRSZ,
        }
    }

    fn check_io(&self, want: u8) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadUse("file is closed"));
        }
        let Some(mode) = self.mode else {
            return Err(Error::BadUse("file is not open"));
        };
        let ok = match want {
            om::READ => mode == om::READ || mode == om::RDWR,
            om::WRITE => mode == om::WRITE || mode == om::RDWR,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::BadUse("open mode does not permit this"))
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let conn = self.conn.clone();
            let fid = self.fidn;
            trace!("dropping open file {:?}, clunking in background", self.name);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = conn.rpc(FCall::TClunk { fid }).await;
                    conn.free_fid(fid);
                });
            } else {
                conn.free_fid(fid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Conn;
    use crate::error::Error;
    use crate::testsrv::{self, MemFs};

    fn sample_fs() -> MemFs {
        let mut fs = MemFs::new();
        fs.add_dir("/etc");
        fs.add_file("/etc/motd", b"welcome to styx\n");
        fs.add_dir("/usr");
        fs.add_dir("/usr/alice");
        fs
    }

    async fn attach(fs: MemFs) -> (Conn, Fsys) {
        let conn = Conn::new(fs.serve());
        conn.version(8192, None).await.unwrap();
        let fsys = conn.attach(None, "alice", "").await.unwrap();
        (conn, fsys)
    }

    #[tokio::test]
    async fn attach_starts_at_root() {
        let (_conn, fsys) = attach(sample_fs()).await;
        assert_eq!(fsys.getwd(), "/");
    }

    #[tokio::test]
    async fn open_and_read_whole_file() {
        let (_conn, fsys) = attach(sample_fs()).await;
        let file = fsys.open("/etc/motd", om::READ).await.unwrap();
        assert_eq!(file.path(), "/etc/motd");

        // repeated sequential reads until a zero-length result
        let mut content = Vec::new();
        loop {
            let batch = file.read(6).await.unwrap();
            if batch.is_empty() {
                break;
            }
            content.extend(batch);
        }
        assert_eq!(content, b"welcome to styx\n");

        // the qid reported by stat matches the one the walk found
        let stat = fsys.stat("/etc/motd").await.unwrap();
        assert_eq!(stat.qid, file.qid());
        file.close().await;
    }

    #[tokio::test]
    async fn large_reads_split_by_msize() {
        let content: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        let mut fs = sample_fs();
        fs.add_file("/big", &content);
        let (conn, fsys) = attach(fs).await;
        assert_eq!(conn.msize(), 8192); // forces three TRead rounds

        let file = fsys.open("/big", om::READ).await.unwrap();
        let data = file.read(40000).await.unwrap();
        assert_eq!(data, content);
        // a positioned read does not move the sequential offset
        let slice = file.read_at(5, 8).await.unwrap();
        assert_eq!(slice, content[8..13]);
        assert_eq!(file.position(), 20000);
        file.close().await;
    }

    #[tokio::test]
    async fn create_write_read_back() {
        let (_conn, fsys) = attach(sample_fs()).await;
        let file = fsys.create("/notes", om::RDWR, 0o644).await.unwrap();
        assert_eq!(file.path(), "/notes");
        assert_eq!(file.write(b"hello").await.unwrap(), 5);
        file.seek(SeekFrom::Start(0)).await.unwrap();
        assert_eq!(file.read(100).await.unwrap(), b"hello");
        file.close().await;

        let again = fsys.open("/notes", om::READ).await.unwrap();
        assert_eq!(again.read(100).await.unwrap(), b"hello");
        again.close().await;
    }

    #[tokio::test]
    async fn create_truncates_existing_file() {
        let (_conn, fsys) = attach(sample_fs()).await;
        let file = fsys.create("/etc/motd", om::RDWR, 0o644).await.unwrap();
        assert_eq!(file.read(100).await.unwrap(), b"");
        assert_eq!(file.stat().await.unwrap().length, 0);
        file.close().await;
    }

    #[tokio::test]
    async fn create_absorbs_create_race() {
        // the walk to the new entry fails, the create is refused because
        // another client won the race, and the second open succeeds
        let qid = QId {
            typ: QIdType::FILE,
            version: 1,
            path: 99,
        };
        let rootqid = QId {
            typ: QIdType::DIR,
            version: 0,
            path: 1,
        };
        let mut walks = 0;
        let stream = testsrv::scripted(move |msg| {
            let tag = msg.tag;
            Some(vec![match msg.body {
                FCall::TVersion { msize, version } => Msg {
                    tag,
                    body: FCall::RVersion { msize, version },
                },
                FCall::TAttach { .. } => Msg {
                    tag,
                    body: FCall::RAttach { qid: rootqid },
                },
                FCall::TWalk { wnames, .. } if wnames.is_empty() => Msg {
                    tag,
                    body: FCall::RWalk { wqids: Vec::new() },
                },
                FCall::TWalk { .. } => {
                    walks += 1;
                    if walks == 1 {
                        Msg {
                            tag,
                            body: FCall::RError {
                                ename: "does not exist".to_owned(),
                            },
                        }
                    } else {
                        Msg {
                            tag,
                            body: FCall::RWalk { wqids: vec![qid] },
                        }
                    }
                }
                FCall::TCreate { .. } => Msg {
                    tag,
                    body: FCall::RError {
                        ename: "file already exists".to_owned(),
                    },
                },
                FCall::TOpen { .. } => Msg {
                    tag,
                    body: FCall::ROpen { qid, iounit: 0 },
                },
                FCall::TClunk { .. } => Msg {
                    tag,
                    body: FCall::RClunk,
                },
                _ => Msg {
                    tag,
                    body: FCall::RError {
                        ename: "unexpected".to_owned(),
                    },
                },
            }])
        });
        let conn = Conn::new(stream);
        conn.version(0, None).await.unwrap();
        let fsys = conn.attach(None, "alice", "").await.unwrap();

        let file = fsys.create("/f", om::READ, 0o644).await.unwrap();
        assert_eq!(file.qid(), qid);
        file.close().await;
    }

    #[tokio::test]
    async fn walk_distinguishes_not_found_from_not_dir() {
        let (_conn, fsys) = attach(sample_fs()).await;

        // missing final element through a directory prefix
        match fsys.open("/etc/nope", om::READ).await.unwrap_err() {
            Error::NotFound(path) => assert_eq!(path, "/etc/nope"),
            other => panic!("unexpected error: {:?}", other),
        }

        // a non-directory in the middle of the path
        match fsys.open("/etc/motd/x", om::READ).await.unwrap_err() {
            Error::NotDir(path) => assert_eq!(path, "/etc/motd"),
            other => panic!("unexpected error: {:?}", other),
        }
        match fsys.open("/etc/motd/x/y", om::READ).await.unwrap_err() {
            Error::NotDir(path) => assert_eq!(path, "/etc/motd"),
            other => panic!("unexpected error: {:?}", other),
        }

        // a first-element failure carries the server's own diagnostic
        match fsys.open("/nope", om::READ).await.unwrap_err() {
            Error::Remote(text) => assert_eq!(text, "does not exist"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn deep_paths_walk_in_chunks() {
        let mut fs = sample_fs();
        let mut path = String::new();
        for i in 0..20 {
            path.push_str(&format!("/d{}", i));
            fs.add_dir(&path);
        }
        let deep = format!("{}/deep.txt", path);
        fs.add_file(&deep, b"found me");

        let (_conn, fsys) = attach(fs).await;
        // 21 elements: more than one TWalk round
        let file = fsys.open(&deep, om::READ).await.unwrap();
        assert_eq!(file.read(100).await.unwrap(), b"found me");
        assert_eq!(file.path(), deep);
        file.close().await;
    }

    #[tokio::test]
    async fn chdir_resolves_relative_paths() {
        let (_conn, fsys) = attach(sample_fs()).await;
        fsys.chdir("/usr/alice").await.unwrap();
        assert_eq!(fsys.getwd(), "/usr/alice");

        let file = fsys.create("notes", om::WRITE, 0o644).await.unwrap();
        assert_eq!(file.path(), "/usr/alice/notes");
        file.close().await;

        // dot-dot resolves on the server and lexically in the tracked name
        let motd = fsys.open("../../etc/motd", om::READ).await.unwrap();
        assert_eq!(motd.path(), "/etc/motd");
        motd.close().await;

        match fsys.chdir("/etc/motd").await.unwrap_err() {
            Error::NotDir(path) => assert_eq!(path, "/etc/motd"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fsys.getwd(), "/usr/alice");
    }

    #[tokio::test]
    async fn dir_read_lists_entries_once() {
        let (_conn, fsys) = attach(sample_fs()).await;
        let root = fsys.open("/", om::READ).await.unwrap();
        let entries = root.dir_read_all().await.unwrap();
        let names: Vec<&str> = entries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["etc", "usr"]);
        assert!(entries.iter().all(|s| s.qid.is_dir()));

        // the sequence is finite
        assert!(root.dir_read().await.unwrap().is_empty());

        // and restartable from the beginning only
        root.seek(SeekFrom::Start(0)).await.unwrap();
        assert_eq!(root.dir_read_all().await.unwrap().len(), 2);
        assert!(matches!(
            root.seek(SeekFrom::Start(1)).await.unwrap_err(),
            Error::IsDir
        ));
        assert!(matches!(
            root.seek(SeekFrom::End(0)).await.unwrap_err(),
            Error::IsDir
        ));
        root.close().await;
    }

    #[tokio::test]
    async fn seek_returns_resulting_offset() {
        let (_conn, fsys) = attach(sample_fs()).await;
        let file = fsys.open("/etc/motd", om::READ).await.unwrap();

        assert_eq!(file.seek(SeekFrom::End(-5)).await.unwrap(), 11);
        assert_eq!(file.read(100).await.unwrap(), b"styx\n");
        assert_eq!(file.seek(SeekFrom::Current(-16)).await.unwrap(), 0);
        assert!(matches!(
            file.seek(SeekFrom::Current(-1)).await.unwrap_err(),
            Error::NegOffset
        ));
        file.close().await;
    }

    #[tokio::test]
    async fn wstat_updates_metadata() {
        let (_conn, fsys) = attach(sample_fs()).await;
        assert_eq!(fsys.stat("/etc/motd").await.unwrap().mode, 0o644);

        let mut change = Stat::nulldir();
        change.mode = 0o600;
        fsys.wstat("/etc/motd", &change).await.unwrap();
        assert_eq!(fsys.stat("/etc/motd").await.unwrap().mode, 0o600);
    }

    #[tokio::test]
    async fn remove_deletes_the_file() {
        let (_conn, fsys) = attach(sample_fs()).await;
        fsys.remove("/etc/motd").await.unwrap();
        match fsys.open("/etc/motd", om::READ).await.unwrap_err() {
            Error::NotFound(path) => assert_eq!(path, "/etc/motd"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_clunks_at_most_once() {
        let clunks = std::sync::Arc::new(Mutex::new(0));
        let seen = clunks.clone();
        let aqid = QId {
            typ: QIdType::AUTH,
            version: 0,
            path: 7,
        };
        let stream = testsrv::scripted(move |msg| {
            let tag = msg.tag;
            Some(vec![match msg.body {
                FCall::TVersion { msize, version } => Msg {
                    tag,
                    body: FCall::RVersion { msize, version },
                },
                FCall::TAuth { .. } => Msg {
                    tag,
                    body: FCall::RAuth { aqid },
                },
                FCall::TClunk { .. } => {
                    *seen.lock().unwrap() += 1;
                    Msg {
                        tag,
                        body: FCall::RClunk,
                    }
                }
                _ => Msg {
                    tag,
                    body: FCall::RError {
                        ename: "unexpected".to_owned(),
                    },
                },
            }])
        });
        let conn = Conn::new(stream);
        conn.version(0, None).await.unwrap();
        let afile = conn.auth("alice", "").await.unwrap();
        afile.close().await;
        afile.close().await;
        assert_eq!(*clunks.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn io_on_wrong_mode_is_rejected_locally() {
        let (_conn, fsys) = attach(sample_fs()).await;

        let readonly = fsys.open("/etc/motd", om::READ).await.unwrap();
        assert!(matches!(
            readonly.write(b"x").await.unwrap_err(),
            Error::BadUse(_)
        ));
        readonly.close().await;

        let writeonly = fsys.open("/etc/motd", om::WRITE).await.unwrap();
        assert!(matches!(
            writeonly.read(1).await.unwrap_err(),
            Error::BadUse(_)
        ));
        writeonly.close().await;

        // writing a directory never reaches the wire
        let root = fsys.open("/", om::RDWR).await.unwrap();
        assert!(matches!(root.write(b"x").await.unwrap_err(), Error::IsDir));
        root.close().await;

        // a closed handle refuses I/O
        let gone = fsys.open("/etc/motd", om::READ).await.unwrap();
        gone.close().await;
        assert!(matches!(gone.read(1).await.unwrap_err(), Error::BadUse(_)));
    }
}
