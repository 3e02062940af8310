//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::Error,
        fcall::*,
        fsys::{File, Fsys},
        serialize,
        utils::Result,
    },
    bytes::{Bytes, BytesMut, buf::BufMut},
    futures::sink::SinkExt,
    log::{debug, trace, warn},
    std::{
        collections::HashMap,
        io::Cursor,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{Notify, mpsc, oneshot},
        time,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

const EHUNGUP: &str = "i/o on hungup channel";

/// Allocator for the 16-bit tag space of one connection.
///
/// A bitset over all 65536 values with `NOTAG` permanently reserved.
struct Tags {
    bits: Vec<u64>,
}

impl Tags {
    fn new() -> Tags {
        let mut tags = Tags {
            bits: vec![0u64; (1 << 16) / 64],
        };
        tags.set(NOTAG);
        tags
    }

    fn set(&mut self, tag: u16) {
        self.bits[tag as usize >> 6] |= 1 << (tag & 63);
    }

    fn alloc(&mut self) -> Option<u16> {
        for (i, word) in self.bits.iter_mut().enumerate() {
            if *word != !0 {
                let j = word.trailing_ones();
                *word |= 1 << j;
                return Some((i as u16) << 6 | j as u16);
            }
        }
        None
    }

    fn free(&mut self, tag: u16) {
        if tag != NOTAG {
            self.bits[tag as usize >> 6] &= !(1 << (tag & 63));
        }
    }
}

/// Fid number pool of one connection.
///
/// Freed fids are recycled before new ones are minted, keeping the id space
/// compact. `inuse`/`closing` drive the deferred connection close: the
/// connection shuts down once closed while no fid remains live.
struct Fids {
    avail: Vec<u32>,
    fidgen: u32,
    inuse: usize,
    closing: bool,
}

impl Fids {
    fn new() -> Fids {
        Fids {
            avail: Vec::new(),
            fidgen: 0,
            inuse: 0,
            closing: false,
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        let fid = match self.avail.pop() {
            Some(fid) => fid,
            None if self.fidgen == NOFID => return None,
            None => {
                let fid = self.fidgen;
                self.fidgen += 1;
                fid
            }
        };
        self.inuse += 1;
        Some(fid)
    }

    fn free(&mut self, fid: u32) {
        self.avail.push(fid);
        self.inuse -= 1;
    }

    fn close(&mut self) -> bool {
        if self.inuse != 0 {
            self.closing = true;
            return false;
        }
        self.closing = false;
        true
    }

    fn should_close(&self) -> bool {
        self.inuse == 0 && self.closing
    }
}

type ReplyTx = oneshot::Sender<Result<FCall>>;
type ReplyRx = oneshot::Receiver<Result<FCall>>;

/// The shared mutable state of one connection: the pending-request table,
/// the tag bitset and the fid pool, all behind one lock. `err` poisons the
/// connection; once set, every registration fails with it.
struct Inner {
    tags: Tags,
    fids: Fids,
    pending: HashMap<u16, ReplyTx>,
    err: Option<String>,
}

enum Outgoing {
    Frame { tag: u16, bytes: Bytes },
    Hangup,
}

struct ConnShared {
    inner: Mutex<Inner>,
    msize: AtomicU32,
    versioned: tokio::sync::Mutex<Option<String>>,
    sendq: mpsc::UnboundedSender<Outgoing>,
    async_flush: AtomicBool,
    time_limit: Mutex<Option<Duration>>,
    stop: Notify,
}

impl ConnShared {
    /// Find the request corresponding to the reply's tag, deliver the reply
    /// and free the tag.
    fn completed(&self, msg: Msg) {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.remove(&msg.tag) {
            Some(tx) => {
                inner.tags.free(msg.tag);
                let _ = tx.send(Ok(msg.body));
            }
            None => warn!(
                "unexpected reply tag {} type {:?}",
                msg.tag,
                MsgType::from(&msg.body)
            ),
        }
    }

    /// Shut down the connection, with reason, failing all pending requests
    /// and every request registered from now on.
    fn shutdown(&self, why: &str) {
        let dead = {
            let mut inner = self.inner.lock().unwrap();
            if inner.err.is_none() {
                // first error might be most accurate
                inner.err = Some(why.to_owned());
            }
            let reason = inner.err.clone().unwrap();
            let pending = std::mem::take(&mut inner.pending);
            for (tag, tx) in pending {
                inner.tags.free(tag);
                let _ = tx.send(Err(Error::Hungup(reason.clone())));
            }
            reason
        };
        debug!("shut down: {}", dead);
        let _ = self.sendq.send(Outgoing::Hangup);
        self.stop.notify_waiters();
    }

    /// Remove an unanswered request whose reply will never be delivered
    /// (its flush has been acknowledged, or registration of its flush
    /// failed), releasing the tag.
    fn abandon(&self, tag: u16) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(&tag).is_some() {
            inner.tags.free(tag);
        }
    }
}

async fn read_loop<R>(shared: Arc<ConnShared>, mut framed: tokio_util::codec::FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shared.stop.notified() => break,
        };
        let bytes = match frame {
            None => {
                shared.shutdown(EHUNGUP);
                break;
            }
            Some(Err(e)) => {
                shared.shutdown(&format!("error reading 9P message: {}", e));
                break;
            }
            Some(Ok(bytes)) => bytes,
        };

        let msglim = match shared.msize.load(Ordering::Relaxed) {
            0 => MAXRPC,
            m => m,
        };
        if bytes.len() + 4 > msglim as usize {
            shared.shutdown(&format!(
                "9P message longer than agreed: {} > {}",
                bytes.len() + 4,
                msglim
            ));
            break;
        }
        if bytes.len() < 3 {
            shared.shutdown("invalid 9P message size");
            break;
        }

        let mut buf = Cursor::new(&bytes[..]);
        match serialize::read_msg(&mut buf) {
            Ok(msg) if buf.position() == bytes.len() as u64 => {
                trace!("<- {:?}", msg);
                shared.completed(msg);
            }
            // a malformed frame is a diagnosable anomaly, not fatal
            Ok(msg) => warn!(
                "9P message error: {} trailing bytes after {:?}",
                bytes.len() as u64 - buf.position(),
                MsgType::from(&msg.body)
            ),
            Err(e) => warn!("9P message error: can't unpack: {}", e),
        }
    }
    trace!("reader exit");
}

async fn write_loop<W>(
    shared: Arc<ConnShared>,
    mut framed: tokio_util::codec::FramedWrite<W, LengthDelimitedCodec>,
    mut sendq: mpsc::UnboundedReceiver<Outgoing>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = sendq.recv().await {
        match out {
            Outgoing::Hangup => break,
            Outgoing::Frame { tag, bytes } => {
                if let Err(e) = framed.send(bytes).await {
                    let why = format!("mount rpc error: {}", e);
                    {
                        let mut inner = shared.inner.lock().unwrap();
                        if let Some(tx) = inner.pending.remove(&tag) {
                            inner.tags.free(tag);
                            let _ = tx.send(Err(Error::Hungup(why.clone())));
                        }
                    }
                    shared.shutdown(&why);
                    break;
                }
            }
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = framed.get_mut().shutdown().await;
    trace!("writer exit");
}

/// A 9P connection on a byte stream.
///
/// `Conn` provides operations to initialise the connection (version), obtain
/// an authentication file (auth), attach to the root of a file system
/// offered by the server (attach), and close the connection (close).
///
/// A successful attach returns a [`Fsys`] instance allowing operations on
/// files by name. Two of those operations, create and open, return a
/// [`File`] instance allowing I/O on files. `auth` also returns a [`File`],
/// allowing I/O on the resulting authentication file.
///
/// Any number of tasks may issue requests on one `Conn` concurrently; each
/// caller suspends only on its own reply. A reader task and a writer task
/// run for the lifetime of the connection.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<ConnShared>,
}

impl Conn {
    /// Start a 9P connection over an already-connected bidirectional byte
    /// stream, spawning its reader and writer tasks. Authentication or
    /// encryption of the stream, if any, must already be in place below it.
    pub fn new<S>(stream: S) -> Conn
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(MSIZE_CEILING as usize)
            .new_read(reader);
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(MSIZE_CEILING as usize)
            .new_write(writer);

        let (sendq_tx, sendq_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnShared {
            inner: Mutex::new(Inner {
                tags: Tags::new(),
                fids: Fids::new(),
                pending: HashMap::new(),
                err: None,
            }),
            msize: AtomicU32::new(0),
            versioned: tokio::sync::Mutex::new(None),
            sendq: sendq_tx,
            async_flush: AtomicBool::new(false),
            time_limit: Mutex::new(None),
            stop: Notify::new(),
        });

        tokio::spawn(read_loop(shared.clone(), framedread));
        tokio::spawn(write_loop(shared.clone(), framedwrite, sendq_rx));

        Conn { shared }
    }

    /// The negotiated maximum message size, 0 before version negotiation.
    pub fn msize(&self) -> u32 {
        self.shared.msize.load(Ordering::Relaxed)
    }

    /// Set a time limit for each 9P operation, until reset to `None`.
    /// An expired operation is flushed and fails with `Error::Interrupted`.
    pub fn set_time_limit(&self, limit: Option<Duration>) {
        *self.shared.time_limit.lock().unwrap() = limit;
    }

    /// On an expired operation, wait for the flush reply before returning.
    pub fn wait_flush(&self) {
        self.shared.async_flush.store(false, Ordering::Relaxed);
    }

    /// On an expired operation, return at once and let the flush complete in
    /// the background.
    pub fn quick_flush(&self) {
        self.shared.async_flush.store(true, Ordering::Relaxed);
    }

    /// Negotiate a maximum message size and protocol version.
    ///
    /// By default the protocol uses messages no larger than [`MAXRPC`] and
    /// negotiates the version "9P2000"; the server may lower the message
    /// size but never raise it. At most one negotiation runs at a time; a
    /// concurrent or repeated call observes the first one's result.
    pub async fn version(&self, msize: u32, version: Option<&str>) -> Result<String> {
        let msize = if msize == 0 { MAXRPC } else { msize };
        let version = version.unwrap_or(P92000);

        // only one TVersion active at once on a connection
        let mut versioned = self.shared.versioned.lock().await;
        if let Some(negotiated) = versioned.as_ref() {
            return Ok(negotiated.clone());
        }

        let reply = self
            .rpc_with_deadline(
                FCall::TVersion {
                    msize,
                    version: version.to_owned(),
                },
                None,
            )
            .await?;
        let FCall::RVersion {
            msize: rmsize,
            version: rversion,
        } = reply
        else {
            return Err(self.negotiation_failed("mismatched 9P reply"));
        };

        if !(MSIZE_FLOOR..=MSIZE_CEILING).contains(&rmsize) {
            return Err(self.negotiation_failed("nonsense value of remote msize in version"));
        }
        if rmsize > msize {
            return Err(self.negotiation_failed("server tries to increase msize in version"));
        }
        if !version.starts_with(&rversion) {
            return Err(self.negotiation_failed("bad 9P version received from server"));
        }

        self.shared.msize.store(rmsize, Ordering::Relaxed);
        *versioned = Some(rversion.clone());
        Ok(rversion)
    }

    fn negotiation_failed(&self, why: &str) -> Error {
        self.shared.shutdown(why);
        Error::Proto(why.to_owned())
    }

    async fn ensure_version(&self) -> Result<()> {
        {
            let versioned = self.shared.versioned.lock().await;
            if versioned.is_some() {
                return Ok(());
            }
        }
        self.version(0, None).await.map(drop)
    }

    /// Obtain a handle to the authentication file for `uname`'s access to
    /// the server's tree `aname`.
    ///
    /// A server that does not require authentication refuses the request
    /// with [`Error::Remote`]; that is not a failure to authenticate but a
    /// statement that none is needed, and the caller should attach without
    /// an auth file.
    pub async fn auth(&self, uname: &str, aname: &str) -> Result<File> {
        self.ensure_version().await?;
        let fid = self.alloc_fid()?;
        match self
            .rpc(FCall::TAuth {
                afid: fid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await
        {
            Ok(FCall::RAuth { aqid }) => Ok(File::opened(
                self.clone(),
                fid,
                aqid,
                om::RDWR,
                0,
                String::new(),
            )),
            Ok(_) => {
                self.free_fid(fid);
                Err(Error::Proto("mismatched 9P reply".to_owned()))
            }
            Err(e) => {
                self.free_fid(fid);
                Err(e)
            }
        }
    }

    /// Attach as user `uname` to the root of the server's tree `aname`,
    /// returning a [`Fsys`] giving access to that tree.
    ///
    /// If the server requires authentication, `afile` must be the result of
    /// a previous [`auth`](Conn::auth) for the same `uname` and `aname`,
    /// over which the authentication protocol has been run; otherwise pass
    /// `None`.
    pub async fn attach(&self, afile: Option<&File>, uname: &str, aname: &str) -> Result<Fsys> {
        self.ensure_version().await?;
        let fid = self.alloc_fid()?;
        let afid = afile.map_or(NOFID, File::fid);
        match self
            .rpc(FCall::TAttach {
                fid,
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await
        {
            Ok(FCall::RAttach { qid }) => Ok(Fsys::new(
                self.clone(),
                File::walked(self.clone(), fid, qid, "/".to_owned()),
            )),
            Ok(_) => {
                self.free_fid(fid);
                Err(Error::Proto("mismatched 9P reply".to_owned()))
            }
            Err(e) => {
                self.free_fid(fid);
                Err(e)
            }
        }
    }

    /// Close the connection as soon as its [`Fsys`] and [`File`] instances
    /// have all been closed.
    pub fn close(&self) {
        let now = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.err.is_none() && inner.fids.close()
        };
        if now {
            self.shared.shutdown("9P channel closed");
        }
    }

    pub(crate) fn alloc_fid(&self) -> Result<u32> {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(why) = &inner.err {
            return Err(Error::Hungup(why.clone()));
        }
        inner.fids.alloc().ok_or(Error::NoFids)
    }

    pub(crate) fn free_fid(&self, fid: u32) {
        let should_close = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.fids.free(fid);
            inner.fids.should_close()
        };
        if should_close {
            self.close();
        }
    }

    /// One request/reply round trip under the connection's time limit.
    pub(crate) async fn rpc(&self, body: FCall) -> Result<FCall> {
        let deadline = *self.shared.time_limit.lock().unwrap();
        self.rpc_with_deadline(body, deadline).await
    }

    pub(crate) async fn rpc_with_deadline(
        &self,
        body: FCall,
        deadline: Option<Duration>,
    ) -> Result<FCall> {
        let otype = MsgType::from(&body);
        let (tag, mut rx) = self.register(body)?;

        let reply = match deadline {
            None => recv_reply(&mut rx).await,
            Some(limit) => match time::timeout(limit, &mut rx).await {
                Ok(r) => r.unwrap_or_else(|_| Err(Error::Hungup(EHUNGUP.to_owned()))),
                Err(_elapsed) => self.flush(tag, rx).await,
            },
        }?;

        match reply {
            FCall::RError { ename } => Err(Error::Remote(ename)),
            reply => {
                let rtype = MsgType::from(&reply);
                if rtype as u8 != otype as u8 + 1 {
                    warn!("unexpected reply: type {:?} otype {:?}", rtype, otype);
                    return Err(Error::Proto("mismatched 9P reply".to_owned()));
                }
                Ok(reply)
            }
        }
    }

    /// Draw a tag, record the request in the pending table and hand the
    /// frame to the writer. Registration happens strictly before the write
    /// so a reply can never arrive unmatched.
    fn register(&self, body: FCall) -> Result<(u16, ReplyRx)> {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(why) = &inner.err {
            return Err(Error::Hungup(why.clone()));
        }

        let tag = if let FCall::TVersion { .. } = body {
            NOTAG
        } else {
            match inner.tags.alloc() {
                Some(tag) => tag,
                None => return Err(Error::NoTags),
            }
        };

        let msg = Msg { tag, body };
        let mut buf = BytesMut::with_capacity(msg.size() as usize).writer();
        if let Err(e) = serialize::write_msg(&mut buf, &msg) {
            inner.tags.free(tag);
            return Err(Error::Io(e));
        }

        trace!("-> {:?}", msg);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(tag, tx);
        if self
            .shared
            .sendq
            .send(Outgoing::Frame {
                tag,
                bytes: buf.into_inner().freeze(),
            })
            .is_err()
        {
            inner.pending.remove(&tag);
            inner.tags.free(tag);
            let why = inner.err.clone().unwrap_or_else(|| EHUNGUP.to_owned());
            return Err(Error::Hungup(why));
        }
        Ok((tag, rx))
    }

    /// Cancel an expired request: tell the server to stop caring about its
    /// tag and settle the outcome. At most one flush is in flight per
    /// original tag, and the flush always names the original tag. If the
    /// real answer raced in before the flush was acknowledged, it stands.
    async fn flush(&self, oldtag: u16, mut rx: ReplyRx) -> Result<FCall> {
        trace!("interrupt: flush tag {}", oldtag);
        let (_ftag, frx) = match self.register(FCall::TFlush { oldtag }) {
            Ok(r) => r,
            Err(e) => {
                self.shared.abandon(oldtag);
                return Err(e);
            }
        };

        if self.shared.async_flush.load(Ordering::Relaxed) {
            // quick mode: the flush settles in the background; the tag is
            // reclaimed only once the server has acknowledged it
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let _ = frx.await;
                shared.abandon(oldtag);
            });
            return Err(Error::Interrupted);
        }

        let mut answer: Option<Result<FCall>> = None;
        let mut frx = frx;
        let settled = tokio::select! {
            r = &mut rx => {
                answer = Some(r.unwrap_or_else(|_| Err(Error::Hungup(EHUNGUP.to_owned()))));
                false
            }
            // RFlush, or RError from a server that must not error a flush;
            // either way the chain is settled
            _ = &mut frx => true,
        };
        if !settled {
            // the flush reply still has to arrive before the chain is done
            let _ = frx.await;
        } else if let Ok(r) = rx.try_recv() {
            // the real answer raced in just ahead of the RFlush
            answer = Some(r);
        }

        match answer {
            Some(reply) => reply,
            None => {
                self.shared.abandon(oldtag);
                Err(Error::Interrupted)
            }
        }
    }
}

async fn recv_reply(rx: &mut ReplyRx) -> Result<FCall> {
    rx.await
        .unwrap_or_else(|_| Err(Error::Hungup(EHUNGUP.to_owned())))
}
