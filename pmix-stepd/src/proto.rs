//! Server wire format: base header, endpoint extension and the buffer type
//! frames are built in.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, NativeEndian, ReadBytesExt};
use std::io::Cursor;

pub const MAGIC: u32 = 0xCAFE_CA11;

/// magic, type, seq, nodeid, msgsize and the ext flag byte.
pub const BASE_HDR_SIZE: usize = 5 * 4 + 1;

/// Largest endpoint that fits in the reserved prefix without a copy.
pub const MAX_EP_INLINE: usize = 32;

pub const MAX_BASE_HDR: usize = BASE_HDR_SIZE + 4 + MAX_EP_INLINE;

/// Room reserved in front of every payload.
pub const HDR_PREFIX: usize = MAX_BASE_HDR + 4;

/// Largest `msgsize` a receiver accepts.
pub const MAX_FRAME: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    FanIn = 1,
    FanOut = 2,
    Dmdx = 3,
    InitDirect = 4,
    Ring = 5,
    PingPong = 6,
}

impl TryFrom<u32> for MsgType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::FanIn,
            2 => Self::FanOut,
            3 => Self::Dmdx,
            4 => Self::InitDirect,
            5 => Self::Ring,
            6 => Self::PingPong,
            _ => return Err(Error::BadParam(format!("unknown message type {}", value))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseHeader {
    pub magic: u32,
    pub mtype: u32,
    pub seq: u32,
    pub nodeid: u32,
    /// Bytes following the fixed header, endpoint extension included.
    pub msgsize: u32,
    pub ext_flag: bool,
}

impl BaseHeader {
    pub fn new(mtype: MsgType, seq: u32, nodeid: u32, msgsize: u32, ext_flag: bool) -> Self {
        Self {
            magic: MAGIC,
            mtype: mtype as u32,
            seq,
            nodeid,
            msgsize,
            ext_flag,
        }
    }

    pub fn msg_type(&self) -> Result<MsgType> {
        MsgType::try_from(self.mtype)
    }
}

/// Byte layout of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Network byte order, for mixed-architecture steps.
    Portable,
    /// Host byte order, fields copied verbatim.
    SameArch,
}

fn pack_with<B: ByteOrder>(hdr: &BaseHeader, out: &mut [u8]) {
    B::write_u32(&mut out[0..4], hdr.magic);
    B::write_u32(&mut out[4..8], hdr.mtype);
    B::write_u32(&mut out[8..12], hdr.seq);
    B::write_u32(&mut out[12..16], hdr.nodeid);
    B::write_u32(&mut out[16..20], hdr.msgsize);
    out[20] = hdr.ext_flag as u8;
}

fn unpack_with<B: ByteOrder>(raw: &[u8]) -> BaseHeader {
    BaseHeader {
        magic: B::read_u32(&raw[0..4]),
        mtype: B::read_u32(&raw[4..8]),
        seq: B::read_u32(&raw[8..12]),
        nodeid: B::read_u32(&raw[12..16]),
        msgsize: B::read_u32(&raw[16..20]),
        ext_flag: raw[20] != 0,
    }
}

impl Encoding {
    pub fn from_same_arch(same_arch: bool) -> Self {
        if same_arch {
            Self::SameArch
        } else {
            Self::Portable
        }
    }

    /// Writes `hdr` into the first `BASE_HDR_SIZE` bytes of `out`.
    pub fn pack(self, hdr: &BaseHeader, out: &mut [u8]) {
        match self {
            Self::Portable => pack_with::<BigEndian>(hdr, out),
            Self::SameArch => pack_with::<NativeEndian>(hdr, out),
        }
    }

    pub fn unpack(self, raw: &[u8]) -> Result<BaseHeader> {
        if raw.len() < BASE_HDR_SIZE {
            return Err(Error::BadParam(format!("short header: {} bytes", raw.len())));
        }
        let hdr = match self {
            Self::Portable => unpack_with::<BigEndian>(raw),
            Self::SameArch => unpack_with::<NativeEndian>(raw),
        };
        if hdr.magic != MAGIC {
            return Err(Error::ProtocolViolation(format!("bad magic {:#x}", hdr.magic)));
        }
        Ok(hdr)
    }

    fn write_u32(self, out: &mut [u8], v: u32) {
        match self {
            Self::Portable => BigEndian::write_u32(out, v),
            Self::SameArch => NativeEndian::write_u32(out, v),
        }
    }

    fn read_u32(self, raw: &[u8]) -> u32 {
        match self {
            Self::Portable => BigEndian::read_u32(raw),
            Self::SameArch => NativeEndian::read_u32(raw),
        }
    }

    /// Splits a received payload into the endpoint extension and the body.
    pub fn split_ext<'a>(self, hdr: &BaseHeader, payload: &'a [u8]) -> Result<(Option<&'a [u8]>, &'a [u8])> {
        if !hdr.ext_flag {
            return Ok((None, payload));
        }
        if payload.len() < 4 {
            return Err(Error::BadParam("truncated endpoint extension".into()));
        }
        let len = self.read_u32(&payload[..4]) as usize;
        let rest = &payload[4..];
        if rest.len() < len {
            return Err(Error::BadParam(format!(
                "endpoint extension of {} bytes in {} byte payload",
                len,
                payload.len()
            )));
        }
        Ok((Some(&rest[..len]), &rest[len..]))
    }
}

/// Growable frame buffer with room for the header in front of the payload.
///
/// Payload fields are always written in network byte order. Once
/// `finalize` stamped the header the buffer no longer changes.
#[derive(Debug, Clone)]
pub struct ServerBuf {
    data: Vec<u8>,
    start: usize,
    body: usize,
    finalized: bool,
}

impl Default for ServerBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuf {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(payload: usize) -> Self {
        let mut data = Vec::with_capacity(HDR_PREFIX + payload);
        data.resize(HDR_PREFIX, 0);
        Self {
            data,
            start: HDR_PREFIX,
            body: HDR_PREFIX,
            finalized: false,
        }
    }

    pub fn from_payload(payload: &[u8]) -> Self {
        let mut buf = Self::with_capacity(payload.len());
        buf.put_raw(payload);
        buf
    }

    fn writable(&mut self) -> &mut Vec<u8> {
        debug_assert!(!self.finalized, "write to a finalized server buffer");
        &mut self.data
    }

    pub fn put_u8(&mut self, v: u8) {
        self.writable().push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.writable().extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.writable().extend_from_slice(&v.to_be_bytes());
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.put_raw(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_raw(&mut self, v: &[u8]) {
        self.writable().extend_from_slice(v);
    }

    /// Everything written so far, without header or extension.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.body..]
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Stamps the header, and the endpoint extension if any, in front of the
    /// payload.
    pub fn finalize(&mut self, enc: Encoding, mtype: MsgType, seq: u32, nodeid: u32, ext: Option<&[u8]>) {
        if self.finalized {
            return;
        }
        let ext_size = ext.map_or(0, |ep| 4 + ep.len());
        let payload_len = self.data.len() - self.body;
        let hdr = BaseHeader::new(mtype, seq, nodeid, (payload_len + ext_size) as u32, ext.is_some());
        let need = BASE_HDR_SIZE + ext_size;

        if need > self.body {
            let mut data = vec![0u8; need];
            data.extend_from_slice(&self.data[self.body..]);
            self.data = data;
            self.start = 0;
            self.body = need;
        } else {
            self.start = self.body - need;
        }

        let at = self.start;
        enc.pack(&hdr, &mut self.data[at..at + BASE_HDR_SIZE]);
        if let Some(ep) = ext {
            let at = at + BASE_HDR_SIZE;
            enc.write_u32(&mut self.data[at..at + 4], ep.len() as u32);
            self.data[at + 4..at + 4 + ep.len()].copy_from_slice(ep);
        }
        self.finalized = true;
    }

    /// Header, extension and payload as they go on the wire.
    pub fn frame(&self) -> &[u8] {
        &self.data[self.start..]
    }
}

/// Big-endian cursor over a received payload.
pub struct Reader<'a> {
    cur: Cursor<&'a [u8]>,
}

fn truncated(what: &str) -> Error {
    Error::BadParam(format!("truncated message while reading {}", what))
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data),
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.cur.read_u8().map_err(|_| truncated("u8"))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<BigEndian>().map_err(|_| truncated("u32"))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.cur.read_i32::<BigEndian>().map_err(|_| truncated("i32"))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.get_raw(len)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::BadParam("string is not UTF-8".into()))
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.cur.get_ref();
        let pos = self.cur.position() as usize;
        if data.len().saturating_sub(pos) < len {
            return Err(truncated("byte string"));
        }
        self.cur.set_position((pos + len) as u64);
        Ok(&data[pos..pos + len])
    }

    pub fn rest(&self) -> &'a [u8] {
        let data: &'a [u8] = *self.cur.get_ref();
        &data[self.cur.position() as usize..]
    }
}

/// Frame delimiting for the server's I/O engines. Relayed frames carry the
/// forwarder's `u32` length in front of the header.
pub struct ServerProto {
    pub padding: usize,
    pub enc: Encoding,
}

impl ServerProto {
    pub fn relayed(enc: Encoding) -> Self {
        Self { padding: 4, enc }
    }

    pub fn direct(enc: Encoding) -> Self {
        Self { padding: 0, enc }
    }
}

impl stepio::Protocol for ServerProto {
    type Header = BaseHeader;

    fn recv_padding(&self) -> usize {
        self.padding
    }

    fn header_size(&self) -> usize {
        BASE_HDR_SIZE
    }

    fn unpack_header(&self, raw: &[u8]) -> std::io::Result<BaseHeader> {
        let hdr = self
            .enc
            .unpack(raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        if hdr.msgsize > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes from node {}", hdr.msgsize, hdr.nodeid),
            ));
        }
        Ok(hdr)
    }

    fn payload_size(&self, hdr: &BaseHeader) -> usize {
        hdr.msgsize as usize
    }
}

pub type Engine = stepio::IoEngine<ServerProto>;

/// Completion hook of an outgoing frame.
pub type SendDone = Box<dyn FnOnce(Result<()>) + Send>;

/// A finalized frame queued on an I/O engine.
pub struct OutMsg {
    buf: ServerBuf,
    done: Option<SendDone>,
}

impl OutMsg {
    pub fn new(buf: ServerBuf, done: Option<SendDone>) -> Box<Self> {
        debug_assert!(buf.is_finalized());
        Box::new(Self { buf, done })
    }
}

impl stepio::Message for OutMsg {
    fn bytes(&self) -> &[u8] {
        self.buf.frame()
    }

    fn complete(self: Box<Self>, result: std::io::Result<()>) {
        if let Some(done) = self.done {
            done(result.map_err(|err| Error::CommFailed(err.to_string())));
        }
    }
}

#[cfg(test)]
mod test {
    use crate::proto::*;

    fn headers() -> Vec<BaseHeader> {
        vec![
            BaseHeader::new(MsgType::FanIn, 0, 0, 0, false),
            BaseHeader::new(MsgType::Ring, 7, 3, 1 << 20, true),
            BaseHeader::new(MsgType::PingPong, u32::MAX, u32::MAX - 1, 12, false),
        ]
    }

    #[test]
    fn header_encodings() {
        for enc in [Encoding::Portable, Encoding::SameArch] {
            for hdr in headers() {
                let mut raw = [0u8; BASE_HDR_SIZE];
                enc.pack(&hdr, &mut raw);
                assert_eq!(enc.unpack(&raw).unwrap(), hdr);
                raw[0] ^= 0xff;
                assert!(matches!(enc.unpack(&raw), Err(Error::ProtocolViolation(_))));
            }
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        use stepio::Protocol;
        for proto in [ServerProto::direct(Encoding::SameArch), ServerProto::relayed(Encoding::Portable)] {
            let mut raw = [0u8; BASE_HDR_SIZE];
            proto.enc.pack(&BaseHeader::new(MsgType::Ring, 1, 0, u32::MAX, false), &mut raw);
            let err = proto.unpack_header(&raw).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

            proto.enc.pack(&BaseHeader::new(MsgType::Ring, 1, 0, MAX_FRAME, false), &mut raw);
            let hdr = proto.unpack_header(&raw).unwrap();
            assert_eq!(proto.payload_size(&hdr), MAX_FRAME as usize);
        }
    }

    #[test]
    fn portable_is_network_order() {
        let mut raw = [0u8; BASE_HDR_SIZE];
        Encoding::Portable.pack(&BaseHeader::new(MsgType::Dmdx, 1, 2, 3, true), &mut raw);
        assert_eq!(&raw[..4], &[0xca, 0xfe, 0xca, 0x11]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 3]);
        assert_eq!(raw[20], 1);
        assert!(Encoding::Portable.unpack(&raw[..20]).is_err());
    }

    #[test]
    fn endpoint_extension_sizes() {
        for enc in [Encoding::Portable, Encoding::SameArch] {
            for len in [0usize, 1, 255, 4096] {
                let ep: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let mut buf = ServerBuf::new();
                buf.put_str("body");
                buf.finalize(enc, MsgType::InitDirect, 9, 4, Some(&ep));

                let frame = buf.frame();
                let hdr = enc.unpack(frame).unwrap();
                assert!(hdr.ext_flag);
                assert_eq!(hdr.msgsize as usize, frame.len() - BASE_HDR_SIZE);
                let (got, body) = enc.split_ext(&hdr, &frame[BASE_HDR_SIZE..]).unwrap();
                assert_eq!(got.unwrap(), &ep[..]);
                assert_eq!(Reader::new(body).get_str().unwrap(), "body");
                assert_eq!(buf.payload(), body);
            }
        }
    }

    #[test]
    fn finalize_in_place() {
        let mut buf = ServerBuf::new();
        buf.put_u32(0xdead_beef);
        let before = buf.payload().as_ptr();
        buf.finalize(Encoding::SameArch, MsgType::FanOut, 1, 0, None);
        assert_eq!(buf.payload().as_ptr(), before);
        assert_eq!(buf.frame().len(), BASE_HDR_SIZE + 4);

        // a second finalize must not restamp
        let frame = buf.frame().to_vec();
        buf.finalize(Encoding::SameArch, MsgType::FanIn, 2, 0, None);
        assert_eq!(buf.frame(), &frame[..]);
    }

    #[test]
    fn truncated_ext_rejected() {
        let hdr = BaseHeader::new(MsgType::Ring, 0, 0, 6, true);
        let mut payload = 10u32.to_ne_bytes().to_vec();
        payload.extend_from_slice(&[1, 2]);
        assert!(Encoding::SameArch.split_ext(&hdr, &payload).is_err());
        assert!(Encoding::SameArch.split_ext(&hdr, &[1]).is_err());
    }

    #[test]
    fn reader_bounds() {
        let mut buf = ServerBuf::new();
        buf.put_u8(1);
        buf.put_i32(-5);
        buf.put_bytes(b"abc");
        let mut rd = Reader::new(buf.payload());
        assert_eq!(rd.get_u8().unwrap(), 1);
        assert_eq!(rd.get_i32().unwrap(), -5);
        assert_eq!(rd.get_bytes().unwrap(), b"abc");
        assert!(rd.rest().is_empty());
        assert!(rd.get_u32().is_err());

        let mut rd = Reader::new(&[0, 0, 0, 9, 1]);
        assert!(rd.get_bytes().is_err());
    }
}
