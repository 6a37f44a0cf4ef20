//! Binary event-stream codec.
//!
//! Every record starts with a tag byte. High-frequency normal entry/exit
//! records use a two-byte compact header (`0x80` set, `0x40` marks an exit,
//! the remaining 14 bits hold the method id). All integers are big-endian and
//! timestamps are 7-byte timer counts; the thread-CPU stamp follows the
//! absolute one only in two-timestamp mode.
//!
//! Thread-scoped records carry no thread id of their own: they apply to the
//! thread selected by the last `SET_FOLLOWING_EVENTS_THREAD` (or `NEW_THREAD`)
//! record.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::warn;

use crate::event::{BlockReason, CallEvent, MethodId, MethodType, ThreadId, Timestamps};

/// Width of one encoded timestamp.
pub const STAMP_BYTES: usize = 7;
const STAMP_MASK: u64 = (1 << (STAMP_BYTES * 8)) - 1;

pub mod tag {
    pub const COMPACT_FLAG: u8 = 0x80;
    pub const COMPACT_EXIT_FLAG: u8 = 0x40;
    pub const COMPACT_ID_MASK: u8 = 0x3F;
    /// Largest method id the compact header can carry.
    pub const COMPACT_MAX_METHOD_ID: u16 = 0x3FFF;

    pub const METHOD_ENTRY: u8 = 1;
    pub const METHOD_EXIT: u8 = 2;
    pub const ROOT_ENTRY: u8 = 3;
    pub const ROOT_EXIT: u8 = 4;
    pub const MARKER_ENTRY: u8 = 5;
    pub const MARKER_EXIT: u8 = 6;
    pub const METHOD_ENTRY_UNSTAMPED: u8 = 7;
    pub const METHOD_EXIT_UNSTAMPED: u8 = 8;
    pub const ROOT_ENTRY_UNSTAMPED: u8 = 9;
    pub const ROOT_EXIT_UNSTAMPED: u8 = 10;
    pub const MARKER_ENTRY_UNSTAMPED: u8 = 11;
    pub const MARKER_EXIT_UNSTAMPED: u8 = 12;
    pub const MONITOR_ENTRY: u8 = 13;
    pub const MONITOR_EXIT: u8 = 14;
    pub const SLEEP_ENTRY: u8 = 15;
    pub const SLEEP_EXIT: u8 = 16;
    pub const WAIT_ENTRY: u8 = 17;
    pub const WAIT_EXIT: u8 = 18;
    pub const PARK_ENTRY: u8 = 19;
    pub const PARK_EXIT: u8 = 20;
    pub const NEW_THREAD: u8 = 21;
    pub const THREADS_SUSPEND: u8 = 22;
    pub const THREADS_RESUME: u8 = 23;
    pub const TIME_ADJUST: u8 = 24;
    pub const SERVLET_REQUEST: u8 = 25;
    pub const SET_FOLLOWING_EVENTS_THREAD: u8 = 26;
    pub const BUFFER_END: u8 = 27;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record at byte {at} truncated: {needed} more bytes needed")]
    Truncated { at: usize, needed: usize },
    #[error("{what} {value} does not fit the wire format")]
    OutOfRange { what: &'static str, value: u64 },
}

/// Method type, entry flag and stamped flag for the method-event tags.
fn method_tag(t: u8) -> Option<(MethodType, bool, bool)> {
    let info = match t {
        tag::METHOD_ENTRY => (MethodType::Normal, true, true),
        tag::METHOD_EXIT => (MethodType::Normal, false, true),
        tag::ROOT_ENTRY => (MethodType::Root, true, true),
        tag::ROOT_EXIT => (MethodType::Root, false, true),
        tag::MARKER_ENTRY => (MethodType::Marker, true, true),
        tag::MARKER_EXIT => (MethodType::Marker, false, true),
        tag::METHOD_ENTRY_UNSTAMPED => (MethodType::Normal, true, false),
        tag::METHOD_EXIT_UNSTAMPED => (MethodType::Normal, false, false),
        tag::ROOT_ENTRY_UNSTAMPED => (MethodType::Root, true, false),
        tag::ROOT_EXIT_UNSTAMPED => (MethodType::Root, false, false),
        tag::MARKER_ENTRY_UNSTAMPED => (MethodType::Marker, true, false),
        tag::MARKER_EXIT_UNSTAMPED => (MethodType::Marker, false, false),
        _ => return None,
    };
    Some(info)
}

fn block_tag(t: u8) -> Option<(BlockReason, bool)> {
    let info = match t {
        tag::MONITOR_ENTRY => (BlockReason::Monitor, true),
        tag::MONITOR_EXIT => (BlockReason::Monitor, false),
        tag::SLEEP_ENTRY => (BlockReason::Sleep, true),
        tag::SLEEP_EXIT => (BlockReason::Sleep, false),
        tag::WAIT_ENTRY => (BlockReason::Wait, true),
        tag::WAIT_EXIT => (BlockReason::Wait, false),
        tag::PARK_ENTRY => (BlockReason::Park, true),
        tag::PARK_EXIT => (BlockReason::Park, false),
        _ => return None,
    };
    Some(info)
}

/// Streaming decoder over one delivered event buffer.
///
/// Unknown tags are logged, counted and skipped one byte at a time so a
/// corrupt byte never stalls the stream. A truncated record ends iteration
/// with a single `Err`.
pub struct EventDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    two_timestamps: bool,
    thread: ThreadId,
    unknown_tags: u64,
    malformed_strings: u64,
    finished: bool,
}

impl<'a> EventDecoder<'a> {
    pub fn new(buf: &'a [u8], two_timestamps: bool) -> Self {
        Self {
            buf,
            pos: 0,
            two_timestamps,
            thread: 0,
            unknown_tags: 0,
            malformed_strings: 0,
            finished: false,
        }
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of unknown tag bytes skipped so far.
    pub fn unknown_tags(&self) -> u64 {
        self.unknown_tags
    }

    /// Number of thread names or servlet paths that were not valid UTF-8.
    /// They are decoded lossily and the record is kept.
    pub fn malformed_strings(&self) -> u64 {
        self.malformed_strings
    }

    pub fn current_thread(&self) -> ThreadId {
        self.thread
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                at: self.pos,
                needed: end - self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn stamp(&mut self) -> Result<u64, WireError> {
        Ok(BigEndian::read_uint(self.take(STAMP_BYTES)?, STAMP_BYTES))
    }

    fn timestamps(&mut self) -> Result<Timestamps, WireError> {
        let abs = self.stamp()?;
        let cpu = if self.two_timestamps {
            Some(self.stamp()?)
        } else {
            None
        };
        Ok(Timestamps { abs, cpu })
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = usize::from(self.u16()?);
        let at = self.pos;
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => {
                warn!(position = at, len, "string is not valid UTF-8, decoding lossily");
                self.malformed_strings += 1;
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }

    fn next_record(&mut self) -> Result<Option<CallEvent>, WireError> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            let start = self.pos;
            let t = self.u8()?;
            let thread = self.thread;

            if t & tag::COMPACT_FLAG != 0 {
                let lo = self.u8()?;
                let method: MethodId = (u16::from(t & tag::COMPACT_ID_MASK) << 8) | u16::from(lo);
                let stamp = Some(self.timestamps()?);
                let kind = MethodType::Normal;
                return Ok(Some(if t & tag::COMPACT_EXIT_FLAG != 0 {
                    CallEvent::MethodExit {
                        thread,
                        method,
                        kind,
                        stamp,
                    }
                } else {
                    CallEvent::MethodEntry {
                        thread,
                        method,
                        kind,
                        stamp,
                    }
                }));
            }

            if let Some((kind, is_entry, stamped)) = method_tag(t) {
                let method = self.u16()?;
                let stamp = if stamped {
                    Some(self.timestamps()?)
                } else {
                    None
                };
                return Ok(Some(if is_entry {
                    CallEvent::MethodEntry {
                        thread,
                        method,
                        kind,
                        stamp,
                    }
                } else {
                    CallEvent::MethodExit {
                        thread,
                        method,
                        kind,
                        stamp,
                    }
                }));
            }

            if let Some((reason, is_entry)) = block_tag(t) {
                let stamp = self.timestamps()?;
                return Ok(Some(if is_entry {
                    CallEvent::BlockEntry {
                        thread,
                        reason,
                        stamp,
                    }
                } else {
                    CallEvent::BlockExit {
                        thread,
                        reason,
                        stamp,
                    }
                }));
            }

            match t {
                tag::NEW_THREAD => {
                    let thread = ThreadId::from(self.u16()?);
                    let name = self.string()?;
                    self.thread = thread;
                    return Ok(Some(CallEvent::NewThread { thread, name }));
                }
                tag::THREADS_SUSPEND => {
                    let time = self.stamp()?;
                    return Ok(Some(CallEvent::ThreadsSuspend { time }));
                }
                tag::THREADS_RESUME => {
                    let time = self.stamp()?;
                    return Ok(Some(CallEvent::ThreadsResume { time }));
                }
                tag::TIME_ADJUST => {
                    let delta = self.timestamps()?;
                    return Ok(Some(CallEvent::TimeAdjust { thread, delta }));
                }
                tag::SERVLET_REQUEST => {
                    let kind = self.u8()?;
                    let path = self.string()?;
                    return Ok(Some(CallEvent::ServletRequest { thread, kind, path }));
                }
                tag::SET_FOLLOWING_EVENTS_THREAD => {
                    self.thread = ThreadId::from(self.u16()?);
                }
                tag::BUFFER_END => {
                    self.pos = self.buf.len();
                    return Ok(None);
                }
                unknown => {
                    warn!(tag = unknown, position = start, "unknown event tag, skipping one byte");
                    self.unknown_tags += 1;
                    self.pos = start + 1;
                }
            }
        }
    }
}

impl Iterator for EventDecoder<'_> {
    type Item = Result<CallEvent, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Builds event buffers in the format [`EventDecoder`] reads.
#[derive(Debug, Default)]
pub struct EventEncoder {
    buf: Vec<u8>,
    two_timestamps: bool,
    compact: bool,
    thread: Option<ThreadId>,
}

impl EventEncoder {
    pub fn new(two_timestamps: bool) -> Self {
        Self {
            two_timestamps,
            ..Self::default()
        }
    }

    /// Emit normal, stamped entry/exit records in the two-byte compact form
    /// whenever the method id fits.
    pub fn with_compact_events(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append raw bytes, bypassing validation.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn put_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn put_stamp(&mut self, v: u64) {
        let mut b = [0u8; STAMP_BYTES];
        BigEndian::write_uint(&mut b, v & STAMP_MASK, STAMP_BYTES);
        self.buf.extend_from_slice(&b);
    }

    fn put_timestamps(&mut self, stamp: Timestamps) {
        self.put_stamp(stamp.abs);
        if self.two_timestamps {
            self.put_stamp(stamp.cpu.unwrap_or(0));
        }
    }

    fn put_string(&mut self, s: &str) -> Result<(), WireError> {
        let len = u16::try_from(s.len()).map_err(|_| WireError::OutOfRange {
            what: "string length",
            value: s.len() as u64,
        })?;
        self.put_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn wire_thread(thread: ThreadId) -> Result<u16, WireError> {
        u16::try_from(thread).map_err(|_| WireError::OutOfRange {
            what: "thread id",
            value: u64::from(thread),
        })
    }

    fn select_thread(&mut self, thread: ThreadId) -> Result<(), WireError> {
        if self.thread != Some(thread) {
            let id = Self::wire_thread(thread)?;
            self.buf.push(tag::SET_FOLLOWING_EVENTS_THREAD);
            self.put_u16(id);
            self.thread = Some(thread);
        }
        Ok(())
    }

    fn put_method(
        &mut self,
        is_entry: bool,
        method: MethodId,
        kind: MethodType,
        stamp: Option<Timestamps>,
    ) {
        if let (true, MethodType::Normal, Some(s)) = (self.compact, kind, stamp) {
            if method <= tag::COMPACT_MAX_METHOD_ID {
                let mut hi = tag::COMPACT_FLAG | (method >> 8) as u8;
                if !is_entry {
                    hi |= tag::COMPACT_EXIT_FLAG;
                }
                self.buf.push(hi);
                self.buf.push((method & 0xFF) as u8);
                self.put_timestamps(s);
                return;
            }
        }
        let t = match (kind, is_entry, stamp.is_some()) {
            (MethodType::Normal, true, true) => tag::METHOD_ENTRY,
            (MethodType::Normal, false, true) => tag::METHOD_EXIT,
            (MethodType::Root, true, true) => tag::ROOT_ENTRY,
            (MethodType::Root, false, true) => tag::ROOT_EXIT,
            (MethodType::Marker, true, true) => tag::MARKER_ENTRY,
            (MethodType::Marker, false, true) => tag::MARKER_EXIT,
            (MethodType::Normal, true, false) => tag::METHOD_ENTRY_UNSTAMPED,
            (MethodType::Normal, false, false) => tag::METHOD_EXIT_UNSTAMPED,
            (MethodType::Root, true, false) => tag::ROOT_ENTRY_UNSTAMPED,
            (MethodType::Root, false, false) => tag::ROOT_EXIT_UNSTAMPED,
            (MethodType::Marker, true, false) => tag::MARKER_ENTRY_UNSTAMPED,
            (MethodType::Marker, false, false) => tag::MARKER_EXIT_UNSTAMPED,
        };
        self.buf.push(t);
        self.put_u16(method);
        if let Some(s) = stamp {
            self.put_timestamps(s);
        }
    }

    pub fn push(&mut self, event: &CallEvent) -> Result<(), WireError> {
        match event {
            CallEvent::MethodEntry {
                thread,
                method,
                kind,
                stamp,
            } => {
                self.select_thread(*thread)?;
                self.put_method(true, *method, *kind, *stamp);
            }
            CallEvent::MethodExit {
                thread,
                method,
                kind,
                stamp,
            } => {
                self.select_thread(*thread)?;
                self.put_method(false, *method, *kind, *stamp);
            }
            CallEvent::BlockEntry {
                thread,
                reason,
                stamp,
            }
            | CallEvent::BlockExit {
                thread,
                reason,
                stamp,
            } => {
                let is_entry = matches!(event, CallEvent::BlockEntry { .. });
                self.select_thread(*thread)?;
                let t = match (reason, is_entry) {
                    (BlockReason::Monitor, true) => tag::MONITOR_ENTRY,
                    (BlockReason::Monitor, false) => tag::MONITOR_EXIT,
                    (BlockReason::Sleep, true) => tag::SLEEP_ENTRY,
                    (BlockReason::Sleep, false) => tag::SLEEP_EXIT,
                    (BlockReason::Wait, true) => tag::WAIT_ENTRY,
                    (BlockReason::Wait, false) => tag::WAIT_EXIT,
                    (BlockReason::Park, true) => tag::PARK_ENTRY,
                    (BlockReason::Park, false) => tag::PARK_EXIT,
                };
                self.buf.push(t);
                self.put_timestamps(*stamp);
            }
            CallEvent::NewThread { thread, name } => {
                let id = Self::wire_thread(*thread)?;
                self.buf.push(tag::NEW_THREAD);
                self.put_u16(id);
                self.put_string(name)?;
                self.thread = Some(*thread);
            }
            CallEvent::ThreadsSuspend { time } => {
                self.buf.push(tag::THREADS_SUSPEND);
                self.put_stamp(*time);
            }
            CallEvent::ThreadsResume { time } => {
                self.buf.push(tag::THREADS_RESUME);
                self.put_stamp(*time);
            }
            CallEvent::TimeAdjust { thread, delta } => {
                self.select_thread(*thread)?;
                self.buf.push(tag::TIME_ADJUST);
                self.put_timestamps(*delta);
            }
            CallEvent::ServletRequest { thread, kind, path } => {
                self.select_thread(*thread)?;
                self.buf.push(tag::SERVLET_REQUEST);
                self.buf.push(*kind);
                self.put_string(path)?;
            }
        }
        Ok(())
    }

    pub fn push_all<'e>(
        &mut self,
        events: impl IntoIterator<Item = &'e CallEvent>,
    ) -> Result<(), WireError> {
        for event in events {
            self.push(event)?;
        }
        Ok(())
    }
}
