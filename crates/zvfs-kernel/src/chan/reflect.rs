//! Channels whose operations are fulfilled by a user handler.
//!
//! [`ReflectedChannel::create`] asks the handler's `initialize` for the
//! methods it supports, validates that list and registers the handler with
//! the calling thread's [`EventQueue`]. The returned [`Channel`] may be moved
//! anywhere; calls off the owner thread are forwarded.

use std::cell::{Cell, RefCell};
use std::io::SeekFrom;
use std::str::FromStr;
use std::thread::{self, ThreadId};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::oneshot;

use super::bypass::ErrorBundle;
use super::error::{ChanError, ChanResult};
use super::forward::{self, EventQueue, Message, Op, Reply};
use super::{ChanMode, Channel, ChannelDriver, DriverCaps, EventMask};

static NEXT_HANDLE: Mutex<u64> = Mutex::new(0);

/// What a handler method returns. Errors are flat option/value lists with an
/// optional trailing message.
pub type HandlerResult<T> = Result<T, ErrorBundle>;

/// Methods a handler can declare from `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum MethodName {
    Initialize,
    Finalize,
    Watch,
    Read,
    Write,
    Seek,
    Configure,
    Cget,
    Cgetall,
    Blocking,
}

impl MethodName {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// A set of [`MethodName`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u16);

impl MethodSet {
    /// Every handler must provide these.
    pub const REQUIRED: MethodSet = MethodSet(
        (1 << MethodName::Initialize as u16)
            | (1 << MethodName::Finalize as u16)
            | (1 << MethodName::Watch as u16),
    );

    /// The empty set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Add a method.
    pub fn insert(&mut self, method: MethodName) {
        self.0 |= method.bit();
    }

    /// Membership.
    pub fn contains(&self, method: MethodName) -> bool {
        self.0 & method.bit() != 0
    }

    /// Whether every method in `other` is present.
    pub fn contains_all(&self, other: MethodSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no method is present.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Methods in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = MethodName> + '_ {
        MethodName::iter().filter(|m| self.contains(*m))
    }
}

impl FromIterator<MethodName> for MethodSet {
    fn from_iter<I: IntoIterator<Item = MethodName>>(iter: I) -> Self {
        let mut set = MethodSet::empty();
        for m in iter {
            set.insert(m);
        }
        set
    }
}

/// User code behind a reflected channel.
///
/// `id` is always the channel's handle name. Optional methods only run when
/// `initialize` listed them; their defaults are never reached otherwise.
pub trait ChannelHandler {
    /// Declare supported method names for a channel opened with `mode`.
    fn initialize(&mut self, id: &str, mode: ChanMode) -> HandlerResult<Vec<String>>;

    /// The channel is closing.
    fn finalize(&mut self, id: &str) -> HandlerResult<()>;

    /// Event interest changed.
    fn watch(&mut self, id: &str, events: EventMask) -> HandlerResult<()>;

    /// Produce at most `count` bytes. An empty result means end of stream.
    fn read(&mut self, _id: &str, _count: usize) -> HandlerResult<Vec<u8>> {
        Err(ErrorBundle::message("read not implemented"))
    }

    /// Consume a prefix of `data`, returning its length.
    fn write(&mut self, _id: &str, _data: &[u8]) -> HandlerResult<usize> {
        Err(ErrorBundle::message("write not implemented"))
    }

    /// Reposition, returning the new absolute offset.
    fn seek(&mut self, _id: &str, _pos: SeekFrom) -> HandlerResult<i64> {
        Err(ErrorBundle::message("seek not implemented"))
    }

    /// Switch blocking mode.
    fn blocking(&mut self, _id: &str, _blocking: bool) -> HandlerResult<()> {
        Err(ErrorBundle::message("blocking not implemented"))
    }

    /// Set one option.
    fn configure(&mut self, _id: &str, _option: &str, _value: &str) -> HandlerResult<()> {
        Err(ErrorBundle::message("configure not implemented"))
    }

    /// Read one option.
    fn cget(&mut self, _id: &str, _option: &str) -> HandlerResult<String> {
        Err(ErrorBundle::message("cget not implemented"))
    }

    /// Read all options as a flat name/value list.
    fn cgetall(&mut self, _id: &str) -> HandlerResult<Vec<String>> {
        Err(ErrorBundle::message("cgetall not implemented"))
    }
}

type EventCallback = Box<dyn FnMut(&str, EventMask)>;

/// Owner-side state of one reflected channel.
pub(crate) struct Slot {
    name: String,
    mode: ChanMode,
    methods: MethodSet,
    interest: Cell<EventMask>,
    handler: RefCell<Box<dyn ChannelHandler>>,
    on_event: RefCell<Option<EventCallback>>,
}

impl Slot {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

fn next_handle() -> String {
    let mut counter = NEXT_HANDLE.lock();
    let name = format!("rc{}", *counter);
    *counter += 1;
    name
}

fn handler_error(bundle: ErrorBundle) -> ChanError {
    match bundle.errno() {
        Some(errno) => ChanError::Posix(errno),
        None => ChanError::Bypass(bundle),
    }
}

/// Ask `initialize` for the method list and check it against `mode`.
fn negotiate(
    handler: &mut dyn ChannelHandler,
    id: &str,
    mode: ChanMode,
    prefix: &str,
) -> ChanResult<MethodSet> {
    let names = handler.initialize(id, mode).map_err(|bundle| {
        ChanError::handler(format!(
            "chan handler \"{prefix} initialize\" returned {}",
            bundle.text().map(str::to_string).unwrap_or_else(|| bundle.to_string())
        ))
    })?;

    let mut methods = MethodSet::empty();
    for name in &names {
        let method = MethodName::from_str(name).map_err(|_| {
            let valid: Vec<String> = MethodName::iter().map(|m| m.to_string()).collect();
            ChanError::handler(format!(
                "chan handler \"{prefix} initialize\" returned bad method \"{name}\": must be {}",
                valid.join(", ")
            ))
        })?;
        methods.insert(method);
    }

    if !methods.contains_all(MethodSet::REQUIRED) {
        return Err(ChanError::handler(format!(
            "chan handler \"{prefix}\" does not support all required methods"
        )));
    }
    if mode.readable && !methods.contains(MethodName::Read) {
        return Err(ChanError::handler(format!(
            "chan handler \"{prefix}\" lacks a \"read\" method"
        )));
    }
    if mode.writable && !methods.contains(MethodName::Write) {
        return Err(ChanError::handler(format!(
            "chan handler \"{prefix}\" lacks a \"write\" method"
        )));
    }
    match (
        methods.contains(MethodName::Cget),
        methods.contains(MethodName::Cgetall),
    ) {
        (true, false) => Err(ChanError::handler(format!(
            "chan handler \"{prefix}\" supports \"cget\" but not \"cgetall\""
        ))),
        (false, true) => Err(ChanError::handler(format!(
            "chan handler \"{prefix}\" supports \"cgetall\" but not \"cget\""
        ))),
        _ => Ok(methods),
    }
}

/// Run one operation against the handler, enforcing its post-conditions.
/// Must be called on the owner thread.
pub(crate) fn perform(slot: &Slot, op: Op) -> ChanResult<Reply> {
    let id = slot.name.as_str();
    let mut handler = slot
        .handler
        .try_borrow_mut()
        .map_err(|_| ChanError::handler(format!("reentrant call on channel \"{id}\"")))?;

    match op {
        Op::Close => {
            if !slot.methods.is_empty() {
                handler.finalize(id).map_err(handler_error)?;
            }
            Ok(Reply::Done)
        }
        Op::Read(count) => {
            let data = handler.read(id, count).map_err(handler_error)?;
            if data.len() > count {
                return Err(ChanError::protocol("read delivered more than requested"));
            }
            Ok(Reply::Data(data))
        }
        Op::Write(data) => {
            let written = handler.write(id, &data).map_err(handler_error)?;
            if written == 0 && !data.is_empty() {
                return Err(ChanError::protocol("write wrote nothing"));
            }
            if written > data.len() {
                return Err(ChanError::protocol("write wrote more than requested"));
            }
            Ok(Reply::Count(written))
        }
        Op::Seek(pos) => {
            let offset = handler.seek(id, pos).map_err(handler_error)?;
            if offset < 0 {
                return Err(ChanError::protocol("Tried to seek before origin"));
            }
            Ok(Reply::Offset(offset as u64))
        }
        Op::Watch(events) => {
            let mask = events.intersect(slot.mode);
            if mask == slot.interest.get() {
                return Ok(Reply::Done);
            }
            slot.interest.set(mask);
            handler.watch(id, mask).map_err(handler_error)?;
            Ok(Reply::Done)
        }
        Op::Blocking(blocking) => {
            handler.blocking(id, blocking).map_err(handler_error)?;
            Ok(Reply::Done)
        }
        Op::Configure(option, value) => {
            handler.configure(id, &option, &value).map_err(handler_error)?;
            Ok(Reply::Done)
        }
        Op::Cget(option) => {
            let value = handler.cget(id, &option).map_err(handler_error)?;
            Ok(Reply::Options(vec![(option, value)]))
        }
        Op::CgetAll => {
            let items = handler.cgetall(id).map_err(handler_error)?;
            if items.len() % 2 != 0 {
                let n = items.len();
                return Err(ChanError::protocol(format!(
                    "Expected list with even number of elements, got {n} {} instead",
                    if n == 1 { "element" } else { "elements" }
                )));
            }
            let pairs = items
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Ok(Reply::Options(pairs))
        }
    }
}

/// Deliver events to the channel's callback. Owner thread only.
pub(crate) fn post_event(name: &str, events: EventMask) -> ChanResult<()> {
    let slot = forward::find_slot(name).ok_or_else(|| {
        ChanError::handler(format!("can not find reflected channel named \"{name}\""))
    })?;
    if events.is_empty() {
        return Err(ChanError::handler("bad event list: is empty"));
    }
    if !slot.interest.get().contains(events) {
        return Err(ChanError::handler(format!(
            "tried to post events channel \"{name}\" is not interested in"
        )));
    }
    match slot.on_event.try_borrow_mut() {
        Ok(mut callback) => match callback.as_mut() {
            Some(f) => f(name, events),
            None => tracing::trace!("no event callback on {}", name),
        },
        Err(_) => tracing::warn!("event for {} posted from inside its own callback", name),
    }
    Ok(())
}

/// Driver half of a reflected channel.
pub struct ReflectedChannel {
    name: String,
    owner: ThreadId,
    tx: Sender<Message>,
    methods: MethodSet,
    closed: bool,
}

impl std::fmt::Debug for ReflectedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectedChannel")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("methods", &self.methods)
            .finish()
    }
}

impl ReflectedChannel {
    /// Create a channel backed by `handler`, owned by the calling thread.
    ///
    /// `prefix` names the handler in error messages. When the method list is
    /// rejected the handler is dropped without its `finalize` being called.
    pub fn create(
        mode: ChanMode,
        prefix: &str,
        handler: impl ChannelHandler + 'static,
    ) -> ChanResult<Channel> {
        if mode.is_empty() {
            return Err(ChanError::handler("bad mode list: is empty"));
        }
        let queue = EventQueue::current();
        let name = next_handle();
        let mut handler: Box<dyn ChannelHandler> = Box::new(handler);

        let methods = match negotiate(handler.as_mut(), &name, mode, prefix) {
            Ok(methods) => methods,
            Err(e) => {
                tracing::debug!("reflected channel {} rejected: {}", name, e);
                return Err(e);
            }
        };

        forward::install_slot(Slot {
            name: name.clone(),
            mode,
            methods,
            interest: Cell::new(EventMask::NONE),
            handler: RefCell::new(handler),
            on_event: RefCell::new(None),
        })?;
        tracing::debug!("created reflected channel {} ({:?})", name, methods);

        let driver = ReflectedChannel {
            name: name.clone(),
            owner: queue.owner(),
            tx: queue.sender(),
            methods,
            closed: false,
        };
        Ok(Channel::new(name, mode, Box::new(driver)))
    }

    /// Install the callback that receives posted events. Owner thread only.
    pub fn set_event_callback(
        name: &str,
        callback: impl FnMut(&str, EventMask) + 'static,
    ) -> ChanResult<()> {
        let slot = forward::find_slot(name).ok_or_else(|| {
            ChanError::handler(format!("can not find reflected channel named \"{name}\""))
        })?;
        *slot.on_event.borrow_mut() = Some(Box::new(callback));
        Ok(())
    }

    /// Post events to a channel owned by the calling thread. Posting events
    /// the channel hasn't asked for through `watch` is an error.
    pub fn post_event(name: &str, events: EventMask) -> ChanResult<()> {
        post_event(name, events)
    }

    /// Methods the handler declared.
    pub fn methods(&self) -> MethodSet {
        self.methods
    }

    fn call(&mut self, op: Op) -> ChanResult<Reply> {
        if thread::current().id() == self.owner {
            return forward::invoke_local(&self.name, op);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Forward {
                name: self.name.clone(),
                op,
                reply,
            })
            .map_err(|_| ChanError::OwnerLost)?;
        rx.blocking_recv().map_err(|_| ChanError::OwnerLost)?
    }
}

fn unexpected(reply: Reply) -> ChanError {
    ChanError::protocol(format!("unexpected handler reply {reply:?}"))
}

impl ChannelDriver for ReflectedChannel {
    fn type_name(&self) -> &'static str {
        "reflected"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            seek: self.methods.contains(MethodName::Seek),
            blocking: self.methods.contains(MethodName::Blocking),
            set_option: self.methods.contains(MethodName::Configure),
            get_option: self.methods.contains(MethodName::Cget),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ChanResult<usize> {
        match self.call(Op::Read(buf.len()))? {
            Reply::Data(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            other => Err(unexpected(other)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> ChanResult<usize> {
        match self.call(Op::Write(buf.to_vec()))? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> ChanResult<u64> {
        match self.call(Op::Seek(pos))? {
            Reply::Offset(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn close(&mut self) -> ChanResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.call(Op::Close).map(|_| ())
    }

    fn watch(&mut self, interest: EventMask) {
        if self.closed {
            return;
        }
        if let Err(e) = self.call(Op::Watch(interest)) {
            tracing::warn!("watch on {} failed: {}", self.name, e);
        }
    }

    fn set_blocking(&mut self, blocking: bool) -> ChanResult<()> {
        self.call(Op::Blocking(blocking)).map(|_| ())
    }

    fn get_option(&mut self, name: Option<&str>) -> ChanResult<Vec<(String, String)>> {
        let op = match name {
            Some(option) => Op::Cget(option.to_string()),
            None => Op::CgetAll,
        };
        match self.call(op)? {
            Reply::Options(pairs) => Ok(pairs),
            other => Err(unexpected(other)),
        }
    }

    fn set_option(&mut self, name: &str, value: &str) -> ChanResult<()> {
        self.call(Op::Configure(name.to_string(), value.to_string()))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// Serves a fixed buffer and records every call.
    struct Script {
        methods: Vec<&'static str>,
        data: Vec<u8>,
        pos: usize,
        log: Rc<RefCell<Vec<String>>>,
        write_report: Option<usize>,
        fail_read: Option<&'static str>,
        options: Vec<String>,
    }

    impl Script {
        fn new(methods: &[&'static str], log: Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                methods: methods.to_vec(),
                data: b"hello reflected world".to_vec(),
                pos: 0,
                log,
                write_report: None,
                fail_read: None,
                options: vec!["-color".into(), "blue".into()],
            }
        }
    }

    impl ChannelHandler for Script {
        fn initialize(&mut self, _id: &str, mode: ChanMode) -> HandlerResult<Vec<String>> {
            self.log.borrow_mut().push(format!("initialize {}", mode.names().join(" ")));
            Ok(self.methods.iter().map(|m| m.to_string()).collect())
        }

        fn finalize(&mut self, _id: &str) -> HandlerResult<()> {
            self.log.borrow_mut().push("finalize".into());
            Ok(())
        }

        fn watch(&mut self, _id: &str, events: EventMask) -> HandlerResult<()> {
            self.log.borrow_mut().push(format!("watch {}", events.names().join(" ")));
            Ok(())
        }

        fn read(&mut self, _id: &str, count: usize) -> HandlerResult<Vec<u8>> {
            if let Some(msg) = self.fail_read {
                return Err(ErrorBundle::message(msg));
            }
            let end = (self.pos + count).min(self.data.len());
            let out = self.data[self.pos..end].to_vec();
            self.pos = end;
            Ok(out)
        }

        fn write(&mut self, _id: &str, data: &[u8]) -> HandlerResult<usize> {
            Ok(self.write_report.unwrap_or(data.len()))
        }

        fn seek(&mut self, _id: &str, pos: SeekFrom) -> HandlerResult<i64> {
            let target = match pos {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::Current(d) => self.pos as i64 + d,
                SeekFrom::End(d) => self.data.len() as i64 + d,
            };
            if target >= 0 {
                self.pos = target as usize;
            }
            Ok(target)
        }

        fn cget(&mut self, _id: &str, option: &str) -> HandlerResult<String> {
            Ok(format!("value of {option}"))
        }

        fn cgetall(&mut self, _id: &str) -> HandlerResult<Vec<String>> {
            Ok(self.options.clone())
        }
    }

    fn log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_method_names_parse() {
        assert_eq!(MethodName::from_str("cgetall").unwrap(), MethodName::Cgetall);
        assert!(MethodName::from_str("Read").is_err());
        let set: MethodSet = [MethodName::Initialize, MethodName::Finalize, MethodName::Watch]
            .into_iter()
            .collect();
        assert_eq!(set, MethodSet::REQUIRED);
        assert_eq!(set.iter().count(), 3);
    }

    #[test]
    fn test_handles_are_unique() {
        let a = next_handle();
        let b = next_handle();
        assert_ne!(a, b);
        assert!(a.starts_with("rc"));
    }

    #[test]
    fn test_missing_required_method() {
        let err = ReflectedChannel::create(
            ChanMode::READ,
            "myhandler",
            Script::new(&["initialize", "read", "watch"], log()),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "chan handler \"myhandler\" does not support all required methods"
        );
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = ReflectedChannel::create(
            ChanMode::READ,
            "h",
            Script::new(&["initialize", "finalize", "watch", "read", "frobnicate"], log()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad method \"frobnicate\""));
    }

    #[test]
    fn test_cgetall_without_cget() {
        let err = ReflectedChannel::create(
            ChanMode::READ,
            "h",
            Script::new(&["initialize", "finalize", "watch", "read", "cgetall"], log()),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "chan handler \"h\" supports \"cgetall\" but not \"cget\""
        );
    }

    #[test]
    fn test_read_seek_and_options() {
        let calls = log();
        let mut chan = ReflectedChannel::create(
            ChanMode::READ,
            "h",
            Script::new(
                &["initialize", "finalize", "watch", "read", "seek", "cget", "cgetall"],
                calls.clone(),
            ),
        )
        .unwrap();
        assert!(chan.caps().seek);
        assert!(!chan.caps().blocking);

        let mut buf = [0u8; 5];
        assert_eq!(chan.read_some(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(chan.seek_to(SeekFrom::Start(6)).unwrap(), 6);
        assert_eq!(chan.read_to_vec().unwrap(), b"reflected world");

        assert_eq!(chan.cget("-color").unwrap(), "value of -color");
        assert_eq!(
            chan.cget_all().unwrap(),
            vec![("-color".to_string(), "blue".to_string())]
        );
        assert!(matches!(
            chan.set_blocking(false),
            Err(ChanError::Unsupported("blocking"))
        ));

        chan.close().unwrap();
        assert_eq!(calls.borrow().first().unwrap(), "initialize read");
        assert_eq!(calls.borrow().last().unwrap(), "finalize");
    }

    #[test]
    fn test_seek_before_origin() {
        let mut chan = ReflectedChannel::create(
            ChanMode::READ,
            "h",
            Script::new(&["initialize", "finalize", "watch", "read", "seek"], log()),
        )
        .unwrap();
        let err = chan.seek_to(SeekFrom::Current(-10)).unwrap_err();
        assert_eq!(err.to_string(), "{Tried to seek before origin}");
        assert_eq!(
            chan.take_error().unwrap().text(),
            Some("Tried to seek before origin")
        );
    }

    #[test]
    fn test_write_wrote_nothing() {
        let mut script = Script::new(&["initialize", "finalize", "watch", "write"], log());
        script.write_report = Some(0);
        let mut chan = ReflectedChannel::create(ChanMode::WRITE, "h", script).unwrap();
        let err = chan.write_some(b"abc").unwrap_err();
        assert_eq!(err.to_string(), "{write wrote nothing}");
    }

    #[test]
    fn test_errno_signal() {
        let mut script = Script::new(&["initialize", "finalize", "watch", "read"], log());
        script.fail_read = Some("EAGAIN");
        let mut chan = ReflectedChannel::create(ChanMode::READ, "h", script).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(chan.read_some(&mut buf), Err(ChanError::Posix(11))));
        assert!(chan.take_error().is_none());
    }

    #[test]
    fn test_handler_error_becomes_bypass() {
        let mut script = Script::new(&["initialize", "finalize", "watch", "read"], log());
        script.fail_read = Some("disk on fire");
        let mut chan = ReflectedChannel::create(ChanMode::READ, "h", script).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(chan.read_some(&mut buf), Err(ChanError::Bypass(_))));
        assert_eq!(chan.take_error().unwrap().text(), Some("disk on fire"));
    }

    #[test]
    fn test_odd_cgetall_rejected() {
        let mut script = Script::new(
            &["initialize", "finalize", "watch", "read", "cget", "cgetall"],
            log(),
        );
        script.options = vec!["-lonely".into()];
        let mut chan = ReflectedChannel::create(ChanMode::READ, "h", script).unwrap();
        assert_eq!(
            chan.cget_all().unwrap_err().to_string(),
            "{Expected list with even number of elements, got 1 element instead}"
        );
    }

    #[test]
    fn test_watch_dedup_and_postevent() {
        let calls = log();
        let mut chan = ReflectedChannel::create(
            ChanMode::READ,
            "h",
            Script::new(&["initialize", "finalize", "watch", "read"], calls.clone()),
        )
        .unwrap();
        let name = chan.name().to_string();

        assert!(ReflectedChannel::post_event(&name, EventMask::READ).is_err());

        chan.watch(EventMask::READ_WRITE).unwrap();
        chan.watch(EventMask::READ).unwrap();
        let watches: Vec<_> = calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with("watch"))
            .cloned()
            .collect();
        assert_eq!(watches, vec!["watch read"]);

        let seen = Rc::new(Cell::new(EventMask::NONE));
        let sink = seen.clone();
        ReflectedChannel::set_event_callback(&name, move |_, ev| sink.set(ev)).unwrap();
        ReflectedChannel::post_event(&name, EventMask::READ).unwrap();
        assert_eq!(seen.get(), EventMask::READ);

        let err = ReflectedChannel::post_event(&name, EventMask::WRITE).unwrap_err();
        assert!(err.to_string().contains("is not interested in"));
        assert!(ReflectedChannel::post_event(&name, EventMask::NONE).is_err());
    }
}
