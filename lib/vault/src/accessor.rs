use crate::addr;
use crate::prompt;
use crate::proto::message::{self, flags, MessageType, MAX_MESSAGE_SIZE};
use crate::proto::support::{ProtoError, ProtoResult};
use byteorder::{NativeEndian, WriteBytesExt};
use hashbrown::HashMap;
use keep::crypto;
use keep::logging;
use keep::mem::secured::SecuredBuf;
use keep::pool::SlotPool;
use lazy_static::lazy_static;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Mutex;

/// Number of random bytes carried by a `Ping` nonce.
const PING_NONCE_SIZE: usize = 128;

/// Non owning view into a secret retained by the accessor. The start
/// address doubles as the view's identity: callers that cannot carry the
/// struct across a language boundary release by address alone.
///
/// The bytes stay valid until the view is released back to the accessor
/// that produced it.
#[derive(Debug, Copy, Clone)]
pub struct SecretView {
    address: *const u8,
    length: usize,
}

// Views are plain (address, length) pairs; the pointee is owned by the
// accessor's retention table.
unsafe impl Send for SecretView {}

impl SecretView {
    /// The view returned by failed operations.
    pub const EMPTY: SecretView = SecretView {
        address: ptr::null(),
        length: 0,
    };

    #[inline]
    fn retained(bytes: &[u8]) -> SecretView {
        SecretView {
            address: bytes.as_ptr(),
            length: bytes.len(),
        }
    }

    /// Bytes of the secret.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.address, self.length) }
    }

    /// Start address identifying this view in the retention table.
    #[inline]
    pub fn addr(&self) -> usize {
        self.address as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Options controlling `get_secret`.
#[derive(Debug, Default, Copy, Clone)]
pub struct GetOptions<'a> {
    /// Prompt the user when the server has no answer.
    pub prompt: Option<&'a str>,
    /// Write a prompted secret back to the server.
    pub update: bool,
    /// Ask the server to delete the entry once it replied.
    pub remove: bool,
}

impl<'a> GetOptions<'a> {
    #[inline]
    pub fn new() -> GetOptions<'a> {
        Default::default()
    }

    #[inline]
    pub fn prompt(mut self, prompt: &'a str) -> GetOptions<'a> {
        self.prompt = Some(prompt);
        self
    }

    #[inline]
    pub fn update(mut self, update: bool) -> GetOptions<'a> {
        self.update = update;
        self
    }

    #[inline]
    pub fn remove(mut self, remove: bool) -> GetOptions<'a> {
        self.remove = remove;
        self
    }
}

/// Client side façade over the storage daemon. Owns the resolved server
/// address, hardened scratch buffers for request and reply frames, and the
/// retention table backing every view it hands out.
///
/// A process wide instance is available through the module level
/// functions; explicit instances serve callers that want their own state.
pub struct Accessor {
    address: Option<PathBuf>,
    input: SecuredBuf,
    output: SecuredBuf,
    retained: SlotPool<SecuredBuf>,
    handles: HashMap<usize, usize>,
    log: logging::Logger,
}

impl Accessor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Accessor {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Accessor {
            address: None,
            input: SecuredBuf::zeroed(MAX_MESSAGE_SIZE),
            output: SecuredBuf::zeroed(MAX_MESSAGE_SIZE),
            retained: SlotPool::new(),
            handles: HashMap::new(),
            log,
        }
    }

    /// Resolves and validates the socket path, marking the accessor
    /// initialized. A failed resolution leaves it uninitialized and makes
    /// subsequent server touching calls fail gracefully.
    pub fn set_socket_path(&mut self, path: Option<&Path>) -> bool {
        match addr::resolve(path, false) {
            Ok(address) => {
                logging::debug!(self.log, "socket path resolved"; "path" => %address.display());
                self.address = Some(address);
                true
            }
            Err(error) => {
                logging::warn!(self.log, "socket path rejected"; "error" => ?error);
                self.address = None;
                false
            }
        }
    }

    #[inline]
    fn ensure_initialized(&mut self) -> bool {
        self.address.is_some() || self.set_socket_path(None)
    }

    /// True when a server answers a `Ping` with a matching `Pong`.
    pub fn ping(&mut self) -> bool {
        if !self.ensure_initialized() {
            return false;
        }

        match self.ping_exchange() {
            Ok(matched) => matched,
            Err(error) => {
                logging::debug!(self.log, "ping failed"; "error" => ?error);
                false
            }
        }
    }

    /// True when the server holds an entry for `key`.
    pub fn exists(&mut self, key: &[u8]) -> bool {
        if !self.ensure_initialized() {
            return false;
        }

        match self.single_exchange(MessageType::Query, flags::EXISTENCE_ONLY, key) {
            Ok((tag, _, _)) => tag == u8::from(MessageType::Ok),
            Err(error) => {
                logging::debug!(self.log, "existence check failed"; "error" => ?error);
                false
            }
        }
    }

    /// Stores `value` under `key`. With `replace`, an existing entry is
    /// overwritten; without it a collision fails.
    pub fn submit_secret(&mut self, key: &[u8], value: &[u8], replace: bool) -> bool {
        if !self.ensure_initialized() {
            return false;
        }

        let request_flags = if replace { flags::REPLACE_EXISTING } else { 0 };

        match self.submit_exchange(key, value, request_flags) {
            Ok(tag) => tag == u8::from(MessageType::Ok),
            Err(error) => {
                logging::debug!(self.log, "submit failed"; "error" => ?error);
                false
            }
        }
    }

    /// Removes the entry for `key`. With `allow_missing`, removing an
    /// absent key still succeeds.
    pub fn remove_secret(&mut self, key: &[u8], allow_missing: bool) -> bool {
        if !self.ensure_initialized() {
            return false;
        }

        let request_flags = if allow_missing { flags::ALLOW_MISSING } else { 0 };

        match self.single_exchange(MessageType::Delete, request_flags, key) {
            Ok((tag, _, _)) => tag == u8::from(MessageType::Ok),
            Err(error) => {
                logging::debug!(self.log, "remove failed"; "error" => ?error);
                false
            }
        }
    }

    /// Asks the server to shut down. The transport outcome is ignored.
    pub fn terminate_server(&mut self) {
        if !self.ensure_initialized() {
            return;
        }

        if let Ok(length) = message::encode_empty(self.output.as_mut_slice(), MessageType::Terminate, 0) {
            drop(self.send_message(length));
        }
    }

    /// Generates `length` random bytes in hardened memory, retains them and
    /// returns the view.
    pub fn make_secured_key(&mut self, length: usize) -> SecretView {
        self.retain(SecuredBuf::random(length))
    }

    /// Prompts the user for a secret with echo disabled, retains the answer
    /// and returns the view. End of input yields the empty view.
    pub fn ask_secret<'a, R: Into<Option<&'a str>>>(
        &mut self,
        prompt_text: &str,
        retry_prompt: R,
    ) -> SecretView {
        let answer = prompt::ask_secret(prompt_text, retry_prompt);
        self.retain(answer)
    }

    /// Hex encodes `bytes` straight into hardened memory — the encoded form
    /// never exists on the ordinary heap — and retains the result.
    pub fn encode_string(&mut self, bytes: &[u8]) -> SecretView {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";

        let mut encoded = SecuredBuf::with_capacity(bytes.len() * 2);
        for &byte in bytes {
            encoded.push(DIGITS[(byte >> 4) as usize]);
            encoded.push(DIGITS[(byte & 0x0f) as usize]);
        }

        self.retain(encoded)
    }

    /// Hex decodes user supplied text into ordinary memory; empty on
    /// malformed input. Never used on secret material — callers pass only
    /// key strings.
    pub fn decode_string(bytes: &[u8]) -> Vec<u8> {
        if bytes.len() % 2 != 0 {
            return Vec::new();
        }

        let mut decoded = Vec::with_capacity(bytes.len() / 2);
        for pair in bytes.chunks(2) {
            match (hex_value(pair[0]), hex_value(pair[1])) {
                (Some(high), Some(low)) => decoded.push(high << 4 | low),
                _ => return Vec::new(),
            }
        }
        decoded
    }

    /// Fetches the secret stored under `key`. When the server has no
    /// answer (or cannot be reached) and `options.prompt` is present, the
    /// user is asked instead; with `options.update` a non empty answer is
    /// written back silently. Non empty results are retained.
    pub fn get_secret(&mut self, key: &[u8], options: GetOptions) -> SecretView {
        let fetched = if self.ensure_initialized() {
            match self.query_exchange(key, options.remove) {
                Ok(value) => value,
                Err(error) => {
                    logging::debug!(self.log, "query failed"; "error" => ?error);
                    SecuredBuf::new()
                }
            }
        } else {
            SecuredBuf::new()
        };

        if !fetched.is_empty() {
            return self.retain(fetched);
        }

        let prompt_text = match options.prompt {
            Some(prompt_text) => prompt_text,
            None => return SecretView::EMPTY,
        };

        let answer = prompt::ask_secret(prompt_text, None);
        if options.update && !answer.is_empty() {
            self.submit_secret(key, answer.as_slice(), true);
        }
        self.retain(answer)
    }

    /// Makes sure a secret exists for `key`: fails fast when no server
    /// answers a ping, otherwise fetches with prompt fallback and write
    /// back. Returns whether a non empty secret was obtained; nothing
    /// stays retained.
    pub fn ensure_secret(&mut self, key: &[u8], prompt_text: &str) -> bool {
        if !self.ping() {
            return false;
        }

        let view = self.get_secret(key, GetOptions::new().prompt(prompt_text).update(true));
        let obtained = !view.is_empty();
        self.release_secured_string(view);
        obtained
    }

    /// Releases a view handed out earlier, dropping (and thereby
    /// scrubbing) the retained secret. Empty and unknown views are
    /// ignored.
    pub fn release_secured_string(&mut self, view: SecretView) {
        self.release_by_addr(view.addr());
    }

    /// Releases by start address, for callers that can only carry the
    /// address across a language boundary.
    pub fn release_by_addr(&mut self, address: usize) {
        if let Some(slot) = self.handles.remove(&address) {
            drop(self.retained.reclaim(slot));
        }
    }

    /// Number of live retained secrets.
    pub fn retained_count(&self) -> usize {
        self.handles.len()
    }

    /// Moves `secret` into the retention table and returns its view. Empty
    /// secrets are dropped and yield the empty view, so the table stays
    /// bijective over live entries.
    fn retain(&mut self, secret: SecuredBuf) -> SecretView {
        if secret.is_empty() {
            return SecretView::EMPTY;
        }

        let view = SecretView::retained(secret.as_slice());
        let slot = self.retained.push(secret);
        self.handles.insert(view.addr(), slot);
        view
    }

    /// Opens a fresh connection and sends `length` bytes of the output
    /// scratch buffer. The returned stream carries the reply.
    fn send_message(&self, length: usize) -> ProtoResult<UnixStream> {
        let address = match &self.address {
            Some(address) => address,
            None => return Err(ProtoError::Disconnected),
        };

        let mut stream = UnixStream::connect(address)?;
        stream.write_all(&self.output.as_slice()[..length])?;
        Ok(stream)
    }

    /// Sends a single entry request and reads back the reply header.
    fn single_exchange(
        &mut self,
        message_type: MessageType,
        request_flags: u8,
        entry: &[u8],
    ) -> ProtoResult<(u8, u8, UnixStream)> {
        let length = message::encode_single(self.output.as_mut_slice(), message_type, request_flags, entry)?;
        let mut stream = self.send_message(length)?;
        let (tag, reply_flags) = message::read_header(&mut stream)?;
        Ok((tag, reply_flags, stream))
    }

    fn submit_exchange(&mut self, key: &[u8], value: &[u8], request_flags: u8) -> ProtoResult<u8> {
        let length =
            message::encode_double(self.output.as_mut_slice(), MessageType::Add, request_flags, key, value)?;
        let mut stream = self.send_message(length)?;
        let (tag, _) = message::read_header(&mut stream)?;
        Ok(tag)
    }

    /// Runs a `Query` round trip and copies a `Result` value into a fresh
    /// hardened buffer. Every other reply yields an empty buffer.
    fn query_exchange(&mut self, key: &[u8], remove: bool) -> ProtoResult<SecuredBuf> {
        let request_flags = if remove { flags::DELETE_SECRET } else { 0 };

        let (tag, _, mut stream) = self.single_exchange(MessageType::Query, request_flags, key)?;
        if tag != u8::from(MessageType::Result) {
            return Ok(SecuredBuf::new());
        }

        let length = message::read_single(&mut stream, self.input.as_mut_slice())?;
        Ok(SecuredBuf::from_slice(&self.input.as_slice()[..length]))
    }

    /// The ping nonce is framed in place so it never leaves hardened
    /// memory, then compared byte for byte against the echoed reply.
    fn ping_exchange(&mut self) -> ProtoResult<bool> {
        const BODY_OFFSET: usize = message::HEADER_SIZE + message::LENGTH_SIZE;
        const FRAME_SIZE: usize = BODY_OFFSET + PING_NONCE_SIZE;

        {
            let scratch = self.output.as_mut_slice();
            let mut stream = &mut scratch[..];
            stream.write_u8(MessageType::Ping.into())?;
            stream.write_u8(0)?;
            stream.write_u16::<NativeEndian>(PING_NONCE_SIZE as u16)?;
            crypto::random_bytes(&mut scratch[BODY_OFFSET..FRAME_SIZE]);
        }

        let mut stream = self.send_message(FRAME_SIZE)?;
        let (tag, _) = message::read_header(&mut stream)?;
        if tag != u8::from(MessageType::Pong) {
            return Ok(false);
        }

        let reply_length = message::read_single(&mut stream, self.input.as_mut_slice())?;

        Ok(reply_length == PING_NONCE_SIZE
            && self.input.as_slice()[..reply_length] == self.output.as_slice()[BODY_OFFSET..FRAME_SIZE])
    }
}

#[inline]
fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

lazy_static! {
    static ref DEFAULT: Mutex<Accessor> = Mutex::new(Accessor::new(None));
}

/// Runs `operation` against the process wide accessor instance.
#[inline]
pub fn with_default<R, F: FnOnce(&mut Accessor) -> R>(operation: F) -> R {
    operation(&mut DEFAULT.lock().expect("accessor mutex poisoned"))
}

pub fn set_socket_path(path: Option<&Path>) -> bool {
    with_default(|accessor| accessor.set_socket_path(path))
}

pub fn ping() -> bool {
    with_default(Accessor::ping)
}

pub fn exists(key: &[u8]) -> bool {
    with_default(|accessor| accessor.exists(key))
}

pub fn submit_secret(key: &[u8], value: &[u8], replace: bool) -> bool {
    with_default(|accessor| accessor.submit_secret(key, value, replace))
}

pub fn remove_secret(key: &[u8], allow_missing: bool) -> bool {
    with_default(|accessor| accessor.remove_secret(key, allow_missing))
}

pub fn terminate_server() {
    with_default(Accessor::terminate_server)
}

pub fn make_secured_key(length: usize) -> SecretView {
    with_default(|accessor| accessor.make_secured_key(length))
}

pub fn ask_secret<'a, R: Into<Option<&'a str>>>(prompt_text: &str, retry_prompt: R) -> SecretView {
    with_default(|accessor| accessor.ask_secret(prompt_text, retry_prompt))
}

pub fn encode_string(bytes: &[u8]) -> SecretView {
    with_default(|accessor| accessor.encode_string(bytes))
}

pub fn decode_string(bytes: &[u8]) -> Vec<u8> {
    Accessor::decode_string(bytes)
}

pub fn get_secret(key: &[u8], options: GetOptions) -> SecretView {
    with_default(|accessor| accessor.get_secret(key, options))
}

pub fn ensure_secret(key: &[u8], prompt_text: &str) -> bool {
    with_default(|accessor| accessor.ensure_secret(key, prompt_text))
}

pub fn release_secured_string(view: SecretView) {
    with_default(|accessor| accessor.release_secured_string(view))
}

pub fn release_by_addr(address: usize) {
    with_default(|accessor| accessor.release_by_addr(address))
}
