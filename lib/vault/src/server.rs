use crate::addr::{self, AddrError, AddrResult};
use crate::proto::message::{self, flags, MessageType, MAX_MESSAGE_SIZE};
use crate::proto::support::{ProtoError, ProtoResult};
use crate::store::SecretStore;
use keep::logging;
use keep::mem::secured::SecuredBuf;
use std::fs;
use std::io::{self, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::ptr;

/// Depth of the pending connection queue.
const LISTEN_BACKLOG: libc::c_int = 5;

/// Deliberately does nothing: its installation (without `SA_RESTART`)
/// makes a pending `accept` return `EINTR`, which ends the serve loop.
extern "C" fn interrupt_handler(_signal: libc::c_int) {}

/// The storage daemon: a Unix stream socket served one connection at a
/// time, backed by an in process secret store. Connections are one shot —
/// a single request, a single reply.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    store: SecretStore,
    running: bool,
    log: logging::Logger,
}

impl Server {
    /// Resolves and validates the socket path (creating parent directories
    /// where resolution permits), binds the listener and installs the
    /// interrupt handler.
    ///
    /// An existing socket file is refused unless `replace` is set and a
    /// probe connection confirms no server is listening behind it.
    pub fn bind<'a, P, L>(path: P, replace: bool, log: L) -> AddrResult<Server>
    where
        P: Into<Option<&'a Path>>,
        L: Into<Option<&'a logging::Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let path = addr::resolve(path.into(), true)?;

        if path.exists() {
            if replace && UnixStream::connect(&path).is_err() {
                logging::info!(log, "removing stale socket file"; "path" => %path.display());
                fs::remove_file(&path)?;
            } else {
                return Err(AddrError::Occupied);
            }
        }

        let listener = Self::listen(&path)?;
        Self::install_interrupt_handler();

        logging::info!(log, "server listening"; "path" => %path.display());

        Ok(Server {
            listener,
            path,
            store: SecretStore::new(),
            running: true,
            log,
        })
    }

    /// The path the listener is bound to.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing store.
    #[inline]
    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    /// Serves connections until a `Terminate` request arrives or an
    /// interrupt ends a pending `accept`. Connections are handled
    /// serially; the reply of one request is fully written before the next
    /// accept.
    pub fn run(&mut self) {
        // Request and reply scratch space lives in hardened memory for the
        // lifetime of the loop.
        let mut input = SecuredBuf::zeroed(MAX_MESSAGE_SIZE);
        let mut output = SecuredBuf::zeroed(MAX_MESSAGE_SIZE);

        while self.running {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(error) => {
                    if error.kind() == io::ErrorKind::Interrupted {
                        logging::info!(self.log, "interrupted, shutting down");
                        break;
                    }
                    logging::warn!(self.log, "accept failed"; "error" => ?error.kind());
                    continue;
                }
            };

            if let Err(error) = self.handle(stream, input.as_mut_slice(), output.as_mut_slice()) {
                logging::debug!(self.log, "exchange aborted"; "error" => ?error);
            }
        }

        logging::info!(self.log, "serve loop finished"; "stored_entries" => self.store.len());
    }

    /// Handles one connection: read the header, read the body per type,
    /// mutate the store, write the reply in a single call, close.
    fn handle(
        &mut self,
        mut stream: UnixStream,
        input: &mut [u8],
        output: &mut [u8],
    ) -> ProtoResult<()> {
        let (tag, request_flags) = message::read_header(&mut stream)?;

        let reply_length = match MessageType::from_tag(tag) {
            Ok(MessageType::Ping) => {
                let length = match message::read_single(&mut stream, input) {
                    Ok(length) => length,
                    Err(ProtoError::Oversized) => {
                        return Self::refuse(&mut stream, output, "message body too large", &self.log)
                    }
                    Err(error) => return Err(error),
                };
                logging::debug!(self.log, "ping"; "nonce_length" => length);
                message::encode_single(output, MessageType::Pong, 0, &input[..length])?
            }

            Ok(MessageType::Add) => {
                let (key_length, value_length) = match message::read_double(&mut stream, input) {
                    Ok(lengths) => lengths,
                    Err(ProtoError::Oversized) => {
                        return Self::refuse(&mut stream, output, "message body too large", &self.log)
                    }
                    Err(error) => return Err(error),
                };

                let key = SecuredBuf::from_slice(&input[..key_length]);
                let value = SecuredBuf::from_slice(&input[key_length..key_length + value_length]);
                let replace = request_flags & flags::REPLACE_EXISTING != 0;

                logging::debug!(self.log, "add";
                                "key_length" => key_length,
                                "value_length" => value_length,
                                "replace" => replace);

                if replace {
                    self.store.update(key, value);
                    message::encode_empty(output, MessageType::Ok, 0)?
                } else if self.store.add(key, value) {
                    message::encode_empty(output, MessageType::Ok, 0)?
                } else {
                    message::encode_empty(output, MessageType::Failed, 0)?
                }
            }

            Ok(MessageType::Query) => {
                let key_length = match message::read_single(&mut stream, input) {
                    Ok(length) => length,
                    Err(ProtoError::Oversized) => {
                        return Self::refuse(&mut stream, output, "message body too large", &self.log)
                    }
                    Err(error) => return Err(error),
                };

                let existence_only = request_flags & flags::EXISTENCE_ONLY != 0;
                let delete_secret = request_flags & flags::DELETE_SECRET != 0;

                // The reply is serialized under the store lock, before any
                // later request can touch the entry.
                let encoded = self.store.with_value(&input[..key_length], |value| {
                    if existence_only {
                        message::encode_empty(output, MessageType::Ok, 0)
                    } else {
                        message::encode_single(output, MessageType::Result, 0, value)
                    }
                });

                logging::debug!(self.log, "query";
                                "key_length" => key_length,
                                "existence_only" => existence_only,
                                "delete_secret" => delete_secret,
                                "found" => encoded.is_some());

                let reply_length = match encoded {
                    Some(encoded) => encoded?,
                    None => message::encode_empty(output, MessageType::Failed, 0)?,
                };

                // Deletion happens after the reply is determined, whichever
                // reply that was.
                if delete_secret {
                    self.store.remove(&input[..key_length]);
                }

                reply_length
            }

            Ok(MessageType::Delete) => {
                let key_length = match message::read_single(&mut stream, input) {
                    Ok(length) => length,
                    Err(ProtoError::Oversized) => {
                        return Self::refuse(&mut stream, output, "message body too large", &self.log)
                    }
                    Err(error) => return Err(error),
                };

                let removed = self.store.remove(&input[..key_length]);
                let allow_missing = request_flags & flags::ALLOW_MISSING != 0;

                logging::debug!(self.log, "delete"; "key_length" => key_length, "removed" => removed);

                if removed == 1 || allow_missing {
                    message::encode_empty(output, MessageType::Ok, 0)?
                } else {
                    message::encode_empty(output, MessageType::Failed, 0)?
                }
            }

            Ok(MessageType::Terminate) => {
                logging::info!(self.log, "terminate requested");
                self.running = false;
                return Ok(());
            }

            // Reply types arriving as requests.
            Ok(other) => {
                logging::warn!(self.log, "unsupported request"; "type" => ?other);
                return Self::refuse(&mut stream, output, "unsupported message type", &self.log);
            }

            Err(ProtoError::UnknownType(tag)) => {
                logging::warn!(self.log, "unknown request tag"; "tag" => tag);
                return Self::refuse(&mut stream, output, "unsupported message type", &self.log);
            }

            Err(error) => return Err(error),
        };

        stream.write_all(&output[..reply_length])?;
        Ok(())
    }

    /// Answers `Failed` with an attached description and ends the exchange.
    fn refuse(
        stream: &mut UnixStream,
        output: &mut [u8],
        description: &str,
        log: &logging::Logger,
    ) -> ProtoResult<()> {
        logging::debug!(log, "refusing request"; "description" => description);

        let length = message::encode_single(
            output,
            MessageType::Failed,
            flags::DESCRIPTION_ATTACHED,
            description.as_bytes(),
        )?;
        stream.write_all(&output[..length])?;
        Ok(())
    }

    /// Creates the listening socket with the configured backlog depth.
    fn listen(path: &Path) -> AddrResult<UnixListener> {
        let mut address: libc::sockaddr_un = unsafe { mem::zeroed() };
        address.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let bytes = path.as_os_str().as_bytes();
        if bytes.len() >= address.sun_path.len() {
            return Err(AddrError::Unresolvable);
        }
        for (slot, &byte) in address.sun_path.iter_mut().zip(bytes) {
            *slot = byte as libc::c_char;
        }

        unsafe {
            let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
            if fd == -1 {
                return Err(io::Error::last_os_error().into());
            }

            let length = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
            if libc::bind(fd, &address as *const libc::sockaddr_un as *const libc::sockaddr, length) == -1 {
                let error = io::Error::last_os_error();
                libc::close(fd);
                return Err(error.into());
            }

            if libc::listen(fd, LISTEN_BACKLOG) == -1 {
                let error = io::Error::last_os_error();
                libc::close(fd);
                return Err(error.into());
            }

            Ok(UnixListener::from_raw_fd(fd))
        }
    }

    fn install_interrupt_handler() {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            let handler = interrupt_handler as extern "C" fn(libc::c_int);
            action.sa_sigaction = handler as usize;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGINT, &action, ptr::null_mut());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        drop(fs::remove_file(&self.path));
        logging::debug!(self.log, "socket file removed"; "path" => %self.path.display());
    }
}
