use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::env;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use vault::accessor::{Accessor, GetOptions};
use vault::addr::AddrError;
use vault::server::Server;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A socket path in a fresh private directory under the system temp dir.
fn socket_path() -> PathBuf {
    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = unsafe { libc::getpid() };
    let parent = env::temp_dir().join(format!("vault-e2e-{}-{}", pid, unique));
    parent.join("server.sock")
}

struct Harness {
    path: PathBuf,
    worker: Option<thread::JoinHandle<()>>,
}

impl Harness {
    /// Binds a server on a fresh path and serves it from a worker thread.
    fn start() -> Harness {
        let path = socket_path();
        let mut server = Server::bind(Some(path.as_path()), false, None).unwrap();

        let worker = thread::spawn(move || server.run());

        Harness {
            path,
            worker: Some(worker),
        }
    }

    fn accessor(&self) -> Accessor {
        let mut accessor = Accessor::new(None);
        assert!(accessor.set_socket_path(Some(&self.path)));
        accessor
    }

    /// Terminates the server and joins the worker.
    fn stop(mut self, accessor: &mut Accessor) {
        accessor.terminate_server();
        self.worker.take().unwrap().join().unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let mut accessor = Accessor::new(None);
            if accessor.set_socket_path(Some(&self.path)) {
                accessor.terminate_server();
            }
            drop(worker.join());
        }
        if let Some(parent) = self.path.parent() {
            drop(fs::remove_dir_all(parent));
        }
    }
}

#[test]
fn test_ping_echo() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.ping());

    harness.stop(&mut accessor);
}

#[test]
fn test_submit_then_get_and_exists() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.submit_secret(b"k", b"v", false));

    let view = accessor.get_secret(b"k", GetOptions::new());
    assert_eq!(view.as_bytes(), b"v");
    assert!(accessor.exists(b"k"));

    accessor.release_secured_string(view);
    assert_eq!(accessor.retained_count(), 0);

    harness.stop(&mut accessor);
}

#[test]
fn test_duplicate_submit_without_replace() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.submit_secret(b"k", b"v", false));
    assert!(!accessor.submit_secret(b"k", b"other", false));

    // The first value wins.
    let view = accessor.get_secret(b"k", GetOptions::new());
    assert_eq!(view.as_bytes(), b"v");
    accessor.release_secured_string(view);

    harness.stop(&mut accessor);
}

#[test]
fn test_submit_with_replace_overwrites() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.submit_secret(b"k", b"v1", false));
    assert!(accessor.submit_secret(b"k", b"v2", true));

    let view = accessor.get_secret(b"k", GetOptions::new());
    assert_eq!(view.as_bytes(), b"v2");
    accessor.release_secured_string(view);

    harness.stop(&mut accessor);
}

#[test]
fn test_remove_drops_the_entry() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.submit_secret(b"k", b"v", false));
    assert!(accessor.remove_secret(b"k", false));
    assert!(!accessor.exists(b"k"));

    harness.stop(&mut accessor);
}

#[test]
fn test_remove_missing_key() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.remove_secret(b"k", true));
    assert!(!accessor.remove_secret(b"k", false));

    harness.stop(&mut accessor);
}

#[test]
fn test_get_with_delete_removes_after_replying() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    assert!(accessor.submit_secret(b"k", b"v", false));

    let view = accessor.get_secret(b"k", GetOptions::new().remove(true));
    assert_eq!(view.as_bytes(), b"v");
    assert!(!accessor.exists(b"k"));

    accessor.release_secured_string(view);
    harness.stop(&mut accessor);
}

#[test]
fn test_binary_keys_and_values() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    let key = [0u8, 255, 13, 10, 0, 66];
    let value: Vec<u8> = (0..=255).collect();

    assert!(accessor.submit_secret(&key, &value, false));

    let view = accessor.get_secret(&key, GetOptions::new());
    assert_eq!(view.as_bytes(), &value[..]);
    accessor.release_secured_string(view);

    harness.stop(&mut accessor);
}

#[test]
fn test_accessor_sequence_leaves_retention_empty() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    let generated = accessor.make_secured_key(48);
    let encoded = accessor.encode_string(generated.as_bytes());
    assert!(accessor.submit_secret(b"generated", generated.as_bytes(), false));

    let fetched = accessor.get_secret(b"generated", GetOptions::new());
    assert_eq!(fetched.as_bytes(), generated.as_bytes());

    accessor.release_secured_string(fetched);
    accessor.release_secured_string(encoded);
    accessor.release_secured_string(generated);

    assert_eq!(accessor.retained_count(), 0);

    harness.stop(&mut accessor);
}

#[test]
fn test_server_down_fails_gracefully() {
    // A valid path with no server behind it.
    let path = socket_path();
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path.parent().unwrap())
        .unwrap();

    let mut accessor = Accessor::new(None);
    assert!(accessor.set_socket_path(Some(&path)));

    assert!(!accessor.ping());
    assert!(!accessor.exists(b"k"));
    assert!(!accessor.submit_secret(b"k", b"v", false));
    assert!(!accessor.remove_secret(b"k", true));
    assert!(!accessor.ensure_secret(b"k", "unused prompt"));

    // Without a prompt the miss maps to the empty view, and nothing is
    // retained.
    let view = accessor.get_secret(b"k", GetOptions::new());
    assert!(view.is_empty());
    assert_eq!(accessor.retained_count(), 0);

    fs::remove_dir_all(path.parent().unwrap()).unwrap();
}

#[test]
fn test_oversized_submit_is_rejected_client_side() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    // Key and value together overflow the 2000 byte frame scratch.
    let key = vec![b'k'; 1500];
    let value = vec![b'v'; 1500];

    assert!(!accessor.submit_secret(&key, &value, false));
    assert!(!accessor.exists(&key[..]));

    harness.stop(&mut accessor);
}

#[test]
fn test_oversized_body_is_refused_with_description() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    // Hand built Query frame declaring a body larger than the server side
    // scratch buffer.
    let mut stream = UnixStream::connect(&harness.path).unwrap();
    stream.write_u8(3).unwrap();
    stream.write_u8(0).unwrap();
    stream.write_u16::<NativeEndian>(3000).unwrap();
    stream.write_all(&vec![0u8; 3000]).unwrap();

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    // Failed with an attached description.
    assert_eq!(header[0], 6);
    assert_eq!(header[1], 1);

    let length = stream.read_u16::<NativeEndian>().unwrap() as usize;
    let mut description = vec![0u8; length];
    stream.read_exact(&mut description).unwrap();
    assert_eq!(&description[..], b"message body too large");

    harness.stop(&mut accessor);
}

#[test]
fn test_bind_refuses_occupied_path() {
    let path = socket_path();
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path.parent().unwrap())
        .unwrap();

    // A stale socket file with nothing listening behind it.
    drop(UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let refused = Server::bind(Some(path.as_path()), false, None);
    assert_eq!(refused.err().unwrap(), AddrError::Occupied);

    // With replace, the stale file is probed and taken over.
    let server = Server::bind(Some(path.as_path()), true, None).unwrap();
    drop(server);

    // The socket file is removed on shutdown.
    assert!(!path.exists());

    fs::remove_dir_all(path.parent().unwrap()).unwrap();
}

#[test]
fn test_replace_refuses_live_server() {
    let harness = Harness::start();
    let mut accessor = harness.accessor();

    // The probe connection answers, so the takeover is refused.
    let refused = Server::bind(Some(harness.path.as_path()), true, None);
    assert_eq!(refused.err().unwrap(), AddrError::Occupied);

    harness.stop(&mut accessor);
}
