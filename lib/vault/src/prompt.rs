use keep::mem::secured::SecuredBuf;
use std::io::{self, Write};
use std::mem;

/// Prompt shown when no caller supplied text is available.
pub const DEFAULT_PROMPT: &str = "Enter secret";

/// Prompt repeated after an empty line.
pub const DEFAULT_RETRY_PROMPT: &str = "Empty secret not allowed, enter again";

/// Restores the saved terminal attributes when dropped, so local echo
/// comes back on every exit path.
struct EchoGuard {
    saved: Option<libc::termios>,
}

impl EchoGuard {
    /// Disables local echo on stdin. Best effort: when stdin is not a
    /// terminal the attribute calls fail and reading proceeds with echo.
    fn disable_echo() -> EchoGuard {
        unsafe {
            let mut attributes: libc::termios = mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut attributes) == -1 {
                return EchoGuard { saved: None };
            }

            let saved = attributes;
            attributes.c_lflag &= !libc::ECHO;
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &attributes);

            EchoGuard { saved: Some(saved) }
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, saved) };
        }
    }
}

/// Reads one line from stdin with local echo disabled and returns it in
/// hardened memory. An empty line triggers the retry prompt until either a
/// non empty line or the end of input arrives; end of input yields an
/// empty buffer.
pub fn ask_secret<'a, R: Into<Option<&'a str>>>(prompt_text: &str, retry_prompt: R) -> SecuredBuf {
    let retry_prompt = retry_prompt.into().unwrap_or(DEFAULT_RETRY_PROMPT);
    let _guard = EchoGuard::disable_echo();

    show(prompt_text);
    loop {
        let (line, end_of_input) = read_line();
        println!();

        if !line.is_empty() || end_of_input {
            return line;
        }

        show(retry_prompt);
    }
}

fn show(prompt_text: &str) {
    print!("{}: ", prompt_text);
    drop(io::stdout().flush());
}

/// Reads bytes straight off the stdin descriptor into hardened memory, so
/// the typed secret never passes through an ordinary heap buffer. Returns
/// the line and whether the end of input was reached.
fn read_line() -> (SecuredBuf, bool) {
    let mut line = SecuredBuf::new();
    let mut byte = 0u8;

    loop {
        let count = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
            )
        };

        match count {
            0 => return (line, true),
            1 => {
                if byte == b'\n' {
                    return (line, false);
                }
                line.push(byte);
            }
            _ => {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return (line, true);
            }
        }
    }
}
