//! Exclusive control of the controlling terminal while a secret is typed.
//!
//! A [`SecureSession`] disables echo, records SIGINT instead of dying on it,
//! and ignores SIGTSTP. Dropping the session puts the previous terminal mode
//! and signal dispositions back and then re-delivers any interrupt that
//! arrived in between, so the process still reacts to Ctrl-C once the
//! terminal is sane again.

use std::io::{self, Write};
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Low-level terminal and signal operations behind a [`SecureSession`].
pub trait TerminalControl {
    /// Everything needed to undo [`TerminalControl::secure`].
    type Saved;

    /// Trap SIGINT, ignore SIGTSTP and turn echo off. On error nothing is
    /// left modified.
    fn secure(&self) -> io::Result<Self::Saved>;

    /// Undo `secure`, returning the interrupt caught while secured.
    fn restore(&self, saved: Self::Saved) -> Option<i32>;

    /// Deliver `signal` to the current process.
    fn raise(&self, signal: i32);
}

/// Scoped secure-entry mode; see the module docs.
pub struct SecureSession<'a, T: TerminalControl, W: Write> {
    control: &'a T,
    output: &'a mut W,
    saved: Option<T::Saved>,
}

impl<'a, T: TerminalControl, W: Write> SecureSession<'a, T, W> {
    pub fn begin(control: &'a T, output: &'a mut W) -> io::Result<Self> {
        let saved = control.secure()?;
        Ok(Self {
            control,
            output,
            saved: Some(saved),
        })
    }

    pub fn prompt(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes())?;
        self.output.flush()
    }
}

impl<T: TerminalControl, W: Write> Drop for SecureSession<'_, T, W> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Some(signal) = self.control.restore(saved) {
                log::debug!("re-raising signal {signal} caught during key entry");
                self.control.raise(signal);
            }
        }
        // the newline typed by the user was not echoed
        let _ = self.output.write_all(b"\n");
        let _ = self.output.flush();
    }
}

/// Written only from the signal handler; drained by `restore`. There is one
/// slot per process, so [`LibcTerminal`] refuses to open a second session
/// while one is still open.
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

static SESSION_OPEN: AtomicBool = AtomicBool::new(false);

extern "C" fn record_signal(signal: libc::c_int) {
    CAUGHT_SIGNAL.store(signal, Ordering::SeqCst);
}

/// [`TerminalControl`] over a real file descriptor via termios and
/// `sigaction`.
#[derive(Debug, Clone, Copy)]
pub struct LibcTerminal {
    fd: RawFd,
}

/// Terminal mode and signal dispositions in force before `secure`.
pub struct SavedTerminal {
    termios: libc::termios,
    sigint: libc::sigaction,
    sigtstp: libc::sigaction,
}

impl LibcTerminal {
    pub fn stdin() -> Self {
        Self::from_fd(libc::STDIN_FILENO)
    }

    pub fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn is_tty(&self) -> bool {
        unsafe { libc::isatty(self.fd) == 1 }
    }

    fn restore_handlers(sigint: &libc::sigaction, sigtstp: &libc::sigaction) {
        unsafe {
            libc::sigaction(libc::SIGINT, sigint, ptr::null_mut());
            libc::sigaction(libc::SIGTSTP, sigtstp, ptr::null_mut());
        }
    }

    /// Install the handlers and hide input, undoing partial work on error.
    fn enter(&self) -> io::Result<SavedTerminal> {
        unsafe {
            let mut act: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut act.sa_mask);
            act.sa_flags = 0;
            act.sa_sigaction = record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;

            let mut sigint: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGINT, &act, &mut sigint) != 0 {
                return Err(io::Error::last_os_error());
            }

            act.sa_sigaction = libc::SIG_IGN;
            let mut sigtstp: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGTSTP, &act, &mut sigtstp) != 0 {
                let err = io::Error::last_os_error();
                libc::sigaction(libc::SIGINT, &sigint, ptr::null_mut());
                return Err(err);
            }

            let mut termios: libc::termios = mem::zeroed();
            if libc::tcgetattr(self.fd, &mut termios) != 0 {
                let err = io::Error::last_os_error();
                Self::restore_handlers(&sigint, &sigtstp);
                return Err(err);
            }

            let mut hidden = termios;
            hidden.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
            if libc::tcsetattr(self.fd, libc::TCSAFLUSH, &hidden) != 0 {
                let err = io::Error::last_os_error();
                Self::restore_handlers(&sigint, &sigtstp);
                return Err(err);
            }

            Ok(SavedTerminal {
                termios,
                sigint,
                sigtstp,
            })
        }
    }
}

impl TerminalControl for LibcTerminal {
    type Saved = SavedTerminal;

    fn secure(&self) -> io::Result<SavedTerminal> {
        if SESSION_OPEN.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "a secure terminal session is already open",
            ));
        }
        CAUGHT_SIGNAL.store(0, Ordering::SeqCst);

        let entered = self.enter();
        if entered.is_err() {
            SESSION_OPEN.store(false, Ordering::SeqCst);
        }
        entered
    }

    fn restore(&self, saved: SavedTerminal) -> Option<i32> {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &saved.termios);
        }
        Self::restore_handlers(&saved.sigint, &saved.sigtstp);

        let caught = CAUGHT_SIGNAL.swap(0, Ordering::SeqCst);
        SESSION_OPEN.store(false, Ordering::SeqCst);
        match caught {
            0 => None,
            signal => Some(signal),
        }
    }

    fn raise(&self, signal: i32) {
        unsafe {
            libc::kill(libc::getpid(), signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTerminal;
    use std::os::unix::io::AsRawFd;
    use std::sync::{Mutex, MutexGuard};

    /// Serialises tests that change process signal dispositions or open a
    /// real session.
    fn signal_lock() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handler(signal: libc::c_int) -> libc::sighandler_t {
        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            libc::sigaction(signal, ptr::null(), &mut current);
            current.sa_sigaction
        }
    }

    fn current_sigint_handler() -> libc::sighandler_t {
        handler(libc::SIGINT)
    }

    #[test]
    fn session_restores_on_drop() {
        let terminal = FakeTerminal::default();
        let mut out = Vec::new();
        {
            let mut session = SecureSession::begin(&terminal, &mut out).unwrap();
            session.prompt("Enter passphrase: ").unwrap();
            assert!(terminal.snapshot().echo_disabled);
            assert!(terminal.snapshot().handlers_installed);
        }
        let state = terminal.snapshot();
        assert!(!state.echo_disabled);
        assert!(!state.handlers_installed);
        assert!(state.raised.is_empty());
        assert_eq!(out, b"Enter passphrase: \n");
    }

    #[test]
    fn caught_interrupt_is_reraised_after_restore() {
        let terminal = FakeTerminal::default();
        terminal.interrupt_during_session(libc::SIGINT);
        let mut out = Vec::new();
        drop(SecureSession::begin(&terminal, &mut out).unwrap());

        let state = terminal.snapshot();
        assert!(!state.echo_disabled);
        assert_eq!(state.raised, vec![libc::SIGINT]);
    }

    #[test]
    fn failed_secure_leaves_nothing_behind() {
        let terminal = FakeTerminal::default();
        terminal.fail_secure();
        let mut out = Vec::new();
        assert!(SecureSession::begin(&terminal, &mut out).is_err());
        assert!(out.is_empty());
        assert_eq!(terminal.snapshot().sessions, 0);
    }

    #[test]
    fn libc_terminal_rolls_back_handlers_on_non_tty() {
        let file = tempfile::tempfile().unwrap();
        let terminal = LibcTerminal::from_fd(file.as_raw_fd());
        assert!(!terminal.is_tty());

        let _guard = signal_lock();
        let before = current_sigint_handler();
        assert!(terminal.secure().is_err());
        assert_eq!(current_sigint_handler(), before);

        let Err(again) = terminal.secure() else {
            panic!("secure succeeded on a regular file");
        };
        assert_ne!(again.kind(), io::ErrorKind::WouldBlock);
    }

    #[cfg(target_os = "linux")]
    mod pty {
        use super::*;
        use std::ffi::CStr;
        use std::fs::{File, OpenOptions};
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::{FromRawFd, OwnedFd};
        use std::sync::atomic::AtomicUsize;
        use std::time::{Duration, Instant};

        static HITS: AtomicUsize = AtomicUsize::new(0);

        extern "C" fn count_hit(_signal: libc::c_int) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        /// Master and slave ends of a fresh pseudo-terminal.
        fn open_pty() -> (OwnedFd, File) {
            unsafe {
                let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
                assert!(master >= 0, "{}", io::Error::last_os_error());
                let master = OwnedFd::from_raw_fd(master);
                assert_eq!(libc::grantpt(master.as_raw_fd()), 0);
                assert_eq!(libc::unlockpt(master.as_raw_fd()), 0);

                let mut name = [0 as libc::c_char; 128];
                assert_eq!(
                    libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()),
                    0
                );
                let path = CStr::from_ptr(name.as_ptr()).to_str().unwrap().to_owned();
                let slave = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(libc::O_NOCTTY)
                    .open(path)
                    .unwrap();
                (master, slave)
            }
        }

        fn lflag(fd: RawFd) -> libc::tcflag_t {
            unsafe {
                let mut termios: libc::termios = mem::zeroed();
                assert_eq!(libc::tcgetattr(fd, &mut termios), 0);
                termios.c_lflag
            }
        }

        fn install_counter() -> libc::sigaction {
            unsafe {
                let mut act: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut act.sa_mask);
                act.sa_sigaction = count_hit as extern "C" fn(libc::c_int) as libc::sighandler_t;
                let mut previous: libc::sigaction = mem::zeroed();
                assert_eq!(libc::sigaction(libc::SIGINT, &act, &mut previous), 0);
                previous
            }
        }

        #[test]
        fn session_hides_input_and_replays_interrupt() {
            let _guard = signal_lock();
            let (_master, slave) = open_pty();
            let terminal = LibcTerminal::from_fd(slave.as_raw_fd());
            assert!(terminal.is_tty());

            HITS.store(0, Ordering::SeqCst);
            let previous = install_counter();
            let counter = current_sigint_handler();
            let lflag_before = lflag(slave.as_raw_fd());
            assert_ne!(lflag_before & libc::ECHO, 0);
            let sigtstp_before = handler(libc::SIGTSTP);

            let mut out = Vec::new();
            {
                let mut session = SecureSession::begin(&terminal, &mut out).unwrap();
                session.prompt("Enter passphrase: ").unwrap();
                assert_eq!(lflag(slave.as_raw_fd()) & libc::ECHO, 0);
                assert_eq!(handler(libc::SIGTSTP), libc::SIG_IGN);

                unsafe { libc::raise(libc::SIGINT) };
                assert_eq!(HITS.load(Ordering::SeqCst), 0);
            }

            assert_eq!(lflag(slave.as_raw_fd()), lflag_before);
            assert_eq!(current_sigint_handler(), counter);
            assert_eq!(handler(libc::SIGTSTP), sigtstp_before);

            let deadline = Instant::now() + Duration::from_secs(2);
            while HITS.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(HITS.load(Ordering::SeqCst), 1);
            assert_eq!(out, b"Enter passphrase: \n");

            unsafe { libc::sigaction(libc::SIGINT, &previous, ptr::null_mut()) };
        }

        #[test]
        fn sessions_do_not_nest() {
            let _guard = signal_lock();
            let (_master, slave) = open_pty();
            let terminal = LibcTerminal::from_fd(slave.as_raw_fd());

            let saved = terminal.secure().unwrap();
            let Err(nested) = terminal.secure() else {
                panic!("second session opened while the first was live");
            };
            assert_eq!(nested.kind(), io::ErrorKind::WouldBlock);
            assert_eq!(terminal.restore(saved), None);

            let saved = terminal.secure().unwrap();
            assert_eq!(terminal.restore(saved), None);
        }
    }
}
