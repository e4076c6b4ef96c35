//! Fetch key material from wherever `keylocation` points: the terminal, a
//! pipe on stdin, or a file.

use crate::error::{KeyrootError, KeyrootResult};
use crate::format::{KeyFormat, WRAPPING_KEY_LEN};
use crate::props::KeyLocation;
use crate::terminal::{LibcTerminal, SecureSession, TerminalControl};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Stdout, StdinLock, Write};
use std::path::Path;
use zeroize::Zeroizing;

/// Upper bound on a line of non-raw key material. Anything longer is
/// already far past every format's limit.
const MAX_LINE_LEN: usize = 1024;

/// Key material as typed or read, before derivation. Wiped on drop.
pub struct KeyMaterial {
    bytes: Zeroizing<Vec<u8>>,
    can_retry: bool,
}

impl KeyMaterial {
    /// Wrap bytes produced by a custom [`KeySource`].
    pub fn new(bytes: Vec<u8>, can_retry: bool) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            can_retry,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True when the material came from an interactive terminal, so a wrong
    /// key can be re-entered.
    pub fn can_retry(&self) -> bool {
        self.can_retry
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .field("can_retry", &self.can_retry)
            .finish()
    }
}

/// What to fetch and how to prompt for it.
#[derive(Debug, Clone, Copy)]
pub struct KeyRequest<'a> {
    pub location: &'a KeyLocation,
    pub format: KeyFormat,
    pub dataset: Option<&'a str>,
    /// Ask twice and require both entries to match (terminal only).
    pub verify: bool,
    /// Say "new" in the prompt.
    pub new_key: bool,
}

/// Anything able to produce key material for a request.
pub trait KeySource {
    fn acquire(&mut self, request: &KeyRequest<'_>) -> KeyrootResult<KeyMaterial>;
}

/// Prompt text for one entry, e.g. `Enter new passphrase for 'tank/enc': `.
pub fn prompt_text(format: KeyFormat, dataset: Option<&str>, again: bool, new_key: bool) -> String {
    let verb = if again { "Re-enter" } else { "Enter" };
    let new = if new_key { "new " } else { "" };
    let noun = format.prompt_label().unwrap_or("key");
    match dataset {
        Some(name) => format!("{verb} {new}{noun} for '{name}': "),
        None => format!("{verb} {new}{noun}: "),
    }
}

/// Read one entry of key material in the shape `format` expects.
///
/// Raw keys may contain newlines, so they are read as bytes: up to one byte
/// more than a wrapping key so an oversized key is told apart from an exact
/// one. Every other format is a single line. In both cases one trailing
/// newline is dropped. An interrupted read is reported, not retried.
pub fn read_key_bytes<R: BufRead + ?Sized>(
    reader: &mut R,
    format: KeyFormat,
) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut bytes = match format {
        KeyFormat::Raw => read_bounded(reader, None, WRAPPING_KEY_LEN + 1)?,
        _ => read_bounded(reader, Some(b'\n'), MAX_LINE_LEN)?,
    };
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    Ok(bytes)
}

fn read_bounded<R: BufRead + ?Sized>(
    reader: &mut R,
    delim: Option<u8>,
    limit: usize,
) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(limit.min(MAX_LINE_LEN)));
    while buf.len() < limit {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        let window = &available[..available.len().min(limit - buf.len())];
        let (take, found) = match delim.and_then(|d| window.iter().position(|&b| b == d)) {
            Some(pos) => (pos + 1, true),
            None => (window.len(), false),
        };
        buf.extend_from_slice(&window[..take]);
        reader.consume(take);
        if found {
            break;
        }
    }
    Ok(buf)
}

/// Key material from the file behind a `file://` keylocation. Never
/// retryable.
pub fn acquire_from_file(path: &Path, format: KeyFormat) -> KeyrootResult<KeyMaterial> {
    let file = File::open(path).map_err(|err| {
        KeyrootError::from(err).context(format!(
            "Failed to open key material file {}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);
    let bytes = read_key_bytes(&mut reader, format)?;
    format.validate(&bytes)?;
    Ok(KeyMaterial {
        bytes,
        can_retry: false,
    })
}

/// Standard input/output plus, when stdin is a terminal, control over it.
pub struct Console<R, W, T> {
    input: R,
    output: W,
    terminal: Option<T>,
}

impl Console<StdinLock<'static>, Stdout, LibcTerminal> {
    /// Console over the process's stdin/stdout.
    pub fn stdio() -> Self {
        let terminal = LibcTerminal::stdin();
        let terminal = terminal.is_tty().then_some(terminal);
        Console::new(io::stdin().lock(), io::stdout(), terminal)
    }
}

impl<R: BufRead, W: Write, T: TerminalControl> Console<R, W, T> {
    /// `terminal` is `Some` iff `input` is an interactive terminal.
    pub fn new(input: R, output: W, terminal: Option<T>) -> Self {
        Self {
            input,
            output,
            terminal,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal(&self) -> Option<&T> {
        self.terminal.as_ref()
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    fn acquire_from_prompt(&mut self, request: &KeyRequest<'_>) -> KeyrootResult<KeyMaterial> {
        let interactive = self.is_interactive();
        if interactive && request.format == KeyFormat::Raw {
            return Err(KeyrootError::invalid(
                "Cannot enter raw keys on the terminal",
            ));
        }

        let first = self.read_entry(request, false)?;
        request.format.validate(&first)?;

        if request.verify && interactive {
            let second = self.read_entry(request, true)?;
            if first[..] != second[..] {
                return Err(KeyrootError::invalid("Provided keys do not match."));
            }
        }

        Ok(KeyMaterial {
            bytes: first,
            can_retry: interactive,
        })
    }

    fn read_entry(
        &mut self,
        request: &KeyRequest<'_>,
        again: bool,
    ) -> KeyrootResult<Zeroizing<Vec<u8>>> {
        match &self.terminal {
            Some(terminal) => {
                let mut session = SecureSession::begin(terminal, &mut self.output)?;
                session.prompt(&prompt_text(
                    request.format,
                    request.dataset,
                    again,
                    request.new_key,
                ))?;
                let bytes = read_key_bytes(&mut self.input, request.format)?;
                Ok(bytes)
            }
            None => Ok(read_key_bytes(&mut self.input, request.format)?),
        }
    }
}

impl<R: BufRead, W: Write, T: TerminalControl> KeySource for Console<R, W, T> {
    fn acquire(&mut self, request: &KeyRequest<'_>) -> KeyrootResult<KeyMaterial> {
        if request.format == KeyFormat::None {
            return Err(KeyrootError::invalid(
                "Key material cannot be fetched for keyformat 'none'.",
            ));
        }
        match request.location {
            KeyLocation::Prompt => self.acquire_from_prompt(request),
            KeyLocation::File(path) => acquire_from_file(path, request.format),
            KeyLocation::None => Err(KeyrootError::invalid("Invalid keylocation.")),
        }
    }
}
