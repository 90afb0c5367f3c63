//! Shell-backed device sessions

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

use adbfs_core::{path, ClientError, DirEntry, FsStats};

use crate::session::{DeviceSession, SessionOpener};

/// Prefix of the line that ends every command's output
const MARKER_PREFIX: &str = "__ADBFS_DONE_";

/// Terminator for base64 payloads fed through a here-document
const HEREDOC_END: &str = "__ADBFS_EOF__";

/// Format shared by `stat` and `list`: size, raw mode in hex, mtime, name
const STAT_FORMAT: &str = "%s %f %Y %n";

/// Opens shell sessions to one device
#[derive(Clone, Debug)]
pub struct AdbShellOpener {
    program: PathBuf,
    serial: String,
    timeout: Duration,
}

impl AdbShellOpener {
    pub fn new(program: impl Into<PathBuf>, serial: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            serial: serial.into(),
            timeout,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}

#[async_trait]
impl SessionOpener for AdbShellOpener {
    type Session = AdbShellSession;

    async fn open(&self) -> Result<AdbShellSession, ClientError> {
        debug!("Opening shell session to {}", self.serial);

        let mut command = Command::new(&self.program);
        command.args(["-s", self.serial.as_str(), "shell", "-T"]);

        let mut session = AdbShellSession::spawn(command, self.timeout)?;
        // Every command is a pipeline ending in base64 or stat; without
        // pipefail a failing head of the pipeline would go unnoticed
        session.run("set -o pipefail 2>/dev/null; true").await?;
        Ok(session)
    }
}

/// One long-lived shell on the device
pub struct AdbShellSession {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Option<ChildStderr>,
    timeout: Duration,
    commands: u64,
}

/// Exit status and combined output of one command
#[derive(Debug, PartialEq, Eq)]
struct Output {
    status: i32,
    text: String,
}

impl AdbShellSession {
    /// Spawn any command that reads shell scripts on stdin
    pub fn spawn(mut command: Command, timeout: Duration) -> Result<Self, ClientError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Connection(format!("failed to start adb: {}", e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Self {
                _child: child,
                stdin,
                stdout: BufReader::new(stdout),
                stderr,
                timeout,
                commands: 0,
            }),
            _ => Err(ClientError::Connection("adb stdio unavailable".into())),
        }
    }

    async fn run(&mut self, script: &str) -> Result<Output, ClientError> {
        self.commands += 1;
        let marker = format!("{}{}__", MARKER_PREFIX, self.commands);
        let framed = format!(
            "{{\n{}\n}} 2>&1; printf '\\n%s %d\\n' '{}' \"$?\"\n",
            script, marker
        );
        trace!("shell: {}", script.lines().next().unwrap_or_default());

        let result = tokio::time::timeout(self.timeout, async {
            self.stdin
                .write_all(framed.as_bytes())
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            self.stdin
                .flush()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            read_framed(&mut self.stdout, &marker).await
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(ClientError::Connection(_))) => Err(ClientError::Connection(self.exit_reason().await)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Shell command timed out after {:?}", self.timeout);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Whatever adb printed before the shell went away
    async fn exit_reason(&mut self) -> String {
        let mut message = String::new();
        if let Some(mut stderr) = self.stderr.take() {
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                stderr.read_to_string(&mut message),
            )
            .await;
        }
        match message.trim() {
            "" => "adb shell exited".to_string(),
            reason => reason.to_string(),
        }
    }

    /// Run a command and map a non-zero status to a classified error
    async fn check(&mut self, script: &str) -> Result<String, ClientError> {
        let output = self.run(script).await?;
        if output.status == 0 {
            Ok(output.text)
        } else {
            Err(classify_error(output.status, &output.text))
        }
    }
}

/// Read lines up to the marker line, returning the status it carries and
/// everything printed before it.
///
/// Output is read as bytes; file names need not be UTF-8, so invalid
/// sequences are replaced rather than treated as a broken stream.
async fn read_framed<R>(reader: &mut R, marker: &str) -> Result<Output, ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        if n == 0 {
            return Err(ClientError::Connection("adb shell exited".into()));
        }

        if let Some(rest) = line.strip_prefix(marker.as_bytes()) {
            let rest = String::from_utf8_lossy(rest);
            let status = rest.trim().parse().map_err(|_| {
                ClientError::Protocol(format!("bad status line: {}{}", marker, rest.trim()))
            })?;
            // The framing printf starts with a newline of its own
            if raw.last() == Some(&b'\n') {
                raw.pop();
            }
            let text = String::from_utf8_lossy(&raw).into_owned();
            return Ok(Output { status, text });
        }
        raw.extend_from_slice(&line);
    }
}

/// Quote a string for the device shell
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Map a failed command's message onto an error category
pub fn classify_error(status: i32, message: &str) -> ClientError {
    let message = message.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("no such file") {
        ClientError::NotFound(message)
    } else if lower.contains("permission denied") {
        ClientError::PermissionDenied(message)
    } else if lower.contains("operation not permitted") {
        ClientError::NotPermitted(message)
    } else if lower.contains("file exists") {
        ClientError::AlreadyExists(message)
    } else if lower.contains("not empty") {
        ClientError::NotEmpty(message)
    } else if lower.contains("not a directory") {
        ClientError::NotADirectory(message)
    } else if lower.contains("is a directory") {
        ClientError::IsADirectory(message)
    } else if lower.contains("read-only file system") {
        ClientError::ReadOnly(message)
    } else if lower.contains("invalid argument") {
        ClientError::InvalidArgument(message)
    } else if lower.contains("not supported") || lower.contains("inaccessible or not found") {
        ClientError::Unsupported(message)
    } else {
        ClientError::Command { status, message }
    }
}

/// Parse one `STAT_FORMAT` line
fn parse_stat_line(line: &str) -> Result<DirEntry, ClientError> {
    let bad = || ClientError::Protocol(format!("unexpected stat output: {}", line));

    let mut fields = line.splitn(4, ' ');
    let size = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let mode = fields
        .next()
        .and_then(|f| u32::from_str_radix(f, 16).ok())
        .ok_or_else(bad)?;
    let mtime = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;

    Ok(DirEntry::new(
        name,
        size,
        mode,
        DirEntry::time_from_secs(mtime),
    ))
}

/// Split listing output into one string per entry.
///
/// `stat -c` ends every record with a newline, and a file name may contain
/// one too. Each record starts with its numeric fields followed by the full
/// path under `dir`, so a line without that shape continues the name on the
/// line before it.
fn split_stat_records(text: &str, dir: &str) -> Vec<String> {
    let prefix = if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    };

    let mut records: Vec<String> = Vec::new();
    for line in text.split('\n') {
        if starts_record(line, &prefix) {
            records.push(line.to_string());
        } else if let Some(last) = records.last_mut() {
            last.push('\n');
            last.push_str(line);
        }
    }

    // The final newline of the output is not part of the last name
    if let Some(last) = records.last_mut() {
        if last.ends_with('\n') {
            last.pop();
        }
    }
    records
}

fn starts_record(line: &str, prefix: &str) -> bool {
    let mut fields = line.splitn(4, ' ');
    let numeric = |f: Option<&str>, radix: u32| {
        f.is_some_and(|f| !f.is_empty() && f.chars().all(|c| c.is_digit(radix)))
    };
    numeric(fields.next(), 10)
        && numeric(fields.next(), 16)
        && numeric(fields.next(), 10)
        && fields.next().is_some_and(|name| name.starts_with(prefix))
}

fn parse_statfs(text: &str) -> Result<FsStats, ClientError> {
    let bad = || ClientError::Protocol(format!("unexpected statfs output: {}", text.trim()));

    let fields: Vec<u64> = text
        .split_whitespace()
        .map(|f| f.parse().map_err(|_| bad()))
        .collect::<Result<_, _>>()?;
    let [block_size, blocks, blocks_free, blocks_available, files, files_free, name_max] =
        fields[..]
    else {
        return Err(bad());
    };

    Ok(FsStats {
        block_size: u32::try_from(block_size).map_err(|_| bad())?,
        blocks,
        blocks_free,
        blocks_available,
        files,
        files_free,
        name_max: u32::try_from(name_max).unwrap_or(u32::MAX),
    })
}

fn decode_payload(text: &str) -> Result<Vec<u8>, ClientError> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| ClientError::Protocol(format!("bad base64 payload: {}", e)))
}

/// Base64 payload wrapped for a here-document
fn encode_payload(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / 76 + 1);
    for chunk in encoded.as_bytes().chunks(76) {
        wrapped.push_str(&String::from_utf8_lossy(chunk));
        wrapped.push('\n');
    }
    wrapped
}

fn missing(path: &str) -> String {
    format!(
        "echo {} >&2; false",
        quote(&format!("{}: No such file or directory", path))
    )
}

#[async_trait]
impl DeviceSession for AdbShellSession {
    async fn stat(&mut self, path: &str) -> Result<DirEntry, ClientError> {
        let text = self
            .check(&format!("stat -c '{}' {}", STAT_FORMAT, quote(path)))
            .await?;
        let mut entry = parse_stat_line(text.lines().next().unwrap_or_default())?;
        entry.name = path.to_string();
        Ok(entry)
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, ClientError> {
        let q = quote(dir);
        let script = format!(
            "if [ -d {q} ]; then find {q} -mindepth 1 -maxdepth 1 -exec stat -c '{fmt}' {{}} +; \
             elif [ -e {q} ]; then echo {msg} >&2; false; \
             else {missing}; fi",
            q = q,
            fmt = STAT_FORMAT,
            msg = quote(&format!("{}: Not a directory", dir)),
            missing = missing(dir),
        );
        let text = self.check(&script).await?;

        split_stat_records(&text, dir)
            .into_iter()
            .map(|record| {
                let mut entry = parse_stat_line(&record)?;
                entry.name = path::file_name(&entry.name).to_string();
                Ok(entry)
            })
            .collect()
    }

    async fn read_link(&mut self, path: &str) -> Result<String, ClientError> {
        let q = quote(path);
        let script = format!(
            "if [ -L {q} ]; then readlink {q}; \
             elif [ -e {q} ]; then echo {msg} >&2; false; \
             else {missing}; fi",
            q = q,
            msg = quote(&format!("{}: Invalid argument", path)),
            missing = missing(path),
        );
        let text = self.check(&script).await?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    async fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ClientError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let q = quote(path);
        let script = format!(
            "if [ -d {q} ]; then echo {msg} >&2; false; else \
             dd if={q} bs=65536 iflag=skip_bytes,count_bytes skip={offset} count={size} \
             2>/dev/null | base64; fi",
            q = q,
            msg = quote(&format!("{}: Is a directory", path)),
            offset = offset,
            size = size,
        );
        let exists = format!("[ -e {} ] || {{ {}; }} && {{ {}; }}", q, missing(path), script);
        let text = self.check(&exists).await?;
        decode_payload(&text)
    }

    async fn write_at(
        &mut self,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, ClientError> {
        if data.is_empty() {
            return Ok(0);
        }
        let script = format!(
            "base64 -d <<'{end}' | dd of={q} bs=65536 oflag=seek_bytes seek={offset} conv=notrunc 2>/dev/null\n{payload}{end}",
            end = HEREDOC_END,
            q = quote(path),
            offset = offset,
            payload = encode_payload(data),
        );
        self.check(&script).await?;
        Ok(data.len() as u32)
    }

    async fn create(&mut self, path: &str, mode: u32, exclusive: bool) -> Result<(), ClientError> {
        let q = quote(path);
        let script = if exclusive {
            format!(
                "if [ -e {q} ]; then echo {msg} >&2; false; else : > {q} && chmod {mode:o} {q}; fi",
                q = q,
                msg = quote(&format!("{}: File exists", path)),
                mode = mode,
            )
        } else {
            format!(
                "if [ ! -e {q} ]; then : > {q} && chmod {mode:o} {q}; fi",
                q = q,
                mode = mode,
            )
        };
        self.check(&script).await.map(drop)
    }

    async fn truncate(&mut self, path: &str, size: u64) -> Result<(), ClientError> {
        let q = quote(path);
        let script = format!(
            "[ -e {q} ] || {{ {missing}; }} && truncate -s {size} {q}",
            q = q,
            missing = missing(path),
            size = size,
        );
        self.check(&script).await.map(drop)
    }

    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.check(&format!("mkdir -m {:o} {}", mode, quote(path)))
            .await
            .map(drop)
    }

    async fn remove(&mut self, path: &str) -> Result<(), ClientError> {
        let q = quote(path);
        let script = format!(
            "if [ -d {q} ] && [ ! -L {q} ]; then echo {msg} >&2; false; else rm -- {q}; fi",
            q = q,
            msg = quote(&format!("{}: Is a directory", path)),
        );
        self.check(&script).await.map(drop)
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), ClientError> {
        self.check(&format!("rmdir -- {}", quote(path)))
            .await
            .map(drop)
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), ClientError> {
        let (qf, qt) = (quote(from), quote(to));
        // mv moves into an existing directory instead of replacing it
        let script = format!(
            "[ -e {qf} ] || [ -L {qf} ] || {{ {missing}; }} && \
             if [ -d {qt} ] && [ ! -L {qt} ]; then \
             if [ -d {qf} ]; then rmdir -- {qt}; else echo {msg} >&2; false; fi; \
             fi && mv -- {qf} {qt}",
            qf = qf,
            qt = qt,
            missing = missing(from),
            msg = quote(&format!("{}: Is a directory", to)),
        );
        self.check(&script).await.map(drop)
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.check(&format!("chmod {:o} {}", mode, quote(path)))
            .await
            .map(drop)
    }

    async fn set_mtime(&mut self, path: &str, mtime: SystemTime) -> Result<(), ClientError> {
        let secs = mtime
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ClientError::InvalidArgument("time before the epoch".into()))?
            .as_secs();
        let q = quote(path);
        let script = format!(
            "[ -e {q} ] || {{ {missing}; }} && touch -m -d @{secs} {q}",
            q = q,
            missing = missing(path),
            secs = secs,
        );
        self.check(&script).await.map(drop)
    }

    async fn statfs(&mut self, path: &str) -> Result<FsStats, ClientError> {
        let text = self
            .check(&format!(
                "stat -f -c '%S %b %f %a %c %d %l' {}",
                quote(path)
            ))
            .await?;
        parse_statfs(&text)
    }
}
