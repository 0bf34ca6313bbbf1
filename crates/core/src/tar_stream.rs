use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, mkfifo};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::{CompressionKind, StreamResult, StreamStatus};
use crate::{Error, Result};

/// Argv prefix wrapped around every helper invocation (e.g. `["sudo", "-n"]`).
/// An empty prefix runs the helper directly.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedRunner {
    prefix: Vec<String>,
}

impl PrivilegedRunner {
    pub fn new(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    pub fn direct() -> Self {
        Self::default()
    }

    fn command(&self, program: &str) -> tokio::process::Command {
        match self.prefix.split_first() {
            Some((head, rest)) => {
                let mut cmd = tokio::process::Command::new(head);
                cmd.args(rest);
                cmd.arg(program);
                cmd
            }
            None => tokio::process::Command::new(program),
        }
    }

    /// Recursive removal through the helper, falling back to a plain removal
    /// when the privileged one fails.
    pub async fn remove_path(&self, path: &Path) -> Result<()> {
        let mut cmd = self.command("rm");
        cmd.arg("-rf").arg(path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Ok(status) = cmd.status().await
            && status.success()
        {
            return Ok(());
        }

        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
            Ok(_) => std::fs::remove_file(path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// One `-C <base> <name>` input group of the archiver invocation.
#[derive(Debug, Clone)]
pub struct ArchiveInput {
    pub base: PathBuf,
    pub name: String,
}

impl ArchiveInput {
    pub fn new(base: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            name: name.into(),
        }
    }

    fn source_path(&self) -> PathBuf {
        self.base.join(&self.name)
    }
}

/// Archive `inputs` into `output_path`, compressing in-process while the
/// privileged helper runs `tar --totals -cpf -` with stdout/stderr redirected
/// to a FIFO pair. Three units of work (stderr reader, stdout consumer,
/// archiver) run concurrently and are all joined before this returns; the
/// first to fail kills the helper's process group so the others unwind.
pub async fn package_and_compress(
    runner: &PrivilegedRunner,
    compression: CompressionKind,
    output_path: &Path,
    inputs: &[ArchiveInput],
) -> Result<StreamResult> {
    ensure_codec(compression)?;
    if inputs.is_empty() {
        return Err(Error::InvalidConfig {
            message: "archive inputs must not be empty".to_string(),
        });
    }
    for input in inputs {
        let src = input.source_path();
        if !src.exists() {
            return Ok(StreamResult {
                status: StreamStatus::SourceMissing,
                info: format!("source does not exist: {}", src.display()),
            });
        }
    }

    let fifos = FifoPair::create("pack")?;
    let script = create_script(inputs, fifos.data_fifo(), fifos.diag_fifo());
    debug!(event = "tar.launch", script = %script, "tar.launch");

    let child = spawn_helper(runner, &script)?;

    let stderr_unit = {
        let fifo = fifos.diag_fifo().to_path_buf();
        tokio::spawn(async move { drain_diagnostics(&fifo).await })
    };

    let consumer_unit = {
        let fifo = fifos.data_fifo().to_path_buf();
        let output = output_path.to_path_buf();
        tokio::task::spawn_blocking(move || consume_stdout(compression, &fifo, &output))
    };

    // Both of our units read-open their FIFO, so a stuck peer is released by
    // write-end pokes once the helper is dead.
    let pokes = [
        (fifos.data_fifo().to_path_buf(), FifoEnd::Write),
        (fifos.diag_fifo().to_path_buf(), FifoEnd::Write),
    ];
    let outcome = supervise(child, stderr_unit, consumer_unit, pokes).await;

    let info = match &outcome.diagnostics {
        Ok(text) => text.trim().to_string(),
        Err(_) => String::new(),
    };

    if let Err(write_error) = outcome.transfer {
        let status = if is_no_space(&write_error) {
            StreamStatus::NoSpaceLeft
        } else {
            StreamStatus::Failed(-1)
        };
        warn!(
            event = "tar.output_write_failed",
            output = %output_path.display(),
            error = %write_error,
            "tar.output_write_failed"
        );
        discard_partial_output(runner, output_path).await;
        return Ok(StreamResult {
            status,
            info: join_info(&info, &format!("output write failed: {write_error}")),
        });
    }

    if let Err(drain_error) = outcome.diagnostics {
        warn!(
            event = "tar.stderr_drain_failed",
            error = %drain_error,
            "tar.stderr_drain_failed"
        );
        discard_partial_output(runner, output_path).await;
        return Ok(StreamResult {
            status: StreamStatus::Failed(-1),
            info: format!("stderr drain failed: {drain_error}"),
        });
    }

    let code = match outcome.exit {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            discard_partial_output(runner, output_path).await;
            return Ok(StreamResult {
                status: StreamStatus::Failed(-1),
                info: join_info(&info, &format!("helper wait failed: {e}")),
            });
        }
    };

    if code != 0 {
        return Ok(StreamResult {
            status: StreamStatus::Failed(code),
            info,
        });
    }

    Ok(StreamResult {
        status: StreamStatus::Succeeded,
        info,
    })
}

/// Extraction counterpart: the helper runs `tar -xpf - -C <dest>` reading from
/// a stdin FIFO that this process feeds with decompressed archive bytes.
pub async fn extract_and_decompress(
    runner: &PrivilegedRunner,
    compression: CompressionKind,
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<StreamResult> {
    ensure_codec(compression)?;
    if !archive_path.is_file() {
        return Ok(StreamResult {
            status: StreamStatus::SourceMissing,
            info: format!("archive does not exist: {}", archive_path.display()),
        });
    }
    std::fs::create_dir_all(dest_dir)?;

    let fifos = FifoPair::create("unpack")?;
    let script = extract_script(dest_dir, fifos.data_fifo(), fifos.diag_fifo());
    debug!(event = "tar.launch", script = %script, "tar.launch");

    let child = spawn_helper(runner, &script)?;

    let stderr_unit = {
        let fifo = fifos.diag_fifo().to_path_buf();
        tokio::spawn(async move { drain_diagnostics(&fifo).await })
    };

    let feeder_unit = {
        let fifo = fifos.data_fifo().to_path_buf();
        let archive = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || feed_stdin(compression, &archive, &fifo))
    };

    // The feeder write-opens the data FIFO, the stderr reader read-opens the
    // diagnostics FIFO; release each with the opposite end.
    let pokes = [
        (fifos.data_fifo().to_path_buf(), FifoEnd::Read),
        (fifos.diag_fifo().to_path_buf(), FifoEnd::Write),
    ];
    let outcome = supervise(child, stderr_unit, feeder_unit, pokes).await;

    let info = match &outcome.diagnostics {
        Ok(text) => text.trim().to_string(),
        Err(_) => String::new(),
    };

    if let Err(read_error) = outcome.transfer {
        warn!(
            event = "tar.input_feed_failed",
            archive = %archive_path.display(),
            error = %read_error,
            "tar.input_feed_failed"
        );
        return Ok(StreamResult {
            status: StreamStatus::Failed(-1),
            info: join_info(&info, &format!("archive feed failed: {read_error}")),
        });
    }

    if let Err(drain_error) = outcome.diagnostics {
        warn!(
            event = "tar.stderr_drain_failed",
            error = %drain_error,
            "tar.stderr_drain_failed"
        );
        return Ok(StreamResult {
            status: StreamStatus::Failed(-1),
            info: format!("stderr drain failed: {drain_error}"),
        });
    }

    let code = match outcome.exit {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            return Ok(StreamResult {
                status: StreamStatus::Failed(-1),
                info: join_info(&info, &format!("helper wait failed: {e}")),
            });
        }
    };

    if code != 0 {
        return Ok(StreamResult {
            status: StreamStatus::Failed(code),
            info,
        });
    }

    Ok(StreamResult {
        status: StreamStatus::Succeeded,
        info,
    })
}

struct UnitOutcomes {
    exit: std::io::Result<std::process::ExitStatus>,
    diagnostics: std::io::Result<String>,
    transfer: std::io::Result<u64>,
}

/// Join the archiver and both stream units. The first unit failure kills the
/// helper's process group; after that, pending FIFO opens are released on a
/// short tick until every unit has finished. Nothing survives this call.
async fn supervise(
    mut child: tokio::process::Child,
    mut stderr_unit: JoinHandle<std::io::Result<String>>,
    mut transfer_unit: JoinHandle<std::io::Result<u64>>,
    pokes: [(PathBuf, FifoEnd); 2],
) -> UnitOutcomes {
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

    let mut exit: Option<std::io::Result<std::process::ExitStatus>> = None;
    let mut diagnostics: Option<std::io::Result<String>> = None;
    let mut transfer: Option<std::io::Result<u64>> = None;
    let mut aborted = false;

    while exit.is_none() || diagnostics.is_none() || transfer.is_none() {
        tokio::select! {
            r = child.wait(), if exit.is_none() => {
                exit = Some(r);
            }
            r = &mut stderr_unit, if diagnostics.is_none() => {
                let r = flatten_join(r);
                if r.is_err() && !aborted {
                    aborted = true;
                    kill_helper(pgid);
                }
                diagnostics = Some(r);
            }
            r = &mut transfer_unit, if transfer.is_none() => {
                let r = flatten_join(r);
                if r.is_err() && !aborted {
                    aborted = true;
                    kill_helper(pgid);
                }
                transfer = Some(r);
            }
            _ = tokio::time::sleep(Duration::from_millis(25)), if aborted => {}
        }

        if aborted {
            for (path, end) in &pokes {
                unblock_fifo(path, *end);
            }
        }
    }

    UnitOutcomes {
        exit: exit.expect("archiver joined"),
        diagnostics: diagnostics.expect("stderr unit joined"),
        transfer: transfer.expect("transfer unit joined"),
    }
}

fn flatten_join<T>(
    joined: std::result::Result<std::io::Result<T>, tokio::task::JoinError>,
) -> std::io::Result<T> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(std::io::Error::other(join_error)),
    }
}

fn ensure_codec(compression: CompressionKind) -> Result<()> {
    if compression == CompressionKind::Lz4 {
        return Err(Error::InvalidConfig {
            message: "lz4 archives can be named but no lz4 codec is available".to_string(),
        });
    }
    Ok(())
}

/// FIFO pair in a private scratch directory. Both pipe files are removed on
/// drop, whatever the operation's outcome.
struct FifoPair {
    dir: PathBuf,
    data: PathBuf,
    diag: PathBuf,
}

impl FifoPair {
    fn create(tag: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "appvault-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        let data = dir.join("stream.pipe");
        let diag = dir.join("diag.pipe");
        let mode = Mode::from_bits_truncate(0o600);
        mkfifo(&data, mode).map_err(errno_to_io)?;
        mkfifo(&diag, mode).map_err(errno_to_io)?;
        Ok(Self { dir, data, diag })
    }

    fn data_fifo(&self) -> &Path {
        &self.data
    }

    fn diag_fifo(&self) -> &Path {
        &self.diag
    }
}

impl Drop for FifoPair {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.data);
        let _ = std::fs::remove_file(&self.diag);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(errno as i32))
}

fn spawn_helper(runner: &PrivilegedRunner, script: &str) -> Result<tokio::process::Child> {
    let mut cmd = runner.command("sh");
    cmd.arg("-c").arg(script);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.process_group(0);
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(|e| Error::HelperUnavailable {
        message: format!("failed to launch archiver helper: {e}"),
    })
}

fn kill_helper(pgid: Option<Pid>) {
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

async fn discard_partial_output(runner: &PrivilegedRunner, output: &Path) {
    if let Err(e) = runner.remove_path(output).await {
        warn!(
            event = "tar.partial_output_remove_failed",
            output = %output.display(),
            error = %e,
            "tar.partial_output_remove_failed"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum FifoEnd {
    Read,
    Write,
}

/// Open-and-close the given end non-blockingly so a peer stuck in a FIFO
/// open() returns. The write-open only succeeds while a reader is pending,
/// which is exactly the case that needs unblocking; failures are ignored.
fn unblock_fifo(path: &Path, end: FifoEnd) {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = std::fs::OpenOptions::new();
    match end {
        FifoEnd::Read => options.read(true),
        FifoEnd::Write => options.write(true),
    };
    options.custom_flags(libc::O_NONBLOCK);
    let _ = options.open(path);
}

async fn drain_diagnostics(fifo: &Path) -> std::io::Result<String> {
    let mut text = String::new();
    let mut file = tokio::fs::File::open(fifo).await?;
    file.read_to_string(&mut text).await?;
    Ok(text)
}

fn consume_stdout(
    compression: CompressionKind,
    fifo: &Path,
    output: &Path,
) -> std::io::Result<u64> {
    let out = std::fs::File::create(output)?;
    let mut reader = std::fs::File::open(fifo)?;
    match compression {
        CompressionKind::Tar => {
            let mut writer = BufWriter::new(out);
            let written = std::io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| e.into_error())?
                .sync_all()?;
            Ok(written)
        }
        CompressionKind::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(out, 0)?;
            let written = std::io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.sync_all()?;
            Ok(written)
        }
        CompressionKind::Lz4 => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "lz4 codec is not available",
        )),
    }
}

fn feed_stdin(compression: CompressionKind, archive: &Path, fifo: &Path) -> std::io::Result<u64> {
    let input = std::fs::File::open(archive)?;
    let mut writer = std::fs::OpenOptions::new().write(true).open(fifo)?;
    let written = match compression {
        CompressionKind::Tar => {
            let mut reader = BufReader::new(input);
            std::io::copy(&mut reader, &mut writer)?
        }
        CompressionKind::Zstd => {
            let mut decoder = zstd::stream::Decoder::new(input)?;
            std::io::copy(&mut decoder, &mut writer)?
        }
        CompressionKind::Lz4 => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "lz4 codec is not available",
            ));
        }
    };
    writer.flush()?;
    Ok(written)
}

fn is_no_space(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENOSPC)
}

fn join_info(head: &str, tail: &str) -> String {
    if head.is_empty() {
        tail.to_string()
    } else {
        format!("{head}\n{tail}")
    }
}

fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn create_script(inputs: &[ArchiveInput], data_fifo: &Path, diag_fifo: &Path) -> String {
    let mut script = String::from("exec tar --totals -cpf -");
    for input in inputs {
        let name = if input.name.starts_with('-') {
            format!("./{}", input.name)
        } else {
            input.name.clone()
        };
        script.push_str(&format!(
            " -C {} {}",
            shell_quote(&input.base),
            shell_quote(Path::new(&name))
        ));
    }
    script.push_str(&format!(
        " > {} 2> {}",
        shell_quote(data_fifo),
        shell_quote(diag_fifo)
    ));
    script
}

fn extract_script(dest_dir: &Path, data_fifo: &Path, diag_fifo: &Path) -> String {
    format!(
        "exec tar -xpf - -C {} < {} 2> {}",
        shell_quote(dest_dir),
        shell_quote(data_fifo),
        shell_quote(diag_fifo)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_quote_and_redirect() {
        let inputs = vec![
            ArchiveInput::new("/data/user/0", "com.example.app"),
            ArchiveInput::new("/data/it's", "-odd"),
        ];
        let script = create_script(
            &inputs,
            Path::new("/tmp/s/stream.pipe"),
            Path::new("/tmp/s/diag.pipe"),
        );
        assert!(script.starts_with("exec tar --totals -cpf -"));
        assert!(script.contains("-C '/data/user/0' 'com.example.app'"));
        assert!(script.contains(r"'/data/it'\''s'"));
        assert!(script.contains("'./-odd'"));
        assert!(script.ends_with("> '/tmp/s/stream.pipe' 2> '/tmp/s/diag.pipe'"));

        let extract = extract_script(
            Path::new("/restore here"),
            Path::new("/tmp/s/stream.pipe"),
            Path::new("/tmp/s/diag.pipe"),
        );
        assert_eq!(
            extract,
            "exec tar -xpf - -C '/restore here' < '/tmp/s/stream.pipe' 2> '/tmp/s/diag.pipe'"
        );
    }

    #[test]
    fn lz4_codec_is_rejected_up_front() {
        assert!(matches!(
            ensure_codec(CompressionKind::Lz4),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(ensure_codec(CompressionKind::Zstd).is_ok());
        assert!(ensure_codec(CompressionKind::Tar).is_ok());
    }

    #[tokio::test]
    async fn fifo_pair_is_removed_on_drop() {
        let (data, diag, dir) = {
            let fifos = FifoPair::create("test").unwrap();
            assert!(fifos.data_fifo().exists());
            assert!(fifos.diag_fifo().exists());
            (
                fifos.data_fifo().to_path_buf(),
                fifos.diag_fifo().to_path_buf(),
                fifos.dir.clone(),
            )
        };
        assert!(!data.exists());
        assert!(!diag.exists());
        assert!(!dir.exists());
    }
}
