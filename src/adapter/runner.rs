//! Runs a test tool with its output captured to a per-job log.

use crate::process::GroupChild;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to keep reading output once the tool's process group is gone.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
    pub timeout: Option<Duration>,
    pub grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub termination: Termination,
    /// Captured stdout, also present in the log.
    pub stdout: String,
    pub elapsed: Duration,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawn the invocation, tee stdout and stderr into the log file, and wait
/// for exit, timeout or cancellation. An `Err` means the tool never ran.
pub async fn run_logged(inv: &Invocation, cancel: &CancellationToken) -> io::Result<CommandOutcome> {
    let (program, args) = inv
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    if let Some(parent) = inv.log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let log = tokio::fs::File::create(&inv.log_path).await?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&inv.work_dir)
        .envs(&inv.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = GroupChild::spawn(&mut cmd)?;
    debug!(program = %program, pid = ?child.id(), "test tool spawned");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.take_stdout() {
        readers.push(tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.take_stderr() {
        readers.push(tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone())));
    }
    drop(tx);

    let mut writer = tokio::spawn(async move {
        let mut log = BufWriter::new(log);
        let mut captured = String::new();
        while let Some((stream, line)) = rx.recv().await {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
            if let Stream::Stdout = stream {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        log.flush().await?;
        Ok::<_, io::Error>(captured)
    });

    let deadline = async {
        match inv.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    enum Event {
        Exited(io::Result<ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let event = tokio::select! {
        status = child.wait() => Event::Exited(status),
        _ = &mut deadline => Event::TimedOut,
        _ = cancel.cancelled() => Event::Cancelled,
    };

    let termination = match event {
        Event::Exited(status) => Termination::Exited(status?),
        Event::TimedOut => {
            child.terminate(inv.grace).await?;
            child.kill_group()?;
            Termination::TimedOut(inv.timeout.unwrap_or_default())
        }
        Event::Cancelled => {
            child.terminate(inv.grace).await?;
            child.kill_group()?;
            Termination::Cancelled
        }
    };

    // Descendants of a tool that exited on its own still hold the group and
    // possibly the pipes. They get the same stop as the tool would.
    if let Termination::Exited(_) = termination {
        tokio::select! {
            reaped = child.reap_group(inv.grace) => reaped?,
            _ = &mut deadline => child.kill_group()?,
            _ = cancel.cancelled() => child.kill_group()?,
        }
    }

    let stdout = match tokio::time::timeout(DRAIN_LIMIT, &mut writer).await {
        Ok(joined) => joined.map_err(io::Error::other)??,
        Err(_) => {
            warn!(program = %program, "output still open after the tool exited, closing it");
            for reader in &readers {
                reader.abort();
            }
            writer.await.map_err(io::Error::other)??
        }
    };
    Ok(CommandOutcome {
        termination,
        stdout,
        elapsed: started.elapsed(),
    })
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn invocation(script: &str, dir: &std::path::Path) -> Invocation {
        Invocation {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            work_dir: dir.to_path_buf(),
            env: BTreeMap::from([("SUITE".to_string(), "billing".to_string())]),
            log_path: dir.join("out").join("output.log"),
            timeout: None,
            grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_logs_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation("echo out $SUITE; echo err >&2; exit 3", dir.path());
        let outcome = run_logged(&inv, &CancellationToken::new()).await.unwrap();

        match outcome.termination {
            Termination::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(outcome.stdout, "out billing\n");
        let log = std::fs::read_to_string(&inv.log_path).unwrap();
        assert!(log.contains("out billing"));
        assert!(log.contains("err"));
    }

    #[tokio::test]
    async fn timeout_kills_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("sleep 30", dir.path());
        inv.timeout = Some(Duration::from_millis(200));
        let started = Instant::now();
        let outcome = run_logged(&inv, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome.termination, Termination::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation("sleep 30", dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let outcome = run_logged(&inv, &cancel).await.unwrap();
        assert_eq!(outcome.termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn background_descendant_does_not_hold_the_job_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("sleep 20 & echo started", dir.path());
        inv.timeout = Some(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = run_logged(&inv, &cancel).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        assert!(matches!(outcome.termination, Termination::Exited(_)));
        assert_eq!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn background_descendant_is_stopped_without_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation("sleep 20 & echo started", dir.path());
        let started = Instant::now();
        let outcome = run_logged(&inv, &CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("", dir.path());
        inv.argv = vec!["/no/such/tool".into()];
        assert!(run_logged(&inv, &CancellationToken::new()).await.is_err());
    }
}
