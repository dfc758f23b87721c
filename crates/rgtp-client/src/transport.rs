//! エンジンプロセスの起動と行単位の入出力
//!
//! stdout / stderr はそれぞれ専用のタスクで行に分割し、1本のイベントチャネルに流す。
//! ドライバタスクがイベント・書き込み要求・終了要求・プロセス終了を `select!` で待ち、
//! 行はすべて共有状態のロック下で [`CommandPipeline`] に渡す。
//!
//! プロセス終了時は、バッファに残った出力を短い猶予の間に処理してから
//! 待機中のコマンドを全て [`GtpError::ProcessExit`] で reject し、終了待ちを解決する。
//! 書き込みに失敗してこちらから終わらせた場合は、その [`GtpError::Io`] で reject する。

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::config::EngineConfig;
use crate::error::{ExitInfo, GtpError};
use crate::pipeline::{CommandPipeline, DiagnosticHook, PendingReply, StdoutHook};
use crate::response::Framing;

/// 終了後、パイプに残った出力を読み切るまでの猶予
const DRAIN_GRACE: Duration = Duration::from_millis(200);
/// SIGINT を無視するエンジンを強制終了するまでの猶予
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

type ExitSender = oneshot::Sender<Result<ExitInfo, GtpError>>;

pub(crate) enum ProcessState {
    NotStarted,
    Running {
        pid: Option<u32>,
        writer: mpsc::UnboundedSender<String>,
        interrupt: mpsc::UnboundedSender<()>,
    },
    Exited(ExitInfo),
    /// 誰も待っていない時に起きた実行時エラー。次の操作で呼び出し側に返す。
    Failed(GtpError),
}

pub(crate) struct Shared {
    state: ProcessState,
    pipeline: CommandPipeline,
    exit_waiters: Vec<ExitSender>,
}

/// 1つのエンジンプロセスを所有するトランスポート
pub struct LineTransport {
    shared: Arc<Mutex<Shared>>,
}

/// 実行中のプロセスを外から止めるための軽量ハンドル。`Clone` して別タスクに渡せる。
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Mutex<Shared>>,
}

impl Default for LineTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LineTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ProcessState::NotStarted,
                pipeline: CommandPipeline::new(Framing::default(), false),
                exit_waiters: Vec::new(),
            })),
        }
    }

    /// プロセスを起動する。tokio ランタイム上で呼ぶこと。
    ///
    /// 起動に失敗した場合は [`GtpError::Spawn`] を返し、状態は変えない。
    pub fn start(&self, config: &EngineConfig, extra_args: &[String]) -> Result<(), GtpError> {
        let mut shared = self.shared.lock();
        if matches!(shared.state, ProcessState::Running { .. }) {
            return Err(GtpError::AlreadyRunning);
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.work_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|err| {
            log::error!("failed to spawn {}: {err}", config.command.display());
            GtpError::Spawn(Arc::new(err))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_lines(stdout, Stream::Stdout, event_tx.clone()));
        tokio::spawn(read_lines(stderr, Stream::Stderr, event_tx));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let pid = child.id();
        log::info!(
            "started {} {:?} (pid {})",
            config.command.display(),
            config.args.iter().chain(extra_args).collect::<Vec<_>>(),
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        shared.pipeline = CommandPipeline::new(config.framing, config.numbered_commands)
            .with_diagnostic_settle(config.diagnostic_settle());
        shared.state = ProcessState::Running {
            pid,
            writer: write_tx,
            interrupt: interrupt_tx,
        };
        drop(shared);

        let driver = Driver {
            shared: Arc::clone(&self.shared),
            child,
            stdin,
            events: event_rx,
            writes: write_rx,
            interrupts: interrupt_rx,
            deadline: config.timeout().map(|t| Instant::now() + t),
        };
        tokio::spawn(driver.run());
        Ok(())
    }

    /// コマンドを1行書き込み、応答待ちを返す。
    ///
    /// 積み込みと書き込み要求は同じロックの下で行うため、待たずに続けて投げても送信順が保たれる。
    /// フックはロックを保持したまま呼ばれるので、フックの中からこのトランスポートを操作してはいけない。
    pub fn submit(
        &self,
        text: &str,
        diagnostic: Option<Box<dyn DiagnosticHook>>,
        stdout: Option<StdoutHook>,
    ) -> Result<PendingReply, GtpError> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        let writer = match &shared.state {
            ProcessState::Running { writer, .. } => writer,
            ProcessState::Failed(err) => return Err(err.clone()),
            ProcessState::NotStarted | ProcessState::Exited(_) => {
                return Err(GtpError::no_process(text));
            }
        };
        let (wire, reply) = shared.pipeline.enqueue(text, diagnostic, stdout)?;
        // 送れないのはドライバが終了処理に入った時だけで、積んだコマンドはそこで reject される
        let _ = writer.send(wire);
        Ok(reply)
    }

    /// 終了待ちを登録する。`quit` の送信前に登録しておけば終了を取りこぼさない。
    pub fn exit_waiter(&self) -> oneshot::Receiver<Result<ExitInfo, GtpError>> {
        register_exit_waiter(&self.shared)
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_running()
    }

    /// SIGINT を送り、終了するまで待つ。プロセスが無ければ何もせず `None`。
    pub async fn terminate(&self) -> Result<Option<ExitInfo>, GtpError> {
        terminate(&self.shared).await
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        if let ProcessState::Running { interrupt, .. } = &self.shared.lock().state {
            let _ = interrupt.send(());
        }
    }
}

impl ProcessHandle {
    pub fn is_running(&self) -> bool {
        matches!(self.shared.lock().state, ProcessState::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.shared.lock().state {
            ProcessState::Running { pid, .. } => *pid,
            _ => None,
        }
    }

    /// 終了済みならその終了情報
    pub fn exit_info(&self) -> Option<ExitInfo> {
        match &self.shared.lock().state {
            ProcessState::Exited(info) => Some(*info),
            _ => None,
        }
    }

    pub async fn terminate(&self) -> Result<Option<ExitInfo>, GtpError> {
        terminate(&self.shared).await
    }
}

/// 終了待ちの受信側を結果に変換する。
pub(crate) async fn await_exit(rx: oneshot::Receiver<Result<ExitInfo, GtpError>>) -> Result<ExitInfo, GtpError> {
    rx.await.unwrap_or(Err(GtpError::Canceled))
}

fn register_exit_waiter(shared: &Mutex<Shared>) -> oneshot::Receiver<Result<ExitInfo, GtpError>> {
    let (tx, rx) = oneshot::channel();
    let mut shared = shared.lock();
    match &shared.state {
        ProcessState::Running { .. } => shared.exit_waiters.push(tx),
        ProcessState::Exited(info) => {
            let _ = tx.send(Ok(*info));
        }
        ProcessState::Failed(err) => {
            let _ = tx.send(Err(err.clone()));
        }
        ProcessState::NotStarted => {
            let _ = tx.send(Err(GtpError::no_process("wait for exit")));
        }
    }
    rx
}

async fn terminate(shared: &Mutex<Shared>) -> Result<Option<ExitInfo>, GtpError> {
    let rx = {
        let mut guard = shared.lock();
        let ProcessState::Running { interrupt, .. } = &guard.state else {
            return Ok(None);
        };
        let _ = interrupt.send(());
        let (tx, rx) = oneshot::channel();
        guard.exit_waiters.push(tx);
        rx
    };
    await_exit(rx).await.map(Some)
}

fn missing_pipe(name: &str) -> GtpError {
    GtpError::Spawn(Arc::new(io::Error::other(format!("child {name} is not piped"))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum StreamEvent {
    Line(Stream, Vec<u8>),
    ReadError(Stream, io::Error),
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<StreamEvent>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                if tx.send(StreamEvent::Line(stream, std::mem::take(&mut buf))).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(StreamEvent::ReadError(stream, err));
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
}

struct Driver {
    shared: Arc<Mutex<Shared>>,
    child: Child,
    stdin: ChildStdin,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    writes: mpsc::UnboundedReceiver<String>,
    interrupts: mpsc::UnboundedReceiver<()>,
    deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        let mut escalate_at: Option<Instant> = None;
        let mut runtime_error: Option<GtpError> = None;

        let status = loop {
            let settle_at = self.shared.lock().pipeline.settle_deadline();
            tokio::select! {
                Some(event) = self.events.recv() => self.dispatch(event),
                Some(line) = self.writes.recv() => {
                    if let Err(err) = write_line(&mut self.stdin, &line).await {
                        log::error!("failed to write {line:?}: {err}");
                        runtime_error.get_or_insert(GtpError::Io(Arc::new(err)));
                        // 書き込めないプロセスは終わらせる。待機中のコマンドは終了処理で reject する
                        let _ = self.child.start_kill();
                    }
                }
                Some(()) = self.interrupts.recv() => {
                    send_signal(&mut self.child, Signal::Interrupt);
                    escalate_at.get_or_insert(Instant::now() + TERMINATE_GRACE);
                }
                _ = sleep_until_opt(self.deadline) => {
                    log::warn!("engine timed out; sending SIGTERM");
                    self.deadline = None;
                    send_signal(&mut self.child, Signal::Terminate);
                    escalate_at.get_or_insert(Instant::now() + TERMINATE_GRACE);
                }
                _ = sleep_until_opt(escalate_at) => {
                    log::warn!("engine ignored the interrupt; killing");
                    escalate_at = None;
                    let _ = self.child.start_kill();
                }
                _ = sleep_until_opt(settle_at) => {
                    self.shared.lock().pipeline.flush_settled(Instant::now());
                }
                status = self.child.wait() => break status,
            }
        };

        // パイプに残った応答や診断行を先に処理する
        let drain = async {
            while let Some(event) = self.events.recv().await {
                self.dispatch(event);
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            log::debug!("output streams still open after exit");
        }

        let info = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(err) => {
                log::error!("failed to wait for engine: {err}");
                runtime_error.get_or_insert(GtpError::Io(Arc::new(err)));
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        log::info!("engine exited with {info}");

        let mut shared = self.shared.lock();
        // 実行時エラーで終わらせた場合は、終了状態ではなくその原因を返す
        let cause = runtime_error.clone().unwrap_or(GtpError::ProcessExit(info));
        let rejected = shared.pipeline.reject_all(&cause);
        if rejected > 0 {
            log::debug!("rejected {rejected} pending command(s) on exit");
        }
        let waiters = std::mem::take(&mut shared.exit_waiters);
        shared.state = match runtime_error {
            Some(err) if rejected == 0 && waiters.is_empty() => ProcessState::Failed(err),
            _ => ProcessState::Exited(info),
        };
        drop(shared);
        for waiter in waiters {
            let _ = waiter.send(Ok(info));
        }
    }

    fn dispatch(&self, event: StreamEvent) {
        match event {
            StreamEvent::Line(Stream::Stdout, bytes) => match String::from_utf8(bytes) {
                Ok(line) => {
                    log::debug!("< {line}");
                    self.shared.lock().pipeline.on_stdout_line(&line);
                }
                Err(err) => {
                    let message = format!("stdout line is not utf-8: {err}");
                    self.shared.lock().pipeline.on_decode_error(message);
                }
            },
            StreamEvent::Line(Stream::Stderr, bytes) => {
                let line = String::from_utf8_lossy(&bytes);
                log::trace!("! {line}");
                self.shared.lock().pipeline.on_stderr_line(&line);
            }
            StreamEvent::ReadError(stream, err) => {
                log::warn!("failed to read engine {stream:?}: {err}");
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    log::debug!("> {line}");
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) {
    let signo = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    if let Some(pid) = child.id() {
        // SAFETY: wait 前の自分の子プロセスにシグナルを送るだけ
        if unsafe { libc::kill(pid as libc::pid_t, signo) } == 0 {
            return;
        }
    }
    if let Err(err) = child.start_kill() {
        log::warn!("failed to kill engine: {err}");
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: Signal) {
    if let Err(err) = child.start_kill() {
        log::warn!("failed to kill engine: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_without_process_is_no_process() {
        let transport = LineTransport::new();
        match transport.submit("boardsize 19", None, None) {
            Err(GtpError::NoProcess { command }) => assert_eq!(command, "boardsize 19"),
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn terminate_without_process_is_a_no_op() {
        let transport = LineTransport::new();
        assert_eq!(transport.terminate().await.unwrap(), None);
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_state_is_unchanged() {
        let transport = LineTransport::new();
        let config = EngineConfig::new("/nonexistent/gtp-engine-binary");
        assert!(matches!(transport.start(&config, &[]), Err(GtpError::Spawn(_))));
        assert!(matches!(
            transport.submit("name", None, None),
            Err(GtpError::NoProcess { .. })
        ));
    }
}
