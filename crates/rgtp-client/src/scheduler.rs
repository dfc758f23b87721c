//! 接続ごとの「次の一手」要求を1本のワーカーで直列に処理するスケジューラ
//!
//! 同時に会話するエンジンプロセスは常に1つだけ。ジョブは投入順に1つずつ実行され、
//! 各ジョブは新しい [`Session`] を起動して `genmove_from` を行う。
//!
//! キャンセルは協調的に行う。実行前のジョブはプロセスを起動せずに [`GtpError::Canceled`] で終わり、
//! 実行中のジョブはプロセスに SIGINT を送り、その終了情報の [`GtpError::ProcessExit`] で終わる。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use rgtp_sgf::GameRecord;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::GtpError;
use crate::pipeline::StderrHook;
use crate::session::{MoveResult, OutputFormat, Session};
use crate::transport::ProcessHandle;

/// `genmove` の間の stderr 行を受け取るコールバック。ワーカータスクから呼ばれる。
pub type StderrListener = Arc<dyn Fn(&str) + Send + Sync>;

/// 1件の着手生成要求
#[derive(Clone, Default)]
pub struct MoveRequest {
    /// SGF テキスト
    pub record: String,
    /// 秒読み（秒）。`time_settings 0 <byoyomi> 1` として送る。
    pub byoyomi: Option<u32>,
    pub format: OutputFormat,
    /// 設定の引数に追加するエンジン引数
    pub extra_args: Vec<String>,
    pub on_stderr: Option<StderrListener>,
}

impl std::fmt::Debug for MoveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveRequest")
            .field("record", &self.record)
            .field("byoyomi", &self.byoyomi)
            .field("format", &self.format)
            .field("extra_args", &self.extra_args)
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

enum JobPhase {
    Queued,
    CanceledBeforeStart,
    /// プロセス起動中。ここで来たキャンセルは起動直後に反映する。
    Starting { cancel_requested: bool },
    Running {
        handle: ProcessHandle,
        termination_requested: bool,
    },
    Finished,
}

/// キャンセル可能なジョブ1件分の状態。遷移はすべて1つのロックの下で行う。
pub struct CancelableJob {
    phase: Mutex<JobPhase>,
}

impl std::fmt::Debug for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => f.write_str("Queued"),
            JobPhase::CanceledBeforeStart => f.write_str("CanceledBeforeStart"),
            JobPhase::Starting { cancel_requested } => {
                write!(f, "Starting {{ cancel_requested: {cancel_requested} }}")
            }
            JobPhase::Running {
                handle,
                termination_requested,
            } => write!(
                f,
                "Running {{ pid: {:?}, termination_requested: {termination_requested} }}",
                handle.pid()
            ),
            JobPhase::Finished => f.write_str("Finished"),
        }
    }
}

impl std::fmt::Debug for CancelableJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelableJob").field("phase", &*self.phase.lock()).finish()
    }
}

impl Default for CancelableJob {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelableJob {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(JobPhase::Queued),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.phase.lock(), JobPhase::Finished)
    }

    pub fn is_canceled(&self) -> bool {
        match &*self.phase.lock() {
            JobPhase::CanceledBeforeStart => true,
            JobPhase::Starting { cancel_requested } => *cancel_requested,
            JobPhase::Running {
                termination_requested,
                ..
            } => *termination_requested,
            JobPhase::Queued | JobPhase::Finished => false,
        }
    }

    /// 実行開始。既にキャンセルされていれば `Canceled`。
    fn begin(&self) -> Result<(), GtpError> {
        let mut phase = self.phase.lock();
        match &*phase {
            JobPhase::Queued => {
                *phase = JobPhase::Starting {
                    cancel_requested: false,
                };
                Ok(())
            }
            _ => Err(GtpError::Canceled),
        }
    }

    /// 起動したプロセスを紐づける。起動中にキャンセルが来ていれば `true`。
    fn attach(&self, handle: ProcessHandle) -> bool {
        let mut phase = self.phase.lock();
        let cancel_requested = matches!(
            *phase,
            JobPhase::Starting {
                cancel_requested: true
            }
        );
        *phase = JobPhase::Running {
            handle,
            termination_requested: cancel_requested,
        };
        cancel_requested
    }

    fn finish(&self) {
        *self.phase.lock() = JobPhase::Finished;
    }

    /// キャンセルする。実行中ならプロセスの終了まで待つ。終了済みのジョブには何もしない。
    pub async fn cancel(&self) -> Result<(), GtpError> {
        let handle = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                JobPhase::Queued => {
                    *phase = JobPhase::CanceledBeforeStart;
                    return Ok(());
                }
                JobPhase::Starting { cancel_requested } => {
                    *cancel_requested = true;
                    return Ok(());
                }
                JobPhase::Running {
                    handle,
                    termination_requested,
                } => {
                    *termination_requested = true;
                    handle.clone()
                }
                JobPhase::CanceledBeforeStart | JobPhase::Finished => return Ok(()),
            }
        };
        handle.terminate().await.map(|_| ())
    }
}

struct QueuedJob {
    job: Arc<CancelableJob>,
    request: MoveRequest,
    reply: oneshot::Sender<Result<MoveResult, GtpError>>,
}

/// [`MoveScheduler::schedule_next_move`] の結果を待つ future
pub struct JobTicket {
    rx: oneshot::Receiver<Result<MoveResult, GtpError>>,
}

impl Future for JobTicket {
    type Output = Result<MoveResult, GtpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // ワーカーが止まっている
            Poll::Ready(Err(_)) => Poll::Ready(Err(GtpError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// 全接続で共有する直列スケジューラ
pub struct MoveScheduler {
    queue: mpsc::UnboundedSender<QueuedJob>,
    registry: Mutex<HashMap<String, Arc<CancelableJob>>>,
}

impl MoveScheduler {
    /// ワーカータスクを起動する。tokio ランタイム上で呼ぶこと。
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(config, rx));
        Self {
            queue: tx,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// ジョブを積む。同じ接続の以前のジョブはレジストリ上で置き換えられる（実行は続く）。
    pub fn schedule_next_move(&self, connection_id: &str, request: MoveRequest) -> JobTicket {
        let job = Arc::new(CancelableJob::new());
        self.registry
            .lock()
            .insert(connection_id.to_string(), Arc::clone(&job));
        let (tx, rx) = oneshot::channel();
        log::debug!("scheduled move for {connection_id}");
        // ワーカーが止まっていれば reply が落ちて ticket 側が Canceled になる
        let _ = self.queue.send(QueuedJob {
            job,
            request,
            reply: tx,
        });
        JobTicket { rx }
    }

    /// 接続の現在のジョブをキャンセルする。ジョブが無ければ何もしない。
    pub async fn cancel(&self, connection_id: &str) -> Result<(), GtpError> {
        let job = self.registry.lock().get(connection_id).cloned();
        match job {
            Some(job) => {
                log::info!("canceling move for {connection_id}");
                job.cancel().await
            }
            None => Ok(()),
        }
    }

    /// 接続の現在のジョブ
    pub fn job(&self, connection_id: &str) -> Option<Arc<CancelableJob>> {
        self.registry.lock().get(connection_id).cloned()
    }
}

async fn run_worker(config: EngineConfig, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(queued) = rx.recv().await {
        let result = run_job(&config, &queued.job, queued.request).await;
        queued.job.finish();
        if let Err(err) = &result {
            log::info!("move job failed: {err}");
        }
        let _ = queued.reply.send(result);
    }
    log::debug!("move scheduler worker stopped");
}

async fn run_job(config: &EngineConfig, job: &CancelableJob, request: MoveRequest) -> Result<MoveResult, GtpError> {
    job.begin()?;
    let record = GameRecord::from_sgf(&request.record).map_err(GtpError::record)?;
    let mut session = Session::new(config.clone());
    session.start(&request.extra_args)?;
    if job.attach(session.handle()) {
        return match session.terminate().await? {
            Some(info) => Err(GtpError::ProcessExit(info)),
            None => Err(GtpError::Canceled),
        };
    }
    let on_stderr = request
        .on_stderr
        .map(|listener| Box::new(move |line: &str| listener(line)) as StderrHook);
    session
        .genmove_from(&record, request.byoyomi, request.format, on_stderr)
        .await
}
