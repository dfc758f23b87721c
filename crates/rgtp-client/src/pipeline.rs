//! 送信済みコマンドの待ち行列と応答の照合
//!
//! GTP は会話的に同期したプロトコルなので、応答は送信順に返ってくる。
//! ワイヤ上の id に頼らず、閉じた応答を常に最古の待機コマンドへ割り当てる。
//! プロセスに依存しない同期的な状態だけを持ち、入出力はトランスポートが担う。
//!
//! stdout と stderr は別のパイプなので、応答より前に書かれた診断行が応答の後に届くことがある。
//! 診断フック付きのコマンドは、応答が照合されてもフックが集計を終えたと言うまで
//! （最長で settle 期間）応答の引き渡しを保留し、その間の stderr 行もフックに渡す。

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::analyzer::SearchInfo;
use crate::error::GtpError;
use crate::response::{Framing, ParseEvent, Response, ResponseParser, Status};

/// stdout の生の行を受け取るフック。次のコマンドが送られるまで有効。
pub type StdoutHook = Box<dyn FnMut(&str) + Send>;

/// 呼び出し側が着手コマンドの stderr 行を覗くためのフック
pub type StderrHook = Box<dyn FnMut(&str) + Send>;

/// 着手コマンドの応答待ちの間、stderr の各行を受け取るフック。
pub trait DiagnosticHook: Send {
    fn on_line(&mut self, line: &str);

    /// 集計に必要な行（要約行など）を受け取り終えたか。
    /// 偽の間は、応答が照合されても settle 期間が切れるまで行を受け取り続ける。
    fn is_complete(&self) -> bool {
        false
    }

    /// 応答の引き渡し時に一度だけ呼ばれ、蓄積した統計を返す。
    fn finish(self: Box<Self>) -> SearchInfo;
}

/// 成功応答と、そのコマンドに紐づいた診断結果
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: Response,
    pub diagnostics: Option<SearchInfo>,
}

impl Reply {
    pub fn body(&self) -> &str {
        &self.response.body
    }
}

type ReplySender = oneshot::Sender<Result<Reply, GtpError>>;

/// 応答待ちのコマンド
struct PendingCommand {
    seq: u64,
    text: String,
    reply: ReplySender,
}

struct ActiveDiagnostic {
    seq: u64,
    hook: Box<dyn DiagnosticHook>,
}

/// 応答は照合済みで、診断行の到着を待っているコマンド
struct SettlingReply {
    response: Response,
    reply: ReplySender,
    hook: Box<dyn DiagnosticHook>,
    deadline: Instant,
}

impl SettlingReply {
    fn deliver(self) {
        let diagnostics = Some(self.hook.finish());
        let _ = self.reply.send(Ok(Reply {
            response: self.response,
            diagnostics,
        }));
    }
}

/// [`CommandPipeline::enqueue`] が返す応答待ちの future
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, GtpError>>,
}

impl Future for PendingReply {
    type Output = Result<Reply, GtpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // パイプラインごと破棄された
            Poll::Ready(Err(_)) => Poll::Ready(Err(GtpError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// セッション1つ分のコマンド待ち行列
pub struct CommandPipeline {
    pending: VecDeque<PendingCommand>,
    next_id: u64,
    numbered: bool,
    parser: ResponseParser,
    diagnostic: Option<ActiveDiagnostic>,
    settling: Option<SettlingReply>,
    settle: Duration,
    stdout_hook: Option<StdoutHook>,
}

impl CommandPipeline {
    /// `numbered` が真なら、ワイヤ上のコマンドの先頭に連番 id を付ける。
    pub fn new(framing: Framing, numbered: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 1,
            numbered,
            parser: ResponseParser::new(framing),
            diagnostic: None,
            settling: None,
            settle: Duration::ZERO,
            stdout_hook: None,
        }
    }

    /// 応答の照合後も診断行を待つ最長期間。0 なら応答と同時に引き渡す。
    pub fn with_diagnostic_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// stderr 行を受け取るフックがあるか（応答照合後の保留中を含む）
    pub fn has_diagnostic(&self) -> bool {
        self.diagnostic.is_some() || self.settling.is_some()
    }

    /// 保留中の応答を引き渡す期限
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settling.as_ref().map(|s| s.deadline)
    }

    /// 期限を過ぎた保留中の応答を、そこまでの診断結果と共に引き渡す。
    pub fn flush_settled(&mut self, now: Instant) {
        if self.settling.as_ref().is_some_and(|s| s.deadline <= now) {
            self.deliver_settled();
        }
    }

    /// コマンドを待ち行列に積み、書き込むべきワイヤ上の1行（改行なし）と応答待ちを返す。
    ///
    /// 診断フックが既に有効なら何も積まずに [`GtpError::DiagnosticBusy`] を返す。
    /// 保留中の応答はここで引き渡す（以降の stderr 行は新しいコマンドのもの）。
    /// `stdout` は前のコマンドの stdout フックを置き換える（`None` なら解除）。
    pub fn enqueue(
        &mut self,
        text: &str,
        diagnostic: Option<Box<dyn DiagnosticHook>>,
        stdout: Option<StdoutHook>,
    ) -> Result<(String, PendingReply), GtpError> {
        if diagnostic.is_some() && self.diagnostic.is_some() {
            return Err(GtpError::DiagnosticBusy);
        }
        self.deliver_settled();
        let seq = self.next_id;
        self.next_id += 1;

        let wire = if self.numbered {
            format!("{seq} {text}")
        } else {
            text.to_string()
        };
        self.stdout_hook = stdout;
        if let Some(hook) = diagnostic {
            self.diagnostic = Some(ActiveDiagnostic { seq, hook });
        }
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingCommand {
            seq,
            text: text.to_string(),
            reply: tx,
        });
        Ok((wire, PendingReply { rx }))
    }

    pub fn on_stdout_line(&mut self, line: &str) {
        if let Some(hook) = self.stdout_hook.as_mut() {
            hook(line);
        }
        match self.parser.feed(line) {
            Some(ParseEvent::Response(response)) => self.complete_oldest(response),
            Some(ParseEvent::Error(message)) => self.on_protocol_error(message),
            None => {}
        }
    }

    /// stdout の行を文字列として解釈できなかった。
    pub fn on_decode_error(&mut self, message: String) {
        self.on_protocol_error(message);
    }

    pub fn on_stderr_line(&mut self, line: &str) {
        if let Some(active) = self.diagnostic.as_mut() {
            active.hook.on_line(line);
        } else if let Some(settling) = self.settling.as_mut() {
            settling.hook.on_line(line);
            if settling.hook.is_complete() {
                self.deliver_settled();
            }
        }
    }

    /// 待機中のコマンドをすべて `err` で reject し、フックとパーサの状態を捨てる。
    /// 照合済みで保留中の応答は成功として引き渡す。reject した件数を返す。
    pub fn reject_all(&mut self, err: &GtpError) -> usize {
        self.deliver_settled();
        let count = self.pending.len();
        for cmd in self.pending.drain(..) {
            log::debug!("rejecting {:?}: {err}", cmd.text);
            let _ = cmd.reply.send(Err(err.clone()));
        }
        self.diagnostic = None;
        self.stdout_hook = None;
        self.parser.reset();
        count
    }

    fn deliver_settled(&mut self) {
        if let Some(settling) = self.settling.take() {
            settling.deliver();
        }
    }

    fn complete_oldest(&mut self, mut response: Response) {
        let Some(cmd) = self.pending.pop_front() else {
            log::warn!("response without a pending command: {:?}", response.body);
            return;
        };
        let hook = match self.diagnostic.take() {
            Some(active) if active.seq == cmd.seq => Some(active.hook),
            other => {
                self.diagnostic = other;
                None
            }
        };
        response.command = cmd.text;
        match (response.status, hook) {
            (Status::Success, Some(hook)) if !self.settle.is_zero() && !hook.is_complete() => {
                self.settling = Some(SettlingReply {
                    response,
                    reply: cmd.reply,
                    hook,
                    deadline: Instant::now() + self.settle,
                });
            }
            (Status::Success, hook) => {
                let diagnostics = hook.map(|hook| hook.finish());
                // 呼び出し側が待たずに捨てた場合は送れなくてよい
                let _ = cmd.reply.send(Ok(Reply {
                    response,
                    diagnostics,
                }));
            }
            (Status::Failure, _) => {
                let _ = cmd.reply.send(Err(GtpError::EngineFailure {
                    id: response.id,
                    reason: response.body,
                }));
            }
        }
    }

    fn on_protocol_error(&mut self, message: String) {
        self.parser.reset();
        let Some(cmd) = self.pending.pop_front() else {
            log::warn!("protocol error with no pending command: {message}");
            return;
        };
        if self.diagnostic.as_ref().is_some_and(|d| d.seq == cmd.seq) {
            self.diagnostic = None;
        }
        log::warn!("protocol error for {:?}: {message}", cmd.text);
        let _ = cmd.reply.send(Err(GtpError::Protocol(message)));
    }
}
