//! 控制任务与刷写任务
//!
//! - 控制任务：持有刷写任务的句柄，串行处理 [`ControlCommand`]，发布 [`PipelineState`]。
//! - 刷写任务：批量模式下按节拍取出消息，逐条模式下消息到达即写入；
//!   写入失败的批次保留到下一个节拍单独重试，连续失败达到上限后退出并上报致命错误。
//!
//! 停止时缓冲区与未写入的失败批次都会保留，下次启动继续写入。

use crate::buffer::{MessageBuffer, PushOutcome};
use crate::{DispatchMode, PipelineConfig, PipelineError};
use domain::{Point, RawMessage};
use mqf_encode::{EncodeError, SeriesEncoder};
use mqf_sink::{PointBatch, PointSink, SinkError};
use mqf_telemetry::{
    record_batch_written, record_decode_failure, record_encode_skipped, record_point_encoded,
    record_points_abandoned, record_source_disconnect, record_write_failure,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// 流水线运行状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Stopped,
    Started,
    /// sink 连续写入失败，流水线不再写入，需由进程退出处理。
    Failed,
}

/// 对外发布的流水线状态快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub status: PipelineStatus,
    pub source_connected: bool,
    pub fatal_error: Option<String>,
}

/// 控制命令。
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        ack: oneshot::Sender<Result<(), PipelineError>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    /// 立即执行一次刷写，完成后应答。
    Flush {
        ack: oneshot::Sender<()>,
    },
    SourceStatus {
        connected: bool,
    },
    /// 停止并尽量写出剩余数据，应答放弃的数据点数。
    Shutdown {
        ack: oneshot::Sender<usize>,
    },
}

enum FlushCommand {
    Flush { ack: oneshot::Sender<()> },
    Stop,
}

/// 刷写任务退出时交还的状态。
struct FlushExit {
    pending: Option<PointBatch>,
    fatal: Option<String>,
}

struct RunningFlush {
    commands: mpsc::Sender<FlushCommand>,
    handle: JoinHandle<FlushExit>,
}

enum ControlEvent {
    Command(Option<ControlCommand>),
    FlushExited(Result<FlushExit, JoinError>),
}

/// 流水线入口。
pub struct Pipeline;

impl Pipeline {
    /// 启动控制任务，初始状态为 `Stopped`；所有句柄释放后控制任务退出。
    pub fn spawn(
        config: PipelineConfig,
        encoder: Arc<SeriesEncoder>,
        sink: Arc<dyn PointSink>,
    ) -> PipelineHandle {
        let config = config.sanitized();
        let buffer = Arc::new(MessageBuffer::new(
            config.buffer_capacity,
            config.backpressure,
        ));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(PipelineState {
            status: PipelineStatus::Stopped,
            source_connected: false,
            fatal_error: None,
        });

        info!(
            target: "mqf.pipeline",
            mode = ?config.mode,
            batch_size = config.batch_size,
            capacity = config.buffer_capacity,
            tick_ms = config.tick.as_millis() as u64,
            backpressure = ?config.backpressure,
            "pipeline_spawned"
        );

        let controller = Controller {
            config,
            encoder,
            sink,
            buffer: buffer.clone(),
            state: state_tx,
            running: None,
            pending: None,
        };
        tokio::spawn(controller.run(command_rx));

        PipelineHandle {
            commands: command_tx,
            state: state_rx,
            buffer,
        }
    }
}

/// 流水线句柄，可克隆给采集任务与主流程共用。
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<PipelineState>,
    buffer: Arc<MessageBuffer>,
}

impl PipelineHandle {
    pub async fn start(&self) -> Result<(), PipelineError> {
        let (ack, done) = oneshot::channel();
        self.send(ControlCommand::Start { ack }).await?;
        done.await.map_err(|_| PipelineError::Closed)?
    }

    pub async fn stop(&self) -> Result<(), PipelineError> {
        let (ack, done) = oneshot::channel();
        self.send(ControlCommand::Stop { ack }).await?;
        done.await.map_err(|_| PipelineError::Closed)
    }

    /// 立即刷写；流水线未运行时直接返回。
    pub async fn flush(&self) -> Result<(), PipelineError> {
        let (ack, done) = oneshot::channel();
        self.send(ControlCommand::Flush { ack }).await?;
        done.await.map_err(|_| PipelineError::Closed)
    }

    /// 停止流水线并尽量写出剩余数据，返回放弃（未写入）的数据点数。
    ///
    /// 缓冲中未编码的消息按一条消息一个数据点计。流水线已失败时不再写入。
    pub async fn shutdown(&self) -> Result<usize, PipelineError> {
        let (ack, done) = oneshot::channel();
        self.send(ControlCommand::Shutdown { ack }).await?;
        done.await.map_err(|_| PipelineError::Closed)
    }

    pub async fn source_status(&self, connected: bool) -> Result<(), PipelineError> {
        self.send(ControlCommand::SourceStatus { connected }).await
    }

    /// 放入缓冲；`Block` 策略下缓冲区满时等待。
    pub async fn submit(&self, message: RawMessage) -> PushOutcome {
        self.buffer.push(message).await
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// 等待流水线进入指定状态。
    pub async fn wait_for_status(&self, status: PipelineStatus) -> Result<(), PipelineError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| current.status == status)
            .await
            .map(|_| ())
            .map_err(|_| PipelineError::Closed)
    }

    /// 等待流水线进入终止状态，返回失败原因。
    pub async fn wait_terminal(&self) -> PipelineError {
        let mut state = self.state.clone();
        let reason = state
            .wait_for(|current| current.status == PipelineStatus::Failed)
            .await
            .map(|current| current.fatal_error.clone().unwrap_or_default());
        match reason {
            Ok(reason) => PipelineError::SinkFatal(reason),
            Err(_) => PipelineError::Closed,
        }
    }

    async fn send(&self, command: ControlCommand) -> Result<(), PipelineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

struct Controller {
    config: PipelineConfig,
    encoder: Arc<SeriesEncoder>,
    sink: Arc<dyn PointSink>,
    buffer: Arc<MessageBuffer>,
    state: watch::Sender<PipelineState>,
    running: Option<RunningFlush>,
    /// 停止时交还的失败批次，下次启动优先重试。
    pending: Option<PointBatch>,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => ControlEvent::Command(command),
                exit = join_running(&mut self.running) => ControlEvent::FlushExited(exit),
            };
            match event {
                ControlEvent::Command(Some(command)) => self.handle(command).await,
                ControlEvent::Command(None) => {
                    self.stop_flush().await;
                    debug!(target: "mqf.pipeline", "pipeline_controller_exited");
                    return;
                }
                ControlEvent::FlushExited(exit) => {
                    self.running = None;
                    self.on_flush_exit(exit);
                }
            }
        }
    }

    async fn handle(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start { ack } => {
                let _ = ack.send(self.start());
            }
            ControlCommand::Stop { ack } => {
                self.stop_flush().await;
                let _ = ack.send(());
            }
            ControlCommand::Flush { ack } => match &self.running {
                Some(running) => {
                    if let Err(mpsc::error::SendError(FlushCommand::Flush { ack })) =
                        running.commands.send(FlushCommand::Flush { ack }).await
                    {
                        let _ = ack.send(());
                    }
                }
                None => {
                    debug!(target: "mqf.pipeline", "flush_ignored_while_stopped");
                    let _ = ack.send(());
                }
            },
            ControlCommand::SourceStatus { connected } => self.source_status(connected),
            ControlCommand::Shutdown { ack } => {
                self.stop_flush().await;
                let abandoned = self.drain_remaining().await;
                let _ = ack.send(abandoned);
            }
        }
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        if self.status() == PipelineStatus::Failed {
            return Err(PipelineError::AlreadyFailed);
        }
        if self.running.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(8);
        let worker = FlushWorker {
            config: self.config.clone(),
            encoder: self.encoder.clone(),
            sink: self.sink.clone(),
            buffer: self.buffer.clone(),
            pending: self.pending.take(),
            consecutive_failures: 0,
        };
        let handle = tokio::spawn(worker.run(rx));
        self.running = Some(RunningFlush {
            commands: tx,
            handle,
        });
        self.state
            .send_modify(|state| state.status = PipelineStatus::Started);
        info!(target: "mqf.pipeline", buffered = self.buffer.len(), "pipeline_started");
        Ok(())
    }

    async fn stop_flush(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.commands.send(FlushCommand::Stop).await;
        let exit = running.handle.await;
        self.on_flush_exit(exit);
    }

    fn on_flush_exit(&mut self, exit: Result<FlushExit, JoinError>) {
        let exit = match exit {
            Ok(exit) => exit,
            Err(err) => FlushExit {
                pending: None,
                fatal: Some(format!("flush task aborted: {}", err)),
            },
        };

        match exit.fatal {
            Some(reason) => {
                let abandoned = exit.pending.as_ref().map(PointBatch::len).unwrap_or(0);
                record_points_abandoned(abandoned);
                error!(
                    target: "mqf.pipeline",
                    abandoned,
                    error = %reason,
                    "pipeline_failed"
                );
                self.state.send_modify(|state| {
                    state.status = PipelineStatus::Failed;
                    state.fatal_error = Some(reason);
                });
            }
            None => {
                self.pending = exit.pending;
                self.state
                    .send_modify(|state| state.status = PipelineStatus::Stopped);
                info!(
                    target: "mqf.pipeline",
                    buffered = self.buffer.len(),
                    pending = self.pending.as_ref().map(PointBatch::len).unwrap_or(0),
                    "pipeline_stopped"
                );
            }
        }
    }

    /// 写出失败批次与缓冲中的全部消息，遇到写入失败即停止；剩余部分计为放弃。
    async fn drain_remaining(&mut self) -> usize {
        let mut worker = FlushWorker {
            config: self.config.clone(),
            encoder: self.encoder.clone(),
            sink: self.sink.clone(),
            buffer: self.buffer.clone(),
            pending: self.pending.take(),
            consecutive_failures: 0,
        };
        if self.status() != PipelineStatus::Failed {
            worker.drain_all().await;
        }

        let pending = worker.pending.take().map(|batch| batch.len()).unwrap_or(0);
        let buffered = self.buffer.drain(usize::MAX).len();
        let abandoned = pending + buffered;
        if abandoned > 0 {
            record_points_abandoned(abandoned);
            warn!(
                target: "mqf.pipeline",
                pending,
                buffered,
                "shutdown_data_abandoned"
            );
        }
        info!(target: "mqf.pipeline", abandoned, "pipeline_shutdown");
        abandoned
    }

    fn source_status(&mut self, connected: bool) {
        let previous = self.state.borrow().source_connected;
        if previous == connected {
            return;
        }
        self.state
            .send_modify(|state| state.source_connected = connected);
        if connected {
            info!(target: "mqf.pipeline", "source_connected");
        } else {
            record_source_disconnect();
            warn!(
                target: "mqf.pipeline",
                buffered = self.buffer.len(),
                "source_disconnected"
            );
        }
    }

    fn status(&self) -> PipelineStatus {
        self.state.borrow().status
    }
}

async fn join_running(running: &mut Option<RunningFlush>) -> Result<FlushExit, JoinError> {
    match running {
        Some(running) => (&mut running.handle).await,
        None => std::future::pending().await,
    }
}

struct FlushWorker {
    config: PipelineConfig,
    encoder: Arc<SeriesEncoder>,
    sink: Arc<dyn PointSink>,
    buffer: Arc<MessageBuffer>,
    pending: Option<PointBatch>,
    consecutive_failures: u32,
}

impl FlushWorker {
    async fn run(self, commands: mpsc::Receiver<FlushCommand>) -> FlushExit {
        match self.config.mode {
            DispatchMode::Batch => self.run_batched(commands).await,
            DispatchMode::Immediate => self.run_immediate(commands).await,
        }
    }

    async fn run_batched(mut self, mut commands: mpsc::Receiver<FlushCommand>) -> FlushExit {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 首个 tick 立即完成，跳过。
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(FlushCommand::Flush { ack }) => {
                        if let Err(reason) = self.flush_batch().await {
                            return self.exit(Some(reason));
                        }
                        let _ = ack.send(());
                    }
                    Some(FlushCommand::Stop) | None => return self.exit(None),
                },
                _ = ticker.tick() => {
                    if let Err(reason) = self.flush_batch().await {
                        return self.exit(Some(reason));
                    }
                }
            }
        }
    }

    async fn run_immediate(mut self, mut commands: mpsc::Receiver<FlushCommand>) -> FlushExit {
        let buffer = self.buffer.clone();
        let retry_delay = self.config.tick;

        loop {
            let retrying = self.pending.is_some();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(FlushCommand::Flush { ack }) => {
                        if let Err(reason) = self.drain_immediate().await {
                            return self.exit(Some(reason));
                        }
                        let _ = ack.send(());
                    }
                    Some(FlushCommand::Stop) | None => return self.exit(None),
                },
                _ = buffer.wait_non_empty(), if !retrying => {
                    if let Err(reason) = self.forward_one().await {
                        return self.exit(Some(reason));
                    }
                }
                _ = tokio::time::sleep(retry_delay), if retrying => {
                    if let Err(reason) = self.forward_one().await {
                        return self.exit(Some(reason));
                    }
                }
            }
        }
    }

    /// 批量模式的一次刷写：有失败批次时只重试它，否则取出至多 `batch_size` 条消息。
    async fn flush_batch(&mut self) -> Result<(), String> {
        if let Some(batch) = self.pending.take() {
            return self.write(batch).await;
        }
        let messages = self.buffer.drain(self.config.batch_size);
        if messages.is_empty() {
            return Ok(());
        }
        let points = self.encode_all(&messages);
        if points.is_empty() {
            return Ok(());
        }
        self.write(PointBatch::new(self.config.database.clone(), points))
            .await
    }

    /// 逐条模式：写入一条消息（或重试失败的那一条）。
    async fn forward_one(&mut self) -> Result<(), String> {
        if let Some(batch) = self.pending.take() {
            return self.write(batch).await;
        }
        let Some(message) = self.buffer.pop() else {
            return Ok(());
        };
        let points = self.encode_all(std::slice::from_ref(&message));
        if points.is_empty() {
            return Ok(());
        }
        self.write(PointBatch::new(self.config.database.clone(), points))
            .await
    }

    /// 退出前写出全部数据，首次写入失败即停止。
    async fn drain_all(&mut self) {
        while self.pending.is_some() || !self.buffer.is_empty() {
            let result = match self.config.mode {
                DispatchMode::Batch => self.flush_batch().await,
                DispatchMode::Immediate => self.forward_one().await,
            };
            if result.is_err() || self.pending.is_some() {
                return;
            }
        }
    }

    async fn drain_immediate(&mut self) -> Result<(), String> {
        while self.pending.is_some() || !self.buffer.is_empty() {
            self.forward_one().await?;
            if self.pending.is_some() {
                break;
            }
        }
        Ok(())
    }

    fn encode_all(&self, messages: &[RawMessage]) -> Vec<Point> {
        messages
            .iter()
            .filter_map(|message| match self.encoder.encode(message) {
                Ok(point) => {
                    record_point_encoded();
                    Some(point)
                }
                Err(EncodeError::Decode(err)) => {
                    record_decode_failure();
                    warn!(
                        target: "mqf.pipeline",
                        topic = %message.topic,
                        error = %err,
                        "payload_decode_failed"
                    );
                    None
                }
                Err(err) => {
                    record_encode_skipped();
                    warn!(
                        target: "mqf.pipeline",
                        topic = %message.topic,
                        error = %err,
                        "message_skipped"
                    );
                    None
                }
            })
            .collect()
    }

    /// 写入一个批次；可重试的失败保留批次，连续失败达到上限时返回致命原因。
    /// 被 sink 拒绝的批次直接丢弃并计数。
    async fn write(&mut self, batch: PointBatch) -> Result<(), String> {
        let started = Instant::now();
        let timeout = self.config.write_timeout;
        let result = match tokio::time::timeout(timeout, self.sink.write_batch(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout.as_millis() as u64)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                record_batch_written(batch.len(), latency_ms);
                debug!(
                    target: "mqf.pipeline",
                    points = batch.len(),
                    series = %batch.first_series(),
                    latency_ms,
                    "batch_flushed"
                );
                Ok(())
            }
            Err(err) if !err.is_retryable() => {
                record_write_failure();
                record_points_abandoned(batch.len());
                warn!(
                    target: "mqf.pipeline",
                    points = batch.len(),
                    series = %batch.first_series(),
                    error = %err,
                    "batch_rejected_dropped"
                );
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures += 1;
                record_write_failure();
                warn!(
                    target: "mqf.pipeline",
                    points = batch.len(),
                    failures = self.consecutive_failures,
                    error = %err,
                    "sink_write_failed"
                );
                self.pending = Some(batch);
                if self.consecutive_failures >= self.config.max_write_failures {
                    return Err(format!(
                        "{} consecutive write failures, last: {}",
                        self.consecutive_failures, err
                    ));
                }
                Ok(())
            }
        }
    }

    fn exit(mut self, fatal: Option<String>) -> FlushExit {
        FlushExit {
            pending: self.pending.take(),
            fatal,
        }
    }
}
