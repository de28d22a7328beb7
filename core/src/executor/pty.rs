use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use engine_protocol::Event;
use engine_protocol::KernelStatus;
use engine_protocol::Language;
use parking_lot::Mutex;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::error::Result;
use crate::executor::Executor;

fn repl_command(language: Language) -> (&'static str, Vec<&'static str>) {
    match language {
        Language::Python => ("python3", vec!["-u", "-i", "-q"]),
        Language::Typescript | Language::Javascript => ("node", vec!["-i"]),
    }
}

fn print_sentinel(language: Language, sentinel: &str) -> String {
    match language {
        Language::Python => format!("print({sentinel:?})"),
        Language::Typescript | Language::Javascript => format!("console.log({sentinel:?})"),
    }
}

struct Started {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_tx: tokio::sync::broadcast::Sender<Vec<u8>>,
    killer: StdMutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    wait_handle: JoinHandle<()>,
    exited: Arc<AtomicBool>,
}

/// A REPL process on a pseudo-terminal, generalized over `python3 -i` and
/// `node -i`. One `PtyExecutor` is one kernel's sandbox: it survives across
/// many `execute` calls, each of which writes code followed by a private
/// sentinel print the harness uses to detect completion. Clients never see
/// the sentinel — only the resulting [`Event`] stream.
pub struct PtyExecutor {
    language: Language,
    started: Mutex<Option<Started>>,
    busy: Arc<AtomicBool>,
    status: Arc<Mutex<KernelStatus>>,
    interrupted: Arc<AtomicBool>,
}

impl PtyExecutor {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            started: Mutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(KernelStatus::Starting)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Executor for PtyExecutor {
    async fn start(&self) -> Result<()> {
        if self.started.lock().is_some() {
            return Ok(());
        }
        let language = self.language;
        let started = tokio::task::spawn_blocking(move || spawn_repl(language))
            .await
            .map_err(EngineError::from)??;
        *self.started.lock() = Some(started);
        *self.status.lock() = KernelStatus::Idle;
        Ok(())
    }

    async fn execute(&self, code: String) -> Result<mpsc::Receiver<Event>> {
        if self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(EngineError::Conflict("kernel busy".to_string()));
        }
        if *self.status.lock() == KernelStatus::Dead {
            self.busy.store(false, Ordering::SeqCst);
            return Err(EngineError::KernelDead("executor is dead".to_string()));
        }
        let (writer_tx, raw_rx, exited) = {
            let guard = self.started.lock();
            let started = guard.as_ref().ok_or_else(|| {
                EngineError::InvalidInput("executor not started".to_string())
            })?;
            (
                started.writer_tx.clone(),
                started.output_tx.subscribe(),
                Arc::clone(&started.exited),
            )
        };

        let (events_tx, events_rx) = mpsc::channel::<Event>(256);
        let sentinel = format!("__engine_sentinel_{}__", Uuid::new_v4().simple());
        let sentinel_line = print_sentinel(self.language, &sentinel);
        *self.status.lock() = KernelStatus::Busy;
        self.interrupted.store(false, Ordering::SeqCst);

        let _ = events_tx
            .send(Event::StreamStart {
                message: "execution started".to_string(),
            })
            .await;

        if writer_tx
            .send(format!("{code}\n{sentinel_line}\n").into_bytes())
            .await
            .is_err()
        {
            let _ = events_tx
                .send(Event::error("KernelDead", "executor stdin closed"))
                .await;
            self.busy.store(false, Ordering::SeqCst);
            *self.status.lock() = KernelStatus::Dead;
            return Ok(events_rx);
        }

        tokio::spawn(run_execute_loop(
            events_tx,
            raw_rx,
            sentinel,
            exited,
            Arc::clone(&self.busy),
            Arc::clone(&self.status),
            Arc::clone(&self.interrupted),
        ));
        Ok(events_rx)
    }

    async fn interrupt(&self) -> Result<()> {
        if !self.busy.load(Ordering::SeqCst) {
            return Ok(());
        }
        let writer_tx = {
            let guard = self.started.lock();
            guard.as_ref().map(|s| s.writer_tx.clone())
        };
        // Flag first so the execute loop's next poll tick terminates the
        // stream even if the REPL never echoes anything back.
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(writer_tx) = writer_tx {
            // ETX (Ctrl-C) asks the REPL's line editor to abort the current statement.
            let _ = writer_tx.send(vec![0x03]).await;
        }
        Ok(())
    }

    fn status(&self) -> KernelStatus {
        *self.status.lock()
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(started) = self.started.lock().take() {
            if let Ok(mut killer) = started.killer.lock() {
                let _ = killer.kill();
            }
            started.reader_handle.abort();
            started.writer_handle.abort();
            started.wait_handle.abort();
        }
        *self.status.lock() = KernelStatus::Dead;
        Ok(())
    }
}

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";
const INTERRUPT_POLL: std::time::Duration = std::time::Duration::from_millis(50);

/// Reads raw PTY bytes until the sentinel line appears, converting buffered
/// lines into `stream` events and finishing with exactly one terminator,
/// mirroring the one-terminator-per-session invariant. A Python traceback is
/// recognized by its header and routed to `stream{stderr}` line by line,
/// with its final `Ename: evalue` line producing an `execute_error`
/// terminator instead of `stream_complete`. An `interrupt()` call is
/// observed within one poll tick and always wins: no further output events
/// are emitted once it is seen, even if the sentinel is already buffered.
async fn run_execute_loop(
    events_tx: mpsc::Sender<Event>,
    mut raw_rx: tokio::sync::broadcast::Receiver<Vec<u8>>,
    sentinel: String,
    exited: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    status: Arc<Mutex<KernelStatus>>,
    interrupted: Arc<AtomicBool>,
) {
    let mut buffer = String::new();
    let mut emitted = 0usize;
    let mut traceback: Option<Vec<String>> = None;
    let finish = |dead: bool| {
        busy.store(false, Ordering::SeqCst);
        *status.lock() = if dead {
            KernelStatus::Dead
        } else {
            KernelStatus::Idle
        };
    };

    loop {
        if exited.load(Ordering::SeqCst) {
            let _ = events_tx
                .send(Event::error("KernelDead", "interpreter process exited"))
                .await;
            finish(true);
            return;
        }
        if interrupted.load(Ordering::SeqCst) {
            let _ = events_tx
                .send(Event::ExecuteError {
                    ename: "KeyboardInterrupt".to_string(),
                    evalue: "execution interrupted".to_string(),
                    traceback: None,
                })
                .await;
            finish(false);
            return;
        }

        let chunk = match tokio::time::timeout(INTERRUPT_POLL, raw_rx.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                debug!("executor output receiver lagged; continuing");
                continue;
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                let _ = events_tx
                    .send(Event::error("KernelDead", "interpreter output channel closed"))
                    .await;
                finish(true);
                return;
            }
            Err(_elapsed) => continue,
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(idx) = buffer.find('\n') {
            let line: String = buffer.drain(..=idx).collect();
            let line = line.trim_end_matches(['\r', '\n']).to_string();

            if interrupted.load(Ordering::SeqCst) {
                let _ = events_tx
                    .send(Event::ExecuteError {
                        ename: "KeyboardInterrupt".to_string(),
                        evalue: "execution interrupted".to_string(),
                        traceback: None,
                    })
                    .await;
                finish(false);
                return;
            }

            if line.contains(&sentinel) {
                let _ = events_tx
                    .send(Event::StreamComplete {
                        message: "execution complete".to_string(),
                        output_count: emitted,
                    })
                    .await;
                finish(false);
                return;
            }

            if let Some(lines) = traceback.as_mut() {
                lines.push(line.clone());
                if !line.starts_with(' ') && line != TRACEBACK_HEADER {
                    let (ename, evalue) = match line.split_once(": ") {
                        Some((ename, evalue)) => (ename.to_string(), evalue.to_string()),
                        None => (line.clone(), String::new()),
                    };
                    let _ = events_tx
                        .send(Event::ExecuteError {
                            ename,
                            evalue,
                            traceback: Some(lines.clone()),
                        })
                        .await;
                    finish(false);
                    return;
                }
                emitted += 1;
                let _ = events_tx
                    .send(Event::Stream {
                        name: engine_protocol::event::StreamName::Stderr,
                        text: format!("{line}\n"),
                    })
                    .await;
                continue;
            }

            if line.is_empty() {
                continue;
            }
            if line == TRACEBACK_HEADER {
                traceback = Some(vec![line.clone()]);
                emitted += 1;
                let _ = events_tx
                    .send(Event::Stream {
                        name: engine_protocol::event::StreamName::Stderr,
                        text: format!("{line}\n"),
                    })
                    .await;
                continue;
            }
            emitted += 1;
            let _ = events_tx
                .send(Event::Stream {
                    name: engine_protocol::event::StreamName::Stdout,
                    text: format!("{line}\n"),
                })
                .await;
        }
    }
}

fn spawn_repl(language: Language) -> Result<Started> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| EngineError::InvalidInput(format!("failed to open pty: {e}")))?;

    let (program, args) = repl_command(language);
    let mut command = CommandBuilder::new(program);
    for arg in args {
        command.arg(arg);
    }

    let mut child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| EngineError::InvalidInput(format!("failed to spawn {program}: {e}")))?;
    let killer = child.clone_killer();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    let (output_tx, _) = tokio::sync::broadcast::channel::<Vec<u8>>(256);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| EngineError::InvalidInput(format!("failed to clone pty reader: {e}")))?;
    let output_tx_clone = output_tx.clone();
    let reader_handle = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = output_tx_clone.send(buf[..n].to_vec());
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| EngineError::InvalidInput(format!("failed to take pty writer: {e}")))?;
    let writer = Arc::new(StdMutex::new(writer));
    let writer_handle = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        }
    });

    let exited = Arc::new(AtomicBool::new(false));
    let wait_exited = Arc::clone(&exited);
    let wait_handle = tokio::task::spawn_blocking(move || {
        let _ = child.wait();
        wait_exited.store(true, Ordering::SeqCst);
    });

    Ok(Started {
        writer_tx,
        output_tx,
        killer: StdMutex::new(killer),
        reader_handle,
        writer_handle,
        wait_handle,
        exited,
    })
}

impl Drop for PtyExecutor {
    fn drop(&mut self) {
        if let Some(started) = self.started.get_mut().take() {
            if let Ok(mut killer) = started.killer.lock() {
                let _ = killer.kill();
            }
            started.reader_handle.abort();
            started.writer_handle.abort();
            started.wait_handle.abort();
        } else {
            warn!("dropping PtyExecutor that was never started");
        }
    }
}
