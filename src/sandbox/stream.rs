//! Incremental output of a sandboxed run

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

/// One item of execution output.
///
/// `Stdout`/`Stderr` carry a single line without its terminator. Every
/// stream ends with exactly one terminal variant.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
    /// Process exited on its own; `exit_code` is `None` when killed by a signal
    Exited {
        exit_code: Option<i32>,
        duration_ms: f64,
    },
    /// Wall-clock limit hit, process killed
    TimedOut { after: Duration },
    /// Stop requested, process killed
    Stopped,
    /// Supervisor error; resources were still released
    Failed(String),
}

impl OutputChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutputChunk::Stdout(_) | OutputChunk::Stderr(_))
    }
}

impl std::fmt::Display for OutputChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputChunk::Stdout(line) => write!(f, "{}", line),
            OutputChunk::Stderr(line) => write!(f, "[stderr] {}", line),
            OutputChunk::Exited {
                exit_code: Some(code),
                duration_ms,
            } => write!(f, "[exit {}] finished in {:.0}ms", code, duration_ms),
            OutputChunk::Exited {
                exit_code: None,
                duration_ms,
            } => write!(f, "[terminated by signal] after {:.0}ms", duration_ms),
            OutputChunk::TimedOut { after } => {
                write!(f, "Execution timed out after {}", format_secs(*after))
            }
            OutputChunk::Stopped => write!(f, "Execution stopped."),
            OutputChunk::Failed(msg) => write!(f, "Execution failed: {}", msg),
        }
    }
}

/// "30s" for whole seconds, "1.5s" otherwise
pub(crate) fn format_secs(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Receiving end of a running program's output
///
/// Single pass: once the terminal chunk has been returned, [`next`] yields
/// `None` forever. Dropping the stream before the end stops the program.
///
/// [`next`]: ExecutionStream::next
#[derive(Debug)]
pub struct ExecutionStream {
    run_id: String,
    rx: mpsc::Receiver<OutputChunk>,
    cancel: Arc<watch::Sender<bool>>,
    finished: bool,
}

impl ExecutionStream {
    pub(crate) fn new(
        run_id: impl Into<String>,
        rx: mpsc::Receiver<OutputChunk>,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            rx,
            cancel,
            finished: false,
        }
    }

    /// Identifier of the run feeding this stream
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the next chunk; `None` after the terminal chunk
    pub async fn next(&mut self) -> Option<OutputChunk> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Ask the supervisor to kill the program
    ///
    /// The stream still ends with [`OutputChunk::Stopped`].
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Render every chunk as a display line
    pub fn lines(mut self) -> impl Stream<Item = String> + Send {
        async_stream::stream! {
            while let Some(chunk) = self.next().await {
                yield chunk.to_string();
            }
        }
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<OutputChunk>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for ExecutionStream {
    type Item = OutputChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_chunk(cx)
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cancel.send(true);
        }
    }
}

/// Line reader that tolerates invalid UTF-8
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
        }
    }

    /// Next line without its `\n` / `\r\n`; `None` at EOF
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
