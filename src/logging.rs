//! Process log output: a `tracing-subscriber` fmt layer writing to stdout and an optional append-only
//! file, either directly under a lock or through a background writer thread.
//!
//! The rest of the crate only uses the `tracing` macros, so nothing outside `main` depends on how or
//! whether output is installed.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

pub const DEFAULT_LOG_FILE: &str = "server.log";

const QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Queue lines to a writer thread instead of writing on the caller's thread.
    pub async_mode: bool,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            async_mode: true,
            file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
        }
    }
}

type Output = Box<dyn Write + Send>;

/// Fan-out to every configured output.
struct Outputs(Vec<Output>);

impl Outputs {
    fn write_line(&mut self, line: &[u8]) {
        for output in self.0.iter_mut() {
            // Nowhere left to report a failing log output.
            let _ = output.write_all(line);
        }
    }

    fn flush(&mut self) {
        for output in self.0.iter_mut() {
            let _ = output.flush();
        }
    }
}

enum Message {
    Line(Vec<u8>),
    Stop,
}

/// `MakeWriter` handed to the subscriber.
#[derive(Clone)]
pub struct LogWriter {
    target: Target,
}

#[derive(Clone)]
enum Target {
    Direct(Arc<Mutex<Outputs>>),
    Queued {
        sender: SyncSender<Message>,
        fallback: Arc<Mutex<Outputs>>,
    },
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.target {
            Target::Direct(outputs) => {
                let mut outputs = lock(outputs);
                outputs.write_line(buf);
                outputs.flush();
            }
            Target::Queued { sender, fallback } => {
                if let Err(mpsc::SendError(Message::Line(line))) =
                    sender.send(Message::Line(buf.to_vec()))
                {
                    // Writer already joined: write in place rather than lose the line.
                    let mut outputs = lock(fallback);
                    outputs.write_line(&line);
                    outputs.flush();
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the background writer alive. Dropping it flushes every queued line and joins the writer.
pub struct LogGuard {
    sender: Option<SyncSender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Message::Stop);
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Builds the writer pair for a set of outputs without installing anything globally.
pub fn writer(outputs: Vec<Output>, async_mode: bool) -> io::Result<(LogWriter, LogGuard)> {
    if !async_mode {
        let writer = LogWriter {
            target: Target::Direct(Arc::new(Mutex::new(Outputs(outputs)))),
        };
        let guard = LogGuard {
            sender: None,
            writer: None,
        };
        return Ok((writer, guard));
    }

    // Lines logged after the writer has exited go straight to the same outputs.
    let outputs = Arc::new(Mutex::new(Outputs(outputs)));
    let fallback = Arc::clone(&outputs);
    let (sender, receiver) = mpsc::sync_channel(QUEUE_DEPTH);
    let handle = thread::Builder::new()
        .name("log-writer".into())
        .spawn(move || drain_queue(receiver, &outputs))?;

    let writer = LogWriter {
        target: Target::Queued {
            sender: sender.clone(),
            fallback,
        },
    };
    let guard = LogGuard {
        sender: Some(sender),
        writer: Some(handle),
    };
    Ok((writer, guard))
}

fn lock(outputs: &Mutex<Outputs>) -> MutexGuard<'_, Outputs> {
    outputs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn drain_queue(receiver: Receiver<Message>, outputs: &Mutex<Outputs>) {
    'run: while let Ok(message) = receiver.recv() {
        let mut outputs = lock(outputs);
        let mut next = Some(message);
        // Write out the whole backlog before paying for a flush.
        while let Some(message) = next {
            match message {
                Message::Line(line) => outputs.write_line(&line),
                Message::Stop => {
                    outputs.flush();
                    break 'run;
                }
            }
            next = receiver.try_recv().ok();
        }
        outputs.flush();
    }
    let mut outputs = lock(outputs);
    for message in receiver.try_iter() {
        if let Message::Line(line) = message {
            outputs.write_line(&line);
        }
    }
    outputs.flush();
}

/// Installs the global subscriber. Hold the returned guard until the process is about to exit.
pub fn init(config: &LogConfig) -> anyhow::Result<LogGuard> {
    let mut outputs = vec![Box::new(io::stdout()) as Output];
    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        outputs.push(Box::new(file));
    }

    let (writer, guard) =
        writer(outputs, config.async_mode).context("cannot start log writer thread")?;

    tracing_subscriber::fmt()
        .with_max_level(config.level)
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("cannot install log subscriber: {err}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn async_writer_flushes_everything_on_guard_drop() {
        let capture = Capture::default();
        let (writer, guard) = writer(vec![Box::new(capture.clone()) as Output], true).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mut writer = writer.make_writer();
                thread::spawn(move || {
                    for i in 0..250 {
                        writer
                            .write_all(format!("thread {t} line {i}\n").as_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(guard);

        let lines = capture.lines();
        assert_eq!(lines.len(), 1000);
        for t in 0..4 {
            let own: Vec<_> = lines
                .iter()
                .filter(|line| line.starts_with(&format!("thread {t} ")))
                .collect();
            assert_eq!(own.len(), 250);
            assert_eq!(own[0], &format!("thread {t} line 0"));
            assert_eq!(own[249], &format!("thread {t} line 249"));
        }
    }

    #[test]
    fn lines_after_guard_drop_reach_the_same_outputs() {
        let capture = Capture::default();
        let (writer, guard) = writer(vec![Box::new(capture.clone()) as Output], true).unwrap();
        writer.make_writer().write_all(b"queued\n").unwrap();
        drop(guard);
        writer.make_writer().write_all(b"late\n").unwrap();
        assert_eq!(capture.lines(), vec!["queued", "late"]);
    }

    #[test]
    fn sync_writer_writes_in_place() {
        let capture = Capture::default();
        let (writer, _guard) = writer(vec![Box::new(capture.clone()) as Output], false).unwrap();
        writer.make_writer().write_all(b"one\n").unwrap();
        writer.make_writer().write_all(b"two\n").unwrap();
        assert_eq!(capture.lines(), vec!["one", "two"]);
    }

    #[test]
    fn subscriber_output_reaches_the_writer() {
        let capture = Capture::default();
        let (writer, guard) = writer(vec![Box::new(capture.clone()) as Output], true).unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("accepted connection");
            tracing::debug!("filtered out");
        });
        drop(guard);

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].ends_with("accepted connection"));
    }
}
