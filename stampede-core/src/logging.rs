use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum Target {
    Stdout,
    File(File),
}

/// A log sink that can be retargeted at runtime: stdout by default, a
/// scenario-named file while a non-verbose run is in flight, and back to
/// stdout when the summary is printed. Cloning shares the target.
#[derive(Debug, Clone)]
pub struct LogWriter {
    target: Arc<Mutex<Target>>,
}

static GLOBAL: OnceLock<LogWriter> = OnceLock::new();

impl LogWriter {
    pub fn stdout() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stdout)),
        }
    }

    /// The writer the process-wide subscriber forwards through. The
    /// subscriber can only be installed once per process, so every run shares
    /// this one sink and retargets it; `redirect_to_file` and `restore` keep
    /// working for the second run onwards.
    pub fn global() -> Self {
        GLOBAL
            .get_or_init(|| {
                let writer = LogWriter::stdout();
                let filter = EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy();

                if tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer.clone())
                    .with_ansi(false)
                    .try_init()
                    .is_err()
                {
                    // The embedding application installed its own subscriber;
                    // log output stays wherever that subscriber sends it and
                    // file redirection has no effect.
                    tracing::warn!(
                        "a tracing subscriber is already installed; log redirection is unavailable"
                    );
                }

                writer
            })
            .clone()
    }

    /// Send subsequent log output to `<scenario>.log` in the working
    /// directory, returning the file path.
    pub fn redirect_to_file(&self, scenario: &str) -> io::Result<PathBuf> {
        let path = PathBuf::from(format!("{scenario}.log"));
        let file = File::create(&path)?;
        *self.target.lock() = Target::File(file);
        Ok(path)
    }

    /// Send log output back to stdout, closing any redirected file.
    pub fn restore(&self) {
        *self.target.lock() = Target::Stdout;
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock() {
            Target::Stdout => io::stdout().write(buf),
            Target::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock() {
            Target::Stdout => io::stdout().flush(),
            Target::File(f) => f.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
