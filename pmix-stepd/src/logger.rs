use crate::launcher::Launcher;
use std::sync::{Arc, Mutex, OnceLock};

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Forwards `log` records to the launcher, tagged the way it tags plugin
/// messages.
pub struct Logger {
    sink: Arc<dyn Launcher>,
    prefix: Mutex<String>,
}

impl Logger {
    pub fn init(level: log::LevelFilter, sink: Arc<dyn Launcher>) -> Result<(), log::SetLoggerError> {
        let logger = LOGGER.get_or_init(|| Logger {
            sink,
            prefix: Mutex::new("mpi/pmix: ".to_string()),
        });
        log::set_logger(logger).map(|()| log::set_max_level(level))
    }

    /// Adds the node identity to every following line once the step is known.
    pub fn set_node(hostname: &str, nodeid: u32) {
        if let Some(logger) = LOGGER.get() {
            if let Ok(mut prefix) = logger.prefix.lock() {
                *prefix = format!("mpi/pmix: {} [{}]: ", hostname, nodeid);
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match self.prefix.lock() {
            Ok(prefix) => prefix.clone(),
            Err(_) => "mpi/pmix: ".to_string(),
        };
        let line = format!(
            "{}{}:{}: {}",
            prefix,
            record.file().unwrap_or_default(),
            record.line().unwrap_or_default(),
            record.args()
        );
        self.sink.log(record.level(), &line);
    }

    fn flush(&self) {}
}
