//! Logging backend which logs to a file, and over UDP in debug builds.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{mpsc, Mutex},
};

use chrono::Local;
use eyre::{Result, WrapErr};
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Environment variable naming the `host:port` that debug builds send log messages to.
#[cfg(feature = "debug")]
const UDP_TARGET_VAR: &str = "REHOOK_LOG_UDP";

#[derive(Clone, Copy, Serialize, Deserialize)]
enum MessageType {
    Normal,
    Error,
    Warning,
    Debug,
}

impl MessageType {
    fn name(self) -> &'static str {
        match self {
            MessageType::Normal => "info",
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Debug => "debug",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Message {
    module: String,
    msg_type: MessageType,
    string: String,
    time: String,
}

impl Message {
    /// Serialises the message with its length (including the length itself) in front.
    #[cfg(feature = "debug")]
    fn pack(&self) -> Option<Vec<u8>> {
        let serialized = bincode::serialize::<Message>(self).ok()?;

        let mut packed = Vec::from(u32::to_le_bytes((serialized.len() as u32) + 4));
        packed.extend(&serialized);

        Some(packed)
    }

    fn write_to(&self, out: &mut impl Write) {
        //      [date time] [module] [level] Text
        let _ = writeln!(
            out,
            "[{}] [{}] [{}] {}",
            self.time,
            self.module,
            self.msg_type.name(),
            self.string
        );
    }
}

/// Modules whose logs are too chatty to be useful here.
const MUTED_MODULES: [&str; 3] = ["mio::", "reqwest", "hyper"];

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let msg_type = match record.level() {
            Level::Error => MessageType::Error,
            Level::Warn => MessageType::Warning,
            Level::Info => MessageType::Normal,
            Level::Debug | Level::Trace => MessageType::Debug,
        };

        let module_path = match record.module_path() {
            Some(path) if MUTED_MODULES.iter().any(|muted| path.contains(muted)) => return,
            Some(path) => path,
            None => return,
        };

        let message = Message {
            module: module_path
                .split("::")
                .last()
                .unwrap_or("unknown")
                .to_string(),
            msg_type,
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(sender) = MSG_SENDER.get() {
            if let Ok(sender) = sender.lock() {
                // The writer thread only stops if the process is going down.
                let _ = sender.send(message);
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Message>>> = OnceCell::new();
static CRASH_PATH: OnceCell<PathBuf> = OnceCell::new();

fn install_panic_hook() {
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "no message".to_string());

        let location = info
            .location()
            .map(|location| location.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let time = Local::now();
        let backtrace = std::backtrace::Backtrace::force_capture();

        let report = format!(
            "rehook panicked.

Message: {message}
Location: {location}
Time: {time}
Backtrace: see below

{backtrace}"
        );

        log::error!("{report}");

        if let Some(path) = CRASH_PATH.get() {
            let _ = std::fs::write(path, &report);
        }

        // Leave the host's own panic handling in charge of what happens next.
        previous(info);
    }));
}

/// Starts logging to the file at `path`. A crash report is written to `PANIC.txt` in the same
/// directory if anything panics. Calling this again once logging is running does nothing.
pub fn init(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    if MSG_SENDER.get().is_some() {
        log::warn!("logging is already initialised");
        return Ok(());
    }

    let mut file = File::create(path)
        .wrap_err_with(|| format!("unable to create log file at {}", path.display()))?;

    // Until the sender is set, records reaching `LOGGER` are dropped. Setting it only after the
    // logger is in place means a failed `init` can be retried.
    log::set_logger(&LOGGER)
        .map(|_| log::set_max_level(log::LevelFilter::max()))
        .wrap_err("another logger is already installed")?;

    let (sender, receiver) = mpsc::channel::<Message>();

    if MSG_SENDER.set(Mutex::new(sender)).is_err() {
        // Lost a race with another `init`.
        return Ok(());
    }

    let crash_path = path.with_file_name("PANIC.txt");
    let _ = CRASH_PATH.set(crash_path);
    install_panic_hook();

    #[cfg(feature = "debug")]
    let socket = std::env::var(UDP_TARGET_VAR).ok().and_then(|target| {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(target).ok()?;
        Some(socket)
    });

    // Writing happens on a background thread so that logging from a patched host function costs
    // next to nothing.
    std::thread::Builder::new()
        .name("rehook-log".to_string())
        .spawn(move || {
            for msg in receiver {
                msg.write_to(&mut file);

                #[cfg(feature = "debug")]
                {
                    if let (Some(socket), Some(bin)) = (&socket, msg.pack()) {
                        let _ = socket.send(&bin);
                    }
                }
            }
        })
        .wrap_err("unable to start log writer thread")?;

    log::info!("logging to {}", path.display());
    Ok(())
}
