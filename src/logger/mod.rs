//! Named loggers with a process-wide level and an optional user hook.
//!
//! Each component declares its own `static LazyLock<Logger>`; calling
//! [`set_log_level`] or [`set_user_log_handler`] reconfigures every live logger.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};

static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INSTANCES: LazyLock<Mutex<Vec<Weak<LoggerInner>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

type SharedLogHandler = Arc<dyn Fn(&Logger, LogLevel, &[LogArgument]) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    log_level: AtomicU8,
    log_handler: RwLock<SharedLogHandler>,
    user_log_handler: RwLock<Option<SharedLogHandler>>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(LoggerInner {
            name: name.into(),
            log_level: AtomicU8::new(GLOBAL_LOG_LEVEL.load(Ordering::SeqCst)),
            log_handler: RwLock::new(Arc::new(default_log_handler)),
            user_log_handler: RwLock::new(None),
        });
        INSTANCES.lock().unwrap().push(Arc::downgrade(&inner));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.log_level.load(Ordering::SeqCst))
    }

    pub fn set_log_level<L>(&self, level: L) -> Result<(), LogError>
    where
        L: IntoLogLevel,
    {
        let level = level.into_log_level()?;
        self.inner.log_level.store(level as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Replaces the handler that writes records for this logger.
    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&Logger, LogLevel, &[LogArgument]) + Send + Sync + 'static,
    {
        *self.inner.log_handler.write().unwrap() = Arc::new(handler);
    }

    pub fn reset_log_handler(&self) {
        *self.inner.log_handler.write().unwrap() = Arc::new(default_log_handler);
    }

    pub fn has_user_log_handler(&self) -> bool {
        self.inner.user_log_handler.read().unwrap().is_some()
    }

    pub fn debug(&self, arg: impl IntoLogArgument) {
        self.dispatch(LogLevel::Debug, vec![arg.into_log_argument()]);
    }

    pub fn log(&self, arg: impl IntoLogArgument) {
        self.dispatch(LogLevel::Verbose, vec![arg.into_log_argument()]);
    }

    pub fn info(&self, arg: impl IntoLogArgument) {
        self.dispatch(LogLevel::Info, vec![arg.into_log_argument()]);
    }

    pub fn warn(&self, arg: impl IntoLogArgument) {
        self.dispatch(LogLevel::Warn, vec![arg.into_log_argument()]);
    }

    pub fn error(&self, arg: impl IntoLogArgument) {
        self.dispatch(LogLevel::Error, vec![arg.into_log_argument()]);
    }

    /// Emits several arguments as one record, joined by spaces.
    pub fn log_with<I, T>(&self, level: LogLevel, args: I)
    where
        I: IntoIterator<Item = T>,
        T: IntoLogArgument,
    {
        let arguments = args.into_iter().map(IntoLogArgument::into_log_argument).collect();
        self.dispatch(level, arguments);
    }

    fn dispatch(&self, level: LogLevel, arguments: Vec<LogArgument>) {
        let user_handler = self.inner.user_log_handler.read().unwrap().clone();
        if let Some(handler) = user_handler {
            handler(self, level, &arguments);
        }
        let handler = self.inner.log_handler.read().unwrap().clone();
        handler(self, level, &arguments);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.inner.name)
            .field("log_level", &self.log_level())
            .finish()
    }
}

fn default_log_handler(logger: &Logger, level: LogLevel, args: &[LogArgument]) {
    if level < logger.log_level() || level == LogLevel::Silent {
        return;
    }

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let message = build_message(args);
    let header = format!("[{}]  {}:", now, logger.name());

    match level {
        LogLevel::Warn | LogLevel::Error => eprintln!("{header} {message}"),
        _ => println!("{header} {message}"),
    }
}

fn build_message(args: &[LogArgument]) -> String {
    args.iter()
        .filter_map(LogArgument::to_message_fragment)
        .collect::<Vec<_>>()
        .join(" ")
}

fn with_instances<F>(mut f: F)
where
    F: FnMut(Logger),
{
    let mut instances = INSTANCES.lock().unwrap();
    instances.retain(|weak| match weak.upgrade() {
        Some(inner) => {
            f(Logger { inner });
            true
        }
        None => false,
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Silent = 5,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Verbose,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "silent" => Ok(LogLevel::Silent),
            other => Err(LogError::InvalidLogLevel(other.to_string())),
        }
    }
}

pub trait IntoLogLevel {
    fn into_log_level(self) -> Result<LogLevel, LogError>;
}

impl IntoLogLevel for LogLevel {
    fn into_log_level(self) -> Result<LogLevel, LogError> {
        Ok(self)
    }
}

impl IntoLogLevel for &str {
    fn into_log_level(self) -> Result<LogLevel, LogError> {
        LogLevel::from_str(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Minimum level forwarded to the user handler. Defaults to each logger's level.
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub struct LogCallbackParams {
    pub level: LogLevel,
    pub message: String,
    pub args: Vec<Value>,
    pub logger_type: String,
}

pub type LogCallback = Arc<dyn Fn(LogCallbackParams) + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub enum LogArgument {
    Text(String),
    Value(Value),
}

impl LogArgument {
    fn to_message_fragment(&self) -> Option<String> {
        match self {
            LogArgument::Text(text) => Some(text.clone()),
            LogArgument::Value(Value::Null) => None,
            LogArgument::Value(Value::String(text)) => Some(text.clone()),
            LogArgument::Value(other) => Some(other.to_string()),
        }
    }

    fn to_callback_value(&self) -> Value {
        match self {
            LogArgument::Text(text) => Value::String(text.clone()),
            LogArgument::Value(value) => value.clone(),
        }
    }
}

pub trait IntoLogArgument {
    fn into_log_argument(self) -> LogArgument;
}

impl IntoLogArgument for LogArgument {
    fn into_log_argument(self) -> LogArgument {
        self
    }
}

impl IntoLogArgument for String {
    fn into_log_argument(self) -> LogArgument {
        LogArgument::Text(self)
    }
}

impl IntoLogArgument for &str {
    fn into_log_argument(self) -> LogArgument {
        LogArgument::Text(self.to_owned())
    }
}

impl IntoLogArgument for Value {
    fn into_log_argument(self) -> LogArgument {
        LogArgument::Value(self)
    }
}

#[derive(Debug, Clone)]
pub enum LogError {
    InvalidLogLevel(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::InvalidLogLevel(level) => write!(f, "Invalid log level \"{level}\""),
        }
    }
}

impl std::error::Error for LogError {}

/// Sets the level of every existing logger and of loggers created later.
pub fn set_log_level<L>(level: L) -> Result<(), LogError>
where
    L: IntoLogLevel,
{
    let level = level.into_log_level()?;
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    with_instances(|logger| {
        let _ = logger.set_log_level(level);
    });
    Ok(())
}

/// Installs (or with `None`, removes) a callback receiving records from every logger.
pub fn set_user_log_handler(callback: Option<LogCallback>, options: Option<LogOptions>) {
    let custom_level = options.unwrap_or_default().level;
    with_instances(|logger| {
        let handler: Option<SharedLogHandler> = callback.as_ref().map(|cb| {
            let cb = Arc::clone(cb);
            Arc::new(move |instance: &Logger, level: LogLevel, args: &[LogArgument]| {
                let threshold = custom_level.unwrap_or_else(|| instance.log_level());
                if level < threshold {
                    return;
                }
                cb(LogCallbackParams {
                    level,
                    message: build_message(args),
                    args: args.iter().map(LogArgument::to_callback_value).collect(),
                    logger_type: instance.name().to_owned(),
                });
            }) as SharedLogHandler
        });
        *logger.inner.user_log_handler.write().unwrap() = handler;
    });
}
