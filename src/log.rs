use std::fmt;

#[derive(PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 0,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LogLevel::Error => write!(f, "E"),
            LogLevel::Info => write!(f, "I"),
            LogLevel::Debug => write!(f, "D"),
            LogLevel::Trace => write!(f, "T"),
        }
    }
}

static mut LEVEL: LogLevel = LogLevel::Info;

pub fn log_init(level: LogLevel) {
    unsafe {
        LEVEL = level;
    }
}

pub fn enabled(level: LogLevel) -> bool {
    unsafe { level <= LEVEL }
}

#[macro_export]
macro_rules! log(
    ($level:expr, $fmt:expr) => {
        log!($level, $fmt,)
    };

    ($level:expr, $fmt:expr, $($arg:tt)*) => {
        {
        #[allow(unused_imports)]
        {
            use std::io::Write;
            use chrono::Local;
            if $crate::log::enabled($level) {
                let mut msg = Vec::with_capacity(25);
                let time = Local::now();
                write!(&mut msg, "{} [{}:{}] {}: ",
                       time.format("%x %X"), module_path!(), line!(), $level).ok();
                write!(&mut msg, $fmt, $($arg)*).ok();
                writeln!(&mut msg).ok();
                let stderr = ::std::io::stderr();
                let mut handle = stderr.lock();
                handle.write_all(&msg).ok();
            }
        }
        }
    };
);

#[macro_export]
macro_rules! trace(
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            log!($crate::log::LogLevel::Trace, $($arg)*)
        }
    };
);

#[macro_export]
macro_rules! debug(
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*)
    };
);

#[macro_export]
macro_rules! info(
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*)
    };
);

#[macro_export]
macro_rules! error(
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*)
    };
);
