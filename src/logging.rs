//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。日志文件按启动时间命名、按大小滚动，
//! 启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "drive-uploader.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
///
/// 文件名: drive-uploader.YYYY-MM-DD-HHMMSS.log, 滚动后追加 _N
struct RollingFile {
    start_timestamp: String,
    log_dir: PathBuf,
    current: File,
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let current = Self::open_file(&log_dir, &start_timestamp, 0)?;
        Ok(Self {
            start_timestamp,
            log_dir,
            current,
            index: 0,
            max_file_size: max_file_size.max(1),
            written: 0,
        })
    }

    fn file_path(log_dir: &Path, timestamp: &str, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, timestamp, LOG_FILE_SUFFIX)
        } else {
            format!("{}{}_{}{}", LOG_FILE_PREFIX, timestamp, index, LOG_FILE_SUFFIX)
        };
        log_dir.join(name)
    }

    fn open_file(log_dir: &Path, timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(log_dir, timestamp, index))
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.current.flush()?;
            self.index += 1;
            self.current = Self::open_file(&self.log_dir, &self.start_timestamp, self.index)?;
            self.written = 0;
        }

        let n = self.current.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 线程安全的日志写入器，交给 tracing-appender 的后台线程使用
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().current.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 文件输出初始化失败时回退到仅控制台输出；重复初始化会被忽略
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        open_file_writer(config)
    } else {
        None
    };

    let (file_layer, file_guard) = match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let file_enabled = file_layer.is_some();
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return LogGuard { _file_guard: None };
    }

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
        if removed > 0 {
            info!("已清理 {} 个过期日志文件", removed);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_file_writer(config: &LogConfig) -> Option<LogFileWriter> {
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }

    match LogFileWriter::new(config.log_dir.clone(), config.max_file_size) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let retention = chrono::Duration::days(retention_days as i64);
    let mut deleted = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };

        if today.signed_duration_since(date) <= retention {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }

    deleted
}

/// 从日志文件名中提取日期
///
/// drive-uploader.YYYY-MM-DD-HHMMSS.log / drive-uploader.YYYY-MM-DD-HHMMSS_N.log
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = name.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
