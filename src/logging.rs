//! 日志初始化.
//!
//! 库 crate 通过 `log` 门面输出日志, 由 tracing-subscriber 的 `tracing-log` 桥接收集.
//! 控制台与文件两个输出层各自使用 [`EnvFilter`] 过滤, 文件层按天滚动并在后台线程写入.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::NormalizeEvent;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter 语法, 如 `info,liu_format=debug`
    pub level: String,
    /// 日志目录, 为空时不写文件
    pub directory: Option<String>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 是否输出到控制台
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
            file_prefix: "liu".into(),
            console: true,
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// 安装全局日志订阅器, 进程内只能成功调用一次
pub fn init(config: &LoggingConfig) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        bail!("日志系统已初始化");
    }
    let result = install(config);
    if result.is_err() {
        INITIALIZED.store(false, Ordering::Release);
    }
    result
}

/// 日志系统是否已初始化
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("日志级别非法: {level}"))
}

fn install(config: &LoggingConfig) -> Result<()> {
    let console_layer = if config.console {
        Some(
            fmt::Layer::default()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .event_format(LineFormatter { ansi: true })
                .with_filter(build_filter(&config.level)?),
        )
    } else {
        None
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("创建日志目录失败, path={directory}"))?;
            let appender =
                tracing_appender::rolling::daily(directory, format!("{}.log", config.file_prefix));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            LOG_GUARD
                .set(guard)
                .map_err(|_| anyhow!("日志写入线程已存在"))?;
            Some(
                fmt::Layer::default()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(LineFormatter { ansi: false })
                    .with_filter(build_filter(&config.level)?),
            )
        }
        None => None,
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("安装全局日志订阅器失败")
}

/// 单行日志格式: `[MM-DD hh:mm:ss.mmm] LEVEL file:line > 字段`
struct LineFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        // log 桥接的事件把来源放在 log.file / log.line 字段中, 需要还原
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        write!(
            writer,
            "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] ",
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis()
        )?;
        let level = meta.level().to_string();
        if self.ansi {
            let color = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                _ => "\x1b[34m",
            };
            write!(writer, "{color}{level:5}\x1b[0m ")?;
        } else {
            write!(writer, "{level:5} ")?;
        }
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            write!(writer, "{file}:{line} ")?;
        }
        write!(writer, "> ")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// 测试用共享输出
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_logging_log_事件保留来源位置() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = Registry::default().with(
            fmt::Layer::default()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .event_format(LineFormatter { ansi: false }),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing_log::format_trace(
                &log::Record::builder()
                    .args(format_args!("重排窗口已满"))
                    .level(log::Level::Warn)
                    .target("liu_format::writer")
                    .file(Some("crates/liu-format/src/writer.rs"))
                    .line(Some(42))
                    .build(),
            )
            .unwrap();
        });
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("WARN "), "{text}");
        assert!(text.contains("crates/liu-format/src/writer.rs:42 "), "{text}");
        assert!(text.contains("重排窗口已满"), "{text}");
    }

    #[test]
    fn test_logging_配置默认值() {
        let config: LoggingConfig = serde_json::from_str(r#"{"level": "debug"}"#).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.directory, None);
        assert_eq!(config.file_prefix, "liu");
        assert!(config.console);
    }

    #[test]
    fn test_logging_过滤规则() {
        assert!(build_filter("info,liu_format=debug").is_ok());
    }

    #[test]
    fn test_logging_重复初始化报错() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().display().to_string()),
            console: false,
            ..LoggingConfig::default()
        };
        init(&config).unwrap();
        assert!(is_initialized());
        log::info!("日志系统测试");
        let err = init(&config).unwrap_err();
        assert!(err.to_string().contains("已初始化"));
    }
}
