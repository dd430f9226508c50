use std::io::Write;

/// verbosity 的合法范围，超出会被 clamp
pub const MIN_VERBOSITY: i32 = -9;
pub const MAX_VERBOSITY: i32 = 9;

/// 日志配置
///
/// 编辑器 C 接口和 app 的启动参数都会落到这里。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// 全局 verbosity，范围 [-9, 9]
    pub verbosity: i32,
    /// 是否输出 ANSI 颜色
    pub colored: bool,
    /// 按模块覆盖 verbosity：(模块路径前缀, verbosity)
    pub vmodule: Vec<(String, i32)>,
}

/// 初始化的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogInit {
    /// 首次安装 logger
    Installed,
    /// logger 已经存在，只更新了全局 max level
    Reconfigured,
}

impl LogConfig {
    pub fn new(verbosity: i32, colored: bool) -> Self {
        Self {
            verbosity,
            colored,
            vmodule: Vec::new(),
        }
    }

    /// 解析 `"pattern=level,pattern=level"` 形式的 vmodule 字符串
    ///
    /// 空段会被跳过；无法解析的段返回 Err，携带出错的那一段。
    pub fn with_vmodule(mut self, patterns: &str) -> Result<Self, String> {
        self.vmodule = parse_vmodule(patterns)?;
        Ok(self)
    }
}

/// 把 verbosity 映射到 log 的级别
///
/// `<= -2` Error，`-1` Warn，`0` Info，`1..=2` Debug，`>= 3` Trace
pub fn verbosity_to_level(verbosity: i32) -> log::LevelFilter {
    match verbosity.clamp(MIN_VERBOSITY, MAX_VERBOSITY) {
        i32::MIN..=-2 => log::LevelFilter::Error,
        -1 => log::LevelFilter::Warn,
        0 => log::LevelFilter::Info,
        1..=2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

pub fn parse_vmodule(patterns: &str) -> Result<Vec<(String, i32)>, String> {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (pattern, level) = entry.split_once('=').ok_or_else(|| entry.to_string())?;
            let pattern = pattern.trim().trim_end_matches('*').trim_end_matches("::");
            if pattern.is_empty() {
                return Err(entry.to_string());
            }
            let level = level.trim().parse::<i32>().map_err(|_| entry.to_string())?;
            Ok((pattern.replace('-', "_"), level))
        })
        .collect()
}

/// 使用默认配置初始化日志：Info 级别，带颜色
pub fn init_log() {
    init_log_with(&LogConfig::new(0, true));
}

/// 按配置初始化日志
///
/// env_logger 安装之后过滤规则不可变，再次调用时只能调整全局 max level。
pub fn init_log_with(config: &LogConfig) -> LogInit {
    let clamped = config.verbosity.clamp(MIN_VERBOSITY, MAX_VERBOSITY);
    let level = verbosity_to_level(clamped);

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let info_style = buf
                .default_level_style(log::Level::Info)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green)));
            let warn_style = buf
                .default_level_style(log::Level::Warn)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow)));
            let error_style = buf
                .default_level_style(log::Level::Error)
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red)));

            let level_style = match record.level() {
                log::Level::Info => info_style,
                log::Level::Warn => warn_style,
                log::Level::Error => error_style,
                _ => buf.default_level_style(record.level()),
            };
            let grey_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let line = record.line().unwrap_or(!0);
            let file = record.file().unwrap_or("").split(['\\', '/']).next_back().unwrap_or("");
            let time = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
            let level = record.level();
            let module = record.module_path().unwrap_or("");

            writeln!(
                buf,
                "{level_style}[{time}] {level}: {}{level_style:#}\n\t {grey_style}In {module} At {file}:{line}{grey_style:#}",
                record.args()
            )
        })
        .filter(None, level);

    // vmodule 规则可能比全局更详细，max level 取所有规则中最大的
    let mut max_level = level;
    for (pattern, verbosity) in &config.vmodule {
        let module_level = verbosity_to_level(*verbosity);
        builder.filter(Some(pattern), module_level);
        max_level = max_level.max(module_level);
    }

    if !config.colored {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    let result = match builder.try_init() {
        Ok(()) => LogInit::Installed,
        Err(_) => {
            log::set_max_level(max_level);
            LogInit::Reconfigured
        }
    };

    if clamped != config.verbosity {
        log::warn!("verbosity {} out of range, clamped to {}", config.verbosity, clamped);
    }

    result
}
