use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "reelqueue";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Targets the file sink always records at debug, so queue waits and retry
/// backoffs are on disk even when the console runs at info.
const FILE_DEBUG_TARGETS: [&str; 3] = [
    "reelqueue_core::queue",
    "reelqueue_core::retry",
    "reelqueue_core::submission",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn retention_files(&self) -> usize {
        match self {
            Self::Ready(plan) => plan.retention_files,
            Self::Fallback(plan) => plan.retention_files,
        }
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

impl<W: Write> RedactingWriter<W> {
    fn flush_complete_lines(&mut self) -> io::Result<()> {
        while let Some(newline_index) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_index).collect();
            self.write_redacted_bytes(&line)?;
        }
        Ok(())
    }

    fn flush_all_pending(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let chunk: Vec<u8> = self.pending.drain(..).collect();
            self.write_redacted_bytes(&chunk)?;
        }
        Ok(())
    }

    fn write_redacted_bytes(&mut self, chunk: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        let redacted = redact_sensitive_text(text.as_ref());
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.flush_complete_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all_pending()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_all_pending();
        let _ = self.inner.flush();
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let should_include_noise = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;

    let console_filter = merge_noise_filter(
        options.noise_filter.as_str(),
        user_filter.as_str(),
        should_include_noise,
    );
    let file_filter = if should_include_noise {
        let file_noise_filter = rewrite_noise_filter_for_file(options.noise_filter.as_str());
        merge_noise_filter(file_noise_filter.as_str(), user_filter.as_str(), true)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        file_filter,
        console_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise_filter: bool) -> String {
    if include_noise_filter && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(target, _)| target);
            !FILE_DEBUG_TARGETS.contains(&target.trim())
        })
        .map(str::to_string)
        .collect();

    directives.extend(FILE_DEBUG_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

pub fn redact_sensitive_text(input: &str) -> String {
    let with_redacted_userinfo = redact_url_credentials(input);
    let with_redacted_assignments = redact_sensitive_assignments(with_redacted_userinfo.as_str());
    redact_bearer_values(with_redacted_assignments.as_str())
}

fn redact_url_credentials(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(scheme_offset) = input[cursor..].find("://") {
        let scheme_separator = cursor + scheme_offset;
        let authority_start = scheme_separator + 3;
        let authority_end = input[authority_start..]
            .find(|ch: char| {
                matches!(
                    ch,
                    '/' | '?' | '#' | ' ' | '\t' | '\r' | '\n' | '"' | '\'' | '<' | '>'
                )
            })
            .map(|offset| authority_start + offset)
            .unwrap_or(input.len());

        if let Some(userinfo_offset) = input[authority_start..authority_end].rfind('@') {
            let userinfo_end = authority_start + userinfo_offset;
            if userinfo_end > authority_start {
                output.push_str(&input[cursor..authority_start]);
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&input[userinfo_end..authority_end]);
                cursor = authority_end;
                continue;
            }
        }

        output.push_str(&input[cursor..authority_end]);
        cursor = authority_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn redact_sensitive_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0usize;
    let mut index = 0usize;

    while index < bytes.len() {
        let separator = bytes[index];
        if separator == b'=' || separator == b':' {
            let mut key_start = index;
            while key_start > 0 {
                let previous = bytes[key_start - 1];
                if previous.is_ascii_alphanumeric() || previous == b'_' || previous == b'-' {
                    key_start -= 1;
                } else {
                    break;
                }
            }

            if key_start < index {
                let key = input[key_start..index].to_ascii_lowercase();
                if is_sensitive_key(key.as_str()) {
                    let mut value_start = index + 1;
                    while value_start < bytes.len() && bytes[value_start].is_ascii_whitespace() {
                        value_start += 1;
                    }

                    if value_start < bytes.len() {
                        let mut redact_start = value_start;
                        if input[value_start..]
                            .get(..7)
                            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
                        {
                            redact_start = value_start + 7;
                        }

                        if redact_start >= bytes.len() {
                            index += 1;
                            continue;
                        }

                        let (prefix_end, value_end) =
                            if bytes[redact_start] == b'\'' || bytes[redact_start] == b'"' {
                                let quote = bytes[redact_start];
                                let value_content_start = redact_start + 1;
                                let quote_end = input[value_content_start..]
                                    .find(quote as char)
                                    .map(|offset| value_content_start + offset)
                                    .unwrap_or(input.len());
                                (value_content_start, quote_end)
                            } else {
                                (
                                    redact_start,
                                    find_unquoted_value_end(input, bytes, redact_start),
                                )
                            };

                        if value_end > prefix_end {
                            output.push_str(&input[cursor..prefix_end]);
                            output.push_str(REDACTION_PLACEHOLDER);
                            cursor = value_end;
                            index = value_end;
                            continue;
                        }
                    }
                }
            }
        }

        index += 1;
    }

    output.push_str(&input[cursor..]);
    output
}

fn find_unquoted_value_end(input: &str, bytes: &[u8], start: usize) -> usize {
    let mut index = start;
    while index < bytes.len() {
        let current = bytes[index];
        if current.is_ascii_whitespace()
            || matches!(
                current,
                b'&' | b',' | b';' | b')' | b']' | b'}' | b'"' | b'\''
            )
        {
            break;
        }
        index += 1;
    }

    if index == start {
        input.len()
    } else {
        index
    }
}

fn is_sensitive_key(key: &str) -> bool {
    if key == "key" || key == "pwd" || key == "passwd" || key == "authorization" {
        return true;
    }

    if key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.contains("signature")
        || key.contains("credential")
    {
        return true;
    }

    key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("api_key")
        || key.ends_with("api-key")
        || key.ends_with("apikey")
}

/// Masks bearer tokens that appear without a recognizable key in front.
fn redact_bearer_values(input: &str) -> String {
    const BEARER: &str = "bearer ";
    let lowered = input.to_ascii_lowercase();
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(offset) = lowered[cursor..].find(BEARER) {
        let value_start = cursor + offset + BEARER.len();
        let has_value = bytes.get(value_start).is_some_and(|byte| {
            byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'+' | b'/' | b'*')
        });
        let value_end = if has_value {
            find_unquoted_value_end(input, bytes, value_start)
        } else {
            value_start
        };
        output.push_str(&input[cursor..value_start]);
        if input[value_start..value_end].starts_with(REDACTION_PLACEHOLDER) {
            output.push_str(&input[value_start..value_end]);
        } else if value_end > value_start {
            output.push_str(REDACTION_PLACEHOLDER);
        }
        cursor = value_end;
    }

    output.push_str(&input[cursor..]);
    output
}
