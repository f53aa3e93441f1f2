//! Drives an `R` process over its standard streams.
//!
//! R runs with `--vanilla --slave` and reads commands from stdin. A small
//! prelude defines helpers that evaluate inside `tryCatch` and print the
//! result on stdout as tagged lines:
//!
//! ```text
//! \x01DBL 3        header: type tag and element count
//! 1.5              one element per line
//! NA
//! Inf
//! \x01END
//! ```
//!
//! Errors come back as a single `\x01ERR <message>` line and completed
//! assignments as `\x01OK`. Anything else on stdout is console output and
//! is passed on to the log.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::Context;
use rsession_core::ipc::{Interpreter, InterpreterError, quote};
use rsession_core::{EngineInstallation, Value};

const TAG: char = '\u{1}';

const PRELUDE: &str = r#"
.rs_escape <- function(x) {
  x <- gsub("\\", "\\\\", x, fixed = TRUE)
  x <- gsub("\r", "\\r", x, fixed = TRUE)
  gsub("\n", "\\n", x, fixed = TRUE)
}
.rs_lines <- function(tag, v) {
  cat("\001", tag, " ", length(v), "\n", sep = "")
  if (length(v) > 0L) cat(paste0(v, "\n"), sep = "")
}
.rs_emit <- function(x) {
  if (is.list(x)) x <- unlist(x, use.names = FALSE)
  if (is.null(x) || length(x) == 0L) {
    .rs_lines("NULL", character(0))
  } else if (is.logical(x)) {
    .rs_lines("LGL", ifelse(is.na(x), "NA", ifelse(x, "TRUE", "FALSE")))
  } else if (is.integer(x) && !is.factor(x)) {
    .rs_lines("INT", ifelse(is.na(x), "NA", as.character(x)))
  } else if (is.numeric(x)) {
    .rs_lines("DBL", ifelse(is.na(x) & !is.nan(x), "NA", formatC(x, digits = 17, format = "g")))
  } else {
    x <- as.character(x)
    .rs_lines("STR", ifelse(is.na(x), "NA", .rs_escape(x)))
  }
  cat("\001END\n")
}
.rs_fail <- function(e) {
  cat("\001ERR ", .rs_escape(conditionMessage(e)), "\n", sep = "")
}
.rs_eval <- function(code) {
  r <- tryCatch(list(ok = TRUE, v = eval(parse(text = code), envir = .GlobalEnv)),
                error = function(e) list(ok = FALSE, e = e))
  if (r$ok) .rs_emit(r$v) else .rs_fail(r$e)
  flush.console(); flush(stdout())
  invisible(NULL)
}
.rs_collect <- function(name) {
  r <- tryCatch(list(ok = TRUE, v = get(name, envir = .GlobalEnv)),
                error = function(e) list(ok = FALSE, e = e))
  if (r$ok) .rs_emit(r$v) else .rs_fail(r$e)
  flush.console(); flush(stdout())
  invisible(NULL)
}
.rs_assign <- function(name, value) {
  r <- tryCatch({ assign(name, value, envir = .GlobalEnv); NULL },
                error = function(e) e)
  if (is.null(r)) cat("\001OK\n") else .rs_fail(r)
  flush.console(); flush(stdout())
  invisible(NULL)
}
"#;

/// One R process.
pub struct RBridge {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl RBridge {
    /// Start R from the installation at `home` and load the prelude.
    pub fn start(home: &Path) -> anyhow::Result<Self> {
        let installation = EngineInstallation::from_home(home);
        let mut child = Command::new(&installation.executable)
            .args(["--vanilla", "--slave", "--no-save"])
            .env("R_HOME", home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start '{}'", installation.executable.display()))?;

        let stdin = child.stdin.take().context("R stdin unavailable")?;
        let stdout = child.stdout.take().context("R stdout unavailable")?;
        let mut bridge = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        };

        bridge.send(PRELUDE).context("failed to load the R prelude")?;
        match bridge.eval("TRUE") {
            Ok(Value::Logical(true)) => {}
            other => anyhow::bail!("R did not answer the startup probe: {:?}", other),
        }
        tracing::info!("R started with pid {}", bridge.child.id());
        Ok(bridge)
    }

    fn send(&mut self, command: &str) -> std::io::Result<()> {
        self.stdin.write_all(command.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    /// Send a helper call and parse the tagged reply.
    fn exchange(&mut self, command: &str) -> Result<Reply, InterpreterError> {
        self.send(command).map_err(lost)?;

        let line = self.read_header()?;
        let Some((tag, rest)) = parse_header(&line) else {
            return Err(InterpreterError::Lost(format!("malformed reply '{}'", line)));
        };
        match tag {
            "OK" => Ok(Reply::Done),
            "ERR" => Err(InterpreterError::Raised(unescape(rest))),
            _ => {
                let count: usize = rest.trim().parse().map_err(|_| {
                    InterpreterError::Lost(format!("malformed reply header '{}'", line))
                })?;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.read_line()?);
                }
                let end = self.read_line()?;
                if parse_header(&end).map(|(tag, _)| tag) != Some("END") {
                    return Err(InterpreterError::Lost(format!(
                        "reply not terminated: '{}'",
                        end
                    )));
                }
                decode(tag, &elements).map(Reply::Value)
            }
        }
    }

    /// Next raw line of R's stdout.
    fn read_line(&mut self) -> Result<String, InterpreterError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).map_err(lost)?;
        if read == 0 {
            return Err(InterpreterError::Lost("R exited".to_string()));
        }
        line.truncate(line.trim_end_matches(['\n', '\r']).len());
        Ok(line)
    }

    /// Next tagged line, logging console output that precedes it.
    fn read_header(&mut self) -> Result<String, InterpreterError> {
        loop {
            let line = self.read_line()?;
            match line.find(TAG) {
                Some(pos) => {
                    if pos > 0 {
                        tracing::info!("{}", &line[..pos]);
                    }
                    return Ok(line[pos..].to_string());
                }
                None => tracing::info!("{}", line),
            }
        }
    }
}

enum Reply {
    Done,
    Value(Value),
}

fn lost(e: std::io::Error) -> InterpreterError {
    InterpreterError::Lost(e.to_string())
}

/// Split `\x01TAG rest` into `("TAG", "rest")`.
fn parse_header(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix(TAG)?;
    Some(match body.split_once(' ') {
        Some((tag, rest)) => (tag, rest),
        None => (body, ""),
    })
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_double(text: &str) -> Result<f64, InterpreterError> {
    match text {
        "NA" | "NaN" => Ok(f64::NAN),
        "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        other => other
            .trim()
            .parse()
            .map_err(|_| InterpreterError::Lost(format!("not a number: '{}'", other))),
    }
}

fn parse_integer(text: &str) -> Result<i32, InterpreterError> {
    match text {
        // R's integer NA
        "NA" => Ok(i32::MIN),
        other => other
            .trim()
            .parse()
            .map_err(|_| InterpreterError::Lost(format!("not an integer: '{}'", other))),
    }
}

/// Convert tagged element lines into a [`Value`].
fn decode(tag: &str, elements: &[String]) -> Result<Value, InterpreterError> {
    let value = match tag {
        "NULL" => Value::Null,
        "LGL" if elements.len() == 1 => match elements[0].as_str() {
            "TRUE" => Value::Logical(true),
            "FALSE" => Value::Logical(false),
            _ => Value::Null,
        },
        "LGL" => Value::Integers(
            elements
                .iter()
                .map(|e| match e.as_str() {
                    "TRUE" => 1,
                    "FALSE" => 0,
                    _ => i32::MIN,
                })
                .collect(),
        ),
        "INT" => Value::Integers(
            elements
                .iter()
                .map(|e| parse_integer(e))
                .collect::<Result<_, _>>()?,
        ),
        "DBL" => Value::Numeric(
            elements
                .iter()
                .map(|e| parse_double(e))
                .collect::<Result<_, _>>()?,
        ),
        // Character vectors come back newline-joined.
        "STR" => Value::Text(
            elements
                .iter()
                .map(|e| unescape(e))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        other => {
            return Err(InterpreterError::Lost(format!(
                "unknown reply type '{}'",
                other
            )));
        }
    };
    Ok(value.normalized())
}

/// Render a [`Value`] as R source.
pub fn literal(value: &Value) -> String {
    fn double(x: f64) -> String {
        if x.is_nan() {
            "NaN".to_string()
        } else if x.is_infinite() {
            if x > 0.0 { "Inf" } else { "-Inf" }.to_string()
        } else {
            format!("{:?}", x)
        }
    }
    fn integer(i: i32) -> String {
        if i == i32::MIN {
            "NA_integer_".to_string()
        } else {
            format!("{}L", i)
        }
    }

    match value {
        Value::Null => "NULL".to_string(),
        Value::Logical(true) => "TRUE".to_string(),
        Value::Logical(false) => "FALSE".to_string(),
        Value::Integer(i) => integer(*i),
        Value::Integers(v) if v.is_empty() => "integer(0)".to_string(),
        Value::Integers(v) => format!(
            "c({})",
            v.iter().map(|&i| integer(i)).collect::<Vec<_>>().join(", ")
        ),
        Value::Scalar(x) => double(*x),
        Value::Numeric(v) if v.is_empty() => "numeric(0)".to_string(),
        Value::Numeric(v) => format!(
            "c({})",
            v.iter().map(|&x| double(x)).collect::<Vec<_>>().join(", ")
        ),
        Value::Text(s) => quote(s),
    }
}

impl Interpreter for RBridge {
    fn eval(&mut self, code: &str) -> Result<Value, InterpreterError> {
        match self.exchange(&format!(".rs_eval({})", quote(code)))? {
            Reply::Value(value) => Ok(value),
            Reply::Done => Ok(Value::Null),
        }
    }

    fn assign(&mut self, name: &str, value: Value) -> Result<(), InterpreterError> {
        let command = format!(".rs_assign({}, {})", quote(name), literal(&value));
        match self.exchange(&command)? {
            Reply::Done => Ok(()),
            Reply::Value(other) => Err(InterpreterError::Lost(format!(
                "unexpected reply to assignment: {:?}",
                other
            ))),
        }
    }

    fn collect(&mut self, name: &str) -> Result<Value, InterpreterError> {
        match self.exchange(&format!(".rs_collect({})", quote(name)))? {
            Reply::Value(value) => Ok(value),
            Reply::Done => Ok(Value::Null),
        }
    }
}

impl Drop for RBridge {
    fn drop(&mut self) {
        let _ = self.send("quit(save = \"no\")");
        if let Err(e) = self.child.kill() {
            tracing::debug!("R already gone: {}", e);
        }
        let _ = self.child.wait();
    }
}
