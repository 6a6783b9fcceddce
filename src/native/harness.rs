use std::io;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::{
    constants::{HARNESS_FAILURE_EXIT_CODE, LOG_MARKER, UNSERIALIZABLE_PLACEHOLDER},
    core::domain::LogMode,
};

/// Node entry point that loads the user script.
///
/// The script body becomes an async function whose only parameters are
/// `playwright` and `console`; `require`, `module` and friends are not in
/// scope. Every console call is written to stdout as one marked JSON line.
const HARNESS_TEMPLATE: &str = r#"'use strict';
const fs = require('fs');
const util = require('util');

const MARKER = '{{LOG_MARKER}}';
const PLACEHOLDER = '{{PLACEHOLDER}}';
const HARNESS_FAILURE = {{HARNESS_FAILURE}};

function serialize(value) {
  if (typeof value === 'string') {
    return value;
  }
  try {
    return util.inspect(value, { depth: 4, breakLength: Infinity });
  } catch (_) {
    return PLACEHOLDER;
  }
}

function emit(mode, args) {
  let line;
  try {
    line = JSON.stringify({ mode, args: Array.from(args, serialize) });
  } catch (_) {
    line = JSON.stringify({ mode, args: [PLACEHOLDER] });
  }
  process.stdout.write(MARKER + line + '\n');
}

function describe(error) {
  if (error && typeof error.stack === 'string') {
    return error.stack;
  }
  return serialize(error);
}

const sandboxConsole = Object.freeze({
  log: (...args) => emit('log', args),
  info: (...args) => emit('log', args),
  debug: (...args) => emit('log', args),
  dir: (...args) => emit('log', args),
  table: (...args) => emit('log', args),
  warn: (...args) => emit('error', args),
  error: (...args) => emit('error', args),
  trace: (...args) => emit('error', args),
});
globalThis.console = sandboxConsole;

let playwrightModule;
function loadPlaywright() {
  if (playwrightModule === undefined) {
    playwrightModule = require('playwright');
  }
  return playwrightModule;
}

const playwright = new Proxy(Object.create(null), {
  get: (_, key) => loadPlaywright()[key],
  has: (_, key) => key in loadPlaywright(),
});

process.on('unhandledRejection', (reason) => {
  emit('error', ['Unhandled promise rejection: ' + describe(reason)]);
});
process.on('uncaughtException', (error) => {
  emit('error', [describe(error)]);
});

async function main() {
  let source;
  try {
    source = fs.readFileSync(process.argv[2], 'utf8');
  } catch (error) {
    process.stderr.write('harness: cannot read script: ' + describe(error) + '\n');
    return HARNESS_FAILURE;
  }

  const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
  let body;
  try {
    body = new AsyncFunction('playwright', 'console', source);
  } catch (error) {
    emit('error', [describe(error)]);
    return 0;
  }

  try {
    await body(playwright, sandboxConsole);
  } catch (error) {
    emit('error', [describe(error)]);
  }
  return 0;
}

function finish(code) {
  process.stdout.write('', () => process.exit(code));
}

main().then(finish, (error) => {
  process.stderr.write('harness: ' + describe(error) + '\n');
  finish(HARNESS_FAILURE);
});
"#;

pub fn harness_source() -> String {
    HARNESS_TEMPLATE
        .replace("{{LOG_MARKER}}", LOG_MARKER)
        .replace("{{PLACEHOLDER}}", UNSERIALIZABLE_PLACEHOLDER)
        .replace("{{HARNESS_FAILURE}}", &HARNESS_FAILURE_EXIT_CODE.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarnessLine {
    Record { mode: LogMode, args: Vec<Value> },
    /// Output that did not come through the console capability.
    Raw(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireMode {
    Log,
    Error,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    mode: WireMode,
    #[serde(default)]
    args: Vec<Value>,
}

pub fn parse_line(line: &str) -> HarnessLine {
    let Some(payload) = line.strip_prefix(LOG_MARKER) else {
        return HarnessLine::Raw(line.to_string());
    };

    match serde_json::from_str::<WireRecord>(payload) {
        Ok(record) => HarnessLine::Record {
            mode: match record.mode {
                WireMode::Log => LogMode::Log,
                WireMode::Error => LogMode::Error,
            },
            args: record.args,
        },
        Err(err) => {
            tracing::debug!("Malformed harness record: {}", err);
            HarnessLine::Record {
                mode: LogMode::Log,
                args: vec![Value::String(UNSERIALIZABLE_PLACEHOLDER.to_string())],
            }
        }
    }
}

/// Reads one `\n`-terminated line, keeping at most `max` bytes of it.
///
/// Returns `None` at end of input, otherwise whether the line was cut.
/// The rest of an oversized line is consumed and dropped.
pub async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    let mut overflowed = false;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(overflowed));
        }
        read_any = true;

        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(idx) => (&available[..idx], idx + 1, true),
            None => (available, available.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        if chunk.len() > room {
            overflowed = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        reader.consume(used);

        if done {
            return Ok(Some(overflowed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_harness_source_is_filled_in() {
        let source = harness_source();

        assert!(source.contains(LOG_MARKER));
        assert!(source.contains(UNSERIALIZABLE_PLACEHOLDER));
        assert!(source.contains("const HARNESS_FAILURE = 70;"));
        assert!(!source.contains("{{"));
    }

    #[test]
    fn test_parse_marked_line() {
        let line = format!(r#"{LOG_MARKER}{{"mode":"error","args":["b",{{"x":1}}]}}"#);

        assert_eq!(
            parse_line(&line),
            HarnessLine::Record {
                mode: LogMode::Error,
                args: vec![json!("b"), json!({"x": 1})],
            }
        );
    }

    #[test]
    fn test_parse_unmarked_line() {
        assert_eq!(
            parse_line("(node:12) ExperimentalWarning"),
            HarnessLine::Raw("(node:12) ExperimentalWarning".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_record() {
        let line = format!("{LOG_MARKER}{{not json");

        assert_eq!(
            parse_line(&line),
            HarnessLine::Record {
                mode: LogMode::Log,
                args: vec![json!(UNSERIALIZABLE_PLACEHOLDER)],
            }
        );
    }

    #[tokio::test]
    async fn test_read_line_capped() {
        let input: &[u8] = b"short\nthis line is long\nlast";
        let mut reader = BufReader::with_capacity(4, input);
        let mut buf = Vec::new();

        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), Some(false));
        assert_eq!(buf, b"short");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), Some(true));
        assert_eq!(buf, b"this lin");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), Some(false));
        assert_eq!(buf, b"last");

        buf.clear();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), None);
    }
}
