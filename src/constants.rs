pub const LOG_MARKER: &str = "__PLAYGROUND_LOG__=";
pub const UNSERIALIZABLE_PLACEHOLDER: &str = "[unserializable]";
pub const OVERSIZED_LINE_PLACEHOLDER: &str = "[log line too long]";

pub const HARNESS_FILE_NAME: &str = "harness.cjs";
pub const SCRIPT_FILE_NAME: &str = "script.js";
pub const WORK_DIR_NAME: &str = "work";
pub const HOME_DIR_NAME: &str = "home";

/// Exit code the harness uses when it cannot even load the script.
pub const HARNESS_FAILURE_EXIT_CODE: i32 = 70;

pub const MAX_LOG_LINE_BYTES: usize = 256 * 1024;
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;
pub const MONITOR_INTERVAL_MS: u64 = 250;
pub const READER_DRAIN_TIMEOUT_MS: u64 = 1000;

pub const SCOPE_UNIT_PREFIX: &str = "playground-run-";

pub const ARTIFACTS_ROUTE_PREFIX: &str = "/artifacts";
