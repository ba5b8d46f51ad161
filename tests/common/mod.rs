//! Mock workers for integration tests
//!
//! Each worker is a POSIX sh script run as `sh <script>`, so the tests need
//! nothing beyond `sh` and `sed`. Requests arrive as
//! `{"jsonrpc":"2.0","method":M,"params":P,"id":N}` with `id` last, which
//! is what the sed expressions below rely on.

#![allow(dead_code)]

use agentlink::ClientOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shell helpers shared by every mock worker
pub const PRELUDE: &str = r#"
method_of() { printf '%s' "$1" | sed -n 's/^{"jsonrpc":"2.0","method":"\([^"]*\)".*/\1/p'; }
id_of() { printf '%s' "$1" | sed -n 's/.*"id":\([0-9][0-9]*\)}$/\1/p'; }
params_of() { printf '%s' "$1" | sed -n 's/.*"params":\(.*\),"id":[0-9]*}$/\1/p'; }
note_params_of() { printf '%s' "$1" | sed -n 's/.*"params":\(.*\)}$/\1/p'; }
ready() { printf '%s\n' '{"jsonrpc":"2.0","method":"agent.ready","params":{"status":"ready"}}'; }
"#;

/// A well-behaved worker with a handful of methods
///
/// - `ping` → "pong"
/// - `echo` → its params
/// - `fail` → error response, code -32000
/// - `slow_echo` → never answers
/// - `crash` → exits with code 1
/// - `noisy_ping` → junk, stale ids and a null id, then "pong"
/// - `progress_call` → three `progress` notifications, then "done"
/// - `explode` → `agent.error` notification, then an error response
/// - notification `say` → notification `said` with the same params
///
/// Every received method is appended to `$MOCK_LOG` when it is set.
pub const MOCK_WORKER: &str = r#"
echo "mock worker starting" >&2
ready
while IFS= read -r line; do
  method=$(method_of "$line")
  id=$(id_of "$line")
  if [ -n "$MOCK_LOG" ]; then printf '%s\n' "$method" >> "$MOCK_LOG"; fi
  case "$method" in
    ping)
      printf '{"jsonrpc":"2.0","result":"pong","id":%s}\n' "$id" ;;
    echo)
      printf '{"jsonrpc":"2.0","result":%s,"id":%s}\n' "$(params_of "$line")" "$id" ;;
    fail)
      printf '{"jsonrpc":"2.0","result":null,"error":{"code":-32000,"message":"Execution failed: fail"},"id":%s}\n' "$id" ;;
    slow_echo)
      : ;;
    crash)
      exit 1 ;;
    noisy_ping)
      printf '%s\n' 'warning: something unexpected'
      printf '%s\n' '{"jsonrpc":"2.0","result":"stale","id":9999}'
      printf '%s\n' '{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"},"id":null}'
      printf '{"jsonrpc":"2.0","result":"pong","id":%s}\n' "$id" ;;
    progress_call)
      for pct in 10 50 100; do
        printf '{"jsonrpc":"2.0","method":"progress","params":{"pct":%s}}\n' "$pct"
      done
      printf '{"jsonrpc":"2.0","result":"done","id":%s}\n' "$id" ;;
    explode)
      printf '%s\n' '{"jsonrpc":"2.0","method":"agent.error","params":{"error":"boom","traceback":"Traceback ..."}}'
      printf '{"jsonrpc":"2.0","result":null,"error":{"code":-32000,"message":"boom"},"id":%s}\n' "$id" ;;
    say)
      printf '{"jsonrpc":"2.0","method":"said","params":%s}\n' "$(note_params_of "$line")" ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","result":null,"error":{"code":-32601,"message":"Method not found: %s"},"id":%s}\n' "$method" "$id"
      fi ;;
  esac
done
"#;

/// Write `body` (with the prelude) into `dir/name`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{}{}", PRELUDE, body)).unwrap();
    path
}

/// Options for running `script` through sh with test-friendly timeouts
pub fn sh_options(script: &Path) -> ClientOptions {
    ClientOptions::interpreter("sh", script)
        .with_startup_timeout(Duration::from_secs(5))
        .with_call_timeout(Duration::from_secs(5))
        .with_ping_timeout(Duration::from_secs(2))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// A temp dir holding the standard mock worker
pub fn mock_worker() -> (tempfile::TempDir, ClientOptions) {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "worker.sh", MOCK_WORKER);
    let options = sh_options(&script);
    (dir, options)
}
