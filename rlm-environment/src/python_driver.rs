//! The Python driver script run by [`crate::subprocess::SubprocessEnvironment`]
//! and [`crate::container::ContainerEnvironment`].
//!
//! Grounded on `original_source/rlm/environments/local_repl.py::SocketREPL`:
//! the original's in-process `exec()` against a persistent namespace, with
//! `llm_query`/`llm_query_batched` implemented as raw sockets speaking the
//! Router's length-prefixed JSON protocol (`spec.md` §6) so the sandboxed
//! process never embeds a provider SDK. One process is spawned per call;
//! the namespace is restored from, and persisted back to, a JSON state
//! file (`spec.md` §6's "Persisted state").
//!
//! Kept as a single embedded script (rather than a packaged Python module)
//! because it has no dependency of its own beyond the standard library,
//! matching `kowalski-rlm/src/repl_executor.rs`'s one-temp-file-per-call
//! idiom.

use rlm_core::types::LOCALS_SNAPSHOT_VALUE_CAP;

/// Returns the driver script with the locals-snapshot truncation cap
/// substituted in, keeping the single source of truth in `rlm-core`.
pub fn render() -> String {
    SCRIPT_TEMPLATE.replace("__LOCALS_CAP__", &LOCALS_SNAPSHOT_VALUE_CAP.to_string())
}

const SCRIPT_TEMPLATE: &str = r#"
import sys
import io
import json
import socket
import struct
import traceback
import contextlib

CODE_FILE, STATE_FILE, RESULT_FILE, ROUTER_ADDR, DEPTH = sys.argv[1:6]
DEPTH = int(DEPTH)
LOCALS_CAP = __LOCALS_CAP__
llm_calls = []


def _router_host_port():
    host, _, port = ROUTER_ADDR.rpartition(":")
    return host, int(port)


def _router_roundtrip(payload):
    host, port = _router_host_port()
    with socket.create_connection((host, port), timeout=300) as sock:
        body = json.dumps(payload).encode("utf-8")
        sock.sendall(struct.pack(">I", len(body)) + body)
        header = _recv_exact(sock, 4)
        (length,) = struct.unpack(">I", header)
        body = _recv_exact(sock, length)
        return json.loads(body.decode("utf-8"))


def _recv_exact(sock, n):
    buf = b""
    while len(buf) < n:
        chunk = sock.recv(n - len(buf))
        if not chunk:
            raise ConnectionError("router closed connection mid-message")
        buf += chunk
    return buf


def llm_query(prompt, image_paths=None, model=None):
    request = {"prompt": prompt, "depth": DEPTH}
    if model:
        request["model"] = model
    response = _router_roundtrip(request)
    completion = response.get("chat_completion") or {}
    llm_calls.append(completion)
    if not response.get("success"):
        return "[error] " + str(response.get("error"))
    return completion.get("response", "")


def llm_query_batched(prompts, image_path_lists=None, model=None):
    if not prompts:
        return []
    request = {"prompts": list(prompts), "depth": DEPTH}
    if model:
        request["model"] = model
    response = _router_roundtrip(request)
    completions = response.get("chat_completions") or []
    llm_calls.extend(completions)
    if not response.get("success"):
        return ["[error] " + str(response.get("error"))] * len(prompts)
    return [c.get("response", "") for c in completions]


def FINAL_VAR(name):
    if name in namespace:
        return str(namespace[name])
    available = sorted(k for k in namespace if not k.startswith("_"))
    return "variable '%s' is not bound; available bindings: %s" % (name, available)


try:
    with open(STATE_FILE, "r") as f:
        namespace = json.load(f)
except (FileNotFoundError, json.JSONDecodeError):
    namespace = {}

restricted_builtins = dict(vars(__builtins__) if not isinstance(__builtins__, dict) else __builtins__)
for _forbidden in ("eval", "exec", "input", "compile"):
    restricted_builtins.pop(_forbidden, None)

namespace["__builtins__"] = restricted_builtins
namespace["llm_query"] = llm_query
namespace["llm_query_batched"] = llm_query_batched
namespace["FINAL_VAR"] = FINAL_VAR

if CODE_FILE == "-":
    import base64
    code = base64.b64decode(__import__("os").environ["RLM_CODE_B64"]).decode("utf-8")
else:
    with open(CODE_FILE, "r") as f:
        code = f.read()

stdout_buf = io.StringIO()
stderr_buf = io.StringIO()

with contextlib.redirect_stdout(stdout_buf), contextlib.redirect_stderr(stderr_buf):
    try:
        exec(compile(code, "<repl>", "exec"), namespace)
    except Exception:
        traceback.print_exc(file=stderr_buf)

persisted = {}
for key, value in namespace.items():
    if key.startswith("_") or key in ("llm_query", "llm_query_batched", "FINAL_VAR"):
        continue
    try:
        json.dumps(value)
        persisted[key] = value
    except TypeError:
        continue

with open(STATE_FILE, "w") as f:
    json.dump(persisted, f)

locals_snapshot = {}
for key, value in persisted.items():
    text = repr(value)
    if len(text) > LOCALS_CAP:
        text = text[:LOCALS_CAP] + "... (truncated)"
    locals_snapshot[key] = text

result = {
    "stdout": stdout_buf.getvalue(),
    "stderr": stderr_buf.getvalue(),
    "locals_snapshot": locals_snapshot,
    "llm_calls": llm_calls,
}

with open(RESULT_FILE, "w") as f:
    json.dump(result, f)
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_the_locals_cap() {
        let script = render();
        assert!(!script.contains("__LOCALS_CAP__"));
        assert!(script.contains(&LOCALS_SNAPSHOT_VALUE_CAP.to_string()));
    }
}
