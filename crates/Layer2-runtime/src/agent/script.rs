//! In-container shell scripts for agent bootstrap and teardown

use devyard_foundation::{Error, Result};
use std::collections::BTreeMap;

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|e| Error::Validation(format!("cannot quote {:?}: {}", value, e)))
}

/// PID file path for one agent
pub fn pid_file(pid_dir: &str, agent_id: &str) -> String {
    format!("{}/{}.pid", pid_dir.trim_end_matches('/'), agent_id)
}

/// Companion file holding the pid of the agent command itself
pub fn child_pid_file(pid_file: &str) -> String {
    format!("{}.child", pid_file)
}

/// Bootstrap: export env, cd, record pids, then run the command in the
/// background and wait on it
///
/// TERM and INT are forwarded to the command with the `kill` builtin, so a
/// stop works in containers without procps. `command` is inserted as shell
/// text (`"aider --yes"` works); each of `args` is quoted as a single word.
pub fn bootstrap(
    pid_file: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    working_dir: Option<&str>,
) -> Result<String> {
    let mut script = String::from("set -e\n");

    for (key, value) in env {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Validation(format!("invalid environment variable name: {:?}", key)));
        }
        script.push_str(&format!("export {}={}\n", key, quote(value)?));
    }

    if let Some(dir) = working_dir {
        script.push_str(&format!("cd {}\n", quote(dir)?));
    }

    let child_file = quote(&child_pid_file(pid_file))?;
    let pid_file = quote(pid_file)?;
    let cleanup = format!("rm -f {} {}", pid_file, child_file).replace('\'', "'\\''");
    script.push_str(&format!("mkdir -p \"$(dirname {})\"\n", pid_file));
    script.push_str(&format!("echo $$ > {}\n", pid_file));
    script.push_str(&format!("trap '{}' EXIT\n", cleanup));
    script.push_str("child=\n");
    script.push_str("trap '[ -n \"$child\" ] && kill -TERM \"$child\" 2>/dev/null' TERM\n");
    script.push_str("trap '[ -n \"$child\" ] && kill -INT \"$child\" 2>/dev/null' INT\n");
    script.push_str("set +e\n");

    // The command is shell text; only the extra args are quoted
    let mut line = command.trim().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg)?);
    }
    script.push_str("{\n");
    script.push_str(&line);
    script.push_str("\n} &\n");
    script.push_str("child=$!\n");
    script.push_str(&format!("echo \"$child\" > {}\n", child_file));

    // A trapped signal interrupts `wait`; keep waiting until the command is reaped
    script.push_str("wait \"$child\"\n");
    script.push_str("status=$?\n");
    script.push_str("while kill -0 \"$child\" 2>/dev/null; do\n");
    script.push_str("  wait \"$child\"\n");
    script.push_str("  status=$?\n");
    script.push_str("done\n");
    script.push_str("exit \"$status\"\n");
    Ok(script)
}

/// Kill: no-op without a PID file, TERM the wrapper and every descendant,
/// wait `grace_secs`, then KILL whatever is left
///
/// Descendants are found through `/proc` with shell builtins only, so no
/// procps is needed inside the container. The tree is collected before the
/// first signal so orphans reparented to init are still reached.
pub fn kill(pid_file: &str, grace_secs: u64) -> Result<String> {
    let child_file = quote(&child_pid_file(pid_file))?;
    let pid_file = quote(pid_file)?;
    Ok(format!(
        "[ -f {pid_file} ] || exit 0\n\
         pid=\n\
         child=\n\
         read -r pid < {pid_file}\n\
         [ -f {child_file} ] && read -r child < {child_file}\n\
         [ -n \"$pid\" ] || exit 0\n\
         children() {{\n\
         \x20 for s in /proc/[0-9]*/status; do\n\
         \x20   pp=\n\
         \x20   while read -r k v; do\n\
         \x20     case \"$k\" in PPid:) pp=$v; break ;; esac\n\
         \x20   done 2>/dev/null < \"$s\"\n\
         \x20   if [ \"$pp\" = \"$1\" ]; then\n\
         \x20     p=${{s#/proc/}}\n\
         \x20     p=${{p%/status}}\n\
         \x20     echo \"$p\"\n\
         \x20     children \"$p\"\n\
         \x20   fi\n\
         \x20 done\n\
         }}\n\
         tree=\"$child $(children \"$pid\")\"\n\
         for p in $tree $pid; do kill -TERM \"$p\" 2>/dev/null; done\n\
         sleep {grace_secs}\n\
         for p in $tree $pid; do\n\
         \x20 kill -0 \"$p\" 2>/dev/null && kill -KILL \"$p\" 2>/dev/null\n\
         done\n\
         rm -f {pid_file} {child_file}\n\
         exit 0\n"
    ))
}
