//! Shell scripts run on compute nodes to launch and watch an instance.
//!
//! The launch detaches the executable, writes its pid to [`PID_FILE`] and, once it
//! exits, its exit code to [`EXIT_STATUS_FILE`]. Both files live in the instance
//! directory, so a later process (or a restarted engine) can keep watching it.

use simfleet_core::TemplateKind;
use simfleet_core::layout::{EXIT_STATUS_FILE, LOG_FILE, PID_FILE};

use crate::remote::{last_line, shell_quote};

/// Polls of the pid file before the launch gives up (0.1s apart).
const PID_WAIT_POLLS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LaunchPlan {
    /// Run in the instance directory before the executable is started.
    pub(crate) prepare: Option<String>,
    pub(crate) command: String,
}

pub(crate) fn launch_plan(kind: &TemplateKind, rendered_file: &str, native_command: &str) -> LaunchPlan {
    let file = shell_quote(rendered_file);
    match kind {
        TemplateKind::NativeConfig => LaunchPlan {
            prepare: None,
            command: format!("{native_command} {file}"),
        },
        TemplateKind::Script { .. } => LaunchPlan {
            prepare: Some(format!("chmod +x {file}")),
            command: format!("./{file}"),
        },
    }
}

pub(crate) fn launch_script(job_dir: &str, plan: &LaunchPlan) -> String {
    let mut script = String::new();
    script.push_str("[ -f ~/.bash_profile ] && . ~/.bash_profile\n");
    script.push_str(&format!("cd {} || exit 1\n", shell_quote(job_dir)));
    script.push_str(&format!("rm -f {PID_FILE} {EXIT_STATUS_FILE}\n"));
    if let Some(prepare) = &plan.prepare {
        script.push_str(&format!("{prepare} || exit 1\n"));
    }
    script.push_str(&format!(
        "( {} > {LOG_FILE} 2>&1 & echo $! > {PID_FILE}; wait $!; echo $? > {EXIT_STATUS_FILE} ) > /dev/null 2>&1 < /dev/null &\n",
        plan.command
    ));
    script.push_str(&format!(
        "n=0; while [ ! -s {PID_FILE} ] && [ $n -lt {PID_WAIT_POLLS} ]; do sleep 0.1; n=$((n+1)); done\n"
    ));
    script.push_str(&format!("cat {PID_FILE}\n"));
    script
}

/// Prints `running` while `pid` is a live, non-zombie process, else the exit status (if any).
pub(crate) fn poll_script(job_dir: &str, pid: u32) -> String {
    format!(
        "cd {} || exit 1\n\
         if [ -d /proc/{pid} ] && ! grep -q zombie /proc/{pid}/status 2>/dev/null; then echo running; else cat {EXIT_STATUS_FILE} 2>/dev/null; fi\n",
        shell_quote(job_dir)
    )
}

pub(crate) fn parse_pid(output: &str) -> Option<u32> {
    match last_line(output)?.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(pid) => Some(pid),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollStatus {
    Running,
    /// The process is gone but its exit status is not written yet.
    NotFinished,
    Exited(i32),
    Unrecognized(String),
}

pub(crate) fn parse_poll(output: &str) -> PollStatus {
    match last_line(output) {
        None => PollStatus::NotFinished,
        Some("running") => PollStatus::Running,
        Some(line) => match line.parse::<i32>() {
            Ok(code) => PollStatus::Exited(code),
            Err(_) => PollStatus::Unrecognized(line.to_string()),
        },
    }
}
