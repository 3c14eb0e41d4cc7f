//! Remote filesystem layout shared with the executables running on compute nodes.
//!
//! ```text
//! <workdir>/model/<model-lowercased>/<file>
//! <workdir>/job/<job-lowercased>/<sequence>/<rendered config>
//! <workdir>/job/<job-lowercased>/<sequence>/pidfile
//! <workdir>/job/<job-lowercased>/<sequence>/exit-status
//! ```
//!
//! An empty working directory means paths are relative to the login directory.

/// Written by the launch command with the background process id.
pub const PID_FILE: &str = "pidfile";
/// Written by the launch command with the exit code once the process ends.
pub const EXIT_STATUS_FILE: &str = "exit-status";
/// Combined stdout/stderr of the launched executable.
pub const LOG_FILE: &str = "Log.txt";

/// Joins remote path segments with `/`, skipping empty ones.
pub fn remote_join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for part in parts {
        let part = part.as_ref();
        if part.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(part.trim_end_matches('/'));
            if out.is_empty() {
                out.push('/');
            }
            continue;
        }
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

pub fn model_dir(workdir: &str, model_name: &str) -> String {
    remote_join([workdir, "model", &model_name.to_lowercase()])
}

pub fn model_file(workdir: &str, model_name: &str, file: &str) -> String {
    remote_join([workdir, "model", &model_name.to_lowercase(), file])
}

pub fn job_dir(workdir: &str, job_name: &str, sequence: usize) -> String {
    remote_join([
        workdir,
        "job",
        &job_name.to_lowercase(),
        &sequence.to_string(),
    ])
}

/// Path of a model file as seen from inside an instance directory.
pub fn model_file_from_job_dir(model_name: &str, file: &str) -> String {
    format!("../../../model/{}/{}", model_name.to_lowercase(), file)
}
