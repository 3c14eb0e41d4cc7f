//! Per-instance rendering of configuration templates.
//!
//! Placeholders are written `{{.Name}}` (spaces inside the braces allowed) and
//! name one of `Input`, `Output`, `Seed` or `DeviceID`.

use std::fmt::Write as _;
use std::path::PathBuf;

use rand::Rng;
use simfleet_core::layout::model_file_from_job_dir;
use simfleet_core::{Model, Template};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TemplateError {
    #[error("read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown template placeholder `{0}`")]
    UnknownPlaceholder(String),
    #[error("unterminated template placeholder at byte {0}")]
    Unterminated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TemplateParams {
    /// Reference to the simulation input, relative to the instance directory.
    pub(crate) input: String,
    pub(crate) output: String,
    pub(crate) seed: u32,
    pub(crate) device_id: u32,
}

impl TemplateParams {
    pub(crate) fn for_instance(model: &Model, device_id: u32, seed: u32) -> Self {
        Self {
            input: resolve_input(model),
            output: output_file_name(seed),
            seed,
            device_id,
        }
    }
}

/// First `.tpr` or `.pdb` file of the model, as seen from the instance directory.
pub(crate) fn resolve_input(model: &Model) -> String {
    for file in &model.files {
        let extension = file
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "tpr" => {
                return format!(
                    "gromacstprfile {}",
                    model_file_from_job_dir(&model.name, file)
                );
            }
            "pdb" => return model_file_from_job_dir(&model.name, file),
            _ => {}
        }
    }
    String::new()
}

pub(crate) fn output_file_name(seed: u32) -> String {
    format!("sim.{seed}.dcd")
}

/// Fresh seed for one launch attempt.
pub(crate) fn draw_seed() -> u32 {
    rand::thread_rng().gen_range(0..=i32::MAX as u32)
}

pub(crate) fn render(source: &str, params: &TemplateParams) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len() + 64);
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let end = body
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        match body[..end].trim() {
            ".Input" => out.push_str(&params.input),
            ".Output" => out.push_str(&params.output),
            ".Seed" => {
                let _ = write!(out, "{}", params.seed);
            }
            ".DeviceID" => {
                let _ = write!(out, "{}", params.device_id);
            }
            other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
        }
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

pub(crate) async fn load_and_render(
    template: &Template,
    params: &TemplateParams,
) -> Result<String, TemplateError> {
    let source = tokio::fs::read_to_string(&template.file)
        .await
        .map_err(|source| TemplateError::Read {
            path: template.file.clone(),
            source,
        })?;
    render(&source, params)
}
