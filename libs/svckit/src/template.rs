//! Liquid rendering for client shell pages and mail bodies.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render template {path:?}")]
    Render {
        path: PathBuf,
        #[source]
        source: liquid::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Render the template at `path` with `globals`.
pub fn render_file(path: &Path, globals: &liquid::Object) -> Result<String, TemplateError> {
    let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let render_err = |source| TemplateError::Render {
        path: path.to_path_buf(),
        source,
    };
    liquid::ParserBuilder::with_stdlib()
        .build()
        .map_err(render_err)?
        .parse(&source)
        .map_err(render_err)?
        .render(globals)
        .map_err(render_err)
}

/// Render `{sources_dir}/layout_{profile}.html` into `{public_dir}/layout.html`.
pub fn render_shell(
    sources_dir: &Path,
    public_dir: &Path,
    module_name: &str,
    profile: &str,
) -> Result<PathBuf, TemplateError> {
    let template = sources_dir.join(format!("layout_{profile}.html"));
    let globals = liquid::object!({
        "module_name": module_name,
        "profile": profile,
    });
    let html = render_file(&template, &globals)?;

    let target = public_dir.join("layout.html");
    let write_err = |source| TemplateError::Write {
        path: target.clone(),
        source,
    };
    std::fs::create_dir_all(public_dir).map_err(write_err)?;
    std::fs::write(&target, html).map_err(write_err)?;
    Ok(target)
}

/// Convert a JSON object into liquid globals; non-objects yield no globals.
pub fn json_globals(fields: &serde_json::Value) -> liquid::Object {
    match liquid::model::to_object(fields) {
        Ok(obj) => obj,
        Err(e) => {
            tracing::debug!(error = %e, "template fields are not an object");
            liquid::Object::new()
        }
    }
}
